//! Renders a query image next to its ranked gallery matches.
//!
//! Tiles are composed with `image`, borders drawn with `imageproc` and
//! captions written through a `plotters` bitmap backend over the same
//! RGB buffer.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};

use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgb, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use plotters::prelude::*;
use plotters::style::FontStyle;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifacts::{ArtifactError, QueryView, ReidArtifacts};
use crate::ranking::{GalleryMatch, RankedMatches, RankingConfig, ScoreKind, build_matches};

const TILE_SIZE: u32 = 256;
const BORDER_WIDTH: u32 = 6;
const CAPTION_HEIGHT: u32 = 54;
const PADDING: u32 = 8;
const FONT_SIZE: f64 = 14.0;
const CAPTION_FONT: &str = "reid-caption";
const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);

/// DejaVu Sans, used whenever no usable `font_path` is configured.
const BUNDLED_FONT: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("failed to load image {}: {source}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to save {}: {source}", path.display())]
    Save {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode summary: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum VisualizeError {
    #[error(transparent)]
    Artifacts(#[from] ArtifactError),

    #[error(transparent)]
    Render(#[from] RenderError),
}

/// Arrangement of tiles in one figure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Query and matches side by side in one row.
    Horizontal,
    /// One tile per row.
    Vertical,
}

/// Which figures [`visualize`] writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutChoice {
    Horizontal,
    Vertical,
    /// Horizontal at the output path plus a vertical copy at [`stacked_path`].
    #[default]
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Edge length of each square tile in pixels.
    pub tile_size: u32,
    pub border_width: u32,
    /// Space reserved above each tile for its caption.
    pub caption_height: u32,
    pub padding: u32,
    pub font_size: f64,
    /// TrueType font for captions; the bundled DejaVu Sans is used when unset or unreadable.
    pub font_path: Option<PathBuf>,
    /// Base directory for relative image paths.
    pub image_root: Option<PathBuf>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            tile_size: TILE_SIZE,
            border_width: BORDER_WIDTH,
            caption_height: CAPTION_HEIGHT,
            padding: PADDING,
            font_size: FONT_SIZE,
            font_path: None,
            image_root: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizeConfig {
    pub ranking: RankingConfig,
    pub render: RenderConfig,
    pub layout: LayoutChoice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorderColor {
    /// Query tile.
    Black,
    /// Same identity as the query.
    Green,
    /// Wrong identity seen by the query's camera.
    Yellow,
    /// Wrong identity, other camera.
    Red,
    /// Labels unknown.
    Gray,
}

impl BorderColor {
    pub fn rgb(self) -> Rgb<u8> {
        match self {
            BorderColor::Black => Rgb([0, 0, 0]),
            BorderColor::Green => Rgb([0, 128, 0]),
            BorderColor::Yellow => Rgb([255, 215, 0]),
            BorderColor::Red => Rgb([220, 0, 0]),
            BorderColor::Gray => Rgb([128, 128, 128]),
        }
    }
}

/// Correct matches are green even when they share the query's camera.
pub fn border_for(m: &GalleryMatch) -> BorderColor {
    match (m.correct, m.same_cam) {
        (Some(true), _) => BorderColor::Green,
        (_, Some(true)) => BorderColor::Yellow,
        (Some(false), _) => BorderColor::Red,
        (None, _) => BorderColor::Gray,
    }
}

fn or_unknown(v: Option<&str>) -> &str {
    v.unwrap_or("?")
}

pub fn query_label(q: &QueryView) -> Vec<String> {
    vec![
        "QUERY".to_string(),
        format!(
            "pid={} cam={}",
            or_unknown(q.pid.as_deref()),
            or_unknown(q.camid.as_deref())
        ),
    ]
}

pub fn tile_label(m: &GalleryMatch, kind: ScoreKind) -> Vec<String> {
    vec![
        format!("Rank {}", m.rank),
        format!(
            "pid={} cam={}",
            or_unknown(m.pid.as_deref()),
            or_unknown(m.camid.as_deref())
        ),
        format!("{}: {:.2}", kind.label(), m.score),
    ]
}

/// `out/q.png` becomes `out/q_stacked.png`; names without an extension get the suffix appended.
pub fn stacked_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut name = format!("{stem}_stacked");
    if let Some(ext) = path.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    path.with_file_name(name)
}

fn cell_size(config: &RenderConfig) -> (u32, u32) {
    (
        config.tile_size + 2 * config.padding,
        config.caption_height + config.tile_size + 2 * config.padding,
    )
}

/// Canvas size for `tiles` tiles.
pub fn figure_size(tiles: u32, layout: Layout, config: &RenderConfig) -> (u32, u32) {
    let (cw, ch) = cell_size(config);
    match layout {
        Layout::Horizontal => (cw * tiles, ch),
        Layout::Vertical => (cw, ch * tiles),
    }
}

/// Top-left corner of tile `i`'s image; its caption sits directly above.
pub fn tile_origin(i: u32, layout: Layout, config: &RenderConfig) -> (u32, u32) {
    let (cw, ch) = cell_size(config);
    let (col, row) = match layout {
        Layout::Horizontal => (i, 0),
        Layout::Vertical => (0, i),
    };
    (
        col * cw + config.padding,
        row * ch + config.padding + config.caption_height,
    )
}

/// A decoded, resized image with its decoration.
#[derive(Debug, Clone)]
pub struct Tile {
    pub image: RgbImage,
    pub border: BorderColor,
    pub caption: Vec<String>,
}

fn resolve(path: &str, config: &RenderConfig) -> PathBuf {
    let p = PathBuf::from(path);
    match &config.image_root {
        Some(root) if p.is_relative() => root.join(p),
        _ => p,
    }
}

fn load_tile_image(path: &Path, size: u32) -> Result<RgbImage, RenderError> {
    let img = image::open(path).map_err(|source| RenderError::Load {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(img.resize_exact(size, size, FilterType::Triangle).to_rgb8())
}

/// Decodes the query and every match up front so a bad image fails before anything is drawn.
pub fn load_tiles(ranked: &RankedMatches, config: &RenderConfig) -> Result<Vec<Tile>, RenderError> {
    let mut tiles = Vec::with_capacity(ranked.matches.len() + 1);
    tiles.push(Tile {
        image: load_tile_image(&resolve(&ranked.query.img_path, config), config.tile_size)?,
        border: BorderColor::Black,
        caption: query_label(&ranked.query),
    });
    for m in &ranked.matches {
        tiles.push(Tile {
            image: load_tile_image(&resolve(&m.img_path, config), config.tile_size)?,
            border: border_for(m),
            caption: tile_label(m, ranked.score_kind),
        });
    }
    Ok(tiles)
}

fn draw_border(canvas: &mut RgbImage, x: u32, y: u32, config: &RenderConfig, color: Rgb<u8>) {
    let size = config.tile_size;
    let bw = config.border_width.min(size / 2);
    if bw == 0 {
        return;
    }
    let (xi, yi) = (x as i32, y as i32);
    let far = (size - bw) as i32;
    for rect in [
        Rect::at(xi, yi).of_size(size, bw),
        Rect::at(xi, yi + far).of_size(size, bw),
        Rect::at(xi, yi).of_size(bw, size),
        Rect::at(xi + far, yi).of_size(bw, size),
    ] {
        draw_filled_rect_mut(canvas, rect, color);
    }
}

fn bundled_family() -> Option<String> {
    static READY: OnceLock<bool> = OnceLock::new();
    let ok = *READY.get_or_init(|| {
        plotters::style::register_font(CAPTION_FONT, FontStyle::Normal, BUNDLED_FONT).is_ok()
    });
    ok.then(|| CAPTION_FONT.to_string())
}

/// Registers the font at `path` under its own family name, once per path.
fn user_font_family(path: &Path) -> Option<String> {
    static REGISTERED: OnceLock<Mutex<HashMap<PathBuf, Option<String>>>> = OnceLock::new();
    let mut registered = REGISTERED
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(family) = registered.get(path) {
        return family.clone();
    }

    let family = match fs::read(path) {
        Ok(bytes) => {
            let family = format!("{CAPTION_FONT}-{}", registered.len() + 1);
            let bytes: &'static [u8] = Box::leak(bytes.into_boxed_slice());
            match plotters::style::register_font(&family, FontStyle::Normal, bytes) {
                Ok(()) => {
                    debug!("caption font {} registered as {family}", path.display());
                    Some(family)
                }
                Err(_) => None,
            }
        }
        Err(e) => {
            debug!("cannot read font {}: {e}", path.display());
            None
        }
    };
    registered.insert(path.to_path_buf(), family.clone());
    family
}

/// Font family for caption text: `font_path` when it loads, else the bundled font.
///
/// Each distinct `font_path` keeps its own registration, so later calls with
/// another path pick up that font.
fn caption_family(config: &RenderConfig) -> Option<String> {
    if let Some(path) = &config.font_path {
        if let Some(family) = user_font_family(path) {
            return Some(family);
        }
        warn!("font {} is not usable; captions use DejaVu Sans", path.display());
    }
    bundled_family()
}

fn draw_captions(
    canvas: RgbImage,
    tiles: &[Tile],
    layout: Layout,
    config: &RenderConfig,
    family: &str,
) -> Result<RgbImage, String> {
    let (width, height) = canvas.dimensions();
    let mut rgb = canvas.into_raw();

    {
        let root = BitMapBackend::with_buffer(&mut rgb, (width, height)).into_drawing_area();
        let style = (family, config.font_size).into_font().color(&BLACK);
        let line_height = (config.font_size * 1.2).ceil() as u32;

        for (i, tile) in tiles.iter().enumerate() {
            let (x, y) = tile_origin(i as u32, layout, config);
            let top = y - config.caption_height;
            for (li, line) in tile.caption.iter().enumerate() {
                let ly = top + li as u32 * line_height;
                root.draw(&Text::new(line.as_str(), (x as i32, ly as i32), style.clone()))
                    .map_err(|e| e.to_string())?;
            }
        }

        root.present().map_err(|e| e.to_string())?;
    }

    RgbImage::from_raw(width, height, rgb).ok_or_else(|| "caption buffer size changed".to_string())
}

/// Lays out already-loaded tiles on a white canvas.
pub fn compose_tiles(tiles: &[Tile], layout: Layout, config: &RenderConfig) -> RgbImage {
    let (width, height) = figure_size(tiles.len() as u32, layout, config);
    let mut canvas = RgbImage::from_pixel(width, height, BACKGROUND);

    for (i, tile) in tiles.iter().enumerate() {
        let (x, y) = tile_origin(i as u32, layout, config);
        imageops::replace(&mut canvas, &tile.image, x as i64, y as i64);
        draw_border(&mut canvas, x, y, config, tile.border.rgb());
    }

    let Some(family) = caption_family(config) else {
        warn!("caption font could not be registered; figure has no captions");
        return canvas;
    };
    let fallback = canvas.clone();
    match draw_captions(canvas, tiles, layout, config, &family) {
        Ok(c) => c,
        Err(e) => {
            warn!("caption drawing failed, keeping figure without captions: {e}");
            fallback
        }
    }
}

pub fn compose_figure(
    ranked: &RankedMatches,
    layout: Layout,
    config: &RenderConfig,
) -> Result<RgbImage, RenderError> {
    let tiles = load_tiles(ranked, config)?;
    Ok(compose_tiles(&tiles, layout, config))
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Saves with the format implied by the extension, PNG when there is none.
pub fn save_figure(figure: &RgbImage, path: &Path) -> Result<(), RenderError> {
    ensure_parent(path)?;
    let format = ImageFormat::from_path(path).unwrap_or(ImageFormat::Png);
    figure
        .save_with_format(path, format)
        .map_err(|source| RenderError::Save {
            path: path.to_path_buf(),
            source,
        })
}

pub fn write_summary_json(path: &Path, ranked: &RankedMatches) -> Result<(), RenderError> {
    ensure_parent(path)?;
    fs::write(path, serde_json::to_string_pretty(ranked)?)?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct VisualizeOutcome {
    pub written: Vec<PathBuf>,
    pub ranked: RankedMatches,
}

/// Ranks the gallery for `query_index` and writes the requested figure(s).
///
/// Every figure is composed before the first file is written.
pub fn visualize(
    artifacts: &ReidArtifacts,
    query_index: usize,
    output: &Path,
    config: &VisualizeConfig,
) -> Result<VisualizeOutcome, VisualizeError> {
    let ranked = build_matches(artifacts, query_index, &config.ranking)?;
    if ranked.matches.is_empty() {
        warn!("no gallery candidates for query {query_index}; figure shows the query only");
    }

    let targets = match config.layout {
        LayoutChoice::Horizontal => vec![(Layout::Horizontal, output.to_path_buf())],
        LayoutChoice::Vertical => vec![(Layout::Vertical, output.to_path_buf())],
        LayoutChoice::Both => vec![
            (Layout::Horizontal, output.to_path_buf()),
            (Layout::Vertical, stacked_path(output)),
        ],
    };

    let tiles = load_tiles(&ranked, &config.render)?;
    let figures: Vec<(RgbImage, PathBuf)> = targets
        .into_iter()
        .map(|(layout, path)| (compose_tiles(&tiles, layout, &config.render), path))
        .collect();

    let mut written = Vec::with_capacity(figures.len());
    for (figure, path) in figures {
        save_figure(&figure, &path)?;
        info!(
            "wrote {} ({}x{})",
            path.display(),
            figure.width(),
            figure.height()
        );
        written.push(path);
    }

    Ok(VisualizeOutcome { written, ranked })
}
