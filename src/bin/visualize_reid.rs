use clap::{Parser, ValueEnum};
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use bytesize::ByteSize;
use tracing::info;

use reid_tools::artifacts::ReidArtifacts;
use reid_tools::ranking::ScoreKind;
use reid_tools::render_matches::{LayoutChoice, VisualizeConfig, visualize, write_summary_json};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LayoutArg {
    Both,
    Horizontal,
    Vertical,
}

impl From<LayoutArg> for LayoutChoice {
    fn from(v: LayoutArg) -> Self {
        match v {
            LayoutArg::Both => LayoutChoice::Both,
            LayoutArg::Horizontal => LayoutChoice::Horizontal,
            LayoutArg::Vertical => LayoutChoice::Vertical,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScoreKindArg {
    Distance,
    Similarity,
}

impl From<ScoreKindArg> for ScoreKind {
    fn from(v: ScoreKindArg) -> Self {
        match v {
            ScoreKindArg::Distance => ScoreKind::Distance,
            ScoreKindArg::Similarity => ScoreKind::Similarity,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "visualize_reid",
    about = "Render a query image next to its top-K gallery matches from saved ReID artifacts",
    version
)]
struct Cli {
    /// Row of the distance matrix to visualise
    query_index: usize,

    /// Where to write the figure (the stacked copy gets a `_stacked` suffix)
    output_path: PathBuf,

    /// Directory holding distmat.npy, img_path_list.npy, num_query.npy [pids.npy camids.npy]
    #[arg(default_value = "./logs")]
    artifacts_dir: PathBuf,

    /// Ignore gallery images taken by the query's camera
    #[arg(long = "no-same-cam")]
    no_same_cam: bool,

    /// Number of gallery matches to show
    #[arg(long = "top-k", short = 'k')]
    top_k: Option<usize>,

    #[arg(long, value_enum)]
    layout: Option<LayoutArg>,

    /// Tile edge length in pixels
    #[arg(long = "tile-size")]
    tile_size: Option<u32>,

    /// Whether the matrix holds distances (lower is better) or similarities
    #[arg(long = "score-kind", value_enum)]
    score_kind: Option<ScoreKindArg>,

    /// Base directory for relative image paths in img_path_list.npy
    #[arg(long = "image-root")]
    image_root: Option<PathBuf>,

    /// TrueType font used for captions (default: bundled DejaVu Sans)
    #[arg(long)]
    font: Option<PathBuf>,

    /// JSON file with a full visualisation config; flags given here override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Also write the ranked matches as JSON
    #[arg(long = "summary-json")]
    summary_json: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(path: Option<&Path>) -> Result<VisualizeConfig, Box<dyn Error>> {
    let Some(path) = path else {
        return Ok(VisualizeConfig::default());
    };
    info!("Loading configuration from {}", path.display());
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn build_config(cli: &Cli) -> Result<VisualizeConfig, Box<dyn Error>> {
    let mut config = load_config(cli.config.as_deref())?;

    if cli.no_same_cam {
        config.ranking.exclude_same_camera = true;
    }
    if let Some(k) = cli.top_k {
        config.ranking.top_k = k;
    }
    if let Some(kind) = cli.score_kind {
        config.ranking.score_kind = kind.into();
    }
    if let Some(layout) = cli.layout {
        config.layout = layout.into();
    }
    if let Some(size) = cli.tile_size {
        config.render.tile_size = size;
    }
    if cli.image_root.is_some() {
        config.render.image_root = cli.image_root.clone();
    }
    if cli.font.is_some() {
        config.render.font_path = cli.font.clone();
    }

    if config.render.tile_size == 0 {
        return Err("tile size must be positive".into());
    }
    Ok(config)
}

fn size_of(path: &Path) -> String {
    fs::metadata(path)
        .map(|m| ByteSize::b(m.len()).to_string())
        .unwrap_or_else(|_| "?".to_string())
}

fn run(cli: &Cli) -> Result<(), Box<dyn Error>> {
    let config = build_config(cli)?;
    let artifacts = ReidArtifacts::load(&cli.artifacts_dir)?;
    let outcome = visualize(&artifacts, cli.query_index, &cli.output_path, &config)?;

    if let Some(path) = &cli.summary_json {
        write_summary_json(path, &outcome.ranked)?;
        println!("Wrote match summary to {}", path.display());
    }

    if !outcome.ranked.labels_known {
        println!("Note: pids/camids not available; match correctness is unknown (gray borders).");
    }

    let described: Vec<String> = outcome
        .written
        .iter()
        .map(|p| format!("{} ({})", p.display(), size_of(p)))
        .collect();
    match described.as_slice() {
        [one] => println!("Saved visualization to {one}"),
        [first, second] => println!("Saved visualizations to {first} and {second}"),
        many => println!("Saved visualizations to {}", many.join(", ")),
    }

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level_filter = cli
        .log_level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
