//! Loading of the arrays an inference run leaves behind: the query×gallery
//! distance matrix, the image path list, the query count and optionally the
//! per-image identity and camera labels.

pub mod npy;

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use ndarray::{Array2, ArrayD, ArrayView1};
use ndarray_npy::ReadNpyExt;
use serde::Serialize;
use tracing::{info, warn};

pub use npy::{NpyStrError, read_string_npy, write_string_npy};

pub const DISTMAT_FILE: &str = "distmat.npy";
pub const IMG_PATH_LIST_FILE: &str = "img_path_list.npy";
pub const NUM_QUERY_FILE: &str = "num_query.npy";
pub const PIDS_FILE: &str = "pids.npy";
pub const CAMIDS_FILE: &str = "camids.npy";

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("missing {} in {}; run inference first", missing.join(", "), dir.display())]
    MissingArtifacts { dir: PathBuf, missing: Vec<String> },

    #[error("query index {index} out of range ({num_query} queries)")]
    QueryOutOfRange { index: usize, num_query: usize },

    #[error("inconsistent artifacts: {0}")]
    Shape(String),

    #[error("NPY read error at {}: {message}", path.display())]
    Npy { path: PathBuf, message: String },

    #[error("failed to open {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ArtifactError {
    fn npy(path: &Path, message: impl ToString) -> Self {
        ArtifactError::Npy {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }
}

/// Locations of the artifact files inside one directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub dir: PathBuf,
    pub distmat: PathBuf,
    pub img_path_list: PathBuf,
    pub num_query: PathBuf,
    pub pids: PathBuf,
    pub camids: PathBuf,
}

impl ArtifactPaths {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            dir: dir.to_path_buf(),
            distmat: dir.join(DISTMAT_FILE),
            img_path_list: dir.join(IMG_PATH_LIST_FILE),
            num_query: dir.join(NUM_QUERY_FILE),
            pids: dir.join(PIDS_FILE),
            camids: dir.join(CAMIDS_FILE),
        }
    }

    /// File names of required artifacts that do not exist.
    pub fn missing_required(&self) -> Vec<String> {
        [
            (DISTMAT_FILE, &self.distmat),
            (IMG_PATH_LIST_FILE, &self.img_path_list),
            (NUM_QUERY_FILE, &self.num_query),
        ]
        .into_iter()
        .filter(|(_, path)| !path.is_file())
        .map(|(name, _)| name.to_string())
        .collect()
    }

    pub fn has_labels(&self) -> bool {
        self.pids.is_file() && self.camids.is_file()
    }
}

/// Identity and camera code of every image, aligned with the path list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels {
    pub pids: Vec<String>,
    pub camids: Vec<String>,
}

/// The selected query with whatever labels are known for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryView {
    pub index: usize,
    pub img_path: String,
    pub pid: Option<String>,
    pub camid: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReidArtifacts {
    /// Rows are queries, columns are gallery items.
    pub distmat: Array2<f64>,
    /// Query paths first, then gallery paths.
    pub img_paths: Vec<String>,
    pub num_query: usize,
    /// `None` when `pids.npy`/`camids.npy` were not saved.
    pub labels: Option<Labels>,
}

impl ReidArtifacts {
    /// Loads every artifact from `dir`.
    ///
    /// The required files are checked up front so a missing one is reported
    /// before anything is read.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, ArtifactError> {
        let paths = ArtifactPaths::in_dir(dir);
        let missing = paths.missing_required();
        if !missing.is_empty() {
            return Err(ArtifactError::MissingArtifacts {
                dir: paths.dir,
                missing,
            });
        }

        let distmat = read_float_matrix(&paths.distmat)?;
        let img_paths = read_strings(&paths.img_path_list)?;
        let num_query = read_num_query(&paths.num_query)?;

        let labels = if paths.has_labels() {
            Some(Labels {
                pids: read_labels(&paths.pids)?,
                camids: read_labels(&paths.camids)?,
            })
        } else {
            warn!(
                "{} / {} not found in {}: identity and camera labels unknown, match correctness will not be shown",
                PIDS_FILE,
                CAMIDS_FILE,
                paths.dir.display()
            );
            None
        };

        let artifacts = Self::new(distmat, img_paths, num_query, labels)?;
        info!(
            "loaded artifacts from {}: {} queries, {} gallery images",
            paths.dir.display(),
            artifacts.num_query,
            artifacts.gallery_len()
        );
        Ok(artifacts)
    }

    /// Builds artifacts from in-memory arrays, checking that they line up.
    pub fn new(
        distmat: Array2<f64>,
        img_paths: Vec<String>,
        num_query: usize,
        labels: Option<Labels>,
    ) -> Result<Self, ArtifactError> {
        if num_query > img_paths.len() {
            return Err(ArtifactError::Shape(format!(
                "num_query {num_query} exceeds {} image paths",
                img_paths.len()
            )));
        }
        let num_gallery = img_paths.len() - num_query;
        if distmat.dim() != (num_query, num_gallery) {
            return Err(ArtifactError::Shape(format!(
                "distmat is {:?}, expected ({num_query}, {num_gallery})",
                distmat.dim()
            )));
        }
        if let Some(l) = &labels {
            if l.pids.len() != img_paths.len() || l.camids.len() != img_paths.len() {
                return Err(ArtifactError::Shape(format!(
                    "{} pids and {} camids for {} image paths",
                    l.pids.len(),
                    l.camids.len(),
                    img_paths.len()
                )));
            }
        }

        Ok(Self {
            distmat,
            img_paths,
            num_query,
            labels,
        })
    }

    pub fn gallery_len(&self) -> usize {
        self.img_paths.len() - self.num_query
    }

    pub fn query(&self, index: usize) -> Result<QueryView, ArtifactError> {
        self.check_query(index)?;
        Ok(QueryView {
            index,
            img_path: self.img_paths[index].clone(),
            pid: self.labels.as_ref().map(|l| l.pids[index].clone()),
            camid: self.labels.as_ref().map(|l| l.camids[index].clone()),
        })
    }

    pub fn distance_row(&self, index: usize) -> Result<ArrayView1<'_, f64>, ArtifactError> {
        self.check_query(index)?;
        Ok(self.distmat.row(index))
    }

    pub fn gallery_path(&self, i: usize) -> &str {
        &self.img_paths[self.num_query + i]
    }

    pub fn gallery_pid(&self, i: usize) -> Option<&str> {
        self.labels
            .as_ref()
            .map(|l| l.pids[self.num_query + i].as_str())
    }

    pub fn gallery_camid(&self, i: usize) -> Option<&str> {
        self.labels
            .as_ref()
            .map(|l| l.camids[self.num_query + i].as_str())
    }

    /// Camera codes of the gallery segment, when labels are known.
    pub fn gallery_camids(&self) -> Option<&[String]> {
        self.labels.as_ref().map(|l| &l.camids[self.num_query..])
    }

    fn check_query(&self, index: usize) -> Result<(), ArtifactError> {
        if index >= self.num_query {
            return Err(ArtifactError::QueryOutOfRange {
                index,
                num_query: self.num_query,
            });
        }
        Ok(())
    }
}

fn open(path: &Path) -> Result<BufReader<File>, ArtifactError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| ArtifactError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Reads a 2-D float matrix saved as `<f8` or `<f4`.
fn read_float_matrix(path: &Path) -> Result<Array2<f64>, ArtifactError> {
    match Array2::<f64>::read_npy(open(path)?) {
        Ok(m) => Ok(m),
        Err(first) => Array2::<f32>::read_npy(open(path)?)
            .map(|m| m.mapv(f64::from))
            .map_err(|_| ArtifactError::npy(path, first)),
    }
}

/// Reads an integer array saved as `<i8` or `<i4`, flattened in logical order.
/// Zero-dimensional scalars come back as a single element.
fn read_ints(path: &Path) -> Result<Vec<i64>, ArtifactError> {
    match ArrayD::<i64>::read_npy(open(path)?) {
        Ok(a) => Ok(a.iter().copied().collect()),
        Err(first) => ArrayD::<i32>::read_npy(open(path)?)
            .map(|a| a.iter().copied().map(i64::from).collect())
            .map_err(|_| ArtifactError::npy(path, first)),
    }
}

fn read_strings(path: &Path) -> Result<Vec<String>, ArtifactError> {
    read_string_npy(open(path)?).map_err(|e| ArtifactError::npy(path, e))
}

fn read_num_query(path: &Path) -> Result<usize, ArtifactError> {
    let values = read_ints(path)?;
    let first = values
        .first()
        .copied()
        .ok_or_else(|| ArtifactError::Shape(format!("{} is empty", path.display())))?;
    usize::try_from(first)
        .map_err(|_| ArtifactError::Shape(format!("negative num_query {first} in {}", path.display())))
}

/// Identity/camera codes may be saved as integers or as strings; both become strings.
fn read_labels(path: &Path) -> Result<Vec<String>, ArtifactError> {
    let int_message = match read_ints(path) {
        Ok(ints) => return Ok(ints.iter().map(i64::to_string).collect()),
        Err(ArtifactError::Npy { message, .. }) => message,
        Err(other) => return Err(other),
    };
    read_string_npy(open(path)?).map_err(|str_err| {
        ArtifactError::npy(
            path,
            format!("not an integer array ({int_message}) nor a string array ({str_err})"),
        )
    })
}
