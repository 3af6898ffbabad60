use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Identity code mapped to every camera code observed for it.
pub type PidCamMap = BTreeMap<String, BTreeSet<String>>;

/// Settings for [`scan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Extensions considered image files, with or without the leading dot.
    /// Compared ignoring ASCII case.
    pub extensions: Vec<String>,
    /// Fail on the first file name that does not carry an identity/camera prefix.
    pub strict: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            extensions: vec!["jpg".to_string()],
            strict: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("directory not found: {}", dir.display())]
    NotFound { dir: PathBuf },

    #[error("not a directory: {}", dir.display())]
    NotADirectory { dir: PathBuf },

    #[error("file name has no <pid>_c<camid>_ prefix: {}", path.display())]
    MalformedFilename { path: PathBuf },

    #[error("failed to read {}: {source}", dir.display())]
    Io {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Outcome of scanning one directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub pid_cams: PidCamMap,
    /// Files with a recognised image extension.
    pub considered: usize,
    pub matched: usize,
    /// Image files whose names did not parse (lenient mode only).
    pub skipped: usize,
}

/// Extracts `(pid, camid)` from names like `0002_c002_00030600_0.jpg`.
///
/// The prefix must sit at the start of the name: one or more ASCII digits,
/// `_c`, one or more ASCII digits, then `_`.
pub fn parse_pid_cam(file_name: &str) -> Option<(String, String)> {
    let pid_len = leading_digits(file_name);
    if pid_len == 0 {
        return None;
    }
    let (pid, rest) = file_name.split_at(pid_len);
    let rest = rest.strip_prefix("_c")?;

    let cam_len = leading_digits(rest);
    if cam_len == 0 {
        return None;
    }
    let (camid, rest) = rest.split_at(cam_len);
    rest.starts_with('_')
        .then(|| (pid.to_string(), camid.to_string()))
}

fn leading_digits(s: &str) -> usize {
    s.bytes().take_while(u8::is_ascii_digit).count()
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(OsStr::to_str) else {
        return false;
    };
    extensions
        .iter()
        .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(ext))
}

/// Scans `dir` (non-recursively) and collects the camera set of every identity.
///
/// Entries are visited in sorted order so strict-mode failures are
/// reproducible; the resulting map does not depend on listing order.
pub fn scan(dir: &Path, config: &ScanConfig) -> Result<ScanReport, ScanError> {
    let io_err = |source: io::Error| ScanError::Io {
        dir: dir.to_path_buf(),
        source,
    };

    let meta = fs::metadata(dir).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ScanError::NotFound {
            dir: dir.to_path_buf(),
        },
        _ => io_err(e),
    })?;
    if !meta.is_dir() {
        return Err(ScanError::NotADirectory {
            dir: dir.to_path_buf(),
        });
    }

    let mut files: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_file() && has_extension(&path, &config.extensions) {
            files.push(path);
        }
    }
    files.sort();

    let mut report = ScanReport {
        considered: files.len(),
        ..ScanReport::default()
    };

    for path in files {
        let parsed = path
            .file_name()
            .and_then(OsStr::to_str)
            .and_then(parse_pid_cam);

        match parsed {
            Some((pid, camid)) => {
                report.pid_cams.entry(pid).or_default().insert(camid);
                report.matched += 1;
            }
            None if config.strict => return Err(ScanError::MalformedFilename { path }),
            None => {
                debug!("skipping {}: no pid/camid prefix", path.display());
                report.skipped += 1;
            }
        }
    }

    if report.skipped > 0 {
        warn!(
            "{}: skipped {} of {} image files with unparseable names",
            dir.display(),
            report.skipped,
            report.considered
        );
    }

    Ok(report)
}

/// Sorted camera codes recorded for `pid`; empty when the identity is absent.
pub fn cameras_for(map: &PidCamMap, pid: &str) -> Vec<String> {
    map.get(pid)
        .map(|cams| cams.iter().cloned().collect())
        .unwrap_or_default()
}

fn format_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|s| format!("'{s}'")).collect();
    format!("[{}]", quoted.join(", "))
}

pub fn format_spot_check(query: &PidCamMap, gallery: &PidCamMap, pid: &str) -> Vec<String> {
    vec![
        format!(
            "Query cameras for PID {pid}: {}",
            format_list(&cameras_for(query, pid))
        ),
        format!(
            "Gallery cameras for PID {pid}: {}",
            format_list(&cameras_for(gallery, pid))
        ),
    ]
}

/// One line per identity found in either map, in identity order.
pub fn format_full_dump(query: &PidCamMap, gallery: &PidCamMap) -> Vec<String> {
    let pids: BTreeSet<&String> = query.keys().chain(gallery.keys()).collect();
    pids.into_iter()
        .map(|pid| {
            format!(
                "PID {pid} - Query cams: {}, Gallery cams: {}",
                format_list(&cameras_for(query, pid)),
                format_list(&cameras_for(gallery, pid))
            )
        })
        .collect()
}
