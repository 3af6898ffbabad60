//! Utilities for re-identification experiments: identity/camera scans over
//! image folders and ranked-match figures built from persisted distance
//! matrices.

pub mod artifacts;
pub mod pid_cams;
pub mod ranking;
pub mod render_matches;
