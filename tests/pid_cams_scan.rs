//! Directory scans over generated image folders. Files are empty: only the
//! names matter to the scanner.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::process::Command;

use reid_tools::pid_cams::{PidCamMap, ScanConfig, ScanError, cameras_for, scan};
use tempfile::TempDir;

fn touch_all(dir: &Path, names: &[&str]) {
    for name in names {
        fs::write(dir.join(name), b"").expect("create fixture file");
    }
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn groups_cameras_by_identity_and_ignores_garbage() {
    let dir = TempDir::new().expect("tempdir");
    touch_all(
        dir.path(),
        &[
            "0002_c002_00030600_0.jpg",
            "0002_c003_00030601_0.jpg",
            "garbage.jpg",
        ],
    );

    let report = scan(dir.path(), &ScanConfig::default()).expect("scan");

    let mut expected = PidCamMap::new();
    expected.insert("0002".to_string(), set(&["002", "003"]));
    assert_eq!(report.pid_cams, expected);
    assert_eq!(report.considered, 3);
    assert_eq!(report.matched, 2);
    assert_eq!(report.skipped, 1);
}

#[test]
fn other_extensions_are_ignored() {
    let dir = TempDir::new().expect("tempdir");
    touch_all(
        dir.path(),
        &["0001_c001_a.png", "0001_c004_b.txt", "0001_c002_c.JPG", "notes"],
    );
    fs::create_dir(dir.path().join("0009_c009_dir.jpg")).expect("subdir");

    let report = scan(dir.path(), &ScanConfig::default()).expect("scan");
    assert_eq!(cameras_for(&report.pid_cams, "0001"), vec!["002".to_string()]);
    assert!(!report.pid_cams.contains_key("0009"));
    assert_eq!(report.considered, 1);

    let png = ScanConfig {
        extensions: vec!["png".to_string(), "jpg".to_string()],
        ..ScanConfig::default()
    };
    let report = scan(dir.path(), &png).expect("scan");
    assert_eq!(cameras_for(&report.pid_cams, "0001"), vec!["001", "002"]);
}

#[test]
fn result_does_not_depend_on_creation_order() {
    let names = [
        "0003_c001_1.jpg",
        "0001_c005_1.jpg",
        "0003_c002_1.jpg",
        "bad_name.jpg",
        "0001_c005_2.jpg",
        "0010_c001_1.jpg",
    ];
    let mut reversed = names;
    reversed.reverse();

    let a = TempDir::new().expect("tempdir");
    let b = TempDir::new().expect("tempdir");
    touch_all(a.path(), &names);
    touch_all(b.path(), &reversed);

    let ra = scan(a.path(), &ScanConfig::default()).expect("scan a");
    let rb = scan(b.path(), &ScanConfig::default()).expect("scan b");
    assert_eq!(ra, rb);
    assert_eq!(ra.pid_cams.len(), 3);
    assert_eq!(ra.pid_cams["0001"], set(&["005"]));
}

#[test]
fn empty_directory_gives_empty_map() {
    let dir = TempDir::new().expect("tempdir");
    let report = scan(dir.path(), &ScanConfig::default()).expect("scan");
    assert!(report.pid_cams.is_empty());
    assert_eq!(report.considered, 0);
}

#[test]
fn missing_directory_is_not_found() {
    let dir = TempDir::new().expect("tempdir");
    let missing = dir.path().join("image_query");
    let err = scan(&missing, &ScanConfig::default()).expect_err("missing dir");
    assert!(matches!(err, ScanError::NotFound { .. }));
    assert!(err.to_string().contains("image_query"));
}

#[test]
fn file_path_is_not_a_directory() {
    let dir = TempDir::new().expect("tempdir");
    touch_all(dir.path(), &["0002_c002_0.jpg"]);
    let err = scan(&dir.path().join("0002_c002_0.jpg"), &ScanConfig::default())
        .expect_err("file instead of dir");
    assert!(matches!(err, ScanError::NotADirectory { .. }));
}

#[cfg(unix)]
#[test]
fn path_through_a_file_is_an_io_error() {
    let dir = TempDir::new().expect("tempdir");
    touch_all(dir.path(), &["0002_c002_0.jpg"]);
    let err = scan(&dir.path().join("0002_c002_0.jpg").join("sub"), &ScanConfig::default())
        .expect_err("path below a file");
    assert!(matches!(err, ScanError::Io { .. }), "{err}");
}

#[test]
fn strict_mode_rejects_malformed_names() {
    let dir = TempDir::new().expect("tempdir");
    touch_all(dir.path(), &["0002_c002_0.jpg", "zzz.jpg"]);
    let strict = ScanConfig {
        strict: true,
        ..ScanConfig::default()
    };

    let err = scan(dir.path(), &strict).expect_err("strict");
    match err {
        ScanError::MalformedFilename { path } => {
            assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("zzz.jpg"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn cli_prints_spot_check_for_requested_pid() {
    let query = TempDir::new().expect("tempdir");
    let gallery = TempDir::new().expect("tempdir");
    touch_all(
        query.path(),
        &["0002_c002_00030600_0.jpg", "0002_c003_00030601_0.jpg", "garbage.jpg"],
    );
    touch_all(gallery.path(), &["0002_c011_1.jpg", "0005_c001_1.jpg"]);

    let out = Command::new(env!("CARGO_BIN_EXE_pid_cams"))
        .arg("--query-dir")
        .arg(query.path())
        .arg("--gallery-dir")
        .arg(gallery.path())
        .arg("--all")
        .output()
        .expect("run pid_cams");
    assert!(out.status.success());

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Query cameras for PID 0002: ['002', '003']"), "{stdout}");
    assert!(stdout.contains("Gallery cameras for PID 0002: ['011']"), "{stdout}");
    assert!(stdout.contains("PID 0005 - Query cams: [], Gallery cams: ['001']"), "{stdout}");
}

#[test]
fn cli_accepts_dotted_extension() {
    let query = TempDir::new().expect("tempdir");
    let gallery = TempDir::new().expect("tempdir");
    touch_all(query.path(), &["0002_c004_1.png", "0002_c005_1.jpg"]);

    let out = Command::new(env!("CARGO_BIN_EXE_pid_cams"))
        .arg("--query-dir")
        .arg(query.path())
        .arg("--gallery-dir")
        .arg(gallery.path())
        .args(["--ext", ".png"])
        .output()
        .expect("run pid_cams");
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Query cameras for PID 0002: ['004']"), "{stdout}");
}

#[test]
fn cli_fails_on_missing_directory() {
    let dir = TempDir::new().expect("tempdir");
    let out = Command::new(env!("CARGO_BIN_EXE_pid_cams"))
        .arg("--query-dir")
        .arg(dir.path().join("nope"))
        .arg("--gallery-dir")
        .arg(dir.path())
        .output()
        .expect("run pid_cams");
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("nope"));
}
