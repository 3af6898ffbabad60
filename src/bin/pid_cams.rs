use clap::Parser;
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

use reid_tools::pid_cams::{ScanConfig, format_full_dump, format_spot_check, scan};

#[derive(Parser, Debug)]
#[command(
    name = "pid_cams",
    about = "List which cameras observed each identity in a query and a gallery image folder",
    version
)]
struct Cli {
    /// Folder of query images named <pid>_c<camid>_*.jpg
    #[arg(long = "query-dir", default_value = "data/VeRi/image_query")]
    query_dir: PathBuf,

    /// Folder of gallery images named <pid>_c<camid>_*.jpg
    #[arg(long = "gallery-dir", default_value = "data/VeRi/image_test")]
    gallery_dir: PathBuf,

    /// Identity to report
    #[arg(long, default_value = "0002")]
    pid: String,

    /// Print the camera sets of every identity
    #[arg(long, short = 'a')]
    all: bool,

    /// Fail on image files whose names carry no pid/camid prefix
    #[arg(long)]
    strict: bool,

    /// Image extension to scan, e.g. jpg or .jpg (repeatable)
    #[arg(long = "ext", default_values_t = [String::from("jpg")])]
    extensions: Vec<String>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

fn run(cli: &Cli) -> Result<(), Box<dyn Error>> {
    let config = ScanConfig {
        extensions: cli.extensions.clone(),
        strict: cli.strict,
    };

    println!("Scanning query set...");
    let query = scan(&cli.query_dir, &config)?;
    println!("Scanning gallery set...");
    let gallery = scan(&cli.gallery_dir, &config)?;

    for line in format_spot_check(&query.pid_cams, &gallery.pid_cams, &cli.pid) {
        println!("{line}");
    }

    if cli.all {
        for line in format_full_dump(&query.pid_cams, &gallery.pid_cams) {
            println!("{line}");
        }
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
