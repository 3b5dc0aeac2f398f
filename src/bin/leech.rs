//! `leech`: a command-line BitTorrent downloader.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use leech::{Conf, Engine};

/// Download a single torrent's files to a local directory.
#[derive(Parser, Debug)]
#[command(name = "leech", version, about)]
struct Args {
    /// Path to the .torrent metainfo file.
    torrent_file: PathBuf,

    /// Directory to download the torrent's files into.
    #[arg(long, default_value = ".")]
    download_dir: PathBuf,

    /// Log verbosity: one of error, warn, info, debug, trace.
    #[arg(long, default_value = "info")]
    verbosity: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&args.verbosity),
    )
    .init();

    let conf = Conf::new(args.download_dir);
    let engine = Engine::new(conf);

    match engine.run(&args.torrent_file).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
