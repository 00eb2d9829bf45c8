//! Command line entry point: parses arguments, sets up logging, and drives
//! a single torrent download/seed session to completion.

use std::{path::PathBuf, process::exit};

use clap::Parser;

use bittorrent_core::{engine, Conf};

#[derive(Parser, Debug)]
#[clap(name = "bittorrent", about = "A BitTorrent leecher/seeder")]
struct Args {
    /// Path to the .torrent metainfo file to download or seed.
    torrent_file: PathBuf,

    /// The port to listen for incoming peer connections on.
    #[clap(short, long, default_value = "16100")]
    port: u16,

    /// Directory to download into (and seed from, if already complete).
    #[clap(short, long)]
    download_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = Args::parse();

    let download_dir = args
        .download_dir
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let conf = Conf::new(download_dir);

    if let Err(e) = engine::run(&args.torrent_file, args.port, conf).await {
        eprintln!("error: {}", e);
        exit(1);
    }

    exit(0);
}
