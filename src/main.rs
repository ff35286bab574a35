//! # Leech
//!
//! A command-line BitTorrent leecher: point it at a `.torrent` file and it
//! downloads the described file from the swarm, verifying every piece
//! against the metadata digests before anything reaches disk.
//!
//! ## Usage
//!
//! ```bash
//! leech <torrent_file>
//! leech <torrent_file> -d <output_directory>
//! ```
//!
//! ## Architecture
//!
//! - **Main thread**: parses arguments, loads the torrent, contacts the
//!   tracker, pre-allocates the output file, and coordinates the download
//! - **Worker threads**: one per peer, each speaking the peer wire
//!   protocol over its own TCP connection
//! - **Channels**: a shared job queue of outstanding pieces and a result
//!   channel of verified pieces

#[macro_use]
extern crate log;

mod bitfield;
mod client;
mod handshake;
mod message;
mod peer;
mod piece;
mod storage;
mod torrent;
mod worker;

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::Parser;

use storage::OutputFile;
use torrent::Torrent;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line BitTorrent leecher, written in Rust."
)]
struct Args {
    /// Path to the .torrent file
    torrent: String,

    /// Directory to save the downloaded file in
    #[arg(short = 'd', long, default_value = ".")]
    directory: String,
}

/// Sanitize a filename to prevent path traversal and basic issues.
fn sanitize_filename(filename: &str) -> String {
    // Replace path separators with underscores to prevent directory traversal
    let safe_name = filename.replace(['/', '\\'], "_");

    // Use default name if empty
    if safe_name.trim().is_empty() {
        "download".to_string()
    } else {
        safe_name
    }
}

fn run(args: Args) -> Result<()> {
    // Check if torrent file exists
    if !Path::new(&args.torrent).exists() {
        return Err(anyhow!("could not find torrent file: {}", args.torrent));
    }

    // Parse metadata and discover peers
    let mut torrent = Torrent::new();
    torrent.open(PathBuf::from(&args.torrent))?;

    // Determine the output path from the sanitized torrent name
    let output_filename = sanitize_filename(torrent.name());
    let output_filepath = Path::new(&args.directory).join(&output_filename);

    // Check if output file already exists
    if output_filepath.exists() {
        println!("Output file '{}' already exists.", output_filepath.display());
        print!("Do you want to overwrite it? (y/N): ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let input = input.trim().to_lowercase();

        if input != "y" && input != "yes" {
            println!("Download cancelled.");
            return Ok(());
        }
    }

    // Pre-allocate the output file, then download into it
    let mut output_file = OutputFile::create(&output_filepath, torrent.length() as u64)?;
    torrent.download(&mut output_file)?;

    println!("Saved in \"{}\".", output_filepath.display());

    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments
    let args = Args::parse();

    // Run program, eventually exit failure
    if let Err(error) = run(args) {
        eprintln!("Error: {}", error);
        std::process::exit(1);
    }

    // Exit success
    std::process::exit(0);
}
