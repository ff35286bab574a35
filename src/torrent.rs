//! # Torrent Metadata and Download Coordination
//!
//! A `.torrent` file is a bencoded document:
//!
//! - **announce**: tracker URL for peer discovery
//! - **info**: dictionary describing the file
//!   - **name**: suggested filename
//!   - **length**: total file size in bytes
//!   - **piece length**: size of each piece (the tail piece may be shorter)
//!   - **pieces**: concatenated 20-byte SHA-1 digests, one per piece
//!
//! The SHA-1 of the re-bencoded info dictionary is the info hash that
//! identifies the torrent to trackers and peers alike.
//!
//! Once peers are known, [`Torrent::download`] runs the piece exchange:
//! a bounded job channel pre-filled with one job per piece, one worker
//! thread per peer draining it, and a result channel feeding verified
//! pieces back to this thread, which writes them to the output file at
//! their absolute offsets. The download is complete when every piece has
//! been written; it is aborted if a piece exhausts its retries or if every
//! worker dies first.

use crate::peer::Peer;
use crate::piece::{PieceJob, PieceOutcome};
use crate::storage::OutputFile;
use crate::worker::Worker;

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use boring::sha::Sha1;
use crossbeam_channel::{bounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_bencode::{de, ser};
use serde_bytes::ByteBuf;
use url::Url;

// Port reported to the tracker
const PORT: u16 = 6881;
// Size of a SHA-1 digest in bytes
const SHA1_HASH_SIZE: usize = 20;
// Timeout for the tracker round-trip
const TRACKER_TIMEOUT: Duration = Duration::from_secs(15);

/// One torrent: parsed metadata, discovered peers, and the download state
/// needed to drive the piece exchange.
#[derive(Default, Clone)]
pub struct Torrent {
    /// Tracker URL for peer discovery
    announce: String,
    /// 20-byte SHA-1 hash of the bencoded info dictionary
    info_hash: Vec<u8>,
    /// One 20-byte SHA-1 digest per piece
    pieces_hashes: Vec<Vec<u8>>,
    /// Size of each piece in bytes (except possibly the last)
    piece_length: u32,
    /// Total size of the file in bytes
    length: u32,
    /// Suggested filename from the metadata
    name: String,
    /// 20-byte identifier of this client instance
    peer_id: Vec<u8>,
    /// Peers discovered through the tracker
    peers: Vec<Peer>,
    /// Tracker refresh interval in seconds (recorded, not acted upon)
    #[allow(dead_code)]
    refresh_interval: u32,
}

/// The metainfo "info" dictionary.
#[derive(Deserialize, Serialize)]
struct BencodeInfo {
    // Concatenation of all pieces' 20-byte SHA-1 digests
    #[serde(rename = "pieces")]
    pieces: ByteBuf,
    // Size of each piece in bytes
    #[serde(rename = "piece length")]
    piece_length: u32,
    // Size of the file in bytes
    #[serde(rename = "length")]
    length: u32,
    // Suggested filename where to save the file
    #[serde(rename = "name")]
    name: String,
}

/// The top-level metainfo document.
#[derive(Deserialize, Serialize)]
struct BencodeTorrent {
    // URL of the tracker
    announce: String,
    // Information about the file
    info: BencodeInfo,
}

/// The tracker's bencoded answer to an announce.
#[derive(Debug, Deserialize)]
struct BencodeTracker {
    // Seconds to wait before refreshing the peer list
    #[serde(default)]
    interval: u32,
    // Compact peer entries, 6 bytes each
    #[serde(default)]
    peers: ByteBuf,
    // Set when the tracker rejects the announce
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
}

impl BencodeInfo {
    /// Hash the bencoded info dictionary to identify the torrent.
    fn hash(&self) -> Result<Vec<u8>> {
        let buf: Vec<u8> = ser::to_bytes::<BencodeInfo>(self)?;

        let mut hasher = Sha1::new();
        hasher.update(&buf);

        Ok(hasher.finish().to_vec())
    }

    /// Split the concatenated digests into one 20-byte hash per piece.
    fn split_pieces_hashes(&self) -> Result<Vec<Vec<u8>>> {
        if !self.pieces.len().is_multiple_of(SHA1_HASH_SIZE) {
            return Err(anyhow!("torrent has a malformed pieces field"));
        }

        let hashes = self
            .pieces
            .chunks(SHA1_HASH_SIZE)
            .map(|chunk| chunk.to_vec())
            .collect();

        Ok(hashes)
    }
}

impl Torrent {
    /// Build a new torrent.
    pub fn new() -> Self {
        Default::default()
    }

    /// The suggested filename from the torrent metadata.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total file size in bytes.
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Open a torrent file: parse its metadata and fetch peers from the
    /// tracker.
    pub fn open(&mut self, filepath: PathBuf) -> Result<()> {
        let mut file = match File::open(filepath) {
            Ok(file) => file,
            Err(_) => return Err(anyhow!("could not open torrent")),
        };

        let mut buf = vec![];
        if file.read_to_end(&mut buf).is_err() {
            return Err(anyhow!("could not read torrent"));
        }

        self.load(&buf)?;

        // Generate a random 20-byte peer id
        let mut rng = rand::thread_rng();
        self.peer_id = (0..20).map(|_| rng.gen()).collect();

        let (peers, refresh_interval) = self.request_peers(PORT)?;
        info!(
            "Fetched {} peers from tracker (refresh interval {}s)",
            peers.len(),
            refresh_interval
        );

        self.peers = peers;
        self.refresh_interval = refresh_interval;

        Ok(())
    }

    /// Parse and validate the bencoded metainfo document.
    fn load(&mut self, buf: &[u8]) -> Result<()> {
        let bencode = match de::from_bytes::<BencodeTorrent>(buf) {
            Ok(bencode) => bencode,
            Err(_) => return Err(anyhow!("could not decode torrent")),
        };

        if bencode.announce.is_empty() {
            return Err(anyhow!("torrent has no announce url"));
        }
        if bencode.info.piece_length == 0 {
            return Err(anyhow!("torrent has an invalid piece length"));
        }

        let pieces_hashes = bencode.info.split_pieces_hashes()?;
        let nb_pieces = (bencode.info.length as u64).div_ceil(bencode.info.piece_length as u64);
        if pieces_hashes.len() as u64 != nb_pieces {
            return Err(anyhow!("torrent has an invalid piece count"));
        }

        self.announce = bencode.announce;
        self.info_hash = bencode.info.hash()?;
        self.pieces_hashes = pieces_hashes;
        self.piece_length = bencode.info.piece_length;
        self.length = bencode.info.length;
        self.name = bencode.info.name;

        Ok(())
    }

    /// Announce to the tracker and collect its peer list.
    fn request_peers(&self, port: u16) -> Result<(Vec<Peer>, u32)> {
        let tracker_url = self.build_tracker_url(port)?;
        debug!("Announcing to tracker {}", self.announce);

        let client = match reqwest::blocking::Client::builder()
            .timeout(TRACKER_TIMEOUT)
            .build()
        {
            Ok(client) => client,
            Err(_) => return Err(anyhow!("could not build tracker client")),
        };

        let response = match client.get(&tracker_url).send() {
            Ok(response) => match response.bytes() {
                Ok(bytes) => bytes,
                Err(_) => return Err(anyhow!("could not read tracker response")),
            },
            Err(_) => return Err(anyhow!("could not reach tracker {}", self.announce)),
        };

        let tracker = match de::from_bytes::<BencodeTracker>(&response) {
            Ok(tracker) => tracker,
            Err(_) => return Err(anyhow!("could not decode tracker response")),
        };

        if let Some(reason) = tracker.failure_reason {
            if !reason.is_empty() {
                return Err(anyhow!("tracker refused the announce: {}", reason));
            }
        }

        // Deduplicate endpoints; trackers occasionally repeat entries
        let mut seen = HashSet::new();
        let peers: Vec<Peer> = Peer::from_compact(&tracker.peers)?
            .into_iter()
            .filter(|peer| seen.insert(*peer))
            .collect();

        if peers.is_empty() {
            return Err(anyhow!("tracker returned no peers"));
        }

        Ok((peers, tracker.interval))
    }

    /// Build the announce URL with its binary query parameters.
    fn build_tracker_url(&self, port: u16) -> Result<String> {
        let base_url = match Url::parse(&self.announce) {
            Ok(url) => url,
            Err(_) => return Err(anyhow!("could not parse tracker url")),
        };

        // The info hash and peer id are raw bytes, so the query string is
        // assembled by hand rather than through a urlencoder
        let query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
            percent_encode_binary(&self.info_hash),
            percent_encode_binary(&self.peer_id),
            port,
            self.length
        );

        let mut url = base_url.to_string();
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str(&query);

        Ok(url)
    }

    /// Run the piece exchange and write every verified piece into `out`.
    pub fn download(&self, out: &mut OutputFile) -> Result<()> {
        let nb_pieces = self.pieces_hashes.len();
        println!("Downloading {:?} ({} pieces)", self.name, nb_pieces);

        // Queue one job per piece, in piece-index order
        let jobs: (Sender<PieceJob>, Receiver<PieceJob>) = bounded(nb_pieces);
        for (index, hash) in self.pieces_hashes.iter().enumerate() {
            let piece_index = index as u32;
            let job = PieceJob::new(
                piece_index,
                hash.clone(),
                self.get_piece_length(piece_index),
            );

            if jobs.0.send(job).is_err() {
                return Err(anyhow!("could not queue pieces for download"));
            }
        }

        // One worker per peer
        let (result_tx, result_rx): (Sender<PieceOutcome>, Receiver<PieceOutcome>) =
            bounded(self.peers.len());
        for peer in &self.peers {
            let worker = Worker::new(
                *peer,
                self.peer_id.clone(),
                self.info_hash.clone(),
                jobs.clone(),
                result_tx.clone(),
            );

            thread::spawn(move || worker.run());
        }

        // The workers now hold the only result senders, so a failed
        // receive below means every one of them has exited
        drop(result_tx);

        let pb = ProgressBar::new(self.length as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")
                .unwrap()
                .progress_chars("#>-"),
        );

        let mut nb_pieces_done = 0;
        while nb_pieces_done < nb_pieces {
            let outcome = match result_rx.recv() {
                Ok(outcome) => outcome,
                Err(_) => return Err(anyhow!("all peers failed before the download completed")),
            };

            match outcome {
                PieceOutcome::Verified(result) => {
                    out.write_piece(self.get_piece_offset(result.index), &result.data)?;
                    pb.inc(result.data.len() as u64);
                    nb_pieces_done += 1;
                }
                PieceOutcome::Abandoned { index, attempts } => {
                    return Err(anyhow!(
                        "piece {} still failing after {} attempts, aborting",
                        index,
                        attempts
                    ));
                }
            }
        }

        pb.finish();

        Ok(())
    }

    /// True size of the piece at `index`: the piece length, shortened for
    /// the tail piece.
    fn get_piece_length(&self, index: u32) -> u32 {
        let begin = index as u64 * self.piece_length as u64;
        let end = (begin + self.piece_length as u64).min(self.length as u64);

        (end - begin) as u32
    }

    /// Absolute byte offset of the piece at `index` in the output file.
    fn get_piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length as u64
    }
}

/// Encode every byte as %XX for binary-safe query parameters.
fn percent_encode_binary(data: &[u8]) -> String {
    const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
    let mut encoded = String::with_capacity(data.len() * 3);

    for &byte in data {
        encoded.push('%');
        encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        encoded.push(HEX_DIGITS[(byte & 0x0f) as usize] as char);
    }

    encoded
}
