//! # Piece Download State
//!
//! A piece travels through the system as a [`PieceJob`]: handed out over
//! the job channel, assembled block-by-block into its buffer by exactly one
//! worker at a time, and re-enqueued on failure. A job that passed the
//! digest check becomes a [`PieceResult`] on the result channel.

/// One piece waiting to be downloaded.
#[derive(Default, Debug, Clone)]
pub struct PieceJob {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Expected SHA-1 digest of the piece (20 bytes)
    pub hash: Vec<u8>,
    /// True size of the piece in bytes (shorter for the tail piece)
    pub length: u32,
    /// Assembly buffer, `length` bytes
    pub buf: Vec<u8>,
    /// Download attempts so far, across all workers that held this job
    pub attempts: u32,
}

impl PieceJob {
    pub fn new(index: u32, hash: Vec<u8>, length: u32) -> PieceJob {
        PieceJob {
            index,
            hash,
            length,
            buf: vec![0; length as usize],
            attempts: 0,
        }
    }

    /// Re-zero the assembly buffer so a retry starts from a clean slate.
    pub fn reset(&mut self) {
        self.buf = vec![0; self.length as usize];
    }
}

/// A fully downloaded, digest-verified piece.
#[derive(Default, Debug, Clone)]
pub struct PieceResult {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Verified piece bytes
    pub data: Vec<u8>,
}

impl PieceResult {
    pub fn new(index: u32, data: Vec<u8>) -> PieceResult {
        PieceResult { index, data }
    }
}

/// What a worker reports back on the result channel.
#[derive(Debug, Clone)]
pub enum PieceOutcome {
    /// The piece downloaded and its digest matched.
    Verified(PieceResult),
    /// The piece failed too many times and was dropped from circulation.
    Abandoned { index: u32, attempts: u32 },
}
