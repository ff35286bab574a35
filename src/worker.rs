//! # Download Worker
//!
//! One worker drives one peer session for the lifetime of the download:
//!
//! 1. **Connect**: establish the session. A peer that cannot be reached or
//!    fails establishment is abandoned; the other workers carry on.
//! 2. **Announce**: send UNCHOKE then INTERESTED, and read the peer's one
//!    reply before any request traffic.
//! 3. **Job loop**: pull piece jobs from the shared queue, fetch each one
//!    block-by-block (16 KiB, strictly one outstanding request at a time),
//!    hash the assembled piece, and either publish it on the result
//!    channel or hand the job back for another worker.
//!
//! Re-enqueueing is best-effort: once the coordinator has torn the
//! channels down, a failed send just means the download is over. A job
//! that keeps failing is abandoned after a fixed number of attempts so a
//! swarm of corrupt peers cannot spin the queue forever.

use crate::client::Client;
use crate::peer::Peer;
use crate::piece::{PieceJob, PieceOutcome, PieceResult};

use anyhow::Result;
use boring::sha::Sha1;
use crossbeam_channel::{Receiver, Sender};

// Size of one block request (16KB)
const BLOCK_SIZE_MAX: u32 = 16 * 1024;

// Download attempts before a piece is dropped from circulation
const MAX_JOB_ATTEMPTS: u32 = 5;

/// Downloads pieces from a single peer.
pub struct Worker {
    /// Endpoint of the remote peer
    peer: Peer,
    /// 20-byte identifier of this client instance
    peer_id: Vec<u8>,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    info_hash: Vec<u8>,
    /// Shared piece queue: receive to take a job, send to give one back
    jobs: (Sender<PieceJob>, Receiver<PieceJob>),
    /// Channel for publishing verified pieces
    results: Sender<PieceOutcome>,
}

impl Worker {
    pub fn new(
        peer: Peer,
        peer_id: Vec<u8>,
        info_hash: Vec<u8>,
        jobs: (Sender<PieceJob>, Receiver<PieceJob>),
        results: Sender<PieceOutcome>,
    ) -> Worker {
        Worker {
            peer,
            peer_id,
            info_hash,
            jobs,
            results,
        }
    }

    /// Drive the peer session until the job queue drains or the session
    /// dies.
    pub fn run(self) {
        let mut client = match Client::connect(self.peer, &self.peer_id, &self.info_hash) {
            Ok(client) => client,
            Err(error) => {
                warn!("Abandoning peer {}: {}", self.peer, error);
                return;
            }
        };

        // Announce interest
        if client.send_unchoke().is_err() || client.send_interested().is_err() {
            warn!("Abandoning peer {}: could not announce interest", self.peer);
            return;
        }

        // Read the peer's reply before request traffic begins
        if let Err(error) = client.read_message(0, &mut []) {
            warn!("Abandoning peer {}: {}", self.peer, error);
            return;
        }

        loop {
            let mut job = match self.jobs.1.recv() {
                Ok(job) => job,
                // Disconnected queue: the download is over
                Err(_) => return,
            };

            // Hand the job back if this peer cannot serve it
            if !client.has_piece(job.index) {
                self.give_back(job);
                continue;
            }

            if client.is_choked() {
                debug!(
                    "Requesting piece {} from peer {} while still choked",
                    job.index, self.peer
                );
            }

            job.reset();

            if let Err(error) = download_piece(&mut client, &mut job) {
                warn!("Peer {} failed piece {}: {}", self.peer, job.index, error);
                job.attempts += 1;
                self.give_back(job);
                // A dead socket ends the session
                return;
            }

            if !verify_piece(&job) {
                warn!(
                    "Piece {} from peer {} failed its digest check",
                    job.index, self.peer
                );
                job.attempts += 1;
                self.give_back(job);
                continue;
            }

            info!("Verified piece {} from peer {}", job.index, self.peer);

            let index = job.index;
            if self
                .results
                .send(PieceOutcome::Verified(PieceResult::new(index, job.buf)))
                .is_err()
            {
                // Coordinator is gone; nothing left to publish to
                return;
            }

            // Courtesy acknowledgment; losing it does not fail the piece
            if client.send_have(index).is_err() {
                warn!("Could not acknowledge piece {} to peer {}", index, self.peer);
            }
        }
    }

    /// Return a job to circulation, or drop it for good once it has
    /// burned through its attempts.
    fn give_back(&self, job: PieceJob) {
        if job.attempts >= MAX_JOB_ATTEMPTS {
            error!(
                "Giving up on piece {} after {} attempts",
                job.index, job.attempts
            );
            let _ = self.results.send(PieceOutcome::Abandoned {
                index: job.index,
                attempts: job.attempts,
            });
            return;
        }

        // A disconnected queue means the download is over; the job is
        // simply dropped
        let _ = self.jobs.0.send(job);
    }
}

/// Fetch every block of `job` over the session, one request at a time.
fn download_piece(client: &mut Client, job: &mut PieceJob) -> Result<()> {
    let nb_blocks = job.length.div_ceil(BLOCK_SIZE_MAX);

    for block_index in 0..nb_blocks {
        let begin = block_index * BLOCK_SIZE_MAX;
        let length = block_length(job.length, block_index);

        client.send_request(job.index, begin, length)?;
        client.read_message(job.index, &mut job.buf)?;
    }

    Ok(())
}

/// Compare the assembled piece against its expected digest.
fn verify_piece(job: &PieceJob) -> bool {
    let mut hasher = Sha1::new();
    hasher.update(&job.buf);

    hasher.finish().to_vec() == job.hash
}

/// Size of block `block_index` within a piece of `piece_length` bytes:
/// 16 KiB except for a shorter final block.
fn block_length(piece_length: u32, block_index: u32) -> u32 {
    let begin = block_index * BLOCK_SIZE_MAX;
    (piece_length - begin).min(BLOCK_SIZE_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::Handshake;
    use crate::message::{self, Message};

    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpListener, TcpStream};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crossbeam_channel::bounded;

    const INFO_HASH: [u8; 20] = [1; 20];
    const RECV_TIMEOUT: Duration = Duration::from_secs(10);

    fn test_piece(length: usize) -> Vec<u8> {
        (0..length).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn sha1(data: &[u8]) -> Vec<u8> {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finish().to_vec()
    }

    /// A loopback peer seeding `piece`. Answers the handshake, sends
    /// `bitfield`, unchokes on INTERESTED, and serves block requests
    /// (corrupting the first byte of every block when asked to).
    fn spawn_seed(bitfield: Vec<u8>, piece: Vec<u8>, corrupt: bool) -> (Peer, Arc<AtomicBool>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let saw_request = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&saw_request);
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            run_seed(stream, bitfield, piece, corrupt, flag);
        });

        (Peer::new(Ipv4Addr::LOCALHOST, port), saw_request)
    }

    fn run_seed(
        mut stream: TcpStream,
        bitfield: Vec<u8>,
        piece: Vec<u8>,
        corrupt: bool,
        saw_request: Arc<AtomicBool>,
    ) {
        let mut buf = [0; 68];
        if stream.read_exact(&mut buf).is_err() {
            return;
        }

        let reply = Handshake::new(INFO_HASH.to_vec(), vec![9; 20]);
        if stream.write_all(&reply.marshal()).is_err() {
            return;
        }
        if stream
            .write_all(&Message::bitfield(bitfield).marshal())
            .is_err()
        {
            return;
        }

        loop {
            let msg = match message::unmarshal(&mut stream) {
                Ok(Some(msg)) => msg,
                Ok(None) => continue,
                // Client hung up
                Err(_) => return,
            };

            match msg.id {
                message::MESSAGE_INTERESTED => {
                    if stream.write_all(&Message::unchoke().marshal()).is_err() {
                        return;
                    }
                }
                message::MESSAGE_REQUEST => {
                    saw_request.store(true, Ordering::SeqCst);

                    let (index, begin, length) = message::parse_request(&msg).unwrap();
                    let mut block =
                        piece[begin as usize..(begin + length) as usize].to_vec();
                    if corrupt {
                        block[0] ^= 0xff;
                    }

                    if stream
                        .write_all(&Message::piece(index, begin, &block).marshal())
                        .is_err()
                    {
                        return;
                    }
                }
                _ => {}
            }
        }
    }

    fn spawn_worker(
        peer: Peer,
        jobs: (Sender<PieceJob>, Receiver<PieceJob>),
        results: Sender<PieceOutcome>,
    ) {
        let worker = Worker::new(peer, vec![2; 20], INFO_HASH.to_vec(), jobs, results);
        thread::spawn(move || worker.run());
    }

    #[test]
    fn test_block_length_exact_fit() {
        assert_eq!(16384u32.div_ceil(BLOCK_SIZE_MAX), 1);
        assert_eq!(block_length(16384, 0), 16384);
    }

    #[test]
    fn test_block_length_short_piece() {
        assert_eq!(7232u32.div_ceil(BLOCK_SIZE_MAX), 1);
        assert_eq!(block_length(7232, 0), 7232);
    }

    #[test]
    fn test_block_length_multi_block() {
        assert_eq!(49152u32.div_ceil(BLOCK_SIZE_MAX), 3);
        assert_eq!(block_length(49152, 0), 16384);
        assert_eq!(block_length(49152, 1), 16384);
        assert_eq!(block_length(49152, 2), 16384);
    }

    #[test]
    fn test_block_length_tail_block() {
        assert_eq!(40000u32.div_ceil(BLOCK_SIZE_MAX), 3);
        assert_eq!(block_length(40000, 0), 16384);
        assert_eq!(block_length(40000, 1), 16384);
        assert_eq!(block_length(40000, 2), 7232);
    }

    #[test]
    fn test_downloads_single_piece() {
        let piece = test_piece(16384);
        let (peer, _) = spawn_seed(vec![0b10000000], piece.clone(), false);

        let jobs = bounded(1);
        let results = bounded(1);
        jobs.0.send(PieceJob::new(0, sha1(&piece), 16384)).unwrap();

        spawn_worker(peer, jobs.clone(), results.0.clone());
        drop(results.0);

        match results.1.recv_timeout(RECV_TIMEOUT).unwrap() {
            PieceOutcome::Verified(result) => {
                assert_eq!(result.index, 0);
                assert_eq!(result.data, piece);
            }
            outcome => panic!("expected a verified piece, got {:?}", outcome),
        }
    }

    #[test]
    fn test_downloads_multi_block_piece() {
        let piece = test_piece(40000);
        let (peer, _) = spawn_seed(vec![0b10000000], piece.clone(), false);

        let jobs = bounded(1);
        let results = bounded(1);
        jobs.0
            .send(PieceJob::new(0, sha1(&piece), 40000))
            .unwrap();

        spawn_worker(peer, jobs.clone(), results.0.clone());
        drop(results.0);

        match results.1.recv_timeout(RECV_TIMEOUT).unwrap() {
            PieceOutcome::Verified(result) => assert_eq!(result.data, piece),
            outcome => panic!("expected a verified piece, got {:?}", outcome),
        }
    }

    #[test]
    fn test_requeues_when_peer_lacks_piece() {
        let piece = test_piece(512);
        // The seed's bitfield does not advertise piece 0
        let (peer, saw_request) = spawn_seed(vec![0b00000000], piece.clone(), false);

        let jobs = bounded(1);
        let results = bounded(1);
        jobs.0.send(PieceJob::new(0, sha1(&piece), 512)).unwrap();

        spawn_worker(peer, jobs.clone(), results.0.clone());

        let job = jobs.1.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(job.index, 0);
        assert_eq!(job.attempts, 0);
        assert!(!saw_request.load(Ordering::SeqCst));
    }

    #[test]
    fn test_corrupt_peer_retries_on_good_peer() {
        let piece = test_piece(4096);
        let (corrupt_peer, _) = spawn_seed(vec![0b10000000], piece.clone(), true);
        let (good_peer, _) = spawn_seed(vec![0b10000000], piece.clone(), false);

        let jobs = bounded(1);
        let results = bounded(2);
        jobs.0.send(PieceJob::new(0, sha1(&piece), 4096)).unwrap();

        spawn_worker(corrupt_peer, jobs.clone(), results.0.clone());
        spawn_worker(good_peer, jobs.clone(), results.0.clone());
        drop(results.0);

        match results.1.recv_timeout(RECV_TIMEOUT).unwrap() {
            PieceOutcome::Verified(result) => {
                assert_eq!(result.index, 0);
                assert_eq!(result.data, piece);
            }
            outcome => panic!("expected a verified piece, got {:?}", outcome),
        }
    }

    #[test]
    fn test_abandons_piece_after_max_attempts() {
        let piece = test_piece(64);
        let (peer, _) = spawn_seed(vec![0b10000000], piece.clone(), true);

        let jobs = bounded(1);
        let results = bounded(1);
        jobs.0.send(PieceJob::new(0, sha1(&piece), 64)).unwrap();

        spawn_worker(peer, jobs.clone(), results.0.clone());
        drop(results.0);

        match results.1.recv_timeout(RECV_TIMEOUT).unwrap() {
            PieceOutcome::Abandoned { index, attempts } => {
                assert_eq!(index, 0);
                assert_eq!(attempts, MAX_JOB_ATTEMPTS);
            }
            outcome => panic!("expected an abandoned piece, got {:?}", outcome),
        }
    }
}
