//! # BitTorrent Handshake Frame
//!
//! The handshake is the mandatory opening frame of every peer connection.
//! It is `49 + len(pstr)` bytes long (68 bytes for the standard protocol
//! string):
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte - length of the protocol identifier
//! - **pstr**: variable - protocol identifier ("BitTorrent protocol")
//! - **reserved**: 8 bytes - all zeros, reserved for protocol extensions
//! - **info_hash**: 20 bytes - SHA-1 of the metainfo's info dictionary
//! - **peer_id**: 20 bytes - unique identifier of the sending client
//!
//! The info hash is what ties the connection to one torrent: a peer
//! answering with a different info hash is talking about a different swarm
//! and the connection must be dropped.

use std::io::Read;

use anyhow::{anyhow, Result};

const PROTOCOL_ID: &str = "BitTorrent protocol";

/// A handshake frame, either outgoing or received from a remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Protocol identifier bytes
    pub pstr: Vec<u8>,
    /// 8 reserved bytes, all zeros
    pub reserved: [u8; 8],
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    pub info_hash: Vec<u8>,
    /// 20-byte unique identifier of the sending client
    pub peer_id: Vec<u8>,
}

impl Handshake {
    /// Build an outgoing handshake for the given torrent and client identity.
    pub fn new(info_hash: Vec<u8>, peer_id: Vec<u8>) -> Self {
        Handshake {
            pstr: PROTOCOL_ID.as_bytes().to_vec(),
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serialize the handshake for transmission.
    ///
    /// The result is always `49 + pstr.len()` bytes.
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf: Vec<u8> = Vec::with_capacity(49 + self.pstr.len());

        buf.push(self.pstr.len() as u8);
        buf.extend_from_slice(&self.pstr);
        buf.extend_from_slice(&self.reserved);
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);

        buf
    }

    /// Read one handshake from `reader`.
    ///
    /// Fails if the protocol string length is zero or if the reader ends
    /// before the full `49 + pstrlen` bytes are available.
    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Handshake> {
        // Read the protocol string length
        let mut len_buf = [0; 1];
        if reader.read_exact(&mut len_buf).is_err() {
            return Err(anyhow!("could not read handshake length from peer"));
        }

        let pstrlen = len_buf[0] as usize;
        if pstrlen == 0 {
            return Err(anyhow!("invalid handshake length received from peer"));
        }

        // Read the remaining 48 + pstrlen bytes
        let mut buf: Vec<u8> = vec![0; 48 + pstrlen];
        if reader.read_exact(&mut buf).is_err() {
            return Err(anyhow!("could not read handshake received from peer"));
        }

        let mut reserved = [0; 8];
        reserved.copy_from_slice(&buf[pstrlen..pstrlen + 8]);

        Ok(Handshake {
            pstr: buf[..pstrlen].to_vec(),
            reserved,
            info_hash: buf[pstrlen + 8..pstrlen + 28].to_vec(),
            peer_id: buf[pstrlen + 28..].to_vec(),
        })
    }
}
