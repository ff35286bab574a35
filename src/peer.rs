//! # Peer Endpoints
//!
//! Trackers answer with a compact binary peer list: 6 bytes per peer, an
//! IPv4 address followed by a big-endian port, both in network byte order.

use std::fmt;
use std::io::Cursor;
use std::net::Ipv4Addr;

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};

const COMPACT_PEER_SIZE: usize = 6;

/// A remote peer endpoint. Two peers are the same peer when address and
/// port both match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    /// IPv4 address of the peer
    pub ip: Ipv4Addr,
    /// Port the peer listens on
    pub port: u16,
}

impl Peer {
    pub fn new(ip: Ipv4Addr, port: u16) -> Peer {
        Peer { ip, port }
    }

    /// Parse a compact tracker peer list.
    ///
    /// Fails if the byte length is not a multiple of 6.
    pub fn from_compact(bytes: &[u8]) -> Result<Vec<Peer>> {
        if !bytes.len().is_multiple_of(COMPACT_PEER_SIZE) {
            return Err(anyhow!("received malformed peer list from tracker"));
        }

        let nb_peers = bytes.len() / COMPACT_PEER_SIZE;
        let mut peers: Vec<Peer> = Vec::with_capacity(nb_peers);

        for i in 0..nb_peers {
            let offset = i * COMPACT_PEER_SIZE;

            let ip = Ipv4Addr::new(
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            );

            let mut cursor = Cursor::new(&bytes[offset + 4..offset + 6]);
            let port = cursor.read_u16::<BigEndian>()?;

            peers.push(Peer::new(ip, port));
        }

        Ok(peers)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_compact() {
        let bytes = [192, 168, 1, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0, 80];
        let peers = Peer::from_compact(&bytes).unwrap();

        assert_eq!(
            peers,
            vec![
                Peer::new(Ipv4Addr::new(192, 168, 1, 1), 6881),
                Peer::new(Ipv4Addr::new(10, 0, 0, 2), 80),
            ]
        );
    }

    #[test]
    fn test_from_compact_empty() {
        assert_eq!(Peer::from_compact(&[]).unwrap(), vec![]);
    }

    #[test]
    fn test_from_compact_malformed() {
        let bytes = [192, 168, 1, 1, 0x1a];
        assert!(Peer::from_compact(&bytes).is_err());
    }

    #[test]
    fn test_display() {
        let peer = Peer::new(Ipv4Addr::new(127, 0, 0, 1), 6881);
        assert_eq!(peer.to_string(), "127.0.0.1:6881");
    }
}
