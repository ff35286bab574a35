//! # Peer Session
//!
//! One [`Client`] speaks the peer wire protocol with one remote peer over
//! a dedicated TCP connection. A session goes through two phases:
//!
//! 1. **Establishment**: TCP connect, handshake exchange, and the remote
//!    peer's opening BITFIELD, all under short deadlines. A peer that sends
//!    the wrong info hash, stalls, or opens with anything other than a
//!    BITFIELD is abandoned before any piece traffic.
//! 2. **Exchange**: deadlines are lifted and the session alternates
//!    between sending frames and reading exactly one inbound frame at a
//!    time, updating its connection state as messages arrive.
//!
//! Session state is deliberately flat: the remote peer's bitfield plus the
//! `am_choked` / `am_interested` flags driven by inbound CHOKE, UNCHOKE,
//! INTERESTED and NOT INTERESTED messages. Dropping the client closes the
//! socket.

use crate::bitfield::Bitfield;
use crate::handshake::Handshake;
use crate::message::{self, Message};
use crate::peer::Peer;

use std::io::Write;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::Duration;

use anyhow::{anyhow, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// A live session with one remote peer.
pub struct Client {
    /// Endpoint of the remote peer
    peer: Peer,
    /// TCP stream to the peer
    conn: TcpStream,
    /// Pieces the remote peer advertises
    bitfield: Bitfield,
    /// Whether the remote peer currently chokes us
    am_choked: bool,
    /// Whether the remote peer declared interest in our pieces
    am_interested: bool,
}

impl Client {
    /// Establish a full session with `peer`: TCP connection, handshake,
    /// and the opening BITFIELD.
    ///
    /// The whole establishment runs under a 5-second deadline (15 seconds
    /// for the TCP connect itself); afterwards the connection has no
    /// read or write deadline. Any failure releases the socket.
    pub fn connect(peer: Peer, peer_id: &[u8], info_hash: &[u8]) -> Result<Client> {
        let peer_socket = SocketAddr::new(IpAddr::V4(peer.ip), peer.port);
        let conn = match TcpStream::connect_timeout(&peer_socket, CONNECT_TIMEOUT) {
            Ok(conn) => conn,
            Err(_) => return Err(anyhow!("could not connect to peer {}", peer)),
        };

        info!("Connected to peer {}", peer);

        let mut client = Client {
            peer,
            conn,
            bitfield: Bitfield::default(),
            am_choked: true,
            am_interested: false,
        };

        client.set_deadlines(Some(ESTABLISH_TIMEOUT))?;
        client.exchange_handshake(peer_id, info_hash)?;
        client.read_initial_bitfield()?;
        client.set_deadlines(None)?;

        Ok(client)
    }

    /// Whether the remote peer currently chokes us.
    pub fn is_choked(&self) -> bool {
        self.am_choked
    }

    /// Whether the remote peer declared interest in our pieces.
    #[allow(dead_code)]
    pub fn is_interested(&self) -> bool {
        self.am_interested
    }

    /// Whether the remote peer advertises the piece at `index`.
    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has_piece(index)
    }

    /// Set or clear the read and write deadlines on the connection.
    fn set_deadlines(&self, timeout: Option<Duration>) -> Result<()> {
        if self.conn.set_write_timeout(timeout).is_err() {
            return Err(anyhow!("could not set write timeout"));
        }
        if self.conn.set_read_timeout(timeout).is_err() {
            return Err(anyhow!("could not set read timeout"));
        }

        Ok(())
    }

    /// Send our handshake and validate the peer's reply.
    fn exchange_handshake(&mut self, peer_id: &[u8], info_hash: &[u8]) -> Result<()> {
        let handshake = Handshake::new(info_hash.to_vec(), peer_id.to_vec());
        if self.conn.write_all(&handshake.marshal()).is_err() {
            return Err(anyhow!("could not send handshake to peer {}", self.peer));
        }

        let reply = Handshake::unmarshal(&mut self.conn)?;
        if reply.info_hash != info_hash {
            return Err(anyhow!(
                "peer {} answered the handshake for a different torrent",
                self.peer
            ));
        }

        debug!("Completed handshake with peer {}", self.peer);

        Ok(())
    }

    /// Read the peer's opening message, which must be a BITFIELD.
    fn read_initial_bitfield(&mut self) -> Result<()> {
        let message = match message::unmarshal(&mut self.conn)? {
            Some(message) => message,
            None => {
                return Err(anyhow!(
                    "expected BITFIELD from peer {}, got a keep-alive",
                    self.peer
                ))
            }
        };

        if message.id != message::MESSAGE_BITFIELD {
            return Err(anyhow!(
                "expected BITFIELD from peer {}, got {}",
                self.peer,
                message.name()
            ));
        }

        debug!("Received BITFIELD from peer {}", self.peer);
        self.bitfield = Bitfield::new(message.payload);

        Ok(())
    }

    /// Write one serialized frame to the peer in full.
    fn send_message(&mut self, message: &Message) -> Result<()> {
        if self.conn.write_all(&message.marshal()).is_err() {
            return Err(anyhow!(
                "could not send {} to peer {}",
                message.name(),
                self.peer
            ));
        }

        Ok(())
    }

    #[allow(dead_code)]
    pub fn send_choke(&mut self) -> Result<()> {
        debug!("Send CHOKE to peer {}", self.peer);
        self.send_message(&Message::choke())
    }

    pub fn send_unchoke(&mut self) -> Result<()> {
        debug!("Send UNCHOKE to peer {}", self.peer);
        self.send_message(&Message::unchoke())
    }

    pub fn send_interested(&mut self) -> Result<()> {
        debug!("Send INTERESTED to peer {}", self.peer);
        self.send_message(&Message::interested())
    }

    #[allow(dead_code)]
    pub fn send_not_interested(&mut self) -> Result<()> {
        debug!("Send NOT_INTERESTED to peer {}", self.peer);
        self.send_message(&Message::not_interested())
    }

    pub fn send_have(&mut self, index: u32) -> Result<()> {
        debug!("Send HAVE for piece {} to peer {}", index, self.peer);
        self.send_message(&Message::have(index))
    }

    #[allow(dead_code)]
    pub fn send_bitfield(&mut self, bitfield: Vec<u8>) -> Result<()> {
        debug!("Send BITFIELD to peer {}", self.peer);
        self.send_message(&Message::bitfield(bitfield))
    }

    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        debug!(
            "Send REQUEST for piece {} [{}:{}] to peer {}",
            index,
            begin,
            begin + length,
            self.peer
        );
        self.send_message(&Message::request(index, begin, length))
    }

    #[allow(dead_code)]
    pub fn send_piece(&mut self, index: u32, begin: u32, block: &[u8]) -> Result<()> {
        debug!(
            "Send PIECE {} [{}:{}] to peer {}",
            index,
            begin,
            begin + block.len() as u32,
            self.peer
        );
        self.send_message(&Message::piece(index, begin, block))
    }

    #[allow(dead_code)]
    pub fn send_cancel(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        debug!(
            "Send CANCEL for piece {} [{}:{}] to peer {}",
            index,
            begin,
            begin + length,
            self.peer
        );
        self.send_message(&Message::cancel(index, begin, length))
    }

    #[allow(dead_code)]
    pub fn send_port(&mut self, port: u16) -> Result<()> {
        debug!("Send PORT {} to peer {}", port, self.peer);
        self.send_message(&Message::port(port))
    }

    /// Read exactly one frame from the peer and apply it to the session.
    ///
    /// `index` and `buf` describe the piece currently being assembled: a
    /// PIECE frame is validated against them and its block copied into
    /// `buf`, returning the number of bytes copied. Every other message
    /// kind returns 0.
    pub fn read_message(&mut self, index: u32, buf: &mut [u8]) -> Result<usize> {
        let message = match message::unmarshal(&mut self.conn)? {
            Some(message) => message,
            None => {
                debug!("Received KEEP_ALIVE from peer {}", self.peer);
                return Ok(0);
            }
        };

        debug!("Received {} from peer {}", message.name(), self.peer);

        match message.id {
            message::MESSAGE_CHOKE => {
                self.am_choked = true;
            }
            message::MESSAGE_UNCHOKE => {
                self.am_choked = false;
            }
            message::MESSAGE_INTERESTED => {
                self.am_interested = true;
            }
            message::MESSAGE_NOT_INTERESTED => {
                self.am_interested = false;
            }
            message::MESSAGE_HAVE => {
                let have_index = message::parse_have(&message)?;
                self.bitfield.set_piece(have_index);
            }
            message::MESSAGE_BITFIELD => {
                self.bitfield = Bitfield::new(message.payload);
            }
            message::MESSAGE_PIECE => {
                return message::parse_piece(index, buf, &message);
            }
            // Leech-only: requests from the peer are validated but never
            // serviced
            message::MESSAGE_REQUEST | message::MESSAGE_CANCEL => {
                message::parse_request(&message)?;
            }
            message::MESSAGE_PORT => {
                message::parse_port(&message)?;
            }
            _ => {
                debug!("Received unknown message from peer {}", self.peer);
            }
        }

        Ok(0)
    }
}
