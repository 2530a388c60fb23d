//! User-space QUIC proxy core for satellite links.
//!
//! The crate terminates QUIC datagrams at the satellite-link endpoint,
//! demultiplexes them onto per-connection protocol engines, and drives
//! retransmission timers tuned for round trips of 500 ms and up. Heavy
//! per-packet transforms (AEAD, compression, packet assembly, retransmit
//! replay) are routed through the [`offload::OffloadDispatcher`], which hides
//! whether an external accelerator is attached; a software twin produces
//! byte-identical results when it is not.
//!
//! Layering, leaves first: [`packet`] and [`frame`] are the stateless wire
//! codec, [`streams`] and [`tracker`] hold per-connection state,
//! [`connection`] orchestrates them, [`endpoint`] routes datagrams to their
//! owning connection, and [`proxy`] binds the UDP socket and runs the loop.

use std::fmt;

use bytes::BufMut;
use rand::RngCore;

mod coding;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod endpoint;
pub mod frame;
pub mod offload;
pub mod packet;
mod ranges;
pub mod proxy;
pub mod stats;
pub mod streams;
pub mod testing;
pub mod tracker;

pub use config::ProxyConfig;
pub use connection::Connection;
pub use endpoint::Endpoint;
pub use frame::Frame;
pub use offload::{OffloadDispatcher, OffloadError};
pub use packet::{Header, ParseError};
pub use proxy::{Proxy, ProxyError};
pub use streams::StreamId;

/// The QUIC version this proxy speaks.
pub const VERSION: u32 = 0x0000_0001;

/// Longest connection ID permitted on the wire.
pub const MAX_CID_LEN: usize = 20;

/// Connection ID length this endpoint issues for itself.
pub const LOCAL_CID_LEN: usize = 8;

/// Initial datagrams must be padded out to this many bytes.
pub const MIN_INITIAL_SIZE: usize = 1200;

/// Streams tracked per connection before inbound creation is refused.
pub const MAX_STREAMS: usize = 64;

/// Retransmissions attempted before a packet is abandoned and the
/// connection declared lost.
pub const MAX_RETRIES: u8 = 10;

/// An opaque connection ID, 0-20 bytes of peer-chosen identity.
///
/// Compared by byte content; the destination CID of an incoming datagram
/// names the owning connection.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_LEN],
}

impl ConnectionId {
    /// Construct from a slice.
    ///
    /// PANICS: if `bytes` exceeds [`MAX_CID_LEN`]; length fields are
    /// validated during parsing before this is reached.
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_CID_LEN);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_LEN],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    /// A fresh random CID of `len` bytes.
    pub fn random(len: usize) -> Self {
        debug_assert!(len > 0 && len <= MAX_CID_LEN);
        let mut bytes = [0; MAX_CID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes[..len]);
        Self::new(&bytes[..len])
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.len);
        buf.put_slice(self);
    }
}

impl std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which side of a connection initiated a stream.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    Client = 0,
    Server = 1,
}

impl std::ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// Whether a stream carries data in both directions.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Dir {
    Bi = 0,
    Uni = 1,
}
