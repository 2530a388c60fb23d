//! Per-connection stream state.
//!
//! A connection tracks at most [`MAX_STREAMS`](crate::MAX_STREAMS) streams.
//! Streams are created on first reference from either direction and move
//! through a small state machine:
//!
//! ```text
//! Idle ── first frame seen ──► Open
//! Open ── FIN observed ──► Closed
//! Open ── RESET_STREAM / local reset ──► Reset
//! ```
//!
//! Closed and Reset are terminal. Offsets never regress.

use std::collections::hash_map::Entry;
use std::fmt;
use std::time::Instant;

use bytes::{Buf, BufMut};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::trace;

use crate::coding::UnexpectedEnd;
use crate::frame::StreamFrame;
use crate::{Dir, Side, MAX_STREAMS};

/// 62-bit stream identifier; the low two bits carry initiator and
/// directionality. Serialized as four little-endian bytes.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn new(initiator: Side, dir: Dir, index: u64) -> Self {
        Self(index << 2 | (dir as u64) << 1 | initiator as u64)
    }

    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    pub fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 {
            Dir::Bi
        } else {
            Dir::Uni
        }
    }

    pub fn index(self) -> u64 {
        self.0 >> 2
    }

    pub(crate) fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        if buf.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        Ok(Self(buf.get_u32_le() as u64))
    }

    pub(crate) fn encode<B: BufMut>(self, buf: &mut B) {
        debug_assert!(self.0 <= u32::MAX as u64);
        buf.put_u32_le(self.0 as u32);
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum StreamError {
    /// The frame contradicts the stream's observed history; it is dropped
    /// and the connection survives.
    #[error("stream frame violates protocol state")]
    ProtocolViolation,
    /// The 65th stream was refused; the caller answers with RESET_STREAM.
    #[error("stream table is full")]
    CapacityExceeded,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamState {
    Idle,
    Open,
    Closed,
    Reset,
}

#[derive(Debug)]
pub struct Stream {
    state: StreamState,
    /// Highest byte offset seen from the peer.
    recv_offset: u64,
    /// Next byte offset we will send.
    send_offset: u64,
    bidi: bool,
    fin_received: bool,
    fin_sent: bool,
    last_activity: Instant,
}

impl Stream {
    fn new(id: StreamId, now: Instant) -> Self {
        Self {
            state: StreamState::Idle,
            recv_offset: 0,
            send_offset: 0,
            bidi: id.dir() == Dir::Bi,
            fin_received: false,
            fin_sent: false,
            last_activity: now,
        }
    }

    fn open(&mut self) {
        if self.state == StreamState::Idle {
            self.state = StreamState::Open;
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn recv_offset(&self) -> u64 {
        self.recv_offset
    }

    pub fn send_offset(&self) -> u64 {
        self.send_offset
    }

    pub fn fin_received(&self) -> bool {
        self.fin_received
    }
}

/// What [`StreamTable::on_received`] did with a frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Received {
    /// The frame advanced the stream and its data should reach the
    /// application sink.
    pub deliver: bool,
    /// The frame closed the stream (FIN observed while Open).
    pub closed: bool,
}

#[derive(Debug, Default)]
pub struct StreamTable {
    streams: FxHashMap<StreamId, Stream>,
    /// Index of the next locally initiated stream.
    next_local: u64,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn get(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    /// Apply an inbound STREAM frame.
    ///
    /// Creates the stream when absent and capacity allows; advances the
    /// received offset to `max(current, offset + len)`; a FIN on an Open
    /// stream closes it.
    pub fn on_received(
        &mut self,
        frame: &StreamFrame,
        now: Instant,
    ) -> Result<Received, StreamError> {
        let end = frame
            .start()
            .checked_add(frame.data.len() as u64)
            .ok_or(StreamError::ProtocolViolation)?;

        let len = self.streams.len();
        let stream = match self.streams.entry(frame.id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                if len >= MAX_STREAMS {
                    return Err(StreamError::CapacityExceeded);
                }
                entry.insert(Stream::new(frame.id, now))
            }
        };
        stream.open();

        match stream.state {
            StreamState::Reset => {
                // A reset stream accepts nothing further.
                return Ok(Received {
                    deliver: false,
                    closed: false,
                });
            }
            StreamState::Closed => {
                if end > stream.recv_offset {
                    return Err(StreamError::ProtocolViolation);
                }
                return Ok(Received {
                    deliver: false,
                    closed: false,
                });
            }
            StreamState::Open => {}
            StreamState::Idle => unreachable!("stream opened above"),
        }

        if frame.fin && end < stream.recv_offset {
            // FIN declares a final size below data already received.
            return Err(StreamError::ProtocolViolation);
        }

        let advanced = end > stream.recv_offset;
        stream.recv_offset = stream.recv_offset.max(end);
        stream.last_activity = now;

        let mut closed = false;
        if frame.fin {
            stream.fin_received = true;
            stream.state = StreamState::Closed;
            closed = true;
            trace!(stream = %frame.id, final_size = end, "stream closed by FIN");
        }

        Ok(Received {
            deliver: advanced && !frame.data.is_empty(),
            closed,
        })
    }

    /// Reserve `bytes` of send capacity on the least-recently-used Open
    /// stream, creating a locally initiated stream when none is open.
    /// Returns the stream and the offset the data starts at.
    pub fn allocate_send(
        &mut self,
        bytes: usize,
        now: Instant,
    ) -> Result<(StreamId, u64), StreamError> {
        let lru = self
            .streams
            .iter()
            .filter(|(_, s)| s.state == StreamState::Open && !s.fin_sent)
            .min_by_key(|(id, s)| (s.last_activity, id.0))
            .map(|(&id, _)| id);
        let id = match lru {
            Some(id) => id,
            None => {
                if self.streams.len() >= MAX_STREAMS {
                    return Err(StreamError::CapacityExceeded);
                }
                let id = StreamId::new(Side::Server, Dir::Bi, self.next_local);
                self.next_local += 1;
                let stream = self.streams.entry(id).or_insert_with(|| Stream::new(id, now));
                stream.open();
                id
            }
        };
        // Unwrap-free: the id was either found or just inserted.
        let Some(stream) = self.streams.get_mut(&id) else {
            return Err(StreamError::ProtocolViolation);
        };
        let offset = stream.send_offset;
        stream.send_offset += bytes as u64;
        stream.last_activity = now;
        Ok((id, offset))
    }

    /// Reserve send capacity on a specific stream, creating it on first
    /// reference. Refused once the stream is terminal or its FIN is out.
    pub fn prepare_send(
        &mut self,
        id: StreamId,
        bytes: usize,
        fin: bool,
        now: Instant,
    ) -> Result<u64, StreamError> {
        let len = self.streams.len();
        let stream = match self.streams.entry(id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                if len >= MAX_STREAMS {
                    return Err(StreamError::CapacityExceeded);
                }
                entry.insert(Stream::new(id, now))
            }
        };
        stream.open();
        if stream.state == StreamState::Reset || stream.fin_sent {
            return Err(StreamError::ProtocolViolation);
        }
        let offset = stream.send_offset;
        stream.send_offset += bytes as u64;
        stream.fin_sent |= fin;
        stream.last_activity = now;
        Ok(offset)
    }

    /// Apply an inbound RESET_STREAM: the stream becomes terminal, its
    /// received offset jumps to the declared final size, and pending send
    /// state is discarded.
    pub fn observe_reset(&mut self, id: StreamId, final_size: u64, now: Instant) {
        let len = self.streams.len();
        let stream = match self.streams.entry(id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                // Reset of a stream we never saw; a full table stays
                // unmodified.
                if len >= MAX_STREAMS {
                    return;
                }
                entry.insert(Stream::new(id, now))
            }
        };
        stream.state = StreamState::Reset;
        stream.recv_offset = stream.recv_offset.max(final_size);
        stream.last_activity = now;
        trace!(stream = %id, final_size, "stream reset by peer");
    }

    /// Note an outbound FIN on a stream chosen by [`Self::allocate_send`].
    pub(crate) fn mark_fin_sent(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.fin_sent = true;
        }
    }

    /// Reset every stream locally; used when the connection is lost.
    pub fn reset_all(&mut self) {
        for stream in self.streams.values_mut() {
            stream.state = StreamState::Reset;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use bytes::Bytes;

    fn frame(id: u64, offset: u64, data: &'static [u8], fin: bool) -> StreamFrame {
        StreamFrame {
            id: StreamId(id),
            offset: (offset != 0).then_some(offset),
            fin,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn stream_id_bits() {
        let id = StreamId::new(Side::Server, Dir::Bi, 3);
        assert_eq!(id.0, 13);
        assert_eq!(id.initiator(), Side::Server);
        assert_eq!(id.dir(), Dir::Bi);
        assert_eq!(id.index(), 3);
        assert_eq!(StreamId(0).initiator(), Side::Client);
    }

    #[test]
    fn fin_closes_stream() {
        let now = Instant::now();
        let mut table = StreamTable::new();
        let received = table
            .on_received(&frame(0, 0, &[0xde, 0xad, 0xbe, 0xef], true), now)
            .unwrap();
        assert!(received.deliver);
        assert!(received.closed);
        let stream = table.get(StreamId(0)).unwrap();
        assert_eq!(stream.state(), StreamState::Closed);
        assert_eq!(stream.recv_offset(), 4);
        assert!(stream.fin_received());

        // Nothing is delivered after close; data past the end is an error.
        let received = table.on_received(&frame(0, 0, &[1, 2], false), now).unwrap();
        assert!(!received.deliver);
        assert_matches!(
            table.on_received(&frame(0, 4, &[1], false), now),
            Err(StreamError::ProtocolViolation)
        );
    }

    #[test]
    fn capacity_is_sixty_four() {
        let now = Instant::now();
        let mut table = StreamTable::new();
        for index in 0..MAX_STREAMS as u64 {
            table
                .on_received(&frame(index << 2, 0, b"x", false), now)
                .unwrap();
        }
        assert_eq!(table.len(), MAX_STREAMS);
        assert_matches!(
            table.on_received(&frame((MAX_STREAMS as u64) << 2, 0, b"x", false), now),
            Err(StreamError::CapacityExceeded)
        );
        // The failed creation left the table untouched.
        assert_eq!(table.len(), MAX_STREAMS);
    }

    #[test]
    fn offsets_never_regress() {
        let now = Instant::now();
        let mut table = StreamTable::new();
        table.on_received(&frame(0, 0, b"aaaaaaaa", false), now).unwrap();
        let received = table.on_received(&frame(0, 2, b"bb", false), now).unwrap();
        assert!(!received.deliver);
        assert_eq!(table.get(StreamId(0)).unwrap().recv_offset(), 8);
    }

    #[test]
    fn fin_below_received_data_is_violation() {
        let now = Instant::now();
        let mut table = StreamTable::new();
        table.on_received(&frame(0, 0, b"aaaaaaaa", false), now).unwrap();
        assert_matches!(
            table.on_received(&frame(0, 0, b"aa", true), now),
            Err(StreamError::ProtocolViolation)
        );
    }

    #[test]
    fn reset_stream_accepts_nothing_further() {
        let now = Instant::now();
        let mut table = StreamTable::new();
        table.on_received(&frame(4, 0, b"hi", false), now).unwrap();
        table.observe_reset(StreamId(4), 2, now);
        assert_eq!(table.get(StreamId(4)).unwrap().state(), StreamState::Reset);
        let received = table.on_received(&frame(4, 2, b"more", false), now).unwrap();
        assert!(!received.deliver);
        assert_matches!(
            table.prepare_send(StreamId(4), 3, false, now),
            Err(StreamError::ProtocolViolation)
        );
    }

    #[test]
    fn allocate_send_prefers_least_recently_used() {
        let t0 = Instant::now();
        let t1 = t0 + std::time::Duration::from_millis(10);
        let t2 = t1 + std::time::Duration::from_millis(10);
        let mut table = StreamTable::new();
        table.on_received(&frame(0, 0, b"a", false), t0).unwrap();
        table.on_received(&frame(4, 0, b"b", false), t1).unwrap();
        let (id, offset) = table.allocate_send(5, t2).unwrap();
        assert_eq!(id, StreamId(0));
        assert_eq!(offset, 0);
        // Stream 0 is now the most recently used.
        let (id, _) = table.allocate_send(5, t2).unwrap();
        assert_eq!(id, StreamId(4));
    }

    #[test]
    fn allocate_send_creates_when_nothing_open() {
        let now = Instant::now();
        let mut table = StreamTable::new();
        let (id, offset) = table.allocate_send(10, now).unwrap();
        assert_eq!(id, StreamId::new(Side::Server, Dir::Bi, 0));
        assert_eq!(offset, 0);
        let (id2, offset2) = table.allocate_send(10, now).unwrap();
        assert_eq!(id2, id);
        assert_eq!(offset2, 10);
    }

    #[test]
    fn prepare_send_tracks_offsets_and_fin() {
        let now = Instant::now();
        let mut table = StreamTable::new();
        assert_eq!(table.prepare_send(StreamId(8), 4, false, now).unwrap(), 0);
        assert_eq!(table.prepare_send(StreamId(8), 4, true, now).unwrap(), 4);
        assert_matches!(
            table.prepare_send(StreamId(8), 1, false, now),
            Err(StreamError::ProtocolViolation)
        );
    }
}
