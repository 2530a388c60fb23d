//! Per-connection protocol engine.
//!
//! A [`Connection`] owns its stream table and packet tracker outright and is
//! the only caller of the offload dispatcher. It is driven from exactly two
//! places: [`Connection::on_datagram`] for every routed datagram and
//! [`Connection::tick`] from the maintenance sweep. Outbound datagrams
//! accumulate in an internal queue and are drained with
//! [`Connection::poll_transmit`].
//!
//! Recovery policy for offload faults lives here, not in the dispatcher:
//! seal/open failures retry once on the software path; packet-assembly and
//! replay faults fall back silently to local assembly.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::crypto::{KeyProvider, KeySet, PacketKey, TAG_LEN};
use crate::frame::{self, Crypto, Frame, FrameError, ResetStream, StreamFrame};
use crate::offload::{OffloadDispatcher, OffloadError, OffloadRequest};
use crate::packet::{self, Header, LongType, PacketNumber, ParseError};
use crate::ranges::PacketSet;
use crate::stats::{ConnectionCounters, ValidationCounters};
use crate::streams::{StreamError, StreamId, StreamTable};
use crate::tracker::PacketTracker;
use crate::{ConnectionId, MAX_RETRIES, MIN_INITIAL_SIZE, VERSION};

/// Error code sent in RESET_STREAM when the stream table is full.
const RESET_REFUSED: u16 = 0x0004;

/// Opaque server handshake bytes carried in CRYPTO responses. A real TLS
/// stack would supply these through the key provider's side channel.
const CRYPTO_FILL: [u8; 16] = [
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
    0x10,
];

/// One datagram ready for the UDP socket.
#[derive(Debug, Clone)]
pub struct Transmit {
    pub dest: SocketAddr,
    pub contents: Bytes,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum State {
    /// Initial/Handshake exchange still in progress.
    Handshaking,
    /// 1-RTT keys in use.
    Established,
    /// Locally closed; awaiting reap.
    Closed,
    /// Retry budget exhausted on some packet; awaiting reap.
    Lost,
}

struct PendingSend {
    stream: Option<StreamId>,
    data: Bytes,
    fin: bool,
}

pub struct Connection {
    remote: SocketAddr,
    /// CID we minted; the peer addresses us with it.
    local_cid: ConnectionId,
    /// Peer's source CID; goes in the destination field of our sends.
    remote_cid: ConnectionId,
    /// The client's first destination CID: routes early datagrams and
    /// seeds Initial key derivation.
    init_cid: ConnectionId,
    state: State,
    next_pn: u64,
    largest_recv: Option<u64>,
    received: PacketSet,
    /// Received numbers advanced since the last acknowledgment went out.
    ack_outstanding: bool,
    initial_responded: bool,
    handshake_responded: bool,
    last_activity: Instant,
    keys: Arc<dyn KeyProvider>,
    initial_keys: KeySet,
    handshake_keys: Option<KeySet>,
    app_keys: Option<KeySet>,
    streams: StreamTable,
    tracker: PacketTracker,
    accelerated: bool,
    echo: bool,
    counters: ConnectionCounters,
    validation: ValidationCounters,
    outgoing: VecDeque<Transmit>,
    app_data: VecDeque<(StreamId, Bytes)>,
    /// Writes held back until application keys exist.
    pending_send: VecDeque<PendingSend>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        remote: SocketAddr,
        local_cid: ConnectionId,
        init_cid: ConnectionId,
        remote_cid: ConnectionId,
        keys: Arc<dyn KeyProvider>,
        accelerated: bool,
        echo: bool,
        now: Instant,
    ) -> Self {
        let initial_keys = keys.initial_keys(&init_cid);
        Self {
            remote,
            local_cid,
            remote_cid,
            init_cid,
            state: State::Handshaking,
            next_pn: 0,
            largest_recv: None,
            received: PacketSet::new(),
            ack_outstanding: false,
            initial_responded: false,
            handshake_responded: false,
            last_activity: now,
            keys,
            initial_keys,
            handshake_keys: None,
            app_keys: None,
            streams: StreamTable::new(),
            tracker: PacketTracker::new(),
            accelerated,
            echo,
            counters: ConnectionCounters::default(),
            validation: ValidationCounters::default(),
            outgoing: VecDeque::new(),
            app_data: VecDeque::new(),
            pending_send: VecDeque::new(),
        }
    }

    pub fn local_cid(&self) -> &ConnectionId {
        &self.local_cid
    }

    pub fn init_cid(&self) -> &ConnectionId {
        &self.init_cid
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_established(&self) -> bool {
        self.state == State::Established
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, State::Closed | State::Lost)
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(self.last_activity)
    }

    pub fn counters(&self) -> &ConnectionCounters {
        &self.counters
    }

    pub fn validation(&self) -> &ValidationCounters {
        &self.validation
    }

    pub fn streams(&self) -> &StreamTable {
        &self.streams
    }

    pub fn tracker(&self) -> &PacketTracker {
        &self.tracker
    }

    /// Flip accelerator routing for this connection's future requests.
    pub fn set_accelerated(&mut self, accelerated: bool) {
        self.accelerated = accelerated;
    }

    /// Next outbound datagram, if any.
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.outgoing.pop_front()
    }

    /// Next chunk of received application data, if any.
    pub fn poll_app_data(&mut self) -> Option<(StreamId, Bytes)> {
        self.app_data.pop_front()
    }

    fn use_accel(&self, dispatcher: &OffloadDispatcher) -> bool {
        self.accelerated && dispatcher.accelerated()
    }

    /// Process one datagram addressed to this connection.
    pub async fn on_datagram(
        &mut self,
        datagram: Bytes,
        now: Instant,
        dispatcher: &OffloadDispatcher,
    ) {
        if self.is_terminal() {
            return;
        }
        self.counters.packets_received += 1;
        self.counters.bytes_received += datagram.len() as u64;

        let packet = match packet::decode(&datagram, self.local_cid.len()) {
            Ok(packet) => packet,
            Err(kind) => {
                self.validation.record(kind);
                debug!(peer = %self.remote, error = %kind, "dropping undecodable datagram");
                return;
            }
        };
        if let Err(kind) = packet.header.validate(&self.local_cid, Some(&self.init_cid)) {
            self.validation.record(kind);
            debug!(peer = %self.remote, error = %kind, "dropping datagram failing validation");
            return;
        }
        self.last_activity = now;

        let expected = self.largest_recv.map_or(0, |pn| pn + 1);
        let pn = packet.header.number().expand(expected);
        if self.received.contains(pn) {
            trace!(pn, "duplicate packet");
            return;
        }

        let rx_key = match &packet.header {
            Header::Initial { .. } => self.initial_keys.rx.clone(),
            Header::Long {
                ty: LongType::Handshake,
                ..
            } => match self.cached_handshake_keys() {
                Some(keys) => keys.rx.clone(),
                None => {
                    debug!(pn, "handshake keys unavailable, dropping");
                    return;
                }
            },
            Header::Long { ty, .. } => {
                trace!(?ty, "unsupported long packet type");
                return;
            }
            Header::Short { .. } => match self.cached_app_keys() {
                Some(keys) => keys.rx.clone(),
                None => {
                    debug!(pn, "application keys unavailable, dropping");
                    return;
                }
            },
        };

        let aad = datagram.slice(..packet.header_len);
        let plaintext = match self
            .open_payload(dispatcher, &rx_key, pn, aad, packet.payload)
            .await
        {
            Ok(plaintext) => plaintext,
            Err(error) => {
                debug!(pn, %error, "payload did not open, dropping");
                return;
            }
        };
        // Authenticated: only now does the number count as received.
        self.received.insert(pn);
        self.largest_recv = Some(self.largest_recv.map_or(pn, |largest| largest.max(pn)));

        match packet.header {
            Header::Initial { src_cid, .. } => {
                // Adopt the peer's SCID the first time we see it.
                self.remote_cid = src_cid;
                self.on_initial(plaintext, now, dispatcher).await;
            }
            Header::Long { .. } => self.on_handshake(plaintext, now, dispatcher).await,
            Header::Short { .. } => self.on_one_rtt(plaintext, now, dispatcher).await,
        }
    }

    async fn on_initial(
        &mut self,
        plaintext: Bytes,
        now: Instant,
        dispatcher: &OffloadDispatcher,
    ) {
        let mut saw_crypto = false;
        for result in frame::Iter::new(plaintext) {
            match result {
                Ok(Frame::Crypto(crypto)) => {
                    trace!(len = crypto.data.len(), "client initial crypto");
                    saw_crypto = true;
                }
                Ok(Frame::Ack(ack)) => {
                    self.tracker.process_ack(&ack, now);
                }
                Ok(Frame::Padding | Frame::Ping) => {}
                Ok(other) => trace!(ty = ?other.ty(), "ignoring frame in initial packet"),
                Err(error) => {
                    self.record_frame_error(error);
                    break;
                }
            }
        }
        if saw_crypto && !self.initial_responded {
            let mut payload = Vec::new();
            Crypto {
                offset: 0,
                data: Bytes::from_static(&CRYPTO_FILL),
            }
            .encode(&mut payload);
            let keys = self.initial_keys.tx.clone();
            if self
                .send_long(LongType::Initial, &keys, payload, true, now, dispatcher)
                .await
            {
                self.initial_responded = true;
            }
        }
    }

    async fn on_handshake(
        &mut self,
        plaintext: Bytes,
        now: Instant,
        dispatcher: &OffloadDispatcher,
    ) {
        let mut saw_crypto = false;
        for result in frame::Iter::new(plaintext) {
            match result {
                Ok(Frame::Crypto(_)) => saw_crypto = true,
                Ok(Frame::Ack(ack)) => {
                    self.tracker.process_ack(&ack, now);
                }
                Ok(Frame::Padding | Frame::Ping) => {}
                Ok(other) => trace!(ty = ?other.ty(), "ignoring frame in handshake packet"),
                Err(error) => {
                    self.record_frame_error(error);
                    break;
                }
            }
        }
        if saw_crypto && !self.handshake_responded {
            let Some(keys) = self.cached_handshake_keys().map(|k| k.tx.clone()) else {
                return;
            };
            let mut payload = Vec::new();
            Crypto {
                offset: 0,
                data: Bytes::from_static(&CRYPTO_FILL),
            }
            .encode(&mut payload);
            if self
                .send_long(LongType::Handshake, &keys, payload, false, now, dispatcher)
                .await
            {
                self.handshake_responded = true;
            }
            // The handshake milestone: application keys apply from here.
            self.state = State::Established;
            let mut done = Vec::new();
            Frame::HandshakeDone.encode(&mut done);
            self.send_one_rtt(done, false, now, dispatcher).await;
            self.flush_pending(now, dispatcher).await;
        }
    }

    async fn on_one_rtt(&mut self, plaintext: Bytes, now: Instant, dispatcher: &OffloadDispatcher) {
        let mut ack_eliciting = false;
        let mut echoes: Vec<(StreamId, Bytes, bool)> = Vec::new();
        let mut refusals: Vec<StreamId> = Vec::new();

        for result in frame::Iter::new(plaintext) {
            match result {
                Ok(Frame::Ack(ack)) => {
                    let newly = self.tracker.process_ack(&ack, now);
                    if !newly.is_empty() {
                        trace!(?newly, "packets acknowledged");
                    }
                }
                Ok(Frame::Stream(stream)) => {
                    ack_eliciting = true;
                    match self.streams.on_received(&stream, now) {
                        Ok(received) => {
                            if received.deliver {
                                self.app_data.push_back((stream.id, stream.data.clone()));
                                if self.echo {
                                    echoes.push((stream.id, stream.data.clone(), false));
                                }
                            }
                        }
                        Err(StreamError::CapacityExceeded) => {
                            debug!(stream = %stream.id, "stream table full, refusing");
                            refusals.push(stream.id);
                        }
                        Err(StreamError::ProtocolViolation) => {
                            debug!(stream = %stream.id, "dropping stream frame violating state");
                        }
                    }
                }
                Ok(Frame::ResetStream(reset)) => {
                    ack_eliciting = true;
                    self.streams.observe_reset(reset.id, reset.final_size, now);
                }
                Ok(Frame::Crypto(_) | Frame::Ping) => ack_eliciting = true,
                Ok(Frame::Padding | Frame::HandshakeDone) => {}
                Ok(Frame::Close(close)) => {
                    debug!(code = close.error_code, "peer closed connection");
                    self.state = State::Closed;
                    return;
                }
                Err(error) => {
                    self.record_frame_error(error);
                    break;
                }
            }
        }

        for id in refusals {
            let mut payload = Vec::new();
            ResetStream {
                id,
                error_code: RESET_REFUSED,
                final_size: 0,
            }
            .encode(&mut payload);
            self.send_one_rtt(payload, false, now, dispatcher).await;
        }
        for (id, data, fin) in echoes {
            self.send_application(Some(id), data, fin, now, dispatcher).await;
        }
        if ack_eliciting {
            self.ack_outstanding = true;
        }
        if self.ack_outstanding {
            self.send_ack(now, dispatcher).await;
        }
    }

    /// Queue application data onto a stream. With no stream given, the
    /// least-recently-used open stream takes it. Data sent before
    /// application keys exist is held and flushed on the next key advance.
    pub async fn send_application(
        &mut self,
        stream: Option<StreamId>,
        data: Bytes,
        fin: bool,
        now: Instant,
        dispatcher: &OffloadDispatcher,
    ) {
        if self.is_terminal() {
            debug!("discarding write on terminal connection");
            return;
        }
        if self.state != State::Established || self.cached_app_keys().is_none() {
            trace!("keys unavailable, queueing application data");
            self.pending_send.push_back(PendingSend { stream, data, fin });
            return;
        }
        let allocation = match stream {
            Some(id) => self
                .streams
                .prepare_send(id, data.len(), fin, now)
                .map(|offset| (id, offset)),
            None => {
                let allocated = self.streams.allocate_send(data.len(), now);
                if let (true, Ok((id, _))) = (fin, &allocated) {
                    self.streams.mark_fin_sent(*id);
                }
                allocated
            }
        };
        let (id, offset) = match allocation {
            Ok(allocation) => allocation,
            Err(error) => {
                debug!(%error, "cannot allocate stream for send");
                return;
            }
        };
        let mut payload = Vec::new();
        StreamFrame {
            id,
            offset: (offset > 0).then_some(offset),
            fin,
            data,
        }
        .encode(&mut payload);
        self.send_one_rtt(payload, true, now, dispatcher).await;
    }

    /// Explicitly close: tell the peer and go terminal.
    pub async fn close(&mut self, now: Instant, dispatcher: &OffloadDispatcher) {
        if self.is_terminal() {
            return;
        }
        if self.state == State::Established {
            let mut payload = Vec::new();
            Frame::Close(frame::ConnectionClose {
                error_code: 0,
                reason: Bytes::from_static(b"closing"),
            })
            .encode(&mut payload);
            self.send_one_rtt(payload, false, now, dispatcher).await;
        }
        self.state = State::Closed;
    }

    /// Timer-driven maintenance: flush key-blocked writes and retransmit
    /// overdue packets. Abandons packets at the retry cap and declares the
    /// connection lost.
    pub async fn tick(&mut self, now: Instant, dispatcher: &OffloadDispatcher) {
        if self.is_terminal() {
            return;
        }
        if self.state == State::Established && !self.pending_send.is_empty() {
            self.flush_pending(now, dispatcher).await;
        }

        let rto = self.tracker.rto();
        let due = self.tracker.scan_for_retransmit(now, rto);
        for (pn, retries, bytes) in due {
            let datagram = if self.use_accel(dispatcher) {
                match dispatcher
                    .dispatch(OffloadRequest::Retransmit {
                        connection_id: self.remote_cid,
                        packet_number: pn,
                    })
                    .await
                {
                    Ok(response) => response.data,
                    Err(_) => bytes.clone(),
                }
            } else {
                bytes.clone()
            };
            trace!(pn, retries, "retransmitting");
            self.counters.retransmissions += 1;
            self.queue_transmit(datagram);

            if retries >= MAX_RETRIES {
                self.tracker.abandon(pn);
                warn!(pn, "retry budget exhausted, connection lost");
                self.streams.reset_all();
                self.state = State::Lost;
                return;
            }
        }
    }

    async fn flush_pending(&mut self, now: Instant, dispatcher: &OffloadDispatcher) {
        if self.cached_app_keys().is_none() {
            return;
        }
        let pending: Vec<PendingSend> = self.pending_send.drain(..).collect();
        for item in pending {
            Box::pin(self.send_application(item.stream, item.data, item.fin, now, dispatcher))
                .await;
        }
    }

    async fn send_ack(&mut self, now: Instant, dispatcher: &OffloadDispatcher) {
        let Some(largest) = self.received.largest() else {
            return;
        };
        let frame = match dispatcher
            .dispatch(OffloadRequest::AckOut {
                connection_id: self.remote_cid,
                largest,
            })
            .await
        {
            Ok(response) => response.data,
            Err(error) => {
                trace!(%error, "ack assembly fell back to software");
                match dispatcher.dispatch_software(OffloadRequest::AckOut {
                    connection_id: self.remote_cid,
                    largest,
                }) {
                    Ok(response) => response.data,
                    Err(_) => return,
                }
            }
        };
        if self.send_one_rtt(frame.to_vec(), false, now, dispatcher).await {
            self.ack_outstanding = false;
        }
    }

    /// Seal and send one 1-RTT packet. `track` marks it in-flight for
    /// retransmission; acknowledgment-only packets stay untracked so they
    /// cannot retransmit forever on their own.
    async fn send_one_rtt(
        &mut self,
        payload: Vec<u8>,
        track: bool,
        now: Instant,
        dispatcher: &OffloadDispatcher,
    ) -> bool {
        let Some(tx) = self.cached_app_keys().map(|keys| keys.tx.clone()) else {
            trace!("application keys unavailable, dropping outbound packet");
            return false;
        };
        let pn = self.next_pn;
        let header = Header::Short {
            spin: false,
            dst_cid: self.remote_cid,
            number: PacketNumber::U32(pn as u32),
        };
        let mut aad = Vec::new();
        header.encode(payload.len() + TAG_LEN, &mut aad);

        let sealed = match self
            .seal_payload(dispatcher, &tx, pn, Bytes::from(aad), payload.into())
            .await
        {
            Ok(sealed) => sealed,
            Err(error) => {
                debug!(%error, "seal failed, dropping outbound packet");
                return false;
            }
        };

        let request = OffloadRequest::FrameOut {
            connection_id: self.remote_cid,
            packet_number: pn,
            payload: sealed,
        };
        let datagram = match dispatcher.dispatch(request.clone()).await {
            Ok(response) => response.data,
            Err(error) => {
                trace!(%error, "packet assembly fell back to software");
                match dispatcher.dispatch_software(request) {
                    Ok(response) => response.data,
                    Err(error) => {
                        debug!(%error, "packet assembly failed");
                        return false;
                    }
                }
            }
        };

        self.next_pn += 1;
        if track {
            if let Err(error) = self.tracker.record_sent(pn, datagram.clone(), now) {
                warn!(%error, "packet tracking inconsistency");
            }
        }
        self.queue_transmit(datagram);
        true
    }

    /// Seal and send one long-header packet; `pad` stretches the datagram
    /// to the 1200-byte Initial minimum.
    async fn send_long(
        &mut self,
        ty: LongType,
        tx: &PacketKey,
        payload: Vec<u8>,
        pad: bool,
        now: Instant,
        dispatcher: &OffloadDispatcher,
    ) -> bool {
        let pn = self.next_pn;
        let number = PacketNumber::U32(pn as u32);
        let header = match ty {
            LongType::Initial => Header::Initial {
                version: VERSION,
                dst_cid: self.remote_cid,
                src_cid: self.local_cid,
                token: Bytes::new(),
                number,
            },
            ty => Header::Long {
                ty,
                version: VERSION,
                dst_cid: self.remote_cid,
                src_cid: self.local_cid,
                number,
            },
        };
        let mut buf = Vec::new();
        header.encode(payload.len() + TAG_LEN, &mut buf);
        let aad = Bytes::copy_from_slice(&buf);

        let sealed = match self
            .seal_payload(dispatcher, tx, pn, aad, payload.into())
            .await
        {
            Ok(sealed) => sealed,
            Err(error) => {
                debug!(%error, "seal failed, dropping outbound packet");
                return false;
            }
        };
        buf.extend_from_slice(&sealed);
        if pad && buf.len() < MIN_INITIAL_SIZE {
            buf.resize(MIN_INITIAL_SIZE, 0);
        }

        self.next_pn += 1;
        let datagram = Bytes::from(buf);
        if let Err(error) = self.tracker.record_sent(pn, datagram.clone(), now) {
            warn!(%error, "packet tracking inconsistency");
        }
        self.queue_transmit(datagram);
        true
    }

    async fn seal_payload(
        &self,
        dispatcher: &OffloadDispatcher,
        key: &PacketKey,
        pn: u64,
        aad: Bytes,
        plaintext: Bytes,
    ) -> Result<Bytes, OffloadError> {
        let request = OffloadRequest::Seal {
            key: key.key.to_vec(),
            nonce: key.nonce(pn),
            aad,
            plaintext,
        };
        match dispatcher.dispatch(request.clone()).await {
            Ok(response) => Ok(response.data),
            Err(error) if self.use_accel(dispatcher) => {
                debug!(%error, "seal retrying on the software path");
                dispatcher.dispatch_software(request).map(|r| r.data)
            }
            Err(error) => Err(error),
        }
    }

    async fn open_payload(
        &self,
        dispatcher: &OffloadDispatcher,
        key: &PacketKey,
        pn: u64,
        aad: Bytes,
        ciphertext: Bytes,
    ) -> Result<Bytes, OffloadError> {
        let request = OffloadRequest::Open {
            key: key.key.to_vec(),
            nonce: key.nonce(pn),
            aad,
            ciphertext,
        };
        match dispatcher.dispatch(request.clone()).await {
            Ok(response) => Ok(response.data),
            Err(error) if self.use_accel(dispatcher) => {
                debug!(%error, "open retrying on the software path");
                dispatcher.dispatch_software(request).map(|r| r.data)
            }
            Err(error) => Err(error),
        }
    }

    fn record_frame_error(&mut self, error: FrameError) {
        let kind = match error {
            FrameError::InvalidType(_) => ParseError::InvalidFrameType,
            FrameError::UnexpectedEnd | FrameError::Malformed => ParseError::InvalidPacketSize,
        };
        self.validation.record(kind);
        debug!(%error, "dropping rest of datagram");
    }

    fn queue_transmit(&mut self, contents: Bytes) {
        self.counters.packets_sent += 1;
        self.counters.bytes_sent += contents.len() as u64;
        self.outgoing.push_back(Transmit {
            dest: self.remote,
            contents,
        });
    }

    fn cached_handshake_keys(&mut self) -> Option<&KeySet> {
        if self.handshake_keys.is_none() {
            self.handshake_keys = self.keys.handshake_keys();
        }
        self.handshake_keys.as_ref()
    }

    fn cached_app_keys(&mut self) -> Option<&KeySet> {
        if self.app_keys.is_none() {
            self.app_keys = self.keys.application_keys();
        }
        self.app_keys.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::FixedSaltKeyProvider;
    use crate::offload::OffloadDispatcher;
    use crate::testing;

    fn localhost() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9000))
    }

    fn new_connection(now: Instant) -> Connection {
        Connection::new(
            localhost(),
            ConnectionId::random(crate::LOCAL_CID_LEN),
            ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]),
            ConnectionId::new(&[9, 9, 9, 9]),
            Arc::new(FixedSaltKeyProvider),
            false,
            true,
            now,
        )
    }

    #[tokio::test]
    async fn initial_crypto_gets_a_padded_response() {
        let now = Instant::now();
        let dispatcher = OffloadDispatcher::software_only();
        let mut conn = new_connection(now);
        let datagram = testing::client_initial(
            &ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]),
            &ConnectionId::new(&[9, 9, 9, 9]),
            0,
            &[0xaa, 0xbb, 0xcc, 0xdd],
        );
        conn.on_datagram(datagram, now, &dispatcher).await;

        let transmit = conn.poll_transmit().expect("initial response");
        assert_eq!(transmit.contents.len(), MIN_INITIAL_SIZE);
        assert_eq!(conn.counters().packets_sent, 1);
        let packet = packet::decode(&transmit.contents, 8).unwrap();
        match packet.header {
            Header::Initial { dst_cid, src_cid, .. } => {
                // Response addresses the peer by its SCID.
                assert_eq!(&dst_cid[..], &[9, 9, 9, 9]);
                assert_eq!(src_cid, *conn.local_cid());
            }
            other => panic!("unexpected header {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_datagram_counted_not_fatal() {
        let now = Instant::now();
        let dispatcher = OffloadDispatcher::software_only();
        let mut conn = new_connection(now);
        conn.on_datagram(Bytes::from_static(&[0x70, 0, 0, 0]), now, &dispatcher)
            .await;
        assert_eq!(conn.validation().get(ParseError::InvalidPacketType), 1);
        assert!(!conn.is_terminal());
    }

    #[tokio::test]
    async fn writes_queue_until_keys_available() {
        struct NoAppKeys;
        impl KeyProvider for NoAppKeys {
            fn initial_keys(&self, client_dcid: &ConnectionId) -> KeySet {
                FixedSaltKeyProvider.initial_keys(client_dcid)
            }
            fn handshake_keys(&self) -> Option<KeySet> {
                None
            }
            fn application_keys(&self) -> Option<KeySet> {
                None
            }
        }

        let now = Instant::now();
        let dispatcher = OffloadDispatcher::software_only();
        let mut conn = Connection::new(
            localhost(),
            ConnectionId::random(crate::LOCAL_CID_LEN),
            ConnectionId::new(&[1; 8]),
            ConnectionId::new(&[2; 8]),
            Arc::new(NoAppKeys),
            false,
            false,
            now,
        );
        conn.send_application(None, Bytes::from_static(b"hi"), false, now, &dispatcher)
            .await;
        assert!(conn.poll_transmit().is_none());
        assert_eq!(conn.counters().packets_sent, 0);
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let now = Instant::now();
        let dispatcher = OffloadDispatcher::software_only();
        let mut conn = new_connection(now);
        conn.close(now, &dispatcher).await;
        assert!(conn.is_terminal());
        // Writes and datagrams after close are discarded.
        conn.send_application(None, Bytes::from_static(b"late"), false, now, &dispatcher)
            .await;
        assert!(conn.poll_transmit().is_none());
    }

    #[tokio::test]
    async fn lost_after_retry_budget() {
        let now = Instant::now();
        let dispatcher = OffloadDispatcher::software_only();
        let mut conn = new_connection(now);
        let datagram = testing::client_initial(
            &ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]),
            &ConnectionId::new(&[9, 9, 9, 9]),
            0,
            &[0x01],
        );
        conn.on_datagram(datagram, now, &dispatcher).await;
        assert!(conn.poll_transmit().is_some());

        // Never acknowledge; march time forward through every retry.
        let mut at = now;
        for _ in 0..=MAX_RETRIES {
            at += Duration::from_secs(11);
            conn.tick(at, &dispatcher).await;
        }
        assert!(conn.is_terminal());
        assert_eq!(conn.counters().retransmissions, MAX_RETRIES as u64);
    }
}
