//! Client-side peer for exercising the proxy.
//!
//! The emulation harness and the test suite need a QUIC peer that speaks
//! the same restricted wire subset and derives the same deterministic keys.
//! [`TestPeer`] is that peer: it seals outbound packets and opens the
//! proxy's responses using the fixed-salt key schedule, always through the
//! software offload path so its bytes match what the proxy itself would
//! produce.

use bytes::Bytes;

use crate::crypto::{FixedSaltKeyProvider, KeyProvider, KeySet, PacketKey, TAG_LEN};
use crate::frame::{self, Crypto, Frame};
use crate::offload::{OffloadDispatcher, OffloadRequest};
use crate::packet::{self, Header, LongType, PacketNumber};
use crate::{ConnectionId, MIN_INITIAL_SIZE, VERSION};

pub struct TestPeer {
    /// Destination CID for the first flight; seeds Initial keys.
    pub dcid: ConnectionId,
    /// This peer's own CID; the proxy addresses it with this.
    pub scid: ConnectionId,
    initial: KeySet,
    handshake: KeySet,
    application: KeySet,
    next_pn: u64,
    dispatcher: OffloadDispatcher,
}

impl TestPeer {
    pub fn new(dcid: ConnectionId, scid: ConnectionId) -> Self {
        let provider = FixedSaltKeyProvider;
        Self {
            dcid,
            scid,
            initial: provider.initial_keys(&dcid).swapped(),
            handshake: provider.handshake_keys().unwrap().swapped(),
            application: provider.application_keys().unwrap().swapped(),
            next_pn: 0,
            dispatcher: OffloadDispatcher::software_only(),
        }
    }

    /// An Initial datagram carrying one CRYPTO frame, padded to 1200 bytes.
    pub fn initial_crypto(&mut self, data: &[u8]) -> Bytes {
        self.initial_with(&[Frame::Crypto(Crypto {
            offset: 0,
            data: Bytes::copy_from_slice(data),
        })])
    }

    pub fn initial_with(&mut self, frames: &[Frame]) -> Bytes {
        let pn = self.take_pn();
        let header = Header::Initial {
            version: VERSION,
            dst_cid: self.dcid,
            src_cid: self.scid,
            token: Bytes::new(),
            number: PacketNumber::U32(pn as u32),
        };
        let tx = self.initial.tx.clone();
        let mut datagram = self.assemble(header, &tx, pn, frames);
        if datagram.len() < MIN_INITIAL_SIZE {
            datagram.resize(MIN_INITIAL_SIZE, 0);
        }
        Bytes::from(datagram)
    }

    /// A Handshake datagram carrying one CRYPTO frame.
    pub fn handshake_crypto(&mut self, data: &[u8]) -> Bytes {
        let pn = self.take_pn();
        let header = Header::Long {
            ty: LongType::Handshake,
            version: VERSION,
            dst_cid: self.dcid,
            src_cid: self.scid,
            number: PacketNumber::U32(pn as u32),
        };
        let tx = self.handshake.tx.clone();
        let frames = [Frame::Crypto(Crypto {
            offset: 0,
            data: Bytes::copy_from_slice(data),
        })];
        Bytes::from(self.assemble(header, &tx, pn, &frames))
    }

    /// A 1-RTT datagram addressed to `dest` (the proxy's minted CID).
    pub fn one_rtt(&mut self, dest: &ConnectionId, frames: &[Frame]) -> Bytes {
        let pn = self.take_pn();
        let header = Header::Short {
            spin: false,
            dst_cid: *dest,
            number: PacketNumber::U32(pn as u32),
        };
        let tx = self.application.tx.clone();
        Bytes::from(self.assemble(header, &tx, pn, frames))
    }

    /// Decode and open one datagram from the proxy, returning its header
    /// and successfully parsed frames.
    ///
    /// PANICS on undecodable input; tests want the loud failure.
    pub fn open(&self, datagram: &Bytes) -> (Header, Vec<Frame>) {
        let packet = packet::decode(datagram, self.scid.len()).expect("decodable packet");
        let rx = match &packet.header {
            Header::Initial { .. } => &self.initial.rx,
            Header::Long { .. } => &self.handshake.rx,
            Header::Short { .. } => &self.application.rx,
        };
        let pn = packet.header.number().expand(0);
        let aad = datagram.slice(..packet.header_len);
        let plaintext = self
            .dispatcher
            .dispatch_software(OffloadRequest::Open {
                key: rx.key.to_vec(),
                nonce: rx.nonce(pn),
                aad,
                ciphertext: packet.payload,
            })
            .expect("payload opens")
            .data;
        let frames = frame::Iter::new(plaintext)
            .collect::<Result<Vec<_>, _>>()
            .expect("parseable frames");
        (packet.header, frames)
    }

    fn take_pn(&mut self) -> u64 {
        let pn = self.next_pn;
        self.next_pn += 1;
        pn
    }

    fn assemble(
        &self,
        header: Header,
        tx: &PacketKey,
        pn: u64,
        frames: &[Frame],
    ) -> Vec<u8> {
        let mut payload = Vec::new();
        for frame in frames {
            frame.encode(&mut payload);
        }
        let mut datagram = Vec::new();
        header.encode(payload.len() + TAG_LEN, &mut datagram);
        let sealed = self
            .dispatcher
            .dispatch_software(OffloadRequest::Seal {
                key: tx.key.to_vec(),
                nonce: tx.nonce(pn),
                aad: Bytes::copy_from_slice(&datagram),
                plaintext: Bytes::from(payload),
            })
            .expect("seal succeeds")
            .data;
        datagram.extend_from_slice(&sealed);
        datagram
    }
}

/// One-shot helper: a sealed client Initial with a single CRYPTO frame.
pub fn client_initial(
    dcid: &ConnectionId,
    scid: &ConnectionId,
    pn: u64,
    crypto: &[u8],
) -> Bytes {
    let mut peer = TestPeer::new(*dcid, *scid);
    peer.next_pn = pn;
    peer.initial_crypto(crypto)
}
