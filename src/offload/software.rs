//! Software twin of the accelerator.
//!
//! Produces byte-identical results to the hardware path for every
//! operation, which is what lets the dispatcher swap between them without
//! the engine noticing. Packet assembly mirrors the accelerator's fixed
//! choices: four-byte packet numbers and a spin-free short header.
//! Assembled packets are retained in a bounded replay buffer so
//! retransmit-by-packet-number works here exactly as it does in gateware.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use bytes::Bytes;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use rustc_hash::FxHashMap;

use super::{compress, OffloadError, OffloadRequest, OffloadResponse};
use crate::crypto::{IV_LEN, KEY_LEN};
use crate::frame::Ack;
use crate::packet::{Header, PacketNumber};
use crate::ConnectionId;

/// Packets the software path keeps available for replay.
const REPLAY_DEPTH: usize = 256;

#[derive(Default)]
pub(crate) struct SoftwareBackend {
    replay: Mutex<ReplayBuffer>,
}

impl SoftwareBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

/// Run one request synchronously on the software path.
pub(crate) fn execute(
    backend: &SoftwareBackend,
    request: OffloadRequest,
) -> Result<OffloadResponse, OffloadError> {
    let start = Instant::now();
    let data = match request {
        OffloadRequest::Seal {
            key,
            nonce,
            aad,
            plaintext,
        } => seal(&key, &nonce, &aad, &plaintext)?,
        OffloadRequest::Open {
            key,
            nonce,
            aad,
            ciphertext,
        } => open(&key, &nonce, &aad, &ciphertext)?,
        OffloadRequest::Compress { data } => compress::compress(&data),
        OffloadRequest::Decompress { data } => {
            compress::decompress(&data).map_err(|_| OffloadError::Malformed)?
        }
        OffloadRequest::FrameOut {
            connection_id,
            packet_number,
            payload,
        } => {
            let packet = assemble(&connection_id, packet_number, &payload);
            backend
                .replay
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .store(connection_id, packet_number, Bytes::from(packet.clone()));
            packet
        }
        OffloadRequest::AckOut { largest, .. } => {
            let mut frame = Vec::with_capacity(10);
            Ack::single(largest).encode(&mut frame);
            frame
        }
        OffloadRequest::Retransmit {
            connection_id,
            packet_number,
        } => backend
            .replay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .fetch(&connection_id, packet_number)
            .ok_or(OffloadError::Malformed)?
            .to_vec(),
    };
    Ok(OffloadResponse {
        data: Bytes::from(data),
        elapsed: start.elapsed(),
    })
}

fn aead_key(key: &[u8]) -> Result<LessSafeKey, OffloadError> {
    if key.len() != KEY_LEN {
        return Err(OffloadError::Malformed);
    }
    let unbound =
        UnboundKey::new(&aead::AES_128_GCM, key).map_err(|_| OffloadError::Malformed)?;
    Ok(LessSafeKey::new(unbound))
}

fn seal(
    key: &[u8],
    nonce: &[u8; IV_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, OffloadError> {
    let key = aead_key(key)?;
    let mut buf = plaintext.to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(*nonce),
        Aad::from(aad),
        &mut buf,
    )
    .map_err(|_| OffloadError::Malformed)?;
    Ok(buf)
}

fn open(
    key: &[u8],
    nonce: &[u8; IV_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, OffloadError> {
    let key = aead_key(key)?;
    let mut buf = ciphertext.to_vec();
    let plaintext = key
        .open_in_place(Nonce::assume_unique_for_key(*nonce), Aad::from(aad), &mut buf)
        .map_err(|_| OffloadError::AuthFailed)?;
    Ok(plaintext.to_vec())
}

/// One-RTT packet assembly: short header with a full-width packet number,
/// then the sealed payload.
fn assemble(dst_cid: &ConnectionId, packet_number: u64, payload: &[u8]) -> Vec<u8> {
    let header = Header::Short {
        spin: false,
        dst_cid: *dst_cid,
        number: PacketNumber::U32(packet_number as u32),
    };
    let mut buf = Vec::with_capacity(1 + dst_cid.len() + 4 + payload.len());
    header.encode(payload.len(), &mut buf);
    buf.extend_from_slice(payload);
    buf
}

#[derive(Default)]
struct ReplayBuffer {
    packets: FxHashMap<(ConnectionId, u64), Bytes>,
    order: VecDeque<(ConnectionId, u64)>,
}

impl ReplayBuffer {
    fn store(&mut self, cid: ConnectionId, pn: u64, packet: Bytes) {
        if self.packets.insert((cid, pn), packet).is_none() {
            self.order.push_back((cid, pn));
            while self.order.len() > REPLAY_DEPTH {
                if let Some(evicted) = self.order.pop_front() {
                    self.packets.remove(&evicted);
                }
            }
        }
    }

    fn fetch(&self, cid: &ConnectionId, pn: u64) -> Option<Bytes> {
        self.packets.get(&(*cid, pn)).cloned()
    }
}
