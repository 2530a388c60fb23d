//! Offload dispatch.
//!
//! Every heavy per-packet transform goes through [`OffloadDispatcher`]: AEAD
//! seal/open, payload compression, outbound packet assembly, and retransmit
//! replay. When an accelerator transport is attached and healthy, requests
//! are submitted to it under a deadline; otherwise the software twin serves
//! them synchronously. The dispatcher never retries — recovery policy
//! belongs to the caller, which can force the software path explicitly.

pub mod compress;
mod sim;
mod software;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tracing::error;

pub use sim::SimulatedAccelerator;
use software::SoftwareBackend;

use crate::crypto::IV_LEN;
use crate::ConnectionId;

/// Default per-request deadline.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(5);

/// A unit of work for the accelerator or its software twin.
#[derive(Debug, Clone)]
pub enum OffloadRequest {
    Seal {
        key: Vec<u8>,
        nonce: [u8; IV_LEN],
        aad: Bytes,
        plaintext: Bytes,
    },
    Open {
        key: Vec<u8>,
        nonce: [u8; IV_LEN],
        aad: Bytes,
        ciphertext: Bytes,
    },
    Compress {
        data: Bytes,
    },
    Decompress {
        data: Bytes,
    },
    /// Assemble a 1-RTT packet around an already-sealed payload.
    FrameOut {
        connection_id: ConnectionId,
        packet_number: u64,
        payload: Bytes,
    },
    /// Assemble an acknowledgment frame for the given largest packet.
    AckOut {
        connection_id: ConnectionId,
        largest: u64,
    },
    /// Replay a previously assembled packet by number.
    Retransmit {
        connection_id: ConnectionId,
        packet_number: u64,
    },
}

impl OffloadRequest {
    pub fn op(&self) -> Op {
        match self {
            Self::Seal { .. } => Op::Seal,
            Self::Open { .. } => Op::Open,
            Self::Compress { .. } => Op::Compress,
            Self::Decompress { .. } => Op::Decompress,
            Self::FrameOut { .. } => Op::FrameOut,
            Self::AckOut { .. } => Op::AckOut,
            Self::Retransmit { .. } => Op::Retransmit,
        }
    }

    fn input_len(&self) -> usize {
        match self {
            Self::Seal { plaintext, .. } => plaintext.len(),
            Self::Open { ciphertext, .. } => ciphertext.len(),
            Self::Compress { data } | Self::Decompress { data } => data.len(),
            Self::FrameOut { payload, .. } => payload.len(),
            Self::AckOut { .. } | Self::Retransmit { .. } => 0,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Op {
    Seal,
    Open,
    Compress,
    Decompress,
    FrameOut,
    AckOut,
    Retransmit,
}

impl Op {
    pub const ALL: [Op; 7] = [
        Op::Seal,
        Op::Open,
        Op::Compress,
        Op::Decompress,
        Op::FrameOut,
        Op::AckOut,
        Op::Retransmit,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Op::Seal => "seal",
            Op::Open => "open",
            Op::Compress => "compress",
            Op::Decompress => "decompress",
            Op::FrameOut => "frame_out",
            Op::AckOut => "ack_out",
            Op::Retransmit => "retransmit",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OffloadResponse {
    pub data: Bytes,
    /// Processing time as measured by whichever backend served the request.
    pub elapsed: Duration,
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum OffloadError {
    #[error("offload request deadline expired")]
    Timeout,
    #[error("accelerator transport fault: {0}")]
    TransportFault(String),
    #[error("AEAD authentication failed")]
    AuthFailed,
    #[error("malformed offload input")]
    Malformed,
}

/// Black-box transport to accelerator hardware.
///
/// Implementations are free to be polled or interrupt-driven internally;
/// the dispatcher only ever awaits the returned future, under a deadline.
/// A request abandoned at its deadline may still complete inside the
/// transport; its result is discarded with the future.
pub trait AcceleratorTransport: Send + Sync {
    fn submit(
        &self,
        request: OffloadRequest,
    ) -> Pin<Box<dyn Future<Output = Result<OffloadResponse, OffloadError>> + Send + '_>>;
}

#[derive(Default)]
struct OpCounter {
    count: AtomicU64,
    bytes: AtomicU64,
    micros: AtomicU64,
}

/// Read-only view of one operation's counters.
#[derive(Debug, Clone, Copy)]
pub struct OpSnapshot {
    pub op: &'static str,
    pub count: u64,
    pub bytes: u64,
    pub avg_latency: Duration,
}

pub struct OffloadDispatcher {
    transport: Option<Arc<dyn AcceleratorTransport>>,
    software: SoftwareBackend,
    deadline: Duration,
    healthy: AtomicBool,
    counters: [OpCounter; 7],
}

impl OffloadDispatcher {
    pub fn new(transport: Option<Arc<dyn AcceleratorTransport>>, deadline: Duration) -> Self {
        Self {
            transport,
            software: SoftwareBackend::new(),
            deadline,
            healthy: AtomicBool::new(true),
            counters: Default::default(),
        }
    }

    /// A dispatcher with no accelerator; every request runs in software.
    pub fn software_only() -> Self {
        Self::new(None, DEFAULT_DEADLINE)
    }

    /// Whether requests are currently routed to the accelerator.
    pub fn accelerated(&self) -> bool {
        self.transport.is_some() && self.healthy.load(Ordering::Relaxed)
    }

    /// Route one request: accelerator when attached and healthy, software
    /// twin otherwise. Deadline expiry and transport errors fail only this
    /// request; the caller chooses whether to retry in software.
    pub async fn dispatch(
        &self,
        request: OffloadRequest,
    ) -> Result<OffloadResponse, OffloadError> {
        let op = request.op();
        let len = request.input_len();
        let start = Instant::now();
        let result = match &self.transport {
            Some(transport) if self.healthy.load(Ordering::Relaxed) => {
                match tokio::time::timeout(self.deadline, transport.submit(request)).await {
                    Err(_) => Err(OffloadError::Timeout),
                    Ok(Err(OffloadError::TransportFault(reason))) => {
                        // One error-level line per fault, then fail over.
                        self.healthy.store(false, Ordering::Relaxed);
                        error!(%reason, "accelerator transport fault, routing to software");
                        Err(OffloadError::TransportFault(reason))
                    }
                    Ok(other) => other,
                }
            }
            _ => software::execute(&self.software, request),
        };
        self.record(op, len, start.elapsed());
        result
    }

    /// Serve one request on the software path unconditionally. This is the
    /// caller's retry lever after an accelerator failure.
    pub fn dispatch_software(
        &self,
        request: OffloadRequest,
    ) -> Result<OffloadResponse, OffloadError> {
        let op = request.op();
        let len = request.input_len();
        let start = Instant::now();
        let result = software::execute(&self.software, request);
        self.record(op, len, start.elapsed());
        result
    }

    fn record(&self, op: Op, bytes: usize, elapsed: Duration) {
        let counter = &self.counters[op as usize];
        counter.count.fetch_add(1, Ordering::Relaxed);
        counter.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        counter
            .micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Vec<OpSnapshot> {
        Op::ALL
            .iter()
            .map(|&op| {
                let counter = &self.counters[op as usize];
                let count = counter.count.load(Ordering::Relaxed);
                let micros = counter.micros.load(Ordering::Relaxed);
                OpSnapshot {
                    op: op.name(),
                    count,
                    bytes: counter.bytes.load(Ordering::Relaxed),
                    avg_latency: if count == 0 {
                        Duration::ZERO
                    } else {
                        Duration::from_micros(micros / count)
                    },
                }
            })
            .collect()
    }
}
