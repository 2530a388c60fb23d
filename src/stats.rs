//! Operator-visible counters.
//!
//! Counters live on each connection and are summed by the endpoint when a
//! snapshot is requested; nothing here is process-global. The dispatcher
//! keeps its own per-operation counters and contributes them to the same
//! snapshot.

use std::fmt;

use crate::offload::OpSnapshot;
use crate::packet::ParseError;

#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionCounters {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub retransmissions: u64,
}

impl ConnectionCounters {
    pub fn merge(&mut self, other: &Self) {
        self.packets_sent += other.packets_sent;
        self.packets_received += other.packets_received;
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.retransmissions += other.retransmissions;
    }
}

/// Per-kind counts of dropped-datagram causes.
#[derive(Debug, Default, Clone)]
pub struct ValidationCounters([u64; ParseError::KINDS]);

impl ValidationCounters {
    pub fn record(&mut self, kind: ParseError) {
        self.0[kind.index()] += 1;
    }

    pub fn get(&self, kind: ParseError) -> u64 {
        self.0[kind.index()]
    }

    pub fn merge(&mut self, other: &Self) {
        for (slot, value) in self.0.iter_mut().zip(other.0.iter()) {
            *slot += value;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParseError, u64)> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, &count)| count > 0)
            .filter_map(|(i, &count)| ParseError::from_index(i).map(|kind| (kind, count)))
    }
}

/// Point-in-time aggregate over the whole proxy.
#[derive(Debug, Clone)]
pub struct ProxyStats {
    pub active_connections: usize,
    pub total_connections: u64,
    pub counters: ConnectionCounters,
    pub validation: ValidationCounters,
    pub offload: Vec<OpSnapshot>,
}

impl fmt::Display for ProxyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "connections: {} active, {} total",
            self.active_connections, self.total_connections
        )?;
        writeln!(
            f,
            "packets: {} in / {} out ({} retransmitted), bytes: {} in / {} out",
            self.counters.packets_received,
            self.counters.packets_sent,
            self.counters.retransmissions,
            self.counters.bytes_received,
            self.counters.bytes_sent,
        )?;
        for (kind, count) in self.validation.iter() {
            writeln!(f, "dropped ({kind:?}): {count}")?;
        }
        for op in self.offload.iter().filter(|op| op.count > 0) {
            writeln!(
                f,
                "offload {}: {} calls, {} bytes, avg {:?}",
                op.op, op.count, op.bytes, op.avg_latency
            )?;
        }
        Ok(())
    }
}
