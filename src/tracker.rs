//! In-flight packet tracking and retransmission timing.
//!
//! Every sent packet is retained, bytes included, until the peer
//! acknowledges it or the retry budget runs out. A `BTreeMap` keyed by
//! packet number makes ACK-range processing a range query and keeps
//! retransmission scans in ascending packet-number order, which preserves
//! the original send order on the wire.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tracing::trace;

use crate::frame::Ack;
use crate::MAX_RETRIES;

/// Retransmission timeout before any RTT sample exists. Tuned for a
/// geostationary hop, not a terrestrial one.
pub const INITIAL_RTO: Duration = Duration::from_millis(500);
/// Adaptive RTO floor.
pub const MIN_RTO: Duration = Duration::from_millis(200);
/// Adaptive RTO ceiling.
pub const MAX_RTO: Duration = Duration::from_secs(10);

/// A packet number was recorded twice. A caller bug: fatal in debug
/// builds, counted and ignored in release.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[error("packet {0} is already in flight")]
pub struct DuplicateSend(pub u64);

#[derive(Debug, Clone)]
pub struct InFlight {
    pub sent_at: Instant,
    pub retries: u8,
    /// Serialized datagram, retained for replay.
    pub bytes: Bytes,
}

/// Smoothed RTT estimation in the classic srtt/rttvar form.
#[derive(Debug, Default, Clone, Copy)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
}

impl RttEstimator {
    pub fn on_sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let deviation = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = (self.rttvar * 3 + deviation) / 4;
                self.srtt = Some((srtt * 7 + rtt) / 8);
            }
        }
    }

    /// Current retransmission timeout, clamped to [200 ms, 10 s].
    pub fn rto(&self) -> Duration {
        match self.srtt {
            None => INITIAL_RTO,
            Some(srtt) => (srtt + self.rttvar * 4).clamp(MIN_RTO, MAX_RTO),
        }
    }

    pub fn smoothed(&self) -> Option<Duration> {
        self.srtt
    }
}

#[derive(Debug, Default)]
pub struct PacketTracker {
    in_flight: BTreeMap<u64, InFlight>,
    rtt: RttEstimator,
}

impl PacketTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn contains(&self, pn: u64) -> bool {
        self.in_flight.contains_key(&pn)
    }

    pub fn rto(&self) -> Duration {
        self.rtt.rto()
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Retain a sent packet for acknowledgment tracking and replay.
    pub fn record_sent(
        &mut self,
        pn: u64,
        bytes: Bytes,
        now: Instant,
    ) -> Result<(), DuplicateSend> {
        if self.in_flight.contains_key(&pn) {
            debug_assert!(false, "packet {pn} recorded twice");
            return Err(DuplicateSend(pn));
        }
        self.in_flight.insert(
            pn,
            InFlight {
                sent_at: now,
                retries: 0,
                bytes,
            },
        );
        Ok(())
    }

    /// Apply an ACK frame. Every covered packet leaves flight; the newest
    /// newly-acknowledged packet contributes an RTT sample. Returns the
    /// newly acknowledged packet numbers in ascending order. Applying the
    /// same ACK again is a no-op.
    pub fn process_ack(&mut self, ack: &Ack, now: Instant) -> Vec<u64> {
        let mut newly_acked = Vec::new();
        for range in ack.ranges() {
            let covered: Vec<u64> = self
                .in_flight
                .range(range)
                .map(|(&pn, _)| pn)
                .collect();
            newly_acked.extend(covered);
        }
        newly_acked.sort_unstable();

        if let Some(&newest) = newly_acked.last() {
            // Sample only from a packet that was not retransmitted, so the
            // measurement cannot pair a later send with an earlier ACK.
            if let Some(info) = self.in_flight.get(&newest) {
                if info.retries == 0 {
                    self.rtt.on_sample(now.duration_since(info.sent_at));
                }
            }
        }
        for pn in &newly_acked {
            self.in_flight.remove(pn);
        }
        newly_acked
    }

    /// Collect every unacknowledged packet older than `rto`, bumping its
    /// retry count and restamping its send time in the same step so the
    /// caller's send cannot race a second scan.
    ///
    /// Entries are returned in ascending packet-number order with their
    /// post-bump retry count; packets already at the retry cap are not
    /// returned and await [`Self::abandon`].
    pub fn scan_for_retransmit(
        &mut self,
        now: Instant,
        rto: Duration,
    ) -> Vec<(u64, u8, Bytes)> {
        let mut due = Vec::new();
        for (&pn, info) in self.in_flight.iter_mut() {
            if info.retries >= MAX_RETRIES {
                continue;
            }
            if now.duration_since(info.sent_at) > rto {
                info.retries += 1;
                info.sent_at = now;
                due.push((pn, info.retries, info.bytes.clone()));
            }
        }
        if !due.is_empty() {
            trace!(count = due.len(), "retransmission scan");
        }
        due
    }

    /// Drop a packet whose retry budget is exhausted, returning its bytes.
    pub fn abandon(&mut self, pn: u64) -> Option<Bytes> {
        self.in_flight.remove(&pn).map(|info| info.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::AckRange;
    use tinyvec::tiny_vec;

    fn bytes(tag: u8) -> Bytes {
        Bytes::from(vec![tag; 8])
    }

    #[test]
    fn duplicate_send_rejected() {
        let now = Instant::now();
        let mut tracker = PacketTracker::new();
        tracker.record_sent(1, bytes(1), now).unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            tracker.record_sent(1, bytes(1), now)
        }));
        if cfg!(debug_assertions) {
            assert!(result.is_err());
        } else {
            assert_eq!(result.unwrap(), Err(DuplicateSend(1)));
        }
    }

    #[test]
    fn ack_of_unseen_packet_changes_nothing() {
        let now = Instant::now();
        let mut tracker = PacketTracker::new();
        tracker.record_sent(7, bytes(7), now).unwrap();
        let newly = tracker.process_ack(&Ack::single(12), now);
        assert!(newly.is_empty());
        assert!(tracker.contains(7));
        assert_eq!(tracker.in_flight(), 1);
    }

    #[test]
    fn ack_removes_covered_packets() {
        let now = Instant::now();
        let mut tracker = PacketTracker::new();
        for pn in 0..5 {
            tracker.record_sent(pn, bytes(pn as u8), now).unwrap();
        }
        let ack = Ack {
            largest: 4,
            delay: 0,
            first_range: 1,
            additional: tiny_vec![AckRange { gap: 0, len: 0 }],
        };
        // Covers 3..=4 and 1..=1.
        let newly = tracker.process_ack(&ack, now);
        assert_eq!(newly, vec![1, 3, 4]);
        assert!(tracker.contains(0));
        assert!(tracker.contains(2));
        assert_eq!(tracker.in_flight(), 2);
    }

    #[test]
    fn ack_is_idempotent() {
        let now = Instant::now();
        let mut tracker = PacketTracker::new();
        for pn in 0..3 {
            tracker.record_sent(pn, bytes(0), now).unwrap();
        }
        let ack = Ack {
            largest: 2,
            delay: 0,
            first_range: 2,
            additional: tiny_vec![],
        };
        let first = tracker.process_ack(&ack, now);
        assert_eq!(first, vec![0, 1, 2]);
        let rto_after_first = tracker.rto();
        let second = tracker.process_ack(&ack, now);
        assert!(second.is_empty());
        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(tracker.rto(), rto_after_first);
    }

    #[test]
    fn timed_out_packet_is_rescanned_once_per_timeout() {
        let t0 = Instant::now();
        let mut tracker = PacketTracker::new();
        tracker.record_sent(4, bytes(4), t0).unwrap();

        // Not yet due.
        let t_early = t0 + Duration::from_millis(400);
        assert!(tracker.scan_for_retransmit(t_early, INITIAL_RTO).is_empty());

        let t_due = t0 + Duration::from_millis(600);
        let due = tracker.scan_for_retransmit(t_due, INITIAL_RTO);
        assert_eq!(due.len(), 1);
        let (pn, retries, data) = &due[0];
        assert_eq!((*pn, *retries), (4, 1));
        assert_eq!(data, &bytes(4));

        // The send time was restamped, so an immediate re-scan is empty.
        assert!(tracker.scan_for_retransmit(t_due, INITIAL_RTO).is_empty());
    }

    #[test]
    fn retransmissions_preserve_send_order() {
        let t0 = Instant::now();
        let mut tracker = PacketTracker::new();
        for pn in [3u64, 1, 8, 5] {
            // Insertion order does not matter; scans are by packet number.
            let _ = tracker.record_sent(pn, bytes(pn as u8), t0);
        }
        let due = tracker.scan_for_retransmit(t0 + Duration::from_secs(1), INITIAL_RTO);
        let order: Vec<u64> = due.iter().map(|(pn, _, _)| *pn).collect();
        assert_eq!(order, vec![1, 3, 5, 8]);
    }

    #[test]
    fn retry_count_caps_at_ten() {
        let mut now = Instant::now();
        let mut tracker = PacketTracker::new();
        tracker.record_sent(0, bytes(0), now).unwrap();
        for attempt in 1..=MAX_RETRIES {
            now += Duration::from_secs(1);
            let due = tracker.scan_for_retransmit(now, INITIAL_RTO);
            assert_eq!(due.len(), 1);
            assert_eq!(due[0].1, attempt);
        }
        // The eleventh scan yields nothing; the packet awaits abandonment.
        now += Duration::from_secs(1);
        assert!(tracker.scan_for_retransmit(now, INITIAL_RTO).is_empty());
        assert_eq!(tracker.abandon(0), Some(bytes(0)));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn rtt_sample_feeds_rto() {
        let t0 = Instant::now();
        let mut tracker = PacketTracker::new();
        tracker.record_sent(0, bytes(0), t0).unwrap();
        assert_eq!(tracker.rto(), INITIAL_RTO);
        tracker.process_ack(&Ack::single(0), t0 + Duration::from_millis(600));
        let srtt = tracker.rtt().smoothed().unwrap();
        assert_eq!(srtt, Duration::from_millis(600));
        // srtt + 4 * rttvar = 600 + 4 * 300 = 1800 ms.
        assert_eq!(tracker.rto(), Duration::from_millis(1800));
    }

    #[test]
    fn rto_is_clamped() {
        let mut estimator = RttEstimator::default();
        estimator.on_sample(Duration::from_micros(10));
        assert_eq!(estimator.rto(), MIN_RTO);
        let mut estimator = RttEstimator::default();
        for _ in 0..8 {
            estimator.on_sample(Duration::from_secs(30));
        }
        assert_eq!(estimator.rto(), MAX_RTO);
    }

    #[test]
    fn retransmitted_packet_gives_no_rtt_sample() {
        let t0 = Instant::now();
        let mut tracker = PacketTracker::new();
        tracker.record_sent(0, bytes(0), t0).unwrap();
        tracker.scan_for_retransmit(t0 + Duration::from_secs(1), INITIAL_RTO);
        tracker.process_ack(&Ack::single(0), t0 + Duration::from_secs(2));
        assert!(tracker.rtt().smoothed().is_none());
        assert_eq!(tracker.in_flight(), 0);
    }
}
