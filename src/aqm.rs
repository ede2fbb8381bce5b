//! RED (random early detection) active queue management.
//!
//! [`RedQueue`] is the per-class buffer every work-conserving scheduler in
//! this crate builds on: a FIFO of [`Pkt`] bounded by physical capacity,
//! with probabilistic early drop driven by an EWMA of queue occupancy and a
//! gentle-RED adjustment that spreads drops out over runs of accepts.

use crate::{Error, Pkt};
use color_eyre::eyre::{ensure, Report};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// RED drop-curve parameters. Validated on construction: thresholds must
/// satisfy `0 < min < max <= capacity`, probabilities and weights must be in
/// `(0, 1]`.
#[derive(Clone, Copy, Debug)]
pub struct RedParams {
    min_threshold_bytes: u64,
    max_threshold_bytes: u64,
    max_probability: f64,
    ewma_weight: f64,
    capacity_bytes: u64,
}

impl RedParams {
    pub fn new(
        min_threshold_bytes: u64,
        max_threshold_bytes: u64,
        max_probability: f64,
        ewma_weight: f64,
        capacity_bytes: u64,
    ) -> Result<Self, Report> {
        ensure!(
            min_threshold_bytes > 0 && min_threshold_bytes < max_threshold_bytes,
            Error::InvalidConfig(format!(
                "RED thresholds must satisfy 0 < min < max, got {} / {}",
                min_threshold_bytes, max_threshold_bytes
            ))
        );
        ensure!(
            max_threshold_bytes <= capacity_bytes,
            Error::InvalidConfig(format!(
                "RED max threshold {} exceeds capacity {}",
                max_threshold_bytes, capacity_bytes
            ))
        );
        ensure!(
            max_probability > 0.0 && max_probability <= 1.0,
            Error::InvalidConfig(format!("RED max probability {} not in (0, 1]", max_probability))
        );
        ensure!(
            ewma_weight > 0.0 && ewma_weight <= 1.0,
            Error::InvalidConfig(format!("RED ewma weight {} not in (0, 1]", ewma_weight))
        );
        Ok(Self {
            min_threshold_bytes,
            max_threshold_bytes,
            max_probability,
            ewma_weight,
            capacity_bytes,
        })
    }

    pub fn min_threshold_bytes(&self) -> u64 {
        self.min_threshold_bytes
    }

    pub fn max_threshold_bytes(&self) -> u64 {
        self.max_threshold_bytes
    }

    pub fn max_probability(&self) -> f64 {
        self.max_probability
    }

    pub fn ewma_weight(&self) -> f64 {
        self.ewma_weight
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }
}

/// Monotonic per-queue counters. Accepted packets equal
/// `enqueued = attempts - dropped_red - dropped_overflow`.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped_red: u64,
    pub dropped_overflow: u64,
}

/// A FIFO packet buffer governed by gentle RED.
#[derive(Debug)]
pub struct RedQueue {
    params: RedParams,
    buf: VecDeque<Pkt>,
    cur_bytes: u64,
    avg_bytes: f64,
    accepts_since_drop: u64,
    rng: StdRng,
    seed: u64,
    stats: QueueStats,
}

impl RedQueue {
    /// Build a queue seeded from entropy, so co-located queues do not share
    /// drop patterns.
    pub fn new(params: RedParams) -> Self {
        Self::with_seed(params, rand::random())
    }

    /// Build a queue with a fixed RNG seed. The seed is observable via
    /// [`RedQueue::seed`] so a drop sequence can be replayed.
    pub fn with_seed(params: RedParams, seed: u64) -> Self {
        Self {
            params,
            buf: VecDeque::new(),
            cur_bytes: 0,
            avg_bytes: 0.0,
            accepts_since_drop: 0,
            rng: StdRng::seed_from_u64(seed),
            seed,
            stats: QueueStats::default(),
        }
    }

    fn update_average(&mut self) {
        let w = self.params.ewma_weight;
        self.avg_bytes = (1.0 - w) * self.avg_bytes + w * self.cur_bytes as f64;
    }

    fn base_drop_probability(&self) -> f64 {
        let avg = self.avg_bytes;
        let min = self.params.min_threshold_bytes as f64;
        let max = self.params.max_threshold_bytes as f64;
        if avg < min {
            0.0
        } else if avg >= max {
            self.params.max_probability
        } else {
            self.params.max_probability * (avg - min) / (max - min)
        }
    }

    /// Offer a packet to the queue. Returns `true` if the packet was
    /// accepted, `false` if it was dropped (physical overflow or RED); the
    /// packet is consumed either way and drops are counted, not errors.
    pub fn enqueue(&mut self, p: Pkt) -> bool {
        // The average sees the occupancy the arriving packet found.
        self.update_average();

        if self.cur_bytes + u64::from(p.len()) > self.params.capacity_bytes {
            debug!(
                len = p.len(),
                queued = self.cur_bytes,
                capacity = self.params.capacity_bytes,
                "tail drop: queue full"
            );
            self.stats.dropped_overflow += 1;
            return false;
        }

        let p_b = self.base_drop_probability();
        if p_b > 0.0 {
            // Gentle RED: scale by the run of accepts since the last drop.
            let denom = 1.0 - self.accepts_since_drop as f64 * p_b;
            let drop_prob = if denom <= f64::EPSILON {
                1.0
            } else {
                (p_b / denom).clamp(0.0, 1.0)
            };
            if self.rng.gen::<f64>() < drop_prob {
                debug!(avg = self.avg_bytes, drop_prob, "RED early drop");
                self.accepts_since_drop = 0;
                self.stats.dropped_red += 1;
                return false;
            }
        }

        self.accepts_since_drop += 1;
        self.cur_bytes += u64::from(p.len());
        self.buf.push_back(p);
        self.stats.enqueued += 1;
        trace!(pkts = self.buf.len(), bytes = self.cur_bytes, "queue size");
        true
    }

    /// Pop the oldest packet. Empty queues are a caller error.
    pub fn dequeue(&mut self) -> Result<Pkt, Report> {
        let p = self.buf.pop_front().ok_or(Error::EmptyDequeue)?;
        self.cur_bytes -= u64::from(p.len());
        // Keep the average fresh for the next arrival.
        self.update_average();
        self.stats.dequeued += 1;
        Ok(p)
    }

    pub fn front(&self) -> Option<&Pkt> {
        self.buf.front()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len_packets(&self) -> usize {
        self.buf.len()
    }

    pub fn len_bytes(&self) -> u64 {
        self.cur_bytes
    }

    pub fn avg_bytes(&self) -> f64 {
        self.avg_bytes
    }

    pub fn params(&self) -> &RedParams {
        &self.params
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }
}

#[cfg(test)]
mod t {
    use super::{RedParams, RedQueue};
    use crate::test_util::init;
    use crate::{Error, Pkt};

    fn params(min: u64, max: u64, max_p: f64, w: f64, cap: u64) -> RedParams {
        RedParams::new(min, max, max_p, w, cap).unwrap()
    }

    #[test]
    fn rejects_bad_parameters() {
        init();
        assert!(RedParams::new(0, 100, 0.1, 0.02, 200).is_err());
        assert!(RedParams::new(100, 100, 0.1, 0.02, 200).is_err());
        assert!(RedParams::new(150, 100, 0.1, 0.02, 200).is_err());
        assert!(RedParams::new(50, 300, 0.1, 0.02, 200).is_err());
        assert!(RedParams::new(50, 100, 0.0, 0.02, 200).is_err());
        assert!(RedParams::new(50, 100, 1.5, 0.02, 200).is_err());
        assert!(RedParams::new(50, 100, 0.1, 0.0, 200).is_err());
        assert!(RedParams::new(50, 100, 0.1, 1.1, 200).is_err());
        assert!(RedParams::new(50, 100, 1.0, 1.0, 200).is_ok());
    }

    #[test]
    fn accepts_below_min_threshold() {
        init();
        // w = 1.0 makes the average track instantaneous occupancy exactly.
        let mut q = RedQueue::with_seed(params(500, 900, 1.0, 1.0, 1000), 7);
        for i in 0..5 {
            assert!(q.enqueue(Pkt::new(1, 100, 0)), "packet {} rejected", i);
        }
        assert_eq!(q.len_packets(), 5);
        assert_eq!(q.len_bytes(), 500);
    }

    #[test]
    fn physical_overflow_is_tail_drop() {
        init();
        let mut q = RedQueue::with_seed(params(40, 90, 0.5, 0.002, 100), 7);
        assert!(q.enqueue(Pkt::new(1, 50, 0)));
        assert!(q.enqueue(Pkt::new(1, 50, 0)));
        assert!(!q.enqueue(Pkt::new(1, 10, 0)));
        assert_eq!(q.len_bytes(), 100);
        assert_eq!(q.len_packets(), 2);
        assert_eq!(q.stats().dropped_overflow, 1);
        assert_eq!(q.stats().dropped_red, 0);
    }

    #[test]
    fn certain_drop_above_max_threshold() {
        init();
        // With w = 1 and max_p = 1, any arrival that sees avg >= max is
        // dropped with probability 1.
        let mut q = RedQueue::with_seed(params(100, 400, 1.0, 1.0, 10_000), 7);
        assert!(q.enqueue(Pkt::new(1, 500, 0)));
        assert!(!q.enqueue(Pkt::new(1, 100, 0)));
        assert!(!q.enqueue(Pkt::new(1, 100, 0)));
        assert_eq!(q.stats().dropped_red, 2);
        assert_eq!(q.len_packets(), 1);
        // Draining resets the occupancy the average tracks; arrivals are
        // accepted again.
        q.dequeue().unwrap();
        assert!(q.enqueue(Pkt::new(1, 100, 0)));
    }

    #[test]
    fn fifo_order_and_byte_accounting() {
        init();
        let mut q = RedQueue::with_seed(params(400, 900, 0.1, 0.002, 1000), 7);
        for i in 0..3 {
            assert!(q.enqueue(Pkt::new(u64::from(i) + 1, 100 + i, 0)));
        }
        assert_eq!(q.front().unwrap().flow_id(), 1);
        let a = q.dequeue().unwrap();
        assert_eq!((a.flow_id(), a.len()), (1, 100));
        assert_eq!(q.len_bytes(), 203);
        let b = q.dequeue().unwrap();
        assert_eq!((b.flow_id(), b.len()), (2, 101));
        let c = q.dequeue().unwrap();
        assert_eq!((c.flow_id(), c.len()), (3, 102));
        assert!(q.is_empty());
        assert_eq!(q.stats().dequeued, 3);
    }

    #[test]
    fn dequeue_empty_is_error() {
        init();
        let mut q = RedQueue::with_seed(params(40, 90, 0.5, 0.002, 100), 7);
        let err = q.dequeue().unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::EmptyDequeue)));
    }

    #[test]
    fn observers_do_not_perturb_verdicts() {
        init();
        let mk = || RedQueue::with_seed(params(100, 400, 0.9, 0.5, 10_000), 99);
        let mut probed = mk();
        let mut plain = mk();
        let mut verdicts = (Vec::new(), Vec::new());
        for i in 0..50 {
            // Interleave observer calls on one of the two queues.
            let _ = probed.front().map(Pkt::len);
            let _ = probed.avg_bytes();
            let _ = probed.len_bytes();
            verdicts.0.push(probed.enqueue(Pkt::new(1, 100 + i % 7, 0)));
            verdicts.1.push(plain.enqueue(Pkt::new(1, 100 + i % 7, 0)));
        }
        assert_eq!(verdicts.0, verdicts.1);
    }

    #[test]
    fn same_seed_same_drop_pattern() {
        init();
        let p = params(100, 300, 0.5, 0.3, 100_000);
        let mut a = RedQueue::with_seed(p, 1234);
        let mut b = RedQueue::with_seed(p, 1234);
        assert_eq!(a.seed(), b.seed());
        for _ in 0..200 {
            assert_eq!(
                a.enqueue(Pkt::new(1, 60, 0)),
                b.enqueue(Pkt::new(1, 60, 0))
            );
        }
    }
}
