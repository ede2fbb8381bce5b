//! Weighted round robin over RED-managed queues.

use super::Scheduler;
use crate::aqm::{QueueStats, RedParams, RedQueue};
use crate::policy::QueueId;
use crate::{Error, Pkt};
use color_eyre::eyre::{ensure, Report};
use std::collections::HashMap;
use tracing::debug;

/// Configuration for one WRR queue.
#[derive(Clone, Copy, Debug)]
pub struct WrrQueueConfig {
    pub queue_id: QueueId,
    pub weight: u32,
    pub aqm: RedParams,
}

struct WrrQueue {
    id: QueueId,
    weight: u32,
    deficit: u32,
    queue: RedQueue,
}

/// Packet-granularity weighted round robin: each queue spends one deficit
/// unit per packet sent, and deficits are replenished by weight whenever a
/// full cycle finds nothing serviceable. Over long runs queue `i` sends
/// packets in proportion to `weight_i`.
pub struct WeightedRoundRobin {
    queues: Vec<WrrQueue>,
    by_id: HashMap<QueueId, usize>,
    cursor: usize,
    total_packets: usize,
}

impl WeightedRoundRobin {
    pub fn new(configs: Vec<WrrQueueConfig>) -> Result<Self, Report> {
        ensure!(
            !configs.is_empty(),
            Error::InvalidConfig("WRR needs at least one queue".to_owned())
        );
        let mut queues = Vec::with_capacity(configs.len());
        let mut by_id = HashMap::with_capacity(configs.len());
        for cfg in configs {
            ensure!(
                cfg.weight > 0,
                Error::InvalidConfig(format!("WRR queue {}: zero weight", cfg.queue_id))
            );
            ensure!(
                by_id.insert(cfg.queue_id, queues.len()).is_none(),
                Error::InvalidConfig(format!("duplicate WRR queue id {}", cfg.queue_id))
            );
            queues.push(WrrQueue {
                id: cfg.queue_id,
                weight: cfg.weight,
                // start with a full allotment so the first cycle can send
                deficit: cfg.weight,
                queue: RedQueue::new(cfg.aqm),
            });
        }
        Ok(Self {
            queues,
            by_id,
            cursor: 0,
            total_packets: 0,
        })
    }

    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }

    pub fn queue_len(&self, id: QueueId) -> Result<usize, Report> {
        let &idx = self
            .by_id
            .get(&id)
            .ok_or(Error::UnknownTarget(u64::from(id)))?;
        Ok(self.queues[idx].queue.len_packets())
    }

    pub fn queue_stats(&self, id: QueueId) -> Result<QueueStats, Report> {
        let &idx = self
            .by_id
            .get(&id)
            .ok_or(Error::UnknownTarget(u64::from(id)))?;
        Ok(self.queues[idx].queue.stats())
    }

    fn replenish(&mut self) {
        for q in &mut self.queues {
            q.deficit += q.weight;
        }
    }
}

impl Scheduler for WeightedRoundRobin {
    fn enq(&mut self, p: Pkt) -> Result<(), Report> {
        let id = QueueId::from(p.priority());
        let &idx = self
            .by_id
            .get(&id)
            .ok_or(Error::UnknownTarget(u64::from(id)))?;
        if self.queues[idx].queue.enqueue(p) {
            self.total_packets += 1;
        }
        Ok(())
    }

    fn deq(&mut self) -> Result<Option<Pkt>, Report> {
        if self.total_packets == 0 {
            return Ok(None);
        }

        let n = self.queues.len();
        let mut replenished = false;
        loop {
            for step in 0..n {
                let idx = (self.cursor + step) % n;
                let q = &mut self.queues[idx];
                if q.deficit > 0 && !q.queue.is_empty() {
                    let p = q.queue.dequeue()?;
                    q.deficit -= 1;
                    self.total_packets -= 1;
                    self.cursor = (idx + 1) % n;
                    return Ok(Some(p));
                }
            }

            // A full cycle found nothing to send: every backlogged queue is
            // out of deficit. Replenishing exactly once must unblock one.
            if replenished {
                return Err(Error::Inconsistency(
                    "WRR replenished deficits but still found nothing serviceable".to_owned(),
                )
                .into());
            }
            self.replenish();
            replenished = true;
        }
    }

    fn len_packets(&self) -> usize {
        self.total_packets
    }

    fn len_bytes(&self) -> u64 {
        self.queues.iter().map(|q| q.queue.len_bytes()).sum()
    }

    fn dbg(&self) {
        for q in &self.queues {
            debug!(
                id = q.id,
                weight = q.weight,
                deficit = q.deficit,
                pkts = q.queue.len_packets(),
                "wrr queue"
            );
        }
    }
}

#[cfg(test)]
mod t {
    use super::{WeightedRoundRobin, WrrQueueConfig};
    use crate::aqm::RedParams;
    use crate::scheduler::Scheduler;
    use crate::test_util::init;
    use crate::{Error, Pkt};

    fn roomy() -> RedParams {
        RedParams::new(500_000, 900_000, 0.1, 0.002, 1_000_000).unwrap()
    }

    fn cfg(queue_id: u32, weight: u32) -> WrrQueueConfig {
        WrrQueueConfig {
            queue_id,
            weight,
            aqm: roomy(),
        }
    }

    #[test]
    fn rejects_bad_configs() {
        init();
        assert!(WeightedRoundRobin::new(vec![]).is_err());
        assert!(WeightedRoundRobin::new(vec![cfg(0, 0)]).is_err());
        assert!(WeightedRoundRobin::new(vec![cfg(0, 1), cfg(0, 2)]).is_err());
    }

    #[test]
    fn unknown_queue_is_an_error() {
        init();
        let mut s = WeightedRoundRobin::new(vec![cfg(0, 1)]).unwrap();
        let err = s.enq(Pkt::new(1, 100, 3)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::UnknownTarget(3))
        ));
    }

    #[test]
    fn one_two_weighting_over_backlog() {
        init();
        // queue 0 weight 1, queue 1 weight 2: 3 + 6 identical packets drain
        // in a 1:2 ratio within each replenishment cycle.
        let mut s = WeightedRoundRobin::new(vec![cfg(0, 1), cfg(1, 2)]).unwrap();
        for _ in 0..3 {
            s.enq(Pkt::new(10, 100, 0)).unwrap();
        }
        for _ in 0..6 {
            s.enq(Pkt::new(20, 100, 1)).unwrap();
        }

        let order: Vec<_> = std::iter::from_fn(|| s.deq().unwrap())
            .map(|p| p.flow_id())
            .collect();
        assert_eq!(order.len(), 9);
        assert_eq!(order.iter().filter(|&&f| f == 10).count(), 3);
        assert_eq!(order.iter().filter(|&&f| f == 20).count(), 6);
        // each replenishment cycle serves at most 1 from queue 0 and 2 from
        // queue 1
        for cycle in order.chunks(3) {
            assert!(cycle.iter().filter(|&&f| f == 10).count() <= 1);
        }
        assert!(s.is_empty());
        assert!(s.deq().unwrap().is_none());
    }

    #[test]
    fn single_queue_drains_fifo() {
        init();
        let mut s = WeightedRoundRobin::new(vec![cfg(5, 3)]).unwrap();
        for id in 1..=5 {
            s.enq(Pkt::new(id, 50, 5)).unwrap();
        }
        for want in 1..=5 {
            assert_eq!(s.deq().unwrap().unwrap().flow_id(), want);
        }
        assert!(s.deq().unwrap().is_none());
    }

    #[test]
    fn idle_queue_does_not_block() {
        init();
        let mut s = WeightedRoundRobin::new(vec![cfg(0, 1), cfg(1, 1)]).unwrap();
        for _ in 0..4 {
            s.enq(Pkt::new(7, 100, 1)).unwrap();
        }
        // queue 0 stays empty; queue 1 must still be served every cycle
        for _ in 0..4 {
            assert_eq!(s.deq().unwrap().unwrap().flow_id(), 7);
        }
        assert!(s.deq().unwrap().is_none());
    }
}
