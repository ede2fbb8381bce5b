//! Strict priority scheduling over RED-managed level queues.

use super::Scheduler;
use crate::aqm::{QueueStats, RedParams, RedQueue};
use crate::{Error, Pkt};
use color_eyre::eyre::{ensure, Report};
use tracing::debug;

/// `N` priority levels, each its own [`RedQueue`]. A packet's `priority`
/// field indexes the level directly; numerically higher levels are always
/// served first. Starvation of lower levels is the point.
#[derive(Debug)]
pub struct StrictPriority {
    levels: Vec<RedQueue>,
    total_packets: usize,
}

impl StrictPriority {
    /// One [`RedParams`] per level, index = priority level.
    pub fn new(levels: Vec<RedParams>) -> Result<Self, Report> {
        ensure!(
            !levels.is_empty(),
            Error::InvalidConfig("strict priority needs at least one level".to_owned())
        );
        Ok(Self {
            levels: levels.into_iter().map(RedQueue::new).collect(),
            total_packets: 0,
        })
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn level_len(&self, level: u8) -> Result<usize, Report> {
        let q = self
            .levels
            .get(usize::from(level))
            .ok_or(Error::UnknownTarget(u64::from(level)))?;
        Ok(q.len_packets())
    }

    pub fn level_stats(&self, level: u8) -> Result<QueueStats, Report> {
        let q = self
            .levels
            .get(usize::from(level))
            .ok_or(Error::UnknownTarget(u64::from(level)))?;
        Ok(q.stats())
    }
}

impl Scheduler for StrictPriority {
    fn enq(&mut self, p: Pkt) -> Result<(), Report> {
        let level = usize::from(p.priority());
        ensure!(
            level < self.levels.len(),
            Error::UnknownTarget(u64::from(p.priority()))
        );
        if self.levels[level].enqueue(p) {
            self.total_packets += 1;
        }
        Ok(())
    }

    fn deq(&mut self) -> Result<Option<Pkt>, Report> {
        if self.total_packets == 0 {
            return Ok(None);
        }
        for q in self.levels.iter_mut().rev() {
            if !q.is_empty() {
                let p = q.dequeue()?;
                self.total_packets -= 1;
                return Ok(Some(p));
            }
        }
        Err(Error::Inconsistency(
            "packet count positive but all priority levels empty".to_owned(),
        )
        .into())
    }

    fn len_packets(&self) -> usize {
        self.total_packets
    }

    fn len_bytes(&self) -> u64 {
        self.levels.iter().map(RedQueue::len_bytes).sum()
    }

    fn dbg(&self) {
        for (level, q) in self.levels.iter().enumerate() {
            debug!(
                level,
                pkts = q.len_packets(),
                bytes = q.len_bytes(),
                avg = q.avg_bytes(),
                "strict priority level"
            );
        }
    }
}
