//! The scheduler family: strict priority, WRR, DRR, and HFSC behind one
//! enqueue/dequeue interface.

use crate::Pkt;
use color_eyre::eyre::Report;

/// A work-conserving (or, for HFSC, rate-governing) packet scheduler.
pub trait Scheduler {
    /// Route a packet to its internal queue. Fails only when the packet
    /// names a level/queue/flow the scheduler was not configured with; AQM
    /// rejection is an ordinary outcome visible in queue counters.
    fn enq(&mut self, p: Pkt) -> Result<(), Report>;

    /// Emit the next packet under the discipline, or `None` when empty.
    fn deq(&mut self) -> Result<Option<Pkt>, Report>;

    /// Packets currently held across all internal queues.
    fn len_packets(&self) -> usize;

    /// Bytes currently held across all internal queues.
    fn len_bytes(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len_packets() == 0
    }

    /// Dump internal state at debug log level.
    fn dbg(&self) {}
}

mod prio;
pub use prio::StrictPriority;

mod wrr;
pub use wrr::{WeightedRoundRobin, WrrQueueConfig};

mod drr;
pub use drr::{DeficitRoundRobin, DrrQueueConfig};

mod hfsc;
pub use hfsc::{Hfsc, HfscFlowConfig, ServiceCurve};

/// The four disciplines as one value, so a pipeline can hold "some
/// scheduler" without dynamic dispatch.
pub enum SchedulerKind {
    StrictPriority(StrictPriority),
    Wrr(WeightedRoundRobin),
    Drr(DeficitRoundRobin),
    Hfsc(Hfsc),
}

impl Scheduler for SchedulerKind {
    fn enq(&mut self, p: Pkt) -> Result<(), Report> {
        match self {
            SchedulerKind::StrictPriority(s) => s.enq(p),
            SchedulerKind::Wrr(s) => s.enq(p),
            SchedulerKind::Drr(s) => s.enq(p),
            SchedulerKind::Hfsc(s) => s.enq(p),
        }
    }

    fn deq(&mut self) -> Result<Option<Pkt>, Report> {
        match self {
            SchedulerKind::StrictPriority(s) => s.deq(),
            SchedulerKind::Wrr(s) => s.deq(),
            SchedulerKind::Drr(s) => s.deq(),
            SchedulerKind::Hfsc(s) => s.deq(),
        }
    }

    fn len_packets(&self) -> usize {
        match self {
            SchedulerKind::StrictPriority(s) => s.len_packets(),
            SchedulerKind::Wrr(s) => s.len_packets(),
            SchedulerKind::Drr(s) => s.len_packets(),
            SchedulerKind::Hfsc(s) => s.len_packets(),
        }
    }

    fn len_bytes(&self) -> u64 {
        match self {
            SchedulerKind::StrictPriority(s) => s.len_bytes(),
            SchedulerKind::Wrr(s) => s.len_bytes(),
            SchedulerKind::Drr(s) => s.len_bytes(),
            SchedulerKind::Hfsc(s) => s.len_bytes(),
        }
    }

    fn dbg(&self) {
        match self {
            SchedulerKind::StrictPriority(s) => s.dbg(),
            SchedulerKind::Wrr(s) => s.dbg(),
            SchedulerKind::Drr(s) => s.dbg(),
            SchedulerKind::Hfsc(s) => s.dbg(),
        }
    }
}

impl From<StrictPriority> for SchedulerKind {
    fn from(s: StrictPriority) -> Self {
        SchedulerKind::StrictPriority(s)
    }
}

impl From<WeightedRoundRobin> for SchedulerKind {
    fn from(s: WeightedRoundRobin) -> Self {
        SchedulerKind::Wrr(s)
    }
}

impl From<DeficitRoundRobin> for SchedulerKind {
    fn from(s: DeficitRoundRobin) -> Self {
        SchedulerKind::Drr(s)
    }
}

impl From<Hfsc> for SchedulerKind {
    fn from(s: Hfsc) -> Self {
        SchedulerKind::Hfsc(s)
    }
}
