//! Flow identification and per-flow state.
//!
//! The [`FlowClassifier`] interns 5-tuples into opaque [`FlowId`]s and owns
//! the [`FlowTable`] of per-flow contexts. Classification is the one part of
//! the data path that may be driven from several receive threads at once, so
//! the tuple map, the id counter, and the table sit behind a single lock:
//! exactly one id is handed out per distinct tuple, races included.

use crate::policy::{PolicyId, QueueId};
use crate::FiveTuple;
use quanta::{Clock, Instant};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

pub type FlowId = u64;

/// Reserved: descriptors carry this before classification.
pub const INVALID_FLOW: FlowId = 0;

/// Drop behavior a flow's queue applies under pressure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropPolicy {
    TailDrop,
    Red,
    Wred,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlaStatus {
    Conforming,
    NonConforming,
    Unknown,
}

/// Monotonic per-flow counters with first/last activity stamps.
#[derive(Clone, Copy, Debug, Default)]
pub struct FlowStats {
    pub packets_in: u64,
    pub bytes_in: u64,
    pub packets_dropped: u64,
    pub bytes_dropped: u64,
    pub first_seen: Option<Instant>,
    pub last_seen: Option<Instant>,
}

/// Mutable per-flow state, owned by the flow table for the life of the
/// process and touched only by the shaping pipeline.
#[derive(Clone, Debug)]
pub struct FlowContext {
    pub flow_id: FlowId,
    pub policy_id: PolicyId,
    pub queue_id: QueueId,
    pub drop_policy: DropPolicy,
    /// Observed throughput over the last accounting interval.
    pub current_rate_bps: u64,
    /// Bytes seen since the rate was last folded.
    pub accumulated_bytes: u64,
    pub stats: FlowStats,
    pub sla_status: SlaStatus,
    pub last_processed: Option<Instant>,
}

impl FlowContext {
    fn new(flow_id: FlowId, policy_id: PolicyId) -> Self {
        Self {
            flow_id,
            policy_id,
            queue_id: 0,
            drop_policy: DropPolicy::TailDrop,
            current_rate_bps: 0,
            accumulated_bytes: 0,
            stats: FlowStats::default(),
            sla_status: SlaStatus::Unknown,
            last_processed: None,
        }
    }
}

pub type FlowTable = HashMap<FlowId, FlowContext>;

struct Inner {
    next_id: FlowId,
    by_tuple: HashMap<FiveTuple, FlowId>,
    table: FlowTable,
}

/// Maps 5-tuples to persistent flows, allocating ids monotonically from 1.
pub struct FlowClassifier {
    default_policy: PolicyId,
    clock: Clock,
    inner: Mutex<Inner>,
}

impl FlowClassifier {
    /// `default_policy` is the policy newly seen flows are bound to.
    pub fn new(default_policy: PolicyId) -> Self {
        Self::with_clock(default_policy, Clock::new())
    }

    pub fn with_clock(default_policy: PolicyId, clock: Clock) -> Self {
        Self {
            default_policy,
            clock,
            inner: Mutex::new(Inner {
                next_id: 1,
                by_tuple: HashMap::new(),
                table: FlowTable::new(),
            }),
        }
    }

    /// Return the flow id for `tuple`, installing a fresh context bound to
    /// the default policy on first sight. Idempotent and race-free: equal
    /// tuples always map to the same id.
    pub fn get_or_create(&self, tuple: &FiveTuple) -> FlowId {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&id) = inner.by_tuple.get(tuple) {
            return id;
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.by_tuple.insert(*tuple, id);
        let mut ctx = FlowContext::new(id, self.default_policy);
        ctx.stats.first_seen = Some(self.clock.now());
        inner.table.insert(id, ctx);
        debug!(flow_id = id, ?tuple, "new flow");
        id
    }

    /// Snapshot of a flow's context, if the flow exists.
    pub fn context(&self, id: FlowId) -> Option<FlowContext> {
        self.inner.lock().unwrap().table.get(&id).cloned()
    }

    /// Run `f` over the flow's context under the classifier lock.
    pub fn with_context<R>(&self, id: FlowId, f: impl FnOnce(&mut FlowContext) -> R) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        inner.table.get_mut(&id).map(f)
    }

    /// Number of flows seen so far.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn default_policy(&self) -> PolicyId {
        self.default_policy
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }
}

#[cfg(test)]
mod t {
    use super::{FlowClassifier, SlaStatus, INVALID_FLOW};
    use crate::test_util::init;
    use crate::FiveTuple;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn tuple(last_octet: u8, sport: u16) -> FiveTuple {
        FiveTuple::new(
            Ipv4Addr::new(10, 0, 0, last_octet),
            Ipv4Addr::new(10, 0, 1, 1),
            sport,
            443,
            6,
        )
    }

    #[test]
    fn interning_is_idempotent() {
        init();
        let c = FlowClassifier::new(1);
        let a = c.get_or_create(&tuple(1, 1000));
        let b = c.get_or_create(&tuple(1, 1000));
        assert_eq!(a, b);
        assert_ne!(a, INVALID_FLOW);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn distinct_tuples_get_monotone_ids() {
        init();
        let c = FlowClassifier::new(1);
        let a = c.get_or_create(&tuple(1, 1000));
        let b = c.get_or_create(&tuple(1, 1001));
        let d = c.get_or_create(&tuple(2, 1000));
        assert_eq!((a, b, d), (1, 2, 3));
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn new_flow_gets_default_binding() {
        init();
        let c = FlowClassifier::new(77);
        let id = c.get_or_create(&tuple(3, 5000));
        let ctx = c.context(id).unwrap();
        assert_eq!(ctx.policy_id, 77);
        assert_eq!(ctx.flow_id, id);
        assert_eq!(ctx.sla_status, SlaStatus::Unknown);
        assert!(ctx.stats.first_seen.is_some());
        assert!(c.context(id + 1).is_none());
    }

    #[test]
    fn with_context_mutates_in_place() {
        init();
        let c = FlowClassifier::new(1);
        let id = c.get_or_create(&tuple(1, 1));
        c.with_context(id, |ctx| {
            ctx.stats.packets_in += 1;
            ctx.stats.bytes_in += 1500;
        })
        .unwrap();
        let ctx = c.context(id).unwrap();
        assert_eq!(ctx.stats.packets_in, 1);
        assert_eq!(ctx.stats.bytes_in, 1500);
        assert!(c.with_context(99, |_| ()).is_none());
    }

    #[test]
    fn one_id_per_tuple_under_contention() {
        init();
        let c = Arc::new(FlowClassifier::new(1));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = Arc::clone(&c);
            handles.push(std::thread::spawn(move || {
                let mut seen = Vec::new();
                for i in 0..64u16 {
                    // every thread touches the same 64 tuples
                    seen.push((i, c.get_or_create(&tuple(4, i))));
                }
                seen
            }));
        }
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for pair in results.windows(2) {
            assert_eq!(pair[0], pair[1], "threads disagree on tuple ids");
        }
        assert_eq!(c.len(), 64);
    }
}
