//! Hierarchical QoS traffic shaping for a per-interface data path.
//!
//! This crate implements the classify -> meter -> queue -> schedule path of a
//! QoS-enabled egress interface. Packets arrive as parsed descriptors, get
//! matched to a persistent flow, are metered against a hierarchical policy of
//! dual-rate token buckets ([`policy::ShapingPolicy`]), survive (or not) RED
//! active queue management ([`aqm::RedQueue`]), and are emitted under one of
//! four disciplines: strict priority, weighted round robin, deficit round
//! robin, or a two-level hierarchical fair service curve scheduler
//! ([`scheduler::Hfsc`]).
//!
//! The entry point is [`pipeline::PacketPipeline`], which wires a
//! [`flow::FlowClassifier`], a [`shaper::TrafficShaper`], and one
//! [`scheduler::SchedulerKind`] per interface. Raw packet I/O is out of
//! scope; [`wire`] converts an already-received ethernet frame into the
//! [`FiveTuple`] + length form the pipeline consumes.

pub mod aqm;
pub mod bucket;
pub mod config;
pub mod flow;
pub mod pipeline;
pub mod policy;
pub mod scheduler;
pub mod shaper;
pub mod wire;

pub use flow::{FlowClassifier, FlowId};
pub use pipeline::PacketPipeline;
pub use policy::{PolicyId, PolicyTree};
pub use scheduler::{Scheduler, SchedulerKind};
pub use shaper::TrafficShaper;

/// Conformance color assigned by the two-rate three-color marker.
///
/// GREEN traffic fits the committed rate, YELLOW fits the peak rate, RED
/// exceeds both.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Conformance {
    Green,
    Yellow,
    Red,
}

impl Conformance {
    pub(crate) fn idx(self) -> usize {
        match self {
            Conformance::Green => 0,
            Conformance::Yellow => 1,
            Conformance::Red => 2,
        }
    }
}

/// A packet descriptor moving through the shaping pipeline.
///
/// Created at ingress, destroyed at egress or on drop. The shaper writes
/// `flow_id`, `priority`, and `conformance`; schedulers read `priority` as a
/// priority level, queue selector, or flow selector depending on discipline.
/// The payload is an opaque buffer that is moved, never copied, through the
/// pipeline.
#[derive(Clone, Debug)]
pub struct Pkt {
    pub(crate) flow_id: FlowId,
    pub(crate) len_bytes: u32,
    pub(crate) priority: u8,
    pub(crate) conformance: Conformance,
    pub(crate) payload: Vec<u8>,
}

impl Pkt {
    pub fn new(flow_id: FlowId, len_bytes: u32, priority: u8) -> Self {
        Self {
            flow_id,
            len_bytes,
            priority,
            conformance: Conformance::Green,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    /// Wire length of the packet. Independent of the payload buffer, which
    /// the caller may elide.
    pub fn len(&self) -> u32 {
        self.len_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.len_bytes == 0
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn conformance(&self) -> Conformance {
        self.conformance
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// Flow key: the classic 5-tuple. Equality and hashing mix all five fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiveTuple {
    pub src_ip: std::net::Ipv4Addr,
    pub dst_ip: std::net::Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

impl FiveTuple {
    pub fn new(
        src_ip: std::net::Ipv4Addr,
        dst_ip: std::net::Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        protocol: u8,
    ) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            protocol,
        }
    }
}

/// Typed error kinds surfaced through [`color_eyre::eyre::Report`].
///
/// Configuration errors fail fast at construction time; the runtime kinds
/// are reserved for genuine misuse or internal inconsistency. AQM and shaper
/// drops are ordinary outcomes and never use this type.
#[derive(Debug)]
pub enum Error {
    /// Rejected constructor parameters: zero capacity, non-monotone RED
    /// thresholds, zero weight/quantum, duplicate ids, bad hierarchy.
    InvalidConfig(String),
    /// Enqueue directed at a level/queue/flow id the scheduler was not
    /// configured with.
    UnknownTarget(u64),
    /// Dequeue called on an empty queue.
    EmptyDequeue,
    /// The shaper could not find the policy a flow is bound to.
    PolicyMissing(PolicyId),
    /// Internal state disagreement, e.g. the eligible set naming a flow
    /// whose packet queue is empty.
    Inconsistency(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            Error::UnknownTarget(id) => write!(f, "no queue or flow configured for id {}", id),
            Error::EmptyDequeue => write!(f, "dequeue from empty queue"),
            Error::PolicyMissing(id) => write!(f, "policy {} not found", id),
            Error::Inconsistency(msg) => write!(f, "internal inconsistency: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
pub(crate) mod test_util {
    pub(crate) fn init() {
        use std::sync::Once;
        static INIT: Once = Once::new();

        INIT.call_once(|| {
            tracing_subscriber::fmt::init();
            color_eyre::install().unwrap();
        })
    }
}
