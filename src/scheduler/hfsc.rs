//! Two-level hierarchical fair service curve scheduling.
//!
//! Each class carries up to three service curves: real-time (guarantee),
//! link-share (fair excess), and upper-limit (cap). Scheduling runs in
//! virtual time: a class's head packet gets an eligible time and a virtual
//! finish time from its curves, the global eligible set orders classes by
//! finish time (flow id breaking ties), and dequeue pops the minimum and
//! advances virtual time to the served packet's finish. The hierarchy is
//! exactly two levels: root classes (parent 0) either queue packets
//! themselves or exist purely to constrain the children naming them.

use super::Scheduler;
use crate::flow::FlowId;
use crate::{Error, Pkt};
use color_eyre::eyre::{ensure, Report};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use tracing::{debug, trace};

/// Parent sentinel for root classes.
pub const NO_PARENT_FLOW: FlowId = 0;

/// Virtual-time representation of infinity, used for absent curves so that
/// non-contribution is observable through ordinary comparisons.
const VT_INF: u64 = u64::MAX;

/// One service curve: a rate and an offset delay. Rate 0 means the curve is
/// absent and contributes nothing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServiceCurve {
    pub rate_bps: u64,
    pub delay_us: u64,
}

impl ServiceCurve {
    pub fn new(rate_bps: u64, delay_us: u64) -> Self {
        Self { rate_bps, delay_us }
    }

    /// An absent curve.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.rate_bps > 0
    }

    /// Virtual microseconds to serve `len_bytes` at this curve's rate;
    /// infinite for an absent curve.
    fn service_time_us(&self, len_bytes: u32) -> u64 {
        if self.rate_bps == 0 {
            VT_INF
        } else {
            u64::from(len_bytes) * 8 * 1_000_000 / self.rate_bps
        }
    }
}

/// Configuration for one HFSC class. `parent_id` 0 declares a root class;
/// a class someone names as parent becomes interior and cannot queue
/// packets itself.
#[derive(Clone, Copy, Debug)]
pub struct HfscFlowConfig {
    pub flow_id: FlowId,
    pub parent_id: FlowId,
    pub rt: ServiceCurve,
    pub ls: ServiceCurve,
    pub ul: ServiceCurve,
}

struct FlowState {
    parent_id: FlowId,
    children: Vec<FlowId>,
    queue: VecDeque<Pkt>,
    queued_bytes: u64,
    rt: ServiceCurve,
    ls: ServiceCurve,
    ul: ServiceCurve,
    virtual_start: u64,
    virtual_finish: u64,
    eligible: u64,
    vft_ul: u64,
}

impl FlowState {
    fn new(cfg: &HfscFlowConfig) -> Self {
        Self {
            parent_id: cfg.parent_id,
            children: Vec::new(),
            queue: VecDeque::new(),
            queued_bytes: 0,
            rt: cfg.rt,
            ls: cfg.ls,
            ul: cfg.ul,
            virtual_start: 0,
            virtual_finish: 0,
            eligible: 0,
            vft_ul: 0,
        }
    }

    fn is_interior(&self) -> bool {
        !self.children.is_empty()
    }
}

/// Pick the governing curve for a packet: of the active RT/LS curves,
/// the one with the smaller finish time (ties to RT). Returns
/// `(eligible, vft)`; `(0, VT_INF)` when neither curve is active.
fn choose_curve(base: u64, rt: &ServiceCurve, ls: &ServiceCurve, len: u32) -> (u64, u64) {
    let mut e = 0;
    let mut vft = VT_INF;
    if rt.is_active() {
        e = base.saturating_add(rt.delay_us);
        vft = e.saturating_add(rt.service_time_us(len));
    }
    if ls.is_active() {
        let e_ls = base.saturating_add(ls.delay_us);
        let vft_ls = e_ls.saturating_add(ls.service_time_us(len));
        if vft_ls < vft {
            e = e_ls;
            vft = vft_ls;
        }
    }
    (e, vft)
}

/// The two-level HFSC scheduler.
///
/// Determinism: with identical configuration and an identical sequence of
/// enqueue/dequeue calls (and packet lengths), the emitted flow id sequence
/// is identical; the `(vft, flow_id)` heap ordering is total.
pub struct Hfsc {
    flows: BTreeMap<FlowId, FlowState>,
    eligible_set: BinaryHeap<Reverse<(u64, FlowId)>>,
    current_vtime: u64,
    total_packets: usize,
    total_bytes: u64,
}

impl Hfsc {
    pub fn new(configs: Vec<HfscFlowConfig>) -> Result<Self, Report> {
        ensure!(
            !configs.is_empty(),
            Error::InvalidConfig("HFSC needs at least one class".to_owned())
        );
        let mut flows: BTreeMap<FlowId, FlowState> = BTreeMap::new();
        for cfg in &configs {
            ensure!(
                cfg.flow_id != NO_PARENT_FLOW,
                Error::InvalidConfig("HFSC flow id 0 is reserved".to_owned())
            );
            ensure!(
                cfg.flow_id != cfg.parent_id,
                Error::InvalidConfig(format!("HFSC class {} is its own parent", cfg.flow_id))
            );
            ensure!(
                flows.insert(cfg.flow_id, FlowState::new(cfg)).is_none(),
                Error::InvalidConfig(format!("duplicate HFSC flow id {}", cfg.flow_id))
            );
        }
        // second pass: resolve parents, enforce the two-level shape
        for cfg in &configs {
            if cfg.parent_id == NO_PARENT_FLOW {
                continue;
            }
            let parent = flows.get_mut(&cfg.parent_id).ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "HFSC class {}: parent {} not configured",
                    cfg.flow_id, cfg.parent_id
                ))
            })?;
            ensure!(
                parent.parent_id == NO_PARENT_FLOW,
                Error::InvalidConfig(format!(
                    "HFSC class {}: parent {} is not a root class (hierarchy is two-level)",
                    cfg.flow_id, cfg.parent_id
                ))
            );
            parent.children.push(cfg.flow_id);
        }
        Ok(Self {
            flows,
            eligible_set: BinaryHeap::new(),
            current_vtime: 0,
            total_packets: 0,
            total_bytes: 0,
        })
    }

    pub fn num_flows(&self) -> usize {
        self.flows.len()
    }

    pub fn flow_queue_len(&self, id: FlowId) -> Result<usize, Report> {
        let f = self.flows.get(&id).ok_or(Error::UnknownTarget(id))?;
        Ok(f.queue.len())
    }

    /// The scheduler-global virtual clock, in virtual microseconds.
    pub fn current_vtime(&self) -> u64 {
        self.current_vtime
    }

    /// Compute the head packet's eligible time and finish time for `id` and
    /// register it in the eligible set.
    ///
    /// `newly_active` distinguishes a class waking from empty (eligibility
    /// resumes no earlier than its previous finish) from a class being
    /// re-registered right after service (eligibility starts at the current
    /// virtual time).
    fn schedule(&mut self, id: FlowId, newly_active: bool) {
        let cur_vt = self.current_vtime;
        let (len, base, rt, ls, ul, vft_ul, parent_id) = {
            let f = match self.flows.get(&id) {
                Some(f) => f,
                None => return,
            };
            let Some(head) = f.queue.front() else {
                return;
            };
            let base = if newly_active {
                cur_vt.max(f.virtual_finish)
            } else {
                cur_vt
            };
            (head.len(), base, f.rt, f.ls, f.ul, f.vft_ul, f.parent_id)
        };

        // governing curve and service time for the class itself
        let (e_chosen, vft_chosen) = choose_curve(base, &rt, &ls, len);
        let service_time = if vft_chosen == VT_INF {
            VT_INF
        } else {
            vft_chosen - e_chosen
        };

        // upper limit delays eligibility but never shortens service
        let mut e_final = e_chosen;
        if ul.is_active() {
            let e_ul = base.max(vft_ul).saturating_add(ul.delay_us);
            e_final = e_final.max(e_ul);
        }

        // parent cascade: the parent's own three-curve eligibility for this
        // packet length bounds when the child may start. The parent only
        // constrains the start; the service time stays the child's.
        if parent_id != NO_PARENT_FLOW {
            if let Some(parent) = self.flows.get(&parent_id) {
                let base_parent = cur_vt.max(parent.virtual_finish);
                let (e_parent, _) = choose_curve(base_parent, &parent.rt, &parent.ls, len);
                let mut e_final_parent = e_parent;
                if parent.ul.is_active() {
                    let e_ul = base_parent
                        .max(parent.vft_ul)
                        .saturating_add(parent.ul.delay_us);
                    e_final_parent = e_final_parent.max(e_ul);
                }
                e_final = e_final.max(e_final_parent);
            }
        }

        let vft_final = if service_time == VT_INF {
            VT_INF
        } else {
            e_final.saturating_add(service_time)
        };

        if vft_final == VT_INF {
            // no active RT/LS curve: the class cannot become eligible
            debug!(flow_id = id, "class has no contributing curve, not scheduling");
            return;
        }

        let f = self.flows.get_mut(&id).expect("present above");
        f.virtual_start = e_final;
        f.eligible = e_final;
        f.virtual_finish = vft_final;
        if f.ul.is_active() {
            f.vft_ul = e_final.saturating_add(f.ul.service_time_us(len));
        }
        self.eligible_set.push(Reverse((vft_final, id)));
        trace!(flow_id = id, eligible = e_final, vft = vft_final, "scheduled");
    }
}

impl Scheduler for Hfsc {
    fn enq(&mut self, p: Pkt) -> Result<(), Report> {
        // priority carries the target class id through the pipeline
        let id = FlowId::from(p.priority());
        let f = self
            .flows
            .get_mut(&id)
            .ok_or(Error::UnknownTarget(id))?;
        ensure!(!f.is_interior(), Error::UnknownTarget(id));

        let was_empty = f.queue.is_empty();
        self.total_bytes += u64::from(p.len());
        f.queued_bytes += u64::from(p.len());
        f.queue.push_back(p);
        self.total_packets += 1;
        if was_empty {
            self.schedule(id, true);
        }
        Ok(())
    }

    fn deq(&mut self) -> Result<Option<Pkt>, Report> {
        if self.total_packets == 0 {
            return Ok(None);
        }

        let Reverse((vft, id)) = self.eligible_set.pop().ok_or_else(|| {
            // packets exist but nothing could be scheduled: every
            // backlogged class has zero-rate RT and LS curves
            Error::Inconsistency(
                "HFSC eligible set empty while packets are queued".to_owned(),
            )
        })?;

        let f = self.flows.get_mut(&id).ok_or_else(|| {
            Error::Inconsistency(format!("eligible set names unconfigured class {}", id))
        })?;
        let p = f.queue.pop_front().ok_or_else(|| {
            Error::Inconsistency(format!("eligible set names empty class {}", id))
        })?;
        self.total_packets -= 1;
        self.total_bytes -= u64::from(p.len());
        f.queued_bytes -= u64::from(p.len());

        // virtual time advances to the finish of the served packet
        self.current_vtime = vft;

        // reseed the upper-limit finish from the packet's actual start
        if f.ul.is_active() {
            f.vft_ul = f.virtual_start.saturating_add(f.ul.service_time_us(p.len()));
        }

        let more = !f.queue.is_empty();
        if more {
            self.schedule(id, false);
        }
        trace!(flow_id = id, vft, more, "dequeued");
        Ok(Some(p))
    }

    fn len_packets(&self) -> usize {
        self.total_packets
    }

    fn len_bytes(&self) -> u64 {
        self.total_bytes
    }

    fn dbg(&self) {
        debug!(
            vtime = self.current_vtime,
            pkts = self.total_packets,
            eligible = self.eligible_set.len(),
            "hfsc state"
        );
        for (id, f) in &self.flows {
            debug!(
                flow_id = id,
                parent = f.parent_id,
                pkts = f.queue.len(),
                vft = f.virtual_finish,
                vft_ul = f.vft_ul,
                "hfsc class"
            );
        }
    }
}
