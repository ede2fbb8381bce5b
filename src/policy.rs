//! Shaping policies and the indexed policy hierarchy.
//!
//! A [`ShapingPolicy`] is one node of the hierarchy: identity, dual-rate
//! meter state (CIR/PIR token buckets), a scheduling descriptor, and the
//! per-color map that rewrites a packet's priority and queue after marking.
//! [`PolicyTree`] stores the nodes and keeps four views consistent (by id,
//! by parent, by priority level, by name); all in-place mutation goes
//! through [`PolicyTree::modify`] so the views never drift from the nodes.

use crate::bucket::TokenBucket;
use crate::{Conformance, Error};
use color_eyre::eyre::{ensure, Report};
use quanta::{Clock, Instant};
use std::collections::{BTreeMap, BTreeSet};

pub type PolicyId = u64;
pub type QueueId = u32;

/// Parent sentinel for root policies. Also why `0` is not a valid policy id.
pub const NO_PARENT: PolicyId = 0;

/// Discipline a policy's traffic is scheduled under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    Wfq,
    Wrr,
    StrictPriority,
    Drr,
    Hfsc,
}

/// Where a packet of a given conformance color goes: the priority written
/// onto the descriptor and the queue the flow is steered to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColorTarget {
    pub priority: u8,
    pub queue_id: QueueId,
}

/// The configuration-surface record a policy is built from. Produced by the
/// management plane (or [`crate::config`]); validated by
/// [`ShapingPolicy::new`].
#[derive(Clone, Debug)]
pub struct PolicySpec {
    pub id: PolicyId,
    pub parent_id: PolicyId,
    pub name: String,
    pub cir_bps: u64,
    pub pir_bps: u64,
    pub cbs_bytes: u64,
    pub ebs_bytes: u64,
    pub algorithm: Algorithm,
    pub weight: u32,
    pub priority_level: u8,
    pub drop_on_red: bool,
    /// Indexed green, yellow, red.
    pub targets: [ColorTarget; 3],
}

/// Monotonic per-policy counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct PolicyStats {
    pub bytes_processed: u64,
    pub packets_processed: u64,
    pub bytes_dropped: u64,
    pub packets_dropped: u64,
}

/// One node of the policy hierarchy, including live meter state.
#[derive(Clone, Debug)]
pub struct ShapingPolicy {
    id: PolicyId,
    parent_id: PolicyId,
    children: Vec<PolicyId>,
    name: String,
    cir_bps: u64,
    pir_bps: u64,
    cbs_bytes: u64,
    ebs_bytes: u64,
    algorithm: Algorithm,
    weight: u32,
    priority_level: u8,
    cir_bucket: TokenBucket,
    pir_bucket: TokenBucket,
    drop_on_red: bool,
    targets: [ColorTarget; 3],
    stats: PolicyStats,
    last_updated: Instant,
}

impl ShapingPolicy {
    pub fn new(spec: PolicySpec) -> Result<Self, Report> {
        Self::with_clock(spec, Clock::new())
    }

    pub fn with_clock(spec: PolicySpec, clock: Clock) -> Result<Self, Report> {
        ensure!(
            spec.id != NO_PARENT,
            Error::InvalidConfig(format!("policy id {} is reserved", NO_PARENT))
        );
        ensure!(
            spec.id != spec.parent_id,
            Error::InvalidConfig(format!("policy {} cannot be its own parent", spec.id))
        );
        ensure!(
            spec.pir_bps == 0 || spec.pir_bps >= spec.cir_bps,
            Error::InvalidConfig(format!(
                "policy {}: PIR {} below CIR {}",
                spec.id, spec.pir_bps, spec.cir_bps
            ))
        );
        let now = clock.now();
        Ok(Self {
            id: spec.id,
            parent_id: spec.parent_id,
            children: Vec::new(),
            name: spec.name,
            cir_bps: spec.cir_bps,
            pir_bps: spec.pir_bps,
            cbs_bytes: spec.cbs_bytes,
            ebs_bytes: spec.ebs_bytes,
            algorithm: spec.algorithm,
            weight: spec.weight,
            priority_level: spec.priority_level,
            cir_bucket: TokenBucket::with_clock(spec.cir_bps, spec.cbs_bytes, clock.clone()),
            pir_bucket: TokenBucket::with_clock(spec.pir_bps, spec.ebs_bytes, clock),
            drop_on_red: spec.drop_on_red,
            targets: spec.targets,
            stats: PolicyStats::default(),
            last_updated: now,
        })
    }

    /// Two-rate three-color marking for a packet of `len` bytes.
    ///
    /// Green packets also debit the peak bucket, so the peak meter sees all
    /// admitted traffic; a failed peak debit on a green packet does not
    /// change the color.
    pub fn mark(&mut self, len: u32) -> Conformance {
        let len = u64::from(len);
        if self.cir_bucket.consume(len) {
            let _ = self.pir_bucket.consume(len);
            Conformance::Green
        } else if self.pir_bucket.consume(len) {
            Conformance::Yellow
        } else {
            Conformance::Red
        }
    }

    pub fn id(&self) -> PolicyId {
        self.id
    }

    pub fn parent_id(&self) -> PolicyId {
        self.parent_id
    }

    /// Move this policy under a different parent. Only meaningful inside
    /// [`PolicyTree::modify`], which fixes up the parent view afterwards.
    pub fn set_parent(&mut self, parent_id: PolicyId) {
        self.parent_id = parent_id;
    }

    pub fn is_root(&self) -> bool {
        self.parent_id == NO_PARENT
    }

    /// Ids of policies naming this one as parent, in insertion order.
    /// Maintained by the owning [`PolicyTree`].
    pub fn children(&self) -> &[PolicyId] {
        &self.children
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn cir_bps(&self) -> u64 {
        self.cir_bps
    }

    pub fn pir_bps(&self) -> u64 {
        self.pir_bps
    }

    pub fn cbs_bytes(&self) -> u64 {
        self.cbs_bytes
    }

    pub fn ebs_bytes(&self) -> u64 {
        self.ebs_bytes
    }

    /// Re-rate the committed meter; burst credit already earned is kept.
    pub fn set_cir(&mut self, cir_bps: u64) {
        self.cir_bps = cir_bps;
        self.cir_bucket.set_rate(cir_bps);
    }

    pub fn set_pir(&mut self, pir_bps: u64) {
        self.pir_bps = pir_bps;
        self.pir_bucket.set_rate(pir_bps);
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn priority_level(&self) -> u8 {
        self.priority_level
    }

    pub fn set_priority_level(&mut self, level: u8) {
        self.priority_level = level;
    }

    pub fn drop_on_red(&self) -> bool {
        self.drop_on_red
    }

    pub fn target(&self, color: Conformance) -> ColorTarget {
        self.targets[color.idx()]
    }

    pub fn cir_bucket_mut(&mut self) -> &mut TokenBucket {
        &mut self.cir_bucket
    }

    pub fn pir_bucket_mut(&mut self) -> &mut TokenBucket {
        &mut self.pir_bucket
    }

    pub fn stats(&self) -> PolicyStats {
        self.stats
    }

    pub fn stats_mut(&mut self) -> &mut PolicyStats {
        &mut self.stats
    }

    pub fn last_updated(&self) -> Instant {
        self.last_updated
    }
}

/// The policy hierarchy, with ordered secondary views by parent id,
/// priority level, and name.
///
/// Mutation of a stored policy goes through [`PolicyTree::modify`]; the
/// closure gets `&mut ShapingPolicy` and the tree re-indexes whatever the
/// closure changed before returning. Holding references across
/// modifications is ruled out by the borrow checker.
#[derive(Debug)]
pub struct PolicyTree {
    nodes: BTreeMap<PolicyId, ShapingPolicy>,
    by_parent: BTreeSet<(PolicyId, PolicyId)>,
    by_priority: BTreeSet<(u8, PolicyId)>,
    by_name: BTreeSet<(String, PolicyId)>,
    clock: Clock,
}

impl Default for PolicyTree {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyTree {
    pub fn new() -> Self {
        Self::with_clock(Clock::new())
    }

    /// Build a tree whose policies and meter buckets share `clock`. Tests
    /// use this with a mock clock to drive refill deterministically.
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            nodes: BTreeMap::new(),
            by_parent: BTreeSet::new(),
            by_priority: BTreeSet::new(),
            by_name: BTreeSet::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: PolicyId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Insert a policy built from `spec`. Duplicate ids, self-parenting,
    /// and dangling parent references are rejected.
    pub fn insert(&mut self, spec: PolicySpec) -> Result<(), Report> {
        ensure!(
            !self.nodes.contains_key(&spec.id),
            Error::InvalidConfig(format!("duplicate policy id {}", spec.id))
        );
        ensure!(
            spec.parent_id == NO_PARENT || self.nodes.contains_key(&spec.parent_id),
            Error::InvalidConfig(format!(
                "policy {}: parent {} not present",
                spec.id, spec.parent_id
            ))
        );
        let policy = ShapingPolicy::with_clock(spec, self.clock.clone())?;

        self.by_parent.insert((policy.parent_id, policy.id));
        self.by_priority.insert((policy.priority_level, policy.id));
        self.by_name.insert((policy.name.clone(), policy.id));
        if policy.parent_id != NO_PARENT {
            // checked present above; index and node stay in step
            let parent = self.nodes.get_mut(&policy.parent_id).expect("parent indexed");
            parent.children.push(policy.id);
        }
        self.nodes.insert(policy.id, policy);
        Ok(())
    }

    /// Remove a childless policy, returning it.
    pub fn remove(&mut self, id: PolicyId) -> Result<ShapingPolicy, Report> {
        let node = self
            .nodes
            .get(&id)
            .ok_or(Error::PolicyMissing(id))?;
        ensure!(
            node.children.is_empty(),
            Error::InvalidConfig(format!("policy {} still has children", id))
        );
        let node = self.nodes.remove(&id).expect("checked present");
        self.by_parent.remove(&(node.parent_id, id));
        self.by_priority.remove(&(node.priority_level, id));
        self.by_name.remove(&(node.name.clone(), id));
        if node.parent_id != NO_PARENT {
            if let Some(parent) = self.nodes.get_mut(&node.parent_id) {
                parent.children.retain(|&c| c != id);
            }
        }
        Ok(node)
    }

    pub fn get(&self, id: PolicyId) -> Option<&ShapingPolicy> {
        self.nodes.get(&id)
    }

    /// Mutate the policy `id` in place and re-index afterwards. This is the
    /// only way to touch meter buckets or rewrite indexed fields of a
    /// stored policy.
    ///
    /// Re-parenting to the policy itself or to an id that is not in the
    /// tree fails and restores the previous parent; all other mutations
    /// (including priority/name changes made in the same call) stick and
    /// are re-indexed.
    pub fn modify<R>(
        &mut self,
        id: PolicyId,
        f: impl FnOnce(&mut ShapingPolicy) -> R,
    ) -> Result<R, Report> {
        let now = self.clock.now();
        let node = self.nodes.get_mut(&id).ok_or(Error::PolicyMissing(id))?;
        let old_parent = node.parent_id;
        let old_priority = node.priority_level;
        let old_name = node.name.clone();

        let out = f(node);
        node.last_updated = now;

        let new_parent = node.parent_id;
        let new_priority = node.priority_level;
        let new_name = node.name.clone();

        // re-index the non-structural fields first, so a rejected reparent
        // below never leaves these views behind the node
        if new_priority != old_priority {
            self.by_priority.remove(&(old_priority, id));
            self.by_priority.insert((new_priority, id));
        }
        if new_name != old_name {
            self.by_name.remove(&(old_name, id));
            self.by_name.insert((new_name, id));
        }

        if new_parent != old_parent {
            if new_parent == id {
                let node = self.nodes.get_mut(&id).expect("still present");
                node.parent_id = old_parent;
                return Err(Error::InvalidConfig(format!(
                    "policy {} cannot be its own parent",
                    id
                ))
                .into());
            }
            if new_parent != NO_PARENT && !self.nodes.contains_key(&new_parent) {
                let node = self.nodes.get_mut(&id).expect("still present");
                node.parent_id = old_parent;
                return Err(Error::Inconsistency(format!(
                    "policy {} re-parented to missing policy {}",
                    id, new_parent
                ))
                .into());
            }
            self.by_parent.remove(&(old_parent, id));
            self.by_parent.insert((new_parent, id));
            if old_parent != NO_PARENT {
                if let Some(p) = self.nodes.get_mut(&old_parent) {
                    p.children.retain(|&c| c != id);
                }
            }
            if new_parent != NO_PARENT {
                if let Some(p) = self.nodes.get_mut(&new_parent) {
                    p.children.push(id);
                }
            }
        }
        Ok(out)
    }

    /// Policies under `parent`, ordered by id.
    pub fn children_of(&self, parent: PolicyId) -> impl Iterator<Item = &ShapingPolicy> + '_ {
        self.by_parent
            .range((parent, PolicyId::MIN)..=(parent, PolicyId::MAX))
            .map(move |&(_, id)| self.nodes.get(&id).expect("index consistent"))
    }

    /// Root policies (parent sentinel), ordered by id.
    pub fn roots(&self) -> impl Iterator<Item = &ShapingPolicy> + '_ {
        self.children_of(NO_PARENT)
    }

    /// Policies at a given scheduling priority level, ordered by id.
    pub fn at_priority(&self, level: u8) -> impl Iterator<Item = &ShapingPolicy> + '_ {
        self.by_priority
            .range((level, PolicyId::MIN)..=(level, PolicyId::MAX))
            .map(move |&(_, id)| self.nodes.get(&id).expect("index consistent"))
    }

    /// Policies with the given (non-unique) name, ordered by id.
    pub fn find_by_name<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a ShapingPolicy> + 'a {
        self.by_name
            .range((name.to_owned(), PolicyId::MIN)..=(name.to_owned(), PolicyId::MAX))
            .map(move |&(_, id)| self.nodes.get(&id).expect("index consistent"))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShapingPolicy> + '_ {
        self.nodes.values()
    }
}
