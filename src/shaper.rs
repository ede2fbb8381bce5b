//! The metering and marking stage.
//!
//! [`TrafficShaper::process`] takes an ingress descriptor, binds it to a
//! flow, runs the flow's policy meter (two-rate three-color marking), and
//! rewrites the descriptor's priority from the policy's per-color map. All
//! bucket mutation happens through [`PolicyTree::modify`] so the tree's
//! views stay consistent.

use crate::flow::{FlowClassifier, SlaStatus};
use crate::policy::{ColorTarget, PolicyTree};
use crate::{Conformance, FiveTuple, Pkt};
use std::sync::Arc;
use tracing::{debug, trace};

/// What the pipeline should do with a processed packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Enqueue,
    Drop,
}

pub struct TrafficShaper {
    classifier: Arc<FlowClassifier>,
    policies: PolicyTree,
}

impl TrafficShaper {
    pub fn new(classifier: Arc<FlowClassifier>, policies: PolicyTree) -> Self {
        Self {
            classifier,
            policies,
        }
    }

    pub fn policies(&self) -> &PolicyTree {
        &self.policies
    }

    /// Management-plane access for installing or re-rating policies.
    pub fn policies_mut(&mut self) -> &mut PolicyTree {
        &mut self.policies
    }

    pub fn classifier(&self) -> &Arc<FlowClassifier> {
        &self.classifier
    }

    /// Classify, meter, and mark one packet.
    ///
    /// Writes `flow_id`, `conformance`, and the mapped `priority` onto the
    /// descriptor. Returns [`Verdict::Drop`] when the policy says red
    /// traffic is dropped, or when the flow's policy cannot be found (the
    /// packet is then marked red). Drops here are ordinary outcomes,
    /// reflected in policy and flow counters rather than errors.
    pub fn process(&mut self, pkt: &mut Pkt, tuple: &FiveTuple) -> Verdict {
        let flow_id = self.classifier.get_or_create(tuple);
        pkt.flow_id = flow_id;
        let len = pkt.len();

        let Some(policy_id) = self.classifier.with_context(flow_id, |ctx| ctx.policy_id) else {
            // Unreachable in practice: get_or_create just installed the
            // context. Treat like a missing policy.
            pkt.conformance = Conformance::Red;
            return Verdict::Drop;
        };

        let metered = self.policies.modify(policy_id, |policy| {
            let color = policy.mark(len);
            let target = policy.target(color);
            let dropped = policy.drop_on_red() && color == Conformance::Red;
            let stats = policy.stats_mut();
            if dropped {
                stats.packets_dropped += 1;
                stats.bytes_dropped += u64::from(len);
            } else {
                stats.packets_processed += 1;
                stats.bytes_processed += u64::from(len);
            }
            (color, target, dropped)
        });

        let (color, target, dropped) = match metered {
            Ok(m) => m,
            Err(err) => {
                debug!(flow_id, policy_id, %err, "flow bound to missing policy, dropping");
                pkt.conformance = Conformance::Red;
                self.note_flow(flow_id, len, Conformance::Red, None, true);
                return Verdict::Drop;
            }
        };

        pkt.conformance = color;
        if !dropped {
            pkt.priority = target.priority;
        }
        self.note_flow(flow_id, len, color, Some(target), dropped);
        trace!(flow_id, ?color, priority = pkt.priority, dropped, "marked packet");

        if dropped {
            Verdict::Drop
        } else {
            Verdict::Enqueue
        }
    }

    fn note_flow(
        &self,
        flow_id: u64,
        len: u32,
        color: Conformance,
        target: Option<ColorTarget>,
        dropped: bool,
    ) {
        let now = self.classifier.clock().now();
        self.classifier.with_context(flow_id, |ctx| {
            ctx.stats.packets_in += 1;
            ctx.stats.bytes_in += u64::from(len);
            if dropped {
                ctx.stats.packets_dropped += 1;
                ctx.stats.bytes_dropped += u64::from(len);
            }
            ctx.accumulated_bytes += u64::from(len);
            if let Some(t) = target {
                ctx.queue_id = t.queue_id;
            }
            // Non-conformance is sticky: one red packet marks the SLA
            // breached until the management plane resets it.
            ctx.sla_status = match (color, ctx.sla_status) {
                (Conformance::Red, _) => SlaStatus::NonConforming,
                (_, SlaStatus::NonConforming) => SlaStatus::NonConforming,
                _ => SlaStatus::Conforming,
            };
            ctx.stats.last_seen = Some(now);
            ctx.last_processed = Some(now);
        });
    }
}

#[cfg(test)]
mod t {
    use super::{TrafficShaper, Verdict};
    use crate::flow::{FlowClassifier, SlaStatus};
    use crate::policy::t::spec;
    use crate::policy::{PolicyTree, NO_PARENT};
    use crate::test_util::init;
    use crate::{Conformance, FiveTuple, Pkt};
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn tuple(sport: u16) -> FiveTuple {
        FiveTuple::new(
            Ipv4Addr::new(192, 168, 0, 1),
            Ipv4Addr::new(192, 168, 0, 2),
            sport,
            80,
            17,
        )
    }

    fn shaper_with(default_policy: u64, tree: PolicyTree) -> TrafficShaper {
        TrafficShaper::new(Arc::new(FlowClassifier::new(default_policy)), tree)
    }

    #[test]
    fn escalates_and_maps_priorities() {
        init();
        // CBS 1500 / EBS 3000, 1000-byte packets: green (peak debited too),
        // yellow, yellow, red.
        let mut tree = PolicyTree::new();
        tree.insert(spec(1, NO_PARENT, "gyr")).unwrap();
        let mut shaper = shaper_with(1, tree);

        let expected = [
            (Conformance::Green, 7),
            (Conformance::Yellow, 4),
            (Conformance::Yellow, 4),
            (Conformance::Red, 1),
        ];
        for (want_color, want_prio) in expected {
            let mut pkt = Pkt::new(0, 1000, 0);
            let verdict = shaper.process(&mut pkt, &tuple(1000));
            assert_eq!(verdict, Verdict::Enqueue);
            assert_eq!(pkt.conformance(), want_color);
            assert_eq!(pkt.priority(), want_prio);
            assert_eq!(pkt.flow_id(), 1);
        }
    }

    #[test]
    fn drop_on_red_drops_only_red() {
        init();
        let mut s = spec(1, NO_PARENT, "strict");
        s.drop_on_red = true;
        // CBS admits one 1000-byte packet, EBS one more.
        s.cbs_bytes = 1000;
        s.ebs_bytes = 2000;
        let mut tree = PolicyTree::new();
        tree.insert(s).unwrap();
        let mut shaper = shaper_with(1, tree);

        let mut p1 = Pkt::new(0, 1000, 0);
        assert_eq!(shaper.process(&mut p1, &tuple(1)), Verdict::Enqueue);
        assert_eq!(p1.conformance(), Conformance::Green);

        let mut p2 = Pkt::new(0, 1000, 0);
        assert_eq!(shaper.process(&mut p2, &tuple(1)), Verdict::Enqueue);
        assert_eq!(p2.conformance(), Conformance::Yellow);

        let mut p3 = Pkt::new(0, 1000, 0);
        assert_eq!(shaper.process(&mut p3, &tuple(1)), Verdict::Drop);
        assert_eq!(p3.conformance(), Conformance::Red);
        // priority is left alone on a dropped packet
        assert_eq!(p3.priority(), 0);

        let stats = shaper.policies().get(1).unwrap().stats();
        assert_eq!(stats.packets_processed, 2);
        assert_eq!(stats.packets_dropped, 1);
        assert_eq!(stats.bytes_dropped, 1000);
    }

    #[test]
    fn missing_policy_marks_red_and_drops() {
        init();
        // classifier binds flows to policy 42, which is not in the tree
        let mut shaper = shaper_with(42, PolicyTree::new());
        let mut pkt = Pkt::new(0, 800, 3);
        assert_eq!(shaper.process(&mut pkt, &tuple(7)), Verdict::Drop);
        assert_eq!(pkt.conformance(), Conformance::Red);
        assert_eq!(pkt.priority(), 3);

        let ctx = shaper.classifier().context(pkt.flow_id()).unwrap();
        assert_eq!(ctx.stats.packets_dropped, 1);
        assert_eq!(ctx.sla_status, SlaStatus::NonConforming);
    }

    #[test]
    fn flow_context_tracks_marking_outcomes() {
        init();
        let mut tree = PolicyTree::new();
        tree.insert(spec(1, NO_PARENT, "gyr")).unwrap();
        let mut shaper = shaper_with(1, tree);

        let mut pkt = Pkt::new(0, 1000, 0);
        shaper.process(&mut pkt, &tuple(9));
        let ctx = shaper.classifier().context(pkt.flow_id()).unwrap();
        assert_eq!(ctx.stats.packets_in, 1);
        assert_eq!(ctx.stats.bytes_in, 1000);
        assert_eq!(ctx.sla_status, SlaStatus::Conforming);
        // steered to the green queue of the policy map
        assert_eq!(ctx.queue_id, 10);
        assert!(ctx.last_processed.is_some());

        // exhaust both buckets: red, non-conforming, yellow queue forgotten
        for _ in 0..4 {
            let mut p = Pkt::new(0, 1000, 0);
            shaper.process(&mut p, &tuple(9));
        }
        let ctx = shaper.classifier().context(pkt.flow_id()).unwrap();
        assert_eq!(ctx.sla_status, SlaStatus::NonConforming);
        assert_eq!(ctx.stats.packets_in, 5);
        // red maps to queue 12 in the test policy
        assert_eq!(ctx.queue_id, 12);
    }

    #[test]
    fn distinct_flows_meter_against_one_policy() {
        init();
        let mut tree = PolicyTree::new();
        tree.insert(spec(1, NO_PARENT, "shared")).unwrap();
        let mut shaper = shaper_with(1, tree);

        // Two flows share policy 1, so the second flow's first packet sees
        // a committed bucket already drained by the first flow.
        let mut a = Pkt::new(0, 1500, 0);
        assert_eq!(shaper.process(&mut a, &tuple(100)), Verdict::Enqueue);
        assert_eq!(a.conformance(), Conformance::Green);

        let mut b = Pkt::new(0, 1500, 0);
        assert_eq!(shaper.process(&mut b, &tuple(200)), Verdict::Enqueue);
        assert_ne!(a.flow_id(), b.flow_id());
        assert_eq!(b.conformance(), Conformance::Yellow);
    }
}
