//! The per-interface packet pipeline: classifier -> shaper -> scheduler.

use crate::flow::{FlowClassifier, INVALID_FLOW};
use crate::scheduler::{Scheduler, SchedulerKind};
use crate::shaper::{TrafficShaper, Verdict};
use crate::wire;
use crate::{FiveTuple, Pkt};
use color_eyre::eyre::Report;
use std::sync::Arc;
use tracing::debug;

/// One interface's data path. Ingress packets are classified, metered, and
/// enqueued; egress slots pop whatever the scheduler picks. The pipeline
/// does not retry, reorder, or buffer outside the scheduler.
pub struct PacketPipeline {
    classifier: Arc<FlowClassifier>,
    shaper: TrafficShaper,
    scheduler: SchedulerKind,
}

impl PacketPipeline {
    pub fn new(shaper: TrafficShaper, scheduler: impl Into<SchedulerKind>) -> Self {
        let classifier = Arc::clone(shaper.classifier());
        Self {
            classifier,
            shaper,
            scheduler: scheduler.into(),
        }
    }

    /// Ingest one parsed packet. The descriptor is built here, shaped, and
    /// enqueued unless the shaper (or AQM, downstream) drops it. Shaper
    /// drops are ordinary outcomes; an error means the packet named a
    /// queue/class the scheduler does not have.
    pub fn handle_incoming(
        &mut self,
        tuple: &FiveTuple,
        len_bytes: u32,
        payload: Option<Vec<u8>>,
    ) -> Result<(), Report> {
        let mut pkt = Pkt::new(INVALID_FLOW, len_bytes, 0);
        if let Some(payload) = payload {
            pkt = pkt.with_payload(payload);
        }
        match self.shaper.process(&mut pkt, tuple) {
            Verdict::Enqueue => self.scheduler.enq(pkt),
            Verdict::Drop => {
                debug!(flow_id = pkt.flow_id(), len = len_bytes, "shaper dropped packet");
                Ok(())
            }
        }
    }

    /// Ingest a raw ethernet frame via the wire harness.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Result<(), Report> {
        let (tuple, len, payload) = wire::parse_frame(frame)?;
        self.handle_incoming(&tuple, len, Some(payload))
    }

    /// Pop the next packet to transmit, or `None` when the interface has
    /// nothing queued.
    pub fn next_transmit(&mut self) -> Result<Option<Pkt>, Report> {
        self.scheduler.deq()
    }

    pub fn classifier(&self) -> &Arc<FlowClassifier> {
        &self.classifier
    }

    pub fn shaper(&self) -> &TrafficShaper {
        &self.shaper
    }

    pub fn shaper_mut(&mut self) -> &mut TrafficShaper {
        &mut self.shaper
    }

    pub fn scheduler(&self) -> &SchedulerKind {
        &self.scheduler
    }

    pub fn queued_packets(&self) -> usize {
        self.scheduler.len_packets()
    }
}
