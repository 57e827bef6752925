//! The single-cycle tracer: one pass over TTLs 1..=max_hops.

use crate::cancellation::CancelToken;
use crate::net::prober::Prober;
use crate::tracer::{CycleResult, HopRecord};
use crate::{TraceResult, config::TraceConfig};

use tracing::debug;

use std::net::IpAddr;
use std::time::SystemTime;

/// How many probes to aim at each TTL, and how to identify their flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowMode {
    /// `packets_per_hop` identical probes (flow id 0).
    Repeat(u16),
    /// One probe per diversified flow id `1..=n` to tease out equal-cost
    /// paths.
    Diversified(u16),
}

impl FlowMode {
    pub fn from_config(config: &TraceConfig) -> Self {
        if config.ecmp_flows > 0 {
            Self::Diversified(config.ecmp_flows)
        } else {
            Self::Repeat(config.packets_per_hop.max(1))
        }
    }

    fn flow_ids(self) -> impl Iterator<Item = u16> {
        match self {
            Self::Repeat(n) => (0..n.max(1)).map(|_| 0).collect::<Vec<_>>().into_iter(),
            Self::Diversified(n) => (1..=n.max(1)).collect::<Vec<_>>().into_iter(),
        }
    }
}

/// Drives a [`Prober`] over increasing TTLs until the target answers or
/// `max_hops` is exhausted.
pub struct CycleTracer<P> {
    prober: P,
    target: String,
    target_addr: IpAddr,
    max_hops: u8,
    flow_mode: FlowMode,
}

impl<P: Prober> CycleTracer<P> {
    pub fn new(
        prober: P,
        target: impl Into<String>,
        target_addr: IpAddr,
        max_hops: u8,
        flow_mode: FlowMode,
    ) -> Self {
        Self {
            prober,
            target: target.into(),
            target_addr,
            max_hops: max_hops.max(1),
            flow_mode,
        }
    }

    /// Run one cycle, invoking `on_hop` as each TTL completes.
    ///
    /// Cancellation is checked at every TTL boundary (and inside each
    /// probe's receive loop); a cancelled cycle returns the hops gathered
    /// so far without error.
    pub fn run(
        &mut self,
        cancel: &CancelToken,
        mut on_hop: impl FnMut(&HopRecord),
    ) -> TraceResult<CycleResult> {
        let started_at = SystemTime::now();
        let mut hops = Vec::new();
        let mut reached = false;

        'ttl: for ttl in 1..=self.max_hops {
            if cancel.is_cancelled() {
                debug!(ttl, "cycle cancelled");
                break 'ttl;
            }
            let mut hop = HopRecord::new(ttl);
            for flow_id in self.flow_mode.flow_ids() {
                let outcome = self.prober.probe(ttl, flow_id, cancel)?;
                reached |= outcome.reached(self.target_addr);
                hop.probes.push(outcome);
            }
            on_hop(&hop);
            hops.push(hop);
            if reached {
                debug!(ttl, "target reached");
                break 'ttl;
            }
        }

        Ok(CycleResult {
            target: self.target.clone(),
            target_addr: self.target_addr,
            reached,
            hops,
            started_at,
            ended_at: SystemTime::now(),
        })
    }
}
