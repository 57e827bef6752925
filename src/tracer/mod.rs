//! Tracing engines and their data model.
//!
//! [`cycle`] runs one pass over TTLs 1..max and [`continuous`] loops it at
//! an interval, feeding events to consumers. Both share the hop/cycle
//! records defined here.

pub mod continuous;
pub mod cycle;

use crate::net::prober::ProbeOutcome;
use crate::packet::MplsLabel;

use serde::Serialize;

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

/// Initial TTL values commonly used by host stacks, for NAT inference.
const COMMON_INITIAL_TTLS: [u8; 4] = [32, 64, 128, 255];

/// How far the inferred return path may differ from the forward hop count
/// before the NAT flag is raised.
const NAT_HOP_SLACK: u8 = 5;

/// The ordered probes of one TTL within one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct HopRecord {
    pub ttl: u8,
    pub probes: Vec<ProbeOutcome>,
}

impl HopRecord {
    pub fn new(ttl: u8) -> Self {
        Self {
            ttl,
            probes: Vec::new(),
        }
    }

    /// The most frequent responder; ties break to the lexicographically
    /// smaller address.
    pub fn primary_addr(&self) -> Option<IpAddr> {
        let mut counts: Vec<(IpAddr, usize)> = Vec::new();
        for probe in &self.probes {
            if let Some(addr) = probe.responder {
                match counts.iter_mut().find(|(a, _)| *a == addr) {
                    Some((_, count)) => *count += 1,
                    None => counts.push((addr, 1)),
                }
            }
        }
        counts
            .into_iter()
            .max_by(|(a, ca), (b, cb)| ca.cmp(cb).then_with(|| b.to_string().cmp(&a.to_string())))
            .map(|(addr, _)| addr)
    }

    /// All distinct responders seen at this TTL (the ECMP set).
    pub fn unique_addrs(&self) -> BTreeSet<IpAddr> {
        self.probes.iter().filter_map(|p| p.responder).collect()
    }

    pub fn unique_addr_count(&self) -> usize {
        self.unique_addrs().len()
    }

    /// The MPLS stack of the first probe that carried one.
    pub fn mpls_stack(&self) -> &[MplsLabel] {
        self.probes
            .iter()
            .find(|p| !p.mpls_labels.is_empty())
            .map(|p| p.mpls_labels.as_slice())
            .unwrap_or_default()
    }

    /// The first path MTU reported at this TTL.
    pub fn discovered_mtu(&self) -> Option<u16> {
        self.probes.iter().find_map(|p| p.reported_mtu)
    }

    /// Advisory NAT flag inferred from response TTLs; false-positives on
    /// asymmetric paths.
    pub fn nat_detected(&self) -> bool {
        self.probes
            .iter()
            .filter_map(|p| p.response_ttl)
            .any(|response_ttl| infer_nat(response_ttl, self.ttl))
    }

    pub fn responded(&self) -> usize {
        self.probes.iter().filter(|p| !p.timed_out).count()
    }
}

/// The result of one complete (or cancelled) trace cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleResult {
    /// The target as given by the caller.
    pub target: String,
    pub target_addr: IpAddr,
    /// Whether any probe proved the target itself answered.
    pub reached: bool,
    pub hops: Vec<HopRecord>,
    pub started_at: SystemTime,
    pub ended_at: SystemTime,
}

/// One probe re-emitted on the continuous event stream.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeEvent {
    pub cycle: u64,
    pub ttl: u8,
    pub addr: Option<IpAddr>,
    pub rtt: Option<Duration>,
    pub timed_out: bool,
    pub mpls: Vec<MplsLabel>,
}

impl ProbeEvent {
    pub fn from_outcome(cycle: u64, outcome: &ProbeOutcome) -> Self {
        Self {
            cycle,
            ttl: outcome.ttl,
            addr: outcome.responder,
            rtt: (!outcome.timed_out).then_some(outcome.elapsed),
            timed_out: outcome.timed_out,
            mpls: outcome.mpls_labels.clone(),
        }
    }
}

/// The continuous tracer's event stream.
#[derive(Debug, Clone, Serialize)]
pub enum Event {
    Probe(ProbeEvent),
    CycleComplete { cycle: u64, reached: bool },
    EndOfRun,
}

/// Round an observed response TTL up to the initial value its sender most
/// likely started from.
pub fn infer_initial_ttl(response_ttl: u8) -> u8 {
    COMMON_INITIAL_TTLS
        .into_iter()
        .find(|&initial| response_ttl <= initial)
        .unwrap_or(u8::MAX)
}

/// Infer whether a translator sits between us and the responder at
/// `forward_ttl`: the return path length implied by the response TTL should
/// roughly match the forward hop count.
pub fn infer_nat(response_ttl: u8, forward_ttl: u8) -> bool {
    let return_hops = infer_initial_ttl(response_ttl) - response_ttl + 1;
    return_hops.abs_diff(forward_ttl) > NAT_HOP_SLACK
}

/// A prober that replays a fixed path, shared by the tracer tests.
#[cfg(test)]
pub(crate) mod testsupport {
    use super::*;
    use crate::TraceResult;
    use crate::cancellation::CancelToken;
    use crate::net::prober::{ProbeOutcome, Prober};
    use crate::packet::ResponseKind;

    pub struct ScriptedProber {
        pub path: Vec<(Option<IpAddr>, u64, ResponseKind)>,
        pub probes_sent: usize,
    }

    impl ScriptedProber {
        pub fn new(path: Vec<(Option<&str>, u64, ResponseKind)>) -> Self {
            Self {
                path: path
                    .into_iter()
                    .map(|(addr, ms, kind)| (addr.map(|a| a.parse().unwrap()), ms, kind))
                    .collect(),
                probes_sent: 0,
            }
        }
    }

    impl Prober for ScriptedProber {
        fn probe(
            &mut self,
            ttl: u8,
            flow_id: u16,
            _cancel: &CancelToken,
        ) -> TraceResult<ProbeOutcome> {
            self.probes_sent += 1;
            let (responder, rtt_ms, kind) = self
                .path
                .get(usize::from(ttl) - 1)
                .cloned()
                .unwrap_or((None, 0, ResponseKind::TimeExceeded));
            Ok(ProbeOutcome {
                ttl,
                flow_id,
                sent_at: SystemTime::UNIX_EPOCH,
                elapsed: Duration::from_millis(rtt_ms),
                responder,
                response_kind: responder.map(|_| kind),
                response_ttl: None,
                mpls_labels: Vec::new(),
                reported_mtu: None,
                timed_out: responder.is_none(),
            })
        }
    }
}
