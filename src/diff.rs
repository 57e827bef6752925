//! Cross-cycle change detection.
//!
//! Successive finalized cycles are compared hop by hop; route, latency,
//! loss, MPLS and ASN movements above the configured thresholds are
//! delivered to the caller as one batch per comparison.

use crate::tracer::{CycleResult, HopRecord};

use serde::Serialize;

use std::collections::BTreeMap;
use std::net::IpAddr;

/// A detected difference between two cycles at one TTL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ChangeEvent {
    RouteChange {
        ttl: u8,
        previous: Option<IpAddr>,
        current: Option<IpAddr>,
    },
    LatencyChange {
        ttl: u8,
        previous_ms: f64,
        current_ms: f64,
    },
    LossChange {
        ttl: u8,
        previous_percent: f64,
        current_percent: f64,
    },
    MplsChange {
        ttl: u8,
        previous: Vec<(u32, u8)>,
        current: Vec<(u32, u8)>,
    },
    AsnChange {
        ttl: u8,
        previous: u32,
        current: u32,
    },
}

/// Thresholds below which latency and loss movements are ignored.
#[derive(Debug, Clone, Copy)]
pub struct ChangeThresholds {
    pub latency_ms: f64,
    pub loss_percent: f64,
}

impl Default for ChangeThresholds {
    fn default() -> Self {
        Self {
            latency_ms: 50.0,
            loss_percent: 10.0,
        }
    }
}

/// Which change kinds to report.
#[derive(Debug, Clone, Copy)]
pub struct ChangeFlags {
    pub route: bool,
    pub latency: bool,
    pub loss: bool,
    pub mpls: bool,
    pub asn: bool,
}

impl Default for ChangeFlags {
    fn default() -> Self {
        Self {
            route: true,
            latency: true,
            loss: true,
            mpls: true,
            asn: true,
        }
    }
}

/// The per-TTL digest the detector actually compares.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HopSample {
    pub ttl: u8,
    pub primary: Option<IpAddr>,
    pub avg_ms: f64,
    pub loss_percent: f64,
    /// The ordered `(label, ttl)` tuples of the hop's MPLS stack.
    pub mpls: Vec<(u32, u8)>,
    /// Zero when unknown.
    pub asn: u32,
}

impl HopSample {
    /// Digest one hop record, attaching the ASN the caller knows for its
    /// primary responder.
    pub fn from_record(record: &HopRecord, asn: u32) -> Self {
        let responded = record.responded();
        let avg_ms = if responded == 0 {
            0.0
        } else {
            record
                .probes
                .iter()
                .filter(|p| !p.timed_out)
                .map(|p| p.elapsed.as_secs_f64() * 1000.0)
                .sum::<f64>()
                / responded as f64
        };
        let loss_percent = if record.probes.is_empty() {
            0.0
        } else {
            (record.probes.len() - responded) as f64 / record.probes.len() as f64 * 100.0
        };
        Self {
            ttl: record.ttl,
            primary: record.primary_addr(),
            avg_ms,
            loss_percent,
            mpls: record
                .mpls_stack()
                .iter()
                .map(|label| (label.label, label.ttl))
                .collect(),
            asn,
        }
    }
}

/// Digest a whole cycle, resolving ASNs through `asn_of`.
pub fn samples_from_cycle(
    cycle: &CycleResult,
    mut asn_of: impl FnMut(IpAddr) -> Option<u32>,
) -> Vec<HopSample> {
    cycle
        .hops
        .iter()
        .map(|hop| {
            let asn = hop
                .primary_addr()
                .and_then(&mut asn_of)
                .unwrap_or_default();
            HopSample::from_record(hop, asn)
        })
        .collect()
}

/// Compares each finalized cycle against the previous one.
pub struct ChangeDetector {
    thresholds: ChangeThresholds,
    flags: ChangeFlags,
    previous: Option<BTreeMap<u8, HopSample>>,
}

impl ChangeDetector {
    pub fn new(thresholds: ChangeThresholds, flags: ChangeFlags) -> Self {
        Self {
            thresholds,
            flags,
            previous: None,
        }
    }

    /// Compare `samples` against the previous observation and return the
    /// batch of changes; the new observation then replaces the old one.
    ///
    /// The first observation never yields changes.
    pub fn observe(&mut self, samples: Vec<HopSample>) -> Vec<ChangeEvent> {
        let current: BTreeMap<u8, HopSample> =
            samples.into_iter().map(|s| (s.ttl, s)).collect();
        let mut changes = Vec::new();
        if let Some(previous) = &self.previous {
            let ttls: std::collections::BTreeSet<u8> =
                previous.keys().chain(current.keys()).copied().collect();
            for ttl in ttls {
                self.compare_hop(ttl, previous.get(&ttl), current.get(&ttl), &mut changes);
            }
        }
        self.previous = Some(current);
        changes
    }

    fn compare_hop(
        &self,
        ttl: u8,
        previous: Option<&HopSample>,
        current: Option<&HopSample>,
        changes: &mut Vec<ChangeEvent>,
    ) {
        let prev_primary = previous.and_then(|h| h.primary);
        let cur_primary = current.and_then(|h| h.primary);
        if self.flags.route && prev_primary != cur_primary {
            changes.push(ChangeEvent::RouteChange {
                ttl,
                previous: prev_primary,
                current: cur_primary,
            });
        }
        let (Some(previous), Some(current)) = (previous, current) else {
            return;
        };
        if self.flags.latency
            && current.avg_ms > self.thresholds.latency_ms
            && current.avg_ms > previous.avg_ms
        {
            changes.push(ChangeEvent::LatencyChange {
                ttl,
                previous_ms: previous.avg_ms,
                current_ms: current.avg_ms,
            });
        }
        if self.flags.loss
            && current.loss_percent > self.thresholds.loss_percent
            && current.loss_percent > previous.loss_percent
        {
            changes.push(ChangeEvent::LossChange {
                ttl,
                previous_percent: previous.loss_percent,
                current_percent: current.loss_percent,
            });
        }
        if self.flags.mpls && previous.mpls != current.mpls {
            changes.push(ChangeEvent::MplsChange {
                ttl,
                previous: previous.mpls.clone(),
                current: current.mpls.clone(),
            });
        }
        if self.flags.asn && previous.asn != 0 && current.asn != 0 && previous.asn != current.asn {
            changes.push(ChangeEvent::AsnChange {
                ttl,
                previous: previous.asn,
                current: current.asn,
            });
        }
    }
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new(ChangeThresholds::default(), ChangeFlags::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ttl: u8, primary: Option<&str>) -> HopSample {
        HopSample {
            ttl,
            primary: primary.map(|p| p.parse().unwrap()),
            avg_ms: 10.0,
            loss_percent: 0.0,
            mpls: Vec::new(),
            asn: 0,
        }
    }

    fn path() -> Vec<HopSample> {
        vec![
            sample(1, Some("192.168.1.1")),
            sample(2, Some("10.0.0.1")),
            sample(3, Some("8.8.8.8")),
        ]
    }

    #[test]
    fn test_first_observation_is_silent() {
        let mut detector = ChangeDetector::default();
        assert!(detector.observe(path()).is_empty());
    }

    #[test]
    fn test_identical_cycles_yield_no_changes() {
        let mut detector = ChangeDetector::default();
        detector.observe(path());
        assert!(detector.observe(path()).is_empty());
    }

    #[test]
    fn test_route_change_at_one_ttl() {
        let mut detector = ChangeDetector::default();
        detector.observe(path());
        let mut current = path();
        current[1] = sample(2, Some("10.0.0.2"));
        let changes = detector.observe(current);
        assert_eq!(
            changes,
            vec![ChangeEvent::RouteChange {
                ttl: 2,
                previous: Some("10.0.0.1".parse().unwrap()),
                current: Some("10.0.0.2".parse().unwrap()),
            }]
        );
    }

    #[test]
    fn test_hop_appearing_is_a_route_change() {
        let mut detector = ChangeDetector::default();
        detector.observe(path()[..2].to_vec());
        let changes = detector.observe(path());
        assert_eq!(
            changes,
            vec![ChangeEvent::RouteChange {
                ttl: 3,
                previous: None,
                current: Some("8.8.8.8".parse().unwrap()),
            }]
        );
    }

    #[test]
    fn test_latency_change_requires_threshold_and_increase() {
        let mut detector = ChangeDetector::default();
        detector.observe(path());
        let mut current = path();
        current[2].avg_ms = 80.0;
        let changes = detector.observe(current.clone());
        assert_eq!(changes.len(), 1);
        assert!(matches!(
            changes[0],
            ChangeEvent::LatencyChange {
                ttl: 3,
                current_ms,
                ..
            } if current_ms == 80.0
        ));
        // Above threshold but decreasing: silent.
        let mut lower = current;
        lower[2].avg_ms = 60.0;
        assert!(detector.observe(lower).is_empty());
    }

    #[test]
    fn test_loss_change() {
        let mut detector = ChangeDetector::default();
        detector.observe(path());
        let mut current = path();
        current[0].loss_percent = 50.0;
        let changes = detector.observe(current);
        assert_eq!(changes.len(), 1);
        assert!(matches!(changes[0], ChangeEvent::LossChange { ttl: 1, .. }));
    }

    #[test]
    fn test_mpls_change_compares_ordered_tuples() {
        let mut detector = ChangeDetector::default();
        let mut previous = path();
        previous[1].mpls = vec![(100, 64), (200, 63)];
        detector.observe(previous);
        let mut current = path();
        current[1].mpls = vec![(200, 63), (100, 64)];
        let changes = detector.observe(current);
        assert_eq!(changes.len(), 1);
        assert!(matches!(changes[0], ChangeEvent::MplsChange { ttl: 2, .. }));
    }

    #[test]
    fn test_asn_change_needs_both_sides_known() {
        let mut detector = ChangeDetector::default();
        let mut previous = path();
        previous[2].asn = 15169;
        detector.observe(previous);
        // Unknown on one side: silent.
        let changes = detector.observe(path());
        assert!(changes.is_empty());
        let mut current = path();
        current[2].asn = 64500;
        // previous (asn 0) vs current (64500): still silent.
        assert!(detector.observe(current.clone()).is_empty());
        current[2].asn = 3356;
        let changes = detector.observe(current);
        assert_eq!(
            changes,
            vec![ChangeEvent::AsnChange {
                ttl: 3,
                previous: 64500,
                current: 3356
            }]
        );
    }

    #[test]
    fn test_flags_disable_kinds() {
        let mut detector = ChangeDetector::new(
            ChangeThresholds::default(),
            ChangeFlags {
                route: false,
                ..Default::default()
            },
        );
        detector.observe(path());
        let mut current = path();
        current[1] = sample(2, Some("10.0.0.2"));
        assert!(detector.observe(current).is_empty());
    }
}
