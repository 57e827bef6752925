//! Live per-TTL statistics for a continuous trace.
//!
//! The store is written by a single event pump consuming the continuous
//! tracer's probe stream and read concurrently by any number of viewers;
//! writes take the lock exclusively, reads share it.

use crate::enrich::Enrichment;
use crate::tracer::ProbeEvent;

use parking_lot::RwLock;
use serde::Serialize;

use std::collections::{BTreeMap, VecDeque};
use std::net::IpAddr;
use std::time::Duration;

/// Default number of recent RTT samples retained per hop.
pub const DEFAULT_HISTORY: usize = 10;

/// Aggregates for a single TTL.
#[derive(Debug, Clone, Serialize)]
pub struct HopStats {
    pub ttl: u8,
    pub sent: u64,
    pub received: u64,
    best: Option<Duration>,
    worst: Option<Duration>,
    sum: Duration,
    last: Option<Duration>,
    history: VecDeque<Duration>,
    history_capacity: usize,
    responders: BTreeMap<IpAddr, u64>,
    enrichment: BTreeMap<IpAddr, Enrichment>,
    last_responder: Option<IpAddr>,
}

impl HopStats {
    pub fn new(ttl: u8, history_capacity: usize) -> Self {
        Self {
            ttl,
            sent: 0,
            received: 0,
            best: None,
            worst: None,
            sum: Duration::ZERO,
            last: None,
            history: VecDeque::with_capacity(history_capacity),
            history_capacity: history_capacity.max(1),
            responders: BTreeMap::new(),
            enrichment: BTreeMap::new(),
            last_responder: None,
        }
    }

    fn record_response(&mut self, responder: IpAddr, rtt: Duration) {
        self.sent += 1;
        self.received += 1;
        self.last = Some(rtt);
        self.sum += rtt;
        self.best = Some(self.best.map_or(rtt, |b| b.min(rtt)));
        self.worst = Some(self.worst.map_or(rtt, |w| w.max(rtt)));
        if self.history.len() == self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(rtt);
        *self.responders.entry(responder).or_insert(0) += 1;
        self.last_responder = Some(responder);
    }

    fn record_timeout(&mut self) {
        self.sent += 1;
    }

    /// Probe loss at this hop, in percent.
    pub fn loss_percent(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            (self.sent - self.received) as f64 / self.sent as f64 * 100.0
        }
    }

    pub fn last_ms(&self) -> Option<f64> {
        self.last.map(as_millis)
    }

    pub fn best_ms(&self) -> Option<f64> {
        self.best.map(as_millis)
    }

    pub fn worst_ms(&self) -> Option<f64> {
        self.worst.map(as_millis)
    }

    pub fn avg_ms(&self) -> f64 {
        if self.received == 0 {
            0.0
        } else {
            as_millis(self.sum) / self.received as f64
        }
    }

    /// Population standard deviation over the retained samples; zero with
    /// fewer than two.
    pub fn std_dev_ms(&self) -> f64 {
        if self.history.len() < 2 {
            return 0.0;
        }
        let samples: Vec<f64> = self.history.iter().copied().map(as_millis).collect();
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let variance =
            samples.iter().map(|s| (s - mean) * (s - mean)).sum::<f64>() / samples.len() as f64;
        variance.sqrt()
    }

    /// Recent RTT samples, oldest first.
    pub fn samples(&self) -> impl Iterator<Item = Duration> + '_ {
        self.history.iter().copied()
    }

    /// The responder with the most probes; ties break to the
    /// lexicographically smaller address.
    pub fn primary_responder(&self) -> Option<IpAddr> {
        self.responders
            .iter()
            .max_by(|(a, ca), (b, cb)| ca.cmp(cb).then_with(|| b.to_string().cmp(&a.to_string())))
            .map(|(addr, _)| *addr)
            .or(self.last_responder)
    }

    /// Whether more than one distinct router answered at this TTL.
    pub fn has_ecmp(&self) -> bool {
        self.responders.len() > 1
    }

    /// Responders by descending probe count, then ascending address.
    pub fn sorted_responders(&self) -> Vec<(IpAddr, u64)> {
        let mut responders: Vec<(IpAddr, u64)> =
            self.responders.iter().map(|(a, c)| (*a, *c)).collect();
        responders.sort_by(|(a, ca), (b, cb)| {
            cb.cmp(ca).then_with(|| a.to_string().cmp(&b.to_string()))
        });
        responders
    }

    pub fn responder_count(&self, addr: IpAddr) -> u64 {
        self.responders.get(&addr).copied().unwrap_or(0)
    }

    pub fn enrichment_for(&self, addr: IpAddr) -> Option<&Enrichment> {
        self.enrichment.get(&addr)
    }

    /// The enrichment of the primary responder, for views that render a
    /// single value per hop.
    pub fn primary_enrichment(&self) -> Option<&Enrichment> {
        self.primary_responder()
            .and_then(|addr| self.enrichment.get(&addr))
    }

    fn reset(&mut self) {
        *self = Self::new(self.ttl, self.history_capacity);
    }
}

/// The mapping from TTL to live hop statistics.
pub struct HopStatsStore {
    hops: RwLock<BTreeMap<u8, HopStats>>,
    history_capacity: usize,
}

impl Default for HopStatsStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl HopStatsStore {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            hops: RwLock::new(BTreeMap::new()),
            history_capacity,
        }
    }

    pub fn record_response(&self, ttl: u8, responder: IpAddr, rtt: Duration) {
        let mut hops = self.hops.write();
        hops.entry(ttl)
            .or_insert_with(|| HopStats::new(ttl, self.history_capacity))
            .record_response(responder, rtt);
    }

    pub fn record_timeout(&self, ttl: u8) {
        let mut hops = self.hops.write();
        hops.entry(ttl)
            .or_insert_with(|| HopStats::new(ttl, self.history_capacity))
            .record_timeout();
    }

    /// Fold one probe event from the continuous stream into the store.
    pub fn apply(&self, event: &ProbeEvent) {
        match (event.addr, event.rtt) {
            (Some(addr), Some(rtt)) => self.record_response(event.ttl, addr, rtt),
            _ => self.record_timeout(event.ttl),
        }
    }

    pub fn set_enrichment(&self, ttl: u8, responder: IpAddr, enrichment: Enrichment) {
        let mut hops = self.hops.write();
        hops.entry(ttl)
            .or_insert_with(|| HopStats::new(ttl, self.history_capacity))
            .enrichment
            .insert(responder, enrichment);
    }

    /// Clear all counters and history while keeping the known TTL keys.
    pub fn reset(&self) {
        for stats in self.hops.write().values_mut() {
            stats.reset();
        }
    }

    /// A point-in-time copy of every hop, in TTL order.
    pub fn snapshot(&self) -> Vec<HopStats> {
        self.hops.read().values().cloned().collect()
    }

    pub fn hop(&self, ttl: u8) -> Option<HopStats> {
        self.hops.read().get(&ttl).cloned()
    }

    pub fn len(&self) -> usize {
        self.hops.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.read().is_empty()
    }
}

fn as_millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
