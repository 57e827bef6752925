//! N-way trace comparison.
//!
//! Aligns finalized cycles from several sources by TTL, detects hops
//! shared between sources, and renders either a column-per-source table
//! (up to three sources) or a stacked per-source view.

use crate::enrich::Enrichment;
use crate::tracer::{CycleResult, HopRecord};

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::IpAddr;

/// Column width bounds for the tabular rendering.
const MIN_COLUMN_WIDTH: usize = 25;
const MAX_COLUMN_WIDTH: usize = 45;

/// The number of sources a column-per-source table can hold before the
/// renderer switches to the stacked view.
const MAX_TABLE_SOURCES: usize = 3;

const SPARK_BARS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// One trace to compare: where it ran and what it saw, with optional
/// per-address enrichment for nicer cells.
pub struct TraceSource {
    pub label: String,
    pub cycle: CycleResult,
    pub enrichment: BTreeMap<IpAddr, Enrichment>,
}

impl TraceSource {
    pub fn new(label: impl Into<String>, cycle: CycleResult) -> Self {
        Self {
            label: label.into(),
            cycle,
            enrichment: BTreeMap::new(),
        }
    }

    fn hop(&self, ttl: u8) -> Option<&HopRecord> {
        self.cycle.hops.iter().find(|hop| hop.ttl == ttl)
    }
}

/// A set of traces to the same (or different) targets from N sources.
pub struct Comparison {
    sources: Vec<TraceSource>,
}

impl Comparison {
    pub fn new(sources: Vec<TraceSource>) -> Self {
        Self { sources }
    }

    pub fn sources(&self) -> &[TraceSource] {
        &self.sources
    }

    fn max_ttl(&self) -> u8 {
        self.sources
            .iter()
            .flat_map(|s| s.cycle.hops.iter().map(|h| h.ttl))
            .max()
            .unwrap_or(0)
    }

    /// For each TTL, how many sources saw each responder address.
    pub fn address_counts(&self) -> BTreeMap<u8, BTreeMap<IpAddr, usize>> {
        let mut table: BTreeMap<u8, BTreeMap<IpAddr, usize>> = BTreeMap::new();
        for source in &self.sources {
            for hop in &source.cycle.hops {
                let counts = table.entry(hop.ttl).or_default();
                for addr in hop.unique_addrs() {
                    *counts.entry(addr).or_insert(0) += 1;
                }
            }
        }
        table
    }

    /// Addresses seen by at least two sources at the same TTL.
    pub fn common_hops(&self) -> BTreeMap<u8, Vec<IpAddr>> {
        self.address_counts()
            .into_iter()
            .filter_map(|(ttl, counts)| {
                let common: Vec<IpAddr> = counts
                    .into_iter()
                    .filter(|(_, count)| *count >= 2)
                    .map(|(addr, _)| addr)
                    .collect();
                (!common.is_empty()).then_some((ttl, common))
            })
            .collect()
    }

    /// Render the comparison as text: a column per source when few
    /// enough, a stacked per-source view otherwise.
    pub fn render(&self) -> String {
        if self.sources.len() <= MAX_TABLE_SOURCES {
            self.render_columns()
        } else {
            self.render_stacked()
        }
    }

    fn render_columns(&self) -> String {
        let common = self.common_hops();
        let width = self.column_width(&common);
        let mut out = String::new();
        write!(out, "{:>4} ", "hop").unwrap();
        for source in &self.sources {
            write!(out, " {:<width$}", clip(&source.label, width)).unwrap();
        }
        out.push('\n');
        for ttl in 1..=self.max_ttl() {
            write!(out, "{ttl:>4} ").unwrap();
            for source in &self.sources {
                let cell = source
                    .hop(ttl)
                    .map(|hop| cell_contents(source, hop, &common))
                    .unwrap_or_default();
                write!(out, " {:<width$}", clip(&cell, width)).unwrap();
            }
            out.push('\n');
        }
        out
    }

    fn render_stacked(&self) -> String {
        let common = self.common_hops();
        let mut out = String::new();
        for source in &self.sources {
            writeln!(out, "== {}", source.label).unwrap();
            for ttl in 1..=self.max_ttl() {
                let cell = source
                    .hop(ttl)
                    .map(|hop| cell_contents(source, hop, &common))
                    .unwrap_or_default();
                writeln!(out, "{ttl:>4}  {cell}").unwrap();
            }
        }
        out
    }

    fn column_width(&self, common: &BTreeMap<u8, Vec<IpAddr>>) -> usize {
        let mut width = self
            .sources
            .iter()
            .map(|source| source.label.chars().count())
            .max()
            .unwrap_or(0);
        for source in &self.sources {
            for hop in &source.cycle.hops {
                width = width.max(cell_contents(source, hop, common).chars().count());
            }
        }
        width.clamp(MIN_COLUMN_WIDTH, MAX_COLUMN_WIDTH)
    }
}

/// One rendered cell: responder (name or address), ASN tag, average RTT
/// and a sparkline over the hop's probes. A hop that saw no responses
/// renders the traditional `* * *`.
fn cell_contents(
    source: &TraceSource,
    hop: &HopRecord,
    common: &BTreeMap<u8, Vec<IpAddr>>,
) -> String {
    let Some(primary) = hop.primary_addr() else {
        return "* * *".to_string();
    };
    let enrichment = source.enrichment.get(&primary);
    let name = enrichment
        .and_then(|e| e.hostname.clone())
        .unwrap_or_else(|| primary.to_string());
    let shared = common
        .get(&hop.ttl)
        .is_some_and(|addrs| addrs.contains(&primary));
    let mut cell = String::new();
    if shared {
        cell.push('*');
    }
    cell.push_str(&name);
    if let Some(asn) = enrichment.and_then(|e| e.asn) {
        write!(cell, " [AS{asn}]").unwrap();
    }
    let rtts: Vec<f64> = hop
        .probes
        .iter()
        .filter(|p| !p.timed_out)
        .map(|p| p.elapsed.as_secs_f64() * 1000.0)
        .collect();
    if !rtts.is_empty() {
        let avg = rtts.iter().sum::<f64>() / rtts.len() as f64;
        write!(cell, " {avg:.1}ms {}", sparkline(&rtts)).unwrap();
    }
    cell
}

/// Map samples onto eight bar glyphs, scaled to the largest sample.
pub fn sparkline(samples: &[f64]) -> String {
    let max = samples.iter().copied().fold(0.0_f64, f64::max);
    samples
        .iter()
        .map(|&sample| {
            if max <= 0.0 {
                SPARK_BARS[0]
            } else {
                let index = (sample / max * (SPARK_BARS.len() - 1) as f64).round() as usize;
                SPARK_BARS[index.min(SPARK_BARS.len() - 1)]
            }
        })
        .collect()
}

fn clip(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        text.chars().take(width.saturating_sub(1)).chain(['…']).collect()
    }
}
