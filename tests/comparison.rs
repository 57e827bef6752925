use path_probe::packet::ResponseKind;
use path_probe::{Comparison, CycleResult, Enrichment, HopRecord, ProbeOutcome, TraceSource};

use std::net::IpAddr;
use std::time::{Duration, SystemTime};

fn outcome(ttl: u8, responder: &str, rtt_ms: u64) -> ProbeOutcome {
    ProbeOutcome {
        ttl,
        flow_id: 0,
        sent_at: SystemTime::UNIX_EPOCH,
        elapsed: Duration::from_millis(rtt_ms),
        responder: Some(responder.parse().unwrap()),
        response_kind: Some(ResponseKind::TimeExceeded),
        response_ttl: None,
        mpls_labels: Vec::new(),
        reported_mtu: None,
        timed_out: false,
    }
}

fn cycle(path: &[(u8, &str, u64)]) -> CycleResult {
    let hops = path
        .iter()
        .map(|&(ttl, addr, rtt)| {
            let mut hop = HopRecord::new(ttl);
            hop.probes.push(outcome(ttl, addr, rtt));
            hop
        })
        .collect();
    CycleResult {
        target: "8.8.8.8".into(),
        target_addr: "8.8.8.8".parse().unwrap(),
        reached: true,
        hops,
        started_at: SystemTime::UNIX_EPOCH,
        ended_at: SystemTime::UNIX_EPOCH,
    }
}

fn three_sources() -> Comparison {
    Comparison::new(vec![
        TraceSource::new(
            "paris",
            cycle(&[(1, "10.1.0.1", 1), (2, "62.0.0.1", 9), (3, "8.8.8.8", 14)]),
        ),
        TraceSource::new(
            "berlin",
            cycle(&[(1, "10.2.0.1", 2), (2, "62.0.0.1", 12), (3, "8.8.8.8", 18)]),
        ),
        TraceSource::new(
            "tokyo",
            cycle(&[(1, "10.3.0.1", 1), (2, "72.0.0.9", 80), (3, "8.8.8.8", 95)]),
        ),
    ])
}

#[test]
fn common_hops_require_at_least_two_sources() {
    let comparison = three_sources();
    let common = comparison.common_hops();
    assert_eq!(common[&2], vec!["62.0.0.1".parse::<IpAddr>().unwrap()]);
    assert_eq!(common[&3], vec!["8.8.8.8".parse::<IpAddr>().unwrap()]);
    assert!(!common.contains_key(&1));
}

#[test]
fn address_counts_span_sources() {
    let counts = three_sources().address_counts();
    assert_eq!(counts[&3][&"8.8.8.8".parse::<IpAddr>().unwrap()], 3);
    assert_eq!(counts[&2][&"62.0.0.1".parse::<IpAddr>().unwrap()], 2);
    assert_eq!(counts[&2][&"72.0.0.9".parse::<IpAddr>().unwrap()], 1);
}

#[test]
fn three_sources_render_as_columns() {
    let rendered = three_sources().render();
    let lines: Vec<&str> = rendered.lines().collect();
    assert_eq!(lines.len(), 4);
    for label in ["paris", "berlin", "tokyo"] {
        assert!(lines[0].contains(label));
    }
    // Common hops are starred.
    assert!(lines[2].contains("*62.0.0.1"));
    assert!(lines[3].contains("*8.8.8.8"));
}

#[test]
fn four_sources_render_stacked() {
    let mut sources = Vec::new();
    for i in 0..4 {
        sources.push(TraceSource::new(
            format!("site-{i}"),
            cycle(&[(1, "10.0.0.1", 1)]),
        ));
    }
    let rendered = Comparison::new(sources).render();
    for i in 0..4 {
        assert!(rendered.contains(&format!("== site-{i}")));
    }
}

#[test]
fn enrichment_shows_names_and_asn_tags() {
    let mut source = TraceSource::new("home", cycle(&[(1, "8.8.8.8", 10)]));
    source.enrichment.insert(
        "8.8.8.8".parse().unwrap(),
        Enrichment {
            asn: Some(15169),
            hostname: Some("dns.google".into()),
            ..Default::default()
        },
    );
    let rendered = Comparison::new(vec![source]).render();
    assert!(rendered.contains("dns.google [AS15169]"));
}
