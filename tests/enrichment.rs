use path_probe::enrich::asn::{as_name_query, origin_query_name, parse_as_name_txt,
    parse_origin_txt};
use path_probe::enrich::{DnsClient, EnrichOptions, Enricher, Enrichment, is_non_routable};

use std::net::IpAddr;

#[test]
fn asn_txt_parsing_scenario() {
    let info = parse_origin_txt("15169 | 8.8.8.0/24 | US | arin | 2014-03-14").unwrap();
    assert_eq!(info.asn, 15169);
    assert_eq!(info.prefix, "8.8.8.0/24");
    assert_eq!(info.country, "US");
    assert_eq!(info.registry, "arin");
}

#[test]
fn as_name_parsing() {
    assert_eq!(
        parse_as_name_txt("15169 | US | arin | 2000-03-30 | GOOGLE, US").as_deref(),
        Some("GOOGLE, US")
    );
}

#[test]
fn origin_queries_reverse_correctly() {
    assert_eq!(
        origin_query_name("203.0.113.9".parse().unwrap()),
        "9.113.0.203.origin.asn.cymru.com"
    );
    let v6 = origin_query_name("2001:4860:4860::8888".parse().unwrap());
    assert!(v6.ends_with(".origin6.asn.cymru.com"));
    assert_eq!(v6.split('.').count(), 36);
    assert_eq!(as_name_query(3356), "AS3356.asn.cymru.com");
}

#[test]
fn reverse_encodings_are_their_own_inverse() {
    // Reversing the label order of the query name recovers the address
    // digits.
    let name = origin_query_name("1.2.3.4".parse().unwrap());
    let labels: Vec<&str> = name.split('.').take(4).collect();
    let reversed: Vec<&str> = labels.into_iter().rev().collect();
    assert_eq!(reversed.join("."), "1.2.3.4");

    let name6 = origin_query_name("2001:db8::42".parse().unwrap());
    let nibbles: Vec<&str> = name6.split('.').take(32).collect();
    let forward: String = nibbles.into_iter().rev().collect();
    let rebuilt: IpAddr = format!(
        "{}:{}:{}:{}:{}:{}:{}:{}",
        &forward[0..4],
        &forward[4..8],
        &forward[8..12],
        &forward[12..16],
        &forward[16..20],
        &forward[20..24],
        &forward[24..28],
        &forward[28..32]
    )
    .parse()
    .unwrap();
    assert_eq!(rebuilt, "2001:db8::42".parse::<IpAddr>().unwrap());
}

struct CannedDns;

impl DnsClient for CannedDns {
    fn txt_lookup(&self, name: &str) -> Option<Vec<String>> {
        match name {
            "8.8.8.8.origin.asn.cymru.com" => {
                Some(vec!["15169 | 8.8.8.0/24 | US | arin | 2014-03-14".into()])
            }
            "AS15169.asn.cymru.com" => {
                Some(vec!["15169 | US | arin | 2000-03-30 | GOOGLE, US".into()])
            }
            _ => None,
        }
    }

    fn ptr_lookup(&self, addr: IpAddr) -> Option<String> {
        (addr == "8.8.8.8".parse::<IpAddr>().unwrap()).then(|| "dns.google".to_string())
    }
}

#[test]
fn end_to_end_lookup_with_canned_dns() {
    let enricher = Enricher::new(Box::new(CannedDns), EnrichOptions::default());
    let enrichment = enricher.lookup("8.8.8.8".parse().unwrap());
    assert_eq!(enrichment.asn, Some(15169));
    assert_eq!(enrichment.as_org.as_deref(), Some("GOOGLE, US"));
    assert_eq!(enrichment.hostname.as_deref(), Some("dns.google"));
    assert_eq!(enrichment.country.as_deref(), Some("US"));
}

#[test]
fn unknown_addresses_yield_empty_but_cached_enrichment() {
    let enricher = Enricher::new(Box::new(CannedDns), EnrichOptions::default());
    let enrichment = enricher.lookup("198.51.100.1".parse().unwrap());
    assert!(enrichment.is_empty());
    assert_eq!(enricher.cache_stats().current_size, 1);
}

#[test]
fn private_addresses_never_touch_the_network() {
    struct PanickingDns;
    impl DnsClient for PanickingDns {
        fn txt_lookup(&self, _name: &str) -> Option<Vec<String>> {
            panic!("network lookup for a private address");
        }
        fn ptr_lookup(&self, _addr: IpAddr) -> Option<String> {
            panic!("network lookup for a private address");
        }
    }
    let enricher = Enricher::new(Box::new(PanickingDns), EnrichOptions::default());
    for addr in ["192.168.1.1", "10.0.0.1", "127.0.0.1", "fe80::1", "fd12::1"] {
        assert!(enricher.lookup(addr.parse().unwrap()).is_empty());
    }
}

#[test]
fn non_routable_classification() {
    assert!(is_non_routable("172.31.255.1".parse().unwrap()));
    assert!(!is_non_routable("172.32.0.1".parse().unwrap()));
    assert!(is_non_routable("::ffff:192.168.0.1".parse().unwrap()));
}

#[test]
fn merge_keeps_first_writer() {
    let mut enrichment = Enrichment {
        asn: Some(1),
        ..Default::default()
    };
    enrichment.merge(Enrichment {
        asn: Some(2),
        hostname: Some("router.example".into()),
        ..Default::default()
    });
    assert_eq!(enrichment.asn, Some(1));
    assert_eq!(enrichment.hostname.as_deref(), Some("router.example"));
}
