//! Origin-ASN resolution via the Team Cymru DNS zones.
//!
//! IPv4 addresses are queried with their octets reversed under
//! `origin.asn.cymru.com`; IPv6 addresses use the nibble-reversed 32-label
//! encoding under `origin6.asn.cymru.com`. Answers are `|`-separated:
//!
//! ```text
//! "15169 | 8.8.8.0/24 | US | arin | 2014-03-14"
//! ```
//!
//! The AS organisation name comes from a second TXT query against
//! `AS<n>.asn.cymru.com`.

use crate::enrich::dns::DnsClient;

use serde::Serialize;

use std::net::IpAddr;

const ORIGIN_V4_ZONE: &str = "origin.asn.cymru.com";
const ORIGIN_V6_ZONE: &str = "origin6.asn.cymru.com";
const AS_NAME_ZONE: &str = "asn.cymru.com";

/// Everything the origin zone tells us about an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AsnInfo {
    pub asn: u32,
    pub prefix: String,
    pub country: String,
    pub registry: String,
    pub name: Option<String>,
}

/// A pluggable ASN source consulted when DNS yields no answer, typically
/// an HTTP JSON provider supplied by the embedding application.
pub trait AsnFallback: Send + Sync {
    fn lookup_asn(&self, addr: IpAddr) -> Option<AsnInfo>;
}

/// Build the origin-ASN TXT query name for an address.
///
/// IPv4-mapped IPv6 addresses use the IPv4 form.
pub fn origin_query_name(addr: IpAddr) -> String {
    match normalize(addr) {
        IpAddr::V4(v4) => {
            let [a, b, c, d] = v4.octets();
            format!("{d}.{c}.{b}.{a}.{ORIGIN_V4_ZONE}")
        }
        IpAddr::V6(v6) => {
            let nibbles: Vec<String> = v6
                .octets()
                .iter()
                .flat_map(|octet| [octet >> 4, octet & 0x0F])
                .rev()
                .map(|nibble| format!("{nibble:x}"))
                .collect();
            format!("{}.{ORIGIN_V6_ZONE}", nibbles.join("."))
        }
    }
}

/// Build the AS-name TXT query name for an AS number.
pub fn as_name_query(asn: u32) -> String {
    format!("AS{asn}.{AS_NAME_ZONE}")
}

/// Parse an origin zone answer.
///
/// The ASN field may list several origins separated by spaces; the first
/// one wins.
pub fn parse_origin_txt(txt: &str) -> Option<AsnInfo> {
    let mut fields = txt.split('|').map(str::trim);
    let asn = fields.next()?.split_whitespace().next()?.parse().ok()?;
    let prefix = fields.next()?.to_string();
    let country = fields.next().unwrap_or_default().to_string();
    let registry = fields.next().unwrap_or_default().to_string();
    Some(AsnInfo {
        asn,
        prefix,
        country,
        registry,
        name: None,
    })
}

/// Parse an AS-name zone answer, e.g.
/// `"15169 | US | arin | 2000-03-30 | GOOGLE, US"`.
pub fn parse_as_name_txt(txt: &str) -> Option<String> {
    let name = txt.split('|').next_back()?.trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// Resolve the origin ASN of `addr`, falling back to the injected
/// provider when DNS has no answer.
pub fn lookup(
    dns: &dyn DnsClient,
    fallback: Option<&dyn AsnFallback>,
    addr: IpAddr,
) -> Option<AsnInfo> {
    let mut info = dns
        .txt_lookup(&origin_query_name(addr))
        .and_then(|answers| answers.iter().find_map(|txt| parse_origin_txt(txt)))
        .or_else(|| fallback.and_then(|f| f.lookup_asn(addr)))?;
    if info.name.is_none() {
        info.name = dns
            .txt_lookup(&as_name_query(info.asn))
            .and_then(|answers| answers.iter().find_map(|txt| parse_as_name_txt(txt)));
    }
    Some(info)
}

fn normalize(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(addr, IpAddr::V4),
        v4 => v4,
    }
}
