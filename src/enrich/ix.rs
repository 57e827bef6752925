//! Internet Exchange classification.
//!
//! A linear search over a small CIDR table answers "does this responder
//! sit on an exchange peering LAN?". The built-in table seeds a handful of
//! large exchanges; embedding applications replace it with a full table.

use serde::Serialize;

use std::net::IpAddr;

/// One exchange prefix.
#[derive(Debug, Clone, Serialize)]
pub struct IxEntry {
    pub prefix: IpAddr,
    pub prefix_len: u8,
    pub name: String,
}

impl IxEntry {
    pub fn new(prefix: &str, prefix_len: u8, name: &str) -> Self {
        Self {
            prefix: prefix.parse().expect("valid literal prefix"),
            prefix_len,
            name: name.to_string(),
        }
    }
}

/// The table of known exchange prefixes.
#[derive(Debug, Clone, Serialize)]
pub struct IxTable {
    entries: Vec<IxEntry>,
}

impl IxTable {
    pub fn new(entries: Vec<IxEntry>) -> Self {
        Self { entries }
    }

    /// A seed table of well-known exchange peering LANs.
    pub fn builtin() -> Self {
        Self::new(vec![
            IxEntry::new("80.81.192.0", 21, "DE-CIX Frankfurt"),
            IxEntry::new("80.249.208.0", 21, "AMS-IX"),
            IxEntry::new("195.66.224.0", 21, "LINX LON1"),
            IxEntry::new("206.126.236.0", 22, "Equinix Ashburn"),
            IxEntry::new("187.16.216.0", 21, "IX.br São Paulo"),
            IxEntry::new("2001:7f8::", 64, "DE-CIX Frankfurt"),
            IxEntry::new("2001:7f8:1::", 64, "AMS-IX"),
        ])
    }

    /// Name of the exchange containing `addr`, if any.
    pub fn classify(&self, addr: IpAddr) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| cidr_contains(entry.prefix, entry.prefix_len, addr))
            .map(|entry| entry.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Whether `addr` falls within `prefix/prefix_len`. Addresses of a
/// different family never match.
pub fn cidr_contains(prefix: IpAddr, prefix_len: u8, addr: IpAddr) -> bool {
    match (prefix, addr) {
        (IpAddr::V4(prefix), IpAddr::V4(addr)) => {
            if prefix_len == 0 {
                return true;
            }
            if prefix_len > 32 {
                return false;
            }
            let mask = u32::MAX << (32 - prefix_len);
            u32::from(prefix) & mask == u32::from(addr) & mask
        }
        (IpAddr::V6(prefix), IpAddr::V6(addr)) => {
            if prefix_len == 0 {
                return true;
            }
            if prefix_len > 128 {
                return false;
            }
            let mask = u128::MAX << (128 - prefix_len);
            u128::from(prefix) & mask == u128::from(addr) & mask
        }
        _ => false,
    }
}
