use serde::Serialize;

use std::fmt;
use std::net::IpAddr;

/// The protocol used to shape outgoing probes.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy, Serialize)]
pub enum Protocol {
    /// ICMP Echo Request probes (ICMPv6 Echo Request for IPv6 targets).
    #[default]
    Icmp,
    /// UDP datagrams aimed at high, usually-closed ports.
    Udp,
    /// TCP SYN-only probes via a non-blocking connect.
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Icmp => write!(f, "icmp"),
            Self::Udp => write!(f, "udp"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

/// The IP family of an address, never ambiguous.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// The family of a concrete address.
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4 => write!(f, "IPv4"),
            Self::Ipv6 => write!(f, "IPv6"),
        }
    }
}

/// How target resolution selects between address families.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy, Serialize)]
pub enum FamilyPolicy {
    /// Prefer IPv4, fall back to IPv6.
    #[default]
    Auto,
    /// IPv4 results only.
    V4Only,
    /// IPv6 results only.
    V6Only,
}

/// The default base destination port for UDP probes.
pub const DEFAULT_BASE_PORT: u16 = 33434;

/// The maximum IP packet size we allow.
pub const MAX_PACKET_SIZE: usize = 1024;

/// ICMPv4 message types and codes recognized by the codec.
pub mod icmp4 {
    pub const ECHO_REPLY: u8 = 0;
    pub const DEST_UNREACHABLE: u8 = 3;
    pub const ECHO_REQUEST: u8 = 8;
    pub const TIME_EXCEEDED: u8 = 11;

    /// `Destination Unreachable` code for a closed UDP port.
    pub const CODE_PORT_UNREACHABLE: u8 = 3;
    /// `Destination Unreachable` code for fragmentation needed and DF set.
    pub const CODE_FRAGMENTATION_NEEDED: u8 = 4;
}

/// ICMPv6 message types recognized by the codec.
pub mod icmp6 {
    pub const DEST_UNREACHABLE: u8 = 1;
    pub const PACKET_TOO_BIG: u8 = 2;
    pub const TIME_EXCEEDED: u8 = 3;
    pub const ECHO_REQUEST: u8 = 128;
    pub const ECHO_REPLY: u8 = 129;

    /// `Destination Unreachable` code for a closed port.
    pub const CODE_PORT_UNREACHABLE: u8 = 4;
}
