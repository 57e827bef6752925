//! Incoming ICMP response parsing.
//!
//! The codec accepts raw ICMPv4 or ICMPv6 message bytes (outer IP header
//! already stripped) and classifies them into the response kinds the
//! tracer understands, extracting whatever correlation key the message
//! carries: the identifier and sequence of an echo exchange, or the
//! destination port quoted from the original UDP/TCP datagram inside an
//! error message. Malformed packets parse to `None` and are dropped by the
//! caller without aborting the receive loop.

use crate::packet::extension::{MplsLabel, parse_extensions};
use crate::protocol::{icmp4, icmp6};

use nom_derive::{Nom, Parse};
use serde::Serialize;

/// IP protocol numbers the embedded-datagram walk understands.
const PROTO_ICMP: u8 = 1;
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;
const PROTO_ICMPV6: u8 = 58;

/// The classified kind of a probe response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResponseKind {
    /// A router decremented the TTL/Hop Limit to zero.
    TimeExceeded,
    /// The target answered an ICMP echo.
    EchoReply,
    /// A `Destination Unreachable` with the given code.
    DestUnreachable(u8),
    /// `Destination Unreachable` signalling a closed port; for UDP probes
    /// this means the target itself was reached.
    PortUnreachable,
    /// `Fragmentation Needed` / `Packet Too Big`; carries the next-hop MTU.
    FragmentationNeeded,
}

impl ResponseKind {
    /// Whether this response proves the target itself answered.
    pub fn is_target_response(self) -> bool {
        matches!(self, Self::EchoReply | Self::PortUnreachable)
    }
}

/// The correlation key recovered from a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// Identifier and sequence of an `EchoReply` from the target.
    Echo { identifier: u16, sequence: u16 },
    /// Identifier and sequence of the echo request quoted inside an error.
    EmbeddedEcho { identifier: u16, sequence: u16 },
    /// Destination port of the UDP/TCP probe quoted inside an error.
    EmbeddedPort { dest_port: u16 },
    /// The message carried nothing we can correlate on.
    None,
}

/// A successfully parsed, not yet correlated, probe response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub kind: ResponseKind,
    pub correlation: Correlation,
    pub mpls: Vec<MplsLabel>,
    pub reported_mtu: Option<u16>,
}

#[derive(Nom)]
struct IcmpHeader {
    icmp_type: u8,
    icmp_code: u8,
    #[allow(dead_code)]
    checksum: u16,
    rest_hi: u16,
    rest_lo: u16,
}

/// Parse an ICMPv4 message.
pub fn parse_icmp4(bytes: &[u8]) -> Option<ParsedResponse> {
    let (payload, header) = IcmpHeader::parse(bytes).ok()?;
    match header.icmp_type {
        icmp4::ECHO_REPLY => Some(ParsedResponse {
            kind: ResponseKind::EchoReply,
            correlation: Correlation::Echo {
                identifier: header.rest_hi,
                sequence: header.rest_lo,
            },
            mpls: Vec::new(),
            reported_mtu: None,
        }),
        icmp4::TIME_EXCEEDED => Some(ParsedResponse {
            kind: ResponseKind::TimeExceeded,
            correlation: correlate_embedded_v4(payload),
            mpls: parse_extensions(payload),
            reported_mtu: None,
        }),
        icmp4::DEST_UNREACHABLE => {
            let (kind, mtu) = match header.icmp_code {
                icmp4::CODE_PORT_UNREACHABLE => (ResponseKind::PortUnreachable, None),
                icmp4::CODE_FRAGMENTATION_NEEDED => {
                    (ResponseKind::FragmentationNeeded, Some(header.rest_lo))
                }
                code => (ResponseKind::DestUnreachable(code), None),
            };
            Some(ParsedResponse {
                kind,
                correlation: correlate_embedded_v4(payload),
                mpls: parse_extensions(payload),
                reported_mtu: mtu,
            })
        }
        _ => None,
    }
}

/// Parse an ICMPv6 message.
pub fn parse_icmp6(bytes: &[u8]) -> Option<ParsedResponse> {
    let (payload, header) = IcmpHeader::parse(bytes).ok()?;
    match header.icmp_type {
        icmp6::ECHO_REPLY => Some(ParsedResponse {
            kind: ResponseKind::EchoReply,
            correlation: Correlation::Echo {
                identifier: header.rest_hi,
                sequence: header.rest_lo,
            },
            mpls: Vec::new(),
            reported_mtu: None,
        }),
        icmp6::TIME_EXCEEDED => Some(ParsedResponse {
            kind: ResponseKind::TimeExceeded,
            correlation: correlate_embedded_v6(payload),
            mpls: parse_extensions(payload),
            reported_mtu: None,
        }),
        icmp6::DEST_UNREACHABLE => {
            let kind = match header.icmp_code {
                icmp6::CODE_PORT_UNREACHABLE => ResponseKind::PortUnreachable,
                code => ResponseKind::DestUnreachable(code),
            };
            Some(ParsedResponse {
                kind,
                correlation: correlate_embedded_v6(payload),
                mpls: parse_extensions(payload),
                reported_mtu: None,
            })
        }
        icmp6::PACKET_TOO_BIG => {
            // The 32 bit MTU field shares the header slot used by the
            // identifier/sequence pair in echo messages.
            let mtu = (u32::from(header.rest_hi) << 16) | u32::from(header.rest_lo);
            Some(ParsedResponse {
                kind: ResponseKind::FragmentationNeeded,
                correlation: correlate_embedded_v6(payload),
                mpls: Vec::new(),
                reported_mtu: Some(mtu.min(u32::from(u16::MAX)) as u16),
            })
        }
        _ => None,
    }
}

/// Strip the outer IPv4 header from a raw-socket read, returning the inner
/// ICMP message and the response TTL observed on the wire.
pub fn strip_ipv4_header(bytes: &[u8]) -> Option<(&[u8], u8)> {
    if bytes.len() < 20 || bytes[0] >> 4 != 4 {
        return None;
    }
    let header_len = usize::from(bytes[0] & 0x0F) * 4;
    if header_len < 20 || bytes.len() < header_len {
        return None;
    }
    Some((&bytes[header_len..], bytes[8]))
}

/// Recover the correlation key from the original IPv4 datagram quoted in
/// an ICMP error: the destination port for UDP/TCP probes, or the
/// identifier and sequence of an embedded echo request.
fn correlate_embedded_v4(payload: &[u8]) -> Correlation {
    if payload.len() < 20 || payload[0] >> 4 != 4 {
        return Correlation::None;
    }
    let header_len = usize::from(payload[0] & 0x0F) * 4;
    if header_len < 20 || payload.len() < header_len + 8 {
        return Correlation::None;
    }
    correlate_transport(payload[9], &payload[header_len..])
}

/// As [`correlate_embedded_v4`] for the fixed 40 byte IPv6 header.
fn correlate_embedded_v6(payload: &[u8]) -> Correlation {
    if payload.len() < 48 || payload[0] >> 4 != 6 {
        return Correlation::None;
    }
    correlate_transport(payload[6], &payload[40..])
}

fn correlate_transport(protocol: u8, transport: &[u8]) -> Correlation {
    match protocol {
        PROTO_UDP | PROTO_TCP if transport.len() >= 4 => Correlation::EmbeddedPort {
            dest_port: u16::from_be_bytes([transport[2], transport[3]]),
        },
        PROTO_ICMP if transport.len() >= 8 && transport[0] == icmp4::ECHO_REQUEST => {
            Correlation::EmbeddedEcho {
                identifier: u16::from_be_bytes([transport[4], transport[5]]),
                sequence: u16::from_be_bytes([transport[6], transport[7]]),
            }
        }
        PROTO_ICMPV6 if transport.len() >= 8 && transport[0] == icmp6::ECHO_REQUEST => {
            Correlation::EmbeddedEcho {
                identifier: u16::from_be_bytes([transport[4], transport[5]]),
                sequence: u16::from_be_bytes([transport[6], transport[7]]),
            }
        }
        _ => Correlation::None,
    }
}
