//! One probe round-trip per `(protocol, ttl, flow)`.

use crate::cancellation::CancelToken;
use crate::net::{Network, ProbeSocket, SocketKind, is_connection_refused};
use crate::packet::builder::{ProbeSpec, build_echo_request, build_udp_payload, flow_port,
    sequence_port};
use crate::packet::response::{Correlation, ParsedResponse, parse_icmp4, parse_icmp6,
    strip_ipv4_header};
use crate::packet::{MplsLabel, ResponseKind};
use crate::protocol::{AddressFamily, Protocol};
use crate::{TraceError, TraceResult};

use serde::Serialize;
use tracing::{debug, warn};

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Receive buffer size; large enough for the outer IPv4 header plus the
/// largest response we build.
const RECV_BUFFER_SIZE: usize = 1600;

/// Granularity of the receive loop, bounding how quickly cancellation and
/// the TCP writability poll are observed.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The outcome of a single probe. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeOutcome {
    pub ttl: u8,
    pub flow_id: u16,
    pub sent_at: SystemTime,
    pub elapsed: Duration,
    pub responder: Option<IpAddr>,
    pub response_kind: Option<ResponseKind>,
    /// TTL observed on the response's own IP header (IPv4 only).
    pub response_ttl: Option<u8>,
    pub mpls_labels: Vec<MplsLabel>,
    pub reported_mtu: Option<u16>,
    pub timed_out: bool,
}

impl ProbeOutcome {
    fn timeout(ttl: u8, flow_id: u16, sent_at: SystemTime, elapsed: Duration) -> Self {
        Self {
            ttl,
            flow_id,
            sent_at,
            elapsed,
            responder: None,
            response_kind: None,
            response_ttl: None,
            mpls_labels: Vec::new(),
            reported_mtu: None,
            timed_out: true,
        }
    }

    /// Whether this outcome proves the given target answered.
    pub fn reached(&self, target: IpAddr) -> bool {
        self.responder == Some(target)
            && self.response_kind.is_some_and(ResponseKind::is_target_response)
    }
}

/// A source of probe round-trips; the seam between protocol plumbing and
/// the tracers.
pub trait Prober {
    fn probe(&mut self, ttl: u8, flow_id: u16, cancel: &CancelToken) -> TraceResult<ProbeOutcome>;
}

/// Settings for a [`ProtocolProber`], resolved from the trace config and
/// the target address.
#[derive(Debug, Clone)]
pub struct ProberSettings {
    pub protocol: Protocol,
    pub target: IpAddr,
    /// The ICMP correlation identifier, by default the low 16 bits of the
    /// process id.
    pub identifier: u16,
    /// UDP base port or TCP destination port.
    pub port: u16,
    pub payload_size: u16,
    pub timeout: Duration,
    pub discover_mtu: bool,
}

/// Probes one hop at a time over the configured protocol.
///
/// A new prober is created per trace cycle so the ICMP receive handle is
/// never shared across cycles.
pub struct ProtocolProber {
    net: Arc<dyn Network>,
    settings: ProberSettings,
    family: AddressFamily,
    recv: Option<Box<dyn ProbeSocket>>,
    sequence: u16,
    clock_origin: Instant,
}

impl ProtocolProber {
    pub fn new(net: Arc<dyn Network>, settings: ProberSettings) -> Self {
        let family = AddressFamily::of(settings.target);
        Self {
            net,
            settings,
            family,
            recv: None,
            sequence: 0,
            clock_origin: Instant::now(),
        }
    }

    fn next_sequence(&mut self) -> u16 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    fn ensure_recv(&mut self) -> TraceResult<()> {
        if self.recv.is_none() {
            let mut socket = self.net.open(self.family, SocketKind::RawIcmp)?;
            socket.set_nonblocking()?;
            self.recv = Some(socket);
        }
        Ok(())
    }

    fn open_send(&self, kind: SocketKind, ttl: u8) -> TraceResult<Box<dyn ProbeSocket>> {
        let mut socket = self.net.open(self.family, kind)?;
        socket.set_hop_limit(ttl)?;
        if self.settings.discover_mtu && kind != SocketKind::StreamTcp {
            socket.set_dont_fragment()?;
        }
        Ok(socket)
    }

    fn parse(&self, buf: &[u8]) -> Option<(ParsedResponse, Option<u8>)> {
        match self.family {
            AddressFamily::Ipv4 => {
                let (icmp, response_ttl) = strip_ipv4_header(buf)?;
                Some((parse_icmp4(icmp)?, Some(response_ttl)))
            }
            AddressFamily::Ipv6 => Some((parse_icmp6(buf)?, None)),
        }
    }

    /// Whether a parsed response correlates to the probe described by
    /// `sequence` and `expected_port`.
    fn correlates(&self, response: &ParsedResponse, sequence: u16, expected_port: u16) -> bool {
        match response.correlation {
            Correlation::Echo {
                identifier,
                sequence: seq,
            }
            | Correlation::EmbeddedEcho {
                identifier,
                sequence: seq,
            } => {
                self.settings.protocol == Protocol::Icmp
                    && identifier == self.settings.identifier
                    && seq == sequence
            }
            Correlation::EmbeddedPort { dest_port } => {
                self.settings.protocol != Protocol::Icmp && dest_port == expected_port
            }
            Correlation::None => false,
        }
    }
}

impl Prober for ProtocolProber {
    fn probe(&mut self, ttl: u8, flow_id: u16, cancel: &CancelToken) -> TraceResult<ProbeOutcome> {
        self.ensure_recv()?;
        let sequence = self.next_sequence();
        let spec = ProbeSpec {
            family: self.family,
            ttl,
            flow_id,
            identifier: self.settings.identifier,
            sequence,
            payload_size: self.settings.payload_size,
        };

        let mut expected_port = 0;
        let mut tcp_handle: Option<Box<dyn ProbeSocket>> = None;
        let sent_at = SystemTime::now();
        let sent_instant = Instant::now();

        let send_result = match self.settings.protocol {
            Protocol::Icmp => {
                let timestamp = self.clock_origin.elapsed().as_nanos() as u64;
                let packet = build_echo_request(&spec, timestamp);
                let mut socket = self.open_send(SocketKind::RawIcmp, ttl)?;
                socket
                    .send_to(&packet, SocketAddr::new(self.settings.target, 0))
                    .map(|_| ())
            }
            Protocol::Udp => {
                expected_port = if flow_id > 0 {
                    flow_port(self.settings.port, flow_id)
                } else {
                    sequence_port(self.settings.port, sequence)
                };
                let payload = build_udp_payload(&spec);
                let mut socket = self.open_send(SocketKind::DatagramUdp, ttl)?;
                socket
                    .send_to(&payload, SocketAddr::new(self.settings.target, expected_port))
                    .map(|_| ())
            }
            Protocol::Tcp => {
                expected_port = self.settings.port;
                let mut socket = self.open_send(SocketKind::StreamTcp, ttl)?;
                let connect = socket
                    .connect_nonblocking(SocketAddr::new(self.settings.target, expected_port));
                tcp_handle = Some(socket);
                connect
            }
        };

        if let Err(e) = send_result {
            match e {
                TraceError::PermissionDenied(_) => return Err(e),
                e => {
                    // A failed send shows up as a gap at this hop rather
                    // than aborting the cycle.
                    warn!(ttl, %e, "probe send failed");
                    return Ok(ProbeOutcome::timeout(ttl, flow_id, sent_at, Duration::ZERO));
                }
            }
        }

        let deadline = sent_instant + self.settings.timeout;
        let mut buf = [0_u8; RECV_BUFFER_SIZE];
        loop {
            let now = Instant::now();
            if cancel.is_cancelled() || now >= deadline {
                break;
            }
            if let Some(tcp) = tcp_handle.as_mut()
                && tcp.check_writable()?
            {
                let pending = tcp.take_pending_error()?;
                // A SYN-ACK (no pending error) and an RST (refused) both
                // prove the target answered.
                let kind = match pending {
                    None | Some(0) => ResponseKind::EchoReply,
                    Some(code) if is_connection_refused(code) => ResponseKind::PortUnreachable,
                    Some(code) => {
                        debug!(ttl, code, "tcp connect failed");
                        break;
                    }
                };
                return Ok(ProbeOutcome {
                    ttl,
                    flow_id,
                    sent_at,
                    elapsed: now - sent_instant,
                    responder: Some(self.settings.target),
                    response_kind: Some(kind),
                    response_ttl: None,
                    mpls_labels: Vec::new(),
                    reported_mtu: None,
                    timed_out: false,
                });
            }
            let remaining = deadline - now;
            let recv = self.recv.as_mut().expect("receive handle is open");
            let Some((len, from)) = recv.recv_from(&mut buf, remaining.min(POLL_INTERVAL))? else {
                continue;
            };
            let received = Instant::now();
            // Uncorrelated or malformed packets keep the loop going
            // without resetting the deadline.
            let Some((response, response_ttl)) = self.parse(&buf[..len]) else {
                continue;
            };
            if !self.correlates(&response, sequence, expected_port) {
                continue;
            }
            return Ok(ProbeOutcome {
                ttl,
                flow_id,
                sent_at,
                elapsed: received - sent_instant,
                responder: Some(from),
                response_kind: Some(response.kind),
                response_ttl,
                mpls_labels: response.mpls,
                reported_mtu: response.reported_mtu,
                timed_out: false,
            });
        }
        Ok(ProbeOutcome::timeout(
            ttl,
            flow_id,
            sent_at,
            self.settings.timeout,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::testutil;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    const PROTO_ICMP: u8 = 1;
    const PROTO_UDP: u8 = 17;

    /// A scripted response: delivered on the nth receive attempt.
    type Script = Arc<Mutex<VecDeque<(Vec<u8>, IpAddr)>>>;

    struct MockNetwork {
        script: Script,
        fail_send: bool,
        refuse_tcp: bool,
    }

    impl MockNetwork {
        fn new(script: Vec<(Vec<u8>, IpAddr)>) -> Self {
            Self {
                script: Arc::new(Mutex::new(script.into_iter().collect())),
                fail_send: false,
                refuse_tcp: false,
            }
        }
    }

    impl Network for MockNetwork {
        fn open(
            &self,
            _family: AddressFamily,
            kind: SocketKind,
        ) -> TraceResult<Box<dyn ProbeSocket>> {
            Ok(Box::new(MockSocket {
                kind,
                script: Arc::clone(&self.script),
                fail_send: self.fail_send,
                refuse_tcp: self.refuse_tcp,
            }))
        }
    }

    struct MockSocket {
        kind: SocketKind,
        script: Script,
        fail_send: bool,
        refuse_tcp: bool,
    }

    impl ProbeSocket for MockSocket {
        fn set_hop_limit(&mut self, _hops: u8) -> TraceResult<()> {
            Ok(())
        }
        fn set_nonblocking(&mut self) -> TraceResult<()> {
            Ok(())
        }
        fn set_dont_fragment(&mut self) -> TraceResult<()> {
            Ok(())
        }
        fn send_to(&mut self, buf: &[u8], _addr: SocketAddr) -> TraceResult<usize> {
            if self.fail_send {
                return Err(TraceError::Io(std::io::Error::other("send failed")));
            }
            Ok(buf.len())
        }
        fn recv_from(
            &mut self,
            buf: &mut [u8],
            _timeout: Duration,
        ) -> TraceResult<Option<(usize, IpAddr)>> {
            assert_eq!(self.kind, SocketKind::RawIcmp);
            match self.script.lock().pop_front() {
                Some((bytes, from)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(Some((bytes.len(), from)))
                }
                None => Ok(None),
            }
        }
        fn connect_nonblocking(&mut self, _addr: SocketAddr) -> TraceResult<()> {
            Ok(())
        }
        fn check_writable(&mut self) -> TraceResult<bool> {
            Ok(true)
        }
        fn take_pending_error(&mut self) -> TraceResult<Option<i32>> {
            if self.refuse_tcp {
                Ok(Some(libc::ECONNREFUSED))
            } else {
                Ok(None)
            }
        }
    }

    fn settings(protocol: Protocol) -> ProberSettings {
        ProberSettings {
            protocol,
            target: "198.51.100.9".parse().unwrap(),
            identifier: 0x4242,
            port: 33434,
            payload_size: 0,
            timeout: Duration::from_millis(50),
            discover_mtu: false,
        }
    }

    fn router() -> IpAddr {
        "192.0.2.1".parse().unwrap()
    }

    /// The quoted datagram for the first probe an ICMP prober sends
    /// (sequence 1).
    fn quoted_echo(identifier: u16, sequence: u16) -> Vec<u8> {
        let spec = ProbeSpec {
            family: AddressFamily::Ipv4,
            ttl: 1,
            flow_id: 0,
            identifier,
            sequence,
            payload_size: 0,
        };
        testutil::ipv4_datagram(PROTO_ICMP, &build_echo_request(&spec, 0))
    }

    #[test]
    fn test_icmp_probe_correlates_time_exceeded() {
        let wire = testutil::time_exceeded_v4(&quoted_echo(0x4242, 1), &[]);
        let net = MockNetwork::new(vec![(testutil::ipv4_datagram_with_ttl(1, &wire, 61), router())]);
        let mut prober = ProtocolProber::new(Arc::new(net), settings(Protocol::Icmp));
        let outcome = prober.probe(1, 0, &CancelToken::new()).unwrap();
        assert!(!outcome.timed_out);
        assert_eq!(outcome.responder, Some(router()));
        assert_eq!(outcome.response_kind, Some(ResponseKind::TimeExceeded));
        assert_eq!(outcome.response_ttl, Some(61));
    }

    #[test]
    fn test_wrong_identifier_is_skipped_without_ending_the_probe() {
        let stranger = testutil::time_exceeded_v4(&quoted_echo(0x9999, 1), &[]);
        let ours = testutil::time_exceeded_v4(&quoted_echo(0x4242, 1), &[]);
        let net = MockNetwork::new(vec![
            (testutil::ipv4_datagram(1, &stranger), router()),
            (testutil::ipv4_datagram(1, &ours), router()),
        ]);
        let mut prober = ProtocolProber::new(Arc::new(net), settings(Protocol::Icmp));
        let outcome = prober.probe(1, 0, &CancelToken::new()).unwrap();
        assert!(!outcome.timed_out);
        assert_eq!(outcome.response_kind, Some(ResponseKind::TimeExceeded));
    }

    #[test]
    fn test_echo_reply_means_reached() {
        let reply = testutil::echo_reply_v4(0x4242, 1);
        let target: IpAddr = "198.51.100.9".parse().unwrap();
        let net = MockNetwork::new(vec![(testutil::ipv4_datagram(1, &reply), target)]);
        let mut prober = ProtocolProber::new(Arc::new(net), settings(Protocol::Icmp));
        let outcome = prober.probe(8, 0, &CancelToken::new()).unwrap();
        assert_eq!(outcome.response_kind, Some(ResponseKind::EchoReply));
        assert!(outcome.reached(target));
    }

    #[test]
    fn test_udp_probe_correlates_on_embedded_port() {
        // Sequence 1 probes base_port + 0.
        let udp = testutil::udp_header(50000, 33434);
        let wire = testutil::time_exceeded_v4(&testutil::ipv4_datagram(PROTO_UDP, &udp), &[]);
        let net = MockNetwork::new(vec![(testutil::ipv4_datagram(1, &wire), router())]);
        let mut prober = ProtocolProber::new(Arc::new(net), settings(Protocol::Udp));
        let outcome = prober.probe(1, 0, &CancelToken::new()).unwrap();
        assert!(!outcome.timed_out);
        assert_eq!(outcome.responder, Some(router()));
    }

    #[test]
    fn test_udp_port_unreachable_means_reached() {
        let target: IpAddr = "198.51.100.9".parse().unwrap();
        let udp = testutil::udp_header(50000, 33434);
        let wire = testutil::dest_unreachable_v4(&testutil::ipv4_datagram(PROTO_UDP, &udp), 3);
        let net = MockNetwork::new(vec![(testutil::ipv4_datagram(1, &wire), target)]);
        let mut prober = ProtocolProber::new(Arc::new(net), settings(Protocol::Udp));
        let outcome = prober.probe(12, 0, &CancelToken::new()).unwrap();
        assert_eq!(outcome.response_kind, Some(ResponseKind::PortUnreachable));
        assert!(outcome.reached(target));
    }

    #[test]
    fn test_fragmentation_needed_surfaces_the_mtu() {
        let udp = testutil::udp_header(50000, 33434);
        let wire = testutil::frag_needed_v4(&testutil::ipv4_datagram(PROTO_UDP, &udp), 1400);
        let net = MockNetwork::new(vec![(testutil::ipv4_datagram(1, &wire), router())]);
        let mut prober = ProtocolProber::new(Arc::new(net), settings(Protocol::Udp));
        let outcome = prober.probe(1, 0, &CancelToken::new()).unwrap();
        assert_eq!(outcome.reported_mtu, Some(1400));
        assert_eq!(
            outcome.response_kind,
            Some(ResponseKind::FragmentationNeeded)
        );
    }

    #[test]
    fn test_tcp_refused_means_reached() {
        let target: IpAddr = "198.51.100.9".parse().unwrap();
        let mut net = MockNetwork::new(vec![]);
        net.refuse_tcp = true;
        let mut tcp = settings(Protocol::Tcp);
        tcp.port = 443;
        let mut prober = ProtocolProber::new(Arc::new(net), tcp);
        let outcome = prober.probe(4, 0, &CancelToken::new()).unwrap();
        assert_eq!(outcome.response_kind, Some(ResponseKind::PortUnreachable));
        assert!(outcome.reached(target));
    }

    #[test]
    fn test_send_failure_degrades_to_timeout() {
        let mut net = MockNetwork::new(vec![]);
        net.fail_send = true;
        let mut prober = ProtocolProber::new(Arc::new(net), settings(Protocol::Icmp));
        let outcome = prober.probe(1, 0, &CancelToken::new()).unwrap();
        assert!(outcome.timed_out);
        assert!(outcome.responder.is_none());
    }

    #[test]
    fn test_no_response_times_out() {
        let net = MockNetwork::new(vec![]);
        let mut prober = ProtocolProber::new(Arc::new(net), settings(Protocol::Icmp));
        let outcome = prober.probe(1, 0, &CancelToken::new()).unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.elapsed, Duration::from_millis(50));
    }

    #[test]
    fn test_cancellation_returns_a_timeout_outcome() {
        let net = MockNetwork::new(vec![]);
        let mut prober = ProtocolProber::new(Arc::new(net), settings(Protocol::Icmp));
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = prober.probe(1, 0, &cancel).unwrap();
        assert!(outcome.timed_out);
    }
}
