//! OS-agnostic socket surface.
//!
//! Everything the probers need from the host networking stack is expressed
//! through the [`Network`] and [`ProbeSocket`] traits; platform constants
//! (hop-limit option, don't-fragment option, in-progress and refused error
//! values, writability polling) live behind the per-OS implementation and
//! raw descriptors never escape it. Tests substitute scripted
//! implementations.

pub mod prober;
#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use unix::SysNetwork;

use crate::TraceResult;
use crate::protocol::AddressFamily;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// What shape of socket to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// Raw ICMP/ICMPv6, used for sending echo probes and receiving all
    /// error responses.
    RawIcmp,
    /// A plain UDP datagram socket.
    DatagramUdp,
    /// A TCP stream socket used only for non-blocking SYN probes.
    StreamTcp,
}

/// Factory for probe sockets.
pub trait Network: Send + Sync {
    fn open(&self, family: AddressFamily, kind: SocketKind) -> TraceResult<Box<dyn ProbeSocket>>;
}

/// One open socket handle.
///
/// Handles release their resources on drop, on every exit path.
pub trait ProbeSocket: Send {
    /// Set the outgoing TTL (IPv4) or unicast hop limit (IPv6).
    fn set_hop_limit(&mut self, hops: u8) -> TraceResult<()>;

    fn set_nonblocking(&mut self) -> TraceResult<()>;

    /// Set the IPv4 don't-fragment bit on outgoing packets. A no-op for
    /// IPv6, which never fragments in transit.
    fn set_dont_fragment(&mut self) -> TraceResult<()>;

    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> TraceResult<usize>;

    /// Receive one datagram, waiting up to `timeout`. Returns `None` on
    /// timeout. For raw ICMPv4 sockets the returned bytes include the
    /// outer IP header.
    fn recv_from(&mut self, buf: &mut [u8], timeout: Duration)
    -> TraceResult<Option<(usize, IpAddr)>>;

    /// Begin a non-blocking connect; a pending (in-progress) connection is
    /// not an error.
    fn connect_nonblocking(&mut self, addr: SocketAddr) -> TraceResult<()>;

    /// Poll the socket for writability without blocking.
    fn check_writable(&mut self) -> TraceResult<bool>;

    /// Drain the pending socket error, if any, as a raw OS error value.
    fn take_pending_error(&mut self) -> TraceResult<Option<i32>>;
}

/// Whether a raw OS error value means the peer refused the connection,
/// which a SYN probe interprets as "target reached".
pub fn is_connection_refused(code: i32) -> bool {
    #[cfg(unix)]
    {
        code == libc::ECONNREFUSED
    }
    #[cfg(not(unix))]
    {
        code == 10061
    }
}
