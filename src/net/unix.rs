//! Unix implementation of the socket surface on top of `socket2`.

use crate::net::{Network, ProbeSocket, SocketKind};
use crate::protocol::AddressFamily;
use crate::{TraceError, TraceResult};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsRawFd;
use std::time::Duration;

/// The host networking stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysNetwork;

impl Network for SysNetwork {
    fn open(&self, family: AddressFamily, kind: SocketKind) -> TraceResult<Box<dyn ProbeSocket>> {
        Ok(Box::new(SysSocket::open(family, kind)?))
    }
}

pub struct SysSocket {
    socket: Socket,
    family: AddressFamily,
}

impl SysSocket {
    pub fn open(family: AddressFamily, kind: SocketKind) -> TraceResult<Self> {
        let domain = match family {
            AddressFamily::Ipv4 => Domain::IPV4,
            AddressFamily::Ipv6 => Domain::IPV6,
        };
        let (ty, protocol) = match (kind, family) {
            (SocketKind::RawIcmp, AddressFamily::Ipv4) => (Type::RAW, Protocol::ICMPV4),
            (SocketKind::RawIcmp, AddressFamily::Ipv6) => (Type::RAW, Protocol::ICMPV6),
            (SocketKind::DatagramUdp, _) => (Type::DGRAM, Protocol::UDP),
            (SocketKind::StreamTcp, _) => (Type::STREAM, Protocol::TCP),
        };
        let socket = Socket::new(domain, ty, Some(protocol)).map_err(map_socket_error)?;
        Ok(Self { socket, family })
    }

    fn poll(&self, events: libc::c_short, timeout: Duration) -> TraceResult<bool> {
        let mut fds = libc::pollfd {
            fd: self.socket.as_raw_fd(),
            events,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        loop {
            let ready = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
            if ready >= 0 {
                return Ok(ready > 0);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(TraceError::Io(err));
            }
        }
    }
}

impl ProbeSocket for SysSocket {
    fn set_hop_limit(&mut self, hops: u8) -> TraceResult<()> {
        match self.family {
            AddressFamily::Ipv4 => self.socket.set_ttl(u32::from(hops)),
            AddressFamily::Ipv6 => self.socket.set_unicast_hops_v6(u32::from(hops)),
        }
        .map_err(TraceError::Io)
    }

    fn set_nonblocking(&mut self) -> TraceResult<()> {
        self.socket.set_nonblocking(true).map_err(TraceError::Io)
    }

    fn set_dont_fragment(&mut self) -> TraceResult<()> {
        if self.family == AddressFamily::Ipv6 {
            return Ok(());
        }
        #[cfg(target_os = "linux")]
        let (level, option, value): (libc::c_int, libc::c_int, libc::c_int) = (
            libc::IPPROTO_IP,
            libc::IP_MTU_DISCOVER,
            libc::IP_PMTUDISC_PROBE,
        );
        #[cfg(not(target_os = "linux"))]
        let (level, option, value): (libc::c_int, libc::c_int, libc::c_int) =
            (libc::IPPROTO_IP, 28 /* IP_DONTFRAG */, 1);
        let rc = unsafe {
            libc::setsockopt(
                self.socket.as_raw_fd(),
                level,
                option,
                std::ptr::addr_of!(value).cast(),
                size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(TraceError::Io(io::Error::last_os_error()))
        }
    }

    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> TraceResult<usize> {
        self.socket
            .send_to(buf, &SockAddr::from(addr))
            .map_err(map_socket_error)
    }

    fn recv_from(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> TraceResult<Option<(usize, IpAddr)>> {
        if !self.poll(libc::POLLIN, timeout)? {
            return Ok(None);
        }
        let mut raw = vec![MaybeUninit::<u8>::uninit(); buf.len()];
        let (len, from) = self.socket.recv_from(&mut raw).map_err(TraceError::Io)?;
        for (dst, src) in buf.iter_mut().zip(raw[..len].iter()) {
            *dst = unsafe { src.assume_init() };
        }
        Ok(from.as_socket().map(|s| (len, s.ip())))
    }

    fn connect_nonblocking(&mut self, addr: SocketAddr) -> TraceResult<()> {
        self.socket.set_nonblocking(true).map_err(TraceError::Io)?;
        match self.socket.connect(&SockAddr::from(addr)) {
            Ok(()) => Ok(()),
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(())
            }
            Err(e) => Err(map_socket_error(e)),
        }
    }

    fn check_writable(&mut self) -> TraceResult<bool> {
        self.poll(libc::POLLOUT, Duration::ZERO)
    }

    fn take_pending_error(&mut self) -> TraceResult<Option<i32>> {
        let error = self.socket.take_error().map_err(TraceError::Io)?;
        Ok(error.and_then(|e| e.raw_os_error()))
    }
}

fn map_socket_error(error: io::Error) -> TraceError {
    if error.kind() == io::ErrorKind::PermissionDenied
        || error.raw_os_error() == Some(libc::EPERM)
        || error.raw_os_error() == Some(libc::EACCES)
    {
        TraceError::PermissionDenied(error)
    } else {
        TraceError::Io(error)
    }
}
