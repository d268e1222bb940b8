//! IPv4 address value type with best-effort resolution.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::os::fd::RawFd;

use tracing::debug;

/// A host/port pair resolved to an IPv4 socket address. Resolution failure
/// yields an explicitly-invalid marker rather than an error; downstream
/// operations against an invalid address fail through their normal paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addr {
    addr: Option<SocketAddrV4>,
}

impl Addr {
    /// Resolve `host:port`. An empty host means the wildcard address.
    pub fn resolve(host: &str, port: u16) -> Addr {
        if host.is_empty() {
            return Addr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        }
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Addr::from(SocketAddrV4::new(ip, port));
        }
        match (host, port).to_socket_addrs() {
            Ok(mut addrs) => {
                let v4 = addrs.find_map(|a| match a {
                    SocketAddr::V4(v4) => Some(v4),
                    SocketAddr::V6(_) => None,
                });
                if v4.is_none() {
                    debug!(host, port, "no IPv4 address for host");
                }
                Addr { addr: v4 }
            }
            Err(e) => {
                debug!(host, port, error = %e, "resolution failed");
                Addr::invalid()
            }
        }
    }

    pub fn invalid() -> Addr {
        Addr { addr: None }
    }

    pub fn is_valid(&self) -> bool {
        self.addr.is_some()
    }

    pub fn socket_addr(&self) -> Option<SocketAddrV4> {
        self.addr
    }

    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.addr.map(|a| *a.ip())
    }

    pub fn port(&self) -> Option<u16> {
        self.addr.map(|a| a.port())
    }

    /// Interpret a raw sockaddr as an IPv4 address. Non-IPv4 families map to
    /// the invalid marker.
    pub(crate) fn from_storage(storage: &libc::sockaddr_storage) -> Addr {
        if storage.ss_family != libc::AF_INET as libc::sa_family_t {
            return Addr::invalid();
        }
        let sa = unsafe { &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in) };
        let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
        let port = u16::from_be(sa.sin_port);
        Addr::from(SocketAddrV4::new(ip, port))
    }

    /// The locally-bound address of a descriptor, or invalid on failure.
    pub(crate) fn from_local_fd(fd: RawFd) -> Addr {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let r = unsafe {
            libc::getsockname(
                fd,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        };
        if r < 0 {
            debug!(fd, error = %std::io::Error::last_os_error(), "getsockname failed");
            return Addr::invalid();
        }
        Addr::from_storage(&storage)
    }
}

impl From<SocketAddrV4> for Addr {
    fn from(addr: SocketAddrV4) -> Addr {
        Addr { addr: Some(addr) }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            Some(a) => write!(f, "{a}"),
            None => write!(f, "invalid"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_literal() {
        let addr = Addr::resolve("127.0.0.1", 8080);
        assert!(addr.is_valid());
        assert_eq!(addr.port(), Some(8080));
        assert_eq!(addr.to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn test_resolve_wildcard() {
        let addr = Addr::resolve("", 2099);
        assert_eq!(addr.ip(), Some(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn test_resolve_failure_is_invalid_marker() {
        let addr = Addr::resolve("no-such-host.invalid.", 80);
        assert!(!addr.is_valid());
        assert_eq!(addr.to_string(), "invalid");
    }
}
