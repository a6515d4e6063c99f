use std::{
    fmt,
    net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6},
    path::PathBuf,
};

use nix::sys::socket::{AddressFamily, SockaddrLike, SockaddrStorage};

use crate::{Error, Result};

/// A portable socket address. Transports accept and report addresses in this form, and convert to
/// the native representation only at the system call boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum SockAddr {
    /// No address, used as a placeholder for an address a transport is expected to fill in.
    #[default]
    Unspec,
    /// An IPv4 address and port.
    Inet(SocketAddrV4),
    /// An IPv6 address, port, and scope.
    Inet6(SocketAddrV6),
    /// A local IPC path.
    Ipc(PathBuf),
}

impl SockAddr {
    /// Whether this is an IPv4 or IPv6 address.
    pub fn is_ip(&self) -> bool {
        matches!(self, SockAddr::Inet(..) | SockAddr::Inet6(..))
    }

    /// The [SocketAddr] equivalent, for the IP families only.
    pub fn to_std(&self) -> Option<SocketAddr> {
        match self {
            SockAddr::Inet(addr) => Some(SocketAddr::V4(*addr)),
            SockAddr::Inet6(addr) => Some(SocketAddr::V6(*addr)),
            SockAddr::Unspec | SockAddr::Ipc(..) => None,
        }
    }

    /// The address family a native socket for this address would be created with.
    pub(crate) fn family(&self) -> Result<AddressFamily> {
        match self {
            SockAddr::Inet(..) => Ok(AddressFamily::Inet),
            SockAddr::Inet6(..) => Ok(AddressFamily::Inet6),
            SockAddr::Unspec | SockAddr::Ipc(..) => Err(Error::AddressInvalid),
        }
    }

    /// Convert into the native representation. Only the IP families have one here, anything else
    /// is [Error::AddressInvalid].
    pub(crate) fn to_native(&self) -> Result<SockaddrStorage> {
        self.to_std()
            .map(SockaddrStorage::from)
            .ok_or(Error::AddressInvalid)
    }

    /// Convert from the native representation, failing with [Error::AddressInvalid] for families
    /// that have no portable form.
    pub(crate) fn from_native(addr: &SockaddrStorage) -> Result<SockAddr> {
        match addr.family() {
            Some(AddressFamily::Inet) => addr
                .as_sockaddr_in()
                .map(|sin| SockAddr::Inet(SocketAddrV4::from(*sin)))
                .ok_or(Error::AddressInvalid),
            Some(AddressFamily::Inet6) => addr
                .as_sockaddr_in6()
                .map(|sin6| SockAddr::Inet6(SocketAddrV6::from(*sin6)))
                .ok_or(Error::AddressInvalid),
            Some(AddressFamily::Unix) => addr
                .as_unix_addr()
                .and_then(|unix| unix.path())
                .map(|path| SockAddr::Ipc(path.to_path_buf()))
                .ok_or(Error::AddressInvalid),
            _ => Err(Error::AddressInvalid),
        }
    }
}

impl From<SocketAddr> for SockAddr {
    fn from(value: SocketAddr) -> Self {
        match value {
            SocketAddr::V4(addr) => SockAddr::Inet(addr),
            SocketAddr::V6(addr) => SockAddr::Inet6(addr),
        }
    }
}

impl From<SocketAddrV4> for SockAddr {
    fn from(value: SocketAddrV4) -> Self {
        SockAddr::Inet(value)
    }
}

impl From<SocketAddrV6> for SockAddr {
    fn from(value: SocketAddrV6) -> Self {
        SockAddr::Inet6(value)
    }
}

impl<I> From<(I, u16)> for SockAddr
where
    I: Into<IpAddr>,
{
    fn from((ip, port): (I, u16)) -> Self {
        SocketAddr::new(ip.into(), port).into()
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SockAddr::Unspec => f.write_str("unspec"),
            SockAddr::Inet(addr) => addr.fmt(f),
            SockAddr::Inet6(addr) => addr.fmt(f),
            SockAddr::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}
