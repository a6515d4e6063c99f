use std::{
    io::IoSlice,
    mem,
    net::{Ipv4Addr, Ipv6Addr},
    os::fd::{AsRawFd, BorrowedFd, OwnedFd},
};

use nix::{
    errno::Errno,
    libc,
    sys::socket::{
        bind, getsockname, sendmsg, setsockopt, socket, sockopt, AddressFamily,
        IpMembershipRequest, MsgFlags, SockFlag, SockType, SockaddrStorage,
    },
};

use crate::{Error, Result};

use super::SockAddr;

/// Create a close-on-exec datagram socket for `addr`'s family. IPv6 sockets accept IPv4 mapped
/// traffic as well.
pub(super) fn datagram_socket(addr: &SockAddr) -> Result<OwnedFd> {
    let family = addr.family()?;
    let fd = socket(family, SockType::Datagram, SockFlag::SOCK_CLOEXEC, None)?;
    if family == AddressFamily::Inet6 {
        setsockopt(&fd, sockopt::Ipv6V6Only, &false)?;
    }
    Ok(fd)
}

pub(super) fn bind_to(fd: BorrowedFd<'_>, addr: &SockAddr) -> Result<()> {
    let native = addr.to_native()?;
    bind(fd.as_raw_fd(), &native)?;
    Ok(())
}

pub(super) fn local_addr(fd: BorrowedFd<'_>) -> Result<SockAddr> {
    let addr: SockaddrStorage = getsockname(fd.as_raw_fd())?;
    SockAddr::from_native(&addr)
}

/// Send the concatenation of `bufs` to `dest` as one datagram without blocking.
pub(super) fn send_to(
    fd: BorrowedFd<'_>,
    bufs: &[Vec<u8>],
    dest: &SockaddrStorage,
) -> Result<usize> {
    let iov: Vec<IoSlice<'_>> = bufs.iter().map(|buf| IoSlice::new(buf)).collect();
    Ok(sendmsg(
        fd.as_raw_fd(),
        &iov,
        &[],
        MsgFlags::MSG_DONTWAIT,
        Some(dest),
    )?)
}

pub(super) fn ipv4_membership(
    fd: BorrowedFd<'_>,
    group: Ipv4Addr,
    interface: Ipv4Addr,
    join: bool,
) -> Result<()> {
    let req = IpMembershipRequest::new(group, Some(interface));
    if join {
        setsockopt(&fd, sockopt::IpAddMembership, &req)?;
    } else {
        setsockopt(&fd, sockopt::IpDropMembership, &req)?;
    }
    Ok(())
}

/// IPv6 group membership on the interface with index `interface`, 0 letting the kernel pick. The
/// typed socket options always pick the default interface, hence the raw request.
pub(super) fn ipv6_membership(
    fd: BorrowedFd<'_>,
    group: &Ipv6Addr,
    interface: u32,
    join: bool,
) -> Result<()> {
    let req = libc::ipv6_mreq {
        ipv6mr_multiaddr: libc::in6_addr {
            s6_addr: group.octets(),
        },
        ipv6mr_interface: interface as _,
    };
    let opt = if join {
        libc::IPV6_ADD_MEMBERSHIP
    } else {
        libc::IPV6_DROP_MEMBERSHIP
    };

    // SAFETY: The request is a fully initialized ipv6_mreq and the length matches it.
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::IPPROTO_IPV6,
            opt,
            &req as *const libc::ipv6_mreq as *const libc::c_void,
            mem::size_of::<libc::ipv6_mreq>() as libc::socklen_t,
        )
    };
    Errno::result(ret).map(drop).map_err(Error::from)
}
