use std::{mem, ptr};

use nix::{
    libc,
    sys::socket::{SockaddrLike, SockaddrStorage},
};

use crate::{net::SockAddr, Error, Result};

/// The scratch header a transport points its native receive at. The header, the iovec array,
/// and the source address storage all live on the heap so their addresses stay put while a
/// receive is outstanding, no matter where the owning transport moves.
pub(crate) struct RecvHeader {
    hdr: Box<libc::msghdr>,
    iov: Vec<libc::iovec>,
    addr: Box<libc::sockaddr_storage>,
    capacity: usize,
}

// SAFETY: The raw pointers only ever reference memory owned by the header itself, or buffers
// owned by the operation it was prepared for.
unsafe impl Send for RecvHeader {}

impl RecvHeader {
    pub(crate) fn new() -> RecvHeader {
        RecvHeader {
            // SAFETY: Both are plain C structures for which all zeroes is a valid value.
            hdr: Box::new(unsafe { mem::zeroed() }),
            iov: Vec::new(),
            addr: Box::new(unsafe { mem::zeroed() }),
            capacity: 0,
        }
    }

    /// Point the header at `bufs` and return the pointer to hand to the native receive.
    ///
    /// The buffers must neither move nor be resized until the receive completes, and the header
    /// must not be prepared again in the meantime.
    pub(crate) fn prepare(&mut self, bufs: &mut [Vec<u8>]) -> *mut libc::msghdr {
        self.iov.clear();
        self.iov.extend(bufs.iter_mut().map(|buf| libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        }));
        self.capacity = bufs.iter().map(Vec::len).sum();

        self.hdr.msg_name = self.addr.as_mut() as *mut libc::sockaddr_storage as *mut libc::c_void;
        self.hdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        self.hdr.msg_iov = self.iov.as_mut_ptr();
        self.hdr.msg_iovlen = self.iov.len() as _;
        self.hdr.msg_control = ptr::null_mut();
        self.hdr.msg_controllen = 0;
        self.hdr.msg_flags = 0;
        self.hdr.as_mut() as *mut libc::msghdr
    }

    /// Total length of the buffers the header was last prepared for.
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// The source address of the last datagram received through this header.
    pub(crate) fn source(&self) -> Result<SockAddr> {
        // SAFETY: The storage is large enough for any family, and the kernel reports how much of
        // it was written through msg_namelen.
        let addr = unsafe {
            SockaddrStorage::from_raw(
                self.addr.as_ref() as *const libc::sockaddr_storage as *const libc::sockaddr,
                Some(self.hdr.msg_namelen),
            )
        }
        .ok_or(Error::AddressInvalid)?;
        SockAddr::from_native(&addr)
    }
}
