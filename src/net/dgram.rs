use std::{
    net::{Ipv4Addr, Ipv6Addr},
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    ptr::NonNull,
    sync::{Arc, Condvar, Mutex, MutexGuard},
};

use io_uring::{opcode, types};
use nix::libc;
use tracing::{debug, trace, warn};

use crate::{
    aio::{Aio, AioCancel, AioQueue},
    context::{self, Runtime},
    io_uring::{Completion, Dispatcher, IoId, IoToken},
    list::IntrusiveList,
    net::{types::RecvHeader, RecvFrom, SendTo, SockAddr},
    Error, Result,
};

use super::socket;

/// A [UdpSocket] is a bound datagram socket driven by the runtime's dispatcher. Receives are
/// queued and served strictly in order, with a single native receive outstanding at any time for
/// the operation at the head of the queue. Sends are attempted immediately without blocking.
///
/// Both directions are expressed as [Aio] operations:
/// - [UdpSocket::recv] fills the operation's I/O vectors with one datagram. If input 0 is set the
///   source address is stored back into it as a [SockAddr].
/// - [UdpSocket::send] sends the operation's I/O vectors as one datagram to the [SockAddr] in
///   input 0.
///
/// The futures returned by [UdpSocket::recv_from] and [UdpSocket::send_to] wrap the same calls.
///
/// Dropping the socket closes it, see [UdpSocket::close].
pub struct UdpSocket {
    inner: Arc<UdpInner>,
}

struct UdpInner {
    // Keeps the dispatcher, and the callback pool, alive for as long as the socket is.
    _runtime: Runtime,
    dispatcher: Arc<Dispatcher>,
    state: Mutex<UdpState>,
    cv: Condvar,
}

struct UdpState {
    fd: Option<OwnedFd>,
    token: Option<IoToken>,
    rxq: IntrusiveList<Aio, AioQueue>,
    // The submission serving the head of rxq, if one is outstanding.
    rx_id: Option<IoId>,
    // Result the outstanding receive will be finished with, regardless of what the kernel says.
    cancel: Option<Error>,
    closed: bool,
    // Operations taken off rxq whose finish has not returned yet.
    finishing: usize,
    rx_hdr: RecvHeader,
}

/// The native membership request for a group, on the interface picked from the local address.
#[derive(Debug, PartialEq, Eq)]
enum Membership {
    V4 { group: Ipv4Addr, interface: Ipv4Addr },
    V6 { group: Ipv6Addr, interface: u32 },
}

impl Membership {
    /// Without a known local address the group is joined on any interface. A known address of the
    /// other family is a mismatch.
    fn new(group: &SockAddr, local: Option<SockAddr>) -> Result<Membership> {
        match (group, local) {
            (SockAddr::Inet(group), Some(SockAddr::Inet(local))) => Ok(Membership::V4 {
                group: *group.ip(),
                interface: *local.ip(),
            }),
            (SockAddr::Inet(group), None) => Ok(Membership::V4 {
                group: *group.ip(),
                interface: Ipv4Addr::UNSPECIFIED,
            }),
            (SockAddr::Inet6(group), Some(SockAddr::Inet6(local))) => Ok(Membership::V6 {
                group: *group.ip(),
                interface: local.scope_id(),
            }),
            (SockAddr::Inet6(group), None) => Ok(Membership::V6 {
                group: *group.ip(),
                interface: 0,
            }),
            _ => Err(Error::AddressInvalid),
        }
    }
}

impl UdpSocket {
    /// Open a datagram socket bound to `addr`. Only the IP families are supported, anything else
    /// fails with [Error::AddressInvalid].
    ///
    /// The runtime's dispatcher is started here if it is not yet running, a kernel refusing
    /// `io_uring` surfaces as the translated error.
    ///
    /// # Panics
    ///
    /// Panics if no runtime has been initialized with [crate::init].
    pub fn open(addr: &SockAddr) -> Result<UdpSocket> {
        let runtime = context::runtime();
        let fd = socket::datagram_socket(addr)?;
        let dispatcher = runtime.dispatcher()?;
        let raw_fd = fd.as_raw_fd();

        let inner = Arc::new(UdpInner {
            _runtime: runtime,
            dispatcher,
            state: Mutex::new(UdpState {
                fd: Some(fd),
                token: None,
                rxq: IntrusiveList::new(),
                rx_id: None,
                cancel: None,
                closed: false,
                finishing: 0,
                rx_hdr: RecvHeader::new(),
            }),
            cv: Condvar::new(),
        });
        let token = inner.dispatcher.register(raw_fd, inner.clone())?;
        inner.lock().token = Some(token);

        // From here on dropping the socket tears everything down again.
        let sock = UdpSocket { inner };
        sock.inner.with_fd(|fd| socket::bind_to(fd, addr))?;

        debug!(fd = raw_fd, %addr, "udp socket opened");
        Ok(sock)
    }

    /// Receive one datagram into `aio`'s I/O vectors. The operation completes with the datagram's
    /// length as its count, with [Error::MessageTooBig] if the datagram did not fit, or with
    /// [Error::Closed] if the socket is closed first.
    pub fn recv(&self, aio: &Aio) {
        aio.reset();

        let mut state = self.inner.lock();
        if state.closed {
            drop(state);
            aio.finish_error(Error::Closed);
            return;
        }
        if !aio.start(self.inner.clone()) {
            return;
        }

        // SAFETY: Operations stop, and so leave this queue, before they are dropped.
        unsafe { state.rxq.append(aio) };
        trace!("receive queued");
        if state.rxq.first() == Some(NonNull::from(aio)) {
            self.inner.recv_start(&mut state);
        }
    }

    /// Send `aio`'s I/O vectors as a single datagram to the [SockAddr] in input 0. The send never
    /// blocks, a full socket buffer finishes the operation with [Error::TryAgain].
    pub fn send(&self, aio: &Aio) {
        aio.reset();

        let dest = match aio.input::<SockAddr>(0) {
            Some(dest) => dest.to_native(),
            None => Err(Error::AddressInvalid),
        };
        let dest = match dest {
            Ok(dest) => dest,
            Err(err) => return aio.finish_error(err),
        };

        let result = {
            let state = self.inner.lock();
            match state.fd.as_ref() {
                Some(fd) if !state.closed => {
                    aio.with_iov(|bufs| socket::send_to(fd.as_fd(), bufs, &dest))
                }
                _ => Err(Error::Closed),
            }
        };

        trace!(?result, "send finished");
        match result {
            Ok(count) => aio.finish(Ok(()), count),
            Err(err) => aio.finish_error(err),
        }
    }

    /// Create a future receiving one datagram into `buf`, resolving to the buffer, the length of
    /// the datagram, and the address it came from.
    pub fn recv_from(&self, buf: Vec<u8>) -> RecvFrom {
        RecvFrom::new(self, buf)
    }

    /// Create a future sending `buf` to `dest`, resolving to the number of bytes sent.
    pub fn send_to(&self, buf: Vec<u8>, dest: SockAddr) -> SendTo {
        SendTo::new(self, buf, dest)
    }

    /// The address the socket is bound to.
    pub fn local_addr(&self) -> Result<SockAddr> {
        self.inner.with_fd(socket::local_addr)
    }

    /// Join, or leave, the multicast `group`. The group's family has to match the socket's, the
    /// membership is taken on the interface the socket is bound to, or on any interface if the
    /// bound address cannot be determined.
    pub fn set_multicast_membership(&self, group: &SockAddr, join: bool) -> Result<()> {
        self.inner.with_fd(|fd| {
            let local = match socket::local_addr(fd) {
                Ok(local) => Some(local),
                Err(err) => {
                    debug!(%err, "no local address, using any interface");
                    None
                }
            };
            match Membership::new(group, local)? {
                Membership::V4 { group, interface } => {
                    socket::ipv4_membership(fd, group, interface, join)
                }
                Membership::V6 { group, interface } => {
                    socket::ipv6_membership(fd, &group, interface, join)
                }
            }
        })
    }

    /// Stop the socket. Every queued receive is finished with [Error::Closed], the one in flight
    /// once the kernel has given up its buffers, and this blocks until that has happened. New
    /// operations are rejected with [Error::Closed].
    ///
    /// Must not be called from a callback running on the dispatcher thread.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Close the socket, stopping it and then releasing the registration and the descriptor.
    /// Closing more than once is harmless.
    pub fn close(&self) {
        self.inner.stop();

        let (token, fd) = {
            let mut state = self.inner.lock();
            (state.token.take(), state.fd.take())
        };
        if let Some(token) = token {
            self.inner.dispatcher.deregister(token);
        }
        if let Some(fd) = fd {
            debug!(fd = fd.as_raw_fd(), "udp socket closed");
        }
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        self.close();
    }
}

impl UdpInner {
    fn lock(&self) -> MutexGuard<'_, UdpState> {
        self.state
            .lock()
            .expect("failed to lock udp socket: poisoned")
    }

    fn with_fd<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(BorrowedFd<'_>) -> Result<R>,
    {
        let state = self.lock();
        match state.fd.as_ref() {
            Some(fd) if !state.closed => f(fd.as_fd()),
            _ => Err(Error::Closed),
        }
    }

    /// Issue the native receive for the head of the queue. A submission the dispatcher refuses
    /// finishes that operation and moves on to the next.
    fn recv_start(&self, state: &mut UdpState) {
        loop {
            if state.closed {
                self.drain(state, Error::Closed);
                return;
            }
            let Some(head) = state.rxq.first() else {
                self.cv.notify_all();
                return;
            };
            // SAFETY: Queued operations are alive until they are finished.
            let aio = unsafe { head.as_ref() };

            let (Some(fd), Some(token)) = (state.fd.as_ref(), state.token) else {
                self.drain(state, Error::Closed);
                return;
            };
            let fd = fd.as_raw_fd();
            let hdr = aio.with_iov_unchecked(|bufs| state.rx_hdr.prepare(bufs));
            let entry = opcode::RecvMsg::new(types::Fd(fd), hdr)
                .flags(libc::MSG_TRUNC as u32)
                .build();

            // SAFETY: The header lives in the socket and the buffers in the operation, neither is
            // released or touched before the completion for this id has been handled.
            match unsafe { self.dispatcher.submit(token, entry) } {
                Ok(id) => {
                    state.rx_id = Some(id);
                    aio.mark_in_flight();
                    return;
                }
                Err(err) => {
                    warn!(%err, "failed to submit receive");
                    // SAFETY: The operation is the head of this queue.
                    unsafe { state.rxq.remove(aio) };
                    aio.finish_error(err);
                }
            }
        }
    }

    fn drain(&self, state: &mut UdpState, err: Error) {
        while let Some(aio) = state.rxq.pop_front() {
            // SAFETY: Queued operations are alive until they are finished.
            unsafe { aio.as_ref() }.finish_error(err);
        }
        self.cv.notify_all();
    }

    fn finished(&self) {
        let mut state = self.lock();
        state.finishing -= 1;
        if state.finishing == 0 {
            self.cv.notify_all();
        }
    }

    fn stop(&self) {
        let mut state = self.lock();
        state.closed = true;
        match state.rx_id {
            Some(id) => {
                state.cancel.get_or_insert(Error::Closed);
                if let Err(err) = self.dispatcher.cancel(id) {
                    // The ring is gone, and with it anything still in flight.
                    warn!(%err, "failed to cancel receive");
                    state.rx_id = None;
                    state.cancel = None;
                    self.drain(&mut state, Error::Closed);
                }
            }
            None => self.drain(&mut state, Error::Closed),
        }

        while !state.rxq.is_empty() || state.finishing > 0 {
            state = self
                .cv
                .wait(state)
                .expect("failed to wait on udp socket: poisoned");
        }
    }
}

impl AioCancel for UdpInner {
    fn cancel(&self, aio: &Aio, err: Error) {
        let mut state = self.lock();
        let is_head = state.rxq.first() == Some(NonNull::from(aio));

        match state.rx_id {
            Some(id) if is_head => {
                trace!(?id, %err, "canceling receive in flight");
                state.cancel.get_or_insert(err);
                if let Err(cancel_err) = self.dispatcher.cancel(id) {
                    warn!(err = %cancel_err, "failed to cancel receive");
                }
            }
            _ if state.rxq.is_active(aio) => {
                // SAFETY: The operation's handler is this socket, so it is on this queue.
                unsafe { state.rxq.remove(aio) };
                state.finishing += 1;
                drop(state);
                aio.finish_error(err);
                self.finished();
            }
            _ => {}
        }
    }
}

impl Completion for UdpInner {
    fn complete(&self, id: IoId, result: Result<usize>) {
        let mut state = self.lock();
        if state.rx_id != Some(id) {
            trace!(?id, "ignoring stale completion");
            return;
        }
        state.rx_id = None;

        let Some(head) = state.rxq.pop_front() else {
            state.cancel = None;
            return;
        };
        // SAFETY: Queued operations are alive until they are finished.
        let aio = unsafe { head.as_ref() };

        let capacity = state.rx_hdr.capacity();
        let outcome = match (state.cancel.take(), result) {
            (Some(err), _) | (None, Err(err)) => Err((err, 0)),
            (None, Ok(len)) if len > capacity => Err((Error::MessageTooBig, capacity)),
            (None, Ok(len)) => Ok(len),
        };
        let (result, count) = match outcome {
            Ok(len) if aio.has_input(0) => match state.rx_hdr.source() {
                Ok(from) => {
                    aio.set_input(0, from);
                    (Ok(()), len)
                }
                Err(err) => (Err(err), 0),
            },
            Ok(len) => (Ok(()), len),
            Err((err, count)) => (Err(err), count),
        };

        state.finishing += 1;
        self.recv_start(&mut state);
        drop(state);

        trace!(?id, ?result, count, "receive finished");
        aio.finish_sync(result, count);
        self.finished();
    }
}

#[cfg(test)]
mod tests {
    use std::net::{SocketAddrV4, SocketAddrV6};

    use super::*;

    fn v4(ip: [u8; 4]) -> SockAddr {
        SockAddr::from(SocketAddrV4::new(ip.into(), 0))
    }

    fn v6(ip: Ipv6Addr, scope: u32) -> SockAddr {
        SockAddr::from(SocketAddrV6::new(ip, 0, 0, scope))
    }

    #[test]
    fn test_membership_uses_bound_interface() {
        let group = v4([239, 1, 2, 3]);
        assert_eq!(
            Membership::new(&group, Some(v4([10, 0, 0, 7]))),
            Ok(Membership::V4 {
                group: Ipv4Addr::new(239, 1, 2, 3),
                interface: Ipv4Addr::new(10, 0, 0, 7),
            })
        );

        let group6: Ipv6Addr = "ff02::1".parse().unwrap();
        assert_eq!(
            Membership::new(&v6(group6, 0), Some(v6(Ipv6Addr::LOCALHOST, 3))),
            Ok(Membership::V6 {
                group: group6,
                interface: 3,
            })
        );
    }

    #[test]
    fn test_membership_falls_back_to_any_interface() {
        assert_eq!(
            Membership::new(&v4([239, 1, 2, 3]), None),
            Ok(Membership::V4 {
                group: Ipv4Addr::new(239, 1, 2, 3),
                interface: Ipv4Addr::UNSPECIFIED,
            })
        );

        let group6: Ipv6Addr = "ff02::1".parse().unwrap();
        assert_eq!(
            Membership::new(&v6(group6, 0), None),
            Ok(Membership::V6 {
                group: group6,
                interface: 0,
            })
        );
    }

    #[test]
    fn test_membership_family_mismatch() {
        let group6: Ipv6Addr = "ff02::1".parse().unwrap();
        assert_eq!(
            Membership::new(&v6(group6, 0), Some(v4([127, 0, 0, 1]))),
            Err(Error::AddressInvalid)
        );
        assert_eq!(
            Membership::new(&v4([239, 1, 2, 3]), Some(v6(Ipv6Addr::LOCALHOST, 0))),
            Err(Error::AddressInvalid)
        );
        assert_eq!(
            Membership::new(&SockAddr::Unspec, None),
            Err(Error::AddressInvalid)
        );
    }
}
