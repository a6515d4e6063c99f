#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use aioq::{
    net::{SockAddr, UdpSocket},
    Aio, Error, Runtime,
};

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn runtime() -> Runtime {
    init_test_logging();
    aioq::init().expect("failed to initialize runtime")
}

pub fn loopback() -> SockAddr {
    SockAddr::from(([127, 0, 0, 1], 0))
}

/// Open a socket on `addr`, or `None` if the kernel refuses `io_uring` here, in which case the
/// calling test is skipped.
pub fn open_or_skip(addr: &SockAddr) -> Option<UdpSocket> {
    match UdpSocket::open(addr) {
        Ok(sock) => Some(sock),
        Err(err @ (Error::PermissionDenied | Error::NotSupported)) => {
            tracing::warn!(%err, "io_uring unavailable, skipping test");
            None
        }
        Err(err) => panic!("failed to open socket on {}: {}", addr, err),
    }
}

/// A receive operation with a buffer of `len` bytes that asks for the source address, along with
/// a count of how often its callback has fired.
pub fn recv_aio(len: usize) -> (Arc<Aio>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let aio = {
        let calls = calls.clone();
        Aio::new(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        })
    };
    aio.set_iov(vec![vec![0u8; len]]);
    aio.set_input(0, SockAddr::Unspec);
    (aio, calls)
}

/// Send `payload` from `sock` to `dest`, returning the outcome of the send.
pub fn send(sock: &UdpSocket, dest: &SockAddr, payload: &[u8]) -> aioq::Result<usize> {
    let aio = Aio::without_callback();
    aio.set_iov(vec![payload.to_vec()]);
    aio.set_input(0, dest.clone());
    sock.send(&aio);
    aio.wait();
    aio.result().map(|()| aio.count())
}

/// The bytes a completed receive wrote.
pub fn received(aio: &Aio) -> Vec<u8> {
    let count = aio.count();
    let mut iov = aio.take_iov();
    let mut buf = iov.pop().unwrap_or_default();
    buf.truncate(count);
    buf
}
