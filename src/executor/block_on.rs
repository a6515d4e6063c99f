use std::{
    sync::Arc,
    task::{Context, Poll},
    thread::{self, Thread},
};

use futures::{
    pin_mut,
    task::{waker, ArcWake},
    Future,
};

struct ThreadWaker(Thread);

impl ArcWake for ThreadWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.unpark();
    }
}

/// Run the supplied future to completion blocking the current thread until the future is complete.
/// The I/O itself is driven by the runtime's dispatcher thread, so the calling thread simply parks
/// between polls and is unparked whenever the future's waker fires.
///
/// # Examples
///
/// ```no_run
/// use aioq::{executor, net::{SockAddr, UdpSocket}};
///
/// let _rt = aioq::init().expect("failed to initialize runtime");
/// let sock = UdpSocket::open(&SockAddr::from(([127, 0, 0, 1], 0))).unwrap();
/// let (buf, len, from) = executor::block_on(sock.recv_from(vec![0u8; 1500])).unwrap();
/// println!("{} bytes from {}: {:?}", len, from, &buf[..len]);
/// ```
///
/// # Panics
///
/// Must not be called from a completion callback, as those run on runtime owned threads that
/// would then be blocked.
pub fn block_on<F: Future>(f: F) -> F::Output {
    pin_mut!(f);
    let waker = waker(Arc::new(ThreadWaker(thread::current())));
    let mut cx = Context::from_waker(&waker);
    loop {
        if let Poll::Ready(result) = f.as_mut().poll(&mut cx) {
            return result;
        }
        thread::park();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::channel::oneshot;

    use super::*;

    #[test]
    fn test_block_on_wakes_from_other_thread() {
        let (tx, rx) = oneshot::channel();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            tx.send(42u32).unwrap();
        });
        assert_eq!(block_on(rx), Ok(42));
        handle.join().unwrap();
    }
}
