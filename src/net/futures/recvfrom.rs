use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::Future;

use crate::{
    net::{SockAddr, UdpSocket},
    sync::OneShot,
    Aio, Result,
};

/// A single use receive, resolving to the buffer handed in, the length of the datagram that was
/// written into it, and the address the datagram came from.
///
/// Dropping the future before it resolves stops the underlying [Aio], which cancels the receive.
pub struct RecvFrom {
    aio: Arc<Aio>,
    done: OneShot<Result<()>>,
}

impl RecvFrom {
    pub(crate) fn new(sock: &UdpSocket, buf: Vec<u8>) -> RecvFrom {
        let done = OneShot::new();
        let aio = {
            let done = done.clone();
            Aio::new(move |aio| done.complete(aio.result()))
        };
        aio.set_iov(vec![buf]);
        aio.set_input(0, SockAddr::Unspec);

        sock.recv(&aio);
        RecvFrom { aio, done }
    }
}

impl Future for RecvFrom {
    type Output = Result<(Vec<u8>, usize, SockAddr)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = match self.done.poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };

        Poll::Ready(result.map(|()| {
            let buf = self.aio.take_iov().pop().unwrap_or_default();
            let from = self.aio.input::<SockAddr>(0).unwrap_or_default();
            (buf, self.aio.count(), from)
        }))
    }
}
