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

/// A single use send of one datagram, resolving to the number of bytes sent.
pub struct SendTo {
    aio: Arc<Aio>,
    done: OneShot<Result<()>>,
}

impl SendTo {
    pub(crate) fn new(sock: &UdpSocket, buf: Vec<u8>, dest: SockAddr) -> SendTo {
        let done = OneShot::new();
        let aio = {
            let done = done.clone();
            Aio::new(move |aio| done.complete(aio.result()))
        };
        aio.set_iov(vec![buf]);
        aio.set_input(0, dest);

        sock.send(&aio);
        SendTo { aio, done }
    }
}

impl Future for SendTo {
    type Output = Result<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.done
            .poll(cx)
            .map(|result| result.map(|()| self.aio.count()))
    }
}
