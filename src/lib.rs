//! # aioq
//!
//! This is the transport independent asynchronous I/O core of a messaging library, designed to
//! run on linux and built around `io_uring` as a proactor. The package is split up into a handful
//! of modules each handling a specific subset of the functionality needed:
//!
//! - [list] is an intrusive doubly linked list used to queue pending operations without
//!   allocating.
//! - [Aio] is the asynchronous operation itself, with its lifecycle and cancellation contract.
//! - [io_uring] is the completion dispatcher, a thread owning the ring and delivering native
//!   completions to the transports that submitted them.
//! - [net] holds the reference [net::UdpSocket] transport and the portable [net::SockAddr].
//! - [context] and [executor] bring up the reference counted runtime and its callback pool.
//!
//! At a high level a datagram exchange over loopback looks like this:
//!
//! ```no_run
//! use std::sync::mpsc;
//!
//! use aioq::{net::{SockAddr, UdpSocket}, Aio};
//!
//! fn main() -> aioq::Result<()> {
//!     let _rt = aioq::init()?;
//!
//!     let rx = UdpSocket::open(&SockAddr::from(([127, 0, 0, 1], 0)))?;
//!     let tx = UdpSocket::open(&SockAddr::from(([127, 0, 0, 1], 0)))?;
//!
//!     // Queue a receive, the callback fires once a datagram has landed in the buffer.
//!     let (done, landed) = mpsc::channel();
//!     let done = std::sync::Mutex::new(done);
//!     let recv = Aio::new(move |aio| {
//!         let _ = done.lock().unwrap().send((aio.result(), aio.count()));
//!     });
//!     recv.set_iov(vec![vec![0u8; 1500]]);
//!     recv.set_input(0, SockAddr::Unspec);
//!     rx.recv(&recv);
//!
//!     // Sends complete immediately, the destination goes in input 0.
//!     let send = Aio::without_callback();
//!     send.set_iov(vec![b"hello".to_vec()]);
//!     send.set_input(0, rx.local_addr()?);
//!     tx.send(&send);
//!     send.wait();
//!
//!     let (result, count) = landed.recv().unwrap();
//!     result?;
//!     recv.wait();
//!     let from = recv.input::<SockAddr>(0).unwrap_or_default();
//!     println!("{} bytes from {}: {:?}", count, from, &recv.take_iov()[0][..count]);
//!     Ok(())
//! }
//! ```

pub mod aio;
pub mod context;
mod error;
pub mod executor;
pub mod io_uring;
pub mod list;
pub mod net;
pub(crate) mod ptr;
pub(crate) mod sync;

pub use aio::{Aio, AioCancel, AioStatus};
pub use context::{init, Runtime, RuntimeBuilder};
pub use error::{Error, Result};
pub use executor::{block_on, ThreadPool, ThreadPoolBuilder};
