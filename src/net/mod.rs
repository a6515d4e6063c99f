//! The [self] module holds the transports built on [crate::Aio], along with the portable
//! [SockAddr] they take and report addresses as.
//!
//! This module primarily exposes the following objects:
//! - [UdpSocket] which is the datagram transport, driven by the runtime's dispatcher.
//! - [SockAddr] which is the address type every transport speaks.
//! - [RecvFrom] and [SendTo] which are futures wrapping single operations on a [UdpSocket].

mod addr;
mod dgram;
mod futures;
mod socket;
mod types;

pub use addr::SockAddr;
pub use dgram::UdpSocket;
pub use futures::*;
