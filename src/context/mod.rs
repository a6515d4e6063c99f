//! The context module owns the process wide runtime state. Rather than implicit global startup
//! and teardown, the runtime is brought up explicitly with [init] (or a [RuntimeBuilder]) and is
//! reference counted through [Runtime] handles. The components that need it, the callback pool
//! and the completion dispatcher, are reached through those handles.
//!
//! The dispatcher is started lazily, on the first request for it, so code that only uses
//! [crate::Aio] never touches `io_uring` at all.

mod runtime;
mod statics;

pub use runtime::{Runtime, RuntimeBuilder};
pub(crate) use statics::runtime;
pub use statics::{current, init, same};
