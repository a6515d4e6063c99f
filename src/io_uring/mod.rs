//! The [crate::io_uring] module is the completion dispatcher, a simplified proactor on top of the
//! [io_uring::IoUring] implementation. This module distills the implementation down to three
//! components:
//! - The [Completion] trait which transports implement to be handed the results of their native
//! submissions.
//! - The [IoToken] and [IoId] identifiers, naming a registration and a single submission.
//! - The [Dispatcher] which owns the ring on its own thread and delivers completions.
//!
//! A process normally holds exactly one [Dispatcher], owned by the [crate::context::Runtime] and
//! started lazily the first time a transport asks for it.

mod cancel;
mod completion;
mod engine;

pub use completion::{Completion, IoId, IoToken};
pub use engine::Dispatcher;
