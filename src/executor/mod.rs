//! Thread execution support for the runtime. The [ThreadPool] here is the callback task queue used
//! for asynchronous completion delivery. Its structure follows the
//! [futures::executor::ThreadPool], trimmed down to run plain closures rather than poll futures,
//! since completion callbacks never yield.
//!
//! [block_on] is a small parking executor for driving the futures in [crate::net] from
//! synchronous code.
//!
//! [futures::executor::ThreadPool]: https://docs.rs/futures/latest/futures/executor/struct.ThreadPool.html

mod block_on;
mod pool;

pub use block_on::block_on;
pub use pool::{ThreadPool, ThreadPoolBuilder};
