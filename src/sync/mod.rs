//! Synchronization helpers used to bridge completion callbacks into futures.

mod oneshot;

pub(crate) use oneshot::OneShot;
