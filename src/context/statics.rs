use std::sync::{Arc, Mutex, MutexGuard, Weak};

use lazy_static::lazy_static;

use crate::Result;

use super::{runtime::RuntimeInner, Runtime, RuntimeBuilder};

lazy_static! {
    static ref RUNTIME: Mutex<Weak<RuntimeInner>> = Mutex::new(Weak::new());
}

fn lock<'a>() -> MutexGuard<'a, Weak<RuntimeInner>> {
    RUNTIME
        .lock()
        .expect("failed to lock global runtime: poisoned")
}

pub(super) fn get_or_init<F>(create: F) -> Result<Runtime>
where
    F: FnOnce() -> Result<Arc<RuntimeInner>>,
{
    let mut global = lock();
    if let Some(inner) = global.upgrade() {
        return Ok(Runtime::from_inner(inner));
    }
    let inner = create()?;
    *global = Arc::downgrade(&inner);
    Ok(Runtime::from_inner(inner))
}

/// Initialize the runtime with the default configuration, or return a new handle to the one that
/// is already running. The runtime is reference counted: it stays up for as long as any handle,
/// [crate::Aio], or open transport exists, and shuts down when the last of them is dropped.
///
/// # Examples
///
/// ```no_run
/// let rt = aioq::init().expect("failed to initialize runtime");
/// // Create operations and open transports here.
/// drop(rt);
/// ```
pub fn init() -> Result<Runtime> {
    RuntimeBuilder::new().init()
}

/// Return a handle to the live runtime, if there is one.
pub fn current() -> Option<Runtime> {
    lock().upgrade().map(Runtime::from_inner)
}

/// Return a handle to the live runtime.
///
/// # Panics
///
/// Panics if no runtime has been initialized, using the crate without one is a programming error.
pub(crate) fn runtime() -> Runtime {
    match current() {
        Some(runtime) => runtime,
        None => panic!("runtime not initialized, call aioq::init() first"),
    }
}

/// Whether `a` and `b` are handles to the same runtime.
pub fn same(a: &Runtime, b: &Runtime) -> bool {
    Arc::ptr_eq(a.inner(), b.inner())
}
