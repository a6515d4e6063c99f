use std::{
    cmp, fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::debug;

use crate::{
    executor::{ThreadPool, ThreadPoolBuilder},
    io_uring::Dispatcher,
    Result,
};

use super::statics;

const DEFAULT_RING_ENTRIES: u32 = 4096;
const DEFAULT_NAME_PREFIX: &str = "aioq";

/// A handle to the process wide runtime, made up of the callback [ThreadPool] and the
/// [Dispatcher]. Handles are cheap to clone and every clone keeps the runtime alive, the threads
/// are stopped once the final handle is dropped.
///
/// Every [crate::Aio] and every open transport holds a handle of its own, so the runtime always
/// outlives the operations running on it.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

pub(super) struct RuntimeInner {
    ring_entries: u32,
    name_prefix: String,
    pool: ThreadPool,
    dispatcher: Mutex<Option<Arc<Dispatcher>>>,
}

impl Runtime {
    pub(super) fn from_inner(inner: Arc<RuntimeInner>) -> Runtime {
        Runtime { inner }
    }

    pub(super) fn inner(&self) -> &Arc<RuntimeInner> {
        &self.inner
    }

    /// The callback pool used for asynchronous completion delivery.
    pub fn pool(&self) -> &ThreadPool {
        &self.inner.pool
    }

    /// Return the runtime's [Dispatcher], starting it if this is the first request. Failing to
    /// set up the ring, for instance on a kernel without `io_uring`, is reported here and retried
    /// on the next request.
    pub fn dispatcher(&self) -> Result<Arc<Dispatcher>> {
        let mut dispatcher = self.inner.lock_dispatcher();
        if let Some(dispatcher) = dispatcher.as_ref() {
            return Ok(dispatcher.clone());
        }

        let started = Arc::new(Dispatcher::new(
            self.inner.ring_entries,
            format!("{}-dispatch", self.inner.name_prefix),
        )?);
        dispatcher.replace(started.clone());
        Ok(started)
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("ring_entries", &self.inner.ring_entries)
            .field("pool", &self.inner.pool)
            .finish()
    }
}

impl RuntimeInner {
    fn lock_dispatcher(&self) -> MutexGuard<'_, Option<Arc<Dispatcher>>> {
        self.dispatcher
            .lock()
            .expect("failed to lock runtime dispatcher: poisoned")
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.lock_dispatcher().take() {
            dispatcher.shutdown();
        }
        debug!("runtime shut down");
    }
}

/// Runtime configuration object. The configuration only applies when [RuntimeBuilder::init]
/// actually creates the runtime, when a runtime is already alive a handle to it is returned as is.
pub struct RuntimeBuilder {
    ring_entries: u32,
    pool_size: usize,
    name_prefix: String,
}

impl RuntimeBuilder {
    /// Create a default runtime configuration.
    ///
    /// See the other methods on this type for details on the defaults.
    pub fn new() -> Self {
        Self {
            ring_entries: DEFAULT_RING_ENTRIES,
            pool_size: cmp::max(1, num_cpus::get()),
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
        }
    }

    /// Set the number of submission queue entries of the dispatcher's ring, 4096 by default.
    ///
    /// # Panics
    ///
    /// Panics if `entries == 0`.
    pub fn ring_entries(&mut self, entries: u32) -> &mut Self {
        assert!(entries > 0);
        self.ring_entries = entries;
        self
    }

    /// Set the number of callback threads. By default, this is equal to the number of CPU cores.
    ///
    /// # Panics
    ///
    /// Panics if `size == 0`.
    pub fn pool_size(&mut self, size: usize) -> &mut Self {
        assert!(size > 0);
        self.pool_size = size;
        self
    }

    /// Set the prefix used to name the runtime's threads, `aioq` by default. The dispatcher is
    /// named `<prefix>-dispatch` and the callback workers `<prefix>-cb-<n>`.
    pub fn name_prefix<S: Into<String>>(&mut self, name_prefix: S) -> &mut Self {
        self.name_prefix = name_prefix.into();
        self
    }

    /// Return a handle to the live runtime, creating it with this configuration if there is none.
    pub fn init(&self) -> Result<Runtime> {
        statics::get_or_init(|| {
            let pool = ThreadPoolBuilder::new()
                .pool_size(self.pool_size)
                .name_prefix(format!("{}-cb-", self.name_prefix))
                .create()?;

            debug!(
                ring_entries = self.ring_entries,
                pool_size = self.pool_size,
                "runtime initialized"
            );
            Ok(Arc::new(RuntimeInner {
                ring_entries: self.ring_entries,
                name_prefix: self.name_prefix.clone(),
                pool,
                dispatcher: Mutex::new(None),
            }))
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
