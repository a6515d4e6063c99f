use std::{
    cell::Cell,
    cmp, fmt,
    sync::atomic::{AtomicUsize, Ordering},
    sync::mpsc,
    sync::{Arc, Mutex},
    thread,
};

use crossbeam_utils::sync::WaitGroup;
use tracing::{debug, trace};

use crate::Result;

thread_local! {
    static IN_POOL: Cell<bool> = const { Cell::new(false) };
}

/// A fixed size pool of worker threads that executes completion callbacks, this is what gives
/// [crate::Aio::finish] its asynchronous delivery semantics. Work is handed to the workers over a
/// shared channel and each closure runs to completion on a single worker.
///
/// Cloning a [ThreadPool] produces another handle to the same workers, the workers are shut down
/// once the last handle is dropped.
pub struct ThreadPool {
    state: Arc<PoolState>,
    wg: Option<WaitGroup>,
}

/// Thread pool configuration object.
pub struct ThreadPoolBuilder {
    pool_size: usize,
    stack_size: usize,
    name_prefix: Option<String>,
}

#[allow(dead_code)]
trait AssertSendSync: Send + Sync {}
impl AssertSendSync for ThreadPool {}

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Task),
    Close,
}

struct PoolState {
    tx: Mutex<mpsc::Sender<Message>>,
    rx: Mutex<mpsc::Receiver<Message>>,
    cnt: AtomicUsize,
    size: usize,
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("size", &self.state.size)
            .finish()
    }
}

impl fmt::Debug for ThreadPoolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolBuilder")
            .field("workers", &self.pool_size)
            .field("stack_size", &self.stack_size)
            .field("prefix", &self.name_prefix)
            .finish()
    }
}

impl ThreadPool {
    /// Queue `task` for execution on one of the worker threads.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.state.send(Message::Run(Box::new(task)));
    }

    /// Whether the calling thread is one of the worker threads of any [ThreadPool].
    pub fn on_worker() -> bool {
        IN_POOL.with(|flag| flag.get())
    }
}

impl PoolState {
    fn send(&self, msg: Message) {
        // The receiving side only goes away once every worker has exited, which in turn only
        // happens after all handles are gone, so a failed send can safely be ignored.
        let _ = self
            .tx
            .lock()
            .expect("failed to lock thread pool sender: poisoned")
            .send(msg);
    }

    fn recv(&self) -> Option<Message> {
        self.rx
            .lock()
            .expect("failed to lock thread pool receiver: poisoned")
            .recv()
            .ok()
    }

    fn work(&self, idx: usize) {
        IN_POOL.with(|flag| flag.set(true));
        trace!(worker = idx, "callback worker started");
        while let Some(msg) = self.recv() {
            match msg {
                Message::Run(task) => task(),
                Message::Close => break,
            }
        }
        trace!(worker = idx, "callback worker stopped");
    }
}

impl Clone for ThreadPool {
    fn clone(&self) -> Self {
        self.state.cnt.fetch_add(1, Ordering::Relaxed);
        Self {
            state: self.state.clone(),
            wg: self.wg.clone(),
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if self.state.cnt.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        for _ in 0..self.state.size {
            self.state.send(Message::Close);
        }
        // A worker dropping the last handle can't wait on itself, the remaining workers still
        // drain their close messages and exit on their own.
        if let Some(wg) = self.wg.take() {
            if !ThreadPool::on_worker() {
                wg.wait();
                debug!(size = self.state.size, "callback pool shut down");
            }
        }
    }
}

impl ThreadPoolBuilder {
    /// Create a default thread pool configuration.
    ///
    /// See the other methods on this type for details on the defaults.
    pub fn new() -> Self {
        Self {
            pool_size: cmp::max(1, num_cpus::get()),
            stack_size: 0,
            name_prefix: None,
        }
    }

    /// Set the number of callback workers, one per CPU core unless configured.
    ///
    /// # Panics
    ///
    /// Panics if `pool_size == 0`.
    pub fn pool_size(&mut self, size: usize) -> &mut Self {
        assert!(size > 0);
        self.pool_size = size;
        self
    }

    /// Set the stack size of each callback worker in bytes, zero keeping the platform default.
    /// Callbacks run to completion on this stack, so size it for the deepest callback.
    pub fn stack_size(&mut self, stack_size: usize) -> &mut Self {
        self.stack_size = stack_size;
        self
    }

    /// Name the workers `<prefix><index>`, unnamed by default. The runtime names its callback
    /// workers `aioq-cb-0`, `aioq-cb-1` and so on.
    pub fn name_prefix<S: Into<String>>(&mut self, name_prefix: S) -> &mut Self {
        self.name_prefix = Some(name_prefix.into());
        self
    }

    /// Spawn the workers and return the first handle to them. Failing to spawn any worker fails
    /// the whole pool.
    pub fn create(&mut self) -> Result<ThreadPool> {
        let (tx, rx) = mpsc::channel();
        let wg = WaitGroup::new();
        let mut pool = ThreadPool {
            state: Arc::new(PoolState {
                tx: Mutex::new(tx),
                rx: Mutex::new(rx),
                cnt: AtomicUsize::new(1),
                size: self.pool_size,
            }),
            wg: None,
        };

        for counter in 0..self.pool_size {
            let state = pool.state.clone();
            let wg = wg.clone();
            let mut thread_builder = thread::Builder::new();
            if let Some(ref name_prefix) = self.name_prefix {
                thread_builder = thread_builder.name(format!("{}{}", name_prefix, counter));
            }
            if self.stack_size > 0 {
                thread_builder = thread_builder.stack_size(self.stack_size);
            }
            thread_builder.spawn(move || {
                state.work(counter);
                drop(wg)
            })?;
        }
        debug!(size = self.pool_size, "callback pool started");
        pool.wg = Some(wg);
        Ok(pool)
    }
}

impl Default for ThreadPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}
