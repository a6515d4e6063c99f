//! The asynchronous operation at the heart of the crate. An [Aio] is created by whoever wants I/O
//! done, handed to a driver such as [crate::net::UdpSocket], and eventually finished exactly once
//! by that driver. Finishing stores the outcome and delivers the completion callback.
//!
//! The lifecycle runs `Idle -> Queued -> InFlight -> Completed`, and [Aio::reset] brings a
//! completed operation back to `Idle` for reuse. Cancellation is a request, not a transition:
//! [Aio::abort] hands the reason to the driver's registered [AioCancel] handler, and the driver
//! decides whether the operation can be finished right away or has to wait for its native call to
//! come back.
//!
//! Locking follows one rule. A driver may take an operation's lock while holding its own, never
//! the other way around. This is why [AioCancel::cancel] is always invoked with the operation's
//! lock released.

use std::{
    any::Any,
    cell::Cell,
    fmt, ptr,
    sync::{Arc, Condvar, Mutex, MutexGuard},
};

use tracing::trace;

use crate::{
    context::{self, Runtime},
    list::{Linked, Links},
    ptr::SendConst,
    Error, Result,
};

/// Number of typed input slots on every [Aio].
pub const MAX_INPUTS: usize = 4;

thread_local! {
    static IN_CALLBACK: Cell<*const Aio> = const { Cell::new(ptr::null()) };
}

type Callback = Box<dyn Fn(&Aio) + Send + Sync + 'static>;

/// Where an [Aio] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioStatus {
    /// Never started, or reset after completing.
    Idle,
    /// Accepted by a driver and waiting for its turn.
    Queued,
    /// A native call has been issued on behalf of the operation.
    InFlight,
    /// Finished, the result and count are final until the next reset.
    Completed,
}

/// The cancellation hook a driver registers when it accepts an operation with [Aio::start].
pub trait AioCancel: Send + Sync {
    /// Called with the operation being aborted and the reason. The operation's lock is not held,
    /// so implementations are free to take their own lock and then finish the operation.
    fn cancel(&self, aio: &Aio, err: Error);
}

/// Tag selecting the pending-queue links of an [Aio] for an [crate::list::IntrusiveList].
pub enum AioQueue {}

struct Inner {
    status: AioStatus,
    result: Result<()>,
    count: usize,
    handler: Option<Arc<dyn AioCancel>>,
    iov: Vec<Vec<u8>>,
    inputs: [Option<Box<dyn Any + Send>>; MAX_INPUTS],
    stopped: bool,
    callback_pending: bool,
    generation: u64,
}

/// An asynchronous operation, see the module docs for the lifecycle.
///
/// Operations always live behind an [Arc]. The issuer owns them, a driver only ever links them
/// onto its queue, and dropping the final handle stops the operation first, so an operation is
/// never freed while a driver can still reach it.
pub struct Aio {
    runtime: Runtime,
    callback: Option<Callback>,
    inner: Mutex<Inner>,
    cv: Condvar,
    links: Links<Aio>,
}

// SAFETY: The links belong to the queue of the driver the operation was started on, and the
// driver only touches them under its own lock.
unsafe impl Linked<AioQueue> for Aio {
    fn links(&self) -> &Links<Aio> {
        &self.links
    }
}

impl Aio {
    /// Create a new operation bound to the live runtime. The `callback` runs once per completion,
    /// on the runtime's callback pool or, for drivers finishing inline, on the driver's thread.
    ///
    /// # Panics
    ///
    /// Panics if no runtime has been initialized with [crate::init].
    pub fn new<F>(callback: F) -> Arc<Aio>
    where
        F: Fn(&Aio) + Send + Sync + 'static,
    {
        Aio::with_callback(Some(Box::new(callback)))
    }

    /// Create a new operation without a completion callback, its outcome is observed through
    /// [Aio::wait] instead.
    ///
    /// # Panics
    ///
    /// Panics if no runtime has been initialized with [crate::init].
    pub fn without_callback() -> Arc<Aio> {
        Aio::with_callback(None)
    }

    fn with_callback(callback: Option<Callback>) -> Arc<Aio> {
        Arc::new(Aio {
            runtime: context::runtime(),
            callback,
            inner: Mutex::new(Inner {
                status: AioStatus::Idle,
                result: Ok(()),
                count: 0,
                handler: None,
                iov: Vec::new(),
                inputs: Default::default(),
                stopped: false,
                callback_pending: false,
                generation: 0,
            }),
            cv: Condvar::new(),
            links: Links::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("failed to lock aio: poisoned")
    }

    /// Accept the operation into a driver, moving it to `Queued` and registering `handler` for
    /// cancellation. Drivers call this while holding their own lock.
    ///
    /// Returns `false` when the operation has been stopped. It is then finished here with
    /// [Error::Stopped] and the driver must not touch it any further.
    ///
    /// # Panics
    ///
    /// Panics if the operation is already pending.
    pub fn start(&self, handler: Arc<dyn AioCancel>) -> bool {
        let mut inner = self.lock();
        if matches!(inner.status, AioStatus::Queued | AioStatus::InFlight) {
            panic!("starting an aio that is already pending");
        }
        if inner.stopped {
            drop(inner);
            self.finish_error(Error::Stopped);
            return false;
        }
        inner.status = AioStatus::Queued;
        inner.result = Ok(());
        inner.count = 0;
        inner.handler = Some(handler);
        true
    }

    /// Record that a native call has been issued for the operation.
    pub fn mark_in_flight(&self) {
        let mut inner = self.lock();
        if inner.status == AioStatus::Queued {
            inner.status = AioStatus::InFlight;
        }
    }

    /// Finish the operation, storing `result` and `count`, and dispatch the callback to the
    /// runtime's callback pool.
    ///
    /// # Panics
    ///
    /// Panics if the operation has already completed.
    pub fn finish(&self, result: Result<()>, count: usize) {
        self.complete(result, count, false);
    }

    /// Like [Aio::finish], but the callback runs inline before this returns. Only call this with
    /// no locks held.
    pub fn finish_sync(&self, result: Result<()>, count: usize) {
        self.complete(result, count, true);
    }

    /// Finish the operation with `err` and a zero count.
    pub fn finish_error(&self, err: Error) {
        self.finish(Err(err), 0);
    }

    fn complete(&self, result: Result<()>, count: usize, inline: bool) {
        // SAFETY: Drivers finish an operation either under the lock of the queue it sits on, or
        // after having removed it themselves, in which case this is a no-op.
        unsafe { self.links.unlink() };

        let generation = {
            let mut inner = self.lock();
            if inner.status == AioStatus::Completed {
                panic!("finishing an aio that already completed");
            }
            trace!(?result, count, inline, "aio finished");
            inner.status = AioStatus::Completed;
            inner.result = result;
            inner.count = count;
            inner.handler = None;
            inner.generation += 1;
            if self.callback.is_none() {
                self.cv.notify_all();
                return;
            }
            inner.callback_pending = true;
            inner.generation
        };

        if inline {
            self.run_callback(generation);
            return;
        }

        // SAFETY: The pending callback holds back wait(), and with it Drop, until run_callback
        // has released the operation.
        let aio = unsafe { SendConst::new(self as *const Aio) };
        self.runtime.pool().execute(move || {
            // SAFETY: See above.
            let aio = unsafe { &*aio.to_ptr() };
            aio.run_callback(generation);
        });
    }

    fn run_callback(&self, generation: u64) {
        if let Some(callback) = self.callback.as_ref() {
            let outer = IN_CALLBACK.with(|current| current.replace(self as *const Aio));
            callback(self);
            IN_CALLBACK.with(|current| current.set(outer));
        }

        let mut inner = self.lock();
        // A callback may restart the operation, and that cycle owns the flag from then on.
        if inner.generation == generation {
            inner.callback_pending = false;
        }
        self.cv.notify_all();
    }

    /// Request cancellation with `err` as the reason. The registered handler, if any, is taken
    /// and invoked, an operation that is not pending is left untouched.
    pub fn abort(&self, err: Error) {
        let handler = self.lock().handler.take();
        if let Some(handler) = handler {
            trace!(%err, "aio aborted");
            handler.cancel(self, err);
        }
    }

    /// Request cancellation with [Error::Canceled].
    pub fn cancel(&self) {
        self.abort(Error::Canceled);
    }

    /// Clear the outcome of a previous run, bringing a completed operation back to `Idle`.
    ///
    /// # Panics
    ///
    /// Panics if the operation is pending.
    pub fn reset(&self) {
        let mut inner = self.lock();
        if matches!(inner.status, AioStatus::Queued | AioStatus::InFlight) {
            panic!("resetting an aio that is still pending");
        }
        inner.status = AioStatus::Idle;
        inner.result = Ok(());
        inner.count = 0;
    }

    /// Block until the operation is neither pending nor waiting on its callback.
    ///
    /// # Panics
    ///
    /// Panics if called from within the operation's own callback while it would have to block,
    /// as it would be waiting on itself.
    pub fn wait(&self) {
        let mut inner = self.lock();
        loop {
            let pending = matches!(inner.status, AioStatus::Queued | AioStatus::InFlight);
            if !pending && !inner.callback_pending {
                return;
            }
            if IN_CALLBACK.with(|current| current.get() == self as *const Aio) {
                panic!("waiting on an aio from within its own callback");
            }
            inner = self
                .cv
                .wait(inner)
                .expect("failed to wait on aio: poisoned");
        }
    }

    /// Stop the operation for good. It is aborted with [Error::Stopped] and this blocks until any
    /// outstanding work and callback has finished. Starting a stopped operation finishes it
    /// immediately with [Error::Stopped].
    pub fn stop(&self) {
        self.lock().stopped = true;
        self.abort(Error::Stopped);
        self.wait();
    }

    /// Whether [Aio::stop] has been called.
    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// The current lifecycle state.
    pub fn status(&self) -> AioStatus {
        self.lock().status
    }

    /// The result of the last completed run, `Ok(())` if it has not completed.
    pub fn result(&self) -> Result<()> {
        self.lock().result
    }

    /// The number of bytes transferred by the last completed run.
    pub fn count(&self) -> usize {
        self.lock().count
    }

    /// Store `val` in input slot `idx`, replacing whatever was there.
    ///
    /// # Panics
    ///
    /// Panics if `idx >= MAX_INPUTS`.
    pub fn set_input<T>(&self, idx: usize, val: T)
    where
        T: Any + Send,
    {
        assert!(idx < MAX_INPUTS, "aio input index {idx} out of range");
        self.lock().inputs[idx] = Some(Box::new(val));
    }

    /// Clear input slot `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx >= MAX_INPUTS`.
    pub fn clear_input(&self, idx: usize) {
        assert!(idx < MAX_INPUTS, "aio input index {idx} out of range");
        self.lock().inputs[idx] = None;
    }

    /// Return a copy of input slot `idx`, if it holds a `T`.
    ///
    /// # Panics
    ///
    /// Panics if `idx >= MAX_INPUTS`.
    pub fn input<T>(&self, idx: usize) -> Option<T>
    where
        T: Any + Clone,
    {
        assert!(idx < MAX_INPUTS, "aio input index {idx} out of range");
        self.lock().inputs[idx]
            .as_ref()
            .and_then(|val| val.downcast_ref::<T>())
            .cloned()
    }

    /// Whether input slot `idx` holds anything at all.
    pub(crate) fn has_input(&self, idx: usize) -> bool {
        assert!(idx < MAX_INPUTS, "aio input index {idx} out of range");
        self.lock().inputs[idx].is_some()
    }

    /// Replace the operation's I/O vectors.
    ///
    /// # Panics
    ///
    /// Panics if the operation is pending, a driver may be using the buffers.
    pub fn set_iov(&self, iov: Vec<Vec<u8>>) {
        self.with_iov(|current| *current = iov);
    }

    /// Take the operation's I/O vectors, leaving it with none.
    ///
    /// # Panics
    ///
    /// Panics if the operation is pending.
    pub fn take_iov(&self) -> Vec<Vec<u8>> {
        self.with_iov(std::mem::take)
    }

    /// Run `f` against the operation's I/O vectors.
    ///
    /// # Panics
    ///
    /// Panics if the operation is pending.
    pub fn with_iov<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Vec<Vec<u8>>) -> R,
    {
        let mut inner = self.lock();
        if matches!(inner.status, AioStatus::Queued | AioStatus::InFlight) {
            panic!("accessing the buffers of an aio that is still pending");
        }
        f(&mut inner.iov)
    }

    /// Run `f` against the I/O vectors regardless of state. Drivers use this to hand the buffers
    /// of an operation they own to a native call.
    pub(crate) fn with_iov_unchecked<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Vec<Vec<u8>>) -> R,
    {
        f(&mut self.lock().iov)
    }
}

impl Drop for Aio {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Aio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Aio")
            .field("status", &inner.status)
            .field("result", &inner.result)
            .field("count", &inner.count)
            .field("stopped", &inner.stopped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        ptr::NonNull,
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc, Barrier,
        },
        thread,
        time::Duration,
    };

    use super::*;
    use crate::{list::IntrusiveList, Runtime};

    /// A driver that only queues, operations complete when the test says so.
    #[derive(Default)]
    struct FakeDriver {
        queue: Mutex<IntrusiveList<Aio, AioQueue>>,
    }

    impl FakeDriver {
        fn submit(self: &Arc<Self>, aio: &Aio) {
            let mut queue = self.queue.lock().unwrap();
            if aio.start(self.clone()) {
                unsafe { queue.append(aio) };
            }
        }

        fn complete_head(&self, count: usize) -> bool {
            let head = self.queue.lock().unwrap().pop_front();
            match head {
                Some(aio) => {
                    unsafe { aio.as_ref() }.finish_sync(Ok(()), count);
                    true
                }
                None => false,
            }
        }

        fn first(&self) -> Option<NonNull<Aio>> {
            self.queue.lock().unwrap().first()
        }
    }

    impl AioCancel for FakeDriver {
        fn cancel(&self, aio: &Aio, err: Error) {
            let mut queue = self.queue.lock().unwrap();
            if !queue.is_active(aio) {
                return;
            }
            unsafe { queue.remove(aio) };
            drop(queue);
            aio.finish_error(err);
        }
    }

    fn runtime() -> Runtime {
        crate::init().unwrap()
    }

    fn counting_aio() -> (Arc<Aio>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let aio = {
            let calls = calls.clone();
            Aio::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        (aio, calls)
    }

    #[test]
    fn test_finish_delivers_callback_async() {
        let _rt = runtime();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let aio = Aio::new(move |aio| {
            let _ = tx
                .lock()
                .unwrap()
                .send((aio.result(), aio.count(), crate::executor::ThreadPool::on_worker()));
        });

        aio.finish(Ok(()), 42);
        let (result, count, on_worker) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result, Ok(()));
        assert_eq!(count, 42);
        assert!(on_worker);

        aio.wait();
        assert_eq!(aio.status(), AioStatus::Completed);
    }

    #[test]
    fn test_finish_sync_runs_inline() {
        let _rt = runtime();
        let (aio, calls) = counting_aio();
        aio.finish_sync(Err(Error::Closed), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(aio.result(), Err(Error::Closed));
    }

    #[test]
    #[should_panic(expected = "finishing an aio that already completed")]
    fn test_double_finish_panics() {
        let _rt = runtime();
        let aio = Aio::without_callback();
        aio.finish(Ok(()), 0);
        aio.finish(Ok(()), 0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_input_out_of_range_panics() {
        let _rt = runtime();
        Aio::without_callback().set_input(MAX_INPUTS, 1u32);
    }

    #[test]
    fn test_inputs_are_typed() {
        let _rt = runtime();
        let aio = Aio::without_callback();
        aio.set_input(0, String::from("dest"));
        assert_eq!(aio.input::<String>(0).as_deref(), Some("dest"));
        assert_eq!(aio.input::<u32>(0), None);
        assert_eq!(aio.input::<String>(1), None);
        aio.clear_input(0);
        assert!(!aio.has_input(0));
    }

    #[test]
    fn test_cancel_queued_finishes_with_canceled() {
        let _rt = runtime();
        let driver = Arc::new(FakeDriver::default());
        let (aio, calls) = counting_aio();

        driver.submit(&aio);
        assert_eq!(aio.status(), AioStatus::Queued);
        aio.cancel();
        aio.wait();

        assert_eq!(aio.result(), Err(Error::Canceled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(driver.first().is_none());

        // Aborting a completed operation changes nothing.
        aio.abort(Error::TimedOut);
        assert_eq!(aio.result(), Err(Error::Canceled));
    }

    #[test]
    fn test_abort_timeout_reason_is_kept() {
        let _rt = runtime();
        let driver = Arc::new(FakeDriver::default());
        let aio = Aio::without_callback();
        driver.submit(&aio);
        aio.abort(Error::TimedOut);
        aio.wait();
        assert_eq!(aio.result(), Err(Error::TimedOut));
    }

    #[test]
    fn test_cancel_races_completion_exactly_once() {
        let _rt = runtime();
        for _ in 0..200 {
            let driver = Arc::new(FakeDriver::default());
            let (aio, calls) = counting_aio();
            driver.submit(&aio);

            let barrier = Arc::new(Barrier::new(2));
            let canceler = {
                let aio = aio.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    aio.cancel();
                })
            };
            barrier.wait();
            let completed = driver.complete_head(7);
            canceler.join().unwrap();
            aio.wait();

            assert_eq!(calls.load(Ordering::SeqCst), 1);
            match aio.result() {
                Ok(()) => {
                    assert!(completed);
                    assert_eq!(aio.count(), 7);
                }
                Err(err) => {
                    assert!(!completed);
                    assert_eq!(err, Error::Canceled);
                    assert_eq!(aio.count(), 0);
                }
            }
        }
    }

    #[test]
    fn test_stop_aborts_and_blocks_restart() {
        let _rt = runtime();
        let driver = Arc::new(FakeDriver::default());
        let (aio, calls) = counting_aio();

        driver.submit(&aio);
        aio.stop();
        assert!(aio.is_stopped());
        assert_eq!(aio.result(), Err(Error::Stopped));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        aio.reset();
        driver.submit(&aio);
        aio.wait();
        assert_eq!(aio.result(), Err(Error::Stopped));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(driver.first().is_none());
    }

    #[test]
    fn test_drop_removes_from_driver_queue() {
        let _rt = runtime();
        let driver = Arc::new(FakeDriver::default());
        let (aio, calls) = counting_aio();
        driver.submit(&aio);
        drop(aio);
        assert!(driver.first().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reuse_after_reset() {
        let _rt = runtime();
        let driver = Arc::new(FakeDriver::default());
        let (aio, calls) = counting_aio();

        for round in 1..=3 {
            aio.reset();
            assert_eq!(aio.status(), AioStatus::Idle);
            assert_eq!(aio.count(), 0);
            driver.submit(&aio);
            aio.mark_in_flight();
            assert_eq!(aio.status(), AioStatus::InFlight);
            assert!(driver.complete_head(round));
            assert_eq!(aio.count(), round);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    #[should_panic(expected = "resetting an aio that is still pending")]
    fn test_reset_while_pending_panics() {
        let _rt = runtime();
        let driver = Arc::new(FakeDriver::default());
        let aio = Aio::without_callback();
        driver.submit(&aio);
        aio.reset();
    }

    #[test]
    fn test_iov_access() {
        let _rt = runtime();
        let aio = Aio::without_callback();
        aio.set_iov(vec![vec![1, 2], vec![3]]);
        assert_eq!(aio.with_iov(|iov| iov.iter().map(Vec::len).sum::<usize>()), 3);
        assert_eq!(aio.take_iov(), vec![vec![1, 2], vec![3]]);
        assert!(aio.take_iov().is_empty());
    }

    #[test]
    fn test_callback_may_restart_operation() {
        let _rt = runtime();
        let driver = Arc::new(FakeDriver::default());
        let rounds = Arc::new(AtomicUsize::new(0));
        let aio = {
            let driver = driver.clone();
            let rounds = rounds.clone();
            Aio::new(move |aio| {
                if rounds.fetch_add(1, Ordering::SeqCst) < 2 {
                    aio.reset();
                    driver.submit(aio);
                }
            })
        };

        driver.submit(&aio);
        while rounds.load(Ordering::SeqCst) < 3 {
            driver.complete_head(1);
            thread::yield_now();
        }
        aio.wait();
        assert_eq!(rounds.load(Ordering::SeqCst), 3);
        assert!(driver.first().is_none());
    }
}
