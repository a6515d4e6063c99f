use std::{
    collections::VecDeque,
    os::fd::{AsFd, AsRawFd, RawFd},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
};

use io_uring::{opcode, squeue, types, IoUring};
use nix::{
    libc,
    sys::eventfd::{EfdFlags, EventFd},
};
use slab::Slab;
use tracing::{debug, error, trace, warn};

use super::{
    cancel::{Cancel, CANCEL_USER_DATA},
    Completion, IoId, IoToken,
};
use crate::{error::from_cqe_result, Error, Result};

/// User data reserved for the dispatcher's own wakeup read.
const WAKE_USER_DATA: u64 = u64::MAX;

/// Registration tokens must leave the reserved user data values unreachable.
const MAX_TOKEN: usize = u32::MAX as usize - 1;

struct Registration {
    fd: RawFd,
    completion: Arc<dyn Completion>,
}

struct Shared {
    backlog: Mutex<VecDeque<squeue::Entry>>,
    registry: Mutex<Slab<Registration>>,
    wake: EventFd,
    running: AtomicBool,
    seq: AtomicU32,
}

/// The [Dispatcher] is the proactor at the bottom of the crate. It owns an [IoUring] instance
/// which lives entirely on a dedicated dispatcher thread, the thread pushes submissions into the
/// ring, waits for completions, and hands each completion to the [Completion] registered for it.
///
/// Any thread may submit. Submissions are queued on a backlog and the dispatcher is woken through
/// an `eventfd` which it always keeps a read armed against, so a submission never waits for an
/// unrelated completion to arrive first.
///
/// Completions are delivered on the dispatcher thread, outside of any dispatcher lock, and in the
/// order the kernel reports them.
pub struct Dispatcher {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Create a new [Dispatcher] with a ring of `entries` submission slots, and start its thread.
    pub(crate) fn new(entries: u32, name: String) -> Result<Dispatcher> {
        let ring = IoUring::builder().build(entries)?;
        let wake = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC)?;

        let shared = Arc::new(Shared {
            backlog: Mutex::new(VecDeque::with_capacity(1024)),
            registry: Mutex::new(Slab::with_capacity(1024)),
            wake,
            running: AtomicBool::new(true),
            seq: AtomicU32::new(0),
        });

        let thread = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(name)
                .spawn(move || shared.run(ring))?
        };
        debug!(entries, "completion dispatcher started");

        Ok(Dispatcher {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Register `completion` to be invoked for every submission made under the returned token.
    /// The `fd` is only kept for diagnostics.
    pub fn register(&self, fd: RawFd, completion: Arc<dyn Completion>) -> Result<IoToken> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let mut registry = self.shared.lock_registry();
        if registry.vacant_key() >= MAX_TOKEN {
            return Err(Error::NoMemory);
        }
        let token = registry.insert(Registration { fd, completion });
        trace!(token, fd, "registered with dispatcher");
        Ok(IoToken(token))
    }

    /// Drop the registration for `token`, any completion still arriving for it is discarded.
    pub fn deregister(&self, token: IoToken) {
        if let Some(reg) = self.shared.lock_registry().try_remove(token.0) {
            trace!(token = token.0, fd = reg.fd, "deregistered from dispatcher");
        }
    }

    /// Submit a native operation on behalf of `token`. The returned [IoId] is what the
    /// registration's [Completion] will later be called with, and what [Dispatcher::cancel]
    /// takes.
    ///
    /// # Safety
    ///
    /// Every buffer, header, or address `entry` references must stay valid, and must not move,
    /// until the completion for the returned [IoId] has been delivered.
    pub unsafe fn submit(&self, token: IoToken, entry: squeue::Entry) -> Result<IoId> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let id = IoId::new(token, self.shared.seq.fetch_add(1, Ordering::Relaxed));
        self.shared
            .lock_backlog()
            .push_back(entry.user_data(id.user_data()));
        self.shared.wake();
        trace!(?id, "submitted");
        Ok(id)
    }

    /// Request cancellation of the outstanding submission `id`. This is best effort, the
    /// submission may have already completed, but if it has not it will complete shortly with
    /// [Error::Canceled].
    pub fn cancel(&self, id: IoId) -> Result<()> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        self.shared
            .lock_backlog()
            .push_back(Cancel::new(id).as_entry());
        self.shared.wake();
        trace!(?id, "cancel requested");
        Ok(())
    }

    /// Stop the dispatcher thread and wait for it to exit. Submissions made afterwards fail with
    /// [Error::Closed].
    pub fn shutdown(&self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            self.shared.wake();
        }
        let handle = self
            .thread
            .lock()
            .expect("failed to lock dispatcher thread handle: poisoned")
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn lock_backlog(&self) -> MutexGuard<'_, VecDeque<squeue::Entry>> {
        self.backlog
            .lock()
            .expect("failed to lock dispatcher backlog: poisoned")
    }

    fn lock_registry(&self) -> MutexGuard<'_, Slab<Registration>> {
        self.registry
            .lock()
            .expect("failed to lock dispatcher registry: poisoned")
    }

    fn wake(&self) {
        if let Err(err) = self.wake.write(1) {
            warn!(%err, "failed to wake dispatcher");
        }
    }

    /// Move as much of the backlog into the submission queue as fits, submitting whenever the
    /// queue fills. A busy ring leaves the remainder queued until completions are reaped.
    fn flush(&self, ring: &mut IoUring) -> Result<()> {
        let mut backlog = self.lock_backlog();
        while let Some(entry) = backlog.pop_front() {
            // SAFETY: Submitters guarantee the memory behind every entry outlives its completion.
            if unsafe { ring.submission().push(&entry) }.is_ok() {
                continue;
            }
            backlog.push_front(entry);
            match ring.submit() {
                Ok(_) => {}
                Err(ref err) if err.raw_os_error() == Some(libc::EBUSY) => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn deliver(&self, id: IoId, ret: i32) {
        let completion = self
            .lock_registry()
            .get(id.token().0)
            .map(|reg| reg.completion.clone());

        match completion {
            Some(completion) => {
                trace!(?id, ret, "completed");
                completion.complete(id, from_cqe_result(ret));
            }
            None => warn!(?id, ret, "dropping completion for unregistered token"),
        }
    }

    /// The dispatcher loop, this runs until shutdown is requested or the ring fails.
    ///
    /// Generally the flow is this:
    /// - Re-arm the wakeup read if it fired.
    /// - Flush the backlog into the ring and wait for at least one completion.
    /// - Deliver all available completions to their registrations.
    fn run(&self, mut ring: IoUring) {
        let mut wake_buf = Box::new([0u8; 8]);
        let mut wake_armed = false;

        while self.running.load(Ordering::Acquire) {
            if !wake_armed {
                let entry = opcode::Read::new(
                    types::Fd(self.wake.as_fd().as_raw_fd()),
                    wake_buf.as_mut_ptr(),
                    wake_buf.len() as u32,
                )
                .build()
                .user_data(WAKE_USER_DATA);
                self.lock_backlog().push_front(entry);
                wake_armed = true;
            }

            if let Err(err) = self.flush(&mut ring) {
                error!(%err, "failed to flush submissions, dispatcher exiting");
                break;
            }

            match ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(err) => match err.raw_os_error() {
                    Some(libc::EINTR) | Some(libc::EBUSY) => {}
                    _ => {
                        error!(%err, "failed to wait for completions, dispatcher exiting");
                        break;
                    }
                },
            }

            let completed: Vec<(u64, i32)> = ring
                .completion()
                .map(|cqe| (cqe.user_data(), cqe.result()))
                .collect();

            for (user_data, ret) in completed {
                match user_data {
                    WAKE_USER_DATA => wake_armed = false,
                    CANCEL_USER_DATA => trace!(ret, "cancellation processed"),
                    user_data => self.deliver(IoId(user_data), ret),
                }
            }
        }

        // Tearing down the ring cancels whatever is still in flight, it has to go before the
        // wakeup buffer does, and before anyone can observe the dispatcher as stopped.
        drop(ring);
        drop(wake_buf);
        self.running.store(false, Ordering::Release);

        let remaining = self.lock_registry().len();
        if remaining > 0 {
            warn!(remaining, "dispatcher stopped with live registrations");
        }
        debug!("completion dispatcher stopped");
    }
}
