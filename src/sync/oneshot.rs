use std::{
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll, Waker},
};

#[derive(Debug)]
enum State<T> {
    Pending(Option<Waker>),
    Complete(T),
    Finalized,
}

/// A single value slot bridging a completion callback and the task polling for its result. The
/// callback side calls [OneShot::complete], the task side polls with [OneShot::poll] and is woken
/// once the value lands.
#[derive(Debug)]
pub(crate) struct OneShot<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> OneShot<T> {
    pub(crate) fn new() -> OneShot<T> {
        OneShot {
            state: Arc::new(Mutex::new(State::Pending(None))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state
            .lock()
            .expect("failed to lock oneshot: poisoned")
    }

    /// Store the value and wake the task waiting on it, if any.
    ///
    /// # Panics
    ///
    /// Panics if a value has already been stored.
    pub(crate) fn complete(&self, val: T) {
        let waker = {
            let mut state = self.lock();
            match std::mem::replace(&mut *state, State::Complete(val)) {
                State::Pending(waker) => waker,
                State::Complete(..) | State::Finalized => {
                    panic!("invalid state can not call complete more than once.")
                }
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Take the value if it has landed, otherwise register the task's waker.
    pub(crate) fn poll(&self, cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, State::Finalized) {
            State::Pending(_) => {
                *state = State::Pending(Some(cx.waker().clone()));
                Poll::Pending
            }
            State::Complete(val) => Poll::Ready(val),
            State::Finalized => panic!("oneshot polled after its value was taken"),
        }
    }
}

impl<T> Clone for OneShot<T> {
    fn clone(&self) -> Self {
        OneShot {
            state: self.state.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::task::noop_waker;

    use super::*;

    #[test]
    fn test_poll_before_and_after_complete() {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let slot = OneShot::new();
        assert!(slot.poll(&mut cx).is_pending());

        slot.clone().complete(5u32);
        assert_eq!(slot.poll(&mut cx), Poll::Ready(5));
    }

    #[test]
    #[should_panic(expected = "more than once")]
    fn test_double_complete_panics() {
        let slot = OneShot::new();
        slot.complete(());
        slot.complete(());
    }
}
