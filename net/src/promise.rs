//! Completion tokens for writes and other channel operations.

use crate::error::NetError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Terminal state of a [`Promise`].
#[derive(Debug, Clone)]
pub enum Outcome {
    Success,
    Failed(Arc<NetError>),
    Cancelled,
}

impl Outcome {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }
}

type CompletionListener = Box<dyn FnOnce(&Outcome) + Send>;
type ProgressListener = Box<dyn FnMut(u64, u64) + Send>;

enum State {
    Pending {
        uncancellable: bool,
        on_complete: Vec<CompletionListener>,
        on_progress: Vec<ProgressListener>,
    },
    Done(Outcome),
}

/// A completion token notified at most once, in happened-before order with
/// the operation it tracks.
///
/// Cancellation only succeeds while the promise is both pending and
/// cancellable; once the write queue promotes an entry for transmission it
/// calls [`set_uncancellable`](Self::set_uncancellable) and later
/// cancellation attempts are ignored.
#[derive(Clone)]
pub struct Promise {
    inner: Arc<Mutex<State>>,
}

impl Promise {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(State::Pending {
                uncancellable: false,
                on_complete: Vec::new(),
                on_progress: Vec::new(),
            })),
        }
    }

    /// Run `f` when the promise completes. Runs immediately if it already
    /// has.
    pub fn on_complete(&self, f: impl FnOnce(&Outcome) + Send + 'static) {
        let mut state = self.inner.lock();
        match &mut *state {
            State::Pending { on_complete, .. } => on_complete.push(Box::new(f)),
            State::Done(outcome) => {
                let outcome = outcome.clone();
                drop(state);
                f(&outcome);
            }
        }
    }

    /// Observe `(progress, total)` notifications while the write drains.
    pub fn on_progress(&self, f: impl FnMut(u64, u64) + Send + 'static) {
        if let State::Pending { on_progress, .. } = &mut *self.inner.lock() {
            on_progress.push(Box::new(f));
        }
    }

    pub fn try_success(&self) -> bool {
        self.complete(Outcome::Success)
    }

    pub fn try_failure(&self, error: Arc<NetError>) -> bool {
        self.complete(Outcome::Failed(error))
    }

    /// Cancel if still pending and cancellable.
    pub fn cancel(&self) -> bool {
        {
            let state = self.inner.lock();
            if let State::Pending { uncancellable, .. } = &*state {
                if *uncancellable {
                    return false;
                }
            } else {
                return false;
            }
        }
        self.complete(Outcome::Cancelled)
    }

    /// Disable cancellation. Returns `false` if the promise was already
    /// cancelled (or otherwise completed), in which case the caller must
    /// not transmit.
    pub fn set_uncancellable(&self) -> bool {
        match &mut *self.inner.lock() {
            State::Pending { uncancellable, .. } => {
                *uncancellable = true;
                true
            }
            State::Done(outcome) => !outcome.is_cancelled(),
        }
    }

    pub fn notify_progress(&self, progress: u64, total: u64) {
        // Listeners are invoked outside the lock; swap them out and back.
        let mut listeners = {
            match &mut *self.inner.lock() {
                State::Pending { on_progress, .. } => std::mem::take(on_progress),
                State::Done(_) => return,
            }
        };
        for l in &mut listeners {
            l(progress, total);
        }
        if let State::Pending { on_progress, .. } = &mut *self.inner.lock() {
            let mut merged = listeners;
            merged.append(on_progress);
            *on_progress = merged;
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(&*self.inner.lock(), State::Done(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(&*self.inner.lock(), State::Done(o) if o.is_cancelled())
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match &*self.inner.lock() {
            State::Done(o) => Some(o.clone()),
            State::Pending { .. } => None,
        }
    }

    /// Block until completion or the deadline. Test and shutdown helper;
    /// never call from the event-loop thread.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(o) = self.outcome() {
                return Some(o);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn complete(&self, outcome: Outcome) -> bool {
        let listeners = {
            let mut state = self.inner.lock();
            match &mut *state {
                State::Pending { on_complete, .. } => {
                    let listeners = std::mem::take(on_complete);
                    *state = State::Done(outcome.clone());
                    listeners
                }
                State::Done(_) => return false,
            }
        };
        for l in listeners {
            l(&outcome);
        }
        true
    }
}

impl Default for Promise {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_completes_exactly_once() {
        let p = Promise::new();
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        p.on_complete(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert!(p.try_success());
        assert!(!p.try_success());
        assert!(!p.try_failure(Arc::new(NetError::ClosedChannel)));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(p.outcome().unwrap().is_success());
    }

    #[test]
    fn test_late_listener_fires_immediately() {
        let p = Promise::new();
        p.try_success();

        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        p.on_complete(move |o| {
            assert!(o.is_success());
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_before_uncancellable() {
        let p = Promise::new();
        assert!(p.cancel());
        assert!(p.is_cancelled());
        // Promotion after cancellation reports the entry unusable.
        assert!(!p.set_uncancellable());
    }

    #[test]
    fn test_cancel_after_uncancellable_is_ignored() {
        let p = Promise::new();
        assert!(p.set_uncancellable());
        assert!(!p.cancel());
        assert!(!p.is_done());
        assert!(p.try_success());
    }

    #[test]
    fn test_progress_notifications() {
        let p = Promise::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        p.on_progress(move |progress, total| {
            s.lock().push((progress, total));
        });

        p.notify_progress(5, 10);
        p.notify_progress(10, 10);
        p.try_success();
        p.notify_progress(11, 10);

        assert_eq!(&*seen.lock(), &[(5, 10), (10, 10)]);
    }
}
