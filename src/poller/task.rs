//! Cancelable task handles.
//!
//! Grounded on `TaskCancelableImp` in `ZLToolKit/src/Thread/TaskExecutor.h`.
//! The original hands out `shared_ptr<TaskCancelableImp>` to both the
//! caller and the scheduler (task FIFO or delay-task map); calling
//! `cancel()` through *either* clone flips the object's own internal
//! strong/weak pair, disabling every clone's `operator()`. The natural Rust
//! shape for "one shared object, several owners, cancel from any of them"
//! is an `Arc` around a `Mutex<Option<closure>>`: cancelling clears the
//! slot, `call()` becomes a no-op once it's gone, and the task itself is
//! freed once every clone (caller's handle plus the scheduler's copy) is
//! dropped.

use std::sync::{Arc, Mutex};

type BoxedFn<R> = Box<dyn FnMut() -> R + Send>;

struct Inner<R> {
    f: Mutex<Option<BoxedFn<R>>>,
}

/// A queued closure, shared between whoever holds a clone. `R` is the
/// closure's return type: `PollerControl` for one-shot tasks, `u64` (next
/// delay in ms, or `0` to stop repeating) for delay tasks.
pub struct CancelableTask<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for CancelableTask<R> {
    fn clone(&self) -> Self {
        CancelableTask {
            inner: self.inner.clone(),
        }
    }
}

impl<R: Default> CancelableTask<R> {
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut() -> R + Send + 'static,
    {
        CancelableTask {
            inner: Arc::new(Inner {
                f: Mutex::new(Some(Box::new(f))),
            }),
        }
    }

    /// Disables every clone of this task. Idempotent.
    pub fn cancel(&self) {
        *self.inner.f.lock().unwrap() = None;
    }

    /// Runs the task if it hasn't been cancelled, else returns
    /// `R::default()` — mirrors `TaskCancelableImp::operator()` falling
    /// back to `defaultValue<R>()` once its weak reference can't upgrade.
    pub fn call(&self) -> R {
        match self.inner.f.lock().unwrap().as_mut() {
            Some(f) => f(),
            None => R::default(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.inner.f.lock().unwrap().is_some()
    }
}

/// Rust-native replacement for the original's `ExitException`: thrown as a
/// C++ exception from inside the task closure run by `onPipeEvent` to break
/// out of `runLoop`. A panic-based equivalent would work but is the wrong
/// tool for ordinary control flow, so every queued task instead returns this
/// sentinel and `EventPoller::run` checks it after each one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerControl {
    Continue,
    Exit,
}

impl Default for PollerControl {
    fn default() -> Self {
        PollerControl::Continue
    }
}

/// The one-shot `async`/`async_first` task.
pub type Task = CancelableTask<PollerControl>;

/// A repeating delay task: returns `0` to stop, or the next delay in ms.
pub type DelayTask = CancelableTask<u64>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cancel_through_one_clone_disables_the_other() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let task = Task::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            PollerControl::Continue
        });
        let scheduler_copy = task.clone();
        task.call();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        task.cancel();
        scheduler_copy.call();
        assert_eq!(calls.load(Ordering::SeqCst), 1, "cancelled task must not run via any clone");
    }

    #[test]
    fn call_after_cancel_returns_default() {
        let task = DelayTask::new(|| 5);
        task.cancel();
        assert_eq!(task.call(), 0);
    }
}
