//! The single-threaded reactor at the bottom of the stack.
//!
//! Grounded on `EventPoller` in `original_source/ZLToolKit/src/Poller/{EventPoller.h,.cpp}`:
//! one thread owns exactly one `Selector`, a FIFO of cross-thread tasks
//! delivered through a self-pipe [`Waker`], and a due-time-ordered map of
//! repeatable delay tasks. Every mutation of the fd->callback map and every
//! `epoll_ctl`/`kevent` call happens on that one thread; callers on other
//! threads get auto-forwarded through [`EventPoller::async_task`].

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::load::LoadCounter;
use super::selector::{PollEvent, Selector};
use super::task::{DelayTask, PollerControl, Task};
use super::waker::Waker;

/// Registered per fd via [`EventPoller::add_event`].
pub type EventCb = Arc<dyn Fn(PollEvent) + Send + Sync>;
/// Fired once `del_event`/`modify_event` has taken effect.
pub type CompleteCb = Arc<dyn Fn(bool) + Send + Sync>;

thread_local! {
    static CURRENT_POLLER: RefCell<Option<Weak<EventPoller>>> = RefCell::new(None);
}

pub struct EventPoller {
    name: String,
    selector: Selector,
    waker: Waker,
    tasks: Mutex<VecDeque<Task>>,
    delay_tasks: Mutex<BTreeMap<u64, Vec<DelayTask>>>,
    event_map: Mutex<HashMap<RawFd, EventCb>>,
    /// fds deleted earlier in the *current* readiness batch, so a reused fd
    /// number re-added within the same batch doesn't get an event meant for
    /// the socket it replaced. Cleared at the top of every batch.
    expired: Mutex<HashSet<RawFd>>,
    load: LoadCounter,
    thread_id: Mutex<Option<std::thread::ThreadId>>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
    exit_flag: AtomicBool,
    shared_buffer: [Mutex<Option<Weak<dyn Any + Send + Sync>>>; 2],
    cpu_affinity: Mutex<Option<usize>>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl EventPoller {
    pub fn new(name: impl Into<String>) -> io::Result<Arc<EventPoller>> {
        let poller = Arc::new(EventPoller {
            name: name.into(),
            selector: Selector::new()?,
            waker: Waker::new()?,
            tasks: Mutex::new(VecDeque::new()),
            delay_tasks: Mutex::new(BTreeMap::new()),
            event_map: Mutex::new(HashMap::new()),
            expired: Mutex::new(HashSet::new()),
            load: LoadCounter::new(32, 2 * 1_000_000),
            thread_id: Mutex::new(None),
            join_handle: Mutex::new(None),
            exit_flag: AtomicBool::new(false),
            shared_buffer: [Mutex::new(None), Mutex::new(None)],
            cpu_affinity: Mutex::new(None),
        });
        poller.add_event_pipe()?;
        Ok(poller)
    }

    /// Pin the loop thread to `cpu` once `run` spawns it. Must be called
    /// before `run`; has no effect afterwards.
    pub fn set_cpu_affinity(&self, cpu: Option<usize>) {
        *self.cpu_affinity.lock().unwrap() = cpu;
    }

    fn add_event_pipe(self: &Arc<Self>) -> io::Result<()> {
        let weak = Arc::downgrade(self);
        let fd = self.waker.read_fd();
        self.add_event(
            fd,
            PollEvent::READ,
            Arc::new(move |_event| {
                if let Some(this) = weak.upgrade() {
                    this.waker.drain();
                    this.run_posted_tasks();
                }
            }),
        )
    }

    pub fn thread_name(&self) -> &str {
        &self.name
    }

    pub fn load(&self) -> u32 {
        self.load.load()
    }

    /// True when called from this poller's own loop thread (or before the
    /// loop has started, matching `!_loop_thread || ...` in the original).
    pub fn is_current_thread(&self) -> bool {
        match *self.thread_id.lock().unwrap() {
            None => true,
            Some(id) => id == std::thread::current().id(),
        }
    }

    pub fn get_current_poller() -> Option<Arc<EventPoller>> {
        CURRENT_POLLER.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
    }

    /// A per-poller, per-protocol scratch receive buffer, lazily created
    /// and weakly cached so it's freed once every `Socket` using it is
    /// gone. Grounded on `getSharedBuffer`/`SocketRecvBuffer`.
    pub fn get_shared_buffer<T: Default + Send + Sync + 'static>(&self, is_udp: bool) -> Arc<T> {
        let mut slot = self.shared_buffer[is_udp as usize].lock().unwrap();
        if let Some(existing) = slot.as_ref().and_then(Weak::upgrade) {
            if let Ok(typed) = existing.downcast::<T>() {
                return typed;
            }
        }
        let fresh = Arc::new(T::default());
        let erased: Arc<dyn Any + Send + Sync> = fresh.clone();
        *slot = Some(Arc::downgrade(&erased));
        fresh
    }

    /// Register a readiness callback for `fd`. Synchronous on the poller
    /// thread; otherwise forwarded as a posted task, matching `addEvent`.
    pub fn add_event(self: &Arc<Self>, fd: RawFd, event: PollEvent, cb: EventCb) -> io::Result<()> {
        if self.is_current_thread() {
            self.selector.register(fd, event)?;
            self.event_map.lock().unwrap().insert(fd, cb);
            Ok(())
        } else {
            let this = Arc::clone(self);
            self.async_task(move || {
                if let Err(err) = this.add_event(fd, event, cb.clone()) {
                    log::warn!("add_event forwarded across threads failed: {err}");
                }
            });
            Ok(())
        }
    }

    pub fn del_event(self: &Arc<Self>, fd: RawFd, cb: Option<CompleteCb>) -> io::Result<()> {
        if self.is_current_thread() {
            let removed = self.event_map.lock().unwrap().remove(&fd).is_some();
            let ret = if removed {
                self.expired.lock().unwrap().insert(fd);
                self.selector.deregister(fd)
            } else {
                Ok(())
            };
            if let Some(cb) = cb {
                cb(removed && ret.is_ok());
            }
            ret
        } else {
            let this = Arc::clone(self);
            let mut cb = Some(cb);
            self.async_task(move || {
                let cb = cb.take().flatten();
                if let Err(err) = this.del_event(fd, cb) {
                    log::warn!("del_event forwarded across threads failed: {err}");
                }
            });
            Ok(())
        }
    }

    pub fn modify_event(
        self: &Arc<Self>,
        fd: RawFd,
        event: PollEvent,
        cb: Option<CompleteCb>,
    ) -> io::Result<()> {
        if self.is_current_thread() {
            let ret = self.selector.reregister(fd, event);
            if let Some(cb) = cb {
                cb(ret.is_ok());
            }
            ret
        } else {
            let this = Arc::clone(self);
            let mut cb = Some(cb);
            self.async_task(move || {
                let cb = cb.take().flatten();
                if let Err(err) = this.modify_event(fd, event, cb) {
                    log::warn!("modify_event forwarded across threads failed: {err}");
                }
            });
            Ok(())
        }
    }

    /// Run `task` on the poller thread. If already on it and `may_sync` is
    /// true, runs inline; otherwise queues it and wakes the selector.
    pub fn async_task(self: &Arc<Self>, task: impl FnMut() + Send + 'static) -> Task {
        self.async_task_ex(task, true)
    }

    pub fn async_task_ex(self: &Arc<Self>, mut task: impl FnMut() + Send + 'static, may_sync: bool) -> Task {
        self.async_l(move || { task(); PollerControl::Continue }, may_sync, false)
    }

    /// Like [`async_task`](Self::async_task) but jumps the FIFO.
    pub fn async_first(self: &Arc<Self>, mut task: impl FnMut() + Send + 'static) -> Task {
        self.async_l(move || { task(); PollerControl::Continue }, true, true)
    }

    fn async_l(
        self: &Arc<Self>,
        mut task: impl FnMut() -> PollerControl + Send + 'static,
        may_sync: bool,
        first: bool,
    ) -> Task {
        if may_sync && self.is_current_thread() {
            if task() == PollerControl::Exit {
                self.exit_flag.store(true, Ordering::SeqCst);
            }
            let inert = Task::new(|| PollerControl::Continue);
            inert.cancel();
            return inert;
        }

        let handle = Task::new(task);
        let scheduler_copy = handle.clone();
        {
            let mut tasks = self.tasks.lock().unwrap();
            if first {
                tasks.push_front(scheduler_copy);
            } else {
                tasks.push_back(scheduler_copy);
            }
        }
        if let Err(err) = self.waker.wake() {
            log::error!("failed to wake poller {}: {err}", self.name);
        }
        handle
    }

    /// Runs `task` after `delay_ms`. If `task` returns nonzero it is
    /// rescheduled that many milliseconds later; `0` means don't repeat.
    pub fn do_delay_task(self: &Arc<Self>, delay_ms: u64, task: impl FnMut() -> u64 + Send + 'static) -> DelayTask {
        let handle = DelayTask::new(task);
        let due = now_millis() + delay_ms;
        let this = Arc::clone(self);
        let mut scheduled = Some(handle.clone());
        // Posted asynchronously so inserting into the map also refreshes
        // the selector's sleep timeout (it will observe the new minimum
        // on its next iteration), matching `doDelayTask`'s comment.
        self.async_l(
            move || {
                if let Some(task) = scheduled.take() {
                    this.delay_tasks.lock().unwrap().entry(due).or_default().push(task);
                }
                PollerControl::Continue
            },
            true,
            true,
        );
        handle
    }

    fn flush_delay_task(&self, now: u64) -> u64 {
        let expired: Vec<(u64, DelayTask)> = {
            let mut map = self.delay_tasks.lock().unwrap();
            let due: Vec<u64> = map.range(..=now).map(|(k, _)| *k).collect();
            let mut out = Vec::new();
            for key in due {
                if let Some(tasks) = map.remove(&key) {
                    out.extend(tasks.into_iter().map(|t| (key, t)));
                }
            }
            out
        };

        for (_, task) in expired {
            let next_delay = task.call();
            if next_delay > 0 {
                self.delay_tasks
                    .lock()
                    .unwrap()
                    .entry(now + next_delay)
                    .or_default()
                    .push(task);
            }
        }

        match self.delay_tasks.lock().unwrap().keys().next() {
            None => 0,
            Some(&first) => first.saturating_sub(now),
        }
    }

    fn get_min_delay(&self) -> u64 {
        let first = self.delay_tasks.lock().unwrap().keys().next().copied();
        match first {
            None => 0,
            Some(due) => {
                let now = now_millis();
                if due > now {
                    due - now
                } else {
                    self.flush_delay_task(now)
                }
            }
        }
    }

    fn run_posted_tasks(self: &Arc<Self>) {
        let pending: VecDeque<Task> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in pending {
            if task.call() == PollerControl::Exit {
                self.exit_flag.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Starts the reactor. `blocked = true` runs it on the calling thread
    /// (returns once `shutdown` fires); `blocked = false` spawns a named
    /// thread and returns once it has started. `ref_self` mirrors the
    /// original's choice of whether to publish this poller as the thread's
    /// [`get_current_poller`] value.
    pub fn run(self: &Arc<Self>, blocked: bool, ref_self: bool) -> io::Result<()> {
        if blocked {
            Arc::clone(self).run_loop(ref_self, None);
            return Ok(());
        }
        let this = Arc::clone(self);
        let (tx, rx) = sync_channel::<()>(0);
        let handle = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || this.run_loop(ref_self, Some(tx)))?;
        let _ = rx.recv();
        *self.join_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn run_loop(self: Arc<Self>, ref_self: bool, started: Option<std::sync::mpsc::SyncSender<()>>) {
        *self.thread_id.lock().unwrap() = Some(std::thread::current().id());
        if let Some(cpu) = *self.cpu_affinity.lock().unwrap() {
            super::affinity::pin_current_thread(cpu);
        }
        if ref_self {
            CURRENT_POLLER.with(|c| *c.borrow_mut() = Some(Arc::downgrade(&self)));
        }
        self.exit_flag.store(false, Ordering::SeqCst);
        if let Some(tx) = started {
            let _ = tx.send(());
        }

        while !self.exit_flag.load(Ordering::SeqCst) {
            let min_delay = self.get_min_delay();
            let timeout = if min_delay == 0 { None } else { Some(Duration::from_millis(min_delay)) };

            self.load.start_sleep();
            let ready = self.selector.select(timeout);
            self.load.wake_up();

            let ready = match ready {
                Ok(r) => r,
                Err(err) => {
                    log::error!("poller {} selector error: {err}", self.name);
                    continue;
                }
            };
            if ready.is_empty() {
                continue;
            }

            self.expired.lock().unwrap().clear();
            for r in ready {
                if self.expired.lock().unwrap().contains(&r.fd) {
                    continue;
                }
                let cb = self.event_map.lock().unwrap().get(&r.fd).cloned();
                match cb {
                    Some(cb) => cb(r.events),
                    None => {
                        let _ = self.selector.deregister(r.fd);
                    }
                }
            }
        }
    }

    /// Posts the exit sentinel and joins the loop thread (no-op if `run`
    /// was called with `blocked = true` and has already returned, or
    /// hasn't been started).
    pub fn shutdown(self: &Arc<Self>) {
        self.async_l(|| PollerControl::Exit, false, true);
        if let Some(handle) = self.join_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;

    /// Invariant 3: until `del_event` completes, the callback registered for
    /// a fd is the only one ever invoked for it, and nothing fires for it
    /// afterwards.
    #[test]
    fn registered_callback_is_exclusive_until_removed() {
        let poller = EventPoller::new("event-poller-test-invariant-3").unwrap();
        poller.run(false, true).unwrap();

        let (mut local, mut peer) = UnixStream::pair().unwrap();
        let fd = local.as_raw_fd();
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        poller
            .add_event(
                fd,
                PollEvent::READ,
                Arc::new(move |_ev| {
                    counted.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        peer.write_all(b"x").unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert!(hits.load(Ordering::SeqCst) >= 1);

        let mut scratch = [0u8; 1];
        let _ = local.read(&mut scratch);
        poller.del_event(fd, None).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let before = hits.load(Ordering::SeqCst);
        peer.write_all(b"y").unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(hits.load(Ordering::SeqCst), before);
    }

    /// Invariant 4: tasks posted from the same thread, in submission order,
    /// run on the poller in that same order.
    #[test]
    fn async_tasks_from_one_thread_run_in_submission_order() {
        let poller = EventPoller::new("event-poller-test-invariant-4").unwrap();
        poller.run(false, true).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            poller.async_task(move || order.lock().unwrap().push(i));
        }

        let (tx, rx) = std::sync::mpsc::channel();
        poller.async_task(move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(1)).unwrap();

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
