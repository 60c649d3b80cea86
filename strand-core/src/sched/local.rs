//! Single-threaded cooperative scheduler.
//!
//! Runs fibers to completion on the calling thread. Wakers push task ids onto
//! a shared ready queue; everything else (task slots, timers, pollers) lives
//! behind `RefCell`s because only the driving thread touches it.

use super::{FiberScheduler, Poller, TimerId};
use futures::future::LocalBoxFuture;
use futures::task::{waker, ArcWake};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::pin;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// Task id reserved for the future passed to [`LocalScheduler::block_on`].
const MAIN_TASK: usize = usize::MAX;

/// Configuration for the bundled scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on a single idle wait, so wakers fired from other
    /// threads are noticed even without a registered idle poller.
    pub max_idle_wait: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_idle_wait: Duration::from_millis(10),
        }
    }
}

/// Ready queue shared with wakers, which may be cloned onto other threads.
#[derive(Default)]
struct ReadyQueue {
    ids: Mutex<VecDeque<usize>>,
}

impl ReadyQueue {
    fn push(&self, id: usize) {
        if let Ok(mut ids) = self.ids.lock() {
            ids.push_back(id);
        }
    }

    fn pop(&self) -> Option<usize> {
        self.ids.lock().ok().and_then(|mut ids| ids.pop_front())
    }

    fn is_empty(&self) -> bool {
        self.ids.lock().map(|ids| ids.is_empty()).unwrap_or(true)
    }
}

struct TaskWaker {
    id: usize,
    queue: Arc<ReadyQueue>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.queue.push(arc_self.id);
    }
}

struct PeriodicPoller {
    poller: Poller,
    interval: Duration,
    next_due: Instant,
}

struct Inner {
    config: SchedulerConfig,
    queue: Arc<ReadyQueue>,
    tasks: RefCell<Vec<Option<LocalBoxFuture<'static, ()>>>>,
    free: RefCell<Vec<usize>>,
    /// Keyed by deadline first, so the earliest timer is the first entry.
    timers: RefCell<BTreeMap<TimerId, Waker>>,
    timer_seq: Cell<u64>,
    periodic: RefCell<Vec<PeriodicPoller>>,
    idle: RefCell<Option<Poller>>,
}

/// A cooperative scheduler that drives fibers on the current thread.
///
/// Cloning yields another reference to the same scheduler.
#[derive(Clone)]
pub struct LocalScheduler {
    inner: Rc<Inner>,
}

impl Default for LocalScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl LocalScheduler {
    /// Creates an empty scheduler.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Rc::new(Inner {
                config,
                queue: Arc::new(ReadyQueue::default()),
                tasks: RefCell::new(Vec::new()),
                free: RefCell::new(Vec::new()),
                timers: RefCell::new(BTreeMap::new()),
                timer_seq: Cell::new(0),
                periodic: RefCell::new(Vec::new()),
                idle: RefCell::new(None),
            }),
        }
    }

    /// Spawns a fiber.
    pub fn spawn<F>(&self, fiber: F)
    where
        F: Future<Output = ()> + 'static,
    {
        FiberScheduler::spawn(self, Box::pin(fiber));
    }

    /// Number of spawned fibers that have not finished yet.
    pub fn live_fibers(&self) -> usize {
        self.inner.tasks.borrow().iter().filter(|t| t.is_some()).count()
    }

    /// Timers armed with `wake_at` that have neither fired nor been
    /// cancelled.
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.borrow().len()
    }

    /// Runs fibers until `main` completes and returns its output.
    ///
    /// Other fibers that are still suspended when `main` finishes stay
    /// parked and resume on the next call.
    pub fn block_on<F: Future>(&self, main: F) -> F::Output {
        let mut main = pin!(main);
        let main_waker = waker(Arc::new(TaskWaker {
            id: MAIN_TASK,
            queue: self.inner.queue.clone(),
        }));
        self.inner.queue.push(MAIN_TASK);

        loop {
            while let Some(id) = self.inner.queue.pop() {
                if id == MAIN_TASK {
                    let mut cx = Context::from_waker(&main_waker);
                    if let Poll::Ready(output) = main.as_mut().poll(&mut cx) {
                        return output;
                    }
                } else {
                    self.run_task(id);
                }
            }

            let now = Instant::now();
            self.fire_timers(now);
            self.run_periodic(now);
            if !self.inner.queue.is_empty() {
                continue;
            }

            let budget = self.idle_budget(Instant::now());
            let idle = self.inner.idle.borrow_mut().take();
            match idle {
                Some(mut poller) => {
                    poller(budget);
                    let mut slot = self.inner.idle.borrow_mut();
                    if slot.is_none() {
                        *slot = Some(poller);
                    }
                }
                None if !budget.is_zero() => std::thread::sleep(budget),
                None => {}
            }
            self.fire_timers(Instant::now());
        }
    }

    fn run_task(&self, id: usize) {
        // The future is taken out of its slot so it can spawn while polled.
        let task = match self.inner.tasks.borrow_mut().get_mut(id) {
            Some(slot) => slot.take(),
            None => None,
        };
        let Some(mut task) = task else {
            return;
        };

        let task_waker = waker(Arc::new(TaskWaker {
            id,
            queue: self.inner.queue.clone(),
        }));
        let mut cx = Context::from_waker(&task_waker);
        match task.as_mut().poll(&mut cx) {
            Poll::Ready(()) => self.inner.free.borrow_mut().push(id),
            Poll::Pending => self.inner.tasks.borrow_mut()[id] = Some(task),
        }
    }

    fn fire_timers(&self, now: Instant) {
        let mut due = Vec::new();
        {
            let mut timers = self.inner.timers.borrow_mut();
            while timers
                .first_key_value()
                .is_some_and(|(timer, _)| timer.deadline() <= now)
            {
                if let Some((_, waker)) = timers.pop_first() {
                    due.push(waker);
                }
            }
        }
        for waker in due {
            waker.wake();
        }
    }

    fn run_periodic(&self, now: Instant) {
        let mut pollers = std::mem::take(&mut *self.inner.periodic.borrow_mut());
        for entry in pollers.iter_mut() {
            if entry.next_due <= now {
                (entry.poller)(Duration::ZERO);
                entry.next_due = now + entry.interval;
            }
        }
        // Pollers registered while running are appended after the old ones.
        let mut slot = self.inner.periodic.borrow_mut();
        pollers.append(&mut slot);
        *slot = pollers;
    }

    fn idle_budget(&self, now: Instant) -> Duration {
        let mut budget = self.inner.config.max_idle_wait;
        if let Some((timer, _)) = self.inner.timers.borrow().first_key_value() {
            budget = budget.min(timer.deadline().saturating_duration_since(now));
        }
        for entry in self.inner.periodic.borrow().iter() {
            budget = budget.min(entry.next_due.saturating_duration_since(now));
        }
        budget
    }
}

impl FiberScheduler for LocalScheduler {
    fn spawn(&self, fiber: LocalBoxFuture<'static, ()>) {
        let id = match self.inner.free.borrow_mut().pop() {
            Some(id) => {
                self.inner.tasks.borrow_mut()[id] = Some(fiber);
                id
            }
            None => {
                let mut tasks = self.inner.tasks.borrow_mut();
                tasks.push(Some(fiber));
                tasks.len() - 1
            }
        };
        self.inner.queue.push(id);
    }

    fn wake_at(&self, deadline: Instant, waker: Waker) -> TimerId {
        let seq = self.inner.timer_seq.get();
        self.inner.timer_seq.set(seq.wrapping_add(1));
        let timer = TimerId::new(deadline, seq);
        self.inner.timers.borrow_mut().insert(timer, waker);
        timer
    }

    fn cancel_wake(&self, timer: TimerId) {
        self.inner.timers.borrow_mut().remove(&timer);
    }

    fn register_poller(&self, poller: Poller, interval: Duration, idle_fallback: bool) {
        if idle_fallback {
            *self.inner.idle.borrow_mut() = Some(poller);
        } else {
            self.inner.periodic.borrow_mut().push(PeriodicPoller {
                poller,
                interval,
                next_due: Instant::now(),
            });
        }
    }
}
