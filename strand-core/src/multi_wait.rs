//! Waiting on several handles at once.
//!
//! Members are split between a pending list and a FIFO ready queue. While a
//! handle is a member the set holds a reference on it and owns its callback
//! slot, so the owning transport must not wait on it directly until it is
//! popped or removed.

use crate::error::{Error, Result};
use crate::reactor::{HandleId, Interest, Reactor};
use crate::sched::{ArmedTimer, Timeout};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::future::poll_fn;
use std::rc::{Rc, Weak};
use std::task::{Poll, Waker};
use tracing::trace;

#[derive(Default)]
struct SetState {
    pending: Vec<HandleId>,
    ready: VecDeque<HandleId>,
    interests: HashMap<HandleId, Interest>,
    waiter: Option<Waker>,
}

impl SetState {
    fn mark_ready(&mut self, id: HandleId) {
        if let Some(pos) = self.pending.iter().position(|p| *p == id) {
            self.pending.remove(pos);
            self.ready.push_back(id);
            if let Some(waker) = self.waiter.take() {
                waker.wake();
            }
        }
    }
}

/// A set of handles a single fiber can wait on.
pub struct MultiWait {
    reactor: Reactor,
    state: Rc<RefCell<SetState>>,
}

impl MultiWait {
    /// An empty set on `reactor`.
    pub fn new(reactor: &Reactor) -> Self {
        Self {
            reactor: reactor.clone(),
            state: Rc::new(RefCell::new(SetState::default())),
        }
    }

    /// Adds a handle. If it already reports `interest` it goes straight to
    /// the ready queue.
    ///
    /// # Panics
    ///
    /// If the handle is already a member, or a fiber is parked on it.
    pub fn add(&self, id: HandleId, interest: Interest) -> Result<()> {
        if self.reactor.fd(id).is_none() {
            return Err(Error::Closed);
        }
        let mut state = self.state.borrow_mut();
        assert!(
            !state.interests.contains_key(&id),
            "{:?} is already in the set",
            id
        );

        let weak: Weak<RefCell<SetState>> = Rc::downgrade(&self.state);
        self.reactor.set_callback(
            id,
            Rc::new(move |reactor: &Reactor, id: HandleId| {
                let Some(state) = weak.upgrade() else {
                    return;
                };
                if reactor.events(id).intersects(interest.mask()) {
                    state.borrow_mut().mark_ready(id);
                }
            }),
        );
        self.reactor.retain(id);
        state.interests.insert(id, interest);
        state.pending.push(id);

        if self.reactor.events(id).intersects(interest.mask()) {
            state.mark_ready(id);
        }
        trace!("{:?} joined multi-wait set", id);
        Ok(())
    }

    /// Removes a handle from whichever list holds it. Returns false if it
    /// was not a member.
    pub fn remove(&self, id: HandleId) -> bool {
        let mut state = self.state.borrow_mut();
        if state.interests.remove(&id).is_none() {
            return false;
        }
        state.pending.retain(|p| *p != id);
        state.ready.retain(|r| *r != id);
        drop(state);

        self.reactor.clear_callback(id);
        self.reactor.release_ref(id);
        true
    }

    /// Waits until a member is ready and hands it back, detached from the
    /// set, in the order members became ready.
    pub async fn pop(&self, timeout: Timeout) -> Result<HandleId> {
        let mut timer = ArmedTimer::new(self.reactor.scheduler().as_ref());
        let id = poll_fn(|cx| {
            let mut state = self.state.borrow_mut();
            if let Some(id) = state.ready.pop_front() {
                state.interests.remove(&id);
                state.waiter = None;
                return Poll::Ready(Ok(id));
            }
            if timeout.expired() {
                state.waiter = None;
                return Poll::Ready(Err(Error::TimedOut));
            }
            state.waiter = Some(cx.waker().clone());
            drop(state);
            if let Some(deadline) = timeout.deadline() {
                timer.arm(deadline, cx.waker());
            }
            Poll::Pending
        })
        .await?;
        drop(timer);

        self.reactor.clear_callback(id);
        self.reactor.release_ref(id);
        Ok(id)
    }

    /// Whether `id` is pending or queued in this set.
    pub fn contains(&self, id: HandleId) -> bool {
        self.state.borrow().interests.contains_key(&id)
    }

    /// Members not yet ready.
    pub fn pending_len(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// Members queued for `pop`.
    pub fn ready_len(&self) -> usize {
        self.state.borrow().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().interests.is_empty()
    }
}

impl Drop for MultiWait {
    fn drop(&mut self) {
        let members: Vec<HandleId> = self.state.borrow().interests.keys().copied().collect();
        for id in members {
            self.remove(id);
        }
    }
}
