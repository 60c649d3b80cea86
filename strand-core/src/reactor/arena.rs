//! Fixed-capacity pool of handle records.
//!
//! Slots are preallocated and never grow. Each slot carries a generation that
//! is bumped on release, so a [`HandleId`] kept past its handle's lifetime
//! simply stops resolving.

use super::handle::{HandleId, HandleState};
use crate::error::{Error, Result};
use std::os::unix::io::RawFd;

struct Slot {
    generation: u32,
    state: Option<HandleState>,
}

/// Pool of handle records indexed by [`HandleId`].
pub(crate) struct HandleArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl HandleArena {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                state: None,
            })
            .collect();
        // Lowest index is handed out first.
        let free = (0..capacity as u32).rev().collect();
        Self { slots, free }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Takes a free slot for `fd`.
    ///
    /// # Panics
    ///
    /// If an open handle already owns `fd`.
    pub(crate) fn alloc(&mut self, fd: RawFd) -> Result<HandleId> {
        if let Some(owner) = self.find_fd(fd) {
            panic!("fd {} is already registered as {:?}", fd, owner);
        }
        let index = self.free.pop().ok_or(Error::ResourceExhausted {
            capacity: self.slots.len(),
        })?;
        let slot = &mut self.slots[index as usize];
        slot.state = Some(HandleState::new(fd));
        Ok(HandleId::new(index, slot.generation))
    }

    /// The open handle that owns `fd`, if any.
    pub(crate) fn find_fd(&self, fd: RawFd) -> Option<HandleId> {
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            slot.state
                .as_ref()
                .filter(|state| state.fd == fd)
                .map(|_| HandleId::new(index as u32, slot.generation))
        })
    }

    pub(crate) fn get(&self, id: HandleId) -> Option<&HandleState> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.state.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: HandleId) -> Option<&mut HandleState> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.state.as_mut())
    }

    /// Returns a slot to the pool. The handle must already be closed.
    pub(crate) fn release(&mut self, id: HandleId) {
        let slot = match self.slots.get_mut(id.index()) {
            Some(slot) if slot.generation == id.generation() && slot.state.is_some() => slot,
            _ => panic!("release of unknown handle {:?}", id),
        };
        if let Some(state) = &slot.state {
            assert!(
                state.fd < 0,
                "release of handle {:?} whose fd {} is still open",
                id,
                state.fd
            );
        }
        slot.state = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index() as u32);
    }

    /// Descriptors of every handle that is still open.
    pub(crate) fn open_fds(&self) -> Vec<RawFd> {
        self.slots
            .iter()
            .filter_map(|slot| slot.state.as_ref())
            .filter(|state| state.fd >= 0)
            .map(|state| state.fd)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_until_exhausted() {
        let mut arena = HandleArena::with_capacity(2);
        let a = arena.alloc(10).unwrap();
        let b = arena.alloc(11).unwrap();
        assert_ne!(a, b);
        assert_eq!(arena.live(), 2);

        match arena.alloc(12) {
            Err(Error::ResourceExhausted { capacity }) => assert_eq!(capacity, 2),
            other => panic!("expected exhaustion, got {:?}", other.map(|_| ())),
        }
        // The failed allocation left the existing handles intact.
        assert_eq!(arena.get(a).unwrap().fd, 10);
        assert_eq!(arena.get(b).unwrap().fd, 11);
    }

    #[test]
    fn test_release_recycles_slot_with_new_generation() {
        let mut arena = HandleArena::with_capacity(1);
        let first = arena.alloc(3).unwrap();
        arena.get_mut(first).unwrap().fd = -1;
        arena.release(first);
        assert_eq!(arena.live(), 0);

        let second = arena.alloc(4).unwrap();
        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
        assert!(arena.get(first).is_none());
        assert_eq!(arena.get(second).unwrap().fd, 4);
    }

    #[test]
    #[should_panic(expected = "still open")]
    fn test_release_of_open_handle_panics() {
        let mut arena = HandleArena::with_capacity(1);
        let id = arena.alloc(5).unwrap();
        arena.release(id);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_alloc_of_owned_fd_panics() {
        let mut arena = HandleArena::with_capacity(2);
        arena.alloc(6).unwrap();
        let _ = arena.alloc(6);
    }

    #[test]
    fn test_find_fd_ignores_closed_slots() {
        let mut arena = HandleArena::with_capacity(2);
        let a = arena.alloc(9).unwrap();
        assert_eq!(arena.find_fd(9), Some(a));
        arena.get_mut(a).unwrap().fd = -1;
        assert_eq!(arena.find_fd(9), None);
        // A closed but referenced slot does not block reuse of the number.
        let b = arena.alloc(9).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_open_fds() {
        let mut arena = HandleArena::with_capacity(4);
        let a = arena.alloc(7).unwrap();
        arena.alloc(8).unwrap();
        arena.get_mut(a).unwrap().fd = -1;
        assert_eq!(arena.open_fds(), vec![8]);
    }
}
