// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Exclusive access to the secondary image slot.
//!
//! Several transports may want to write an update into the same flash slot:
//! the configuration channel, an MCU manager transport, and so on. Only one of
//! them may touch the slot at a time, and whoever comes back after someone
//! else had it needs to know that the slot contents are no longer what it
//! left behind.
//!
//! A [`FlashLock`] is a single owner slot. Transports identify themselves
//! with a static [`LockOwner`]; [`FlashLock::claim`] succeeds if the lock is
//! free or already theirs, and [`FlashLock::release`] gives it up. When the
//! lock is claimed by someone other than its previous holder, the previous
//! holder's [`OwnershipObserver`] hears about it.
//!
//! Claims and releases come from different execution contexts (request
//! handlers, timers), so the owner fields sit behind a spin lock. Observers
//! are called after that lock is dropped, which means an observer may itself
//! look at the lock without deadlocking.

#![cfg_attr(not(test), no_std)]

use ringbuf::{ringbuf, ringbuf_entry};

/// Told when the flash slot has been claimed by a different owner.
pub trait OwnershipObserver: Sync {
    fn on_owner_changed(&self, new_owner: &LockOwner);
}

/// A named party that may hold the [`FlashLock`].
///
/// Owners are compared by name, so each transport needs a distinct one.
#[derive(Copy, Clone)]
pub struct LockOwner {
    name: &'static str,
    observer: Option<&'static dyn OwnershipObserver>,
}

impl LockOwner {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            observer: None,
        }
    }

    pub const fn with_observer(
        name: &'static str,
        observer: &'static dyn OwnershipObserver,
    ) -> Self {
        Self {
            name,
            observer: Some(observer),
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for LockOwner {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for LockOwner {}

impl core::fmt::Debug for LockOwner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("LockOwner").field(&self.name).finish()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LockError {
    /// Someone else holds the lock.
    Busy = 1,
    /// Release attempted by a party that doesn't hold the lock.
    NotOwner = 2,
}

#[derive(Copy, Clone, Debug, Default)]
struct LockState {
    current: Option<LockOwner>,
    previous: Option<LockOwner>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Claimed(&'static str),
    Busy {
        requested: &'static str,
        holder: &'static str,
    },
    Released(&'static str),
    NotOwner(&'static str),
    Displaced {
        previous: &'static str,
        new: &'static str,
    },
}

ringbuf!(Trace, 16, Trace::None);

pub struct FlashLock {
    state: spin::Mutex<LockState>,
}

impl Default for FlashLock {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashLock {
    pub const fn new() -> Self {
        Self {
            state: spin::Mutex::new(LockState {
                current: None,
                previous: None,
            }),
        }
    }

    /// Takes the lock for `owner`.
    ///
    /// Claiming a lock you already hold is a no-op. Claiming a free lock whose
    /// previous holder was somebody else notifies that previous holder. If a
    /// different owner holds the lock, this fails with [`LockError::Busy`].
    pub fn claim(&self, owner: &LockOwner) -> Result<(), LockError> {
        let displaced = {
            let mut state = self.state.lock();
            match state.current {
                Some(current) if current == *owner => return Ok(()),
                Some(current) => {
                    ringbuf_entry!(Trace::Busy {
                        requested: owner.name,
                        holder: current.name,
                    });
                    return Err(LockError::Busy);
                }
                None => (),
            }

            state.current = Some(*owner);
            ringbuf_entry!(Trace::Claimed(owner.name));
            state.previous.filter(|prev| prev != owner)
        };

        if let Some(prev) = displaced {
            ringbuf_entry!(Trace::Displaced {
                previous: prev.name,
                new: owner.name,
            });
            if let Some(observer) = prev.observer {
                observer.on_owner_changed(owner);
            }
        }
        Ok(())
    }

    /// Gives up the lock. Only the current holder may do this; anyone else
    /// gets [`LockError::NotOwner`] and nothing changes.
    pub fn release(&self, owner: &LockOwner) -> Result<(), LockError> {
        let mut state = self.state.lock();
        if state.current.as_ref() != Some(owner) {
            ringbuf_entry!(Trace::NotOwner(owner.name));
            return Err(LockError::NotOwner);
        }
        state.previous = state.current.take();
        ringbuf_entry!(Trace::Released(owner.name));
        Ok(())
    }

    /// The current holder, if any.
    pub fn owner(&self) -> Option<LockOwner> {
        self.state.lock().current
    }

    pub fn is_held_by(&self, owner: &LockOwner) -> bool {
        self.owner().as_ref() == Some(owner)
    }

    /// Whether someone other than `owner` holds the lock right now.
    pub fn is_held_by_other(&self, owner: &LockOwner) -> bool {
        matches!(self.owner(), Some(current) if current != *owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;

    /// Records every notification it gets.
    struct Recorder {
        seen: Mutex<Vec<&'static str>>,
    }

    impl Recorder {
        fn leak() -> &'static Recorder {
            Box::leak(Box::new(Recorder {
                seen: Mutex::new(Vec::new()),
            }))
        }

        fn seen(&self) -> Vec<&'static str> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl OwnershipObserver for Recorder {
        fn on_owner_changed(&self, new_owner: &LockOwner) {
            self.seen.lock().unwrap().push(new_owner.name());
        }
    }

    #[test]
    fn reclaim_is_a_no_op() {
        let lock = FlashLock::new();
        let rec = Recorder::leak();
        let a = LockOwner::with_observer("ConfigChannel", rec);

        assert_eq!(lock.claim(&a), Ok(()));
        assert_eq!(lock.claim(&a), Ok(()));
        assert!(lock.is_held_by(&a));
        assert!(rec.seen().is_empty());
    }

    #[test]
    fn second_owner_is_busy() {
        let lock = FlashLock::new();
        let a = LockOwner::new("A");
        let b = LockOwner::new("B");

        lock.claim(&a).unwrap();
        assert_eq!(lock.claim(&b), Err(LockError::Busy));
        assert!(lock.is_held_by(&a));
        assert!(lock.is_held_by_other(&b));
    }

    #[test]
    fn handoff_notifies_displaced_owner_once() {
        let lock = FlashLock::new();
        let rec_a = Recorder::leak();
        let rec_b = Recorder::leak();
        let a = LockOwner::with_observer("A", rec_a);
        let b = LockOwner::with_observer("B", rec_b);

        lock.claim(&a).unwrap();
        assert_eq!(lock.claim(&b), Err(LockError::Busy));
        lock.release(&a).unwrap();
        lock.claim(&b).unwrap();
        // Re-claiming doesn't notify again.
        lock.claim(&b).unwrap();

        assert_eq!(rec_a.seen(), ["B"]);
        assert!(rec_b.seen().is_empty());
    }

    #[test]
    fn first_claim_and_same_owner_return_are_silent() {
        let lock = FlashLock::new();
        let rec = Recorder::leak();
        let a = LockOwner::with_observer("A", rec);

        lock.claim(&a).unwrap();
        lock.release(&a).unwrap();
        lock.claim(&a).unwrap();

        assert!(rec.seen().is_empty());
    }

    #[test]
    fn release_by_non_owner_changes_nothing() {
        let lock = FlashLock::new();
        let a = LockOwner::new("A");
        let b = LockOwner::new("B");

        assert_eq!(lock.release(&a), Err(LockError::NotOwner));

        lock.claim(&a).unwrap();
        assert_eq!(lock.release(&b), Err(LockError::NotOwner));
        assert!(lock.is_held_by(&a));

        lock.release(&a).unwrap();
        assert_eq!(lock.owner(), None);
        assert_eq!(lock.release(&a), Err(LockError::NotOwner));
    }

    struct Counter(AtomicUsize);

    impl OwnershipObserver for Counter {
        fn on_owner_changed(&self, _: &LockOwner) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn concurrent_claims_never_share() {
        static LOCK: FlashLock = FlashLock::new();
        static HOLDERS: AtomicUsize = AtomicUsize::new(0);

        let threads = (0..8)
            .map(|tid| {
                thread::spawn(move || {
                    let name: &'static str =
                        Box::leak(format!("owner {tid}").into_boxed_str());
                    let owner = LockOwner::new(name);
                    for _ in 0..64 {
                        while LOCK.claim(&owner).is_err() {
                            std::hint::spin_loop();
                        }
                        assert_eq!(HOLDERS.fetch_add(1, Ordering::SeqCst), 0);
                        HOLDERS.fetch_sub(1, Ordering::SeqCst);
                        LOCK.release(&owner).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();

        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(LOCK.owner(), None);
    }

    proptest::proptest! {
        /// Replays a random claim/release sequence between three owners and
        /// checks each notification against a model of the rule: a claim of
        /// a free lock notifies the previous holder iff it was someone else.
        #[test]
        fn notifications_follow_owner_changes(
            ops in proptest::collection::vec((0usize..3, proptest::bool::ANY), 0..64)
        ) {
            let lock = FlashLock::new();
            let counters: Vec<&'static Counter> = (0..3)
                .map(|_| &*Box::leak(Box::new(Counter(AtomicUsize::new(0)))))
                .collect();
            let owners: Vec<LockOwner> = ["x", "y", "z"]
                .iter()
                .zip(&counters)
                .map(|(name, c)| LockOwner::with_observer(*name, *c))
                .collect();

            let mut expected = [0usize; 3];
            let mut current: Option<usize> = None;
            let mut previous: Option<usize> = None;

            for (who, is_claim) in ops {
                let owner = &owners[who];
                if is_claim {
                    let result = lock.claim(owner);
                    match current {
                        Some(c) if c == who => proptest::prop_assert!(result.is_ok()),
                        Some(_) => proptest::prop_assert_eq!(result, Err(LockError::Busy)),
                        None => {
                            proptest::prop_assert!(result.is_ok());
                            if let Some(p) = previous.filter(|&p| p != who) {
                                expected[p] += 1;
                            }
                            current = Some(who);
                        }
                    }
                } else {
                    let result = lock.release(owner);
                    if current == Some(who) {
                        proptest::prop_assert!(result.is_ok());
                        previous = current.take();
                    } else {
                        proptest::prop_assert_eq!(result, Err(LockError::NotOwner));
                    }
                }
            }

            for (i, c) in counters.iter().enumerate() {
                proptest::prop_assert_eq!(c.0.load(Ordering::SeqCst), expected[i]);
            }
        }
    }

    #[test]
    fn observer_may_inspect_lock() {
        struct Peek(&'static FlashLock, AtomicUsize);
        impl OwnershipObserver for Peek {
            fn on_owner_changed(&self, new_owner: &LockOwner) {
                // Would deadlock if observers ran under the state lock.
                assert!(self.0.is_held_by(new_owner));
                self.1.fetch_add(1, Ordering::SeqCst);
            }
        }

        let lock: &'static FlashLock = Box::leak(Box::new(FlashLock::new()));
        let peek: &'static Peek =
            Box::leak(Box::new(Peek(lock, AtomicUsize::new(0))));
        let a = LockOwner::with_observer("A", peek);
        let b = LockOwner::new("B");

        lock.claim(&a).unwrap();
        lock.release(&a).unwrap();
        lock.claim(&b).unwrap();
        assert_eq!(peek.1.load(Ordering::SeqCst), 1);
    }
}
