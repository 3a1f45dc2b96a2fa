// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deferred work, one timer per kind of work.
//!
//! `Multitimer` keeps a deadline for each variant of an enum naming the units
//! of work a cooperative task can run ("erase the next page", "flush the next
//! chunk", "the transfer went idle"). Work is scheduled to run once, after a
//! delay, and can be cancelled until it has been observed.
//!
//! The expected usage model is:
//!
//! - Create an `enum` type naming your work items, and derive the `Enum`
//!   trait (from the `enum_map` crate) for it.
//!
//! - Create a `Multitimer<YourEnumType>`.
//!
//! - Use `schedule_after`/`cancel` as your state machine decides what should
//!   happen next.
//!
//! - Whenever the task gets a chance to run, call `advance` with the current
//!   time and then run whatever `iter_fired` hands back.
//!
//! Time is an opaque, monotonic `u64` supplied by the caller; the crate
//! doesn't care about its unit. Nothing here touches a hardware timer, which
//! is left to whatever owns the task loop: `next_deadline` tells it when to
//! wake up next.

#![cfg_attr(not(test), no_std)]

use enum_map::{EnumArray, EnumMap};

pub struct Multitimer<E: EnumArray<Timer>> {
    timers: EnumMap<E, Timer>,
}

impl<E: EnumArray<Timer> + Copy> Default for Multitimer<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EnumArray<Timer> + Copy> Multitimer<E> {
    pub fn new() -> Self {
        Self {
            timers: EnumMap::default(),
        }
    }

    /// Arranges for `which` to fire at `deadline`. This replaces any prior
    /// deadline for the same timer. A firing that has already happened but
    /// hasn't been observed is kept.
    pub fn schedule_at(&mut self, which: E, deadline: u64) {
        self.timers[which].deadline = Some(deadline);
    }

    /// Arranges for `which` to fire `delay` ticks after `now`.
    pub fn schedule_after(&mut self, which: E, now: u64, delay: u64) {
        self.schedule_at(which, now.saturating_add(delay));
    }

    /// Like `schedule_after`, but leaves an already-armed timer alone, so
    /// repeated requests for the same work don't keep pushing it out.
    pub fn ensure_scheduled(&mut self, which: E, now: u64, delay: u64) {
        if !self.is_pending(which) {
            self.schedule_after(which, now, delay);
        }
    }

    /// Disarms `which` and forgets any unobserved firing. Returns `true` if
    /// there was anything to cancel.
    pub fn cancel(&mut self, which: E) -> bool {
        let timer = &mut self.timers[which];
        let armed = timer.deadline.take().is_some();
        let fired = core::mem::replace(&mut timer.fired_but_not_observed, false);
        armed || fired
    }

    pub fn deadline(&self, which: E) -> Option<u64> {
        self.timers[which].deadline
    }

    /// Whether `which` will run, either because it is armed or because it has
    /// fired and nobody has picked it up yet.
    pub fn is_pending(&self, which: E) -> bool {
        let timer = &self.timers[which];
        timer.deadline.is_some() || timer.fired_but_not_observed
    }

    /// The earliest deadline among all armed timers.
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.values().filter_map(|t| t.deadline).min()
    }

    /// Marks every timer whose deadline is at or before `now` as fired and
    /// disarms it. Read the fired timers out with `iter_fired`.
    pub fn advance(&mut self, now: u64) {
        for timer in self.timers.values_mut() {
            if let Some(d) = timer.deadline {
                if d <= now {
                    timer.deadline = None;
                    timer.fired_but_not_observed = true;
                }
            }
        }
    }

    /// Returns an iterator over all timers that have fired since the last time
    /// they were observed through this function.
    ///
    /// Timers that have fired will appear in the order given by their `Enum`
    /// implementation, which in practice means declaration order.
    ///
    /// If you drop the iterator before it's exhausted, any timers you didn't
    /// observe will appear next time you call this.
    pub fn iter_fired(&mut self) -> impl Iterator<Item = E> + '_ {
        self.timers.iter_mut().filter_map(move |(e, timer)| {
            if core::mem::replace(&mut timer.fired_but_not_observed, false) {
                Some(e)
            } else {
                None
            }
        })
    }
}

#[derive(Copy, Clone, Default)]
pub struct Timer {
    deadline: Option<u64>,
    fired_but_not_observed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    use enum_map::Enum;

    #[derive(Copy, Clone, Debug, Eq, PartialEq, Enum)]
    enum Work {
        A,
        B,
    }

    #[test]
    fn nothing_fired() {
        let mut uut = Multitimer::<Work>::new();
        uut.advance(1_000);
        assert!(uut.iter_fired().next().is_none());
        assert_eq!(uut.next_deadline(), None);
    }

    #[test]
    fn earliest_deadline_wins() {
        let mut uut = Multitimer::<Work>::new();

        uut.schedule_after(Work::A, 100, 1234);
        uut.schedule_after(Work::B, 100, 12);

        assert_eq!(uut.next_deadline(), Some(112));
        assert!(uut.cancel(Work::B));
        assert_eq!(uut.next_deadline(), Some(1334));
        assert!(!uut.cancel(Work::B));
    }

    #[test]
    fn basic_firing_behavior() {
        let mut uut = Multitimer::<Work>::new();

        uut.schedule_at(Work::A, 1234);
        uut.schedule_at(Work::B, 12);

        uut.advance(11);
        assert_eq!(uut.iter_fired().next(), None);

        uut.advance(100);
        assert_eq!(uut.iter_fired().collect::<Vec<_>>(), [Work::B]);

        uut.advance(10_000);
        assert_eq!(uut.iter_fired().collect::<Vec<_>>(), [Work::A]);

        // Timers run once.
        uut.advance(10_000_000);
        assert_eq!(uut.iter_fired().next(), None);
    }

    #[test]
    fn zero_delay_fires_on_next_advance() {
        let mut uut = Multitimer::<Work>::new();
        uut.schedule_after(Work::A, 50, 0);
        assert!(uut.is_pending(Work::A));
        uut.advance(50);
        assert_eq!(uut.iter_fired().collect::<Vec<_>>(), [Work::A]);
        assert!(!uut.is_pending(Work::A));
    }

    #[test]
    fn cancel_discards_unobserved_firing() {
        let mut uut = Multitimer::<Work>::new();
        uut.schedule_at(Work::A, 5);
        uut.advance(10);
        assert!(uut.is_pending(Work::A));
        assert!(uut.cancel(Work::A));
        assert_eq!(uut.iter_fired().next(), None);
    }

    #[test]
    fn ensure_scheduled_keeps_existing_deadline() {
        let mut uut = Multitimer::<Work>::new();
        uut.schedule_after(Work::A, 0, 10);
        uut.ensure_scheduled(Work::A, 5, 10);
        assert_eq!(uut.deadline(Work::A), Some(10));

        // A plain reschedule moves it.
        uut.schedule_after(Work::A, 5, 10);
        assert_eq!(uut.deadline(Work::A), Some(15));
    }

    #[test]
    fn both_fire_in_declaration_order() {
        let mut uut = Multitimer::<Work>::new();
        uut.schedule_at(Work::B, 3);
        uut.schedule_at(Work::A, 4);
        uut.advance(4);
        assert_eq!(uut.iter_fired().collect::<Vec<_>>(), [Work::A, Work::B]);
    }
}
