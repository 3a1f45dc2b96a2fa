// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trace ring buffers for the flash-update crates.
//!
//! Each module that wants to leave a trail of what it did declares a static
//! ring buffer of some `Copy + PartialEq` payload type, usually a `Trace`
//! enum, and records entries into it as it goes:
//!
//! ```ignore
//! #[derive(Copy, Clone, Debug, PartialEq)]
//! enum Trace {
//!     None,
//!     EraseStep { offset: u32 },
//! }
//!
//! ringbuf!(Trace, 32, Trace::None);
//!
//! ringbuf_entry!(Trace::EraseStep { offset: 0x1000 });
//! ```
//!
//! Every entry remembers the source line that produced it and a generation
//! number for its slot. Recording the same payload from the same line twice
//! in a row bumps the `count` of the newest entry instead of using a new slot,
//! so a tight retry loop costs one entry rather than flushing the history.
//!
//! The storage sits behind a spin lock, which keeps the statics `Sync`
//! without `unsafe` and lets the same code run on the target and in host
//! tests. Nothing here allocates.

#![cfg_attr(not(test), no_std)]

pub use spin;

/// Declares a ringbuffer in the current module or context.
///
/// `ringbuf!(NAME, Type, N, expr)` makes a ringbuffer named `NAME`,
/// containing entries of type `Type`, with room for `N` such entries, all of
/// which are initialized to `expr`.
///
/// If you omit the name, it defaults to `__RINGBUF`, which gives each module
/// one quickly-installed ring buffer.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[used]
        static $name: $crate::StaticRingbuf<$t, $n> =
            $crate::StaticRingbuf::new($init);
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
    ($t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
}

/// Inserts data into a named ringbuffer (which should have been declared with
/// the `ringbuf!` macro).
///
/// `ringbuf_entry!(NAME, expr)` will insert `expr` into the ringbuffer called
/// `NAME`; without a name it goes to `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate the payload before touching the buffer so that a payload
        // expression can never observe the lock being held.
        let (p, buf) = ($payload, &$buf);
        $crate::StaticRingbuf::record(buf, line!() as u16, p);
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$payload;
    }};
    ($payload:expr) => {{
        let _ = &$payload;
    }};
}

/// Inserts data into a ringbuffer declared at the root of this crate.
#[allow(clippy::crate_in_macro_def)]
#[macro_export]
macro_rules! ringbuf_entry_root {
    ($buf:ident, $payload:expr) => {
        $crate::ringbuf_entry!(crate::$buf, $payload);
    };
    ($payload:expr) => {
        $crate::ringbuf_entry!(crate::__RINGBUF, $payload);
    };
}

/// A single ring buffer slot.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

/// A ring buffer of parametrized type and size. Statics should go through
/// [`ringbuf!`], which wraps this in a [`StaticRingbuf`].
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    last: Option<usize>,
    buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        if let Some(ent) = self.last.and_then(|i| self.buffer.get_mut(i)) {
            if ent.line == line && ent.payload == payload {
                if let Some(count) = ent.count.checked_add(1) {
                    ent.count = count;
                    return;
                }
            }
        }

        let ndx = match self.last {
            Some(i) if i + 1 < N => i + 1,
            _ => 0,
        };
        if let Some(ent) = self.buffer.get_mut(ndx) {
            *ent = RingbufEntry {
                line,
                generation: ent.generation.wrapping_add(1),
                count: 1,
                payload,
            };
            self.last = Some(ndx);
        }
    }

    /// Most recently recorded entry, if any.
    pub fn last_entry(&self) -> Option<&RingbufEntry<T>> {
        self.last.and_then(|i| self.buffer.get(i))
    }

    /// Walks the recorded entries from oldest to newest. Slots that have
    /// never been written are skipped.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        let start = self.last.map(|i| i + 1).unwrap_or(0);
        let (newer, older) = self.buffer.split_at(start.min(N));
        older
            .iter()
            .chain(newer.iter())
            .filter(|ent| ent.generation != 0)
    }

    pub fn clear(&mut self, init: T) {
        *self = Self::new(init);
    }
}

/// A ring buffer that can live in a `static`.
pub struct StaticRingbuf<T: Copy + PartialEq, const N: usize> {
    inner: spin::Mutex<Ringbuf<T, N>>,
}

impl<T: Copy + PartialEq, const N: usize> StaticRingbuf<T, N> {
    pub const fn new(init: T) -> Self {
        Self {
            inner: spin::Mutex::new(Ringbuf::new(init)),
        }
    }

    pub fn record(&self, line: u16, payload: T) {
        self.inner.lock().entry(line, payload);
    }

    /// Runs `f` against the buffer contents. The lock is held for the
    /// duration of `f`, so don't record into the same buffer from inside it.
    pub fn inspect<R>(&self, f: impl FnOnce(&Ringbuf<T, N>) -> R) -> R {
        f(&self.inner.lock())
    }
}
