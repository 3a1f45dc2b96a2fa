// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background eraser.
//!
//! One page per step: read it back, erase it only if it isn't already in the
//! erased state, then yield. The slot is opened and closed around every step
//! and the lock is held from the first step to the last.

use ringbuf::ringbuf_entry_root;

use crate::flash::{FlashError, FlashRegion};
use crate::install::InstallCandidate;
use crate::{DfuCore, Reboot, Trace, Work};

/// Bytes compared against the erased value per read.
const ERASE_CHECK_CHUNK: usize = 64;

impl<F, I, R, const N: usize> DfuCore<F, I, R, N>
where
    F: FlashRegion,
    I: InstallCandidate,
    R: Reboot,
{
    pub(crate) fn erase_step(&mut self, now: u64) {
        if self.transfer.region_clean {
            return;
        }
        if self.handle.is_some() {
            // Only one of us may have the slot open.
            return;
        }
        if self.transfer.device_in_use || self.reboot_pending {
            ringbuf_entry_root!(Trace::EraseDeferred);
            self.release_if_idle();
            self.timers.schedule_after(
                Work::Erase,
                now,
                self.config.device_busy_backoff_ms,
            );
            return;
        }
        if self.lock.claim(&self.lock_owner).is_err() {
            ringbuf_entry_root!(Trace::EraseLockBusy);
            self.timers.schedule_after(
                Work::Erase,
                now,
                self.config.lock_busy_backoff_ms,
            );
            return;
        }

        let offset = self.erase_cursor;
        match self.erase_page(offset) {
            Ok(true) => ringbuf_entry_root!(Trace::Erased(offset)),
            Ok(false) => ringbuf_entry_root!(Trace::EraseSkipped(offset)),
            Err(err) => {
                ringbuf_entry_root!(Trace::EraseFailed { offset, err });
                // Start the cycle over after a while; a page that failed
                // once may well erase on a second attempt.
                self.erase_cursor = 0;
                self.release_if_idle();
                self.timers.schedule_after(
                    Work::Erase,
                    now,
                    self.config.device_busy_backoff_ms,
                );
                return;
            }
        }

        self.erase_cursor += self.geometry.erase_unit_size;
        if self.erase_cursor >= self.geometry.size {
            ringbuf_entry_root!(Trace::Clean);
            self.erase_cursor = 0;
            self.transfer.region_clean = true;
            self.release_if_idle();
        } else {
            self.timers.schedule_after(
                Work::Erase,
                now,
                self.config.erase_step_delay_ms,
            );
        }
    }

    /// Erases the page at `offset` unless it is already erased. Returns
    /// whether an erase was issued.
    fn erase_page(&mut self, offset: u32) -> Result<bool, FlashError> {
        let handle = self.flash.open(self.config.slot_id)?;
        let result = self.erase_page_with(&handle, offset);
        self.flash.close(handle);
        result
    }

    fn erase_page_with(
        &mut self,
        handle: &F::Handle,
        offset: u32,
    ) -> Result<bool, FlashError> {
        let unit = self.geometry.erase_unit_size;
        if self.page_is_erased(handle, offset, unit)? {
            return Ok(false);
        }
        self.flash.erase(handle, offset, unit)?;
        Ok(true)
    }

    fn page_is_erased(
        &mut self,
        handle: &F::Handle,
        offset: u32,
        len: u32,
    ) -> Result<bool, FlashError> {
        let erased = self.geometry.erased_value;
        let mut buf = [0u8; ERASE_CHECK_CHUNK];
        let end = offset + len;
        let mut pos = offset;
        while pos < end {
            let n = usize::min(ERASE_CHECK_CHUNK, (end - pos) as usize);
            self.flash.read(handle, pos, &mut buf[..n])?;
            if buf[..n].iter().any(|&b| b != erased) {
                return Ok(false);
            }
            pos += n as u32;
        }
        Ok(true)
    }
}
