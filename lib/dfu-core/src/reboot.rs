// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reboot arbiter.
//!
//! An accepted REBOOT doesn't reboot right away: the host needs time to see
//! the reply. During the grace period we keep the slot locked so nobody else
//! can slip a write in between the decision and the reboot.

use ringbuf::ringbuf_entry_root;

use crate::flash::FlashRegion;
use crate::install::InstallCandidate;
use crate::{AbortReason, DfuCore, Reboot, Trace, Work};

impl<F, I, R, const N: usize> DfuCore<F, I, R, N>
where
    F: FlashRegion,
    I: InstallCandidate,
    R: Reboot,
{
    /// Asks for a reboot after the grace period. Refused (returning `false`)
    /// if another transport holds the slot.
    pub fn request_reboot(&mut self, now: u64) -> bool {
        self.observe_displacement(now);
        if self.reboot_pending {
            return true;
        }
        if self.lock.claim(&self.lock_owner).is_err() {
            ringbuf_entry_root!(Trace::RebootRejected);
            return false;
        }
        ringbuf_entry_root!(Trace::RebootAccepted);
        self.reboot_pending = true;
        self.timers.schedule_after(
            Work::RebootGrace,
            now,
            self.config.reboot_grace_ms,
        );
        true
    }

    /// Calls off a pending reboot. Returns `false` if there wasn't one.
    pub fn cancel_reboot(&mut self, now: u64) -> bool {
        if !self.reboot_pending {
            return false;
        }
        ringbuf_entry_root!(Trace::RebootCancelled);
        self.timers.cancel(Work::RebootGrace);
        self.reboot_pending = false;
        if !self.transfer.region_clean {
            self.timers.ensure_scheduled(Work::Erase, now, 0);
        }
        self.release_if_idle();
        true
    }

    pub(crate) fn reboot_now(&mut self) {
        if self.transfer.in_progress {
            self.abort(AbortReason::Reboot);
        }

        let install = self.transfer.image_complete()
            && !self.transfer.foreign_write_occurred;
        ringbuf_entry_root!(Trace::Rebooting { install });
        if install {
            self.propose_image();
        }

        self.reboot_pending = false;
        self.release_if_idle();
        self.rebooter.reboot();
    }
}
