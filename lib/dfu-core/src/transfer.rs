// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transfer state machine and store task.
//!
//! START opens the slot and keeps it open until the image is complete or the
//! transfer is torn down. DATA only stages bytes; the store task writes them
//! out a chunk at a time and, once it has caught up, folds the written bytes
//! into `cur_offset`. Writes are whole write blocks except for the very end
//! of the image, so a partial block in the middle of an image waits in the
//! staging buffer for the bytes that follow it.

use ringbuf::ringbuf_entry_root;

use crate::config::STORE_CHUNK_MAX;
use crate::flash::FlashRegion;
use crate::install::InstallCandidate;
use crate::{AbortReason, DfuCore, DfuError, Reboot, Trace, Work};

impl<F, I, R, const N: usize> DfuCore<F, I, R, N>
where
    F: FlashRegion,
    I: InstallCandidate,
    R: Reboot,
{
    /// Begins a transfer of `length` bytes, or resumes one at `offset`.
    ///
    /// A START from zero over a partially received image doesn't start
    /// anything: it throws the image away, erases the slot and fails with
    /// [`DfuError::Restarted`]. The host is expected to poll SYNC until the
    /// slot is clean and try again.
    pub fn start(
        &mut self,
        now: u64,
        length: u32,
        checksum: u32,
        offset: u32,
    ) -> Result<(), DfuError> {
        self.observe_displacement(now);
        self.check_start(length).inspect_err(|&e| {
            ringbuf_entry_root!(Trace::StartRejected(e));
        })?;

        if offset == 0 {
            if self.transfer.cur_offset != 0 {
                ringbuf_entry_root!(Trace::Restarted {
                    discarded: self.transfer.cur_offset
                });
                self.invalidate(now);
                self.release_if_idle();
                return Err(DfuError::Restarted);
            }
            self.transfer.img_length = length;
            self.transfer.img_csum = checksum;
            self.transfer.proposed = false;
            self.transfer.foreign_write_occurred = false;
            ringbuf_entry_root!(Trace::Started { length, checksum });
        } else {
            let t = &self.transfer;
            if offset != t.cur_offset
                || length != t.img_length
                || checksum != t.img_csum
            {
                ringbuf_entry_root!(Trace::StartRejected(
                    DfuError::OffsetMismatch
                ));
                self.release_if_idle();
                return Err(DfuError::OffsetMismatch);
            }
            ringbuf_entry_root!(Trace::Resumed { offset });
        }

        // Anything still staged is a partial write block the host is going to
        // send again, starting from `cur_offset`.
        self.staging.clear();

        if self.handle.is_none() {
            match self.flash.open(self.config.slot_id) {
                Ok(handle) => self.handle = Some(handle),
                Err(e) => {
                    ringbuf_entry_root!(Trace::OpenFailed(e));
                    self.transfer.in_progress = false;
                    self.release_if_idle();
                    return Err(DfuError::FlashUnavailable);
                }
            }
        }
        self.transfer.in_progress = true;
        self.arm_idle_timeout(now);

        if self.transfer.image_complete() {
            // Resumed at the very end: nothing left to receive.
            self.complete();
        }
        Ok(())
    }

    /// Everything that can turn a START away before it touches the transfer.
    /// On success we hold the lock.
    fn check_start(&mut self, length: u32) -> Result<(), DfuError> {
        if self.reboot_pending {
            return Err(DfuError::Busy);
        }
        if length > self.geometry.size {
            if self.transfer.in_progress {
                self.abort(AbortReason::TooLarge);
            }
            return Err(DfuError::TooLarge);
        }
        if length == 0 {
            return Err(DfuError::BadLength);
        }
        if !self.transfer.region_clean {
            return Err(DfuError::NotClean);
        }
        if self.timers.is_pending(Work::Store) {
            return Err(DfuError::StoreBusy);
        }
        self.lock
            .claim(&self.lock_owner)
            .map_err(|_| DfuError::Busy)?;
        Ok(())
    }

    /// A START payload too short to parse.
    pub(crate) fn malformed_start(&mut self) -> DfuError {
        ringbuf_entry_root!(Trace::StartRejected(DfuError::BadLength));
        if self.transfer.in_progress {
            self.abort(AbortReason::MalformedStart);
        }
        DfuError::BadLength
    }

    /// Stages image bytes. Returns how many were taken: a chunk that runs
    /// past the end of the image or doesn't fit the staging buffer is cut
    /// short.
    pub fn data(&mut self, now: u64, bytes: &[u8]) -> Result<usize, DfuError> {
        self.observe_displacement(now);
        let accepted = self.stage(now, bytes).inspect_err(|&e| {
            ringbuf_entry_root!(Trace::DataRejected(e));
        })?;
        ringbuf_entry_root!(Trace::Data {
            len: bytes.len(),
            accepted
        });
        Ok(accepted)
    }

    fn stage(&mut self, now: u64, bytes: &[u8]) -> Result<usize, DfuError> {
        if bytes.is_empty() {
            if self.transfer.in_progress {
                self.abort(AbortReason::EmptyData);
            }
            return Err(DfuError::BadLength);
        }
        if !self.transfer.region_clean {
            return Err(DfuError::NotClean);
        }
        if !self.transfer.in_progress {
            return Err(DfuError::NotActive);
        }

        let received =
            self.transfer.cur_offset as usize + self.staging.fill_offset();
        let remaining =
            (self.transfer.img_length as usize).saturating_sub(received);
        if remaining == 0 {
            return Err(DfuError::BadLength);
        }

        let wanted = &bytes[..usize::min(bytes.len(), remaining)];
        let rest = self.staging.extend_from_slice(wanted);
        let accepted = wanted.len() - rest.len();

        self.arm_idle_timeout(now);
        if accepted != 0 {
            self.timers.ensure_scheduled(Work::Store, now, 0);
        }
        Ok(accepted)
    }

    /// Writes the next chunk of staged data.
    pub(crate) fn store_step(&mut self, now: u64) {
        let len = usize::min(self.flushable_len(), self.config.store_chunk);
        if len == 0 {
            self.catch_up();
            return;
        }
        let Some(handle) = self.handle.as_ref() else {
            return;
        };

        // Only the last chunk of an image can be short of a write block; pad
        // it out with the erased value.
        let mut chunk = [self.geometry.erased_value; STORE_CHUNK_MAX];
        chunk[..len].copy_from_slice(&self.staging.unflushed()[..len]);
        let padded = self.geometry.align_write_up(len as u32) as usize;

        let offset =
            self.transfer.cur_offset + self.staging.flushed_offset() as u32;
        if let Err(err) = self.flash.write(handle, offset, &chunk[..padded]) {
            ringbuf_entry_root!(Trace::StoreFailed { offset, err });
            self.write_failed(now);
            return;
        }
        ringbuf_entry_root!(Trace::Stored { offset, len });
        self.staging.mark_flushed(len);
        self.arm_idle_timeout(now);

        if self.flushable_len() != 0 {
            self.timers.schedule_after(
                Work::Store,
                now,
                self.config.store_interval_ms,
            );
        } else {
            self.catch_up();
        }
    }

    /// Staged bytes the store task may write now.
    fn flushable_len(&self) -> usize {
        let pending = self.staging.unflushed().len();
        let received =
            self.transfer.cur_offset as usize + self.staging.fill_offset();
        if received == self.transfer.img_length as usize {
            pending
        } else {
            let block = self.geometry.write_block_size as usize;
            pending - pending % block
        }
    }

    /// Folds what has been written into `cur_offset`.
    fn catch_up(&mut self) {
        let written = self.staging.consume_flushed();
        self.transfer.cur_offset += written as u32;
        ringbuf_entry_root!(Trace::CaughtUp(self.transfer.cur_offset));
        if self.transfer.image_complete() {
            self.complete();
        }
    }

    /// The whole image is on flash.
    pub(crate) fn complete(&mut self) {
        ringbuf_entry_root!(Trace::Complete {
            length: self.transfer.img_length
        });
        self.end_transfer();
        self.propose_image();
        self.release_if_idle();
    }

    /// Hands the image to the install candidate, once per image.
    pub(crate) fn propose_image(&mut self) {
        if self.transfer.proposed {
            return;
        }
        let length = self.transfer.img_length;
        ringbuf_entry_root!(Trace::Proposed { length });
        self.installer.propose(0, length);
        self.transfer.proposed = true;
    }

    /// Tears down an open transfer. Bytes already written stay counted so
    /// the host can resume after them; anything staged but unwritten is lost.
    pub(crate) fn abort(&mut self, reason: AbortReason) {
        let written = self.staging.consume_flushed();
        self.transfer.cur_offset += written as u32;
        ringbuf_entry_root!(Trace::Aborted {
            reason,
            cur_offset: self.transfer.cur_offset
        });
        self.last_abort = Some(reason);
        self.end_transfer();
        self.release_if_idle();
    }

    fn end_transfer(&mut self) {
        self.close_region();
        self.staging.clear();
        self.timers.cancel(Work::Store);
        self.timers.cancel(Work::TransferTimeout);
        self.transfer.in_progress = false;
    }

    /// We no longer know what's in the slot past `cur_offset`, or whether
    /// what's before it is intact.
    fn write_failed(&mut self, now: u64) {
        self.abort(AbortReason::WriteFailed);
        self.invalidate(now);
    }

    pub(crate) fn transfer_timed_out(&mut self) {
        if self.transfer.in_progress {
            self.abort(AbortReason::Timeout);
        }
    }
}
