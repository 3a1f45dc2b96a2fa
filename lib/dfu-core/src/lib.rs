// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware update core for the configuration channel.
//!
//! `DfuCore` owns everything needed to receive an image into the secondary
//! flash slot: the background eraser that gets the slot clean, the transfer
//! state machine driven by START/DATA/SYNC, the store task that moves staged
//! bytes to flash, and the reboot arbiter that hands a finished image to the
//! bootloader.
//!
//! Nothing in here blocks. Requests are handled synchronously and anything
//! slow (erasing a page, writing a chunk) is queued as a unit of work on a
//! [`Multitimer`]; the owner of the task loop calls [`DfuCore::poll`] with the
//! current time and sleeps until [`DfuCore::next_deadline`]. Each unit of
//! work touches flash at most once.
//!
//! Other transports may write to the same slot. They coordinate through a
//! shared [`FlashLock`]; when one of them takes the slot from us, our
//! [`DfuOwner`] is told, and the next thing the core does is throw away what
//! it believed about the slot and erase it again.

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicBool, Ordering};

use dfu_messages::{DevInfo, FwInfo, Opcode, RebootResponse, StartRequest};
use dfu_messages::{SyncResponse, SyncState};
use enum_map::Enum;
use flash_lock::{FlashLock, LockOwner, OwnershipObserver};
use multitimer::Multitimer;
use ringbuf::{ringbuf, ringbuf_entry};

mod config;
mod erase;
mod flash;
mod install;
pub mod ramflash;
mod reboot;
mod staging;
mod transfer;

pub use config::{ConfigError, DfuConfig, STORE_CHUNK_MAX};
pub use flash::{FlashError, FlashGeometry, FlashRegion};
pub use install::{
    InstallCandidate, McuBoot, Suit, SuitError, SuitProcessor, B0,
    MCUBOOT_MAGIC,
};
pub use staging::StagingBuffer;

/// Reply status for a request that couldn't be carried out.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuError {
    /// Another transport holds the slot, or a reboot is on its way.
    Busy = 1,
    /// Payload too short, empty DATA, zero-length image, or DATA past the
    /// end of a complete image.
    BadLength = 2,
    /// The slot is still being erased.
    NotClean = 3,
    /// DATA with no transfer open.
    NotActive = 4,
    /// Resume parameters don't match the recorded transfer.
    OffsetMismatch = 5,
    /// The image doesn't fit the slot.
    TooLarge = 6,
    /// Staged data is still being written out.
    StoreBusy = 7,
    /// A START from zero found a partial image; the slot is being erased
    /// and the host should start again once it's clean.
    Restarted = 8,
    UnknownOpcode = 9,
    /// The response buffer can't hold the reply.
    ResponseTooSmall = 10,
    /// The slot couldn't be opened.
    FlashUnavailable = 11,
}

/// Why an open transfer was torn down.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AbortReason {
    /// No DATA or SYNC within the idle timeout.
    Timeout = 1,
    EmptyData = 2,
    MalformedStart = 3,
    /// START asked for more than the slot holds.
    TooLarge = 4,
    /// A flash write failed.
    WriteFailed = 5,
    /// The reboot grace period ran out.
    Reboot = 6,
}

/// Performs the reboot once the grace period is over. On the target this
/// doesn't return; host implementations record the request instead.
pub trait Reboot {
    fn reboot(&mut self);
}

/// Version of the running image, reported by FWINFO.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub image_len: u32,
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
    pub build: u32,
}

/// Reported by DEVINFO.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vid: u16,
    pub pid: u16,
    pub generation: &'static str,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Identity {
    pub firmware: FirmwareInfo,
    pub device: DeviceIdentity,
}

/// The update core's identity on the [`FlashLock`].
///
/// This has to live in a static because the lock holds on to owners, and it
/// doubles as the observer that hears about other transports taking the
/// slot. The flag it keeps is consumed by the core on its next entry point.
pub struct DfuOwner {
    name: &'static str,
    displaced: AtomicBool,
}

impl DfuOwner {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            displaced: AtomicBool::new(false),
        }
    }

    pub fn lock_owner(&'static self) -> LockOwner {
        LockOwner::with_observer(self.name, self)
    }

    /// Whether another transport has had the slot since we last looked.
    pub fn is_displaced(&self) -> bool {
        self.displaced.load(Ordering::Relaxed)
    }

    fn take_displaced(&self) -> bool {
        self.displaced.swap(false, Ordering::Relaxed)
    }
}

impl OwnershipObserver for DfuOwner {
    fn on_owner_changed(&self, new_owner: &LockOwner) {
        ringbuf_entry!(Trace::OwnerChanged(new_owner.name()));
        self.displaced.store(true, Ordering::Relaxed);
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    OwnerChanged(&'static str),
    Invalidated,

    EraseDeferred,
    EraseLockBusy,
    EraseSkipped(u32),
    Erased(u32),
    EraseFailed { offset: u32, err: FlashError },
    Clean,

    Started { length: u32, checksum: u32 },
    Resumed { offset: u32 },
    Restarted { discarded: u32 },
    StartRejected(DfuError),
    OpenFailed(FlashError),

    Data { len: usize, accepted: usize },
    DataRejected(DfuError),

    Stored { offset: u32, len: usize },
    StoreFailed { offset: u32, err: FlashError },
    CaughtUp(u32),
    Complete { length: u32 },
    Proposed { length: u32 },
    Aborted { reason: AbortReason, cur_offset: u32 },

    RebootAccepted,
    RebootRejected,
    RebootCancelled,
    Rebooting { install: bool },

    BadOpcode(u8),
}

ringbuf!(Trace, 64, Trace::None);

/// Deferred units of work.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum)]
enum Work {
    /// Look at (and maybe erase) the next page of the slot.
    Erase,
    /// Write the next chunk of staged data.
    Store,
    /// The open transfer has been idle for too long.
    TransferTimeout,
    /// The reboot grace period is over.
    RebootGrace,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
struct TransferState {
    /// Length of the image prefix known to be on flash.
    cur_offset: u32,
    img_length: u32,
    img_csum: u32,
    region_clean: bool,
    in_progress: bool,
    device_in_use: bool,
    /// Another transport had the slot since this image was started.
    foreign_write_occurred: bool,
    /// This image has been handed to the install candidate.
    proposed: bool,
}

impl TransferState {
    fn image_complete(&self) -> bool {
        self.img_length != 0 && self.cur_offset == self.img_length
    }

    /// Forgets the image we were receiving.
    fn reset_image(&mut self) {
        self.cur_offset = 0;
        self.img_length = 0;
        self.img_csum = 0;
        self.proposed = false;
    }
}

/// The update core. `N` is the size of the staging buffer, which the host
/// learns from SYNC.
pub struct DfuCore<F, I, R, const N: usize>
where
    F: FlashRegion,
    I: InstallCandidate,
    R: Reboot,
{
    config: DfuConfig,
    geometry: FlashGeometry,
    lock: &'static FlashLock,
    owner: &'static DfuOwner,
    lock_owner: LockOwner,
    flash: F,
    installer: I,
    rebooter: R,
    identity: Identity,
    timers: Multitimer<Work>,
    transfer: TransferState,
    staging: StagingBuffer<N>,
    erase_cursor: u32,
    /// Open while a transfer is in progress, and only then.
    handle: Option<F::Handle>,
    reboot_pending: bool,
    last_abort: Option<AbortReason>,
}

impl<F, I, R, const N: usize> DfuCore<F, I, R, N>
where
    F: FlashRegion,
    I: InstallCandidate,
    R: Reboot,
{
    /// Builds the core. The slot is assumed dirty: the first `poll` starts an
    /// erase cycle, which skips pages that are already erased.
    pub fn new(
        config: DfuConfig,
        lock: &'static FlashLock,
        owner: &'static DfuOwner,
        flash: F,
        installer: I,
        rebooter: R,
        identity: Identity,
    ) -> Result<Self, ConfigError> {
        let geometry = flash.geometry();
        config.validate(&geometry, N)?;

        let mut timers = Multitimer::new();
        timers.schedule_at(Work::Erase, 0);

        Ok(Self {
            config,
            geometry,
            lock,
            owner,
            lock_owner: owner.lock_owner(),
            flash,
            installer,
            rebooter,
            identity,
            timers,
            transfer: TransferState::default(),
            staging: StagingBuffer::new(),
            erase_cursor: 0,
            handle: None,
            reboot_pending: false,
            last_abort: None,
        })
    }

    /// Runs every unit of work that is due at `now`.
    ///
    /// Work scheduled while this runs waits for the next call, even if it is
    /// due immediately, so one call does a bounded amount of flash I/O.
    pub fn poll(&mut self, now: u64) {
        self.observe_displacement(now);
        self.timers.advance(now);
        loop {
            let Some(work) = self.timers.iter_fired().next() else {
                break;
            };
            match work {
                Work::Erase => self.erase_step(now),
                Work::Store => self.store_step(now),
                Work::TransferTimeout => self.transfer_timed_out(),
                Work::RebootGrace => self.reboot_now(),
            }
        }
    }

    /// When `poll` next has something to do.
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.next_deadline()
    }

    /// Decodes and runs one request, leaving any reply at the front of
    /// `response`. Returns the reply length.
    pub fn handle(
        &mut self,
        now: u64,
        opcode: u8,
        payload: &[u8],
        response: &mut [u8],
    ) -> Result<usize, DfuError> {
        let Some(op) = Opcode::from_u8(opcode) else {
            ringbuf_entry!(Trace::BadOpcode(opcode));
            return Err(DfuError::UnknownOpcode);
        };

        let reply = match op {
            Opcode::Start => {
                let Some(req) = StartRequest::parse(payload) else {
                    return Err(self.malformed_start());
                };
                self.start(
                    now,
                    req.length.get(),
                    req.checksum.get(),
                    req.offset.get(),
                )?;
                return Ok(0);
            }
            Opcode::Data => {
                self.data(now, payload)?;
                return Ok(0);
            }
            Opcode::Sync => {
                let status = self.sync(now);
                dfu_messages::encode(&status, response)
            }
            Opcode::Reboot => {
                let accepted = self.request_reboot(now);
                dfu_messages::encode(&RebootResponse::new(accepted), response)
            }
            Opcode::FwInfo => dfu_messages::encode(&self.fw_info(), response),
            Opcode::DevInfo => {
                dfu_messages::encode(&self.dev_info(), response)
            }
        };
        reply.ok_or(DfuError::ResponseTooSmall)
    }

    /// Reports where the transfer stands. Counts as activity for the idle
    /// timeout.
    pub fn sync(&mut self, now: u64) -> SyncResponse {
        self.observe_displacement(now);
        if self.transfer.in_progress {
            self.arm_idle_timeout(now);
        }
        SyncResponse::new(
            self.sync_state(),
            self.transfer.img_length,
            self.transfer.img_csum,
            self.transfer.cur_offset,
            N as u16,
        )
    }

    fn sync_state(&self) -> SyncState {
        if self.lock.is_held_by_other(&self.lock_owner) {
            SyncState::ActiveOther
        } else if !self.transfer.region_clean {
            SyncState::Cleaning
        } else if self.timers.is_pending(Work::Store) {
            SyncState::Storing
        } else if self.transfer.in_progress {
            SyncState::ActiveOwn
        } else {
            SyncState::Inactive
        }
    }

    pub fn fw_info(&self) -> FwInfo {
        let fw = &self.identity.firmware;
        FwInfo {
            flash_area_id: self.config.slot_id,
            image_len: fw.image_len.into(),
            ver_major: fw.major,
            ver_minor: fw.minor,
            ver_rev: fw.revision.into(),
            ver_build_nr: fw.build.into(),
        }
    }

    pub fn dev_info(&self) -> DevInfo {
        let dev = &self.identity.device;
        DevInfo::new(dev.vid, dev.pid, dev.generation)
    }

    /// Feeds the "device in use" signal; the eraser stays away from flash
    /// while it is set.
    pub fn set_device_in_use(&mut self, in_use: bool) {
        self.transfer.device_in_use = in_use;
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn installer(&self) -> &I {
        &self.installer
    }

    pub fn rebooter(&self) -> &R {
        &self.rebooter
    }

    pub fn cur_offset(&self) -> u32 {
        self.transfer.cur_offset
    }

    pub fn img_length(&self) -> u32 {
        self.transfer.img_length
    }

    pub fn img_csum(&self) -> u32 {
        self.transfer.img_csum
    }

    pub fn is_region_clean(&self) -> bool {
        self.transfer.region_clean
    }

    pub fn is_transfer_active(&self) -> bool {
        self.transfer.in_progress
    }

    pub fn is_reboot_pending(&self) -> bool {
        self.reboot_pending
    }

    pub fn foreign_write_occurred(&self) -> bool {
        self.transfer.foreign_write_occurred
    }

    pub fn last_abort(&self) -> Option<AbortReason> {
        self.last_abort
    }

    /// If another transport had the slot while we weren't looking, nothing we
    /// know about its contents holds any more.
    fn observe_displacement(&mut self, now: u64) {
        if self.owner.take_displaced() {
            self.transfer.foreign_write_occurred = true;
            self.invalidate(now);
        }
    }

    /// Drops the transfer and image, marks the slot dirty and queues a fresh
    /// erase cycle.
    fn invalidate(&mut self, now: u64) {
        ringbuf_entry!(Trace::Invalidated);
        self.close_region();
        self.staging.clear();
        self.timers.cancel(Work::Store);
        self.timers.cancel(Work::TransferTimeout);
        self.transfer.in_progress = false;
        self.transfer.reset_image();
        self.transfer.region_clean = false;
        self.erase_cursor = 0;
        self.timers.ensure_scheduled(Work::Erase, now, 0);
    }

    fn close_region(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.flash.close(handle);
        }
    }

    fn arm_idle_timeout(&mut self, now: u64) {
        self.timers.schedule_after(
            Work::TransferTimeout,
            now,
            self.config.idle_timeout_ms,
        );
    }

    /// Gives the slot back unless something of ours still needs it.
    fn release_if_idle(&mut self) {
        if !self.transfer.in_progress
            && !self.reboot_pending
            && self.lock.is_held_by(&self.lock_owner)
        {
            // We just checked that we hold it.
            let _ = self.lock.release(&self.lock_owner);
        }
    }
}
