// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Handing a finished image to the bootloader.
//!
//! Once every byte of an image is on flash, the update core proposes it as
//! the install candidate for the next boot. What that means depends on the
//! bootloader family, so each family gets its own [`InstallCandidate`]
//! implementation, picked when the core is constructed.

use ringbuf::{ringbuf, ringbuf_entry};

use crate::flash::{FlashError, FlashRegion};

/// Receives complete images. Fire and forget: failures are for the
/// implementation to report, the update core has nothing it could do about
/// them.
pub trait InstallCandidate {
    /// `region_offset` is where the image starts within the slot and `length`
    /// is how many bytes of it were received.
    fn propose(&mut self, region_offset: u32, length: u32);
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    McubootRequested { trailer: u32 },
    McubootAlreadyRequested,
    McubootFailed(FlashError),
    B0Candidate { length: u32 },
    SuitFailed(SuitError),
    SuitStarted { length: u32 },
}

ringbuf!(Trace, 8, Trace::None);

/// MCUboot's image trailer magic, as stored on flash.
pub const MCUBOOT_MAGIC: [u8; 16] = {
    const WORDS: [u32; 4] =
        [0xf395_c277, 0x7fef_d260, 0x0f50_5235, 0x8079_b62c];
    let mut out = [0u8; 16];
    let mut i = 0;
    while i < 4 {
        let b = WORDS[i].to_le_bytes();
        out[i * 4] = b[0];
        out[i * 4 + 1] = b[1];
        out[i * 4 + 2] = b[2];
        out[i * 4 + 3] = b[3];
        i += 1;
    }
    out
};

/// Largest write block we'll pad the MCUboot magic out to.
const MCUBOOT_MAX_ALIGN: usize = 32;

/// Requests a test swap from MCUboot by writing the trailer magic at the end
/// of the secondary slot. MCUboot swaps the image in on the next boot and
/// reverts it unless the new image confirms itself.
pub struct McuBoot<F: FlashRegion> {
    flash: F,
    slot_id: u8,
}

impl<F: FlashRegion> McuBoot<F> {
    pub fn new(flash: F, slot_id: u8) -> Self {
        Self { flash, slot_id }
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    fn request_upgrade(&mut self) -> Result<(), FlashError> {
        let geometry = self.flash.geometry();
        let magic_len = geometry.align_write_up(MCUBOOT_MAGIC.len() as u32);
        if magic_len as usize > MCUBOOT_MAX_ALIGN {
            return Err(FlashError::Misaligned);
        }
        let trailer = geometry
            .size
            .checked_sub(magic_len)
            .ok_or(FlashError::OutOfBounds)?;

        let handle = self.flash.open(self.slot_id)?;
        let result = self.write_magic(&handle, trailer, magic_len as usize);
        self.flash.close(handle);

        if result.is_ok() {
            ringbuf_entry!(Trace::McubootRequested { trailer });
        }
        result
    }

    fn write_magic(
        &mut self,
        handle: &F::Handle,
        trailer: u32,
        len: usize,
    ) -> Result<(), FlashError> {
        let erased = self.flash.geometry().erased_value;
        // The magic sits in the last 16 bytes of the aligned trailer block.
        let mut block = [erased; MCUBOOT_MAX_ALIGN];
        let magic_at = len - MCUBOOT_MAGIC.len();
        block[magic_at..len].copy_from_slice(&MCUBOOT_MAGIC);

        let mut current = [0u8; MCUBOOT_MAX_ALIGN];
        self.flash.read(handle, trailer, &mut current[..len])?;
        if current[..len] == block[..len] {
            // Already requested; writing again would program over
            // programmed bytes.
            ringbuf_entry!(Trace::McubootAlreadyRequested);
            return Ok(());
        }
        self.flash.write(handle, trailer, &block[..len])
    }
}

impl<F: FlashRegion> InstallCandidate for McuBoot<F> {
    fn propose(&mut self, _region_offset: u32, _length: u32) {
        if let Err(e) = self.request_upgrade() {
            ringbuf_entry!(Trace::McubootFailed(e));
        }
    }
}

/// The immutable first-stage bootloader validates both slots on every boot
/// and runs the newer one, so there is nothing to request; we just keep track
/// of what was proposed.
#[derive(Debug, Default)]
pub struct B0 {
    proposed: Option<(u32, u32)>,
}

impl B0 {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last `(region_offset, length)` proposed, if any.
    pub fn proposed(&self) -> Option<(u32, u32)> {
        self.proposed
    }
}

impl InstallCandidate for B0 {
    fn propose(&mut self, region_offset: u32, length: u32) {
        ringbuf_entry!(Trace::B0Candidate { length });
        self.proposed = Some((region_offset, length));
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SuitError {
    /// The stored envelope didn't parse or failed authentication.
    BadEnvelope = 1,
    /// The update couldn't be started.
    Rejected = 2,
}

/// The SUIT services the update core needs: tell the processor where the
/// candidate envelope is, then ask it to start the update.
pub trait SuitProcessor {
    fn candidate_stored(
        &mut self,
        region_offset: u32,
        length: u32,
    ) -> Result<(), SuitError>;

    fn update_start(&mut self) -> Result<(), SuitError>;
}

/// Proposes SUIT envelopes.
pub struct Suit<P: SuitProcessor> {
    processor: P,
}

impl<P: SuitProcessor> Suit<P> {
    pub fn new(processor: P) -> Self {
        Self { processor }
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }
}

impl<P: SuitProcessor> InstallCandidate for Suit<P> {
    fn propose(&mut self, region_offset: u32, length: u32) {
        let result = self
            .processor
            .candidate_stored(region_offset, length)
            .and_then(|()| self.processor.update_start());
        match result {
            Ok(()) => ringbuf_entry!(Trace::SuitStarted { length }),
            Err(e) => ringbuf_entry!(Trace::SuitFailed(e)),
        }
    }
}
