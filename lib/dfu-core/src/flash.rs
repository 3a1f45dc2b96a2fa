// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The flash driver interface the update core consumes.

/// Physical characteristics of the image slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlashGeometry {
    /// Total slot size in bytes.
    pub size: u32,
    /// Writes must start on, and span a multiple of, this many bytes.
    pub write_block_size: u32,
    /// Smallest erasable unit in bytes.
    pub erase_unit_size: u32,
    /// Value every byte reads back as after an erase.
    pub erased_value: u8,
}

impl FlashGeometry {
    pub const fn is_write_aligned(&self, value: u32) -> bool {
        self.write_block_size != 0 && value % self.write_block_size == 0
    }

    /// Rounds `len` up to the next write block.
    pub const fn align_write_up(&self, len: u32) -> u32 {
        len.div_ceil(self.write_block_size) * self.write_block_size
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FlashError {
    /// No flash area with the requested id.
    NoSuchArea = 1,
    /// The area is already open.
    AlreadyOpen = 2,
    /// The operation runs past the end of the area.
    OutOfBounds = 3,
    /// The offset or length doesn't respect the write block or erase unit.
    Misaligned = 4,
    /// The device reported a failure.
    Io = 5,
}

/// A flash area that can be opened, read, programmed and erased.
///
/// An open area is represented by a `Handle`; the handle is consumed by
/// `close`, so holding one is proof that the area is open. Implementations
/// are expected to refuse a second `open` of an area that hasn't been closed.
pub trait FlashRegion {
    type Handle;

    fn geometry(&self) -> FlashGeometry;

    fn open(&mut self, id: u8) -> Result<Self::Handle, FlashError>;

    fn close(&mut self, handle: Self::Handle);

    fn read(
        &mut self,
        handle: &Self::Handle,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), FlashError>;

    /// Programs `data` at `offset`. Both must be write-block aligned.
    fn write(
        &mut self,
        handle: &Self::Handle,
        offset: u32,
        data: &[u8],
    ) -> Result<(), FlashError>;

    /// Erases `len` bytes at `offset`. Both must be erase-unit aligned.
    fn erase(
        &mut self,
        handle: &Self::Handle,
        offset: u32,
        len: u32,
    ) -> Result<(), FlashError>;
}
