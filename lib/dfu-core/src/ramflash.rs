// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A flash slot backed by RAM, for host-side simulation and tests.
//!
//! `RamFlash` behaves like NOR flash as far as the update core can tell:
//! bytes can only be programmed while they are in the erased state, writes
//! and erases have to be aligned, and only one open handle may exist at a
//! time. It also counts operations and can be told to fail.

use core::ops::Range;

use crate::flash::{FlashError, FlashGeometry, FlashRegion};

pub struct RamFlash<const SIZE: usize> {
    id: u8,
    memory: [u8; SIZE],
    write_block_size: u32,
    erase_unit_size: u32,
    erased_value: u8,
    is_open: bool,
    /// Number of erase commands issued.
    pub erase_count: u32,
    /// Number of write commands issued.
    pub write_count: u32,
    /// Number of `open` calls that succeeded.
    pub open_count: u32,
    /// Fail any write that touches this offset.
    pub fail_write_at: Option<u32>,
    /// Fail any erase that touches this offset.
    pub fail_erase_at: Option<u32>,
}

/// Proof that a [`RamFlash`] is open.
#[derive(Debug)]
pub struct RamHandle(());

impl<const SIZE: usize> RamFlash<SIZE> {
    /// Creates a slot with id `id` whose contents start out erased.
    pub fn new(
        id: u8,
        write_block_size: u32,
        erase_unit_size: u32,
        erased_value: u8,
    ) -> Self {
        Self {
            id,
            memory: [erased_value; SIZE],
            write_block_size,
            erase_unit_size,
            erased_value,
            is_open: false,
            erase_count: 0,
            write_count: 0,
            open_count: 0,
            fail_write_at: None,
            fail_erase_at: None,
        }
    }

    /// Creates a slot whose contents are garbage, as if it held an old image.
    pub fn new_dirty(
        id: u8,
        write_block_size: u32,
        erase_unit_size: u32,
        erased_value: u8,
    ) -> Self {
        let mut flash =
            Self::new(id, write_block_size, erase_unit_size, erased_value);
        for (i, b) in flash.memory.iter_mut().enumerate() {
            *b = (i as u8) ^ 0x5a;
        }
        flash
    }

    pub fn contents(&self) -> &[u8] {
        &self.memory
    }

    /// Overwrites part of the slot directly, bypassing flash semantics. Used
    /// to simulate another writer.
    pub fn scribble(&mut self, offset: usize, data: &[u8]) {
        self.memory[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn is_erased(&self) -> bool {
        self.memory.iter().all(|&b| b == self.erased_value)
    }

    fn range(
        &self,
        offset: u32,
        len: usize,
    ) -> Result<Range<usize>, FlashError> {
        let start = offset as usize;
        let end = start.checked_add(len).ok_or(FlashError::OutOfBounds)?;
        if end > SIZE {
            return Err(FlashError::OutOfBounds);
        }
        Ok(start..end)
    }

    fn touches(failing: Option<u32>, range: &Range<usize>) -> bool {
        failing.is_some_and(|at| range.contains(&(at as usize)))
    }
}

impl<const SIZE: usize> FlashRegion for RamFlash<SIZE> {
    type Handle = RamHandle;

    fn geometry(&self) -> FlashGeometry {
        FlashGeometry {
            size: SIZE as u32,
            write_block_size: self.write_block_size,
            erase_unit_size: self.erase_unit_size,
            erased_value: self.erased_value,
        }
    }

    fn open(&mut self, id: u8) -> Result<RamHandle, FlashError> {
        if id != self.id {
            return Err(FlashError::NoSuchArea);
        }
        if self.is_open {
            return Err(FlashError::AlreadyOpen);
        }
        self.is_open = true;
        self.open_count += 1;
        Ok(RamHandle(()))
    }

    fn close(&mut self, _handle: RamHandle) {
        self.is_open = false;
    }

    fn read(
        &mut self,
        _handle: &RamHandle,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), FlashError> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.memory[range]);
        Ok(())
    }

    fn write(
        &mut self,
        _handle: &RamHandle,
        offset: u32,
        data: &[u8],
    ) -> Result<(), FlashError> {
        let range = self.range(offset, data.len())?;
        if offset % self.write_block_size != 0
            || data.len() % self.write_block_size as usize != 0
        {
            return Err(FlashError::Misaligned);
        }
        self.write_count += 1;
        if Self::touches(self.fail_write_at, &range) {
            return Err(FlashError::Io);
        }
        // NOR flash can't be programmed twice without an erase in between.
        if self.memory[range.clone()]
            .iter()
            .any(|&b| b != self.erased_value)
        {
            return Err(FlashError::Io);
        }
        self.memory[range].copy_from_slice(data);
        Ok(())
    }

    fn erase(
        &mut self,
        _handle: &RamHandle,
        offset: u32,
        len: u32,
    ) -> Result<(), FlashError> {
        let range = self.range(offset, len as usize)?;
        if offset % self.erase_unit_size != 0 || len % self.erase_unit_size != 0
        {
            return Err(FlashError::Misaligned);
        }
        self.erase_count += 1;
        if Self::touches(self.fail_erase_at, &range) {
            return Err(FlashError::Io);
        }
        self.memory[range].fill(self.erased_value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_need_erased_bytes() {
        let mut flash = RamFlash::<64>::new(1, 4, 16, 0xff);
        let h = flash.open(1).unwrap();
        flash.write(&h, 0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(flash.write(&h, 0, &[1, 2, 3, 4]), Err(FlashError::Io));
        flash.erase(&h, 0, 16).unwrap();
        flash.write(&h, 0, &[1, 2, 3, 4]).unwrap();
        flash.close(h);
        assert_eq!(&flash.contents()[..5], &[1, 2, 3, 4, 0xff]);
    }

    #[test]
    fn alignment_and_bounds_are_enforced() {
        let mut flash = RamFlash::<64>::new(1, 4, 16, 0xff);
        let h = flash.open(1).unwrap();
        assert_eq!(flash.write(&h, 2, &[0; 4]), Err(FlashError::Misaligned));
        assert_eq!(flash.write(&h, 0, &[0; 3]), Err(FlashError::Misaligned));
        assert_eq!(flash.write(&h, 64, &[0; 4]), Err(FlashError::OutOfBounds));
        assert_eq!(flash.erase(&h, 8, 16), Err(FlashError::Misaligned));
        assert_eq!(flash.erase(&h, 48, 32), Err(FlashError::OutOfBounds));
        flash.close(h);
    }

    #[test]
    fn single_open_handle() {
        let mut flash = RamFlash::<64>::new(1, 4, 16, 0xff);
        assert_eq!(flash.open(2).err(), Some(FlashError::NoSuchArea));
        let h = flash.open(1).unwrap();
        assert_eq!(flash.open(1).err(), Some(FlashError::AlreadyOpen));
        flash.close(h);
        assert!(flash.open(1).is_ok());
    }

    #[test]
    fn failure_injection() {
        let mut flash = RamFlash::<64>::new(1, 4, 16, 0xff);
        flash.fail_write_at = Some(6);
        flash.fail_erase_at = Some(40);
        let h = flash.open(1).unwrap();
        assert!(flash.write(&h, 0, &[0; 4]).is_ok());
        assert_eq!(flash.write(&h, 4, &[0; 4]), Err(FlashError::Io));
        assert!(flash.erase(&h, 0, 16).is_ok());
        assert_eq!(flash.erase(&h, 32, 16), Err(FlashError::Io));
        assert_eq!(flash.write_count, 2);
        assert_eq!(flash.erase_count, 2);
    }
}
