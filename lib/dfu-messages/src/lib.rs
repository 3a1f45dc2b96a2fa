// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire formats for firmware update requests exchanged with the host over
//! the configuration channel.
//!
//! The transport delivers an opcode and a payload whose length is given by
//! its own framing; everything in here is the payload. Multi-byte integers
//! are little-endian and nothing is aligned, so every message is a
//! `#[repr(C)]` struct of byte-order-aware zerocopy integers and can be read
//! from or written to any byte slice.

#![cfg_attr(not(test), no_std)]

use num_derive::{FromPrimitive, ToPrimitive};
use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, IntoBytes};

/// Request codes, as the host tool numbers them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Start = 0,
    Data = 1,
    Sync = 2,
    Reboot = 3,
    FwInfo = 4,
    DevInfo = 5,
}

impl Opcode {
    pub fn from_u8(raw: u8) -> Option<Self> {
        num_traits::FromPrimitive::from_u8(raw)
    }
}

/// Transfer state as reported by SYNC.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum SyncState {
    /// No transfer open; the slot is clean or holds a finished image.
    Inactive = 0,
    /// We hold the slot and a transfer is open.
    ActiveOwn = 1,
    /// Received data is still being written out.
    Storing = 2,
    /// The slot is being erased.
    Cleaning = 3,
    /// Another transport holds the slot.
    ActiveOther = 4,
}

impl SyncState {
    pub fn from_u8(raw: u8) -> Option<Self> {
        num_traits::FromPrimitive::from_u8(raw)
    }
}

/// START payload.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::Immutable,
    zerocopy_derive::Unaligned,
)]
#[repr(C)]
pub struct StartRequest {
    pub length: U32,
    pub checksum: U32,
    pub offset: U32,
}

const_assert_eq!(core::mem::size_of::<StartRequest>(), 12);

impl StartRequest {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn new(length: u32, checksum: u32, offset: u32) -> Self {
        Self {
            length: U32::new(length),
            checksum: U32::new(checksum),
            offset: U32::new(offset),
        }
    }

    /// Reads a request from the front of `payload`; trailing bytes are
    /// ignored. Returns `None` if `payload` is too short.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        Self::read_from_prefix(payload).ok().map(|(req, _)| req)
    }
}

/// SYNC response.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::Immutable,
    zerocopy_derive::Unaligned,
)]
#[repr(C)]
pub struct SyncResponse {
    pub state: u8,
    pub length: U32,
    pub checksum: U32,
    pub offset: U32,
    pub buffer_capacity: U16,
}

const_assert_eq!(core::mem::size_of::<SyncResponse>(), 15);

impl SyncResponse {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn new(
        state: SyncState,
        length: u32,
        checksum: u32,
        offset: u32,
        buffer_capacity: u16,
    ) -> Self {
        Self {
            state: state as u8,
            length: U32::new(length),
            checksum: U32::new(checksum),
            offset: U32::new(offset),
            buffer_capacity: U16::new(buffer_capacity),
        }
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        Self::read_from_prefix(payload).ok().map(|(rsp, _)| rsp)
    }

    pub fn sync_state(&self) -> Option<SyncState> {
        SyncState::from_u8(self.state)
    }
}

/// REBOOT response: a single 0/1 byte.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::Immutable,
    zerocopy_derive::Unaligned,
)]
#[repr(C)]
pub struct RebootResponse {
    pub accepted: u8,
}

impl RebootResponse {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn new(accepted: bool) -> Self {
        Self {
            accepted: accepted as u8,
        }
    }

    pub fn accepted(&self) -> bool {
        self.accepted != 0
    }
}

/// FWINFO response: which slot the next image goes to, and the version of
/// the running image.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::Immutable,
    zerocopy_derive::Unaligned,
)]
#[repr(C)]
pub struct FwInfo {
    pub flash_area_id: u8,
    pub image_len: U32,
    pub ver_major: u8,
    pub ver_minor: u8,
    pub ver_rev: U16,
    pub ver_build_nr: U32,
}

const_assert_eq!(core::mem::size_of::<FwInfo>(), 13);

impl FwInfo {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// Length of the NUL-padded hardware generation string in DEVINFO.
pub const GENERATION_LEN: usize = 8;

/// DEVINFO response.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::Immutable,
    zerocopy_derive::Unaligned,
)]
#[repr(C)]
pub struct DevInfo {
    pub vid: U16,
    pub pid: U16,
    pub generation: [u8; GENERATION_LEN],
}

const_assert_eq!(core::mem::size_of::<DevInfo>(), 12);

impl DevInfo {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Builds a DEVINFO blob. A generation name longer than
    /// [`GENERATION_LEN`] is cut short.
    pub fn new(vid: u16, pid: u16, generation: &str) -> Self {
        let mut name = [0u8; GENERATION_LEN];
        let n = generation.len().min(GENERATION_LEN);
        name[..n].copy_from_slice(&generation.as_bytes()[..n]);
        Self {
            vid: U16::new(vid),
            pid: U16::new(pid),
            generation: name,
        }
    }
}

/// Writes `msg` to the front of `out`, returning the number of bytes used,
/// or `None` if `out` can't hold it.
pub fn encode<T>(msg: &T, out: &mut [u8]) -> Option<usize>
where
    T: IntoBytes + zerocopy::Immutable,
{
    let bytes = msg.as_bytes();
    let dst = out.get_mut(..bytes.len())?;
    dst.copy_from_slice(bytes);
    Some(bytes.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_match_host_tool() {
        // DFU_START .. DFU_IMGINFO in the host configurator.
        assert_eq!(Opcode::from_u8(0), Some(Opcode::Start));
        assert_eq!(Opcode::from_u8(1), Some(Opcode::Data));
        assert_eq!(Opcode::from_u8(2), Some(Opcode::Sync));
        assert_eq!(Opcode::from_u8(3), Some(Opcode::Reboot));
        assert_eq!(Opcode::from_u8(4), Some(Opcode::FwInfo));
        assert_eq!(Opcode::from_u8(5), Some(Opcode::DevInfo));
        assert_eq!(Opcode::from_u8(6), None);
    }

    #[test]
    fn start_request_layout() {
        // struct.pack('<III', 64, 0xABCD, 0x20)
        let raw = [
            0x40, 0, 0, 0, 0xcd, 0xab, 0, 0, 0x20, 0, 0, 0, 0xff,
        ];
        let req = StartRequest::parse(&raw).unwrap();
        assert_eq!(req.length.get(), 64);
        assert_eq!(req.checksum.get(), 0xabcd);
        assert_eq!(req.offset.get(), 0x20);
        assert_eq!(req.as_bytes(), &raw[..12]);
    }

    #[test]
    fn short_start_is_rejected() {
        assert_eq!(StartRequest::parse(&[0; 11]), None);
        assert_eq!(StartRequest::parse(&[]), None);
    }

    #[test]
    fn sync_response_layout() {
        let rsp = SyncResponse::new(
            SyncState::Storing,
            0x0102_0304,
            0xdead_beef,
            0x10,
            128,
        );
        let mut out = [0u8; 32];
        assert_eq!(encode(&rsp, &mut out), Some(15));
        assert_eq!(
            &out[..15],
            &[
                2, 0x04, 0x03, 0x02, 0x01, 0xef, 0xbe, 0xad, 0xde, 0x10, 0, 0,
                0, 128, 0
            ]
        );
        let back = SyncResponse::parse(&out).unwrap();
        assert_eq!(back.sync_state(), Some(SyncState::Storing));
    }

    #[test]
    fn encode_refuses_short_buffer() {
        let rsp = RebootResponse::new(true);
        assert_eq!(encode(&rsp, &mut []), None);
        let mut out = [0u8; 1];
        assert_eq!(encode(&rsp, &mut out), Some(1));
        assert_eq!(out, [1]);
    }

    #[test]
    fn fwinfo_layout() {
        // struct.pack('<BIBBHI', 1, 0x1000, 2, 3, 0x405, 0x60708)
        let info = FwInfo {
            flash_area_id: 1,
            image_len: U32::new(0x1000),
            ver_major: 2,
            ver_minor: 3,
            ver_rev: U16::new(0x405),
            ver_build_nr: U32::new(0x60708),
        };
        assert_eq!(
            info.as_bytes(),
            &[1, 0, 0x10, 0, 0, 2, 3, 0x05, 0x04, 0x08, 0x07, 0x06, 0]
        );
    }

    #[test]
    fn devinfo_pads_and_truncates_generation() {
        let info = DevInfo::new(0x1915, 0x52de, "gen1");
        assert_eq!(&info.generation, b"gen1\0\0\0\0");
        let long = DevInfo::new(0, 0, "much_too_long");
        assert_eq!(&long.generation, b"much_too");
        assert_eq!(info.as_bytes()[..4], [0x15, 0x19, 0xde, 0x52]);
    }
}
