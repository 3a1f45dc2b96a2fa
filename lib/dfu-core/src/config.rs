// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tunables for the update core.
//!
//! The defaults match what the configuration-channel firmware ships with.
//! Times are in milliseconds of whatever monotonic clock feeds
//! `DfuCore::poll`.

use serde::Deserialize;

use crate::flash::FlashGeometry;

/// Largest store increment we'll accept. Store chunks are staged on the
/// stack, and keeping them small keeps each flash write short.
pub const STORE_CHUNK_MAX: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DfuConfig {
    /// Flash area id of the slot updates are written to.
    pub slot_id: u8,
    /// An open transfer with no DATA or SYNC for this long is torn down.
    pub idle_timeout_ms: u64,
    /// Delay between an accepted REBOOT and the reboot itself.
    pub reboot_grace_ms: u64,
    /// How long the eraser backs off while the device is in use.
    pub device_busy_backoff_ms: u64,
    /// How long the eraser backs off while another transport holds the slot.
    pub lock_busy_backoff_ms: u64,
    /// Delay between erasing one page and looking at the next.
    pub erase_step_delay_ms: u64,
    /// Bytes written to flash per store increment.
    pub store_chunk: usize,
    /// Delay between store increments.
    pub store_interval_ms: u64,
}

impl DfuConfig {
    pub const DEFAULT: Self = Self {
        slot_id: 1,
        idle_timeout_ms: 5_000,
        reboot_grace_ms: 250,
        device_busy_backoff_ms: 1_000,
        lock_busy_backoff_ms: 1_000,
        erase_step_delay_ms: 0,
        store_chunk: 16,
        store_interval_ms: 1,
    };

    /// Checks that this configuration can drive a slot shaped like
    /// `geometry` through a staging buffer of `buffer_capacity` bytes.
    pub fn validate(
        &self,
        geometry: &FlashGeometry,
        buffer_capacity: usize,
    ) -> Result<(), ConfigError> {
        if geometry.write_block_size == 0
            || geometry.erase_unit_size == 0
            || geometry.erase_unit_size % geometry.write_block_size != 0
        {
            return Err(ConfigError::BadEraseUnit);
        }
        if geometry.size == 0 || geometry.size % geometry.erase_unit_size != 0 {
            return Err(ConfigError::RegionMisaligned);
        }
        if self.store_chunk == 0 {
            return Err(ConfigError::StoreChunkZero);
        }
        if self.store_chunk > STORE_CHUNK_MAX {
            return Err(ConfigError::StoreChunkTooLarge);
        }
        if !geometry.is_write_aligned(self.store_chunk as u32) {
            return Err(ConfigError::StoreChunkMisaligned);
        }
        if buffer_capacity > u16::MAX as usize
            || buffer_capacity < geometry.write_block_size as usize
            || !geometry.is_write_aligned(buffer_capacity as u32)
        {
            return Err(ConfigError::BadBufferCapacity);
        }
        Ok(())
    }
}

impl Default for DfuConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConfigError {
    /// Erase unit or write block is zero, or the erase unit isn't a whole
    /// number of write blocks.
    BadEraseUnit = 1,
    /// Slot size isn't a whole number of erase units.
    RegionMisaligned = 2,
    StoreChunkZero = 3,
    StoreChunkTooLarge = 4,
    /// Store chunk isn't a whole number of write blocks.
    StoreChunkMisaligned = 5,
    /// Staging buffer doesn't fit the SYNC field or isn't a whole number of
    /// write blocks.
    BadBufferCapacity = 6,
}

#[cfg(test)]
mod tests {
    use super::*;

    const GEOMETRY: FlashGeometry = FlashGeometry {
        size: 4096,
        write_block_size: 4,
        erase_unit_size: 1024,
        erased_value: 0xff,
    };

    #[test]
    fn defaults_are_valid() {
        assert_eq!(DfuConfig::default().validate(&GEOMETRY, 128), Ok(()));
    }

    #[test]
    fn rejects_bad_store_chunk() {
        let mut config = DfuConfig::DEFAULT;
        config.store_chunk = 0;
        assert_eq!(
            config.validate(&GEOMETRY, 128),
            Err(ConfigError::StoreChunkZero)
        );
        config.store_chunk = 18;
        assert_eq!(
            config.validate(&GEOMETRY, 128),
            Err(ConfigError::StoreChunkMisaligned)
        );
        config.store_chunk = STORE_CHUNK_MAX + 4;
        assert_eq!(
            config.validate(&GEOMETRY, 128),
            Err(ConfigError::StoreChunkTooLarge)
        );
    }

    #[test]
    fn rejects_bad_geometry() {
        let config = DfuConfig::DEFAULT;
        let odd_size = FlashGeometry {
            size: 4000,
            ..GEOMETRY
        };
        assert_eq!(
            config.validate(&odd_size, 128),
            Err(ConfigError::RegionMisaligned)
        );
        let odd_unit = FlashGeometry {
            erase_unit_size: 1022,
            ..GEOMETRY
        };
        assert_eq!(
            config.validate(&odd_unit, 128),
            Err(ConfigError::BadEraseUnit)
        );
    }

    #[test]
    fn rejects_bad_buffer() {
        let config = DfuConfig::DEFAULT;
        assert_eq!(
            config.validate(&GEOMETRY, 2),
            Err(ConfigError::BadBufferCapacity)
        );
        assert_eq!(
            config.validate(&GEOMETRY, 130),
            Err(ConfigError::BadBufferCapacity)
        );
        assert_eq!(
            config.validate(&GEOMETRY, 1 << 17),
            Err(ConfigError::BadBufferCapacity)
        );
    }

    #[test]
    fn loads_from_toml_with_defaults() {
        let config: DfuConfig = toml::from_str(
            r#"
            slot_id = 2
            idle_timeout_ms = 10000
            store_chunk = 32
            "#,
        )
        .unwrap();
        assert_eq!(config.slot_id, 2);
        assert_eq!(config.idle_timeout_ms, 10_000);
        assert_eq!(config.store_chunk, 32);
        assert_eq!(config.reboot_grace_ms, DfuConfig::DEFAULT.reboot_grace_ms);
        assert_eq!(config.validate(&GEOMETRY, 128), Ok(()));
    }
}
