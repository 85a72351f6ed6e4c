// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Layout of the "SFPI" secure-flash provisioning image.
//!
//! ```text
//! major header   8 bytes   "SFPI", version, total size, counts
//! sub-headers    8 bytes each
//! sub-tables     each begins [id, entry count, 0, 0]
//! ```

use zerocopy::byteorder::little_endian as le;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const MAGIC: [u8; 4] = *b"SFPI";
pub const VERSION: u8 = 1;

pub const APP_INFO: u8 = 0x01;
pub const LOCK_INFO: u8 = 0x02;
pub const KEY_INFO: u8 = 0x03;
pub const MC_INFO: u8 = 0x04;
pub const CONFIG_INFO: u8 = 0x05;

/// Bytes at the start of every sub-table: id, entry count, two reserved.
pub const TABLE_PREFIX: usize = 4;

pub const APP_ENTRY: usize = 8;
pub const KEY_ENTRY: usize = 40;
pub const MC_ENTRY: usize = 8;

/// Sub-header `flags` bit: keep this table in the persisted image.
pub const STORE: u16 = 1 << 0;

/// `LOCK_INFO` byte 1.
pub mod lock {
    pub const WRITE: u8 = 1 << 0;
    pub const READ: u8 = 1 << 1;
    pub const PROVISION: u8 = 1 << 2;
    pub const ALL: u8 = WRITE | READ | PROVISION;
}

/// `KEY_INFO` entry `inject_type`.
pub mod inject {
    pub const IMPORT: u8 = 0;
    pub const GENERATE: u8 = 1;
    pub const DERIVE: u8 = 2;
}

#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(C)]
pub struct MajorHeader {
    pub magic: [u8; 4],
    pub version: u8,
    pub total_size: le::U16,
    /// Low nibble: number of sub-headers. High nibble: number stored.
    pub counts: u8,
}

impl MajorHeader {
    pub const SIZE: usize = 8;

    pub fn new(total_size: u16, sub_headers: u8, stored: u8) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            total_size: total_size.into(),
            counts: (sub_headers & 0xf) | (stored << 4),
        }
    }

    pub fn sub_header_num(&self) -> usize {
        usize::from(self.counts & 0xf)
    }

    pub fn store_num(&self) -> usize {
        usize::from(self.counts >> 4)
    }
}

#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(C)]
pub struct SubHeader {
    pub id: u8,
    pub version: u8,
    pub flags: le::U16,
    pub table_size: le::U16,
    pub offset: le::U16,
}

impl SubHeader {
    pub const SIZE: usize = 8;

    pub fn new(id: u8, store: bool, table_size: u16, offset: u16) -> Self {
        Self {
            id,
            version: VERSION,
            flags: (if store { STORE } else { 0 }).into(),
            table_size: table_size.into(),
            offset: offset.into(),
        }
    }

    pub fn store(&self) -> bool {
        self.flags.get() & STORE != 0
    }
}

#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(C)]
pub struct AppEntry {
    pub app_id: le::U32,
    pub key_id: u8,
    pub zone_id: u8,
    pub mc_id: u8,
    pub reserved: u8,
}

#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(C)]
pub struct KeyEntry {
    pub key_id: u8,
    pub inject_type: u8,
    pub derive_from: u8,
    pub reserved: [u8; 5],
    /// Import seed, or salt for a derived key.
    pub material: [u8; 32],
}

#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(C)]
pub struct McEntry {
    pub mc_id: u8,
    pub reserved: [u8; 3],
    pub initial: le::U32,
}

static_assertions::const_assert_eq!(
    core::mem::size_of::<MajorHeader>(),
    MajorHeader::SIZE
);
static_assertions::const_assert_eq!(
    core::mem::size_of::<SubHeader>(),
    SubHeader::SIZE
);
static_assertions::const_assert_eq!(
    core::mem::size_of::<AppEntry>(),
    APP_ENTRY
);
static_assertions::const_assert_eq!(
    core::mem::size_of::<KeyEntry>(),
    KEY_ENTRY
);
static_assertions::const_assert_eq!(core::mem::size_of::<McEntry>(), MC_ENTRY);
