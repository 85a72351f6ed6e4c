// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device description derived once from SFDP.

use bitflags::bitflags;
use heapless::Vec;

/// Maximum number of cipher suites a secure flash parameter table may list.
pub const MAX_CIPHER_SUITES: usize = 4;

/// Number of secure erase types a secure flash parameter table may list.
pub const ERASE_TYPES: usize = 4;

/// Erase size stored for an unused erase type.
pub const ERASE_SENTINEL: u32 = 1;

bitflags! {
    /// Security features advertised by the part.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct SecurityFeature: u8 {
        const STORAGE = 1 << 0;
        const RPMC = 1 << 1;
        const UID = 1 << 2;
        const RNG = 1 << 3;
        const PUF = 1 << 4;
    }
}

/// Algorithm codes used in cipher-suite entries.
pub mod alg {
    pub const NONE: u8 = 0x00;
    pub const HKDF_SHA256: u8 = 0x11;
    pub const AES_CCM_256: u8 = 0x21;
    pub const AES_GCM_256: u8 = 0x22;
    pub const AES_ECB_256: u8 = 0x23;
    pub const AES_CBC_256: u8 = 0x24;
    pub const HMAC_SHA256: u8 = 0x31;
    pub const ECDH_P256: u8 = 0x41;
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CipherSuite {
    pub key_exchange: u8,
    pub key_derive: u8,
    pub encryption: u8,
    pub signature: u8,
}

/// Key sizes, in bytes.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct KeySize {
    pub session: u16,
    pub private: u16,
    pub public: u16,
    pub preshare: u16,
    pub salt: u16,
    pub root: u16,
    pub rpmc_root: u16,
    pub rpmc_hmac: u16,
}

/// Secure I/O geometry.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Architecture {
    pub secure_read_size: u32,
    pub secure_program_size: u32,
    /// Unused entries hold [`ERASE_SENTINEL`].
    pub secure_erase_size: [u32; ERASE_TYPES],
    pub min_secure_erase_size: u32,
    pub zone_number: u32,
    pub zone_size: u32,
    pub zone_total_size: u32,
}

impl Architecture {
    /// Iterates the erase sizes up to the first sentinel.
    pub fn erase_sizes(&self) -> impl Iterator<Item = u32> + '_ {
        self.secure_erase_size
            .iter()
            .copied()
            .take_while(|&s| s != ERASE_SENTINEL)
    }

    /// Zone containing `addr`, if the address is inside the secure area.
    pub fn zone_of(&self, addr: u32) -> Option<u32> {
        if self.zone_size == 0 || addr >= self.zone_total_size {
            None
        } else {
            Some(addr / self.zone_size)
        }
    }
}

/// Everything the stack knows about the part, read-only after init.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SecureFlashProfile {
    /// Total array size in bytes, from the JEDEC basic table.
    pub flash_size: u64,
    pub security_feature: SecurityFeature,
    pub cipher_suites: Vec<CipherSuite, MAX_CIPHER_SUITES>,
    pub key_size: KeySize,
    pub architecture: Architecture,
}
