// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SFDP discovery.
//!
//! Discovery runs in two passes. [`locate_tables`] walks the parameter
//! headers and records where each table we care about lives; [`decode_secure`]
//! then turns the secure flash parameter table into the architecture part of
//! a [`SecureFlashProfile`]. [`read_profile`] drives both over a vendor.

use drv_secure_flash_api::{
    Architecture, CipherSuite, KeySize, SecureFlashError, SecureFlashProfile,
    SecureFlashVendor, SecurityFeature, ERASE_SENTINEL, ERASE_TYPES,
    MAX_SECURE_IO,
};
use ringbuf::{ringbuf, ringbuf_entry};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const SIGNATURE: [u8; 4] = *b"SFDP";
pub const SUPPORTED_MAJOR: u8 = 1;

/// MSB of every JEDEC-defined parameter id.
pub const JEDEC_ID_MSB: u8 = 0xff;

pub mod id {
    pub const BASIC: u8 = 0x00;
    pub const SECTOR_MAP: u8 = 0x81;
    pub const FOUR_BYTE_ADDRESS: u8 = 0x84;
    pub const SECURE_FLASH: u8 = 0x14;
}

/// Length of the secure flash parameter table.
pub const SECURE_TABLE_LEN: usize = 44;

#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct SfdpHeader {
    pub signature: [u8; 4],
    pub minor: u8,
    pub major: u8,
    /// Number of parameter headers, minus one.
    pub nph: u8,
    pub access_protocol: u8,
}

#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct ParamHeader {
    pub id_lsb: u8,
    pub minor: u8,
    pub major: u8,
    pub length_dwords: u8,
    pub ptp: [u8; 3],
    pub id_msb: u8,
}

static_assertions::const_assert_eq!(core::mem::size_of::<SfdpHeader>(), 8);
static_assertions::const_assert_eq!(core::mem::size_of::<ParamHeader>(), 8);

impl ParamHeader {
    pub fn location(&self) -> TableLocation {
        let [a, b, c] = self.ptp;
        TableLocation {
            addr: u32::from_le_bytes([a, b, c, 0]),
            len: u32::from(self.length_dwords) * 4,
        }
    }
}

/// Where a parameter table sits in SFDP space.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TableLocation {
    pub addr: u32,
    /// In bytes.
    pub len: u32,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SfdpTables {
    pub basic: Option<TableLocation>,
    pub sector_map: Option<TableLocation>,
    pub four_byte: Option<TableLocation>,
    pub secure: Option<TableLocation>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    BadHeader { major: u8 },
    Table { id: u8, addr: u32 },
    Skipped { lsb: u8, msb: u8 },
    SuiteTruncated(u8),
    Density(u32),
    NativeSizeTooLarge { read: u32, program: u32 },
    None,
}

ringbuf!(Trace, 16, Trace::None);

/// Walks the SFDP header and parameter headers.
pub fn locate_tables<V: SecureFlashVendor>(
    vendor: &mut V,
) -> Result<SfdpTables, SecureFlashError> {
    let mut raw = [0u8; 8];
    vendor.read_sfdp(0, &mut raw)?;
    let header = SfdpHeader::read_from_bytes(&raw[..])
        .map_err(|_| SecureFlashError::Sfdp)?;
    if header.signature != SIGNATURE || header.major != SUPPORTED_MAJOR {
        ringbuf_entry!(Trace::BadHeader {
            major: header.major
        });
        return Err(SecureFlashError::Sfdp);
    }

    let mut tables = SfdpTables::default();
    for i in 0..=u32::from(header.nph) {
        vendor.read_sfdp(8 + i * 8, &mut raw)?;
        let ph = ParamHeader::read_from_bytes(&raw[..])
            .map_err(|_| SecureFlashError::Sfdp)?;
        let loc = ph.location();
        let slot = match (ph.id_lsb, ph.id_msb) {
            (id::BASIC, JEDEC_ID_MSB) => &mut tables.basic,
            (id::SECTOR_MAP, JEDEC_ID_MSB) => &mut tables.sector_map,
            (id::FOUR_BYTE_ADDRESS, JEDEC_ID_MSB) => &mut tables.four_byte,
            (id::SECURE_FLASH, JEDEC_ID_MSB) => &mut tables.secure,
            (lsb, msb) => {
                ringbuf_entry!(Trace::Skipped { lsb, msb });
                continue;
            }
        };
        ringbuf_entry!(Trace::Table {
            id: ph.id_lsb,
            addr: loc.addr
        });
        *slot = Some(loc);
    }
    Ok(tables)
}

/// Decodes the density word (DWORD 2) of the basic table into bytes.
pub fn flash_size(density: u32) -> Result<u64, SecureFlashError> {
    let bits = if density & 0x8000_0000 != 0 {
        let exp = density & 0x7fff_ffff;
        if exp >= 64 {
            return Err(SecureFlashError::Sfdp);
        }
        1u64 << exp
    } else {
        u64::from(density) + 1
    };
    Ok(bits / 8)
}

fn pow2(exp: u8) -> Result<u32, SecureFlashError> {
    if exp >= 32 {
        return Err(SecureFlashError::Sfdp);
    }
    Ok(1 << exp)
}

/// Decodes the secure flash parameter table.
///
/// Cipher suites are kept in order up to the first one `supported` rejects;
/// the rest are dropped. A table with no usable suite at all is
/// `Unsupported`.
pub fn decode_secure(
    t: &[u8; SECURE_TABLE_LEN],
    flash_size: u64,
    supported: impl Fn(&CipherSuite) -> bool,
) -> Result<SecureFlashProfile, SecureFlashError> {
    let mut profile = SecureFlashProfile {
        flash_size,
        security_feature: SecurityFeature::from_bits_truncate(t[0]),
        ..Default::default()
    };

    for (i, raw) in t[4..20].chunks_exact(4).enumerate() {
        let suite = CipherSuite {
            key_exchange: raw[0],
            key_derive: raw[1],
            encryption: raw[2],
            signature: raw[3],
        };
        if !supported(&suite) {
            ringbuf_entry!(Trace::SuiteTruncated(i as u8));
            break;
        }
        // Four raw entries never overflow a four-entry list.
        let _ = profile.cipher_suites.push(suite);
    }
    if profile.cipher_suites.is_empty() {
        return Err(SecureFlashError::Unsupported);
    }

    let bytes = |i: usize| {
        let at = 20 + i * 2;
        u16::from_le_bytes([t[at], t[at + 1]]) / 8
    };
    profile.key_size = KeySize {
        session: bytes(0),
        private: bytes(1),
        public: bytes(2),
        preshare: bytes(3),
        salt: bytes(4),
        root: bytes(5),
        rpmc_root: bytes(6),
        rpmc_hmac: bytes(7),
    };

    let read = pow2(t[36])?;
    let program = pow2(t[37])?;
    if read as usize > MAX_SECURE_IO || program as usize > MAX_SECURE_IO {
        ringbuf_entry!(Trace::NativeSizeTooLarge { read, program });
        return Err(SecureFlashError::Unsupported);
    }

    // The erase list ends at the first zero; anything after it is ignored.
    let mut erase = [ERASE_SENTINEL; ERASE_TYPES];
    for (slot, &exp) in erase.iter_mut().zip(&t[38..42]) {
        if exp == 0 {
            break;
        }
        *slot = pow2(exp)?;
    }
    let min_erase = erase
        .iter()
        .copied()
        .filter(|&s| s != ERASE_SENTINEL)
        .min()
        .ok_or(SecureFlashError::Sfdp)?;

    let zone_number = pow2(t[42])?;
    let zone_size = pow2(t[43])?;
    let zone_total_size = zone_number
        .checked_mul(zone_size)
        .ok_or(SecureFlashError::Sfdp)?;
    if u64::from(zone_total_size) > flash_size
        || zone_size % min_erase != 0
        || min_erase % program != 0
    {
        return Err(SecureFlashError::Sfdp);
    }

    profile.architecture = Architecture {
        secure_read_size: read,
        secure_program_size: program,
        secure_erase_size: erase,
        min_secure_erase_size: min_erase,
        zone_number,
        zone_size,
        zone_total_size,
    };
    Ok(profile)
}

/// Reads and decodes everything the stack needs from the part's SFDP.
pub fn read_profile<V: SecureFlashVendor>(
    vendor: &mut V,
) -> Result<SecureFlashProfile, SecureFlashError> {
    let tables = locate_tables(vendor)?;
    let (Some(basic), Some(secure)) = (tables.basic, tables.secure) else {
        return Err(SecureFlashError::Sfdp);
    };
    if basic.len < 8 || (secure.len as usize) < SECURE_TABLE_LEN {
        return Err(SecureFlashError::Sfdp);
    }

    let mut density = [0u8; 4];
    vendor.read_sfdp(basic.addr + 4, &mut density)?;
    let density = u32::from_le_bytes(density);
    ringbuf_entry!(Trace::Density(density));
    let size = flash_size(density)?;

    let mut raw = [0u8; SECURE_TABLE_LEN];
    vendor.read_sfdp(secure.addr, &mut raw)?;
    decode_secure(&raw, size, |s| vendor.check_algorithm_support(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_mock_mx75::sfdp::{SfdpImage, SECURE_TABLE_OFFSET};
    use drv_mock_mx75::MockMx75;
    use drv_mx75_armorflash::Mx75;
    use drv_secure_flash_api::alg;
    use drv_secure_flash_crypto::SoftCrypto;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    fn part(image: &SfdpImage) -> Mx75<MockMx75, SoftCrypto<ChaCha20Rng>> {
        Mx75::new(
            MockMx75::new(image),
            SoftCrypto::new(ChaCha20Rng::seed_from_u64(3)),
        )
    }

    fn raw_table(image: &SfdpImage) -> [u8; SECURE_TABLE_LEN] {
        let img = image.build();
        let mut t = [0; SECURE_TABLE_LEN];
        t.copy_from_slice(&img[SECURE_TABLE_OFFSET..][..SECURE_TABLE_LEN]);
        t
    }

    fn ccm_only(s: &CipherSuite) -> bool {
        s.encryption == alg::AES_CCM_256 && s.key_exchange == alg::NONE
    }

    #[test]
    fn default_image_decodes() {
        let profile = read_profile(&mut part(&SfdpImage::default())).unwrap();
        assert_eq!(profile.flash_size, 32 * 1024);
        assert_eq!(profile.security_feature, SecurityFeature::all());
        let arch = profile.architecture;
        assert_eq!(arch.secure_read_size, 32);
        assert_eq!(arch.secure_program_size, 32);
        assert_eq!(
            arch.secure_erase_size,
            [4096, 512, ERASE_SENTINEL, ERASE_SENTINEL]
        );
        assert_eq!(arch.min_secure_erase_size, 512);
        assert_eq!(arch.zone_number, 4);
        assert_eq!(arch.zone_size, 8192);
        assert_eq!(arch.zone_total_size, 32768);
    }

    #[test]
    fn key_sizes_are_bytes() {
        let profile = read_profile(&mut part(&SfdpImage::default())).unwrap();
        assert_eq!(profile.key_size.session, 32);
        assert_eq!(profile.key_size.public, 64);
        assert_eq!(profile.key_size.salt, 16);
    }

    #[test]
    fn unknown_tables_are_skipped() {
        let mut dev = part(&SfdpImage::default());
        let tables = locate_tables(&mut dev).unwrap();
        assert_eq!(
            tables.secure,
            Some(TableLocation {
                addr: SECURE_TABLE_OFFSET as u32,
                len: 44
            })
        );
        assert!(tables.basic.is_some());
        assert_eq!(tables.sector_map, None);
        assert_eq!(tables.four_byte, None);
    }

    #[test]
    fn bad_signature_or_revision_is_rejected() {
        let image = SfdpImage {
            magic: *b"SFDQ",
            ..Default::default()
        };
        assert_eq!(
            read_profile(&mut part(&image)),
            Err(SecureFlashError::Sfdp)
        );

        let image = SfdpImage {
            major: 2,
            ..Default::default()
        };
        assert_eq!(
            read_profile(&mut part(&image)),
            Err(SecureFlashError::Sfdp)
        );
    }

    #[test]
    fn missing_secure_table_is_rejected() {
        let image = SfdpImage {
            secure_table: false,
            ..Default::default()
        };
        assert_eq!(
            read_profile(&mut part(&image)),
            Err(SecureFlashError::Sfdp)
        );
    }

    #[test]
    fn first_unsupported_suite_truncates() {
        // Entry 1 is ECDH/GCM, so entry 2 is dropped even though it is CCM.
        let profile = read_profile(&mut part(&SfdpImage::default())).unwrap();
        assert_eq!(profile.cipher_suites.len(), 1);
        assert_eq!(profile.cipher_suites[0].encryption, alg::AES_CCM_256);

        let t = raw_table(&SfdpImage::default());
        let all = decode_secure(&t, 32 * 1024, |_| true).unwrap();
        assert_eq!(all.cipher_suites.len(), 4);
    }

    #[test]
    fn no_usable_suite_is_unsupported() {
        let t = raw_table(&SfdpImage::default());
        assert_eq!(
            decode_secure(&t, 32 * 1024, |_| false),
            Err(SecureFlashError::Unsupported)
        );
    }

    #[test]
    fn erase_sentinel_and_minimum() {
        let image = SfdpImage {
            erase_exp: [15, 12, 0, 9],
            zone_size_exp: 15,
            zone_count_exp: 0,
            ..Default::default()
        };
        let p =
            decode_secure(&raw_table(&image), 32 * 1024, ccm_only).unwrap();
        assert_eq!(
            p.architecture.secure_erase_size,
            [32768, 4096, ERASE_SENTINEL, ERASE_SENTINEL]
        );
        assert_eq!(p.architecture.min_secure_erase_size, 4096);

        // A leading zero ends the list before any erase type.
        let image = SfdpImage {
            erase_exp: [0, 15, 0, 12],
            zone_size_exp: 15,
            zone_count_exp: 0,
            ..Default::default()
        };
        assert_eq!(
            decode_secure(&raw_table(&image), 32 * 1024, ccm_only),
            Err(SecureFlashError::Sfdp)
        );

        let image = SfdpImage {
            erase_exp: [0; 4],
            ..Default::default()
        };
        assert_eq!(
            decode_secure(&raw_table(&image), 32 * 1024, ccm_only),
            Err(SecureFlashError::Sfdp)
        );
    }

    #[test]
    fn oversized_native_io_is_unsupported() {
        let image = SfdpImage {
            read_exp: 9,
            ..Default::default()
        };
        assert_eq!(
            decode_secure(&raw_table(&image), 32 * 1024, ccm_only),
            Err(SecureFlashError::Unsupported)
        );
    }

    #[test]
    fn zones_must_fit_the_array() {
        let image = SfdpImage {
            zone_count_exp: 3,
            ..Default::default()
        };
        assert_eq!(
            decode_secure(&raw_table(&image), 32 * 1024, ccm_only),
            Err(SecureFlashError::Sfdp)
        );
    }

    #[test]
    fn density_encodings() {
        assert_eq!(flash_size(0x00ff_ffff).unwrap(), 2 * 1024 * 1024);
        assert_eq!(flash_size(0x8000_0022).unwrap(), 1 << 31);
        assert_eq!(flash_size(0x8000_0040), Err(SecureFlashError::Sfdp));
    }
}
