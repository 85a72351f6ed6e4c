// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Builds the SFDP image the simulated part serves.

use drv_secure_flash_api::alg;

pub const BASIC_TABLE_OFFSET: usize = 0x40;
pub const SECURE_TABLE_OFFSET: usize = 0x80;
pub const UNKNOWN_TABLE_OFFSET: usize = 0xb0;
pub const IMAGE_SIZE: usize = 0x100;

/// Everything the secure flash parameter table says, in raw encoded form.
#[derive(Clone, Debug)]
pub struct SfdpImage {
    pub magic: [u8; 4],
    pub major: u8,
    /// Bytes of flash, written into the basic table density field.
    pub flash_size: u64,
    pub features: u8,
    pub cipher_suites: [[u8; 4]; 4],
    pub key_bits: [u16; 8],
    pub read_exp: u8,
    pub program_exp: u8,
    /// Raw 0 ends the list.
    pub erase_exp: [u8; 4],
    pub zone_count_exp: u8,
    pub zone_size_exp: u8,
    /// Emit the secure flash table header at all.
    pub secure_table: bool,
    /// Emit a vendor table the parser doesn't know, ahead of the secure one.
    pub unknown_table: bool,
}

impl Default for SfdpImage {
    fn default() -> Self {
        Self {
            magic: *b"SFDP",
            major: 1,
            flash_size: 32 * 1024,
            features: 0x1f,
            cipher_suites: [
                [alg::NONE, alg::HKDF_SHA256, alg::AES_CCM_256, alg::NONE],
                [
                    alg::ECDH_P256,
                    alg::HKDF_SHA256,
                    alg::AES_GCM_256,
                    alg::HMAC_SHA256,
                ],
                [alg::NONE, alg::HKDF_SHA256, alg::AES_CCM_256, alg::NONE],
                [0; 4],
            ],
            key_bits: [256, 256, 512, 256, 128, 256, 256, 256],
            read_exp: 5,
            program_exp: 5,
            erase_exp: [12, 9, 0, 0],
            zone_count_exp: 2,
            zone_size_exp: 13,
            secure_table: true,
            unknown_table: true,
        }
    }
}

fn param_header(out: &mut [u8], id: u16, dwords: u8, ptp: usize) {
    out[0] = id as u8;
    out[1] = 0x00;
    out[2] = 0x01;
    out[3] = dwords;
    out[4..7].copy_from_slice(&(ptp as u32).to_le_bytes()[..3]);
    out[7] = (id >> 8) as u8;
}

impl SfdpImage {
    pub fn build(&self) -> Vec<u8> {
        let mut img = vec![0xff; IMAGE_SIZE];

        let mut headers: Vec<(u16, u8, usize)> =
            vec![(0xff00, 16, BASIC_TABLE_OFFSET)];
        if self.unknown_table {
            headers.push((0x0187, 2, UNKNOWN_TABLE_OFFSET));
        }
        if self.secure_table {
            headers.push((0xff14, 11, SECURE_TABLE_OFFSET));
        }

        img[0..4].copy_from_slice(&self.magic);
        img[4] = 0x06;
        img[5] = self.major;
        img[6] = (headers.len() - 1) as u8;
        img[7] = 0xff;
        for (i, &(id, dwords, ptp)) in headers.iter().enumerate() {
            let at = 8 + i * 8;
            param_header(&mut img[at..at + 8], id, dwords, ptp);
        }

        let basic = &mut img[BASIC_TABLE_OFFSET..BASIC_TABLE_OFFSET + 64];
        basic.fill(0);
        let bits = self.flash_size * 8;
        let density = if bits > 1 << 32 {
            0x8000_0000 | bits.trailing_zeros()
        } else {
            (bits - 1) as u32
        };
        basic[4..8].copy_from_slice(&density.to_le_bytes());

        img[UNKNOWN_TABLE_OFFSET..UNKNOWN_TABLE_OFFSET + 8].fill(0x5a);

        let t = &mut img[SECURE_TABLE_OFFSET..SECURE_TABLE_OFFSET + 44];
        t.fill(0);
        t[0] = self.features;
        for (i, s) in self.cipher_suites.iter().enumerate() {
            t[4 + i * 4..8 + i * 4].copy_from_slice(s);
        }
        for (i, b) in self.key_bits.iter().enumerate() {
            t[20 + i * 2..22 + i * 2].copy_from_slice(&b.to_le_bytes());
        }
        t[36] = self.read_exp;
        t[37] = self.program_exp;
        t[38..42].copy_from_slice(&self.erase_exp);
        t[42] = self.zone_count_exp;
        t[43] = self.zone_size_exp;

        img
    }

    pub fn zone_size(&self) -> u32 {
        1 << self.zone_size_exp
    }

    pub fn zone_count(&self) -> u32 {
        1 << self.zone_count_exp
    }

    pub fn erase_sizes(&self) -> impl Iterator<Item = u32> + '_ {
        self.erase_exp
            .iter()
            .take_while(|&&e| e != 0)
            .map(|&e| 1u32 << e)
    }
}
