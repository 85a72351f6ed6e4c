// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire protocol for the MX75 ArmorFlash secure packet interface.
//!
//! Secure operations are not ordinary NOR instructions. The host resets the
//! part's packet buffer (`RST_PKT`), sets the write-enable latch, writes a
//! request packet (`WR_PKT`), waits for the part to finish, and then reads
//! the response packet back (`RD_PKT`) in two pieces: the fixed header and
//! then whatever payload the header announces.
//!
//! A request packet is a [`RequestHeader`] followed by an op-specific
//! payload. Authenticated payloads are AES-CCM-256 ciphertext followed by a
//! 16-byte tag, with the request header bytes as associated data and an IV
//! built by [`ccm_iv`].
//!
//! This crate is shared by the host driver and by the simulated part used in
//! tests, so both ends agree on every byte.

#![cfg_attr(not(test), no_std)]

use num_derive::FromPrimitive;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian as le;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub mod sfpi;

/// JEDEC ID reported by the part.
pub const JEDEC_ID: [u8; 3] = [0xc2, 0x29, 0x17];

pub mod instruction {
    /// Reset the packet buffer.
    pub const RST_PKT: u8 = 0x33;
    /// Write a request packet.
    pub const WR_PKT: u8 = 0x34;
    /// Read the response packet, from a 3-byte offset.
    pub const RD_PKT: u8 = 0x35;
}

pub const NONCE_LEN: usize = 16;
pub const HOST_SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
pub const PUF_LEN: usize = 32;
pub const TAG_LEN: usize = 16;
pub const IV_LEN: usize = 13;

/// Root keys occupy slots `0..ROOT_KEY_SLOTS`.
pub const ROOT_KEY_SLOTS: u8 = 4;
/// Session keys occupy the `SESSION_KEY_SLOTS` slots after the root keys.
pub const SESSION_KEY_SLOTS: u8 = 4;

/// Number of monotonic counters.
pub const MC_COUNT: u8 = 4;

/// Size of the part's provisioning area.
pub const PROVISION_AREA: usize = 512;

/// Largest request payload (one secure program unit plus tag, or a full
/// provisioning image).
pub const MAX_REQUEST_PAYLOAD: usize = 576;
/// Largest response payload.
pub const MAX_RESPONSE_PAYLOAD: usize = 576;

pub const MAX_REQUEST: usize = RequestHeader::SIZE + MAX_REQUEST_PAYLOAD;

/// Request header flag: the payload ends in a CCM tag.
pub const FLAG_MAC: u8 = 1 << 0;

/// Host-side key id space for keys mirrored into the crypto service.
pub const HOST_KEY_BASE: u32 = 0x4d58_0000;

pub fn host_key_id(slot: u8) -> u32 {
    HOST_KEY_BASE | u32::from(slot)
}

#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
#[repr(u8)]
pub enum Op {
    GenerateNonce = 0x01,
    ConfirmNonce = 0x02,
    ReadMc = 0x10,
    IncreaseMc = 0x11,
    SeedMc = 0x12,
    GetTrng = 0x18,
    GetPuf = 0x19,
    ImportKey = 0x20,
    GenerateKey = 0x21,
    DeriveKey = 0x22,
    SessionKeyDerive = 0x23,
    SessionKeyDestroy = 0x24,
    SecurityRead = 0x30,
    SecurityProgram = 0x31,
    SecurityErase = 0x32,
    WriteProvision = 0x40,
    ReadProvision = 0x41,
    WriteConfig = 0x42,
    LockDown = 0x50,
}

/// Response status byte.
#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    BadOp = 1,
    BadParam = 2,
    NonceInvalid = 3,
    AuthFailed = 4,
    Locked = 5,
    NoKey = 6,
    Failed = 7,
}

#[derive(
    Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct RequestHeader {
    pub op: u8,
    pub key_slot: u8,
    pub mc_id: u8,
    pub flags: u8,
    pub addr: le::U32,
    /// Bytes to read or program. For `SecurityErase`, see [`erase_length`].
    pub length: le::U16,
    pub payload_len: le::U16,
}

const_assert_eq!(core::mem::size_of::<RequestHeader>(), RequestHeader::SIZE);

impl RequestHeader {
    pub const SIZE: usize = 12;

    pub fn new(op: Op) -> Self {
        Self {
            op: op as u8,
            ..Default::default()
        }
    }

    pub fn key_slot(self, key_slot: u8) -> Self {
        Self { key_slot, ..self }
    }

    pub fn mc(self, mc_id: u8) -> Self {
        Self { mc_id, ..self }
    }

    pub fn mac(self) -> Self {
        Self {
            flags: self.flags | FLAG_MAC,
            ..self
        }
    }

    pub fn addr(self, addr: u32) -> Self {
        Self {
            addr: addr.into(),
            ..self
        }
    }

    pub fn length(self, length: u16) -> Self {
        Self {
            length: length.into(),
            ..self
        }
    }

    pub fn payload_len(self, payload_len: u16) -> Self {
        Self {
            payload_len: payload_len.into(),
            ..self
        }
    }

    pub fn has_mac(&self) -> bool {
        self.flags & FLAG_MAC != 0
    }
}

#[derive(
    Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct ResponseHeader {
    pub status: u8,
    pub reserved: u8,
    pub payload_len: le::U16,
}

const_assert_eq!(core::mem::size_of::<ResponseHeader>(), ResponseHeader::SIZE);

impl ResponseHeader {
    pub const SIZE: usize = 4;

    pub fn new(status: Status, payload_len: u16) -> Self {
        Self {
            status: status as u8,
            reserved: 0,
            payload_len: payload_len.into(),
        }
    }
}

/// IV for an authenticated packet: the first three nonce bytes, the linked
/// counter, the op, the address (both big-endian) and the key slot.
///
/// Reads don't move the counter and the nonce is reused, so the op and
/// address keep two packets under one key from sharing a keystream.
pub fn ccm_iv(
    nonce: &[u8; NONCE_LEN],
    mc: u32,
    hdr: &RequestHeader,
) -> [u8; IV_LEN] {
    let mut iv = [0; IV_LEN];
    iv[..3].copy_from_slice(&nonce[..3]);
    iv[3..7].copy_from_slice(&mc.to_be_bytes());
    iv[7] = hdr.op;
    iv[8..12].copy_from_slice(&hdr.addr.get().to_be_bytes());
    iv[12] = hdr.key_slot;
    iv
}

/// `length` of a `SecurityErase` request: the erase size as a power-of-two
/// exponent. `None` if `size` isn't a power of two.
pub fn erase_length(size: u32) -> Option<u16> {
    size.is_power_of_two().then(|| size.trailing_zeros() as u16)
}

/// Inverse of [`erase_length`].
pub fn erase_size(length: u16) -> Option<u32> {
    1u32.checked_shl(u32::from(length))
}

const SESSION_LABEL: &[u8] = b"mx75-session";
const DERIVE_LABEL: &[u8] = b"mx75-derive";
const IMPORT_LABEL: &[u8] = b"mx75-import";
const WRAP_LABEL: &[u8] = b"mx75-wrap";

/// Longest label plus the trailing id byte.
pub const MAX_INFO_LEN: usize = 13;

/// HKDF `info` for key derivation: a fixed label followed by one id byte.
#[derive(Copy, Clone, Debug)]
pub struct Info {
    buf: [u8; MAX_INFO_LEN],
    len: usize,
}

impl Info {
    fn new(label: &[u8], id: u8) -> Self {
        let mut buf = [0; MAX_INFO_LEN];
        buf[..label.len()].copy_from_slice(label);
        buf[label.len()] = id;
        Self {
            buf,
            len: label.len() + 1,
        }
    }

    /// Session key for `slot`.
    pub fn session(slot: u8) -> Self {
        Self::new(SESSION_LABEL, slot)
    }

    /// Root key derived inside the part.
    pub fn derive(key_id: u8) -> Self {
        Self::new(DERIVE_LABEL, key_id)
    }

    /// Root key computed on the host from a provisioning seed.
    pub fn import(key_id: u8) -> Self {
        Self::new(IMPORT_LABEL, key_id)
    }

    /// Key-wrapping key for key transport in `slot`.
    pub fn wrap(slot: u8) -> Self {
        Self::new(WRAP_LABEL, slot)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Salt for a session key: host salt then device nonce.
pub fn session_salt(
    host_salt: &[u8; HOST_SALT_LEN],
    nonce: &[u8; NONCE_LEN],
) -> [u8; HOST_SALT_LEN + NONCE_LEN] {
    let mut salt = [0; HOST_SALT_LEN + NONCE_LEN];
    salt[..HOST_SALT_LEN].copy_from_slice(host_salt);
    salt[HOST_SALT_LEN..].copy_from_slice(nonce);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_header_layout() {
        let h = RequestHeader::new(Op::SecurityProgram)
            .key_slot(5)
            .mc(2)
            .mac()
            .addr(0x0001_2340)
            .length(32)
            .payload_len(48);
        assert_eq!(
            h.as_bytes(),
            &[0x31, 5, 2, 1, 0x40, 0x23, 0x01, 0x00, 32, 0, 48, 0]
        );
        let back = RequestHeader::read_from_bytes(h.as_bytes()).unwrap();
        assert!(back.has_mac());
        assert_eq!(back.addr.get(), 0x0001_2340);
    }

    #[test]
    fn response_header_layout() {
        let h = ResponseHeader::new(Status::NonceInvalid, 0x0102);
        assert_eq!(h.as_bytes(), &[3, 0, 0x02, 0x01]);
    }

    #[test]
    fn iv_layout() {
        let nonce: [u8; NONCE_LEN] = core::array::from_fn(|i| i as u8);
        let hdr = RequestHeader::new(Op::SecurityRead)
            .key_slot(6)
            .addr(0x0001_0203);
        let iv = ccm_iv(&nonce, 0x0a0b_0c0d, &hdr);
        assert_eq!(
            iv,
            [0, 1, 2, 0x0a, 0x0b, 0x0c, 0x0d, 0x30, 0, 1, 2, 3, 6]
        );
    }

    #[test]
    fn iv_differs_by_address_and_op() {
        let nonce = [0x5a; NONCE_LEN];
        let read = RequestHeader::new(Op::SecurityRead).key_slot(4);
        let a = ccm_iv(&nonce, 7, &read);
        let b = ccm_iv(&nonce, 7, &read.addr(32));
        let program = RequestHeader {
            op: Op::SecurityProgram as u8,
            ..read
        };
        let c = ccm_iv(&nonce, 7, &program);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, ccm_iv(&nonce, 7, &read.length(32)));
    }

    #[test]
    fn erase_length_is_an_exponent() {
        assert_eq!(erase_length(512), Some(9));
        assert_eq!(erase_length(65536), Some(16));
        assert_eq!(erase_length(1 << 31), Some(31));
        assert_eq!(erase_length(3 * 512), None);
        assert_eq!(erase_length(0), None);
        assert_eq!(erase_size(16), Some(65536));
        assert_eq!(erase_size(32), None);
    }

    #[test]
    fn info_labels() {
        assert_eq!(Info::session(4).as_bytes(), b"mx75-session\x04");
        assert_eq!(Info::derive(1).as_bytes(), b"mx75-derive\x01");
        assert_eq!(host_key_id(7), 0x4d58_0007);
    }
}
