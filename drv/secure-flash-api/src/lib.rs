// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared by the secure-flash common layer and its vendor drivers.
//!
//! The common layer (`drv-secure-flash`) is written against the
//! [`SecureFlashVendor`] trait defined here; each supported part provides
//! one implementation. Vendor drivers in turn consume a [`CryptoService`].

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;
use drv_spi_nor::SpiNorError;
use num_derive::FromPrimitive;

mod crypto;
mod profile;

pub use crate::crypto::{
    AeadAlgorithm, CipherAlgorithm, CryptoError, CryptoService, KeyId,
    TAG_LEN,
};
pub use crate::profile::{
    alg, Architecture, CipherSuite, KeySize, SecureFlashProfile,
    SecurityFeature, ERASE_SENTINEL, ERASE_TYPES, MAX_CIPHER_SUITES,
};

/// Number of concurrently open sessions.
pub const SESSION_SLOTS: usize = 4;

/// Largest native secure read/program unit the common layer will buffer.
pub const MAX_SECURE_IO: usize = 256;

/// Maximum number of application bindings carried in provisioning data.
pub const MAX_APPS: usize = 8;

/// Largest provisioning blob accepted.
pub const MAX_PROVISION_SIZE: usize = 512;

/// Errors produced by the secure-flash common layer and vendor drivers.
#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
pub enum SecureFlashError {
    /// SFDP missing, malformed, or without a secure flash table.
    Sfdp = 1,
    Unsupported,
    InvalidArgument,
    NotInitialized,
    /// The bus or the part failed.
    Device,
    /// The part stayed busy past the ready-poll bound.
    DeviceBusy,
    SecureRead,
    SecureProgram,
    SecureErase,
    SessionExhaust,
    SessionIdNotExist,
    /// Address is outside the zones bound to the calling application.
    IllegalAccess,
    Unprovisioned,
    WriteProvision,
    ReadProvision,
    /// A lock forbids the operation.
    Locked,
    LockDown,
    KeyProvision,
    GetPuf,
    GetTrng,
    GetMc,
    IncreaseMc,
    Crypto,
}

impl From<SecureFlashError> for u32 {
    fn from(e: SecureFlashError) -> Self {
        e as u32
    }
}

impl From<SpiNorError> for SecureFlashError {
    fn from(e: SpiNorError) -> Self {
        match e {
            SpiNorError::DeviceBusy => SecureFlashError::DeviceBusy,
            _ => SecureFlashError::Device,
        }
    }
}

impl From<CryptoError> for SecureFlashError {
    fn from(_: CryptoError) -> Self {
        SecureFlashError::Crypto
    }
}

/// One entry in the session pool. A slot is free when `session_id == 0`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SessionInfo {
    pub key_id: u32,
    pub session_key_id: u32,
    pub session_id: u32,
}

impl SessionInfo {
    pub fn is_free(&self) -> bool {
        self.session_id == 0
    }
}

/// Provisioned binding of an application to its zone, key and counter.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct AppData {
    pub app_id: u32,
    pub key_id: u32,
    pub zone_id: u32,
    pub mc_id: u32,
}

bitflags! {
    /// Device regions that can be locked down.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct LockRegion: u8 {
        const CONFIG = 1 << 0;
        const KEY = 1 << 1;
        const ZONE = 1 << 2;
    }
}

/// A lock-down request. Locks are irreversible.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LockRequest {
    pub regions: LockRegion,
    /// One bit per zone; only meaningful with [`LockRegion::ZONE`].
    pub zones: u32,
    /// When set, the request is authenticated with this session's key.
    pub session_key_id: Option<u32>,
}

/// The operations a secure flash part provides. The common layer owns
/// sessions and chunking; a vendor owns everything on the wire.
///
/// Addresses and lengths handed to `secure_read` and `secure_program` are
/// exactly one native unit, aligned; `secure_erase` receives one of the
/// advertised erase sizes, aligned.
pub trait SecureFlashVendor {
    /// Human-readable part name, for tracing.
    fn name(&self) -> &'static str;

    fn read_sfdp(
        &mut self,
        addr: u32,
        buf: &mut [u8],
    ) -> Result<(), SecureFlashError>;

    fn check_algorithm_support(&self, suite: &CipherSuite) -> bool;

    /// Brings the part up against `profile`, loading provisioning data.
    /// Fails with [`SecureFlashError::Unprovisioned`] on a blank part.
    fn init(
        &mut self,
        profile: &SecureFlashProfile,
    ) -> Result<(), SecureFlashError>;

    fn deinit(&mut self) -> Result<(), SecureFlashError>;

    fn write_provision(&mut self, blob: &[u8]) -> Result<(), SecureFlashError>;

    fn read_provision(
        &mut self,
        buf: &mut [u8],
    ) -> Result<usize, SecureFlashError>;

    /// Application bindings loaded at `init`.
    fn app_data(&self) -> &[AppData];

    /// Establishes a session key from root key `key_id`, returning the
    /// session key id.
    fn create_session(&mut self, key_id: u32) -> Result<u32, SecureFlashError>;

    fn close_session(
        &mut self,
        session_key_id: u32,
    ) -> Result<(), SecureFlashError>;

    fn secure_read(
        &mut self,
        addr: u32,
        buf: &mut [u8],
        session_key_id: u32,
    ) -> Result<(), SecureFlashError>;

    fn secure_program(
        &mut self,
        addr: u32,
        data: &[u8],
        session_key_id: u32,
    ) -> Result<(), SecureFlashError>;

    fn secure_erase(
        &mut self,
        addr: u32,
        size: u32,
        session_key_id: u32,
    ) -> Result<(), SecureFlashError>;

    fn lock_down(&mut self, lock: &LockRequest) -> Result<(), SecureFlashError>;

    /// Derives `out.len()` bytes from the part's PUF, bound to `info`.
    fn get_puf(
        &mut self,
        info: &[u8],
        out: &mut [u8],
    ) -> Result<(), SecureFlashError>;

    fn get_trng(&mut self, out: &mut [u8]) -> Result<(), SecureFlashError>;

    /// Reads monotonic counter `mc_id` into `out`, returning bytes written.
    fn get_mc(
        &mut self,
        mc_id: u32,
        out: &mut [u8],
    ) -> Result<usize, SecureFlashError>;

    fn increase_mc(&mut self, mc_id: u32) -> Result<(), SecureFlashError>;

    /// Value of an erased byte.
    fn erase_value(&self) -> u8 {
        0xff
    }
}
