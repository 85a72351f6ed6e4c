// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The crypto service consumed by vendor drivers.
//!
//! Keys are addressed by a caller-chosen persistent [`KeyId`], in the manner
//! of a PSA key store; key material only leaves the store through
//! [`CryptoService::export_key`].

use num_derive::FromPrimitive;

pub type KeyId = u32;

/// Length of an AEAD tag.
pub const TAG_LEN: usize = 16;

#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
pub enum CryptoError {
    KeyNotFound = 1,
    KeyExists,
    NoKeySlots,
    InvalidKey,
    InvalidNonce,
    InvalidLength,
    /// Tag did not verify; the buffer has been left untouched.
    Authentication,
    NotSupported,
    Rng,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AeadAlgorithm {
    AesCcm256,
    AesGcm256,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CipherAlgorithm {
    AesEcb256,
    AesCbc256,
}

pub trait CryptoService {
    fn import_key(
        &mut self,
        id: KeyId,
        material: &[u8],
    ) -> Result<(), CryptoError>;

    fn export_key(&self, id: KeyId, out: &mut [u8])
        -> Result<usize, CryptoError>;

    /// Reports whether a key is present; the PSA `open_key` step.
    fn has_key(&self, id: KeyId) -> bool;

    fn destroy_key(&mut self, id: KeyId) -> Result<(), CryptoError>;

    /// HKDF-SHA256 from the key at `base` into a new key at `out_id`.
    fn derive_key(
        &mut self,
        base: KeyId,
        salt: &[u8],
        info: &[u8],
        out_id: KeyId,
        len: usize,
    ) -> Result<(), CryptoError>;

    /// HKDF-SHA256 over caller-held material; nothing enters the store.
    fn hkdf(
        &self,
        ikm: &[u8],
        salt: &[u8],
        info: &[u8],
        out: &mut [u8],
    ) -> Result<(), CryptoError>;

    /// Encrypts `buf` in place and writes the detached tag.
    fn aead_encrypt(
        &mut self,
        alg: AeadAlgorithm,
        key: KeyId,
        nonce: &[u8],
        aad: &[u8],
        buf: &mut [u8],
        tag: &mut [u8; TAG_LEN],
    ) -> Result<(), CryptoError>;

    /// Verifies `tag` and decrypts `buf` in place.
    fn aead_decrypt(
        &mut self,
        alg: AeadAlgorithm,
        key: KeyId,
        nonce: &[u8],
        aad: &[u8],
        buf: &mut [u8],
        tag: &[u8; TAG_LEN],
    ) -> Result<(), CryptoError>;

    fn cipher_encrypt(
        &mut self,
        alg: CipherAlgorithm,
        key: KeyId,
        iv: &[u8],
        buf: &mut [u8],
    ) -> Result<(), CryptoError>;

    fn cipher_decrypt(
        &mut self,
        alg: CipherAlgorithm,
        key: KeyId,
        iv: &[u8],
        buf: &mut [u8],
    ) -> Result<(), CryptoError>;

    fn generate_random(&mut self, out: &mut [u8]) -> Result<(), CryptoError>;
}
