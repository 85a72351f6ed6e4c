// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Software implementation of the secure-flash [`CryptoService`].
//!
//! Keys live in a small fixed table of zeroize-on-drop slots. Only
//! HKDF-SHA256 and AES-CCM-256 are implemented; the GCM and block-cipher
//! entry points answer [`CryptoError::NotSupported`].
//!
//! The two primitives are also exposed as free functions ([`hkdf_sha256`],
//! [`ccm_seal`], [`ccm_open`]) for code that holds raw key material, such as
//! the device side of a simulated part.

#![cfg_attr(not(test), no_std)]

use ccm::aead::consts::{U13, U16};
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{AeadInPlace, KeyInit};
use drv_secure_flash_api::{
    AeadAlgorithm, CipherAlgorithm, CryptoError, CryptoService, KeyId,
    TAG_LEN,
};
use hkdf::Hkdf;
use rand_core::{CryptoRng, RngCore};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256Ccm = ccm::Ccm<aes::Aes256, U16, U13>;

/// CCM nonce length used throughout the stack.
pub const CCM_NONCE_LEN: usize = 13;

/// Longest key the store will hold.
pub const MAX_KEY_LEN: usize = 32;

/// Number of key slots.
pub const KEY_SLOTS: usize = 16;

/// HKDF-SHA256 over raw material. An empty `salt` means no salt.
pub fn hkdf_sha256(
    ikm: &[u8],
    salt: &[u8],
    info: &[u8],
    out: &mut [u8],
) -> Result<(), CryptoError> {
    let salt = if salt.is_empty() { None } else { Some(salt) };
    Hkdf::<Sha256>::new(salt, ikm)
        .expand(info, out)
        .map_err(|_| CryptoError::InvalidLength)
}

fn ccm_cipher(key: &[u8], nonce: &[u8]) -> Result<Aes256Ccm, CryptoError> {
    if nonce.len() != CCM_NONCE_LEN {
        return Err(CryptoError::InvalidNonce);
    }
    Aes256Ccm::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)
}

/// AES-CCM-256 encrypt in place with a detached 16-byte tag.
pub fn ccm_seal(
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    buf: &mut [u8],
) -> Result<[u8; TAG_LEN], CryptoError> {
    let cipher = ccm_cipher(key, nonce)?;
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buf)
        .map_err(|_| CryptoError::InvalidLength)?;
    let mut out = [0; TAG_LEN];
    out.copy_from_slice(&tag);
    Ok(out)
}

/// AES-CCM-256 verify and decrypt in place. On failure `buf` is unchanged.
pub fn ccm_open(
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    buf: &mut [u8],
    tag: &[u8; TAG_LEN],
) -> Result<(), CryptoError> {
    let cipher = ccm_cipher(key, nonce)?;
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            aad,
            buf,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| CryptoError::Authentication)
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct KeySlot {
    id: KeyId,
    len: usize,
    material: [u8; MAX_KEY_LEN],
}

impl KeySlot {
    fn bytes(&self) -> &[u8] {
        &self.material[..self.len]
    }
}

/// A [`CryptoService`] backed by RAM key slots and a caller-supplied RNG.
pub struct SoftCrypto<R> {
    rng: R,
    slots: [Option<KeySlot>; KEY_SLOTS],
}

impl<R: RngCore + CryptoRng> SoftCrypto<R> {
    pub fn new(rng: R) -> Self {
        Self {
            rng,
            slots: Default::default(),
        }
    }

    fn find(&self, id: KeyId) -> Result<&KeySlot, CryptoError> {
        self.slots
            .iter()
            .flatten()
            .find(|s| s.id == id)
            .ok_or(CryptoError::KeyNotFound)
    }

    fn insert(
        &mut self,
        id: KeyId,
        material: &[u8],
    ) -> Result<(), CryptoError> {
        if material.is_empty() || material.len() > MAX_KEY_LEN {
            return Err(CryptoError::InvalidKey);
        }
        if self.has_key(id) {
            return Err(CryptoError::KeyExists);
        }
        let free = self
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(CryptoError::NoKeySlots)?;
        let mut slot = KeySlot {
            id,
            len: material.len(),
            material: [0; MAX_KEY_LEN],
        };
        slot.material[..material.len()].copy_from_slice(material);
        *free = Some(slot);
        Ok(())
    }
}

impl<R: RngCore + CryptoRng> CryptoService for SoftCrypto<R> {
    fn import_key(
        &mut self,
        id: KeyId,
        material: &[u8],
    ) -> Result<(), CryptoError> {
        self.insert(id, material)
    }

    fn export_key(
        &self,
        id: KeyId,
        out: &mut [u8],
    ) -> Result<usize, CryptoError> {
        let slot = self.find(id)?;
        let dest = out
            .get_mut(..slot.len)
            .ok_or(CryptoError::InvalidLength)?;
        dest.copy_from_slice(slot.bytes());
        Ok(slot.len)
    }

    fn has_key(&self, id: KeyId) -> bool {
        self.find(id).is_ok()
    }

    fn destroy_key(&mut self, id: KeyId) -> Result<(), CryptoError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| matches!(s, Some(k) if k.id == id))
            .ok_or(CryptoError::KeyNotFound)?;
        // Dropping the slot zeroizes it.
        *slot = None;
        Ok(())
    }

    fn derive_key(
        &mut self,
        base: KeyId,
        salt: &[u8],
        info: &[u8],
        out_id: KeyId,
        len: usize,
    ) -> Result<(), CryptoError> {
        if len == 0 || len > MAX_KEY_LEN {
            return Err(CryptoError::InvalidLength);
        }
        let mut okm = [0u8; MAX_KEY_LEN];
        let ikm = self.find(base)?.bytes();
        let r = hkdf_sha256(ikm, salt, info, &mut okm[..len])
            .and_then(|()| self.insert(out_id, &okm[..len]));
        okm.zeroize();
        r
    }

    fn hkdf(
        &self,
        ikm: &[u8],
        salt: &[u8],
        info: &[u8],
        out: &mut [u8],
    ) -> Result<(), CryptoError> {
        hkdf_sha256(ikm, salt, info, out)
    }

    fn aead_encrypt(
        &mut self,
        alg: AeadAlgorithm,
        key: KeyId,
        nonce: &[u8],
        aad: &[u8],
        buf: &mut [u8],
        tag: &mut [u8; TAG_LEN],
    ) -> Result<(), CryptoError> {
        match alg {
            AeadAlgorithm::AesCcm256 => {
                *tag = ccm_seal(self.find(key)?.bytes(), nonce, aad, buf)?;
                Ok(())
            }
            AeadAlgorithm::AesGcm256 => Err(CryptoError::NotSupported),
        }
    }

    fn aead_decrypt(
        &mut self,
        alg: AeadAlgorithm,
        key: KeyId,
        nonce: &[u8],
        aad: &[u8],
        buf: &mut [u8],
        tag: &[u8; TAG_LEN],
    ) -> Result<(), CryptoError> {
        match alg {
            AeadAlgorithm::AesCcm256 => {
                ccm_open(self.find(key)?.bytes(), nonce, aad, buf, tag)
            }
            AeadAlgorithm::AesGcm256 => Err(CryptoError::NotSupported),
        }
    }

    fn cipher_encrypt(
        &mut self,
        _alg: CipherAlgorithm,
        _key: KeyId,
        _iv: &[u8],
        _buf: &mut [u8],
    ) -> Result<(), CryptoError> {
        Err(CryptoError::NotSupported)
    }

    fn cipher_decrypt(
        &mut self,
        _alg: CipherAlgorithm,
        _key: KeyId,
        _iv: &[u8],
        _buf: &mut [u8],
    ) -> Result<(), CryptoError> {
        Err(CryptoError::NotSupported)
    }

    fn generate_random(&mut self, out: &mut [u8]) -> Result<(), CryptoError> {
        self.rng.try_fill_bytes(out).map_err(|_| CryptoError::Rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    fn crypto() -> SoftCrypto<ChaCha20Rng> {
        SoftCrypto::new(ChaCha20Rng::seed_from_u64(7))
    }

    #[test]
    fn key_table_lifecycle() {
        let mut c = crypto();
        c.import_key(1, &[0x11; 32]).unwrap();
        assert!(c.has_key(1));
        assert_eq!(c.import_key(1, &[0; 32]), Err(CryptoError::KeyExists));

        let mut out = [0; 32];
        assert_eq!(c.export_key(1, &mut out), Ok(32));
        assert_eq!(out, [0x11; 32]);
        assert_eq!(
            c.export_key(1, &mut [0; 8]),
            Err(CryptoError::InvalidLength)
        );

        c.destroy_key(1).unwrap();
        assert!(!c.has_key(1));
        assert_eq!(c.destroy_key(1), Err(CryptoError::KeyNotFound));
    }

    #[test]
    fn table_fills_up() {
        let mut c = crypto();
        for id in 0..KEY_SLOTS as u32 {
            c.import_key(id, &[1; 16]).unwrap();
        }
        assert_eq!(c.import_key(99, &[1; 16]), Err(CryptoError::NoKeySlots));
    }

    #[test]
    fn derived_key_matches_free_function() {
        let mut c = crypto();
        c.import_key(1, &[0x22; 32]).unwrap();
        c.derive_key(1, b"salt", b"info", 2, 32).unwrap();

        let mut expected = [0; 32];
        hkdf_sha256(&[0x22; 32], b"salt", b"info", &mut expected).unwrap();
        let mut got = [0; 32];
        c.export_key(2, &mut got).unwrap();
        assert_eq!(got, expected);
        assert_ne!(got, [0x22; 32]);
    }

    #[test]
    fn ccm_round_trip_and_tamper() {
        let mut c = crypto();
        c.import_key(5, &[0x33; 32]).unwrap();
        let nonce = [9; CCM_NONCE_LEN];
        let mut buf = *b"sixteen byte msg";
        let mut tag = [0; TAG_LEN];
        const CCM: AeadAlgorithm = AeadAlgorithm::AesCcm256;
        c.aead_encrypt(CCM, 5, &nonce, b"hdr", &mut buf, &mut tag)
            .unwrap();
        assert_ne!(&buf, b"sixteen byte msg");

        let sealed = buf;
        tag[0] ^= 1;
        assert_eq!(
            c.aead_decrypt(CCM, 5, &nonce, b"hdr", &mut buf, &tag),
            Err(CryptoError::Authentication)
        );
        assert_eq!(buf, sealed);

        tag[0] ^= 1;
        c.aead_decrypt(CCM, 5, &nonce, b"hdr", &mut buf, &tag)
            .unwrap();
        assert_eq!(&buf, b"sixteen byte msg");
    }

    #[test]
    fn unused_algorithms_are_stubs() {
        let mut c = crypto();
        c.import_key(5, &[0x33; 32]).unwrap();
        let mut tag = [0; TAG_LEN];
        assert_eq!(
            c.aead_encrypt(
                AeadAlgorithm::AesGcm256,
                5,
                &[0; 12],
                &[],
                &mut [],
                &mut tag,
            ),
            Err(CryptoError::NotSupported)
        );
        assert_eq!(
            c.cipher_encrypt(
                CipherAlgorithm::AesCbc256,
                5,
                &[0; 16],
                &mut [0; 16],
            ),
            Err(CryptoError::NotSupported)
        );
        assert_eq!(
            ccm_seal(&[0; 32], &[0; 12], &[], &mut []),
            Err(CryptoError::InvalidNonce)
        );
    }
}
