// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for the MX75 ArmorFlash secure NOR part.
//!
//! Every secure operation is one request/response packet exchange (see
//! `drv-mx75-api`). Operations that need confidentiality or authentication
//! first make sure the host holds a device nonce: one is generated when the
//! host has none, and the held one is confirmed with the part before every
//! such packet. The nonce is reused across operations until the part
//! rejects it or key generation reseeds it.
//!
//! The AES-CCM IV for data in a zone includes that zone's monotonic counter,
//! the op and the address, so no two packets under a key share an IV while
//! the zone's contents stay put. The part bumps the counter on every
//! authenticated program or erase, so after each one the driver re-reads it;
//! skipping that would desynchronize every later IV for the zone.
//!
//! Keys live in the host crypto service under ids from
//! [`drv_mx75_api::host_key_id`]; the service is assumed to persist them
//! across resets the way a PSA key store does.

#![cfg_attr(not(test), no_std)]

use drv_mx75_api::sfpi::{self, KeyEntry};
use drv_mx75_api::{
    ccm_iv, erase_length, host_key_id, instruction, session_salt, Info, Op,
    RequestHeader,
    ResponseHeader, Status, HOST_SALT_LEN, KEY_LEN, MAX_REQUEST,
    MAX_RESPONSE_PAYLOAD, MC_COUNT, NONCE_LEN, PUF_LEN, ROOT_KEY_SLOTS,
    SESSION_KEY_SLOTS, TAG_LEN,
};
use drv_secure_flash_api::{
    alg, AeadAlgorithm, AppData, Architecture, CipherSuite, CryptoError,
    CryptoService, LockRegion, LockRequest, SecureFlashError,
    SecureFlashProfile, SecureFlashVendor, MAX_PROVISION_SIZE, MAX_SECURE_IO,
};
use drv_spi_nor::{Address, Command, SpiBus, SpiNor, SpiNorError};
use num_traits::FromPrimitive;
use ringbuf::{ringbuf, ringbuf_entry};
use zerocopy::{FromBytes, IntoBytes};
use zeroize::Zeroize;

pub mod provision;

use crate::provision::ProvisionInfo;

/// Scratch id for the key-transport wrapping key.
const WRAP_KEY_ID: u32 = drv_mx75_api::HOST_KEY_BASE | 0xff;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Status { op: u8, status: Status },
    NonceGenerated,
    NonceDirty,
    McRefreshed { mc_id: u8, value: u32 },
    AuthFailed { op: u8 },
    KeyInjected { key_id: u8, inject_type: u8 },
    ProvisionCommitted { size: u16, lock: u8 },
    ProvisionVerifyFailed,
    ProvisionLocked,
    Unprovisioned,
    SessionKey { root: u8, slot: u8 },
    LockDown { regions: u8, zones: u32 },
}

ringbuf!(Trace, 32, Trace::None);

/// Why a packet exchange failed. Callers fold this into the error for
/// their own operation with [`PacketError::or`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum PacketError {
    Bus(SecureFlashError),
    Status(Status),
}

impl From<SpiNorError> for PacketError {
    fn from(e: SpiNorError) -> Self {
        PacketError::Bus(e.into())
    }
}

impl From<SecureFlashError> for PacketError {
    fn from(e: SecureFlashError) -> Self {
        PacketError::Bus(e)
    }
}

impl From<CryptoError> for PacketError {
    fn from(_: CryptoError) -> Self {
        PacketError::Bus(SecureFlashError::Crypto)
    }
}

impl PacketError {
    /// Bus and busy errors pass through, and so does a lock refusal;
    /// anything the part or the crypto service rejected becomes `op`.
    fn or(self, op: SecureFlashError) -> SecureFlashError {
        match self {
            PacketError::Status(Status::Locked) => SecureFlashError::Locked,
            PacketError::Status(_) => op,
            PacketError::Bus(SecureFlashError::Crypto) => op,
            PacketError::Bus(e) => e,
        }
    }
}

fn rd_pkt(offset: u32) -> Command<'static> {
    Command::new(instruction::RD_PKT).with_address(Address::ThreeByte(offset))
}

pub struct Mx75<B, C> {
    nor: SpiNor<B>,
    crypto: C,
    packet: [u8; MAX_REQUEST],
    nonce: [u8; NONCE_LEN],
    nonce_valid: bool,
    /// Host mirror of the part's counters; `None` means "re-read first".
    mc: [Option<u32>; MC_COUNT as usize],
    arch: Architecture,
    info: Option<ProvisionInfo>,
}

impl<B: SpiBus, C: CryptoService> Mx75<B, C> {
    pub fn new(bus: B, crypto: C) -> Self {
        Self {
            nor: SpiNor::new(bus),
            crypto,
            packet: [0; MAX_REQUEST],
            nonce: [0; NONCE_LEN],
            nonce_valid: false,
            mc: [None; MC_COUNT as usize],
            arch: Architecture::default(),
            info: None,
        }
    }

    /// Gives back the bus and the crypto service, for a reset.
    pub fn into_parts(self) -> (B, C) {
        (self.nor.into_inner(), self.crypto)
    }

    pub fn crypto(&self) -> &C {
        &self.crypto
    }

    /// The host's cached copy of counter `mc_id`.
    pub fn cached_mc(&self, mc_id: u8) -> Option<u32> {
        self.mc.get(usize::from(mc_id)).copied().flatten()
    }

    fn exchange(
        &mut self,
        hdr: RequestHeader,
        payload: &[u8],
        out: &mut [u8],
    ) -> Result<usize, PacketError> {
        let n = RequestHeader::SIZE + payload.len();
        if usize::from(hdr.payload_len.get()) != payload.len()
            || n > self.packet.len()
        {
            return Err(SecureFlashError::InvalidArgument.into());
        }
        self.packet[..RequestHeader::SIZE].copy_from_slice(hdr.as_bytes());
        self.packet[RequestHeader::SIZE..n].copy_from_slice(payload);

        self.nor.send(&Command::new(instruction::RST_PKT))?;
        self.nor.write_enable()?;
        self.nor.send(
            &Command::new(instruction::WR_PKT).with_payload(&self.packet[..n]),
        )?;
        self.nor.wait_ready()?;

        let mut raw = [0; ResponseHeader::SIZE];
        self.nor.receive(&rd_pkt(0), &mut raw)?;
        let resp = ResponseHeader::read_from_bytes(&raw[..])
            .map_err(|_| SecureFlashError::Device)?;
        let status =
            Status::from_u8(resp.status).ok_or(SecureFlashError::Device)?;
        if status != Status::Ok {
            ringbuf_entry!(Trace::Status {
                op: hdr.op,
                status
            });
            if status == Status::NonceInvalid {
                self.nonce_valid = false;
                ringbuf_entry!(Trace::NonceDirty);
            }
            return Err(PacketError::Status(status));
        }

        let len = usize::from(resp.payload_len.get());
        let dest = out.get_mut(..len).ok_or(SecureFlashError::Device)?;
        if len > 0 {
            self.nor.receive(&rd_pkt(ResponseHeader::SIZE as u32), dest)?;
        }
        Ok(len)
    }

    /// Makes sure the host holds a nonce and that the part agrees with it.
    /// A rejected confirmation fails the current operation; the next one
    /// starts with a fresh nonce.
    fn ensure_nonce(&mut self) -> Result<(), PacketError> {
        if !self.nonce_valid {
            let mut nonce = [0; NONCE_LEN];
            let n = self.exchange(
                RequestHeader::new(Op::GenerateNonce),
                &[],
                &mut nonce,
            )?;
            if n != NONCE_LEN {
                return Err(SecureFlashError::Device.into());
            }
            self.nonce = nonce;
            self.nonce_valid = true;
            ringbuf_entry!(Trace::NonceGenerated);
        }
        let nonce = self.nonce;
        self.exchange(
            RequestHeader::new(Op::ConfirmNonce)
                .payload_len(NONCE_LEN as u16),
            &nonce,
            &mut [],
        )?;
        Ok(())
    }

    fn read_mc(&mut self, mc_id: u8) -> Result<u32, PacketError> {
        let mut v = [0; 4];
        let hdr = RequestHeader::new(Op::ReadMc).mc(mc_id);
        let n = self.exchange(hdr, &[], &mut v)?;
        if n != v.len() {
            return Err(SecureFlashError::Device.into());
        }
        let v = u32::from_le_bytes(v);
        self.mc[usize::from(mc_id)] = Some(v);
        Ok(v)
    }

    fn mc_value(&mut self, mc_id: u8) -> Result<u32, PacketError> {
        match self.cached_mc(mc_id) {
            Some(v) => Ok(v),
            None => self.read_mc(mc_id),
        }
    }

    /// Resynchronizes the mirror after the part bumped `mc_id`.
    fn refresh_mc(&mut self, mc_id: u8) -> Result<(), PacketError> {
        self.mc[usize::from(mc_id)] = None;
        let value = self.read_mc(mc_id)?;
        ringbuf_entry!(Trace::McRefreshed { mc_id, value });
        Ok(())
    }

    fn session_slot(
        &self,
        session_key_id: u32,
    ) -> Result<u8, SecureFlashError> {
        let slot = (session_key_id & 0xff) as u8;
        if host_key_id(slot) != session_key_id
            || !(ROOT_KEY_SLOTS..ROOT_KEY_SLOTS + SESSION_KEY_SLOTS)
                .contains(&slot)
            || !self.crypto.has_key(session_key_id)
        {
            return Err(SecureFlashError::SessionIdNotExist);
        }
        Ok(slot)
    }

    /// Counter linked to the zone containing `addr`.
    fn linked_mc(&self, addr: u32) -> Result<u8, SecureFlashError> {
        let info = self.info.as_ref().ok_or(SecureFlashError::Unprovisioned)?;
        let zone = self
            .arch
            .zone_of(addr)
            .ok_or(SecureFlashError::IllegalAccess)?;
        info.apps
            .iter()
            .find(|a| a.zone_id == zone)
            .map(|a| a.mc_id as u8)
            .ok_or(SecureFlashError::IllegalAccess)
    }

    fn aead_header(
        op: Op,
        slot: u8,
        mc_id: u8,
        addr: u32,
        length: u16,
    ) -> RequestHeader {
        RequestHeader::new(op)
            .key_slot(slot)
            .mc(mc_id)
            .mac()
            .addr(addr)
            .length(length)
    }

    fn do_read(
        &mut self,
        addr: u32,
        buf: &mut [u8],
        session_key_id: u32,
        slot: u8,
        mc_id: u8,
    ) -> Result<(), PacketError> {
        let len = buf.len();
        self.ensure_nonce()?;
        let mc = self.mc_value(mc_id)?;
        let hdr = Self::aead_header(
            Op::SecurityRead,
            slot,
            mc_id,
            addr,
            len as u16,
        );

        let mut resp = [0; MAX_SECURE_IO + TAG_LEN];
        let n = self.exchange(hdr, &[], &mut resp)?;
        if n != len + TAG_LEN {
            return Err(SecureFlashError::SecureRead.into());
        }
        let iv = ccm_iv(&self.nonce, mc, &hdr);
        let (data, tag) = resp[..n].split_at_mut(len);
        let mut t = [0; TAG_LEN];
        t.copy_from_slice(tag);
        let r = self.crypto.aead_decrypt(
            AeadAlgorithm::AesCcm256,
            session_key_id,
            &iv,
            hdr.as_bytes(),
            data,
            &t,
        );
        if r.is_ok() {
            buf.copy_from_slice(data);
        } else {
            ringbuf_entry!(Trace::AuthFailed { op: hdr.op });
        }
        resp.zeroize();
        Ok(r?)
    }

    fn do_write(
        &mut self,
        op: Op,
        addr: u32,
        data: &[u8],
        length: u16,
        session_key_id: u32,
        slot: u8,
        mc_id: u8,
    ) -> Result<(), PacketError> {
        self.ensure_nonce()?;
        let mc = self.mc_value(mc_id)?;
        let n = data.len() + TAG_LEN;
        let hdr = Self::aead_header(op, slot, mc_id, addr, length)
            .payload_len(n as u16);

        let mut payload = [0; MAX_SECURE_IO + TAG_LEN];
        payload[..data.len()].copy_from_slice(data);
        let iv = ccm_iv(&self.nonce, mc, &hdr);
        let mut tag = [0; TAG_LEN];
        let (body, rest) = payload.split_at_mut(data.len());
        self.crypto.aead_encrypt(
            AeadAlgorithm::AesCcm256,
            session_key_id,
            &iv,
            hdr.as_bytes(),
            body,
            &mut tag,
        )?;
        rest[..TAG_LEN].copy_from_slice(&tag);

        let r = self.exchange(hdr, &payload[..n], &mut []);
        payload.zeroize();
        r?;
        self.refresh_mc(mc_id)
    }

    fn load_wrap_key(&mut self, slot: u8) -> Result<(), CryptoError> {
        let mut wrap = [0; KEY_LEN];
        self.crypto
            .hkdf(&self.nonce, &[], Info::wrap(slot).as_bytes(), &mut wrap)?;
        if self.crypto.has_key(WRAP_KEY_ID) {
            self.crypto.destroy_key(WRAP_KEY_ID)?;
        }
        let r = self.crypto.import_key(WRAP_KEY_ID, &wrap);
        wrap.zeroize();
        r
    }

    fn replace_host_key(
        &mut self,
        id: u32,
        material: &[u8],
    ) -> Result<(), CryptoError> {
        if self.crypto.has_key(id) {
            self.crypto.destroy_key(id)?;
        }
        self.crypto.import_key(id, material)
    }

    fn inject_key(&mut self, key: &KeyEntry) -> Result<(), PacketError> {
        let slot = key.key_id;
        let host_id = host_key_id(slot);
        match key.inject_type {
            sfpi::inject::IMPORT => {
                let mut material = [0; KEY_LEN];
                self.crypto.hkdf(
                    &key.material,
                    &[],
                    Info::import(slot).as_bytes(),
                    &mut material,
                )?;
                self.ensure_nonce()?;
                self.load_wrap_key(slot)?;
                let hdr = RequestHeader::new(Op::ImportKey)
                    .key_slot(slot)
                    .payload_len((KEY_LEN + TAG_LEN) as u16);
                let mut payload = [0; KEY_LEN + TAG_LEN];
                payload[..KEY_LEN].copy_from_slice(&material);
                let mut tag = [0; TAG_LEN];
                self.crypto.aead_encrypt(
                    AeadAlgorithm::AesCcm256,
                    WRAP_KEY_ID,
                    &ccm_iv(&self.nonce, 0, &hdr),
                    hdr.as_bytes(),
                    &mut payload[..KEY_LEN],
                    &mut tag,
                )?;
                payload[KEY_LEN..].copy_from_slice(&tag);
                let r = self
                    .exchange(hdr, &payload, &mut [])
                    .and_then(|_| {
                        Ok(self.replace_host_key(host_id, &material)?)
                    });
                material.zeroize();
                r?;
            }
            sfpi::inject::GENERATE => {
                self.ensure_nonce()?;
                self.load_wrap_key(slot)?;
                let hdr = RequestHeader::new(Op::GenerateKey).key_slot(slot);
                let mut resp = [0; KEY_LEN + TAG_LEN];
                let n = self.exchange(hdr, &[], &mut resp)?;
                // The part reseeds its nonce whenever it generates a key.
                self.nonce_valid = false;
                ringbuf_entry!(Trace::NonceDirty);
                if n != resp.len() {
                    return Err(SecureFlashError::KeyProvision.into());
                }
                let (material, tag) = resp.split_at_mut(KEY_LEN);
                let mut t = [0; TAG_LEN];
                t.copy_from_slice(tag);
                let r = self
                    .crypto
                    .aead_decrypt(
                        AeadAlgorithm::AesCcm256,
                        WRAP_KEY_ID,
                        &ccm_iv(&self.nonce, 0, &hdr),
                        hdr.as_bytes(),
                        material,
                        &t,
                    )
                    .and_then(|()| self.replace_host_key(host_id, material));
                resp.zeroize();
                r?;
            }
            sfpi::inject::DERIVE => {
                let base = host_key_id(key.derive_from);
                if !self.crypto.has_key(base) {
                    return Err(SecureFlashError::KeyProvision.into());
                }
                let hdr = RequestHeader::new(Op::DeriveKey)
                    .key_slot(slot)
                    .payload_len(1 + key.material.len() as u16);
                let mut payload = [0; 1 + KEY_LEN];
                payload[0] = key.derive_from;
                payload[1..].copy_from_slice(&key.material);
                self.exchange(hdr, &payload, &mut [])?;
                if self.crypto.has_key(host_id) {
                    self.crypto.destroy_key(host_id)?;
                }
                self.crypto.derive_key(
                    base,
                    &key.material,
                    Info::derive(slot).as_bytes(),
                    host_id,
                    KEY_LEN,
                )?;
            }
            _ => return Err(SecureFlashError::KeyProvision.into()),
        }
        if self.crypto.has_key(WRAP_KEY_ID) {
            self.crypto.destroy_key(WRAP_KEY_ID)?;
        }
        ringbuf_entry!(Trace::KeyInjected {
            key_id: slot,
            inject_type: key.inject_type
        });
        Ok(())
    }

    fn read_provision_raw(
        &mut self,
        out: &mut [u8],
    ) -> Result<(), PacketError> {
        let hdr =
            RequestHeader::new(Op::ReadProvision).length(out.len() as u16);
        let n = self.exchange(hdr, &[], out)?;
        if n != out.len() {
            return Err(SecureFlashError::ReadProvision.into());
        }
        Ok(())
    }

    /// Reads the committed image into `area`, returning its size, or `None`
    /// for a blank part.
    fn read_committed(
        &mut self,
        area: &mut [u8; MAX_PROVISION_SIZE],
    ) -> Result<Option<usize>, SecureFlashError> {
        let header = sfpi::MajorHeader::SIZE;
        self.read_provision_raw(&mut area[..header])
            .map_err(|e| e.or(SecureFlashError::ReadProvision))?;
        if area[..4] != sfpi::MAGIC {
            return Ok(None);
        }
        let total = usize::from(u16::from_le_bytes([area[5], area[6]]));
        if total < header || total > MAX_PROVISION_SIZE {
            return Err(SecureFlashError::ReadProvision);
        }
        self.read_provision_raw(&mut area[..total])
            .map_err(|e| e.or(SecureFlashError::ReadProvision))?;
        Ok(Some(total))
    }

    fn load_committed(
        &mut self,
    ) -> Result<Option<ProvisionInfo>, SecureFlashError> {
        let mut area = [0; MAX_PROVISION_SIZE];
        let Some(total) = self.read_committed(&mut area)? else {
            return Ok(None);
        };
        let image = provision::parse(&area[..total])
            .map_err(|_| SecureFlashError::ReadProvision)?;
        Ok(Some(ProvisionInfo::from_image(&image)?))
    }

    fn committed_lock(&mut self) -> Result<u8, SecureFlashError> {
        if let Some(info) = &self.info {
            return Ok(info.lock);
        }
        Ok(self.load_committed()?.map(|i| i.lock).unwrap_or(0))
    }

    fn apply_provision(
        &mut self,
        image: &provision::Image<'_>,
        lock: u8,
    ) -> Result<ProvisionInfo, PacketError> {
        for key in image.keys() {
            self.inject_key(&key)
                .map_err(|e| e.or(SecureFlashError::KeyProvision))?;
        }
        for mc in image.mcs() {
            let initial = mc.initial.get().to_le_bytes();
            self.exchange(
                RequestHeader::new(Op::SeedMc).mc(mc.mc_id).payload_len(4),
                &initial,
                &mut [],
            )?;
            self.mc[usize::from(mc.mc_id)] = None;
        }
        if let Some(config) = image.config() {
            let hdr = RequestHeader::new(Op::WriteConfig)
                .payload_len(config.len() as u16);
            self.exchange(hdr, config, &mut [])?;
        }

        let mut compact = [0; MAX_PROVISION_SIZE];
        let n = image.compact(lock, &mut compact)?;
        let hdr = RequestHeader::new(Op::WriteProvision)
            .length(n as u16)
            .payload_len(n as u16);
        self.exchange(hdr, &compact[..n], &mut [])?;

        let mut back = [0; MAX_PROVISION_SIZE];
        self.read_provision_raw(&mut back[..n])?;
        if back[..n] != compact[..n] {
            ringbuf_entry!(Trace::ProvisionVerifyFailed);
            return Err(SecureFlashError::WriteProvision.into());
        }
        let image = provision::parse(&compact[..n])?;
        let info = ProvisionInfo::from_image(&image)?;
        ringbuf_entry!(Trace::ProvisionCommitted {
            size: n as u16,
            lock
        });
        Ok(info)
    }

    fn check_lock_request(
        &self,
        lock: &LockRequest,
    ) -> Result<(), SecureFlashError> {
        if lock.regions.is_empty()
            || lock.regions.contains(LockRegion::ZONE) != (lock.zones != 0)
        {
            return Err(SecureFlashError::InvalidArgument);
        }
        let zones = self.arch.zone_number;
        if zones < 32 && lock.zones >> zones != 0 {
            return Err(SecureFlashError::InvalidArgument);
        }
        Ok(())
    }

    fn do_lock_down(&mut self, lock: &LockRequest) -> Result<(), PacketError> {
        let hdr = RequestHeader::new(Op::LockDown)
            .addr(lock.zones)
            .length(u16::from(lock.regions.bits()));
        match lock.session_key_id {
            Some(sk) => {
                let slot = self.session_slot(sk)?;
                self.ensure_nonce()?;
                let hdr = hdr.key_slot(slot).mac().payload_len(TAG_LEN as u16);
                let mut tag = [0; TAG_LEN];
                self.crypto.aead_encrypt(
                    AeadAlgorithm::AesCcm256,
                    sk,
                    &ccm_iv(&self.nonce, 0, &hdr),
                    hdr.as_bytes(),
                    &mut [],
                    &mut tag,
                )?;
                self.exchange(hdr, &tag, &mut [])?;
            }
            None => {
                self.exchange(hdr, &[], &mut [])?;
            }
        }
        Ok(())
    }

    fn trng(&mut self, out: &mut [u8]) -> Result<(), PacketError> {
        for chunk in out.chunks_mut(MAX_RESPONSE_PAYLOAD) {
            let hdr =
                RequestHeader::new(Op::GetTrng).length(chunk.len() as u16);
            let n = self.exchange(hdr, &[], chunk)?;
            if n != chunk.len() {
                return Err(SecureFlashError::GetTrng.into());
            }
        }
        Ok(())
    }
}

impl<B: SpiBus, C: CryptoService> SecureFlashVendor for Mx75<B, C> {
    fn name(&self) -> &'static str {
        "MX75 ArmorFlash"
    }

    fn read_sfdp(
        &mut self,
        addr: u32,
        buf: &mut [u8],
    ) -> Result<(), SecureFlashError> {
        Ok(self.nor.read_sfdp(addr, buf)?)
    }

    fn check_algorithm_support(&self, suite: &CipherSuite) -> bool {
        suite.key_exchange == alg::NONE
            && suite.key_derive == alg::HKDF_SHA256
            && suite.encryption == alg::AES_CCM_256
            && suite.signature == alg::NONE
    }

    fn init(
        &mut self,
        profile: &SecureFlashProfile,
    ) -> Result<(), SecureFlashError> {
        self.arch = profile.architecture;
        self.nonce_valid = false;
        self.mc = [None; MC_COUNT as usize];

        let Some(info) = self.load_committed()? else {
            ringbuf_entry!(Trace::Unprovisioned);
            return Err(SecureFlashError::Unprovisioned);
        };
        for app in &info.apps {
            self.read_mc(app.mc_id as u8)
                .map_err(|e| e.or(SecureFlashError::GetMc))?;
        }
        self.info = Some(info);
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), SecureFlashError> {
        self.info = None;
        self.nonce_valid = false;
        self.nonce.zeroize();
        self.mc = [None; MC_COUNT as usize];
        Ok(())
    }

    fn write_provision(&mut self, blob: &[u8]) -> Result<(), SecureFlashError> {
        let image = provision::parse(blob)?;
        if self.arch.zone_number != 0
            && image
                .apps()
                .any(|a| u32::from(a.zone_id) >= self.arch.zone_number)
        {
            return Err(SecureFlashError::WriteProvision);
        }

        let committed = self.committed_lock()?;
        if committed & sfpi::lock::WRITE != 0 {
            ringbuf_entry!(Trace::ProvisionLocked);
            return Err(SecureFlashError::Locked);
        }
        let lock = committed | image.lock();

        let info = self
            .apply_provision(&image, lock)
            .map_err(|e| e.or(SecureFlashError::WriteProvision))?;
        if lock & sfpi::lock::PROVISION != 0 {
            self.lock_down(&LockRequest {
                regions: LockRegion::CONFIG | LockRegion::KEY,
                ..Default::default()
            })?;
        }
        self.info = Some(info);
        Ok(())
    }

    fn read_provision(
        &mut self,
        buf: &mut [u8],
    ) -> Result<usize, SecureFlashError> {
        let mut area = [0; MAX_PROVISION_SIZE];
        let total = self
            .read_committed(&mut area)?
            .ok_or(SecureFlashError::Unprovisioned)?;
        let image = provision::parse(&area[..total])
            .map_err(|_| SecureFlashError::ReadProvision)?;
        if image.lock() & sfpi::lock::READ != 0 {
            return Err(SecureFlashError::Locked);
        }
        buf.get_mut(..total)
            .ok_or(SecureFlashError::InvalidArgument)?
            .copy_from_slice(&area[..total]);
        Ok(total)
    }

    fn app_data(&self) -> &[AppData] {
        match &self.info {
            Some(info) => info.apps.as_slice(),
            None => &[],
        }
    }

    fn create_session(&mut self, key_id: u32) -> Result<u32, SecureFlashError> {
        let root = u8::try_from(key_id)
            .ok()
            .filter(|&k| k < ROOT_KEY_SLOTS)
            .ok_or(SecureFlashError::InvalidArgument)?;
        let root_host = host_key_id(root);
        if !self.crypto.has_key(root_host) {
            return Err(SecureFlashError::KeyProvision);
        }

        let r = (|| -> Result<u32, PacketError> {
            self.ensure_nonce()?;
            let mut host_salt = [0; HOST_SALT_LEN];
            self.crypto.generate_random(&mut host_salt)?;
            let hdr = RequestHeader::new(Op::SessionKeyDerive)
                .key_slot(root)
                .payload_len(HOST_SALT_LEN as u16);
            let mut slot = [0; 1];
            if self.exchange(hdr, &host_salt, &mut slot)? != 1 {
                return Err(SecureFlashError::Device.into());
            }
            let slot = slot[0];
            let id = host_key_id(slot);
            if !(ROOT_KEY_SLOTS..ROOT_KEY_SLOTS + SESSION_KEY_SLOTS)
                .contains(&slot)
            {
                return Err(SecureFlashError::Device.into());
            }
            if self.crypto.has_key(id) {
                self.crypto.destroy_key(id)?;
            }
            self.crypto.derive_key(
                root_host,
                &session_salt(&host_salt, &self.nonce),
                Info::session(slot).as_bytes(),
                id,
                KEY_LEN,
            )?;
            ringbuf_entry!(Trace::SessionKey { root, slot });
            Ok(id)
        })();
        r.map_err(|e| e.or(SecureFlashError::SessionExhaust))
    }

    fn close_session(
        &mut self,
        session_key_id: u32,
    ) -> Result<(), SecureFlashError> {
        let slot = self.session_slot(session_key_id)?;
        let hdr = RequestHeader::new(Op::SessionKeyDestroy).key_slot(slot);
        let r = self.exchange(hdr, &[], &mut []);
        // The host copy goes regardless; a key the part lost is useless.
        self.crypto.destroy_key(session_key_id)?;
        r.map(|_| ())
            .map_err(|e| e.or(SecureFlashError::SessionIdNotExist))
    }

    fn secure_read(
        &mut self,
        addr: u32,
        buf: &mut [u8],
        session_key_id: u32,
    ) -> Result<(), SecureFlashError> {
        if buf.is_empty() || buf.len() > MAX_SECURE_IO {
            return Err(SecureFlashError::InvalidArgument);
        }
        let slot = self.session_slot(session_key_id)?;
        let mc_id = self.linked_mc(addr)?;
        self.do_read(addr, buf, session_key_id, slot, mc_id)
            .map_err(|e| e.or(SecureFlashError::SecureRead))
    }

    fn secure_program(
        &mut self,
        addr: u32,
        data: &[u8],
        session_key_id: u32,
    ) -> Result<(), SecureFlashError> {
        if data.is_empty() || data.len() > MAX_SECURE_IO {
            return Err(SecureFlashError::InvalidArgument);
        }
        let slot = self.session_slot(session_key_id)?;
        let mc_id = self.linked_mc(addr)?;
        self.do_write(
            Op::SecurityProgram,
            addr,
            data,
            data.len() as u16,
            session_key_id,
            slot,
            mc_id,
        )
        .map_err(|e| e.or(SecureFlashError::SecureProgram))
    }

    fn secure_erase(
        &mut self,
        addr: u32,
        size: u32,
        session_key_id: u32,
    ) -> Result<(), SecureFlashError> {
        let length =
            erase_length(size).ok_or(SecureFlashError::InvalidArgument)?;
        let slot = self.session_slot(session_key_id)?;
        let mc_id = self.linked_mc(addr)?;
        self.do_write(
            Op::SecurityErase,
            addr,
            &[],
            length,
            session_key_id,
            slot,
            mc_id,
        )
        .map_err(|e| e.or(SecureFlashError::SecureErase))
    }

    fn lock_down(
        &mut self,
        lock: &LockRequest,
    ) -> Result<(), SecureFlashError> {
        self.check_lock_request(lock)?;
        ringbuf_entry!(Trace::LockDown {
            regions: lock.regions.bits(),
            zones: lock.zones
        });
        self.do_lock_down(lock)
            .map_err(|e| e.or(SecureFlashError::LockDown))
    }

    fn get_puf(
        &mut self,
        info: &[u8],
        out: &mut [u8],
    ) -> Result<(), SecureFlashError> {
        if out.is_empty() {
            return Err(SecureFlashError::InvalidArgument);
        }
        let mut puf = [0; PUF_LEN];
        let r = (|| -> Result<(), PacketError> {
            let n =
                self.exchange(RequestHeader::new(Op::GetPuf), &[], &mut puf)?;
            if n != PUF_LEN {
                return Err(SecureFlashError::GetPuf.into());
            }
            let mut salt = [0; 32];
            self.trng(&mut salt)?;
            self.crypto.hkdf(&puf, &salt, info, out)?;
            Ok(())
        })();
        puf.zeroize();
        r.map_err(|e| e.or(SecureFlashError::GetPuf))
    }

    fn get_trng(&mut self, out: &mut [u8]) -> Result<(), SecureFlashError> {
        self.trng(out).map_err(|e| e.or(SecureFlashError::GetTrng))
    }

    fn get_mc(
        &mut self,
        mc_id: u32,
        out: &mut [u8],
    ) -> Result<usize, SecureFlashError> {
        let id = u8::try_from(mc_id)
            .ok()
            .filter(|&i| i < MC_COUNT)
            .ok_or(SecureFlashError::InvalidArgument)?;
        let dest = out.get_mut(..4).ok_or(SecureFlashError::InvalidArgument)?;
        let v = self
            .read_mc(id)
            .map_err(|e| e.or(SecureFlashError::GetMc))?;
        dest.copy_from_slice(&v.to_le_bytes());
        Ok(4)
    }

    fn increase_mc(&mut self, mc_id: u32) -> Result<(), SecureFlashError> {
        let id = u8::try_from(mc_id)
            .ok()
            .filter(|&i| i < MC_COUNT)
            .ok_or(SecureFlashError::InvalidArgument)?;
        let mut v = [0; 4];
        let n = self
            .exchange(RequestHeader::new(Op::IncreaseMc).mc(id), &[], &mut v)
            .map_err(|e| e.or(SecureFlashError::IncreaseMc))?;
        if n != v.len() {
            return Err(SecureFlashError::IncreaseMc);
        }
        self.mc[usize::from(id)] = Some(u32::from_le_bytes(v));
        Ok(())
    }
}
