// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated MX75 ArmorFlash part.
//!
//! [`MockMx75`] answers the standard NOR instructions and the secure packet
//! protocol from `drv-mx75-api` over the [`SpiBus`] trait, keeping its array,
//! keys, counters and provisioning area in memory. Handles are cheap clones
//! of one shared device, so a test can give one to the driver and keep
//! another to inspect the part or inject faults.

use std::cell::RefCell;
use std::rc::Rc;

use drv_mx75_api::{
    ccm_iv, erase_size, instruction, session_salt, Info, Op, RequestHeader,
    ResponseHeader, Status, HOST_SALT_LEN, KEY_LEN, MAX_RESPONSE_PAYLOAD,
    MC_COUNT, NONCE_LEN, PROVISION_AREA, PUF_LEN, ROOT_KEY_SLOTS,
    SESSION_KEY_SLOTS, TAG_LEN,
};
use drv_secure_flash_api::LockRegion;
use drv_secure_flash_crypto::{ccm_open, ccm_seal, hkdf_sha256};
use drv_spi_nor::{
    instruction as nor, SpiBus, SpiError, STATUS_WEL, STATUS_WIP,
};
use num_traits::FromPrimitive;
use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};
use zerocopy::{FromBytes, IntoBytes};

pub mod sfdp;
pub mod sfpi;

pub use crate::sfdp::SfdpImage;
pub use crate::sfpi::ProvisionBuilder;

type Key = [u8; KEY_LEN];

struct Device {
    flash: Vec<u8>,
    sfdp: Vec<u8>,
    zone_size: u32,
    erase_sizes: Vec<u32>,
    native_io: usize,

    wel: bool,
    busy_polls_per_packet: u32,
    busy_remaining: u32,
    stuck: bool,
    bus_fault: bool,

    request: Vec<u8>,
    response: Vec<u8>,
    packets: usize,

    nonce: Option<[u8; NONCE_LEN]>,
    root_keys: [Option<Key>; ROOT_KEY_SLOTS as usize],
    session_keys: [Option<Key>; SESSION_KEY_SLOTS as usize],
    mc: [u32; MC_COUNT as usize],
    puf: [u8; PUF_LEN],
    provision: Vec<u8>,
    config: Vec<u8>,
    locks: LockRegion,
    zone_locks: u32,
    tamper_next: bool,
    rng: ChaCha20Rng,
}

/// Outcome of one request packet: status and response payload.
type Reply = Result<Vec<u8>, Status>;

fn u24(b: &[u8]) -> usize {
    (usize::from(b[0]) << 16) | (usize::from(b[1]) << 8) | usize::from(b[2])
}

impl Device {
    fn new(image: &SfdpImage) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(0x4d58_3735);
        let mut puf = [0; PUF_LEN];
        rng.fill_bytes(&mut puf);
        Self {
            flash: vec![0xff; image.flash_size as usize],
            sfdp: image.build(),
            zone_size: image.zone_size(),
            erase_sizes: image.erase_sizes().collect(),
            native_io: 1 << image.read_exp,
            wel: false,
            busy_polls_per_packet: 2,
            busy_remaining: 0,
            stuck: false,
            bus_fault: false,
            request: vec![],
            response: vec![],
            packets: 0,
            nonce: None,
            root_keys: [None; ROOT_KEY_SLOTS as usize],
            session_keys: [None; SESSION_KEY_SLOTS as usize],
            mc: [0; MC_COUNT as usize],
            puf,
            provision: vec![0xff; PROVISION_AREA],
            config: vec![],
            locks: LockRegion::empty(),
            zone_locks: 0,
            tamper_next: false,
            rng,
        }
    }

    fn status(&mut self) -> u8 {
        let mut s = 0;
        if self.wel {
            s |= STATUS_WEL;
        }
        if self.stuck {
            s |= STATUS_WIP;
        } else if self.busy_remaining > 0 {
            self.busy_remaining -= 1;
            s |= STATUS_WIP;
        }
        s
    }

    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), SpiError> {
        if self.bus_fault {
            return Err(SpiError::Transfer);
        }
        let Some(&op) = tx.first() else {
            return Err(SpiError::Transfer);
        };
        match op {
            nor::READ_ID => {
                rx.fill(0);
                let n = rx.len().min(3);
                rx[..n].copy_from_slice(&drv_mx75_api::JEDEC_ID[..n]);
            }
            nor::READ_STATUS => {
                let s = self.status();
                rx.fill(s);
            }
            nor::WRITE_ENABLE => self.wel = true,
            nor::READ_SFDP => {
                let addr = u24(&tx[1..4]);
                for (i, b) in rx.iter_mut().enumerate() {
                    *b = self.sfdp.get(addr + i).copied().unwrap_or(0xff);
                }
            }
            instruction::RST_PKT => {
                self.request.clear();
                self.response.clear();
            }
            instruction::WR_PKT => {
                let reply = if self.wel {
                    self.request = tx[1..].to_vec();
                    self.packets += 1;
                    let req = self.request.clone();
                    self.handle(&req)
                } else {
                    Err(Status::Failed)
                };
                self.wel = false;
                self.busy_remaining = self.busy_polls_per_packet;
                self.response = match reply {
                    Ok(payload) => {
                        let mut r = ResponseHeader::new(
                            Status::Ok,
                            payload.len() as u16,
                        )
                        .as_bytes()
                        .to_vec();
                        r.extend(payload);
                        r
                    }
                    Err(s) => ResponseHeader::new(s, 0).as_bytes().to_vec(),
                };
            }
            instruction::RD_PKT => {
                let offset = u24(&tx[1..4]);
                for (i, b) in rx.iter_mut().enumerate() {
                    *b = self.response.get(offset + i).copied().unwrap_or(0xff);
                }
            }
            _ => rx.fill(0xff),
        }
        Ok(())
    }

    fn random<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0; N];
        self.rng.fill_bytes(&mut out);
        out
    }

    fn nonce(&self) -> Result<[u8; NONCE_LEN], Status> {
        self.nonce.ok_or(Status::NonceInvalid)
    }

    fn mc_index(&self, mc_id: u8) -> Result<usize, Status> {
        if mc_id < MC_COUNT {
            Ok(usize::from(mc_id))
        } else {
            Err(Status::BadParam)
        }
    }

    fn session_key(&self, slot: u8) -> Result<Key, Status> {
        slot.checked_sub(ROOT_KEY_SLOTS)
            .and_then(|i| self.session_keys.get(usize::from(i)))
            .copied()
            .flatten()
            .ok_or(Status::NoKey)
    }

    fn wrap_key(&self, slot: u8) -> Result<Key, Status> {
        let nonce = self.nonce()?;
        let mut k = [0; KEY_LEN];
        hkdf_sha256(&nonce, &[], Info::wrap(slot).as_bytes(), &mut k)
            .map_err(|_| Status::Failed)?;
        Ok(k)
    }

    fn keys_writable(&self, slot: u8) -> Result<usize, Status> {
        if self.locks.contains(LockRegion::KEY) {
            return Err(Status::Locked);
        }
        if slot >= ROOT_KEY_SLOTS {
            return Err(Status::BadParam);
        }
        Ok(usize::from(slot))
    }

    /// Checks that `[addr, addr + len)` is in the array and in one zone,
    /// returning the zone.
    fn zone_range(&self, addr: usize, len: usize) -> Result<u32, Status> {
        let end = addr.checked_add(len).ok_or(Status::BadParam)?;
        if len == 0 || end > self.flash.len() {
            return Err(Status::BadParam);
        }
        let zs = self.zone_size as usize;
        if addr / zs != (end - 1) / zs {
            return Err(Status::BadParam);
        }
        Ok((addr / zs) as u32)
    }

    fn handle(&mut self, req: &[u8]) -> Reply {
        let (hdr, rest) =
            RequestHeader::read_from_prefix(req).map_err(|_| Status::BadParam)?;
        let plen = usize::from(hdr.payload_len.get());
        let payload = rest.get(..plen).ok_or(Status::BadParam)?;
        let aad = &req[..RequestHeader::SIZE];
        let op = Op::from_u8(hdr.op).ok_or(Status::BadOp)?;
        let addr = hdr.addr.get() as usize;
        let len = usize::from(hdr.length.get());

        match op {
            Op::GenerateNonce => {
                let n = self.random::<NONCE_LEN>();
                self.nonce = Some(n);
                Ok(n.to_vec())
            }
            Op::ConfirmNonce => match self.nonce {
                Some(n) if n[..] == *payload => Ok(vec![]),
                _ => Err(Status::NonceInvalid),
            },
            Op::ReadMc => {
                let i = self.mc_index(hdr.mc_id)?;
                Ok(self.mc[i].to_le_bytes().to_vec())
            }
            Op::IncreaseMc => {
                let i = self.mc_index(hdr.mc_id)?;
                self.mc[i] = self.mc[i].checked_add(1).ok_or(Status::Failed)?;
                Ok(self.mc[i].to_le_bytes().to_vec())
            }
            Op::SeedMc => {
                if self.locks.contains(LockRegion::CONFIG) {
                    return Err(Status::Locked);
                }
                let i = self.mc_index(hdr.mc_id)?;
                let v: [u8; 4] =
                    payload.try_into().map_err(|_| Status::BadParam)?;
                let v = u32::from_le_bytes(v);
                if v < self.mc[i] {
                    return Err(Status::BadParam);
                }
                self.mc[i] = v;
                Ok(vec![])
            }
            Op::GetTrng => {
                if len > MAX_RESPONSE_PAYLOAD {
                    return Err(Status::BadParam);
                }
                let mut out = vec![0; len];
                self.rng.fill_bytes(&mut out);
                Ok(out)
            }
            Op::GetPuf => Ok(self.puf.to_vec()),
            Op::ImportKey => {
                let i = self.keys_writable(hdr.key_slot)?;
                if payload.len() != KEY_LEN + TAG_LEN {
                    return Err(Status::BadParam);
                }
                let wrap = self.wrap_key(hdr.key_slot)?;
                let iv = ccm_iv(&self.nonce()?, 0, &hdr);
                let mut key = [0; KEY_LEN];
                key.copy_from_slice(&payload[..KEY_LEN]);
                let mut tag = [0; TAG_LEN];
                tag.copy_from_slice(&payload[KEY_LEN..]);
                ccm_open(&wrap, &iv, aad, &mut key, &tag)
                    .map_err(|_| Status::AuthFailed)?;
                self.root_keys[i] = Some(key);
                Ok(vec![])
            }
            Op::GenerateKey => {
                let i = self.keys_writable(hdr.key_slot)?;
                let wrap = self.wrap_key(hdr.key_slot)?;
                let iv = ccm_iv(&self.nonce()?, 0, &hdr);
                let key = self.random::<KEY_LEN>();
                self.root_keys[i] = Some(key);
                let mut out = key.to_vec();
                let tag = ccm_seal(&wrap, &iv, aad, &mut out)
                    .map_err(|_| Status::Failed)?;
                out.extend_from_slice(&tag);
                // Key generation reseeds the nonce register.
                self.nonce = None;
                Ok(out)
            }
            Op::DeriveKey => {
                let i = self.keys_writable(hdr.key_slot)?;
                let (&from, salt) =
                    payload.split_first().ok_or(Status::BadParam)?;
                let base = self
                    .root_keys
                    .get(usize::from(from))
                    .copied()
                    .flatten()
                    .ok_or(Status::NoKey)?;
                let mut key = [0; KEY_LEN];
                hkdf_sha256(
                    &base,
                    salt,
                    Info::derive(hdr.key_slot).as_bytes(),
                    &mut key,
                )
                .map_err(|_| Status::Failed)?;
                self.root_keys[i] = Some(key);
                Ok(vec![])
            }
            Op::SessionKeyDerive => {
                let root = self
                    .root_keys
                    .get(usize::from(hdr.key_slot))
                    .copied()
                    .flatten()
                    .ok_or(Status::NoKey)?;
                let nonce = self.nonce()?;
                let host_salt: [u8; HOST_SALT_LEN] =
                    payload.try_into().map_err(|_| Status::BadParam)?;
                let free = self
                    .session_keys
                    .iter()
                    .position(|k| k.is_none())
                    .ok_or(Status::Failed)?;
                let slot = ROOT_KEY_SLOTS + free as u8;
                let mut key = [0; KEY_LEN];
                hkdf_sha256(
                    &root,
                    &session_salt(&host_salt, &nonce),
                    Info::session(slot).as_bytes(),
                    &mut key,
                )
                .map_err(|_| Status::Failed)?;
                self.session_keys[free] = Some(key);
                Ok(vec![slot])
            }
            Op::SessionKeyDestroy => {
                self.session_key(hdr.key_slot)?;
                self.session_keys[usize::from(hdr.key_slot - ROOT_KEY_SLOTS)] =
                    None;
                Ok(vec![])
            }
            Op::SecurityRead => {
                if len > self.native_io || addr % self.native_io != 0 {
                    return Err(Status::BadParam);
                }
                self.zone_range(addr, len)?;
                let key = self.session_key(hdr.key_slot)?;
                let i = self.mc_index(hdr.mc_id)?;
                let iv = ccm_iv(&self.nonce()?, self.mc[i], &hdr);
                let mut out = self.flash[addr..addr + len].to_vec();
                let mut tag = ccm_seal(&key, &iv, aad, &mut out)
                    .map_err(|_| Status::Failed)?;
                if self.tamper_next {
                    self.tamper_next = false;
                    tag[0] ^= 0x80;
                }
                out.extend_from_slice(&tag);
                Ok(out)
            }
            Op::SecurityProgram => {
                if len > self.native_io
                    || addr % self.native_io != 0
                    || payload.len() != len + TAG_LEN
                {
                    return Err(Status::BadParam);
                }
                let zone = self.zone_range(addr, len)?;
                if self.zone_locks & (1 << zone) != 0 {
                    return Err(Status::Locked);
                }
                let key = self.session_key(hdr.key_slot)?;
                let i = self.mc_index(hdr.mc_id)?;
                let iv = ccm_iv(&self.nonce()?, self.mc[i], &hdr);
                let mut data = payload[..len].to_vec();
                let mut tag = [0; TAG_LEN];
                tag.copy_from_slice(&payload[len..]);
                ccm_open(&key, &iv, aad, &mut data, &tag)
                    .map_err(|_| Status::AuthFailed)?;
                let cells = &mut self.flash[addr..addr + len];
                for (cell, b) in cells.iter_mut().zip(data) {
                    *cell &= b;
                }
                self.mc[i] = self.mc[i].wrapping_add(1);
                Ok(vec![])
            }
            Op::SecurityErase => {
                let len = erase_size(hdr.length.get())
                    .filter(|s| self.erase_sizes.contains(s))
                    .ok_or(Status::BadParam)? as usize;
                if addr % len != 0 || payload.len() != TAG_LEN {
                    return Err(Status::BadParam);
                }
                let zone = self.zone_range(addr, len)?;
                if self.zone_locks & (1 << zone) != 0 {
                    return Err(Status::Locked);
                }
                let key = self.session_key(hdr.key_slot)?;
                let i = self.mc_index(hdr.mc_id)?;
                let iv = ccm_iv(&self.nonce()?, self.mc[i], &hdr);
                let mut tag = [0; TAG_LEN];
                tag.copy_from_slice(payload);
                ccm_open(&key, &iv, aad, &mut [], &tag)
                    .map_err(|_| Status::AuthFailed)?;
                self.flash[addr..addr + len].fill(0xff);
                self.mc[i] = self.mc[i].wrapping_add(1);
                Ok(vec![])
            }
            Op::WriteProvision => {
                if self.locks.contains(LockRegion::CONFIG) {
                    return Err(Status::Locked);
                }
                if addr != 0 || payload.len() > PROVISION_AREA {
                    return Err(Status::BadParam);
                }
                self.provision.fill(0xff);
                self.provision[..payload.len()].copy_from_slice(payload);
                Ok(vec![])
            }
            Op::ReadProvision => {
                let end = addr.checked_add(len).ok_or(Status::BadParam)?;
                let area =
                    self.provision.get(addr..end).ok_or(Status::BadParam)?;
                Ok(area.to_vec())
            }
            Op::WriteConfig => {
                if self.locks.contains(LockRegion::CONFIG) {
                    return Err(Status::Locked);
                }
                self.config = payload.to_vec();
                Ok(vec![])
            }
            Op::LockDown => {
                let regions = LockRegion::from_bits(hdr.length.get() as u8)
                    .ok_or(Status::BadParam)?;
                if hdr.has_mac() {
                    let key = self.session_key(hdr.key_slot)?;
                    let iv = ccm_iv(&self.nonce()?, 0, &hdr);
                    let tag: [u8; TAG_LEN] =
                        payload.try_into().map_err(|_| Status::BadParam)?;
                    ccm_open(&key, &iv, aad, &mut [], &tag)
                        .map_err(|_| Status::AuthFailed)?;
                }
                self.locks |= regions;
                if regions.contains(LockRegion::ZONE) {
                    self.zone_locks |= hdr.addr.get();
                }
                Ok(vec![])
            }
        }
    }
}

/// A handle on the simulated part.
#[derive(Clone)]
pub struct MockMx75 {
    dev: Rc<RefCell<Device>>,
}

impl Default for MockMx75 {
    fn default() -> Self {
        Self::new(&SfdpImage::default())
    }
}

impl MockMx75 {
    pub fn new(image: &SfdpImage) -> Self {
        Self {
            dev: Rc::new(RefCell::new(Device::new(image))),
        }
    }

    /// Copy of the raw array.
    pub fn flash(&self) -> Vec<u8> {
        self.dev.borrow().flash.clone()
    }

    pub fn mc(&self, mc_id: u8) -> u32 {
        self.dev.borrow().mc[usize::from(mc_id)]
    }

    /// Bumps a counter behind the host's back.
    pub fn bump_mc(&self, mc_id: u8) {
        self.dev.borrow_mut().mc[usize::from(mc_id)] += 1;
    }

    pub fn puf(&self) -> [u8; PUF_LEN] {
        self.dev.borrow().puf
    }

    pub fn provision_area(&self) -> Vec<u8> {
        self.dev.borrow().provision.clone()
    }

    pub fn config(&self) -> Vec<u8> {
        self.dev.borrow().config.clone()
    }

    pub fn locks(&self) -> LockRegion {
        self.dev.borrow().locks
    }

    pub fn zone_locks(&self) -> u32 {
        self.dev.borrow().zone_locks
    }

    pub fn root_key(&self, slot: u8) -> Option<[u8; KEY_LEN]> {
        self.dev.borrow().root_keys[usize::from(slot)]
    }

    pub fn open_sessions(&self) -> usize {
        self.dev.borrow().session_keys.iter().flatten().count()
    }

    /// Number of request packets the part has accepted.
    pub fn packets(&self) -> usize {
        self.dev.borrow().packets
    }

    /// Status polls each packet stays busy for.
    pub fn set_busy_polls(&self, polls: u32) {
        self.dev.borrow_mut().busy_polls_per_packet = polls;
    }

    /// Leaves WIP set forever.
    pub fn set_stuck(&self, stuck: bool) {
        self.dev.borrow_mut().stuck = stuck;
    }

    /// Fails every transfer at the controller.
    pub fn set_bus_fault(&self, fault: bool) {
        self.dev.borrow_mut().bus_fault = fault;
    }

    /// Corrupts the tag of the next secure read response.
    pub fn tamper_next_read(&self) {
        self.dev.borrow_mut().tamper_next = true;
    }

    /// Forgets the current nonce, as the part does on its own schedule.
    pub fn drop_nonce(&self) {
        self.dev.borrow_mut().nonce = None;
    }

    /// Loses volatile state: nonce, session keys, latches, packet buffers.
    pub fn power_cycle(&self) {
        let mut d = self.dev.borrow_mut();
        d.nonce = None;
        d.session_keys = [None; SESSION_KEY_SLOTS as usize];
        d.wel = false;
        d.busy_remaining = 0;
        d.request.clear();
        d.response.clear();
    }
}

impl SpiBus for MockMx75 {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), SpiError> {
        self.dev.borrow_mut().transfer(tx, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_spi_nor::{Address, Command, SpiNor};

    fn packet(nor: &mut SpiNor<MockMx75>, req: &[u8]) -> (u8, Vec<u8>) {
        nor.send(&Command::new(instruction::RST_PKT)).unwrap();
        nor.write_enable().unwrap();
        nor.send(&Command::new(instruction::WR_PKT).with_payload(req))
            .unwrap();
        nor.wait_ready().unwrap();
        let mut hdr = [0; ResponseHeader::SIZE];
        let rd = |off| {
            Command::new(instruction::RD_PKT)
                .with_address(Address::ThreeByte(off))
        };
        nor.receive(&rd(0), &mut hdr).unwrap();
        let hdr = ResponseHeader::read_from_bytes(&hdr[..]).unwrap();
        let mut body = vec![0; usize::from(hdr.payload_len.get())];
        nor.receive(&rd(ResponseHeader::SIZE as u32), &mut body).unwrap();
        (hdr.status, body)
    }

    #[test]
    fn nonce_generate_and_confirm() {
        let dev = MockMx75::default();
        let mut nor = SpiNor::new(dev.clone());
        let (s, nonce) =
            packet(&mut nor, RequestHeader::new(Op::GenerateNonce).as_bytes());
        assert_eq!(s, Status::Ok as u8);
        assert_eq!(nonce.len(), NONCE_LEN);

        let mut req = RequestHeader::new(Op::ConfirmNonce)
            .payload_len(NONCE_LEN as u16)
            .as_bytes()
            .to_vec();
        req.extend_from_slice(&nonce);
        assert_eq!(packet(&mut nor, &req).0, Status::Ok as u8);

        dev.drop_nonce();
        assert_eq!(packet(&mut nor, &req).0, Status::NonceInvalid as u8);
    }

    #[test]
    fn packet_without_wren_fails() {
        let dev = MockMx75::default();
        let mut nor = SpiNor::new(dev.clone());
        nor.send(
            &Command::new(instruction::WR_PKT)
                .with_payload(RequestHeader::new(Op::GetPuf).as_bytes()),
        )
        .unwrap();
        let mut hdr = [0; ResponseHeader::SIZE];
        nor.receive(
            &Command::new(instruction::RD_PKT)
                .with_address(Address::ThreeByte(0)),
            &mut hdr,
        )
        .unwrap();
        assert_eq!(hdr[0], Status::Failed as u8);
        assert_eq!(dev.packets(), 0);
    }

    #[test]
    fn sfdp_image_is_served() {
        let mut nor = SpiNor::new(MockMx75::default());
        let mut magic = [0; 4];
        nor.read_sfdp(0, &mut magic).unwrap();
        assert_eq!(&magic, b"SFDP");
        assert_eq!(nor.read_id().unwrap(), drv_mx75_api::JEDEC_ID);
    }

    #[test]
    fn counters_only_move_forward() {
        let dev = MockMx75::default();
        let mut nor = SpiNor::new(dev.clone());
        let seed = |v: u32| {
            let mut r = RequestHeader::new(Op::SeedMc)
                .mc(2)
                .payload_len(4)
                .as_bytes()
                .to_vec();
            r.extend_from_slice(&v.to_le_bytes());
            r
        };
        assert_eq!(packet(&mut nor, &seed(10)).0, Status::Ok as u8);
        assert_eq!(packet(&mut nor, &seed(3)).0, Status::BadParam as u8);
        let increase = RequestHeader::new(Op::IncreaseMc).mc(2);
        let (s, v) = packet(&mut nor, increase.as_bytes());
        assert_eq!(s, Status::Ok as u8);
        assert_eq!(v, 11u32.to_le_bytes());
        assert_eq!(dev.mc(2), 11);
    }

    #[test]
    fn provisioning_blob_builder_layout() {
        let blob = ProvisionBuilder::standard().build();
        assert_eq!(&blob[..4], b"SFPI");
        let le16 = |at: usize| {
            usize::from(u16::from_le_bytes([blob[at], blob[at + 1]]))
        };
        assert_eq!(le16(5), blob.len());
        // APP, KEY stored; MC, CONFIG applied only.
        assert_eq!(blob[7], 0x24);
        let first = sfpi::sub_header_offset(0);
        let off = le16(first + 6);
        assert_eq!(blob[off], blob[first]);
    }
}
