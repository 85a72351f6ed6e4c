// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Secure-flash common layer.
//!
//! [`SecureFlash`] sits between a storage service and a vendor driver. It
//! discovers the part's geometry from SFDP, owns the session pool, checks
//! that every access stays inside the zones bound to the calling
//! application, and breaks arbitrary byte ranges into the native units the
//! vendor driver accepts.
//!
//! Reads and programs are split in three phases: a leading partial unit, a
//! run of whole aligned units, and a trailing partial unit. Partial program
//! units are padded with the erase value rather than read back first, so a
//! partial program only behaves on NOR parts whose erase value is `0xff`
//! (programming ones is a no-op there).
//!
//! The context is not internally synchronized. It assumes a single owner
//! that issues one operation at a time.

#![cfg_attr(not(test), no_std)]

use drv_secure_flash_api::{
    AppData, CryptoService, LockRequest, SecureFlashError, SecureFlashProfile,
    SecureFlashVendor, SessionInfo, MAX_SECURE_IO,
};
use drv_spi_nor::SpiBus;
use ringbuf::{ringbuf, ringbuf_entry};

pub mod sfdp;
pub mod session;
pub mod vendor;

pub use crate::session::SessionPool;
pub use crate::vendor::{probe, Device};

/// Attempts at drawing a nonzero, unused session id.
const SESSION_ID_ATTEMPTS: usize = 4;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    Profiled { read: u32, program: u32, zones: u32 },
    Init(Result<(), SecureFlashError>),
    SessionCreated { key_id: u32, session_id: u32 },
    SessionClosed(u32),
    ZoneRejected { addr: u32, app_id: u32 },
    EraseMisaligned { addr: u32, size: u32 },
    VendorFailed(SecureFlashError),
    None,
}

ringbuf!(Trace, 32, Trace::None);

pub struct SecureFlash<V> {
    vendor: V,
    profile: SecureFlashProfile,
    sessions: SessionPool,
    initialized: bool,
    /// Staging for leading/trailing partial units.
    scratch: [u8; MAX_SECURE_IO],
}

impl<B: SpiBus, C: CryptoService> SecureFlash<Device<B, C>> {
    /// Identifies the part on `bus` and reads its SFDP.
    pub fn probe(bus: B, crypto: C) -> Result<Self, SecureFlashError> {
        let device = vendor::probe(bus, crypto).map_err(|(e, _, _)| e)?;
        Self::new(device)
    }

    /// Tears the stack down to its bus and crypto service.
    pub fn into_parts(self) -> (B, C) {
        self.vendor.into_parts()
    }
}

impl<V: SecureFlashVendor> SecureFlash<V> {
    /// Wraps a vendor driver and reads its geometry. The part is not usable
    /// for secure I/O until [`SecureFlash::init`] succeeds.
    pub fn new(mut vendor: V) -> Result<Self, SecureFlashError> {
        let profile = sfdp::read_profile(&mut vendor)?;
        let arch = &profile.architecture;
        ringbuf_entry!(Trace::Profiled {
            read: arch.secure_read_size,
            program: arch.secure_program_size,
            zones: arch.zone_number,
        });
        Ok(Self {
            vendor,
            profile,
            sessions: SessionPool::default(),
            initialized: false,
            scratch: [0; MAX_SECURE_IO],
        })
    }

    /// Loads provisioning data. A blank part reports
    /// [`SecureFlashError::Unprovisioned`] and stays usable for
    /// [`SecureFlash::write_provision`] only.
    pub fn init(&mut self) -> Result<(), SecureFlashError> {
        let r = self.vendor.init(&self.profile);
        ringbuf_entry!(Trace::Init(r));
        self.initialized = r.is_ok();
        r
    }

    /// Closes every open session and releases the vendor's state.
    pub fn deinit(&mut self) -> Result<(), SecureFlashError> {
        let mut first_err = None;
        let vendor = &mut self.vendor;
        self.sessions.drain(|s| {
            if let Err(e) = vendor.close_session(s.session_key_id) {
                first_err.get_or_insert(e);
            }
        });
        self.initialized = false;
        self.vendor.deinit()?;
        first_err.map_or(Ok(()), Err)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn profile(&self) -> &SecureFlashProfile {
        &self.profile
    }

    pub fn vendor(&self) -> &V {
        &self.vendor
    }

    pub fn into_vendor(self) -> V {
        self.vendor
    }

    /// The provisioned binding for `app_id`.
    pub fn app_data(&self, app_id: u32) -> Option<AppData> {
        self.vendor
            .app_data()
            .iter()
            .find(|a| a.app_id == app_id)
            .copied()
    }

    pub fn session(&self, session_id: u32) -> Option<SessionInfo> {
        self.sessions.find(session_id).copied()
    }

    fn check_init(&self) -> Result<(), SecureFlashError> {
        if self.initialized {
            Ok(())
        } else {
            Err(SecureFlashError::NotInitialized)
        }
    }

    /// Opens a session on root key `key_id`, returning its session id.
    pub fn create_session(
        &mut self,
        key_id: u32,
    ) -> Result<u32, SecureFlashError> {
        self.check_init()?;
        if !self.sessions.has_free_slot() {
            return Err(SecureFlashError::SessionExhaust);
        }
        let session_key_id = self.vendor.create_session(key_id)?;

        match self.fresh_session_id(key_id) {
            Ok(session_id) => {
                self.sessions.insert(SessionInfo {
                    key_id,
                    session_key_id,
                    session_id,
                })?;
                ringbuf_entry!(Trace::SessionCreated { key_id, session_id });
                Ok(session_id)
            }
            Err(e) => {
                // Don't leak the vendor's session slot.
                let _ = self.vendor.close_session(session_key_id);
                Err(e)
            }
        }
    }

    fn fresh_session_id(
        &mut self,
        key_id: u32,
    ) -> Result<u32, SecureFlashError> {
        for _ in 0..SESSION_ID_ATTEMPTS {
            let mut r = [0u8; 4];
            self.vendor.get_trng(&mut r)?;
            let id = u32::from_le_bytes(r) ^ key_id;
            if id != 0 && !self.sessions.contains(id) {
                return Ok(id);
            }
        }
        Err(SecureFlashError::SessionExhaust)
    }

    pub fn close_session(
        &mut self,
        session_id: u32,
    ) -> Result<(), SecureFlashError> {
        let info = self.sessions.remove(session_id)?;
        ringbuf_entry!(Trace::SessionClosed(session_id));
        self.vendor.close_session(info.session_key_id)
    }

    /// Resolves the session and checks that `[addr, addr + len)` lies in
    /// zones bound to `app_id` under the session's key. Returns the vendor
    /// session key id.
    fn authorize(
        &self,
        addr: u32,
        len: u32,
        session_id: u32,
        app_id: u32,
    ) -> Result<u32, SecureFlashError> {
        self.check_init()?;
        let session = self
            .sessions
            .find(session_id)
            .ok_or(SecureFlashError::SessionIdNotExist)?;

        let reject = || {
            ringbuf_entry!(Trace::ZoneRejected { addr, app_id });
            SecureFlashError::IllegalAccess
        };
        let arch = &self.profile.architecture;
        let last = addr
            .checked_add(len.saturating_sub(1))
            .ok_or_else(reject)?;
        let first_zone = arch.zone_of(addr).ok_or_else(reject)?;
        let last_zone = arch.zone_of(last).ok_or_else(reject)?;
        for zone in first_zone..=last_zone {
            let bound = self.vendor.app_data().iter().any(|a| {
                a.app_id == app_id
                    && a.zone_id == zone
                    && a.key_id == session.key_id
            });
            if !bound {
                return Err(reject());
            }
        }
        Ok(session.session_key_id)
    }

    /// Reads `buf.len()` bytes at `addr`.
    pub fn secure_read(
        &mut self,
        addr: u32,
        buf: &mut [u8],
        session_id: u32,
        app_id: u32,
    ) -> Result<(), SecureFlashError> {
        let len = u32::try_from(buf.len())
            .map_err(|_| SecureFlashError::InvalidArgument)?;
        let sk = self.authorize(addr, len, session_id, app_id)?;
        if buf.is_empty() {
            return Ok(());
        }
        let unit = self.profile.architecture.secure_read_size;
        let n = unit as usize;
        let mut done = 0;

        let offset = (addr % unit) as usize;
        if offset != 0 {
            let take = (n - offset).min(buf.len());
            self.vendor
                .secure_read(addr - offset as u32, &mut self.scratch[..n], sk)
                .inspect_err(trace_vendor)?;
            buf[..take].copy_from_slice(&self.scratch[offset..offset + take]);
            done = take;
        }

        while buf.len() - done >= n {
            let at = addr + done as u32;
            self.vendor
                .secure_read(at, &mut buf[done..done + n], sk)
                .inspect_err(trace_vendor)?;
            done += n;
        }

        if done < buf.len() {
            let rest = buf.len() - done;
            self.vendor
                .secure_read(addr + done as u32, &mut self.scratch[..n], sk)
                .inspect_err(trace_vendor)?;
            buf[done..].copy_from_slice(&self.scratch[..rest]);
        }
        Ok(())
    }

    /// Programs `data` at `addr`. Bytes of a partial unit outside `data`
    /// are sent as the erase value.
    pub fn secure_program(
        &mut self,
        addr: u32,
        data: &[u8],
        session_id: u32,
        app_id: u32,
    ) -> Result<(), SecureFlashError> {
        let len = u32::try_from(data.len())
            .map_err(|_| SecureFlashError::InvalidArgument)?;
        let sk = self.authorize(addr, len, session_id, app_id)?;
        if data.is_empty() {
            return Ok(());
        }
        let unit = self.profile.architecture.secure_program_size;
        let n = unit as usize;
        let pad = self.vendor.erase_value();
        let mut done = 0;

        let offset = (addr % unit) as usize;
        if offset != 0 {
            let take = (n - offset).min(data.len());
            self.scratch[..n].fill(pad);
            self.scratch[offset..offset + take].copy_from_slice(&data[..take]);
            self.vendor
                .secure_program(addr - offset as u32, &self.scratch[..n], sk)
                .inspect_err(trace_vendor)?;
            done = take;
        }

        while data.len() - done >= n {
            self.vendor
                .secure_program(addr + done as u32, &data[done..done + n], sk)
                .inspect_err(trace_vendor)?;
            done += n;
        }

        if done < data.len() {
            let rest = data.len() - done;
            self.scratch[..n].fill(pad);
            self.scratch[..rest].copy_from_slice(&data[done..]);
            self.vendor
                .secure_program(addr + done as u32, &self.scratch[..n], sk)
                .inspect_err(trace_vendor)?;
        }
        Ok(())
    }

    /// Erases `[addr, addr + size)`. Both ends must sit on the minimum
    /// secure erase size; the range is covered greedily with the largest
    /// erase that fits.
    pub fn secure_erase(
        &mut self,
        addr: u32,
        size: u32,
        session_id: u32,
        app_id: u32,
    ) -> Result<(), SecureFlashError> {
        let arch = self.profile.architecture;
        let min = arch.min_secure_erase_size;
        let aligned = min != 0
            && addr % min == 0
            && addr.checked_add(size).is_some_and(|end| end % min == 0);
        if !aligned {
            ringbuf_entry!(Trace::EraseMisaligned { addr, size });
            return Err(SecureFlashError::SecureErase);
        }
        let sk = self.authorize(addr, size, session_id, app_id)?;

        let mut at = addr;
        let end = addr + size;
        while at < end {
            let step = arch
                .erase_sizes()
                .filter(|&s| at % s == 0 && s <= end - at)
                .max()
                .unwrap_or(min);
            self.vendor
                .secure_erase(at, step, sk)
                .inspect_err(trace_vendor)?;
            at += step;
        }
        Ok(())
    }

    pub fn write_provision(
        &mut self,
        blob: &[u8],
    ) -> Result<(), SecureFlashError> {
        self.vendor.write_provision(blob)
    }

    pub fn read_provision(
        &mut self,
        buf: &mut [u8],
    ) -> Result<usize, SecureFlashError> {
        self.vendor.read_provision(buf)
    }

    /// Locks regions of the part. A `session_key_id` in the request is
    /// given here as a session id and translated.
    pub fn lock_down(
        &mut self,
        lock: &LockRequest,
    ) -> Result<(), SecureFlashError> {
        let session_key_id = match lock.session_key_id {
            Some(session_id) => Some(
                self.sessions
                    .find(session_id)
                    .ok_or(SecureFlashError::SessionIdNotExist)?
                    .session_key_id,
            ),
            None => None,
        };
        self.vendor.lock_down(&LockRequest {
            session_key_id,
            ..*lock
        })
    }

    pub fn get_trng(&mut self, out: &mut [u8]) -> Result<(), SecureFlashError> {
        self.vendor.get_trng(out)
    }

    pub fn get_puf(
        &mut self,
        info: &[u8],
        out: &mut [u8],
    ) -> Result<(), SecureFlashError> {
        self.vendor.get_puf(info, out)
    }

    pub fn get_mc(
        &mut self,
        mc_id: u32,
        out: &mut [u8],
    ) -> Result<usize, SecureFlashError> {
        self.check_init()?;
        self.vendor.get_mc(mc_id, out)
    }

    pub fn increase_mc(&mut self, mc_id: u32) -> Result<(), SecureFlashError> {
        self.check_init()?;
        self.vendor.increase_mc(mc_id)
    }

    pub fn erase_value(&self) -> u8 {
        self.vendor.erase_value()
    }
}

fn trace_vendor(e: &SecureFlashError) {
    ringbuf_entry!(Trace::VendorFailed(*e));
}
