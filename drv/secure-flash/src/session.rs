// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed pool of open sessions.

use drv_secure_flash_api::{SecureFlashError, SessionInfo, SESSION_SLOTS};

/// A slot is free when its `session_id` is zero.
#[derive(Clone, Debug, Default)]
pub struct SessionPool {
    slots: [SessionInfo; SESSION_SLOTS],
}

impl SessionPool {
    pub fn has_free_slot(&self) -> bool {
        self.slots.iter().any(SessionInfo::is_free)
    }

    pub fn contains(&self, session_id: u32) -> bool {
        self.find(session_id).is_some()
    }

    pub fn find(&self, session_id: u32) -> Option<&SessionInfo> {
        if session_id == 0 {
            return None;
        }
        self.slots.iter().find(|s| s.session_id == session_id)
    }

    /// Claims the first free slot.
    pub fn insert(
        &mut self,
        info: SessionInfo,
    ) -> Result<(), SecureFlashError> {
        if info.session_id == 0 || self.contains(info.session_id) {
            return Err(SecureFlashError::InvalidArgument);
        }
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.is_free())
            .ok_or(SecureFlashError::SessionExhaust)?;
        *slot = info;
        Ok(())
    }

    /// Zeroes the slot holding `session_id` and returns what it held.
    pub fn remove(
        &mut self,
        session_id: u32,
    ) -> Result<SessionInfo, SecureFlashError> {
        if session_id == 0 {
            return Err(SecureFlashError::SessionIdNotExist);
        }
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.session_id == session_id)
            .ok_or(SecureFlashError::SessionIdNotExist)?;
        Ok(core::mem::take(slot))
    }

    pub fn open(&self) -> impl Iterator<Item = &SessionInfo> {
        self.slots.iter().filter(|s| !s.is_free())
    }

    /// Empties the pool, handing each open session to `f`.
    pub fn drain(&mut self, mut f: impl FnMut(SessionInfo)) {
        for slot in self.slots.iter_mut().filter(|s| !s.is_free()) {
            f(core::mem::take(slot));
        }
    }
}
