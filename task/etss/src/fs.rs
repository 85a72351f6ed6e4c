// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Slot-per-file store inside one secure zone.
//!
//! The zone is cut into equal slots, each big enough for a header and the
//! largest asset and rounded up to the minimum secure erase size. A slot is
//! in use when its header carries [`FILE_MAGIC`]; anything else (normally
//! the erased pattern) is free and is erased again before being claimed.

use drv_secure_flash::SecureFlash;
use drv_secure_flash_api::SecureFlashVendor;
use task_etss_api::{CreateFlags, EtssError, FileInfo, MAX_ASSET_SIZE};
use zerocopy::little_endian as le;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const FILE_MAGIC: [u8; 4] = *b"ETSF";

/// Client id followed by UID, both little-endian.
pub type FileId = [u8; 12];

pub fn file_id(client_id: i32, uid: u64) -> FileId {
    let mut id = [0; 12];
    id[..4].copy_from_slice(&client_id.to_le_bytes());
    id[4..].copy_from_slice(&uid.to_le_bytes());
    id
}

#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct SlotHeader {
    pub magic: [u8; 4],
    pub file_id: FileId,
    /// Declared size of the asset.
    pub size: le::U32,
    pub flags: le::U32,
    pub reserved: [u8; 8],
}

pub const SLOT_HEADER_SIZE: usize = core::mem::size_of::<SlotHeader>();
static_assertions::const_assert_eq!(SLOT_HEADER_SIZE, 32);

impl SlotHeader {
    fn in_use(&self) -> bool {
        self.magic == FILE_MAGIC
    }

    fn info(&self) -> FileInfo {
        FileInfo {
            size: self.size.get(),
            flags: CreateFlags::from_bits_retain(self.flags.get()),
        }
    }
}

/// One client's view of its zone.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FileStore {
    app_id: u32,
    session_id: u32,
    base: u32,
    slot_size: u32,
    slot_count: u32,
}

impl FileStore {
    pub fn new(
        app_id: u32,
        session_id: u32,
        base: u32,
        zone_size: u32,
        min_erase: u32,
    ) -> Result<Self, EtssError> {
        let need = (SLOT_HEADER_SIZE + MAX_ASSET_SIZE) as u32;
        if min_erase == 0 {
            return Err(EtssError::StorageFailure);
        }
        let slot_size = need.div_ceil(min_erase) * min_erase;
        let slot_count = zone_size / slot_size;
        if slot_count == 0 {
            return Err(EtssError::InsufficientSpace);
        }
        Ok(Self {
            app_id,
            session_id,
            base,
            slot_size,
            slot_count,
        })
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    fn slot_addr(&self, slot: u32) -> u32 {
        self.base + slot * self.slot_size
    }

    fn header<V: SecureFlashVendor>(
        &self,
        flash: &mut SecureFlash<V>,
        slot: u32,
    ) -> Result<SlotHeader, EtssError> {
        let mut raw = [0u8; SLOT_HEADER_SIZE];
        flash.secure_read(
            self.slot_addr(slot),
            &mut raw,
            self.session_id,
            self.app_id,
        )?;
        SlotHeader::read_from_bytes(&raw[..])
            .map_err(|_| EtssError::StorageFailure)
    }

    /// Finds the slot holding `fid`.
    pub fn find<V: SecureFlashVendor>(
        &self,
        flash: &mut SecureFlash<V>,
        fid: &FileId,
    ) -> Result<Option<(u32, SlotHeader)>, EtssError> {
        for slot in 0..self.slot_count {
            let h = self.header(flash, slot)?;
            if h.in_use() && h.file_id == *fid {
                return Ok(Some((slot, h)));
            }
        }
        Ok(None)
    }

    fn free_slot<V: SecureFlashVendor>(
        &self,
        flash: &mut SecureFlash<V>,
    ) -> Result<u32, EtssError> {
        for slot in 0..self.slot_count {
            if !self.header(flash, slot)?.in_use() {
                return Ok(slot);
            }
        }
        Err(EtssError::InsufficientSpace)
    }

    pub fn info<V: SecureFlashVendor>(
        &self,
        flash: &mut SecureFlash<V>,
        fid: &FileId,
    ) -> Result<FileInfo, EtssError> {
        self.find(flash, fid)?
            .map(|(_, h)| h.info())
            .ok_or(EtssError::DoesNotExist)
    }

    /// Writes `data` at `offset` into `fid`.
    ///
    /// With `create` set the file is (re)started: its slot, or a free one,
    /// is erased and given a header declaring `size` bytes and `flags`.
    /// Without it the file must exist and the write must stay inside its
    /// declared size.
    pub fn write<V: SecureFlashVendor>(
        &self,
        flash: &mut SecureFlash<V>,
        fid: &FileId,
        create: Option<(u32, CreateFlags)>,
        offset: u32,
        data: &[u8],
    ) -> Result<(), EtssError> {
        let (slot, size) = match create {
            Some((size, flags)) => {
                if size as usize > MAX_ASSET_SIZE {
                    return Err(EtssError::InvalidArgument);
                }
                let slot = match self.find(flash, fid)? {
                    Some((slot, _)) => slot,
                    None => self.free_slot(flash)?,
                };
                let addr = self.slot_addr(slot);
                flash.secure_erase(
                    addr,
                    self.slot_size,
                    self.session_id,
                    self.app_id,
                )?;
                let header = SlotHeader {
                    magic: FILE_MAGIC,
                    file_id: *fid,
                    size: size.into(),
                    flags: flags.bits().into(),
                    reserved: [0xff; 8],
                };
                flash.secure_program(
                    addr,
                    header.as_bytes(),
                    self.session_id,
                    self.app_id,
                )?;
                (slot, size)
            }
            None => {
                let (slot, h) =
                    self.find(flash, fid)?.ok_or(EtssError::DoesNotExist)?;
                (slot, h.size.get())
            }
        };

        offset
            .checked_add(data.len() as u32)
            .filter(|&end| end <= size)
            .ok_or(EtssError::InvalidArgument)?;
        let at = self.slot_addr(slot) + SLOT_HEADER_SIZE as u32 + offset;
        flash.secure_program(at, data, self.session_id, self.app_id)?;
        Ok(())
    }

    /// Reads `out.len()` bytes of `fid` from `offset`.
    pub fn read<V: SecureFlashVendor>(
        &self,
        flash: &mut SecureFlash<V>,
        fid: &FileId,
        offset: u32,
        out: &mut [u8],
    ) -> Result<(), EtssError> {
        let (slot, h) =
            self.find(flash, fid)?.ok_or(EtssError::DoesNotExist)?;
        offset
            .checked_add(out.len() as u32)
            .filter(|&end| end <= h.size.get())
            .ok_or(EtssError::InvalidArgument)?;
        let at = self.slot_addr(slot) + SLOT_HEADER_SIZE as u32 + offset;
        flash.secure_read(at, out, self.session_id, self.app_id)?;
        Ok(())
    }

    pub fn delete<V: SecureFlashVendor>(
        &self,
        flash: &mut SecureFlash<V>,
        fid: &FileId,
    ) -> Result<(), EtssError> {
        let (slot, _) =
            self.find(flash, fid)?.ok_or(EtssError::DoesNotExist)?;
        flash.secure_erase(
            self.slot_addr(slot),
            self.slot_size,
            self.session_id,
            self.app_id,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{provisioned_flash, Vendor};
    use drv_mock_mx75::sfpi::APP_A;

    fn store(flash: &mut SecureFlash<Vendor>) -> FileStore {
        let session = flash.create_session(0).unwrap();
        FileStore::new(APP_A, session, 0, 8192, 512).unwrap()
    }

    #[test]
    fn slots_round_up_to_erase_size() {
        let fs = FileStore::new(1, 1, 0, 8192, 512).unwrap();
        assert_eq!(fs.slot_size, 1024);
        assert_eq!(fs.slot_count(), 8);
        assert_eq!(
            FileStore::new(1, 1, 0, 512, 512),
            Err(EtssError::InsufficientSpace)
        );
    }

    #[test]
    fn create_write_read_delete() {
        let (_, mut flash) = provisioned_flash();
        let fs = store(&mut flash);
        let fid = file_id(-1, 7);

        fs.write(&mut flash, &fid, Some((6, CreateFlags::empty())), 0, b"abc")
            .unwrap();
        fs.write(&mut flash, &fid, None, 3, b"def").unwrap();
        let mut out = [0; 6];
        fs.read(&mut flash, &fid, 0, &mut out).unwrap();
        assert_eq!(&out, b"abcdef");
        assert_eq!(fs.info(&mut flash, &fid).unwrap().size, 6);

        assert_eq!(
            fs.write(&mut flash, &fid, None, 5, b"xy"),
            Err(EtssError::InvalidArgument)
        );

        fs.delete(&mut flash, &fid).unwrap();
        assert_eq!(fs.info(&mut flash, &fid), Err(EtssError::DoesNotExist));
        assert_eq!(fs.delete(&mut flash, &fid), Err(EtssError::DoesNotExist));
    }

    #[test]
    fn recreate_reuses_the_slot() {
        let (dev, mut flash) = provisioned_flash();
        let fs = store(&mut flash);
        let fid = file_id(-1, 8);
        fs.write(&mut flash, &fid, Some((4, CreateFlags::empty())), 0, &[0; 4])
            .unwrap();
        fs.write(&mut flash, &fid, Some((2, CreateFlags::empty())), 0, &[7, 7])
            .unwrap();
        assert_eq!(fs.find(&mut flash, &fid).unwrap().unwrap().0, 0);
        assert_eq!(&dev.flash()[32..35], &[7, 7, 0xff]);
    }

    #[test]
    fn full_zone_is_insufficient_space() {
        let (_, mut flash) = provisioned_flash();
        let fs = store(&mut flash);
        for uid in 1..=8 {
            fs.write(
                &mut flash,
                &file_id(-1, uid),
                Some((0, CreateFlags::empty())),
                0,
                &[],
            )
            .unwrap();
        }
        assert_eq!(
            fs.write(
                &mut flash,
                &file_id(-1, 9),
                Some((0, CreateFlags::empty())),
                0,
                &[]
            ),
            Err(EtssError::InsufficientSpace)
        );
    }
}
