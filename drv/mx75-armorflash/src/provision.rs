// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parsing, validation and compaction of SFPI provisioning images.
//!
//! Everything here is pure: an image is checked completely before the
//! driver sends a single byte to the part.

use drv_mx75_api::sfpi::{
    self, AppEntry, KeyEntry, MajorHeader, McEntry, SubHeader,
};
use drv_mx75_api::{MC_COUNT, ROOT_KEY_SLOTS};
use drv_secure_flash_api::{
    AppData, SecureFlashError, MAX_APPS, MAX_PROVISION_SIZE,
};
use heapless::Vec;
use zerocopy::{FromBytes, IntoBytes};

/// The sub-header count is a nibble.
const MAX_TABLES: usize = 15;

/// A validated image borrowed from the caller.
pub struct Image<'a> {
    blob: &'a [u8],
    subs: Vec<SubHeader, MAX_TABLES>,
}

fn bad() -> SecureFlashError {
    SecureFlashError::WriteProvision
}

fn entry_count(table: &[u8], size: usize) -> Result<usize, SecureFlashError> {
    let count = usize::from(table[1]);
    if sfpi::TABLE_PREFIX + count * size > table.len() {
        return Err(bad());
    }
    Ok(count)
}

pub fn parse(blob: &[u8]) -> Result<Image<'_>, SecureFlashError> {
    if blob.len() > MAX_PROVISION_SIZE {
        return Err(bad());
    }
    let (major, _) = MajorHeader::read_from_prefix(blob).map_err(|_| bad())?;
    if major.magic != sfpi::MAGIC
        || major.version != sfpi::VERSION
        || usize::from(major.total_size.get()) != blob.len()
    {
        return Err(bad());
    }

    let n = major.sub_header_num();
    let tables_start = MajorHeader::SIZE + n * SubHeader::SIZE;
    if n == 0 || tables_start > blob.len() {
        return Err(bad());
    }

    let mut subs = Vec::new();
    for i in 0..n {
        let at = MajorHeader::SIZE + i * SubHeader::SIZE;
        let (sub, _) =
            SubHeader::read_from_prefix(&blob[at..]).map_err(|_| bad())?;
        let offset = usize::from(sub.offset.get());
        let size = usize::from(sub.table_size.get());
        if offset < tables_start
            || size < sfpi::TABLE_PREFIX
            || offset + size > blob.len()
        {
            return Err(bad());
        }
        // The table must say what the header says it is.
        if blob[offset] != sub.id {
            return Err(bad());
        }
        if !(sfpi::APP_INFO..=sfpi::CONFIG_INFO).contains(&sub.id)
            || subs.iter().any(|s: &SubHeader| s.id == sub.id)
        {
            return Err(bad());
        }
        subs.push(sub).map_err(|_| bad())?;
    }

    if subs.iter().filter(|s| s.store()).count() != major.store_num() {
        return Err(bad());
    }

    let image = Image { blob, subs };
    image.check_entries()?;
    Ok(image)
}

impl<'a> Image<'a> {
    /// The whole sub-table with id `id`, prefix included.
    pub fn table(&self, id: u8) -> Option<&'a [u8]> {
        let sub = self.subs.iter().find(|s| s.id == id)?;
        let offset = usize::from(sub.offset.get());
        let blob: &'a [u8] = self.blob;
        blob.get(offset..offset + usize::from(sub.table_size.get()))
    }

    fn entries<T: FromBytes + 'a>(
        &self,
        id: u8,
        size: usize,
    ) -> impl Iterator<Item = T> + 'a {
        let table = self.table(id).unwrap_or(&[]);
        let count = if table.is_empty() {
            0
        } else {
            usize::from(table[1])
        };
        table
            .get(sfpi::TABLE_PREFIX..sfpi::TABLE_PREFIX + count * size)
            .unwrap_or(&[])
            .chunks_exact(size)
            .filter_map(|c| T::read_from_bytes(c).ok())
    }

    pub fn apps(&self) -> impl Iterator<Item = AppEntry> + 'a {
        self.entries(sfpi::APP_INFO, sfpi::APP_ENTRY)
    }

    pub fn keys(&self) -> impl Iterator<Item = KeyEntry> + 'a {
        self.entries(sfpi::KEY_INFO, sfpi::KEY_ENTRY)
    }

    pub fn mcs(&self) -> impl Iterator<Item = McEntry> + 'a {
        self.entries(sfpi::MC_INFO, sfpi::MC_ENTRY)
    }

    pub fn config(&self) -> Option<&'a [u8]> {
        self.table(sfpi::CONFIG_INFO)
            .map(|t| &t[sfpi::TABLE_PREFIX..])
    }

    pub fn lock(&self) -> u8 {
        self.table(sfpi::LOCK_INFO).map(|t| t[1]).unwrap_or(0)
    }

    fn check_entries(&self) -> Result<(), SecureFlashError> {
        if let Some(t) = self.table(sfpi::APP_INFO) {
            if entry_count(t, sfpi::APP_ENTRY)? > MAX_APPS {
                return Err(bad());
            }
        }
        if let Some(t) = self.table(sfpi::KEY_INFO) {
            entry_count(t, sfpi::KEY_ENTRY)?;
        }
        if let Some(t) = self.table(sfpi::MC_INFO) {
            entry_count(t, sfpi::MC_ENTRY)?;
        }

        for app in self.apps() {
            if app.key_id >= ROOT_KEY_SLOTS || app.mc_id >= MC_COUNT {
                return Err(bad());
            }
        }
        for key in self.keys() {
            let ok = key.key_id < ROOT_KEY_SLOTS
                && match key.inject_type {
                    sfpi::inject::IMPORT | sfpi::inject::GENERATE => true,
                    sfpi::inject::DERIVE => {
                        key.derive_from < ROOT_KEY_SLOTS
                            && key.derive_from != key.key_id
                    }
                    _ => false,
                };
            if !ok {
                return Err(bad());
            }
        }
        if self.mcs().any(|m| m.mc_id >= MC_COUNT) {
            return Err(bad());
        }
        if self.lock() & !sfpi::lock::ALL != 0 {
            return Err(bad());
        }
        Ok(())
    }

    /// Writes the persisted form of this image into `out`: only the stored
    /// tables, key material zeroed, and lock flags `lock`. Returns its size.
    pub fn compact(
        &self,
        lock: u8,
        out: &mut [u8],
    ) -> Result<usize, SecureFlashError> {
        let synth = [sfpi::LOCK_INFO, lock, 0, 0];
        let mut tables: Vec<(u8, u8, &[u8]), { MAX_TABLES + 1 }> = Vec::new();
        for sub in self.subs.iter().filter(|s| s.store()) {
            if let Some(t) = self.table(sub.id) {
                tables.push((sub.id, sub.version, t)).map_err(|_| bad())?;
            }
        }
        if lock != 0 && !tables.iter().any(|t| t.0 == sfpi::LOCK_INFO) {
            tables
                .push((sfpi::LOCK_INFO, sfpi::VERSION, &synth[..]))
                .map_err(|_| bad())?;
        }
        let n = tables.len();
        if n > MAX_TABLES {
            return Err(bad());
        }

        let mut offset = MajorHeader::SIZE + n * SubHeader::SIZE;
        for (i, &(id, version, src)) in tables.iter().enumerate() {
            let end = offset + src.len();
            let dest = out.get_mut(offset..end).ok_or_else(bad)?;
            dest.copy_from_slice(src);
            match id {
                sfpi::KEY_INFO => {
                    let count = usize::from(dest[1]);
                    for e in 0..count {
                        let at = sfpi::TABLE_PREFIX + e * sfpi::KEY_ENTRY;
                        dest[at + 8..at + sfpi::KEY_ENTRY].fill(0);
                    }
                }
                sfpi::LOCK_INFO => dest[1] = lock,
                _ => (),
            }

            let mut sub =
                SubHeader::new(id, true, src.len() as u16, offset as u16);
            sub.version = version;
            let at = MajorHeader::SIZE + i * SubHeader::SIZE;
            out[at..at + SubHeader::SIZE].copy_from_slice(sub.as_bytes());
            offset = end;
        }

        let major = MajorHeader::new(offset as u16, n as u8, n as u8);
        out.get_mut(..MajorHeader::SIZE)
            .ok_or_else(bad)?
            .copy_from_slice(major.as_bytes());
        Ok(offset)
    }
}

/// What the driver keeps from a committed image.
#[derive(Clone, Debug, Default)]
pub struct ProvisionInfo {
    pub apps: Vec<AppData, MAX_APPS>,
    pub lock: u8,
}

impl ProvisionInfo {
    pub fn from_image(image: &Image<'_>) -> Result<Self, SecureFlashError> {
        let mut apps = Vec::new();
        for a in image.apps() {
            apps.push(AppData {
                app_id: a.app_id.get(),
                key_id: u32::from(a.key_id),
                zone_id: u32::from(a.zone_id),
                mc_id: u32::from(a.mc_id),
            })
            .map_err(|_| bad())?;
        }
        Ok(Self {
            apps,
            lock: image.lock(),
        })
    }
}
