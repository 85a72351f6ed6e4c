// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Builds SFPI provisioning images for tests.

use drv_mx75_api::sfpi::{
    self, AppEntry, KeyEntry, MajorHeader, McEntry, SubHeader,
};
use zerocopy::IntoBytes;

/// Application id bound to zone 0 by [`ProvisionBuilder::standard`].
pub const APP_A: u32 = 0x100;
/// Application id bound to zone 1 by [`ProvisionBuilder::standard`].
pub const APP_B: u32 = 0x200;

struct Table {
    id: u8,
    store: bool,
    body: Vec<u8>,
}

#[derive(Default)]
pub struct ProvisionBuilder {
    apps: Vec<AppEntry>,
    keys: Vec<KeyEntry>,
    mcs: Vec<McEntry>,
    config: Option<Vec<u8>>,
    lock: Option<u8>,
}

impl ProvisionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Two applications on zones 0 and 1, one imported and one derived
    /// root key, and their counters.
    pub fn standard() -> Self {
        Self::new()
            .app(APP_A, 0, 0, 0)
            .app(APP_B, 1, 1, 1)
            .key(0, sfpi::inject::IMPORT, 0, [0xa5; 32])
            .key(1, sfpi::inject::DERIVE, 0, [0x5a; 32])
            .mc(0, 0)
            .mc(1, 100)
            .config(&[0xc0, 0xf1, 0x60, 0x00])
    }

    pub fn app(
        mut self,
        app_id: u32,
        key_id: u8,
        zone_id: u8,
        mc_id: u8,
    ) -> Self {
        self.apps.push(AppEntry {
            app_id: app_id.into(),
            key_id,
            zone_id,
            mc_id,
            reserved: 0,
        });
        self
    }

    pub fn key(
        mut self,
        key_id: u8,
        inject_type: u8,
        derive_from: u8,
        material: [u8; 32],
    ) -> Self {
        self.keys.push(KeyEntry {
            key_id,
            inject_type,
            derive_from,
            reserved: [0; 5],
            material,
        });
        self
    }

    pub fn mc(mut self, mc_id: u8, initial: u32) -> Self {
        self.mcs.push(McEntry {
            mc_id,
            reserved: [0; 3],
            initial: initial.into(),
        });
        self
    }

    pub fn config(mut self, bytes: &[u8]) -> Self {
        self.config = Some(bytes.to_vec());
        self
    }

    pub fn lock(mut self, flags: u8) -> Self {
        self.lock = Some(flags);
        self
    }

    fn tables(&self) -> Vec<Table> {
        let mut tables = vec![];
        let entries = |id: u8, count: usize, bytes: Vec<u8>| {
            let mut body = vec![id, count as u8, 0, 0];
            body.extend(bytes);
            body
        };
        if !self.apps.is_empty() {
            let bytes =
                self.apps.iter().flat_map(|a| a.as_bytes().to_vec()).collect();
            tables.push(Table {
                id: sfpi::APP_INFO,
                store: true,
                body: entries(sfpi::APP_INFO, self.apps.len(), bytes),
            });
        }
        if let Some(flags) = self.lock {
            tables.push(Table {
                id: sfpi::LOCK_INFO,
                store: true,
                body: vec![sfpi::LOCK_INFO, flags, 0, 0],
            });
        }
        if !self.keys.is_empty() {
            let bytes =
                self.keys.iter().flat_map(|k| k.as_bytes().to_vec()).collect();
            tables.push(Table {
                id: sfpi::KEY_INFO,
                store: true,
                body: entries(sfpi::KEY_INFO, self.keys.len(), bytes),
            });
        }
        if !self.mcs.is_empty() {
            let bytes =
                self.mcs.iter().flat_map(|m| m.as_bytes().to_vec()).collect();
            tables.push(Table {
                id: sfpi::MC_INFO,
                store: false,
                body: entries(sfpi::MC_INFO, self.mcs.len(), bytes),
            });
        }
        if let Some(config) = &self.config {
            tables.push(Table {
                id: sfpi::CONFIG_INFO,
                store: false,
                body: entries(sfpi::CONFIG_INFO, config.len(), config.clone()),
            });
        }
        tables
    }

    pub fn build(&self) -> Vec<u8> {
        let tables = self.tables();
        let n = tables.len();
        let stored = tables.iter().filter(|t| t.store).count();

        let mut offset = MajorHeader::SIZE + n * SubHeader::SIZE;
        let mut headers = vec![];
        let mut bodies = vec![];
        for t in &tables {
            headers.push(SubHeader::new(
                t.id,
                t.store,
                t.body.len() as u16,
                offset as u16,
            ));
            offset += t.body.len();
            bodies.extend_from_slice(&t.body);
        }

        let mut blob = MajorHeader::new(offset as u16, n as u8, stored as u8)
            .as_bytes()
            .to_vec();
        for h in &headers {
            blob.extend_from_slice(h.as_bytes());
        }
        blob.extend(bodies);
        blob
    }
}

/// Offset of sub-header `index` within an image.
pub fn sub_header_offset(index: usize) -> usize {
    MajorHeader::SIZE + index * SubHeader::SIZE
}
