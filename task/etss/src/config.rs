// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Which callers the task serves and which application each one acts as.

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ClientBinding {
    pub client_id: i32,
    pub app_id: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EtssConfig<'a> {
    /// When set, each client in `clients` gets its own zone and callers not
    /// listed are refused. Otherwise every caller shares the zone of
    /// `default_app_id`.
    pub multi_client: bool,
    pub default_app_id: u32,
    pub clients: &'a [ClientBinding],
}

include!(concat!(env!("OUT_DIR"), "/etss_config.rs"));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_table_is_usable() {
        if CONFIG.multi_client {
            assert!(!CONFIG.clients.is_empty());
        }
        for (i, c) in CONFIG.clients.iter().enumerate() {
            assert!(CONFIG.clients[i + 1..]
                .iter()
                .all(|o| o.client_id != c.client_id));
        }
    }
}
