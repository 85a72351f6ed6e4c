// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{bail, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::PathBuf;

/// Must match the session pool size; every client holds one session.
const MAX_CLIENTS: usize = 4;

#[derive(Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct TaskConfig {
    multi_client: bool,
    default_app_id: u32,
    #[serde(default)]
    client: Vec<ClientConfig>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct ClientConfig {
    client_id: i32,
    app_id: u32,
}

fn main() -> Result<()> {
    let config = build_util::task_config_or_file::<TaskConfig>("etss.toml")?;

    if config.client.len() > MAX_CLIENTS {
        bail!(
            "{} clients configured, at most {MAX_CLIENTS} fit",
            config.client.len()
        );
    }
    let mut seen = BTreeSet::new();
    for c in &config.client {
        if !seen.insert(c.client_id) {
            bail!("client id {} configured twice", c.client_id);
        }
    }
    if config.multi_client && config.client.is_empty() {
        bail!("multi-client isolation needs at least one [[client]]");
    }

    let mut out = String::new();
    writeln!(out, "pub const CONFIG: EtssConfig<'static> = EtssConfig {{")?;
    writeln!(out, "    multi_client: {},", config.multi_client)?;
    writeln!(out, "    default_app_id: {:#x},", config.default_app_id)?;
    writeln!(out, "    clients: &[")?;
    for c in &config.client {
        writeln!(
            out,
            "        ClientBinding {{ client_id: {}, app_id: {:#x} }},",
            c.client_id, c.app_id
        )?;
    }
    writeln!(out, "    ],")?;
    writeln!(out, "}};")?;

    let dest = PathBuf::from(std::env::var("OUT_DIR")?).join("etss_config.rs");
    std::fs::write(dest, out)?;
    Ok(())
}
