// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helpers for build scripts that need a task's configuration.
//!
//! A task's configuration is a TOML fragment. The image builder passes it in
//! through `HUBRIS_TASK_CONFIG`; a crate built on its own (host tests, IDE
//! checks) falls back to a TOML file checked in next to its `Cargo.toml`.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::env;
use std::path::Path;

const TASK_CONFIG_VAR: &str = "HUBRIS_TASK_CONFIG";

/// Pulls the task configuration. Fails if `HUBRIS_TASK_CONFIG` is missing or
/// doesn't parse.
pub fn task_config<T: DeserializeOwned>() -> Result<T> {
    println!("cargo:rerun-if-env-changed={}", TASK_CONFIG_VAR);
    let text = env::var(TASK_CONFIG_VAR)
        .with_context(|| format!("${} is not set", TASK_CONFIG_VAR))?;
    parse(&text)
}

/// Equivalent to `task_config`, but reads `fallback` (relative to the crate's
/// manifest directory) when the environment variable is missing. If either
/// source fails to parse, this still fails with `Err`.
pub fn task_config_or_file<T: DeserializeOwned>(fallback: &str) -> Result<T> {
    println!("cargo:rerun-if-env-changed={}", TASK_CONFIG_VAR);

    if let Ok(text) = env::var(TASK_CONFIG_VAR) {
        println!("--- toml for ${} ---", TASK_CONFIG_VAR);
        println!("{}", text);
        return parse(&text);
    }

    let dir = env::var("CARGO_MANIFEST_DIR")?;
    let path = Path::new(&dir).join(fallback);
    println!("cargo:rerun-if-changed={}", path.display());
    println!(
        "--- var ${} not present, using {} ---",
        TASK_CONFIG_VAR,
        path.display()
    );
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse(&text)
}

/// Parses a TOML configuration fragment.
pub fn parse<T: DeserializeOwned>(text: &str) -> Result<T> {
    let rval = toml::from_str(text).context("parsing task config")?;
    Ok(rval)
}
