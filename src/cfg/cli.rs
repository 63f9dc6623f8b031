// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Locates a client configuration file.
///
/// Absolute paths are used as given. Relative paths are tried against the
/// current working directory first and then the crate root, so tests and
/// tooling resolve the same fixtures no matter where cargo launches them
/// from. The returned path is canonicalized and guaranteed to exist.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);
    if p.is_absolute() {
        return p
            .canonicalize()
            .with_context(|| format!("failed to canonicalize path {p:?}"));
    }

    let mut candidates = Vec::with_capacity(2);
    candidates.push(
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p),
    );
    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        candidates.push(PathBuf::from(manifest_dir).join(p));
    }

    for candidate in &candidates {
        if candidate.exists() {
            return candidate
                .canonicalize()
                .with_context(|| format!("failed to canonicalize path {candidate:?}"));
        }
    }
    bail!("config file {rel} not found in {candidates:?}")
}
