//! On-disk layout: one directory per run under a shared root.
//!
//! ```text
//! <root>/
//!   <run_id>/
//!     state.json     overwritable snapshot
//!     events.jsonl   append-only log, one event per line
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};

/// Canonical paths for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub run_dir: PathBuf,
    pub state_path: PathBuf,
    pub events_path: PathBuf,
}

impl RunPaths {
    /// Fails unless `run_id` passes [`validate_run_id`], so no id can point
    /// outside `root`.
    pub fn new(root: &Path, run_id: &str) -> Result<Self> {
        validate_run_id(run_id)?;
        let run_dir = root.join(run_id);
        Ok(Self {
            state_path: run_dir.join("state.json"),
            events_path: run_dir.join("events.jsonl"),
            run_dir,
        })
    }
}

/// Run ids become directory names, so keep them to a portable alphabet.
pub fn validate_run_id(run_id: &str) -> Result<()> {
    if run_id.is_empty() {
        return Err(anyhow!("run id must not be empty"));
    }
    if run_id.len() > 128 {
        return Err(anyhow!("run id '{run_id}' is longer than 128 characters"));
    }
    if run_id.starts_with('.') {
        return Err(anyhow!("run id '{run_id}' must not start with '.'"));
    }
    if let Some(bad) = run_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(anyhow!("run id '{run_id}' contains invalid character '{bad}'"));
    }
    Ok(())
}
