//! Run state snapshots (`<root>/<run_id>/state.json`).
//!
//! The snapshot is a cache of the event fold. It is written atomically after
//! each step and trusted only while its `last_sequence_no` matches the log
//! head; anything else falls back to [`StateStore::rebuild`].

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::core::event::{Event, EventBody};
use crate::core::run::Run;
use crate::core::types::RunStatus;
use crate::error::EngineError;
use crate::io::event_log::EventLog;
use crate::io::layout::RunPaths;

/// One line of [`StateStore::list_runs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub goal: String,
    pub status: RunStatus,
    pub current_step: u32,
    pub max_steps: u32,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.run_id.clone(),
            goal: run.goal.clone(),
            status: run.status,
            current_step: run.current_step,
            max_steps: run.max_steps,
            reason: run.reason.clone(),
            created_at: run.created_at,
            updated_at: run.updated_at,
        }
    }
}

/// Snapshots plus the event log they are derived from, sharing one root.
pub struct StateStore {
    root: PathBuf,
    log: EventLog,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            log: EventLog::new(root.clone()),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn run_paths(&self, run_id: &str) -> Result<RunPaths> {
        RunPaths::new(&self.root, run_id)
    }

    /// Atomically overwrite the run's snapshot.
    pub fn save(&self, run: &Run) -> Result<()> {
        let path = self.run_paths(&run.run_id)?.state_path;
        debug!(
            run_id = %run.run_id,
            status = %run.status,
            last_sequence_no = run.last_sequence_no,
            "writing run snapshot"
        );
        let mut buf = serde_json::to_string_pretty(run).context("serialize run snapshot")?;
        buf.push('\n');
        write_atomic(&path, &buf)
    }

    /// Snapshot if it is current, otherwise a rebuild from the log.
    pub fn load(&self, run_id: &str) -> Result<Run> {
        let head = self.log.head(run_id)?;
        if let Some(run) = self.read_snapshot(run_id)? {
            if run.last_sequence_no == head {
                return Ok(run);
            }
            info!(
                run_id,
                snapshot_sequence_no = run.last_sequence_no,
                head,
                "run snapshot is stale; rebuilding"
            );
        }
        self.rebuild(run_id)
    }

    /// Fold the full event log into a fresh [`Run`].
    pub fn rebuild(&self, run_id: &str) -> Result<Run> {
        debug!(run_id, "rebuilding run from event log");
        let mut run: Option<Run> = None;
        for event in self.log.read_all(run_id)? {
            let event = event?;
            match run.as_mut() {
                None => run = Some(Run::from_created(&event)?),
                Some(run) => run.apply(&event)?,
            }
        }
        run.ok_or_else(|| EngineError::RunNotFound(run_id.to_string()).into())
    }

    /// Append the next event for `run` and fold it in.
    ///
    /// The in-memory run only changes after the append has been committed.
    pub fn record(&self, run: &mut Run, step_index: u32, body: EventBody) -> Result<Event> {
        let event = Event::new(
            &run.run_id,
            step_index,
            run.last_sequence_no + 1,
            Utc::now(),
            &body,
        )?;
        self.log.append(&event)?;
        run.apply(&event)?;
        Ok(event)
    }

    /// Runs under the root, newest first. `limit = 0` means no limit.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.root.display()));
            }
        };

        let mut summaries = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("read {}", self.root.display()))?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(run_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.run_paths(&run_id) {
                Ok(paths) if paths.events_path.exists() => {}
                _ => continue,
            }
            match self.load(&run_id) {
                Ok(run) => summaries.push(RunSummary::from(&run)),
                Err(err) => warn!(run_id = %run_id, error = ?err, "skipping unreadable run"),
            }
        }
        summaries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        if limit > 0 {
            summaries.truncate(limit);
        }
        Ok(summaries)
    }

    fn read_snapshot(&self, run_id: &str) -> Result<Option<Run>> {
        let path = self.run_paths(run_id)?.state_path;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        match serde_json::from_str::<Run>(&contents) {
            Ok(run) => Ok(Some(run)),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring unreadable run snapshot");
                Ok(None)
            }
        }
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("snapshot path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp snapshot {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace snapshot {}", path.display()))?;
    Ok(())
}
