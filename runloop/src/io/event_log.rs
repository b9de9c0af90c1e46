//! Append-only JSONL event log (`<root>/<run_id>/events.jsonl`).
//!
//! A successful [`EventLog::append`] is the durable commit point of a
//! sub-step: the line is written and fsynced before the call returns.
//!
//! A final line without a newline is an append that never committed (the
//! process died mid-write). Readers stop before it and the next append
//! truncates it. Every other malformed line is corruption and is reported,
//! never repaired.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

use crate::core::event::Event;
use crate::error::EngineError;
use crate::io::layout::{RunPaths, validate_run_id};

pub struct EventLog {
    root: PathBuf,
    /// Last committed sequence number per run, filled lazily.
    heads: Mutex<HashMap<String, u64>>,
}

impl EventLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            heads: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, run_id: &str) -> Result<PathBuf> {
        Ok(RunPaths::new(&self.root, run_id)?.events_path)
    }

    /// Durably append `event`. Fails with [`EngineError::SequenceViolation`]
    /// (leaving the log untouched) unless `event.sequence_no` is `head + 1`.
    pub fn append(&self, event: &Event) -> Result<()> {
        let path = self.path(&event.run_id)?;
        let mut heads = self
            .heads
            .lock()
            .map_err(|_| anyhow!("event log head cache poisoned"))?;
        let head = match heads.get(&event.run_id) {
            Some(head) => *head,
            None => self.scan_head(&event.run_id)?,
        };
        let expected = head + 1;
        if event.sequence_no != expected {
            return Err(EngineError::SequenceViolation {
                run_id: event.run_id.clone(),
                expected,
                actual: event.sequence_no,
            }
            .into());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create run dir {}", parent.display()))?;
        }
        discard_torn_tail(&path)?;

        let mut line = serde_json::to_string(event).context("serialize event")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open event log {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append to {}", path.display()))?;
        file.sync_all()
            .with_context(|| format!("sync {}", path.display()))?;

        heads.insert(event.run_id.clone(), expected);
        debug!(
            run_id = %event.run_id,
            sequence_no = event.sequence_no,
            kind = %event.kind,
            "event appended"
        );
        Ok(())
    }

    /// Lazily read a run's events, oldest first. Calling again restarts from
    /// the beginning. A run without a log yields nothing.
    pub fn read_all(&self, run_id: &str) -> Result<EventIter> {
        let path = self.path(run_id)?;
        let reader = match File::open(&path) {
            Ok(file) => Some(BufReader::new(file)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err).with_context(|| format!("open event log {}", path.display()));
            }
        };
        Ok(EventIter {
            reader,
            path,
            line_no: 0,
        })
    }

    /// Last committed sequence number, `0` for an empty or missing log.
    pub fn head(&self, run_id: &str) -> Result<u64> {
        validate_run_id(run_id)?;
        let mut heads = self
            .heads
            .lock()
            .map_err(|_| anyhow!("event log head cache poisoned"))?;
        if let Some(head) = heads.get(run_id) {
            return Ok(*head);
        }
        let head = self.scan_head(run_id)?;
        heads.insert(run_id.to_string(), head);
        Ok(head)
    }

    fn scan_head(&self, run_id: &str) -> Result<u64> {
        let mut head = 0;
        for event in self.read_all(run_id)? {
            head = event?.sequence_no;
        }
        Ok(head)
    }
}

/// Iterator over committed events of one run.
pub struct EventIter {
    reader: Option<BufReader<File>>,
    path: PathBuf,
    line_no: usize,
}

impl Iterator for EventIter {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        let mut line = String::new();
        loop {
            line.clear();
            let read = match reader.read_line(&mut line) {
                Ok(read) => read,
                Err(err) => {
                    self.reader = None;
                    return Some(
                        Err(err).with_context(|| format!("read {}", self.path.display())),
                    );
                }
            };
            if read == 0 {
                self.reader = None;
                return None;
            }
            self.line_no += 1;
            if !line.ends_with('\n') {
                warn!(
                    path = %self.path.display(),
                    line = self.line_no,
                    "ignoring uncommitted trailing event"
                );
                self.reader = None;
                return None;
            }
            if line.trim().is_empty() {
                continue;
            }
            let parsed = serde_json::from_str::<Event>(&line).with_context(|| {
                format!("corrupt event at {}:{}", self.path.display(), self.line_no)
            });
            if parsed.is_err() {
                self.reader = None;
            }
            return Some(parsed);
        }
    }
}

/// Truncate an unterminated final line left behind by a crash mid-append.
fn discard_torn_tail(path: &Path) -> Result<()> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("open {}", path.display())),
    };
    let len = file
        .metadata()
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    if len == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))
        .with_context(|| format!("seek {}", path.display()))?;
    file.read_exact(&mut last)
        .with_context(|| format!("read {}", path.display()))?;
    if last[0] == b'\n' {
        return Ok(());
    }

    let mut contents = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0))
        .with_context(|| format!("seek {}", path.display()))?;
    file.read_to_end(&mut contents)
        .with_context(|| format!("read {}", path.display()))?;
    let keep = contents
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map(|pos| pos as u64 + 1)
        .unwrap_or(0);
    warn!(
        path = %path.display(),
        dropped_bytes = len - keep,
        "truncating uncommitted trailing event"
    );
    file.set_len(keep)
        .with_context(|| format!("truncate {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::EventBody;
    use crate::core::policy::SafeModeConfig;
    use chrono::Utc;

    fn event(seq: u64) -> Event {
        let body = if seq == 1 {
            EventBody::RunCreated {
                goal: "goal".to_string(),
                max_steps: 3,
                safe_mode: SafeModeConfig::default(),
                stuck_window: 3,
            }
        } else {
            EventBody::PlanRequested { attempt: seq as u32 }
        };
        Event::new("run-1", 1, seq, Utc::now(), &body).expect("event")
    }

    fn read(log: &EventLog) -> Vec<u64> {
        log.read_all("run-1")
            .expect("read")
            .map(|event| event.expect("event").sequence_no)
            .collect()
    }

    #[test]
    fn append_then_read_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = EventLog::new(temp.path());
        for seq in 1..=3 {
            log.append(&event(seq)).expect("append");
        }

        assert_eq!(read(&log), vec![1, 2, 3]);
        assert_eq!(read(&log), vec![1, 2, 3]);
        assert_eq!(log.head("run-1").expect("head"), 3);
    }

    #[test]
    fn skipped_sequence_is_rejected_without_writing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = EventLog::new(temp.path());
        log.append(&event(1)).expect("append");
        let before = fs::read(log.path("run-1").expect("path")).expect("read");

        let err = log.append(&event(3)).expect_err("gap");
        assert_eq!(
            err.downcast_ref::<EngineError>(),
            Some(&EngineError::SequenceViolation {
                run_id: "run-1".to_string(),
                expected: 2,
                actual: 3,
            })
        );
        let after = fs::read(log.path("run-1").expect("path")).expect("read");
        assert_eq!(after, before);
    }

    #[test]
    fn head_survives_a_new_log_handle() {
        let temp = tempfile::tempdir().expect("tempdir");
        EventLog::new(temp.path())
            .append(&event(1))
            .expect("append");

        let reopened = EventLog::new(temp.path());
        assert_eq!(reopened.head("run-1").expect("head"), 1);
        reopened.append(&event(2)).expect("append");
        assert_eq!(read(&reopened), vec![1, 2]);
    }

    #[test]
    fn torn_tail_is_skipped_then_truncated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = EventLog::new(temp.path());
        log.append(&event(1)).expect("append");
        let mut file = OpenOptions::new()
            .append(true)
            .open(log.path("run-1").expect("path"))
            .expect("open");
        file.write_all(br#"{"run_id":"run-1","step_ind"#).expect("write");
        drop(file);

        let reopened = EventLog::new(temp.path());
        assert_eq!(read(&reopened), vec![1]);
        reopened.append(&event(2)).expect("append");
        assert_eq!(read(&reopened), vec![1, 2]);
    }

    #[test]
    fn corrupt_committed_line_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = EventLog::new(temp.path());
        log.append(&event(1)).expect("append");
        let mut file = OpenOptions::new()
            .append(true)
            .open(log.path("run-1").expect("path"))
            .expect("open");
        file.write_all(b"not json\n").expect("write");
        drop(file);

        let results: Vec<_> = log.read_all("run-1").expect("read").collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[test]
    fn missing_log_reads_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = EventLog::new(temp.path());
        assert_eq!(log.read_all("nope").expect("read").count(), 0);
        assert_eq!(log.head("nope").expect("head"), 0);
    }
}
