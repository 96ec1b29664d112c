//! File journal recorder.
//!
//! Each execution is one JSON-lines file, `<dir>/<execution_id>.jsonl`.
//! Every line is a [`JournalEntry`] carrying a sequence number and a
//! BLAKE3 checksum chained to the previous entry, so a line cannot be
//! rewritten or removed without breaking every line after it. A record is
//! written (and, when configured, fsynced) before it is visible to readers.
//!
//! On open the directory is replayed:
//! - a checksum mismatch or sequence gap fails the open
//! - a torn final line, left by a crash mid-write, is truncated away
//! - a journal with no complete entry is renamed to `*.jsonl.unreadable`
//!   and skipped

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::procedure::StepNumber;
use crate::result_ext::ResultExt;

use super::log::ExecutionLog;
use super::models::{ExecutionHeader, ExecutionRecord, ExecutionSeal, StepCompletion};
use super::{ExecutionId, ExecutionRecorder};

const JOURNAL_EXTENSION: &str = "jsonl";
const UNREADABLE_EXTENSION: &str = "jsonl.unreadable";
const CHECKSUM_DOMAIN: &[u8] = b"sop-journal-entry-v1:";

/// One line of a journal file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub sequence: u64,
    pub record: ExecutionRecord,
    /// Hex BLAKE3 over the previous entry's checksum, the sequence and the
    /// record. The first entry chains to the empty string.
    pub checksum: String,
}

impl JournalEntry {
    pub fn new(sequence: u64, record: ExecutionRecord, previous: &str) -> EngineResult<Self> {
        let checksum = compute_checksum(sequence, &record, previous)?;
        Ok(Self {
            sequence,
            record,
            checksum,
        })
    }

    /// Check the entry against the checksum of the entry before it.
    pub fn verify_checksum(&self, previous: &str) -> bool {
        compute_checksum(self.sequence, &self.record, previous)
            .map(|expected| expected == self.checksum)
            .unwrap_or(false)
    }
}

fn compute_checksum(
    sequence: u64,
    record: &ExecutionRecord,
    previous: &str,
) -> EngineResult<String> {
    let encoded = serde_json::to_vec(record)?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(CHECKSUM_DOMAIN);
    hasher.update(previous.as_bytes());
    hasher.update(b":");
    hasher.update(&sequence.to_le_bytes());
    hasher.update(&encoded);
    Ok(hasher.finalize().to_hex().to_string())
}

/// Open journal of one execution.
#[derive(Debug)]
struct JournalFile {
    log: ExecutionLog,
    file: File,
    next_sequence: u64,
    last_checksum: String,
}

impl JournalFile {
    fn write_record(&mut self, record: ExecutionRecord, sync: bool) -> EngineResult<()> {
        let entry = JournalEntry::new(self.next_sequence, record, &self.last_checksum)?;
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .log("writing journal entry")?;
        if sync {
            self.file.sync_data().log("syncing journal")?;
        }
        self.next_sequence += 1;
        self.last_checksum = entry.checksum;
        Ok(())
    }
}

/// Recorder backed by one journal file per execution.
#[derive(Debug)]
pub struct JournalRecorder {
    dir: PathBuf,
    sync_writes: bool,
    executions: RwLock<HashMap<ExecutionId, Arc<Mutex<JournalFile>>>>,
}

fn poisoned() -> EngineError {
    EngineError::Storage("journal lock poisoned".to_string())
}

impl JournalRecorder {
    /// Open (creating if needed) a journal directory and replay every
    /// execution in it.
    pub fn open(dir: impl Into<PathBuf>, config: &EngineConfig) -> EngineResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).log("creating journal directory")?;

        let start = Instant::now();
        let mut executions = HashMap::new();
        let mut record_count = 0usize;
        let mut unreadable = 0usize;

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(JOURNAL_EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let replayed = match replay_file(&path)? {
                Replay::Loaded(replayed) => replayed,
                Replay::Unreadable(reason) => {
                    quarantine(&path, &reason)?;
                    unreadable += 1;
                    continue;
                }
            };
            record_count += replayed.next_sequence as usize;

            let mut file = OpenOptions::new()
                .append(true)
                .open(&path)
                .log("opening journal for append")?;
            if replayed.unterminated {
                file.write_all(b"\n").log("terminating journal line")?;
            }
            executions.insert(
                *replayed.log.execution_id(),
                Arc::new(Mutex::new(JournalFile {
                    log: replayed.log,
                    file,
                    next_sequence: replayed.next_sequence,
                    last_checksum: replayed.last_checksum,
                })),
            );
        }

        let duration = start.elapsed();
        info!(
            target: "sop.performance",
            journal_dir = %dir.display(),
            execution_count = executions.len(),
            record_count,
            unreadable,
            duration_ms = %duration.as_millis(),
            "Journal replayed"
        );
        if duration.as_millis() > u128::from(config.slow_replay_ms) {
            warn!(
                target: "sop.performance",
                journal_dir = %dir.display(),
                record_count,
                duration_ms = %duration.as_millis(),
                "Slow journal replay detected"
            );
        }

        Ok(Self {
            dir,
            sync_writes: config.sync_writes,
            executions: RwLock::new(executions),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, execution_id: &ExecutionId) -> PathBuf {
        self.dir
            .join(format!("{}.{}", execution_id, JOURNAL_EXTENSION))
    }

    fn journal(&self, execution_id: &ExecutionId) -> EngineResult<Arc<Mutex<JournalFile>>> {
        let executions = self.executions.read().map_err(|_| poisoned())?;
        executions
            .get(execution_id)
            .cloned()
            .ok_or(EngineError::ExecutionNotFound(*execution_id))
    }
}

/// A journal read back from disk.
struct Replayed {
    log: ExecutionLog,
    next_sequence: u64,
    last_checksum: String,
    /// The last entry is complete but lacks its newline.
    unterminated: bool,
}

enum Replay {
    Loaded(Replayed),
    /// Holds no complete entry; nothing of the execution can be recovered.
    Unreadable(String),
}

/// Read one journal file back into a log.
///
/// Only the final line may be damaged: an unparseable last line without a
/// newline is a torn write and is truncated away. Anything else that does
/// not parse, chain or sequence is corruption and fails the replay.
fn replay_file(path: &Path) -> EngineResult<Replay> {
    let bytes = std::fs::read(path).log("reading journal for replay")?;
    let mut records = Vec::new();
    let mut last_checksum = String::new();
    let mut valid_len = 0usize;
    let mut unterminated = false;
    let mut torn = false;

    let mut offset = 0usize;
    let mut line_number = 0usize;
    while offset < bytes.len() {
        let (line, next, terminated) = match bytes[offset..].iter().position(|&b| b == b'\n') {
            Some(i) => (&bytes[offset..offset + i], offset + i + 1, true),
            None => (&bytes[offset..], bytes.len(), false),
        };
        line_number += 1;
        offset = next;

        if line.iter().all(u8::is_ascii_whitespace) {
            if terminated {
                valid_len = next;
            }
            continue;
        }

        let entry: JournalEntry = match serde_json::from_slice(line) {
            Ok(entry) => entry,
            Err(_) if !terminated => {
                torn = true;
                break;
            }
            Err(e) => {
                return Err(EngineError::Storage(format!(
                    "{} line {}: {}",
                    path.display(),
                    line_number,
                    e
                )))
            }
        };
        if entry.sequence != records.len() as u64 {
            return Err(EngineError::Storage(format!(
                "{} line {}: expected sequence {}, found {}",
                path.display(),
                line_number,
                records.len(),
                entry.sequence
            )));
        }
        if !entry.verify_checksum(&last_checksum) {
            return Err(EngineError::Storage(format!(
                "{} line {}: checksum mismatch",
                path.display(),
                line_number
            )));
        }

        last_checksum = entry.checksum;
        records.push(entry.record);
        valid_len = next;
        unterminated = !terminated;
    }

    if records.is_empty() {
        let reason = if torn {
            "only a torn entry"
        } else {
            "no entries"
        };
        return Ok(Replay::Unreadable(reason.to_string()));
    }

    if torn {
        warn!(
            journal = %path.display(),
            kept_records = records.len(),
            "Truncating torn final journal entry"
        );
        OpenOptions::new()
            .write(true)
            .open(path)
            .and_then(|file| file.set_len(valid_len as u64))
            .log("truncating torn journal entry")?;
    }

    let next_sequence = records.len() as u64;
    let log = ExecutionLog::from_records(records)
        .map_err(|e| EngineError::Storage(format!("{}: {}", path.display(), e)))?;
    debug!(
        execution_id = %log.execution_id(),
        records = next_sequence,
        "Replayed execution journal"
    );
    Ok(Replay::Loaded(Replayed {
        log,
        next_sequence,
        last_checksum,
        unterminated,
    }))
}

/// Move an unreadable journal aside so the rest of the directory opens.
fn quarantine(path: &Path, reason: &str) -> EngineResult<()> {
    let target = path.with_extension(UNREADABLE_EXTENSION);
    warn!(
        journal = %path.display(),
        moved_to = %target.display(),
        reason,
        "Skipping unreadable execution journal"
    );
    std::fs::rename(path, &target).log("quarantining unreadable journal")?;
    Ok(())
}

impl ExecutionRecorder for JournalRecorder {
    fn open(&self, header: ExecutionHeader) -> EngineResult<()> {
        let mut executions = self.executions.write().map_err(|_| poisoned())?;
        let execution_id = header.execution_id;
        if executions.contains_key(&execution_id) {
            return Err(EngineError::Storage(format!(
                "execution {} already exists",
                execution_id
            )));
        }

        let path = self.path_for(&execution_id);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .log("creating execution journal")?;
        let mut journal = JournalFile {
            log: ExecutionLog::new(header.clone()),
            file,
            next_sequence: 0,
            last_checksum: String::new(),
        };
        if let Err(e) = journal.write_record(ExecutionRecord::Opened(header), self.sync_writes) {
            drop(journal);
            if let Err(remove) = std::fs::remove_file(&path) {
                warn!(
                    journal = %path.display(),
                    error = %remove,
                    "Could not remove journal after failed open"
                );
            }
            return Err(e);
        }

        executions.insert(execution_id, Arc::new(Mutex::new(journal)));
        debug!(execution_id = %execution_id, "Opened execution journal");
        Ok(())
    }

    fn append(
        &self,
        completion: StepCompletion,
        expected_last: Option<StepNumber>,
    ) -> EngineResult<()> {
        let journal = self.journal(&completion.execution_id)?;
        let mut journal = journal.lock().map_err(|_| poisoned())?;

        journal.log.check_append(&completion, expected_last)?;
        journal.write_record(ExecutionRecord::Step(completion.clone()), self.sync_writes)?;
        journal.log.append(completion, expected_last)
    }

    fn seal(&self, seal: ExecutionSeal) -> EngineResult<ExecutionSeal> {
        let journal = self.journal(&seal.execution_id)?;
        let mut journal = journal.lock().map_err(|_| poisoned())?;

        if let Some(existing) = journal.log.check_seal(&seal)? {
            return Ok(existing);
        }
        journal.write_record(ExecutionRecord::Sealed(seal.clone()), self.sync_writes)?;
        let (seal, _) = journal.log.apply_seal(seal)?;
        Ok(seal)
    }

    fn records(&self, execution_id: &ExecutionId) -> EngineResult<Vec<ExecutionRecord>> {
        let journal = self.journal(execution_id)?;
        let journal = journal.lock().map_err(|_| poisoned())?;
        Ok(journal.log.records())
    }

    fn execution_ids(&self) -> EngineResult<Vec<ExecutionId>> {
        let executions = self.executions.read().map_err(|_| poisoned())?;
        let mut ids: Vec<_> = executions.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}
