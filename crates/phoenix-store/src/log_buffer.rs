//! Append-only per-session log streams.
//!
//! Each session owns an ordered stream whose sequence numbers start at 0 and
//! are gapless. Appends for one session are serialized by a writer mutex that
//! readers never touch; readers only take a short read lock on the entry
//! vector to copy out the requested tail. A reader polling with a
//! non-decreasing offset therefore sees every entry exactly once.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use crossbeam::sync::ShardedLock;
use phoenix_types::LogEntry;

use crate::error::StoreResult;
use crate::persist;

/// Writer-side state for one stream. Only touched by appenders.
struct StreamWriter {
    next_sequence: u64,
    sink: Option<File>,
}

struct SessionLog {
    entries: ShardedLock<Vec<LogEntry>>,
    writer: Mutex<StreamWriter>,
}

impl SessionLog {
    fn new(entries: Vec<LogEntry>) -> Self {
        let next_sequence = entries.len() as u64;
        Self {
            entries: ShardedLock::new(entries),
            writer: Mutex::new(StreamWriter {
                next_sequence,
                sink: None,
            }),
        }
    }
}

/// Durable, append-only log streams keyed by session id.
pub struct LogBuffer {
    streams: ShardedLock<HashMap<String, Arc<SessionLog>>>,
    dir: Option<PathBuf>,
}

impl LogBuffer {
    /// A purely in-memory buffer.
    pub fn in_memory() -> Self {
        Self {
            streams: ShardedLock::new(HashMap::new()),
            dir: None,
        }
    }

    /// Open (or create) a buffer persisted as one JSON-lines file per
    /// session under `dir`, reloading any existing history.
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut streams = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let loaded: Vec<(LogEntry, u64)> = persist::read_lines(&path)?;
            let session_id = loaded.first().map(|(e, _)| e.session_id.clone());

            // Keep the gapless prefix only, and cut anything after it off the
            // file so the next append does not land behind a torn line.
            let mut entries = Vec::new();
            let mut keep_bytes = 0;
            if let Some(session_id) = &session_id {
                for (i, (entry, end)) in loaded.into_iter().enumerate() {
                    if entry.sequence != i as u64 || entry.session_id != *session_id {
                        break;
                    }
                    keep_bytes = end;
                    entries.push(entry);
                }
            }
            persist::truncate(&path, keep_bytes)?;

            let Some(session_id) = session_id else {
                continue;
            };
            tracing::debug!(session_id = %session_id, entries = entries.len(), "Restored session log");
            streams.insert(session_id, Arc::new(SessionLog::new(entries)));
        }

        Ok(Self {
            streams: ShardedLock::new(streams),
            dir: Some(dir),
        })
    }

    fn stream(&self, session_id: &str) -> Option<Arc<SessionLog>> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    fn stream_or_create(&self, session_id: &str) -> Arc<SessionLog> {
        if let Some(log) = self.stream(session_id) {
            return log;
        }
        self.streams
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SessionLog::new(Vec::new())))
            .clone()
    }

    fn path_for(&self, session_id: &str) -> Option<PathBuf> {
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.as_ref().map(|d| d.join(format!("{safe}.jsonl")))
    }

    /// Append a message, assigning the next sequence number for the session.
    ///
    /// When persistent, the entry is on disk before it becomes visible to
    /// readers.
    pub fn append(&self, session_id: &str, message: impl Into<String>) -> StoreResult<LogEntry> {
        let log = self.stream_or_create(session_id);
        let mut writer = log.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let entry = LogEntry {
            session_id: session_id.to_string(),
            sequence: writer.next_sequence,
            timestamp: Utc::now(),
            message: message.into(),
        };

        if writer.sink.is_none() {
            if let Some(path) = self.path_for(session_id) {
                writer.sink = Some(persist::open_append(&path)?);
            }
        }
        if let Some(file) = writer.sink.as_mut() {
            persist::append_line(file, &entry)?;
        }

        log.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        writer.next_sequence += 1;
        Ok(entry)
    }

    /// All entries with `sequence >= from_offset`, ascending.
    /// Unknown sessions and offsets past the end yield an empty list.
    pub fn read(&self, session_id: &str, from_offset: u64) -> Vec<LogEntry> {
        let Some(log) = self.stream(session_id) else {
            return Vec::new();
        };
        let entries = log.entries.read().unwrap_or_else(PoisonError::into_inner);
        let start = usize::try_from(from_offset).unwrap_or(usize::MAX);
        entries.get(start..).map(<[LogEntry]>::to_vec).unwrap_or_default()
    }

    /// Number of entries appended for a session so far.
    pub fn len(&self, session_id: &str) -> u64 {
        self.stream(session_id)
            .map(|log| log.entries.read().unwrap_or_else(PoisonError::into_inner).len() as u64)
            .unwrap_or(0)
    }

    pub fn is_persistent(&self) -> bool {
        self.dir.is_some()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::in_memory()
    }
}
