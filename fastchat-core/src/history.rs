//! Bounded, disk-backed history of recently relayed envelopes.
//!
//! The buffer is the authority for a running relay. The file next to it is a
//! best-effort mirror that is rewritten in full after every append, so a
//! crash mid-write can lose at most the newest snapshot.

use std::{
    collections::VecDeque,
    fs, io,
    path::{Path, PathBuf},
};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    Envelope, EnvelopeKind, HISTORY_FILE_NAME, HISTORY_MAX, MAX_MESSAGE_BYTES, timestamp_now,
};

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history file metadata read failed: {0}")]
    Metadata(#[source] io::Error),
    #[error("history file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("history file read failed: {0}")]
    Read(#[source] io::Error),
    #[error("history file parse failed: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("history serialize failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("history tmp write failed: {0}")]
    WriteTmp(#[source] io::Error),
    #[error("history rename failed: {0}")]
    Rename(#[source] io::Error),
}

pub fn default_history_path() -> PathBuf {
    std::env::temp_dir().join(HISTORY_FILE_NAME)
}

/// Largest history file accepted for a store of `capacity` entries: every
/// entry may be a full-size message, plus one entry of slack for the array
/// framing and timestamps.
pub fn max_history_file_bytes(capacity: usize) -> u64 {
    (capacity as u64)
        .saturating_add(1)
        .saturating_mul(MAX_MESSAGE_BYTES as u64)
}

/// Writes `items` to `<path>.tmp` and renames it into place.
pub fn write_history_file(path: &Path, items: &[Envelope]) -> Result<(), HistoryError> {
    write_items(path, &items)
}

fn write_items<T: Serialize + ?Sized>(path: &Path, items: &T) -> Result<(), HistoryError> {
    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_vec(items).map_err(HistoryError::Serialize)?;
    fs::write(&tmp, payload).map_err(HistoryError::WriteTmp)?;
    fs::rename(&tmp, path).map_err(HistoryError::Rename)?;
    Ok(())
}

#[derive(Debug)]
pub struct HistoryStore {
    entries: VecDeque<Envelope>,
    capacity: usize,
    path: Option<PathBuf>,
    revision: u64,
}

impl HistoryStore {
    /// A store holding up to [`HISTORY_MAX`] entries. `None` keeps history in
    /// memory only.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self::with_capacity(HISTORY_MAX, path)
    }

    pub fn with_capacity(capacity: usize, path: Option<PathBuf>) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            path,
            revision: 0,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Bumped by every [`push`](Self::push); lets a writer running outside
    /// the store skip snapshots that are already stale.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stamps `envelope`, stores it (evicting the oldest entry when full) and
    /// rewrites the history file. Returns the stored envelope.
    pub fn append(&mut self, envelope: Envelope) -> Envelope {
        let stored = self.push(envelope);
        if let Err(err) = self.persist() {
            warn!(path = ?self.path, "failed to persist history: {err}");
        }
        stored
    }

    /// Like [`append`](Self::append) without touching the file. The caller
    /// is responsible for writing [`snapshot`](Self::snapshot) out.
    pub fn push(&mut self, mut envelope: Envelope) -> Envelope {
        envelope.ts = Some(timestamp_now());
        self.push_bounded(envelope.clone());
        self.revision += 1;
        envelope
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<Envelope> {
        self.entries.iter().cloned().collect()
    }

    /// Replaces the buffer with the tail of the history file. Missing,
    /// oversized or unparsable files leave the store empty.
    pub fn load(&mut self) -> usize {
        match self.try_load() {
            Ok(count) => {
                if count > 0 {
                    info!(path = ?self.path, "history loaded: {count} message(s)");
                }
                count
            }
            Err(err) => {
                warn!(path = ?self.path, "could not load history: {err}");
                self.entries.clear();
                0
            }
        }
    }

    pub fn try_load(&mut self) -> Result<usize, HistoryError> {
        self.entries.clear();
        let Some(path) = self.path.as_deref() else {
            return Ok(0);
        };

        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(HistoryError::Metadata(err)),
        };
        let max = max_history_file_bytes(self.capacity);
        if meta.len() > max {
            return Err(HistoryError::TooLarge {
                size: meta.len(),
                max,
            });
        }

        let data = fs::read(path).map_err(HistoryError::Read)?;
        let items: Vec<Envelope> = serde_json::from_slice(&data).map_err(HistoryError::Parse)?;

        let stored = items
            .into_iter()
            .filter(|item| item.kind != EnvelopeKind::History)
            .map(|mut item| {
                if item.kind == EnvelopeKind::Unknown {
                    item.kind = Envelope::kind_for(&item.attachments);
                }
                item
            })
            .collect::<Vec<_>>();
        let skip = stored.len().saturating_sub(self.capacity);
        for item in stored.into_iter().skip(skip) {
            self.push_bounded(item);
        }
        Ok(self.entries.len())
    }

    /// Writes the whole buffer to the history file, if there is one.
    pub fn persist(&self) -> Result<(), HistoryError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let items = self.entries.iter().collect::<Vec<_>>();
        write_items(path, &items)
    }

    fn push_bounded(&mut self, envelope: Envelope) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(envelope);
    }
}
