//! Persistent state for Raft: voting metadata and the replicated log
//!
//! The log is the source of truth for all commands that have been proposed.
//! Together with `current_term` and `voted_for` it must reach stable storage
//! before any reply that depends on it is sent.

use crate::types::{Entry, LogIndex, NodeId, Term};
use crate::{RaftError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const LOG_MAGIC: &[u8; 8] = b"TKTLOG\x00\x01";
const META_MAGIC: &[u8; 8] = b"TKTMET\x00\x01";

/// Voting state that must survive crashes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Metadata {
    /// Latest term this server has seen (initialized to 0, increases monotonically)
    pub current_term: Term,

    /// Candidate that received vote in current term (or None)
    pub voted_for: Option<NodeId>,
}

/// Trait for Raft storage backends
///
/// Implementations must ensure durability: `append`, `delete_from` and
/// `save_meta` may not return before the change has reached stable storage.
pub trait Storage: Send + Sync + 'static {
    /// Voting metadata as loaded at open / last saved
    fn meta(&self) -> Metadata;

    /// Durably replace the voting metadata
    fn save_meta(&mut self, meta: &Metadata) -> Result<()>;

    /// Append entries to the log, returning the new last index
    fn append(&mut self, entries: Vec<Entry>) -> Result<LogIndex>;

    /// Get an entry at a specific index
    fn get(&self, index: LogIndex) -> Result<Option<Entry>>;

    /// Get a range of entries [start, end)
    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>>;

    /// Get up to `max` entries starting at `start`
    fn get_from(&self, start: LogIndex, max: usize) -> Result<Vec<Entry>>;

    /// Delete entries from index onwards (used when log conflicts are detected)
    fn delete_from(&mut self, index: LogIndex) -> Result<()>;

    /// Get the index of the last entry
    fn last_index(&self) -> LogIndex;

    /// Get the term of the last entry
    fn last_term(&self) -> Term;

    /// Get the term of a specific entry; index 0 is the sentinel with term 0
    fn get_term(&self, index: LogIndex) -> Result<Option<Term>>;
}

/// In-memory storage (for tests and single-process demos)
pub struct MemoryStorage {
    meta: Metadata,
    entries: Vec<Entry>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            meta: Metadata::default(),
            entries: vec![],
        }
    }

    /// Convert a log index to an array index
    fn to_array_index(&self, index: LogIndex) -> Option<usize> {
        if index.0 == 0 {
            return None;
        }
        Some((index.0 - 1) as usize)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn meta(&self) -> Metadata {
        self.meta
    }

    fn save_meta(&mut self, meta: &Metadata) -> Result<()> {
        self.meta = *meta;
        Ok(())
    }

    fn append(&mut self, entries: Vec<Entry>) -> Result<LogIndex> {
        self.entries.extend(entries);
        Ok(self.last_index())
    }

    fn get(&self, index: LogIndex) -> Result<Option<Entry>> {
        Ok(self
            .to_array_index(index)
            .and_then(|idx| self.entries.get(idx).cloned()))
    }

    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>> {
        let start_idx = self
            .to_array_index(start)
            .ok_or(RaftError::LogIndexOutOfRange(start))?;
        let end_idx = self
            .to_array_index(end)
            .unwrap_or(self.entries.len())
            .min(self.entries.len());

        if start_idx >= end_idx {
            return Ok(vec![]);
        }
        Ok(self.entries[start_idx..end_idx].to_vec())
    }

    fn get_from(&self, start: LogIndex, max: usize) -> Result<Vec<Entry>> {
        let start_idx = match self.to_array_index(start) {
            Some(idx) if idx < self.entries.len() => idx,
            _ => return Ok(vec![]),
        };
        let end_idx = (start_idx + max).min(self.entries.len());
        Ok(self.entries[start_idx..end_idx].to_vec())
    }

    fn delete_from(&mut self, index: LogIndex) -> Result<()> {
        if let Some(idx) = self.to_array_index(index) {
            self.entries.truncate(idx);
        }
        Ok(())
    }

    fn last_index(&self) -> LogIndex {
        LogIndex(self.entries.len() as u64)
    }

    fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(Term(0))
    }

    fn get_term(&self, index: LogIndex) -> Result<Option<Term>> {
        if index == LogIndex::ZERO {
            return Ok(Some(Term(0)));
        }
        Ok(self.get(index)?.map(|e| e.term))
    }
}

/// Durable file-backed storage
///
/// Layout: `raft.meta` is a whole-file record replaced atomically
/// (write temp, fsync, rename); `raft.log` is a magic header followed by
/// length-prefixed bincode entries, fsynced after every append.
/// The whole log is mirrored in memory; without compaction the log of a
/// demonstrator cluster stays small.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    meta: Metadata,
    entries: Vec<Entry>,
    log_file: File,
}

impl FileStorage {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let meta = Self::load_meta_file(&dir.join("raft.meta"))?;
        let entries = Self::load_log_file(&dir.join("raft.log"))?;

        let log_file = OpenOptions::new()
            .append(true)
            .open(dir.join("raft.log"))?;

        Ok(Self {
            dir,
            meta,
            entries,
            log_file,
        })
    }

    fn load_meta_file(path: &Path) -> Result<Metadata> {
        if !path.exists() {
            return Ok(Metadata::default());
        }
        let bytes = fs::read(path)?;
        if bytes.len() < META_MAGIC.len() || &bytes[..META_MAGIC.len()] != META_MAGIC {
            return Err(RaftError::StorageCorrupt(format!(
                "bad magic in {}",
                path.display()
            )));
        }
        bincode::deserialize(&bytes[META_MAGIC.len()..])
            .map_err(|e| RaftError::StorageCorrupt(format!("{}: {e}", path.display())))
    }

    fn load_log_file(path: &Path) -> Result<Vec<Entry>> {
        if !path.exists() {
            let mut file = File::create(path)?;
            file.write_all(LOG_MAGIC)?;
            file.sync_all()?;
            return Ok(vec![]);
        }

        let mut file = File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        if bytes.len() < LOG_MAGIC.len() || &bytes[..LOG_MAGIC.len()] != LOG_MAGIC {
            return Err(RaftError::StorageCorrupt(format!(
                "bad magic in {}",
                path.display()
            )));
        }

        let mut entries = Vec::new();
        let mut pos = LOG_MAGIC.len();
        while pos < bytes.len() {
            if pos + 4 > bytes.len() {
                return Err(RaftError::StorageCorrupt("truncated frame header".into()));
            }
            let len = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            if pos + len > bytes.len() {
                return Err(RaftError::StorageCorrupt("truncated entry frame".into()));
            }
            let entry: Entry = bincode::deserialize(&bytes[pos..pos + len])
                .map_err(|e| RaftError::StorageCorrupt(format!("undecodable entry: {e}")))?;
            pos += len;

            let expected = LogIndex(entries.len() as u64 + 1);
            if entry.index != expected {
                return Err(RaftError::StorageCorrupt(format!(
                    "non-dense log: found {} where {} was expected",
                    entry.index, expected
                )));
            }
            entries.push(entry);
        }

        Ok(entries)
    }

    fn encode_frame(entry: &Entry) -> Result<Vec<u8>> {
        let body = bincode::serialize(entry)
            .map_err(|e| RaftError::Internal(format!("entry encode: {e}")))?;
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Rewrite the whole log file from the in-memory mirror (used on truncation)
    fn rewrite_log(&mut self) -> Result<()> {
        let tmp_path = self.dir.join("raft.log.tmp");
        let log_path = self.dir.join("raft.log");

        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(LOG_MAGIC)?;
        for entry in &self.entries {
            tmp.write_all(&Self::encode_frame(entry)?)?;
        }
        tmp.sync_all()?;
        drop(tmp);

        fs::rename(&tmp_path, &log_path)?;
        self.log_file = OpenOptions::new().append(true).open(&log_path)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn meta(&self) -> Metadata {
        self.meta
    }

    fn save_meta(&mut self, meta: &Metadata) -> Result<()> {
        let tmp_path = self.dir.join("raft.meta.tmp");
        let meta_path = self.dir.join("raft.meta");

        let mut bytes = META_MAGIC.to_vec();
        bytes.extend(
            bincode::serialize(meta)
                .map_err(|e| RaftError::Internal(format!("meta encode: {e}")))?,
        );

        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&bytes)?;
        tmp.sync_all()?;
        drop(tmp);

        fs::rename(&tmp_path, &meta_path)?;
        self.meta = *meta;
        Ok(())
    }

    fn append(&mut self, entries: Vec<Entry>) -> Result<LogIndex> {
        let mut buf = Vec::new();
        for entry in &entries {
            buf.extend(Self::encode_frame(entry)?);
        }
        self.log_file.write_all(&buf)?;
        self.log_file.sync_data()?;
        self.entries.extend(entries);
        Ok(self.last_index())
    }

    fn get(&self, index: LogIndex) -> Result<Option<Entry>> {
        if index.0 == 0 {
            return Ok(None);
        }
        Ok(self.entries.get((index.0 - 1) as usize).cloned())
    }

    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>> {
        if start.0 == 0 {
            return Err(RaftError::LogIndexOutOfRange(start));
        }
        let start_idx = (start.0 - 1) as usize;
        let end_idx = end.0.saturating_sub(1).min(self.entries.len() as u64) as usize;
        if start_idx >= end_idx {
            return Ok(vec![]);
        }
        Ok(self.entries[start_idx..end_idx].to_vec())
    }

    fn get_from(&self, start: LogIndex, max: usize) -> Result<Vec<Entry>> {
        if start.0 == 0 || start.0 > self.entries.len() as u64 {
            return Ok(vec![]);
        }
        let start_idx = (start.0 - 1) as usize;
        let end_idx = (start_idx + max).min(self.entries.len());
        Ok(self.entries[start_idx..end_idx].to_vec())
    }

    fn delete_from(&mut self, index: LogIndex) -> Result<()> {
        if index.0 == 0 || index.0 > self.entries.len() as u64 {
            if index.0 == 0 {
                self.entries.clear();
                return self.rewrite_log();
            }
            return Ok(());
        }
        self.entries.truncate((index.0 - 1) as usize);
        self.rewrite_log()
    }

    fn last_index(&self) -> LogIndex {
        LogIndex(self.entries.len() as u64)
    }

    fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(Term(0))
    }

    fn get_term(&self, index: LogIndex) -> Result<Option<Term>> {
        if index == LogIndex::ZERO {
            return Ok(Some(Term(0)));
        }
        Ok(self.get(index)?.map(|e| e.term))
    }
}

/// Thread-safe wrapper around a storage backend
///
/// The log carries its own lock; node state is guarded separately so the
/// two never nest the wrong way around.
pub struct RaftLog {
    storage: Arc<RwLock<Box<dyn Storage>>>,
}

impl RaftLog {
    pub fn new(storage: Box<dyn Storage>) -> Self {
        Self {
            storage: Arc::new(RwLock::new(storage)),
        }
    }

    pub fn new_memory() -> Self {
        Self::new(Box::new(MemoryStorage::new()))
    }

    pub fn meta(&self) -> Metadata {
        self.storage.read().meta()
    }

    pub fn save_meta(&self, meta: &Metadata) -> Result<()> {
        self.storage.write().save_meta(meta)
    }

    pub fn append(&self, entries: Vec<Entry>) -> Result<LogIndex> {
        self.storage.write().append(entries)
    }

    pub fn get(&self, index: LogIndex) -> Result<Option<Entry>> {
        self.storage.read().get(index)
    }

    pub fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>> {
        self.storage.read().get_range(start, end)
    }

    pub fn get_from(&self, start: LogIndex, max: usize) -> Result<Vec<Entry>> {
        self.storage.read().get_from(start, max)
    }

    pub fn delete_from(&self, index: LogIndex) -> Result<()> {
        self.storage.write().delete_from(index)
    }

    pub fn last_index(&self) -> LogIndex {
        self.storage.read().last_index()
    }

    pub fn last_term(&self) -> Term {
        self.storage.read().last_term()
    }

    pub fn get_term(&self, index: LogIndex) -> Result<Option<Term>> {
        self.storage.read().get_term(index)
    }
}

impl Clone for RaftLog {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> Vec<Entry> {
        vec![
            Entry::new(Term(1), LogIndex(1), b"cmd1".to_vec()).with_client("c1", 1),
            Entry::new(Term(1), LogIndex(2), b"cmd2".to_vec()).with_client("c1", 2),
            Entry::new(Term(2), LogIndex(3), b"cmd3".to_vec()).with_client("c2", 1),
        ]
    }

    #[test]
    fn test_append_and_get() {
        let mut log = MemoryStorage::new();
        log.append(sample_entries()).unwrap();

        assert_eq!(log.last_index(), LogIndex(3));
        assert_eq!(log.last_term(), Term(2));

        let entry = log.get(LogIndex(2)).unwrap().unwrap();
        assert_eq!(entry.command, b"cmd2");
        assert_eq!(entry.term, Term(1));
    }

    #[test]
    fn test_sentinel_term() {
        let log = MemoryStorage::new();
        assert_eq!(log.get_term(LogIndex::ZERO).unwrap(), Some(Term(0)));
        assert_eq!(log.get_term(LogIndex(1)).unwrap(), None);
    }

    #[test]
    fn test_delete_from() {
        let mut log = MemoryStorage::new();
        log.append(sample_entries()).unwrap();
        log.delete_from(LogIndex(2)).unwrap();

        assert_eq!(log.last_index(), LogIndex(1));
        assert!(log.get(LogIndex(2)).unwrap().is_none());
    }

    #[test]
    fn test_get_range_and_from() {
        let mut log = MemoryStorage::new();
        log.append(sample_entries()).unwrap();

        let range = log.get_range(LogIndex(1), LogIndex(3)).unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].command, b"cmd1");
        assert_eq!(range[1].command, b"cmd2");

        let batch = log.get_from(LogIndex(2), 10).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].index, LogIndex(2));

        let bounded = log.get_from(LogIndex(1), 1).unwrap();
        assert_eq!(bounded.len(), 1);
    }

    #[test]
    fn test_meta_roundtrip_memory() {
        let mut log = MemoryStorage::new();
        let meta = Metadata {
            current_term: Term(4),
            voted_for: Some(NodeId(2)),
        };
        log.save_meta(&meta).unwrap();
        assert_eq!(log.meta(), meta);
    }

    #[test]
    fn test_file_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut storage = FileStorage::open(dir.path()).unwrap();
            storage.append(sample_entries()).unwrap();
            storage
                .save_meta(&Metadata {
                    current_term: Term(2),
                    voted_for: Some(NodeId(3)),
                })
                .unwrap();
        }

        let storage = FileStorage::open(dir.path()).unwrap();
        assert_eq!(storage.last_index(), LogIndex(3));
        assert_eq!(storage.last_term(), Term(2));
        assert_eq!(storage.meta().current_term, Term(2));
        assert_eq!(storage.meta().voted_for, Some(NodeId(3)));
        assert_eq!(storage.get(LogIndex(1)).unwrap().unwrap().command, b"cmd1");
    }

    #[test]
    fn test_file_storage_truncation_persists() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut storage = FileStorage::open(dir.path()).unwrap();
            storage.append(sample_entries()).unwrap();
            storage.delete_from(LogIndex(3)).unwrap();
            storage
                .append(vec![Entry::new(Term(3), LogIndex(3), b"cmd3b".to_vec())])
                .unwrap();
        }

        let storage = FileStorage::open(dir.path()).unwrap();
        assert_eq!(storage.last_index(), LogIndex(3));
        assert_eq!(storage.get(LogIndex(3)).unwrap().unwrap().command, b"cmd3b");
        assert_eq!(storage.last_term(), Term(3));
    }

    #[test]
    fn test_file_storage_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("raft.log"), b"not a log file at all").unwrap();

        match FileStorage::open(dir.path()) {
            Err(RaftError::StorageCorrupt(_)) => {}
            other => panic!("expected StorageCorrupt, got {other:?}"),
        }
    }
}
