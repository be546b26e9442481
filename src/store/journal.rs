//! Journal-backed document store.
//!
//! Every commit is appended to `keel.journal` as one length-prefixed bincode
//! record and fsynced before the in-memory tables are updated. Opening the
//! store replays the journal in order. A torn record at the tail (a crash in
//! the middle of an append) is discarded and the file truncated to the last
//! complete record. A failed append is rolled back to the previous length;
//! if the rollback itself fails the store refuses every later commit.
//!
//! Record layout: `len: u32 (LE) | bincode(JournalRecord)`. Document bodies
//! are carried as JSON bytes inside the record.

use super::memory::{Staged, StagedWrite, Tables};
use super::{Commit, Document, Store};
use crate::core::error::{KeelError, KeelResult};
use crate::core::time::unix_ms;
use crate::txn::op::Operation;
use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

/// Journal file name inside the data directory.
pub const JOURNAL_FILE: &str = "keel.journal";

/// One write inside a journal record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalWrite {
    collection: String,
    id: String,
    /// JSON-encoded document, or `None` for a removal.
    doc: Option<Vec<u8>>,
}

/// One committed transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalRecord {
    revision: u64,
    timestamp_ms: u64,
    writes: Vec<JournalWrite>,
}

impl JournalRecord {
    fn from_writes(revision: u64, writes: &[StagedWrite]) -> KeelResult<Self> {
        let writes = writes
            .iter()
            .map(|write| {
                let doc = match &write.doc {
                    Some(doc) => Some(serde_json::to_vec(doc).map_err(|e| {
                        KeelError::internal(format!("cannot encode journal document: {}", e))
                    })?),
                    None => None,
                };
                Ok(JournalWrite {
                    collection: write.collection.clone(),
                    id: write.id.clone(),
                    doc,
                })
            })
            .collect::<KeelResult<Vec<_>>>()?;

        Ok(Self {
            revision,
            timestamp_ms: unix_ms(),
            writes,
        })
    }

    fn into_writes(self) -> Result<Vec<StagedWrite>> {
        self.writes
            .into_iter()
            .map(|write| {
                let doc = match write.doc {
                    Some(bytes) => Some(
                        serde_json::from_slice::<Document>(&bytes)
                            .context("failed to decode journal document")?,
                    ),
                    None => None,
                };
                Ok(StagedWrite {
                    collection: write.collection,
                    id: write.id,
                    doc,
                })
            })
            .collect()
    }

    fn serialize(&self) -> KeelResult<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| KeelError::internal(format!("failed to serialize journal record: {}", e)))
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).context("failed to deserialize journal record")
    }
}

/// The open journal and the length of its committed prefix.
struct JournalFile {
    file: File,
    len: u64,
    /// Set when a failed append could not be rolled back.
    poisoned: bool,
    /// Write this many bytes of the next frame, then fail.
    #[cfg(test)]
    fail_after: Option<usize>,
    /// Fail the next rollback.
    #[cfg(test)]
    fail_rollback: bool,
}

impl JournalFile {
    fn new(file: File, len: u64) -> Self {
        Self {
            file,
            len,
            poisoned: false,
            #[cfg(test)]
            fail_after: None,
            #[cfg(test)]
            fail_rollback: false,
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        if let Some(limit) = self.fail_after.take() {
            self.file.write_all(&frame[..limit.min(frame.len())])?;
            return Err(io::Error::new(io::ErrorKind::Other, "injected append failure"));
        }
        self.file.write_all(frame)?;
        self.file.sync_data()
    }

    fn rollback(&mut self) -> io::Result<()> {
        #[cfg(test)]
        if std::mem::take(&mut self.fail_rollback) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected rollback failure"));
        }
        self.file.set_len(self.len)?;
        self.file.sync_data()
    }

    /// Append one frame. On failure the file is cut back to the last
    /// committed record, or the journal is poisoned if that fails too.
    fn append(&mut self, frame: &[u8]) -> KeelResult<()> {
        if self.poisoned {
            return Err(KeelError::store_unavailable(
                "journal is poisoned by an earlier failed append",
            ));
        }
        match self.write_frame(frame) {
            Ok(()) => {
                self.len += frame.len() as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.rollback() {
                    tracing::error!(error = %rollback, len = self.len, "journal rollback failed");
                    self.poisoned = true;
                } else {
                    tracing::warn!(error = %e, len = self.len, "journal append rolled back");
                }
                Err(KeelError::store_unavailable(format!("journal append failed: {}", e)))
            }
        }
    }
}

/// Durable [`Store`] backed by an append-only journal.
pub struct JournalStore {
    path: PathBuf,
    tables: RwLock<Tables>,
    /// Open journal file; held for the whole commit critical section.
    file: Mutex<JournalFile>,
}

impl std::fmt::Debug for JournalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalStore")
            .field("path", &self.path)
            .field("revision", &self.tables.read().revision())
            .finish()
    }
}

impl JournalStore {
    /// Open (or create) the journal in `data_dir` and replay it.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
        let path = data_dir.join(JOURNAL_FILE);

        let mut tables = Tables::default();
        let (records, valid_len) = Self::replay(&path, &mut tables)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open journal: {}", path.display()))?;

        let actual_len = file.metadata().context("failed to stat journal")?.len();
        if actual_len > valid_len {
            tracing::warn!(
                path = %path.display(),
                discarded_bytes = actual_len - valid_len,
                "discarding torn journal tail"
            );
            file.set_len(valid_len)
                .context("failed to truncate torn journal tail")?;
        }

        tracing::info!(
            path = %path.display(),
            records,
            revision = tables.revision(),
            "journal replayed"
        );

        Ok(Self {
            path,
            tables: RwLock::new(tables),
            file: Mutex::new(JournalFile::new(file, valid_len)),
        })
    }

    /// Journal file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay complete records into `tables`.
    ///
    /// Returns the number of records applied and the byte length of the
    /// valid prefix.
    fn replay(path: &Path, tables: &mut Tables) -> Result<(usize, u64)> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to open journal: {}", path.display()))
            }
        };
        let file_len = file
            .metadata()
            .with_context(|| format!("failed to stat journal: {}", path.display()))?
            .len();
        let mut reader = BufReader::new(file);
        let mut records = 0usize;
        let mut offset = 0u64;

        loop {
            let mut len_buf = [0u8; 4];
            if !read_full(&mut reader, &mut len_buf)? {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len as u64 > file_len.saturating_sub(offset + 4) {
                tracing::warn!(offset, len, "record length runs past end of journal");
                break;
            }
            let mut body = vec![0u8; len];
            if !read_full(&mut reader, &mut body)? {
                break;
            }
            let record = match JournalRecord::deserialize(&body) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(offset, error = %e, "stopping replay at unreadable record");
                    break;
                }
            };
            if record.revision != tables.revision() + 1 {
                anyhow::bail!(
                    "journal revision gap at offset {}: expected {}, found {}",
                    offset,
                    tables.revision() + 1,
                    record.revision
                );
            }
            let revision = record.revision;
            tables.install(revision, record.into_writes()?);
            records += 1;
            offset += 4 + len as u64;
        }

        Ok((records, offset))
    }
}

/// Fill `buf` completely. Returns `false` on a clean or torn end of file.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .context("failed to read journal")?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

impl Store for JournalStore {
    fn apply(&self, ops: &[Operation]) -> KeelResult<Commit> {
        let mut file = self.file.lock();
        let staged = self.tables.read().stage(ops)?;
        let Staged {
            revision,
            writes,
            changes,
        } = staged;

        let bytes = JournalRecord::from_writes(revision, &writes)?.serialize()?;
        let len = bytes.len() as u32;
        let mut frame = Vec::with_capacity(4 + bytes.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&bytes);

        file.append(&frame)?;

        self.tables.write().install(revision, writes);
        Ok(Commit { revision, changes })
    }

    fn fetch(&self, collection: &str, id: &str) -> KeelResult<Option<Document>> {
        Ok(self.tables.read().get(collection, id).cloned())
    }

    fn scan(&self, collection: &str, id_prefix: &str) -> KeelResult<Vec<Document>> {
        Ok(self.tables.read().scan(collection, id_prefix))
    }

    fn ping(&self) -> KeelResult<()> {
        if self.file.lock().poisoned {
            return Err(KeelError::store_unavailable("journal is poisoned"));
        }
        std::fs::metadata(&self.path)
            .map(|_| ())
            .map_err(|e| KeelError::store_unavailable(format!("journal unreachable: {}", e)))
    }

    fn revision(&self) -> u64 {
        self.tables.read().revision()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::op::Assertion;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> crate::store::Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_replay_restores_committed_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JournalStore::open(dir.path()).unwrap();
            store
                .apply(&[
                    Operation::new("units", "u1").insert(fields(json!({"life": "alive"}))),
                    Operation::new("units", "u2").insert(fields(json!({"life": "alive"}))),
                ])
                .unwrap();
            store
                .apply(&[Operation::new("units", "u1").set(fields(json!({"life": "dead"})))])
                .unwrap();
            store
                .apply(&[Operation::new("units", "u2").remove()])
                .unwrap();
        }

        let store = JournalStore::open(dir.path()).unwrap();
        assert_eq!(store.revision(), 3);
        let u1 = store.fetch("units", "u1").unwrap().unwrap();
        assert_eq!(u1.get("life"), Some(&json!("dead")));
        assert_eq!(u1.version, 2);
        assert!(store.fetch("units", "u2").unwrap().is_none());
    }

    #[test]
    fn test_aborted_commit_not_journaled() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JournalStore::open(dir.path()).unwrap();
            store
                .apply(&[Operation::new("units", "u1").insert(fields(json!({})))])
                .unwrap();
            let err = store
                .apply(&[
                    Operation::new("units", "u3").insert(fields(json!({}))),
                    Operation::new("units", "u1").assert(Assertion::DocMissing),
                ])
                .unwrap_err();
            assert_eq!(err, KeelError::TxnAborted);
        }

        let store = JournalStore::open(dir.path()).unwrap();
        assert_eq!(store.revision(), 1);
        assert!(store.fetch("units", "u3").unwrap().is_none());
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JournalStore::open(dir.path()).unwrap();
            store
                .apply(&[Operation::new("units", "u1").insert(fields(json!({})))])
                .unwrap();
        }

        let path = dir.path().join(JOURNAL_FILE);
        let clean_len = std::fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&64u32.to_le_bytes()).unwrap();
            file.write_all(b"partial").unwrap();
        }

        let store = JournalStore::open(dir.path()).unwrap();
        assert_eq!(store.revision(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), clean_len);

        store
            .apply(&[Operation::new("units", "u2").insert(fields(json!({})))])
            .unwrap();
        drop(store);

        let store = JournalStore::open(dir.path()).unwrap();
        assert_eq!(store.revision(), 2);
    }

    #[test]
    fn test_oversized_length_prefix_is_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JournalStore::open(dir.path()).unwrap();
            store
                .apply(&[Operation::new("units", "u1").insert(fields(json!({})))])
                .unwrap();
        }

        let path = dir.path().join(JOURNAL_FILE);
        let clean_len = std::fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&u32::MAX.to_le_bytes()).unwrap();
            file.write_all(&[0u8; 16]).unwrap();
        }

        let store = JournalStore::open(dir.path()).unwrap();
        assert_eq!(store.revision(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), clean_len);
    }

    #[test]
    fn test_failed_append_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(JOURNAL_FILE);
        {
            let store = JournalStore::open(dir.path()).unwrap();
            store
                .apply(&[Operation::new("units", "u1").insert(fields(json!({})))])
                .unwrap();
            let clean_len = std::fs::metadata(&path).unwrap().len();

            // Torn write, then a complete write whose sync fails.
            for fail_after in [10, usize::MAX] {
                store.file.lock().fail_after = Some(fail_after);
                let err = store
                    .apply(&[Operation::new("units", "u2")
                        .insert(fields(json!({"pad": "x".repeat(4096)})))])
                    .unwrap_err();
                assert!(matches!(err, KeelError::StoreUnavailable { .. }), "{:?}", err);
                assert_eq!(std::fs::metadata(&path).unwrap().len(), clean_len);
                assert_eq!(store.revision(), 1);
            }

            let commit = store
                .apply(&[Operation::new("units", "u3").insert(fields(json!({})))])
                .unwrap();
            assert_eq!(commit.revision, 2);
            store.ping().unwrap();
        }

        let store = JournalStore::open(dir.path()).unwrap();
        assert_eq!(store.revision(), 2);
        assert!(store.fetch("units", "u2").unwrap().is_none());
        assert!(store.fetch("units", "u3").unwrap().is_some());
    }

    #[test]
    fn test_failed_rollback_poisons_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::open(dir.path()).unwrap();
        {
            let mut file = store.file.lock();
            file.fail_after = Some(3);
            file.fail_rollback = true;
        }
        store
            .apply(&[Operation::new("units", "u1").insert(fields(json!({})))])
            .unwrap_err();

        let err = store
            .apply(&[Operation::new("units", "u2").insert(fields(json!({})))])
            .unwrap_err();
        assert!(matches!(err, KeelError::StoreUnavailable { .. }), "{:?}", err);
        assert!(store.ping().is_err());
        assert_eq!(store.revision(), 0);
    }
}
