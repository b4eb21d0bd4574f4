//! Commit journal for index page updates.
//!
//! Each commit writes exactly one record holding every pending page op of
//! every tree, fsyncs it, applies the ops to the index files and then
//! truncates the journal. On open, a complete record is replayed; a torn
//! one (the crash happened while writing it) is discarded since none of
//! its ops reached the index files.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::btree::PageOp;
use crate::error::{StoreError, StoreResult};
use crate::frame;
use crate::xfiles::Shape;

/// Magic of a journal record frame: "TSJR".
pub const JOURNAL_MAGIC: u32 = 0x5453_4A52;

/// All index changes of one commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Commit sequence number.
    pub sequence: u64,
    /// Textual id of the committing transaction.
    pub xid: String,
    /// Page ops per tree.
    pub trees: Vec<(Shape, Vec<PageOp>)>,
}

/// Counters of the commit journal.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JournalStats {
    /// Records written.
    pub records_written: u64,
    /// Bytes written.
    pub bytes_written: u64,
    /// Records replayed at open.
    pub records_replayed: u64,
    /// Torn records discarded at open.
    pub torn_discarded: u64,
}

/// The single-record commit journal file.
pub struct CommitJournal {
    file: File,
    path: PathBuf,
    stats: JournalStats,
}

impl CommitJournal {
    /// Opens or creates the journal at `path`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            stats: JournalStats::default(),
        })
    }

    /// Returns the record left by an interrupted commit, if it is complete.
    /// A torn record is discarded and the journal cleared.
    pub fn recover(&mut self) -> StoreResult<Option<JournalRecord>> {
        let len = self.file.metadata()?.len() as usize;
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, 0)?;
        if buf.is_empty() {
            return Ok(None);
        }
        match frame::decode(JOURNAL_MAGIC, &buf) {
            Ok(payload) => {
                let record: JournalRecord = bincode::deserialize(payload).map_err(|e| {
                    StoreError::corruption(format!(
                        "journal {} passed its checksum but does not decode: {}",
                        self.path.display(),
                        e
                    ))
                })?;
                self.stats.records_replayed += 1;
                warn!(
                    path = %self.path.display(),
                    sequence = record.sequence,
                    xid = %record.xid,
                    "found complete journal record from interrupted commit"
                );
                Ok(Some(record))
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "discarding torn journal record");
                self.stats.torn_discarded += 1;
                self.clear(true)?;
                Ok(None)
            }
        }
    }

    /// Replaces the journal contents with `record`, fsyncing when `sync`.
    pub fn write(&mut self, record: &JournalRecord, sync: bool) -> io::Result<()> {
        let payload = bincode::serialize(record).map_err(io::Error::other)?;
        let framed = frame::encode(JOURNAL_MAGIC, &payload);
        self.file.set_len(0)?;
        self.file.write_all_at(&framed, 0)?;
        if sync {
            self.file.sync_data()?;
        }
        self.stats.records_written += 1;
        self.stats.bytes_written += framed.len() as u64;
        debug!(sequence = record.sequence, bytes = framed.len(), "journal record written");
        Ok(())
    }

    /// Empties the journal once its record has been applied.
    pub fn clear(&mut self, sync: bool) -> io::Result<()> {
        self.file.set_len(0)?;
        if sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Journal counters.
    pub fn stats(&self) -> &JournalStats {
        &self.stats
    }

    /// Journal file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node::Node;
    use tempfile::TempDir;

    fn record() -> JournalRecord {
        JournalRecord {
            sequence: 4,
            xid: "abc".to_string(),
            trees: vec![
                (Shape::Stream, vec![PageOp::Write(Node::leaf(0)), PageOp::Delete(3)]),
                (Shape::Mjd, vec![]),
            ],
        }
    }

    #[test]
    fn test_empty_journal_has_nothing_to_replay() {
        let dir = TempDir::new().unwrap();
        let mut journal = CommitJournal::open(&dir.path().join("commit.jrn")).unwrap();
        assert_eq!(journal.recover().unwrap(), None);
    }

    #[test]
    fn test_complete_record_recovered() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commit.jrn");
        {
            let mut journal = CommitJournal::open(&path).unwrap();
            journal.write(&record(), true).unwrap();
        }
        let mut journal = CommitJournal::open(&path).unwrap();
        assert_eq!(journal.recover().unwrap(), Some(record()));
        assert_eq!(journal.stats().records_replayed, 1);
    }

    #[test]
    fn test_torn_record_discarded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commit.jrn");
        {
            let mut journal = CommitJournal::open(&path).unwrap();
            journal.write(&record(), true).unwrap();
        }
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 5).unwrap();

        let mut journal = CommitJournal::open(&path).unwrap();
        assert_eq!(journal.recover().unwrap(), None);
        assert_eq!(journal.stats().torn_discarded, 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_clear_after_apply() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commit.jrn");
        let mut journal = CommitJournal::open(&path).unwrap();
        journal.write(&record(), false).unwrap();
        journal.clear(false).unwrap();
        assert_eq!(journal.recover().unwrap(), None);
    }
}
