//! Append-only data files holding committed value records.
//!
//! Records are checksummed frames appended to `data/<file_id:08>.dat`. A
//! record is never rewritten; committing a new value for an id appends a
//! new record and repoints the index. The active file rolls over once it
//! passes the configured size.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::frame::{self, FRAME_HEADER_LEN};
use crate::location::Location;

/// Magic of a data record frame: "TSDR".
pub const RECORD_MAGIC: u32 = 0x5453_4452;

struct ActiveFile {
    file_id: u32,
    file: Arc<File>,
    len: u64,
}

/// The set of data files under one store root.
pub struct DataFiles {
    dir: PathBuf,
    max_file_bytes: u64,
    active: Mutex<ActiveFile>,
    readers: RwLock<HashMap<u32, Arc<File>>>,
}

impl DataFiles {
    /// Opens the data directory, appending to the highest numbered file.
    pub fn open(dir: &Path, max_file_bytes: u64) -> StoreResult<Self> {
        fs::create_dir_all(dir)?;
        let mut highest = None;
        for entry in fs::read_dir(dir)? {
            let name = entry?.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".dat")) else {
                continue;
            };
            if let Ok(id) = stem.parse::<u32>() {
                highest = Some(highest.map_or(id, |h: u32| h.max(id)));
            }
        }
        let file_id = highest.unwrap_or(0);
        let file = Arc::new(Self::open_file(dir, file_id)?);
        let len = file.metadata()?.len();
        info!(dir = %dir.display(), file_id, len, "opened data files");

        let mut readers = HashMap::new();
        readers.insert(file_id, Arc::clone(&file));
        Ok(Self {
            dir: dir.to_path_buf(),
            max_file_bytes,
            active: Mutex::new(ActiveFile { file_id, file, len }),
            readers: RwLock::new(readers),
        })
    }

    fn file_path(dir: &Path, file_id: u32) -> PathBuf {
        dir.join(format!("{:08}.dat", file_id))
    }

    fn open_file(dir: &Path, file_id: u32) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(Self::file_path(dir, file_id))
    }

    /// Appends every payload as one record and returns their locations in
    /// the same order. With `sync`, each touched file is fsynced.
    pub fn append_all(&self, payloads: &[Vec<u8>], sync: bool) -> io::Result<Vec<Location>> {
        let mut active = self.active.lock();
        let mut locations = Vec::with_capacity(payloads.len());
        let mut touched: Vec<Arc<File>> = Vec::new();
        for payload in payloads {
            let record = frame::encode(RECORD_MAGIC, payload);
            if active.len > 0 && active.len + record.len() as u64 > self.max_file_bytes {
                touched.push(Arc::clone(&active.file));
                let next = active.file_id + 1;
                let file = Arc::new(Self::open_file(&self.dir, next)?);
                let len = file.metadata()?.len();
                self.readers.write().insert(next, Arc::clone(&file));
                info!(file_id = next, "rolled over to new data file");
                *active = ActiveFile {
                    file_id: next,
                    file,
                    len,
                };
            }
            active.file.write_all_at(&record, active.len)?;
            locations.push(Location {
                file_id: active.file_id,
                offset: active.len,
                length: record.len() as u32,
            });
            active.len += record.len() as u64;
        }
        if sync {
            for file in &touched {
                file.sync_data()?;
            }
            active.file.sync_data()?;
        }
        debug!(records = payloads.len(), file_id = active.file_id, "appended data records");
        Ok(locations)
    }

    /// Reads and verifies the record at `location`, returning its payload.
    pub fn read(&self, location: Location) -> StoreResult<Vec<u8>> {
        let file = self.reader(location.file_id)?;
        let mut buf = vec![0u8; location.length as usize];
        file.read_exact_at(&mut buf, location.offset).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                StoreError::corruption(format!(
                    "record at {}:{} runs past end of file",
                    location.file_id, location.offset
                ))
            } else {
                StoreError::IoError(e)
            }
        })?;
        if buf.len() < FRAME_HEADER_LEN {
            return Err(StoreError::corruption(format!(
                "record at {}:{} shorter than its header",
                location.file_id, location.offset
            )));
        }
        let payload = frame::decode(RECORD_MAGIC, &buf).map_err(|e| {
            StoreError::corruption(format!(
                "record at {}:{}: {}",
                location.file_id, location.offset, e
            ))
        })?;
        Ok(payload.to_vec())
    }

    fn reader(&self, file_id: u32) -> StoreResult<Arc<File>> {
        if let Some(file) = self.readers.read().get(&file_id) {
            return Ok(Arc::clone(file));
        }
        let path = Self::file_path(&self.dir, file_id);
        let file = File::open(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StoreError::corruption(format!("index points at missing data file {}", path.display()))
            } else {
                StoreError::IoError(e)
            }
        })?;
        let file = Arc::new(file);
        self.readers.write().insert(file_id, Arc::clone(&file));
        Ok(file)
    }

    /// Deletes every data file and starts over with an empty file 0.
    pub fn reset(&self) -> StoreResult<()> {
        let mut active = self.active.lock();
        let mut readers = self.readers.write();
        readers.clear();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "dat") {
                fs::remove_file(&path)?;
            }
        }
        let file = Arc::new(Self::open_file(&self.dir, 0)?);
        file.sync_all()?;
        readers.insert(0, Arc::clone(&file));
        *active = ActiveFile {
            file_id: 0,
            file,
            len: 0,
        };
        info!(dir = %self.dir.display(), "removed all data files");
        Ok(())
    }

    /// Number of the file currently appended to.
    pub fn active_file_id(&self) -> u32 {
        self.active.lock().file_id
    }

    /// Total bytes across all data files.
    pub fn total_bytes(&self) -> StoreResult<u64> {
        let mut total = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.path().extension().is_some_and(|e| e == "dat") {
                total += entry.metadata()?.len();
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let files = DataFiles::open(dir.path(), 1 << 20).unwrap();
        let locs = files
            .append_all(&[b"one".to_vec(), b"two".to_vec()], true)
            .unwrap();
        assert_eq!(locs[0].offset, 0);
        assert_eq!(locs[1].offset, locs[0].length as u64);
        assert_eq!(files.read(locs[1]).unwrap(), b"two");
    }

    #[test]
    fn test_rolls_over_past_limit() {
        let dir = TempDir::new().unwrap();
        let files = DataFiles::open(dir.path(), 40).unwrap();
        let payload = vec![7u8; 20];
        let locs = files
            .append_all(&[payload.clone(), payload.clone(), payload.clone()], false)
            .unwrap();
        assert_eq!(locs[0].file_id, 0);
        assert_eq!(locs[1].file_id, 1);
        assert_eq!(locs[2].file_id, 2);
        assert_eq!(files.active_file_id(), 2);
        for loc in locs {
            assert_eq!(files.read(loc).unwrap(), payload);
        }
    }

    #[test]
    fn test_reopen_appends_after_existing() {
        let dir = TempDir::new().unwrap();
        let first = {
            let files = DataFiles::open(dir.path(), 1 << 20).unwrap();
            files.append_all(&[b"a".to_vec()], true).unwrap()[0]
        };
        let files = DataFiles::open(dir.path(), 1 << 20).unwrap();
        let second = files.append_all(&[b"b".to_vec()], true).unwrap()[0];
        assert_eq!(second.offset, first.length as u64);
        assert_eq!(files.read(first).unwrap(), b"a");
        assert_eq!(files.total_bytes().unwrap(), 2 * first.length as u64);
    }

    #[test]
    fn test_bad_location_is_corruption() {
        let dir = TempDir::new().unwrap();
        let files = DataFiles::open(dir.path(), 1 << 20).unwrap();
        let loc = files.append_all(&[b"abc".to_vec()], false).unwrap()[0];
        let shifted = Location {
            offset: 1,
            ..loc
        };
        assert!(matches!(files.read(shifted), Err(StoreError::Corruption { .. })));
        let missing = Location { file_id: 9, ..loc };
        assert!(matches!(files.read(missing), Err(StoreError::Corruption { .. })));
    }
}
