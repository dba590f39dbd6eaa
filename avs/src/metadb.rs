use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use fs4::FileExt;

use crate::error::{CResult, Error};

/// The metadata key-value index backing one container: an append-only log
/// file plus an in-memory ordered map holding the live entries. Entries are
/// small (bincode-encoded metadata), so keeping values in memory is fine.
///
/// The log framing is:
///
/// - Key length as big-endian u32.
/// - Value length as big-endian i32, or -1 for tombstones.
/// - Key as raw bytes.
/// - Value as raw bytes.
///
/// Compaction runs in a two-phase mode: `compact_start` opens a parallel
/// side log, `compact_put` writes the surviving entries there, and
/// `compact_end(true)` renames the side log over the live one and swaps the
/// map, while `compact_end(false)` discards it.
pub struct MetaDb {
    path: PathBuf,
    file: File,
    index: BTreeMap<Vec<u8>, Vec<u8>>,
    compact: Option<CompactState>,
}

struct CompactState {
    path: PathBuf,
    file: File,
    index: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MetaDb {
    /// Opens or creates the index log at the given path, rebuilding the
    /// in-memory map from it. Takes an exclusive lock on the file.
    pub fn open(path: PathBuf) -> CResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|err| Error::Internal(format!("{}: {:?}", err, dir)))?;
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.try_lock_exclusive()?;

        let mut db = Self {
            path,
            file,
            index: BTreeMap::new(),
            compact: None,
        };
        db.index = db.build_index()?;
        log::info!(
            "metadb {} holds {} live entries",
            db.path.display(),
            db.index.len()
        );
        Ok(db)
    }

    /// Scans the log from the start and rebuilds the live map. An incomplete
    /// entry at the end of the file is assumed to be a torn write and the
    /// file is truncated to the last whole entry.
    fn build_index(&mut self) -> CResult<BTreeMap<Vec<u8>, Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        let mut index = BTreeMap::new();
        let file_len = self.file.metadata()?.len();
        let mut r = BufReader::new(&mut self.file);
        let mut pos = r.seek(SeekFrom::Start(0))?;

        while pos < file_len {
            let mut entry = || -> Result<(Vec<u8>, Option<Vec<u8>>, u64), std::io::Error> {
                r.read_exact(&mut len_buf)?;
                let key_len = u32::from_be_bytes(len_buf);
                r.read_exact(&mut len_buf)?;
                let value_len_or_tombstone = match i32::from_be_bytes(len_buf) {
                    l if l >= 0 => Some(l as u32),
                    _ => None,
                };

                let mut key = vec![0; key_len as usize];
                r.read_exact(&mut key)?;

                let value = match value_len_or_tombstone {
                    Some(value_len) => {
                        let mut value = vec![0; value_len as usize];
                        r.read_exact(&mut value)?;
                        Some(value)
                    }
                    None => None,
                };
                let next = pos
                    + 4
                    + 4
                    + key_len as u64
                    + value_len_or_tombstone.unwrap_or(0) as u64;
                Ok((key, value, next))
            };

            match entry() {
                Ok((key, Some(value), next)) => {
                    index.insert(key, value);
                    pos = next;
                }
                Ok((key, None, next)) => {
                    index.remove(&key);
                    pos = next;
                }
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::error!(
                        "found incomplete entry at offset {} in {}, truncating",
                        pos,
                        self.path.display()
                    );
                    r.get_mut().set_len(pos)?;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(index)
    }

    /// Returns the value for the key, or `Error::NotFound`.
    pub fn get(&self, key: &[u8]) -> CResult<Vec<u8>> {
        self.index.get(key).cloned().ok_or(Error::NotFound)
    }

    /// Inserts or replaces an entry, appending it to the log.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> CResult<()> {
        write_entry(&mut self.file, key, Some(value))?;
        self.index.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    /// Removes an entry, appending a tombstone to the log.
    pub fn delete(&mut self, key: &[u8]) -> CResult<()> {
        write_entry(&mut self.file, key, None)?;
        self.index.remove(key);
        Ok(())
    }

    /// Ordered iteration over all entries whose key is >= `start`.
    pub fn scan_from(&self, start: &[u8]) -> impl Iterator<Item = (&Vec<u8>, &Vec<u8>)> {
        self.index
            .range::<Vec<u8>, _>((Bound::Included(start.to_vec()), Bound::Unbounded))
    }

    /// The number of live entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The path of the live log file, used by the compaction disk precheck.
    pub fn raw_filepath(&self) -> &Path {
        &self.path
    }

    /// Enters compact mode, opening a side log next to the live one.
    pub fn compact_start(&mut self) -> CResult<()> {
        if self.compact.is_some() {
            return Err(Error::Value("metadb already in compact mode".to_string()));
        }

        let mut side_path = self.path.clone();
        side_path.set_extension("compact");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&side_path)?;
        file.try_lock_exclusive()?;

        self.compact = Some(CompactState {
            path: side_path,
            file,
            index: BTreeMap::new(),
        });
        Ok(())
    }

    /// Writes one surviving entry into the side log.
    pub fn compact_put(&mut self, key: &[u8], value: &[u8]) -> CResult<()> {
        let state = self
            .compact
            .as_mut()
            .ok_or_else(|| Error::Value("metadb not in compact mode".to_string()))?;
        write_entry(&mut state.file, key, Some(value))?;
        state.index.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    /// Leaves compact mode. Committing renames the side log over the live
    /// one and swaps the map; aborting deletes the side log.
    pub fn compact_end(&mut self, committed: bool) -> CResult<()> {
        let state = self
            .compact
            .take()
            .ok_or_else(|| Error::Value("metadb not in compact mode".to_string()))?;

        if !committed {
            drop(state.file);
            let _ = std::fs::remove_file(&state.path);
            return Ok(());
        }

        state.file.sync_all()?;
        std::fs::rename(&state.path, &self.path).map_err(|err| {
            Error::Internal(format!(
                "metadb compact swap from {:?} to {:?} failed: {}",
                state.path, self.path, err
            ))
        })?;

        // The renamed descriptor now backs the live path.
        self.file = state.file;
        self.index = state.index;
        Ok(())
    }
}

/// Attempt to flush the log when the index is dropped.
impl Drop for MetaDb {
    fn drop(&mut self) {
        if let Err(error) = self.file.sync_all() {
            log::error!("failed to flush metadb {}: {}", self.path.display(), error);
        }
    }
}

/// Appends one key/value entry, a `None` value being a tombstone. Returns
/// the entry's position and length.
fn write_entry(file: &mut File, key: &[u8], value: Option<&[u8]>) -> CResult<(u64, u32)> {
    let key_len = key.len() as u32;
    let value_len = value.map_or(0, |v| v.len() as u32);
    let value_len_or_tombstone = value.map_or(-1, |v| v.len() as i32);
    let len = 4 + 4 + key_len + value_len;

    let pos = file.seek(SeekFrom::End(0))?;
    let mut w = BufWriter::with_capacity(len as usize, file);
    w.write_all(&key_len.to_be_bytes())?;
    w.write_all(&value_len_or_tombstone.to_be_bytes())?;
    w.write_all(key)?;
    if let Some(value) = value {
        w.write_all(value)?;
    }
    w.flush()?;

    Ok((pos, len))
}
