use std::path::Path;

use crate::codec;
use crate::error::{CResult, Error};
use crate::handles;
use crate::object::{encode_index_key, Metadata};
use crate::paths;

use super::{State, Worker};

/// Ownership predicate handed to `compact`: `true` means the key still
/// belongs to this node, `false` marks an orphan to be dropped. Implemented
/// for closures.
pub trait HasCharge: Send {
    fn has_charge(&mut self, key: &[u8]) -> bool;
}

impl<F> HasCharge for F
where
    F: FnMut(&[u8]) -> bool + Send,
{
    fn has_charge(&mut self, key: &[u8]) -> bool {
        self(key)
    }
}

/// Compaction needs room for a full copy plus slack: free space must exceed
/// 1.5x the combined AVS and metadata-index size.
fn has_disk_headroom(free: u64, avs_size: u64, meta_db_size: u64) -> bool {
    free as f64 - (avs_size + meta_db_size) as f64 * 1.5 > 0.0
}

impl Worker {
    /// Rewrites the AVS file online, dropping tombstoned records, records
    /// superseded by a later write, and orphans the ownership predicate
    /// disclaims. Three phases: prepare (disk precheck, temporary file),
    /// scan-and-copy (under the index's compact mode), commit (symlink swap)
    /// or rollback. Never panics its way out: every failure after the
    /// prepare phase routes through the rollback so the worker stays
    /// serviceable.
    pub fn compact(&mut self, has_charge: &mut dyn HasCharge) -> CResult<()> {
        if self.state == State::Compacting {
            return Err(Error::Value("compaction already running".to_string()));
        }

        // Phase A: precheck and temporary file. Failures here leave no
        // trace: no history entry, no sticky error flag.
        let avs_size = std::fs::metadata(&self.backend.file_path)?.len();
        let meta_size = std::fs::metadata(self.meta_db.raw_filepath())?.len();
        let mount = self
            .backend
            .file_path
            .parent()
            .unwrap_or_else(|| Path::new("/"));
        let free = fs4::available_space(mount)?;
        if !has_disk_headroom(free, avs_size, meta_size) {
            log::warn!(
                "worker {}: compaction refused, {} free for {} live bytes",
                self.id,
                free,
                avs_size + meta_size
            );
            return Err(Error::SystemLimit);
        }

        let tmp_raw = paths::mint_raw_unique(&self.backend.file_path, &self.backend.file_path_raw);
        let (tmp_w, tmp_r) = match handles::open_handles(&tmp_raw) {
            Ok(pair) => pair,
            Err(err) => {
                let _ = std::fs::remove_file(&tmp_raw);
                return Err(err);
            }
        };
        self.backend.tmp_file_path_raw = Some(tmp_raw.clone());
        self.backend.tmp_write_handler = Some(tmp_w);
        self.backend.tmp_read_handler = Some(tmp_r);

        self.state = State::Compacting;
        self.stats.begin_compaction(chrono::Utc::now().timestamp());
        log::info!(
            "worker {}: compacting {} into {}",
            self.id,
            self.backend.file_path_raw.display(),
            tmp_raw.display()
        );

        let result = self.run_compaction(has_charge, &tmp_raw);

        // The history entry closes on success and failure alike.
        self.stats.finish_compaction(chrono::Utc::now().timestamp());
        self.state = State::Ready;
        result
    }

    fn run_compaction(&mut self, has_charge: &mut dyn HasCharge, tmp_raw: &Path) -> CResult<()> {
        if let Err(err) = self.meta_db.compact_start() {
            self.rollback(tmp_raw, false, &err);
            return Err(err);
        }

        let (num_active, size_active) = match self.scan_and_copy(has_charge) {
            Ok(counts) => counts,
            Err(err) => {
                self.rollback(tmp_raw, true, &err);
                return Err(err);
            }
        };

        if let Err(err) = self.commit(tmp_raw, num_active, size_active) {
            self.rollback(tmp_raw, true, &err);
            return Err(err);
        }
        Ok(())
    }

    /// Phase B: walk the live AVS record by record, copying survivors into
    /// the temporary file and their re-pointed metadata into the index's
    /// compact stream.
    fn scan_and_copy(&mut self, has_charge: &mut dyn HasCharge) -> CResult<(i64, i64)> {
        let mut num_active = 0i64;
        let mut size_active = 0i64;
        let mut offset = 0u64;

        loop {
            let read_h = self.backend.read_handle()?;
            let (mut meta, key_bin, body_bin, next_offset) =
                match codec::compact_get_at(read_h, offset) {
                    Ok(record) => record,
                    Err(Error::Eof) => return Ok((num_active, size_active)),
                    Err(err) => return Err(err),
                };

            let drop_record = self.is_deleted(&meta) || !has_charge.has_charge(&key_bin);
            if !drop_record {
                let tmp_w = self.backend.tmp_write_handle()?;
                let new_offset = codec::compact_put(tmp_w, &meta, &key_bin, &body_bin)?;
                meta.offset = new_offset;
                let k = encode_index_key(meta.addr_id, &meta.key);
                self.meta_db.compact_put(&k, &meta.to_bytes()?)?;
                num_active += 1;
                size_active += meta.size as i64;
            }
            offset = next_offset;
        }
    }

    /// A record is dead if it is a tombstone, its key has no authoritative
    /// index entry, that entry is tombstoned, or that entry points at a
    /// different offset (a later write superseded it).
    fn is_deleted(&self, meta: &Metadata) -> bool {
        if meta.is_deleted() {
            return true;
        }
        let k = encode_index_key(meta.addr_id, &meta.key);
        match self.meta_db.get(&k).and_then(|b| Metadata::from_bytes(&b)) {
            Ok(current) => current.is_deleted() || current.offset != meta.offset,
            Err(_) => true,
        }
    }

    /// Phase C, success path. The symlink swap is the commit point and must
    /// precede deletion of the old raw file.
    fn commit(&mut self, tmp_raw: &Path, num_active: i64, size_active: i64) -> CResult<()> {
        let old_raw = self.backend.file_path_raw.clone();

        if let (Some(write_h), Some(read_h)) = (
            self.backend.write_handler.take(),
            self.backend.read_handler.take(),
        ) {
            handles::close_handles(write_h, read_h)?;
        }
        if let (Some(tmp_w), Some(tmp_r)) = (
            self.backend.tmp_write_handler.take(),
            self.backend.tmp_read_handler.take(),
        ) {
            handles::close_handles(tmp_w, tmp_r)?;
        }

        paths::swap_symlink(&self.backend.file_path, tmp_raw)?;
        let _ = std::fs::remove_file(&old_raw);

        let (write_h, read_h) = handles::open_handles(&self.backend.file_path)?;
        self.backend.write_handler = Some(write_h);
        self.backend.read_handler = Some(read_h);
        self.backend.file_path_raw = tmp_raw.to_path_buf();
        self.backend.tmp_file_path_raw = None;

        self.meta_db.compact_end(true)?;

        self.stats.total_num = num_active;
        self.stats.active_num = num_active;
        self.stats.total_sizes = size_active;
        self.stats.active_sizes = size_active;
        log::info!(
            "worker {}: compaction committed, {} live records ({} bytes)",
            self.id,
            num_active,
            size_active
        );
        Ok(())
    }

    /// Phase C, failure path. The temporary file is only removed while the
    /// stable symlink still points at the old raw file; once the swap
    /// happened the temporary file *is* the live one and must survive.
    fn rollback(&mut self, tmp_raw: &Path, compact_mode: bool, cause: &Error) {
        self.stats.has_error = true;

        let swapped = std::fs::read_link(&self.backend.file_path)
            .map(|target| target == tmp_raw)
            .unwrap_or(false);
        if !swapped {
            let _ = std::fs::remove_file(tmp_raw);
        }
        self.backend.clear_tmp();

        if self.backend.write_handler.is_none() || self.backend.read_handler.is_none() {
            self.backend.write_handler = None;
            self.backend.read_handler = None;
            match handles::open_handles(&self.backend.file_path) {
                Ok((write_h, read_h)) => {
                    if let Ok(raw) = std::fs::read_link(&self.backend.file_path) {
                        self.backend.file_path_raw = raw;
                    }
                    self.backend.write_handler = Some(write_h);
                    self.backend.read_handler = Some(read_h);
                }
                Err(err) => {
                    log::error!(
                        "worker {}: reopen after failed compaction also failed: {}",
                        self.id,
                        err
                    );
                }
            }
        }

        if compact_mode {
            let _ = self.meta_db.compact_end(false);
        }
        log::error!("worker {}: compaction rolled back: {}", self.id, cause);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::error::Error;
    use crate::object::Object;

    use super::*;

    fn setup() -> CResult<(tempdir::TempDir, Worker)> {
        let dir = tempdir::TempDir::new("avs-compact")?;
        let worker = Worker::init("w0", 1, "m0", dir.path())?;
        Ok((dir, worker))
    }

    fn obj(key: &str, body: &str) -> Object {
        Object::new(42, key.as_bytes(), body.as_bytes())
    }

    #[test]
    fn headroom_predicate() {
        assert!(has_disk_headroom(1000, 100, 100));
        assert!(!has_disk_headroom(300, 100, 100));
        assert!(!has_disk_headroom(0, 0, 1));
        // 1.5x of zero live bytes still needs a positive remainder.
        assert!(has_disk_headroom(1, 0, 0));
        assert!(!has_disk_headroom(0, 0, 0));
    }

    #[test]
    fn compact_drops_tombstones_and_superseded_records() -> CResult<()> {
        let (dir, mut worker) = setup()?;
        worker.put(obj("a", "alpha"))?;
        worker.put(obj("b", "beta"))?;
        worker.put(obj("c", "gamma"))?;
        worker.put(obj("a", "alpha-2"))?;
        worker.delete(obj("b", ""))?;

        let stable = dir.path().join("object").join("1.avs");
        let old_raw = std::fs::read_link(&stable)?;
        let dirty_size = std::fs::metadata(&stable)?.len();

        worker.compact(&mut |_: &[u8]| true)?;

        // Two live records survive; the accounting resets to them.
        let stats = worker.stats();
        assert_eq!(stats.active_num, 2);
        assert_eq!(stats.total_num, 2);
        assert_eq!(stats.active_sizes, stats.total_sizes);
        assert!(!stats.has_error);

        // The symlink moved to a fresh raw file and the old one is gone.
        let new_raw = std::fs::read_link(&stable)?;
        assert_ne!(new_raw, old_raw);
        assert!(!old_raw.exists());
        assert!(std::fs::metadata(&stable)?.len() < dirty_size);

        // The live set is intact, the dead key is gone from the index.
        let (_, body) = worker.get(42, b"a", 0, -1)?;
        assert_eq!(body, b"alpha-2");
        let (_, body) = worker.get(42, b"c", 0, -1)?;
        assert_eq!(body, b"gamma");
        assert_eq!(worker.head(42, b"b"), Err(Error::NotFound));
        Ok(())
    }

    #[test]
    fn compact_drops_orphans() -> CResult<()> {
        let (_dir, mut worker) = setup()?;
        worker.put(obj("a", "mine"))?;
        worker.put(obj("b", "not mine"))?;

        worker.compact(&mut |key: &[u8]| key == &b"a"[..])?;

        let stats = worker.stats();
        assert_eq!(stats.active_num, 1);
        assert_eq!(stats.total_num, 1);

        let (_, body) = worker.get(42, b"a", 0, -1)?;
        assert_eq!(body, b"mine");
        assert_eq!(worker.head(42, b"b"), Err(Error::NotFound));
        Ok(())
    }

    #[test]
    fn compact_records_history_newest_first() -> CResult<()> {
        let (_dir, mut worker) = setup()?;
        worker.put(obj("a", "x"))?;

        worker.compact(&mut |_: &[u8]| true)?;
        worker.compact(&mut |_: &[u8]| true)?;

        let histories = worker.stats().compaction_histories;
        assert_eq!(histories.len(), 2);
        // Both runs completed, newest at the front.
        assert!(histories[0].1 >= histories[0].0);
        assert!(histories[0].1 != 0);
        assert!(histories[0].0 >= histories[1].0);
        Ok(())
    }

    #[test]
    fn worker_keeps_serving_after_compaction() -> CResult<()> {
        let (_dir, mut worker) = setup()?;
        worker.put(obj("a", "before"))?;
        worker.compact(&mut |_: &[u8]| true)?;

        worker.put(obj("b", "after"))?;
        let (_, body) = worker.get(42, b"b", 0, -1)?;
        assert_eq!(body, b"after");

        let stats = worker.stats();
        assert_eq!(stats.active_num, 2);
        assert_eq!(stats.total_num, 2);
        Ok(())
    }

    #[test]
    fn compact_of_empty_container_resets_to_zero() -> CResult<()> {
        let (_dir, mut worker) = setup()?;
        worker.put(obj("a", "x"))?;
        worker.delete(obj("a", ""))?;

        worker.compact(&mut |_: &[u8]| true)?;

        let stats = worker.stats();
        assert_eq!(stats.active_num, 0);
        assert_eq!(stats.total_num, 0);
        assert_eq!(stats.active_sizes, 0);
        assert_eq!(stats.total_sizes, 0);
        Ok(())
    }

    #[test]
    fn failed_scan_rolls_back_and_flags_the_container() -> CResult<()> {
        let (dir, mut worker) = setup()?;
        worker.put(obj("a", "alpha"))?;

        // Corrupt the live file so the scan hits a framing error.
        let stable = dir.path().join("object").join("1.avs");
        let raw = std::fs::read_link(&stable)?;
        let file = std::fs::OpenOptions::new().write(true).open(&raw)?;
        let len = file.metadata()?.len();
        file.set_len(len - 3)?;
        drop(file);

        let err = worker.compact(&mut |_: &[u8]| true).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));

        let stats = worker.stats();
        assert!(stats.has_error);
        // The history entry still closed.
        assert_eq!(stats.compaction_histories.len(), 1);
        assert!(stats.compaction_histories[0].1 != 0);

        // The symlink still points at the (corrupt but live) old file and
        // no temporary file lingers.
        assert_eq!(std::fs::read_link(&stable)?, raw);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("object"))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path() != stable && e.path() != raw)
            .collect();
        assert!(leftovers.is_empty(), "unexpected files: {:?}", leftovers);

        // The worker still accepts writes.
        worker.put(obj("b", "still alive"))?;
        Ok(())
    }
}
