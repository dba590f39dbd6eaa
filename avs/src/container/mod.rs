pub mod compaction;
pub mod server;

use std::path::{Path, PathBuf};

use crate::codec;
use crate::error::CResult;
use crate::handles::{self, BackendInfo};
use crate::metadb::MetaDb;
use crate::object::{encode_index_key, AddrId, Metadata, Object};
use crate::paths;
use crate::stats::StorageStats;

/// Worker lifecycle. Compaction may not be re-entered; the mailbox already
/// serializes operations, the state field guards the invariant explicitly.
#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    Ready,
    Compacting,
    Terminating,
}

/// One storage container: an append-only AVS file, its metadata index, and
/// the write/delete accounting. All operations run on the single dispatcher
/// thread that owns this value; there is no interior locking.
pub struct Worker {
    id: String,
    state: State,
    backend: BackendInfo,
    meta_db: MetaDb,
    stats: StorageStats,
    stats_path: PathBuf,
}

impl Worker {
    /// Brings a container up: resolves the stable symlink (creating the raw
    /// file and link on first boot), opens the handle pair, opens the
    /// metadata index and loads persisted stats. Any failure here means the
    /// worker refuses to start.
    pub fn init(id: &str, seq_no: u32, meta_db_id: &str, root: &Path) -> CResult<Worker> {
        let (stable, raw) = paths::resolve(root, seq_no)?;
        let (write_h, read_h) = handles::open_handles(&raw)?;
        let backend = BackendInfo::new(stable, raw, write_h, read_h);

        let meta_db = MetaDb::open(paths::meta_db_path(root, meta_db_id))?;
        let stats_path = paths::state_file(root, id);
        let stats = StorageStats::load(&stats_path, id);

        log::info!(
            "worker {} ready on {} ({} indexed entries)",
            id,
            backend.file_path.display(),
            meta_db.len()
        );
        Ok(Worker {
            id: id.to_string(),
            state: State::Ready,
            backend,
            meta_db,
            stats,
            stats_path,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Probes the index for a composite key, returning the existing entry's
    /// record size. Any probe failure counts as "absent".
    fn probe(&self, k: &[u8]) -> Option<i64> {
        match self.meta_db.get(k).and_then(|b| Metadata::from_bytes(&b)) {
            Ok(meta) => Some(meta.size as i64),
            Err(_) => None,
        }
    }

    /// Appends the object and re-points its metadata entry, then applies the
    /// stat deltas: an overwrite keeps `active_num` flat but swaps the old
    /// record's bytes out of `active_sizes`.
    pub fn put(&mut self, obj: Object) -> CResult<()> {
        let k = encode_index_key(obj.addr_id, &obj.key);
        let (diff_rec, old_size) = match self.probe(&k) {
            Some(size) => (0, size),
            None => (1, 0),
        };
        let new_size = codec::calc_obj_size(&obj) as i64;

        let reply = codec::put(&mut self.meta_db, &mut self.backend, &obj);
        let reply = handles::reopen_if_closed(&mut self.backend, reply);
        if reply.is_ok() {
            self.stats.total_sizes += new_size;
            self.stats.active_sizes += new_size - old_size;
            self.stats.total_num += 1;
            self.stats.active_num += diff_rec;
        }
        reply
    }

    /// Reads the object body for a key, sliced to `[start, end]` (inclusive;
    /// a negative `end` means "to the end").
    pub fn get(
        &mut self,
        addr_id: AddrId,
        key: &[u8],
        start: i64,
        end: i64,
    ) -> CResult<(Metadata, Vec<u8>)> {
        let reply = codec::get(&self.meta_db, &mut self.backend, addr_id, key, start, end);
        handles::reopen_if_closed(&mut self.backend, reply)
    }

    /// Appends a tombstone and re-points the metadata entry at it.
    ///
    /// The `active_sizes` delta is `-new_size - old_size`, as the original
    /// system computes it; see DESIGN.md before touching this arithmetic.
    pub fn delete(&mut self, obj: Object) -> CResult<()> {
        let k = encode_index_key(obj.addr_id, &obj.key);
        let (diff_rec, old_size) = match self.probe(&k) {
            Some(size) => (-1, size),
            None => (0, 0),
        };
        let new_size = codec::calc_obj_size(&obj) as i64;

        let reply = codec::delete(&mut self.meta_db, &mut self.backend, &obj);
        let reply = handles::reopen_if_closed(&mut self.backend, reply);
        if reply.is_ok() {
            self.stats.total_sizes += new_size;
            self.stats.active_sizes += -new_size - old_size;
            self.stats.total_num += 1;
            self.stats.active_num += diff_rec;
        }
        reply
    }

    /// Returns the metadata entry for a key without touching the AVS file.
    /// Tombstones are returned as-is; the caller inspects `del`.
    pub fn head(&self, addr_id: AddrId, key: &[u8]) -> CResult<Metadata> {
        codec::head(&self.meta_db, addr_id, key)
    }

    /// Scans metadata entries of one partition whose key starts with
    /// `key_prefix`, driving the visitor.
    pub fn fetch(
        &self,
        addr_id: AddrId,
        key_prefix: &[u8],
        visitor: &mut dyn codec::FetchVisitor,
    ) -> CResult<Vec<Metadata>> {
        codec::fetch(&self.meta_db, &encode_index_key(addr_id, key_prefix), visitor)
    }

    /// Like put, but the caller supplies an already-built metadata and a raw
    /// body. Does not invoke the reopen policy (parity with the original
    /// system).
    pub fn store(&mut self, meta: Metadata, body: Vec<u8>) -> CResult<()> {
        let k = encode_index_key(meta.addr_id, &meta.key);
        let (diff_rec, old_size) = match self.probe(&k) {
            Some(size) => (0, size),
            None => (1, 0),
        };
        let new_size = codec::calc_record_size(meta.key.len(), body.len()) as i64;

        let reply = codec::store(&mut self.meta_db, &mut self.backend, &meta, &body);
        if reply.is_ok() {
            self.stats.total_sizes += new_size;
            self.stats.active_sizes += new_size - old_size;
            self.stats.total_num += 1;
            self.stats.active_num += diff_rec;
        }
        reply
    }

    /// A copy of the current accounting.
    pub fn stats(&self) -> StorageStats {
        self.stats.clone()
    }

    /// Closes the handle pair and persists stats, both best-effort: a failed
    /// close must not lose the counters.
    pub fn terminate(&mut self) {
        self.state = State::Terminating;

        if let (Some(write_h), Some(read_h)) = (
            self.backend.write_handler.take(),
            self.backend.read_handler.take(),
        ) {
            if let Err(err) = handles::close_handles(write_h, read_h) {
                log::error!("worker {}: close on terminate failed: {}", self.id, err);
            }
        }
        if let Err(err) = self.stats.save(&self.stats_path) {
            log::error!("worker {}: stats persist on terminate failed: {}", self.id, err);
        }
        log::info!("worker {} terminated", self.id);
    }
}
