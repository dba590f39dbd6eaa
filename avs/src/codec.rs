use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};

use crate::error::{CResult, Error};
use crate::handles::BackendInfo;
use crate::metadb::MetaDb;
use crate::object::{encode_index_key, AddrId, Metadata, Object, DEL_FALSE, DEL_TRUE};

/// An AVS file is a sequence of framed records, each encoded as:
///
/// - Header (big-endian, 33 bytes): addr_id as u64, key length as u32, body
///   length as u32, absolute record offset as u64, append timestamp as i64,
///   del flag as u8.
/// - Key as raw bytes (max 4 GB).
/// - Body as raw bytes (max 4 GB).
/// - Zero padding up to the next 8-byte boundary.
///
/// Records are addressed by their absolute byte offset; the offset stored in
/// the header must agree with the read position, which catches torn or
/// misaligned files.
pub const HEADER_SIZE: u64 = 33;

/// Every record occupies a multiple of this many bytes on disk.
pub const RECORD_ALIGN: u64 = 8;

/// The on-disk size of a record with the given key and body lengths,
/// including header and padding.
pub fn calc_record_size(key_len: usize, body_len: usize) -> u64 {
    let raw = HEADER_SIZE + key_len as u64 + body_len as u64;
    (raw + RECORD_ALIGN - 1) / RECORD_ALIGN * RECORD_ALIGN
}

/// The on-disk size the given object will occupy once appended.
pub fn calc_obj_size(obj: &Object) -> u64 {
    calc_record_size(obj.key.len(), obj.body.len())
}

/// Appends one framed record and returns its offset and on-disk size.
pub fn append_record(
    write_h: &mut File,
    addr_id: AddrId,
    key: &[u8],
    body: &[u8],
    del: u8,
    timestamp: i64,
) -> CResult<(u64, u64)> {
    let offset = write_h.seek(SeekFrom::End(0))?;
    let size = calc_record_size(key.len(), body.len());

    let mut buf = BytesMut::with_capacity(size as usize);
    buf.put_u64(addr_id);
    buf.put_u32(key.len() as u32);
    buf.put_u32(body.len() as u32);
    buf.put_u64(offset);
    buf.put_i64(timestamp);
    buf.put_u8(del);
    buf.put_slice(key);
    buf.put_slice(body);
    buf.resize(size as usize, 0);

    write_h.write_all(&buf)?;
    write_h.flush()?;

    Ok((offset, size))
}

/// Reads the framed record at `offset`, returning its metadata, key and body
/// along with the offset of the next record. The end of the file yields
/// `Error::Eof`; a record that extends past it yields `Error::Parse`.
pub fn read_record_at(read_h: &mut File, offset: u64) -> CResult<(Metadata, Vec<u8>, Vec<u8>, u64)> {
    let file_len = read_h.metadata()?.len();
    if offset >= file_len {
        return Err(Error::Eof);
    }
    if offset + HEADER_SIZE > file_len {
        return Err(Error::Parse(format!(
            "truncated record header at offset {}",
            offset
        )));
    }

    read_h.seek(SeekFrom::Start(offset))?;
    let addr_id = read_h.read_u64::<BigEndian>()?;
    let key_len = read_h.read_u32::<BigEndian>()?;
    let body_len = read_h.read_u32::<BigEndian>()?;
    let stored_offset = read_h.read_u64::<BigEndian>()?;
    let timestamp = read_h.read_i64::<BigEndian>()?;
    let del = read_h.read_u8()?;

    if stored_offset != offset {
        return Err(Error::Parse(format!(
            "record offset mismatch: header says {}, read at {}",
            stored_offset, offset
        )));
    }

    let size = calc_record_size(key_len as usize, body_len as usize);
    if offset + size > file_len {
        return Err(Error::Parse(format!(
            "record at offset {} extends past end of file",
            offset
        )));
    }

    let mut key = vec![0; key_len as usize];
    read_h.read_exact(&mut key)?;
    let mut body = vec![0; body_len as usize];
    read_h.read_exact(&mut body)?;

    let meta = Metadata {
        addr_id,
        key: key.clone(),
        offset,
        size,
        del,
        timestamp,
    };
    Ok((meta, key, body, offset + size))
}

/// Appends a live record for the object and points its metadata entry at the
/// new offset. Any prior record for the key stays on disk but is no longer
/// reachable through the index.
pub fn put(db: &mut MetaDb, backend: &mut BackendInfo, obj: &Object) -> CResult<()> {
    let now = chrono::Utc::now().timestamp();
    let write_h = backend.write_handle()?;
    let (offset, size) = append_record(write_h, obj.addr_id, &obj.key, &obj.body, DEL_FALSE, now)?;

    let meta = Metadata {
        addr_id: obj.addr_id,
        key: obj.key.clone(),
        offset,
        size,
        del: DEL_FALSE,
        timestamp: now,
    };
    db.put(&encode_index_key(obj.addr_id, &obj.key), &meta.to_bytes()?)
}

/// Looks the key up in the index and reads the record body, sliced to the
/// inclusive byte range `[start, end]`. `end < 0` or past the body means "to
/// the end". Tombstoned or missing keys yield `Error::NotFound`.
pub fn get(
    db: &MetaDb,
    backend: &mut BackendInfo,
    addr_id: AddrId,
    key: &[u8],
    start: i64,
    end: i64,
) -> CResult<(Metadata, Vec<u8>)> {
    let meta = head(db, addr_id, key)?;
    if meta.is_deleted() {
        return Err(Error::NotFound);
    }

    let read_h = backend.read_handle()?;
    let (rec_meta, rec_key, body, _) = read_record_at(read_h, meta.offset)?;
    if rec_meta.addr_id != addr_id || rec_key != key {
        return Err(Error::Parse(format!(
            "index points at foreign record at offset {}",
            meta.offset
        )));
    }

    Ok((meta, slice_body(body, start, end)))
}

fn slice_body(body: Vec<u8>, start: i64, end: i64) -> Vec<u8> {
    if body.is_empty() {
        return body;
    }
    let last = body.len() - 1;
    let from = start.max(0) as usize;
    let to = if end < 0 || end as usize > last {
        last
    } else {
        end as usize
    };
    if from > to {
        return Vec::new();
    }
    body[from..=to].to_vec()
}

/// Appends a tombstone record for the object and re-points its metadata entry
/// at it with the del flag set.
pub fn delete(db: &mut MetaDb, backend: &mut BackendInfo, obj: &Object) -> CResult<()> {
    let now = chrono::Utc::now().timestamp();
    let write_h = backend.write_handle()?;
    let (offset, size) = append_record(write_h, obj.addr_id, &obj.key, &obj.body, DEL_TRUE, now)?;

    let meta = Metadata {
        addr_id: obj.addr_id,
        key: obj.key.clone(),
        offset,
        size,
        del: DEL_TRUE,
        timestamp: now,
    };
    db.put(&encode_index_key(obj.addr_id, &obj.key), &meta.to_bytes()?)
}

/// Returns the metadata entry for the key, tombstoned or not.
pub fn head(db: &MetaDb, addr_id: AddrId, key: &[u8]) -> CResult<Metadata> {
    let bytes = db.get(&encode_index_key(addr_id, key))?;
    Metadata::from_bytes(&bytes)
}

/// What a fetch visitor wants done after seeing an entry.
pub enum Decision {
    /// Accumulate the entry and keep scanning.
    Continue,
    /// End the scan; the entry just shown is not accumulated.
    Stop,
}

/// Visitor driving a metadata fetch. Implemented for closures.
pub trait FetchVisitor: Send {
    fn visit(&mut self, meta: &Metadata) -> Decision;
}

impl<F> FetchVisitor for F
where
    F: FnMut(&Metadata) -> Decision + Send,
{
    fn visit(&mut self, meta: &Metadata) -> Decision {
        self(meta)
    }
}

/// Scans index entries whose composite key starts with `key_prefix`, in key
/// order, handing each decoded metadata to the visitor. Returns the entries
/// the visitor accumulated.
pub fn fetch(
    db: &MetaDb,
    key_prefix: &[u8],
    visitor: &mut dyn FetchVisitor,
) -> CResult<Vec<Metadata>> {
    let mut acc = Vec::new();
    for (k, v) in db.scan_from(key_prefix) {
        if !k.starts_with(key_prefix) {
            break;
        }
        let meta = Metadata::from_bytes(v)?;
        match visitor.visit(&meta) {
            Decision::Continue => acc.push(meta),
            Decision::Stop => break,
        }
    }
    Ok(acc)
}

/// Appends a record built from caller-supplied metadata and raw body, then
/// re-points the metadata entry at the new offset. The caller's del flag and
/// timestamp are preserved.
pub fn store(db: &mut MetaDb, backend: &mut BackendInfo, meta: &Metadata, body: &[u8]) -> CResult<()> {
    let write_h = backend.write_handle()?;
    let (offset, size) = append_record(
        write_h,
        meta.addr_id,
        &meta.key,
        body,
        meta.del,
        meta.timestamp,
    )?;

    let stored = Metadata {
        offset,
        size,
        ..meta.clone()
    };
    db.put(&encode_index_key(meta.addr_id, &meta.key), &stored.to_bytes()?)
}

/// Reads the first record of the file for a compaction scan.
pub fn compact_get(read_h: &mut File) -> CResult<(Metadata, Vec<u8>, Vec<u8>, u64)> {
    compact_get_at(read_h, 0)
}

/// Reads the record at `offset` for a compaction scan.
pub fn compact_get_at(read_h: &mut File, offset: u64) -> CResult<(Metadata, Vec<u8>, Vec<u8>, u64)> {
    read_record_at(read_h, offset)
}

/// Copies one surviving record into the compaction target file and returns
/// its new offset there.
pub fn compact_put(tmp_w: &mut File, meta: &Metadata, key: &[u8], body: &[u8]) -> CResult<u64> {
    let (offset, _) = append_record(tmp_w, meta.addr_id, key, body, meta.del, meta.timestamp)?;
    Ok(offset)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn scratch_file(name: &str) -> CResult<(tempdir::TempDir, File)> {
        let dir = tempdir::TempDir::new("avs-codec")?;
        let path = dir.path().join(name);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok((dir, file))
    }

    #[test]
    fn record_sizes_are_aligned() {
        assert_eq!(calc_record_size(0, 0), 40);
        assert_eq!(calc_record_size(1, 0), 40);
        assert_eq!(calc_record_size(3, 5), 48);
        assert_eq!(calc_record_size(7, 8), 48);
        assert_eq!(calc_record_size(7, 9), 56);

        for (k, b) in [(0, 0), (1, 1), (13, 255), (64, 4096)] {
            assert_eq!(calc_record_size(k, b) % RECORD_ALIGN, 0);
        }
    }

    #[test]
    fn append_then_read_roundtrip() -> CResult<()> {
        let (_dir, mut file) = scratch_file("roundtrip.avs")?;

        let (off_a, size_a) = append_record(&mut file, 42, b"a", b"hello", 0, 1_700_000_000)?;
        let (off_b, _) = append_record(&mut file, 42, b"bb", b"world!", 0, 1_700_000_001)?;
        assert_eq!(off_a, 0);
        assert_eq!(off_b, size_a);

        let (meta, key, body, next) = read_record_at(&mut file, off_a)?;
        assert_eq!(meta.addr_id, 42);
        assert_eq!(key, b"a");
        assert_eq!(body, b"hello");
        assert_eq!(meta.offset, off_a);
        assert_eq!(meta.size, size_a);
        assert_eq!(meta.timestamp, 1_700_000_000);
        assert_eq!(next, off_b);

        let (meta, key, body, next) = read_record_at(&mut file, off_b)?;
        assert_eq!(key, b"bb");
        assert_eq!(body, b"world!");
        assert_eq!(meta.del, 0);
        assert_eq!(read_record_at(&mut file, next).unwrap_err(), Error::Eof);

        Ok(())
    }

    #[test]
    fn read_at_misaligned_offset_is_a_parse_error() -> CResult<()> {
        let (_dir, mut file) = scratch_file("misaligned.avs")?;
        append_record(&mut file, 1, b"k", b"0123456789", 0, 0)?;
        append_record(&mut file, 1, b"k", b"0123456789", 0, 0)?;

        match read_record_at(&mut file, 8) {
            Err(Error::Parse(_)) => Ok(()),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn truncated_tail_is_a_parse_error() -> CResult<()> {
        let (_dir, mut file) = scratch_file("torn.avs")?;
        let (offset, size) = append_record(&mut file, 1, b"k", b"payload", 0, 0)?;
        file.set_len(offset + size - 3)?;

        match read_record_at(&mut file, offset) {
            Err(Error::Parse(_)) => Ok(()),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn body_range_slicing() {
        let body = b"hello world".to_vec();
        assert_eq!(slice_body(body.clone(), 0, -1), b"hello world");
        assert_eq!(slice_body(body.clone(), 0, 4), b"hello");
        assert_eq!(slice_body(body.clone(), 6, 10), b"world");
        assert_eq!(slice_body(body.clone(), 6, 9999), b"world");
        assert_eq!(slice_body(body.clone(), 20, 30), b"");
        assert_eq!(slice_body(Vec::new(), 0, -1), b"");
    }
}
