use std::fs::File;
use std::path::{Path, PathBuf};

use fs4::FileExt;

use crate::error::{CResult, Error};

/// The open-file state of one container: the stable symlink, its current raw
/// target, the live write+read handle pair, and the temporary pair a running
/// compaction owns.
///
/// Handle fields are `Option`s: a `None` live handle is the degraded state
/// left behind by a failed reopen, surfaces as `FdClosed` on access, and is
/// retried on the next request.
pub struct BackendInfo {
    pub file_path: PathBuf,
    pub file_path_raw: PathBuf,
    pub write_handler: Option<File>,
    pub read_handler: Option<File>,
    pub tmp_file_path_raw: Option<PathBuf>,
    pub tmp_write_handler: Option<File>,
    pub tmp_read_handler: Option<File>,
}

impl BackendInfo {
    pub fn new(file_path: PathBuf, file_path_raw: PathBuf, write_h: File, read_h: File) -> Self {
        Self {
            file_path,
            file_path_raw,
            write_handler: Some(write_h),
            read_handler: Some(read_h),
            tmp_file_path_raw: None,
            tmp_write_handler: None,
            tmp_read_handler: None,
        }
    }

    pub fn write_handle(&mut self) -> CResult<&mut File> {
        self.write_handler.as_mut().ok_or(Error::FdClosed)
    }

    pub fn read_handle(&mut self) -> CResult<&mut File> {
        self.read_handler.as_mut().ok_or(Error::FdClosed)
    }

    pub fn tmp_write_handle(&mut self) -> CResult<&mut File> {
        self.tmp_write_handler.as_mut().ok_or(Error::FdClosed)
    }

    /// Drops the temporary pair and forgets the temporary path.
    pub fn clear_tmp(&mut self) {
        self.tmp_file_path_raw = None;
        self.tmp_write_handler = None;
        self.tmp_read_handler = None;
    }
}

/// Opens the write+read handle pair on a raw AVS file: append-only (created
/// if missing) and random read. The write side takes an exclusive lock, so a
/// second worker on the same file errors out.
pub fn open_handles(raw_path: &Path) -> CResult<(File, File)> {
    let write_h = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(raw_path)?;
    write_h.try_lock_exclusive()?;

    let read_h = std::fs::OpenOptions::new().read(true).open(raw_path)?;
    Ok((write_h, read_h))
}

/// Flushes and closes a handle pair. Dropping the write side releases its
/// lock.
pub fn close_handles(write_h: File, read_h: File) -> CResult<()> {
    write_h.sync_all()?;
    drop(write_h);
    drop(read_h);
    Ok(())
}

/// The reopen policy: when an operation came back with the closed-descriptor
/// sentinel, drop the pair and reopen once against the *stable* path, which
/// the symlink resolves to the current raw file. The original reply is
/// returned unchanged either way; the retry is the caller's call. A failed
/// reopen leaves the handles empty so the next request tries again.
pub fn reopen_if_closed<T>(backend: &mut BackendInfo, result: CResult<T>) -> CResult<T> {
    if !matches!(result, Err(Error::FdClosed)) {
        return result;
    }

    backend.write_handler = None;
    backend.read_handler = None;
    match open_handles(&backend.file_path) {
        Ok((write_h, read_h)) => {
            log::warn!(
                "reopened handles on {} after closed descriptor",
                backend.file_path.display()
            );
            if let Ok(raw) = std::fs::read_link(&backend.file_path) {
                backend.file_path_raw = raw;
            }
            backend.write_handler = Some(write_h);
            backend.read_handler = Some(read_h);
        }
        Err(err) => {
            log::error!(
                "reopen of {} failed, worker degraded: {}",
                backend.file_path.display(),
                err
            );
        }
    }
    result
}
