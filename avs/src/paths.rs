use std::path::{Path, PathBuf};

use crate::error::CResult;

/// Directory for AVS files and their stable symlinks, under the root.
pub const OBJECT_DIR: &str = "object";
/// Directory for per-worker stats property files.
pub const STATE_DIR: &str = "state";
/// Directory for metadata-index logs.
pub const METADATA_DIR: &str = "metadata";

/// The container's stable public path: `<root>/object/<seq_no>.avs`, a
/// symlink whose target is the currently-live raw AVS file.
pub fn stable_path(root: &Path, seq_no: u32) -> PathBuf {
    root.join(OBJECT_DIR).join(format!("{}.avs", seq_no))
}

/// The stats property file for a worker id.
pub fn state_file(root: &Path, id: &str) -> PathBuf {
    root.join(STATE_DIR).join(id)
}

/// The metadata-index log for a metadata-DB id.
pub fn meta_db_path(root: &Path, meta_db_id: &str) -> PathBuf {
    root.join(METADATA_DIR).join(meta_db_id)
}

/// Resolves the stable symlink for `seq_no` to its raw target, creating the
/// raw file and the symlink on first boot. Returns `(stable, raw)`.
pub fn resolve(root: &Path, seq_no: u32) -> CResult<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(root.join(OBJECT_DIR))?;
    let stable = stable_path(root, seq_no);

    match std::fs::read_link(&stable) {
        Ok(target) => Ok((stable, target)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let raw = mint_raw(&stable);
            std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&raw)?;
            std::os::unix::fs::symlink(&raw, &stable)?;
            log::info!(
                "first boot: created {} -> {}",
                stable.display(),
                raw.display()
            );
            Ok((stable, raw))
        }
        Err(err) => Err(err.into()),
    }
}

/// Mints a fresh raw-file name next to the stable path. One-second
/// granularity is enough: compactions are not re-entrant within a worker.
pub fn mint_raw(stable: &Path) -> PathBuf {
    PathBuf::from(format!(
        "{}_{}",
        stable.display(),
        chrono::Utc::now().timestamp()
    ))
}

/// Like `mint_raw`, but guaranteed to differ from the live raw file: a
/// compaction started within the same second as boot would otherwise mint
/// the live file's own name.
pub fn mint_raw_unique(stable: &Path, current_raw: &Path) -> PathBuf {
    let base = mint_raw(stable);
    if base != current_raw && !base.exists() {
        return base;
    }
    let mut n = 1u32;
    loop {
        let candidate = PathBuf::from(format!("{}_{}", base.display(), n));
        if candidate != current_raw && !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Re-points the stable symlink at `new_raw`. The old link is removed
/// best-effort first; creating the new link is the commit point.
pub fn swap_symlink(stable: &Path, new_raw: &Path) -> CResult<()> {
    let _ = std::fs::remove_file(stable);
    std::os::unix::fs::symlink(new_raw, stable)?;
    Ok(())
}
