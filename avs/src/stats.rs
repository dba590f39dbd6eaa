use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;

use crate::error::CResult;

/// The history ring keeps this many `(start, end)` entries, newest first.
pub const MAX_COMPACTION_HISTORIES: usize = 7;

/// Per-container write/delete accounting, persisted across restarts as a
/// small property file.
///
/// `total_*` counts every write ever performed; `active_*` tracks the live
/// set. Counters are signed on purpose: the delete accounting inherited from
/// the original system can drive `active_sizes` below zero, and that
/// behavior is preserved rather than sanitized.
#[derive(Clone, Debug, PartialEq)]
pub struct StorageStats {
    pub id: String,
    pub total_sizes: i64,
    pub active_sizes: i64,
    pub total_num: i64,
    pub active_num: i64,
    /// `(start, end)` unix seconds per compaction, newest at the front;
    /// `end == 0` marks an in-flight run.
    pub compaction_histories: VecDeque<(i64, i64)>,
    pub has_error: bool,
}

impl StorageStats {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            total_sizes: 0,
            active_sizes: 0,
            total_num: 0,
            active_num: 0,
            compaction_histories: VecDeque::new(),
            has_error: false,
        }
    }

    /// Opens a history entry for a compaction starting now, evicting the
    /// oldest entry once the ring is full.
    pub fn begin_compaction(&mut self, start: i64) {
        while self.compaction_histories.len() >= MAX_COMPACTION_HISTORIES {
            self.compaction_histories.pop_back();
        }
        self.compaction_histories.push_front((start, 0));
    }

    /// Closes the in-flight history entry.
    pub fn finish_compaction(&mut self, end: i64) {
        if let Some(entry) = self.compaction_histories.front_mut() {
            entry.1 = end;
        }
    }

    /// Loads stats from a property file. A missing or unreadable file, or
    /// any unparsable field, falls back to zeroes: a worker must never
    /// refuse to start over its stats.
    pub fn load(path: &Path, id: &str) -> StorageStats {
        let mut stats = StorageStats::new(id);
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => return stats,
        };

        for line in content.lines() {
            let (key, value) = match line.split_once('=') {
                Some(kv) => kv,
                None => continue,
            };
            match key.trim() {
                "id" => stats.id = value.trim().to_string(),
                "total_sizes" => stats.total_sizes = value.trim().parse().unwrap_or(0),
                "active_sizes" => stats.active_sizes = value.trim().parse().unwrap_or(0),
                "total_num" => stats.total_num = value.trim().parse().unwrap_or(0),
                "active_num" => stats.active_num = value.trim().parse().unwrap_or(0),
                "compaction_histories" => {
                    stats.compaction_histories =
                        serde_json::from_str(value.trim()).unwrap_or_default()
                }
                "has_error" => stats.has_error = value.trim() == "true",
                _ => {}
            }
        }
        stats
    }

    /// Persists stats as a property file, atomically via temp + rename.
    pub fn save(&self, path: &Path) -> CResult<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let tmp = path.with_extension("tmp");
        let mut file = std::fs::File::create(&tmp)?;
        writeln!(file, "id={}", self.id)?;
        writeln!(file, "total_sizes={}", self.total_sizes)?;
        writeln!(file, "active_sizes={}", self.active_sizes)?;
        writeln!(file, "total_num={}", self.total_num)?;
        writeln!(file, "active_num={}", self.active_num)?;
        writeln!(
            file,
            "compaction_histories={}",
            serde_json::to_string(&self.compaction_histories)?
        )?;
        writeln!(file, "has_error={}", self.has_error)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
