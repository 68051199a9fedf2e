//! Diagnostic dump ring
//!
//! When a frame violates an invariant the display writes its complete state
//! (layers, window configuration, composition targets, processing units and
//! open fences) to a bounded ring of files so the evidence survives without
//! filling the disk. Every dump starts a new file and rotates the older ones
//! as `hwc-dump.txt`, `hwc-dump.txt.1`, ... keeping at most `max_files`.
//! A dump larger than `max_file_size` is truncated.
//!
//! Without a configured directory dumps only go to the `error!` log.

use crate::config::DumpConfig;
use log::{error, info};
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const DUMP_FILE_NAME: &str = "hwc-dump.txt";

/// Dump ring statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpStats {
    pub dumps: u64,
    pub rotations: u64,
    pub truncated: u64,
    pub failures: u64,
}

#[derive(Debug)]
pub struct DumpRing {
    config: DumpConfig,
    stats: Mutex<DumpStats>,
}

impl DumpRing {
    pub fn new(config: DumpConfig) -> Self {
        if let Some(dir) = &config.directory {
            info!(
                "diagnostic dumps go to {} ({} files of at most {} bytes)",
                dir.display(),
                config.max_files,
                config.max_file_size
            );
        }
        Self {
            config,
            stats: Mutex::new(DumpStats::default()),
        }
    }

    /// Ring that only logs
    pub fn disabled() -> Self {
        Self::new(DumpConfig {
            directory: None,
            ..DumpConfig::default()
        })
    }

    pub fn stats(&self) -> DumpStats {
        *self.stats.lock()
    }

    pub fn current_path(&self) -> Option<PathBuf> {
        self.config
            .directory
            .as_ref()
            .map(|dir| dir.join(DUMP_FILE_NAME))
    }

    /// Records one dump. Returns the file it went to, if any.
    pub fn write(&self, title: &str, body: &str) -> Option<PathBuf> {
        error!("{}\n{}", title, body);
        let path = self.current_path()?;

        let mut stats = self.stats.lock();
        match self.write_file(&path, title, body, &mut stats) {
            Ok(()) => {
                stats.dumps += 1;
                Some(path)
            }
            Err(err) => {
                stats.failures += 1;
                error!("failed to write dump {}: {}", path.display(), err);
                None
            }
        }
    }

    fn write_file(
        &self,
        path: &Path,
        title: &str,
        body: &str,
        stats: &mut DumpStats,
    ) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if path.exists() {
            self.rotate(path);
            stats.rotations += 1;
        }

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let mut content = format!("== {} @{}ms ==\n{}", title, stamp, body);
        let limit = usize::try_from(self.config.max_file_size).unwrap_or(usize::MAX);
        if content.len() > limit {
            let mut cut = limit;
            while cut > 0 && !content.is_char_boundary(cut) {
                cut -= 1;
            }
            content.truncate(cut);
            stats.truncated += 1;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.write_all(content.as_bytes())?;
        file.flush()
    }

    /// Shifts `path` to `path.1`, `path.1` to `path.2` and so on. The
    /// oldest file falls off the end of the ring.
    fn rotate(&self, path: &Path) {
        let keep = self.config.max_files.max(1);
        let numbered = |i: usize| PathBuf::from(format!("{}.{}", path.display(), i));

        let _ = fs::remove_file(numbered(keep - 1));
        for i in (1..keep).rev() {
            let old_path = if i == 1 {
                path.to_path_buf()
            } else {
                numbered(i - 1)
            };
            if old_path.exists() {
                let _ = fs::rename(&old_path, numbered(i));
            }
        }
        if keep == 1 {
            let _ = fs::remove_file(path);
        }
    }
}
