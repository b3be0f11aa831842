//! Polls the extension mount for new or changed artifacts.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Remembers what was already handed out so each version of a file is
/// reported once.
#[derive(Debug)]
pub struct MountWatcher {
    mount: PathBuf,
    seen: BTreeMap<PathBuf, (u64, Option<SystemTime>)>,
}

impl MountWatcher {
    pub fn new(mount: impl Into<PathBuf>) -> Self {
        Self {
            mount: mount.into(),
            seen: BTreeMap::new(),
        }
    }

    pub fn mount(&self) -> &Path {
        &self.mount
    }

    /// Files that appeared or changed since the previous scan, sorted.
    ///
    /// A missing mount yields nothing. Hidden files and directories are
    /// ignored.
    pub fn scan(&mut self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.mount) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read {}", self.mount.display()));
            }
        };

        let mut fresh = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }

            let path = entry.path();
            let stamp = (metadata.len(), metadata.modified().ok());
            if self.seen.get(&path) != Some(&stamp) {
                self.seen.insert(path.clone(), stamp);
                fresh.push(path);
            }
        }
        fresh.sort();
        Ok(fresh)
    }
}
