//! Extension artifacts loaded by the data nodes.
//!
//! An artifact is identified by the blake3 checksum of its content. It is
//! installed into the extension directory as `<stem>-<checksum prefix>.<ext>`,
//! written to a hidden temporary file first and renamed into place so a
//! scanning service never observes a partial file.

use crate::{Error, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Hex digits of the checksum kept in the installed file name.
const CHECKSUM_PREFIX_LEN: usize = 12;

/// A file to be placed into a cluster's extension directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionArtifact {
    source: PathBuf,
    checksum: String,
    installed: Option<PathBuf>,
}

impl ExtensionArtifact {
    /// Reads `path` and computes its checksum.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let source = path.into();
        let content = fs::read(&source).map_err(|e| Error::Extension {
            path: source.clone(),
            reason: format!("cannot read artifact: {e}"),
        })?;
        if source.file_name().is_none() {
            return Err(Error::Extension {
                path: source,
                reason: "artifact path has no file name".into(),
            });
        }
        Ok(Self {
            checksum: blake3::hash(&content).to_hex().to_string(),
            source,
            installed: None,
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Hex blake3 checksum of the content read by [`Self::from_path`].
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn is_installed(&self) -> bool {
        self.installed.is_some()
    }

    /// Path the artifact was installed to.
    pub fn installed_path(&self) -> Option<&Path> {
        self.installed.as_deref()
    }

    /// File name used inside the extension directory.
    pub fn target_name(&self) -> String {
        let stem = self
            .source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let prefix = &self.checksum[..CHECKSUM_PREFIX_LEN];
        match self.source.extension() {
            Some(ext) => format!("{stem}-{prefix}.{}", ext.to_string_lossy()),
            None => format!("{stem}-{prefix}"),
        }
    }
}

/// Places artifacts into one extension directory.
#[derive(Debug, Clone)]
pub struct ExtensionInstaller {
    dir: PathBuf,
}

impl ExtensionInstaller {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copies `artifact` into the directory. Installing identical content
    /// twice leaves the existing file in place.
    pub fn install(&self, artifact: &mut ExtensionArtifact) -> Result<PathBuf> {
        let target = self.dir.join(artifact.target_name());
        let wrap = |e: io::Error| Error::Extension {
            path: artifact.source.clone(),
            reason: e.to_string(),
        };

        if target.exists() && file_checksum(&target).map_err(wrap)? == artifact.checksum {
            tracing::debug!(target = %target.display(), "extension already installed");
            artifact.installed = Some(target.clone());
            return Ok(target);
        }

        fs::create_dir_all(&self.dir).map_err(wrap)?;
        let content = fs::read(&artifact.source).map_err(wrap)?;
        if blake3::hash(&content).to_hex().as_str() != artifact.checksum {
            return Err(Error::Extension {
                path: artifact.source.clone(),
                reason: "content changed since the checksum was taken".into(),
            });
        }

        let temp = self.dir.join(format!(".{}.tmp", artifact.target_name()));
        fs::write(&temp, &content).map_err(wrap)?;
        if let Err(e) = fs::rename(&temp, &target) {
            let _ = fs::remove_file(&temp);
            return Err(wrap(e));
        }

        tracing::info!(
            source = %artifact.source.display(),
            target = %target.display(),
            "extension installed"
        );
        artifact.installed = Some(target.clone());
        Ok(target)
    }

    /// Removes `artifact` from the directory. Absent files are not an error.
    pub fn uninstall(&self, artifact: &mut ExtensionArtifact) -> Result<()> {
        let target = self.dir.join(artifact.target_name());
        match fs::remove_file(&target) {
            Ok(()) => tracing::info!(target = %target.display(), "extension removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::Extension {
                    path: target,
                    reason: e.to_string(),
                });
            }
        }
        artifact.installed = None;
        Ok(())
    }

    /// Installed files, sorted by name. Hidden temporaries are skipped.
    pub fn installed(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}

fn file_checksum(path: &Path) -> io::Result<String> {
    Ok(blake3::hash(&fs::read(path)?).to_hex().to_string())
}
