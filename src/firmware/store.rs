//! Local version records.
//!
//! Two layouts are in use:
//!
//! - marker file: `<dir>/<pattern>.version` holds the installed version as a
//!   plain integer and the release archive unpacks straight into `<dir>`;
//! - versioned binary: the version is part of the file name,
//!   `<dir>/<pattern>_<version>_<suffix>`, and exactly one such file exists
//!   per component.
//!
//! Both are blocking; `VersionSync` calls them on the blocking pool.

use crate::config::{ComponentSpec, Layout, Profile};
use crate::error::SyncError;
use regex::Regex;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub trait VersionStore: Send + Sync {
    /// Installed version, or `None` when nothing is recorded yet.
    fn local_version(&self, component: &ComponentSpec) -> Result<Option<i64>, SyncError>;

    /// Install the unpacked release in `extracted` and record `remote` as the
    /// installed version. `local` is what `local_version` reported (0 if none).
    fn install(
        &self,
        component: &ComponentSpec,
        extracted: &Path,
        local: i64,
        remote: i64,
    ) -> Result<(), SyncError>;
}

/// Pick the store matching a profile's layout.
pub fn store_for(profile: &Profile) -> Arc<dyn VersionStore> {
    match profile.layout {
        Layout::MarkerFile => Arc::new(MarkerFileStore::new(&profile.firmware_dir)),
        Layout::VersionedBinary => Arc::new(VersionedBinaryStore::new(&profile.firmware_dir)),
    }
}

#[derive(Debug, Clone)]
pub struct MarkerFileStore {
    dir: PathBuf,
}

impl MarkerFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn marker_path(&self, component: &ComponentSpec) -> PathBuf {
        self.dir.join(format!("{}.version", component.pattern))
    }
}

impl VersionStore for MarkerFileStore {
    fn local_version(&self, component: &ComponentSpec) -> Result<Option<i64>, SyncError> {
        let local_err = |source| SyncError::LocalVersion {
            component: component.name.clone(),
            source,
        };

        let path = self.marker_path(component);
        if !path.exists() {
            fs::create_dir_all(&self.dir).map_err(local_err)?;
            fs::File::create(&path).map_err(local_err)?;
            return Ok(None);
        }

        let content = fs::read_to_string(&path).map_err(local_err)?;
        Ok(content.trim().parse::<i64>().ok())
    }

    fn install(
        &self,
        component: &ComponentSpec,
        extracted: &Path,
        _local: i64,
        remote: i64,
    ) -> Result<(), SyncError> {
        let install_err = |reason: String| SyncError::InstallFailed {
            component: component.name.clone(),
            reason,
        };

        fs::create_dir_all(&self.dir).map_err(|e| install_err(e.to_string()))?;
        move_tree(extracted, &self.dir).map_err(|e| install_err(format!("moving files: {e}")))?;
        write_atomic(&self.marker_path(component), remote.to_string().as_bytes())
            .map_err(|e| install_err(format!("recording version: {e}")))
    }
}

#[derive(Debug, Clone)]
pub struct VersionedBinaryStore {
    dir: PathBuf,
}

impl VersionedBinaryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn binary_path(&self, component: &ComponentSpec, version: i64) -> PathBuf {
        self.dir
            .join(format!("{}_{}_{}", component.pattern, version, component.suffix))
    }
}

impl VersionStore for VersionedBinaryStore {
    fn local_version(&self, component: &ComponentSpec) -> Result<Option<i64>, SyncError> {
        let local_err = |source| SyncError::LocalVersion {
            component: component.name.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(local_err)?;
        let re = Regex::new(&format!(r"^{}_(\d+)_", regex::escape(&component.pattern)))
            .map_err(|e| local_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(local_err)? {
            names.push(entry.map_err(local_err)?.file_name().to_string_lossy().into_owned());
        }
        // read_dir order is platform dependent
        names.sort();

        Ok(names.iter().find_map(|name| {
            re.captures(name)
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse::<i64>().ok())
        }))
    }

    fn install(
        &self,
        component: &ComponentSpec,
        extracted: &Path,
        local: i64,
        remote: i64,
    ) -> Result<(), SyncError> {
        let install_err = |reason: String| SyncError::InstallFailed {
            component: component.name.clone(),
            reason,
        };

        let src = extracted.join(&component.name);
        if !src.is_file() {
            return Err(install_err(format!(
                "release archive has no `{}` binary",
                component.name
            )));
        }

        let dest = self.binary_path(component, remote);
        move_file(&src, &dest).map_err(|e| install_err(format!("renaming binary: {e}")))?;

        if local != remote {
            let old = self.binary_path(component, local);
            match fs::remove_file(&old) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(install_err(format!("removing {}: {e}", old.display()))),
            }
        }
        Ok(())
    }
}

/// Move every file under `src` into `dest`, merging directories.
fn move_tree(src: &Path, dest: &Path) -> io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&to)?;
            move_tree(&from, &to)?;
        } else {
            move_file(&from, &to)?;
        }
    }
    Ok(())
}

/// Rename, falling back to copy + delete when `src` and `dest` are on
/// different filesystems.
fn move_file(src: &Path, dest: &Path) -> io::Result<()> {
    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            if fs::copy(src, dest).is_err() {
                return Err(rename_err);
            }
            fs::remove_file(src)
        }
    }
}

/// Write to a sibling temp file, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let temp_file = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&temp_file)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&temp_file, path)
}
