// File indexer
//
// Classifies the data files under a directory by role and base name. Built fresh for every run.
// A directory the migrator cannot see (it only exists from the engine's point of view) is listed
// through the engine, then through a shallow enumeration as a last resort.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::database::engine::SqlEngine;
use crate::transfer::files::{collect_files_recursive, list_files_shallow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileRole {
    Primary,
    Log,
    Secondary,
}

impl FileRole {
    /// Role from the file extension (case-insensitive); `None` for anything else.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "mdf" => Some(FileRole::Primary),
            "ldf" => Some(FileRole::Log),
            "ndf" => Some(FileRole::Secondary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFile {
    pub path: PathBuf,
    pub role: FileRole,
    pub base_name: String,
}

impl DataFile {
    pub fn from_path(path: PathBuf) -> Option<Self> {
        let role = FileRole::from_path(&path)?;
        let base_name = path.file_stem()?.to_str()?.to_string();
        Some(Self {
            path,
            role,
            base_name,
        })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSource {
    LocalWalk,
    EngineListing,
    ShallowListing,
    Unavailable,
}

/// Data files under one directory, per role, sorted by path.
#[derive(Debug, Clone)]
pub struct FileIndex {
    root: PathBuf,
    source: IndexSource,
    primaries: Vec<DataFile>,
    logs: Vec<DataFile>,
    secondaries: Vec<DataFile>,
}

impl FileIndex {
    pub fn from_paths<I>(root: &Path, source: IndexSource, paths: I) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut index = Self {
            root: root.to_path_buf(),
            source,
            primaries: Vec::new(),
            logs: Vec::new(),
            secondaries: Vec::new(),
        };
        for file in paths.into_iter().filter_map(DataFile::from_path) {
            match file.role {
                FileRole::Primary => index.primaries.push(file),
                FileRole::Log => index.logs.push(file),
                FileRole::Secondary => index.secondaries.push(file),
            }
        }
        for set in [&mut index.primaries, &mut index.logs, &mut index.secondaries] {
            set.sort_by(|a, b| a.path.cmp(&b.path));
            set.dedup_by(|a, b| a.path == b.path);
        }
        index
    }

    /// Walk `root` locally, or ask the engine when the directory is not visible here.
    pub async fn build(root: &Path, engine: &mut dyn SqlEngine) -> Self {
        if root.is_dir() {
            match collect_files_recursive(root).await {
                Ok(paths) => return Self::finish(root, IndexSource::LocalWalk, paths),
                Err(e) => warn!(
                    "[PHASE: attach] [STEP: index] local walk failed (root={:?}): {:#}",
                    root, e
                ),
            }
        }

        match engine.list_directory(root).await {
            Ok(names) if !names.is_empty() => {
                let paths = names
                    .iter()
                    .map(|n| root.join(n.replace(['\\', '/'], std::path::MAIN_SEPARATOR_STR)));
                return Self::finish(root, IndexSource::EngineListing, paths.collect());
            }
            Ok(_) => debug!(
                "[PHASE: attach] [STEP: index] engine listing empty (root={:?})",
                root
            ),
            Err(e) => warn!(
                "[PHASE: attach] [STEP: index] engine listing unavailable (root={:?}): {}",
                root, e
            ),
        }

        match list_files_shallow(root).await {
            Ok(paths) => Self::finish(root, IndexSource::ShallowListing, paths),
            Err(e) => {
                warn!(
                    "[PHASE: attach] [STEP: index] directory not listable (root={:?}): {:#}",
                    root, e
                );
                Self::from_paths(root, IndexSource::Unavailable, Vec::new())
            }
        }
    }

    fn finish(root: &Path, source: IndexSource, paths: Vec<PathBuf>) -> Self {
        let index = Self::from_paths(root, source, paths);
        info!(
            "[PHASE: attach] [STEP: index] indexed {:?} (source={:?}, primary={}, log={}, secondary={})",
            root,
            source,
            index.primaries.len(),
            index.logs.len(),
            index.secondaries.len()
        );
        index
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source(&self) -> IndexSource {
        self.source
    }

    pub fn primaries(&self) -> &[DataFile] {
        &self.primaries
    }

    pub fn logs(&self) -> &[DataFile] {
        &self.logs
    }

    pub fn secondaries(&self) -> &[DataFile] {
        &self.secondaries
    }

    /// Log files whose parent directory is `dir`.
    pub fn logs_in_dir<'a>(&'a self, dir: &'a Path) -> impl Iterator<Item = &'a DataFile> + 'a {
        self.logs
            .iter()
            .filter(move |f| f.path.parent() == Some(dir))
    }
}
