use std::path::{Component, Path};

use anyhow::Result;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::util::{self, DirEntry, EntryKind};

/// A container path must be relative, slash-separated and made of plain
/// names only, so that joining it onto a root never leaves that root.
fn check_path(path: &str) -> crate::Result<()> {
    let plain = !path.is_empty()
        && path
            .split('/')
            .all(|seg| !seg.is_empty() && seg != "." && seg != "..")
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if plain {
        Ok(())
    } else {
        Err(Error::corrupt(format!("unsafe path in container: {path:?}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative path with forward slashes.
    pub path: String,
    pub size: u64,
    /// BLAKE3 of the file contents.
    pub hash: [u8; 32],
}

/// The file list of one side of a patch, sorted by path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub files: Vec<FileEntry>,
    pub dirs: Vec<String>,
    /// Sum of all file sizes.
    pub size: u64,
}

impl Container {
    /// Build a container from a directory walk, hashing files in parallel.
    pub fn from_entries(entries: &[DirEntry]) -> Result<Self> {
        let mut dirs: Vec<String> = entries
            .iter()
            .filter(|e| e.kind == EntryKind::Dir)
            .map(|e| e.relative_path.clone())
            .collect();
        util::sort_dirs_parent_first(&mut dirs);

        let mut file_entries: Vec<&DirEntry> =
            entries.iter().filter(|e| e.kind == EntryKind::File).collect();
        file_entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        let files = file_entries
            .par_iter()
            .map(|e| -> Result<FileEntry> {
                Ok(FileEntry {
                    path: e.relative_path.clone(),
                    size: e.size,
                    hash: util::hash_file_streaming(&e.full_path)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(files, dirs))
    }

    /// Walk and hash the tree under `root`, leaving out top-level names in `skip`.
    pub fn scan(root: &Path, skip: &[&str]) -> Result<Self> {
        Self::from_entries(&util::walk_directory(root, skip)?)
    }

    pub fn new(files: Vec<FileEntry>, dirs: Vec<String>) -> Self {
        let size = files.iter().map(|f| f.size).sum();
        Self { files, dirs, size }
    }

    pub fn file_index(&self, path: &str) -> Option<usize> {
        self.files
            .binary_search_by(|f| f.path.as_str().cmp(path))
            .ok()
    }

    /// Reject any file or directory path that could escape the tree it is
    /// applied to.
    pub fn validate(&self) -> crate::Result<()> {
        self.files
            .iter()
            .map(|f| f.path.as_str())
            .chain(self.dirs.iter().map(|d| d.as_str()))
            .try_for_each(check_path)
    }

    pub fn stats(&self) -> String {
        format!("{} files, {} dirs", self.files.len(), self.dirs.len())
    }
}
