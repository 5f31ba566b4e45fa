use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::container::{Container, FileEntry};
use crate::error::Error;
use crate::patch_format::{block_range_len, SeriesType, SyncOp, BLOCK_SIZE};
use crate::series::{open_patch, PatchStream, SeriesReader};
use crate::util::{self, FileData};

/// Scratch directory inside the target where new files are assembled.
pub const STAGING_DIR: &str = ".bsdelta-staging";

#[derive(Debug, Default)]
pub struct ApplySummary {
    pub dirs_created: usize,
    pub files_written: usize,
    pub files_unchanged: usize,
    pub files_deleted: usize,
    pub dirs_deleted: usize,
}

/// Lazily mapped files of the old container, as found in the target.
struct OldFiles<'a> {
    root: &'a Path,
    container: &'a Container,
    maps: Vec<Option<FileData>>,
}

impl<'a> OldFiles<'a> {
    fn new(root: &'a Path, container: &'a Container) -> Self {
        Self {
            root,
            container,
            maps: (0..container.files.len()).map(|_| None).collect(),
        }
    }

    fn get(&mut self, index: i64) -> Result<&[u8]> {
        let i = usize::try_from(index)
            .ok()
            .filter(|&i| i < self.container.files.len())
            .ok_or_else(|| Error::corrupt(format!("old file index {index} out of range")))?;

        if self.maps[i].is_none() {
            let entry = &self.container.files[i];
            let full = self.root.join(&entry.path);
            let data = util::mmap_file(&full)?;
            if data.len() as u64 != entry.size {
                bail!(
                    "Target file {} is {} bytes, patch expects {}",
                    entry.path,
                    data.len(),
                    entry.size
                );
            }
            self.maps[i] = Some(data);
        }
        Ok(self.maps[i].as_deref().unwrap_or_default())
    }
}

/// Replay an rsync series straight into `staged`.
fn apply_rsync<R: Read>(
    series: &mut SeriesReader<R>,
    sources: &mut OldFiles,
    entry: &FileEntry,
    staged: &Path,
) -> Result<[u8; 32]> {
    let file = File::create(staged)
        .with_context(|| format!("Failed to create staged file: {}", staged.display()))?;
    let mut out = BufWriter::new(file);
    let mut hasher = blake3::Hasher::new();
    let mut written = 0u64;

    while let Some(op) = series.next_op()? {
        let chunk: &[u8] = match &op {
            SyncOp::BlockRange {
                file_index,
                block_index,
                block_span,
            } => {
                let data = sources.get(*file_index)?;
                let (Ok(index), Ok(span)) =
                    (u64::try_from(*block_index), u64::try_from(*block_span))
                else {
                    return Err(Error::corrupt("negative block range").into());
                };
                let start = index
                    .checked_mul(BLOCK_SIZE)
                    .ok_or_else(|| Error::corrupt("block index overflow"))?;
                let len = block_range_len(data.len() as u64, index, span);
                usize::try_from(start)
                    .ok()
                    .and_then(|s| data.get(s..s.checked_add(len as usize)?))
                    .ok_or_else(|| {
                        Error::corrupt(format!(
                            "block range {index}+{span} outside old file {file_index}"
                        ))
                    })?
            }
            SyncOp::Data(bytes) => bytes,
            SyncOp::HeyYouDidIt => continue,
        };

        written += chunk.len() as u64;
        if written > entry.size {
            return Err(Error::corrupt(format!(
                "rsync series overruns {} ({} bytes declared)",
                entry.path, entry.size
            ))
            .into());
        }
        out.write_all(chunk)?;
        hasher.update(chunk);
    }

    if written != entry.size {
        return Err(Error::corrupt(format!(
            "rsync series produced {written} bytes for {}, expected {}",
            entry.path, entry.size
        ))
        .into());
    }
    out.flush()?;
    Ok(*hasher.finalize().as_bytes())
}

/// Read every series and assemble each new file under `staging`, named by
/// its index. Returns the containers and, per new file, whether it differs
/// from the old file at the same path.
fn reconstruct(
    target: &Path,
    patch_path: &Path,
    staging: &Path,
) -> Result<(Container, Container, Vec<bool>)> {
    let file = File::open(patch_path)
        .with_context(|| format!("Failed to open patch: {}", patch_path.display()))?;
    let PatchStream {
        old,
        new,
        mut series,
        ..
    } = open_patch(BufReader::new(file)).context("Failed to read patch header")?;
    info!("patching {} into {}", old.stats(), new.stats());

    let mut sources = OldFiles::new(target, &old);
    let mut changed = vec![true; new.files.len()];

    while let Some(header) = series.next_series()? {
        let i = header.file_index;
        let entry = &new.files[i];
        let staged = staging.join(i.to_string());

        let hash = match header.kind {
            SeriesType::Rsync => apply_rsync(&mut series, &mut sources, entry, &staged)?,
            SeriesType::Bsdiff => {
                let bh = series.read_bsdiff_header()?;
                let old_data = sources.get(bh.target_index)?;
                let data = series
                    .apply_bsdiff(old_data, entry.size)
                    .with_context(|| format!("Failed to apply bsdiff series for {}", entry.path))?;
                std::fs::write(&staged, &data).with_context(|| {
                    format!("Failed to write staged file: {}", staged.display())
                })?;
                util::hash_bytes(&data)
            }
        };
        debug!("{} reconstructed via {}", entry.path, header.kind);

        if hash != entry.hash {
            bail!("Hash mismatch after patching file: {}", entry.path);
        }

        let unchanged = old
            .file_index(&entry.path)
            .is_some_and(|oi| old.files[oi].hash == entry.hash && old.files[oi].size == entry.size);
        if unchanged {
            std::fs::remove_file(&staged)?;
            changed[i] = false;
        }
    }
    drop(sources);

    Ok((old, new, changed))
}

/// Apply a patch file to the target directory.
/// New files are assembled in a staging directory first; the target is only
/// touched once every series has been read and verified.
pub async fn apply_patch(target_dir: &Path, patch_path: &Path) -> Result<ApplySummary> {
    let target = target_dir
        .canonicalize()
        .with_context(|| format!("Failed to canonicalize target: {}", target_dir.display()))?;
    let staging = target.join(STAGING_DIR);
    if staging.exists() {
        std::fs::remove_dir_all(&staging)
            .with_context(|| format!("Failed to clear staging dir: {}", staging.display()))?;
    }
    std::fs::create_dir_all(&staging)
        .with_context(|| format!("Failed to create staging dir: {}", staging.display()))?;

    // 1. Reconstruct every new file (sequential: series carry no index)
    let (t, p, s) = (target.clone(), patch_path.to_path_buf(), staging.clone());
    let reconstructed = tokio::task::spawn_blocking(move || reconstruct(&t, &p, &s)).await?;
    let (old, new, changed) = match reconstructed {
        Ok(r) => r,
        Err(e) => {
            if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
                warn!(
                    "Failed to remove staging dir {}: {cleanup}",
                    staging.display()
                );
            }
            return Err(e);
        }
    };

    // 2. Commit into the target
    tokio::task::spawn_blocking(move || commit(&target, &staging, &old, &new, &changed)).await?
}

fn commit(
    target: &Path,
    staging: &Path,
    old: &Container,
    new: &Container,
    changed: &[bool],
) -> Result<ApplySummary> {
    let new_files: HashSet<&str> = new.files.iter().map(|f| f.path.as_str()).collect();
    let new_dirs: HashSet<&str> = new.dirs.iter().map(|d| d.as_str()).collect();

    let mut dirs_to_delete: Vec<String> = old
        .dirs
        .iter()
        .filter(|d| !new_dirs.contains(d.as_str()))
        .cloned()
        .collect();
    util::sort_dirs_deepest_first(&mut dirs_to_delete);
    let deleted_dir_set: HashSet<&str> = dirs_to_delete.iter().map(|d| d.as_str()).collect();

    // Root deleted dirs: those whose immediate parent is not also being deleted.
    // Every file and subdir inside them is gone in the new tree, so they are
    // removed in bulk.
    let root_deleted_dirs: Vec<&str> = dirs_to_delete
        .iter()
        .map(|d| d.as_str())
        .filter(|dir| match Path::new(dir).parent().and_then(|p| p.to_str()) {
            None | Some("") => true,
            Some(parent) => !deleted_dir_set.contains(parent),
        })
        .collect();

    // Orphan files: deleted files in kept directories, not covered by any root.
    let orphan_files: Vec<&str> = old
        .files
        .iter()
        .map(|f| f.path.as_str())
        .filter(|p| !new_files.contains(p))
        .filter(|p| {
            let mut cur = Path::new(p);
            while let Some(parent) = cur.parent() {
                match parent.to_str() {
                    None | Some("") => break,
                    Some(s) if deleted_dir_set.contains(s) => return false,
                    Some(_) => cur = parent,
                }
            }
            true
        })
        .collect();
    let files_deleted = old.files.iter().filter(|f| !new_files.contains(f.path.as_str())).count();

    root_deleted_dirs.par_iter().try_for_each(|dir| -> Result<()> {
        let full = target.join(dir);
        match std::fs::remove_dir_all(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::from(e))
                .with_context(|| format!("Failed to remove directory tree: {}", full.display())),
        }
    })?;
    orphan_files.par_iter().try_for_each(|path| -> Result<()> {
        let full = target.join(path);
        match std::fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::from(e))
                .with_context(|| format!("Failed to delete file: {}", full.display())),
        }
    })?;

    // Create directories (sequential, parent-first - already ordered)
    let mut dirs_created = 0;
    for dir in &new.dirs {
        let full = target.join(dir);
        if !full.is_dir() {
            std::fs::create_dir_all(&full)
                .with_context(|| format!("Failed to create directory: {}", full.display()))?;
            dirs_created += 1;
        }
    }

    // Move staged files into place
    new.files
        .par_iter()
        .enumerate()
        .filter(|(i, _)| changed[*i])
        .try_for_each(|(i, f)| -> Result<()> {
            let from = staging.join(i.to_string());
            let to = target.join(&f.path);
            std::fs::rename(&from, &to)
                .with_context(|| format!("Failed to move patched file into place: {}", to.display()))
        })?;

    std::fs::remove_dir_all(staging)
        .with_context(|| format!("Failed to remove staging dir: {}", staging.display()))?;

    let files_written = changed.iter().filter(|&&c| c).count();
    Ok(ApplySummary {
        dirs_created,
        files_written,
        files_unchanged: changed.len() - files_written,
        files_deleted,
        dirs_deleted: dirs_to_delete.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressedWriter;
    use crate::patch_format::{
        CompressionAlgorithm, CompressionSettings, PatchHeader, PATCH_MAGIC,
    };
    use crate::series::write_rsync_series;
    use crate::wire::{WireReader, WireWriter};

    fn is_corrupt(e: &anyhow::Error) -> bool {
        matches!(e.root_cause().downcast_ref::<Error>(), Some(Error::Corrupt(_)))
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Old file of two full blocks and a 100-byte tail, laid out in `dir`.
    fn old_tree(dir: &Path) -> (Container, Vec<u8>) {
        let data = pattern(BLOCK_SIZE as usize * 2 + 100);
        std::fs::write(dir.join("old.bin"), &data).unwrap();
        let container = Container::new(
            vec![FileEntry {
                path: "old.bin".into(),
                size: data.len() as u64,
                hash: util::hash_bytes(&data),
            }],
            vec![],
        );
        (container, data)
    }

    /// Run one rsync series made of `ops` against the old tree in `dir`,
    /// declaring a new file of `size` bytes.
    fn run_rsync(dir: &Path, old: &Container, ops: Vec<SyncOp>, size: u64) -> Result<Vec<u8>> {
        let mut w = WireWriter::new(Vec::new());
        write_rsync_series(&mut w, 0, ops).unwrap();
        let bytes = w.into_inner();

        let mut series = SeriesReader::new(WireReader::new(&bytes[..]), 1);
        series.next_series().unwrap();
        let entry = FileEntry {
            path: "new.bin".into(),
            size,
            hash: [0; 32],
        };
        let staged = dir.join("staged");
        let mut sources = OldFiles::new(dir, old);
        let hash = apply_rsync(&mut series, &mut sources, &entry, &staged)?;
        let out = std::fs::read(&staged).unwrap();
        assert_eq!(hash, util::hash_bytes(&out));
        Ok(out)
    }

    fn range(file_index: i64, block_index: i64, block_span: i64) -> SyncOp {
        SyncOp::BlockRange {
            file_index,
            block_index,
            block_span,
        }
    }

    #[test]
    fn test_rsync_partial_range_with_short_last_block() {
        let dir = tempfile::tempdir().unwrap();
        let (old, data) = old_tree(dir.path());
        let tail_start = BLOCK_SIZE as usize;

        let out = run_rsync(
            dir.path(),
            &old,
            vec![range(0, 1, 2), SyncOp::Data(b"xy".to_vec())],
            (data.len() - tail_start + 2) as u64,
        )
        .unwrap();
        assert_eq!(&out[..data.len() - tail_start], &data[tail_start..]);
        assert_eq!(&out[data.len() - tail_start..], b"xy");
    }

    #[test]
    fn test_rsync_range_past_end_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let (old, _) = old_tree(dir.path());
        let err = run_rsync(dir.path(), &old, vec![range(0, 1, 3)], 3 * BLOCK_SIZE).unwrap_err();
        assert!(is_corrupt(&err), "{err:#}");
        let err = run_rsync(dir.path(), &old, vec![range(0, 7, 1)], BLOCK_SIZE).unwrap_err();
        assert!(is_corrupt(&err), "{err:#}");
    }

    #[test]
    fn test_rsync_bad_file_index_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let (old, _) = old_tree(dir.path());
        for index in [1, 5, -1] {
            let err = run_rsync(dir.path(), &old, vec![range(index, 0, 1)], BLOCK_SIZE).unwrap_err();
            assert!(is_corrupt(&err), "{index}: {err:#}");
        }
    }

    #[test]
    fn test_rsync_negative_range_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let (old, _) = old_tree(dir.path());
        for op in [range(0, -1, 1), range(0, 0, -1)] {
            let err = run_rsync(dir.path(), &old, vec![op], BLOCK_SIZE).unwrap_err();
            assert!(is_corrupt(&err), "{err:#}");
        }
    }

    #[test]
    fn test_rsync_size_mismatch_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let (old, _) = old_tree(dir.path());

        let overrun = run_rsync(dir.path(), &old, vec![SyncOp::Data(vec![7; 10])], 5).unwrap_err();
        assert!(is_corrupt(&overrun), "{overrun:#}");

        let short = run_rsync(dir.path(), &old, vec![SyncOp::Data(vec![7; 3])], 5).unwrap_err();
        assert!(is_corrupt(&short), "{short:#}");
    }

    fn write_patch_file(path: &Path, old: &Container, new: &Container, series: &[u8]) {
        let settings = CompressionSettings {
            algorithm: CompressionAlgorithm::None,
            quality: 0,
        };
        let mut header = WireWriter::new(Vec::new());
        header.write_magic(PATCH_MAGIC).unwrap();
        header
            .write_message(&PatchHeader {
                compression: settings,
            })
            .unwrap();
        let mut wire = WireWriter::new(CompressedWriter::new(header.into_inner(), &settings).unwrap());
        wire.write_message(old).unwrap();
        wire.write_message(new).unwrap();
        wire.write_framed(series).unwrap();
        let bytes = wire.into_inner().finish().unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    #[tokio::test]
    async fn test_escaping_dir_is_never_deleted() {
        let temp = tempfile::tempdir().unwrap();
        let target = temp.path().join("target");
        let victim = temp.path().join("victim");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::create_dir_all(&victim).unwrap();
        std::fs::write(victim.join("precious.txt"), b"keep me").unwrap();

        let patch = temp.path().join("evil.patch");
        let old = Container::new(vec![], vec!["../victim".into()]);
        write_patch_file(&patch, &old, &Container::default(), &[]);

        let err = apply_patch(&target, &patch).await.unwrap_err();
        assert!(is_corrupt(&err), "{err:#}");
        assert_eq!(std::fs::read(victim.join("precious.txt")).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn test_escaping_file_is_never_written() {
        let temp = tempfile::tempdir().unwrap();
        let target = temp.path().join("target");
        std::fs::create_dir_all(&target).unwrap();

        let content = b"outside".to_vec();
        let new = Container::new(
            vec![FileEntry {
                path: "../escaped.txt".into(),
                size: content.len() as u64,
                hash: util::hash_bytes(&content),
            }],
            vec![],
        );
        let mut w = WireWriter::new(Vec::new());
        write_rsync_series(&mut w, 0, vec![SyncOp::Data(content)]).unwrap();

        let patch = temp.path().join("evil.patch");
        write_patch_file(&patch, &Container::default(), &new, &w.into_inner());

        let err = apply_patch(&target, &patch).await.unwrap_err();
        assert!(is_corrupt(&err), "{err:#}");
        assert!(!temp.path().join("escaped.txt").exists());
        assert!(!target.join(STAGING_DIR).exists());
    }
}
