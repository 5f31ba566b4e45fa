use anyhow::{Context, Result};
use log::{debug, info};
use rayon::prelude::*;
use std::collections::HashMap;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::apply::STAGING_DIR;
use crate::compression::CompressedWriter;
use crate::container::Container;
use crate::patch_format::{
    block_count, CompressionSettings, PatchHeader, SyncOp, BLOCK_SIZE, PATCH_MAGIC,
};
use crate::series::{write_bsdiff_series, write_rsync_series};
use crate::util;
use crate::wire::WireWriter;

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub compression: CompressionSettings,
    /// Files larger than this on either side are never bsdiffed.
    pub max_bsdiff_size: u64,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            compression: CompressionSettings::default(),
            max_bsdiff_size: 512 * 1024 * 1024,
        }
    }
}

/// How the series of one new file is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesPlan {
    /// Identical to an old file: one block range over all of it.
    Reuse { old_index: usize },
    /// Changed file at the same path: bsdiff against the old version.
    Bsdiff { old_index: usize },
    /// No usable counterpart: literal data ops.
    Fresh,
}

#[derive(Debug, Default)]
pub struct PatchSummary {
    pub files: usize,
    pub dirs: usize,
    pub rsync_series: usize,
    pub bsdiff_series: usize,
    pub files_reused: usize,
    pub files_fresh: usize,
    pub patch_size: u64,
}

/// Returns true for file types that are already compressed or otherwise incompressible,
/// where computing a binary diff would yield no meaningful savings.
fn is_incompressible(path: &str) -> bool {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    matches!(
        ext.as_deref(),
        Some(
            // Images
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "avif"
            // Video
            | "mp4" | "mkv" | "avi" | "mov" | "webm"
            // Audio
            | "mp3" | "aac" | "ogg" | "flac" | "opus"
            // Archives
            | "zip" | "gz" | "bz2" | "xz" | "zst" | "7z" | "rar"
            // Fonts
            | "woff" | "woff2"
        )
    )
}

/// Choose a series kind for every file of `new`, in container order.
pub fn plan_series(old: &Container, new: &Container, options: &CreateOptions) -> Vec<SeriesPlan> {
    let mut by_content: HashMap<([u8; 32], u64), usize> = HashMap::with_capacity(old.files.len());
    for (i, f) in old.files.iter().enumerate() {
        by_content.entry((f.hash, f.size)).or_insert(i);
    }

    new.files
        .iter()
        .map(|f| {
            let same_path = old.file_index(&f.path);
            if let Some(i) = same_path {
                let o = &old.files[i];
                if o.hash == f.hash && o.size == f.size {
                    return SeriesPlan::Reuse { old_index: i };
                }
            }
            if let Some(&i) = by_content.get(&(f.hash, f.size)) {
                return SeriesPlan::Reuse { old_index: i };
            }
            if let Some(i) = same_path {
                let o = &old.files[i];
                if o.size > 0
                    && f.size > 0
                    && o.size <= options.max_bsdiff_size
                    && f.size <= options.max_bsdiff_size
                    && !is_incompressible(&f.path)
                {
                    return SeriesPlan::Bsdiff { old_index: i };
                }
            }
            SeriesPlan::Fresh
        })
        .collect()
}

/// Encode the complete series of new file `index` into its own buffer.
fn encode_series(
    index: usize,
    plan: SeriesPlan,
    roots: (&Path, &Path),
    old: &Container,
    new: &Container,
) -> Result<Vec<u8>> {
    let (old_root, new_root) = roots;
    let entry = &new.files[index];
    let mut wire = WireWriter::new(Vec::new());

    match plan {
        SeriesPlan::Reuse { old_index } => {
            let size = old.files[old_index].size;
            let ops = (size > 0).then(|| SyncOp::BlockRange {
                file_index: old_index as i64,
                block_index: 0,
                block_span: block_count(size) as i64,
            });
            write_rsync_series(&mut wire, index, ops)?;
        }
        SeriesPlan::Bsdiff { old_index } => {
            let old_data = util::mmap_file(&old_root.join(&old.files[old_index].path))?;
            let new_data = util::mmap_file(&new_root.join(&entry.path))?;
            let stats = write_bsdiff_series(&mut wire, index, old_index, &old_data, &new_data)?;
            debug!(
                "bsdiff {}: {} triples, {} changed, {} fresh",
                entry.path, stats.controls, stats.changed_bytes, stats.copy_bytes
            );
        }
        SeriesPlan::Fresh => {
            let data = util::mmap_file(&new_root.join(&entry.path))?;
            let ops = data
                .chunks(BLOCK_SIZE as usize)
                .map(|chunk| SyncOp::Data(chunk.to_vec()));
            write_rsync_series(&mut wire, index, ops)?;
        }
    }

    Ok(wire.into_inner())
}

fn write_patch(
    roots: (&Path, &Path),
    old: &Container,
    new: &Container,
    plans: &[SeriesPlan],
    options: &CreateOptions,
    output: &Path,
) -> Result<()> {
    // Series are independent per file: encode them in parallel, then append
    // them to the single output stream in container order.
    let series: Vec<Vec<u8>> = plans
        .par_iter()
        .enumerate()
        .map(|(i, &plan)| {
            encode_series(i, plan, roots, old, new)
                .with_context(|| format!("Failed to encode series for {}", new.files[i].path))
        })
        .collect::<Result<_>>()?;

    let file = std::fs::File::create(output)
        .with_context(|| format!("Failed to create output file: {}", output.display()))?;

    let mut header = WireWriter::new(BufWriter::new(file));
    header.write_magic(PATCH_MAGIC)?;
    header.write_message(&PatchHeader {
        compression: options.compression,
    })?;

    let body = CompressedWriter::new(header.into_inner(), &options.compression)
        .context("Failed to set up patch compression")?;
    let mut wire = WireWriter::new(body);
    wire.write_message(old)?;
    wire.write_message(new)?;
    for framed in &series {
        wire.write_framed(framed)?;
    }
    debug!(
        "patch body: {} before compression",
        util::format_bytes(wire.bytes_written())
    );

    let mut out = wire
        .into_inner()
        .finish()
        .context("Failed to finish compressed patch body")?;
    out.flush()?;
    Ok(())
}

/// Create a patch file by comparing old_dir and new_dir.
/// Uses Tokio for concurrent directory scans and Rayon for parallel hashing/diffing.
pub async fn create_patch(
    old_dir: &Path,
    new_dir: &Path,
    output: &Path,
    options: &CreateOptions,
) -> Result<PatchSummary> {
    // Stage 1: Walk and hash both directories concurrently
    let old_root: PathBuf = old_dir.to_path_buf();
    let new_root: PathBuf = new_dir.to_path_buf();
    let (old, new) = {
        let (o, n) = (old_root.clone(), new_root.clone());
        tokio::try_join!(
            tokio::task::spawn_blocking(move || Container::scan(&o, &[STAGING_DIR])),
            tokio::task::spawn_blocking(move || Container::scan(&n, &[STAGING_DIR])),
        )?
    };
    let old = old?;
    let new = new?;
    info!("old: {} ({})", old.stats(), util::format_bytes(old.size));
    info!("new: {} ({})", new.stats(), util::format_bytes(new.size));

    // Stage 2: Decide how each new file is expressed
    let plans = plan_series(&old, &new, options);

    let mut summary = PatchSummary {
        files: new.files.len(),
        dirs: new.dirs.len(),
        ..Default::default()
    };
    for plan in &plans {
        match plan {
            SeriesPlan::Reuse { .. } => {
                summary.rsync_series += 1;
                summary.files_reused += 1;
            }
            SeriesPlan::Fresh => {
                summary.rsync_series += 1;
                summary.files_fresh += 1;
            }
            SeriesPlan::Bsdiff { .. } => summary.bsdiff_series += 1,
        }
    }

    // Stage 3: Encode series and write the patch
    let options = options.clone();
    let output_owned = output.to_path_buf();
    tokio::task::spawn_blocking(move || {
        write_patch(
            (&old_root, &new_root),
            &old,
            &new,
            &plans,
            &options,
            &output_owned,
        )
    })
    .await??;

    summary.patch_size = std::fs::metadata(output)
        .with_context(|| format!("Failed to stat patch: {}", output.display()))?
        .len();
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::FileEntry;

    fn entry(path: &str, size: u64, tag: u8) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            size,
            hash: [tag; 32],
        }
    }

    #[test]
    fn test_plan_series() {
        let old = Container::new(
            vec![
                entry("a.bin", 100, 1),
                entry("b.bin", 100, 2),
                entry("c.png", 100, 3),
                entry("moved.txt", 50, 4),
            ],
            vec![],
        );
        let new = Container::new(
            vec![
                entry("a.bin", 100, 1),
                entry("b.bin", 120, 9),
                entry("c.png", 100, 8),
                entry("d/renamed.txt", 50, 4),
                entry("e.txt", 10, 7),
            ],
            vec!["d".into()],
        );

        let plans = plan_series(&old, &new, &CreateOptions::default());
        assert_eq!(
            plans,
            vec![
                SeriesPlan::Reuse { old_index: 0 },
                SeriesPlan::Bsdiff { old_index: 1 },
                SeriesPlan::Fresh,
                SeriesPlan::Reuse { old_index: 3 },
                SeriesPlan::Fresh,
            ]
        );
    }

    #[test]
    fn test_plan_respects_size_ceiling() {
        let old = Container::new(vec![entry("big", 1000, 1)], vec![]);
        let new = Container::new(vec![entry("big", 2000, 2)], vec![]);
        let options = CreateOptions {
            max_bsdiff_size: 1500,
            ..Default::default()
        };
        assert_eq!(plan_series(&old, &new, &options), vec![SeriesPlan::Fresh]);
    }

    #[test]
    fn test_is_incompressible() {
        assert!(is_incompressible("assets/Logo.PNG"));
        assert!(!is_incompressible("bin/game.exe"));
        assert!(!is_incompressible("noext"));
    }
}
