use anyhow::{bail, Context, Result};
use log::debug;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::bspatch::PatchBody;
use crate::container::Container;
use crate::error::Error;
use crate::patch_format::{block_range_len, SeriesType, SyncOp};
use crate::series::{open_patch, SeriesReader};
use crate::util::format_bytes;

/// Unchanged stretches of a bsdiffed file shorter than this are not reported.
const UNCHANGED_RUN_THRESHOLD: u64 = 1024 * 1024;
/// At most this many files are listed (and deep-analyzed).
const MAX_TOP_FILES: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesStat {
    pub file_index: usize,
    /// Bytes of the new file not sourced from old data.
    pub fresh_data: i64,
    pub kind: SeriesType,
}

#[derive(Debug)]
pub struct ProbeReport {
    pub patch_size: u64,
    pub old: Container,
    pub new: Container,
    /// Sorted by decreasing fresh data.
    pub stats: Vec<SeriesStat>,
    pub rsync_series: usize,
    pub bsdiff_series: usize,
    pub total_fresh: i64,
    pub files_touched: usize,
    /// Total size of the files with any fresh data.
    pub naive_size: u64,
    /// Leading entries of `stats` covering 90% of the fresh data.
    pub top: usize,
}

impl ProbeReport {
    pub fn top_files(&self) -> impl Iterator<Item = &SeriesStat> {
        self.stats.iter().take(self.top)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeepFinding {
    Rsync {
        file_index: usize,
        /// Blocks taken per old file index.
        sources: BTreeMap<usize, u64>,
    },
    Bsdiff {
        file_index: usize,
        target_index: usize,
        same_path: bool,
        /// New bytes left identical to the old file at the same offset.
        pristine: u64,
        /// `(start, end)` offsets in the new file of long unchanged runs.
        unchanged_runs: Vec<(u64, u64)>,
    },
}

fn open(patch_path: &Path) -> Result<BufReader<File>> {
    let file = File::open(patch_path)
        .with_context(|| format!("Failed to open patch: {}", patch_path.display()))?;
    Ok(BufReader::new(file))
}

fn old_index(old: &Container, index: i64) -> Result<usize> {
    match usize::try_from(index) {
        Ok(i) if i < old.files.len() => Ok(i),
        _ => Err(Error::corrupt(format!(
            "old file index {index} out of range ({} files)",
            old.files.len()
        ))
        .into()),
    }
}

/// Block index or span of a block range; negative values are malformed.
fn block_field(value: i64, what: &str) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| Error::corrupt(format!("negative block {what} {value}")).into())
}

fn rsync_fresh<R: Read>(series: &mut SeriesReader<R>, old: &Container, size: u64) -> Result<i64> {
    let mut fresh = size as i64;
    while let Some(op) = series.next_op()? {
        if let SyncOp::BlockRange {
            file_index,
            block_index,
            block_span,
        } = op
        {
            let source = &old.files[old_index(old, file_index)?];
            let covered = block_range_len(
                source.size,
                block_field(block_index, "index")?,
                block_field(block_span, "span")?,
            );
            fresh -= covered as i64;
        }
    }
    Ok(fresh)
}

/// Walk every series of a patch and tally where its fresh data lives.
pub fn analyze(patch_path: &Path) -> Result<ProbeReport> {
    let patch_size = std::fs::metadata(patch_path)
        .with_context(|| format!("Failed to stat patch: {}", patch_path.display()))?
        .len();
    let stream = open_patch(open(patch_path)?).context("Failed to read patch header")?;
    let (old, new, mut series) = (stream.old, stream.new, stream.series);

    let mut stats = Vec::with_capacity(new.files.len());
    let (mut rsync_series, mut bsdiff_series) = (0, 0);

    while let Some(header) = series.next_series()? {
        let f = &new.files[header.file_index];
        let fresh_data = match header.kind {
            SeriesType::Rsync => {
                rsync_series += 1;
                rsync_fresh(&mut series, &old, f.size)?
            }
            SeriesType::Bsdiff => {
                bsdiff_series += 1;
                series.read_bsdiff_header()?;
                let body = series.read_bsdiff_body()?;
                f.size as i64 - body.diff.iter().filter(|&&b| b == 0).count() as i64
            }
        };
        stats.push(SeriesStat {
            file_index: header.file_index,
            fresh_data,
            kind: header.kind,
        });
    }

    stats.sort_by(|a, b| b.fresh_data.cmp(&a.fresh_data));
    let total_fresh: i64 = stats.iter().map(|s| s.fresh_data).sum();

    let threshold = (total_fresh as f64 * 0.9) as i64;
    let mut top = 0;
    let mut printed = 0i64;
    for stat in &stats {
        top += 1;
        printed += stat.fresh_data;
        if top >= MAX_TOP_FILES || printed >= threshold {
            break;
        }
    }

    let touched: Vec<&SeriesStat> = stats.iter().filter(|s| s.fresh_data > 0).collect();
    let files_touched = touched.len();
    let naive_size = touched.iter().map(|s| new.files[s.file_index].size).sum();

    Ok(ProbeReport {
        patch_size,
        old,
        new,
        stats,
        rsync_series,
        bsdiff_series,
        total_fresh,
        files_touched,
        naive_size,
        top,
    })
}

/// Replay a bsdiff body against positions only, counting add bytes that
/// leave the old data untouched at the same offset.
fn pristine_runs(body: &PatchBody) -> Result<(u64, Vec<(u64, u64)>)> {
    let (mut old_pos, mut new_pos) = (0i64, 0i64);
    let mut diff_pos = 0usize;
    let mut pristine = 0u64;
    let mut run = 0u64;
    let mut runs = Vec::new();

    let mut close_run = |run: &mut u64, end: i64| {
        if *run > UNCHANGED_RUN_THRESHOLD {
            runs.push((end as u64 - *run, end as u64));
        }
        *run = 0;
    };

    for control in &body.controls {
        let add = control.add as usize;
        let Some(bytes) = body.diff.get(diff_pos..diff_pos.saturating_add(add)) else {
            bail!("bsdiff add data shorter than its triples");
        };
        diff_pos += add;

        if old_pos == new_pos {
            for &b in bytes {
                old_pos += 1;
                new_pos += 1;
                if b == 0 {
                    pristine += 1;
                    run += 1;
                } else {
                    close_run(&mut run, new_pos - 1);
                }
            }
        } else {
            old_pos += add as i64;
            new_pos += add as i64;
        }

        if control.copy > 0 {
            close_run(&mut run, new_pos);
            new_pos += control.copy;
        }
        old_pos += control.seek;
    }
    close_run(&mut run, new_pos);

    Ok((pristine, runs))
}

/// Re-read the patch, analyzing the series of `files` in depth and
/// skipping every other one.
pub fn deep_analyze(patch_path: &Path, files: &[usize]) -> Result<Vec<DeepFinding>> {
    let wanted: HashSet<usize> = files.iter().copied().collect();
    let stream = open_patch(open(patch_path)?).context("Failed to read patch header")?;
    let (old, new, mut series) = (stream.old, stream.new, stream.series);
    let mut findings = Vec::new();

    while let Some(header) = series.next_series()? {
        let i = header.file_index;
        if !wanted.contains(&i) {
            debug!("skipping series {i}");
            series.skip_series()?;
            continue;
        }

        match header.kind {
            SeriesType::Rsync => {
                let mut sources = BTreeMap::new();
                while let Some(op) = series.next_op()? {
                    if let SyncOp::BlockRange {
                        file_index,
                        block_span,
                        ..
                    } = op
                    {
                        let span = block_field(block_span, "span")?;
                        *sources.entry(old_index(&old, file_index)?).or_insert(0) += span;
                    }
                }
                findings.push(DeepFinding::Rsync {
                    file_index: i,
                    sources,
                });
            }
            SeriesType::Bsdiff => {
                let bh = series.read_bsdiff_header()?;
                let target_index = old_index(&old, bh.target_index)?;
                let body = series.read_bsdiff_body()?;
                let (pristine, unchanged_runs) = pristine_runs(&body)?;
                findings.push(DeepFinding::Bsdiff {
                    file_index: i,
                    target_index,
                    same_path: old.files[target_index].path == new.files[i].path,
                    pristine,
                    unchanged_runs,
                });
            }
        }
    }

    Ok(findings)
}

/// Run the primary analysis and, when `deep`, the deep analysis of the top
/// files.
pub async fn probe_patch(patch_path: &Path, deep: bool) -> Result<(ProbeReport, Vec<DeepFinding>)> {
    let path = patch_path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<(ProbeReport, Vec<DeepFinding>)> {
        let report = analyze(&path)?;
        let findings = if deep {
            let top: Vec<usize> = report.top_files().map(|s| s.file_index).collect();
            deep_analyze(&path, &top)?
        } else {
            Vec::new()
        };
        Ok((report, findings))
    })
    .await?
}

fn display_name(path: &str, fullpath: bool) -> &str {
    if fullpath {
        path
    } else {
        path.rsplit('/').next().unwrap_or(path)
    }
}

fn format_signed(bytes: i64) -> String {
    if bytes < 0 {
        format!("-{}", format_bytes(bytes.unsigned_abs()))
    } else {
        format_bytes(bytes as u64)
    }
}

pub fn print_report(report: &ProbeReport, fullpath: bool) {
    println!("patch:  {}", format_bytes(report.patch_size));
    println!(
        "  before: {} in {}",
        format_bytes(report.old.size),
        report.old.stats()
    );
    println!(
        "   after: {} in {}",
        format_bytes(report.new.size),
        report.new.stats()
    );
    println!(
        "{} bsdiff series, {} rsync series",
        report.bsdiff_series, report.rsync_series
    );

    println!("\nMost of the fresh data is in the following files:");
    for stat in report.top_files() {
        let f = &report.new.files[stat.file_index];
        let percent = if f.size > 0 {
            stat.fresh_data as f64 / f.size as f64 * 100.0
        } else {
            0.0
        };
        println!(
            "  - {} / {} in {} ({:.2}% changed, {})",
            format_signed(stat.fresh_data),
            format_bytes(f.size),
            display_name(&f.path, fullpath),
            percent,
            stat.kind
        );
    }

    let kind = if report.bsdiff_series > 0 {
        "optimized"
    } else {
        "simple"
    };
    println!(
        "\nAll in all, that's {} of fresh data in a {} {} patch",
        format_signed(report.total_fresh),
        format_bytes(report.patch_size),
        kind
    );
    println!(
        " ({}/{} files are changed by this patch, they weigh a total of {})",
        report.files_touched,
        report.stats.len(),
        format_bytes(report.naive_size)
    );
}

pub fn print_findings(report: &ProbeReport, findings: &[DeepFinding]) {
    println!("\nNow deep-diving into top {} files", findings.len());
    for finding in findings {
        println!("\n=============================================\n");
        match finding {
            DeepFinding::Rsync {
                file_index,
                sources,
            } => {
                println!(
                    "Analyzing rsync series for '{}'",
                    report.new.files[*file_index].path
                );
                if sources.is_empty() {
                    println!("Entirely fresh data!");
                    continue;
                }
                println!("Sourcing from {} old files:", sources.len());
                for (old_index, blocks) in sources {
                    println!(
                        "  Taking {blocks} blocks from '{}'",
                        report.old.files[*old_index].path
                    );
                }
            }
            DeepFinding::Bsdiff {
                file_index,
                target_index,
                same_path,
                pristine,
                unchanged_runs,
            } => {
                let f = &report.new.files[*file_index];
                let tf = &report.old.files[*target_index];
                println!("Analyzing bsdiff series for '{}'", f.path);
                println!("Diffed against old file '{}'", tf.path);
                if *same_path {
                    println!("Same path, can do in-place!");
                }
                for (start, end) in unchanged_runs {
                    println!(
                        "{} contiguous unchanged block from {} to {}",
                        format_bytes(end - start),
                        format_bytes(*start),
                        format_bytes(*end)
                    );
                }
                println!(
                    "{} / {} pristine after patch application",
                    format_bytes(*pristine),
                    format_bytes(tf.size)
                );
                println!(
                    "File went from {} to {}",
                    format_bytes(tf.size),
                    format_bytes(f.size)
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch_format::Control;

    fn body(controls: Vec<Control>, diff: Vec<u8>) -> PatchBody {
        PatchBody {
            controls,
            diff,
            extra: Vec::new(),
        }
    }

    #[test]
    fn test_pristine_counts_zero_add_bytes() {
        let b = body(
            vec![Control {
                add: 6,
                copy: 0,
                seek: 0,
            }],
            vec![0, 0, 7, 0, 0, 0],
        );
        let (pristine, runs) = pristine_runs(&b).unwrap();
        assert_eq!(pristine, 5);
        assert!(runs.is_empty());
    }

    #[test]
    fn test_pristine_ignores_shifted_adds() {
        // After a copy the cursors diverge, so later zeros are not in place.
        let b = body(
            vec![
                Control {
                    add: 2,
                    copy: 3,
                    seek: 0,
                },
                Control {
                    add: 2,
                    copy: 0,
                    seek: 0,
                },
            ],
            vec![0, 0, 0, 0],
        );
        assert_eq!(pristine_runs(&b).unwrap().0, 2);
    }

    #[test]
    fn test_long_unchanged_run_reported() {
        let len = UNCHANGED_RUN_THRESHOLD as usize + 10;
        let mut diff = vec![0u8; len];
        diff[len - 1] = 1;
        let b = body(
            vec![Control {
                add: len as i64,
                copy: 0,
                seek: 0,
            }],
            diff,
        );
        let (pristine, runs) = pristine_runs(&b).unwrap();
        assert_eq!(pristine, len as u64 - 1);
        assert_eq!(runs, vec![(0, len as u64 - 1)]);
    }

    #[test]
    fn test_short_add_data_rejected() {
        let b = body(
            vec![Control {
                add: 4,
                copy: 0,
                seek: 0,
            }],
            vec![0, 0],
        );
        assert!(pristine_runs(&b).is_err());
    }

    #[test]
    fn test_negative_block_range_rejected() {
        let old = Container::new(
            vec![crate::container::FileEntry {
                path: "old.bin".into(),
                size: 10,
                hash: [0; 32],
            }],
            vec![],
        );
        for (block_index, block_span) in [(-1, 1), (0, -1)] {
            let mut w = crate::wire::WireWriter::new(Vec::new());
            crate::series::write_rsync_series(
                &mut w,
                0,
                vec![SyncOp::BlockRange {
                    file_index: 0,
                    block_index,
                    block_span,
                }],
            )
            .unwrap();
            let bytes = w.into_inner();
            let mut series = SeriesReader::new(crate::wire::WireReader::new(&bytes[..]), 1);
            series.next_series().unwrap();
            let err = rsync_fresh(&mut series, &old, 10).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<Error>(),
                Some(Error::Corrupt(_))
            ));
        }
        assert!(old_index(&old, 1).is_err());
        assert!(old_index(&old, -1).is_err());
        assert_eq!(old_index(&old, 0).unwrap(), 0);
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name("a/b/c.bin", false), "c.bin");
        assert_eq!(display_name("a/b/c.bin", true), "a/b/c.bin");
        assert_eq!(display_name("top", false), "top");
    }
}
