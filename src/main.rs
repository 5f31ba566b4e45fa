use bsdelta::patch_format::{CompressionAlgorithm, CompressionSettings};
use bsdelta::{apply, create, probe, util};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "bsdelta", about = "Directory patch creator and applier using bsdiff")]
struct Cli {
    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Compression {
    Zstd,
    #[value(name = "none")]
    Plain,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a patch by comparing old and new directories
    Create {
        /// Path to the old (original) directory
        #[arg(long)]
        old: PathBuf,
        /// Path to the new (updated) directory
        #[arg(long)]
        new: PathBuf,
        /// Output path for the patch file
        #[arg(long, short)]
        output: PathBuf,
        /// Compression of the patch body
        #[arg(long, value_enum, default_value_t = Compression::Zstd)]
        compression: Compression,
        /// Compression level
        #[arg(long, default_value_t = 3)]
        level: i32,
        /// Files larger than this (in bytes) are never bsdiffed
        #[arg(long, default_value_t = create::CreateOptions::default().max_bsdiff_size)]
        max_bsdiff_size: u64,
    },
    /// Apply a patch to a target directory
    Apply {
        /// Path to the target directory to patch
        #[arg(long)]
        target: PathBuf,
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
    },
    /// Show statistics about a patch file
    Probe {
        /// Path of the patch to analyze
        patch: PathBuf,
        /// Display full path names
        #[arg(long)]
        fullpath: bool,
        /// Analyze the top changed files further
        #[arg(long)]
        deep: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match cli.command {
        Commands::Create {
            old,
            new,
            output,
            compression,
            level,
            max_bsdiff_size,
        } => {
            println!("Creating patch...");
            println!("  Old: {}", old.display());
            println!("  New: {}", new.display());
            println!("  Output: {}", output.display());

            let options = create::CreateOptions {
                compression: CompressionSettings {
                    algorithm: match compression {
                        Compression::Zstd => CompressionAlgorithm::Zstd,
                        Compression::Plain => CompressionAlgorithm::None,
                    },
                    quality: level,
                },
                max_bsdiff_size,
            };

            let start = Instant::now();
            let summary = create::create_patch(&old, &new, &output, &options).await?;
            let elapsed = start.elapsed();

            println!("\nPatch created successfully!");
            println!("  Files: {}", summary.files);
            println!("  Directories: {}", summary.dirs);
            println!("  Rsync series: {}", summary.rsync_series);
            println!("  Bsdiff series: {}", summary.bsdiff_series);
            println!("  Files reused: {}", summary.files_reused);
            println!("  Files fresh: {}", summary.files_fresh);
            println!("  Patch size: {}", util::format_bytes(summary.patch_size));
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Apply { target, patch } => {
            println!("Applying patch...");
            println!("  Target: {}", target.display());
            println!("  Patch: {}", patch.display());

            let start = Instant::now();
            let summary = apply::apply_patch(&target, &patch).await?;
            let elapsed = start.elapsed();

            println!("\nPatch applied successfully!");
            println!("  Directories created: {}", summary.dirs_created);
            println!("  Files written: {}", summary.files_written);
            println!("  Files unchanged: {}", summary.files_unchanged);
            println!("  Files deleted: {}", summary.files_deleted);
            println!("  Directories deleted: {}", summary.dirs_deleted);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Probe {
            patch,
            fullpath,
            deep,
        } => {
            let start = Instant::now();
            let (report, findings) = probe::probe_patch(&patch, deep).await?;
            let elapsed = start.elapsed();

            probe::print_report(&report, fullpath);
            if deep {
                probe::print_findings(&report, &findings);
            }
            println!("\nAnalyzed in {:.3}s", elapsed.as_secs_f64());
        }
    }

    Ok(())
}
