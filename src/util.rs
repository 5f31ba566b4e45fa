use anyhow::{Context, Result};
use memmap2::Mmap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub relative_path: String,
    pub kind: EntryKind,
    pub full_path: PathBuf,
    /// File size in bytes (0 for directories). Free from the OS directory scan.
    pub size: u64,
}

/// Walk a directory tree and collect all entries with relative paths.
/// Paths use forward slashes for cross-platform consistency in the patch format.
/// Anything whose top-level component is in `skip` is left out.
pub fn walk_directory(root: &Path, skip: &[&str]) -> Result<Vec<DirEntry>> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to canonicalize path: {}", root.display()))?;

    let mut entries = Vec::new();

    let walker = WalkDir::new(&root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() != 1 || !skip.iter().any(|s| e.file_name() == std::ffi::OsStr::new(s))
        });

    for entry in walker {
        let entry = entry
            .with_context(|| format!("Failed to read directory entry in {}", root.display()))?;

        let full_path = entry.path().to_path_buf();
        let relative = full_path
            .strip_prefix(&root)
            .with_context(|| "Failed to compute relative path")?;

        let relative_str = relative
            .to_str()
            .with_context(|| format!("Non-UTF8 path: {}", relative.display()))?
            .replace('\\', "/");

        let kind = if entry.file_type().is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        let meta = entry
            .metadata()
            .with_context(|| format!("Failed to read metadata: {}", full_path.display()))?;
        let size = if kind == EntryKind::File { meta.len() } else { 0 };

        entries.push(DirEntry {
            relative_path: relative_str,
            kind,
            full_path,
            size,
        });
    }

    Ok(entries)
}

/// Read-only contents of a file: a memory map, or nothing for empty files
/// (which cannot be mapped on every platform).
pub enum FileData {
    Mapped(Mmap),
    Empty,
}

impl Deref for FileData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            FileData::Mapped(m) => &m[..],
            FileData::Empty => &[],
        }
    }
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the mapping is live.
pub fn mmap_file(path: &Path) -> Result<FileData> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;
    let len = file
        .metadata()
        .with_context(|| format!("Failed to read metadata: {}", path.display()))?
        .len();
    if len == 0 {
        return Ok(FileData::Empty);
    }
    // SAFETY: We only read from this mapping; no concurrent modification of these files.
    let map = unsafe {
        Mmap::map(&file)
            .with_context(|| format!("Failed to memory-map file: {}", path.display()))?
    };
    Ok(FileData::Mapped(map))
}

/// Compute the BLAKE3 hash of a byte slice.
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Stream-hash a file using BLAKE3.
/// Uses a 256 KB BufReader to reduce syscall overhead vs the default 8 KB.
pub fn hash_file_streaming(path: &Path) -> Result<[u8; 32]> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = std::io::BufReader::with_capacity(256 * 1024, file);
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut reader, &mut hasher)
        .with_context(|| format!("Failed to hash file: {}", path.display()))?;
    Ok(*hasher.finalize().as_bytes())
}

/// Sort directory paths so parents come before children.
pub fn sort_dirs_parent_first(dirs: &mut [String]) {
    dirs.sort();
}

/// Sort directory paths so children come before parents (for deletion).
pub fn sort_dirs_deepest_first(dirs: &mut [String]) {
    dirs.sort();
    dirs.reverse();
}

/// Render a byte count with IEC units ("1.5 MiB").
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MiB");
    }

    #[test]
    fn test_walk_skips_top_level_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("keep/sub")).unwrap();
        std::fs::create_dir_all(dir.path().join(".staging")).unwrap();
        std::fs::write(dir.path().join("keep/sub/a.txt"), b"abc").unwrap();
        std::fs::write(dir.path().join(".staging/x"), b"x").unwrap();

        let entries = walk_directory(dir.path(), &[".staging"]).unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["keep", "keep/sub", "keep/sub/a.txt"]);
        assert_eq!(entries[2].size, 3);
        assert_eq!(entries[2].kind, EntryKind::File);
    }

    #[test]
    fn test_mmap_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        assert!(mmap_file(&path).unwrap().is_empty());

        std::fs::write(&path, b"data").unwrap();
        assert_eq!(&*mmap_file(&path).unwrap(), b"data");
    }

    #[test]
    fn test_hash_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hash me").unwrap();
        assert_eq!(hash_file_streaming(&path).unwrap(), hash_bytes(b"hash me"));
    }
}
