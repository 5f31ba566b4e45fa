use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Leading magic number of every patch file.
pub const PATCH_MAGIC: u32 = 0x0FEF_5F00;

/// Fixed block size shared by block-range writers and readers.
pub const BLOCK_SIZE: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    None,
    Zstd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionSettings {
    pub algorithm: CompressionAlgorithm,
    pub quality: i32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Zstd,
            quality: 3,
        }
    }
}

/// Written uncompressed right after the magic number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchHeader {
    pub compression: CompressionSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesType {
    Rsync,
    Bsdiff,
}

impl SeriesType {
    pub fn tag(self) -> u32 {
        match self {
            SeriesType::Rsync => 0,
            SeriesType::Bsdiff => 1,
        }
    }
}

impl TryFrom<u32> for SeriesType {
    type Error = Error;

    fn try_from(tag: u32) -> Result<Self, Error> {
        match tag {
            0 => Ok(SeriesType::Rsync),
            1 => Ok(SeriesType::Bsdiff),
            other => Err(Error::UnsupportedSeriesType(other)),
        }
    }
}

impl std::fmt::Display for SeriesType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeriesType::Rsync => f.write_str("rsync"),
            SeriesType::Bsdiff => f.write_str("bsdiff"),
        }
    }
}

/// Opens the series of one file of the new container.
///
/// `kind` stays a raw tag on the wire so unknown series types surface as
/// [`Error::UnsupportedSeriesType`] rather than a decode failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncHeader {
    pub kind: u32,
    pub file_index: i64,
}

/// Names the old file a bsdiff series was computed against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BsdiffHeader {
    pub target_index: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOp {
    /// A run of `block_span` blocks of old file `file_index`, starting at
    /// block `block_index`.
    BlockRange {
        file_index: i64,
        block_index: i64,
        block_span: i64,
    },
    Data(Vec<u8>),
    /// Terminates a series.
    HeyYouDidIt,
}

/// One bsdiff instruction. `add == -1` terminates the triple stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Control {
    pub add: i64,
    pub copy: i64,
    pub seek: i64,
}

impl Control {
    pub const SENTINEL: Control = Control {
        add: -1,
        copy: 0,
        seek: 0,
    };

    pub fn is_sentinel(&self) -> bool {
        self.add == -1
    }
}

/// Size of block `block_index` of a file of `file_size` bytes: `BLOCK_SIZE`
/// for every block but the last, the remainder for the last, 0 past the end.
pub fn compute_block_size(file_size: u64, block_index: u64) -> u64 {
    file_size
        .saturating_sub(block_index.saturating_mul(BLOCK_SIZE))
        .min(BLOCK_SIZE)
}

/// Number of blocks needed to cover `file_size` bytes.
pub fn block_count(file_size: u64) -> u64 {
    file_size.div_ceil(BLOCK_SIZE)
}

/// Byte length covered by a block range over a file of `file_size` bytes.
pub fn block_range_len(file_size: u64, block_index: u64, block_span: u64) -> u64 {
    if block_span == 0 {
        return 0;
    }
    let last_index = block_index.saturating_add(block_span - 1);
    (block_span - 1)
        .saturating_mul(BLOCK_SIZE)
        .saturating_add(compute_block_size(file_size, last_index))
}
