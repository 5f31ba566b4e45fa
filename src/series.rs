//! Per-file series framing inside a patch stream.
//!
//! Each file of the new container gets exactly one series, in container
//! order:
//!
//! ```text
//! RSYNC : SyncHeader{RSYNC, i}  SyncOp*  HeyYouDidIt
//! BSDIFF: SyncHeader{BSDIFF, i} BsdiffHeader Control* Control{add: -1}
//!         add-data extra-data HeyYouDidIt
//! ```
//!
//! The framing carries no index, so a reader has to walk every message of
//! a series, even one it does not care about, to reach the next.

use std::io::{Read, Write};

use log::trace;

use crate::bsdiff::{self, DiffStats};
use crate::bspatch::{self, PatchBody};
use crate::compression::DecompressedReader;
use crate::container::Container;
use crate::error::{Error, Result};
use crate::patch_format::{BsdiffHeader, PatchHeader, SeriesType, SyncHeader, SyncOp, PATCH_MAGIC};
use crate::wire::{WireReader, WireWriter};

/// A patch opened up to its first series.
pub struct PatchStream<R: Read> {
    pub header: PatchHeader,
    /// Target container: the files the patch applies to.
    pub old: Container,
    /// Source container: the files the patch produces, one series each.
    pub new: Container,
    pub series: SeriesReader<DecompressedReader<R>>,
}

/// Check the magic number, read the header, switch to the (possibly
/// compressed) body and read both containers.
pub fn open_patch<R: Read>(reader: R) -> Result<PatchStream<R>> {
    let mut wire = WireReader::new(reader);
    wire.expect_magic(PATCH_MAGIC)?;
    let header: PatchHeader = wire.read_message()?;

    let body = DecompressedReader::new(wire.into_inner(), &header.compression)?;
    let mut wire = WireReader::new(body);
    let old: Container = wire.read_message()?;
    let new: Container = wire.read_message()?;
    old.validate()?;
    new.validate()?;
    let series = SeriesReader::new(wire, new.files.len());

    Ok(PatchStream {
        header,
        old,
        new,
        series,
    })
}

/// Write a complete rsync series for new file `file_index`. The terminator
/// is appended here; `ops` must not contain it.
pub fn write_rsync_series<W, I>(wire: &mut WireWriter<W>, file_index: usize, ops: I) -> Result<()>
where
    W: Write,
    I: IntoIterator<Item = SyncOp>,
{
    wire.write_message(&SyncHeader {
        kind: SeriesType::Rsync.tag(),
        file_index: file_index as i64,
    })?;
    for op in ops {
        if op == SyncOp::HeyYouDidIt {
            return Err(Error::OutOfSequence("terminator among rsync ops"));
        }
        wire.write_message(&op)?;
    }
    wire.write_message(&SyncOp::HeyYouDidIt)
}

/// Diff `old` (old file `target_index`) against `new` (new file
/// `file_index`) and write the complete bsdiff series.
pub fn write_bsdiff_series<W: Write>(
    wire: &mut WireWriter<W>,
    file_index: usize,
    target_index: usize,
    old: &[u8],
    new: &[u8],
) -> Result<DiffStats> {
    wire.write_message(&SyncHeader {
        kind: SeriesType::Bsdiff.tag(),
        file_index: file_index as i64,
    })?;
    wire.write_message(&BsdiffHeader {
        target_index: target_index as i64,
    })?;
    let stats = bsdiff::diff(old, new, wire)?;
    wire.write_message(&SyncOp::HeyYouDidIt)?;
    Ok(stats)
}

/// Header of the series currently being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesHeader {
    pub kind: SeriesType,
    pub file_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadingHeader,
    ReadingOps(SeriesType),
    /// A bsdiff header has been consumed; the triple stream follows.
    ReadingTriples,
    Done,
}

/// Sequential reader for the series section of a patch stream.
pub struct SeriesReader<R: Read> {
    wire: WireReader<R>,
    file_count: usize,
    next_index: usize,
    state: State,
}

impl<R: Read> SeriesReader<R> {
    /// `wire` must be positioned right after the two containers.
    pub fn new(wire: WireReader<R>, file_count: usize) -> Self {
        Self {
            wire,
            file_count,
            next_index: 0,
            state: State::ReadingHeader,
        }
    }

    /// Read the next series header, or `None` once every file has had its
    /// series. The declared file index must be the next one in order.
    pub fn next_series(&mut self) -> Result<Option<SeriesHeader>> {
        match self.state {
            State::ReadingHeader => {}
            State::Done => return Ok(None),
            _ => return Err(Error::OutOfSequence("previous series not fully consumed")),
        }
        if self.next_index == self.file_count {
            self.state = State::Done;
            return Ok(None);
        }

        let header: SyncHeader = self.wire.read_message()?;
        if header.file_index != self.next_index as i64 {
            return Err(Error::corrupt(format!(
                "expected series for file {}, got {}",
                self.next_index, header.file_index
            )));
        }
        let kind = SeriesType::try_from(header.kind)?;
        trace!("series {} ({kind})", self.next_index);

        self.state = State::ReadingOps(kind);
        Ok(Some(SeriesHeader {
            kind,
            file_index: self.next_index,
        }))
    }

    /// Next op of an rsync series; `None` once its terminator is read.
    pub fn next_op(&mut self) -> Result<Option<SyncOp>> {
        if self.state != State::ReadingOps(SeriesType::Rsync) {
            return Err(Error::OutOfSequence("not inside an rsync series"));
        }
        let op: SyncOp = self.wire.read_message()?;
        if op == SyncOp::HeyYouDidIt {
            self.finish_series();
            return Ok(None);
        }
        Ok(Some(op))
    }

    pub fn read_bsdiff_header(&mut self) -> Result<BsdiffHeader> {
        if self.state != State::ReadingOps(SeriesType::Bsdiff) {
            return Err(Error::OutOfSequence("not at a bsdiff header"));
        }
        let header: BsdiffHeader = self.wire.read_message()?;
        self.state = State::ReadingTriples;
        Ok(header)
    }

    /// Read the triple stream and the terminator of a bsdiff series
    /// without interpreting it.
    pub fn read_bsdiff_body(&mut self) -> Result<PatchBody> {
        if self.state != State::ReadingTriples {
            return Err(Error::OutOfSequence("bsdiff header not read"));
        }
        let body = bspatch::read_body(&mut self.wire)?;
        self.expect_terminator()?;
        Ok(body)
    }

    /// Reconstruct the new file of a bsdiff series from `old`.
    pub fn apply_bsdiff(&mut self, old: &[u8], new_size: u64) -> Result<Vec<u8>> {
        let body = self.read_bsdiff_body()?;
        bspatch::apply_body(old, &body, new_size)
    }

    /// Consume the rest of the current series without interpreting it.
    pub fn skip_series(&mut self) -> Result<()> {
        match self.state {
            State::ReadingOps(SeriesType::Rsync) => {
                while self.next_op()?.is_some() {}
            }
            State::ReadingOps(SeriesType::Bsdiff) => {
                self.read_bsdiff_header()?;
                self.read_bsdiff_body()?;
            }
            State::ReadingTriples => {
                self.read_bsdiff_body()?;
            }
            State::ReadingHeader | State::Done => {
                return Err(Error::OutOfSequence("no series to skip"));
            }
        }
        Ok(())
    }

    /// Bytes consumed from the underlying stream so far.
    pub fn bytes_read(&self) -> u64 {
        self.wire.bytes_read()
    }

    pub fn into_inner(self) -> WireReader<R> {
        self.wire
    }

    fn expect_terminator(&mut self) -> Result<()> {
        let op: SyncOp = self.wire.read_message()?;
        if op != SyncOp::HeyYouDidIt {
            return Err(Error::corrupt(format!(
                "expected HeyYouDidIt after bsdiff series {}, got {op:?}",
                self.next_index
            )));
        }
        self.finish_series();
        Ok(())
    }

    fn finish_series(&mut self) {
        self.next_index += 1;
        self.state = State::ReadingHeader;
    }
}
