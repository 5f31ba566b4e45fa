use std::io::Write;

use crate::error::Result;
use crate::patch_format::Control;
use crate::search::search;
use crate::suffix_array::SuffixArray;
use crate::wire::WireWriter;

/// A fresh match must beat the running old-match score by more than this
/// many bytes before the scan gives up on the previous alignment.
const MATCH_SLACK: isize = 8;

/// Totals for one diff, mostly useful for logging and analysis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    /// Control triples written, sentinel excluded.
    pub controls: usize,
    /// Bytes reconstructed from old data plus add-data.
    pub add_bytes: u64,
    /// Bytes taken verbatim from extra-data.
    pub copy_bytes: u64,
    /// Non-zero bytes of add-data (positions that differ from old).
    pub changed_bytes: u64,
}

/// Compute the bsdiff delta from `old` to `new` and write it to `wire`:
/// one [`Control`] message per triple, the sentinel triple, then the
/// add-data block and the extra-data block.
pub fn diff<W: Write>(old: &[u8], new: &[u8], wire: &mut WireWriter<W>) -> Result<DiffStats> {
    let sa = SuffixArray::build(old);
    let mut scanner = Scanner::new(old, new, &sa);
    let mut add_data: Vec<u8> = Vec::new();
    let mut extra_data: Vec<u8> = Vec::new();
    let mut stats = DiffStats::default();

    while !scanner.done() {
        if !scanner.advance() {
            continue;
        }
        let forward = scanner.forward_extension();
        let backward = scanner.backward_extension();
        let (forward, backward) = scanner.resolve_overlap(forward, backward);
        let control = scanner.control(forward, backward);

        let diff_start = add_data.len();
        scanner.push_diff(forward, &mut add_data);
        stats.changed_bytes += add_data[diff_start..].iter().filter(|&&b| b != 0).count() as u64;
        extra_data.extend_from_slice(scanner.extra(forward, backward));

        wire.write_message(&control)?;
        stats.controls += 1;
        stats.add_bytes += control.add as u64;
        stats.copy_bytes += control.copy as u64;

        scanner.commit(backward);
    }

    wire.write_message(&Control::SENTINEL)?;
    wire.write_message(&add_data[..])?;
    wire.write_message(&extra_data[..])?;

    Ok(stats)
}

struct Scanner<'a> {
    sa: &'a SuffixArray,
    old: &'a [u8],
    new: &'a [u8],
    scan: usize,
    len: usize,
    pos: usize,
    last_scan: usize,
    last_pos: usize,
    last_offset: isize,
}

impl<'a> Scanner<'a> {
    fn new(old: &'a [u8], new: &'a [u8], sa: &'a SuffixArray) -> Self {
        Self {
            sa,
            old,
            new,
            scan: 0,
            len: 0,
            pos: 0,
            last_scan: 0,
            last_pos: 0,
            last_offset: 0,
        }
    }

    fn done(&self) -> bool {
        self.scan >= self.new.len()
    }

    /// Does the previous alignment predict `new[at]`?
    #[inline]
    fn old_agrees(&self, at: usize) -> bool {
        at.checked_add_signed(self.last_offset)
            .and_then(|o| self.old.get(o))
            .is_some_and(|&b| b == self.new[at])
    }

    /// Move `scan` to the next anchor match. Returns false when the
    /// previous alignment still explains the found match, in which case
    /// no triple is emitted for this round.
    fn advance(&mut self) -> bool {
        let mut old_score = 0isize;
        self.scan += self.len;
        let mut scored = self.scan;

        while self.scan < self.new.len() {
            (self.pos, self.len) = search(self.sa, self.old, &self.new[self.scan..]);

            while scored < self.scan + self.len {
                if self.old_agrees(scored) {
                    old_score += 1;
                }
                scored += 1;
            }

            let len = self.len as isize;
            if (len == old_score && len != 0) || len > old_score + MATCH_SLACK {
                break;
            }

            if self.old_agrees(self.scan) {
                old_score -= 1;
            }
            self.scan += 1;
        }

        self.len as isize != old_score || self.scan == self.new.len()
    }

    /// Length of the add region grown forward from the previous match,
    /// maximizing `2 * matches - length`.
    fn forward_extension(&self) -> usize {
        let mut matches = 0isize;
        let mut best = 0isize;
        let mut forward = 0usize;
        let mut i = 0usize;

        while self.last_scan + i < self.scan && self.last_pos + i < self.old.len() {
            if self.old[self.last_pos + i] == self.new[self.last_scan + i] {
                matches += 1;
            }
            i += 1;
            if matches * 2 - i as isize > best * 2 - forward as isize {
                best = matches;
                forward = i;
            }
        }
        forward
    }

    /// Length of the region grown backward from the new anchor match.
    fn backward_extension(&self) -> usize {
        if self.scan >= self.new.len() {
            return 0;
        }
        let mut matches = 0isize;
        let mut best = 0isize;
        let mut backward = 0usize;
        let mut i = 1usize;

        while self.scan >= self.last_scan + i && self.pos >= i {
            if self.old[self.pos - i] == self.new[self.scan - i] {
                matches += 1;
            }
            if matches * 2 - i as isize > best * 2 - backward as isize {
                best = matches;
                backward = i;
            }
            i += 1;
        }
        backward
    }

    /// When both extensions claim the same bytes, split the overlap where
    /// forward matches minus backward matches peaks.
    fn resolve_overlap(&self, forward: usize, backward: usize) -> (usize, usize) {
        if self.last_scan + forward <= self.scan - backward {
            return (forward, backward);
        }
        let overlap = (self.last_scan + forward) - (self.scan - backward);
        let mut score = 0isize;
        let mut best = 0isize;
        let mut keep = 0usize;

        for i in 0..overlap {
            let f = self.last_scan + forward - overlap + i;
            if self.new[f] == self.old[self.last_pos + forward - overlap + i] {
                score += 1;
            }
            if self.new[self.scan - backward + i] == self.old[self.pos - backward + i] {
                score -= 1;
            }
            if score > best {
                best = score;
                keep = i + 1;
            }
        }

        (forward + keep - overlap, backward - keep)
    }

    fn control(&self, forward: usize, backward: usize) -> Control {
        let copy = (self.scan - backward) - (self.last_scan + forward);
        // Nothing consumes the old cursor after the final triple.
        let seek = if self.scan >= self.new.len() {
            0
        } else {
            (self.pos - backward) as i64 - (self.last_pos + forward) as i64
        };
        Control {
            add: forward as i64,
            copy: copy as i64,
            seek,
        }
    }

    fn push_diff(&self, forward: usize, out: &mut Vec<u8>) {
        let new = &self.new[self.last_scan..self.last_scan + forward];
        let old = &self.old[self.last_pos..self.last_pos + forward];
        out.extend(new.iter().zip(old).map(|(n, o)| n.wrapping_sub(*o)));
    }

    fn extra(&self, forward: usize, backward: usize) -> &'a [u8] {
        &self.new[self.last_scan + forward..self.scan - backward]
    }

    fn commit(&mut self, backward: usize) {
        self.last_scan = self.scan - backward;
        self.last_pos = self.pos - backward;
        self.last_offset = self.pos as isize - self.scan as isize;
    }
}
