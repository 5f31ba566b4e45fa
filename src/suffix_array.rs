//! Larsson–Sadakane suffix sorting ("Faster Suffix Sorting").
//!
//! During construction two parallel arrays are kept:
//!
//! * `sorted[i]`: a suffix offset, or, when negative, a run of `-value`
//!   consecutive entries that are already in their final order.
//! * `rank[p]`: the current bucket of the suffix starting at `p`, namely
//!   the index of the last entry of its group in `sorted`.
//!
//! Each pass doubles the compared prefix length `h` and refines the groups
//! that are still tied by the rank of the suffix `h` bytes further on.

/// Sorted offsets of every suffix of a buffer, including the empty suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuffixArray {
    offsets: Vec<usize>,
}

impl SuffixArray {
    /// Sort all suffixes of `old`. The result has `old.len() + 1` entries.
    pub fn build(old: &[u8]) -> Self {
        let n = old.len();
        let len = n + 1;
        let mut sorted = vec![0isize; len];
        let mut rank = vec![0isize; len];

        // Bucket by first byte. buckets[c] ends up as the index of the last
        // entry of bucket c (the empty suffix occupies index 0).
        let mut buckets = [0usize; 256];
        for &c in old {
            buckets[c as usize] += 1;
        }
        for c in 1..256 {
            buckets[c] += buckets[c - 1];
        }
        for c in (1..256).rev() {
            buckets[c] = buckets[c - 1];
        }
        buckets[0] = 0;

        for (p, &c) in old.iter().enumerate() {
            buckets[c as usize] += 1;
            sorted[buckets[c as usize]] = p as isize;
        }
        sorted[0] = n as isize;
        for (p, &c) in old.iter().enumerate() {
            rank[p] = buckets[c as usize] as isize;
        }
        rank[n] = 0;
        for c in 1..256 {
            if buckets[c] == buckets[c - 1] + 1 {
                sorted[buckets[c]] = -1;
            }
        }
        sorted[0] = -1;

        let mut h = 1usize;
        while sorted[0] != -(len as isize) {
            let mut run = 0usize;
            let mut i = 0usize;
            while i < len {
                if sorted[i] < 0 {
                    let done = (-sorted[i]) as usize;
                    run += done;
                    i += done;
                } else {
                    if run != 0 {
                        sorted[i - run] = -(run as isize);
                    }
                    let group = (rank[sorted[i] as usize] + 1) as usize - i;
                    split(&mut sorted, &mut rank, i, group, h);
                    i += group;
                    run = 0;
                }
            }
            if run != 0 {
                sorted[i - run] = -(run as isize);
            }
            h += h;
        }

        let mut offsets = vec![0usize; len];
        for (p, &r) in rank.iter().enumerate() {
            offsets[r as usize] = p;
        }
        Self { offsets }
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.offsets
    }
}

enum Task {
    Split { start: usize, len: usize },
    /// Assign the "equal to pivot" partition `[lo, hi)` its final rank.
    Settle { lo: usize, hi: usize },
}

#[inline]
fn key(sorted: &[isize], rank: &[isize], at: usize, h: usize) -> isize {
    rank[sorted[at] as usize + h]
}

/// Ternary-split quicksort of the group `sorted[start..start + len]` by the
/// rank `h` bytes ahead. Runs the recursion of the reference formulation on
/// an explicit stack so repetitive inputs cannot exhaust the call stack;
/// task order matches the recursive order (lower partition, then the pivot
/// partition, then the upper partition).
fn split(sorted: &mut [isize], rank: &mut [isize], start: usize, len: usize, h: usize) {
    let mut stack = vec![Task::Split { start, len }];

    while let Some(task) = stack.pop() {
        match task {
            Task::Settle { lo, hi } => {
                for at in lo..hi {
                    rank[sorted[at] as usize] = (hi - 1) as isize;
                }
                if lo == hi - 1 {
                    sorted[lo] = -1;
                }
            }
            Task::Split { start, len } if len < 16 => {
                select_sort(sorted, rank, start, len, h);
            }
            Task::Split { start, len } => {
                let end = start + len;
                let pivot = key(sorted, rank, start + len / 2, h);

                let mut below = 0;
                let mut equal = 0;
                for at in start..end {
                    let k = key(sorted, rank, at, h);
                    if k < pivot {
                        below += 1;
                    }
                    if k == pivot {
                        equal += 1;
                    }
                }
                let lo = start + below;
                let hi = lo + equal;

                let mut i = start;
                let mut j = 0;
                let mut k = 0;
                while i < lo {
                    let v = key(sorted, rank, i, h);
                    if v < pivot {
                        i += 1;
                    } else if v == pivot {
                        sorted.swap(i, lo + j);
                        j += 1;
                    } else {
                        sorted.swap(i, hi + k);
                        k += 1;
                    }
                }
                while lo + j < hi {
                    if key(sorted, rank, lo + j, h) == pivot {
                        j += 1;
                    } else {
                        sorted.swap(lo + j, hi + k);
                        k += 1;
                    }
                }

                if end > hi {
                    stack.push(Task::Split {
                        start: hi,
                        len: end - hi,
                    });
                }
                stack.push(Task::Settle { lo, hi });
                if lo > start {
                    stack.push(Task::Split {
                        start,
                        len: lo - start,
                    });
                }
            }
        }
    }
}

/// Small groups: repeatedly select the minimum-key entries to the front.
fn select_sort(sorted: &mut [isize], rank: &mut [isize], start: usize, len: usize, h: usize) {
    let end = start + len;
    let mut k = start;
    while k < end {
        let mut j = 1;
        let mut x = key(sorted, rank, k, h);
        let mut i = 1;
        while k + i < end {
            let v = key(sorted, rank, k + i, h);
            if v < x {
                x = v;
                j = 0;
            }
            if v == x {
                sorted.swap(k + i, k + j);
                j += 1;
            }
            i += 1;
        }
        for i in 0..j {
            rank[sorted[k + i] as usize] = (k + j - 1) as isize;
        }
        if j == 1 {
            sorted[k] = -1;
        }
        k += j;
    }
}
