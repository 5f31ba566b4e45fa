use crate::suffix_array::SuffixArray;

/// Number of leading bytes `a` and `b` have in common.
#[inline]
pub fn match_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Find the suffix of `old` sharing the longest prefix with `needle`.
///
/// Binary-searches `sa` for the insertion point of `needle`, then compares
/// the two neighbouring suffixes. Returns `(offset, length)`; equal lengths
/// resolve to the lower-ranked suffix. `length` is 0 when nothing matches.
pub fn search(sa: &SuffixArray, old: &[u8], needle: &[u8]) -> (usize, usize) {
    let offsets = sa.as_slice();
    let mut lo = 0;
    let mut hi = offsets.len() - 1;

    while hi - lo >= 2 {
        let mid = lo + (hi - lo) / 2;
        if &old[offsets[mid]..] < needle {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    let x = match_len(&old[offsets[lo]..], needle);
    let y = match_len(&old[offsets[hi]..], needle);
    if x >= y {
        (offsets[lo], x)
    } else {
        (offsets[hi], y)
    }
}
