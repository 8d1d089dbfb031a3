//! Sidecar indices mapping genomic intervals to byte ranges in a data file.
//!
//! Two families, matching the two data-file flavours:
//! - [`binning`] — TBI/CSI hierarchical binning index, for BGZF-compressed
//!   data (byte ranges are [`crate::bgzf::VirtualOffset`] pairs).
//! - [`tribble`] — IDX linear or interval-tree index, for plain-text data
//!   (byte ranges are plain file offsets).

pub mod binning;
pub mod tribble;

/// Merge a set of (begin, end) ranges, coalescing any two ranges whose
/// begin/end fall in the same `1 << shift`-sized window. Shared by the
/// binning index (`shift = 16`, virtual-offset block granularity) and the
/// tribble interval-tree index (`shift = 0`, exact byte granularity).
pub(crate) fn merge_ranges(mut ranges: Vec<(u64, u64)>, shift: u32) -> Vec<(u64, u64)> {
    ranges.sort_unstable();
    let mut merged = Vec::with_capacity(ranges.len());
    let mut cur: Option<(u64, u64)> = None;
    for r in ranges {
        cur = match cur {
            None => Some(r),
            Some(p) => {
                if (r.0 >> shift) > (p.1 >> shift) {
                    merged.push(p);
                    Some(r)
                } else {
                    Some((p.0, p.1.max(r.1)))
                }
            }
        };
    }
    if let Some(p) = cur {
        merged.push(p);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_disjoint_ranges_stay_separate() {
        let merged = merge_ranges(vec![(0, 10), (100_000, 100_010)], 16);
        assert_eq!(merged, vec![(0, 10), (100_000, 100_010)]);
    }

    #[test]
    fn merge_touching_ranges_within_shift_window() {
        let merged = merge_ranges(vec![(0, 10), (5, 20)], 16);
        assert_eq!(merged, vec![(0, 20)]);
    }
}
