//! Height range helpers.
//!
//! Converts a sorted list of already imported heights into the minimal set of
//! closed intervals, used when logging which parts of a batch are skipped.

/// A closed interval of block heights, `start..=end`.
pub type HeightRange = (u64, u64);

/// Collapse a sorted, de-duplicated list of heights into contiguous ranges.
///
/// `[1, 2, 3, 5, 6, 8]` becomes `[(1, 3), (5, 6), (8, 8)]`.
pub fn sorted_to_ranges(heights: &[u64]) -> Vec<HeightRange> {
    let mut ranges = Vec::new();
    let Some((&first, rest)) = heights.split_first() else {
        return ranges;
    };

    let mut start = first;
    let mut previous = first;
    for &current in rest {
        if current != previous + 1 {
            ranges.push((start, previous));
            start = current;
        }
        previous = current;
    }
    ranges.push((start, previous));
    ranges
}

/// Number of heights covered by a set of ranges.
pub fn covered_heights(ranges: &[HeightRange]) -> u64 {
    ranges.iter().map(|(start, end)| end - start + 1).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input() {
        assert!(sorted_to_ranges(&[]).is_empty());
    }

    #[test]
    fn single_height() {
        assert_eq!(sorted_to_ranges(&[5]), vec![(5, 5)]);
    }

    #[test]
    fn mixed_ranges() {
        assert_eq!(
            sorted_to_ranges(&[1, 2, 3, 5, 6, 8]),
            vec![(1, 3), (5, 6), (8, 8)]
        );
    }

    #[test]
    fn fully_contiguous() {
        assert_eq!(sorted_to_ranges(&[1, 2, 3]), vec![(1, 3)]);
    }

    #[test]
    fn ranges_reconstruct_input() {
        let input: Vec<u64> = vec![0, 1, 4, 9, 10, 11, 12, 40, 42];
        let ranges = sorted_to_ranges(&input);
        let rebuilt: Vec<u64> = ranges.iter().flat_map(|&(s, e)| s..=e).collect();
        assert_eq!(rebuilt, input);
        assert_eq!(covered_heights(&ranges), input.len() as u64);
    }
}
