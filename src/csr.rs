//! Compressed-sparse-row helpers shared by the candidate list and the
//! particle container.
//!
//! A CSR structure over `n` keys is an `offsets` array of length `n + 1`
//! together with a flat payload; key `k` owns the half-open payload range
//! `offsets[k]..offsets[k + 1]`.

use std::ops::Range;

use crate::error::IndexError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_counts() {
        assert_eq!(offsets_from_counts(&[2, 0, 3]), vec![0, 2, 2, 5]);
        assert_eq!(offsets_from_counts(&[]), vec![0]);
    }

    #[test]
    fn reject_decreasing_offsets() {
        assert_eq!(validate_offsets(&[0, 2, 2, 5]), Ok(()));
        assert_eq!(
            validate_offsets(&[0, 3, 2]),
            Err(IndexError::NonMonotonicOffsets { position: 1 })
        );
        assert_eq!(validate_offsets(&[1, 3]), Err(IndexError::NonZeroStart(1)));
    }

    #[test]
    fn group_particles_by_element() {
        let elems = [Some(2), Some(0), None, Some(2), Some(1)];
        let (offsets, members) = group_by_key(3, &elems);
        assert_eq!(offsets, vec![0, 1, 2, 4]);
        assert_eq!(members, vec![1, 4, 0, 3]);
        assert_eq!(range(&offsets, 2), 2..4);
    }
}

/// Exclusive prefix sum of per-key counts.
pub fn offsets_from_counts(counts: &[usize]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(counts.len() + 1);
    let mut total = 0;
    offsets.push(total);
    for &count in counts {
        total += count;
        offsets.push(total);
    }
    offsets
}

/// Checks that offsets start at zero and never decrease.
pub fn validate_offsets(offsets: &[usize]) -> Result<(), IndexError> {
    match offsets.first() {
        Some(&first) if first != 0 => return Err(IndexError::NonZeroStart(first)),
        _ => {}
    }
    match offsets.windows(2).position(|w| w[1] < w[0]) {
        Some(position) => Err(IndexError::NonMonotonicOffsets { position }),
        None => Ok(()),
    }
}

/// Payload range owned by `key`.
#[inline]
pub fn range(offsets: &[usize], key: usize) -> Range<usize> {
    offsets[key]..offsets[key + 1]
}

/// Groups item indices by key.
///
/// Returns the offsets over `num_keys` keys and the item indices ordered by
/// key, stable within a key. Items with `None` are left out.
pub fn group_by_key(num_keys: usize, keys: &[Option<usize>]) -> (Vec<usize>, Vec<usize>) {
    let mut counts = vec![0; num_keys];
    for key in keys.iter().flatten() {
        counts[*key] += 1;
    }
    let offsets = offsets_from_counts(&counts);
    let mut cursor = offsets.clone();
    let mut members = vec![0; offsets[num_keys]];
    for (item, key) in keys.iter().enumerate() {
        if let Some(key) = key {
            members[cursor[*key]] = item;
            cursor[*key] += 1;
        }
    }
    (offsets, members)
}
