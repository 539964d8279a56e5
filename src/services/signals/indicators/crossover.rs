//! Moving-average crossover detection.

use crate::types::{CrossDirection, CrossoverResult};

/// Compare the sign of `fast - slow` at the last two points of each series.
///
/// Series are aligned at their ends, so they may differ in length. A move
/// from `<= 0` to `> 0` is a golden cross; from `>= 0` to `< 0` a dead cross.
/// Fewer than two points in either series never reports a crossover.
pub fn crossover(fast: &[f64], slow: &[f64]) -> CrossoverResult {
    let direction = detect(fast, slow);

    CrossoverResult {
        occurred: direction.is_some(),
        direction,
        fast_series: fast.to_vec(),
        slow_series: slow.to_vec(),
    }
}

fn detect(fast: &[f64], slow: &[f64]) -> Option<CrossDirection> {
    if fast.len() < 2 || slow.len() < 2 {
        return None;
    }

    let prev = fast[fast.len() - 2] - slow[slow.len() - 2];
    let curr = fast[fast.len() - 1] - slow[slow.len() - 1];

    if prev <= 0.0 && curr > 0.0 {
        Some(CrossDirection::Golden)
    } else if prev >= 0.0 && curr < 0.0 {
        Some(CrossDirection::Dead)
    } else {
        None
    }
}

/// Directions of crossovers ending at each of the last `lookback` points.
///
/// Used by screening for "golden cross in the last N sessions".
pub fn recent_crossovers(fast: &[f64], slow: &[f64], lookback: usize) -> Vec<CrossDirection> {
    let len = fast.len().min(slow.len());
    let fast = &fast[fast.len() - len..];
    let slow = &slow[slow.len() - len..];

    (2..=len)
        .rev()
        .take(lookback)
        .filter_map(|end| detect(&fast[..end], &slow[..end]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_golden_cross() {
        let result = crossover(&[1.0, 2.0, 3.0], &[2.0, 2.0, 2.0]);
        assert!(result.occurred);
        assert_eq!(result.direction, Some(CrossDirection::Golden));
    }

    #[test]
    fn test_golden_cross_from_touch() {
        let result = crossover(&[2.0, 3.0], &[2.0, 2.0]);
        assert_eq!(result.direction, Some(CrossDirection::Golden));
    }

    #[test]
    fn test_dead_cross() {
        let result = crossover(&[3.0, 2.0, 1.0], &[2.0, 2.0, 2.0]);
        assert_eq!(result.direction, Some(CrossDirection::Dead));
    }

    #[test]
    fn test_no_cross_while_above() {
        let result = crossover(&[3.0, 4.0], &[2.0, 2.0]);
        assert!(!result.occurred);
        assert_eq!(result.direction, None);
    }

    #[test]
    fn test_equal_at_end_is_not_a_cross() {
        assert!(!crossover(&[1.0, 2.0], &[2.0, 2.0]).occurred);
    }

    #[test]
    fn test_short_series() {
        assert!(!crossover(&[1.0], &[0.0, 2.0]).occurred);
        assert!(!crossover(&[], &[]).occurred);
    }

    #[test]
    fn test_series_aligned_at_end() {
        // fast has extra leading history; only the last two points matter
        let result = crossover(&[9.0, 9.0, 1.0, 3.0], &[2.0, 2.0]);
        assert_eq!(result.direction, Some(CrossDirection::Golden));
        assert_eq!(result.fast_series.len(), 4);
    }

    #[test]
    fn test_recent_crossovers() {
        let fast = [1.0, 3.0, 3.0, 1.0, 1.0];
        let slow = [2.0, 2.0, 2.0, 2.0, 2.0];
        // golden at index 1, dead at index 3
        assert_eq!(recent_crossovers(&fast, &slow, 2), vec![CrossDirection::Dead]);
        assert_eq!(
            recent_crossovers(&fast, &slow, 4),
            vec![CrossDirection::Dead, CrossDirection::Golden]
        );
    }
}
