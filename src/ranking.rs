//! Stable ranking of a numeric slice.
//!
//! The boundary-clipping walk orders candidate axes by the steepness of the
//! search direction; ties keep their original order so the walk is
//! deterministic.

/// Indices of `values` ordered from largest to smallest value, stable on ties.
pub fn rank_descending(values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));
    order
}

/// Indices ordered from smallest to largest value, stable on ties.
pub fn rank_ascending(values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descending_orders_by_value() {
        assert_eq!(rank_descending(&[0.5, 2.0, -1.0, 1.5]), vec![1, 3, 0, 2]);
    }

    #[test]
    fn ascending_is_the_reverse_ordering() {
        assert_eq!(rank_ascending(&[0.5, 2.0, -1.0, 1.5]), vec![2, 0, 3, 1]);
    }

    #[test]
    fn ties_are_stable() {
        assert_eq!(rank_descending(&[1.0, 1.0, 1.0]), vec![0, 1, 2]);
        assert_eq!(rank_ascending(&[2.0, 2.0, 0.0]), vec![2, 0, 1]);
    }

    #[test]
    fn empty_input_yields_empty_ranking() {
        assert!(rank_descending(&[]).is_empty());
    }
}
