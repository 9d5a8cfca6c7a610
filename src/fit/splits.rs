//! Walk-forward (expanding window) cross-validation splits.

use std::ops::Range;

use crate::error::AppError;

/// One train/test partition of the day axis. The test range always starts
/// where the training range ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub train: Range<usize>,
    pub test: Range<usize>,
}

impl Fold {
    /// Days a simulation must cover to score this fold.
    pub fn days(&self) -> usize {
        self.test.end
    }
}

/// Reject split counts that cannot hold out any point.
pub fn check_splits(splits: &[usize]) -> Result<(), AppError> {
    match splits.iter().find(|k| **k <= 1) {
        Some(k) => Err(AppError::SplitTooSmall(*k)),
        None => Ok(()),
    }
}

/// `k` expanding-window folds over `n` samples.
///
/// Each test segment has `n / (k + 1)` samples; the first starts at
/// `n - k * test_size` and the rest follow back to back. Training is
/// everything before the test segment.
pub fn time_series_split(n: usize, k: usize) -> Result<Vec<Fold>, AppError> {
    check_splits(&[k])?;
    if n < k + 1 {
        return Err(AppError::invalid(format!(
            "Cannot split {n} days into {k} folds (need at least {}).",
            k + 1
        )));
    }
    let test_size = n / (k + 1);
    let first = n - k * test_size;
    Ok((0..k)
        .map(|i| {
            let start = first + i * test_size;
            Fold {
                train: 0..start,
                test: start..start + test_size,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_walk_forward_without_overlap() {
        let folds = time_series_split(20, 3).unwrap();
        assert_eq!(folds.len(), 3);
        assert_eq!(folds[0], Fold { train: 0..5, test: 5..10 });
        assert_eq!(folds[2], Fold { train: 0..15, test: 15..20 });
        for f in &folds {
            assert_eq!(f.train.end, f.test.start);
            assert_eq!(f.days(), f.test.end);
        }
    }

    #[test]
    fn remainder_goes_to_the_first_training_window() {
        let folds = time_series_split(23, 5).unwrap();
        assert_eq!(folds[0].train, 0..8);
        assert_eq!(folds.last().unwrap().test, 20..23);
    }

    #[test]
    fn splits_below_two_are_rejected() {
        assert!(matches!(time_series_split(20, 1), Err(AppError::SplitTooSmall(1))));
        assert!(matches!(check_splits(&[5, 0, 3]), Err(AppError::SplitTooSmall(0))));
        assert!(check_splits(&[5, 3]).is_ok());
        assert!(time_series_split(3, 3).is_err());
    }
}
