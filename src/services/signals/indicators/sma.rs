//! Simple Moving Average (SMA).

/// Average of the last `period` values, or `None` if there are fewer.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }

    Some(values.iter().rev().take(period).sum::<f64>() / period as f64)
}

/// Rolling SMA aligned to the end of `values`.
///
/// The result has `values.len() - period + 1` points; empty when there is not
/// enough data for a single window.
pub fn sma_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    values
        .windows(period)
        .map(|w| w.iter().sum::<f64>() / period as f64)
        .collect()
}
