//! Exponential Moving Average (EMA).
//!
//! Smoothing factor is `2 / (period + 1)`, seeded with the SMA of the first
//! `period` values.

/// Final EMA value, or `None` with fewer than `period` values.
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    ema_series(values, period).last().copied()
}

/// EMA at every point from index `period - 1` onward.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period as f64 + 1.0);

    // First EMA is SMA
    let seed: f64 = values.iter().take(period).sum::<f64>() / period as f64;

    let mut series = Vec::with_capacity(values.len() - period + 1);
    series.push(seed);

    let mut current = seed;
    for value in values.iter().skip(period) {
        current = (value - current) * multiplier + current;
        series.push(current);
    }

    series
}
