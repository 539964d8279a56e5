//! Relative Strength Index (RSI) indicator.

use crate::types::{Reading, RsiResult, RsiState};

/// Default overbought bound.
pub const OVERBOUGHT: f64 = 70.0;
/// Default oversold bound.
pub const OVERSOLD: f64 = 30.0;

/// RSI with Wilder smoothing over `period` intervals and the default 70/30 bounds.
///
/// Measures momentum by comparing the magnitude of recent gains to recent losses.
/// Values range from 0-100:
/// - 30 or below: Oversold
/// - 70 or above: Overbought
pub fn rsi(closes: &[f64], period: usize) -> Reading<RsiResult> {
    rsi_with_bounds(closes, period, OVERBOUGHT, OVERSOLD)
}

/// RSI classified against custom bounds.
pub fn rsi_with_bounds(
    closes: &[f64],
    period: usize,
    overbought: f64,
    oversold: f64,
) -> Reading<RsiResult> {
    match rsi_value(closes, period) {
        Some(value) => Reading::Value(RsiResult {
            value,
            state: RsiState::classify(value, overbought, oversold),
        }),
        None => Reading::InsufficientData {
            needed: period + 1,
            available: closes.len(),
        },
    }
}

/// Raw RSI value, or `None` with fewer than `period + 1` points.
pub fn rsi_value(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let mut gains = Vec::with_capacity(closes.len() - 1);
    let mut losses = Vec::with_capacity(closes.len() - 1);

    for pair in closes.windows(2) {
        let change = pair[1] - pair[0];
        if change > 0.0 {
            gains.push(change);
            losses.push(0.0);
        } else {
            gains.push(0.0);
            losses.push(-change);
        }
    }

    // Seed with simple averages over the first period
    let mut avg_gain: f64 = gains.iter().take(period).sum::<f64>() / period as f64;
    let mut avg_loss: f64 = losses.iter().take(period).sum::<f64>() / period as f64;

    // Wilder smoothing for the remainder
    for i in period..gains.len() {
        avg_gain = (avg_gain * (period - 1) as f64 + gains[i]) / period as f64;
        avg_loss = (avg_loss * (period - 1) as f64 + losses[i]) / period as f64;
    }

    if avg_loss == 0.0 {
        // Flat series has no momentum either way
        if avg_gain == 0.0 {
            return Some(50.0);
        }
        return Some(100.0);
    }

    let rs = avg_gain / avg_loss;
    Some(100.0 - (100.0 / (1.0 + rs)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rising(count: usize) -> Vec<f64> {
        (0..count).map(|i| 100.0 + i as f64 * 1.5).collect()
    }

    fn falling(count: usize) -> Vec<f64> {
        (0..count).map(|i| 200.0 - i as f64 * 1.5).collect()
    }

    #[test]
    fn test_rsi_insufficient_data() {
        let result = rsi(&rising(14), 14);
        assert_eq!(
            result,
            Reading::InsufficientData {
                needed: 15,
                available: 14
            }
        );
        assert!(result.value().is_none());
    }

    #[test]
    fn test_rsi_minimum_length_is_enough() {
        assert!(rsi(&rising(15), 14).is_ready());
    }

    #[test]
    fn test_rsi_rising_series_is_overbought() {
        let result = rsi(&rising(50), 14).into_value().unwrap();
        assert_eq!(result.value, 100.0);
        assert_eq!(result.state, RsiState::Overbought);
    }

    #[test]
    fn test_rsi_falling_series_is_oversold() {
        let result = rsi(&falling(50), 14).into_value().unwrap();
        assert_eq!(result.value, 0.0);
        assert_eq!(result.state, RsiState::Oversold);
    }

    #[test]
    fn test_rsi_flat_series_is_neutral() {
        let result = rsi(&[10.0; 30], 14).into_value().unwrap();
        assert_eq!(result.value, 50.0);
        assert_eq!(result.state, RsiState::Neutral);
    }

    #[test]
    fn test_rsi_value_range() {
        let closes: Vec<f64> = (0..60)
            .map(|i| 100.0 + ((i as f64) * 0.7).sin() * 5.0)
            .collect();
        let value = rsi_value(&closes, 14).unwrap();
        assert!((0.0..=100.0).contains(&value));
    }

    #[test]
    fn test_rsi_bounds_are_inclusive() {
        assert_eq!(RsiState::classify(70.0, 70.0, 30.0), RsiState::Overbought);
        assert_eq!(RsiState::classify(30.0, 70.0, 30.0), RsiState::Oversold);
        assert_eq!(RsiState::classify(69.99, 70.0, 30.0), RsiState::Neutral);
    }

    #[test]
    fn test_rsi_zero_period() {
        assert!(!rsi(&rising(20), 0).is_ready());
    }

    #[test]
    fn test_rsi_custom_period() {
        assert!(rsi(&rising(8), 7).is_ready());
        assert!(!rsi(&rising(7), 7).is_ready());
    }
}
