//! Indicator engine properties against literal fixtures

use tickwatch::config::{IndicatorConfig, MovingAverageKind};
use tickwatch::services::signals::indicators::{
    crossover, ema_series, moving_average_series, rsi, sma_series, volume_spike,
};
use tickwatch::services::signals::IndicatorSet;
use tickwatch::types::{CrossDirection, IndicatorResult, Reading, RsiState};

fn rising(n: usize) -> Vec<f64> {
    (0..n).map(|i| 100.0 + i as f64).collect()
}

fn falling(n: usize) -> Vec<f64> {
    (0..n).map(|i| 200.0 - i as f64).collect()
}

// =========================================================================
// RSI
// =========================================================================

#[test]
fn test_rsi_rising_series_goes_to_100() {
    let result = rsi(&rising(40), 14);
    let value = result.value().unwrap();
    assert!(value.value > 99.0);
    assert_eq!(value.state, RsiState::Overbought);
}

#[test]
fn test_rsi_falling_series_goes_to_0() {
    let result = rsi(&falling(40), 14);
    let value = result.value().unwrap();
    assert!(value.value < 1.0);
    assert_eq!(value.state, RsiState::Oversold);
}

#[test]
fn test_rsi_needs_period_plus_one_points() {
    match rsi(&rising(14), 14) {
        Reading::InsufficientData { needed, available } => {
            assert_eq!(needed, 15);
            assert_eq!(available, 14);
        }
        Reading::Value(v) => panic!("expected insufficient data, got {:?}", v),
    }
    assert!(rsi(&rising(15), 14).is_ready());
}

#[test]
fn test_rsi_flat_series_is_neutral() {
    let value = rsi(&[50.0; 30], 14).into_value().unwrap();
    assert_eq!(value.value, 50.0);
    assert_eq!(value.state, RsiState::Neutral);
}

#[test]
fn test_rsi_stays_in_bounds() {
    let noisy: Vec<f64> = (0..60)
        .map(|i| 100.0 + ((i * 37) % 11) as f64 - 5.0)
        .collect();
    let value = rsi(&noisy, 14).into_value().unwrap().value;
    assert!((0.0..=100.0).contains(&value));
}

// =========================================================================
// Moving Averages
// =========================================================================

#[test]
fn test_sma_and_ema_definitions() {
    let values = [2.0, 4.0, 6.0, 8.0];
    assert_eq!(sma_series(&values, 2), vec![3.0, 5.0, 7.0]);

    // Seed 3.0, then k = 2/3
    let ema = ema_series(&values, 2);
    assert_eq!(ema.len(), 3);
    assert!((ema[1] - (6.0 * (2.0 / 3.0) + 3.0 * (1.0 / 3.0))).abs() < 1e-9);

    assert_eq!(
        moving_average_series(&values, 2, MovingAverageKind::Simple),
        sma_series(&values, 2)
    );
}

// =========================================================================
// Crossover
// =========================================================================

#[test]
fn test_crossover_fixture_is_golden() {
    let result = crossover(&[1.0, 2.0, 3.0], &[2.0, 2.0, 2.0]);
    assert!(result.occurred);
    assert_eq!(result.direction, Some(CrossDirection::Golden));
    assert_eq!(result.fast_series, vec![1.0, 2.0, 3.0]);
}

#[test]
fn test_crossover_needs_two_points() {
    assert!(!crossover(&[3.0], &[2.0]).occurred);
    assert!(!crossover(&[1.0, 3.0], &[2.0]).occurred);
}

// =========================================================================
// Volume Spike
// =========================================================================

#[test]
fn test_volume_spike_fixtures() {
    let recent = [100.0, 100.0, 100.0, 100.0];

    let spike = volume_spike(250.0, &recent, 2.0);
    assert_eq!(spike.ratio, 2.5);
    assert!(spike.is_spike);

    assert!(!volume_spike(150.0, &recent, 2.0).is_spike);

    let empty = volume_spike(150.0, &[], 2.0);
    assert_eq!(empty.ratio, 0.0);
    assert!(!empty.is_spike);
}

// =========================================================================
// Indicator Set
// =========================================================================

#[test]
fn test_indicator_set_is_deterministic() {
    let closes = rising(30);
    let volumes = vec![1_000.0; 30];
    let config = IndicatorConfig::default();

    let a = IndicatorSet::compute(&closes, &volumes, &config);
    let b = IndicatorSet::compute(&closes, &volumes, &config);
    assert_eq!(a, b);

    let kinds: Vec<&str> = a
        .results()
        .iter()
        .map(|r| match r {
            IndicatorResult::Rsi(_) => "rsi",
            IndicatorResult::Crossover(_) => "crossover",
            IndicatorResult::VolumeSpike(_) => "volume",
        })
        .collect();
    assert_eq!(kinds, vec!["rsi", "crossover", "volume"]);
}
