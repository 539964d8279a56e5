//! Technical indicator implementations.
//!
//! Every function here is pure: same input, same output, no I/O.

pub mod crossover;
pub mod ema;
pub mod rsi;
pub mod sma;
pub mod volume;

pub use crossover::{crossover, recent_crossovers};
pub use ema::{ema, ema_series};
pub use rsi::{rsi, rsi_value, rsi_with_bounds};
pub use sma::{sma, sma_series};
pub use volume::{spiked_within, volume_spike};

use crate::config::{IndicatorConfig, MovingAverageKind};
use crate::types::{CrossoverResult, IndicatorResult, Reading, RsiResult, VolumeSpike};

/// Rolling moving average of the configured kind.
pub fn moving_average_series(values: &[f64], period: usize, kind: MovingAverageKind) -> Vec<f64> {
    match kind {
        MovingAverageKind::Simple => sma_series(values, period),
        MovingAverageKind::Exponential => ema_series(values, period),
    }
}

/// All indicators the detector tracks, computed over one close/volume history.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorSet {
    pub rsi: Reading<RsiResult>,
    pub crossover: CrossoverResult,
    pub volume: VolumeSpike,
}

impl IndicatorSet {
    /// Compute RSI, fast/slow crossover and a volume spike of the last session
    /// against the `volume_window` sessions before it.
    pub fn compute(closes: &[f64], volumes: &[f64], config: &IndicatorConfig) -> Self {
        let rsi = rsi_with_bounds(
            closes,
            config.rsi_period,
            config.rsi_overbought,
            config.rsi_oversold,
        );

        let fast = moving_average_series(closes, config.fast_window, config.moving_average);
        let slow = moving_average_series(closes, config.slow_window, config.moving_average);
        let crossover = crossover(&fast, &slow);

        let volume = match volumes.split_last() {
            Some((current, history)) => {
                let start = history.len().saturating_sub(config.volume_window);
                volume_spike(*current, &history[start..], config.volume_spike_multiplier)
            }
            None => volume_spike(0.0, &[], config.volume_spike_multiplier),
        };

        Self {
            rsi,
            crossover,
            volume,
        }
    }

    /// The set as tagged results, for consumers that handle each kind.
    pub fn results(&self) -> Vec<IndicatorResult> {
        vec![
            IndicatorResult::Rsi(self.rsi.clone()),
            IndicatorResult::Crossover(self.crossover.clone()),
            IndicatorResult::VolumeSpike(self.volume),
        ]
    }
}
