//! Volume spike detection.

use crate::types::VolumeSpike;

/// Default multiplier over the trailing average that counts as a spike.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// `ratio = current / average(recent)`; a spike when `ratio >= multiplier`.
///
/// An empty or zero-average window yields `ratio = 0` and no spike.
pub fn volume_spike(current: f64, recent: &[f64], multiplier: f64) -> VolumeSpike {
    if recent.is_empty() {
        return VolumeSpike {
            ratio: 0.0,
            is_spike: false,
        };
    }

    let average = recent.iter().sum::<f64>() / recent.len() as f64;
    if average <= 0.0 {
        return VolumeSpike {
            ratio: 0.0,
            is_spike: false,
        };
    }

    let ratio = current / average;
    VolumeSpike {
        ratio,
        is_spike: ratio >= multiplier,
    }
}

/// Check the last `lookback` sessions of `volumes`, each against the `window`
/// sessions before it. True if any of them spiked.
pub fn spiked_within(volumes: &[f64], window: usize, lookback: usize, multiplier: f64) -> bool {
    let len = volumes.len();
    (0..lookback.min(len)).any(|back| {
        let idx = len - 1 - back;
        let start = idx.saturating_sub(window);
        volume_spike(volumes[idx], &volumes[start..idx], multiplier).is_spike
    })
}
