//! Watch-list screening: fundamentals filter, technical filter, rank by
//! market cap, truncate.

use crate::config::{IndicatorConfig, ScreeningConfig, TechnicalCondition};
use crate::error::Result;
use crate::services::collaborators::{StorageBackend, UniverseProvider};
use crate::services::price_cache::PriceCache;
use crate::services::signals::indicators::{
    moving_average_series, recent_crossovers, rsi, spiked_within,
};
use crate::types::{
    CrossDirection, FundamentalMetrics, Instrument, PriceSeries, ScreenedInstrument,
    TechnicalFlag, ValuationRatios,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// PER used to scale the valuation part of the score when no cap is set.
const REFERENCE_PER: f64 = 30.0;

pub struct ScreeningEngine {
    universe: Arc<dyn UniverseProvider>,
    storage: Arc<dyn StorageBackend>,
    cache: Arc<PriceCache>,
    config: ScreeningConfig,
    indicators: IndicatorConfig,
}

impl ScreeningEngine {
    pub fn new(
        universe: Arc<dyn UniverseProvider>,
        storage: Arc<dyn StorageBackend>,
        cache: Arc<PriceCache>,
        config: ScreeningConfig,
        indicators: IndicatorConfig,
    ) -> Self {
        Self {
            universe,
            storage,
            cache,
            config,
            indicators,
        }
    }

    /// Screen the configured market, persist the new set wholesale and
    /// return it.
    pub async fn run(&self) -> Result<Vec<ScreenedInstrument>> {
        let universe = self.universe.list_instruments(&self.config.market).await?;
        info!(
            "Screening {} instruments from {}",
            universe.len(),
            self.config.market
        );

        let mut candidates = Vec::new();
        for instrument in universe {
            if let Some(candidate) = self.evaluate(&instrument).await {
                candidates.push(candidate);
            }
        }

        let passed = candidates.len();
        let set = select(candidates, self.config.top_n);
        self.storage.replace_screened_set(&set).await?;
        info!("Screening kept {} of {} passing instruments", set.len(), passed);
        Ok(set)
    }

    /// Screen one instrument. Lookup failures drop only this instrument.
    async fn evaluate(&self, instrument: &Instrument) -> Option<ScreenedInstrument> {
        let id = &instrument.id;
        let metrics = match self.storage.read_latest_fundamentals(id).await {
            Ok(Some(metrics)) => metrics,
            Ok(None) => {
                debug!("No fundamentals for {}, skipping", id);
                return None;
            }
            Err(e) => {
                warn!("Failed to read fundamentals for {}: {}", id, e);
                return None;
            }
        };
        let valuation = match self.storage.read_valuation(id).await {
            Ok(valuation) => valuation,
            Err(e) => {
                warn!("Failed to read valuation for {}: {}", id, e);
                None
            }
        };

        if !passes_fundamentals(&metrics, valuation.as_ref(), &self.config) {
            return None;
        }

        let series = self.series_for(id).await?;
        let flags = technical_flags(&series, &self.config.technical_conditions, &self.indicators);
        if flags.is_empty() {
            return None;
        }

        Some(ScreenedInstrument {
            instrument_id: id.clone(),
            display_name: instrument.name.clone(),
            market_cap: instrument.market_cap,
            fundamental_score: fundamental_score(&metrics, valuation.as_ref(), &self.config),
            technical_flags: flags,
            rank: 0,
        })
    }

    /// Cached series when the instrument is live, otherwise stored bars.
    async fn series_for(&self, id: &str) -> Option<PriceSeries> {
        if let Some(series) = self.cache.get_series(id) {
            return Some(series);
        }
        match self.storage.read_price_history(id).await {
            Ok(bars) => Some(PriceSeries::from_bars(id, bars, usize::MAX)),
            Err(e) => {
                warn!("Failed to read price history for {}: {}", id, e);
                None
            }
        }
    }
}

/// ROE inside the configured range, debt ratio under the cap and, when a PER
/// cap is set, a positive PER under it.
pub fn passes_fundamentals(
    metrics: &FundamentalMetrics,
    valuation: Option<&ValuationRatios>,
    config: &ScreeningConfig,
) -> bool {
    if metrics.roe < config.min_roe || metrics.roe > config.max_roe {
        return false;
    }
    if metrics.debt_ratio > config.max_debt_ratio {
        return false;
    }
    match config.max_per {
        Some(max_per) => matches!(
            valuation.and_then(|v| v.per),
            Some(per) if per > 0.0 && per <= max_per
        ),
        None => true,
    }
}

/// 0..=100: ROE position in range (40), low leverage (30), cheap PER (30).
/// An unknown PER scores half.
pub fn fundamental_score(
    metrics: &FundamentalMetrics,
    valuation: Option<&ValuationRatios>,
    config: &ScreeningConfig,
) -> f64 {
    let roe_span = (config.max_roe - config.min_roe).max(f64::EPSILON);
    let roe = ((metrics.roe - config.min_roe) / roe_span).clamp(0.0, 1.0) * 40.0;

    let debt = if config.max_debt_ratio > 0.0 {
        (1.0 - metrics.debt_ratio / config.max_debt_ratio).clamp(0.0, 1.0) * 30.0
    } else {
        0.0
    };

    let reference = config.max_per.unwrap_or(REFERENCE_PER);
    let per = match valuation.and_then(|v| v.per) {
        Some(per) if per > 0.0 => (1.0 - per / reference).clamp(0.0, 1.0) * 30.0,
        Some(_) => 0.0,
        None => 15.0,
    };

    (roe + debt + per).clamp(0.0, 100.0)
}

/// Technical conditions that hold on a series, in configured order.
pub fn technical_flags(
    series: &PriceSeries,
    conditions: &[TechnicalCondition],
    indicators: &IndicatorConfig,
) -> Vec<TechnicalFlag> {
    let closes = series.closes();
    let volumes = series.volumes();
    let mut flags = Vec::new();

    for condition in conditions {
        let (flag, holds) = match *condition {
            TechnicalCondition::RsiBelow(threshold) => (
                TechnicalFlag::RsiBelowThreshold,
                rsi(&closes, indicators.rsi_period)
                    .value()
                    .is_some_and(|r| r.value < threshold),
            ),
            TechnicalCondition::VolumeSpikeWithin { sessions } => (
                TechnicalFlag::RecentVolumeSpike,
                spiked_within(
                    &volumes,
                    indicators.volume_window,
                    sessions,
                    indicators.volume_spike_multiplier,
                ),
            ),
            TechnicalCondition::GoldenCrossWithin { sessions } => {
                let fast = moving_average_series(
                    &closes,
                    indicators.fast_window,
                    indicators.moving_average,
                );
                let slow = moving_average_series(
                    &closes,
                    indicators.slow_window,
                    indicators.moving_average,
                );
                (
                    TechnicalFlag::RecentGoldenCross,
                    recent_crossovers(&fast, &slow, sessions).contains(&CrossDirection::Golden),
                )
            }
        };
        if holds && !flags.contains(&flag) {
            flags.push(flag);
        }
    }
    flags
}

/// Rank by market cap descending, ties by id ascending, keep the top `n`.
pub fn select(mut candidates: Vec<ScreenedInstrument>, top_n: usize) -> Vec<ScreenedInstrument> {
    candidates.sort_by(|a, b| {
        b.market_cap
            .total_cmp(&a.market_cap)
            .then_with(|| a.instrument_id.cmp(&b.instrument_id))
    });
    candidates.truncate(top_n);
    for (i, candidate) in candidates.iter_mut().enumerate() {
        candidate.rank = i as u32 + 1;
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DailyBar;
    use chrono::{Duration, NaiveDate};

    fn metrics(roe: f64, debt_ratio: f64) -> FundamentalMetrics {
        FundamentalMetrics {
            instrument_id: "005930".to_string(),
            roe,
            debt_ratio,
            eps: None,
            bps: None,
        }
    }

    fn valuation(per: Option<f64>) -> ValuationRatios {
        ValuationRatios {
            instrument_id: "005930".to_string(),
            per,
            pbr: None,
            price: 70_000.0,
        }
    }

    fn candidate(id: &str, cap: f64) -> ScreenedInstrument {
        ScreenedInstrument {
            instrument_id: id.to_string(),
            display_name: id.to_string(),
            market_cap: cap,
            fundamental_score: 50.0,
            technical_flags: vec![TechnicalFlag::RsiBelowThreshold],
            rank: 0,
        }
    }

    fn series(closes: &[f64], volumes: &[u64]) -> PriceSeries {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let bars = closes
            .iter()
            .zip(volumes)
            .enumerate()
            .map(|(i, (&close, &volume))| DailyBar {
                instrument_id: "005930".to_string(),
                date: start + Duration::days(i as i64),
                open: close,
                high: close,
                low: close,
                close,
                volume,
            })
            .collect();
        PriceSeries::from_bars("005930", bars, 100)
    }

    // =========================================================================
    // Fundamentals Tests
    // =========================================================================

    #[test]
    fn test_fundamental_thresholds() {
        let config = ScreeningConfig::default();
        assert!(passes_fundamentals(&metrics(12.0, 80.0), None, &config));
        assert!(!passes_fundamentals(&metrics(3.0, 80.0), None, &config));
        assert!(!passes_fundamentals(&metrics(60.0, 80.0), None, &config));
        assert!(!passes_fundamentals(&metrics(12.0, 250.0), None, &config));
    }

    #[test]
    fn test_per_cap() {
        let config = ScreeningConfig {
            max_per: Some(15.0),
            ..ScreeningConfig::default()
        };
        let m = metrics(12.0, 80.0);
        assert!(passes_fundamentals(&m, Some(&valuation(Some(10.0))), &config));
        assert!(!passes_fundamentals(&m, Some(&valuation(Some(20.0))), &config));
        assert!(!passes_fundamentals(&m, Some(&valuation(Some(-4.0))), &config));
        assert!(!passes_fundamentals(&m, None, &config));
    }

    #[test]
    fn test_fundamental_score_bounds() {
        let config = ScreeningConfig::default();
        let best = fundamental_score(&metrics(50.0, 0.0), Some(&valuation(Some(0.0001))), &config);
        assert!(best > 99.0 && best <= 100.0);
        let worst = fundamental_score(&metrics(5.0, 200.0), Some(&valuation(Some(-1.0))), &config);
        assert_eq!(worst, 0.0);
        // Unknown PER scores half of its share
        assert_eq!(fundamental_score(&metrics(5.0, 200.0), None, &config), 15.0);
    }

    // =========================================================================
    // Technical Flag Tests
    // =========================================================================

    #[test]
    fn test_rsi_below_flag() {
        let falling: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        let flags = technical_flags(
            &series(&falling, &[1_000; 20]),
            &[TechnicalCondition::RsiBelow(40.0)],
            &IndicatorConfig::default(),
        );
        assert_eq!(flags, vec![TechnicalFlag::RsiBelowThreshold]);
    }

    #[test]
    fn test_volume_spike_flag() {
        let mut volumes = vec![1_000u64; 20];
        volumes[18] = 5_000;
        let flags = technical_flags(
            &series(&[100.0; 20], &volumes),
            &[
                TechnicalCondition::RsiBelow(40.0),
                TechnicalCondition::VolumeSpikeWithin { sessions: 3 },
            ],
            &IndicatorConfig::default(),
        );
        // Flat closes give RSI 50
        assert_eq!(flags, vec![TechnicalFlag::RecentVolumeSpike]);
    }

    #[test]
    fn test_golden_cross_flag() {
        let config = IndicatorConfig {
            fast_window: 2,
            slow_window: 3,
            ..IndicatorConfig::default()
        };
        let flags = technical_flags(
            &series(&[5.0, 5.0, 5.0, 7.0, 7.0], &[100; 5]),
            &[TechnicalCondition::GoldenCrossWithin { sessions: 3 }],
            &config,
        );
        assert_eq!(flags, vec![TechnicalFlag::RecentGoldenCross]);
    }

    #[test]
    fn test_short_history_has_no_flags() {
        let flags = technical_flags(
            &series(&[1.0, 2.0], &[10, 10]),
            &ScreeningConfig::default().technical_conditions,
            &IndicatorConfig::default(),
        );
        assert!(flags.is_empty());
    }

    // =========================================================================
    // Ranking Tests
    // =========================================================================

    #[test]
    fn test_select_ranks_and_truncates() {
        let set = select(
            vec![
                candidate("000660", 100.0),
                candidate("005930", 400.0),
                candidate("035420", 50.0),
            ],
            2,
        );
        let ids: Vec<&str> = set.iter().map(|s| s.instrument_id.as_str()).collect();
        assert_eq!(ids, vec!["005930", "000660"]);
        assert_eq!(set[0].rank, 1);
        assert_eq!(set[1].rank, 2);
    }

    #[test]
    fn test_equal_market_cap_ties_break_by_id() {
        let a = select(vec![candidate("035720", 10.0), candidate("005380", 10.0)], 10);
        let b = select(vec![candidate("005380", 10.0), candidate("035720", 10.0)], 10);
        assert_eq!(a, b);
        assert_eq!(a[0].instrument_id, "005380");
    }
}
