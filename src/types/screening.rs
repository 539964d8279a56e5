use serde::{Deserialize, Serialize};
use std::fmt;

/// An entry of the tradable universe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instrument {
    pub id: String,
    pub name: String,
    /// Market capitalization in the venue currency.
    pub market_cap: f64,
}

/// Latest fundamental metrics for an instrument, as stored by the
/// fundamentals pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundamentalMetrics {
    pub instrument_id: String,
    /// Return on equity, percent.
    pub roe: f64,
    /// Total liabilities / equity, percent.
    pub debt_ratio: f64,
    /// Earnings per share.
    pub eps: Option<f64>,
    /// Book value per share.
    pub bps: Option<f64>,
}

/// Price-dependent valuation ratios.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuationRatios {
    pub instrument_id: String,
    pub per: Option<f64>,
    pub pbr: Option<f64>,
    /// Price the ratios were computed from.
    pub price: f64,
}

/// Technical conditions an instrument satisfied during screening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TechnicalFlag {
    RsiBelowThreshold,
    RecentVolumeSpike,
    RecentGoldenCross,
}

impl TechnicalFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            TechnicalFlag::RsiBelowThreshold => "rsi_below_threshold",
            TechnicalFlag::RecentVolumeSpike => "recent_volume_spike",
            TechnicalFlag::RecentGoldenCross => "recent_golden_cross",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "rsi_below_threshold" => Some(TechnicalFlag::RsiBelowThreshold),
            "recent_volume_spike" => Some(TechnicalFlag::RecentVolumeSpike),
            "recent_golden_cross" => Some(TechnicalFlag::RecentGoldenCross),
            _ => None,
        }
    }
}

impl fmt::Display for TechnicalFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the ranked watch-list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenedInstrument {
    pub instrument_id: String,
    pub display_name: String,
    pub market_cap: f64,
    /// 0..=100
    pub fundamental_score: f64,
    pub technical_flags: Vec<TechnicalFlag>,
    /// 1-based position in the list.
    pub rank: u32,
}
