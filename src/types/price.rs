use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of the last trade relative to the previous session close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSign {
    Rise,
    Fall,
    Flat,
}

impl PriceSign {
    /// Map the venue's sign code (1 upper limit, 2 rise, 3 flat, 4 lower limit, 5 fall).
    pub fn from_venue_code(code: &str) -> Option<Self> {
        match code.trim() {
            "1" | "2" => Some(PriceSign::Rise),
            "3" => Some(PriceSign::Flat),
            "4" | "5" => Some(PriceSign::Fall),
            _ => None,
        }
    }

    /// Derive the sign from an absolute change.
    pub fn from_change(change: f64) -> Self {
        if change > 0.0 {
            PriceSign::Rise
        } else if change < 0.0 {
            PriceSign::Fall
        } else {
            PriceSign::Flat
        }
    }
}

impl fmt::Display for PriceSign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceSign::Rise => write!(f, "rise"),
            PriceSign::Fall => write!(f, "fall"),
            PriceSign::Flat => write!(f, "flat"),
        }
    }
}

/// Most recent trade for an instrument, as reported by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceTick {
    pub instrument_id: String,
    /// Business date of the session the trade belongs to.
    pub session_date: NaiveDate,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub change_abs: f64,
    /// Change versus previous close, in percent.
    pub change_rate: f64,
    pub sign: PriceSign,
    /// Volume accumulated over the session so far.
    pub cumulative_volume: u64,
}

/// One session's OHLCV summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyBar {
    pub instrument_id: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// Parse a `YYYYMMDD` venue date.
pub fn parse_venue_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y%m%d").ok()
}

/// Format a date as `YYYYMMDD`.
pub fn format_venue_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Rolling price history for one instrument: daily bars plus the live
/// current-session overlay.
///
/// Bars are strictly increasing by date. The overlay, when present, belongs to
/// a session strictly later than the last bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSeries {
    pub instrument_id: String,
    pub bars: Vec<DailyBar>,
    pub overlay: Option<PriceTick>,
}

impl PriceSeries {
    /// Build a series from unordered bars, keeping the last `window` sessions.
    ///
    /// Duplicate dates keep the later entry in input order.
    pub fn from_bars(instrument_id: &str, mut bars: Vec<DailyBar>, window: usize) -> Self {
        bars.retain(|b| b.instrument_id == instrument_id);
        // Stable sort keeps input order among equal dates, so the last duplicate wins below.
        bars.sort_by_key(|b| b.date);
        let mut deduped: Vec<DailyBar> = Vec::with_capacity(bars.len());
        for bar in bars {
            match deduped.last_mut() {
                Some(last) if last.date == bar.date => *last = bar,
                _ => deduped.push(bar),
            }
        }
        if deduped.len() > window {
            deduped.drain(..deduped.len() - window);
        }

        Self {
            instrument_id: instrument_id.to_string(),
            bars: deduped,
            overlay: None,
        }
    }

    /// Date of the most recent completed bar.
    pub fn last_bar_date(&self) -> Option<NaiveDate> {
        self.bars.last().map(|b| b.date)
    }

    /// Whether a tick for `session` may be overlaid on this series.
    pub fn accepts_session(&self, session: NaiveDate) -> bool {
        self.last_bar_date().map_or(true, |last| session > last)
    }

    /// Close prices in date order, with the overlay price appended.
    pub fn closes(&self) -> Vec<f64> {
        let mut closes: Vec<f64> = self.bars.iter().map(|b| b.close).collect();
        if let Some(tick) = &self.overlay {
            closes.push(tick.price);
        }
        closes
    }

    /// Session volumes in date order, with the overlay's cumulative volume appended.
    pub fn volumes(&self) -> Vec<f64> {
        let mut volumes: Vec<f64> = self.bars.iter().map(|b| b.volume as f64).collect();
        if let Some(tick) = &self.overlay {
            volumes.push(tick.cumulative_volume as f64);
        }
        volumes
    }

    /// The same series without the live overlay.
    pub fn without_overlay(&self) -> Self {
        Self {
            instrument_id: self.instrument_id.clone(),
            bars: self.bars.clone(),
            overlay: None,
        }
    }

    /// Latest known price: the overlay if present, else the last close.
    pub fn latest_price(&self) -> Option<f64> {
        self.overlay
            .as_ref()
            .map(|t| t.price)
            .or_else(|| self.bars.last().map(|b| b.close))
    }

    pub fn len(&self) -> usize {
        self.bars.len() + usize::from(self.overlay.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
