use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Outcome of an indicator that needs a minimum amount of history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum Reading<T> {
    Value(T),
    InsufficientData { needed: usize, available: usize },
}

impl<T> Reading<T> {
    /// The computed value, if there was enough data.
    pub fn value(&self) -> Option<&T> {
        match self {
            Reading::Value(v) => Some(v),
            Reading::InsufficientData { .. } => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Reading::Value(v) => Some(v),
            Reading::InsufficientData { .. } => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Reading::Value(_))
    }
}

/// RSI zone classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RsiState {
    Overbought,
    Oversold,
    Neutral,
}

impl RsiState {
    /// Classify an RSI value against the overbought/oversold bounds (inclusive).
    pub fn classify(value: f64, overbought: f64, oversold: f64) -> Self {
        if value >= overbought {
            RsiState::Overbought
        } else if value <= oversold {
            RsiState::Oversold
        } else {
            RsiState::Neutral
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RsiResult {
    /// 0..=100
    pub value: f64,
    pub state: RsiState,
}

/// Golden: fast crosses above slow. Dead: fast crosses below slow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossDirection {
    Golden,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossoverResult {
    pub occurred: bool,
    /// Set only when `occurred` is true.
    pub direction: Option<CrossDirection>,
    pub fast_series: Vec<f64>,
    pub slow_series: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpike {
    pub ratio: f64,
    pub is_spike: bool,
}

/// Closed set of indicator outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum IndicatorResult {
    Rsi(Reading<RsiResult>),
    Crossover(CrossoverResult),
    VolumeSpike(VolumeSpike),
}

/// Indicator state retained per instrument for edge detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorSnapshot {
    /// `None` while RSI has insufficient history.
    pub rsi_state: Option<RsiState>,
    /// Most recent crossover seen on the last two points, if any.
    pub cross: Option<CrossDirection>,
    pub volume_spike: bool,
}

impl IndicatorSnapshot {
    /// Baseline with no condition holding.
    pub fn neutral() -> Self {
        Self {
            rsi_state: Some(RsiState::Neutral),
            cross: None,
            volume_spike: false,
        }
    }
}

/// Discrete condition transitions reported to the alert sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    RsiEnterOverbought,
    RsiExitOverbought,
    RsiEnterOversold,
    RsiExitOversold,
    GoldenCross,
    DeadCross,
    VolumeSpike,
}

impl SignalKind {
    /// Get display label for this kind.
    pub fn label(&self) -> &'static str {
        match self {
            SignalKind::RsiEnterOverbought => "RSI enter overbought",
            SignalKind::RsiExitOverbought => "RSI exit overbought",
            SignalKind::RsiEnterOversold => "RSI enter oversold",
            SignalKind::RsiExitOversold => "RSI exit oversold",
            SignalKind::GoldenCross => "Golden cross",
            SignalKind::DeadCross => "Dead cross",
            SignalKind::VolumeSpike => "Volume spike",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::RsiEnterOverbought => "rsi_enter_overbought",
            SignalKind::RsiExitOverbought => "rsi_exit_overbought",
            SignalKind::RsiEnterOversold => "rsi_enter_oversold",
            SignalKind::RsiExitOversold => "rsi_exit_oversold",
            SignalKind::GoldenCross => "golden_cross",
            SignalKind::DeadCross => "dead_cross",
            SignalKind::VolumeSpike => "volume_spike",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Indicator values at the moment a signal fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsi: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fast_ma: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slow_ma: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_ratio: Option<f64>,
}

/// A detected signal. Write-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEvent {
    pub id: Uuid,
    pub instrument_id: String,
    pub triggered_at: DateTime<Utc>,
    pub kind: SignalKind,
    pub payload: SignalPayload,
}

impl SignalEvent {
    pub fn new(instrument_id: &str, kind: SignalKind, payload: SignalPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            instrument_id: instrument_id.to_string(),
            triggered_at: Utc::now(),
            kind,
            payload,
        }
    }
}
