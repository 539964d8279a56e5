use crate::error::{AppError, Result};
use chrono::{FixedOffset, NaiveTime, Offset, Utc};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Realtime venue connection settings.
#[derive(Debug, Clone)]
pub struct VenueConfig {
    /// WebSocket endpoint for realtime trades.
    pub ws_url: String,
    /// REST endpoint for daily bars.
    pub rest_url: String,
    pub app_key: String,
    pub app_secret: String,
    /// Customer type sent in realtime request headers ("P" = personal).
    pub customer_type: String,
    /// Realtime registrations allowed per session.
    pub max_subscriptions: usize,
    /// First reconnect delay.
    pub backoff_min: Duration,
    /// Reconnect delay ceiling.
    pub backoff_max: Duration,
    /// Venue local time offset, used for session dates and daily schedules.
    pub utc_offset: FixedOffset,
    /// Venue local time after which the day's bar is final.
    pub session_close: NaiveTime,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://ops.koreainvestment.com:21000".to_string(),
            rest_url: "https://openapi.koreainvestment.com:9443".to_string(),
            app_key: String::new(),
            app_secret: String::new(),
            customer_type: "P".to_string(),
            max_subscriptions: 41,
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            utc_offset: kst(),
            session_close: hm(15, 30),
        }
    }
}

/// Price cache sizing.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Daily bars retained per instrument.
    pub history_window: usize,
    /// Capacity of the tick channel between the venue client and the cache.
    pub tick_channel_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            history_window: 100,
            tick_channel_capacity: 4096,
        }
    }
}

/// Moving-average flavour used for crossover detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovingAverageKind {
    Simple,
    Exponential,
}

impl FromStr for MovingAverageKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sma" | "simple" => Ok(Self::Simple),
            "ema" | "exponential" => Ok(Self::Exponential),
            other => Err(AppError::Config(format!("unknown moving average kind: {}", other))),
        }
    }
}

/// Indicator parameters shared by the signal detector and screening.
#[derive(Debug, Clone)]
pub struct IndicatorConfig {
    pub rsi_period: usize,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
    pub fast_window: usize,
    pub slow_window: usize,
    pub moving_average: MovingAverageKind,
    /// Trailing sessions averaged for volume spike detection.
    pub volume_window: usize,
    pub volume_spike_multiplier: f64,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            rsi_overbought: 70.0,
            rsi_oversold: 30.0,
            fast_window: 5,
            slow_window: 20,
            moving_average: MovingAverageKind::Simple,
            volume_window: 20,
            volume_spike_multiplier: 2.0,
        }
    }
}

/// What the signal detector assumes about an instrument it has not seen yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Baseline is the state implied by the hydrated bars; conditions that
    /// already held before the first live tick are not announced.
    Suppress,
    /// Baseline is neutral; conditions already holding are announced again.
    Rearm,
}

impl FromStr for RestartPolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "suppress" => Ok(Self::Suppress),
            "rearm" | "re-arm" => Ok(Self::Rearm),
            other => Err(AppError::Config(format!("unknown signal restart policy: {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub restart_policy: RestartPolicy,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            restart_policy: RestartPolicy::Suppress,
        }
    }
}

/// Technical conditions; an instrument passes screening if any one holds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TechnicalCondition {
    /// RSI strictly below the given value.
    RsiBelow(f64),
    /// A volume spike in one of the last `sessions` sessions.
    VolumeSpikeWithin { sessions: usize },
    /// A golden cross in one of the last `sessions` sessions.
    GoldenCrossWithin { sessions: usize },
}

/// Watch-list screening thresholds.
#[derive(Debug, Clone)]
pub struct ScreeningConfig {
    /// Market code passed to the universe provider.
    pub market: String,
    pub top_n: usize,
    pub min_roe: f64,
    pub max_roe: f64,
    pub max_debt_ratio: f64,
    /// Instruments above this PER are rejected; `None` disables the check.
    pub max_per: Option<f64>,
    pub technical_conditions: Vec<TechnicalCondition>,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            market: "KOSPI".to_string(),
            top_n: 50,
            min_roe: 5.0,
            max_roe: 50.0,
            max_debt_ratio: 200.0,
            max_per: None,
            technical_conditions: vec![
                TechnicalCondition::RsiBelow(40.0),
                TechnicalCondition::VolumeSpikeWithin { sessions: 3 },
            ],
        }
    }
}

/// Pacing for batched upstream calls.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub call_delay: Duration,
    pub batch_size: usize,
    pub batch_pause: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            call_delay: Duration::from_millis(100),
            batch_size: 50,
            batch_pause: Duration::from_secs(3),
        }
    }
}

/// When a recurring job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Every(Duration),
    /// Once a day at the given venue-local time.
    DailyAt(NaiveTime),
}

impl FromStr for Schedule {
    type Err = AppError;

    /// Accepts `HH:MM` for daily schedules or `<n>s` / `<n>m` / `<n>h` for intervals.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(time) = NaiveTime::parse_from_str(s, "%H:%M") {
            return Ok(Schedule::DailyAt(time));
        }

        let unit = s
            .chars()
            .last()
            .ok_or_else(|| AppError::Config("empty schedule".to_string()))?;
        let amount: u64 = s[..s.len() - unit.len_utf8()]
            .parse()
            .map_err(|_| AppError::Config(format!("invalid schedule: {}", s)))?;
        let secs = match unit {
            's' => amount,
            'm' => amount * 60,
            'h' => amount * 3600,
            _ => return Err(AppError::Config(format!("invalid schedule unit: {}", s))),
        };
        if secs == 0 {
            return Err(AppError::Config(format!("schedule interval must be positive: {}", s)));
        }
        Ok(Schedule::Every(Duration::from_secs(secs)))
    }
}

/// Enable flag and schedule for one job.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub enabled: bool,
    pub schedule: Schedule,
}

#[derive(Debug, Clone)]
pub struct JobsConfig {
    pub screening: JobSettings,
    pub price_refresh: JobSettings,
    pub valuation_refresh: JobSettings,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            screening: JobSettings {
                enabled: true,
                schedule: Schedule::DailyAt(hm(8, 30)),
            },
            price_refresh: JobSettings {
                enabled: true,
                schedule: Schedule::DailyAt(hm(16, 0)),
            },
            valuation_refresh: JobSettings {
                enabled: true,
                schedule: Schedule::DailyAt(hm(16, 30)),
            },
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path.
    pub database_path: String,
    pub venue: VenueConfig,
    /// Approval key for realtime registrations.
    pub approval_key: String,
    /// Bearer token for REST calls.
    pub access_token: String,
    pub cache: CacheConfig,
    pub indicators: IndicatorConfig,
    pub signals: SignalConfig,
    pub screening: ScreeningConfig,
    pub batch: BatchConfig,
    pub jobs: JobsConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Missing venue credentials are fatal: the process must not start half-configured.
    pub fn from_env() -> Result<Self> {
        let venue_defaults = VenueConfig::default();
        let venue = VenueConfig {
            ws_url: env::var("KIS_WS_URL").unwrap_or(venue_defaults.ws_url),
            rest_url: env::var("KIS_REST_URL").unwrap_or(venue_defaults.rest_url),
            app_key: required("KIS_APP_KEY")?,
            app_secret: required("KIS_APP_SECRET")?,
            customer_type: env::var("KIS_CUSTOMER_TYPE").unwrap_or(venue_defaults.customer_type),
            max_subscriptions: parsed("KIS_MAX_SUBSCRIPTIONS")?
                .unwrap_or(venue_defaults.max_subscriptions),
            backoff_min: parsed("RECONNECT_BACKOFF_MIN_MS")?
                .map(Duration::from_millis)
                .unwrap_or(venue_defaults.backoff_min),
            backoff_max: parsed("RECONNECT_BACKOFF_MAX_MS")?
                .map(Duration::from_millis)
                .unwrap_or(venue_defaults.backoff_max),
            utc_offset: match parsed::<i32>("VENUE_UTC_OFFSET_HOURS")? {
                Some(hours) => FixedOffset::east_opt(hours * 3600).ok_or_else(|| {
                    AppError::Config(format!("VENUE_UTC_OFFSET_HOURS out of range: {}", hours))
                })?,
                None => venue_defaults.utc_offset,
            },
            session_close: match env::var("KIS_SESSION_CLOSE").ok() {
                Some(raw) => NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(|_| {
                    AppError::Config(format!("KIS_SESSION_CLOSE must be HH:MM: {}", raw))
                })?,
                None => venue_defaults.session_close,
            },
        };

        let cache_defaults = CacheConfig::default();
        let cache = CacheConfig {
            history_window: parsed("HISTORY_WINDOW")?.unwrap_or(cache_defaults.history_window),
            tick_channel_capacity: parsed("TICK_CHANNEL_CAPACITY")?
                .unwrap_or(cache_defaults.tick_channel_capacity),
        };

        let ind = IndicatorConfig::default();
        let indicators = IndicatorConfig {
            rsi_period: parsed("RSI_PERIOD")?.unwrap_or(ind.rsi_period),
            rsi_overbought: parsed("RSI_OVERBOUGHT")?.unwrap_or(ind.rsi_overbought),
            rsi_oversold: parsed("RSI_OVERSOLD")?.unwrap_or(ind.rsi_oversold),
            fast_window: parsed("MA_FAST_WINDOW")?.unwrap_or(ind.fast_window),
            slow_window: parsed("MA_SLOW_WINDOW")?.unwrap_or(ind.slow_window),
            moving_average: parsed("MA_KIND")?.unwrap_or(ind.moving_average),
            volume_window: parsed("VOLUME_WINDOW")?.unwrap_or(ind.volume_window),
            volume_spike_multiplier: parsed("VOLUME_SPIKE_MULTIPLIER")?
                .unwrap_or(ind.volume_spike_multiplier),
        };
        if indicators.fast_window >= indicators.slow_window {
            return Err(AppError::Config(format!(
                "MA_FAST_WINDOW ({}) must be shorter than MA_SLOW_WINDOW ({})",
                indicators.fast_window, indicators.slow_window
            )));
        }

        let signals = SignalConfig {
            restart_policy: parsed("SIGNAL_RESTART_POLICY")?
                .unwrap_or(SignalConfig::default().restart_policy),
        };

        let scr = ScreeningConfig::default();
        let screening = ScreeningConfig {
            market: env::var("SCREENING_MARKET").unwrap_or(scr.market),
            top_n: parsed("SCREENING_TOP_N")?.unwrap_or(scr.top_n),
            min_roe: parsed("SCREENING_MIN_ROE")?.unwrap_or(scr.min_roe),
            max_roe: parsed("SCREENING_MAX_ROE")?.unwrap_or(scr.max_roe),
            max_debt_ratio: parsed("SCREENING_MAX_DEBT_RATIO")?.unwrap_or(scr.max_debt_ratio),
            max_per: parsed("SCREENING_MAX_PER")?.or(scr.max_per),
            technical_conditions: match env::var("SCREENING_RSI_BELOW").ok() {
                Some(raw) => {
                    let threshold: f64 = raw.parse().map_err(|_| {
                        AppError::Config(format!("SCREENING_RSI_BELOW is not a number: {}", raw))
                    })?;
                    let sessions = parsed("SCREENING_SPIKE_SESSIONS")?.unwrap_or(3);
                    vec![
                        TechnicalCondition::RsiBelow(threshold),
                        TechnicalCondition::VolumeSpikeWithin { sessions },
                    ]
                }
                None => scr.technical_conditions,
            },
        };

        let bat = BatchConfig::default();
        let batch = BatchConfig {
            call_delay: parsed("BATCH_CALL_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(bat.call_delay),
            batch_size: parsed("BATCH_SIZE")?.unwrap_or(bat.batch_size).max(1),
            batch_pause: parsed("BATCH_PAUSE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(bat.batch_pause),
        };

        let job_defaults = JobsConfig::default();
        let jobs = JobsConfig {
            screening: job_settings("SCREENING", job_defaults.screening)?,
            price_refresh: job_settings("PRICE_REFRESH", job_defaults.price_refresh)?,
            valuation_refresh: job_settings("VALUATION_REFRESH", job_defaults.valuation_refresh)?,
        };

        Ok(Self {
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "tickwatch.db".to_string()),
            venue,
            approval_key: required("KIS_APPROVAL_KEY")?,
            access_token: required("KIS_ACCESS_TOKEN")?,
            cache,
            indicators,
            signals,
            screening,
            batch,
            jobs,
        })
    }
}

/// Korea Standard Time, the default venue offset.
pub fn kst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).unwrap_or_else(|| Utc.fix())
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

fn required(name: &str) -> Result<String> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::Config(format!("missing required environment variable {}", name))),
    }
}

fn parsed<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| AppError::Config(format!("invalid value for {}: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

/// Parse a boolean flag: "true"/"1" enable, anything else disables.
pub fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

fn job_settings(prefix: &str, defaults: JobSettings) -> Result<JobSettings> {
    let enabled = env::var(format!("JOB_{}_ENABLED", prefix))
        .ok()
        .map(|v| parse_flag(&v))
        .unwrap_or(defaults.enabled);
    let schedule = parsed(&format!("JOB_{}_SCHEDULE", prefix))?.unwrap_or(defaults.schedule);
    Ok(JobSettings { enabled, schedule })
}
