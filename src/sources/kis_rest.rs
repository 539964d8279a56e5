//! KIS REST client for daily bars.
//!
//! The daily chart endpoint returns at most 100 sessions per call, newest
//! first, with every number encoded as a string.

use crate::config::VenueConfig;
use crate::error::{AppError, Result};
use crate::services::collaborators::{BarSource, CredentialKind, CredentialProvider};
use crate::types::{format_venue_date, parse_venue_date, DailyBar};
use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime, NaiveTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

const DAILY_CHART_PATH: &str = "/uapi/domestic-stock/v1/quotations/inquire-daily-itemchartprice";
const DAILY_CHART_TR_ID: &str = "FHKST03010100";

/// Calendar days requested per call; enough for a 100-session window.
const LOOKBACK_DAYS: i64 = 150;

#[derive(Debug, Deserialize)]
struct DailyChartResponse {
    rt_cd: String,
    #[serde(default)]
    msg1: String,
    #[serde(default)]
    output2: Vec<DailyChartRow>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DailyChartRow {
    stck_bsop_date: String,
    stck_oprc: String,
    stck_hgpr: String,
    stck_lwpr: String,
    stck_clpr: String,
    acml_vol: String,
}

fn field<T: std::str::FromStr>(raw: &str, name: &str, date: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::Parse(format!("bad {} {:?} on {}", name, raw, date)))
}

/// Decode a daily chart response body into bars, oldest first.
pub fn parse_daily_response(instrument_id: &str, body: &str) -> Result<Vec<DailyBar>> {
    let response: DailyChartResponse = serde_json::from_str(body)
        .map_err(|e| AppError::Parse(format!("daily chart for {}: {}", instrument_id, e)))?;

    if response.rt_cd != "0" {
        return Err(AppError::ExternalApi(format!(
            "daily chart for {} rejected: {}",
            instrument_id, response.msg1
        )));
    }

    let mut bars = Vec::with_capacity(response.output2.len());
    // Trailing rows past the listing date come back empty.
    for row in response.output2.iter().filter(|r| !r.stck_bsop_date.is_empty()) {
        let date = parse_venue_date(&row.stck_bsop_date).ok_or_else(|| {
            AppError::Parse(format!("bad bar date {:?}", row.stck_bsop_date))
        })?;
        let day = &row.stck_bsop_date;
        bars.push(DailyBar {
            instrument_id: instrument_id.to_string(),
            date,
            open: field(&row.stck_oprc, "open", day)?,
            high: field(&row.stck_hgpr, "high", day)?,
            low: field(&row.stck_lwpr, "low", day)?,
            close: field(&row.stck_clpr, "close", day)?,
            volume: field(&row.acml_vol, "volume", day)?,
        });
    }
    bars.sort_by_key(|b| b.date);
    Ok(bars)
}

/// Keep only bars whose session is over at venue-local `now`. While the
/// market is open the endpoint already reports today's bar; storing it would
/// make every live tick for today look stale.
pub fn settled_bars(
    mut bars: Vec<DailyBar>,
    now: NaiveDateTime,
    session_close: NaiveTime,
) -> Vec<DailyBar> {
    let today = now.date();
    let closed = now.time() >= session_close;
    bars.retain(|b| b.date < today || (b.date == today && closed));
    bars
}

/// Daily bar source backed by the KIS quotations API.
pub struct KisRestClient {
    client: Client,
    config: VenueConfig,
    credentials: Arc<dyn CredentialProvider>,
}

impl KisRestClient {
    pub fn new(config: VenueConfig, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            client: Client::new(),
            config,
            credentials,
        }
    }
}

#[async_trait]
impl BarSource for KisRestClient {
    async fn fetch_daily_bars(&self, instrument_id: &str) -> Result<Vec<DailyBar>> {
        let token = self
            .credentials
            .get_valid_credential(CredentialKind::AccessToken)
            .await?;

        let now = Utc::now().with_timezone(&self.config.utc_offset).naive_local();
        let today = now.date();
        let from = format_venue_date(today - Duration::days(LOOKBACK_DAYS));
        let to = format_venue_date(today);
        let url = format!("{}{}", self.config.rest_url, DAILY_CHART_PATH);

        let response = self
            .client
            .get(&url)
            .header("authorization", format!("Bearer {}", token))
            .header("appkey", &self.config.app_key)
            .header("appsecret", &self.config.app_secret)
            .header("tr_id", DAILY_CHART_TR_ID)
            .header("custtype", &self.config.customer_type)
            .query(&[
                ("FID_COND_MRKT_DIV_CODE", "J"),
                ("FID_INPUT_ISCD", instrument_id),
                ("FID_INPUT_DATE_1", from.as_str()),
                ("FID_INPUT_DATE_2", to.as_str()),
                ("FID_PERIOD_DIV_CODE", "D"),
                ("FID_ORG_ADJ_PRC", "0"),
            ])
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::ExternalApi(format!(
                "daily chart for {}: HTTP {}",
                instrument_id,
                response.status()
            )));
        }

        let body = response.text().await?;
        let parsed = parse_daily_response(instrument_id, &body)?;
        let fetched = parsed.len();
        let bars = settled_bars(parsed, now, self.config.session_close);
        if bars.len() < fetched {
            debug!("Dropped {} open-session bar for {}", today, instrument_id);
        }
        debug!("Fetched {} daily bars for {}", bars.len(), instrument_id);
        Ok(bars)
    }
}
