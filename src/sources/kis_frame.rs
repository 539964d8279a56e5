//! Korea Investment (KIS) realtime frame codec.
//!
//! Requests are JSON. Realtime data arrives as pipe-delimited text,
//! `0|H0STCNT0|<count>|f0^f1^...`, with `count` caret-separated records of the
//! domestic trade layout. Control messages (acks, `PINGPONG`) are JSON.

use crate::error::{AppError, Result};
use crate::types::{parse_venue_date, PriceSign, PriceTick};
use chrono::{FixedOffset, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Domestic stock realtime trade feed.
pub const TRADE_TR_ID: &str = "H0STCNT0";

/// Heartbeat control message the venue expects echoed back.
pub const PINGPONG_TR_ID: &str = "PINGPONG";

// Field positions in one H0STCNT0 record.
const F_CODE: usize = 0;
const F_TIME: usize = 1;
const F_PRICE: usize = 2;
const F_SIGN: usize = 3;
const F_CHANGE: usize = 4;
const F_CHANGE_RATE: usize = 5;
const F_CUM_VOLUME: usize = 13;
const F_BUSINESS_DATE: usize = 33;

/// Fewest fields a record may carry and still hold every field read above.
const MIN_RECORD_FIELDS: usize = F_BUSINESS_DATE + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Subscribe,
    Unsubscribe,
}

impl RequestKind {
    fn tr_type(self) -> &'static str {
        match self {
            RequestKind::Subscribe => "1",
            RequestKind::Unsubscribe => "2",
        }
    }
}

#[derive(Debug, Serialize)]
struct RequestHeader<'a> {
    approval_key: &'a str,
    custtype: &'a str,
    tr_type: &'a str,
    #[serde(rename = "content-type")]
    content_type: &'a str,
}

#[derive(Debug, Serialize)]
struct RequestInput<'a> {
    tr_id: &'a str,
    tr_key: &'a str,
}

#[derive(Debug, Serialize)]
struct RequestBody<'a> {
    input: RequestInput<'a>,
}

#[derive(Debug, Serialize)]
struct RegistrationRequest<'a> {
    header: RequestHeader<'a>,
    body: RequestBody<'a>,
}

/// Build a realtime registration (or deregistration) message.
pub fn build_request(
    approval_key: &str,
    customer_type: &str,
    kind: RequestKind,
    instrument_id: &str,
) -> Result<String> {
    let request = RegistrationRequest {
        header: RequestHeader {
            approval_key,
            custtype: customer_type,
            tr_type: kind.tr_type(),
            content_type: "utf-8",
        },
        body: RequestBody {
            input: RequestInput {
                tr_id: TRADE_TR_ID,
                tr_key: instrument_id,
            },
        },
    };
    Ok(serde_json::to_string(&request)?)
}

#[derive(Debug, Deserialize)]
struct ControlHeader {
    tr_id: String,
    #[serde(default)]
    tr_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ControlBody {
    #[serde(default)]
    rt_cd: Option<String>,
    #[serde(default)]
    msg1: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ControlMessage {
    header: ControlHeader,
    #[serde(default)]
    body: Option<ControlBody>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Tick(PriceTick),
    /// Heartbeat; the raw text must be sent back unchanged.
    PingPong,
    /// Response to a registration request.
    Ack {
        tr_id: String,
        tr_key: Option<String>,
        success: bool,
        message: String,
    },
    /// Well-formed but not something this client consumes.
    Ignored(String),
}

/// Decode one inbound text frame. `offset` is the venue's local time zone,
/// used to place the record's HHMMSS on its business date.
pub fn parse_frame(text: &str, offset: FixedOffset) -> Result<Frame> {
    let text = text.trim();
    match text.as_bytes().first() {
        Some(b'0') => parse_data_frame(text, offset),
        Some(b'1') => Ok(Frame::Ignored("encrypted frame".to_string())),
        Some(b'{') => parse_control_frame(text),
        Some(_) => Err(AppError::Parse(format!("unrecognised frame: {:.32}", text))),
        None => Err(AppError::Parse("empty frame".to_string())),
    }
}

fn parse_control_frame(text: &str) -> Result<Frame> {
    let msg: ControlMessage = serde_json::from_str(text)
        .map_err(|e| AppError::Parse(format!("bad control frame: {}", e)))?;

    if msg.header.tr_id == PINGPONG_TR_ID {
        return Ok(Frame::PingPong);
    }

    let body = msg.body.unwrap_or_default();
    Ok(Frame::Ack {
        tr_id: msg.header.tr_id,
        tr_key: msg.header.tr_key,
        success: body.rt_cd.as_deref() == Some("0"),
        message: body.msg1.unwrap_or_default(),
    })
}

fn parse_data_frame(text: &str, offset: FixedOffset) -> Result<Frame> {
    let parts: Vec<&str> = text.splitn(4, '|').collect();
    if parts.len() != 4 {
        return Err(AppError::Parse(format!(
            "expected 4 pipe sections, got {}",
            parts.len()
        )));
    }
    if parts[1] != TRADE_TR_ID {
        return Ok(Frame::Ignored(format!("unhandled tr_id {}", parts[1])));
    }

    let count: usize = parts[2]
        .trim()
        .parse()
        .map_err(|_| AppError::Parse(format!("bad record count: {}", parts[2])))?;
    if count == 0 {
        return Err(AppError::Parse("zero records in frame".to_string()));
    }

    let fields: Vec<&str> = parts[3].split('^').collect();
    let record_len = fields.len() / count;
    if record_len < MIN_RECORD_FIELDS {
        return Err(AppError::Parse(format!(
            "{} fields for {} records",
            fields.len(),
            count
        )));
    }

    // Only the newest trade matters for the overlay.
    let start = (count - 1) * record_len;
    parse_record(&fields[start..start + record_len], offset).map(Frame::Tick)
}

fn number<T: std::str::FromStr>(fields: &[&str], idx: usize, name: &str) -> Result<T> {
    fields[idx]
        .trim()
        .parse()
        .map_err(|_| AppError::Parse(format!("bad {}: {:?}", name, fields[idx])))
}

fn parse_record(fields: &[&str], offset: FixedOffset) -> Result<PriceTick> {
    let instrument_id = fields[F_CODE].trim();
    if instrument_id.is_empty() {
        return Err(AppError::Parse("empty instrument code".to_string()));
    }

    let price: f64 = number(fields, F_PRICE, "price")?;
    if !price.is_finite() || price <= 0.0 {
        return Err(AppError::Parse(format!("non-positive price {}", price)));
    }
    let change_abs: f64 = number(fields, F_CHANGE, "change")?;
    let change_rate: f64 = number(fields, F_CHANGE_RATE, "change rate")?;
    let cumulative_volume: u64 = number(fields, F_CUM_VOLUME, "cumulative volume")?;
    let sign = PriceSign::from_venue_code(fields[F_SIGN])
        .unwrap_or_else(|| PriceSign::from_change(change_abs));

    let session_date = parse_venue_date(fields[F_BUSINESS_DATE]).ok_or_else(|| {
        AppError::Parse(format!("bad business date: {:?}", fields[F_BUSINESS_DATE]))
    })?;
    let time = NaiveTime::parse_from_str(fields[F_TIME].trim(), "%H%M%S")
        .map_err(|_| AppError::Parse(format!("bad trade time: {:?}", fields[F_TIME])))?;
    let timestamp = offset
        .from_local_datetime(&session_date.and_time(time))
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| AppError::Parse("unrepresentable trade time".to_string()))?;

    Ok(PriceTick {
        instrument_id: instrument_id.to_string(),
        session_date,
        timestamp,
        price,
        change_abs,
        change_rate,
        sign,
        cumulative_volume,
    })
}
