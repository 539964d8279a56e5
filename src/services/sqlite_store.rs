//! SQLite persistence for price history, fundamentals, the screened set and
//! signal alerts.
//!
//! Fundamentals and the instrument universe are written by other pipelines;
//! the `upsert_*` helpers are their entry points here.

use crate::error::{AppError, Result};
use crate::services::collaborators::{StorageBackend, UniverseProvider};
use crate::types::{
    format_venue_date, parse_venue_date, DailyBar, FundamentalMetrics, Instrument,
    ScreenedInstrument, SignalEvent, TechnicalFlag, ValuationRatios,
};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// SQLite store backing [`StorageBackend`] and [`UniverseProvider`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create a new SQLite store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("SQLite store initialized");
        Ok(store)
    }

    /// Create an in-memory SQLite store (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        debug!("In-memory SQLite store initialized");
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Storage("connection mutex poisoned".to_string()))
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS instruments (
                id TEXT PRIMARY KEY,
                market TEXT NOT NULL,
                name TEXT NOT NULL,
                market_cap REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_instruments_market ON instruments(market);

            CREATE TABLE IF NOT EXISTS price_history (
                instrument_id TEXT NOT NULL,
                date TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume INTEGER NOT NULL,
                PRIMARY KEY (instrument_id, date)
            );

            CREATE TABLE IF NOT EXISTS fundamentals (
                instrument_id TEXT PRIMARY KEY,
                roe REAL NOT NULL,
                debt_ratio REAL NOT NULL,
                eps REAL,
                bps REAL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS valuations (
                instrument_id TEXT PRIMARY KEY,
                per REAL,
                pbr REAL,
                price REAL NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS screened_set (
                instrument_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                market_cap REAL NOT NULL,
                fundamental_score REAL NOT NULL,
                technical_flags TEXT NOT NULL,
                rank INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS signal_alerts (
                id TEXT PRIMARY KEY,
                instrument_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                triggered_at INTEGER NOT NULL,
                payload_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_instrument
                ON signal_alerts(instrument_id, triggered_at DESC);",
        )?;

        info!("SQLite schema initialized");
        Ok(())
    }

    // ========== Upstream Writers ==========

    /// Insert or update a universe entry.
    pub fn upsert_instrument(&self, market: &str, instrument: &Instrument) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO instruments (id, market, name, market_cap) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET market = ?2, name = ?3, market_cap = ?4",
            params![instrument.id, market, instrument.name, instrument.market_cap],
        )?;
        Ok(())
    }

    /// Insert or update the latest fundamentals for an instrument.
    pub fn upsert_fundamentals(&self, metrics: &FundamentalMetrics) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO fundamentals (instrument_id, roe, debt_ratio, eps, bps, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(instrument_id) DO UPDATE
             SET roe = ?2, debt_ratio = ?3, eps = ?4, bps = ?5, updated_at = ?6",
            params![
                metrics.instrument_id,
                metrics.roe,
                metrics.debt_ratio,
                metrics.eps,
                metrics.bps,
                chrono::Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Number of persisted alerts for an instrument.
    pub fn count_signal_alerts(&self, instrument_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM signal_alerts WHERE instrument_id = ?1",
            params![instrument_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn parse_flags(raw: &str) -> Vec<TechnicalFlag> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|s| {
            let flag = TechnicalFlag::parse(s);
            if flag.is_none() {
                warn!("Ignoring unknown technical flag in screened set: {}", s);
            }
            flag
        })
        .collect()
}

#[async_trait]
impl StorageBackend for SqliteStore {
    async fn read_price_history(&self, instrument_id: &str) -> Result<Vec<DailyBar>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT date, open, high, low, close, volume FROM price_history
             WHERE instrument_id = ?1 ORDER BY date ASC",
        )?;

        let rows = stmt.query_map(params![instrument_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut bars = Vec::new();
        for row in rows {
            let (date, open, high, low, close, volume) = row?;
            let date = parse_venue_date(&date).ok_or_else(|| {
                AppError::Storage(format!("bad bar date {} for {}", date, instrument_id))
            })?;
            bars.push(DailyBar {
                instrument_id: instrument_id.to_string(),
                date,
                open,
                high,
                low,
                close,
                volume: volume.max(0) as u64,
            });
        }
        Ok(bars)
    }

    async fn replace_price_history(&self, instrument_id: &str, bars: &[DailyBar]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM price_history WHERE instrument_id = ?1",
            params![instrument_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO price_history
                 (instrument_id, date, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for bar in bars {
                stmt.execute(params![
                    instrument_id,
                    format_venue_date(bar.date),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume as i64,
                ])?;
            }
        }
        tx.commit()?;
        debug!("Stored {} bars for {}", bars.len(), instrument_id);
        Ok(())
    }

    async fn read_latest_fundamentals(
        &self,
        instrument_id: &str,
    ) -> Result<Option<FundamentalMetrics>> {
        let conn = self.conn()?;
        let metrics = conn
            .query_row(
                "SELECT roe, debt_ratio, eps, bps FROM fundamentals WHERE instrument_id = ?1",
                params![instrument_id],
                |row| {
                    Ok(FundamentalMetrics {
                        instrument_id: instrument_id.to_string(),
                        roe: row.get(0)?,
                        debt_ratio: row.get(1)?,
                        eps: row.get(2)?,
                        bps: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(metrics)
    }

    async fn read_valuation(&self, instrument_id: &str) -> Result<Option<ValuationRatios>> {
        let conn = self.conn()?;
        let ratios = conn
            .query_row(
                "SELECT per, pbr, price FROM valuations WHERE instrument_id = ?1",
                params![instrument_id],
                |row| {
                    Ok(ValuationRatios {
                        instrument_id: instrument_id.to_string(),
                        per: row.get(0)?,
                        pbr: row.get(1)?,
                        price: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(ratios)
    }

    async fn write_valuation(&self, ratios: &ValuationRatios) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO valuations (instrument_id, per, pbr, price, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(instrument_id) DO UPDATE
             SET per = ?2, pbr = ?3, price = ?4, updated_at = ?5",
            params![
                ratios.instrument_id,
                ratios.per,
                ratios.pbr,
                ratios.price,
                chrono::Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    async fn read_screened_set(&self) -> Result<Vec<ScreenedInstrument>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT instrument_id, display_name, market_cap, fundamental_score,
                    technical_flags, rank
             FROM screened_set ORDER BY rank ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let flags: String = row.get(4)?;
            Ok(ScreenedInstrument {
                instrument_id: row.get(0)?,
                display_name: row.get(1)?,
                market_cap: row.get(2)?,
                fundamental_score: row.get(3)?,
                technical_flags: parse_flags(&flags),
                rank: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    async fn replace_screened_set(&self, set: &[ScreenedInstrument]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM screened_set", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO screened_set
                 (instrument_id, display_name, market_cap, fundamental_score, technical_flags, rank)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for row in set {
                let flags = row
                    .technical_flags
                    .iter()
                    .map(|f| f.as_str())
                    .collect::<Vec<_>>()
                    .join(",");
                stmt.execute(params![
                    row.instrument_id,
                    row.display_name,
                    row.market_cap,
                    row.fundamental_score,
                    flags,
                    row.rank,
                ])?;
            }
        }
        tx.commit()?;
        info!("Replaced screened set with {} instruments", set.len());
        Ok(())
    }

    async fn write_signal_alert(&self, event: &SignalEvent) -> Result<()> {
        let payload = serde_json::to_string(&event.payload)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO signal_alerts (id, instrument_id, kind, triggered_at, payload_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.id.to_string(),
                event.instrument_id,
                event.kind.as_str(),
                event.triggered_at.timestamp_millis(),
                payload,
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl UniverseProvider for SqliteStore {
    async fn list_instruments(&self, market: &str) -> Result<Vec<Instrument>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, market_cap FROM instruments WHERE market = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![market], |row| {
            Ok(Instrument {
                id: row.get(0)?,
                name: row.get(1)?,
                market_cap: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SignalKind, SignalPayload};
    use chrono::NaiveDate;

    fn bar(day: u32, close: f64) -> DailyBar {
        DailyBar {
            instrument_id: "005930".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 5, day).unwrap(),
            open: close - 1.0,
            high: close + 1.0,
            low: close - 2.0,
            close,
            volume: 10_000 + day as u64,
        }
    }

    fn screened(id: &str, rank: u32) -> ScreenedInstrument {
        ScreenedInstrument {
            instrument_id: id.to_string(),
            display_name: format!("Name {}", id),
            market_cap: 1e12 / rank as f64,
            fundamental_score: 60.0,
            technical_flags: vec![TechnicalFlag::RsiBelowThreshold, TechnicalFlag::RecentVolumeSpike],
            rank,
        }
    }

    // =========================================================================
    // Price History Tests
    // =========================================================================

    #[tokio::test]
    async fn test_price_history_replace_and_read() {
        let store = SqliteStore::new_in_memory().unwrap();
        store
            .replace_price_history("005930", &[bar(3, 3.0), bar(1, 1.0), bar(2, 2.0)])
            .await
            .unwrap();

        let bars = store.read_price_history("005930").await.unwrap();
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].close, 1.0);
        assert_eq!(bars[2].close, 3.0);
        assert_eq!(bars[1].volume, 10_002);

        store
            .replace_price_history("005930", &[bar(4, 4.0)])
            .await
            .unwrap();
        let bars = store.read_price_history("005930").await.unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, 4.0);
    }

    #[tokio::test]
    async fn test_price_history_unknown_instrument_is_empty() {
        let store = SqliteStore::new_in_memory().unwrap();
        assert!(store.read_price_history("999999").await.unwrap().is_empty());
    }

    // =========================================================================
    // Fundamentals / Valuation Tests
    // =========================================================================

    #[tokio::test]
    async fn test_fundamentals_and_valuation() {
        let store = SqliteStore::new_in_memory().unwrap();
        assert!(store.read_latest_fundamentals("005930").await.unwrap().is_none());

        store
            .upsert_fundamentals(&FundamentalMetrics {
                instrument_id: "005930".to_string(),
                roe: 12.0,
                debt_ratio: 35.0,
                eps: Some(5_000.0),
                bps: None,
            })
            .unwrap();
        let metrics = store.read_latest_fundamentals("005930").await.unwrap().unwrap();
        assert_eq!(metrics.roe, 12.0);
        assert_eq!(metrics.bps, None);

        store
            .write_valuation(&ValuationRatios {
                instrument_id: "005930".to_string(),
                per: Some(14.0),
                pbr: None,
                price: 70_000.0,
            })
            .await
            .unwrap();
        let ratios = store.read_valuation("005930").await.unwrap().unwrap();
        assert_eq!(ratios.per, Some(14.0));
    }

    // =========================================================================
    // Screened Set Tests
    // =========================================================================

    #[tokio::test]
    async fn test_screened_set_is_replaced_wholesale() {
        let store = SqliteStore::new_in_memory().unwrap();
        store
            .replace_screened_set(&[screened("005930", 1), screened("000660", 2)])
            .await
            .unwrap();
        store
            .replace_screened_set(&[screened("035420", 1)])
            .await
            .unwrap();

        let set = store.read_screened_set().await.unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].instrument_id, "035420");
        assert_eq!(set[0].technical_flags.len(), 2);
    }

    // =========================================================================
    // Universe / Alert Tests
    // =========================================================================

    #[tokio::test]
    async fn test_universe_by_market() {
        let store = SqliteStore::new_in_memory().unwrap();
        let inst = Instrument {
            id: "005930".to_string(),
            name: "Samsung Electronics".to_string(),
            market_cap: 4.3e14,
        };
        store.upsert_instrument("KOSPI", &inst).unwrap();
        store
            .upsert_instrument(
                "KOSDAQ",
                &Instrument {
                    id: "247540".to_string(),
                    name: "Ecopro BM".to_string(),
                    market_cap: 2.0e13,
                },
            )
            .unwrap();

        let kospi = store.list_instruments("KOSPI").await.unwrap();
        assert_eq!(kospi, vec![inst]);
    }

    #[tokio::test]
    async fn test_signal_alert_append() {
        let store = SqliteStore::new_in_memory().unwrap();
        let event = SignalEvent::new(
            "005930",
            SignalKind::RsiExitOverbought,
            SignalPayload {
                price: 105.0,
                rsi: Some(52.1),
                fast_ma: None,
                slow_ma: None,
                volume_ratio: None,
            },
        );
        store.write_signal_alert(&event).await.unwrap();
        assert_eq!(store.count_signal_alerts("005930").unwrap(), 1);
        // Same id twice is rejected
        assert!(store.write_signal_alert(&event).await.is_err());
    }
}
