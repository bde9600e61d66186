//! Persistence (C13): a single SQLite file backing every store seam the rest
//! of the crate defines (`CircuitBreakerStore`, `TradeStore`, `ControllerStore`)
//! plus order/analysis/risk-event history. Schema and pragmas grounded on
//! `original_source/database/schema.py`; WAL mode carried over verbatim.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::info;

use crate::circuit_breaker::CircuitBreakerStore;
use crate::controller::ControllerStore;
use crate::error::Result;
use crate::orchestrator::TradeStore;
use crate::types::{
    CircuitBreakerState, LegRole, OptionLeg, OptionType, Side, Structure, Trade, TradeStatus, TradingMandate,
};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS system_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trades (
    trade_id TEXT PRIMARY KEY,
    strategy TEXT NOT NULL,
    expiry_kind TEXT NOT NULL,
    expiry_date TEXT NOT NULL,
    status TEXT NOT NULL,
    entry_time TEXT NOT NULL,
    exit_time TEXT,
    entry_credit REAL NOT NULL,
    max_loss REAL NOT NULL,
    realized_pnl REAL,
    exit_reason TEXT,
    manual_exit_flag INTEGER NOT NULL DEFAULT 0,
    net_delta REAL NOT NULL DEFAULT 0,
    net_theta REAL NOT NULL DEFAULT 0,
    net_gamma REAL NOT NULL DEFAULT 0,
    net_vega REAL NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS trade_legs (
    leg_id INTEGER PRIMARY KEY AUTOINCREMENT,
    trade_id TEXT NOT NULL REFERENCES trades(trade_id),
    instrument_key TEXT NOT NULL,
    option_type TEXT NOT NULL,
    strike INTEGER NOT NULL,
    side TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    role TEXT NOT NULL,
    reference_premium REAL NOT NULL,
    lot_size INTEGER NOT NULL,
    expiry TEXT NOT NULL,
    order_id TEXT,
    filled_qty INTEGER NOT NULL DEFAULT 0,
    avg_fill_price REAL,
    slippage_pct REAL,
    fill_time TEXT
);

CREATE TABLE IF NOT EXISTS orders (
    order_id TEXT PRIMARY KEY,
    trade_id TEXT REFERENCES trades(trade_id),
    instrument_key TEXT NOT NULL,
    side TEXT NOT NULL,
    order_type TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    limit_price REAL,
    fill_price REAL,
    fill_quantity INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    idempotency_key TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS analysis_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    expiry_kind TEXT NOT NULL,
    regime_name TEXT NOT NULL,
    structure TEXT NOT NULL,
    composite_score REAL NOT NULL,
    mandate_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS risk_events (
    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    event_type TEXT NOT NULL,
    description TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS daily_metrics (
    date TEXT PRIMARY KEY,
    trades_count INTEGER NOT NULL DEFAULT 0,
    winning_trades INTEGER NOT NULL DEFAULT 0,
    losing_trades INTEGER NOT NULL DEFAULT 0,
    realized_pnl REAL NOT NULL DEFAULT 0,
    capital_deployed REAL NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status);
CREATE INDEX IF NOT EXISTS idx_trades_entry_time ON trades(entry_time);
CREATE INDEX IF NOT EXISTS idx_legs_trade_id ON trade_legs(trade_id);
CREATE INDEX IF NOT EXISTS idx_orders_trade_id ON orders(trade_id);
CREATE INDEX IF NOT EXISTS idx_risk_events_timestamp ON risk_events(timestamp);
";

const CIRCUIT_BREAKER_STATE_KEY: &str = "circuit_breaker_state";

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid static date")
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;
        info!(db_path, "sqlite store ready");
        Ok(SqliteStore { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Persists every filled leg of a trade, replacing whatever rows existed for it.
    async fn save_trade_legs(conn: &Connection, trade: &Trade) -> Result<()> {
        conn.execute("DELETE FROM trade_legs WHERE trade_id = ?1", params![trade.trade_id])?;
        for leg in &trade.legs {
            conn.execute(
                "INSERT INTO trade_legs (trade_id, instrument_key, option_type, strike, side, quantity, role,
                    reference_premium, lot_size, expiry, order_id, filled_qty, avg_fill_price, slippage_pct, fill_time)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
                params![
                    trade.trade_id,
                    leg.instrument_key,
                    leg.option_type.as_str(),
                    leg.strike,
                    leg.side.as_str(),
                    leg.quantity,
                    leg_role_str(leg.role),
                    leg.reference_premium,
                    leg.lot_size,
                    leg.expiry.to_string(),
                    leg.order_id,
                    leg.filled_qty,
                    leg.avg_fill_price,
                    leg.slippage_pct,
                    leg.fill_time.map(|t| t.to_rfc3339()),
                ],
            )?;
        }
        Ok(())
    }

    fn load_trade_legs(conn: &Connection, trade_id: &str) -> Result<Vec<OptionLeg>> {
        let mut stmt = conn.prepare(
            "SELECT instrument_key, option_type, strike, side, quantity, role, reference_premium, lot_size,
                    expiry, order_id, filled_qty, avg_fill_price, slippage_pct, fill_time
             FROM trade_legs WHERE trade_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![trade_id], |row| {
                let option_type: String = row.get(1)?;
                let side: String = row.get(3)?;
                let role: String = row.get(5)?;
                let expiry: String = row.get(8)?;
                let fill_time: Option<String> = row.get(13)?;
                Ok(OptionLeg {
                    instrument_key: row.get(0)?,
                    option_type: parse_option_type(&option_type),
                    strike: row.get(2)?,
                    side: parse_side(&side),
                    quantity: row.get(4)?,
                    role: parse_leg_role(&role),
                    reference_premium: row.get(6)?,
                    lot_size: row.get(7)?,
                    expiry: NaiveDate::parse_from_str(&expiry, "%Y-%m-%d").unwrap_or_else(|_| epoch()),
                    order_id: row.get(9)?,
                    filled_qty: row.get(10)?,
                    avg_fill_price: row.get(11)?,
                    slippage_pct: row.get(12)?,
                    fill_time: fill_time.and_then(|t| DateTime::parse_from_rfc3339(&t).ok()).map(|t| t.with_timezone(&Utc)),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn row_to_trade(conn: &Connection, row: &rusqlite::Row) -> rusqlite::Result<Trade> {
        let trade_id: String = row.get(0)?;
        let strategy: String = row.get(1)?;
        let expiry_kind: String = row.get(2)?;
        let expiry_date: String = row.get(3)?;
        let status: String = row.get(4)?;
        let entry_time: String = row.get(5)?;
        let exit_time: Option<String> = row.get(6)?;

        let legs = Self::load_trade_legs(conn, &trade_id).unwrap_or_default();

        Ok(Trade {
            trade_id,
            strategy: parse_structure(&strategy),
            expiry_kind: parse_expiry_kind(&expiry_kind),
            expiry_date: NaiveDate::parse_from_str(&expiry_date, "%Y-%m-%d").unwrap_or_else(|_| epoch()),
            status: parse_trade_status(&status),
            entry_time: DateTime::parse_from_rfc3339(&entry_time).map(|t| t.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
            legs,
            entry_credit: row.get(7)?,
            max_loss: row.get(8)?,
            realized_pnl: row.get(9)?,
            exit_time: exit_time.and_then(|t| DateTime::parse_from_rfc3339(&t).ok()).map(|t| t.with_timezone(&Utc)),
            exit_reason: row.get(10)?,
            manual_exit_flag: row.get::<_, i64>(11)? != 0,
            net_delta: row.get(12)?,
            net_theta: row.get(13)?,
            net_gamma: row.get(14)?,
            net_vega: row.get(15)?,
        })
    }

    /// Logs a free-form risk event row (circuit breaker trips/resets, risk-gate rejections).
    pub async fn record_risk_event(&self, event_type: &str, description: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO risk_events (timestamp, event_type, description) VALUES (?1, ?2, ?3)",
            params![Utc::now().to_rfc3339(), event_type, description],
        )?;
        Ok(())
    }

    /// Rolls up today's closed trades into the `daily_metrics` row, called after every exit.
    pub async fn roll_up_daily_metrics(&self, today: NaiveDate) -> Result<()> {
        let conn = self.conn.lock().await;
        let day_str = today.to_string();
        let (count, wins, losses, pnl): (i64, i64, i64, f64) = conn.query_row(
            "SELECT COUNT(*),
                    SUM(CASE WHEN realized_pnl > 0 THEN 1 ELSE 0 END),
                    SUM(CASE WHEN realized_pnl <= 0 THEN 1 ELSE 0 END),
                    COALESCE(SUM(realized_pnl), 0)
             FROM trades WHERE status = 'CLOSED' AND date(entry_time) = ?1",
            params![day_str],
            |row| Ok((row.get(0)?, row.get::<_, Option<i64>>(1)?.unwrap_or(0), row.get::<_, Option<i64>>(2)?.unwrap_or(0), row.get(3)?)),
        )?;

        conn.execute(
            "INSERT INTO daily_metrics (date, trades_count, winning_trades, losing_trades, realized_pnl)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(date) DO UPDATE SET trades_count=?2, winning_trades=?3, losing_trades=?4, realized_pnl=?5",
            params![day_str, count, wins, losses, pnl],
        )?;
        Ok(())
    }

    pub async fn list_trade_history(&self, limit: u32) -> Result<Vec<Trade>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT trade_id, strategy, expiry_kind, expiry_date, status, entry_time, exit_time,
                    entry_credit, max_loss, realized_pnl, exit_time, exit_reason, manual_exit_flag,
                    net_delta, net_theta, net_gamma, net_vega
             FROM trades ORDER BY entry_time DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| Self::row_to_trade(&conn, row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Trade history filtered by status and lookback window, as the `/api/trades/history` route needs.
    pub async fn list_trade_history_filtered(&self, status: Option<&str>, since: DateTime<Utc>) -> Result<Vec<Trade>> {
        let conn = self.conn.lock().await;
        let since_str = since.to_rfc3339();
        let rows = match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT trade_id, strategy, expiry_kind, expiry_date, status, entry_time, exit_time,
                            entry_credit, max_loss, realized_pnl, exit_time, exit_reason, manual_exit_flag,
                            net_delta, net_theta, net_gamma, net_vega
                     FROM trades WHERE status = ?1 AND entry_time >= ?2 ORDER BY entry_time DESC",
                )?;
                stmt.query_map(params![status, since_str], |row| Self::row_to_trade(&conn, row))?.collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT trade_id, strategy, expiry_kind, expiry_date, status, entry_time, exit_time,
                            entry_credit, max_loss, realized_pnl, exit_time, exit_reason, manual_exit_flag,
                            net_delta, net_theta, net_gamma, net_vega
                     FROM trades WHERE entry_time >= ?1 ORDER BY entry_time DESC",
                )?;
                stmt.query_map(params![since_str], |row| Self::row_to_trade(&conn, row))?.collect::<std::result::Result<Vec<_>, _>>()?
            }
        };
        Ok(rows)
    }

    /// A single open or closed trade by id, for `/api/positions/{trade_id}` and exit routes.
    pub async fn find_trade(&self, trade_id: &str) -> Result<Option<Trade>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT trade_id, strategy, expiry_kind, expiry_date, status, entry_time, exit_time,
                    entry_credit, max_loss, realized_pnl, exit_time, exit_reason, manual_exit_flag,
                    net_delta, net_theta, net_gamma, net_vega
             FROM trades WHERE trade_id = ?1",
        )?;
        let trade = stmt.query_row(params![trade_id], |row| Self::row_to_trade(&conn, row)).optional()?;
        Ok(trade)
    }

    /// Most recently persisted mandate across all expiry kinds, for `/api/analysis/latest`.
    pub async fn latest_mandate(&self) -> Result<Option<(DateTime<Utc>, TradingMandate)>> {
        let conn = self.conn.lock().await;
        let row: Option<(String, String)> = conn
            .query_row("SELECT timestamp, mandate_json FROM analysis_history ORDER BY id DESC LIMIT 1", [], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        Ok(match row {
            Some((timestamp, mandate_json)) => {
                let mandate: TradingMandate = serde_json::from_str(&mandate_json)?;
                let ts = DateTime::parse_from_rfc3339(&timestamp).map(|t| t.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now());
                Some((ts, mandate))
            }
            None => None,
        })
    }
}

#[async_trait]
impl CircuitBreakerStore for SqliteStore {
    async fn load_circuit_breaker_state(&self) -> Result<Option<CircuitBreakerState>> {
        let conn = self.conn.lock().await;
        let value: Option<String> = conn
            .query_row("SELECT value FROM system_state WHERE key = ?1", params![CIRCUIT_BREAKER_STATE_KEY], |row| row.get(0))
            .optional()?;
        Ok(value.and_then(|v| serde_json::from_str(&v).ok()))
    }

    async fn save_circuit_breaker_state(&self, state: &CircuitBreakerState) -> Result<()> {
        let conn = self.conn.lock().await;
        let value = serde_json::to_string(state)?;
        conn.execute(
            "INSERT INTO system_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value=?2, updated_at=?3",
            params![CIRCUIT_BREAKER_STATE_KEY, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

#[async_trait]
impl TradeStore for SqliteStore {
    async fn list_open_trades(&self) -> Result<Vec<Trade>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT trade_id, strategy, expiry_kind, expiry_date, status, entry_time, exit_time,
                    entry_credit, max_loss, realized_pnl, exit_time, exit_reason, manual_exit_flag,
                    net_delta, net_theta, net_gamma, net_vega
             FROM trades WHERE status IN ('OPEN', 'CLOSING')",
        )?;
        let rows = stmt
            .query_map([], |row| Self::row_to_trade(&conn, row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn save_trade(&self, trade: &Trade) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO trades (trade_id, strategy, expiry_kind, expiry_date, status, entry_time, exit_time,
                entry_credit, max_loss, realized_pnl, exit_reason, manual_exit_flag, net_delta, net_theta, net_gamma, net_vega)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)
             ON CONFLICT(trade_id) DO UPDATE SET
                status=?5, exit_time=?7, realized_pnl=?10, exit_reason=?11, manual_exit_flag=?12,
                net_delta=?13, net_theta=?14, net_gamma=?15, net_vega=?16",
            params![
                trade.trade_id,
                trade.strategy.as_str(),
                trade.expiry_kind.as_str(),
                trade.expiry_date.to_string(),
                trade_status_str(trade.status),
                trade.entry_time.to_rfc3339(),
                trade.exit_time.map(|t| t.to_rfc3339()),
                trade.entry_credit,
                trade.max_loss,
                trade.realized_pnl,
                trade.exit_reason,
                trade.manual_exit_flag as i64,
                trade.net_delta,
                trade.net_theta,
                trade.net_gamma,
                trade.net_vega,
            ],
        )?;
        Self::save_trade_legs(&conn, trade).await?;
        Ok(())
    }
}

#[async_trait]
impl ControllerStore for SqliteStore {
    async fn save_mandate(&self, mandate: &TradingMandate) -> Result<()> {
        let conn = self.conn.lock().await;
        let mandate_json = serde_json::to_string(mandate)?;
        conn.execute(
            "INSERT INTO analysis_history (timestamp, expiry_kind, regime_name, structure, composite_score, mandate_json)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                Utc::now().to_rfc3339(),
                mandate.expiry_kind.as_str(),
                mandate.regime_name,
                mandate.structure.as_str(),
                mandate.score.composite,
                mandate_json,
            ],
        )?;
        Ok(())
    }

    async fn count_trades_today(&self) -> Result<u32> {
        let conn = self.conn.lock().await;
        let today = Utc::now().date_naive().to_string();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM trades WHERE date(entry_time) = ?1", params![today], |row| row.get(0))?;
        Ok(count as u32)
    }

    async fn deployed_capital(&self) -> Result<f64> {
        let conn = self.conn.lock().await;
        let capital: f64 = conn.query_row(
            "SELECT COALESCE(SUM(entry_credit), 0) FROM trades WHERE status IN ('OPEN', 'CLOSING')",
            [],
            |row| row.get(0),
        )?;
        Ok(capital)
    }

    async fn deployed_contracts(&self) -> Result<i32> {
        let conn = self.conn.lock().await;
        let contracts: i64 = conn.query_row(
            "SELECT COALESCE(SUM(tl.quantity), 0) FROM trade_legs tl
             JOIN trades t ON t.trade_id = tl.trade_id WHERE t.status IN ('OPEN', 'CLOSING')",
            [],
            |row| row.get(0),
        )?;
        Ok(contracts as i32)
    }

    async fn current_capital(&self) -> Result<f64> {
        let conn = self.conn.lock().await;
        let realized: f64 = conn.query_row("SELECT COALESCE(SUM(realized_pnl), 0) FROM trades WHERE status = 'CLOSED'", [], |row| row.get(0))?;
        let value: Option<String> = conn
            .query_row("SELECT value FROM system_state WHERE key = ?1", params![CIRCUIT_BREAKER_STATE_KEY], |row| row.get(0))
            .optional()?;
        let base = value
            .and_then(|v| serde_json::from_str::<CircuitBreakerState>(&v).ok())
            .map(|s| s.peak_capital)
            .unwrap_or(0.0);
        Ok(base + realized)
    }
}

fn leg_role_str(role: LegRole) -> &'static str {
    match role {
        LegRole::Core => "CORE",
        LegRole::Hedge => "HEDGE",
    }
}

fn parse_leg_role(s: &str) -> LegRole {
    match s {
        "HEDGE" => LegRole::Hedge,
        _ => LegRole::Core,
    }
}

fn parse_option_type(s: &str) -> OptionType {
    match s {
        "PE" => OptionType::Put,
        _ => OptionType::Call,
    }
}

fn parse_side(s: &str) -> Side {
    match s {
        "SELL" => Side::Sell,
        _ => Side::Buy,
    }
}

fn parse_structure(s: &str) -> Structure {
    match s {
        "IRON_FLY" => Structure::IronFly,
        "IRON_CONDOR" => Structure::IronCondor,
        "BULL_PUT_SPREAD" => Structure::BullPutSpread,
        "BEAR_CALL_SPREAD" => Structure::BearCallSpread,
        "CREDIT_SPREAD" => Structure::CreditSpread,
        _ => Structure::NoTrade,
    }
}

fn parse_expiry_kind(s: &str) -> crate::types::ExpiryKind {
    match s {
        "MONTHLY" => crate::types::ExpiryKind::Monthly,
        "NEXT_WEEKLY" => crate::types::ExpiryKind::NextWeekly,
        _ => crate::types::ExpiryKind::Weekly,
    }
}

fn parse_trade_status(s: &str) -> TradeStatus {
    match s {
        "OPEN" => TradeStatus::Open,
        "CLOSING" => TradeStatus::Closing,
        "CLOSED" => TradeStatus::Closed,
        "FAILED" => TradeStatus::Failed,
        _ => TradeStatus::Pending,
    }
}

fn trade_status_str(status: TradeStatus) -> &'static str {
    match status {
        TradeStatus::Pending => "PENDING",
        TradeStatus::Open => "OPEN",
        TradeStatus::Closing => "CLOSING",
        TradeStatus::Closed => "CLOSED",
        TradeStatus::Failed => "FAILED",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExpiryKind, Score, Confidence};

    fn sample_trade(id: &str) -> Trade {
        Trade {
            trade_id: id.to_string(),
            strategy: Structure::IronCondor,
            expiry_kind: ExpiryKind::Weekly,
            expiry_date: NaiveDate::from_ymd_opt(2026, 8, 7).unwrap(),
            status: TradeStatus::Open,
            entry_time: Utc::now(),
            legs: vec![OptionLeg {
                instrument_key: "NSE|NIFTY24AUG24000CE".to_string(),
                option_type: OptionType::Call,
                strike: 24000,
                side: Side::Sell,
                quantity: 50,
                role: LegRole::Core,
                reference_premium: 120.0,
                lot_size: 50,
                expiry: NaiveDate::from_ymd_opt(2026, 8, 7).unwrap(),
                order_id: Some("o1".to_string()),
                filled_qty: 50,
                avg_fill_price: Some(118.0),
                slippage_pct: Some(0.016),
                fill_time: Some(Utc::now()),
            }],
            entry_credit: 5900.0,
            max_loss: 20000.0,
            realized_pnl: None,
            exit_time: None,
            exit_reason: None,
            manual_exit_flag: false,
            net_delta: -5.0,
            net_theta: -20.0,
            net_gamma: 0.1,
            net_vega: -8.0,
        }
    }

    #[tokio::test]
    async fn round_trips_a_trade_with_its_legs() {
        let store = SqliteStore::open(":memory:").unwrap();
        let trade = sample_trade("t1");
        store.save_trade(&trade).await.unwrap();

        let open = store.list_open_trades().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].legs.len(), 1);
        assert_eq!(open[0].legs[0].instrument_key, "NSE|NIFTY24AUG24000CE");
    }

    #[tokio::test]
    async fn closed_trades_drop_out_of_list_open_trades() {
        let store = SqliteStore::open(":memory:").unwrap();
        let mut trade = sample_trade("t2");
        trade.status = TradeStatus::Closed;
        trade.realized_pnl = Some(1200.0);
        store.save_trade(&trade).await.unwrap();

        assert!(store.list_open_trades().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn circuit_breaker_state_round_trips() {
        let store = SqliteStore::open(":memory:").unwrap();
        assert!(store.load_circuit_breaker_state().await.unwrap().is_none());

        let state = CircuitBreakerState {
            consecutive_losses: 2,
            peak_capital: 1_000_000.0,
            trip_reason: Some("test".to_string()),
            trip_until: Some(Utc::now()),
            daily_slippage_event_count: 1,
            day_key: Utc::now().date_naive(),
        };
        store.save_circuit_breaker_state(&state).await.unwrap();
        let loaded = store.load_circuit_breaker_state().await.unwrap().unwrap();
        assert_eq!(loaded.consecutive_losses, 2);
    }

    #[tokio::test]
    async fn deployed_capital_sums_only_open_trades() {
        let store = SqliteStore::open(":memory:").unwrap();
        store.save_trade(&sample_trade("t3")).await.unwrap();
        let mut closed = sample_trade("t4");
        closed.status = TradeStatus::Closed;
        closed.realized_pnl = Some(-500.0);
        store.save_trade(&closed).await.unwrap();

        assert_eq!(store.deployed_capital().await.unwrap(), 5900.0);
    }

    #[tokio::test]
    async fn save_mandate_is_queryable_via_history_count() {
        let store = SqliteStore::open(":memory:").unwrap();
        let mandate = TradingMandate {
            expiry_kind: ExpiryKind::Weekly,
            regime_name: "neutral-stable".to_string(),
            structure: Structure::IronCondor,
            directional_bias: crate::types::DirectionalBias::Neutral,
            allocation_pct: 0.1,
            deployment_amount: 50_000.0,
            max_lots: 4,
            score: Score { vol: 5.0, struct_: 5.0, edge: 5.0, risk: 5.0, composite: 5.0, confidence: Confidence::Moderate, score_stability: 0.8, drivers: vec![] },
            rationale: vec![],
            warnings: vec![],
            veto_reasons: vec![],
        };
        store.save_mandate(&mandate).await.unwrap();

        let conn = store.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM analysis_history", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 1);
    }
}
