/// Durable schema: append-only event log plus one table per aggregate.
/// Uniqueness indexes and check constraints here are contract, not tuning;
/// the startup gate refuses to boot if any of them is missing.
use rusqlite::Connection;

use crate::error::{EngineError, Result};

pub const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    scope TEXT NOT NULL,
    user_id TEXT,
    user_broker_id TEXT,
    signal_id TEXT,
    intent_id TEXT,
    trade_id TEXT,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_scope
    ON events(scope, user_id, user_broker_id, seq);

CREATE TABLE IF NOT EXISTS candles (
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    start_time TEXT NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume INTEGER NOT NULL,
    PRIMARY KEY (symbol, timeframe, start_time)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS signals (
    signal_id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    direction TEXT NOT NULL,
    confluence TEXT NOT NULL,
    score REAL NOT NULL,
    strength TEXT NOT NULL,
    htf_low REAL NOT NULL,
    htf_high REAL NOT NULL,
    itf_low REAL NOT NULL,
    itf_high REAL NOT NULL,
    ltf_low REAL NOT NULL,
    ltf_high REAL NOT NULL,
    effective_floor REAL NOT NULL CHECK (effective_floor = ROUND(effective_floor, 2)),
    effective_ceiling REAL NOT NULL CHECK (effective_ceiling = ROUND(effective_ceiling, 2)),
    ref_price REAL NOT NULL,
    p_win REAL NOT NULL,
    kelly REAL NOT NULL,
    generated_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    status TEXT NOT NULL,
    signal_day TEXT NOT NULL
) WITHOUT ROWID;

CREATE UNIQUE INDEX IF NOT EXISTS idx_signals_identity
    ON signals(symbol, confluence, signal_day, effective_floor, effective_ceiling)
    WHERE status = 'PUBLISHED';

CREATE INDEX IF NOT EXISTS idx_signals_status ON signals(status, expires_at);

CREATE TABLE IF NOT EXISTS signal_deliveries (
    delivery_id TEXT PRIMARY KEY,
    signal_id TEXT NOT NULL,
    user_broker_id TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE UNIQUE INDEX IF NOT EXISTS idx_deliveries_identity
    ON signal_deliveries(signal_id, user_broker_id);

CREATE INDEX IF NOT EXISTS idx_deliveries_status ON signal_deliveries(status);

CREATE TABLE IF NOT EXISTS trade_intents (
    intent_id TEXT PRIMARY KEY,
    signal_id TEXT NOT NULL,
    user_broker_id TEXT NOT NULL,
    validation_passed INTEGER NOT NULL,
    approved_qty INTEGER NOT NULL,
    order_type TEXT NOT NULL,
    limit_price REAL,
    product_type TEXT NOT NULL,
    rejection_reasons TEXT NOT NULL,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_intents_signal ON trade_intents(signal_id);

CREATE TABLE IF NOT EXISTS trades (
    trade_id TEXT PRIMARY KEY,
    intent_id TEXT NOT NULL,
    client_order_id TEXT NOT NULL,
    broker_order_id TEXT,
    user_id TEXT NOT NULL,
    user_broker_id TEXT NOT NULL,
    signal_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    direction TEXT NOT NULL,
    trade_number INTEGER NOT NULL,
    status TEXT NOT NULL,
    entry_price REAL,
    entry_qty INTEGER NOT NULL,
    entry_value REAL,
    entry_timestamp TEXT,
    exit_target_price REAL NOT NULL,
    exit_stop_price REAL NOT NULL,
    trailing_active INTEGER NOT NULL DEFAULT 0,
    trailing_extremum REAL,
    trailing_stop_price REAL,
    exit_price REAL,
    exit_timestamp TEXT,
    exit_reason TEXT,
    realized_pnl REAL,
    realized_log_return REAL,
    last_broker_update_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    row_version INTEGER NOT NULL DEFAULT 1,
    CHECK (status <> 'OPEN' OR entry_price IS NOT NULL),
    CHECK (status <> 'CLOSED' OR (exit_price IS NOT NULL AND realized_pnl IS NOT NULL))
) WITHOUT ROWID;

CREATE UNIQUE INDEX IF NOT EXISTS idx_trades_intent ON trades(intent_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_trades_client_order ON trades(client_order_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_trades_broker_order
    ON trades(broker_order_id) WHERE broker_order_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_trades_symbol_status ON trades(symbol, status);
CREATE INDEX IF NOT EXISTS idx_trades_user_symbol ON trades(user_id, symbol);
CREATE INDEX IF NOT EXISTS idx_trades_broker_status ON trades(user_broker_id, status);

CREATE TABLE IF NOT EXISTS exit_signals (
    exit_signal_id TEXT PRIMARY KEY,
    trade_id TEXT NOT NULL,
    reason TEXT NOT NULL,
    episode_id INTEGER NOT NULL,
    price REAL NOT NULL,
    detected_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE UNIQUE INDEX IF NOT EXISTS idx_exit_signals_identity
    ON exit_signals(trade_id, reason, episode_id);

CREATE TABLE IF NOT EXISTS exit_intents (
    exit_intent_id TEXT PRIMARY KEY,
    exit_signal_id TEXT NOT NULL,
    trade_id TEXT NOT NULL,
    user_broker_id TEXT NOT NULL,
    reason TEXT NOT NULL,
    episode_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    order_type TEXT NOT NULL,
    limit_price REAL,
    client_order_id TEXT NOT NULL,
    broker_order_id TEXT,
    rejection_reasons TEXT NOT NULL,
    placed_at TEXT,
    filled_at TEXT,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE UNIQUE INDEX IF NOT EXISTS idx_exit_intents_identity
    ON exit_intents(trade_id, user_broker_id, reason, episode_id);
CREATE INDEX IF NOT EXISTS idx_exit_intents_status ON exit_intents(status);
"#;

/// Index names the startup gate requires to exist
pub const REQUIRED_INDEXES: [&str; 7] = [
    "idx_signals_identity",
    "idx_deliveries_identity",
    "idx_trades_intent",
    "idx_trades_client_order",
    "idx_trades_broker_order",
    "idx_exit_signals_identity",
    "idx_exit_intents_identity",
];

pub fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

/// Verify the uniqueness contract is present in the live database
pub fn verify_schema(conn: &Connection) -> Result<()> {
    for name in REQUIRED_INDEXES {
        let found: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
            [name],
            |row| row.get(0),
        )?;
        if found == 0 {
            return Err(EngineError::StartupGateFailed(format!(
                "required unique index missing: {}",
                name
            )));
        }
    }
    // Check constraints on stored two-decimal precision live on the signals
    // table; verify the table SQL still carries them.
    let table_sql: String = conn.query_row(
        "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = 'signals'",
        [],
        |row| row.get(0),
    )?;
    if !table_sql.contains("ROUND(effective_floor, 2)")
        || !table_sql.contains("ROUND(effective_ceiling, 2)")
    {
        return Err(EngineError::StartupGateFailed(
            "signals table missing two-decimal check constraints".to_string(),
        ));
    }
    Ok(())
}
