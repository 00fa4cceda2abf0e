//! Database schema definitions

/// SQL to create all tables.
/// `metrics` and `parameters` are JSON objects; non-finite metric values are
/// stored as the strings "inf", "-inf" and "nan".
pub const CREATE_TABLES: &str = r#"
-- Exported strategy reports, one row per distinct strategy/parameters/period
CREATE TABLE IF NOT EXISTS strategy_reports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    params_hash TEXT NOT NULL UNIQUE,
    strategy_id TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'backtest',
    parameters TEXT NOT NULL DEFAULT '{}',
    metrics TEXT NOT NULL DEFAULT '{}',
    period_start INTEGER NOT NULL,
    period_end INTEGER NOT NULL,
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_reports_strategy ON strategy_reports(strategy_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_reports_kind ON strategy_reports(kind)
"#;
