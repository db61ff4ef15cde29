//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        migrate(conn, current_version)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| StoreError::Internal(format!("Failed to create schema_version table: {}", e)))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StoreError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| StoreError::Internal(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| StoreError::Internal(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(ECONOMY_SCHEMA)
        .map_err(|e| StoreError::Internal(format!("Failed to create economy tables: {}", e)))?;

    conn.execute_batch(IDENTITY_SCHEMA)
        .map_err(|e| StoreError::Internal(format!("Failed to create identity tables: {}", e)))?;

    conn.execute_batch(AUDIT_SCHEMA)
        .map_err(|e| StoreError::Internal(format!("Failed to create audit tables: {}", e)))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| StoreError::Internal(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

fn migrate(conn: &Connection, from_version: i32) -> Result<(), StoreError> {
    if from_version < 2 {
        // v2: one claim per (code, claimant)
        conn.execute_batch(
            "DROP INDEX IF EXISTS idx_claims_code_claimant;
             CREATE UNIQUE INDEX IF NOT EXISTS idx_claims_code_claimant_once ON claims(code, claimant_id);",
        )
        .map_err(|e| StoreError::Internal(format!("Failed to migrate claims index: {}", e)))?;
    }
    Ok(())
}

/// Codes, claims, trades, balances
const ECONOMY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS codes (
    code TEXT PRIMARY KEY NOT NULL,
    -- Original issuer; never changes
    owner_id TEXT NOT NULL,
    -- Current holder; moved by claims and trades
    holder_id TEXT NOT NULL,

    -- Issuance identity (NULL when the signal was unavailable)
    fingerprint TEXT,
    ip TEXT,
    country TEXT,

    status TEXT NOT NULL DEFAULT 'unused',
    value INTEGER NOT NULL DEFAULT 10,

    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    used_at TEXT
);

CREATE TABLE IF NOT EXISTS claims (
    id TEXT PRIMARY KEY NOT NULL,
    code TEXT NOT NULL,
    claimant_id TEXT NOT NULL,
    reason TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',

    -- JSON array of tagged findings
    findings_json TEXT NOT NULL DEFAULT '[]',
    resolution_notes TEXT,
    resolved_by TEXT,

    created_at TEXT NOT NULL,
    resolved_at TEXT
);

CREATE TABLE IF NOT EXISTS trades (
    id TEXT PRIMARY KEY NOT NULL,
    code TEXT NOT NULL,
    from_user TEXT NOT NULL,
    to_user TEXT NOT NULL,
    from_fingerprint TEXT,
    to_fingerprint TEXT,
    from_ip TEXT,
    to_ip TEXT,
    status TEXT NOT NULL,

    findings_json TEXT NOT NULL DEFAULT '[]',
    resolution_notes TEXT,

    created_at TEXT NOT NULL,
    resolved_at TEXT
);

CREATE TABLE IF NOT EXISTS balances (
    user_id TEXT PRIMARY KEY NOT NULL,
    balance INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS balance_transactions (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    amount INTEGER NOT NULL,
    balance_after INTEGER NOT NULL,
    code TEXT,
    created_at TEXT NOT NULL
);
"#;

/// Identity signals, user status, animal transfers, chat, watch sessions
const IDENTITY_SCHEMA: &str = r#"
-- One current signal per user, latest write wins
CREATE TABLE IF NOT EXISTS identity_signals (
    user_id TEXT PRIMARY KEY NOT NULL,
    fingerprint TEXT NOT NULL,
    ip TEXT NOT NULL,
    country TEXT,
    isp TEXT,
    is_vpn INTEGER NOT NULL DEFAULT 0,
    region_locked_to TEXT,
    updated_at TEXT NOT NULL
);

-- First country ever observed for a fingerprint; written once
CREATE TABLE IF NOT EXISTS region_locks (
    fingerprint TEXT PRIMARY KEY NOT NULL,
    country TEXT NOT NULL,
    first_seen_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_status (
    user_id TEXT PRIMARY KEY NOT NULL,
    is_animal INTEGER NOT NULL DEFAULT 0,
    animal_since TEXT,
    animal_level TEXT,
    banned INTEGER NOT NULL DEFAULT 0,
    ban_reason TEXT,
    banned_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS animal_transfers (
    id TEXT PRIMARY KEY NOT NULL,
    from_user TEXT NOT NULL,
    to_user TEXT NOT NULL,
    from_fingerprint TEXT,
    to_fingerprint TEXT,
    status TEXT NOT NULL DEFAULT 'completed',
    rejection_reason TEXT,
    created_at TEXT NOT NULL,
    processed_at TEXT
);

CREATE TABLE IF NOT EXISTS chat_messages (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    content TEXT NOT NULL,
    fingerprint TEXT,
    ip TEXT,
    country TEXT,
    is_vpn INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'visible',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS watch_sessions (
    user_id TEXT NOT NULL,
    video_id TEXT NOT NULL,
    watch_minutes INTEGER NOT NULL DEFAULT 0,
    fingerprint TEXT,
    ip TEXT,
    country TEXT,
    is_headless INTEGER NOT NULL DEFAULT 0,
    last_interaction TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, video_id)
);
"#;

/// Append-only audit trail
const AUDIT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS violations (
    id TEXT PRIMARY KEY NOT NULL,
    kind TEXT NOT NULL,
    subject_ids_json TEXT NOT NULL,
    details_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS arbiter_decisions (
    id TEXT PRIMARY KEY NOT NULL,
    claim_id TEXT NOT NULL,
    claimant_id TEXT NOT NULL,
    code TEXT NOT NULL,
    arbiter_id TEXT NOT NULL,
    approved INTEGER NOT NULL,
    reason TEXT NOT NULL,
    confidence REAL NOT NULL,
    raw_output TEXT,
    failure TEXT,
    evidence_digest TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_codes_owner ON codes(owner_id);
CREATE INDEX IF NOT EXISTS idx_codes_holder ON codes(holder_id);
CREATE INDEX IF NOT EXISTS idx_claims_status ON claims(status, created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_claims_code_claimant_once ON claims(code, claimant_id);
CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status, created_at);
CREATE INDEX IF NOT EXISTS idx_trades_from ON trades(from_user, created_at);
CREATE INDEX IF NOT EXISTS idx_trades_to ON trades(to_user, created_at);
CREATE INDEX IF NOT EXISTS idx_transfers_from ON animal_transfers(from_user, created_at);
CREATE INDEX IF NOT EXISTS idx_transfers_to ON animal_transfers(to_user, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_fingerprint ON chat_messages(fingerprint);
CREATE INDEX IF NOT EXISTS idx_messages_user ON chat_messages(user_id);
CREATE INDEX IF NOT EXISTS idx_violations_kind ON violations(kind, created_at);
CREATE INDEX IF NOT EXISTS idx_decisions_claimant ON arbiter_decisions(claimant_id, created_at);
"#;
