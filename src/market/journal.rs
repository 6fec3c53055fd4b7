//! Crash-recovery journal, periodic checkpoints, and immutable trade/
//! settlement audit logs.
//!
//! Grounded on `backtest_v2::trade_recorder`'s storage shape: a
//! `rusqlite::Connection` behind a `parking_lot::Mutex`, schema created with
//! `execute_batch` on open, and a WAL-mode pragma block for durability
//! without serializing every writer against a slow fsync. Unlike the trade
//! recorder this module has no background buffered writer — journal
//! entries gate recovery correctness, so they are written synchronously on
//! the market writer's hot path rather than batched.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::market::types::{Amount, MarketId, Order, Trade, UserId};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS command_journal (
    market_id INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    recorded_at_ns INTEGER NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    PRIMARY KEY (market_id, seq)
);

CREATE TABLE IF NOT EXISTS markets (
    market_id INTEGER PRIMARY KEY,
    created_at_ns INTEGER NOT NULL,
    definition TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoints (
    market_id INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    taken_at_ns INTEGER NOT NULL,
    state TEXT NOT NULL,
    PRIMARY KEY (market_id, seq)
);

CREATE TABLE IF NOT EXISTS trade_log (
    trade_id INTEGER PRIMARY KEY,
    market_id INTEGER NOT NULL,
    outcome INTEGER NOT NULL,
    buyer_user_id INTEGER NOT NULL,
    seller_user_id INTEGER NOT NULL,
    price_ticks INTEGER NOT NULL,
    size INTEGER NOT NULL,
    timestamp_ns INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_trade_log_market ON trade_log(market_id, timestamp_ns);

CREATE TABLE IF NOT EXISTS settlement_log (
    market_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    payout INTEGER NOT NULL,
    settled_at_ns INTEGER NOT NULL,
    PRIMARY KEY (market_id, user_id)
);
"#;

/// One accepted command, as it is about to be (or was) applied to a
/// market's engine. Recovery replays these in `seq` order against the
/// engine state captured by the most recent checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JournalRecord {
    Submit { order: Order, accredited: bool },
    Cancel { order_id: crate::market::types::OrderId },
    Transition { target: crate::market::types::MarketState, resolution: Option<crate::market::types::Resolution> },
    AddLiquidity { provider: UserId, amounts: Vec<Amount> },
    RemoveLiquidity { provider: UserId, shares: Amount },
}

impl JournalRecord {
    fn kind(&self) -> &'static str {
        match self {
            JournalRecord::Submit { .. } => "submit",
            JournalRecord::Cancel { .. } => "cancel",
            JournalRecord::Transition { .. } => "transition",
            JournalRecord::AddLiquidity { .. } => "add_liquidity",
            JournalRecord::RemoveLiquidity { .. } => "remove_liquidity",
        }
    }
}

/// Append-only per-market command log, periodic engine-state checkpoints,
/// and the immutable trade/settlement audit trail. One instance backs every
/// market; rows are partitioned by `market_id`.
pub struct Journal {
    conn: Arc<Mutex<Connection>>,
}

impl Journal {
    pub fn open(db_path: &str) -> rusqlite::Result<Self> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            if !parent.exists() && !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                        Some(e.to_string()),
                    )
                })?;
            }
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Append one accepted command. Called from the market writer after a
    /// command has passed risk checks but before it mutates engine state,
    /// so a crash after this call and before the in-memory mutation is
    /// indistinguishable from a crash after it: replay just re-applies.
    pub fn append(&self, market_id: MarketId, seq: u64, recorded_at_ns: i64, record: &JournalRecord) -> rusqlite::Result<()> {
        let payload = serde_json::to_string(record).expect("JournalRecord serialization cannot fail");
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO command_journal (market_id, seq, recorded_at_ns, kind, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![market_id, seq as i64, recorded_at_ns, record.kind(), payload],
        )?;
        Ok(())
    }

    /// Persists a market's static definition (kind, engine configs, ...) the
    /// one time it's created, so a restarted process can discover which
    /// markets to rebuild before any command or checkpoint exists for them.
    pub fn save_market_definition(&self, market_id: MarketId, created_at_ns: i64, definition: &str) -> rusqlite::Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO markets (market_id, created_at_ns, definition) VALUES (?1, ?2, ?3)",
            params![market_id, created_at_ns, definition],
        )?;
        Ok(())
    }

    /// Every market id with a persisted definition, ascending. Startup
    /// recovery walks this list to know what to rebuild.
    pub fn list_market_ids(&self) -> rusqlite::Result<Vec<MarketId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT market_id FROM markets ORDER BY market_id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, MarketId>(0))?;
        rows.collect()
    }

    pub fn load_market_definition(&self, market_id: MarketId) -> rusqlite::Result<Option<String>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT definition FROM markets WHERE market_id = ?1",
            params![market_id],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(definition) => Ok(Some(definition)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Load every journalled command for `market_id` with `seq > after_seq`,
    /// in ascending `seq` order, for replay on top of the checkpoint taken
    /// at `after_seq`.
    pub fn load_since(&self, market_id: MarketId, after_seq: u64) -> rusqlite::Result<Vec<(u64, JournalRecord)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, payload FROM command_journal WHERE market_id = ?1 AND seq > ?2 ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![market_id, after_seq as i64], |row| {
                let seq: i64 = row.get(0)?;
                let payload: String = row.get(1)?;
                Ok((seq as u64, payload))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(seq, payload)| (seq, serde_json::from_str(&payload).expect("journal payload is always well-formed JSON")))
            .collect())
    }

    /// Persist a serialized engine-state snapshot as of `seq`. The caller
    /// owns the snapshot format (book contents, AMM reserves, ledger
    /// balances); the journal only stores and retrieves the blob.
    pub fn save_checkpoint(&self, market_id: MarketId, seq: u64, taken_at_ns: i64, state: &str) -> rusqlite::Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO checkpoints (market_id, seq, taken_at_ns, state) VALUES (?1, ?2, ?3, ?4)",
            params![market_id, seq as i64, taken_at_ns, state],
        )?;
        Ok(())
    }

    /// Most recent checkpoint for `market_id`, if any. Recovery loads this
    /// then calls `load_since(market_id, seq)` to replay forward.
    pub fn load_latest_checkpoint(&self, market_id: MarketId) -> rusqlite::Result<Option<(u64, String)>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT seq, state FROM checkpoints WHERE market_id = ?1 ORDER BY seq DESC LIMIT 1",
            params![market_id],
            |row| {
                let seq: i64 = row.get(0)?;
                let state: String = row.get(1)?;
                Ok((seq as u64, state))
            },
        );
        match result {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Append a trade to the immutable trade log. Never updated or deleted;
    /// the row is the settlement-relevant record of what happened.
    pub fn record_trade(&self, trade: &Trade) -> rusqlite::Result<()> {
        self.conn.lock().execute(
            "INSERT OR IGNORE INTO trade_log (trade_id, market_id, outcome, buyer_user_id, seller_user_id, price_ticks, size, timestamp_ns)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                trade.id,
                trade.market_id,
                trade.outcome,
                trade.buyer_user_id,
                trade.seller_user_id,
                trade.price,
                trade.size,
                trade.timestamp_ns,
            ],
        )?;
        Ok(())
    }

    /// Append one settlement audit row. `(market_id, user_id)` is the
    /// primary key, mirroring the Ledger's own idempotence-by-pair
    /// guarantee: a second resolution attempt's audit write is a no-op
    /// `INSERT OR IGNORE`, not a second row.
    pub fn record_settlement(&self, market_id: MarketId, user_id: UserId, payout: Amount, settled_at_ns: i64) -> rusqlite::Result<()> {
        self.conn.lock().execute(
            "INSERT OR IGNORE INTO settlement_log (market_id, user_id, payout, settled_at_ns) VALUES (?1, ?2, ?3, ?4)",
            params![market_id, user_id, payout, settled_at_ns],
        )?;
        Ok(())
    }

    pub fn trade_count(&self, market_id: MarketId) -> rusqlite::Result<u64> {
        self.conn.lock().query_row(
            "SELECT COUNT(*) FROM trade_log WHERE market_id = ?1",
            params![market_id],
            |row| row.get::<_, i64>(0),
        ).map(|n| n as u64)
    }

    pub fn settlement_count(&self, market_id: MarketId) -> rusqlite::Result<u64> {
        self.conn.lock().query_row(
            "SELECT COUNT(*) FROM settlement_log WHERE market_id = ?1",
            params![market_id],
            |row| row.get::<_, i64>(0),
        ).map(|n| n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::{OrderKind, OrderState, Side};

    fn mk_order() -> Order {
        Order {
            id: 1,
            market_id: 1,
            user_id: 1,
            side: Side::Buy,
            outcome: 0,
            kind: OrderKind::Limit,
            price: Some(60),
            size: 100,
            filled_size: 0,
            state: OrderState::Open,
            submit_time_ns: 0,
            last_update_ns: 0,
        }
    }

    #[test]
    fn append_and_replay_in_seq_order() {
        let journal = Journal::open_memory().unwrap();
        journal.append(1, 1, 100, &JournalRecord::Submit { order: mk_order(), accredited: false }).unwrap();
        journal.append(1, 2, 200, &JournalRecord::Cancel { order_id: 1 }).unwrap();

        let replayed = journal.load_since(1, 0).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].0, 1);
        assert_eq!(replayed[1].0, 2);
        assert!(matches!(replayed[1].1, JournalRecord::Cancel { order_id: 1 }));
    }

    #[test]
    fn load_since_skips_entries_before_a_checkpoint() {
        let journal = Journal::open_memory().unwrap();
        for seq in 1..=5u64 {
            journal.append(1, seq, seq as i64, &JournalRecord::Cancel { order_id: seq }).unwrap();
        }
        journal.save_checkpoint(1, 3, 300, "{}").unwrap();

        let (seq, _state) = journal.load_latest_checkpoint(1).unwrap().unwrap();
        assert_eq!(seq, 3);
        let replay = journal.load_since(1, seq).unwrap();
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].0, 4);
    }

    #[test]
    fn journal_entries_are_partitioned_by_market() {
        let journal = Journal::open_memory().unwrap();
        journal.append(1, 1, 0, &JournalRecord::Cancel { order_id: 1 }).unwrap();
        journal.append(2, 1, 0, &JournalRecord::Cancel { order_id: 2 }).unwrap();

        assert_eq!(journal.load_since(1, 0).unwrap().len(), 1);
        assert_eq!(journal.load_since(2, 0).unwrap().len(), 1);
    }

    #[test]
    fn trade_log_is_idempotent_on_replay() {
        let journal = Journal::open_memory().unwrap();
        let trade = Trade {
            id: 1,
            market_id: 1,
            outcome: 0,
            buyer_order_id: 1,
            seller_order_id: 2,
            buyer_user_id: 1,
            seller_user_id: 2,
            price: 60,
            size: 100,
            timestamp_ns: 0,
        };
        journal.record_trade(&trade).unwrap();
        journal.record_trade(&trade).unwrap(); // duplicate replay
        assert_eq!(journal.trade_count(1).unwrap(), 1);
    }

    #[test]
    fn settlement_log_is_idempotent_per_market_user() {
        let journal = Journal::open_memory().unwrap();
        journal.record_settlement(1, 1, 10_000, 0).unwrap();
        journal.record_settlement(1, 1, 10_000, 1).unwrap(); // second attempt, same pair
        assert_eq!(journal.settlement_count(1).unwrap(), 1);
    }

    /// `open_memory` is what every other test in this module uses, so it's
    /// the only path those tests exercise. `open` is what the engine binary
    /// actually calls at startup, and its directory-creation and file-backed
    /// durability behavior is untested without writing to a real path.
    #[test]
    fn open_creates_parent_directories_and_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("engine.db");
        let db_path_str = db_path.to_str().unwrap();

        {
            let journal = Journal::open(db_path_str).unwrap();
            journal.save_market_definition(1, 0, "{}").unwrap();
            journal.append(1, 1, 0, &JournalRecord::Cancel { order_id: 1 }).unwrap();
        }
        assert!(db_path.exists());

        let reopened = Journal::open(db_path_str).unwrap();
        assert_eq!(reopened.list_market_ids().unwrap(), vec![1]);
        assert_eq!(reopened.load_since(1, 0).unwrap().len(), 1);
    }
}
