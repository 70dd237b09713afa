//! The internal-state record: a single JSON document in the default column
//! family describing the database identity (coin, per-column versions), its
//! open/closed/inconsistent flag, best height, and per-column statistics.
//!
//! The record is written at open, at close, and whenever the host asks; its
//! per-column version check is what makes incompatible databases fail fast
//! instead of corrupting silently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use rocksdb::ReadOptions;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::BlockDb;
use crate::error::DbError;
use crate::schema::{Column, DB_VERSION, INTERNAL_STATE_KEY, ITERATOR_REFRESH_INTERVAL};

/// Lifecycle flag of the database.
///
/// `Open` found at load time means the previous process did not shut down
/// cleanly; `Inconsistent` means a write path failed midway and the host
/// should repair and resync.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DbState {
    /// Closed cleanly.
    #[default]
    Closed,
    /// Currently open (or crashed while open).
    Open,
    /// A mutation failed midway; repair and resync required.
    Inconsistent,
}

/// Per-column bookkeeping stored in the internal state.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ColumnStats {
    /// Column family name.
    pub name: String,
    /// Schema version the column was written with.
    pub version: u32,
    /// Row count from the last statistics scan (plus live adjustments).
    pub rows: i64,
    /// Total key bytes.
    pub key_bytes: i64,
    /// Total value bytes.
    pub value_bytes: i64,
    /// Unix timestamp of the last update.
    pub updated: i64,
}

/// The internal-state record.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct InternalState {
    /// Coin name; checked at open to prevent cross-coin corruption.
    pub coin: String,
    /// Lifecycle flag.
    pub db_state: DbState,
    /// Best (highest) connected block height.
    pub best_height: u32,
    /// Per-column versions and statistics.
    pub db_columns: Vec<ColumnStats>,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl InternalState {
    /// Fresh state for a new database of the given coin.
    pub fn new(coin: &str) -> Self {
        Self {
            coin: coin.to_string(),
            ..Default::default()
        }
    }

    /// Serialize the record for storage.
    pub fn pack(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize a stored record.
    pub fn unpack(buf: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(buf)
    }

    /// Record a new best height.
    pub fn update_best_height(&mut self, height: u32) {
        self.best_height = height;
    }

    /// Reconcile stored column stats against the current column list and
    /// verify every stored column version matches [`DB_VERSION`].
    pub(crate) fn reconcile_columns(&mut self) -> Result<(), DbError> {
        let stored = std::mem::take(&mut self.db_columns);
        let mut columns = Vec::with_capacity(Column::ALL.len());
        for col in Column::ALL {
            let mut stats = ColumnStats {
                name: col.name().to_string(),
                version: DB_VERSION,
                ..Default::default()
            };
            if let Some(old) = stored.iter().find(|c| c.name == stats.name) {
                if old.version != DB_VERSION {
                    return Err(DbError::VersionMismatch {
                        column: old.name.clone(),
                        stored: old.version,
                        required: DB_VERSION,
                    });
                }
                stats.rows = old.rows;
                stats.key_bytes = old.key_bytes;
                stats.value_bytes = old.value_bytes;
                stats.updated = old.updated;
            }
            columns.push(stats);
        }
        self.db_columns = columns;
        Ok(())
    }

    /// Adjust a column's counters by the given deltas.
    pub fn add_column_stats(&mut self, col: Column, rows: i64, key_bytes: i64, value_bytes: i64) {
        if let Some(stats) = self.db_columns.get_mut(col.index()) {
            stats.rows += rows;
            stats.key_bytes += key_bytes;
            stats.value_bytes += value_bytes;
            stats.updated = unix_now();
        }
    }

    /// Replace a column's counters with freshly computed values.
    pub fn set_column_stats(&mut self, col: Column, rows: i64, key_bytes: i64, value_bytes: i64) {
        if let Some(stats) = self.db_columns.get_mut(col.index()) {
            stats.rows = rows;
            stats.key_bytes = key_bytes;
            stats.value_bytes = value_bytes;
            stats.updated = unix_now();
        }
    }

    /// Current counters of a column.
    pub fn column_stats(&self, col: Column) -> Option<&ColumnStats> {
        self.db_columns.get(col.index())
    }
}

impl BlockDb {
    /// Load the internal state, or initialize a fresh one on an empty
    /// database. Verifies the stored coin name and per-column versions; a
    /// mismatch of either is fatal.
    ///
    /// The loaded state is retained by the handle and a copy is returned so
    /// the host can inspect the previous [`DbState`] for crash detection.
    pub fn load_internal_state(&self, coin: &str) -> Result<InternalState, DbError> {
        let stored = self
            .db
            .get_cf(self.cf(Column::Default)?, INTERNAL_STATE_KEY)?;
        let mut is = match stored {
            Some(buf) if !buf.is_empty() => {
                let is = InternalState::unpack(&buf)?;
                if is.coin.is_empty() {
                    InternalState { coin: coin.to_string(), ..is }
                } else if is.coin != coin {
                    return Err(DbError::CoinMismatch {
                        db_coin: is.coin,
                        requested: coin.to_string(),
                    });
                } else {
                    is
                }
            }
            _ => InternalState::new(coin),
        };
        is.reconcile_columns()?;
        *self.state.write() = Some(is.clone());
        Ok(is)
    }

    /// A copy of the current internal state, if loaded.
    pub fn internal_state(&self) -> Option<InternalState> {
        self.state.read().clone()
    }

    /// Persist the current internal state to the default column family.
    pub fn store_internal_state(&self) -> Result<(), DbError> {
        let state = self.state.read();
        let is = state.as_ref().ok_or(DbError::StateNotLoaded)?;
        self.store_state_record(is)
    }

    /// Flag the database as inconsistent (write path failed midway) or back
    /// to open, and persist the flag immediately.
    pub fn set_inconsistent_state(&self, inconsistent: bool) -> Result<(), DbError> {
        let mut state = self.state.write();
        let is = state.as_mut().ok_or(DbError::StateNotLoaded)?;
        is.db_state = if inconsistent {
            DbState::Inconsistent
        } else {
            DbState::Open
        };
        self.store_state_record(is)
    }

    pub(crate) fn store_state_record(&self, is: &InternalState) -> Result<(), DbError> {
        let buf = is.pack()?;
        self.db
            .put_cf(self.cf(Column::Default)?, INTERNAL_STATE_KEY, buf)?;
        Ok(())
    }

    /// Walk every column and set fresh row/byte statistics in the internal
    /// state. Very slow on large databases; cancellable through `stop`, and
    /// refreshes its iterator every [`ITERATOR_REFRESH_INTERVAL`] records to
    /// release snapshot resources.
    pub fn compute_internal_state_column_stats(&self, stop: &AtomicBool) -> Result<(), DbError> {
        let start = Instant::now();
        info!("column statistics scan started");
        for col in Column::ALL {
            let (rows, key_bytes, value_bytes) = self.compute_column_size(col, stop)?;
            let mut state = self.state.write();
            let is = state.as_mut().ok_or(DbError::StateNotLoaded)?;
            is.set_column_stats(col, rows, key_bytes, value_bytes);
            info!(
                column = col.name(),
                rows, key_bytes, value_bytes, "column statistics"
            );
        }
        info!(elapsed = ?start.elapsed(), "column statistics scan finished");
        Ok(())
    }

    fn compute_column_size(
        &self,
        col: Column,
        stop: &AtomicBool,
    ) -> Result<(i64, i64, i64), DbError> {
        let cf = self.cf(col)?;
        let mut rows = 0i64;
        let mut key_bytes = 0i64;
        let mut value_bytes = 0i64;
        let mut seek_key: Option<Vec<u8>> = None;
        loop {
            // statistics reads must not evict hot data from the block cache
            let mut ro = ReadOptions::default();
            ro.fill_cache(false);
            let mut it = self.db.raw_iterator_cf_opt(cf, ro);
            match &seek_key {
                None => it.seek_to_first(),
                Some(key) => {
                    it.seek(key);
                    it.next();
                }
            }
            let mut count = 0usize;
            let mut last_key: Option<Vec<u8>> = None;
            while it.valid() && count < ITERATOR_REFRESH_INTERVAL {
                if stop.load(Ordering::Relaxed) {
                    return Err(DbError::Interrupted);
                }
                count += 1;
                if let Some((key, value)) = it.key().zip(it.value()) {
                    rows += 1;
                    key_bytes += key.len() as i64;
                    value_bytes += value.len() as i64;
                    last_key = Some(key.to_vec());
                }
                it.next();
            }
            let exhausted = !it.valid();
            drop(it);
            if exhausted || last_key.is_none() {
                break;
            }
            seek_key = last_key;
        }
        Ok((rows, key_bytes, value_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let mut is = InternalState::new("Testcoin");
        is.db_state = DbState::Open;
        is.best_height = 1234;
        is.reconcile_columns().unwrap();
        is.add_column_stats(Column::Transactions, 2, 64, 512);

        let packed = is.pack().unwrap();
        let decoded = InternalState::unpack(&packed).unwrap();
        assert_eq!(decoded.coin, "Testcoin");
        assert_eq!(decoded.db_state, DbState::Open);
        assert_eq!(decoded.best_height, 1234);
        assert_eq!(decoded.column_stats(Column::Transactions).unwrap().rows, 2);
    }

    #[test]
    fn reconcile_fills_all_columns() {
        let mut is = InternalState::new("X");
        is.reconcile_columns().unwrap();
        assert_eq!(is.db_columns.len(), Column::ALL.len());
        assert!(is.db_columns.iter().all(|c| c.version == DB_VERSION));
    }

    #[test]
    fn reconcile_keeps_stats_by_name() {
        let mut is = InternalState::new("X");
        is.db_columns = vec![ColumnStats {
            name: "txAddresses".to_string(),
            version: DB_VERSION,
            rows: 77,
            key_bytes: 100,
            value_bytes: 200,
            updated: 1,
        }];
        is.reconcile_columns().unwrap();
        let stats = is.column_stats(Column::TxAddresses).unwrap();
        assert_eq!(stats.rows, 77);
        assert_eq!(stats.key_bytes, 100);
    }

    #[test]
    fn reconcile_rejects_version_mismatch() {
        let mut is = InternalState::new("X");
        is.db_columns = vec![ColumnStats {
            name: "addresses".to_string(),
            version: DB_VERSION + 1,
            ..Default::default()
        }];
        let err = is.reconcile_columns().unwrap_err();
        assert!(matches!(err, DbError::VersionMismatch { .. }));
    }

    #[test]
    fn add_column_stats_accumulates() {
        let mut is = InternalState::new("X");
        is.reconcile_columns().unwrap();
        is.add_column_stats(Column::Height, 1, 4, 40);
        is.add_column_stats(Column::Height, 1, 4, 44);
        is.add_column_stats(Column::Height, -1, -4, -40);
        let stats = is.column_stats(Column::Height).unwrap();
        assert_eq!(stats.rows, 1);
        assert_eq!(stats.key_bytes, 4);
        assert_eq!(stats.value_bytes, 44);
        assert!(stats.updated > 0);
    }

    #[test]
    fn db_state_serializes_lowercase() {
        let json = serde_json::to_string(&DbState::Inconsistent).unwrap();
        assert_eq!(json, "\"inconsistent\"");
    }
}
