//! # spyglass-db — RocksDB-backed block indexing storage engine.
//!
//! Maintains the persistent, queryable index a blockchain explorer backend
//! answers address, transaction and balance queries from:
//! - [`db::BlockDb`] — database handle: lifecycle, queries, raw-tx cache
//! - [`connect`] / [`disconnect`] — the atomic per-block mutation protocol
//! - [`schema`] — the seven column families and their tuning
//! - [`records`] — the on-disk record layouts
//! - [`state`] — the internal-state record (identity, versions, statistics)
//!
//! Single-writer, multi-reader: one sync loop calls connect/disconnect,
//! while readers observe either the pre-block or post-block state of each
//! atomic batch, never a partial view.

pub mod config;
pub mod connect;
pub mod db;
pub mod disconnect;
pub mod error;
pub mod records;
pub mod schema;
pub mod state;

pub use config::DbConfig;
pub use connect::ConnectBlockStats;
pub use db::BlockDb;
pub use error::DbError;
pub use records::{AddrBalance, BlockInfo, BlockTxs, Outpoint, TxAddresses, TxInput, TxOutput};
pub use schema::{Column, DB_VERSION, ITERATOR_REFRESH_INTERVAL, MAX_ADDR_DESC_LEN};
pub use state::{ColumnStats, DbState, InternalState};
