//! The RocksDB-backed block index handle.
//!
//! [`BlockDb`] owns the database environment (column families, shared block
//! cache) and exposes the query surface plus the raw-transaction cache.
//! Mutation paths (connect/disconnect) live in their own modules. The engine
//! is single-writer multi-reader: one sync loop drives mutations while
//! query callers read concurrently from their own snapshots.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rocksdb::{Cache, ColumnFamily, Options, WriteBatch, DB};
use tracing::{debug, info, warn};

use spyglass_core::codec::{pack_address_key, pack_u32, unpack_u32};
use spyglass_core::{AddrDescriptor, ChainParser, Tx};

use crate::config::DbConfig;
use crate::connect::ConnectBlockStats;
use crate::error::DbError;
use crate::records::{
    unpack_addr_balance, unpack_block_info, unpack_outpoints, unpack_tx_addresses, AddrBalance,
    BlockInfo, TxAddresses,
};
use crate::schema::{open_column_db, Column, DB_VERSION};
use crate::state::{DbState, InternalState};

/// Handle to the block index database.
///
/// Open with [`BlockDb::open`], then
/// [`load_internal_state`](BlockDb::load_internal_state) before mutating.
/// Dropping the handle without [`close`](BlockDb::close) leaves the
/// persisted state flag `open`, which the next load surfaces as a crash.
pub struct BlockDb {
    pub(crate) path: PathBuf,
    pub(crate) db: DB,
    pub(crate) parser: Arc<dyn ChainParser>,
    pub(crate) state: RwLock<Option<InternalState>>,
    pub(crate) cbs: Mutex<ConnectBlockStats>,
    // shared LRU block cache; must outlive the DB handle
    pub(crate) cache: Cache,
}

impl BlockDb {
    /// Open (or create) the index database at `path`.
    pub fn open(
        path: impl Into<PathBuf>,
        config: DbConfig,
        parser: Arc<dyn ChainParser>,
    ) -> Result<Self, DbError> {
        let path = path.into();
        info!(
            path = %path.display(),
            version = DB_VERSION,
            cache_size = config.cache_size,
            max_open_files = config.max_open_files,
            "opening index database"
        );
        let (db, cache) = open_column_db(&path, &config)?;
        Ok(Self {
            path,
            db,
            parser,
            state: RwLock::new(None),
            cbs: Mutex::new(ConnectBlockStats::default()),
            cache,
        })
    }

    /// Close the database, marking the internal state `closed` if it was
    /// cleanly open.
    pub fn close(self) {
        {
            let mut state = self.state.write();
            if let Some(is) = state.as_mut() {
                if is.db_state == DbState::Open {
                    is.db_state = DbState::Closed;
                    if let Err(err) = self.store_state_record(is) {
                        warn!(%err, "storing internal state on close failed");
                    }
                }
            }
        }
        info!("index database closed");
    }

    /// Flush all in-memory buffers of every column family to disk.
    pub fn flush(&self) -> Result<(), DbError> {
        for col in Column::ALL {
            self.db.flush_cf(self.cf(col)?)?;
        }
        Ok(())
    }

    /// Run the underlying store's repair routine against a database
    /// directory. The database must not be open.
    pub fn repair(path: impl AsRef<Path>) -> Result<(), DbError> {
        info!(path = %path.as_ref().display(), "repairing index database");
        DB::repair(&Options::default(), path)?;
        Ok(())
    }

    /// The chain parser this index was opened with.
    pub fn chain_parser(&self) -> &dyn ChainParser {
        self.parser.as_ref()
    }

    pub(crate) fn cf(&self, col: Column) -> Result<&ColumnFamily, DbError> {
        self.db
            .cf_handle(col.name())
            .ok_or(DbError::MissingColumn(col.name()))
    }

    // --- Address index queries ---

    /// Find all transactions touching `address` in the height range
    /// `[lower, higher]`, delivered in ascending height order.
    ///
    /// The callback receives `(txid, vout, is_output)`; returning
    /// [`ControlFlow::Break`] terminates the scan cleanly.
    pub fn get_transactions<F>(
        &self,
        address: &str,
        lower: u32,
        higher: u32,
        callback: F,
    ) -> Result<(), DbError>
    where
        F: FnMut(&str, u32, bool) -> ControlFlow<()>,
    {
        debug!(address, lower, higher, "address transaction scan");
        let addr_desc = self.parser.addr_desc_from_address(address)?;
        self.get_addr_desc_transactions(&addr_desc, lower, higher, callback)
    }

    /// [`get_transactions`](Self::get_transactions) keyed by a descriptor
    /// the caller already resolved.
    pub fn get_addr_desc_transactions<F>(
        &self,
        addr_desc: &AddrDescriptor,
        lower: u32,
        higher: u32,
        mut callback: F,
    ) -> Result<(), DbError>
    where
        F: FnMut(&str, u32, bool) -> ControlFlow<()>,
    {
        let key_start = pack_address_key(addr_desc.as_bytes(), lower);
        let key_stop = pack_address_key(addr_desc.as_bytes(), higher);
        let txid_len = self.parser.packed_txid_len();

        let mut it = self.db.raw_iterator_cf(self.cf(Column::Addresses)?);
        it.seek(&key_start);
        while it.valid() {
            let Some((key, value)) = it.key().zip(it.value()) else {
                break;
            };
            if key > key_stop.as_slice() {
                break;
            }
            let outpoints =
                unpack_outpoints(value, txid_len).map_err(DbError::inconsistent("addresses"))?;
            for outpoint in outpoints {
                let (vout, is_output) = if outpoint.index < 0 {
                    ((!outpoint.index) as u32, false)
                } else {
                    (outpoint.index as u32, true)
                };
                let txid = self.parser.unpack_txid(&outpoint.btxid)?;
                if let ControlFlow::Break(()) = callback(&txid, vout, is_output) {
                    return Ok(());
                }
            }
            it.next();
        }
        it.status()?;
        Ok(())
    }

    // --- Balance queries ---

    /// Running totals for an address, or `None` if never indexed.
    pub fn get_address_balance(&self, address: &str) -> Result<Option<AddrBalance>, DbError> {
        let addr_desc = self.parser.addr_desc_from_address(address)?;
        self.get_addr_desc_balance(&addr_desc)
    }

    /// Running totals for an address descriptor.
    pub fn get_addr_desc_balance(
        &self,
        addr_desc: &AddrDescriptor,
    ) -> Result<Option<AddrBalance>, DbError> {
        match self
            .db
            .get_cf(self.cf(Column::AddressBalance)?, addr_desc.as_bytes())?
        {
            // minimum is 1 byte txs + 1 byte sent + 1 byte balance
            Some(buf) if buf.len() >= 3 => unpack_addr_balance(&buf)
                .map(Some)
                .map_err(DbError::inconsistent("addressBalance")),
            _ => Ok(None),
        }
    }

    // --- Tx-addresses queries ---

    /// The resolved input/output picture of a transaction, or `None` if the
    /// transaction is not indexed.
    pub fn get_tx_addresses(&self, txid: &str) -> Result<Option<TxAddresses>, DbError> {
        let btxid = self.parser.pack_txid(txid)?;
        self.get_tx_addresses_packed(&btxid)
    }

    pub(crate) fn get_tx_addresses_packed(
        &self,
        btxid: &[u8],
    ) -> Result<Option<TxAddresses>, DbError> {
        match self.db.get_cf(self.cf(Column::TxAddresses)?, btxid)? {
            // minimum is 1 byte height + 1 byte input count + 1 byte output count
            Some(buf) if buf.len() >= 3 => unpack_tx_addresses(&buf)
                .map(Some)
                .map_err(DbError::inconsistent("txAddresses")),
            _ => Ok(None),
        }
    }

    // --- Block info queries ---

    /// Metadata of the block at `height`, or `None` beyond the best block.
    pub fn get_block_info(&self, height: u32) -> Result<Option<BlockInfo>, DbError> {
        match self.db.get_cf(self.cf(Column::Height)?, pack_u32(height))? {
            Some(buf) => unpack_block_info(&buf, height, self.parser.as_ref()),
            None => Ok(None),
        }
    }

    /// Hash of the block at `height`, or `None` if not indexed.
    pub fn get_block_hash(&self, height: u32) -> Result<Option<String>, DbError> {
        Ok(self.get_block_info(height)?.map(|info| info.hash))
    }

    /// The highest indexed block as `(height, hash)`, or `None` on an empty
    /// database.
    pub fn get_best_block(&self) -> Result<Option<(u32, String)>, DbError> {
        let mut it = self.db.raw_iterator_cf(self.cf(Column::Height)?);
        it.seek_to_last();
        if it.valid() {
            if let Some((key, value)) = it.key().zip(it.value()) {
                let height = unpack_u32(key).map_err(DbError::inconsistent("height"))?;
                if let Some(info) = unpack_block_info(value, height, self.parser.as_ref())? {
                    debug!(height, hash = %info.hash, "best block");
                    return Ok(Some((height, info.hash)));
                }
            }
        }
        it.status()?;
        Ok(None)
    }

    // --- Raw transaction cache ---

    /// A cached raw transaction and the height it was cached at.
    pub fn get_tx(&self, txid: &str) -> Result<Option<(Tx, u32)>, DbError> {
        let btxid = self.parser.pack_txid(txid)?;
        match self.db.get_cf(self.cf(Column::Transactions)?, &btxid)? {
            Some(buf) if buf.len() > 4 => Ok(Some(self.parser.unpack_tx(&buf)?)),
            _ => Ok(None),
        }
    }

    /// Cache a raw transaction. Txids the parser cannot pack are simply not
    /// cached.
    pub fn put_tx(&self, tx: &Tx, height: u32, block_time: i64) -> Result<(), DbError> {
        let Ok(btxid) = self.parser.pack_txid(&tx.txid) else {
            return Ok(());
        };
        let buf = self.parser.pack_tx(tx, height, block_time)?;
        self.db
            .put_cf(self.cf(Column::Transactions)?, &btxid, &buf)?;
        if let Some(is) = self.state.write().as_mut() {
            is.add_column_stats(
                Column::Transactions,
                1,
                btxid.len() as i64,
                buf.len() as i64,
            );
        }
        Ok(())
    }

    /// Drop a transaction from the cache.
    pub fn delete_tx(&self, txid: &str) -> Result<(), DbError> {
        let Ok(btxid) = self.parser.pack_txid(txid) else {
            return Ok(());
        };
        let mut wb = WriteBatch::default();
        self.delete_tx_internal(&mut wb, &btxid)?;
        self.db.write(wb)?;
        Ok(())
    }

    /// Queue a cache delete in `wb`, adjusting the column statistics for the
    /// record being removed. The stats read is best-effort.
    pub(crate) fn delete_tx_internal(
        &self,
        wb: &mut WriteBatch,
        btxid: &[u8],
    ) -> Result<(), DbError> {
        if let Ok(Some(buf)) = self.db.get_cf(self.cf(Column::Transactions)?, btxid) {
            if !buf.is_empty() {
                if let Some(is) = self.state.write().as_mut() {
                    is.add_column_stats(
                        Column::Transactions,
                        -1,
                        -(btxid.len() as i64),
                        -(buf.len() as i64),
                    );
                }
            }
        }
        wb.delete_cf(self.cf(Column::Transactions)?, btxid);
        Ok(())
    }

    // --- Diagnostics ---

    /// Rough memory accounting: shared cache usage plus per-column index,
    /// filter and memtable sizes as reported by the store.
    pub fn memory_stats(&self) -> String {
        use std::fmt::Write as _;

        let mut out = String::new();
        let _ = write!(
            out,
            "cache usage {}, pinned {}",
            self.cache.get_usage(),
            self.cache.get_pinned_usage()
        );
        for col in Column::ALL {
            let Ok(cf) = self.cf(col) else { continue };
            let readers = self
                .db
                .property_value_cf(cf, "rocksdb.estimate-table-readers-mem")
                .ok()
                .flatten()
                .unwrap_or_default();
            let memtable = self
                .db
                .property_value_cf(cf, "rocksdb.cur-size-all-mem-tables")
                .ok()
                .flatten()
                .unwrap_or_default();
            let _ = write!(
                out,
                "\n{}: index+filter {readers}, memtable {memtable}",
                col.name()
            );
        }
        out
    }

    /// Total size of the database directory in bytes; 0 if the walk fails.
    pub fn database_size_on_disk(&self) -> u64 {
        match dir_size(&self.path) {
            Ok(size) => size,
            Err(err) => {
                warn!(%err, "database size scan failed");
                0
            }
        }
    }
}

fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut size = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            size += dir_size(&entry.path())?;
        } else {
            size += meta.len();
        }
    }
    Ok(size)
}
