//! Column-family schema and open-time tuning.
//!
//! Seven column families in fixed order share one LRU block cache. Every
//! column gets a bloom filter for point lookups except `addresses`, whose
//! dominant access pattern is prefix range scans — a bloom filter would only
//! cost memory there.

use std::path::Path;

use rocksdb::{BlockBasedOptions, Cache, ColumnFamilyDescriptor, Options, DB};

use crate::config::DbConfig;
use crate::error::DbError;

/// Version stamped into the internal-state record for every column. Opening
/// a database stamped with a different version fails.
pub const DB_VERSION: u32 = 3;

/// Address descriptors longer than this are not indexed.
pub const MAX_ADDR_DESC_LEN: usize = 1024;

/// Long scans close and reopen their iterator after this many records to
/// release the accumulated snapshot resources.
pub const ITERATOR_REFRESH_INTERVAL: usize = 5_000_000;

/// Key of the internal-state record in the default column family.
pub(crate) const INTERNAL_STATE_KEY: &[u8] = b"internalState";

/// Bloom filter sizing for point-lookup columns.
const BLOOM_BITS_PER_KEY: f64 = 10.0;

/// The column families of the index, in on-disk order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Column {
    /// Internal-state record only.
    Default,
    /// Height → block info.
    Height,
    /// Address key (descriptor ∥ height) → outpoint list.
    Addresses,
    /// Packed txid → resolved input/output addresses and values.
    TxAddresses,
    /// Address descriptor → running balance totals.
    AddressBalance,
    /// Height → per-tx spent outpoints, kept for the retention window.
    BlockTxs,
    /// Packed txid → opportunistically cached raw transaction.
    Transactions,
}

impl Column {
    /// All columns in their fixed on-disk order.
    pub const ALL: [Column; 7] = [
        Column::Default,
        Column::Height,
        Column::Addresses,
        Column::TxAddresses,
        Column::AddressBalance,
        Column::BlockTxs,
        Column::Transactions,
    ];

    /// The column family name as stored in the database.
    pub fn name(self) -> &'static str {
        match self {
            Column::Default => "default",
            Column::Height => "height",
            Column::Addresses => "addresses",
            Column::TxAddresses => "txAddresses",
            Column::AddressBalance => "addressBalance",
            Column::BlockTxs => "blockTxs",
            Column::Transactions => "transactions",
        }
    }

    /// Position within [`Column::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Database options wired to the shared block cache, with an optional bloom
/// filter.
fn column_options(cache: &Cache, bloom_bits: Option<f64>, config: &DbConfig) -> Options {
    let mut table = BlockBasedOptions::default();
    table.set_block_cache(cache);
    if let Some(bits) = bloom_bits {
        table.set_bloom_filter(bits, false);
    }

    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);
    opts.set_max_open_files(config.max_open_files);
    opts.set_block_based_table_factory(&table);
    opts
}

/// Open the database with all column families.
///
/// The returned [`Cache`] must be kept alive alongside the handle.
pub(crate) fn open_column_db(path: &Path, config: &DbConfig) -> Result<(DB, Cache), DbError> {
    let cache = Cache::new_lru_cache(config.cache_size);

    let with_bloom = column_options(&cache, Some(BLOOM_BITS_PER_KEY), config);
    let scan_only = column_options(&cache, None, config);

    let descriptors: Vec<ColumnFamilyDescriptor> = Column::ALL
        .iter()
        .map(|col| {
            let opts = if *col == Column::Addresses {
                scan_only.clone()
            } else {
                with_bloom.clone()
            };
            ColumnFamilyDescriptor::new(col.name(), opts)
        })
        .collect();

    let db_opts = column_options(&cache, Some(BLOOM_BITS_PER_KEY), config);
    let db = DB::open_cf_descriptors(&db_opts, path, descriptors)?;
    Ok((db, cache))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_order_is_fixed() {
        let names: Vec<&str> = Column::ALL.iter().map(|c| c.name()).collect();
        assert_eq!(
            names,
            [
                "default",
                "height",
                "addresses",
                "txAddresses",
                "addressBalance",
                "blockTxs",
                "transactions",
            ]
        );
    }

    #[test]
    fn column_index_matches_position() {
        for (i, col) in Column::ALL.iter().enumerate() {
            assert_eq!(col.index(), i);
        }
    }
}
