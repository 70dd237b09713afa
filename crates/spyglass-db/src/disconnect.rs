//! Block range disconnect.
//!
//! UTXO chains are undone from the retention buffer: heights are processed
//! from the top down and transactions within each block in reverse order —
//! connect credited outputs before debiting inputs, so the undo must run
//! backward to avoid interim negative balances. Account-model chains have no
//! balances to reverse; their disconnect is a full scan of the address
//! column filtering on the trailing height bytes.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use num_traits::CheckedSub;
use rocksdb::WriteBatch;
use tracing::{info, warn};

use spyglass_core::codec::{
    pack_address_key, pack_u32, unpack_address_key, PACKED_HEIGHT_BYTES,
};
use spyglass_core::{AddrDescriptor, CodecError};

use crate::db::BlockDb;
use crate::error::DbError;
use crate::records::{unpack_n_outpoints, AddrBalance, BlockTxs, Outpoint, TxAddresses};
use crate::schema::{Column, ITERATOR_REFRESH_INTERVAL};

impl BlockDb {
    /// Remove all index data of blocks in `[lower, higher]`.
    ///
    /// On UTXO chains this requires a retention record for every height in
    /// the range; if any is missing the call fails with
    /// [`DbError::RetentionMiss`] and the index must be rebuilt.
    pub fn disconnect_block_range(&self, lower: u32, higher: u32) -> Result<(), DbError> {
        if self.parser.is_utxo_chain() {
            self.disconnect_range_utxo(lower, higher)
        } else {
            self.disconnect_range_account(lower, higher)
        }
    }

    fn disconnect_range_utxo(&self, lower: u32, higher: u32) -> Result<(), DbError> {
        info!(lower, higher, "disconnecting blocks");
        let mut blocks: Vec<Vec<BlockTxs>> =
            Vec::with_capacity(higher.saturating_sub(lower) as usize + 1);
        for height in lower..=higher {
            let block_txs = self.get_block_txs(height)?;
            if block_txs.is_empty() {
                return Err(DbError::RetentionMiss { height });
            }
            blocks.push(block_txs);
        }

        let mut wb = WriteBatch::default();
        let mut tx_addresses_to_update: HashMap<Vec<u8>, TxAddresses> = HashMap::new();
        let mut txs_to_delete: HashSet<Vec<u8>> = HashSet::new();
        let mut balances: HashMap<AddrDescriptor, Option<AddrBalance>> = HashMap::new();

        for height in (lower..=higher).rev() {
            let block_txs = &blocks[(height - lower) as usize];
            info!(height, txs = block_txs.len(), "disconnecting block");
            for bt in block_txs.iter().rev() {
                txs_to_delete.insert(bt.btxid.clone());
                let Some(txa) = self.get_tx_addresses_packed(&bt.btxid)? else {
                    let txid = self
                        .parser
                        .unpack_txid(&bt.btxid)
                        .unwrap_or_else(|_| hex::encode(&bt.btxid));
                    warn!(%txid, "tx addresses not found");
                    continue;
                };
                self.disconnect_tx_addresses(
                    &mut wb,
                    height,
                    &bt.inputs,
                    &txa,
                    &mut tx_addresses_to_update,
                    &mut balances,
                )?;
            }
            let key = pack_u32(height);
            wb.delete_cf(self.cf(Column::BlockTxs)?, key);
            wb.delete_cf(self.cf(Column::Height)?, key);
        }

        self.store_tx_addresses(&mut wb, tx_addresses_to_update.iter())?;
        self.store_balances(&mut wb, balances.iter().map(|(k, v)| (k, v.as_ref())))?;
        for btxid in &txs_to_delete {
            wb.delete_cf(self.cf(Column::Transactions)?, btxid);
            wb.delete_cf(self.cf(Column::TxAddresses)?, btxid);
        }

        self.db.write(wb)?;
        if let Some(is) = self.state.write().as_mut() {
            is.update_best_height(lower.saturating_sub(1));
        }
        info!(lower, higher, "blocks disconnected");
        Ok(())
    }

    /// Undo one transaction: restore spent flags on the outputs its inputs
    /// consumed, reverse the balance movements, and queue the deletion of
    /// its address-index rows.
    fn disconnect_tx_addresses(
        &self,
        wb: &mut WriteBatch,
        height: u32,
        spent_outpoints: &[Outpoint],
        txa: &TxAddresses,
        tx_addresses_to_update: &mut HashMap<Vec<u8>, TxAddresses>,
        balances: &mut HashMap<AddrDescriptor, Option<AddrBalance>>,
    ) -> Result<(), DbError> {
        let mut touched: HashSet<AddrDescriptor> = HashSet::new();

        for (position, input) in txa.inputs.iter().enumerate() {
            if input.addr_desc.is_empty() {
                continue;
            }
            let first_in_tx = touched.insert(input.addr_desc.clone());
            match self.load_balance_opt(balances, &input.addr_desc)?.as_mut() {
                Some(balance) => {
                    // one tx decrements the count once however often the
                    // address appears in it
                    if first_in_tx {
                        balance.txs = balance.txs.saturating_sub(1);
                    }
                    match balance.sent_sat.checked_sub(&input.value_sat) {
                        Some(sent) => balance.sent_sat = sent,
                        None => self.reset_value_to_zero(
                            &mut balance.sent_sat,
                            &input.addr_desc,
                            "sent amount",
                        ),
                    }
                    balance.balance_sat += &input.value_sat;
                }
                None => {
                    warn!(descriptor = %input.addr_desc, "balance not found");
                }
            }
            let Some(outpoint) = spent_outpoints.get(position) else {
                return Err(DbError::InconsistentData {
                    column: "blockTxs",
                    source: CodecError::UnexpectedEof,
                });
            };
            let spent_tx = match tx_addresses_to_update.entry(outpoint.btxid.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => match self.get_tx_addresses_packed(&outpoint.btxid)? {
                    Some(spent_tx) => entry.insert(spent_tx),
                    None => {
                        let txid = self
                            .parser
                            .unpack_txid(&outpoint.btxid)
                            .unwrap_or_else(|_| hex::encode(&outpoint.btxid));
                        warn!(%txid, "tx addresses of spent tx not found");
                        continue;
                    }
                },
            };
            match spent_tx.outputs.get_mut(outpoint.index as usize) {
                Some(output) => output.spent = false,
                None => {
                    return Err(DbError::InconsistentData {
                        column: "blockTxs",
                        source: CodecError::UnexpectedEof,
                    })
                }
            }
        }

        for output in &txa.outputs {
            if output.addr_desc.is_empty() {
                continue;
            }
            let first_in_tx = touched.insert(output.addr_desc.clone());
            match self.load_balance_opt(balances, &output.addr_desc)?.as_mut() {
                Some(balance) => {
                    if first_in_tx {
                        balance.txs = balance.txs.saturating_sub(1);
                    }
                    match balance.balance_sat.checked_sub(&output.value_sat) {
                        Some(remaining) => balance.balance_sat = remaining,
                        None => self.reset_value_to_zero(
                            &mut balance.balance_sat,
                            &output.addr_desc,
                            "balance",
                        ),
                    }
                }
                None => {
                    warn!(descriptor = %output.addr_desc, "balance not found");
                }
            }
        }

        let cf = self.cf(Column::Addresses)?;
        for addr_desc in &touched {
            wb.delete_cf(cf, pack_address_key(addr_desc.as_bytes(), height));
        }
        Ok(())
    }

    fn load_balance_opt<'a>(
        &self,
        balances: &'a mut HashMap<AddrDescriptor, Option<AddrBalance>>,
        addr_desc: &AddrDescriptor,
    ) -> Result<&'a mut Option<AddrBalance>, DbError> {
        match balances.entry(addr_desc.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let balance = self.get_addr_desc_balance(addr_desc)?;
                Ok(entry.insert(balance))
            }
        }
    }

    /// Decode the retention record of one height; empty when the height has
    /// no record (pre-retention or never written).
    pub(crate) fn get_block_txs(&self, height: u32) -> Result<Vec<BlockTxs>, DbError> {
        let txid_len = self.parser.packed_txid_len();
        let Some(buf) = self
            .db
            .get_cf(self.cf(Column::BlockTxs)?, pack_u32(height))?
        else {
            return Ok(Vec::new());
        };
        let mut records = Vec::new();
        let mut i = 0;
        while i < buf.len() {
            let btxid = buf
                .get(i..i + txid_len)
                .ok_or(CodecError::UnexpectedEof)
                .map_err(DbError::inconsistent("blockTxs"))?
                .to_vec();
            i += txid_len;
            let (inputs, consumed) = unpack_n_outpoints(&buf[i..], txid_len)
                .map_err(DbError::inconsistent("blockTxs"))?;
            i += consumed;
            records.push(BlockTxs { btxid, inputs });
        }
        Ok(records)
    }

    // --- Account-model chains ---

    fn disconnect_range_account(&self, lower: u32, higher: u32) -> Result<(), DbError> {
        info!(lower, higher, "disconnecting blocks");
        let address_keys = self.all_addresses_scan(lower, higher)?;
        info!(rows = address_keys.len(), "address rows to disconnect");

        let mut wb = WriteBatch::default();
        let cf_addresses = self.cf(Column::Addresses)?;
        for key in &address_keys {
            wb.delete_cf(cf_addresses, key);
        }
        let cf_height = self.cf(Column::Height)?;
        for height in lower..=higher {
            wb.delete_cf(cf_height, pack_u32(height));
        }
        self.db.write(wb)?;
        if let Some(is) = self.state.write().as_mut() {
            is.update_best_height(lower.saturating_sub(1));
        }
        info!(lower, higher, "blocks disconnected");
        Ok(())
    }

    /// Full scan of the address column collecting keys whose trailing height
    /// falls inside `[lower, higher]`. The iterator is refreshed every
    /// [`ITERATOR_REFRESH_INTERVAL`] records to release snapshot resources.
    fn all_addresses_scan(&self, lower: u32, higher: u32) -> Result<Vec<Vec<u8>>, DbError> {
        info!("running full scan of the addresses column");
        let cf = self.cf(Column::Addresses)?;
        let mut matching = Vec::new();
        let mut total: u64 = 0;
        let mut seek_key: Option<Vec<u8>> = None;
        loop {
            let mut it = self.db.raw_iterator_cf(cf);
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
                count += 1;
                if let Some(key) = it.key() {
                    total += 1;
                    if key.len() > PACKED_HEIGHT_BYTES {
                        if let Ok((_, height)) = unpack_address_key(key) {
                            if height >= lower && height <= higher {
                                matching.push(key.to_vec());
                            }
                        }
                    }
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
        info!(scanned = total, matched = matching.len(), "address scan finished");
        Ok(matching)
    }
}
