//! Block connect: one atomic write batch per block.
//!
//! UTXO chains run a two-pass algorithm over the block. Outputs are
//! processed first so that inputs of later transactions can resolve
//! transactions earlier in the same block from the working maps; the maps
//! also break the cycle between the balance and tx-addresses updates (the
//! "first appearance in this tx" predicate needs the outpoints collected so
//! far). Account-model chains skip the spent-flag machinery entirely and
//! write only the address index and block info.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use num_bigint::BigUint;
use num_traits::CheckedSub;
use rocksdb::WriteBatch;
use tracing::{debug, info, warn};

use spyglass_core::codec::{pack_address_key, pack_u32, pack_varuint};
use spyglass_core::{AddrDescriptor, Block, ParserError};

use crate::db::BlockDb;
use crate::error::DbError;
use crate::records::{
    pack_addr_balance, pack_block_info, pack_outpoints, pack_tx_addresses, AddrBalance, BlockInfo,
    Outpoint, TxAddresses, TxInput, TxOutput,
};
use crate::schema::{Column, MAX_ADDR_DESC_LEN};

/// Working-map hit/miss counters, kept for observability of the connect
/// path's caching behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectBlockStats {
    /// Referenced tx already present in the per-block working map.
    pub tx_addresses_hit: usize,
    /// Referenced tx loaded from the store.
    pub tx_addresses_miss: usize,
    /// Balance already present in the per-block working map.
    pub balances_hit: usize,
    /// Balance loaded from the store (or created).
    pub balances_miss: usize,
}

impl ConnectBlockStats {
    fn merge(&mut self, other: ConnectBlockStats) {
        self.tx_addresses_hit += other.tx_addresses_hit;
        self.tx_addresses_miss += other.tx_addresses_miss;
        self.balances_hit += other.balances_hit;
        self.balances_miss += other.balances_miss;
    }
}

/// Direction of a height/address-index write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BlockOp {
    Insert,
    Delete,
}

impl BlockDb {
    /// Index a block: addresses, tx-addresses, balances, retention buffer
    /// and block info, committed as one atomic batch.
    ///
    /// Blocks must be connected in strictly increasing height order.
    pub fn connect_block(&self, block: &Block) -> Result<(), DbError> {
        debug!(height = block.height, hash = %block.hash, "connecting block");
        let mut wb = WriteBatch::default();
        self.write_height(&mut wb, block, BlockOp::Insert)?;

        if self.parser.is_utxo_chain() {
            let mut addresses: HashMap<AddrDescriptor, Vec<Outpoint>> = HashMap::new();
            let mut tx_addresses_map: HashMap<Vec<u8>, TxAddresses> = HashMap::new();
            let mut balances: HashMap<AddrDescriptor, AddrBalance> = HashMap::new();
            self.process_addresses_utxo(block, &mut addresses, &mut tx_addresses_map, &mut balances)?;
            self.store_addresses(&mut wb, block.height, &addresses)?;
            self.store_tx_addresses(&mut wb, tx_addresses_map.iter())?;
            self.store_balances(&mut wb, balances.iter().map(|(k, v)| (k, Some(v))))?;
            self.store_and_cleanup_block_txs(&mut wb, block)?;
        } else {
            self.write_addresses_account(&mut wb, block, BlockOp::Insert)?;
        }

        self.db.write(wb)?;
        if let Some(is) = self.state.write().as_mut() {
            is.update_best_height(block.height);
        }
        Ok(())
    }

    /// Remove a single block from the index. Only possible on account-model
    /// chains — a UTXO block does not carry its input addresses, so undoing
    /// it needs the retention buffer
    /// ([`disconnect_block_range`](Self::disconnect_block_range)).
    pub fn disconnect_block(&self, block: &Block) -> Result<(), DbError> {
        if self.parser.is_utxo_chain() {
            return Err(DbError::DisconnectNotSupported);
        }
        debug!(height = block.height, hash = %block.hash, "disconnecting block");
        let mut wb = WriteBatch::default();
        self.write_height(&mut wb, block, BlockOp::Delete)?;
        self.write_addresses_account(&mut wb, block, BlockOp::Delete)?;
        self.db.write(wb)?;
        if let Some(is) = self.state.write().as_mut() {
            is.update_best_height(block.height.saturating_sub(1));
        }
        Ok(())
    }

    /// Snapshot and reset the connect working-map counters.
    pub fn get_and_reset_connect_block_stats(&self) -> ConnectBlockStats {
        std::mem::take(&mut *self.cbs.lock())
    }

    // --- UTXO two-pass processing ---

    fn process_addresses_utxo(
        &self,
        block: &Block,
        addresses: &mut HashMap<AddrDescriptor, Vec<Outpoint>>,
        tx_addresses_map: &mut HashMap<Vec<u8>, TxAddresses>,
        balances: &mut HashMap<AddrDescriptor, AddrBalance>,
    ) -> Result<(), DbError> {
        let mut cbs = ConnectBlockStats::default();
        let mut block_txids: Vec<Vec<u8>> = Vec::with_capacity(block.txs.len());

        // Phase A: outputs of every transaction, so that inputs processed in
        // phase B can reference transactions from this very block.
        for tx in &block.txs {
            let btxid = self.parser.pack_txid(&tx.txid)?;
            block_txids.push(btxid.clone());
            let mut ta = TxAddresses {
                height: block.height,
                inputs: Vec::new(),
                outputs: Vec::with_capacity(tx.vout.len()),
            };
            for (position, vout) in tx.vout.iter().enumerate() {
                let mut tao = TxOutput {
                    value_sat: vout.value_sat.clone(),
                    ..Default::default()
                };
                match self.parser.addr_desc_from_vout(vout) {
                    Ok(addr_desc)
                        if !addr_desc.is_empty() && addr_desc.len() <= MAX_ADDR_DESC_LEN =>
                    {
                        tao.addr_desc = addr_desc.clone();
                        let processed = addresses
                            .get(&addr_desc)
                            .is_some_and(|o| processed_in_tx(o, &btxid));
                        addresses.entry(addr_desc.clone()).or_default().push(Outpoint {
                            btxid: btxid.clone(),
                            index: position as i32,
                        });
                        let ab = self.load_balance(balances, &addr_desc, &mut cbs)?;
                        // a tx counts once even when the address repeats in it
                        if !processed {
                            ab.txs += 1;
                        }
                        ab.balance_sat += &vout.value_sat;
                    }
                    Ok(addr_desc) => {
                        // value is still recorded, with an empty address
                        info!(
                            height = block.height,
                            tx = %tx.txid,
                            vout = position,
                            len = addr_desc.len(),
                            "skipping address descriptor outside indexable length"
                        );
                    }
                    // outputs without an address (e.g. contract creations)
                    Err(ParserError::AddressMissing) => {}
                    Err(err) => {
                        warn!(
                            height = block.height,
                            tx = %tx.txid,
                            vout = position,
                            %err,
                            "cannot derive address descriptor"
                        );
                    }
                }
                ta.outputs.push(tao);
            }
            tx_addresses_map.insert(btxid, ta);
        }

        // Phase B: inputs, resolving referenced outputs from the working map
        // or the store and flipping their spent flags.
        for (txi, tx) in block.txs.iter().enumerate() {
            let spending_txid = block_txids[txi].clone();
            if let Some(ta) = tx_addresses_map.get_mut(&spending_txid) {
                ta.inputs = vec![TxInput::default(); tx.vin.len()];
            }
            let mut logged_empty = false;
            for (position, vin) in tx.vin.iter().enumerate() {
                let btxid = match self.parser.pack_txid(&vin.txid) {
                    Ok(btxid) => btxid,
                    // inputs without a referenced txid are not indexed
                    Err(ParserError::TxidMissing) => continue,
                    Err(err) => return Err(err.into()),
                };
                match tx_addresses_map.entry(btxid.clone()) {
                    Entry::Occupied(_) => cbs.tx_addresses_hit += 1,
                    Entry::Vacant(entry) => match self.get_tx_addresses_packed(&btxid)? {
                        Some(ita) => {
                            entry.insert(ita);
                            cbs.tx_addresses_miss += 1;
                        }
                        None => {
                            // pre-retention or missing history
                            warn!(
                                height = block.height,
                                tx = %tx.txid,
                                input_tx = %vin.txid,
                                "input tx not found in txAddresses"
                            );
                            continue;
                        }
                    },
                }
                let (addr_desc, value_sat) = {
                    let Some(ita) = tx_addresses_map.get_mut(&btxid) else {
                        continue;
                    };
                    let Some(spent_output) = ita.outputs.get_mut(vin.vout as usize) else {
                        warn!(
                            height = block.height,
                            tx = %tx.txid,
                            input_tx = %vin.txid,
                            vout = vin.vout,
                            "input vout out of bounds of stored tx"
                        );
                        continue;
                    };
                    if spent_output.spent {
                        warn!(
                            height = block.height,
                            tx = %tx.txid,
                            input_tx = %vin.txid,
                            vout = vin.vout,
                            "double spend detected"
                        );
                    }
                    spent_output.spent = true;
                    (
                        spent_output.addr_desc.clone(),
                        spent_output.value_sat.clone(),
                    )
                };
                if let Some(ta) = tx_addresses_map.get_mut(&spending_txid) {
                    if let Some(tai) = ta.inputs.get_mut(position) {
                        tai.addr_desc = addr_desc.clone();
                        tai.value_sat = value_sat.clone();
                    }
                }
                if addr_desc.is_empty() {
                    if !logged_empty {
                        warn!(
                            height = block.height,
                            tx = %tx.txid,
                            input_tx = %vin.txid,
                            vout = vin.vout,
                            "skipping input with empty address"
                        );
                        logged_empty = true;
                    }
                    continue;
                }
                let processed = addresses
                    .get(&addr_desc)
                    .is_some_and(|o| processed_in_tx(o, &spending_txid));
                addresses.entry(addr_desc.clone()).or_default().push(Outpoint {
                    btxid: spending_txid.clone(),
                    index: !(position as i32),
                });
                let ab = self.load_balance(balances, &addr_desc, &mut cbs)?;
                if !processed {
                    ab.txs += 1;
                }
                match ab.balance_sat.checked_sub(&value_sat) {
                    Some(balance) => ab.balance_sat = balance,
                    None => self.reset_value_to_zero(&mut ab.balance_sat, &addr_desc, "balance"),
                }
                ab.sent_sat += &value_sat;
            }
        }

        self.cbs.lock().merge(cbs);
        Ok(())
    }

    /// Fetch a balance into the working map on first touch; later touches in
    /// the same block hit the map.
    pub(crate) fn load_balance<'a>(
        &self,
        balances: &'a mut HashMap<AddrDescriptor, AddrBalance>,
        addr_desc: &AddrDescriptor,
        cbs: &mut ConnectBlockStats,
    ) -> Result<&'a mut AddrBalance, DbError> {
        match balances.entry(addr_desc.clone()) {
            Entry::Occupied(entry) => {
                cbs.balances_hit += 1;
                Ok(entry.into_mut())
            }
            Entry::Vacant(entry) => {
                cbs.balances_miss += 1;
                let ab = self.get_addr_desc_balance(addr_desc)?.unwrap_or_default();
                Ok(entry.insert(ab))
            }
        }
    }

    /// Clamp an accounting value that would go negative back to zero.
    /// Tolerates malformed chain histories instead of aborting the index.
    pub(crate) fn reset_value_to_zero(
        &self,
        value: &mut BigUint,
        addr_desc: &AddrDescriptor,
        kind: &str,
    ) {
        match self.parser.addresses_from_addr_desc(addr_desc) {
            Ok((addresses, _)) => warn!(
                addresses = ?addresses,
                descriptor = %addr_desc,
                "address reached negative {kind}, resetting to 0"
            ),
            Err(err) => warn!(
                descriptor = %addr_desc,
                %err,
                "unparsable address reached negative {kind}, resetting to 0"
            ),
        }
        *value = BigUint::default();
    }

    // --- Column writers ---

    fn store_addresses(
        &self,
        wb: &mut WriteBatch,
        height: u32,
        addresses: &HashMap<AddrDescriptor, Vec<Outpoint>>,
    ) -> Result<(), DbError> {
        let cf = self.cf(Column::Addresses)?;
        for (addr_desc, outpoints) in addresses {
            let key = pack_address_key(addr_desc.as_bytes(), height);
            let mut value = Vec::new();
            pack_outpoints(outpoints, &mut value);
            wb.put_cf(cf, key, value);
        }
        Ok(())
    }

    pub(crate) fn store_tx_addresses<'a, I>(
        &self,
        wb: &mut WriteBatch,
        items: I,
    ) -> Result<(), DbError>
    where
        I: IntoIterator<Item = (&'a Vec<u8>, &'a TxAddresses)>,
    {
        let cf = self.cf(Column::TxAddresses)?;
        let mut buf = Vec::with_capacity(1024);
        for (btxid, ta) in items {
            pack_tx_addresses(ta, &mut buf);
            wb.put_cf(cf, btxid, &buf);
        }
        Ok(())
    }

    pub(crate) fn store_balances<'a, I>(&self, wb: &mut WriteBatch, items: I) -> Result<(), DbError>
    where
        I: IntoIterator<Item = (&'a AddrDescriptor, Option<&'a AddrBalance>)>,
    {
        let cf = self.cf(Column::AddressBalance)?;
        let mut buf = Vec::with_capacity(64);
        for (addr_desc, balance) in items {
            match balance {
                // a balance down to zero transactions is removed, not stored
                Some(ab) if ab.txs > 0 => {
                    pack_addr_balance(ab, &mut buf);
                    wb.put_cf(cf, addr_desc.as_bytes(), &buf);
                }
                _ => wb.delete_cf(cf, addr_desc.as_bytes()),
            }
        }
        Ok(())
    }

    /// Write the retention record for this block and drop records that fell
    /// out of the retention window, walking backward from the boundary until
    /// the first missing height.
    fn store_and_cleanup_block_txs(&self, wb: &mut WriteBatch, block: &Block) -> Result<(), DbError> {
        let txid_len = self.parser.packed_txid_len();
        let zero_txid = vec![0u8; txid_len];
        let mut buf = Vec::with_capacity(txid_len * block.txs.len());
        for tx in &block.txs {
            let mut spent = Vec::with_capacity(tx.vin.len());
            for vin in &tx.vin {
                let btxid = match self.parser.pack_txid(&vin.txid) {
                    Ok(btxid) => btxid,
                    Err(ParserError::TxidMissing) => zero_txid.clone(),
                    Err(err) => return Err(err.into()),
                };
                spent.push(Outpoint {
                    btxid,
                    index: vin.vout as i32,
                });
            }
            buf.extend_from_slice(&self.parser.pack_txid(&tx.txid)?);
            pack_varuint(spent.len() as u64, &mut buf);
            pack_outpoints(&spent, &mut buf);
        }
        let cf = self.cf(Column::BlockTxs)?;
        wb.put_cf(cf, pack_u32(block.height), &buf);

        let keep = self.parser.keep_block_addresses();
        if block.height > keep {
            let mut height = block.height - keep;
            loop {
                let key = pack_u32(height);
                match self.db.get_cf(cf, key)? {
                    Some(value) if !value.is_empty() => wb.delete_cf(cf, key),
                    _ => break,
                }
                if height == 0 {
                    break;
                }
                height -= 1;
            }
        }
        Ok(())
    }

    pub(crate) fn write_height(
        &self,
        wb: &mut WriteBatch,
        block: &Block,
        op: BlockOp,
    ) -> Result<(), DbError> {
        let cf = self.cf(Column::Height)?;
        let key = pack_u32(block.height);
        match op {
            BlockOp::Insert => {
                let info = BlockInfo {
                    height: block.height,
                    hash: block.hash.clone(),
                    time: block.time,
                    txs: block.txs.len() as u32,
                    size: block.size,
                };
                wb.put_cf(cf, key, pack_block_info(&info, self.parser.as_ref())?);
            }
            BlockOp::Delete => wb.delete_cf(cf, key),
        }
        Ok(())
    }

    // --- Account-model chains ---

    /// Mapping-only indexing for chains whose inputs name senders directly:
    /// one address-index row per (address, height), outputs stored by their
    /// `n`, inputs by the one's complement of their position.
    pub(crate) fn write_addresses_account(
        &self,
        wb: &mut WriteBatch,
        block: &Block,
        op: BlockOp,
    ) -> Result<(), DbError> {
        let mut addresses: HashMap<AddrDescriptor, Vec<Outpoint>> = HashMap::new();
        for tx in &block.txs {
            let btxid = self.parser.pack_txid(&tx.txid)?;
            for vout in &tx.vout {
                match self.parser.addr_desc_from_vout(vout) {
                    Ok(addr_desc) => self.add_addr_desc_to_records(
                        op,
                        wb,
                        &mut addresses,
                        addr_desc,
                        &btxid,
                        vout.n as i32,
                        block.height,
                    )?,
                    Err(ParserError::AddressMissing) => {}
                    Err(err) => {
                        warn!(
                            height = block.height,
                            tx = %tx.txid,
                            vout = vout.n,
                            %err,
                            "cannot derive address descriptor"
                        );
                    }
                }
            }
            for vin in &tx.vin {
                for (position, address) in vin.addresses.iter().enumerate() {
                    match self.parser.addr_desc_from_address(address) {
                        Ok(addr_desc) => self.add_addr_desc_to_records(
                            op,
                            wb,
                            &mut addresses,
                            addr_desc,
                            &btxid,
                            !(position as i32),
                            block.height,
                        )?,
                        Err(err) => {
                            warn!(height = block.height, address = %address, %err, "cannot derive address descriptor");
                        }
                    }
                }
            }
        }
        let cf = self.cf(Column::Addresses)?;
        for (addr_desc, outpoints) in &addresses {
            let key = pack_address_key(addr_desc.as_bytes(), block.height);
            match op {
                BlockOp::Insert => {
                    let mut value = Vec::new();
                    pack_outpoints(outpoints, &mut value);
                    wb.put_cf(cf, key, value);
                }
                BlockOp::Delete => wb.delete_cf(cf, key),
            }
        }
        Ok(())
    }

    fn add_addr_desc_to_records(
        &self,
        op: BlockOp,
        wb: &mut WriteBatch,
        records: &mut HashMap<AddrDescriptor, Vec<Outpoint>>,
        addr_desc: AddrDescriptor,
        btxid: &[u8],
        index: i32,
        height: u32,
    ) -> Result<(), DbError> {
        if addr_desc.is_empty() {
            return Ok(());
        }
        if addr_desc.len() > MAX_ADDR_DESC_LEN {
            info!(
                height,
                len = addr_desc.len(),
                "skipping address descriptor outside indexable length"
            );
            return Ok(());
        }
        records.entry(addr_desc).or_default().push(Outpoint {
            btxid: btxid.to_vec(),
            index,
        });
        if op == BlockOp::Delete {
            // the disconnected tx leaves the raw-tx cache as well
            self.delete_tx_internal(wb, btxid)?;
        }
        Ok(())
    }
}

fn processed_in_tx(outpoints: &[Outpoint], btxid: &[u8]) -> bool {
    outpoints.iter().any(|o| o.btxid == btxid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processed_in_tx_matches_txid() {
        let outpoints = vec![
            Outpoint { btxid: vec![1; 32], index: 0 },
            Outpoint { btxid: vec![2; 32], index: !0 },
        ];
        assert!(processed_in_tx(&outpoints, &[1; 32]));
        assert!(processed_in_tx(&outpoints, &[2; 32]));
        assert!(!processed_in_tx(&outpoints, &[3; 32]));
        assert!(!processed_in_tx(&[], &[1; 32]));
    }

    #[test]
    fn stats_merge_accumulates() {
        let mut a = ConnectBlockStats {
            tx_addresses_hit: 1,
            tx_addresses_miss: 2,
            balances_hit: 3,
            balances_miss: 4,
        };
        a.merge(ConnectBlockStats {
            tx_addresses_hit: 10,
            tx_addresses_miss: 20,
            balances_hit: 30,
            balances_miss: 40,
        });
        assert_eq!(a.tx_addresses_hit, 11);
        assert_eq!(a.tx_addresses_miss, 22);
        assert_eq!(a.balances_hit, 33);
        assert_eq!(a.balances_miss, 44);
    }
}
