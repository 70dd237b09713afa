//! The chain parser capability consumed by the storage engine.
//!
//! A [`ChainParser`] abstracts everything chain-specific: the packed byte
//! form of txids and block hashes, script-to-descriptor mapping, the
//! transaction model (UTXO vs account) and the rollback retention window.
//! The engine itself never inspects scripts or hashes.

use serde::{Deserialize, Serialize};

use crate::error::ParserError;
use crate::types::{AddrDescriptor, Tx, Vout};

/// Chain-specific packing and address resolution.
///
/// Implementations must be cheap to call; `pack_txid` in particular runs for
/// every input and output of every indexed transaction.
pub trait ChainParser: Send + Sync {
    /// Length in bytes of a packed txid. All packed txids and block hashes
    /// produced by this parser must have exactly this length.
    fn packed_txid_len(&self) -> usize;

    /// Pack a txid string into its fixed-length byte form.
    ///
    /// Returns [`ParserError::TxidMissing`] for inputs without a referenced
    /// transaction (coinbase); the engine skips those silently.
    fn pack_txid(&self, txid: &str) -> Result<Vec<u8>, ParserError>;

    /// Reverse of [`pack_txid`](Self::pack_txid).
    fn unpack_txid(&self, buf: &[u8]) -> Result<String, ParserError>;

    /// Pack a block hash string into its fixed-length byte form.
    fn pack_block_hash(&self, hash: &str) -> Result<Vec<u8>, ParserError>;

    /// Reverse of [`pack_block_hash`](Self::pack_block_hash).
    fn unpack_block_hash(&self, buf: &[u8]) -> Result<String, ParserError>;

    /// Whether inputs reference prior outputs (UTXO model) rather than
    /// naming sender addresses directly.
    fn is_utxo_chain(&self) -> bool;

    /// Rollback retention window in blocks: how many recent blocks keep
    /// their spent-outpoint records for disconnect support.
    fn keep_block_addresses(&self) -> u32;

    /// Derive the address descriptor of an output script.
    ///
    /// Returns [`ParserError::AddressMissing`] for outputs that have no
    /// address (for example contract creations); the engine treats those as
    /// "no index entry" without logging.
    fn addr_desc_from_vout(&self, vout: &Vout) -> Result<AddrDescriptor, ParserError>;

    /// Derive the address descriptor of an address string.
    fn addr_desc_from_address(&self, address: &str) -> Result<AddrDescriptor, ParserError>;

    /// Render a descriptor back into address strings. The boolean reports
    /// whether the rendering is searchable (lossless enough to round-trip
    /// through [`addr_desc_from_address`](Self::addr_desc_from_address)).
    fn addresses_from_addr_desc(
        &self,
        addr_desc: &AddrDescriptor,
    ) -> Result<(Vec<String>, bool), ParserError>;

    /// Opaque serialization of a transaction for the raw-tx cache.
    fn pack_tx(&self, tx: &Tx, height: u32, block_time: i64) -> Result<Vec<u8>, ParserError>;

    /// Reverse of [`pack_tx`](Self::pack_tx), returning the transaction and
    /// the height it was cached at.
    fn unpack_tx(&self, buf: &[u8]) -> Result<(Tx, u32), ParserError>;
}

/// Reference parser for development and tests.
///
/// Txids and block hashes are 64-character hex strings packed to 32 bytes,
/// address descriptors are the raw output script bytes, and the raw-tx cache
/// serialization is JSON. Real chains plug in their own implementation.
#[derive(Debug, Clone)]
pub struct HexParser {
    /// Whether the simulated chain uses the UTXO transaction model.
    pub utxo: bool,
    /// Rollback retention window in blocks.
    pub retention: u32,
}

impl HexParser {
    const PACKED_LEN: usize = 32;

    /// A UTXO-model parser with the given retention window.
    pub fn utxo(retention: u32) -> Self {
        Self { utxo: true, retention }
    }

    /// An account-model parser (no retention buffer needed).
    pub fn account() -> Self {
        Self { utxo: false, retention: 0 }
    }

    fn unhex(s: &str) -> Result<Vec<u8>, ParserError> {
        let bytes = hex::decode(s).map_err(|_| ParserError::InvalidTxid(s.to_string()))?;
        if bytes.len() != Self::PACKED_LEN {
            return Err(ParserError::InvalidTxid(s.to_string()));
        }
        Ok(bytes)
    }
}

impl Default for HexParser {
    fn default() -> Self {
        Self::utxo(300)
    }
}

#[derive(Serialize, Deserialize)]
struct CachedTx {
    tx: Tx,
    height: u32,
    block_time: i64,
}

impl ChainParser for HexParser {
    fn packed_txid_len(&self) -> usize {
        Self::PACKED_LEN
    }

    fn pack_txid(&self, txid: &str) -> Result<Vec<u8>, ParserError> {
        if txid.is_empty() {
            return Err(ParserError::TxidMissing);
        }
        Self::unhex(txid)
    }

    fn unpack_txid(&self, buf: &[u8]) -> Result<String, ParserError> {
        if buf.len() != Self::PACKED_LEN {
            return Err(ParserError::InvalidTxid(hex::encode(buf)));
        }
        Ok(hex::encode(buf))
    }

    fn pack_block_hash(&self, hash: &str) -> Result<Vec<u8>, ParserError> {
        Self::unhex(hash).map_err(|_| ParserError::InvalidBlockHash(hash.to_string()))
    }

    fn unpack_block_hash(&self, buf: &[u8]) -> Result<String, ParserError> {
        if buf.len() != Self::PACKED_LEN {
            return Err(ParserError::InvalidBlockHash(hex::encode(buf)));
        }
        Ok(hex::encode(buf))
    }

    fn is_utxo_chain(&self) -> bool {
        self.utxo
    }

    fn keep_block_addresses(&self) -> u32 {
        self.retention
    }

    fn addr_desc_from_vout(&self, vout: &Vout) -> Result<AddrDescriptor, ParserError> {
        if vout.script_pubkey.is_empty() {
            return Err(ParserError::AddressMissing);
        }
        Ok(AddrDescriptor::new(vout.script_pubkey.clone()))
    }

    fn addr_desc_from_address(&self, address: &str) -> Result<AddrDescriptor, ParserError> {
        if address.is_empty() {
            return Err(ParserError::AddressMissing);
        }
        hex::decode(address)
            .map(AddrDescriptor::new)
            .map_err(|_| ParserError::InvalidAddress(address.to_string()))
    }

    fn addresses_from_addr_desc(
        &self,
        addr_desc: &AddrDescriptor,
    ) -> Result<(Vec<String>, bool), ParserError> {
        Ok((vec![addr_desc.to_string()], true))
    }

    fn pack_tx(&self, tx: &Tx, height: u32, block_time: i64) -> Result<Vec<u8>, ParserError> {
        let cached = CachedTx { tx: tx.clone(), height, block_time };
        serde_json::to_vec(&cached).map_err(|e| ParserError::TxSerialization(e.to_string()))
    }

    fn unpack_tx(&self, buf: &[u8]) -> Result<(Tx, u32), ParserError> {
        let cached: CachedTx = serde_json::from_slice(buf)
            .map_err(|e| ParserError::TxSerialization(e.to_string()))?;
        Ok((cached.tx, cached.height))
    }
}
