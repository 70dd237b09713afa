//! Input block and transaction structures consumed by the index.
//!
//! These are the chain-neutral shapes the sync loop hands to the storage
//! engine. Monetary values are arbitrary-precision non-negative integers in
//! the chain's smallest unit; scripts and descriptors are opaque byte
//! strings interpreted only by the chain parser.

use std::fmt;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

/// An opaque byte string identifying a payee.
///
/// Produced by the chain parser from an output script or an address string.
/// Byte equality means payee equality; the index never interprets the
/// contents. Descriptors longer than the engine's limit (1024 bytes) are not
/// indexed.
#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddrDescriptor(Vec<u8>);

impl AddrDescriptor {
    /// Wrap raw descriptor bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The descriptor bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the descriptor is empty (no indexable address).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consume the wrapper and return the bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Display for AddrDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for AddrDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AddrDescriptor({})", hex::encode(&self.0))
    }
}

impl From<Vec<u8>> for AddrDescriptor {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for AddrDescriptor {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl AsRef<[u8]> for AddrDescriptor {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A transaction input as delivered by the chain-specific block fetcher.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Vin {
    /// Txid of the referenced transaction. Empty for coinbase inputs.
    pub txid: String,
    /// Output index within the referenced transaction.
    pub vout: u32,
    /// Sender addresses, populated only on account-model chains.
    pub addresses: Vec<String>,
}

/// A transaction output as delivered by the chain-specific block fetcher.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Vout {
    /// Output position within the transaction.
    pub n: u32,
    /// Output value in the chain's smallest unit.
    pub value_sat: BigUint,
    /// Raw output script, turned into an address descriptor by the parser.
    pub script_pubkey: Vec<u8>,
}

/// A transaction: ordered inputs and outputs plus its chain-level id.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Tx {
    /// Transaction id in the chain's canonical string form.
    pub txid: String,
    /// Inputs consuming previous outputs (or naming senders).
    pub vin: Vec<Vin>,
    /// Outputs created by this transaction.
    pub vout: Vec<Vout>,
}

/// A block handed to the index: metadata plus ordered transactions.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Block {
    /// Height of the block in the chain.
    pub height: u32,
    /// Block hash in the chain's canonical string form.
    pub hash: String,
    /// Block timestamp, unix seconds.
    pub time: i64,
    /// Serialized block size in bytes.
    pub size: u32,
    /// Ordered transactions of the block.
    pub txs: Vec<Tx>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_descriptor_wraps_bytes() {
        let d = AddrDescriptor::new(vec![0xAB, 0xCD]);
        assert_eq!(d.as_bytes(), &[0xAB, 0xCD]);
        assert_eq!(d.len(), 2);
        assert!(!d.is_empty());
        assert_eq!(d.into_bytes(), vec![0xAB, 0xCD]);
    }

    #[test]
    fn addr_descriptor_empty() {
        let d = AddrDescriptor::default();
        assert!(d.is_empty());
        assert_eq!(d.len(), 0);
    }

    #[test]
    fn addr_descriptor_displays_hex() {
        let d = AddrDescriptor::new(vec![0x00, 0xFF, 0x10]);
        assert_eq!(format!("{d}"), "00ff10");
    }

    #[test]
    fn addr_descriptor_equality_is_byte_equality() {
        let a = AddrDescriptor::new(vec![1, 2, 3]);
        let b = AddrDescriptor::from(&[1u8, 2, 3][..]);
        let c = AddrDescriptor::new(vec![1, 2, 4]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn vout_default_is_zero_value() {
        let v = Vout::default();
        assert_eq!(v.value_sat, BigUint::default());
        assert!(v.script_pubkey.is_empty());
    }
}
