//! Error types shared across the spyglass workspace.
use thiserror::Error;

/// Failures while decoding persisted bytes.
///
/// Any of these while reading a stored value means the record is corrupt or
/// was written by an incompatible codec; callers treat them as fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input")] UnexpectedEof,
    #[error("varint overflows 64 bits")] VarintOverflow,
    #[error("invalid address key of length {0}")] InvalidAddressKey(usize),
    #[error("invalid fixed-width integer")] InvalidFixedInt,
}

/// Errors produced by a [`ChainParser`](crate::parser::ChainParser)
/// implementation.
///
/// `AddressMissing` and `TxidMissing` are sentinels, not failures: outputs
/// without an address (for example contract creations) and inputs without a
/// referenced txid (coinbase) are expected and silently skipped by the index.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParserError {
    #[error("address missing")] AddressMissing,
    #[error("txid missing")] TxidMissing,
    #[error("invalid txid: {0}")] InvalidTxid(String),
    #[error("invalid block hash: {0}")] InvalidBlockHash(String),
    #[error("invalid address: {0}")] InvalidAddress(String),
    #[error("transaction serialization: {0}")] TxSerialization(String),
}
