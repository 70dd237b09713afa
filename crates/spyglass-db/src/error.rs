//! Error types for the block index storage engine.

use spyglass_core::{CodecError, ParserError};
use thiserror::Error;

/// Errors surfaced by the storage engine.
///
/// Storage failures leave the database in its last committed state; the
/// open-time failures (`VersionMismatch`, `CoinMismatch`) are fatal and have
/// no recovery path other than a rebuild.
#[derive(Error, Debug)]
pub enum DbError {
    /// Underlying store failure.
    #[error("rocksdb: {0}")]
    Rocksdb(#[from] rocksdb::Error),

    /// Corrupt or incompatible bytes while decoding a persisted value.
    #[error("inconsistent data in column '{column}': {source}")]
    InconsistentData {
        column: &'static str,
        source: CodecError,
    },

    /// Chain parser failure that is not one of the skip sentinels.
    #[error(transparent)]
    Parser(#[from] ParserError),

    /// The stored column version does not match this build's version.
    #[error(
        "version {stored} of column '{column}' does not match required version {required}, \
         the database is not compatible"
    )]
    VersionMismatch {
        column: String,
        stored: u32,
        required: u32,
    },

    /// The stored coin name differs from the one the caller runs with.
    #[error("coins do not match: db coin '{db_coin}', requested coin '{requested}'")]
    CoinMismatch { db_coin: String, requested: String },

    /// Disconnect of a range whose retention records are no longer kept.
    #[error("cannot disconnect blocks at height {height} and lower, the index must be rebuilt")]
    RetentionMiss { height: u32 },

    /// Single-block disconnect is impossible on UTXO chains: the block
    /// payload does not carry input addresses.
    #[error("single-block disconnect is not supported for utxo chains")]
    DisconnectNotSupported,

    /// A cancellable scan observed its cancellation signal.
    #[error("interrupted")]
    Interrupted,

    /// An operation that needs the internal state ran before it was loaded.
    #[error("internal state not loaded")]
    StateNotLoaded,

    /// A column family handle is missing from the opened database.
    #[error("missing column family '{0}'")]
    MissingColumn(&'static str),

    /// Internal-state record (de)serialization failure.
    #[error("internal state: {0}")]
    State(#[from] serde_json::Error),

    /// Filesystem error (size scan, repair).
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl DbError {
    /// Tag a codec failure with the column it was found in.
    pub(crate) fn inconsistent(column: &'static str) -> impl FnOnce(CodecError) -> DbError {
        move |source| DbError::InconsistentData { column, source }
    }
}
