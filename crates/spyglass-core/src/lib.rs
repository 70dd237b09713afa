//! # spyglass-core
//! Foundation types, binary codecs, and the chain parser contract for the
//! spyglass block index.

pub mod codec;
pub mod error;
pub mod parser;
pub mod types;

pub use error::{CodecError, ParserError};
pub use parser::ChainParser;
pub use types::{AddrDescriptor, Block, Tx, Vin, Vout};
