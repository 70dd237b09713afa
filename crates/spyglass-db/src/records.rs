//! On-disk record layouts of the individual columns.
//!
//! Each record codec composes the primitive codecs from
//! [`spyglass_core::codec`]; the byte layouts are part of the storage
//! contract. Decoding is bounds-checked and returns [`CodecError`] on
//! malformed bytes — persisted data that fails to decode means the column is
//! corrupt.

use num_bigint::BigUint;

use spyglass_core::codec::{
    pack_bigint, pack_u32, pack_varint, pack_varint32, pack_varuint, unpack_bigint, unpack_u32,
    unpack_varint, unpack_varint32, unpack_varuint, PACKED_HEIGHT_BYTES,
};
use spyglass_core::{AddrDescriptor, ChainParser, CodecError};

use crate::error::DbError;

/// Reference to one output (or input position) of a transaction.
///
/// A non-negative index means "output at that position"; a negative index is
/// the one's complement of an input position. The sign carries the
/// input/output distinction without a separate tag byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outpoint {
    /// Packed txid of the transaction.
    pub btxid: Vec<u8>,
    /// Output position, or one's complement of the input position.
    pub index: i32,
}

/// Resolved input of an indexed transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxInput {
    /// Descriptor of the address the input spends from; empty if unknown.
    pub addr_desc: AddrDescriptor,
    /// Value consumed by the input.
    pub value_sat: BigUint,
}

/// Resolved output of an indexed transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxOutput {
    /// Descriptor of the receiving address; empty if not decodable.
    pub addr_desc: AddrDescriptor,
    /// Whether a later transaction has consumed this output.
    pub spent: bool,
    /// Output value.
    pub value_sat: BigUint,
}

/// The full resolved picture of one transaction: which addresses moved what.
///
/// Stored under the packed txid; mutated in place when a later transaction
/// spends one of the outputs (the spent flag flips).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxAddresses {
    /// Height of the block containing the transaction.
    pub height: u32,
    /// Resolved inputs, in transaction order.
    pub inputs: Vec<TxInput>,
    /// Resolved outputs, in transaction order.
    pub outputs: Vec<TxOutput>,
}

/// Running totals for one address descriptor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddrBalance {
    /// Number of distinct transactions the address participates in.
    pub txs: u32,
    /// Total value ever sent from the address.
    pub sent_sat: BigUint,
    /// Current balance.
    pub balance_sat: BigUint,
}

impl AddrBalance {
    /// Total value ever received: balance plus everything sent.
    pub fn received_sat(&self) -> BigUint {
        &self.balance_sat + &self.sent_sat
    }
}

/// Block metadata stored in the height column.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockInfo {
    /// Block height; key of the record, not part of the packed value.
    pub height: u32,
    /// Block hash in the chain's string form.
    pub hash: String,
    /// Block timestamp, unix seconds.
    pub time: i64,
    /// Number of transactions in the block.
    pub txs: u32,
    /// Serialized block size in bytes.
    pub size: u32,
}

/// One transaction's entry in the block-tx retention buffer: its packed txid
/// and the outpoints its inputs consumed. The minimum information needed to
/// reverse a connected block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockTxs {
    /// Packed txid.
    pub btxid: Vec<u8>,
    /// Outpoints spent by the transaction's inputs, `index` holding the
    /// referenced vout (non-negative here).
    pub inputs: Vec<Outpoint>,
}

// --- Outpoint lists (addresses column values, retention buffer) ---

/// Append `(packed txid ∥ varint32 index)` for each outpoint.
pub fn pack_outpoints(outpoints: &[Outpoint], buf: &mut Vec<u8>) {
    for o in outpoints {
        buf.extend_from_slice(&o.btxid);
        pack_varint32(o.index, buf);
    }
}

/// Decode a whole buffer of packed outpoints.
pub fn unpack_outpoints(buf: &[u8], txid_len: usize) -> Result<Vec<Outpoint>, CodecError> {
    let mut outpoints = Vec::new();
    let mut i = 0;
    while i < buf.len() {
        let btxid = buf
            .get(i..i + txid_len)
            .ok_or(CodecError::UnexpectedEof)?
            .to_vec();
        i += txid_len;
        let (index, l) = unpack_varint32(&buf[i..])?;
        i += l;
        outpoints.push(Outpoint { btxid, index });
    }
    Ok(outpoints)
}

/// Decode a count-prefixed outpoint list, returning the outpoints and the
/// number of bytes consumed.
pub fn unpack_n_outpoints(
    buf: &[u8],
    txid_len: usize,
) -> Result<(Vec<Outpoint>, usize), CodecError> {
    let (n, mut p) = unpack_varuint(buf)?;
    let mut outpoints = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let btxid = buf
            .get(p..p + txid_len)
            .ok_or(CodecError::UnexpectedEof)?
            .to_vec();
        p += txid_len;
        let (index, l) = unpack_varint32(&buf[p..])?;
        p += l;
        outpoints.push(Outpoint { btxid, index });
    }
    Ok((outpoints, p))
}

// --- Tx-addresses records ---

/// Pack a [`TxAddresses`] record. The buffer is cleared first so it can be
/// reused across transactions of a block.
pub fn pack_tx_addresses(ta: &TxAddresses, buf: &mut Vec<u8>) {
    buf.clear();
    pack_varuint(u64::from(ta.height), buf);
    pack_varuint(ta.inputs.len() as u64, buf);
    for input in &ta.inputs {
        pack_varuint(input.addr_desc.len() as u64, buf);
        buf.extend_from_slice(input.addr_desc.as_bytes());
        pack_bigint(&input.value_sat, buf);
    }
    pack_varuint(ta.outputs.len() as u64, buf);
    for output in &ta.outputs {
        // The spent flag rides in the sign of the address length.
        let len = output.addr_desc.len() as i64;
        pack_varint(if output.spent { !len } else { len }, buf);
        buf.extend_from_slice(output.addr_desc.as_bytes());
        pack_bigint(&output.value_sat, buf);
    }
}

/// Decode a [`TxAddresses`] record.
pub fn unpack_tx_addresses(buf: &[u8]) -> Result<TxAddresses, CodecError> {
    let (height, mut p) = unpack_varuint(buf)?;
    let mut ta = TxAddresses {
        height: height as u32,
        ..Default::default()
    };

    let (input_count, l) = unpack_varuint(&buf[p..])?;
    p += l;
    ta.inputs.reserve(input_count as usize);
    for _ in 0..input_count {
        let (addr_len, l) = unpack_varuint(&buf[p..])?;
        p += l;
        let addr = buf
            .get(p..p + addr_len as usize)
            .ok_or(CodecError::UnexpectedEof)?;
        p += addr_len as usize;
        let (value_sat, l) = unpack_bigint(&buf[p..])?;
        p += l;
        ta.inputs.push(TxInput {
            addr_desc: AddrDescriptor::from(addr),
            value_sat,
        });
    }

    let (output_count, l) = unpack_varuint(&buf[p..])?;
    p += l;
    ta.outputs.reserve(output_count as usize);
    for _ in 0..output_count {
        let (tagged_len, l) = unpack_varint(&buf[p..])?;
        p += l;
        let (spent, addr_len) = if tagged_len < 0 {
            (true, !tagged_len as usize)
        } else {
            (false, tagged_len as usize)
        };
        let addr = buf
            .get(p..p + addr_len)
            .ok_or(CodecError::UnexpectedEof)?;
        p += addr_len;
        let (value_sat, l) = unpack_bigint(&buf[p..])?;
        p += l;
        ta.outputs.push(TxOutput {
            addr_desc: AddrDescriptor::from(addr),
            spent,
            value_sat,
        });
    }

    Ok(ta)
}

// --- Address balances ---

/// Pack an [`AddrBalance`] value. The buffer is cleared first.
pub fn pack_addr_balance(ab: &AddrBalance, buf: &mut Vec<u8>) {
    buf.clear();
    pack_varuint(u64::from(ab.txs), buf);
    pack_bigint(&ab.sent_sat, buf);
    pack_bigint(&ab.balance_sat, buf);
}

/// Decode an [`AddrBalance`] value.
pub fn unpack_addr_balance(buf: &[u8]) -> Result<AddrBalance, CodecError> {
    let (txs, p) = unpack_varuint(buf)?;
    let (sent_sat, l) = unpack_bigint(&buf[p..])?;
    let (balance_sat, _) = unpack_bigint(&buf[p + l..])?;
    Ok(AddrBalance {
        txs: txs as u32,
        sent_sat,
        balance_sat,
    })
}

// --- Block info ---

/// Pack a [`BlockInfo`] value (the height is the key, not packed).
pub fn pack_block_info(bi: &BlockInfo, parser: &dyn ChainParser) -> Result<Vec<u8>, DbError> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&parser.pack_block_hash(&bi.hash)?);
    buf.extend_from_slice(&pack_u32(bi.time as u32));
    pack_varuint(u64::from(bi.txs), &mut buf);
    pack_varuint(u64::from(bi.size), &mut buf);
    Ok(buf)
}

/// Decode a [`BlockInfo`] value; `height` is supplied by the caller from the
/// record key. Returns `None` for values too short to be a block info.
pub fn unpack_block_info(
    buf: &[u8],
    height: u32,
    parser: &dyn ChainParser,
) -> Result<Option<BlockInfo>, DbError> {
    let pl = parser.packed_txid_len();
    // hash + 4 bytes time + at least 1 byte txs + 1 byte size
    if buf.len() < pl + PACKED_HEIGHT_BYTES + 2 {
        return Ok(None);
    }
    let hash = parser.unpack_block_hash(&buf[..pl])?;
    let time = unpack_u32(&buf[pl..]).map_err(DbError::inconsistent("height"))?;
    let (txs, l) =
        unpack_varuint(&buf[pl + PACKED_HEIGHT_BYTES..]).map_err(DbError::inconsistent("height"))?;
    let (size, _) = unpack_varuint(&buf[pl + PACKED_HEIGHT_BYTES + l..])
        .map_err(DbError::inconsistent("height"))?;
    Ok(Some(BlockInfo {
        height,
        hash,
        time: i64::from(time),
        txs: txs as u32,
        size: size as u32,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use spyglass_core::parser::HexParser;

    fn btxid(seed: u8) -> Vec<u8> {
        vec![seed; 32]
    }

    fn desc(bytes: &[u8]) -> AddrDescriptor {
        AddrDescriptor::from(bytes)
    }

    #[test]
    fn outpoints_round_trip() {
        let outpoints = vec![
            Outpoint { btxid: btxid(1), index: 0 },
            Outpoint { btxid: btxid(2), index: 5 },
            Outpoint { btxid: btxid(3), index: !2 },
        ];
        let mut buf = Vec::new();
        pack_outpoints(&outpoints, &mut buf);
        assert_eq!(unpack_outpoints(&buf, 32).unwrap(), outpoints);
    }

    #[test]
    fn outpoints_empty_buffer() {
        assert!(unpack_outpoints(&[], 32).unwrap().is_empty());
    }

    #[test]
    fn outpoints_truncated_errors() {
        let mut buf = Vec::new();
        pack_outpoints(&[Outpoint { btxid: btxid(1), index: 3 }], &mut buf);
        buf.truncate(16);
        assert!(unpack_outpoints(&buf, 32).is_err());
    }

    #[test]
    fn n_outpoints_round_trip_with_trailing_data() {
        let outpoints = vec![
            Outpoint { btxid: btxid(9), index: 1 },
            Outpoint { btxid: btxid(8), index: !0 },
        ];
        let mut buf = Vec::new();
        pack_varuint(outpoints.len() as u64, &mut buf);
        pack_outpoints(&outpoints, &mut buf);
        let record_len = buf.len();
        buf.extend_from_slice(&[0xEE; 7]); // next record in the same value

        let (decoded, consumed) = unpack_n_outpoints(&buf, 32).unwrap();
        assert_eq!(decoded, outpoints);
        assert_eq!(consumed, record_len);
    }

    #[test]
    fn tx_addresses_round_trip() {
        let ta = TxAddresses {
            height: 123_456,
            inputs: vec![
                TxInput {
                    addr_desc: desc(b"addr-one"),
                    value_sat: BigUint::from(5_000_000_000u64),
                },
                TxInput {
                    addr_desc: AddrDescriptor::default(),
                    value_sat: BigUint::default(),
                },
            ],
            outputs: vec![
                TxOutput {
                    addr_desc: desc(b"addr-two"),
                    spent: false,
                    value_sat: BigUint::from(3_000_000_000u64),
                },
                TxOutput {
                    addr_desc: desc(b"addr-three"),
                    spent: true,
                    value_sat: BigUint::from(1_999_000_000u64),
                },
            ],
        };
        let mut buf = Vec::new();
        pack_tx_addresses(&ta, &mut buf);
        assert_eq!(unpack_tx_addresses(&buf).unwrap(), ta);
    }

    #[test]
    fn tx_addresses_spent_flag_negates_length() {
        let spent = TxAddresses {
            height: 1,
            inputs: vec![],
            outputs: vec![TxOutput {
                addr_desc: desc(b"abc"),
                spent: true,
                value_sat: BigUint::from(7u8),
            }],
        };
        let mut unspent = spent.clone();
        unspent.outputs[0].spent = false;

        let (mut sbuf, mut ubuf) = (Vec::new(), Vec::new());
        pack_tx_addresses(&spent, &mut sbuf);
        pack_tx_addresses(&unspent, &mut ubuf);
        assert_ne!(sbuf, ubuf);
        // height, input count, output count, then the tagged address length
        let mut tagged = Vec::new();
        pack_varint(!3i64, &mut tagged);
        assert_eq!(sbuf[3], tagged[0]);
        let mut plain = Vec::new();
        pack_varint(3i64, &mut plain);
        assert_eq!(ubuf[3], plain[0]);
    }

    #[test]
    fn tx_addresses_empty_tx() {
        let ta = TxAddresses { height: 9, inputs: vec![], outputs: vec![] };
        let mut buf = Vec::new();
        pack_tx_addresses(&ta, &mut buf);
        assert_eq!(buf.len(), 3);
        assert_eq!(unpack_tx_addresses(&buf).unwrap(), ta);
    }

    #[test]
    fn tx_addresses_truncated_errors() {
        let ta = TxAddresses {
            height: 1,
            inputs: vec![TxInput {
                addr_desc: desc(b"somewhere"),
                value_sat: BigUint::from(10u8),
            }],
            outputs: vec![],
        };
        let mut buf = Vec::new();
        pack_tx_addresses(&ta, &mut buf);
        for cut in 1..buf.len() {
            assert!(
                unpack_tx_addresses(&buf[..cut]).is_err(),
                "decode of {cut}-byte prefix should fail"
            );
        }
    }

    #[test]
    fn addr_balance_round_trip() {
        let ab = AddrBalance {
            txs: 42,
            sent_sat: BigUint::from(1_000u32),
            balance_sat: BigUint::from(2_500u32),
        };
        let mut buf = Vec::new();
        pack_addr_balance(&ab, &mut buf);
        assert_eq!(unpack_addr_balance(&buf).unwrap(), ab);
        assert_eq!(ab.received_sat(), BigUint::from(3_500u32));
    }

    #[test]
    fn addr_balance_zero_is_three_bytes() {
        let mut buf = Vec::new();
        pack_addr_balance(&AddrBalance::default(), &mut buf);
        assert_eq!(buf, [0x00, 0x00, 0x00]);
    }

    #[test]
    fn block_info_round_trip() {
        let parser = HexParser::default();
        let bi = BlockInfo {
            height: 840_000,
            hash: hex::encode([0xBB; 32]),
            time: 1_713_571_767,
            txs: 3_050,
            size: 2_325_617,
        };
        let buf = pack_block_info(&bi, &parser).unwrap();
        let decoded = unpack_block_info(&buf, 840_000, &parser).unwrap().unwrap();
        assert_eq!(decoded, bi);
    }

    #[test]
    fn block_info_short_value_is_none() {
        let parser = HexParser::default();
        assert!(unpack_block_info(&[0; 10], 1, &parser).unwrap().is_none());
    }
}
