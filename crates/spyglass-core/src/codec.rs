//! Binary codecs for the persisted key/value layouts.
//!
//! These encodings are the storage compatibility surface: existing databases
//! hold bytes in exactly these layouts, so every function here must produce
//! byte-identical output for identical inputs across versions.
//!
//! - fixed 4-byte big-endian `u32` (heights, address-key suffixes)
//! - little-endian base-128 varuint, 7 bits per byte, high bit continues
//! - zig-zag signed varint on top of the varuint
//! - packed big integer: one length byte followed by the big-endian
//!   magnitude, zero encoded as a lone zero length byte
//! - address key: descriptor bytes followed by the big-endian height
//!
//! Packing appends to a caller-provided buffer; unpacking returns the value
//! together with the number of bytes consumed.

use num_bigint::BigUint;
use num_traits::Zero;

use crate::error::CodecError;

/// Number of trailing bytes of an address key holding the block height.
pub const PACKED_HEIGHT_BYTES: usize = 4;

/// Maximum encoded length of a 64-bit varuint.
pub const MAX_VARUINT_LEN: usize = 10;

/// Maximum total length of a packed big integer (1 length byte + magnitude).
pub const MAX_PACKED_BIGINT_BYTES: usize = 249;

/// Maximum magnitude carried by a packed big integer; longer magnitudes are
/// truncated to this many most-significant bytes.
pub const MAX_BIGINT_MAGNITUDE_BYTES: usize = MAX_PACKED_BIGINT_BYTES - 1;

/// Pack a `u32` as 4 big-endian bytes.
pub fn pack_u32(v: u32) -> [u8; PACKED_HEIGHT_BYTES] {
    v.to_be_bytes()
}

/// Unpack a big-endian `u32` from the start of `buf`.
pub fn unpack_u32(buf: &[u8]) -> Result<u32, CodecError> {
    let bytes: [u8; PACKED_HEIGHT_BYTES] = buf
        .get(..PACKED_HEIGHT_BYTES)
        .ok_or(CodecError::InvalidFixedInt)?
        .try_into()
        .map_err(|_| CodecError::InvalidFixedInt)?;
    Ok(u32::from_be_bytes(bytes))
}

/// Append the varuint encoding of `v` to `buf`.
pub fn pack_varuint(mut v: u64, buf: &mut Vec<u8>) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Decode a varuint from the start of `buf`, returning the value and the
/// number of bytes consumed.
pub fn unpack_varuint(buf: &[u8]) -> Result<(u64, usize), CodecError> {
    let mut v: u64 = 0;
    let mut shift = 0;
    for (i, &b) in buf.iter().enumerate() {
        if i >= MAX_VARUINT_LEN || (i == MAX_VARUINT_LEN - 1 && b > 1) {
            return Err(CodecError::VarintOverflow);
        }
        v |= u64::from(b & 0x7F) << shift;
        if b & 0x80 == 0 {
            return Ok((v, i + 1));
        }
        shift += 7;
    }
    Err(CodecError::UnexpectedEof)
}

/// Append the zig-zag varint encoding of `v` to `buf`.
pub fn pack_varint(v: i64, buf: &mut Vec<u8>) {
    pack_varuint(zigzag(v), buf);
}

/// Decode a zig-zag varint from the start of `buf`.
pub fn unpack_varint(buf: &[u8]) -> Result<(i64, usize), CodecError> {
    let (u, l) = unpack_varuint(buf)?;
    Ok((unzigzag(u), l))
}

/// Append the zig-zag varint encoding of a 32-bit value to `buf`.
///
/// Used for outpoint indexes, where inputs are distinguished from outputs by
/// one's-complement negation of the position.
pub fn pack_varint32(v: i32, buf: &mut Vec<u8>) {
    pack_varint(i64::from(v), buf);
}

/// Decode a zig-zag varint from the start of `buf` as a 32-bit value.
pub fn unpack_varint32(buf: &[u8]) -> Result<(i32, usize), CodecError> {
    let (v, l) = unpack_varint(buf)?;
    Ok((v as i32, l))
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn unzigzag(u: u64) -> i64 {
    ((u >> 1) as i64) ^ -((u & 1) as i64)
}

/// Append the packed form of a non-negative big integer to `buf`.
///
/// Layout: one length byte `L` followed by `L` big-endian magnitude bytes;
/// zero is a lone zero length byte. Magnitudes longer than
/// [`MAX_BIGINT_MAGNITUDE_BYTES`] are truncated to their most-significant
/// bytes and the anomaly is logged — amounts of that size do not occur on
/// real chains.
pub fn pack_bigint(v: &BigUint, buf: &mut Vec<u8>) {
    if v.is_zero() {
        buf.push(0);
        return;
    }
    let bytes = v.to_bytes_be();
    let take = bytes.len().min(MAX_BIGINT_MAGNITUDE_BYTES);
    if bytes.len() > take {
        tracing::warn!(
            magnitude_bytes = bytes.len(),
            "truncating oversized bigint to {take} bytes"
        );
    }
    buf.push(take as u8);
    buf.extend_from_slice(&bytes[..take]);
}

/// Decode a packed big integer from the start of `buf`.
pub fn unpack_bigint(buf: &[u8]) -> Result<(BigUint, usize), CodecError> {
    let l = *buf.first().ok_or(CodecError::UnexpectedEof)? as usize;
    let magnitude = buf.get(1..1 + l).ok_or(CodecError::UnexpectedEof)?;
    Ok((BigUint::from_bytes_be(magnitude), l + 1))
}

/// Build an address-index key: descriptor bytes followed by the big-endian
/// height, so heights sort numerically within one descriptor.
pub fn pack_address_key(addr_desc: &[u8], height: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(addr_desc.len() + PACKED_HEIGHT_BYTES);
    key.extend_from_slice(addr_desc);
    key.extend_from_slice(&pack_u32(height));
    key
}

/// Split an address-index key into descriptor bytes and height.
pub fn unpack_address_key(key: &[u8]) -> Result<(&[u8], u32), CodecError> {
    if key.len() <= PACKED_HEIGHT_BYTES {
        return Err(CodecError::InvalidAddressKey(key.len()));
    }
    let split = key.len() - PACKED_HEIGHT_BYTES;
    Ok((&key[..split], unpack_u32(&key[split..])?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u32_round_trip() {
        for v in [0u32, 1, 255, 256, 0xDEAD_BEEF, u32::MAX] {
            let packed = pack_u32(v);
            assert_eq!(unpack_u32(&packed).unwrap(), v);
        }
    }

    #[test]
    fn u32_is_big_endian() {
        assert_eq!(pack_u32(0x0102_0304), [1, 2, 3, 4]);
    }

    #[test]
    fn u32_short_buffer_errors() {
        assert_eq!(unpack_u32(&[1, 2, 3]), Err(CodecError::InvalidFixedInt));
    }

    #[test]
    fn varuint_known_vectors() {
        let cases: &[(u64, &[u8])] = &[
            (0, &[0x00]),
            (1, &[0x01]),
            (127, &[0x7F]),
            (128, &[0x80, 0x01]),
            (300, &[0xAC, 0x02]),
            (16_384, &[0x80, 0x80, 0x01]),
        ];
        for &(v, expected) in cases {
            let mut buf = Vec::new();
            pack_varuint(v, &mut buf);
            assert_eq!(buf, expected, "encoding of {v}");
            assert_eq!(unpack_varuint(&buf).unwrap(), (v, expected.len()));
        }
    }

    #[test]
    fn varuint_round_trip() {
        for v in [0u64, 1, 0x7F, 0x80, 0x3FFF, 0x4000, u64::from(u32::MAX), u64::MAX] {
            let mut buf = Vec::new();
            pack_varuint(v, &mut buf);
            assert!(buf.len() <= MAX_VARUINT_LEN);
            assert_eq!(unpack_varuint(&buf).unwrap(), (v, buf.len()));
        }
    }

    #[test]
    fn varuint_max_is_ten_bytes() {
        let mut buf = Vec::new();
        pack_varuint(u64::MAX, &mut buf);
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn varuint_truncated_errors() {
        assert_eq!(unpack_varuint(&[0x80]), Err(CodecError::UnexpectedEof));
        assert_eq!(unpack_varuint(&[]), Err(CodecError::UnexpectedEof));
    }

    #[test]
    fn varuint_overlong_errors() {
        // 11 continuation bytes can never be a valid 64-bit value.
        let buf = [0x80u8; 11];
        assert_eq!(unpack_varuint(&buf), Err(CodecError::VarintOverflow));
        // Tenth byte carrying more than one bit overflows too.
        let mut buf = vec![0xFFu8; 9];
        buf.push(0x02);
        assert_eq!(unpack_varuint(&buf), Err(CodecError::VarintOverflow));
    }

    #[test]
    fn varint_zigzag_vectors() {
        let cases: &[(i64, &[u8])] = &[
            (0, &[0x00]),
            (-1, &[0x01]),
            (1, &[0x02]),
            (-2, &[0x03]),
            (2, &[0x04]),
        ];
        for &(v, expected) in cases {
            let mut buf = Vec::new();
            pack_varint(v, &mut buf);
            assert_eq!(buf, expected, "encoding of {v}");
            assert_eq!(unpack_varint(&buf).unwrap(), (v, expected.len()));
        }
    }

    #[test]
    fn varint_round_trip_extremes() {
        for v in [i64::MIN, i64::MIN + 1, -1, 0, 1, i64::MAX - 1, i64::MAX] {
            let mut buf = Vec::new();
            pack_varint(v, &mut buf);
            assert_eq!(unpack_varint(&buf).unwrap(), (v, buf.len()));
        }
    }

    #[test]
    fn varint32_ones_complement_round_trip() {
        // Input outpoints are stored as the one's complement of the position.
        for pos in [0i32, 1, 2, 1000, i32::MAX] {
            let mut buf = Vec::new();
            pack_varint32(!pos, &mut buf);
            let (decoded, _) = unpack_varint32(&buf).unwrap();
            assert!(decoded < 0);
            assert_eq!(!decoded, pos);
        }
    }

    #[test]
    fn bigint_zero_is_single_byte() {
        let mut buf = Vec::new();
        pack_bigint(&BigUint::default(), &mut buf);
        assert_eq!(buf, [0x00]);
        assert_eq!(unpack_bigint(&buf).unwrap(), (BigUint::default(), 1));
    }

    #[test]
    fn bigint_known_vectors() {
        let mut buf = Vec::new();
        pack_bigint(&BigUint::from(1u8), &mut buf);
        assert_eq!(buf, [0x01, 0x01]);

        buf.clear();
        pack_bigint(&BigUint::from(0x1234u32), &mut buf);
        assert_eq!(buf, [0x02, 0x12, 0x34]);
    }

    #[test]
    fn bigint_round_trip() {
        let values = [
            BigUint::from(1u8),
            BigUint::from(255u8),
            BigUint::from(256u16),
            BigUint::from(2_100_000_000_000_000u64),
            BigUint::from_bytes_be(&[0xFF; 32]),
            BigUint::from_bytes_be(&[0x01; MAX_BIGINT_MAGNITUDE_BYTES]),
        ];
        for v in values {
            let mut buf = Vec::new();
            pack_bigint(&v, &mut buf);
            assert!(buf.len() <= MAX_PACKED_BIGINT_BYTES);
            assert_eq!(unpack_bigint(&buf).unwrap(), (v, buf.len()));
        }
    }

    #[test]
    fn bigint_oversized_truncates_to_most_significant() {
        let mut magnitude = vec![0xABu8; 300];
        magnitude[0] = 0x01;
        let v = BigUint::from_bytes_be(&magnitude);

        let mut buf = Vec::new();
        pack_bigint(&v, &mut buf);
        assert_eq!(buf.len(), MAX_PACKED_BIGINT_BYTES);
        assert_eq!(buf[0] as usize, MAX_BIGINT_MAGNITUDE_BYTES);

        let (decoded, consumed) = unpack_bigint(&buf).unwrap();
        assert_eq!(consumed, MAX_PACKED_BIGINT_BYTES);
        assert_eq!(
            decoded,
            BigUint::from_bytes_be(&magnitude[..MAX_BIGINT_MAGNITUDE_BYTES])
        );
    }

    #[test]
    fn bigint_truncated_buffer_errors() {
        assert_eq!(unpack_bigint(&[]), Err(CodecError::UnexpectedEof));
        assert_eq!(unpack_bigint(&[0x02, 0x01]), Err(CodecError::UnexpectedEof));
    }

    #[test]
    fn address_key_layout() {
        let desc = b"\x76\xa9\x14descriptor";
        let key = pack_address_key(desc, 0x0001_0203);
        assert_eq!(&key[..desc.len()], desc);
        assert_eq!(&key[desc.len()..], &[0x00, 0x01, 0x02, 0x03]);

        let (d, h) = unpack_address_key(&key).unwrap();
        assert_eq!(d, desc);
        assert_eq!(h, 0x0001_0203);
    }

    #[test]
    fn address_key_heights_sort_numerically() {
        let desc = b"same-address";
        let mut keys: Vec<Vec<u8>> = [5u32, 1, 300, 70_000, 2]
            .iter()
            .map(|&h| pack_address_key(desc, h))
            .collect();
        keys.sort();
        let heights: Vec<u32> = keys
            .iter()
            .map(|k| unpack_address_key(k).unwrap().1)
            .collect();
        assert_eq!(heights, [1, 2, 5, 300, 70_000]);
    }

    #[test]
    fn address_key_too_short_errors() {
        assert!(unpack_address_key(&[0, 0, 0, 1]).is_err());
        assert!(unpack_address_key(&[]).is_err());
    }

    #[test]
    fn address_key_max_descriptor_round_trip() {
        let desc = vec![0x42u8; 1024];
        let key = pack_address_key(&desc, 42);
        let (d, h) = unpack_address_key(&key).unwrap();
        assert_eq!(d, &desc[..]);
        assert_eq!(h, 42);
    }
}
