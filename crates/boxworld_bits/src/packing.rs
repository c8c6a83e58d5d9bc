//! Big-endian bit packing: bit `i` lives in byte `i / 8` at mask `0x80 >> (i % 8)`.

/// Expands `bytes` into at most `limit` booleans.
pub fn unpack_be(bytes: &[u8], limit: usize) -> Vec<bool> {
    let len = limit.min(bytes.len() * 8);
    (0..len)
        .map(|i| bytes[i / 8] & (0x80 >> (i % 8)) != 0)
        .collect()
}

/// Packs booleans into bytes; a trailing partial byte is zero-filled.
pub fn pack_be(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; bits.len().div_ceil(8)];
    for (i, _) in bits.iter().enumerate().filter(|(_, b)| **b) {
        bytes[i / 8] |= 0x80 >> (i % 8);
    }
    bytes
}
