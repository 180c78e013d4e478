/// XORs `buf` with `mask`, cycling the key by byte index (RFC 6455, Section 5.3).
///
/// Masking and unmasking are the same operation.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    let key = u32::from_ne_bytes(mask);

    let mut words = buf.chunks_exact_mut(4);
    for word in &mut words {
        let value = u32::from_ne_bytes([word[0], word[1], word[2], word[3]]) ^ key;
        word.copy_from_slice(&value.to_ne_bytes());
    }

    // the tail starts at a multiple of 4, so the key is not rotated
    for (byte, k) in words.into_remainder().iter_mut().zip(mask) {
        *byte ^= k;
    }
}
