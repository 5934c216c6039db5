//! XOR masking of frame payloads (RFC 6455 Section 5.3).

/// Mask or unmask a payload in place. The operation is its own inverse.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    apply_mask_words(buf, mask);
}

/// Byte-at-a-time reference implementation.
#[inline]
fn apply_mask_bytes(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Applies the mask one 4-byte word at a time, falling back to the byte loop
/// for the unaligned prefix and suffix.
#[inline]
fn apply_mask_words(buf: &mut [u8], mask: [u8; 4]) {
    let mask_word = u32::from_ne_bytes(mask);

    let (prefix, words, suffix) = unsafe { buf.align_to_mut::<u32>() };
    apply_mask_bytes(prefix, mask);

    // Rotate the mask so it lines up with the word-aligned region.
    let shift = prefix.len() & 3;
    let mask_word = if shift > 0 {
        if cfg!(target_endian = "big") {
            mask_word.rotate_left(8 * shift as u32)
        } else {
            mask_word.rotate_right(8 * shift as u32)
        }
    } else {
        mask_word
    };

    for word in words.iter_mut() {
        *word ^= mask_word;
    }
    apply_mask_bytes(suffix, mask_word.to_ne_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_path_matches_byte_path() {
        let mask = [0x6d, 0xb6, 0xb2, 0x80];
        let data: Vec<u8> = (0..64).map(|i| (i * 7) as u8).collect();

        for len in 0..=data.len() {
            for offset in 0..4.min(len + 1) {
                let mut by_bytes = data[..len].to_vec();
                apply_mask_bytes(&mut by_bytes[offset..], mask);

                let mut by_words = data[..len].to_vec();
                apply_mask_words(&mut by_words[offset..], mask);

                assert_eq!(by_bytes, by_words, "len={} offset={}", len, offset);
            }
        }
    }

    #[test]
    fn test_mask_is_involution() {
        let mask = [0xAA, 0xBB, 0xCC, 0xDD];
        let original = b"per-producer ordering is preserved".to_vec();

        let mut data = original.clone();
        apply_mask(&mut data, mask);
        assert_ne!(data, original);

        apply_mask(&mut data, mask);
        assert_eq!(data, original);
    }

    #[test]
    fn test_mask_pattern() {
        let mask = [0x12, 0x34, 0x56, 0x78];
        let mut data = vec![0u8; 9];
        apply_mask(&mut data, mask);
        for (i, byte) in data.iter().enumerate() {
            assert_eq!(*byte, mask[i % 4]);
        }
    }

    #[test]
    fn test_empty_buffer() {
        let mut empty: [u8; 0] = [];
        apply_mask(&mut empty, [1, 2, 3, 4]);
    }
}
