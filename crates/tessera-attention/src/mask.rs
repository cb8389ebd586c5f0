//! Additive attention masks: causal, sliding window, key padding.
//!
//! All builders return a row-major `[seq_len, kv_len]` block where
//! `0.0` = attend and `-inf` = masked. Queries are aligned to the end of
//! the key sequence, so query `i` sits at key position `i + kv_len - seq_len`.

use tessera_kernels::vecmath::add_assign;

/// Causal mask over a key prefix: query `i` sees keys `j <= i + kv_len - seq_len`.
///
/// Equivalent to `causal = true` on the problem itself, which is cheaper.
pub fn causal_mask(seq_len: usize, kv_len: usize) -> Vec<f32> {
    let offset = kv_len.saturating_sub(seq_len);
    let mut data = vec![f32::NEG_INFINITY; seq_len * kv_len];
    for i in 0..seq_len {
        let end = (i + offset + 1).min(kv_len);
        data[i * kv_len..i * kv_len + end].fill(0.0);
    }
    data
}

/// Sliding window causal mask.
///
/// Each query attends to at most `window` keys ending at its own position.
pub fn sliding_window_mask(seq_len: usize, kv_len: usize, window: usize) -> Vec<f32> {
    let offset = kv_len.saturating_sub(seq_len);
    let mut data = vec![f32::NEG_INFINITY; seq_len * kv_len];
    for i in 0..seq_len {
        let end = (i + offset + 1).min(kv_len);
        let start = end.saturating_sub(window);
        data[i * kv_len + start..i * kv_len + end].fill(0.0);
    }
    data
}

/// Hide keys at positions `>= valid_len` from every query.
pub fn key_padding_mask(seq_len: usize, kv_len: usize, valid_len: usize) -> Vec<f32> {
    let valid = valid_len.min(kv_len);
    let mut row = vec![f32::NEG_INFINITY; kv_len];
    row[..valid].fill(0.0);
    row.repeat(seq_len)
}

/// Element-wise sum of two masks of equal length into `acc`.
pub fn combine_masks(acc: &mut [f32], other: &[f32]) {
    add_assign(acc, other);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_causal_mask() {
        let data = causal_mask(4, 4);

        // Row 0: [0, -inf, -inf, -inf]
        assert_eq!(data[0], 0.0);
        assert!(data[1].is_infinite());

        // Row 3: [0, 0, 0, 0]
        assert_eq!(&data[12..16], &[0.0; 4]);
    }

    #[test]
    fn test_causal_mask_with_prefix() {
        // 2 queries after a 3-key prefix.
        let data = causal_mask(2, 5);
        assert_eq!(&data[..4], &[0.0; 4]);
        assert!(data[4].is_infinite());
        assert_eq!(&data[5..10], &[0.0; 5]);
    }

    #[test]
    fn test_sliding_window_mask() {
        let data = sliding_window_mask(6, 6, 3);

        // Row 5: can attend to positions 3,4,5 only
        assert!(data[5 * 6 + 2].is_infinite());
        assert_eq!(data[5 * 6 + 3], 0.0);
        assert_eq!(data[5 * 6 + 5], 0.0);
        // Row 0 only sees itself.
        assert_eq!(data[0], 0.0);
        assert!(data[1].is_infinite());
    }

    #[test]
    fn test_key_padding_and_combine() {
        let mut data = key_padding_mask(2, 4, 3);
        assert_eq!(&data[..3], &[0.0; 3]);
        assert!(data[3].is_infinite() && data[7].is_infinite());

        combine_masks(&mut data, &causal_mask(2, 4));
        // Row 0 (key position 2): keys 0..=2 visible, 3 hidden by both.
        assert_eq!(&data[..3], &[0.0; 3]);
        assert!(data[3].is_infinite());
    }
}
