pub mod forget;
pub mod search;
pub mod stats;
pub mod store;
pub mod types;

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// L2 distance between unit vectors whose cosine similarity is `cosine`.
///
/// For normalized vectors `‖a − b‖² = 2 − 2·cos(a, b)`.
pub fn cosine_threshold_to_l2(cosine: f64) -> f64 {
    (2.0 * (1.0 - cosine)).max(0.0).sqrt()
}

/// Inverse of [`cosine_threshold_to_l2`].
pub fn l2_to_cosine(distance: f64) -> f64 {
    1.0 - distance * distance / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_native_endian_f32() {
        let v = [1.0f32, -2.0];
        let bytes = embedding_to_bytes(&v);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[..4], &1.0f32.to_ne_bytes());
    }

    #[test]
    fn distance_cosine_conversions_agree() {
        assert!((cosine_threshold_to_l2(1.0)).abs() < 1e-12);
        assert!((cosine_threshold_to_l2(0.0) - 2f64.sqrt()).abs() < 1e-12);
        assert!((cosine_threshold_to_l2(-1.0) - 2.0).abs() < 1e-12);
        for c in [0.9, 0.5, 0.1, -0.3] {
            assert!((l2_to_cosine(cosine_threshold_to_l2(c)) - c).abs() < 1e-9);
        }
    }
}
