//! Sign-bit quantization of patch embeddings.
//!
//! Every component of a patch vector becomes one bit: `1` when the value is
//! strictly positive, `0` otherwise (zero, negative and NaN alike). Bits are
//! packed most-significant-bit first, eight components per byte, which is
//! the byte layout Vespa unpacks with `unpack_bits`. A 128-d patch
//! therefore takes 16 bytes instead of 512.
//!
//! The transform is one-way: only the signs survive.

use crate::{
    embedding::EmbeddingMatrix,
    error::{Error, Result},
};

/// Packed binary patches for one page, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryPatches {
    num_patches: u32,
    /// Number of bits (original float components) per patch.
    dimension: u32,
    data: Vec<u8>,
}

impl BinaryPatches {
    /// Wrap already-packed bytes. `data` must hold exactly
    /// `num_patches * bytes_per_patch(dimension)` bytes.
    pub fn from_packed(
        num_patches: u32,
        dimension: u32,
        data: Vec<u8>,
    ) -> Result<Self> {
        let expected = num_patches as usize * bytes_per_patch(dimension);
        if data.len() != expected {
            return Err(Error::Embedding(format!(
                "expected {expected} packed bytes for {num_patches} patches of {dimension} bits, got {}",
                data.len()
            )));
        }
        Ok(Self {
            num_patches,
            dimension,
            data,
        })
    }

    pub fn num_patches(&self) -> u32 {
        self.num_patches
    }

    pub fn dimension(&self) -> u32 {
        self.dimension
    }

    pub fn bytes_per_patch(&self) -> usize {
        bytes_per_patch(self.dimension)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn patch(&self, idx: u32) -> &[u8] {
        let width = self.bytes_per_patch();
        let start = idx as usize * width;
        &self.data[start..start + width]
    }

    pub fn iter_patches(&self) -> impl Iterator<Item = &[u8]> {
        self.data.chunks_exact(self.bytes_per_patch().max(1))
    }
}

pub fn bytes_per_patch(dimension: u32) -> usize {
    (dimension as usize).div_ceil(8)
}

/// Quantize every patch of a page, preserving patch order and count.
pub fn quantize(matrix: &EmbeddingMatrix) -> BinaryPatches {
    let mut data =
        Vec::with_capacity(matrix.rows as usize * bytes_per_patch(matrix.dimension));
    for row in matrix.iter_rows().take(matrix.rows as usize) {
        data.extend(pack_bits(row));
    }
    BinaryPatches {
        num_patches: matrix.rows,
        dimension: matrix.dimension,
        data,
    }
}

/// Pack the sign bits of one vector, MSB first. A trailing partial byte is
/// padded with zero bits.
pub fn pack_bits(vector: &[f32]) -> Vec<u8> {
    vector
        .chunks(8)
        .map(|chunk| {
            chunk.iter().enumerate().fold(0u8, |byte, (i, &v)| {
                if v > 0.0 { byte | (0x80 >> i) } else { byte }
            })
        })
        .collect()
}

#[inline]
pub fn bit_is_set(packed: &[u8], i: usize) -> bool {
    packed[i / 8] & (0x80 >> (i % 8)) != 0
}

/// Number of differing bits between two packed vectors of equal width.
pub fn hamming(a: &[u8], b: &[u8]) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn packs_msb_first() {
        let v = [1.0, -1.0, 0.0, 0.5, -0.2, 0.0, 0.0, 2.0];
        assert_eq!(pack_bits(&v), vec![0b1001_0001]);
    }

    #[test]
    fn partial_byte_is_zero_padded() {
        assert_eq!(pack_bits(&[1.0, 1.0, 1.0]), vec![0b1110_0000]);
        assert_eq!(bytes_per_patch(3), 1);
        assert_eq!(bytes_per_patch(128), 16);
    }

    #[test]
    fn nan_and_zero_are_non_positive() {
        assert_eq!(pack_bits(&[f32::NAN, 0.0, -0.0]), vec![0]);
    }

    #[test]
    fn quantize_preserves_patch_order() {
        let m = EmbeddingMatrix::new(
            2,
            8,
            vec![
                1.0, 1.0, 1.0, 1.0, -1.0, -1.0, -1.0, -1.0, //
                -1.0, -1.0, -1.0, -1.0, 1.0, 1.0, 1.0, 1.0,
            ],
        )
        .unwrap();
        let q = quantize(&m);
        assert_eq!(q.num_patches(), 2);
        assert_eq!(q.patch(0), &[0xF0]);
        assert_eq!(q.patch(1), &[0x0F]);
        assert_eq!(q.iter_patches().count(), 2);
    }

    #[test]
    fn set_bits_follow_positive_components() {
        let v = [0.3, -0.1, 0.9, 0.0, 1.0, -5.0, 0.2, 0.1, 0.7];
        let packed = pack_bits(&v);
        let bits: Vec<bool> =
            (0..v.len()).map(|i| bit_is_set(&packed, i)).collect();
        assert_eq!(
            bits,
            vec![true, false, true, false, true, false, true, true, true]
        );
    }

    #[test]
    fn hamming_counts_differing_bits() {
        assert_eq!(hamming(&[0xFF, 0x00], &[0xFF, 0x00]), 0);
        assert_eq!(hamming(&[0xFF, 0x00], &[0x00, 0x00]), 8);
        assert_eq!(hamming(&[0b1010_1010], &[0b0101_0101]), 8);
        assert_eq!(hamming(&[0b1000_0000], &[0b1000_0001]), 1);
    }

    #[test]
    fn from_packed_checks_length() {
        assert!(BinaryPatches::from_packed(2, 16, vec![0; 4]).is_ok());
        assert!(BinaryPatches::from_packed(2, 16, vec![0; 3]).is_err());
    }

    proptest! {
        #[test]
        fn quantization_is_deterministic(v in prop::collection::vec(-10.0f32..10.0, 1..300)) {
            prop_assert_eq!(pack_bits(&v), pack_bits(&v));
        }

        #[test]
        fn all_positive_is_all_ones(v in prop::collection::vec(0.001f32..10.0, 1..300)) {
            let packed = pack_bits(&v);
            let ones: u32 = packed.iter().map(|b| b.count_ones()).sum();
            prop_assert_eq!(ones as usize, v.len());
        }

        #[test]
        fn all_non_positive_is_all_zeros(v in prop::collection::vec(-10.0f32..=0.0, 1..300)) {
            prop_assert!(pack_bits(&v).iter().all(|&b| b == 0));
        }
    }
}
