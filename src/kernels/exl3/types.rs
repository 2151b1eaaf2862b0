// SPDX-License-Identifier: MIT

//! Storage types for EXL3 quantized layers.
//!
//! Candle has no 16-bit integer dtype, so the trellis codes and packed sign
//! bitfields live in host `Vec<u16>` buffers; a GPU backend uploads them at
//! dispatch time. Unpacked sign vectors and the bias are ordinary
//! half-precision candle tensors.

use candle_core::{DType, Tensor};

use super::codec::{unpack_bitfield, TILE};
use crate::error::{Exl3Error, Result};

/// A 3-dimensional block of 16-bit trellis codes.
///
/// Shape is `(rows_of_blocks, cols_of_blocks, 16·K)` where each
/// `(row_block, col_block)` entry encodes one 16×16 tile of the weight grid
/// and `K = words_per_tile / 16` is the compressed width in bits per weight.
#[derive(Debug, Clone)]
pub struct TrellisTensor {
    codes: Vec<u16>,
    rows_of_blocks: usize,
    cols_of_blocks: usize,
    words_per_tile: usize,
}

impl TrellisTensor {
    /// Create a trellis tensor from flat codes and an explicit 3-D shape.
    ///
    /// # Errors
    ///
    /// Returns [`Exl3Error::ShapeMismatch`] if the buffer length disagrees
    /// with the shape, or [`Exl3Error::InvalidConfig`] if the last dimension
    /// is not a positive multiple of 16 (i.e. `K < 1`).
    pub fn new(codes: Vec<u16>, shape: (usize, usize, usize)) -> Result<Self> {
        let (rows_of_blocks, cols_of_blocks, words_per_tile) = shape;
        if words_per_tile == 0 || words_per_tile % TILE != 0 {
            return Err(Exl3Error::InvalidConfig(format!(
                "trellis last dim must be a positive multiple of 16, got {words_per_tile}"
            )));
        }
        let expected = rows_of_blocks * cols_of_blocks * words_per_tile;
        if codes.len() != expected {
            return Err(Exl3Error::ShapeMismatch {
                name: "trellis",
                expected: vec![rows_of_blocks, cols_of_blocks, words_per_tile],
                actual: vec![codes.len()],
            });
        }
        Ok(Self {
            codes,
            rows_of_blocks,
            cols_of_blocks,
            words_per_tile,
        })
    }

    /// The 3-D shape `(rows_of_blocks, cols_of_blocks, 16·K)`.
    #[must_use]
    pub const fn dims(&self) -> (usize, usize, usize) {
        (self.rows_of_blocks, self.cols_of_blocks, self.words_per_tile)
    }

    /// Trellis rank `K`, the number of codewords per 16-value group.
    #[must_use]
    pub const fn k(&self) -> usize {
        self.words_per_tile / TILE
    }

    /// Compressed width in bits per weight (exactly `K`).
    #[must_use]
    pub fn bits_per_weight(&self) -> f32 {
        #[allow(clippy::cast_precision_loss)]
        {
            self.k() as f32
        }
    }

    /// Codewords of one tile.
    ///
    /// # Panics
    ///
    /// Panics if the block indices are out of bounds.
    #[must_use]
    pub fn tile(&self, row_block: usize, col_block: usize) -> &[u16] {
        assert!(row_block < self.rows_of_blocks, "row block out of bounds");
        assert!(col_block < self.cols_of_blocks, "col block out of bounds");
        let offset = (row_block * self.cols_of_blocks + col_block) * self.words_per_tile;
        &self.codes[offset..offset + self.words_per_tile]
    }

    /// Flat codeword buffer, row-block major.
    #[must_use]
    pub fn codes(&self) -> &[u16] {
        &self.codes
    }

    /// Storage size of the codes in bytes.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.codes.len() * 2
    }
}

/// One axis worth of Hadamard signs as stored in a checkpoint.
///
/// Exactly one representation exists per axis: either the packed bitfield
/// (`su`/`sv`, 16 signs per 16-bit word, bit set → −1.0) or the unpacked
/// half-precision vector (`suh`/`svh`). The packed form is expanded once at
/// construction into a canonical unpacked tensor.
#[derive(Debug, Clone)]
pub enum SignSource {
    /// Packed 16-signs-per-word bitfield.
    Packed(Vec<u16>),
    /// Unpacked ±1.0 vector, must be half precision.
    Unpacked(Tensor),
}

impl SignSource {
    /// Resolve into the canonical unpacked F16 tensor of length `features`.
    ///
    /// `name` is the checkpoint key used in error reports,
    /// `unpacked_name` its unpacked twin.
    ///
    /// # Errors
    ///
    /// Returns [`Exl3Error::TensorDtype`] if an unpacked vector is not F16,
    /// or [`Exl3Error::ShapeMismatch`] on any length disagreement.
    pub fn resolve(
        self,
        name: &'static str,
        unpacked_name: &'static str,
        features: usize,
        device: &candle_core::Device,
    ) -> Result<Tensor> {
        match self {
            Self::Packed(words) => {
                if words.len() * 16 != features {
                    return Err(Exl3Error::ShapeMismatch {
                        name,
                        expected: vec![features / 16],
                        actual: vec![words.len()],
                    });
                }
                let signs = unpack_bitfield(&words);
                Ok(Tensor::from_vec(signs, features, device)?.to_dtype(DType::F16)?)
            }
            Self::Unpacked(tensor) => {
                if tensor.dtype() != DType::F16 {
                    return Err(Exl3Error::TensorDtype {
                        name: unpacked_name,
                        expected: DType::F16,
                        actual: tensor.dtype(),
                    });
                }
                let dims = tensor.shape().dims();
                if dims != [features] {
                    return Err(Exl3Error::ShapeMismatch {
                        name: unpacked_name,
                        expected: vec![features],
                        actual: dims.to_vec(),
                    });
                }
                Ok(tensor)
            }
        }
    }
}

/// Borrowed view of one persisted layer tensor, keyed per the checkpoint
/// namespace contract.
#[derive(Debug)]
pub enum Exl3TensorData<'a> {
    /// 16-bit codeword payload (`trellis`) with its 3-D shape.
    Words {
        /// Flat codewords, row-block major.
        data: &'a [u16],
        /// `(rows_of_blocks, cols_of_blocks, 16·K)`.
        shape: (usize, usize, usize),
    },
    /// Half-precision tensor (`suh`, `svh`, `bias`).
    Tensor(&'a Tensor),
    /// 32-bit scramble constant (`mcg`, `mul1`) as a raw bit pattern.
    Scalar(u32),
}
