// SPDX-License-Identifier: MIT

//! Kernel dispatch boundary for EXL3 layers.
//!
//! The fused and reconstruction kernels sit behind a single trait so the
//! layer code never touches an accelerator programming model directly. The
//! CPU implementation below is the reference and the shipped default; a CUDA
//! backend slots in behind the same trait under the `cuda` feature, uploading
//! the host-resident codewords at dispatch time.
//!
//! Both entry points are deterministic given fixed inputs; any parallelism a
//! backend uses internally must not change results.

use std::fmt;

use super::codec::{decode_tile, TILE, TILE_VALUES};
use super::types::TrellisTensor;
use crate::error::{Exl3Error, Result};
use crate::kernels::hadamard::apply_hadamard;

/// Accelerator-agnostic interface to the two EXL3 compute kernels.
pub trait Exl3Backend: fmt::Debug + Send + Sync {
    /// Fused path: multiply activations directly against the trellis codes.
    ///
    /// Computes `y = H_r(H_l(x ∘ suh) ⊗ trellis) ∘ svh` for `batch` rows of
    /// `x` without materializing the dense weight; at most one decoded tile
    /// of scratch lives at a time.
    ///
    /// # Errors
    ///
    /// Returns a shape error if buffer lengths disagree with the trellis
    /// dimensions.
    fn decode_and_multiply(
        &self,
        x: &[f32],
        batch: usize,
        trellis: &TrellisTensor,
        suh: &[f32],
        svh: &[f32],
        mcg_mult: u32,
        mul1_mult: u32,
    ) -> Result<Vec<f32>>;

    /// Materialize the inner dense weight `[in_features, out_features]`,
    /// row-major, into `out`.
    ///
    /// "Inner" means the raw trellis decode: Hadamard and sign corrections
    /// are the caller's business.
    ///
    /// # Errors
    ///
    /// Returns a shape error if `out` does not hold exactly
    /// `in_features × out_features` elements.
    fn reconstruct_into(
        &self,
        trellis: &TrellisTensor,
        mcg_mult: u32,
        mul1_mult: u32,
        out: &mut [f32],
    ) -> Result<()>;
}

/// Reference CPU backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuBackend;

impl Exl3Backend for CpuBackend {
    fn decode_and_multiply(
        &self,
        x: &[f32],
        batch: usize,
        trellis: &TrellisTensor,
        suh: &[f32],
        svh: &[f32],
        mcg_mult: u32,
        mul1_mult: u32,
    ) -> Result<Vec<f32>> {
        let (row_blocks, col_blocks, _) = trellis.dims();
        let in_features = row_blocks * TILE;
        let out_features = col_blocks * TILE;

        if x.len() != batch * in_features {
            return Err(Exl3Error::ShapeMismatch {
                name: "x",
                expected: vec![batch, in_features],
                actual: vec![x.len()],
            });
        }

        // Input transform: xh = H(x ∘ suh), row-wise.
        let mut xh = x.to_vec();
        for row in xh.chunks_exact_mut(in_features) {
            apply_hadamard(row, Some(suh), None, 1.0)?;
        }

        let mut y = vec![0.0f32; batch * out_features];
        let mut tile = [0.0f32; TILE_VALUES];

        for row_block in 0..row_blocks {
            for col_block in 0..col_blocks {
                decode_tile(
                    trellis.tile(row_block, col_block),
                    mcg_mult,
                    mul1_mult,
                    &mut tile,
                );
                for n in 0..batch {
                    let x_base = n * in_features + row_block * TILE;
                    let y_base = n * out_features + col_block * TILE;
                    for g in 0..TILE {
                        let xv = xh[x_base + g];
                        if xv == 0.0 {
                            continue;
                        }
                        let weights = &tile[g * TILE..(g + 1) * TILE];
                        let acc = &mut y[y_base..y_base + TILE];
                        for (a, w) in acc.iter_mut().zip(weights) {
                            *a += xv * w;
                        }
                    }
                }
            }
        }

        // Output transform: y = H(y) ∘ svh, row-wise.
        for row in y.chunks_exact_mut(out_features) {
            apply_hadamard(row, None, Some(svh), 1.0)?;
        }

        Ok(y)
    }

    fn reconstruct_into(
        &self,
        trellis: &TrellisTensor,
        mcg_mult: u32,
        mul1_mult: u32,
        out: &mut [f32],
    ) -> Result<()> {
        let (row_blocks, col_blocks, _) = trellis.dims();
        let in_features = row_blocks * TILE;
        let out_features = col_blocks * TILE;

        if out.len() != in_features * out_features {
            return Err(Exl3Error::ShapeMismatch {
                name: "w",
                expected: vec![in_features, out_features],
                actual: vec![out.len()],
            });
        }

        let mut tile = [0.0f32; TILE_VALUES];
        for row_block in 0..row_blocks {
            for col_block in 0..col_blocks {
                decode_tile(
                    trellis.tile(row_block, col_block),
                    mcg_mult,
                    mul1_mult,
                    &mut tile,
                );
                for g in 0..TILE {
                    let row = row_block * TILE + g;
                    let dst = row * out_features + col_block * TILE;
                    out[dst..dst + TILE].copy_from_slice(&tile[g * TILE..(g + 1) * TILE]);
                }
            }
        }
        Ok(())
    }
}
