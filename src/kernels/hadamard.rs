// SPDX-License-Identifier: MIT

//! Fixed radix-128 Hadamard transform with sign correction.
//!
//! EXL3 decorrelates activations and weights with an orthogonal Hadamard
//! butterfly applied to contiguous 128-element blocks, optionally multiplied
//! element-wise by ±1 sign vectors before (left) or after (right) the
//! transform, plus a uniform scalar:
//!
//! ```text
//! out = (H(x ∘ left_signs)) ∘ right_signs × scale
//! ```
//!
//! The transform is normalized by 1/√128, making `H` orthogonal and an
//! involution: applying it twice recovers the input. The forward paths use
//! the left-sign form on activations going in and the right-sign form on the
//! output; full weight reconstruction applies the unsigned transform down the
//! columns and along the rows of the dense weight grid.

use crate::error::{Exl3Error, Result};

/// Block length of the structured Hadamard transform.
pub const HADAMARD_BLOCK: usize = 128;

/// 1/√128, applied once after the butterfly passes so `H` is orthogonal.
const HADAMARD_NORM: f32 = 0.088_388_347;

/// In-place unnormalized fast Hadamard transform over one 128 block.
#[inline]
fn fht_128_unnorm(block: &mut [f32]) {
    debug_assert_eq!(block.len(), HADAMARD_BLOCK);
    let mut stride = 1;
    while stride < HADAMARD_BLOCK {
        let mut base = 0;
        while base < HADAMARD_BLOCK {
            for j in base..base + stride {
                let a = block[j];
                let b = block[j + stride];
                block[j] = a + b;
                block[j + stride] = a - b;
            }
            base += 2 * stride;
        }
        stride *= 2;
    }
}

/// Apply the signed, scaled block-Hadamard transform to one row in place.
///
/// `x` is treated as consecutive 128-element blocks; `left_signs` and
/// `right_signs`, when given, must match `x` in length and are indexed by
/// absolute position within the row. Passing neither sign vector reduces to
/// the plain normalized transform times `scale`.
///
/// # Errors
///
/// Returns [`Exl3Error::ShapeMismatch`] if `x` is not a multiple of 128 long
/// or a sign vector length differs from `x`.
pub fn apply_hadamard(
    x: &mut [f32],
    left_signs: Option<&[f32]>,
    right_signs: Option<&[f32]>,
    scale: f32,
) -> Result<()> {
    if x.is_empty() || x.len() % HADAMARD_BLOCK != 0 {
        return Err(Exl3Error::ShapeMismatch {
            name: "x",
            expected: vec![HADAMARD_BLOCK],
            actual: vec![x.len()],
        });
    }
    for (name, signs) in [("left_signs", left_signs), ("right_signs", right_signs)] {
        if let Some(s) = signs {
            if s.len() != x.len() {
                return Err(Exl3Error::ShapeMismatch {
                    name,
                    expected: vec![x.len()],
                    actual: vec![s.len()],
                });
            }
        }
    }

    if let Some(signs) = left_signs {
        for (v, s) in x.iter_mut().zip(signs) {
            *v *= s;
        }
    }

    for block in x.chunks_exact_mut(HADAMARD_BLOCK) {
        fht_128_unnorm(block);
        for v in block.iter_mut() {
            *v *= HADAMARD_NORM * scale;
        }
    }

    if let Some(signs) = right_signs {
        for (v, s) in x.iter_mut().zip(signs) {
            *v *= s;
        }
    }

    Ok(())
}

/// Apply the unsigned normalized transform down the columns of a row-major
/// `rows × cols` matrix, in blocks of 128 rows.
///
/// # Errors
///
/// Returns [`Exl3Error::ShapeMismatch`] if `rows` is not a multiple of 128 or
/// the buffer length is not `rows * cols`.
pub fn had_left(w: &mut [f32], rows: usize, cols: usize) -> Result<()> {
    if rows == 0 || rows % HADAMARD_BLOCK != 0 || w.len() != rows * cols {
        return Err(Exl3Error::ShapeMismatch {
            name: "w",
            expected: vec![rows, cols],
            actual: vec![w.len()],
        });
    }
    let mut column = [0.0f32; HADAMARD_BLOCK];
    for row_base in (0..rows).step_by(HADAMARD_BLOCK) {
        for col in 0..cols {
            for (i, v) in column.iter_mut().enumerate() {
                *v = w[(row_base + i) * cols + col];
            }
            fht_128_unnorm(&mut column);
            for (i, v) in column.iter().enumerate() {
                w[(row_base + i) * cols + col] = v * HADAMARD_NORM;
            }
        }
    }
    Ok(())
}

/// Apply the unsigned normalized transform along each row of a row-major
/// `rows × cols` matrix, in blocks of 128 columns.
///
/// # Errors
///
/// Returns [`Exl3Error::ShapeMismatch`] if `cols` is not a multiple of 128 or
/// the buffer length is not `rows * cols`.
pub fn had_right(w: &mut [f32], rows: usize, cols: usize) -> Result<()> {
    if cols == 0 || cols % HADAMARD_BLOCK != 0 || w.len() != rows * cols {
        return Err(Exl3Error::ShapeMismatch {
            name: "w",
            expected: vec![rows, cols],
            actual: vec![w.len()],
        });
    }
    for row in w.chunks_exact_mut(cols) {
        for block in row.chunks_exact_mut(HADAMARD_BLOCK) {
            fht_128_unnorm(block);
            for v in block.iter_mut() {
                *v *= HADAMARD_NORM;
            }
        }
    }
    Ok(())
}
