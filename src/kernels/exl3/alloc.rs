// SPDX-License-Identifier: MIT

//! Bit-allocation consumer interface.
//!
//! The quantization-time policy that decides how many trellis bits each
//! layer receives lives outside this crate; layers only consume its output.
//! The contract: given quantization arguments, the surplus carried over from
//! sibling groups, and the sublayer shapes of one layer group, an allocator
//! returns a per-sublayer bit assignment plus the new surplus.
//!
//! [`UniformAllocator`] is a minimal reference implementation so the
//! contract is exercised; real allocators are supplied by the caller.

use crate::error::{Exl3Error, Result};

/// Arguments to a bit allocation request.
#[derive(Debug, Clone, Copy)]
pub struct QuantArgs {
    /// Target bit budget for the layer group, excluding carried surplus.
    pub bits_budget: u64,
    /// Smallest permitted trellis rank `K`.
    pub min_k: u32,
    /// Largest permitted trellis rank `K`.
    pub max_k: u32,
}

/// Shape of one sublayer competing for bits within a group.
#[derive(Debug, Clone, Copy)]
pub struct SublayerShape {
    /// Input feature count.
    pub in_features: usize,
    /// Output feature count.
    pub out_features: usize,
}

impl SublayerShape {
    /// Number of weights in the sublayer.
    #[must_use]
    pub const fn weights(&self) -> u64 {
        (self.in_features * self.out_features) as u64
    }
}

/// Bits granted to one sublayer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitAssignment {
    /// Assigned trellis rank (bits per weight).
    pub k: u32,
    /// Total trellis bits this assignment consumes.
    pub trellis_bits: u64,
}

/// Externally supplied bit-allocation policy.
pub trait BitAllocator {
    /// Assign a trellis rank to each sublayer.
    ///
    /// Returns the per-sublayer assignments and the leftover budget
    /// (`bits_budget + surplus_bits − Σ trellis_bits`), which may be
    /// negative when the floor assignment already exceeds the budget.
    ///
    /// # Errors
    ///
    /// Returns [`Exl3Error::InvalidConfig`] on an empty group or
    /// inconsistent arguments.
    fn allocate(
        &self,
        args: &QuantArgs,
        surplus_bits: i64,
        sublayers: &[SublayerShape],
    ) -> Result<(Vec<BitAssignment>, i64)>;
}

/// Reference allocator: every sublayer gets the same integer rank, the
/// largest that fits the pooled budget, clamped to `[min_k, max_k]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UniformAllocator;

impl BitAllocator for UniformAllocator {
    fn allocate(
        &self,
        args: &QuantArgs,
        surplus_bits: i64,
        sublayers: &[SublayerShape],
    ) -> Result<(Vec<BitAssignment>, i64)> {
        if sublayers.is_empty() {
            return Err(Exl3Error::InvalidConfig(
                "bit allocation over an empty layer group".into(),
            ));
        }
        if args.min_k == 0 || args.min_k > args.max_k {
            return Err(Exl3Error::InvalidConfig(format!(
                "invalid rank bounds: min_k={}, max_k={}",
                args.min_k, args.max_k
            )));
        }

        let total_weights: u64 = sublayers.iter().map(SublayerShape::weights).sum();
        if total_weights == 0 {
            return Err(Exl3Error::InvalidConfig(
                "bit allocation over a group with no weights".into(),
            ));
        }
        let pool = i128::from(args.bits_budget) + i128::from(surplus_bits);
        let fit = if pool <= 0 {
            0
        } else {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                (pool as u128 / u128::from(total_weights)) as u64
            }
        };
        #[allow(clippy::cast_possible_truncation)]
        let k = (fit.min(u64::from(args.max_k)) as u32).max(args.min_k);

        let assignments: Vec<BitAssignment> = sublayers
            .iter()
            .map(|s| BitAssignment {
                k,
                trellis_bits: u64::from(k) * s.weights(),
            })
            .collect();

        let spent: i128 = assignments.iter().map(|a| i128::from(a.trellis_bits)).sum();
        #[allow(clippy::cast_possible_truncation)]
        let new_surplus = (pool - spent) as i64;
        Ok((assignments, new_surplus))
    }
}
