// SPDX-License-Identifier: MIT

//! Configuration for EXL3 layer execution.

use candle_core::DType;

use crate::error::{Exl3Error, Result};

/// Break-even batch size for switching from the fused kernel to full
/// reconstruction: the fused path's per-element overhead amortizes poorly
/// past this many rows, while the one-time O(in×out) materialization
/// amortizes well.
pub const DEFAULT_RECONSTRUCT_THRESHOLD: usize = 32;

/// Runtime configuration for an EXL3 layer.
#[derive(Debug, Clone, Copy)]
pub struct Exl3Config {
    /// Batch sizes strictly above this use the reconstruct path.
    pub reconstruct_batch_threshold: usize,

    /// Default output element type when neither the call nor the layer
    /// requests one.
    pub default_out_dtype: DType,
}

impl Default for Exl3Config {
    fn default() -> Self {
        Self {
            reconstruct_batch_threshold: DEFAULT_RECONSTRUCT_THRESHOLD,
            default_out_dtype: DType::F16,
        }
    }
}

impl Exl3Config {
    /// Configuration that always reconstructs, regardless of batch size.
    #[must_use]
    pub fn always_reconstruct() -> Self {
        Self {
            reconstruct_batch_threshold: 0,
            ..Self::default()
        }
    }

    /// Configuration that always takes the fused path.
    #[must_use]
    pub fn always_fused() -> Self {
        Self {
            reconstruct_batch_threshold: usize::MAX,
            ..Self::default()
        }
    }

    /// Check the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`Exl3Error::InvalidConfig`] if `default_out_dtype` is not a
    /// floating-point type; forward outputs are real-valued.
    pub fn validate(&self) -> Result<()> {
        if !self.default_out_dtype.is_float() {
            return Err(Exl3Error::InvalidConfig(format!(
                "default_out_dtype must be a float type, got {:?}",
                self.default_out_dtype
            )));
        }
        Ok(())
    }
}
