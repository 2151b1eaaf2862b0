// SPDX-License-Identifier: MIT

//! Error types for exl3-rs.

use candle_core::DType;
use thiserror::Error;

/// Result type alias for exl3-rs operations.
pub type Result<T> = std::result::Result<T, Exl3Error>;

/// Errors that can occur in exl3-rs operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Exl3Error {
    /// A required checkpoint tensor was not supplied.
    #[error("missing tensor: {0}")]
    MissingTensor(&'static str),

    /// A supplied tensor has the wrong element type.
    #[error("tensor `{name}` has wrong dtype: expected {expected:?}, got {actual:?}")]
    TensorDtype {
        /// Checkpoint key of the offending tensor
        name: &'static str,
        /// Expected element type
        expected: DType,
        /// Actual element type
        actual: DType,
    },

    /// Shape mismatch.
    #[error("shape mismatch for `{name}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Name of the offending tensor or argument
        name: &'static str,
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Kernel backend error.
    #[error("kernel error: {0}")]
    Kernel(String),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
