// SPDX-License-Identifier: MIT

//! EXL3 trellis-quantized linear layers.
//!
//! EXL3 stores each linear layer as a "trellis" code plus per-axis Hadamard
//! sign vectors and reconstructs, or directly multiplies against,
//! full-precision activations on demand:
//!
//! ```text
//! y = H(H(x ∘ suh) @ decode(trellis)) ∘ svh + bias
//! ```
//!
//! where `H` is the radix-128 Hadamard transform and `decode` expands 16-bit
//! codewords into ±1 weight patterns at `K` bits per weight.
//!
//! ## Module Structure
//!
//! - [`config`] - Execution configuration (batch threshold, output dtype)
//! - [`types`] - Storage types (`TrellisTensor`, sign sources)
//! - [`codec`] - Codeword decode and the versioned scramble
//! - [`backend`] - Kernel dispatch boundary (`Exl3Backend`, `CpuBackend`)
//! - [`linear`] - The `Exl3Linear` layer itself
//! - [`alloc`] - Consumer interface for external bit allocation

pub mod alloc;
pub mod backend;
pub mod codec;
pub mod config;
pub mod linear;
pub mod types;

pub use alloc::{BitAllocator, BitAssignment, QuantArgs, SublayerShape, UniformAllocator};
pub use backend::{CpuBackend, Exl3Backend};
pub use config::Exl3Config;
pub use linear::{Exl3Linear, Exl3LinearBuilder};
pub use types::{Exl3TensorData, SignSource, TrellisTensor};
