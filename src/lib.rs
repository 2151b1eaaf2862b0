//! # exl3-rs
//!
//! EXL3 trellis-quantized linear layers for LLM inference, built on
//! [Candle](https://github.com/huggingface/candle).
//!
//! This crate implements the quantized-linear core of the EXL3 weight
//! format:
//!
//! - Trellis codec: 16-bit codewords expanded deterministically into weight
//!   values at `K` bits per weight, with an optional versioned
//!   multiplicative-congruential scramble
//! - Radix-128 Hadamard transform with per-element sign correction
//! - `Exl3Linear` with two forward strategies: a fused kernel for small
//!   batches and materialize-then-matmul for large ones
//! - A kernel dispatch boundary (`Exl3Backend`) with a reference CPU
//!   implementation; CUDA dispatch goes through Candle's backend under the
//!   `cuda` feature
//!
//! Transformer block composition, evaluation harnesses, and the
//! quantization-time bit-allocation policy live outside this crate; the
//! allocator is consumed through the `BitAllocator` contract only.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use exl3_rs::kernels::exl3::{Exl3Linear, SignSource, TrellisTensor};
//!
//! let layer = Exl3Linear::builder(4096, 4096)
//!     .trellis(TrellisTensor::new(codes, (256, 256, 16 * 4))?)
//!     .row_signs(SignSource::Packed(su))
//!     .col_signs(SignSource::Packed(sv))
//!     .build()?;
//! let y = layer.forward_with(&x, None, None)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod kernels;
pub mod memory;

pub use error::{Exl3Error, Result};
