//! Quantized-inference kernels.

pub mod exl3;
pub mod hadamard;

pub use exl3::Exl3Linear;
pub use hadamard::apply_hadamard;
