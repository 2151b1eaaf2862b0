// SPDX-License-Identifier: MIT

//! EXL3 quantized linear layer.
//!
//! One `in_features → out_features` linear transform stored as trellis codes
//! plus per-axis Hadamard sign vectors. `forward` picks between two
//! execution strategies by batch size:
//!
//! - **Fused** (small batches): activations are multiplied directly against
//!   the trellis codes, one decoded tile of scratch at a time, never writing
//!   the dense weight to memory.
//! - **Reconstruct** (large batches): the dense weight is materialized once
//!   and multiplied with a standard GEMM, amortized over the batch rows.
//!
//! Both paths wrap the multiply in the same signed Hadamard transforms and
//! agree to within floating-point rounding; the layer is immutable after
//! construction apart from the host-residency toggle used to free
//! accelerator memory during offline quantization passes.

use std::sync::Arc;

use candle_core::{DType, Device, Module, Tensor};

use super::backend::{CpuBackend, Exl3Backend};
use super::config::Exl3Config;
use super::types::{Exl3TensorData, SignSource, TrellisTensor};
use crate::error::{Exl3Error, Result};
use crate::kernels::hadamard::{apply_hadamard, had_left, had_right, HADAMARD_BLOCK};
use crate::memory::LayerFootprint;

/// A linear layer with EXL3 trellis-quantized weights.
#[derive(Debug, Clone)]
pub struct Exl3Linear {
    in_features: usize,
    out_features: usize,
    trellis: TrellisTensor,
    /// Canonical unpacked row signs, F16 `[in_features]`.
    suh: Tensor,
    /// Canonical unpacked column signs, F16 `[out_features]`.
    svh: Tensor,
    /// Host copies of the signs for the CPU kernels; contents never change.
    suh_host: Vec<f32>,
    svh_host: Vec<f32>,
    bias: Option<Tensor>,
    bias_host: Option<Vec<f32>>,
    mcg_mult: u32,
    mul1_mult: u32,
    out_dtype: Option<DType>,
    config: Exl3Config,
    backend: Arc<dyn Exl3Backend>,
    /// Device to restore on `unswap_cpu`; `Some` while swapped to host.
    swap_device: Option<Device>,
}

impl Exl3Linear {
    /// Start building a layer for the given dimensions.
    #[must_use]
    pub fn builder(in_features: usize, out_features: usize) -> Exl3LinearBuilder {
        Exl3LinearBuilder::new(in_features, out_features)
    }

    /// Input feature count.
    #[must_use]
    pub const fn in_features(&self) -> usize {
        self.in_features
    }

    /// Output feature count.
    #[must_use]
    pub const fn out_features(&self) -> usize {
        self.out_features
    }

    /// Trellis rank `K` (compressed bits per weight).
    #[must_use]
    pub const fn k(&self) -> usize {
        self.trellis.k()
    }

    /// The trellis code block.
    #[must_use]
    pub const fn trellis(&self) -> &TrellisTensor {
        &self.trellis
    }

    /// Bias vector, if present.
    #[must_use]
    pub fn get_bias_tensor(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Storage footprint of the compressed layer.
    #[must_use]
    pub fn footprint(&self) -> LayerFootprint {
        LayerFootprint {
            weights: self.in_features * self.out_features,
            trellis_bytes: self.trellis.memory_bytes(),
            sign_bytes: (self.in_features + self.out_features) * 2,
            bias_bytes: self.bias.as_ref().map_or(0, |b| b.elem_count() * 2),
        }
    }

    /// Total compressed storage in bytes.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.footprint().total_bytes()
    }

    /// Stored bits per weight, including sign and bias overhead.
    #[must_use]
    pub fn bits_per_weight(&self) -> f32 {
        self.footprint().bits_per_weight()
    }

    /// Whether the layer is currently swapped to host memory.
    #[must_use]
    pub const fn is_swapped(&self) -> bool {
        self.swap_device.is_some()
    }

    /// Persisted tensors under `key`, per the checkpoint namespace contract:
    /// `trellis` and the canonical unpacked signs always, `bias` when
    /// present, `mcg`/`mul1` when non-zero.
    #[must_use]
    pub fn get_tensors(&self, key: &str) -> Vec<(String, Exl3TensorData<'_>)> {
        let mut out = vec![
            (
                format!("{key}.trellis"),
                Exl3TensorData::Words {
                    data: self.trellis.codes(),
                    shape: self.trellis.dims(),
                },
            ),
            (format!("{key}.suh"), Exl3TensorData::Tensor(&self.suh)),
            (format!("{key}.svh"), Exl3TensorData::Tensor(&self.svh)),
        ];
        if let Some(ref bias) = self.bias {
            out.push((format!("{key}.bias"), Exl3TensorData::Tensor(bias)));
        }
        if self.mcg_mult != 0 {
            out.push((format!("{key}.mcg"), Exl3TensorData::Scalar(self.mcg_mult)));
        }
        if self.mul1_mult != 0 {
            out.push((format!("{key}.mul1"), Exl3TensorData::Scalar(self.mul1_mult)));
        }
        out
    }

    /// Forward pass with per-call overrides.
    ///
    /// `reconstruct_override` forces the execution strategy; otherwise the
    /// batch size decides (`N > threshold` reconstructs). `out_dtype` takes
    /// precedence over the layer default, which defaults to F16.
    ///
    /// # Errors
    ///
    /// Returns [`Exl3Error::ShapeMismatch`] if the input's last dimension is
    /// not `in_features`; computation errors propagate from candle.
    pub fn forward_with(
        &self,
        x: &Tensor,
        reconstruct_override: Option<bool>,
        out_dtype: Option<DType>,
    ) -> Result<Tensor> {
        let dims = x.shape().dims();
        let last = *dims.last().ok_or_else(|| Exl3Error::ShapeMismatch {
            name: "x",
            expected: vec![self.in_features],
            actual: dims.to_vec(),
        })?;
        if last != self.in_features {
            return Err(Exl3Error::ShapeMismatch {
                name: "x",
                expected: vec![self.in_features],
                actual: dims.to_vec(),
            });
        }

        let batch: usize = dims[..dims.len() - 1].iter().product();
        let use_reconstruct = reconstruct_override
            .unwrap_or(batch > self.config.reconstruct_batch_threshold);
        tracing::debug!(
            batch,
            path = if use_reconstruct { "reconstruct" } else { "fused" },
            "exl3 forward"
        );

        let x2 = x.reshape((batch, self.in_features))?;
        let xv: Vec<f32> = x2.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;

        let mut y = if use_reconstruct {
            self.forward_reconstruct(xv, batch, x.device())?
        } else {
            self.backend.decode_and_multiply(
                &xv,
                batch,
                &self.trellis,
                &self.suh_host,
                &self.svh_host,
                self.mcg_mult,
                self.mul1_mult,
            )?
        };

        if let Some(ref bias) = self.bias_host {
            for row in y.chunks_exact_mut(self.out_features) {
                for (v, b) in row.iter_mut().zip(bias) {
                    *v += b;
                }
            }
        }

        let ret_dtype = out_dtype
            .or(self.out_dtype)
            .unwrap_or(self.config.default_out_dtype);
        let mut out_shape: Vec<usize> = dims[..dims.len() - 1].to_vec();
        out_shape.push(self.out_features);
        Ok(Tensor::from_vec(y, out_shape.as_slice(), x.device())?.to_dtype(ret_dtype)?)
    }

    /// Reconstruct path: transform, one-time dense materialization, GEMM,
    /// inverse transform. The dense weight is scratch, dropped on return.
    fn forward_reconstruct(&self, mut xv: Vec<f32>, batch: usize, device: &Device) -> Result<Vec<f32>> {
        for row in xv.chunks_exact_mut(self.in_features) {
            apply_hadamard(row, Some(&self.suh_host), None, 1.0)?;
        }

        let mut w = vec![0.0f32; self.in_features * self.out_features];
        self.backend
            .reconstruct_into(&self.trellis, self.mcg_mult, self.mul1_mult, &mut w)?;

        let xh = Tensor::from_vec(xv, (batch, self.in_features), device)?;
        let w = Tensor::from_vec(w, (self.in_features, self.out_features), device)?;
        let mut y: Vec<f32> = xh.matmul(&w)?.flatten_all()?.to_vec1()?;

        for row in y.chunks_exact_mut(self.out_features) {
            apply_hadamard(row, None, Some(&self.svh_host), 1.0)?;
        }
        Ok(y)
    }

    /// Materialize the raw decoded weight grid `[in_features, out_features]`
    /// in half precision, without Hadamard or sign corrections.
    ///
    /// # Errors
    ///
    /// Propagates backend and tensor-creation failures.
    pub fn reconstruct_inner(&self) -> Result<Tensor> {
        let mut w = vec![0.0f32; self.in_features * self.out_features];
        self.backend
            .reconstruct_into(&self.trellis, self.mcg_mult, self.mul1_mult, &mut w)?;
        let t = Tensor::from_vec(w, (self.in_features, self.out_features), self.suh.device())?;
        Ok(t.to_dtype(DType::F16)?)
    }

    /// Reconstruct the full corrected weight matrix
    /// `[in_features, out_features]` in half precision, for export and
    /// inspection: inner decode, structural Hadamard on both sides, row
    /// signs broadcast along the input dim, column signs along the output
    /// dim.
    ///
    /// # Errors
    ///
    /// Propagates backend and tensor-creation failures.
    pub fn get_weight_tensor(&self) -> Result<Tensor> {
        let rows = self.in_features;
        let cols = self.out_features;
        let mut w = vec![0.0f32; rows * cols];
        self.backend
            .reconstruct_into(&self.trellis, self.mcg_mult, self.mul1_mult, &mut w)?;

        had_left(&mut w, rows, cols)?;
        for (i, row) in w.chunks_exact_mut(cols).enumerate() {
            let s = self.suh_host[i];
            for v in row.iter_mut() {
                *v *= s;
            }
        }
        had_right(&mut w, rows, cols)?;
        for row in w.chunks_exact_mut(cols) {
            for (v, s) in row.iter_mut().zip(&self.svh_host) {
                *v *= s;
            }
        }

        let t = Tensor::from_vec(w, (rows, cols), self.suh.device())?;
        Ok(t.to_dtype(DType::F16)?)
    }

    /// Export the layer as a dense `candle_nn::Linear`.
    ///
    /// The reconstructed weight is transposed into candle's
    /// `[out_features, in_features]` layout and paired with the bias, so the
    /// result drops into any module tree expecting a full-precision linear.
    /// Intended for validation and for handing layers back to non-quantized
    /// pipelines; it materializes the dense weight.
    ///
    /// # Errors
    ///
    /// Propagates backend and tensor-creation failures.
    pub fn to_linear(&self) -> Result<candle_nn::Linear> {
        let weight = self.get_weight_tensor()?.t()?.contiguous()?;
        Ok(candle_nn::Linear::new(weight, self.bias.clone()))
    }

    /// Move every owned tensor to host memory, remembering the device for
    /// [`unswap_cpu`](Self::unswap_cpu). Idempotent. Used to free
    /// accelerator memory transiently during offline quantization passes;
    /// must not race with a concurrent `forward` (enforced by `&mut self`).
    ///
    /// # Errors
    ///
    /// Propagates device-transfer failures.
    pub fn swap_cpu(&mut self) -> Result<()> {
        if self.swap_device.is_some() {
            return Ok(());
        }
        tracing::debug!("swapping exl3 layer tensors to host");
        self.swap_device = Some(self.suh.device().clone());
        self.suh = self.suh.to_device(&Device::Cpu)?;
        self.svh = self.svh.to_device(&Device::Cpu)?;
        if let Some(bias) = self.bias.take() {
            self.bias = Some(bias.to_device(&Device::Cpu)?);
        }
        Ok(())
    }

    /// Restore tensors to the device recorded by
    /// [`swap_cpu`](Self::swap_cpu). Idempotent if not swapped; contents are
    /// unchanged either way.
    ///
    /// # Errors
    ///
    /// Propagates device-transfer failures.
    pub fn unswap_cpu(&mut self) -> Result<()> {
        let Some(device) = self.swap_device.take() else {
            return Ok(());
        };
        tracing::debug!("restoring exl3 layer tensors from host");
        self.suh = self.suh.to_device(&device)?;
        self.svh = self.svh.to_device(&device)?;
        if let Some(bias) = self.bias.take() {
            self.bias = Some(bias.to_device(&device)?);
        }
        Ok(())
    }
}

/// Uniform-forward node: EXL3 layers compose into an explicit module tree
/// through Candle's `Module` interface.
impl Module for Exl3Linear {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        self.forward_with(x, None, None)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))
    }
}

/// Builder assembling an [`Exl3Linear`] from checkpoint tensors.
///
/// Construction fails fast on the invariants the format demands: the trellis
/// is mandatory and its shape must match the features; exactly one sign
/// representation per axis; unpacked signs must be half precision; a
/// single-precision bias is the only silently coerced input (downcast to
/// half).
#[derive(Debug)]
pub struct Exl3LinearBuilder {
    in_features: usize,
    out_features: usize,
    trellis: Option<TrellisTensor>,
    row_signs: Option<SignSource>,
    col_signs: Option<SignSource>,
    bias: Option<Tensor>,
    mcg_mult: u32,
    mul1_mult: u32,
    out_dtype: Option<DType>,
    config: Exl3Config,
    backend: Option<Arc<dyn Exl3Backend>>,
    device: Device,
}

impl Exl3LinearBuilder {
    /// Create a builder for the given dimensions.
    #[must_use]
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self {
            in_features,
            out_features,
            trellis: None,
            row_signs: None,
            col_signs: None,
            bias: None,
            mcg_mult: 0,
            mul1_mult: 0,
            out_dtype: None,
            config: Exl3Config::default(),
            backend: None,
            device: Device::Cpu,
        }
    }

    /// Set the trellis code block (mandatory).
    #[must_use]
    pub fn trellis(mut self, trellis: TrellisTensor) -> Self {
        self.trellis = Some(trellis);
        self
    }

    /// Set the input-axis signs (`su` packed or `suh` unpacked).
    #[must_use]
    pub fn row_signs(mut self, signs: SignSource) -> Self {
        self.row_signs = Some(signs);
        self
    }

    /// Set the output-axis signs (`sv` packed or `svh` unpacked).
    #[must_use]
    pub fn col_signs(mut self, signs: SignSource) -> Self {
        self.col_signs = Some(signs);
        self
    }

    /// Set the bias vector (F16, or F32 which is downcast).
    #[must_use]
    pub fn bias(mut self, bias: Tensor) -> Self {
        self.bias = Some(bias);
        self
    }

    /// Set the scramble constants (`mcg`, `mul1` bit patterns; 0 disables).
    #[must_use]
    pub fn scramble(mut self, mcg_mult: u32, mul1_mult: u32) -> Self {
        self.mcg_mult = mcg_mult;
        self.mul1_mult = mul1_mult;
        self
    }

    /// Set the layer-default output dtype.
    #[must_use]
    pub fn out_dtype(mut self, dtype: DType) -> Self {
        self.out_dtype = Some(dtype);
        self
    }

    /// Set the execution configuration.
    #[must_use]
    pub fn config(mut self, config: Exl3Config) -> Self {
        self.config = config;
        self
    }

    /// Select the kernel backend (defaults to the CPU reference).
    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn Exl3Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Device for the resolved sign/bias tensors.
    #[must_use]
    pub fn device(mut self, device: &Device) -> Self {
        self.device = device.clone();
        self
    }

    /// Validate and build the layer.
    ///
    /// # Errors
    ///
    /// See the type-level docs for the validation rules; every failure names
    /// the offending tensor.
    pub fn build(self) -> Result<Exl3Linear> {
        self.config.validate()?;
        let (in_features, out_features) = (self.in_features, self.out_features);
        if in_features == 0 || in_features % HADAMARD_BLOCK != 0 {
            return Err(Exl3Error::InvalidConfig(format!(
                "in_features must be a positive multiple of {HADAMARD_BLOCK}, got {in_features}"
            )));
        }
        if out_features == 0 || out_features % HADAMARD_BLOCK != 0 {
            return Err(Exl3Error::InvalidConfig(format!(
                "out_features must be a positive multiple of {HADAMARD_BLOCK}, got {out_features}"
            )));
        }

        let trellis = self.trellis.ok_or(Exl3Error::MissingTensor("trellis"))?;
        let dims = trellis.dims();
        let expected = (in_features / 16, out_features / 16, dims.2);
        if (dims.0, dims.1) != (expected.0, expected.1) {
            return Err(Exl3Error::ShapeMismatch {
                name: "trellis",
                expected: vec![expected.0, expected.1],
                actual: vec![dims.0, dims.1],
            });
        }

        let row_signs = self.row_signs.ok_or(Exl3Error::MissingTensor("su|suh"))?;
        let col_signs = self.col_signs.ok_or(Exl3Error::MissingTensor("sv|svh"))?;
        let suh = row_signs.resolve("su", "suh", in_features, &self.device)?;
        let svh = col_signs.resolve("sv", "svh", out_features, &self.device)?;

        let bias = match self.bias {
            None => None,
            Some(b) => {
                let b = match b.dtype() {
                    DType::F16 => b,
                    // Documented coercion: fp32 checkpoint bias is downcast.
                    DType::F32 => b.to_dtype(DType::F16)?,
                    actual => {
                        return Err(Exl3Error::TensorDtype {
                            name: "bias",
                            expected: DType::F16,
                            actual,
                        })
                    }
                };
                let bdims = b.shape().dims();
                if bdims != [out_features] {
                    return Err(Exl3Error::ShapeMismatch {
                        name: "bias",
                        expected: vec![out_features],
                        actual: bdims.to_vec(),
                    });
                }
                Some(b.to_device(&self.device)?)
            }
        };

        let suh_host: Vec<f32> = suh.to_dtype(DType::F32)?.to_vec1()?;
        let svh_host: Vec<f32> = svh.to_dtype(DType::F32)?.to_vec1()?;
        let bias_host = match bias {
            Some(ref b) => Some(b.to_dtype(DType::F32)?.to_vec1()?),
            None => None,
        };

        Ok(Exl3Linear {
            in_features,
            out_features,
            trellis,
            suh,
            svh,
            suh_host,
            svh_host,
            bias,
            bias_host,
            mcg_mult: self.mcg_mult,
            mul1_mult: self.mul1_mult,
            out_dtype: self.out_dtype,
            config: self.config,
            backend: self.backend.unwrap_or_else(|| Arc::new(CpuBackend)),
            swap_device: None,
        })
    }
}
