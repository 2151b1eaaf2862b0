//! Integration tests for the EXL3 quantized-linear core.
//!
//! Covers the cross-module properties the format guarantees:
//!
//! - Fused and reconstruct forward paths agree across batch sizes,
//!   including both sides of the dispatch threshold
//! - Packed sign bitfields survive a pack/unpack round trip
//! - Reconstruction is deterministic and the golden all-clear trellis
//!   decodes to its analytically known weight matrix
//! - Device swap is an identity on tensor contents
//! - Construction and forward validation reject malformed inputs
//!
//! ```bash
//! cargo test --test integration
//! ```

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor};
use exl3_rs::kernels::exl3::{
    codec, BitAllocator, Exl3Config, QuantArgs, SignSource, SublayerShape, TrellisTensor,
    UniformAllocator,
};

mod helpers;

use helpers::{assert_close, random_input, random_layer};

fn to_vec(t: &Tensor) -> Result<Vec<f32>> {
    Ok(t.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?)
}

// ============================================================================
// Path equivalence
// ============================================================================

#[test]
fn test_forward_paths_agree_across_batch_sizes() -> Result<()> {
    let layer = random_layer(128, 256, 2, 7, 0, 0)?;

    for batch in [1usize, 16, 32, 33, 256] {
        let x = random_input(batch, 128, 1000 + batch as u64)?;
        let fused = layer.forward_with(&x, Some(false), Some(DType::F32))?;
        let reconstructed = layer.forward_with(&x, Some(true), Some(DType::F32))?;
        assert_close(
            &to_vec(&fused)?,
            &to_vec(&reconstructed)?,
            1e-2,
            &format!("batch {batch}"),
        );
    }
    Ok(())
}

#[test]
fn test_forward_paths_agree_with_scramble_and_bias() -> Result<()> {
    let mut rng = helpers::TestRng::new(99);
    let bias: Vec<f32> = (0..256).map(|_| rng.next_f32()).collect();

    let shape = (128 / 16, 256 / 16, 16 * 3);
    let codes: Vec<u16> = (0..shape.0 * shape.1 * shape.2)
        .map(|_| rng.next_u16())
        .collect();
    let su: Vec<u16> = (0..8).map(|_| rng.next_u16()).collect();
    let sv: Vec<u16> = (0..16).map(|_| rng.next_u16()).collect();

    let layer = exl3_rs::kernels::exl3::Exl3Linear::builder(128, 256)
        .trellis(TrellisTensor::new(codes, shape)?)
        .row_signs(SignSource::Packed(su))
        .col_signs(SignSource::Packed(sv))
        .scramble(0x6254_9825, 0x0000_9e3d)
        .bias(Tensor::from_vec(bias, 256, &Device::Cpu)?)
        .build()?;

    let x = random_input(40, 128, 4242)?;
    let fused = layer.forward_with(&x, Some(false), Some(DType::F32))?;
    let reconstructed = layer.forward_with(&x, Some(true), Some(DType::F32))?;
    assert_close(&to_vec(&fused)?, &to_vec(&reconstructed)?, 1e-2, "scrambled");
    Ok(())
}

#[test]
fn test_dispatch_threshold_override() -> Result<()> {
    // Threshold 0 reconstructs even a single row; usize::MAX never does.
    // Both configs must still produce matching numbers.
    let always_rec = random_layer(128, 128, 1, 3, 0, 0)?;
    let x = random_input(1, 128, 5)?;

    let a = always_rec.forward_with(&x, Some(true), Some(DType::F32))?;
    let b = always_rec.forward_with(&x, Some(false), Some(DType::F32))?;
    assert_close(&to_vec(&a)?, &to_vec(&b)?, 1e-2, "override");

    let cfg_layer = {
        let mut rng = helpers::TestRng::new(3);
        let shape = (8, 8, 16);
        let codes: Vec<u16> = (0..shape.0 * shape.1 * shape.2)
            .map(|_| rng.next_u16())
            .collect();
        exl3_rs::kernels::exl3::Exl3Linear::builder(128, 128)
            .trellis(TrellisTensor::new(codes, shape)?)
            .row_signs(SignSource::Packed(vec![0; 8]))
            .col_signs(SignSource::Packed(vec![0; 8]))
            .config(Exl3Config::always_reconstruct())
            .build()?
    };
    let y = cfg_layer.forward_with(&x, None, Some(DType::F32))?;
    assert_eq!(y.shape().dims(), &[1, 128]);
    Ok(())
}

// ============================================================================
// Codec and sign properties
// ============================================================================

#[test]
fn test_sign_round_trip_through_layer() -> Result<()> {
    // Packed signs resolved by the builder must match a direct unpack.
    let mut words = vec![0u16; 8];
    words[3] = 0xb01d;
    let direct = codec::unpack_bitfield(&words);

    let layer = exl3_rs::kernels::exl3::Exl3Linear::builder(128, 128)
        .trellis(TrellisTensor::new(vec![0; 8 * 8 * 16], (8, 8, 16))?)
        .row_signs(SignSource::Packed(words.clone()))
        .col_signs(SignSource::Packed(vec![0; 8]))
        .build()?;

    let tensors = layer.get_tensors("l");
    let (_, data) = &tensors[1];
    let exl3_rs::kernels::exl3::Exl3TensorData::Tensor(suh) = data else {
        panic!("suh entry must be a tensor");
    };
    let resolved: Vec<f32> = suh.to_dtype(DType::F32)?.to_vec1()?;
    assert_eq!(resolved, direct);
    assert_eq!(codec::pack_bitfield(&resolved), words);
    Ok(())
}

// ============================================================================
// Reconstruction
// ============================================================================

#[test]
fn test_reconstruction_determinism() -> Result<()> {
    let layer = random_layer(128, 128, 3, 11, 0x9e37_79b9, 0x85eb_ca77)?;
    let a = to_vec(&layer.get_weight_tensor()?)?;
    let b = to_vec(&layer.get_weight_tensor()?)?;
    assert_eq!(a, b, "repeated reconstruction must be bit-identical");

    let inner = layer.reconstruct_inner()?;
    assert_eq!(inner.shape().dims(), &[128, 128]);
    assert_eq!(inner.dtype(), DType::F16);
    Ok(())
}

#[test]
fn test_golden_all_clear_weight() -> Result<()> {
    // All-clear codes decode to a uniform +1.0 inner grid; with all-+1
    // signs the double Hadamard concentrates each 128-block into its first
    // coefficient: W_full[0, 0] = 128.0, everything else 0.
    let layer = exl3_rs::kernels::exl3::Exl3Linear::builder(128, 128)
        .trellis(TrellisTensor::new(vec![0; 8 * 8 * 32], (8, 8, 32))?)
        .row_signs(SignSource::Packed(vec![0; 8]))
        .col_signs(SignSource::Packed(vec![0; 8]))
        .build()?;

    let inner = to_vec(&layer.reconstruct_inner()?)?;
    assert!(inner.iter().all(|v| (*v - 1.0).abs() < 1e-3));

    let full = to_vec(&layer.get_weight_tensor()?)?;
    assert!((full[0] - 128.0).abs() < 0.5, "got {}", full[0]);
    for (i, v) in full.iter().enumerate().skip(1) {
        assert!(v.abs() < 1e-2, "element {i} should be 0, got {v}");
    }
    Ok(())
}

// ============================================================================
// Device residency
// ============================================================================

#[test]
fn test_device_swap_identity() -> Result<()> {
    let mut rng = helpers::TestRng::new(21);
    let bias: Vec<f32> = (0..128).map(|_| rng.next_f32()).collect();
    let mut layer = {
        let shape = (8, 8, 16);
        let codes: Vec<u16> = (0..shape.0 * shape.1 * shape.2)
            .map(|_| rng.next_u16())
            .collect();
        exl3_rs::kernels::exl3::Exl3Linear::builder(128, 128)
            .trellis(TrellisTensor::new(codes, shape)?)
            .row_signs(SignSource::Packed(vec![0x5a5a; 8]))
            .col_signs(SignSource::Packed(vec![0xa5a5; 8]))
            .bias(Tensor::from_vec(bias, 128, &Device::Cpu)?)
            .build()?
    };

    let x = random_input(4, 128, 77)?;
    let before = to_vec(&layer.forward_with(&x, None, Some(DType::F32))?)?;
    let bias_before = to_vec(layer.get_bias_tensor().unwrap())?;

    layer.swap_cpu()?;
    layer.swap_cpu()?; // idempotent
    layer.unswap_cpu()?;
    layer.unswap_cpu()?; // idempotent

    let after = to_vec(&layer.forward_with(&x, None, Some(DType::F32))?)?;
    assert_eq!(before, after, "swap round trip must not perturb results");
    assert_eq!(bias_before, to_vec(layer.get_bias_tensor().unwrap())?);
    Ok(())
}

// ============================================================================
// Validation
// ============================================================================

#[test]
fn test_forward_rejects_wrong_last_dim() -> Result<()> {
    let layer = random_layer(128, 128, 1, 1, 0, 0)?;
    let x = Tensor::zeros((2, 3, 127), DType::F32, &Device::Cpu)?;
    assert!(layer.forward_with(&x, None, None).is_err());
    Ok(())
}

#[test]
fn test_module_forward_3d_input() -> Result<()> {
    let layer = random_layer(128, 256, 2, 13, 0, 0)?;
    let x = Tensor::ones((2, 40, 128), DType::F16, &Device::Cpu)?;
    let y = Module::forward(&layer, &x)?;
    assert_eq!(y.shape().dims(), &[2, 40, 256]);
    assert_eq!(y.dtype(), DType::F16);
    Ok(())
}

#[test]
fn test_footprint_reporting() -> Result<()> {
    let layer = random_layer(256, 256, 4, 17, 0, 0)?;
    let fp = layer.footprint();
    assert_eq!(fp.weights, 256 * 256);
    // Trellis stores K bits per weight exactly.
    assert_eq!(fp.trellis_bytes * 8, 4 * 256 * 256);
    assert!(layer.bits_per_weight() >= 4.0);
    assert!(fp.f16_compression_ratio() > 3.0);
    Ok(())
}

// ============================================================================
// Bit allocation contract
// ============================================================================

#[test]
fn test_allocator_feeds_layer_construction() -> Result<()> {
    // Consume an allocation the way a quantizer driver would: build each
    // sublayer with the rank the allocator granted.
    let group = [
        SublayerShape {
            in_features: 128,
            out_features: 256,
        },
        SublayerShape {
            in_features: 256,
            out_features: 128,
        },
    ];
    let args = QuantArgs {
        bits_budget: 3 * 2 * 128 * 256,
        min_k: 1,
        max_k: 8,
    };
    let (assignments, surplus) = UniformAllocator.allocate(&args, 0, &group)?;
    assert_eq!(surplus, 0);

    for (shape, assignment) in group.iter().zip(&assignments) {
        let k = assignment.k as usize;
        let layer = random_layer(shape.in_features, shape.out_features, k, 23, 0, 0)?;
        assert_eq!(layer.k(), k);
        assert_eq!(
            layer.trellis().memory_bytes() as u64 * 8,
            assignment.trellis_bits
        );
    }
    Ok(())
}
