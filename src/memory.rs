//! Memory footprint accounting for quantized layers.

/// Storage breakdown of one compressed linear layer.
#[derive(Debug, Clone, Copy)]
pub struct LayerFootprint {
    /// Logical weight count (`in_features × out_features`).
    pub weights: usize,
    /// Bytes of trellis codewords.
    pub trellis_bytes: usize,
    /// Bytes of sign vectors (canonical unpacked F16 form).
    pub sign_bytes: usize,
    /// Bytes of bias, zero if absent.
    pub bias_bytes: usize,
}

impl LayerFootprint {
    /// Total compressed storage in bytes.
    #[must_use]
    pub const fn total_bytes(&self) -> usize {
        self.trellis_bytes + self.sign_bytes + self.bias_bytes
    }

    /// Average stored bits per weight, including sign and bias overhead.
    #[must_use]
    pub fn bits_per_weight(&self) -> f32 {
        // Precision loss acceptable for a reporting metric
        #[allow(clippy::cast_precision_loss)]
        {
            (self.total_bytes() * 8) as f32 / self.weights as f32
        }
    }

    /// Compression ratio versus an uncompressed F16 weight matrix.
    #[must_use]
    pub fn f16_compression_ratio(&self) -> f32 {
        #[allow(clippy::cast_precision_loss)]
        {
            (self.weights * 2) as f32 / self.total_bytes() as f32
        }
    }
}

/// Render a byte count with a binary-unit suffix.
#[must_use]
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    #[allow(clippy::cast_precision_loss)]
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}
