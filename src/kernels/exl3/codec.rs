// SPDX-License-Identifier: MIT

//! Trellis codec: 16-bit codewords → half-precision weight values.
//!
//! Decoding is bit-unpacking into a sign pattern, not a learned codebook.
//! Each 16-bit codeword contributes one ±1 term per bit position (bit set →
//! −1.0, clear → +1.0); a group of 16 weight values is reconstructed from `K`
//! codewords by averaging the `K` contributions per position, so the
//! compressed width is exactly `K` bits per weight and the all-clear code
//! decodes to a uniform +1.0.
//!
//! An optional multiplicative-congruential scramble is applied to each
//! codeword before unpacking. The exact arithmetic is a versioned transform
//! (version 1 below); decode must be bit-exact reproducible, so everything
//! here is integer math plus fixed f32 accumulation.

/// Side length of a trellis tile; each tile covers `TILE × TILE` weights.
pub const TILE: usize = 16;

/// Weight values per decoded tile.
pub const TILE_VALUES: usize = TILE * TILE;

/// Version-1 codeword scramble.
///
/// Widens the codeword to 32 bits and multiplies by `mcg_mult`, then by
/// `mul1_mult`, keeping the low 16 bits after each step. A zero constant
/// skips its step, so `(0, 0)` is the identity. Odd multipliers are
/// bijections modulo 2^16, which keeps the code space lossless.
#[inline]
#[must_use]
pub fn scramble(code: u16, mcg_mult: u32, mul1_mult: u32) -> u16 {
    let mut c = u32::from(code);
    if mcg_mult != 0 {
        c = c.wrapping_mul(mcg_mult) & 0xffff;
    }
    if mul1_mult != 0 {
        c = c.wrapping_mul(mul1_mult) & 0xffff;
    }
    #[allow(clippy::cast_possible_truncation)]
    {
        c as u16
    }
}

/// Decode one group of 16 weight values from its `K` codewords.
///
/// # Panics
///
/// Panics if `words` is empty (a group always has `K ≥ 1` codewords).
#[inline]
pub fn decode_group(words: &[u16], mcg_mult: u32, mul1_mult: u32, out: &mut [f32; TILE]) {
    assert!(!words.is_empty(), "trellis group must have K >= 1 codewords");
    let mut acc = [0.0f32; TILE];
    for &word in words {
        let c = scramble(word, mcg_mult, mul1_mult);
        for (j, a) in acc.iter_mut().enumerate() {
            *a += if (c >> j) & 1 == 1 { -1.0 } else { 1.0 };
        }
    }
    #[allow(clippy::cast_precision_loss)]
    let inv_k = 1.0 / words.len() as f32;
    for (o, a) in out.iter_mut().zip(&acc) {
        *o = a * inv_k;
    }
}

/// Decode a full `16 × 16` tile from its `16·K` codewords.
///
/// `words` holds the codewords of tile row `g` at `g·K .. (g+1)·K`; the
/// decoded value for tile position `(g, j)` lands at `out[g·16 + j]`.
///
/// # Panics
///
/// Panics if `words.len()` is not a positive multiple of 16.
pub fn decode_tile(words: &[u16], mcg_mult: u32, mul1_mult: u32, out: &mut [f32; TILE_VALUES]) {
    assert!(
        !words.is_empty() && words.len() % TILE == 0,
        "trellis tile must hold 16·K codewords, got {}",
        words.len()
    );
    let k = words.len() / TILE;
    let mut group = [0.0f32; TILE];
    for g in 0..TILE {
        decode_group(&words[g * k..(g + 1) * k], mcg_mult, mul1_mult, &mut group);
        out[g * TILE..(g + 1) * TILE].copy_from_slice(&group);
    }
}

/// Unpack a sign bitfield into ±1.0 values, 16 signs per word.
///
/// Bit `j` of each word maps to output position `word·16 + j`; a set bit
/// yields −1.0, a clear bit +1.0. Order-preserving and lossless.
#[must_use]
pub fn unpack_bitfield(packed: &[u16]) -> Vec<f32> {
    let mut out = Vec::with_capacity(packed.len() * 16);
    for &word in packed {
        for j in 0..16 {
            out.push(if (word >> j) & 1 == 1 { -1.0 } else { 1.0 });
        }
    }
    out
}

/// Pack ±1.0 signs into a bitfield, the inverse of [`unpack_bitfield`].
///
/// Negative values set their bit. Not used on the inference path; kept for
/// round-trip verification and for writing checkpoints in packed form.
///
/// # Panics
///
/// Panics if `signs.len()` is not a multiple of 16.
#[must_use]
pub fn pack_bitfield(signs: &[f32]) -> Vec<u16> {
    assert!(
        signs.len() % 16 == 0,
        "sign vector length must be a multiple of 16, got {}",
        signs.len()
    );
    signs
        .chunks_exact(16)
        .map(|chunk| {
            let mut word = 0u16;
            for (j, &s) in chunk.iter().enumerate() {
                if s < 0.0 {
                    word |= 1 << j;
                }
            }
            word
        })
        .collect()
}
