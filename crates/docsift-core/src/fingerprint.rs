//! Perceptual fingerprints.
//!
//! A [`Fingerprint`] is a 64-bit DCT hash ("pHash") of an image's
//! luminance. Resizing and lossy re-encoding only perturb high-frequency
//! content, so the low-frequency sign pattern captured here moves by a few
//! bits at most, while structurally different images disagree on about
//! half of them.
//!
//! # Algorithm
//!
//! 1. The caller reduces the image to a `32 × 32` grayscale grid
//!    ([`HASH_INPUT_SIDE`]).
//! 2. A 2-D DCT-II is applied; only the top-left `8 × 8` block of
//!    coefficients is computed.
//! 3. Bit `i` (row-major over the block) is set when coefficient `i` is
//!    greater than the median of the 63 AC coefficients.
//!
//! Decoding and resizing live in the root crate; this module only sees
//! the grid, which keeps it deterministic and free of codec dependencies.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Side length of the grayscale grid the hash is computed from.
pub const HASH_INPUT_SIDE: usize = 32;

/// Side length of the low-frequency DCT block kept in the hash.
const BLOCK_SIDE: usize = 8;

/// 64-bit perceptual hash of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Number of differing bits (0..=64).
    pub fn distance(&self, other: &Fingerprint) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    /// Whether `other` lies within `threshold` bits of `self`.
    pub fn is_near(&self, other: &Fingerprint, threshold: u32) -> bool {
        self.distance(other) <= threshold
    }

    /// Compute the fingerprint of a `32 × 32` luminance grid in row-major
    /// order (values in any consistent scale, typically `0..=255`).
    ///
    /// # Panics
    ///
    /// Panics if `pixels.len() != 32 * 32`; the root crate's extractor
    /// always resizes to exactly that shape.
    pub fn from_luma_grid(pixels: &[f64]) -> Self {
        assert_eq!(
            pixels.len(),
            HASH_INPUT_SIDE * HASH_INPUT_SIDE,
            "fingerprint input must be a {0}x{0} grid",
            HASH_INPUT_SIDE
        );

        let coeffs = dct_low_block(pixels);

        let mut ac: Vec<f64> = coeffs[1..].to_vec();
        ac.sort_by(|a, b| a.total_cmp(b));
        let median = ac[ac.len() / 2];

        let bits = coeffs
            .iter()
            .enumerate()
            .filter(|(_, c)| **c > median)
            .fold(0u64, |acc, (i, _)| acc | (1u64 << i));

        Self(bits)
    }
}

/// Separable DCT-II restricted to the `BLOCK_SIDE × BLOCK_SIDE`
/// lowest frequencies. Returns coefficients row-major (`v * 8 + u`).
fn dct_low_block(pixels: &[f64]) -> [f64; BLOCK_SIDE * BLOCK_SIDE] {
    let n = HASH_INPUT_SIDE;
    let nf = n as f64;

    // basis[k][x] = alpha(k) * cos((2x + 1) k pi / 2N)
    let mut basis = [[0.0f64; HASH_INPUT_SIDE]; BLOCK_SIDE];
    for (k, row) in basis.iter_mut().enumerate() {
        let alpha = if k == 0 { (1.0 / nf).sqrt() } else { (2.0 / nf).sqrt() };
        for (x, cell) in row.iter_mut().enumerate() {
            *cell = alpha * (((2 * x + 1) as f64) * (k as f64) * PI / (2.0 * nf)).cos();
        }
    }

    // Rows first: tmp[y][u] = sum_x p[y][x] * basis[u][x]
    let mut tmp = [[0.0f64; BLOCK_SIDE]; HASH_INPUT_SIDE];
    for (y, tmp_row) in tmp.iter_mut().enumerate() {
        let row = &pixels[y * n..(y + 1) * n];
        for (u, out) in tmp_row.iter_mut().enumerate() {
            *out = row.iter().zip(basis[u].iter()).map(|(p, b)| p * b).sum();
        }
    }

    // Then columns: out[v][u] = sum_y basis[v][y] * tmp[y][u]
    let mut out = [0.0f64; BLOCK_SIDE * BLOCK_SIDE];
    for v in 0..BLOCK_SIDE {
        for u in 0..BLOCK_SIDE {
            out[v * BLOCK_SIDE + u] = (0..n).map(|y| basis[v][y] * tmp[y][u]).sum();
        }
    }
    out
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Error returned when parsing a fingerprint from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid fingerprint '{0}': expected 16 hex digits")]
pub struct ParseFingerprintError(String);

impl FromStr for Fingerprint {
    type Err = ParseFingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 {
            return Err(ParseFingerprintError(s.to_string()));
        }
        u64::from_str_radix(s, 16)
            .map(Fingerprint)
            .map_err(|_| ParseFingerprintError(s.to_string()))
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.to_string()
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = ParseFingerprintError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Blocky pseudo-random grid, stable across runs.
    fn block_grid(seed: u64) -> Vec<f64> {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let mut cells = [[0.0f64; 8]; 8];
        for row in cells.iter_mut() {
            for cell in row.iter_mut() {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                *cell = ((state >> 33) % 256) as f64;
            }
        }
        let mut grid = Vec::with_capacity(HASH_INPUT_SIDE * HASH_INPUT_SIDE);
        for y in 0..HASH_INPUT_SIDE {
            for x in 0..HASH_INPUT_SIDE {
                grid.push(cells[y / 4][x / 4]);
            }
        }
        grid
    }

    #[test]
    fn test_deterministic() {
        let grid = block_grid(7);
        assert_eq!(
            Fingerprint::from_luma_grid(&grid),
            Fingerprint::from_luma_grid(&grid)
        );
    }

    #[test]
    fn test_small_noise_stays_near() {
        let grid = block_grid(11);
        let noisy: Vec<f64> = grid
            .iter()
            .enumerate()
            .map(|(i, p)| p + if i % 2 == 0 { 1.5 } else { -1.5 })
            .collect();
        let a = Fingerprint::from_luma_grid(&grid);
        let b = Fingerprint::from_luma_grid(&noisy);
        assert!(a.distance(&b) <= 4, "distance {}", a.distance(&b));
    }

    #[test]
    fn test_brightness_shift_is_invariant() {
        let grid = block_grid(3);
        let brighter: Vec<f64> = grid.iter().map(|p| p * 0.8 + 20.0).collect();
        let a = Fingerprint::from_luma_grid(&grid);
        let b = Fingerprint::from_luma_grid(&brighter);
        assert!(a.distance(&b) <= 2, "distance {}", a.distance(&b));
    }

    #[test]
    fn test_different_content_is_far() {
        let a = Fingerprint::from_luma_grid(&block_grid(1));
        let b = Fingerprint::from_luma_grid(&block_grid(2));
        assert!(a.distance(&b) > 10, "distance {}", a.distance(&b));
    }

    #[test]
    fn test_hex_round_trip_and_validation() {
        let fp = Fingerprint::from_bits(0x00ff_1234_abcd_0001);
        assert_eq!(fp.to_string(), "00ff1234abcd0001");
        assert_eq!("00ff1234abcd0001".parse::<Fingerprint>().unwrap(), fp);
        assert!("xyz".parse::<Fingerprint>().is_err());
        assert!("00ff1234abcd000g".parse::<Fingerprint>().is_err());
    }

    #[test]
    fn test_distance() {
        let a = Fingerprint::from_bits(0);
        let b = Fingerprint::from_bits(0b1011);
        assert_eq!(a.distance(&b), 3);
        assert!(a.is_near(&b, 3));
        assert!(!a.is_near(&b, 2));
    }

    #[test]
    #[should_panic]
    fn test_wrong_grid_size_panics() {
        Fingerprint::from_luma_grid(&[0.0; 10]);
    }
}
