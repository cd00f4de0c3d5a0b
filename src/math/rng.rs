//! Randomness sources.
//!
//! Three samplers feed the scheme: OS entropy for fresh uniform values,
//! a ChaCha20-based deterministic expander so the uniform halves of
//! switching keys can be reproduced from a stored seed, and a
//! Box-Muller discrete Gaussian that emits one signed sample into both
//! the mod-Q and mod-P residue images.

use std::f64::consts::PI;

use rand::rngs::OsRng;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::error::{EvdError, Result};
use crate::math::poly::Polynomial;
use crate::params::{GAUSSIAN_ERROR_STDEV, SEED_SIZE};

/// Fills `buf` with OS entropy.
pub fn fill_uniform_bytes(buf: &mut [u8]) -> Result<()> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|_| EvdError::RngUnavailable)
}

/// Fresh random seed for deterministic expansion.
pub fn random_seed() -> Result<[u8; SEED_SIZE]> {
    let mut seed = [0u8; SEED_SIZE];
    fill_uniform_bytes(&mut seed)?;
    Ok(seed)
}

/// One uniform byte from OS entropy.
pub fn random_u8() -> Result<u8> {
    let mut b = [0u8; 1];
    fill_uniform_bytes(&mut b)?;
    Ok(b[0])
}

/// One uniform u32 from OS entropy.
pub fn random_u32() -> Result<u32> {
    let mut b = [0u8; 4];
    fill_uniform_bytes(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

/// Uniform polynomial mod `modulus`, coefficient domain.
pub fn uniform_poly(degree: u64, modulus: u64) -> Result<Polynomial> {
    let mut bytes = vec![0u8; degree as usize * 8];
    fill_uniform_bytes(&mut bytes)?;
    Ok(reduce_bytes(&bytes, modulus))
}

/// Deterministic uniform polynomial expanded from `seed`.
///
/// Both endpoints expanding the same seed obtain the same polynomial,
/// so the `a` halves of switching keys need not travel.
pub fn uniform_poly_from_seed(seed: &[u8; SEED_SIZE], degree: u64, modulus: u64) -> Polynomial {
    let mut rng = ChaCha20Rng::from_seed(*seed);
    let mut bytes = vec![0u8; degree as usize * 8];
    rng.fill_bytes(&mut bytes);
    reduce_bytes(&bytes, modulus)
}

fn reduce_bytes(bytes: &[u8], modulus: u64) -> Polynomial {
    let coeffs: Vec<u64> = bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()) % modulus)
        .collect();
    Polynomial::from_raw(coeffs, modulus, false)
}

/// One discrete Gaussian polynomial mod `modulus` (σ = 3.2).
pub fn gaussian_poly(degree: u64, modulus: u64) -> Result<Polynomial> {
    let samples = gaussian_samples(degree)?;
    Ok(signed_to_poly(&samples, modulus))
}

/// A paired Gaussian sample: the SAME signed values expressed in the
/// mod-Q and mod-P residue images, as required by switching-key
/// generation.
pub fn gaussian_pair(degree: u64, mod_q: u64, mod_p: u64) -> Result<(Polynomial, Polynomial)> {
    let samples = gaussian_samples(degree)?;
    Ok((
        signed_to_poly(&samples, mod_q),
        signed_to_poly(&samples, mod_p),
    ))
}

/// Box-Muller over two u32 lanes per output pair.
fn gaussian_samples(degree: u64) -> Result<Vec<i64>> {
    const TWO_TO_32: f64 = (1u64 << 32) as f64;

    let n = degree as usize;
    let mut bytes = vec![0u8; n.max(2) * 4];
    fill_uniform_bytes(&mut bytes)?;
    let lanes: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();

    let mut out = vec![0i64; n];
    for i in 0..n / 2 {
        let rnd1 = lanes[2 * i] as f64 / TWO_TO_32;
        // Keep the radius finite when the lane is zero.
        let rnd2 = (lanes[2 * i + 1] as f64 / TWO_TO_32).max(f64::MIN_POSITIVE);
        let theta = rnd1 * 2.0 * PI;
        let radius = (-2.0 * rnd2.ln()).sqrt() * GAUSSIAN_ERROR_STDEV;
        out[2 * i] = (radius * theta.cos()).round() as i64;
        out[2 * i + 1] = (radius * theta.sin()).round() as i64;
    }
    if n % 2 == 1 {
        let rnd1 = lanes[n - 1] as f64 / TWO_TO_32;
        let rnd2 = (lanes[n.max(2) - 2] as f64 / TWO_TO_32).max(f64::MIN_POSITIVE);
        let theta = rnd1 * 2.0 * PI;
        let radius = (-2.0 * rnd2.ln()).sqrt() * GAUSSIAN_ERROR_STDEV;
        out[n - 1] = (radius * theta.cos()).round() as i64;
    }
    Ok(out)
}

fn signed_to_poly(samples: &[i64], modulus: u64) -> Polynomial {
    let coeffs: Vec<u64> = samples
        .iter()
        .map(|&v| {
            if v < 0 {
                modulus - (-v) as u64
            } else {
                v as u64
            }
        })
        .collect();
    Polynomial::from_raw(coeffs, modulus, false)
}
