//! Polynomial representation.
//!
//! A polynomial is an owned coefficient vector tagged with its modulus
//! and a flag recording whether it currently holds NTT-domain
//! evaluations. Arithmetic lives in [`crate::eval::HEval`]; this type
//! only guarantees the shape invariant `coeffs[i] < modulus`.

use serde::{Deserialize, Serialize};

/// Polynomial in Z_mod[X]/(X^degree + 1), in coefficient or NTT domain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Polynomial {
    coeffs: Vec<u64>,
    modulus: u64,
    is_ntt: bool,
}

impl Polynomial {
    /// Zero polynomial of the given degree and modulus, coefficient domain.
    pub fn zero(degree: u64, modulus: u64) -> Self {
        Self {
            coeffs: vec![0; degree as usize],
            modulus,
            is_ntt: false,
        }
    }

    /// Wraps a coefficient vector, reducing each entry mod `modulus`.
    pub fn from_coeffs(mut coeffs: Vec<u64>, modulus: u64) -> Self {
        for c in &mut coeffs {
            *c %= modulus;
        }
        Self {
            coeffs,
            modulus,
            is_ntt: false,
        }
    }

    /// Wraps raw residues without reduction. The caller guarantees every
    /// entry is already < `modulus`; used by the wire layer where values
    /// arrive as residues by construction.
    pub fn from_raw(coeffs: Vec<u64>, modulus: u64, is_ntt: bool) -> Self {
        debug_assert!(coeffs.iter().all(|&c| c < modulus));
        Self {
            coeffs,
            modulus,
            is_ntt,
        }
    }

    /// Number of coefficients.
    pub fn degree(&self) -> u64 {
        self.coeffs.len() as u64
    }

    /// Modulus tag.
    pub fn modulus(&self) -> u64 {
        self.modulus
    }

    /// Whether the polynomial holds NTT-domain evaluations.
    pub fn is_ntt(&self) -> bool {
        self.is_ntt
    }

    /// Sets the NTT-domain flag. Only the eval and wire layers flip this.
    pub fn set_is_ntt(&mut self, is_ntt: bool) {
        self.is_ntt = is_ntt;
    }

    /// Read access to the coefficient / evaluation vector.
    pub fn coeffs(&self) -> &[u64] {
        &self.coeffs
    }

    /// Write access to the coefficient / evaluation vector.
    pub fn coeffs_mut(&mut self) -> &mut [u64] {
        &mut self.coeffs
    }

    /// True if every coefficient is zero.
    pub fn is_zero(&self) -> bool {
        self.coeffs.iter().all(|&c| c == 0)
    }

    /// Resets to all-zero coefficients in coefficient domain.
    pub fn clear(&mut self) {
        self.coeffs.fill(0);
        self.is_ntt = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::MOD_Q;

    #[test]
    fn from_coeffs_reduces() {
        let p = Polynomial::from_coeffs(vec![MOD_Q, MOD_Q + 5, 3], MOD_Q);
        assert_eq!(p.coeffs(), &[0, 5, 3]);
        assert!(!p.is_ntt());
    }

    #[test]
    fn clear_resets_domain() {
        let mut p = Polynomial::from_raw(vec![1, 2], MOD_Q, true);
        p.clear();
        assert!(p.is_zero());
        assert!(!p.is_ntt());
    }
}
