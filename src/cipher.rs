//! RLWE and MLWE ciphertexts.

use serde::{Deserialize, Serialize};

use crate::error::{EvdError, Result};
use crate::math::Polynomial;
use crate::params::{DEGREE, MOD_Q};

/// RLWE ciphertext over the degree-N ring mod Q.
///
/// Rank-1 form `(a, b)` decrypts as `a·s + b ≡ Δ·m`; the extended form
/// `(a, b, c)` produced by a ciphertext-ciphertext multiplication
/// decrypts as `a·s² + b·s + c ≡ Δ·m` until relinearization reduces it
/// back to rank 1.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RlweCiphertext {
    /// Mask polynomial (multiplies s).
    pub a: Polynomial,
    /// Body polynomial.
    pub b: Polynomial,
    /// Present only on extended ciphertexts (multiplies s² via `a`).
    pub c: Option<Polynomial>,
}

impl RlweCiphertext {
    /// Fresh all-zero rank-1 ciphertext in coefficient domain.
    pub fn zero() -> Self {
        Self {
            a: Polynomial::zero(DEGREE, MOD_Q),
            b: Polynomial::zero(DEGREE, MOD_Q),
            c: None,
        }
    }

    /// Fresh all-zero extended ciphertext in coefficient domain.
    pub fn zero_extended() -> Self {
        Self {
            a: Polynomial::zero(DEGREE, MOD_Q),
            b: Polynomial::zero(DEGREE, MOD_Q),
            c: Some(Polynomial::zero(DEGREE, MOD_Q)),
        }
    }

    /// Assembles a rank-1 ciphertext from its parts.
    pub fn from_parts(a: Polynomial, b: Polynomial) -> Self {
        debug_assert_eq!(a.degree(), b.degree());
        debug_assert_eq!(a.modulus(), b.modulus());
        Self { a, b, c: None }
    }

    /// Whether this is an extended (three-polynomial) ciphertext.
    pub fn is_extended(&self) -> bool {
        self.c.is_some()
    }

    /// Domain flag; all component polynomials share it.
    pub fn is_ntt(&self) -> bool {
        self.a.is_ntt()
    }

    /// Sets the domain flag on every component.
    pub fn set_is_ntt(&mut self, is_ntt: bool) {
        self.a.set_is_ntt(is_ntt);
        self.b.set_is_ntt(is_ntt);
        if let Some(c) = &mut self.c {
            c.set_is_ntt(is_ntt);
        }
    }

    /// The extended component, or a typed error on a rank-1 ciphertext.
    pub fn c(&self) -> Result<&Polynomial> {
        self.c.as_ref().ok_or(EvdError::InvalidExtendedState)
    }
}

/// MLWE ciphertext of rank R: `stack = N/R` mask polynomials plus one
/// body polynomial, all of degree R mod Q.
///
/// Compact form for a vector packed in the degree-R subring; ciphertext
/// size scales with the vector dimension rather than with N.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MlweCiphertext {
    rank: u64,
    stack: u64,
    /// `stack` A-polynomials followed by B.
    polys: Vec<Polynomial>,
}

impl MlweCiphertext {
    /// Fresh all-zero MLWE ciphertext at the given rank (R | N).
    pub fn zero(rank: u64) -> Result<Self> {
        if rank == 0 || !rank.is_power_of_two() || rank > DEGREE {
            return Err(EvdError::InvalidRank(rank));
        }
        let stack = DEGREE / rank;
        Ok(Self {
            rank,
            stack,
            polys: vec![Polynomial::zero(rank, MOD_Q); stack as usize + 1],
        })
    }

    /// Packing rank R.
    pub fn rank(&self) -> u64 {
        self.rank
    }

    /// Number of A-polynomials (N / R).
    pub fn stack(&self) -> u64 {
        self.stack
    }

    /// i-th mask polynomial, i < stack.
    pub fn a(&self, i: u64) -> &Polynomial {
        &self.polys[i as usize]
    }

    /// Mutable i-th mask polynomial.
    pub fn a_mut(&mut self, i: u64) -> &mut Polynomial {
        &mut self.polys[i as usize]
    }

    /// Body polynomial.
    pub fn b(&self) -> &Polynomial {
        &self.polys[self.stack as usize]
    }

    /// Mutable body polynomial.
    pub fn b_mut(&mut self) -> &mut Polynomial {
        let i = self.stack as usize;
        &mut self.polys[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_flag_follows_c() {
        let ct = RlweCiphertext::zero();
        assert!(!ct.is_extended());
        assert!(ct.c().is_err());

        let ext = RlweCiphertext::zero_extended();
        assert!(ext.is_extended());
        assert!(ext.c().is_ok());
    }

    #[test]
    fn mlwe_shape() {
        let ct = MlweCiphertext::zero(128).unwrap();
        assert_eq!(ct.rank(), 128);
        assert_eq!(ct.stack(), DEGREE / 128);
        assert_eq!(ct.b().degree(), 128);
        assert_eq!(ct.a(0).degree(), 128);
    }

    #[test]
    fn mlwe_rejects_bad_rank() {
        assert!(MlweCiphertext::zero(0).is_err());
        assert!(MlweCiphertext::zero(3).is_err());
        assert!(MlweCiphertext::zero(2 * DEGREE).is_err());
    }
}
