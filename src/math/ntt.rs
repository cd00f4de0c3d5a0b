//! Negacyclic Number-Theoretic Transform.
//!
//! Cooley-Tukey forward / Gentleman-Sande inverse butterflies over
//! Z_q[X]/(X^n + 1), using a primitive 2n-th root of unity ψ with
//! ψ^n = -1. Twiddle factors are stored in bit-reversed order and
//! multiplied in Montgomery form; inputs and outputs are plain
//! standard-domain residues so transformed polynomials can go straight
//! onto the wire.

use crate::math::mod_arith::pow_mod;

/// Precomputed transform for one (degree, modulus) pair.
///
/// Each `HEval` owns four of these: {rank, N} × {Q, P}. Construction is
/// eager so per-operation timing carries no first-use lookup cost.
#[derive(Clone)]
pub struct NttTable {
    degree: usize,
    modulus: u64,
    /// -modulus^{-1} mod 2^64 for Montgomery reduction.
    q_inv_neg: u64,
    /// (2^64)^2 mod modulus, for conversion into Montgomery form.
    r_squared: u64,
    /// ψ^{bitrev(j)} in Montgomery form.
    psi_rev: Vec<u64>,
    /// ψ^{-bitrev(j)} in Montgomery form.
    psi_inv_rev: Vec<u64>,
    /// degree^{-1} mod modulus in Montgomery form.
    n_inv: u64,
}

impl NttTable {
    /// Builds the table for a power-of-two `degree` and a prime
    /// `modulus` with modulus ≡ 1 (mod 2·degree).
    pub fn new(degree: usize, modulus: u64) -> Self {
        assert!(degree.is_power_of_two(), "degree must be a power of two");
        assert_eq!(
            modulus % (2 * degree as u64),
            1,
            "modulus must be 1 mod 2*degree"
        );

        let q_inv_neg = Self::compute_q_inv_neg(modulus);
        let r_squared = Self::compute_r_squared(modulus);

        let psi = Self::find_primitive_root(2 * degree as u64, modulus);
        let psi_inv = pow_mod(psi, modulus - 2, modulus);

        let psi_mont = Self::to_mont_raw(psi, modulus, r_squared, q_inv_neg);
        let psi_inv_mont = Self::to_mont_raw(psi_inv, modulus, r_squared, q_inv_neg);

        let psi_rev = Self::twiddles(degree, psi_mont, modulus, q_inv_neg, r_squared);
        let psi_inv_rev = Self::twiddles(degree, psi_inv_mont, modulus, q_inv_neg, r_squared);

        let n_inv_plain = pow_mod(degree as u64, modulus - 2, modulus);
        let n_inv = Self::to_mont_raw(n_inv_plain, modulus, r_squared, q_inv_neg);

        Self {
            degree,
            modulus,
            q_inv_neg,
            r_squared,
            psi_rev,
            psi_inv_rev,
            n_inv,
        }
    }

    /// Transform degree.
    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Transform modulus.
    pub fn modulus(&self) -> u64 {
        self.modulus
    }

    /// In-place forward NTT; standard-domain coefficients in,
    /// standard-domain evaluations out.
    pub fn forward(&self, coeffs: &mut [u64]) {
        assert_eq!(coeffs.len(), self.degree, "input length must equal degree");

        for c in coeffs.iter_mut() {
            *c = self.to_mont(*c);
        }

        let n = self.degree;
        let q = self.modulus;
        let mut t = n;
        let mut m = 1;
        while m < n {
            t >>= 1;
            for i in 0..m {
                let j1 = 2 * i * t;
                let w = self.psi_rev[m + i];
                for j in j1..j1 + t {
                    let u = coeffs[j];
                    let v = self.mont_mul(coeffs[j + t], w);
                    coeffs[j] = if u + v >= q { u + v - q } else { u + v };
                    coeffs[j + t] = if u >= v { u - v } else { q - v + u };
                }
            }
            m <<= 1;
        }

        for c in coeffs.iter_mut() {
            *c = self.from_mont(*c);
        }
    }

    /// In-place inverse NTT; standard-domain evaluations in,
    /// standard-domain coefficients out.
    pub fn inverse(&self, coeffs: &mut [u64]) {
        assert_eq!(coeffs.len(), self.degree, "input length must equal degree");

        for c in coeffs.iter_mut() {
            *c = self.to_mont(*c);
        }

        let n = self.degree;
        let q = self.modulus;
        let mut t = 1;
        let mut m = n;
        while m > 1 {
            m >>= 1;
            for i in 0..m {
                let j1 = i * 2 * t;
                let w = self.psi_inv_rev[m + i];
                for j in j1..j1 + t {
                    let u = coeffs[j];
                    let v = coeffs[j + t];
                    coeffs[j] = if u + v >= q { u + v - q } else { u + v };
                    let diff = if u >= v { u - v } else { q - v + u };
                    coeffs[j + t] = self.mont_mul(diff, w);
                }
            }
            t <<= 1;
        }

        for c in coeffs.iter_mut() {
            *c = self.from_mont(self.mont_mul(*c, self.n_inv));
        }
    }

    #[inline]
    fn mont_mul(&self, a: u64, b: u64) -> u64 {
        let ab = a as u128 * b as u128;
        let m = (ab as u64).wrapping_mul(self.q_inv_neg) as u128;
        let t = ((ab + m * self.modulus as u128) >> 64) as u64;
        if t >= self.modulus {
            t - self.modulus
        } else {
            t
        }
    }

    #[inline]
    fn to_mont(&self, a: u64) -> u64 {
        Self::to_mont_raw(a, self.modulus, self.r_squared, self.q_inv_neg)
    }

    #[inline]
    fn from_mont(&self, a: u64) -> u64 {
        self.mont_mul(a, 1)
    }

    #[inline]
    fn to_mont_raw(a: u64, q: u64, r_squared: u64, q_inv_neg: u64) -> u64 {
        let ab = a as u128 * r_squared as u128;
        let m = (ab as u64).wrapping_mul(q_inv_neg) as u128;
        let t = ((ab + m * q as u128) >> 64) as u64;
        if t >= q {
            t - q
        } else {
            t
        }
    }

    fn compute_q_inv_neg(q: u64) -> u64 {
        // Hensel-lift q^{-1} mod 2^64 bit by bit, then negate.
        let mut y: u64 = 1;
        for i in 1..64 {
            let yi = y.wrapping_mul(q) & (1u64 << i);
            y |= yi;
        }
        y.wrapping_neg()
    }

    fn compute_r_squared(q: u64) -> u64 {
        let r_mod_q = (1u128 << 64) % q as u128;
        ((r_mod_q * r_mod_q) % q as u128) as u64
    }

    /// Finds a primitive n-th root of unity modulo q.
    fn find_primitive_root(n: u64, q: u64) -> u64 {
        let exp = (q - 1) / n;
        for g in 2..q {
            let candidate = pow_mod(g, exp, q);
            if pow_mod(candidate, n, q) == 1 && pow_mod(candidate, n / 2, q) != 1 {
                return candidate;
            }
        }
        unreachable!("no primitive root for valid NTT parameters");
    }

    /// Twiddle table in bit-reversed order: factors[j] = ψ^{bitrev(j)}.
    ///
    /// Built incrementally: a power-of-two index starts a new level with
    /// ψ^{n/(2m)}; every other index splits into its lowest set bit and
    /// the remainder, whose factors multiply.
    fn twiddles(n: usize, psi_mont: u64, q: u64, q_inv_neg: u64, r_squared: u64) -> Vec<u64> {
        let mont_mul = |a: u64, b: u64| -> u64 {
            let ab = a as u128 * b as u128;
            let m = (ab as u64).wrapping_mul(q_inv_neg) as u128;
            let t = ((ab + m * q as u128) >> 64) as u64;
            if t >= q {
                t - q
            } else {
                t
            }
        };

        let mut factors = vec![0u64; n];
        if n == 1 {
            return factors;
        }
        for m in 1..n {
            if m.is_power_of_two() {
                let exp = n / (2 * m);
                let mut pow = Self::to_mont_raw(1, q, r_squared, q_inv_neg);
                for _ in 0..exp {
                    pow = mont_mul(pow, psi_mont);
                }
                factors[m] = pow;
            } else {
                let prev = m & (m - 1);
                let step = m & m.wrapping_neg();
                factors[m] = mont_mul(factors[prev], factors[step]);
            }
        }
        factors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::mod_arith::mul_mod;
    use crate::params::{MOD_P, MOD_Q};

    #[test]
    fn roundtrip_small() {
        let n = 16;
        let table = NttTable::new(n, MOD_Q);
        let original: Vec<u64> = (0..n as u64).collect();
        let mut coeffs = original.clone();
        table.forward(&mut coeffs);
        table.inverse(&mut coeffs);
        assert_eq!(coeffs, original);
    }

    #[test]
    fn roundtrip_full_degree_both_moduli() {
        for q in [MOD_Q, MOD_P] {
            let n = 4096;
            let table = NttTable::new(n, q);
            let original: Vec<u64> = (0..n as u64).map(|i| (i * 0x9e3779b9) % q).collect();
            let mut coeffs = original.clone();
            table.forward(&mut coeffs);
            table.inverse(&mut coeffs);
            assert_eq!(coeffs, original);
        }
    }

    #[test]
    fn zero_is_fixed_point() {
        let table = NttTable::new(256, MOD_Q);
        let mut coeffs = vec![0u64; 256];
        table.forward(&mut coeffs);
        assert!(coeffs.iter().all(|&c| c == 0));
    }

    #[test]
    fn pointwise_product_is_negacyclic_convolution() {
        // x * x^(n-1) = x^n = -1 in Z_q[X]/(X^n + 1).
        let n = 256;
        let q = MOD_Q;
        let table = NttTable::new(n, q);

        let mut a = vec![0u64; n];
        a[1] = 1;
        let mut b = vec![0u64; n];
        b[n - 1] = 1;

        table.forward(&mut a);
        table.forward(&mut b);
        let mut prod: Vec<u64> = a.iter().zip(&b).map(|(&x, &y)| mul_mod(x, y, q)).collect();
        table.inverse(&mut prod);

        assert_eq!(prod[0], q - 1);
        assert!(prod[1..].iter().all(|&c| c == 0));
    }

    #[test]
    fn forward_is_linear() {
        let n = 128;
        let q = MOD_Q;
        let table = NttTable::new(n, q);

        let a: Vec<u64> = (0..n as u64).map(|i| i * 31 % q).collect();
        let b: Vec<u64> = (0..n as u64).map(|i| i * 77 % q).collect();
        let sum: Vec<u64> = a.iter().zip(&b).map(|(&x, &y)| (x + y) % q).collect();

        let mut a_ntt = a.clone();
        let mut b_ntt = b.clone();
        let mut sum_ntt = sum.clone();
        table.forward(&mut a_ntt);
        table.forward(&mut b_ntt);
        table.forward(&mut sum_ntt);

        for i in 0..n {
            assert_eq!(sum_ntt[i], (a_ntt[i] + b_ntt[i]) % q);
        }
    }
}
