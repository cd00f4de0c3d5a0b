//! Homomorphic evaluation: modular polynomial and ciphertext arithmetic.
//!
//! `HEval` owns the per-(degree, modulus) NTT tables and the lookup
//! tables for automorphism inverses and bit reversal, all built eagerly
//! at construction. Operations are shape-checked: an NTT-state or
//! modulus mismatch is a typed programming error, never silently
//! coerced. Arithmetic branches depend only on shapes, not on
//! coefficient values.
//!
//! The key-switching core follows the two-prime pipeline: products are
//! taken against the key's mod-Q and mod-P halves, the mod-P half is
//! brought down to Q by a centered mod-switch, subtracted, and the
//! result scaled by P^{-1} mod Q.

mod mult_sum;

use crate::cipher::{MlweCiphertext, RlweCiphertext};
use crate::error::{EvdError, Result};
use crate::keys::{MlweSwitchingKey, SwitchingKey};
use crate::math::mod_arith::{
    add_mod, barrett_reduce, mul_mod, pow_mod, reverse_bits, sub_mod,
};
use crate::math::{NttTable, Polynomial};
use crate::params::{DEGREE, INVERSE_P_MOD_Q, LOG_DEGREE, MOD_P, MOD_Q, P_BARR, Q_BARR};

pub use mult_sum::MULT_SUM_TILES;

/// Evaluation context configured for one packing rank.
pub struct HEval {
    log_rank: u64,
    rank: u64,
    ntt_rank_q: NttTable,
    ntt_rank_p: NttTable,
    ntt_deg_q: NttTable,
    ntt_deg_p: NttTable,
    /// Automorphism inverse exponents mod 2·rank.
    inv_rank: Vec<u64>,
    /// Automorphism inverse exponents mod 2·N.
    inv_degree: Vec<u64>,
    /// Bit-reversal tables per log-size 0..=LOG_DEGREE.
    bit_rev: Vec<Vec<u64>>,
}

/// NTT images of an MLWE ciphertext's mask polynomials modulo Q and
/// (after the centered mod-switch) modulo P. Precomputed once per
/// query and reused across all rank automorphism exponents.
pub struct MlweUpImage {
    a_q: Vec<Polynomial>,
    a_p: Vec<Polynomial>,
}

impl HEval {
    /// Builds the evaluation context for `rank = 2^log_rank`.
    pub fn new(log_rank: u64) -> Result<Self> {
        if log_rank > LOG_DEGREE {
            return Err(EvdError::InvalidRank(1u64.checked_shl(log_rank as u32).unwrap_or(0)));
        }
        debug_assert_eq!(DEGREE as usize % MULT_SUM_TILES, 0);

        let rank = 1u64 << log_rank;

        let inv_rank = (0..2 * rank)
            .map(|i| pow_mod(i, rank - 1, 2 * rank))
            .collect();
        let inv_degree = (0..2 * DEGREE)
            .map(|i| pow_mod(i, DEGREE - 1, 2 * DEGREE))
            .collect();

        let bit_rev = (0..=LOG_DEGREE)
            .map(|log| (0..1u64 << log).map(|i| reverse_bits(i, log as u32)).collect())
            .collect();

        Ok(Self {
            log_rank,
            rank,
            ntt_rank_q: NttTable::new(rank as usize, MOD_Q),
            ntt_rank_p: NttTable::new(rank as usize, MOD_P),
            ntt_deg_q: NttTable::new(DEGREE as usize, MOD_Q),
            ntt_deg_p: NttTable::new(DEGREE as usize, MOD_P),
            inv_rank,
            inv_degree,
            bit_rev,
        })
    }

    /// Packing rank R.
    pub fn rank(&self) -> u64 {
        self.rank
    }

    /// log2 of the packing rank.
    pub fn log_rank(&self) -> u64 {
        self.log_rank
    }

    /// Inverse of the automorphism exponent `e` modulo 2·`degree`,
    /// where `degree` is the rank or the ring degree N.
    pub fn inv_exponent(&self, e: u64, degree: u64) -> Result<u64> {
        if degree == self.rank {
            Ok(self.inv_rank[(e % (2 * self.rank)) as usize])
        } else if degree == DEGREE {
            Ok(self.inv_degree[(e % (2 * DEGREE)) as usize])
        } else {
            Err(EvdError::InvalidRank(degree))
        }
    }

    /// Bit reversal of `i` within a power-of-two `size` ≤ N.
    pub fn bit_rev(&self, i: u64, size: u64) -> u64 {
        let log = size.trailing_zeros() as usize;
        self.bit_rev[log][i as usize]
    }

    fn table(&self, degree: u64, modulus: u64) -> Result<&NttTable> {
        let t = match (degree, modulus) {
            (d, MOD_Q) if d == DEGREE => &self.ntt_deg_q,
            (d, MOD_P) if d == DEGREE => &self.ntt_deg_p,
            (d, MOD_Q) if d == self.rank => &self.ntt_rank_q,
            (d, MOD_P) if d == self.rank => &self.ntt_rank_p,
            (d, MOD_Q) | (d, MOD_P) => return Err(EvdError::InvalidRank(d)),
            _ => return Err(EvdError::ModulusMismatch),
        };
        Ok(t)
    }

    fn check_pair(op1: &Polynomial, op2: &Polynomial) -> Result<()> {
        if op1.is_ntt() != op2.is_ntt() {
            return Err(EvdError::InvalidNttState);
        }
        if op1.modulus() != op2.modulus() || op1.degree() != op2.degree() {
            return Err(EvdError::ModulusMismatch);
        }
        Ok(())
    }

    // ---- polynomial arithmetic -------------------------------------------

    /// Coefficient-wise sum.
    pub fn add(&self, op1: &Polynomial, op2: &Polynomial) -> Result<Polynomial> {
        let mut res = op1.clone();
        self.add_assign(&mut res, op2)?;
        Ok(res)
    }

    /// res += op, coefficient-wise.
    pub fn add_assign(&self, res: &mut Polynomial, op: &Polynomial) -> Result<()> {
        Self::check_pair(res, op)?;
        let m = res.modulus();
        for (r, &o) in res.coeffs_mut().iter_mut().zip(op.coeffs()) {
            *r = add_mod(*r, o, m);
        }
        Ok(())
    }

    /// Coefficient-wise difference.
    pub fn sub(&self, op1: &Polynomial, op2: &Polynomial) -> Result<Polynomial> {
        let mut res = op1.clone();
        self.sub_assign(&mut res, op2)?;
        Ok(res)
    }

    /// res -= op, coefficient-wise.
    pub fn sub_assign(&self, res: &mut Polynomial, op: &Polynomial) -> Result<()> {
        Self::check_pair(res, op)?;
        let m = res.modulus();
        for (r, &o) in res.coeffs_mut().iter_mut().zip(op.coeffs()) {
            *r = sub_mod(*r, o, m);
        }
        Ok(())
    }

    /// Pointwise product; both operands must hold NTT evaluations.
    pub fn mult(&self, op1: &Polynomial, op2: &Polynomial) -> Result<Polynomial> {
        if !op1.is_ntt() || !op2.is_ntt() {
            return Err(EvdError::InvalidNttState);
        }
        Self::check_pair(op1, op2)?;
        let m = op1.modulus();
        let coeffs = op1
            .coeffs()
            .iter()
            .zip(op2.coeffs())
            .map(|(&a, &b)| mul_mod(a, b, m))
            .collect();
        Ok(Polynomial::from_raw(coeffs, m, true))
    }

    /// Scalar product, domain-agnostic.
    pub fn scalar_mul(&self, op: &Polynomial, scalar: u64) -> Polynomial {
        let mut res = op.clone();
        self.scalar_mul_assign(&mut res, scalar);
        res
    }

    /// res *= scalar, domain-agnostic.
    pub fn scalar_mul_assign(&self, res: &mut Polynomial, scalar: u64) {
        let m = res.modulus();
        let s = scalar % m;
        for r in res.coeffs_mut() {
            *r = mul_mod(*r, s, m);
        }
    }

    /// res = op1·scalar + op3.
    pub fn mad(&self, op1: &Polynomial, scalar: u64, op3: &Polynomial) -> Result<Polynomial> {
        Self::check_pair(op1, op3)?;
        let m = op1.modulus();
        let s = scalar % m;
        let coeffs = op1
            .coeffs()
            .iter()
            .zip(op3.coeffs())
            .map(|(&a, &c)| add_mod(mul_mod(a, s, m), c, m))
            .collect();
        Ok(Polynomial::from_raw(coeffs, m, op1.is_ntt()))
    }

    /// res += op·scalar.
    pub fn mad_assign(&self, res: &mut Polynomial, op: &Polynomial, scalar: u64) -> Result<()> {
        Self::check_pair(res, op)?;
        let m = res.modulus();
        let s = scalar % m;
        for (r, &o) in res.coeffs_mut().iter_mut().zip(op.coeffs()) {
            *r = add_mod(*r, mul_mod(o, s, m), m);
        }
        Ok(())
    }

    /// res = res·scalar + add.
    pub fn scale_mad(&self, res: &mut Polynomial, scalar: u64, add: &Polynomial) -> Result<()> {
        Self::check_pair(res, add)?;
        let m = res.modulus();
        let s = scalar % m;
        for (r, &o) in res.coeffs_mut().iter_mut().zip(add.coeffs()) {
            *r = add_mod(mul_mod(*r, s, m), o, m);
        }
        Ok(())
    }

    /// Multiplies by the monomial X^exponent modulo X^rank + 1, with
    /// sign flip on negacyclic wrap. The polynomial is viewed as `rank`
    /// blocks of `degree/rank` coefficients; `rank == degree` gives the
    /// plain monomial shift. Requires coefficient domain.
    pub fn shift(&self, op: &Polynomial, exponent: u64, rank: u64) -> Result<Polynomial> {
        if op.is_ntt() {
            return Err(EvdError::InvalidNttState);
        }
        if rank == 0 || op.degree() % rank != 0 {
            return Err(EvdError::InvalidRank(rank));
        }
        let stack = (op.degree() / rank) as usize;
        let m = op.modulus();
        let mut res = Polynomial::zero(op.degree(), m);
        let src = op.coeffs();
        let dst = res.coeffs_mut();
        for i in 0..rank {
            let idx = (exponent + i) & (2 * rank - 1);
            if idx < rank {
                for j in 0..stack {
                    dst[idx as usize * stack + j] = src[i as usize * stack + j];
                }
            } else {
                let wrapped = (idx - rank) as usize;
                for j in 0..stack {
                    let v = src[i as usize * stack + j];
                    dst[wrapped * stack + j] = if v == 0 { 0 } else { m - v };
                }
            }
        }
        Ok(res)
    }

    /// Automorphism σ_e: X ↦ X^e on the block view described in
    /// [`Self::shift`]. `e` must be odd; requires coefficient domain.
    pub fn aut(&self, op: &Polynomial, exponent: u64, rank: u64) -> Result<Polynomial> {
        if op.is_ntt() {
            return Err(EvdError::InvalidNttState);
        }
        if exponent % 2 == 0 {
            return Err(EvdError::EvenAutExponent(exponent));
        }
        if rank == 0 || op.degree() % rank != 0 {
            return Err(EvdError::InvalidRank(rank));
        }
        let stack = (op.degree() / rank) as usize;
        let m = op.modulus();
        let mut res = Polynomial::zero(op.degree(), m);
        let src = op.coeffs();
        let dst = res.coeffs_mut();
        for i in 0..rank {
            let mut idx = (i * exponent) & (2 * rank - 1);
            let positive = idx < rank;
            if !positive {
                idx -= rank;
            }
            for j in 0..stack {
                let v = src[i as usize * stack + j];
                dst[idx as usize * stack + j] = if positive {
                    v
                } else if v == 0 {
                    0
                } else {
                    m - v
                };
            }
        }
        Ok(res)
    }

    /// Centered mod-switch between the Q and P residue images.
    ///
    /// Each coefficient is re-centered around src/2 and reduced into
    /// [0, dst); the signed value is preserved. Requires coefficient
    /// domain; `dst_modulus` must be Q or P.
    pub fn norm_mod(&self, op: &Polynomial, dst_modulus: u64) -> Result<Polynomial> {
        if op.is_ntt() {
            return Err(EvdError::InvalidNttState);
        }
        let barr = match dst_modulus {
            MOD_Q => Q_BARR,
            MOD_P => P_BARR,
            _ => return Err(EvdError::ModulusMismatch),
        };
        let src = op.modulus();
        let half = src >> 1;
        let small_prime = half <= dst_modulus;
        let src_red = if small_prime {
            src
        } else {
            barrett_reduce(src, dst_modulus, barr)
        };
        let diff = dst_modulus - src_red;

        let coeffs = op
            .coeffs()
            .iter()
            .map(|&c| {
                let mut t = c;
                if t > half {
                    t += diff;
                }
                if !small_prime {
                    t = barrett_reduce(t, dst_modulus, barr);
                }
                t
            })
            .collect();
        Ok(Polynomial::from_raw(coeffs, dst_modulus, false))
    }

    /// Projects a degree-N polynomial onto degree `out_degree` by taking
    /// every (N/out_degree)-th coefficient, positions stack-1, 2·stack-1, …
    pub fn extract(&self, op: &Polynomial, out_degree: u64) -> Result<Polynomial> {
        if op.is_ntt() {
            return Err(EvdError::InvalidNttState);
        }
        if out_degree == 0 || op.degree() % out_degree != 0 {
            return Err(EvdError::InvalidRank(out_degree));
        }
        let stack = (op.degree() / out_degree) as usize;
        let coeffs = (0..out_degree as usize)
            .map(|i| op.coeffs()[(i + 1) * stack - 1])
            .collect();
        Ok(Polynomial::from_raw(coeffs, op.modulus(), false))
    }

    /// In-place forward NTT.
    pub fn ntt_inplace(&self, p: &mut Polynomial) -> Result<()> {
        if p.is_ntt() {
            return Err(EvdError::InvalidNttState);
        }
        let table = self.table(p.degree(), p.modulus())?;
        table.forward(p.coeffs_mut());
        p.set_is_ntt(true);
        Ok(())
    }

    /// In-place inverse NTT.
    pub fn intt_inplace(&self, p: &mut Polynomial) -> Result<()> {
        if !p.is_ntt() {
            return Err(EvdError::InvalidNttState);
        }
        let table = self.table(p.degree(), p.modulus())?;
        table.inverse(p.coeffs_mut());
        p.set_is_ntt(false);
        Ok(())
    }

    /// Forward NTT into a fresh polynomial.
    pub fn ntt(&self, op: &Polynomial) -> Result<Polynomial> {
        let mut res = op.clone();
        self.ntt_inplace(&mut res)?;
        Ok(res)
    }

    /// Inverse NTT into a fresh polynomial.
    pub fn intt(&self, op: &Polynomial) -> Result<Polynomial> {
        let mut res = op.clone();
        self.intt_inplace(&mut res)?;
        Ok(res)
    }

    // ---- RLWE ciphertext arithmetic --------------------------------------

    fn check_ct_pair(op1: &RlweCiphertext, op2: &RlweCiphertext) -> Result<()> {
        if op1.is_ntt() != op2.is_ntt() {
            return Err(EvdError::InvalidNttState);
        }
        if op1.is_extended() != op2.is_extended() {
            return Err(EvdError::InvalidExtendedState);
        }
        Ok(())
    }

    /// Componentwise ciphertext sum.
    pub fn add_ct(&self, op1: &RlweCiphertext, op2: &RlweCiphertext) -> Result<RlweCiphertext> {
        Self::check_ct_pair(op1, op2)?;
        Ok(RlweCiphertext {
            a: self.add(&op1.a, &op2.a)?,
            b: self.add(&op1.b, &op2.b)?,
            c: match (&op1.c, &op2.c) {
                (Some(c1), Some(c2)) => Some(self.add(c1, c2)?),
                _ => None,
            },
        })
    }

    /// Componentwise ciphertext difference.
    pub fn sub_ct(&self, op1: &RlweCiphertext, op2: &RlweCiphertext) -> Result<RlweCiphertext> {
        Self::check_ct_pair(op1, op2)?;
        Ok(RlweCiphertext {
            a: self.sub(&op1.a, &op2.a)?,
            b: self.sub(&op1.b, &op2.b)?,
            c: match (&op1.c, &op2.c) {
                (Some(c1), Some(c2)) => Some(self.sub(c1, c2)?),
                _ => None,
            },
        })
    }

    /// Ciphertext-ciphertext product; both rank-1 NTT inputs, extended
    /// output `(a1·a2, a1·b2 + b1·a2, b1·b2)`.
    pub fn mult_ct(&self, op1: &RlweCiphertext, op2: &RlweCiphertext) -> Result<RlweCiphertext> {
        if op1.is_extended() || op2.is_extended() {
            return Err(EvdError::InvalidExtendedState);
        }
        let a = self.mult(&op1.a, &op2.a)?;
        let c = self.mult(&op1.b, &op2.b)?;
        let mut b = self.mult(&op1.a, &op2.b)?;
        let cross = self.mult(&op1.b, &op2.a)?;
        self.add_assign(&mut b, &cross)?;
        Ok(RlweCiphertext { a, b, c: Some(c) })
    }

    /// Ciphertext × plaintext polynomial, componentwise.
    pub fn mult_ct_poly(&self, op: &RlweCiphertext, p: &Polynomial) -> Result<RlweCiphertext> {
        if op.is_extended() {
            return Err(EvdError::InvalidExtendedState);
        }
        Ok(RlweCiphertext {
            a: self.mult(&op.a, p)?,
            b: self.mult(&op.b, p)?,
            c: None,
        })
    }

    /// ct *= scalar, all components.
    pub fn scalar_mul_ct_assign(&self, ct: &mut RlweCiphertext, scalar: u64) {
        self.scalar_mul_assign(&mut ct.a, scalar);
        self.scalar_mul_assign(&mut ct.b, scalar);
        if let Some(c) = &mut ct.c {
            self.scalar_mul_assign(c, scalar);
        }
    }

    /// Monomial shift of a rank-1 ciphertext (componentwise).
    pub fn shift_ct(&self, op: &RlweCiphertext, exponent: u64) -> Result<RlweCiphertext> {
        if op.is_extended() {
            return Err(EvdError::InvalidExtendedState);
        }
        Ok(RlweCiphertext {
            a: self.shift(&op.a, exponent, op.a.degree())?,
            b: self.shift(&op.b, exponent, op.b.degree())?,
            c: None,
        })
    }

    /// Automorphism of a rank-1 ciphertext followed by a key switch
    /// that rebinds it to the original secret.
    pub fn aut_ct(
        &self,
        op: &RlweCiphertext,
        aut_key: &SwitchingKey,
        exponent: u64,
    ) -> Result<RlweCiphertext> {
        if op.is_extended() {
            return Err(EvdError::InvalidExtendedState);
        }
        let auted = RlweCiphertext {
            a: self.aut(&op.a, exponent, op.a.degree())?,
            b: self.aut(&op.b, exponent, op.b.degree())?,
            c: None,
        };
        self.key_switch(&auted, aut_key)
    }

    /// Relinearization: extended → rank-1 under the relin key.
    pub fn relin(&self, op: &RlweCiphertext, relin_key: &SwitchingKey) -> Result<RlweCiphertext> {
        if !op.is_extended() {
            return Err(EvdError::InvalidExtendedState);
        }
        self.key_switch(op, relin_key)
    }

    /// Key switch: rebinds a ciphertext whose `a` component multiplies a
    /// modified secret (s² for extended inputs, an automorphic image
    /// otherwise) back to the real secret. Output is rank-1, NTT form.
    pub fn key_switch(&self, op: &RlweCiphertext, key: &SwitchingKey) -> Result<RlweCiphertext> {
        // NTT and coefficient images of the a component.
        let (a_ntt, a_coeff) = if op.a.is_ntt() {
            let coeff = self.intt(&op.a)?;
            (op.a.clone(), coeff)
        } else {
            (self.ntt(&op.a)?, op.a.clone())
        };
        let a_up = self.ntt(&self.norm_mod(&a_coeff, MOD_P)?)?;

        let prod_aq = self.mult(&a_ntt, &key.a_q)?;
        let prod_bq = self.mult(&a_ntt, &key.b_q)?;
        let prod_ap = self.mult(&a_up, &key.a_p)?;
        let prod_bp = self.mult(&a_up, &key.b_p)?;

        // Bring the mod-P products down to Q and reconcile.
        let down_a = self.ntt(&self.norm_mod(&self.intt(&prod_ap)?, MOD_Q)?)?;
        let mut res_a = self.sub(&prod_aq, &down_a)?;

        let down_b = self.ntt(&self.norm_mod(&self.intt(&prod_bp)?, MOD_Q)?)?;
        let mut res_b = self.sub(&prod_bq, &down_b)?;

        let b_ntt = if op.b.is_ntt() {
            op.b.clone()
        } else {
            self.ntt(&op.b)?
        };

        if op.is_extended() {
            // (a·s² + b·s + c): the old b joins the new mask, the old c
            // joins the new body.
            self.scale_mad(&mut res_a, INVERSE_P_MOD_Q, &b_ntt)?;
            let c = op.c()?;
            let c_ntt = if c.is_ntt() { c.clone() } else { self.ntt(c)? };
            self.scale_mad(&mut res_b, INVERSE_P_MOD_Q, &c_ntt)?;
        } else {
            self.scalar_mul_assign(&mut res_a, INVERSE_P_MOD_Q);
            self.scale_mad(&mut res_b, INVERSE_P_MOD_Q, &b_ntt)?;
        }

        Ok(RlweCiphertext {
            a: res_a,
            b: res_b,
            c: None,
        })
    }

    /// Forward NTT of every component.
    pub fn ntt_ct_inplace(&self, ct: &mut RlweCiphertext) -> Result<()> {
        self.ntt_inplace(&mut ct.a)?;
        self.ntt_inplace(&mut ct.b)?;
        if let Some(c) = &mut ct.c {
            self.ntt_inplace(c)?;
        }
        Ok(())
    }

    /// Inverse NTT of every component.
    pub fn intt_ct_inplace(&self, ct: &mut RlweCiphertext) -> Result<()> {
        self.intt_inplace(&mut ct.a)?;
        self.intt_inplace(&mut ct.b)?;
        if let Some(c) = &mut ct.c {
            self.intt_inplace(c)?;
        }
        Ok(())
    }

    // ---- MLWE ciphertext arithmetic --------------------------------------

    /// Componentwise MLWE sum.
    pub fn add_mlwe(&self, op1: &MlweCiphertext, op2: &MlweCiphertext) -> Result<MlweCiphertext> {
        if op1.rank() != op2.rank() {
            return Err(EvdError::InvalidRank(op2.rank()));
        }
        let mut res = op1.clone();
        for i in 0..op1.stack() {
            self.add_assign(res.a_mut(i), op2.a(i))?;
        }
        self.add_assign(res.b_mut(), op2.b())?;
        Ok(res)
    }

    /// Componentwise MLWE difference.
    pub fn sub_mlwe(&self, op1: &MlweCiphertext, op2: &MlweCiphertext) -> Result<MlweCiphertext> {
        if op1.rank() != op2.rank() {
            return Err(EvdError::InvalidRank(op2.rank()));
        }
        let mut res = op1.clone();
        for i in 0..op1.stack() {
            self.sub_assign(res.a_mut(i), op2.a(i))?;
        }
        self.sub_assign(res.b_mut(), op2.b())?;
        Ok(res)
    }

    /// ct *= scalar on every component polynomial.
    pub fn scalar_mul_mlwe_assign(&self, ct: &mut MlweCiphertext, scalar: u64) {
        for i in 0..ct.stack() {
            self.scalar_mul_assign(ct.a_mut(i), scalar);
        }
        self.scalar_mul_assign(ct.b_mut(), scalar);
    }

    /// Componentwise monomial shift of an MLWE ciphertext.
    pub fn shift_mlwe(&self, op: &MlweCiphertext, exponent: u64) -> Result<MlweCiphertext> {
        let mut res = op.clone();
        for i in 0..op.stack() {
            *res.a_mut(i) = self.shift(op.a(i), exponent, op.rank())?;
        }
        *res.b_mut() = self.shift(op.b(), exponent, op.rank())?;
        Ok(res)
    }

    /// Componentwise automorphism of an MLWE ciphertext.
    pub fn aut_mlwe(&self, op: &MlweCiphertext, exponent: u64) -> Result<MlweCiphertext> {
        let mut res = op.clone();
        for i in 0..op.stack() {
            *res.a_mut(i) = self.aut(op.a(i), exponent, op.rank())?;
        }
        *res.b_mut() = self.aut(op.b(), exponent, op.rank())?;
        Ok(res)
    }

    // ---- mod-packing ------------------------------------------------------

    /// Precomputes the NTT mask images of an MLWE ciphertext for
    /// [`Self::aut_mod_pack`].
    pub fn mlwe_up_image(&self, op: &MlweCiphertext) -> Result<MlweUpImage> {
        let stack = op.stack();
        let mut a_q = Vec::with_capacity(stack as usize);
        let mut a_p = Vec::with_capacity(stack as usize);
        for i in 0..stack {
            a_q.push(self.ntt(op.a(i))?);
            a_p.push(self.ntt(&self.norm_mod(op.a(i), MOD_P)?)?);
        }
        Ok(MlweUpImage { a_q, a_p })
    }

    /// Lifts an MLWE ciphertext to a degree-N RLWE ciphertext through
    /// the inverse-auted mod-pack keys for one automorphism exponent.
    ///
    /// The body coefficients are laid out sparsely at stride `stack`,
    /// the mask blocks are key-switched slot by slot against the MLWE
    /// key row, and σ_exponent realigns the result before the final NTT.
    /// After decryption the packed slot values sit at positions
    /// `{i·stack, i·stack + 1, …}` for exponent `2i+1`.
    pub fn aut_mod_pack(
        &self,
        op: &MlweCiphertext,
        up: &MlweUpImage,
        key_row: &[MlweSwitchingKey],
        exponent: u64,
    ) -> Result<RlweCiphertext> {
        let rank = op.rank();
        let stack = op.stack();
        if key_row.len() != stack as usize {
            return Err(EvdError::InvalidRank(key_row.len() as u64));
        }

        let mut res = RlweCiphertext::zero();
        // Sparse body layout: slot j of the MLWE body at position j·stack.
        {
            let body = res.b.coeffs_mut();
            for j in 0..rank as usize {
                body[j * stack as usize] = op.b().coeffs()[j];
            }
        }

        // Per stack coordinate k, accumulate the four key products over
        // every mask slot j, then reconcile P down to Q.
        let mut cols_a: Vec<Polynomial> = Vec::with_capacity(stack as usize);
        let mut cols_b: Vec<Polynomial> = Vec::with_capacity(stack as usize);
        for k in 0..stack as usize {
            let mut acc_aq = self.mult(&up.a_q[0], &key_row[0].a_q[k])?;
            let mut acc_bq = self.mult(&up.a_q[0], &key_row[0].b_q[k])?;
            let mut acc_ap = self.mult(&up.a_p[0], &key_row[0].a_p[k])?;
            let mut acc_bp = self.mult(&up.a_p[0], &key_row[0].b_p[k])?;
            for j in 1..stack as usize {
                let t = self.mult(&up.a_q[j], &key_row[j].a_q[k])?;
                self.add_assign(&mut acc_aq, &t)?;
                let t = self.mult(&up.a_q[j], &key_row[j].b_q[k])?;
                self.add_assign(&mut acc_bq, &t)?;
                let t = self.mult(&up.a_p[j], &key_row[j].a_p[k])?;
                self.add_assign(&mut acc_ap, &t)?;
                let t = self.mult(&up.a_p[j], &key_row[j].b_p[k])?;
                self.add_assign(&mut acc_bp, &t)?;
            }

            let down = self.norm_mod(&self.intt(&acc_ap)?, MOD_Q)?;
            let mut col_a = self.intt(&acc_aq)?;
            self.sub_assign(&mut col_a, &down)?;
            self.scalar_mul_assign(&mut col_a, INVERSE_P_MOD_Q);

            let down = self.norm_mod(&self.intt(&acc_bp)?, MOD_Q)?;
            let mut col_b = self.intt(&acc_bq)?;
            self.sub_assign(&mut col_b, &down)?;
            self.scalar_mul_assign(&mut col_b, INVERSE_P_MOD_Q);

            cols_a.push(col_a);
            cols_b.push(col_b);
        }

        // Gather the rank-degree columns back into degree-N layout.
        {
            let a = res.a.coeffs_mut();
            for j in 0..rank as usize {
                for k in 0..stack as usize {
                    a[j * stack as usize + k] = cols_a[k].coeffs()[j];
                }
            }
            let b = res.b.coeffs_mut();
            for j in 0..rank as usize {
                for k in 0..stack as usize {
                    let pos = j * stack as usize + k;
                    b[pos] = add_mod(b[pos], cols_b[k].coeffs()[j], MOD_Q);
                }
            }
        }

        let mut out = RlweCiphertext {
            a: self.aut(&res.a, exponent, DEGREE)?,
            b: self.aut(&res.b, exponent, DEGREE)?,
            c: None,
        };
        self.ntt_ct_inplace(&mut out)?;
        Ok(out)
    }

    /// Packs `stack` MLWE ciphertexts into one degree-N RLWE ciphertext
    /// using one switching key per stack coordinate.
    pub fn mod_pack(
        &self,
        ops: &[MlweCiphertext],
        mod_pack_keys: &[SwitchingKey],
    ) -> Result<RlweCiphertext> {
        let rank = self.rank;
        let stack = (DEGREE / rank) as usize;
        if ops.len() != stack || mod_pack_keys.len() != stack {
            return Err(EvdError::InvalidRank(ops.len() as u64));
        }

        let mut res = RlweCiphertext::zero();
        {
            let body = res.b.coeffs_mut();
            for i in 0..rank as usize {
                for j in 0..stack {
                    body[i * stack + j] = ops[j].b().coeffs()[i];
                }
            }
        }

        let mut acc_aq = Polynomial::from_raw(vec![0; DEGREE as usize], MOD_Q, true);
        let mut acc_ap = Polynomial::from_raw(vec![0; DEGREE as usize], MOD_P, true);
        let mut acc_bq = Polynomial::from_raw(vec![0; DEGREE as usize], MOD_Q, true);
        let mut acc_bp = Polynomial::from_raw(vec![0; DEGREE as usize], MOD_P, true);

        for i in 0..stack {
            // Strided degree-N view of the i-th mask slot across ops.
            let mut strided = Polynomial::zero(DEGREE, MOD_Q);
            {
                let dst = strided.coeffs_mut();
                for j in 0..rank as usize {
                    for k in 0..stack {
                        dst[j * stack + k] = ops[k].a(i as u64).coeffs()[j];
                    }
                }
            }
            let strided_p = self.ntt(&self.norm_mod(&strided, MOD_P)?)?;
            let strided_q = self.ntt(&strided)?;

            let t = self.mult(&strided_q, &mod_pack_keys[i].a_q)?;
            self.add_assign(&mut acc_aq, &t)?;
            let t = self.mult(&strided_q, &mod_pack_keys[i].b_q)?;
            self.add_assign(&mut acc_bq, &t)?;
            let t = self.mult(&strided_p, &mod_pack_keys[i].a_p)?;
            self.add_assign(&mut acc_ap, &t)?;
            let t = self.mult(&strided_p, &mod_pack_keys[i].b_p)?;
            self.add_assign(&mut acc_bp, &t)?;
        }

        let down = self.ntt(&self.norm_mod(&self.intt(&acc_ap)?, MOD_Q)?)?;
        let mut a = self.sub(&acc_aq, &down)?;
        self.scalar_mul_assign(&mut a, INVERSE_P_MOD_Q);
        res.a = a;

        let down = self.ntt(&self.norm_mod(&self.intt(&acc_bp)?, MOD_Q)?)?;
        let diff = self.sub(&acc_bq, &down)?;
        self.ntt_inplace(&mut res.b)?;
        self.mad_assign(&mut res.b, &diff, INVERSE_P_MOD_Q)?;

        Ok(res)
    }
}

// Batched multiply-sums live in eval::mult_sum and are inherent methods
// on HEval.

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::rng;

    fn eval() -> HEval {
        HEval::new(3).unwrap()
    }

    #[test]
    fn add_rejects_domain_mismatch() {
        let e = eval();
        let a = Polynomial::zero(8, MOD_Q);
        let mut b = Polynomial::zero(8, MOD_Q);
        b.set_is_ntt(true);
        assert!(matches!(e.add(&a, &b), Err(EvdError::InvalidNttState)));
    }

    #[test]
    fn add_rejects_modulus_mismatch() {
        let e = eval();
        let a = Polynomial::zero(8, MOD_Q);
        let b = Polynomial::zero(8, MOD_P);
        assert!(matches!(e.add(&a, &b), Err(EvdError::ModulusMismatch)));
    }

    #[test]
    fn mult_requires_ntt() {
        let e = eval();
        let a = Polynomial::zero(8, MOD_Q);
        assert!(matches!(e.mult(&a, &a), Err(EvdError::InvalidNttState)));
    }

    #[test]
    fn shift_wraps_negacyclically() {
        let e = eval();
        // p = X^7 in the degree-8 ring; X * p = X^8 = -1.
        let mut coeffs = vec![0u64; 8];
        coeffs[7] = 5;
        let p = Polynomial::from_raw(coeffs, MOD_Q, false);
        let shifted = e.shift(&p, 1, 8).unwrap();
        assert_eq!(shifted.coeffs()[0], MOD_Q - 5);
        assert!(shifted.coeffs()[1..].iter().all(|&c| c == 0));
    }

    #[test]
    fn shift_by_2n_is_identity() {
        let e = eval();
        let p = rng::uniform_poly(8, MOD_Q).unwrap();
        let s = e.shift(&p, 16, 8).unwrap();
        assert_eq!(s.coeffs(), p.coeffs());
    }

    #[test]
    fn aut_composition_is_exponent_product() {
        let e = eval();
        let p = rng::uniform_poly(64, MOD_Q).unwrap();
        let e1 = 3u64;
        let e2 = 5u64;
        let lhs = e.aut(&e.aut(&p, e1, 64).unwrap(), e2, 64).unwrap();
        let rhs = e.aut(&p, (e1 * e2) % 128, 64).unwrap();
        assert_eq!(lhs.coeffs(), rhs.coeffs());
    }

    #[test]
    fn aut_rejects_even_exponent() {
        let e = eval();
        let p = Polynomial::zero(8, MOD_Q);
        assert!(matches!(
            e.aut(&p, 2, 8),
            Err(EvdError::EvenAutExponent(2))
        ));
    }

    #[test]
    fn aut_inverse_restores_input() {
        let e = eval();
        let p = rng::uniform_poly(DEGREE, MOD_Q).unwrap();
        let exp = 2 * 5 + 1;
        let inv = e.inv_exponent(exp, DEGREE).unwrap();
        let back = e.aut(&e.aut(&p, exp, DEGREE).unwrap(), inv, DEGREE).unwrap();
        assert_eq!(back.coeffs(), p.coeffs());
    }

    #[test]
    fn norm_mod_preserves_signed_value() {
        let e = eval();
        let mut coeffs = vec![0u64; 8];
        coeffs[0] = 5;
        coeffs[1] = MOD_Q - 7; // -7
        let p = Polynomial::from_raw(coeffs, MOD_Q, false);

        let up = e.norm_mod(&p, MOD_P).unwrap();
        assert_eq!(up.coeffs()[0], 5);
        assert_eq!(up.coeffs()[1], MOD_P - 7);

        let back = e.norm_mod(&up, MOD_Q).unwrap();
        assert_eq!(back.coeffs()[0], 5);
        assert_eq!(back.coeffs()[1], MOD_Q - 7);
    }

    #[test]
    fn extract_takes_stride_slots() {
        let e = eval();
        let mut coeffs = vec![0u64; 32];
        for (i, c) in coeffs.iter_mut().enumerate() {
            *c = i as u64;
        }
        let p = Polynomial::from_raw(coeffs, MOD_Q, false);
        let x = e.extract(&p, 8).unwrap();
        // stack = 4: positions 3, 7, 11, ...
        assert_eq!(x.coeffs(), &[3, 7, 11, 15, 19, 23, 27, 31]);
    }

    #[test]
    fn ntt_mult_matches_schoolbook_negacyclic() {
        let e = eval();
        // (1 + X)² = 1 + 2X + X² in the rank-8 ring.
        let mut coeffs = vec![0u64; 8];
        coeffs[0] = 1;
        coeffs[1] = 1;
        let p = Polynomial::from_raw(coeffs, MOD_Q, false);
        let p_ntt = e.ntt(&p).unwrap();
        let sq = e.intt(&e.mult(&p_ntt, &p_ntt).unwrap()).unwrap();
        assert_eq!(&sq.coeffs()[..3], &[1, 2, 1]);
        assert!(sq.coeffs()[3..].iter().all(|&c| c == 0));
    }

    #[test]
    fn mad_is_multiply_accumulate() {
        let e = eval();
        let op1 = Polynomial::from_raw(vec![1, 2, 3, 0, 0, 0, 0, 0], MOD_Q, false);
        let op3 = Polynomial::from_raw(vec![10, 10, 10, 10, 0, 0, 0, 0], MOD_Q, false);
        let res = e.mad(&op1, 5, &op3).unwrap();
        assert_eq!(&res.coeffs()[..4], &[15, 20, 25, 10]);
    }

    #[test]
    fn mult_ct_shape() {
        let e = eval();
        let mut ct = RlweCiphertext::zero();
        ct.set_is_ntt(true);
        let prod = e.mult_ct(&ct, &ct).unwrap();
        assert!(prod.is_extended());
        assert!(prod.is_ntt());
    }
}
