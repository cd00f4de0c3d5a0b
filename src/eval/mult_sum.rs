//! NTT-domain batched multiply-accumulate.
//!
//! The degree-N coefficient range is split into `MULT_SUM_TILES`
//! contiguous tiles; each rayon task owns one output tile across every
//! product term, so no synchronization is needed between tasks and no
//! nested parallel region is ever created.

use rayon::prelude::*;

use crate::cipher::RlweCiphertext;
use crate::error::{EvdError, Result};
use crate::math::mod_arith::{add_mod, mul_mod};
use crate::math::Polynomial;
use crate::params::{DEGREE, MOD_Q};

use super::HEval;

/// Number of output tiles per batched multiply-sum; N must divide evenly.
pub const MULT_SUM_TILES: usize = 64;

fn check_batch(op1: &[RlweCiphertext], op2_len: usize) -> Result<usize> {
    if op1.is_empty() || op2_len == 0 || op1.len() % op2_len != 0 {
        return Err(EvdError::InvalidRank(op1.len() as u64));
    }
    if !op1[0].is_ntt() {
        return Err(EvdError::InvalidNttState);
    }
    if op1[0].is_extended() {
        return Err(EvdError::InvalidExtendedState);
    }
    Ok(op1.len() / op2_len)
}

impl HEval {
    /// Extended-output batched product: res = Σ_j op1[j·gap] · op2[j]
    /// componentwise in NTT form, with `gap = op1.len() / op2.len()`.
    pub fn mult_sum(
        &self,
        op1: &[RlweCiphertext],
        op2: &[RlweCiphertext],
    ) -> Result<RlweCiphertext> {
        let gap = check_batch(op1, op2.len())?;
        if !op2[0].is_ntt() {
            return Err(EvdError::InvalidNttState);
        }

        let mut res = RlweCiphertext::zero_extended();
        res.set_is_ntt(true);
        let tile = DEGREE as usize / MULT_SUM_TILES;

        let RlweCiphertext { a, b, c } = &mut res;
        let Some(c) = c.as_mut() else {
            return Err(EvdError::InvalidExtendedState);
        };

        a.coeffs_mut()
            .par_chunks_mut(tile)
            .zip(b.coeffs_mut().par_chunks_mut(tile))
            .zip(c.coeffs_mut().par_chunks_mut(tile))
            .enumerate()
            .for_each(|(t, ((ra, rb), rc))| {
                let off = t * tile;
                for j in 0..op2.len() {
                    let x = &op1[j * gap];
                    let y = &op2[j];
                    let xa = &x.a.coeffs()[off..off + tile];
                    let xb = &x.b.coeffs()[off..off + tile];
                    let ya = &y.a.coeffs()[off..off + tile];
                    let yb = &y.b.coeffs()[off..off + tile];
                    for i in 0..tile {
                        ra[i] = add_mod(ra[i], mul_mod(xa[i], ya[i], MOD_Q), MOD_Q);
                        let cross = add_mod(
                            mul_mod(xa[i], yb[i], MOD_Q),
                            mul_mod(xb[i], ya[i], MOD_Q),
                            MOD_Q,
                        );
                        rb[i] = add_mod(rb[i], cross, MOD_Q);
                        rc[i] = add_mod(rc[i], mul_mod(xb[i], yb[i], MOD_Q), MOD_Q);
                    }
                }
            });

        Ok(res)
    }

    /// Rank-1 batched product against plaintext polynomials:
    /// res = Σ_j op1[j·gap] · op2[j].
    pub fn mult_sum_plain(
        &self,
        op1: &[RlweCiphertext],
        op2: &[Polynomial],
    ) -> Result<RlweCiphertext> {
        let gap = check_batch(op1, op2.len())?;
        if !op2[0].is_ntt() {
            return Err(EvdError::InvalidNttState);
        }

        let mut res = RlweCiphertext::zero();
        res.set_is_ntt(true);
        let tile = DEGREE as usize / MULT_SUM_TILES;

        let RlweCiphertext { a, b, .. } = &mut res;
        a.coeffs_mut()
            .par_chunks_mut(tile)
            .zip(b.coeffs_mut().par_chunks_mut(tile))
            .enumerate()
            .for_each(|(t, (ra, rb))| {
                let off = t * tile;
                for j in 0..op2.len() {
                    let x = &op1[j * gap];
                    let p = &op2[j].coeffs()[off..off + tile];
                    let xa = &x.a.coeffs()[off..off + tile];
                    let xb = &x.b.coeffs()[off..off + tile];
                    for i in 0..tile {
                        ra[i] = add_mod(ra[i], mul_mod(xa[i], p[i], MOD_Q), MOD_Q);
                        rb[i] = add_mod(rb[i], mul_mod(xb[i], p[i], MOD_Q), MOD_Q);
                    }
                }
            });

        Ok(res)
    }

    /// Extended-output batched product with the first operand indexed in
    /// bit-reversed order: res = Σ_j op1[bitrev(j, rank)] · op2[j].
    /// Both operand slices have length `rank`.
    pub fn bit_rev_mult_sum(
        &self,
        op1: &[RlweCiphertext],
        op2: &[RlweCiphertext],
    ) -> Result<RlweCiphertext> {
        let rank = self.rank();
        if op1.len() as u64 != rank || op2.len() as u64 != rank {
            return Err(EvdError::InvalidRank(op1.len() as u64));
        }
        check_batch(op1, op2.len())?;
        if !op2[0].is_ntt() {
            return Err(EvdError::InvalidNttState);
        }

        let mut res = RlweCiphertext::zero_extended();
        res.set_is_ntt(true);
        let tile = DEGREE as usize / MULT_SUM_TILES;

        let RlweCiphertext { a, b, c } = &mut res;
        let Some(c) = c.as_mut() else {
            return Err(EvdError::InvalidExtendedState);
        };

        a.coeffs_mut()
            .par_chunks_mut(tile)
            .zip(b.coeffs_mut().par_chunks_mut(tile))
            .zip(c.coeffs_mut().par_chunks_mut(tile))
            .enumerate()
            .for_each(|(t, ((ra, rb), rc))| {
                let off = t * tile;
                for j in 0..rank {
                    let x = &op1[self.bit_rev(j, rank) as usize];
                    let y = &op2[j as usize];
                    let xa = &x.a.coeffs()[off..off + tile];
                    let xb = &x.b.coeffs()[off..off + tile];
                    let ya = &y.a.coeffs()[off..off + tile];
                    let yb = &y.b.coeffs()[off..off + tile];
                    for i in 0..tile {
                        ra[i] = add_mod(ra[i], mul_mod(xa[i], ya[i], MOD_Q), MOD_Q);
                        let cross = add_mod(
                            mul_mod(xa[i], yb[i], MOD_Q),
                            mul_mod(xb[i], ya[i], MOD_Q),
                            MOD_Q,
                        );
                        rb[i] = add_mod(rb[i], cross, MOD_Q);
                        rc[i] = add_mod(rc[i], mul_mod(xb[i], yb[i], MOD_Q), MOD_Q);
                    }
                }
            });

        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ntt_ct(a_val: u64, b_val: u64) -> RlweCiphertext {
        let mut ct = RlweCiphertext::zero();
        ct.a.coeffs_mut().fill(a_val);
        ct.b.coeffs_mut().fill(b_val);
        ct.set_is_ntt(true);
        ct
    }

    #[test]
    fn mult_sum_accumulates_all_terms() {
        let eval = HEval::new(1).unwrap();
        let op1 = vec![ntt_ct(2, 3), ntt_ct(5, 7)];
        let op2 = vec![ntt_ct(1, 1), ntt_ct(1, 1)];

        let res = eval.mult_sum(&op1, &op2).unwrap();
        assert!(res.is_extended());
        assert!(res.is_ntt());
        // A = 2·1 + 5·1, B = (2+3) + (5+7), C = 3·1 + 7·1 pointwise.
        assert!(res.a.coeffs().iter().all(|&v| v == 7));
        assert!(res.b.coeffs().iter().all(|&v| v == 17));
        assert!(res.c().unwrap().coeffs().iter().all(|&v| v == 10));
    }

    #[test]
    fn mult_sum_applies_gap_stride() {
        let eval = HEval::new(1).unwrap();
        // gap = 2: only op1[0] and op1[2] participate.
        let op1 = vec![
            ntt_ct(1, 0),
            ntt_ct(100, 0),
            ntt_ct(10, 0),
            ntt_ct(100, 0),
        ];
        let op2 = vec![ntt_ct(1, 0), ntt_ct(1, 0)];
        let res = eval.mult_sum(&op1, &op2).unwrap();
        assert!(res.a.coeffs().iter().all(|&v| v == 11));
    }

    #[test]
    fn mult_sum_requires_ntt_inputs() {
        let eval = HEval::new(1).unwrap();
        let op = vec![RlweCiphertext::zero()];
        assert!(matches!(
            eval.mult_sum(&op, &op),
            Err(EvdError::InvalidNttState)
        ));
    }

    #[test]
    fn bit_rev_indexing_reorders_first_operand() {
        let eval = HEval::new(2).unwrap();
        // rank 4: bitrev order is [0, 2, 1, 3].
        let op1: Vec<_> = [1u64, 2, 3, 4]
            .iter()
            .map(|&v| ntt_ct(v, 0))
            .collect();
        // Single one-hot op2 at j = 1 picks op1[bitrev(1)] = op1[2].
        let mut op2 = vec![ntt_ct(0, 0); 4];
        op2[1] = ntt_ct(1, 0);

        let res = eval.bit_rev_mult_sum(&op1, &op2).unwrap();
        assert!(res.a.coeffs().iter().all(|&v| v == 3));
    }
}
