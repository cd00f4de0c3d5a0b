//! Two-dimensional private information retrieval over the encoded
//! payload grid.
//!
//! A payload at global index `row·PIR_RANK + col` is selected by two
//! encrypted one-hot polynomials. Each query is decomposed into
//! `PIR_RANK` ciphertexts through the per-slot inverse-automorphism
//! keys, interleaved by an inverse butterfly, and combined with the
//! grid: the first dimension accumulates row sums against the database
//! polynomials, the second collapses them with a bit-reversed batched
//! multiply-sum, and relinearization yields the single response
//! ciphertext.

use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use tracing::debug;

use crate::cipher::RlweCiphertext;
use crate::error::{EvdError, Result};
use crate::eval::HEval;
use crate::keys::CollectionKeys;
use crate::math::Polynomial;
use crate::params::{DEGREE, INVERSE_P_MOD_Q, MOD_P, MOD_Q, PIR_LOG_RANK};

/// PIR engine for one collection; always runs at `PIR_RANK`.
pub struct PirServer {
    log_rank: u64,
    rank: u64,
    eval: HEval,
    keys: Arc<CollectionKeys>,
}

impl PirServer {
    /// Builds the PIR context over the collection's key material.
    pub fn new(keys: Arc<CollectionKeys>) -> Result<Self> {
        let eval = HEval::new(PIR_LOG_RANK)?;
        let rank = eval.rank();
        Ok(Self {
            log_rank: PIR_LOG_RANK,
            rank,
            eval,
            keys,
        })
    }

    /// Answers a two-dimensional PIR query against the sparse payload
    /// grid. `db` holds the first `db_size` encoded payloads in row
    /// order (grid cell `i + rank·j`); absent cells are all-zero
    /// payloads and contribute nothing.
    pub fn pir(
        &self,
        query_first_dim: &RlweCiphertext,
        query_second_dim: &RlweCiphertext,
        db: &[Polynomial],
    ) -> Result<RlweCiphertext> {
        let start = Instant::now();
        let rank = self.rank;

        let mut decomposed = self.decompose(query_first_dim)?;
        self.inv_butterfly(&mut decomposed)?;

        let zero_ntt = {
            let mut ct = RlweCiphertext::zero();
            ct.set_is_ntt(true);
            ct
        };

        let first_dim: Vec<RlweCiphertext> = (0..rank)
            .into_par_iter()
            .map(|i| {
                let mut acc: Option<RlweCiphertext> = None;
                for j in 0..rank {
                    let Some(db_poly) = db.get((i + rank * j) as usize) else {
                        // Rows past the database tail are all zero.
                        break;
                    };
                    let rev = self.eval.bit_rev(j, rank) as usize;
                    let term = self.eval.mult_ct_poly(&decomposed[rev], db_poly)?;
                    acc = Some(match acc {
                        Some(a) => self.eval.add_ct(&a, &term)?,
                        None => term,
                    });
                }
                Ok(acc.unwrap_or_else(|| zero_ntt.clone()))
            })
            .collect::<Result<_>>()?;

        let mut decomposed = self.decompose(query_second_dim)?;
        self.inv_butterfly(&mut decomposed)?;

        let temp = self.eval.bit_rev_mult_sum(&decomposed, &first_dim)?;
        let res = self.eval.relin(&temp, &self.keys.relin)?;

        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "answered PIR query"
        );
        Ok(res)
    }

    /// Splits a one-hot query ciphertext into `rank` slot ciphertexts:
    /// each slot runs the key-switch pipeline against its inverse-aut
    /// key and is realigned by σ_{step·i+1}. Output is in coefficient
    /// domain, ready for the butterfly.
    pub fn decompose(&self, op: &RlweCiphertext) -> Result<Vec<RlweCiphertext>> {
        if op.is_ntt() {
            return Err(EvdError::InvalidNttState);
        }
        if op.is_extended() {
            return Err(EvdError::InvalidExtendedState);
        }
        let step = 2 * DEGREE / self.rank;

        let a_ntt_q = self.eval.ntt(&op.a)?;
        let a_ntt_p = self.eval.ntt(&self.eval.norm_mod(&op.a, MOD_P)?)?;

        (0..self.rank)
            .into_par_iter()
            .map(|i| {
                let key = &self.keys.pir_inv_aut.keys[i as usize];
                let exponent = step * i + 1;

                let prod_aq = self.eval.mult(&a_ntt_q, &key.a_q)?;
                let prod_bq = self.eval.mult(&a_ntt_q, &key.b_q)?;
                let prod_ap = self.eval.mult(&a_ntt_p, &key.a_p)?;
                let prod_bp = self.eval.mult(&a_ntt_p, &key.b_p)?;

                let down = self.eval.norm_mod(&self.eval.intt(&prod_ap)?, MOD_Q)?;
                let mut a = self.eval.intt(&prod_aq)?;
                self.eval.sub_assign(&mut a, &down)?;
                self.eval.scalar_mul_assign(&mut a, INVERSE_P_MOD_Q);
                let a = self.eval.aut(&a, exponent, DEGREE)?;

                let down = self.eval.norm_mod(&self.eval.intt(&prod_bp)?, MOD_Q)?;
                let mut b = self.eval.intt(&prod_bq)?;
                self.eval.sub_assign(&mut b, &down)?;
                self.eval.scale_mad(&mut b, INVERSE_P_MOD_Q, &op.b)?;
                let b = self.eval.aut(&b, exponent, DEGREE)?;

                Ok(RlweCiphertext { a, b, c: None })
            })
            .collect()
    }

    /// In-place inverse butterfly over the decomposed slots, stages
    /// log(rank)−1 down to 0: `tmp = lo − hi; lo += hi;
    /// hi = X^{2N−factor}·tmp` with `factor = rank/size + (N/half)·k`.
    /// Every slot is NTT-transformed afterwards.
    pub fn inv_butterfly(&self, op: &mut [RlweCiphertext]) -> Result<()> {
        if op.len() as u64 != self.rank {
            return Err(EvdError::InvalidRank(op.len() as u64));
        }
        for i in (0..self.log_rank).rev() {
            let half = (1u64 << i) as usize;
            let size = 2 * half;
            let start = self.rank as usize / size;
            let step = (DEGREE >> i) as usize;

            op.par_chunks_mut(size).try_for_each(|chunk| {
                let (lo, hi) = chunk.split_at_mut(half);
                for k in 0..half {
                    let factor = (start + step * k) as u64;
                    let tmp = self.eval.sub_ct(&lo[k], &hi[k])?;
                    lo[k] = self.eval.add_ct(&lo[k], &hi[k])?;
                    hi[k] = self.eval.shift_ct(&tmp, 2 * DEGREE - factor)?;
                }
                Ok::<(), EvdError>(())
            })?;
        }

        op.par_iter_mut().try_for_each(|ct| {
            self.eval.ntt_inplace(&mut ct.a)?;
            self.eval.ntt_inplace(&mut ct.b)?;
            Ok::<(), EvdError>(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn butterfly_rejects_wrong_slot_count() {
        let keys = Arc::new(CollectionKeys {
            relin: crate::keys::SwitchingKey::empty(),
            auted_mod_pack: crate::keys::AutedModPackKeys::empty(2).unwrap(),
            auted_mod_pack_mlwe: crate::keys::AutedModPackMlweKeys::empty(2).unwrap(),
            pir_inv_aut: crate::keys::InvAutKeys::empty(2).unwrap(),
        });
        let pir = PirServer::new(keys).unwrap();
        let mut slots = vec![RlweCiphertext::zero(); 3];
        assert!(pir.inv_butterfly(&mut slots).is_err());
    }

    #[test]
    fn decompose_rejects_ntt_input() {
        let keys = Arc::new(CollectionKeys {
            relin: crate::keys::SwitchingKey::empty(),
            auted_mod_pack: crate::keys::AutedModPackKeys::empty(2).unwrap(),
            auted_mod_pack_mlwe: crate::keys::AutedModPackMlweKeys::empty(2).unwrap(),
            pir_inv_aut: crate::keys::InvAutKeys::empty(2).unwrap(),
        });
        let pir = PirServer::new(keys).unwrap();
        let mut ct = RlweCiphertext::zero();
        ct.set_is_ntt(true);
        assert!(pir.decompose(&ct).is_err());
    }
}
