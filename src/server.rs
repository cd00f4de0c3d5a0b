//! Server-side similarity pipeline: query caching, key-block caching,
//! and batched inner products.
//!
//! A query arrives as one MLWE ciphertext and is expanded once into R
//! degree-N RLWE ciphertexts (the query cache). Database keys arrive as
//! MLWE ciphertexts and are batched N at a time: an inverse butterfly
//! interleaves them, per-slot automorphisms realign them, and mod-pack
//! compresses each block into R RLWE ciphertexts (the key cache). One
//! batched multiply-sum of the two caches then yields N similarity
//! scores in a single ciphertext.

use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use tracing::debug;

use crate::cipher::{MlweCiphertext, RlweCiphertext};
use crate::error::{EvdError, Result};
use crate::eval::HEval;
use crate::keys::CollectionKeys;
use crate::math::Polynomial;
use crate::params::{DEGREE, MOD_Q};

/// Expanded encrypted query: R RLWE ciphertexts in bit-reversed slot
/// order, one per decomposed slot.
pub struct CachedQuery {
    pub ctxts: Vec<RlweCiphertext>,
}

/// Plaintext analogue of [`CachedQuery`] for non-private queries.
pub struct CachedPlaintextQuery {
    pub polys: Vec<Polynomial>,
}

/// One cached database block: R RLWE ciphertexts representing up to N
/// key vectors.
pub struct CachedKeys {
    pub ctxts: Vec<RlweCiphertext>,
}

/// Similarity server for one collection.
pub struct Server {
    rank: u64,
    stack: u64,
    log_rank: u64,
    eval: HEval,
    keys: Arc<CollectionKeys>,
}

impl Server {
    /// Builds the server context at the collection's rank over its
    /// uploaded key material.
    pub fn new(log_rank: u64, keys: Arc<CollectionKeys>) -> Result<Self> {
        let eval = HEval::new(log_rank)?;
        let rank = eval.rank();
        Ok(Self {
            rank,
            stack: DEGREE / rank,
            log_rank,
            eval,
            keys,
        })
    }

    /// Packing rank of this collection.
    pub fn rank(&self) -> u64 {
        self.rank
    }

    /// Expands an encrypted MLWE query into the R-slot query cache.
    ///
    /// The NTT mask images are lifted once; each slot i is produced by
    /// the mod-pack lift through the inverse-auted key row i followed
    /// by σ_{2i+1}, and stored at the bit-reversed position.
    pub fn cache_query(&self, query: &MlweCiphertext) -> Result<CachedQuery> {
        if query.rank() != self.rank {
            return Err(EvdError::InvalidRank(query.rank()));
        }
        let start = Instant::now();
        let up = self.eval.mlwe_up_image(query)?;

        let lifted: Vec<RlweCiphertext> = (0..self.rank)
            .into_par_iter()
            .map(|i| {
                self.eval.aut_mod_pack(
                    query,
                    &up,
                    &self.keys.auted_mod_pack_mlwe.keys[i as usize],
                    2 * i + 1,
                )
            })
            .collect::<Result<_>>()?;

        let mut ctxts = vec![RlweCiphertext::zero(); self.rank as usize];
        for (i, ct) in lifted.into_iter().enumerate() {
            ctxts[self.eval.bit_rev(i as u64, self.rank) as usize] = ct;
        }

        debug!(elapsed_ms = start.elapsed().as_millis() as u64, "cached query");
        Ok(CachedQuery { ctxts })
    }

    /// Expands a plaintext query polynomial: sparse layout at stride
    /// `stack`, σ_{2i+1} per slot, NTT, bit-reversed slot order.
    pub fn cache_query_plain(&self, query: &Polynomial) -> Result<CachedPlaintextQuery> {
        if query.degree() != self.rank {
            return Err(EvdError::InvalidRank(query.degree()));
        }
        let start = Instant::now();

        let expanded: Vec<Polynomial> = (0..self.rank)
            .into_par_iter()
            .map(|i| {
                let mut sparse = Polynomial::zero(DEGREE, MOD_Q);
                for j in 0..self.rank as usize {
                    sparse.coeffs_mut()[j * self.stack as usize] = query.coeffs()[j];
                }
                let mut t = self.eval.aut(&sparse, 2 * i + 1, DEGREE)?;
                self.eval.ntt_inplace(&mut t)?;
                Ok(t)
            })
            .collect::<Result<_>>()?;

        let mut polys = vec![Polynomial::zero(DEGREE, MOD_Q); self.rank as usize];
        for (i, p) in expanded.into_iter().enumerate() {
            polys[self.eval.bit_rev(i as u64, self.rank) as usize] = p;
        }

        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "cached plaintext query"
        );
        Ok(CachedPlaintextQuery { polys })
    }

    /// Batches N MLWE key ciphertexts into one key-block cache.
    ///
    /// The caller zero-pads partial blocks to exactly N ciphertexts.
    /// Keys are consumed in bit-reversed stack-strided order by a
    /// pairwise inverse butterfly (`out0 = a + X^f·b`, `out1 = a − X^f·b`),
    /// then each of the `rank` interleaved groups is realigned by
    /// σ_{2i+1} and mod-packed into one RLWE ciphertext.
    pub fn cache_keys(&self, keys: &[MlweCiphertext]) -> Result<CachedKeys> {
        if keys.len() as u64 != DEGREE {
            return Err(EvdError::InvalidRank(keys.len() as u64));
        }
        let start = Instant::now();

        let block = self.rank;
        let stack = self.stack;

        let mut temp: Vec<Vec<MlweCiphertext>> = (0..block)
            .map(|_| {
                (0..stack)
                    .map(|_| MlweCiphertext::zero(self.rank))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<_>>()?;

        for iter in 0..stack {
            for i in 0..self.log_rank {
                let half = 1u64 << i;
                let size = half << 1;
                let start_pairs = block / size;
                let step = self.rank >> i;
                for j in 0..start_pairs {
                    for k in 0..half {
                        let factor = start_pairs + step * k;
                        let index = (size * j + k) as usize;
                        let hi = index + half as usize;
                        if i == 0 {
                            let lo_key =
                                &keys[(self.eval.bit_rev(index as u64, block) * stack + iter)
                                    as usize];
                            let hi_key = &keys
                                [(self.eval.bit_rev(hi as u64, block) * stack + iter) as usize];
                            let twiddle = self.eval.shift_mlwe(hi_key, factor)?;
                            temp[hi][iter as usize] = self.eval.sub_mlwe(lo_key, &twiddle)?;
                            temp[index][iter as usize] = self.eval.add_mlwe(lo_key, &twiddle)?;
                        } else {
                            let twiddle =
                                self.eval.shift_mlwe(&temp[hi][iter as usize], factor)?;
                            temp[hi][iter as usize] =
                                self.eval.sub_mlwe(&temp[index][iter as usize], &twiddle)?;
                            temp[index][iter as usize] =
                                self.eval.add_mlwe(&temp[index][iter as usize], &twiddle)?;
                        }
                    }
                }
            }
        }

        // Per interleaved group: realign by the slot automorphism and
        // mod-pack the stack into a single degree-N ciphertext.
        let step = 2;
        let packed: Vec<RlweCiphertext> = (0..block)
            .into_par_iter()
            .map(|i| {
                let exponent = step * i + 1;
                let src = (self.eval.inv_exponent(exponent, self.rank)? / step) as usize;
                let auted: Vec<MlweCiphertext> = (0..stack)
                    .map(|j| self.eval.aut_mlwe(&temp[src][j as usize], exponent))
                    .collect::<Result<_>>()?;
                self.eval
                    .mod_pack(&auted, &self.keys.auted_mod_pack.keys[i as usize])
            })
            .collect::<Result<_>>()?;

        let mut ctxts = vec![RlweCiphertext::zero(); block as usize];
        for (i, ct) in packed.into_iter().enumerate() {
            ctxts[self.eval.bit_rev(i as u64, block) as usize] = ct;
        }

        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "cached key block"
        );
        Ok(CachedKeys { ctxts })
    }

    /// Inner product of an encrypted query cache against one key-block
    /// cache: batched multiply-sum, rescale by R, relinearize.
    pub fn inner_product(
        &self,
        cached_query: &CachedQuery,
        cached_keys: &CachedKeys,
    ) -> Result<RlweCiphertext> {
        let start = Instant::now();
        let mut temp = self.eval.mult_sum(&cached_query.ctxts, &cached_keys.ctxts)?;
        self.eval.scalar_mul_ct_assign(&mut temp, self.rank);
        let res = self.eval.relin(&temp, &self.keys.relin)?;
        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "inner product"
        );
        Ok(res)
    }

    /// Plaintext-query inner product; rank-1 result, no relinearization.
    pub fn inner_product_plain(
        &self,
        cached_query: &CachedPlaintextQuery,
        cached_keys: &CachedKeys,
    ) -> Result<RlweCiphertext> {
        let start = Instant::now();
        let mut res = self
            .eval
            .mult_sum_plain(&cached_keys.ctxts, &cached_query.polys)?;
        self.eval.scalar_mul_ct_assign(&mut res, self.rank);
        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "plaintext inner product"
        );
        Ok(res)
    }
}
