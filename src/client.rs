//! Client-side cryptography: key generation, encoding, encryption,
//! decryption, score handling, and the PIR payload codec.
//!
//! The client is stateless apart from its `HEval` tables; every secret
//! is passed in explicitly so one client can serve many collections at
//! the same rank.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rayon::prelude::*;

use crate::cipher::{MlweCiphertext, RlweCiphertext};
use crate::error::{EvdError, Result};
use crate::eval::HEval;
use crate::keys::{AutedModPackKeys, AutedModPackMlweKeys, InvAutKeys, SecretKey, SwitchingKey};
use crate::math::mod_arith::pow_mod;
use crate::math::{rng, Polynomial};
use crate::params::{DEGREE, HAMMING_WEIGHT, MOD_P, MOD_Q, PIR_PAYLOAD_SIZE, P_MOD_Q};

/// Decoded message: a sequence of fixed-point values.
pub type Message = Vec<f64>;

/// Client context at one packing rank.
pub struct Client {
    eval: HEval,
    /// rank^{-1} mod Q; baked into queries and keys so the inner
    /// product's factor of rank cancels.
    inv_rank: u64,
}

impl Client {
    /// Creates a client for `rank = 2^log_rank`.
    pub fn new(log_rank: u64) -> Result<Self> {
        let eval = HEval::new(log_rank)?;
        let inv_rank = pow_mod(eval.rank(), MOD_Q - 2, MOD_Q);
        Ok(Self { eval, inv_rank })
    }

    /// The evaluation context.
    pub fn eval(&self) -> &HEval {
        &self.eval
    }

    /// Packing rank.
    pub fn rank(&self) -> u64 {
        self.eval.rank()
    }

    // ---- key generation ---------------------------------------------------

    /// Samples a ternary secret of weight `HAMMING_WEIGHT`: Fisher-Yates
    /// picks the support, each position gets a uniform sign, and both
    /// ring images are transformed to NTT form.
    pub fn gen_sec_key(&self) -> Result<SecretKey> {
        let mut indices: Vec<u64> = (0..DEGREE).collect();
        for i in (1..DEGREE as usize).rev() {
            let j = rng::random_u32()? as usize % (i + 1);
            indices.swap(i, j);
        }

        let mut sk = SecretKey::empty();
        for &idx in indices.iter().take(HAMMING_WEIGHT as usize) {
            let sign = rng::random_u8()? & 1 == 1;
            sk.poly_q.coeffs_mut()[idx as usize] = if sign { 1 } else { MOD_Q - 1 };
            sk.poly_p.coeffs_mut()[idx as usize] = if sign { 1 } else { MOD_P - 1 };
        }
        self.eval.ntt_inplace(&mut sk.poly_q)?;
        self.eval.ntt_inplace(&mut sk.poly_p)?;
        Ok(sk)
    }

    /// Switching key from `modified_key` (NTT mod Q) to the secret:
    /// `b_Q = -a_Q·s + e + P·modified_key`, `b_P = -a_P·s + e`.
    fn gen_swt_key(&self, sec: &SecretKey, modified_key: &Polynomial) -> Result<SwitchingKey> {
        let a_q = self.eval.ntt(&rng::uniform_poly(DEGREE, MOD_Q)?)?;
        let a_p = self.eval.ntt(&rng::uniform_poly(DEGREE, MOD_P)?)?;

        let (e_q, e_p) = rng::gaussian_pair(DEGREE, MOD_Q, MOD_P)?;
        let mut b_q = self.eval.ntt(&e_q)?;
        let mut b_p = self.eval.ntt(&e_p)?;

        let a_s = self.eval.mult(&a_q, &sec.poly_q)?;
        self.eval.sub_assign(&mut b_q, &a_s)?;
        let a_s = self.eval.mult(&a_p, &sec.poly_p)?;
        self.eval.sub_assign(&mut b_p, &a_s)?;

        self.eval.mad_assign(&mut b_q, modified_key, P_MOD_Q)?;

        Ok(SwitchingKey { a_q, a_p, b_q, b_p })
    }

    /// Relinearization key: switching key with source s².
    pub fn gen_relin_key(&self, sec: &SecretKey) -> Result<SwitchingKey> {
        let s_squared = self.eval.mult(&sec.poly_q, &sec.poly_q)?;
        self.gen_swt_key(sec, &s_squared)
    }

    /// One switching key per automorphism exponent `step·i + 1`
    /// (`step = 2N/rank`), from σ_{e^{-1}}(s) back to s. Drives the PIR
    /// decomposition at `rank = PIR_RANK`.
    pub fn gen_inv_aut_keys(&self, sec: &SecretKey, rank: u64) -> Result<InvAutKeys> {
        if rank == 0 || !rank.is_power_of_two() || rank > DEGREE {
            return Err(EvdError::InvalidRank(rank));
        }
        let step = 2 * DEGREE / rank;

        let s_q = self.eval.intt(&sec.poly_q)?;
        let s_p = self.eval.intt(&sec.poly_p)?;

        let mut res = InvAutKeys::empty(rank)?;
        for i in 0..rank {
            let inv = self.eval.inv_exponent(step * i + 1, DEGREE)?;
            let inv_aut = SecretKey {
                poly_q: self.eval.ntt(&self.eval.aut(&s_q, inv, DEGREE)?)?,
                poly_p: self.eval.ntt(&self.eval.aut(&s_p, inv, DEGREE)?)?,
            };
            res.keys[i as usize] = self.gen_swt_key(&inv_aut, &sec.poly_q)?;
        }
        Ok(res)
    }

    /// Plain mod-pack switching keys, one per stack coordinate.
    ///
    /// Building block kept alongside the auted variants; the serving
    /// pipelines consume only the auted keys.
    pub fn gen_mod_pack_keys(&self, sec: &SecretKey) -> Result<Vec<SwitchingKey>> {
        let rank = self.rank();
        let stack = DEGREE / rank;

        let s_coeff = self.eval.intt(&sec.poly_q)?;
        let mut res = Vec::with_capacity(stack as usize);
        for j in 0..stack {
            let mut modified = Polynomial::zero(DEGREE, MOD_Q);
            for k in 0..rank {
                modified.coeffs_mut()[(stack * k) as usize] =
                    s_coeff.coeffs()[((k + 1) * stack - 1 - j) as usize];
            }
            self.eval.ntt_inplace(&mut modified)?;
            res.push(self.gen_swt_key(sec, &modified)?);
        }
        Ok(res)
    }

    /// Mod-pack keys twisted by σ_{2i+1}: entry [i][j] switches from the
    /// strided slot-j selection of the σ_{2i+1}-auted secret back to s.
    pub fn gen_auted_mod_pack_keys(&self, sec: &SecretKey) -> Result<AutedModPackKeys> {
        let rank = self.rank();
        let stack = DEGREE / rank;

        let s_coeff = self.eval.intt(&sec.poly_q)?;
        let mut res = AutedModPackKeys::empty(rank)?;
        for i in 0..rank {
            let auted = self.eval.aut(&s_coeff, 2 * i + 1, rank)?;
            for j in 0..stack {
                let mut modified = Polynomial::zero(DEGREE, MOD_Q);
                for k in 0..rank {
                    modified.coeffs_mut()[(stack * k) as usize] =
                        auted.coeffs()[((k + 1) * stack - 1 - j) as usize];
                }
                self.eval.ntt_inplace(&mut modified)?;
                res.keys[i as usize][j as usize] = self.gen_swt_key(sec, &modified)?;
            }
        }
        Ok(res)
    }

    /// MLWE-shaped mod-pack keys for the query cache: the switching key
    /// targets σ_{(2i+1)^{-1}}(s), and its four polynomials are re-laid
    /// as `stack` degree-rank slices (coefficient l·stack + k goes to
    /// slice k, position l) and NTT-transformed per slice.
    pub fn gen_inv_auted_mod_pack_keys(&self, sec: &SecretKey) -> Result<AutedModPackMlweKeys> {
        let rank = self.rank();
        let stack = DEGREE / rank;

        let s_coeff_q = self.eval.intt(&sec.poly_q)?;
        let s_coeff_p = self.eval.intt(&sec.poly_p)?;

        let mut res = AutedModPackMlweKeys::empty(rank)?;
        for i in 0..rank {
            let exponent = 2 * i + 1;
            let inv = self.eval.inv_exponent(exponent, DEGREE)?;
            let auted = SecretKey {
                poly_q: self.eval.ntt(&self.eval.aut(&s_coeff_q, inv, DEGREE)?)?,
                poly_p: self.eval.ntt(&self.eval.aut(&s_coeff_p, inv, DEGREE)?)?,
            };

            for j in 0..stack {
                let mut modified = Polynomial::zero(DEGREE, MOD_Q);
                for k in 0..rank {
                    modified.coeffs_mut()[(stack * k) as usize] =
                        s_coeff_q.coeffs()[((k + 1) * stack - 1 - j) as usize];
                }
                self.eval.ntt_inplace(&mut modified)?;
                let swt = self.gen_swt_key(&auted, &modified)?;

                let out = &mut res.keys[i as usize][j as usize];
                self.reshape_into_slices(&swt.a_q, &mut out.a_q)?;
                self.reshape_into_slices(&swt.a_p, &mut out.a_p)?;
                self.reshape_into_slices(&swt.b_q, &mut out.b_q)?;
                self.reshape_into_slices(&swt.b_p, &mut out.b_p)?;
            }
        }
        Ok(res)
    }

    /// Splits one degree-N NTT polynomial into `stack` NTT slices of
    /// degree rank (transpose from l·stack + k to slice k position l).
    fn reshape_into_slices(&self, flat: &Polynomial, slices: &mut [Polynomial]) -> Result<()> {
        let rank = self.rank();
        let stack = (DEGREE / rank) as usize;
        let coeff = self.eval.intt(flat)?;
        for (k, slice) in slices.iter_mut().enumerate().take(stack) {
            let mut fresh = Polynomial::zero(rank, flat.modulus());
            for l in 0..rank as usize {
                fresh.coeffs_mut()[l] = coeff.coeffs()[l * stack + k];
            }
            self.eval.ntt_inplace(&mut fresh)?;
            *slice = fresh;
        }
        Ok(())
    }

    // ---- encoding ---------------------------------------------------------

    /// Fixed-point encoding into the extract slots: message i lands at
    /// coefficient (i+1)·(out_degree/len) − 1 as round(|m|·scale) with
    /// the sign folded into the residue.
    pub fn encode(&self, msg: &[f64], out_degree: u64, scale: f64) -> Result<Polynomial> {
        if msg.is_empty() || out_degree % msg.len() as u64 != 0 {
            return Err(EvdError::InvalidRank(msg.len() as u64));
        }
        let stack = (out_degree / msg.len() as u64) as usize;
        let mut res = Polynomial::zero(out_degree, MOD_Q);
        for (i, &m) in msg.iter().enumerate() {
            let value = ((m.abs() * scale).round() as u64) % MOD_Q;
            let residue = if m < 0.0 && value != 0 {
                MOD_Q - value
            } else {
                value
            };
            res.coeffs_mut()[(i + 1) * stack - 1] = residue;
        }
        Ok(res)
    }

    /// Center-lifts every coefficient and divides by the scale.
    pub fn decode(&self, ptxt: &Polynomial, scale: f64) -> Message {
        ptxt.coeffs()
            .iter()
            .map(|&c| {
                let centered = if c < MOD_Q / 2 {
                    c as f64
                } else {
                    -((MOD_Q - c) as f64)
                };
                centered / scale
            })
            .collect()
    }

    // ---- encryption / decryption ------------------------------------------

    /// Fresh RLWE encryption of a degree-N plaintext (coefficient form):
    /// uniform NTT mask a, body b = ptxt − a·s + e. Output is in
    /// coefficient domain.
    pub fn encrypt_rlwe(&self, ptxt: &Polynomial, sec: &SecretKey) -> Result<RlweCiphertext> {
        let mut a = rng::uniform_poly(DEGREE, MOD_Q)?;
        // Uniform residues are uniform in either domain; treat as NTT.
        a.set_is_ntt(true);
        let a_s = self.eval.mult(&a, &sec.poly_q)?;
        self.eval.intt_inplace(&mut a)?;
        let a_s = self.eval.intt(&a_s)?;
        let mut b = self.eval.sub(ptxt, &a_s)?;
        let e = rng::gaussian_poly(DEGREE, MOD_Q)?;
        self.eval.add_assign(&mut b, &e)?;
        Ok(RlweCiphertext { a, b, c: None })
    }

    /// RLWE encryption of an encoded message.
    pub fn encrypt_rlwe_msg(
        &self,
        msg: &[f64],
        sec: &SecretKey,
        scale: f64,
    ) -> Result<RlweCiphertext> {
        let ptxt = self.encode(msg, DEGREE, scale)?;
        self.encrypt_rlwe(&ptxt, sec)
    }

    /// MLWE encryption: encrypt as RLWE, then project — B keeps the
    /// extract slots, mask slot i collects coefficients j·stack + i.
    pub fn encrypt_mlwe(&self, ptxt: &Polynomial, sec: &SecretKey) -> Result<MlweCiphertext> {
        let rank = self.rank();
        let stack = DEGREE / rank;
        let t = self.encrypt_rlwe(ptxt, sec)?;

        let mut res = MlweCiphertext::zero(rank)?;
        *res.b_mut() = self.eval.extract(&t.b, rank)?;
        for i in 0..stack {
            let mut slot = Polynomial::zero(rank, MOD_Q);
            for j in 0..rank {
                slot.coeffs_mut()[j as usize] = t.a.coeffs()[(j * stack + i) as usize];
            }
            *res.a_mut(i) = slot;
        }
        Ok(res)
    }

    /// MLWE encryption of an encoded message.
    pub fn encrypt_mlwe_msg(
        &self,
        msg: &[f64],
        sec: &SecretKey,
        scale: f64,
    ) -> Result<MlweCiphertext> {
        let ptxt = self.encode(msg, DEGREE, scale)?;
        self.encrypt_mlwe(&ptxt, sec)
    }

    /// Decrypts a rank-1 or extended RLWE ciphertext and decodes at the
    /// given scale.
    pub fn decrypt(&self, ct: &RlweCiphertext, sec: &SecretKey, scale: f64) -> Result<Message> {
        let is_ntt = ct.is_ntt();
        let mut t = if is_ntt {
            self.eval.mult(&ct.a, &sec.poly_q)?
        } else {
            let prod = self.eval.mult(&self.eval.ntt(&ct.a)?, &sec.poly_q)?;
            self.eval.intt(&prod)?
        };
        self.eval.add_assign(&mut t, &ct.b)?;

        if ct.is_extended() {
            if !is_ntt {
                self.eval.ntt_inplace(&mut t)?;
            }
            t = self.eval.mult(&t, &sec.poly_q)?;
            if !is_ntt {
                self.eval.intt_inplace(&mut t)?;
            }
            self.eval.add_assign(&mut t, ct.c()?)?;
        }
        if is_ntt {
            self.eval.intt_inplace(&mut t)?;
        }
        Ok(self.decode(&t, scale))
    }

    // ---- query / key pipelines --------------------------------------------

    /// Query encryption: encode, pre-twist by σ_{2R−1}, encrypt as
    /// MLWE, scale by R^{-1} so the inner product's factor of R cancels.
    pub fn encrypt_query(
        &self,
        msg: &[f64],
        sec: &SecretKey,
        scale: f64,
    ) -> Result<MlweCiphertext> {
        let rank = self.rank();
        let ptxt = self.encode(msg, DEGREE, scale)?;
        let twisted = self.eval.aut(&ptxt, 2 * rank - 1, rank)?;
        let mut ct = self.encrypt_mlwe(&twisted, sec)?;
        self.eval.scalar_mul_mlwe_assign(&mut ct, self.inv_rank);
        Ok(ct)
    }

    /// Plaintext analogue of [`Self::encrypt_query`] for non-private
    /// queries: a single degree-R polynomial.
    pub fn encode_query(&self, msg: &[f64], scale: f64) -> Result<Polynomial> {
        let rank = self.rank();
        let encoded = self.encode(msg, rank, scale)?;
        let mut res = self.eval.aut(&encoded, 2 * rank - 1, rank)?;
        self.eval.scalar_mul_assign(&mut res, self.inv_rank);
        Ok(res)
    }

    /// Database-key encryption: encode, encrypt as MLWE, scale by R^{-1}.
    pub fn encrypt_key(&self, msg: &[f64], sec: &SecretKey, scale: f64) -> Result<MlweCiphertext> {
        let ptxt = self.encode(msg, DEGREE, scale)?;
        let mut ct = self.encrypt_mlwe(&ptxt, sec)?;
        self.eval.scalar_mul_mlwe_assign(&mut ct, self.inv_rank);
        Ok(ct)
    }

    /// Plaintext analogue of [`Self::encrypt_key`].
    pub fn encode_key(&self, msg: &[f64], scale: f64) -> Result<Polynomial> {
        let rank = self.rank();
        let mut res = self.encode(msg, rank, scale)?;
        self.eval.scalar_mul_assign(&mut res, self.inv_rank);
        Ok(res)
    }

    /// Parallel decryption of a batch of score ciphertexts.
    pub fn decrypt_score(
        &self,
        scores: &[RlweCiphertext],
        sec: &SecretKey,
        scale: f64,
    ) -> Result<Vec<Message>> {
        scores
            .par_iter()
            .map(|ct| self.decrypt(ct, sec, scale))
            .collect()
    }

    /// Indices of the k largest scores across all blocks, descending;
    /// ties go to the lower index.
    pub fn top_k_score(&self, msgs: &[Message], k: usize) -> Vec<u64> {
        top_k_entries(
            msgs.iter()
                .enumerate()
                .flat_map(|(i, m)| {
                    m.iter()
                        .enumerate()
                        .map(move |(j, &s)| (s, (i as u64) * DEGREE + j as u64))
                }),
            k,
        )
        .into_iter()
        .map(|(_, idx)| idx)
        .collect()
    }

    // ---- PIR --------------------------------------------------------------

    /// Encrypts a one-hot selector at `idx` with value `scale`, scaled
    /// by the PIR rank inverse.
    pub fn encrypt_pir(&self, idx: u64, sec: &SecretKey, scale: f64) -> Result<RlweCiphertext> {
        if idx >= DEGREE {
            return Err(EvdError::IndexOutOfRange {
                index: idx,
                db_size: DEGREE,
            });
        }
        let mut ptxt = Polynomial::zero(DEGREE, MOD_Q);
        ptxt.coeffs_mut()[idx as usize] = scale.round() as u64;
        self.eval.scalar_mul_assign(&mut ptxt, self.inv_rank);
        self.encrypt_rlwe(&ptxt, sec)
    }

    /// Encodes an opaque payload into an NTT polynomial at 2 bits per
    /// coefficient, values mapped to signed {0, 1, −1, −2}. Payloads
    /// shorter than `PIR_PAYLOAD_SIZE` are zero-padded.
    pub fn encode_pir_payload(&self, payload: &[u8]) -> Result<Polynomial> {
        if payload.len() > PIR_PAYLOAD_SIZE {
            return Err(EvdError::PayloadTooLarge(payload.len()));
        }
        let mut res = Polynomial::zero(DEGREE, MOD_Q);
        let coeffs = res.coeffs_mut();
        for (byte_idx, &byte) in payload.iter().enumerate() {
            for bit_pair in 0..4 {
                let two_bits = (byte >> (bit_pair * 2)) & 3;
                coeffs[byte_idx * 4 + bit_pair] = if two_bits > 1 {
                    MOD_Q - two_bits as u64 + 1
                } else {
                    two_bits as u64
                };
            }
        }
        self.eval.ntt_inplace(&mut res)?;
        Ok(res)
    }

    /// Inverse of [`Self::encode_pir_payload`] on a decrypted message.
    /// A rounded value outside {0, 1, −1, −2} is an integrity failure.
    pub fn decode_pir_payload(&self, dmsg: &Message) -> Result<Vec<u8>> {
        if dmsg.len() < PIR_PAYLOAD_SIZE * 4 {
            return Err(EvdError::Protocol("decoded PIR message too short"));
        }
        let mut payload = vec![0u8; PIR_PAYLOAD_SIZE];
        for (byte_idx, byte) in payload.iter_mut().enumerate() {
            let mut acc = 0u8;
            for bit_pair in 0..4 {
                let rounded = dmsg[byte_idx * 4 + bit_pair].round() as i64;
                let two_bits: u8 = match rounded {
                    0 => 0,
                    1 => 1,
                    -1 => 2,
                    -2 => 3,
                    other => return Err(EvdError::PayloadDecode(other)),
                };
                acc |= two_bits << (bit_pair * 2);
            }
            *byte = acc;
        }
        Ok(payload)
    }
}

/// Min-heap entry ordered by score, with the lower index winning ties.
#[derive(PartialEq)]
struct Entry {
    score: f64,
    index: u64,
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.index.cmp(&self.index))
    }
}

/// Selects the k largest (score, index) pairs, descending by score with
/// ties broken toward the lower index.
pub fn top_k_entries(entries: impl Iterator<Item = (f64, u64)>, k: usize) -> Vec<(f64, u64)> {
    if k == 0 {
        return Vec::new();
    }
    let mut heap: BinaryHeap<std::cmp::Reverse<Entry>> = BinaryHeap::with_capacity(k + 1);
    for (score, index) in entries {
        let entry = Entry { score, index };
        if heap.len() < k {
            heap.push(std::cmp::Reverse(entry));
        } else if let Some(std::cmp::Reverse(worst)) = heap.peek() {
            if entry > *worst {
                heap.pop();
                heap.push(std::cmp::Reverse(entry));
            }
        }
    }
    let mut out: Vec<(f64, u64)> = heap
        .into_sorted_vec()
        .into_iter()
        .map(|std::cmp::Reverse(e)| (e.score, e.index))
        .collect();
    out.truncate(k);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::LOG_SCALE;

    fn client() -> Client {
        Client::new(2).unwrap()
    }

    #[test]
    fn encode_decode_roundtrip_within_scale() {
        let c = client();
        let scale = (2.0f64).powf(LOG_SCALE);
        let msg = [0.5, -0.25, 0.0, 1.0];
        let encoded = c.encode(&msg, DEGREE, scale).unwrap();

        // Extract slots carry the values; everything else is zero.
        let extracted = c.eval().extract(&encoded, 4).unwrap();
        let decoded = c.decode(&extracted, scale);
        for (got, want) in decoded.iter().zip(msg.iter()) {
            assert!((got - want).abs() <= 1.0 / scale, "{got} vs {want}");
        }
    }

    #[test]
    fn encode_zero_stays_in_range() {
        let c = client();
        let encoded = c.encode(&[0.0, -0.0, 0.0, 0.0], DEGREE, 1024.0).unwrap();
        assert!(encoded.coeffs().iter().all(|&v| v < MOD_Q));
        assert!(encoded.is_zero());
    }

    #[test]
    fn encrypt_decrypt_rlwe_roundtrip() {
        let c = client();
        let sec = c.gen_sec_key().unwrap();
        let scale = (2.0f64).powf(20.0);
        let msg = [0.75, -0.5, 0.125, 1.0];

        let ct = c.encrypt_rlwe_msg(&msg, &sec, scale).unwrap();
        let decoded = c.decrypt(&ct, &sec, scale).unwrap();

        let stack = (DEGREE / 4) as usize;
        for (i, want) in msg.iter().enumerate() {
            let got = decoded[(i + 1) * stack - 1];
            assert!((got - want).abs() < 1e-3, "{got} vs {want}");
        }
    }

    #[test]
    fn secret_key_has_declared_weight() {
        let c = client();
        let sec = c.gen_sec_key().unwrap();
        let coeff = c.eval().intt(&sec.poly_q).unwrap();
        let weight = coeff
            .coeffs()
            .iter()
            .filter(|&&v| v == 1 || v == MOD_Q - 1)
            .count();
        let zeros = coeff.coeffs().iter().filter(|&&v| v == 0).count();
        assert_eq!(weight, HAMMING_WEIGHT as usize);
        assert_eq!(zeros, (DEGREE - HAMMING_WEIGHT) as usize);
    }

    #[test]
    fn switching_key_satisfies_contract() {
        // b_Q + a_Q·s − P·src must be small (one Gaussian error).
        let c = client();
        let sec = c.gen_sec_key().unwrap();
        let relin = c.gen_relin_key(&sec).unwrap();
        let s_squared = c.eval().mult(&sec.poly_q, &sec.poly_q).unwrap();

        let mut lhs = c.eval().mult(&relin.a_q, &sec.poly_q).unwrap();
        c.eval().add_assign(&mut lhs, &relin.b_q).unwrap();
        let scaled_src = c.eval().scalar_mul(&s_squared, P_MOD_Q);
        c.eval().sub_assign(&mut lhs, &scaled_src).unwrap();

        let err = c.eval().intt(&lhs).unwrap();
        for &v in err.coeffs() {
            let centered = if v > MOD_Q / 2 {
                v as i64 - MOD_Q as i64
            } else {
                v as i64
            };
            assert!(centered.abs() < 64, "error coefficient too large: {centered}");
        }
    }

    #[test]
    fn aut_then_key_switch_preserves_message() {
        let c = client();
        let sec = c.gen_sec_key().unwrap();
        let scale = (2.0f64).powf(20.0);
        let msg = [0.5, -0.75, 0.25, 1.0];
        let ptxt = c.encode(&msg, DEGREE, scale).unwrap();
        let ct = c.encrypt_rlwe(&ptxt, &sec).unwrap();

        // Key switching from the auted secret image back to s.
        let exponent = 5u64;
        let s_coeff = c.eval().intt(&sec.poly_q).unwrap();
        let auted_s = c.eval().aut(&s_coeff, exponent, DEGREE).unwrap();
        let modified = c.eval().ntt(&auted_s).unwrap();
        let key = c.gen_swt_key(&sec, &modified).unwrap();

        let res = c.eval().aut_ct(&ct, &key, exponent).unwrap();
        let decoded = c.decrypt(&res, &sec, scale).unwrap();

        let expected = c.decode(&c.eval().aut(&ptxt, exponent, DEGREE).unwrap(), scale);
        for (got, want) in decoded.iter().zip(&expected) {
            assert!((got - want).abs() < 1e-2, "{got} vs {want}");
        }
    }

    #[test]
    fn mod_pack_keys_satisfy_contract() {
        let c = client();
        let sec = c.gen_sec_key().unwrap();
        let keys = c.gen_mod_pack_keys(&sec).unwrap();
        let stack = DEGREE / c.rank();
        assert_eq!(keys.len(), stack as usize);

        // Slot j's key encrypts the strided selection of the secret.
        let j = 1u64;
        let s_coeff = c.eval().intt(&sec.poly_q).unwrap();
        let mut modified = crate::math::Polynomial::zero(DEGREE, MOD_Q);
        for k in 0..c.rank() {
            modified.coeffs_mut()[(stack * k) as usize] =
                s_coeff.coeffs()[((k + 1) * stack - 1 - j) as usize];
        }
        let modified = c.eval().ntt(&modified).unwrap();

        let key = &keys[j as usize];
        let mut lhs = c.eval().mult(&key.a_q, &sec.poly_q).unwrap();
        c.eval().add_assign(&mut lhs, &key.b_q).unwrap();
        let scaled = c.eval().scalar_mul(&modified, P_MOD_Q);
        c.eval().sub_assign(&mut lhs, &scaled).unwrap();

        let err = c.eval().intt(&lhs).unwrap();
        for &v in err.coeffs() {
            let centered = if v > MOD_Q / 2 {
                v as i64 - MOD_Q as i64
            } else {
                v as i64
            };
            assert!(centered.abs() < 64, "error coefficient too large: {centered}");
        }
    }

    #[test]
    fn pir_payload_codec_roundtrip() {
        let c = Client::new(crate::params::PIR_LOG_RANK).unwrap();
        let mut payload = vec![0u8; PIR_PAYLOAD_SIZE];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = (i * 37 % 256) as u8;
        }
        let encoded = c.encode_pir_payload(&payload).unwrap();

        // Decode from the exact (noise-free) coefficient values.
        let coeffs = c.eval().intt(&encoded).unwrap();
        let dmsg = c.decode(&coeffs, 1.0);
        let decoded = c.decode_pir_payload(&dmsg).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn pir_payload_rejects_anomalous_value() {
        let c = Client::new(crate::params::PIR_LOG_RANK).unwrap();
        let mut dmsg = vec![0.0f64; DEGREE as usize];
        dmsg[5] = 3.0; // outside {0, 1, -1, -2}
        assert!(matches!(
            c.decode_pir_payload(&dmsg),
            Err(EvdError::PayloadDecode(3))
        ));
    }

    #[test]
    fn pir_payload_shorter_is_padded() {
        let c = Client::new(crate::params::PIR_LOG_RANK).unwrap();
        let encoded = c.encode_pir_payload(b"abc").unwrap();
        let coeffs = c.eval().intt(&encoded).unwrap();
        let dmsg = c.decode(&coeffs, 1.0);
        let decoded = c.decode_pir_payload(&dmsg).unwrap();
        assert_eq!(&decoded[..3], b"abc");
        assert!(decoded[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn top_k_orders_descending_with_tie_on_lower_index() {
        let c = client();
        let msgs = vec![vec![0.1, 0.9, 0.9, 0.5, -1.0]];
        let top = c.top_k_score(&msgs, 3);
        assert_eq!(top, vec![1, 2, 3]);
    }

    #[test]
    fn top_k_zero_is_empty() {
        let c = client();
        assert!(c.top_k_score(&[vec![1.0]], 0).is_empty());
    }

    #[test]
    fn encode_key_scales_by_inverse_rank() {
        let c = client();
        let p = c.encode_key(&[1.0, 0.0, 0.0, 0.0], 4.0).unwrap();
        // slot 0 holds round(1.0·4)·R^{-1}; multiplying back by R gives 4.
        let restored = c.eval().scalar_mul(&p, c.rank());
        assert_eq!(restored.coeffs()[0], 4);
    }
}
