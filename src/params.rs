//! Fixed cryptographic parameters for the EVD scheme.
//!
//! The scheme operates over the negacyclic ring Z_q[X]/(X^N + 1) with
//! N = 4096 and a single large ciphertext modulus `MOD_Q`, plus an
//! auxiliary "special" prime `MOD_P` used by the key-switching pipeline.
//! Both primes satisfy q ≡ 1 (mod 2N) so the degree-4096 negacyclic NTT
//! exists for each of them.
//!
//! Vectors of dimension d are packed into the degree-R subring where
//! R is the smallest power of two ≥ d; `stack = N / R` degree-R
//! polynomials tile one degree-N polynomial.

use serde::{Deserialize, Serialize};

use crate::error::EvdError;

/// log2 of the ring degree.
pub const LOG_DEGREE: u64 = 12;
/// Ring degree N.
pub const DEGREE: u64 = 1 << LOG_DEGREE;

/// Ciphertext modulus Q (54-bit prime, Q ≡ 1 mod 2N).
pub const MOD_Q: u64 = 18_014_398_491_918_337;
/// Special prime P (55-bit, P ≡ 1 mod 2N) for key switching.
pub const MOD_P: u64 = 36_028_797_005_856_769;
/// P^{-1} mod Q.
pub const INVERSE_P_MOD_Q: u64 = 995_681_451_208_133;
/// P mod Q.
pub const P_MOD_Q: u64 = MOD_P % MOD_Q;

/// Barrett constant floor(2^64 / Q).
pub const Q_BARR: u64 = ((1u128 << 64) / MOD_Q as u128) as u64;
/// Barrett constant floor(2^64 / P).
pub const P_BARR: u64 = ((1u128 << 64) / MOD_P as u128) as u64;

/// Hamming weight of the ternary secret key.
pub const HAMMING_WEIGHT: u64 = 2730;
/// Standard deviation of the discrete Gaussian error.
pub const GAUSSIAN_ERROR_STDEV: f64 = 3.2;

/// Default log2 encoding scale.
pub const LOG_SCALE: f64 = 26.25;

/// log2 of the PIR selection rank.
pub const PIR_LOG_RANK: u64 = 10;
/// PIR selection rank; the payload grid is PIR_RANK × PIR_RANK.
pub const PIR_RANK: u64 = 1 << PIR_LOG_RANK;
/// Bits of payload stored per polynomial coefficient.
pub const PIR_PER_COEFF_BITS: u64 = 2;
/// Opaque payload size in bytes (N coefficients at 2 bits each).
pub const PIR_PAYLOAD_SIZE: usize = (DEGREE >> PIR_PER_COEFF_BITS) as usize;

/// log2 scale of the first-dimension PIR one-hot encryption.
pub const PIR_FIRST_LOG_SCALE: f64 = 25.25;
/// log2 scale of the second-dimension PIR one-hot encryption.
pub const PIR_SECOND_LOG_SCALE: f64 = 25.25;

/// AES-256 key size in bytes.
pub const AES_KEY_SIZE: usize = 32;
/// Seed size for deterministic polynomial expansion.
pub const SEED_SIZE: usize = 32;

/// Similarity metric of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MetricType {
    /// Inner product.
    Ip = 0,
    /// Squared Euclidean distance. Reserved: no scale table yet.
    L2 = 1,
    /// Cosine similarity (caller normalizes the vectors).
    Cosine = 2,
}

impl MetricType {
    /// Decodes the wire byte.
    pub fn from_u8(v: u8) -> Result<Self, EvdError> {
        match v {
            0 => Ok(MetricType::Ip),
            1 => Ok(MetricType::L2),
            2 => Ok(MetricType::Cosine),
            _ => Err(EvdError::Protocol("unknown metric type")),
        }
    }

    /// Parses the textual form used by client APIs.
    pub fn from_name(s: &str) -> Result<Self, EvdError> {
        match s {
            "IP" => Ok(MetricType::Ip),
            "L2" => Ok(MetricType::L2),
            "COSINE" => Ok(MetricType::Cosine),
            _ => Err(EvdError::UnsupportedMetric(s.to_string())),
        }
    }
}

/// Fixed-point scales used on the query and key sides of a collection.
///
/// The decoded score scale is always `query_scale * key_scale`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScaleConfig {
    /// Scale applied when encoding the query vector.
    pub query_scale: f64,
    /// Scale applied when encoding the database vectors.
    pub key_scale: f64,
}

impl ScaleConfig {
    /// Selects the scale pair for a metric and query-privacy mode.
    ///
    /// `L2` is declared in [`MetricType`] but carries no scale row in this
    /// version and is rejected.
    pub fn select(metric: MetricType, is_query_encrypted: bool) -> Result<Self, EvdError> {
        let (query_log, key_log) = match (metric, is_query_encrypted) {
            (MetricType::Ip, true) => (22.0, 22.0),
            (MetricType::Ip, false) => (16.0, 27.0),
            (MetricType::Cosine, true) => (LOG_SCALE, LOG_SCALE),
            (MetricType::Cosine, false) => (20.0, 32.5),
            (MetricType::L2, _) => {
                return Err(EvdError::UnsupportedMetric("L2".to_string()));
            }
        };
        Ok(Self {
            query_scale: (2.0f64).powf(query_log),
            key_scale: (2.0f64).powf(key_log),
        })
    }

    /// Scale of the decrypted score polynomial.
    pub fn output_scale(&self) -> f64 {
        self.query_scale * self.key_scale
    }
}

/// Smallest log2 rank that fits a vector dimension.
pub fn log_rank_for_dimension(dimension: u64) -> Result<u64, EvdError> {
    if dimension == 0 || dimension > DEGREE {
        return Err(EvdError::InvalidDimension(dimension));
    }
    Ok(64 - (dimension - 1).leading_zeros() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moduli_are_ntt_friendly() {
        assert_eq!(MOD_Q % (2 * DEGREE), 1);
        assert_eq!(MOD_P % (2 * DEGREE), 1);
    }

    #[test]
    fn inverse_p_mod_q_is_correct() {
        let prod = (P_MOD_Q as u128 * INVERSE_P_MOD_Q as u128) % MOD_Q as u128;
        assert_eq!(prod, 1);
    }

    #[test]
    fn log_rank_rounds_up_to_power_of_two() {
        assert_eq!(log_rank_for_dimension(1).unwrap(), 0);
        assert_eq!(log_rank_for_dimension(2).unwrap(), 1);
        assert_eq!(log_rank_for_dimension(3).unwrap(), 2);
        assert_eq!(log_rank_for_dimension(4).unwrap(), 2);
        assert_eq!(log_rank_for_dimension(128).unwrap(), 7);
        assert_eq!(log_rank_for_dimension(129).unwrap(), 8);
        assert_eq!(log_rank_for_dimension(DEGREE).unwrap(), LOG_DEGREE);
        assert!(log_rank_for_dimension(0).is_err());
        assert!(log_rank_for_dimension(DEGREE + 1).is_err());
    }

    #[test]
    fn l2_has_no_scale_row() {
        assert!(ScaleConfig::select(MetricType::L2, true).is_err());
        assert!(ScaleConfig::select(MetricType::L2, false).is_err());
    }

    #[test]
    fn output_scale_is_product() {
        let s = ScaleConfig::select(MetricType::Ip, true).unwrap();
        assert_eq!(s.output_scale(), s.query_scale * s.key_scale);
    }
}
