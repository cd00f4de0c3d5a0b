//! Secret key and switching-key material.
//!
//! A switching key re-encrypts a "modified" secret (s², an automorphic
//! image, or a strided slot selection of s) under the real secret s,
//! with the source term lifted by the special prime P. All key
//! polynomials live in NTT form; they are generated once per collection
//! and read-only afterwards.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::{EvdError, Result};
use crate::math::Polynomial;
use crate::params::{DEGREE, MOD_P, MOD_Q};

/// Ternary secret key of fixed Hamming weight, stored as its NTT images
/// modulo Q and modulo P (same signed coefficients in both).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecretKey {
    /// NTT image mod Q.
    pub poly_q: Polynomial,
    /// NTT image mod P.
    pub poly_p: Polynomial,
}

impl SecretKey {
    /// All-zero placeholder; filled by key generation or [`Self::load`].
    pub fn empty() -> Self {
        Self {
            poly_q: Polynomial::zero(DEGREE, MOD_Q),
            poly_p: Polynomial::zero(DEGREE, MOD_P),
        }
    }

    /// Writes both ring images as raw little-endian u64 words.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        for &c in self.poly_q.coeffs() {
            w.write_u64::<LittleEndian>(c)?;
        }
        for &c in self.poly_p.coeffs() {
            w.write_u64::<LittleEndian>(c)?;
        }
        w.flush()
    }

    /// Reads a key previously written by [`Self::save`].
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let mut r = BufReader::new(File::open(path)?);
        let mut read_poly = |modulus: u64| -> std::io::Result<Polynomial> {
            let mut coeffs = vec![0u64; DEGREE as usize];
            for c in &mut coeffs {
                *c = r.read_u64::<LittleEndian>()?;
            }
            Ok(Polynomial::from_raw(coeffs, modulus, true))
        };
        let poly_q = read_poly(MOD_Q)?;
        let poly_p = read_poly(MOD_P)?;
        // Reject trailing garbage.
        let mut rest = [0u8; 1];
        if r.read(&mut rest)? != 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "secret key file has trailing bytes",
            ));
        }
        Ok(Self { poly_q, poly_p })
    }
}

/// Switching key: `(a_Q, a_P, b_Q, b_P)`, all degree N, NTT form.
///
/// Contract: `b_Q + a_Q·s ≡ P·s_src (mod Q)` and `b_P + a_P·s ≡ e (mod P)`
/// with one shared fresh Gaussian error across the two images.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SwitchingKey {
    pub a_q: Polynomial,
    pub a_p: Polynomial,
    pub b_q: Polynomial,
    pub b_p: Polynomial,
}

impl SwitchingKey {
    /// All-zero placeholder, filled by generation or the wire layer.
    pub fn empty() -> Self {
        Self {
            a_q: Polynomial::zero(DEGREE, MOD_Q),
            a_p: Polynomial::zero(DEGREE, MOD_P),
            b_q: Polynomial::zero(DEGREE, MOD_Q),
            b_p: Polynomial::zero(DEGREE, MOD_P),
        }
    }
}

/// A switching key re-shaped for MLWE-side consumption: each of the
/// four degree-N polynomials becomes `stack` degree-R slices, laid out
/// so coefficient `l·stack + k` of the flat key lands in slice k at
/// position l.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MlweSwitchingKey {
    rank: u64,
    stack: u64,
    pub a_q: Vec<Polynomial>,
    pub a_p: Vec<Polynomial>,
    pub b_q: Vec<Polynomial>,
    pub b_p: Vec<Polynomial>,
}

impl MlweSwitchingKey {
    /// All-zero key at the given rank.
    pub fn empty(rank: u64) -> Result<Self> {
        if rank == 0 || !rank.is_power_of_two() || rank > DEGREE {
            return Err(EvdError::InvalidRank(rank));
        }
        let stack = DEGREE / rank;
        Ok(Self {
            rank,
            stack,
            a_q: vec![Polynomial::zero(rank, MOD_Q); stack as usize],
            a_p: vec![Polynomial::zero(rank, MOD_P); stack as usize],
            b_q: vec![Polynomial::zero(rank, MOD_Q); stack as usize],
            b_p: vec![Polynomial::zero(rank, MOD_P); stack as usize],
        })
    }

    pub fn rank(&self) -> u64 {
        self.rank
    }

    pub fn stack(&self) -> u64 {
        self.stack
    }
}

/// Mod-pack switching keys indexed `[i in 0..rank][j in 0..stack]`,
/// built from the automorphism σ_{2i+1} of the secret with j selecting
/// a stack coordinate. Consumed by the key-cache mod-pack.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AutedModPackKeys {
    rank: u64,
    pub keys: Vec<Vec<SwitchingKey>>,
}

impl AutedModPackKeys {
    pub fn empty(rank: u64) -> Result<Self> {
        if rank == 0 || !rank.is_power_of_two() || rank > DEGREE {
            return Err(EvdError::InvalidRank(rank));
        }
        let stack = (DEGREE / rank) as usize;
        Ok(Self {
            rank,
            keys: vec![vec![SwitchingKey::empty(); stack]; rank as usize],
        })
    }

    pub fn rank(&self) -> u64 {
        self.rank
    }
}

/// Same role as [`AutedModPackKeys`] but in MLWE shape, consumed by the
/// query-cache lift which combines them with rank-degree mask blocks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AutedModPackMlweKeys {
    rank: u64,
    pub keys: Vec<Vec<MlweSwitchingKey>>,
}

impl AutedModPackMlweKeys {
    pub fn empty(rank: u64) -> Result<Self> {
        if rank == 0 || !rank.is_power_of_two() || rank > DEGREE {
            return Err(EvdError::InvalidRank(rank));
        }
        let stack = (DEGREE / rank) as usize;
        let mut keys = Vec::with_capacity(rank as usize);
        for _ in 0..rank {
            let mut row = Vec::with_capacity(stack);
            for _ in 0..stack {
                row.push(MlweSwitchingKey::empty(rank)?);
            }
            keys.push(row);
        }
        Ok(Self { rank, keys })
    }

    pub fn rank(&self) -> u64 {
        self.rank
    }
}

/// One switching key per automorphism exponent `step·i + 1`
/// (`step = 2N/rank`); drives the PIR decomposition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvAutKeys {
    rank: u64,
    pub keys: Vec<SwitchingKey>,
}

impl InvAutKeys {
    pub fn empty(rank: u64) -> Result<Self> {
        if rank == 0 || !rank.is_power_of_two() || rank > DEGREE {
            return Err(EvdError::InvalidRank(rank));
        }
        Ok(Self {
            rank,
            keys: vec![SwitchingKey::empty(); rank as usize],
        })
    }

    pub fn rank(&self) -> u64 {
        self.rank
    }
}

/// The full key material a client uploads for one collection. Shared
/// read-only by the similarity and PIR servers after setup.
#[derive(Clone, Debug)]
pub struct CollectionKeys {
    pub relin: SwitchingKey,
    pub auted_mod_pack: AutedModPackKeys,
    pub auted_mod_pack_mlwe: AutedModPackMlweKeys,
    pub pir_inv_aut: InvAutKeys,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_key_file_roundtrip() {
        let dir = std::env::temp_dir().join("evd-secret-key-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sk.bin");

        let mut sk = SecretKey::empty();
        sk.poly_q.coeffs_mut()[0] = 1;
        sk.poly_q.coeffs_mut()[17] = MOD_Q - 1;
        sk.poly_p.coeffs_mut()[0] = 1;
        sk.poly_p.coeffs_mut()[17] = MOD_P - 1;
        sk.poly_q.set_is_ntt(true);
        sk.poly_p.set_is_ntt(true);

        sk.save(&path).unwrap();
        let loaded = SecretKey::load(&path).unwrap();
        assert_eq!(loaded.poly_q, sk.poly_q);
        assert_eq!(loaded.poly_p, sk.poly_p);
        assert!(loaded.poly_q.is_ntt());

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn key_matrices_have_declared_shape() {
        let keys = AutedModPackKeys::empty(8).unwrap();
        assert_eq!(keys.keys.len(), 8);
        assert_eq!(keys.keys[0].len(), (DEGREE / 8) as usize);

        let mlwe = AutedModPackMlweKeys::empty(8).unwrap();
        assert_eq!(mlwe.keys[0][0].stack(), DEGREE / 8);

        let inv = InvAutKeys::empty(16).unwrap();
        assert_eq!(inv.keys.len(), 16);
    }
}
