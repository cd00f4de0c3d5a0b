//! Binary wire codec.
//!
//! All request and response bodies are packed little-endian with no
//! alignment padding and no internal length prefixes; the body length
//! itself delimits the message. Short reads are protocol errors and
//! must close the session.

use byteorder::{ByteOrder, LittleEndian};
use tiny_keccak::{Hasher, Keccak};

use crate::cipher::{MlweCiphertext, RlweCiphertext};
use crate::error::{EvdError, Result};
use crate::keys::{MlweSwitchingKey, SwitchingKey};
use crate::math::Polynomial;
use crate::params::{DEGREE, MOD_P, MOD_Q};

/// Request kinds understood by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    Setup = 0,
    Insert = 1,
    Query = 2,
    QueryPtxt = 3,
    Terminate = 4,
    Retrieve = 5,
    PirRetrieve = 6,
    DropCollection = 7,
}

impl Operation {
    /// HTTP path of this operation on the reference transport.
    pub fn path(&self) -> &'static str {
        match self {
            Operation::Setup => "/collections/setup",
            Operation::Insert => "/collections/insert",
            Operation::Query => "/collections/query",
            Operation::QueryPtxt => "/collections/query_ptxt",
            Operation::Terminate => "/terminate",
            Operation::Retrieve => "/collections/retrieve",
            Operation::PirRetrieve => "/collections/pir_retrieve",
            Operation::DropCollection => "/collections",
        }
    }
}

/// Setup handshake status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SetupStatus {
    /// Collection exists (or was just registered); use the returned
    /// dimension, metric, and database size.
    Ready = 0,
    /// Collection is new; phase 2 with the key blob must follow.
    NeedKeys = 1,
    /// Dimension mismatch with the existing collection.
    DimensionMismatch = 2,
}

impl SetupStatus {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(SetupStatus::Ready),
            1 => Ok(SetupStatus::NeedKeys),
            2 => Ok(SetupStatus::DimensionMismatch),
            other => Err(EvdError::UnexpectedStatus(other)),
        }
    }
}

/// Stable 64-bit collection hash: the first eight bytes of
/// Keccak-256 over the collection name, little-endian.
pub fn collection_hash(name: &str) -> u64 {
    let mut hasher = Keccak::v256();
    hasher.update(name.as_bytes());
    let mut digest = [0u8; 32];
    hasher.finalize(&mut digest);
    LittleEndian::read_u64(&digest[..8])
}

/// Bounds-checked reader over a request or response body.
pub struct BinaryReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        if self.remaining() < 1 {
            return Err(EvdError::Protocol("short read"));
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        if self.remaining() < 8 {
            return Err(EvdError::Protocol("short read"));
        }
        let v = LittleEndian::read_u64(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(v)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(EvdError::Protocol("short read"));
        }
        let s = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(s)
    }

    /// Reads `degree` packed u64 residues into a polynomial. Values are
    /// reduced into range; the domain flag is taken on trust from the
    /// protocol context.
    pub fn read_poly(&mut self, degree: u64, modulus: u64, is_ntt: bool) -> Result<Polynomial> {
        let raw = self.read_bytes(degree as usize * 8)?;
        let coeffs: Vec<u64> = raw
            .chunks_exact(8)
            .map(|c| LittleEndian::read_u64(c) % modulus)
            .collect();
        Ok(Polynomial::from_raw(coeffs, modulus, is_ntt))
    }
}

/// Append-only body builder.
#[derive(Default)]
pub struct BinaryWriter {
    buf: Vec<u8>,
}

impl BinaryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_poly(&mut self, p: &Polynomial) {
        for &c in p.coeffs() {
            self.buf.extend_from_slice(&c.to_le_bytes());
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

// ---- composite codecs -----------------------------------------------------

/// Switching key on the wire: a_Q, a_P, b_Q, b_P, each N u64s, NTT form.
pub fn write_switching_key(w: &mut BinaryWriter, key: &SwitchingKey) {
    w.put_poly(&key.a_q);
    w.put_poly(&key.a_p);
    w.put_poly(&key.b_q);
    w.put_poly(&key.b_p);
}

pub fn read_switching_key(r: &mut BinaryReader<'_>) -> Result<SwitchingKey> {
    Ok(SwitchingKey {
        a_q: r.read_poly(DEGREE, MOD_Q, true)?,
        a_p: r.read_poly(DEGREE, MOD_P, true)?,
        b_q: r.read_poly(DEGREE, MOD_Q, true)?,
        b_p: r.read_poly(DEGREE, MOD_P, true)?,
    })
}

/// MLWE-shaped switching key: per stack slot k, the four degree-R
/// slices a_Q(k), a_P(k), b_Q(k), b_P(k).
pub fn write_mlwe_switching_key(w: &mut BinaryWriter, key: &MlweSwitchingKey) {
    for k in 0..key.stack() as usize {
        w.put_poly(&key.a_q[k]);
        w.put_poly(&key.a_p[k]);
        w.put_poly(&key.b_q[k]);
        w.put_poly(&key.b_p[k]);
    }
}

pub fn read_mlwe_switching_key(r: &mut BinaryReader<'_>, rank: u64) -> Result<MlweSwitchingKey> {
    let mut key = MlweSwitchingKey::empty(rank)?;
    for k in 0..key.stack() as usize {
        key.a_q[k] = r.read_poly(rank, MOD_Q, true)?;
        key.a_p[k] = r.read_poly(rank, MOD_P, true)?;
        key.b_q[k] = r.read_poly(rank, MOD_Q, true)?;
        key.b_p[k] = r.read_poly(rank, MOD_P, true)?;
    }
    Ok(key)
}

/// MLWE ciphertext: the stack mask polynomials then the body, all
/// degree R, coefficient domain.
pub fn write_mlwe_ciphertext(w: &mut BinaryWriter, ct: &MlweCiphertext) {
    for i in 0..ct.stack() {
        w.put_poly(ct.a(i));
    }
    w.put_poly(ct.b());
}

pub fn read_mlwe_ciphertext(r: &mut BinaryReader<'_>, rank: u64) -> Result<MlweCiphertext> {
    let mut ct = MlweCiphertext::zero(rank)?;
    for i in 0..ct.stack() {
        *ct.a_mut(i) = r.read_poly(rank, MOD_Q, false)?;
    }
    *ct.b_mut() = r.read_poly(rank, MOD_Q, false)?;
    Ok(ct)
}

/// Rank-1 RLWE ciphertext: A then B, each N u64s.
pub fn write_rlwe_ciphertext(w: &mut BinaryWriter, ct: &RlweCiphertext) {
    w.put_poly(&ct.a);
    w.put_poly(&ct.b);
}

pub fn read_rlwe_ciphertext(r: &mut BinaryReader<'_>, is_ntt: bool) -> Result<RlweCiphertext> {
    let a = r.read_poly(DEGREE, MOD_Q, is_ntt)?;
    let b = r.read_poly(DEGREE, MOD_Q, is_ntt)?;
    Ok(RlweCiphertext { a, b, c: None })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_rejects_short_reads() {
        let buf = [1u8, 2, 3];
        let mut r = BinaryReader::new(&buf);
        assert!(r.read_u64().is_err());
        assert_eq!(r.read_u8().unwrap(), 1);
        assert!(r.read_bytes(3).is_err());
    }

    #[test]
    fn u64_roundtrip_is_little_endian() {
        let mut w = BinaryWriter::new();
        w.put_u64(0x0102030405060708);
        let body = w.into_inner();
        assert_eq!(body[0], 0x08);
        let mut r = BinaryReader::new(&body);
        assert_eq!(r.read_u64().unwrap(), 0x0102030405060708);
    }

    #[test]
    fn switching_key_roundtrip() {
        let mut key = SwitchingKey::empty();
        key.a_q.coeffs_mut()[3] = 12345;
        key.b_p.coeffs_mut()[7] = 999;
        key.a_q.set_is_ntt(true);
        key.a_p.set_is_ntt(true);
        key.b_q.set_is_ntt(true);
        key.b_p.set_is_ntt(true);

        let mut w = BinaryWriter::new();
        write_switching_key(&mut w, &key);
        let body = w.into_inner();
        assert_eq!(body.len(), 4 * DEGREE as usize * 8);

        let mut r = BinaryReader::new(&body);
        let back = read_switching_key(&mut r).unwrap();
        assert_eq!(back.a_q.coeffs()[3], 12345);
        assert_eq!(back.b_p.coeffs()[7], 999);
        assert!(back.a_q.is_ntt());
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn mlwe_ciphertext_roundtrip() {
        let mut ct = MlweCiphertext::zero(8).unwrap();
        ct.a_mut(2).coeffs_mut()[1] = 77;
        ct.b_mut().coeffs_mut()[5] = 88;

        let mut w = BinaryWriter::new();
        write_mlwe_ciphertext(&mut w, &ct);
        let body = w.into_inner();
        let mut r = BinaryReader::new(&body);
        let back = read_mlwe_ciphertext(&mut r, 8).unwrap();
        assert_eq!(back.a(2).coeffs()[1], 77);
        assert_eq!(back.b().coeffs()[5], 88);
        assert!(!back.b().is_ntt());
    }

    #[test]
    fn collection_hash_is_stable_and_distinct() {
        let a = collection_hash("alpha");
        assert_eq!(a, collection_hash("alpha"));
        assert_ne!(a, collection_hash("beta"));
    }

    #[test]
    fn setup_status_parses() {
        assert_eq!(SetupStatus::from_u8(0).unwrap(), SetupStatus::Ready);
        assert_eq!(SetupStatus::from_u8(1).unwrap(), SetupStatus::NeedKeys);
        assert!(SetupStatus::from_u8(9).is_err());
    }
}
