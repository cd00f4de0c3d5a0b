//! AES-256-CTR payload envelope.
//!
//! Every payload is padded with NULs to the fixed `PIR_PAYLOAD_SIZE`
//! and encrypted under the client's AES key with an IV derived from the
//! payload's global index (8-byte little-endian index, zero-extended to
//! the block size). A global index must never be reused under the same
//! key; the coordinator guarantees this by deriving indices from the
//! monotone database size.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes256;

use crate::error::{EvdError, Result};
use crate::params::{AES_KEY_SIZE, PIR_PAYLOAD_SIZE};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

fn iv_from_index(index: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&index.to_le_bytes());
    iv
}

/// Encrypts a payload into a fixed-size block keyed to its index.
pub fn seal_payload(
    plaintext: &[u8],
    key: &[u8; AES_KEY_SIZE],
    index: u64,
) -> Result<Vec<u8>> {
    if plaintext.len() > PIR_PAYLOAD_SIZE {
        return Err(EvdError::PayloadTooLarge(plaintext.len()));
    }
    let mut block = vec![0u8; PIR_PAYLOAD_SIZE];
    block[..plaintext.len()].copy_from_slice(plaintext);

    let mut cipher = Aes256Ctr::new(key.into(), &iv_from_index(index).into());
    cipher.apply_keystream(&mut block);
    Ok(block)
}

/// Decrypts a fixed-size payload block and trims at the first NUL.
pub fn open_payload(
    ciphertext: &[u8],
    key: &[u8; AES_KEY_SIZE],
    index: u64,
) -> Result<Vec<u8>> {
    if ciphertext.len() != PIR_PAYLOAD_SIZE {
        return Err(EvdError::Protocol("payload block has wrong length"));
    }
    let mut block = ciphertext.to_vec();
    let mut cipher = Aes256Ctr::new(key.into(), &iv_from_index(index).into());
    cipher.apply_keystream(&mut block);

    if let Some(end) = block.iter().position(|&b| b == 0) {
        block.truncate(end);
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; AES_KEY_SIZE] = [42u8; AES_KEY_SIZE];

    #[test]
    fn seal_open_roundtrip_trims_padding() {
        let sealed = seal_payload(b"hello world", &KEY, 7).unwrap();
        assert_eq!(sealed.len(), PIR_PAYLOAD_SIZE);
        let opened = open_payload(&sealed, &KEY, 7).unwrap();
        assert_eq!(opened, b"hello world");
    }

    #[test]
    fn different_indices_give_different_ciphertexts() {
        let a = seal_payload(b"same", &KEY, 0).unwrap();
        let b = seal_payload(b"same", &KEY, 1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_index_garbles_plaintext() {
        let sealed = seal_payload(b"payload", &KEY, 3).unwrap();
        let opened = open_payload(&sealed, &KEY, 4).unwrap();
        assert_ne!(opened, b"payload");
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let big = vec![1u8; PIR_PAYLOAD_SIZE + 1];
        assert!(matches!(
            seal_payload(&big, &KEY, 0),
            Err(EvdError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn full_size_payload_roundtrips() {
        let data = vec![0xABu8; PIR_PAYLOAD_SIZE];
        let sealed = seal_payload(&data, &KEY, 9).unwrap();
        let opened = open_payload(&sealed, &KEY, 9).unwrap();
        assert_eq!(opened, data);
    }
}
