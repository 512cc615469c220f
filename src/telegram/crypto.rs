//! AES decryption for wM-Bus security modes.
//!
//! Two modes appear on the telegram path: the Extended Link Layer carries
//! AES-128 CTR (the decrypted content leads with a CRC over the remainder),
//! and TPL security mode 5 carries AES-128 CBC with an IV derived from the
//! link layer address and the access number (the decrypted content leads
//! with the 2F 2F filler marker). Both modes are composed from the raw
//! `aes` block cipher; encryption counterparts are kept alongside so tests
//! can fabricate ciphertexts.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use thiserror::Error;
use zeroize::Zeroize;

use crate::util::hex::decode_hex;

/// CRC-16 polynomial from EN 13757-4, used over decrypted ELL content.
const CRC16_EN13757_POLY: u16 = 0x3D65;

/// Cryptographic failures.
///
/// `Integrity` is the one the dispatch layer acts on: the sending address
/// gets permanently ignored after the first occurrence.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CryptoError {
    #[error("invalid AES key length: expected 16 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("invalid AES key hex: {0}")]
    InvalidKeyHex(String),

    #[error("encrypted payload not a whole number of blocks: {0} bytes")]
    PartialBlock(usize),

    #[error("decrypted content failed integrity check: {0}")]
    Integrity(String),
}

/// AES-128 key. Wiped from memory on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct AesKey {
    key: [u8; 16],
}

impl AesKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 16 {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, CryptoError> {
        let bytes =
            decode_hex(hex_str).map_err(|e| CryptoError::InvalidKeyHex(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.key
    }
}

impl Drop for AesKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for AesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.write_str("AesKey(****)")
    }
}

/// IV for ELL AES-CTR: M(2) ID(4) version type CC SN(4) FN(2)=0 BC(1)=0.
pub fn build_ell_iv(
    manufacturer: u16,
    id: [u8; 4],
    version: u8,
    device_type: u8,
    cc: u8,
    sn: [u8; 4],
) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[0..2].copy_from_slice(&manufacturer.to_le_bytes());
    iv[2..6].copy_from_slice(&id);
    iv[6] = version;
    iv[7] = device_type;
    iv[8] = cc;
    iv[9..13].copy_from_slice(&sn);
    // FN and BC start at zero; BC advances per block in CTR mode.
    iv
}

/// IV for TPL AES-CBC mode 5: M(2) ID(4) version type, then ACC repeated.
pub fn build_tpl_iv(
    manufacturer: u16,
    id: [u8; 4],
    version: u8,
    device_type: u8,
    acc: u8,
) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[0..2].copy_from_slice(&manufacturer.to_le_bytes());
    iv[2..6].copy_from_slice(&id);
    iv[6] = version;
    iv[7] = device_type;
    for b in iv[8..16].iter_mut() {
        *b = acc;
    }
    iv
}

fn cipher(key: &AesKey) -> Aes128 {
    // 16 byte keys are enforced at AesKey construction.
    Aes128::new(GenericArray::from_slice(key.as_bytes()))
}

/// AES-128 CTR keystream application; encrypt and decrypt are the same
/// operation. Handles a trailing partial block.
pub fn aes_ctr_process(key: &AesKey, iv: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let cipher = cipher(key);
    let mut counter = *iv;
    let mut out = Vec::with_capacity(data.len());

    for chunk in data.chunks(16) {
        let mut keystream = GenericArray::clone_from_slice(&counter);
        cipher.encrypt_block(&mut keystream);
        for (i, b) in chunk.iter().enumerate() {
            out.push(b ^ keystream[i]);
        }
        increment_counter(&mut counter);
    }

    out
}

/// AES-128 CBC decryption of whole blocks, no padding involved.
pub fn aes_cbc_decrypt(key: &AesKey, iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() % 16 != 0 {
        return Err(CryptoError::PartialBlock(data.len()));
    }

    let cipher = cipher(key);
    let mut prev = *iv;
    let mut out = Vec::with_capacity(data.len());

    for chunk in data.chunks_exact(16) {
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.decrypt_block(&mut block);
        for i in 0..16 {
            out.push(block[i] ^ prev[i]);
        }
        prev.copy_from_slice(chunk);
    }

    Ok(out)
}

/// AES-128 CBC encryption of whole blocks.
pub fn aes_cbc_encrypt(key: &AesKey, iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() % 16 != 0 {
        return Err(CryptoError::PartialBlock(data.len()));
    }

    let cipher = cipher(key);
    let mut prev = *iv;
    let mut out = Vec::with_capacity(data.len());

    for chunk in data.chunks_exact(16) {
        let mut block = GenericArray::clone_from_slice(chunk);
        for i in 0..16 {
            block[i] ^= prev[i];
        }
        cipher.encrypt_block(&mut block);
        prev.copy_from_slice(&block);
        out.extend_from_slice(&block);
    }

    Ok(out)
}

fn increment_counter(counter: &mut [u8; 16]) {
    for b in counter.iter_mut().rev() {
        let (v, overflow) = b.overflowing_add(1);
        *b = v;
        if !overflow {
            break;
        }
    }
}

/// CRC-16 per EN 13757-4 (poly 0x3D65, complemented output).
pub fn crc16_en13757(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ CRC16_EN13757_POLY;
            } else {
                crc <<= 1;
            }
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> AesKey {
        AesKey::from_hex("000102030405060708090A0B0C0D0E0F").unwrap()
    }

    #[test]
    fn test_key_construction() {
        assert!(AesKey::from_bytes(&[0u8; 16]).is_ok());
        assert!(matches!(
            AesKey::from_bytes(&[0u8; 15]),
            Err(CryptoError::InvalidKeyLength(15))
        ));
        assert!(AesKey::from_hex("0011").is_err());
        assert!(AesKey::from_hex("zz").is_err());
    }

    #[test]
    fn test_ctr_roundtrip_partial_block() {
        let iv = build_ell_iv(0x2C2D, [0x31, 0x32, 0x33, 0x34], 0x1B, 0x16, 0x20, [1, 2, 3, 4]);
        let plaintext: Vec<u8> = (0u8..40).collect();
        let ciphertext = aes_ctr_process(&key(), &iv, &plaintext);
        assert_ne!(ciphertext, plaintext);
        assert_eq!(aes_ctr_process(&key(), &iv, &ciphertext), plaintext);
    }

    #[test]
    fn test_cbc_roundtrip() {
        let iv = build_tpl_iv(0x3033, [0x78, 0x56, 0x34, 0x12], 0x14, 0x02, 0x55);
        let plaintext: Vec<u8> = (0u8..32).collect();
        let ciphertext = aes_cbc_encrypt(&key(), &iv, &plaintext).unwrap();
        assert_eq!(aes_cbc_decrypt(&key(), &iv, &ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn test_cbc_rejects_partial_blocks() {
        let iv = [0u8; 16];
        assert!(matches!(
            aes_cbc_decrypt(&key(), &iv, &[0u8; 17]),
            Err(CryptoError::PartialBlock(17))
        ));
    }

    #[test]
    fn test_wrong_key_changes_plaintext() {
        let iv = build_tpl_iv(0x3033, [0x78, 0x56, 0x34, 0x12], 0x14, 0x02, 0x55);
        let mut plaintext = vec![0x2F, 0x2F];
        plaintext.resize(16, 0x2F);
        let ciphertext = aes_cbc_encrypt(&key(), &iv, &plaintext).unwrap();

        let wrong = AesKey::from_hex("FFEEDDCCBBAA99887766554433221100").unwrap();
        let decrypted = aes_cbc_decrypt(&wrong, &iv, &ciphertext).unwrap();
        assert_ne!(&decrypted[0..2], &[0x2F, 0x2F]);
    }

    #[test]
    fn test_ell_iv_layout() {
        let iv = build_ell_iv(0x2C2D, [0x99, 0x87, 0x34, 0x76], 0x1B, 0x16, 0x20, [5, 6, 7, 8]);
        assert_eq!(&iv[0..2], &[0x2D, 0x2C]);
        assert_eq!(&iv[2..6], &[0x99, 0x87, 0x34, 0x76]);
        assert_eq!(iv[6], 0x1B);
        assert_eq!(iv[7], 0x16);
        assert_eq!(iv[8], 0x20);
        assert_eq!(&iv[9..13], &[5, 6, 7, 8]);
        assert_eq!(&iv[13..16], &[0, 0, 0]);
    }

    #[test]
    fn test_tpl_iv_replicates_access_number() {
        let iv = build_tpl_iv(0x3033, [1, 2, 3, 4], 0x14, 0x02, 0xAB);
        assert_eq!(&iv[8..16], &[0xAB; 8]);
    }

    #[test]
    fn test_crc16_en13757_known_properties() {
        let a = crc16_en13757(b"wmbus");
        let b = crc16_en13757(b"wmbut");
        assert_ne!(a, b);
        assert_eq!(a, crc16_en13757(b"wmbus"));
    }
}
