//! AES-128 per-tag key diversification and payload encryption.
//!
//! Key derivation: AES-ECB(uid_key, uid ‖ uid ‖ uid ‖ uid)[..6] → sector key
//! Encryption:     AES-ECB(payload_key, record), three independent blocks
//!
//! On-tag payload layout: [ block 4 (16 B) | block 5 (16 B) | block 6 (16 B) ]
//!
//! ECB without chaining is what the printer firmware expects. Identical
//! plaintext blocks under one key yield identical ciphertext blocks.

mod payload;

pub use payload::{PayloadCodec, PAYLOAD_HEX_LEN, PAYLOAD_LEN};

use aes::Aes128;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray};
use thiserror::Error;

use crate::tag::{SectorKey, TagUid, BLOCK_SIZE, KEY_SIZE, UID_SIZE};

/// Byte length of both application keys.
pub const APP_KEY_LEN: usize = 16;

/// Vendor key used to diversify sector keys from the tag UID.
pub const DEFAULT_UID_KEY:     [u8; APP_KEY_LEN] = *b"q3bu^t1nqfZ(pf$1";
/// Vendor key used to encrypt the 48-byte spool record.
pub const DEFAULT_PAYLOAD_KEY: [u8; APP_KEY_LEN] = *b"H@CFkRnz@KAtBJp2";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("UID must be exactly 4 bytes (8 hex characters), got '{0}'")]
    InvalidUid(String),
    #[error("Sector key must be exactly 6 bytes (12 hex characters), got '{0}'")]
    InvalidKey(String),
    #[error("Invalid length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("Invalid hex encoding: {0}")]
    InvalidEncoding(String),
}

// ── CodecKeys ─────────────────────────────────────────────────────────────────

/// The two fixed application secrets.
///
/// `Default` yields the vendor constants; tests and the config file may
/// substitute their own.
#[derive(Clone, PartialEq, Eq)]
pub struct CodecKeys {
    pub uid_key:     [u8; APP_KEY_LEN],
    pub payload_key: [u8; APP_KEY_LEN],
}

impl Default for CodecKeys {
    fn default() -> Self {
        Self {
            uid_key:     DEFAULT_UID_KEY,
            payload_key: DEFAULT_PAYLOAD_KEY,
        }
    }
}

impl std::fmt::Debug for CodecKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecKeys")
            .field("uid_key", &"<redacted>")
            .field("payload_key", &"<redacted>")
            .finish()
    }
}

impl CodecKeys {
    pub fn deriver(&self) -> KeyDeriver { KeyDeriver::new(self.uid_key) }

    pub fn payload_codec(&self) -> PayloadCodec { PayloadCodec::new(self.payload_key) }
}

// ── KeyDeriver ────────────────────────────────────────────────────────────────

/// Computes the sector 1 key for a tag from its UID.
#[derive(Clone)]
pub struct KeyDeriver {
    cipher: Aes128,
}

impl KeyDeriver {
    pub fn new(uid_key: [u8; APP_KEY_LEN]) -> Self {
        Self { cipher: Aes128::new(GenericArray::from_slice(&uid_key)) }
    }

    /// Derive the sector key for `uid`.  Pure: same UID, same key.
    pub fn derive(&self, uid: &TagUid) -> SectorKey {
        let mut block = [0u8; BLOCK_SIZE];
        for chunk in block.chunks_exact_mut(UID_SIZE) {
            chunk.copy_from_slice(uid.as_bytes());
        }
        encrypt_ecb_block(&self.cipher, &mut block);
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&block[..KEY_SIZE]);
        SectorKey::new(key)
    }

    /// Derive from raw UID bytes as read off the reader.
    pub fn derive_from_bytes(&self, uid: &[u8]) -> Result<SectorKey, CryptoError> {
        Ok(self.derive(&TagUid::from_slice(uid)?))
    }

    /// Derive from an 8-character hex UID.
    pub fn derive_from_hex(&self, uid_hex: &str) -> Result<SectorKey, CryptoError> {
        Ok(self.derive(&uid_hex.parse()?))
    }
}

// ── ECB primitives ────────────────────────────────────────────────────────────

fn encrypt_ecb_block(cipher: &Aes128, block: &mut [u8]) {
    cipher.encrypt_block(GenericArray::from_mut_slice(block));
}

fn decrypt_ecb_block(cipher: &Aes128, block: &mut [u8]) {
    cipher.decrypt_block(GenericArray::from_mut_slice(block));
}
