use aes::Aes128;
use aes::cipher::{KeyInit, generic_array::GenericArray};

use super::{decrypt_ecb_block, encrypt_ecb_block, CryptoError, APP_KEY_LEN};
use crate::tag::{RawBlock, BLOCK_SIZE};

/// Plaintext record size: three blocks.
pub const PAYLOAD_LEN:     usize = 3 * BLOCK_SIZE;
/// Hex length of the concatenated ciphertext of blocks 4–6.
pub const PAYLOAD_HEX_LEN: usize = PAYLOAD_LEN * 2;

/// Encrypts and decrypts the 48-byte spool record, one block at a time.
#[derive(Clone)]
pub struct PayloadCodec {
    cipher: Aes128,
}

impl PayloadCodec {
    pub fn new(payload_key: [u8; APP_KEY_LEN]) -> Self {
        Self { cipher: Aes128::new(GenericArray::from_slice(&payload_key)) }
    }

    /// Encrypt exactly 48 bytes into the three blocks written to the tag.
    pub fn encrypt(&self, record: &[u8]) -> Result<[RawBlock; 3], CryptoError> {
        if record.len() != PAYLOAD_LEN {
            return Err(CryptoError::InvalidLength { expected: PAYLOAD_LEN, actual: record.len() });
        }
        let mut blocks = [[0u8; BLOCK_SIZE]; 3];
        for (block, chunk) in blocks.iter_mut().zip(record.chunks_exact(BLOCK_SIZE)) {
            block.copy_from_slice(chunk);
            encrypt_ecb_block(&self.cipher, block);
        }
        Ok(blocks)
    }

    /// Encrypt and render as 96 upper-case hex characters.
    pub fn encrypt_hex(&self, record: &[u8]) -> Result<String, CryptoError> {
        Ok(hex::encode_upper(self.encrypt(record)?.concat()))
    }

    /// Decrypt 96 hex characters (blocks 4–6 concatenated) into the record bytes.
    pub fn decrypt(&self, cipher_hex: &str) -> Result<[u8; PAYLOAD_LEN], CryptoError> {
        let cipher_hex = cipher_hex.trim();
        if cipher_hex.len() != PAYLOAD_HEX_LEN {
            return Err(CryptoError::InvalidLength {
                expected: PAYLOAD_HEX_LEN,
                actual:   cipher_hex.len(),
            });
        }
        let bytes = hex::decode(cipher_hex)
            .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        let mut blocks = [[0u8; BLOCK_SIZE]; 3];
        for (block, chunk) in blocks.iter_mut().zip(bytes.chunks_exact(BLOCK_SIZE)) {
            block.copy_from_slice(chunk);
        }
        Ok(self.decrypt_blocks(&blocks))
    }

    /// Decrypt blocks exactly as read from the tag.
    pub fn decrypt_blocks(&self, blocks: &[RawBlock; 3]) -> [u8; PAYLOAD_LEN] {
        let mut out = [0u8; PAYLOAD_LEN];
        for (chunk, block) in out.chunks_exact_mut(BLOCK_SIZE).zip(blocks.iter()) {
            chunk.copy_from_slice(block);
            decrypt_ecb_block(&self.cipher, chunk);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CodecKeys;
    use proptest::prelude::*;

    const FIXTURE_PLAIN:  &str = "A2AB1240276010010FFFFF01650000010000000000000000";
    const FIXTURE_CIPHER: &str = "C8B3AFD3003410A88EED67679FBE4AEB\
                                  90077F5D97C24CF6E3D974AE9743D18C\
                                  DE87F593DB8A918A3CF47A0FC224FA9C";

    fn codec() -> PayloadCodec { CodecKeys::default().payload_codec() }

    #[test]
    fn encrypts_fixture_record() {
        assert_eq!(codec().encrypt_hex(FIXTURE_PLAIN.as_bytes()).unwrap(), FIXTURE_CIPHER);
    }

    #[test]
    fn decrypts_fixture_record_any_case() {
        let plain = codec().decrypt(&FIXTURE_CIPHER.to_lowercase()).unwrap();
        assert_eq!(&plain[..], FIXTURE_PLAIN.as_bytes());
    }

    #[test]
    fn blocks_are_independent() {
        let record = [b'0'; PAYLOAD_LEN];
        let blocks = codec().encrypt(&record).unwrap();
        assert_eq!(blocks[0], blocks[1]);
        assert_eq!(blocks[1], blocks[2]);
    }

    #[test]
    fn encrypt_rejects_wrong_length() {
        let err = codec().encrypt(&[b'0'; 38]).unwrap_err();
        assert_eq!(err, CryptoError::InvalidLength { expected: 48, actual: 38 });
    }

    #[test]
    fn decrypt_rejects_wrong_length_before_hex() {
        let err = codec().decrypt(&"Z".repeat(95)).unwrap_err();
        assert_eq!(err, CryptoError::InvalidLength { expected: 96, actual: 95 });
    }

    #[test]
    fn decrypt_rejects_bad_hex() {
        let err = codec().decrypt(&"ZZ".repeat(48)).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidEncoding(_)));
    }

    proptest! {
        #[test]
        fn decrypt_inverts_encrypt(record in "[ -~]{48}") {
            let codec = codec();
            let hex = codec.encrypt_hex(record.as_bytes()).unwrap();
            let plain = codec.decrypt(&hex).unwrap();
            prop_assert_eq!(&plain[..], record.as_bytes());
        }
    }
}
