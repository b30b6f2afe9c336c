//! Tag-level value types shared by the codec, the session and the provisioner.
//!
//! All identifiers display as upper-case hex and parse case-insensitively.
//! None of these values are cached beyond the operation that produced them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::CryptoError;

/// Size of one MIFARE Classic block.
pub const BLOCK_SIZE: usize = 16;
/// Size of a MIFARE Classic sector key.
pub const KEY_SIZE:   usize = 6;
/// Size of a single-size NUID/UID as returned by the reader.
pub const UID_SIZE:   usize = 4;

/// Data blocks holding the encrypted spool record (sector 1).
pub const PAYLOAD_BLOCKS: [u8; 3] = [4, 5, 6];
/// Sector trailer of sector 1.
pub const TRAILER_BLOCK:  u8 = 7;

/// One 16-byte block as stored on the tag.
pub type RawBlock = [u8; BLOCK_SIZE];

// ── TagUid ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagUid([u8; UID_SIZE]);

impl TagUid {
    pub const fn new(bytes: [u8; UID_SIZE]) -> Self { Self(bytes) }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; UID_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidUid(hex::encode_upper(bytes)))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; UID_SIZE] { &self.0 }
}

impl FromStr for TagUid {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != UID_SIZE * 2 {
            return Err(CryptoError::InvalidUid(s.to_owned()));
        }
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidUid(s.to_owned()))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for TagUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl Serialize for TagUid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TagUid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── SectorKey ─────────────────────────────────────────────────────────────────

/// A 6-byte MIFARE Classic sector key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectorKey([u8; KEY_SIZE]);

impl SectorKey {
    /// Factory transport key; a blank tag answers to this.
    pub const DEFAULT: SectorKey = SectorKey([0xFF; KEY_SIZE]);
    pub const ZERO:    SectorKey = SectorKey([0x00; KEY_SIZE]);

    pub const fn new(bytes: [u8; KEY_SIZE]) -> Self { Self(bytes) }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(hex::encode_upper(bytes)))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] { &self.0 }
}

impl FromStr for SectorKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != KEY_SIZE * 2 {
            return Err(CryptoError::InvalidKey(s.to_owned()));
        }
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidKey(s.to_owned()))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for SectorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl Serialize for SectorKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SectorKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── KeyType ───────────────────────────────────────────────────────────────────

/// Which of the two sector keys an authentication refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    A,
    B,
}

impl KeyType {
    /// Search order: A is always tried before B.
    pub const BOTH: [KeyType; 2] = [KeyType::A, KeyType::B];

    /// MIFARE authentication command code carried in the APDU.
    #[inline]
    pub fn code(self) -> u8 {
        match self {
            KeyType::A => 0x60,
            KeyType::B => 0x61,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x60 => Some(KeyType::A),
            0x61 => Some(KeyType::B),
            _    => None,
        }
    }
}

impl FromStr for KeyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(KeyType::A),
            "B" => Ok(KeyType::B),
            other => Err(format!("key type must be A or B, got '{other}'")),
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeyType::A => "A",
            KeyType::B => "B",
        })
    }
}
