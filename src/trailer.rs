use crate::tag::{RawBlock, SectorKey, BLOCK_SIZE, KEY_SIZE};

/// Access conditions written to provisioned tags (the transport
/// configuration, which the printer expects).
pub const ACCESS_BITS: [u8; 3] = [0xFF, 0x07, 0x80];
/// General-purpose byte written alongside [`ACCESS_BITS`].
pub const GPB: u8 = 0x69;

const ACCESS_OFFSET: usize = KEY_SIZE;
const GPB_OFFSET:    usize = KEY_SIZE + 3;
const KEY_B_OFFSET:  usize = KEY_SIZE + 4;

/// Sector trailer: KeyA(6) ‖ AccessBits(3) ‖ GPB(1) ‖ KeyB(6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorTrailer {
    pub key_a:       SectorKey,
    pub access_bits: [u8; 3],
    pub gpb:         u8,
    pub key_b:       SectorKey,
}

impl SectorTrailer {
    pub fn new(key_a: SectorKey, key_b: SectorKey) -> Self {
        Self { key_a, access_bits: ACCESS_BITS, gpb: GPB, key_b }
    }

    /// Trailer of a factory-fresh tag.
    pub fn transport() -> Self { Self::new(SectorKey::DEFAULT, SectorKey::DEFAULT) }

    pub fn to_bytes(&self) -> RawBlock {
        let mut out = [0u8; BLOCK_SIZE];
        out[..KEY_SIZE].copy_from_slice(self.key_a.as_bytes());
        out[ACCESS_OFFSET..GPB_OFFSET].copy_from_slice(&self.access_bits);
        out[GPB_OFFSET] = self.gpb;
        out[KEY_B_OFFSET..].copy_from_slice(self.key_b.as_bytes());
        out
    }

    pub fn from_bytes(block: &RawBlock) -> Self {
        let mut key_a = [0u8; KEY_SIZE];
        let mut key_b = [0u8; KEY_SIZE];
        let mut access_bits = [0u8; 3];
        key_a.copy_from_slice(&block[..KEY_SIZE]);
        access_bits.copy_from_slice(&block[ACCESS_OFFSET..GPB_OFFSET]);
        key_b.copy_from_slice(&block[KEY_B_OFFSET..]);
        Self {
            key_a: SectorKey::new(key_a),
            access_bits,
            gpb: block[GPB_OFFSET],
            key_b: SectorKey::new(key_b),
        }
    }

    /// Whether the access bits carry their own inverted copy.  A card that
    /// accepts a trailer failing this check locks the sector for good.
    pub fn access_bits_consistent(&self) -> bool {
        let [b6, b7, b8] = self.access_bits;
        let (inv_c1, inv_c2) = (b6 & 0x0F, b6 >> 4);
        let (inv_c3, c1)     = (b7 & 0x0F, b7 >> 4);
        let (c2, c3)         = (b8 & 0x0F, b8 >> 4);
        c1 == !inv_c1 & 0x0F && c2 == !inv_c2 & 0x0F && c3 == !inv_c3 & 0x0F
    }
}
