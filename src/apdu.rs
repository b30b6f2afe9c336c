//! PC/SC pseudo-APDUs for MIFARE Classic access through a contactless reader.
//!
//! | Command       | Bytes                                              |
//! |---------------|----------------------------------------------------|
//! | Get UID       | `FF CA 00 00 00`                                   |
//! | Load key      | `FF 82 00 <slot> 06 <key(6)>`                      |
//! | Authenticate  | `FF 86 00 00 05 01 00 <block> <type> <slot>`       |
//! | Auth (inline) | `FF 86 00 00 0B 01 00 <block> <type> FF <key(6)>`  |
//! | Read 16       | `FF B0 00 <block> 10`                              |
//! | Update 16     | `FF D6 00 <block> 10 <data(16)>`                   |
//!
//! Every response ends in a two-byte status word; `90 00` is success.

use crate::tag::{KeyType, RawBlock, SectorKey, BLOCK_SIZE, KEY_SIZE};

pub const CLA:               u8 = 0xFF;
pub const INS_GET_DATA:      u8 = 0xCA;
pub const INS_LOAD_KEY:      u8 = 0x82;
pub const INS_AUTHENTICATE:  u8 = 0x86;
pub const INS_READ_BINARY:   u8 = 0xB0;
pub const INS_UPDATE_BINARY: u8 = 0xD6;

/// Version byte of the general-authenticate data object.
const AUTH_VERSION: u8 = 0x01;
/// Slot marker meaning "key bytes follow inline".
const INLINE_SLOT:  u8 = 0xFF;

/// Reader-side key slot used by the load-then-reference procedure.
pub const KEY_SLOT: u8 = 0x00;

pub const SW_SUCCESS:        u16 = 0x9000;
pub const SW_AUTH_FAILED:    u16 = 0x6300;
pub const SW_SECURITY:       u16 = 0x6982;
pub const SW_UNSUPPORTED:    u16 = 0x6A81;
pub const SW_INS_NOT_FOUND:  u16 = 0x6D00;

// ── Commands ──────────────────────────────────────────────────────────────────

/// Where the reader takes the key from during authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRef {
    Inline(SectorKey),
    Slot(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    GetUid,
    LoadKey      { slot: u8, key: SectorKey },
    Authenticate { block: u8, key_type: KeyType, key: KeyRef },
    ReadBlock    { block: u8 },
    UpdateBlock  { block: u8, data: RawBlock },
}

impl Command {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Command::GetUid => vec![CLA, INS_GET_DATA, 0x00, 0x00, 0x00],
            Command::LoadKey { slot, key } => {
                let mut cmd = vec![CLA, INS_LOAD_KEY, 0x00, *slot, KEY_SIZE as u8];
                cmd.extend_from_slice(key.as_bytes());
                cmd
            }
            Command::Authenticate { block, key_type, key: KeyRef::Slot(slot) } => vec![
                CLA, INS_AUTHENTICATE, 0x00, 0x00, 0x05,
                AUTH_VERSION, 0x00, *block, key_type.code(), *slot,
            ],
            Command::Authenticate { block, key_type, key: KeyRef::Inline(key) } => {
                let mut cmd = vec![
                    CLA, INS_AUTHENTICATE, 0x00, 0x00, 0x05 + KEY_SIZE as u8,
                    AUTH_VERSION, 0x00, *block, key_type.code(), INLINE_SLOT,
                ];
                cmd.extend_from_slice(key.as_bytes());
                cmd
            }
            Command::ReadBlock { block } => {
                vec![CLA, INS_READ_BINARY, 0x00, *block, BLOCK_SIZE as u8]
            }
            Command::UpdateBlock { block, data } => {
                let mut cmd = vec![CLA, INS_UPDATE_BINARY, 0x00, *block, BLOCK_SIZE as u8];
                cmd.extend_from_slice(data);
                cmd
            }
        }
    }

    /// Parse a command as a reader would.  Returns `None` for anything this
    /// crate never emits.
    pub fn parse(bytes: &[u8]) -> Option<Command> {
        let (&cla, rest) = bytes.split_first()?;
        if cla != CLA || rest.len() < 4 {
            return None;
        }
        let (ins, p1, p2, lc) = (rest[0], rest[1], rest[2], rest[3] as usize);
        let data = &rest[4..];
        match ins {
            INS_GET_DATA if p1 == 0 && p2 == 0 && data.is_empty() => Some(Command::GetUid),
            INS_LOAD_KEY if lc == KEY_SIZE && data.len() == KEY_SIZE => Some(Command::LoadKey {
                slot: p2,
                key:  SectorKey::from_slice(data).ok()?,
            }),
            INS_AUTHENTICATE if data.len() == lc && lc >= 5 && data[0] == AUTH_VERSION => {
                let block    = data[2];
                let key_type = KeyType::from_code(data[3])?;
                let key = match (data[4], &data[5..]) {
                    (INLINE_SLOT, key) if key.len() == KEY_SIZE => {
                        KeyRef::Inline(SectorKey::from_slice(key).ok()?)
                    }
                    (slot, []) if slot != INLINE_SLOT => KeyRef::Slot(slot),
                    _ => return None,
                };
                Some(Command::Authenticate { block, key_type, key })
            }
            INS_READ_BINARY if lc == BLOCK_SIZE && data.is_empty() => {
                Some(Command::ReadBlock { block: p2 })
            }
            INS_UPDATE_BINARY if lc == BLOCK_SIZE && data.len() == BLOCK_SIZE => {
                let mut block = [0u8; BLOCK_SIZE];
                block.copy_from_slice(data);
                Some(Command::UpdateBlock { block: p2, data: block })
            }
            _ => None,
        }
    }
}

// ── Responses ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub data:   Vec<u8>,
    pub status: u16,
}

impl Response {
    /// Split the trailing status word off a raw response.
    pub fn parse(raw: &[u8]) -> Option<Response> {
        if raw.len() < 2 {
            return None;
        }
        let (data, sw) = raw.split_at(raw.len() - 2);
        Some(Response {
            data:   data.to_vec(),
            status: u16::from_be_bytes([sw[0], sw[1]]),
        })
    }

    pub fn ok(data: &[u8]) -> Vec<u8> { Self::with_status(data, SW_SUCCESS) }

    pub fn status_only(status: u16) -> Vec<u8> { Self::with_status(&[], status) }

    fn with_status(data: &[u8], status: u16) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 2);
        out.extend_from_slice(data);
        out.extend_from_slice(&status.to_be_bytes());
        out
    }

    #[inline]
    pub fn is_success(&self) -> bool { self.status == SW_SUCCESS }
}
