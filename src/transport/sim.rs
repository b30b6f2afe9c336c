//! In-memory MIFARE Classic 1K behind a contactless reader.
//!
//! Models exactly what the protocol driver depends on:
//! - key A / key B of each sector checked on authenticate; either key grants
//!   read and write of the sector (access bits are only checked for
//!   consistency when a trailer is written),
//! - two reader-side key slots for the load-then-reference procedure,
//! - authentication that covers one sector and is lost on any failed attempt,
//! - key A reading back as zeros from a trailer,
//! - a read-only manufacturer block.
//!
//! Faults can be injected to exercise failure paths: a missing reader, a card
//! leaving the field, readers that reject inline keys, and writes that are
//! acknowledged but never stored.

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{CardTransport, TransportError};
use crate::apdu::{
    Command, KeyRef, Response, SW_AUTH_FAILED, SW_INS_NOT_FOUND, SW_SECURITY, SW_UNSUPPORTED,
};
use crate::crypto::{CodecKeys, CryptoError};
use crate::provision::ProvisionError;
use crate::record::SpoolRecord;
use crate::tag::{KeyType, RawBlock, SectorKey, TagUid, BLOCK_SIZE, KEY_SIZE, PAYLOAD_BLOCKS, TRAILER_BLOCK};
use crate::trailer::SectorTrailer;

pub const SECTORS:           usize = 16;
pub const BLOCKS_PER_SECTOR: usize = 4;
pub const TOTAL_BLOCKS:      usize = SECTORS * BLOCKS_PER_SECTOR;

const KEY_SLOTS: usize = 2;

/// Counters for assertions in tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    pub connects:          usize,
    pub disconnects:       usize,
    pub auth_commands:     usize,
    pub load_key_commands: usize,
    pub reads:             usize,
    /// Blocks actually stored, in write order.
    pub writes:            Vec<u8>,
}

/// Serialisable card image (`--simulate FILE` in the CLI).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimImage {
    pub uid:    String,
    pub blocks: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SimulatedCard {
    uid:            TagUid,
    blocks:         Vec<RawBlock>,
    slots:          [Option<SectorKey>; KEY_SLOTS],
    session:        Option<usize>,
    connected:      bool,
    reader_present: bool,
    card_present:   bool,
    reject_inline:  bool,
    dropped_writes: Vec<u8>,
    refused_auth:   Vec<(u8, SectorKey)>,
    leave_after:    Option<usize>,
    stats:          SimStats,
}

impl SimulatedCard {
    // ── Constructors ─────────────────────────────────────────────────────────

    /// A factory-fresh tag: zeroed data, transport keys everywhere.
    pub fn blank(uid: TagUid) -> Self {
        let mut blocks = vec![[0u8; BLOCK_SIZE]; TOTAL_BLOCKS];
        blocks[0] = manufacturer_block(&uid);
        for sector in 0..SECTORS {
            blocks[trailer_index(sector)] = SectorTrailer::transport().to_bytes();
        }
        Self {
            uid,
            blocks,
            slots:          [None; KEY_SLOTS],
            session:        None,
            connected:      false,
            reader_present: true,
            card_present:   true,
            reject_inline:  false,
            dropped_writes: Vec::new(),
            refused_auth:   Vec::new(),
            leave_after:    None,
            stats:          SimStats::default(),
        }
    }

    /// A tag as left by a previous provisioning: record in blocks 4–6 and
    /// sector 1 locked with the UID-derived key.
    pub fn provisioned(
        uid:    TagUid,
        keys:   &CodecKeys,
        record: &SpoolRecord,
    ) -> Result<Self, ProvisionError> {
        let ascii  = record.encode()?;
        let blocks = keys.payload_codec().encrypt(ascii.as_bytes())?;
        let key    = keys.deriver().derive(&uid);

        let mut card = Self::blank(uid);
        for (block, data) in PAYLOAD_BLOCKS.iter().zip(blocks) {
            card.blocks[*block as usize] = data;
        }
        card.blocks[TRAILER_BLOCK as usize] = SectorTrailer::new(key, key).to_bytes();
        Ok(card)
    }

    /// No reader attached at all.
    pub fn unplugged() -> Self {
        let mut card = Self::blank(TagUid::new([0; 4]));
        card.reader_present = false;
        card
    }

    /// Reader that refuses keys carried inside the authenticate command.
    pub fn reject_inline_keys(mut self) -> Self {
        self.reject_inline = true;
        self
    }

    /// Acknowledge writes to `block` without storing them.
    pub fn drop_writes_to(mut self, block: u8) -> Self {
        self.dropped_writes.push(block);
        self
    }

    /// Refuse `key` (either type) when authenticating `block`, even where
    /// the sector trailer holds it.
    pub fn refuse_auth_on(mut self, block: u8, key: SectorKey) -> Self {
        self.refused_auth.push((block, key));
        self
    }

    /// The card leaves the field after answering `commands` more commands.
    pub fn leave_field_after(mut self, commands: usize) -> Self {
        self.leave_after = Some(commands);
        self
    }

    pub fn with_sector_keys(mut self, sector: usize, key_a: SectorKey, key_b: SectorKey) -> Self {
        assert!(sector < SECTORS, "sector {sector} out of range (card has {SECTORS})");
        let idx = trailer_index(sector);
        let mut trailer = SectorTrailer::from_bytes(&self.blocks[idx]);
        trailer.key_a = key_a;
        trailer.key_b = key_b;
        self.blocks[idx] = trailer.to_bytes();
        self
    }

    pub fn with_block(mut self, block: u8, data: RawBlock) -> Self {
        assert!((block as usize) < TOTAL_BLOCKS, "block {block} out of range (card has {TOTAL_BLOCKS})");
        self.blocks[block as usize] = data;
        self
    }

    // ── Inspection ───────────────────────────────────────────────────────────

    pub fn uid(&self) -> TagUid { self.uid }

    /// Raw block contents, bypassing authentication.
    pub fn block(&self, block: u8) -> Option<RawBlock> { self.blocks.get(block as usize).copied() }

    pub fn trailer(&self, sector: usize) -> Option<SectorTrailer> {
        (sector < SECTORS).then(|| SectorTrailer::from_bytes(&self.blocks[trailer_index(sector)]))
    }

    pub fn stats(&self) -> &SimStats { &self.stats }

    pub fn is_connected(&self) -> bool { self.connected }

    /// Take the card out of the field; subsequent commands fail.
    pub fn remove_card(&mut self) { self.card_present = false; }

    // ── Image ────────────────────────────────────────────────────────────────

    pub fn to_image(&self) -> SimImage {
        SimImage {
            uid:    self.uid.to_string(),
            blocks: self.blocks.iter().map(hex::encode_upper).collect(),
        }
    }

    pub fn from_image(image: &SimImage) -> Result<Self, CryptoError> {
        let uid: TagUid = image.uid.parse()?;
        if image.blocks.len() != TOTAL_BLOCKS {
            return Err(CryptoError::InvalidLength {
                expected: TOTAL_BLOCKS,
                actual:   image.blocks.len(),
            });
        }
        let mut card = Self::blank(uid);
        for (slot, text) in card.blocks.iter_mut().zip(&image.blocks) {
            let bytes = hex::decode(text.trim())
                .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
            *slot = bytes.as_slice().try_into().map_err(|_| CryptoError::InvalidLength {
                expected: BLOCK_SIZE,
                actual:   bytes.len(),
            })?;
        }
        Ok(card)
    }

    // ── Command handling ─────────────────────────────────────────────────────

    fn sector_key(&self, sector: usize, key_type: KeyType) -> SectorKey {
        let trailer = SectorTrailer::from_bytes(&self.blocks[trailer_index(sector)]);
        match key_type {
            KeyType::A => trailer.key_a,
            KeyType::B => trailer.key_b,
        }
    }

    fn authenticate(&mut self, block: u8, key_type: KeyType, key: KeyRef) -> Vec<u8> {
        self.stats.auth_commands += 1;
        self.session = None;

        let block = block as usize;
        if block >= TOTAL_BLOCKS {
            return Response::status_only(SW_AUTH_FAILED);
        }
        let presented = match key {
            KeyRef::Inline(_) if self.reject_inline => return Response::status_only(SW_UNSUPPORTED),
            KeyRef::Inline(k) => k,
            KeyRef::Slot(s) => match self.slots.get(s as usize).copied().flatten() {
                Some(k) => k,
                None    => return Response::status_only(SW_AUTH_FAILED),
            },
        };

        if self.refused_auth.contains(&(block as u8, presented)) {
            return Response::status_only(SW_AUTH_FAILED);
        }
        let sector = block / BLOCKS_PER_SECTOR;
        if presented == self.sector_key(sector, key_type) {
            self.session = Some(sector);
            Response::ok(&[])
        } else {
            Response::status_only(SW_AUTH_FAILED)
        }
    }

    fn read(&mut self, block: u8) -> Vec<u8> {
        self.stats.reads += 1;
        let idx = block as usize;
        if idx >= TOTAL_BLOCKS || self.session != Some(idx / BLOCKS_PER_SECTOR) {
            return Response::status_only(SW_SECURITY);
        }
        let mut data = self.blocks[idx];
        if is_trailer(idx) {
            data[..KEY_SIZE].fill(0);
        }
        Response::ok(&data)
    }

    fn update(&mut self, block: u8, data: RawBlock) -> Vec<u8> {
        let idx = block as usize;
        if idx == 0 || idx >= TOTAL_BLOCKS || self.session != Some(idx / BLOCKS_PER_SECTOR) {
            return Response::status_only(SW_SECURITY);
        }
        if is_trailer(idx) && !SectorTrailer::from_bytes(&data).access_bits_consistent() {
            return Response::status_only(SW_SECURITY);
        }
        if self.dropped_writes.contains(&block) {
            trace!(block, "write acknowledged and dropped");
            return Response::ok(&[]);
        }
        self.blocks[idx] = data;
        self.stats.writes.push(block);
        Response::ok(&[])
    }
}

impl CardTransport for SimulatedCard {
    fn connect(&mut self) -> Result<(), TransportError> {
        if !self.reader_present {
            return Err(TransportError::NoReaderFound);
        }
        if !self.card_present {
            return Err(TransportError::Connect("no card in field".into()));
        }
        self.connected = true;
        self.session   = None;
        self.stats.connects += 1;
        Ok(())
    }

    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if let Some(left) = self.leave_after.as_mut() {
            if *left == 0 {
                self.card_present = false;
            } else {
                *left -= 1;
            }
        }
        if !self.card_present {
            return Err(TransportError::Transmit("card removed from field".into()));
        }
        trace!(command = %hex::encode_upper(command), "sim <-");
        let response = match Command::parse(command) {
            None => Response::status_only(SW_INS_NOT_FOUND),
            Some(Command::GetUid) => Response::ok(self.uid.as_bytes()),
            Some(Command::LoadKey { slot, key }) => {
                self.stats.load_key_commands += 1;
                match self.slots.get_mut(slot as usize) {
                    Some(s) => {
                        *s = Some(key);
                        Response::ok(&[])
                    }
                    None => Response::status_only(SW_UNSUPPORTED),
                }
            }
            Some(Command::Authenticate { block, key_type, key }) => {
                self.authenticate(block, key_type, key)
            }
            Some(Command::ReadBlock { block }) => self.read(block),
            Some(Command::UpdateBlock { block, data }) => self.update(block, data),
        };
        Ok(response)
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            self.stats.disconnects += 1;
        }
        self.session = None;
    }
}

fn trailer_index(sector: usize) -> usize { sector * BLOCKS_PER_SECTOR + BLOCKS_PER_SECTOR - 1 }

fn is_trailer(block: usize) -> bool { block % BLOCKS_PER_SECTOR == BLOCKS_PER_SECTOR - 1 }

fn manufacturer_block(uid: &TagUid) -> RawBlock {
    let mut block = [0u8; BLOCK_SIZE];
    let u = uid.as_bytes();
    block[..4].copy_from_slice(u);
    block[4] = u[0] ^ u[1] ^ u[2] ^ u[3];
    block[5] = 0x08; // SAK: MIFARE Classic 1K
    block[6] = 0x04; // ATQA
    block
}
