//! Card session: the MIFARE Classic protocol state machine.
//!
//! ```text
//! Disconnected ──open──▶ Connected ──authenticate──▶ Authenticated
//!       ▲                    │                            │
//!       └──────close─────────┴──────── Idle ◀──read/write─┘
//! ```
//!
//! Every block access authenticates again; trust is never carried from one
//! block or sector to the next.  Authentication tries two procedures in a
//! fixed order, see [`AuthProcedure`].

use thiserror::Error;
use tracing::{debug, info};

use crate::apdu::{Command, KeyRef, Response, KEY_SLOT};
use crate::crypto::KeyDeriver;
use crate::tag::{KeyType, RawBlock, SectorKey, TagUid, BLOCK_SIZE, UID_SIZE};
use crate::transport::{CardTransport, TransportError};

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Could not read the tag UID: {0}")]
    UidRead(String),
    #[error("Authentication failed for block {block} with key type {key_type}")]
    AuthFailed { block: u8, key_type: KeyType },
    #[error("Reading block {block} failed (status {status:04X})")]
    ReadFailed { block: u8, status: u16 },
    #[error("Writing block {block} failed (status {status:04X})")]
    WriteFailed { block: u8, status: u16 },
    #[error("No valid key for block {block} among {candidates} candidate(s)")]
    NoValidKey { block: u8, candidates: usize },
    #[error("Card session is not connected")]
    NotConnected,
}

// ── Authentication procedures ────────────────────────────────────────────────

/// How the key reaches the reader during authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum AuthProcedure {
    /// General authenticate with the key bytes carried in the command.
    Inline,
    /// Load the key into reader slot 0, then authenticate referencing it.
    /// Needed for reader/driver combinations that refuse inline keys.
    LoadedSlot,
}

impl AuthProcedure {
    pub const ORDER: [AuthProcedure; 2] = [AuthProcedure::Inline, AuthProcedure::LoadedSlot];
}

// ── Key candidates ───────────────────────────────────────────────────────────

/// Ordered, duplicate-free list of keys to try during a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCandidateList {
    keys: Vec<SectorKey>,
}

impl KeyCandidateList {
    /// Keys commonly found on MIFARE Classic tags, in search order: factory
    /// transport, zero, MAD, NDEF and common vendor transport keys.
    pub const WELL_KNOWN_KEYS: [SectorKey; 10] = [
        SectorKey::DEFAULT,
        SectorKey::ZERO,
        SectorKey::new([0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5]),
        SectorKey::new([0xB0, 0xB1, 0xB2, 0xB3, 0xB4, 0xB5]),
        SectorKey::new([0xD3, 0xF7, 0xD3, 0xF7, 0xD3, 0xF7]),
        SectorKey::new([0x71, 0x4C, 0x5C, 0x88, 0x6E, 0x97]),
        SectorKey::new([0x58, 0x7E, 0xE5, 0xF9, 0x35, 0x0F]),
        SectorKey::new([0xA0, 0x47, 0x8C, 0xC3, 0x90, 0x91]),
        SectorKey::new([0x53, 0x3C, 0xB6, 0xC7, 0x23, 0xF6]),
        SectorKey::new([0x8F, 0xD0, 0xA4, 0xF2, 0x56, 0xE9]),
    ];

    /// Keep the first occurrence of each key.
    pub fn new(keys: impl IntoIterator<Item = SectorKey>) -> Self {
        let mut list = Self { keys: Vec::new() };
        list.extend(keys);
        list
    }

    /// A caller-supplied key, tried alone.
    pub fn explicit(key: SectorKey) -> Self { Self { keys: vec![key] } }

    /// The production order: `explicit` alone if given, otherwise the
    /// UID-derived key followed by [`Self::WELL_KNOWN_KEYS`].
    pub fn canonical(uid: &TagUid, deriver: &KeyDeriver, explicit: Option<SectorKey>) -> Self {
        match explicit {
            Some(key) => Self::explicit(key),
            None => Self::new(std::iter::once(deriver.derive(uid)).chain(Self::WELL_KNOWN_KEYS)),
        }
    }

    /// Append keys after the existing ones.
    pub fn with_extra(mut self, extra: impl IntoIterator<Item = SectorKey>) -> Self {
        self.extend(extra);
        self
    }

    fn extend(&mut self, keys: impl IntoIterator<Item = SectorKey>) {
        for key in keys {
            if !self.keys.contains(&key) {
                self.keys.push(key);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = SectorKey> + '_ { self.keys.iter().copied() }

    pub fn len(&self) -> usize { self.keys.len() }

    pub fn is_empty(&self) -> bool { self.keys.is_empty() }
}

/// Result of a successful key search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyMatch {
    pub key:       SectorKey,
    pub key_type:  KeyType,
    pub procedure: AuthProcedure,
}

// ── TagSession ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Authenticated { block: u8, key_type: KeyType },
    Idle,
}

/// One card connection.  Dropping the session disconnects the card, so every
/// exit path of an operation releases it.
pub struct TagSession<'t, T: CardTransport + ?Sized> {
    transport: &'t mut T,
    state:     SessionState,
    uid:       Option<TagUid>,
    attempts:  usize,
}

impl<'t, T: CardTransport + ?Sized> TagSession<'t, T> {
    /// Connect to the card through `transport`.
    pub fn open(transport: &'t mut T) -> Result<Self, SessionError> {
        if let Err(e) = transport.connect() {
            // Release whatever part of the reader context was acquired.
            transport.disconnect();
            return Err(e.into());
        }
        debug!("card session opened");
        Ok(Self { transport, state: SessionState::Connected, uid: None, attempts: 0 })
    }

    pub fn state(&self) -> SessionState { self.state }

    /// UID read during this session, if any.
    pub fn uid(&self) -> Option<TagUid> { self.uid }

    /// Authentication procedures issued so far.
    pub fn attempts(&self) -> usize { self.attempts }

    fn exchange(&mut self, command: &Command) -> Result<Response, SessionError> {
        if self.state == SessionState::Disconnected {
            return Err(SessionError::NotConnected);
        }
        let raw = self.transport.transmit(&command.to_bytes())?;
        Response::parse(&raw).ok_or_else(|| {
            TransportError::Transmit(format!("truncated response {}", hex::encode_upper(&raw))).into()
        })
    }

    // ── Identification ───────────────────────────────────────────────────────

    pub fn read_uid(&mut self) -> Result<TagUid, SessionError> {
        let resp = self.exchange(&Command::GetUid)?;
        if !resp.is_success() {
            return Err(SessionError::UidRead(format!("status {:04X}", resp.status)));
        }
        if resp.data.len() != UID_SIZE {
            return Err(SessionError::UidRead(format!(
                "expected {UID_SIZE} bytes, got {} ({})",
                resp.data.len(),
                hex::encode_upper(&resp.data),
            )));
        }
        let uid = TagUid::from_slice(&resp.data)
            .map_err(|e| SessionError::UidRead(e.to_string()))?;
        debug!(%uid, "tag UID read");
        self.uid = Some(uid);
        Ok(uid)
    }

    // ── Authentication ───────────────────────────────────────────────────────

    /// Authenticate `block`, trying each [`AuthProcedure`] in order.
    ///
    /// A refused procedure falls through to the next one; only when both are
    /// refused does this return [`SessionError::AuthFailed`].  Transport
    /// errors are fatal.
    pub fn authenticate(
        &mut self,
        block:    u8,
        key_type: KeyType,
        key:      SectorKey,
    ) -> Result<AuthProcedure, SessionError> {
        for procedure in AuthProcedure::ORDER {
            self.attempts += 1;
            let status = self.run_procedure(procedure, block, key_type, key)?;
            if status.is_none() {
                self.state = SessionState::Authenticated { block, key_type };
                debug!(block, %key_type, ?procedure, "authenticated");
                return Ok(procedure);
            }
            debug!(block, %key_type, ?procedure, status = ?status, "authentication refused");
        }
        self.state = SessionState::Idle;
        Err(SessionError::AuthFailed { block, key_type })
    }

    /// `Ok(None)` on success, `Ok(Some(status))` when the card refused.
    fn run_procedure(
        &mut self,
        procedure: AuthProcedure,
        block:     u8,
        key_type:  KeyType,
        key:       SectorKey,
    ) -> Result<Option<u16>, SessionError> {
        let key_ref = match procedure {
            AuthProcedure::Inline => KeyRef::Inline(key),
            AuthProcedure::LoadedSlot => {
                let loaded = self.exchange(&Command::LoadKey { slot: KEY_SLOT, key })?;
                if !loaded.is_success() {
                    return Ok(Some(loaded.status));
                }
                KeyRef::Slot(KEY_SLOT)
            }
        };
        let resp = self.exchange(&Command::Authenticate { block, key_type, key: key_ref })?;
        Ok((!resp.is_success()).then_some(resp.status))
    }

    /// Try every candidate with key type A, then B.  The first key the card
    /// accepts wins.
    pub fn key_search(
        &mut self,
        block:      u8,
        candidates: &KeyCandidateList,
    ) -> Result<KeyMatch, SessionError> {
        self.key_search_typed(block, candidates, &KeyType::BOTH)
    }

    /// Like [`Self::key_search`], restricted to `key_types`.
    pub fn key_search_typed(
        &mut self,
        block:      u8,
        candidates: &KeyCandidateList,
        key_types:  &[KeyType],
    ) -> Result<KeyMatch, SessionError> {
        for key in candidates.iter() {
            for &key_type in key_types {
                match self.authenticate(block, key_type, key) {
                    Ok(procedure) => {
                        info!(block, %key_type, ?procedure, "sector key found");
                        return Ok(KeyMatch { key, key_type, procedure });
                    }
                    Err(SessionError::AuthFailed { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        debug!(block, candidates = candidates.len(), "key search exhausted");
        Err(SessionError::NoValidKey { block, candidates: candidates.len() })
    }

    // ── Block access ─────────────────────────────────────────────────────────

    pub fn read_block(
        &mut self,
        block:    u8,
        key_type: KeyType,
        key:      SectorKey,
    ) -> Result<RawBlock, SessionError> {
        self.authenticate(block, key_type, key)?;
        let resp = self.exchange(&Command::ReadBlock { block })?;
        self.state = SessionState::Idle;
        if !resp.is_success() {
            return Err(SessionError::ReadFailed { block, status: resp.status });
        }
        resp.data.as_slice().try_into().map_err(|_| {
            SessionError::Transport(TransportError::Transmit(format!(
                "short read from block {block}: expected {BLOCK_SIZE} bytes, got {}",
                resp.data.len(),
            )))
        })
    }

    pub fn write_block(
        &mut self,
        block:    u8,
        key_type: KeyType,
        key:      SectorKey,
        data:     &RawBlock,
    ) -> Result<(), SessionError> {
        self.authenticate(block, key_type, key)?;
        let resp = self.exchange(&Command::UpdateBlock { block, data: *data })?;
        self.state = SessionState::Idle;
        if !resp.is_success() {
            return Err(SessionError::WriteFailed { block, status: resp.status });
        }
        debug!(block, bytes = BLOCK_SIZE, "block written");
        Ok(())
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Release the card.  Safe to call more than once.
    pub fn close(&mut self) {
        if self.state != SessionState::Disconnected {
            self.transport.disconnect();
            self.state = SessionState::Disconnected;
            debug!(attempts = self.attempts, "card session closed");
        }
    }
}

impl<T: CardTransport + ?Sized> Drop for TagSession<'_, T> {
    fn drop(&mut self) { self.close(); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CodecKeys;
    use crate::transport::SimulatedCard;

    fn uid() -> TagUid { "C56A083E".parse().unwrap() }

    fn derived() -> SectorKey { CodecKeys::default().deriver().derive(&uid()) }

    #[test]
    fn canonical_order_starts_with_derived_key() {
        let list = KeyCandidateList::canonical(&uid(), &CodecKeys::default().deriver(), None);
        let keys: Vec<_> = list.iter().collect();
        assert_eq!(keys.len(), 11);
        assert_eq!(keys[0].to_string(), "FE7B130D4E70");
        assert_eq!(keys[1], SectorKey::DEFAULT);
        assert_eq!(keys[10].to_string(), "8FD0A4F256E9");
    }

    #[test]
    fn explicit_key_is_tried_alone() {
        let list = KeyCandidateList::canonical(
            &uid(),
            &CodecKeys::default().deriver(),
            Some(SectorKey::ZERO),
        );
        assert_eq!(list.iter().collect::<Vec<_>>(), [SectorKey::ZERO]);
    }

    #[test]
    fn candidates_are_deduplicated_in_order() {
        let list = KeyCandidateList::new([SectorKey::ZERO, SectorKey::DEFAULT, SectorKey::ZERO])
            .with_extra([SectorKey::DEFAULT, derived()]);
        assert_eq!(list.iter().collect::<Vec<_>>(), [SectorKey::ZERO, SectorKey::DEFAULT, derived()]);
    }

    #[test]
    fn reads_uid_and_blank_block() {
        let mut card = SimulatedCard::blank(uid());
        let mut session = TagSession::open(&mut card).unwrap();
        assert_eq!(session.read_uid().unwrap(), uid());
        let data = session.read_block(4, KeyType::A, SectorKey::DEFAULT).unwrap();
        assert_eq!(data, [0u8; BLOCK_SIZE]);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn inline_rejection_falls_back_to_loaded_slot() {
        let mut card = SimulatedCard::blank(uid()).reject_inline_keys();
        let mut session = TagSession::open(&mut card).unwrap();
        let procedure = session.authenticate(4, KeyType::A, SectorKey::DEFAULT).unwrap();
        assert_eq!(procedure, AuthProcedure::LoadedSlot);
        assert_eq!(session.attempts(), 2);
    }

    #[test]
    fn wrong_key_fails_after_both_procedures() {
        let mut card = SimulatedCard::blank(uid());
        let mut session = TagSession::open(&mut card).unwrap();
        assert_eq!(
            session.authenticate(4, KeyType::B, SectorKey::ZERO).unwrap_err(),
            SessionError::AuthFailed { block: 4, key_type: KeyType::B },
        );
        assert_eq!(session.attempts(), 2);
    }

    #[test]
    fn key_search_prefers_type_a_then_b() {
        let key = derived();
        let mut card = SimulatedCard::blank(uid()).with_sector_keys(1, SectorKey::ZERO, key);
        let mut session = TagSession::open(&mut card).unwrap();
        let found = session.key_search(4, &KeyCandidateList::new([key])).unwrap();
        assert_eq!(found.key, key);
        assert_eq!(found.key_type, KeyType::B);
        assert_eq!(found.procedure, AuthProcedure::Inline);
    }

    #[test]
    fn key_search_is_bounded() {
        let key = derived();
        let mut card = SimulatedCard::blank(uid()).with_sector_keys(1, key, key);
        let candidates = KeyCandidateList::new(KeyCandidateList::WELL_KNOWN_KEYS);
        let mut session = TagSession::open(&mut card).unwrap();
        let err = session.key_search(4, &candidates).unwrap_err();
        assert_eq!(err, SessionError::NoValidKey { block: 4, candidates: 10 });
        assert!(session.attempts() <= candidates.len() * 2 * 2);
    }

    #[test]
    fn read_requires_matching_sector() {
        let mut card = SimulatedCard::blank(uid()).with_sector_keys(2, SectorKey::ZERO, SectorKey::ZERO);
        let mut session = TagSession::open(&mut card).unwrap();
        assert!(session.read_block(4, KeyType::A, SectorKey::DEFAULT).is_ok());
        assert!(matches!(
            session.read_block(8, KeyType::A, SectorKey::DEFAULT),
            Err(SessionError::AuthFailed { block: 8, .. })
        ));
    }

    #[test]
    fn write_to_manufacturer_block_fails() {
        let mut card = SimulatedCard::blank(uid());
        let mut session = TagSession::open(&mut card).unwrap();
        assert!(matches!(
            session.write_block(0, KeyType::A, SectorKey::DEFAULT, &[0u8; BLOCK_SIZE]),
            Err(SessionError::WriteFailed { block: 0, .. })
        ));
    }

    #[test]
    fn drop_closes_once() {
        let mut card = SimulatedCard::blank(uid());
        {
            let mut session = TagSession::open(&mut card).unwrap();
            session.read_uid().unwrap();
            session.close();
            assert_eq!(session.read_uid().unwrap_err(), SessionError::NotConnected);
        }
        assert_eq!(card.stats().connects, 1);
        assert_eq!(card.stats().disconnects, 1);
    }

    #[test]
    fn missing_reader_is_reported() {
        let mut card = SimulatedCard::unplugged();
        assert!(matches!(
            TagSession::open(&mut card),
            Err(SessionError::Transport(TransportError::NoReaderFound))
        ));
    }

    #[test]
    fn card_leaving_mid_search_is_fatal() {
        let key = derived();
        let mut card = SimulatedCard::blank(uid())
            .with_sector_keys(1, key, key)
            .leave_field_after(3);
        let mut session = TagSession::open(&mut card).unwrap();
        let err = session
            .key_search(4, &KeyCandidateList::new(KeyCandidateList::WELL_KNOWN_KEYS))
            .unwrap_err();
        assert!(matches!(err, SessionError::Transport(TransportError::Transmit(_))));
        drop(session);
        assert_eq!(card.stats().disconnects, 1);
    }

    /// Accepts every command; block reads answer with two data bytes.
    struct TruncatingReader;

    impl CardTransport for TruncatingReader {
        fn connect(&mut self) -> Result<(), TransportError> { Ok(()) }
        fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
            Ok(match command {
                [0xFF, 0xB0, ..] => vec![0xAB, 0xCD, 0x90, 0x00],
                _ => vec![0x90, 0x00],
            })
        }
        fn disconnect(&mut self) {}
    }

    #[test]
    fn short_read_reports_length_not_status() {
        let mut reader = TruncatingReader;
        let mut session = TagSession::open(&mut reader).unwrap();
        let err = session.read_block(4, KeyType::A, SectorKey::DEFAULT).unwrap_err();
        match &err {
            SessionError::Transport(TransportError::Transmit(msg)) => {
                assert!(msg.contains("block 4"));
                assert!(msg.contains("got 2"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.to_string().contains("9000"));
    }
}
