//! Read and write spool records on a tag.
//!
//! [`TagProvisioner`] chains the pieces together:
//!
//! ```text
//! read:  open → UID → key search (block 4) → read 4, 5, 6 → decrypt → decode → names
//! write: encode → encrypt → open → UID → classify → confirm → write 4, 5, 6
//!        → trailer (blank tags only) → verify
//! ```
//!
//! Every operation opens its own [`TagSession`] and the session is released
//! on every exit path, including errors and a declined confirmation.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::SpoolNames;
use crate::config::Config;
use crate::crypto::{CodecKeys, CryptoError};
use crate::record::{RecordError, SpoolRecord};
use crate::session::{AuthProcedure, KeyCandidateList, KeyMatch, SessionError, TagSession};
use crate::tag::{KeyType, RawBlock, SectorKey, TagUid, BLOCK_SIZE, PAYLOAD_BLOCKS, TRAILER_BLOCK};
use crate::trailer::SectorTrailer;
use crate::transport::CardTransport;

const FIRST_BLOCK: u8 = PAYLOAD_BLOCKS[0];

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("Write cancelled, no block was modified")]
    Cancelled,
}

// ── Options and results ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Use this key instead of searching; with a key type, only that type is
    /// tried.
    pub key:      Option<SectorKey>,
    pub key_type: Option<KeyType>,
}

#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    /// Re-read blocks 4–6 after writing and compare.
    pub verify:          bool,
    /// Authenticate with this key instead of classifying the tag.
    pub explicit_key:    Option<(SectorKey, KeyType)>,
    /// Lock blank tags with the UID-derived key.
    pub rewrite_trailer: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self { verify: true, explicit_key: None, rewrite_trailer: true }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SpoolReading {
    pub uid:       TagUid,
    pub key:       SectorKey,
    pub key_type:  KeyType,
    pub procedure: AuthProcedure,
    pub record:    SpoolRecord,
    pub names:     SpoolNames,
}

/// State of sector 1 before a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TagClass {
    /// Still answers to the factory transport key.
    Blank,
    /// Already locked with the UID-derived (or an explicit) key.
    Provisioned,
}

/// What a write is about to do; shown to the operator before anything is
/// modified.
#[derive(Debug, Clone, Serialize)]
pub struct WritePlan {
    pub uid:      TagUid,
    pub class:    TagClass,
    pub key:      SectorKey,
    pub key_type: KeyType,
    /// Payload blocks and their ciphertext, in write order.
    pub blocks:   Vec<(u8, RawBlock)>,
    /// New trailer for block 7, when the tag is blank.
    pub trailer:  Option<RawBlock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WriteStatus {
    Success,
    PartialVerifyFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockMismatch {
    pub block:    u8,
    pub expected: RawBlock,
    /// `None` when the block could not be read back.
    pub actual:   Option<RawBlock>,
    pub error:    Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    pub status:            WriteStatus,
    pub uid:               TagUid,
    pub class:             TagClass,
    pub blocks_written:    Vec<u8>,
    pub trailer_rewritten: bool,
    pub verified:          bool,
    pub mismatches:        Vec<BlockMismatch>,
}

impl WriteOutcome {
    pub fn is_success(&self) -> bool { self.status == WriteStatus::Success }
}

// ── TagProvisioner ───────────────────────────────────────────────────────────

pub struct TagProvisioner<T: CardTransport> {
    transport:        T,
    keys:             CodecKeys,
    extra_candidates: Vec<SectorKey>,
    default_verify:   bool,
}

impl<T: CardTransport> TagProvisioner<T> {
    /// Provisioner with the vendor keys.
    pub fn new(transport: T) -> Self { Self::with_keys(transport, CodecKeys::default()) }

    pub fn with_keys(transport: T, keys: CodecKeys) -> Self {
        Self { transport, keys, extra_candidates: Vec::new(), default_verify: true }
    }

    pub fn with_config(transport: T, config: &Config) -> Result<Self, crate::config::ConfigError> {
        Ok(Self::with_keys(transport, config.codec_keys()?)
            .with_extra_candidates(config.extra_candidates.iter().copied())
            .with_default_verify(config.verify))
    }

    /// Keys appended to the canonical search list when reading.
    pub fn with_extra_candidates(mut self, keys: impl IntoIterator<Item = SectorKey>) -> Self {
        self.extra_candidates.extend(keys);
        self
    }

    fn with_default_verify(mut self, verify: bool) -> Self {
        self.default_verify = verify;
        self
    }

    /// Write options honouring the configured verification default.
    pub fn write_options(&self) -> WriteOptions {
        WriteOptions { verify: self.default_verify, ..WriteOptions::default() }
    }

    pub fn transport(&self) -> &T { &self.transport }

    pub fn into_inner(self) -> T { self.transport }

    // ── Read ─────────────────────────────────────────────────────────────────

    pub fn read_spool(&mut self) -> Result<SpoolReading, ProvisionError> {
        self.read_spool_with(&ReadOptions::default())
    }

    /// Read and decode the record.  Any failure aborts the read; a partial
    /// record is never returned.
    pub fn read_spool_with(&mut self, options: &ReadOptions) -> Result<SpoolReading, ProvisionError> {
        let deriver = self.keys.deriver();
        let codec   = self.keys.payload_codec();

        let mut session = TagSession::open(&mut self.transport)?;
        let uid = session.read_uid()?;

        let candidates = KeyCandidateList::canonical(&uid, &deriver, options.key)
            .with_extra(if options.key.is_some() { Vec::new() } else { self.extra_candidates.clone() });
        let key_types = match (options.key, options.key_type) {
            (Some(_), Some(kt)) => vec![kt],
            _ => KeyType::BOTH.to_vec(),
        };
        let found = session.key_search_typed(FIRST_BLOCK, &candidates, &key_types)?;

        let mut blocks = [[0u8; BLOCK_SIZE]; 3];
        for (slot, &block) in blocks.iter_mut().zip(PAYLOAD_BLOCKS.iter()) {
            *slot = read_with_fallback(&mut session, block, found, &candidates, &key_types)?;
        }
        session.close();

        let plain  = codec.decrypt_blocks(&blocks);
        let record = SpoolRecord::decode(&plain)?;
        let names  = SpoolNames::resolve(&record);
        info!(%uid, material = %names.material, "spool record read");

        Ok(SpoolReading {
            uid,
            key:       found.key,
            key_type:  found.key_type,
            procedure: found.procedure,
            record,
            names,
        })
    }

    // ── Write ────────────────────────────────────────────────────────────────

    /// Encode, encrypt and write `record`.
    ///
    /// `confirm` sees the [`WritePlan`] after the tag has been classified and
    /// before any block is modified; returning `false` aborts with
    /// [`ProvisionError::Cancelled`].
    pub fn write_spool<F>(
        &mut self,
        record:  &SpoolRecord,
        options: &WriteOptions,
        confirm: F,
    ) -> Result<WriteOutcome, ProvisionError>
    where
        F: FnOnce(&WritePlan) -> bool,
    {
        let ascii   = record.encode()?;
        let cipher  = self.keys.payload_codec().encrypt(ascii.as_bytes())?;
        let deriver = self.keys.deriver();

        let mut session = TagSession::open(&mut self.transport)?;
        let uid     = session.read_uid()?;
        let derived = deriver.derive(&uid);

        let (class, found) = match options.explicit_key {
            Some((key, key_type)) => {
                let procedure = session
                    .authenticate(FIRST_BLOCK, key_type, key)
                    .map_err(|e| match e {
                        SessionError::AuthFailed { .. } => {
                            SessionError::NoValidKey { block: FIRST_BLOCK, candidates: 1 }
                        }
                        other => other,
                    })?;
                let class = if key == SectorKey::DEFAULT { TagClass::Blank } else { TagClass::Provisioned };
                (class, KeyMatch { key, key_type, procedure })
            }
            None => classify(&mut session, derived)?,
        };
        debug!(%uid, ?class, key_type = %found.key_type, "tag classified");

        let rewrite_trailer = class == TagClass::Blank && options.rewrite_trailer;
        let plan = WritePlan {
            uid,
            class,
            key:      found.key,
            key_type: found.key_type,
            blocks:   PAYLOAD_BLOCKS.iter().copied().zip(cipher).collect(),
            trailer:  rewrite_trailer.then(|| SectorTrailer::new(derived, derived).to_bytes()),
        };
        if !confirm(&plan) {
            info!(%uid, "write cancelled by operator");
            return Err(ProvisionError::Cancelled);
        }

        let mut blocks_written = Vec::with_capacity(plan.blocks.len());
        for (block, data) in &plan.blocks {
            session.write_block(*block, found.key_type, found.key, data)?;
            blocks_written.push(*block);
        }
        info!(%uid, blocks = ?blocks_written, "payload written");

        if let Some(trailer) = &plan.trailer {
            session.write_block(TRAILER_BLOCK, found.key_type, found.key, trailer)?;
            info!(%uid, "sector trailer rewritten with derived key");
        }

        let mut mismatches = Vec::new();
        if options.verify {
            let verify_key = if plan.trailer.is_some() { derived } else { found.key };
            for (block, expected) in &plan.blocks {
                if let Some(mismatch) =
                    verify_block(&mut session, *block, found.key_type, verify_key, expected)?
                {
                    warn!(block, error = ?mismatch.error, "verification mismatch");
                    mismatches.push(mismatch);
                }
            }
        }
        session.close();

        let status = if mismatches.is_empty() {
            WriteStatus::Success
        } else {
            WriteStatus::PartialVerifyFailure
        };
        Ok(WriteOutcome {
            status,
            uid,
            class,
            blocks_written,
            trailer_rewritten: plan.trailer.is_some(),
            verified:          options.verify,
            mismatches,
        })
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Blank if the transport key opens block 4, provisioned if the derived key
/// does.  Both try key type A before B.
fn classify<T: CardTransport + ?Sized>(
    session: &mut TagSession<'_, T>,
    derived: SectorKey,
) -> Result<(TagClass, KeyMatch), SessionError> {
    let order = [(TagClass::Blank, SectorKey::DEFAULT), (TagClass::Provisioned, derived)];
    for (class, key) in order {
        match session.key_search(FIRST_BLOCK, &KeyCandidateList::explicit(key)) {
            Ok(found) => return Ok((class, found)),
            Err(SessionError::NoValidKey { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(SessionError::NoValidKey { block: FIRST_BLOCK, candidates: order.len() })
}

/// Read `block` with the key found for block 4, searching the same
/// candidates again if the sector refuses it.
fn read_with_fallback<T: CardTransport + ?Sized>(
    session:    &mut TagSession<'_, T>,
    block:      u8,
    found:      KeyMatch,
    candidates: &KeyCandidateList,
    key_types:  &[KeyType],
) -> Result<RawBlock, SessionError> {
    match session.read_block(block, found.key_type, found.key) {
        Err(SessionError::AuthFailed { .. }) => {
            debug!(block, "key found for block 4 refused, searching again");
            let retry = session.key_search_typed(block, candidates, key_types)?;
            session.read_block(block, retry.key_type, retry.key)
        }
        other => other,
    }
}

/// Compare one block against what was written.  Card-level failures become
/// a mismatch; transport failures are returned.
fn verify_block<T: CardTransport + ?Sized>(
    session:  &mut TagSession<'_, T>,
    block:    u8,
    key_type: KeyType,
    key:      SectorKey,
    expected: &RawBlock,
) -> Result<Option<BlockMismatch>, SessionError> {
    let (actual, error) = match session.read_block(block, key_type, key) {
        Ok(data) if &data == expected => return Ok(None),
        Ok(data) => (Some(data), None),
        Err(e @ (SessionError::AuthFailed { .. } | SessionError::ReadFailed { .. })) => {
            (None, Some(e.to_string()))
        }
        Err(e) => return Err(e),
    };
    Ok(Some(BlockMismatch { block, expected: *expected, actual, error }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimulatedCard;

    fn uid() -> TagUid { "C56A083E".parse().unwrap() }

    fn record() -> SpoolRecord {
        SpoolRecord::new("25608", "0276", "04001", "0FF401", "0330", "000042")
    }

    #[test]
    fn write_then_read_blank_tag() {
        let mut prov = TagProvisioner::new(SimulatedCard::blank(uid()));
        let outcome = prov.write_spool(&record(), &WriteOptions::default(), |_| true).unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.class, TagClass::Blank);
        assert!(outcome.trailer_rewritten);
        assert_eq!(outcome.blocks_written, [4, 5, 6]);

        let reading = prov.read_spool().unwrap();
        assert_eq!(reading.record, record());
        assert_eq!(reading.names.material, "CR-PLA");
        assert_eq!(reading.key.to_string(), "FE7B130D4E70");
    }

    #[test]
    fn provisioned_tag_keeps_its_trailer() {
        let keys = CodecKeys::default();
        let card = SimulatedCard::provisioned(uid(), &keys, &record()).unwrap();
        let before = card.trailer(1);
        let mut prov = TagProvisioner::new(card);

        let outcome = prov.write_spool(&record(), &WriteOptions::default(), |plan| {
            plan.class == TagClass::Provisioned && plan.trailer.is_none()
        }).unwrap();
        assert!(outcome.is_success());
        assert!(!outcome.trailer_rewritten);
        assert_eq!(prov.transport().trailer(1), before);
    }

    #[test]
    fn plan_carries_derived_trailer() {
        let mut prov = TagProvisioner::new(SimulatedCard::blank(uid()));
        let mut seen = None;
        let _ = prov.write_spool(&record(), &WriteOptions::default(), |plan| {
            seen = plan.trailer;
            false
        });
        assert_eq!(
            seen.map(hex::encode_upper).as_deref(),
            Some("FE7B130D4E70FF078069FE7B130D4E70"),
        );
    }

    #[test]
    fn invalid_record_never_touches_the_card() {
        let mut bad = record();
        bad.serial = "42".into();
        let mut prov = TagProvisioner::new(SimulatedCard::blank(uid()));
        let err = prov.write_spool(&bad, &WriteOptions::default(), |_| true).unwrap_err();
        assert!(matches!(err, ProvisionError::Record(RecordError::FieldSizeMismatch { .. })));
        assert_eq!(prov.transport().stats().connects, 0);
    }

    #[test]
    fn explicit_key_of_wrong_value_is_no_valid_key() {
        let mut prov = TagProvisioner::new(SimulatedCard::blank(uid()));
        let options = WriteOptions {
            explicit_key: Some((SectorKey::ZERO, KeyType::A)),
            ..WriteOptions::default()
        };
        let err = prov.write_spool(&record(), &options, |_| true).unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Session(SessionError::NoValidKey { block: 4, candidates: 1 })
        ));
        assert!(prov.transport().stats().writes.is_empty());
    }

    #[test]
    fn skipping_verification() {
        let mut prov = TagProvisioner::new(SimulatedCard::blank(uid()).drop_writes_to(6));
        let options = WriteOptions { verify: false, ..WriteOptions::default() };
        let outcome = prov.write_spool(&record(), &options, |_| true).unwrap();
        assert!(outcome.is_success());
        assert!(!outcome.verified);
    }

    #[test]
    fn read_with_explicit_key_and_type() {
        let keys = CodecKeys::default();
        let card = SimulatedCard::provisioned(uid(), &keys, &record()).unwrap();
        let mut prov = TagProvisioner::new(card);
        let derived = keys.deriver().derive(&uid());
        let reading = prov
            .read_spool_with(&ReadOptions { key: Some(derived), key_type: Some(KeyType::B) })
            .unwrap();
        assert_eq!(reading.key_type, KeyType::B);
        assert_eq!(reading.record, record());
    }

    #[test]
    fn later_block_refusing_block_4_key_is_searched_again() {
        let keys = CodecKeys::default();
        let derived = keys.deriver().derive(&uid());
        let card = SimulatedCard::provisioned(uid(), &keys, &record())
            .unwrap()
            .with_sector_keys(1, derived, SectorKey::DEFAULT)
            .refuse_auth_on(5, derived);
        let mut prov = TagProvisioner::new(card);

        let reading = prov.read_spool().unwrap();
        assert_eq!(reading.record, record());
        assert_eq!(reading.key, derived);
        assert_eq!(reading.key_type, KeyType::A);
        assert_eq!(prov.transport().stats().disconnects, 1);
    }

    #[test]
    fn later_block_refusing_every_candidate_aborts_the_read() {
        let keys = CodecKeys::default();
        let derived = keys.deriver().derive(&uid());
        let card = SimulatedCard::provisioned(uid(), &keys, &record())
            .unwrap()
            .refuse_auth_on(6, derived);
        let mut prov = TagProvisioner::new(card);

        let err = prov.read_spool().unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Session(SessionError::NoValidKey { block: 6, .. })
        ));
        assert_eq!(prov.transport().stats().disconnects, 1);
    }

    #[test]
    fn blank_tag_keeps_transport_keys_without_trailer_rewrite() {
        let mut prov = TagProvisioner::new(SimulatedCard::blank(uid()));
        let options = WriteOptions { rewrite_trailer: false, ..WriteOptions::default() };
        let outcome = prov.write_spool(&record(), &options, |plan| plan.trailer.is_none()).unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.class, TagClass::Blank);
        assert!(!outcome.trailer_rewritten);
        assert_eq!(prov.transport().trailer(1), Some(SectorTrailer::transport()));

        let reading = prov.read_spool().unwrap();
        assert_eq!(reading.key, SectorKey::DEFAULT);
        assert_eq!(reading.record, record());
    }
}
