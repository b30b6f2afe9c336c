use cfs_spool::provision::WriteStatus;
use cfs_spool::session::{AuthProcedure, SessionError};
use cfs_spool::trailer::SectorTrailer;
use cfs_spool::{
    CodecKeys, Config, KeyType, ProvisionError, SectorKey, SimulatedCard, SpoolRecord, TagClass,
    TagProvisioner, TagUid, TransportError, WriteOptions,
};
use std::io::Write;
use tempfile::NamedTempFile;

const FIXTURE_CIPHER: &str = "C8B3AFD3003410A88EED67679FBE4AEB\
                              90077F5D97C24CF6E3D974AE9743D18C\
                              DE87F593DB8A918A3CF47A0FC224FA9C";

fn uid() -> TagUid {
    "C56A083E".parse().unwrap()
}

fn derived() -> SectorKey {
    CodecKeys::default().deriver().derive(&uid())
}

fn cr_pla() -> SpoolRecord {
    SpoolRecord::new("25608", "0276", "04001", "0", "0330", "000042")
        .with_color_hex("#0A0A0")
        .unwrap()
}

fn block_from_hex(hex_block: &str) -> [u8; 16] {
    hex::decode(hex_block).unwrap().try_into().unwrap()
}

#[test]
fn test_write_then_read_blank_tag() {
    let mut prov = TagProvisioner::new(SimulatedCard::blank(uid()));

    let outcome = prov.write_spool(&cr_pla(), &WriteOptions::default(), |_| true).unwrap();
    assert_eq!(outcome.status, WriteStatus::Success);
    assert_eq!(outcome.class, TagClass::Blank);
    assert!(outcome.verified);

    let reading = prov.read_spool().unwrap();
    assert_eq!(reading.uid, uid());
    assert_eq!(reading.record, cr_pla());
    assert_eq!(reading.record.material, "04001");
    assert_eq!(reading.names.material, "CR-PLA");
    assert_eq!(reading.names.supplier, "Creality");
    assert_eq!(reading.key, derived());
    assert_eq!(reading.key_type, KeyType::A);

    let card = prov.into_inner();
    let trailer = card.trailer(1).unwrap();
    assert_eq!(trailer, SectorTrailer::new(derived(), derived()));
    assert_eq!(trailer.key_b.to_string(), "FE7B130D4E70");
    assert_eq!(card.stats().connects, 2);
    assert_eq!(card.stats().disconnects, 2);
}

#[test]
fn test_read_field_fixture() {
    let key = derived();
    let mut card = SimulatedCard::blank(uid()).with_sector_keys(1, key, key);
    for (i, block) in [4u8, 5, 6].into_iter().enumerate() {
        card = card.with_block(block, block_from_hex(&FIXTURE_CIPHER[i * 32..(i + 1) * 32]));
    }

    let reading = TagProvisioner::new(card).read_spool().unwrap();
    assert_eq!(reading.record.date, "AB124");
    assert_eq!(reading.record.color, "0FFFFF");
    assert_eq!(reading.record.serial, "000001");
    assert_eq!(reading.names.material, "Hyper PLA");
    assert_eq!(reading.names.length, "165 m (500 g)");
    assert_eq!(reading.names.date, "AB124 (unrecognised date)");
}

#[test]
fn test_unknown_material_reads_as_passthrough() {
    let mut record = cr_pla();
    record.material = "99999".into();
    let card = SimulatedCard::provisioned(uid(), &CodecKeys::default(), &record).unwrap();
    let reading = TagProvisioner::new(card).read_spool().unwrap();
    assert_eq!(reading.names.material, "99999 (unknown)");
}

#[test]
fn test_rewrite_provisioned_tag() {
    let old = cr_pla();
    let card = SimulatedCard::provisioned(uid(), &CodecKeys::default(), &old).unwrap();
    let mut prov = TagProvisioner::new(card);

    let mut new = old.clone();
    new.serial = "000043".into();
    let outcome = prov.write_spool(&new, &WriteOptions::default(), |_| true).unwrap();
    assert_eq!(outcome.class, TagClass::Provisioned);
    assert!(!outcome.trailer_rewritten);
    assert_eq!(prov.read_spool().unwrap().record.serial, "000043");
}

#[test]
fn test_no_valid_key_is_bounded_and_closes_session() {
    let foreign: SectorKey = "123456789ABC".parse().unwrap();
    let card = SimulatedCard::blank(uid()).with_sector_keys(1, foreign, foreign);
    let mut prov = TagProvisioner::new(card);

    let err = prov.read_spool().unwrap_err();
    assert!(matches!(
        err,
        ProvisionError::Session(SessionError::NoValidKey { block: 4, candidates: 11 })
    ));

    let stats = prov.transport().stats();
    assert!(stats.auth_commands <= 11 * 2 * 2);
    assert_eq!(stats.connects, 1);
    assert_eq!(stats.disconnects, 1);
}

#[test]
fn test_inline_rejecting_reader_uses_loaded_slot() {
    let mut prov = TagProvisioner::new(SimulatedCard::blank(uid()).reject_inline_keys());
    prov.write_spool(&cr_pla(), &WriteOptions::default(), |_| true).unwrap();

    let reading = prov.read_spool().unwrap();
    assert_eq!(reading.procedure, AuthProcedure::LoadedSlot);
    assert_eq!(reading.record, cr_pla());
    assert!(prov.transport().stats().load_key_commands > 0);
}

#[test]
fn test_declined_confirmation_leaves_card_untouched() {
    let mut prov = TagProvisioner::new(SimulatedCard::blank(uid()));
    let before = prov.transport().to_image();

    let err = prov.write_spool(&cr_pla(), &WriteOptions::default(), |plan| {
        assert_eq!(plan.uid, uid());
        assert_eq!(plan.class, TagClass::Blank);
        assert_eq!(plan.blocks.len(), 3);
        false
    }).unwrap_err();
    assert!(matches!(err, ProvisionError::Cancelled));

    let card = prov.into_inner();
    assert_eq!(card.to_image(), before);
    assert!(card.stats().writes.is_empty());
    assert_eq!(card.stats().disconnects, 1);
}

#[test]
fn test_partial_verify_failure_reports_each_block() {
    let card = SimulatedCard::blank(uid()).drop_writes_to(5);
    let mut prov = TagProvisioner::new(card);

    let outcome = prov.write_spool(&cr_pla(), &WriteOptions::default(), |_| true).unwrap();
    assert_eq!(outcome.status, WriteStatus::PartialVerifyFailure);
    assert_eq!(outcome.mismatches.len(), 1);
    let mismatch = &outcome.mismatches[0];
    assert_eq!(mismatch.block, 5);
    assert_eq!(mismatch.actual, Some([0u8; 16]));
    assert!(outcome.trailer_rewritten);
}

#[test]
fn test_card_removed_mid_write() {
    // UID, classify, then block 4 (auth + update); block 5 never arrives.
    let card = SimulatedCard::blank(uid()).leave_field_after(4);
    let mut prov = TagProvisioner::new(card);

    let err = prov.write_spool(&cr_pla(), &WriteOptions::default(), |_| true).unwrap_err();
    assert!(matches!(
        err,
        ProvisionError::Session(SessionError::Transport(TransportError::Transmit(_)))
    ));
    let stats = prov.transport().stats();
    assert_eq!(stats.writes, [4]);
    assert_eq!(stats.disconnects, 1);
}

#[test]
fn test_missing_reader() {
    let mut prov = TagProvisioner::new(SimulatedCard::unplugged());
    assert!(matches!(
        prov.read_spool(),
        Err(ProvisionError::Session(SessionError::Transport(TransportError::NoReaderFound)))
    ));
}

#[test]
fn test_config_extra_candidates() {
    let extra: SectorKey = "A1B2C3D4E5F6".parse().unwrap();
    let card = SimulatedCard::provisioned(uid(), &CodecKeys::default(), &cr_pla())
        .unwrap()
        .with_sector_keys(1, extra, extra);

    let mut plain = TagProvisioner::new(card.clone());
    assert!(plain.read_spool().is_err());

    let mut file = NamedTempFile::new().unwrap();
    write!(file, r#"{{"extra_candidates": ["A1B2C3D4E5F6"]}}"#).unwrap();
    let config = Config::load(file.path()).unwrap();

    let mut prov = TagProvisioner::with_config(card, &config).unwrap();
    let reading = prov.read_spool().unwrap();
    assert_eq!(reading.key, extra);
    assert_eq!(reading.record, cr_pla());
}

#[test]
fn test_substituted_payload_key() {
    let keys = CodecKeys { payload_key: *b"0123456789abcdef", ..CodecKeys::default() };
    let mut prov = TagProvisioner::with_keys(SimulatedCard::blank(uid()), keys.clone());
    prov.write_spool(&cr_pla(), &WriteOptions::default(), |_| true).unwrap();
    assert_eq!(prov.read_spool().unwrap().record, cr_pla());

    // Same sector key, different payload key: the stored blocks differ.
    let vendor = SimulatedCard::provisioned(uid(), &CodecKeys::default(), &cr_pla()).unwrap();
    assert_ne!(prov.transport().block(4), vendor.block(4));
}

#[test]
fn test_image_persists_written_tag() {
    let mut prov = TagProvisioner::new(SimulatedCard::blank(uid()));
    prov.write_spool(&cr_pla(), &WriteOptions::default(), |_| true).unwrap();

    let file = NamedTempFile::new().unwrap();
    std::fs::write(file.path(), serde_json::to_string(&prov.transport().to_image()).unwrap()).unwrap();

    let image = serde_json::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
    let restored = SimulatedCard::from_image(&image).unwrap();
    assert_eq!(TagProvisioner::new(restored).read_spool().unwrap().record, cr_pla());
}
