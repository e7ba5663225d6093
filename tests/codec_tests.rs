use chrono::{DateTime, Utc};
use statecache::{
    CURRENT_SCHEMA_VERSION, EntityRecord, PersistenceCodec, SanctionEntry, SanctionKind,
    StateError,
};

fn at(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap()
}

fn full_record() -> EntityRecord {
    let mut record = EntityRecord::new();
    record.balance = -42;
    record.experience = 9_001;
    record.grant("fly");
    record.grant("build");
    record.record_sanction(
        SanctionEntry::new(SanctionKind::Mute, "spam", "mod-1", at(1_700_000_000_123))
            .until(at(1_700_000_600_123)),
    );
    record.record_sanction(SanctionEntry::new(
        SanctionKind::Ban,
        "cheating",
        "admin",
        at(1_700_001_000_000),
    ));
    record.permissions.insert("trade".to_string());
    record.increment_statistic("kills", 12);
    record.increment_statistic("deaths", -3);
    record.feature_levels.insert("mining".to_string(), 4);
    record.feature_flags.insert("night_vision".to_string(), true);
    record.feature_flags.insert("pvp".to_string(), false);
    record.last_seen = Some(at(1_700_002_000_456));
    record
}

#[test]
fn codec_round_trips_every_field_at_current_version() {
    let codec = PersistenceCodec::new();
    let record = full_record();

    let bytes = codec.encode(&record);
    let decoded = codec.decode(&bytes).unwrap();

    assert_eq!(decoded.version, CURRENT_SCHEMA_VERSION);
    assert!(decoded.is_clean());
    assert_eq!(decoded.record, record);
}

#[test]
fn codec_round_trips_default_record() {
    let codec = PersistenceCodec::new();
    let decoded = codec.decode(&codec.encode(&EntityRecord::default())).unwrap();
    assert_eq!(decoded.record, EntityRecord::default());
}

#[test]
fn codec_v1_snapshot_decodes_with_later_fields_defaulted() {
    let codec = PersistenceCodec::new();
    let record = full_record();

    let bytes = codec.encode_as(&record, 1).unwrap();
    let decoded = codec.decode(&bytes).unwrap();

    assert_eq!(decoded.version, 1);
    assert!(decoded.is_clean());
    assert_eq!(decoded.record.balance, record.balance);
    assert_eq!(decoded.record.experience, record.experience);
    assert_eq!(decoded.record.capabilities, record.capabilities);
    assert_eq!(decoded.record.sanctions, record.sanctions);
    assert!(decoded.record.permissions.is_empty());
    assert!(decoded.record.statistics.is_empty());
    assert!(decoded.record.feature_levels.is_empty());
    assert!(decoded.record.feature_flags.is_empty());
    assert_eq!(decoded.record.last_seen, None);
}

#[test]
fn codec_v2_snapshot_decodes_with_v3_fields_defaulted() {
    let codec = PersistenceCodec::new();
    let record = full_record();

    let decoded = codec.decode(&codec.encode_as(&record, 2).unwrap()).unwrap();

    assert_eq!(decoded.version, 2);
    assert_eq!(decoded.record.permissions, record.permissions);
    assert_eq!(decoded.record.statistics, record.statistics);
    assert!(decoded.record.feature_levels.is_empty());
    assert!(decoded.record.feature_flags.is_empty());
    assert_eq!(decoded.record.last_seen, None);

    let mut expected = record.clone();
    expected.feature_levels.clear();
    expected.feature_flags.clear();
    expected.last_seen = None;
    assert_eq!(decoded.record, expected);
}

#[test]
fn codec_drops_only_the_malformed_sanction() {
    let codec = PersistenceCodec::new();
    let mut record = EntityRecord::new();
    for i in 0..10 {
        record.record_sanction(SanctionEntry::new(
            SanctionKind::Warning,
            format!("r{}", i),
            "mod",
            at(1_700_000_000_000 + i),
        ));
    }

    let mut bytes = codec.encode(&record);
    // header 8, balance 8, experience 8, empty capabilities 4, sanction count 4;
    // every frame is 4 length bytes + 23 body bytes with the kind tag first.
    let fifth_tag = 8 + 8 + 8 + 4 + 4 + 27 * 4 + 4;
    assert_eq!(bytes[fifth_tag], SanctionKind::Warning.tag());
    bytes[fifth_tag] = 0xEE;

    let decoded = codec.decode(&bytes).unwrap();

    assert_eq!(decoded.record.sanctions.len(), 9);
    assert_eq!(decoded.dropped.len(), 1);
    assert_eq!(decoded.dropped[0].field, "sanctions");
    assert_eq!(decoded.dropped[0].index, 4);
    assert!(
        decoded
            .record
            .sanctions
            .iter()
            .all(|entry| entry.reason != "r4")
    );
    assert_eq!(decoded.record.sanctions[4].reason, "r5");
}

#[test]
fn codec_rejects_structurally_unreadable_snapshot() {
    let codec = PersistenceCodec::new();

    assert!(matches!(codec.decode(&[]), Err(StateError::DecodeError(_))));
    assert!(matches!(
        codec.decode(b"NOPE\x03\x00\x00\x00"),
        Err(StateError::DecodeError(_))
    ));

    let mut future = codec.encode(&EntityRecord::default());
    future[4..8].copy_from_slice(&(CURRENT_SCHEMA_VERSION + 1).to_le_bytes());
    assert!(matches!(codec.decode(&future), Err(StateError::DecodeError(_))));
}

#[test]
fn codec_skips_unencodable_sanction_and_keeps_the_rest() {
    let codec = PersistenceCodec::new();
    let mut record = EntityRecord::new();
    record.record_sanction(SanctionEntry::new(SanctionKind::Kick, "ok", "mod", at(2_000)));
    record.record_sanction(
        SanctionEntry::new(SanctionKind::Mute, "backwards", "mod", at(5_000)).until(at(1_000)),
    );
    record.balance = 7;

    let decoded = codec.decode(&codec.encode(&record)).unwrap();

    assert!(decoded.is_clean());
    assert_eq!(decoded.record.balance, 7);
    assert_eq!(decoded.record.sanctions.len(), 1);
    assert_eq!(decoded.record.sanctions[0].reason, "ok");
}
