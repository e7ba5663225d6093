//! Versioned snapshot codec for [`EntityRecord`].
//!
//! Layout: magic `ESNP`, `u32` schema version, then the fields of every schema
//! version up to the stored one, in declaration order. Collections carry a `u32`
//! element count; sanction entries are additionally framed by their byte length
//! so a single bad entry can be skipped without losing alignment.
//!
//! Version history:
//! - 1: balance, experience, capabilities, sanctions
//! - 2: permissions, statistics
//! - 3: feature levels, feature flags, last seen
//!
//! Timestamps are stored as unix milliseconds.

pub mod wire;

use crate::core::{EntityRecord, FieldDecodeError, Result, SanctionEntry, SanctionKind, StateError};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{Level, event};
use wire::{WireError, WireReader, WireWriter, utf8};

pub const SNAPSHOT_MAGIC: &[u8; 4] = b"ESNP";
pub const CURRENT_SCHEMA_VERSION: u32 = 3;
pub const MIN_SCHEMA_VERSION: u32 = 1;
pub const MAX_STRING_LEN: usize = 64 * 1024;

const HEADER_LEN: usize = 8;

/// Result of decoding a readable snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub record: EntityRecord,
    /// Schema version found in the snapshot header.
    pub version: u32,
    /// Entries dropped because they could not be read.
    pub dropped: Vec<FieldDecodeError>,
}

impl Decoded {
    pub fn is_clean(&self) -> bool {
        self.dropped.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PersistenceCodec;

impl PersistenceCodec {
    pub fn new() -> Self {
        Self
    }

    /// Encodes the record at [`CURRENT_SCHEMA_VERSION`].
    pub fn encode(&self, record: &EntityRecord) -> Vec<u8> {
        encode_fields(record, CURRENT_SCHEMA_VERSION)
    }

    /// Encodes the record using the layout of an older schema version.
    ///
    /// Fields introduced after `version` are not written.
    pub fn encode_as(&self, record: &EntityRecord, version: u32) -> Result<Vec<u8>> {
        if !(MIN_SCHEMA_VERSION..=CURRENT_SCHEMA_VERSION).contains(&version) {
            return Err(StateError::EncodeError(format!(
                "unsupported schema version {} (supported {}..={})",
                version, MIN_SCHEMA_VERSION, CURRENT_SCHEMA_VERSION
            )));
        }
        Ok(encode_fields(record, version))
    }

    /// Reads just the schema version from a snapshot header.
    pub fn peek_version(&self, bytes: &[u8]) -> Result<u32> {
        read_header(bytes)
    }

    /// Decodes a snapshot of any supported version.
    ///
    /// Only an unreadable header yields an error; damaged entries are dropped
    /// and listed in [`Decoded::dropped`].
    pub fn decode(&self, bytes: &[u8]) -> Result<Decoded> {
        let version = read_header(bytes)?;
        let mut fields = FieldReader::new(WireReader::new(&bytes[HEADER_LEN..]));
        let mut record = EntityRecord::default();

        if let Some(v) = fields.scalar("balance", |r| r.get_i64()) {
            record.balance = v;
        }
        if let Some(v) = fields.scalar("experience", |r| r.get_u64()) {
            record.experience = v;
        }
        record.capabilities = fields.string_set("capabilities");
        record.sanctions = fields.sanctions("sanctions");

        if version >= 2 {
            record.permissions = fields.string_set("permissions");
            record.statistics = fields.map("statistics", |r| r.get_i64());
        }

        if version >= 3 {
            record.feature_levels = fields.map("feature_levels", |r| r.get_u32());
            record.feature_flags = fields.map("feature_flags", |r| r.get_bool());
            record.last_seen = fields.optional_timestamp("last_seen");
        }

        if !fields.broken && !fields.reader.is_exhausted() {
            event!(
                Level::DEBUG,
                version,
                trailing = fields.reader.remaining(),
                "ignoring trailing snapshot bytes"
            );
        }

        Ok(Decoded {
            record,
            version,
            dropped: fields.dropped,
        })
    }
}

fn read_header(bytes: &[u8]) -> Result<u32> {
    if bytes.len() < HEADER_LEN {
        return Err(StateError::DecodeError(format!(
            "snapshot too short: {} bytes",
            bytes.len()
        )));
    }
    if &bytes[..4] != SNAPSHOT_MAGIC {
        return Err(StateError::DecodeError("bad snapshot magic".to_string()));
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[4..HEADER_LEN]);
    let version = u32::from_le_bytes(raw);
    if !(MIN_SCHEMA_VERSION..=CURRENT_SCHEMA_VERSION).contains(&version) {
        return Err(StateError::DecodeError(format!(
            "unsupported snapshot schema version {}",
            version
        )));
    }
    Ok(version)
}

fn encode_fields(record: &EntityRecord, version: u32) -> Vec<u8> {
    let mut w = WireWriter::with_capacity(256);
    w.put_raw(SNAPSHOT_MAGIC);
    w.put_u32(version);

    w.put_i64(record.balance);
    w.put_u64(record.experience);
    put_string_set(&mut w, "capabilities", &record.capabilities);
    put_sanctions(&mut w, &record.sanctions);

    if version >= 2 {
        put_string_set(&mut w, "permissions", &record.permissions);
        put_map(&mut w, "statistics", &record.statistics, |w, v| w.put_i64(*v));
    }

    if version >= 3 {
        put_map(&mut w, "feature_levels", &record.feature_levels, |w, v| {
            w.put_u32(*v)
        });
        put_map(&mut w, "feature_flags", &record.feature_flags, |w, v| {
            w.put_bool(*v)
        });
        match record.last_seen {
            Some(ts) => {
                w.put_bool(true);
                w.put_i64(ts.timestamp_millis());
            }
            None => w.put_bool(false),
        }
    }

    w.into_bytes()
}

/// Writes count + elements, skipping elements that cannot be encoded.
fn put_string_set(w: &mut WireWriter, field: &'static str, set: &BTreeSet<String>) {
    let mut body = WireWriter::new();
    let mut count = 0u32;
    for (index, value) in set.iter().enumerate() {
        match body.put_str(value, MAX_STRING_LEN) {
            Ok(()) => count += 1,
            Err(err) => log_skipped(field, index, &err.to_string()),
        }
    }
    w.put_u32(count);
    w.put_raw(&body.into_bytes());
}

fn put_map<V>(
    w: &mut WireWriter,
    field: &'static str,
    map: &BTreeMap<String, V>,
    put_value: impl Fn(&mut WireWriter, &V),
) {
    let mut body = WireWriter::new();
    let mut count = 0u32;
    for (index, (key, value)) in map.iter().enumerate() {
        match body.put_str(key, MAX_STRING_LEN) {
            Ok(()) => {
                put_value(&mut body, value);
                count += 1;
            }
            Err(err) => log_skipped(field, index, &err.to_string()),
        }
    }
    w.put_u32(count);
    w.put_raw(&body.into_bytes());
}

fn put_sanctions(w: &mut WireWriter, sanctions: &[SanctionEntry]) {
    let mut body = WireWriter::new();
    let mut count = 0u32;
    for (index, entry) in sanctions.iter().enumerate() {
        match encode_sanction(entry) {
            Ok(frame) => {
                body.put_frame(&frame);
                count += 1;
            }
            Err(reason) => log_skipped("sanctions", index, &reason),
        }
    }
    w.put_u32(count);
    w.put_raw(&body.into_bytes());
}

fn encode_sanction(entry: &SanctionEntry) -> std::result::Result<Vec<u8>, String> {
    if let Some(end) = entry.ends_at {
        if end < entry.started_at {
            return Err("sanction ends before it starts".to_string());
        }
    }

    let mut w = WireWriter::new();
    w.put_u8(entry.kind.tag());
    w.put_str(&entry.reason, MAX_STRING_LEN)
        .map_err(|err| format!("reason: {}", err))?;
    w.put_str(&entry.issuer, MAX_STRING_LEN)
        .map_err(|err| format!("issuer: {}", err))?;
    w.put_i64(entry.started_at.timestamp_millis());
    match entry.ends_at {
        Some(end) => {
            w.put_bool(true);
            w.put_i64(end.timestamp_millis());
        }
        None => w.put_bool(false),
    }
    Ok(w.into_bytes())
}

fn decode_sanction(body: &[u8]) -> std::result::Result<SanctionEntry, String> {
    let mut r = WireReader::new(body);
    let tag = r.get_u8().map_err(|err| err.to_string())?;
    let kind =
        SanctionKind::from_tag(tag).ok_or_else(|| format!("unknown sanction kind tag {}", tag))?;
    let reason = r.get_str().map_err(|err| format!("reason: {}", err))?;
    let issuer = r.get_str().map_err(|err| format!("issuer: {}", err))?;
    let started_at = timestamp(r.get_i64().map_err(|err| err.to_string())?)?;
    let ends_at = if r.get_bool().map_err(|err| err.to_string())? {
        Some(timestamp(r.get_i64().map_err(|err| err.to_string())?)?)
    } else {
        None
    };

    if let Some(end) = ends_at {
        if end < started_at {
            return Err("sanction ends before it starts".to_string());
        }
    }

    Ok(SanctionEntry {
        kind,
        reason,
        issuer,
        started_at,
        ends_at,
    })
}

fn timestamp(ms: i64) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| format!("timestamp {} out of range", ms))
}

fn log_skipped(field: &'static str, index: usize, reason: &str) {
    event!(
        Level::WARN,
        field,
        index,
        reason,
        "skipping entry that cannot be encoded"
    );
}

/// Tracks dropped entries while walking the field stream.
///
/// A truncated stream marks the reader `broken`; every later field keeps its default.
struct FieldReader<'a> {
    reader: WireReader<'a>,
    dropped: Vec<FieldDecodeError>,
    broken: bool,
}

impl<'a> FieldReader<'a> {
    fn new(reader: WireReader<'a>) -> Self {
        Self {
            reader,
            dropped: Vec::new(),
            broken: false,
        }
    }

    fn drop_entry(&mut self, field: &'static str, index: usize, reason: impl Into<String>) {
        let err = FieldDecodeError::new(field, index, reason);
        event!(Level::WARN, error = %err, "dropping unreadable snapshot entry");
        self.dropped.push(err);
    }

    fn fail_stream(&mut self, field: &'static str, index: usize, err: WireError) {
        self.drop_entry(field, index, err.to_string());
        self.broken = true;
    }

    fn scalar<T>(
        &mut self,
        field: &'static str,
        read: impl FnOnce(&mut WireReader<'a>) -> std::result::Result<T, WireError>,
    ) -> Option<T> {
        if self.broken {
            return None;
        }
        match read(&mut self.reader) {
            Ok(value) => Some(value),
            Err(err) => {
                self.fail_stream(field, 0, err);
                None
            }
        }
    }

    fn count(&mut self, field: &'static str) -> Option<usize> {
        self.scalar(field, |r| r.get_u32()).map(|c| c as usize)
    }

    fn string_set(&mut self, field: &'static str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let Some(count) = self.count(field) else {
            return out;
        };
        for index in 0..count {
            match self.reader.get_str_bytes() {
                Ok(bytes) => match utf8(bytes) {
                    Ok(value) => {
                        out.insert(value);
                    }
                    Err(err) => self.drop_entry(field, index, err.to_string()),
                },
                Err(err) => {
                    self.fail_stream(field, index, err);
                    break;
                }
            }
        }
        out
    }

    fn map<V>(
        &mut self,
        field: &'static str,
        read_value: impl Fn(&mut WireReader<'a>) -> std::result::Result<V, WireError>,
    ) -> BTreeMap<String, V> {
        let mut out = BTreeMap::new();
        let Some(count) = self.count(field) else {
            return out;
        };
        for index in 0..count {
            let key = match self.reader.get_str_bytes() {
                Ok(bytes) => utf8(bytes),
                Err(err) => {
                    self.fail_stream(field, index, err);
                    break;
                }
            };
            let value = match read_value(&mut self.reader) {
                Ok(value) => Ok(value),
                Err(err @ WireError::Truncated { .. }) => {
                    self.fail_stream(field, index, err);
                    break;
                }
                Err(err) => Err(err),
            };
            match (key, value) {
                (Ok(key), Ok(value)) => {
                    out.insert(key, value);
                }
                (Err(err), _) | (_, Err(err)) => self.drop_entry(field, index, err.to_string()),
            }
        }
        out
    }

    fn sanctions(&mut self, field: &'static str) -> Vec<SanctionEntry> {
        let mut out = Vec::new();
        let Some(count) = self.count(field) else {
            return out;
        };
        for index in 0..count {
            let body = match self.reader.get_frame() {
                Ok(body) => body,
                Err(err) => {
                    self.fail_stream(field, index, err);
                    break;
                }
            };
            match decode_sanction(body) {
                Ok(entry) => out.push(entry),
                Err(reason) => self.drop_entry(field, index, reason),
            }
        }
        out
    }

    fn optional_timestamp(&mut self, field: &'static str) -> Option<DateTime<Utc>> {
        let present = self.scalar(field, |r| r.get_bool())?;
        if !present {
            return None;
        }
        let ms = self.scalar(field, |r| r.get_i64())?;
        match timestamp(ms) {
            Ok(ts) => Some(ts),
            Err(reason) => {
                self.drop_entry(field, 0, reason);
                None
            }
        }
    }
}
