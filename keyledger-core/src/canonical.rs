//! Canonical audit payloads and their hashes
//!
//! The current form is a JSON object over a fixed field set with keys
//! sorted, null and absent fields dropped (recursively inside `details`)
//! and the timestamp rendered at second resolution as
//! `YYYY-MM-DDTHH:MM:SSZ`. The record hash is
//! `hex(sha256(prev_hash || canonical_json))`.
//!
//! Chains written before these rules were fixed used a positional field
//! order with explicit nulls; [`LEGACY_CANONICALIZATIONS`] lists the forms
//! still accepted by verification.

use crate::error::KmsResult;
use chrono::{DateTime, SubsecRound, Utc};
use keyledger_types::AuditRecord;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub fn truncate_to_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(0)
}

/// Drop nulls inside objects; array positions are kept
fn normalize(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .filter_map(|(k, v)| normalize(v).map(|v| (k.clone(), v)))
                .collect();
            Some(Value::Object(sorted.into_iter().collect()))
        }
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .map(|item| normalize(item).unwrap_or(Value::Null))
                .collect(),
        )),
        other => Some(other.clone()),
    }
}

/// Canonical payload of a record (everything except the two hashes)
pub fn canonical_payload(record: &AuditRecord) -> Value {
    let mut payload: BTreeMap<&str, Value> = BTreeMap::new();
    payload.insert("id", Value::from(record.id.as_str()));
    payload.insert(
        "timestamp",
        Value::from(truncate_to_seconds(record.timestamp).format(TIMESTAMP_FORMAT).to_string()),
    );
    payload.insert("actor", Value::from(record.actor.as_str()));
    payload.insert("role", Value::from(record.role.as_str()));
    payload.insert("action", Value::from(record.action.as_str()));
    payload.insert("requestId", Value::from(record.request_id.as_str()));
    if let Some(details) = normalize(&record.details) {
        payload.insert("details", details);
    }
    if let Some(key_id) = &record.key_id {
        payload.insert("keyId", Value::from(key_id.as_str()));
    }
    if let Some(version) = record.key_version {
        payload.insert("keyVersion", Value::from(version));
    }
    payload.insert("status", Value::from(record.status.as_str()));
    Value::Object(
        payload
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect::<Map<String, Value>>(),
    )
}

fn chain_hash(prev_hash: &str, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Hash `record` would carry when appended after `prev_hash`
pub fn record_hash(prev_hash: &str, record: &AuditRecord) -> KmsResult<String> {
    let payload = serde_json::to_vec(&canonical_payload(record))?;
    Ok(chain_hash(prev_hash, &payload))
}

/// Positional payload with explicit nulls
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LegacyPayload<'a> {
    id: &'a str,
    timestamp: String,
    actor: &'a str,
    role: &'a str,
    action: &'a str,
    request_id: &'a str,
    details: &'a Value,
    key_id: Option<&'a str>,
    key_version: Option<u32>,
    status: &'a str,
}

/// A superseded canonicalization still accepted by chain verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyCanonicalization {
    pub name: &'static str,
    timestamp_format: &'static str,
}

pub const LEGACY_CANONICALIZATIONS: &[LegacyCanonicalization] = &[
    LegacyCanonicalization {
        name: "v1-iso-millis",
        timestamp_format: "%Y-%m-%dT%H:%M:%S%.3fZ",
    },
    LegacyCanonicalization {
        name: "v1-sql-datetime",
        timestamp_format: "%Y-%m-%d %H:%M:%S",
    },
];

impl LegacyCanonicalization {
    pub fn payload(&self, record: &AuditRecord) -> KmsResult<Vec<u8>> {
        let payload = LegacyPayload {
            id: &record.id,
            timestamp: record.timestamp.format(self.timestamp_format).to_string(),
            actor: &record.actor,
            role: record.role.as_str(),
            action: record.action.as_str(),
            request_id: &record.request_id,
            details: &record.details,
            key_id: record.key_id.as_deref(),
            key_version: record.key_version,
            status: record.status.as_str(),
        };
        Ok(serde_json::to_vec(&payload)?)
    }

    pub fn hash(&self, prev_hash: &str, record: &AuditRecord) -> KmsResult<String> {
        Ok(chain_hash(prev_hash, &self.payload(record)?))
    }
}

/// Name of the legacy canonicalization reproducing `record.hash`, if any
pub fn legacy_match(prev_hash: &str, record: &AuditRecord) -> KmsResult<Option<&'static str>> {
    for legacy in LEGACY_CANONICALIZATIONS {
        if legacy.hash(prev_hash, record)? == record.hash {
            return Ok(Some(legacy.name));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use keyledger_types::{AuditAction, AuditStatus, Role, GENESIS_HASH};
    use serde_json::json;

    fn record() -> AuditRecord {
        AuditRecord {
            id: "r1".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 9, 10, 4, 5).unwrap(),
            actor: "svc".to_string(),
            role: Role::App,
            action: AuditAction::Encrypt,
            request_id: "req-1".to_string(),
            details: json!({"version": 1, "note": null, "nested": {"b": 2, "a": null}}),
            key_id: Some("k1".to_string()),
            key_version: None,
            prev_hash: GENESIS_HASH.to_string(),
            hash: String::new(),
            status: AuditStatus::Success,
        }
    }

    #[test]
    fn test_canonical_payload_drops_nulls_and_sorts() {
        let json = serde_json::to_string(&canonical_payload(&record())).unwrap();
        assert_eq!(
            json,
            r#"{"action":"ENCRYPT","actor":"svc","details":{"nested":{"b":2},"version":1},"id":"r1","keyId":"k1","requestId":"req-1","role":"app","status":"SUCCESS","timestamp":"2024-03-09T10:04:05Z"}"#
        );
    }

    #[test]
    fn test_subsecond_precision_does_not_change_hash() {
        let base = record();
        let mut precise = record();
        precise.timestamp = precise.timestamp + chrono::Duration::milliseconds(789);
        assert_eq!(
            record_hash(GENESIS_HASH, &base).unwrap(),
            record_hash(GENESIS_HASH, &precise).unwrap()
        );
    }

    #[test]
    fn test_legacy_forms_are_recognized() {
        let mut rec = record();
        let legacy = &LEGACY_CANONICALIZATIONS[1];
        let payload = String::from_utf8(legacy.payload(&rec).unwrap()).unwrap();
        assert!(payload.starts_with(r#"{"id":"r1","timestamp":"2024-03-09 10:04:05","#));
        assert!(payload.contains(r#""keyVersion":null"#));

        rec.hash = legacy.hash(GENESIS_HASH, &rec).unwrap();
        assert_eq!(legacy_match(GENESIS_HASH, &rec).unwrap(), Some("v1-sql-datetime"));

        rec.hash = "0".repeat(64);
        assert_eq!(legacy_match(GENESIS_HASH, &rec).unwrap(), None);
    }
}
