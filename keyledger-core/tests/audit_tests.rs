//! Audit Chain Integration Tests
//!
//! Records are written through a persisted store, the audit log is edited on
//! disk and the chain is verified again after reopening the store.

use keyledger_config::AuditVerifyMode;
use keyledger_core::{CreateKeyRequest, EncryptRequest, KmsService, MemoryStore};
use keyledger_types::{ActorContext, AuditAction, AuditStatus, KeyPurpose, KeyType, Role, GENESIS_HASH};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn admin() -> ActorContext {
    ActorContext::new("ops-admin", Role::Admin, "req-audit")
}

fn auditor() -> ActorContext {
    ActorContext::new("compliance", Role::Auditor, "req-audit")
}

async fn open(dir: &Path, mode: AuditVerifyMode) -> KmsService {
    let store = MemoryStore::open(dir).await.unwrap();
    KmsService::builder(Arc::new(store))
        .verify_mode(mode)
        .build()
}

/// Create a key and encrypt twice: three audit records
async fn populate(kms: &KmsService) {
    let key = kms
        .create_key(
            &admin(),
            CreateKeyRequest::new("ledger", KeyType::SymmetricAead, KeyPurpose::Encryption),
        )
        .await
        .unwrap()
        .key;
    for payload in [b"one".as_slice(), b"two".as_slice()] {
        kms.encrypt(
            &admin(),
            &EncryptRequest {
                key_id: key.id.clone(),
                plaintext: payload.to_vec(),
                aad: None,
            },
        )
        .await
        .unwrap();
    }
}

fn edit_audit_log(dir: &Path, edit: impl FnOnce(&mut Vec<Value>)) {
    let path = dir.join("audit.jsonl");
    let mut audit: Vec<Value> = std::fs::read_to_string(&path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    edit(&mut audit);
    let lines: String = audit.iter().map(|record| format!("{}\n", record)).collect();
    std::fs::write(&path, lines).unwrap();
}

fn id_of(record: &Value) -> String {
    record["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_untouched_chain_verifies() {
    let dir = TempDir::new().unwrap();
    let kms = open(dir.path(), AuditVerifyMode::Strict).await;
    populate(&kms).await;

    let records = kms.list_audit(&auditor()).await.unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].prev_hash, GENESIS_HASH);
    assert_eq!(records[0].action, AuditAction::KeyCreate);

    // Chain survives a reopen
    drop(kms);
    let kms = open(dir.path(), AuditVerifyMode::Strict).await;
    let result = kms.verify_chain(&auditor()).await.unwrap();
    assert!(result.ok);
    assert_eq!(result.records_checked, 3);
    assert!(result.broken_at.is_none());
}

#[tokio::test]
async fn test_mutated_detail_is_reported() {
    let dir = TempDir::new().unwrap();
    populate(&open(dir.path(), AuditVerifyMode::Strict).await).await;

    let mut target = String::new();
    edit_audit_log(dir.path(), |audit| {
        target = id_of(&audit[1]);
        audit[1]["details"]["bytes"] = Value::from(4096);
    });

    let kms = open(dir.path(), AuditVerifyMode::Strict).await;
    let result = kms.verify_chain(&auditor()).await.unwrap();
    assert!(!result.ok);
    assert_eq!(result.broken_at, Some(target));
}

#[tokio::test]
async fn test_mutated_actor_is_reported() {
    let dir = TempDir::new().unwrap();
    populate(&open(dir.path(), AuditVerifyMode::Strict).await).await;

    let mut target = String::new();
    edit_audit_log(dir.path(), |audit| {
        target = id_of(&audit[2]);
        audit[2]["actor"] = Value::from("someone-else");
    });

    let kms = open(dir.path(), AuditVerifyMode::Strict).await;
    let result = kms.verify_chain(&auditor()).await.unwrap();
    assert!(!result.ok);
    assert_eq!(result.broken_at, Some(target));
}

#[tokio::test]
async fn test_deleted_record_breaks_linkage_in_any_mode() {
    let dir = TempDir::new().unwrap();
    populate(&open(dir.path(), AuditVerifyMode::Strict).await).await;

    let mut target = String::new();
    edit_audit_log(dir.path(), |audit| {
        audit.remove(1);
        target = id_of(&audit[1]);
    });

    let kms = open(dir.path(), AuditVerifyMode::Tolerant).await;
    let result = kms.verify_chain(&auditor()).await.unwrap();
    assert!(!result.ok);
    assert_eq!(result.broken_at, Some(target));
}

#[tokio::test]
async fn test_tolerant_mode_lists_unverifiable_record() {
    let dir = TempDir::new().unwrap();
    populate(&open(dir.path(), AuditVerifyMode::Strict).await).await;

    let mut target = String::new();
    edit_audit_log(dir.path(), |audit| {
        target = id_of(&audit[0]);
        audit[0]["details"]["name"] = Value::from("renamed");
    });

    let kms = open(dir.path(), AuditVerifyMode::Tolerant).await;
    let result = kms.verify_chain(&auditor()).await.unwrap();
    assert!(result.ok);
    assert_eq!(result.unverified, vec![target]);
    assert_eq!(result.records_checked, 3);
}

#[tokio::test]
async fn test_verification_is_itself_audited() {
    let dir = TempDir::new().unwrap();
    let kms = open(dir.path(), AuditVerifyMode::Strict).await;
    populate(&kms).await;

    kms.verify_chain(&auditor()).await.unwrap();
    let tail = kms.ledger().latest().await.unwrap().unwrap();
    assert_eq!(tail.action, AuditAction::AuditVerify);
    assert_eq!(tail.status, AuditStatus::Success);
    assert_eq!(tail.actor, "compliance");
    assert_eq!(tail.details["recordsChecked"], 3);

    // The verification record extends the chain
    let result = kms.verify_chain(&auditor()).await.unwrap();
    assert!(result.ok);
    assert_eq!(result.records_checked, 4);
}

#[tokio::test]
async fn test_store_directory_has_single_owner() {
    let dir = TempDir::new().unwrap();
    let api = open(dir.path(), AuditVerifyMode::Strict).await;
    api.create_key(
        &admin(),
        CreateKeyRequest::new("payments", KeyType::SymmetricAead, KeyPurpose::Encryption),
    )
    .await
    .unwrap();

    // A second service on the same directory is refused instead of
    // overwriting the first one's rows
    let err = MemoryStore::open(dir.path()).await.err().unwrap();
    assert!(matches!(err, keyledger_core::KmsError::Configuration(_)));

    drop(api);
    let kms = open(dir.path(), AuditVerifyMode::Strict).await;
    assert_eq!(kms.list_keys(&admin()).await.unwrap().len(), 1);
    let records = kms.list_audit(&auditor()).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].action, AuditAction::KeyCreate);
}
