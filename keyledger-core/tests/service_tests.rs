//! Service Facade Tests
//!
//! Every mutating, cryptographic, grant and verification call must append
//! exactly one audit record, on success and on failure alike.

use keyledger_core::{
    CreateKeyRequest, DecryptRequest, EncryptRequest, ErrorKind, GrantSpec, KmsService,
    MemoryStore,
};
use keyledger_types::{
    ActorContext, AuditAction, AuditRecord, AuditStatus, GrantScope, KeyPurpose, KeyType,
    Operation, Role, VersionState,
};
use std::sync::Arc;

fn admin() -> ActorContext {
    ActorContext::new("ops-admin", Role::Admin, "req-admin")
}

fn app() -> ActorContext {
    ActorContext::new("checkout-svc", Role::App, "req-app")
}

async fn audit_len(kms: &KmsService) -> usize {
    kms.ledger().list().await.unwrap().len()
}

async fn tail(kms: &KmsService) -> AuditRecord {
    kms.ledger().latest().await.unwrap().unwrap()
}

#[tokio::test]
async fn test_successful_operations_record_once() {
    let kms = KmsService::builder(Arc::new(MemoryStore::new())).build();

    let key = kms
        .create_key(
            &admin(),
            CreateKeyRequest::new("checkout", KeyType::SymmetricAead, KeyPurpose::Encryption),
        )
        .await
        .unwrap()
        .key;
    assert_eq!(audit_len(&kms).await, 1);
    let created = tail(&kms).await;
    assert_eq!(created.action, AuditAction::KeyCreate);
    assert_eq!(created.status, AuditStatus::Success);
    assert_eq!(created.key_id.as_deref(), Some(key.id.as_str()));
    assert_eq!(created.key_version, Some(1));
    assert_eq!(created.request_id, "req-admin");

    let sealed = kms
        .encrypt(
            &admin(),
            &EncryptRequest {
                key_id: key.id.clone(),
                plaintext: b"basket".to_vec(),
                aad: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(audit_len(&kms).await, 2);
    assert_eq!(tail(&kms).await.action, AuditAction::Encrypt);

    kms.decrypt(&admin(), &DecryptRequest::for_output(&key.id, &sealed, None))
        .await
        .unwrap();
    assert_eq!(audit_len(&kms).await, 3);

    kms.rotate_key(&admin(), &key.id).await.unwrap();
    let rotated = tail(&kms).await;
    assert_eq!(rotated.action, AuditAction::KeyRotate);
    assert_eq!(rotated.key_version, Some(2));
    assert_eq!(rotated.details["previousVersion"], 1);
    assert_eq!(rotated.details["reason"], "manual");

    kms.set_version_state(&admin(), &key.id, 1, VersionState::Revoked)
        .await
        .unwrap();
    assert_eq!(tail(&kms).await.action, AuditAction::KeyRevoke);

    kms.upsert_grant(
        &admin(),
        "checkout-svc",
        GrantSpec::new(Role::App, GrantScope::key(&key.id), [Operation::Encrypt]),
    )
    .await
    .unwrap();
    assert_eq!(tail(&kms).await.action, AuditAction::GrantCreate);

    kms.upsert_grant(
        &admin(),
        "checkout-svc",
        GrantSpec::new(Role::App, GrantScope::key(&key.id), [Operation::Decrypt]),
    )
    .await
    .unwrap();
    assert_eq!(tail(&kms).await.action, AuditAction::GrantUpdate);
    assert_eq!(audit_len(&kms).await, 7);
}

#[tokio::test]
async fn test_failures_record_once_with_error_kind() {
    let kms = KmsService::builder(Arc::new(MemoryStore::new())).build();
    let key = kms
        .create_key(
            &admin(),
            CreateKeyRequest::new("checkout", KeyType::SymmetricAead, KeyPurpose::Encryption),
        )
        .await
        .unwrap()
        .key;

    // Denied
    let err = kms
        .encrypt(
            &app(),
            &EncryptRequest {
                key_id: key.id.clone(),
                plaintext: b"basket".to_vec(),
                aad: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthzDenied);
    assert_eq!(audit_len(&kms).await, 2);
    let denied = tail(&kms).await;
    assert_eq!(denied.action, AuditAction::Encrypt);
    assert_eq!(denied.status, AuditStatus::Failure);
    assert_eq!(denied.actor, "checkout-svc");
    assert_eq!(denied.details["errorKind"], ErrorKind::AuthzDenied.as_str());

    // Not found
    kms.rotate_key(&admin(), "no-such-key").await.unwrap_err();
    assert_eq!(audit_len(&kms).await, 3);
    let missing = tail(&kms).await;
    assert_eq!(missing.action, AuditAction::KeyRotate);
    assert_eq!(missing.status, AuditStatus::Failure);
    assert_eq!(missing.details["errorKind"], ErrorKind::NotFound.as_str());

    // Invalid transition
    kms.set_version_state(&admin(), &key.id, 1, VersionState::Enabled)
        .await
        .unwrap_err();
    assert_eq!(audit_len(&kms).await, 4);
    assert_eq!(tail(&kms).await.details["errorKind"], ErrorKind::Validation.as_str());

    // Duplicate name
    kms.create_key(
        &admin(),
        CreateKeyRequest::new("checkout", KeyType::SymmetricAead, KeyPurpose::Encryption),
    )
    .await
    .unwrap_err();
    assert_eq!(audit_len(&kms).await, 5);
    let conflict = tail(&kms).await;
    assert_eq!(conflict.action, AuditAction::KeyCreate);
    assert_eq!(conflict.details["name"], "checkout");

    // Grant management by a non-admin
    kms.upsert_grant(
        &app(),
        "checkout-svc",
        GrantSpec::new(Role::App, GrantScope::Any, [Operation::Encrypt]),
    )
    .await
    .unwrap_err();
    assert_eq!(audit_len(&kms).await, 6);
    assert_eq!(tail(&kms).await.action, AuditAction::GrantCreate);

    // Verification by an app
    kms.verify_chain(&app()).await.unwrap_err();
    assert_eq!(audit_len(&kms).await, 7);
    assert_eq!(tail(&kms).await.action, AuditAction::AuditVerify);

    // The failures themselves form a valid chain
    assert!(kms.verify_chain(&admin()).await.unwrap().ok);
}

#[tokio::test]
async fn test_reads_are_not_audited() {
    let kms = KmsService::builder(Arc::new(MemoryStore::new())).build();
    let key = kms
        .create_key(
            &admin(),
            CreateKeyRequest::new("checkout", KeyType::SymmetricAead, KeyPurpose::Encryption),
        )
        .await
        .unwrap()
        .key;

    kms.get_key(&admin(), &key.id).await.unwrap();
    kms.list_keys(&admin()).await.unwrap();
    kms.list_grants(&admin()).await.unwrap();
    kms.list_audit(&admin()).await.unwrap();
    assert_eq!(audit_len(&kms).await, 1);
}

#[tokio::test]
async fn test_metrics_summarize_keys_and_usage() {
    let kms = KmsService::builder(Arc::new(MemoryStore::new())).build();
    let key = kms
        .create_key(
            &admin(),
            CreateKeyRequest::new("checkout", KeyType::SymmetricAead, KeyPurpose::Encryption),
        )
        .await
        .unwrap()
        .key;
    for _ in 0..3 {
        kms.encrypt(
            &admin(),
            &EncryptRequest {
                key_id: key.id.clone(),
                plaintext: b"basket".to_vec(),
                aad: None,
            },
        )
        .await
        .unwrap();
    }
    kms.rotate_key(&admin(), &key.id).await.unwrap();
    kms.verify_chain(&admin()).await.unwrap();

    let metrics = kms.metrics(&admin()).await.unwrap();
    assert_eq!(metrics.keys.total, 1);
    assert_eq!(metrics.keys.total_versions, 2);
    assert_eq!(metrics.usage.encryptions_last_24h, 3);
    assert_eq!(metrics.usage.rotations_last_30d, 1);
    assert_eq!(metrics.audit.failures_last_24h, 0);
    assert_eq!(metrics.audit.last_verification.unwrap().ok, Some(true));
}
