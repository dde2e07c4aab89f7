//! Crypto Engine Integration Tests

use chrono::Duration;
use keyledger_core::material::{decode_b64, encode_b64};
use keyledger_core::{
    Aad, Clock, CreateKeyRequest, DecryptRequest, EncryptRequest, KmsError, KmsService,
    ManualClock, MemoryStore, SignRequest, VerifyRequest,
};
use keyledger_types::{ActorContext, KeyPurpose, KeyType, Role, VersionState};
use std::sync::Arc;

fn admin() -> ActorContext {
    ActorContext::new("ops-admin", Role::Admin, "req-crypto")
}

fn service(clock: Arc<ManualClock>) -> KmsService {
    KmsService::builder(Arc::new(MemoryStore::new()))
        .clock(clock)
        .build()
}

#[tokio::test]
async fn test_payments_key_scenario() {
    let clock = Arc::new(ManualClock::starting_now());
    let kms = service(clock.clone());

    let key = kms
        .create_key(
            &admin(),
            CreateKeyRequest::new("payments", KeyType::SymmetricAead, KeyPurpose::Encryption)
                .with_rotation_period(30)
                .with_grace_period(7),
        )
        .await
        .unwrap()
        .key;

    let sealed = kms
        .encrypt(
            &admin(),
            &EncryptRequest {
                key_id: key.id.clone(),
                plaintext: b"hello".to_vec(),
                aad: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(sealed.version, 1);
    assert_ne!(sealed.ciphertext.as_bytes(), b"hello");
    assert!(sealed.nonce.is_some() && sealed.tag.is_some());

    let rotated_at = clock.now();
    let rotated = kms.rotate_key(&admin(), &key.id).await.unwrap();
    assert_eq!(rotated.key.current_version, 2);
    let v1 = rotated.version(1).unwrap();
    assert_eq!(v1.state, VersionState::Disabled);
    assert_eq!(v1.not_after, Some(rotated_at + Duration::days(7)));

    let request = DecryptRequest::for_output(&key.id, &sealed, None);
    assert_eq!(request.version, Some(1));
    let opened = kms.decrypt(&admin(), &request).await.unwrap();
    assert_eq!(opened.plaintext, b"hello");
    assert_eq!(opened.version, 1);

    kms.set_version_state(&admin(), &key.id, 1, VersionState::Revoked)
        .await
        .unwrap();
    let err = kms.decrypt(&admin(), &request).await.unwrap_err();
    assert!(matches!(err, KmsError::State(_)));
}

#[tokio::test]
async fn test_associated_data_must_match() {
    let kms = service(Arc::new(ManualClock::starting_now()));
    let key = kms
        .create_key(
            &admin(),
            CreateKeyRequest::new("profiles", KeyType::SymmetricAead, KeyPurpose::Encryption),
        )
        .await
        .unwrap()
        .key;

    let aad: Aad = [("tenant".to_string(), "acme".to_string())].into_iter().collect();
    let sealed = kms
        .encrypt(
            &admin(),
            &EncryptRequest {
                key_id: key.id.clone(),
                plaintext: b"address".to_vec(),
                aad: Some(aad.clone()),
            },
        )
        .await
        .unwrap();

    let opened = kms
        .decrypt(&admin(), &DecryptRequest::for_output(&key.id, &sealed, Some(aad)))
        .await
        .unwrap();
    assert_eq!(opened.plaintext, b"address");

    let other: Aad = [("tenant".to_string(), "globex".to_string())].into_iter().collect();
    let err = kms
        .decrypt(&admin(), &DecryptRequest::for_output(&key.id, &sealed, Some(other)))
        .await
        .unwrap_err();
    assert!(matches!(err, KmsError::Validation(_)));

    let err = kms
        .decrypt(&admin(), &DecryptRequest::for_output(&key.id, &sealed, None))
        .await
        .unwrap_err();
    assert!(matches!(err, KmsError::Validation(_)));
}

#[tokio::test]
async fn test_missing_nonce_is_rejected() {
    let kms = service(Arc::new(ManualClock::starting_now()));
    let key = kms
        .create_key(
            &admin(),
            CreateKeyRequest::new("notes", KeyType::SymmetricAead, KeyPurpose::Encryption),
        )
        .await
        .unwrap()
        .key;
    let sealed = kms
        .encrypt(
            &admin(),
            &EncryptRequest {
                key_id: key.id.clone(),
                plaintext: b"memo".to_vec(),
                aad: None,
            },
        )
        .await
        .unwrap();

    let mut request = DecryptRequest::for_output(&key.id, &sealed, None);
    request.nonce = None;
    let err = kms.decrypt(&admin(), &request).await.unwrap_err();
    assert!(matches!(err, KmsError::Validation(_)));
}

#[tokio::test]
async fn test_signing_key_signs_and_verifies() {
    let clock = Arc::new(ManualClock::starting_now());
    let kms = service(clock.clone());
    let key = kms
        .create_key(
            &admin(),
            CreateKeyRequest::new("releases", KeyType::AsymmetricSignEncrypt, KeyPurpose::Signing)
                .with_grace_period(1),
        )
        .await
        .unwrap()
        .key;

    let signed = kms
        .sign(
            &admin(),
            &SignRequest {
                key_id: key.id.clone(),
                payload: b"artifact-sha".to_vec(),
                version: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(signed.version, 1);

    let verify = |payload: &[u8]| VerifyRequest {
        key_id: key.id.clone(),
        payload: payload.to_vec(),
        signature: signed.signature.clone(),
        version: Some(signed.version),
    };
    assert!(kms.verify(&admin(), &verify(b"artifact-sha")).await.unwrap().valid);
    assert!(!kms.verify(&admin(), &verify(b"artifact-shb")).await.unwrap().valid);

    // Any flipped signature bit fails without an error
    let original = decode_b64("signature", &signed.signature).unwrap();
    for bit in [0usize, 7, original.len() * 8 / 2, original.len() * 8 - 1] {
        let mut tampered = original.clone();
        tampered[bit / 8] ^= 1 << (bit % 8);
        let request = VerifyRequest {
            signature: encode_b64(&tampered),
            ..verify(b"artifact-sha")
        };
        assert!(!kms.verify(&admin(), &request).await.unwrap().valid);
    }

    // Signing keys do not encrypt
    let err = kms
        .encrypt(
            &admin(),
            &EncryptRequest {
                key_id: key.id.clone(),
                plaintext: b"x".to_vec(),
                aad: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, KmsError::Validation(_)));

    // Revoked versions do not verify
    kms.set_version_state(&admin(), &key.id, 1, VersionState::Revoked)
        .await
        .unwrap();
    let err = kms.verify(&admin(), &verify(b"artifact-sha")).await.unwrap_err();
    assert!(matches!(err, KmsError::State(_)));
}
