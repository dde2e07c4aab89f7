//! Encrypt, decrypt, sign and verify against managed key versions
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::clock::Clock;
use crate::envelope::EnvelopeCipher;
use crate::error::{KmsError, KmsResult};
use crate::material;
use crate::registry::KeyRegistry;
use chrono::{DateTime, Utc};
use keyledger_types::{
    binding_context, Key, KeyId, KeyPurpose, KeyType, KeyVersion, VersionState,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Caller-supplied associated data
pub type Aad = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptRequest {
    pub key_id: KeyId,
    #[serde(with = "crate::codec::base64_bytes")]
    pub plaintext: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aad: Option<Aad>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptOutput {
    pub version: u32,
    pub key_type: KeyType,
    /// Base64
    pub ciphertext: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptRequest {
    pub key_id: KeyId,
    /// Base64
    pub ciphertext: String,
    /// Active version when absent
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub aad: Option<Aad>,
}

impl DecryptRequest {
    /// Request that reverses `output` under the same associated data
    pub fn for_output(key_id: impl Into<KeyId>, output: &EncryptOutput, aad: Option<Aad>) -> Self {
        Self {
            key_id: key_id.into(),
            ciphertext: output.ciphertext.clone(),
            version: Some(output.version),
            nonce: output.nonce.clone(),
            tag: output.tag.clone(),
            aad,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptOutput {
    pub version: u32,
    #[serde(with = "crate::codec::base64_bytes")]
    pub plaintext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequest {
    pub key_id: KeyId,
    #[serde(with = "crate::codec::base64_bytes")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub version: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignOutput {
    pub version: u32,
    /// Base64
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub key_id: KeyId,
    #[serde(with = "crate::codec::base64_bytes")]
    pub payload: Vec<u8>,
    /// Base64
    pub signature: String,
    #[serde(default)]
    pub version: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOutput {
    pub version: u32,
    pub valid: bool,
}

/// Refuse revoked versions and disabled ones past their grace deadline
pub fn ensure_usable(version: &KeyVersion, now: DateTime<Utc>) -> KmsResult<()> {
    match version.state {
        VersionState::Revoked => Err(KmsError::State(format!(
            "version {} of key {} is revoked",
            version.version, version.key_id
        ))),
        VersionState::Disabled if version.is_expired_at(now) => Err(KmsError::State(format!(
            "grace window of version {} of key {} has expired",
            version.version, version.key_id
        ))),
        _ => Ok(()),
    }
}

/// Associated data for a symmetric operation: the caller's entries plus
/// `keyId` and `version`, which always win
fn associated_data(key_id: &str, version: u32, aad: Option<&Aad>) -> KmsResult<Vec<u8>> {
    let mut data: BTreeMap<String, Value> = aad
        .into_iter()
        .flatten()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    data.insert("keyId".to_string(), Value::String(key_id.to_string()));
    data.insert("version".to_string(), Value::from(version));
    Ok(serde_json::to_vec(&data)?)
}

fn ensure_purpose(key: &Key, purpose: KeyPurpose) -> KmsResult<()> {
    if key.purpose != purpose {
        return Err(KmsError::Validation(format!(
            "key {} has purpose {}, {} required",
            key.id,
            key.purpose.as_str(),
            purpose.as_str()
        )));
    }
    Ok(())
}

fn ensure_signing_key(key: &Key) -> KmsResult<()> {
    ensure_purpose(key, KeyPurpose::Signing)?;
    if !key.key_type.is_asymmetric() {
        return Err(KmsError::Validation(format!(
            "key {} is not an asymmetric key",
            key.id
        )));
    }
    Ok(())
}

fn public_pem(version: &KeyVersion) -> KmsResult<&str> {
    version.public_material.as_deref().ok_or_else(|| {
        KmsError::Integrity(format!(
            "version {} of key {} has no public material",
            version.version, version.key_id
        ))
    })
}

pub struct CryptoEngine {
    registry: Arc<KeyRegistry>,
    envelope: Arc<dyn EnvelopeCipher>,
    clock: Arc<dyn Clock>,
}

impl CryptoEngine {
    pub fn new(registry: Arc<KeyRegistry>, envelope: Arc<dyn EnvelopeCipher>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            envelope,
            clock,
        }
    }

    /// Unwrap the material of `version`, checking it was bound to this key
    async fn unwrap_material(&self, key: &Key, version: &KeyVersion) -> KmsResult<Vec<u8>> {
        let expected = binding_context(&key.id, version.version, key.key_type);
        if version.wrapped_material.context != expected {
            return Err(KmsError::Integrity(format!(
                "wrapped material of version {} is not bound to key {}",
                version.version, key.id
            )));
        }
        self.envelope.unwrap(&version.wrapped_material).await
    }

    /// Usable key and version for a decrypt/sign/verify
    async fn usable_version(&self, key_id: &str, version: Option<u32>) -> KmsResult<(Key, KeyVersion)> {
        let (key, version) = self.registry.resolve_version(key_id, version).await?;
        ensure_usable(&version, self.clock.now())?;
        Ok((key, version))
    }

    pub async fn encrypt(&self, request: &EncryptRequest) -> KmsResult<EncryptOutput> {
        let (key, version) = self.registry.get_active_version(&request.key_id).await?;
        ensure_purpose(&key, KeyPurpose::Encryption)?;

        let output = match key.key_type {
            KeyType::SymmetricAead => {
                let secret = self.unwrap_material(&key, &version).await?;
                let aad = associated_data(&key.id, version.version, request.aad.as_ref())?;
                let sealed = material::seal(&secret, &request.plaintext, &aad)?;
                EncryptOutput {
                    version: version.version,
                    key_type: key.key_type,
                    ciphertext: material::encode_b64(&sealed.ciphertext),
                    nonce: Some(material::encode_b64(&sealed.nonce)),
                    tag: Some(material::encode_b64(&sealed.tag)),
                }
            }
            KeyType::AsymmetricSignEncrypt => {
                let ciphertext = material::rsa_encrypt(public_pem(&version)?, &request.plaintext)?;
                EncryptOutput {
                    version: version.version,
                    key_type: key.key_type,
                    ciphertext: material::encode_b64(&ciphertext),
                    nonce: None,
                    tag: None,
                }
            }
        };

        debug!(key_id = %key.id, version = output.version, "Encrypted payload");
        Ok(output)
    }

    pub async fn decrypt(&self, request: &DecryptRequest) -> KmsResult<DecryptOutput> {
        let (key, version) = self.usable_version(&request.key_id, request.version).await?;
        ensure_purpose(&key, KeyPurpose::Encryption)?;
        let ciphertext = material::decode_b64("ciphertext", &request.ciphertext)?;

        let plaintext = match key.key_type {
            KeyType::SymmetricAead => {
                let (nonce, tag) = match (&request.nonce, &request.tag) {
                    (Some(nonce), Some(tag)) => (
                        material::decode_b64("nonce", nonce)?,
                        material::decode_b64("tag", tag)?,
                    ),
                    _ => {
                        return Err(KmsError::Validation(
                            "symmetric decryption requires nonce and tag".to_string(),
                        ))
                    }
                };
                let secret = self.unwrap_material(&key, &version).await?;
                let aad = associated_data(&key.id, version.version, request.aad.as_ref())?;
                material::open(&secret, &ciphertext, &nonce, &tag, &aad)?
            }
            KeyType::AsymmetricSignEncrypt => {
                let secret = self.unwrap_material(&key, &version).await?;
                material::rsa_decrypt(&secret, &ciphertext)?
            }
        };

        debug!(key_id = %key.id, version = version.version, "Decrypted payload");
        Ok(DecryptOutput {
            version: version.version,
            plaintext,
        })
    }

    pub async fn sign(&self, request: &SignRequest) -> KmsResult<SignOutput> {
        let (key, version) = self.usable_version(&request.key_id, request.version).await?;
        ensure_signing_key(&key)?;

        let secret = self.unwrap_material(&key, &version).await?;
        let payload = request.payload.clone();
        let signature =
            tokio::task::spawn_blocking(move || material::rsa_sign(&secret, &payload)).await??;

        Ok(SignOutput {
            version: version.version,
            signature: material::encode_b64(&signature),
        })
    }

    pub async fn verify(&self, request: &VerifyRequest) -> KmsResult<VerifyOutput> {
        let (key, version) = self.usable_version(&request.key_id, request.version).await?;
        ensure_signing_key(&key)?;

        let signature = material::decode_b64("signature", &request.signature)?;
        let valid = material::rsa_verify(public_pem(&version)?, &request.payload, &signature)?;

        Ok(VerifyOutput {
            version: version.version,
            valid,
        })
    }
}
