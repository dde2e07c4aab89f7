//! Envelope backend using a locally held master secret
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


use crate::envelope::{context_bytes, ensure_algorithm, EnvelopeCipher};
use crate::error::{KmsError, KmsResult};
use crate::material::{self, SYMMETRIC_KEY_LEN};
use async_trait::async_trait;
use keyledger_types::{BindingContext, EnvelopeAlgorithm, EnvelopeCiphertext};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Master key for wrapping stored material
type MasterKey = [u8; SYMMETRIC_KEY_LEN];

/// AES-256-GCM wrapping with the binding context as associated data
pub struct LocalEnvelope {
    master_key: MasterKey,
}

impl LocalEnvelope {
    pub fn new(master_key: MasterKey) -> Self {
        Self { master_key }
    }

    /// Derive the master key from a configured secret, or generate a volatile one
    ///
    /// A 64-character hex string is used as the raw key; anything else is
    /// hashed with SHA-256.
    pub fn from_secret(secret: Option<&str>) -> Self {
        Self::new(derive_master_key(secret))
    }
}

fn derive_master_key(secret: Option<&str>) -> MasterKey {
    let mut mk = [0u8; SYMMETRIC_KEY_LEN];

    if let Some(secret) = secret {
        if secret.len() == SYMMETRIC_KEY_LEN * 2 {
            if let Ok(bytes) = hex::decode(secret) {
                mk.copy_from_slice(&bytes);
                return mk;
            }
        }
        mk.copy_from_slice(&Sha256::digest(secret.as_bytes()));
        return mk;
    }

    warn!("No envelope master key configured, generating a volatile one. Wrapped keys will not survive a restart!");
    rand::thread_rng().fill_bytes(&mut mk);
    mk
}

#[async_trait]
impl EnvelopeCipher for LocalEnvelope {
    async fn wrap(&self, material: &[u8], context: &BindingContext) -> KmsResult<EnvelopeCiphertext> {
        let aad = context_bytes(context)?;
        let sealed = material::seal(&self.master_key, material, &aad)?;
        debug!(bytes = material.len(), "Wrapped key material locally");

        Ok(EnvelopeCiphertext::local(
            material::encode_b64(&sealed.ciphertext),
            material::encode_b64(&sealed.nonce),
            material::encode_b64(&sealed.tag),
            context.clone(),
        ))
    }

    async fn unwrap(&self, envelope: &EnvelopeCiphertext) -> KmsResult<Vec<u8>> {
        ensure_algorithm(envelope, EnvelopeAlgorithm::Aes256Gcm)?;

        let (nonce, tag) = match (&envelope.nonce, &envelope.tag) {
            (Some(nonce), Some(tag)) => (nonce, tag),
            _ => {
                return Err(KmsError::Validation(
                    "local envelope is missing nonce or tag".to_string(),
                ))
            }
        };

        let ciphertext = material::decode_b64("envelope ciphertext", &envelope.ciphertext)?;
        let nonce = material::decode_b64("envelope nonce", nonce)?;
        let tag = material::decode_b64("envelope tag", tag)?;
        let aad = context_bytes(&envelope.context)?;

        material::open(&self.master_key, &ciphertext, &nonce, &tag, &aad)
    }

    fn algorithm(&self) -> EnvelopeAlgorithm {
        EnvelopeAlgorithm::Aes256Gcm
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}
