//! Envelope ciphertext shapes
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


use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::keys::KeyType;

/// Context authenticated into every wrap. Ordered so its JSON form is stable.
pub type BindingContext = BTreeMap<String, String>;

/// Which backend produced an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeAlgorithm {
    /// AES-256-GCM under the process master secret
    #[serde(rename = "AES-256-GCM")]
    Aes256Gcm,
    /// Wrapped by an external key-protection provider
    #[serde(rename = "EXTERNAL-PROVIDER")]
    ExternalProvider,
}

impl EnvelopeAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeAlgorithm::Aes256Gcm => "AES-256-GCM",
            EnvelopeAlgorithm::ExternalProvider => "EXTERNAL-PROVIDER",
        }
    }
}

/// Wrapped key material as stored on a key version.
///
/// Binary fields are standard base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeCiphertext {
    pub algorithm: EnvelopeAlgorithm,
    pub ciphertext: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub context: BindingContext,
    /// Provider-side key identifier, external provider only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_key_id: Option<String>,
}

impl EnvelopeCiphertext {
    /// Envelope produced by the local AEAD backend
    pub fn local(ciphertext: String, nonce: String, tag: String, context: BindingContext) -> Self {
        Self {
            algorithm: EnvelopeAlgorithm::Aes256Gcm,
            ciphertext,
            nonce: Some(nonce),
            tag: Some(tag),
            context,
            provider_key_id: None,
        }
    }

    /// Envelope produced by an external provider
    pub fn provider(ciphertext: String, provider_key_id: String, context: BindingContext) -> Self {
        Self {
            algorithm: EnvelopeAlgorithm::ExternalProvider,
            ciphertext,
            nonce: None,
            tag: None,
            context,
            provider_key_id: Some(provider_key_id),
        }
    }
}

/// Binding context for the material of `key_id` at `version`
pub fn binding_context(key_id: &str, version: u32, key_type: KeyType) -> BindingContext {
    let mut context = BindingContext::new();
    context.insert("keyId".to_string(), key_id.to_string());
    context.insert("version".to_string(), version.to_string());
    context.insert("type".to_string(), key_type.as_str().to_string());
    context
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_context_fields() {
        let context = binding_context("key-1", 3, KeyType::SymmetricAead);
        assert_eq!(context.get("keyId").map(String::as_str), Some("key-1"));
        assert_eq!(context.get("version").map(String::as_str), Some("3"));
        assert_eq!(context.get("type").map(String::as_str), Some("SYMMETRIC_AEAD"));
    }

    #[test]
    fn test_local_envelope_omits_provider_fields() {
        let envelope = EnvelopeCiphertext::local(
            "Y3Q=".to_string(),
            "bm9uY2U=".to_string(),
            "dGFn".to_string(),
            BindingContext::new(),
        );
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["algorithm"], "AES-256-GCM");
        assert!(json.get("providerKeyId").is_none());
    }
}
