//! Key and key version definitions
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


use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::envelope::EnvelopeCiphertext;
use crate::error::TypesError;

/// Unique identifier for a key
pub type KeyId = String;

/// Key material shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyType {
    /// 256-bit AES-GCM key
    SymmetricAead,
    /// RSA key pair used for OAEP encryption and PKCS#1 v1.5 signatures
    AsymmetricSignEncrypt,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::SymmetricAead => "SYMMETRIC_AEAD",
            KeyType::AsymmetricSignEncrypt => "ASYMMETRIC_SIGN_ENCRYPT",
        }
    }

    pub fn is_asymmetric(&self) -> bool {
        matches!(self, KeyType::AsymmetricSignEncrypt)
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SYMMETRIC_AEAD" => Ok(KeyType::SymmetricAead),
            "ASYMMETRIC_SIGN_ENCRYPT" => Ok(KeyType::AsymmetricSignEncrypt),
            other => Err(TypesError::InvalidValue {
                field: "key type",
                value: other.to_string(),
            }),
        }
    }
}

/// What a key is allowed to be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyPurpose {
    Encryption,
    Signing,
}

impl KeyPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyPurpose::Encryption => "ENCRYPTION",
            KeyPurpose::Signing => "SIGNING",
        }
    }
}

impl fmt::Display for KeyPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyPurpose {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENCRYPTION" => Ok(KeyPurpose::Encryption),
            "SIGNING" => Ok(KeyPurpose::Signing),
            other => Err(TypesError::InvalidValue {
                field: "key purpose",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle state of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyState {
    Enabled,
    Disabled,
    Revoked,
}

impl KeyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyState::Enabled => "ENABLED",
            KeyState::Disabled => "DISABLED",
            KeyState::Revoked => "REVOKED",
        }
    }
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a single key version
///
/// Transitions only move forward: `Enabled -> Disabled -> Revoked` or
/// `Enabled -> Revoked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VersionState {
    Enabled,
    Disabled,
    Revoked,
}

impl VersionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionState::Enabled => "ENABLED",
            VersionState::Disabled => "DISABLED",
            VersionState::Revoked => "REVOKED",
        }
    }

    /// Whether moving from `self` to `next` is a forward transition
    pub fn can_transition_to(&self, next: VersionState) -> bool {
        matches!(
            (self, next),
            (VersionState::Enabled, VersionState::Disabled)
                | (VersionState::Enabled, VersionState::Revoked)
                | (VersionState::Disabled, VersionState::Revoked)
        )
    }
}

impl fmt::Display for VersionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersionState {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENABLED" => Ok(VersionState::Enabled),
            "DISABLED" => Ok(VersionState::Disabled),
            "REVOKED" => Ok(VersionState::Revoked),
            other => Err(TypesError::InvalidValue {
                field: "version state",
                value: other.to_string(),
            }),
        }
    }
}

/// A managed key. Material lives on its versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Key {
    pub id: KeyId,
    pub name: String,
    #[serde(rename = "type")]
    pub key_type: KeyType,
    pub purpose: KeyPurpose,
    pub state: KeyState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_days: Option<u32>,
    pub grace_period_days: u32,
    /// Version number of the active version; resolved by lookup
    pub current_version: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// One generation of key material
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyVersion {
    pub id: String,
    pub key_id: KeyId,
    pub version: u32,
    pub state: VersionState,
    pub created_at: DateTime<Utc>,
    /// Grace deadline after demotion, or the revocation instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    pub wrapped_material: EnvelopeCiphertext,
    /// SPKI PEM public key, asymmetric keys only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_material: Option<String>,
}

impl KeyVersion {
    /// Whether the grace deadline has passed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.not_after {
            Some(not_after) => now > not_after,
            None => false,
        }
    }
}

/// A key together with every version it has had
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyWithVersions {
    #[serde(flatten)]
    pub key: Key,
    pub versions: Vec<KeyVersion>,
}

impl KeyWithVersions {
    pub fn version(&self, number: u32) -> Option<&KeyVersion> {
        self.versions.iter().find(|v| v.version == number)
    }

    pub fn enabled_versions(&self) -> impl Iterator<Item = &KeyVersion> {
        self.versions
            .iter()
            .filter(|v| v.state == VersionState::Enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_transitions_are_monotonic() {
        use VersionState::*;

        assert!(Enabled.can_transition_to(Disabled));
        assert!(Enabled.can_transition_to(Revoked));
        assert!(Disabled.can_transition_to(Revoked));

        assert!(!Disabled.can_transition_to(Enabled));
        assert!(!Revoked.can_transition_to(Enabled));
        assert!(!Revoked.can_transition_to(Disabled));
        assert!(!Enabled.can_transition_to(Enabled));
    }

    #[test]
    fn test_key_type_wire_names() {
        let json = serde_json::to_string(&KeyType::AsymmetricSignEncrypt).unwrap();
        assert_eq!(json, "\"ASYMMETRIC_SIGN_ENCRYPT\"");
        assert_eq!(
            "SYMMETRIC_AEAD".parse::<KeyType>().unwrap(),
            KeyType::SymmetricAead
        );
        assert!("AES256_GCM".parse::<KeyType>().is_err());
    }

    #[test]
    fn test_expiry_is_strictly_after_deadline() {
        let deadline = Utc::now();
        let version = KeyVersion {
            id: "v".to_string(),
            key_id: "k".to_string(),
            version: 1,
            state: VersionState::Disabled,
            created_at: deadline,
            not_after: Some(deadline),
            wrapped_material: crate::envelope::EnvelopeCiphertext::local(
                "Y3Q=".to_string(),
                "bm9uY2U=".to_string(),
                "dGFn".to_string(),
                Default::default(),
            ),
            public_material: None,
        };

        assert!(!version.is_expired_at(deadline));
        assert!(version.is_expired_at(deadline + chrono::Duration::seconds(1)));
    }
}
