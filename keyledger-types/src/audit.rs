//! Audit trail records and chain verification results
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
use std::fmt;

use crate::grants::Role;

/// `prev_hash` of the first record in a chain
pub const GENESIS_HASH: &str = "GENESIS";

/// Privileged action recorded in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    KeyCreate,
    KeyRotate,
    KeyRevoke,
    KeyDisable,
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    GrantCreate,
    GrantUpdate,
    AuditVerify,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::KeyCreate => "KEY_CREATE",
            AuditAction::KeyRotate => "KEY_ROTATE",
            AuditAction::KeyRevoke => "KEY_REVOKE",
            AuditAction::KeyDisable => "KEY_DISABLE",
            AuditAction::Encrypt => "ENCRYPT",
            AuditAction::Decrypt => "DECRYPT",
            AuditAction::Sign => "SIGN",
            AuditAction::Verify => "VERIFY",
            AuditAction::GrantCreate => "GRANT_CREATE",
            AuditAction::GrantUpdate => "GRANT_UPDATE",
            AuditAction::AuditVerify => "AUDIT_VERIFY",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Success,
    Failure,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Success => "SUCCESS",
            AuditStatus::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable link of the audit chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: String,
    /// UTC, truncated to whole seconds
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub role: Role,
    pub action: AuditAction,
    pub request_id: String,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_version: Option<u32>,
    pub prev_hash: String,
    pub hash: String,
    pub status: AuditStatus,
}

/// Receipt returned by a notarization service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorReceipt {
    pub tx_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_ref: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

/// Annotation attached to a verification result when anchoring was attempted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AnchorAnnotation {
    Anchored {
        hash: String,
        receipt: AnchorReceipt,
    },
    Failed {
        hash: String,
        error: String,
    },
}

/// Result of walking the audit chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainVerification {
    pub ok: bool,
    /// First record whose linkage (or, in strict mode, hash) failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<String>,
    /// Records whose hash matched a legacy canonicalization
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub legacy: Vec<String>,
    /// Records whose hash matched nothing while linkage held (tolerant mode)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unverified: Vec<String>,
    pub records_checked: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<AnchorAnnotation>,
}
