//! Durable store interface
//!
//! Everything the engines persist goes through this trait. Implementations
//! must provide:
//! - unique key names and unique (key id, version) pairs
//! - unique (principal, key id) grants
//! - an ordered, append-only audit table with conditional append
//! - atomic multi-row commits for key creation, rotation and state changes
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


use crate::error::KmsResult;
use async_trait::async_trait;
use keyledger_types::{AuditRecord, Grant, Key, KeyVersion, KeyWithVersions};

/// Everything a rotation writes, applied as one unit
#[derive(Debug, Clone)]
pub struct RotationCommit {
    /// Key with `current_version` already bumped
    pub key: Key,
    /// `current_version` the rotation was computed from
    pub expected_current_version: u32,
    /// Previous active version after demotion, if it was still enabled
    pub demoted: Option<KeyVersion>,
    pub inserted: KeyVersion,
}

/// A version state change and the key update it implies
#[derive(Debug, Clone)]
pub struct VersionStateCommit {
    pub version: KeyVersion,
    pub key: Option<Key>,
}

/// Outcome of a grant upsert
#[derive(Debug, Clone, PartialEq)]
pub struct GrantUpsert {
    pub grant: Grant,
    /// `false` when an existing (principal, key id) grant was replaced
    pub created: bool,
}

/// Trait for durable store backends
#[async_trait]
pub trait KmsStore: Send + Sync {
    /// Insert a key and its first version; `Conflict` on duplicate name or id
    async fn insert_key(&self, key: Key, first_version: KeyVersion) -> KmsResult<()>;

    /// Consistent snapshot of a key and all of its versions
    async fn get_key_with_versions(&self, key_id: &str) -> KmsResult<Option<KeyWithVersions>>;

    async fn find_key_by_name(&self, name: &str) -> KmsResult<Option<Key>>;

    async fn list_keys(&self) -> KmsResult<Vec<Key>>;

    async fn list_keys_with_versions(&self) -> KmsResult<Vec<KeyWithVersions>>;

    /// Apply a rotation; `State` if the key's current version moved meanwhile
    async fn commit_rotation(&self, commit: RotationCommit) -> KmsResult<()>;

    async fn commit_version_state(&self, commit: VersionStateCommit) -> KmsResult<()>;

    /// Insert, or replace in full the grant with the same (principal, key id)
    async fn upsert_grant(&self, grant: Grant) -> KmsResult<GrantUpsert>;

    async fn grants_for_principal(&self, principal: &str) -> KmsResult<Vec<Grant>>;

    async fn list_grants(&self) -> KmsResult<Vec<Grant>>;

    async fn last_audit_record(&self) -> KmsResult<Option<AuditRecord>>;

    /// Append only if the current tail hash equals `expected_prev_hash`;
    /// `Integrity` otherwise
    async fn append_audit(&self, record: AuditRecord, expected_prev_hash: &str) -> KmsResult<()>;

    /// All audit records in insertion order
    async fn list_audit(&self) -> KmsResult<Vec<AuditRecord>>;
}
