//! Key and key-version lifecycle
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
use crate::store::{KmsStore, RotationCommit, VersionStateCommit};
use chrono::{DateTime, Duration, Utc};
use keyledger_types::{
    binding_context, Key, KeyId, KeyPurpose, KeyState, KeyType, KeyVersion, KeyWithVersions,
    VersionState,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};
use uuid::Uuid;

/// Parameters for a new key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeyRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub key_type: KeyType,
    pub purpose: KeyPurpose,
    #[serde(default)]
    pub rotation_period_days: Option<u32>,
    /// Falls back to the configured default
    #[serde(default)]
    pub grace_period_days: Option<u32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl CreateKeyRequest {
    pub fn new(name: impl Into<String>, key_type: KeyType, purpose: KeyPurpose) -> Self {
        Self {
            name: name.into(),
            key_type,
            purpose,
            rotation_period_days: None,
            grace_period_days: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_rotation_period(mut self, days: u32) -> Self {
        self.rotation_period_days = Some(days);
        self
    }

    pub fn with_grace_period(mut self, days: u32) -> Self {
        self.grace_period_days = Some(days);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Key overdue for rotation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationAlert {
    pub id: KeyId,
    pub name: String,
    pub rotation_period_days: u32,
    pub grace_period_days: u32,
    pub days_since_rotation: i64,
    pub last_rotated_at: DateTime<Utc>,
}

/// Inventory counts over all keys
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySummary {
    pub total: usize,
    pub by_state: BTreeMap<KeyState, usize>,
    pub total_versions: usize,
    /// Most overdue first
    pub rotation_alerts: Vec<RotationAlert>,
}

/// Owns keys and versions and their state machine
pub struct KeyRegistry {
    store: Arc<dyn KmsStore>,
    envelope: Arc<dyn EnvelopeCipher>,
    clock: Arc<dyn Clock>,
    default_grace_days: u32,
    /// One async mutex per key; rotation and state changes of a key are serialized
    key_locks: Mutex<HashMap<KeyId, Arc<tokio::sync::Mutex<()>>>>,
}

fn latest_version(snapshot: &KeyWithVersions) -> Option<&KeyVersion> {
    snapshot.versions.iter().max_by_key(|v| v.version)
}

fn is_due(snapshot: &KeyWithVersions, now: DateTime<Utc>) -> bool {
    let key = &snapshot.key;
    match (key.state, key.rotation_period_days) {
        (KeyState::Enabled, Some(days)) => latest_version(snapshot)
            .is_some_and(|v| v.created_at + Duration::days(i64::from(days)) <= now),
        _ => false,
    }
}

impl KeyRegistry {
    pub fn new(
        store: Arc<dyn KmsStore>,
        envelope: Arc<dyn EnvelopeCipher>,
        clock: Arc<dyn Clock>,
        default_grace_days: u32,
    ) -> Self {
        Self {
            store,
            envelope,
            clock,
            default_grace_days,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Serialize writers on one key and read it under the lock
    ///
    /// Unknown ids fail before a lock entry is created, so the map only
    /// holds keys that exist.
    async fn lock_key(&self, key_id: &str) -> KmsResult<(OwnedMutexGuard<()>, KeyWithVersions)> {
        self.snapshot(key_id).await?;
        let lock = {
            let mut locks = self.key_locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(key_id.to_string()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        let snapshot = self.snapshot(key_id).await?;
        Ok((guard, snapshot))
    }

    async fn snapshot(&self, key_id: &str) -> KmsResult<KeyWithVersions> {
        self.store
            .get_key_with_versions(key_id)
            .await?
            .ok_or_else(|| KmsError::NotFound(format!("key {}", key_id)))
    }

    /// Generate and wrap material for `version` of `key_id`
    async fn new_version(
        &self,
        key_id: &str,
        version: u32,
        key_type: KeyType,
        now: DateTime<Utc>,
    ) -> KmsResult<KeyVersion> {
        let generated = tokio::task::spawn_blocking(move || material::generate(key_type)).await??;
        let context = binding_context(key_id, version, key_type);
        let wrapped = self.envelope.wrap(&generated.secret, &context).await?;

        Ok(KeyVersion {
            id: Uuid::new_v4().to_string(),
            key_id: key_id.to_string(),
            version,
            state: VersionState::Enabled,
            created_at: now,
            not_after: None,
            wrapped_material: wrapped,
            public_material: generated.public_pem,
        })
    }

    /// Create a key with its first version
    pub async fn create_key(&self, request: CreateKeyRequest) -> KmsResult<KeyWithVersions> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(KmsError::Validation("key name must not be empty".to_string()));
        }
        if request.rotation_period_days == Some(0) {
            return Err(KmsError::Validation(
                "rotationPeriodDays must be greater than zero".to_string(),
            ));
        }
        if self.store.find_key_by_name(name).await?.is_some() {
            return Err(KmsError::Conflict(format!("key name {} already exists", name)));
        }

        let now = self.clock.now();
        let key_id = Uuid::new_v4().to_string();
        let first = self.new_version(&key_id, 1, request.key_type, now).await?;

        let key = Key {
            id: key_id.clone(),
            name: name.to_string(),
            key_type: request.key_type,
            purpose: request.purpose,
            state: KeyState::Enabled,
            rotation_period_days: request.rotation_period_days,
            grace_period_days: request.grace_period_days.unwrap_or(self.default_grace_days),
            current_version: 1,
            created_at: now,
            metadata: request.metadata,
        };

        self.store.insert_key(key.clone(), first.clone()).await?;
        info!(key_id = %key_id, name = %key.name, key_type = %key.key_type, "Key created");

        Ok(KeyWithVersions {
            key,
            versions: vec![first],
        })
    }

    /// Rotate to a fresh version, demoting the current one into its grace window
    pub async fn rotate_key(&self, key_id: &str) -> KmsResult<KeyWithVersions> {
        let (_guard, snapshot) = self.lock_key(key_id).await?;
        self.rotate_locked(snapshot).await
    }

    /// Rotate only if the key is still due; `None` when it no longer is
    pub async fn rotate_if_due(&self, key_id: &str) -> KmsResult<Option<KeyWithVersions>> {
        let (_guard, snapshot) = self.lock_key(key_id).await?;
        if !is_due(&snapshot, self.clock.now()) {
            debug!(key_id, "Key no longer due for rotation");
            return Ok(None);
        }
        self.rotate_locked(snapshot).await.map(Some)
    }

    async fn rotate_locked(&self, snapshot: KeyWithVersions) -> KmsResult<KeyWithVersions> {
        let mut key = snapshot.key.clone();
        if key.state != KeyState::Enabled {
            return Err(KmsError::State("key must be ENABLED".to_string()));
        }

        let now = self.clock.now();
        let previous = key.current_version;
        let next = previous + 1;
        let inserted = self.new_version(&key.id, next, key.key_type, now).await?;

        let demoted = snapshot
            .version(previous)
            .filter(|v| v.state == VersionState::Enabled)
            .map(|v| {
                let mut v = v.clone();
                v.state = VersionState::Disabled;
                v.not_after = v
                    .not_after
                    .or(Some(now + Duration::days(i64::from(key.grace_period_days))));
                v
            });

        key.current_version = next;
        self.store
            .commit_rotation(RotationCommit {
                key: key.clone(),
                expected_current_version: previous,
                demoted,
                inserted,
            })
            .await?;

        info!(key_id = %key.id, from = previous, to = next, "Key rotated");
        self.snapshot(&key.id).await
    }

    /// Move a version to DISABLED or REVOKED
    ///
    /// Asking for the state a version is already in is a no-op. Disabling or
    /// revoking the current version disables the key.
    pub async fn set_version_state(
        &self,
        key_id: &str,
        version: u32,
        target: VersionState,
    ) -> KmsResult<KeyWithVersions> {
        if target == VersionState::Enabled {
            return Err(KmsError::Validation(
                "versions can only be set to DISABLED or REVOKED".to_string(),
            ));
        }

        let (_guard, snapshot) = self.lock_key(key_id).await?;
        let mut updated = snapshot
            .version(version)
            .cloned()
            .ok_or_else(|| KmsError::NotFound(format!("version {} of key {}", version, key_id)))?;

        if updated.state == target {
            return Ok(snapshot);
        }
        if !updated.state.can_transition_to(target) {
            return Err(KmsError::State(format!(
                "version {} cannot move from {} to {}",
                version,
                updated.state.as_str(),
                target.as_str()
            )));
        }

        let now = self.clock.now();
        updated.state = target;
        match target {
            VersionState::Revoked => updated.not_after = Some(now),
            _ => {
                let grace = Duration::days(i64::from(snapshot.key.grace_period_days));
                updated.not_after = updated.not_after.or(Some(now + grace));
            }
        }

        let key = (version == snapshot.key.current_version && snapshot.key.state == KeyState::Enabled)
            .then(|| Key {
                state: KeyState::Disabled,
                ..snapshot.key.clone()
            });

        self.store
            .commit_version_state(VersionStateCommit { version: updated, key })
            .await?;

        info!(key_id, version, state = target.as_str(), "Key version state changed");
        self.snapshot(key_id).await
    }

    pub async fn get_key(&self, key_id: &str) -> KmsResult<KeyWithVersions> {
        self.snapshot(key_id).await
    }

    pub async fn list_keys(&self) -> KmsResult<Vec<Key>> {
        self.store.list_keys().await
    }

    /// Current version of an ENABLED key; `State` unless both are ENABLED
    pub async fn get_active_version(&self, key_id: &str) -> KmsResult<(Key, KeyVersion)> {
        let snapshot = self.snapshot(key_id).await?;
        active_version(snapshot)
    }

    /// A version regardless of its state
    pub async fn find_version(&self, key_id: &str, version: u32) -> KmsResult<KeyVersion> {
        let snapshot = self.snapshot(key_id).await?;
        snapshot
            .version(version)
            .cloned()
            .ok_or_else(|| KmsError::NotFound(format!("version {} of key {}", version, key_id)))
    }

    /// Key and version from one snapshot: the active version when `version`
    /// is `None`, otherwise that version regardless of state
    pub async fn resolve_version(
        &self,
        key_id: &str,
        version: Option<u32>,
    ) -> KmsResult<(Key, KeyVersion)> {
        let snapshot = self.snapshot(key_id).await?;
        match version {
            None => active_version(snapshot),
            Some(number) => {
                let found = snapshot.version(number).cloned().ok_or_else(|| {
                    KmsError::NotFound(format!("version {} of key {}", number, key_id))
                })?;
                Ok((snapshot.key, found))
            }
        }
    }

    /// ENABLED keys whose latest version is older than their rotation period
    pub async fn list_due_for_rotation(&self) -> KmsResult<Vec<Key>> {
        let now = self.clock.now();
        Ok(self
            .store
            .list_keys_with_versions()
            .await?
            .into_iter()
            .filter(|snapshot| is_due(snapshot, now))
            .map(|snapshot| snapshot.key)
            .collect())
    }

    pub async fn key_summary(&self) -> KmsResult<KeySummary> {
        let now = self.clock.now();
        let snapshots = self.store.list_keys_with_versions().await?;
        let mut summary = KeySummary {
            total: snapshots.len(),
            ..Default::default()
        };

        for snapshot in &snapshots {
            *summary.by_state.entry(snapshot.key.state).or_default() += 1;
            summary.total_versions += snapshot.versions.len();

            let (Some(period), Some(latest)) =
                (snapshot.key.rotation_period_days, latest_version(snapshot))
            else {
                continue;
            };
            let days_since = (now - latest.created_at).num_days();
            if days_since >= i64::from(period) {
                summary.rotation_alerts.push(RotationAlert {
                    id: snapshot.key.id.clone(),
                    name: snapshot.key.name.clone(),
                    rotation_period_days: period,
                    grace_period_days: snapshot.key.grace_period_days,
                    days_since_rotation: days_since,
                    last_rotated_at: latest.created_at,
                });
            }
        }

        summary
            .rotation_alerts
            .sort_by(|a, b| b.days_since_rotation.cmp(&a.days_since_rotation));
        Ok(summary)
    }
}

fn active_version(snapshot: KeyWithVersions) -> KmsResult<(Key, KeyVersion)> {
    if snapshot.key.state != KeyState::Enabled {
        return Err(KmsError::State(format!("key {} is not ENABLED", snapshot.key.id)));
    }
    let version = snapshot
        .version(snapshot.key.current_version)
        .filter(|v| v.state == VersionState::Enabled)
        .cloned()
        .ok_or_else(|| {
            KmsError::State(format!("key {} has no active version", snapshot.key.id))
        })?;
    Ok((snapshot.key, version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::local_envelope::LocalEnvelope;
    use crate::memory_store::MemoryStore;

    fn registry() -> (KeyRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let registry = KeyRegistry::new(
            Arc::new(MemoryStore::new()),
            Arc::new(LocalEnvelope::from_secret(Some("registry-test"))),
            clock.clone(),
            7,
        );
        (registry, clock)
    }

    fn symmetric(name: &str) -> CreateKeyRequest {
        CreateKeyRequest::new(name, KeyType::SymmetricAead, KeyPurpose::Encryption)
    }

    #[tokio::test]
    async fn test_create_key_starts_at_version_one() {
        let (registry, _) = registry();
        let created = registry.create_key(symmetric("payments")).await.unwrap();

        assert_eq!(created.key.current_version, 1);
        assert_eq!(created.key.grace_period_days, 7);
        assert_eq!(created.versions.len(), 1);
        assert_eq!(created.versions[0].state, VersionState::Enabled);
        assert_eq!(created.versions[0].wrapped_material.context["version"], "1");
    }

    #[tokio::test]
    async fn test_empty_and_duplicate_names() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.create_key(symmetric("  ")).await,
            Err(KmsError::Validation(_))
        ));

        registry.create_key(symmetric("payments")).await.unwrap();
        assert!(matches!(
            registry.create_key(symmetric("payments")).await,
            Err(KmsError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_rotation_keeps_existing_grace_deadline() {
        let (registry, clock) = registry();
        let created = registry.create_key(symmetric("payments")).await.unwrap();
        let id = created.key.id.clone();

        let rotated = registry.rotate_key(&id).await.unwrap();
        let deadline = rotated.version(1).unwrap().not_after.unwrap();
        assert_eq!(deadline, clock.now() + Duration::days(7));
        assert_eq!(rotated.version(2).unwrap().not_after, None);

        clock.advance(Duration::days(1));
        let again = registry.rotate_key(&id).await.unwrap();
        assert_eq!(again.version(1).unwrap().not_after, Some(deadline));
        assert_eq!(
            again.version(2).unwrap().not_after,
            Some(clock.now() + Duration::days(7))
        );
        assert_eq!(again.enabled_versions().count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_key_leaves_no_lock_entry() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.rotate_key("no-such-key").await,
            Err(KmsError::NotFound(_))
        ));
        assert!(matches!(
            registry.rotate_if_due("no-such-key").await,
            Err(KmsError::NotFound(_))
        ));
        assert!(matches!(
            registry
                .set_version_state("no-such-key", 1, VersionState::Revoked)
                .await,
            Err(KmsError::NotFound(_))
        ));
        assert!(registry.key_locks.lock().unwrap().is_empty());

        let id = registry.create_key(symmetric("payments")).await.unwrap().key.id;
        registry.rotate_key(&id).await.unwrap();
        let locks = registry.key_locks.lock().unwrap();
        assert_eq!(locks.len(), 1);
        assert!(locks.contains_key(&id));
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (registry, _) = registry();
        let id = registry.create_key(symmetric("payments")).await.unwrap().key.id;
        registry.rotate_key(&id).await.unwrap();

        // v1 is DISABLED after rotation; same state is a no-op
        let same = registry.set_version_state(&id, 1, VersionState::Disabled).await.unwrap();
        assert_eq!(same.version(1).unwrap().state, VersionState::Disabled);

        let revoked = registry.set_version_state(&id, 1, VersionState::Revoked).await.unwrap();
        assert_eq!(revoked.version(1).unwrap().state, VersionState::Revoked);
        assert_eq!(revoked.key.state, KeyState::Enabled);

        assert!(matches!(
            registry.set_version_state(&id, 1, VersionState::Disabled).await,
            Err(KmsError::State(_))
        ));
        assert!(matches!(
            registry.set_version_state(&id, 2, VersionState::Enabled).await,
            Err(KmsError::Validation(_))
        ));
        assert!(matches!(
            registry.set_version_state(&id, 9, VersionState::Revoked).await,
            Err(KmsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_revoking_current_version_disables_key() {
        let (registry, _) = registry();
        let id = registry.create_key(symmetric("payments")).await.unwrap().key.id;

        let revoked = registry.set_version_state(&id, 1, VersionState::Revoked).await.unwrap();
        assert_eq!(revoked.key.state, KeyState::Disabled);
        assert!(matches!(
            registry.get_active_version(&id).await,
            Err(KmsError::State(_))
        ));
        assert!(matches!(registry.rotate_key(&id).await, Err(KmsError::State(_))));
        assert_eq!(
            registry.find_version(&id, 1).await.unwrap().state,
            VersionState::Revoked
        );
    }

    #[tokio::test]
    async fn test_due_for_rotation() {
        let (registry, clock) = registry();
        let due = registry
            .create_key(symmetric("monthly").with_rotation_period(30))
            .await
            .unwrap();
        registry.create_key(symmetric("never")).await.unwrap();

        assert!(registry.list_due_for_rotation().await.unwrap().is_empty());

        clock.advance(Duration::days(30));
        let listed = registry.list_due_for_rotation().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, due.key.id);

        let summary = registry.key_summary().await.unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.rotation_alerts.len(), 1);
        assert_eq!(summary.rotation_alerts[0].days_since_rotation, 30);

        assert!(registry.rotate_if_due(&due.key.id).await.unwrap().is_some());
        assert!(registry.rotate_if_due(&due.key.id).await.unwrap().is_none());
        assert!(registry.list_due_for_rotation().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_rotations_are_serialized() {
        let (registry, _) = registry();
        let registry = Arc::new(registry);
        let id = registry.create_key(symmetric("payments")).await.unwrap().key.id;

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let id = id.clone();
                tokio::spawn(async move { registry.rotate_key(&id).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let snapshot = registry.get_key(&id).await.unwrap();
        assert_eq!(snapshot.key.current_version, 9);
        assert_eq!(snapshot.versions.len(), 9);
        assert_eq!(snapshot.enabled_versions().count(), 1);
    }
}
