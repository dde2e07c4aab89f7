//! In-process store with optional on-disk persistence
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


use crate::error::{KmsError, KmsResult};
use crate::store::{GrantUpsert, KmsStore, RotationCommit, VersionStateCommit};
use async_trait::async_trait;
use keyledger_types::{
    AuditRecord, Grant, Key, KeyId, KeyVersion, KeyWithVersions, GENESIS_HASH,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const KEYS_DIR: &str = "keys";
const GRANTS_FILE: &str = "grants.json";
const AUDIT_LOG: &str = "audit.jsonl";
const LOCK_FILE: &str = "keyledger.lock";

#[derive(Debug, Default)]
struct StoreState {
    keys: BTreeMap<KeyId, Key>,
    versions: BTreeMap<KeyId, BTreeMap<u32, KeyVersion>>,
    grants: Vec<Grant>,
    audit: Vec<AuditRecord>,
}

impl StoreState {
    fn snapshot(&self, key_id: &str) -> Option<KeyWithVersions> {
        let key = self.keys.get(key_id)?;
        let versions = self
            .versions
            .get(key_id)
            .map(|v| v.values().cloned().collect())
            .unwrap_or_default();
        Some(KeyWithVersions {
            key: key.clone(),
            versions,
        })
    }

    fn tail_hash(&self) -> &str {
        self.audit
            .last()
            .map(|r| r.hash.as_str())
            .unwrap_or(GENESIS_HASH)
    }
}

/// Exclusive ownership of a store directory, released on drop
#[derive(Debug)]
struct DirLock {
    path: PathBuf,
}

impl DirLock {
    async fn acquire(dir: &Path) -> KmsResult<Self> {
        let path = dir.join(LOCK_FILE);
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(KmsError::Configuration(format!(
                    "store at {} is already open in another process; remove {} only if that process is gone",
                    dir.display(),
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let lock = Self { path };
        file.write_all(format!("{}\n", std::process::id()).as_bytes())
            .await?;
        file.flush().await?;
        Ok(lock)
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to release store lock {}: {}", self.path.display(), e);
        }
    }
}

/// On-disk layout: one JSON file per key under `keys/`, all grants in
/// `grants.json` and the audit table as JSON lines in `audit.jsonl`
#[derive(Debug)]
struct Persistence {
    dir: PathBuf,
    _lock: DirLock,
}

async fn write_replacing(path: &Path, bytes: Vec<u8>) -> KmsResult<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

impl Persistence {
    fn key_path(&self, key_id: &str) -> KmsResult<PathBuf> {
        let safe = !key_id.is_empty()
            && key_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !safe {
            return Err(KmsError::Validation(format!(
                "key id {:?} cannot be stored on disk",
                key_id
            )));
        }
        Ok(self.dir.join(KEYS_DIR).join(format!("{}.json", key_id)))
    }

    async fn write_key(&self, snapshot: &KeyWithVersions) -> KmsResult<()> {
        let path = self.key_path(&snapshot.key.id)?;
        write_replacing(&path, serde_json::to_vec_pretty(snapshot)?).await?;
        debug!("Key file written to {}", path.display());
        Ok(())
    }

    async fn write_grants(&self, grants: &[Grant]) -> KmsResult<()> {
        write_replacing(&self.dir.join(GRANTS_FILE), serde_json::to_vec_pretty(grants)?).await
    }

    async fn append_audit(&self, record: &AuditRecord) -> KmsResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(AUDIT_LOG))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load(&self) -> KmsResult<StoreState> {
        let mut state = StoreState::default();

        let mut entries = fs::read_dir(self.dir.join(KEYS_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let snapshot: KeyWithVersions = serde_json::from_slice(&fs::read(&path).await?)?;
            let versions = snapshot
                .versions
                .into_iter()
                .map(|v| (v.version, v))
                .collect();
            state.versions.insert(snapshot.key.id.clone(), versions);
            state.keys.insert(snapshot.key.id.clone(), snapshot.key);
        }

        if let Some(bytes) = read_if_exists(&self.dir.join(GRANTS_FILE)).await? {
            state.grants = serde_json::from_slice(&bytes)?;
        }

        let audit_path = self.dir.join(AUDIT_LOG);
        if let Some(bytes) = read_if_exists(&audit_path).await? {
            let content = String::from_utf8_lossy(&bytes);
            let mut offset = 0usize;
            for (index, line) in content.split_inclusive('\n').enumerate() {
                if !line.trim().is_empty() {
                    match serde_json::from_str::<AuditRecord>(line) {
                        Ok(record) => state.audit.push(record),
                        // A write cut short by a crash leaves one unterminated line
                        Err(_) if !line.ends_with('\n') => {
                            warn!(
                                "Dropping torn audit line {} in {}",
                                index + 1,
                                audit_path.display()
                            );
                            fs::OpenOptions::new()
                                .write(true)
                                .open(&audit_path)
                                .await?
                                .set_len(offset as u64)
                                .await?;
                            break;
                        }
                        Err(e) => {
                            return Err(KmsError::Integrity(format!(
                                "audit log line {} is malformed: {}",
                                index + 1,
                                e
                            )))
                        }
                    }
                }
                offset += line.len();
            }
        }

        Ok(state)
    }
}

async fn read_if_exists(path: &Path) -> KmsResult<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Store keeping all rows in memory
///
/// With [`MemoryStore::open`] each mutation writes only what it touched (one
/// key file, the grants file, or one audit line) before it becomes visible,
/// so a failed write leaves memory at the previous state. The directory is
/// owned by one process at a time.
pub struct MemoryStore {
    state: RwLock<StoreState>,
    persistence: Option<Persistence>,
}

impl MemoryStore {
    /// Volatile store
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            persistence: None,
        }
    }

    /// Store persisted under `dir`, loading existing rows
    ///
    /// Fails with `Configuration` while another store holds `dir`.
    pub async fn open<P: AsRef<Path>>(dir: P) -> KmsResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir.join(KEYS_DIR)).await?;
        let persistence = Persistence {
            dir: dir.to_path_buf(),
            _lock: DirLock::acquire(dir).await?,
        };
        let state = persistence.load().await?;

        info!(
            "Opened store at {} ({} keys, {} audit records)",
            dir.display(),
            state.keys.len(),
            state.audit.len()
        );

        Ok(Self {
            state: RwLock::new(state),
            persistence: Some(persistence),
        })
    }

    async fn persist_key(&self, key: &Key, versions: &BTreeMap<u32, KeyVersion>) -> KmsResult<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        persistence
            .write_key(&KeyWithVersions {
                key: key.clone(),
                versions: versions.values().cloned().collect(),
            })
            .await
    }

    #[cfg(test)]
    pub(crate) async fn tamper_audit<F>(&self, f: F)
    where
        F: FnOnce(&mut Vec<AuditRecord>),
    {
        f(&mut self.state.write().await.audit);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KmsStore for MemoryStore {
    async fn insert_key(&self, key: Key, first_version: KeyVersion) -> KmsResult<()> {
        let mut state = self.state.write().await;
        if state.keys.contains_key(&key.id) {
            return Err(KmsError::Conflict(format!("key id {} already exists", key.id)));
        }
        if state.keys.values().any(|k| k.name == key.name) {
            return Err(KmsError::Conflict(format!("key name {} already exists", key.name)));
        }

        let versions = BTreeMap::from([(first_version.version, first_version)]);
        self.persist_key(&key, &versions).await?;
        state.versions.insert(key.id.clone(), versions);
        state.keys.insert(key.id.clone(), key);
        Ok(())
    }

    async fn get_key_with_versions(&self, key_id: &str) -> KmsResult<Option<KeyWithVersions>> {
        Ok(self.state.read().await.snapshot(key_id))
    }

    async fn find_key_by_name(&self, name: &str) -> KmsResult<Option<Key>> {
        let state = self.state.read().await;
        Ok(state.keys.values().find(|k| k.name == name).cloned())
    }

    async fn list_keys(&self) -> KmsResult<Vec<Key>> {
        let state = self.state.read().await;
        let mut keys: Vec<Key> = state.keys.values().cloned().collect();
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(keys)
    }

    async fn list_keys_with_versions(&self) -> KmsResult<Vec<KeyWithVersions>> {
        let state = self.state.read().await;
        Ok(state.keys.keys().filter_map(|id| state.snapshot(id)).collect())
    }

    async fn commit_rotation(&self, commit: RotationCommit) -> KmsResult<()> {
        let mut state = self.state.write().await;
        let current = state
            .keys
            .get(&commit.key.id)
            .ok_or_else(|| KmsError::NotFound(commit.key.id.clone()))?;
        if current.current_version != commit.expected_current_version {
            return Err(KmsError::State(format!(
                "key {} moved to version {} during rotation",
                current.id, current.current_version
            )));
        }

        let mut versions = state.versions.get(&commit.key.id).cloned().unwrap_or_default();
        if versions.contains_key(&commit.inserted.version) {
            return Err(KmsError::Conflict(format!(
                "version {} of key {} already exists",
                commit.inserted.version, commit.key.id
            )));
        }
        if let Some(demoted) = commit.demoted {
            versions.insert(demoted.version, demoted);
        }
        versions.insert(commit.inserted.version, commit.inserted);

        self.persist_key(&commit.key, &versions).await?;
        state.versions.insert(commit.key.id.clone(), versions);
        state.keys.insert(commit.key.id.clone(), commit.key);
        Ok(())
    }

    async fn commit_version_state(&self, commit: VersionStateCommit) -> KmsResult<()> {
        let mut state = self.state.write().await;
        let key_id = commit.version.key_id.clone();
        let mut versions = state
            .versions
            .get(&key_id)
            .filter(|v| v.contains_key(&commit.version.version))
            .cloned()
            .ok_or_else(|| {
                KmsError::NotFound(format!(
                    "version {} of key {}",
                    commit.version.version, key_id
                ))
            })?;
        versions.insert(commit.version.version, commit.version);

        let key = match commit.key {
            Some(key) => key,
            None => state
                .keys
                .get(&key_id)
                .cloned()
                .ok_or_else(|| KmsError::NotFound(format!("key {}", key_id)))?,
        };

        self.persist_key(&key, &versions).await?;
        state.versions.insert(key_id.clone(), versions);
        state.keys.insert(key_id, key);
        Ok(())
    }

    async fn upsert_grant(&self, grant: Grant) -> KmsResult<GrantUpsert> {
        let mut state = self.state.write().await;
        let mut grants = state.grants.clone();
        let existing = grants
            .iter_mut()
            .find(|g| g.principal == grant.principal && g.key_id == grant.key_id);
        let upsert = match existing {
            Some(slot) => {
                let id = slot.id.clone();
                *slot = Grant { id, ..grant };
                GrantUpsert {
                    grant: slot.clone(),
                    created: false,
                }
            }
            None => {
                grants.push(grant.clone());
                GrantUpsert {
                    grant,
                    created: true,
                }
            }
        };

        if let Some(persistence) = &self.persistence {
            persistence.write_grants(&grants).await?;
        }
        state.grants = grants;
        Ok(upsert)
    }

    async fn grants_for_principal(&self, principal: &str) -> KmsResult<Vec<Grant>> {
        let state = self.state.read().await;
        Ok(state
            .grants
            .iter()
            .filter(|g| g.principal == principal)
            .cloned()
            .collect())
    }

    async fn list_grants(&self) -> KmsResult<Vec<Grant>> {
        Ok(self.state.read().await.grants.clone())
    }

    async fn last_audit_record(&self) -> KmsResult<Option<AuditRecord>> {
        Ok(self.state.read().await.audit.last().cloned())
    }

    async fn append_audit(&self, record: AuditRecord, expected_prev_hash: &str) -> KmsResult<()> {
        let mut state = self.state.write().await;
        if state.tail_hash() != expected_prev_hash {
            return Err(KmsError::Integrity(format!(
                "audit tail moved (expected {}, found {})",
                expected_prev_hash,
                state.tail_hash()
            )));
        }

        if let Some(persistence) = &self.persistence {
            persistence.append_audit(&record).await?;
        }
        state.audit.push(record);
        Ok(())
    }

    async fn list_audit(&self) -> KmsResult<Vec<AuditRecord>> {
        Ok(self.state.read().await.audit.clone())
    }
}
