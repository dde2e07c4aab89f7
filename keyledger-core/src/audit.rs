//! Hash-chained audit ledger
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


use crate::canonical::{self, truncate_to_seconds};
use crate::clock::Clock;
use crate::error::{KmsError, KmsResult};
use crate::material;
use crate::store::KmsStore;
use keyledger_config::AuditVerifyMode;
use keyledger_types::{
    ActorContext, AuditAction, AuditRecord, AuditStatus, ChainVerification, GENESIS_HASH,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outcome to be recorded, before it is stamped and chained
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub status: AuditStatus,
    pub key_id: Option<String>,
    pub key_version: Option<u32>,
    pub details: Map<String, Value>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, status: AuditStatus) -> Self {
        Self {
            action,
            status,
            key_id: None,
            key_version: None,
            details: Map::new(),
        }
    }

    pub fn success(action: AuditAction) -> Self {
        Self::new(action, AuditStatus::Success)
    }

    pub fn failure(action: AuditAction) -> Self {
        Self::new(action, AuditStatus::Failure)
    }

    pub fn with_key(mut self, key_id: impl Into<String>, version: Option<u32>) -> Self {
        self.key_id = Some(key_id.into());
        self.key_version = version;
        self
    }

    pub fn with_detail(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.details.insert(name.to_string(), value.into());
        self
    }

    /// Binary detail, stored as base64
    pub fn with_bytes(self, name: &str, bytes: &[u8]) -> Self {
        self.with_detail(name, material::encode_b64(bytes))
    }

    pub fn with_error(self, err: &KmsError) -> Self {
        self.with_detail("error", err.to_string())
            .with_detail("errorKind", err.kind().as_str())
    }
}

/// Append-only ledger over the store's audit table
pub struct AuditLedger {
    store: Arc<dyn KmsStore>,
    clock: Arc<dyn Clock>,
    mode: AuditVerifyMode,
    /// Single writer: read tail, hash, append
    append_lock: Mutex<()>,
}

impl AuditLedger {
    pub fn new(store: Arc<dyn KmsStore>, clock: Arc<dyn Clock>, mode: AuditVerifyMode) -> Self {
        Self {
            store,
            clock,
            mode,
            append_lock: Mutex::new(()),
        }
    }

    /// Stamp, chain and append one record
    pub async fn record(&self, actor: &ActorContext, event: AuditEvent) -> KmsResult<AuditRecord> {
        let _guard = self.append_lock.lock().await;

        let prev_hash = self
            .store
            .last_audit_record()
            .await?
            .map(|r| r.hash)
            .unwrap_or_else(|| GENESIS_HASH.to_string());

        let mut record = AuditRecord {
            id: Uuid::new_v4().to_string(),
            timestamp: truncate_to_seconds(self.clock.now()),
            actor: actor.principal.clone(),
            role: actor.role,
            action: event.action,
            request_id: actor.request_id.clone(),
            details: Value::Object(event.details),
            key_id: event.key_id,
            key_version: event.key_version,
            prev_hash: prev_hash.clone(),
            hash: String::new(),
            status: event.status,
        };
        record.hash = canonical::record_hash(&prev_hash, &record)?;

        self.store.append_audit(record.clone(), &prev_hash).await?;
        debug!(
            record_id = %record.id,
            action = record.action.as_str(),
            status = record.status.as_str(),
            "Audit record appended"
        );
        Ok(record)
    }

    /// Walk the chain in insertion order
    ///
    /// A broken `prev_hash` link always fails verification. A hash that only
    /// a legacy canonicalization reproduces is listed in `legacy`. A hash
    /// nothing reproduces fails in strict mode and is listed in
    /// `unverified` in tolerant mode.
    pub async fn verify_chain(&self) -> KmsResult<ChainVerification> {
        let records = self.store.list_audit().await?;
        let mut result = ChainVerification {
            ok: true,
            ..Default::default()
        };
        let mut prev_hash = GENESIS_HASH.to_string();

        for record in &records {
            result.records_checked += 1;

            if record.prev_hash != prev_hash {
                warn!(record_id = %record.id, "Audit chain link broken");
                result.ok = false;
                result.broken_at = Some(record.id.clone());
                return Ok(result);
            }

            if record.hash != canonical::record_hash(&prev_hash, record)? {
                if let Some(form) = canonical::legacy_match(&prev_hash, record)? {
                    debug!(record_id = %record.id, form, "Audit record uses legacy canonicalization");
                    result.legacy.push(record.id.clone());
                } else {
                    match self.mode {
                        AuditVerifyMode::Strict => {
                            warn!(record_id = %record.id, "Audit record hash mismatch");
                            result.ok = false;
                            result.broken_at = Some(record.id.clone());
                            return Ok(result);
                        }
                        AuditVerifyMode::Tolerant => {
                            warn!(record_id = %record.id, "Audit record hash unverifiable, linkage intact");
                            result.unverified.push(record.id.clone());
                        }
                    }
                }
            }

            prev_hash = record.hash.clone();
        }

        Ok(result)
    }

    pub async fn list(&self) -> KmsResult<Vec<AuditRecord>> {
        self.store.list_audit().await
    }

    pub async fn latest(&self) -> KmsResult<Option<AuditRecord>> {
        self.store.last_audit_record().await
    }
}
