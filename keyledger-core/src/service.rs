//! Key management service facade
//!
//! Every operation runs `authorize -> perform -> audit`; each key-mutating,
//! cryptographic, grant or verification call appends exactly one audit
//! record whether it succeeds or fails. Reads are authorized (`read`) but not
//! audited.
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


use crate::anchor::{HttpNotarizer, Notarizer};
use crate::audit::{AuditEvent, AuditLedger};
use crate::clock::{Clock, SystemClock};
use crate::crypto_engine::{
    CryptoEngine, DecryptOutput, DecryptRequest, EncryptOutput, EncryptRequest, SignOutput,
    SignRequest, VerifyOutput, VerifyRequest,
};
use crate::envelope::{self, EnvelopeCipher};
use crate::error::{KmsError, KmsResult};
use crate::grants::{GrantAuthorizer, GrantSpec};
use crate::local_envelope::LocalEnvelope;
use crate::memory_store::MemoryStore;
use crate::metrics::OpsMetrics;
use crate::registry::{CreateKeyRequest, KeyRegistry};
use crate::store::{GrantUpsert, KmsStore};
use keyledger_config::{AuditVerifyMode, KmsConfig};
use keyledger_types::{
    ActorContext, AnchorAnnotation, AuditAction, AuditRecord, AuditStatus, ChainVerification,
    Grant, GrantScope, Key, KeyWithVersions, Operation, Role, VersionState,
};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Details reason for rotations triggered by the scheduler
pub const SCHEDULED_ROTATION: &str = "scheduled-rotation";

pub struct KmsServiceBuilder {
    store: Arc<dyn KmsStore>,
    envelope: Option<Arc<dyn EnvelopeCipher>>,
    clock: Arc<dyn Clock>,
    default_grace_days: u32,
    verify_mode: AuditVerifyMode,
    notarizer: Option<Arc<dyn Notarizer>>,
}

impl KmsServiceBuilder {
    pub fn envelope(mut self, envelope: Arc<dyn EnvelopeCipher>) -> Self {
        self.envelope = Some(envelope);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn default_grace_days(mut self, days: u32) -> Self {
        self.default_grace_days = days;
        self
    }

    pub fn verify_mode(mut self, mode: AuditVerifyMode) -> Self {
        self.verify_mode = mode;
        self
    }

    pub fn notarizer(mut self, notarizer: Option<Arc<dyn Notarizer>>) -> Self {
        self.notarizer = notarizer;
        self
    }

    pub fn build(self) -> KmsService {
        let envelope = self
            .envelope
            .unwrap_or_else(|| Arc::new(LocalEnvelope::from_secret(None)));
        let registry = Arc::new(KeyRegistry::new(
            self.store.clone(),
            envelope.clone(),
            self.clock.clone(),
            self.default_grace_days,
        ));

        KmsService {
            crypto: CryptoEngine::new(registry.clone(), envelope, self.clock.clone()),
            grants: GrantAuthorizer::new(self.store.clone(), self.clock.clone()),
            audit: AuditLedger::new(self.store, self.clock.clone(), self.verify_mode),
            registry,
            notarizer: self.notarizer,
            clock: self.clock,
        }
    }
}

pub struct KmsService {
    registry: Arc<KeyRegistry>,
    crypto: CryptoEngine,
    grants: GrantAuthorizer,
    audit: AuditLedger,
    notarizer: Option<Arc<dyn Notarizer>>,
    clock: Arc<dyn Clock>,
}

fn scope_of(key_id: &str) -> GrantScope {
    GrantScope::key(key_id)
}

impl KmsService {
    pub fn builder(store: Arc<dyn KmsStore>) -> KmsServiceBuilder {
        KmsServiceBuilder {
            store,
            envelope: None,
            clock: Arc::new(SystemClock),
            default_grace_days: 7,
            verify_mode: AuditVerifyMode::default(),
            notarizer: None,
        }
    }

    /// Wire the service from configuration
    pub async fn from_config(config: &KmsConfig) -> KmsResult<Self> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let store: Arc<dyn KmsStore> = match &config.store.path {
            Some(path) => Arc::new(MemoryStore::open(path).await?),
            None => {
                warn!("No store path configured, state is kept in memory only");
                Arc::new(MemoryStore::new())
            }
        };

        Ok(Self::builder(store)
            .envelope(envelope::from_config(&config.envelope)?)
            .clock(clock.clone())
            .default_grace_days(config.grace_period_days_default)
            .verify_mode(config.audit.verify_mode)
            .notarizer(HttpNotarizer::from_config(&config.anchor, clock)?)
            .build())
    }

    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    pub fn crypto(&self) -> &CryptoEngine {
        &self.crypto
    }

    pub fn authorizer(&self) -> &GrantAuthorizer {
        &self.grants
    }

    pub fn ledger(&self) -> &AuditLedger {
        &self.audit
    }

    pub async fn ensure_authorized(
        &self,
        actor: &ActorContext,
        operation: Operation,
        scope: &GrantScope,
    ) -> KmsResult<()> {
        self.grants.ensure_authorized(actor, operation, scope).await
    }

    /// Append an arbitrary event to the audit chain
    pub async fn record(&self, actor: &ActorContext, event: AuditEvent) -> KmsResult<AuditRecord> {
        self.audit.record(actor, event).await
    }

    /// Record the outcome of `operation` and hand back its result
    ///
    /// On success a failing audit write is returned as the error. On failure
    /// the original error is returned and an audit write failure is logged.
    async fn audited<T, Fut, S>(
        &self,
        actor: &ActorContext,
        failure: AuditEvent,
        operation: Fut,
        success: S,
    ) -> KmsResult<T>
    where
        Fut: Future<Output = KmsResult<T>>,
        S: FnOnce(&T) -> AuditEvent,
    {
        match operation.await {
            Ok(value) => {
                self.audit.record(actor, success(&value)).await?;
                Ok(value)
            }
            Err(err) => {
                let event = failure.with_error(&err);
                if let Err(audit_err) = self.audit.record(actor, event).await {
                    error!(
                        error = %audit_err,
                        original = %err,
                        request_id = %actor.request_id,
                        "Failed to audit a failed operation"
                    );
                }
                Err(err)
            }
        }
    }

    pub async fn create_key(
        &self,
        actor: &ActorContext,
        request: CreateKeyRequest,
    ) -> KmsResult<KeyWithVersions> {
        let failure = AuditEvent::failure(AuditAction::KeyCreate)
            .with_detail("name", request.name.as_str())
            .with_detail("type", request.key_type.as_str());

        self.audited(
            actor,
            failure,
            async {
                self.grants
                    .ensure_authorized(actor, Operation::Create, &GrantScope::Any)
                    .await?;
                self.registry.create_key(request).await
            },
            |created| {
                AuditEvent::success(AuditAction::KeyCreate)
                    .with_key(&created.key.id, Some(created.key.current_version))
                    .with_detail("name", created.key.name.as_str())
                    .with_detail("type", created.key.key_type.as_str())
                    .with_detail("purpose", created.key.purpose.as_str())
            },
        )
        .await
    }

    pub async fn rotate_key(&self, actor: &ActorContext, key_id: &str) -> KmsResult<KeyWithVersions> {
        let failure = AuditEvent::failure(AuditAction::KeyRotate).with_key(key_id, None);

        self.audited(
            actor,
            failure,
            async {
                self.grants
                    .ensure_authorized(actor, Operation::Rotate, &scope_of(key_id))
                    .await?;
                self.registry.rotate_key(key_id).await
            },
            |rotated| {
                AuditEvent::success(AuditAction::KeyRotate)
                    .with_key(key_id, Some(rotated.key.current_version))
                    .with_detail("previousVersion", rotated.key.current_version - 1)
                    .with_detail("reason", "manual")
            },
        )
        .await
    }

    /// Rotate on behalf of the scheduler if the key is still due
    ///
    /// Nothing is performed or audited when the key stopped being due.
    pub async fn rotate_due(
        &self,
        actor: &ActorContext,
        key_id: &str,
    ) -> KmsResult<Option<KeyWithVersions>> {
        let outcome = async {
            self.grants
                .ensure_authorized(actor, Operation::Rotate, &scope_of(key_id))
                .await?;
            self.registry.rotate_if_due(key_id).await
        }
        .await;

        match outcome {
            Ok(None) => {
                debug!(key_id, "Scheduled rotation skipped, key no longer due");
                Ok(None)
            }
            result => {
                let failure = AuditEvent::failure(AuditAction::KeyRotate)
                    .with_key(key_id, None)
                    .with_detail("reason", SCHEDULED_ROTATION);
                self.audited(actor, failure, async { result }, |rotated| {
                    let version = rotated.as_ref().map(|r| r.key.current_version);
                    AuditEvent::success(AuditAction::KeyRotate)
                        .with_key(key_id, version)
                        .with_detail("reason", SCHEDULED_ROTATION)
                })
                .await
            }
        }
    }

    /// Disable or revoke a key version
    pub async fn set_version_state(
        &self,
        actor: &ActorContext,
        key_id: &str,
        version: u32,
        state: VersionState,
    ) -> KmsResult<KeyWithVersions> {
        let action = match state {
            VersionState::Revoked => AuditAction::KeyRevoke,
            _ => AuditAction::KeyDisable,
        };
        let failure = AuditEvent::failure(action)
            .with_key(key_id, Some(version))
            .with_detail("state", state.as_str());

        self.audited(
            actor,
            failure,
            async {
                self.grants
                    .ensure_authorized(actor, Operation::Revoke, &scope_of(key_id))
                    .await?;
                self.registry.set_version_state(key_id, version, state).await
            },
            |updated| {
                AuditEvent::success(action)
                    .with_key(key_id, Some(version))
                    .with_detail("state", state.as_str())
                    .with_detail("keyState", updated.key.state.as_str())
            },
        )
        .await
    }

    pub async fn encrypt(&self, actor: &ActorContext, request: &EncryptRequest) -> KmsResult<EncryptOutput> {
        let failure = AuditEvent::failure(AuditAction::Encrypt).with_key(&request.key_id, None);

        self.audited(
            actor,
            failure,
            async {
                self.grants
                    .ensure_authorized(actor, Operation::Encrypt, &scope_of(&request.key_id))
                    .await?;
                self.crypto.encrypt(request).await
            },
            |out| {
                AuditEvent::success(AuditAction::Encrypt)
                    .with_key(&request.key_id, Some(out.version))
                    .with_detail("keyType", out.key_type.as_str())
                    .with_detail("bytes", request.plaintext.len() as u64)
            },
        )
        .await
    }

    pub async fn decrypt(&self, actor: &ActorContext, request: &DecryptRequest) -> KmsResult<DecryptOutput> {
        let failure = AuditEvent::failure(AuditAction::Decrypt).with_key(&request.key_id, request.version);

        self.audited(
            actor,
            failure,
            async {
                self.grants
                    .ensure_authorized(actor, Operation::Decrypt, &scope_of(&request.key_id))
                    .await?;
                self.crypto.decrypt(request).await
            },
            |out| {
                AuditEvent::success(AuditAction::Decrypt)
                    .with_key(&request.key_id, Some(out.version))
                    .with_detail("bytes", out.plaintext.len() as u64)
            },
        )
        .await
    }

    pub async fn sign(&self, actor: &ActorContext, request: &SignRequest) -> KmsResult<SignOutput> {
        let failure = AuditEvent::failure(AuditAction::Sign).with_key(&request.key_id, request.version);

        self.audited(
            actor,
            failure,
            async {
                self.grants
                    .ensure_authorized(actor, Operation::Sign, &scope_of(&request.key_id))
                    .await?;
                self.crypto.sign(request).await
            },
            |out| AuditEvent::success(AuditAction::Sign).with_key(&request.key_id, Some(out.version)),
        )
        .await
    }

    pub async fn verify(&self, actor: &ActorContext, request: &VerifyRequest) -> KmsResult<VerifyOutput> {
        let failure = AuditEvent::failure(AuditAction::Verify).with_key(&request.key_id, request.version);

        self.audited(
            actor,
            failure,
            async {
                self.grants
                    .ensure_authorized(actor, Operation::Verify, &scope_of(&request.key_id))
                    .await?;
                self.crypto.verify(request).await
            },
            |out| {
                AuditEvent::success(AuditAction::Verify)
                    .with_key(&request.key_id, Some(out.version))
                    .with_detail("valid", out.valid)
            },
        )
        .await
    }

    /// Create or replace a grant; admin only
    pub async fn upsert_grant(
        &self,
        actor: &ActorContext,
        principal: &str,
        spec: GrantSpec,
    ) -> KmsResult<GrantUpsert> {
        let key_id = match &spec.key_id {
            GrantScope::Key(id) => Some(id.clone()),
            GrantScope::Any => None,
        };
        let ops: Vec<Value> = spec.allowed_ops.iter().map(|op| Value::from(op.as_str())).collect();
        let describe = |event: AuditEvent| {
            let event = event
                .with_detail("principal", principal)
                .with_detail("role", spec.role.as_str())
                .with_detail("scope", spec.key_id.as_str())
                .with_detail("allowedOps", ops.clone());
            match &key_id {
                Some(id) => event.with_key(id, None),
                None => event,
            }
        };
        let failure = describe(AuditEvent::failure(AuditAction::GrantCreate));
        let spec_for_store = spec.clone();

        self.audited(
            actor,
            failure,
            async {
                if actor.role != Role::Admin {
                    return Err(KmsError::AuthzDenied(format!(
                        "{} may not manage grants",
                        actor.principal
                    )));
                }
                self.grants.upsert_by_principal(principal, spec_for_store).await
            },
            |upsert| {
                let action = if upsert.created {
                    AuditAction::GrantCreate
                } else {
                    AuditAction::GrantUpdate
                };
                describe(AuditEvent::success(action)).with_detail("grantId", upsert.grant.id.as_str())
            },
        )
        .await
    }

    /// Verify the audit chain; admins and auditors only
    ///
    /// A passing chain is anchored with the notarizer when one is
    /// configured. Anchoring failures are reported in `anchor` and never
    /// change `ok`.
    pub async fn verify_chain(&self, actor: &ActorContext) -> KmsResult<ChainVerification> {
        let failure = AuditEvent::failure(AuditAction::AuditVerify);

        self.audited(
            actor,
            failure,
            async {
                if actor.role == Role::App {
                    return Err(KmsError::AuthzDenied(format!(
                        "{} may not verify the audit chain",
                        actor.principal
                    )));
                }
                let mut result = self.audit.verify_chain().await?;
                if result.ok {
                    result.anchor = self.anchor_tail().await?;
                }
                Ok(result)
            },
            |result| {
                let status = if result.ok {
                    AuditStatus::Success
                } else {
                    AuditStatus::Failure
                };
                let mut event = AuditEvent::new(AuditAction::AuditVerify, status)
                    .with_detail("ok", result.ok)
                    .with_detail("recordsChecked", result.records_checked as u64)
                    .with_detail("legacy", result.legacy.len() as u64)
                    .with_detail("unverified", result.unverified.len() as u64);
                if let Some(broken_at) = &result.broken_at {
                    event = event.with_detail("brokenAt", broken_at.as_str());
                }
                if let Some(anchor) = &result.anchor {
                    event = event.with_detail(
                        "anchor",
                        serde_json::to_value(anchor).unwrap_or(Value::Null),
                    );
                }
                event
            },
        )
        .await
    }

    async fn anchor_tail(&self) -> KmsResult<Option<AnchorAnnotation>> {
        let Some(notarizer) = &self.notarizer else {
            return Ok(None);
        };
        let Some(tail) = self.audit.latest().await? else {
            return Ok(None);
        };

        let annotation = match notarizer.anchor(&tail.hash, &tail.id).await {
            Ok(receipt) => AnchorAnnotation::Anchored {
                hash: tail.hash,
                receipt,
            },
            Err(err) => {
                warn!(error = %err, record_id = %tail.id, "Audit anchoring failed");
                AnchorAnnotation::Failed {
                    hash: tail.hash,
                    error: err.to_string(),
                }
            }
        };
        Ok(Some(annotation))
    }

    pub async fn get_key(&self, actor: &ActorContext, key_id: &str) -> KmsResult<KeyWithVersions> {
        self.grants
            .ensure_authorized(actor, Operation::Read, &scope_of(key_id))
            .await?;
        self.registry.get_key(key_id).await
    }

    pub async fn list_keys(&self, actor: &ActorContext) -> KmsResult<Vec<Key>> {
        self.grants
            .ensure_authorized(actor, Operation::Read, &GrantScope::Any)
            .await?;
        self.registry.list_keys().await
    }

    pub async fn list_grants(&self, actor: &ActorContext) -> KmsResult<Vec<Grant>> {
        self.grants
            .ensure_authorized(actor, Operation::Read, &GrantScope::Any)
            .await?;
        self.grants.list_grants().await
    }

    pub async fn list_audit(&self, actor: &ActorContext) -> KmsResult<Vec<AuditRecord>> {
        self.grants
            .ensure_authorized(actor, Operation::Read, &GrantScope::Any)
            .await?;
        self.audit.list().await
    }

    pub async fn metrics(&self, actor: &ActorContext) -> KmsResult<OpsMetrics> {
        self.grants
            .ensure_authorized(actor, Operation::Read, &GrantScope::Any)
            .await?;
        let keys = self.registry.key_summary().await?;
        let records = self.audit.list().await?;
        Ok(OpsMetrics::compute(keys, &records, self.clock.now()))
    }

    pub async fn list_due_for_rotation(&self) -> KmsResult<Vec<Key>> {
        let due = self.registry.list_due_for_rotation().await?;
        if !due.is_empty() {
            info!(count = due.len(), "Keys due for rotation");
        }
        Ok(due)
    }
}
