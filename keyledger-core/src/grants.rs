//! Grant-based authorization
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
use crate::error::{KmsError, KmsResult};
use crate::store::{GrantUpsert, KmsStore};
use keyledger_types::{ActorContext, Grant, GrantScope, Operation, Role};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Desired grant for a principal; replaces any grant on the same scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantSpec {
    pub role: Role,
    pub key_id: GrantScope,
    pub allowed_ops: BTreeSet<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<serde_json::Value>,
}

impl GrantSpec {
    pub fn new(role: Role, key_id: GrantScope, ops: impl IntoIterator<Item = Operation>) -> Self {
        Self {
            role,
            key_id,
            allowed_ops: ops.into_iter().collect(),
            conditions: None,
        }
    }
}

pub struct GrantAuthorizer {
    store: Arc<dyn KmsStore>,
    clock: Arc<dyn Clock>,
}

impl GrantAuthorizer {
    pub fn new(store: Arc<dyn KmsStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Admins may do anything, auditors may only read, apps need a grant
    pub async fn ensure_authorized(
        &self,
        actor: &ActorContext,
        operation: Operation,
        scope: &GrantScope,
    ) -> KmsResult<()> {
        let allowed = match actor.role {
            Role::Admin => true,
            Role::Auditor => operation == Operation::Read,
            Role::App => self
                .store
                .grants_for_principal(&actor.principal)
                .await?
                .iter()
                .any(|grant| grant.permits(operation, scope)),
        };

        if !allowed {
            debug!(principal = %actor.principal, op = operation.as_str(), scope = %scope, "Authorization denied");
            return Err(KmsError::AuthzDenied(format!(
                "{} may not {} on {}",
                actor.principal,
                operation.as_str(),
                scope
            )));
        }
        Ok(())
    }

    /// Insert or fully replace the (principal, scope) grant
    pub async fn upsert_by_principal(&self, principal: &str, spec: GrantSpec) -> KmsResult<GrantUpsert> {
        if principal.trim().is_empty() {
            return Err(KmsError::Validation("principal must not be empty".to_string()));
        }

        let grant = Grant {
            id: Uuid::new_v4().to_string(),
            principal: principal.to_string(),
            role: spec.role,
            key_id: spec.key_id,
            allowed_ops: spec.allowed_ops,
            conditions: spec.conditions,
            created_at: self.clock.now(),
        };
        let upsert = self.store.upsert_grant(grant).await?;

        info!(
            principal,
            scope = %upsert.grant.key_id,
            created = upsert.created,
            "Grant stored"
        );
        Ok(upsert)
    }

    pub async fn list_grants(&self) -> KmsResult<Vec<Grant>> {
        self.store.list_grants().await
    }
}
