//! Principals, roles, operations and grants
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
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::TypesError;

/// Wildcard key id accepted in grants
pub const WILDCARD: &str = "*";

/// Role attached to a principal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    App,
    Auditor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::App => "app",
            Role::Auditor => "auditor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "app" => Ok(Role::App),
            "auditor" => Ok(Role::Auditor),
            other => Err(TypesError::InvalidValue {
                field: "role",
                value: other.to_string(),
            }),
        }
    }
}

/// Operation a grant can permit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    Rotate,
    Revoke,
    Read,
    Create,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Encrypt => "encrypt",
            Operation::Decrypt => "decrypt",
            Operation::Sign => "sign",
            Operation::Verify => "verify",
            Operation::Rotate => "rotate",
            Operation::Revoke => "revoke",
            Operation::Read => "read",
            Operation::Create => "create",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "encrypt" => Ok(Operation::Encrypt),
            "decrypt" => Ok(Operation::Decrypt),
            "sign" => Ok(Operation::Sign),
            "verify" => Ok(Operation::Verify),
            "rotate" => Ok(Operation::Rotate),
            "revoke" => Ok(Operation::Revoke),
            "read" => Ok(Operation::Read),
            "create" => Ok(Operation::Create),
            other => Err(TypesError::InvalidValue {
                field: "operation",
                value: other.to_string(),
            }),
        }
    }
}

/// Key a grant or request applies to. Serialized as the key id or `*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum GrantScope {
    Key(String),
    Any,
}

impl GrantScope {
    pub fn key(id: impl Into<String>) -> Self {
        let id = id.into();
        if id == WILDCARD {
            GrantScope::Any
        } else {
            GrantScope::Key(id)
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            GrantScope::Key(id) => id,
            GrantScope::Any => WILDCARD,
        }
    }
}

impl From<String> for GrantScope {
    fn from(value: String) -> Self {
        GrantScope::key(value)
    }
}

impl From<GrantScope> for String {
    fn from(value: GrantScope) -> Self {
        match value {
            GrantScope::Key(id) => id,
            GrantScope::Any => WILDCARD.to_string(),
        }
    }
}

impl fmt::Display for GrantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authorization record binding a principal to operations on a key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    pub id: String,
    pub principal: String,
    pub role: Role,
    pub key_id: GrantScope,
    pub allowed_ops: BTreeSet<Operation>,
    /// Opaque caller-defined conditions; stored, not evaluated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Grant {
    /// Whether this grant covers `operation` on `scope`
    pub fn permits(&self, operation: Operation, scope: &GrantScope) -> bool {
        (self.key_id == *scope || self.key_id == GrantScope::Any)
            && self.allowed_ops.contains(&operation)
    }
}

/// Identity an operation is performed on behalf of
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorContext {
    pub principal: String,
    pub role: Role,
    pub request_id: String,
}

impl ActorContext {
    pub fn new(principal: impl Into<String>, role: Role, request_id: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            role,
            request_id: request_id.into(),
        }
    }

    /// Actor with a freshly generated request id
    pub fn with_new_request(principal: impl Into<String>, role: Role) -> Self {
        Self::new(principal, role, Uuid::new_v4().to_string())
    }
}
