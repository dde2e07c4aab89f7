//! Operational summary over keys and the audit trail

use crate::registry::KeySummary;
use chrono::{DateTime, Duration, Utc};
use keyledger_types::{AuditAction, AuditRecord, AuditStatus};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastVerification {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditHealth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_verification: Option<LastVerification>,
    /// Failed AUDIT_VERIFY records
    pub failures_last_24h: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub encryptions_last_24h: usize,
    pub decryptions_last_24h: usize,
    pub rotations_last_30d: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsMetrics {
    pub keys: KeySummary,
    pub audit: AuditHealth,
    pub usage: Usage,
}

impl OpsMetrics {
    pub fn compute(keys: KeySummary, records: &[AuditRecord], now: DateTime<Utc>) -> Self {
        let day_ago = now - Duration::days(1);
        let month_ago = now - Duration::days(30);
        let count = |action: AuditAction, since: DateTime<Utc>| {
            records
                .iter()
                .filter(|r| r.action == action && r.timestamp >= since)
                .count()
        };

        let last_verification = records
            .iter()
            .rev()
            .find(|r| r.action == AuditAction::AuditVerify)
            .map(|r| LastVerification {
                id: r.id.clone(),
                timestamp: r.timestamp,
                ok: r.details.get("ok").and_then(|v| v.as_bool()),
                broken_at: r
                    .details
                    .get("brokenAt")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            });

        let failures_last_24h = records
            .iter()
            .filter(|r| {
                r.action == AuditAction::AuditVerify
                    && r.status == AuditStatus::Failure
                    && r.timestamp >= day_ago
            })
            .count();

        Self {
            keys,
            audit: AuditHealth {
                last_verification,
                failures_last_24h,
            },
            usage: Usage {
                encryptions_last_24h: count(AuditAction::Encrypt, day_ago),
                decryptions_last_24h: count(AuditAction::Decrypt, day_ago),
                rotations_last_30d: count(AuditAction::KeyRotate, month_ago),
            },
        }
    }
}
