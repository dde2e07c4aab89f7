//! Audit tail anchoring with an external notarization service
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


use crate::canonical::TIMESTAMP_FORMAT;
use crate::clock::Clock;
use crate::error::{KmsError, KmsResult};
use async_trait::async_trait;
use keyledger_config::AnchorConfig;
use keyledger_types::AnchorReceipt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Publishes an audit hash somewhere it cannot be rewritten
#[async_trait]
pub trait Notarizer: Send + Sync {
    async fn anchor(&self, hash: &str, record_id: &str) -> KmsResult<AnchorReceipt>;
}

/// `0x`-prefixed lowercase form of a 32-byte hex hash
pub fn normalize_hash(hash: &str) -> KmsResult<String> {
    let digits = hash.strip_prefix("0x").unwrap_or(hash);
    match hex::decode(digits) {
        Ok(bytes) if bytes.len() == 32 => Ok(format!("0x{}", hex::encode(bytes))),
        _ => Err(KmsError::Validation(
            "audit hash must be a 32-byte hex string".to_string(),
        )),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnchorPayload<'a> {
    hash: String,
    record_id: &'a str,
    timestamp: String,
}

/// Notarizer posting `{hash, recordId, timestamp}` to a JSON endpoint
pub struct HttpNotarizer {
    url: String,
    network: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl HttpNotarizer {
    pub fn new(
        url: impl Into<String>,
        network: Option<String>,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> KmsResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KmsError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            url: url.into(),
            network,
            timeout,
            client,
            clock,
        })
    }

    /// `None` unless anchoring is enabled and an endpoint is configured
    pub fn from_config(config: &AnchorConfig, clock: Arc<dyn Clock>) -> KmsResult<Option<Arc<dyn Notarizer>>> {
        let url = match config.url.as_deref() {
            Some(url) if config.is_active() => url,
            _ => {
                if config.enabled {
                    warn!("Audit anchoring requested but no anchor URL is configured. Anchoring will be skipped.");
                }
                return Ok(None);
            }
        };

        info!(url = %url, "Audit anchoring enabled");
        let notarizer: Arc<dyn Notarizer> = Arc::new(Self::new(
            url,
            config.network.clone(),
            config.timeout(),
            clock,
        )?);
        Ok(Some(notarizer))
    }
}

#[async_trait]
impl Notarizer for HttpNotarizer {
    async fn anchor(&self, hash: &str, record_id: &str) -> KmsResult<AnchorReceipt> {
        let payload = AnchorPayload {
            hash: normalize_hash(hash)?,
            record_id,
            timestamp: self.clock.now().format(TIMESTAMP_FORMAT).to_string(),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    KmsError::Timeout(self.timeout)
                } else {
                    KmsError::Provider(format!("anchor request failed: {}", e))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(KmsError::Provider(format!(
                "anchor service error ({}): {}",
                status, error_text
            )));
        }

        let mut receipt: AnchorReceipt = response
            .json()
            .await
            .map_err(|e| KmsError::Provider(format!("malformed anchor receipt: {}", e)))?;
        if receipt.network.is_none() {
            receipt.network = self.network.clone();
        }

        info!(tx_id = %receipt.tx_id, record_id, "Audit tail anchored");
        Ok(receipt)
    }
}
