//! Envelope backend delegating to an external key-protection provider over HTTP
//!
//! - `POST {endpoint}/wrap` with `{keyId, plaintext, encryptionContext}`,
//!   answered by `{ciphertext}`
//! - `POST {endpoint}/unwrap` with `{keyId, ciphertext, encryptionContext}`,
//!   answered by `{plaintext}`
//!
//! Binary values are base64. The provider is expected to reject an unwrap
//! whose context differs from the one used at wrap time.
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


use crate::envelope::{ensure_algorithm, EnvelopeCipher};
use crate::error::{KmsError, KmsResult};
use crate::material;
use async_trait::async_trait;
use keyledger_config::ProviderConfig;
use keyledger_types::{BindingContext, EnvelopeAlgorithm, EnvelopeCiphertext};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

pub struct ProviderEnvelope {
    endpoint: String,
    key_id: String,
    timeout: Duration,
    client: reqwest::Client,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WrapRequest<'a> {
    key_id: &'a str,
    plaintext: String,
    encryption_context: &'a BindingContext,
}

#[derive(Deserialize)]
struct WrapResponse {
    ciphertext: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnwrapRequest<'a> {
    key_id: &'a str,
    ciphertext: &'a str,
    encryption_context: &'a BindingContext,
}

#[derive(Deserialize)]
struct UnwrapResponse {
    plaintext: String,
}

impl ProviderEnvelope {
    pub fn new(config: &ProviderConfig) -> KmsResult<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| KmsError::Configuration("provider endpoint is not set".to_string()))?;
        let key_id = config
            .key_id
            .clone()
            .ok_or_else(|| KmsError::Configuration("provider key id is not set".to_string()))?;
        let timeout = Duration::from_millis(config.timeout_ms);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KmsError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            key_id,
            timeout,
            client,
        })
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> KmsResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: for<'de> Deserialize<'de>,
    {
        let url = format!("{}/{}", self.endpoint, path);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, path, "Envelope provider rejected request");
            return Err(KmsError::Provider(format!(
                "provider {} failed ({}): {}",
                path, status, error_text
            )));
        }

        response.json::<Resp>().await.map_err(|e| self.transport_error(e))
    }

    fn transport_error(&self, err: reqwest::Error) -> KmsError {
        if err.is_timeout() {
            KmsError::Timeout(self.timeout)
        } else {
            KmsError::Provider(err.to_string())
        }
    }
}

#[async_trait]
impl EnvelopeCipher for ProviderEnvelope {
    async fn wrap(&self, material: &[u8], context: &BindingContext) -> KmsResult<EnvelopeCiphertext> {
        let request = WrapRequest {
            key_id: &self.key_id,
            plaintext: material::encode_b64(material),
            encryption_context: context,
        };
        let response: WrapResponse = self.post("wrap", &request).await?;
        debug!(provider_key_id = %self.key_id, "Wrapped key material with provider");

        Ok(EnvelopeCiphertext::provider(
            response.ciphertext,
            self.key_id.clone(),
            context.clone(),
        ))
    }

    async fn unwrap(&self, envelope: &EnvelopeCiphertext) -> KmsResult<Vec<u8>> {
        ensure_algorithm(envelope, EnvelopeAlgorithm::ExternalProvider)?;

        let key_id = envelope.provider_key_id.as_deref().unwrap_or(&self.key_id);
        let request = UnwrapRequest {
            key_id,
            ciphertext: &envelope.ciphertext,
            encryption_context: &envelope.context,
        };
        let response: UnwrapResponse = self.post("unwrap", &request).await?;

        material::decode_b64("provider plaintext", &response.plaintext)
            .map_err(|_| KmsError::Provider("provider returned malformed plaintext".to_string()))
    }

    fn algorithm(&self) -> EnvelopeAlgorithm {
        EnvelopeAlgorithm::ExternalProvider
    }

    fn backend_name(&self) -> &'static str {
        "provider"
    }
}
