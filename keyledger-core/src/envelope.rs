//! Envelope protection of key material at rest
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
use crate::local_envelope::LocalEnvelope;
use crate::provider_envelope::ProviderEnvelope;
use async_trait::async_trait;
use keyledger_config::{EnvelopeBackend, EnvelopeConfig};
use keyledger_types::{BindingContext, EnvelopeAlgorithm, EnvelopeCiphertext};
use std::sync::Arc;
use tracing::info;

/// Wraps and unwraps raw key material
///
/// The binding context is authenticated into every wrap; unwrapping with a
/// different context must fail.
#[async_trait]
pub trait EnvelopeCipher: Send + Sync {
    async fn wrap(&self, material: &[u8], context: &BindingContext) -> KmsResult<EnvelopeCiphertext>;

    async fn unwrap(&self, envelope: &EnvelopeCiphertext) -> KmsResult<Vec<u8>>;

    /// Algorithm tag this backend writes and accepts
    fn algorithm(&self) -> EnvelopeAlgorithm;

    fn backend_name(&self) -> &'static str;
}

/// Canonical JSON of a binding context (keys sorted)
pub fn context_bytes(context: &BindingContext) -> KmsResult<Vec<u8>> {
    Ok(serde_json::to_vec(context)?)
}

/// Reject envelopes written by another backend
pub(crate) fn ensure_algorithm(
    envelope: &EnvelopeCiphertext,
    expected: EnvelopeAlgorithm,
) -> KmsResult<()> {
    if envelope.algorithm != expected {
        return Err(KmsError::Validation(format!(
            "envelope algorithm {} does not match configured backend ({})",
            envelope.algorithm.as_str(),
            expected.as_str()
        )));
    }
    Ok(())
}

/// Build the configured backend
pub fn from_config(config: &EnvelopeConfig) -> KmsResult<Arc<dyn EnvelopeCipher>> {
    let cipher: Arc<dyn EnvelopeCipher> = match config.backend {
        EnvelopeBackend::Local => Arc::new(LocalEnvelope::from_secret(config.master_key.as_deref())),
        EnvelopeBackend::Provider => Arc::new(ProviderEnvelope::new(&config.provider)?),
    };
    info!(backend = cipher.backend_name(), "Envelope backend selected");
    Ok(cipher)
}
