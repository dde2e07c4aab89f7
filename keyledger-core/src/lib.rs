//! Keyledger key management core
//!
//! Versioned key registry with envelope-encrypted material, cryptographic
//! operations over key versions, grant-based authorization and a
//! hash-chained audit ledger with optional external anchoring.
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


pub mod anchor;
pub mod audit;
pub mod canonical;
pub mod clock;
pub mod codec;
pub mod crypto_engine;
pub mod envelope;
pub mod error;
pub mod grants;
pub mod local_envelope;
pub mod material;
pub mod memory_store;
pub mod metrics;
pub mod provider_envelope;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod store;

pub use anchor::{HttpNotarizer, Notarizer};
pub use audit::{AuditEvent, AuditLedger};
pub use clock::{Clock, ManualClock, SystemClock};
pub use crypto_engine::{
    Aad, CryptoEngine, DecryptOutput, DecryptRequest, EncryptOutput, EncryptRequest, SignOutput,
    SignRequest, VerifyOutput, VerifyRequest,
};
pub use envelope::EnvelopeCipher;
pub use error::{ErrorKind, KmsError, KmsResult};
pub use grants::{GrantAuthorizer, GrantSpec};
pub use local_envelope::LocalEnvelope;
pub use memory_store::MemoryStore;
pub use metrics::OpsMetrics;
pub use provider_envelope::ProviderEnvelope;
pub use registry::{CreateKeyRequest, KeyRegistry, KeySummary, RotationAlert};
pub use scheduler::{RotationScheduler, SweepReport};
pub use service::{KmsService, KmsServiceBuilder};
pub use store::{GrantUpsert, KmsStore};
