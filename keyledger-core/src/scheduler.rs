//! Periodic rotation of keys whose rotation period has elapsed
//!
//! Each instance sweeps independently; running more than one against the
//! same store needs external leader election.
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


use crate::error::KmsResult;
use crate::service::KmsService;
use keyledger_types::{ActorContext, KeyId, Role};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

/// Principal recorded on scheduled rotations
pub const SCHEDULER_PRINCIPAL: &str = "scheduler";

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub rotated: Vec<KeyId>,
    /// Keys listed as due that were rotated by someone else first
    pub skipped: Vec<KeyId>,
    pub failed: Vec<(KeyId, String)>,
}

pub struct RotationScheduler {
    service: Arc<KmsService>,
    interval: Duration,
}

impl RotationScheduler {
    pub fn new(service: Arc<KmsService>, interval: Duration) -> Self {
        Self { service, interval }
    }

    /// Rotate every due key once; one key failing does not stop the rest
    pub async fn run_once(&self) -> KmsResult<SweepReport> {
        let actor = ActorContext::with_new_request(SCHEDULER_PRINCIPAL, Role::Admin);
        let due = self.service.list_due_for_rotation().await?;
        let mut report = SweepReport::default();

        for key in due {
            match self.service.rotate_due(&actor, &key.id).await {
                Ok(Some(rotated)) => {
                    info!(
                        key_id = %key.id,
                        version = rotated.key.current_version,
                        "Scheduled rotation complete"
                    );
                    report.rotated.push(key.id);
                }
                Ok(None) => report.skipped.push(key.id),
                Err(e) => {
                    error!(key_id = %key.id, error = %e, "Scheduled rotation failed");
                    report.failed.push((key.id, e.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// Sweep on every tick until the task is cancelled
    pub async fn run(&self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "Rotation scheduler started");

        loop {
            ticker.tick().await;
            match self.run_once().await {
                Ok(report) if report.rotated.is_empty() && report.failed.is_empty() => {}
                Ok(report) => info!(
                    rotated = report.rotated.len(),
                    skipped = report.skipped.len(),
                    failed = report.failed.len(),
                    "Rotation sweep finished"
                ),
                Err(e) => error!(error = %e, "Rotation sweep failed"),
            }
        }
    }
}
