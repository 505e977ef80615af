//! Process-wide job health.
//!
//! Jobs report fatal failures through an injected [`HealthCheck`] handle. An
//! external liveness surface reads the aggregated state from [`JobHealth`].

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::warn;

/// Sink for health reports. Reporting never fails.
pub trait HealthCheck: Send + Sync {
    fn mark_unhealthy(&self, job_id: &str, message: &str);
}

/// A recorded health failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnhealthyJob {
    pub job_id: String,
    pub message: String,
    pub marked_at: DateTime<Utc>,
}

/// In-process [`HealthCheck`] keeping the latest failure per job.
#[derive(Debug, Default)]
pub struct JobHealth {
    unhealthy: Mutex<BTreeMap<String, UnhealthyJob>>,
}

impl JobHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` while no job has been marked unhealthy.
    pub fn is_healthy(&self) -> bool {
        self.unhealthy.lock().unwrap().is_empty()
    }

    pub fn unhealthy_jobs(&self) -> Vec<UnhealthyJob> {
        self.unhealthy.lock().unwrap().values().cloned().collect()
    }
}

impl HealthCheck for JobHealth {
    fn mark_unhealthy(&self, job_id: &str, message: &str) {
        warn!(job = job_id, message, "job marked unhealthy");
        self.unhealthy.lock().unwrap().insert(
            job_id.to_string(),
            UnhealthyJob {
                job_id: job_id.to_string(),
                message: message.to_string(),
                marked_at: Utc::now(),
            },
        );
    }
}
