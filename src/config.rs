use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::error::TransportError;
use crate::{DEFAULT_RETRY_BACKOFF_MS, MAX_OUTSTANDING};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Upper bound on sends issued to the broker and not yet completed.
    pub max_outstanding: usize,
    /// Fixed pause between a failed attempt and its resubmission.
    pub retry_backoff_ms: u64,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    pub transport_id: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_outstanding: MAX_OUTSTANDING,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            max_retries: None,
            transport_id: Uuid::new_v4().to_string(),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.max_outstanding == 0 {
            return Err(TransportError::Config("max_outstanding must be > 0".into()));
        }
        if self.max_outstanding > Semaphore::MAX_PERMITS {
            return Err(TransportError::Config(format!(
                "max_outstanding must be <= {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.retry_backoff_ms == 0 {
            return Err(TransportError::Config("retry_backoff_ms must be > 0".into()));
        }
        if self.transport_id.trim().is_empty() {
            return Err(TransportError::Config("transport_id cannot be empty".into()));
        }
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
