use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};
use url::Url;

use crate::error::TransportError;

pub const MAX_ADDRESS_LENGTH: usize = 2048;
const ALLOWED_SCHEMES: &[&str] = &["sb", "amqp", "amqps", "azure-sb"];

/// The remote entity a transport sends to.
///
/// Besides naming the target, the address is the observability sink for the
/// send pipeline and a resource the transport releases on dispose.
pub trait EndpointAddress: Send + Sync {
    fn uri(&self) -> &Url;

    fn log_begin_send(&self, message_id: Option<&str>);

    fn log_end_send(&self, message_id: Option<&str>);

    fn log_send_retry_scheduled(&self, message_id: Option<&str>, in_flight: usize, sleeping: usize);

    fn dispose(&self) -> Result<(), TransportError>;
}

#[derive(Debug, Default)]
struct AddressMetrics {
    sends_begun: AtomicU64,
    sends_ended: AtomicU64,
    retries_scheduled: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressMetricsSnapshot {
    pub sends_begun: u64,
    pub sends_ended: u64,
    pub retries_scheduled: u64,
}

/// Validated broker address, e.g. `sb://my-namespace.servicebus.windows.net/orders`.
#[derive(Debug)]
pub struct BrokerAddress {
    uri: Url,
    entity_path: String,
    metrics: AddressMetrics,
    disposed: AtomicBool,
}

impl BrokerAddress {
    pub fn parse(address: impl AsRef<str>) -> Result<Self, TransportError> {
        let raw = address.as_ref().trim();
        let invalid = |reason: String| TransportError::InvalidAddress {
            address: Self::truncate(raw),
            reason,
        };

        if raw.is_empty() {
            return Err(invalid("address cannot be empty".into()));
        }
        if raw.len() > MAX_ADDRESS_LENGTH {
            return Err(invalid(format!(
                "address exceeds maximum length of {MAX_ADDRESS_LENGTH} bytes"
            )));
        }

        let uri = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;

        if !ALLOWED_SCHEMES.contains(&uri.scheme()) {
            return Err(invalid(format!(
                "unsupported scheme '{}', expected one of {}",
                uri.scheme(),
                ALLOWED_SCHEMES.join(", ")
            )));
        }
        if uri.host_str().map_or(true, str::is_empty) {
            return Err(invalid("address must have a host".into()));
        }

        let entity_path = uri.path().trim_matches('/').to_string();
        if entity_path.is_empty() {
            return Err(invalid("address must name a queue or topic".into()));
        }

        debug!(address = %uri, entity = %entity_path, "parsed broker address");

        Ok(Self {
            uri,
            entity_path,
            metrics: AddressMetrics::default(),
            disposed: AtomicBool::new(false),
        })
    }

    /// Queue or topic name, without surrounding slashes.
    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> AddressMetricsSnapshot {
        AddressMetricsSnapshot {
            sends_begun: self.metrics.sends_begun.load(Ordering::Relaxed),
            sends_ended: self.metrics.sends_ended.load(Ordering::Relaxed),
            retries_scheduled: self.metrics.retries_scheduled.load(Ordering::Relaxed),
        }
    }

    fn truncate(address: &str) -> String {
        const SHOWN: usize = 100;
        match address.char_indices().nth(SHOWN) {
            Some((idx, _)) => format!("{}...", &address[..idx]),
            None => address.to_string(),
        }
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uri.as_str())
    }
}

impl EndpointAddress for BrokerAddress {
    fn uri(&self) -> &Url {
        &self.uri
    }

    fn log_begin_send(&self, message_id: Option<&str>) {
        self.metrics.sends_begun.fetch_add(1, Ordering::Relaxed);
        debug!(address = %self.uri, message_id = ?message_id, "begin send");
    }

    fn log_end_send(&self, message_id: Option<&str>) {
        self.metrics.sends_ended.fetch_add(1, Ordering::Relaxed);
        debug!(address = %self.uri, message_id = ?message_id, "end send");
    }

    fn log_send_retry_scheduled(&self, message_id: Option<&str>, in_flight: usize, sleeping: usize) {
        self.metrics.retries_scheduled.fetch_add(1, Ordering::Relaxed);
        debug!(
            address = %self.uri,
            message_id = ?message_id,
            in_flight,
            sleeping,
            "send retry scheduled"
        );
    }

    fn dispose(&self) -> Result<(), TransportError> {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            info!(address = %self.uri, "address released");
        }
        Ok(())
    }
}
