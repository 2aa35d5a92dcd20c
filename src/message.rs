use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;

use crate::error::TransportError;
use crate::RETRY_COUNT_KEY;

const NO_MESSAGE_ID: &str = "<none>";

/// Returns the identifier unchanged unless it is absent, empty or whitespace.
pub fn normalize_id(id: Option<&str>) -> Option<String> {
    id.filter(|s| !s.trim().is_empty()).map(str::to_owned)
}

/// A serialized message on its way to the broker.
///
/// Identifiers are fixed at creation. The retry count is the only state that
/// changes afterwards, and only the retry scheduler touches it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    payload: Bytes,
    correlation_id: Option<String>,
    message_id: Option<String>,
    retry_count: Option<u32>,
}

impl OutboundMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            correlation_id: None,
            message_id: None,
            retry_count: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl AsRef<str>) -> Self {
        self.correlation_id = normalize_id(Some(id.as_ref()));
        self
    }

    pub fn with_message_id(mut self, id: impl AsRef<str>) -> Self {
        self.message_id = normalize_id(Some(id.as_ref()));
        self
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Message id for log lines.
    pub fn log_id(&self) -> &str {
        self.message_id().unwrap_or(NO_MESSAGE_ID)
    }

    /// Number of retries scheduled so far; zero until the first failure.
    pub fn retry_count(&self) -> u32 {
        self.retry_count.unwrap_or(0)
    }

    pub(crate) fn increment_retry_count(&mut self) -> u32 {
        let next = self.retry_count().saturating_add(1);
        self.retry_count = Some(next);
        next
    }

    /// Application properties sent along with the payload.
    pub fn properties(&self) -> BTreeMap<&'static str, String> {
        let mut props = BTreeMap::new();
        if let Some(retries) = self.retry_count {
            props.insert(RETRY_COUNT_KEY, retries.to_string());
        }
        props
    }
}

/// Caller-side description of a message to send.
pub trait SendContext: Send + Sync {
    fn serialize_to(&self, sink: &mut dyn Write) -> Result<(), TransportError>;

    fn correlation_id(&self) -> Option<&str> {
        None
    }

    fn message_id(&self) -> Option<&str> {
        None
    }
}

/// Serializes the context and attaches whichever identifiers are set.
pub(crate) fn build_message(context: &dyn SendContext) -> Result<OutboundMessage, TransportError> {
    let mut body = BytesMut::new().writer();
    context.serialize_to(&mut body)?;

    let mut message = OutboundMessage::new(body.into_inner().freeze());
    message.correlation_id = normalize_id(context.correlation_id());
    message.message_id = normalize_id(context.message_id());
    Ok(message)
}

/// Send context whose body is written out as JSON.
#[derive(Clone, Debug)]
pub struct JsonSendContext<T> {
    body: T,
    correlation_id: Option<String>,
    message_id: Option<String>,
}

impl<T: Serialize + Send + Sync> JsonSendContext<T> {
    pub fn new(body: T) -> Self {
        Self {
            body,
            correlation_id: None,
            message_id: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

impl<T: Serialize + Send + Sync> SendContext for JsonSendContext<T> {
    fn serialize_to(&self, sink: &mut dyn Write) -> Result<(), TransportError> {
        serde_json::to_writer(sink, &self.body)?;
        Ok(())
    }

    fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }
}
