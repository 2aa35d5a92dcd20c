#![allow(dead_code)]

use async_trait::async_trait;
use outbound_transport::{
    EndpointAddress, MessageSender, OutboundMessage, OutboundTransport, SendError,
    SharedConnectionHandler, TransportConfig, TransportError,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

// ============================================================================
// Scripted broker client
// ============================================================================

#[derive(Clone, Debug)]
pub struct Attempt {
    pub message: OutboundMessage,
    pub started_at: Instant,
    pub succeeded: bool,
}

/// Broker fake that fails chosen messages according to a script.
pub struct ScriptedSender {
    latency: Duration,
    scripted: Mutex<HashMap<String, VecDeque<SendError>>>,
    always_failing: Mutex<HashMap<String, SendError>>,
    attempts: Mutex<Vec<Attempt>>,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedSender {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            scripted: Mutex::new(HashMap::new()),
            always_failing: Mutex::new(HashMap::new()),
            attempts: Mutex::new(Vec::new()),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// The next `times` attempts for `message_id` fail with `error`.
    pub fn fail_next(&self, message_id: &str, times: usize, error: SendError) {
        self.scripted
            .lock()
            .unwrap()
            .entry(message_id.to_string())
            .or_default()
            .extend(std::iter::repeat(error).take(times));
    }

    pub fn fail_forever(&self, message_id: &str, error: SendError) {
        self.always_failing
            .lock()
            .unwrap()
            .insert(message_id.to_string(), error);
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn attempts_for(&self, message_id: &str) -> Vec<Attempt> {
        self.attempts()
            .into_iter()
            .filter(|a| a.message.message_id() == Some(message_id))
            .collect()
    }

    /// Most sends this fake ever saw running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, message: &OutboundMessage) -> Result<(), SendError> {
        let Some(id) = message.message_id() else {
            return Ok(());
        };
        if let Some(error) = self.always_failing.lock().unwrap().get(id) {
            return Err(error.clone());
        }
        match self
            .scripted
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MessageSender for ScriptedSender {
    async fn send(&self, message: &OutboundMessage) -> Result<(), SendError> {
        let started_at = Instant::now();
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.latency).await;
        let outcome = self.next_outcome(message);

        self.current.fetch_sub(1, Ordering::SeqCst);
        self.attempts.lock().unwrap().push(Attempt {
            message: message.clone(),
            started_at,
            succeeded: outcome.is_ok(),
        });
        outcome
    }
}

// ============================================================================
// Recording address
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddressEvent {
    BeginSend(Option<String>),
    EndSend(Option<String>),
    RetryScheduled {
        message_id: Option<String>,
        in_flight: usize,
        sleeping: usize,
    },
}

pub struct RecordingAddress {
    uri: Url,
    events: Mutex<Vec<AddressEvent>>,
    disposed: AtomicBool,
}

impl RecordingAddress {
    pub fn new() -> Self {
        Self {
            uri: Url::parse("sb://test-namespace/orders").unwrap(),
            events: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn events(&self) -> Vec<AddressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn end_sends_for(&self, message_id: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, AddressEvent::EndSend(Some(id)) if id == message_id))
            .count()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl EndpointAddress for RecordingAddress {
    fn uri(&self) -> &Url {
        &self.uri
    }

    fn log_begin_send(&self, message_id: Option<&str>) {
        self.events
            .lock()
            .unwrap()
            .push(AddressEvent::BeginSend(message_id.map(str::to_owned)));
    }

    fn log_end_send(&self, message_id: Option<&str>) {
        self.events
            .lock()
            .unwrap()
            .push(AddressEvent::EndSend(message_id.map(str::to_owned)));
    }

    fn log_send_retry_scheduled(&self, message_id: Option<&str>, in_flight: usize, sleeping: usize) {
        self.events.lock().unwrap().push(AddressEvent::RetryScheduled {
            message_id: message_id.map(str::to_owned),
            in_flight,
            sleeping,
        });
    }

    fn dispose(&self) -> Result<(), TransportError> {
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub transport: Arc<OutboundTransport>,
    pub sender: Arc<ScriptedSender>,
    pub address: Arc<RecordingAddress>,
}

pub fn harness(config: TransportConfig, latency: Duration) -> Harness {
    harness_with(config, latency, |builder| builder)
}

pub fn harness_with(
    config: TransportConfig,
    latency: Duration,
    customize: impl FnOnce(outbound_transport::TransportBuilder) -> outbound_transport::TransportBuilder,
) -> Harness {
    let sender = Arc::new(ScriptedSender::new(latency));
    let address = Arc::new(RecordingAddress::new());
    let handler = Arc::new(SharedConnectionHandler::new(sender.clone()));

    let builder = OutboundTransport::builder()
        .address(address.clone())
        .connection_handler(handler)
        .config(config);
    let transport = Arc::new(customize(builder).build().unwrap());

    Harness {
        transport,
        sender,
        address,
    }
}

/// Polls until `done` holds, failing the test after a generous virtual deadline.
pub async fn wait_until(transport: &OutboundTransport, done: impl Fn(&OutboundTransport) -> bool) {
    for _ in 0..10_000 {
        if done(transport) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached: {:?}", transport.metrics());
}

pub fn unique_ids(attempts: &[Attempt]) -> HashSet<String> {
    attempts
        .iter()
        .filter_map(|a| a.message.message_id().map(str::to_owned))
        .collect()
}
