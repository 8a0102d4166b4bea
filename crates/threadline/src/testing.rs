//! Scripted in-memory gateway for tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Notify, mpsc};

use threadline_protocol::BusMessage;

use crate::client::{
    ConnectError, EventSink, GatewayClient, GatewayEvent, GatewayFactory, LookupError,
    MessageHandle, OutgoingMessage, SendError, Surface,
};
use crate::inbound::{Author, BusPublisher, InboundMessage, PublishError};

/// What the next `connect` call does.
pub(crate) enum ConnectStep {
    /// Emit ready and stay connected until closed.
    Ready,
    /// Stay connecting until closed, never ready.
    Hang,
    Fail(ConnectError),
    /// Emit ready, then fail with the error once closed.
    ReadyThenFail(ConnectError),
}

/// Shared state behind every client the factory builds.
pub(crate) struct MockGateway {
    builds: AtomicUsize,
    connects: AtomicUsize,
    closes: AtomicUsize,
    fetch_self_calls: AtomicUsize,
    fetch_surface_calls: AtomicUsize,
    send_calls: AtomicUsize,
    ready: AtomicBool,
    fetch_self_ok: AtomicBool,
    latency: Mutex<Option<f64>>,
    script: Mutex<VecDeque<ConnectStep>>,
    clients: Mutex<Vec<Arc<MockClient>>>,
    surfaces: Mutex<HashMap<String, Surface>>,
    messages: Mutex<HashSet<(String, String)>>,
    active: Mutex<HashMap<String, Vec<Surface>>>,
    archived: Mutex<HashMap<String, Vec<Surface>>>,
    failing_sends: Mutex<HashSet<usize>>,
    sent: Mutex<Vec<(String, OutgoingMessage)>>,
}

impl MockGateway {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            builds: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            fetch_self_calls: AtomicUsize::new(0),
            fetch_surface_calls: AtomicUsize::new(0),
            send_calls: AtomicUsize::new(0),
            ready: AtomicBool::new(true),
            fetch_self_ok: AtomicBool::new(true),
            latency: Mutex::new(Some(0.05)),
            script: Mutex::new(VecDeque::new()),
            clients: Mutex::new(Vec::new()),
            surfaces: Mutex::new(HashMap::new()),
            messages: Mutex::new(HashSet::new()),
            active: Mutex::new(HashMap::new()),
            archived: Mutex::new(HashMap::new()),
            failing_sends: Mutex::new(HashSet::new()),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn factory(self: &Arc<Self>) -> Arc<dyn GatewayFactory> {
        Arc::new(MockFactory(self.clone()))
    }

    /// A standalone client, not owned by any supervisor.
    pub(crate) fn client(self: &Arc<Self>) -> Arc<MockClient> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(MockClient::new(self.clone(), EventSink::new(0, tx)))
    }

    pub(crate) fn script_connect(&self, steps: impl IntoIterator<Item = ConnectStep>) {
        self.script.lock().unwrap().extend(steps);
    }

    pub(crate) fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn fetch_self_calls(&self) -> usize {
        self.fetch_self_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn fetch_surface_calls(&self) -> usize {
        self.fetch_surface_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub(crate) fn set_latency(&self, latency: Option<f64>) {
        *self.latency.lock().unwrap() = latency;
    }

    pub(crate) fn set_fetch_self_ok(&self, ok: bool) {
        self.fetch_self_ok.store(ok, Ordering::SeqCst);
    }

    pub(crate) fn add_surface(&self, surface: Surface) {
        self.surfaces
            .lock()
            .unwrap()
            .insert(surface.id.clone(), surface);
    }

    pub(crate) fn remove_surface(&self, id: &str) {
        self.surfaces.lock().unwrap().remove(id);
    }

    pub(crate) fn add_message(&self, surface_id: &str, message_id: &str) {
        self.messages
            .lock()
            .unwrap()
            .insert((surface_id.to_string(), message_id.to_string()));
    }

    pub(crate) fn set_active(&self, parent_id: &str, subs: Vec<Surface>) {
        self.active
            .lock()
            .unwrap()
            .insert(parent_id.to_string(), subs);
    }

    pub(crate) fn set_archived(&self, parent_id: &str, subs: Vec<Surface>) {
        self.archived
            .lock()
            .unwrap()
            .insert(parent_id.to_string(), subs);
    }

    /// Make the `index`-th send call (zero based) fail.
    pub(crate) fn fail_send(&self, index: usize) {
        self.failing_sends.lock().unwrap().insert(index);
    }

    pub(crate) fn sent(&self) -> Vec<(String, OutgoingMessage)> {
        self.sent.lock().unwrap().clone()
    }

    /// Emit through the most recently built client.
    pub(crate) fn emit_latest(&self, event: GatewayEvent) {
        let client = self.clients.lock().unwrap().last().cloned();
        if let Some(client) = client {
            client.sink.emit(event);
        }
    }

    /// Emit through the `index`-th built client.
    pub(crate) fn emit_from(&self, index: usize, event: GatewayEvent) {
        let client = self.clients.lock().unwrap().get(index).cloned();
        if let Some(client) = client {
            client.sink.emit(event);
        }
    }

    /// End the latest connection as if the remote side hung up.
    pub(crate) fn drop_connection(&self) {
        let client = self.clients.lock().unwrap().last().cloned();
        if let Some(client) = client {
            client.hangup.notify_one();
        }
    }
}

struct MockFactory(Arc<MockGateway>);

impl GatewayFactory for MockFactory {
    fn build(&self, events: EventSink) -> Arc<dyn GatewayClient> {
        self.0.builds.fetch_add(1, Ordering::SeqCst);
        let client = Arc::new(MockClient::new(self.0.clone(), events));
        self.0.clients.lock().unwrap().push(client.clone());
        client
    }
}

pub(crate) struct MockClient {
    gateway: Arc<MockGateway>,
    sink: EventSink,
    closed: AtomicBool,
    hangup: Notify,
}

impl MockClient {
    fn new(gateway: Arc<MockGateway>, sink: EventSink) -> Self {
        Self {
            gateway,
            sink,
            closed: AtomicBool::new(false),
            hangup: Notify::new(),
        }
    }
}

#[async_trait]
impl GatewayClient for MockClient {
    async fn connect(&self) -> Result<(), ConnectError> {
        self.gateway.connects.fetch_add(1, Ordering::SeqCst);
        let step = self.gateway.script.lock().unwrap().pop_front();
        match step.unwrap_or(ConnectStep::Ready) {
            ConnectStep::Fail(e) => Err(e),
            ConnectStep::Ready => {
                self.sink.emit(GatewayEvent::Ready);
                self.hangup.notified().await;
                Ok(())
            }
            ConnectStep::Hang => {
                self.hangup.notified().await;
                Ok(())
            }
            ConnectStep::ReadyThenFail(e) => {
                self.sink.emit(GatewayEvent::Ready);
                self.hangup.notified().await;
                Err(e)
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.gateway.closes.fetch_add(1, Ordering::SeqCst);
        self.hangup.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn is_ready(&self) -> bool {
        !self.is_closed() && self.gateway.ready.load(Ordering::SeqCst)
    }

    async fn latency(&self) -> Option<f64> {
        *self.gateway.latency.lock().unwrap()
    }

    async fn fetch_self(&self) -> Result<(), LookupError> {
        self.gateway.fetch_self_calls.fetch_add(1, Ordering::SeqCst);
        if self.gateway.fetch_self_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LookupError::Gateway("probe failed".to_string()))
        }
    }

    fn cached_surface(&self, _id: &str) -> Option<Surface> {
        None
    }

    async fn fetch_surface(&self, id: &str) -> Result<Surface, LookupError> {
        self.gateway.fetch_surface_calls.fetch_add(1, Ordering::SeqCst);
        self.gateway
            .surfaces
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(LookupError::NotFound)
    }

    async fn direct_surface(&self, user_id: &str) -> Result<Surface, LookupError> {
        Ok(Surface::direct(format!("dm-{user_id}")))
    }

    async fn fetch_message(
        &self,
        surface_id: &str,
        message_id: &str,
    ) -> Result<MessageHandle, LookupError> {
        let found = self
            .gateway
            .messages
            .lock()
            .unwrap()
            .contains(&(surface_id.to_string(), message_id.to_string()));
        if found {
            Ok(MessageHandle {
                surface_id: surface_id.to_string(),
                message_id: message_id.to_string(),
            })
        } else {
            Err(LookupError::NotFound)
        }
    }

    async fn active_sub_conversations(&self, parent_id: &str) -> Result<Vec<Surface>, LookupError> {
        Ok(self
            .gateway
            .active
            .lock()
            .unwrap()
            .get(parent_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn archived_sub_conversations(
        &self,
        parent_id: &str,
        limit: usize,
    ) -> Result<Vec<Surface>, LookupError> {
        let archived = self.gateway.archived.lock().unwrap();
        Ok(archived
            .get(parent_id)
            .map(|subs| subs.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn send(
        &self,
        surface_id: &str,
        message: OutgoingMessage,
    ) -> Result<MessageHandle, SendError> {
        let index = self.gateway.send_calls.fetch_add(1, Ordering::SeqCst);
        if self.gateway.failing_sends.lock().unwrap().contains(&index) {
            return Err(SendError::Rejected("scripted failure".to_string()));
        }
        if !self.gateway.surfaces.lock().unwrap().contains_key(surface_id)
            && !surface_id.starts_with("dm-")
        {
            return Err(SendError::NotFound);
        }
        self.gateway
            .sent
            .lock()
            .unwrap()
            .push((surface_id.to_string(), message));
        Ok(MessageHandle {
            surface_id: surface_id.to_string(),
            message_id: format!("sent-{index}"),
        })
    }
}

/// Collects published bus messages.
#[derive(Default)]
pub(crate) struct RecordingPublisher {
    messages: Mutex<Vec<BusMessage>>,
}

impl RecordingPublisher {
    pub(crate) fn messages(&self) -> Vec<BusMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl BusPublisher for RecordingPublisher {
    async fn publish(&self, message: BusMessage) -> Result<(), PublishError> {
        self.messages.lock().unwrap().push(message);
        Ok(())
    }
}

/// Guild message from user 7 in guild 1.
pub(crate) fn inbound(message_id: &str, conversation_id: &str) -> InboundMessage {
    InboundMessage {
        message_id: message_id.to_string(),
        conversation_id: conversation_id.to_string(),
        conversation_name: Some("general".to_string()),
        parent_id: None,
        guild_id: Some("1".to_string()),
        author: Author {
            id: "7".to_string(),
            username: "alice".to_string(),
            display_name: Some("Alice".to_string()),
            nickname: None,
            is_self: false,
        },
        content: "hello".to_string(),
        mention: None,
        attachments: Vec::new(),
        stickers: Vec::new(),
        reply_to: None,
        timestamp: Utc::now(),
    }
}

pub(crate) fn inbound_in_thread(message_id: &str, thread_id: &str, parent_id: &str) -> InboundMessage {
    InboundMessage {
        parent_id: Some(parent_id.to_string()),
        ..inbound(message_id, thread_id)
    }
}
