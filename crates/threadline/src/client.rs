//! Boundary between the core and a concrete chat gateway.
//!
//! A [`GatewayClient`] owns one live connection. Clients are never reused:
//! after a disconnect the supervisor asks the [`GatewayFactory`] for a fresh
//! one. Lifecycle callbacks are delivered as [`GatewayEvent`]s through the
//! [`EventSink`] the client was built with, stamped with the client's
//! generation so events from a replaced client can be told apart.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::inbound::InboundMessage;

// ============================================================================
// Events
// ============================================================================

/// Something the gateway reported.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Session established and usable.
    Ready,
    /// Session resumed after a transient drop.
    Resumed,
    /// The connection went away without being asked to.
    Disconnected,
    /// A chat message was received.
    Message(InboundMessage),
}

/// A [`GatewayEvent`] tagged with the generation of the client that emitted it.
#[derive(Debug, Clone)]
pub struct StampedEvent {
    pub generation: u64,
    pub event: GatewayEvent,
}

/// Sending half handed to each client at construction.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<StampedEvent>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<StampedEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Emit an event. Returns false once the supervisor has gone away.
    pub fn emit(&self, event: GatewayEvent) -> bool {
        self.tx
            .send(StampedEvent {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

// ============================================================================
// Surfaces
// ============================================================================

/// Send permissions the bridge holds on a surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendPermissions {
    pub send_messages: bool,
    pub send_in_sub_conversations: bool,
}

impl SendPermissions {
    pub const ALL: Self = Self {
        send_messages: true,
        send_in_sub_conversations: true,
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceKind {
    /// Top-level channel that can spawn sub-conversations.
    Parent,
    /// Thread spawned from a parent.
    SubConversation { parent_id: String },
    /// Direct-message channel with a single user.
    Direct,
    /// Anything messages cannot be routed to (voice, category, ...).
    Other,
}

/// A place messages can be sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Surface {
    pub id: String,
    pub kind: SurfaceKind,
    pub permissions: SendPermissions,
}

impl Surface {
    pub fn parent(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: SurfaceKind::Parent,
            permissions: SendPermissions::ALL,
        }
    }

    pub fn sub_conversation(id: impl Into<String>, parent_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: SurfaceKind::SubConversation {
                parent_id: parent_id.into(),
            },
            permissions: SendPermissions::ALL,
        }
    }

    pub fn direct(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: SurfaceKind::Direct,
            permissions: SendPermissions::ALL,
        }
    }

    pub fn with_permissions(mut self, permissions: SendPermissions) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn is_sub_conversation(&self) -> bool {
        matches!(self.kind, SurfaceKind::SubConversation { .. })
    }

    /// Parent id for sub-conversations, own id for parents.
    pub fn family_root(&self) -> Option<&str> {
        match &self.kind {
            SurfaceKind::Parent => Some(&self.id),
            SurfaceKind::SubConversation { parent_id } => Some(parent_id),
            SurfaceKind::Direct | SurfaceKind::Other => None,
        }
    }

    /// Whether the permission relevant to this surface's kind is held.
    pub fn can_send(&self) -> bool {
        match self.kind {
            SurfaceKind::SubConversation { .. } => self.permissions.send_in_sub_conversations,
            SurfaceKind::Parent | SurfaceKind::Direct => self.permissions.send_messages,
            SurfaceKind::Other => false,
        }
    }
}

/// Location of an existing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHandle {
    pub surface_id: String,
    pub message_id: String,
}

// ============================================================================
// Outgoing messages
// ============================================================================

#[derive(Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub data: Vec<u8>,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("filename", &self.filename)
            .field("len", &self.data.len())
            .finish()
    }
}

/// One send call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub content: Option<String>,
    pub attachments: Vec<Attachment>,
    pub reply_to: Option<MessageHandle>,
}

// ============================================================================
// Errors
// ============================================================================

/// Coarse classification of connect failures, used for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    /// Rejected credentials. Never retried.
    Authentication,
    Timeout,
    Dns,
    Tls,
    Http,
    Io,
    Other,
}

impl ConnectErrorKind {
    /// Best-effort classification from an error message.
    pub fn classify(message: &str) -> Self {
        let message = message.to_ascii_lowercase();
        if message.contains("unauthorized")
            || message.contains("invalid authentication")
            || message.contains("improper token")
        {
            Self::Authentication
        } else if message.contains("timed out") || message.contains("timeout") {
            Self::Timeout
        } else if message.contains("dns")
            || message.contains("resolve")
            || message.contains("name or service not known")
        {
            Self::Dns
        } else if message.contains("tls")
            || message.contains("ssl")
            || message.contains("certificate")
        {
            Self::Tls
        } else if message.contains("http") {
            Self::Http
        } else if message.contains("connection") || message.contains("broken pipe") {
            Self::Io
        } else {
            Self::Other
        }
    }

    /// Operator hint logged alongside the failure.
    pub fn hint(self) -> &'static str {
        match self {
            Self::Authentication => "check the configured bot token",
            Self::Timeout => "the gateway did not answer in time",
            Self::Dns => "hostname resolution failed, check DNS settings",
            Self::Tls => "TLS handshake failed, check proxy or certificate settings",
            Self::Http => "the gateway returned an HTTP error",
            Self::Io => "the network connection failed",
            Self::Other => "unclassified connection error",
        }
    }
}

impl fmt::Display for ConnectErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Authentication => "authentication",
            Self::Timeout => "timeout",
            Self::Dns => "dns",
            Self::Tls => "tls",
            Self::Http => "http",
            Self::Io => "io",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind} error: {message}")]
pub struct ConnectError {
    pub kind: ConnectErrorKind,
    pub message: String,
}

impl ConnectError {
    pub fn new(kind: ConnectErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ConnectErrorKind::Authentication, message)
    }

    /// Classify from the message text.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(ConnectErrorKind::classify(&message), message)
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ConnectErrorKind::Authentication
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("not found")]
    NotFound,

    #[error("access forbidden")]
    Forbidden,

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("gateway error: {0}")]
    Gateway(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("surface not found")]
    NotFound,

    #[error("missing permission to send")]
    Forbidden,

    #[error("message rejected: {0}")]
    Rejected(String),

    #[error("gateway error: {0}")]
    Gateway(String),
}

// ============================================================================
// Traits
// ============================================================================

/// One gateway connection plus the REST-style lookups the core needs.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Run the connection. Resolves when it closes or fails.
    async fn connect(&self) -> Result<(), ConnectError>;

    /// Tear the connection down. Safe to call more than once.
    async fn close(&self);

    fn is_closed(&self) -> bool;

    async fn is_ready(&self) -> bool;

    /// Heartbeat round-trip in seconds, if known.
    async fn latency(&self) -> Option<f64>;

    /// Authenticated round-trip used as an active health probe.
    async fn fetch_self(&self) -> Result<(), LookupError>;

    /// Surface from the client's local cache, without I/O.
    fn cached_surface(&self, id: &str) -> Option<Surface>;

    async fn fetch_surface(&self, id: &str) -> Result<Surface, LookupError>;

    /// Direct-message surface with a user.
    async fn direct_surface(&self, user_id: &str) -> Result<Surface, LookupError>;

    async fn fetch_message(
        &self,
        surface_id: &str,
        message_id: &str,
    ) -> Result<MessageHandle, LookupError>;

    async fn active_sub_conversations(&self, parent_id: &str) -> Result<Vec<Surface>, LookupError>;

    async fn archived_sub_conversations(
        &self,
        parent_id: &str,
        limit: usize,
    ) -> Result<Vec<Surface>, LookupError>;

    async fn send(
        &self,
        surface_id: &str,
        message: OutgoingMessage,
    ) -> Result<MessageHandle, SendError>;
}

/// Builds fresh clients bound to an event sink.
pub trait GatewayFactory: Send + Sync {
    fn build(&self, events: EventSink) -> Arc<dyn GatewayClient>;
}
