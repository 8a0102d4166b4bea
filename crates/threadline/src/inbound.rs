//! Inbound pipeline: gateway message → access checks → context store → bus.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use threadline_protocol::{BusMessage, ConversationInfo, Mention, RoutingHint, Segment, SenderInfo};

use crate::config::{AccessList, ChatConfig, Config, ListMode};
use crate::context::ContextStore;

// ============================================================================
// InboundMessage
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub id: String,
    pub username: String,
    /// Account-wide display name.
    pub display_name: Option<String>,
    /// Per-guild nickname.
    pub nickname: Option<String>,
    /// Authored by the bridge's own account.
    pub is_self: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundAttachment {
    pub url: String,
    pub filename: String,
    pub content_type: Option<String>,
}

/// A chat message as seen by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub message_id: String,
    pub conversation_id: String,
    pub conversation_name: Option<String>,
    /// Set when the message was posted in a sub-conversation.
    pub parent_id: Option<String>,
    /// Absent for direct messages.
    pub guild_id: Option<String>,
    pub author: Author,
    pub content: String,
    /// Users, roles and `@everyone` mentioned in the message.
    pub mention: Option<Mention>,
    pub attachments: Vec<InboundAttachment>,
    /// Sticker names.
    pub stickers: Vec<String>,
    pub reply_to: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    pub fn is_sub_conversation(&self) -> bool {
        self.parent_id.is_some()
    }

    pub fn is_direct(&self) -> bool {
        self.guild_id.is_none()
    }
}

// ============================================================================
// Publishing
// ============================================================================

#[derive(Debug, Error)]
#[error("failed to publish bus message: {0}")]
pub struct PublishError(pub String);

/// Receives bus messages produced from gateway traffic.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, message: BusMessage) -> Result<(), PublishError>;
}

// ============================================================================
// Access policy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    OwnMessage,
    ThreadInteractionDisabled,
    User,
    Guild,
    Channel,
    Thread,
    /// Nothing left to publish (embed-only messages and the like).
    Empty,
}

#[derive(Debug)]
struct IdFilter {
    mode: ListMode,
    ids: HashSet<String>,
}

impl IdFilter {
    fn allows(&self, id: &str) -> bool {
        match self.mode {
            ListMode::Disabled => true,
            ListMode::Whitelist => self.ids.contains(id),
            ListMode::Blacklist => !self.ids.contains(id),
        }
    }
}

impl From<&AccessList> for IdFilter {
    fn from(list: &AccessList) -> Self {
        Self {
            mode: list.mode,
            ids: list.id_set(),
        }
    }
}

#[derive(Debug)]
pub struct AccessPolicy {
    users: IdFilter,
    guilds: IdFilter,
    channels: IdFilter,
    threads: IdFilter,
    allow_thread_interaction: bool,
    inherit_channel_permissions: bool,
}

impl AccessPolicy {
    pub fn new(config: &ChatConfig) -> Self {
        Self {
            users: IdFilter::from(&config.users),
            guilds: IdFilter::from(&config.guilds),
            channels: IdFilter::from(&config.channels),
            threads: IdFilter::from(&config.threads),
            allow_thread_interaction: config.allow_thread_interaction,
            inherit_channel_permissions: config.inherit_channel_permissions,
        }
    }

    pub fn check(&self, message: &InboundMessage) -> Result<(), DropReason> {
        if message.is_sub_conversation() && !self.allow_thread_interaction {
            return Err(DropReason::ThreadInteractionDisabled);
        }
        if !self.users.allows(&message.author.id) {
            return Err(DropReason::User);
        }
        // Direct messages are only subject to the user list.
        let Some(guild_id) = &message.guild_id else {
            return Ok(());
        };
        if !self.guilds.allows(guild_id) {
            return Err(DropReason::Guild);
        }
        match &message.parent_id {
            Some(parent_id) if self.inherit_channel_permissions => {
                if !self.channels.allows(parent_id) {
                    return Err(DropReason::Channel);
                }
            }
            Some(_) => {
                if !self.threads.allows(&message.conversation_id) {
                    return Err(DropReason::Thread);
                }
            }
            None => {
                if !self.channels.allows(&message.conversation_id) {
                    return Err(DropReason::Channel);
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// InboundPipeline
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Published,
    Dropped(DropReason),
    PublishFailed,
}

pub struct InboundPipeline {
    policy: AccessPolicy,
    store: Arc<ContextStore>,
    publisher: Arc<dyn BusPublisher>,
    platform: String,
    memory_inheritance: bool,
}

impl InboundPipeline {
    pub fn new(config: &Config, store: Arc<ContextStore>, publisher: Arc<dyn BusPublisher>) -> Self {
        Self {
            policy: AccessPolicy::new(&config.chat),
            store,
            publisher,
            platform: config.bus.platform_name.clone(),
            memory_inheritance: config.chat.inherit_channel_memory,
        }
    }

    /// Consume messages until the channel closes or shutdown is requested.
    pub async fn run(self, mut messages: mpsc::UnboundedReceiver<InboundMessage>, shutdown: CancellationToken) {
        debug!("Inbound pipeline started");
        loop {
            tokio::select! {
                message = messages.recv() => match message {
                    Some(message) => {
                        self.process(message).await;
                    }
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("Inbound pipeline stopped");
    }

    pub async fn process(&self, message: InboundMessage) -> InboundOutcome {
        if message.author.is_self {
            return InboundOutcome::Dropped(DropReason::OwnMessage);
        }
        if let Err(reason) = self.policy.check(&message) {
            debug!(
                message_id = %message.message_id,
                conversation_id = %message.conversation_id,
                ?reason,
                "Dropping inbound message"
            );
            return InboundOutcome::Dropped(reason);
        }

        self.track_context(&message);

        let Some(bus_message) = self.to_bus_message(&message) else {
            debug!(message_id = %message.message_id, "Inbound message has no content, not publishing");
            return InboundOutcome::Dropped(DropReason::Empty);
        };
        match self.publisher.publish(bus_message).await {
            Ok(()) => InboundOutcome::Published,
            Err(e) => {
                warn!(message_id = %message.message_id, error = %e, "Failed to publish inbound message");
                InboundOutcome::PublishFailed
            }
        }
    }

    fn track_context(&self, message: &InboundMessage) {
        match &message.parent_id {
            Some(parent_id) if self.memory_inheritance => {
                self.store.update(parent_id, &message.conversation_id);
                debug!(
                    parent_id = %parent_id,
                    sub_id = %message.conversation_id,
                    "Recorded active sub-conversation"
                );
            }
            Some(_) => {}
            None => {
                if let Some(previous) = self.store.clear(&message.conversation_id) {
                    debug!(
                        parent_id = %message.conversation_id,
                        previous = %previous,
                        "Cleared sub-conversation mapping"
                    );
                }
            }
        }
    }

    /// `None` when the message carries nothing but metadata.
    pub fn to_bus_message(&self, message: &InboundMessage) -> Option<BusMessage> {
        let mut segments = Vec::new();
        if let Some(parent_id) = &message.parent_id {
            segments.push(Segment::RoutingHint(RoutingHint {
                original_thread_id: message.conversation_id.clone(),
                parent_channel_id: Some(parent_id.clone()),
            }));
        }
        if let Some(reply_to) = &message.reply_to {
            segments.push(Segment::reply(reply_to.clone()));
        }
        if let Some(mention) = &message.mention
            && (mention.everyone || !mention.users.is_empty() || !mention.roles.is_empty())
        {
            segments.push(Segment::Mention(mention.clone()));
        }
        let mut text = message.content.clone();
        for sticker in &message.stickers {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(&format!("[sticker: {sticker}]"));
        }
        if !text.is_empty() {
            segments.push(Segment::text(text));
        }
        segments.extend(
            message
                .attachments
                .iter()
                .map(|attachment| Segment::File(attachment.url.clone())),
        );
        if segments.iter().all(Segment::is_metadata) {
            return None;
        }

        let conversation = (!message.is_direct()).then(|| {
            let conversation_id = match &message.parent_id {
                Some(parent_id) if self.memory_inheritance => parent_id.clone(),
                _ => message.conversation_id.clone(),
            };
            ConversationInfo {
                conversation_id,
                name: message.conversation_name.clone(),
            }
        });

        let author = &message.author;
        Some(BusMessage {
            message_id: message.message_id.clone(),
            platform: self.platform.clone(),
            sender: SenderInfo {
                platform: self.platform.clone(),
                user_id: author.id.clone(),
                nickname: Some(
                    author
                        .display_name
                        .clone()
                        .unwrap_or_else(|| author.username.clone()),
                ),
                cardname: author.nickname.clone(),
            },
            conversation,
            segment: Segment::list(segments),
            raw_text: message.content.clone(),
            timestamp: message.timestamp,
        })
    }
}
