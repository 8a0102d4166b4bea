//! [`GatewayClient`] on top of a serenity client.
//!
//! Each [`DiscordClient`] runs exactly one serenity client. REST lookups go
//! through a dedicated [`Http`] handle so they work before the gateway
//! session is up and after it is torn down.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serenity::all::{
    Cache, Channel, ChannelType, Client, ConnectionStage, CreateAttachment, CreateMessage,
    GatewayIntents, GuildChannel, Http, ShardManager,
};
use serenity::gateway::GatewayError;
use tracing::debug;

use threadline::client::{
    ConnectError, EventSink, GatewayClient, GatewayFactory, LookupError, MessageHandle,
    OutgoingMessage, SendError, SendPermissions, Surface, SurfaceKind,
};
use threadline::config::DiscordConfig;

use crate::convert;
use crate::handler::{Handler, SessionState};

// ============================================================================
// Factory
// ============================================================================

pub struct DiscordGatewayFactory {
    token: String,
    intents: GatewayIntents,
}

impl DiscordGatewayFactory {
    pub fn new(config: &DiscordConfig) -> Self {
        Self {
            token: config.token.clone(),
            intents: convert::intents(&config.intents),
        }
    }
}

impl GatewayFactory for DiscordGatewayFactory {
    fn build(&self, events: EventSink) -> Arc<dyn GatewayClient> {
        Arc::new(DiscordClient::new(&self.token, self.intents, events))
    }
}

// ============================================================================
// Client
// ============================================================================

pub struct DiscordClient {
    token: String,
    intents: GatewayIntents,
    http: Arc<Http>,
    sink: EventSink,
    state: Arc<SessionState>,
    shard_manager: OnceLock<Arc<ShardManager>>,
    cache: OnceLock<Arc<Cache>>,
}

impl DiscordClient {
    pub fn new(token: &str, intents: GatewayIntents, sink: EventSink) -> Self {
        Self {
            token: token.to_string(),
            intents,
            http: Arc::new(Http::new(token)),
            sink,
            state: Arc::new(SessionState::default()),
            shard_manager: OnceLock::new(),
            cache: OnceLock::new(),
        }
    }

    fn surface_from_channel(&self, channel: Channel) -> Surface {
        match channel {
            Channel::Guild(channel) => self.surface_from_guild_channel(&channel),
            Channel::Private(channel) => Surface::direct(channel.id.to_string()),
            other => Surface {
                id: other.id().to_string(),
                kind: SurfaceKind::Other,
                permissions: SendPermissions::default(),
            },
        }
    }

    fn surface_from_guild_channel(&self, channel: &GuildChannel) -> Surface {
        let mut permissions = self.permissions_for(channel);
        // Forum posts are threads; the forum itself takes no messages.
        if channel.kind == ChannelType::Forum {
            permissions.send_messages = false;
        }
        Surface {
            id: channel.id.to_string(),
            kind: convert::surface_kind(channel.kind, channel.parent_id),
            permissions,
        }
    }

    /// Permissions from the cache. Threads use their parent's overwrites.
    /// Anything that cannot be computed counts as permitted and is left for
    /// the send itself to reject.
    fn permissions_for(&self, channel: &GuildChannel) -> SendPermissions {
        let (Some(cache), Some(self_id)) = (self.cache.get(), self.state.self_id()) else {
            return SendPermissions::ALL;
        };

        let target = if convert::is_thread(channel.kind) {
            channel.parent_id.and_then(|parent_id| {
                cache
                    .guild(channel.guild_id)
                    .and_then(|guild| guild.channels.get(&parent_id).cloned())
            })
        } else {
            Some(channel.clone())
        };
        let Some(target) = target else {
            return SendPermissions::ALL;
        };

        #[allow(deprecated)]
        let permissions = target.permissions_for_user(cache, self_id);
        match permissions {
            Ok(permissions) => SendPermissions {
                send_messages: permissions.send_messages(),
                send_in_sub_conversations: permissions.send_messages_in_threads(),
            },
            Err(e) => {
                debug!(channel_id = %target.id, error = %e, "Permissions unknown, assuming allowed");
                SendPermissions::ALL
            }
        }
    }

    async fn guild_channel(&self, id: &str) -> Result<GuildChannel, LookupError> {
        let channel_id = convert::channel_id(id)?;
        match self.http.get_channel(channel_id).await.map_err(lookup_error)? {
            Channel::Guild(channel) => Ok(channel),
            _ => Err(LookupError::NotFound),
        }
    }
}

#[async_trait]
impl GatewayClient for DiscordClient {
    async fn connect(&self) -> Result<(), ConnectError> {
        if self.state.is_closed() {
            return Ok(());
        }

        // Reject a bad token before opening a websocket.
        self.http
            .get_current_user()
            .await
            .map_err(connect_error)?;

        let handler = Handler::new(self.sink.clone(), self.state.clone());
        let mut client = Client::builder(&self.token, self.intents)
            .event_handler(handler)
            .await
            .map_err(connect_error)?;

        let _ = self.shard_manager.set(client.shard_manager.clone());
        let _ = self.cache.set(client.cache.clone());
        if self.state.is_closed() {
            client.shard_manager.shutdown_all().await;
            return Ok(());
        }

        debug!(generation = self.sink.generation(), "Starting Discord shard");
        client.start().await.map_err(connect_error)
    }

    async fn close(&self) {
        self.state.mark_closed();
        if let Some(manager) = self.shard_manager.get() {
            manager.shutdown_all().await;
        }
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    async fn is_ready(&self) -> bool {
        if self.state.is_closed() || !self.state.is_ready() {
            return false;
        }
        let Some(manager) = self.shard_manager.get() else {
            return false;
        };
        let runners = manager.runners.lock().await;
        !runners.is_empty()
            && runners
                .values()
                .all(|runner| runner.stage == ConnectionStage::Connected)
    }

    async fn latency(&self) -> Option<f64> {
        let manager = self.shard_manager.get()?;
        let runners = manager.runners.lock().await;
        runners
            .values()
            .filter_map(|runner| runner.latency)
            .max()
            .map(|latency| latency.as_secs_f64())
    }

    async fn fetch_self(&self) -> Result<(), LookupError> {
        self.http
            .get_current_user()
            .await
            .map(|_| ())
            .map_err(lookup_error)
    }

    fn cached_surface(&self, id: &str) -> Option<Surface> {
        let cache = self.cache.get()?;
        let channel_id = convert::channel_id(id).ok()?;
        #[allow(deprecated)]
        let channel = cache.channel(channel_id).map(|channel| GuildChannel::clone(&channel))?;
        Some(self.surface_from_guild_channel(&channel))
    }

    async fn fetch_surface(&self, id: &str) -> Result<Surface, LookupError> {
        let channel_id = convert::channel_id(id)?;
        let channel = self
            .http
            .get_channel(channel_id)
            .await
            .map_err(lookup_error)?;
        Ok(self.surface_from_channel(channel))
    }

    async fn direct_surface(&self, user_id: &str) -> Result<Surface, LookupError> {
        let user_id = convert::user_id(user_id)?;
        let channel = user_id
            .create_dm_channel(&self.http)
            .await
            .map_err(lookup_error)?;
        Ok(Surface::direct(channel.id.to_string()))
    }

    async fn fetch_message(
        &self,
        surface_id: &str,
        message_id: &str,
    ) -> Result<MessageHandle, LookupError> {
        let channel_id = convert::channel_id(surface_id)?;
        let id = convert::message_id(message_id)?;
        let message = self
            .http
            .get_message(channel_id, id)
            .await
            .map_err(lookup_error)?;
        Ok(MessageHandle {
            surface_id: message.channel_id.to_string(),
            message_id: message.id.to_string(),
        })
    }

    async fn active_sub_conversations(&self, parent_id: &str) -> Result<Vec<Surface>, LookupError> {
        let parent = self.guild_channel(parent_id).await?;
        let threads = self
            .http
            .get_guild_active_threads(parent.guild_id)
            .await
            .map_err(lookup_error)?;
        Ok(threads
            .threads
            .iter()
            .filter(|thread| thread.parent_id == Some(parent.id))
            .map(|thread| self.surface_from_guild_channel(thread))
            .collect())
    }

    async fn archived_sub_conversations(
        &self,
        parent_id: &str,
        limit: usize,
    ) -> Result<Vec<Surface>, LookupError> {
        let channel_id = convert::channel_id(parent_id)?;
        let threads = self
            .http
            .get_channel_archived_public_threads(channel_id, None, Some(limit as u64))
            .await
            .map_err(lookup_error)?;
        Ok(threads
            .threads
            .iter()
            .take(limit)
            .map(|thread| self.surface_from_guild_channel(thread))
            .collect())
    }

    async fn send(
        &self,
        surface_id: &str,
        message: OutgoingMessage,
    ) -> Result<MessageHandle, SendError> {
        let channel_id =
            convert::channel_id(surface_id).map_err(|e| SendError::Rejected(e.to_string()))?;

        let mut builder = CreateMessage::new();
        if let Some(content) = message.content {
            builder = builder.content(content);
        }
        for attachment in message.attachments {
            builder = builder.add_file(CreateAttachment::bytes(attachment.data, attachment.filename));
        }
        if let Some(reply_to) = &message.reply_to
            && let Ok(reply_id) = convert::message_id(&reply_to.message_id)
        {
            builder = builder.reference_message((channel_id, reply_id));
        }

        let sent = channel_id
            .send_message(&self.http, builder)
            .await
            .map_err(send_error)?;
        Ok(MessageHandle {
            surface_id: sent.channel_id.to_string(),
            message_id: sent.id.to_string(),
        })
    }
}

// ============================================================================
// Error mapping
// ============================================================================

fn status_code(error: &serenity::Error) -> Option<u16> {
    match error {
        serenity::Error::Http(e) => e.status_code().map(|status| status.as_u16()),
        _ => None,
    }
}

fn connect_error(error: serenity::Error) -> ConnectError {
    match &error {
        serenity::Error::Gateway(GatewayError::InvalidAuthentication) => {
            ConnectError::authentication(error.to_string())
        }
        _ if status_code(&error) == Some(401) => ConnectError::authentication(error.to_string()),
        _ => ConnectError::from_message(error.to_string()),
    }
}

fn lookup_error(error: serenity::Error) -> LookupError {
    match status_code(&error) {
        Some(404) => LookupError::NotFound,
        Some(403) => LookupError::Forbidden,
        _ => LookupError::Gateway(error.to_string()),
    }
}

fn send_error(error: serenity::Error) -> SendError {
    match status_code(&error) {
        Some(404) => SendError::NotFound,
        Some(403) => SendError::Forbidden,
        Some(status) if (400..500).contains(&status) => SendError::Rejected(error.to_string()),
        _ => SendError::Gateway(error.to_string()),
    }
}
