//! serenity event handler forwarding lifecycle and message events.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serenity::all::{
    Channel, ChannelId, ConnectionStage, Context, EventHandler, Message, Ready, ResumedEvent, RoleId,
    ShardStageUpdateEvent, UserId,
};
use tracing::{debug, info, warn};

use threadline::client::{EventSink, GatewayEvent};

use crate::convert::{self, ChannelInfo};

/// State shared between a client and its handler.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    ready: AtomicBool,
    closed: AtomicBool,
    self_id: AtomicU64,
}

impl SessionState {
    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
    }

    pub(crate) fn self_id(&self) -> Option<UserId> {
        match self.self_id.load(Ordering::SeqCst) {
            0 => None,
            id => Some(UserId::new(id)),
        }
    }
}

pub(crate) struct Handler {
    sink: EventSink,
    state: Arc<SessionState>,
    channels: DashMap<ChannelId, ChannelInfo>,
}

impl Handler {
    pub(crate) fn new(sink: EventSink, state: Arc<SessionState>) -> Self {
        Self {
            sink,
            state,
            channels: DashMap::new(),
        }
    }

    fn emit(&self, event: GatewayEvent) {
        if self.state.is_closed() {
            return;
        }
        if !self.sink.emit(event) {
            debug!(generation = self.sink.generation(), "Event sink closed");
        }
    }

    async fn channel_info(&self, ctx: &Context, channel_id: ChannelId) -> ChannelInfo {
        if let Some(info) = self.channels.get(&channel_id) {
            return info.clone();
        }
        let info = match channel_id.to_channel(ctx).await {
            Ok(Channel::Guild(channel)) => ChannelInfo::from_guild_channel(&channel),
            Ok(_) => ChannelInfo::default(),
            Err(e) => {
                warn!(channel_id = %channel_id, error = %e, "Failed to resolve channel");
                return ChannelInfo::default();
            }
        };
        self.channels.insert(channel_id, info.clone());
        info
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        self.state.self_id.store(ready.user.id.get(), Ordering::SeqCst);
        self.state.set_ready(true);
        info!(
            user = %ready.user.name,
            guilds = ready.guilds.len(),
            generation = self.sink.generation(),
            "Discord session ready"
        );
        self.emit(GatewayEvent::Ready);
    }

    async fn resume(&self, _ctx: Context, _event: ResumedEvent) {
        self.state.set_ready(true);
        info!(generation = self.sink.generation(), "Discord session resumed");
        self.emit(GatewayEvent::Resumed);
    }

    async fn shard_stage_update(&self, _ctx: Context, event: ShardStageUpdateEvent) {
        debug!(shard = %event.shard_id, old = ?event.old, new = ?event.new, "Shard stage changed");
        if event.new == ConnectionStage::Disconnected {
            self.state.set_ready(false);
            self.emit(GatewayEvent::Disconnected);
        }
    }

    async fn message(&self, ctx: Context, message: Message) {
        let channel = self.channel_info(&ctx, message.channel_id).await;
        let role_name = |id: RoleId| {
            let guild = ctx.cache.guild(message.guild_id?)?;
            guild.roles.get(&id).map(|role| role.name.clone())
        };
        let inbound = convert::inbound_message(&message, &channel, self.state.self_id(), role_name);
        self.emit(GatewayEvent::Message(inbound));
    }
}
