//! Thread-aware routing for outbound messages.
//!
//! Given a declared target and a segment tree, pick the surface the message
//! actually lands on. Rules, first match wins:
//!
//! 1. a routing hint naming a sub-conversation
//! 2. the location of the replied-to message (memory inheritance only)
//! 3. the parent's most recently active sub-conversation (memory inheritance only)
//! 4. the declared target itself
//!
//! Every chosen surface must pass the send-permission gate. Hints and
//! mappings that fail it fall through to the next rule; the declared target
//! failing it is an error. Decisions are never cached, surface lookups are.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

use threadline_protocol::{OutboundMessage, OutboundTarget, RoutingHint, Segment};

use crate::client::{GatewayClient, LookupError, MessageHandle, Surface, SurfaceKind};
use crate::config::ChatConfig;
use crate::context::ContextStore;

/// Archived sub-conversations searched for a reply target.
pub const ARCHIVED_SEARCH_LIMIT: usize = 50;

/// Surfaces kept in the lookup cache before entries are evicted.
pub const SURFACE_CACHE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingRule {
    RoutingHint,
    ReplyLocation,
    ActiveSubConversation,
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub surface: Surface,
    /// Message the first part should reply to. Always on `surface`.
    pub reply_to: Option<MessageHandle>,
    pub rule: RoutingRule,
}

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("conversation {0} not found")]
    NotFound(String),

    #[error("missing permission to send in {0}")]
    PermissionDenied(String),

    #[error("conversation {0} cannot receive messages")]
    Unsupported(String),

    #[error("failed to look up {id}: {source}")]
    Lookup {
        id: String,
        #[source]
        source: LookupError,
    },
}

/// State of the reply-target search for one resolution.
enum ReplyLookup {
    NotSearched,
    Found(MessageHandle),
    Missing,
}

pub struct RoutingResolver {
    store: Arc<ContextStore>,
    surfaces: DashMap<String, Surface>,
    surface_capacity: usize,
    memory_inheritance: bool,
    require_permission: bool,
}

impl RoutingResolver {
    pub fn new(config: &ChatConfig, store: Arc<ContextStore>) -> Self {
        Self {
            store,
            surfaces: DashMap::new(),
            surface_capacity: SURFACE_CACHE_CAPACITY,
            memory_inheritance: config.inherit_channel_memory,
            require_permission: config.require_send_permission,
        }
    }

    pub fn with_surface_capacity(mut self, capacity: usize) -> Self {
        self.surface_capacity = capacity.max(1);
        self
    }

    /// Drop a cached surface after the gateway reported it gone.
    pub fn invalidate(&self, surface_id: &str) {
        if self.surfaces.remove(surface_id).is_some() {
            debug!(surface_id, "Invalidated cached surface");
        }
    }

    pub async fn resolve(
        &self,
        client: &dyn GatewayClient,
        message: &OutboundMessage,
    ) -> Result<RoutingDecision, RoutingError> {
        match &message.target {
            OutboundTarget::User { id } => self.resolve_user(client, id, &message.segment).await,
            OutboundTarget::Conversation { id } => {
                self.resolve_conversation(client, id, &message.segment)
                    .await
            }
        }
    }

    async fn resolve_user(
        &self,
        client: &dyn GatewayClient,
        user_id: &str,
        root: &Segment,
    ) -> Result<RoutingDecision, RoutingError> {
        let surface = client
            .direct_surface(user_id)
            .await
            .map_err(|e| lookup_error(user_id, e))?;
        let surface = self.gate(surface)?;
        Ok(self
            .decide(client, surface, root, ReplyLookup::NotSearched, RoutingRule::Direct)
            .await)
    }

    async fn resolve_conversation(
        &self,
        client: &dyn GatewayClient,
        target_id: &str,
        root: &Segment,
    ) -> Result<RoutingDecision, RoutingError> {
        // 1. Routing hint.
        if let Some(hint) = root.routing_hint()
            && let Some(surface) = self.hinted_surface(client, hint).await
        {
            return Ok(self
                .decide(client, surface, root, ReplyLookup::NotSearched, RoutingRule::RoutingHint)
                .await);
        }

        let target = self
            .surface(client, target_id)
            .await
            .map_err(|e| lookup_error(target_id, e))?;

        // 2. Where the replied-to message lives.
        let mut reply = ReplyLookup::NotSearched;
        let mut reply_in_parent = false;
        if self.memory_inheritance
            && let Some(reply_id) = root.reply_target().map(|r| r.message_id.as_str())
            && let Some(parent) = self.family_parent(client, &target).await
        {
            match self.locate_message(client, &parent, reply_id).await {
                Some((surface, handle)) => {
                    reply_in_parent = surface.id == parent.id;
                    if self.permitted(&surface) {
                        debug!(
                            surface_id = %surface.id,
                            message_id = reply_id,
                            "Routing to location of replied message"
                        );
                        return Ok(RoutingDecision {
                            surface,
                            reply_to: Some(handle),
                            rule: RoutingRule::ReplyLocation,
                        });
                    }
                    debug!(surface_id = %surface.id, "No permission where the replied message lives");
                    reply = ReplyLookup::Found(handle);
                }
                None => reply = ReplyLookup::Missing,
            }
        }

        // 3. Most recently active sub-conversation of the parent.
        if self.memory_inheritance
            && !reply_in_parent
            && target.kind == SurfaceKind::Parent
            && let Some(surface) = self.mapped_surface(client, &target.id).await
        {
            return Ok(self
                .decide(client, surface, root, reply, RoutingRule::ActiveSubConversation)
                .await);
        }

        // 4. Declared target.
        let target = self.gate(target)?;
        Ok(self
            .decide(client, target, root, reply, RoutingRule::Direct)
            .await)
    }

    /// Attach the reply reference if the replied message is on `surface`.
    async fn decide(
        &self,
        client: &dyn GatewayClient,
        surface: Surface,
        root: &Segment,
        reply: ReplyLookup,
        rule: RoutingRule,
    ) -> RoutingDecision {
        let reply_to = match (root.reply_target(), reply) {
            (None, _) => None,
            (Some(_), ReplyLookup::Found(handle)) => {
                (handle.surface_id == surface.id).then_some(handle)
            }
            (Some(_), ReplyLookup::Missing) => None,
            (Some(target), ReplyLookup::NotSearched) => {
                self.find_in(client, &surface.id, &target.message_id).await
            }
        };
        RoutingDecision {
            surface,
            reply_to,
            rule,
        }
    }

    async fn hinted_surface(&self, client: &dyn GatewayClient, hint: &RoutingHint) -> Option<Surface> {
        let thread_id = hint.original_thread_id.as_str();
        match self.surface(client, thread_id).await {
            Ok(surface) if !surface.is_sub_conversation() => {
                warn!(thread_id, "Routing hint does not name a sub-conversation, ignoring");
                None
            }
            Ok(surface) if !self.permitted(&surface) => {
                warn!(thread_id, "No permission to send in hinted sub-conversation");
                None
            }
            Ok(surface) => Some(surface),
            Err(e) => {
                warn!(thread_id, error = %e, "Routing hint target unavailable");
                None
            }
        }
    }

    async fn mapped_surface(&self, client: &dyn GatewayClient, parent_id: &str) -> Option<Surface> {
        let sub_id = self.store.get(parent_id)?;
        match self.surface(client, &sub_id).await {
            Ok(surface) if surface.is_sub_conversation() && self.permitted(&surface) => {
                debug!(parent_id, sub_id = %sub_id, "Routing to active sub-conversation");
                Some(surface)
            }
            Ok(_) => {
                debug!(parent_id, sub_id = %sub_id, "Mapped sub-conversation not usable");
                None
            }
            Err(LookupError::NotFound) => {
                debug!(parent_id, sub_id = %sub_id, "Mapped sub-conversation is gone, clearing");
                self.store.clear(parent_id);
                None
            }
            Err(e) => {
                warn!(parent_id, sub_id = %sub_id, error = %e, "Mapped sub-conversation lookup failed");
                None
            }
        }
    }

    /// The parent conversation of `target`'s family, resolving it if needed.
    async fn family_parent(&self, client: &dyn GatewayClient, target: &Surface) -> Option<Surface> {
        match &target.kind {
            SurfaceKind::Parent => Some(target.clone()),
            SurfaceKind::SubConversation { parent_id } => {
                match self.surface(client, parent_id).await {
                    Ok(parent) => Some(parent),
                    Err(e) => {
                        debug!(parent_id = %parent_id, error = %e, "Parent lookup failed");
                        None
                    }
                }
            }
            SurfaceKind::Direct | SurfaceKind::Other => None,
        }
    }

    /// Search `primary`, then the parent's active sub-conversations, then
    /// up to [`ARCHIVED_SEARCH_LIMIT`] archived ones.
    pub async fn locate_message(
        &self,
        client: &dyn GatewayClient,
        primary: &Surface,
        message_id: &str,
    ) -> Option<(Surface, MessageHandle)> {
        if let Some(handle) = self.find_in(client, &primary.id, message_id).await {
            return Some((primary.clone(), handle));
        }
        let parent_id = primary.family_root()?;

        let active = client
            .active_sub_conversations(parent_id)
            .await
            .unwrap_or_else(|e| {
                debug!(parent_id, error = %e, "Listing active sub-conversations failed");
                Vec::new()
            });
        if let Some(found) = self.search(client, active, primary, message_id).await {
            return Some(found);
        }

        let archived = client
            .archived_sub_conversations(parent_id, ARCHIVED_SEARCH_LIMIT)
            .await
            .unwrap_or_else(|e| {
                debug!(parent_id, error = %e, "Listing archived sub-conversations failed");
                Vec::new()
            });
        self.search(client, archived, primary, message_id).await
    }

    async fn search(
        &self,
        client: &dyn GatewayClient,
        candidates: Vec<Surface>,
        primary: &Surface,
        message_id: &str,
    ) -> Option<(Surface, MessageHandle)> {
        for candidate in candidates.into_iter().filter(|c| c.id != primary.id) {
            if let Some(handle) = self.find_in(client, &candidate.id, message_id).await {
                self.cache_surface(candidate.clone());
                return Some((candidate, handle));
            }
        }
        None
    }

    async fn find_in(
        &self,
        client: &dyn GatewayClient,
        surface_id: &str,
        message_id: &str,
    ) -> Option<MessageHandle> {
        match client.fetch_message(surface_id, message_id).await {
            Ok(handle) => Some(handle),
            Err(LookupError::NotFound | LookupError::Forbidden) => None,
            Err(e) => {
                debug!(surface_id, message_id, error = %e, "Message lookup failed");
                None
            }
        }
    }

    async fn surface(&self, client: &dyn GatewayClient, id: &str) -> Result<Surface, LookupError> {
        if let Some(surface) = self.surfaces.get(id) {
            return Ok(surface.value().clone());
        }
        let surface = match client.cached_surface(id) {
            Some(surface) => surface,
            None => client.fetch_surface(id).await?,
        };
        self.cache_surface(surface.clone());
        Ok(surface)
    }

    /// Surfaces are cheap to refetch, so a full cache drops an arbitrary entry.
    fn cache_surface(&self, surface: Surface) {
        let id = surface.id.clone();
        if self.surfaces.insert(id.clone(), surface).is_some()
            || self.surfaces.len() <= self.surface_capacity
        {
            return;
        }
        // Collect the key first; removing while iterating would deadlock the shard.
        let evicted = self
            .surfaces
            .iter()
            .map(|entry| entry.key().clone())
            .find(|key| *key != id);
        if let Some(evicted) = evicted {
            self.surfaces.remove(&evicted);
            debug!(surface_id = %evicted, "Evicted cached surface");
        }
    }

    fn permitted(&self, surface: &Surface) -> bool {
        !self.require_permission || surface.can_send()
    }

    fn gate(&self, surface: Surface) -> Result<Surface, RoutingError> {
        if surface.kind == SurfaceKind::Other {
            return Err(RoutingError::Unsupported(surface.id));
        }
        if !self.permitted(&surface) {
            return Err(RoutingError::PermissionDenied(surface.id));
        }
        Ok(surface)
    }
}

fn lookup_error(id: &str, error: LookupError) -> RoutingError {
    match error {
        LookupError::NotFound => RoutingError::NotFound(id.to_string()),
        source => RoutingError::Lookup {
            id: id.to_string(),
            source,
        },
    }
}
