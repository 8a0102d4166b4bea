//! Dispatch pipeline: rendered content → one or more send calls.
//!
//! - [`content`]: segment tree → text plus attachments
//! - [`split`]: text → parts within the per-message length limit
//!
//! The first part carries the reply reference and the attachments. A failed
//! part is logged and counted; later parts are still sent.

pub mod content;
pub mod split;

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::client::{GatewayClient, OutgoingMessage, SendError};
use crate::config::DispatchConfig;
use crate::routing::{RoutingDecision, RoutingError};

pub use content::{RenderedContent, render};
pub use split::split_content;

/// What happened to one outbound message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub parts_sent: usize,
    pub parts_failed: usize,
    pub attachments_dropped: usize,
    /// The gateway reported the destination gone.
    pub surface_missing: bool,
}

impl DispatchReport {
    /// At least one part made it out.
    pub fn delivered(&self) -> bool {
        self.parts_sent > 0
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("gateway not connected after waiting {0:?}")]
    NotConnected(Duration),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("message has no sendable content")]
    Empty,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    max_message_length: usize,
    max_attachments: usize,
}

impl Dispatcher {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            max_message_length: config.max_message_length.max(1),
            max_attachments: config.max_attachments,
        }
    }

    /// Build the send calls for `content`. Empty text parts are skipped; an
    /// attachment-only message becomes a single call without text.
    pub fn plan(
        &self,
        decision: &RoutingDecision,
        content: RenderedContent,
    ) -> (Vec<OutgoingMessage>, usize) {
        let RenderedContent {
            text,
            mut attachments,
        } = content;

        let dropped = attachments.len().saturating_sub(self.max_attachments);
        if dropped > 0 {
            warn!(
                dropped,
                max = self.max_attachments,
                "Too many attachments, dropping the excess"
            );
            attachments.truncate(self.max_attachments);
        }

        let mut parts: Vec<Option<String>> = split_content(&text, self.max_message_length)
            .into_iter()
            .filter(|part| !part.trim().is_empty())
            .map(Some)
            .collect();
        if parts.is_empty() && !attachments.is_empty() {
            parts.push(None);
        }

        let mut reply_to = decision.reply_to.clone();
        let mut attachments = Some(attachments);
        let messages = parts
            .into_iter()
            .map(|content| OutgoingMessage {
                content,
                attachments: attachments.take().unwrap_or_default(),
                reply_to: reply_to.take(),
            })
            .collect();
        (messages, dropped)
    }

    pub async fn send(
        &self,
        client: &dyn GatewayClient,
        decision: &RoutingDecision,
        content: RenderedContent,
    ) -> DispatchReport {
        let dispatch_id = Ulid::new();
        let surface_id = decision.surface.id.as_str();
        let (messages, attachments_dropped) = self.plan(decision, content);
        let total = messages.len();

        let mut report = DispatchReport {
            attachments_dropped,
            ..DispatchReport::default()
        };

        for (index, message) in messages.into_iter().enumerate() {
            match client.send(surface_id, message).await {
                Ok(handle) => {
                    report.parts_sent += 1;
                    debug!(
                        %dispatch_id,
                        surface_id,
                        part = index + 1,
                        total,
                        message_id = %handle.message_id,
                        "Sent message part"
                    );
                }
                Err(e) => {
                    report.parts_failed += 1;
                    if e == SendError::NotFound {
                        report.surface_missing = true;
                    }
                    warn!(
                        %dispatch_id,
                        surface_id,
                        part = index + 1,
                        total,
                        error = %e,
                        "Failed to send message part"
                    );
                }
            }
        }

        info!(
            %dispatch_id,
            surface_id,
            rule = ?decision.rule,
            sent = report.parts_sent,
            failed = report.parts_failed,
            "Dispatched outbound message"
        );
        report
    }
}
