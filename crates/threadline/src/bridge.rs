//! Outbound entry point tying the supervisor, resolver and dispatcher together.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use threadline_protocol::{OutboundMessage, Segment};

use crate::config::Config;
use crate::context::ContextStore;
use crate::dispatch::{DispatchError, DispatchReport, Dispatcher, render};
use crate::routing::RoutingResolver;
use crate::supervisor::Supervisor;

pub struct Bridge {
    supervisor: Supervisor,
    resolver: RoutingResolver,
    dispatcher: Dispatcher,
    send_wait_timeout: Duration,
}

impl Bridge {
    pub fn new(config: &Config, supervisor: Supervisor, store: Arc<ContextStore>) -> Self {
        Self {
            supervisor,
            resolver: RoutingResolver::new(&config.chat, store),
            dispatcher: Dispatcher::new(&config.dispatch),
            send_wait_timeout: config.dispatch.send_wait_timeout(),
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Deliver one engine reply to the chat surface.
    ///
    /// Root `command` segments are logged and dropped, root `notify` segments
    /// are ignored; both return an empty report.
    pub async fn handle_outbound_message(
        &self,
        message: &OutboundMessage,
    ) -> Result<DispatchReport, DispatchError> {
        match &message.segment {
            Segment::Command(command) => {
                warn!(kind = %message.segment.kind(), command = %command, "Command segments are not sent to chat");
                return Ok(DispatchReport::default());
            }
            Segment::Notify(_) => {
                debug!(kind = %message.segment.kind(), "Ignoring notify segment");
                return Ok(DispatchReport::default());
            }
            _ => {}
        }

        if !self.supervisor.wait_connected(self.send_wait_timeout).await {
            warn!(
                state = ?self.supervisor.state(),
                timeout_secs = self.send_wait_timeout.as_secs(),
                "Gateway not connected, cannot send"
            );
            return Err(DispatchError::NotConnected(self.send_wait_timeout));
        }

        let content = render(&message.segment);
        if content.is_empty() {
            warn!(message_id = ?message.message_id, "Outbound message has nothing to send");
            return Err(DispatchError::Empty);
        }

        let client = self.supervisor.client();
        let decision = self.resolver.resolve(&*client, message).await?;
        let report = self.dispatcher.send(&*client, &decision, content).await;
        if report.surface_missing {
            self.resolver.invalidate(&decision.surface.id);
        }
        Ok(report)
    }
}
