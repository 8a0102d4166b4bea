//! JSON Lines bus on stdio: bus messages out on stdout, replies in on stdin.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use threadline::Bridge;
use threadline::inbound::{BusPublisher, PublishError};
use threadline_protocol::{BusMessage, OutboundMessage};

pub struct StdoutPublisher {
    stdout: Mutex<Stdout>,
}

impl StdoutPublisher {
    pub fn new() -> Self {
        Self {
            stdout: Mutex::new(tokio::io::stdout()),
        }
    }
}

impl Default for StdoutPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusPublisher for StdoutPublisher {
    async fn publish(&self, message: BusMessage) -> Result<(), PublishError> {
        let mut line =
            serde_json::to_string(&message).map_err(|e| PublishError(e.to_string()))?;
        line.push('\n');

        let mut stdout = self.stdout.lock().await;
        stdout
            .write_all(line.as_bytes())
            .await
            .map_err(|e| PublishError(e.to_string()))?;
        stdout.flush().await.map_err(|e| PublishError(e.to_string()))
    }
}

/// Outbound messages from stdin.
pub fn stdin_reader() -> BufReader<tokio::io::Stdin> {
    BufReader::new(tokio::io::stdin())
}

/// Feed outbound messages to the bridge until the input ends or shutdown.
pub async fn run_outbound_reader<R>(bridge: Arc<Bridge>, input: R, shutdown: CancellationToken)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("Input closed, no more outbound messages");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read outbound input");
                    break;
                }
            },
            _ = shutdown.cancelled() => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let message: OutboundMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed outbound message");
                continue;
            }
        };
        match bridge.handle_outbound_message(&message).await {
            Ok(report) => debug!(
                message_id = ?message.message_id,
                sent = report.parts_sent,
                failed = report.parts_failed,
                "Outbound message handled"
            ),
            Err(e) => warn!(message_id = ?message.message_id, error = %e, "Outbound message failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use threadline::{Config, ContextStore, Supervisor, SupervisorConfig};
    use threadline_discord::DiscordGatewayFactory;

    fn bridge() -> Arc<Bridge> {
        let config = Config::default();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let factory = Arc::new(DiscordGatewayFactory::new(&config.discord));
        let supervisor = Supervisor::new(SupervisorConfig::default(), factory, tx);
        let store = Arc::new(ContextStore::with_capacity(16));
        Arc::new(Bridge::new(&config, supervisor, store))
    }

    #[tokio::test]
    async fn reader_skips_bad_lines_and_stops_at_end_of_input() {
        let input: &[u8] = b"\n   \nnot json\n{\"segment\": 1}\n";
        run_outbound_reader(bridge(), input, CancellationToken::new()).await;
    }

    #[tokio::test]
    async fn reader_stops_on_shutdown() {
        // The writer half stays open, so only cancellation ends the loop.
        let (_writer, reader) = tokio::io::duplex(64);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        run_outbound_reader(bridge(), BufReader::new(reader), shutdown).await;
    }
}
