use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use tokio::fs;

use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub bus: BusConfig,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Ok(serde_saphyr::from_str(&contents)?)
    }
}

// ============================================================================
// DiscordConfig
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscordConfig {
    /// Bot token. Overridden by `DISCORD_TOKEN` in the binary.
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub intents: IntentsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntentsConfig {
    #[serde(default = "default_true")]
    pub guilds: bool,
    #[serde(default = "default_true")]
    pub messages: bool,
    #[serde(default = "default_true")]
    pub dm_messages: bool,
    #[serde(default = "default_true")]
    pub message_content: bool,
    #[serde(default)]
    pub reactions: bool,
    #[serde(default)]
    pub voice_states: bool,
}

impl Default for IntentsConfig {
    fn default() -> Self {
        Self {
            guilds: true,
            messages: true,
            dm_messages: true,
            message_content: true,
            reactions: false,
            voice_states: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Fixed delay between connection attempts.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    /// Health check period while connected.
    #[serde(default = "default_connection_check_interval")]
    pub connection_check_interval_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_delay_seconds: default_retry_delay(),
            connection_check_interval_seconds: default_connection_check_interval(),
        }
    }
}

impl RetryConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    pub fn connection_check_interval(&self) -> Duration {
        Duration::from_secs(self.connection_check_interval_seconds.max(1))
    }
}

fn default_retry_delay() -> u64 {
    5
}

fn default_connection_check_interval() -> u64 {
    30
}

// ============================================================================
// ChatConfig
// ============================================================================

/// How an id list is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListMode {
    /// Only listed ids pass.
    Whitelist,
    /// Listed ids are rejected.
    Blacklist,
    /// The list is ignored.
    #[default]
    Disabled,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessList {
    #[serde(default)]
    pub mode: ListMode,
    #[serde(default)]
    pub ids: Vec<u64>,
}

impl AccessList {
    pub fn whitelist(ids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            mode: ListMode::Whitelist,
            ids: ids.into_iter().collect(),
        }
    }

    pub fn blacklist(ids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            mode: ListMode::Blacklist,
            ids: ids.into_iter().collect(),
        }
    }

    /// Ids as they appear on the wire.
    pub fn id_set(&self) -> HashSet<String> {
        self.ids.iter().map(u64::to_string).collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    #[serde(default)]
    pub users: AccessList,
    #[serde(default)]
    pub guilds: AccessList,
    #[serde(default)]
    pub channels: AccessList,
    #[serde(default)]
    pub threads: AccessList,
    #[serde(default = "default_true")]
    pub allow_thread_interaction: bool,
    /// Check threads against the channel list using their parent id.
    #[serde(default = "default_true")]
    pub inherit_channel_permissions: bool,
    /// Threads share the parent's routing identity.
    #[serde(default = "default_true")]
    pub inherit_channel_memory: bool,
    #[serde(default = "default_true")]
    pub require_send_permission: bool,
    #[serde(default = "default_context_capacity")]
    pub context_capacity: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            users: AccessList::default(),
            guilds: AccessList::default(),
            channels: AccessList::default(),
            threads: AccessList::default(),
            allow_thread_interaction: true,
            inherit_channel_permissions: true,
            inherit_channel_memory: true,
            require_send_permission: true,
            context_capacity: default_context_capacity(),
        }
    }
}

fn default_context_capacity() -> usize {
    10_000
}

// ============================================================================
// DispatchConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    #[serde(default = "default_max_attachments")]
    pub max_attachments: usize,
    #[serde(default = "default_send_wait_timeout")]
    pub send_wait_timeout_seconds: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_message_length: default_max_message_length(),
            max_attachments: default_max_attachments(),
            send_wait_timeout_seconds: default_send_wait_timeout(),
        }
    }
}

impl DispatchConfig {
    pub fn send_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.send_wait_timeout_seconds)
    }
}

fn default_max_message_length() -> usize {
    2000
}

fn default_max_attachments() -> usize {
    10
}

fn default_send_wait_timeout() -> u64 {
    10
}

// ============================================================================
// BusConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Platform name stamped on every bus message.
    #[serde(default = "default_platform_name")]
    pub platform_name: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            platform_name: default_platform_name(),
        }
    }
}

fn default_platform_name() -> String {
    "discord_bot_instance_1".to_string()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// ConfigError
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.discord.token.is_empty());
        assert_eq!(config.discord.retry.retry_delay_seconds, 5);
        assert_eq!(config.discord.retry.connection_check_interval_seconds, 30);
        assert!(config.discord.intents.message_content);
        assert!(!config.discord.intents.voice_states);
        assert_eq!(config.chat.users.mode, ListMode::Disabled);
        assert!(config.chat.allow_thread_interaction);
        assert!(config.chat.inherit_channel_memory);
        assert_eq!(config.chat.context_capacity, 10_000);
        assert_eq!(config.dispatch.max_message_length, 2000);
        assert_eq!(config.dispatch.max_attachments, 10);
        assert_eq!(config.dispatch.send_wait_timeout(), Duration::from_secs(10));
        assert_eq!(config.bus.platform_name, "discord_bot_instance_1");
    }

    #[tokio::test]
    async fn test_load_missing_file_returns_defaults() {
        let tmp_dir = TempDir::new().unwrap();
        let missing_path = tmp_dir.path().join("missing-config.yaml");
        let config = Config::load(&missing_path).await.unwrap();
        assert_eq!(config.discord.retry.retry_delay_seconds, 5);
        assert_eq!(config.dispatch.max_message_length, 2000);
    }

    #[tokio::test]
    async fn test_load_valid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
discord:
  token: "abc"
  retry:
    retry_delay_seconds: 2
    connection_check_interval_seconds: 15
chat:
  guilds:
    mode: whitelist
    ids: [111, 222]
  users:
    mode: blacklist
    ids: [9]
  allow_thread_interaction: false
  inherit_channel_memory: false
  context_capacity: 64
dispatch:
  max_message_length: 500
bus:
  platform_name: "discord_test"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).await.unwrap();
        assert_eq!(config.discord.token, "abc");
        assert_eq!(config.discord.retry.retry_delay(), Duration::from_secs(2));
        assert_eq!(
            config.discord.retry.connection_check_interval(),
            Duration::from_secs(15)
        );
        assert_eq!(config.chat.guilds.mode, ListMode::Whitelist);
        assert_eq!(config.chat.guilds.ids, vec![111, 222]);
        assert!(config.chat.guilds.id_set().contains("222"));
        assert_eq!(config.chat.users.mode, ListMode::Blacklist);
        assert!(!config.chat.allow_thread_interaction);
        assert!(!config.chat.inherit_channel_memory);
        assert_eq!(config.chat.context_capacity, 64);
        assert_eq!(config.dispatch.max_message_length, 500);
        assert_eq!(config.bus.platform_name, "discord_test");
    }

    #[tokio::test]
    async fn test_load_partial_yaml_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
dispatch:
  max_attachments: 4
"#
        )
        .unwrap();

        let config = Config::load(file.path()).await.unwrap();
        assert_eq!(config.dispatch.max_attachments, 4);
        assert_eq!(config.dispatch.max_message_length, 2000); // default
        assert_eq!(config.discord.retry.retry_delay_seconds, 5); // default
        assert!(config.chat.require_send_permission); // default
        assert_eq!(config.chat.channels.mode, ListMode::Disabled); // default
    }

    #[tokio::test]
    async fn test_load_invalid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid: yaml: content: [").unwrap();

        let result = Config::load(file.path()).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_config_error_display() {
        let io_error = ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "test",
        ));
        assert!(io_error.to_string().contains("failed to read config file"));
    }
}
