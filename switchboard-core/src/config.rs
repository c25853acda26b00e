// ABOUTME: Configuration parsing from TOML file with environment variable overrides.
// ABOUTME: Validates required fields and renders the tree as a Value for reload diffing.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub cron: CronConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            auth: AuthConfig::default(),
            remote: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    None,
    Token,
    Password,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

// Custom Debug impl to redact credentials.
impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("mode", &self.mode)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Remote gateway endpoint used by outbound CLI calls. Changing it never
/// affects this process, which is why the reload classifier treats
/// `gateway.remote.*` as a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Per-run timeout, bounding registry expiry and the downstream deadline.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Message bodies intercepted as "abort all runs for this session".
    #[serde(default = "default_stop_commands")]
    pub stop_commands: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            stop_commands: default_stop_commands(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// When set, a daily-rolling log file is written here in addition to stderr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
        }
    }
}

/// Per-provider sections. The provider set is closed; each has its own
/// account shape matching what its wire client needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram: Option<ProviderSection<TelegramAccount>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whatsapp: Option<ProviderSection<WhatsAppAccount>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discord: Option<ProviderSection<DiscordAccount>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack: Option<ProviderSection<SlackAccount>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<ProviderSection<SignalAccount>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imessage: Option<ProviderSection<IMessageAccount>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teams: Option<ProviderSection<TeamsAccount>>,
}

/// Common shape of one provider's configuration: an enabled flag, a default
/// account pointer, and named accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSection<A> {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_account_id")]
    pub default_account: String,
    #[serde(default)]
    pub accounts: HashMap<String, A>,
}

impl<A> Default for ProviderSection<A> {
    fn default() -> Self {
        Self {
            enabled: true,
            default_account: default_account_id(),
            accounts: HashMap::new(),
        }
    }
}

impl<A> ProviderSection<A> {
    /// Configured account ids, sorted for stable snapshots.
    pub fn account_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.accounts.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct TelegramAccount {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl std::fmt::Debug for TelegramAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramAccount")
            .field("bot_token", &redact(&self.bot_token))
            .field("enabled", &self.enabled)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhatsAppAccount {
    /// Directory holding the linked-device session state.
    #[serde(default)]
    pub session_path: String,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct DiscordAccount {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl std::fmt::Debug for DiscordAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordAccount")
            .field("bot_token", &redact(&self.bot_token))
            .field("enabled", &self.enabled)
            .finish()
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SlackAccount {
    #[serde(default)]
    pub app_token: String,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl std::fmt::Debug for SlackAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackAccount")
            .field("app_token", &redact(&self.app_token))
            .field("bot_token", &redact(&self.bot_token))
            .field("enabled", &self.enabled)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalAccount {
    pub phone_number: Option<String>,
    /// Unix socket of the signal daemon this account attaches to.
    #[serde(default)]
    pub socket_path: String,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IMessageAccount {
    /// Path of the local Messages database to bridge.
    #[serde(default)]
    pub db_path: String,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct TeamsAccount {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_password: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl std::fmt::Debug for TeamsAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeamsAccount")
            .field("app_id", &self.app_id)
            .field("app_password", &redact(&self.app_password))
            .field("tenant_id", &self.tenant_id)
            .field("enabled", &self.enabled)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub gmail: GmailHookConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailHookConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub account: String,
    #[serde(default = "default_gmail_poll_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_gmail_label")]
    pub label: String,
}

impl Default for GmailHookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            account: String::new(),
            poll_interval_secs: default_gmail_poll_secs(),
            label: default_gmail_label(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    #[serde(default)]
    pub enabled: bool,
    /// IANA timezone for interpreting schedules. Defaults to UTC.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub jobs: Vec<CronJobConfig>,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timezone: default_timezone(),
            jobs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobConfig {
    pub id: String,
    /// Six-field cron expression (seconds granularity).
    pub schedule: String,
    pub session_key: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_heartbeat_session")]
    pub session_key: String,
    #[serde(default = "default_heartbeat_message")]
    pub message: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_heartbeat_secs(),
            session_key: default_heartbeat_session(),
            message: default_heartbeat_message(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_browser_port")]
    pub control_port: u16,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            control_port: default_browser_port(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    18789
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_stop_commands() -> Vec<String> {
    vec!["stop".to_string(), "/stop".to_string()]
}

fn default_db_path() -> String {
    "./switchboard.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_account_id() -> String {
    "default".to_string()
}

fn default_gmail_poll_secs() -> u64 {
    60
}

fn default_gmail_label() -> String {
    "INBOX".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_heartbeat_secs() -> u64 {
    1800
}

fn default_heartbeat_session() -> String {
    "heartbeat".to_string()
}

fn default_heartbeat_message() -> String {
    "heartbeat: anything need attention?".to_string()
}

fn default_browser_port() -> u16 {
    18791
}

fn redact(s: &str) -> &'static str {
    if s.is_empty() {
        "<unset>"
    } else {
        "[REDACTED]"
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    /// A missing file yields the default config (everything disabled, local
    /// bind, no auth), which is a valid way to run.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Config::default()
        };

        // Override with environment variables if present
        if let Ok(val) = std::env::var("SWITCHBOARD_BIND") {
            config.gateway.bind = val;
        }
        if let Ok(val) = std::env::var("SWITCHBOARD_PORT") {
            config.gateway.port = val.parse().with_context(|| {
                format!("SWITCHBOARD_PORT must be a valid port number, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("SWITCHBOARD_TOKEN") {
            config.gateway.auth.mode = AuthMode::Token;
            config.gateway.auth.token = Some(val);
        }
        if let Ok(val) = std::env::var("SWITCHBOARD_PASSWORD") {
            config.gateway.auth.mode = AuthMode::Password;
            config.gateway.auth.password = Some(val);
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse from a TOML string (no env overrides). Used by tests.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config = toml::from_str::<Config>(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        match self.gateway.auth.mode {
            AuthMode::Token => {
                if self
                    .gateway
                    .auth
                    .token
                    .as_deref()
                    .map(str::trim)
                    .unwrap_or("")
                    .is_empty()
                {
                    anyhow::bail!("gateway.auth.mode = \"token\" requires gateway.auth.token");
                }
            }
            AuthMode::Password => {
                if self
                    .gateway
                    .auth
                    .password
                    .as_deref()
                    .map(str::trim)
                    .unwrap_or("")
                    .is_empty()
                {
                    anyhow::bail!("gateway.auth.mode = \"password\" requires gateway.auth.password");
                }
            }
            AuthMode::None => {}
        }

        if self.cron.timezone.parse::<chrono_tz::Tz>().is_err() {
            anyhow::bail!("cron.timezone is not a valid IANA timezone: {}", self.cron.timezone);
        }

        for job in &self.cron.jobs {
            if job.id.trim().is_empty() {
                anyhow::bail!("cron job with empty id");
            }
            if job.session_key.trim().is_empty() {
                anyhow::bail!("cron job {} has empty session_key", job.id);
            }
        }

        if self.agent.timeout_secs == 0 {
            anyhow::bail!("agent.timeout_secs must be greater than zero");
        }

        Ok(())
    }

    /// Render the whole tree as a JSON value for dot-path diffing.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).context("Failed to render config for diffing")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.gateway.bind, "127.0.0.1");
        assert_eq!(config.gateway.port, 18789);
        assert_eq!(config.gateway.auth.mode, AuthMode::None);
        assert_eq!(config.agent.timeout_secs, 600);
        assert_eq!(config.agent.stop_commands, vec!["stop", "/stop"]);
        assert!(!config.cron.enabled);
        assert!(!config.heartbeat.enabled);
    }

    #[test]
    fn test_provider_sections_parse() {
        let toml = r#"
            [providers.telegram]
            default_account = "work"

            [providers.telegram.accounts.work]
            bot_token = "123:abc"

            [providers.telegram.accounts.personal]
            bot_token = ""
            enabled = false

            [providers.slack.accounts.default]
            app_token = "xapp-1"
            bot_token = "xoxb-1"
        "#;
        let config = Config::from_toml(toml).unwrap();

        let telegram = config.providers.telegram.as_ref().unwrap();
        assert!(telegram.enabled);
        assert_eq!(telegram.default_account, "work");
        assert_eq!(telegram.account_ids(), vec!["personal", "work"]);
        assert_eq!(telegram.accounts["work"].bot_token, "123:abc");
        assert_eq!(telegram.accounts["personal"].enabled, Some(false));

        let slack = config.providers.slack.as_ref().unwrap();
        assert_eq!(slack.accounts["default"].app_token, "xapp-1");
    }

    #[test]
    fn test_token_mode_requires_token() {
        let toml = r#"
            [gateway.auth]
            mode = "token"
        "#;
        let err = Config::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("gateway.auth.token"));
    }

    #[test]
    fn test_password_mode_requires_password() {
        let toml = r#"
            [gateway.auth]
            mode = "password"
            password = "  "
        "#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        let toml = r#"
            [cron]
            timezone = "Mars/Olympus"
        "#;
        let err = Config::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("timezone"));
    }

    #[test]
    fn test_cron_jobs_parse() {
        let toml = r#"
            [cron]
            enabled = true
            timezone = "America/Chicago"

            [[cron.jobs]]
            id = "digest"
            schedule = "0 0 9 * * *"
            session_key = "main"
            message = "morning digest"
        "#;
        let config = Config::from_toml(toml).unwrap();
        assert!(config.cron.enabled);
        assert_eq!(config.cron.jobs.len(), 1);
        assert_eq!(config.cron.jobs[0].id, "digest");
    }

    #[test]
    fn test_auth_debug_redacts() {
        let toml = r#"
            [gateway.auth]
            mode = "token"
            token = "super-secret"
        "#;
        let config = Config::from_toml(toml).unwrap();
        let debug = format!("{:?}", config.gateway.auth);
        assert!(!debug.contains("super-secret"));
    }

    #[test]
    fn test_to_value_has_dot_paths() {
        let config = Config::from_toml("").unwrap();
        let value = config.to_value().unwrap();
        assert!(value["gateway"]["port"].is_number());
        assert!(value["hooks"]["gmail"]["account"].is_string());
    }

    #[test]
    fn test_gateway_remote_parses() {
        let toml = r#"
            [gateway.remote]
            url = "wss://example.org/ws"
        "#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.gateway.remote.unwrap().url, "wss://example.org/ws");
    }
}
