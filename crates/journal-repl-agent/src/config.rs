//! Agent configuration.

use anyhow::{Context, Result};
use journal_repl_client::{ClientConfig, ReconnectPolicy, ServerNode, SslConfig};
use journal_repl_core::{JournalKey, PartitionBy};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Client identifier used in logs
    pub client_id: Option<Uuid>,

    /// Origin connection configuration
    pub connection: ConnectionConfig,

    /// Persistence configuration
    pub persistence: PersistenceConfig,

    /// Journals to replicate
    pub subscriptions: Vec<SubscriptionConfig>,
}

/// Origin connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Origin address
    pub node: ServerNode,

    /// Secure channel settings
    pub ssl: SslConfig,

    /// Reconnect budget
    pub reconnect: ReconnectPolicy,

    /// Base64 credential token presented on demand
    pub token: Option<String>,
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Database path
    pub db_path: PathBuf,

    /// Interval between commits of replicated rows
    pub commit_interval: Duration,
}

/// One replicated journal.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionConfig {
    /// Journal class tag
    pub class: String,

    /// Location on the origin, the class tag when absent
    #[serde(default)]
    pub remote: Option<String>,

    /// Local location, the remote location when absent
    #[serde(default)]
    pub local: Option<String>,

    /// Expected record count
    #[serde(default)]
    pub record_hint: i32,
}

impl SubscriptionConfig {
    /// Remote and local journal keys.
    #[must_use]
    pub fn keys(&self) -> (JournalKey, JournalKey) {
        let remote = self.remote.as_deref().unwrap_or(&self.class);
        let local = self.local.as_deref().unwrap_or(remote);
        (
            JournalKey::with_location(self.class.clone(), remote)
                .partitioned(PartitionBy::Default, self.record_hint),
            JournalKey::with_location(self.class.clone(), local)
                .partitioned(PartitionBy::Default, self.record_hint),
        )
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            connection: ConnectionConfig {
                node: ServerNode::default(),
                ssl: SslConfig::default(),
                reconnect: ReconnectPolicy::default(),
                token: None,
            },
            persistence: PersistenceConfig {
                db_path: PathBuf::from("./journals.db"),
                commit_interval: Duration::from_secs(1),
            },
            subscriptions: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `JOURNAL_REPL_CLIENT_ID`: Client UUID
    /// - `JOURNAL_REPL_NODE`: Origin address (`host:port` or `tcp://host:port`)
    /// - `JOURNAL_REPL_SECURE`: Wrap the channel in a secure channel
    /// - `JOURNAL_REPL_SERVER_NAME`: Certificate name to verify
    /// - `JOURNAL_REPL_RETRY_COUNT`: Reconnect attempts
    /// - `JOURNAL_REPL_LOGIN_RETRY_COUNT`: Rejected logins tolerated
    /// - `JOURNAL_REPL_RETRY_SLEEP_MS`: Delay between reconnect attempts
    /// - `JOURNAL_REPL_TOKEN`: Base64 credential token
    /// - `JOURNAL_REPL_DB_PATH`: SQLite database path
    /// - `JOURNAL_REPL_COMMIT_INTERVAL_MS`: Commit interval
    /// - `JOURNAL_REPL_SUBSCRIPTIONS`: JSON list of journals
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but malformed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from `lookup`, which maps variable names to values.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(id) = lookup("JOURNAL_REPL_CLIENT_ID") {
            config.client_id = Some(Uuid::parse_str(&id).context("Invalid JOURNAL_REPL_CLIENT_ID")?);
        }

        if let Some(node) = lookup("JOURNAL_REPL_NODE") {
            config.connection.node = node.parse().context("Invalid JOURNAL_REPL_NODE")?;
        }

        if let Some(secure) = lookup("JOURNAL_REPL_SECURE") {
            config.connection.ssl.secure = parse_flag(&secure).context("Invalid JOURNAL_REPL_SECURE")?;
        }

        if let Some(name) = lookup("JOURNAL_REPL_SERVER_NAME") {
            config.connection.ssl.server_name = Some(name);
        }

        if let Some(count) = lookup("JOURNAL_REPL_RETRY_COUNT") {
            config.connection.reconnect.retry_count =
                count.parse().context("Invalid JOURNAL_REPL_RETRY_COUNT")?;
        }

        if let Some(count) = lookup("JOURNAL_REPL_LOGIN_RETRY_COUNT") {
            config.connection.reconnect.login_retry_count =
                count.parse().context("Invalid JOURNAL_REPL_LOGIN_RETRY_COUNT")?;
        }

        if let Some(ms) = lookup("JOURNAL_REPL_RETRY_SLEEP_MS") {
            config.connection.reconnect.sleep_between_retries =
                Duration::from_millis(ms.parse().context("Invalid JOURNAL_REPL_RETRY_SLEEP_MS")?);
        }

        if let Some(token) = lookup("JOURNAL_REPL_TOKEN") {
            config.connection.token = Some(token);
        }

        if let Some(db_path) = lookup("JOURNAL_REPL_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        if let Some(ms) = lookup("JOURNAL_REPL_COMMIT_INTERVAL_MS") {
            let ms: u64 = ms.parse().context("Invalid JOURNAL_REPL_COMMIT_INTERVAL_MS")?;
            anyhow::ensure!(ms > 0, "JOURNAL_REPL_COMMIT_INTERVAL_MS must be positive");
            config.persistence.commit_interval = Duration::from_millis(ms);
        }

        if let Some(subs_json) = lookup("JOURNAL_REPL_SUBSCRIPTIONS") {
            config.subscriptions =
                serde_json::from_str(&subs_json).context("Invalid JOURNAL_REPL_SUBSCRIPTIONS JSON")?;
        }

        Ok(config)
    }

    /// Replication client settings.
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            node: self.connection.node.clone(),
            ssl: self.connection.ssl.clone(),
            reconnect: self.connection.reconnect,
            ..ClientConfig::default()
        }
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("expected a boolean, got {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AgentConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        AgentConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_without_variables() {
        let config = load(&[]).unwrap();
        assert_eq!(config.connection.node, ServerNode::new("localhost", 7075));
        assert!(!config.connection.ssl.secure);
        assert_eq!(config.connection.reconnect, ReconnectPolicy::default());
        assert!(config.subscriptions.is_empty());
    }

    #[test]
    fn variables_override_defaults() {
        let config = load(&[
            ("JOURNAL_REPL_NODE", "tcp://origin:9000"),
            ("JOURNAL_REPL_SECURE", "yes"),
            ("JOURNAL_REPL_RETRY_COUNT", "4"),
            ("JOURNAL_REPL_RETRY_SLEEP_MS", "250"),
            ("JOURNAL_REPL_COMMIT_INTERVAL_MS", "50"),
            ("JOURNAL_REPL_CLIENT_ID", "6f1c2a52-3b1e-4f57-9d8a-0c4b5e2f7a10"),
        ])
        .unwrap();

        assert_eq!(config.connection.node, ServerNode::new("origin", 9000));
        assert!(config.connection.ssl.secure);
        assert_eq!(config.connection.reconnect.retry_count, 4);
        assert_eq!(
            config.connection.reconnect.sleep_between_retries,
            Duration::from_millis(250)
        );
        assert_eq!(config.persistence.commit_interval, Duration::from_millis(50));
        assert!(config.client_id.is_some());

        let client = config.client_config();
        assert_eq!(client.node, config.connection.node);
        assert_eq!(client.reconnect.retry_count, 4);
    }

    #[test]
    fn subscriptions_parsed_from_json() {
        let config = load(&[(
            "JOURNAL_REPL_SUBSCRIPTIONS",
            r#"[{"class":"Trade"},{"class":"Quote","remote":"quotes","local":"replica/quotes","record_hint":100}]"#,
        )])
        .unwrap();

        let (remote, local) = config.subscriptions[0].keys();
        assert_eq!(remote.derived_location(), "Trade");
        assert_eq!(local.derived_location(), "Trade");

        let (remote, local) = config.subscriptions[1].keys();
        assert_eq!(remote.derived_location(), "quotes");
        assert_eq!(local.derived_location(), "replica/quotes");
        assert_eq!(local.record_hint, 100);
    }

    #[test]
    fn malformed_values_rejected() {
        assert!(load(&[("JOURNAL_REPL_NODE", "origin:port")]).is_err());
        assert!(load(&[("JOURNAL_REPL_SECURE", "maybe")]).is_err());
        assert!(load(&[("JOURNAL_REPL_COMMIT_INTERVAL_MS", "0")]).is_err());
        assert!(load(&[("JOURNAL_REPL_SUBSCRIPTIONS", "{")]).is_err());
    }
}
