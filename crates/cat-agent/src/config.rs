// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent configuration.
//!
//! Values are layered with figment: built-in defaults, then the YAML file, then
//! `CAT_AGENT_*` environment variables (`__` separates nested keys, so
//! `CAT_AGENT_CAT__DOMAIN` sets `cat.domain`).
//!
//! ```yaml
//! log_level: info
//! cat:
//!   domain: my-app
//!   servers: ["10.0.0.1:8080"]
//!   routers: "10.0.0.2:2280;10.0.0.3:2280"
//! server:
//!   addr: 127.0.0.1:2280
//! ```

use std::path::Path;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::Deserialize;
use tracing::debug;

use crate::constants::{
    DEFAULT_CONSUMER_NUM, DEFAULT_ENV, DEFAULT_IP_HEX, DEFAULT_SERVER_ADDR,
    DEFAULT_SERVER_TIMEOUT_MILLIS,
};
use crate::errors::ConfigError;
use crate::util::{get_hostname, get_local_ip, ip_to_hex};

pub const ENV_PREFIX: &str = "CAT_AGENT_";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub log_level: String,
    pub cat: CatConfig,
    pub server: ServerConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            log_level: "info".to_string(),
            cat: CatConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CatConfig {
    pub domain: String,
    pub hostname: String,
    pub env: String,
    pub ip: String,
    /// Hex form of `ip`, filled by [`AgentConfig::validate`].
    #[serde(skip)]
    pub ip_hex: String,
    /// Control-plane servers asked for the routing table. Accepts a list or a
    /// `;`/`,` separated string.
    #[serde(deserialize_with = "deserialize_servers")]
    pub servers: Vec<String>,
    /// Static seed for the routing table, `host:port;host:port`.
    pub routers: Option<String>,
    /// Sample ratio used until the control plane answers with one.
    pub sample: f64,
    pub sender_normal_queue_consumer_num: i64,
    pub sender_high_queue_consumer_num: i64,
}

impl Default for CatConfig {
    fn default() -> Self {
        CatConfig {
            domain: String::new(),
            hostname: String::new(),
            env: DEFAULT_ENV.to_string(),
            ip: String::new(),
            ip_hex: String::new(),
            servers: Vec::new(),
            routers: None,
            sample: 1.0,
            sender_normal_queue_consumer_num: 0,
            sender_high_queue_consumer_num: 0,
        }
    }
}

impl CatConfig {
    #[must_use]
    pub fn normal_consumers(&self) -> usize {
        consumer_num(self.sender_normal_queue_consumer_num)
    }

    #[must_use]
    pub fn high_consumers(&self) -> usize {
        consumer_num(self.sender_high_queue_consumer_num)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrList {
    String(String),
    List(Vec<String>),
}

fn deserialize_servers<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let servers = match StringOrList::deserialize(deserializer)? {
        StringOrList::String(s) => s
            .split([';', ','])
            .map(|server| server.trim().to_string())
            .collect(),
        StringOrList::List(list) => list,
    };
    Ok(servers)
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn consumer_num(value: i64) -> usize {
    if value <= 0 {
        DEFAULT_CONSUMER_NUM
    } else {
        value as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `host:port`, or `unix:///path/to/socket`.
    pub addr: String,
    pub read_timeout_millis: u64,
    pub write_timeout_millis: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            addr: DEFAULT_SERVER_ADDR.to_string(),
            read_timeout_millis: DEFAULT_SERVER_TIMEOUT_MILLIS,
            write_timeout_millis: DEFAULT_SERVER_TIMEOUT_MILLIS,
        }
    }
}

impl AgentConfig {
    /// Loads and validates the configuration. A missing file is not an error; the
    /// environment alone can carry a complete configuration.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading configuration from {}", path.display());
        let figment = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: AgentConfig = figment
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks required values and fills detected host facts.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let cat = &mut self.cat;
        cat.domain = cat.domain.trim().to_string();
        if cat.domain.is_empty() {
            return Err(ConfigError::MissingDomain);
        }
        cat.servers.retain(|s| !s.trim().is_empty());
        if cat.servers.is_empty() {
            return Err(ConfigError::MissingServers);
        }
        if cat.sender_normal_queue_consumer_num < 0 {
            return Err(ConfigError::NegativeConsumerNum(
                "sender_normal_queue_consumer_num",
            ));
        }
        if cat.sender_high_queue_consumer_num < 0 {
            return Err(ConfigError::NegativeConsumerNum("sender_high_queue_consumer_num"));
        }

        if cat.hostname.is_empty() {
            cat.hostname = get_hostname();
        }
        if cat.env.is_empty() {
            cat.env = DEFAULT_ENV.to_string();
        }
        if cat.ip.is_empty() {
            cat.ip = get_local_ip();
        }
        cat.ip_hex = ip_to_hex(&cat.ip).unwrap_or_else(|| DEFAULT_IP_HEX.to_string());
        if !cat.sample.is_finite() {
            cat.sample = 1.0;
        }
        if self.log_level.is_empty() {
            self.log_level = "info".to_string();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_load_yaml() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "cat-agent.yaml",
                r#"
log_level: debug
cat:
  domain: shop
  hostname: host-1
  ip: 10.1.2.3
  servers: ["10.0.0.1:8080", "10.0.0.2:8080"]
  routers: "10.0.0.9:2280"
  sender_high_queue_consumer_num: 3
server:
  addr: unix:///tmp/cat.sock
"#,
            )?;
            let config = AgentConfig::load(Path::new("cat-agent.yaml")).expect("config");
            assert_eq!(config.log_level, "debug");
            assert_eq!(config.cat.domain, "shop");
            assert_eq!(config.cat.hostname, "host-1");
            assert_eq!(config.cat.env, "dev");
            assert_eq!(config.cat.ip_hex, "0a010203");
            assert_eq!(config.cat.servers.len(), 2);
            assert_eq!(config.cat.routers.as_deref(), Some("10.0.0.9:2280"));
            assert_eq!(config.cat.normal_consumers(), 10);
            assert_eq!(config.cat.high_consumers(), 3);
            assert_eq!(config.server.addr, "unix:///tmp/cat.sock");
            assert_eq!(config.server.read_timeout_millis, 5000);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_yaml() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "cat-agent.yaml",
                r#"
cat:
  domain: shop
  servers: ["10.0.0.1:8080"]
"#,
            )?;
            jail.set_env("CAT_AGENT_CAT__DOMAIN", "billing");
            jail.set_env("CAT_AGENT_LOG_LEVEL", "warn");
            jail.set_env("CAT_AGENT_SERVER__WRITE_TIMEOUT_MILLIS", "250");
            let config = AgentConfig::load(Path::new("cat-agent.yaml")).expect("config");
            assert_eq!(config.cat.domain, "billing");
            assert_eq!(config.log_level, "warn");
            assert_eq!(config.server.write_timeout_millis, 250);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_uses_env_only() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("CAT_AGENT_CAT__DOMAIN", "shop");
            jail.set_env("CAT_AGENT_CAT__SERVERS", "10.0.0.1:8080;10.0.0.2:8080");
            let config = AgentConfig::load(Path::new("missing.yaml")).expect("config");
            assert_eq!(config.cat.servers, vec!["10.0.0.1:8080", "10.0.0.2:8080"]);
            assert!(!config.cat.hostname.is_empty());
            assert!(!config.cat.ip_hex.is_empty());
            Ok(())
        });
    }

    #[test]
    fn test_validation_errors() {
        let mut config = AgentConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::MissingDomain)));

        config.cat.domain = "shop".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::MissingServers)));

        config.cat.servers = vec!["10.0.0.1:8080".to_string()];
        config.cat.sender_normal_queue_consumer_num = -1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NegativeConsumerNum("sender_normal_queue_consumer_num"))
        ));

        config.cat.sender_normal_queue_consumer_num = 0;
        config.cat.ip = "not-an-ip".to_string();
        config.validate().expect("valid");
        assert_eq!(config.cat.ip_hex, "7f000001");
        assert_eq!(config.cat.normal_consumers(), 10);
    }

    #[test]
    fn test_malformed_yaml_is_load_error() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("cat-agent.yaml", "cat: [unclosed")?;
            let result = AgentConfig::load(Path::new("cat-agent.yaml"));
            assert!(matches!(result, Err(ConfigError::Load(_))));
            Ok(())
        });
    }
}
