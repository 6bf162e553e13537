use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::common::AnyResult;

const CONFIG_PATH: &str = "./application.yml";

/// Built-in defaults, deep-merged under whatever `application.yml` provides.
const DEFAULTS: &str = r#"
server:
  address: 0.0.0.0
  port: 2333
lavalink:
  server:
    password: ""
    sources:
      youtube: true
      soundcloud: true
      local: false
      http: true
    youtubeSearchEnabled: true
    soundcloudSearchEnabled: true
logging:
  level:
    root: INFO
    lavalink: INFO
spring:
  main:
    banner-mode: log
"#;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub lavalink: LavalinkConfig,
    pub logging: LoggingConfig,
    pub spring: SpringConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LavalinkConfig {
    pub server: LavalinkServerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LavalinkServerConfig {
    pub password: String,
    pub sources: SourcesConfig,
    pub youtube_search_enabled: bool,
    pub soundcloud_search_enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourcesConfig {
    pub youtube: bool,
    pub soundcloud: bool,
    pub local: bool,
    pub http: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: LogLevels,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogLevels {
    pub root: String,
    pub lavalink: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpringConfig {
    pub main: SpringMainConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpringMainConfig {
    #[serde(rename = "banner-mode")]
    pub banner_mode: String,
}

impl Config {
    /// Load `./application.yml`, deep-merged over the built-in defaults.
    /// A missing file yields the defaults alone.
    pub fn load() -> AnyResult<Self> {
        let user = match std::fs::read_to_string(CONFIG_PATH) {
            Ok(text) => serde_yaml::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Value::Null,
            Err(e) => return Err(e.into()),
        };
        Self::from_value(user)
    }

    fn from_value(user: Value) -> AnyResult<Self> {
        let mut base: Value = serde_yaml::from_str(DEFAULTS)?;
        merge(&mut base, user);
        Ok(serde_yaml::from_value(base)?)
    }

    /// The `Authorization` value required from clients, or `None` when no
    /// password is configured (open node).
    pub fn password(&self) -> Option<&str> {
        let pw = self.lavalink.server.password.as_str();
        if pw.is_empty() { None } else { Some(pw) }
    }

    pub fn banner_enabled(&self) -> bool {
        self.spring.main.banner_mode != "off"
    }
}

/// Recursive mapping merge: `overlay` wins, missing keys fall through to
/// `base`. Non-mapping overlay values replace the base value wholesale.
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let config = Config::from_value(Value::Null).unwrap();
        assert_eq!(config.server.port, 2333);
        assert!(config.password().is_none());
        assert!(config.lavalink.server.sources.youtube);
        assert!(!config.lavalink.server.sources.local);
    }

    #[test]
    fn overlay_deep_merges() {
        let user: Value = serde_yaml::from_str(
            r#"
server:
  port: 8080
lavalink:
  server:
    password: hunter2
    sources:
      youtube: false
"#,
        )
        .unwrap();
        let config = Config::from_value(user).unwrap();
        assert_eq!(config.server.port, 8080);
        // untouched sibling keys keep their defaults
        assert_eq!(config.server.address, "0.0.0.0");
        assert_eq!(config.password(), Some("hunter2"));
        assert!(!config.lavalink.server.sources.youtube);
        assert!(config.lavalink.server.sources.http);
        assert!(config.lavalink.server.youtube_search_enabled);
    }

    #[test]
    fn banner_mode_off() {
        let user: Value =
            serde_yaml::from_str("spring:\n  main:\n    banner-mode: \"off\"\n").unwrap();
        let config = Config::from_value(user).unwrap();
        assert!(!config.banner_enabled());
    }
}
