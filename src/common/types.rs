use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// A thread-safe, mutually exclusive shared component.
pub type Shared<T> = Arc<Mutex<T>>;

/// A generic boxed error type.
pub type AnyError = Box<dyn std::error::Error + Send + Sync>;

/// A convenient Result alias returning `AnyError`.
pub type AnyResult<T> = std::result::Result<T, AnyError>;

/// The bot account connected to the client gateway.
pub type ClientId = u64;

/// A voice room (guild), carried as a snowflake string on the wire.
pub type RoomId = String;

/// Identity of a playback queue: one queue per (client, room) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub client_id: ClientId,
    pub room_id: RoomId,
}

impl PoolKey {
    pub fn new(client_id: ClientId, room_id: impl Into<RoomId>) -> Self {
        Self {
            client_id,
            room_id: room_id.into(),
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client_id, self.room_id)
    }
}

/// Exception severity levels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Common,
    Suspicious,
    Fault,
}

/// Current unix time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_key_display() {
        let key = PoolKey::new(42, "100");
        assert_eq!(key.to_string(), "42/100");
    }

    #[test]
    fn severity_wire_format() {
        assert_eq!(serde_json::to_string(&Severity::Common).unwrap(), "\"COMMON\"");
        assert_eq!(serde_json::to_string(&Severity::Fault).unwrap(), "\"FAULT\"");
    }
}
