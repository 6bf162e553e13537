use serde::{Deserialize, Serialize};

use crate::common::{RoomId, Severity};
use crate::protocol::filters::FilterSpec;

/// Control frames received from clients over the WebSocket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IncomingMessage {
    #[serde(rename_all = "camelCase")]
    Play {
        guild_id: RoomId,
        track: String,
        #[serde(default)]
        start_time: Option<u64>,
        #[serde(default)]
        end_time: Option<u64>,
        #[serde(default)]
        volume: Option<i64>,
        #[serde(default)]
        no_replace: Option<bool>,
        #[serde(default)]
        pause: Option<bool>,
    },
    #[serde(rename_all = "camelCase")]
    Stop { guild_id: RoomId },
    #[serde(rename_all = "camelCase")]
    Pause { guild_id: RoomId, pause: bool },
    #[serde(rename_all = "camelCase")]
    Seek { guild_id: RoomId, position: u64 },
    #[serde(rename_all = "camelCase")]
    Volume { guild_id: RoomId, volume: i64 },
    #[serde(rename_all = "camelCase")]
    Filters {
        guild_id: RoomId,
        #[serde(flatten)]
        spec: FilterSpec,
    },
    #[serde(rename_all = "camelCase")]
    Ffmpeg { guild_id: RoomId, args: Vec<String> },
    #[serde(rename_all = "camelCase")]
    Destroy { guild_id: RoomId },
    #[serde(rename_all = "camelCase")]
    VoiceUpdate {
        guild_id: RoomId,
        session_id: String,
        event: VoiceServerEvent,
    },
    #[serde(rename_all = "camelCase")]
    ConfigureResuming {
        key: Option<String>,
        #[serde(default)]
        timeout: Option<u64>,
    },
    Dump {},
}

/// The raw VOICE_SERVER_UPDATE payload forwarded by the client. Field
/// names are the chat platform's own (snake_case).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceServerEvent {
    pub token: String,
    #[serde(default)]
    pub guild_id: Option<String>,
    pub endpoint: Option<String>,
}

/// Everything a queue needs to join and speak in a voice room, replayed
/// to workers on demand. Entries expire 20 s after arrival.
#[derive(Debug, Clone)]
pub struct VoiceServerUpdate {
    pub session_id: String,
    pub token: String,
    pub endpoint: String,
}

/// Frames sent to clients over the WebSocket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum OutgoingMessage {
    #[serde(rename_all = "camelCase")]
    PlayerUpdate {
        guild_id: RoomId,
        state: PlayerUpdateState,
    },
    Stats {
        #[serde(flatten)]
        stats: crate::server::stats::Stats,
    },
    Event {
        #[serde(flatten)]
        event: PlayerEvent,
    },
}

impl OutgoingMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }
}

/// Position snapshot pushed on the 5 s heartbeat.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PlayerUpdateState {
    pub time: u64,
    pub position: u64,
    pub connected: bool,
}

/// Events emitted by the playback layer (op = "event").
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum PlayerEvent {
    #[serde(rename = "TrackStartEvent", rename_all = "camelCase")]
    TrackStart { guild_id: RoomId, track: String },

    #[serde(rename = "TrackEndEvent", rename_all = "camelCase")]
    TrackEnd {
        guild_id: RoomId,
        track: String,
        reason: TrackEndReason,
    },

    #[serde(rename = "TrackExceptionEvent", rename_all = "camelCase")]
    TrackException {
        guild_id: RoomId,
        track: Option<String>,
        error: String,
        exception: ExceptionDetail,
    },

    #[serde(rename = "TrackStuckEvent", rename_all = "camelCase")]
    TrackStuck {
        guild_id: RoomId,
        track: String,
        threshold_ms: u64,
    },

    #[serde(rename = "WebSocketClosedEvent", rename_all = "camelCase")]
    WebSocketClosed {
        guild_id: RoomId,
        code: u16,
        reason: String,
        by_remote: bool,
    },
}

/// Why a track stopped playing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

/// Error detail attached to `TrackExceptionEvent`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetail {
    pub message: Option<String>,
    pub severity: Severity,
    pub cause: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_play_frame() {
        let json = r#"{"op":"play","guildId":"100","track":"abc","noReplace":true}"#;
        let msg: IncomingMessage = serde_json::from_str(json).unwrap();
        match msg {
            IncomingMessage::Play {
                guild_id,
                track,
                no_replace,
                start_time,
                ..
            } => {
                assert_eq!(guild_id, "100");
                assert_eq!(track, "abc");
                assert_eq!(no_replace, Some(true));
                assert_eq!(start_time, None);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parses_voice_update_frame() {
        let json = r#"{"op":"voiceUpdate","guildId":"100","sessionId":"s","event":{"token":"t","guild_id":"100","endpoint":"e"}}"#;
        let msg: IncomingMessage = serde_json::from_str(json).unwrap();
        match msg {
            IncomingMessage::VoiceUpdate {
                guild_id,
                session_id,
                event,
            } => {
                assert_eq!(guild_id, "100");
                assert_eq!(session_id, "s");
                assert_eq!(event.token, "t");
                assert_eq!(event.endpoint.as_deref(), Some("e"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parses_filters_frame_with_flattened_spec() {
        let json = r#"{"op":"filters","guildId":"100","timescale":{"speed":2.0}}"#;
        let msg: IncomingMessage = serde_json::from_str(json).unwrap();
        match msg {
            IncomingMessage::Filters { spec, .. } => {
                assert_eq!(spec.timescale.unwrap().speed, 2.0);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn event_frame_wire_shape() {
        let event = PlayerEvent::TrackEnd {
            guild_id: "100".into(),
            track: "abc".into(),
            reason: TrackEndReason::Finished,
        };
        let json = serde_json::to_value(OutgoingMessage::Event { event }).unwrap();
        assert_eq!(json["op"], "event");
        assert_eq!(json["type"], "TrackEndEvent");
        assert_eq!(json["guildId"], "100");
        assert_eq!(json["reason"], "FINISHED");
    }

    #[test]
    fn end_reason_wire_format() {
        assert_eq!(
            serde_json::to_string(&TrackEndReason::LoadFailed).unwrap(),
            "\"LOAD_FAILED\""
        );
        assert_eq!(
            serde_json::to_string(&TrackEndReason::Stopped).unwrap(),
            "\"STOPPED\""
        );
    }

    #[test]
    fn player_update_wire_shape() {
        let msg = OutgoingMessage::PlayerUpdate {
            guild_id: "100".into(),
            state: PlayerUpdateState {
                time: 1,
                position: 2,
                connected: true,
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["op"], "playerUpdate");
        assert_eq!(json["state"]["position"], 2);
    }
}
