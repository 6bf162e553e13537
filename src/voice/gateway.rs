//! Voice gateway WebSocket session.
//!
//! Drives the handshake against the platform voice endpoint: identify,
//! ready, UDP IP discovery, protocol selection, session description.
//! Once the secret key arrives the UDP link is armed and the session
//! announces itself as speaking.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::UdpSocket;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::udp::{UdpLink, discover_ip};
use super::{VoiceShared, VoiceStatus};
use crate::common::{AnyResult, ClientId, RoomId, now_ms};
use crate::protocol::messages::VoiceServerUpdate;

/// Voice gateway protocol version in the WebSocket URL.
const VOICE_GATEWAY_VERSION: u8 = 4;
/// Encryption mode this node selects.
const VOICE_MODE: &str = "xsalsa20_poly1305";

/// How a voice session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// Cancelled locally (disconnect/destroy).
    Cancelled,
    /// The remote or the transport closed the connection.
    Closed {
        code: u16,
        reason: String,
        by_remote: bool,
    },
}

/// Fixed reason strings for the platform's voice close codes. Unknown
/// codes pass the transport-provided reason through.
pub fn close_reason(code: u16) -> Option<&'static str> {
    Some(match code {
        4001 => "Unknown opcode",
        4002 => "Failed to decode payload",
        4003 => "Not authenticated",
        4004 => "Authentication failed",
        4005 => "Already authenticated",
        4006 => "Session is no longer valid",
        4009 => "Session timed out",
        4011 => "Server not found",
        4012 => "Unknown protocol",
        4014 => "Disconnected",
        4015 => "Voice server crashed",
        4016 => "Unknown encryption mode",
        _ => return None,
    })
}

pub(super) async fn run_session(
    client_id: ClientId,
    room_id: RoomId,
    update: VoiceServerUpdate,
    shared: Arc<VoiceShared>,
    cancel: CancellationToken,
) -> SessionEnd {
    match drive(client_id, &room_id, &update, &shared, &cancel).await {
        Ok(end) => end,
        Err(e) => {
            warn!("[{room_id}] voice session error: {e}");
            SessionEnd::Closed {
                code: 4000,
                reason: e.to_string(),
                by_remote: false,
            }
        }
    }
}

async fn drive(
    client_id: ClientId,
    room_id: &str,
    update: &VoiceServerUpdate,
    shared: &Arc<VoiceShared>,
    cancel: &CancellationToken,
) -> AnyResult<SessionEnd> {
    let endpoint = update.endpoint.trim_end_matches(":80");
    let url = format!("wss://{endpoint}/?v={VOICE_GATEWAY_VERSION}");
    debug!("[{room_id}] connecting voice gateway {url}");

    let (ws, _) = connect_async(url).await?;
    let (mut sink, mut stream) = ws.split();

    let identify = json!({
        "op": 0,
        "d": {
            "server_id": room_id,
            "user_id": client_id.to_string(),
            "session_id": update.session_id,
            "token": update.token,
        }
    });
    sink.send(Message::text(identify.to_string())).await?;

    let (hb_tx, hb_rx) = flume::unbounded::<String>();
    let mut heartbeat: Option<tokio::task::JoinHandle<()>> = None;
    let mut ssrc = 0u32;
    let mut udp: Option<(Arc<UdpSocket>, std::net::SocketAddr)> = None;

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                if let Some(h) = heartbeat.take() { h.abort(); }
                return Ok(SessionEnd::Cancelled);
            }
            Ok(beat) = hb_rx.recv_async() => {
                sink.send(Message::text(beat)).await?;
                continue;
            }
            msg = stream.next() => msg,
        };

        let msg = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(frame))) => {
                if let Some(h) = heartbeat.take() {
                    h.abort();
                }
                let (code, reason) = match frame {
                    Some(f) => {
                        let code = u16::from(f.code);
                        let reason = close_reason(code)
                            .map(String::from)
                            .unwrap_or_else(|| f.reason.to_string());
                        (code, reason)
                    }
                    None => (4000, String::new()),
                };
                return Ok(SessionEnd::Closed {
                    code,
                    reason,
                    by_remote: true,
                });
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                if let Some(h) = heartbeat.take() {
                    h.abort();
                }
                return Err(e.into());
            }
            None => {
                if let Some(h) = heartbeat.take() {
                    h.abort();
                }
                return Ok(SessionEnd::Closed {
                    code: 4000,
                    reason: "voice gateway stream ended".into(),
                    by_remote: true,
                });
            }
        };

        let payload: Value = match serde_json::from_str(&msg) {
            Ok(v) => v,
            Err(e) => {
                warn!("[{room_id}] undecodable voice gateway frame: {e}");
                continue;
            }
        };

        match payload["op"].as_u64() {
            // HELLO
            Some(8) => {
                let interval = payload["d"]["heartbeat_interval"].as_f64().unwrap_or(30000.0);
                if let Some(h) = heartbeat.take() {
                    h.abort();
                }
                let tx = hb_tx.clone();
                heartbeat = Some(tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(
                        tokio::time::Duration::from_millis(interval as u64),
                    );
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    loop {
                        ticker.tick().await;
                        let beat = json!({"op": 3, "d": now_ms()}).to_string();
                        if tx.send(beat).is_err() {
                            break;
                        }
                    }
                }));
            }
            // READY
            Some(2) => {
                ssrc = payload["d"]["ssrc"].as_u64().unwrap_or(0) as u32;
                let ip = payload["d"]["ip"].as_str().unwrap_or_default();
                let port = payload["d"]["port"].as_u64().unwrap_or(0) as u16;
                let addr: std::net::SocketAddr = format!("{ip}:{port}").parse()?;

                let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
                let (ext_ip, ext_port) = discover_ip(&socket, addr, ssrc).await?;
                debug!("[{room_id}] voice ready, external address {ext_ip}:{ext_port}");

                let select = json!({
                    "op": 1,
                    "d": {
                        "protocol": "udp",
                        "data": {
                            "address": ext_ip,
                            "port": ext_port,
                            "mode": VOICE_MODE,
                        }
                    }
                });
                sink.send(Message::text(select.to_string())).await?;
                udp = Some((socket, addr));
            }
            // SESSION DESCRIPTION
            Some(4) => {
                let key_values = payload["d"]["secret_key"]
                    .as_array()
                    .ok_or("session description without secret_key")?;
                let mut secret_key = [0u8; 32];
                for (i, v) in key_values.iter().take(32).enumerate() {
                    secret_key[i] = v.as_u64().unwrap_or(0) as u8;
                }

                let (socket, addr) = udp
                    .clone()
                    .ok_or("session description before ready")?;
                let link = Arc::new(UdpLink::new(socket, addr, ssrc, secret_key));
                shared.arm(link);

                let speaking = json!({
                    "op": 5,
                    "d": { "speaking": 1, "delay": 0, "ssrc": ssrc }
                });
                sink.send(Message::text(speaking.to_string())).await?;
                shared.set_status(VoiceStatus::Ready);
            }
            // HEARTBEAT ACK / RESUMED / presence traffic
            Some(6) | Some(9) | Some(5) | Some(12) | Some(13) => {}
            other => {
                debug!("[{room_id}] unhandled voice op {other:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::close_reason;

    #[test]
    fn known_codes_have_fixed_reasons() {
        assert_eq!(close_reason(4006), Some("Session is no longer valid"));
        assert_eq!(close_reason(4014), Some("Disconnected"));
        assert_eq!(close_reason(4016), Some("Unknown encryption mode"));
    }

    #[test]
    fn unknown_codes_pass_through() {
        assert_eq!(close_reason(4013), None);
        assert_eq!(close_reason(1000), None);
    }
}
