//! WebSocket control channel: upgrade handshake, inbound op dispatch,
//! keepalive, resume replay, and the per-connection stats heartbeat.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, info, warn};

use super::{Connection, DEFAULT_RESUME_TIMEOUT_SECS, Gateway, stats};
use crate::common::{ClientId, PoolKey};
use crate::pool::{Command, PlayRequest};
use crate::protocol::messages::{IncomingMessage, OutgoingMessage, VoiceServerUpdate};

/// Keepalive ping and stats cadence.
const KEEPALIVE_INTERVAL_SECS: u64 = 60;
const STATS_INTERVAL_SECS: u64 = 60;

/// The upgrade handshake: `Authorization` must match the configured
/// password, `User-Id` must be numeric. A valid `Resume-Key` header with
/// a live buffer marks the session resumed.
pub async fn websocket_handler(
    headers: HeaderMap,
    ws: WebSocketUpgrade,
    State(gateway): State<Arc<Gateway>>,
) -> Result<Response, (StatusCode, &'static str)> {
    if let Some(password) = gateway.config.password() {
        let presented = headers
            .get("authorization")
            .and_then(|h| h.to_str().ok());
        if presented != Some(password) {
            warn!("websocket upgrade rejected: bad authorization");
            return Err((StatusCode::UNAUTHORIZED, "Unauthorized"));
        }
    }

    let user_id = headers
        .get("user-id")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.parse::<ClientId>().ok());
    let Some(user_id) = user_id else {
        warn!("websocket upgrade rejected: missing or non-numeric User-Id");
        return Err((StatusCode::UNAUTHORIZED, "Unauthorized"));
    };

    let resume_key = headers
        .get("resume-key")
        .and_then(|h| h.to_str().ok())
        .map(String::from);
    let resuming = resume_key
        .as_deref()
        .map(|key| gateway.resume_buffers.contains_key(key))
        .unwrap_or(false);

    let mut response = ws
        .on_upgrade(move |socket| handle_socket(socket, gateway, user_id, resume_key))
        .into_response();
    let headers = response.headers_mut();
    headers.insert(
        "Session-Resumed",
        HeaderValue::from_static(if resuming { "true" } else { "false" }),
    );
    headers.insert("Lavalink-Major-Version", HeaderValue::from_static("3"));
    headers.insert("Is-Volcano", HeaderValue::from_static("true"));

    Ok(response)
}

async fn handle_socket(
    mut socket: WebSocket,
    gateway: Arc<Gateway>,
    user_id: ClientId,
    resume_key: Option<String>,
) {
    let (tx, rx) = flume::unbounded::<String>();
    let conn = Arc::new(Connection {
        id: gateway.next_conn_id(),
        user_id,
        tx,
        resume_key: parking_lot::Mutex::new(None),
        resume_timeout_secs: AtomicU64::new(DEFAULT_RESUME_TIMEOUT_SECS),
        alive: AtomicBool::new(true),
        open: AtomicBool::new(true),
    });
    gateway.connections.insert(conn.id, conn.clone());
    info!("client connected: conn={} user={user_id}", conn.id);

    // Replay buffered frames before anything else so ordering holds.
    if let Some(key) = resume_key {
        for frame in gateway.complete_resume(&key, &conn) {
            if socket.send(Message::Text(frame.into())).await.is_err() {
                Gateway::handle_close(&gateway, &conn).await;
                return;
            }
        }
    }

    // Initial stats frame.
    let initial = stats::collect(&gateway.pool, gateway.uptime_ms()).await;
    let frame = OutgoingMessage::Stats { stats: initial }.to_json();
    if socket.send(Message::Text(frame.into())).await.is_err() {
        Gateway::handle_close(&gateway, &conn).await;
        return;
    }

    let mut stats_interval = tokio::time::interval(tokio::time::Duration::from_secs(
        STATS_INTERVAL_SECS,
    ));
    stats_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    stats_interval.tick().await; // burn the immediate first tick

    let mut keepalive = tokio::time::interval(tokio::time::Duration::from_secs(
        KEEPALIVE_INTERVAL_SECS,
    ));
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    keepalive.tick().await;

    loop {
        tokio::select! {
            _ = stats_interval.tick() => {
                let stats = stats::collect(&gateway.pool, gateway.uptime_ms()).await;
                let frame = OutgoingMessage::Stats { stats }.to_json();
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            _ = keepalive.tick() => {
                if !conn.alive.swap(false, Ordering::AcqRel) {
                    warn!("conn={} missed keepalive, terminating", conn.id);
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            frame = rx.recv_async() => {
                let Ok(frame) = frame else { break };
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                let message = match inbound {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        warn!("conn={} socket error: {e}", conn.id);
                        break;
                    }
                    None => break,
                };
                match message {
                    Message::Text(text) => {
                        match serde_json::from_str::<IncomingMessage>(&text) {
                            Ok(frame) => handle_frame(&gateway, &conn, frame).await,
                            // Malformed payloads are logged and dropped;
                            // the client stays connected.
                            Err(e) => warn!("conn={} bad frame: {e}", conn.id),
                        }
                    }
                    Message::Pong(_) => {
                        conn.alive.store(true, Ordering::Release);
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    Gateway::handle_close(&gateway, &conn).await;
}

async fn handle_frame(gateway: &Arc<Gateway>, conn: &Arc<Connection>, frame: IncomingMessage) {
    match frame {
        IncomingMessage::Play {
            guild_id,
            track,
            start_time,
            end_time,
            volume,
            no_replace,
            pause,
        } => {
            let key = PoolKey::new(conn.user_id, guild_id);
            gateway.player_map.insert(key.clone(), conn.id);
            gateway
                .pool
                .play(
                    key,
                    PlayRequest {
                        track,
                        start_time,
                        end_time,
                        volume,
                        no_replace: no_replace.unwrap_or(false),
                        pause: pause.unwrap_or(false),
                    },
                )
                .await;
        }
        IncomingMessage::VoiceUpdate {
            guild_id,
            session_id,
            event,
        } => {
            if let Some(event_guild) = &event.guild_id {
                if *event_guild != guild_id {
                    warn!("voiceUpdate guild mismatch: frame={guild_id} event={event_guild}");
                }
            }
            let Some(endpoint) = event.endpoint else {
                debug!("voiceUpdate for {guild_id} without endpoint, ignored");
                return;
            };
            let key = PoolKey::new(conn.user_id, guild_id);
            let update = VoiceServerUpdate {
                session_id,
                token: event.token,
                endpoint,
            };
            Gateway::store_voice_state(gateway, key.clone(), update.clone());
            gateway.pool.send(|| Command::VoiceServer {
                key: key.clone(),
                update: update.clone(),
            });
        }
        IncomingMessage::Stop { guild_id } => {
            let key = PoolKey::new(conn.user_id, guild_id);
            gateway.pool.send(|| Command::Stop { key: key.clone() });
        }
        IncomingMessage::Pause { guild_id, pause } => {
            let key = PoolKey::new(conn.user_id, guild_id);
            gateway.pool.send(|| Command::Pause {
                key: key.clone(),
                pause,
            });
        }
        IncomingMessage::Destroy { guild_id } => {
            let key = PoolKey::new(conn.user_id, guild_id);
            gateway.player_map.remove(&key);
            gateway.pool.send(|| Command::Destroy { key: key.clone() });
        }
        IncomingMessage::Seek { guild_id, position } => {
            let key = PoolKey::new(conn.user_id, guild_id);
            gateway.pool.send(|| Command::Seek {
                key: key.clone(),
                position_ms: position,
            });
        }
        IncomingMessage::Volume { guild_id, volume } => {
            let key = PoolKey::new(conn.user_id, guild_id);
            gateway.pool.send(|| Command::Volume {
                key: key.clone(),
                volume,
            });
        }
        IncomingMessage::Filters { guild_id, spec } => {
            let key = PoolKey::new(conn.user_id, guild_id);
            gateway.pool.send(|| Command::Filters {
                key: key.clone(),
                spec: spec.clone(),
            });
        }
        IncomingMessage::Ffmpeg { guild_id, args } => {
            let key = PoolKey::new(conn.user_id, guild_id);
            gateway.pool.send(|| Command::Ffmpeg {
                key: key.clone(),
                args: args.clone(),
            });
        }
        IncomingMessage::ConfigureResuming { key, timeout } => {
            info!(
                "conn={} configured resuming key={key:?} timeout={timeout:?}",
                conn.id
            );
            *conn.resume_key.lock() = key;
            conn.resume_timeout_secs.store(
                timeout.unwrap_or(DEFAULT_RESUME_TIMEOUT_SECS),
                Ordering::Release,
            );
        }
        IncomingMessage::Dump {} => {
            gateway.pool.dump();
        }
    }
}
