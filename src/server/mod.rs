//! The client gateway: WebSocket control channel, REST side-channel,
//! and the single struct owning all of the gateway-side mutable state.

pub mod rest;
pub mod stats;
pub mod ws;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::common::{ClientId, PoolKey};
use crate::config::Config;
use crate::pool::{GatewayEvent, ThreadPool};
use crate::protocol::messages::{OutgoingMessage, VoiceServerUpdate};
use crate::sources::SourceRegistry;

/// Voice-server states expire this long after arrival.
pub const VOICE_STATE_TTL_SECS: u64 = 20;
/// Default resume window when a client configures a key without timeout.
pub const DEFAULT_RESUME_TIMEOUT_SECS: u64 = 60;

pub type ConnId = u64;

/// One client WebSocket connection.
pub struct Connection {
    pub id: ConnId,
    pub user_id: ClientId,
    /// Outbound frame channel drained by the socket task.
    pub tx: flume::Sender<String>,
    pub resume_key: parking_lot::Mutex<Option<String>>,
    pub resume_timeout_secs: AtomicU64,
    /// Keepalive: set by pongs, cleared by the ping timer.
    pub alive: AtomicBool,
    /// False once the socket task has returned.
    pub open: AtomicBool,
}

/// Ordered frames held for a disconnected client, keyed by resume key.
pub struct ResumeBuffer {
    pub conn_id: ConnId,
    pub timeout_secs: u64,
    pub events: Vec<String>,
    timer: tokio::task::JoinHandle<()>,
}

struct VoiceStateEntry {
    update: VoiceServerUpdate,
    stored_at: Instant,
}

pub struct Gateway {
    pub config: Config,
    pub pool: Arc<ThreadPool>,
    pub sources: Arc<SourceRegistry>,

    pub connections: DashMap<ConnId, Arc<Connection>>,
    /// Which socket receives a given room's events.
    pub player_map: DashMap<PoolKey, ConnId>,
    pub resume_buffers: DashMap<String, ResumeBuffer>,
    voice_states: DashMap<PoolKey, VoiceStateEntry>,

    started_at: Instant,
    next_conn_id: AtomicU64,
}

impl Gateway {
    pub fn new(config: Config, pool: Arc<ThreadPool>, sources: Arc<SourceRegistry>) -> Self {
        Self {
            config,
            pool,
            sources,
            connections: DashMap::new(),
            player_map: DashMap::new(),
            resume_buffers: DashMap::new(),
            voice_states: DashMap::new(),
            started_at: Instant::now(),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn next_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// Store a voice-server state with its 20 s TTL.
    pub fn store_voice_state(gateway: &Arc<Gateway>, key: PoolKey, update: VoiceServerUpdate) {
        let stored_at = Instant::now();
        gateway.voice_states.insert(
            key.clone(),
            VoiceStateEntry {
                update,
                stored_at,
            },
        );

        let gateway = gateway.clone();
        tokio::spawn(async move {
            tokio::time::sleep(tokio::time::Duration::from_secs(VOICE_STATE_TTL_SECS)).await;
            // Only expire the entry we stored; a newer one restarts the clock.
            gateway
                .voice_states
                .remove_if(&key, |_, entry| entry.stored_at == stored_at);
        });
    }

    /// Non-expired voice-server state for a key, replayed to workers.
    pub fn voice_state(&self, key: &PoolKey) -> Option<VoiceServerUpdate> {
        let entry = self.voice_states.get(key)?;
        if entry.stored_at.elapsed().as_secs() >= VOICE_STATE_TTL_SECS {
            return None;
        }
        Some(entry.update.clone())
    }

    /// Route an outbound frame to the socket registered for its key, or
    /// into the owning connection's resume buffer while it is down.
    pub fn dispatch_frame(&self, key: &PoolKey, frame: &OutgoingMessage) {
        let Some(conn_id) = self.player_map.get(key).map(|entry| *entry) else {
            debug!("no socket registered for {key}, frame dropped");
            return;
        };
        let Some(conn) = self.connections.get(&conn_id).map(|c| c.clone()) else {
            debug!("connection {conn_id} gone, frame for {key} dropped");
            return;
        };

        let json = frame.to_json();
        if conn.open.load(Ordering::Acquire) {
            let _ = conn.tx.send(json);
            return;
        }

        // Disconnected but inside its resume window: buffer in order.
        if let Some(resume_key) = conn.resume_key.lock().clone() {
            if let Some(mut buffer) = self.resume_buffers.get_mut(&resume_key) {
                buffer.events.push(json);
                return;
            }
        }
        debug!("frame for {key} dropped, connection closed without resume");
    }

    /// Socket closed: either open the resume window or clean up now.
    pub async fn handle_close(gateway: &Arc<Gateway>, conn: &Arc<Connection>) {
        conn.open.store(false, Ordering::Release);
        let resume_key = conn.resume_key.lock().clone();

        match resume_key {
            Some(key) => {
                let timeout_secs = conn.resume_timeout_secs.load(Ordering::Acquire);
                info!(
                    "connection {} closed, resumable for {timeout_secs}s under key '{key}'",
                    conn.id
                );

                let timer_gateway = gateway.clone();
                let timer_key = key.clone();
                let conn_id = conn.id;
                let user_id = conn.user_id;
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(tokio::time::Duration::from_secs(timeout_secs)).await;
                    if timer_gateway.resume_buffers.remove(&timer_key).is_some() {
                        info!("resume window for '{timer_key}' expired");
                        timer_gateway.forget_connection(conn_id);
                        timer_gateway.pool.delete_all(user_id).await;
                    }
                });

                gateway.resume_buffers.insert(
                    key,
                    ResumeBuffer {
                        conn_id: conn.id,
                        timeout_secs,
                        events: Vec::new(),
                        timer,
                    },
                );
            }
            None => {
                info!("connection {} closed without resume key", conn.id);
                gateway.forget_connection(conn.id);
                gateway.pool.delete_all(conn.user_id).await;
            }
        }
    }

    /// A reconnect presented a resume key with a live buffer: cancel the
    /// expiry, hand the buffered frames over, and point the key's rooms
    /// at the new socket.
    pub fn complete_resume(&self, resume_key: &str, new_conn: &Arc<Connection>) -> Vec<String> {
        let Some((_, buffer)) = self.resume_buffers.remove(resume_key) else {
            return Vec::new();
        };
        buffer.timer.abort();
        self.forget_connection(buffer.conn_id);

        for mut entry in self.player_map.iter_mut() {
            if *entry.value() == buffer.conn_id {
                *entry.value_mut() = new_conn.id;
            }
        }

        *new_conn.resume_key.lock() = Some(resume_key.to_string());
        new_conn
            .resume_timeout_secs
            .store(buffer.timeout_secs, Ordering::Release);

        info!(
            "session resumed under key '{resume_key}' with {} buffered frame(s)",
            buffer.events.len()
        );
        buffer.events
    }

    /// Drop a connection record and its player-map entries.
    fn forget_connection(&self, conn_id: ConnId) {
        self.connections.remove(&conn_id);
        self.player_map.retain(|_, v| *v != conn_id);
    }
}

/// Drain worker events into the gateway: frames go to sockets, data
/// requests are answered from gateway-held state.
pub fn spawn_event_router(gateway: Arc<Gateway>, rx: flume::Receiver<GatewayEvent>) {
    tokio::spawn(async move {
        while let Ok(event) = rx.recv_async().await {
            match event {
                GatewayEvent::Frame { key, frame } => gateway.dispatch_frame(&key, &frame),
                GatewayEvent::VoiceStateRequest { key, reply } => {
                    let _ = reply.send(gateway.voice_state(&key));
                }
            }
        }
        debug!("event router stopped, pool channel closed");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::PlayerUpdateState;

    fn test_gateway() -> Arc<Gateway> {
        let config = Config::load().expect("built-in defaults always parse");
        let (events_tx, _events_rx) = flume::unbounded();
        let sources = Arc::new(SourceRegistry::new(&config));
        let pool = ThreadPool::new(1, events_tx, sources.clone());
        Arc::new(Gateway::new(config, pool, sources))
    }

    fn test_connection(gateway: &Gateway, user_id: ClientId) -> (Arc<Connection>, flume::Receiver<String>) {
        let (tx, rx) = flume::unbounded();
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
        (conn, rx)
    }

    fn update_frame(room: &str) -> OutgoingMessage {
        OutgoingMessage::PlayerUpdate {
            guild_id: room.into(),
            state: PlayerUpdateState {
                time: 0,
                position: 0,
                connected: false,
            },
        }
    }

    #[tokio::test]
    async fn frames_reach_the_registered_socket() {
        let gateway = test_gateway();
        let (conn, rx) = test_connection(&gateway, 42);
        let key = PoolKey::new(42, "100");
        gateway.player_map.insert(key.clone(), conn.id);

        gateway.dispatch_frame(&key, &update_frame("100"));
        let frame = rx.try_recv().unwrap();
        assert!(frame.contains("playerUpdate"));
    }

    #[tokio::test]
    async fn frames_buffer_during_resume_window_in_order() {
        let gateway = test_gateway();
        let (conn, rx) = test_connection(&gateway, 42);
        let key = PoolKey::new(42, "100");
        gateway.player_map.insert(key.clone(), conn.id);
        *conn.resume_key.lock() = Some("k".into());

        Gateway::handle_close(&gateway, &conn).await;
        drop(rx);

        gateway.dispatch_frame(&key, &update_frame("100"));
        gateway.dispatch_frame(&key, &update_frame("200"));

        let buffer = gateway.resume_buffers.get("k").unwrap();
        assert_eq!(buffer.events.len(), 2);
        assert!(buffer.events[0].contains("\"100\""));
        assert!(buffer.events[1].contains("\"200\""));
    }

    #[tokio::test]
    async fn resume_replays_and_repoints() {
        let gateway = test_gateway();
        let (old_conn, _old_rx) = test_connection(&gateway, 42);
        let key = PoolKey::new(42, "100");
        gateway.player_map.insert(key.clone(), old_conn.id);
        *old_conn.resume_key.lock() = Some("k".into());
        Gateway::handle_close(&gateway, &old_conn).await;
        gateway.dispatch_frame(&key, &update_frame("100"));

        let (new_conn, new_rx) = test_connection(&gateway, 42);
        let replay = gateway.complete_resume("k", &new_conn);
        assert_eq!(replay.len(), 1);
        assert_eq!(new_conn.resume_key.lock().as_deref(), Some("k"));
        assert_eq!(*gateway.player_map.get(&key).unwrap(), new_conn.id);

        // later frames flow to the new socket directly
        gateway.dispatch_frame(&key, &update_frame("100"));
        assert!(new_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn voice_states_expire() {
        let gateway = test_gateway();
        let key = PoolKey::new(42, "100");
        Gateway::store_voice_state(
            &gateway,
            key.clone(),
            VoiceServerUpdate {
                session_id: "s".into(),
                token: "t".into(),
                endpoint: "e".into(),
            },
        );
        assert!(gateway.voice_state(&key).is_some());

        // simulate an aged entry
        gateway
            .voice_states
            .get_mut(&key)
            .unwrap()
            .stored_at = Instant::now() - std::time::Duration::from_secs(VOICE_STATE_TTL_SECS + 1);
        assert!(gateway.voice_state(&key).is_none());
    }
}
