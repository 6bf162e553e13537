//! Voice transport: the secure UDP connection to the platform's voice
//! endpoint, plus the WebSocket control session that negotiates it.

pub mod gateway;
pub mod udp;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::common::PoolKey;
use crate::pool::EventEmitter;
use crate::protocol::PlayerEvent;
use crate::protocol::messages::VoiceServerUpdate;
use udp::UdpLink;

/// Voice connection must reach Ready within this window, else the queue
/// reports `WebSocketClosedEvent{code: 4000}`.
pub const VOICE_CONNECT_THRESHOLD_MS: u64 = 20_000;

#[derive(Debug, Clone, PartialEq)]
pub enum VoiceStatus {
    Disconnected,
    Connecting,
    Ready,
    Closed {
        code: u16,
        reason: String,
        by_remote: bool,
    },
}

/// State shared between the session task and the connection facade.
pub struct VoiceShared {
    status_tx: watch::Sender<VoiceStatus>,
    link: Mutex<Option<Arc<UdpLink>>>,
}

impl VoiceShared {
    fn new() -> Self {
        let (status_tx, _) = watch::channel(VoiceStatus::Disconnected);
        Self {
            status_tx,
            link: Mutex::new(None),
        }
    }

    pub(crate) fn arm(&self, link: Arc<UdpLink>) {
        *self.link.lock() = Some(link);
    }

    pub(crate) fn set_status(&self, status: VoiceStatus) {
        let _ = self.status_tx.send(status);
    }
}

/// One voice connection per queue, shared between the queue and its
/// player pipelines.
pub struct VoiceConnection {
    key: PoolKey,
    shared: Arc<VoiceShared>,
    session: Mutex<Option<CancellationToken>>,
    emitter: EventEmitter,
}

impl VoiceConnection {
    pub fn new(key: PoolKey, emitter: EventEmitter) -> Self {
        Self {
            key,
            shared: Arc::new(VoiceShared::new()),
            session: Mutex::new(None),
            emitter,
        }
    }

    /// (Re)connect using a voice-server update. Any previous session is
    /// torn down first; a watchdog reports failure to reach Ready.
    pub fn connect(&self, update: VoiceServerUpdate) {
        let cancel = CancellationToken::new();
        if let Some(old) = self.session.lock().replace(cancel.clone()) {
            old.cancel();
        }
        self.shared.set_status(VoiceStatus::Connecting);

        let key = self.key.clone();
        let shared = self.shared.clone();
        let emitter = self.emitter.clone();

        let session_cancel = cancel.clone();
        tokio::spawn(async move {
            let end = gateway::run_session(
                key.client_id,
                key.room_id.clone(),
                update,
                shared.clone(),
                session_cancel,
            )
            .await;

            if let gateway::SessionEnd::Closed {
                code,
                reason,
                by_remote,
            } = end
            {
                info!("[{key}] voice gateway closed: {code} {reason}");
                shared.set_status(VoiceStatus::Closed {
                    code,
                    reason: reason.clone(),
                    by_remote,
                });
                emitter.event(PlayerEvent::WebSocketClosed {
                    guild_id: key.room_id.clone(),
                    code,
                    reason,
                    by_remote,
                });
            }
        });

        // Ready watchdog
        let shared = self.shared.clone();
        let emitter = self.emitter.clone();
        let key = self.key.clone();
        tokio::spawn(async move {
            let mut status = shared.status_tx.subscribe();
            let deadline = tokio::time::Duration::from_millis(VOICE_CONNECT_THRESHOLD_MS);
            let reached = tokio::time::timeout(deadline, async {
                loop {
                    if *status.borrow() == VoiceStatus::Ready {
                        return true;
                    }
                    if matches!(*status.borrow(), VoiceStatus::Closed { .. }) {
                        return false;
                    }
                    if status.changed().await.is_err() {
                        return false;
                    }
                }
            })
            .await;

            match reached {
                Ok(true) => return,
                // The session already reported its own close.
                Ok(false) => return,
                Err(_) if cancel.is_cancelled() => return,
                Err(_) => {}
            }
            debug!("[{key}] voice connection did not become ready in time");
            emitter.event(PlayerEvent::WebSocketClosed {
                guild_id: key.room_id.clone(),
                code: 4000,
                reason: "Voice connection was not established in time".into(),
                by_remote: false,
            });
        });
    }

    /// Send one Opus frame. Returns `false` when the link is not ready
    /// and the frame was dropped.
    pub async fn send_opus(&self, packet: &[u8]) -> bool {
        let link = self.shared.link.lock().clone();
        match link {
            Some(link) => link.send_opus(packet).await.is_ok(),
            None => false,
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.shared.status_tx.borrow() == VoiceStatus::Ready
    }

    /// Wait until the link is usable, bounded by the caller's timeout.
    pub async fn wait_ready(&self, timeout: tokio::time::Duration) -> bool {
        let mut status = self.shared.status_tx.subscribe();
        tokio::time::timeout(timeout, async {
            loop {
                if *status.borrow() == VoiceStatus::Ready {
                    return true;
                }
                if status.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    /// Test hook: mark the link Ready without negotiating a session.
    #[cfg(test)]
    pub(crate) fn force_ready(&self) {
        self.shared.set_status(VoiceStatus::Ready);
    }

    /// Tear the session down. Safe to call repeatedly.
    pub fn disconnect(&self) {
        if let Some(cancel) = self.session.lock().take() {
            cancel.cancel();
        }
        *self.shared.link.lock() = None;
        self.shared.set_status(VoiceStatus::Disconnected);
    }
}

impl Drop for VoiceConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
