use tokio::sync::oneshot;

use crate::common::{ClientId, PoolKey};
use crate::protocol::filters::FilterSpec;
use crate::protocol::messages::{OutgoingMessage, PlayerEvent, VoiceServerUpdate};

/// A client request to start (or enqueue) a track.
#[derive(Debug, Clone)]
pub struct PlayRequest {
    pub track: String,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub volume: Option<i64>,
    pub no_replace: bool,
    pub pause: bool,
}

/// Commands a worker accepts on its message loop.
#[derive(Debug)]
pub enum Command {
    /// `broadcast` distinguishes the ownership poll from the placement
    /// message; a polled worker that does not own the key replies `false`
    /// and does nothing.
    Play {
        key: PoolKey,
        request: PlayRequest,
        broadcast: bool,
        reply: Option<oneshot::Sender<bool>>,
    },
    Stop {
        key: PoolKey,
    },
    Pause {
        key: PoolKey,
        pause: bool,
    },
    Destroy {
        key: PoolKey,
    },
    Seek {
        key: PoolKey,
        position_ms: u64,
    },
    Volume {
        key: PoolKey,
        volume: i64,
    },
    Filters {
        key: PoolKey,
        spec: FilterSpec,
    },
    Ffmpeg {
        key: PoolKey,
        args: Vec<String>,
    },
    VoiceServer {
        key: PoolKey,
        update: VoiceServerUpdate,
    },
    Stats {
        reply: oneshot::Sender<WorkerStats>,
    },
    DeleteAll {
        client_id: ClientId,
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// Per-worker player counts, aggregated by the dispatcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerStats {
    pub players: usize,
    pub playing_players: usize,
}

/// Traffic flowing up from workers to the client gateway.
#[derive(Debug)]
pub enum GatewayEvent {
    /// An outbound frame for the socket registered to `key`.
    Frame {
        key: PoolKey,
        frame: OutgoingMessage,
    },
    /// Worker-to-dispatcher data request: replay the stored voice-server
    /// state for a freshly created queue.
    VoiceStateRequest {
        key: PoolKey,
        reply: oneshot::Sender<Option<VoiceServerUpdate>>,
    },
}

/// Per-key event sender handed down to queues, players, and voice
/// connections. Events for one key always travel the same channel, so
/// per-key FIFO ordering is preserved end to end.
#[derive(Clone)]
pub struct EventEmitter {
    key: PoolKey,
    tx: flume::Sender<GatewayEvent>,
}

impl EventEmitter {
    pub fn new(key: PoolKey, tx: flume::Sender<GatewayEvent>) -> Self {
        Self { key, tx }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn frame(&self, frame: OutgoingMessage) {
        let _ = self.tx.send(GatewayEvent::Frame {
            key: self.key.clone(),
            frame,
        });
    }

    pub fn event(&self, event: PlayerEvent) {
        self.frame(OutgoingMessage::Event { event });
    }

    /// Ask the gateway for the stored voice-server state of this key.
    pub async fn request_voice_state(&self) -> Option<VoiceServerUpdate> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(GatewayEvent::VoiceStateRequest {
                key: self.key.clone(),
                reply,
            })
            .ok()?;
        rx.await.ok().flatten()
    }
}
