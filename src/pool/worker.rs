//! A playback worker: one OS thread, one current-thread runtime, one
//! message loop over a disjoint set of queues.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, error, info};

use super::messages::{Command, GatewayEvent, WorkerStats};
use crate::common::{PoolKey, Shared, now_ms};
use crate::playback::Queue;
use crate::pool::EventEmitter;
use crate::protocol::messages::{OutgoingMessage, PlayerUpdateState};
use crate::sources::SourceRegistry;

/// Cadence of the per-queue `playerUpdate` heartbeat.
pub const PLAYER_UPDATE_INTERVAL_SECS: u64 = 5;

pub(super) struct WorkerSeed {
    pub index: usize,
    pub rx: flume::Receiver<Command>,
    pub events: flume::Sender<GatewayEvent>,
    pub sources: Arc<SourceRegistry>,
    pub queue_count: Arc<AtomicUsize>,
}

/// Spawn the worker thread. It runs until `Command::Shutdown`, its
/// channel closes, or it panics (the dispatcher's reaper respawns it).
pub(super) fn spawn(seed: WorkerSeed) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("worker-{}", seed.index))
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("worker runtime");
            runtime.block_on(run(seed));
        })
        .expect("spawn worker thread")
}

async fn run(seed: WorkerSeed) {
    let WorkerSeed {
        index,
        rx,
        events,
        sources,
        queue_count,
    } = seed;

    let mut queues: HashMap<PoolKey, Shared<Queue>> = HashMap::new();
    let mut ticker = tokio::time::interval(tokio::time::Duration::from_secs(
        PLAYER_UPDATE_INTERVAL_SECS,
    ));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    debug!("worker {index} up");

    loop {
        tokio::select! {
            command = rx.recv_async() => {
                match command {
                    Ok(Command::Shutdown) => break,
                    Ok(command) => {
                        handle_command(command, index, &mut queues, &events, &sources).await;
                        queue_count.store(queues.len(), Ordering::Release);
                    }
                    Err(_) => break,
                }
            }
            _ = ticker.tick() => heartbeat(&queues, &events).await,
        }
    }

    info!("worker {index} shutting down with {} queue(s)", queues.len());
    for (_, queue) in queues.drain() {
        Queue::destroy(&queue).await;
    }
    queue_count.store(0, Ordering::Release);
}

async fn handle_command(
    command: Command,
    index: usize,
    queues: &mut HashMap<PoolKey, Shared<Queue>>,
    events: &flume::Sender<GatewayEvent>,
    sources: &Arc<SourceRegistry>,
) {
    match command {
        Command::Play {
            key,
            request,
            broadcast,
            reply,
        } => {
            let owns = queues.contains_key(&key);
            if let Some(reply) = reply {
                let _ = reply.send(owns);
            }
            if broadcast && !owns {
                return;
            }

            let queue = match queues.get(&key) {
                Some(queue) => queue.clone(),
                None => {
                    info!("worker {index} takes ownership of {key}");
                    let emitter = EventEmitter::new(key.clone(), events.clone());
                    let queue = Arc::new(tokio::sync::Mutex::new(Queue::new(
                        key.clone(),
                        emitter.clone(),
                        sources.clone(),
                    )));
                    queues.insert(key.clone(), queue.clone());

                    // Replay the voice-server state the gateway saw before
                    // this queue existed.
                    if let Some(update) = emitter.request_voice_state().await {
                        queue.lock().await.voice.connect(update);
                    } else {
                        debug!("no stored voice state for {key} yet");
                    }
                    queue
                }
            };
            Queue::play(&queue, request).await;
        }
        Command::Stop { key } => {
            if let Some(queue) = queues.get(&key) {
                Queue::stop(queue).await;
            }
        }
        Command::Pause { key, pause } => {
            if let Some(queue) = queues.get(&key) {
                Queue::pause(queue, pause).await;
            }
        }
        Command::Destroy { key } => {
            if let Some(queue) = queues.remove(&key) {
                Queue::destroy(&queue).await;
                if queues.is_empty() {
                    debug!("worker {index} idle");
                }
            }
        }
        Command::Seek { key, position_ms } => {
            if let Some(queue) = queues.get(&key) {
                Queue::seek(queue, position_ms).await;
            }
        }
        Command::Volume { key, volume } => {
            if let Some(queue) = queues.get(&key) {
                Queue::set_volume(queue, volume).await;
            }
        }
        Command::Filters { key, spec } => {
            if let Some(queue) = queues.get(&key) {
                Queue::apply_filters(queue, spec).await;
            }
        }
        Command::Ffmpeg { key, args } => {
            if let Some(queue) = queues.get(&key) {
                Queue::apply_ffmpeg(queue, args).await;
            }
        }
        Command::VoiceServer { key, update } => {
            if let Some(queue) = queues.get(&key) {
                queue.lock().await.voice.connect(update);
            }
        }
        Command::Stats { reply } => {
            let mut stats = WorkerStats {
                players: queues.len(),
                playing_players: 0,
            };
            for queue in queues.values() {
                if queue.lock().await.is_playing() {
                    stats.playing_players += 1;
                }
            }
            let _ = reply.send(stats);
        }
        Command::DeleteAll { client_id, reply } => {
            let keys: Vec<PoolKey> = queues
                .keys()
                .filter(|k| k.client_id == client_id)
                .cloned()
                .collect();
            let mut destroyed = 0;
            for key in keys {
                if let Some(queue) = queues.remove(&key) {
                    Queue::destroy(&queue).await;
                    destroyed += 1;
                }
            }
            if destroyed > 0 {
                info!("worker {index} destroyed {destroyed} queue(s) for client {client_id}");
            }
            let _ = reply.send(destroyed);
        }
        Command::Shutdown => unreachable!("handled by the loop"),
    }
}

/// Emit a `playerUpdate` for every queue that holds a track and is not
/// paused.
async fn heartbeat(
    queues: &HashMap<PoolKey, Shared<Queue>>,
    events: &flume::Sender<GatewayEvent>,
) {
    for (key, queue) in queues {
        let q = queue.lock().await;
        if q.is_destroyed() || q.is_paused() || !q.has_track() {
            continue;
        }
        let frame = OutgoingMessage::PlayerUpdate {
            guild_id: key.room_id.clone(),
            state: PlayerUpdateState {
                time: now_ms(),
                position: q.position_ms(),
                connected: q.voice.is_ready(),
            },
        };
        drop(q);
        if events
            .send(GatewayEvent::Frame {
                key: key.clone(),
                frame,
            })
            .is_err()
        {
            error!("gateway event channel closed");
            return;
        }
    }
}

