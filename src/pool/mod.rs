//! The worker pool dispatcher.
//!
//! N workers (N = CPU count) own disjoint sets of queues. The dispatcher
//! never keeps a key routing table: PLAY polls every worker for
//! ownership and falls back to least-loaded placement, keyed commands
//! are broadcast and ignored by non-owners, and replies are correlated
//! with oneshot channels.

pub mod messages;
pub mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub use messages::{Command, EventEmitter, GatewayEvent, PlayRequest, WorkerStats};

use crate::common::{ClientId, PoolKey};
use crate::sources::SourceRegistry;
use worker::WorkerSeed;

struct WorkerHandle {
    index: usize,
    tx: flume::Sender<Command>,
    queue_count: Arc<AtomicUsize>,
    thread: std::thread::JoinHandle<()>,
}

pub struct ThreadPool {
    workers: Mutex<Vec<WorkerHandle>>,
    events: flume::Sender<GatewayEvent>,
    sources: Arc<SourceRegistry>,
}

impl ThreadPool {
    /// Build the pool and start its reaper. Must be called on a tokio
    /// runtime.
    pub fn new(
        size: usize,
        events: flume::Sender<GatewayEvent>,
        sources: Arc<SourceRegistry>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            workers: Mutex::new(Vec::with_capacity(size)),
            events,
            sources,
        });

        {
            let mut workers = pool.workers.lock();
            for index in 0..size {
                workers.push(pool.start_worker(index));
            }
        }
        info!("thread pool up with {size} worker(s)");

        // Reaper: a worker whose thread died is replaced; its queues are
        // gone, clients re-play into a fresh worker.
        let weak = Arc::downgrade(&pool);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(5));
            loop {
                interval.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                pool.reap_dead_workers();
            }
        });

        pool
    }

    fn start_worker(&self, index: usize) -> WorkerHandle {
        let (tx, rx) = flume::unbounded();
        let queue_count = Arc::new(AtomicUsize::new(0));
        let thread = worker::spawn(WorkerSeed {
            index,
            rx,
            events: self.events.clone(),
            sources: self.sources.clone(),
            queue_count: queue_count.clone(),
        });
        WorkerHandle {
            index,
            tx,
            queue_count,
            thread,
        }
    }

    fn reap_dead_workers(&self) {
        let mut workers = self.workers.lock();
        for slot in workers.iter_mut() {
            if slot.thread.is_finished() {
                warn!("worker {} died, respawning", slot.index);
                *slot = self.start_worker(slot.index);
            }
        }
    }

    /// Route a play request: poll all workers for ownership of the key;
    /// when nobody owns it, place it on the least-loaded worker (ties go
    /// to the lowest index).
    pub async fn play(&self, key: PoolKey, request: PlayRequest) {
        let polls: Vec<oneshot::Receiver<bool>> = {
            let workers = self.workers.lock();
            workers
                .iter()
                .map(|w| {
                    let (reply, rx) = oneshot::channel();
                    let _ = w.tx.send(Command::Play {
                        key: key.clone(),
                        request: request.clone(),
                        broadcast: true,
                        reply: Some(reply),
                    });
                    rx
                })
                .collect()
        };

        let mut owned = false;
        for rx in polls {
            if matches!(rx.await, Ok(true)) {
                owned = true;
            }
        }
        if owned {
            return;
        }

        let target = {
            let workers = self.workers.lock();
            workers
                .iter()
                .min_by_key(|w| (w.queue_count.load(Ordering::Acquire), w.index))
                .map(|w| w.tx.clone())
        };
        match target {
            Some(tx) => {
                debug!("placing {key} on least-loaded worker");
                let _ = tx.send(Command::Play {
                    key,
                    request,
                    broadcast: false,
                    reply: None,
                });
            }
            None => warn!("no workers available for {key}"),
        }
    }

    /// Broadcast a keyed command; only the owning worker acts on it.
    pub fn send(&self, build: impl Fn() -> Command) {
        let workers = self.workers.lock();
        for w in workers.iter() {
            let _ = w.tx.send(build());
        }
    }

    /// Aggregate player counts across all workers.
    pub async fn stats(&self) -> WorkerStats {
        let polls: Vec<oneshot::Receiver<WorkerStats>> = {
            let workers = self.workers.lock();
            workers
                .iter()
                .map(|w| {
                    let (reply, rx) = oneshot::channel();
                    let _ = w.tx.send(Command::Stats { reply });
                    rx
                })
                .collect()
        };

        let mut total = WorkerStats::default();
        for rx in polls {
            if let Ok(stats) = rx.await {
                total.players += stats.players;
                total.playing_players += stats.playing_players;
            }
        }
        total
    }

    /// Destroy every queue owned by a client. Returns the count destroyed.
    pub async fn delete_all(&self, client_id: ClientId) -> usize {
        let polls: Vec<oneshot::Receiver<usize>> = {
            let workers = self.workers.lock();
            workers
                .iter()
                .map(|w| {
                    let (reply, rx) = oneshot::channel();
                    let _ = w.tx.send(Command::DeleteAll { client_id, reply });
                    rx
                })
                .collect()
        };

        let mut destroyed = 0;
        for rx in polls {
            destroyed += rx.await.unwrap_or(0);
        }
        destroyed
    }

    /// Terminate and restart every worker. All queues die with them.
    pub fn dump(&self) {
        warn!("dump requested, restarting all workers");
        let mut workers = self.workers.lock();
        for slot in workers.iter_mut() {
            let _ = slot.tx.send(Command::Shutdown);
            *slot = self.start_worker(slot.index);
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_pool(size: usize) -> (Arc<ThreadPool>, flume::Receiver<GatewayEvent>) {
        let (events_tx, events_rx) = flume::unbounded();
        let config = Config::load().expect("built-in defaults always parse");
        let sources = Arc::new(SourceRegistry::new(&config));
        (ThreadPool::new(size, events_tx, sources), events_rx)
    }

    #[tokio::test]
    async fn stats_aggregate_across_workers() {
        let (pool, _events) = test_pool(2);
        let stats = pool.stats().await;
        assert_eq!(stats.players, 0);
        assert_eq!(stats.playing_players, 0);
    }

    #[tokio::test]
    async fn delete_all_on_empty_pool_is_zero() {
        let (pool, _events) = test_pool(2);
        assert_eq!(pool.delete_all(42).await, 0);
    }

    #[tokio::test]
    async fn dump_replaces_workers() {
        let (pool, _events) = test_pool(2);
        pool.dump();
        assert_eq!(pool.worker_count(), 2);
        // the restarted workers still answer
        let stats = pool.stats().await;
        assert_eq!(stats.players, 0);
    }
}
