//! Per-room playback queue.
//!
//! One queue exists per (client, room) key, owning the current track,
//! the filter chain, and the running player pipeline. The arm phase
//! machine guards event emission across pipeline replacements: a
//! superseded pipeline must never fire the terminating event of the
//! track it was replaced under.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::player::{
    PLAYER_STUCK_THRESHOLD_MS, PipelineEnd, PipelineParams, PlayerHandle, run_pipeline,
};
use crate::common::{PoolKey, Shared};
use crate::pool::messages::{EventEmitter, PlayRequest};
use crate::protocol::messages::{ExceptionDetail, PlayerEvent, TrackEndReason};
use crate::protocol::tracks::Track;
use crate::protocol::{FilterChain, FilterSpec};
use crate::sources::{SourceError, SourceRegistry};
use crate::voice::VoiceConnection;

/// Where the queue stands between "no track" and "audio flowing".
///
/// `ReArming` replaces the upstream pair of latches (`applying-filters`,
/// `should-not-call-finish`): while in it, the superseded pipeline's
/// natural end is swallowed and the next pipeline to reach Playing takes
/// over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmPhase {
    Idle,
    Arming,
    Live,
    ReArming,
}

pub struct Queue {
    key: PoolKey,
    emitter: EventEmitter,
    sources: Arc<SourceRegistry>,
    pub voice: Arc<VoiceConnection>,

    current: Option<Track>,
    chain: FilterChain,
    /// Stored volume percent (0..=1000), applied to this and future tracks.
    volume: u32,
    paused: bool,
    destroyed: bool,
    phase: ArmPhase,
    player: Option<PlayerHandle>,
    end_ms: Option<u64>,

    /// Bumped whenever the running pipeline is invalidated; arming tasks
    /// from older generations go silent.
    generation: u64,
}

impl Queue {
    pub fn new(key: PoolKey, emitter: EventEmitter, sources: Arc<SourceRegistry>) -> Self {
        let voice = Arc::new(VoiceConnection::new(key.clone(), emitter.clone()));
        Self {
            key,
            emitter,
            sources,
            voice,
            current: None,
            chain: FilterChain::new(),
            volume: 100,
            paused: false,
            destroyed: false,
            phase: ArmPhase::Idle,
            player: None,
            end_ms: None,
            generation: 0,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn has_track(&self) -> bool {
        self.current.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// A track is loaded and its pipeline is armed or flowing.
    pub fn is_active(&self) -> bool {
        self.current.is_some() && self.phase != ArmPhase::Idle
    }

    /// Counted as "playing" in stats: active and not paused.
    pub fn is_playing(&self) -> bool {
        self.is_active() && !self.paused
    }

    /// The reported position: `floor((duration + seek) * rate)`.
    pub fn position_ms(&self) -> u64 {
        let duration = self.player.as_ref().map(|h| h.duration_ms()).unwrap_or(0);
        ((duration + self.chain.seek_ms()) as f64 * self.chain.rate()).floor() as u64
    }

    fn encoded_track(&self) -> Option<String> {
        self.current.as_ref().map(|t| t.track.clone())
    }

    /// Invalidate the running pipeline without emitting anything.
    fn invalidate(&mut self) {
        self.generation += 1;
        if let Some(handle) = self.player.take() {
            handle.stop();
        }
    }

    /// Invalidate the pipeline and unload the current track, returning
    /// its encoded descriptor so the caller can emit the terminating
    /// event for it.
    fn clear(&mut self) -> Option<String> {
        let encoded = self.encoded_track();
        self.invalidate();
        self.current = None;
        self.phase = ArmPhase::Idle;
        self.end_ms = None;
        self.chain.clear_seek();
        encoded
    }

    // -----------------------------------------------------------------
    // Commands (called from the worker loop)
    // -----------------------------------------------------------------

    pub async fn play(queue: &Shared<Queue>, request: PlayRequest) {
        let mut q = queue.lock().await;
        if q.destroyed {
            return;
        }

        let Some(track) = Track::decode(&request.track) else {
            warn!("[{}] undecodable track descriptor", q.key);
            q.emitter.event(PlayerEvent::TrackException {
                guild_id: q.key.room_id.clone(),
                track: Some(request.track.clone()),
                error: "Could not decode track descriptor".into(),
                exception: ExceptionDetail {
                    message: Some("Could not decode track descriptor".into()),
                    severity: crate::common::Severity::Common,
                    cause: "malformed base64 blob".into(),
                },
            });
            return;
        };

        if q.is_active() {
            if request.no_replace {
                debug!("[{}] noReplace set and a track is playing, skipping", q.key);
                return;
            }
            if let Some(encoded) = q.encoded_track() {
                q.emitter.event(PlayerEvent::TrackEnd {
                    guild_id: q.key.room_id.clone(),
                    track: encoded,
                    reason: TrackEndReason::Replaced,
                });
            }
        }
        q.invalidate();

        info!("[{}] playing {} ({})", q.key, track.info.title, track.info.source_name);

        q.chain.clear_seek();
        let start = request.start_time.unwrap_or(track.info.position);
        if start > 0 {
            q.chain.set_seek(start);
        }
        q.end_ms = request.end_time.filter(|v| *v > 0);
        if let Some(volume) = request.volume {
            q.volume = volume.clamp(0, 1000) as u32;
        }
        q.paused = request.pause;
        q.current = Some(track);

        Self::arm(queue, &mut q, true);
    }

    pub async fn stop(queue: &Shared<Queue>) {
        let mut q = queue.lock().await;
        if let Some(track) = q.clear() {
            q.emitter.event(PlayerEvent::TrackEnd {
                guild_id: q.key.room_id.clone(),
                track,
                reason: TrackEndReason::Stopped,
            });
        }
    }

    pub async fn pause(queue: &Shared<Queue>, pause: bool) {
        let mut q = queue.lock().await;
        q.paused = pause;
        if let Some(handle) = &q.player {
            handle.set_paused(pause);
        }
    }

    pub async fn seek(queue: &Shared<Queue>, position_ms: u64) {
        let mut q = queue.lock().await;
        let Some(track) = &q.current else {
            return;
        };
        let length = track.info.length;
        let target = if length > 0 {
            position_ms.min(length)
        } else {
            position_ms
        };
        q.chain.set_seek(target);
        Self::rearm(queue, &mut q);
    }

    pub async fn set_volume(queue: &Shared<Queue>, volume: i64) {
        let mut q = queue.lock().await;
        q.volume = volume.clamp(0, 1000) as u32;
        if let Some(handle) = &q.player {
            handle.set_volume(q.volume);
        }
    }

    pub async fn apply_filters(queue: &Shared<Queue>, spec: FilterSpec) {
        let mut q = queue.lock().await;
        q.chain.apply_spec(&spec);
        Self::rearm(queue, &mut q);
    }

    pub async fn apply_ffmpeg(queue: &Shared<Queue>, args: Vec<String>) {
        let mut q = queue.lock().await;
        q.chain.apply_raw(args);
        Self::rearm(queue, &mut q);
    }

    /// Tear everything down. Idempotent; the queue is unusable afterwards.
    /// A track still loaded at this point ends with CLEANUP.
    pub async fn destroy(queue: &Shared<Queue>) {
        let mut q = queue.lock().await;
        if q.destroyed {
            return;
        }
        q.destroyed = true;
        if let Some(track) = q.clear() {
            q.emitter.event(PlayerEvent::TrackEnd {
                guild_id: q.key.room_id.clone(),
                track,
                reason: TrackEndReason::Cleanup,
            });
        }
        q.voice.disconnect();
        info!("[{}] queue destroyed", q.key);
    }

    // -----------------------------------------------------------------
    // Arming
    // -----------------------------------------------------------------

    /// Restart the pipeline in place to pick up chain changes. While an
    /// arm is already in flight the chain mutation alone is enough: the
    /// argument list is read when that arm constructs it.
    fn rearm(queue: &Shared<Queue>, q: &mut Queue) {
        match q.phase {
            ArmPhase::Live => Self::arm(queue, q, false),
            ArmPhase::Arming | ArmPhase::ReArming | ArmPhase::Idle => {}
        }
    }

    fn arm(queue: &Shared<Queue>, q: &mut Queue, fresh: bool) {
        q.generation += 1;
        q.phase = if fresh {
            ArmPhase::Arming
        } else {
            ArmPhase::ReArming
        };
        let generation = q.generation;
        tokio::spawn(Self::arm_task(queue.clone(), generation, fresh));
    }

    async fn arm_task(queue: Shared<Queue>, generation: u64, fresh: bool) {
        let (track, voice, sources, emitter, old_player) = {
            let mut q = queue.lock().await;
            if q.destroyed || q.generation != generation {
                return;
            }
            let Some(track) = q.current.clone() else {
                return;
            };
            (
                track,
                q.voice.clone(),
                q.sources.clone(),
                q.emitter.clone(),
                q.player.take(),
            )
        };

        let stream = match sources.open(&track.info).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    "[{}] failed to open {}: {e}",
                    emitter.key(),
                    track.info.identifier
                );
                Self::fail_arm(&queue, generation, &emitter, &track, &e).await;
                if let Some(old) = old_player {
                    old.stop();
                }
                return;
            }
        };

        // Argv construction: the chain is read NOW, after the source
        // resolved, so filter/seek mutations made while the fetch was in
        // flight land in this pipeline. Doubles as the supersession
        // check; a later arm owns the queue if the generation moved.
        let (chain, end_ms, volume, paused) = {
            let q = queue.lock().await;
            if q.destroyed || q.generation != generation {
                drop(q);
                drop(stream);
                if let Some(old) = old_player {
                    old.stop();
                }
                return;
            }
            (q.chain.clone(), q.end_ms, q.volume, q.paused)
        };

        let handle = PlayerHandle::new(volume, paused);
        {
            let mut q = queue.lock().await;
            q.player = Some(handle.clone());
        }

        let had_seek = chain.seek_ms() > 0;
        let params = PipelineParams { chain, end_ms };
        let mut pipeline = tokio::spawn(run_pipeline(stream, params, voice, handle.clone()));

        // Wait for audio to flow, racing the pipeline's own demise.
        let threshold = tokio::time::Duration::from_millis(PLAYER_STUCK_THRESHOLD_MS);
        let outcome = tokio::select! {
            started = handle.wait_playing(threshold) => {
                if started { ArmOutcome::Playing } else { ArmOutcome::Stuck }
            }
            end = &mut pipeline => {
                ArmOutcome::Ended(end.unwrap_or(PipelineEnd::Error("player task panicked".into())))
            }
        };

        match outcome {
            ArmOutcome::Playing => {
                // The old resource's read side goes down now that the new
                // one is audible.
                if let Some(old) = old_player {
                    old.stop();
                }
                {
                    let mut q = queue.lock().await;
                    if q.destroyed || q.generation != generation {
                        handle.stop();
                        return;
                    }
                    q.phase = ArmPhase::Live;
                }
                if fresh {
                    emitter.event(PlayerEvent::TrackStart {
                        guild_id: emitter.key().room_id.clone(),
                        track: track.track.clone(),
                    });
                }
                Self::monitor_end(queue, generation, emitter, track, pipeline).await;
            }
            ArmOutcome::Stuck => {
                handle.stop();
                if let Some(old) = old_player {
                    old.stop();
                }
                let mut q = queue.lock().await;
                if q.destroyed || q.generation != generation {
                    return;
                }
                q.current = None;
                q.player = None;
                q.phase = ArmPhase::Idle;
                warn!("[{}] track stuck while arming", q.key);
                q.emitter.event(PlayerEvent::TrackStuck {
                    guild_id: q.key.room_id.clone(),
                    track: track.track.clone(),
                    threshold_ms: PLAYER_STUCK_THRESHOLD_MS,
                });
                q.emitter.event(PlayerEvent::TrackEnd {
                    guild_id: q.key.room_id.clone(),
                    track: track.track.clone(),
                    reason: TrackEndReason::Stopped,
                });
            }
            ArmOutcome::Ended(end) => {
                if let Some(old) = old_player {
                    old.stop();
                }
                let mut q = queue.lock().await;
                if q.destroyed || q.generation != generation {
                    return;
                }
                q.current = None;
                q.player = None;
                q.phase = ArmPhase::Idle;
                match end {
                    PipelineEnd::Finished => {
                        // A seek at or past the end plays straight to the
                        // finish line; anything else that ran dry before
                        // producing audio failed to load.
                        let reason = if had_seek {
                            TrackEndReason::Finished
                        } else {
                            TrackEndReason::LoadFailed
                        };
                        q.emitter.event(PlayerEvent::TrackEnd {
                            guild_id: q.key.room_id.clone(),
                            track: track.track.clone(),
                            reason,
                        });
                    }
                    PipelineEnd::Cancelled => {}
                    PipelineEnd::Error(e) => {
                        q.emitter.event(PlayerEvent::TrackException {
                            guild_id: q.key.room_id.clone(),
                            track: Some(track.track.clone()),
                            error: e.to_string(),
                            exception: ExceptionDetail {
                                message: Some(e.to_string()),
                                severity: crate::common::Severity::Fault,
                                cause: e.to_string(),
                            },
                        });
                    }
                }
            }
        }
    }

    /// Watch a live pipeline until it ends, emitting the terminating
    /// event unless this generation has been superseded.
    async fn monitor_end(
        queue: Shared<Queue>,
        generation: u64,
        emitter: EventEmitter,
        track: Track,
        pipeline: tokio::task::JoinHandle<PipelineEnd>,
    ) {
        let end = pipeline
            .await
            .unwrap_or(PipelineEnd::Error("player task panicked".into()));

        let mut q = queue.lock().await;
        if q.destroyed || q.generation != generation {
            // Superseded by a re-arm or an explicit stop; that path owns
            // the event.
            return;
        }
        q.current = None;
        q.player = None;
        q.phase = ArmPhase::Idle;
        q.end_ms = None;
        q.chain.clear_seek();
        drop(q);

        match end {
            PipelineEnd::Finished => {
                emitter.event(PlayerEvent::TrackEnd {
                    guild_id: emitter.key().room_id.clone(),
                    track: track.track.clone(),
                    reason: TrackEndReason::Finished,
                });
            }
            PipelineEnd::Cancelled => {}
            PipelineEnd::Error(e) => {
                emitter.event(PlayerEvent::TrackException {
                    guild_id: emitter.key().room_id.clone(),
                    track: Some(track.track.clone()),
                    error: e.to_string(),
                    exception: ExceptionDetail {
                        message: Some(e.to_string()),
                        severity: crate::common::Severity::Fault,
                        cause: e.to_string(),
                    },
                });
            }
        }
    }

    async fn fail_arm(
        queue: &Shared<Queue>,
        generation: u64,
        emitter: &EventEmitter,
        track: &Track,
        error: &SourceError,
    ) {
        let mut q = queue.lock().await;
        if q.destroyed || q.generation != generation {
            return;
        }
        q.current = None;
        q.player = None;
        q.phase = ArmPhase::Idle;
        drop(q);

        emitter.event(PlayerEvent::TrackException {
            guild_id: emitter.key().room_id.clone(),
            track: Some(track.track.clone()),
            error: error.to_string(),
            exception: ExceptionDetail {
                message: Some(error.to_string()),
                severity: error.severity(),
                cause: error.to_string(),
            },
        });
    }
}

enum ArmOutcome {
    Playing,
    Stuck,
    Ended(PipelineEnd),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        Config, LavalinkConfig, LavalinkServerConfig, LogLevels, LoggingConfig, ServerConfig,
        SourcesConfig, SpringConfig, SpringMainConfig,
    };
    use crate::pool::messages::GatewayEvent;
    use crate::protocol::filters::Timescale;
    use crate::protocol::messages::OutgoingMessage;
    use crate::protocol::tracks::TrackInfo;

    fn test_config(local: bool) -> Config {
        Config {
            server: ServerConfig {
                address: "127.0.0.1".into(),
                port: 2333,
            },
            lavalink: LavalinkConfig {
                server: LavalinkServerConfig {
                    password: String::new(),
                    sources: SourcesConfig {
                        youtube: false,
                        soundcloud: false,
                        local,
                        http: false,
                    },
                    youtube_search_enabled: false,
                    soundcloud_search_enabled: false,
                },
            },
            logging: LoggingConfig {
                level: LogLevels {
                    root: "INFO".into(),
                    lavalink: "INFO".into(),
                },
            },
            spring: SpringConfig {
                main: SpringMainConfig {
                    banner_mode: "off".into(),
                },
            },
        }
    }

    fn test_queue(local: bool) -> (Shared<Queue>, flume::Receiver<GatewayEvent>) {
        let (tx, rx) = flume::unbounded();
        let key = PoolKey::new(42, "100");
        let emitter = EventEmitter::new(key.clone(), tx);
        let sources = Arc::new(SourceRegistry::new(&test_config(local)));
        let queue = Arc::new(tokio::sync::Mutex::new(Queue::new(key, emitter, sources)));
        (queue, rx)
    }

    fn local_track(path: &std::path::Path) -> Track {
        Track::new(TrackInfo {
            identifier: path.display().to_string(),
            is_seekable: true,
            author: "nobody".into(),
            length: 30_000,
            is_stream: false,
            position: 0,
            title: "dry run".into(),
            uri: Some(path.display().to_string()),
            source_name: "local".into(),
        })
    }

    fn play_request(track: &Track, start_time: Option<u64>) -> PlayRequest {
        PlayRequest {
            track: track.track.clone(),
            start_time,
            end_time: None,
            volume: None,
            no_replace: false,
            pause: false,
        }
    }

    fn empty_audio_file(name: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(name);
        std::fs::write(&path, b"").expect("write temp file");
        path
    }

    async fn next_event(rx: &flume::Receiver<GatewayEvent>) -> PlayerEvent {
        let received =
            tokio::time::timeout(tokio::time::Duration::from_secs(10), rx.recv_async()).await;
        match received {
            Ok(Ok(GatewayEvent::Frame {
                frame: OutgoingMessage::Event { event },
                ..
            })) => event,
            other => panic!("expected an event frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn undecodable_descriptor_reports_exception() {
        let (queue, rx) = test_queue(false);
        Queue::play(
            &queue,
            PlayRequest {
                track: "!!not a blob!!".into(),
                start_time: None,
                end_time: None,
                volume: None,
                no_replace: false,
                pause: false,
            },
        )
        .await;

        match next_event(&rx).await {
            PlayerEvent::TrackException { guild_id, .. } => assert_eq!(guild_id, "100"),
            other => panic!("expected TrackException, got {other:?}"),
        }
        assert!(!queue.lock().await.has_track());
    }

    #[tokio::test]
    async fn disabled_source_fails_the_arm_with_an_exception() {
        let (queue, rx) = test_queue(false);
        let track = local_track(std::path::Path::new("/nonexistent.ogg"));
        Queue::play(&queue, play_request(&track, None)).await;

        match next_event(&rx).await {
            PlayerEvent::TrackException { error, .. } => assert_eq!(error, "LOCAL_NOT_ENABLED"),
            other => panic!("expected TrackException, got {other:?}"),
        }
        let q = queue.lock().await;
        assert!(!q.has_track());
        assert!(!q.is_active());
    }

    #[tokio::test]
    async fn stop_emits_stopped_once_and_clears() {
        let (queue, rx) = test_queue(false);
        {
            let mut q = queue.lock().await;
            q.current = Some(local_track(std::path::Path::new("/a.ogg")));
            q.phase = ArmPhase::Live;
        }

        Queue::stop(&queue).await;
        match next_event(&rx).await {
            PlayerEvent::TrackEnd { reason, .. } => assert_eq!(reason, TrackEndReason::Stopped),
            other => panic!("expected TrackEnd, got {other:?}"),
        }
        assert!(!queue.lock().await.has_track());

        // a stop with nothing loaded is silent
        Queue::stop(&queue).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn destroy_with_a_track_emits_cleanup() {
        let (queue, rx) = test_queue(false);
        {
            let mut q = queue.lock().await;
            q.current = Some(local_track(std::path::Path::new("/a.ogg")));
            q.phase = ArmPhase::Live;
        }

        Queue::destroy(&queue).await;
        match next_event(&rx).await {
            PlayerEvent::TrackEnd { reason, .. } => assert_eq!(reason, TrackEndReason::Cleanup),
            other => panic!("expected TrackEnd, got {other:?}"),
        }
        {
            let q = queue.lock().await;
            assert!(q.is_destroyed());
            assert!(!q.has_track());
        }

        // destroy is idempotent: no second event
        Queue::destroy(&queue).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rearm_only_fires_from_live() {
        let (queue, _rx) = test_queue(false);
        let spec = FilterSpec {
            timescale: Some(Timescale {
                speed: 2.0,
                ..Default::default()
            }),
            ..Default::default()
        };

        // While an arm is in flight, commands only mutate the chain; the
        // in-flight arm reads it when it constructs its argument list.
        {
            let mut q = queue.lock().await;
            q.phase = ArmPhase::Arming;
            q.generation = 7;
        }
        Queue::apply_filters(&queue, spec.clone()).await;
        {
            let q = queue.lock().await;
            assert_eq!(q.generation, 7);
            assert_eq!(q.phase, ArmPhase::Arming);
            assert_eq!(q.chain.rate(), 2.0);
        }

        // From Live the same command starts a re-arm.
        {
            let mut q = queue.lock().await;
            q.phase = ArmPhase::Live;
        }
        Queue::apply_filters(&queue, spec).await;
        {
            let q = queue.lock().await;
            assert_eq!(q.generation, 8);
            assert_eq!(q.phase, ArmPhase::ReArming);
        }
    }

    #[tokio::test]
    async fn superseded_monitor_stays_silent() {
        let (queue, rx) = test_queue(false);
        let track = local_track(std::path::Path::new("/a.ogg"));
        {
            let mut q = queue.lock().await;
            q.current = Some(track.clone());
            q.phase = ArmPhase::Live;
            q.generation = 3;
        }
        let emitter = queue.lock().await.emitter.clone();

        // A monitor from a superseded generation must neither emit nor
        // clear the track the replacement now owns.
        let stale = tokio::spawn(async { PipelineEnd::Finished });
        Queue::monitor_end(queue.clone(), 2, emitter.clone(), track.clone(), stale).await;
        assert!(rx.try_recv().is_err());
        assert!(queue.lock().await.has_track());

        // The current generation ends the track normally.
        let live = tokio::spawn(async { PipelineEnd::Finished });
        Queue::monitor_end(queue.clone(), 3, emitter, track, live).await;
        match next_event(&rx).await {
            PlayerEvent::TrackEnd { reason, .. } => assert_eq!(reason, TrackEndReason::Finished),
            other => panic!("expected TrackEnd, got {other:?}"),
        }
        assert!(!queue.lock().await.has_track());
    }

    #[tokio::test]
    async fn dry_arm_without_seek_reports_load_failed() {
        let (queue, rx) = test_queue(true);
        let path = empty_audio_file("volcanic-dry-plain.ogg");
        let track = local_track(&path);
        queue.lock().await.voice.force_ready();

        Queue::play(&queue, play_request(&track, None)).await;
        match next_event(&rx).await {
            PlayerEvent::TrackEnd { reason, .. } => {
                assert_eq!(reason, TrackEndReason::LoadFailed);
            }
            other => panic!("expected TrackEnd, got {other:?}"),
        }
        assert!(!queue.lock().await.has_track());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn dry_arm_with_seek_reports_finished() {
        let (queue, rx) = test_queue(true);
        let path = empty_audio_file("volcanic-dry-seek.ogg");
        let track = local_track(&path);
        queue.lock().await.voice.force_ready();

        // A start offset at or past the end runs straight to the finish
        // line instead of counting as a failed load.
        Queue::play(&queue, play_request(&track, Some(60_000))).await;
        match next_event(&rx).await {
            PlayerEvent::TrackEnd { reason, .. } => {
                assert_eq!(reason, TrackEndReason::Finished);
            }
            other => panic!("expected TrackEnd, got {other:?}"),
        }
        let _ = std::fs::remove_file(&path);
    }
}
