//! The player: a pull pipeline over a single audio resource.
//!
//! Source bytes are probed once; OGG and WebM streams can feed the voice
//! link directly, everything else goes through ffmpeg. Frames leave at
//! the 20 ms Opus cadence, and the frame counter is the sole authority
//! for playback duration. Backpressure is end-to-end: the pacing loop
//! pulls from bounded channels, so a stalled network stops the demuxer,
//! which stops ffmpeg, which stops the source read.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::ogg::is_opus_meta;
use crate::codec::{ContainerKind, OggPacketParser, Transcoder, VolumeTransform, detect_container, webm};
use crate::common::AnyResult;
use crate::protocol::FilterChain;
use crate::sources::ByteStream;
use crate::voice::VoiceConnection;
use crate::voice::udp::SILENCE_FRAME;

/// The player must reach Playing within this window, else the queue
/// reports `TrackStuckEvent`.
pub const PLAYER_STUCK_THRESHOLD_MS: u64 = 10_000;

/// Milliseconds of audio per Opus frame.
pub const FRAME_MS: u64 = 20;

/// Silence frames flushed when pausing, per the platform convention.
const PAUSE_SILENCE_FRAMES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlaybackState {
    Buffering = 0,
    Playing = 1,
    Paused = 2,
    Stopped = 3,
}

impl PlaybackState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Playing,
            2 => Self::Paused,
            3 => Self::Stopped,
            _ => Self::Buffering,
        }
    }
}

/// Control surface of a running pipeline, shared with the queue.
#[derive(Clone)]
pub struct PlayerHandle {
    state: Arc<AtomicU8>,
    frames_sent: Arc<AtomicU64>,
    paused: Arc<AtomicBool>,
    /// Volume percent, 0..=1000. 100 is unity gain.
    volume: Arc<AtomicU32>,
    cancel: CancellationToken,
    state_changed: Arc<Notify>,
}

impl PlayerHandle {
    pub fn new(volume: u32, paused: bool) -> Self {
        Self {
            state: Arc::new(AtomicU8::new(PlaybackState::Buffering as u8)),
            frames_sent: Arc::new(AtomicU64::new(0)),
            paused: Arc::new(AtomicBool::new(paused)),
            volume: Arc::new(AtomicU32::new(volume)),
            cancel: CancellationToken::new(),
            state_changed: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PlaybackState) {
        self.state.store(state as u8, Ordering::Release);
        self.state_changed.notify_waiters();
    }

    /// Audio actually delivered, in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed) * FRAME_MS
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
        let state = self.state();
        if paused && state == PlaybackState::Playing {
            self.set_state(PlaybackState::Paused);
        } else if !paused && state == PlaybackState::Paused {
            self.set_state(PlaybackState::Playing);
        }
    }

    pub fn set_volume(&self, percent: u32) {
        self.volume.store(percent.min(1000), Ordering::Release);
    }

    /// Tear the pipeline down.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.set_state(PlaybackState::Stopped);
    }

    /// Wait until the player reaches Playing. `false` on timeout or if it
    /// stops first.
    pub async fn wait_playing(&self, timeout: tokio::time::Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                match self.state() {
                    PlaybackState::Playing | PlaybackState::Paused => return true,
                    PlaybackState::Stopped => return false,
                    PlaybackState::Buffering => self.state_changed.notified().await,
                }
            }
        })
        .await
        .unwrap_or(false)
    }
}

/// Everything the pipeline needs beyond the byte stream itself.
pub struct PipelineParams {
    pub chain: FilterChain,
    pub end_ms: Option<u64>,
}

/// Why the pipeline ended.
#[derive(Debug)]
pub enum PipelineEnd {
    /// The stream ran out naturally (or hit the configured end mark).
    Finished,
    /// Torn down via the handle.
    Cancelled,
    Error(crate::common::AnyError),
}

/// Drive a source stream into the voice connection until it ends or the
/// handle is cancelled.
pub async fn run_pipeline(
    mut source: ByteStream,
    params: PipelineParams,
    voice: Arc<VoiceConnection>,
    handle: PlayerHandle,
) -> PipelineEnd {
    // Give the voice link a moment to come up; frames sent before Ready
    // are dropped, which would eat into the track's start.
    voice
        .wait_ready(tokio::time::Duration::from_millis(PLAYER_STUCK_THRESHOLD_MS / 2))
        .await;

    // Peek the container magic.
    let mut header = [0u8; 12];
    let mut peeked = 0;
    while peeked < header.len() {
        match source.read(&mut header[peeked..]).await {
            Ok(0) => break,
            Ok(n) => peeked += n,
            Err(e) => return PipelineEnd::Error(Box::new(e)),
        }
    }
    if peeked == 0 {
        return PipelineEnd::Finished;
    }

    let kind = if params.chain.is_passthrough() {
        detect_container(&header[..peeked])
    } else {
        // A filter chain or seek always forces the transcode path.
        ContainerKind::Unknown
    };

    let packets = match kind {
        ContainerKind::Ogg => spawn_ogg_reader(source, header[..peeked].to_vec(), handle.clone()),
        ContainerKind::Webm => spawn_webm_reader(source, header[..peeked].to_vec(), handle.clone()),
        ContainerKind::Unknown => {
            match spawn_transcoder(source, header[..peeked].to_vec(), &params.chain, handle.clone())
            {
                Ok(rx) => rx,
                Err(e) => return PipelineEnd::Error(e),
            }
        }
    };

    send_loop(packets, params, voice, handle).await
}

/// Direct OGG demux: source bytes → page parser → raw Opus packets.
fn spawn_ogg_reader(
    mut source: ByteStream,
    preamble: Vec<u8>,
    handle: PlayerHandle,
) -> flume::Receiver<Vec<u8>> {
    let (tx, rx) = flume::bounded::<Vec<u8>>(64);
    let cancel = handle.cancel.clone();

    tokio::spawn(async move {
        let mut parser = OggPacketParser::new();
        parser.push(&preamble);
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            while let Some(packet) = parser.next_packet() {
                if is_opus_meta(&packet) {
                    continue;
                }
                if tx.send_async(packet).await.is_err() {
                    return;
                }
            }
            let read = tokio::select! {
                _ = cancel.cancelled() => return,
                read = source.read(&mut buf) => read,
            };
            match read {
                Ok(0) => return,
                Ok(n) => parser.push(&buf[..n]),
                Err(e) => {
                    debug!("ogg source read failed: {e}");
                    return;
                }
            }
        }
    });

    rx
}

/// WebM demux on a blocking thread, fed from the async source.
fn spawn_webm_reader(
    mut source: ByteStream,
    preamble: Vec<u8>,
    handle: PlayerHandle,
) -> flume::Receiver<Vec<u8>> {
    let (bytes_tx, packets) = webm::spawn_demux();
    let cancel = handle.cancel.clone();

    tokio::spawn(async move {
        if bytes_tx.send_async(preamble).await.is_err() {
            return;
        }
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return,
                read = source.read(&mut buf) => read,
            };
            match read {
                Ok(0) => return,
                Ok(n) => {
                    if bytes_tx.send_async(buf[..n].to_vec()).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!("webm source read failed: {e}");
                    return;
                }
            }
        }
    });

    packets
}

/// ffmpeg transcode: source → stdin, stdout → page parser → packets.
fn spawn_transcoder(
    mut source: ByteStream,
    preamble: Vec<u8>,
    chain: &FilterChain,
    handle: PlayerHandle,
) -> AnyResult<flume::Receiver<Vec<u8>>> {
    let mut transcoder = Transcoder::spawn(chain)?;
    let mut stdin = transcoder.stdin().ok_or("ffmpeg stdin unavailable")?;
    let stdout = transcoder.stdout().ok_or("ffmpeg stdout unavailable")?;

    let cancel = handle.cancel.clone();
    tokio::spawn(async move {
        // ffmpeg owns the lifetime; keep the child alive with this task.
        let _transcoder = transcoder;
        if stdin.write_all(&preamble).await.is_err() {
            return;
        }
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = source.read(&mut buf) => read,
            };
            match read {
                Ok(0) => break,
                Ok(n) => {
                    if stdin.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("transcode source read failed: {e}");
                    break;
                }
            }
        }
        let _ = stdin.shutdown().await;
        cancel.cancelled().await;
    });

    Ok(spawn_ogg_reader(Box::new(stdout), Vec::new(), handle))
}

async fn send_loop(
    packets: flume::Receiver<Vec<u8>>,
    params: PipelineParams,
    voice: Arc<VoiceConnection>,
    handle: PlayerHandle,
) -> PipelineEnd {
    let seek_ms = params.chain.seek_ms();
    let rate = params.chain.rate();

    let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(FRAME_MS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut transform: Option<VolumeTransform> = None;
    let mut was_paused = false;
    let mut started = false;

    loop {
        if handle.cancel.is_cancelled() {
            return PipelineEnd::Cancelled;
        }

        if handle.paused.load(Ordering::Acquire) {
            // Armed but held: counts as started so the queue goes Live
            // instead of reporting a stuck track.
            if !started {
                started = true;
                handle.set_state(PlaybackState::Paused);
            }
            if !was_paused {
                was_paused = true;
                for _ in 0..PAUSE_SILENCE_FRAMES {
                    interval.tick().await;
                    voice.send_opus(&SILENCE_FRAME).await;
                }
            }
            tokio::select! {
                _ = handle.cancel.cancelled() => return PipelineEnd::Cancelled,
                _ = tokio::time::sleep(tokio::time::Duration::from_millis(100)) => continue,
            }
        }
        was_paused = false;

        let packet = tokio::select! {
            _ = handle.cancel.cancelled() => return PipelineEnd::Cancelled,
            packet = packets.recv_async() => match packet {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        interval.tick().await;

        let volume = handle.volume.load(Ordering::Acquire);
        let frame = if volume == 100 {
            packet
        } else {
            let factor = volume as f32 / 100.0;
            if transform.is_none() {
                match VolumeTransform::new() {
                    Ok(t) => transform = Some(t),
                    Err(e) => return PipelineEnd::Error(e),
                }
            }
            match transform.as_mut().map(|t| t.process(&packet, factor)) {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!("volume transform failed, passing frame through: {e}");
                    packet
                }
                None => packet,
            }
        };

        if !voice.send_opus(&frame).await {
            trace!("voice link not ready, frame dropped");
        }
        handle.frames_sent.fetch_add(1, Ordering::Relaxed);

        if !started {
            started = true;
            if handle.paused.load(Ordering::Acquire) {
                handle.set_state(PlaybackState::Paused);
            } else {
                handle.set_state(PlaybackState::Playing);
            }
        }

        if let Some(end) = params.end_ms {
            let position = ((handle.duration_ms() + seek_ms) as f64 * rate).floor() as u64;
            if position >= end {
                debug!("end mark {end}ms reached");
                break;
            }
        }
    }

    // Natural end: release the feeder tasks and the ffmpeg child too.
    handle.stop();
    PipelineEnd::Finished
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_counts_frames() {
        let handle = PlayerHandle::new(100, false);
        handle.frames_sent.store(250, Ordering::Relaxed);
        assert_eq!(handle.duration_ms(), 5000);
    }

    #[test]
    fn pause_toggles_state_only_when_playing() {
        let handle = PlayerHandle::new(100, false);
        handle.set_paused(true);
        // still buffering: pause is latched but state unchanged
        assert_eq!(handle.state(), PlaybackState::Buffering);

        handle.set_state(PlaybackState::Playing);
        handle.set_paused(true);
        assert_eq!(handle.state(), PlaybackState::Paused);
        handle.set_paused(false);
        assert_eq!(handle.state(), PlaybackState::Playing);
    }

    #[tokio::test]
    async fn wait_playing_times_out() {
        let handle = PlayerHandle::new(100, false);
        let started = handle
            .wait_playing(tokio::time::Duration::from_millis(20))
            .await;
        assert!(!started);
    }

    #[tokio::test]
    async fn wait_playing_sees_transition() {
        let handle = PlayerHandle::new(100, false);
        let waiter = handle.clone();
        let task = tokio::spawn(async move {
            waiter
                .wait_playing(tokio::time::Duration::from_secs(1))
                .await
        });
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        handle.set_state(PlaybackState::Playing);
        assert!(task.await.unwrap());
    }

    #[tokio::test]
    async fn wait_playing_false_after_stop() {
        let handle = PlayerHandle::new(100, false);
        let waiter = handle.clone();
        let task = tokio::spawn(async move {
            waiter
                .wait_playing(tokio::time::Duration::from_secs(1))
                .await
        });
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        handle.stop();
        assert!(!task.await.unwrap());
    }
}
