//! WebM / Matroska → raw Opus packet passthrough.
//!
//! symphonia's Matroska reader is synchronous, so the demux runs on a
//! blocking thread fed by a channel-backed `Read` adapter. The async
//! player pushes source bytes in and receives raw Opus packets out,
//! ready for the voice link without re-encoding.

use std::io::{Read, Seek, SeekFrom};

use symphonia::core::codecs::CODEC_TYPE_OPUS;
use symphonia::core::errors::Error;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

/// A blocking `Read` over a byte channel. EOF when the sender drops.
struct ChannelSource {
    rx: flume::Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl Read for ChannelSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.pos >= self.chunk.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = (self.chunk.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Seek for ChannelSource {
    fn seek(&mut self, _pos: SeekFrom) -> std::io::Result<u64> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "channel source is not seekable",
        ))
    }
}

impl MediaSource for ChannelSource {
    fn is_seekable(&self) -> bool {
        false
    }
    fn byte_len(&self) -> Option<u64> {
        None
    }
}

/// Spawn the demux thread. Bytes go in through the returned sender;
/// Opus packets come out of the returned receiver, which closes on
/// end-of-stream or on a demux error.
pub fn spawn_demux() -> (flume::Sender<Vec<u8>>, flume::Receiver<Vec<u8>>) {
    let (bytes_tx, bytes_rx) = flume::bounded::<Vec<u8>>(16);
    let (packet_tx, packet_rx) = flume::bounded::<Vec<u8>>(64);

    std::thread::spawn(move || {
        let source = ChannelSource {
            rx: bytes_rx,
            chunk: Vec::new(),
            pos: 0,
        };
        if let Err(e) = demux_loop(Box::new(source), packet_tx) {
            warn!("webm demux ended with error: {e}");
        }
    });

    (bytes_tx, packet_rx)
}

fn demux_loop(
    source: Box<dyn MediaSource>,
    packet_tx: flume::Sender<Vec<u8>>,
) -> Result<(), Error> {
    let mss = MediaSourceStream::new(source, Default::default());
    let mut hint = Hint::new();
    hint.with_extension("webm");

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;

    let mut format = probed.format;
    let track_id = match format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec == CODEC_TYPE_OPUS)
    {
        Some(t) => t.id,
        None => {
            debug!("webm stream has no opus track");
            return Ok(());
        }
    };

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(Error::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if packet.track_id() != track_id {
            continue;
        }

        // Receiver dropped: the player was stopped.
        if packet_tx.send(packet.data.to_vec()).is_err() {
            return Ok(());
        }
    }
}
