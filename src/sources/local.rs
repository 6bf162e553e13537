//! Local filesystem source.

use std::path::Path;

use symphonia::core::codecs::CODEC_TYPE_NULL;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, StandardTagKey};
use symphonia::core::probe::Hint;

use super::{ByteStream, SourceError};
use crate::common::AnyResult;
use crate::protocol::tracks::TrackInfo;

/// Probe a file for duration and tags, producing track metadata.
pub async fn probe(path: &str) -> Result<TrackInfo, SourceError> {
    let path = path.strip_prefix("file://").unwrap_or(path).to_string();
    let result = tokio::task::spawn_blocking(move || probe_blocking(&path)).await;
    match result {
        Ok(Ok(info)) => Ok(info),
        Ok(Err(e)) => Err(SourceError::Failed(e)),
        Err(e) => Err(SourceError::Failed(Box::new(e))),
    }
}

fn probe_blocking(path: &str) -> AnyResult<TrackInfo> {
    let file = std::fs::File::open(path)?;

    let mut hint = Hint::new();
    if let Some(ext) = Path::new(path).extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;

    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or("no audio track found")?;

    let length = match (track.codec_params.n_frames, track.codec_params.sample_rate) {
        (Some(frames), Some(rate)) => (frames as f64 / rate as f64 * 1000.0) as u64,
        _ => 0,
    };

    let mut title = String::new();
    let mut author = String::new();
    if let Some(meta) = format.metadata().current() {
        for tag in meta.tags() {
            match tag.std_key {
                Some(StandardTagKey::TrackTitle) => title = tag.value.to_string(),
                Some(StandardTagKey::Artist) | Some(StandardTagKey::AlbumArtist) => {
                    if author.is_empty() {
                        author = tag.value.to_string();
                    }
                }
                _ => {}
            }
        }
    }

    if title.is_empty() {
        title = Path::new(path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("Unknown")
            .to_string();
    }
    if author.is_empty() {
        author = "Unknown Artist".to_string();
    }

    Ok(TrackInfo {
        identifier: path.to_string(),
        is_seekable: true,
        author,
        length,
        is_stream: false,
        position: 0,
        title,
        uri: Some(path.to_string()),
        source_name: "local".to_string(),
    })
}

/// Open a file for playback.
pub async fn open(path: &str) -> Result<ByteStream, SourceError> {
    let path = path.strip_prefix("file://").unwrap_or(path);
    match tokio::fs::File::open(path).await {
        Ok(file) => Ok(Box::new(file)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(SourceError::NotFound(path.to_string()))
        }
        Err(e) => Err(SourceError::Failed(Box::new(e))),
    }
}
