//! Generic HTTP byte-stream source.

use reqwest::Client;

use super::{ByteStream, SourceError, response_stream};
use crate::protocol::tracks::TrackInfo;

/// Describe a URL as a track. A response without a content length is
/// treated as a live stream.
pub async fn probe(client: &Client, url: &str) -> Result<TrackInfo, SourceError> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(SourceError::NotFound(url.to_string()));
    }

    let is_stream = response.content_length().is_none();
    let title = url
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("Unknown")
        .to_string();

    Ok(TrackInfo {
        identifier: url.to_string(),
        is_seekable: !is_stream,
        author: "Unknown".to_string(),
        length: 0,
        is_stream,
        position: 0,
        title,
        uri: Some(url.to_string()),
        source_name: "http".to_string(),
    })
}

/// Open the URL as a playback stream.
pub async fn open(client: &Client, url: &str) -> Result<ByteStream, SourceError> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(SourceError::NotFound(url.to_string()));
    }
    Ok(response_stream(response))
}
