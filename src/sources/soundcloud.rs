//! Audio-sharing site resolver.
//!
//! The anonymous API key is scraped from the site's asset scripts and
//! cached in `./soundcloud.txt`; the cache is refreshed when the file is
//! older than seven days. Playback identifiers carry an `O:` prefix in
//! front of the numeric track id.

use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{ByteStream, Resolved, SourceError, response_stream};
use crate::protocol::tracks::TrackInfo;

const API_BASE: &str = "https://api-v2.soundcloud.com";
const HOMEPAGE: &str = "https://soundcloud.com";
const KEY_FILE: &str = "./soundcloud.txt";
const KEY_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Identifier prefix marking audio-share tracks.
pub const ID_PREFIX: &str = "O:";

pub struct SoundCloud {
    client: reqwest::Client,
    client_id: RwLock<Option<String>>,
    asset_re: Regex,
    client_id_re: Regex,
}

impl SoundCloud {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            client_id: RwLock::new(None),
            asset_re: Regex::new(r"https://a-v2\.sndcdn\.com/assets/[a-zA-Z0-9_-]+\.js")
                .expect("static regex"),
            client_id_re: Regex::new(r#"client_id\s*[:=]\s*"([a-zA-Z0-9_-]{20,})""#)
                .expect("static regex"),
        }
    }

    /// Resolve a track or playlist page URL to metadata.
    pub async fn resolve(&self, url: &str) -> Result<Option<Resolved>, SourceError> {
        let client_id = self.client_id().await?;
        let response = self
            .client
            .get(format!("{API_BASE}/resolve"))
            .query(&[("url", url), ("client_id", client_id.as_str())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let json: Value = response.json().await?;

        match json["kind"].as_str() {
            Some("track") => Ok(track_info(&json).map(Resolved::Track)),
            Some("playlist") => {
                let name = json["title"].as_str().unwrap_or("Unknown").to_string();
                // Long playlists carry stub entries with only an id; those
                // are skipped rather than resolved one by one.
                let tracks = json["tracks"]
                    .as_array()
                    .map(|items| items.iter().filter_map(track_info).collect())
                    .unwrap_or_default();
                Ok(Some(Resolved::Playlist { name, tracks }))
            }
            _ => Ok(None),
        }
    }

    /// Search tracks by free text.
    pub async fn search(&self, query: &str) -> Result<Vec<TrackInfo>, SourceError> {
        let client_id = self.client_id().await?;
        let response = self
            .client
            .get(format!("{API_BASE}/search/tracks"))
            .query(&[("q", query), ("client_id", client_id.as_str()), ("limit", "10")])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SourceError::Failed(
                format!("search returned {}", response.status()).into(),
            ));
        }
        let json: Value = response.json().await?;
        let tracks = json["collection"]
            .as_array()
            .map(|items| items.iter().filter_map(track_info).collect())
            .unwrap_or_default();
        Ok(tracks)
    }

    /// Open the audio stream for an `O:`-prefixed identifier. Progressive
    /// transcodings are preferred; HLS transcodings (URL suffix `/hls`)
    /// are stitched segment by segment.
    pub async fn open(&self, identifier: &str) -> Result<ByteStream, SourceError> {
        let id = identifier.strip_prefix(ID_PREFIX).unwrap_or(identifier);
        let client_id = self.client_id().await?;

        let response = self
            .client
            .get(format!("{API_BASE}/tracks/{id}"))
            .query(&[("client_id", client_id.as_str())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SourceError::NotFound(identifier.to_string()));
        }
        let json: Value = response.json().await?;

        let transcodings = json["media"]["transcodings"]
            .as_array()
            .ok_or_else(|| SourceError::NotFound(identifier.to_string()))?;
        let transcoding = transcodings
            .iter()
            .filter_map(|t| t["url"].as_str())
            .max_by_key(|url| usize::from(!url.ends_with("/hls")))
            .ok_or_else(|| SourceError::NotFound(identifier.to_string()))?;

        let media: Value = self
            .client
            .get(transcoding)
            .query(&[("client_id", client_id.as_str())])
            .send()
            .await?
            .json()
            .await?;
        let media_url = media["url"]
            .as_str()
            .ok_or_else(|| SourceError::NotFound(identifier.to_string()))?;

        if transcoding.ends_with("/hls") {
            self.open_hls(media_url).await
        } else {
            let response = self.client.get(media_url).send().await?;
            Ok(response_stream(response))
        }
    }

    /// Fetch an HLS playlist and stream its segments in order.
    async fn open_hls(&self, playlist_url: &str) -> Result<ByteStream, SourceError> {
        let playlist = self.client.get(playlist_url).send().await?.text().await?;
        let segments: Vec<String> = playlist
            .lines()
            .filter(|line| !line.starts_with('#') && !line.trim().is_empty())
            .map(String::from)
            .collect();
        if segments.is_empty() {
            return Err(SourceError::NotFound(playlist_url.to_string()));
        }

        let (mut writer, reader) = tokio::io::duplex(64 * 1024);
        let client = self.client.clone();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for segment in segments {
                let response = match client.get(&segment).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("hls segment fetch failed: {e}");
                        break;
                    }
                };
                let mut stream = response_stream(response);
                // Reader side dropped: playback stopped.
                if tokio::io::copy(&mut stream, &mut writer).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        Ok(Box::new(reader))
    }

    /// The anonymous API key: memory, then `./soundcloud.txt` (if younger
    /// than seven days), then a fresh scrape.
    async fn client_id(&self) -> Result<String, SourceError> {
        if let Some(id) = self.client_id.read().await.clone() {
            return Ok(id);
        }

        if let Some(id) = read_cached_key() {
            *self.client_id.write().await = Some(id.clone());
            return Ok(id);
        }

        let id = self
            .scrape_client_id()
            .await
            .ok_or_else(|| SourceError::Failed("could not obtain soundcloud client_id".into()))?;
        if let Err(e) = std::fs::write(KEY_FILE, &id) {
            warn!("could not persist soundcloud key: {e}");
        }
        *self.client_id.write().await = Some(id.clone());
        Ok(id)
    }

    async fn scrape_client_id(&self) -> Option<String> {
        debug!("refreshing soundcloud client_id");
        let html = self.client.get(HOMEPAGE).send().await.ok()?.text().await.ok()?;

        if let Some(found) = self.extract_client_id(&html) {
            info!("soundcloud client_id refreshed from homepage");
            return Some(found);
        }

        let assets: Vec<String> = self
            .asset_re
            .find_iter(&html)
            .map(|m| m.as_str().to_string())
            .collect();

        // The relevant script is usually one of the last few.
        for url in assets.iter().rev().take(8) {
            let js = match self.client.get(url).send().await {
                Ok(r) => r.text().await.unwrap_or_default(),
                Err(_) => continue,
            };
            if let Some(found) = self.extract_client_id(&js) {
                info!("soundcloud client_id refreshed from asset script");
                return Some(found);
            }
        }

        warn!("soundcloud client_id not found in any asset script");
        None
    }

    fn extract_client_id(&self, text: &str) -> Option<String> {
        self.client_id_re
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }
}

fn read_cached_key() -> Option<String> {
    let meta = std::fs::metadata(KEY_FILE).ok()?;
    let age = meta.modified().ok()?.elapsed().unwrap_or(Duration::MAX);
    if age > KEY_MAX_AGE {
        debug!("cached soundcloud key is stale");
        return None;
    }
    let key = std::fs::read_to_string(KEY_FILE).ok()?;
    let key = key.trim().to_string();
    if key.is_empty() { None } else { Some(key) }
}

fn track_info(json: &Value) -> Option<TrackInfo> {
    let id = json["id"].as_u64()?;
    let length = json["duration"].as_u64().unwrap_or(0);
    Some(TrackInfo {
        identifier: format!("{ID_PREFIX}{id}"),
        is_seekable: true,
        author: json["user"]["username"]
            .as_str()
            .unwrap_or("Unknown")
            .to_string(),
        length,
        is_stream: false,
        position: 0,
        title: json["title"].as_str().unwrap_or("Unknown").to_string(),
        uri: json["permalink_url"].as_str().map(String::from),
        source_name: "soundcloud".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_track() -> Value {
        serde_json::json!({
            "id": 123456,
            "duration": 245000,
            "title": "Some Mix",
            "permalink_url": "https://soundcloud.com/someone/some-mix",
            "user": {"username": "someone"}
        })
    }

    #[test]
    fn track_info_carries_prefixed_identifier() {
        let info = track_info(&sample_track()).unwrap();
        assert_eq!(info.identifier, "O:123456");
        assert_eq!(info.length, 245_000);
        assert_eq!(info.source_name, "soundcloud");
    }

    #[test]
    fn client_id_extraction() {
        let sc = SoundCloud::new(reqwest::Client::new());
        let js = r#"var x={client_id:"AbCdEfGhIjKlMnOpQrStUvWxYz012345"};"#;
        assert_eq!(
            sc.extract_client_id(js).as_deref(),
            Some("AbCdEfGhIjKlMnOpQrStUvWxYz012345")
        );
        assert!(sc.extract_client_id("nothing here").is_none());
    }

    #[test]
    fn ignored_timestamp_missing_id() {
        assert!(track_info(&serde_json::json!({"title": "x"})).is_none());
    }
}
