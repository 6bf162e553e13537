//! Video-platform resolver via the public innertube API.
//!
//! Uses the ANDROID client profile for both search and stream URL
//! resolution; adaptive audio-only formats are preferred for playback.

use serde_json::{Value, json};
use tracing::debug;
use url::Url;

use super::{ByteStream, SourceError, response_stream};
use crate::protocol::tracks::TrackInfo;

const INNERTUBE_API: &str = "https://www.youtube.com/youtubei/v1";
const CLIENT_NAME: &str = "ANDROID";
const CLIENT_VERSION: &str = "19.09.37";
/// Search params filtering to plain videos.
const SEARCH_PARAMS: &str = "EgIQAQ%3D%3D";

pub struct Youtube {
    client: reqwest::Client,
}

impl Youtube {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn context() -> Value {
        json!({
            "client": {
                "clientName": CLIENT_NAME,
                "clientVersion": CLIENT_VERSION,
                "androidSdkVersion": 30,
                "hl": "en",
            }
        })
    }

    async fn call(&self, endpoint: &str, body: Value) -> Result<Value, SourceError> {
        let response = self
            .client
            .post(format!("{INNERTUBE_API}/{endpoint}"))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SourceError::Failed(
                format!("innertube {endpoint} returned {}", response.status()).into(),
            ));
        }
        Ok(response.json::<Value>().await?)
    }

    /// Search for videos matching `query`.
    pub async fn search(&self, query: &str) -> Result<Vec<TrackInfo>, SourceError> {
        let body = json!({
            "context": Self::context(),
            "query": query,
            "params": SEARCH_PARAMS,
        });
        let response = self.call("search", body).await?;

        let mut found = Vec::new();
        collect_videos(&response, &mut found);
        debug!("youtube search '{query}' yielded {} videos", found.len());
        Ok(found)
    }

    /// Resolve a watch URL to a single track.
    pub async fn resolve(&self, url: &Url) -> Result<Option<TrackInfo>, SourceError> {
        let video_id = extract_video_id(url);
        let Some(video_id) = video_id else {
            return Ok(None);
        };

        let body = json!({
            "context": Self::context(),
            "videoId": video_id,
        });
        let response = self.call("player", body).await?;
        Ok(video_details(&response))
    }

    /// Open the best audio-only stream for a video id.
    pub async fn open(&self, video_id: &str) -> Result<ByteStream, SourceError> {
        let body = json!({
            "context": Self::context(),
            "videoId": video_id,
        });
        let response = self.call("player", body).await?;

        let formats = response["streamingData"]["adaptiveFormats"]
            .as_array()
            .ok_or_else(|| SourceError::NotFound(video_id.to_string()))?;

        let best = formats
            .iter()
            .filter(|f| {
                f["mimeType"]
                    .as_str()
                    .map(|m| m.starts_with("audio/"))
                    .unwrap_or(false)
            })
            .max_by_key(|f| f["bitrate"].as_u64().unwrap_or(0))
            .and_then(|f| f["url"].as_str())
            .ok_or_else(|| SourceError::NotFound(video_id.to_string()))?;

        let response = self.client.get(best).send().await?;
        if !response.status().is_success() {
            return Err(SourceError::Failed(
                format!("stream fetch returned {}", response.status()).into(),
            ));
        }
        Ok(response_stream(response))
    }
}

fn extract_video_id(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    if host.contains("youtu.be") {
        return url.path_segments()?.next().map(String::from);
    }
    if url.path() == "/watch" {
        return url
            .query_pairs()
            .find(|(k, _)| k == "v")
            .map(|(_, v)| v.into_owned());
    }
    // /shorts/<id>, /live/<id>, /embed/<id>
    let mut segments = url.path_segments()?;
    match segments.next() {
        Some("shorts") | Some("live") | Some("embed") => segments.next().map(String::from),
        _ => None,
    }
}

/// Pull `videoDetails` out of a player response.
fn video_details(response: &Value) -> Option<TrackInfo> {
    let details = response.get("videoDetails")?;
    let video_id = details["videoId"].as_str()?.to_string();
    let length: u64 = details["lengthSeconds"]
        .as_str()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let is_stream = details["isLiveContent"].as_bool().unwrap_or(false) && length == 0;

    Some(TrackInfo {
        uri: Some(format!("https://www.youtube.com/watch?v={video_id}")),
        identifier: video_id,
        is_seekable: !is_stream,
        author: details["author"].as_str().unwrap_or("Unknown").to_string(),
        length: length * 1000,
        is_stream,
        position: 0,
        title: details["title"].as_str().unwrap_or("Unknown").to_string(),
        source_name: "youtube".to_string(),
    })
}

/// Recursively collect `videoRenderer`-shaped entries from a search
/// response; the exact nesting varies across innertube client profiles.
fn collect_videos(value: &Value, out: &mut Vec<TrackInfo>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key == "videoRenderer" || key == "compactVideoRenderer" {
                    if let Some(info) = renderer_to_info(child) {
                        out.push(info);
                    }
                } else {
                    collect_videos(child, out);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_videos(item, out);
            }
        }
        _ => {}
    }
}

fn renderer_to_info(renderer: &Value) -> Option<TrackInfo> {
    let video_id = renderer["videoId"].as_str()?.to_string();
    let title = text_of(&renderer["title"]).unwrap_or_else(|| "Unknown".into());
    let author = text_of(&renderer["ownerText"])
        .or_else(|| text_of(&renderer["longBylineText"]))
        .or_else(|| text_of(&renderer["shortBylineText"]))
        .unwrap_or_else(|| "Unknown".into());
    let length_ms = text_of(&renderer["lengthText"])
        .map(|t| parse_length_ms(&t))
        .unwrap_or(0);

    Some(TrackInfo {
        uri: Some(format!("https://www.youtube.com/watch?v={video_id}")),
        identifier: video_id,
        is_seekable: length_ms > 0,
        author,
        length: length_ms,
        is_stream: length_ms == 0,
        position: 0,
        title,
        source_name: "youtube".to_string(),
    })
}

/// Innertube text nodes come as either `simpleText` or a `runs` array.
fn text_of(node: &Value) -> Option<String> {
    if let Some(text) = node["simpleText"].as_str() {
        return Some(text.to_string());
    }
    let runs = node["runs"].as_array()?;
    let combined: String = runs
        .iter()
        .filter_map(|r| r["text"].as_str())
        .collect();
    if combined.is_empty() { None } else { Some(combined) }
}

/// "1:02:03" → milliseconds.
fn parse_length_ms(text: &str) -> u64 {
    text.split(':')
        .filter_map(|part| part.trim().parse::<u64>().ok())
        .fold(0, |acc, part| acc * 60 + part)
        * 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clock_lengths() {
        assert_eq!(parse_length_ms("3:32"), 212_000);
        assert_eq!(parse_length_ms("1:00:00"), 3_600_000);
        assert_eq!(parse_length_ms("45"), 45_000);
    }

    #[test]
    fn extracts_video_ids() {
        let cases = [
            ("https://www.youtube.com/watch?v=dQw4w9WgXcQ", "dQw4w9WgXcQ"),
            ("https://youtu.be/dQw4w9WgXcQ", "dQw4w9WgXcQ"),
            ("https://www.youtube.com/shorts/abc123", "abc123"),
        ];
        for (url, id) in cases {
            let url = Url::parse(url).unwrap();
            assert_eq!(extract_video_id(&url).as_deref(), Some(id));
        }
    }

    #[test]
    fn collects_renderers_from_nested_response() {
        let response = json!({
            "contents": [{
                "videoRenderer": {
                    "videoId": "abc",
                    "title": {"runs": [{"text": "A "}, {"text": "Song"}]},
                    "ownerText": {"simpleText": "Someone"},
                    "lengthText": {"simpleText": "2:00"}
                }
            }]
        });
        let mut out = Vec::new();
        collect_videos(&response, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].title, "A Song");
        assert_eq!(out[0].length, 120_000);
        assert_eq!(out[0].source_name, "youtube");
    }
}
