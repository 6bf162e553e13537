//! Track sources: resolution for `/loadtracks` and byte streams for
//! playback, gated by the `lavalink.server.sources` configuration.

pub mod http;
pub mod local;
pub mod soundcloud;
pub mod youtube;

use std::fmt;

use serde::Serialize;
use tracing::warn;
use url::Url;

use crate::common::{AnyError, Severity};
use crate::config::Config;
use crate::protocol::tracks::{Track, TrackInfo};

/// A readable audio byte stream handed to the playback pipeline.
pub type ByteStream = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

pub const YTSEARCH_PREFIX: &str = "ytsearch:";
pub const SCSEARCH_PREFIX: &str = "scsearch:";

/// Why a source could not produce a track or a stream.
#[derive(Debug)]
pub enum SourceError {
    /// The source is switched off in configuration; carries the fixed
    /// error code surfaced to clients.
    Disabled(&'static str),
    /// The resolver came back empty.
    NotFound(String),
    /// Network, protocol, or file failure.
    Failed(AnyError),
}

impl SourceError {
    pub fn severity(&self) -> Severity {
        match self {
            SourceError::Disabled(_) | SourceError::NotFound(_) => Severity::Common,
            SourceError::Failed(_) => Severity::Suspicious,
        }
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Disabled(code) => write!(f, "{code}"),
            SourceError::NotFound(what) => write!(f, "nothing found for {what}"),
            SourceError::Failed(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SourceError {}

impl From<AnyError> for SourceError {
    fn from(e: AnyError) -> Self {
        SourceError::Failed(e)
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        SourceError::Failed(Box::new(e))
    }
}

/// `/loadtracks` response body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResponse {
    pub load_type: LoadType,
    pub playlist_info: PlaylistInfo,
    pub tracks: Vec<Track>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<LoadException>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadType {
    TrackLoaded,
    PlaylistLoaded,
    SearchResult,
    NoMatches,
    LoadFailed,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_track: Option<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadException {
    pub message: String,
    pub severity: Severity,
}

/// What a URL resolver came back with.
pub enum Resolved {
    Track(TrackInfo),
    Playlist { name: String, tracks: Vec<TrackInfo> },
}

impl LoadResponse {
    fn track(info: TrackInfo) -> Self {
        Self {
            load_type: LoadType::TrackLoaded,
            playlist_info: PlaylistInfo::default(),
            tracks: vec![Track::new(info)],
            exception: None,
        }
    }

    fn playlist(name: String, tracks: Vec<TrackInfo>) -> Self {
        if tracks.is_empty() {
            return Self::no_matches();
        }
        Self {
            load_type: LoadType::PlaylistLoaded,
            playlist_info: PlaylistInfo {
                name: Some(name),
                selected_track: Some(-1),
            },
            tracks: tracks.into_iter().map(Track::new).collect(),
            exception: None,
        }
    }

    fn resolved(resolved: Option<Resolved>) -> Self {
        match resolved {
            Some(Resolved::Track(info)) => Self::track(info),
            Some(Resolved::Playlist { name, tracks }) => Self::playlist(name, tracks),
            None => Self::no_matches(),
        }
    }

    fn search(infos: Vec<TrackInfo>) -> Self {
        if infos.is_empty() {
            return Self::no_matches();
        }
        Self {
            load_type: LoadType::SearchResult,
            playlist_info: PlaylistInfo::default(),
            tracks: infos.into_iter().map(Track::new).collect(),
            exception: None,
        }
    }

    fn no_matches() -> Self {
        Self {
            load_type: LoadType::NoMatches,
            playlist_info: PlaylistInfo::default(),
            tracks: Vec::new(),
            exception: None,
        }
    }

    fn failed(error: &SourceError) -> Self {
        Self {
            load_type: LoadType::LoadFailed,
            playlist_info: PlaylistInfo::default(),
            tracks: Vec::new(),
            exception: Some(LoadException {
                message: error.to_string(),
                severity: error.severity(),
            }),
        }
    }
}

/// Routes identifiers to the right resolver and playback requests to the
/// right stream opener.
pub struct SourceRegistry {
    youtube_enabled: bool,
    soundcloud_enabled: bool,
    local_enabled: bool,
    http_enabled: bool,
    youtube_search: bool,
    soundcloud_search: bool,
    client: reqwest::Client,
    youtube: youtube::Youtube,
    soundcloud: soundcloud::SoundCloud,
}

impl SourceRegistry {
    pub fn new(config: &Config) -> Self {
        let server = &config.lavalink.server;
        let client = reqwest::Client::builder()
            .user_agent(concat!("volcanic/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            youtube_enabled: server.sources.youtube,
            soundcloud_enabled: server.sources.soundcloud,
            local_enabled: server.sources.local,
            http_enabled: server.sources.http,
            youtube_search: server.youtube_search_enabled,
            soundcloud_search: server.soundcloud_search_enabled,
            client: client.clone(),
            youtube: youtube::Youtube::new(client.clone()),
            soundcloud: soundcloud::SoundCloud::new(client),
        }
    }

    /// Resolve an identifier for `/loadtracks`.
    pub async fn load(&self, identifier: &str) -> LoadResponse {
        match self.resolve(identifier).await {
            Ok(response) => response,
            Err(e) => {
                warn!("load of '{identifier}' failed: {e}");
                match e {
                    SourceError::NotFound(_) => LoadResponse::no_matches(),
                    other => LoadResponse::failed(&other),
                }
            }
        }
    }

    async fn resolve(&self, identifier: &str) -> Result<LoadResponse, SourceError> {
        if let Some(query) = identifier.strip_prefix(YTSEARCH_PREFIX) {
            return self.search(query, true).await;
        }
        if let Some(query) = identifier.strip_prefix(SCSEARCH_PREFIX) {
            return self.search_soundcloud(query).await;
        }

        if identifier.starts_with('/') {
            if !self.local_enabled {
                return Err(SourceError::Disabled("LOCAL_NOT_ENABLED"));
            }
            let info = local::probe(identifier).await?;
            return Ok(LoadResponse::track(info));
        }

        if let Ok(url) = Url::parse(identifier) {
            if url.has_host() {
                let host = url.host_str().unwrap_or_default();
                if host.contains("soundcloud") {
                    if !self.soundcloud_enabled {
                        return Err(SourceError::Disabled("SOUNDCLOUD_NOT_ENABLED"));
                    }
                    let resolved = self.soundcloud.resolve(identifier).await?;
                    return Ok(LoadResponse::resolved(resolved));
                }
                if host.contains("youtube") || host.contains("youtu.be") {
                    if !self.youtube_enabled {
                        return Err(SourceError::Disabled("YOUTUBE_NOT_ENABLED"));
                    }
                    return match self.youtube.resolve(&url).await? {
                        Some(info) => Ok(LoadResponse::track(info)),
                        None => Ok(LoadResponse::no_matches()),
                    };
                }
                if !self.http_enabled {
                    return Err(SourceError::Disabled("HTTP_NOT_ENABLED"));
                }
                let info = http::probe(&self.client, identifier).await?;
                return Ok(LoadResponse::track(info));
            }
        }

        // Bare text: treat as a search query.
        self.search(identifier, false).await
    }

    /// Search on the video platform, falling back to soundcloud when the
    /// video source (or its search) is unavailable.
    async fn search(&self, query: &str, explicit: bool) -> Result<LoadResponse, SourceError> {
        if self.youtube_enabled && self.youtube_search {
            let infos = self.youtube.search(query).await?;
            return Ok(LoadResponse::search(infos));
        }
        if self.soundcloud_enabled && self.soundcloud_search {
            return self.search_soundcloud(query).await;
        }
        if explicit {
            return Err(SourceError::Disabled("YOUTUBE_NOT_ENABLED"));
        }
        Err(SourceError::NotFound(query.to_string()))
    }

    async fn search_soundcloud(&self, query: &str) -> Result<LoadResponse, SourceError> {
        if !self.soundcloud_enabled {
            return Err(SourceError::Disabled("SOUNDCLOUD_NOT_ENABLED"));
        }
        let infos = self.soundcloud.search(query).await?;
        Ok(LoadResponse::search(infos))
    }

    /// Open the audio byte stream for a resolved track.
    pub async fn open(&self, info: &TrackInfo) -> Result<ByteStream, SourceError> {
        match info.source_name.as_str() {
            "youtube" => {
                if !self.youtube_enabled {
                    return Err(SourceError::Disabled("YOUTUBE_NOT_ENABLED"));
                }
                self.youtube.open(&info.identifier).await
            }
            "soundcloud" => {
                if !self.soundcloud_enabled {
                    return Err(SourceError::Disabled("SOUNDCLOUD_NOT_ENABLED"));
                }
                self.soundcloud.open(&info.identifier).await
            }
            "local" => {
                if !self.local_enabled {
                    return Err(SourceError::Disabled("LOCAL_NOT_ENABLED"));
                }
                local::open(info.uri.as_deref().unwrap_or(&info.identifier)).await
            }
            "http" => {
                if !self.http_enabled {
                    return Err(SourceError::Disabled("HTTP_NOT_ENABLED"));
                }
                http::open(
                    &self.client,
                    info.uri.as_deref().unwrap_or(&info.identifier),
                )
                .await
            }
            other => Err(SourceError::NotFound(format!("unknown source {other}"))),
        }
    }
}

/// Wrap a streaming HTTP body as an `AsyncRead`.
pub(crate) fn response_stream(response: reqwest::Response) -> ByteStream {
    use futures_util::TryStreamExt;
    let stream = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
    Box::new(tokio_util::io::StreamReader::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_type_wire_format() {
        assert_eq!(
            serde_json::to_string(&LoadType::SearchResult).unwrap(),
            "\"SEARCH_RESULT\""
        );
        assert_eq!(
            serde_json::to_string(&LoadType::NoMatches).unwrap(),
            "\"NO_MATCHES\""
        );
    }

    #[test]
    fn empty_search_collapses_to_no_matches() {
        let response = LoadResponse::search(Vec::new());
        assert_eq!(response.load_type, LoadType::NoMatches);
    }

    #[test]
    fn failed_response_carries_exception() {
        let response = LoadResponse::failed(&SourceError::Disabled("HTTP_NOT_ENABLED"));
        assert_eq!(response.load_type, LoadType::LoadFailed);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["exception"]["message"], "HTTP_NOT_ENABLED");
        assert_eq!(json["exception"]["severity"], "COMMON");
    }
}
