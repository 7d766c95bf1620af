//!
//! src/fetch.rs
//!
//! Spotify Web API and YouTube Data API clients. Responses are mapped
//! into `Track` here so nothing past this module sees platform JSON
//!

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, redirect, Client, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};
use tracing::debug;
use url::Url;

use crate::catalog::{CatalogClient, Credentials};
use crate::config::{CatalogConfig, HttpConfig};
use crate::errors::BridgeError;
use crate::types::{Platform, Track};

const SPOTIFY_PAGE: u32 = 100;
const YOUTUBE_PAGE: u32 = 50;

/// Client building functionality
fn client_helper(http: &HttpConfig) -> reqwest::ClientBuilder {
    Client::builder()
        .timeout(http.timeout)
        .connect_timeout(http.connect_timeout)
        .pool_max_idle_per_host(http.pool_max_idle_per_host)
        .pool_idle_timeout(Some(http.pool_idle_timeout))
        .redirect(redirect::Policy::limited(http.max_redirects as usize))
}

fn client_with_headers(http: &HttpConfig, headers: header::HeaderMap) ->
    Result<Client, BridgeError> {
    client_helper(http)
        .default_headers(headers)
        .user_agent(concat!("playlist-bridge/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| BridgeError::Config(format!("build client: {e}")))
}

pub fn base_client(http: &HttpConfig) -> Result<Client, BridgeError> {
    let mut h = header::HeaderMap::new();
    h.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
    client_with_headers(http, h)
}

/// Keeps at least `min_interval` between consecutive requests of a client
#[derive(Debug)]
struct RateGate {
    min_interval: Duration,
    state: tokio::sync::Mutex<Option<Instant>>
}

impl RateGate {
    fn new(min_interval: Duration) -> Self {
        Self { min_interval, state: tokio::sync::Mutex::new(None) }
    }

    async fn wait(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut last = self.state.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

fn endpoint(base: &Url, path: &str) -> Result<Url, BridgeError> {
    base.join(path)
        .map_err(|e| BridgeError::Config(format!("bad endpoint {path}: {e}")))
}

/// Sends a request and classifies the outcome. Empty success bodies
/// come back as `Value::Null`
async fn send_json(request: RequestBuilder) -> Result<Value, BridgeError> {
    let resp = request.send().await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(BridgeError::from_status(status, &body));
    }
    if status == StatusCode::NO_CONTENT {
        return Ok(Value::Null);
    }
    let text = resp.text().await?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
}

fn str_at<'a>(v: &'a Value, pointer: &str) -> Option<&'a str> {
    v.pointer(pointer).and_then(Value::as_str).filter(|s| !s.is_empty())
}

///
/// Spotify Web API
///

pub struct SpotifyClient {
    http: Client,
    cfg: CatalogConfig,
    gate: RateGate
}

impl SpotifyClient {
    pub fn new(http_config: &HttpConfig, cfg: &CatalogConfig) -> Result<Self, BridgeError> {
        Ok( Self {
            http: base_client(http_config)?,
            cfg: cfg.clone(),
            gate: RateGate::new(cfg.min_interval)
        })
    }

    async fn send(&self, request: RequestBuilder, creds: &Credentials) -> Result<Value, BridgeError> {
        self.gate.wait().await;
        send_json(request.bearer_auth(creds.token())).await
    }

    async fn current_user(&self, creds: &Credentials) -> Result<String, BridgeError> {
        let url = endpoint(&self.cfg.api_base, "me")?;
        let me = self.send(self.http.get(url), creds).await?;
        str_at(&me, "/id")
            .map(str::to_string)
            .ok_or_else(|| BridgeError::Parse("me: missing id".into()))
    }

    fn track_uri(track_id: &str) -> String {
        format!("spotify:track:{track_id}")
    }
}

/// Maps a Spotify track object; local files and removed tracks have no ID
pub fn spotify_track(v: &Value) -> Option<Track> {
    if v.get("is_local").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    let id = str_at(v, "/id")?.to_string();
    let title = str_at(v, "/name")?.to_string();
    let artists = v.get("artists")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(|x| str_at(x, "/name")).map(str::to_string).collect())
        .unwrap_or_default();
    let duration_secs = v.get("duration_ms")
        .and_then(Value::as_u64)
        .map(|ms| ((ms + 500) / 1000) as u32);
    let url = str_at(v, "/external_urls/spotify")
        .map(str::to_string)
        .unwrap_or_else(|| format!("https://open.spotify.com/track/{id}"));

    Some(Track {
        platform: Platform::Spotify,
        id,
        title,
        artists,
        album: str_at(v, "/album/name").map(str::to_string),
        duration_secs,
        url
    })
}

/// One page of `playlists/{id}/tracks` and the URL of the next page
fn spotify_playlist_page(page: &Value) -> (Vec<Track>, Option<String>) {
    let tracks = page.get("items")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|i| i.get("track")).filter_map(spotify_track).collect())
        .unwrap_or_default();
    (tracks, str_at(page, "/next").map(str::to_string))
}

#[async_trait]
impl CatalogClient for SpotifyClient {
    fn platform(&self) -> Platform {
        Platform::Spotify
    }

    fn concurrency_budget(&self) -> usize {
        self.cfg.concurrency
    }

    /// GET /v1/search?type=track&q=...&limit=
    async fn search_track(&self, creds: &Credentials, query: &str, max_results: usize)
        -> Result<Vec<Track>, BridgeError> {
        let url = endpoint(&self.cfg.api_base, "search")?;
        let limit = max_results.clamp(1, 50).to_string();
        let body = self.send(
            self.http.get(url).query(&[("type", "track"), ("q", query), ("limit", limit.as_str())]),
            creds
        ).await?;

        Ok(body.pointer("/tracks/items")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(spotify_track).collect())
            .unwrap_or_default())
    }

    /// GET /v1/playlists/{id}/tracks, following `next`
    async fn list_playlist_tracks(&self, creds: &Credentials, playlist_id: &str)
        -> Result<Vec<Track>, BridgeError> {
        let mut url = endpoint(&self.cfg.api_base, &format!("playlists/{playlist_id}/tracks"))?;
        url.query_pairs_mut().append_pair("limit", &SPOTIFY_PAGE.to_string());

        let mut tracks = Vec::new();
        loop {
            let page = self.send(self.http.get(url.clone()), creds).await?;
            let (mut batch, next) = spotify_playlist_page(&page);
            tracks.append(&mut batch);
            match next {
                Some(n) => {
                    url = Url::parse(&n).map_err(|e| BridgeError::Parse(format!("next: {e}")))?;
                }
                None => break
            }
        }
        debug!(playlist = %playlist_id, tracks = tracks.len(), "spotify.playlist.read");
        Ok(tracks)
    }

    /// GET /v1/playlists/{id}?fields=name
    async fn playlist_name(&self, creds: &Credentials, playlist_id: &str)
        -> Result<String, BridgeError> {
        let url = endpoint(&self.cfg.api_base, &format!("playlists/{playlist_id}"))?;
        let body = self.send(self.http.get(url).query(&[("fields", "name")]), creds).await?;
        str_at(&body, "/name")
            .map(str::to_string)
            .ok_or_else(|| BridgeError::Parse(format!("playlist {playlist_id}: missing name")))
    }

    /// GET /v1/me then POST /v1/users/{user}/playlists
    async fn create_playlist(&self, creds: &Credentials, name: &str, description: &str)
        -> Result<String, BridgeError> {
        let user = self.current_user(creds).await?;
        let url = endpoint(&self.cfg.api_base, &format!("users/{user}/playlists"))?;
        let body = self.send(
            self.http.post(url).json(&json!({
                "name": name,
                "description": description,
                "public": false
            })),
            creds
        ).await?;
        str_at(&body, "/id")
            .map(str::to_string)
            .ok_or_else(|| BridgeError::Parse("create playlist: missing id".into()))
    }

    /// POST /v1/playlists/{id}/tracks
    async fn add_track(&self, creds: &Credentials, playlist_id: &str, track_id: &str)
        -> Result<(), BridgeError> {
        let url = endpoint(&self.cfg.api_base, &format!("playlists/{playlist_id}/tracks"))?;
        self.send(
            self.http.post(url).json(&json!({ "uris": [Self::track_uri(track_id)] })),
            creds
        ).await?;
        Ok(())
    }

    /// DELETE /v1/playlists/{id}/tracks
    async fn remove_track(&self, creds: &Credentials, playlist_id: &str, track_id: &str)
        -> Result<(), BridgeError> {
        let url = endpoint(&self.cfg.api_base, &format!("playlists/{playlist_id}/tracks"))?;
        self.send(
            self.http.delete(url).json(&json!({
                "tracks": [{ "uri": Self::track_uri(track_id) }]
            })),
            creds
        ).await?;
        Ok(())
    }
}

///
/// YouTube Data API v3
///

pub struct YouTubeClient {
    http: Client,
    cfg: CatalogConfig,
    gate: RateGate
}

impl YouTubeClient {
    pub fn new(http_config: &HttpConfig, cfg: &CatalogConfig) -> Result<Self, BridgeError> {
        Ok( Self {
            http: base_client(http_config)?,
            cfg: cfg.clone(),
            gate: RateGate::new(cfg.min_interval)
        })
    }

    async fn send(&self, request: RequestBuilder, creds: &Credentials) -> Result<Value, BridgeError> {
        self.gate.wait().await;
        send_json(request.bearer_auth(creds.token())).await
    }

    /// GET /videos?part=contentDetails&id=a,b,c
    async fn durations(&self, creds: &Credentials, ids: &[String])
        -> Result<Vec<(String, u32)>, BridgeError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = endpoint(&self.cfg.api_base, "videos")?;
        let joined = ids.join(",");
        let body = self.send(
            self.http.get(url).query(&[("part", "contentDetails"), ("id", joined.as_str())]),
            creds
        ).await?;

        Ok(body.get("items")
            .and_then(Value::as_array)
            .map(|items| items.iter()
                .filter_map(|i| {
                    let id = str_at(i, "/id")?;
                    let secs = parse_iso_duration(str_at(i, "/contentDetails/duration")?)?;
                    Some((id.to_string(), secs))
                })
                .collect())
            .unwrap_or_default())
    }

    async fn with_durations(&self, creds: &Credentials, mut tracks: Vec<Track>)
        -> Result<Vec<Track>, BridgeError> {
        let ids: Vec<String> = tracks.iter().map(|t| t.id.clone()).collect();
        for (id, secs) in self.durations(creds, &ids).await? {
            for t in tracks.iter_mut().filter(|t| t.id == id) {
                t.duration_secs = Some(secs);
            }
        }
        Ok(tracks)
    }

    /// GET /playlistItems?part=snippet&playlistId=...&pageToken=
    async fn playlist_page(&self, creds: &Credentials, playlist_id: &str, token: Option<&str>)
        -> Result<Value, BridgeError> {
        let url = endpoint(&self.cfg.api_base, "playlistItems")?;
        let page = YOUTUBE_PAGE.to_string();
        let mut rb = self.http.get(url).query(&[
            ("part", "snippet"),
            ("playlistId", playlist_id),
            ("maxResults", page.as_str())
        ]);
        if let Some(t) = token {
            rb = rb.query(&[("pageToken", t)]);
        }
        self.send(rb, creds).await
    }
}

/// Channel names carry distribution suffixes that are not artist names
fn clean_channel(channel: &str) -> String {
    let c = channel.trim();
    let c = c.strip_suffix(" - Topic").unwrap_or(c);
    let c = c.strip_suffix("VEVO").unwrap_or(c);
    c.trim().to_string()
}

/// Builds a track from a video title and its channel. "Artist - Title"
/// titles win over the channel name
pub fn video_track(id: &str, title: &str, channel: &str) -> Track {
    let (artist, name) = match title.split_once(" - ").or_else(|| title.split_once(" – ")) {
        Some((a, t)) if !a.trim().is_empty() && !t.trim().is_empty() => {
            (a.trim().to_string(), t.trim().to_string())
        }
        _ => (clean_channel(channel), title.trim().to_string())
    };
    Track {
        platform: Platform::YouTube,
        id: id.to_string(),
        title: name,
        artists: if artist.is_empty() { Vec::new() } else { vec![artist] },
        album: None,
        duration_secs: None,
        url: format!("https://www.youtube.com/watch?v={id}")
    }
}

/// Seconds in an ISO-8601 duration such as `PT1H2M3S` or `P1DT4M`
pub fn parse_iso_duration(raw: &str) -> Option<u32> {
    let rest = raw.strip_prefix('P')?;
    let (days, time) = match rest.split_once('T') {
        Some((d, t)) => (d, t),
        None => (rest, "")
    };

    let mut total: u64 = 0;
    let mut push = |part: &str, units: &[(char, u64)]| -> Option<()> {
        let mut num = String::new();
        for c in part.chars() {
            if c.is_ascii_digit() {
                num.push(c);
                continue;
            }
            let (_, mul) = units.iter().find(|(u, _)| *u == c)?;
            total = num.parse::<u64>().ok()?.checked_mul(*mul)?.checked_add(total)?;
            num.clear();
        }
        num.is_empty().then_some(())
    };
    push(days, &[('W', 604_800), ('D', 86_400)])?;
    push(time, &[('H', 3600), ('M', 60), ('S', 1)])?;
    u32::try_from(total).ok()
}

/// One page of playlist items and the next page token. Deleted and
/// private videos have no owner channel and are skipped
fn youtube_playlist_page(page: &Value) -> (Vec<Track>, Option<String>) {
    let tracks = page.get("items")
        .and_then(Value::as_array)
        .map(|items| items.iter()
            .filter_map(|i| {
                let id = str_at(i, "/snippet/resourceId/videoId")?;
                let channel = str_at(i, "/snippet/videoOwnerChannelTitle")?;
                let title = str_at(i, "/snippet/title")?;
                Some(video_track(id, title, channel))
            })
            .collect())
        .unwrap_or_default();
    (tracks, str_at(page, "/nextPageToken").map(str::to_string))
}

fn youtube_search_results(body: &Value) -> Vec<Track> {
    body.get("items")
        .and_then(Value::as_array)
        .map(|items| items.iter()
            .filter_map(|i| {
                let id = str_at(i, "/id/videoId")?;
                let title = str_at(i, "/snippet/title")?;
                let channel = str_at(i, "/snippet/channelTitle").unwrap_or("");
                Some(video_track(id, title, channel))
            })
            .collect())
        .unwrap_or_default()
}

#[async_trait]
impl CatalogClient for YouTubeClient {
    fn platform(&self) -> Platform {
        Platform::YouTube
    }

    fn concurrency_budget(&self) -> usize {
        self.cfg.concurrency
    }

    /// GET /search?part=snippet&type=video&videoCategoryId=10, then durations
    async fn search_track(&self, creds: &Credentials, query: &str, max_results: usize)
        -> Result<Vec<Track>, BridgeError> {
        let url = endpoint(&self.cfg.api_base, "search")?;
        let limit = max_results.clamp(1, 50).to_string();
        let body = self.send(
            self.http.get(url).query(&[
                ("part", "snippet"),
                ("type", "video"),
                ("videoCategoryId", "10"),
                ("maxResults", limit.as_str()),
                ("q", query)
            ]),
            creds
        ).await?;
        self.with_durations(creds, youtube_search_results(&body)).await
    }

    /// GET /playlistItems, following `nextPageToken`
    async fn list_playlist_tracks(&self, creds: &Credentials, playlist_id: &str)
        -> Result<Vec<Track>, BridgeError> {
        let mut tracks = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.playlist_page(creds, playlist_id, token.as_deref()).await?;
            let (batch, next) = youtube_playlist_page(&page);
            tracks.extend(self.with_durations(creds, batch).await?);
            match next {
                Some(n) => token = Some(n),
                None => break
            }
        }
        debug!(playlist = %playlist_id, tracks = tracks.len(), "youtube.playlist.read");
        Ok(tracks)
    }

    /// GET /playlists?part=snippet&id=
    async fn playlist_name(&self, creds: &Credentials, playlist_id: &str)
        -> Result<String, BridgeError> {
        let url = endpoint(&self.cfg.api_base, "playlists")?;
        let body = self.send(
            self.http.get(url).query(&[("part", "snippet"), ("id", playlist_id)]),
            creds
        ).await?;
        str_at(&body, "/items/0/snippet/title")
            .map(str::to_string)
            .ok_or_else(|| BridgeError::NotFound(format!("playlist {playlist_id}")))
    }

    /// POST /playlists?part=snippet,status
    async fn create_playlist(&self, creds: &Credentials, name: &str, description: &str)
        -> Result<String, BridgeError> {
        let url = endpoint(&self.cfg.api_base, "playlists")?;
        let body = self.send(
            self.http.post(url).query(&[("part", "snippet,status")]).json(&json!({
                "snippet": { "title": name, "description": description },
                "status": { "privacyStatus": "private" }
            })),
            creds
        ).await?;
        str_at(&body, "/id")
            .map(str::to_string)
            .ok_or_else(|| BridgeError::Parse("create playlist: missing id".into()))
    }

    /// POST /playlistItems?part=snippet
    async fn add_track(&self, creds: &Credentials, playlist_id: &str, track_id: &str)
        -> Result<(), BridgeError> {
        let url = endpoint(&self.cfg.api_base, "playlistItems")?;
        self.send(
            self.http.post(url).query(&[("part", "snippet")]).json(&json!({
                "snippet": {
                    "playlistId": playlist_id,
                    "resourceId": { "kind": "youtube#video", "videoId": track_id }
                }
            })),
            creds
        ).await?;
        Ok(())
    }

    /// Finds the playlist item holding the video, then DELETE /playlistItems?id=
    async fn remove_track(&self, creds: &Credentials, playlist_id: &str, track_id: &str)
        -> Result<(), BridgeError> {
        let mut token: Option<String> = None;
        let item_id = loop {
            let page = self.playlist_page(creds, playlist_id, token.as_deref()).await?;
            let found = page.get("items")
                .and_then(Value::as_array)
                .and_then(|items| items.iter().find(|i| {
                    str_at(i, "/snippet/resourceId/videoId") == Some(track_id)
                }))
                .and_then(|i| str_at(i, "/id"))
                .map(str::to_string);
            if let Some(id) = found {
                break id;
            }
            match str_at(&page, "/nextPageToken") {
                Some(n) => token = Some(n.to_string()),
                None => return Err(BridgeError::NotFound(
                    format!("video {track_id} not in playlist {playlist_id}")
                ))
            }
        };

        let url = endpoint(&self.cfg.api_base, "playlistItems")?;
        self.send(self.http.delete(url).query(&[("id", item_id.as_str())]), creds).await?;
        Ok(())
    }
}
