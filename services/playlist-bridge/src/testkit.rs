//!
//! src/testkit.rs
//!
//! Scripted in-memory catalog and mapping store for driving the
//! engine without a network or a database
//!

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex
    },
    time::Duration
};

use async_trait::async_trait;

use crate::catalog::{CatalogClient, Catalogs, CredentialSet, Credentials};
use crate::config::{MatchingConfig, RetryConfig};
use crate::engine::Engine;
use crate::errors::BridgeError;
use crate::resolve::Resolver;
use crate::normalize::normalize;
use crate::persistent::MappingStore;
use crate::types::{Platform, PlaylistMapping, Track};

pub fn track(platform: Platform, id: &str, title: &str, artist: &str, duration: Option<u32>)
    -> Track {
    Track {
        platform,
        id: id.to_string(),
        title: title.to_string(),
        artists: vec![artist.to_string()],
        album: None,
        duration_secs: duration,
        url: format!("https://example.test/{}/{id}", platform.as_str())
    }
}

/// The query the pipeline sends for `source`
pub fn query_for(source: &Track) -> String {
    normalize(&source.title, source.primary_artist()).query()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Search(String),
    List(String),
    Create(String),
    Add { playlist: String, track: String },
    Remove { playlist: String, track: String }
}

#[derive(Debug, Default)]
struct FakePlaylist {
    name: String,
    tracks: Vec<Track>
}

#[derive(Default)]
struct FakeState {
    results: HashMap<String, Vec<Track>>,
    search_errors: HashMap<String, VecDeque<BridgeError>>,
    search_delays: HashMap<String, Duration>,
    list_errors: VecDeque<BridgeError>,
    add_errors: HashMap<String, VecDeque<BridgeError>>,
    remove_errors: HashMap<String, VecDeque<BridgeError>>,
    playlists: HashMap<String, FakePlaylist>,
    catalog: HashMap<String, Track>,
    created: usize,
    calls: Vec<Call>
}

pub struct FakeCatalog {
    platform: Platform,
    budget: usize,
    state: Mutex<FakeState>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize
}

impl FakeCatalog {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            budget: 8,
            state: Mutex::new(FakeState::default()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0)
        }
    }

    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = budget;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Candidates returned when `source` is searched for
    pub fn script_search(&self, source: &Track, results: Vec<Track>) {
        let mut st = self.state();
        for t in &results {
            st.catalog.insert(t.id.clone(), t.clone());
        }
        st.results.insert(query_for(source), results);
    }

    /// Errors returned, in order, before the scripted candidates
    pub fn fail_search(&self, source: &Track, errors: Vec<BridgeError>) {
        self.state().search_errors.insert(query_for(source), errors.into());
    }

    pub fn delay_search(&self, source: &Track, delay: Duration) {
        self.state().search_delays.insert(query_for(source), delay);
    }

    pub fn fail_list(&self, error: BridgeError) {
        self.state().list_errors.push_back(error);
    }

    pub fn fail_add(&self, track_id: &str, errors: Vec<BridgeError>) {
        self.state().add_errors.insert(track_id.to_string(), errors.into());
    }

    pub fn fail_remove(&self, track_id: &str, errors: Vec<BridgeError>) {
        self.state().remove_errors.insert(track_id.to_string(), errors.into());
    }

    pub fn put_playlist(&self, id: &str, name: &str, tracks: Vec<Track>) {
        self.state().playlists.insert(id.to_string(), FakePlaylist {
            name: name.to_string(),
            tracks
        });
    }

    pub fn playlist_ids(&self, id: &str) -> Vec<String> {
        self.state()
            .playlists
            .get(id)
            .map(|p| p.tracks.iter().map(|t| t.id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn playlist_title(&self, id: &str) -> Option<String> {
        self.state().playlists.get(id).map(|p| p.name.clone())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Add { .. } | Call::Remove { .. }))
            .collect()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CatalogClient for FakeCatalog {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn concurrency_budget(&self) -> usize {
        self.budget
    }

    async fn search_track(&self, _creds: &Credentials, query: &str, max_results: usize)
        -> Result<Vec<Track>, BridgeError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let delay = {
            let mut st = self.state();
            st.calls.push(Call::Search(query.to_string()));
            st.search_delays.get(query).copied()
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }

        let mut st = self.state();
        if let Some(e) = st.search_errors.get_mut(query).and_then(VecDeque::pop_front) {
            return Err(e);
        }
        let mut found = st.results.get(query).cloned().unwrap_or_default();
        found.truncate(max_results);
        Ok(found)
    }

    async fn list_playlist_tracks(&self, _creds: &Credentials, playlist_id: &str)
        -> Result<Vec<Track>, BridgeError> {
        let mut st = self.state();
        st.calls.push(Call::List(playlist_id.to_string()));
        if let Some(e) = st.list_errors.pop_front() {
            return Err(e);
        }
        st.playlists
            .get(playlist_id)
            .map(|p| p.tracks.clone())
            .ok_or_else(|| BridgeError::NotFound(format!("playlist {playlist_id}")))
    }

    async fn playlist_name(&self, _creds: &Credentials, playlist_id: &str)
        -> Result<String, BridgeError> {
        self.state()
            .playlists
            .get(playlist_id)
            .map(|p| p.name.clone())
            .ok_or_else(|| BridgeError::NotFound(format!("playlist {playlist_id}")))
    }

    async fn create_playlist(&self, _creds: &Credentials, name: &str, _description: &str)
        -> Result<String, BridgeError> {
        let mut st = self.state();
        st.created += 1;
        let id = format!("{}-pl-{}", self.platform.as_str(), st.created);
        st.calls.push(Call::Create(name.to_string()));
        st.playlists.insert(id.clone(), FakePlaylist {
            name: name.to_string(),
            tracks: Vec::new()
        });
        Ok(id)
    }

    async fn add_track(&self, _creds: &Credentials, playlist_id: &str, track_id: &str)
        -> Result<(), BridgeError> {
        let mut st = self.state();
        st.calls.push(Call::Add {
            playlist: playlist_id.to_string(),
            track: track_id.to_string()
        });
        if let Some(e) = st.add_errors.get_mut(track_id).and_then(VecDeque::pop_front) {
            return Err(e);
        }
        let track = st.catalog
            .get(track_id)
            .cloned()
            .unwrap_or_else(|| track(self.platform, track_id, track_id, "", None));
        let playlist = st.playlists
            .get_mut(playlist_id)
            .ok_or_else(|| BridgeError::NotFound(format!("playlist {playlist_id}")))?;
        playlist.tracks.push(track);
        Ok(())
    }

    async fn remove_track(&self, _creds: &Credentials, playlist_id: &str, track_id: &str)
        -> Result<(), BridgeError> {
        let mut st = self.state();
        st.calls.push(Call::Remove {
            playlist: playlist_id.to_string(),
            track: track_id.to_string()
        });
        if let Some(e) = st.remove_errors.get_mut(track_id).and_then(VecDeque::pop_front) {
            return Err(e);
        }
        let playlist = st.playlists
            .get_mut(playlist_id)
            .ok_or_else(|| BridgeError::NotFound(format!("playlist {playlist_id}")))?;
        let before = playlist.tracks.len();
        playlist.tracks.retain(|t| t.id != track_id);
        if playlist.tracks.len() == before {
            return Err(BridgeError::NotFound(format!("track {track_id}")));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    mappings: Mutex<HashMap<String, PlaylistMapping>>,
    saves: AtomicUsize
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn get(&self, source_playlist_id: &str) -> Option<PlaylistMapping> {
        self.mappings.lock().unwrap().get(source_playlist_id).cloned()
    }
}

#[async_trait]
impl MappingStore for MemoryStore {
    async fn load_mapping(&self, source_playlist_id: &str)
        -> Result<Option<PlaylistMapping>, BridgeError> {
        Ok(self.get(source_playlist_id))
    }

    async fn save_mapping(&self, mapping: &PlaylistMapping) -> Result<(), BridgeError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.mappings
            .lock()
            .unwrap()
            .insert(mapping.source_playlist_id.clone(), mapping.clone());
        Ok(())
    }
}

/// Both fake catalogs and a memory store wired into an engine
pub struct Harness {
    pub spotify: Arc<FakeCatalog>,
    pub youtube: Arc<FakeCatalog>,
    pub store: Arc<MemoryStore>,
    pub engine: Engine
}

impl Harness {
    pub fn new() -> Self {
        let spotify = Arc::new(FakeCatalog::new(Platform::Spotify));
        let youtube = Arc::new(FakeCatalog::new(Platform::YouTube));
        let store = Arc::new(MemoryStore::new());
        let catalogs = Catalogs::new()
            .register(spotify.clone())
            .register(youtube.clone());
        let resolver = Resolver::new(MatchingConfig::default(), RetryConfig::default(), 5);
        let engine = Engine::new(catalogs, store.clone(), resolver);
        Self { spotify, youtube, store, engine }
    }

    pub fn creds() -> CredentialSet {
        CredentialSet::new()
            .with(Platform::Spotify, Credentials::bearer("sp-token"))
            .with(Platform::YouTube, Credentials::bearer("yt-token"))
    }
}
