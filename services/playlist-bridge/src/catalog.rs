//!
//! src/catalog.rs
//!
//! The capability every platform client offers the engine. Credentials
//! travel with each call, nothing about auth lives in the client
//!

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;

use crate::config::TokenConfig;
use crate::errors::BridgeError;
use crate::types::{Platform, Track};

#[derive(Clone)]
pub struct Credentials {
    access_token: String
}

impl Credentials {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self { access_token: access_token.into() }
    }

    pub fn token(&self) -> &str {
        &self.access_token
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("access_token", &"<redacted>").finish()
    }
}

/// Credentials for every platform a single run touches
#[derive(Debug, Clone, Default)]
pub struct CredentialSet {
    by_platform: HashMap<Platform, Credentials>
}

impl CredentialSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, platform: Platform, creds: Credentials) -> Self {
        self.by_platform.insert(platform, creds);
        self
    }

    pub fn from_tokens(tokens: &TokenConfig) -> Self {
        let mut set = Self::new();
        if let Some(t) = &tokens.spotify {
            set = set.with(Platform::Spotify, Credentials::bearer(t.clone()));
        }
        if let Some(t) = &tokens.youtube {
            set = set.with(Platform::YouTube, Credentials::bearer(t.clone()));
        }
        set
    }

    /// A missing token fails the same way an expired one does
    pub fn for_platform(&self, platform: Platform) -> Result<&Credentials, BridgeError> {
        self.by_platform.get(&platform).ok_or_else(|| BridgeError::AuthInvalid(
            format!("no access token for {platform}")
        ))
    }
}

#[async_trait]
pub trait CatalogClient: Send + Sync {
    fn platform(&self) -> Platform;

    /// Maximum requests this client accepts in flight at once
    fn concurrency_budget(&self) -> usize;

    async fn search_track(&self, creds: &Credentials, query: &str, max_results: usize)
        -> Result<Vec<Track>, BridgeError>;

    /// Every track of the playlist in platform order
    async fn list_playlist_tracks(&self, creds: &Credentials, playlist_id: &str)
        -> Result<Vec<Track>, BridgeError>;

    async fn playlist_name(&self, creds: &Credentials, playlist_id: &str)
        -> Result<String, BridgeError>;

    async fn create_playlist(&self, creds: &Credentials, name: &str, description: &str)
        -> Result<String, BridgeError>;

    async fn add_track(&self, creds: &Credentials, playlist_id: &str, track_id: &str)
        -> Result<(), BridgeError>;

    async fn remove_track(&self, creds: &Credentials, playlist_id: &str, track_id: &str)
        -> Result<(), BridgeError>;
}

/// Registered clients by platform
#[derive(Clone, Default)]
pub struct Catalogs {
    clients: HashMap<Platform, Arc<dyn CatalogClient>>
}

impl Catalogs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, client: Arc<dyn CatalogClient>) -> Self {
        self.clients.insert(client.platform(), client);
        self
    }

    pub fn get(&self, platform: Platform) -> Result<Arc<dyn CatalogClient>, BridgeError> {
        self.clients
            .get(&platform)
            .cloned()
            .ok_or_else(|| BridgeError::Config(format!("no catalog client for {platform}")))
    }
}
