//!
//! src/engine.rs
//!
//! Shared context for convert and sync: registered catalogs, the
//! mapping store, the resolution pipeline and the per-playlist locks
//!

use std::{collections::{HashMap, HashSet}, sync::Arc};

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::catalog::{CatalogClient, Catalogs, Credentials};
use crate::errors::BridgeError;
use crate::persistent::MappingStore;
use crate::resolve::Resolver;
use crate::retry::with_retry;
use crate::types::{FailureKind, Outcome, Platform, PlaylistMapping, Resolution};

/// Single writer per source playlist. Entries nobody holds or waits
/// on are pruned whenever a new lock is taken
#[derive(Clone, Default)]
pub struct PlaylistLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>
}

impl PlaylistLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, source_playlist_id: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.inner.lock().await;
            map.retain(|_, m| Arc::strong_count(m) > 1);
            map.entry(source_playlist_id.to_string()).or_default().clone()
        };
        entry.lock_owned().await
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

pub struct Engine {
    catalogs: Catalogs,
    store: Arc<dyn MappingStore>,
    resolver: Resolver,
    locks: PlaylistLocks
}

impl Engine {
    pub fn new(catalogs: Catalogs, store: Arc<dyn MappingStore>, resolver: Resolver) -> Self {
        Self { catalogs, store, resolver, locks: PlaylistLocks::new() }
    }

    pub(crate) fn client(&self, platform: Platform) -> Result<Arc<dyn CatalogClient>, BridgeError> {
        self.catalogs.get(platform)
    }

    pub(crate) fn store(&self) -> &dyn MappingStore {
        self.store.as_ref()
    }

    pub(crate) fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub(crate) async fn lock(&self, source_playlist_id: &str) -> OwnedMutexGuard<()> {
        self.locks.acquire(source_playlist_id).await
    }

    /// Reads a stored mapping without taking the playlist lock
    pub async fn show(&self, source_playlist_id: &str) -> Result<PlaylistMapping, BridgeError> {
        self.store
            .load_mapping(source_playlist_id)
            .await?
            .ok_or_else(|| BridgeError::NotFound(format!("no mapping for {source_playlist_id}")))
    }

    /// Target mutations run to completion once started, so they retry
    /// under a token nobody cancels
    pub(crate) async fn add_committed(
        &self,
        client: &dyn CatalogClient,
        creds: &Credentials,
        playlist_id: &str,
        track_id: &str
    ) -> Result<(), BridgeError> {
        let commit = CancellationToken::new();
        with_retry(self.resolver.retry(), &commit, "add_track", || {
            client.add_track(creds, playlist_id, track_id)
        }).await
    }

    /// Adds the matched targets of `resolutions[idx]` for each idx, in the
    /// given order, skipping IDs in `present`. A failed add downgrades the
    /// resolution to `Failed` so a later sync retries it. An auth failure
    /// stops the commit and is returned as is. Returns the number of
    /// tracks added
    pub(crate) async fn commit_additions(
        &self,
        client: &dyn CatalogClient,
        creds: &Credentials,
        playlist_id: &str,
        resolutions: &mut [Resolution],
        indices: &[usize],
        present: &mut HashSet<String>
    ) -> Result<usize, BridgeError> {
        let mut added = 0;
        for &idx in indices {
            let Some(target_id) = resolutions[idx].outcome.target_id().map(str::to_string) else {
                continue;
            };
            if present.contains(&target_id) {
                debug!(track = %resolutions[idx].source.id, target = %target_id, "commit.add.skip");
                continue;
            }

            match self.add_committed(client, creds, playlist_id, &target_id).await {
                Ok(()) => {
                    present.insert(target_id);
                    added += 1;
                }
                Err(e) if e.is_fatal() => {
                    warn!(target = %target_id, error = %e, added, "commit.add.abort");
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        track = %resolutions[idx].source.id, target = %target_id,
                        error = %e, "commit.add.failed"
                    );
                    let r = &mut resolutions[idx];
                    r.outcome = Outcome::Failed { kind: FailureKind::from_error(&e) };
                    r.attempted_at = Utc::now();
                }
            }
        }
        Ok(added)
    }

    pub(crate) async fn remove_committed(
        &self,
        client: &dyn CatalogClient,
        creds: &Credentials,
        playlist_id: &str,
        track_id: &str
    ) -> Result<(), BridgeError> {
        let commit = CancellationToken::new();
        with_retry(self.resolver.retry(), &commit, "remove_track", || {
            client.remove_track(creds, playlist_id, track_id)
        }).await
    }
}
