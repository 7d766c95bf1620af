//!
//! src/sync.rs
//!
//! Reconciles a stored mapping with the current source playlist. Only
//! the delta goes back through the pipeline: new tracks and earlier
//! misses. Vanished tracks are taken off the target
//!

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::CredentialSet;
use crate::engine::Engine;
use crate::errors::BridgeError;
use crate::retry::with_retry;
use crate::types::{ConversionResult, PlaylistMapping, Resolution, Track};

/// What has to happen to bring a mapping up to date with `current`
#[derive(Debug)]
struct SyncPlan {
    /// One slot per current source track; `None` needs resolving
    kept: Vec<Option<Resolution>>,
    /// Target IDs whose source tracks left the playlist
    vanished: Vec<String>
}

impl SyncPlan {
    fn build(stored: &PlaylistMapping, current: &[Track]) -> Self {
        let by_source: HashMap<&str, &Resolution> = stored.resolutions
            .iter()
            .map(|r| (r.source.id.as_str(), r))
            .collect();
        let current_ids: HashSet<&str> = current.iter().map(|t| t.id.as_str()).collect();

        let kept = current.iter()
            .map(|t| match by_source.get(t.id.as_str()) {
                Some(r) if r.outcome.is_matched() => Some((*r).clone()),
                _ => None
            })
            .collect();

        let mut seen = HashSet::new();
        let vanished = stored.resolutions
            .iter()
            .filter(|r| !current_ids.contains(r.source.id.as_str()))
            .filter_map(|r| r.outcome.target_id())
            .chain(stored.pending_removals.iter().map(String::as_str))
            .filter(|id| seen.insert(*id))
            .map(str::to_string)
            .collect();

        Self { kept, vanished }
    }

    fn unresolved(&self) -> Vec<usize> {
        self.kept
            .iter()
            .enumerate()
            .filter_map(|(i, k)| k.is_none().then_some(i))
            .collect()
    }
}

impl Engine {
    /// Loads the stored mapping for `source_playlist_id` and syncs it
    pub async fn sync_playlist(
        &self,
        source_playlist_id: &str,
        creds: &CredentialSet,
        cancel: &CancellationToken
    ) -> Result<ConversionResult, BridgeError> {
        let mapping = self.show(source_playlist_id).await?;
        self.sync(mapping, creds, cancel).await
    }

    /// Syncs `mapping` under its playlist lock. A copy that another
    /// sync overtook while waiting for the lock gives way to the stored one
    pub async fn sync(
        &self,
        mapping: PlaylistMapping,
        creds: &CredentialSet,
        cancel: &CancellationToken
    ) -> Result<ConversionResult, BridgeError> {
        let _guard = self.lock(&mapping.source_playlist_id).await;
        let mapping = match self.store().load_mapping(&mapping.source_playlist_id).await? {
            Some(stored) if stored.last_synced_at > mapping.last_synced_at => {
                debug!(playlist = %stored.source_playlist_id, "sync.stale_copy");
                stored
            }
            _ => mapping
        };
        self.sync_locked(mapping, creds, cancel).await
    }

    /// Caller holds the playlist lock. Any error before the commit phase
    /// leaves the stored mapping as it was
    pub(crate) async fn sync_locked(
        &self,
        mut mapping: PlaylistMapping,
        creds: &CredentialSet,
        cancel: &CancellationToken
    ) -> Result<ConversionResult, BridgeError> {
        let source = self.client(mapping.source_platform)?;
        let target = self.client(mapping.target_platform)?;
        let source_creds = creds.for_platform(mapping.source_platform)?;
        let target_creds = creds.for_platform(mapping.target_platform)?;
        let retry = self.resolver().retry();

        info!(
            playlist = %mapping.source_playlist_id, target = %mapping.target_playlist_id,
            "sync.start"
        );

        let current = with_retry(retry, cancel, "list_playlist_tracks", || {
            source.list_playlist_tracks(source_creds, &mapping.source_playlist_id)
        }).await?;

        let plan = SyncPlan::build(&mapping, &current);
        let unresolved = plan.unresolved();
        // kept matches are already on the target
        let mut present: HashSet<String> = plan.kept
            .iter()
            .flatten()
            .filter_map(|r| r.outcome.target_id())
            .map(str::to_string)
            .collect();
        let pending: Vec<Track> = unresolved.iter().map(|&i| current[i].clone()).collect();
        debug!(
            current = current.len(), resolve = pending.len(), vanished = plan.vanished.len(),
            "sync.plan"
        );

        let fresh = self.resolver()
            .resolve(&pending, target.clone(), target_creds, cancel)
            .await?;
        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }

        let mut fresh = fresh.into_iter();
        let mut resolutions: Vec<Resolution> = plan.kept
            .into_iter()
            .map(|slot| slot.or_else(|| fresh.next()))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| BridgeError::Task("pipeline returned too few resolutions".into()))?;

        let referenced: HashSet<&str> = resolutions
            .iter()
            .filter_map(|r| r.outcome.target_id())
            .collect();

        let mut removed = 0;
        let mut still_pending = Vec::new();
        for target_id in &plan.vanished {
            if referenced.contains(target_id.as_str()) {
                present.insert(target_id.clone());
                debug!(target = %target_id, "sync.remove.skip");
                continue;
            }
            match self.remove_committed(
                target.as_ref(), target_creds, &mapping.target_playlist_id, target_id
            ).await {
                Ok(()) => {
                    removed += 1;
                    info!(target = %target_id, "sync.remove");
                }
                Err(BridgeError::NotFound(_)) => {
                    debug!(target = %target_id, "sync.remove.absent");
                }
                Err(e) if e.is_fatal() => {
                    warn!(target = %target_id, error = %e, removed, "sync.remove.abort");
                    return Err(e);
                }
                Err(e) => {
                    warn!(target = %target_id, error = %e, "sync.remove.deferred");
                    still_pending.push(target_id.clone());
                }
            }
        }

        let added = self.commit_additions(
            target.as_ref(), target_creds, &mapping.target_playlist_id,
            &mut resolutions, &unresolved, &mut present
        ).await?;

        mapping.resolutions = resolutions;
        mapping.pending_removals = still_pending;
        mapping.last_synced_at = Utc::now();
        self.store().save_mapping(&mapping).await?;

        let mut result = ConversionResult::from_mapping(&mapping);
        result.added = added;
        result.removed = removed;
        info!(
            playlist = %mapping.source_playlist_id, matched = result.matched,
            no_match = result.no_match, failed = result.failed, added, removed, "sync.done"
        );
        Ok(result)
    }
}
