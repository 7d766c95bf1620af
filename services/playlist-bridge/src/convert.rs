//!
//! src/convert.rs
//!
//! First conversion of a source playlist: read it, resolve every track,
//! create the target playlist and persist the mapping
//!

use std::collections::HashSet;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::catalog::CredentialSet;
use crate::engine::Engine;
use crate::errors::BridgeError;
use crate::retry::with_retry;
use crate::types::{ConversionResult, Platform, PlaylistMapping};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertRequest {
    pub source_playlist_id: String,
    pub source_platform: Platform,
    pub target_platform: Platform
}

impl Engine {
    /// Converts the source playlist. A playlist that already has a
    /// mapping to the same platform converges through sync instead of
    /// producing a second target playlist
    pub async fn convert(
        &self,
        req: &ConvertRequest,
        creds: &CredentialSet,
        cancel: &CancellationToken
    ) -> Result<ConversionResult, BridgeError> {
        if req.source_platform == req.target_platform {
            return Err(BridgeError::Config(
                format!("source and target are both {}", req.source_platform)
            ));
        }

        let _guard = self.lock(&req.source_playlist_id).await;

        if let Some(existing) = self.store().load_mapping(&req.source_playlist_id).await? {
            if existing.source_platform != req.source_platform
                || existing.target_platform != req.target_platform {
                return Err(BridgeError::Conflict(format!(
                    "{} is already mapped from {} to {}",
                    req.source_playlist_id, existing.source_platform, existing.target_platform
                )));
            }
            info!(
                playlist = %req.source_playlist_id, target = %existing.target_playlist_id,
                "convert.existing"
            );
            return self.sync_locked(existing, creds, cancel).await;
        }

        let source = self.client(req.source_platform)?;
        let target = self.client(req.target_platform)?;
        let source_creds = creds.for_platform(req.source_platform)?;
        let target_creds = creds.for_platform(req.target_platform)?;
        let retry = self.resolver().retry();

        info!(
            playlist = %req.source_playlist_id, from = %req.source_platform,
            to = %req.target_platform, "convert.start"
        );

        let name = with_retry(retry, cancel, "playlist_name", || {
            source.playlist_name(source_creds, &req.source_playlist_id)
        }).await?;
        let tracks = with_retry(retry, cancel, "list_playlist_tracks", || {
            source.list_playlist_tracks(source_creds, &req.source_playlist_id)
        }).await?;

        let mut resolutions = self.resolver()
            .resolve(&tracks, target.clone(), target_creds, cancel)
            .await?;

        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }

        // from here on the target is mutated; run to completion
        let commit = CancellationToken::new();
        let title = format!("{name} (from {})", req.source_platform);
        let description = format!(
            "Converted from {} playlist {}", req.source_platform, req.source_playlist_id
        );
        let target_playlist_id = with_retry(retry, &commit, "create_playlist", || {
            target.create_playlist(target_creds, &title, &description)
        }).await?;
        info!(playlist = %target_playlist_id, title = %title, "convert.created");

        let order: Vec<usize> = (0..resolutions.len()).collect();
        let mut present = HashSet::new();
        let added = self.commit_additions(
            target.as_ref(), target_creds, &target_playlist_id,
            &mut resolutions, &order, &mut present
        ).await?;

        let now = Utc::now();
        let mapping = PlaylistMapping {
            source_playlist_id: req.source_playlist_id.clone(),
            source_platform: req.source_platform,
            target_platform: req.target_platform,
            target_playlist_id,
            resolutions,
            pending_removals: Vec::new(),
            created_at: now,
            last_synced_at: now
        };
        self.store().save_mapping(&mapping).await?;

        let mut result = ConversionResult::from_mapping(&mapping);
        result.added = added;
        info!(
            playlist = %mapping.source_playlist_id, target = %mapping.target_playlist_id,
            matched = result.matched, no_match = result.no_match, failed = result.failed,
            added, "convert.done"
        );
        Ok(result)
    }
}
