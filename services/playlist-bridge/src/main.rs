//!
//! src/main.rs
//!
//! Command line entry point. Wires config, logging, the catalog
//! clients and the mapping store into an engine and runs one command
//!

mod catalog;
mod config;
mod convert;
mod engine;
mod errors;
mod fetch;
mod logging;
mod normalize;
mod persistent;
mod resolve;
mod retry;
mod scorer;
mod sync;
mod types;

#[cfg(test)]
mod testkit;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalog::{Catalogs, CredentialSet};
use crate::convert::ConvertRequest;
use crate::engine::Engine;
use crate::errors::BridgeError;
use crate::fetch::{SpotifyClient, YouTubeClient};
use crate::resolve::Resolver;
use crate::types::{ConversionResult, Platform};

#[derive(Parser)]
#[command(name = "playlist-bridge")]
#[command(about = "Convert and sync playlists between Spotify and YouTube", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a playlist to the other platform
    Convert {
        /// Source playlist ID
        #[arg(long)]
        playlist: String,
        /// Source platform (spotify, youtube)
        #[arg(long)]
        from: Platform,
        /// Target platform (spotify, youtube)
        #[arg(long)]
        to: Platform
    },

    /// Bring a converted playlist up to date with its source
    Sync {
        /// Source playlist ID
        #[arg(long)]
        playlist: String
    },

    /// Print the stored mapping for a playlist
    Show {
        /// Source playlist ID
        #[arg(long)]
        playlist: String
    }
}

fn build_engine(cfgs: &config::AppConfig, store: persistent::Persistent) ->
    Result<Engine, BridgeError> {
    let catalogs = Catalogs::new()
        .register(Arc::new(SpotifyClient::new(&cfgs.http, &cfgs.spotify)?))
        .register(Arc::new(YouTubeClient::new(&cfgs.http, &cfgs.youtube)?));
    let resolver = Resolver::new(
        cfgs.matching,
        cfgs.retry.clone(),
        cfgs.concurrency.resolve_concurrency
    );
    Ok( Engine::new(catalogs, Arc::new(store), resolver) )
}

/// Cancels the run on Ctrl-C or once the run deadline passes
fn spawn_shutdown(cancel: CancellationToken, deadline: std::time::Duration) ->
    tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            r = tokio::signal::ctrl_c() => {
                if r.is_ok() {
                    warn!(msg = "interrupt received, cancelling run", "bridge.signal");
                    cancel.cancel();
                }
            }
            _ = tokio::time::sleep(deadline) => {
                warn!(timeout_secs = deadline.as_secs(), "bridge.timeout");
                cancel.cancel();
            }
        }
    })
}

async fn run(cli: Cli, cfgs: config::AppConfig) -> Result<serde_json::Value, BridgeError> {
    let store = persistent::Persistent::init(&cfgs.persistence.db_url).await?;
    let engine = build_engine(&cfgs, store)?;
    let creds = CredentialSet::from_tokens(&cfgs.tokens);

    let cancel = CancellationToken::new();
    let shutdown = spawn_shutdown(cancel.clone(), cfgs.concurrency.run_timeout);

    let outcome = async {
        let output = match cli.command {
            Commands::Convert { playlist, from, to } => {
                let req = ConvertRequest {
                    source_playlist_id: playlist,
                    source_platform: from,
                    target_platform: to
                };
                serde_json::to_value(engine.convert(&req, &creds, &cancel).await?.payload())?
            }
            Commands::Sync { playlist } => {
                let result = engine.sync_playlist(&playlist, &creds, &cancel).await?;
                serde_json::to_value(result.payload())?
            }
            Commands::Show { playlist } => {
                let m = engine.show(&playlist).await?;
                let summary = ConversionResult::from_mapping(&m);
                json!({
                    "sourcePlaylistID": m.source_playlist_id,
                    "sourcePlatform": m.source_platform,
                    "targetPlatform": m.target_platform,
                    "targetPlaylistID": m.target_playlist_id,
                    "createdAt": m.created_at,
                    "lastSyncedAt": m.last_synced_at,
                    "pendingRemovals": m.pending_removals,
                    "targetTracks": m.matched_target_ids().len(),
                    "matched": summary.matched,
                    "noMatch": summary.no_match,
                    "failed": summary.failed,
                    "unmatched": summary.unmatched
                })
            }
        };
        Ok::<_, BridgeError>(output)
    }
    .instrument(info_span!("run", run_id = %Uuid::new_v4()))
    .await;

    shutdown.abort();
    outcome
}

#[tokio::main]
async fn main() -> Result<(), BridgeError> {
    let cli = Cli::parse();
    let cfgs = config::load_config()?;
    let _guard = logging::init_logging(&cfgs.logging)?;

    info!(
        service = "playlist-bridge",
        version = %env!("CARGO_PKG_VERSION"),
        "starting"
    );

    match run(cli, cfgs).await {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            info!("bridge.exit");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "bridge.failed");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_convert() {
        let cli = Cli::try_parse_from([
            "playlist-bridge", "convert", "--playlist", "37i9dQZF1DXcBWIGoYBM5M",
            "--from", "spotify", "--to", "yt"
        ]).unwrap();
        match cli.command {
            Commands::Convert { playlist, from, to } => {
                assert_eq!(playlist, "37i9dQZF1DXcBWIGoYBM5M");
                assert_eq!(from, Platform::Spotify);
                assert_eq!(to, Platform::YouTube);
            }
            _ => panic!("expected convert")
        }
    }

    #[test]
    fn cli_rejects_unknown_platform() {
        let parsed = Cli::try_parse_from([
            "playlist-bridge", "convert", "--playlist", "x", "--from", "tidal", "--to", "spotify"
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn cli_parses_sync_and_show() {
        let cli = Cli::try_parse_from(["playlist-bridge", "sync", "--playlist", "p"]).unwrap();
        assert!(matches!(cli.command, Commands::Sync { .. }));
        let cli = Cli::try_parse_from(["playlist-bridge", "show", "--playlist", "p"]).unwrap();
        assert!(matches!(cli.command, Commands::Show { .. }));
    }
}
