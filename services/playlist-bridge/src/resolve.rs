//!
//! src/resolve.rs
//!
//! Resolution pipeline. Searches the target catalog for every source
//! track in parallel, scores the candidates and applies the decision
//! rule. Output is 1:1 with the input and in input order
//!

use std::sync::Arc;

use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::catalog::{CatalogClient, Credentials};
use crate::config::{MatchingConfig, RetryConfig};
use crate::errors::BridgeError;
use crate::normalize::normalize;
use crate::retry::with_retry_counted;
use crate::scorer::MatchScorer;
use crate::types::{CandidateMatch, FailureKind, NoMatchReason, Outcome, Resolution, Track};

/// Slack for the margin comparison so a gap of exactly the threshold passes
const MARGIN_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct Resolver {
    scorer: MatchScorer,
    matching: MatchingConfig,
    retry: RetryConfig,
    concurrency: usize
}

impl Resolver {
    pub fn new(matching: MatchingConfig, retry: RetryConfig, concurrency: usize) -> Self {
        Self {
            scorer: MatchScorer::new(&matching),
            matching,
            retry,
            concurrency: concurrency.max(1)
        }
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Resolves `tracks` against `target`. Per-track failures land in the
    /// track's Resolution; an auth failure or cancellation aborts the
    /// whole run and discards everything collected so far
    pub async fn resolve(
        &self,
        tracks: &[Track],
        target: Arc<dyn CatalogClient>,
        creds: &Credentials,
        cancel: &CancellationToken
    ) -> Result<Vec<Resolution>, BridgeError> {
        let budget = self.concurrency.min(target.concurrency_budget()).max(1);
        info!(
            tracks = tracks.len(), target = %target.platform(), budget, "resolve.start"
        );

        let gate = Arc::new(Semaphore::new(budget));
        let mut slots: Vec<Option<Resolution>> = vec![None; tracks.len()];
        let mut tasks = JoinSet::new();

        for (idx, track) in tracks.iter().cloned().enumerate() {
            let this = self.clone();
            let client = target.clone();
            let creds = creds.clone();
            let gate = gate.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = gate
                    .acquire_owned()
                    .await
                    .map_err(|_| BridgeError::Cancelled)?;
                let resolution = this.resolve_one(track, client.as_ref(), &creds, &cancel).await?;
                Ok::<_, BridgeError>((idx, resolution))
            }.in_current_span());
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    warn!(reason = "cancelled", "resolve.abort");
                    return Err(BridgeError::Cancelled);
                }
                next = tasks.join_next() => next
            };
            let Some(joined) = next else { break };

            match joined? {
                Ok((idx, resolution)) => slots[idx] = Some(resolution),
                Err(e) => {
                    tasks.abort_all();
                    warn!(error = %e, "resolve.abort");
                    return Err(e);
                }
            }
        }

        let resolutions = slots
            .into_iter()
            .map(|s| s.ok_or_else(|| BridgeError::Task("resolution slot left empty".into())))
            .collect::<Result<Vec<_>, _>>()?;

        let matched = resolutions.iter().filter(|r| r.outcome.is_matched()).count();
        info!(tracks = resolutions.len(), matched, "resolve.done");
        Ok(resolutions)
    }

    async fn resolve_one(
        &self,
        source: Track,
        client: &dyn CatalogClient,
        creds: &Credentials,
        cancel: &CancellationToken
    ) -> Result<Resolution, BridgeError> {
        let key = normalize(&source.title, source.primary_artist());
        let query = key.query();
        if query.is_empty() {
            let outcome = Outcome::NoMatch { reason: NoMatchReason::NoCandidates };
            return Ok(Resolution::new(source, outcome, 0));
        }

        let limit = self.matching.search_limit;
        let (result, attempts) = with_retry_counted(&self.retry, cancel, "search_track", || {
            client.search_track(creds, &query, limit)
        }).await;

        let outcome = match result {
            Ok(candidates) => self.decide(&source, candidates),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(track = %source.id, attempts, error = %e, "resolve.track.failed");
                Outcome::Failed { kind: FailureKind::from_error(&e) }
            }
        };

        match &outcome {
            Outcome::Matched { track, score } => debug!(
                track = %source.id, target = %track.id, score, "resolve.track.matched"
            ),
            other => debug!(
                track = %source.id, key = %key, outcome = %other.describe(),
                "resolve.track.unmatched"
            )
        }
        Ok(Resolution::new(source, outcome, attempts))
    }

    fn decide(&self, source: &Track, candidates: Vec<Track>) -> Outcome {
        let ranked = self.scorer.rank(source, candidates);
        self.decide_ranked(&ranked)
    }

    /// Accepts the best candidate only when it clears the threshold and
    /// leads the runner-up by at least the margin
    pub fn decide_ranked(&self, ranked: &[CandidateMatch]) -> Outcome {
        let Some(best) = ranked.first() else {
            return Outcome::NoMatch { reason: NoMatchReason::NoCandidates };
        };
        if best.score < self.matching.accept_threshold {
            return Outcome::NoMatch { reason: NoMatchReason::LowConfidence };
        }
        let runner_up = ranked.get(1).map(|c| c.score).unwrap_or(0.0);
        if best.score - runner_up + MARGIN_EPSILON < self.matching.margin_threshold {
            return Outcome::NoMatch { reason: NoMatchReason::Ambiguous };
        }
        Outcome::Matched { track: best.track.clone(), score: best.score }
    }
}
