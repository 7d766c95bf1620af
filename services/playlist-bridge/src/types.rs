//!
//! src/types.rs
//!
//! Value types shared by the resolution pipeline, the orchestrator
//! and the reconciler
//!

use std::{collections::HashSet, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Spotify,
    YouTube
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Spotify => "spotify",
            Platform::YouTube => "youtube"
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Spotify => write!(f, "Spotify"),
            Platform::YouTube => write!(f, "YouTube")
        }
    }
}

impl FromStr for Platform {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spotify" => Ok(Platform::Spotify),
            "youtube" | "yt" => Ok(Platform::YouTube),
            other => Err(BridgeError::Config(format!("unknown platform: {other}")))
        }
    }
}

/// A track as one catalog describes it. Two values from different
/// platforms are only ever related through a `Resolution`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub platform: Platform,
    pub id: String,
    pub title: String,
    pub artists: Vec<String>,
    pub album: Option<String>,
    pub duration_secs: Option<u32>,
    pub url: String
}

impl Track {
    pub fn primary_artist(&self) -> &str {
        self.artists
            .first()
            .map(String::as_str)
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateMatch {
    pub track: Track,
    pub score: f64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoMatchReason {
    Ambiguous,
    LowConfidence,
    NoCandidates
}

impl NoMatchReason {
    pub fn as_str(self) -> &'static str {
        match self {
            NoMatchReason::Ambiguous => "ambiguous",
            NoMatchReason::LowConfidence => "low-confidence",
            NoMatchReason::NoCandidates => "no-candidates"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Transient,
    NotFound,
    Rejected
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::NotFound => "not-found",
            FailureKind::Rejected => "rejected"
        }
    }

    /// Per-track failure kind for an error that does not abort the run
    pub fn from_error(e: &BridgeError) -> Self {
        match e {
            BridgeError::TransientNetwork(_) => FailureKind::Transient,
            BridgeError::NotFound(_) => FailureKind::NotFound,
            _ => FailureKind::Rejected
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum Outcome {
    Matched { track: Track, score: f64 },
    NoMatch { reason: NoMatchReason },
    Failed { kind: FailureKind }
}

impl Outcome {
    pub fn is_matched(&self) -> bool {
        matches!(self, Outcome::Matched { .. })
    }

    pub fn target_id(&self) -> Option<&str> {
        match self {
            Outcome::Matched { track, .. } => Some(track.id.as_str()),
            _ => None
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Outcome::Matched { score, .. } => format!("matched ({score:.2})"),
            Outcome::NoMatch { reason } => format!("no-match: {}", reason.as_str()),
            Outcome::Failed { kind } => format!("failed: {}", kind.as_str())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub source: Track,
    pub outcome: Outcome,
    pub attempted_at: DateTime<Utc>,
    pub attempts: u32
}

impl Resolution {
    pub fn new(source: Track, outcome: Outcome, attempts: u32) -> Self {
        Self { source, outcome, attempted_at: Utc::now(), attempts }
    }

    /// Same source track and same outcome, timestamps ignored
    #[cfg(test)]
    pub fn same_content(&self, other: &Resolution) -> bool {
        self.source.id == other.source.id && self.outcome == other.outcome
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistMapping {
    pub source_playlist_id: String,
    pub source_platform: Platform,
    pub target_platform: Platform,
    pub target_playlist_id: String,
    pub resolutions: Vec<Resolution>,
    pub pending_removals: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>
}

impl PlaylistMapping {
    /// Target IDs currently placed on the target playlist by this mapping
    pub fn matched_target_ids(&self) -> HashSet<&str> {
        self.resolutions
            .iter()
            .filter_map(|r| r.outcome.target_id())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmatchedTrack {
    pub source_id: String,
    pub title: String,
    pub artist: String,
    pub reason: String
}

/// Summary of one convert or sync run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionResult {
    pub target_playlist_id: String,
    pub matched: usize,
    pub no_match: usize,
    pub failed: usize,
    pub added: usize,
    pub removed: usize,
    pub unmatched: Vec<UnmatchedTrack>
}

impl ConversionResult {
    /// Recomputes the per-track tallies from a stored mapping
    pub fn from_mapping(mapping: &PlaylistMapping) -> Self {
        let mut result = Self {
            target_playlist_id: mapping.target_playlist_id.clone(),
            matched: 0,
            no_match: 0,
            failed: 0,
            added: 0,
            removed: 0,
            unmatched: Vec::new()
        };
        for r in &mapping.resolutions {
            match &r.outcome {
                Outcome::Matched { .. } => { result.matched += 1; continue; }
                Outcome::NoMatch { .. } => result.no_match += 1,
                Outcome::Failed { .. } => result.failed += 1
            }
            result.unmatched.push(UnmatchedTrack {
                source_id: r.source.id.clone(),
                title: r.source.title.clone(),
                artist: r.source.primary_artist().to_string(),
                reason: r.outcome.describe()
            });
        }
        result
    }

    pub fn total(&self) -> usize {
        self.matched + self.no_match + self.failed
    }

    pub fn payload(&self) -> ConversionPayload {
        let message = format!(
            "matched {} of {} tracks ({} without a match, {} failed); {} added, {} removed",
            self.matched, self.total(), self.no_match, self.failed, self.added, self.removed
        );
        ConversionPayload {
            converted_songs: self.matched,
            failed_songs: self.unmatched.iter().map(|u| u.source_id.clone()).collect(),
            success: true,
            new_playlist_id: self.target_playlist_id.clone(),
            message
        }
    }
}

/// What the outward request layer hands back to its caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionPayload {
    pub converted_songs: usize,
    pub failed_songs: Vec<String>,
    pub success: bool,
    #[serde(rename = "newPlaylistID")]
    pub new_playlist_id: String,
    pub message: String
}
