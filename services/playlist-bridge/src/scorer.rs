//!
//! src/scorer.rs
//!
//! Scores how likely a catalog candidate is the same recording as a
//! source track. Title and artist are compared on their normalized
//! forms, duration only when both sides know it
//!

use std::collections::HashSet;

use crate::config::MatchingConfig;
use crate::normalize::normalize_field;
use crate::types::{CandidateMatch, Track};

const TITLE_WEIGHT: f64 = 0.45;
const ARTIST_WEIGHT: f64 = 0.35;
const DURATION_WEIGHT: f64 = 0.20;

#[derive(Debug, Clone)]
pub struct MatchScorer {
    full_credit_secs: u32,
    zero_credit_secs: u32
}

impl MatchScorer {
    pub fn new(cfg: &MatchingConfig) -> Self {
        Self {
            full_credit_secs: cfg.duration_full_credit_secs,
            zero_credit_secs: cfg.duration_zero_credit_secs
        }
    }

    /// Score in [0, 1]; symmetric in its arguments
    pub fn score(&self, source: &Track, candidate: &Track) -> f64 {
        let title = text_similarity(
            &normalize_field(&source.title),
            &normalize_field(&candidate.title)
        );
        let artist = artist_similarity(&source.artists, &candidate.artists);

        let (mut total, mut weight) = (
            TITLE_WEIGHT * title + ARTIST_WEIGHT * artist,
            TITLE_WEIGHT + ARTIST_WEIGHT
        );
        if let (Some(a), Some(b)) = (source.duration_secs, candidate.duration_secs) {
            total += DURATION_WEIGHT * self.duration_similarity(a, b);
            weight += DURATION_WEIGHT;
        }
        (total / weight).clamp(0.0, 1.0)
    }

    /// Scores every candidate, best first. Repeated target IDs keep
    /// their best score only, so a catalog echoing the same track
    /// twice cannot manufacture a near-tie
    pub fn rank(&self, source: &Track, candidates: Vec<Track>) -> Vec<CandidateMatch> {
        let mut ranked: Vec<CandidateMatch> = candidates
            .into_iter()
            .map(|track| {
                let score = self.score(source, &track);
                CandidateMatch { track, score }
            })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut seen = HashSet::new();
        ranked.retain(|c| seen.insert(c.track.id.clone()));
        ranked
    }

    fn duration_similarity(&self, a: u32, b: u32) -> f64 {
        let diff = a.abs_diff(b);
        if diff <= self.full_credit_secs {
            return 1.0;
        }
        if diff >= self.zero_credit_secs {
            return 0.0;
        }
        let span = f64::from(self.zero_credit_secs - self.full_credit_secs);
        1.0 - f64::from(diff - self.full_credit_secs) / span
    }
}

/// Best pairing across both artist lists; catalogs order
/// collaborators differently
fn artist_similarity(a: &[String], b: &[String]) -> f64 {
    let a: Vec<String> = a.iter().map(|s| normalize_field(s)).collect();
    let b: Vec<String> = b.iter().map(|s| normalize_field(s)).collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    a.iter()
        .flat_map(|x| b.iter().map(move |y| text_similarity(x, y)))
        .fold(0.0, f64::max)
}

/// Mean of word-level overlap and character-level edit similarity
pub fn text_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    0.5 * token_overlap(a, b) + 0.5 * strsim::normalized_levenshtein(a, b)
}

/// Sørensen–Dice coefficient over word sets
fn token_overlap(a: &str, b: &str) -> f64 {
    let a: HashSet<&str> = a.split_whitespace().collect();
    let b: HashSet<&str> = b.split_whitespace().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let shared = a.intersection(&b).count() as f64;
    2.0 * shared / (a.len() + b.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Platform;

    fn track(title: &str, artist: &str, duration: Option<u32>) -> Track {
        Track {
            platform: Platform::Spotify,
            id: format!("{artist}-{title}"),
            title: title.to_string(),
            artists: vec![artist.to_string()],
            album: None,
            duration_secs: duration,
            url: String::new()
        }
    }

    fn scorer() -> MatchScorer {
        MatchScorer::new(&MatchingConfig::default())
    }

    #[test]
    fn identical_tracks_score_one() {
        let a = track("Bohemian Rhapsody", "Queen", Some(354));
        assert_eq!(scorer().score(&a, &a.clone()), 1.0);

        let b = track("Bohemian Rhapsody", "Queen", None);
        assert_eq!(scorer().score(&b, &b.clone()), 1.0);
    }

    #[test]
    fn noise_does_not_cost_score() {
        let a = track("Bohemian Rhapsody", "Queen", Some(354));
        let b = track("Bohemian Rhapsody (Official Video) [HD]", "QUEEN", Some(356));
        assert_eq!(scorer().score(&a, &b), 1.0);
    }

    #[test]
    fn score_is_symmetric() {
        let pairs = [
            (track("Hello", "Adele", Some(295)), track("Hello (Live)", "Adele", Some(310))),
            (track("Yesterday", "The Beatles", None), track("Yesterday", "Beatles", Some(125))),
            (track("Alpha", "X", Some(100)), track("Omega", "Y", Some(300))),
        ];
        for (a, b) in pairs {
            assert_eq!(scorer().score(&a, &b), scorer().score(&b, &a));
        }
    }

    #[test]
    fn score_decreases_with_title_edit_distance() {
        let source = track("abcdefgh", "Artist", Some(200));
        let edits = ["abcdefgh", "abcdefgx", "abcdefxx", "abcdexxx", "abcdxxxx", "xxxxxxxx"];
        let scores: Vec<f64> = edits.iter()
            .map(|t| scorer().score(&source, &track(t, "Artist", Some(200))))
            .collect();
        for pair in scores.windows(2) {
            assert!(pair[0] > pair[1], "scores not strictly decreasing: {scores:?}");
        }
    }

    #[test]
    fn duration_credit_is_linear_between_windows() {
        let s = scorer();
        assert_eq!(s.duration_similarity(200, 203), 1.0);
        assert_eq!(s.duration_similarity(200, 215), 0.0);
        assert_eq!(s.duration_similarity(230, 200), 0.0);
        assert!((s.duration_similarity(200, 209) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn unknown_duration_is_excluded_not_penalised() {
        let a = track("Song", "Band", None);
        let b = track("Song", "Band", Some(10));
        assert_eq!(scorer().score(&a, &b), 1.0);

        let far = track("Song", "Band", Some(500));
        let near = track("Song", "Band", Some(12));
        assert!(scorer().score(&b, &far) < scorer().score(&b, &near));
    }

    #[test]
    fn collaborator_order_does_not_matter() {
        let mut a = track("Under Pressure", "Queen", Some(248));
        a.artists.push("David Bowie".into());
        let mut b = track("Under Pressure", "David Bowie", Some(248));
        b.artists.push("Queen".into());
        assert_eq!(scorer().score(&a, &b), 1.0);
    }

    #[test]
    fn rank_sorts_and_dedupes() {
        let source = track("Song", "Band", Some(200));
        let good = track("Song", "Band", Some(200));
        let bad = track("Other Thing", "Someone", Some(100));
        let ranked = scorer().rank(&source, vec![bad.clone(), good.clone(), good.clone()]);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].track.id, good.id);
        assert!(ranked[0].score > ranked[1].score);
    }
}
