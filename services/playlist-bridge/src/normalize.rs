//!
//! src/normalize.rs
//!
//! Reduces title/artist metadata to a comparable key. Pure and total,
//! the key is a matching aid and never an identity
//!

use std::{fmt, sync::LazyLock};

use regex::Regex;
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

/// Marketing noise that catalogs append to titles
const STOPLIST: [&str; 9] = [
    "official", "video", "lyrics", "lyric", "hd", "hq",
    "remastered", "remaster", "audio"
];

static BRACKETED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\(\[\{][^\)\]\}]*[\)\]\}]").expect("static regex")
});

/// Everything from one of these tokens onward is a guest credit
const FEATURING: [&str; 3] = ["feat", "ft", "featuring"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedKey {
    artist: String,
    title: String
}

impl NormalizedKey {
    /// Free-text query handed to a catalog search
    pub fn query(&self) -> String {
        match (self.title.is_empty(), self.artist.is_empty()) {
            (false, false) => format!("{} {}", self.title, self.artist),
            (false, true) => self.title.clone(),
            (true, _) => self.artist.clone()
        }
    }
}

impl fmt::Display for NormalizedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.artist, self.title)
    }
}

pub fn normalize(title: &str, artist: &str) -> NormalizedKey {
    NormalizedKey {
        artist: normalize_field(artist),
        title: normalize_field(title)
    }
}

/// Normalizes a single title or artist string
pub fn normalize_field(raw: &str) -> String {
    let folded = fold(raw);
    let unbracketed = BRACKETED.replace_all(&folded, " ");

    let reduced = reduce(tokens(&unbracketed).collect());
    if !reduced.is_empty() {
        return reduced;
    }
    // the whole field was bracketed, e.g. "(Intro)"
    reduce(tokens(&folded).collect())
}

/// Cuts guest credits and drops noise. Falls back to the uncut
/// words rather than returning nothing, which keeps the result
/// a fixed point of `normalize_field`
fn reduce(words: Vec<&str>) -> String {
    let cut = words.iter()
        .position(|w| FEATURING.contains(w))
        .unwrap_or(words.len());
    let head = &words[..cut];

    let clean: Vec<&str> = head.iter()
        .copied()
        .filter(|w| !STOPLIST.contains(w))
        .collect();

    if !clean.is_empty() {
        clean.join(" ")
    } else if !head.is_empty() {
        head.join(" ")
    } else {
        words.join(" ")
    }
}

/// Compatibility-decomposed with combining marks dropped, then
/// lowercased. Case folding can emit marks again, so strip once more
fn fold(raw: &str) -> String {
    let stripped: String = raw.trim()
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect();
    stripped
        .to_lowercase()
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect()
}

/// Alphanumeric runs; punctuation and apostrophes act as separators
fn tokens(s: &str) -> impl Iterator<Item = &str> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
}
