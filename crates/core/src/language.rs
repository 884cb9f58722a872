//! Language support: stopword tables and Snowball stemming.
//!
//! Stopword lists are loaded from per-language files in a share
//! directory when present; English has a built-in fallback so a bare
//! installation still flags the most common noise words.

use rust_stemmers::{Algorithm, Stemmer};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, warn};

/// Supported language codes and their Snowball algorithms. Unknown
/// codes disable stemming but leave tokenization untouched.
const LANGUAGES: &[(&str, Algorithm)] = &[
    ("da", Algorithm::Danish),
    ("nl", Algorithm::Dutch),
    ("en", Algorithm::English),
    ("fi", Algorithm::Finnish),
    ("fr", Algorithm::French),
    ("de", Algorithm::German),
    ("hu", Algorithm::Hungarian),
    ("it", Algorithm::Italian),
    ("nb", Algorithm::Norwegian),
    ("pt", Algorithm::Portuguese),
    ("ru", Algorithm::Russian),
    ("es", Algorithm::Spanish),
    ("sv", Algorithm::Swedish),
];

const BUILTIN_EN_STOPWORDS: &str = "a about after all also an and any are as at be because been \
before but by can could did do does for from had has have he her his how i if in into is it its \
just like me more most my no not of on one only or other our out over she so some such than that \
the their them then there these they this to up was we were what when where which who will with \
would you your";

fn algorithm_for(code: &str) -> Option<Algorithm> {
    LANGUAGES
        .iter()
        .find(|(c, _)| code.starts_with(c))
        .map(|(_, a)| *a)
}

/// Per-language tokenization support shared by the indexer and request
/// threads. Immutable after construction.
pub struct Language {
    code: String,
    stop_words: HashSet<String>,
    stemmer: Option<Stemmer>,
}

impl Language {
    /// Build language support for `code`, falling back to English when
    /// the code is empty.
    pub fn new(code: &str, enable_stemmer: bool) -> Self {
        Self::with_stopword_dir(code, enable_stemmer, None)
    }

    pub fn with_stopword_dir(code: &str, enable_stemmer: bool, dir: Option<&Path>) -> Self {
        let code = if code.is_empty() { "en" } else { code };
        let stemmer = if enable_stemmer {
            match algorithm_for(code) {
                Some(algorithm) => Some(Stemmer::create(algorithm)),
                None => {
                    warn!(language = code, "no stemmer for language, stemming disabled");
                    None
                }
            }
        } else {
            None
        };

        let mut stop_words = HashSet::new();
        if let Some(dir) = dir {
            let path = dir.join(format!(".{code}"));
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    stop_words = content.split_whitespace().map(str::to_string).collect();
                    debug!(language = code, words = stop_words.len(), "loaded stopword table");
                }
                Err(e) => {
                    warn!(language = code, path = %path.display(), error = %e, "no stopword file");
                }
            }
        }
        if stop_words.is_empty() && code.starts_with("en") {
            stop_words = BUILTIN_EN_STOPWORDS
                .split_whitespace()
                .map(str::to_string)
                .collect();
        }

        // Stopwords are matched post-stemming, so stem the table too
        let stop_words = match &stemmer {
            Some(s) => stop_words.iter().map(|w| s.stem(w).to_string()).collect(),
            None => stop_words,
        };

        Self { code: code.to_string(), stop_words, stemmer }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn has_stemmer(&self) -> bool {
        self.stemmer.is_some()
    }

    /// Stem a word, returning it unchanged when no stemmer is active.
    pub fn stem<'a>(&self, word: &'a str) -> std::borrow::Cow<'a, str> {
        match &self.stemmer {
            Some(s) => s.stem(word),
            None => std::borrow::Cow::Borrowed(word),
        }
    }

    pub fn is_stop_word(&self, word: &str) -> bool {
        self.stop_words.contains(word)
    }
}
