//! Word parser: turns raw text into a normalized token sequence.
//!
//! Two paths: a left-to-right state machine for alphabetic scripts and
//! a word-segmentation pass for CJK input. Tokens are casefolded,
//! accent-stripped where safe, NFC-normalized, optionally stemmed, and
//! flagged when they match the language's stopword table.

use crate::language::Language;
use std::collections::HashMap;
use std::sync::Arc;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use unicode_segmentation::UnicodeSegmentation;

// ---------------------------------------------------------------------------
// Codepoint classification
// ---------------------------------------------------------------------------

/// All-digit tokens shorter than this are never indexed.
pub const INDEX_NUMBER_MIN_LENGTH: usize = 6;

#[derive(Clone, Copy, PartialEq, Eq)]
enum CharClass {
    AsciiUpper,
    AsciiLower,
    Hyphen,
    Underscore,
    Num,
    AlphaUpper,
    AlphaLower,
    Ignore,
    Newline,
}

fn classify(c: char) -> CharClass {
    if c.is_ascii() {
        match c {
            'a'..='z' => CharClass::AsciiLower,
            'A'..='Z' => CharClass::AsciiUpper,
            '0'..='9' => CharClass::Num,
            '-' => CharClass::Hyphen,
            '_' => CharClass::Underscore,
            '\n' | '\r' => CharClass::Newline,
            _ => CharClass::Ignore,
        }
    } else if c.is_alphabetic() {
        if c.is_uppercase() {
            CharClass::AlphaUpper
        } else {
            CharClass::AlphaLower
        }
    } else if c.is_numeric() {
        CharClass::Num
    } else {
        CharClass::Ignore
    }
}

fn is_cjk(c: char) -> bool {
    let c = c as u32;
    (0x3400..=0x4DB5).contains(&c)
        || (0x4E00..=0x9FA5).contains(&c)
        || (0x20000..=0x2A6D6).contains(&c)
}

fn is_latin(c: char) -> bool {
    let c = c as u32;
    c <= 0x02AF || (0x1E00..=0x1EFF).contains(&c)
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Encoding {
    Ascii,
    Latin,
    Cjk,
    Other,
}

/// Detect the dominant encoding from the first 255 non-whitespace chars.
fn detect_encoding(text: &str) -> Encoding {
    let mut seen = 0;
    for c in text.chars() {
        if !c.is_whitespace() {
            seen += 1;
            if seen > 255 {
                break;
            }
        }
        if c.is_ascii() {
            continue;
        }
        if is_latin(c) {
            return Encoding::Latin;
        }
        if is_cjk(c) {
            return Encoding::Cjk;
        }
        return Encoding::Other;
    }
    Encoding::Ascii
}

/// True if any of the first 1024 non-whitespace chars needs the CJK
/// segmentation path.
fn needs_segmentation(text: &str) -> bool {
    let mut seen = 0;
    for c in text.chars() {
        if !c.is_whitespace() {
            seen += 1;
            if seen > 1024 {
                break;
            }
        }
        if is_cjk(c) {
            return true;
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Options and tokens
// ---------------------------------------------------------------------------

/// Per-reset parsing options.
#[derive(Clone, Copy, Debug)]
pub struct ParseOptions {
    /// Break words on `-` and `_`.
    pub delimit_words: bool,
    pub enable_stemmer: bool,
    pub enable_stop_words: bool,
    /// Let `or` and hyphen-initial tokens through for query parsing.
    pub parse_reserved_words: bool,
    /// Reject words starting with a digit (which drops all-digit words
    /// entirely).
    pub filter_numbers: bool,
    /// Minimum length for all-digit tokens; `None` keeps them all.
    pub index_numbers_min: Option<usize>,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            delimit_words: false,
            enable_stemmer: true,
            enable_stop_words: true,
            parse_reserved_words: false,
            filter_numbers: true,
            index_numbers_min: None,
        }
    }
}

/// One parsed token with its source extent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub word: String,
    /// 1-based position; stopwords do not advance it.
    pub position: usize,
    pub byte_start: usize,
    pub byte_end: usize,
    pub new_paragraph: bool,
    pub is_stopword: bool,
    pub length: usize,
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Restartable single-consumer tokenizer. `reset` rebinds it to new
/// input; no state survives outside the struct.
pub struct WordParser {
    language: Arc<Language>,
    max_word_length: usize,
    min_word_length: usize,

    text: String,
    options: ParseOptions,
    encoding: Encoding,
    /// Byte cursor into `text` for the state-machine path.
    cursor: usize,
    word_position: usize,
    /// Pre-computed (byte_start, byte_end) segments for the CJK path.
    segments: Vec<(usize, usize)>,
    segment_pos: usize,
    /// A newline was consumed since the last emitted token.
    pending_paragraph: bool,
}

impl WordParser {
    pub fn new(language: Arc<Language>, max_word_length: usize, min_word_length: usize) -> Self {
        assert!(min_word_length < max_word_length);
        Self {
            language,
            max_word_length,
            min_word_length,
            text: String::new(),
            options: ParseOptions::default(),
            encoding: Encoding::Ascii,
            cursor: 0,
            word_position: 0,
            segments: Vec::new(),
            segment_pos: 0,
            pending_paragraph: false,
        }
    }

    /// Bind the parser to new input, resetting position and cursor.
    pub fn reset(&mut self, text: &str, options: ParseOptions) {
        self.text = text.to_string();
        self.options = options;
        self.cursor = 0;
        self.word_position = 0;
        self.segments.clear();
        self.segment_pos = 0;
        self.pending_paragraph = false;
        self.encoding = detect_encoding(text);

        if needs_segmentation(text) {
            self.encoding = Encoding::Cjk;
            self.segments = self
                .text
                .split_word_bound_indices()
                .filter(|(_, seg)| seg.chars().any(|c| c.is_alphanumeric()))
                .map(|(start, seg)| (start, start + seg.len()))
                .collect();
        }
    }

    /// Produce the next token, or `None` at end of input.
    pub fn next_token(&mut self) -> Option<Token> {
        if self.encoding == Encoding::Cjk {
            self.next_segmented()
        } else {
            self.next_scanned()
        }
    }

    /// Collect every remaining token.
    pub fn tokens(&mut self) -> Vec<Token> {
        let mut out = Vec::new();
        while let Some(t) = self.next_token() {
            out.push(t);
        }
        out
    }

    // -- CJK path -----------------------------------------------------------

    fn next_segmented(&mut self) -> Option<Token> {
        while self.segment_pos < self.segments.len() {
            let (start, end) = self.segments[self.segment_pos];
            self.segment_pos += 1;

            // Paragraph break when raw text since the last segment held a newline
            let gap_start = if self.segment_pos >= 2 {
                self.segments[self.segment_pos - 2].1
            } else {
                0
            };
            let new_paragraph = self.text[gap_start..start].contains('\n');

            let segment = &self.text[start..end];
            let folded: String = segment.to_lowercase().nfc().collect();
            if folded.is_empty() {
                continue;
            }

            // CJK segments skip stemming and stopword treatment
            self.word_position += 1;
            let length = folded.chars().count();
            return Some(Token {
                word: folded,
                position: self.word_position,
                byte_start: start,
                byte_end: end,
                new_paragraph,
                is_stopword: false,
                length,
            });
        }
        None
    }

    // -- State-machine path -------------------------------------------------

    fn next_scanned(&mut self) -> Option<Token> {
        let (raw, info) = self.scan_word()?;
        let processed = process_word(&raw, info.do_strip, &self.language, self.options);
        let length = processed.chars().count();

        let is_stopword = self.options.enable_stop_words && self.language.is_stop_word(&processed);
        if !is_stopword {
            self.word_position += 1;
        }

        Some(Token {
            word: processed,
            position: self.word_position,
            byte_start: info.byte_start,
            byte_end: info.byte_end,
            new_paragraph: info.new_paragraph,
            is_stopword,
            length,
        })
    }

    fn scan_word(&mut self) -> Option<(String, ScanInfo)> {
        let text = std::mem::take(&mut self.text);
        let mut state = ScanState::default();
        let mut emitted: Option<(usize, usize)> = None;

        for (offset, c) in text[self.cursor..].char_indices() {
            let idx = self.cursor + offset;
            let class = classify(c);

            if class == CharClass::Newline {
                self.pending_paragraph = true;
            }

            let breaks = matches!(class, CharClass::Ignore | CharClass::Newline)
                || (self.options.delimit_words
                    && matches!(class, CharClass::Hyphen | CharClass::Underscore));

            if breaks {
                let Some(start) = state.start else {
                    // A break always clears any invalid-word run
                    self.pending_paragraph |= state.paragraph;
                    state = ScanState::default();
                    continue;
                };
                if self.keeps(&state) {
                    emitted = Some((start, idx));
                    // Resume after the break character
                    self.cursor = idx + c.len_utf8();
                    break;
                }
                // Skipped word: hand its paragraph flag to the next one
                self.pending_paragraph |= state.paragraph;
                state = ScanState::default();
                continue;
            }

            if !state.valid {
                continue;
            }

            if state.start.is_none() {
                state.start = Some(idx);
                state.paragraph = std::mem::take(&mut self.pending_paragraph);
                if class == CharClass::Num && self.options.filter_numbers {
                    state.valid = false;
                    state.start = None;
                    continue;
                }
                if class == CharClass::Hyphen {
                    state.valid = self.options.parse_reserved_words;
                    state.start = None;
                    continue;
                }
            }

            if state.length >= self.max_word_length {
                continue;
            }
            state.push(c, class);
        }

        let (start, end) = match emitted {
            Some(extent) => extent,
            None => {
                // Ran off the end of input
                self.cursor = text.len();
                let start = state.start;
                if start.is_none() || !self.keeps(&state) {
                    self.text = text;
                    return None;
                }
                (start.unwrap_or(0), text.len())
            }
        };

        self.text = text;
        Some((
            std::mem::take(&mut state.word),
            ScanInfo {
                byte_start: start,
                byte_end: end,
                new_paragraph: state.paragraph,
                do_strip: state.do_strip,
            },
        ))
    }

    /// Decide whether a completed word survives the validity and length
    /// rules for the active options.
    fn keeps(&self, state: &ScanState) -> bool {
        if !state.valid || state.length == 0 {
            return false;
        }
        if self.options.parse_reserved_words && state.word == "or" {
            return true;
        }
        match state.word_type {
            // Digit-initial words never got this far with filter_numbers on
            WordType::Num => match self.options.index_numbers_min {
                Some(min) => state.length >= min,
                None => true,
            },
            _ => state.length >= self.min_word_length,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WordType {
    None,
    Alpha,
    Num,
    AlphaNum,
}

struct ScanState {
    word: String,
    word_type: WordType,
    valid: bool,
    do_strip: bool,
    paragraph: bool,
    length: usize,
    start: Option<usize>,
}

impl Default for ScanState {
    fn default() -> Self {
        Self {
            word: String::new(),
            word_type: WordType::None,
            valid: true,
            do_strip: false,
            paragraph: false,
            length: 0,
            start: None,
        }
    }
}

impl ScanState {
    fn push(&mut self, c: char, class: CharClass) {
        self.length += 1;
        let folded = match class {
            CharClass::AsciiUpper => {
                self.merge_alpha();
                ((c as u8) + 32) as char
            }
            CharClass::AsciiLower | CharClass::Hyphen | CharClass::Underscore => {
                self.merge_alpha();
                c
            }
            CharClass::Num => {
                self.word_type = match self.word_type {
                    WordType::Alpha | WordType::AlphaNum => WordType::AlphaNum,
                    _ => WordType::Num,
                };
                c
            }
            CharClass::AlphaUpper => {
                self.do_strip = true;
                self.merge_alpha();
                c.to_lowercase().next().unwrap_or(c)
            }
            CharClass::AlphaLower => {
                self.do_strip = true;
                self.merge_alpha();
                c
            }
            CharClass::Ignore | CharClass::Newline => return,
        };
        self.word.push(folded);
    }

    fn merge_alpha(&mut self) {
        self.word_type = match self.word_type {
            WordType::Num | WordType::AlphaNum => WordType::AlphaNum,
            _ => WordType::Alpha,
        };
    }
}

struct ScanInfo {
    byte_start: usize,
    byte_end: usize,
    new_paragraph: bool,
    do_strip: bool,
}

/// Strip Latin accents, NFC-normalize, and stem one raw word.
fn process_word(raw: &str, do_strip: bool, language: &Language, options: ParseOptions) -> String {
    let stripped: String = if do_strip && detect_encoding(raw) == Encoding::Latin {
        raw.nfd().filter(|c| !is_combining_mark(*c)).collect()
    } else {
        raw.to_string()
    };
    let normalized: String = stripped.nfc().collect();
    if options.enable_stemmer {
        language.stem(&normalized).into_owned()
    } else {
        normalized
    }
}

// ---------------------------------------------------------------------------
// Counting helpers
// ---------------------------------------------------------------------------

/// Accumulate weighted term frequencies into `counts`, stopping once the
/// table grows past `max_words`. Returns false when the cap was hit.
pub fn text_to_counts(
    counts: &mut HashMap<String, u32>,
    text: &str,
    weight: u32,
    language: &Arc<Language>,
    max_words: u32,
    max_word_length: usize,
    min_word_length: usize,
    filter_words: bool,
    delimit_words: bool,
) -> bool {
    if text.is_empty() || weight == 0 {
        return true;
    }
    let mut parser = WordParser::new(Arc::clone(language), max_word_length, min_word_length);
    parser.reset(
        text,
        ParseOptions {
            delimit_words,
            enable_stemmer: true,
            enable_stop_words: filter_words,
            parse_reserved_words: false,
            filter_numbers: filter_words,
            index_numbers_min: Some(INDEX_NUMBER_MIN_LENGTH),
        },
    );

    let mut total = counts.len() as u32;
    while let Some(token) = parser.next_token() {
        if token.is_stopword {
            continue;
        }
        total += 1;
        if max_words > 0 && total > max_words {
            return false;
        }
        *counts.entry(token.word).or_insert(0) += weight;
    }
    true
}

/// Reduce text to a space-joined string of processed tokens, suitable
/// for storing as an indexable property value.
pub fn text_to_index_string(
    text: &str,
    language: &Arc<Language>,
    max_word_length: usize,
    min_word_length: usize,
    filter_words: bool,
    delimit_words: bool,
) -> String {
    let mut parser = WordParser::new(Arc::clone(language), max_word_length, min_word_length);
    parser.reset(
        text,
        ParseOptions {
            delimit_words,
            enable_stemmer: true,
            enable_stop_words: filter_words,
            parse_reserved_words: false,
            filter_numbers: false,
            index_numbers_min: Some(INDEX_NUMBER_MIN_LENGTH),
        },
    );

    let mut out = String::new();
    while let Some(token) = parser.next_token() {
        if token.is_stopword {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&token.word);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser(stemming: bool) -> WordParser {
        let lang = Arc::new(Language::new("en", stemming));
        WordParser::new(lang, 30, 3)
    }

    fn opts() -> ParseOptions {
        ParseOptions { enable_stemmer: false, enable_stop_words: false, ..Default::default() }
    }

    #[test]
    fn ascii_words_are_folded() {
        let mut p = parser(false);
        p.reset("Hello World", opts());
        let words: Vec<String> = p.tokens().into_iter().map(|t| t.word).collect();
        assert_eq!(words, ["hello", "world"]);
    }

    #[test]
    fn ascii_round_trip_concat() {
        // concat(tokens) == casefold(input) for plain ASCII words
        let input = "Alpha Beta GAMMA delta";
        let mut p = parser(false);
        p.reset(input, opts());
        let joined: Vec<String> = p.tokens().into_iter().map(|t| t.word).collect();
        assert_eq!(joined.join(" "), input.to_lowercase());
    }

    #[test]
    fn short_words_are_dropped() {
        let mut p = parser(false);
        p.reset("an ox jumped", opts());
        let words: Vec<String> = p.tokens().into_iter().map(|t| t.word).collect();
        assert_eq!(words, ["jumped"]);
    }

    #[test]
    fn digit_initial_words_are_rejected() {
        let mut p = parser(false);
        p.reset("4ever young 12345", opts());
        let words: Vec<String> = p.tokens().into_iter().map(|t| t.word).collect();
        assert_eq!(words, ["young"]);
    }

    #[test]
    fn long_numbers_kept_when_not_filtered() {
        let mut p = parser(false);
        let o = ParseOptions {
            filter_numbers: false,
            index_numbers_min: Some(INDEX_NUMBER_MIN_LENGTH),
            ..opts()
        };
        p.reset("12345 123456 word", o);
        let words: Vec<String> = p.tokens().into_iter().map(|t| t.word).collect();
        assert_eq!(words, ["123456", "word"]);
    }

    #[test]
    fn hyphen_delimits_when_enabled() {
        let mut p = parser(false);
        p.reset("real-time", ParseOptions { delimit_words: true, ..opts() });
        let words: Vec<String> = p.tokens().into_iter().map(|t| t.word).collect();
        assert_eq!(words, ["real", "time"]);

        p.reset("real-time", opts());
        let words: Vec<String> = p.tokens().into_iter().map(|t| t.word).collect();
        assert_eq!(words, ["real-time"]);
    }

    #[test]
    fn max_length_truncates() {
        let lang = Arc::new(Language::new("en", false));
        let mut p = WordParser::new(lang, 5, 2);
        p.reset("abcdefghij tail", opts());
        let words: Vec<String> = p.tokens().into_iter().map(|t| t.word).collect();
        assert_eq!(words, ["abcde", "tail"]);
    }

    #[test]
    fn accents_are_stripped_from_latin() {
        let mut p = parser(false);
        p.reset("café résumé", opts());
        let words: Vec<String> = p.tokens().into_iter().map(|t| t.word).collect();
        assert_eq!(words, ["cafe", "resume"]);
    }

    #[test]
    fn stemming_applies_when_enabled() {
        let mut p = parser(true);
        p.reset(
            "running quickly",
            ParseOptions { enable_stemmer: true, enable_stop_words: false, ..Default::default() },
        );
        let words: Vec<String> = p.tokens().into_iter().map(|t| t.word).collect();
        assert_eq!(words, ["run", "quick"]);
    }

    #[test]
    fn stopwords_flagged_but_emitted() {
        let mut p = parser(false);
        p.reset(
            "the ferret",
            ParseOptions { enable_stemmer: false, enable_stop_words: true, ..Default::default() },
        );
        let tokens = p.tokens();
        assert_eq!(tokens.len(), 2);
        assert!(tokens[0].is_stopword);
        assert!(!tokens[1].is_stopword);
        // Stopwords do not advance the position counter
        assert_eq!(tokens[1].position, 1);
    }

    #[test]
    fn newline_marks_paragraph() {
        let mut p = parser(false);
        p.reset("first\nsecond", opts());
        let tokens = p.tokens();
        assert!(!tokens[0].new_paragraph);
        assert!(tokens[1].new_paragraph);
    }

    #[test]
    fn cjk_path_segments_and_folds() {
        let mut p = parser(false);
        p.reset("漢字 and 日本語", opts());
        let tokens = p.tokens();
        assert!(!tokens.is_empty());
        for t in &tokens {
            assert!(!t.is_stopword);
            assert!(!t.word.is_empty());
        }
    }

    #[test]
    fn byte_offsets_slice_the_source() {
        let input = "alpha beta";
        let mut p = parser(false);
        p.reset(input, opts());
        for t in p.tokens() {
            assert_eq!(&input[t.byte_start..t.byte_end], t.word);
        }
    }

    #[test]
    fn reset_restarts_cleanly() {
        let mut p = parser(false);
        p.reset("one two three", opts());
        let _ = p.next_token();
        p.reset("fresh start", opts());
        let words: Vec<String> = p.tokens().into_iter().map(|t| t.word).collect();
        assert_eq!(words, ["fresh", "start"]);
    }

    #[test]
    fn reserved_or_passes_in_query_mode() {
        let mut p = parser(false);
        p.reset("cats or dogs", ParseOptions { parse_reserved_words: true, ..opts() });
        let words: Vec<String> = p.tokens().into_iter().map(|t| t.word).collect();
        assert_eq!(words, ["cats", "or", "dogs"]);
    }

    #[test]
    fn counts_accumulate_with_weight() {
        let lang = Arc::new(Language::new("en", false));
        let mut counts = HashMap::new();
        text_to_counts(&mut counts, "apple banana apple", 3, &lang, 0, 30, 3, false, false);
        assert_eq!(counts["apple"], 6);
        assert_eq!(counts["banana"], 3);
    }

    #[test]
    fn counts_stop_at_word_cap() {
        let lang = Arc::new(Language::new("en", false));
        let mut counts = HashMap::new();
        let text = (0..100).map(|i| format!("word{i:03}")).collect::<Vec<_>>().join(" ");
        let complete = text_to_counts(&mut counts, &text, 1, &lang, 10, 30, 3, false, false);
        assert!(!complete);
        assert!(counts.len() <= 10);
    }

    #[test]
    fn index_string_joins_processed_tokens() {
        let lang = Arc::new(Language::new("en", false));
        let s = text_to_index_string("Hello, World!", &lang, 30, 3, false, false);
        assert_eq!(s, "hello world");
    }
}
