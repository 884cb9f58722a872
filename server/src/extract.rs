//! Pluggable content extraction.
//!
//! Extractors are black boxes `(path, mime) → (text, metadata)`; the
//! registry picks the first one claiming the mime type. The built-in
//! plain-text extractor covers text mimes with a NUL-scan binary check
//! and a read cap; format-specific extractors register alongside it.

use std::fs;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// Largest slice of a file an extractor will read into memory.
pub const MAX_EXTRACT_BYTES: u64 = 512 * 1024;

/// What an extractor produced for one file.
#[derive(Default)]
pub struct Extraction {
    pub text: Option<String>,
    pub metadata: Vec<(String, String)>,
    /// Embedded payloads (mail attachments, archive members) queued
    /// for their own extraction pass.
    pub attachments: Vec<Vec<u8>>,
}

/// A per-format extractor. Implementations must be pure: no global
/// state, same output for the same input.
pub trait Extractor: Send + Sync {
    fn handles(&self, mime: &str) -> bool;
    fn extract(&self, path: &Path, mime: &str) -> std::io::Result<Extraction>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct ExtractorRegistry {
    extractors: Vec<Box<dyn Extractor>>,
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        let mut registry = Self { extractors: Vec::new() };
        registry.register(Box::new(PlainTextExtractor { max_bytes: MAX_EXTRACT_BYTES }));
        registry
    }
}

impl ExtractorRegistry {
    pub fn register(&mut self, extractor: Box<dyn Extractor>) {
        self.extractors.push(extractor);
    }

    /// Run the first matching extractor; `None` when no extractor
    /// claims the mime type.
    pub fn extract(&self, path: &Path, mime: &str) -> Option<std::io::Result<Extraction>> {
        let extractor = self.extractors.iter().find(|e| e.handles(mime))?;
        Some(extractor.extract(path, mime))
    }
}

// ---------------------------------------------------------------------------
// Plain text
// ---------------------------------------------------------------------------

/// Check the first 8 KiB for NUL bytes; binary files yield no text.
fn looks_like_text(path: &Path) -> bool {
    let Ok(mut file) = fs::File::open(path) else {
        return false;
    };
    let mut buf = [0u8; 8192];
    let Ok(n) = file.read(&mut buf) else {
        return false;
    };
    !buf[..n].contains(&0)
}

struct PlainTextExtractor {
    max_bytes: u64,
}

impl Extractor for PlainTextExtractor {
    fn handles(&self, mime: &str) -> bool {
        mime.starts_with("text/") || mime == "application/xml"
    }

    fn extract(&self, path: &Path, _mime: &str) -> std::io::Result<Extraction> {
        if !looks_like_text(path) {
            debug!(path = %path.display(), "binary content behind a text mime, skipping text");
            return Ok(Extraction::default());
        }
        let file = fs::File::open(path)?;
        let mut buf = Vec::new();
        file.take(self.max_bytes).read_to_end(&mut buf)?;
        let text = String::from_utf8_lossy(&buf).into_owned();
        let lines = text.lines().count();
        Ok(Extraction {
            text: Some(text),
            metadata: vec![("Text:LineCount".to_string(), lines.to_string())],
            attachments: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn plain_text_is_extracted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "hello\nworld\n").unwrap();

        let registry = ExtractorRegistry::default();
        let extraction = registry.extract(&path, "text/plain").unwrap().unwrap();
        assert_eq!(extraction.text.as_deref(), Some("hello\nworld\n"));
        assert_eq!(extraction.metadata[0], ("Text:LineCount".to_string(), "2".to_string()));
    }

    #[test]
    fn binary_content_yields_no_text() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fake.txt");
        fs::write(&path, b"abc\0def").unwrap();

        let registry = ExtractorRegistry::default();
        let extraction = registry.extract(&path, "text/plain").unwrap().unwrap();
        assert!(extraction.text.is_none());
    }

    #[test]
    fn unknown_mime_has_no_extractor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.bin");
        fs::write(&path, b"x").unwrap();

        let registry = ExtractorRegistry::default();
        assert!(registry.extract(&path, "application/octet-stream").is_none());
    }

    #[test]
    fn read_cap_bounds_extraction() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.txt");
        fs::write(&path, "x".repeat(4096)).unwrap();

        struct Tiny;
        impl Extractor for Tiny {
            fn handles(&self, mime: &str) -> bool {
                mime == "text/tiny"
            }
            fn extract(&self, path: &Path, _mime: &str) -> std::io::Result<Extraction> {
                PlainTextExtractor { max_bytes: 16 }.extract(path, "text/plain")
            }
        }
        let mut registry = ExtractorRegistry::default();
        registry.register(Box::new(Tiny));
        let extraction = registry.extract(&path, "text/tiny").unwrap().unwrap();
        assert_eq!(extraction.text.unwrap().len(), 16);
    }
}
