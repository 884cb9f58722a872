//! File classifier: path → (service class, mime, crawl decision).
//!
//! Decisions are evaluated highest-priority first: no-watch roots and
//! no-index glob types beat crawl-only roots, which beat watch roots.
//! Registered service directories (chat logs, mail stores, web history
//! drop zones) override the mime-derived class by longest prefix.

use fossick_core::config::Config;
use fossick_core::types::{Ontology, ServiceClass};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::warn;

// ---------------------------------------------------------------------------
// Path expansion and root filtering
// ---------------------------------------------------------------------------

/// Expand `~`, `$VAR` and `${VAR}` in a configured path. Bare names
/// without a separator are left untouched.
pub fn expand_path(input: &str) -> PathBuf {
    let mut s = input.to_string();

    if s == "~" || s.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            s = format!("{}{}", home, &s[1..]);
        }
    }

    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap();
    let expanded = re.replace_all(&s, |caps: &regex::Captures| {
        let name = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str()).unwrap_or("");
        std::env::var(name).unwrap_or_default()
    });

    PathBuf::from(expanded.into_owned())
}

/// Drop roots whose ancestor is also in the list, so overlapping
/// configuration does not produce duplicate crawls.
pub fn filter_duplicate_roots(roots: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut kept: Vec<PathBuf> = Vec::new();
    let mut sorted = roots;
    sorted.sort();
    sorted.dedup();
    for root in sorted {
        if !kept.iter().any(|k| root.starts_with(k) && root != *k) {
            kept.push(root);
        }
    }
    kept
}

fn is_hidden_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Mime detection
// ---------------------------------------------------------------------------

/// Extension-based mime detection. The real resolver is an external
/// collaborator; this table covers what the default extractors handle.
pub fn mime_for_path(path: &Path, is_directory: bool) -> String {
    if is_directory {
        return "inode/directory".to_string();
    }
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_lowercase();
    let mime = match ext.as_str() {
        "txt" | "log" | "text" => "text/plain",
        "md" | "rst" => "text/plain",
        "html" | "htm" => "text/html",
        "xml" => "application/xml",
        "rs" => "text/x-rust",
        "c" => "text/x-csrc",
        "h" => "text/x-chdr",
        "py" => "text/x-python",
        "sh" => "text/x-shellscript",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "odt" => "application/vnd.oasis.opendocument.text",
        "rtf" => "application/rtf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "wav" => "audio/x-wav",
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "desktop" => "application/x-desktop",
        "eml" => "message/rfc822",
        "" => "application/octet-stream",
        _ => "application/octet-stream",
    };
    mime.to_string()
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Crawl decision for a path, highest priority first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Ignore,
    Crawl,
    Watch,
    IndexNow,
}

/// Result of classifying one path.
#[derive(Clone, Debug)]
pub struct Classification {
    pub class: String,
    pub mime: String,
    pub decision: Decision,
    pub is_hidden: bool,
}

pub struct Classifier {
    watch_roots: Vec<PathBuf>,
    crawl_roots: Vec<PathBuf>,
    no_watch_roots: Vec<PathBuf>,
    no_index_types: GlobSet,
    /// `(class name, directory)` registered by modules; longest prefix wins.
    service_dirs: RwLock<Vec<(String, PathBuf)>>,
}

impl Classifier {
    pub fn from_config(config: &Config) -> Self {
        let expand_all = |roots: &[PathBuf]| -> Vec<PathBuf> {
            roots.iter().map(|p| expand_path(&p.to_string_lossy())).collect()
        };

        let watch_roots = filter_duplicate_roots(expand_all(&config.watches.watch_directory_roots));
        let crawl_roots = filter_duplicate_roots(expand_all(&config.watches.crawl_directory_roots));
        let no_watch_roots = expand_all(&config.watches.no_watch_directory_roots);

        let mut builder = GlobSetBuilder::new();
        for pattern in &config.indexing.no_index_file_types {
            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(e) => warn!(pattern = pattern.as_str(), error = %e, "bad no-index glob"),
            }
        }
        let no_index_types = builder.build().unwrap_or_else(|_| GlobSet::empty());

        Self {
            watch_roots,
            crawl_roots,
            no_watch_roots,
            no_index_types,
            service_dirs: RwLock::new(Vec::new()),
        }
    }

    pub fn watch_roots(&self) -> &[PathBuf] {
        &self.watch_roots
    }

    pub fn crawl_roots(&self) -> &[PathBuf] {
        &self.crawl_roots
    }

    /// Register a directory whose contents belong to a specific class
    /// (chat logs, mail summaries, web history imports).
    pub fn add_service_dir(&self, class: &str, dir: &Path) {
        let mut dirs = self.service_dirs.write().unwrap();
        if !dirs.iter().any(|(_, d)| d == dir) {
            dirs.push((class.to_string(), dir.to_path_buf()));
        }
    }

    pub fn service_dirs_for(&self, class: &str) -> Vec<PathBuf> {
        self.service_dirs
            .read()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == class)
            .map(|(_, d)| d.clone())
            .collect()
    }

    pub fn is_no_watched(&self, path: &Path) -> bool {
        self.no_watch_roots.iter().any(|r| path.starts_with(r))
    }

    pub fn is_crawl_only(&self, path: &Path) -> bool {
        self.crawl_roots.iter().any(|r| path.starts_with(r))
    }

    fn is_watched(&self, path: &Path) -> bool {
        self.watch_roots.iter().any(|r| path.starts_with(r))
    }

    /// Class for a path: a registered service dir by longest prefix,
    /// otherwise the mime-derived class.
    pub fn service_for_path<'a>(&self, path: &Path, ontology: &'a Ontology, mime: &str) -> &'a ServiceClass {
        let dirs = self.service_dirs.read().unwrap();
        let best = dirs
            .iter()
            .filter(|(_, d)| path.starts_with(d))
            .max_by_key(|(_, d)| d.components().count());
        if let Some((class, _)) = best {
            if let Some(c) = ontology.class(class) {
                return c;
            }
        }
        ontology.class_for_mime(mime)
    }

    /// Classify a path into (class, mime, decision).
    pub fn evaluate(&self, path: &Path, is_directory: bool, ontology: &Ontology) -> Classification {
        let is_hidden = is_hidden_name(path);
        let mime = mime_for_path(path, is_directory);

        // No-index globs match the file name, not the full path
        let no_index = path
            .file_name()
            .map(|n| self.no_index_types.is_match(Path::new(n)))
            .unwrap_or(false);
        let decision = if self.is_no_watched(path) || no_index {
            Decision::Ignore
        } else if self.is_crawl_only(path) {
            Decision::Crawl
        } else if self.is_watched(path) {
            Decision::Watch
        } else if self
            .service_dirs
            .read()
            .unwrap()
            .iter()
            .any(|(_, d)| path.starts_with(d))
        {
            Decision::IndexNow
        } else {
            Decision::Ignore
        };

        let class = self.service_for_path(path, ontology, &mime).name.clone();
        Classification { class, mime, decision, is_hidden }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier(watch: &[&str], crawl: &[&str], no_watch: &[&str], no_index: &[&str]) -> Classifier {
        let mut config = Config::default();
        config.watches.watch_directory_roots = watch.iter().map(PathBuf::from).collect();
        config.watches.crawl_directory_roots = crawl.iter().map(PathBuf::from).collect();
        config.watches.no_watch_directory_roots = no_watch.iter().map(PathBuf::from).collect();
        config.indexing.no_index_file_types = no_index.iter().map(|s| s.to_string()).collect();
        Classifier::from_config(&config)
    }

    #[test]
    fn no_watch_beats_watch() {
        let c = classifier(&["/home/me"], &[], &["/home/me/.cache"], &[]);
        let ont = Ontology::build().unwrap();
        let cls = c.evaluate(Path::new("/home/me/.cache/x.txt"), false, &ont);
        assert_eq!(cls.decision, Decision::Ignore);
        let cls = c.evaluate(Path::new("/home/me/doc.txt"), false, &ont);
        assert_eq!(cls.decision, Decision::Watch);
    }

    #[test]
    fn no_index_globs_ignore_files() {
        let c = classifier(&["/home/me"], &[], &[], &["*.o", "*.tmp"]);
        let ont = Ontology::build().unwrap();
        assert_eq!(c.evaluate(Path::new("/home/me/a.o"), false, &ont).decision, Decision::Ignore);
        assert_eq!(c.evaluate(Path::new("/home/me/a.txt"), false, &ont).decision, Decision::Watch);
    }

    #[test]
    fn crawl_only_roots_do_not_watch() {
        let c = classifier(&["/home/me"], &["/mnt/archive"], &[], &[]);
        let ont = Ontology::build().unwrap();
        assert_eq!(
            c.evaluate(Path::new("/mnt/archive/a.txt"), false, &ont).decision,
            Decision::Crawl
        );
    }

    #[test]
    fn duplicate_roots_are_filtered() {
        let roots = vec![
            PathBuf::from("/home/me"),
            PathBuf::from("/home/me/docs"),
            PathBuf::from("/srv"),
        ];
        assert_eq!(
            filter_duplicate_roots(roots),
            vec![PathBuf::from("/home/me"), PathBuf::from("/srv")]
        );
    }

    #[test]
    fn service_dirs_override_class() {
        let c = classifier(&["/home/me"], &[], &[], &[]);
        let ont = Ontology::build().unwrap();
        c.add_service_dir("GaimConversations", Path::new("/home/me/.purple/logs"));
        let cls = c.evaluate(Path::new("/home/me/.purple/logs/chat.txt"), false, &ont);
        assert_eq!(cls.class, "GaimConversations");

        let cls = c.evaluate(Path::new("/home/me/notes.txt"), false, &ont);
        assert_eq!(cls.class, "Text");
    }

    #[test]
    fn hidden_files_are_flagged() {
        let c = classifier(&["/home/me"], &[], &[], &[]);
        let ont = Ontology::build().unwrap();
        assert!(c.evaluate(Path::new("/home/me/.profile"), false, &ont).is_hidden);
        assert!(!c.evaluate(Path::new("/home/me/profile"), false, &ont).is_hidden);
    }

    #[test]
    fn env_expansion() {
        std::env::set_var("FOSSICK_TEST_DIR", "/data");
        assert_eq!(expand_path("${FOSSICK_TEST_DIR}/docs"), PathBuf::from("/data/docs"));
        assert_eq!(expand_path("$FOSSICK_TEST_DIR/docs"), PathBuf::from("/data/docs"));
    }

    #[test]
    fn directories_map_to_folders() {
        let c = classifier(&["/home/me"], &[], &[], &[]);
        let ont = Ontology::build().unwrap();
        let cls = c.evaluate(Path::new("/home/me/projects"), true, &ont);
        assert_eq!(cls.mime, "inode/directory");
        assert_eq!(cls.class, "Folders");
    }
}
