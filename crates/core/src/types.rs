use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Score saturates at 24 bits so it can share a u32 with the class id.
pub const MAX_SCORE: u32 = 0x00FF_FFFF;

/// Class ids above this cannot be packed into the amalgamated field.
pub const MAX_CLASS_ID: u32 = 0xFF;

/// Inclusive class-id range reserved for email-like services.
pub const EMAIL_CLASS_RANGE: (u32, u32) = (20, 29);

// ---------------------------------------------------------------------------
// Property schema
// ---------------------------------------------------------------------------

/// Data type tag for a metadata property.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    Keyword,
    Index,
    Fulltext,
    String,
    Integer,
    Double,
    Date,
    Blob,
    Struct,
    Link,
}

/// A named typed attribute. `weight` multiplies term score when the value
/// is tokenized into the index.
#[derive(Clone, Debug)]
pub struct Property {
    pub id: u32,
    pub name: String,
    pub data_type: PropertyType,
    pub weight: u32,
    pub embedded: bool,
    pub multiple_values: bool,
    pub delimited: bool,
    pub filtered: bool,
    pub store_metadata: bool,
    /// Child property ids for composite properties.
    pub child_ids: Vec<u32>,
}

impl Property {
    pub fn new(id: u32, name: &str, data_type: PropertyType, weight: u32) -> Self {
        Self {
            id,
            name: name.to_string(),
            data_type,
            weight,
            embedded: true,
            multiple_values: false,
            delimited: false,
            filtered: false,
            store_metadata: true,
            child_ids: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Service classes
// ---------------------------------------------------------------------------

/// Which backing store a class lives in. Chosen at insert time and
/// immutable for the lifetime of the service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Files,
    Emails,
    Virtual,
}

/// A node in the single-inheritance class hierarchy. Loaded once at
/// startup and read-only at runtime.
#[derive(Clone, Debug)]
pub struct ServiceClass {
    pub id: u32,
    pub name: String,
    /// Name of the parent class; empty for hierarchy roots.
    pub parent: String,
    pub store: StoreKind,
    pub enabled: bool,
    pub embedded: bool,
    pub has_metadata: bool,
    pub has_full_text: bool,
    pub has_thumbs: bool,
    pub show_service_files: bool,
    pub show_service_directories: bool,
    pub property_prefix: String,
    pub content_metadata: String,
}

impl ServiceClass {
    fn new(id: u32, name: &str, parent: &str, store: StoreKind) -> Self {
        Self {
            id,
            name: name.to_string(),
            parent: parent.to_string(),
            store,
            enabled: true,
            embedded: true,
            has_metadata: true,
            has_full_text: true,
            has_thumbs: false,
            show_service_files: true,
            show_service_directories: true,
            property_prefix: format!("{}:", name.to_lowercase()),
            content_metadata: "File:Contents".to_string(),
        }
    }

    pub fn is_email(&self) -> bool {
        self.id >= EMAIL_CLASS_RANGE.0 && self.id <= EMAIL_CLASS_RANGE.1
    }
}

/// The fixed class hierarchy plus lookup tables. Built once at startup.
pub struct Ontology {
    classes: Vec<ServiceClass>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<u32, usize>,
    mime_map: HashMap<&'static str, &'static str>,
    properties: Vec<Property>,
}

impl Ontology {
    /// Build the default hierarchy. Fails if any class id exceeds the
    /// 8 bits available in the amalgamated posting field.
    pub fn build() -> Result<Self, String> {
        let mut classes = vec![
            ServiceClass::new(1, "Files", "", StoreKind::Files),
            ServiceClass::new(2, "Folders", "Files", StoreKind::Files),
            ServiceClass::new(3, "Documents", "Files", StoreKind::Files),
            ServiceClass::new(4, "Images", "Files", StoreKind::Files),
            ServiceClass::new(5, "Music", "Files", StoreKind::Files),
            ServiceClass::new(6, "Videos", "Files", StoreKind::Files),
            ServiceClass::new(7, "Text", "Files", StoreKind::Files),
            ServiceClass::new(8, "Development", "Files", StoreKind::Files),
            ServiceClass::new(9, "Other", "Files", StoreKind::Files),
            ServiceClass::new(10, "Applications", "", StoreKind::Virtual),
            ServiceClass::new(11, "Conversations", "", StoreKind::Files),
            ServiceClass::new(12, "GaimConversations", "Conversations", StoreKind::Files),
            ServiceClass::new(13, "WebHistory", "", StoreKind::Virtual),
            ServiceClass::new(20, "Emails", "", StoreKind::Emails),
            ServiceClass::new(21, "EvolutionEmails", "Emails", StoreKind::Emails),
            ServiceClass::new(22, "KMailEmails", "Emails", StoreKind::Emails),
            ServiceClass::new(23, "ThunderbirdEmails", "Emails", StoreKind::Emails),
            ServiceClass::new(24, "ModestEmails", "Emails", StoreKind::Emails),
            ServiceClass::new(25, "EmailAttachments", "Emails", StoreKind::Emails),
        ];

        for c in classes.iter_mut() {
            if c.id > MAX_CLASS_ID {
                return Err(format!("class id {} for {} exceeds 8 bits", c.id, c.name));
            }
            match c.name.as_str() {
                "Images" | "Music" | "Videos" => {
                    c.has_full_text = false;
                    c.has_thumbs = true;
                }
                "Folders" => c.has_full_text = false,
                "Applications" => {
                    c.has_full_text = false;
                    c.show_service_directories = false;
                }
                _ => {}
            }
        }

        let by_name = classes
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.to_lowercase(), i))
            .collect();
        let by_id = classes.iter().enumerate().map(|(i, c)| (c.id, i)).collect();

        Ok(Self {
            classes,
            by_name,
            by_id,
            mime_map: default_mime_map(),
            properties: default_properties(),
        })
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Score multiplier for terms extracted from a property's value;
    /// unknown properties weigh 1.
    pub fn property_weight(&self, name: &str) -> u32 {
        self.property(name).map(|p| p.weight).unwrap_or(1)
    }

    pub fn class(&self, name: &str) -> Option<&ServiceClass> {
        self.by_name.get(&name.to_lowercase()).map(|&i| &self.classes[i])
    }

    pub fn class_by_id(&self, id: u32) -> Option<&ServiceClass> {
        self.by_id.get(&id).map(|&i| &self.classes[i])
    }

    pub fn classes(&self) -> &[ServiceClass] {
        &self.classes
    }

    /// Resolve a mime type to a class name, walking prefix fallbacks
    /// (`image/png` → `image/*` → default).
    pub fn class_for_mime(&self, mime: &str) -> &ServiceClass {
        let name = self
            .mime_map
            .get(mime)
            .copied()
            .or_else(|| {
                mime.split_once('/')
                    .and_then(|(major, _)| self.mime_map.get(format!("{major}/*").as_str()))
                    .copied()
            })
            .unwrap_or("Other");
        self.class(name).unwrap_or(&self.classes[0])
    }

    pub fn is_email_class(&self, class_id: u32) -> bool {
        class_id >= EMAIL_CLASS_RANGE.0 && class_id <= EMAIL_CLASS_RANGE.1
    }
}

fn default_properties() -> Vec<Property> {
    let mut name = Property::new(1, "File:Name", PropertyType::Index, 12);
    name.delimited = true;
    let mut keywords = Property::new(3, "User:Keywords", PropertyType::Keyword, 50);
    keywords.embedded = false;
    keywords.multiple_values = true;
    vec![
        name,
        Property::new(2, "File:Contents", PropertyType::Fulltext, 1),
        keywords,
        Property::new(4, "Doc:Title", PropertyType::Index, 10),
        Property::new(5, "Doc:Author", PropertyType::Index, 5),
        Property::new(6, "Email:Subject", PropertyType::Index, 10),
        Property::new(7, "Email:Sender", PropertyType::Index, 6),
        Property::new(8, "Email:Recipients", PropertyType::Index, 3),
        Property::new(9, "Email:Body", PropertyType::Fulltext, 1),
        Property::new(10, "File:Other", PropertyType::String, 1),
    ]
}

fn default_mime_map() -> HashMap<&'static str, &'static str> {
    [
        ("inode/directory", "Folders"),
        ("text/plain", "Text"),
        ("text/*", "Text"),
        ("text/x-rust", "Development"),
        ("text/x-csrc", "Development"),
        ("text/x-chdr", "Development"),
        ("text/x-python", "Development"),
        ("text/x-shellscript", "Development"),
        ("application/pdf", "Documents"),
        ("application/msword", "Documents"),
        ("application/vnd.oasis.opendocument.text", "Documents"),
        ("application/rtf", "Documents"),
        ("image/*", "Images"),
        ("audio/*", "Music"),
        ("video/*", "Videos"),
        ("application/x-desktop", "Applications"),
        ("message/rfc822", "Emails"),
    ]
    .into_iter()
    .collect()
}

// ---------------------------------------------------------------------------
// Postings
// ---------------------------------------------------------------------------

/// True for class ids in the range reserved for email-like services.
pub fn is_email_class_id(class_id: u32) -> bool {
    class_id >= EMAIL_CLASS_RANGE.0 && class_id <= EMAIL_CLASS_RANGE.1
}

/// Pack a class id and a score into the 32-bit amalgamated field.
/// Score saturates at 24 bits; class occupies the top 8.
pub fn amalgamate(class_id: u32, score: u32) -> u32 {
    (class_id & MAX_CLASS_ID) << 24 | score.min(MAX_SCORE)
}

/// One (term, service) occurrence stored against a term in the index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WordDetails {
    pub id: u32,
    pub amalgamated: u32,
}

impl WordDetails {
    pub fn new(service_id: u32, class_id: u32, score: u32) -> Self {
        Self { id: service_id, amalgamated: amalgamate(class_id, score) }
    }

    pub fn class_id(&self) -> u32 {
        self.amalgamated >> 24
    }

    pub fn score(&self) -> u32 {
        self.amalgamated & MAX_SCORE
    }

    /// A zero score marks the posting for removal during merge.
    pub fn is_deletion(&self) -> bool {
        self.score() == 0
    }

    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&self.id.to_le_bytes());
        buf[4..].copy_from_slice(&self.amalgamated.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < 8 {
            return None;
        }
        Some(Self {
            id: u32::from_le_bytes(buf[..4].try_into().ok()?),
            amalgamated: u32::from_le_bytes(buf[4..8].try_into().ok()?),
        })
    }
}

/// Decode a packed posting buffer, dropping any trailing partial record.
pub fn decode_postings(buf: &[u8]) -> Vec<WordDetails> {
    buf.chunks_exact(8).filter_map(WordDetails::decode).collect()
}

/// Encode postings into the packed on-disk byte form.
pub fn encode_postings(postings: &[WordDetails]) -> Vec<u8> {
    let mut out = Vec::with_capacity(postings.len() * 8);
    for p in postings {
        out.extend_from_slice(&p.encode());
    }
    out
}

// ---------------------------------------------------------------------------
// Pipeline tickets
// ---------------------------------------------------------------------------

/// Action carried by a pipeline ticket. Ambiguous actions (`Check`,
/// `Create`, …) are refined to file/directory variants before indexing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum FileAction {
    Ignore,
    Check,
    Create,
    Delete,
    MovedFrom,
    MovedTo,
    FileCheck,
    FileChanged,
    FileCreated,
    FileDeleted,
    FileMovedFrom,
    FileMovedTo,
    WritableFileClosed,
    DirectoryCheck,
    DirectoryCreated,
    DirectoryDeleted,
    DirectoryMovedFrom,
    DirectoryMovedTo,
    DirectoryRefresh,
}

impl FileAction {
    pub fn is_delete(&self) -> bool {
        matches!(
            self,
            FileAction::Delete
                | FileAction::FileDeleted
                | FileAction::DirectoryDeleted
        )
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => FileAction::Check,
            2 => FileAction::Create,
            3 => FileAction::Delete,
            4 => FileAction::MovedFrom,
            5 => FileAction::MovedTo,
            6 => FileAction::FileCheck,
            7 => FileAction::FileChanged,
            8 => FileAction::FileCreated,
            9 => FileAction::FileDeleted,
            10 => FileAction::FileMovedFrom,
            11 => FileAction::FileMovedTo,
            12 => FileAction::WritableFileClosed,
            13 => FileAction::DirectoryCheck,
            14 => FileAction::DirectoryCreated,
            15 => FileAction::DirectoryDeleted,
            16 => FileAction::DirectoryMovedFrom,
            17 => FileAction::DirectoryMovedTo,
            18 => FileAction::DirectoryRefresh,
            _ => FileAction::Ignore,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            FileAction::Ignore => 0,
            FileAction::Check => 1,
            FileAction::Create => 2,
            FileAction::Delete => 3,
            FileAction::MovedFrom => 4,
            FileAction::MovedTo => 5,
            FileAction::FileCheck => 6,
            FileAction::FileChanged => 7,
            FileAction::FileCreated => 8,
            FileAction::FileDeleted => 9,
            FileAction::FileMovedFrom => 10,
            FileAction::FileMovedTo => 11,
            FileAction::WritableFileClosed => 12,
            FileAction::DirectoryCheck => 13,
            FileAction::DirectoryCreated => 14,
            FileAction::DirectoryDeleted => 15,
            FileAction::DirectoryMovedFrom => 16,
            FileAction::DirectoryMovedTo => 17,
            FileAction::DirectoryRefresh => 18,
        }
    }
}

/// Work ticket flowing from the crawler/watcher into the pipeline.
/// Created by event sources, mutated only by the pipeline, dropped on
/// success or once `counter` goes negative.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub uri: PathBuf,
    pub action: FileAction,
    /// Retry / grace counter; negative means give up.
    pub counter: i32,
    pub file_id: u64,
    pub mime: Option<String>,
    pub mtime: i64,
    pub indextime: i64,
    pub is_directory: bool,
    pub is_hidden: bool,
    pub is_new: bool,
    /// Rename pairing cookie from the FS event source.
    pub cookie: u32,
    pub moved_to_uri: Option<PathBuf>,
    /// Byte offset into a mail summary file, for email tickets.
    pub offset: u64,
}

impl FileInfo {
    pub fn new(uri: impl Into<PathBuf>, action: FileAction) -> Self {
        Self {
            uri: uri.into(),
            action,
            counter: 2,
            file_id: 0,
            mime: None,
            mtime: 0,
            indextime: 0,
            is_directory: false,
            is_hidden: false,
            is_new: true,
            cookie: 0,
            moved_to_uri: None,
            offset: 0,
        }
    }

    pub fn with_cookie(mut self, cookie: u32) -> Self {
        self.cookie = cookie;
        self
    }
}

// ---------------------------------------------------------------------------
// Service rows
// ---------------------------------------------------------------------------

/// A stored service entity: one row per indexed file, directory, email
/// or synthetic record.
#[derive(Clone, Debug)]
pub struct Service {
    pub id: u64,
    pub parent_id: u64,
    pub path: String,
    pub class_id: u32,
    pub mime: String,
    pub mtime: i64,
    pub indextime: i64,
    pub is_directory: bool,
    pub is_hidden: bool,
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amalgamated_round_trips_class_and_score() {
        let w = WordDetails::new(42, 21, 1000);
        assert_eq!(w.class_id(), 21);
        assert_eq!(w.score(), 1000);
    }

    #[test]
    fn amalgamated_score_saturates() {
        let w = WordDetails::new(1, 3, u32::MAX);
        assert_eq!(w.score(), MAX_SCORE);
        assert_eq!(w.class_id(), 3);
    }

    #[test]
    fn postings_encode_decode() {
        let input = vec![WordDetails::new(1, 1, 5), WordDetails::new(2, 20, 9)];
        let bytes = encode_postings(&input);
        assert_eq!(decode_postings(&bytes), input);
        // A truncated tail is dropped, not an error
        assert_eq!(decode_postings(&bytes[..12]), input[..1]);
    }

    #[test]
    fn ontology_maps_mime_with_fallback() {
        let ont = Ontology::build().unwrap();
        assert_eq!(ont.class_for_mime("image/png").name, "Images");
        assert_eq!(ont.class_for_mime("application/pdf").name, "Documents");
        assert_eq!(ont.class_for_mime("application/x-unknown").name, "Other");
    }

    #[test]
    fn email_classes_fall_in_reserved_range() {
        let ont = Ontology::build().unwrap();
        assert!(ont.class("EvolutionEmails").unwrap().is_email());
        assert!(!ont.class("Files").unwrap().is_email());
    }
}
