//! Mail-store walkers: read vendor summary files and emit messages.
//!
//! Summary files are big-endian with length-prefixed strings that are
//! NOT NUL-terminated on disk. Every inline count is bounded at 500 and
//! every string at 64 KiB; a violation abandons the record rather than
//! trusting the rest of the stream. Imap summaries append server flags
//! and a recursively nested content-info block per message.

use crate::error::SummaryError;
use byteorder::{BigEndian, ReadBytesExt};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, warn};

/// Defensive bounds from the on-disk format.
const MAX_INLINE_COUNT: u32 = 500;
const MAX_STRING_LEN: u32 = 65536;

/// Message flag bits.
const FLAG_DELETED: u32 = 1 << 1;
const FLAG_SEEN: u32 = 1 << 4;
const FLAG_EXPUNGED: u32 = 1 << 8;

// ---------------------------------------------------------------------------
// Typed big-endian reader
// ---------------------------------------------------------------------------

/// Bounds-checked reader over a buffered summary stream.
pub struct SummaryReader<R: Read + Seek> {
    inner: BufReader<R>,
}

impl<R: Read + Seek> SummaryReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner: BufReader::new(inner) }
    }

    fn read_i32(&mut self) -> Result<i32, SummaryError> {
        Ok(self.inner.read_i32::<BigEndian>()?)
    }

    fn read_u32(&mut self) -> Result<u32, SummaryError> {
        Ok(self.inner.read_u32::<BigEndian>()?)
    }

    fn read_time(&mut self) -> Result<i64, SummaryError> {
        Ok(self.read_i32()? as i64)
    }

    /// A count field, rejected above the defensive limit.
    fn read_count(&mut self) -> Result<u32, SummaryError> {
        let n = self.read_u32()?;
        if n > MAX_INLINE_COUNT {
            return Err(SummaryError::CountLimit(n));
        }
        Ok(n)
    }

    fn read_string(&mut self) -> Result<String, SummaryError> {
        let len = self.read_u32()?;
        if len > MAX_STRING_LEN {
            return Err(SummaryError::StringLimit(len));
        }
        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf).map_err(|_| SummaryError::Truncated)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    fn skip_i32(&mut self) -> Result<(), SummaryError> {
        self.inner.seek(SeekFrom::Current(4))?;
        Ok(())
    }

    fn skip_string(&mut self) -> Result<(), SummaryError> {
        let len = self.read_u32()?;
        if len > MAX_STRING_LEN {
            return Err(SummaryError::StringLimit(len));
        }
        self.inner.seek(SeekFrom::Current(len as i64))?;
        Ok(())
    }

    /// Token fields encode short values inline: lengths below 32 carry
    /// no payload.
    fn skip_token(&mut self) -> Result<(), SummaryError> {
        let len = self.read_u32()?;
        if len < 32 {
            return Ok(());
        }
        self.inner.seek(SeekFrom::Current((len - 32) as i64))?;
        Ok(())
    }

    pub fn position(&mut self) -> Result<u64, SummaryError> {
        Ok(self.inner.stream_position()?)
    }
}

// ---------------------------------------------------------------------------
// Header and records
// ---------------------------------------------------------------------------

/// Which store layout produced the summary file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailFlavour {
    Maildir,
    Pop,
    Imap,
}

/// Pick the flavour from the summary file's location.
pub fn flavour_for_path(path: &Path) -> MailFlavour {
    let p = path.to_string_lossy();
    if p.contains("/imap") {
        MailFlavour::Imap
    } else if p.contains("/pop") {
        MailFlavour::Pop
    } else {
        MailFlavour::Maildir
    }
}

#[derive(Clone, Debug)]
pub struct SummaryHeader {
    pub version: i32,
    pub legacy: bool,
    pub flags: i32,
    pub nextuid: i32,
    pub time: i64,
    pub count: i32,
    pub unread: i32,
    pub deleted: i32,
    pub junk: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailPerson {
    pub name: String,
    pub addr: String,
}

#[derive(Clone, Debug)]
pub struct MailMessage {
    pub uid: String,
    pub size: u32,
    pub flags: u32,
    pub date_sent: i64,
    pub date_received: i64,
    pub subject: String,
    pub from: String,
    pub to: Vec<MailPerson>,
    pub cc: Vec<MailPerson>,
    pub deleted: bool,
    pub seen: bool,
    /// Byte offset of the record in the summary file.
    pub offset: u64,
}

/// Parse an RFC-2822-ish address list: `Name <addr>, addr2, …`.
pub fn parse_address_list(input: &str) -> Vec<MailPerson> {
    let mut out = Vec::new();
    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some(open) = part.rfind('<') {
            let close = part.rfind('>').unwrap_or(part.len());
            let addr = part[open + 1..close].trim().to_string();
            let name = part[..open].trim().trim_matches('"').to_string();
            let name = if name.is_empty() { addr.clone() } else { name };
            out.push(MailPerson { name, addr });
        } else {
            out.push(MailPerson { name: part.to_string(), addr: part.to_string() });
        }
    }
    out
}

impl<R: Read + Seek> SummaryReader<R> {
    /// Read the common summary header.
    pub fn read_header(&mut self) -> Result<SummaryHeader, SummaryError> {
        let version = self.read_i32()?;
        if version > 0xff && (version & 0xff) < 12 {
            return Err(SummaryError::Version(version));
        }
        let legacy = !(version < 0x100 && version >= 13);
        if legacy {
            debug!(version, "legacy summary file");
        }

        let flags = self.read_i32()?;
        let nextuid = self.read_i32()?;
        let time = self.read_time()?;
        let count = self.read_i32()?;

        let (mut unread, mut deleted, mut junk) = (0, 0, 0);
        if !legacy {
            unread = self.read_i32()?;
            deleted = self.read_i32()?;
            junk = self.read_i32()?;
        }

        Ok(SummaryHeader { version, legacy, flags, nextuid, time, count, unread, deleted, junk })
    }

    /// Read the flavour-specific meta header that follows the common
    /// header.
    pub fn read_meta_header(
        &mut self,
        header: &SummaryHeader,
        flavour: MailFlavour,
    ) -> Result<(), SummaryError> {
        match flavour {
            MailFlavour::Pop => Ok(()),
            MailFlavour::Maildir => self.read_secondary_version(header),
            MailFlavour::Imap => {
                if header.version != 0x30c {
                    self.read_secondary_version(header)?;
                    // validity
                    self.skip_i32()?;
                } else {
                    self.skip_i32()?;
                }
                Ok(())
            }
        }
    }

    fn read_secondary_version(&mut self, header: &SummaryHeader) -> Result<(), SummaryError> {
        if header.version == 0x30c {
            return Ok(());
        }
        let version = self.read_i32()?;
        if version < 0 || version > 3 {
            return Err(SummaryError::Version(version));
        }
        if version == 2 {
            self.skip_i32()?;
        }
        Ok(())
    }

    /// Read one message record.
    pub fn read_message(&mut self, flavour: MailFlavour) -> Result<MailMessage, SummaryError> {
        let offset = self.position()?;

        let uid = self.read_string()?;
        // Size and flags are stored in this order on disk
        let size = self.read_u32()?;
        let flags = self.read_u32()?;
        let date_sent = self.read_time()?;
        let date_received = self.read_time()?;
        let subject = self.read_string()?;
        let from = self.read_string()?;
        let to = self.read_string()?;
        let cc = self.read_string()?;
        let _mlist = self.read_string()?;

        // message id hi/lo
        self.skip_i32()?;
        self.skip_i32()?;

        // references
        let refs = self.read_count()?;
        for _ in 0..refs {
            self.skip_i32()?;
            self.skip_i32()?;
        }
        // user flags
        let uflags = self.read_count()?;
        for _ in 0..uflags {
            self.skip_string()?;
        }
        // user tags
        let utags = self.read_count()?;
        for _ in 0..utags {
            self.skip_string()?;
            self.skip_string()?;
        }

        if flavour == MailFlavour::Imap {
            let _server_flags = self.read_u32()?;
            self.skip_content_info()?;
        }

        Ok(MailMessage {
            deleted: flags & (FLAG_DELETED | FLAG_EXPUNGED) != 0,
            seen: flags & FLAG_SEEN != 0,
            uid,
            size,
            flags,
            date_sent,
            date_received,
            subject,
            from,
            to: parse_address_list(&to),
            cc: parse_address_list(&cc),
            offset,
        })
    }

    /// Skip one content-info block and its nested children.
    fn skip_content_info(&mut self) -> Result<(), SummaryError> {
        self.skip_content_info_body()?;
        let children = self.read_count()?;
        for _ in 0..children {
            self.skip_content_info()?;
        }
        Ok(())
    }

    fn skip_content_info_body(&mut self) -> Result<(), SummaryError> {
        let present = self.read_u32()?;
        if present == 0 {
            return Ok(());
        }
        self.skip_token()?; // type
        self.skip_token()?; // subtype
        let params = self.read_count()?;
        for _ in 0..params {
            self.skip_token()?; // name
            self.skip_token()?; // value
        }
        self.skip_token()?; // id
        self.skip_token()?; // description
        self.skip_token()?; // encoding
        self.read_u32()?; // size
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Walker
// ---------------------------------------------------------------------------

/// Read a whole summary file. Records that fail to parse are logged
/// and skipped; decoding stops at the first truncation since record
/// boundaries are gone after that.
pub fn read_summary(path: &Path) -> Result<(SummaryHeader, Vec<MailMessage>), SummaryError> {
    let flavour = flavour_for_path(path);
    let file = std::fs::File::open(path)?;
    let mut reader = SummaryReader::new(file);

    let header = reader.read_header()?;
    reader.read_meta_header(&header, flavour)?;

    let mut messages = Vec::new();
    for n in 0..header.count {
        match reader.read_message(flavour) {
            Ok(message) => messages.push(message),
            Err(e) => {
                warn!(path = %path.display(), record = n, error = %e, "abandoning summary decode");
                break;
            }
        }
    }
    Ok((header, messages))
}

/// True when a path names a summary file a mail walker understands.
pub fn is_summary_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    name == "summary.mmap" || name.ends_with("ev-summary.mmap") || name.ends_with(".ev-summary")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Build summary bytes in the on-disk big-endian layout.
    struct SummaryWriter {
        buf: Vec<u8>,
    }

    impl SummaryWriter {
        fn new() -> Self {
            Self { buf: Vec::new() }
        }

        fn i32(&mut self, v: i32) -> &mut Self {
            self.buf.extend_from_slice(&v.to_be_bytes());
            self
        }

        fn u32(&mut self, v: u32) -> &mut Self {
            self.buf.extend_from_slice(&v.to_be_bytes());
            self
        }

        fn string(&mut self, s: &str) -> &mut Self {
            self.u32(s.len() as u32);
            self.buf.extend_from_slice(s.as_bytes());
            self
        }

        fn header(&mut self, count: i32) -> &mut Self {
            self.i32(14) // version 14: modern, non-legacy
                .i32(0) // flags
                .i32(count + 1) // nextuid
                .i32(1_213_000_000) // time
                .i32(count)
                .i32(1) // unread
                .i32(0) // deleted
                .i32(0) // junk
        }

        fn message(&mut self, uid: &str, subject: &str, from: &str, flags: u32) -> &mut Self {
            self.string(uid)
                .u32(1024) // size
                .u32(flags)
                .i32(1_213_000_100) // date_sent
                .i32(1_213_000_200) // date_received
                .string(subject)
                .string(from)
                .string("Alice <alice@example.org>, bob@example.org")
                .string("")
                .string("") // mlist
                .i32(0)
                .i32(0) // msgid hi/lo
                .u32(0) // n_refs
                .u32(0) // n_uflags
                .u32(0) // n_utags
        }
    }

    #[test]
    fn header_round_trip() {
        let mut w = SummaryWriter::new();
        w.header(3);
        let mut r = SummaryReader::new(Cursor::new(w.buf));
        let h = r.read_header().unwrap();
        assert_eq!(h.version, 14);
        assert!(!h.legacy);
        assert_eq!(h.count, 3);
        assert_eq!(h.unread, 1);
    }

    #[test]
    fn legacy_header_skips_meta_counts() {
        let mut w = SummaryWriter::new();
        w.i32(12).i32(0).i32(5).i32(1_000).i32(4);
        let mut r = SummaryReader::new(Cursor::new(w.buf));
        let h = r.read_header().unwrap();
        assert!(h.legacy);
        assert_eq!(h.count, 4);
        assert_eq!(h.unread, 0);
    }

    #[test]
    fn bad_version_rejected() {
        let mut w = SummaryWriter::new();
        w.i32(0x0b00);
        let mut r = SummaryReader::new(Cursor::new(w.buf));
        assert!(matches!(r.read_header(), Err(SummaryError::Version(_))));
    }

    #[test]
    fn message_record_decodes() {
        let mut w = SummaryWriter::new();
        w.message("1001", "Weekly report", "carol@example.org", FLAG_SEEN);
        let mut r = SummaryReader::new(Cursor::new(w.buf));
        let m = r.read_message(MailFlavour::Maildir).unwrap();
        assert_eq!(m.uid, "1001");
        assert_eq!(m.subject, "Weekly report");
        assert_eq!(m.size, 1024);
        assert!(m.seen);
        assert!(!m.deleted);
        assert_eq!(m.to.len(), 2);
        assert_eq!(m.to[0], MailPerson { name: "Alice".into(), addr: "alice@example.org".into() });
        assert_eq!(m.to[1].addr, "bob@example.org");
    }

    #[test]
    fn deleted_and_expunged_flags_mark_deletion() {
        for flags in [FLAG_DELETED, FLAG_EXPUNGED] {
            let mut w = SummaryWriter::new();
            w.message("1", "s", "f", flags);
            let mut r = SummaryReader::new(Cursor::new(w.buf));
            assert!(r.read_message(MailFlavour::Maildir).unwrap().deleted);
        }
    }

    #[test]
    fn oversized_count_is_rejected() {
        let mut w = SummaryWriter::new();
        w.string("1").u32(0).u32(0).i32(0).i32(0);
        w.string("s").string("f").string("").string("").string("");
        w.i32(0).i32(0);
        w.u32(501); // references count over the limit
        let mut r = SummaryReader::new(Cursor::new(w.buf));
        assert!(matches!(r.read_message(MailFlavour::Maildir), Err(SummaryError::CountLimit(501))));
    }

    #[test]
    fn oversized_string_is_rejected() {
        let mut w = SummaryWriter::new();
        w.u32(70_000);
        let mut r = SummaryReader::new(Cursor::new(w.buf));
        assert!(matches!(r.read_string(), Err(SummaryError::StringLimit(70_000))));
    }

    #[test]
    fn imap_message_reads_server_flags_and_content_info() {
        let mut w = SummaryWriter::new();
        w.message("7", "imap mail", "d@example.org", 0);
        w.u32(0xCAFE); // server flags
        w.u32(0); // content-info absent
        w.u32(0); // zero children
        let mut r = SummaryReader::new(Cursor::new(w.buf));
        let m = r.read_message(MailFlavour::Imap).unwrap();
        assert_eq!(m.uid, "7");
    }

    #[test]
    fn full_summary_walk() {
        let mut w = SummaryWriter::new();
        w.header(2);
        // maildir meta header for version 14: one secondary version i32
        w.i32(3);
        w.message("1", "first", "a@example.org", 0);
        w.message("2", "second", "b@example.org", FLAG_DELETED);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.mmap");
        std::fs::write(&path, &w.buf).unwrap();

        let (header, messages) = read_summary(&path).unwrap();
        assert_eq!(header.count, 2);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].subject, "first");
        assert!(messages[1].deleted);
    }

    #[test]
    fn truncated_summary_keeps_decoded_prefix() {
        let mut w = SummaryWriter::new();
        w.header(3);
        w.i32(3);
        w.message("1", "only one", "a@example.org", 0);
        // Records 2 and 3 are missing entirely

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.mmap");
        std::fs::write(&path, &w.buf).unwrap();

        let (_, messages) = read_summary(&path).unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn summary_filenames_recognized() {
        assert!(is_summary_file(Path::new("/m/.modest/cache/mail/imap/x/summary.mmap")));
        assert!(is_summary_file(Path::new("/m/folder.ev-summary")));
        assert!(!is_summary_file(Path::new("/m/mail.mbox")));
    }

    #[test]
    fn flavour_detection_by_path() {
        assert_eq!(flavour_for_path(Path::new("/m/imap/a/summary.mmap")), MailFlavour::Imap);
        assert_eq!(flavour_for_path(Path::new("/m/pop/a/summary.mmap")), MailFlavour::Pop);
        assert_eq!(flavour_for_path(Path::new("/m/maildir/x/summary.mmap")), MailFlavour::Maildir);
    }
}
