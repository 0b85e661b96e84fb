//! Log entry data structure.

use crate::{Error, Result};

/// Size of the fixed record header preceding the payload on disk:
/// 1 byte type tag, 1 byte retention mode, 8 bytes term.
pub const RECORD_HEADER_SIZE: usize = 10;

/// Classification tag carried by every entry.
///
/// The tag is stored as a single byte on disk and on the wire. Unknown
/// tags read back from a segment are reported as corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A regular state machine command.
    Normal,
    /// A cluster configuration change.
    Configuration,
    /// A no-op appended by a new leader to commit its term.
    NoOp,
    /// A snapshot marker; always transmitted alone in a request.
    Snapshot,
}

impl EntryKind {
    /// Returns the on-disk tag byte for this kind.
    pub fn tag(self) -> u8 {
        match self {
            EntryKind::Normal => 0,
            EntryKind::Configuration => 1,
            EntryKind::NoOp => 2,
            EntryKind::Snapshot => 3,
        }
    }

    /// Decodes a tag byte read from disk.
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(EntryKind::Normal),
            1 => Ok(EntryKind::Configuration),
            2 => Ok(EntryKind::NoOp),
            3 => Ok(EntryKind::Snapshot),
            other => Err(Error::Corruption(format!(
                "unknown entry type tag: {}",
                other
            ))),
        }
    }
}

/// A single entry in the replicated log.
///
/// Each entry carries the term it was created in, its 1-based position in
/// the global log, a kind tag, a 1-byte retention mode and an opaque
/// payload. Entries are immutable once appended at or below the commit
/// index.
///
/// # Binary Format
///
/// When serialized to a segment, each record has this format (big-endian):
/// ```text
/// ┌──────────────┬──────────────┬──────────────┬──────────────────┐
/// │ Type (1 byte)│ Mode (1 byte)│ Term (8 bytes)│ Payload (N bytes)│
/// └──────────────┴──────────────┴──────────────┴──────────────────┘
/// ```
/// The index is not stored in the record; it is derived from the segment
/// descriptor and the record's offset within the segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entry {
    term: u64,
    index: u64,
    kind: EntryKind,
    mode: u8,
    payload: Vec<u8>,
}

impl Entry {
    /// Creates a new normal command entry.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use replog::Entry;
    ///
    /// let entry = Entry::new(1, 1, b"SET key=value".to_vec());
    /// assert_eq!(entry.term(), 1);
    /// assert_eq!(entry.index(), 1);
    /// assert_eq!(entry.payload(), b"SET key=value");
    /// ```
    pub fn new(term: u64, index: u64, payload: Vec<u8>) -> Self {
        Self::with_kind(term, index, EntryKind::Normal, payload)
    }

    /// Creates a new entry with an explicit kind.
    pub fn with_kind(term: u64, index: u64, kind: EntryKind, payload: Vec<u8>) -> Self {
        Self {
            term,
            index,
            kind,
            mode: 0,
            payload,
        }
    }

    /// Sets the retention mode byte, consuming and returning the entry.
    pub fn with_mode(mut self, mode: u8) -> Self {
        self.mode = mode;
        self
    }

    /// Returns the term of this entry.
    pub fn term(&self) -> u64 {
        self.term
    }

    /// Returns the index of this entry.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Returns the kind tag of this entry.
    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    /// Returns the retention mode byte.
    pub fn mode(&self) -> u8 {
        self.mode
    }

    /// Returns a reference to the payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the payload, consuming the entry.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Returns true if this is a snapshot marker entry.
    pub fn is_snapshot(&self) -> bool {
        self.kind == EntryKind::Snapshot
    }

    /// Returns the total size of this entry's record when serialized,
    /// including the record header.
    pub fn record_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len()
    }
}
