//! Segment descriptor and on-disk naming scheme.

use crate::io::{read_descriptor, write_descriptor};
use crate::Result;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Metadata identifying one segment of the log.
///
/// The descriptor is persisted in a sibling file next to the segment data
/// and offset index files. The `id` is monotonic across the life of the
/// log, the `version` is bumped when a segment is rewritten, and `index`
/// is the first log index the segment covers. Once `locked` is set the
/// segment is immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDescriptor {
    id: u64,
    version: u64,
    index: u64,
    max_segment_size: u64,
    locked: bool,
}

impl SegmentDescriptor {
    /// Creates a descriptor for a new, unlocked segment.
    pub fn new(id: u64, version: u64, index: u64, max_segment_size: u64) -> Self {
        Self {
            id,
            version,
            index,
            max_segment_size,
            locked: false,
        }
    }

    /// Rebuilds a descriptor from persisted fields.
    pub(crate) fn restore(
        id: u64,
        version: u64,
        index: u64,
        max_segment_size: u64,
        locked: bool,
    ) -> Self {
        Self {
            id,
            version,
            index,
            max_segment_size,
            locked,
        }
    }

    /// Loads a descriptor from its file, validating the checksum.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)?;
        read_descriptor(&mut file)
    }

    /// Persists the descriptor, overwriting the file in place.
    pub fn store<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        write_descriptor(&mut file, self)?;
        file.sync_data()?;
        Ok(())
    }

    /// Returns the monotonic segment id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the segment version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Returns the first log index covered by the segment.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Returns the maximum data size of the segment in bytes.
    pub fn max_segment_size(&self) -> u64 {
        self.max_segment_size
    }

    /// Returns true once the segment has been sealed.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Marks the segment immutable.
    pub(crate) fn lock(&mut self) {
        self.locked = true;
    }
}

/// Generates the data file name for a segment.
pub fn data_filename(id: u64, version: u64) -> String {
    format!("segment-{:010}-{:03}.log", id, version)
}

/// Generates the offset index file name for a segment.
pub fn index_filename(id: u64, version: u64) -> String {
    format!("segment-{:010}-{:03}.idx", id, version)
}

/// Generates the descriptor file name for a segment.
pub fn descriptor_filename(id: u64, version: u64) -> String {
    format!("segment-{:010}-{:03}.meta", id, version)
}
