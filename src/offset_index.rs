//! Per-segment offset index.
//!
//! Maps segment-local offsets to the byte position and length of the
//! serialized record inside the segment data file. The index is kept in
//! memory and mirrored to a file so that truncation survives a restart.

use crate::io::{read_index_tuple, write_index_tuple, INDEX_TUPLE_SIZE};
use crate::Result;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexEntry {
    offset: u32,
    position: u64,
    length: u32,
}

/// Dense mapping from segment-local offset to record position and length.
///
/// Writes are append-only with strictly increasing offsets. The offsets
/// present form a subset of `0..=last_offset`; holes appear when entries
/// are removed by deduplication or compaction, in which case `position`
/// reports the offset as absent.
#[derive(Debug)]
pub struct OffsetIndex {
    file: File,
    entries: Vec<IndexEntry>,
}

impl OffsetIndex {
    /// Creates a new empty offset index backed by the given file.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file,
            entries: Vec::new(),
        })
    }

    /// Opens an existing offset index, loading all tuples into memory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut entries = Vec::new();
        let mut reader = BufReader::new(&file);
        while let Some((offset, position, length)) = read_index_tuple(&mut reader)? {
            entries.push(IndexEntry {
                offset,
                position,
                length,
            });
        }

        Ok(Self { file, entries })
    }

    /// Records the position and length of the record at the given offset.
    ///
    /// Offsets must be appended in strictly increasing order.
    pub fn index(&mut self, offset: u32, position: u64, length: u32) -> Result<()> {
        debug_assert!(
            self.entries.last().map_or(true, |e| offset > e.offset),
            "offset index writes must be strictly increasing"
        );

        self.file
            .seek(SeekFrom::Start((self.entries.len() * INDEX_TUPLE_SIZE) as u64))?;
        write_index_tuple(&mut self.file, offset, position, length)?;

        self.entries.push(IndexEntry {
            offset,
            position,
            length,
        });
        Ok(())
    }

    /// Returns the byte position of the record at the given offset, or
    /// `None` if the offset was never written or has been removed.
    pub fn position(&self, offset: u32) -> Option<u64> {
        self.find(offset).map(|e| e.position)
    }

    /// Returns the record length at the given offset.
    ///
    /// Only valid for offsets with a recorded position.
    pub fn length(&self, offset: u32) -> Option<u32> {
        self.find(offset).map(|e| e.length)
    }

    /// Returns the highest recorded offset, or `None` when empty.
    pub fn last_offset(&self) -> Option<u32> {
        self.entries.last().map(|e| e.offset)
    }

    /// Returns true if the given offset has a live record.
    pub fn contains(&self, offset: u32) -> bool {
        self.find(offset).is_some()
    }

    /// Returns the number of live entries in the index.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Drops all entries with an offset greater than the argument and
    /// rewrites the file tail. Idempotent.
    pub fn truncate(&mut self, offset: u32) -> Result<()> {
        let keep = self.entries.partition_point(|e| e.offset <= offset);
        if keep == self.entries.len() {
            return Ok(());
        }
        self.entries.truncate(keep);
        self.file
            .set_len((self.entries.len() * INDEX_TUPLE_SIZE) as u64)?;
        Ok(())
    }

    /// Drops every entry and empties the file.
    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.file.set_len(0)?;
        Ok(())
    }

    /// Makes all accepted writes durable.
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn find(&self, offset: u32) -> Option<&IndexEntry> {
        self.entries
            .binary_search_by_key(&offset, |e| e.offset)
            .ok()
            .map(|i| &self.entries[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_index() -> (OffsetIndex, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("segment-0000000001-001.idx");
        let index = OffsetIndex::create(&path).expect("Failed to create offset index");
        (index, temp_dir)
    }

    #[test]
    fn test_empty_index() {
        let (index, _temp_dir) = create_test_index();
        assert_eq!(index.size(), 0);
        assert_eq!(index.last_offset(), None);
        assert_eq!(index.position(0), None);
        assert!(!index.contains(0));
    }

    #[test]
    fn test_index_and_lookup() {
        let (mut index, _temp_dir) = create_test_index();

        index.index(0, 0, 25).unwrap();
        index.index(1, 25, 30).unwrap();
        index.index(2, 55, 12).unwrap();

        assert_eq!(index.size(), 3);
        assert_eq!(index.last_offset(), Some(2));
        assert_eq!(index.position(1), Some(25));
        assert_eq!(index.length(1), Some(30));
        assert!(index.contains(2));
        assert!(!index.contains(3));
        assert_eq!(index.position(3), None);
    }

    #[test]
    fn test_truncate_drops_tail() {
        let (mut index, _temp_dir) = create_test_index();

        for i in 0..5u32 {
            index.index(i, (i as u64) * 10, 10).unwrap();
        }

        index.truncate(2).unwrap();
        assert_eq!(index.size(), 3);
        assert_eq!(index.last_offset(), Some(2));
        assert!(!index.contains(3));
        assert!(!index.contains(4));

        // Truncation past the end is a no-op.
        index.truncate(10).unwrap();
        assert_eq!(index.size(), 3);

        // Idempotent.
        index.truncate(2).unwrap();
        assert_eq!(index.size(), 3);
    }

    #[test]
    fn test_clear() {
        let (mut index, _temp_dir) = create_test_index();
        index.index(0, 0, 10).unwrap();
        index.index(1, 10, 10).unwrap();

        index.clear().unwrap();
        assert_eq!(index.size(), 0);
        assert_eq!(index.last_offset(), None);
    }

    #[test]
    fn test_reappend_after_truncate() {
        let (mut index, _temp_dir) = create_test_index();
        index.index(0, 0, 10).unwrap();
        index.index(1, 10, 10).unwrap();
        index.truncate(0).unwrap();

        index.index(1, 10, 20).unwrap();
        assert_eq!(index.length(1), Some(20));
        assert_eq!(index.last_offset(), Some(1));
    }

    #[test]
    fn test_persistence_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("segment-0000000001-001.idx");

        {
            let mut index = OffsetIndex::create(&path).unwrap();
            index.index(0, 0, 25).unwrap();
            index.index(1, 25, 30).unwrap();
            index.index(2, 55, 12).unwrap();
            index.truncate(1).unwrap();
            index.flush().unwrap();
        }

        let index = OffsetIndex::open(&path).unwrap();
        assert_eq!(index.size(), 2);
        assert_eq!(index.last_offset(), Some(1));
        assert_eq!(index.position(0), Some(0));
        assert_eq!(index.length(1), Some(30));
        assert!(!index.contains(2));
    }
}
