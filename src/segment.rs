//! Log segment implementation.
//!
//! A segment is one append-only, fixed-capacity slice of the log. Entry
//! records are written into a memory-mapped data file in strict index
//! order, and an offset index records where each record lives. A sibling
//! descriptor file carries the segment identity and the sealed flag.

use crate::descriptor::{data_filename, descriptor_filename, index_filename};
use crate::io::{read_record, write_record};
use crate::{Entry, Error, OffsetIndex, Result, SegmentDescriptor};
use log::debug;
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

/// Creates or opens a fixed-size file and maps it writable.
fn map_segment_file(path: &Path, size: u64) -> Result<MmapMut> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    file.set_len(size)?;
    let buffer = unsafe { MmapMut::map_mut(&file)? };
    Ok(buffer)
}

/// A single segment of the log.
///
/// Entries are appended at `next_index()` and never rewritten; truncation
/// drops the tail and permits re-appending from the truncation point. A
/// sealed segment rejects all writes. The `skip` counter reserves indices
/// at the tail whose bodies are absent, such as entries removed by
/// compaction.
#[derive(Debug)]
pub struct Segment {
    descriptor: SegmentDescriptor,
    data_path: PathBuf,
    index_path: PathBuf,
    descriptor_path: PathBuf,
    buffer: MmapMut,
    offset_index: OffsetIndex,
    /// Append cursor within the data buffer.
    write_position: u64,
    /// Entries reserved at the tail without bodies.
    skip: u64,
    open: bool,
}

impl Segment {
    /// Creates a new segment in the given directory, persisting its
    /// descriptor and allocating the data file at full capacity.
    pub fn create<P: AsRef<Path>>(directory: P, descriptor: SegmentDescriptor) -> Result<Self> {
        let directory = directory.as_ref();
        let data_path = directory.join(data_filename(descriptor.id(), descriptor.version()));
        let index_path = directory.join(index_filename(descriptor.id(), descriptor.version()));
        let descriptor_path =
            directory.join(descriptor_filename(descriptor.id(), descriptor.version()));

        descriptor.store(&descriptor_path)?;
        let buffer = map_segment_file(&data_path, descriptor.max_segment_size())?;
        let offset_index = OffsetIndex::create(&index_path)?;

        Ok(Self {
            descriptor,
            data_path,
            index_path,
            descriptor_path,
            buffer,
            offset_index,
            write_position: 0,
            skip: 0,
            open: true,
        })
    }

    /// Opens an existing segment, re-deriving the append cursor from the
    /// last recorded offset.
    pub fn open<P: AsRef<Path>>(directory: P, descriptor: SegmentDescriptor) -> Result<Self> {
        let directory = directory.as_ref();
        let data_path = directory.join(data_filename(descriptor.id(), descriptor.version()));
        let index_path = directory.join(index_filename(descriptor.id(), descriptor.version()));
        let descriptor_path =
            directory.join(descriptor_filename(descriptor.id(), descriptor.version()));

        let buffer = map_segment_file(&data_path, descriptor.max_segment_size())?;
        let offset_index = OffsetIndex::open(&index_path)?;

        let write_position = match offset_index.last_offset() {
            Some(last) => {
                let position = offset_index.position(last).ok_or_else(|| {
                    Error::Corruption(format!(
                        "offset index has no position for its last offset {}",
                        last
                    ))
                })?;
                let length = offset_index.length(last).unwrap_or(0);
                position + u64::from(length)
            }
            None => 0,
        };

        if write_position > descriptor.max_segment_size() {
            return Err(Error::Corruption(format!(
                "segment {} append cursor {} exceeds capacity {}",
                descriptor.id(),
                write_position,
                descriptor.max_segment_size()
            )));
        }

        Ok(Self {
            descriptor,
            data_path,
            index_path,
            descriptor_path,
            buffer,
            offset_index,
            write_position,
            skip: 0,
            open: true,
        })
    }

    /// Returns the segment descriptor.
    pub fn descriptor(&self) -> &SegmentDescriptor {
        &self.descriptor
    }

    /// Returns true while the segment is open.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Returns true if the segment holds no entries.
    pub fn is_empty(&self) -> bool {
        self.offset_index.size() == 0
    }

    /// Returns true once the data size has reached the configured maximum.
    pub fn is_full(&self) -> bool {
        self.size() >= self.descriptor.max_segment_size()
    }

    /// Returns true once the segment has been sealed.
    pub fn is_locked(&self) -> bool {
        self.descriptor.is_locked()
    }

    /// Returns the data size of the segment in bytes.
    pub fn size(&self) -> u64 {
        self.write_position
    }

    /// Returns the logical entry count, including skipped entries.
    pub fn length(&self) -> u64 {
        let written = self
            .offset_index
            .last_offset()
            .map(|o| u64::from(o) + 1)
            .unwrap_or(0);
        written + self.skip
    }

    /// Returns the index of the first entry, or 0 when the segment is empty.
    pub fn first_index(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.descriptor.index()
        }
    }

    /// Returns the index of the last entry, or 0 when the segment is empty.
    pub fn last_index(&self) -> u64 {
        match self.offset_index.last_offset() {
            Some(last) => self.descriptor.index() + u64::from(last),
            None => 0,
        }
    }

    /// Returns the next index to be appended.
    pub fn next_index(&self) -> u64 {
        if self.is_empty() {
            self.descriptor.index() + self.skip
        } else {
            self.last_index() + self.skip + 1
        }
    }

    /// Returns true if the given record would fit in the remaining capacity.
    pub fn fits(&self, entry: &Entry) -> bool {
        self.write_position + entry.record_size() as u64 <= self.buffer.len() as u64
    }

    fn offset(&self, index: u64) -> u32 {
        (index - self.descriptor.index()) as u32
    }

    /// Appends an entry at the segment's next index.
    ///
    /// Fails with [`Error::CommittedEntryModified`] when the entry index
    /// falls below the next index, and with [`Error::NonMonotonicIndex`]
    /// when it skips ahead of it. The write is not flushed implicitly.
    pub fn append(&mut self, entry: &Entry) -> Result<u64> {
        if !self.open || self.is_locked() {
            return Err(Error::NotOpen);
        }

        let next_index = self.next_index();
        if entry.index() < next_index {
            return Err(Error::CommittedEntryModified {
                index: entry.index(),
                next_index,
            });
        }
        if entry.index() > next_index {
            return Err(Error::NonMonotonicIndex {
                index: entry.index(),
                next_index,
            });
        }

        let length = entry.record_size();
        let position = self.write_position;
        let end = position + length as u64;
        if end > self.buffer.len() as u64 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "record does not fit in the segment",
            )));
        }

        let offset = self.offset(entry.index());
        write_record(
            &mut self.buffer[position as usize..end as usize],
            entry,
        )?;
        self.offset_index.index(offset, position, length as u32)?;
        self.write_position = end;

        debug!(
            "appended index {} ({} bytes) to segment {}",
            entry.index(),
            length,
            self.descriptor.id()
        );
        Ok(entry.index())
    }

    /// Reads the entry at the given index.
    ///
    /// Returns `Ok(None)` when the index is in range but its offset has no
    /// recorded position, which happens after deduplication or compaction.
    pub fn get(&self, index: u64) -> Result<Option<Entry>> {
        if !self.open {
            return Err(Error::NotOpen);
        }
        if !self.contains_index(index) {
            return Err(Error::OutOfRange {
                index,
                first: self.first_index(),
                last: self.last_index(),
            });
        }

        let offset = self.offset(index);
        let position = match self.offset_index.position(offset) {
            Some(position) => position,
            None => return Ok(None),
        };
        let length = self.offset_index.length(offset).unwrap_or(0) as usize;
        let record = &self.buffer[position as usize..position as usize + length];
        read_record(record, index).map(Some)
    }

    /// Returns true if the index falls within the segment range.
    pub fn contains_index(&self, index: u64) -> bool {
        !self.is_empty() && index >= self.descriptor.index() && index <= self.last_index()
    }

    /// Returns true if a live entry exists at the given index.
    pub fn contains_entry(&self, index: u64) -> bool {
        self.contains_index(index) && self.offset_index.contains(self.offset(index))
    }

    /// Advances the next index by `entries` without writing bodies.
    pub fn skip(&mut self, entries: u64) -> Result<()> {
        if !self.open {
            return Err(Error::NotOpen);
        }
        self.skip += entries;
        Ok(())
    }

    /// Drops all entries with an index greater than the argument.
    ///
    /// Skipped entries past the truncation point are dropped as well, and
    /// the offset index is flushed so the truncation survives a restart.
    /// Re-appending at the new next index is then permitted.
    pub fn truncate(&mut self, index: u64) -> Result<()> {
        if !self.open {
            return Err(Error::NotOpen);
        }

        let written_tail = if self.is_empty() {
            self.descriptor.index().saturating_sub(1)
        } else {
            self.last_index()
        };
        self.skip = self.skip.min(index.saturating_sub(written_tail));

        if !self.is_empty() && index < self.last_index() {
            if index < self.descriptor.index() {
                self.offset_index.clear()?;
            } else {
                let offset = self.offset(index);
                self.offset_index.truncate(offset)?;
            }
            self.write_position = match self.offset_index.last_offset() {
                Some(last) => {
                    let position = self.offset_index.position(last).unwrap_or(0);
                    position + u64::from(self.offset_index.length(last).unwrap_or(0))
                }
                None => 0,
            };
        }

        self.offset_index.flush()?;
        Ok(())
    }

    /// Seals the segment, persisting the locked flag. All future appends
    /// fail.
    pub fn seal(&mut self) -> Result<()> {
        if !self.open {
            return Err(Error::NotOpen);
        }
        self.descriptor.lock();
        self.descriptor.store(&self.descriptor_path)?;
        Ok(())
    }

    /// Flushes the data buffer and offset index to stable storage.
    pub fn flush(&mut self) -> Result<()> {
        self.buffer.flush()?;
        self.offset_index.flush()?;
        Ok(())
    }

    /// Flushes and closes the segment. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.open {
            self.flush()?;
            self.open = false;
        }
        Ok(())
    }

    /// Removes the segment's files from disk. The segment must be closed.
    pub fn delete(self) -> Result<()> {
        debug_assert!(!self.open, "segment must be closed before delete");
        let data_path = self.data_path.clone();
        let index_path = self.index_path.clone();
        let descriptor_path = self.descriptor_path.clone();
        // Release the mapping and file handles before unlinking.
        drop(self);
        std::fs::remove_file(data_path)?;
        std::fs::remove_file(index_path)?;
        std::fs::remove_file(descriptor_path)?;
        Ok(())
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // Ensure buffered writes reach the files even without an explicit
        // close.
        if self.open {
            let _ = self.flush();
        }
    }
}
