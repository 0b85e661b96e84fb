//! The segmented log.
//!
//! A log is an ordered collection of segments covering disjoint,
//! contiguous index ranges. Exactly one tail segment accepts writes;
//! older segments are sealed. Appends roll to a fresh segment when the
//! active one fills up, and records are never split across segments.

use crate::{Entry, Error, LogConfig, Result, Segment, SegmentDescriptor};
use log::{debug, info};
use std::collections::BTreeMap;
use std::fs;
use std::io;

/// An index-addressed, crash-durable entry store built from fixed-capacity
/// segments.
///
/// # Examples
///
/// ```rust,no_run
/// use replog::{Entry, Log, LogConfig};
///
/// let mut log = Log::open(LogConfig::default()).unwrap();
/// log.append(Entry::new(1, 1, b"command".to_vec())).unwrap();
/// log.flush().unwrap();
/// assert_eq!(log.last_index(), 1);
/// ```
#[derive(Debug)]
pub struct Log {
    config: LogConfig,
    /// Map of first index to segment for routing lookups.
    segments: BTreeMap<u64, Segment>,
    next_segment_id: u64,
    open: bool,
}

impl Log {
    /// Opens the log, recovering any segments already on disk.
    ///
    /// Existing segments are loaded from their descriptor files and sorted
    /// by first index. Appends resume on the newest unsealed segment; a
    /// fresh segment is created when the directory is empty or every
    /// segment is sealed.
    pub fn open(config: LogConfig) -> Result<Self> {
        fs::create_dir_all(&config.directory)?;

        let mut segments = BTreeMap::new();
        let mut max_id = 0;
        for dir_entry in fs::read_dir(&config.directory)? {
            let dir_entry = dir_entry?;
            let file_name = dir_entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with("segment-") && file_name.ends_with(".meta") {
                let descriptor = SegmentDescriptor::load(dir_entry.path())?;
                max_id = max_id.max(descriptor.id());
                let segment = Segment::open(&config.directory, descriptor)?;
                segments.insert(segment.descriptor().index(), segment);
            }
        }

        let mut log = Log {
            config,
            segments,
            next_segment_id: max_id + 1,
            open: true,
        };

        if log.segments.is_empty() {
            log.create_segment(1)?;
        } else if log.active().is_locked() {
            let next_index = log.active().next_index();
            log.create_segment(next_index)?;
        }

        info!(
            "opened log with {} segment(s), last index {}",
            log.segments.len(),
            log.last_index()
        );
        Ok(log)
    }

    /// Appends an entry to the active segment, rolling to a new segment
    /// when the active one is full or the record does not fit.
    pub fn append(&mut self, entry: Entry) -> Result<u64> {
        if !self.open {
            return Err(Error::NotOpen);
        }
        if entry.record_size() as u64 > self.config.max_segment_size {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "record exceeds the segment capacity",
            )));
        }

        let must_roll = {
            let active = self.active();
            active.is_full() || !active.fits(&entry)
        };
        if must_roll {
            self.roll()?;
        }

        self.active_mut().append(&entry)
    }

    /// Reads the entry at the given index.
    ///
    /// Returns `Ok(None)` for an index whose body is absent, and
    /// [`Error::OutOfRange`] when the index falls outside the log bounds.
    pub fn get(&self, index: u64) -> Result<Option<Entry>> {
        if !self.open {
            return Err(Error::NotOpen);
        }
        match self.segment_for(index) {
            Some(segment) if segment.contains_index(index) => segment.get(index),
            _ => Err(Error::OutOfRange {
                index,
                first: self.first_index(),
                last: self.last_index(),
            }),
        }
    }

    /// Returns true if a live entry exists at the given index.
    pub fn contains_entry(&self, index: u64) -> bool {
        self.segment_for(index)
            .map(|segment| segment.contains_entry(index))
            .unwrap_or(false)
    }

    /// Returns the first index in the log, or 0 when the log is empty.
    pub fn first_index(&self) -> u64 {
        self.segments
            .values()
            .next()
            .map(|segment| segment.first_index())
            .unwrap_or(0)
    }

    /// Returns the last index in the log, or 0 when the log is empty.
    pub fn last_index(&self) -> u64 {
        let active = self.active();
        if active.is_empty() {
            active.next_index() - 1
        } else {
            active.last_index()
        }
    }

    /// Truncates the log so that the given index is the last one.
    ///
    /// Segments strictly after the one containing the index are dropped,
    /// then the surviving tail segment is truncated. Truncating at or past
    /// the last index is a no-op. Re-appending at `index + 1` is permitted
    /// afterwards.
    pub fn truncate(&mut self, index: u64) -> Result<()> {
        if !self.open {
            return Err(Error::NotOpen);
        }
        if index >= self.last_index() {
            return Ok(());
        }
        let first = self.first_index();
        if first > 0 && index + 1 < first {
            return Err(Error::OutOfRange {
                index,
                first,
                last: self.last_index(),
            });
        }

        let first_key = *self.segments.keys().next().unwrap();
        let target_key = self
            .segments
            .range(..=index)
            .next_back()
            .map(|(key, _)| *key)
            .unwrap_or(first_key);

        let dropped: Vec<u64> = self
            .segments
            .range(target_key + 1..)
            .map(|(key, _)| *key)
            .collect();
        for key in dropped {
            if let Some(mut segment) = self.segments.remove(&key) {
                info!(
                    "dropping segment {} after truncate to index {}",
                    segment.descriptor().id(),
                    index
                );
                segment.close()?;
                segment.delete()?;
            }
        }

        let (tail_locked, tail_empty, next_index) = {
            let tail = self.segments.get_mut(&target_key).unwrap();
            tail.truncate(index)?;
            (tail.is_locked(), tail.is_empty(), tail.next_index())
        };
        debug!("truncated log to index {}", index);

        // A sealed tail stays immutable; appends resume on a fresh
        // segment. A sealed tail truncated to empty is dropped outright so
        // its replacement can cover the same range.
        if tail_locked {
            if tail_empty {
                if let Some(mut segment) = self.segments.remove(&target_key) {
                    segment.close()?;
                    segment.delete()?;
                }
            }
            self.create_segment(next_index)?;
        }
        Ok(())
    }

    /// Flushes the active segment to stable storage.
    pub fn flush(&mut self) -> Result<()> {
        if !self.open {
            return Err(Error::NotOpen);
        }
        self.active_mut().flush()
    }

    /// Closes every segment. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.open {
            for segment in self.segments.values_mut() {
                segment.close()?;
            }
            self.open = false;
        }
        Ok(())
    }

    /// Returns the number of segments currently in the log.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Returns the log configuration.
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Returns the segment covering the given index, if any.
    fn segment_for(&self, index: u64) -> Option<&Segment> {
        self.segments
            .range(..=index)
            .next_back()
            .map(|(_, segment)| segment)
    }

    fn active(&self) -> &Segment {
        self.segments.values().next_back().unwrap()
    }

    fn active_mut(&mut self) -> &mut Segment {
        self.segments.values_mut().next_back().unwrap()
    }

    /// Seals the active segment and starts a new one after it.
    fn roll(&mut self) -> Result<()> {
        let next_index = {
            let active = self.active_mut();
            active.seal()?;
            active.flush()?;
            active.next_index()
        };
        self.create_segment(next_index)
    }

    fn create_segment(&mut self, first_index: u64) -> Result<()> {
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        let descriptor = SegmentDescriptor::new(id, 1, first_index, self.config.max_segment_size);
        let segment = Segment::create(&self.config.directory, descriptor)?;
        info!("created segment {} starting at index {}", id, first_index);
        self.segments.insert(first_index, segment);
        Ok(())
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
