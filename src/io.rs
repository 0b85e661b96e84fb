//! Binary I/O for the on-disk formats.
//!
//! Three artifacts are read and written here:
//! - Entry records inside a segment data file
//! - Segment descriptor files
//! - Offset index tuples
//!
//! All multi-byte fields are stored in big-endian order.

use crate::entry::RECORD_HEADER_SIZE;
use crate::{Entry, EntryKind, Error, Result, SegmentDescriptor};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

/// Size of one offset index tuple: offset (4), position (8), length (4).
pub const INDEX_TUPLE_SIZE: usize = 16;

/// Size of the fixed descriptor fields, excluding the trailing checksum.
const DESCRIPTOR_FIELDS_SIZE: usize = 33;

/// Writes an entry record into the given buffer slice.
///
/// The slice must be exactly `entry.record_size()` bytes long.
///
/// # Binary Format
/// ```text
/// ┌──────────────┬──────────────┬───────────────┬──────────────────┐
/// │ Type (1 byte)│ Mode (1 byte)│ Term (8 bytes) │ Payload (N bytes)│
/// └──────────────┴──────────────┴───────────────┴──────────────────┘
/// ```
pub fn write_record(buf: &mut [u8], entry: &Entry) -> Result<()> {
    debug_assert_eq!(buf.len(), entry.record_size());
    let mut cursor = Cursor::new(buf);
    cursor.write_u8(entry.kind().tag())?;
    cursor.write_u8(entry.mode())?;
    cursor.write_u64::<BigEndian>(entry.term())?;
    cursor.write_all(entry.payload())?;
    Ok(())
}

/// Reads an entry record from the given buffer slice.
///
/// The slice must span the full record as recorded in the offset index.
/// The entry index is not stored in the record and is supplied by the
/// caller from segment arithmetic.
pub fn read_record(buf: &[u8], index: u64) -> Result<Entry> {
    if buf.len() < RECORD_HEADER_SIZE {
        return Err(Error::Corruption(format!(
            "record at index {} is {} bytes, shorter than the {}-byte header",
            index,
            buf.len(),
            RECORD_HEADER_SIZE
        )));
    }
    let mut cursor = Cursor::new(buf);
    let kind = EntryKind::from_tag(cursor.read_u8()?)?;
    let mode = cursor.read_u8()?;
    let term = cursor.read_u64::<BigEndian>()?;
    let payload = buf[RECORD_HEADER_SIZE..].to_vec();
    Ok(Entry::with_kind(term, index, kind, payload).with_mode(mode))
}

/// Writes a segment descriptor.
///
/// # Binary Format
/// ```text
/// ┌────────────┬────────────────┬──────────────┬──────────────────────┬────────────────┬────────────────┐
/// │ Id (8 bytes)│ Version (8 bytes)│ Index (8 bytes)│ Max Size (8 bytes) │ Locked (1 byte)│ CRC32 (4 bytes)│
/// └────────────┴────────────────┴──────────────┴──────────────────────┴────────────────┴────────────────┘
/// ```
/// The checksum covers all preceding fields. Compatibility is maintained
/// by appending new fields only.
pub fn write_descriptor<W: Write>(writer: &mut W, descriptor: &SegmentDescriptor) -> Result<()> {
    let mut fields = Vec::with_capacity(DESCRIPTOR_FIELDS_SIZE);
    fields.write_u64::<BigEndian>(descriptor.id())?;
    fields.write_u64::<BigEndian>(descriptor.version())?;
    fields.write_u64::<BigEndian>(descriptor.index())?;
    fields.write_u64::<BigEndian>(descriptor.max_segment_size())?;
    fields.write_u8(descriptor.is_locked() as u8)?;

    let checksum = crc32fast::hash(&fields);
    writer.write_all(&fields)?;
    writer.write_u32::<BigEndian>(checksum)?;
    Ok(())
}

/// Reads and validates a segment descriptor.
pub fn read_descriptor<R: Read>(reader: &mut R) -> Result<SegmentDescriptor> {
    let mut fields = [0u8; DESCRIPTOR_FIELDS_SIZE];
    reader
        .read_exact(&mut fields)
        .map_err(|e| Error::Corruption(format!("descriptor file too short: {}", e)))?;
    let stored = reader
        .read_u32::<BigEndian>()
        .map_err(|e| Error::Corruption(format!("descriptor checksum missing: {}", e)))?;

    let actual = crc32fast::hash(&fields);
    if stored != actual {
        return Err(Error::Corruption(format!(
            "descriptor checksum mismatch: expected {:08x}, got {:08x}",
            stored, actual
        )));
    }

    let mut cursor = Cursor::new(&fields[..]);
    let id = cursor.read_u64::<BigEndian>()?;
    let version = cursor.read_u64::<BigEndian>()?;
    let index = cursor.read_u64::<BigEndian>()?;
    let max_segment_size = cursor.read_u64::<BigEndian>()?;
    let locked = cursor.read_u8()? != 0;

    Ok(SegmentDescriptor::restore(
        id,
        version,
        index,
        max_segment_size,
        locked,
    ))
}

/// Writes one offset index tuple.
pub fn write_index_tuple<W: Write>(
    writer: &mut W,
    offset: u32,
    position: u64,
    length: u32,
) -> Result<()> {
    writer.write_u32::<BigEndian>(offset)?;
    writer.write_u64::<BigEndian>(position)?;
    writer.write_u32::<BigEndian>(length)?;
    Ok(())
}

/// Reads one offset index tuple, returning `None` on a clean end of file.
pub fn read_index_tuple<R: Read>(reader: &mut R) -> Result<Option<(u32, u64, u32)>> {
    let mut buf = [0u8; INDEX_TUPLE_SIZE];
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..])? {
            0 if read == 0 => return Ok(None),
            0 => {
                return Err(Error::Corruption(format!(
                    "offset index file ends mid-tuple ({} of {} bytes)",
                    read, INDEX_TUPLE_SIZE
                )))
            }
            n => read += n,
        }
    }
    let mut cursor = Cursor::new(&buf[..]);
    let offset = cursor.read_u32::<BigEndian>()?;
    let position = cursor.read_u64::<BigEndian>()?;
    let length = cursor.read_u32::<BigEndian>()?;
    Ok(Some((offset, position, length)))
}
