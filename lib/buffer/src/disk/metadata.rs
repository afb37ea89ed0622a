use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;

use crate::Error;

const VERSION: u64 = 1;

/// Descriptor for an entry that has been read from the data file but not
/// yet confirmed flushed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EntryDescriptor {
    /// Set once the flusher confirms delivery; the bytes become
    /// reclaimable by compaction.
    pub flushed: bool,

    /// On-disk size of the record, length prefix included.
    pub length: i64,

    /// Ring offset of the record start in the data file.
    pub start_offset: i64,

    /// Read-batch this descriptor belongs to. Not persisted: after a
    /// restart nothing is in flight.
    pub batch: u64,
}

/// The metadata sidecar for a disk buffer.
///
/// On-disk layout, little-endian:
///
/// - `u64` version
/// - `i64` dead range start, `i64` dead range length
/// - `i64` unread region start offset, `i64` unread entry count
/// - `u64` read descriptor count, then per descriptor:
///   `u8` flushed, `i64` length, `i64` start offset
///
/// Syncing serializes into a scratch buffer, writes it at offset zero and
/// truncates to the new length; the format self-describes its length, so
/// an un-truncated tail never corrupts a read.
#[derive(Debug)]
pub(crate) struct Metadata {
    file: File,
    scratch: Vec<u8>,

    /// Bytes duplicated by an in-progress compaction slide. A non-empty
    /// dead range in a freshly opened file means a crash interrupted
    /// compaction; recovery must finish the slide before serving I/O.
    pub dead_range_start: i64,
    pub dead_range_length: i64,

    pub unread_start_offset: i64,
    pub unread_count: i64,

    /// Descriptors for the read region, in entry order.
    pub read: Vec<EntryDescriptor>,
}

impl Metadata {
    pub fn open(path: &Path) -> Result<Metadata, Error> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(path)?;

        let mut metadata = Metadata {
            file: file.try_clone()?,
            scratch: Vec::with_capacity(1 << 10),
            dead_range_start: 0,
            dead_range_length: 0,
            unread_start_offset: 0,
            unread_count: 0,
            read: Vec::new(),
        };

        if file.metadata()?.len() > 0 {
            let mut raw = Vec::new();
            file.read_to_end(&mut raw)?;
            metadata.decode(&raw)?;
        } else {
            metadata.sync()?;
        }

        Ok(metadata)
    }

    /// Persists the full record atomically enough: single buffered write,
    /// then truncate.
    pub fn sync(&mut self) -> Result<(), Error> {
        self.scratch.clear();
        encode_u64(&mut self.scratch, VERSION);
        encode_i64(&mut self.scratch, self.dead_range_start);
        encode_i64(&mut self.scratch, self.dead_range_length);
        encode_i64(&mut self.scratch, self.unread_start_offset);
        encode_i64(&mut self.scratch, self.unread_count);
        encode_u64(&mut self.scratch, self.read.len() as u64);
        for descriptor in &self.read {
            self.scratch.push(descriptor.flushed as u8);
            encode_i64(&mut self.scratch, descriptor.length);
            encode_i64(&mut self.scratch, descriptor.start_offset);
        }

        self.file.write_all_at(&self.scratch, 0)?;
        self.file.set_len(self.scratch.len() as u64)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Updates just the dead range, patching the 16 bytes in place. Called
    /// once per compaction slide step, so it stays cheap.
    pub fn set_dead_range(&mut self, start: i64, length: i64) -> Result<(), Error> {
        self.dead_range_start = start;
        self.dead_range_length = length;

        let mut patch = [0u8; 16];
        patch[..8].copy_from_slice(&start.to_le_bytes());
        patch[8..].copy_from_slice(&length.to_le_bytes());
        self.file.write_all_at(&patch, 8)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn decode(&mut self, raw: &[u8]) -> Result<(), Error> {
        let mut cursor = Cursor { raw, pos: 0 };

        let version = cursor.u64()?;
        if version != VERSION {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsupported metadata version {version}"),
            )));
        }

        self.dead_range_start = cursor.i64()?;
        self.dead_range_length = cursor.i64()?;
        self.unread_start_offset = cursor.i64()?;
        self.unread_count = cursor.i64()?;

        let count = cursor.u64()?;
        self.read = Vec::with_capacity(count.min(1 << 20) as usize);
        for _ in 0..count {
            let flushed = cursor.u8()? != 0;
            let length = cursor.i64()?;
            let start_offset = cursor.i64()?;
            self.read.push(EntryDescriptor {
                flushed,
                length,
                start_offset,
                batch: 0,
            });
        }

        Ok(())
    }

    pub fn close(&mut self) -> Result<(), Error> {
        self.sync()
    }
}

struct Cursor<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8], Error> {
        if self.pos + n > self.raw.len() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "metadata record truncated",
            )));
        }

        let slice = &self.raw[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64, Error> {
        let raw = self.take(8)?;
        Ok(u64::from_le_bytes(raw.try_into().expect("8 bytes")))
    }

    fn i64(&mut self) -> Result<i64, Error> {
        let raw = self.take(8)?;
        Ok(i64::from_le_bytes(raw.try_into().expect("8 bytes")))
    }
}

fn encode_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn encode_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(flushed: bool, length: i64, start_offset: i64) -> EntryDescriptor {
        EntryDescriptor {
            flushed,
            length,
            start_offset,
            batch: 0,
        }
    }

    #[test]
    fn round_trip() {
        let path = testify::temp_file();

        {
            let mut metadata = Metadata::open(&path).unwrap();
            metadata.dead_range_start = 128;
            metadata.dead_range_length = 64;
            metadata.unread_start_offset = 512;
            metadata.unread_count = 7;
            metadata.read = vec![
                descriptor(true, 32, 0),
                descriptor(false, 48, 32),
                descriptor(true, 16, 80),
            ];
            metadata.sync().unwrap();
        }

        let metadata = Metadata::open(&path).unwrap();
        assert_eq!(metadata.dead_range_start, 128);
        assert_eq!(metadata.dead_range_length, 64);
        assert_eq!(metadata.unread_start_offset, 512);
        assert_eq!(metadata.unread_count, 7);
        assert_eq!(
            metadata.read,
            vec![
                descriptor(true, 32, 0),
                descriptor(false, 48, 32),
                descriptor(true, 16, 80),
            ]
        );
    }

    #[test]
    fn empty_file_initializes_defaults() {
        let path = testify::temp_file();
        let metadata = Metadata::open(&path).unwrap();
        assert_eq!(metadata.unread_count, 0);
        assert_eq!(metadata.dead_range_length, 0);
        assert!(metadata.read.is_empty());
    }

    #[test]
    fn dead_range_patch_is_visible_on_reopen() {
        let path = testify::temp_file();

        {
            let mut metadata = Metadata::open(&path).unwrap();
            metadata.unread_count = 3;
            metadata.sync().unwrap();
            metadata.set_dead_range(100, 50).unwrap();
        }

        let metadata = Metadata::open(&path).unwrap();
        assert_eq!(metadata.dead_range_start, 100);
        assert_eq!(metadata.dead_range_length, 50);
        assert_eq!(metadata.unread_count, 3);
    }

    #[test]
    fn shrinking_rewrite_truncates() {
        let path = testify::temp_file();

        {
            let mut metadata = Metadata::open(&path).unwrap();
            metadata.read = (0..10).map(|i| descriptor(false, 10, i * 10)).collect();
            metadata.sync().unwrap();

            metadata.read.truncate(1);
            metadata.sync().unwrap();
        }

        let metadata = Metadata::open(&path).unwrap();
        assert_eq!(metadata.read.len(), 1);
    }

    #[test]
    fn truncated_record_is_an_error() {
        let path = testify::temp_file();

        {
            let mut metadata = Metadata::open(&path).unwrap();
            metadata.read = vec![descriptor(false, 10, 0)];
            metadata.sync().unwrap();
        }

        // Chop the file mid-descriptor.
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(50).unwrap();
        drop(file);

        assert!(Metadata::open(&path).is_err());
    }
}
