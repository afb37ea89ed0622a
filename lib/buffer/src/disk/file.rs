use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;

use crate::Error;

/// A fixed-size file behaving as a byte ring with an independent read
/// cursor.
///
/// The live region is `[start, end)` modulo `size`; `full` disambiguates
/// `start == end` when the ring holds `size` bytes. `read_ptr` walks the
/// live region without consuming it; `discard` is what frees bytes.
/// `read_ptr_at_end` distinguishes "read everything" from "read nothing"
/// when `read_ptr == end`.
///
/// Methods are not synchronized; the owning buffer serializes access.
#[derive(Debug)]
pub(crate) struct CircularFile {
    size: u64,
    start: u64,
    read_ptr: u64,
    end: u64,
    full: bool,
    read_ptr_at_end: bool,

    // Seek coalescing: a steady stream of reads or writes issues one seek.
    seeked_read: bool,
    seeked_end: bool,

    closed: bool,
    file: File,
}

impl CircularFile {
    /// Opens (or creates) the ring at `path`. A new file is truncated out
    /// to `size`; an existing file must be exactly `size` bytes or the
    /// open fails, because a resized ring cannot be interpreted.
    pub fn open(path: &Path, sync_writes: bool, size: u64) -> Result<CircularFile, Error> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).mode(0o600);
        if sync_writes {
            options.custom_flags(libc::O_SYNC);
        }

        let mut file = options.open(path)?;

        let on_disk = file.seek(SeekFrom::End(0))?;
        if on_disk == 0 {
            file.set_len(size)?;
        } else if on_disk != size {
            return Err(Error::SizeMismatch {
                configured: size,
                on_disk,
            });
        }

        Ok(CircularFile {
            size,
            start: 0,
            read_ptr: 0,
            end: 0,
            full: false,
            read_ptr_at_end: true,
            seeked_read: false,
            seeked_end: false,
            closed: false,
            file,
        })
    }

    /// Restores ring positions recovered from buffer metadata.
    pub fn restore(&mut self, start: u64, read_ptr: u64, end: u64, full: bool) {
        self.start = start % self.size;
        self.read_ptr = read_ptr % self.size;
        self.end = end % self.size;
        self.full = full;
        self.read_ptr_at_end = self.read_ptr == self.end && !self.is_fully_unread_state(full);
        self.seeked_read = false;
        self.seeked_end = false;
    }

    fn is_fully_unread_state(&self, full: bool) -> bool {
        // Only a full ring with the read cursor at start is fully unread
        // when the cursor coincides with end.
        full && self.read_ptr == self.start
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn read_ptr(&self) -> u64 {
        self.read_ptr
    }

    /// Bytes currently stored in the ring.
    pub fn len(&self) -> u64 {
        if self.full {
            return self.size;
        }

        if self.start <= self.end {
            self.end - self.start
        } else {
            self.end + (self.size - self.start)
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.full && self.start == self.end
    }

    /// True when the ring is full and none of it has been read.
    fn is_fully_unread(&self) -> bool {
        !self.read_ptr_at_end && self.read_ptr == self.end
    }

    /// Bytes between the read cursor and the end of data.
    pub fn read_bytes_left(&self) -> u64 {
        if self.is_fully_unread() {
            return self.size;
        }

        if self.read_ptr <= self.end {
            self.end - self.read_ptr
        } else {
            self.end + (self.size - self.read_ptr)
        }
    }

    /// Free space available for writing.
    pub fn write_bytes_left(&self) -> u64 {
        self.size - self.len()
    }

    /// Writes as much of `buf` as fits between `end` and `start`, wrapping
    /// around. Returns the bytes written and whether the ring filled before
    /// `buf` was exhausted; once full, writes return `(0, true)` until
    /// bytes are discarded.
    pub fn write(&mut self, buf: &[u8]) -> Result<(usize, bool), Error> {
        if self.closed {
            return Err(Error::Closed);
        }

        if buf.is_empty() {
            return Ok((0, false));
        }

        let available = self.write_bytes_left();
        let total = (buf.len() as u64).min(available);
        let hit_end = total < buf.len() as u64;

        let mut written = 0u64;
        while written < total {
            let until_wrap = self.size - self.end;
            let segment = (total - written).min(until_wrap);

            self.seek_end()?;
            let lo = written as usize;
            let hi = (written + segment) as usize;
            self.file.write_all(&buf[lo..hi])?;
            written += segment;

            if segment > 0 {
                // The live region grew, so the read cursor can no longer
                // be at the end of data.
                self.read_ptr_at_end = false;
            }

            self.end = (self.end + segment) % self.size;
            if self.end == 0 {
                // Wrapped; the underlying cursor is at the physical end.
                self.seeked_end = false;
            }
        }

        if total > 0 && self.start == self.end {
            self.full = true;
        }

        Ok((total as usize, hit_end))
    }

    /// Reads up to `buf.len()` bytes from the read cursor, wrapping as
    /// needed, and advances the cursor. Reading never consumes; `discard`
    /// does. Returns the bytes read and whether fewer were available than
    /// requested.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<(usize, bool), Error> {
        if self.closed {
            return Err(Error::Closed);
        }

        if buf.is_empty() {
            return Ok((0, false));
        }

        let available = self.read_bytes_left();
        let total = (buf.len() as u64).min(available);
        let eof = available < buf.len() as u64;

        let mut done = 0u64;
        while done < total {
            let until_wrap = self.size - self.read_ptr;
            let segment = (total - done).min(until_wrap);

            self.seek_read()?;
            let lo = done as usize;
            let hi = (done + segment) as usize;
            self.file.read_exact(&mut buf[lo..hi])?;
            done += segment;

            self.read_ptr = (self.read_ptr + segment) % self.size;
            if self.read_ptr == 0 {
                self.seeked_read = false;
            }
        }

        if self.read_ptr == self.end && total != 0 {
            self.read_ptr_at_end = true;
        }

        Ok((total as usize, eof))
    }

    /// Removes `n` bytes from the head of the ring (clamped to the live
    /// length) and resets the read cursor to `start`. `discard(0)` just
    /// resets the cursor.
    pub fn discard(&mut self, n: u64) {
        self.seeked_read = false;

        if n == 0 {
            self.read_ptr = self.start;
            self.read_ptr_at_end = !self.full && self.read_ptr == self.end;
            return;
        }

        if n > self.len() {
            self.start = self.end;
        } else {
            self.start = (self.start + n) % self.size;
        }

        self.read_ptr = self.start;
        self.full = false;
        self.read_ptr_at_end = self.read_ptr == self.end;
    }

    /// Advances `start` without touching the read cursor. Used by
    /// compaction, which reclaims bytes below the cursor.
    pub fn advance_start(&mut self, n: u64) {
        if n == 0 {
            return;
        }

        self.start = (self.start + n) % self.size;
        self.full = false;
    }

    /// Wrap-aware positional read; does not disturb cursors or seek state.
    pub fn read_at(&self, ring_offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        if self.closed {
            return Err(Error::Closed);
        }

        let offset = ring_offset % self.size;
        let until_wrap = (self.size - offset).min(buf.len() as u64) as usize;
        self.file.read_exact_at(&mut buf[..until_wrap], offset)?;
        if until_wrap < buf.len() {
            self.file.read_exact_at(&mut buf[until_wrap..], 0)?;
        }

        Ok(())
    }

    /// Wrap-aware positional write; does not disturb cursors or seek state.
    pub fn write_at(&self, ring_offset: u64, buf: &[u8]) -> Result<(), Error> {
        if self.closed {
            return Err(Error::Closed);
        }

        let offset = ring_offset % self.size;
        let until_wrap = (self.size - offset).min(buf.len() as u64) as usize;
        self.file.write_all_at(&buf[..until_wrap], offset)?;
        if until_wrap < buf.len() {
            self.file.write_all_at(&buf[until_wrap..], 0)?;
        }

        Ok(())
    }

    pub fn sync(&self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::Closed);
        }

        self.file.sync_data()?;
        Ok(())
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    fn seek_read(&mut self) -> Result<(), Error> {
        if self.seeked_read {
            return Ok(());
        }

        match self.file.seek(SeekFrom::Start(self.read_ptr)) {
            Ok(_) => {
                self.seeked_read = true;
                self.seeked_end = false;
                Ok(())
            }
            Err(err) => {
                self.seeked_read = false;
                self.seeked_end = false;
                Err(err.into())
            }
        }
    }

    fn seek_end(&mut self) -> Result<(), Error> {
        if self.seeked_end {
            return Ok(());
        }

        match self.file.seek(SeekFrom::Start(self.end)) {
            Ok(_) => {
                self.seeked_end = true;
                self.seeked_read = false;
                Ok(())
            }
            Err(err) => {
                self.seeked_read = false;
                self.seeked_end = false;
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_ring(size: u64) -> (CircularFile, std::path::PathBuf) {
        let path = testify::temp_file();
        let cf = CircularFile::open(&path, false, size).unwrap();
        (cf, path)
    }

    #[test]
    fn write_then_read_round_trip() {
        let (mut cf, _path) = open_ring(16);

        let (n, eof) = cf.write(b"hello").unwrap();
        assert_eq!((n, eof), (5, false));

        let mut buf = [0u8; 5];
        let (n, eof) = cf.read(&mut buf).unwrap();
        assert_eq!((n, eof), (5, false));
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn read_more_than_available_is_eof() {
        let (mut cf, _path) = open_ring(16);
        cf.write(b"abc").unwrap();

        let mut buf = [0u8; 8];
        let (n, eof) = cf.read(&mut buf).unwrap();
        assert_eq!((n, eof), (3, true));
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn read_empty_ring_is_eof() {
        let (mut cf, _path) = open_ring(16);
        let mut buf = [0u8; 4];
        assert_eq!(cf.read(&mut buf).unwrap(), (0, true));
    }

    #[test]
    fn fill_exactly_then_one_more_byte() {
        let (mut cf, _path) = open_ring(8);

        let (n, eof) = cf.write(b"12345678").unwrap();
        assert_eq!((n, eof), (8, false));
        assert!(cf.full);
        assert_eq!(cf.len(), 8);

        // No remainder fits.
        assert_eq!(cf.write(b"9").unwrap(), (0, true));
    }

    #[test]
    fn full_ring_reads_size_bytes() {
        let (mut cf, _path) = open_ring(8);
        cf.write(b"abcdefgh").unwrap();

        // read_ptr == end with full = true means everything is readable.
        assert_eq!(cf.read_bytes_left(), 8);
        let mut buf = [0u8; 8];
        assert_eq!(cf.read(&mut buf).unwrap(), (8, false));
        assert_eq!(&buf, b"abcdefgh");

        // Now read_ptr == end with everything consumed.
        assert_eq!(cf.read_bytes_left(), 0);
        assert_eq!(cf.read(&mut buf).unwrap(), (0, true));
    }

    #[test]
    fn wrapped_write_equals_contiguous_write() {
        let (mut cf, _path) = open_ring(8);

        // Push start/end forward so the next write wraps.
        cf.write(b"xxxxx").unwrap();
        let mut sink = [0u8; 5];
        cf.read(&mut sink).unwrap();
        cf.discard(5);

        let (n, eof) = cf.write(b"abcdef").unwrap();
        assert_eq!((n, eof), (6, false));

        let mut buf = [0u8; 6];
        assert_eq!(cf.read(&mut buf).unwrap(), (6, false));
        assert_eq!(&buf, b"abcdef");
    }

    #[test]
    fn partial_write_when_almost_full() {
        let (mut cf, _path) = open_ring(8);
        cf.write(b"abcdef").unwrap();

        let (n, eof) = cf.write(b"wxyz").unwrap();
        assert_eq!((n, eof), (2, true));
        assert!(cf.full);

        let mut buf = [0u8; 8];
        assert_eq!(cf.read(&mut buf).unwrap(), (8, false));
        assert_eq!(&buf, b"abcdefwx");
    }

    #[test]
    fn discard_frees_space_and_resets_cursor() {
        let (mut cf, _path) = open_ring(8);
        cf.write(b"abcdef").unwrap();

        let mut buf = [0u8; 3];
        cf.read(&mut buf).unwrap();
        cf.discard(3);

        assert_eq!(cf.len(), 3);
        assert_eq!(cf.read_ptr(), cf.start());

        let mut rest = [0u8; 3];
        assert_eq!(cf.read(&mut rest).unwrap(), (3, false));
        assert_eq!(&rest, b"def");
    }

    #[test]
    fn discard_zero_resets_read_ptr_only() {
        let (mut cf, _path) = open_ring(8);
        cf.write(b"abcd").unwrap();

        let mut buf = [0u8; 2];
        cf.read(&mut buf).unwrap();
        cf.discard(0);

        assert_eq!(cf.len(), 4);
        let mut again = [0u8; 2];
        cf.read(&mut again).unwrap();
        assert_eq!(&again, b"ab");
    }

    #[test]
    fn discard_more_than_len_empties() {
        let (mut cf, _path) = open_ring(8);
        cf.write(b"abcd").unwrap();
        cf.discard(100);

        assert!(cf.is_empty());
        let mut buf = [0u8; 1];
        assert_eq!(cf.read(&mut buf).unwrap(), (0, true));
    }

    #[test]
    fn reopen_with_wrong_size_fails() {
        let path = testify::temp_file();
        let cf = CircularFile::open(&path, false, 64).unwrap();
        drop(cf);

        let err = CircularFile::open(&path, false, 128).unwrap_err();
        assert!(matches!(
            err,
            Error::SizeMismatch {
                configured: 128,
                on_disk: 64
            }
        ));
    }

    #[test]
    fn closed_file_rejects_io() {
        let (mut cf, _path) = open_ring(8);
        cf.close();

        assert!(matches!(cf.write(b"a"), Err(Error::Closed)));
        let mut buf = [0u8; 1];
        assert!(matches!(cf.read(&mut buf), Err(Error::Closed)));

        // Idempotent.
        cf.close();
    }

    #[test]
    fn positional_io_wraps() {
        let (mut cf, _path) = open_ring(8);
        cf.write(b"abcdefgh").unwrap();

        // Overwrite across the physical wrap point.
        cf.write_at(6, b"XYZ").unwrap();

        let mut buf = [0u8; 3];
        cf.read_at(6, &mut buf).unwrap();
        assert_eq!(&buf, b"XYZ");

        // The ring contents reflect the wrap: offsets 6,7 then 0.
        let mut all = [0u8; 8];
        cf.read(&mut all).unwrap();
        assert_eq!(&all, b"ZbcdefXY");
    }

    #[test]
    fn restore_positions() {
        let path = testify::temp_file();
        let mut cf = CircularFile::open(&path, false, 8).unwrap();
        cf.write(b"abcdef").unwrap();
        drop(cf);

        let mut cf = CircularFile::open(&path, false, 8).unwrap();
        cf.restore(0, 2, 6, false);

        assert_eq!(cf.len(), 6);
        let mut buf = [0u8; 4];
        assert_eq!(cf.read(&mut buf).unwrap(), (4, false));
        assert_eq!(&buf, b"cdef");
    }
}
