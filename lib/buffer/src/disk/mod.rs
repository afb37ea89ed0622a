mod file;
mod metadata;

use std::fmt;
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use entry::Entry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::DiskBufferConfig;
use crate::semaphore::{AcquireError, Semaphore};
use crate::{Chunk, Error, FlushToken};
use file::CircularFile;
use metadata::{EntryDescriptor, Metadata};

/// Chunk size for compaction copies.
const COPY_CHUNK: usize = 1 << 16;

/// A buffer that persists entries to disk and survives restarts.
///
/// Entries are appended to a fixed-size circular data file as
/// `uvarint(length) || payload` records. A binary metadata sidecar tracks
/// the unread region, the read-but-not-flushed region, and the dead range
/// left behind by an interrupted compaction.
///
/// An entry read but never marked flushed stays on disk and is delivered
/// again after a restart: at-least-once.
pub struct DiskBuffer {
    shared: Arc<Shared>,
    maintenance: CancellationToken,
}

struct Shared {
    inner: Mutex<Inner>,

    /// Free bytes in the data file. Writers block here when the file is
    /// full; compaction returns reclaimed bytes.
    space: Semaphore,

    /// Entries available to read. Signaled by `add`.
    available: Semaphore,

    size: u64,
    max_chunk_size: u64,
    max_chunk_delay: Duration,
}

struct Inner {
    file: CircularFile,
    metadata: Metadata,

    /// Reclaimable bytes accumulated by `mark_flushed`; drives
    /// opportunistic compaction.
    flushed_bytes: u64,

    next_batch: u64,
    closed: bool,

    _lock: fslock::LockFile,
}

impl DiskBuffer {
    pub(crate) fn open(config: &DiskBufferConfig) -> Result<DiskBuffer, Error> {
        let size = config.max_size;

        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&config.path)?;

        let mut lock =
            fslock::LockFile::open(&config.path.join("lock")).map_err(Error::Lock)?;
        if !lock.try_lock().map_err(Error::Lock)? {
            return Err(Error::Locked);
        }

        let mut metadata = Metadata::open(&config.path.join("metadata"))?;
        let mut file = CircularFile::open(&config.path.join("data"), config.sync, size)?;

        // A non-empty dead range is an interrupted compaction; finish the
        // slide before anything else touches the file.
        if metadata.dead_range_length > 0 {
            debug!(
                dead_range_start = metadata.dead_range_start,
                dead_range_length = metadata.dead_range_length,
                "recovering interrupted compaction"
            );
            bubble_down(&file, &mut metadata, size)?;
        }

        // Reclaim anything that was flushed before the last shutdown.
        compact_files(&file, &mut metadata, size)?;

        // Whatever was read but never flushed becomes unread again, so the
        // next reader sees it. This is where at-least-once comes from.
        let start = match metadata.read.first() {
            Some(descriptor) => descriptor.start_offset as u64 % size,
            None => metadata.unread_start_offset as u64 % size,
        };
        let read_bytes: u64 = metadata.read.iter().map(|d| d.length as u64).sum();
        let unread_bytes = scan_unread(&file, &metadata, size)?;

        metadata.unread_start_offset = start as i64;
        metadata.unread_count += metadata.read.len() as i64;
        metadata.read.clear();
        metadata.sync()?;

        let live = read_bytes + unread_bytes;
        let end = (start + live) % size;
        file.restore(start, start, end, live == size);

        let unread_count = metadata.unread_count.max(0) as u64;
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                file,
                metadata,
                flushed_bytes: 0,
                next_batch: 1,
                closed: false,
                _lock: lock,
            }),
            space: Semaphore::new(size.saturating_sub(live)),
            available: Semaphore::new(unread_count),
            size,
            max_chunk_size: config.max_chunk_size.max(1),
            max_chunk_delay: config.max_chunk_delay,
        });

        let maintenance = CancellationToken::new();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(maintenance_loop(
                shared.clone(),
                maintenance.clone(),
                config.compact_interval,
            ));
        }

        Ok(DiskBuffer {
            shared,
            maintenance,
        })
    }

    pub async fn add(&self, ctx: &CancellationToken, entry: Entry) -> Result<(), Error> {
        let payload = serde_json::to_vec(&entry)?;
        let mut record = Vec::with_capacity(payload.len() + 10);
        encode_uvarint(&mut record, payload.len() as u64);
        record.extend_from_slice(&payload);

        let record_len = record.len() as u64;
        if record_len > self.shared.size {
            return Err(Error::EntryTooLarge {
                size: record_len,
                max: self.shared.size,
            });
        }

        match self.shared.space.acquire(ctx, record_len).await {
            Ok(()) => {}
            Err(AcquireError::Closed) => return Err(Error::Closed),
            Err(AcquireError::Cancelled) => return Err(Error::Cancelled),
        }

        {
            let mut inner = self.shared.lock();
            if inner.closed {
                self.shared.space.increment(record_len);
                return Err(Error::Closed);
            }

            let (written, _) = inner.file.write(&record)?;
            debug_assert_eq!(written, record.len(), "space permits guarantee fit");

            inner.metadata.unread_count += 1;
            inner.metadata.sync()?;
        }

        self.shared.available.increment(1);
        Ok(())
    }

    pub async fn read(&self, ctx: &CancellationToken) -> Result<Chunk, Error> {
        let wanted = self
            .shared
            .available
            .acquire_at_most(ctx, self.shared.max_chunk_delay, self.shared.max_chunk_size)
            .await;

        let mut inner = self.shared.lock();
        if inner.closed {
            return Err(Error::Closed);
        }

        let batch = inner.next_batch;
        inner.next_batch += 1;

        let mut entries = Vec::with_capacity(wanted as usize);
        for _ in 0..wanted {
            let start_offset = inner.file.read_ptr();
            let (entry, record_len) = read_record(&mut inner.file)?;
            entries.push(entry);

            inner.metadata.read.push(EntryDescriptor {
                flushed: false,
                length: record_len as i64,
                start_offset: start_offset as i64,
                batch,
            });
        }

        if wanted > 0 {
            inner.metadata.unread_start_offset = inner.file.read_ptr() as i64;
            inner.metadata.unread_count -= wanted as i64;
            inner.metadata.sync()?;
        }

        Ok(Chunk {
            entries,
            token: FlushToken(batch),
        })
    }

    pub fn mark_flushed(&self, token: FlushToken) -> Result<(), Error> {
        let mut inner = self.shared.lock();
        if inner.closed {
            return Err(Error::Closed);
        }

        let mut freed = 0u64;
        for descriptor in &mut inner.metadata.read {
            if descriptor.batch == token.0 && !descriptor.flushed {
                descriptor.flushed = true;
                freed += descriptor.length as u64;
            }
        }

        if freed == 0 {
            return Ok(());
        }

        inner.flushed_bytes += freed;
        inner.metadata.sync()?;

        if inner.flushed_bytes * 4 >= self.shared.size {
            self.shared.compact_locked(&mut inner)?;
        }

        Ok(())
    }

    /// Reclaims the space of every contiguous flushed range.
    pub fn compact(&self) -> Result<(), Error> {
        let mut inner = self.shared.lock();
        if inner.closed {
            return Err(Error::Closed);
        }
        self.shared.compact_locked(&mut inner)
    }

    pub fn close(&self) -> Result<Vec<Entry>, Error> {
        self.maintenance.cancel();

        let mut inner = self.shared.lock();
        if inner.closed {
            return Err(Error::Closed);
        }
        inner.closed = true;

        self.shared.space.close();
        self.shared.available.close();

        // Unflushed entries, read region first, then unread, in order.
        let mut residual = Vec::new();
        for index in 0..inner.metadata.read.len() {
            let descriptor = inner.metadata.read[index].clone();
            if descriptor.flushed {
                continue;
            }

            let mut record = vec![0u8; descriptor.length as usize];
            inner.file.read_at(descriptor.start_offset as u64, &mut record)?;
            let (payload_len, prefix) = decode_uvarint(&record).ok_or_else(corrupt_record)?;
            residual.push(serde_json::from_slice(
                &record[prefix..prefix + payload_len as usize],
            )?);
        }

        let mut offset = inner.metadata.unread_start_offset as u64;
        for _ in 0..inner.metadata.unread_count.max(0) {
            let (entry, record_len) = read_record_at(&inner.file, offset)?;
            residual.push(entry);
            offset = (offset + record_len) % self.shared.size;
        }

        inner.metadata.sync()?;
        inner.metadata.close()?;
        inner.file.close();

        Ok(residual)
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("disk buffer lock")
    }

    fn compact_locked(&self, inner: &mut Inner) -> Result<(), Error> {
        let freed = compact_files(&inner.file, &mut inner.metadata, self.size)?;
        if freed > 0 {
            inner.file.advance_start(freed);
            inner.flushed_bytes = inner.flushed_bytes.saturating_sub(freed);
            self.space.increment(freed);
        }
        Ok(())
    }
}

impl Drop for DiskBuffer {
    fn drop(&mut self) {
        self.maintenance.cancel();
    }
}

impl fmt::Debug for DiskBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskBuffer")
            .field("size", &self.shared.size)
            .finish_non_exhaustive()
    }
}

async fn maintenance_loop(shared: Arc<Shared>, token: CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.reset();

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let result = {
            let mut inner = shared.lock();
            if inner.closed {
                return;
            }
            shared.compact_locked(&mut inner)
        };

        if let Err(err) = result {
            error!(message = "disk buffer compaction failed", %err);
        }
    }
}

/// Removes every contiguous flushed range from the data file by sliding
/// the bytes below it upward, hole-by-hole, and returns the bytes freed.
///
/// The commit point for each range is a single metadata sync that removes
/// the range's descriptors, shifts the offsets of everything before it,
/// and records the dead range. A crash after that sync is completed by
/// `bubble_down` on the next startup; a crash before it leaves the old
/// state intact.
fn compact_files(file: &CircularFile, metadata: &mut Metadata, size: u64) -> Result<u64, Error> {
    let mut total_freed = 0u64;

    loop {
        // First maximal run of contiguous flushed descriptors.
        let Some(run_start) = metadata.read.iter().position(|d| d.flushed) else {
            break;
        };
        let run_end = metadata.read[run_start..]
            .iter()
            .position(|d| !d.flushed)
            .map(|offset| run_start + offset)
            .unwrap_or(metadata.read.len());

        let hole_start = metadata.read[run_start].start_offset as u64;
        let hole_len: u64 = metadata.read[run_start..run_end]
            .iter()
            .map(|d| d.length as u64)
            .sum();

        if run_start == 0 {
            // The run is at the head of the live region; dropping the
            // descriptors releases the bytes with no copying.
            metadata.read.drain(..run_end);
            metadata.sync()?;
        } else {
            for descriptor in &mut metadata.read[..run_start] {
                descriptor.start_offset =
                    ((descriptor.start_offset as u64 + hole_len) % size) as i64;
            }
            metadata.read.drain(run_start..run_end);
            metadata.dead_range_start = hole_start as i64;
            metadata.dead_range_length = hole_len as i64;
            metadata.sync()?;

            bubble_down(file, metadata, size)?;
        }

        total_freed += hole_len;
    }

    Ok(total_freed)
}

/// Completes a committed compaction: moves the dead range down through the
/// entries that precede it until it sits at the head of the live region,
/// persisting its position after every step so the slide can resume after
/// a crash.
fn bubble_down(file: &CircularFile, metadata: &mut Metadata, size: u64) -> Result<(), Error> {
    let hole_len = metadata.dead_range_length as u64;
    if hole_len == 0 {
        return Ok(());
    }

    let Some(first) = metadata.read.first() else {
        // Nothing precedes the hole; it is already at the head.
        return metadata.set_dead_range(0, 0);
    };

    let bottom = (first.start_offset as u64 + size - hole_len) % size;
    let mut hole = metadata.dead_range_start as u64;

    let mut copy = vec![0u8; COPY_CHUNK.min(size as usize)];
    while hole != bottom {
        let remaining = (hole + size - bottom) % size;
        let step = remaining.min(hole_len);

        // Copy [hole - step, hole) into [hole + hole_len - step,
        // hole + hole_len). The destination lies inside the hole, so a
        // repeated copy after a crash reads the same source bytes.
        let src = (hole + size - step) % size;
        let dst = (hole + hole_len - step) % size;
        let mut copied = 0u64;
        while copied < step {
            let n = ((step - copied) as usize).min(copy.len());
            file.read_at((src + copied) % size, &mut copy[..n])?;
            file.write_at((dst + copied) % size, &copy[..n])?;
            copied += n as u64;
        }

        // The copied bytes must be durable before the recorded hole
        // position moves past them.
        file.sync()?;

        hole = src;
        metadata.set_dead_range(hole as i64, hole_len as i64)?;
    }

    metadata.set_dead_range(0, 0)
}

/// Walks the unread region to find its byte length; the data file carries
/// the record lengths that metadata does not.
fn scan_unread(file: &CircularFile, metadata: &Metadata, size: u64) -> Result<u64, Error> {
    let mut offset = metadata.unread_start_offset as u64;
    let mut total = 0u64;

    for _ in 0..metadata.unread_count.max(0) {
        let mut probe = [0u8; 10];
        let probe_len = probe.len().min(size as usize);
        file.read_at(offset, &mut probe[..probe_len])?;

        let (payload_len, prefix) = decode_uvarint(&probe[..probe_len]).ok_or_else(corrupt_record)?;
        let record_len = prefix as u64 + payload_len;
        offset = (offset + record_len) % size;
        total += record_len;
    }

    Ok(total)
}

/// Reads one length-prefixed record through the ring's read cursor.
fn read_record(file: &mut CircularFile) -> Result<(Entry, u64), Error> {
    let mut prefix = 0usize;
    let mut payload_len = 0u64;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        let (n, _) = file.read(&mut byte)?;
        if n == 0 {
            return Err(corrupt_record().into());
        }

        prefix += 1;
        payload_len |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 63 {
            return Err(corrupt_record().into());
        }
    }

    let mut payload = vec![0u8; payload_len as usize];
    let (n, _) = file.read(&mut payload)?;
    if n != payload.len() {
        return Err(corrupt_record().into());
    }

    let entry = serde_json::from_slice(&payload)?;
    Ok((entry, prefix as u64 + payload_len))
}

/// Reads one record positionally, without touching the read cursor.
fn read_record_at(file: &CircularFile, offset: u64) -> Result<(Entry, u64), Error> {
    let mut probe = [0u8; 10];
    file.read_at(offset, &mut probe)?;
    let (payload_len, prefix) = decode_uvarint(&probe).ok_or_else(corrupt_record)?;

    let mut payload = vec![0u8; payload_len as usize];
    file.read_at(offset + prefix as u64, &mut payload)?;

    let entry = serde_json::from_slice(&payload)?;
    Ok((entry, prefix as u64 + payload_len))
}

fn corrupt_record() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "corrupt length-prefixed record",
    )
}

pub(crate) fn encode_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            buf.push(byte | 0x80);
        } else {
            buf.push(byte);
            return;
        }
    }
}

pub(crate) fn decode_uvarint(raw: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (index, byte) in raw.iter().enumerate() {
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, index + 1));
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
    None
}

#[cfg(test)]
mod varint_tests {
    use super::*;

    #[test]
    fn round_trip() {
        for value in [0u64, 1, 127, 128, 300, 1 << 20, u64::MAX] {
            let mut buf = Vec::new();
            encode_uvarint(&mut buf, value);
            assert_eq!(decode_uvarint(&buf), Some((value, buf.len())));
        }
    }

    #[test]
    fn truncated_is_none() {
        let mut buf = Vec::new();
        encode_uvarint(&mut buf, 1 << 20);
        buf.pop();
        assert_eq!(decode_uvarint(&buf), None);
    }
}

#[cfg(test)]
mod compaction_tests {
    use super::*;

    const SIZE: u64 = 64;

    fn descriptor(flushed: bool, length: i64, start_offset: i64) -> EntryDescriptor {
        EntryDescriptor {
            flushed,
            length,
            start_offset,
            batch: 0,
        }
    }

    /// A ring pre-loaded with 8-byte records of a repeated letter each.
    fn ring_with_records(letters: &[u8]) -> (CircularFile, Metadata, std::path::PathBuf) {
        let dir = testify::temp_dir();
        let mut file = CircularFile::open(&dir.join("data"), false, SIZE).unwrap();
        for letter in letters {
            file.write(&[*letter; 8]).unwrap();
        }
        let metadata = Metadata::open(&dir.join("metadata")).unwrap();
        (file, metadata, dir)
    }

    fn record_at(file: &CircularFile, offset: u64) -> [u8; 8] {
        let mut buf = [0u8; 8];
        file.read_at(offset, &mut buf).unwrap();
        buf
    }

    #[test]
    fn head_run_is_dropped_without_copying() {
        let (file, mut metadata, _dir) = ring_with_records(b"ABC");
        metadata.read = vec![
            descriptor(true, 8, 0),
            descriptor(true, 8, 8),
            descriptor(false, 8, 16),
        ];

        let freed = compact_files(&file, &mut metadata, SIZE).unwrap();
        assert_eq!(freed, 16);
        assert_eq!(metadata.read, vec![descriptor(false, 8, 16)]);
        assert_eq!(metadata.dead_range_length, 0);
        // The survivor's bytes are untouched.
        assert_eq!(record_at(&file, 16), [b'C'; 8]);
    }

    #[test]
    fn mid_run_slides_the_head_up() {
        let (file, mut metadata, _dir) = ring_with_records(b"ABC");
        metadata.read = vec![
            descriptor(false, 8, 0),
            descriptor(true, 8, 8),
            descriptor(false, 8, 16),
        ];

        let freed = compact_files(&file, &mut metadata, SIZE).unwrap();
        assert_eq!(freed, 8);

        // A moved up over B's hole; C untouched. New head starts at 8.
        assert_eq!(
            metadata.read,
            vec![descriptor(false, 8, 8), descriptor(false, 8, 16)]
        );
        assert_eq!(record_at(&file, 8), [b'A'; 8]);
        assert_eq!(record_at(&file, 16), [b'C'; 8]);
        assert_eq!(metadata.dead_range_length, 0);
    }

    #[test]
    fn interrupted_slide_resumes_from_metadata() {
        // Two head records A, B below a committed hole of 8 bytes at 16.
        // The commit already shifted their descriptors up by 8; no bytes
        // have moved yet — the crash happened right after the sync.
        let (file, mut metadata, _dir) = ring_with_records(b"ABHC");
        metadata.read = vec![
            descriptor(false, 8, 8),
            descriptor(false, 8, 16),
            descriptor(false, 8, 24),
        ];
        metadata.dead_range_start = 16;
        metadata.dead_range_length = 8;
        metadata.sync().unwrap();

        bubble_down(&file, &mut metadata, SIZE).unwrap();

        assert_eq!(record_at(&file, 8), [b'A'; 8]);
        assert_eq!(record_at(&file, 16), [b'B'; 8]);
        assert_eq!(record_at(&file, 24), [b'C'; 8]);
        assert_eq!(metadata.dead_range_length, 0);
        assert_eq!(metadata.dead_range_start, 0);
    }

    #[test]
    fn partially_completed_slide_resumes_mid_way() {
        // Same layout, but the first step already ran: B was copied into
        // the hole and the dead range was persisted at 8.
        let (file, mut metadata, _dir) = ring_with_records(b"ABBC");
        metadata.read = vec![
            descriptor(false, 8, 8),
            descriptor(false, 8, 16),
            descriptor(false, 8, 24),
        ];
        metadata.dead_range_start = 8;
        metadata.dead_range_length = 8;
        metadata.sync().unwrap();

        bubble_down(&file, &mut metadata, SIZE).unwrap();

        assert_eq!(record_at(&file, 8), [b'A'; 8]);
        assert_eq!(record_at(&file, 16), [b'B'; 8]);
        assert_eq!(record_at(&file, 24), [b'C'; 8]);
        assert_eq!(metadata.dead_range_length, 0);
    }

    #[test]
    fn multiple_runs_compact_fully() {
        let (file, mut metadata, _dir) = ring_with_records(b"ABCDE");
        metadata.read = vec![
            descriptor(true, 8, 0),
            descriptor(false, 8, 8),
            descriptor(true, 8, 16),
            descriptor(true, 8, 24),
            descriptor(false, 8, 32),
        ];

        let freed = compact_files(&file, &mut metadata, SIZE).unwrap();
        assert_eq!(freed, 24);

        // Survivors B and E, contiguous, order preserved.
        assert_eq!(metadata.read.len(), 2);
        let first = metadata.read[0].start_offset as u64;
        let second = metadata.read[1].start_offset as u64;
        assert_eq!((first + 8) % SIZE, second);
        assert_eq!(record_at(&file, first), [b'B'; 8]);
        assert_eq!(record_at(&file, second), [b'E'; 8]);
    }
}
