mod config;
mod disk;
mod memory;
mod semaphore;


pub use config::{BufferConfig, DiskBufferConfig, MemoryBufferConfig};
pub use disk::DiskBuffer;
pub use memory::MemoryBuffer;
pub use semaphore::{AcquireError, Semaphore};

use entry::Entry;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("buffer is closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("entry of {size} bytes is too large to fit in a buffer of {max} bytes")]
    EntryTooLarge { size: u64, max: u64 },

    #[error("configured size ({configured}) does not match current on-disk size ({on_disk})")]
    SizeMismatch { configured: u64, on_disk: u64 },

    #[error("buffer directory is locked by another process")]
    Locked,

    #[error("buffer lock: {0}")]
    Lock(fslock::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("entry encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// A batch of entries pulled from a buffer. The token ties the batch back
/// to its buffer slots; passing it to `mark_flushed` releases them.
#[derive(Debug)]
pub struct Chunk {
    pub entries: Vec<Entry>,
    pub token: FlushToken,
}

impl Chunk {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlushToken(pub(crate) u64);

/// An intermediate queue between entry producers and a sink.
///
/// Entries go in one at a time and come out in chunks. A chunk stays
/// accounted in the buffer until it is marked flushed, which is what gives
/// at-least-once delivery: a crash between `read` and `mark_flushed` means
/// the same entries surface again on the next read.
#[derive(Debug)]
pub enum Buffer {
    Memory(MemoryBuffer),
    Disk(DiskBuffer),
}

impl Buffer {
    /// Adds an entry, waiting for space if the buffer is full. The wait is
    /// cancellable through `ctx`.
    pub async fn add(&self, ctx: &CancellationToken, entry: Entry) -> Result<(), Error> {
        match self {
            Buffer::Memory(buffer) => buffer.add(ctx, entry).await,
            Buffer::Disk(buffer) => buffer.add(ctx, entry).await,
        }
    }

    /// Reads a chunk of up to `max_chunk_size` entries, waiting up to
    /// `max_chunk_delay` for them to accumulate. Returns an empty chunk on
    /// timeout with nothing available.
    pub async fn read(&self, ctx: &CancellationToken) -> Result<Chunk, Error> {
        match self {
            Buffer::Memory(buffer) => buffer.read(ctx).await,
            Buffer::Disk(buffer) => buffer.read(ctx).await,
        }
    }

    /// Marks a previously read chunk as delivered, releasing its space.
    pub fn mark_flushed(&self, token: FlushToken) -> Result<(), Error> {
        match self {
            Buffer::Memory(buffer) => buffer.mark_flushed(token),
            Buffer::Disk(buffer) => buffer.mark_flushed(token),
        }
    }

    /// Closes the buffer and returns every entry that was never marked
    /// flushed, in insertion order, for last-chance delivery.
    pub fn close(&self) -> Result<Vec<Entry>, Error> {
        match self {
            Buffer::Memory(buffer) => buffer.close(),
            Buffer::Disk(buffer) => buffer.close(),
        }
    }
}
