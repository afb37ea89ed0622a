use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use entry::Entry;
use tokio_util::sync::CancellationToken;

use crate::config::MemoryBufferConfig;
use crate::semaphore::{AcquireError, Semaphore};
use crate::{Chunk, Error, FlushToken};

/// A bounded in-memory queue with the buffer interface. Nothing survives a
/// restart; `close` hands back whatever is still queued or in flight.
#[derive(Debug)]
pub struct MemoryBuffer {
    state: Mutex<State>,

    /// Free entry slots; writers block here when the queue is full.
    space: Semaphore,

    /// Entries available to read.
    available: Semaphore,

    max_chunk_size: u64,
    max_chunk_delay: Duration,
}

#[derive(Debug)]
struct State {
    queue: VecDeque<Entry>,

    /// Chunks read but not yet marked flushed, in read order.
    in_flight: Vec<(u64, Vec<Entry>)>,

    next_batch: u64,
    closed: bool,
}

impl MemoryBuffer {
    pub(crate) fn new(config: &MemoryBufferConfig) -> MemoryBuffer {
        MemoryBuffer {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                in_flight: Vec::new(),
                next_batch: 1,
                closed: false,
            }),
            space: Semaphore::new(config.max_entries),
            available: Semaphore::new(0),
            max_chunk_size: config.max_chunk_size.max(1),
            max_chunk_delay: config.max_chunk_delay,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("memory buffer lock")
    }

    pub async fn add(&self, ctx: &CancellationToken, entry: Entry) -> Result<(), Error> {
        match self.space.acquire(ctx, 1).await {
            Ok(()) => {}
            Err(AcquireError::Closed) => return Err(Error::Closed),
            Err(AcquireError::Cancelled) => return Err(Error::Cancelled),
        }

        {
            let mut state = self.lock();
            if state.closed {
                self.space.increment(1);
                return Err(Error::Closed);
            }
            state.queue.push_back(entry);
        }

        self.available.increment(1);
        Ok(())
    }

    pub async fn read(&self, ctx: &CancellationToken) -> Result<Chunk, Error> {
        let wanted = self
            .available
            .acquire_at_most(ctx, self.max_chunk_delay, self.max_chunk_size)
            .await;

        let mut state = self.lock();
        if state.closed {
            return Err(Error::Closed);
        }

        let batch = state.next_batch;
        state.next_batch += 1;

        let take = (wanted as usize).min(state.queue.len());
        let entries: Vec<Entry> = state.queue.drain(..take).collect();
        if !entries.is_empty() {
            state.in_flight.push((batch, entries.clone()));
        }

        Ok(Chunk {
            entries,
            token: FlushToken(batch),
        })
    }

    pub fn mark_flushed(&self, token: FlushToken) -> Result<(), Error> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::Closed);
        }

        let mut released = 0u64;
        state.in_flight.retain(|(batch, entries)| {
            if *batch == token.0 {
                released = entries.len() as u64;
                false
            } else {
                true
            }
        });

        drop(state);
        if released > 0 {
            self.space.increment(released);
        }

        Ok(())
    }

    pub fn close(&self) -> Result<Vec<Entry>, Error> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        state.closed = true;

        self.space.close();
        self.available.close();

        // In-flight chunks first (they were read earlier), then the queue.
        let mut residual = Vec::new();
        for (_, entries) in state.in_flight.drain(..) {
            residual.extend(entries);
        }
        residual.extend(state.queue.drain(..));

        Ok(residual)
    }
}
