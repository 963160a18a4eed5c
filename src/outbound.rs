//! Outbound message queue backed by a growable byte arena.
//!
//! Producers append encoded messages from any task; a single consumer (the
//! connection's send loop) drains them in FIFO order. Messages are copied
//! once into a shared arena and described by `(offset, len)` slices, so a
//! drain hands the consumer one refcounted buffer instead of per-message
//! allocations. The drain is two-phase: [`OutboundQueue::dequeue_batch`]
//! takes the queued slices without holding the lock across the socket write,
//! and dropping the returned [`Batch`] releases the arena so the next append
//! can reuse its allocation. If the arena had to grow while a batch was out,
//! reuse is skipped for that cycle and the old memory is simply freed.

use std::{
    mem,
    sync::{Arc, Mutex, PoisonError},
};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::Notify;

/// Initial arena capacity in bytes; the arena doubles whenever it must grow.
pub const DEFAULT_ARENA_CAPACITY: usize = 128;

/// Error returned when enqueueing on a closed queue.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("outbound queue closed")]
pub struct QueueClosed;

#[derive(Clone, Copy, Debug)]
struct Slice {
    offset: usize,
    len: usize,
}

struct State {
    arena: BytesMut,
    slices: Vec<Slice>,
    /// Doubling-growth bookkeeping; the arena allocation tracks this.
    target_capacity: usize,
    closed: bool,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Multi-producer, single-consumer queue of encoded outbound messages.
///
/// Cloning is cheap; all clones share one arena. Exactly one task should
/// drain the queue via [`dequeue_batch`](Self::dequeue_batch).
#[derive(Clone)]
pub struct OutboundQueue {
    inner: Arc<Inner>,
}

impl OutboundQueue {
    /// Create a queue with [`DEFAULT_ARENA_CAPACITY`].
    #[must_use]
    pub fn new() -> Self { Self::with_arena_capacity(DEFAULT_ARENA_CAPACITY) }

    /// Create a queue with the given initial arena capacity.
    #[must_use]
    pub fn with_arena_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    arena: BytesMut::with_capacity(capacity),
                    slices: Vec::new(),
                    target_capacity: capacity,
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Append one message. Never blocks; callable from any task or thread.
    ///
    /// # Errors
    ///
    /// Returns [`QueueClosed`] once [`close`](Self::close) has been called.
    pub fn enqueue(&self, message: &[u8]) -> Result<(), QueueClosed> {
        {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(QueueClosed);
            }
            let needed = state.arena.len() + message.len();
            while state.target_capacity < needed {
                state.target_capacity *= 2;
            }
            if state.arena.capacity() < state.target_capacity {
                // `reserve` reclaims the released arena allocation by moving
                // any bytes appended during the last drain to the front; when
                // the allocation is still shared or too small it reallocates
                // instead, leaving in-flight slices untouched.
                let additional = state.target_capacity - state.arena.len();
                state.arena.reserve(additional);
            }
            let offset = state.arena.len();
            state.arena.extend_from_slice(message);
            state.slices.push(Slice {
                offset,
                len: message.len(),
            });
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Wait until at least one message is queued and take all of them.
    ///
    /// Returns `None` only when the queue is closed *and* fully drained, so
    /// closing never discards messages that were already accepted.
    pub async fn dequeue_batch(&self) -> Option<Batch> {
        loop {
            {
                let mut state = self.inner.lock();
                if !state.slices.is_empty() {
                    let filled = state.arena.len();
                    let data = state.arena.split_to(filled).freeze();
                    let slices = mem::take(&mut state.slices);
                    return Some(Batch {
                        data,
                        slices,
                        inner: Arc::clone(&self.inner),
                    });
                }
                if state.closed {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Close the queue. Idempotent; later enqueues fail while already-queued
    /// messages remain drainable.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.inner.notify.notify_one();
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.inner.lock().closed }
}

impl Default for OutboundQueue {
    fn default() -> Self { Self::new() }
}

/// One drained batch of messages, in enqueue order.
///
/// Holds a refcounted view of the arena; drop it after writing so the arena
/// allocation can be reused by subsequent enqueues.
pub struct Batch {
    data: Bytes,
    slices: Vec<Slice>,
    inner: Arc<Inner>,
}

impl Batch {
    /// Number of messages in the batch.
    #[must_use]
    pub fn len(&self) -> usize { self.slices.len() }

    /// Whether the batch holds no messages. Never true for a batch returned
    /// by [`OutboundQueue::dequeue_batch`].
    #[must_use]
    pub fn is_empty(&self) -> bool { self.slices.is_empty() }

    /// Iterate the messages as zero-copy views of the arena.
    pub fn messages(&self) -> impl Iterator<Item = Bytes> + '_ {
        self.slices
            .iter()
            .map(|s| self.data.slice(s.offset..s.offset + s.len))
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        // Release the arena reference first, then let the queue try to take
        // the allocation back for messages appended during this drain.
        self.data = Bytes::new();
        self.slices.clear();
        let mut state = self.inner.lock();
        if state.arena.capacity() < state.target_capacity {
            let additional = state.target_capacity - state.arena.len();
            state.arena.reserve(additional);
        }
    }
}
