//! An in-memory, fixed-capacity byte buffer per service, with multiple
//! independent read cursors. Writers never block on slow readers: once the
//! buffer is full, the oldest bytes are overwritten and every outstanding
//! cursor is advanced past what it lost.
//!
//! No direct teacher equivalent (the teacher tails on-disk files); modeled
//! on the same `Arc<Mutex<...>>` + `Condvar` shared-state idiom used
//! elsewhere in the supervisor for cross-thread coordination.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

struct RingLogInner {
    buf: VecDeque<u8>,
    capacity: usize,
    /// Total bytes ever written; cursor positions are offsets into this
    /// monotonically increasing stream.
    total_written: u64,
    /// Offset of the oldest byte still retained in `buf`.
    oldest_retained: u64,
    next_cursor_id: u64,
    cursor_positions: std::collections::HashMap<u64, u64>,
}

/// A bounded, multi-reader byte ring buffer for one service's combined
/// stdout/stderr.
pub struct RingLog {
    inner: Mutex<RingLogInner>,
    condvar: Condvar,
}

impl RingLog {
    /// Creates an empty ring log with the given byte capacity.
    pub fn new(capacity: usize) -> Arc<RingLog> {
        Arc::new(RingLog {
            inner: Mutex::new(RingLogInner {
                buf: VecDeque::with_capacity(capacity),
                capacity,
                total_written: 0,
                oldest_retained: 0,
                next_cursor_id: 0,
                cursor_positions: std::collections::HashMap::new(),
            }),
            condvar: Condvar::new(),
        })
    }

    /// Appends `bytes`, overwriting the oldest retained data if the buffer
    /// is full. Never blocks.
    pub fn write(self: &Arc<Self>, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for &b in bytes {
            if inner.buf.len() == inner.capacity {
                inner.buf.pop_front();
                inner.oldest_retained += 1;
            }
            inner.buf.push_back(b);
        }
        inner.total_written += bytes.len() as u64;
        let oldest = inner.oldest_retained;
        for pos in inner.cursor_positions.values_mut() {
            if *pos < oldest {
                *pos = oldest;
            }
        }
        drop(inner);
        self.condvar.notify_all();
    }

    /// Opens a new cursor. If `from_start` is true the cursor begins at the
    /// oldest byte still retained; otherwise it begins at the current head
    /// (it will only see bytes written after this call).
    pub fn cursor(self: &Arc<Self>, from_start: bool) -> RingCursor {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = inner.next_cursor_id;
        inner.next_cursor_id += 1;
        let pos = if from_start {
            inner.oldest_retained
        } else {
            inner.total_written
        };
        inner.cursor_positions.insert(id, pos);
        RingCursor {
            log: Arc::clone(self),
            id,
        }
    }
}

/// An independent read handle into a [`RingLog`].
pub struct RingCursor {
    log: Arc<RingLog>,
    id: u64,
}

impl RingCursor {
    /// Drains and returns whatever bytes are currently available without
    /// blocking.
    pub fn read_available(&mut self) -> Vec<u8> {
        let mut inner = self.log.inner.lock().unwrap_or_else(|e| e.into_inner());
        let pos = *inner.cursor_positions.get(&self.id).unwrap();
        let available = inner.total_written.saturating_sub(pos);
        if available == 0 {
            return Vec::new();
        }
        let skip = (pos - inner.oldest_retained) as usize;
        let out: Vec<u8> = inner.buf.iter().skip(skip).copied().collect();
        inner.cursor_positions.insert(self.id, inner.total_written);
        out
    }

    /// Blocks until data is available or `timeout` elapses (blocks forever
    /// if `timeout` is `None`). Returns whether data became available.
    pub fn wait_for_data(&self, timeout: Option<Duration>) -> bool {
        let inner = self.log.inner.lock().unwrap_or_else(|e| e.into_inner());
        let pos = *inner.cursor_positions.get(&self.id).unwrap();
        if inner.total_written > pos {
            return true;
        }
        match timeout {
            None => {
                let guard = self
                    .log
                    .condvar
                    .wait_while(inner, |i| {
                        i.total_written <= *i.cursor_positions.get(&self.id).unwrap()
                    })
                    .unwrap_or_else(|e| e.into_inner());
                drop(guard);
                true
            }
            Some(d) => {
                let deadline = Instant::now() + d;
                let mut guard = inner;
                loop {
                    if guard.total_written > *guard.cursor_positions.get(&self.id).unwrap() {
                        return true;
                    }
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return false;
                    }
                    let (g, timed_out) = self
                        .log
                        .condvar
                        .wait_timeout(guard, remaining)
                        .unwrap_or_else(|e| e.into_inner());
                    guard = g;
                    if timed_out.timed_out()
                        && guard.total_written <= *guard.cursor_positions.get(&self.id).unwrap()
                    {
                        return false;
                    }
                }
            }
        }
    }
}

impl Drop for RingCursor {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.log.inner.lock() {
            inner.cursor_positions.remove(&self.id);
        }
    }
}
