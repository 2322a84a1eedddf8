//! In-flight batch tracking: submission-ordered acknowledgement entries
//! backing the offset checkpoint.

use crate::memory::MemoryBudget;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct AckEntry {
    offset: String,
    len: usize,
    acked: AtomicBool,
}

/// Handle to one in-flight entry. The transport completion path calls
/// [`AckHandle::ack`]; acking is idempotent and does not by itself release
/// the permit or persist the offset. That happens on the next drain.
#[derive(Clone)]
pub struct AckHandle {
    entry: Arc<AckEntry>,
}

impl AckHandle {
    pub fn ack(&self) {
        self.entry.acked.store(true, Ordering::Release);
    }

    pub fn is_acked(&self) -> bool {
        self.entry.acked.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.entry.len
    }

    pub fn is_empty(&self) -> bool {
        self.entry.len == 0
    }

    pub fn offset(&self) -> &str {
        &self.entry.offset
    }
}

/// Ordered set of in-flight entries for one sink pipeline.
///
/// Entries hold a permit reservation of `len` bytes from the memory budget
/// until they are drained or cleared. Offsets advance strictly in
/// submission order: an entry is released only once every earlier entry
/// has been, so a stalled batch holds up later checkpoints but never
/// corrupts them.
pub struct AckTracker {
    budget: Arc<MemoryBudget>,
    pool: String,
    entries: Mutex<VecDeque<Arc<AckEntry>>>,
}

impl AckTracker {
    pub fn new(budget: Arc<MemoryBudget>, pool: &str) -> Self {
        Self {
            budget,
            pool: pool.to_string(),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Append an entry for a message already holding a permit of `len`
    /// bytes.
    pub fn enqueue(&self, offset: String, len: usize) -> AckHandle {
        let entry = Arc::new(AckEntry {
            offset,
            len,
            acked: AtomicBool::new(false),
        });
        self.entries.lock().push_back(entry.clone());
        AckHandle { entry }
    }

    /// Pop the acked prefix, releasing each popped entry's permit, and
    /// return the offset of the last entry popped. Stops at the first
    /// entry that is not yet acked.
    pub fn drain(&self) -> Option<String> {
        let mut entries = self.entries.lock();
        let mut last = None;
        while entries
            .front()
            .map_or(false, |entry| entry.acked.load(Ordering::Acquire))
        {
            if let Some(entry) = entries.pop_front() {
                self.budget.release(&self.pool, entry.len);
                last = Some(entry.offset.clone());
            }
        }
        last
    }

    /// True iff no entries are in flight.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Release every remaining permit without persisting anything. For
    /// shutdown, where in-flight batches are abandoned.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        while let Some(entry) = entries.pop_front() {
            self.budget.release(&self.pool, entry.len);
        }
    }
}
