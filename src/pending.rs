// ABOUTME: Per-connection FIFO of requests awaiting a backend response
// ABOUTME: Strict head-only access; no random access, no sharing across connections

use std::collections::VecDeque;

/// A single outstanding client request, queued until the corresponding
/// backend response is reconciled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingEntry {
    pub tid: u16,
    pub uid: u8,
    pub func: u8,
}

/// Strict FIFO of [`PendingEntry`] values, owned exclusively by the
/// connection task that created it.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: VecDeque<PendingEntry>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, entry: PendingEntry) {
        self.entries.push_back(entry);
    }

    pub fn head(&self) -> Option<&PendingEntry> {
        self.entries.front()
    }

    /// Remove and return the head, used when the head has been reconciled
    /// (matched or relabeled) with a backend response.
    pub fn pop(&mut self) -> Option<PendingEntry> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The tids of all still-outstanding entries, in FIFO order; used for the
    /// `closing with pending=N (unanswered tids: [...])` teardown record.
    pub fn unanswered_tids(&self) -> Vec<u16> {
        self.entries.iter().map(|e| e.tid).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_is_preserved() {
        let mut q = PendingQueue::new();
        q.push(PendingEntry { tid: 1, uid: 0x11, func: 3 });
        q.push(PendingEntry { tid: 2, uid: 0x11, func: 3 });
        assert_eq!(q.head().unwrap().tid, 1);
        assert_eq!(q.pop().unwrap().tid, 1);
        assert_eq!(q.head().unwrap().tid, 2);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn unanswered_tids_reports_fifo_order() {
        let mut q = PendingQueue::new();
        q.push(PendingEntry { tid: 7, uid: 1, func: 3 });
        q.push(PendingEntry { tid: 8, uid: 1, func: 3 });
        assert_eq!(q.unanswered_tids(), vec![7, 8]);
    }
}
