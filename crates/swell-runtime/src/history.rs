use std::collections::VecDeque;

use bytes::Bytes;
use thiserror::Error;

/// Encoded patch frames retained for resync replay.
///
/// Entries are contiguous and strictly increasing by sequence. The oldest
/// entries fall off once either the frame count or the byte bound is exceeded.
#[derive(Debug)]
pub struct PatchHistory {
    entries: VecDeque<(u64, Bytes)>,
    capacity: usize,
    max_bytes: usize,
    total_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HistoryError {
    /// The pushed sequence does not directly follow the newest entry.
    #[error("patch frame {got} pushed out of order, expected {expected}")]
    OutOfOrder { expected: u64, got: u64 },
}

impl PatchHistory {
    pub fn new(capacity: usize, max_bytes: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
            max_bytes,
            total_bytes: 0,
        }
    }

    pub fn push(&mut self, seq: u64, frame: Bytes) -> Result<(), HistoryError> {
        if let Some(&(last, _)) = self.entries.back() {
            if seq != last + 1 {
                return Err(HistoryError::OutOfOrder {
                    expected: last + 1,
                    got: seq,
                });
            }
        }
        self.total_bytes += frame.len();
        self.entries.push_back((seq, frame));
        while self.entries.len() > self.capacity
            || (self.total_bytes > self.max_bytes && self.entries.len() > 1)
        {
            self.evict_front();
        }
        Ok(())
    }

    /// Drops every entry the client has acknowledged.
    pub fn gc(&mut self, acked: u64) -> usize {
        let mut removed = 0;
        while matches!(self.entries.front(), Some(&(seq, _)) if seq <= acked) {
            self.evict_front();
            removed += 1;
        }
        removed
    }

    /// Frames `from..=to` when every one of them is still retained.
    pub fn range(&self, from: u64, to: u64) -> Option<Vec<Bytes>> {
        if from > to {
            return Some(Vec::new());
        }
        let first = self.oldest()?;
        let last = self.newest()?;
        if from < first || to > last {
            return None;
        }
        let start = (from - first) as usize;
        let count = (to - from + 1) as usize;
        Some(
            self.entries
                .iter()
                .skip(start)
                .take(count)
                .map(|(_, frame)| frame.clone())
                .collect(),
        )
    }

    pub fn oldest(&self) -> Option<u64> {
        self.entries.front().map(|(seq, _)| *seq)
    }

    pub fn newest(&self) -> Option<u64> {
        self.entries.back().map(|(seq, _)| *seq)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }

    fn evict_front(&mut self) {
        if let Some((_, frame)) = self.entries.pop_front() {
            self.total_bytes -= frame.len();
        }
    }
}
