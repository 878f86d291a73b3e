//! Bounded ring of recent frames for lag recovery.
//!
//! When a subscriber falls behind, the broadcaster replays the frames it
//! missed from here instead of sending a full snapshot, as long as every
//! missed sequence number is still held.

use std::collections::VecDeque;

use virtual_terminal::Frame;

pub struct FrameRing {
    buffer: VecDeque<Frame>,
    max_entries: usize,
    head_seq: u64,
}

impl FrameRing {
    pub fn new(max_entries: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(max_entries.min(1024)),
            max_entries,
            head_seq: 0,
        }
    }

    pub fn push(&mut self, frame: Frame) {
        self.head_seq = frame.seq;
        if self.max_entries == 0 {
            return;
        }
        while self.buffer.len() >= self.max_entries {
            self.buffer.pop_front();
        }
        self.buffer.push_back(frame);
    }

    /// All frames with seq > `last_seq`, in order.
    ///
    /// Returns `None` if any of them has already been evicted, meaning the
    /// caller must fall back to a snapshot.
    pub fn since(&self, last_seq: u64) -> Option<Vec<Frame>> {
        if last_seq >= self.head_seq {
            return Some(Vec::new());
        }
        let oldest = self.buffer.front()?.seq;
        if last_seq + 1 < oldest {
            return None;
        }
        Some(
            self.buffer
                .iter()
                .filter(|f| f.seq > last_seq)
                .cloned()
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// The highest sequence number pushed, or 0 if none.
    pub fn head_seq(&self) -> u64 {
        self.head_seq
    }
}
