use bytes::Bytes;

use crate::frame::{Frame, Snapshot};
use crate::screen::{Screen, ScreenConfig};

/// Per-session frame producer.
///
/// Owns the sequence counter and the screen state. Every byte passed to
/// [`FrameEncoder::encode`] lands in exactly one frame, in order.
pub struct FrameEncoder {
    screen: Screen,
    last_seq: u64,
    size_changed: bool,
}

impl FrameEncoder {
    pub fn new(cols: u16, rows: u16, config: ScreenConfig) -> Self {
        Self {
            screen: Screen::new(cols, rows, config),
            last_seq: 0,
            size_changed: false,
        }
    }

    /// Wrap a batch of output in the next frame. The frame carries the
    /// terminal size if it changed since the previous frame.
    pub fn encode(&mut self, payload: Bytes, timestamp_ms: i64) -> Frame {
        self.screen.process(&payload);
        self.last_seq += 1;
        let size = if std::mem::take(&mut self.size_changed) {
            Some(self.screen.size())
        } else {
            None
        };
        Frame {
            seq: self.last_seq,
            timestamp_ms,
            size,
            payload,
        }
    }

    /// Record a new size. Snapshots reflect it immediately; the next frame
    /// announces it.
    pub fn resize(&mut self, cols: u16, rows: u16) {
        if (cols, rows) != self.screen.size() {
            self.screen.resize(cols, rows);
            self.size_changed = true;
        }
    }

    pub fn snapshot(&mut self) -> Snapshot {
        let (cols, rows) = self.screen.size();
        Snapshot {
            seq: self.last_seq,
            cols,
            rows,
            cursor: self.screen.cursor(),
            payload: Bytes::from(self.screen.replay()),
        }
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// (cols, rows)
    pub fn size(&self) -> (u16, u16) {
        self.screen.size()
    }

    pub fn has_pending_resize(&self) -> bool {
        self.size_changed
    }

    pub fn screen(&self) -> &Screen {
        &self.screen
    }
}
