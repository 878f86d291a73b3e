use bytes::Bytes;

/// Magic byte that opens every live output frame on the binary channel.
pub const FRAME_MAGIC: u8 = 0xBF;

/// Magic byte that opens a full-state snapshot on the binary channel.
pub const SNAPSHOT_MAGIC: u8 = 0xBE;

/// Frame flag: cols/rows follow the flags byte.
pub const FLAG_SIZE: u8 = 0x01;

/// One incremental unit of terminal output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Monotonic per session, starting at 1.
    pub seq: u64,
    /// Capture time in unix millis. Not carried on the wire; decoded frames
    /// report 0.
    pub timestamp_ms: i64,
    /// (cols, rows), present only when the size changed since the previous frame.
    pub size: Option<(u16, u16)>,
    pub payload: Bytes,
}

/// Everything a fresh subscriber needs to render the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Last frame sequence number folded into this snapshot. The next live
    /// frame a subscriber should expect is `seq + 1`.
    pub seq: u64,
    pub cols: u16,
    pub rows: u16,
    /// Zero-based (row, col).
    pub cursor: (u16, u16),
    pub payload: Bytes,
}
