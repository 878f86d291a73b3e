//! Virtual Terminal
//!
//! Turns raw PTY output into sequenced wire [`Frame`]s and keeps a `vt100`
//! screen so that a [`Snapshot`] of the current state (visible rows plus a
//! bounded slice of scrollback) can be produced at any time.

mod codec;
mod encoder;
mod frame;
mod screen;

pub use codec::{FrameCodec, FrameError, WireMessage};
pub use encoder::FrameEncoder;
pub use frame::{FRAME_MAGIC, FLAG_SIZE, Frame, SNAPSHOT_MAGIC, Snapshot};
pub use screen::{Screen, ScreenConfig};
