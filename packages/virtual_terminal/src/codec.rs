//! Binary codec for frames and snapshots
//!
//! Frame:    `[0xBF][seq varint][flags][cols u16][rows u16][len varint][payload]`
//!           (cols/rows only when `flags & FLAG_SIZE`)
//! Snapshot: `[0xBE][seq varint][cols u16][rows u16][cursor_row u16][cursor_col u16][len varint][payload]`
//!
//! Varints are unsigned LEB128, integers are big-endian.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{FLAG_SIZE, FRAME_MAGIC, Frame, SNAPSHOT_MAGIC, Snapshot};

/// Maximum payload size (16 MB)
const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// A u64 never needs more than 10 LEB128 bytes.
const MAX_VARINT_LEN: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown magic byte: {0:#04x}")]
    UnknownMagic(u8),

    #[error("Malformed varint")]
    BadVarint,

    #[error("Unknown frame flags: {0:#04x}")]
    UnknownFlags(u8),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

/// A decoded message from the binary channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Frame(Frame),
    Snapshot(Snapshot),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(&item, dst)
    }
}

impl Encoder<&Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(item, dst)
    }
}

impl Encoder<&Snapshot> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &Snapshot, dst: &mut BytesMut) -> Result<(), Self::Error> {
        check_payload(item.payload.len())?;
        dst.reserve(1 + MAX_VARINT_LEN * 2 + 8 + item.payload.len());
        dst.put_u8(SNAPSHOT_MAGIC);
        put_varint(dst, item.seq);
        dst.put_u16(item.cols);
        dst.put_u16(item.rows);
        dst.put_u16(item.cursor.0);
        dst.put_u16(item.cursor.1);
        put_varint(dst, item.payload.len() as u64);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = WireMessage;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&magic) = src.first() else {
            return Ok(None);
        };

        // Parse the header without consuming until the whole message is here
        let mut pos = 1;
        let Some(seq) = read_varint(src, &mut pos)? else {
            return Ok(None);
        };

        let header = match magic {
            FRAME_MAGIC => {
                let Some(&flags) = src.get(pos) else {
                    return Ok(None);
                };
                pos += 1;
                if flags & !FLAG_SIZE != 0 {
                    return Err(FrameError::UnknownFlags(flags));
                }
                let size = if flags & FLAG_SIZE != 0 {
                    let (Some(cols), Some(rows)) = (read_u16(src, &mut pos), read_u16(src, &mut pos))
                    else {
                        return Ok(None);
                    };
                    Some((cols, rows))
                } else {
                    None
                };
                Header::Frame { size }
            }
            SNAPSHOT_MAGIC => {
                let mut fields = [0u16; 4];
                for field in &mut fields {
                    let Some(v) = read_u16(src, &mut pos) else {
                        return Ok(None);
                    };
                    *field = v;
                }
                Header::Snapshot {
                    cols: fields[0],
                    rows: fields[1],
                    cursor: (fields[2], fields[3]),
                }
            }
            other => return Err(FrameError::UnknownMagic(other)),
        };

        let Some(len) = read_varint(src, &mut pos)? else {
            return Ok(None);
        };
        let len = len as usize;
        check_payload(len)?;

        if src.len() < pos + len {
            src.reserve(pos + len - src.len());
            return Ok(None);
        }

        src.advance(pos);
        let payload = src.split_to(len).freeze();

        Ok(Some(match header {
            Header::Frame { size } => WireMessage::Frame(Frame {
                seq,
                timestamp_ms: 0,
                size,
                payload,
            }),
            Header::Snapshot { cols, rows, cursor } => WireMessage::Snapshot(Snapshot {
                seq,
                cols,
                rows,
                cursor,
                payload,
            }),
        }))
    }
}

enum Header {
    Frame {
        size: Option<(u16, u16)>,
    },
    Snapshot {
        cols: u16,
        rows: u16,
        cursor: (u16, u16),
    },
}

fn encode_frame(item: &Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
    check_payload(item.payload.len())?;
    dst.reserve(2 + MAX_VARINT_LEN * 2 + 4 + item.payload.len());
    dst.put_u8(FRAME_MAGIC);
    put_varint(dst, item.seq);
    match item.size {
        Some((cols, rows)) => {
            dst.put_u8(FLAG_SIZE);
            dst.put_u16(cols);
            dst.put_u16(rows);
        }
        None => dst.put_u8(0),
    }
    put_varint(dst, item.payload.len() as u64);
    dst.put_slice(&item.payload);
    Ok(())
}

fn check_payload(size: usize) -> Result<(), FrameError> {
    if size > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge {
            size,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(())
}

fn put_varint(dst: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        dst.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

/// `Ok(None)` when more bytes are needed.
fn read_varint(src: &[u8], pos: &mut usize) -> Result<Option<u64>, FrameError> {
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        let Some(&byte) = src.get(*pos + i) else {
            return Ok(None);
        };
        let bits = (byte & 0x7f) as u64;
        if i == MAX_VARINT_LEN - 1 && bits > 1 {
            return Err(FrameError::BadVarint);
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            *pos += i + 1;
            return Ok(Some(value));
        }
    }
    Err(FrameError::BadVarint)
}

fn read_u16(src: &[u8], pos: &mut usize) -> Option<u16> {
    let bytes = src.get(*pos..*pos + 2)?;
    *pos += 2;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}
