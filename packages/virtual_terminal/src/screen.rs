//! Screen state
//!
//! Feeds PTY output through a `vt100` parser and keeps a keyframe (the
//! screen rendered as ANSI escape sequences) plus the raw output written
//! since that keyframe. Replaying keyframe + deltas into a blank terminal
//! reproduces the current screen.

use tracing::debug;

/// Clear screen and scrollback, home the cursor, reset attributes.
const RESET_SEQUENCE: &[u8] = b"\x1b[H\x1b[2J\x1b[3J\x1b[0m";

#[derive(Debug, Clone, Copy)]
pub struct ScreenConfig {
    /// Scrollback rows retained by the parser and included in snapshots.
    pub scrollback_lines: usize,
    /// Delta buffer size that triggers a fresh keyframe.
    pub max_delta_bytes: usize,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            scrollback_lines: 1000,
            max_delta_bytes: 256 * 1024,
        }
    }
}

pub struct Screen {
    /// VT100 terminal emulator, holds the cell grid and scrollback
    parser: vt100::Parser,

    /// Last keyframe: scrollback + screen rendered as ANSI escape sequences
    keyframe: Option<Vec<u8>>,

    /// Raw PTY output accumulated since last keyframe
    deltas: Vec<u8>,

    /// Bytes of an escape sequence or UTF-8 character that is still open
    pending: SequenceTracker,

    max_delta_bytes: usize,
}

impl Screen {
    pub fn new(cols: u16, rows: u16, config: ScreenConfig) -> Self {
        Self {
            parser: vt100::Parser::new(rows, cols, config.scrollback_lines),
            keyframe: None,
            deltas: Vec::new(),
            pending: SequenceTracker::default(),
            max_delta_bytes: config.max_delta_bytes,
        }
    }

    /// Feed PTY output to the parser and the delta buffer, compacting once
    /// the deltas outgrow the threshold.
    pub fn process(&mut self, data: &[u8]) {
        self.parser.process(data);
        self.deltas.extend_from_slice(data);
        self.pending.feed(data);

        if self.deltas.len() > self.max_delta_bytes {
            debug!(
                "Compacting screen after {} delta bytes",
                self.deltas.len()
            );
            self.compact();
        }
    }

    /// Render a fresh keyframe from the parser state and clear the deltas.
    ///
    /// A sequence cut off at the end of the last chunk is not part of the
    /// rendered state yet, so its bytes start the new delta buffer.
    pub fn compact(&mut self) {
        self.keyframe = Some(self.render());
        self.deltas.clear();
        self.deltas.extend_from_slice(self.pending.bytes());
    }

    /// Apply a new size. Deltas recorded at the old size would replay
    /// incorrectly, so a keyframe is taken at the new size right away.
    pub fn resize(&mut self, cols: u16, rows: u16) {
        if (cols, rows) == self.size() {
            return;
        }
        self.parser.set_size(rows, cols);
        self.compact();
    }

    /// Keyframe + deltas. Compacts first if there is no keyframe yet.
    pub fn replay(&mut self) -> Vec<u8> {
        if self.keyframe.is_none() {
            self.compact();
        }
        let mut result = Vec::new();
        if let Some(ref kf) = self.keyframe {
            result.extend_from_slice(kf);
        }
        result.extend_from_slice(&self.deltas);
        result
    }

    /// Current size as (cols, rows).
    pub fn size(&self) -> (u16, u16) {
        let (rows, cols) = self.parser.screen().size();
        (cols, rows)
    }

    /// Cursor as zero-based (row, col).
    pub fn cursor(&self) -> (u16, u16) {
        self.parser.screen().cursor_position()
    }

    /// Plain text of the visible screen.
    pub fn contents(&self) -> String {
        self.parser.screen().contents()
    }

    pub fn delta_len(&self) -> usize {
        self.deltas.len()
    }

    fn render(&mut self) -> Vec<u8> {
        let (rows, cols) = self.parser.screen().size();
        let mut lines = self.scrollback_rows(cols);
        {
            let screen = self.parser.screen();
            let visible = screen.rows_formatted(0, cols).enumerate().map(|(i, row)| {
                let wrapped = i + 1 < rows as usize && screen.row_wrapped(i as u16);
                (row, wrapped)
            });
            lines.extend(visible);
        }

        let mut out = Vec::with_capacity(lines.iter().map(|(l, _)| l.len() + 6).sum());
        out.extend_from_slice(RESET_SEQUENCE);
        let last = lines.len().saturating_sub(1);
        for (i, (line, wrapped)) in lines.into_iter().enumerate() {
            out.extend_from_slice(b"\x1b[0m");
            out.extend_from_slice(&line);
            if i < last && !wrapped {
                out.extend_from_slice(b"\r\n");
            }
        }

        let screen = self.parser.screen();
        out.extend_from_slice(b"\x1b[0m");
        let (row, col) = screen.cursor_position();
        out.extend_from_slice(format!("\x1b[{};{}H", row + 1, col + 1).as_bytes());
        out.extend_from_slice(&screen.attributes_formatted());
        out.extend_from_slice(&screen.input_mode_formatted());
        if screen.hide_cursor() {
            out.extend_from_slice(b"\x1b[?25l");
        }
        out
    }

    /// Formatted scrollback rows, oldest first, paired with their wrap flag.
    ///
    /// vt100 only exposes scrollback through the view offset, so this walks
    /// the offset down one screenful at a time and restores it afterwards.
    fn scrollback_rows(&mut self, cols: u16) -> Vec<(Vec<u8>, bool)> {
        self.parser.set_scrollback(usize::MAX);
        let total = self.parser.screen().scrollback();
        let rows = self.parser.screen().size().0 as usize;

        let mut lines = Vec::with_capacity(total);
        let mut offset = total;
        while offset > 0 {
            self.parser.set_scrollback(offset);
            let take = offset.min(rows);
            let screen = self.parser.screen();
            for (i, row) in screen.rows_formatted(0, cols).take(take).enumerate() {
                lines.push((row, screen.row_wrapped(i as u16)));
            }
            offset -= take;
        }
        self.parser.set_scrollback(0);
        lines
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum SequenceState {
    #[default]
    Ground,
    Utf8 { remaining: u8 },
    Escape,
    EscapeIntermediate,
    Csi,
    /// OSC, DCS, SOS, PM and APC bodies, ended by BEL or ST
    StringBody,
    StringEscape,
}

/// Follows the output just closely enough to know whether it currently
/// stops inside an escape sequence or a multi-byte character.
#[derive(Debug, Default)]
struct SequenceTracker {
    state: SequenceState,
    open: Vec<u8>,
}

impl SequenceTracker {
    fn feed(&mut self, data: &[u8]) {
        for &byte in data {
            self.advance(byte);
        }
    }

    /// The unfinished sequence, empty at ground state.
    fn bytes(&self) -> &[u8] {
        &self.open
    }

    fn advance(&mut self, byte: u8) {
        use SequenceState::*;

        // CAN and SUB abort any sequence. C0 controls inside a sequence run
        // immediately, so they are already part of the parser state.
        if matches!(byte, 0x18 | 0x1a) && self.state != Ground {
            self.reset();
            return;
        }

        match self.state {
            Ground => self.start(byte),
            Utf8 { remaining } => {
                if (0x80..=0xbf).contains(&byte) {
                    if remaining == 1 {
                        self.reset();
                    } else {
                        self.push(byte, Utf8 { remaining: remaining - 1 });
                    }
                } else {
                    self.reset();
                    self.start(byte);
                }
            }
            Escape => match byte {
                0x1b => self.begin_escape(),
                b'[' => self.push(byte, Csi),
                b']' | b'P' | b'X' | b'^' | b'_' => self.push(byte, StringBody),
                0x20..=0x2f => self.push(byte, EscapeIntermediate),
                0x30..=0x7e => self.reset(),
                _ => {}
            },
            EscapeIntermediate => match byte {
                0x1b => self.begin_escape(),
                0x20..=0x2f => self.open.push(byte),
                0x30..=0x7e => self.reset(),
                _ => {}
            },
            Csi => match byte {
                0x1b => self.begin_escape(),
                0x20..=0x3f => self.open.push(byte),
                0x40..=0x7e => self.reset(),
                _ => {}
            },
            StringBody => match byte {
                0x07 => self.reset(),
                0x1b => self.push(byte, StringEscape),
                _ => self.open.push(byte),
            },
            StringEscape => {
                if byte == b'\\' {
                    self.reset();
                } else {
                    // The ESC ended the string and opens a new sequence
                    self.begin_escape();
                    self.advance(byte);
                }
            }
        }
    }

    fn start(&mut self, byte: u8) {
        match byte {
            0x1b => self.begin_escape(),
            0xc2..=0xdf => self.push(byte, SequenceState::Utf8 { remaining: 1 }),
            0xe0..=0xef => self.push(byte, SequenceState::Utf8 { remaining: 2 }),
            0xf0..=0xf4 => self.push(byte, SequenceState::Utf8 { remaining: 3 }),
            _ => {}
        }
    }

    fn begin_escape(&mut self) {
        self.open.clear();
        self.open.push(0x1b);
        self.state = SequenceState::Escape;
    }

    fn push(&mut self, byte: u8, state: SequenceState) {
        self.open.push(byte);
        self.state = state;
    }

    fn reset(&mut self) {
        self.open.clear();
        self.state = SequenceState::Ground;
    }
}
