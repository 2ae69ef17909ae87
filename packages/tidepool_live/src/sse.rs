//! Incremental parser for `text/event-stream` frames.
//!
//! Feed raw transport chunks with [`FrameParser::push`] and drain complete
//! frames with [`FrameParser::next_frame`] — chunk boundaries can fall
//! anywhere, including inside a multi-byte character or a line terminator.

use bytes::BytesMut;

/// One decoded frame: an event kind and its data payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: String,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct FrameParser {
    buf: BytesMut,
}

impl FrameParser {
    /// Append a raw chunk from the transport.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete frame, if the buffer holds one. Comment-only and empty
    /// blocks are skipped.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let end = find_frame_end(&self.buf)?;
            let raw = self.buf.split_to(end);
            let text = String::from_utf8_lossy(&raw);
            if let Some(frame) = parse_block(&text) {
                return Some(frame);
            }
        }
    }
}

/// Index just past a frame terminator: a line break immediately followed by
/// another, where a break is `\n` or `\r\n`.
fn find_frame_end(buf: &[u8]) -> Option<usize> {
    let mut i = 0;
    let mut breaks = 0;
    while i < buf.len() {
        match buf[i] {
            b'\n' => {
                breaks += 1;
                i += 1;
            }
            b'\r' if buf.get(i + 1) == Some(&b'\n') => {
                breaks += 1;
                i += 2;
            }
            _ => {
                breaks = 0;
                i += 1;
            }
        }
        if breaks == 2 {
            return Some(i);
        }
    }
    None
}

/// Decode one block of `field: value` lines into a frame. Returns None for
/// blocks carrying neither an event name nor data (e.g. comment keep-alives).
fn parse_block(text: &str) -> Option<Frame> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            // a single leading space after the colon is not part of the value
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(Frame {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data.join("\n"),
    })
}
