//! Frame recognizers.
//!
//! A recognizer inspects an append-only byte buffer and reports whether a
//! complete telegram is present. It never blocks and never copies: a partial
//! frame leaves the buffer intact for the next round, and on a full frame the
//! caller erases `frame_length` bytes from the front after extracting the
//! payload. Excess bytes beyond a full frame stay in the buffer.

pub mod mbus;
pub mod wmbus;

use thiserror::Error;

/// Framing dialect expected on a byte source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// wM-Bus radio frames with CRCs already stripped by the dongle layer.
    WMBus,
    /// Raw wired M-Bus: single-char, short and long frames.
    MBus,
}

/// Outcome of scanning the buffer for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Not enough bytes yet; keep the buffer and wait for more.
    Partial,
    /// The buffer does not hold a valid frame; drop it and warn.
    Error,
    /// A complete frame. `frame_length` bytes are consumed from the buffer;
    /// the payload sits at `payload_offset..payload_offset + payload_len`.
    Full {
        frame_length: usize,
        payload_len: usize,
        payload_offset: usize,
    },
}

/// Protocol-level framing failure, reported once per dropped buffer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("protocol error in frame: {0}")]
    Protocol(String),
}

/// Runs the recognizer for the given dialect.
pub fn check_frame(framing: Framing, buf: &[u8]) -> FrameStatus {
    match framing {
        Framing::WMBus => wmbus::check_frame(buf),
        Framing::MBus => mbus::check_frame(buf),
    }
}
