//! Top-level error type.
//!
//! Subsystems keep their own `thiserror` enums next to the code that raises
//! them; this aggregate exists so the binary and the bus glue can funnel any
//! of them through one `Result` with `?`.

use thiserror::Error;

/// Any error the daemon can surface past a subsystem boundary.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Device(#[from] crate::serial::DeviceError),

    #[error(transparent)]
    Frame(#[from] crate::frame::FrameError),

    #[error(transparent)]
    Telegram(#[from] crate::telegram::TelegramError),

    #[error(transparent)]
    Crypto(#[from] crate::telegram::crypto::CryptoError),

    #[error(transparent)]
    Parser(#[from] crate::payload::ParserError),

    #[error(transparent)]
    Hex(#[from] crate::util::HexError),

    #[error("configuration error: {0}")]
    Config(String),
}
