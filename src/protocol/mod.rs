//! Protocol definitions and constants

mod header;

pub use header::TunnelHeader;

use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid marker byte: {0:#04x}")]
    InvalidMarker(u8),

    #[error("Unsupported IP version: {0}")]
    UnsupportedIpVersion(u8),

    #[error("Invalid header terminator: {0:#04x}")]
    InvalidTerminator(u8),

    #[error("Truncated header: needed {needed} more bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Invalid header: {0}")]
    InvalidHeader(String),
}

/// First byte of every tunnel header
pub const HEADER_MARKER: u8 = 0x75;

/// Terminator: header ends here
pub const TERMINATOR_END: u8 = 0x80;

/// Terminator: a source address follows
pub const TERMINATOR_SOURCE: u8 = 0x76;

/// Header version emitted by [`TunnelHeader::new`]
pub const HEADER_VERSION: (u8, u8, u8) = (1, 0, 0);
