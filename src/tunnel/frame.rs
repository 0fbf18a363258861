//! Frame encoding/decoding for the tunnel stream
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+
//! |   Length (2B)   | Source port (2B)|
//! +--------+--------+--------+--------+
//! | Dest port (2B)  |     Payload     |
//! +--------+--------+--------+--------+
//! |   [Timestamp (8B), profiling only] |
//! +--------+--------+--------+--------+
//! ```
//!
//! Length counts from the destination port onward: `payload + 2`, plus 8 when
//! a timestamp trailer is present.

use super::TunnelError;
use crate::{is_reserved_port, BUFFER_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tracing::trace;

/// Frame header size in bytes (length, source port, destination port)
pub const FRAME_HEADER_SIZE: usize = 6;

/// Size of the profiling timestamp trailer
pub const TIMESTAMP_SIZE: usize = 8;

/// Largest frame the reader accepts
pub const MAX_FRAME_SIZE: usize = BUFFER_SIZE;

/// Largest payload the reader accepts (timestamp trailer included)
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - FRAME_HEADER_SIZE;

/// One forwarded datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Bytes,
    /// Sender clock in nanoseconds since the epoch, profiling only
    pub sent_at: Option<u64>,
}

impl Frame {
    pub fn new(src_port: u16, dst_port: u16, payload: Bytes) -> Self {
        Self {
            src_port,
            dst_port,
            payload,
            sent_at: None,
        }
    }

    /// Attach a profiling timestamp
    pub fn with_timestamp(mut self, nanos: u64) -> Self {
        self.sent_at = Some(nanos);
        self
    }

    /// Value of the length field for this frame
    pub fn length_field(&self) -> usize {
        2 + self.payload.len() + self.sent_at.map_or(0, |_| TIMESTAMP_SIZE)
    }

    /// Total encoded size
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE - 2 + self.length_field()
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<BytesMut, TunnelError> {
        let length = self.length_field();
        if length > u16::MAX as usize {
            return Err(TunnelError::FrameTooLarge(length, u16::MAX as usize));
        }

        let mut buf = BytesMut::with_capacity(self.encoded_size());
        buf.put_u16(length as u16);
        buf.put_u16(self.src_port);
        buf.put_u16(self.dst_port);
        buf.put_slice(&self.payload);
        if let Some(nanos) = self.sent_at {
            buf.put_u64(nanos);
        }

        Ok(buf)
    }
}

/// Current time in nanoseconds since the Unix epoch
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

enum ReadState {
    Length,
    SrcPort { length: usize },
    DstPort { length: usize, src_port: u16 },
    Payload { length: usize, src_port: u16, dst_port: u16 },
}

enum Field {
    Complete,
    /// The stream returned EOF before a single byte of the field
    ImmediateEof,
}

/// Reconstructs frames from a byte stream
pub struct FrameReader<R> {
    reader: BufReader<R>,
    profiling: bool,
    last_read_eof: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, profiling: bool) -> Self {
        Self {
            reader: BufReader::with_capacity(BUFFER_SIZE * 4, reader),
            profiling,
            last_read_eof: false,
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when the stream is idle-closed: two consecutive reads
    /// of the length field hit EOF without yielding a byte. A single such EOF
    /// is tolerated. Any other error desynchronizes the stream and is fatal.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, TunnelError> {
        let mut state = ReadState::Length;

        loop {
            state = match state {
                ReadState::Length => {
                    let mut bytes = [0u8; 2];
                    match self.read_field(&mut bytes).await? {
                        Field::ImmediateEof if self.last_read_eof => return Ok(None),
                        Field::ImmediateEof => {
                            trace!("EOF while waiting for a frame");
                            self.last_read_eof = true;
                            ReadState::Length
                        }
                        Field::Complete => {
                            self.last_read_eof = false;
                            let length = u16::from_be_bytes(bytes) as usize;
                            if length < 2 {
                                return Err(TunnelError::InvalidFrame(format!(
                                    "length field {} is shorter than the port field",
                                    length
                                )));
                            }
                            if length - 2 > MAX_PAYLOAD_SIZE {
                                return Err(TunnelError::FrameTooLarge(
                                    length - 2,
                                    MAX_PAYLOAD_SIZE,
                                ));
                            }
                            ReadState::SrcPort { length }
                        }
                    }
                }
                ReadState::SrcPort { length } => {
                    let src_port = self.read_port().await?;
                    ReadState::DstPort { length, src_port }
                }
                ReadState::DstPort { length, src_port } => {
                    let dst_port = self.read_port().await?;
                    ReadState::Payload {
                        length,
                        src_port,
                        dst_port,
                    }
                }
                ReadState::Payload {
                    length,
                    src_port,
                    dst_port,
                } => {
                    let mut payload = BytesMut::zeroed(length - 2);
                    self.read_required(&mut payload).await?;
                    return self.finish(src_port, dst_port, payload).map(Some);
                }
            };
        }
    }

    fn finish(
        &self,
        src_port: u16,
        dst_port: u16,
        mut payload: BytesMut,
    ) -> Result<Frame, TunnelError> {
        let mut sent_at = None;
        if self.profiling {
            if payload.len() < TIMESTAMP_SIZE {
                return Err(TunnelError::InvalidFrame(format!(
                    "payload of {} bytes cannot hold a timestamp",
                    payload.len()
                )));
            }
            let trailer = payload.split_off(payload.len() - TIMESTAMP_SIZE);
            let mut nanos = [0u8; TIMESTAMP_SIZE];
            nanos.copy_from_slice(&trailer);
            sent_at = Some(u64::from_be_bytes(nanos));
        }

        Ok(Frame {
            src_port,
            dst_port,
            payload: payload.freeze(),
            sent_at,
        })
    }

    async fn read_port(&mut self) -> Result<u16, TunnelError> {
        let mut bytes = [0u8; 2];
        self.read_required(&mut bytes).await?;
        let port = u16::from_be_bytes(bytes);
        if is_reserved_port(port) {
            return Err(TunnelError::ReservedPort(port));
        }
        Ok(port)
    }

    async fn read_required(&mut self, buf: &mut [u8]) -> Result<(), TunnelError> {
        match self.read_field(buf).await? {
            Field::Complete => Ok(()),
            Field::ImmediateEof => Err(TunnelError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a frame",
            ))),
        }
    }

    async fn read_field(&mut self, buf: &mut [u8]) -> io::Result<Field> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(Field::ImmediateEof);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a frame field",
                ));
            }
            filled += n;
        }
        Ok(Field::Complete)
    }
}
