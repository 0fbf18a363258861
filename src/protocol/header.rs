//! Tunnel header encoding/decoding
//!
//! Header format (all integers big-endian):
//! ```text
//! +--------+--------+--------+--------+
//! | 0x75   | major  | minor  | patch  |
//! +--------+--------+--------+--------+
//! |  Dest port (2B) | IP ver | Dest IP (4 or 16B) ...
//! +--------+--------+--------+--------+
//! | 0x80                              |   no source address
//! +--------+--------+--------+--------+
//! | 0x76   | Source IP (same width) ... | 0x80 |
//! +--------+--------+--------+--------+
//! ```

use super::{ProtocolError, HEADER_MARKER, HEADER_VERSION, TERMINATOR_END, TERMINATOR_SOURCE};
use bytes::{Buf, BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Routing header carried in front of a datagram that is to be tunneled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelHeader {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    /// Destination UDP port
    pub port: u16,
    /// Destination address
    pub destination: IpAddr,
    /// Address to dial from, `None` for default routing
    pub source: Option<IpAddr>,
}

impl TunnelHeader {
    /// Create a header with the current version and no source address
    pub fn new(destination: IpAddr, port: u16) -> Self {
        let (major, minor, patch) = HEADER_VERSION;
        Self {
            major,
            minor,
            patch,
            port,
            destination,
            source: None,
        }
    }

    /// Set the source address to dial from
    pub fn with_source(mut self, source: IpAddr) -> Self {
        self.source = Some(source);
        self
    }

    /// Number of bytes this header occupies on the wire
    pub fn encoded_len(&self) -> usize {
        let width = addr_width(self.destination);
        let source = if self.source.is_some() { 1 + width } else { 0 };
        7 + width + source + 1
    }

    /// Encode the header, appending it to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        if let Some(source) = self.source {
            if source.is_ipv4() != self.destination.is_ipv4() {
                return Err(ProtocolError::InvalidHeader(
                    "source and destination address families differ".to_string(),
                ));
            }
        }

        buf.reserve(self.encoded_len());
        buf.put_u8(HEADER_MARKER);
        buf.put_u8(self.major);
        buf.put_u8(self.minor);
        buf.put_u8(self.patch);
        buf.put_u16(self.port);
        buf.put_u8(if self.destination.is_ipv4() { 4 } else { 6 });
        put_addr(buf, self.destination);

        if let Some(source) = self.source {
            buf.put_u8(TERMINATOR_SOURCE);
            put_addr(buf, source);
        }
        buf.put_u8(TERMINATOR_END);

        Ok(())
    }

    /// Encode the header into a new buffer
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Decode a header from the front of `buf`.
    ///
    /// Returns the header and the remaining payload bytes.
    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        let mut cursor = buf;

        ensure(&cursor, 7)?;
        let marker = cursor.get_u8();
        if marker != HEADER_MARKER {
            return Err(ProtocolError::InvalidMarker(marker));
        }
        let major = cursor.get_u8();
        let minor = cursor.get_u8();
        let patch = cursor.get_u8();
        let port = cursor.get_u16();

        let version = cursor.get_u8();
        let width = match version {
            4 => 4,
            6 => 16,
            v => return Err(ProtocolError::UnsupportedIpVersion(v)),
        };

        let destination = get_addr(&mut cursor, width)?;
        if destination.is_unspecified() {
            return Err(ProtocolError::InvalidHeader(format!(
                "unspecified destination address {destination}"
            )));
        }

        ensure(&cursor, 1)?;
        let source = match cursor.get_u8() {
            TERMINATOR_END => None,
            TERMINATOR_SOURCE => {
                let source = get_addr(&mut cursor, width)?;
                ensure(&cursor, 1)?;
                match cursor.get_u8() {
                    TERMINATOR_END => Some(source),
                    other => return Err(ProtocolError::InvalidTerminator(other)),
                }
            }
            other => return Err(ProtocolError::InvalidTerminator(other)),
        };

        let header = Self {
            major,
            minor,
            patch,
            port,
            destination,
            source,
        };

        Ok((header, cursor))
    }
}

fn addr_width(addr: IpAddr) -> usize {
    match addr {
        IpAddr::V4(_) => 4,
        IpAddr::V6(_) => 16,
    }
}

fn ensure(cursor: &&[u8], needed: usize) -> Result<(), ProtocolError> {
    if cursor.remaining() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            available: cursor.remaining(),
        });
    }
    Ok(())
}

fn get_addr(cursor: &mut &[u8], width: usize) -> Result<IpAddr, ProtocolError> {
    ensure(cursor, width)?;
    let addr = if width == 4 {
        let mut octets = [0u8; 4];
        cursor.copy_to_slice(&mut octets);
        IpAddr::V4(Ipv4Addr::from(octets))
    } else {
        let mut octets = [0u8; 16];
        cursor.copy_to_slice(&mut octets);
        IpAddr::V6(Ipv6Addr::from(octets))
    };
    Ok(addr)
}

fn put_addr(buf: &mut BytesMut, addr: IpAddr) {
    match addr {
        IpAddr::V4(v4) => buf.put_slice(&v4.octets()),
        IpAddr::V6(v6) => buf.put_slice(&v6.octets()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_v4_without_source() {
        let mut buf = vec![0x75, 0x01, 0x02, 0x03, 0xC4, 0x7C, 0x04, 192, 168, 1, 100, 0x80];
        buf.extend_from_slice(b"payload");

        let (header, payload) = TunnelHeader::decode(&buf).unwrap();

        assert_eq!(header.major, 1);
        assert_eq!(header.minor, 2);
        assert_eq!(header.patch, 3);
        assert_eq!(header.port, 50300);
        assert_eq!(header.destination, IpAddr::from([192, 168, 1, 100]));
        assert_eq!(header.source, None);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_decode_v6_without_source() {
        let dest: Ipv6Addr = "2600:8805:cc00:cc:ed0e:1b36:d342:474e".parse().unwrap();
        let mut buf = vec![0x75, 0x01, 0x02, 0x03, 0xC4, 0x7C, 0x06];
        buf.extend_from_slice(&dest.octets());
        buf.push(0x80);

        let (header, payload) = TunnelHeader::decode(&buf).unwrap();

        assert_eq!(header.port, 50300);
        assert_eq!(header.destination, IpAddr::V6(dest));
        assert!(payload.is_empty());
    }

    #[test]
    fn test_decode_v4_with_source() {
        let buf = [
            0x75, 1, 0, 0, 0x00, 0x5C, 0x04, 10, 0, 0, 7, 0x76, 10, 0, 0, 2, 0x80, 0xAA, 0xBB,
        ];

        let (header, payload) = TunnelHeader::decode(&buf).unwrap();

        assert_eq!(header.port, 92);
        assert_eq!(header.destination, IpAddr::from([10, 0, 0, 7]));
        assert_eq!(header.source, Some(IpAddr::from([10, 0, 0, 2])));
        assert_eq!(payload, &[0xAA, 0xBB]);
    }

    #[test]
    fn test_encode_decode_all_shapes() {
        let v4 = TunnelHeader::new(IpAddr::from([192, 168, 1, 50]), 92);
        let v4_src = v4.with_source(IpAddr::from([192, 168, 1, 2]));
        let v6 = TunnelHeader::new("fd00::1".parse().unwrap(), 4000);
        let v6_src = v6.with_source("fd00::2".parse().unwrap());

        for header in [v4, v4_src, v6, v6_src] {
            let mut encoded = header.encode().unwrap();
            assert_eq!(encoded.len(), header.encoded_len());
            encoded.extend_from_slice(b"tail");

            let (decoded, rest) = TunnelHeader::decode(&encoded).unwrap();
            assert_eq!(decoded, header);
            assert_eq!(rest, b"tail");
        }
    }

    #[test]
    fn test_rejects_bad_marker() {
        let buf = [0x74, 1, 0, 0, 0, 80, 4, 1, 2, 3, 4, 0x80];
        assert_eq!(
            TunnelHeader::decode(&buf).unwrap_err(),
            ProtocolError::InvalidMarker(0x74)
        );
    }

    #[test]
    fn test_rejects_unknown_ip_version() {
        let buf = [0x75, 1, 0, 0, 0, 80, 5, 1, 2, 3, 4, 0x80];
        assert_eq!(
            TunnelHeader::decode(&buf).unwrap_err(),
            ProtocolError::UnsupportedIpVersion(5)
        );
    }

    #[test]
    fn test_rejects_bad_terminator() {
        let buf = [0x75, 1, 0, 0, 0, 80, 4, 1, 2, 3, 4, 0x81];
        assert_eq!(
            TunnelHeader::decode(&buf).unwrap_err(),
            ProtocolError::InvalidTerminator(0x81)
        );
    }

    #[test]
    fn test_rejects_truncated_headers() {
        let full = TunnelHeader::new("fd00::1".parse().unwrap(), 4000)
            .with_source("fd00::2".parse().unwrap())
            .encode()
            .unwrap();

        for len in 0..full.len() {
            let err = TunnelHeader::decode(&full[..len]).unwrap_err();
            assert!(
                matches!(err, ProtocolError::Truncated { .. }),
                "length {len} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_rejects_unspecified_destination() {
        let buf = [0x75, 1, 0, 0, 0, 80, 4, 0, 0, 0, 0, 0x80];
        assert!(matches!(
            TunnelHeader::decode(&buf).unwrap_err(),
            ProtocolError::InvalidHeader(_)
        ));
    }

    #[test]
    fn test_encode_rejects_mixed_families() {
        let header = TunnelHeader::new(IpAddr::from([10, 0, 0, 1]), 80)
            .with_source("fd00::2".parse().unwrap());
        assert!(header.encode().is_err());
    }
}
