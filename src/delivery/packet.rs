//! IPv4/UDP packet construction for raw injection

use super::DeliveryError;
use bytes::{BufMut, BytesMut};
use std::net::Ipv4Addr;

pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

const IPPROTO_UDP: u8 = 17;
const DEFAULT_TTL: u8 = 64;

fn sum_words(data: &[u8], mut sum: u64) -> u64 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u64;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u64) << 8;
    }
    sum
}

/// Internet checksum over the concatenation of `parts`.
///
/// Every part but the last must have even length.
pub fn checksum(parts: &[&[u8]]) -> u16 {
    let mut sum = parts.iter().fold(0u64, |sum, part| sum_words(part, sum));
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Build a complete IPv4 datagram carrying one UDP segment
pub fn build_ipv4_udp(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Result<BytesMut, DeliveryError> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_LEN + udp_len;
    if total_len > u16::MAX as usize {
        return Err(DeliveryError::PacketTooLarge(total_len));
    }

    let mut packet = BytesMut::with_capacity(total_len);

    // IPv4 header, no options
    packet.put_u8(0x45);
    packet.put_u8(0);
    packet.put_u16(total_len as u16);
    packet.put_u16(0); // identification, filled in by the kernel
    packet.put_u16(0x4000); // don't fragment
    packet.put_u8(DEFAULT_TTL);
    packet.put_u8(IPPROTO_UDP);
    packet.put_u16(0);
    packet.put_slice(&src.octets());
    packet.put_slice(&dst.octets());
    let ip_checksum = checksum(&[&packet[..IPV4_HEADER_LEN]]);
    packet[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    // UDP header
    packet.put_u16(src_port);
    packet.put_u16(dst_port);
    packet.put_u16(udp_len as u16);
    packet.put_u16(0);
    packet.put_slice(payload);

    let mut pseudo = [0u8; 12];
    pseudo[..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = IPPROTO_UDP;
    pseudo[10..12].copy_from_slice(&(udp_len as u16).to_be_bytes());

    let udp_checksum = match checksum(&[&pseudo, &packet[IPV4_HEADER_LEN..]]) {
        0 => 0xffff,
        sum => sum,
    };
    let at = IPV4_HEADER_LEN + 6;
    packet[at..at + 2].copy_from_slice(&udp_checksum.to_be_bytes());

    Ok(packet)
}
