//! Frame construction for the sender's dispatch step (§4.4 Case C).
//!
//! Builds an Ethernet frame directly into a caller-owned buffer (typically
//! an [`ktsn_core::Mbuf`] slot's own bytes reused in place) rather than
//! allocating — the source fills the DPDK mbuf in place in
//! `prepare_packet` and this keeps the same shape.

use ktsn_core::{Metadata, SHIM_SRC_PORT, Transport};

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

const ETHERTYPE_IPV4: u16 = 0x0800;
/// IEEE 802 "Local Experimental Ethertype 1", used as a placeholder for the
/// raw `Transport::Ethernet` frame, which carries no IP/UDP framing of its
/// own and so has no real ethertype to report.
const ETHERTYPE_EXPERIMENTAL: u16 = 0x88b5;
const IP_PROTO_UDP: u8 = 17;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("frame of {needed} bytes does not fit in a buffer of {available} bytes")]
    BufferTooSmall { needed: usize, available: usize },
}

/// Total frame length for `transport` carrying a payload of `payload_len`
/// bytes, headers included.
pub fn frame_len(transport: Transport, payload_len: usize) -> usize {
    match transport {
        Transport::Ethernet => ETHERNET_HEADER_LEN + payload_len,
        Transport::Udp => ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN + payload_len,
    }
}

/// Builds the frame described by `metadata` and `payload` into `out`,
/// returning the number of bytes written.
///
/// `metadata.size` is not consulted here; callers pass the already-sliced
/// `payload` (`&mbuf.data[..metadata.size as usize]`).
pub fn build_frame_into(out: &mut [u8], metadata: &Metadata, payload: &[u8]) -> Result<usize, ProtoError> {
    let total = frame_len(metadata.transport, payload.len());
    if total > out.len() {
        return Err(ProtoError::BufferTooSmall { needed: total, available: out.len() });
    }

    out[0..6].copy_from_slice(&metadata.eth_dst);
    out[6..12].copy_from_slice(&metadata.eth_src);

    match metadata.transport {
        Transport::Ethernet => {
            out[12..14].copy_from_slice(&ETHERTYPE_EXPERIMENTAL.to_be_bytes());
            out[ETHERNET_HEADER_LEN..total].copy_from_slice(payload);
        }
        Transport::Udp => {
            out[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

            let ip_start = ETHERNET_HEADER_LEN;
            let ip_total_len = (IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len()) as u16;
            {
                let ip = &mut out[ip_start..ip_start + IPV4_HEADER_LEN];
                ip[0] = 0x45; // version 4, IHL 5 (no options)
                ip[1] = 0; // DSCP/ECN
                ip[2..4].copy_from_slice(&ip_total_len.to_be_bytes());
                ip[4..6].copy_from_slice(&0u16.to_be_bytes()); // identification
                ip[6..8].copy_from_slice(&0u16.to_be_bytes()); // flags/fragment offset
                ip[8] = 64; // TTL
                ip[9] = IP_PROTO_UDP;
                ip[10..12].copy_from_slice(&0u16.to_be_bytes()); // checksum, filled below
                ip[12..16].copy_from_slice(&metadata.ip_src.to_be_bytes());
                ip[16..20].copy_from_slice(&metadata.ip_dst.to_be_bytes());
            }
            let checksum = ipv4_header_checksum(&out[ip_start..ip_start + IPV4_HEADER_LEN]);
            out[ip_start + 10..ip_start + 12].copy_from_slice(&checksum.to_be_bytes());

            let udp_start = ip_start + IPV4_HEADER_LEN;
            let udp_len = (UDP_HEADER_LEN + payload.len()) as u16;
            out[udp_start..udp_start + 2].copy_from_slice(&SHIM_SRC_PORT.to_be_bytes());
            out[udp_start + 2..udp_start + 4].copy_from_slice(&metadata.udp_dport.to_be_bytes());
            out[udp_start + 4..udp_start + 6].copy_from_slice(&udp_len.to_be_bytes());
            out[udp_start + 6..udp_start + 8].copy_from_slice(&0u16.to_be_bytes()); // UDP checksum disabled

            let body_start = udp_start + UDP_HEADER_LEN;
            out[body_start..total].copy_from_slice(payload);
        }
    }

    Ok(total)
}

/// Internet checksum (RFC 1071) over an IPv4 header with the checksum
/// field itself zeroed.
fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = header.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += u16::from_be_bytes([*last, 0]) as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ktsn_core::Metadata;

    fn udp_metadata() -> Metadata {
        Metadata {
            txtime: 1,
            ip_src: u32::from_be_bytes([10, 0, 0, 1]),
            ip_dst: u32::from_be_bytes([10, 0, 0, 2]),
            size: 4,
            udp_dport: 4000,
            transport: Transport::Udp,
            eth_src: [0x02, 0, 0, 0, 0, 1],
            eth_dst: [0xff; 6],
        }
    }

    #[test]
    fn frame_len_accounts_for_every_header() {
        assert_eq!(frame_len(Transport::Udp, 4), 14 + 20 + 8 + 4);
        assert_eq!(frame_len(Transport::Ethernet, 4), 14 + 4);
    }

    #[test]
    fn builds_a_well_formed_udp_frame() {
        let metadata = udp_metadata();
        let payload = [1u8, 2, 3, 4];
        let mut out = [0u8; 64];

        let n = build_frame_into(&mut out, &metadata, &payload).unwrap();
        assert_eq!(n, 46);

        assert_eq!(&out[0..6], &metadata.eth_dst);
        assert_eq!(&out[6..12], &metadata.eth_src);
        assert_eq!(&out[12..14], &0x0800u16.to_be_bytes());

        let ip = &out[14..34];
        assert_eq!(ip[0], 0x45);
        assert_eq!(u16::from_be_bytes([ip[2], ip[3]]), 20 + 8 + 4);
        assert_eq!(ip[9], 17);
        assert_eq!(&ip[12..16], &metadata.ip_src.to_be_bytes());
        assert_eq!(&ip[16..20], &metadata.ip_dst.to_be_bytes());

        let udp = &out[34..42];
        assert_eq!(u16::from_be_bytes([udp[0], udp[1]]), SHIM_SRC_PORT);
        assert_eq!(u16::from_be_bytes([udp[2], udp[3]]), 4000);
        assert_eq!(u16::from_be_bytes([udp[4], udp[5]]), 12);

        assert_eq!(&out[42..46], &payload);
    }

    #[test]
    fn ipv4_checksum_is_self_verifying() {
        let metadata = udp_metadata();
        let mut out = [0u8; 64];
        build_frame_into(&mut out, &metadata, &[0u8; 4]).unwrap();

        // Summing the header including its own checksum field must fold to
        // zero (the defining property of the ones'-complement checksum).
        let ip = &out[14..34];
        let mut sum: u32 = 0;
        for word in ip.chunks_exact(2) {
            sum += u16::from_be_bytes([word[0], word[1]]) as u32;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        assert_eq!(sum as u16, 0xFFFF);
    }

    #[test]
    fn rejects_a_buffer_too_small_for_the_frame() {
        let metadata = udp_metadata();
        let mut out = [0u8; 10];
        assert!(build_frame_into(&mut out, &metadata, &[0u8; 4]).is_err());
    }

    #[test]
    fn builds_a_raw_ethernet_frame_with_no_ip_framing() {
        let mut metadata = udp_metadata();
        metadata.transport = Transport::Ethernet;
        let payload = [9u8, 9, 9];
        let mut out = [0u8; 32];

        let n = build_frame_into(&mut out, &metadata, &payload).unwrap();
        assert_eq!(n, 14 + 3);
        assert_eq!(&out[14..17], &payload);
    }
}
