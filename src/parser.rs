//! Network-layer frame decoding.
//!
//! Only the IPv4/IPv6 envelope is classified. Anything that is not an IP
//! packet (ARP, LLDP, truncated frames, unknown link types) decodes to `None`.

use std::net::IpAddr;

use etherparse::{LaxNetSlice, LaxSlicedPacket, LinuxSllHeaderSlice};

use crate::models::{DecodedFrame, LayerType};

pub const LINKTYPE_NULL: i32 = 0;
pub const LINKTYPE_ETHERNET: i32 = 1;
pub const LINKTYPE_RAW: i32 = 101;
pub const LINKTYPE_LOOP: i32 = 108;
pub const LINKTYPE_LINUX_SLL: i32 = 113;
// Platform-specific DLT_RAW values some libpcap builds still report.
const DLT_RAW_BSD: i32 = 12;
const DLT_RAW_OPENBSD: i32 = 14;

const NULL_HEADER_LEN: usize = 4;

/// Decode one captured frame. `length` is the original wire length reported
/// by the capture source.
///
/// Slicing is lax: a frame cut short by the snapshot length still yields its
/// network header.
pub fn decode_frame(link_type: i32, data: &[u8], length: u32) -> Option<DecodedFrame> {
    let sliced = match link_type {
        LINKTYPE_ETHERNET => LaxSlicedPacket::from_ethernet(data).ok()?,
        LINKTYPE_NULL | LINKTYPE_LOOP => LaxSlicedPacket::from_ip(data.get(NULL_HEADER_LEN..)?).ok()?,
        LINKTYPE_LINUX_SLL => {
            let sll = LinuxSllHeaderSlice::from_slice(data).ok()?;
            LaxSlicedPacket::from_ip(data.get(sll.slice().len()..)?).ok()?
        }
        LINKTYPE_RAW | DLT_RAW_BSD | DLT_RAW_OPENBSD => LaxSlicedPacket::from_ip(data).ok()?,
        _ => return None,
    };

    decode_network(sliced.net?, length)
}

fn decode_network(net: LaxNetSlice<'_>, length: u32) -> Option<DecodedFrame> {
    #[allow(unreachable_patterns)]
    match net {
        LaxNetSlice::Ipv4(ipv4) => {
            let ip = ipv4.header();
            Some(DecodedFrame {
                layer_type: LayerType::Ipv4,
                next_layer_type: next_layer_name(u8::from(ip.protocol())).to_string(),
                length,
                src_ip: IpAddr::V4(ip.source_addr()),
                dst_ip: IpAddr::V4(ip.destination_addr()),
            })
        }
        LaxNetSlice::Ipv6(ipv6) => {
            let ip = ipv6.header();
            Some(DecodedFrame {
                layer_type: LayerType::Ipv6,
                next_layer_type: next_layer_name(u8::from(ip.next_header())).to_string(),
                length,
                src_ip: IpAddr::V6(ip.source_addr()),
                dst_ip: IpAddr::V6(ip.destination_addr()),
            })
        }
        _ => None,
    }
}

/// Name of the layer an IP header says comes next. IPv6 extension headers
/// are named as such rather than skipped.
pub fn next_layer_name(protocol: u8) -> &'static str {
    match protocol {
        0 => "IPv6HopByHop",
        1 => "ICMPv4",
        2 => "IGMP",
        4 => "IPv4",
        6 => "TCP",
        17 => "UDP",
        41 => "IPv6",
        43 => "IPv6Routing",
        44 => "IPv6Fragment",
        47 => "GRE",
        50 => "IPSecESP",
        51 => "IPSecAH",
        58 => "ICMPv6",
        59 => "IPv6NoNextHeader",
        60 => "IPv6Destination",
        89 => "OSPF",
        103 => "PIM",
        112 => "VRRP",
        132 => "SCTP",
        136 => "UDPLite",
        _ => "Payload",
    }
}

#[cfg(test)]
pub(crate) mod samples {
    /// Ethernet II + IPv4 + 20 bytes of TCP, 10.0.0.5 -> 8.8.8.8.
    pub fn ethernet_ipv4_tcp() -> Vec<u8> {
        let mut frame = vec![
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, // dst mac
            0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, // src mac
            0x08, 0x00, // IPv4
        ];
        frame.extend_from_slice(&ipv4_tcp());
        frame
    }

    pub fn ipv4_tcp() -> Vec<u8> {
        let mut packet = vec![
            0x45, 0x00, 0x00, 0x28, // version/ihl, tos, total length 40
            0x00, 0x01, 0x00, 0x00, // id, flags/fragment
            0x40, 0x06, 0x00, 0x00, // ttl, protocol TCP, checksum
            10, 0, 0, 5, // src
            8, 8, 8, 8, // dst
        ];
        packet.extend_from_slice(&[0u8; 20]);
        packet
    }

    /// Bare IPv6 header carrying UDP, 2001:db8::1 -> 2001:db8::2.
    pub fn ipv6_udp() -> Vec<u8> {
        let mut packet = vec![
            0x60, 0x00, 0x00, 0x00, // version, class, flow label
            0x00, 0x08, 0x11, 0x40, // payload length 8, next header UDP, hop limit
        ];
        packet.extend_from_slice(&[0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        packet.extend_from_slice(&[0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]);
        packet.extend_from_slice(&[0u8; 8]);
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_ethernet_ipv4() {
        let frame = decode_frame(LINKTYPE_ETHERNET, &samples::ethernet_ipv4_tcp(), 120).unwrap();

        assert_eq!(frame.layer_type, LayerType::Ipv4);
        assert_eq!(frame.next_layer_type, "TCP");
        assert_eq!(frame.length, 120);
        assert_eq!(frame.src_ip.to_string(), "10.0.0.5");
        assert_eq!(frame.dst_ip.to_string(), "8.8.8.8");
    }

    #[test]
    fn decodes_raw_ipv6() {
        let frame = decode_frame(LINKTYPE_RAW, &samples::ipv6_udp(), 48).unwrap();

        assert_eq!(frame.layer_type, LayerType::Ipv6);
        assert_eq!(frame.next_layer_type, "UDP");
        assert_eq!(frame.src_ip.to_string(), "2001:db8::1");
        assert_eq!(frame.dst_ip.to_string(), "2001:db8::2");
    }

    #[test]
    fn decodes_vlan_tagged_frame() {
        let plain = samples::ethernet_ipv4_tcp();
        let mut tagged = plain[..12].to_vec();
        tagged.extend_from_slice(&[0x81, 0x00, 0x00, 0x2a, 0x08, 0x00]);
        tagged.extend_from_slice(&plain[14..]);

        let frame = decode_frame(LINKTYPE_ETHERNET, &tagged, 124).unwrap();
        assert_eq!(frame.dst_ip.to_string(), "8.8.8.8");
    }

    #[test]
    fn decodes_stacked_vlan_tags() {
        let plain = samples::ethernet_ipv4_tcp();
        let mut tagged = plain[..12].to_vec();
        tagged.extend_from_slice(&[0x88, 0xa8, 0x00, 0x64, 0x81, 0x00, 0x00, 0x2a, 0x08, 0x00]);
        tagged.extend_from_slice(&plain[14..]);

        let frame = decode_frame(LINKTYPE_ETHERNET, &tagged, 128).unwrap();
        assert_eq!(frame.src_ip.to_string(), "10.0.0.5");
        assert_eq!(frame.next_layer_type, "TCP");
    }

    #[test]
    fn decodes_linux_cooked_capture() {
        let mut frame = vec![
            0x00, 0x00, // packet type: to us
            0x00, 0x01, // ARPHRD_ETHER
            0x00, 0x06, // address length
            0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0x00, 0x00, // address, padded
            0x08, 0x00, // IPv4
        ];
        frame.extend_from_slice(&samples::ipv4_tcp());

        let decoded = decode_frame(LINKTYPE_LINUX_SLL, &frame, 56).unwrap();
        assert_eq!(decoded.layer_type, LayerType::Ipv4);
        assert_eq!(decoded.dst_ip.to_string(), "8.8.8.8");
    }

    #[test]
    fn decodes_frame_cut_by_snaplen() {
        let mut frame = samples::ethernet_ipv4_tcp();
        // The IP header claims 1500 bytes; only 40 were captured.
        frame[14 + 2] = 0x05;
        frame[14 + 3] = 0xdc;

        let decoded = decode_frame(LINKTYPE_ETHERNET, &frame, 1514).unwrap();
        assert_eq!(decoded.length, 1514);
        assert_eq!(decoded.dst_ip.to_string(), "8.8.8.8");
    }

    #[test]
    fn decodes_loopback_null_header() {
        let mut frame = vec![0x02, 0x00, 0x00, 0x00];
        frame.extend_from_slice(&samples::ipv4_tcp());

        let decoded = decode_frame(LINKTYPE_NULL, &frame, 44).unwrap();
        assert_eq!(decoded.src_ip.to_string(), "10.0.0.5");
    }

    #[test]
    fn drops_non_ip_frames() {
        let mut arp = samples::ethernet_ipv4_tcp();
        arp[12] = 0x08;
        arp[13] = 0x06;

        assert!(decode_frame(LINKTYPE_ETHERNET, &arp, 60).is_none());
        assert!(decode_frame(LINKTYPE_ETHERNET, &[0u8; 6], 6).is_none());
        assert!(decode_frame(LINKTYPE_RAW, &[], 0).is_none());
        assert!(decode_frame(LINKTYPE_RAW, &[0x45, 0x00], 2).is_none());
        assert!(decode_frame(9999, &samples::ipv4_tcp(), 40).is_none());
    }

    #[test]
    fn names_unknown_protocols_as_payload() {
        assert_eq!(next_layer_name(58), "ICMPv6");
        assert_eq!(next_layer_name(253), "Payload");
    }
}
