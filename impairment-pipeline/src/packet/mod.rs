//! Just enough Ethernet/IP/TCP/UDP parsing for the inspecting stages
//!
//! Parsing never fails loudly: anything that is not a well-formed, unfragmented IPv4 or IPv6
//! packet inside an Ethernet II frame yields `None` and the caller forwards the frame unchanged.

pub mod craft;
pub mod dns;

use pnet_packet::Packet;
use pnet_packet::ethernet::{EtherTypes, EthernetPacket};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::ipv6::Ipv6Packet;
use pnet_packet::tcp::{TcpFlags, TcpPacket};
use pnet_packet::udp::UdpPacket;
use std::net::IpAddr;

pub const ETHERNET_HEADER_LEN: usize = 14;
const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const TCP_MIN_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

const IPV6_HOP_BY_HOP: u8 = 0;
const IPV6_ROUTING: u8 = 43;
const IPV6_FRAGMENT: u8 = 44;
const IPV6_DESTINATION_OPTIONS: u8 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpHeader {
    pub source: IpAddr,
    pub destination: IpAddr,
    /// TTL for IPv4, hop limit for IPv6
    pub ttl: u8,
    /// The upper-layer protocol, after any IPv6 extension headers
    pub protocol: u8,
    start: usize,
    transport_start: usize,
    end: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence: u32,
    pub acknowledgement: u32,
    pub flags: u16,
}

impl TcpHeader {
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn is_reset(&self) -> bool {
        self.has_flag(u16::from(TcpFlags::RST))
    }

    /// Sequence space consumed by the segment, which the peer must acknowledge
    pub fn sequence_len(&self, payload_len: usize) -> u32 {
        let mut len = payload_len as u32;
        if self.has_flag(u16::from(TcpFlags::SYN)) {
            len = len.wrapping_add(1);
        }
        if self.has_flag(u16::from(TcpFlags::FIN)) {
            len = len.wrapping_add(1);
        }
        len
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UdpHeader {
    pub source_port: u16,
    pub destination_port: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Tcp(TcpHeader),
    Udp(UdpHeader),
    Icmp,
    Other,
}

/// A parsed view over the bytes of a frame
#[derive(Clone, Copy, Debug)]
pub struct FrameInfo<'a> {
    bytes: &'a [u8],
    pub ip: IpHeader,
    pub transport: Transport,
    payload_start: usize,
}

impl<'a> FrameInfo<'a> {
    pub fn parse(bytes: &'a [u8]) -> Option<Self> {
        let ethernet = EthernetPacket::new(bytes)?;
        let ethertype = ethernet.get_ethertype();
        let (ip, fragmented) = if ethertype == EtherTypes::Ipv4 {
            parse_ipv4(bytes)?
        } else if ethertype == EtherTypes::Ipv6 {
            parse_ipv6(bytes)?
        } else {
            return None;
        };

        let (transport, payload_start) = if fragmented {
            (Transport::Other, ip.transport_start)
        } else {
            parse_transport(bytes, &ip)
        };

        Some(Self {
            bytes,
            ip,
            transport,
            payload_start,
        })
    }

    pub fn destination_mac(&self) -> [u8; 6] {
        mac_at(self.bytes, 0)
    }

    pub fn source_mac(&self) -> [u8; 6] {
        mac_at(self.bytes, 6)
    }

    pub fn is_ipv4(&self) -> bool {
        self.ip.source.is_ipv4()
    }

    pub fn is_icmp(&self) -> bool {
        self.transport == Transport::Icmp
    }

    /// Source and destination ports for TCP and UDP
    pub fn ports(&self) -> Option<(u16, u16)> {
        match self.transport {
            Transport::Tcp(tcp) => Some((tcp.source_port, tcp.destination_port)),
            Transport::Udp(udp) => Some((udp.source_port, udp.destination_port)),
            Transport::Icmp | Transport::Other => None,
        }
    }

    /// The transport payload (empty for ICMP and unknown protocols)
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[self.payload_start..self.ip.end]
    }

    /// Everything after the IP header, transport header included
    pub fn ip_payload(&self) -> &'a [u8] {
        &self.bytes[self.ip.transport_start..self.ip.end]
    }

    /// The IP header plus the first 8 bytes of its payload, as quoted by ICMP errors
    pub fn icmp_quote(&self) -> &'a [u8] {
        let end = (self.ip.transport_start + 8).min(self.ip.end);
        &self.bytes[self.ip.start..end]
    }
}

fn mac_at(bytes: &[u8], offset: usize) -> [u8; 6] {
    let mut mac = [0; 6];
    mac.copy_from_slice(&bytes[offset..offset + 6]);
    mac
}

fn parse_ipv4(bytes: &[u8]) -> Option<(IpHeader, bool)> {
    let packet = Ipv4Packet::new(&bytes[ETHERNET_HEADER_LEN..])?;
    if packet.get_version() != 4 {
        return None;
    }

    let header_len = usize::from(packet.get_header_length()) * 4;
    let total_len = usize::from(packet.get_total_length());
    if header_len < IPV4_MIN_HEADER_LEN || total_len < header_len {
        return None;
    }

    let start = ETHERNET_HEADER_LEN;
    let end = (start + total_len).min(bytes.len());
    if start + header_len > end {
        return None;
    }

    // More-fragments flag or a non-zero offset
    let fragmented = packet.get_fragment_offset() != 0 || packet.get_flags() & 0b001 != 0;

    let header = IpHeader {
        source: IpAddr::V4(packet.get_source()),
        destination: IpAddr::V4(packet.get_destination()),
        ttl: packet.get_ttl(),
        protocol: packet.get_next_level_protocol().0,
        start,
        transport_start: start + header_len,
        end,
    };
    Some((header, fragmented))
}

fn parse_ipv6(bytes: &[u8]) -> Option<(IpHeader, bool)> {
    let packet = Ipv6Packet::new(&bytes[ETHERNET_HEADER_LEN..])?;
    if packet.get_version() != 6 {
        return None;
    }

    let start = ETHERNET_HEADER_LEN;
    let end = (start + IPV6_HEADER_LEN + usize::from(packet.get_payload_length())).min(bytes.len());
    let mut protocol = packet.get_next_header().0;
    let mut offset = start + IPV6_HEADER_LEN;
    if offset > end {
        return None;
    }

    let mut fragmented = false;
    loop {
        match protocol {
            IPV6_HOP_BY_HOP | IPV6_ROUTING | IPV6_DESTINATION_OPTIONS => {
                if offset + 2 > end {
                    return None;
                }
                protocol = bytes[offset];
                offset += (usize::from(bytes[offset + 1]) + 1) * 8;
                if offset > end {
                    return None;
                }
            }
            IPV6_FRAGMENT => {
                fragmented = true;
                break;
            }
            _ => break,
        }
    }

    let header = IpHeader {
        source: IpAddr::V6(packet.get_source()),
        destination: IpAddr::V6(packet.get_destination()),
        ttl: packet.get_hop_limit(),
        protocol,
        start,
        transport_start: offset,
        end,
    };
    Some((header, fragmented))
}

fn parse_transport(bytes: &[u8], ip: &IpHeader) -> (Transport, usize) {
    let segment = &bytes[ip.transport_start..ip.end];
    let unknown = (Transport::Other, ip.transport_start);

    match ip.protocol {
        p if p == IpNextHeaderProtocols::Tcp.0 => {
            let Some(tcp) = TcpPacket::new(segment) else {
                return unknown;
            };
            let header_len = usize::from(tcp.get_data_offset()) * 4;
            if header_len < TCP_MIN_HEADER_LEN || header_len > segment.len() {
                return unknown;
            }

            let header = TcpHeader {
                source_port: tcp.get_source(),
                destination_port: tcp.get_destination(),
                sequence: tcp.get_sequence(),
                acknowledgement: tcp.get_acknowledgement(),
                flags: u16::from(tcp.get_flags()),
            };
            (Transport::Tcp(header), ip.transport_start + header_len)
        }
        p if p == IpNextHeaderProtocols::Udp.0 => {
            let Some(udp) = UdpPacket::new(segment) else {
                return unknown;
            };

            let header = UdpHeader {
                source_port: udp.get_source(),
                destination_port: udp.get_destination(),
            };
            (Transport::Udp(header), ip.transport_start + UDP_HEADER_LEN)
        }
        p if p == IpNextHeaderProtocols::Icmp.0 || p == IpNextHeaderProtocols::Icmpv6.0 => {
            (Transport::Icmp, ip.end)
        }
        _ => unknown,
    }
}

/// Whether the frame carries ICMP or ICMPv6
pub fn is_icmp(bytes: &[u8]) -> bool {
    FrameInfo::parse(bytes).is_some_and(|info| info.is_icmp())
}


#[cfg(test)]
mod tests {
    use super::test_frames;
    use super::*;

    #[test]
    fn parse_udp_frame() {
        let frame = test_frames::udp(
            IpAddr::from([10, 0, 0, 1]),
            IpAddr::from([10, 0, 0, 2]),
            (1234, 53),
            b"hello",
        );

        let info = FrameInfo::parse(frame.as_bytes()).unwrap();
        assert_eq!(info.ip.source, IpAddr::from([10, 0, 0, 1]));
        assert_eq!(info.ip.destination, IpAddr::from([10, 0, 0, 2]));
        assert_eq!(info.ip.ttl, 64);
        assert_eq!(info.ports(), Some((1234, 53)));
        assert_eq!(info.payload(), b"hello");
        assert_eq!(info.source_mac(), test_frames::LEFT_MAC);
        assert_eq!(info.destination_mac(), test_frames::RIGHT_MAC);
    }

    #[test]
    fn parse_tcp_frame_over_ipv6() {
        let frame = test_frames::tcp(
            "fd00::1".parse().unwrap(),
            "fd00::2".parse().unwrap(),
            (50000, 80),
            7,
            b"GET /",
        );

        let info = FrameInfo::parse(frame.as_bytes()).unwrap();
        let Transport::Tcp(tcp) = info.transport else {
            panic!("expected tcp, got {:?}", info.transport);
        };
        assert_eq!(tcp.sequence, 7);
        assert!(!tcp.is_reset());
        assert_eq!(info.payload(), b"GET /");
        assert!(!info.is_ipv4());
    }

    #[test]
    fn icmp_is_recognized() {
        let frame = test_frames::icmp_echo(IpAddr::from([10, 0, 0, 1]), IpAddr::from([10, 0, 0, 2]));
        assert!(is_icmp(frame.as_bytes()));
        assert!(!is_icmp(test_frames::numbered(1).as_bytes()));
    }

    #[test]
    fn non_ip_and_truncated_frames_are_not_parsed() {
        let mut arp = vec![0xff; 12];
        arp.extend_from_slice(&[0x08, 0x06]);
        arp.extend_from_slice(&[0; 28]);
        assert!(FrameInfo::parse(&arp).is_none());

        assert!(FrameInfo::parse(&[0; 10]).is_none());

        let frame = test_frames::numbered(1);
        assert!(FrameInfo::parse(&frame.as_bytes()[..20]).is_none());
    }

    #[test]
    fn fragments_are_not_inspected() {
        let mut bytes = test_frames::numbered(1).into_bytes();
        // Set the more-fragments flag
        bytes[ETHERNET_HEADER_LEN + 6] |= 0x20;

        let info = FrameInfo::parse(&bytes).unwrap();
        assert_eq!(info.transport, Transport::Other);
        assert_eq!(info.ports(), None);
    }
}
