//! Builders for the frames the stages synthesize: ICMP errors, TCP resets and spoofed replies

use pnet_packet::icmp::{IcmpCode, IcmpTypes, MutableIcmpPacket};
use pnet_packet::icmpv6::{Icmpv6Code, Icmpv6Packet, Icmpv6Types, MutableIcmpv6Packet};
use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv4::MutableIpv4Packet;
use pnet_packet::ipv6::MutableIpv6Packet;
use pnet_packet::tcp::{MutableTcpPacket, TcpFlags};
use pnet_packet::udp::MutableUdpPacket;
use pnet_packet::{ipv4, tcp, udp};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::{ETHERNET_HEADER_LEN, FrameInfo, TcpHeader, UdpHeader};
use crate::frame::Frame;

const IPV4_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;
const ICMP_HEADER_LEN: usize = 8;
const DEFAULT_TTL: u8 = 64;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IcmpErrorKind {
    TimeExceeded,
    Unreachable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpSegmentKind {
    Data,
    Reset,
}

/// An ICMP error from `from` back to the sender of `probe`
///
/// Returns `None` when `from` and the probe belong to different address families.
pub fn icmp_error_reply(probe: &FrameInfo, from: IpAddr, kind: IcmpErrorKind) -> Option<Frame> {
    let quote = probe.icmp_quote();
    let packet = match (from, probe.ip.source) {
        (IpAddr::V4(from), IpAddr::V4(to)) => {
            let message = icmpv4_error(kind, quote)?;
            ipv4_packet(from, to, IpNextHeaderProtocols::Icmp, DEFAULT_TTL, &message)?
        }
        (IpAddr::V6(from), IpAddr::V6(to)) => {
            let message = icmpv6_error(kind, from, to, quote)?;
            ipv6_packet(from, to, IpNextHeaderProtocols::Icmpv6, DEFAULT_TTL, &message)?
        }
        _ => return None,
    };

    Some(ethernet_frame(
        probe.source_mac(),
        probe.destination_mac(),
        from,
        &packet,
    ))
}

/// A reset travelling back to the sender of `segment`
pub fn tcp_reset_to_source(info: &FrameInfo, segment: &TcpHeader) -> Option<Frame> {
    let acknowledgement = segment
        .sequence
        .wrapping_add(segment.sequence_len(info.payload().len()));
    tcp_reply(
        info,
        segment,
        segment.acknowledgement,
        acknowledgement,
        TcpSegmentKind::Reset,
        &[],
    )
}

/// A reset continuing toward the destination of `segment`, in place of the segment itself
pub fn tcp_reset_to_destination(info: &FrameInfo, segment: &TcpHeader) -> Option<Frame> {
    let bytes = tcp_segment(
        info.ip.source,
        info.ip.destination,
        (segment.source_port, segment.destination_port),
        segment.sequence,
        segment.acknowledgement,
        TcpSegmentKind::Reset,
        &[],
    )?;
    let packet = ip_packet(info.ip.source, info.ip.destination, 6, DEFAULT_TTL, &bytes)?;
    Some(ethernet_frame(
        info.destination_mac(),
        info.source_mac(),
        info.ip.source,
        &packet,
    ))
}

/// A data segment answering `segment` on behalf of its destination
pub fn tcp_data_reply(info: &FrameInfo, segment: &TcpHeader, payload: &[u8]) -> Option<Frame> {
    let acknowledgement = segment
        .sequence
        .wrapping_add(segment.sequence_len(info.payload().len()));
    tcp_reply(
        info,
        segment,
        segment.acknowledgement,
        acknowledgement,
        TcpSegmentKind::Data,
        payload,
    )
}

fn tcp_reply(
    info: &FrameInfo,
    segment: &TcpHeader,
    sequence: u32,
    acknowledgement: u32,
    kind: TcpSegmentKind,
    payload: &[u8],
) -> Option<Frame> {
    let bytes = tcp_segment(
        info.ip.destination,
        info.ip.source,
        (segment.destination_port, segment.source_port),
        sequence,
        acknowledgement,
        kind,
        payload,
    )?;
    let packet = ip_packet(info.ip.destination, info.ip.source, 6, DEFAULT_TTL, &bytes)?;
    Some(ethernet_frame(
        info.source_mac(),
        info.destination_mac(),
        info.ip.destination,
        &packet,
    ))
}

/// A UDP datagram answering `datagram` on behalf of its destination
pub fn udp_reply(info: &FrameInfo, datagram: &UdpHeader, payload: &[u8]) -> Option<Frame> {
    let bytes = udp_datagram(
        info.ip.destination,
        info.ip.source,
        (datagram.destination_port, datagram.source_port),
        payload,
    )?;
    let packet = ip_packet(info.ip.destination, info.ip.source, 17, DEFAULT_TTL, &bytes)?;
    Some(ethernet_frame(
        info.source_mac(),
        info.destination_mac(),
        info.ip.destination,
        &packet,
    ))
}

pub(crate) fn ethernet_frame(
    destination: [u8; 6],
    source: [u8; 6],
    family: IpAddr,
    ip_packet: &[u8],
) -> Frame {
    let ethertype = match family {
        IpAddr::V4(_) => ETHERTYPE_IPV4,
        IpAddr::V6(_) => ETHERTYPE_IPV6,
    };

    let mut bytes = Vec::with_capacity(ETHERNET_HEADER_LEN + ip_packet.len());
    bytes.extend_from_slice(&destination);
    bytes.extend_from_slice(&source);
    bytes.extend_from_slice(&ethertype.to_be_bytes());
    bytes.extend_from_slice(ip_packet);
    Frame::new(bytes)
}

pub(crate) fn ip_packet(
    source: IpAddr,
    destination: IpAddr,
    protocol: u8,
    ttl: u8,
    payload: &[u8],
) -> Option<Vec<u8>> {
    let protocol = IpNextHeaderProtocol::new(protocol);
    match (source, destination) {
        (IpAddr::V4(source), IpAddr::V4(destination)) => {
            ipv4_packet(source, destination, protocol, ttl, payload)
        }
        (IpAddr::V6(source), IpAddr::V6(destination)) => {
            ipv6_packet(source, destination, protocol, ttl, payload)
        }
        _ => None,
    }
}

fn ipv4_packet(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    protocol: IpNextHeaderProtocol,
    ttl: u8,
    payload: &[u8],
) -> Option<Vec<u8>> {
    let total_len = u16::try_from(IPV4_HEADER_LEN + payload.len()).ok()?;
    let mut buffer = vec![0; usize::from(total_len)];
    let mut writer = MutableIpv4Packet::new(&mut buffer)?;
    writer.set_version(4);
    writer.set_header_length(5);
    writer.set_total_length(total_len);
    // Don't fragment
    writer.set_flags(0b010);
    writer.set_ttl(ttl);
    writer.set_next_level_protocol(protocol);
    writer.set_source(source);
    writer.set_destination(destination);
    writer.set_payload(payload);
    let checksum = ipv4::checksum(&writer.to_immutable());
    writer.set_checksum(checksum);
    drop(writer);

    Some(buffer)
}

fn ipv6_packet(
    source: Ipv6Addr,
    destination: Ipv6Addr,
    protocol: IpNextHeaderProtocol,
    hop_limit: u8,
    payload: &[u8],
) -> Option<Vec<u8>> {
    let payload_len = u16::try_from(payload.len()).ok()?;
    let mut buffer = vec![0; 40 + payload.len()];
    let mut writer = MutableIpv6Packet::new(&mut buffer)?;
    writer.set_version(6);
    writer.set_payload_length(payload_len);
    writer.set_next_header(protocol);
    writer.set_hop_limit(hop_limit);
    writer.set_source(source);
    writer.set_destination(destination);
    writer.set_payload(payload);
    drop(writer);

    Some(buffer)
}

pub(crate) fn udp_datagram(
    source: IpAddr,
    destination: IpAddr,
    (source_port, destination_port): (u16, u16),
    payload: &[u8],
) -> Option<Vec<u8>> {
    let len = u16::try_from(8 + payload.len()).ok()?;
    let mut buffer = vec![0; usize::from(len)];
    let mut writer = MutableUdpPacket::new(&mut buffer)?;
    writer.set_source(source_port);
    writer.set_destination(destination_port);
    writer.set_length(len);
    writer.set_payload(payload);
    let checksum = match (source, destination) {
        (IpAddr::V4(source), IpAddr::V4(destination)) => {
            udp::ipv4_checksum(&writer.to_immutable(), &source, &destination)
        }
        (IpAddr::V6(source), IpAddr::V6(destination)) => {
            udp::ipv6_checksum(&writer.to_immutable(), &source, &destination)
        }
        _ => return None,
    };
    writer.set_checksum(checksum);
    drop(writer);

    Some(buffer)
}

pub(crate) fn tcp_segment(
    source: IpAddr,
    destination: IpAddr,
    (source_port, destination_port): (u16, u16),
    sequence: u32,
    acknowledgement: u32,
    kind: TcpSegmentKind,
    payload: &[u8],
) -> Option<Vec<u8>> {
    let mut buffer = vec![0; TCP_HEADER_LEN + payload.len()];
    let mut writer = MutableTcpPacket::new(&mut buffer)?;
    writer.set_source(source_port);
    writer.set_destination(destination_port);
    writer.set_sequence(sequence);
    writer.set_acknowledgement(acknowledgement);
    writer.set_data_offset(5);
    match kind {
        TcpSegmentKind::Data => {
            writer.set_flags(TcpFlags::PSH | TcpFlags::ACK);
            writer.set_window(u16::MAX);
        }
        TcpSegmentKind::Reset => {
            writer.set_flags(TcpFlags::RST | TcpFlags::ACK);
            writer.set_window(0);
        }
    }
    writer.set_payload(payload);
    let checksum = match (source, destination) {
        (IpAddr::V4(source), IpAddr::V4(destination)) => {
            tcp::ipv4_checksum(&writer.to_immutable(), &source, &destination)
        }
        (IpAddr::V6(source), IpAddr::V6(destination)) => {
            tcp::ipv6_checksum(&writer.to_immutable(), &source, &destination)
        }
        _ => return None,
    };
    writer.set_checksum(checksum);
    drop(writer);

    Some(buffer)
}

fn icmpv4_error(kind: IcmpErrorKind, quote: &[u8]) -> Option<Vec<u8>> {
    let mut buffer = vec![0; ICMP_HEADER_LEN + quote.len()];
    let mut writer = MutableIcmpPacket::new(&mut buffer)?;
    match kind {
        IcmpErrorKind::TimeExceeded => {
            writer.set_icmp_type(IcmpTypes::TimeExceeded);
            writer.set_icmp_code(IcmpCode::new(0));
        }
        IcmpErrorKind::Unreachable => {
            // Host unreachable
            writer.set_icmp_type(IcmpTypes::DestinationUnreachable);
            writer.set_icmp_code(IcmpCode::new(1));
        }
    }
    drop(writer);

    buffer[ICMP_HEADER_LEN..].copy_from_slice(quote);
    let checksum = pnet_packet::util::checksum(&buffer, 1);
    buffer[2..4].copy_from_slice(&checksum.to_be_bytes());
    Some(buffer)
}

fn icmpv6_error(
    kind: IcmpErrorKind,
    source: Ipv6Addr,
    destination: Ipv6Addr,
    quote: &[u8],
) -> Option<Vec<u8>> {
    let mut buffer = vec![0; ICMP_HEADER_LEN + quote.len()];
    let mut writer = MutableIcmpv6Packet::new(&mut buffer)?;
    match kind {
        IcmpErrorKind::TimeExceeded => {
            writer.set_icmpv6_type(Icmpv6Types::TimeExceeded);
            writer.set_icmpv6_code(Icmpv6Code::new(0));
        }
        IcmpErrorKind::Unreachable => {
            // Address unreachable
            writer.set_icmpv6_type(Icmpv6Types::DestinationUnreachable);
            writer.set_icmpv6_code(Icmpv6Code::new(3));
        }
    }
    drop(writer);

    buffer[ICMP_HEADER_LEN..].copy_from_slice(quote);
    let checksum = pnet_packet::icmpv6::checksum(&Icmpv6Packet::new(&buffer)?, &source, &destination);
    buffer[2..4].copy_from_slice(&checksum.to_be_bytes());
    Some(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::test_frames;
    use crate::packet::{Transport, FrameInfo};

    #[test]
    fn time_exceeded_reply_goes_back_to_the_sender() {
        let probe = test_frames::udp_with_ttl(
            IpAddr::from([10, 0, 0, 1]),
            IpAddr::from([203, 0, 113, 9]),
            (33434, 33435),
            b"probe",
            2,
        );
        let info = FrameInfo::parse(probe.as_bytes()).unwrap();

        let hop = IpAddr::from([10, 1, 0, 3]);
        let reply = icmp_error_reply(&info, hop, IcmpErrorKind::TimeExceeded).unwrap();
        let parsed = FrameInfo::parse(reply.as_bytes()).unwrap();

        assert_eq!(parsed.ip.source, hop);
        assert_eq!(parsed.ip.destination, IpAddr::from([10, 0, 0, 1]));
        assert_eq!(parsed.transport, Transport::Icmp);
        assert_eq!(parsed.destination_mac(), info.source_mac());

        let icmp = &reply.as_bytes()[ETHERNET_HEADER_LEN + IPV4_HEADER_LEN..];
        assert_eq!(icmp[0], 11);
        assert_eq!(&icmp[ICMP_HEADER_LEN..], info.icmp_quote());
        assert_eq!(pnet_packet::util::checksum(icmp, 1), u16::from_be_bytes([icmp[2], icmp[3]]));
    }

    #[test]
    fn mismatched_families_produce_no_reply() {
        let probe = test_frames::udp(
            IpAddr::from([10, 0, 0, 1]),
            IpAddr::from([203, 0, 113, 9]),
            (33434, 33435),
            b"probe",
        );
        let info = FrameInfo::parse(probe.as_bytes()).unwrap();
        assert!(icmp_error_reply(&info, "fd00::1".parse().unwrap(), IcmpErrorKind::Unreachable).is_none());
    }

    #[test]
    fn icmpv6_unreachable() {
        let probe = test_frames::udp_with_ttl(
            "fd00::1".parse().unwrap(),
            "fd00:9::1".parse().unwrap(),
            (33434, 33435),
            b"probe",
            1,
        );
        let info = FrameInfo::parse(probe.as_bytes()).unwrap();
        let reply = icmp_error_reply(&info, "fd00:1::1".parse().unwrap(), IcmpErrorKind::Unreachable).unwrap();

        let parsed = FrameInfo::parse(reply.as_bytes()).unwrap();
        assert_eq!(parsed.ip.destination, "fd00::1".parse::<IpAddr>().unwrap());
        assert!(parsed.is_icmp());
        assert_eq!(reply.as_bytes()[ETHERNET_HEADER_LEN + 40], 1);
    }

    #[test]
    fn resets_target_both_ends() {
        let segment = test_frames::tcp(
            IpAddr::from([10, 0, 0, 1]),
            IpAddr::from([10, 0, 0, 2]),
            (50000, 80),
            100,
            b"abcd",
        );
        let info = FrameInfo::parse(segment.as_bytes()).unwrap();
        let Transport::Tcp(tcp) = info.transport else {
            unreachable!()
        };

        let back = tcp_reset_to_source(&info, &tcp).unwrap();
        let back = FrameInfo::parse(back.as_bytes()).unwrap();
        let Transport::Tcp(back_tcp) = back.transport else {
            unreachable!()
        };
        assert_eq!(back.ip.destination, IpAddr::from([10, 0, 0, 1]));
        assert_eq!(back.ports(), Some((80, 50000)));
        assert!(back_tcp.is_reset());
        assert_eq!(back_tcp.acknowledgement, 104);
        assert_eq!(back_tcp.sequence, 1000);

        let forward = tcp_reset_to_destination(&info, &tcp).unwrap();
        let forward = FrameInfo::parse(forward.as_bytes()).unwrap();
        let Transport::Tcp(forward_tcp) = forward.transport else {
            unreachable!()
        };
        assert_eq!(forward.ip.destination, IpAddr::from([10, 0, 0, 2]));
        assert_eq!(forward_tcp.sequence, 100);
        assert!(forward_tcp.is_reset());
        assert!(forward.payload().is_empty());
    }

    #[test]
    fn udp_reply_swaps_endpoints() {
        let query = test_frames::udp(
            IpAddr::from([10, 0, 0, 1]),
            IpAddr::from([8, 8, 8, 8]),
            (5353, 53),
            b"q",
        );
        let info = FrameInfo::parse(query.as_bytes()).unwrap();
        let Transport::Udp(udp) = info.transport else {
            unreachable!()
        };

        let reply = udp_reply(&info, &udp, b"answer").unwrap();
        let reply = FrameInfo::parse(reply.as_bytes()).unwrap();
        assert_eq!(reply.ip.source, IpAddr::from([8, 8, 8, 8]));
        assert_eq!(reply.ports(), Some((53, 5353)));
        assert_eq!(reply.payload(), b"answer");
    }
}
