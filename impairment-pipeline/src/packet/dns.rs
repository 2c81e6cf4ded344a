//! DNS queries (RFC 1035) and forged answers

use std::net::IpAddr;

/// DNS server port
pub const DNS_PORT: u16 = 53;

/// DNS header size (fixed at 12 bytes)
pub const DNS_HEADER_SIZE: usize = 12;

const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;

const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_AUTHORITATIVE: u16 = 0x0400;
const FLAG_RECURSION_DESIRED: u16 = 0x0100;
const FLAG_RECURSION_AVAILABLE: u16 = 0x0080;

/// Pointer to the question name, which always starts right after the header
const NAME_POINTER: [u8; 2] = [0xc0, 0x0c];

pub const TYPE_A: u16 = 1;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_ANY: u16 = 255;
pub const CLASS_IN: u16 = 1;

/// A standard query with a single question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery<'a> {
    pub id: u16,
    flags: u16,
    /// Lowercase, without trailing dot
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
    question: &'a [u8],
}

impl<'a> DnsQuery<'a> {
    /// Parses a query message; responses, other opcodes and multi-question messages yield `None`
    pub fn parse(message: &'a [u8]) -> Option<Self> {
        if message.len() < DNS_HEADER_SIZE {
            return None;
        }

        let id = u16::from_be_bytes([message[0], message[1]]);
        let flags = u16::from_be_bytes([message[2], message[3]]);
        let opcode = (flags >> 11) & 0x0f;
        let question_count = u16::from_be_bytes([message[4], message[5]]);
        if flags & FLAG_RESPONSE != 0 || opcode != 0 || question_count != 1 {
            return None;
        }

        let (name, offset) = parse_name(message, DNS_HEADER_SIZE)?;
        if offset + 4 > message.len() {
            return None;
        }

        let qtype = u16::from_be_bytes([message[offset], message[offset + 1]]);
        let qclass = u16::from_be_bytes([message[offset + 2], message[offset + 3]]);

        Some(Self {
            id,
            flags,
            name,
            qtype,
            qclass,
            question: &message[DNS_HEADER_SIZE..offset + 4],
        })
    }

    /// Builds an authoritative answer carrying the addresses that fit the question's type
    pub fn answer(&self, addresses: &[IpAddr], ttl: u32) -> Vec<u8> {
        let records: Vec<&IpAddr> = addresses
            .iter()
            .filter(|address| match (self.qtype, address) {
                (TYPE_ANY, _) => true,
                (TYPE_A, IpAddr::V4(_)) => true,
                (TYPE_AAAA, IpAddr::V6(_)) => true,
                _ => false,
            })
            .filter(|_| self.qclass == CLASS_IN || self.qclass == TYPE_ANY)
            .collect();

        let flags = FLAG_RESPONSE
            | FLAG_AUTHORITATIVE
            | (self.flags & FLAG_RECURSION_DESIRED)
            | FLAG_RECURSION_AVAILABLE;

        let mut message = Vec::with_capacity(DNS_HEADER_SIZE + self.question.len() + records.len() * 28);
        message.extend_from_slice(&self.id.to_be_bytes());
        message.extend_from_slice(&flags.to_be_bytes());
        message.extend_from_slice(&1u16.to_be_bytes());
        message.extend_from_slice(&(records.len() as u16).to_be_bytes());
        message.extend_from_slice(&0u16.to_be_bytes());
        message.extend_from_slice(&0u16.to_be_bytes());
        message.extend_from_slice(self.question);

        for address in records {
            message.extend_from_slice(&NAME_POINTER);
            match address {
                IpAddr::V4(v4) => {
                    message.extend_from_slice(&TYPE_A.to_be_bytes());
                    message.extend_from_slice(&CLASS_IN.to_be_bytes());
                    message.extend_from_slice(&ttl.to_be_bytes());
                    message.extend_from_slice(&4u16.to_be_bytes());
                    message.extend_from_slice(&v4.octets());
                }
                IpAddr::V6(v6) => {
                    message.extend_from_slice(&TYPE_AAAA.to_be_bytes());
                    message.extend_from_slice(&CLASS_IN.to_be_bytes());
                    message.extend_from_slice(&ttl.to_be_bytes());
                    message.extend_from_slice(&16u16.to_be_bytes());
                    message.extend_from_slice(&v6.octets());
                }
            }
        }

        message
    }
}

/// Parses an uncompressed name, returning it and the offset right after it
fn parse_name(message: &[u8], mut offset: usize) -> Option<(String, usize)> {
    let mut name = String::new();
    loop {
        let len = usize::from(*message.get(offset)?);
        offset += 1;
        if len == 0 {
            break;
        }

        // Compression pointers never appear in a well-formed question
        if len > MAX_LABEL_LEN {
            return None;
        }

        let label = message.get(offset..offset + len)?;
        offset += len;

        if !name.is_empty() {
            name.push('.');
        }
        name.extend(label.iter().map(|&b| char::from(b.to_ascii_lowercase())));

        if name.len() > MAX_NAME_LEN {
            return None;
        }
    }

    Some((name, offset))
}

/// Whether `name` is `zone` itself or one of its subdomains; the empty zone matches everything
pub fn zone_matches(zone: &str, name: &str) -> bool {
    if zone.is_empty() || name == zone {
        return true;
    }

    name.len() > zone.len()
        && name.ends_with(zone)
        && name.as_bytes()[name.len() - zone.len() - 1] == b'.'
}
