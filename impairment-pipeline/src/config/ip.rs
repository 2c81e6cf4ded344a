use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CidrParseError {
    #[error("missing network prefix")]
    MissingPrefix,
    #[error("invalid ip address")]
    InvalidAddress,
    #[error("the network prefix is not a valid unsigned integer")]
    InvalidPrefix,
    #[error("network prefix cannot be higher than {max}")]
    PrefixTooLong { max: u8 },
}

/// An IP address together with its network prefix, e.g. `10.0.0.1/24`
///
/// The address is kept as written (host bits included); [`IpCidr::network`] yields the masked
/// network address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IpCidr {
    address: IpAddr,
    prefix: u8,
}

impl IpCidr {
    pub fn new(address: IpAddr, prefix: u8) -> Result<Self, CidrParseError> {
        let max = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };

        if prefix > max {
            return Err(CidrParseError::PrefixTooLong { max });
        }

        Ok(Self { address, prefix })
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    /// The address with all host bits cleared
    pub fn network(&self) -> IpAddr {
        match self.address {
            IpAddr::V4(address) => {
                IpAddr::V4(Ipv4Addr::from(u32::from(address) & v4_mask(self.prefix)))
            }
            IpAddr::V6(address) => {
                IpAddr::V6(Ipv6Addr::from(u128::from(address) & v6_mask(self.prefix)))
            }
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.address, ip) {
            (IpAddr::V4(network), IpAddr::V4(ip)) => {
                let mask = v4_mask(self.prefix);
                u32::from(network) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(network), IpAddr::V6(ip)) => {
                let mask = v6_mask(self.prefix);
                u128::from(network) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn v4_mask(prefix: u8) -> u32 {
    u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0)
}

fn v6_mask(prefix: u8) -> u128 {
    u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0)
}

impl FromStr for IpCidr {
    type Err = CidrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, prefix) = s.split_once('/').ok_or(CidrParseError::MissingPrefix)?;
        let address: IpAddr = address
            .parse()
            .map_err(|_| CidrParseError::InvalidAddress)?;
        let prefix: u8 = prefix.parse().map_err(|_| CidrParseError::InvalidPrefix)?;
        Self::new(address, prefix)
    }
}

impl Display for IpCidr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HardwareAddrParseError {
    #[error("expected 6 octets")]
    OctetCount,
    #[error("octet `{0}` is not two hexadecimal digits")]
    InvalidOctet(String),
}

/// An Ethernet MAC address
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HardwareAddr(pub [u8; 6]);

impl FromStr for HardwareAddr {
    type Err = HardwareAddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let separator = if s.contains(':') { ':' } else { '-' };
        let octets: Vec<&str> = s.split(separator).collect();
        if octets.len() != 6 {
            return Err(HardwareAddrParseError::OctetCount);
        }

        let mut bytes = [0; 6];
        for (byte, octet) in bytes.iter_mut().zip(octets) {
            if octet.len() != 2 || !octet.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(HardwareAddrParseError::InvalidOctet(octet.to_string()));
            }

            *byte = u8::from_str_radix(octet, 16)
                .map_err(|_| HardwareAddrParseError::InvalidOctet(octet.to_string()))?;
        }

        Ok(Self(bytes))
    }
}

impl Display for HardwareAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_canonical_network() {
        let cidr: IpCidr = "10.0.0.0/24".parse().unwrap();
        assert_eq!(cidr.network(), IpAddr::from([10, 0, 0, 0]));
        assert_eq!(cidr.prefix(), 24);
        assert_eq!(cidr.to_string(), "10.0.0.0/24");
    }

    #[test]
    fn host_bits_are_kept_and_masked_separately() {
        let cidr: IpCidr = "10.0.0.1/24".parse().unwrap();
        assert_eq!(cidr.address(), IpAddr::from([10, 0, 0, 1]));
        assert_eq!(cidr.network(), IpAddr::from([10, 0, 0, 0]));
    }

    #[test]
    fn prefix_is_required() {
        assert_eq!(
            "10.0.0.0".parse::<IpCidr>(),
            Err(CidrParseError::MissingPrefix)
        );
    }

    #[test]
    fn rejects_malformed_cidrs() {
        assert_eq!(
            "10.0.0/24".parse::<IpCidr>(),
            Err(CidrParseError::InvalidAddress)
        );
        assert_eq!(
            "10.0.0.0/abc".parse::<IpCidr>(),
            Err(CidrParseError::InvalidPrefix)
        );
        assert_eq!(
            "10.0.0.0/33".parse::<IpCidr>(),
            Err(CidrParseError::PrefixTooLong { max: 32 })
        );
        assert_eq!(
            "fd00::/129".parse::<IpCidr>(),
            Err(CidrParseError::PrefixTooLong { max: 128 })
        );
    }

    #[test]
    fn contains_respects_prefix_and_family() {
        let cidr: IpCidr = "192.168.1.0/24".parse().unwrap();
        assert!(cidr.contains(IpAddr::from([192, 168, 1, 200])));
        assert!(!cidr.contains(IpAddr::from([192, 168, 2, 1])));
        assert!(!cidr.contains("::1".parse().unwrap()));

        let everything: IpCidr = "0.0.0.0/0".parse().unwrap();
        assert!(everything.contains(IpAddr::from([8, 8, 8, 8])));

        let v6: IpCidr = "fd00:1::/32".parse().unwrap();
        assert!(v6.contains("fd00:1:ffff::1".parse().unwrap()));
        assert!(!v6.contains("fd00:2::1".parse().unwrap()));
    }

    #[test]
    fn parse_hardware_addr() {
        let expected = HardwareAddr([0x02, 0x42, 0xac, 0x11, 0x00, 0x02]);
        assert_eq!("02:42:ac:11:00:02".parse(), Ok(expected));
        assert_eq!("02-42-AC-11-00-02".parse(), Ok(expected));
        assert_eq!(expected.to_string(), "02:42:ac:11:00:02");
    }

    #[test]
    fn rejects_malformed_hardware_addr() {
        assert_eq!(
            "02:42:ac:11:00".parse::<HardwareAddr>(),
            Err(HardwareAddrParseError::OctetCount)
        );
        assert_eq!(
            "02:42:ac:11:00:zz".parse::<HardwareAddr>(),
            Err(HardwareAddrParseError::InvalidOctet("zz".to_string()))
        );
        assert_eq!(
            "02:42:ac:11:00:002".parse::<HardwareAddr>(),
            Err(HardwareAddrParseError::InvalidOctet("002".to_string()))
        );
    }
}
