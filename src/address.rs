use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Hostname(String),
}

impl Address {
    pub fn from(s: &str) -> std::io::Result<Self> {
        if s.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Empty address",
            ));
        }

        let mut dots = 0;
        let mut possible_ipv4 = true;
        let mut possible_ipv6 = true;
        let mut possible_hostname = true;
        for b in s.as_bytes().iter() {
            let c = *b;
            if c == b':' {
                possible_ipv4 = false;
                possible_hostname = false;
                break;
            } else if c == b'.' {
                possible_ipv6 = false;
                dots += 1;
                if dots > 3 {
                    // can only be a hostname.
                    break;
                }
            } else if (c >= b'A' && c <= b'F') || (c >= b'a' && c <= b'f') {
                possible_ipv4 = false;
            } else if c < b'0' || c > b'9' {
                possible_ipv4 = false;
                possible_ipv6 = false;
                break;
            }
        }

        if possible_ipv4 && dots == 3 {
            if let Ok(addr) = s.parse::<Ipv4Addr>() {
                return Ok(Address::Ipv4(addr));
            }
        }

        if possible_ipv6 {
            if let Ok(addr) = s.parse::<Ipv6Addr>() {
                return Ok(Address::Ipv6(addr));
            }
        }

        if possible_hostname {
            return Ok(Address::Hostname(s.to_string()));
        }

        Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to parse address: {}", s),
        ))
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, Address::Ipv6(_))
    }

    pub fn hostname(&self) -> Option<&str> {
        match self {
            Address::Hostname(ref hostname) => Some(hostname),
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(addr) => addr.fmt(f),
            Address::Ipv6(addr) => addr.fmt(f),
            Address::Hostname(hostname) => hostname.fmt(f),
        }
    }
}

/// A "host:port" authority: the address may be a hostname that still needs
/// resolution.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct NetLocation {
    address: Address,
    port: u16,
}

impl NetLocation {
    pub fn new(address: Address, port: u16) -> Self {
        Self { address, port }
    }

    pub fn from_str(s: &str, default_port: Option<u16>) -> std::io::Result<Self> {
        // Allow bracketed IPv6 authorities ("[::1]:443").
        if let Some(stripped) = s.strip_prefix('[') {
            let (address_str, rest) = stripped.split_once(']').ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Unterminated ipv6 authority: {}", s),
                )
            })?;
            let port = match rest.strip_prefix(':') {
                Some(port_str) => port_str.parse::<u16>().map_err(|e| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("Failed to parse port: {}", e),
                    )
                })?,
                None => default_port.ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "No port")
                })?,
            };
            let address = Address::from(address_str)?;
            if !address.is_ipv6() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Invalid bracketed address: {}", s),
                ));
            }
            return Ok(Self { address, port });
        }

        let (address_str, port, expect_ipv6) = match s.rfind(':') {
            Some(i) => {
                // The ':' could be from an unbracketed ipv6 address.
                match s[i + 1..].parse::<u16>() {
                    Ok(port) => {
                        if s[..i].contains(':') {
                            (s, default_port, true)
                        } else {
                            (&s[0..i], Some(port), false)
                        }
                    }
                    Err(_) => (s, default_port, true),
                }
            }
            None => (s, default_port, false),
        };

        let address = Address::from(address_str)?;
        if expect_ipv6 && !address.is_ipv6() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Invalid location: {}", s),
            ));
        }

        let port =
            port.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "No port"))?;

        Ok(Self { address, port })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn components(&self) -> (&Address, u16) {
        (&self.address, self.port)
    }

    pub fn to_socket_addr(&self) -> std::io::Result<SocketAddr> {
        match self.address {
            Address::Ipv4(ref addr) => Ok(SocketAddr::new(IpAddr::V4(*addr), self.port)),
            Address::Ipv6(ref addr) => Ok(SocketAddr::new(IpAddr::V6(*addr), self.port)),
            Address::Hostname(ref d) => format!("{}:{}", d, self.port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::NotFound, "Lookup failed")
                }),
        }
    }
}

impl fmt::Display for NetLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Address::Ipv6(ref addr) => write!(f, "[{}]:{}", addr, self.port),
            _ => write!(f, "{}:{}", self.address, self.port),
        }
    }
}

/// A parsed CIDR range. IPv4 addresses are compared in their v6-mapped form
/// so a single list can hold both families.
#[derive(Debug, Clone)]
pub struct AddressMask {
    network: u128,
    prefix: u8,
}

impl AddressMask {
    pub fn from(s: &str) -> std::io::Result<Self> {
        let (address_str, wanted_bits) = match s.rfind('/') {
            Some(i) => {
                let bits = s[i + 1..].parse::<u8>().map_err(|e| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("Failed to parse netmask: {}", e),
                    )
                })?;
                (&s[0..i], Some(bits))
            }
            None => (s, None),
        };

        let ip = address_str.parse::<IpAddr>().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Failed to parse CIDR address {}: {}", s, e),
            )
        })?;

        let (max_bits, offset) = match ip {
            IpAddr::V4(_) => (32u8, 96u8),
            IpAddr::V6(_) => (128u8, 0u8),
        };
        let wanted_bits = wanted_bits.unwrap_or(max_bits);
        if wanted_bits > max_bits {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Invalid netmask: {}", s),
            ));
        }

        let prefix = offset + wanted_bits;
        Ok(Self {
            network: mask_bits(to_u128(ip), prefix),
            prefix,
        })
    }

    pub fn matches(&self, ip: IpAddr) -> bool {
        mask_bits(to_u128(ip), self.prefix) == self.network
    }
}

fn to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(addr) => u128::from(addr.to_ipv6_mapped()),
        IpAddr::V6(addr) => u128::from(addr),
    }
}

fn mask_bits(value: u128, prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        value & (u128::MAX << (128 - prefix as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addresses() {
        assert_eq!(
            Address::from("1.2.3.4").unwrap(),
            Address::Ipv4(Ipv4Addr::new(1, 2, 3, 4))
        );
        assert_eq!(
            Address::from("::1").unwrap(),
            Address::Ipv6(Ipv6Addr::LOCALHOST)
        );
        assert_eq!(
            Address::from("example.com").unwrap(),
            Address::Hostname("example.com".to_string())
        );
        // Four dots can only be a hostname.
        assert!(matches!(
            Address::from("1.2.3.4.5").unwrap(),
            Address::Hostname(_)
        ));
        assert!(Address::from("").is_err());
    }

    #[test]
    fn test_parse_locations() {
        let loc = NetLocation::from_str("example.com:443", None).unwrap();
        assert_eq!(loc.port(), 443);
        assert_eq!(loc.to_string(), "example.com:443");

        let loc = NetLocation::from_str("[::1]:53", None).unwrap();
        assert_eq!(loc.port(), 53);
        assert_eq!(loc.to_string(), "[::1]:53");

        let loc = NetLocation::from_str("example.com", Some(80)).unwrap();
        assert_eq!(loc.port(), 80);

        assert!(NetLocation::from_str("example.com", None).is_err());
        assert!(NetLocation::from_str("[::1", None).is_err());
    }

    #[test]
    fn test_address_mask() {
        let mask = AddressMask::from("10.0.0.0/8").unwrap();
        assert!(mask.matches("10.1.2.3".parse().unwrap()));
        assert!(!mask.matches("11.1.2.3".parse().unwrap()));
        assert!(!mask.matches("::1".parse().unwrap()));

        let all4 = AddressMask::from("0.0.0.0/0").unwrap();
        assert!(all4.matches("203.0.113.9".parse().unwrap()));
        assert!(!all4.matches("2001:db8::1".parse().unwrap()));

        let all6 = AddressMask::from("::/0").unwrap();
        assert!(all6.matches("2001:db8::1".parse().unwrap()));
        // v4 addresses live inside ::ffff:0:0/96, which ::/0 also covers.
        assert!(all6.matches("203.0.113.9".parse().unwrap()));

        let single = AddressMask::from("192.0.2.7").unwrap();
        assert!(single.matches("192.0.2.7".parse().unwrap()));
        assert!(!single.matches("192.0.2.8".parse().unwrap()));

        assert!(AddressMask::from("10.0.0.0/33").is_err());
        assert!(AddressMask::from("not-an-ip/8").is_err());
    }
}
