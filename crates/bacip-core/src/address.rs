//! BACnet addressing.
//!
//! An [`Address`] names the destination or source of a PDU at any layer of
//! the stack. Station addresses carry a MAC of one to six octets; for
//! BACnet/IP the MAC is the packed four-octet IPv4 address followed by the
//! big-endian UDP port. Network numbers are valid in `1..=65534`; 65535 is
//! the wire encoding of the global broadcast and never appears in an
//! `Address` value.

use core::fmt;
use core::str::FromStr;

/// Default BACnet/IP UDP port (0xBAC0).
pub const BACNET_IP_PORT: u16 = 47808;

/// Highest network number assignable to a real network.
pub const MAX_NETWORK: u16 = 65534;

/// An IPv4 endpoint in the packed form BACnet/IP uses on the wire, kept
/// alongside nothing: the host-endian view is produced on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IpPort {
    pub octets: [u8; 4],
    pub port: u16,
}

impl IpPort {
    pub const fn new(octets: [u8; 4], port: u16) -> Self {
        Self { octets, port }
    }

    /// The six-octet wire form: four address octets then the port.
    pub fn to_wire(self) -> [u8; 6] {
        let mut out = [0u8; 6];
        out[..4].copy_from_slice(&self.octets);
        out[4..].copy_from_slice(&self.port.to_be_bytes());
        out
    }

    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 6 {
            return None;
        }
        Some(Self {
            octets: [bytes[0], bytes[1], bytes[2], bytes[3]],
            port: u16::from_be_bytes([bytes[4], bytes[5]]),
        })
    }
}

#[cfg(feature = "std")]
impl From<std::net::SocketAddrV4> for IpPort {
    fn from(addr: std::net::SocketAddrV4) -> Self {
        Self {
            octets: addr.ip().octets(),
            port: addr.port(),
        }
    }
}

#[cfg(feature = "std")]
impl From<IpPort> for std::net::SocketAddrV4 {
    fn from(addr: IpPort) -> Self {
        std::net::SocketAddrV4::new(addr.octets.into(), addr.port)
    }
}

impl fmt::Display for IpPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.octets;
        write!(f, "{a}.{b}.{c}.{d}:{}", self.port)
    }
}

/// A station MAC address, one to six octets.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Mac {
    bytes: [u8; 6],
    len: u8,
}

impl Mac {
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.is_empty() || slice.len() > 6 {
            return None;
        }
        let mut bytes = [0u8; 6];
        bytes[..slice.len()].copy_from_slice(slice);
        Some(Self {
            bytes,
            len: slice.len() as u8,
        })
    }

    pub const fn from_octet(octet: u8) -> Self {
        Self {
            bytes: [octet, 0, 0, 0, 0, 0],
            len: 1,
        }
    }

    pub fn from_ip(ip: IpPort) -> Self {
        Self {
            bytes: ip.to_wire(),
            len: 6,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub const fn len(&self) -> usize {
        self.len as usize
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Interpret a six-octet MAC as a BACnet/IP endpoint.
    pub fn to_ip(&self) -> Option<IpPort> {
        if self.len == 6 {
            IpPort::from_wire(self.as_bytes())
        } else {
            None
        }
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mac(")?;
        fmt_mac(f, self)?;
        write!(f, ")")
    }
}

fn fmt_mac(f: &mut fmt::Formatter<'_>, mac: &Mac) -> fmt::Result {
    if let Some(ip) = mac.to_ip() {
        write!(f, "{ip}")
    } else if mac.len() == 1 {
        write!(f, "{}", mac.as_bytes()[0])
    } else {
        write!(f, "0x")?;
        for b in mac.as_bytes() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// A BACnet address at any scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Address {
    Null,
    LocalBroadcast,
    LocalStation(Mac),
    RemoteBroadcast(u16),
    RemoteStation(u16, Mac),
    GlobalBroadcast,
}

impl Address {
    pub fn local_ip(ip: IpPort) -> Self {
        Self::LocalStation(Mac::from_ip(ip))
    }

    pub const fn network(&self) -> Option<u16> {
        match self {
            Self::RemoteBroadcast(net) | Self::RemoteStation(net, _) => Some(*net),
            _ => None,
        }
    }

    pub const fn mac(&self) -> Option<&Mac> {
        match self {
            Self::LocalStation(mac) | Self::RemoteStation(_, mac) => Some(mac),
            _ => None,
        }
    }

    pub const fn is_broadcast(&self) -> bool {
        matches!(
            self,
            Self::LocalBroadcast | Self::RemoteBroadcast(_) | Self::GlobalBroadcast
        )
    }

    pub const fn is_station(&self) -> bool {
        matches!(self, Self::LocalStation(_) | Self::RemoteStation(_, _))
    }
}

/// Validate a network number read off the wire or from configuration.
pub const fn valid_network(net: u16) -> bool {
    net >= 1 && net <= MAX_NETWORK
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::LocalBroadcast => f.write_str("*"),
            Self::LocalStation(mac) => fmt_mac(f, mac),
            Self::RemoteBroadcast(net) => write!(f, "{net}:*"),
            Self::RemoteStation(net, mac) => {
                write!(f, "{net}:")?;
                fmt_mac(f, mac)
            }
            Self::GlobalBroadcast => f.write_str("*:*"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressParseError {
    Empty,
    BadNetwork,
    BadMac,
}

impl fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("empty address"),
            Self::BadNetwork => f.write_str("network number out of range"),
            Self::BadMac => f.write_str("unrecognized station address"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AddressParseError {}

impl FromStr for Address {
    type Err = AddressParseError;

    /// Accepted forms: `null`, `*`, `*:*`, a station (`1.2.3.4`,
    /// `1.2.3.4:47809`, a decimal octet, or `0x`-prefixed hex), `net:*`, and
    /// `net:<station>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => return Err(AddressParseError::Empty),
            "null" => return Ok(Self::Null),
            "*" => return Ok(Self::LocalBroadcast),
            "*:*" => return Ok(Self::GlobalBroadcast),
            _ => {}
        }

        // A leading decimal field followed by ':' is a network number unless
        // the whole string parses as ip:port.
        if let Some((net_part, rest)) = s.split_once(':') {
            if !net_part.contains('.') {
                if let Ok(net) = net_part.parse::<u16>() {
                    if !valid_network(net) {
                        return Err(AddressParseError::BadNetwork);
                    }
                    if rest == "*" {
                        return Ok(Self::RemoteBroadcast(net));
                    }
                    let mac = parse_mac(rest)?;
                    return Ok(Self::RemoteStation(net, mac));
                }
            }
        }

        Ok(Self::LocalStation(parse_mac(s)?))
    }
}

fn parse_mac(s: &str) -> Result<Mac, AddressParseError> {
    if s.is_empty() {
        return Err(AddressParseError::BadMac);
    }

    if let Some(hex) = s.strip_prefix("0x") {
        if hex.is_empty() || hex.len() % 2 != 0 || hex.len() > 12 {
            return Err(AddressParseError::BadMac);
        }
        let mut bytes = [0u8; 6];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let pair = core::str::from_utf8(chunk).map_err(|_| AddressParseError::BadMac)?;
            bytes[i] = u8::from_str_radix(pair, 16).map_err(|_| AddressParseError::BadMac)?;
        }
        return Mac::from_slice(&bytes[..hex.len() / 2]).ok_or(AddressParseError::BadMac);
    }

    if s.contains('.') {
        let (ip_part, port) = match s.rsplit_once(':') {
            Some((ip, port)) => (
                ip,
                port.parse::<u16>().map_err(|_| AddressParseError::BadMac)?,
            ),
            None => (s, BACNET_IP_PORT),
        };
        let mut octets = [0u8; 4];
        let mut fields = ip_part.split('.');
        for octet in octets.iter_mut() {
            *octet = fields
                .next()
                .and_then(|f| f.parse::<u8>().ok())
                .ok_or(AddressParseError::BadMac)?;
        }
        if fields.next().is_some() {
            return Err(AddressParseError::BadMac);
        }
        return Ok(Mac::from_ip(IpPort::new(octets, port)));
    }

    let octet = s.parse::<u8>().map_err(|_| AddressParseError::BadMac)?;
    Ok(Mac::from_octet(octet))
}

#[cfg(test)]
mod tests {
    use super::{Address, IpPort, Mac, BACNET_IP_PORT};
    use core::str::FromStr;

    #[test]
    fn parses_broadcast_forms() {
        assert_eq!(Address::from_str("*").unwrap(), Address::LocalBroadcast);
        assert_eq!(Address::from_str("*:*").unwrap(), Address::GlobalBroadcast);
        assert_eq!(
            Address::from_str("12:*").unwrap(),
            Address::RemoteBroadcast(12)
        );
    }

    #[test]
    fn parses_ip_station_with_default_port() {
        let addr = Address::from_str("192.168.0.10").unwrap();
        let mac = addr.mac().unwrap();
        assert_eq!(
            mac.to_ip().unwrap(),
            IpPort::new([192, 168, 0, 10], BACNET_IP_PORT)
        );
    }

    #[test]
    fn parses_remote_station_with_port() {
        let addr = Address::from_str("99:10.0.0.2:47809").unwrap();
        assert_eq!(addr.network(), Some(99));
        assert_eq!(
            addr.mac().unwrap().to_ip().unwrap(),
            IpPort::new([10, 0, 0, 2], 47809)
        );
    }

    #[test]
    fn rejects_reserved_networks() {
        assert!(Address::from_str("0:4").is_err());
        assert!(Address::from_str("65535:4").is_err());
    }

    #[test]
    fn display_reparse_is_stable() {
        for s in [
            "null",
            "*",
            "*:*",
            "7",
            "0x0203ff",
            "172.16.9.1:47810",
            "2000:*",
            "2000:44",
            "901:10.1.2.3:47808",
        ] {
            let parsed = Address::from_str(s).unwrap();
            let redisplayed = alloc::format!("{parsed}");
            assert_eq!(Address::from_str(&redisplayed).unwrap(), parsed);
        }
    }

    #[test]
    fn mac_wire_roundtrip() {
        let ip = IpPort::new([10, 20, 30, 40], 47808);
        let mac = Mac::from_ip(ip);
        assert_eq!(mac.len(), 6);
        assert_eq!(mac.to_ip().unwrap(), ip);
        assert_eq!(IpPort::from_wire(mac.as_bytes()).unwrap(), ip);
    }
}
