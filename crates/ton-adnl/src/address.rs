//! Transport addresses and node descriptors.
//!
//! On the wire an address list inside a packet is written bare:
//!
//! ```text
//! addrs:(vector adnl.Address) version:int reinit_date:int priority:int expire_at:int
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{AdnlError, Result};
use crate::id::AdnlIdFull;
use crate::tl::{ADNL_ADDRESS_UDP, ADNL_ADDRESS_UDP6, TlReader, TlWriter};

/// A UDP transport address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdnlAddress {
    /// IPv4; `ip` holds the octets as a big-endian number.
    Udp { ip: u32, port: u16 },
    /// IPv6.
    Udp6 { ip: [u8; 16], port: u16 },
}

impl AdnlAddress {
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => Self::Udp {
                ip: u32::from(ip),
                port: addr.port(),
            },
            IpAddr::V6(ip) => Self::Udp6 {
                ip: ip.octets(),
                port: addr.port(),
            },
        }
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        match *self {
            Self::Udp { ip, port } => SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port),
            Self::Udp6 { ip, port } => SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port),
        }
    }

    /// Size of the boxed TL encoding.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Udp { .. } => 4 + 4 + 4,
            Self::Udp6 { .. } => 4 + 16 + 4,
        }
    }

    pub(crate) fn write_tl(&self, writer: &mut TlWriter) {
        match self {
            Self::Udp { ip, port } => {
                writer
                    .write_u32(ADNL_ADDRESS_UDP)
                    .write_i32(*ip as i32)
                    .write_i32(i32::from(*port));
            }
            Self::Udp6 { ip, port } => {
                writer
                    .write_u32(ADNL_ADDRESS_UDP6)
                    .write_int128(ip)
                    .write_i32(i32::from(*port));
            }
        }
    }

    pub(crate) fn read_tl(reader: &mut TlReader<'_>) -> Result<Self> {
        match reader.read_u32()? {
            ADNL_ADDRESS_UDP => {
                let ip = reader.read_i32()? as u32;
                let port = read_port(reader)?;
                Ok(Self::Udp { ip, port })
            }
            ADNL_ADDRESS_UDP6 => {
                let ip = reader.read_int128()?;
                let port = read_port(reader)?;
                Ok(Self::Udp6 { ip, port })
            }
            other => Err(AdnlError::UnexpectedConstructor(other)),
        }
    }
}

fn read_port(reader: &mut TlReader<'_>) -> Result<u16> {
    let port = reader.read_i32()?;
    u16::try_from(port).map_err(|_| AdnlError::InvalidAddress(format!("port {port}")))
}

impl From<SocketAddr> for AdnlAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::from_socket_addr(addr)
    }
}

/// An ordered list of addresses at which an identity is reachable.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdnlAddressList {
    pub addresses: Vec<AdnlAddress>,
    /// Bumped by the owner whenever the list changes.
    pub version: i32,
    /// Unix time of the owner's last reinitialization.
    pub reinit_date: i32,
    pub priority: i32,
    /// Zero means the list never expires.
    pub expire_at: i32,
}

impl AdnlAddressList {
    /// Creates an empty list.
    pub fn new(version: i32, reinit_date: i32) -> Self {
        Self {
            version,
            reinit_date,
            ..Default::default()
        }
    }

    /// Creates a list containing a single socket address.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self {
            addresses: vec![AdnlAddress::from_socket_addr(addr)],
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Returns the socket addresses in list order.
    pub fn socket_addrs(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.addresses.iter().map(AdnlAddress::to_socket_addr)
    }

    /// Whether `self` supersedes `other`: a later reinit date, or the same
    /// reinit date and a higher version.
    pub fn is_newer_than(&self, other: &Self) -> bool {
        (self.reinit_date, self.version) > (other.reinit_date, other.version)
    }

    /// Size of the bare TL encoding used inside packets.
    pub fn encoded_len(&self) -> usize {
        let addresses: usize = self.addresses.iter().map(AdnlAddress::encoded_len).sum();
        4 + addresses + 4 * 4
    }

    pub(crate) fn write_tl(&self, writer: &mut TlWriter) {
        writer.write_u32(self.addresses.len() as u32);
        for address in &self.addresses {
            address.write_tl(writer);
        }
        writer
            .write_i32(self.version)
            .write_i32(self.reinit_date)
            .write_i32(self.priority)
            .write_i32(self.expire_at);
    }

    pub(crate) fn read_tl(reader: &mut TlReader<'_>) -> Result<Self> {
        let count = reader.read_vector_len()?;
        let addresses = (0..count)
            .map(|_| AdnlAddress::read_tl(reader))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            addresses,
            version: reader.read_i32()?,
            reinit_date: reader.read_i32()?,
            priority: reader.read_i32()?,
            expire_at: reader.read_i32()?,
        })
    }
}

/// A reachable peer: its identity and where to find it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdnlNode {
    pub id: AdnlIdFull,
    pub addr_list: AdnlAddressList,
}

impl AdnlNode {
    pub fn new(id: AdnlIdFull, addr_list: AdnlAddressList) -> Self {
        Self { id, addr_list }
    }

    /// Creates a node reachable at a single socket address.
    pub fn with_socket_addr(id: AdnlIdFull, addr: SocketAddr) -> Self {
        Self::new(id, AdnlAddressList::from_socket_addr(addr))
    }

    /// Adopts `addr_list` if it is newer than the current one.
    ///
    /// Returns whether the list was replaced.
    pub fn update(&mut self, addr_list: AdnlAddressList) -> bool {
        if addr_list.is_newer_than(&self.addr_list) {
            self.addr_list = addr_list;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ton_crypto::PrivateKey;

    #[test]
    fn test_socket_addr_conversion() {
        let v4: SocketAddr = "192.168.1.20:30303".parse().unwrap();
        let address = AdnlAddress::from_socket_addr(v4);
        assert_eq!(
            address,
            AdnlAddress::Udp {
                ip: 0xC0A80114,
                port: 30303
            }
        );
        assert_eq!(address.to_socket_addr(), v4);

        let v6: SocketAddr = "[2001:db8::1]:4000".parse().unwrap();
        assert_eq!(AdnlAddress::from_socket_addr(v6).to_socket_addr(), v6);
    }

    #[test]
    fn test_udp_address_wire_format() {
        let address = AdnlAddress::from_socket_addr("1.2.3.4:258".parse().unwrap());
        let mut writer = TlWriter::default();
        address.write_tl(&mut writer);

        assert_eq!(hex::encode(writer.finish()), "e7a60d670403020102010000");
    }

    #[test]
    fn test_address_list_tl() {
        let mut list = AdnlAddressList::new(3, 1_700_000_000);
        list.addresses
            .push(AdnlAddress::from_socket_addr("10.0.0.1:1000".parse().unwrap()));
        list.addresses
            .push(AdnlAddress::from_socket_addr("[::1]:2000".parse().unwrap()));

        let mut writer = TlWriter::default();
        list.write_tl(&mut writer);
        let bytes = writer.finish();
        assert_eq!(bytes.len(), list.encoded_len());

        let mut reader = TlReader::new(&bytes);
        assert_eq!(AdnlAddressList::read_tl(&mut reader).unwrap(), list);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_invalid_port_rejected() {
        let mut writer = TlWriter::default();
        writer.write_u32(ADNL_ADDRESS_UDP).write_i32(0).write_i32(70_000);
        let bytes = writer.finish();

        assert!(matches!(
            AdnlAddress::read_tl(&mut TlReader::new(&bytes)),
            Err(AdnlError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_node_update_rules() {
        let id = AdnlIdFull::new(PrivateKey::generate().public_key());
        let mut node = AdnlNode::new(id, AdnlAddressList::new(5, 100));

        assert!(!node.update(AdnlAddressList::new(4, 100)));
        assert!(!node.update(AdnlAddressList::new(9, 99)));
        assert!(node.update(AdnlAddressList::new(6, 100)));
        assert!(node.update(AdnlAddressList::new(1, 101)));
        assert_eq!(node.addr_list, AdnlAddressList::new(1, 101));
    }
}
