//! ADNL UDP packet encoding and decoding.
//!
//! Every datagram starts with the 32-byte id of its destination, followed by an
//! encrypted `adnl.packetContents`:
//!
//! ## Plaintext packet (no channel yet, signed):
//! ```text
//! +----------------+------------------+------------------+------------------+
//! | Peer Key ID    | Ephemeral Pubkey | SHA256(content)  | Encrypted Content|
//! | 32 bytes       | 32 bytes         | 32 bytes         | Variable         |
//! +----------------+------------------+------------------+------------------+
//! ```
//!
//! ## Channel packet:
//! ```text
//! +----------------+------------------+------------------+
//! | Channel Key ID | SHA256(content)  | Encrypted Content|
//! | 32 bytes       | 32 bytes         | Variable         |
//! +----------------+------------------+------------------+
//! ```
//!
//! The content layout is selected by a flags word; fields appear in bit order,
//! bookended by two random paddings:
//!
//! ```text
//! rand1:bytes flags:#
//!   from:flags.0?PublicKey            from_short:flags.1?int256
//!   message:flags.2?adnl.Message      messages:flags.3?(vector adnl.Message)
//!   address:flags.4?adnl.addressList  priority_address:flags.5?adnl.addressList
//!   seqno:flags.6?long                confirm_seqno:flags.7?long
//!   recv_addr_list_version:flags.8?int
//!   recv_priority_addr_list_version:flags.9?int
//!   reinit_date:flags.10?int          dst_reinit_date:flags.10?int
//!   signature:flags.11?bytes          (flags.12: priority, no payload)
//! rand2:bytes
//! ```

use rand::Rng;
use ton_crypto::{PrivateKey, PublicKey, fill_random};

use crate::address::AdnlAddressList;
use crate::error::{AdnlError, Result};
use crate::id::{AdnlIdFull, AdnlIdShort};
use crate::tl::{ADNL_PACKET_CONTENTS, TlReader, TlWriter};

use super::AdnlMessage;

/// Datagram payload budget used when batching messages.
pub const ADNL_MTU: usize = 1440;

/// Worst-case size of a plaintext packet without its messages.
pub const PACKET_HEADER_MAX_SIZE: usize = 272;

/// Room for our address list within [`PACKET_HEADER_MAX_SIZE`]: six IPv4 or
/// three IPv6 addresses.
const ADDRESS_LIST_ALLOWANCE: usize = 92;

/// Worst-case size of a plaintext packet that carries `addr_list`, without
/// its messages.
pub(crate) fn plain_header_size(addr_list: &AdnlAddressList) -> usize {
    PACKET_HEADER_MAX_SIZE + addr_list.encoded_len().saturating_sub(ADDRESS_LIST_ALLOWANCE)
}

/// Worst-case size of a channel packet without its messages.
pub const CHANNEL_PACKET_HEADER_MAX_SIZE: usize = 128;

/// Flags for `adnl.packetContents` fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdnlPacketFlags(u32);

impl AdnlPacketFlags {
    /// `from` field is present (sender's public key).
    pub const FROM: u32 = 1 << 0;
    /// `from_short` field is present (sender's key ID).
    pub const FROM_SHORT: u32 = 1 << 1;
    /// `message` field is present (single message).
    pub const MESSAGE: u32 = 1 << 2;
    /// `messages` field is present (multiple messages).
    pub const MESSAGES: u32 = 1 << 3;
    pub const ADDRESS: u32 = 1 << 4;
    pub const PRIORITY_ADDRESS: u32 = 1 << 5;
    pub const SEQNO: u32 = 1 << 6;
    pub const CONFIRM_SEQNO: u32 = 1 << 7;
    pub const RECV_ADDR_LIST_VERSION: u32 = 1 << 8;
    pub const RECV_PRIORITY_ADDR_LIST_VERSION: u32 = 1 << 9;
    /// `reinit_date` and `dst_reinit_date` are both present.
    pub const REINIT_DATE: u32 = 1 << 10;
    pub const SIGNATURE: u32 = 1 << 11;
    /// Expedited handling, no payload.
    pub const PRIORITY: u32 = 1 << 12;
    /// Every defined bit.
    pub const ALL: u32 = 0x1FFF;

    pub fn new(flags: u32) -> Self {
        Self(flags)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn has(&self, flag: u32) -> bool {
        (self.0 & flag) != 0
    }

    pub fn set(&mut self, flag: u32) {
        self.0 |= flag;
    }

    /// Sets `flag` when `present` is true.
    fn set_if(&mut self, flag: u32, present: bool) {
        if present {
            self.set(flag);
        }
    }
}

/// Reinitialization epoch markers, always sent as a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReinitDates {
    /// When the sender last restarted.
    pub reinit_date: i32,
    /// The receiver's reinit date as known to the sender, 0 if unknown.
    pub dst_reinit_date: i32,
}

/// ADNL packet contents (`adnl.packetContents`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdnlPacket {
    /// Random padding at the start (7 or 15 bytes on send).
    pub rand1: Vec<u8>,
    pub from: Option<AdnlIdFull>,
    pub from_short: Option<AdnlIdShort>,
    /// Single message. Never set together with `messages`.
    pub message: Option<AdnlMessage>,
    pub messages: Option<Vec<AdnlMessage>>,
    pub address: Option<AdnlAddressList>,
    pub priority_address: Option<AdnlAddressList>,
    pub seqno: Option<u64>,
    /// Highest seqno the sender has received from us.
    pub confirm_seqno: Option<u64>,
    pub recv_addr_list_version: Option<i32>,
    pub recv_priority_addr_list_version: Option<i32>,
    pub reinit_dates: Option<ReinitDates>,
    pub signature: Option<Vec<u8>>,
    pub priority: bool,
    /// Random padding at the end (7 or 15 bytes on send).
    pub rand2: Vec<u8>,
}

impl Default for AdnlPacket {
    fn default() -> Self {
        Self::new()
    }
}

impl AdnlPacket {
    /// Creates an empty packet with fresh random padding.
    pub fn new() -> Self {
        Self {
            rand1: random_padding(),
            from: None,
            from_short: None,
            message: None,
            messages: None,
            address: None,
            priority_address: None,
            seqno: None,
            confirm_seqno: None,
            recv_addr_list_version: None,
            recv_priority_addr_list_version: None,
            reinit_dates: None,
            signature: None,
            priority: false,
            rand2: random_padding(),
        }
    }

    /// Stores `messages`, using the single-message field when there is exactly one.
    pub fn set_messages(&mut self, mut messages: Vec<AdnlMessage>) {
        self.message = None;
        self.messages = None;
        match messages.len() {
            0 => {}
            1 => self.message = messages.pop(),
            _ => self.messages = Some(messages),
        }
    }

    /// Takes every embedded message, in wire order.
    pub fn take_messages(&mut self) -> Vec<AdnlMessage> {
        match (self.message.take(), self.messages.take()) {
            (Some(message), _) => vec![message],
            (None, Some(messages)) => messages,
            (None, None) => Vec::new(),
        }
    }

    /// The sender's short id, from either `from` or `from_short`.
    pub fn sender_id(&self) -> Option<AdnlIdShort> {
        self.from
            .as_ref()
            .map(AdnlIdFull::short_id)
            .or(self.from_short)
    }

    /// Computes the flags word from the fields that are present.
    pub fn flags(&self) -> AdnlPacketFlags {
        let mut flags = AdnlPacketFlags::default();
        flags.set_if(AdnlPacketFlags::FROM, self.from.is_some());
        flags.set_if(AdnlPacketFlags::FROM_SHORT, self.from_short.is_some());
        flags.set_if(AdnlPacketFlags::MESSAGE, self.message.is_some());
        flags.set_if(AdnlPacketFlags::MESSAGES, self.messages.is_some());
        flags.set_if(AdnlPacketFlags::ADDRESS, self.address.is_some());
        flags.set_if(
            AdnlPacketFlags::PRIORITY_ADDRESS,
            self.priority_address.is_some(),
        );
        flags.set_if(AdnlPacketFlags::SEQNO, self.seqno.is_some());
        flags.set_if(AdnlPacketFlags::CONFIRM_SEQNO, self.confirm_seqno.is_some());
        flags.set_if(
            AdnlPacketFlags::RECV_ADDR_LIST_VERSION,
            self.recv_addr_list_version.is_some(),
        );
        flags.set_if(
            AdnlPacketFlags::RECV_PRIORITY_ADDR_LIST_VERSION,
            self.recv_priority_addr_list_version.is_some(),
        );
        flags.set_if(AdnlPacketFlags::REINIT_DATE, self.reinit_dates.is_some());
        flags.set_if(AdnlPacketFlags::SIGNATURE, self.signature.is_some());
        flags.set_if(AdnlPacketFlags::PRIORITY, self.priority);
        flags
    }

    /// Returns the packet with the signature removed: the signed form.
    pub fn to_sign(&self) -> Self {
        Self {
            signature: None,
            ..self.clone()
        }
    }

    /// Signs the packet with the sender's identity key.
    pub fn sign(&mut self, key: &PrivateKey) {
        let signature = key.sign(&self.to_sign().to_bytes());
        self.signature = Some(signature.to_vec());
    }

    /// Checks the signature against the sender's public key.
    pub fn verify(&self, key: &PublicKey) -> Result<()> {
        let signature = self
            .signature
            .as_deref()
            .ok_or_else(|| AdnlError::InvalidPacket("missing signature".into()))?;
        key.verify(&self.to_sign().to_bytes(), signature)?;
        Ok(())
    }

    /// Serializes the packet as a boxed `adnl.packetContents`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = TlWriter::with_capacity(ADNL_MTU);
        writer
            .write_u32(ADNL_PACKET_CONTENTS)
            .write_bytes(&self.rand1)
            .write_u32(self.flags().value());

        if let Some(from) = &self.from {
            from.write_tl(&mut writer);
        }
        if let Some(from_short) = &self.from_short {
            writer.write_int256(from_short.as_bytes());
        }
        if let Some(message) = &self.message {
            message.write_tl(&mut writer);
        }
        if let Some(messages) = &self.messages {
            writer.write_u32(messages.len() as u32);
            for message in messages {
                message.write_tl(&mut writer);
            }
        }
        if let Some(address) = &self.address {
            address.write_tl(&mut writer);
        }
        if let Some(address) = &self.priority_address {
            address.write_tl(&mut writer);
        }
        if let Some(seqno) = self.seqno {
            writer.write_u64(seqno);
        }
        if let Some(confirm_seqno) = self.confirm_seqno {
            writer.write_u64(confirm_seqno);
        }
        if let Some(version) = self.recv_addr_list_version {
            writer.write_i32(version);
        }
        if let Some(version) = self.recv_priority_addr_list_version {
            writer.write_i32(version);
        }
        if let Some(dates) = &self.reinit_dates {
            writer
                .write_i32(dates.reinit_date)
                .write_i32(dates.dst_reinit_date);
        }
        if let Some(signature) = &self.signature {
            writer.write_bytes(signature);
        }

        writer.write_bytes(&self.rand2);
        writer.finish()
    }

    /// Parses a boxed `adnl.packetContents`.
    ///
    /// Reserved flag bits, both message fields at once, or a `from_short`
    /// that disagrees with `from` make the packet malformed.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = TlReader::new(data);
        reader.expect_constructor(ADNL_PACKET_CONTENTS)?;

        let rand1 = reader.read_bytes()?;
        let flags = AdnlPacketFlags::new(reader.read_u32()?);
        if flags.value() & !AdnlPacketFlags::ALL != 0 {
            return Err(AdnlError::InvalidPacket(format!(
                "reserved flags 0x{:08x}",
                flags.value()
            )));
        }
        if flags.has(AdnlPacketFlags::MESSAGE) && flags.has(AdnlPacketFlags::MESSAGES) {
            return Err(AdnlError::InvalidPacket(
                "both message and messages present".into(),
            ));
        }

        let from = read_if(&mut reader, flags.has(AdnlPacketFlags::FROM), AdnlIdFull::read_tl)?;
        let from_short = read_if(&mut reader, flags.has(AdnlPacketFlags::FROM_SHORT), |r| {
            r.read_int256().map(AdnlIdShort::new)
        })?;
        if let (Some(from), Some(from_short)) = (&from, &from_short)
            && from.short_id() != *from_short
        {
            return Err(AdnlError::InvalidPacket("from/from_short mismatch".into()));
        }

        let message = read_if(&mut reader, flags.has(AdnlPacketFlags::MESSAGE), AdnlMessage::read_tl)?;
        let messages = read_if(&mut reader, flags.has(AdnlPacketFlags::MESSAGES), |r| {
            let count = r.read_vector_len()?;
            (0..count).map(|_| AdnlMessage::read_tl(r)).collect()
        })?;
        let address = read_if(&mut reader, flags.has(AdnlPacketFlags::ADDRESS), AdnlAddressList::read_tl)?;
        let priority_address = read_if(
            &mut reader,
            flags.has(AdnlPacketFlags::PRIORITY_ADDRESS),
            AdnlAddressList::read_tl,
        )?;
        let seqno = read_if(&mut reader, flags.has(AdnlPacketFlags::SEQNO), TlReader::read_u64)?;
        let confirm_seqno = read_if(
            &mut reader,
            flags.has(AdnlPacketFlags::CONFIRM_SEQNO),
            TlReader::read_u64,
        )?;
        let recv_addr_list_version = read_if(
            &mut reader,
            flags.has(AdnlPacketFlags::RECV_ADDR_LIST_VERSION),
            TlReader::read_i32,
        )?;
        let recv_priority_addr_list_version = read_if(
            &mut reader,
            flags.has(AdnlPacketFlags::RECV_PRIORITY_ADDR_LIST_VERSION),
            TlReader::read_i32,
        )?;
        let reinit_dates = read_if(&mut reader, flags.has(AdnlPacketFlags::REINIT_DATE), |r| {
            Ok(ReinitDates {
                reinit_date: r.read_i32()?,
                dst_reinit_date: r.read_i32()?,
            })
        })?;
        let signature = read_if(&mut reader, flags.has(AdnlPacketFlags::SIGNATURE), TlReader::read_bytes)?;

        let rand2 = reader.read_bytes()?;
        reader.expect_end()?;

        Ok(Self {
            rand1,
            from,
            from_short,
            message,
            messages,
            address,
            priority_address,
            seqno,
            confirm_seqno,
            recv_addr_list_version,
            recv_priority_addr_list_version,
            reinit_dates,
            signature,
            priority: flags.has(AdnlPacketFlags::PRIORITY),
            rand2,
        })
    }
}

fn read_if<'a, T>(
    reader: &mut TlReader<'a>,
    present: bool,
    read: impl FnOnce(&mut TlReader<'a>) -> Result<T>,
) -> Result<Option<T>> {
    if present { read(reader).map(Some) } else { Ok(None) }
}

/// 7 or 15 random bytes, chosen uniformly.
fn random_padding() -> Vec<u8> {
    let len = if rand::thread_rng().gen_bool(0.5) { 7 } else { 15 };
    let mut padding = vec![0u8; len];
    fill_random(&mut padding);
    padding
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv6Addr, SocketAddr};

    use crate::address::AdnlAddress;
    use proptest::collection::vec;
    use proptest::option;
    use proptest::prelude::*;

    /// A real `adnl.packetContents` carrying createChannel + query.
    const DOC_PACKET: &str = concat!(
        "89cd42d1",
        "0f4e0e7dd6d0c5646c204573bc47e567",
        "d90d0000",
        "c6b41348",
        "afc46336dd352049b366c7fd3fc1b143a518f0d02d9faef896cb0155488915d6",
        "02000000",
        "bbc373e6",
        "d59d8e3991be20b54dde8b78b3af18b379a62fa30e64af361c75452f6af019d7",
        "555c8763",
        "7af98bb4",
        "d7be82afbc80516ebca39784b8e2209886a69601251571444514b7f17fcd8875",
        "04ed4879a9000000",
        "00000000",
        "555c8763",
        "555c8763",
        "00000000",
        "00000000",
        "0100000000000000",
        "0000000000000000",
        "555c8763",
        "555c8763",
        "00000000",
        "40b453fbcbd8e884586b464290fe07475ee0da9df0b8d191e41e44f8f42a63a710",
        "341eefe8ffdc56de73db50a25989816dda17a4ac6c2f72f49804a97ff41df502",
        "000000",
        "0f2b6a8c0509f85da9f3c7e11c86ba22",
    );

    #[test]
    fn test_doc_packet_reencodes_bit_exact() {
        let bytes = hex::decode(DOC_PACKET).unwrap();
        let packet = AdnlPacket::from_bytes(&bytes).unwrap();

        assert_eq!(packet.flags().value(), 0x0dd9);
        assert!(packet.from.is_some());
        assert_eq!(packet.messages.as_ref().map(Vec::len), Some(2));
        assert!(matches!(
            packet.messages.as_ref().unwrap()[0],
            AdnlMessage::CreateChannel { date: 0x63875c55, .. }
        ));
        assert!(matches!(
            &packet.messages.as_ref().unwrap()[1],
            AdnlMessage::Query { query, .. } if query == &hex::decode("ed4879a9").unwrap()
        ));
        assert_eq!(packet.seqno, Some(1));
        assert_eq!(packet.confirm_seqno, Some(0));
        assert_eq!(packet.recv_addr_list_version, Some(0x63875c55));
        assert_eq!(packet.signature.as_ref().map(Vec::len), Some(64));
        assert_eq!(packet.rand1.len(), 15);
        assert_eq!(packet.rand2.len(), 15);

        assert_eq!(packet.to_bytes(), bytes);
    }

    fn full_header(addr_list: AdnlAddressList) -> AdnlPacket {
        let key = PrivateKey::generate();
        let mut packet = AdnlPacket::new();
        packet.rand1 = vec![0; 15];
        packet.rand2 = vec![0; 15];
        packet.from = Some(AdnlIdFull::new(key.public_key()));
        packet.messages = Some(Vec::new());
        packet.address = Some(addr_list);
        packet.seqno = Some(u64::MAX);
        packet.confirm_seqno = Some(u64::MAX);
        packet.recv_addr_list_version = Some(1);
        packet.recv_priority_addr_list_version = Some(1);
        packet.reinit_dates = Some(ReinitDates {
            reinit_date: 1,
            dst_reinit_date: 1,
        });
        packet.sign(&key);
        packet
    }

    #[test]
    fn test_header_size_accounts_for_address_list() {
        let mut small = AdnlAddressList::new(1, 1);
        for port in 0..6 {
            let addr = SocketAddr::from(([10, 0, 0, 1], port));
            small.addresses.push(AdnlAddress::from_socket_addr(addr));
        }
        assert_eq!(plain_header_size(&small), PACKET_HEADER_MAX_SIZE);
        assert_eq!(full_header(small).to_bytes().len(), PACKET_HEADER_MAX_SIZE);

        let mut large = AdnlAddressList::new(1, 1);
        for port in 0..6 {
            let addr = SocketAddr::from((Ipv6Addr::LOCALHOST, port));
            large.addresses.push(AdnlAddress::from_socket_addr(addr));
        }
        assert!(plain_header_size(&large) > PACKET_HEADER_MAX_SIZE);
        assert_eq!(full_header(large.clone()).to_bytes().len(), plain_header_size(&large));
    }

    #[test]
    fn test_single_message_uses_message_field() {
        let mut packet = AdnlPacket::new();
        packet.set_messages(vec![AdnlMessage::Nop]);
        assert!(packet.flags().has(AdnlPacketFlags::MESSAGE));
        assert!(!packet.flags().has(AdnlPacketFlags::MESSAGES));

        packet.set_messages(vec![AdnlMessage::Nop, AdnlMessage::Nop]);
        assert!(!packet.flags().has(AdnlPacketFlags::MESSAGE));
        assert!(packet.flags().has(AdnlPacketFlags::MESSAGES));

        assert_eq!(packet.take_messages().len(), 2);
        assert_eq!(packet.flags().value(), 0);
    }

    #[test]
    fn test_random_padding_lengths() {
        for _ in 0..32 {
            let packet = AdnlPacket::new();
            assert!(matches!(packet.rand1.len(), 7 | 15));
            assert!(matches!(packet.rand2.len(), 7 | 15));
        }
    }

    #[test]
    fn test_reserved_flags_rejected() {
        let mut packet = AdnlPacket::new();
        packet.rand1 = vec![0; 7];
        let mut bytes = packet.to_bytes();
        // constructor (4) + rand1 (8), then the flags word
        bytes[12 + 2] = 0x01;
        assert!(matches!(
            AdnlPacket::from_bytes(&bytes),
            Err(AdnlError::InvalidPacket(_))
        ));
    }

    #[test]
    fn test_both_message_fields_rejected() {
        let mut packet = AdnlPacket::new();
        packet.message = Some(AdnlMessage::Nop);
        packet.messages = Some(vec![AdnlMessage::Nop]);
        assert!(AdnlPacket::from_bytes(&packet.to_bytes()).is_err());
    }

    #[test]
    fn test_inconsistent_sender_rejected() {
        let mut packet = AdnlPacket::new();
        packet.from = Some(AdnlIdFull::new(PrivateKey::generate().public_key()));
        packet.from_short = Some(AdnlIdShort::new([1; 32]));
        assert!(AdnlPacket::from_bytes(&packet.to_bytes()).is_err());

        packet.from_short = packet.from.as_ref().map(AdnlIdFull::short_id);
        assert!(AdnlPacket::from_bytes(&packet.to_bytes()).is_ok());
    }

    #[test]
    fn test_truncated_packet_rejected() {
        let mut packet = AdnlPacket::new();
        packet.seqno = Some(5);
        let bytes = packet.to_bytes();
        assert!(AdnlPacket::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_sign_and_verify() {
        let key = PrivateKey::generate();
        let mut packet = AdnlPacket::new();
        packet.from = Some(AdnlIdFull::new(key.public_key()));
        packet.seqno = Some(1);
        packet.set_messages(vec![AdnlMessage::Custom { data: b"hi".to_vec() }]);

        let unsigned = packet.to_sign();
        packet.sign(&key);

        assert!(packet.flags().has(AdnlPacketFlags::SIGNATURE));
        assert!(!packet.to_sign().flags().has(AdnlPacketFlags::SIGNATURE));
        assert_eq!(packet.to_sign(), unsigned);
        assert!(packet.verify(&key.public_key()).is_ok());
        assert!(packet.verify(&PrivateKey::generate().public_key()).is_err());
    }

    #[test]
    fn test_verify_fails_after_any_bit_flip() {
        let key = PrivateKey::generate();
        let mut packet = AdnlPacket::new();
        packet.seqno = Some(9);
        packet.sign(&key);

        let signed_bytes = packet.to_sign().to_bytes();
        let signature = packet.signature.clone().unwrap();
        for bit in 0..signed_bytes.len() * 8 {
            let mut tampered = signed_bytes.clone();
            tampered[bit / 8] ^= 1 << (bit % 8);
            assert!(key.public_key().verify(&tampered, &signature).is_err());
        }
    }

    #[test]
    fn test_verify_requires_signature() {
        let key = PrivateKey::generate();
        assert!(AdnlPacket::new().verify(&key.public_key()).is_err());
    }

    fn arb_message() -> impl Strategy<Value = AdnlMessage> {
        prop_oneof![
            (any::<[u8; 32]>(), any::<i32>())
                .prop_map(|(key, date)| AdnlMessage::CreateChannel { key, date }),
            (any::<[u8; 32]>(), any::<[u8; 32]>(), any::<i32>()).prop_map(
                |(key, peer_key, date)| AdnlMessage::ConfirmChannel { key, peer_key, date }
            ),
            vec(any::<u8>(), 0..300).prop_map(|data| AdnlMessage::Custom { data }),
            Just(AdnlMessage::Nop),
            any::<i32>().prop_map(|date| AdnlMessage::Reinit { date }),
            (any::<[u8; 32]>(), vec(any::<u8>(), 0..64))
                .prop_map(|(query_id, query)| AdnlMessage::Query { query_id, query }),
            (any::<[u8; 32]>(), vec(any::<u8>(), 0..64))
                .prop_map(|(query_id, answer)| AdnlMessage::Answer { query_id, answer }),
            (any::<[u8; 32]>(), any::<i32>(), any::<i32>(), vec(any::<u8>(), 0..64)).prop_map(
                |(hash, total_size, offset, data)| AdnlMessage::Part {
                    hash,
                    total_size,
                    offset,
                    data
                }
            ),
        ]
    }

    fn arb_address_list() -> impl Strategy<Value = AdnlAddressList> {
        let address = prop_oneof![
            (any::<u32>(), any::<u16>()).prop_map(|(ip, port)| AdnlAddress::Udp { ip, port }),
            (any::<[u8; 16]>(), any::<u16>()).prop_map(|(ip, port)| AdnlAddress::Udp6 { ip, port }),
        ];
        (vec(address, 0..3), any::<[i32; 4]>()).prop_map(|(addresses, [version, reinit_date, priority, expire_at])| {
            AdnlAddressList {
                addresses,
                version,
                reinit_date,
                priority,
                expire_at,
            }
        })
    }

    fn arb_packet() -> impl Strategy<Value = AdnlPacket> {
        let sender = (0u8..4, any::<[u8; 32]>());
        let messages = (0u8..3, vec(arb_message(), 0..4));
        let addresses = (option::of(arb_address_list()), option::of(arb_address_list()));
        let seqnos = (option::of(any::<u64>()), option::of(any::<u64>()));
        let versions = (option::of(any::<i32>()), option::of(any::<i32>()));
        let tail = (
            option::of(any::<(i32, i32)>()),
            option::of(vec(any::<u8>(), 64)),
            any::<bool>(),
            vec(any::<u8>(), 0..20),
            vec(any::<u8>(), 0..20),
        );

        (sender, messages, addresses, seqnos, versions, tail).prop_map(
            |(sender, messages, addresses, seqnos, versions, tail)| {
                let id = AdnlIdFull::new(PublicKey::from_bytes(sender.1));
                let (from, from_short) = match sender.0 {
                    0 => (None, None),
                    1 => (Some(id), None),
                    2 => (None, Some(id.short_id())),
                    _ => (Some(id), Some(id.short_id())),
                };
                let (message, messages) = match messages.0 {
                    0 => (None, None),
                    1 => (messages.1.into_iter().next(), None),
                    _ => (None, Some(messages.1)),
                };
                let (reinit_dates, signature, priority, rand1, rand2) = tail;

                AdnlPacket {
                    rand1,
                    from,
                    from_short,
                    message,
                    messages,
                    address: addresses.0,
                    priority_address: addresses.1,
                    seqno: seqnos.0,
                    confirm_seqno: seqnos.1,
                    recv_addr_list_version: versions.0,
                    recv_priority_addr_list_version: versions.1,
                    reinit_dates: reinit_dates.map(|(reinit_date, dst_reinit_date)| ReinitDates {
                        reinit_date,
                        dst_reinit_date,
                    }),
                    signature,
                    priority,
                    rand2,
                }
            },
        )
    }

    proptest! {
        #[test]
        fn prop_packet_roundtrip(packet in arb_packet()) {
            let decoded = AdnlPacket::from_bytes(&packet.to_bytes()).unwrap();
            prop_assert_eq!(decoded, packet);
        }

        #[test]
        fn prop_to_sign_ignores_signature(packet in arb_packet()) {
            let key = PrivateKey::generate();
            let mut signed = packet.clone();
            signed.sign(&key);

            prop_assert_eq!(signed.to_sign(), packet.to_sign());
            prop_assert!(signed.verify(&key.public_key()).is_ok());
        }
    }
}
