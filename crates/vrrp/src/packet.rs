//! VRRP advertisement codec.
//!
//! RFC 5798 Section 5.1 - VRRP Packet Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Version| Type  | Virtual Rtr ID|   Priority    |Count IPvX Addr|
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |(rsvd) |     Max Adver Int     |          Checksum             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! +                                                               +
//! |                       IPvX Address(es)                        |
//! +                                                               +
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The checksum is computed over a 36-byte pseudo-header followed by the
//! message, per RFC 1071. IPv4 addresses enter the pseudo-header in their
//! IPv4-mapped 16-byte form so both families share one layout.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::{IpFamily, MAX_ADVERT_INTERVAL, VRRP_PROTOCOL, VRRP_VERSION};

/// VRRP packet type (always 1 = ADVERTISEMENT)
pub const VRRP_TYPE_ADVERTISEMENT: u8 = 1;

/// Fixed header length before the address list.
pub const VRRP_HEADER_LEN: usize = 8;

/// Structured decoding failure. The decoder never panics and never yields a
/// partially populated packet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("packet too short ({0} bytes)")]
    TooShort(usize),

    #[error("declared address count {count} exceeds the {len}-byte payload")]
    CountOverflow { count: u8, len: usize },

    #[error("unsupported VRRP version {0}")]
    BadVersion(u8),

    #[error("unexpected VRRP packet type {0}")]
    BadType(u8),
}

/// A VRRPv3 advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VRRPPacket {
    /// Virtual Router ID (1-255)
    pub vrid: u8,

    /// Priority (1-254 backup, 255 owner, 0 = master resigning)
    pub priority: u8,

    /// Maximum advertisement interval in centiseconds (12 bits on the wire)
    pub max_adv_interval: u16,

    /// Checksum over pseudo-header and message; zero until
    /// [`set_checksum`](Self::set_checksum) runs
    pub checksum: u16,

    /// Virtual IP addresses carried by the advertisement
    pub addresses: Vec<IpAddr>,
}

impl VRRPPacket {
    /// Create a new advertisement with a zero checksum.
    pub fn new(vrid: u8, priority: u8, max_adv_interval: u16, addresses: Vec<IpAddr>) -> Self {
        Self {
            vrid,
            priority,
            max_adv_interval,
            checksum: 0,
            addresses,
        }
    }

    /// Wire size of this packet: 8 bytes of header plus the address list in
    /// its natural width.
    pub fn packet_size(&self) -> usize {
        let body: usize = self
            .addresses
            .iter()
            .map(|ip| match ip {
                IpAddr::V4(_) => 4,
                IpAddr::V6(_) => 16,
            })
            .sum();
        VRRP_HEADER_LEN + body
    }

    /// Serialize to network byte order.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.packet_size());
        buf.put_u8((VRRP_VERSION << 4) | VRRP_TYPE_ADVERTISEMENT);
        buf.put_u8(self.vrid);
        buf.put_u8(self.priority);
        buf.put_u8(self.addresses.len() as u8);
        buf.put_u16(self.max_adv_interval & MAX_ADVERT_INTERVAL);
        buf.put_u16(self.checksum);
        for ip in &self.addresses {
            match ip {
                IpAddr::V4(addr) => buf.put_slice(&addr.octets()),
                IpAddr::V6(addr) => buf.put_slice(&addr.octets()),
            }
        }
        buf.freeze()
    }

    /// Parse an advertisement of the given family.
    ///
    /// Bytes past the declared address list are ignored; they are the
    /// authentication fields of legacy VRRPv2 traffic and are never
    /// interpreted.
    pub fn decode(family: IpFamily, data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < VRRP_HEADER_LEN {
            return Err(DecodeError::TooShort(data.len()));
        }

        let version = data[0] >> 4;
        if version != VRRP_VERSION {
            return Err(DecodeError::BadVersion(version));
        }
        let packet_type = data[0] & 0x0F;
        if packet_type != VRRP_TYPE_ADVERTISEMENT {
            return Err(DecodeError::BadType(packet_type));
        }

        let vrid = data[1];
        let priority = data[2];
        let count = data[3];
        let max_adv_interval = u16::from_be_bytes([data[4] & 0x0F, data[5]]);
        let checksum = u16::from_be_bytes([data[6], data[7]]);

        let width = family.addr_width();
        if VRRP_HEADER_LEN + usize::from(count) * width > data.len() {
            return Err(DecodeError::CountOverflow {
                count,
                len: data.len(),
            });
        }

        let mut addresses = Vec::with_capacity(usize::from(count));
        for index in 0..usize::from(count) {
            let offset = VRRP_HEADER_LEN + index * width;
            let addr = match family {
                IpFamily::V4 => {
                    let mut octets = [0u8; 4];
                    octets.copy_from_slice(&data[offset..offset + 4]);
                    IpAddr::V4(Ipv4Addr::from(octets))
                }
                IpFamily::V6 => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&data[offset..offset + 16]);
                    IpAddr::V6(Ipv6Addr::from(octets))
                }
            };
            addresses.push(addr);
        }

        Ok(Self {
            vrid,
            priority,
            max_adv_interval,
            checksum,
            addresses,
        })
    }

    /// Compute the RFC 1071 checksum over `pseudo_header || message` with
    /// the checksum field treated as zero.
    pub fn compute_checksum(&self, pshdr: &PseudoHeader) -> u16 {
        let mut message = self.to_bytes().to_vec();
        message[6] = 0;
        message[7] = 0;
        let sum = sum_words(&message, sum_words(&pshdr.to_bytes(), 0));
        !fold(sum)
    }

    /// Finalize the checksum field. This is the last field set before a
    /// packet goes on the wire.
    pub fn set_checksum(&mut self, pshdr: &PseudoHeader) {
        self.checksum = self.compute_checksum(pshdr);
    }

    /// Verify the carried checksum: the one's-complement sum over the
    /// pseudo-header and the message (checksum included) must fold to
    /// 0xFFFF, bit-for-bit the inverse of the sending computation.
    pub fn verify_checksum(&self, pshdr: &PseudoHeader) -> bool {
        let message = self.to_bytes();
        fold(sum_words(&message, sum_words(&pshdr.to_bytes(), 0))) == 0xFFFF
    }
}

/// The synthetic checksum prefix. Never transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PseudoHeader {
    /// Source IP of the carrying datagram
    pub src: IpAddr,

    /// Destination IP (normally the VRRP multicast group)
    pub dst: IpAddr,

    /// Length of the VRRP message in bytes
    pub len: u16,
}

impl PseudoHeader {
    pub fn new(src: IpAddr, dst: IpAddr, len: u16) -> Self {
        Self { src, dst, len }
    }

    /// 16-byte source, 16-byte destination, zero byte, protocol 112,
    /// 16-bit length. IPv4 addresses use their IPv4-mapped form.
    pub fn to_bytes(&self) -> [u8; 36] {
        let mut bytes = [0u8; 36];
        bytes[..16].copy_from_slice(&uniform_octets(self.src));
        bytes[16..32].copy_from_slice(&uniform_octets(self.dst));
        bytes[33] = VRRP_PROTOCOL;
        bytes[34..36].copy_from_slice(&self.len.to_be_bytes());
        bytes
    }
}

fn uniform_octets(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// One's-complement sum of big-endian 16-bit words, continuing from
/// `carry_in`. An odd trailing byte is padded with zero.
fn sum_words(data: &[u8], carry_in: u32) -> u32 {
    let mut sum = carry_in;
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    // S1 reference sample: vrid 240, priority 100, one address, 100 cs
    const SAMPLE: [u8; 12] = [
        0x31, 0xf0, 0x64, 0x01, 0x00, 0x64, 0x06, 0x08, 0xc0, 0xa8, 0x00, 0xe6,
    ];

    fn sample_pshdr() -> PseudoHeader {
        PseudoHeader::new(
            "192.168.0.220".parse().unwrap(),
            "224.0.0.18".parse().unwrap(),
            SAMPLE.len() as u16,
        )
    }

    #[test]
    fn canonical_v4_encode() {
        let mut packet = VRRPPacket::new(240, 100, 100, vec!["192.168.0.230".parse().unwrap()]);
        packet.set_checksum(&sample_pshdr());
        assert_eq!(packet.checksum, 0x0608);
        assert_eq!(&packet.to_bytes()[..], &SAMPLE[..]);
    }

    #[test]
    fn canonical_v4_decode() {
        let packet = VRRPPacket::decode(IpFamily::V4, &SAMPLE).unwrap();
        assert_eq!(packet.vrid, 240);
        assert_eq!(packet.priority, 100);
        assert_eq!(packet.max_adv_interval, 100);
        assert_eq!(packet.checksum, 0x0608);
        assert_eq!(
            packet.addresses,
            vec!["192.168.0.230".parse::<IpAddr>().unwrap()]
        );
        assert!(packet.verify_checksum(&sample_pshdr()));
    }

    #[test]
    fn corrupted_checksum_fails_verification() {
        let mut bytes = SAMPLE;
        bytes[9] ^= 0x01;
        let packet = VRRPPacket::decode(IpFamily::V4, &bytes).unwrap();
        assert!(!packet.verify_checksum(&sample_pshdr()));
    }

    #[test]
    fn roundtrip_preserves_every_field() {
        let src: IpAddr = "10.0.0.220".parse().unwrap();
        let dst: IpAddr = "224.0.0.18".parse().unwrap();
        for priority in [0u8, 1, 100, 254, 255] {
            for interval in [1u16, 100, MAX_ADVERT_INTERVAL] {
                let mut packet = VRRPPacket::new(
                    7,
                    priority,
                    interval,
                    vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()],
                );
                let pshdr = PseudoHeader::new(src, dst, packet.packet_size() as u16);
                packet.set_checksum(&pshdr);
                let decoded = VRRPPacket::decode(IpFamily::V4, &packet.to_bytes()).unwrap();
                assert_eq!(decoded, packet);
                assert!(decoded.verify_checksum(&pshdr));
            }
        }
    }

    #[test]
    fn v6_roundtrip() {
        let src: IpAddr = "fe80::1".parse().unwrap();
        let dst: IpAddr = "ff02::12".parse().unwrap();
        let mut packet = VRRPPacket::new(
            9,
            200,
            50,
            vec![
                "2001:db8::10".parse().unwrap(),
                "2001:db8::20".parse().unwrap(),
            ],
        );
        let pshdr = PseudoHeader::new(src, dst, packet.packet_size() as u16);
        packet.set_checksum(&pshdr);

        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), 8 + 2 * 16);

        let decoded = VRRPPacket::decode(IpFamily::V6, &bytes).unwrap();
        assert_eq!(decoded, packet);
        assert!(decoded.verify_checksum(&pshdr));
    }

    #[test]
    fn serialized_size_is_exact() {
        for count in 0..5usize {
            let v4: Vec<IpAddr> = (0..count)
                .map(|i| IpAddr::V4(Ipv4Addr::new(10, 0, 0, i as u8 + 1)))
                .collect();
            assert_eq!(
                VRRPPacket::new(1, 100, 100, v4).to_bytes().len(),
                8 + count * 4
            );

            let v6: Vec<IpAddr> = (0..count)
                .map(|i| IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, i as u16 + 1)))
                .collect();
            assert_eq!(
                VRRPPacket::new(1, 100, 100, v6).to_bytes().len(),
                8 + count * 16
            );
        }
    }

    #[test]
    fn interval_field_is_masked_to_12_bits() {
        let packet = VRRPPacket::new(1, 100, 0xFFFF, vec!["10.0.0.1".parse().unwrap()]);
        let bytes = packet.to_bytes();
        assert_eq!(bytes[4], 0x0F);
        assert_eq!(bytes[5], 0xFF);
        let decoded = VRRPPacket::decode(IpFamily::V4, &bytes).unwrap();
        assert_eq!(decoded.max_adv_interval, MAX_ADVERT_INTERVAL);
    }

    #[test]
    fn short_packet_rejected() {
        assert_eq!(
            VRRPPacket::decode(IpFamily::V4, &SAMPLE[..7]),
            Err(DecodeError::TooShort(7))
        );
        assert_eq!(
            VRRPPacket::decode(IpFamily::V4, &[]),
            Err(DecodeError::TooShort(0))
        );
    }

    #[test]
    fn count_overflow_rejected() {
        let mut bytes = SAMPLE.to_vec();
        bytes[3] = 4; // four addresses declared, one carried
        assert_eq!(
            VRRPPacket::decode(IpFamily::V4, &bytes),
            Err(DecodeError::CountOverflow { count: 4, len: 12 })
        );

        // the same payload read as IPv6 cannot carry even one address
        assert_eq!(
            VRRPPacket::decode(IpFamily::V6, &SAMPLE),
            Err(DecodeError::CountOverflow { count: 1, len: 12 })
        );
    }

    #[test]
    fn legacy_versions_rejected() {
        let mut bytes = SAMPLE;
        bytes[0] = (2 << 4) | 1;
        assert_eq!(
            VRRPPacket::decode(IpFamily::V4, &bytes),
            Err(DecodeError::BadVersion(2))
        );

        bytes[0] = (3 << 4) | 2;
        assert_eq!(
            VRRPPacket::decode(IpFamily::V4, &bytes),
            Err(DecodeError::BadType(2))
        );
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut bytes = SAMPLE.to_vec();
        bytes.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x00, 0x00, 0x00]);
        let packet = VRRPPacket::decode(IpFamily::V4, &bytes).unwrap();
        assert_eq!(packet.addresses.len(), 1);
    }

    #[test]
    fn odd_length_sum_pads_with_zero() {
        assert_eq!(sum_words(&[0x12, 0x34, 0x56], 0), 0x1234 + 0x5600);
        assert_eq!(fold(0x0001_FFFF), 0x0001);
    }

    #[test]
    fn pseudo_header_layout() {
        let pshdr = sample_pshdr();
        let bytes = pshdr.to_bytes();
        // IPv4-mapped source: ::ffff:192.168.0.220
        assert_eq!(&bytes[10..16], &[0xff, 0xff, 192, 168, 0, 220]);
        assert_eq!(&bytes[26..32], &[0xff, 0xff, 224, 0, 0, 18]);
        assert_eq!(bytes[32], 0);
        assert_eq!(bytes[33], 112);
        assert_eq!(&bytes[34..36], &[0, 12]);
    }
}
