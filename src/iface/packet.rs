use core::fmt;

use crate::wire::{Ipv4Packet, Result};

/// An owned packet buffer with an IPv4 datagram at a known offset.
///
/// The octets before the offset are headroom reserved for the link layer
/// header. The buffer is deliberately not `Clone`: it is owned by exactly one
/// party at a time and released when that party drops it, or moved on to the
/// next one (usually [LinkLayer::transmit](super::LinkLayer::transmit)).
pub struct PacketBuffer {
    data: Vec<u8>,
    ip_offset: usize,
}

impl PacketBuffer {
    /// Wrap a received frame whose IPv4 header starts at `ip_offset`.
    ///
    /// Returns `Err(Error)` if the offset lies beyond the end of the frame.
    /// The datagram itself is validated later, when the router parses it.
    pub fn new(data: Vec<u8>, ip_offset: usize) -> Result<PacketBuffer> {
        if ip_offset > data.len() {
            return Err(crate::wire::Error);
        }
        Ok(PacketBuffer { data, ip_offset })
    }

    /// Wrap a bare IPv4 datagram, without link layer headroom.
    pub fn from_ipv4(data: Vec<u8>) -> PacketBuffer {
        PacketBuffer { data, ip_offset: 0 }
    }

    /// Allocate a zeroed buffer for an outgoing datagram of `ip_len` octets.
    pub(crate) fn alloc(headroom: usize, ip_len: usize) -> PacketBuffer {
        PacketBuffer {
            data: vec![0; headroom + ip_len],
            ip_offset: headroom,
        }
    }

    /// Return the offset of the IPv4 header.
    pub fn ip_offset(&self) -> usize {
        self.ip_offset
    }

    /// Return the length of the whole buffer, headroom included.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Query whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Return the whole buffer, headroom included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Return the whole buffer, headroom included, for the link layer to fill
    /// in its header.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Return the octets from the IPv4 header to the end of the buffer.
    pub fn ip_bytes(&self) -> &[u8] {
        &self.data[self.ip_offset..]
    }

    /// Return the IPv4 datagram, trimmed to its total length field when that
    /// field fits the buffer.
    pub fn datagram(&self) -> &[u8] {
        let bytes = self.ip_bytes();
        match Ipv4Packet::new_checked(bytes) {
            Ok(packet) => &bytes[..packet.total_len() as usize],
            Err(_) => bytes,
        }
    }

    /// Return an IPv4 view of the buffer.
    ///
    /// The view is unchecked; see [Ipv4Packet::check_len].
    pub fn ipv4(&self) -> Ipv4Packet<&[u8]> {
        Ipv4Packet::new_unchecked(self.ip_bytes())
    }

    /// Return a mutable IPv4 view of the buffer.
    ///
    /// The view is unchecked; see [Ipv4Packet::check_len].
    pub fn ipv4_mut(&mut self) -> Ipv4Packet<&mut [u8]> {
        Ipv4Packet::new_unchecked(&mut self.data[self.ip_offset..])
    }

    /// Consume the packet, returning the underlying buffer.
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("len", &self.data.len())
            .field("ip_offset", &self.ip_offset)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wire::*;

    fn datagram() -> Vec<u8> {
        let repr = Ipv4Repr::new(
            Ipv4Address::new(10, 0, 0, 1),
            Ipv4Address::new(10, 0, 0, 2),
            IpProtocol::Udp,
            4,
        );
        let mut bytes = vec![0; repr.buffer_len() + repr.payload_len];
        repr.emit(&mut Ipv4Packet::new_unchecked(&mut bytes), 1);
        bytes
    }

    #[test]
    fn test_offset_beyond_end() {
        assert!(PacketBuffer::new(vec![0; 10], 11).is_err());
        assert!(PacketBuffer::new(vec![0; 10], 10).is_ok());
    }

    #[test]
    fn test_ipv4_view_skips_headroom() {
        let mut frame = vec![0xee; 14];
        frame.extend(datagram());
        let packet = PacketBuffer::new(frame, 14).unwrap();
        assert_eq!(packet.len(), 14 + 24);
        assert_eq!(packet.ip_offset(), 14);
        assert_eq!(packet.ipv4().dst_addr(), Ipv4Address::new(10, 0, 0, 2));
        assert_eq!(&packet.as_bytes()[..14], &[0xee; 14]);
    }

    #[test]
    fn test_datagram_trims_padding() {
        let mut bytes = datagram();
        bytes.extend([0; 6]);
        let packet = PacketBuffer::from_ipv4(bytes);
        assert_eq!(packet.ip_bytes().len(), 30);
        assert_eq!(packet.datagram().len(), 24);
    }

    #[test]
    fn test_mutation_through_view() {
        let mut packet = PacketBuffer::from_ipv4(datagram());
        packet.ipv4_mut().decrement_hop_limit();
        assert_eq!(packet.ipv4().hop_limit(), crate::config::DEFAULT_TTL - 1);
        assert!(packet.ipv4().verify_checksum());
    }

    #[test]
    fn test_alloc_reserves_headroom() {
        let packet = PacketBuffer::alloc(14, 28);
        assert_eq!(packet.len(), 42);
        assert_eq!(packet.ip_bytes().len(), 28);
    }
}
