/*! IPv4 and ICMPv4 on the wire.

Every protocol here comes in two shapes:

 * A `Packet` view ([Ipv4Packet], [Icmpv4Packet]) wraps a byte buffer and
   reads or writes individual fields in place. The forwarding path uses it to
   touch only the octets it has to, such as the time to live and checksum.
 * A `Repr` ([Ipv4Repr], [Icmpv4Repr]) holds the logical field values. It is
   what the router parses a received header into, and what it emits when it
   originates an echo reply or an ICMP error.

Buffers from the network are untrusted. Wrap them with `Packet::new_checked()`
(or call `Packet::check_len()`) before using any accessor; after that no
accessor panics, and neither does `Repr::parse()`. `Repr::emit()` needs a
buffer of at least `Repr::buffer_len()` octets plus the payload.

# Examples

To emit an IPv4 header into an octet buffer, and then parse it back:

```rust
use ipforward::wire::*;
let repr = Ipv4Repr::new(
    Ipv4Address::new(10, 0, 0, 1),
    Ipv4Address::new(10, 0, 0, 2),
    IpProtocol::Udp,
    10,
);
let mut buffer = vec![0; repr.buffer_len() + repr.payload_len];
{ // emission
    let mut packet = Ipv4Packet::new_unchecked(&mut buffer);
    repr.emit(&mut packet, 0x1234);
}
{ // parsing
    let packet = Ipv4Packet::new_checked(&buffer)
                            .expect("truncated packet");
    let parsed = Ipv4Repr::parse(&packet, true)
                          .expect("malformed packet");
    assert_eq!(repr, parsed);
}
```
*/

mod field {
    pub type Field = ::core::ops::Range<usize>;
}

mod icmpv4;
pub(crate) mod ip;
pub(crate) mod ipv4;

use core::fmt;

pub use self::ip::{checksum, Protocol as IpProtocol};

pub use self::ipv4::{
    checksum as ipv4_checksum, Address as Ipv4Address, Cidr as Ipv4Cidr, Packet as Ipv4Packet,
    Repr as Ipv4Repr, HEADER_LEN as IPV4_HEADER_LEN,
    MULTICAST_ALL_SPF_ROUTERS,
};

pub use self::icmpv4::{
    DstUnreachable as Icmpv4DstUnreachable, Message as Icmpv4Message, Packet as Icmpv4Packet,
    Repr as Icmpv4Repr, TimeExceeded as Icmpv4TimeExceeded, ERROR_QUOTE_LEN as ICMPV4_ERROR_QUOTE_LEN,
};

/// A packet was too short, inconsistent, failed its checksum, or used a
/// feature the router does not handle (IP options, unknown ICMP types).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Error;

#[cfg(feature = "std")]
impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "wire::Error")
    }
}

pub type Result<T> = core::result::Result<T, Error>;
