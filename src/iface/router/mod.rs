// Heads up! Before working on this file you should read the parts of
// RFC 1812 section 5.2 that deal with forwarding, and section 4.3.2 on
// which ICMP errors a router is allowed to send.


use core::fmt;
use core::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use heapless::Vec;

use super::{ControlPlane, Interface, LinkLayer, PacketBuffer, Routes};
use crate::config::{IFACE_MAX_COUNT, LINK_HEADER_LEN};
use crate::rand::Rand;
use crate::wire::*;

macro_rules! check {
    ($e:expr) => {
        match $e {
            Ok(x) => x,
            Err(_) => {
                // concat!/stringify! doesn't work with defmt macros
                #[cfg(not(feature = "defmt"))]
                net_debug!(concat!("router: malformed ", stringify!($e)));
                #[cfg(feature = "defmt")]
                net_debug!("router: malformed packet");
                return Disposition::Malformed;
            }
        }
    };
}

/// Configuration structure used for creating a router.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Random seed.
    ///
    /// It is strongly recommended that the random seed is different on each
    /// boot, to avoid reusing IPv4 identification values across reboots.
    ///
    /// The seed doesn't have to be cryptographically secure.
    pub random_seed: u64,

    /// Verify IPv4 and ICMPv4 checksums on received packets.
    ///
    /// Default is `true`. Turn it off when the link layer has already done so.
    pub verify_checksum: bool,

    /// Octets reserved in front of every originated datagram for the link
    /// layer header.
    ///
    /// Default is `LINK_HEADER_LEN`.
    pub headroom: usize,
}

impl Config {
    pub fn new() -> Self {
        Config {
            random_seed: 0,
            verify_checksum: true,
            headroom: LINK_HEADER_LEN,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

/// What happened to a received packet.
///
/// Every variant but `Forwarded` means the packet buffer has been released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Disposition {
    /// Handed to the link layer on the egress interface.
    Forwarded,
    /// Addressed to us; an ICMP echo reply was sent.
    Replied,
    /// Addressed to us and consumed without a reply.
    Delivered,
    /// Handed to the routing protocol daemon.
    ControlPlane,
    /// Time to live ran out; ICMP time exceeded was sent if allowed.
    Expired,
    /// No route to the destination; ICMP net unreachable was sent if allowed.
    Unreachable,
    /// Addressed to the routing protocol group but not carrying the routing
    /// protocol.
    Rejected,
    /// Addressed to a broadcast or multicast group this router does not
    /// forward.
    Ignored,
    /// The IPv4 header did not parse.
    Malformed,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Disposition::Forwarded => write!(f, "forwarded"),
            Disposition::Replied => write!(f, "replied"),
            Disposition::Delivered => write!(f, "delivered"),
            Disposition::ControlPlane => write!(f, "delivered to control plane"),
            Disposition::Expired => write!(f, "time to live expired"),
            Disposition::Unreachable => write!(f, "destination unreachable"),
            Disposition::Rejected => write!(f, "rejected"),
            Disposition::Ignored => write!(f, "ignored"),
            Disposition::Malformed => write!(f, "malformed"),
        }
    }
}

/// Error returned by [Router::send_packet] and [Router::send_icmp_error].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendError {
    /// No route covers the destination address.
    NoRoute(Ipv4Address),
    /// The buffer does not hold a valid IPv4 header.
    Malformed,
    /// An ICMP error must not be sent in response to this datagram.
    Suppressed,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SendError::NoRoute(dst) => write!(f, "no route to {dst}"),
            SendError::Malformed => write!(f, "malformed packet"),
            SendError::Suppressed => write!(f, "ICMP error suppressed"),
        }
    }
}

impl std::error::Error for SendError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InterfaceTableFull;

impl fmt::Display for InterfaceTableFull {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Interface table full")
    }
}

impl std::error::Error for InterfaceTableFull {}

/// An ICMP error the router can report about a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IcmpError {
    TimeExceeded(Icmpv4TimeExceeded),
    DstUnreachable(Icmpv4DstUnreachable),
}

impl IcmpError {
    fn repr<'a>(&self, data: &'a [u8]) -> Icmpv4Repr<'a> {
        match *self {
            IcmpError::TimeExceeded(reason) => Icmpv4Repr::TimeExceeded { reason, data },
            IcmpError::DstUnreachable(reason) => Icmpv4Repr::DstUnreachable { reason, data },
        }
    }
}

/// An IPv4 router.
///
/// The router owns the set of interfaces it is attached to and a handle to
/// the routing table that the routing protocol daemon updates. All packet
/// entry points take `&self`, so receive contexts on several threads can
/// share one router.
pub struct Router<L: LinkLayer, C: ControlPlane> {
    config: Config,
    interfaces: Vec<Arc<Interface>, IFACE_MAX_COUNT>,
    routes: Arc<Routes>,
    link: L,
    control_plane: C,
    ipv4_id: AtomicU16,
}

impl<L: LinkLayer, C: ControlPlane> Router<L, C> {
    /// Create a router with no interfaces.
    pub fn new(config: Config, routes: Arc<Routes>, link: L, control_plane: C) -> Self {
        let mut rand = Rand::new(config.random_seed);
        let mut ipv4_id = rand.rand_u16();
        while ipv4_id == 0 {
            ipv4_id = rand.rand_u16();
        }

        Router {
            config,
            interfaces: Vec::new(),
            routes,
            link,
            control_plane,
            ipv4_id: AtomicU16::new(ipv4_id),
        }
    }

    /// Attach the router to an interface.
    ///
    /// This does not add a route for the interface subnet; see
    /// [Routes::add_connected].
    pub fn add_interface(
        &mut self,
        iface: Interface,
    ) -> core::result::Result<Arc<Interface>, InterfaceTableFull> {
        let iface = Arc::new(iface);
        self.interfaces
            .push(iface.clone())
            .map_err(|_| InterfaceTableFull)?;
        Ok(iface)
    }

    pub fn interfaces(&self) -> &[Arc<Interface>] {
        &self.interfaces
    }

    /// Find an attached interface by index.
    pub fn interface(&self, index: usize) -> Option<&Arc<Interface>> {
        self.interfaces.iter().find(|iface| iface.index() == index)
    }

    pub fn routes(&self) -> &Arc<Routes> {
        &self.routes
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn control_plane(&self) -> &C {
        &self.control_plane
    }

    /// Check whether any attached interface has the given address assigned.
    pub fn has_ipv4_addr(&self, addr: Ipv4Address) -> bool {
        self.interfaces.iter().any(|iface| iface.has_ipv4_addr(addr))
    }

    fn next_ipv4_ident(&self) -> u16 {
        self.ipv4_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Process a packet received on `iface`.
    ///
    /// The router takes ownership of the packet. It is either handed to the
    /// link layer or released before this function returns.
    ///
    /// Only unicast destinations are forwarded. Datagrams sent to the limited
    /// broadcast address or to a multicast group other than
    /// `MULTICAST_ALL_SPF_ROUTERS` are dropped as [Disposition::Ignored]
    /// (RFC 1812 § 5.3.5).
    pub fn handle_packet(&self, iface: &Interface, packet: PacketBuffer) -> Disposition {
        let ipv4_repr = {
            let ipv4_packet = check!(Ipv4Packet::new_checked(packet.ip_bytes()));
            check!(Ipv4Repr::parse(&ipv4_packet, self.config.verify_checksum))
        };
        net_trace!("{}: received {}", iface.name(), ipv4_repr);

        let dst_addr = ipv4_repr.dst_addr;
        if iface.has_ipv4_addr(dst_addr) || self.has_ipv4_addr(dst_addr) {
            self.process_local(iface, ipv4_repr, packet)
        } else if dst_addr == MULTICAST_ALL_SPF_ROUTERS {
            self.process_control_plane(iface, ipv4_repr, packet)
        } else if !dst_addr.is_unicast() {
            net_trace!("{}: not forwarding to {}", iface.name(), dst_addr);
            Disposition::Ignored
        } else {
            self.forward_packet(iface, packet)
        }
    }

    fn process_local(
        &self,
        iface: &Interface,
        ipv4_repr: Ipv4Repr,
        packet: PacketBuffer,
    ) -> Disposition {
        match ipv4_repr.next_header {
            IpProtocol::Icmp => self.process_icmpv4(iface, ipv4_repr, packet),
            IpProtocol::Mospf => {
                self.control_plane.deliver(iface, &packet);
                Disposition::ControlPlane
            }
            next_header => {
                net_trace!("{}: dropping local {} packet", iface.name(), next_header);
                Disposition::Delivered
            }
        }
    }

    fn process_control_plane(
        &self,
        iface: &Interface,
        ipv4_repr: Ipv4Repr,
        packet: PacketBuffer,
    ) -> Disposition {
        match ipv4_repr.next_header {
            IpProtocol::Mospf => {
                self.control_plane.deliver(iface, &packet);
                Disposition::ControlPlane
            }
            next_header => {
                net_debug!(
                    "{}: rejecting {} packet sent to {}",
                    iface.name(),
                    next_header,
                    MULTICAST_ALL_SPF_ROUTERS
                );
                Disposition::Rejected
            }
        }
    }

    fn process_icmpv4(
        &self,
        iface: &Interface,
        ipv4_repr: Ipv4Repr,
        packet: PacketBuffer,
    ) -> Disposition {
        let ipv4_packet = packet.ipv4();
        if ipv4_packet.more_frags() || ipv4_packet.frag_offset() != 0 {
            net_debug!("{}: dropping fragmented ICMP packet", iface.name());
            return Disposition::Delivered;
        }

        let icmp_packet = check!(Icmpv4Packet::new_checked(ipv4_packet.payload()));
        let icmp_repr = check!(Icmpv4Repr::parse(
            &icmp_packet,
            self.config.verify_checksum
        ));

        match icmp_repr {
            // Respond to echo requests.
            Icmpv4Repr::EchoRequest {
                ident,
                seq_no,
                data,
            } => {
                if !ipv4_repr.src_addr.is_unicast() {
                    // Do not send ICMP replies to non-unicast sources
                    return Disposition::Delivered;
                }
                let icmp_reply_repr = Icmpv4Repr::EchoReply {
                    ident,
                    seq_no,
                    data,
                };
                let ipv4_reply_repr = Ipv4Repr::new(
                    ipv4_repr.dst_addr,
                    ipv4_repr.src_addr,
                    IpProtocol::Icmp,
                    icmp_reply_repr.buffer_len(),
                );
                let reply = self.icmpv4_packet(&ipv4_reply_repr, &icmp_reply_repr);
                match self.send_packet(reply) {
                    Ok(()) => Disposition::Replied,
                    Err(_) => Disposition::Delivered,
                }
            }

            // Ignore any echo replies and errors.
            _ => Disposition::Delivered,
        }
    }

    /// Forward a transit packet received on `iface`.
    ///
    /// Decrements the time to live, looks up the egress route, and hands the
    /// packet to the link layer. ICMP errors are sent back to the source when
    /// the time to live runs out or no route exists.
    pub fn forward_packet(&self, iface: &Interface, mut packet: PacketBuffer) -> Disposition {
        let (dst_addr, hop_limit) = {
            let ipv4_packet = check!(Ipv4Packet::new_checked(packet.ip_bytes()));
            (ipv4_packet.dst_addr(), ipv4_packet.hop_limit())
        };

        if hop_limit <= 1 {
            net_debug!("{}: time to live expired for {}", iface.name(), dst_addr);
            let _ = self.send_icmp_error(
                iface,
                &packet,
                IcmpError::TimeExceeded(Icmpv4TimeExceeded::TtlExpired),
            );
            return Disposition::Expired;
        }

        packet.ipv4_mut().decrement_hop_limit();

        let route = match self.routes.lookup(&dst_addr) {
            Some(route) => route,
            None => {
                net_debug!("{}: no route to {}", iface.name(), dst_addr);
                let _ = self.send_icmp_error(
                    iface,
                    &packet,
                    IcmpError::DstUnreachable(Icmpv4DstUnreachable::NetUnreachable),
                );
                return Disposition::Unreachable;
            }
        };

        let next_hop = route.next_hop(dst_addr);
        net_trace!(
            "{}: forwarding {} via {} out of {}",
            iface.name(),
            dst_addr,
            next_hop,
            route.iface.name()
        );
        self.link.transmit(&route.iface, next_hop, packet);
        Disposition::Forwarded
    }

    /// Send a datagram originated by this router.
    ///
    /// The header is sent as is: the time to live and checksum are not
    /// touched. When no route exists the packet is released.
    pub fn send_packet(&self, packet: PacketBuffer) -> core::result::Result<(), SendError> {
        let dst_addr = match Ipv4Packet::new_checked(packet.ip_bytes()) {
            Ok(ipv4_packet) => ipv4_packet.dst_addr(),
            Err(_) => return Err(SendError::Malformed),
        };

        match self.routes.lookup(&dst_addr) {
            Some(route) => {
                let next_hop = route.next_hop(dst_addr);
                self.link.transmit(&route.iface, next_hop, packet);
                Ok(())
            }
            None => {
                net_debug!("could not find route for IP packet to {}", dst_addr);
                Err(SendError::NoRoute(dst_addr))
            }
        }
    }

    /// Report `error` about the datagram `original`, received on `iface`, to
    /// its source.
    ///
    /// The message quotes the original IPv4 header and the first octets of its
    /// payload, and is sent from the address of `iface`. Nothing is sent if
    /// the original source is not a unicast address or if the original is an
    /// ICMP error itself.
    pub fn send_icmp_error(
        &self,
        iface: &Interface,
        original: &PacketBuffer,
        error: IcmpError,
    ) -> core::result::Result<(), SendError> {
        let ipv4_packet = match Ipv4Packet::new_checked(original.ip_bytes()) {
            Ok(ipv4_packet) => ipv4_packet,
            Err(_) => return Err(SendError::Malformed),
        };

        let src_addr = ipv4_packet.src_addr();
        if !src_addr.is_unicast() {
            net_debug!("not sending ICMP error to non-unicast {}", src_addr);
            return Err(SendError::Suppressed);
        }
        if ipv4_packet.next_header() == IpProtocol::Icmp && ipv4_packet.frag_offset() == 0 {
            if let Ok(icmp_packet) = Icmpv4Packet::new_checked(ipv4_packet.payload()) {
                if icmp_packet.msg_type().is_error() {
                    net_debug!("not sending ICMP error about ICMP error from {}", src_addr);
                    return Err(SendError::Suppressed);
                }
            }
        }

        let icmp_repr = error.repr(Icmpv4Repr::quote(original.datagram()));
        let ipv4_repr = Ipv4Repr::new(
            iface.ipv4_addr(),
            src_addr,
            IpProtocol::Icmp,
            icmp_repr.buffer_len(),
        );
        net_debug!("{}: sending {} to {}", iface.name(), icmp_repr, src_addr);
        let packet = self.icmpv4_packet(&ipv4_repr, &icmp_repr);
        self.send_packet(packet)
    }

    fn icmpv4_packet(&self, ipv4_repr: &Ipv4Repr, icmp_repr: &Icmpv4Repr) -> PacketBuffer {
        let mut packet = PacketBuffer::alloc(
            self.config.headroom,
            ipv4_repr.buffer_len() + ipv4_repr.payload_len,
        );
        let mut ipv4_packet = packet.ipv4_mut();
        ipv4_repr.emit(&mut ipv4_packet, self.next_ipv4_ident());
        icmp_repr.emit(&mut Icmpv4Packet::new_unchecked(ipv4_packet.payload_mut()));
        packet
    }
}
