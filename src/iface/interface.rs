use core::fmt;
use std::sync::Arc;

use super::PacketBuffer;
use crate::wire::{Ipv4Address, Ipv4Cidr};

/// A network interface the router is attached to.
///
/// Interfaces are created when the router is set up and never change
/// afterwards; routes refer to them through an [Arc].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    index: usize,
    name: String,
    cidr: Ipv4Cidr,
}

impl Interface {
    /// Create an interface with the given index, name, and address.
    ///
    /// `cidr` carries both the interface address and the prefix length of the
    /// directly connected subnet.
    pub fn new(index: usize, name: impl Into<String>, cidr: Ipv4Cidr) -> Interface {
        Interface {
            index,
            name: name.into(),
            cidr,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return the address assigned to this interface.
    pub fn ipv4_addr(&self) -> Ipv4Address {
        self.cidr.address()
    }

    /// Return the address and prefix length assigned to this interface.
    pub fn ipv4_cidr(&self) -> Ipv4Cidr {
        self.cidr
    }

    /// Return the directly connected subnet.
    pub fn subnet(&self) -> Ipv4Cidr {
        self.cidr.network()
    }

    /// Check whether the interface has the given IP address assigned.
    pub fn has_ipv4_addr(&self, addr: Ipv4Address) -> bool {
        self.cidr.address() == addr
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.cidr)
    }
}

/// The transmit half of the link layer.
///
/// The link layer resolves `next_hop` to a hardware address, fills in the
/// link header inside the packet headroom, and sends the frame out of
/// `iface`. It takes ownership of the packet and must not call back into the
/// router synchronously.
pub trait LinkLayer {
    fn transmit(&self, iface: &Interface, next_hop: Ipv4Address, packet: PacketBuffer);
}

/// The routing protocol daemon.
///
/// Receives routing protocol datagrams addressed to this router or to the
/// AllSPFRouters group. The packet is only borrowed; the router releases it
/// once `deliver` returns.
pub trait ControlPlane {
    fn deliver(&self, iface: &Interface, packet: &PacketBuffer);
}

impl<T: LinkLayer + ?Sized> LinkLayer for &T {
    fn transmit(&self, iface: &Interface, next_hop: Ipv4Address, packet: PacketBuffer) {
        (**self).transmit(iface, next_hop, packet)
    }
}

impl<T: LinkLayer + ?Sized> LinkLayer for Arc<T> {
    fn transmit(&self, iface: &Interface, next_hop: Ipv4Address, packet: PacketBuffer) {
        (**self).transmit(iface, next_hop, packet)
    }
}

impl<T: ControlPlane + ?Sized> ControlPlane for &T {
    fn deliver(&self, iface: &Interface, packet: &PacketBuffer) {
        (**self).deliver(iface, packet)
    }
}

impl<T: ControlPlane + ?Sized> ControlPlane for Arc<T> {
    fn deliver(&self, iface: &Interface, packet: &PacketBuffer) {
        (**self).deliver(iface, packet)
    }
}
