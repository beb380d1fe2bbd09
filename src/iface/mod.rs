/*! Forwarding-plane logic.

The `iface` module deals with what happens to a packet after it has been
received from a network interface: it decides whether the packet is for this
router, for the routing protocol daemon, or has to be forwarded, looks up the
egress route, and hands the packet to the link layer.
*/

mod interface;
mod packet;
mod route;
mod router;

pub use self::interface::{ControlPlane, Interface, LinkLayer};
pub use self::packet::PacketBuffer;
pub use self::route::{Route, RouteTableFull, Routes, RoutesRead, RoutesWrite};
pub use self::router::{
    Config, Disposition, IcmpError, InterfaceTableFull, Router, SendError,
};
