#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_code)]

//! The _ipforward_ library is the IPv4 forwarding plane of a software router.
//!
//! It takes inbound IPv4 packets and decides, per packet, whether they are
//! addressed to the router itself, to the link-state routing protocol's
//! multicast group, or are transit traffic. Transit traffic is routed by
//! longest-prefix match, has its TTL decremented and its header checksum
//! rewritten, and is handed to the link layer for next-hop resolution.
//! Expired and unroutable packets are answered with ICMP errors.
//!
//! # The layers
//!
//! ## The wire layer
//! The `wire` layer deals with the packet *representation*: IPv4 headers,
//! ICMPv4 messages and the Internet checksum. It does not depend on `std`.
//!
//! ## The interface layer
//! The `iface` layer holds the route table, the owned packet buffer and the
//! `Router` that ties them together. The link layer and the routing
//! protocol daemon are collaborators supplied by the embedding program
//! through the `LinkLayer` and `ControlPlane` traits.
//!
//! # Configuration
//!
//! Table sizes and a few protocol constants are fixed at compile time. They
//! are read from environment variables by the build script:
//!
//! * `IPFORWARD_IFACE_MAX_ROUTE_COUNT` (default 256)
//! * `IPFORWARD_IFACE_MAX_COUNT` (default 16)
//! * `IPFORWARD_DEFAULT_TTL` (default 64)
//! * `IPFORWARD_LINK_HEADER_LEN` (default 14)

#[macro_use]
mod macros;
#[cfg(feature = "std")]
mod rand;


#[cfg(feature = "std")]
pub mod iface;
pub mod wire;

#[allow(unused)]
pub mod config {
    #![allow(clippy::all)]
    include!(concat!(env!("OUT_DIR"), "/config.rs"));
}
