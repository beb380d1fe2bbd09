use core::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use heapless::Vec;

use super::Interface;
use crate::config::IFACE_MAX_ROUTE_COUNT;
use crate::wire::{Ipv4Address, Ipv4Cidr, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RouteTableFull;

impl core::fmt::Display for RouteTableFull {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Route table full")
    }
}

impl std::error::Error for RouteTableFull {}

/// A prefix of addresses reachable through an interface, optionally via a
/// gateway.
#[derive(Debug, Clone)]
pub struct Route {
    pub cidr: Ipv4Cidr,
    /// `None` means the prefix is directly connected to `iface`.
    pub via_router: Option<Ipv4Address>,
    pub iface: Arc<Interface>,
}

impl Route {
    /// Returns a directly connected route to `cidr` out of `iface`.
    pub fn new_connected(cidr: Ipv4Cidr, iface: Arc<Interface>) -> Route {
        Route {
            cidr: cidr.network(),
            via_router: None,
            iface,
        }
    }

    /// Returns a route to `cidr` via `gateway`, reachable out of `iface`.
    pub fn new_via(cidr: Ipv4Cidr, gateway: Ipv4Address, iface: Arc<Interface>) -> Route {
        Route {
            cidr: cidr.network(),
            via_router: Some(gateway),
            iface,
        }
    }

    /// Returns a route to 0.0.0.0/0 via `gateway`.
    pub fn new_default(gateway: Ipv4Address, iface: Arc<Interface>) -> Route {
        Route::new_via(Ipv4Cidr::new(Ipv4Address::UNSPECIFIED, 0), gateway, iface)
    }

    /// Returns a route described the way the kernel and the routing daemon
    /// describe it: destination, netmask, and a gateway that is unspecified
    /// for connected prefixes.
    ///
    /// Returns `Err(Error)` if `netmask` is not contiguous.
    pub fn from_netmask(
        dest: Ipv4Address,
        netmask: Ipv4Address,
        gateway: Ipv4Address,
        iface: Arc<Interface>,
    ) -> Result<Route> {
        let cidr = Ipv4Cidr::from_netmask(dest, netmask)?;
        if gateway.is_unspecified() {
            Ok(Route::new_connected(cidr, iface))
        } else {
            Ok(Route::new_via(cidr, gateway, iface))
        }
    }

    /// Query whether `addr` falls within this route's prefix.
    pub fn matches(&self, addr: &Ipv4Address) -> bool {
        self.cidr.contains_addr(addr)
    }

    /// Return the address the link layer has to resolve to reach `dst`.
    pub fn next_hop(&self, dst: Ipv4Address) -> Ipv4Address {
        self.via_router.unwrap_or(dst)
    }

    pub fn is_directly_connected(&self) -> bool {
        self.via_router.is_none()
    }
}

impl PartialEq for Route {
    fn eq(&self, other: &Route) -> bool {
        self.cidr == other.cidr
            && self.via_router == other.via_router
            && self.iface.index() == other.iface.index()
    }
}

impl Eq for Route {}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.cidr)?;
        if let Some(gateway) = self.via_router {
            write!(f, " via {gateway}")?;
        }
        write!(f, " dev {}", self.iface.name())
    }
}

type Storage = Vec<Route, IFACE_MAX_ROUTE_COUNT>;

/// A routing table shared between the forwarding path and the routing
/// protocol daemon.
///
/// Lookups take a read lock for the duration of one scan; modifications take
/// the write lock. Share it through an [Arc].
#[derive(Debug, Default)]
pub struct Routes {
    storage: RwLock<Storage>,
}

impl Routes {
    /// Creates a new empty routing table.
    pub const fn new() -> Self {
        Self {
            storage: RwLock::new(Vec::new()),
        }
    }

    /// Lock the table for reading.
    pub fn read(&self) -> RoutesRead<'_> {
        RoutesRead {
            storage: self.storage.read().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Lock the table for writing.
    pub fn write(&self) -> RoutesWrite<'_> {
        RoutesWrite {
            storage: self.storage.write().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Update the routes of this node under a single write lock.
    pub fn update<F: FnOnce(&mut RoutesWrite<'_>) -> R, R>(&self, f: F) -> R {
        f(&mut self.write())
    }

    /// Find the route with the longest prefix matching `addr`.
    ///
    /// Among equally long prefixes the most recently inserted route wins.
    /// The lock is released before the route is returned.
    pub fn lookup(&self, addr: &Ipv4Address) -> Option<Route> {
        self.read().lookup(addr).cloned()
    }

    pub fn insert(&self, route: Route) -> core::result::Result<(), RouteTableFull> {
        self.write().insert(route)
    }

    pub fn remove(&self, route: &Route) -> Option<Route> {
        self.write().remove(route)
    }

    /// Add the subnet `iface` is directly connected to.
    pub fn add_connected(&self, iface: &Arc<Interface>) -> core::result::Result<(), RouteTableFull> {
        self.insert(Route::new_connected(iface.ipv4_cidr(), iface.clone()))
    }

    /// Remove every route learned through a gateway and install `routes`
    /// instead, as one atomic update.
    ///
    /// Directly connected routes are kept. If the new set does not fit, the
    /// routes that did fit stay installed and `Err(RouteTableFull)` is
    /// returned.
    pub fn replace_dynamic<I>(&self, routes: I) -> core::result::Result<(), RouteTableFull>
    where
        I: IntoIterator<Item = Route>,
    {
        let mut table = self.write();
        table.retain(Route::is_directly_connected);
        for route in routes {
            table.insert(route)?;
        }
        Ok(())
    }

    pub fn clear(&self) {
        self.write().clear()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Copy the current contents of the table.
    pub fn snapshot(&self) -> std::vec::Vec<Route> {
        self.read().iter().cloned().collect()
    }
}

fn lookup<'a>(storage: &'a Storage, addr: &Ipv4Address) -> Option<&'a Route> {
    let mut best: Option<&Route> = None;
    for route in storage.iter().filter(|route| route.matches(addr)) {
        match best {
            Some(kept) if kept.cidr.prefix_len() > route.cidr.prefix_len() => (),
            _ => best = Some(route),
        }
    }
    best
}

/// The routing table, locked for reading.
pub struct RoutesRead<'a> {
    storage: RwLockReadGuard<'a, Storage>,
}

impl<'a> RoutesRead<'a> {
    pub fn lookup(&self, addr: &Ipv4Address) -> Option<&Route> {
        lookup(&self.storage, addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.storage.iter()
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }
}

impl<'a> fmt::Display for RoutesRead<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{:<20}{:<16}{}", "Destination", "Gateway", "Interface")?;
        for route in self.storage.iter() {
            let gateway = match route.via_router {
                Some(gateway) => gateway,
                None => Ipv4Address::UNSPECIFIED,
            };
            writeln!(
                f,
                "{:<20}{:<16}{}",
                route.cidr.to_string(),
                gateway.to_string(),
                route.iface.name()
            )?;
        }
        Ok(())
    }
}

/// The routing table, locked for writing.
pub struct RoutesWrite<'a> {
    storage: RwLockWriteGuard<'a, Storage>,
}

impl<'a> RoutesWrite<'a> {
    pub fn lookup(&self, addr: &Ipv4Address) -> Option<&Route> {
        lookup(&self.storage, addr)
    }

    /// Append a route. It takes precedence over existing routes with the
    /// same prefix length.
    pub fn insert(&mut self, route: Route) -> core::result::Result<(), RouteTableFull> {
        net_trace!("route add {} dev {}", route.cidr, route.iface.index());
        self.storage.push(route).map_err(|_| RouteTableFull)
    }

    /// Remove the first route equal to `route`, returning it.
    pub fn remove(&mut self, route: &Route) -> Option<Route> {
        let index = self.storage.iter().position(|r| r == route)?;
        net_trace!("route del {} dev {}", route.cidr, route.iface.index());
        Some(self.storage.remove(index))
    }

    /// Keep only the routes for which `f` returns true, preserving their
    /// order.
    pub fn retain<F: FnMut(&Route) -> bool>(&mut self, f: F) {
        self.storage.retain(f)
    }

    pub fn clear(&mut self) {
        self.storage.clear()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.storage.iter()
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    mod mock {
        use super::*;

        pub const ADDR_1A: Ipv4Address = Ipv4Address::new(192, 0, 2, 1);
        pub const ADDR_1B: Ipv4Address = Ipv4Address::new(192, 0, 2, 13);
        pub const ADDR_1C: Ipv4Address = Ipv4Address::new(192, 0, 2, 42);
        pub fn cidr_1() -> Ipv4Cidr {
            Ipv4Cidr::new(Ipv4Address::new(192, 0, 2, 0), 24)
        }

        pub const ADDR_2A: Ipv4Address = Ipv4Address::new(198, 51, 100, 1);
        pub const ADDR_2B: Ipv4Address = Ipv4Address::new(198, 51, 100, 21);
        pub fn cidr_2() -> Ipv4Cidr {
            Ipv4Cidr::new(Ipv4Address::new(198, 51, 100, 0), 24)
        }

        pub fn iface(index: usize) -> Arc<Interface> {
            Arc::new(Interface::new(
                index,
                format!("eth{index}"),
                Ipv4Cidr::new(Ipv4Address::new(10, 0, index as u8, 1), 24),
            ))
        }
    }

    use self::mock::*;

    #[test]
    fn test_fill() {
        let routes = Routes::new();

        assert_eq!(routes.lookup(&ADDR_1A), None);
        assert_eq!(routes.lookup(&ADDR_2A), None);

        let route = Route::new_via(cidr_1(), ADDR_2A, iface(0));
        routes.insert(route.clone()).unwrap();

        assert_eq!(routes.lookup(&ADDR_1A), Some(route.clone()));
        assert_eq!(routes.lookup(&ADDR_1B), Some(route.clone()));
        assert_eq!(routes.lookup(&ADDR_1C), Some(route));
        assert_eq!(routes.lookup(&ADDR_2A), None);
        assert_eq!(routes.lookup(&ADDR_2B), None);

        let route2 = Route::new_connected(cidr_2(), iface(1));
        routes.insert(route2.clone()).unwrap();

        assert_eq!(routes.lookup(&ADDR_2A), Some(route2.clone()));
        assert_eq!(routes.lookup(&ADDR_2B), Some(route2));
        assert_eq!(routes.len(), 2);
    }

    #[rstest]
    #[case(Ipv4Address::new(10, 0, 1, 5), 1)]
    #[case(Ipv4Address::new(10, 0, 2, 5), 0)]
    #[case(Ipv4Address::new(10, 255, 255, 255), 0)]
    #[case(Ipv4Address::new(10, 0, 1, 255), 1)]
    fn test_longest_prefix(#[case] dst: Ipv4Address, #[case] expected: usize) {
        let routes = Routes::new();
        routes
            .insert(Route::new_connected(
                Ipv4Cidr::new(Ipv4Address::new(10, 0, 0, 0), 8),
                iface(0),
            ))
            .unwrap();
        routes
            .insert(Route::new_connected(
                Ipv4Cidr::new(Ipv4Address::new(10, 0, 1, 0), 24),
                iface(1),
            ))
            .unwrap();

        let route = routes.lookup(&dst).unwrap();
        assert_eq!(route.iface.index(), expected);
    }

    #[test]
    fn test_longest_prefix_independent_of_order() {
        let routes = Routes::new();
        routes
            .insert(Route::new_connected(
                Ipv4Cidr::new(Ipv4Address::new(10, 0, 1, 0), 24),
                iface(1),
            ))
            .unwrap();
        routes
            .insert(Route::new_connected(
                Ipv4Cidr::new(Ipv4Address::new(10, 0, 0, 0), 8),
                iface(0),
            ))
            .unwrap();

        let dst = Ipv4Address::new(10, 0, 1, 5);
        assert_eq!(routes.lookup(&dst).unwrap().iface.index(), 1);
    }

    #[test]
    fn test_default_route() {
        let routes = Routes::new();
        let default = Route::new_default(ADDR_2A, iface(0));
        routes.insert(default.clone()).unwrap();
        routes.insert(Route::new_connected(cidr_1(), iface(1))).unwrap();

        assert_eq!(routes.lookup(&ADDR_2B), Some(default));
        assert_eq!(routes.lookup(&ADDR_1A).unwrap().iface.index(), 1);
    }

    #[test]
    fn test_equal_prefix_later_insert_wins() {
        let routes = Routes::new();
        routes.insert(Route::new_via(cidr_1(), ADDR_2A, iface(0))).unwrap();
        routes.insert(Route::new_via(cidr_1(), ADDR_2B, iface(1))).unwrap();

        let route = routes.lookup(&ADDR_1A).unwrap();
        assert_eq!(route.via_router, Some(ADDR_2B));
        assert_eq!(route.iface.index(), 1);
    }

    #[test]
    fn test_remove() {
        let routes = Routes::new();
        let first = Route::new_via(cidr_1(), ADDR_2A, iface(0));
        let second = Route::new_via(cidr_1(), ADDR_2B, iface(1));
        routes.insert(first.clone()).unwrap();
        routes.insert(second.clone()).unwrap();

        assert_eq!(routes.remove(&second), Some(second.clone()));
        assert_eq!(routes.remove(&second), None);
        assert_eq!(routes.lookup(&ADDR_1A), Some(first));
    }

    #[test]
    fn test_table_full() {
        let routes = Routes::new();
        for i in 0..IFACE_MAX_ROUTE_COUNT {
            let dest = Ipv4Address::from_bits(0x0a00_0000 | ((i as u32) << 8));
            routes
                .insert(Route::new_connected(Ipv4Cidr::new(dest, 24), iface(0)))
                .unwrap();
        }
        assert_eq!(
            routes.insert(Route::new_default(ADDR_2A, iface(0))),
            Err(RouteTableFull)
        );
        assert_eq!(routes.len(), IFACE_MAX_ROUTE_COUNT);
    }

    #[test]
    fn test_replace_dynamic() {
        let routes = Routes::new();
        let connected = Route::new_connected(cidr_2(), iface(0));
        routes.insert(connected.clone()).unwrap();
        routes.insert(Route::new_via(cidr_1(), ADDR_2A, iface(0))).unwrap();

        let learned = Route::new_via(cidr_1(), ADDR_2B, iface(0));
        routes.replace_dynamic([learned.clone()]).unwrap();

        assert_eq!(routes.snapshot(), [connected, learned]);
    }

    #[test]
    fn test_from_netmask() {
        let route = Route::from_netmask(
            Ipv4Address::new(192, 0, 2, 0),
            Ipv4Address::new(255, 255, 255, 0),
            Ipv4Address::UNSPECIFIED,
            iface(0),
        )
        .unwrap();
        assert!(route.is_directly_connected());
        assert_eq!(route.cidr, cidr_1());
        assert_eq!(route.next_hop(ADDR_1B), ADDR_1B);

        let route = Route::from_netmask(
            Ipv4Address::new(192, 0, 2, 0),
            Ipv4Address::new(255, 255, 255, 0),
            ADDR_2A,
            iface(0),
        )
        .unwrap();
        assert_eq!(route.next_hop(ADDR_1B), ADDR_2A);

        // Only 0.0.0.0 means connected, not the rest of 0.0.0.0/8.
        let gateway = Ipv4Address::new(0, 1, 2, 3);
        let route = Route::from_netmask(
            Ipv4Address::new(192, 0, 2, 0),
            Ipv4Address::new(255, 255, 255, 0),
            gateway,
            iface(0),
        )
        .unwrap();
        assert!(!route.is_directly_connected());
        assert_eq!(route.next_hop(ADDR_1B), gateway);

        assert!(Route::from_netmask(
            Ipv4Address::new(192, 0, 2, 0),
            Ipv4Address::new(255, 0, 255, 0),
            ADDR_2A,
            iface(0),
        )
        .is_err());
    }

    #[test]
    fn test_add_connected() {
        let routes = Routes::new();
        let eth = iface(3);
        routes.add_connected(&eth).unwrap();
        let route = routes.lookup(&Ipv4Address::new(10, 0, 3, 77)).unwrap();
        assert_eq!(route.cidr, Ipv4Cidr::new(Ipv4Address::new(10, 0, 3, 0), 24));
        assert!(route.is_directly_connected());
    }

    #[test]
    fn test_display() {
        let routes = Routes::new();
        routes.insert(Route::new_connected(cidr_1(), iface(0))).unwrap();
        routes.insert(Route::new_via(cidr_2(), ADDR_1A, iface(1))).unwrap();

        let snapshot = routes.snapshot();
        assert_eq!(snapshot[0].to_string(), "192.0.2.0/24 dev eth0");
        assert_eq!(snapshot[1].to_string(), "198.51.100.0/24 via 192.0.2.1 dev eth1");

        let dump = routes.read().to_string();
        let lines: std::vec::Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("192.0.2.0/24"));
        assert!(lines[1].contains("0.0.0.0"));
        assert!(lines[2].contains("192.0.2.1"));
        assert!(lines[2].ends_with("eth1"));
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        let routes = Arc::new(Routes::new());
        routes
            .insert(Route::new_connected(
                Ipv4Cidr::new(Ipv4Address::new(10, 0, 0, 0), 8),
                iface(0),
            ))
            .unwrap();
        let specific = Route::new_connected(
            Ipv4Cidr::new(Ipv4Address::new(10, 0, 1, 0), 24),
            iface(1),
        );
        let dst = Ipv4Address::new(10, 0, 1, 5);

        let readers: std::vec::Vec<_> = (0..4)
            .map(|_| {
                let routes = routes.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        // Either the /8 or the /24, never a torn table.
                        let route = routes.lookup(&dst).unwrap();
                        assert!(route.iface.index() <= 1);
                    }
                })
            })
            .collect();

        for _ in 0..100 {
            routes.insert(specific.clone()).unwrap();
            routes.remove(&specific).unwrap();
        }
        routes.insert(specific).unwrap();

        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(routes.lookup(&dst).unwrap().iface.index(), 1);
        assert_eq!(routes.len(), 2);
    }
}
