use std::collections::VecDeque;
use std::io::Write as _;
use std::sync::{Arc, Mutex};
use std::thread;

use ipforward::iface::{
    Config, ControlPlane, Disposition, Interface, LinkLayer, PacketBuffer, Route, Router, Routes,
};
use ipforward::wire::*;

const HOST_A: Ipv4Address = Ipv4Address::new(10, 0, 1, 5);
const HOST_B: Ipv4Address = Ipv4Address::new(10, 0, 2, 7);

const R1_ETH0: Ipv4Address = Ipv4Address::new(10, 0, 1, 1);
const R1_ETH1: Ipv4Address = Ipv4Address::new(10, 0, 12, 1);
const R2_ETH0: Ipv4Address = Ipv4Address::new(10, 0, 12, 2);
const R2_ETH1: Ipv4Address = Ipv4Address::new(10, 0, 2, 1);

fn setup_logging() {
    let _ = env_logger::Builder::new()
        .format(|buf, record| writeln!(buf, "({}): {}", record.target(), record.args()))
        .parse_filters("trace")
        .is_test(true)
        .try_init();
}

/// A link layer that queues frames instead of sending them.
#[derive(Debug, Default)]
struct Wire {
    queue: Mutex<VecDeque<(usize, Ipv4Address, PacketBuffer)>>,
}

impl Wire {
    fn pop(&self) -> Option<(usize, Ipv4Address, PacketBuffer)> {
        self.queue.lock().unwrap().pop_front()
    }

    fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

impl LinkLayer for Wire {
    fn transmit(&self, iface: &Interface, next_hop: Ipv4Address, packet: PacketBuffer) {
        self.queue
            .lock()
            .unwrap()
            .push_back((iface.index(), next_hop, packet));
    }
}

/// A routing daemon that installs the routes advertised to it.
///
/// Each advertisement is a list of 12 octet records: destination, netmask,
/// gateway.
#[derive(Debug)]
struct Daemon {
    routes: Arc<Routes>,
    interfaces: Mutex<Vec<Arc<Interface>>>,
    received: Mutex<usize>,
}

impl Daemon {
    fn new(routes: Arc<Routes>) -> Self {
        Daemon {
            routes,
            interfaces: Mutex::new(Vec::new()),
            received: Mutex::new(0),
        }
    }

    fn received(&self) -> usize {
        *self.received.lock().unwrap()
    }
}

impl ControlPlane for Daemon {
    fn deliver(&self, iface: &Interface, packet: &PacketBuffer) {
        *self.received.lock().unwrap() += 1;

        let egress = match self
            .interfaces
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.index() == iface.index())
        {
            Some(egress) => egress.clone(),
            None => return,
        };

        let ipv4_packet = packet.ipv4();
        let learned: Vec<Route> = ipv4_packet
            .payload()
            .chunks_exact(12)
            .filter_map(|record| {
                Route::from_netmask(
                    Ipv4Address::from_bytes(&record[0..4]),
                    Ipv4Address::from_bytes(&record[4..8]),
                    Ipv4Address::from_bytes(&record[8..12]),
                    egress.clone(),
                )
                .ok()
            })
            .collect();
        self.routes.replace_dynamic(learned).unwrap();
    }
}

type TestRouter = Router<Arc<Wire>, Arc<Daemon>>;

struct Node {
    router: TestRouter,
    wire: Arc<Wire>,
    daemon: Arc<Daemon>,
}

impl Node {
    fn new(seed: u64, addrs: [Ipv4Address; 2]) -> Node {
        let wire = Arc::new(Wire::default());
        let routes = Arc::new(Routes::new());
        let daemon = Arc::new(Daemon::new(routes.clone()));

        let mut config = Config::new();
        config.random_seed = seed;
        let mut router = Router::new(config, routes.clone(), wire.clone(), daemon.clone());
        for (index, addr) in addrs.into_iter().enumerate() {
            let iface = router
                .add_interface(Interface::new(
                    index,
                    format!("eth{index}"),
                    Ipv4Cidr::new(addr, 24),
                ))
                .unwrap();
            routes.add_connected(&iface).unwrap();
            daemon.interfaces.lock().unwrap().push(iface);
        }

        Node {
            router,
            wire,
            daemon,
        }
    }

    fn iface(&self, index: usize) -> Arc<Interface> {
        self.router.interface(index).unwrap().clone()
    }

    fn receive(&self, index: usize, packet: PacketBuffer) -> Disposition {
        self.router.handle_packet(&self.iface(index), packet)
    }
}

/// HOST_A -- eth0 [r1] eth1 -- eth0 [r2] eth1 -- HOST_B
fn topology() -> (Node, Node) {
    let r1 = Node::new(1, [R1_ETH0, R1_ETH1]);
    let r2 = Node::new(2, [R2_ETH0, R2_ETH1]);

    r1.router
        .routes()
        .insert(Route::new_via(
            Ipv4Cidr::new(Ipv4Address::new(10, 0, 2, 0), 24),
            R2_ETH0,
            r1.iface(1),
        ))
        .unwrap();
    r2.router
        .routes()
        .insert(Route::new_via(
            Ipv4Cidr::new(Ipv4Address::new(10, 0, 1, 0), 24),
            R1_ETH1,
            r2.iface(0),
        ))
        .unwrap();

    (r1, r2)
}

/// Move every frame r1 and r2 send to each other across the shared link,
/// returning what they send to the hosts.
fn pump(r1: &Node, r2: &Node) -> Vec<(Ipv4Address, PacketBuffer)> {
    let mut to_hosts = Vec::new();
    loop {
        let mut moved = false;
        while let Some((iface, next_hop, packet)) = r1.wire.pop() {
            moved = true;
            match (iface, next_hop) {
                (1, R2_ETH0) => {
                    r2.receive(0, packet);
                }
                _ => to_hosts.push((next_hop, packet)),
            }
        }
        while let Some((iface, next_hop, packet)) = r2.wire.pop() {
            moved = true;
            match (iface, next_hop) {
                (0, R1_ETH1) => {
                    r1.receive(1, packet);
                }
                _ => to_hosts.push((next_hop, packet)),
            }
        }
        if !moved {
            return to_hosts;
        }
    }
}

fn datagram(
    src_addr: Ipv4Address,
    dst_addr: Ipv4Address,
    next_header: IpProtocol,
    hop_limit: u8,
    payload: &[u8],
) -> PacketBuffer {
    let mut repr = Ipv4Repr::new(src_addr, dst_addr, next_header, payload.len());
    repr.hop_limit = hop_limit;

    let mut bytes = vec![0; 14 + repr.buffer_len() + payload.len()];
    let mut packet = Ipv4Packet::new_unchecked(&mut bytes[14..]);
    repr.emit(&mut packet, 0x0101);
    packet.payload_mut().copy_from_slice(payload);
    PacketBuffer::new(bytes, 14).unwrap()
}

fn echo_request(seq_no: u16) -> Vec<u8> {
    let repr = Icmpv4Repr::EchoRequest {
        ident: 0x4d2,
        seq_no,
        data: b"ping",
    };
    let mut bytes = vec![0; repr.buffer_len()];
    repr.emit(&mut Icmpv4Packet::new_unchecked(&mut bytes[..]));
    bytes
}

/// Return the source and ICMP message of a packet sent to a host.
fn icmp_from(packet: &PacketBuffer) -> (Ipv4Address, Icmpv4Message, u8) {
    let ipv4_packet = Ipv4Packet::new_checked(packet.ip_bytes()).unwrap();
    let ipv4_repr = Ipv4Repr::parse(&ipv4_packet, true).unwrap();
    assert_eq!(ipv4_repr.next_header, IpProtocol::Icmp);
    let icmp_packet = Icmpv4Packet::new_checked(ipv4_packet.payload()).unwrap();
    assert!(icmp_packet.verify_checksum());
    (
        ipv4_repr.src_addr,
        icmp_packet.msg_type(),
        icmp_packet.msg_code(),
    )
}

#[test]
fn test_end_to_end() {
    setup_logging();
    let (r1, r2) = topology();

    let payload = [0x55; 40];
    let packet = datagram(HOST_A, HOST_B, IpProtocol::Udp, 64, &payload);
    assert_eq!(r1.receive(0, packet), Disposition::Forwarded);

    let delivered = pump(&r1, &r2);
    assert_eq!(delivered.len(), 1);
    let (next_hop, packet) = &delivered[0];
    assert_eq!(*next_hop, HOST_B);

    let ipv4_packet = packet.ipv4();
    assert_eq!(ipv4_packet.hop_limit(), 62);
    assert!(ipv4_packet.verify_checksum());
    assert_eq!(ipv4_packet.src_addr(), HOST_A);
    assert_eq!(ipv4_packet.payload(), &payload[..]);
}

#[test]
fn test_traceroute() {
    setup_logging();
    let (r1, r2) = topology();

    // First hop answers with time exceeded from the interface the probe
    // arrived on.
    let probe = datagram(HOST_A, HOST_B, IpProtocol::Udp, 1, &[0; 8]);
    assert_eq!(r1.receive(0, probe), Disposition::Expired);
    let replies = pump(&r1, &r2);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].0, HOST_A);
    assert_eq!(icmp_from(&replies[0].1), (R1_ETH0, Icmpv4Message::TimeExceeded, 0));

    // Second hop.
    let probe = datagram(HOST_A, HOST_B, IpProtocol::Udp, 2, &[0; 8]);
    assert_eq!(r1.receive(0, probe), Disposition::Forwarded);
    let replies = pump(&r1, &r2);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].0, HOST_A);
    assert_eq!(icmp_from(&replies[0].1), (R2_ETH0, Icmpv4Message::TimeExceeded, 0));

    // Third probe reaches the destination.
    let probe = datagram(HOST_A, HOST_B, IpProtocol::Udp, 3, &[0; 8]);
    assert_eq!(r1.receive(0, probe), Disposition::Forwarded);
    let delivered = pump(&r1, &r2);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, HOST_B);
    assert_eq!(delivered[0].1.ipv4().hop_limit(), 1);
}

#[test]
fn test_ping_far_router() {
    setup_logging();
    let (r1, r2) = topology();

    let request = echo_request(1);
    let packet = datagram(HOST_A, R2_ETH1, IpProtocol::Icmp, 64, &request);
    assert_eq!(r1.receive(0, packet), Disposition::Forwarded);

    let replies = pump(&r1, &r2);
    assert_eq!(replies.len(), 1);
    let (next_hop, reply) = &replies[0];
    assert_eq!(*next_hop, HOST_A);
    assert_eq!(icmp_from(reply), (R2_ETH1, Icmpv4Message::EchoReply, 0));
    // Originated by r2 with the default time to live, decremented once by r1.
    assert_eq!(reply.ipv4().hop_limit(), ipforward::config::DEFAULT_TTL - 1);
}

#[test]
fn test_unreachable_across_routers() {
    setup_logging();
    let (r1, r2) = topology();
    r1.router
        .routes()
        .insert(Route::new_default(R2_ETH0, r1.iface(1)))
        .unwrap();

    let packet = datagram(
        HOST_A,
        Ipv4Address::new(198, 51, 100, 1),
        IpProtocol::Udp,
        64,
        &[0; 8],
    );
    assert_eq!(r1.receive(0, packet), Disposition::Forwarded);

    let replies = pump(&r1, &r2);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].0, HOST_A);
    assert_eq!(icmp_from(&replies[0].1), (R2_ETH0, Icmpv4Message::DstUnreachable, 0));
}

#[test]
fn test_daemon_learns_routes() {
    setup_logging();
    let r1 = Node::new(1, [R1_ETH0, R1_ETH1]);
    let far = Ipv4Address::new(172, 16, 4, 4);

    let packet = datagram(HOST_A, far, IpProtocol::Udp, 64, &[0; 8]);
    assert_eq!(r1.receive(0, packet), Disposition::Unreachable);
    let _ = r1.wire.pop();

    // 172.16.0.0/16 via 10.0.12.2
    let advertisement = [172, 16, 0, 0, 255, 255, 0, 0, 10, 0, 12, 2];
    let packet = datagram(
        R2_ETH0,
        MULTICAST_ALL_SPF_ROUTERS,
        IpProtocol::Mospf,
        1,
        &advertisement,
    );
    assert_eq!(r1.receive(1, packet), Disposition::ControlPlane);
    assert_eq!(r1.daemon.received(), 1);
    assert_eq!(r1.wire.len(), 0);

    let packet = datagram(HOST_A, far, IpProtocol::Udp, 64, &[0; 8]);
    assert_eq!(r1.receive(0, packet), Disposition::Forwarded);
    let (iface, next_hop, _) = r1.wire.pop().unwrap();
    assert_eq!(iface, 1);
    assert_eq!(next_hop, R2_ETH0);

    // A later advertisement replaces the learned routes but keeps the
    // connected ones.
    let packet = datagram(
        R2_ETH0,
        MULTICAST_ALL_SPF_ROUTERS,
        IpProtocol::Mospf,
        1,
        &[],
    );
    assert_eq!(r1.receive(1, packet), Disposition::ControlPlane);
    assert_eq!(r1.router.routes().len(), 2);
    assert!(r1.router.routes().lookup(&far).is_none());
}

#[test]
fn test_spf_group_never_forwarded() {
    setup_logging();
    let r1 = Node::new(1, [R1_ETH0, R1_ETH1]);
    r1.router
        .routes()
        .insert(Route::new_default(R2_ETH0, r1.iface(1)))
        .unwrap();

    let packet = datagram(
        HOST_A,
        MULTICAST_ALL_SPF_ROUTERS,
        IpProtocol::Udp,
        64,
        &[0; 8],
    );
    assert_eq!(r1.receive(0, packet), Disposition::Rejected);
    assert_eq!(r1.wire.len(), 0);
    assert_eq!(r1.daemon.received(), 0);
}

#[test]
fn test_concurrent_forwarding() {
    setup_logging();
    let node = Arc::new(Node::new(7, [R1_ETH0, R1_ETH1]));
    let far = Ipv4Cidr::new(Ipv4Address::new(172, 16, 0, 0), 16);

    const THREADS: usize = 4;
    const PACKETS: usize = 500;

    let workers: Vec<_> = (0..THREADS)
        .map(|n| {
            let node = node.clone();
            thread::spawn(move || {
                let mut forwarded = 0;
                for i in 0..PACKETS {
                    let dst = Ipv4Address::new(172, 16, n as u8, (i % 250) as u8 + 1);
                    let packet = datagram(HOST_A, dst, IpProtocol::Udp, 64, &[0; 8]);
                    match node.receive(0, packet) {
                        Disposition::Forwarded => forwarded += 1,
                        Disposition::Unreachable => (),
                        other => panic!("unexpected {other}"),
                    }
                }
                forwarded
            })
        })
        .collect();

    let routes = node.router.routes().clone();
    let iface = node.iface(1);
    for i in 0..200 {
        if i % 2 == 0 {
            routes
                .replace_dynamic([Route::new_via(far, R2_ETH0, iface.clone())])
                .unwrap();
        } else {
            routes.replace_dynamic(Vec::new()).unwrap();
        }
    }

    let forwarded: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
    let total = THREADS * PACKETS;

    // Every packet was either forwarded or answered with an error to HOST_A.
    let mut transmitted = 0;
    let mut errors = 0;
    while let Some((_, next_hop, _)) = node.wire.pop() {
        transmitted += 1;
        if next_hop == HOST_A {
            errors += 1;
        }
    }
    assert_eq!(transmitted, total);
    assert_eq!(transmitted - errors, forwarded);
}
