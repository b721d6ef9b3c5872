//! End-to-end exercises of `RouterCore` against the table/queue/store
//! internals directly, bypassing the UDP transport (spec §8 scenario 1,
//! 5, 6).

use forest_router::address::ForestAddr;
use forest_router::core::{RouterConfig, RouterCore};
use forest_router::packet::{flags, Header, Packet, PacketType, PeerType};
use forest_router::rate::RateSpec;
use forest_router::tables::comtree::ComtreeLinkInfo;

fn new_core(my_adr: ForestAddr) -> RouterCore {
    let config = RouterConfig {
        my_adr,
        net_mgr_adr: None,
        net_mgr_ip: None,
        connect_comt: 1,
        client_sig_comt: 2,
        net_sig_comt: 3,
    };
    RouterCore::new(config, 64, 64)
}

fn register_link(
    core: &mut RouterCore,
    lnk: u32,
    iface: u32,
    peer_adr: ForestAddr,
    peer_type: PeerType,
    nonce: u64,
) {
    if !core.ifaces.valid(iface) {
        core.ifaces
            .add(iface, std::net::Ipv4Addr::UNSPECIFIED, 0, RateSpec::new(10_000_000, 10_000_000, 100_000, 100_000))
            .unwrap();
    }
    core.links
        .add(
            lnk,
            iface,
            std::net::Ipv4Addr::new(10, 0, 0, lnk as u8),
            4000 + lnk as u16,
            peer_adr,
            peer_type,
            nonce,
            RateSpec::new(1_000_000, 1_000_000, 1000, 1000),
        )
        .unwrap();
    core.links.connect(lnk, std::net::Ipv4Addr::new(10, 0, 0, lnk as u8), 4000 + lnk as u16).unwrap();
}

fn data_packet(comt: u32, src: ForestAddr, dst: ForestAddr, payload: &[u8]) -> Packet {
    let header = Header {
        version: Header::CURRENT_VERSION,
        length: forest_router::packet::HDR_LENGTH as u16 + payload.len() as u16,
        ptype: PacketType::ClientData,
        flags: 0,
        comtree: comt,
        src_adr: src,
        dst_adr: dst,
    };
    let mut p = Packet::new(header);
    p.payload.set(payload);
    p
}

#[test]
fn unicast_forward_with_known_route_enqueues_on_the_routed_link() {
    let my_adr = ForestAddr::new(1, 1);
    let mut core = new_core(my_adr);

    register_link(&mut core, 1, 1, ForestAddr::new(1, 2), PeerType::Client, 1);
    register_link(&mut core, 2, 1, ForestAddr::new(1, 3), PeerType::Client, 2);
    core.comtrees.add(500, 0, false).unwrap();
    core.comtrees.add_member_link(500, 1, ComtreeLinkInfo::default()).unwrap();
    core.comtrees.add_member_link(500, 2, ComtreeLinkInfo::default()).unwrap();
    core.queues.register_link(2, 8_000_000, 0);

    let dest = ForestAddr::new(1, 3);
    core.routes.add_unicast(500, dest, 2).unwrap();

    let mut packet = data_packet(500, ForestAddr::new(1, 2), dest, b"hello");
    packet.in_link = 1;
    let px = core.store.alloc(&packet);
    assert_ne!(px, 0);

    core.forward(px);

    assert_eq!(core.queues.qlen_pkts(2), 1, "packet should land on the routed link's queue");
    assert_eq!(core.queues.qlen_pkts(1), 0, "must never echo back on the incoming link");
}

#[test]
fn unicast_forward_without_route_floods_with_rte_req_set() {
    let my_adr = ForestAddr::new(1, 1);
    let mut core = new_core(my_adr);

    register_link(&mut core, 1, 1, ForestAddr::new(1, 2), PeerType::Router, 1);
    register_link(&mut core, 2, 1, ForestAddr::new(2, 1), PeerType::Router, 2);
    register_link(&mut core, 3, 1, ForestAddr::new(3, 1), PeerType::Router, 3);
    core.comtrees.add(500, 0, false).unwrap();
    core.comtrees.add_router_link(500, 1, false, ComtreeLinkInfo::default()).unwrap();
    core.comtrees.add_router_link(500, 2, false, ComtreeLinkInfo::default()).unwrap();
    core.comtrees.add_router_link(500, 3, false, ComtreeLinkInfo::default()).unwrap();
    core.queues.register_link(2, 8_000_000, 0);
    core.queues.register_link(3, 8_000_000, 0);

    let dest = ForestAddr::new(9, 9);
    let mut packet = data_packet(500, ForestAddr::new(1, 2), dest, b"flood me");
    packet.in_link = 1;
    let px = core.store.alloc(&packet);

    core.forward(px);

    assert_eq!(core.queues.qlen_pkts(1), 0, "incoming link must be excluded from the flood");
    assert_eq!(core.queues.qlen_pkts(2), 1);
    assert_eq!(core.queues.qlen_pkts(3), 1);
}

#[test]
fn connect_nonce_handshake_remaps_link_and_acks() {
    let my_adr = ForestAddr::new(1, 1);
    let mut core = new_core(my_adr);

    let peer_adr = ForestAddr::new(5, 5);
    core.links
        .add(
            7,
            1,
            std::net::Ipv4Addr::UNSPECIFIED,
            0,
            peer_adr,
            PeerType::Client,
            0xdead_beef_0001_0002,
            RateSpec::new(1000, 1000, 100, 100),
        )
        .unwrap();
    core.comtrees.add(1, 0, false).unwrap();
    core.comtrees.add_member_link(1, 7, ComtreeLinkInfo::default()).unwrap();
    core.queues.register_link(7, 8_000_000, 0);

    let header = Header {
        version: Header::CURRENT_VERSION,
        length: forest_router::packet::HDR_LENGTH as u16 + 8,
        ptype: PacketType::Connect,
        flags: 0,
        comtree: 1,
        src_adr: peer_adr,
        dst_adr: my_adr,
    };
    let mut packet = Packet::new(header);
    packet.payload.set_word(0, 0xdead_beef);
    packet.payload.set_word(1, 0x0001_0002);
    packet.in_link = 7;
    packet.tun_src_ip = std::net::Ipv4Addr::new(172, 16, 0, 9);
    packet.tun_src_port = 5000;

    let px = core.store.alloc(&packet);
    core.handle_conn_disc(px);

    assert!(core.links.get(7).unwrap().connected);
    assert_eq!(core.links.lookup_by_addr(std::net::Ipv4Addr::new(172, 16, 0, 9), 5000), Some(7));
    assert_eq!(core.queues.qlen_pkts(7), 1, "an ACK reply should be enqueued back to the peer");
}

#[test]
fn subscribe_installs_multicast_route_and_propagates_to_parent() {
    let my_adr = ForestAddr::new(1, 1);
    let mut core = new_core(my_adr);

    register_link(&mut core, 1, 1, ForestAddr::new(2, 1), PeerType::Router, 1); // parent
    register_link(&mut core, 2, 1, ForestAddr::new(1, 2), PeerType::Client, 2); // child
    core.comtrees.add(500, 1, false).unwrap();
    core.comtrees.add_router_link(500, 1, false, ComtreeLinkInfo::default()).unwrap();
    core.comtrees.add_member_link(500, 2, ComtreeLinkInfo::default()).unwrap();
    core.queues.register_link(1, 8_000_000, 0);

    let mcast = ForestAddr(0x8000_0005);
    let header = Header {
        version: Header::CURRENT_VERSION,
        length: forest_router::packet::HDR_LENGTH as u16 + 12,
        ptype: PacketType::SubUnsub,
        flags: 0,
        comtree: 500,
        src_adr: ForestAddr::new(1, 2),
        dst_adr: my_adr,
    };
    let mut packet = Packet::new(header);
    packet.payload.set_word(0, 1); // addCount = 1
    packet.payload.set_word(1, mcast.raw());
    packet.payload.set_word(2, 0); // dropCount = 0
    packet.in_link = 2;

    let px = core.store.alloc(&packet);
    core.sub_unsub(px);

    assert!(core.routes.valid(500, mcast));
    assert_eq!(core.queues.qlen_pkts(1), 1, "subscribe must propagate up the parent link");
}

#[test]
fn pkt_check_rejects_spoofed_source_from_untrusted_peer() {
    let my_adr = ForestAddr::new(1, 1);
    let mut core = new_core(my_adr);
    register_link(&mut core, 1, 1, ForestAddr::new(1, 2), PeerType::Client, 1);
    core.setup().unwrap();

    let header = Header {
        version: Header::CURRENT_VERSION,
        length: forest_router::packet::HDR_LENGTH as u16,
        ptype: PacketType::ClientData,
        flags: 0,
        comtree: 500,
        src_adr: ForestAddr::new(9, 9), // spoofed: link's peer is 1.2
        dst_adr: my_adr,
    };
    assert!(!core.pkt_check(&header, 1, forest_router::packet::HDR_LENGTH));
}

#[test]
fn pkt_check_accepts_trusted_router_peer_regardless_of_source() {
    let my_adr = ForestAddr::new(1, 1);
    let mut core = new_core(my_adr);
    register_link(&mut core, 1, 1, ForestAddr::new(1, 2), PeerType::Router, 1);
    core.setup().unwrap();

    let header = Header {
        version: Header::CURRENT_VERSION,
        length: forest_router::packet::HDR_LENGTH as u16,
        ptype: PacketType::ClientData,
        flags: flags::RTE_REQ,
        comtree: 500,
        src_adr: ForestAddr::new(9, 9),
        dst_adr: my_adr,
    };
    assert!(core.pkt_check(&header, 1, forest_router::packet::HDR_LENGTH));
}
