//! Exercises the table-file readers against real files on disk, not just
//! in-memory strings, the way the teacher's storage tests use
//! `tempfile::tempdir()` rather than asserting against string literals.

use std::fs;

use forest_router::address::ForestAddr;
use forest_router::packet::PeerType;
use forest_router::rate::RateSpec;
use forest_router::tables::comtree::ComtreeTable;
use forest_router::tables::iface::IfaceTable;
use forest_router::tables::link::LinkTable;
use forest_router::tables::route::{RouteTable, RouteTarget};
use forest_routerd::config;

#[test]
fn iface_table_round_trips_through_a_real_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ifTbl");

    let mut t = IfaceTable::new();
    t.add(1, "10.0.0.1".parse().unwrap(), 0, RateSpec::new(1000, 1000, 100, 100)).unwrap();
    t.add(2, "10.0.0.2".parse().unwrap(), 0, RateSpec::new(2000, 2000, 200, 200)).unwrap();
    fs::write(&path, config::write_iface_table(&t)).unwrap();

    let text = fs::read_to_string(&path).unwrap();
    let back = config::read_iface_table(&text).unwrap();
    assert_eq!(back.len(), 2);
    assert_eq!(back.get(2).unwrap().rates.bit_rate_up, 2000);
}

#[test]
fn link_and_comtree_and_route_tables_round_trip_through_real_files() {
    let dir = tempfile::tempdir().unwrap();

    let mut links = LinkTable::new();
    links
        .add(
            5,
            1,
            "10.0.0.9".parse().unwrap(),
            4000,
            ForestAddr::new(1, 2),
            PeerType::Router,
            0xabc,
            RateSpec::new(1000, 1000, 100, 100),
        )
        .unwrap();
    let lnk_path = dir.path().join("lnkTbl");
    fs::write(&lnk_path, config::write_link_table(&links)).unwrap();
    let back_links = config::read_link_table(&fs::read_to_string(&lnk_path).unwrap()).unwrap();
    assert_eq!(back_links.get(5).unwrap().peer_type, PeerType::Router);

    let mut comtrees = ComtreeTable::new();
    comtrees.add(1001, 5, true).unwrap();
    comtrees
        .add_router_link(1001, 5, true, Default::default())
        .unwrap();
    let comt_path = dir.path().join("comtTbl");
    fs::write(&comt_path, config::write_comtree_table(&comtrees)).unwrap();
    let back_comtrees = config::read_comtree_table(&fs::read_to_string(&comt_path).unwrap()).unwrap();
    assert!(back_comtrees.is_core_link(1001, 5));

    let mut routes = RouteTable::new();
    routes.add_unicast(1001, ForestAddr::new(9, 9), 5).unwrap();
    let rte_path = dir.path().join("rteTbl");
    fs::write(&rte_path, config::write_route_table(&routes)).unwrap();
    let back_routes = config::read_route_table(&fs::read_to_string(&rte_path).unwrap()).unwrap();
    match back_routes.lookup(1001, ForestAddr::new(9, 9)) {
        Some(RouteTarget::Unicast(lnk)) => assert_eq!(*lnk, 5),
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn reading_a_missing_file_reports_its_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("does-not-exist");
    assert!(fs::read_to_string(&path).is_err());
}
