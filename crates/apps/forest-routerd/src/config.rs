//! Line-oriented table-file reader/writer for the four router tables
//! (interface, link, comtree, route), in the style of the teacher's
//! section-free `Config::from_ini`: a leading record count, `#`-comments,
//! blank lines skipped, one record per line.
//!
//! `forest-router` never touches a filesystem; this module is the only
//! place in the workspace that parses configuration text, and it builds
//! the core library's table types directly.

use std::net::Ipv4Addr;

use anyhow::{anyhow, bail, Context, Result};
use forest_router::address::ForestAddr;
use forest_router::packet::PeerType;
use forest_router::rate::RateSpec;
use forest_router::tables::comtree::{ComtreeLinkInfo, ComtreeTable};
use forest_router::tables::iface::IfaceTable;
use forest_router::tables::link::LinkTable;
use forest_router::tables::route::RouteTable;
use forest_router::stats::{CounterKind, StatItem};

fn peer_type_from_word(word: u32) -> Result<PeerType> {
    Ok(match word {
        0 => PeerType::Client,
        1 => PeerType::Server,
        2 => PeerType::Router,
        3 => PeerType::Controller,
        4 => PeerType::Undef,
        other => bail!("unknown peer type word {other}"),
    })
}

fn peer_type_to_word(peer_type: PeerType) -> u32 {
    peer_type as u32
}

pub fn parse_forest_addr(token: &str) -> Result<ForestAddr> {
    if let Some((zip, local)) = token.split_once('.') {
        let zip: u16 = zip.parse().with_context(|| format!("bad zip in address {token}"))?;
        let local: u16 = local.parse().with_context(|| format!("bad local in address {token}"))?;
        return Ok(ForestAddr::new(zip, local));
    }
    let raw: i64 = token.parse().with_context(|| format!("bad forest address {token}"))?;
    Ok(ForestAddr(raw as u32))
}

fn format_forest_addr(adr: ForestAddr) -> String {
    if adr.is_multicast() {
        (adr.raw() as i32).to_string()
    } else {
        format!("{}.{}", adr.zip(), adr.local())
    }
}

fn parse_rate_spec(token: &str) -> Result<RateSpec> {
    let parts: Vec<&str> = token.split(',').collect();
    if parts.len() != 4 {
        bail!("rate spec {token} must have 4 comma-separated fields");
    }
    let mut v = [0u32; 4];
    for (i, p) in parts.iter().enumerate() {
        v[i] = p.parse().with_context(|| format!("bad rate component {p} in {token}"))?;
    }
    Ok(RateSpec::new(v[0], v[1], v[2], v[3]))
}

fn format_rate_spec(rs: RateSpec) -> String {
    format!("{},{},{},{}", rs.bit_rate_up, rs.bit_rate_down, rs.pkt_rate_up, rs.pkt_rate_down)
}

/// Strip a trailing `#`-comment and surrounding whitespace from one line.
fn clean_line(raw: &str) -> Option<&str> {
    let line = match raw.find('#') {
        Some(idx) => &raw[..idx],
        None => raw,
    };
    let line = line.trim();
    if line.is_empty() {
        None
    } else {
        Some(line)
    }
}

/// Iterate the non-blank, non-comment, comment-stripped lines of a table
/// file, yielding the declared record count first.
fn record_lines(text: &str) -> Result<(usize, Vec<&str>)> {
    let mut lines = text.lines().filter_map(clean_line);
    let count: usize = lines
        .next()
        .ok_or_else(|| anyhow!("empty table file"))?
        .parse()
        .context("first non-comment line must be a record count")?;
    let records: Vec<&str> = lines.collect();
    if records.len() != count {
        bail!("table file declares {count} records but has {}", records.len());
    }
    Ok((count, records))
}

pub fn read_iface_table(text: &str) -> Result<IfaceTable> {
    let (_, records) = record_lines(text)?;
    let mut table = IfaceTable::new();
    for (lineno, record) in records.iter().enumerate() {
        let fields: Vec<&str> = record.split_whitespace().collect();
        if fields.len() != 6 {
            bail!("interface record {lineno}: expected 6 fields, got {}", fields.len());
        }
        let iface: u32 = fields[0].parse().context("iface number")?;
        let ip: Ipv4Addr = fields[1].parse().context("interface ip")?;
        let _first_link: u32 = fields[2].parse().context("firstLink")?;
        let _last_link: u32 = fields[3].parse().context("lastLink")?;
        let bit_rate: u32 = fields[4].parse().context("bitRate")?;
        let pkt_rate: u32 = fields[5].parse().context("pktRate")?;
        let rates = RateSpec::new(bit_rate, bit_rate, pkt_rate, pkt_rate);
        table
            .add(iface, ip, forest_router::ROUTER_PORT, rates)
            .with_context(|| format!("adding interface {iface}"))?;
    }
    Ok(table)
}

pub fn write_iface_table(table: &IfaceTable) -> String {
    let mut ifaces: Vec<_> = table.iter().collect();
    ifaces.sort_by_key(|(&id, _)| id);
    let mut out = format!("{}\n", ifaces.len());
    out.push_str("# iface  ip  firstLink  lastLink  bitRate  pktRate\n");
    for (&id, entry) in ifaces {
        out.push_str(&format!(
            "{id} {} 0 0 {} {}\n",
            entry.local_ip, entry.rates.bit_rate_up, entry.rates.pkt_rate_up
        ));
    }
    out
}

pub fn read_link_table(text: &str) -> Result<LinkTable> {
    let (_, records) = record_lines(text)?;
    let mut table = LinkTable::new();
    for (lineno, record) in records.iter().enumerate() {
        let fields: Vec<&str> = record.split_whitespace().collect();
        if fields.len() != 7 {
            bail!("link record {lineno}: expected 7 fields, got {}", fields.len());
        }
        let lnk: u32 = fields[0].parse().context("link number")?;
        let iface: u32 = fields[1].parse().context("iface number")?;
        let (ip_str, port_str) = fields[2]
            .split_once(':')
            .ok_or_else(|| anyhow!("link record {lineno}: peer address must be ip:port"))?;
        let peer_ip: Ipv4Addr = ip_str.parse().context("peer ip")?;
        let peer_port: u16 = port_str.parse().context("peer port")?;
        let peer_type_word: u32 = fields[3].parse().context("peer type word")?;
        let peer_type = peer_type_from_word(peer_type_word)?;
        let peer_adr = parse_forest_addr(fields[4])?;
        let rates = parse_rate_spec(fields[5])?;
        let nonce: u64 = fields[6].parse().context("nonce")?;
        table
            .add(lnk, iface, peer_ip, peer_port, peer_adr, peer_type, nonce, rates)
            .with_context(|| format!("adding link {lnk}"))?;
    }
    Ok(table)
}

pub fn write_link_table(table: &LinkTable) -> String {
    let mut links: Vec<_> = table.iter().collect();
    links.sort_by_key(|(&id, _)| id);
    let mut out = format!("{}\n", links.len());
    out.push_str("# link  iface  peerIp:port  peerType  peerAdr  rates  nonce\n");
    for (&id, entry) in links {
        out.push_str(&format!(
            "{id} {} {}:{} {} {} {} {}\n",
            entry.iface,
            entry.peer_ip,
            entry.peer_port,
            peer_type_to_word(entry.peer_type),
            format_forest_addr(entry.peer_adr),
            format_rate_spec(entry.rates),
            entry.nonce,
        ));
    }
    out
}

pub fn read_comtree_table(text: &str) -> Result<ComtreeTable> {
    let (_, records) = record_lines(text)?;
    let mut table = ComtreeTable::new();
    for (lineno, record) in records.iter().enumerate() {
        let fields: Vec<&str> = record.split_whitespace().collect();
        if fields.len() != 5 {
            bail!("comtree record {lineno}: expected 5 fields, got {}", fields.len());
        }
        let comt: u32 = fields[0].parse().context("comtree number")?;
        let core_flag: bool = fields[1] != "0";
        let parent_link: u32 = fields[2].parse().context("parent link")?;
        table.add(comt, parent_link, core_flag).with_context(|| format!("adding comtree {comt}"))?;

        let core_links: Vec<u32> = parse_link_list(fields[4])?;
        let router_links: Vec<u32> = parse_link_list(fields[3])?;
        for lnk in &router_links {
            let is_core = core_links.contains(lnk);
            table
                .add_router_link(comt, *lnk, is_core, ComtreeLinkInfo::default())
                .with_context(|| format!("comtree {comt} router link {lnk}"))?;
        }
    }
    Ok(table)
}

fn parse_link_list(token: &str) -> Result<Vec<u32>> {
    if token == "-" {
        return Ok(Vec::new());
    }
    token
        .split(',')
        .map(|s| s.parse::<u32>().with_context(|| format!("bad link id {s} in list {token}")))
        .collect()
}

pub fn write_comtree_table(table: &ComtreeTable) -> String {
    let mut comtrees = Vec::new();
    let mut comt = table.first();
    while let Some(id) = comt {
        comtrees.push(id);
        comt = table.next(id);
    }
    let mut out = format!("{}\n", comtrees.len());
    out.push_str("# comtree  coreFlag  parentLink  routerLinks  coreLinks\n");
    for id in comtrees {
        let entry = table.get(id).expect("iterated id must be present");
        let mut router: Vec<u32> = entry.router_links.iter().copied().collect();
        router.sort_unstable();
        let mut core: Vec<u32> = entry.core_links.iter().copied().collect();
        core.sort_unstable();
        let router_str = if router.is_empty() {
            "-".to_string()
        } else {
            router.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
        };
        let core_str = if core.is_empty() {
            "-".to_string()
        } else {
            core.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
        };
        out.push_str(&format!(
            "{id} {} {} {router_str} {core_str}\n",
            entry.core_flag as u8, entry.parent_link
        ));
    }
    out
}

pub fn read_route_table(text: &str) -> Result<RouteTable> {
    let (_, records) = record_lines(text)?;
    let mut table = RouteTable::new();
    for (lineno, record) in records.iter().enumerate() {
        let fields: Vec<&str> = record.split_whitespace().collect();
        if fields.len() != 3 {
            bail!("route record {lineno}: expected 3 fields, got {}", fields.len());
        }
        let comt: u32 = fields[0].parse().context("comtree number")?;
        let dest = parse_forest_addr(fields[1])?;
        if dest.is_multicast() {
            let links = parse_link_list(fields[2])?;
            for lnk in links {
                table.add_link(comt, dest, lnk).with_context(|| format!("route ({comt},{dest})"))?;
            }
        } else {
            let lnk: u32 = fields[2].parse().context("unicast out-link")?;
            table.add_unicast(comt, dest, lnk).with_context(|| format!("route ({comt},{dest})"))?;
        }
    }
    Ok(table)
}

pub fn write_route_table(table: &RouteTable) -> String {
    use forest_router::tables::route::RouteTarget;
    let mut rows: Vec<_> = table.iter().collect();
    rows.sort_by_key(|((comt, dest), _)| (*comt, dest.raw()));
    let mut out = format!("{}\n", rows.len());
    out.push_str("# comtree  dest  link-or-link-list\n");
    for ((comt, dest), target) in rows {
        let link_field = match target {
            RouteTarget::Unicast(lnk) => lnk.to_string(),
            RouteTarget::Multicast(links) => {
                let mut sorted: Vec<u32> = links.iter().copied().collect();
                sorted.sort_unstable();
                sorted.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
            }
        };
        out.push_str(&format!("{comt} {} {link_field}\n", format_forest_addr(*dest)));
    }
    out
}

fn counter_kind_from_word(word: &str) -> Result<CounterKind> {
    Ok(match word {
        "inPkt" => CounterKind::InPkt,
        "outPkt" => CounterKind::OutPkt,
        "inByte" => CounterKind::InByte,
        "outByte" => CounterKind::OutByte,
        "qPkt" => CounterKind::QPkt,
        "qByte" => CounterKind::QByte,
        other => bail!("unknown counter kind {other}"),
    })
}

fn counter_kind_to_word(kind: CounterKind) -> &'static str {
    match kind {
        CounterKind::InPkt => "inPkt",
        CounterKind::OutPkt => "outPkt",
        CounterKind::InByte => "inByte",
        CounterKind::OutByte => "outByte",
        CounterKind::QPkt => "qPkt",
        CounterKind::QByte => "qByte",
    }
}

/// `statSpec` file: one `(link, queue, kind)` triple per line, registered
/// with `StatsModule::watch` on startup.
pub fn read_stat_spec(text: &str) -> Result<Vec<StatItem>> {
    let (_, records) = record_lines(text)?;
    let mut items = Vec::with_capacity(records.len());
    for (lineno, record) in records.iter().enumerate() {
        let fields: Vec<&str> = record.split_whitespace().collect();
        if fields.len() != 3 {
            bail!("statSpec record {lineno}: expected 3 fields, got {}", fields.len());
        }
        let lnk: u32 = fields[0].parse().context("link number")?;
        let queue: u32 = fields[1].parse().context("queue number")?;
        let kind = counter_kind_from_word(fields[2])?;
        items.push(StatItem { lnk, queue, kind });
    }
    Ok(items)
}

pub fn write_stat_spec(items: &[StatItem]) -> String {
    let mut out = format!("{}\n", items.len());
    out.push_str("# link  queue  kind\n");
    for item in items {
        out.push_str(&format!("{} {} {}\n", item.lnk, item.queue, counter_kind_to_word(item.kind)));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iface_table_round_trips() {
        let mut t = IfaceTable::new();
        t.add(1, Ipv4Addr::new(10, 0, 0, 1), 0, RateSpec::new(1000, 1000, 100, 100)).unwrap();
        t.add(2, Ipv4Addr::new(10, 0, 0, 2), 0, RateSpec::new(2000, 2000, 200, 200)).unwrap();
        let text = write_iface_table(&t);
        let back = read_iface_table(&text).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.get(1).unwrap().local_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(back.get(2).unwrap().rates.bit_rate_up, 2000);
    }

    #[test]
    fn link_table_round_trips() {
        let mut t = LinkTable::new();
        t.add(
            5,
            1,
            Ipv4Addr::new(10, 0, 0, 9),
            4000,
            ForestAddr::new(1, 2),
            PeerType::Client,
            5,
            RateSpec::new(1000, 1000, 100, 100),
        )
        .unwrap();
        let text = write_link_table(&t);
        let back = read_link_table(&text).unwrap();
        let entry = back.get(5).unwrap();
        assert_eq!(entry.peer_ip, Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(entry.peer_port, 4000);
        assert_eq!(entry.peer_adr, ForestAddr::new(1, 2));
        assert_eq!(entry.peer_type, PeerType::Client);
    }

    #[test]
    fn comtree_table_round_trips_with_core_subset_of_router() {
        let mut t = ComtreeTable::new();
        t.add(500, 1, false).unwrap();
        t.add_router_link(500, 1, true, ComtreeLinkInfo::default()).unwrap();
        t.add_router_link(500, 2, false, ComtreeLinkInfo::default()).unwrap();
        let text = write_comtree_table(&t);
        let back = read_comtree_table(&text).unwrap();
        assert!(back.is_core_link(500, 1));
        assert!(!back.is_core_link(500, 2));
        assert!(back.in_comtree(500, 2));
    }

    #[test]
    fn route_table_round_trips_unicast_and_multicast() {
        let mut t = RouteTable::new();
        t.add_unicast(1001, ForestAddr::new(2, 1), 7).unwrap();
        t.add_link(1001, ForestAddr(0x8000_0005), 3).unwrap();
        t.add_link(1001, ForestAddr(0x8000_0005), 4).unwrap();
        let text = write_route_table(&t);
        let back = read_route_table(&text).unwrap();
        assert!(back.valid(1001, ForestAddr::new(2, 1)));
        match back.lookup(1001, ForestAddr(0x8000_0005)) {
            Some(forest_router::tables::route::RouteTarget::Multicast(links)) => {
                assert_eq!(links.len(), 2);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn stat_spec_round_trips() {
        let items = vec![
            StatItem { lnk: 1, queue: 0, kind: CounterKind::InPkt },
            StatItem { lnk: 2, queue: 3, kind: CounterKind::QByte },
        ];
        let text = write_stat_spec(&items);
        let back = read_stat_spec(&text).unwrap();
        assert_eq!(back, items);
    }

    #[test]
    fn rejects_mismatched_record_count() {
        let text = "3\n1 1 10.0.0.1:1 0 1.1 10,10,1,1 1\n";
        assert!(read_link_table(text).is_err());
    }

    #[test]
    fn blank_lines_and_comments_are_skipped() {
        let text = "\n# a comment\n1\n\n5 1 10.0.0.1:4000 2 1.2 10,10,1,1 5 # trailing comment\n";
        let t = read_link_table(text).unwrap();
        assert_eq!(t.len(), 1);
    }
}
