//! The main packet-processing loop: validation, forwarding, multicast
//! fan-out, route discovery, and control-packet dispatch (spec §4.5).

use std::collections::HashSet;
use std::time::Duration;

use crate::address::ForestAddr;
use crate::control::{Attributes, CpMode, ControlMessage, CpType, PendingRequests};
use crate::error::Result;
use crate::io::IoProcessor;
use crate::packet::{flags, Header, Packet, PacketType, PeerType};
use crate::packet_log::{LogDirection, PacketLog};
use crate::queue::QueueManager;
use crate::rate::RateSpec;
use crate::stats::StatsModule;
use crate::store::{PacketStore, Px};
use crate::tables::comtree::{ComtreeLinkInfo, ComtreeTable};
use crate::tables::iface::IfaceTable;
use crate::tables::link::{LinkId, LinkTable};
use crate::tables::route::{ComtreeId, RouteTable, RouteTarget};

/// At most one control-packet step is taken for every this-many
/// otherwise-busy iterations, so control traffic can't starve the
/// data plane nor be starved by it (spec §4.5 step 3).
const CONTROL_STEP_BUDGET: i32 = 20;
const STATS_PERIOD: Duration = Duration::from_millis(300);
const IDLE_SLEEP: Duration = Duration::from_millis(1);
/// spec §4.5 `subUnsub`: addCount + dropCount must not exceed this.
const MAX_SUBUNSUB_ADDRS: usize = 350;

pub struct RouterConfig {
    pub my_adr: ForestAddr,
    pub net_mgr_adr: Option<ForestAddr>,
    /// `(ip, port)` of the network manager's boot socket, used by
    /// `send_packet` when `lnk == 0` (self-originated traffic before any
    /// link is up). `None` outside `remote` boot mode.
    pub net_mgr_ip: Option<(std::net::Ipv4Addr, u16)>,
    pub connect_comt: ComtreeId,
    pub client_sig_comt: ComtreeId,
    pub net_sig_comt: ComtreeId,
}

pub struct RouterCore {
    pub config: RouterConfig,
    pub store: PacketStore,
    pub ifaces: IfaceTable,
    pub links: LinkTable,
    pub comtrees: ComtreeTable,
    pub routes: RouteTable,
    pub queues: QueueManager,
    pub io: IoProcessor,
    pub stats: StatsModule,
    pub pending: PendingRequests,
    pub packet_log: PacketLog,
    control_queue: std::collections::VecDeque<Px>,
    next_seq_num: u64,
    next_queue_id: u32,
    booting: bool,
    control_credit: i32,
    since_stats: Duration,
    now_ns: u64,
    /// `[first_leaf_adr, last_leaf_adr]` set by `SET_LEAF_RANGE`; `ADD_LINK`
    /// for a client peer is rejected outside this range once it is set
    /// (spec §6 `setLeafRange`).
    leaf_range: Option<(ForestAddr, ForestAddr)>,
}

impl RouterCore {
    pub fn new(config: RouterConfig, n_descriptors: usize, m_buffers: usize) -> Self {
        Self {
            config,
            store: PacketStore::new(n_descriptors, m_buffers),
            ifaces: IfaceTable::new(),
            links: LinkTable::new(),
            comtrees: ComtreeTable::new(),
            routes: RouteTable::new(),
            queues: QueueManager::new(),
            io: IoProcessor::new(),
            stats: StatsModule::new(),
            pending: PendingRequests::new(),
            packet_log: PacketLog::new(1000),
            control_queue: std::collections::VecDeque::new(),
            next_seq_num: 1,
            next_queue_id: 1,
            booting: true,
            control_credit: CONTROL_STEP_BUDGET,
            since_stats: Duration::ZERO,
            now_ns: 0,
            leaf_range: None,
        }
    }

    pub fn is_booting(&self) -> bool {
        self.booting
    }

    /// spec §4.5 `handleControlReply`: on a successful `BOOT_ROUTER`
    /// reply, run setup and leave normal (non-booting) operation.
    ///
    /// `setupIfaces`/`setupLeafAddresses`/`addLocalRoutes` are driven by
    /// the daemon's config loader before this is called (it populates
    /// `ifaces`/`links`/`comtrees`/`routes` directly); what's left here
    /// is `setupQueues` (registering every known link with the
    /// scheduler) and `setAvailRates`.
    pub fn setup(&mut self) -> Result<()> {
        let links: Vec<LinkId> = self.links.iter().map(|(&id, _)| id).collect();
        for lnk in links {
            let entry = self.links.get(lnk).expect("iterated id must be present");
            let min_delta_ns = 1_000_000_000 / entry.rates.pkt_rate_up.max(1) as u64;
            self.queues.register_link(lnk, entry.rates.bit_rate_up.max(1) as u64, min_delta_ns);
        }
        self.set_avail_rates()?;
        self.booting = false;
        Ok(())
    }

    /// spec §4.6 `setAvailRates`: establish the interface ≥ Σlinks ≥
    /// Σcomtree-links rate hierarchy, scaling each link's own available
    /// rate to 90% of its committed rate.
    fn set_avail_rates(&mut self) -> Result<()> {
        for (_, iface) in self.ifaces.iter_mut() {
            iface.avail_rates = iface.rates;
        }

        let link_ifaces: Vec<(LinkId, u32, RateSpec)> =
            self.links.iter().map(|(&id, e)| (id, e.iface, e.rates)).collect();
        for (lnk, iface_id, rates) in link_ifaces {
            let iface = self
                .ifaces
                .get_mut(iface_id)
                .ok_or_else(|| crate::error::ForestError::StartupInvariant(format!("link {lnk} has no iface")))?;
            if !iface.avail_rates.covers(rates) {
                return Err(crate::error::ForestError::StartupInvariant(format!(
                    "iface {iface_id} oversubscribed by link {lnk}"
                )));
            }
            iface.avail_rates = iface.avail_rates.saturating_sub(rates);
            if let Some(entry) = self.links.get_mut(lnk) {
                entry.avail_rates = rates.scaled_percent(90);
            }
        }

        let comtree_ids: Vec<ComtreeId> = self.comtrees.iter().map(|(&id, _)| id).collect();
        for comt in comtree_ids {
            let pairs: Vec<(LinkId, RateSpec)> = self
                .comtrees
                .get(comt)
                .map(|e| e.link_info.iter().map(|(&lnk, info)| (lnk, info.rates)).collect())
                .unwrap_or_default();
            for (lnk, rates) in pairs {
                let Some(link) = self.links.get_mut(lnk) else { continue };
                if !link.avail_rates.covers(rates) {
                    return Err(crate::error::ForestError::StartupInvariant(format!(
                        "link {lnk} oversubscribed by comtree {comt}"
                    )));
                }
                link.avail_rates = link.avail_rates.saturating_sub(rates);
            }
        }
        Ok(())
    }

    /// spec §4.5 `pktCheck`.
    pub fn pkt_check(&self, header: &Header, in_link: LinkId, wire_len: usize) -> bool {
        if header.version != Header::CURRENT_VERSION {
            return false;
        }
        if header.length as usize != wire_len || (header.length as usize) < crate::packet::HDR_LENGTH {
            return false;
        }

        if self.booting {
            return header.ptype == PacketType::NetSig
                && header.comtree == self.config.net_sig_comt
                && self.config.net_mgr_adr == Some(header.src_adr)
                && header.dst_adr == self.config.my_adr;
        }

        let Some(link) = self.links.get(in_link) else { return false };
        if !link.peer_type.is_untrusted() {
            return true;
        }

        if link.peer_adr != header.src_adr {
            return false;
        }

        match header.ptype {
            PacketType::Connect | PacketType::Disconnect => header.comtree == self.config.connect_comt,
            PacketType::ClientSig => header.comtree == self.config.client_sig_comt,
            PacketType::ClientData | PacketType::SubUnsub | PacketType::RteReply | PacketType::NetSig => true,
        }
    }

    /// spec §4.5 `forward`.
    pub fn forward(&mut self, px: Px) {
        let header = *self.store.header(px);
        let comt = header.comtree;
        let dest = header.dst_adr;
        let in_link = self.store.in_link(px);

        match self.routes.lookup(comt, dest).cloned() {
            Some(RouteTarget::Unicast(out_link)) => {
                if header.has_flag(flags::RTE_REQ) {
                    self.send_rte_reply(px);
                    self.store.header_mut(px).clear_flag(flags::RTE_REQ);
                }
                if out_link == in_link || !self.enqueue_on_link(px, out_link) {
                    self.stats.record_discard(out_link);
                    self.store.free(px);
                }
            }
            Some(RouteTarget::Multicast(links)) => {
                self.multi_send(px, comt, Some(links));
            }
            None if dest.is_unicast() => {
                self.store.header_mut(px).set_flag(flags::RTE_REQ);
                self.multi_send(px, comt, None);
            }
            None => {
                self.stats.record_discard(in_link);
                self.store.free(px);
            }
        }
    }

    /// spec §4.5 `multiSend`. `route_links` is `Some` for an existing
    /// multicast route (subscriber fan-out); `None` means "no route yet",
    /// i.e. unicast flooding.
    fn multi_send(&mut self, px: Px, comt: ComtreeId, route_links: Option<HashSet<LinkId>>) {
        let in_link = self.store.in_link(px);
        let dest = self.store.header(px).dst_adr;

        let mut targets: Vec<LinkId> = Vec::new();
        let Some(entry) = self.comtrees.get(comt) else {
            self.store.free(px);
            return;
        };

        match route_links {
            None => {
                for &lnk in &entry.router_links {
                    if lnk == in_link {
                        continue;
                    }
                    if dest.zip() == self.config.my_adr.zip() {
                        if let Some(link) = self.links.get(lnk) {
                            if link.peer_adr.zip() != self.config.my_adr.zip() {
                                continue;
                            }
                        }
                    }
                    targets.push(lnk);
                }
            }
            Some(subscribers) => {
                for &lnk in &entry.core_links {
                    if lnk != in_link && lnk != entry.parent_link {
                        targets.push(lnk);
                    }
                }
                if entry.parent_link != 0 && entry.parent_link != in_link {
                    targets.push(entry.parent_link);
                }
                for lnk in subscribers {
                    if lnk != in_link {
                        targets.push(lnk);
                    }
                }
                targets.sort_unstable();
                targets.dedup();
            }
        }

        if targets.is_empty() {
            self.store.free(px);
            return;
        }

        let (last, rest) = targets.split_last().unwrap();
        for &lnk in rest {
            let cx = self.store.clone_packet(px);
            if cx == 0 {
                continue;
            }
            if !self.enqueue_on_link(cx, lnk) {
                self.store.free(cx);
            }
        }
        if !self.enqueue_on_link(px, *last) {
            self.store.free(px);
        }
    }

    /// spec §4.5 `sendRteReply`.
    fn send_rte_reply(&mut self, px: Px) {
        let header = *self.store.header(px);
        let in_link = self.store.in_link(px);
        let reply_header = Header {
            version: Header::CURRENT_VERSION,
            length: crate::packet::HDR_LENGTH as u16 + 8,
            ptype: PacketType::RteReply,
            flags: 0,
            comtree: header.comtree,
            src_adr: self.config.my_adr,
            dst_adr: header.src_adr,
        };
        let mut reply = Packet::new(reply_header);
        reply.payload.set_word(0, header.dst_adr.raw());
        let rx = self.store.alloc(&reply);
        if rx == 0 {
            return;
        }
        if !self.enqueue_on_link(rx, in_link) {
            self.store.free(rx);
        }
    }

    /// spec §4.5 `handleRteReply`.
    pub fn handle_rte_reply(&mut self, px: Px) {
        let header = *self.store.header(px);
        let in_link = self.store.in_link(px);
        let comt = header.comtree;

        if self.routes.valid(comt, header.dst_adr) && header.has_flag(flags::RTE_REQ) {
            self.send_rte_reply(px);
        }

        let embedded = self.store.payload(px).word(0).map(ForestAddr::from);
        match embedded {
            Some(that_adr) if that_adr.is_unicast() && !self.routes.valid(comt, that_adr) => {
                let _ = self.routes.add_unicast(comt, that_adr, in_link);
            }
            _ => {}
        }

        if !self.routes.valid(comt, header.dst_adr) {
            self.store.header_mut(px).set_flag(flags::RTE_REQ);
            self.multi_send(px, comt, None);
            return;
        }

        match self.routes.lookup(comt, header.dst_adr).cloned() {
            Some(RouteTarget::Unicast(out_link)) => {
                let is_router = self
                    .links
                    .get(out_link)
                    .map(|l| !l.peer_type.is_untrusted())
                    .unwrap_or(false);
                if is_router && out_link != in_link && self.enqueue_on_link(px, out_link) {
                    return;
                }
                self.store.free(px);
            }
            _ => self.store.free(px),
        }
    }

    /// spec §4.5 `subUnsub`. Applied only to packets from a non-parent,
    /// non-core neighbor; the caller is responsible for that check.
    pub fn sub_unsub(&mut self, px: Px) {
        let header = *self.store.header(px);
        let comt = header.comtree;
        let in_link = self.store.in_link(px);

        let payload_len = self.store.payload(px).len();
        let add_count = self.store.payload(px).word(0).unwrap_or(0) as usize;
        if add_count > MAX_SUBUNSUB_ADDRS || (add_count + 1) * 4 > payload_len {
            self.store.free(px);
            return;
        }
        let mut addrs = Vec::with_capacity(add_count);
        for i in 0..add_count {
            addrs.push(self.store.payload(px).word(1 + i).unwrap_or(0));
        }
        let drop_count_idx = 1 + add_count;
        let drop_count = self.store.payload(px).word(drop_count_idx).unwrap_or(0) as usize;
        if add_count + drop_count > MAX_SUBUNSUB_ADDRS || (drop_count_idx + 1 + drop_count) * 4 > payload_len {
            self.store.free(px);
            return;
        }
        let mut drops = Vec::with_capacity(drop_count);
        for i in 0..drop_count {
            drops.push(self.store.payload(px).word(drop_count_idx + 1 + i).unwrap_or(0));
        }

        let mut propagate = false;

        for (i, raw) in addrs.iter().enumerate() {
            let addr = ForestAddr::from(*raw);
            let already = matches!(
                self.routes.lookup(comt, addr),
                Some(RouteTarget::Multicast(links)) if links.contains(&in_link)
            );
            if already {
                self.store.payload_mut(px).set_word(1 + i, 0);
            } else {
                let _ = self.routes.add_link(comt, addr, in_link);
                propagate = true;
            }
        }

        for raw in &drops {
            let addr = ForestAddr::from(*raw);
            if self.routes.remove_link(comt, addr, in_link).is_ok() {
                if self.routes.no_links(comt, addr) {
                    let _ = self.routes.remove(comt, addr);
                }
                propagate = true;
            }
        }

        let in_core = self.comtrees.is_core_link(comt, in_link);
        let parent = self.comtrees.get(comt).map(|e| e.parent_link).unwrap_or(0);
        if propagate && !in_core && parent != 0 {
            self.enqueue_on_link(px, parent);
        } else {
            self.store.free(px);
        }
    }

    /// spec §4.5 `handleConnDisc`.
    pub fn handle_conn_disc(&mut self, px: Px) {
        let header = *self.store.header(px);
        let in_link = self.store.in_link(px);

        let Some(link) = self.links.get(in_link) else {
            self.store.free(px);
            return;
        };
        if link.peer_adr != header.src_adr {
            self.store.free(px);
            return;
        }
        let nonce_words = (
            self.store.payload(px).word(0).unwrap_or(0),
            self.store.payload(px).word(1).unwrap_or(0),
        );
        let got_nonce = ((nonce_words.0 as u64) << 32) | nonce_words.1 as u64;
        if got_nonce != link.nonce {
            self.store.free(px);
            return;
        }
        let peer_type = link.peer_type;

        match header.ptype {
            PacketType::Connect => {
                if self.links.get(in_link).map(|l| l.connected).unwrap_or(false) {
                    let _ = self.links.revert_entry(in_link);
                }
                let (ip, port) = self.store.tun_source(px);
                if self.links.connect(in_link, ip, port).is_ok() {
                    if peer_type == PeerType::Client {
                        if let Some(mgr) = self.config.net_mgr_adr {
                            self.send_cp_req(mgr, CpType::ClientConnect, Attributes {
                                link: Some(in_link),
                                adr1: Some(header.src_adr.raw()),
                                ..Attributes::default()
                            });
                        }
                    }
                }
            }
            PacketType::Disconnect => {
                let _ = self.links.revert_entry(in_link);
                if peer_type == PeerType::Client {
                    if let Some(mgr) = self.config.net_mgr_adr {
                        self.send_cp_req(mgr, CpType::ClientDisconnect, Attributes {
                            link: Some(in_link),
                            adr1: Some(header.src_adr.raw()),
                            ..Attributes::default()
                        });
                    }
                }
            }
            _ => {}
        }

        let mut ack_header = header;
        ack_header.set_flag(flags::ACK_FLAG);
        std::mem::swap(&mut ack_header.src_adr, &mut ack_header.dst_adr);
        *self.store.header_mut(px) = ack_header;
        if !self.enqueue_on_link(px, in_link) {
            self.store.free(px);
        }
    }

    /// spec §4.5 `sendCpReq`: allocate, encode, track in the pending map,
    /// and send a copy toward `dest`.
    fn send_cp_req(&mut self, dest: ForestAddr, cp_type: CpType, attrs: Attributes) {
        let seq = self.next_seq_num;
        self.next_seq_num += 1;
        let msg = ControlMessage::request(cp_type, seq, attrs);
        let Ok(bytes) = msg.encode() else { return };

        let header = Header {
            version: Header::CURRENT_VERSION,
            length: crate::packet::HDR_LENGTH as u16 + bytes.len() as u16,
            ptype: PacketType::NetSig,
            flags: 0,
            comtree: self.config.net_sig_comt,
            src_adr: self.config.my_adr,
            dst_adr: dest,
        };
        let mut packet = Packet::new(header);
        packet.payload.set(&bytes);
        let px = self.store.alloc(&packet);
        if px == 0 {
            return;
        }
        self.pending.track(dest, msg, Duration::from_nanos(self.now_ns));
        self.forward(px);
    }

    /// spec §3 lifecycle: dropping a link forces drop of all its
    /// comtree-link memberships (and their queues and routes).
    fn drop_link(&mut self, lnk: LinkId) -> Result<()> {
        let comtrees: Vec<u32> = self
            .links
            .get(lnk)
            .map(|l| l.comtrees.iter().copied().collect())
            .ok_or_else(|| crate::error::ForestError::TableConflict(format!("link {lnk} does not exist")))?;
        for comt in comtrees {
            if let Some(info) = self.comtrees.link_info(comt, lnk) {
                self.queues.free_queue(lnk, info.queue);
            }
            let _ = self.comtrees.remove_link(comt, lnk);
        }
        self.routes.purge_link(lnk);
        self.queues.unregister_link(lnk);
        self.links.drop(lnk)
    }

    /// spec §3 lifecycle: `dropComtree` purges all routes using that
    /// comtree, removes all comtree links (releasing their queues), then
    /// removes the entry.
    fn drop_comtree(&mut self, comt: ComtreeId) -> Result<()> {
        for lnk in self.comtrees.links(comt) {
            if let Some(info) = self.comtrees.link_info(comt, lnk) {
                self.queues.free_queue(lnk, info.queue);
            }
            self.links.remove_comtree(lnk, comt);
        }
        self.routes.purge_comtree(comt);
        self.comtrees.drop(comt)
    }

    /// spec §4.5 `handleCtlPkt`: dispatch a decoded signaling request
    /// against the router's tables, producing the POS_REPLY/NEG_REPLY to
    /// send back (spec §6, §7(c)-(e)).
    fn handle_ctl_pkt(&mut self, req: &ControlMessage) -> ControlMessage {
        match self.dispatch_ctl_pkt(req) {
            Ok(attrs) => req.pos_reply(attrs),
            Err(msg) => req.neg_reply(msg),
        }
    }

    fn dispatch_ctl_pkt(&mut self, req: &ControlMessage) -> std::result::Result<Attributes, String> {
        let a = &req.attrs;
        match req.cp_type {
            CpType::AddIface => {
                let iface = a.iface.ok_or("missing iface")?;
                let ip = std::net::Ipv4Addr::from(a.ip1.ok_or("missing ip1")?);
                let port = a.port1.ok_or("missing port1")?;
                let rates = a.rspec1.ok_or("missing rspec1")?;
                self.ifaces.add(iface, ip, port, rates).map_err(|e| e.to_string())?;
                Ok(Attributes::default())
            }
            CpType::DropIface => {
                let iface = a.iface.ok_or("missing iface")?;
                self.ifaces.drop(iface).map_err(|e| e.to_string())?;
                Ok(Attributes::default())
            }
            CpType::GetIface => {
                let iface = a.iface.ok_or("missing iface")?;
                let entry = self.ifaces.get(iface).ok_or("no such iface")?;
                Ok(Attributes {
                    iface: Some(iface),
                    ip1: Some(u32::from(entry.local_ip)),
                    port1: Some(entry.port),
                    rspec1: Some(entry.rates),
                    rspec2: Some(entry.avail_rates),
                    ..Attributes::default()
                })
            }
            CpType::ModIface => {
                let iface = a.iface.ok_or("missing iface")?;
                let entry = self.ifaces.get_mut(iface).ok_or("no such iface")?;
                if let Some(rates) = a.rspec1 {
                    entry.rates = rates;
                }
                Ok(Attributes::default())
            }
            CpType::GetIfaceSet => Ok(Attributes {
                count: Some(self.ifaces.len() as u32),
                string_data: Some(self.ifaces.iter().map(|(id, _)| id.to_string()).collect::<Vec<_>>().join(",")),
                ..Attributes::default()
            }),
            CpType::AddLink => {
                let lnk = a.link.ok_or("missing link")?;
                let iface = a.iface.ok_or("missing iface")?;
                let ip = std::net::Ipv4Addr::from(a.ip1.unwrap_or(0));
                let port = a.port1.unwrap_or(0);
                let peer_adr = ForestAddr::from(a.adr1.ok_or("missing adr1")?);
                let peer_type = PeerType::from_u8(a.node_type.unwrap_or(PeerType::Undef as u8));
                let nonce = a.nonce.ok_or("missing nonce")?;
                let rates = a.rspec1.unwrap_or_default();
                self.links.add(lnk, iface, ip, port, peer_adr, peer_type, nonce, rates).map_err(|e| e.to_string())?;
                Ok(Attributes::default())
            }
            CpType::DropLink => {
                let lnk = a.link.ok_or("missing link")?;
                self.drop_link(lnk).map_err(|e| e.to_string())?;
                Ok(Attributes::default())
            }
            CpType::GetLink => {
                let lnk = a.link.ok_or("missing link")?;
                let entry = self.links.get(lnk).ok_or("no such link")?;
                Ok(Attributes {
                    link: Some(lnk),
                    iface: Some(entry.iface),
                    ip1: Some(u32::from(entry.peer_ip)),
                    port1: Some(entry.peer_port),
                    adr1: Some(entry.peer_adr.raw()),
                    node_type: Some(entry.peer_type as u8),
                    rspec1: Some(entry.rates),
                    rspec2: Some(entry.avail_rates),
                    nonce: Some(entry.nonce),
                    ..Attributes::default()
                })
            }
            CpType::ModLink => {
                let lnk = a.link.ok_or("missing link")?;
                let entry = self.links.get_mut(lnk).ok_or("no such link")?;
                if let Some(rates) = a.rspec1 {
                    entry.rates = rates;
                }
                Ok(Attributes::default())
            }
            CpType::GetLinkSet => Ok(Attributes { count: Some(self.links.len() as u32), ..Attributes::default() }),
            CpType::AddComtree => {
                let comt = a.comtree.ok_or("missing comtree")?;
                let parent = a.link.unwrap_or(0);
                let core_flag = a.core_flag.unwrap_or(false);
                self.comtrees.add(comt, parent, core_flag).map_err(|e| e.to_string())?;
                Ok(Attributes::default())
            }
            CpType::DropComtree => {
                let comt = a.comtree.ok_or("missing comtree")?;
                self.drop_comtree(comt).map_err(|e| e.to_string())?;
                Ok(Attributes::default())
            }
            CpType::GetComtree => {
                let comt = a.comtree.ok_or("missing comtree")?;
                let entry = self.comtrees.get(comt).ok_or("no such comtree")?;
                Ok(Attributes {
                    comtree: Some(comt),
                    link: Some(entry.parent_link),
                    core_flag: Some(entry.core_flag),
                    count: Some((entry.router_links.len() + entry.member_links.len()) as u32),
                    ..Attributes::default()
                })
            }
            CpType::ModComtree => {
                let comt = a.comtree.ok_or("missing comtree")?;
                let prior = {
                    let entry = self.comtrees.get(comt).ok_or("no such comtree")?;
                    (entry.parent_link, entry.core_flag)
                };
                {
                    let entry = self.comtrees.get_mut(comt).unwrap();
                    if let Some(link) = a.link {
                        entry.parent_link = link;
                    }
                    if let Some(core_flag) = a.core_flag {
                        entry.core_flag = core_flag;
                    }
                }
                let ok = self.comtrees.get(comt).unwrap().check_invariant();
                if !ok {
                    let entry = self.comtrees.get_mut(comt).unwrap();
                    entry.parent_link = prior.0;
                    entry.core_flag = prior.1;
                    return Err(format!("comtree {comt}: update violates core/parent invariant"));
                }
                Ok(Attributes::default())
            }
            CpType::AddComtreeLink => {
                let comt = a.comtree.ok_or("missing comtree")?;
                let lnk = a.link.ok_or("missing link")?;
                let is_router =
                    self.links.get(lnk).map(|l| !l.peer_type.is_untrusted()).ok_or("no such link")?;
                let is_core = a.core_flag.unwrap_or(false);
                let queue = self.next_queue_id;
                self.next_queue_id += 1;
                let info = ComtreeLinkInfo { queue, rates: a.rspec1.unwrap_or_default() };
                if is_router {
                    self.comtrees.add_router_link(comt, lnk, is_core, info).map_err(|e| e.to_string())?;
                } else {
                    self.comtrees.add_member_link(comt, lnk, info).map_err(|e| e.to_string())?;
                }
                let _ = self.links.add_comtree(lnk, comt);
                self.queues.configure_queue(
                    lnk,
                    queue,
                    crate::queue::DEFAULT_QUANTUM,
                    crate::queue::DEFAULT_PKT_LIM,
                    crate::queue::DEFAULT_BYTE_LIM,
                );
                Ok(Attributes { queue: Some(queue), ..Attributes::default() })
            }
            CpType::DropComtreeLink => {
                let comt = a.comtree.ok_or("missing comtree")?;
                let lnk = a.link.ok_or("missing link")?;
                let queue = self.comtrees.link_info(comt, lnk).map(|i| i.queue).ok_or("link not in comtree")?;
                self.queues.free_queue(lnk, queue);
                self.comtrees.remove_link(comt, lnk).map_err(|e| e.to_string())?;
                self.links.remove_comtree(lnk, comt);
                Ok(Attributes::default())
            }
            CpType::GetComtreeLink => {
                let comt = a.comtree.ok_or("missing comtree")?;
                let lnk = a.link.ok_or("missing link")?;
                let info = self.comtrees.link_info(comt, lnk).ok_or("link not in comtree")?;
                Ok(Attributes { queue: Some(info.queue), rspec1: Some(info.rates), ..Attributes::default() })
            }
            CpType::ModComtreeLink => {
                let comt = a.comtree.ok_or("missing comtree")?;
                let lnk = a.link.ok_or("missing link")?;
                let info = self.comtrees.link_info_mut(comt, lnk).ok_or("link not in comtree")?;
                if let Some(rates) = a.rspec1 {
                    info.rates = rates;
                }
                Ok(Attributes::default())
            }
            CpType::GetComtreeSet => {
                Ok(Attributes { count: Some(self.comtrees.len() as u32), ..Attributes::default() })
            }
            CpType::AddRoute | CpType::ModRoute => {
                let comt = a.comtree.ok_or("missing comtree")?;
                let dest = ForestAddr::from(a.adr1.ok_or("missing adr1")?);
                let lnk = a.link.ok_or("missing link")?;
                if dest.is_multicast() {
                    self.routes.add_link(comt, dest, lnk).map_err(|e| e.to_string())?;
                } else {
                    self.routes.add_unicast(comt, dest, lnk).map_err(|e| e.to_string())?;
                }
                Ok(Attributes::default())
            }
            CpType::DropRoute => {
                let comt = a.comtree.ok_or("missing comtree")?;
                let dest = ForestAddr::from(a.adr1.ok_or("missing adr1")?);
                self.routes.remove(comt, dest).map_err(|e| e.to_string())?;
                Ok(Attributes::default())
            }
            CpType::GetRoute => {
                let comt = a.comtree.ok_or("missing comtree")?;
                let dest = ForestAddr::from(a.adr1.ok_or("missing adr1")?);
                match self.routes.lookup(comt, dest) {
                    Some(RouteTarget::Unicast(lnk)) => {
                        Ok(Attributes { link: Some(*lnk), ..Attributes::default() })
                    }
                    Some(RouteTarget::Multicast(links)) => Ok(Attributes {
                        count: Some(links.len() as u32),
                        string_data: Some(links.iter().map(|l| l.to_string()).collect::<Vec<_>>().join(",")),
                        ..Attributes::default()
                    }),
                    None => Err("no such route".into()),
                }
            }
            CpType::GetRouteSet => {
                Ok(Attributes { count: Some(self.routes.len() as u32), ..Attributes::default() })
            }
            CpType::AddFilter | CpType::EnablePacketLog => {
                let ptype =
                    PacketType::from_u8(a.index1.unwrap_or(0) as u8).map_err(|e| e.to_string())?;
                self.packet_log.enable(ptype);
                Ok(Attributes::default())
            }
            CpType::DropFilter => {
                let ptype =
                    PacketType::from_u8(a.index1.unwrap_or(0) as u8).map_err(|e| e.to_string())?;
                self.packet_log.disable(ptype);
                Ok(Attributes::default())
            }
            CpType::GetFilter | CpType::ModFilter => {
                let ptype =
                    PacketType::from_u8(a.index1.unwrap_or(0) as u8).map_err(|e| e.to_string())?;
                Ok(Attributes { core_flag: Some(self.packet_log.is_enabled(ptype)), ..Attributes::default() })
            }
            CpType::GetFilterSet => Ok(Attributes::default()),
            CpType::GetLoggedPackets => {
                let drained = self.packet_log.drain();
                Ok(Attributes { count: Some(drained.len() as u32), ..Attributes::default() })
            }
            CpType::SetLeafRange => {
                let first = ForestAddr::from(a.adr1.ok_or("missing adr1")?);
                let last = ForestAddr::from(a.adr2.ok_or("missing adr2")?);
                self.leaf_range = Some((first, last));
                Ok(Attributes::default())
            }
            CpType::BootRouter
            | CpType::BootComplete
            | CpType::BootAbort
            | CpType::ClientConnect
            | CpType::ClientDisconnect => {
                Err(format!("{:?} is not served by this router's control plane", req.cp_type))
            }
        }
    }

    /// spec §4.5 `handleControlReply`: match an incoming reply to the
    /// pending entry by `seqNum`, free the stored request, and log
    /// `NEG_REPLY` errors. A successful `BOOT_ROUTER` reply runs `setup`.
    fn handle_control_reply(&mut self, msg: &ControlMessage) {
        let Some(req) = self.pending.complete(msg.seq_num) else { return };
        if msg.mode == CpMode::NegReply {
            log::warn!(
                "control request {:?} to {} rejected: {}",
                req.message.cp_type,
                req.dest,
                msg.attrs.err_msg.as_deref().unwrap_or("<no message>")
            );
            return;
        }
        if req.message.cp_type == CpType::BootRouter {
            if let Err(err) = self.setup() {
                log::error!("setup after BOOT_ROUTER reply failed: {err}");
            }
        }
    }

    /// spec §4.5 step 1/3: decode a signaling packet queued for this
    /// router. A `REQUEST` is dispatched through `handleCtlPkt` and
    /// answered in place; a `POS_REPLY`/`NEG_REPLY` is matched against
    /// `pending` via `handleControlReply`.
    fn process_control_packet(&mut self, px: Px) {
        let header = *self.store.header(px);
        let in_link = self.store.in_link(px);
        let decoded = ControlMessage::decode(self.store.payload(px).as_slice());
        self.store.free(px);

        let Ok(msg) = decoded else {
            log::debug!("dropping undecodable control packet from link {in_link}");
            return;
        };

        match msg.mode {
            CpMode::Request => {
                let reply = self.handle_ctl_pkt(&msg);
                let Ok(bytes) = reply.encode() else { return };
                let reply_header = Header {
                    version: Header::CURRENT_VERSION,
                    length: crate::packet::HDR_LENGTH as u16 + bytes.len() as u16,
                    ptype: header.ptype,
                    flags: 0,
                    comtree: header.comtree,
                    src_adr: self.config.my_adr,
                    dst_adr: header.src_adr,
                };
                let mut packet = Packet::new(reply_header);
                packet.payload.set(&bytes);
                let rx = self.store.alloc(&packet);
                if rx == 0 {
                    return;
                }
                if in_link == 0 {
                    self.send_packet(rx, 0);
                } else if !self.enqueue_on_link(rx, in_link) {
                    self.store.free(rx);
                }
            }
            CpMode::PosReply | CpMode::NegReply => self.handle_control_reply(&msg),
        }
    }

    /// Resolve the comtree queue id for `lnk` in `comt`, or `0` if the
    /// link isn't part of that comtree.
    fn comtree_queue(&self, comt: ComtreeId, lnk: LinkId) -> u32 {
        self.comtrees.link_info(comt, lnk).map(|i| i.queue).unwrap_or(0)
    }

    fn enqueue_on_link(&mut self, px: Px, lnk: LinkId) -> bool {
        let header = *self.store.header(px);
        let queue = self.comtree_queue(header.comtree, lnk);
        let len = self.store.buffer_len(px).max(header.length as usize) as u32;
        self.queues.enq(lnk, queue, len, px, self.now_ns)
    }

    /// One iteration of the cooperative main loop (spec §4.5 steps 1-5).
    /// `now` and `elapsed_since_last_tick` come from the caller's
    /// monotonic clock, since this crate avoids `Instant::now()` calls
    /// buried in library code.
    pub async fn tick(&mut self, now_ns: u64, elapsed: Duration) -> Result<()> {
        self.now_ns = now_ns;
        let mut did_work = false;

        if let Some(dgram) = self.io.try_receive()? {
            did_work = true;
            let wire_len = dgram.packet.buffer_len.max(crate::packet::HDR_LENGTH);
            let peer_ip = match dgram.from.ip() {
                std::net::IpAddr::V4(v4) => v4,
                std::net::IpAddr::V6(_) => std::net::Ipv4Addr::UNSPECIFIED,
            };
            let peer_port = dgram.from.port();

            let mut in_link = self.links.lookup_by_addr(peer_ip, peer_port);
            if in_link.is_none() && dgram.packet.header.ptype == PacketType::Connect {
                if let (Some(w0), Some(w1)) = (dgram.packet.payload.word(0), dgram.packet.payload.word(1)) {
                    let nonce = ((w0 as u64) << 32) | w1 as u64;
                    in_link = self.links.lookup_by_nonce(nonce);
                }
            }

            if let Some(lnk) = in_link {
                if self.pkt_check(&dgram.packet.header, lnk, wire_len) {
                    let mut packet = dgram.packet;
                    packet.in_link = lnk;
                    packet.tun_src_ip = peer_ip;
                    packet.tun_src_port = peer_port;
                    self.stats.record_in(lnk, wire_len as u64);
                    self.packet_log.log(LogDirection::In, lnk, &packet);

                    let px = self.store.alloc(&packet);
                    if px != 0 {
                        self.route_incoming(px);
                    }
                }
            }
        }

        while let Some(lnk) = self.queues.next_ready(now_ns) {
            let store = &self.store;
            match self.queues.deq(lnk, |p| store.buffer_len(p).max(1) as u32) {
                Some(px) => {
                    did_work = true;
                    self.send_packet(px, lnk);
                }
                None => break,
            }
        }

        if !self.control_queue.is_empty() && (!did_work || self.control_credit <= 0) {
            if let Some(px) = self.control_queue.pop_front() {
                did_work = true;
                self.control_credit = CONTROL_STEP_BUDGET;
                self.process_control_packet(px);
            }
        } else {
            self.control_credit -= 1;
        }

        self.since_stats += elapsed;
        if self.since_stats >= STATS_PERIOD {
            self.since_stats = Duration::ZERO;
            self.stats.record(&self.queues);
            for req in self.pending.resend_control(Duration::from_nanos(now_ns)) {
                log::debug!("resending control request seqNum={}", req.message.seq_num);
                let Ok(bytes) = req.message.encode() else { continue };
                let header = Header {
                    version: Header::CURRENT_VERSION,
                    length: crate::packet::HDR_LENGTH as u16 + bytes.len() as u16,
                    ptype: PacketType::NetSig,
                    flags: 0,
                    comtree: self.config.net_sig_comt,
                    src_adr: self.config.my_adr,
                    dst_adr: req.dest,
                };
                let mut packet = Packet::new(header);
                packet.payload.set(&bytes);
                let px = self.store.alloc(&packet);
                if px != 0 {
                    self.forward(px);
                }
            }
        }

        if !did_work {
            tokio::time::sleep(IDLE_SLEEP).await;
        }

        Ok(())
    }

    fn route_incoming(&mut self, px: Px) {
        let header = *self.store.header(px);
        if self.booting {
            self.control_queue.push_back(px);
            return;
        }
        match header.ptype {
            PacketType::ClientData => self.forward(px),
            PacketType::SubUnsub => self.sub_unsub(px),
            PacketType::RteReply => self.handle_rte_reply(px),
            PacketType::Connect | PacketType::Disconnect => self.handle_conn_disc(px),
            _ => {
                if header.dst_adr != self.config.my_adr {
                    self.forward(px);
                } else {
                    self.control_queue.push_back(px);
                }
            }
        }
    }

    /// `lnk` is the outbound link the scheduler picked in `deq`, *not*
    /// `px`'s `in_link` (which is where the packet arrived from, and is
    /// meaningless once it's been handed off for transmission).
    fn send_packet(&mut self, px: Px, lnk: LinkId) {
        let packet = self.store.to_packet(px);
        self.packet_log.log(LogDirection::Out, lnk, &packet);
        if lnk == 0 {
            if let Some((ip, port)) = self.config.net_mgr_ip {
                let addr = std::net::SocketAddr::new(std::net::IpAddr::V4(ip), port);
                let _ = self.io.try_send(0, addr, &packet);
            }
        } else if let Some(link) = self.links.get(lnk) {
            let addr = std::net::SocketAddr::new(link.peer_ip.into(), link.peer_port);
            let _ = self.io.try_send(link.iface, addr, &packet);
            self.stats.record_out(lnk, packet.buffer_len.max(1) as u64);
        }
        self.store.free(px);
    }
}
