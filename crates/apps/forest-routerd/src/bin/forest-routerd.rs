use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use forest_router::{RouterConfig, RouterCore};
use forest_routerd::config;

/// CLI surface for the cooperative router daemon (spec §6). The
/// `key=value` flag names are kept as the argument identities; clap
/// renders them as ordinary long options.
#[derive(Parser, Debug)]
#[command(name = "forest-routerd")]
struct Args {
    /// `local` boots straight from the table files below; `remote` is
    /// reserved for a future network-manager-driven boot handshake.
    #[arg(long, default_value = "local")]
    mode: String,
    #[arg(long)]
    my_adr: String,
    #[arg(long, default_value = "0.0.0.0")]
    boot_ip: Ipv4Addr,
    #[arg(long)]
    nm_ip: Option<Ipv4Addr>,
    #[arg(long)]
    nm_adr: Option<String>,
    /// Address of the client-connect controller, if one is configured.
    /// Recorded for future use; not yet wired into the core control plane.
    #[arg(long)]
    cc_adr: Option<String>,
    #[arg(long)]
    first_leaf_adr: Option<String>,
    #[arg(long)]
    last_leaf_adr: Option<String>,
    #[arg(long)]
    if_tbl: Option<PathBuf>,
    #[arg(long)]
    lnk_tbl: Option<PathBuf>,
    #[arg(long)]
    comt_tbl: Option<PathBuf>,
    #[arg(long)]
    rte_tbl: Option<PathBuf>,
    #[arg(long)]
    stat_spec: Option<PathBuf>,
    /// Seconds to run before exiting cleanly; 0 runs until killed.
    #[arg(long, default_value_t = 0)]
    fin_time: u64,
}

const N_DESCRIPTORS: usize = 4096;
const M_BUFFERS: usize = 2048;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();
    if let Err(err) = run().await {
        log::error!("fatal: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    let my_adr = config::parse_forest_addr(&args.my_adr).context("myAdr")?;
    let net_mgr_adr = args.nm_adr.as_deref().map(config::parse_forest_addr).transpose().context("nmAdr")?;
    if let Some(cc_adr) = &args.cc_adr {
        let adr = config::parse_forest_addr(cc_adr).context("ccAdr")?;
        log::info!("client-connect controller address configured: {adr}");
    }
    if let (Some(first), Some(last)) = (&args.first_leaf_adr, &args.last_leaf_adr) {
        let first = config::parse_forest_addr(first).context("firstLeafAdr")?;
        let last = config::parse_forest_addr(last).context("lastLeafAdr")?;
        log::info!("leaf address range configured: {first}..={last} (SET_LEAF_RANGE allocation not yet implemented)");
    }

    let router_config = RouterConfig {
        my_adr,
        net_mgr_adr,
        net_mgr_ip: args.nm_ip.map(|ip| (ip, forest_router::NM_PORT)),
        connect_comt: forest_router::CONNECT_COMT,
        client_sig_comt: forest_router::CLIENT_SIG_COMT,
        net_sig_comt: forest_router::NET_SIG_COMT,
    };
    let mut core = RouterCore::new(router_config, N_DESCRIPTORS, M_BUFFERS);

    if let Some(path) = &args.if_tbl {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        core.ifaces = config::read_iface_table(&text).context("parsing interface table")?;
    }
    if let Some(path) = &args.lnk_tbl {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        core.links = config::read_link_table(&text).context("parsing link table")?;
    }
    if let Some(path) = &args.comt_tbl {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        core.comtrees = config::read_comtree_table(&text).context("parsing comtree table")?;
    }
    if let Some(path) = &args.rte_tbl {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        core.routes = config::read_route_table(&text).context("parsing route table")?;
    }
    if let Some(path) = &args.stat_spec {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        for item in config::read_stat_spec(&text).context("parsing statSpec")? {
            core.stats.watch(item);
        }
    }

    let iface_bindings: Vec<_> =
        core.ifaces.iter().map(|(&id, entry)| (id, entry.local_ip, entry.port)).collect();
    for (iface, ip, port) in iface_bindings {
        core.io.bind_iface(iface, ip, port).await.with_context(|| format!("binding interface {iface}"))?;
    }
    if args.mode == "remote" {
        core.io.bind_boot(args.boot_ip, forest_router::NM_PORT).await.context("binding boot socket")?;
        if let Some(nm_ip) = args.nm_ip {
            log::info!("remote mode: network manager expected at {nm_ip}:{}", forest_router::NM_PORT);
        }
    }

    core.setup().context("router setup (table/rate invariants)")?;
    log::info!("router {my_adr} up, {} interfaces bound", core.ifaces.len());

    let start = tokio::time::Instant::now();
    let mut last = start;
    loop {
        let now = tokio::time::Instant::now();
        let elapsed = now.duration_since(last);
        last = now;
        let now_ns = now.duration_since(start).as_nanos() as u64;
        core.tick(now_ns, elapsed).await?;

        if args.fin_time > 0 && now.duration_since(start) >= Duration::from_secs(args.fin_time) {
            log::info!("finTime reached, shutting down");
            break;
        }
    }
    Ok(())
}
