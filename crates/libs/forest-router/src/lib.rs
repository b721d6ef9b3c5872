//! Data-plane core for a single Forest overlay router: packet store,
//! lookup tables, WDRR output scheduler, UDP transport, and the
//! request/reply control plane that configures all of it at runtime.

pub mod address;
pub mod control;
pub mod core;
pub mod error;
pub mod io;
pub mod packet;
pub mod packet_log;
pub mod queue;
pub mod rate;
pub mod stats;
pub mod store;
pub mod tables;

pub use address::ForestAddr;
pub use core::{RouterConfig, RouterCore};
pub use error::{ForestError, Result};
pub use packet::{
    Header, Packet, PacketType, PeerType, CLIENT_SIG_COMT, CONNECT_COMT, NET_SIG_COMT, NM_PORT,
    ROUTER_PORT,
};
pub use rate::RateSpec;
pub use store::{PacketStore, Px};
