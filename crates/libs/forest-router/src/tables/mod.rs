//! The router's four lookup tables (spec §3, §4.2).

pub mod comtree;
pub mod iface;
pub mod link;
pub mod route;

pub use comtree::{ComtreeEntry, ComtreeLinkInfo, ComtreeTable};
pub use iface::{IfaceEntry, IfaceId, IfaceTable};
pub use link::{LinkEntry, LinkId, LinkTable};
pub use route::{RouteTable, RouteTarget};
