//! In-band control plane: signaling attribute packets and the
//! pending-request retry map (spec §3, §4.5, §6).
//!
//! A signaling packet body is a MessagePack-encoded [`ControlMessage`],
//! carried as the payload of a `CLIENT_SIG`/`NET_SIG` packet. Requests
//! the core itself issues (e.g. `RTE_REQ` follow-ups, a `CLIENT_CONNECT`
//! notification to the network manager) are tracked in
//! [`PendingRequests`] and resent up to [`MAX_RETRIES`] times at
//! [`RETRY_INTERVAL`] spacing, mirroring the reference router's
//! `resource::manager` retry bookkeeping.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::ForestAddr;
use crate::error::Result;
use crate::rate::RateSpec;

pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);
pub const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpMode {
    Request,
    PosReply,
    NegReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpType {
    AddIface,
    DropIface,
    GetIface,
    ModIface,
    GetIfaceSet,
    AddLink,
    DropLink,
    GetLink,
    ModLink,
    GetLinkSet,
    AddComtree,
    DropComtree,
    GetComtree,
    ModComtree,
    AddComtreeLink,
    DropComtreeLink,
    GetComtreeLink,
    ModComtreeLink,
    GetComtreeSet,
    AddRoute,
    DropRoute,
    GetRoute,
    ModRoute,
    GetRouteSet,
    AddFilter,
    DropFilter,
    GetFilter,
    ModFilter,
    GetFilterSet,
    GetLoggedPackets,
    EnablePacketLog,
    SetLeafRange,
    BootRouter,
    BootComplete,
    BootAbort,
    ClientConnect,
    ClientDisconnect,
}

/// Every field a request or reply might carry. Unused fields are
/// simply `None` — this is the direct analogue of the reference
/// router's sparse attribute list, made explicit instead of encoded as
/// a `(key, value)` association list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Attributes {
    pub iface: Option<u32>,
    pub link: Option<u32>,
    pub comtree: Option<u32>,
    pub rspec1: Option<RateSpec>,
    pub rspec2: Option<RateSpec>,
    pub node_type: Option<u8>,
    pub ip1: Option<u32>,
    pub port1: Option<u16>,
    pub adr1: Option<u32>,
    pub adr2: Option<u32>,
    pub core_flag: Option<bool>,
    pub queue: Option<u32>,
    pub count: Option<u32>,
    pub index1: Option<u32>,
    pub index2: Option<u32>,
    pub nonce: Option<u64>,
    pub string_data: Option<String>,
    pub err_msg: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    pub cp_type: CpType,
    pub mode: CpMode,
    pub seq_num: u64,
    pub attrs: Attributes,
}

impl ControlMessage {
    pub fn request(cp_type: CpType, seq_num: u64, attrs: Attributes) -> Self {
        Self { cp_type, mode: CpMode::Request, seq_num, attrs }
    }

    pub fn pos_reply(&self, attrs: Attributes) -> Self {
        Self { cp_type: self.cp_type, mode: CpMode::PosReply, seq_num: self.seq_num, attrs }
    }

    pub fn neg_reply(&self, err_msg: impl Into<String>) -> Self {
        Self {
            cp_type: self.cp_type,
            mode: CpMode::NegReply,
            seq_num: self.seq_num,
            attrs: Attributes { err_msg: Some(err_msg.into()), ..Attributes::default() },
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// A request the router itself sent, awaiting a matching reply or
/// CONNECT/DISCONNECT/SUB_UNSUB acknowledgement. Retried by `seqNum`
/// (signaling) or `nonce` (connect-plane acks) per spec §4.5.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub dest: ForestAddr,
    pub message: ControlMessage,
    pub sent_at: Duration,
    pub retries: u32,
}

/// Tracks outstanding self-originated requests and decides who needs a
/// resend.
#[derive(Default)]
pub struct PendingRequests {
    by_seq: HashMap<u64, PendingRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, dest: ForestAddr, message: ControlMessage, now: Duration) {
        let seq = message.seq_num;
        self.by_seq.insert(seq, PendingRequest { dest, message, sent_at: now, retries: 0 });
    }

    /// Acknowledge and stop tracking `seq_num`. Returns the completed
    /// request, if one was outstanding.
    pub fn complete(&mut self, seq_num: u64) -> Option<PendingRequest> {
        self.by_seq.remove(&seq_num)
    }

    pub fn is_pending(&self, seq_num: u64) -> bool {
        self.by_seq.contains_key(&seq_num)
    }

    pub fn len(&self) -> usize {
        self.by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_seq.is_empty()
    }

    /// Drive the retry clock forward. Requests due for a resend have
    /// their `sent_at`/`retries` updated in place and are returned for
    /// the caller to actually retransmit; requests that have exhausted
    /// `MAX_RETRIES` are dropped and logged instead (spec §7(f)).
    pub fn resend_control(&mut self, now: Duration) -> Vec<PendingRequest> {
        let mut due = Vec::new();
        let mut expired = Vec::new();

        for (&seq, req) in self.by_seq.iter_mut() {
            if now.saturating_sub(req.sent_at) < RETRY_INTERVAL {
                continue;
            }
            if req.retries >= MAX_RETRIES {
                expired.push(seq);
                continue;
            }
            req.retries += 1;
            req.sent_at = now;
            due.push(req.clone());
        }

        for seq in expired {
            if let Some(req) = self.by_seq.remove(&seq) {
                log::warn!(
                    "giving up on seqNum={} to {} after {} retries",
                    seq,
                    req.dest,
                    req.retries
                );
            }
        }

        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(seq: u64) -> ControlMessage {
        ControlMessage::request(CpType::AddLink, seq, Attributes::default())
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut attrs = Attributes::default();
        attrs.link = Some(7);
        attrs.nonce = Some(0xdead_beef_0000_0001);
        attrs.string_data = Some("hello".into());
        let msg = ControlMessage::request(CpType::AddLink, 42, attrs);

        let bytes = msg.encode().unwrap();
        let back = ControlMessage::decode(&bytes).unwrap();
        assert_eq!(back.seq_num, 42);
        assert_eq!(back.attrs.link, Some(7));
        assert_eq!(back.attrs.string_data.as_deref(), Some("hello"));
    }

    #[test]
    fn resend_leaves_request_before_interval_elapses() {
        let mut pending = PendingRequests::new();
        pending.track(ForestAddr::new(1, 1), req(1), Duration::from_secs(10));
        let due = pending.resend_control(Duration::from_millis(10_500));
        assert!(due.is_empty());
        assert!(pending.is_pending(1));
    }

    #[test]
    fn resend_fires_after_interval_and_gives_up_after_max_retries() {
        let mut pending = PendingRequests::new();
        pending.track(ForestAddr::new(1, 1), req(1), Duration::from_secs(0));

        for expected_retry in 1..=MAX_RETRIES {
            let now = Duration::from_secs(expected_retry as u64);
            let due = pending.resend_control(now);
            assert_eq!(due.len(), 1);
            assert_eq!(due[0].retries, expected_retry);
        }

        let due = pending.resend_control(Duration::from_secs(MAX_RETRIES as u64 + 1));
        assert!(due.is_empty());
        assert!(!pending.is_pending(1), "request must be dropped after exhausting retries");
    }

    #[test]
    fn complete_stops_tracking() {
        let mut pending = PendingRequests::new();
        pending.track(ForestAddr::new(1, 1), req(5), Duration::from_secs(0));
        assert!(pending.complete(5).is_some());
        assert!(!pending.is_pending(5));
    }
}
