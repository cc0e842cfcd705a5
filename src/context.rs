/*! Per-flow decompression context.

A context is created by the first valid IR packet for a CID and from then
on holds the last successfully reconstructed headers: the reference
values every compressed packet is decoded against. Nothing here mutates
on a failed packet; the engine computes candidate state on the side and
calls [`Context::commit`] only after the CRC has passed.
 */
use serde::Serialize;

use crate::headers::{IpHeader, Rtp, Udp, UdpLite};
use crate::list::ListDecompressor;
use crate::profile::Profile;

/// Decompressor state per RFC 3095 §5.3.2. `NoContext` is represented
/// by absence from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum State {
    /// Static and dynamic parts valid; all packet types accepted.
    FullContext,
    /// Only the static part is trusted; IR and IR-DYN accepted.
    StaticContext,
}

/// Reference state for one IP header of the flow.
#[derive(Debug, Clone)]
pub struct IpRef {
    /// Last reconstructed header. For IPv4 the `id` field holds the
    /// wire-order value.
    pub hdr: IpHeader,
    /// IPv4 IP-ID is random (sent in full).
    pub rnd: bool,
    /// IPv4 IP-ID is in network byte order.
    pub nbo: bool,
    /// Sequential-domain IP-ID reference (before byte-order fixup).
    pub ip_id_ref: u16,
    /// Extension-header list state; IPv6 only.
    pub list: Option<ListDecompressor>,
}

impl IpRef {
    /// True for a sequential (offset-coded) IPv4 IP-ID.
    #[must_use]
    pub fn sequential(&self) -> bool {
        matches!(self.hdr, IpHeader::V4(_)) && !self.rnd
    }
}

/// Reference state for the header after the IP chain.
#[derive(Debug, Clone)]
pub enum NextRef {
    /// IP-only profile: nothing after the IP chain.
    None,
    /// UDP profile.
    Udp {
        /// Last reconstructed UDP header.
        udp: Udp,
        /// The flow carries a checksum in every compressed packet.
        check_present: bool,
    },
    /// UDP-Lite profile.
    UdpLite {
        /// Last reconstructed UDP-Lite header.
        lite: UdpLite,
    },
    /// RTP profile (UDP below it).
    Rtp {
        /// Last reconstructed UDP header.
        udp: Udp,
        /// The flow carries a UDP checksum in every compressed packet.
        check_present: bool,
        /// Last reconstructed RTP header; its `ts` is the TS reference.
        rtp: Rtp,
        /// Established timestamp stride; 0 when unknown.
        ts_stride: u32,
    },
}

/// Per-context counters, surfaced in the channel report.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Stats {
    /// Packets successfully decompressed.
    pub ok: u64,
    /// Packets recovered by the correction loop.
    pub repaired: u64,
    /// Packets dropped.
    pub failed: u64,
}

/// One decompression flow.
#[derive(Debug, Clone)]
pub struct Context {
    /// Profile bound at IR time.
    pub profile: Profile,
    /// Trust level.
    pub state: State,
    /// Outer (or only) IP header reference. `None` only for the
    /// uncompressed profile.
    pub outer: Option<IpRef>,
    /// Inner IP header reference for IP-in-IP flows.
    pub inner: Option<IpRef>,
    /// Post-IP header reference.
    pub next: NextRef,
    /// Sequence number reference for LSB decoding.
    pub sn_ref: u16,
    /// RFC 3095 correction counter; 0 when healthy.
    pub correction_counter: u32,
    /// Arrival time of the last committed packet, caller-supplied
    /// monotonic milliseconds.
    pub last_ok_time: u64,
    /// Smoothed packet inter-arrival time in milliseconds; 0 until two
    /// packets have committed.
    pub inter_arrival: u64,
    /// Counters.
    pub stats: Stats,
    /// Last signalled mode transition bits (informational).
    pub mode: u8,
}

impl Context {
    /// Fresh context in `FullContext` (IR with dynamic chain) or
    /// `StaticContext` (IR without).
    #[must_use]
    pub fn new(profile: Profile, state: State) -> Self {
        Self {
            profile,
            state,
            outer: None,
            inner: None,
            next: NextRef::None,
            sn_ref: 0,
            correction_counter: 0,
            last_ok_time: 0,
            inter_arrival: 0,
            stats: Stats::default(),
            mode: 0,
        }
    }

    /// The innermost IP reference.
    #[must_use]
    pub fn innermost(&self) -> Option<&IpRef> {
        self.inner.as_ref().or(self.outer.as_ref())
    }

    /// Timestamp reference (RTP flows).
    #[must_use]
    pub fn ts_ref(&self) -> u32 {
        match &self.next {
            NextRef::Rtp { rtp, .. } => rtp.ts,
            _ => 0,
        }
    }

    /// Established TS stride (RTP flows).
    #[must_use]
    pub fn ts_stride(&self) -> u32 {
        match &self.next {
            NextRef::Rtp { ts_stride, .. } => *ts_stride,
            _ => 0,
        }
    }

    /// Advance the timing references after a successful packet.
    pub fn touch(&mut self, now: u64) {
        if self.last_ok_time != 0 && now > self.last_ok_time {
            self.inter_arrival = now - self.last_ok_time;
        }
        self.last_ok_time = now;
    }
}
