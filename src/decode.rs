/*! Reference resolution: bit bundles to candidate values.

Order matters: the sequence number is decoded first, the timestamp
second (it may be inferred from the SN delta), and the IP-IDs last
(their offsets are relative to the decoded SN). The SN step is separate
from the rest so the repair loop can retry the pipeline under a
different SN hypothesis without re-reading anything.

Everything produced here is a *candidate*: only the CRC check in
[`crate::rebuild`] decides whether these values become references.
 */
use log::trace;

use crate::context::{Context, IpRef, NextRef};
use crate::packet::{Bits, IpUpdate};
use crate::{Error, Result, ipid, lsb};

/// Fully expanded header values for one packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Values {
    /// Sequence number.
    pub sn: u16,
    /// RTP timestamp (0 for non-RTP flows).
    pub ts: u32,
    /// Innermost IPv4 identification, sequential domain.
    pub ip_id: Option<u16>,
    /// Outer IPv4 identification for IP-in-IP flows.
    pub ip_id2: Option<u16>,
    /// RTP marker.
    pub marker: bool,
    /// RTP payload type.
    pub pt: u8,
    /// RTP padding bit.
    pub rtp_p: bool,
    /// RTP header-extension bit.
    pub rtp_x: bool,
    /// UDP checksum to place in the rebuilt header.
    pub udp_checksum: u16,
    /// Newly signalled TS stride.
    pub ts_stride: Option<u32>,
}

/// Decode the sequence number from its bits.
#[must_use]
pub fn decode_sn(ctx: &Context, b: &Bits) -> u16 {
    lsb::decode16(ctx.sn_ref, b.sn_k, b.sn as u16, lsb::sn_shift(b.sn_k))
}

fn effective_rnd(ip: &IpRef, up: Option<&IpUpdate>) -> bool {
    up.and_then(|u| u.rnd).unwrap_or(ip.rnd)
}

fn decode_ip_id(
    ip: &IpRef,
    up: Option<&IpUpdate>,
    full: Option<u16>,
    m: u32,
    k: usize,
    sn_ref: u16,
    sn: u16,
) -> Result<Option<u16>> {
    if !matches!(ip.hdr, crate::headers::IpHeader::V4(_)) {
        return Ok(None);
    }
    if effective_rnd(ip, up) {
        let id = full.ok_or_else(|| Error::Malformed("random IP-ID missing from tail".into()))?;
        return Ok(Some(id));
    }
    Ok(Some(ipid::decode_sequential(
        ip.ip_id_ref,
        sn_ref,
        sn,
        m as u16,
        k,
    )))
}

/// Expand a bit bundle against the context under the SN hypothesis
/// `sn`.
pub fn decode_with_sn(ctx: &Context, b: &Bits, sn: u16) -> Result<Values> {
    let mut v = Values {
        sn,
        udp_checksum: b.tail.udp_checksum.unwrap_or(0),
        ts_stride: b.ts_stride,
        ..Default::default()
    };

    if let NextRef::Rtp {
        rtp, ts_stride, ..
    } = &ctx.next
    {
        let stride = b.ts_stride.unwrap_or(*ts_stride);
        v.ts = if b.ts_k == 0 {
            if *ts_stride > 0 {
                let delta = u32::from(sn.wrapping_sub(ctx.sn_ref));
                rtp.ts.wrapping_add(ts_stride.wrapping_mul(delta))
            } else {
                rtp.ts
            }
        } else if b.ts_scaled {
            if stride == 0 {
                return Err(Error::Malformed(
                    "scaled timestamp without an established stride".into(),
                ));
            }
            let scaled_ref = rtp.ts / stride;
            let scaled = lsb::decode32(scaled_ref, b.ts_k, b.ts, lsb::ts_shift(b.ts_k));
            scaled
                .wrapping_mul(stride)
                .wrapping_add(rtp.ts % stride)
        } else {
            lsb::decode32(rtp.ts, b.ts_k, b.ts, lsb::ts_shift(b.ts_k))
        };
        v.marker = b.marker.unwrap_or(rtp.marker);
        v.pt = b.pt.unwrap_or(rtp.pt);
        v.rtp_p = b.rtp_p.unwrap_or(rtp.padding);
        v.rtp_x = b.rtp_x.unwrap_or(rtp.ext);
    }

    if let Some(inner) = ctx.innermost() {
        v.ip_id = decode_ip_id(
            inner,
            b.update_for(ctx, false),
            b.tail.inner_ip_id,
            b.ip_id,
            b.ip_id_k,
            ctx.sn_ref,
            sn,
        )?;
    }
    if ctx.inner.is_some()
        && let Some(outer) = &ctx.outer
    {
        v.ip_id2 = decode_ip_id(
            outer,
            b.update_for(ctx, true),
            b.tail.outer_ip_id,
            b.ip_id2,
            b.ip_id2_k,
            ctx.sn_ref,
            sn,
        )?;
    }
    trace!("decoded: sn={} ts={} ip_id={:?}", v.sn, v.ts, v.ip_id);
    Ok(v)
}
