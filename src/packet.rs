/*! Compressed packet parsing.

The parser turns wire bytes into *bit bundles*: raw field bits plus
their widths, with no reference resolution. Interpreting the bits
against the context's references happens later, in [`crate::decode`],
so that the repair loop can re-interpret the same bundle under a
different hypothesis without touching the buffer again.

Type discrimination on the first octet after CID framing:

```text
1111 1110   IR-DYN
1111 110D   IR (D = dynamic chain present)
1111 0xxx   feedback (not accepted on this path)
0xxx xxxx   UO-0
10xx xxxx   UO-1 family
110x xxxx   UOR-2 family
```
 */
use log::trace;

use crate::bits::{self, BitReader};
use crate::context::Context;
use crate::crc::CrcKind;
use crate::list::PendingList;
use crate::{Error, Result};

/// Top-level packet class from the type octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Initialization/refresh.
    Ir {
        /// Dynamic chain present.
        d: bool,
    },
    /// Dynamic-chain-only refresh.
    IrDyn,
    /// Smallest compressed form.
    Uo0,
    /// UO-1 family (variant resolved against the context).
    Uo1,
    /// UOR-2 family.
    Uor2,
    /// Feedback; valid on a channel, not fed to the decompressor core.
    Feedback,
}

/// Classify the type octet.
pub fn discriminate(octet: u8) -> Result<Kind> {
    match octet {
        0xfe => Ok(Kind::IrDyn),
        0xfc | 0xfd => Ok(Kind::Ir {
            d: octet & 0x01 != 0,
        }),
        0xf0..=0xf7 => Ok(Kind::Feedback),
        _ if octet & 0x80 == 0 => Ok(Kind::Uo0),
        _ if octet & 0xc0 == 0x80 => Ok(Kind::Uo1),
        _ if octet & 0xe0 == 0xc0 => Ok(Kind::Uor2),
        _ => Err(Error::Malformed(format!("unknown packet type {octet:#04x}"))),
    }
}

/// Resolved UO-family variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UoKind {
    /// 4 SN bits, CRC-3.
    Uo0,
    /// Non-RTP: 6 IP-ID bits, 5 SN bits, CRC-3.
    Uo1,
    /// RTP without sequential IP-ID: 6 TS bits, M, 4 SN bits.
    Uo1Rtp,
    /// RTP with sequential IP-ID, T=0: 5 IP-ID bits, X, 4 SN bits.
    Uo1Id,
    /// RTP with sequential IP-ID, T=1: 5 TS bits, M, 4 SN bits.
    Uo1Ts,
    /// Non-RTP: 5 SN bits, X, CRC-7.
    Uor2,
    /// RTP without sequential IP-ID: 6 TS bits, M, 6 SN bits.
    Uor2Rtp,
    /// RTP with sequential IP-ID, T=0: 5 IP-ID bits, M, 6 SN bits.
    Uor2Id,
    /// RTP with sequential IP-ID, T=1: 5 TS bits, M, 6 SN bits.
    Uor2Ts,
}

/// Requested updates to one IP header, from extension 3.
#[derive(Debug, Clone, Default)]
pub struct IpUpdate {
    /// New type of service.
    pub tos: Option<u8>,
    /// New TTL / hop limit.
    pub ttl: Option<u8>,
    /// New protocol (rarely sane to change; honored regardless).
    pub proto: Option<u8>,
    /// New don't-fragment flag.
    pub df: Option<bool>,
    /// New byte-order flag.
    pub nbo: Option<bool>,
    /// New random-IP-ID flag.
    pub rnd: Option<bool>,
    /// Replacement extension-header list.
    pub list: Option<PendingList>,
}

/// Values read from the packet tail (fields sent in full).
#[derive(Debug, Clone, Copy, Default)]
pub struct Tail {
    /// Outer IPv4 IP-ID, when random.
    pub outer_ip_id: Option<u16>,
    /// Inner IPv4 IP-ID, when random.
    pub inner_ip_id: Option<u16>,
    /// UDP checksum, when the flow carries one.
    pub udp_checksum: Option<u16>,
}

/// The extracted bit bundle of one UO/UOR packet.
#[derive(Debug, Clone, Default)]
pub struct Bits {
    /// SN bits and width.
    pub sn: u32,
    /// Number of SN bits.
    pub sn_k: usize,
    /// Innermost sequential IP-ID offset bits.
    pub ip_id: u32,
    /// Number of IP-ID bits.
    pub ip_id_k: usize,
    /// Outer IP-ID offset bits.
    pub ip_id2: u32,
    /// Number of outer IP-ID bits.
    pub ip_id2_k: usize,
    /// TS bits.
    pub ts: u32,
    /// Number of TS bits.
    pub ts_k: usize,
    /// TS bits are TS_SCALED.
    pub ts_scaled: bool,
    /// RTP marker, when carried.
    pub marker: Option<bool>,
    /// RTP payload type, when carried.
    pub pt: Option<u8>,
    /// RTP padding bit, when carried.
    pub rtp_p: Option<bool>,
    /// RTP header-extension bit, when carried.
    pub rtp_x: Option<bool>,
    /// New TS stride, when carried.
    pub ts_stride: Option<u32>,
    /// Mode bits from extension 3.
    pub mode: Option<u8>,
    /// Received CRC.
    pub crc: u8,
    /// Which CRC the packet carries.
    pub crc_kind: CrcKind,
    /// Inner IP header updates from extension 3.
    pub inner_update: Option<IpUpdate>,
    /// Outer IP header updates from extension 3.
    pub outer_update: Option<IpUpdate>,
    /// Fields sent in full after the base header and extension.
    pub tail: Tail,
    /// Bytes consumed; payload starts here.
    pub header_len: usize,
}

impl Bits {
    /// The extension-3 update slot targeting one position of the IP
    /// chain. Single-IP flows use the inner slot for their only
    /// header.
    #[must_use]
    pub fn update_for(&self, ctx: &Context, outer: bool) -> Option<&IpUpdate> {
        if ctx.inner.is_some() {
            if outer {
                self.outer_update.as_ref()
            } else {
                self.inner_update.as_ref()
            }
        } else if outer {
            None
        } else {
            self.inner_update.as_ref().or(self.outer_update.as_ref())
        }
    }
}

/// Append `k` extension bits to a (value, width) pair.
fn append(v: u32, v_k: usize, add: u32, add_k: usize) -> Result<(u32, usize)> {
    let k = v_k + add_k;
    if k > 32 {
        return Err(Error::Malformed(format!("{k} bits for one field")));
    }
    Ok(((v << add_k) | add, k))
}

/// Does the context have an innermost IPv4 header with offset-coded
/// IP-ID? Decides the UO-1/UOR-2 variant for RTP flows.
fn has_seq_ip_id(ctx: &Context) -> bool {
    ctx.innermost().is_some_and(|ip| ip.sequential())
}

/// Parse a UO/UOR packet into its bit bundle. `buf` starts at the type
/// octet, CID framing already removed.
pub fn parse_uo(ctx: &Context, buf: &[u8]) -> Result<(UoKind, Bits)> {
    let mut r = BitReader::new(buf);
    let rtp = ctx.profile.is_rtp();
    let seq = has_seq_ip_id(ctx);
    let octet0 = r.read_bits(8)?;
    let mut b = Bits::default();
    let mut x = false;

    let kind = match discriminate(octet0 as u8)? {
        Kind::Uo0 => {
            b.sn = (octet0 >> 3) & 0x0f;
            b.sn_k = 4;
            b.crc = (octet0 & 0x07) as u8;
            b.crc_kind = CrcKind::Crc3;
            UoKind::Uo0
        }
        Kind::Uo1 => {
            if !rtp {
                if !seq {
                    return Err(Error::Malformed(
                        "UO-1 needs an offset-coded IP-ID".into(),
                    ));
                }
                b.ip_id = octet0 & 0x3f;
                b.ip_id_k = 6;
                let o1 = r.read_bits(8)?;
                b.sn = o1 >> 3;
                b.sn_k = 5;
                b.crc = (o1 & 0x07) as u8;
                b.crc_kind = CrcKind::Crc3;
                UoKind::Uo1
            } else if !seq {
                b.ts = octet0 & 0x3f;
                b.ts_k = 6;
                let o1 = r.read_bits(8)?;
                b.marker = Some(o1 & 0x80 != 0);
                b.sn = (o1 >> 3) & 0x0f;
                b.sn_k = 4;
                b.crc = (o1 & 0x07) as u8;
                b.crc_kind = CrcKind::Crc3;
                UoKind::Uo1Rtp
            } else if octet0 & 0x20 == 0 {
                // T = 0: UO-1-ID, the only UO-1 shape with extensions.
                b.ip_id = octet0 & 0x1f;
                b.ip_id_k = 5;
                let o1 = r.read_bits(8)?;
                x = o1 & 0x80 != 0;
                b.sn = (o1 >> 3) & 0x0f;
                b.sn_k = 4;
                b.crc = (o1 & 0x07) as u8;
                b.crc_kind = CrcKind::Crc3;
                UoKind::Uo1Id
            } else {
                b.ts = octet0 & 0x1f;
                b.ts_k = 5;
                let o1 = r.read_bits(8)?;
                b.marker = Some(o1 & 0x80 != 0);
                b.sn = (o1 >> 3) & 0x0f;
                b.sn_k = 4;
                b.crc = (o1 & 0x07) as u8;
                b.crc_kind = CrcKind::Crc3;
                UoKind::Uo1Ts
            }
        }
        Kind::Uor2 => {
            b.crc_kind = CrcKind::Crc7;
            if !rtp {
                b.sn = octet0 & 0x1f;
                b.sn_k = 5;
                let o1 = r.read_bits(8)?;
                x = o1 & 0x80 != 0;
                b.crc = (o1 & 0x7f) as u8;
                UoKind::Uor2
            } else {
                let field5 = octet0 & 0x1f;
                let o1 = r.read_bits(8)?;
                let o2 = r.read_bits(8)?;
                x = o2 & 0x80 != 0;
                b.crc = (o2 & 0x7f) as u8;
                b.marker = Some(o1 & 0x40 != 0);
                b.sn = o1 & 0x3f;
                b.sn_k = 6;
                if !seq {
                    // UOR-2-RTP: sixth TS bit rides in octet 1.
                    b.ts = (field5 << 1) | (o1 >> 7);
                    b.ts_k = 6;
                    UoKind::Uor2Rtp
                } else if o1 & 0x80 == 0 {
                    b.ip_id = field5;
                    b.ip_id_k = 5;
                    UoKind::Uor2Id
                } else {
                    b.ts = field5;
                    b.ts_k = 5;
                    UoKind::Uor2Ts
                }
            }
        }
        other => {
            return Err(Error::Malformed(format!(
                "{other:?} is not a compressed packet"
            )));
        }
    };

    if x {
        parse_extension(ctx, &mut r, kind, &mut b)?;
    }
    parse_tail(ctx, &mut r, &mut b)?;
    b.header_len = r.byte_pos();
    trace!("{kind:?}: sn {}/{}b crc {:#x}", b.sn, b.sn_k, b.crc);
    Ok((kind, b))
}

/// True when the T-field of extensions 0..2 is the timestamp (RTP
/// packets built around TS bits).
fn t_is_ts(kind: UoKind) -> bool {
    matches!(kind, UoKind::Uor2Rtp | UoKind::Uor2Ts)
}

fn parse_extension(ctx: &Context, r: &mut BitReader, kind: UoKind, b: &mut Bits) -> Result<()> {
    let e0 = r.read_bits(8)?;
    let sn3 = (e0 >> 3) & 0x7;
    let f3 = e0 & 0x7;
    match e0 >> 6 {
        0 => {
            (b.sn, b.sn_k) = append(b.sn, b.sn_k, sn3, 3)?;
            if t_is_ts(kind) {
                (b.ts, b.ts_k) = append(b.ts, b.ts_k, f3, 3)?;
            } else {
                (b.ip_id, b.ip_id_k) = append(b.ip_id, b.ip_id_k, f3, 3)?;
            }
        }
        1 => {
            (b.sn, b.sn_k) = append(b.sn, b.sn_k, sn3, 3)?;
            let e1 = r.read_bits(8)?;
            if t_is_ts(kind) {
                (b.ts, b.ts_k) = append(b.ts, b.ts_k, f3, 3)?;
                (b.ip_id, b.ip_id_k) = append(b.ip_id, b.ip_id_k, e1, 8)?;
            } else if matches!(kind, UoKind::Uor2Id | UoKind::Uo1Id) && ctx.profile.is_rtp() {
                (b.ip_id, b.ip_id_k) = append(b.ip_id, b.ip_id_k, f3, 3)?;
                (b.ts, b.ts_k) = append(b.ts, b.ts_k, e1, 8)?;
            } else {
                // Non-RTP: both parts extend the IP-ID.
                (b.ip_id, b.ip_id_k) = append(b.ip_id, b.ip_id_k, f3, 3)?;
                (b.ip_id, b.ip_id_k) = append(b.ip_id, b.ip_id_k, e1, 8)?;
            }
        }
        2 => {
            (b.sn, b.sn_k) = append(b.sn, b.sn_k, sn3, 3)?;
            let e1 = r.read_bits(8)?;
            let e2 = r.read_bits(8)?;
            if ctx.profile.is_rtp() {
                if t_is_ts(kind) {
                    (b.ts, b.ts_k) = append(b.ts, b.ts_k, f3, 3)?;
                    (b.ts, b.ts_k) = append(b.ts, b.ts_k, e1, 8)?;
                    (b.ip_id, b.ip_id_k) = append(b.ip_id, b.ip_id_k, e2, 8)?;
                } else {
                    (b.ip_id, b.ip_id_k) = append(b.ip_id, b.ip_id_k, f3, 3)?;
                    (b.ip_id, b.ip_id_k) = append(b.ip_id, b.ip_id_k, e1, 8)?;
                    (b.ts, b.ts_k) = append(b.ts, b.ts_k, e2, 8)?;
                }
            } else {
                // Outer IP-ID gets 11 bits, inner 8.
                (b.ip_id2, b.ip_id2_k) = append(b.ip_id2, b.ip_id2_k, f3, 3)?;
                (b.ip_id2, b.ip_id2_k) = append(b.ip_id2, b.ip_id2_k, e1, 8)?;
                (b.ip_id, b.ip_id_k) = append(b.ip_id, b.ip_id_k, e2, 8)?;
            }
        }
        3 => parse_extension3(ctx, r, e0 as u8, b)?,
        _ => unreachable!(),
    }
    Ok(())
}

/// Inner/outer IP header flags octets of extension 3.
///
/// ```text
/// inner: TOS TTL DF PR IPX NBO RND ip2/0
/// outer: TOS2 TTL2 DF2 PR2 IPX2 NBO2 RND2 I2
/// ```
fn parse_ip_flags(r: &mut BitReader) -> Result<(u8, bool)> {
    let f = r.read_bits(8)? as u8;
    Ok((f, f & 0x01 != 0))
}

fn parse_ip_fields(
    ctx: &Context,
    r: &mut BitReader,
    flags: u8,
    outer: bool,
) -> Result<IpUpdate> {
    let mut up = IpUpdate {
        df: Some(flags & 0x20 != 0),
        nbo: Some(flags & 0x04 != 0),
        rnd: Some(flags & 0x02 != 0),
        ..Default::default()
    };
    if flags & 0x80 != 0 {
        up.tos = Some(r.read_u8()?);
    }
    if flags & 0x40 != 0 {
        up.ttl = Some(r.read_u8()?);
    }
    if flags & 0x10 != 0 {
        up.proto = Some(r.read_u8()?);
    }
    if flags & 0x08 != 0 {
        let ip = if outer {
            ctx.outer.as_ref()
        } else {
            ctx.innermost()
        };
        let lists = ip
            .and_then(|i| i.list.as_ref())
            .ok_or_else(|| Error::Malformed("list update for a non-IPv6 header".into()))?;
        up.list = Some(lists.decode(r)?);
    }
    Ok(up)
}

/// Extension 3. RTP flows: `11 S R-TS Tsc I ip rtp`; others:
/// `11 S Mode I ip ip2`.
fn parse_extension3(ctx: &Context, r: &mut BitReader, e0: u8, b: &mut Bits) -> Result<()> {
    let rtp_profile = ctx.profile.is_rtp();
    let s = e0 & 0x20 != 0;
    let (r_ts, tsc, i, ip, rtp_flag, mode, mut ip2) = if rtp_profile {
        (
            e0 & 0x10 != 0,
            e0 & 0x08 != 0,
            e0 & 0x04 != 0,
            e0 & 0x02 != 0,
            e0 & 0x01 != 0,
            None,
            false,
        )
    } else {
        (
            false,
            false,
            e0 & 0x04 != 0,
            e0 & 0x02 != 0,
            false,
            Some((e0 >> 3) & 0x3),
            e0 & 0x01 != 0,
        )
    };
    b.mode = mode;

    let inner_flags = if ip {
        let (f, last_bit) = parse_ip_flags(r)?;
        if rtp_profile {
            ip2 = last_bit;
        }
        Some(f)
    } else {
        None
    };
    let outer_flags = if ip2 {
        Some(parse_ip_flags(r)?.0)
    } else {
        None
    };
    if s {
        let sn8 = r.read_bits(8)?;
        (b.sn, b.sn_k) = append(b.sn, b.sn_k, sn8, 8)?;
    }
    if r_ts {
        let (ts, len) = bits::sdvl_decode(r)?;
        let ts_bits = [7, 14, 21, 29][len - 1];
        b.ts_scaled = tsc;
        if tsc {
            // Scaled TS replaces any base-header TS bits.
            b.ts = ts;
            b.ts_k = ts_bits;
        } else {
            (b.ts, b.ts_k) = append(b.ts, b.ts_k, ts, ts_bits)?;
        }
    } else if tsc {
        // Tsc reinterprets the base header TS bits as scaled.
        b.ts_scaled = true;
    }
    if let Some(f) = inner_flags {
        b.inner_update = Some(parse_ip_fields(ctx, r, f, false)?);
    }
    if i {
        b.ip_id = u32::from(r.read_u16()?);
        b.ip_id_k = 16;
    }
    if let Some(f) = outer_flags {
        b.outer_update = Some(parse_ip_fields(ctx, r, f, true)?);
        if f & 0x01 != 0 {
            // I2: full outer IP-ID.
            b.ip_id2 = u32::from(r.read_u16()?);
            b.ip_id2_k = 16;
        }
    }
    if rtp_flag {
        parse_rtp_flags(r, b)?;
    }
    Ok(())
}

/// RTP flags block of extension 3:
/// `Mode R-PT M R-X CSRC TSS TIS`, then `R-P | PT` if R-PT,
/// TS_STRIDE (SDVL) if TSS, TIME_STRIDE (SDVL) if TIS.
fn parse_rtp_flags(r: &mut BitReader, b: &mut Bits) -> Result<()> {
    let f = r.read_bits(8)? as u8;
    b.mode = Some(f >> 6);
    b.marker = Some(f & 0x10 != 0);
    b.rtp_x = Some(f & 0x08 != 0);
    if f & 0x04 != 0 {
        return Err(Error::Malformed("CSRC list in extension 3".into()));
    }
    if f & 0x20 != 0 {
        let p = r.read_bits(8)?;
        b.rtp_p = Some(p & 0x80 != 0);
        b.pt = Some((p & 0x7f) as u8);
    }
    if f & 0x02 != 0 {
        b.ts_stride = Some(bits::sdvl_decode(r)?.0);
    }
    if f & 0x01 != 0 {
        bits::sdvl_decode(r)?;
    }
    Ok(())
}

/// Fields sent in full after base header and extension: random IP-IDs
/// outer-first, then the UDP checksum.
fn parse_tail(ctx: &Context, r: &mut BitReader, b: &mut Bits) -> Result<()> {
    // The outer slot in the tail only exists for IP-in-IP flows.
    if ctx.inner.is_some() && effective_rnd(ctx.outer.as_ref(), b.update_for(ctx, true)) {
        b.tail.outer_ip_id = Some(r.read_u16()?);
    }
    if effective_rnd(ctx.innermost(), b.update_for(ctx, false)) {
        b.tail.inner_ip_id = Some(r.read_u16()?);
    }
    match &ctx.next {
        crate::context::NextRef::Udp { check_present, .. }
        | crate::context::NextRef::Rtp { check_present, .. } => {
            if *check_present {
                b.tail.udp_checksum = Some(r.read_u16()?);
            }
        }
        crate::context::NextRef::UdpLite { .. } => {
            b.tail.udp_checksum = Some(r.read_u16()?);
        }
        crate::context::NextRef::None => {}
    }
    Ok(())
}

/// RND after applying any extension-3 override.
fn effective_rnd(ip: Option<&crate::context::IpRef>, up: Option<&IpUpdate>) -> bool {
    match up.and_then(|u| u.rnd) {
        Some(rnd) => rnd,
        None => ip.is_some_and(|i| matches!(i.hdr, crate::headers::IpHeader::V4(_)) && i.rnd),
    }
}
