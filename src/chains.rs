/*! IR and IR-DYN chain parsing.

An IR packet re-seeds a context: the static chain pins the fields that
never change (addresses, ports, SSRC) and the dynamic chain the ones
that do (TTL, IP-ID, SN, TS...). IR-DYN carries only the dynamic chain
and leans on the static part already in the context.

Chains are self-describing downward: the IP version nibble selects v4 or
v6 parsing, the protocol/next-header field announces an inner IP header,
and the profile announces what follows the IP chain.
 */
use log::trace;

use crate::bits::{self, BitReader};
use crate::headers::Proto;
use crate::list::{ListDecompressor, PendingList};
use crate::profile::Profile;
use crate::{Error, Result};

/// Static description of one IP header.
#[derive(Debug, Clone)]
pub enum IpStatic {
    /// IPv4: protocol and addresses.
    V4 {
        /// Payload protocol.
        protocol: u8,
        /// Source address.
        src: [u8; 4],
        /// Destination address.
        dst: [u8; 4],
    },
    /// IPv6: flow label, next header and addresses.
    V6 {
        /// 20-bit flow label.
        flow_label: u32,
        /// Next header as sent; replaced by list order on rebuild.
        next: u8,
        /// Source address.
        src: [u8; 16],
        /// Destination address.
        dst: [u8; 16],
    },
}

/// IP version of one chain position; IR-DYN learns it from the
/// context instead of the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

impl IpStatic {
    /// Version of this header.
    #[must_use]
    pub fn version(&self) -> IpVersion {
        match self {
            IpStatic::V4 { .. } => IpVersion::V4,
            IpStatic::V6 { .. } => IpVersion::V6,
        }
    }

    /// Protocol/next-header value announcing what follows this header.
    #[must_use]
    pub fn next_proto(&self) -> u8 {
        match self {
            IpStatic::V4 { protocol, .. } => *protocol,
            IpStatic::V6 { next, .. } => *next,
        }
    }

    fn parse(r: &mut BitReader) -> Result<Self> {
        let version = r.peek_bits(4)?;
        match version {
            4 => {
                let b = r.read_u8()?;
                if b & 0x0f != 0 {
                    return Err(Error::Malformed(format!(
                        "reserved bits {b:#x} in IPv4 static part"
                    )));
                }
                let protocol = r.read_u8()?;
                let src = r.read_bytes(4)?.try_into().unwrap();
                let dst = r.read_bytes(4)?.try_into().unwrap();
                Ok(IpStatic::V4 { protocol, src, dst })
            }
            6 => {
                let b = r.read_u8()?;
                let fl_hi = u32::from(b & 0x0f);
                let fl_lo = r.read_bits(16)?;
                let next = r.read_u8()?;
                let src = r.read_bytes(16)?.try_into().unwrap();
                let dst = r.read_bytes(16)?.try_into().unwrap();
                Ok(IpStatic::V6 {
                    flow_label: (fl_hi << 16) | fl_lo,
                    next,
                    src,
                    dst,
                })
            }
            v => Err(Error::Malformed(format!("IP version {v} in static chain"))),
        }
    }
}

/// Static chain: one or two IP headers plus the profile's next header.
#[derive(Debug, Clone)]
pub struct StaticChain {
    /// Outer (or only) IP header.
    pub outer: IpStatic,
    /// Inner IP header when the outer one announces encapsulation.
    pub inner: Option<IpStatic>,
    /// What follows the IP chain.
    pub next: NextStatic,
}

/// Static part of the post-IP header.
#[derive(Debug, Clone)]
pub enum NextStatic {
    /// IP-only and uncompressed profiles.
    None,
    /// UDP and UDP-Lite: the port pair.
    Udp {
        /// Source port.
        sport: u16,
        /// Destination port.
        dport: u16,
    },
    /// RTP: ports plus SSRC.
    Rtp {
        /// Source port.
        sport: u16,
        /// Destination port.
        dport: u16,
        /// Synchronization source.
        ssrc: u32,
    },
}

/// Parse the static chain for `profile`.
pub fn parse_static(r: &mut BitReader, profile: Profile) -> Result<StaticChain> {
    let outer = IpStatic::parse(r)?;
    let inner = match outer.next_proto() {
        Proto::IPIP | Proto::IPV6 => Some(IpStatic::parse(r)?),
        _ => None,
    };
    let next = match profile {
        Profile::Udp | Profile::UdpLite => NextStatic::Udp {
            sport: r.read_u16()?,
            dport: r.read_u16()?,
        },
        Profile::Rtp => NextStatic::Rtp {
            sport: r.read_u16()?,
            dport: r.read_u16()?,
            ssrc: r.read_u32()?,
        },
        Profile::Ip | Profile::Uncompressed => NextStatic::None,
    };
    trace!("static chain: {outer:?} inner={} {next:?}", inner.is_some());
    Ok(StaticChain { outer, inner, next })
}

/// Dynamic description of one IP header.
#[derive(Debug, Clone)]
pub enum IpDyn {
    /// IPv4 dynamic part.
    V4 {
        /// Type of service.
        tos: u8,
        /// Time to live.
        ttl: u8,
        /// Identification, wire order.
        id: u16,
        /// Don't-fragment.
        df: bool,
        /// IP-ID sent in full from now on.
        rnd: bool,
        /// IP-ID in network byte order.
        nbo: bool,
    },
    /// IPv6 dynamic part.
    V6 {
        /// Traffic class.
        tc: u8,
        /// Hop limit.
        hop_limit: u8,
        /// Extension-header list carried in the chain.
        list: PendingList,
    },
}

/// `DF|RND|NBO` flag bit positions in the IPv4 dynamic part.
const DF_BIT: u32 = 0x80;
const RND_BIT: u32 = 0x40;
const NBO_BIT: u32 = 0x20;

impl IpDyn {
    fn parse(r: &mut BitReader, version: IpVersion, lists: &ListDecompressor) -> Result<Self> {
        match version {
            IpVersion::V4 => {
                let tos = r.read_u8()?;
                let ttl = r.read_u8()?;
                let id = r.read_u16()?;
                let flags = r.read_bits(8)?;
                Ok(IpDyn::V4 {
                    tos,
                    ttl,
                    id,
                    df: flags & DF_BIT != 0,
                    rnd: flags & RND_BIT != 0,
                    nbo: flags & NBO_BIT != 0,
                })
            }
            IpVersion::V6 => {
                let tc = r.read_u8()?;
                let hop_limit = r.read_u8()?;
                let list = lists.decode(r)?;
                Ok(IpDyn::V6 {
                    tc,
                    hop_limit,
                    list,
                })
            }
        }
    }
}

/// Dynamic part of the RTP header.
#[derive(Debug, Clone)]
pub struct RtpDyn {
    /// Padding bit.
    pub padding: bool,
    /// RTP header extension bit.
    pub hdr_ext: bool,
    /// Marker bit.
    pub marker: bool,
    /// Payload type.
    pub pt: u8,
    /// Sequence number.
    pub sn: u16,
    /// Timestamp.
    pub ts: u32,
    /// Timestamp stride, when signalled.
    pub ts_stride: Option<u32>,
    /// Mode bits from the RX octet.
    pub mode: u8,
}

/// Dynamic part of the post-IP header.
#[derive(Debug, Clone)]
pub enum NextDyn {
    /// IP-only profile.
    None,
    /// UDP checksum; zero disables per-packet checksums.
    Udp {
        /// Checksum from the chain.
        checksum: u16,
    },
    /// UDP-Lite coverage and checksum.
    UdpLite {
        /// Checksum coverage.
        coverage: u16,
        /// Checksum.
        checksum: u16,
    },
    /// UDP checksum followed by the RTP dynamic part.
    Rtp {
        /// UDP checksum from the chain.
        checksum: u16,
        /// RTP fields.
        rtp: RtpDyn,
    },
}

/// Dynamic chain: per-IP dynamic parts, next-header dynamic part, and
/// the trailing explicit SN for profiles that carry one.
#[derive(Debug, Clone)]
pub struct DynChain {
    /// Outer (or only) IP dynamic part.
    pub outer: IpDyn,
    /// Inner IP dynamic part.
    pub inner: Option<IpDyn>,
    /// Post-IP dynamic part.
    pub next: NextDyn,
    /// Explicit sequence number (IP, UDP, UDP-Lite profiles).
    pub sn: Option<u16>,
}

/// A compressed CSRC list must be empty: CSRC compression is out of
/// scope, and a nonzero CC was already rejected.
fn parse_empty_csrc_list(r: &mut BitReader) -> Result<()> {
    let byte0 = r.read_u8()?;
    if byte0 >> 6 != 0 || byte0 & 0x0f != 0 {
        return Err(Error::Malformed("nonempty CSRC list".into()));
    }
    if byte0 & 0x20 != 0 {
        r.skip_bits(8)?;
    }
    Ok(())
}

/// RX octet of the RTP dynamic part: `X | Mode | TSS | TIS | pad(3)`.
fn parse_rtp_rx(r: &mut BitReader) -> Result<(bool, u8, bool, bool)> {
    let b = r.read_bits(8)?;
    Ok((
        b & 0x80 != 0,
        ((b >> 5) & 0x3) as u8,
        b & 0x10 != 0,
        b & 0x08 != 0,
    ))
}

/// Parse the dynamic chain. `versions` describes the IP headers (from
/// this packet's static chain or from the context for IR-DYN); `lists`
/// supplies per-position list state for IPv6 headers.
pub fn parse_dynamic(
    r: &mut BitReader,
    profile: Profile,
    versions: (IpVersion, Option<IpVersion>),
    lists: (&ListDecompressor, &ListDecompressor),
) -> Result<DynChain> {
    let outer = IpDyn::parse(r, versions.0, lists.0)?;
    let inner = match versions.1 {
        Some(v) => Some(IpDyn::parse(r, v, lists.1)?),
        None => None,
    };
    let next = match profile {
        Profile::Ip | Profile::Uncompressed => NextDyn::None,
        Profile::Udp => NextDyn::Udp {
            checksum: r.read_u16()?,
        },
        Profile::UdpLite => NextDyn::UdpLite {
            coverage: r.read_u16()?,
            checksum: r.read_u16()?,
        },
        Profile::Rtp => {
            let checksum = r.read_u16()?;
            let b0 = r.read_bits(8)?;
            if b0 >> 6 != 2 {
                return Err(Error::Malformed(format!("RTP version {}", b0 >> 6)));
            }
            if b0 & 0x0f != 0 {
                return Err(Error::Malformed("RTP dynamic part with CSRC".into()));
            }
            let rx = b0 & 0x10 != 0;
            let b1 = r.read_bits(8)?;
            let sn = r.read_u16()?;
            let ts = r.read_u32()?;
            parse_empty_csrc_list(r)?;
            let (hdr_ext, mode, tss, tis) = if rx {
                parse_rtp_rx(r)?
            } else {
                (false, 0, false, false)
            };
            let ts_stride = if tss {
                Some(bits::sdvl_decode(r)?.0)
            } else {
                None
            };
            if tis {
                // TIME_STRIDE is accepted and ignored: timer-based TS
                // decompression is not performed.
                bits::sdvl_decode(r)?;
            }
            NextDyn::Rtp {
                checksum,
                rtp: RtpDyn {
                    padding: b0 & 0x20 != 0,
                    hdr_ext,
                    marker: b1 & 0x80 != 0,
                    pt: (b1 & 0x7f) as u8,
                    sn,
                    ts,
                    ts_stride,
                    mode,
                },
            }
        }
    };
    let sn = if profile.explicit_sn() {
        Some(r.read_u16()?)
    } else {
        None
    };
    trace!("dynamic chain: sn={sn:?}");
    Ok(DynChain {
        outer,
        inner,
        next,
        sn,
    })
}
