/*! The decompressor: context registry and per-packet pipeline.

One [`Decompressor`] serves one ROHC channel. It routes each incoming
packet to its context via the CID framing, drives the parse → decode →
rebuild → validate pipeline, and owns the only mutable state: the
context map. All mutation happens after validation; a packet that fails
anywhere leaves every reference exactly as it was.

The engine is single threaded by design. Callers that shard flows
across threads hold one `Decompressor` per channel, or wrap this one in
the lock of their choice; lookups dominate, so a reader-preferring lock
does well.
 */
use std::collections::HashMap;

use itertools::Itertools;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::bits::BitReader;
use crate::chains::{self, IpDyn, IpStatic, NextDyn, NextStatic};
use crate::cid::CidType;
use crate::context::{Context, IpRef, NextRef, State, Stats};
use crate::crc::{self, CrcKind};
use crate::headers::{IpHeader, Ipv4, Ipv6, Rtp, Udp, UdpLite};
use crate::list::ListDecompressor;
use crate::packet::{self, Kind};
use crate::profile::{Profile, ProfileIds};
use crate::{Error, Result, decode, ipid, rebuild, repair};

/// Channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// CID encoding, fixed per channel.
    pub cid_type: CidType,
    /// Highest acceptable CID.
    pub max_cid: u16,
    /// Enabled profile numbers.
    pub profiles: Vec<u16>,
    /// Correction attempts before a context is demoted.
    pub correction_counter_max: u32,
    /// List generation window size (≥ 2).
    pub list_window: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cid_type: CidType::Small,
            max_cid: 15,
            profiles: vec![
                ProfileIds::UNCOMPRESSED,
                ProfileIds::RTP,
                ProfileIds::UDP,
                ProfileIds::UDPLITE,
                ProfileIds::IP,
            ],
            correction_counter_max: 3,
            list_window: 100,
        }
    }
}

/// Snapshot of one context for the channel report.
#[derive(Debug, Clone, Serialize)]
pub struct ContextReport {
    /// Context identifier.
    pub cid: u16,
    /// Wire profile number.
    pub profile: u16,
    /// Trust level.
    pub state: State,
    /// Current SN reference.
    pub sn_ref: u16,
    /// Correction counter.
    pub correction_counter: u32,
    /// Packet counters.
    pub stats: Stats,
}

/// Channel-wide report, JSON-dumpable for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    /// Per-context snapshots, ordered by CID.
    pub contexts: Vec<ContextReport>,
}

impl Report {
    /// Serialize to a JSON string.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap()
    }
}

/// ROHC channel decompressor.
#[derive(Debug, Clone)]
pub struct Decompressor {
    config: Config,
    contexts: HashMap<u16, Context>,
}

impl Decompressor {
    /// Create a decompressor for `config`.
    pub fn new(config: Config) -> Result<Self> {
        if config.cid_type == CidType::Small && config.max_cid > 15 {
            return Err(Error::Malformed(format!(
                "max_cid {} on a small-CID channel",
                config.max_cid
            )));
        }
        if config.list_window < 2 {
            return Err(Error::Malformed(format!(
                "list window {} below minimum",
                config.list_window
            )));
        }
        Ok(Self {
            config,
            contexts: HashMap::new(),
        })
    }

    /// Decompress one packet. `now` is a caller-supplied monotonic
    /// timestamp in milliseconds; it feeds the clock-based repair and
    /// never blocks.
    ///
    /// Returns the reconstructed IP packet. An IR without a dynamic
    /// chain establishes static state only and returns an empty vec.
    pub fn decompress(&mut self, packet: &[u8], now: u64) -> Result<Vec<u8>> {
        let (cid, buf) = crate::cid::strip(self.config.cid_type, packet)?;
        if cid > self.config.max_cid {
            return Err(Error::Malformed(format!(
                "CID {cid} above max_cid {}",
                self.config.max_cid
            )));
        }
        let first = *buf
            .first()
            .ok_or_else(|| Error::Malformed("nothing after CID framing".into()))?;
        match packet::discriminate(first)? {
            Kind::Feedback => Err(Error::Malformed(
                "feedback on the decompression path".into(),
            )),
            Kind::Ir { d } => self.handle_ir(cid, &buf, d, now),
            Kind::IrDyn => self.handle_ir_dyn(cid, &buf, now),
            Kind::Uo0 | Kind::Uo1 | Kind::Uor2 => self.handle_uo(cid, &buf, now),
        }
    }

    /// Tear down one context. Returns whether it existed.
    pub fn remove_context(&mut self, cid: u16) -> bool {
        self.contexts.remove(&cid).is_some()
    }

    /// Tear down every context.
    pub fn clear(&mut self) {
        self.contexts.clear();
    }

    /// Trust level of a context, if it exists.
    #[must_use]
    pub fn context_state(&self, cid: u16) -> Option<State> {
        self.contexts.get(&cid).map(|c| c.state)
    }

    /// Channel report.
    #[must_use]
    pub fn report(&self) -> Report {
        Report {
            contexts: self
                .contexts
                .iter()
                .sorted_by_key(|(cid, _)| **cid)
                .map(|(cid, c)| ContextReport {
                    cid: *cid,
                    profile: c.profile.id(),
                    state: c.state,
                    sn_ref: c.sn_ref,
                    correction_counter: c.correction_counter,
                    stats: c.stats,
                })
                .collect(),
        }
    }

    fn check_profile(&self, id: u16) -> Result<Profile> {
        if !self.config.profiles.contains(&id) {
            return Err(Error::UnsupportedProfile { profile: id });
        }
        Profile::from_id(id).ok_or(Error::UnsupportedProfile { profile: id })
    }

    /// List state for the two possible IP positions of a context:
    /// existing state on refresh, fresh tables otherwise.
    fn lists_for(&self, cid: u16) -> (ListDecompressor, ListDecompressor) {
        let pick = |f: fn(&Context) -> Option<&IpRef>| {
            self.contexts
                .get(&cid)
                .and_then(f)
                .and_then(|ip| ip.list.clone())
                .unwrap_or_else(|| ListDecompressor::new(self.config.list_window))
        };
        (pick(|c| c.outer.as_ref()), pick(|c| c.inner.as_ref()))
    }

    fn handle_ir(&mut self, cid: u16, buf: &[u8], d: bool, now: u64) -> Result<Vec<u8>> {
        let mut r = BitReader::new(buf);
        r.skip_bits(8)?;
        let profile_octet = r.read_u8()?;
        let crc_field = r.read_u8()?;
        let profile = self.check_profile(u16::from(profile_octet))?;
        debug!("IR for CID {cid}, profile {profile:?}, D={d}");

        if profile == Profile::Uncompressed {
            verify_ir_crc(buf, r.byte_pos(), crc_field)?;
            let payload = r.rest()?.to_vec();
            let mut ctx = Context::new(profile, State::FullContext);
            ctx.touch(now);
            ctx.stats.ok += 1;
            self.contexts.insert(cid, ctx);
            info!("CID {cid}: uncompressed context established");
            return Ok(payload);
        }

        let stat = chains::parse_static(&mut r, profile)?;
        let (outer_ld, inner_ld) = self.lists_for(cid);
        let dyn_chain = if d {
            Some(chains::parse_dynamic(
                &mut r,
                profile,
                (
                    stat.outer.version(),
                    stat.inner.as_ref().map(IpStatic::version),
                ),
                (&outer_ld, &inner_ld),
            )?)
        } else {
            None
        };
        let header_len = r.byte_pos();
        verify_ir_crc(buf, header_len, crc_field)?;
        let payload = &buf[header_len..];

        let mut ctx = Context::new(
            profile,
            if d {
                State::FullContext
            } else {
                State::StaticContext
            },
        );
        ctx.outer = Some(make_ip_ref(
            &stat.outer,
            dyn_chain.as_ref().map(|c| &c.outer),
            outer_ld,
        )?);
        ctx.inner = match &stat.inner {
            Some(s) => Some(make_ip_ref(
                s,
                dyn_chain.as_ref().and_then(|c| c.inner.as_ref()),
                inner_ld,
            )?),
            None => None,
        };
        ctx.next = make_next_ref(&stat.next, dyn_chain.as_ref().map(|c| &c.next))?;
        ctx.sn_ref = chain_sn(dyn_chain.as_ref());
        ctx.touch(now);
        ctx.stats.ok += 1;

        let out = if d {
            let mut out = rebuild::serialize(
                ctx.outer.as_ref().expect("just set"),
                ctx.inner.as_ref(),
                &ctx.next,
                payload.len(),
            );
            out.extend(payload);
            out
        } else {
            Vec::new()
        };
        info!(
            "CID {cid}: context established in {:?} at SN {}",
            ctx.state, ctx.sn_ref
        );
        self.contexts.insert(cid, ctx);
        Ok(out)
    }

    fn handle_ir_dyn(&mut self, cid: u16, buf: &[u8], now: u64) -> Result<Vec<u8>> {
        let ctx = self
            .contexts
            .get(&cid)
            .ok_or(Error::NoContext { cid })?;
        let mut r = BitReader::new(buf);
        r.skip_bits(8)?;
        let profile_octet = r.read_u8()?;
        let crc_field = r.read_u8()?;
        let profile = self.check_profile(u16::from(profile_octet))?;
        if profile != ctx.profile {
            return Err(Error::Malformed(format!(
                "IR-DYN profile {profile:?} against a {:?} context",
                ctx.profile
            )));
        }
        if profile == Profile::Uncompressed {
            verify_ir_crc(buf, r.byte_pos(), crc_field)?;
            let payload = r.rest()?.to_vec();
            let ctx = self.contexts.get_mut(&cid).expect("checked above");
            ctx.touch(now);
            ctx.stats.ok += 1;
            return Ok(payload);
        }

        let outer_ref = ctx
            .outer
            .as_ref()
            .ok_or_else(|| Error::Malformed("context without IP state".into()))?;
        let versions = (
            version_of(&outer_ref.hdr),
            ctx.inner.as_ref().map(|ip| version_of(&ip.hdr)),
        );
        let (outer_ld, inner_ld) = self.lists_for(cid);
        let dyn_chain =
            chains::parse_dynamic(&mut r, profile, versions, (&outer_ld, &inner_ld))?;
        let header_len = r.byte_pos();
        verify_ir_crc(buf, header_len, crc_field)?;
        let payload = &buf[header_len..];

        let new_outer = refresh_ip_ref(outer_ref, &dyn_chain.outer)?;
        let new_inner = match (&ctx.inner, &dyn_chain.inner) {
            (Some(old), Some(dynp)) => Some(refresh_ip_ref(old, dynp)?),
            (None, None) => None,
            _ => {
                return Err(Error::Malformed(
                    "dynamic chain shape does not match the context".into(),
                ));
            }
        };
        let new_next = refresh_next_ref(&ctx.next, &dyn_chain.next)?;
        let sn = chain_sn(Some(&dyn_chain));

        let mut out = rebuild::serialize(&new_outer, new_inner.as_ref(), &new_next, payload.len());
        out.extend(payload);

        let ctx = self.contexts.get_mut(&cid).expect("checked above");
        ctx.outer = Some(new_outer);
        ctx.inner = new_inner;
        ctx.next = new_next;
        ctx.sn_ref = sn;
        ctx.state = State::FullContext;
        ctx.correction_counter = 0;
        ctx.touch(now);
        ctx.stats.ok += 1;
        info!("CID {cid}: dynamic refresh to SN {sn}");
        Ok(out)
    }

    fn handle_uo(&mut self, cid: u16, buf: &[u8], now: u64) -> Result<Vec<u8>> {
        let Some(ctx) = self.contexts.get(&cid) else {
            return Err(Error::NoContext { cid });
        };
        if ctx.profile == Profile::Uncompressed {
            let ctx = self.contexts.get_mut(&cid).expect("just found");
            ctx.touch(now);
            ctx.stats.ok += 1;
            return Ok(buf.to_vec());
        }
        if ctx.state != State::FullContext {
            return Err(Error::NoContext { cid });
        }

        let (kind, bits) = packet::parse_uo(ctx, buf)?;
        let payload = &buf[bits.header_len..];
        let sn0 = decode::decode_sn(ctx, &bits);
        let values = decode::decode_with_sn(ctx, &bits, sn0)?;
        let rebuilt = rebuild::rebuild(ctx, &bits, &values, payload.len())?;

        if rebuilt.crc == bits.crc {
            let mut out = rebuilt.headers.clone();
            out.extend(payload);
            let ctx = self.contexts.get_mut(&cid).expect("just found");
            commit(ctx, rebuilt, &bits, values.sn, now);
            ctx.correction_counter = 0;
            ctx.stats.ok += 1;
            return Ok(out);
        }
        debug!(
            "CID {cid}: {kind:?} CRC mismatch (got {:#x}, want {:#x})",
            rebuilt.crc, bits.crc
        );

        let exhausted = ctx.correction_counter + 1 > self.config.correction_counter_max;
        let repaired = if exhausted {
            None
        } else {
            repair::attempt(ctx, &bits, sn0, payload.len(), now)?
        };
        match repaired {
            Some(rep) => {
                let mut out = rep.rebuilt.headers.clone();
                out.extend(payload);
                let ctx = self.contexts.get_mut(&cid).expect("just found");
                let sn = rep.values.sn;
                commit(ctx, rep.rebuilt, &bits, sn, now);
                ctx.correction_counter += 1;
                ctx.stats.repaired += 1;
                ctx.stats.ok += 1;
                Ok(out)
            }
            None => {
                let max = self.config.correction_counter_max;
                let ctx = self.contexts.get_mut(&cid).expect("just found");
                ctx.correction_counter += 1;
                ctx.stats.failed += 1;
                if ctx.correction_counter > max {
                    ctx.state = State::StaticContext;
                    info!("CID {cid}: repair budget exhausted, context demoted");
                }
                Err(Error::CrcFailureUnrepairable { cid })
            }
        }
    }
}

/// Commit a validated reconstruction into the context.
fn commit(
    ctx: &mut Context,
    rebuilt: rebuild::Rebuilt,
    bits: &packet::Bits,
    sn: u16,
    now: u64,
) {
    ctx.outer = Some(rebuilt.outer);
    ctx.inner = rebuilt.inner;
    ctx.next = rebuilt.next;
    ctx.sn_ref = sn;
    if let Some(mode) = bits.mode {
        ctx.mode = mode;
    }
    ctx.touch(now);
}

/// Verify the IR/IR-DYN CRC-8: computed over the ROHC header with the
/// CRC octet (offset 2) zeroed.
fn verify_ir_crc(buf: &[u8], header_len: usize, crc_field: u8) -> Result<()> {
    let mut v = crc::update(CrcKind::Crc8, CrcKind::Crc8.init(), &buf[..2]);
    v = crc::update(CrcKind::Crc8, v, &[0]);
    v = crc::update(CrcKind::Crc8, v, &buf[3..header_len]);
    if v == crc_field {
        Ok(())
    } else {
        Err(Error::Malformed(format!(
            "IR header CRC mismatch (got {v:#04x}, want {crc_field:#04x})"
        )))
    }
}

fn version_of(hdr: &IpHeader) -> chains::IpVersion {
    match hdr {
        IpHeader::V4(_) => chains::IpVersion::V4,
        IpHeader::V6(_) => chains::IpVersion::V6,
    }
}

/// Explicit or RTP-carried SN of a dynamic chain.
fn chain_sn(chain: Option<&chains::DynChain>) -> u16 {
    match chain {
        Some(c) => c.sn.unwrap_or(match &c.next {
            NextDyn::Rtp { rtp, .. } => rtp.sn,
            _ => 0,
        }),
        None => 0,
    }
}

/// Build a reference from static and dynamic chain parts. A missing
/// dynamic part zeroes the changing fields; the context stays static
/// only.
fn make_ip_ref(
    stat: &IpStatic,
    dynp: Option<&IpDyn>,
    ld: ListDecompressor,
) -> Result<IpRef> {
    match stat {
        IpStatic::V4 { protocol, src, dst } => {
            let (tos, ttl, id, df, rnd, nbo) = match dynp {
                Some(IpDyn::V4 {
                    tos,
                    ttl,
                    id,
                    df,
                    rnd,
                    nbo,
                }) => (*tos, *ttl, *id, *df, *rnd, *nbo),
                Some(IpDyn::V6 { .. }) => {
                    return Err(Error::Malformed(
                        "IPv6 dynamic part for an IPv4 header".into(),
                    ));
                }
                None => (0, 0, 0, false, false, true),
            };
            Ok(IpRef {
                hdr: IpHeader::V4(Ipv4 {
                    tos,
                    id,
                    df,
                    ttl,
                    protocol: *protocol,
                    src: *src,
                    dst: *dst,
                }),
                rnd,
                nbo,
                ip_id_ref: if rnd { id } else { ipid::to_wire(id, nbo) },
                list: None,
            })
        }
        IpStatic::V6 {
            flow_label,
            next,
            src,
            dst,
        } => {
            let mut ld = ld;
            let (tc, hop_limit, exts) = match dynp {
                Some(IpDyn::V6 {
                    tc,
                    hop_limit,
                    list,
                }) => {
                    let chain = ld.chain(list)?;
                    ld.commit(list.clone());
                    (*tc, *hop_limit, chain)
                }
                Some(IpDyn::V4 { .. }) => {
                    return Err(Error::Malformed(
                        "IPv4 dynamic part for an IPv6 header".into(),
                    ));
                }
                None => (0, 0, Vec::new()),
            };
            Ok(IpRef {
                hdr: IpHeader::V6(Ipv6 {
                    tc,
                    flow_label: *flow_label,
                    hop_limit,
                    src: *src,
                    dst: *dst,
                    transport: *next,
                    exts,
                }),
                rnd: false,
                nbo: true,
                ip_id_ref: 0,
                list: Some(ld),
            })
        }
    }
}

/// Refresh the dynamic half of an existing reference (IR-DYN).
fn refresh_ip_ref(old: &IpRef, dynp: &IpDyn) -> Result<IpRef> {
    let mut new = old.clone();
    match (&mut new.hdr, dynp) {
        (
            IpHeader::V4(v4),
            IpDyn::V4 {
                tos,
                ttl,
                id,
                df,
                rnd,
                nbo,
            },
        ) => {
            v4.tos = *tos;
            v4.ttl = *ttl;
            v4.id = *id;
            v4.df = *df;
            new.rnd = *rnd;
            new.nbo = *nbo;
            new.ip_id_ref = if *rnd { *id } else { ipid::to_wire(*id, *nbo) };
        }
        (
            IpHeader::V6(v6),
            IpDyn::V6 {
                tc,
                hop_limit,
                list,
            },
        ) => {
            v6.tc = *tc;
            v6.hop_limit = *hop_limit;
            let ld = new
                .list
                .as_mut()
                .ok_or_else(|| Error::Malformed("IPv6 reference without list state".into()))?;
            v6.exts = ld.chain(list)?;
            ld.commit(list.clone());
        }
        _ => {
            return Err(Error::Malformed(
                "dynamic part does not match the IP version".into(),
            ));
        }
    }
    Ok(new)
}

/// Combine static and dynamic next-header parts into a reference.
fn make_next_ref(stat: &NextStatic, dynp: Option<&NextDyn>) -> Result<NextRef> {
    match (stat, dynp) {
        (NextStatic::None, None | Some(NextDyn::None)) => Ok(NextRef::None),
        (NextStatic::Udp { sport, dport }, Some(NextDyn::Udp { checksum })) => Ok(NextRef::Udp {
            udp: Udp {
                sport: *sport,
                dport: *dport,
                checksum: *checksum,
            },
            check_present: *checksum != 0,
        }),
        (NextStatic::Udp { sport, dport }, Some(NextDyn::UdpLite { coverage, checksum })) => {
            Ok(NextRef::UdpLite {
                lite: UdpLite {
                    sport: *sport,
                    dport: *dport,
                    coverage: *coverage,
                    checksum: *checksum,
                },
            })
        }
        (NextStatic::Udp { sport, dport }, None) => Ok(NextRef::Udp {
            udp: Udp {
                sport: *sport,
                dport: *dport,
                checksum: 0,
            },
            check_present: false,
        }),
        (NextStatic::Rtp { sport, dport, ssrc }, Some(NextDyn::Rtp { checksum, rtp })) => {
            Ok(NextRef::Rtp {
                udp: Udp {
                    sport: *sport,
                    dport: *dport,
                    checksum: *checksum,
                },
                check_present: *checksum != 0,
                rtp: Rtp {
                    padding: rtp.padding,
                    ext: rtp.hdr_ext,
                    marker: rtp.marker,
                    pt: rtp.pt,
                    sn: rtp.sn,
                    ts: rtp.ts,
                    ssrc: *ssrc,
                },
                ts_stride: rtp.ts_stride.unwrap_or(0),
            })
        }
        (NextStatic::Rtp { sport, dport, ssrc }, None) => Ok(NextRef::Rtp {
            udp: Udp {
                sport: *sport,
                dport: *dport,
                checksum: 0,
            },
            check_present: false,
            rtp: Rtp {
                padding: false,
                ext: false,
                marker: false,
                pt: 0,
                sn: 0,
                ts: 0,
                ssrc: *ssrc,
            },
            ts_stride: 0,
        }),
        _ => Err(Error::Malformed(
            "dynamic chain does not match the profile".into(),
        )),
    }
}

/// Refresh the next-header reference from an IR-DYN chain.
fn refresh_next_ref(old: &NextRef, dynp: &NextDyn) -> Result<NextRef> {
    match (old, dynp) {
        (NextRef::None, NextDyn::None) => Ok(NextRef::None),
        (NextRef::Udp { udp, .. }, NextDyn::Udp { checksum }) => Ok(NextRef::Udp {
            udp: Udp {
                checksum: *checksum,
                ..*udp
            },
            check_present: *checksum != 0,
        }),
        (NextRef::UdpLite { lite }, NextDyn::UdpLite { coverage, checksum }) => {
            Ok(NextRef::UdpLite {
                lite: UdpLite {
                    coverage: *coverage,
                    checksum: *checksum,
                    ..*lite
                },
            })
        }
        (
            NextRef::Rtp {
                udp,
                rtp: old_rtp,
                ts_stride,
                ..
            },
            NextDyn::Rtp { checksum, rtp },
        ) => Ok(NextRef::Rtp {
            udp: Udp {
                checksum: *checksum,
                ..*udp
            },
            check_present: *checksum != 0,
            rtp: Rtp {
                padding: rtp.padding,
                ext: rtp.hdr_ext,
                marker: rtp.marker,
                pt: rtp.pt,
                sn: rtp.sn,
                ts: rtp.ts,
                ssrc: old_rtp.ssrc,
            },
            ts_stride: rtp.ts_stride.unwrap_or(*ts_stride),
        }),
        _ => Err(Error::Malformed(
            "dynamic chain does not match the context".into(),
        )),
    }
}
