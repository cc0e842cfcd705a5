//! End-to-end decompression scenarios: each test plays compressor,
//! crafting wire bytes octet by octet, and checks the engine's
//! reconstruction against independently serialized headers.

use anyhow::Result;

use rohcdec::context::{IpRef, NextRef};
use rohcdec::crc::{self, CrcKind};
use rohcdec::decomp::{Config, Decompressor};
use rohcdec::headers::{ExtHeader, IpHeader, Ipv4, Ipv6, Proto, Rtp, Udp};
use rohcdec::profile::ProfileIds;
use rohcdec::{Error, cid, lsb, rebuild};

const SRC: [u8; 4] = [10, 0, 0, 1];
const DST: [u8; 4] = [10, 0, 0, 2];

/// Fill in the CRC-8 octet of a hand-built IR/IR-DYN header (payload
/// must not be appended yet).
fn seal_ir(mut header: Vec<u8>) -> Vec<u8> {
    assert_eq!(header[2], 0);
    header[2] = crc::over(CrcKind::Crc8, &header);
    header
}

/// IR for an IPv4/UDP flow: checksum disabled, sequential IP-ID.
fn ir_udp_v4(sn: u16, ip_id: u16, ttl: u8) -> Vec<u8> {
    let mut p = vec![0xfd, 0x02, 0x00];
    p.extend([0x40, 17]);
    p.extend(SRC);
    p.extend(DST);
    p.extend(5004u16.to_be_bytes());
    p.extend(5005u16.to_be_bytes());
    // Dynamic chain: TOS, TTL, IP-ID, DF|RND|NBO, UDP checksum, SN.
    p.push(0);
    p.push(ttl);
    p.extend(ip_id.to_be_bytes());
    p.push(0x20);
    p.extend(0u16.to_be_bytes());
    p.extend(sn.to_be_bytes());
    seal_ir(p)
}

/// Reference state the decompressor should hold after `ir_udp_v4` plus
/// `sn` advances.
fn udp_v4_refs(sn: u16, ip_id: u16, ttl: u8) -> (IpRef, NextRef) {
    let _ = sn;
    (
        IpRef {
            hdr: IpHeader::V4(Ipv4 {
                tos: 0,
                id: ip_id,
                df: false,
                ttl,
                protocol: 17,
                src: SRC,
                dst: DST,
            }),
            rnd: false,
            nbo: true,
            ip_id_ref: ip_id,
            list: None,
        },
        NextRef::Udp {
            udp: Udp {
                sport: 5004,
                dport: 5005,
                checksum: 0,
            },
            check_present: false,
        },
    )
}

/// Expected uncompressed packet and its 3-bit CRC.
fn expect_udp_v4(sn: u16, ip_id: u16, ttl: u8, payload: &[u8]) -> (Vec<u8>, u8) {
    let (outer, next) = udp_v4_refs(sn, ip_id, ttl);
    let mut bytes = rebuild::serialize(&outer, None, &next, payload.len());
    let crc = rebuild::header_crc(CrcKind::Crc3, &outer, None, &next, &bytes);
    bytes.extend(payload);
    (bytes, crc)
}

fn uo0(sn: u16, crc: u8) -> u8 {
    ((sn as u8 & 0x0f) << 3) | (crc & 0x07)
}

#[test]
fn ir_then_uo0_stream() -> Result<()> {
    let mut d = Decompressor::new(Config::default())?;
    let payload = b"data";

    let mut ir = ir_udp_v4(0, 1000, 64);
    ir.extend(payload);
    let out = d.decompress(&ir, 1000)?;
    let (want, _) = expect_udp_v4(0, 1000, 64, payload);
    assert_eq!(out, want);

    for sn in 1..=20u16 {
        // IP-ID rides the SN at a constant offset of 1000.
        let (want, crc) = expect_udp_v4(sn, 1000 + sn, 64, payload);
        let mut p = vec![uo0(sn, crc)];
        p.extend(payload);
        let out = d.decompress(&p, 1000 + u64::from(sn) * 20)?;
        assert_eq!(out, want, "packet {sn}");
        // Key dynamic field, byte for byte.
        assert_eq!(&out[4..6], &(1000 + sn).to_be_bytes());
    }
    let report = d.report();
    assert_eq!(report.contexts.len(), 1);
    assert_eq!(report.contexts[0].sn_ref, 20);
    assert_eq!(report.contexts[0].stats.ok, 21);
    assert_eq!(report.contexts[0].stats.repaired, 0);
    Ok(())
}

#[test]
fn missed_packets_recovered_beyond_window() -> Result<()> {
    // IR pins SN 100. The compressor then advances past the 4-bit
    // interpretation window [99, 114]; the matching CRC lets the
    // correction loop land on the true SN. 116 is the natural choice;
    // step forward only if its direct (wrong) guess happens to share a
    // 3-bit checksum with the truth.
    let mut d = Decompressor::new(Config::default())?;
    let ir = ir_udp_v4(100, 1100, 64);
    d.decompress(&ir, 1000)?;

    let target = (116..130u16)
        .find(|t| expect_udp_v4(t - 16, 1000 + (t - 16), 64, b"").1 != expect_udp_v4(*t, 1000 + t, 64, b"").1)
        .unwrap();
    let (want, crc) = expect_udp_v4(target, 1000 + target, 64, b"");
    let out = d.decompress(&[uo0(target, crc)], 1100)?;
    assert_eq!(out, want);
    assert_eq!(&out[4..6], &(1000 + target).to_be_bytes());
    let report = d.report();
    assert_eq!(report.contexts[0].sn_ref, target);
    assert_eq!(report.contexts[0].stats.repaired, 1);
    // Probation: the counter stays raised until a clean validation.
    assert_eq!(report.contexts[0].correction_counter, 1);

    let (_, crc) = expect_udp_v4(target + 1, 1001 + target, 64, b"");
    d.decompress(&[uo0(target + 1, crc)], 1120)?;
    assert_eq!(d.report().contexts[0].correction_counter, 0);
    Ok(())
}

#[test]
fn sn_wraparound_repair() -> Result<()> {
    // Reference near the top of the counter; the flow moved past the
    // wrap, beyond the interpretation window. The first guess lands
    // 2^4 short and fails its CRC; the wraparound hypothesis repairs
    // it. (Skip forward past any 3-bit checksum collision between the
    // wrong guess and the truth.)
    let mut d = Decompressor::new(Config::default())?;
    let ir = ir_udp_v4(65530, 200, 64);
    d.decompress(&ir, 1000)?;

    let offset = 200u16.wrapping_sub(65530);
    let id_at = |sn: u16| offset.wrapping_add(sn);
    let real_sn = (18..24u16)
        .find(|sn| {
            let guess = sn - 16;
            expect_udp_v4(guess, id_at(guess), 64, b"").1 != expect_udp_v4(*sn, id_at(*sn), 64, b"").1
        })
        .unwrap();
    let (want, crc) = expect_udp_v4(real_sn, id_at(real_sn), 64, b"");
    let out = d.decompress(&[uo0(real_sn, crc)], 1040)?;
    assert_eq!(out, want);
    let report = d.report();
    assert_eq!(report.contexts[0].sn_ref, real_sn);
    assert_eq!(report.contexts[0].stats.repaired, 1);
    Ok(())
}

#[test]
fn context_demotion_and_refresh() -> Result<()> {
    let mut d = Decompressor::new(Config::default())?;
    let ir = ir_udp_v4(50, 500, 64);
    d.decompress(&ir, 1000)?;

    // A CRC value no reachable reconstruction carries: not the direct
    // decode, not the wraparound candidate. (Clock repair stays off:
    // only one packet has committed, so no inter-arrival estimate.)
    let sn_bits = 0b0011u16;
    let direct = lsb::decode16(50, 4, sn_bits, 1);
    let wrapped = direct.wrapping_add(16);
    let crc_of = |sn: u16| expect_udp_v4(sn, 450u16.wrapping_add(sn), 64, b"").1;
    let forged = (0..8u8)
        .find(|c| *c != crc_of(direct) && *c != crc_of(wrapped))
        .unwrap();

    for attempt in 1..=4u64 {
        match d.decompress(&[uo0(sn_bits, forged)], 1000 + attempt) {
            Err(Error::CrcFailureUnrepairable { cid: 0 }) => {}
            other => panic!("attempt {attempt}: wanted CRC failure, got {other:?}"),
        }
    }
    // Budget exhausted: compressed packets bounce until a refresh.
    match d.decompress(&[uo0(sn_bits, forged)], 1010) {
        Err(Error::NoContext { cid: 0 }) => {}
        other => panic!("wanted NoContext, got {other:?}"),
    }

    // IR-DYN restores the dynamic chain on the surviving static state.
    let mut irdyn = vec![0xfe, 0x02, 0x00];
    irdyn.push(0);
    irdyn.push(64);
    irdyn.extend(600u16.to_be_bytes());
    irdyn.push(0x20);
    irdyn.extend(0u16.to_be_bytes());
    irdyn.extend(70u16.to_be_bytes());
    let out = d.decompress(&seal_ir(irdyn), 1100)?;
    let (want, _) = expect_udp_v4(70, 600, 64, b"");
    assert_eq!(out, want);

    let report = d.report();
    assert_eq!(report.contexts[0].sn_ref, 70);
    assert_eq!(report.contexts[0].correction_counter, 0);

    let (want, crc) = expect_udp_v4(71, 601, 64, b"");
    assert_eq!(d.decompress(&[uo0(71, crc)], 1120)?, want);
    Ok(())
}

const V6_SRC: [u8; 16] = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
const V6_DST: [u8; 16] = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2];

fn hbh_item() -> Vec<u8> {
    vec![Proto::HOPOPTS, 0, 1, 4, 0, 0, 0, 0]
}
fn dest_item() -> Vec<u8> {
    vec![Proto::DSTOPTS, 0, 1, 4, 0, 0, 0, 0]
}
fn ah_item() -> Vec<u8> {
    vec![Proto::AH, 1, 0, 0, 0, 0, 0, 9, 0, 0, 0, 1]
}

fn v6_refs(exts: Vec<ExtHeader>) -> (IpRef, NextRef) {
    (
        IpRef {
            hdr: IpHeader::V6(Ipv6 {
                tc: 0,
                flow_label: 0xbeef5,
                hop_limit: 64,
                src: V6_SRC,
                dst: V6_DST,
                transport: 17,
                exts,
            }),
            rnd: false,
            nbo: true,
            ip_id_ref: 0,
            list: None,
        },
        NextRef::Udp {
            udp: Udp {
                sport: 5004,
                dport: 5005,
                checksum: 0,
            },
            check_present: false,
        },
    )
}

fn ext(typ: u8, data: Vec<u8>) -> ExtHeader {
    ExtHeader { typ, data }
}

#[test]
fn ipv6_list_insertion() -> Result<()> {
    let mut d = Decompressor::new(Config::default())?;

    // IR with a Hop-by-Hop + Destination chain, generation 0.
    let mut ir = vec![0xfd, 0x02, 0x00];
    ir.push(0x60 | 0x0b);
    ir.extend([0xee, 0xf5]);
    ir.push(17);
    ir.extend(V6_SRC);
    ir.extend(V6_DST);
    ir.extend(5004u16.to_be_bytes());
    ir.extend(5005u16.to_be_bytes());
    // Dynamic: TC, hop limit, list (ET=0, GP=1, gen 0, two new items).
    ir.push(0);
    ir.push(64);
    ir.extend([0x22, 0x00, 0x89]);
    ir.extend(hbh_item());
    ir.extend(dest_item());
    ir.extend(0u16.to_be_bytes());
    ir.extend(5u16.to_be_bytes());
    let out = d.decompress(&seal_ir(ir), 1000)?;

    let exts0 = vec![
        ext(Proto::HOPOPTS, hbh_item()),
        ext(Proto::DSTOPTS, dest_item()),
    ];
    let (outer, next) = v6_refs(exts0);
    let want = rebuild::serialize(&outer, None, &next, 0);
    assert_eq!(out, want);
    // Chain threading: base → HBH → DEST → UDP.
    assert_eq!(out[6], Proto::HOPOPTS);
    assert_eq!(out[40], Proto::DSTOPTS);
    assert_eq!(out[48], 17);

    // UOR-2 with extension 3 publishing generation 1: insert an AH
    // between the two existing headers.
    let exts1 = vec![
        ext(Proto::HOPOPTS, hbh_item()),
        ext(Proto::AH, ah_item()),
        ext(Proto::DSTOPTS, dest_item()),
    ];
    let (outer1, next1) = v6_refs(exts1);
    let want = rebuild::serialize(&outer1, None, &next1, 0);
    let crc7 = rebuild::header_crc(CrcKind::Crc7, &outer1, None, &next1, &want);

    let mut p = vec![0xc0 | 6, 0x80 | crc7];
    p.push(0xc2); // ext3: ip=1
    p.push(0x08); // inner flags: IPX only
    p.extend([0x6a, 0x01, 0x00, 0b0010_0000]); // ET=1, gen 1 ref 0, insert @1
    p.extend(ah_item());
    let out = d.decompress(&p, 1050)?;
    assert_eq!(out, want);
    assert_eq!(out[40], Proto::AH);
    assert_eq!(out[48], Proto::DSTOPTS);
    assert_eq!(out[60], 17);
    assert_eq!(d.report().contexts[0].sn_ref, 6);
    Ok(())
}

#[test]
fn large_cid_routing() -> Result<()> {
    let config = Config {
        cid_type: rohcdec::cid::CidType::Large,
        max_cid: 1000,
        ..Config::default()
    };
    let mut d = Decompressor::new(config)?;

    // The CRC-8 covers the deframed header: CID bytes slot in after
    // the type octet only on the wire.
    let sealed = ir_udp_v4(7, 70, 64);
    let mut wire = vec![sealed[0], 0x81, 0x2c];
    wire.extend(&sealed[1..]);
    let out = d.decompress(&wire, 1000)?;
    let (want, _) = expect_udp_v4(7, 70, 64, b"");
    assert_eq!(out, want);

    let report = d.report();
    assert_eq!(report.contexts[0].cid, 300);

    let (want, crc) = expect_udp_v4(8, 71, 64, b"");
    let wire = vec![uo0(8, crc), 0x81, 0x2c];
    assert_eq!(d.decompress(&wire, 1020)?, want);
    // Same packet for an unknown large CID has no context.
    let wire = vec![uo0(8, crc), 0x12];
    assert!(matches!(
        d.decompress(&wire, 1020),
        Err(Error::NoContext { cid: 0x12 })
    ));
    Ok(())
}

#[test]
fn small_cid_add_octet() -> Result<()> {
    let mut d = Decompressor::new(Config::default())?;
    // Flow on CID 3.
    let mut wire = vec![cid::add_cid(3)];
    wire.extend(ir_udp_v4(1, 10, 64));
    d.decompress(&wire, 1000)?;
    assert_eq!(d.report().contexts[0].cid, 3);

    let (want, crc) = expect_udp_v4(2, 11, 64, b"");
    let wire = vec![cid::add_cid(3), uo0(2, crc)];
    assert_eq!(d.decompress(&wire, 1020)?, want);
    // The same packet without the add-CID octet is CID 0: no context.
    assert!(matches!(
        d.decompress(&[uo0(2, crc)], 1020),
        Err(Error::NoContext { cid: 0 })
    ));
    Ok(())
}

#[test]
fn commit_atomicity() -> Result<()> {
    let mut d = Decompressor::new(Config::default())?;
    d.decompress(&ir_udp_v4(10, 100, 64), 1000)?;
    let mut pristine = d.clone();

    // One garbage packet, then a valid one: the valid packet must
    // decode exactly as if the garbage was never offered.
    let (_, good_crc) = expect_udp_v4(11, 101, 64, b"");
    let forged = (good_crc + 1) & 0x07;
    let bad = [uo0(12, forged)];
    let _ = d.decompress(&bad, 1010);

    let good = [uo0(11, good_crc)];
    assert_eq!(d.decompress(&good, 1020)?, pristine.decompress(&good, 1020)?);
    Ok(())
}

fn rtp_refs(sn: u16, ts: u32, marker: bool, ip_id: u16) -> (IpRef, NextRef) {
    (
        IpRef {
            hdr: IpHeader::V4(Ipv4 {
                tos: 0,
                id: ip_id,
                df: false,
                ttl: 64,
                protocol: 17,
                src: SRC,
                dst: DST,
            }),
            rnd: false,
            nbo: true,
            ip_id_ref: ip_id,
            list: None,
        },
        NextRef::Rtp {
            udp: Udp {
                sport: 5004,
                dport: 5005,
                checksum: 0,
            },
            check_present: false,
            rtp: Rtp {
                padding: false,
                ext: false,
                marker,
                pt: 96,
                sn,
                ts,
                ssrc: 0xdeca_fbad,
            },
            ts_stride: 160,
        },
    )
}

#[test]
fn rtp_flow_with_inferred_ts() -> Result<()> {
    let config = Config {
        profiles: vec![ProfileIds::RTP],
        ..Config::default()
    };
    let mut d = Decompressor::new(config)?;

    // IR: IPv4 + UDP + RTP, TS stride 160 signalled via RX flags.
    let mut ir = vec![0xfd, 0x01, 0x00];
    ir.extend([0x40, 17]);
    ir.extend(SRC);
    ir.extend(DST);
    ir.extend(5004u16.to_be_bytes());
    ir.extend(5005u16.to_be_bytes());
    ir.extend(0xdeca_fbadu32.to_be_bytes());
    // Dynamic: IPv4 part, UDP checksum, RTP part.
    ir.push(0);
    ir.push(64);
    ir.extend(900u16.to_be_bytes());
    ir.push(0x20);
    ir.extend(0u16.to_be_bytes());
    ir.extend([0x90, 0x60]); // V=2 RX=1 CC=0; M=0 PT=96
    ir.extend(40u16.to_be_bytes());
    ir.extend(8000u32.to_be_bytes());
    ir.push(0x00); // empty CSRC list
    ir.push(0x10); // RX: X=0, mode 0, TSS=1
    ir.extend([0x80, 0xa0]); // TS_STRIDE 160, SDVL
    let out = d.decompress(&seal_ir(ir), 1000)?;
    let (outer, next) = rtp_refs(40, 8000, false, 900);
    assert_eq!(out, rebuild::serialize(&outer, None, &next, 0));

    // UO-1-ID: SN 41; TS follows the stride, IP-ID follows the SN.
    let (outer1, next1) = rtp_refs(41, 8160, false, 901);
    let want = rebuild::serialize(&outer1, None, &next1, 0);
    let crc = rebuild::header_crc(CrcKind::Crc3, &outer1, None, &next1, &want);
    // 10 T=0 IP-ID(5)=offset bits; offset unchanged → send LSBs of
    // the running offset (860).
    let p = [0x80 | (860u16 & 0x1f) as u8, ((41 & 0x0f) << 3) as u8 | crc];
    let out = d.decompress(&p, 1020)?;
    assert_eq!(out, want);
    // RTP SN and TS, byte for byte.
    assert_eq!(&out[30..32], &41u16.to_be_bytes());
    assert_eq!(&out[32..36], &8160u32.to_be_bytes());
    let rtp = Rtp::parse(&out[28..40])?;
    assert_eq!((rtp.sn, rtp.ts, rtp.pt), (41, 8160, 96));
    Ok(())
}

#[test]
fn udp_checksum_carried_in_tail() -> Result<()> {
    let mut d = Decompressor::new(Config::default())?;
    // IR with a nonzero UDP checksum: the flow carries one per packet.
    let mut ir = vec![0xfd, 0x02, 0x00];
    ir.extend([0x40, 17]);
    ir.extend(SRC);
    ir.extend(DST);
    ir.extend(5004u16.to_be_bytes());
    ir.extend(5005u16.to_be_bytes());
    ir.push(0);
    ir.push(64);
    ir.extend(30u16.to_be_bytes());
    ir.push(0x20);
    ir.extend(0xbeefu16.to_be_bytes());
    ir.extend(3u16.to_be_bytes());
    d.decompress(&seal_ir(ir), 1000)?;

    let mk_refs = |sn: u16, id: u16, checksum: u16| {
        let (outer, mut next) = udp_v4_refs(sn, id, 64);
        if let NextRef::Udp {
            udp, check_present, ..
        } = &mut next
        {
            udp.checksum = checksum;
            *check_present = true;
        }
        (outer, next)
    };
    let (outer, next) = mk_refs(4, 31, 0xcafe);
    let want = rebuild::serialize(&outer, None, &next, 0);
    let crc = rebuild::header_crc(CrcKind::Crc3, &outer, None, &next, &want);
    let p = [uo0(4, crc), 0xca, 0xfe];
    let out = d.decompress(&p, 1020)?;
    assert_eq!(out, want);
    assert_eq!(&out[26..28], &[0xca, 0xfe]);
    Ok(())
}

#[test]
fn replay_determinism() -> Result<()> {
    let mut a = Decompressor::new(Config::default())?;
    let mut b = Decompressor::new(Config::default())?;
    let ir = ir_udp_v4(5, 50, 64);
    let (_, crc) = expect_udp_v4(6, 51, 64, b"xyz");
    let mut uo = vec![uo0(6, crc)];
    uo.extend(b"xyz");

    for d in [&mut a, &mut b] {
        d.decompress(&ir, 500)?;
    }
    assert_eq!(a.decompress(&uo, 520)?, b.decompress(&uo, 520)?);
    Ok(())
}
