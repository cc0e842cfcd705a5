/*! W-LSB decoding.

A compressed packet carries only the low `k` bits of a counter. The full
value is the unique member of the interpretation interval

```text
[ref − p, ref − p + 2^k − 1]   (mod 2^w)
```

whose low `k` bits match. The shift `p` positions the interval around the
reference: mostly ahead of it for counters that only grow, partly behind
it for timestamps that may be reordered.

Decoding cannot fail. A wrong guess (reference too stale, counter wrapped
further than the interval reaches) is caught by the header CRC and handed
to the repair loop.
 */

/// Decode `k` received bits `m` against `ref_v` with shift `p`, modulo
/// `2^w` (`w` ≤ 32).
#[must_use]
pub fn decode(ref_v: u32, k: usize, m: u32, p: i64, w: usize) -> u32 {
    debug_assert!(w <= 32 && k <= w);
    let modulus = if w == 32 { 1u64 << 32 } else { 1u64 << w };
    if k >= w {
        return m & ((modulus - 1) as u32);
    }
    let interval = 1u64 << k;
    let lower = (i64::from(ref_v) - p).rem_euclid(modulus as i64) as u64;
    // Exactly one value in [lower, lower + 2^k) is congruent to m.
    let v = lower + (u64::from(m).wrapping_sub(lower) & (interval - 1));
    (v % modulus) as u32
}

/// 16-bit counter variant (SN, IP-ID offset).
#[must_use]
pub fn decode16(ref_v: u16, k: usize, m: u16, p: i64) -> u16 {
    decode(u32::from(ref_v), k, u32::from(m), p, 16) as u16
}

/// 32-bit counter variant (RTP timestamp).
#[must_use]
pub fn decode32(ref_v: u32, k: usize, m: u32, p: i64) -> u32 {
    decode(ref_v, k, m, p, 32)
}

/// Interval shift for the sequence number.
#[must_use]
pub fn sn_shift(k: usize) -> i64 {
    if k <= 4 { 1 } else { (1 << (k - 5)) - 1 }
}

/// Interval shift for the RTP timestamp.
#[must_use]
pub fn ts_shift(k: usize) -> i64 {
    if k < 2 { 1 } else { (1 << (k - 2)) - 1 }
}

/// Interval shift for IP-ID offsets.
#[must_use]
pub fn ip_id_shift() -> i64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_window() {
        // ref 100, 4 bits, p = 1: window is [99, 114].
        assert_eq!(decode16(100, 4, 0b0100, 1), 100);
        assert_eq!(decode16(100, 4, 0b0011, 1), 99);
        assert_eq!(decode16(100, 4, 0b0010, 1), 114);
        assert_eq!(decode16(100, 4, 0b1101, 1), 109);
    }

    #[test]
    fn wraparound_window() {
        // Window straddling the 16-bit wrap.
        assert_eq!(decode16(65530, 4, 0b1010, 1), 65530);
        assert_eq!(decode16(65530, 4, 0b0000, 1), 0);
        assert_eq!(decode16(65530, 4, 0b0100, 1), 4);
        // Negative side: p = 2 reaches behind the reference.
        assert_eq!(decode16(1, 4, 0b1111, 2), 65535);
    }

    #[test]
    fn full_width() {
        assert_eq!(decode16(12345, 16, 54321, 1), 54321);
        assert_eq!(decode32(7, 32, 0xdead_beef, 1), 0xdead_beef);
    }

    #[test]
    fn shifts() {
        assert_eq!(sn_shift(1), 1);
        assert_eq!(sn_shift(4), 1);
        assert_eq!(sn_shift(5), 0);
        assert_eq!(sn_shift(8), 7);
        assert_eq!(ts_shift(5), 7);
        assert_eq!(ts_shift(1), 1);
        assert_eq!(ip_id_shift(), 0);
    }

    #[test]
    fn roundtrip_sweep() {
        // Any value inside the interval must decode back to itself from
        // its own low bits.
        use rand::prelude::*;
        let mut rng = rand::rngs::StdRng::seed_from_u64(17);
        for _ in 0..20_000 {
            let w = if rng.random_bool(0.5) { 16 } else { 32 };
            let modulus = if w == 32 { 1u64 << 32 } else { 1 << w };
            let k = rng.random_range(1..=w);
            let p = i64::from(rng.random_range(-2i32..1000));
            let v = (rng.random::<u64>() % modulus) as u32;
            // Pick a reference such that v lies in [ref − p, ref − p + 2^k − 1].
            let span = 1i64 << k.min(62);
            let off = rng.random_range(0..span);
            let r =
                ((i64::from(v) - off + p).rem_euclid(modulus as i64)) as u32;
            let m = v & ((span - 1) as u32);
            assert_eq!(
                decode(r, k, m, p, w),
                v,
                "v={v} k={k} p={p} ref={r} w={w}"
            );
        }
    }
}
