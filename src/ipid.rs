/*! IPv4 Identification reconstruction.

An IPv4 flow carries its IP-ID in one of two regimes, signalled by the
`RND` flag in the dynamic chain:

* random (`rnd = 1`): the 16-bit value rides in full in the packet tail;
* sequential (`rnd = 0`): the compressor sends LSBs of the *offset*
  `IP-ID − SN`, which moves far slower than either counter.

Sequential IDs may additionally be kept in host byte order by the origin
(`nbo = 0`), in which case the reconstructed value is byte swapped before
it is written into the header.
 */
use crate::lsb;

/// Reconstruct a sequential IP-ID from offset bits.
///
/// `k == 0` means the packet carried no offset bits and the offset is
/// unchanged from the reference pair.
#[must_use]
pub fn decode_sequential(ip_id_ref: u16, sn_ref: u16, sn: u16, m: u16, k: usize) -> u16 {
    let offset_ref = ip_id_ref.wrapping_sub(sn_ref);
    let offset = if k == 0 {
        offset_ref
    } else {
        lsb::decode16(offset_ref, k, m, lsb::ip_id_shift())
    };
    sn.wrapping_add(offset)
}

/// Byte order fixup: swap a sequential IP-ID that the origin keeps in
/// host order.
#[must_use]
pub fn to_wire(id: u16, nbo: bool) -> u16 {
    if nbo { id } else { id.swap_bytes() }
}
