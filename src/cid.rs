/*! Context identifier framing.

Two channel-wide regimes:

* **Small CIDs** (0..15): CID 0 is implicit; 1..15 ride in an add-CID
  octet `1110 cccc` *before* the type octet. A bare `0xE0` (add-CID
  with value 0) is the padding octet and is skipped.
* **Large CIDs** (0..2^14−1): the CID is SDVL-encoded *after* the type
  octet.

`strip` normalizes both into (CID, packet-with-type-octet-first).
 */
use serde::{Deserialize, Serialize};

use crate::bits::{self, BitReader};
use crate::{Error, Result};

/// Channel-wide CID encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CidType {
    /// Implicit or add-CID octet, 0..15.
    Small,
    /// SDVL after the type octet, 0..2^14−1.
    Large,
}

/// Highest CID a large-CID channel can carry.
pub const MAX_LARGE_CID: u16 = (1 << 14) - 1;

/// Build the add-CID octet for a small CID.
#[must_use]
pub fn add_cid(cid: u16) -> u8 {
    debug_assert!(cid <= 15);
    0xe0 | (cid as u8 & 0x0f)
}

/// Remove the CID framing. Returns the CID and the packet rearranged to
/// start at the type octet.
pub fn strip(cid_type: CidType, packet: &[u8]) -> Result<(u16, Vec<u8>)> {
    match cid_type {
        CidType::Small => {
            let mut buf = packet;
            // 0xE0 is padding, not CID 0.
            while buf.first() == Some(&0xe0) {
                buf = &buf[1..];
            }
            match buf.first() {
                None => Err(Error::Malformed("empty packet".into())),
                Some(&b) if (0xe1..=0xef).contains(&b) => {
                    Ok((u16::from(b & 0x0f), buf[1..].to_vec()))
                }
                Some(_) => Ok((0, buf.to_vec())),
            }
        }
        CidType::Large => {
            if packet.is_empty() {
                return Err(Error::Malformed("empty packet".into()));
            }
            let mut r = BitReader::new(&packet[1..]);
            let (cid, len) = bits::sdvl_decode(&mut r)?;
            if cid > u32::from(MAX_LARGE_CID) {
                return Err(Error::Malformed(format!("large CID {cid} out of range")));
            }
            let mut buf = Vec::with_capacity(packet.len() - len);
            buf.push(packet[0]);
            buf.extend(&packet[1 + len..]);
            Ok((cid as u16, buf))
        }
    }
}
