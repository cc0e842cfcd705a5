#![warn(missing_docs)]
/*! ROHC (RFC 3095) header decompression, generic IP profile family.

This crate reconstructs original IP/UDP/RTP headers from ROHC
compressed packets: per-flow contexts keyed by CID, LSB decoding of
wraparound counters against sliding references, IPv6 extension-header
list decompression, CRC validation of every reconstruction, and the
bounded correction procedure that rides out reference staleness.

# Architecture overview

One [`decomp::Decompressor`] owns all flow contexts of a channel. Each
packet runs through a fixed pipeline:

```text
[ CID framing (cid) ]
         ↓
[ type discrimination (packet) ]
         ↓
[ chain / bundle extraction (chains, packet, bits, list) ]
         ↓
[ reference resolution (decode, lsb, ipid) ]
         ↓
[ header rebuild + CRC check (rebuild, crc) ]
         ↓
[ commit, or correction loop (repair) ]
```

Compressed headers carry only a few bits of each changing field, so a
reconstruction is never self-evidently right: a CRC over the rebuilt
headers is the only proof. Failed proofs go to the repair loop, which
retries under an SN-wraparound and then a clock-based hypothesis before
giving up and demoting the context.

The engine is a plain value: no threads, no globals, no clock access.
Callers feed it packet bytes plus a monotonic timestamp and get back
the uncompressed packet or an [`Error`].

# Examples

```
use rohcdec::decomp::{Config, Decompressor};

let d = Decompressor::new(Config::default())?;
// Feed packets as they arrive (bytes, monotonic milliseconds):
// let ip_packet = d.decompress(&rohc_packet, now_ms)?;
assert_eq!(d.report().contexts.len(), 0);
# Ok::<(), rohcdec::Error>(())
```
 */

pub mod bits;
pub mod chains;
pub mod cid;
pub mod context;
pub mod crc;
pub mod decode;
pub mod decomp;
pub mod feedback;
pub mod headers;
pub mod ipid;
pub mod list;
pub mod lsb;
pub mod packet;
pub mod profile;
pub mod rebuild;
pub mod repair;

/// Decompression error. None of these are fatal to the engine; at worst
/// a single context is lost until the next IR.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Truncated or self-contradictory packet bytes.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// A compressed packet arrived for a CID with no usable context.
    #[error("no context for CID {cid}")]
    NoContext {
        /// The CID the packet named.
        cid: u16,
    },

    /// CRC validation failed and both repair strategies are exhausted.
    #[error("unrepairable CRC failure on CID {cid}")]
    CrcFailureUnrepairable {
        /// The context that failed.
        cid: u16,
    },

    /// A compressed list referenced a generation outside the window.
    #[error("list reference gen_id {gen_id} not in window")]
    ListReferenceMissing {
        /// The missing generation.
        gen_id: u8,
    },

    /// IR named a profile that is not enabled or not implemented.
    #[error("unsupported profile {profile:#06x}")]
    UnsupportedProfile {
        /// The wire profile number.
        profile: u16,
    },
}

/// Crate-wide result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;
