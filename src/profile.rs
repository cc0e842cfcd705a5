/*! ROHC profile identifiers and capabilities.

The profile byte in an IR packet selects how the static and dynamic
chains continue past the IP headers, what a UO packet's tail carries,
and which next header the builder emits. Dispatch is a match on
[`Profile`], once per packet.
 */
use serde::Serialize;

/// Profile numbers from the RFC 3095 family of specifications.
pub struct ProfileIds {}
impl ProfileIds {
    /// No compression; packets pass through.
    pub const UNCOMPRESSED: u16 = 0x0000;

    /// IP/UDP/RTP.
    pub const RTP: u16 = 0x0001;

    /// IP/UDP.
    pub const UDP: u16 = 0x0002;

    /// IP/ESP. Recognized but not implemented here.
    pub const ESP: u16 = 0x0003;

    /// IP only.
    pub const IP: u16 = 0x0004;

    /// IP/UDP-Lite.
    pub const UDPLITE: u16 = 0x0008;
}

/// Profiles this engine can decompress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Profile {
    /// Pass-through.
    Uncompressed,
    /// IP/UDP/RTP.
    Rtp,
    /// IP/UDP.
    Udp,
    /// IP/UDP-Lite.
    UdpLite,
    /// IP only.
    Ip,
}

impl Profile {
    /// Map a wire profile number to an implemented profile.
    #[must_use]
    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            ProfileIds::UNCOMPRESSED => Some(Profile::Uncompressed),
            ProfileIds::RTP => Some(Profile::Rtp),
            ProfileIds::UDP => Some(Profile::Udp),
            ProfileIds::UDPLITE => Some(Profile::UdpLite),
            ProfileIds::IP => Some(Profile::Ip),
            _ => None,
        }
    }

    /// The wire profile number.
    #[must_use]
    pub fn id(&self) -> u16 {
        match self {
            Profile::Uncompressed => ProfileIds::UNCOMPRESSED,
            Profile::Rtp => ProfileIds::RTP,
            Profile::Udp => ProfileIds::UDP,
            Profile::UdpLite => ProfileIds::UDPLITE,
            Profile::Ip => ProfileIds::IP,
        }
    }

    /// RTP semantics: TS handling, M bit, RTP packet-type variants.
    #[must_use]
    pub fn is_rtp(&self) -> bool {
        matches!(self, Profile::Rtp)
    }

    /// A UDP header sits between IP chain and payload.
    #[must_use]
    pub fn has_udp(&self) -> bool {
        matches!(self, Profile::Rtp | Profile::Udp)
    }

    /// The dynamic chain ends with an explicit 16-bit SN (profiles
    /// whose transport carries none of its own).
    #[must_use]
    pub fn explicit_sn(&self) -> bool {
        matches!(self, Profile::Udp | Profile::UdpLite | Profile::Ip)
    }
}
