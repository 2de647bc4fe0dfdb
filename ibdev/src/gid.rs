//! GID values, RoCE version detection, and GID table negotiation.

use std::fmt;
use std::net::Ipv6Addr;

use crate::error::Result;

/// GID table index used when nothing better is found or configured.
pub const DEFAULT_GID_INDEX: u32 = 0;

/// Search order for [`select_gid`], most preferred first.
pub const GID_PRIORITY: [(RoceVersion, AddrFamily); 4] = [
    (RoceVersion::V2, AddrFamily::Ipv4),
    (RoceVersion::V2, AddrFamily::Ipv6),
    (RoceVersion::V1, AddrFamily::Ipv4),
    (RoceVersion::V1, AddrFamily::Ipv6),
];

/// 128-bit global identifier, stored in network byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    pub const ZERO: Gid = Gid([0; 16]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 16]
    }

    /// Upper 64 bits, as a number.
    pub fn subnet_prefix(&self) -> u64 {
        let mut hi = [0u8; 8];
        hi.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(hi)
    }

    /// Lower 64 bits, as a number.
    pub fn interface_id(&self) -> u64 {
        let mut lo = [0u8; 8];
        lo.copy_from_slice(&self.0[8..]);
        u64::from_be_bytes(lo)
    }

    fn word(&self, i: usize) -> u32 {
        u32::from_be_bytes([
            self.0[4 * i],
            self.0[4 * i + 1],
            self.0[4 * i + 2],
            self.0[4 * i + 3],
        ])
    }

    /// IPv4 if the GID is an IPv4-mapped address (`::ffff:a.b.c.d`) or an
    /// IPv4-encoded multicast address (`ff0e::ffff:a.b.c.d`); IPv6 otherwise.
    pub fn addr_family(&self) -> AddrFamily {
        let last_bits = self.word(2) ^ 0x0000_ffff;
        let mapped = (self.word(0) | self.word(1) | last_bits) == 0;
        let mcast = self.word(0) == 0xff0e_0000 && (self.word(1) | last_bits) == 0;
        if mapped || mcast {
            AddrFamily::Ipv4
        } else {
            AddrFamily::Ipv6
        }
    }
}

impl From<Ipv6Addr> for Gid {
    fn from(addr: Ipv6Addr) -> Self {
        Gid(addr.octets())
    }
}

impl From<Gid> for Ipv6Addr {
    fn from(gid: Gid) -> Self {
        Ipv6Addr::from(gid.0)
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Ipv6Addr::from(self.0).fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoceVersion {
    V1,
    V1_5,
    V2,
}

impl RoceVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1 => "RoCE v1",
            Self::V1_5 => "RoCE v1.5",
            Self::V2 => "RoCE v2",
        }
    }
}

impl fmt::Display for RoceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrFamily {
    Ipv4,
    Ipv6,
}

impl fmt::Display for AddrFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ipv4 => "IPv4",
            Self::Ipv6 => "IPv6",
        })
    }
}

/// Parse the contents of a `gid_attrs/types/<index>` file.
pub fn parse_gid_type(s: &str) -> Option<RoceVersion> {
    if s.starts_with("IB/RoCE v1") {
        Some(RoceVersion::V1)
    } else if s.starts_with("RoCE v2") {
        Some(RoceVersion::V2)
    } else {
        None
    }
}

/// One GID table entry with its decoded attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GidInfo {
    pub gid: Gid,
    pub roce_version: RoceVersion,
    pub addr_family: AddrFamily,
    pub index: u32,
}

impl GidInfo {
    pub fn new(gid: Gid, roce_version: RoceVersion, index: u32) -> Self {
        Self {
            gid,
            roce_version,
            addr_family: gid.addr_family(),
            index,
        }
    }

    /// The unvalidated choice returned when no entry passes negotiation.
    pub fn fallback() -> Self {
        Self {
            gid: Gid::ZERO,
            roce_version: RoceVersion::V1,
            addr_family: AddrFamily::Ipv4,
            index: DEFAULT_GID_INDEX,
        }
    }

    fn matches(&self, (version, family): (RoceVersion, AddrFamily)) -> bool {
        self.roce_version == version && self.addr_family == family
    }
}

/// Walk a GID table of `tbl_len` entries in [`GID_PRIORITY`] order.
///
/// `query` reads one entry; its first error aborts the search. `probe` is the
/// liveness check and only runs on entries that match the current tier. When
/// every tier is exhausted the result is [`GidInfo::fallback`].
pub fn select_gid<Q, P>(tbl_len: u32, mut query: Q, mut probe: P) -> Result<GidInfo>
where
    Q: FnMut(u32) -> Result<GidInfo>,
    P: FnMut(&GidInfo) -> bool,
{
    for tier in GID_PRIORITY {
        for index in 0..tbl_len {
            let info = query(index)?;
            if info.matches(tier) && probe(&info) {
                return Ok(info);
            }
        }
    }
    Ok(GidInfo::fallback())
}
