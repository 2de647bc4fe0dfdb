//! Sysfs-like file readers for device locality, identity and RoCE attributes.
//!
//! Everything here is optional telemetry: read failures degrade to a
//! conservative default and are logged, never returned as hard errors,
//! except where a caller explicitly asks for a value (GID type, netdev name).

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::catalog::PciId;

/// Number of CPUs representable in a [`CpuMask`].
pub const CPU_SETSIZE: usize = 1024;

const CPU_WORDS: usize = CPU_SETSIZE / 64;

/// Fixed-size CPU affinity bitmap.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CpuMask([u64; CPU_WORDS]);

impl Default for CpuMask {
    fn default() -> Self {
        Self::empty()
    }
}

impl CpuMask {
    pub const fn empty() -> Self {
        Self([0; CPU_WORDS])
    }

    pub const fn all() -> Self {
        Self([u64::MAX; CPU_WORDS])
    }

    pub fn set(&mut self, cpu: usize) {
        if cpu < CPU_SETSIZE {
            self.0[cpu / 64] |= 1 << (cpu % 64);
        }
    }

    pub fn contains(&self, cpu: usize) -> bool {
        cpu < CPU_SETSIZE && self.0[cpu / 64] & (1 << (cpu % 64)) != 0
    }

    pub fn count(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..CPU_SETSIZE).filter(|&cpu| self.contains(cpu))
    }

    /// Parse a kernel cpumask string: comma-separated 32-bit hex words,
    /// most significant word first (`"00000000,0000ff00"`).
    pub fn parse(s: &str) -> Self {
        let mut mask = Self::empty();
        let s = s.trim();
        let mut base = 0;
        for word in s.rsplit(',') {
            if base >= CPU_SETSIZE {
                break;
            }
            let mut bits = parse_hex_prefix(word.trim());
            let mut k = 0;
            while bits != 0 {
                if bits & 1 != 0 {
                    mask.set(base + k);
                }
                bits >>= 1;
                k += 1;
            }
            base += 32;
        }
        mask
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::all() {
            return f.write_str("CpuMask(all)");
        }
        f.debug_set().entries(self.iter()).finish()
    }
}

/// `strtoul(s, NULL, 16)` truncated to 32 bits: the longest hex prefix,
/// 0 if there is none.
fn parse_hex_prefix(s: &str) -> u32 {
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    let end = s.find(|c: char| !c.is_ascii_hexdigit()).unwrap_or(s.len());
    u64::from_str_radix(&s[..end], 16).map_or(0, |v| v as u32)
}

/// `strtol(s, NULL, 0)`: optional sign, then `0x` hex, leading-`0` octal, or
/// decimal. Returns 0 when no digits are present.
pub fn parse_c_integer(s: &str) -> i64 {
    try_parse_c_integer(s).unwrap_or(0)
}

/// Like [`parse_c_integer`], but `None` when `strtol` would consume nothing
/// or the value does not fit.
pub fn try_parse_c_integer(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (negative, s) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let (radix, digits) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (16, hex)
    } else if s.starts_with('0') {
        (8, &s[1..])
    } else {
        (10, s)
    };
    let end = digits
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(digits.len());
    let value = match &digits[..end] {
        // A bare "0" or "0x" prefix still parses as zero.
        "" if radix != 10 => 0,
        "" => return None,
        digits => i64::from_str_radix(digits, radix).ok()?,
    };
    Some(if negative { -value } else { value })
}

/// Resolve the PCI function directory of a verbs device from its
/// `ibdev_path`.
///
/// Physical functions resolve to `.../<bdf>/infiniband/<dev>`, scalable
/// functions to `.../<bdf>/<uuid>/infiniband/<dev>`. The first ancestor that
/// has a `device` entry wins.
pub fn resolve_pci_path(ibdev_path: &Path) -> Option<PathBuf> {
    let real = fs::canonicalize(ibdev_path).ok()?;
    for (strip, kind) in [(2, "PF"), (3, "SF")] {
        let Some(candidate) = real.ancestors().nth(strip) else {
            break;
        };
        if candidate.join("device").exists() {
            tracing::debug!(path = %candidate.display(), kind, "sysfs path detected");
            return Some(candidate.to_path_buf());
        }
    }
    tracing::debug!(ibdev_path = %ibdev_path.display(), "sysfs path undetected");
    None
}

/// Last path component of a PCI function directory, e.g. `0000:03:00.0`.
pub fn bdf_name(pci_path: &Path) -> Option<&str> {
    pci_path.file_name()?.to_str()
}

/// Read `vendor` and `device` under a PCI function directory. Unreadable
/// files read as 0.
pub fn read_pci_id(pci_path: Option<&Path>) -> PciId {
    let read = |file: &str| -> u16 {
        let Some(dir) = pci_path else {
            return 0;
        };
        match fs::read_to_string(dir.join(file)) {
            Ok(s) => parse_c_integer(&s) as u16,
            Err(e) => {
                tracing::warn!(path = %dir.join(file).display(), error = %e, "could not read PCI id");
                0
            }
        }
    };
    PciId::new(read("vendor"), read("device"))
}

/// Reader rooted at a sysfs mount point.
#[derive(Debug, Clone)]
pub struct SysfsReader {
    root: PathBuf,
}

impl Default for SysfsReader {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl SysfsReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/class/infiniband/<dev>`
    pub fn ib_device_dir(&self, dev: &str) -> PathBuf {
        self.root.join("class/infiniband").join(dev)
    }

    fn gid_attr_path(&self, dev: &str, port: u8, kind: &str, index: u32) -> PathBuf {
        self.ib_device_dir(dev)
            .join(format!("ports/{port}/gid_attrs/{kind}/{index}"))
    }

    /// CPUs local to `dev`. A missing affinity file means every CPU is local.
    pub fn local_cpus(&self, dev: &str) -> CpuMask {
        let path = self.ib_device_dir(dev).join("device/local_cpus");
        match fs::read_to_string(&path) {
            Ok(s) => CpuMask::parse(&s),
            Err(e) => {
                tracing::debug!(device = dev, error = %e, "no local_cpus, treating all CPUs as local");
                CpuMask::all()
            }
        }
    }

    /// NUMA node of `dev`, or `None` when unknown.
    pub fn numa_node(&self, dev: &str) -> Option<u32> {
        let path = self.ib_device_dir(dev).join("device/numa_node");
        let node = fs::read_to_string(&path)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .and_then(|n| u32::try_from(n).ok());
        if node.is_none() {
            tracing::debug!(device = dev, "NUMA node unknown");
        }
        node
    }

    /// Raw contents of the GID type file, `None` if it cannot be read.
    pub fn gid_type(&self, dev: &str, port: u8, index: u32) -> Option<String> {
        fs::read_to_string(self.gid_attr_path(dev, port, "types", index))
            .ok()
            .filter(|s| !s.is_empty())
    }

    /// Name of the network interface backing a RoCE GID entry.
    pub fn gid_ndev(&self, dev: &str, port: u8, index: u32) -> io::Result<String> {
        let s = fs::read_to_string(self.gid_attr_path(dev, port, "ndevs", index))?;
        Ok(s.trim().to_owned())
    }

    /// DMI board vendor, empty when the platform does not expose one.
    pub fn board_vendor(&self) -> String {
        fs::read_to_string(self.root.join("devices/virtual/dmi/id/board_vendor"))
            .map(|s| s.trim().to_owned())
            .unwrap_or_default()
    }

    /// Number of ports aggregated by an 802.3ad bond, 1 if `ndev` is not a
    /// bond or the value cannot be read.
    pub fn bond_ad_num_ports(&self, ndev: &str) -> u32 {
        let path = self
            .root
            .join("class/net")
            .join(ndev)
            .join("bonding/ad_num_ports");
        fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .filter(|&n| n > 0)
            .unwrap_or(1)
    }
}
