//! Completion queue entry sizing.
//!
//! Entries are at least one cache line. 128-byte entries are used where the
//! platform allows them; one Huawei Kunpeng board revision only works with
//! 64-byte entries.

use std::fs;
use std::sync::OnceLock;

use crate::sysfs::{SysfsReader, parse_c_integer};

pub const CQE_SIZE_MIN: usize = 64;
pub const CQE_SIZE_MAX: usize = 128;

const CACHE_LINE_SIZE: usize = 64;

/// Identity fields of an aarch64 core, as listed in `/proc/cpuinfo`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArmCpuId {
    pub implementer: i64,
    pub architecture: i64,
    pub variant: i64,
    pub part: i64,
    pub revision: i64,
}

impl ArmCpuId {
    /// Read the first core's fields. `None` if any of them is missing.
    pub fn parse(cpuinfo: &str) -> Option<Self> {
        let field = |name: &str| {
            cpuinfo.lines().find_map(|line| {
                let (key, value) = line.split_once(':')?;
                (key.trim() == name).then(|| parse_c_integer(value.trim()))
            })
        };
        Some(Self {
            implementer: field("CPU implementer")?,
            architecture: field("CPU architecture")?,
            variant: field("CPU variant")?,
            part: field("CPU part")?,
            revision: field("CPU revision")?,
        })
    }

    fn is_kunpeng_r2(&self) -> bool {
        *self
            == Self {
                implementer: 0x41,
                architecture: 8,
                variant: 0,
                part: 0xd08,
                revision: 2,
            }
    }
}

/// Largest CQE size usable on a board from `board_vendor` with `cpu`.
pub fn cqe_size_limit(board_vendor: &str, cpu: Option<&ArmCpuId>) -> usize {
    let huawei = board_vendor.to_ascii_lowercase().contains("huawei");
    if huawei && cpu.is_some_and(ArmCpuId::is_kunpeng_r2) {
        CQE_SIZE_MIN
    } else {
        CQE_SIZE_MAX
    }
}

/// Clamp a requested entry size to `[cache line, limit]`.
pub fn cqe_size_with_limit(requested: usize, limit: usize) -> usize {
    requested.max(CACHE_LINE_SIZE).max(CQE_SIZE_MIN).min(limit)
}

/// Platform CQE size limit, computed once per process.
pub fn cqe_size_max() -> usize {
    static LIMIT: OnceLock<usize> = OnceLock::new();
    *LIMIT.get_or_init(|| {
        let limit = if cfg!(target_arch = "aarch64") {
            let vendor = SysfsReader::default().board_vendor();
            let cpu = fs::read_to_string("/proc/cpuinfo")
                .ok()
                .and_then(|s| ArmCpuId::parse(&s));
            tracing::debug!(board_vendor = %vendor, ?cpu, "arm board identity");
            cqe_size_limit(&vendor, cpu.as_ref())
        } else {
            CQE_SIZE_MAX
        };
        tracing::debug!(limit, "max IB CQE size");
        limit
    })
}

/// CQE size to request for a queue that needs at least `requested` bytes.
pub fn cqe_size(requested: usize) -> usize {
    cqe_size_with_limit(requested, cqe_size_max())
}
