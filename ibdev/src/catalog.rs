//! Known-device catalog: PCI ID → capability flags.
//!
//! Lookup order is the per-instance override list first, then the built-in
//! table in declaration order. The first structural match wins; `rank` is
//! informational only. When nothing matches, the trailing generic entry is
//! returned.

use std::borrow::Cow;
use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// Device capability and port requirement flags.
    ///
    /// The same flag space is used for catalog entries and for the
    /// requirements passed to the port checker.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceFlags: u32 {
        /// Device speaks the mlx4 programming model.
        const MLX4_PRM = 1 << 0;
        /// Device speaks the mlx5 programming model.
        const MLX5_PRM = 1 << 1;
        /// Vendor is Mellanox/NVIDIA.
        const MELLANOX = 1 << 2;
        /// Caller requires a native InfiniBand link layer.
        const LINK_IB  = 1 << 3;
        /// Dynamically-connected transport, first revision.
        const DC_V1    = 1 << 4;
        /// Dynamically-connected transport, second revision.
        const DC_V2    = 1 << 5;
        /// Any revision of dynamically-connected transport.
        const DC       = Self::DC_V1.bits() | Self::DC_V2.bits();
    }
}

impl DeviceFlags {
    /// Flags that select a vendor programming model.
    pub const PRM: Self = Self::MLX4_PRM.union(Self::MLX5_PRM);
}

/// PCI vendor/device identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PciId {
    pub vendor: u16,
    pub device: u16,
}

impl PciId {
    pub const fn new(vendor: u16, device: u16) -> Self {
        Self { vendor, device }
    }
}

impl fmt::Display for PciId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.device)
    }
}

/// A known device model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub name: Cow<'static, str>,
    pub pci_id: PciId,
    pub flags: DeviceFlags,
    /// Relative preference between models. Not used for matching.
    pub rank: u8,
}

impl DeviceSpec {
    pub const fn builtin(name: &'static str, pci_id: PciId, flags: DeviceFlags, rank: u8) -> Self {
        Self {
            name: Cow::Borrowed(name),
            pci_id,
            flags,
            rank,
        }
    }

    /// Override entry supplied at runtime.
    pub fn custom(name: impl Into<String>, pci_id: PciId, flags: DeviceFlags, rank: u8) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            pci_id,
            flags,
            rank,
        }
    }

    pub fn matches(&self, pci_id: PciId) -> bool {
        self.pci_id == pci_id
    }

    pub fn is_generic(&self) -> bool {
        self.pci_id == GENERIC_DEVICE_SPEC.pci_id && self.flags.is_empty()
    }
}

const MELLANOX: u16 = 0x15b3;

const MLX4: DeviceFlags = DeviceFlags::MELLANOX.union(DeviceFlags::MLX4_PRM);
const MLX5_DC1: DeviceFlags = DeviceFlags::MELLANOX
    .union(DeviceFlags::MLX5_PRM)
    .union(DeviceFlags::DC_V1);
const MLX5_DC2: DeviceFlags = DeviceFlags::MELLANOX
    .union(DeviceFlags::MLX5_PRM)
    .union(DeviceFlags::DC_V2);

/// Returned when no table entry matches.
pub static GENERIC_DEVICE_SPEC: DeviceSpec =
    DeviceSpec::builtin("Generic HCA", PciId::new(0, 0), DeviceFlags::empty(), 0);

/// Built-in device table. The last entry is the generic fallback.
pub static BUILTIN_DEVICE_SPECS: &[DeviceSpec] = &[
    DeviceSpec::builtin("ConnectX-3", PciId::new(MELLANOX, 4099), MLX4, 10),
    DeviceSpec::builtin("ConnectX-3 Pro", PciId::new(MELLANOX, 4103), MLX4, 11),
    DeviceSpec::builtin("Connect-IB", PciId::new(MELLANOX, 4113), MLX5_DC1, 20),
    DeviceSpec::builtin("ConnectX-4", PciId::new(MELLANOX, 4115), MLX5_DC1, 30),
    DeviceSpec::builtin("ConnectX-4", PciId::new(MELLANOX, 4116), MLX5_DC1, 29),
    DeviceSpec::builtin("ConnectX-4 LX", PciId::new(MELLANOX, 4117), MLX5_DC1, 28),
    DeviceSpec::builtin("ConnectX-4 LX VF", PciId::new(MELLANOX, 4118), MLX5_DC1, 28),
    DeviceSpec::builtin("ConnectX-5", PciId::new(MELLANOX, 4119), MLX5_DC2, 38),
    DeviceSpec::builtin("ConnectX-5", PciId::new(MELLANOX, 4121), MLX5_DC2, 40),
    DeviceSpec::builtin("ConnectX-5", PciId::new(MELLANOX, 4120), MLX5_DC2, 39),
    DeviceSpec::builtin("ConnectX-5", PciId::new(MELLANOX, 41682), MLX5_DC2, 37),
    DeviceSpec::builtin("ConnectX-5", PciId::new(MELLANOX, 4122), MLX5_DC2, 36),
    DeviceSpec::builtin("ConnectX-6", PciId::new(MELLANOX, 4123), MLX5_DC2, 50),
    DeviceSpec::builtin("ConnectX-6 VF", PciId::new(MELLANOX, 4124), MLX5_DC2, 50),
    DeviceSpec::builtin("ConnectX-6 DX", PciId::new(MELLANOX, 4125), MLX5_DC2, 60),
    DeviceSpec::builtin("ConnectX-6 DX VF", PciId::new(MELLANOX, 4126), MLX5_DC2, 60),
    DeviceSpec::builtin("ConnectX-6 LX", PciId::new(MELLANOX, 4127), MLX5_DC2, 45),
    DeviceSpec::builtin("ConnectX-7", PciId::new(MELLANOX, 4129), MLX5_DC2, 70),
    DeviceSpec::builtin("BlueField", PciId::new(MELLANOX, 0xa2d2), MLX5_DC2, 41),
    DeviceSpec::builtin("BlueField VF", PciId::new(MELLANOX, 0xa2d3), MLX5_DC2, 41),
    DeviceSpec::builtin("BlueField 2", PciId::new(MELLANOX, 0xa2d6), MLX5_DC2, 61),
    DeviceSpec::builtin("Generic HCA", PciId::new(0, 0), DeviceFlags::empty(), 0),
];

/// Device catalog with optional per-instance overrides.
#[derive(Debug, Clone)]
pub struct Catalog {
    custom: Vec<DeviceSpec>,
    builtin: &'static [DeviceSpec],
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Catalog {
    /// Catalog over the built-in table plus `custom` overrides.
    pub fn new(custom: Vec<DeviceSpec>) -> Self {
        Self::with_table(custom, BUILTIN_DEVICE_SPECS)
    }

    pub fn with_table(custom: Vec<DeviceSpec>, builtin: &'static [DeviceSpec]) -> Self {
        Self { custom, builtin }
    }

    pub fn custom_specs(&self) -> &[DeviceSpec] {
        &self.custom
    }

    /// Find the device entry for `pci_id`. Never fails.
    pub fn lookup(&self, pci_id: PciId) -> &DeviceSpec {
        self.custom
            .iter()
            .chain(self.builtin.iter())
            .find(|spec| spec.matches(pci_id))
            .unwrap_or(&GENERIC_DEVICE_SPEC)
    }
}
