//! System device registry keyed by PCI bus address.

use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use indexmap::IndexMap;

use crate::error::IbError;

/// Stable index of a system device within a [`Topology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SysDeviceId(pub u32);

impl SysDeviceId {
    pub const UNKNOWN: SysDeviceId = SysDeviceId(u32::MAX);

    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }
}

impl fmt::Display for SysDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            f.write_str("unknown")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// PCI bus/device/function address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciBdf {
    pub domain: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl FromStr for PciBdf {
    type Err = IbError;

    /// Accepts `dddd:bb:dd.f` or `bb:dd.f` (domain 0).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || IbError::invalid_param(format!("invalid PCI address '{s}'"));
        let (head, function) = s.rsplit_once('.').ok_or_else(bad)?;
        let parts: Vec<&str> = head.split(':').collect();
        let (domain, bus, device) = match parts.as_slice() {
            [domain, bus, device] => (*domain, *bus, *device),
            [bus, device] => ("0", *bus, *device),
            _ => return Err(bad()),
        };
        let bdf = PciBdf {
            domain: u16::from_str_radix(domain, 16).map_err(|_| bad())?,
            bus: u8::from_str_radix(bus, 16).map_err(|_| bad())?,
            device: u8::from_str_radix(device, 16).map_err(|_| bad())?,
            function: u8::from_str_radix(function, 16).map_err(|_| bad())?,
        };
        if bdf.device > 0x1f || bdf.function > 7 {
            return Err(bad());
        }
        Ok(bdf)
    }
}

impl fmt::Display for PciBdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

#[derive(Debug, Clone)]
struct SysDevice {
    name: Option<String>,
}

/// Process-wide table of discovered system devices. Ids are assigned in
/// discovery order and never reused.
#[derive(Debug, Default)]
pub struct Topology {
    devices: Mutex<IndexMap<PciBdf, SysDevice>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for the device at `bdf_name`, registering it on first sight.
    pub fn find_device_by_bdf_name(&self, bdf_name: &str) -> Option<SysDeviceId> {
        let bdf: PciBdf = bdf_name.parse().ok()?;
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = devices.entry(bdf);
        let index = entry.index();
        entry.or_insert(SysDevice { name: None });
        u32::try_from(index).ok().map(SysDeviceId)
    }

    /// Attach a display name to a registered device.
    pub fn set_name(&self, id: SysDeviceId, name: &str) -> bool {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        match devices.get_index_mut(id.0 as usize) {
            Some((_, dev)) => {
                dev.name = Some(name.to_owned());
                true
            }
            None => false,
        }
    }

    pub fn name(&self, id: SysDeviceId) -> Option<String> {
        let devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        devices.get_index(id.0 as usize)?.1.name.clone()
    }

    pub fn bdf(&self, id: SysDeviceId) -> Option<PciBdf> {
        let devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        devices.get_index(id.0 as usize).map(|(bdf, _)| *bdf)
    }

    pub fn len(&self) -> usize {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
