//! Per-device configuration.
//!
//! All values have defaults. Override via environment variables (prefixed
//! `IBDEV_`) or by constructing a custom `DeviceConfig`.

use std::path::PathBuf;

use crate::catalog::{Catalog, DeviceSpec};
use crate::sysfs::{SysfsReader, try_parse_c_integer};

/// Device open and port-filtering options.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// GID table index used by the port check. `None` selects index 0.
    pub gid_index: Option<u32>,

    /// Required GID subnet prefix for InfiniBand ports.
    pub subnet_filter: Option<u64>,

    /// Watch the device's async event descriptor.
    pub async_events: bool,

    /// Mount point of sysfs.
    pub sysfs_root: PathBuf,

    /// Catalog entries consulted before the built-in table.
    pub custom_devices: Vec<DeviceSpec>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            gid_index: None,
            subnet_filter: None,
            async_events: true,
            sysfs_root: PathBuf::from("/sys"),
            custom_devices: Vec::new(),
        }
    }
}

impl DeviceConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `IBDEV_GID_INDEX` (`auto` or a number)
    /// - `IBDEV_SUBNET_PREFIX` (`0x`-prefixed hex or decimal)
    /// - `IBDEV_ASYNC_EVENTS` (`y`/`n`, `1`/`0`, `true`/`false`)
    /// - `IBDEV_SYSFS_ROOT`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`DeviceConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = lookup("IBDEV_GID_INDEX") {
            let v = v.trim();
            if v.eq_ignore_ascii_case("auto") {
                cfg.gid_index = None;
            } else if let Ok(n) = v.parse::<u32>() {
                cfg.gid_index = Some(n);
            } else {
                tracing::warn!(value = v, "ignoring invalid IBDEV_GID_INDEX");
            }
        }
        if let Some(v) = lookup("IBDEV_SUBNET_PREFIX") {
            match parse_subnet_prefix(&v) {
                Some(prefix) => cfg.subnet_filter = Some(prefix),
                None => tracing::warn!(value = %v, "ignoring invalid IBDEV_SUBNET_PREFIX"),
            }
        }
        if let Some(v) = lookup("IBDEV_ASYNC_EVENTS")
            && let Some(b) = parse_bool(&v)
        {
            cfg.async_events = b;
        }
        if let Some(v) = lookup("IBDEV_SYSFS_ROOT")
            && !v.is_empty()
        {
            cfg.sysfs_root = PathBuf::from(v);
        }

        cfg
    }

    /// Configured GID index, or 0 when set to auto.
    pub fn effective_gid_index(&self) -> u32 {
        self.gid_index.unwrap_or(crate::gid::DEFAULT_GID_INDEX)
    }

    pub fn catalog(&self) -> Catalog {
        Catalog::new(self.custom_devices.clone())
    }

    pub fn sysfs(&self) -> SysfsReader {
        SysfsReader::new(self.sysfs_root.clone())
    }
}

fn parse_subnet_prefix(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok();
    }
    if s.chars().all(|c| c.is_ascii_digit()) && !s.is_empty() {
        return s.parse().ok();
    }
    None
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "1" | "true" | "on" => Some(true),
        "n" | "no" | "0" | "false" | "off" => Some(false),
        // Other numbers follow C truthiness.
        _ => try_parse_c_integer(s).map(|n| n != 0),
    }
}
