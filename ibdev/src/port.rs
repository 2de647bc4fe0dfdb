//! Port attribute snapshots.

use std::fmt;

use crate::error::{IbError, Result};

/// Hard cap on ports tracked per device.
pub const MAX_PORTS: u8 = 2;

/// First port number of a channel adapter. Switches expose only port 0.
pub const FIRST_CA_PORT: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Nop,
    Down,
    Init,
    Armed,
    Active,
    ActiveDefer,
    Other(u32),
}

impl PortState {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Nop,
            1 => Self::Down,
            2 => Self::Init,
            3 => Self::Armed,
            4 => Self::Active,
            5 => Self::ActiveDefer,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    Unspecified,
    InfiniBand,
    /// RoCE.
    Ethernet,
}

impl LinkLayer {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::InfiniBand,
            2 => Self::Ethernet,
            _ => Self::Unspecified,
        }
    }
}

impl fmt::Display for LinkLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unspecified => "unspecified",
            Self::InfiniBand => "InfiniBand",
            Self::Ethernet => "Ethernet",
        })
    }
}

/// Path MTU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mtu {
    Mtu256,
    Mtu512,
    Mtu1024,
    Mtu2048,
    Mtu4096,
}

impl Mtu {
    /// Decode a raw `ibv_mtu` value (1..=5).
    pub fn from_raw(raw: u32) -> Result<Self> {
        Ok(match raw {
            1 => Self::Mtu256,
            2 => Self::Mtu512,
            3 => Self::Mtu1024,
            4 => Self::Mtu2048,
            5 => Self::Mtu4096,
            other => return Err(IbError::invalid_param(format!("invalid MTU value ({other})"))),
        })
    }

    pub fn bytes(&self) -> usize {
        match self {
            Self::Mtu256 => 256,
            Self::Mtu512 => 512,
            Self::Mtu1024 => 1024,
            Self::Mtu2048 => 2048,
            Self::Mtu4096 => 4096,
        }
    }
}

/// The subset of `ibv_port_attr` this crate consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAttr {
    pub state: PortState,
    pub link_layer: LinkLayer,
    pub gid_tbl_len: u32,
    pub active_mtu: Mtu,
    pub lid: u16,
}

impl PortAttr {
    pub fn is_active(&self) -> bool {
        self.state == PortState::Active
    }

    pub fn is_ib(&self) -> bool {
        self.link_layer == LinkLayer::InfiniBand
    }

    pub fn is_roce(&self) -> bool {
        self.link_layer == LinkLayer::Ethernet
    }
}
