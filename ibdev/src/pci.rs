//! PCIe link bandwidth estimation.
//!
//! Effective throughput accounts for TLP framing, DLLP ACK/flow-control
//! traffic and the line encoding of each generation:
//!
//! ```text
//! utilization = payload * ctrl_ratio
//!             / ((payload + tlp_overhead) * ctrl_ratio + ctrl_overhead)
//! bw          = nominal_GTs * 1e9 / 8 * width * encoding / decoding * utilization
//! ```
//!
//! TLP overhead (no ECRC): Gen1/2 = Start(1) + Seq(2) + Hdr(16) + LCRC(4) + End(1),
//! Gen3/4 = Start(4) + Seq(2) + Hdr(16) + LCRC(4). DLLP: one 8-byte ACK plus
//! one 8-byte flow-control update per four TLPs.

use std::path::Path;

/// Returned whenever the link cannot be characterized.
///
/// Consumers compare bandwidths and pick the minimum; an unknown link must
/// never look like the bottleneck.
pub const UNBOUNDED_BANDWIDTH: f64 = f64::MAX;

const LINK_WIDTH_FILE: &str = "current_link_width";
const LINK_SPEED_FILE: &str = "current_link_speed";

/// Per-generation PCIe link parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PciGeneration {
    pub name: &'static str,
    /// Nominal per-lane rate in GT/s.
    pub rate_gts: f64,
    pub payload: u16,
    pub tlp_overhead: u16,
    /// TLPs per ACK/FC DLLP pair.
    pub ctrl_ratio: u16,
    pub ctrl_overhead: u16,
    /// Data bits per encoded symbol.
    pub encoding: u16,
    /// Encoded symbol bits.
    pub decoding: u16,
}

impl PciGeneration {
    /// Fraction of link bytes carrying payload.
    pub fn link_utilization(&self) -> f64 {
        let payload = f64::from(self.payload);
        let ratio = f64::from(self.ctrl_ratio);
        (payload * ratio)
            / ((payload + f64::from(self.tlp_overhead)) * ratio + f64::from(self.ctrl_overhead))
    }

    /// Effective bytes/sec for a link of `width` lanes.
    pub fn effective_bandwidth(&self, width: u32) -> f64 {
        (self.rate_gts * 1e9 / 8.0)
            * f64::from(width)
            * (f64::from(self.encoding) / f64::from(self.decoding))
            * self.link_utilization()
    }

    /// Observed rates up to 1% above nominal still count as this generation.
    fn accepts(&self, speed_gts: f64) -> bool {
        speed_gts / self.rate_gts <= 1.01
    }
}

pub static PCI_GENERATIONS: &[PciGeneration] = &[
    PciGeneration {
        name: "gen1",
        rate_gts: 2.5,
        payload: 256,
        tlp_overhead: 24,
        ctrl_ratio: 4,
        ctrl_overhead: 16,
        encoding: 8,
        decoding: 10,
    },
    PciGeneration {
        name: "gen2",
        rate_gts: 5.0,
        payload: 256,
        tlp_overhead: 24,
        ctrl_ratio: 4,
        ctrl_overhead: 16,
        encoding: 8,
        decoding: 10,
    },
    PciGeneration {
        name: "gen3",
        rate_gts: 8.0,
        payload: 256,
        tlp_overhead: 26,
        ctrl_ratio: 4,
        ctrl_overhead: 16,
        encoding: 128,
        decoding: 130,
    },
    PciGeneration {
        name: "gen4",
        rate_gts: 16.0,
        payload: 256,
        tlp_overhead: 26,
        ctrl_ratio: 4,
        ctrl_overhead: 16,
        encoding: 128,
        decoding: 130,
    },
];

/// Bandwidth estimator over an explicit generation table.
#[derive(Debug, Clone, Copy)]
pub struct PciBandwidthEstimator {
    generations: &'static [PciGeneration],
}

impl Default for PciBandwidthEstimator {
    fn default() -> Self {
        Self::new(PCI_GENERATIONS)
    }
}

impl PciBandwidthEstimator {
    pub fn new(generations: &'static [PciGeneration]) -> Self {
        Self { generations }
    }

    /// Match `speed_gts` against the table. The first generation whose
    /// nominal rate is not exceeded by more than 1% wins.
    pub fn generation(&self, speed_gts: f64) -> Option<&'static PciGeneration> {
        if !speed_gts.is_finite() || speed_gts <= 0.0 {
            return None;
        }
        self.generations.iter().find(|g| g.accepts(speed_gts))
    }

    /// Effective bytes/sec, or [`UNBOUNDED_BANDWIDTH`] if no generation matches.
    pub fn estimate(&self, width: u32, speed_gts: f64) -> f64 {
        match self.generation(speed_gts) {
            Some(generation) if width > 0 => {
                let bw = generation.effective_bandwidth(width);
                tracing::trace!(
                    generation = generation.name,
                    width,
                    mbytes_per_sec = bw / (1024.0 * 1024.0),
                    gbits_per_sec = bw * 8e-9,
                    "PCIe effective throughput"
                );
                bw
            }
            _ => UNBOUNDED_BANDWIDTH,
        }
    }

    /// Estimate from the raw sysfs strings. Any parse failure degrades to
    /// [`UNBOUNDED_BANDWIDTH`].
    pub fn estimate_from_strs(&self, width: Option<&str>, speed: Option<&str>) -> f64 {
        let (Some(width), Some(speed)) = (width, speed) else {
            return UNBOUNDED_BANDWIDTH;
        };
        let Some(width) = parse_link_width(width) else {
            tracing::debug!(
                actual = width,
                "{LINK_WIDTH_FILE}: expected <unsigned integer>"
            );
            return UNBOUNDED_BANDWIDTH;
        };
        let Some(speed) = parse_link_speed(speed) else {
            tracing::debug!(actual = speed, "{LINK_SPEED_FILE}: expected <double> GT/s");
            return UNBOUNDED_BANDWIDTH;
        };
        self.estimate(width, speed)
    }

    /// Estimate from `current_link_width` / `current_link_speed` under a
    /// PCI device sysfs directory.
    pub fn estimate_from_sysfs(&self, pci_dir: &Path) -> f64 {
        let width = std::fs::read_to_string(pci_dir.join(LINK_WIDTH_FILE));
        let speed = std::fs::read_to_string(pci_dir.join(LINK_SPEED_FILE));
        match (width, speed) {
            (Ok(w), Ok(s)) => self.estimate_from_strs(Some(&w), Some(&s)),
            (w, s) => {
                if let Err(e) = w.as_ref().and(s.as_ref()) {
                    tracing::debug!(path = %pci_dir.display(), error = %e, "could not read PCIe link files");
                }
                UNBOUNDED_BANDWIDTH
            }
        }
    }
}

/// Parse `current_link_width` ("16", "8\n").
pub fn parse_link_width(s: &str) -> Option<u32> {
    let s = s.trim_start();
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s[..end].parse().ok()
}

/// Parse `current_link_speed` ("8.0 GT/s PCIe", "16GT/s").
///
/// A leading number is followed, with or without spaces, by the unit word
/// `GT/s` (case-insensitive); trailing words after it are ignored.
pub fn parse_link_speed(s: &str) -> Option<f64> {
    let s = s.trim_start();
    let end = s
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '.' | '+' | '-' | 'e' | 'E')))
        .unwrap_or(s.len());
    let value: f64 = s[..end].parse().ok()?;
    let unit = s[end..].split_whitespace().next()?;
    unit.eq_ignore_ascii_case("GT/s").then_some(value)
}
