//! Engine configuration.
//!
//! Every SoC-specific constant (memory windows, pool sizes, URB packing limits,
//! timeouts) is injected from a TOML file rather than derived, because the values
//! are tuned per hardware revision. A default file is embedded in the crate.
use std::convert::TryFrom;
use std::time::Duration;

use lazy_static::lazy_static;
use serde::Deserialize;

use crate::memory::MemoryClass;

/// How the engine places rings and buffers in the reserved memory.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(try_from = "u32")]
pub enum ReservationModel {
    /// Transfer rings live on reserved memory from allocation onwards; SRAM
    /// follows system suspend/resume.
    V2,
    /// Transfer rings stay in native memory until a stream is enabled, and the
    /// event ring is backed up so SRAM can be powered off between streams.
    V3,
}

impl TryFrom<u32> for ReservationModel {
    type Error = String;

    fn try_from(version: u32) -> Result<Self, Self::Error> {
        match version {
            2 => Ok(Self::V2),
            3 => Ok(Self::V3),
            other => Err(format!("unsupported sram_version {}", other)),
        }
    }
}

impl ReservationModel {
    pub fn version(self) -> u32 {
        match self {
            Self::V2 => 2,
            Self::V3 => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct WindowConfig {
    pub phys: u64,
    pub virt: u64,
    pub size: usize,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct MemoryConfig {
    pub dram: WindowConfig,
    pub sram: WindowConfig,
}

/// Number of buffer descriptors in each fixed pool.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct PoolConfig {
    pub dcbaa: usize,
    pub device_contexts: usize,
    pub transfer_segments: usize,
    pub erst: usize,
    pub event_ring: usize,
    pub urb: usize,
}

/// Upper bounds of the region use counters.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct CounterCaps {
    pub erst: u8,
    pub event_ring: u8,
    pub transfer_ring: u8,
    pub urb: u8,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct RingConfig {
    /// Slots in the event ring segment table.
    pub erst_entries: usize,
    /// An IRQ period that makes high-speed streams need a second ring segment.
    pub expand_irq_period_ms: u32,
    pub urb_align: u64,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct UrbConfig {
    pub max_packs: u32,
    pub max_packs_hs: u32,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct TimeoutConfig {
    pub command_ms: u64,
    pub dsp_release_ms: u64,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct HidConfig {
    pub max_payload: usize,
    pub fifo_depth: usize,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DeviceQuirk {
    pub vendor: u16,
    pub product: u16,
    pub name: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OffloadConfig {
    pub sram_version: ReservationModel,
    pub adv_lowpwr: bool,
    pub adv_lowpwr_dl_only: bool,
    pub smc_ctrl: bool,
    pub interrupter: u8,
    pub memory: MemoryConfig,
    pub pools: PoolConfig,
    pub counters: CounterCaps,
    pub ring: RingConfig,
    pub urb: UrbConfig,
    pub timeouts: TimeoutConfig,
    pub hid: HidConfig,
    #[serde(default)]
    pub quirks: Vec<DeviceQuirk>,
}

lazy_static! {
    static ref DEFAULT_CONFIG: OffloadConfig = {
        const TOML: &'static [u8] = include_bytes!("../offload.toml");

        toml::from_slice::<OffloadConfig>(TOML).expect("Failed to parse internally embedded config file")
    };
}

impl Default for OffloadConfig {
    fn default() -> Self {
        DEFAULT_CONFIG.clone()
    }
}

impl OffloadConfig {
    pub fn from_toml(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    /// Memory class used for low-power placement.
    pub fn lowpwr_class(&self) -> MemoryClass {
        if self.adv_lowpwr {
            MemoryClass::Sram
        } else {
            MemoryClass::Dram
        }
    }

    /// Memory class for buffers of one stream direction. Capture stays in DRAM when
    /// only the download path may use the low-power memory.
    pub fn stream_class(&self, is_capture: bool) -> MemoryClass {
        if self.adv_lowpwr_dl_only && is_capture {
            MemoryClass::Dram
        } else {
            self.lowpwr_class()
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.command_ms)
    }

    pub fn dsp_release_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.dsp_release_ms)
    }

    pub fn quirk(&self, vendor: u16, product: u16) -> Option<&DeviceQuirk> {
        self.quirks
            .iter()
            .find(|quirk| quirk.vendor == vendor && quirk.product == product)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_config_parses() {
        let config = OffloadConfig::default();
        assert_eq!(config.sram_version, ReservationModel::V3);
        assert_eq!(config.pools.device_contexts, 31);
        assert_eq!(config.pools.urb, 2);
        assert_eq!(config.counters.transfer_ring, 3);
        assert_eq!(config.command_timeout(), Duration::from_secs(10));
        assert!(config.quirk(0x046d, 0x0a38).is_some());
    }

    #[test]
    fn capture_stays_in_dram_when_download_only() {
        let mut config = OffloadConfig::default();
        config.adv_lowpwr = true;
        config.adv_lowpwr_dl_only = true;
        assert_eq!(config.stream_class(true), MemoryClass::Dram);
        assert_eq!(config.stream_class(false), MemoryClass::Sram);
    }

    #[test]
    fn rejects_unknown_sram_version() {
        let source = include_str!("../offload.toml").replace("sram_version = 3", "sram_version = 7");
        assert!(OffloadConfig::from_toml(&source).is_err());
    }
}
