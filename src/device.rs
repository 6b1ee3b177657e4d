//! Device memory map and flash geometry, loaded from the bundled device files.
use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_OPTION_TIMEOUT;
use crate::region::MemoryKind;

/// A device family member the bootloader runs on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub device_id: u32,
    #[serde(default)]
    pub description: String,
    pub regions: Vec<RegionSpec>,
    pub flash: FlashGeometry,
    /// Status polls before a stuck option commit resets the device
    #[serde(default = "default_option_timeout")]
    pub option_timeout: u32,
}

/// One memory of the device file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionSpec {
    pub kind: MemoryKind,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub start: u32,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashGeometry {
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub page_size: u32,
    /// Index of the last page
    pub max_page: u16,
}

impl FlashGeometry {
    pub const fn pages(&self) -> u32 {
        self.max_page as u32 + 1
    }

    /// Last page index as stored in a WRP area register.
    pub const fn max_page_byte(&self) -> u8 {
        self.max_page as u8
    }
}

impl ::std::fmt::Display for Device {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(f, "{}(0x{:03x})", self.name, self.device_id)
    }
}

fn default_option_timeout() -> u32 {
    DEFAULT_OPTION_TIMEOUT
}

pub struct DeviceDB {
    devices: Vec<Device>,
}

impl DeviceDB {
    pub fn load() -> Result<Self> {
        Ok(DeviceDB {
            devices: vec![
                serde_yaml::from_str(include_str!("../devices/0x497-STM32WL55.yaml"))?,
                serde_yaml::from_str(include_str!("../devices/0x497-STM32WLE4.yaml"))?,
            ],
        })
    }

    pub fn find_device(name: &str) -> Result<Device> {
        let db = DeviceDB::load()?;

        let device = db
            .devices
            .into_iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| anyhow::format_err!("Device {} not found", name))?;
        log::debug!("Found device: {}", device);
        Ok(device)
    }

    pub fn names() -> Result<Vec<String>> {
        Ok(DeviceDB::load()?.devices.into_iter().map(|d| d.name).collect())
    }
}

impl Device {
    /// The NUCLEO-WL55JC target.
    pub fn stm32wl55() -> Result<Self> {
        DeviceDB::find_device("STM32WL55")
    }
}

/// Parse `0x` hex, `K`/`KiB`/`KB` sizes and plain decimal.
pub fn parse_number(s: &str) -> Result<u32> {
    let s = s.trim();
    let value = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(&hex.replace('_', ""), 16)?
    } else if let Some(kib) = s
        .strip_suffix("KiB")
        .or_else(|| s.strip_suffix("KB"))
        .or_else(|| s.strip_suffix('K'))
    {
        kib.trim()
            .parse::<u32>()?
            .checked_mul(1024)
            .ok_or_else(|| anyhow::format_err!("{} overflows", s))?
    } else {
        s.replace('_', "").parse()?
    };
    Ok(value)
}

fn parse_address_and_offset<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    parse_number(&s)
        .map_err(|e| serde::de::Error::custom(format!("error while parsing {:?}: {}", s, e)))
}
