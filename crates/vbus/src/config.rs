use serde::{Deserialize, Serialize};
use vbus_types::AddressBlock;

use crate::device_mapper::SERIAL_PORT_COUNT;
use crate::error::{BusError, BusResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusControllerConfig {
    /// Width of the address bus. The address space holds `2^address_bits` words; at 64 bits the
    /// last word is not addressable.
    pub address_bits: u32,
    /// Width of one data word in bits (1..=64).
    pub word_bits: u32,
    /// Number of address map configurations kept side by side.
    pub configurations: usize,
    /// Base address of the 4-word serial enumeration window, or `None` to leave it unmapped.
    pub serial_base: Option<u64>,
    /// Ticks to wait before retrying a scan that hit an unreachable neighbor.
    pub scan_retry_delay_ticks: u64,
    /// Interrupt ids at or above this limit make the interrupt map invalid.
    pub max_interrupt_ids: u32,
}

impl Default for BusControllerConfig {
    fn default() -> Self {
        Self {
            address_bits: 32,
            word_bits: 32,
            configurations: 1,
            serial_base: Some(0),
            scan_retry_delay_ticks: 20,
            max_interrupt_ids: 1024,
        }
    }
}

impl BusControllerConfig {
    pub fn validate(&self) -> BusResult<()> {
        if self.address_bits == 0 || self.address_bits > 64 {
            return Err(BusError::InvalidConfig("address_bits must be in 1..=64"));
        }
        if self.word_bits == 0 || self.word_bits > 64 {
            return Err(BusError::InvalidConfig("word_bits must be in 1..=64"));
        }
        if self.configurations == 0 {
            return Err(BusError::InvalidConfig("at least one configuration is required"));
        }
        if self.scan_retry_delay_ticks == 0 {
            return Err(BusError::InvalidConfig("scan_retry_delay_ticks must be non-zero"));
        }
        if let Some(window) = self.serial_window() {
            if !window.fits_within(self.address_space_words()) {
                return Err(BusError::InvalidConfig(
                    "serial window lies outside the address space",
                ));
            }
        }
        Ok(())
    }

    pub fn address_space_words(&self) -> u64 {
        if self.address_bits >= 64 {
            u64::MAX
        } else {
            1u64 << self.address_bits
        }
    }

    pub fn word_mask(&self) -> u64 {
        word_mask(self.word_bits)
    }

    pub fn serial_window(&self) -> Option<AddressBlock> {
        self.serial_base
            .map(|base| AddressBlock::new(base, SERIAL_PORT_COUNT, self.word_bits))
    }
}

pub(crate) fn word_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = BusControllerConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.address_space_words(), 1 << 32);
        assert_eq!(cfg.word_mask(), 0xFFFF_FFFF);
        assert_eq!(cfg.serial_window(), Some(AddressBlock::new(0, 4, 32)));
    }

    #[test]
    fn rejects_degenerate_widths() {
        for cfg in [
            BusControllerConfig {
                address_bits: 0,
                ..Default::default()
            },
            BusControllerConfig {
                word_bits: 65,
                ..Default::default()
            },
            BusControllerConfig {
                configurations: 0,
                ..Default::default()
            },
            BusControllerConfig {
                scan_retry_delay_ticks: 0,
                ..Default::default()
            },
        ] {
            assert!(matches!(cfg.validate(), Err(BusError::InvalidConfig(_))));
        }
    }

    #[test]
    fn serial_window_must_fit() {
        let cfg = BusControllerConfig {
            address_bits: 4,
            serial_base: Some(14),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = BusControllerConfig {
            serial_base: Some(12),
            ..cfg
        };
        cfg.validate().unwrap();
    }

    #[test]
    fn full_width_masks() {
        assert_eq!(word_mask(64), u64::MAX);
        assert_eq!(word_mask(8), 0xFF);
        let cfg = BusControllerConfig {
            address_bits: 64,
            ..Default::default()
        };
        assert_eq!(cfg.address_space_words(), u64::MAX);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: BusControllerConfig = serde_json::from_str(r#"{"word_bits": 16}"#).unwrap();
        assert_eq!(cfg.word_bits, 16);
        assert_eq!(cfg.address_bits, 32);
        assert_eq!(cfg.serial_base, Some(0));
    }
}
