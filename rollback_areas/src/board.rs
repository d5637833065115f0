// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{BankIndex, ROLLBACK_BANK_COUNT, ROLLBACK_RECORD_SIZE};
use serde::{Deserialize, Serialize};

/// Board-specific placement of the rollback banks.
///
/// Usually read from a TOML file; every field has a default matching two
/// 4 KiB erase sectors at the start of the flash.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BoardConfig {
    /// Flash offset of bank 0 and bank 1.
    #[serde(default = "default_bank_offsets")]
    pub bank_offsets: [u32; ROLLBACK_BANK_COUNT],

    /// Size of each bank. A bank is always erased as a whole.
    #[serde(default = "default_bank_size")]
    pub bank_size: u32,

    /// What the flash reads back as after an erase.
    #[serde(default = "default_erased_value")]
    pub erased_value: u8,

    /// Rollback version baked into the RW image, reported by ROLLBACK_INFO.
    #[serde(default)]
    pub rw_rollback_version: u32,

    /// Production (locked) parts never print any part of the secret.
    #[serde(default)]
    pub locked: bool,
}

fn default_bank_offsets() -> [u32; ROLLBACK_BANK_COUNT] {
    [0x0, 0x1000]
}

fn default_bank_size() -> u32 {
    0x1000
}

fn default_erased_value() -> u8 {
    0xff
}

/// Banks are addressed with `u32` offsets.
const FLASH_ADDRESS_SPACE: u64 = 1 << 32;

impl Default for BoardConfig {
    fn default() -> Self {
        BoardConfig {
            bank_offsets: default_bank_offsets(),
            bank_size: default_bank_size(),
            erased_value: default_erased_value(),
            rw_rollback_version: 0,
            locked: false,
        }
    }
}

impl BoardConfig {
    pub fn bank_offset(&self, bank: BankIndex) -> u32 {
        self.bank_offsets[bank.index()]
    }

    /// Smallest flash that holds both banks.
    pub fn flash_size(&self) -> u64 {
        self.bank_offsets
            .iter()
            .map(|offset| u64::from(*offset) + u64::from(self.bank_size))
            .max()
            .unwrap_or(0)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if (self.bank_size as usize) < ROLLBACK_RECORD_SIZE {
            return Err(ConfigError::BankTooSmall {
                size: self.bank_size,
                needed: ROLLBACK_RECORD_SIZE,
            });
        }

        let [first, second] = self.bank_offsets.map(u64::from);
        let size = u64::from(self.bank_size);
        for offset in self.bank_offsets {
            if u64::from(offset) + size > FLASH_ADDRESS_SPACE {
                return Err(ConfigError::PastAddressSpace {
                    offset,
                    size: self.bank_size,
                });
            }
        }

        if first < second + size && second < first + size {
            return Err(ConfigError::Overlap {
                first: self.bank_offsets[0],
                second: self.bank_offsets[1],
                size: self.bank_size,
            });
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("bank size {size:#x} cannot hold a {needed} byte rollback record")]
    BankTooSmall { size: u32, needed: usize },

    #[error("bank at {offset:#x} of size {size:#x} runs past the 4 GiB flash address space")]
    PastAddressSpace { offset: u32, size: u32 },

    #[error("banks at {first:#x} and {second:#x} overlap (bank size {size:#x})")]
    Overlap { first: u32, second: u32, size: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg: BoardConfig = toml::from_str("rw-rollback-version = 3\nlocked = true\n").unwrap();
        assert_eq!(cfg.bank_offsets, [0x0, 0x1000]);
        assert_eq!(cfg.bank_size, 0x1000);
        assert_eq!(cfg.erased_value, 0xff);
        assert_eq!(cfg.rw_rollback_version, 3);
        assert!(cfg.locked);
        assert_eq!(cfg.flash_size(), 0x2000);
        cfg.validate().unwrap();
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<BoardConfig>("bank-count = 3\n").is_err());
    }

    #[test]
    fn overlapping_or_tiny_banks_are_rejected() {
        let cfg = BoardConfig {
            bank_offsets: [0x0, 0x800],
            ..BoardConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Overlap { .. })));

        let cfg = BoardConfig {
            bank_size: 16,
            ..BoardConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::BankTooSmall { size: 16, .. })
        ));
    }

    #[test]
    fn banks_must_fit_below_4gib() {
        let cfg: BoardConfig =
            toml::from_str("bank-offsets = [0xffffffe0, 0]\nbank-size = 0x40\n").unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::PastAddressSpace {
                offset: 0xffff_ffe0,
                size: 0x40
            })
        ));

        // Ending exactly at the top is fine
        let cfg = BoardConfig {
            bank_offsets: [0xffff_f000, 0],
            ..BoardConfig::default()
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.flash_size(), 1 << 32);
    }

    #[test]
    fn banks_may_be_placed_out_of_order() {
        let cfg = BoardConfig {
            bank_offsets: [0x3000, 0x1000],
            ..BoardConfig::default()
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.flash_size(), 0x4000);
        assert_eq!(cfg.bank_offset(BankIndex::Bank1), 0x1000);
    }
}
