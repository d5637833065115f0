// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-flash layout of the two rollback banks.
//!
//! Each bank holds at most one [`RollbackRecord`], serialized little-endian
//! and padded up to the bank size with whatever the flash reads back as
//! after an erase.

use packed_struct::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

mod board;
pub use board::*;

/// Magic value that makes a record valid. Anything else, erased flash
/// included, is treated as an empty bank.
pub const ROLLBACK_COOKIE: u32 = 0x0b11_2233;

/// Size of the accumulated secret. Matches the SHA-256 digest size so the
/// chain output can be stored without truncation.
pub const ROLLBACK_SECRET_SIZE: usize = 32;

/// Size of a serialized record: id, min_version, secret, cookie.
pub const ROLLBACK_RECORD_SIZE: usize = 4 + 4 + ROLLBACK_SECRET_SIZE + 4;

/// The cookie is the last field; it gets programmed after everything else.
pub const ROLLBACK_COOKIE_OFFSET: usize = ROLLBACK_RECORD_SIZE - 4;

pub const ROLLBACK_BANK_COUNT: usize = 2;

pub type Secret = [u8; ROLLBACK_SECRET_SIZE];

/// The unprovisioned / never seeded secret.
pub const UNSEEDED_SECRET: Secret = [0; ROLLBACK_SECRET_SIZE];

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum BankIndex {
    Bank0 = 0,
    Bank1 = 1,
}

impl BankIndex {
    pub const ALL: [BankIndex; ROLLBACK_BANK_COUNT] = [BankIndex::Bank0, BankIndex::Bank1];

    pub fn index(self) -> usize {
        self as usize
    }

    /// The bank a commit lands in when `self` is active.
    pub fn other(self) -> BankIndex {
        BankIndex::ALL[1 - self.index()]
    }
}

impl fmt::Display for BankIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PackedStruct)]
#[packed_struct(size_bytes = "44", bit_numbering = "msb0", endian = "lsb")]
pub struct RollbackRecord {
    // Incremented on every commit, the larger valid id wins
    pub id: u32,

    // Lowest firmware version that may run. Never decreases.
    pub min_version: u32,

    pub secret: [u8; 32],

    // Must stay last, see ROLLBACK_COOKIE_OFFSET
    pub cookie: u32,
}

impl RollbackRecord {
    /// The record a freshly manufactured part carries in bank 0.
    pub fn manufactured() -> RollbackRecord {
        RollbackRecord {
            id: 0,
            min_version: 0,
            secret: UNSEEDED_SECRET,
            cookie: ROLLBACK_COOKIE,
        }
    }

    /// Builds the record that supersedes `self`. Returns `None` once the id
    /// space is exhausted, since wrapping would make the old bank win again.
    pub fn successor(&self, min_version: u32, secret: Secret) -> Option<RollbackRecord> {
        Some(RollbackRecord {
            id: self.id.checked_add(1)?,
            min_version,
            secret,
            cookie: ROLLBACK_COOKIE,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.cookie == ROLLBACK_COOKIE
    }

    pub fn is_seeded(&self) -> bool {
        self.secret != UNSEEDED_SECRET
    }

    pub fn encode(&self) -> Result<[u8; ROLLBACK_RECORD_SIZE], AreaError> {
        self.pack().map_err(AreaError::Pack)
    }

    /// Decodes the record at the start of `bytes`; trailing padding is
    /// ignored.
    pub fn decode(bytes: &[u8]) -> Result<RollbackRecord, AreaError> {
        let record = bytes
            .get(..ROLLBACK_RECORD_SIZE)
            .ok_or(AreaError::Truncated {
                expected: ROLLBACK_RECORD_SIZE,
                actual: bytes.len(),
            })?;
        RollbackRecord::unpack_from_slice(record).map_err(AreaError::Unpack)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AreaError {
    #[error("rollback record needs {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    // NOTE: no #[from] here, pack and unpack share the same error type
    #[error("packing rollback record failed")]
    Pack(#[source] packed_struct::PackingError),

    #[error("unpacking rollback record failed")]
    Unpack(#[source] packed_struct::PackingError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_little_endian_with_cookie_last() {
        let mut secret = UNSEEDED_SECRET;
        secret[0] = 0xaa;
        secret[31] = 0x55;
        let record = RollbackRecord {
            id: 0x0102_0304,
            min_version: 7,
            secret,
            cookie: ROLLBACK_COOKIE,
        };

        let bytes = record.encode().unwrap();
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..8], &[7, 0, 0, 0]);
        assert_eq!(bytes[8], 0xaa);
        assert_eq!(bytes[39], 0x55);
        assert_eq!(&bytes[ROLLBACK_COOKIE_OFFSET..], &[0x33, 0x22, 0x11, 0x0b]);
    }

    #[test]
    fn erased_flash_is_not_a_record() {
        let erased = [0xffu8; 64];
        let record = RollbackRecord::decode(&erased).unwrap();
        assert!(!record.is_valid());
        assert_eq!(record.id, u32::MAX);
    }

    #[test]
    fn decode_ignores_padding_and_rejects_short_input() {
        let mut bank = vec![0xffu8; 128];
        let record = RollbackRecord::manufactured();
        bank[..ROLLBACK_RECORD_SIZE].copy_from_slice(&record.encode().unwrap());
        assert_eq!(RollbackRecord::decode(&bank).unwrap(), record);

        assert!(matches!(
            RollbackRecord::decode(&bank[..10]),
            Err(AreaError::Truncated { expected: 44, actual: 10 })
        ));
    }

    #[test]
    fn successor_bumps_id_and_refuses_to_wrap() {
        let base = RollbackRecord::manufactured();
        let next = base.successor(3, base.secret).unwrap();
        assert_eq!(next.id, 1);
        assert_eq!(next.min_version, 3);
        assert!(next.is_valid());

        let last = RollbackRecord { id: u32::MAX, ..base };
        assert!(last.successor(3, base.secret).is_none());
    }

    #[test]
    fn banks_ping_pong() {
        assert_eq!(BankIndex::Bank0.other(), BankIndex::Bank1);
        assert_eq!(BankIndex::Bank1.other(), BankIndex::Bank0);
    }
}
