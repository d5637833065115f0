// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::bank::BankStore;
use crate::flash::FlashDriver;
use crate::Error;
use rollback_areas::{BankIndex, RollbackRecord};

/// Which bank currently holds the authoritative record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resolved {
    Active {
        bank: BankIndex,
        record: RollbackRecord,
    },
    /// Neither bank carries a valid cookie.
    Unprovisioned,
}

impl Resolved {
    pub fn record(&self) -> Option<&RollbackRecord> {
        match self {
            Resolved::Active { record, .. } => Some(record),
            Resolved::Unprovisioned => None,
        }
    }

    pub fn active_bank(&self) -> Option<BankIndex> {
        match self {
            Resolved::Active { bank, .. } => Some(*bank),
            Resolved::Unprovisioned => None,
        }
    }

    /// Where the next commit goes.
    pub fn inactive_bank(&self) -> BankIndex {
        match self {
            Resolved::Active { bank, .. } => bank.other(),
            Resolved::Unprovisioned => BankIndex::Bank0,
        }
    }

    /// Unprovisioned parts enforce nothing.
    pub fn min_version(&self) -> u32 {
        self.record().map_or(0, |r| r.min_version)
    }

    /// The record the next commit is derived from.
    pub fn base(&self) -> RollbackRecord {
        self.record()
            .copied()
            .unwrap_or_else(RollbackRecord::manufactured)
    }
}

/// Picks the valid record with the largest id. On a tie bank 0 wins.
pub fn resolve_records(records: &[RollbackRecord; 2]) -> Resolved {
    let mut best: Option<(BankIndex, &RollbackRecord)> = None;
    for (bank, record) in BankIndex::ALL.into_iter().zip(records) {
        if !record.is_valid() {
            continue;
        }
        match best {
            Some((_, current)) if current.id >= record.id => {}
            _ => best = Some((bank, record)),
        }
    }

    match best {
        Some((bank, record)) => Resolved::Active {
            bank,
            record: *record,
        },
        None => Resolved::Unprovisioned,
    }
}

impl<F: FlashDriver> BankStore<F> {
    pub fn resolve(&mut self) -> Result<Resolved, Error> {
        Ok(resolve_records(&self.read_records()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollback_areas::ROLLBACK_COOKIE;

    fn record(id: u32, min_version: u32, valid: bool) -> RollbackRecord {
        RollbackRecord {
            id,
            min_version,
            secret: [id as u8; 32],
            cookie: if valid { ROLLBACK_COOKIE } else { 0xffff_ffff },
        }
    }

    #[test]
    fn larger_id_wins() {
        let resolved = resolve_records(&[record(4, 1, true), record(5, 2, true)]);
        assert_eq!(resolved.active_bank(), Some(BankIndex::Bank1));
        assert_eq!(resolved.min_version(), 2);
        assert_eq!(resolved.inactive_bank(), BankIndex::Bank0);

        let resolved = resolve_records(&[record(7, 3, true), record(6, 2, true)]);
        assert_eq!(resolved.active_bank(), Some(BankIndex::Bank0));
    }

    #[test]
    fn invalid_bank_is_ignored_whatever_its_id() {
        let resolved = resolve_records(&[record(1, 1, true), record(u32::MAX, 9, false)]);
        assert_eq!(resolved.active_bank(), Some(BankIndex::Bank0));
        assert_eq!(resolved.min_version(), 1);
    }

    #[test]
    fn tie_goes_to_bank_zero() {
        let resolved = resolve_records(&[record(3, 1, true), record(3, 2, true)]);
        assert_eq!(resolved.active_bank(), Some(BankIndex::Bank0));
    }

    #[test]
    fn nothing_valid_is_unprovisioned() {
        let resolved = resolve_records(&[record(3, 1, false), record(3, 2, false)]);
        assert_eq!(resolved, Resolved::Unprovisioned);
        assert_eq!(resolved.min_version(), 0);
        assert_eq!(resolved.inactive_bank(), BankIndex::Bank0);
        assert_eq!(resolved.base(), RollbackRecord::manufactured());
    }
}
