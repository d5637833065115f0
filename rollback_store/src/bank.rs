// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::flash::{FlashDriver, FlashError};
use crate::Error;
use log::debug;
use rollback_areas::{
    BankIndex, BoardConfig, RollbackRecord, ROLLBACK_COOKIE_OFFSET, ROLLBACK_RECORD_SIZE,
};

/// Everything a `u32` flash offset can reach.
const ADDRESS_SPACE: u64 = 1 << 32;

/// The two rollback banks as placed on a particular board.
pub struct BankStore<F> {
    flash: F,
    config: BoardConfig,
}

impl<F: FlashDriver> BankStore<F> {
    pub fn new(flash: F, config: BoardConfig) -> Result<BankStore<F>, Error> {
        config.validate()?;
        Ok(BankStore { flash, config })
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn read(&mut self, bank: BankIndex) -> Result<[u8; ROLLBACK_RECORD_SIZE], Error> {
        let mut bytes = [0u8; ROLLBACK_RECORD_SIZE];
        self.flash
            .read(self.config.bank_offset(bank), &mut bytes)?;
        Ok(bytes)
    }

    pub fn erase(&mut self, bank: BankIndex) -> Result<(), Error> {
        debug!("erasing rollback bank {bank}");
        self.flash
            .erase(self.config.bank_offset(bank), self.config.bank_size)?;
        Ok(())
    }

    /// Programs an encoded record into an erased bank. The cookie goes in
    /// last so an interrupted program never leaves a bank that looks valid.
    pub fn program(
        &mut self,
        bank: BankIndex,
        bytes: &[u8; ROLLBACK_RECORD_SIZE],
    ) -> Result<(), Error> {
        let offset = self.config.bank_offset(bank);
        let cookie_offset = offset
            .checked_add(ROLLBACK_COOKIE_OFFSET as u32)
            .ok_or(FlashError::OutOfBounds {
                offset,
                len: ROLLBACK_RECORD_SIZE,
                size: ADDRESS_SPACE,
            })?;
        self.flash
            .program(offset, &bytes[..ROLLBACK_COOKIE_OFFSET])?;
        self.flash
            .program(cookie_offset, &bytes[ROLLBACK_COOKIE_OFFSET..])?;
        Ok(())
    }

    /// Whatever the bank holds, valid or not.
    pub fn read_record(&mut self, bank: BankIndex) -> Result<RollbackRecord, Error> {
        let bytes = self.read(bank)?;
        Ok(RollbackRecord::decode(&bytes)?)
    }

    pub fn write_record(&mut self, bank: BankIndex, record: &RollbackRecord) -> Result<(), Error> {
        let bytes = record.encode()?;
        self.erase(bank)?;
        self.program(bank, &bytes)
    }

    pub fn read_records(&mut self) -> Result<[RollbackRecord; 2], Error> {
        Ok([
            self.read_record(BankIndex::Bank0)?,
            self.read_record(BankIndex::Bank1)?,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemFlash;
    use rollback_areas::ConfigError;

    fn store() -> BankStore<MemFlash> {
        let config = BoardConfig::default();
        BankStore::new(MemFlash::for_board(&config), config).unwrap()
    }

    #[test]
    fn records_land_at_the_bank_offsets() {
        let mut store = store();
        let record = RollbackRecord::manufactured();
        store.write_record(BankIndex::Bank1, &record).unwrap();

        let bytes = store.flash().as_bytes();
        assert!(bytes[..0x1000].iter().all(|b| *b == 0xff));
        assert_eq!(&bytes[0x1000..0x1000 + ROLLBACK_RECORD_SIZE], &record.encode().unwrap());
        assert_eq!(store.read_record(BankIndex::Bank1).unwrap(), record);
        assert!(!store.read_record(BankIndex::Bank0).unwrap().is_valid());
    }

    #[test]
    fn rewriting_a_bank_erases_it_first() {
        let mut store = store();
        let first = RollbackRecord::manufactured();
        store.write_record(BankIndex::Bank0, &first).unwrap();
        let second = first.successor(9, [0x5a; 32]).unwrap();
        store.write_record(BankIndex::Bank0, &second).unwrap();
        assert_eq!(store.read_record(BankIndex::Bank0).unwrap(), second);
    }

    #[test]
    fn torn_program_leaves_bank_invalid() {
        let mut store = store();
        // The body program succeeds, the cookie program does not
        store.flash_mut().fail_program_after(1);
        let record = RollbackRecord::manufactured().successor(1, [1; 32]).unwrap();
        assert!(store.write_record(BankIndex::Bank0, &record).is_err());

        let torn = store.read_record(BankIndex::Bank0).unwrap();
        assert_eq!(torn.id, 1);
        assert!(!torn.is_valid());
    }

    #[test]
    fn bank_at_the_top_of_the_address_space_does_not_wrap() {
        let config = BoardConfig {
            bank_offsets: [0xffff_ffe0, 0],
            bank_size: 0x40,
            ..BoardConfig::default()
        };
        assert!(matches!(
            BankStore::new(MemFlash::new(0x40, 0xff), config.clone()),
            Err(Error::Config(ConfigError::PastAddressSpace { .. }))
        ));

        // Even without validation the cookie offset is never wrapped around
        let mut store = BankStore {
            flash: MemFlash::new(0x40, 0xff),
            config,
        };
        let bytes = RollbackRecord::manufactured().encode().unwrap();
        assert!(matches!(
            store.program(BankIndex::Bank0, &bytes),
            Err(Error::Flash(FlashError::OutOfBounds { .. }))
        ));
        assert!(store.flash().as_bytes().iter().all(|b| *b == 0xff));
    }

    #[test]
    fn bad_config_is_refused() {
        let config = BoardConfig {
            bank_offsets: [0, 0],
            ..BoardConfig::default()
        };
        assert!(matches!(
            BankStore::new(MemFlash::new(0x2000, 0xff), config),
            Err(Error::Config(_))
        ));
    }
}
