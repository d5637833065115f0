// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::bank::BankStore;
use crate::deferred::EntropyJob;
use crate::flash::FlashDriver;
use crate::resolver::Resolved;
use crate::Error;
use log::{debug, info, warn};
use rand_core::{CryptoRng, RngCore};
use rollback_areas::{BankIndex, BoardConfig, RollbackRecord, Secret};

/// What ROLLBACK_INFO reports.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RollbackInfo {
    pub id: u32,
    pub min_version: u32,
    /// Rollback version of the RW image currently running.
    pub rw_version: u32,
}

/// The rollback subsystem: both banks, the hardware RNG and the entropy
/// job slot. All state changes go through `&mut self`.
pub struct Rollback<F, R> {
    pub(crate) store: BankStore<F>,
    pub(crate) trng: R,
    pub(crate) job: EntropyJob,
}

impl<F, R> Rollback<F, R>
where
    F: FlashDriver,
    R: RngCore + CryptoRng,
{
    pub fn new(flash: F, config: BoardConfig, trng: R) -> Result<Rollback<F, R>, Error> {
        Ok(Rollback {
            store: BankStore::new(flash, config)?,
            trng,
            job: EntropyJob::Idle,
        })
    }

    pub fn store(&self) -> &BankStore<F> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut BankStore<F> {
        &mut self.store
    }

    pub fn is_locked(&self) -> bool {
        self.store.config().locked
    }

    pub fn resolve(&mut self) -> Result<Resolved, Error> {
        let resolved = self.store.resolve()?;
        debug!("active rollback bank: {:?}", resolved.active_bank());
        Ok(resolved)
    }

    /// Writes the factory record to bank 0 and clears bank 1.
    pub fn provision(&mut self) -> Result<(), Error> {
        if let Resolved::Active { bank, record } = self.resolve()? {
            warn!(
                "refusing to provision: bank {bank} already holds record {}",
                record.id
            );
            return Err(Error::AlreadyProvisioned);
        }

        let record = RollbackRecord::manufactured();
        self.store.erase(BankIndex::Bank1)?;
        self.store.write_record(BankIndex::Bank0, &record)?;
        self.verify(BankIndex::Bank0, &record)?;
        info!("rollback banks provisioned");
        Ok(())
    }

    pub fn minimum_version(&mut self) -> Result<u32, Error> {
        Ok(self.resolve()?.min_version())
    }

    /// Raises the enforced minimum version. It may only ever go up.
    pub fn update_version(&mut self, version: u32) -> Result<(), Error> {
        self.ensure_idle()?;

        let resolved = self.resolve()?;
        let current = resolved.min_version();
        if version <= current {
            warn!("rollback version {version} rejected, minimum is {current}");
            return Err(Error::VersionNotIncreasing {
                current,
                requested: version,
            });
        }

        let secret = resolved.base().secret;
        self.commit(&resolved, version, secret)?;
        Ok(())
    }

    /// Anti-downgrade gate for an image carrying `image_version`.
    pub fn check_firmware_version(&mut self, image_version: u32) -> Result<(), Error> {
        let minimum = self.minimum_version()?;
        if image_version < minimum {
            warn!("image rollback version {image_version} is below minimum {minimum}");
            return Err(Error::Downgrade {
                image: image_version,
                minimum,
            });
        }
        Ok(())
    }

    /// Boot-time check: refuse an older image, and raise the minimum to a
    /// newer one. Returns whether a commit happened.
    pub fn sync_firmware_version(&mut self, image_version: u32) -> Result<bool, Error> {
        self.check_firmware_version(image_version)?;
        if image_version == self.minimum_version()? {
            return Ok(false);
        }
        self.update_version(image_version)?;
        Ok(true)
    }

    pub fn rollback_info(&mut self) -> Result<RollbackInfo, Error> {
        let record = self
            .resolve()?
            .record()
            .copied()
            .ok_or(Error::Unprovisioned)?;
        Ok(RollbackInfo {
            id: record.id,
            min_version: record.min_version,
            rw_version: self.store.config().rw_rollback_version,
        })
    }

    pub(crate) fn ensure_idle(&self) -> Result<(), Error> {
        if self.job.is_pending() {
            warn!("rollback commit refused, entropy job pending");
            return Err(Error::Busy);
        }
        Ok(())
    }

    /// Writes the successor of `resolved` into the inactive bank. The
    /// active bank is not touched, so a failure leaves it in charge.
    pub(crate) fn commit(
        &mut self,
        resolved: &Resolved,
        min_version: u32,
        secret: Secret,
    ) -> Result<RollbackRecord, Error> {
        let record = resolved
            .base()
            .successor(min_version, secret)
            .ok_or(Error::IdExhausted)?;
        let bank = resolved.inactive_bank();

        self.store.write_record(bank, &record)?;
        self.verify(bank, &record)?;

        info!(
            "rollback record {} committed to bank {bank} (min version {})",
            record.id, record.min_version
        );
        Ok(record)
    }

    fn verify(&mut self, bank: BankIndex, expected: &RollbackRecord) -> Result<(), Error> {
        if self.store.read_record(bank)? != *expected {
            return Err(Error::VerifyFailed { bank });
        }
        Ok(())
    }
}
