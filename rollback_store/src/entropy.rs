// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The rollback secret: an accumulator that every piece of added entropy
//! is hashed into.

use crate::flash::FlashDriver;
use crate::rollback::Rollback;
use crate::Error;
use log::{debug, info, warn};
use rand_core::{CryptoRng, RngCore};
use rollback_areas::{Secret, ROLLBACK_SECRET_SIZE, UNSEEDED_SECRET};
use sha2::{Digest, Sha256};

/// `SHA256(secret || data)`
pub fn chain_secret(secret: &Secret, data: &[u8]) -> Secret {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(data);
    hasher.finalize().into()
}

impl<F, R> Rollback<F, R>
where
    F: FlashDriver,
    R: RngCore + CryptoRng,
{
    pub fn secret(&mut self) -> Result<Secret, Error> {
        let resolved = self.resolve()?;
        let record = resolved.record().ok_or(Error::Unprovisioned)?;
        if !record.is_seeded() {
            return Err(Error::Unseeded);
        }
        Ok(record.secret)
    }

    /// Chains `data` into the secret. The minimum version is carried over.
    pub fn add_entropy(&mut self, data: &[u8]) -> Result<(), Error> {
        self.ensure_idle()?;
        self.chain_entropy(data)
    }

    /// Replaces the secret in both banks with one derived only from fresh
    /// TRNG output.
    pub fn reset_entropy(&mut self) -> Result<(), Error> {
        self.ensure_idle()?;
        self.reseed()
    }

    pub(crate) fn chain_entropy(&mut self, data: &[u8]) -> Result<(), Error> {
        let resolved = self.resolve()?;
        let base = resolved.base();
        debug!("chaining {} bytes of entropy", data.len());
        self.commit(&resolved, base.min_version, chain_secret(&base.secret, data))?;
        Ok(())
    }

    /// The first commit makes a fresh secret active; that is the result.
    /// The second overwrites the bank still holding the old chain and is
    /// best effort, since failing it cannot bring the old secret back.
    pub(crate) fn reseed(&mut self) -> Result<(), Error> {
        self.commit_fresh_secret()?;
        info!("rollback secret reset");

        if let Err(e) = self.commit_fresh_secret() {
            warn!("previous rollback secret not scrubbed from the other bank: {e}");
        }
        Ok(())
    }

    fn commit_fresh_secret(&mut self) -> Result<(), Error> {
        let random = self.sample_trng()?;
        let resolved = self.resolve()?;
        let min_version = resolved.min_version();
        self.commit(&resolved, min_version, chain_secret(&UNSEEDED_SECRET, &random))?;
        Ok(())
    }

    pub(crate) fn sample_trng(&mut self) -> Result<Secret, Error> {
        let mut random = [0u8; ROLLBACK_SECRET_SIZE];
        self.trng.try_fill_bytes(&mut random).map_err(Error::Trng)?;
        Ok(random)
    }
}
