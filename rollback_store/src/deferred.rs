// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entropy operations run outside of host command dispatch.
//!
//! A host command only records what it wants done; [`Rollback::run_deferred`]
//! stands in for the deferred task that later samples the TRNG and commits.
//! The result is parked until the host asks for it.

use crate::flash::FlashDriver;
use crate::rollback::Rollback;
use crate::Error;
use log::{debug, warn};
use rand_core::{CryptoRng, RngCore};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntropySource {
    /// 32 bytes from the hardware RNG.
    Trng,
    Data(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntropyAction {
    Add(EntropySource),
    /// Drop the current chain, see [`Rollback::reset_entropy`].
    Reset,
}

#[derive(Debug, Default)]
pub enum EntropyJob {
    #[default]
    Idle,
    Pending(EntropyAction),
    Done(Result<(), Error>),
}

impl EntropyJob {
    pub fn is_pending(&self) -> bool {
        matches!(self, EntropyJob::Pending(_))
    }
}

impl<F, R> Rollback<F, R>
where
    F: FlashDriver,
    R: RngCore + CryptoRng,
{
    pub fn job(&self) -> &EntropyJob {
        &self.job
    }

    /// Queues `action` and returns at once. Only one job may be in flight;
    /// an uncollected result is discarded.
    pub fn start_async(&mut self, action: EntropyAction) -> Result<(), Error> {
        match &self.job {
            EntropyJob::Pending(_) => return Err(Error::Busy),
            EntropyJob::Done(result) => {
                warn!("dropping uncollected entropy result: {result:?}");
            }
            EntropyJob::Idle => {}
        }
        debug!("entropy job queued: {action:?}");
        self.job = EntropyJob::Pending(action);
        Ok(())
    }

    /// `Busy` until the job has run, then its result once. With nothing to
    /// report the answer is [`Error::NoJob`].
    pub fn poll_result(&mut self) -> Result<(), Error> {
        match std::mem::take(&mut self.job) {
            EntropyJob::Idle => Err(Error::NoJob),
            EntropyJob::Pending(action) => {
                self.job = EntropyJob::Pending(action);
                Err(Error::Busy)
            }
            EntropyJob::Done(result) => result,
        }
    }

    /// Runs the pending job, if any. Returns whether there was one.
    pub fn run_deferred(&mut self) -> bool {
        let action = match std::mem::take(&mut self.job) {
            EntropyJob::Pending(action) => action,
            other => {
                self.job = other;
                return false;
            }
        };

        let result = self.execute(&action);
        debug!("entropy job {action:?} finished: {result:?}");
        self.job = EntropyJob::Done(result);
        true
    }

    /// Also used by the synchronous console path.
    pub(crate) fn execute(&mut self, action: &EntropyAction) -> Result<(), Error> {
        match action {
            EntropyAction::Add(EntropySource::Trng) => {
                let random = self.sample_trng()?;
                self.chain_entropy(&random)
            }
            EntropyAction::Add(EntropySource::Data(data)) => self.chain_entropy(data),
            EntropyAction::Reset => self.reseed(),
        }
    }
}
