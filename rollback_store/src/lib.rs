// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Anti-rollback and entropy chaining on top of two flash banks.
//!
//! [`Rollback`] owns the banks, the hardware RNG and the pending
//! entropy job. Every commit writes a fresh record into the bank that is
//! not currently active; the active bank is always re-derived from the
//! records themselves (valid cookie, largest id), never cached.

pub mod bank;
pub mod console;
pub mod deferred;
pub mod entropy;
pub mod flash;
pub mod host_cmd;
pub mod resolver;
pub mod rollback;

pub use bank::BankStore;
pub use deferred::{EntropyAction, EntropyJob, EntropySource};
pub use flash::{FileFlash, FlashDriver, FlashError, MemFlash};
pub use host_cmd::{EcCommand, EcStatus, HostResponse};
pub use resolver::Resolved;
pub use rollback::{Rollback, RollbackInfo};
pub use rollback_areas::{
    AreaError, BankIndex, BoardConfig, ConfigError, RollbackRecord, Secret, ROLLBACK_COOKIE,
    ROLLBACK_SECRET_SIZE,
};

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("minimum version may only increase: current {current}, requested {requested}")]
    VersionNotIncreasing { current: u32, requested: u32 },

    #[error("rollback banks are already provisioned")]
    AlreadyProvisioned,

    #[error("rollback record id space is exhausted")]
    IdExhausted,

    /// A commit is already outstanding (an entropy job is pending).
    #[error("rollback commit already in flight")]
    Busy,

    #[error("no valid rollback record in either bank")]
    Unprovisioned,

    #[error("rollback secret has never been seeded")]
    Unseeded,

    #[error("image rollback version {image} is below the minimum {minimum}")]
    Downgrade { image: u32, minimum: u32 },

    #[error("no entropy operation has been started")]
    NoJob,

    #[error("bank {bank} does not read back what was programmed")]
    VerifyFailed { bank: BankIndex },

    #[error("wrong number of parameters")]
    ParamCount,

    #[error("parameter {0} invalid")]
    Param(u8),

    #[error("unknown console command `{0}`")]
    UnknownCommand(String),

    #[error("flash error: {0}")]
    Flash(#[from] FlashError),

    #[error("hardware RNG failure")]
    Trng(#[source] rand_core::Error),

    #[error(transparent)]
    Area(#[from] AreaError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("console output failed")]
    Console(#[from] fmt::Error),
}

/// The status vocabulary shared by the host command and console adapters.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Invalid,
    Busy,
    Unknown,
    ParamCount,
    /// 1-based index of the offending argument.
    ParamIndex(u8),
    AccessDenied,
    Unavailable,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::VersionNotIncreasing { .. }
            | Error::AlreadyProvisioned
            | Error::IdExhausted
            | Error::UnknownCommand(_) => ErrorKind::Invalid,
            Error::Busy => ErrorKind::Busy,
            Error::Downgrade { .. } => ErrorKind::AccessDenied,
            Error::NoJob => ErrorKind::Unavailable,
            Error::ParamCount => ErrorKind::ParamCount,
            Error::Param(index) => ErrorKind::ParamIndex(*index),
            Error::Unprovisioned
            | Error::Unseeded
            | Error::VerifyFailed { .. }
            | Error::Flash(_)
            | Error::Trng(_)
            | Error::Area(_)
            | Error::Config(_)
            | Error::Console(_) => ErrorKind::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Invalid => write!(f, "Invalid"),
            ErrorKind::Busy => write!(f, "Busy"),
            ErrorKind::Unknown => write!(f, "Unknown error"),
            ErrorKind::ParamCount => write!(f, "Wrong number of params"),
            ErrorKind::ParamIndex(index) => write!(f, "Parameter {index} invalid"),
            ErrorKind::AccessDenied => write!(f, "Access denied"),
            ErrorKind::Unavailable => write!(f, "Unavailable"),
        }
    }
}
