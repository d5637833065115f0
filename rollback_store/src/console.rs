// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::deferred::{EntropyAction, EntropySource};
use crate::flash::FlashDriver;
use crate::rollback::Rollback;
use crate::Error;
use rand_core::{CryptoRng, RngCore};
use rollback_areas::{BankIndex, ROLLBACK_SECRET_SIZE};
use std::fmt::Write;
use std::str::FromStr;
use strum_macros::{Display, EnumString};

#[derive(Debug, Display, EnumString, Copy, Clone, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum ConsoleCommand {
    RollbackInfo,
    RollbackUpdate,
    RollbackAddEnt,
}

impl<F, R> Rollback<F, R>
where
    F: FlashDriver,
    R: RngCore + CryptoRng,
{
    /// Runs one console line and returns what it prints.
    pub fn console(&mut self, line: &str) -> Result<String, Error> {
        let argv: Vec<&str> = line.split_whitespace().collect();
        self.console_argv(&argv)
    }

    pub fn console_argv(&mut self, argv: &[&str]) -> Result<String, Error> {
        let Some(name) = argv.first() else {
            return Ok(String::new());
        };
        let command =
            ConsoleCommand::from_str(name).map_err(|_| Error::UnknownCommand(name.to_string()))?;

        match command {
            ConsoleCommand::RollbackInfo => self.console_info(),
            ConsoleCommand::RollbackUpdate => {
                if argv.len() != 2 {
                    return Err(Error::ParamCount);
                }
                let version = parse_int::parse::<u32>(argv[1]).map_err(|_| Error::Param(1))?;
                self.update_version(version)?;
                Ok(String::new())
            }
            ConsoleCommand::RollbackAddEnt => {
                if argv.len() > 2 {
                    return Err(Error::ParamCount);
                }
                let source = match argv.get(1) {
                    Some(data) => EntropySource::Data(data.as_bytes().to_vec()),
                    None => EntropySource::Trng,
                };
                self.ensure_idle()?;
                self.execute(&EntropyAction::Add(source))?;
                Ok(String::new())
            }
        }
    }

    fn console_info(&mut self) -> Result<String, Error> {
        let active = self.resolve()?;
        let mut out = String::new();

        writeln!(out, "rollback minimum version: {}", active.min_version())?;
        writeln!(
            out,
            "RW rollback version: {}",
            self.store.config().rw_rollback_version
        )?;

        for bank in BankIndex::ALL {
            let record = self.store.read_record(bank)?;
            write!(
                out,
                "rollback {bank}: {:08x} {:08x} {:08x}",
                record.id, record.min_version, record.cookie
            )?;
            // Locked parts must not leak any of the secret
            if !self.is_locked() {
                write!(
                    out,
                    " [{:02x}..{:02x}]",
                    record.secret[0],
                    record.secret[ROLLBACK_SECRET_SIZE - 1]
                )?;
            }
            if active.active_bank() == Some(bank) {
                write!(out, " *")?;
            }
            writeln!(out)?;
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_names() {
        assert_eq!(
            ConsoleCommand::from_str("rollbackaddent").unwrap(),
            ConsoleCommand::RollbackAddEnt
        );
        assert_eq!(ConsoleCommand::RollbackInfo.to_string(), "rollbackinfo");
        assert!(ConsoleCommand::from_str("rollback").is_err());
    }
}
