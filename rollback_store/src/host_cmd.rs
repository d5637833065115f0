// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host command handlers. Wire structures follow `ec_commands.h`: packed,
//! little-endian.

use crate::deferred::{EntropyAction, EntropySource};
use crate::flash::FlashDriver;
use crate::rollback::Rollback;
use crate::{Error, ErrorKind};
use log::{debug, warn};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use packed_struct::prelude::*;
use rand_core::{CryptoRng, RngCore};

#[derive(Debug, FromPrimitive, ToPrimitive, Copy, Clone, Eq, PartialEq)]
pub enum EcCommand {
    AddEntropy = 0x0122,
    RollbackInfo = 0x0124,
}

/// `EC_RES_*`
#[derive(Debug, FromPrimitive, ToPrimitive, Copy, Clone, Eq, PartialEq)]
pub enum EcStatus {
    Success = 0,
    InvalidCommand = 1,
    Error = 2,
    InvalidParam = 3,
    AccessDenied = 4,
    InvalidResponse = 5,
    InvalidVersion = 6,
    InvalidChecksum = 7,
    InProgress = 8,
    Unavailable = 9,
    Timeout = 10,
    Overflow = 11,
    InvalidHeader = 12,
    RequestTruncated = 13,
    ResponseTooBig = 14,
    BusError = 15,
    Busy = 16,
    InvalidHeaderVersion = 17,
    InvalidHeaderCrc = 18,
    InvalidDataCrc = 19,
    DupUnavailable = 20,
}

impl From<ErrorKind> for EcStatus {
    fn from(kind: ErrorKind) -> EcStatus {
        match kind {
            ErrorKind::Invalid | ErrorKind::ParamCount | ErrorKind::ParamIndex(_) => {
                EcStatus::InvalidParam
            }
            ErrorKind::Busy => EcStatus::Busy,
            ErrorKind::Unknown => EcStatus::Error,
            ErrorKind::AccessDenied => EcStatus::AccessDenied,
            ErrorKind::Unavailable => EcStatus::Unavailable,
        }
    }
}

impl From<&Result<(), Error>> for EcStatus {
    fn from(result: &Result<(), Error>) -> EcStatus {
        match result {
            Ok(()) => EcStatus::Success,
            Err(e) => e.kind().into(),
        }
    }
}

#[derive(PrimitiveEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddEntropyAction {
    /// Add entropy from the TRNG, in the background.
    Async = 0,
    /// Replace the secret with fresh TRNG output, in the background.
    ResetAsync = 1,
    /// Result of the last background operation.
    GetResult = 2,
}

#[derive(PackedStruct, Debug, PartialEq)]
#[packed_struct(size_bytes = "1", bit_numbering = "msb0")]
pub struct EcParamsRollbackAddEntropy {
    #[packed_field(ty = "enum", bits = "0..8")]
    pub action: EnumCatchAll<AddEntropyAction>,
}

#[derive(PackedStruct, Debug, PartialEq, Eq)]
#[packed_struct(size_bytes = "12", bit_numbering = "msb0", endian = "lsb")]
pub struct EcResponseRollbackInfo {
    pub id: u32,
    pub rollback_min_version: u32,
    pub rw_rollback_version: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub struct HostResponse {
    pub status: EcStatus,
    pub data: Vec<u8>,
}

impl HostResponse {
    pub fn status(status: EcStatus) -> HostResponse {
        HostResponse {
            status,
            data: Vec::new(),
        }
    }
}

impl<F, R> Rollback<F, R>
where
    F: FlashDriver,
    R: RngCore + CryptoRng,
{
    /// Dispatches one host command. Never blocks on the TRNG or on flash
    /// writes triggered by ADD_ENTROPY; those run in [`Rollback::run_deferred`].
    pub fn host_command(&mut self, command: u16, version: u8, params: &[u8]) -> HostResponse {
        let Some(command) = EcCommand::from_u16(command) else {
            warn!("unknown host command {command:#06x}");
            return HostResponse::status(EcStatus::InvalidCommand);
        };
        if version != 0 {
            return HostResponse::status(EcStatus::InvalidVersion);
        }
        debug!("host command {command:?}");

        match command {
            EcCommand::AddEntropy => HostResponse::status(self.host_add_entropy(params)),
            EcCommand::RollbackInfo => self.host_rollback_info(),
        }
    }

    fn host_add_entropy(&mut self, params: &[u8]) -> EcStatus {
        let Some(raw) = params.get(..1) else {
            return EcStatus::RequestTruncated;
        };
        let Ok(params) = EcParamsRollbackAddEntropy::unpack_from_slice(raw) else {
            return EcStatus::InvalidParam;
        };

        let result = match params.action {
            EnumCatchAll::Enum(AddEntropyAction::Async) => {
                self.start_async(EntropyAction::Add(EntropySource::Trng))
            }
            EnumCatchAll::Enum(AddEntropyAction::ResetAsync) => {
                self.start_async(EntropyAction::Reset)
            }
            EnumCatchAll::Enum(AddEntropyAction::GetResult) => self.poll_result(),
            EnumCatchAll::CatchAll(action) => {
                warn!("unknown ADD_ENTROPY action {action}");
                return EcStatus::InvalidParam;
            }
        };
        EcStatus::from(&result)
    }

    fn host_rollback_info(&mut self) -> HostResponse {
        let info = match self.rollback_info() {
            Ok(info) => info,
            Err(Error::Unprovisioned) => return HostResponse::status(EcStatus::Unavailable),
            Err(e) => return HostResponse::status(e.kind().into()),
        };

        let response = EcResponseRollbackInfo {
            id: info.id,
            rollback_min_version: info.min_version,
            rw_rollback_version: info.rw_version,
        };
        match response.pack() {
            Ok(bytes) => HostResponse {
                status: EcStatus::Success,
                data: bytes.to_vec(),
            },
            Err(_) => HostResponse::status(EcStatus::Error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_entropy_params_decode() {
        let p = EcParamsRollbackAddEntropy::unpack_from_slice(&[1]).unwrap();
        assert_eq!(p.action, EnumCatchAll::Enum(AddEntropyAction::ResetAsync));

        let p = EcParamsRollbackAddEntropy::unpack_from_slice(&[7]).unwrap();
        assert_eq!(p.action, EnumCatchAll::CatchAll(7));
    }

    #[test]
    fn rollback_info_is_little_endian() {
        let response = EcResponseRollbackInfo {
            id: 0x0102_0304,
            rollback_min_version: 2,
            rw_rollback_version: 0x10,
        };
        assert_eq!(
            response.pack().unwrap(),
            [4, 3, 2, 1, 2, 0, 0, 0, 0x10, 0, 0, 0]
        );
    }

    #[test]
    fn error_kinds_map_to_ec_status() {
        assert_eq!(EcStatus::from(ErrorKind::Busy), EcStatus::Busy);
        assert_eq!(EcStatus::from(ErrorKind::Invalid), EcStatus::InvalidParam);
        assert_eq!(EcStatus::from(ErrorKind::Unknown), EcStatus::Error);
        assert_eq!(EcStatus::from(ErrorKind::Unavailable), EcStatus::Unavailable);
        assert_eq!(EcStatus::from_u16(16), Some(EcStatus::Busy));
        assert_eq!(EcStatus::from_u16(21), None);
    }
}
