/*
 *
 *    Copyright (c) 2020-2022 Project CHIP Authors
 *
 *    Licensed under the Apache License, Version 2.0 (the "License");
 *    you may not use this file except in compliance with the License.
 *    You may obtain a copy of the License at
 *
 *        http://www.apache.org/licenses/LICENSE-2.0
 *
 *    Unless required by applicable law or agreed to in writing, software
 *    distributed under the License is distributed on an "AS IS" BASIS,
 *    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *    See the License for the specific language governing permissions and
 *    limitations under the License.
 */

//! The Secure Channel protocol: status reports and the PASE/CASE session
//! establishment state machines.

use num_derive::FromPrimitive;

use crate::error::{Error, ErrorCode};
use crate::transport::exchange::MessageMeta;
use crate::utils::parsebuf::ParseBuf;
use crate::utils::writebuf::WriteBuf;

pub mod case;
pub mod pase;
pub mod resume;

/* Secure Channel protocol ID as per the Matter spec */
pub const PROTO_ID_SECURE_CHANNEL: u16 = 0x00;

/// Minimum wait hint carried in a Busy status report, in milliseconds.
pub(crate) const BUSY_WAIT_HINT_MS: u16 = 500;

#[derive(FromPrimitive, Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpCode {
    MRPStandAloneAck = 0x10,
    PBKDFParamRequest = 0x20,
    PBKDFParamResponse = 0x21,
    PASEPake1 = 0x22,
    PASEPake2 = 0x23,
    PASEPake3 = 0x24,
    CASESigma1 = 0x30,
    CASESigma2 = 0x31,
    CASESigma3 = 0x32,
    CASESigma2Resume = 0x33,
    StatusReport = 0x40,
}

impl OpCode {
    pub fn meta(&self) -> MessageMeta {
        MessageMeta {
            proto_id: PROTO_ID_SECURE_CHANNEL,
            proto_opcode: *self as u8,
            reliable: !matches!(self, Self::MRPStandAloneAck),
        }
    }
}

impl From<OpCode> for MessageMeta {
    fn from(op: OpCode) -> Self {
        op.meta()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SCStatusCode {
    SessionEstablishmentSuccess = 0,
    NoSharedTrustRoots = 1,
    InvalidParameter = 2,
    CloseSession = 3,
    Busy = 4,
    SessionNotFound = 5,
}

impl SCStatusCode {
    pub fn reliable(&self) -> bool {
        // CloseSession and Busy are sent without the R flag raised
        !matches!(self, SCStatusCode::CloseSession | SCStatusCode::Busy)
    }

    pub fn as_report<'a>(&self, payload: &'a [u8]) -> StatusReport<'a> {
        let general_code = match self {
            SCStatusCode::SessionEstablishmentSuccess | SCStatusCode::CloseSession => {
                GeneralCode::Success
            }
            SCStatusCode::Busy => GeneralCode::Busy,
            SCStatusCode::InvalidParameter
            | SCStatusCode::NoSharedTrustRoots
            | SCStatusCode::SessionNotFound => GeneralCode::Failure,
        };

        StatusReport {
            general_code,
            proto_id: PROTO_ID_SECURE_CHANNEL as u32,
            proto_code: *self as u16,
            proto_data: payload,
        }
    }
}

#[derive(FromPrimitive, PartialEq, Eq, Debug, Copy, Clone)]
pub enum GeneralCode {
    Success = 0,
    Failure = 1,
    BadPrecondition = 2,
    OutOfRange = 3,
    BadRequest = 4,
    Unsupported = 5,
    Unexpected = 6,
    ResourceExhausted = 7,
    Busy = 8,
    Timeout = 9,
    Continue = 10,
    Aborted = 11,
    InvalidArgument = 12,
    NotFound = 13,
    AlreadyExists = 14,
    PermissionDenied = 15,
    DataLoss = 16,
}

/// A Status Report message, as per "Appendix D: Status Report Messages"
/// of the Matter spec.
#[derive(Debug, Clone)]
pub struct StatusReport<'a> {
    pub general_code: GeneralCode,
    pub proto_id: u32,
    pub proto_code: u16,
    pub proto_data: &'a [u8],
}

impl<'a> StatusReport<'a> {
    pub fn read(pb: &'a mut ParseBuf) -> Result<Self, Error> {
        Ok(Self {
            general_code: num::FromPrimitive::from_u16(pb.le_u16()?)
                .ok_or(ErrorCode::InvalidOpcode)?,
            proto_id: pb.le_u32()?,
            proto_code: pb.le_u16()?,
            proto_data: pb.as_slice(),
        })
    }

    pub fn write(&self, wb: &mut WriteBuf) -> Result<(), Error> {
        wb.le_u16(self.general_code as u16)?;
        wb.le_u32(self.proto_id)?;
        wb.le_u16(self.proto_code)?;
        wb.append(self.proto_data)?;

        Ok(())
    }

    /// Whether this is a success report for the Secure Channel protocol.
    pub fn is_sc_success(&self) -> bool {
        self.general_code == GeneralCode::Success
            && self.proto_id == PROTO_ID_SECURE_CHANNEL as u32
            && self.proto_code == SCStatusCode::SessionEstablishmentSuccess as u16
    }
}

/// Write a status report payload, returning the meta to send it with.
pub fn sc_write(
    wb: &mut WriteBuf,
    status_code: SCStatusCode,
    payload: &[u8],
) -> Result<MessageMeta, Error> {
    status_code.as_report(payload).write(wb)?;

    Ok(OpCode::StatusReport.meta().reliable(status_code.reliable()))
}
