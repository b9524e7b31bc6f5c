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

//! The Interaction Model: message types, the server-side engine serving
//! read/subscribe/write/invoke against a pluggable data model provider,
//! and the client-side read/subscribe state machine.

use num_derive::FromPrimitive;

use crate::error::{Error, ErrorCode};
use crate::transport::exchange::MessageMeta;

pub mod engine;
pub mod invoke;
pub mod messages;
pub mod read_client;
pub mod report;
pub mod subscriptions;

/// Interaction Model ID as per the Matter Core spec
pub const PROTO_ID_INTERACTION_MODEL: u16 = 0x01;

/// An enumeration of all possible error codes that can be returned by the
/// Interaction Model.
#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IMStatusCode {
    Success = 0,
    Failure = 1,
    InvalidSubscription = 0x7d,
    UnsupportedAccess = 0x7e,
    UnsupportedEndpoint = 0x7f,
    InvalidAction = 0x80,
    UnsupportedCommand = 0x81,
    InvalidCommand = 0x85,
    UnsupportedAttribute = 0x86,
    ConstraintError = 0x87,
    UnsupportedWrite = 0x88,
    ResourceExhausted = 0x89,
    NotFound = 0x8b,
    UnreportableAttribute = 0x8c,
    InvalidDataType = 0x8d,
    UnsupportedRead = 0x8f,
    DataVersionMismatch = 0x92,
    Timeout = 0x94,
    Busy = 0x9c,
    UnsupportedCluster = 0xc3,
    NeedsTimedInteraction = 0xc6,
    PathsExhausted = 0xc8,
    TimedRequestMisMatch = 0xc9,
}

impl From<ErrorCode> for IMStatusCode {
    fn from(e: ErrorCode) -> Self {
        match e {
            ErrorCode::EndpointNotFound => IMStatusCode::UnsupportedEndpoint,
            ErrorCode::ClusterNotFound => IMStatusCode::UnsupportedCluster,
            ErrorCode::AttributeNotFound => IMStatusCode::UnsupportedAttribute,
            ErrorCode::CommandNotFound => IMStatusCode::UnsupportedCommand,
            ErrorCode::InvalidAction => IMStatusCode::InvalidAction,
            ErrorCode::InvalidCommand => IMStatusCode::InvalidCommand,
            ErrorCode::Busy => IMStatusCode::Busy,
            ErrorCode::DataVersionMismatch => IMStatusCode::DataVersionMismatch,
            ErrorCode::ResourceExhausted | ErrorCode::NoSpace => IMStatusCode::ResourceExhausted,
            ErrorCode::ConstraintError => IMStatusCode::ConstraintError,
            ErrorCode::NotFound => IMStatusCode::NotFound,
            ErrorCode::InvalidData | ErrorCode::TLVNotFound | ErrorCode::TLVTypeMismatch => {
                IMStatusCode::InvalidAction
            }
            _ => IMStatusCode::Failure,
        }
    }
}

impl From<Error> for IMStatusCode {
    fn from(value: Error) -> Self {
        Self::from(value.code())
    }
}

/// An enumeration of all possible opcodes used in the Interaction Model.
#[derive(FromPrimitive, Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpCode {
    Reserved = 0,
    StatusResponse = 1,
    ReadRequest = 2,
    SubscribeRequest = 3,
    SubscribeResponse = 4,
    ReportData = 5,
    WriteRequest = 6,
    WriteResponse = 7,
    InvokeRequest = 8,
    InvokeResponse = 9,
    TimedRequest = 10,
}

impl OpCode {
    /// Return the opcode as a `MessageMeta`. All IM messages are reliable.
    pub const fn meta(&self) -> MessageMeta {
        MessageMeta {
            proto_id: PROTO_ID_INTERACTION_MODEL,
            proto_opcode: *self as u8,
            reliable: true,
        }
    }
}

impl From<OpCode> for MessageMeta {
    fn from(opcode: OpCode) -> Self {
        opcode.meta()
    }
}

// Type aliases for first-class matter types
pub type EndptId = u16;
pub type ClusterId = u32;
pub type AttrId = u32;
pub type CmdId = u32;
pub type CommandRef = u16;
pub type DataVersion = u32;
pub type FabricIndex = u8;
pub type ListIndex = u16;
pub type SubscriptionId = u32;

/// A generic (possibly a wildcard) path with endpoint, cluster, and a leaf.
///
/// The leaf could be a command, an attribute, or an event.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GenericPath {
    /// The endpoint ID, if specified, otherwise `None` for wildcard
    pub endpoint: Option<EndptId>,
    /// The cluster ID, if specified, otherwise `None` for wildcard
    pub cluster: Option<ClusterId>,
    /// The leaf ID, if specified, otherwise `None` for wildcard
    pub leaf: Option<u32>,
}

impl GenericPath {
    pub const fn new(
        endpoint: Option<EndptId>,
        cluster: Option<ClusterId>,
        leaf: Option<u32>,
    ) -> Self {
        Self {
            endpoint,
            cluster,
            leaf,
        }
    }

    /// Return Ok, if the path is non wildcard, otherwise returns an error
    pub fn not_wildcard(&self) -> Result<(EndptId, ClusterId, u32), Error> {
        match *self {
            GenericPath {
                endpoint: Some(e),
                cluster: Some(c),
                leaf: Some(l),
            } => Ok((e, c, l)),
            _ => Err(ErrorCode::Invalid.into()),
        }
    }

    /// Return true, if the path is wildcard
    pub const fn is_wildcard(&self) -> bool {
        !matches!(
            *self,
            GenericPath {
                endpoint: Some(_),
                cluster: Some(_),
                leaf: Some(_),
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            IMStatusCode::from(ErrorCode::AttributeNotFound),
            IMStatusCode::UnsupportedAttribute
        );
        assert_eq!(
            IMStatusCode::from(ErrorCode::NoSpace),
            IMStatusCode::ResourceExhausted
        );
        assert_eq!(
            IMStatusCode::from(ErrorCode::TLVTypeMismatch),
            IMStatusCode::InvalidAction
        );
        assert_eq!(IMStatusCode::from(ErrorCode::Crypto), IMStatusCode::Failure);
    }

    #[test]
    fn wildcard_paths() {
        let concrete = GenericPath::new(Some(1), Some(6), Some(0));
        assert!(!concrete.is_wildcard());
        assert_eq!(concrete.not_wildcard().unwrap(), (1, 6, 0));

        let wild = GenericPath::new(Some(1), None, Some(0));
        assert!(wild.is_wildcard());
        assert!(wild.not_wildcard().is_err());
    }
}
