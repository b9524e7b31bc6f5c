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

use core::fmt::{self, Display};

/// All error codes used across the crate.
///
/// Errors that cross the wire are never sent raw; they are mapped to
/// Secure Channel status reports or Interaction Model status codes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    AttributeNotFound,
    BufferTooSmall,
    Busy,
    ClusterNotFound,
    CommandNotFound,
    ConstraintError,
    Crypto,
    DataVersionMismatch,
    Duplicate,
    EndpointNotFound,
    Failure,
    Invalid,
    InvalidAction,
    InvalidCommand,
    InvalidData,
    InvalidKeyLength,
    InvalidOpcode,
    InvalidPeerAddr,
    InvalidProto,
    InvalidState,
    MessageCounterExhausted,
    NoExchange,
    NoHandler,
    NoSession,
    NoSpace,
    NoSpaceExchanges,
    NoSpaceSessions,
    NotFound,
    ResourceExhausted,
    RxTimeout,
    StdIoError,
    SysTimeFail,
    TLVNotFound,
    TLVTypeMismatch,
    TruncatedPacket,
    TxTimeout,
}

impl ErrorCode {
    /// Whether this error is expected to be somewhat common and
    /// therefore not worth logging at error level.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::NotFound | Self::Duplicate | Self::NoSpace | Self::TLVNotFound
        )
    }
}

pub struct Error {
    code: ErrorCode,
    #[cfg(all(feature = "std", feature = "backtrace"))]
    backtrace: std::backtrace::Backtrace,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            #[cfg(all(feature = "std", feature = "backtrace"))]
            backtrace: std::backtrace::Backtrace::capture(),
        }
    }

    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    #[cfg(all(feature = "std", feature = "backtrace"))]
    pub fn backtrace(&self) -> &std::backtrace::Backtrace {
        &self.backtrace
    }

    /// Remap an error to another code, leaving all other codes untouched.
    pub fn remap<F>(self, matcher: F, to: Self) -> Self
    where
        F: FnOnce(&Self) -> bool,
    {
        if matcher(&self) {
            to
        } else {
            self
        }
    }

    pub fn map_invalid(self, to: Self) -> Self {
        self.remap(
            |e| matches!(e.code(), ErrorCode::Invalid | ErrorCode::InvalidData),
            to,
        )
    }
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}

#[cfg(feature = "std")]
impl From<std::io::Error> for Error {
    fn from(_e: std::io::Error) -> Self {
        Self::new(ErrorCode::StdIoError)
    }
}

#[cfg(feature = "std")]
impl From<std::time::SystemTimeError> for Error {
    fn from(_e: std::time::SystemTimeError) -> Self {
        Self::new(ErrorCode::SysTimeFail)
    }
}

impl From<ccm::aead::Error> for Error {
    fn from(_e: ccm::aead::Error) -> Self {
        Self::new(ErrorCode::Crypto)
    }
}

impl From<hmac::digest::InvalidLength> for Error {
    fn from(_e: hmac::digest::InvalidLength) -> Self {
        Self::new(ErrorCode::InvalidKeyLength)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[cfg(not(all(feature = "std", feature = "backtrace")))]
        {
            write!(f, "{:?}", self.code())
        }

        #[cfg(all(feature = "std", feature = "backtrace"))]
        {
            writeln!(f, "{:?} at:\n{}", self.code(), self.backtrace())
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.code())
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
