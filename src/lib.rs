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

//! Session, exchange and Interaction Model core for the Matter protocol.
//!
//! The crate covers the layers between the raw datagram transport and the
//! application data model:
//! - the message layer: plain/proto headers, AES-CCM protection, counters
//!   and duplicate detection ([`transport`]);
//! - exchanges with MRP reliability (acknowledgements, retransmission with
//!   multiplicative backoff);
//! - session establishment: the PASE and CASE responder state machines and
//!   the CASE resumption cache ([`sc`]);
//! - the Interaction Model: a server-side engine serving chunked reads,
//!   subscriptions, writes, timed and batch invokes against a pluggable
//!   [`dm::DataModelProvider`], plus a client-side read/subscribe state
//!   machine ([`im`]).
//!
//! Everything is tied together by [`stack::Stack`], an explicit context
//! object with no global state: the embedder feeds it received datagrams
//! and a clock, and sends out whatever packets it produces. Time and
//! randomness are injected ([`utils::epoch::Epoch`], [`utils::rand::Rand`]),
//! so the whole stack runs deterministically under test.
//!
//! Cryptographic session establishment math (SPAKE2+, Sigma certificate
//! validation) sits behind the [`crypto::PakeEngine`] and
//! [`crypto::SigmaEngine`] traits.

#![cfg_attr(not(feature = "std"), no_std)]

pub mod crypto;
pub mod dm;
pub mod error;
pub mod im;
pub mod persist;
pub mod sc;
pub mod stack;
pub mod tlv;
pub mod transport;
pub mod utils;

pub use error::{Error, ErrorCode};
pub use stack::{Stack, StackConfig};
