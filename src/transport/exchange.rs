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

use crate::transport::mrp::ReliableMessage;

/// The role this node plays in an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// The owner an exchange's messages and terminal notifications are routed
/// to. A sum type so that dispatch is exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeHandler {
    /// Secure Channel protocol (PASE/CASE handshakes, status reports).
    SecureChannel,
    /// The server-side Interaction Model engine.
    Interaction,
    /// A client-side read/subscribe state machine, by table index.
    ReadClient(usize),
}

/// A stable handle for one exchange: the owning session's unique id in the
/// low 28 bits, the exchange slot in the high 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeId(u32);

impl ExchangeId {
    pub fn new(session_id: u32, exchange_index: usize) -> Self {
        Self(session_id | ((exchange_index as u32) << 28))
    }

    pub fn session_id(&self) -> u32 {
        self.0 & 0x0fff_ffff
    }

    pub fn exchange_index(&self) -> usize {
        (self.0 >> 28) as usize
    }
}

impl Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.session_id(), self.exchange_index())
    }
}

/// The state of one exchange, living in a slot of its session.
#[derive(Debug, Clone)]
pub struct ExchangeState {
    pub exch_id: u16,
    pub role: Role,
    pub handler: ExchangeHandler,
    pub mrp: ReliableMessage,
    /// Deadline (epoch ms) by which the handshake or response flow bound
    /// to this exchange must have completed.
    pub timeout_at_ms: Option<u64>,
    /// The handler is done with the exchange, but a reliable message is
    /// still in flight; the slot is freed once it is acknowledged.
    pub closing: bool,
}

impl ExchangeState {
    pub fn new(exch_id: u16, role: Role, handler: ExchangeHandler) -> Self {
        Self {
            exch_id,
            role,
            handler,
            mrp: ReliableMessage::new(),
            timeout_at_ms: None,
            closing: false,
        }
    }
}

/// What a protocol handler wants done with an exchange after processing
/// one incoming message. The response payload, if any, has already been
/// written into the supplied writebuf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgAction {
    /// Send the written payload and keep the exchange open.
    Respond(MessageMeta),
    /// Send the written payload and close the exchange afterwards.
    RespondAndClose(MessageMeta),
    /// Nothing to send yet; keep the exchange open (a standalone ack is
    /// produced by the reliability layer if one is owed).
    Wait,
    /// Nothing to send; close the exchange.
    Close,
}

/// Meta-data for an application message: protocol, opcode and whether it
/// is sent reliably.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageMeta {
    pub proto_id: u16,
    pub proto_opcode: u8,
    pub reliable: bool,
}

impl MessageMeta {
    pub const fn new(proto_id: u16, proto_opcode: u8, reliable: bool) -> Self {
        Self {
            proto_id,
            proto_opcode,
            reliable,
        }
    }

    pub const fn reliable(self, reliable: bool) -> Self {
        Self { reliable, ..self }
    }

    pub fn is_standalone_ack(&self) -> bool {
        self.proto_id == crate::sc::PROTO_ID_SECURE_CHANNEL
            && self.proto_opcode == crate::sc::OpCode::MRPStandAloneAck as u8
    }

    /// Opcodes which legitimately start a new, unsolicited exchange.
    pub fn is_new_exchange(&self) -> bool {
        if self.proto_id == crate::sc::PROTO_ID_SECURE_CHANNEL {
            matches!(
                self.proto_opcode,
                x if x == crate::sc::OpCode::PBKDFParamRequest as u8
                    || x == crate::sc::OpCode::CASESigma1 as u8
                    || x == crate::sc::OpCode::MRPStandAloneAck as u8
            )
        } else {
            self.proto_id == crate::im::PROTO_ID_INTERACTION_MODEL
        }
    }
}

impl Display for MessageMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}::{:02x}", self.proto_id, self.proto_opcode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_packing() {
        let id = ExchangeId::new(0x0123_4567, 5);
        assert_eq!(id.session_id(), 0x0123_4567);
        assert_eq!(id.exchange_index(), 5);
    }

    #[test]
    fn new_exchange_classification() {
        let pbkdf = MessageMeta::new(crate::sc::PROTO_ID_SECURE_CHANNEL, 0x20, true);
        assert!(pbkdf.is_new_exchange());

        let sigma2 = MessageMeta::new(crate::sc::PROTO_ID_SECURE_CHANNEL, 0x31, true);
        assert!(!sigma2.is_new_exchange());

        let read = MessageMeta::new(crate::im::PROTO_ID_INTERACTION_MODEL, 2, true);
        assert!(read.is_new_exchange());

        let ack = MessageMeta::new(crate::sc::PROTO_ID_SECURE_CHANNEL, 0x10, false);
        assert!(ack.is_standalone_ack());
    }
}
