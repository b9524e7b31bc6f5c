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

//! The PASE (passcode-authenticated session establishment) responder.
//!
//! A sum-type state machine driven by incoming Secure Channel messages:
//! `Idle -> AwaitingPake1 -> AwaitingPake3 -> Idle`. The session slot is
//! reserved up front, but only a fully verified handshake activates it;
//! every failure path removes the reservation before reporting the error
//! to the peer.

use log::{error, info, warn};

use crate::crypto::{PakeEngine, EC_POINT_LEN_BYTES, SHA256_HASH_LEN_BYTES};
use crate::error::{Error, ErrorCode};
use crate::sc::{sc_write, OpCode, SCStatusCode, BUSY_WAIT_HINT_MS};
use crate::tlv::{TLVElement, TLVTag, TLVWriter};
use crate::transport::exchange::{ExchangeId, MsgAction};
use crate::transport::network::Address;
use crate::transport::session::{SessionMgr, SessionMode};
use crate::utils::writebuf::WriteBuf;

/// As per the Matter spec, a handshake must complete within this window.
pub const PASE_SESSION_EST_TIMEOUT_SECS: u64 = 60;

const MAX_SALT_LEN: usize = 32;

/// An open commissioning window: the PBKDF parameters the verifier was
/// provisioned with.
struct CommWindow {
    iter_count: u32,
    salt: heapless::Vec<u8, MAX_SALT_LEN>,
}

struct Handshake {
    exch: ExchangeId,
    /// The reserved (not yet active) session.
    reservation: u32,
    local_sess_id: u16,
    peer_sess_id: u16,
    timeout_at_ms: u64,
}

enum PaseState {
    Idle,
    AwaitingPake1(Handshake),
    AwaitingPake3(Handshake),
}

pub struct PaseMgr<E> {
    engine: E,
    window: Option<CommWindow>,
    state: PaseState,
}

impl<E: PakeEngine> PaseMgr<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            window: None,
            state: PaseState::Idle,
        }
    }

    /// Open the commissioning window with the given PBKDF parameters.
    pub fn open_window(&mut self, iter_count: u32, salt: &[u8]) -> Result<(), Error> {
        let salt = heapless::Vec::from_slice(salt).map_err(|_| Error::from(ErrorCode::NoSpace))?;
        self.window = Some(CommWindow { iter_count, salt });
        info!("PASE: commissioning window opened");
        Ok(())
    }

    pub fn close_window(&mut self, sessions: &mut SessionMgr) {
        self.window = None;
        self.abort(sessions);
    }

    pub fn is_window_open(&self) -> bool {
        self.window.is_some()
    }

    /// The exchange of the in-progress handshake, if any.
    pub fn pending_exchange(&self) -> Option<ExchangeId> {
        match &self.state {
            PaseState::Idle => None,
            PaseState::AwaitingPake1(hs) | PaseState::AwaitingPake3(hs) => Some(hs.exch),
        }
    }

    /// Abort the in-progress handshake, removing the session reservation.
    pub fn abort(&mut self, sessions: &mut SessionMgr) {
        if let PaseState::AwaitingPake1(hs) | PaseState::AwaitingPake3(hs) =
            core::mem::replace(&mut self.state, PaseState::Idle)
        {
            warn!("PASE: handshake aborted");
            sessions.remove(hs.reservation);
            self.engine.reset();
        }
    }

    /// Abort if the in-progress handshake rides on the given session.
    pub fn abort_for_session(&mut self, sess_id: u32, sessions: &mut SessionMgr) {
        if self
            .pending_exchange()
            .is_some_and(|exch| exch.session_id() == sess_id)
        {
            self.abort(sessions);
        }
    }

    /// Expire a handshake that exceeded the establishment timeout,
    /// returning the exchange the stack should close.
    pub fn check_timeout(&mut self, sessions: &mut SessionMgr, now_ms: u64) -> Option<ExchangeId> {
        let expired = match &self.state {
            PaseState::AwaitingPake1(hs) | PaseState::AwaitingPake3(hs) => {
                (hs.timeout_at_ms <= now_ms).then_some(hs.exch)
            }
            PaseState::Idle => None,
        };

        if expired.is_some() {
            error!("PASE: session establishment timed out");
            self.abort(sessions);
        }

        expired
    }

    /// Process one Secure Channel message addressed to the PASE protocol.
    pub fn handle(
        &mut self,
        sessions: &mut SessionMgr,
        exch: ExchangeId,
        peer_addr: Address,
        opcode: OpCode,
        payload: &[u8],
        wb: &mut WriteBuf,
    ) -> Result<MsgAction, Error> {
        match opcode {
            OpCode::PBKDFParamRequest => self.handle_pbkdf_param_request(
                sessions, exch, peer_addr, payload, wb,
            ),
            OpCode::PASEPake1 => self.handle_pake1(sessions, exch, payload, wb),
            OpCode::PASEPake3 => self.handle_pake3(sessions, exch, payload, wb),
            _ => {
                error!("PASE: unexpected opcode {:?}", opcode);
                self.fail(sessions, wb)
            }
        }
    }

    fn handle_pbkdf_param_request(
        &mut self,
        sessions: &mut SessionMgr,
        exch: ExchangeId,
        peer_addr: Address,
        payload: &[u8],
        wb: &mut WriteBuf,
    ) -> Result<MsgAction, Error> {
        let Some(window) = self.window.as_ref() else {
            warn!("PASE: no commissioning window open");
            return Ok(MsgAction::RespondAndClose(sc_write(
                wb,
                SCStatusCode::SessionNotFound,
                &[],
            )?));
        };

        if !matches!(self.state, PaseState::Idle) {
            warn!("PASE: handshake already in progress, returning busy");
            return Ok(MsgAction::RespondAndClose(sc_write(
                wb,
                SCStatusCode::Busy,
                &BUSY_WAIT_HINT_MS.to_le_bytes(),
            )?));
        }

        let req = TLVElement::root(payload)?;
        let initiator_random = req.find_ctx(1)?.str()?;
        let peer_sess_id = req.find_ctx(2)?.u16()?;
        let passcode_id = req.find_ctx(3)?.u16()?;
        let has_params = req.find_ctx(4)?.bool()?;

        if passcode_id != 0 {
            error!("PASE: non-zero passcode id {}", passcode_id);
            return self.fail(sessions, wb);
        }

        let reservation = sessions.reserve(peer_addr)?;
        let local_sess_id = sessions.get_next_sess_id();

        let mut responder_random = [0; 32];
        (sessions.rand)(&mut responder_random);

        {
            let mut tw = TLVWriter::new(wb);
            tw.start_struct(&TLVTag::Anonymous)?;
            tw.str(&TLVTag::Context(1), initiator_random)?;
            tw.str(&TLVTag::Context(2), &responder_random)?;
            tw.u16(&TLVTag::Context(3), local_sess_id)?;
            if !has_params {
                tw.start_struct(&TLVTag::Context(4))?;
                tw.u32(&TLVTag::Context(1), window.iter_count)?;
                tw.str(&TLVTag::Context(2), &window.salt)?;
                tw.end_container()?;
            }
            tw.end_container()?;
        }

        self.engine.reset();
        self.engine.set_context(payload, wb.as_slice())?;

        let now_ms = (sessions.epoch)().as_millis() as u64;
        self.state = PaseState::AwaitingPake1(Handshake {
            exch,
            reservation,
            local_sess_id,
            peer_sess_id,
            timeout_at_ms: now_ms + PASE_SESSION_EST_TIMEOUT_SECS * 1000,
        });

        Ok(MsgAction::Respond(OpCode::PBKDFParamResponse.meta()))
    }

    fn handle_pake1(
        &mut self,
        sessions: &mut SessionMgr,
        exch: ExchangeId,
        payload: &[u8],
        wb: &mut WriteBuf,
    ) -> Result<MsgAction, Error> {
        // An out-of-order or foreign-exchange message aborts the whole
        // handshake; the state goes back so the abort can release the
        // reservation it holds
        let hs = match core::mem::replace(&mut self.state, PaseState::Idle) {
            PaseState::AwaitingPake1(hs) if hs.exch == exch => hs,
            other => {
                error!("PASE: unexpected Pake1");
                self.state = other;
                return self.fail(sessions, wb);
            }
        };

        let pa = TLVElement::root(payload)?.find_ctx(1)?.str()?;

        let mut pb = [0; EC_POINT_LEN_BYTES];
        let mut cb = [0; SHA256_HASH_LEN_BYTES];
        match self.engine.handle_pa(pa, &mut pb, &mut cb) {
            Ok(()) => {
                let mut tw = TLVWriter::new(wb);
                tw.start_struct(&TLVTag::Anonymous)?;
                tw.str(&TLVTag::Context(1), &pb)?;
                tw.str(&TLVTag::Context(2), &cb)?;
                tw.end_container()?;

                self.state = PaseState::AwaitingPake3(hs);
                Ok(MsgAction::Respond(OpCode::PASEPake2.meta()))
            }
            Err(e) => {
                error!("PASE: pA verification failed: {}", e);
                sessions.remove(hs.reservation);
                self.fail(sessions, wb)
            }
        }
    }

    fn handle_pake3(
        &mut self,
        sessions: &mut SessionMgr,
        exch: ExchangeId,
        payload: &[u8],
        wb: &mut WriteBuf,
    ) -> Result<MsgAction, Error> {
        let hs = match core::mem::replace(&mut self.state, PaseState::Idle) {
            PaseState::AwaitingPake3(hs) if hs.exch == exch => hs,
            other => {
                error!("PASE: unexpected Pake3");
                self.state = other;
                return self.fail(sessions, wb);
            }
        };

        let ca = TLVElement::root(payload)?.find_ctx(1)?.str()?;

        match self.engine.handle_ca(ca) {
            Ok(keys) => {
                sessions.update_reserved(
                    hs.reservation,
                    0,
                    None,
                    hs.local_sess_id,
                    hs.peer_sess_id,
                    &keys,
                    SessionMode::Pase,
                )?;
                // Activate before the success report goes out, so the very
                // next encrypted message from the peer finds the session
                sessions.complete_reserved(hs.reservation)?;
                self.engine.reset();

                info!("PASE: session established, local id {}", hs.local_sess_id);
                Ok(MsgAction::RespondAndClose(sc_write(
                    wb,
                    SCStatusCode::SessionEstablishmentSuccess,
                    &[],
                )?))
            }
            Err(e) => {
                error!("PASE: cA verification failed: {}", e);
                sessions.remove(hs.reservation);
                self.fail(sessions, wb)
            }
        }
    }

    /// Terminal failure: reset the machine and report InvalidParameter.
    fn fail(&mut self, sessions: &mut SessionMgr, wb: &mut WriteBuf) -> Result<MsgAction, Error> {
        self.abort(sessions);
        Ok(MsgAction::RespondAndClose(sc_write(
            wb,
            SCStatusCode::InvalidParameter,
            &[],
        )?))
    }
}
