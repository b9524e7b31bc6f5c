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

use log::{info, warn};

use crate::crypto::{SessionKeys, SYMM_KEY_LEN_BYTES};
use crate::error::{Error, ErrorCode};
use crate::utils::epoch::Epoch;
use crate::utils::rand::Rand;

use super::dedup::RxCtrState;
use super::exchange::{ExchangeHandler, ExchangeState, Role};
use super::network::Address;

cfg_if::cfg_if! {
    if #[cfg(feature = "max-sessions-64")] {
        pub const MAX_SESSIONS: usize = 64;
    } else {
        pub const MAX_SESSIONS: usize = 16;
    }
}

/// Maximum number of concurrent exchanges per session.
pub const MAX_EXCHANGES: usize = 5;

/// Message counters wrap within this range; a session whose send counter
/// exhausts it must be re-established.
pub const MSG_CTR_RANGE: u32 = 0x0fff_ffff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMode {
    /// A CASE session, scoped to a fabric and carrying the peer's CATs.
    Case { fab_idx: u8, cat_ids: [u32; 3] },
    /// A PASE session, established against an ephemeral commissioning peer.
    Pase,
    /// The unencrypted mode used while a handshake is in progress.
    PlainText,
}

impl SessionMode {
    pub fn fab_idx(&self) -> Option<u8> {
        match self {
            Self::Case { fab_idx, .. } => Some(*fab_idx),
            _ => None,
        }
    }
}

pub struct Session {
    /// Unique, never-reused internal id; exchanges refer to sessions
    /// through this rather than through table positions.
    id: u32,
    pub peer_addr: Address,
    pub local_nodeid: u64,
    pub peer_nodeid: Option<u64>,
    dec_key: [u8; SYMM_KEY_LEN_BYTES],
    enc_key: [u8; SYMM_KEY_LEN_BYTES],
    att_challenge: [u8; SYMM_KEY_LEN_BYTES],
    local_sess_id: u16,
    peer_sess_id: u16,
    msg_ctr: u32,
    rx_ctr_state: RxCtrState,
    mode: SessionMode,
    pub(crate) exchanges: heapless::Vec<Option<ExchangeState>, MAX_EXCHANGES>,
    last_use_ms: u64,
    expired: bool,
    reserved: bool,
}

impl Session {
    fn new(id: u32, peer_addr: Address, peer_nodeid: Option<u64>, rand: Rand, now_ms: u64) -> Self {
        let mut ctr = [0; 4];
        rand(&mut ctr);
        let msg_ctr = u32::from_le_bytes(ctr) % MSG_CTR_RANGE;

        Self {
            id,
            peer_addr,
            local_nodeid: 0,
            peer_nodeid,
            dec_key: [0; SYMM_KEY_LEN_BYTES],
            enc_key: [0; SYMM_KEY_LEN_BYTES],
            att_challenge: [0; SYMM_KEY_LEN_BYTES],
            local_sess_id: 0,
            peer_sess_id: 0,
            msg_ctr,
            rx_ctr_state: RxCtrState::new(0),
            mode: SessionMode::PlainText,
            exchanges: heapless::Vec::new(),
            last_use_ms: now_ms,
            expired: false,
            reserved: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn mode(&self) -> &SessionMode {
        &self.mode
    }

    pub fn local_sess_id(&self) -> u16 {
        self.local_sess_id
    }

    pub fn peer_sess_id(&self) -> u16 {
        self.peer_sess_id
    }

    pub fn is_encrypted(&self) -> bool {
        !matches!(self.mode, SessionMode::PlainText)
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved
    }

    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// Mark the session as defunct. It stops matching incoming traffic
    /// and becomes the preferred eviction candidate.
    pub fn expire(&mut self) {
        self.expired = true;
    }

    pub fn dec_key(&self) -> &[u8] {
        &self.dec_key
    }

    pub fn enc_key(&self) -> &[u8] {
        &self.enc_key
    }

    pub fn att_challenge(&self) -> &[u8] {
        &self.att_challenge
    }

    pub fn update_last_use(&mut self, now_ms: u64) {
        self.last_use_ms = now_ms;
    }

    /// Record an incoming counter; `false` means duplicate.
    pub fn post_recv_ctr(&mut self, ctr: u32) -> bool {
        self.rx_ctr_state.post_recv(ctr, self.is_encrypted())
    }

    /// Allocate the next send counter, erroring out when the session's
    /// range is exhausted.
    pub fn get_msg_ctr(&mut self) -> Result<u32, Error> {
        if self.msg_ctr >= MSG_CTR_RANGE {
            self.expired = true;
            Err(ErrorCode::MessageCounterExhausted)?;
        }

        let ctr = self.msg_ctr;
        self.msg_ctr += 1;
        Ok(ctr)
    }

    /// Find the slot of an exchange matching an incoming message.
    ///
    /// `peer_is_initiator` is the I flag of the incoming header: a peer
    /// initiator matches our responder exchanges and vice-versa.
    pub fn get_exch_idx(&self, exch_id: u16, peer_is_initiator: bool) -> Option<usize> {
        self.exchanges.iter().position(|exch| {
            exch.as_ref().is_some_and(|exch| {
                exch.exch_id == exch_id
                    && match exch.role {
                        Role::Responder => peer_is_initiator,
                        Role::Initiator => !peer_is_initiator,
                    }
            })
        })
    }

    pub fn add_exch(
        &mut self,
        exch_id: u16,
        role: Role,
        handler: ExchangeHandler,
    ) -> Result<usize, Error> {
        let state = ExchangeState::new(exch_id, role, handler);

        if let Some(idx) = self.exchanges.iter().position(Option::is_none) {
            self.exchanges[idx] = Some(state);
            Ok(idx)
        } else if self.exchanges.len() < MAX_EXCHANGES {
            self.exchanges
                .push(Some(state))
                .map_err(|_| Error::from(ErrorCode::NoSpaceExchanges))?;
            Ok(self.exchanges.len() - 1)
        } else {
            Err(ErrorCode::NoSpaceExchanges.into())
        }
    }

    pub fn exch(&self, idx: usize) -> Option<&ExchangeState> {
        self.exchanges.get(idx).and_then(Option::as_ref)
    }

    pub fn exch_mut(&mut self, idx: usize) -> Option<&mut ExchangeState> {
        self.exchanges.get_mut(idx).and_then(Option::as_mut)
    }

    pub fn remove_exch(&mut self, idx: usize) {
        if let Some(slot) = self.exchanges.get_mut(idx) {
            *slot = None;
        }
    }
}

impl Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "local: {} [0x{:x}], peer: {:?} [0x{:x}], mode: {:?}",
            self.local_sess_id, self.local_sess_id, self.peer_nodeid, self.peer_sess_id, self.mode
        )
    }
}

pub struct SessionMgr {
    sessions: heapless::Vec<Session, MAX_SESSIONS>,
    next_id: u32,
    next_sess_id: u16,
    next_exch_id: u16,
    pub epoch: Epoch,
    pub rand: Rand,
}

impl SessionMgr {
    pub fn new(epoch: Epoch, rand: Rand) -> Self {
        Self {
            sessions: heapless::Vec::new(),
            next_id: 1,
            next_sess_id: 1,
            next_exch_id: 0,
            epoch,
            rand,
        }
    }

    fn now_ms(&self) -> u64 {
        (self.epoch)().as_millis() as u64
    }

    /// Allocate a local session id not currently in use. Id 0 is reserved
    /// for unencrypted traffic.
    pub fn get_next_sess_id(&mut self) -> u16 {
        loop {
            let id = self.next_sess_id;
            self.next_sess_id = self.next_sess_id.wrapping_add(1);
            if self.next_sess_id == 0 {
                self.next_sess_id = 1;
            }

            if id != 0
                && !self
                    .sessions
                    .iter()
                    .any(|sess| sess.local_sess_id() == id)
            {
                return id;
            }
        }
    }

    pub fn get_next_exch_id(&mut self) -> u16 {
        loop {
            let id = self.next_exch_id;
            self.next_exch_id = self.next_exch_id.wrapping_add(1);

            if !self.sessions.iter().any(|sess| {
                sess.exchanges.iter().any(|exch| {
                    exch.as_ref()
                        .is_some_and(|exch| exch.exch_id == id && exch.role == Role::Initiator)
                })
            }) {
                return id;
            }
        }
    }

    /// Add an unencrypted session for a new handshake peer.
    pub fn add_plain(
        &mut self,
        peer_addr: Address,
        peer_nodeid: Option<u64>,
    ) -> Result<u32, Error> {
        self.ensure_space()?;

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);

        let now_ms = self.now_ms();
        let session = Session::new(id, peer_addr, peer_nodeid, self.rand, now_ms);
        self.sessions
            .push(session)
            .map_err(|_| Error::from(ErrorCode::NoSpaceSessions))?;

        Ok(id)
    }

    /// Reserve a session slot for an in-progress handshake. The slot does
    /// not match encrypted traffic until `complete_reserved` is called;
    /// dropping the handshake removes it without a trace.
    pub fn reserve(&mut self, peer_addr: Address) -> Result<u32, Error> {
        let id = self.add_plain(peer_addr, None)?;

        // Unwrap can't fail; the session was just added
        let session = self.get_mut(id).ok_or(ErrorCode::NoSession)?;
        session.reserved = true;
        Ok(id)
    }

    /// Install key material and identity into a reserved session.
    #[allow(clippy::too_many_arguments)]
    pub fn update_reserved(
        &mut self,
        id: u32,
        local_nodeid: u64,
        peer_nodeid: Option<u64>,
        local_sess_id: u16,
        peer_sess_id: u16,
        keys: &SessionKeys,
        mode: SessionMode,
    ) -> Result<(), Error> {
        let session = self
            .sessions
            .iter_mut()
            .find(|sess| sess.id == id && sess.reserved)
            .ok_or(ErrorCode::NoSession)?;

        session.local_nodeid = local_nodeid;
        session.peer_nodeid = peer_nodeid;
        session.local_sess_id = local_sess_id;
        session.peer_sess_id = peer_sess_id;
        session.dec_key = keys.dec_key;
        session.enc_key = keys.enc_key;
        session.att_challenge = keys.att_challenge;
        session.mode = mode;

        Ok(())
    }

    /// Atomically activate a reserved session. Before this call the
    /// session is invisible to encrypted traffic; a handshake that fails
    /// mid-way therefore installs nothing.
    pub fn complete_reserved(&mut self, id: u32) -> Result<(), Error> {
        let session = self
            .sessions
            .iter_mut()
            .find(|sess| sess.id == id && sess.reserved)
            .ok_or(ErrorCode::NoSession)?;

        if !matches!(session.mode, SessionMode::PlainText) {
            session.reserved = false;
            info!("New secure session: {}", session);
            Ok(())
        } else {
            // The handshake never installed keys
            Err(ErrorCode::InvalidState.into())
        }
    }

    pub fn remove(&mut self, id: u32) -> Option<Session> {
        let idx = self.sessions.iter().position(|sess| sess.id == id)?;
        Some(self.sessions.swap_remove(idx))
    }

    /// Remove all sessions scoped to a removed fabric, returning how many
    /// were dropped. The caller tears down their dependents first.
    pub fn remove_for_fabric(&mut self, fab_idx: u8) -> usize {
        let mut removed = 0;
        while let Some(idx) = self
            .sessions
            .iter()
            .position(|sess| sess.mode.fab_idx() == Some(fab_idx))
        {
            self.sessions.swap_remove(idx);
            removed += 1;
        }

        removed
    }

    pub fn get(&self, id: u32) -> Option<&Session> {
        self.sessions.iter().find(|sess| sess.id == id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|sess| sess.id == id)
    }

    /// Match an incoming packet to a session.
    pub fn get_for_rx(
        &mut self,
        peer_addr: &Address,
        sess_id: u16,
        peer_nodeid: Option<u64>,
    ) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|sess| {
            if sess.expired || sess.reserved {
                return false;
            }

            if sess_id != 0 {
                sess.local_sess_id() == sess_id
            } else {
                !sess.is_encrypted()
                    && sess.peer_addr == *peer_addr
                    && sess.peer_nodeid == peer_nodeid
            }
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }

    /// Make room for one more session, evicting if needed. Expired
    /// sessions go first, then the least recently used non-reserved one.
    fn ensure_space(&mut self) -> Result<(), Error> {
        if self.sessions.len() < MAX_SESSIONS {
            return Ok(());
        }

        let victim = self
            .sessions
            .iter()
            .enumerate()
            .filter(|(_, sess)| !sess.reserved)
            .min_by_key(|(_, sess)| (!sess.expired, sess.last_use_ms))
            .map(|(idx, _)| idx);

        if let Some(idx) = victim {
            let sess = self.sessions.swap_remove(idx);
            warn!("Evicting session: {}", sess);
            Ok(())
        } else {
            Err(ErrorCode::NoSpaceSessions.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::epoch::dummy_epoch;
    use crate::utils::rand::dummy_rand;

    fn mgr() -> SessionMgr {
        SessionMgr::new(dummy_epoch, dummy_rand)
    }

    #[test]
    fn next_sess_id_skips_in_use() {
        let mut mgr = mgr();

        let id = mgr.add_plain(Address::unspecified(), None).unwrap();
        let sess_id = mgr.get_next_sess_id();
        assert_eq!(sess_id, 1);
        mgr.get_mut(id).unwrap().local_sess_id = sess_id;

        assert_eq!(mgr.get_next_sess_id(), 2);

        // Overflow skips 0 and the in-use id 1
        mgr.next_sess_id = 65534;
        assert_eq!(mgr.get_next_sess_id(), 65534);
        assert_eq!(mgr.get_next_sess_id(), 65535);
        assert_eq!(mgr.get_next_sess_id(), 2);
    }

    #[test]
    fn reserved_session_is_invisible_until_completed() {
        let mut mgr = mgr();
        let id = mgr.reserve(Address::unspecified()).unwrap();

        let keys = SessionKeys::default();
        mgr.update_reserved(id, 1, Some(2), 10, 20, &keys, SessionMode::Pase)
            .unwrap();
        assert!(mgr
            .get_for_rx(&Address::unspecified(), 10, None)
            .is_none());

        mgr.complete_reserved(id).unwrap();
        assert!(mgr
            .get_for_rx(&Address::unspecified(), 10, None)
            .is_some());
    }

    #[test]
    fn incomplete_reservation_fails_to_activate() {
        let mut mgr = mgr();
        let id = mgr.reserve(Address::unspecified()).unwrap();
        // No keys were ever installed
        assert!(mgr.complete_reserved(id).is_err());
    }

    #[test]
    fn fabric_removal_drops_sessions() {
        let mut mgr = mgr();

        for fab_idx in [1, 1, 2] {
            let id = mgr.add_plain(Address::unspecified(), None).unwrap();
            mgr.get_mut(id).unwrap().mode = SessionMode::Case {
                fab_idx,
                cat_ids: [0; 3],
            };
        }

        assert_eq!(mgr.remove_for_fabric(1), 2);
        assert_eq!(mgr.iter().count(), 1);
    }

    #[test]
    fn eviction_prefers_expired() {
        let mut mgr = mgr();

        let mut ids = heapless::Vec::<u32, MAX_SESSIONS>::new();
        for _ in 0..MAX_SESSIONS {
            ids.push(mgr.add_plain(Address::unspecified(), None).unwrap())
                .unwrap();
        }

        mgr.get_mut(ids[3]).unwrap().expire();

        // Adding one more evicts the expired one, not the oldest
        mgr.add_plain(Address::unspecified(), None).unwrap();
        assert!(mgr.get(ids[3]).is_none());
        assert!(mgr.get(ids[0]).is_some());
    }

    #[test]
    fn msg_ctr_exhaustion() {
        let mut mgr = mgr();
        let id = mgr.add_plain(Address::unspecified(), None).unwrap();
        let sess = mgr.get_mut(id).unwrap();

        sess.msg_ctr = MSG_CTR_RANGE - 1;
        assert!(sess.get_msg_ctr().is_ok());
        assert_eq!(
            sess.get_msg_ctr().unwrap_err().code(),
            ErrorCode::MessageCounterExhausted
        );
        assert!(sess.is_expired());
    }
}
