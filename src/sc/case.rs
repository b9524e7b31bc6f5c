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

//! The CASE (certificate-authenticated session establishment) responder.
//!
//! Two paths through the machine: the full Sigma1/2/3 certificate exchange,
//! and the short Sigma1/Sigma2Resume path when the initiator proves
//! possession of a cached shared secret. Either way the session slot is
//! reserved up front and only activated once the peer is fully verified.

use log::{error, info, warn};

use crate::crypto::{CasePeer, SigmaEngine, EC_POINT_LEN_BYTES, SYMM_KEY_LEN_BYTES};
use crate::error::{Error, ErrorCode};
use crate::sc::resume::{
    derive_resumed_keys, sigma1_resume_mic, sigma2_resume_mic, ResumptionCache,
    RESUMPTION_ID_LEN,
};
use crate::sc::{
    sc_write, GeneralCode, OpCode, SCStatusCode, BUSY_WAIT_HINT_MS, PROTO_ID_SECURE_CHANNEL,
};
use crate::tlv::{TLVElement, TLVTag, TLVWriter};
use crate::transport::exchange::{ExchangeId, MsgAction};
use crate::transport::network::Address;
use crate::transport::session::{SessionMgr, SessionMode};
use crate::utils::writebuf::WriteBuf;

/// As per the Matter spec, a handshake must complete within this window.
pub const CASE_SESSION_EST_TIMEOUT_SECS: u64 = 60;

/// Upper bound on the encrypted certificate proof carried in Sigma2.
const SIGMA2_PROOF_MAX_LEN: usize = 1024;

struct Handshake {
    exch: ExchangeId,
    /// The reserved (not yet active) session.
    reservation: u32,
    local_sess_id: u16,
    peer_sess_id: u16,
    timeout_at_ms: u64,
}

/// What a resumed handshake still has to commit once the initiator
/// acknowledges with a success status.
struct PendingResumption {
    new_resumption_id: [u8; RESUMPTION_ID_LEN],
    shared_secret: [u8; 32],
    peer: CasePeer,
}

enum CaseState {
    Idle,
    /// Full path: Sigma2 sent, waiting for Sigma3.
    AwaitingSigma3(Handshake),
    /// Resume path: Sigma2Resume sent, waiting for the initiator's
    /// success status report.
    AwaitingSuccess(Handshake, PendingResumption),
}

pub struct CaseMgr<E> {
    engine: E,
    state: CaseState,
}

impl<E: SigmaEngine> CaseMgr<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            state: CaseState::Idle,
        }
    }

    /// The exchange of the in-progress handshake, if any.
    pub fn pending_exchange(&self) -> Option<ExchangeId> {
        match &self.state {
            CaseState::Idle => None,
            CaseState::AwaitingSigma3(hs) | CaseState::AwaitingSuccess(hs, _) => Some(hs.exch),
        }
    }

    /// Abort the in-progress handshake, removing the session reservation.
    pub fn abort(&mut self, sessions: &mut SessionMgr) {
        if let CaseState::AwaitingSigma3(hs) | CaseState::AwaitingSuccess(hs, _) =
            core::mem::replace(&mut self.state, CaseState::Idle)
        {
            warn!("CASE: handshake aborted");
            sessions.remove(hs.reservation);
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
            CaseState::AwaitingSigma3(hs) | CaseState::AwaitingSuccess(hs, _) => {
                (hs.timeout_at_ms <= now_ms).then_some(hs.exch)
            }
            CaseState::Idle => None,
        };

        if expired.is_some() {
            error!("CASE: session establishment timed out");
            self.abort(sessions);
        }

        expired
    }

    /// Process one Secure Channel message addressed to the CASE protocol.
    #[allow(clippy::too_many_arguments)]
    pub fn handle(
        &mut self,
        sessions: &mut SessionMgr,
        cache: &mut ResumptionCache,
        exch: ExchangeId,
        peer_addr: Address,
        opcode: OpCode,
        payload: &[u8],
        wb: &mut WriteBuf,
    ) -> Result<MsgAction, Error> {
        match opcode {
            OpCode::CASESigma1 => self.handle_sigma1(sessions, cache, exch, peer_addr, payload, wb),
            OpCode::CASESigma3 => self.handle_sigma3(sessions, cache, exch, payload, wb),
            OpCode::StatusReport => self.handle_status_report(sessions, cache, exch, payload),
            _ => {
                error!("CASE: unexpected opcode {:?}", opcode);
                self.fail(sessions, wb, SCStatusCode::InvalidParameter)
            }
        }
    }

    fn handle_sigma1(
        &mut self,
        sessions: &mut SessionMgr,
        cache: &mut ResumptionCache,
        exch: ExchangeId,
        peer_addr: Address,
        payload: &[u8],
        wb: &mut WriteBuf,
    ) -> Result<MsgAction, Error> {
        if !matches!(self.state, CaseState::Idle) {
            warn!("CASE: handshake already in progress, returning busy");
            return Ok(MsgAction::RespondAndClose(sc_write(
                wb,
                SCStatusCode::Busy,
                &BUSY_WAIT_HINT_MS.to_le_bytes(),
            )?));
        }

        let sigma1 = TLVElement::root(payload)?;
        let initiator_random = sigma1.find_ctx(1)?.str()?;
        let peer_sess_id = sigma1.find_ctx(2)?.u16()?;
        if initiator_random.len() != 32 {
            error!("CASE: malformed initiator random");
            return self.fail(sessions, wb, SCStatusCode::InvalidParameter);
        }

        // An initiator holding a cached secret proves it with tags 6/7;
        // a stale or invalid claim silently falls back to the full path
        let resumption = match (sigma1.find_ctx_opt(6)?, sigma1.find_ctx_opt(7)?) {
            (Some(id), Some(mic)) => self.match_resumption(
                cache,
                initiator_random,
                id.str()?,
                mic.str()?,
                sessions,
            ),
            _ => None,
        };

        let reservation = sessions.reserve(peer_addr)?;
        let local_sess_id = sessions.get_next_sess_id();
        let now_ms = (sessions.epoch)().as_millis() as u64;

        let hs = Handshake {
            exch,
            reservation,
            local_sess_id,
            peer_sess_id,
            timeout_at_ms: now_ms + CASE_SESSION_EST_TIMEOUT_SECS * 1000,
        };

        if let Some((shared_secret, peer)) = resumption {
            self.start_resumed(sessions, hs, initiator_random, shared_secret, peer, wb)
        } else {
            self.start_full(sessions, hs, &sigma1, wb)
        }
    }

    /// Validate a resumption claim against the cache. A failed MIC means
    /// the secret went stale on one side; that is not an error, the full
    /// path simply applies.
    fn match_resumption(
        &self,
        cache: &mut ResumptionCache,
        initiator_random: &[u8],
        resumption_id: &[u8],
        claimed_mic: &[u8],
        sessions: &SessionMgr,
    ) -> Option<([u8; 32], CasePeer)> {
        let now_ms = (sessions.epoch)().as_millis() as u64;
        let rec = cache.get(resumption_id, now_ms)?;

        let mut mic = [0; SYMM_KEY_LEN_BYTES];
        sigma1_resume_mic(&rec.shared_secret, initiator_random, resumption_id, &mut mic).ok()?;

        if mic == claimed_mic {
            Some((rec.shared_secret, rec.peer))
        } else {
            warn!("CASE: resumption MIC mismatch, falling back to full handshake");
            None
        }
    }

    fn start_full(
        &mut self,
        sessions: &mut SessionMgr,
        hs: Handshake,
        sigma1: &TLVElement,
        wb: &mut WriteBuf,
    ) -> Result<MsgAction, Error> {
        let mut resp_rand = [0; 32];
        (sessions.rand)(&mut resp_rand);

        let mut eph_pub = [0; EC_POINT_LEN_BYTES];
        let mut proof = [0; SIGMA2_PROOF_MAX_LEN];
        let proof_len =
            match self
                .engine
                .build_sigma2(sigma1, &resp_rand, &mut eph_pub, &mut proof)
            {
                Ok(len) => len,
                Err(e) => {
                    error!("CASE: Sigma1 rejected: {}", e);
                    sessions.remove(hs.reservation);
                    let status = if e.code() == ErrorCode::NotFound {
                        SCStatusCode::NoSharedTrustRoots
                    } else {
                        SCStatusCode::InvalidParameter
                    };
                    return self.fail(sessions, wb, status);
                }
            };

        let mut tw = TLVWriter::new(wb);
        tw.start_struct(&TLVTag::Anonymous)?;
        tw.str(&TLVTag::Context(1), &resp_rand)?;
        tw.u16(&TLVTag::Context(2), hs.local_sess_id)?;
        tw.str(&TLVTag::Context(3), &eph_pub)?;
        tw.str(&TLVTag::Context(4), &proof[..proof_len])?;
        tw.end_container()?;

        self.state = CaseState::AwaitingSigma3(hs);
        Ok(MsgAction::Respond(OpCode::CASESigma2.meta()))
    }

    fn start_resumed(
        &mut self,
        sessions: &mut SessionMgr,
        hs: Handshake,
        initiator_random: &[u8],
        shared_secret: [u8; 32],
        peer: CasePeer,
        wb: &mut WriteBuf,
    ) -> Result<MsgAction, Error> {
        let mut new_resumption_id = [0; RESUMPTION_ID_LEN];
        (sessions.rand)(&mut new_resumption_id);

        let keys = derive_resumed_keys(&shared_secret, initiator_random, &new_resumption_id)?;
        let mut mic = [0; SYMM_KEY_LEN_BYTES];
        sigma2_resume_mic(&shared_secret, initiator_random, &new_resumption_id, &mut mic)?;

        sessions.update_reserved(
            hs.reservation,
            0,
            Some(peer.node_id),
            hs.local_sess_id,
            hs.peer_sess_id,
            &keys,
            SessionMode::Case {
                fab_idx: peer.fab_idx,
                cat_ids: peer.cat_ids,
            },
        )?;

        let mut tw = TLVWriter::new(wb);
        tw.start_struct(&TLVTag::Anonymous)?;
        tw.str(&TLVTag::Context(1), &new_resumption_id)?;
        tw.str(&TLVTag::Context(2), &mic)?;
        tw.u16(&TLVTag::Context(3), hs.local_sess_id)?;
        tw.end_container()?;

        info!("CASE: resuming session for fabric {}", peer.fab_idx);
        self.state = CaseState::AwaitingSuccess(
            hs,
            PendingResumption {
                new_resumption_id,
                shared_secret,
                peer,
            },
        );

        Ok(MsgAction::Respond(OpCode::CASESigma2Resume.meta()))
    }

    fn handle_sigma3(
        &mut self,
        sessions: &mut SessionMgr,
        cache: &mut ResumptionCache,
        exch: ExchangeId,
        payload: &[u8],
        wb: &mut WriteBuf,
    ) -> Result<MsgAction, Error> {
        // An out-of-order or foreign-exchange message aborts the whole
        // handshake; the state goes back so the abort can release the
        // reservation it holds
        let hs = match core::mem::replace(&mut self.state, CaseState::Idle) {
            CaseState::AwaitingSigma3(hs) if hs.exch == exch => hs,
            other => {
                error!("CASE: unexpected Sigma3");
                self.state = other;
                return self.fail(sessions, wb, SCStatusCode::InvalidParameter);
            }
        };

        let sigma3 = TLVElement::root(payload)?;
        match self.engine.handle_sigma3(&sigma3) {
            Ok(outcome) => {
                sessions.update_reserved(
                    hs.reservation,
                    0,
                    Some(outcome.peer.node_id),
                    hs.local_sess_id,
                    hs.peer_sess_id,
                    &outcome.keys,
                    SessionMode::Case {
                        fab_idx: outcome.peer.fab_idx,
                        cat_ids: outcome.peer.cat_ids,
                    },
                )?;
                // Activate before the success report goes out, so the very
                // next encrypted message from the peer finds the session
                sessions.complete_reserved(hs.reservation)?;

                let mut resumption_id = [0; RESUMPTION_ID_LEN];
                (sessions.rand)(&mut resumption_id);
                let now_ms = (sessions.epoch)().as_millis() as u64;
                cache.add(resumption_id, outcome.shared_secret, outcome.peer, now_ms);

                info!("CASE: session established, local id {}", hs.local_sess_id);
                Ok(MsgAction::RespondAndClose(sc_write(
                    wb,
                    SCStatusCode::SessionEstablishmentSuccess,
                    &[],
                )?))
            }
            Err(e) => {
                error!("CASE: Sigma3 verification failed: {}", e);
                sessions.remove(hs.reservation);
                let status = if e.code() == ErrorCode::NotFound {
                    SCStatusCode::NoSharedTrustRoots
                } else {
                    SCStatusCode::InvalidParameter
                };
                self.fail(sessions, wb, status)
            }
        }
    }

    /// The initiator's verdict on a Sigma2Resume. Only a success report
    /// activates the resumed session.
    fn handle_status_report(
        &mut self,
        sessions: &mut SessionMgr,
        cache: &mut ResumptionCache,
        exch: ExchangeId,
        payload: &[u8],
    ) -> Result<MsgAction, Error> {
        let (hs, pending) = match core::mem::replace(&mut self.state, CaseState::Idle) {
            CaseState::AwaitingSuccess(hs, pending) if hs.exch == exch => (hs, pending),
            other => {
                // A failure verdict during the full path, or a stray
                // report; the handshake (and its reservation) is over
                self.state = other;
                self.abort(sessions);
                return Ok(MsgAction::Close);
            }
        };

        if !is_success_report(payload) {
            warn!("CASE: resumption not confirmed by the initiator");
            sessions.remove(hs.reservation);
            return Ok(MsgAction::Close);
        }

        sessions.complete_reserved(hs.reservation)?;

        let now_ms = (sessions.epoch)().as_millis() as u64;
        cache.add(
            pending.new_resumption_id,
            pending.shared_secret,
            pending.peer,
            now_ms,
        );

        info!("CASE: resumed session active, local id {}", hs.local_sess_id);
        Ok(MsgAction::Close)
    }

    /// Terminal failure: reset the machine and report the given status.
    fn fail(
        &mut self,
        sessions: &mut SessionMgr,
        wb: &mut WriteBuf,
        status: SCStatusCode,
    ) -> Result<MsgAction, Error> {
        self.abort(sessions);
        Ok(MsgAction::RespondAndClose(sc_write(wb, status, &[])?))
    }
}

fn is_success_report(payload: &[u8]) -> bool {
    payload.len() >= 8
        && payload[..2] == (GeneralCode::Success as u16).to_le_bytes()
        && payload[2..6] == (PROTO_ID_SECURE_CHANNEL as u32).to_le_bytes()
        && payload[6..8] == (SCStatusCode::SessionEstablishmentSuccess as u16).to_le_bytes()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::{CaseOutcome, SessionKeys};
    use crate::utils::epoch::dummy_epoch;
    use crate::utils::parsebuf::ParseBuf;
    use crate::utils::rand::dummy_rand;
    use crate::sc::StatusReport;

    /// A deterministic stand-in for the Sigma certificate math.
    pub(crate) struct FakeSigma {
        pub fail_sigma1: bool,
        pub fail_sigma3: bool,
    }

    impl FakeSigma {
        pub fn good() -> Self {
            Self {
                fail_sigma1: false,
                fail_sigma3: false,
            }
        }

        fn peer() -> CasePeer {
            CasePeer {
                fab_idx: 1,
                node_id: 0x1122,
                cat_ids: [0; 3],
            }
        }
    }

    impl SigmaEngine for FakeSigma {
        fn build_sigma2(
            &mut self,
            sigma1: &TLVElement,
            _resp_rand: &[u8; 32],
            eph_pub: &mut [u8; EC_POINT_LEN_BYTES],
            proof_buf: &mut [u8],
        ) -> Result<usize, Error> {
            if self.fail_sigma1 {
                Err(ErrorCode::NotFound)?;
            }
            // A real engine consumes the initiator's ephemeral key
            sigma1.find_ctx(4)?.str()?;
            eph_pub.fill(0xee);
            proof_buf[..4].copy_from_slice(b"cert");
            Ok(4)
        }

        fn handle_sigma3(&mut self, _sigma3: &TLVElement) -> Result<CaseOutcome, Error> {
            if self.fail_sigma3 {
                Err(ErrorCode::NotFound)?;
            }
            Ok(CaseOutcome {
                peer: Self::peer(),
                keys: SessionKeys {
                    dec_key: [1; 16],
                    enc_key: [2; 16],
                    att_challenge: [3; 16],
                },
                shared_secret: [0x55; 32],
            })
        }
    }

    struct Fixture {
        sessions: SessionMgr,
        cache: ResumptionCache,
        case: CaseMgr<FakeSigma>,
        exch: ExchangeId,
    }

    fn fixture(engine: FakeSigma) -> Fixture {
        let mut sessions = SessionMgr::new(dummy_epoch, dummy_rand);
        let plain = sessions.add_plain(Address::unspecified(), None).unwrap();

        Fixture {
            sessions,
            cache: ResumptionCache::new(),
            case: CaseMgr::new(engine),
            exch: ExchangeId::new(plain, 0),
        }
    }

    impl Fixture {
        fn handle(
            &mut self,
            opcode: OpCode,
            payload: &[u8],
            resp: &mut [u8],
        ) -> (MsgAction, usize) {
            let mut wb = WriteBuf::new(resp);
            let action = self
                .case
                .handle(
                    &mut self.sessions,
                    &mut self.cache,
                    self.exch,
                    Address::unspecified(),
                    opcode,
                    payload,
                    &mut wb,
                )
                .unwrap();
            let len = wb.as_slice().len();
            (action, len)
        }

        fn active_sessions(&self) -> usize {
            self.sessions
                .iter()
                .filter(|sess| sess.is_encrypted() && !sess.is_reserved())
                .count()
        }
    }

    fn sigma1(buf: &mut [u8], resumption: Option<(&[u8; 16], &[u8; 16])>) -> usize {
        let mut wb = WriteBuf::new(buf);
        let mut tw = TLVWriter::new(&mut wb);
        tw.start_struct(&TLVTag::Anonymous).unwrap();
        tw.str(&TLVTag::Context(1), &[0x11; 32]).unwrap();
        tw.u16(&TLVTag::Context(2), 0x7002).unwrap();
        tw.str(&TLVTag::Context(3), &[0x33; 32]).unwrap();
        tw.str(&TLVTag::Context(4), &[0x44; EC_POINT_LEN_BYTES]).unwrap();
        if let Some((id, mic)) = resumption {
            tw.str(&TLVTag::Context(6), id).unwrap();
            tw.str(&TLVTag::Context(7), mic).unwrap();
        }
        tw.end_container().unwrap();
        wb.as_slice().len()
    }

    fn sigma3(buf: &mut [u8]) -> usize {
        let mut wb = WriteBuf::new(buf);
        let mut tw = TLVWriter::new(&mut wb);
        tw.start_struct(&TLVTag::Anonymous).unwrap();
        tw.str(&TLVTag::Context(1), b"encrypted3").unwrap();
        tw.end_container().unwrap();
        wb.as_slice().len()
    }

    fn success_report(buf: &mut [u8]) -> usize {
        let mut wb = WriteBuf::new(buf);
        sc_write(&mut wb, SCStatusCode::SessionEstablishmentSuccess, &[]).unwrap();
        wb.as_slice().len()
    }

    #[test]
    fn full_handshake_installs_session_and_resumption() {
        let mut f = fixture(FakeSigma::good());
        let mut msg = [0; 256];
        let mut resp = [0; 1536];

        let len = sigma1(&mut msg, None);
        let (action, resp_len) = f.handle(OpCode::CASESigma1, &msg[..len], &mut resp);
        assert!(matches!(action, MsgAction::Respond(meta)
            if meta.proto_opcode == OpCode::CASESigma2 as u8));
        assert_eq!(f.active_sessions(), 0);

        // Sigma2 carries our session id and the engine's proof
        let sigma2 = TLVElement::root(&resp[..resp_len]).unwrap();
        let resp_sess_id = sigma2.find_ctx(2).unwrap().u16().unwrap();
        assert_eq!(sigma2.find_ctx(4).unwrap().str().unwrap(), b"cert");

        let len = sigma3(&mut msg);
        let (action, resp_len) = f.handle(OpCode::CASESigma3, &msg[..len], &mut resp);
        let MsgAction::RespondAndClose(meta) = action else {
            panic!("expected a terminal response");
        };
        assert_eq!(meta.proto_opcode, OpCode::StatusReport as u8);

        let mut report = resp[..resp_len].to_vec();
        let mut pb = ParseBuf::new(&mut report);
        assert!(StatusReport::read(&mut pb).unwrap().is_sc_success());

        assert_eq!(f.active_sessions(), 1);
        assert_eq!(f.cache.len(), 1);

        let sess = f
            .sessions
            .iter()
            .find(|sess| sess.local_sess_id() == resp_sess_id)
            .unwrap();
        assert_eq!(sess.peer_nodeid, Some(0x1122));
        assert_eq!(sess.mode().fab_idx(), Some(1));
    }

    #[test]
    fn sigma1_rejection_reports_no_trust_roots() {
        let mut f = fixture(FakeSigma {
            fail_sigma1: true,
            fail_sigma3: false,
        });
        let mut msg = [0; 256];
        let mut resp = [0; 1536];

        let len = sigma1(&mut msg, None);
        let (action, resp_len) = f.handle(OpCode::CASESigma1, &msg[..len], &mut resp);
        assert!(matches!(action, MsgAction::RespondAndClose(_)));

        let mut report = resp[..resp_len].to_vec();
        let mut pb = ParseBuf::new(&mut report);
        let report = StatusReport::read(&mut pb).unwrap();
        assert_eq!(
            report.proto_code,
            SCStatusCode::NoSharedTrustRoots as u16
        );

        assert_eq!(f.active_sessions(), 0);
        assert!(f.sessions.iter().all(|sess| !sess.is_reserved()));
    }

    #[test]
    fn sigma3_failure_installs_nothing() {
        let mut f = fixture(FakeSigma {
            fail_sigma1: false,
            fail_sigma3: true,
        });
        let mut msg = [0; 256];
        let mut resp = [0; 1536];

        let len = sigma1(&mut msg, None);
        f.handle(OpCode::CASESigma1, &msg[..len], &mut resp);

        let len = sigma3(&mut msg);
        let (action, _) = f.handle(OpCode::CASESigma3, &msg[..len], &mut resp);
        assert!(matches!(action, MsgAction::RespondAndClose(_)));

        assert_eq!(f.active_sessions(), 0);
        assert_eq!(f.cache.len(), 0);
        assert!(f.sessions.iter().all(|sess| !sess.is_reserved()));
    }

    #[test]
    fn resumption_short_path() {
        let mut f = fixture(FakeSigma::good());

        let resumption_id = [0x77; 16];
        let shared_secret = [0x55; 32];
        f.cache
            .add(resumption_id, shared_secret, FakeSigma::peer(), 0);

        let mut mic = [0; 16];
        sigma1_resume_mic(&shared_secret, &[0x11; 32], &resumption_id, &mut mic).unwrap();

        let mut msg = [0; 256];
        let mut resp = [0; 1536];
        let len = sigma1(&mut msg, Some((&resumption_id, &mic)));
        let (action, resp_len) = f.handle(OpCode::CASESigma1, &msg[..len], &mut resp);
        assert!(matches!(action, MsgAction::Respond(meta)
            if meta.proto_opcode == OpCode::CASESigma2Resume as u8));
        // Nothing active until the initiator confirms
        assert_eq!(f.active_sessions(), 0);

        let s2r = TLVElement::root(&resp[..resp_len]).unwrap();
        let new_id = s2r.find_ctx(1).unwrap().str().unwrap().to_vec();
        let their_mic = s2r.find_ctx(2).unwrap().str().unwrap().to_vec();

        let mut expect_mic = [0; 16];
        sigma2_resume_mic(&shared_secret, &[0x11; 32], &new_id, &mut expect_mic).unwrap();
        assert_eq!(their_mic, expect_mic);

        let len = success_report(&mut msg);
        let (action, _) = f.handle(OpCode::StatusReport, &msg[..len], &mut resp);
        assert!(matches!(action, MsgAction::Close));

        assert_eq!(f.active_sessions(), 1);
        // Old record replaced by one under the fresh id
        assert_eq!(f.cache.len(), 1);
        assert!(f.cache.get(&resumption_id, 1).is_none());
        assert!(f.cache.get(&new_id, 1).is_some());
    }

    #[test]
    fn bad_resumption_mic_falls_back_to_full() {
        let mut f = fixture(FakeSigma::good());
        f.cache.add([0x77; 16], [0x55; 32], FakeSigma::peer(), 0);

        let mut msg = [0; 256];
        let mut resp = [0; 1536];
        let len = sigma1(&mut msg, Some((&[0x77; 16], &[0; 16])));
        let (action, _) = f.handle(OpCode::CASESigma1, &msg[..len], &mut resp);
        assert!(matches!(action, MsgAction::Respond(meta)
            if meta.proto_opcode == OpCode::CASESigma2 as u8));
    }

    #[test]
    fn unconfirmed_resumption_installs_nothing() {
        let mut f = fixture(FakeSigma::good());

        let resumption_id = [0x77; 16];
        let shared_secret = [0x55; 32];
        f.cache
            .add(resumption_id, shared_secret, FakeSigma::peer(), 0);

        let mut mic = [0; 16];
        sigma1_resume_mic(&shared_secret, &[0x11; 32], &resumption_id, &mut mic).unwrap();

        let mut msg = [0; 256];
        let mut resp = [0; 1536];
        let len = sigma1(&mut msg, Some((&resumption_id, &mic)));
        f.handle(OpCode::CASESigma1, &msg[..len], &mut resp);

        // A failure report instead of success drops the reservation
        let mut wb = WriteBuf::new(&mut msg);
        sc_write(&mut wb, SCStatusCode::InvalidParameter, &[]).unwrap();
        let len = wb.as_slice().len();

        let (action, _) = f.handle(OpCode::StatusReport, &msg[..len], &mut resp);
        assert!(matches!(action, MsgAction::Close));
        assert_eq!(f.active_sessions(), 0);
        assert!(f.sessions.iter().all(|sess| !sess.is_reserved()));
        // The old record survives for a later attempt
        assert!(f.cache.get(&resumption_id, 1).is_some());
    }

    #[test]
    fn out_of_order_sigma3_releases_reservation() {
        // Take the resume path as far as Sigma2Resume, then hit the
        // machine with a Sigma3 it cannot be expecting
        let mut f = fixture(FakeSigma::good());

        let resumption_id = [0x77; 16];
        let shared_secret = [0x55; 32];
        f.cache
            .add(resumption_id, shared_secret, FakeSigma::peer(), 0);

        let mut mic = [0; 16];
        sigma1_resume_mic(&shared_secret, &[0x11; 32], &resumption_id, &mut mic).unwrap();

        let mut msg = [0; 256];
        let mut resp = [0; 1536];
        let len = sigma1(&mut msg, Some((&resumption_id, &mic)));
        f.handle(OpCode::CASESigma1, &msg[..len], &mut resp);

        let len = sigma3(&mut msg);
        let (action, _) = f.handle(OpCode::CASESigma3, &msg[..len], &mut resp);
        assert!(matches!(action, MsgAction::RespondAndClose(_)));
        assert!(f.case.pending_exchange().is_none());
        assert_eq!(f.active_sessions(), 0);
        assert!(f.sessions.iter().all(|sess| !sess.is_reserved()));
    }

    #[test]
    fn failure_report_after_sigma2_releases_reservation() {
        let mut f = fixture(FakeSigma::good());
        let mut msg = [0; 256];
        let mut resp = [0; 1536];

        let len = sigma1(&mut msg, None);
        f.handle(OpCode::CASESigma1, &msg[..len], &mut resp);

        // The initiator gives up instead of sending Sigma3
        let mut wb = WriteBuf::new(&mut msg);
        sc_write(&mut wb, SCStatusCode::InvalidParameter, &[]).unwrap();
        let len = wb.as_slice().len();

        let (action, _) = f.handle(OpCode::StatusReport, &msg[..len], &mut resp);
        assert!(matches!(action, MsgAction::Close));
        assert!(f.case.pending_exchange().is_none());
        assert!(f.sessions.iter().all(|sess| !sess.is_reserved()));
    }

    #[test]
    fn concurrent_handshake_gets_busy() {
        let mut f = fixture(FakeSigma::good());
        let mut msg = [0; 256];
        let mut resp = [0; 1536];

        let len = sigma1(&mut msg, None);
        f.handle(OpCode::CASESigma1, &msg[..len], &mut resp);

        let (action, _) = f.handle(OpCode::CASESigma1, &msg[..len], &mut resp);
        assert!(matches!(action, MsgAction::RespondAndClose(meta)
            if meta.proto_opcode == OpCode::StatusReport as u8 && !meta.reliable));
    }
}
