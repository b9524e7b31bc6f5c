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

//! The stack context object: one instance owns all protocol state (sessions,
//! exchanges, in-flight handshakes, subscriptions, retained reliable
//! messages) and no state lives anywhere else.
//!
//! The embedder drives it explicitly: every received datagram goes through
//! [`Stack::on_rx`], and [`Stack::on_tick`] is polled for retransmissions,
//! timeouts and subscription reports. Both hand back at most one datagram to
//! put on the wire. [`Stack::run`] wraps the two into an async loop over
//! [`NetSend`]/[`NetRecv`].

use core::time::Duration;

use embassy_futures::select::{select, Either};
use embassy_time::Timer;
use log::{debug, error, info, warn};

use crate::crypto::{PakeEngine, SigmaEngine, AEAD_MIC_LEN_BYTES};
use crate::dm::DataModelProvider;
use crate::error::{Error, ErrorCode};
use crate::im::engine::{ImConfig, ImEngine};
use crate::im::read_client::{ReadClient, ReadClientDelegate};
use crate::im::subscriptions::Subscriptions;
use crate::im::{self, AttrId, ClusterId, EndptId, GenericPath, SubscriptionId};
use crate::sc::case::CaseMgr;
use crate::sc::pase::PaseMgr;
use crate::sc::resume::ResumptionCache;
use crate::sc::{self, GeneralCode, SCStatusCode};
use crate::transport::exchange::{ExchangeHandler, ExchangeId, MessageMeta, MsgAction, Role};
use crate::transport::network::{Address, NetRecv, NetSend};
use crate::transport::plain_hdr::{max_plain_hdr_len, PlainHdr};
use crate::transport::proto_hdr::{self, max_proto_hdr_len, ProtoHdr};
use crate::transport::session::{Session, SessionMgr};
use crate::transport::MAX_MSG_SIZE;
use crate::utils::epoch::Epoch;
use crate::utils::parsebuf::ParseBuf;
use crate::utils::rand::Rand;
use crate::utils::writebuf::WriteBuf;

/// Headroom reserved in front of every outgoing payload for the two headers.
const TX_HDR_RESERVE: usize = max_plain_hdr_len() + max_proto_hdr_len();

/// The maximum number of concurrently active client-side read/subscribe
/// state machines.
pub const MAX_READ_CLIENTS: usize = 4;

/// The number of reliable messages retained verbatim for retransmission.
pub const MAX_RETAINED_MSGS: usize = 4;

/// How long a finished exchange may linger waiting for its last ack, in ms.
const EXCHANGE_CLOSING_TIMEOUT_MS: u64 = 10_000;

/// The cadence of the internal tick in the async run loop, in ms.
const TICK_INTERVAL_MS: u64 = 100;

/// A reliable message kept around byte-for-byte until the peer acknowledges
/// it; retransmissions put exactly these bytes back on the wire.
struct RetainedTx {
    exch: ExchangeId,
    addr: Address,
    len: usize,
    buf: [u8; MAX_MSG_SIZE],
}

/// A client-side read/subscribe machine together with the session whose
/// peer it talks to. Teardown must reach the client by session: an
/// established subscription sits with no open exchange between reports.
struct ClientSlot {
    sess_uid: u32,
    client: ReadClient,
}

#[derive(Debug, Clone, Default)]
pub struct StackConfig {
    pub im: ImConfig,
}

/// The protocol stack. Generic over the session-establishment crypto
/// engines; everything else is injected per call (the data model provider)
/// or at construction (clock and randomness).
pub struct Stack<P, S> {
    sessions: SessionMgr,
    pase: PaseMgr<P>,
    case: CaseMgr<S>,
    cache: ResumptionCache,
    subscriptions: Subscriptions,
    engine: ImEngine,
    read_clients: [Option<ClientSlot>; MAX_READ_CLIENTS],
    retained: heapless::Vec<RetainedTx, MAX_RETAINED_MSGS>,
}

impl<P: PakeEngine, S: SigmaEngine> Stack<P, S> {
    pub fn new(config: StackConfig, pake: P, sigma: S, epoch: Epoch, rand: Rand) -> Self {
        Self {
            sessions: SessionMgr::new(epoch, rand),
            pase: PaseMgr::new(pake),
            case: CaseMgr::new(sigma),
            cache: ResumptionCache::new(),
            subscriptions: Subscriptions::new(),
            engine: ImEngine::new(config.im),
            read_clients: Default::default(),
            retained: heapless::Vec::new(),
        }
    }

    pub fn sessions(&self) -> &SessionMgr {
        &self.sessions
    }

    pub fn sessions_mut(&mut self) -> &mut SessionMgr {
        &mut self.sessions
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    pub fn resumption_cache(&self) -> &ResumptionCache {
        &self.cache
    }

    pub fn resumption_cache_mut(&mut self) -> &mut ResumptionCache {
        &mut self.cache
    }

    pub fn open_commissioning_window(&mut self, iter_count: u32, salt: &[u8]) -> Result<(), Error> {
        self.pase.open_window(iter_count, salt)
    }

    pub fn close_commissioning_window(&mut self) {
        self.pase.close_window(&mut self.sessions);
    }

    /// Flag subscriptions interested in the changed attribute; the next
    /// tick emits reports once the min intervals allow.
    pub fn notify_attribute_changed(
        &mut self,
        endpoint: EndptId,
        cluster: ClusterId,
        attr: AttrId,
    ) {
        self.subscriptions
            .notify_attribute_changed(endpoint, cluster, attr);
    }

    /// Process one received datagram.
    ///
    /// `rx` is decrypted in place; the response datagram, if any, is built
    /// in `tx` and returned as a slice to put on the wire towards
    /// `peer_addr`.
    pub fn on_rx<'t, M, D>(
        &mut self,
        provider: &mut M,
        delegate: &mut D,
        rx: &mut [u8],
        peer_addr: Address,
        tx: &'t mut [u8],
    ) -> Result<Option<&'t [u8]>, Error>
    where
        M: DataModelProvider,
        D: ReadClientDelegate,
    {
        let now = (self.sessions.epoch)();
        let now_ms = now.as_millis() as u64;

        let mut pb = ParseBuf::new(rx);
        let mut plain = PlainHdr::new();
        plain.decode(&mut pb)?;

        let sess_uid = match self
            .sessions
            .get_for_rx(&peer_addr, plain.sess_id, plain.get_src_nodeid())
        {
            Some(session) => session.id(),
            None if !plain.is_encrypted() => {
                self.sessions.add_plain(peer_addr, plain.get_src_nodeid())?
            }
            None => {
                warn!("No session {:x} for {}", plain.sess_id, peer_addr);
                Err(ErrorCode::NoSession)?
            }
        };

        {
            let session = self.sessions.get_mut(sess_uid).ok_or(ErrorCode::NoSession)?;
            session.update_last_use(now_ms);

            if session.is_encrypted() {
                proto_hdr::decrypt_in_place(
                    plain.ctr,
                    session.peer_nodeid.unwrap_or_default(),
                    &mut pb,
                    session.dec_key(),
                )?;
            }
        }

        let mut proto = ProtoHdr::new();
        proto.decode(&mut pb)?;
        let payload = pb.as_slice();
        let meta = MessageMeta::new(proto.proto_id, proto.proto_opcode, proto.is_reliable());

        let duplicate = {
            let session = self.sessions.get_mut(sess_uid).ok_or(ErrorCode::NoSession)?;
            !session.post_recv_ctr(plain.ctr)
        };

        if duplicate {
            debug!("Duplicate ctr {:x} on session {}", plain.ctr, sess_uid);
            if !proto.is_reliable() {
                return Ok(None);
            }

            // Re-acknowledge so a peer that lost our ack stops resending
            let exch_idx = self
                .sessions
                .get(sess_uid)
                .and_then(|sess| sess.get_exch_idx(proto.exch_id, proto.is_initiator()));

            let mut wb = WriteBuf::new(&mut tx[..]);
            reserve_tx(&mut wb)?;
            match exch_idx {
                Some(idx) => finish_tx(
                    &mut self.sessions,
                    &mut self.retained,
                    sess_uid,
                    idx,
                    sc::OpCode::MRPStandAloneAck.meta(),
                    Some(plain.ctr),
                    &mut wb,
                    now_ms,
                )?,
                None => {
                    // The exchange is already gone; ack from a bare header
                    let role = if proto.is_initiator() {
                        Role::Responder
                    } else {
                        Role::Initiator
                    };
                    raw_ack(&mut self.sessions, sess_uid, proto.exch_id, role, plain.ctr, &mut wb)?;
                }
            }

            let (start, end) = (wb.start(), wb.tail());
            return Ok(Some(&tx[start..end]));
        }

        // Route to an exchange, creating one for legitimate unsolicited
        // messages only
        let exch_idx = {
            let session = self.sessions.get(sess_uid).ok_or(ErrorCode::NoSession)?;
            session.get_exch_idx(proto.exch_id, proto.is_initiator())
        };

        let exch_idx = match exch_idx {
            Some(idx) => idx,
            None => {
                if meta.is_standalone_ack() {
                    // An ack for an exchange we already retired
                    return Ok(None);
                }

                if !proto.is_initiator() || !meta.is_new_exchange() {
                    warn!("Dropping {} without an exchange", meta);
                    return Ok(None);
                }

                let handler = if proto.proto_id == sc::PROTO_ID_SECURE_CHANNEL {
                    ExchangeHandler::SecureChannel
                } else if proto.proto_opcode == im::OpCode::ReportData as u8 {
                    // A publisher-initiated subscription report belongs to
                    // the subscribed client-side machine, if there is one
                    match self.subscribed_client() {
                        Some(slot) => ExchangeHandler::ReadClient(slot),
                        None => ExchangeHandler::Interaction,
                    }
                } else {
                    ExchangeHandler::Interaction
                };

                let session = self.sessions.get_mut(sess_uid).ok_or(ErrorCode::NoSession)?;
                session.add_exch(proto.exch_id, Role::Responder, handler)?
            }
        };

        let exch = ExchangeId::new(sess_uid, exch_idx);

        let (handler, closing) = {
            let session = self.sessions.get_mut(sess_uid).ok_or(ErrorCode::NoSession)?;
            let state = session.exch_mut(exch_idx).ok_or(ErrorCode::NoExchange)?;
            state.mrp.post_recv(&proto, plain.ctr)?;
            (state.handler, state.closing)
        };

        // Our in-flight reliable message got acknowledged
        let retrans_cleared = self
            .sessions
            .get(sess_uid)
            .and_then(|sess| sess.exch(exch_idx))
            .map(|state| state.mrp.retrans.is_none())
            .unwrap_or(true);
        if retrans_cleared {
            self.retained.retain(|r| r.exch != exch);
        }

        if closing {
            // The handler is done with this exchange; only the reliability
            // bookkeeping remains
            if self.owes_ack(sess_uid, exch_idx) {
                let mut wb = WriteBuf::new(&mut tx[..]);
                reserve_tx(&mut wb)?;
                finish_tx(
                    &mut self.sessions,
                    &mut self.retained,
                    sess_uid,
                    exch_idx,
                    sc::OpCode::MRPStandAloneAck.meta(),
                    None,
                    &mut wb,
                    now_ms,
                )?;
                let (start, end) = (wb.start(), wb.tail());
                self.retire_if_done(exch);
                return Ok(Some(&tx[start..end]));
            }

            self.retire_if_done(exch);
            return Ok(None);
        }

        let mut wb = WriteBuf::new(&mut tx[..]);
        reserve_tx(&mut wb)?;

        let action = match handler {
            ExchangeHandler::SecureChannel => {
                let opcode = proto.opcode::<sc::OpCode>()?;
                match opcode {
                    sc::OpCode::MRPStandAloneAck => MsgAction::Wait,
                    sc::OpCode::PBKDFParamRequest
                    | sc::OpCode::PBKDFParamResponse
                    | sc::OpCode::PASEPake1
                    | sc::OpCode::PASEPake2
                    | sc::OpCode::PASEPake3 => self.pase.handle(
                        &mut self.sessions,
                        exch,
                        peer_addr,
                        opcode,
                        payload,
                        &mut wb,
                    )?,
                    sc::OpCode::CASESigma1
                    | sc::OpCode::CASESigma2
                    | sc::OpCode::CASESigma3
                    | sc::OpCode::CASESigma2Resume => self.case.handle(
                        &mut self.sessions,
                        &mut self.cache,
                        exch,
                        peer_addr,
                        opcode,
                        payload,
                        &mut wb,
                    )?,
                    sc::OpCode::StatusReport => {
                        if self.case.pending_exchange() == Some(exch) {
                            self.case.handle(
                                &mut self.sessions,
                                &mut self.cache,
                                exch,
                                peer_addr,
                                opcode,
                                payload,
                                &mut wb,
                            )?
                        } else if is_close_session_report(payload) {
                            info!("Peer closed session {}", sess_uid);
                            self.close_session(sess_uid, delegate);
                            return Ok(None);
                        } else {
                            warn!("Unsolicited status report on {}", exch);
                            MsgAction::Close
                        }
                    }
                }
            }
            ExchangeHandler::Interaction => {
                let opcode = proto.opcode::<im::OpCode>()?;
                self.engine.handle(
                    provider,
                    &mut self.subscriptions,
                    &self.sessions,
                    exch,
                    opcode,
                    payload,
                    &mut wb,
                    now,
                )?
            }
            ExchangeHandler::ReadClient(slot) => {
                match self.read_clients.get_mut(slot).and_then(Option::as_mut) {
                    Some(entry) => {
                        let opcode = proto.opcode::<im::OpCode>()?;
                        entry.client.handle(delegate, opcode, payload, &mut wb)?
                    }
                    None => {
                        warn!("No read client behind {}", exch);
                        MsgAction::Close
                    }
                }
            }
        };

        match action {
            MsgAction::Respond(meta) => {
                finish_tx(
                    &mut self.sessions,
                    &mut self.retained,
                    sess_uid,
                    exch_idx,
                    meta,
                    None,
                    &mut wb,
                    now_ms,
                )?;
                let (start, end) = (wb.start(), wb.tail());
                Ok(Some(&tx[start..end]))
            }
            MsgAction::RespondAndClose(meta) => {
                finish_tx(
                    &mut self.sessions,
                    &mut self.retained,
                    sess_uid,
                    exch_idx,
                    meta,
                    None,
                    &mut wb,
                    now_ms,
                )?;
                let (start, end) = (wb.start(), wb.tail());
                self.finish_exchange(exch, now_ms);
                Ok(Some(&tx[start..end]))
            }
            MsgAction::Wait => {
                if self.owes_ack(sess_uid, exch_idx) {
                    let start = wb.start();
                    wb.rewind_tail_to(start);
                    finish_tx(
                        &mut self.sessions,
                        &mut self.retained,
                        sess_uid,
                        exch_idx,
                        sc::OpCode::MRPStandAloneAck.meta(),
                        None,
                        &mut wb,
                        now_ms,
                    )?;
                    let (start, end) = (wb.start(), wb.tail());
                    Ok(Some(&tx[start..end]))
                } else {
                    Ok(None)
                }
            }
            MsgAction::Close => {
                let packet = if self.owes_ack(sess_uid, exch_idx) {
                    let start = wb.start();
                    wb.rewind_tail_to(start);
                    finish_tx(
                        &mut self.sessions,
                        &mut self.retained,
                        sess_uid,
                        exch_idx,
                        sc::OpCode::MRPStandAloneAck.meta(),
                        None,
                        &mut wb,
                        now_ms,
                    )?;
                    Some((wb.start(), wb.tail()))
                } else {
                    None
                };
                self.close_exchange_now(exch);
                Ok(packet.map(|(start, end)| &tx[start..end]))
            }
        }
    }

    /// Poll the stack's timers.
    ///
    /// Returns at most one datagram to send; the caller keeps polling until
    /// `None`. All protocol timing is computed from the supplied `now`.
    pub fn on_tick<'t, M, D>(
        &mut self,
        provider: &mut M,
        delegate: &mut D,
        tx: &'t mut [u8],
        now: Duration,
    ) -> Result<Option<(&'t [u8], Address)>, Error>
    where
        M: DataModelProvider,
        D: ReadClientDelegate,
    {
        let now_ms = now.as_millis() as u64;

        self.engine.check_timeouts(now);

        if let Some(exch) = self.pase.check_timeout(&mut self.sessions, now_ms) {
            self.teardown_exchange(exch, delegate);
        }
        if let Some(exch) = self.case.check_timeout(&mut self.sessions, now_ms) {
            self.teardown_exchange(exch, delegate);
        }

        while let Some(exch) = self.find_timed_out_exchange(now_ms) {
            warn!("Exchange {} timed out", exch);
            self.teardown_exchange(exch, delegate);
        }

        if let Some(exch) = self.find_due_retrans(now_ms) {
            let budget = self
                .sessions
                .get_mut(exch.session_id())
                .and_then(|sess| sess.exch_mut(exch.exchange_index()))
                .and_then(|state| state.mrp.retrans.as_mut())
                .map(|entry| entry.pre_send(now_ms));

            match budget {
                Some(Ok(())) => {
                    if let Some(entry) = self.retained.iter().find(|r| r.exch == exch) {
                        let (len, addr) = (entry.len, entry.addr);
                        tx[..len].copy_from_slice(&entry.buf[..len]);
                        debug!("Retransmitting on {}", exch);
                        return Ok(Some((&tx[..len], addr)));
                    }

                    error!("No retained message for {}", exch);
                    self.teardown_exchange(exch, delegate);
                }
                Some(Err(_)) => {
                    error!("Retry budget exhausted on {}", exch);
                    self.teardown_exchange(exch, delegate);
                }
                None => (),
            }
        }

        if let Some((_, _, _, id)) = self.subscriptions.find_expired(now) {
            warn!("Subscription {} expired without a report", id);
            self.subscriptions.remove(None, None, Some(id));
        }

        let dead = {
            let sessions = &self.sessions;
            self.subscriptions
                .find_removed_session(|sess| sessions.get(sess).is_none())
        };
        if let Some((_, _, sess, id)) = dead {
            info!("Dropping subscription {}; session {} is gone", id, sess);
            self.subscriptions.remove(None, None, Some(id));
        }

        if let Some((_, _, sess_uid, id)) = self.subscriptions.find_report_due(now) {
            return self.send_subscription_report(provider, sess_uid, id, tx, now_ms);
        }

        Ok(None)
    }

    /// Start a one-shot read towards the peer of the given session,
    /// returning the request datagram to send.
    pub fn start_read<'t>(
        &mut self,
        sess_uid: u32,
        paths: &[GenericPath],
        fabric_filtered: bool,
        tx: &'t mut [u8],
    ) -> Result<&'t [u8], Error> {
        self.start_client(sess_uid, tx, |client, wb| {
            client.start_read(paths, fabric_filtered, wb)
        })
    }

    /// Start a subscription towards the peer of the given session,
    /// returning the request datagram to send.
    pub fn start_subscribe<'t>(
        &mut self,
        sess_uid: u32,
        paths: &[GenericPath],
        min_int_secs: u16,
        max_int_secs: u16,
        tx: &'t mut [u8],
    ) -> Result<&'t [u8], Error> {
        self.start_client(sess_uid, tx, |client, wb| {
            client.start_subscribe(paths, min_int_secs, max_int_secs, wb)
        })
    }

    /// Tear down a session and everything that rides on it, notifying each
    /// dependent exactly once.
    pub fn close_session<D: ReadClientDelegate>(&mut self, sess_uid: u32, delegate: &mut D) {
        self.pase.abort_for_session(sess_uid, &mut self.sessions);
        self.case.abort_for_session(sess_uid, &mut self.sessions);

        let mut owners: heapless::Vec<(usize, ExchangeHandler), 8> = heapless::Vec::new();
        match self.sessions.get(sess_uid) {
            Some(session) => {
                for (idx, state) in session.exchanges.iter().enumerate() {
                    if let Some(state) = state {
                        let _ = owners.push((idx, state.handler));
                    }
                }
            }
            None => return,
        }

        for (idx, handler) in owners {
            let exch = ExchangeId::new(sess_uid, idx);
            match handler {
                ExchangeHandler::Interaction => {
                    self.engine.on_exchange_closed(&mut self.subscriptions, exch)
                }
                // Read clients are swept by owning session below; an
                // established subscription has no open exchange to find
                // them through
                ExchangeHandler::ReadClient(_) => (),
                ExchangeHandler::SecureChannel => (),
            }
        }

        for slot in self.read_clients.iter_mut() {
            if slot.as_ref().is_some_and(|entry| entry.sess_uid == sess_uid) {
                if let Some(mut entry) = slot.take() {
                    entry.client.on_session_teardown(delegate);
                }
            }
        }

        while let Some((_, _, _, id)) = self
            .subscriptions
            .find_removed_session(|sess| sess == sess_uid)
        {
            self.subscriptions.remove(None, None, Some(id));
        }

        self.sessions.remove(sess_uid);
        self.retained.retain(|r| r.exch.session_id() != sess_uid);
        info!("Session {} closed", sess_uid);
    }

    /// Remove everything scoped to a fabric: sessions (with their dependent
    /// teardown), subscriptions and resumption records.
    pub fn remove_fabric<D: ReadClientDelegate>(&mut self, fab_idx: u8, delegate: &mut D) -> usize {
        let mut removed = 0;
        loop {
            let id = self
                .sessions
                .iter()
                .find(|sess| sess.mode().fab_idx() == Some(fab_idx))
                .map(|sess| sess.id());
            let Some(id) = id else {
                break;
            };

            self.close_session(id, delegate);
            removed += 1;
        }

        self.subscriptions.remove(Some(fab_idx), None, None);
        self.cache.remove_for_fabric(fab_idx);

        removed
    }

    /// Run the stack over the given network glue until an unrecoverable
    /// send/receive error occurs.
    pub async fn run<M, D, TS, TR>(
        &mut self,
        provider: &mut M,
        delegate: &mut D,
        send: &mut TS,
        recv: &mut TR,
    ) -> Result<(), Error>
    where
        M: DataModelProvider,
        D: ReadClientDelegate,
        TS: NetSend,
        TR: NetRecv,
    {
        let mut rx = [0; MAX_MSG_SIZE];
        let mut tx = [0; MAX_MSG_SIZE];

        loop {
            let timer = Timer::after(embassy_time::Duration::from_millis(TICK_INTERVAL_MS));

            match select(recv.recv_from(&mut rx), timer).await {
                Either::First(recvd) => {
                    let (len, addr) = recvd?;
                    match self.on_rx(provider, delegate, &mut rx[..len], addr, &mut tx) {
                        Ok(Some(resp)) => send.send_to(resp, addr).await?,
                        Ok(None) => (),
                        Err(e) => warn!("Dropped packet from {}: {}", addr, e),
                    }
                }
                Either::Second(()) => {
                    let now = (self.sessions.epoch)();
                    loop {
                        match self.on_tick(provider, delegate, &mut tx, now) {
                            Ok(Some((packet, addr))) => send.send_to(packet, addr).await?,
                            Ok(None) => break,
                            Err(e) => {
                                warn!("Tick failed: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    fn start_client<'t, F>(&mut self, sess_uid: u32, tx: &'t mut [u8], f: F) -> Result<&'t [u8], Error>
    where
        F: FnOnce(&mut ReadClient, &mut WriteBuf) -> Result<MsgAction, Error>,
    {
        let slot = self
            .read_clients
            .iter()
            .position(Option::is_none)
            .ok_or(ErrorCode::ResourceExhausted)?;

        let now_ms = (self.sessions.epoch)().as_millis() as u64;
        let exch_id = self.sessions.get_next_exch_id();
        let session = self.sessions.get_mut(sess_uid).ok_or(ErrorCode::NoSession)?;
        let exch_idx = session.add_exch(exch_id, Role::Initiator, ExchangeHandler::ReadClient(slot))?;

        let mut client = ReadClient::new();
        let mut wb = WriteBuf::new(&mut tx[..]);

        let sent = reserve_tx(&mut wb)
            .and_then(|()| f(&mut client, &mut wb))
            .and_then(|action| match action {
                MsgAction::Respond(meta) => finish_tx(
                    &mut self.sessions,
                    &mut self.retained,
                    sess_uid,
                    exch_idx,
                    meta,
                    None,
                    &mut wb,
                    now_ms,
                ),
                _ => Err(ErrorCode::InvalidState.into()),
            });

        match sent {
            Ok(()) => {
                let (start, end) = (wb.start(), wb.tail());
                self.read_clients[slot] = Some(ClientSlot { sess_uid, client });
                Ok(&tx[start..end])
            }
            Err(e) => {
                if let Some(session) = self.sessions.get_mut(sess_uid) {
                    session.remove_exch(exch_idx);
                }
                Err(e)
            }
        }
    }

    fn send_subscription_report<'t, M: DataModelProvider>(
        &mut self,
        provider: &M,
        sess_uid: u32,
        id: SubscriptionId,
        tx: &'t mut [u8],
        now_ms: u64,
    ) -> Result<Option<(&'t [u8], Address)>, Error> {
        let exch_id = self.sessions.get_next_exch_id();
        let Some(session) = self.sessions.get_mut(sess_uid) else {
            // The session raced away; the dead-session sweep cleans up
            return Ok(None);
        };
        let peer_addr = session.peer_addr;
        let exch_idx = session.add_exch(exch_id, Role::Initiator, ExchangeHandler::Interaction)?;
        let exch = ExchangeId::new(sess_uid, exch_idx);

        let mut wb = WriteBuf::new(&mut tx[..]);
        let sent = reserve_tx(&mut wb)
            .and_then(|()| {
                self.engine
                    .start_subscription_report(provider, &self.subscriptions, id, exch, &mut wb)
            })
            .and_then(|action| match action {
                MsgAction::Respond(meta) => finish_tx(
                    &mut self.sessions,
                    &mut self.retained,
                    sess_uid,
                    exch_idx,
                    meta,
                    None,
                    &mut wb,
                    now_ms,
                ),
                _ => Err(ErrorCode::InvalidState.into()),
            });

        match sent {
            Ok(()) => {
                let (start, end) = (wb.start(), wb.tail());
                Ok(Some((&tx[start..end], peer_addr)))
            }
            Err(e) => {
                warn!("Could not start report for subscription {}: {}", id, e);
                self.close_exchange_now(exch);
                Ok(None)
            }
        }
    }

    fn subscribed_client(&self) -> Option<usize> {
        self.read_clients
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|entry| entry.client.is_subscription()))
    }

    fn owes_ack(&self, sess_uid: u32, exch_idx: usize) -> bool {
        self.sessions
            .get(sess_uid)
            .and_then(|sess| sess.exch(exch_idx))
            .is_some_and(|state| state.mrp.is_ack_pending())
    }

    /// Retire the handler's side of an exchange. If a reliable message is
    /// still in flight the slot lingers until the ack (or the grace
    /// timeout); otherwise it is freed immediately.
    fn finish_exchange(&mut self, exch: ExchangeId, now_ms: u64) {
        let retrans_pending = self
            .sessions
            .get_mut(exch.session_id())
            .and_then(|sess| sess.exch_mut(exch.exchange_index()))
            .map(|state| {
                if state.mrp.is_retrans_pending() {
                    state.closing = true;
                    state.timeout_at_ms = Some(now_ms + EXCHANGE_CLOSING_TIMEOUT_MS);
                    true
                } else {
                    false
                }
            });

        if retrans_pending == Some(false) {
            self.close_exchange_now(exch);
        }
    }

    fn retire_if_done(&mut self, exch: ExchangeId) {
        let done = self
            .sessions
            .get(exch.session_id())
            .and_then(|sess| sess.exch(exch.exchange_index()))
            .is_some_and(|state| state.mrp.is_empty());

        if done {
            self.close_exchange_now(exch);
        }
    }

    /// Free an exchange slot after a graceful close. Idle read clients are
    /// recycled; terminal notifications already happened through the
    /// handler's own flow.
    fn close_exchange_now(&mut self, exch: ExchangeId) {
        let sess_uid = exch.session_id();
        let exch_idx = exch.exchange_index();

        let handler = self
            .sessions
            .get(sess_uid)
            .and_then(|sess| sess.exch(exch_idx))
            .map(|state| state.handler);

        match handler {
            Some(ExchangeHandler::Interaction) => {
                self.engine.on_exchange_closed(&mut self.subscriptions, exch)
            }
            Some(ExchangeHandler::ReadClient(slot)) => {
                if self
                    .read_clients
                    .get(slot)
                    .and_then(Option::as_ref)
                    .is_some_and(|entry| entry.client.is_idle())
                {
                    self.read_clients[slot] = None;
                }
            }
            Some(ExchangeHandler::SecureChannel) | None => (),
        }

        if let Some(session) = self.sessions.get_mut(sess_uid) {
            session.remove_exch(exch_idx);
        }
        self.retained.retain(|r| r.exch != exch);
    }

    /// Abnormal teardown (retry budget gone, handshake timeout): the owner
    /// is notified exactly once before the slot is freed.
    fn teardown_exchange<D: ReadClientDelegate>(&mut self, exch: ExchangeId, delegate: &mut D) {
        if self.pase.pending_exchange() == Some(exch) {
            self.pase.abort(&mut self.sessions);
        }
        if self.case.pending_exchange() == Some(exch) {
            self.case.abort(&mut self.sessions);
        }

        let sess_uid = exch.session_id();
        let exch_idx = exch.exchange_index();

        let handler = self
            .sessions
            .get(sess_uid)
            .and_then(|sess| sess.exch(exch_idx))
            .map(|state| state.handler);

        match handler {
            Some(ExchangeHandler::Interaction) => {
                self.engine.on_exchange_closed(&mut self.subscriptions, exch)
            }
            Some(ExchangeHandler::ReadClient(slot)) => {
                if let Some(slot) = self.read_clients.get_mut(slot) {
                    if let Some(entry) = slot.as_mut() {
                        entry.client.on_session_teardown(delegate);
                    }
                    *slot = None;
                }
            }
            Some(ExchangeHandler::SecureChannel) | None => (),
        }

        if let Some(session) = self.sessions.get_mut(sess_uid) {
            session.remove_exch(exch_idx);
        }
        self.retained.retain(|r| r.exch != exch);
    }

    fn find_timed_out_exchange(&self, now_ms: u64) -> Option<ExchangeId> {
        for session in self.sessions.iter() {
            for (idx, state) in session.exchanges.iter().enumerate() {
                if let Some(state) = state {
                    if state.timeout_at_ms.is_some_and(|at| at <= now_ms) {
                        return Some(ExchangeId::new(session.id(), idx));
                    }
                }
            }
        }

        None
    }

    fn find_due_retrans(&self, now_ms: u64) -> Option<ExchangeId> {
        for session in self.sessions.iter() {
            for (idx, state) in session.exchanges.iter().enumerate() {
                if let Some(state) = state {
                    if state
                        .mrp
                        .retrans
                        .as_ref()
                        .is_some_and(|entry| entry.is_due(now_ms))
                    {
                        return Some(ExchangeId::new(session.id(), idx));
                    }
                }
            }
        }

        None
    }
}

/// Prepare a fresh tx buffer: header headroom up front, and the AEAD tag
/// room held back at the tail until `seal` claims it.
fn reserve_tx(wb: &mut WriteBuf) -> Result<(), Error> {
    wb.reserve(TX_HDR_RESERVE)?;
    wb.shrink(AEAD_MIC_LEN_BYTES)
}

/// Fill in the reliability state and both headers around a built payload
/// and, for reliable messages, retain the finished datagram verbatim.
#[allow(clippy::too_many_arguments)]
fn finish_tx(
    sessions: &mut SessionMgr,
    retained: &mut heapless::Vec<RetainedTx, MAX_RETAINED_MSGS>,
    sess_uid: u32,
    exch_idx: usize,
    meta: MessageMeta,
    explicit_ack: Option<u32>,
    wb: &mut WriteBuf,
    now_ms: u64,
) -> Result<(), Error> {
    if meta.reliable && retained.is_full() {
        Err(ErrorCode::ResourceExhausted)?;
    }

    let session = sessions.get_mut(sess_uid).ok_or(ErrorCode::NoSession)?;
    let peer_addr = session.peer_addr;
    let msg_ctr = session.get_msg_ctr()?;

    let mut proto = ProtoHdr::new();
    proto.proto_id = meta.proto_id;
    proto.proto_opcode = meta.proto_opcode;
    proto.set_reliable(meta.reliable);

    let state = session.exch_mut(exch_idx).ok_or(ErrorCode::NoExchange)?;
    proto.exch_id = state.exch_id;
    proto.set_initiator(state.role == Role::Initiator);
    state.mrp.pre_send(&mut proto, msg_ctr, now_ms)?;
    if let Some(ack) = explicit_ack {
        proto.set_ack(Some(ack));
    }

    seal(session, &proto, msg_ctr, wb)?;

    if meta.reliable {
        let mut entry = RetainedTx {
            exch: ExchangeId::new(sess_uid, exch_idx),
            addr: peer_addr,
            len: wb.as_slice().len(),
            buf: [0; MAX_MSG_SIZE],
        };
        entry.buf[..entry.len].copy_from_slice(wb.as_slice());
        // Capacity was checked up front
        let _ = retained.push(entry);
    }

    Ok(())
}

/// A standalone ack for an exchange that no longer has state, built from a
/// bare header.
fn raw_ack(
    sessions: &mut SessionMgr,
    sess_uid: u32,
    exch_id: u16,
    role: Role,
    ack: u32,
    wb: &mut WriteBuf,
) -> Result<(), Error> {
    let session = sessions.get_mut(sess_uid).ok_or(ErrorCode::NoSession)?;
    let msg_ctr = session.get_msg_ctr()?;

    let mut proto = ProtoHdr::new();
    proto.exch_id = exch_id;
    proto.proto_id = sc::PROTO_ID_SECURE_CHANNEL;
    proto.proto_opcode = sc::OpCode::MRPStandAloneAck as u8;
    proto.set_initiator(role == Role::Initiator);
    proto.set_ack(Some(ack));

    seal(session, &proto, msg_ctr, wb)
}

/// Wrap the payload in `wb` into a full datagram: prepend the proto header,
/// protect the result under the session's key and prepend the plain header.
fn seal(session: &mut Session, proto: &ProtoHdr, msg_ctr: u32, wb: &mut WriteBuf) -> Result<(), Error> {
    let mut proto_mem = [0; max_proto_hdr_len()];
    let mut hwb = WriteBuf::new(&mut proto_mem);
    proto.encode(&mut hwb)?;
    wb.prepend(hwb.as_slice())?;

    let mut plain = PlainHdr::new();
    plain.sess_id = session.peer_sess_id();
    plain.ctr = msg_ctr;

    let mut plain_mem = [0; max_plain_hdr_len()];
    let mut pwb = WriteBuf::new(&mut plain_mem);
    plain.encode(&mut pwb)?;

    // Claim back the tag room held since `reserve_tx`
    wb.expand(AEAD_MIC_LEN_BYTES)?;

    if session.is_encrypted() {
        proto_hdr::encrypt_in_place(
            msg_ctr,
            session.local_nodeid,
            pwb.as_slice(),
            wb,
            session.enc_key(),
        )?;
    }

    wb.prepend(pwb.as_slice())
}

fn is_close_session_report(payload: &[u8]) -> bool {
    payload.len() >= 8
        && payload[..2] == (GeneralCode::Success as u16).to_le_bytes()
        && payload[2..6] == (sc::PROTO_ID_SECURE_CHANNEL as u32).to_le_bytes()
        && payload[6..8] == (SCStatusCode::CloseSession as u16).to_le_bytes()
}
