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

//! The server-side Interaction Model engine.
//!
//! Serves read, subscribe, write, invoke, and timed interactions on top of
//! the exchange layer, against a [`DataModelProvider`]. Reads and
//! subscription reports are chunked: each `ReportData` is acknowledged by
//! the initiator with a `StatusResponse` before the next chunk goes out.

use core::time::Duration;

use log::{debug, warn};

use crate::dm::{DataModelProvider, InvokeReply};
use crate::error::{Error, ErrorCode};
use crate::tlv::{TLVElement, TLVTag, TLVWriter};
use crate::transport::exchange::{ExchangeId, MsgAction};
use crate::transport::session::SessionMgr;
use crate::utils::writebuf::WriteBuf;

use super::messages::{
    AttrData, AttrPath, AttrStatus, CmdData, CmdResp, CmdStatus, InvReq, InvRespTag, ReadReq,
    ReportDataTag, StatusResp, SubscribeReq, SubscribeResp, TimedReq, WriteReq, WriteRespTag,
};
use super::invoke::CommandRefLookupTable;
use super::report::{AttributeEncodeState, AttributeValueEncoder};
use super::subscriptions::{negotiate_max_interval, Subscriptions, MAX_SUBSCRIPTION_PATHS};
use super::{FabricIndex, GenericPath, IMStatusCode, OpCode, SubscriptionId};

/// The maximum number of concurrently-running IM transactions (chunked
/// reports and armed timed windows).
pub const MAX_IM_TRANSACTIONS: usize = 8;

/// Space kept back from each report chunk for closing the report
/// containers and the `MoreChunkedMessages` flag.
const REPORT_TRAILER: usize = 8;

/// Reporting parameters of this publisher.
#[derive(Debug, Clone)]
pub struct ImConfig {
    /// Slow-poll interval of the device, in seconds; 0 for an
    /// always-listening device.
    pub slow_poll_secs: u32,
    /// The publisher's own ceiling for the negotiated max reporting
    /// interval, in seconds.
    pub publisher_max_int_secs: u16,
}

impl Default for ImConfig {
    fn default() -> Self {
        Self {
            slow_poll_secs: 0,
            publisher_max_int_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportKind {
    Read,
    SubscribePrime {
        id: SubscriptionId,
        max_int_secs: u16,
    },
    SubscribeReport {
        id: SubscriptionId,
    },
}

struct ReportState {
    exch: ExchangeId,
    kind: ReportKind,
    paths: heapless::Vec<GenericPath, MAX_SUBSCRIPTION_PATHS>,
    next_path: usize,
    encode_state: AttributeEncodeState,
    fabric_filtered: bool,
}

enum Transaction {
    /// A chunked report in flight, awaiting the initiator's ack.
    Reporting(ReportState),
    /// An armed timed-interaction window.
    Timed { exch: ExchangeId, deadline: Duration },
}

impl Transaction {
    fn exch(&self) -> ExchangeId {
        match self {
            Self::Reporting(state) => state.exch,
            Self::Timed { exch, .. } => *exch,
        }
    }
}

/// The engine itself: per-exchange transaction state plus the reporting
/// configuration. One instance serves all sessions of a stack.
pub struct ImEngine {
    config: ImConfig,
    transactions: heapless::Vec<Transaction, MAX_IM_TRANSACTIONS>,
}

impl ImEngine {
    pub const fn new(config: ImConfig) -> Self {
        Self {
            config,
            transactions: heapless::Vec::new(),
        }
    }

    /// Handle one incoming IM message on the given exchange.
    ///
    /// The response payload, if any, is written into `wb`.
    #[allow(clippy::too_many_arguments)]
    pub fn handle<P: DataModelProvider>(
        &mut self,
        provider: &mut P,
        subscriptions: &mut Subscriptions,
        sessions: &SessionMgr,
        exch: ExchangeId,
        opcode: OpCode,
        payload: &[u8],
        wb: &mut WriteBuf,
        now: Duration,
    ) -> Result<MsgAction, Error> {
        match opcode {
            OpCode::ReadRequest => self.read_request(provider, exch, payload, wb),
            OpCode::SubscribeRequest => {
                self.subscribe_request(provider, subscriptions, sessions, exch, payload, wb)
            }
            OpCode::WriteRequest => self.write_request(provider, exch, payload, wb, now),
            OpCode::InvokeRequest => self.invoke_request(provider, exch, payload, wb, now),
            OpCode::TimedRequest => self.timed_request(exch, payload, wb, now),
            OpCode::StatusResponse => {
                self.status_response(provider, subscriptions, exch, payload, wb, now)
            }
            _ => {
                warn!("IM: unexpected opcode {:?} on {:?}", opcode, exch);
                status_only(wb, IMStatusCode::InvalidAction)
            }
        }
    }

    /// Open a new report transaction for a subscription whose report is
    /// due, on a fresh exchange initiated by us.
    pub fn start_subscription_report<P: DataModelProvider>(
        &mut self,
        provider: &P,
        subscriptions: &Subscriptions,
        id: SubscriptionId,
        exch: ExchangeId,
        wb: &mut WriteBuf,
    ) -> Result<MsgAction, Error> {
        let paths = subscriptions
            .paths_of(id)
            .ok_or(ErrorCode::NotFound)?;

        let mut state = ReportState {
            exch,
            kind: ReportKind::SubscribeReport { id },
            paths: heapless::Vec::from_slice(paths).map_err(|_| ErrorCode::ResourceExhausted)?,
            next_path: 0,
            encode_state: AttributeEncodeState::default(),
            fabric_filtered: false,
        };

        encode_chunk(provider, &mut state, wb)?;

        self.transactions
            .push(Transaction::Reporting(state))
            .map_err(|_| ErrorCode::ResourceExhausted)?;

        Ok(MsgAction::Respond(OpCode::ReportData.meta()))
    }

    /// Drop all state tied to an exchange that went away. For an
    /// unconfirmed subscription prime this also unregisters the
    /// subscription.
    pub fn on_exchange_closed(&mut self, subscriptions: &mut Subscriptions, exch: ExchangeId) {
        while let Some(index) = self
            .transactions
            .iter()
            .position(|transaction| transaction.exch() == exch)
        {
            if let Transaction::Reporting(ReportState {
                kind: ReportKind::SubscribePrime { id, .. },
                ..
            }) = self.transactions[index]
            {
                subscriptions.remove(None, None, Some(id));
            }

            self.transactions.swap_remove(index);
        }
    }

    /// Expire armed timed windows. Called periodically by the stack.
    pub fn check_timeouts(&mut self, now: Duration) {
        while let Some(index) = self.transactions.iter().position(
            |transaction| matches!(transaction, Transaction::Timed { deadline, .. } if *deadline < now),
        ) {
            debug!("IM: timed window on {:?} expired", self.transactions[index].exch());
            self.transactions.swap_remove(index);
        }
    }

    fn read_request<P: DataModelProvider>(
        &mut self,
        provider: &P,
        exch: ExchangeId,
        payload: &[u8],
        wb: &mut WriteBuf,
    ) -> Result<MsgAction, Error> {
        let req = ReadReq::new(TLVElement::root(payload)?);

        let paths = match self.expand_paths(provider, req.attr_requests()?) {
            Ok(paths) => paths,
            Err(e) => return status_only(wb, e.into()),
        };

        let mut state = ReportState {
            exch,
            kind: ReportKind::Read,
            paths,
            next_path: 0,
            encode_state: AttributeEncodeState::default(),
            fabric_filtered: req.fabric_filtered().unwrap_or(false),
        };

        encode_chunk(provider, &mut state, wb)?;

        self.transactions
            .push(Transaction::Reporting(state))
            .map_err(|_| ErrorCode::ResourceExhausted)?;

        Ok(MsgAction::Respond(OpCode::ReportData.meta()))
    }

    fn subscribe_request<P: DataModelProvider>(
        &mut self,
        provider: &P,
        subscriptions: &mut Subscriptions,
        sessions: &SessionMgr,
        exch: ExchangeId,
        payload: &[u8],
        wb: &mut WriteBuf,
    ) -> Result<MsgAction, Error> {
        let req = SubscribeReq::new(TLVElement::root(payload)?);
        let (fab_idx, peer_node_id) = peer_of(sessions, exch);

        if !req.keep_subs()? {
            let dropped = subscriptions.remove(Some(fab_idx), Some(peer_node_id), None);
            if dropped > 0 {
                debug!("IM: dropped {} prior subscription(s) of the peer", dropped);
            }
        }

        let req_min = req.min_int_floor()?;
        let req_max = req.max_int_ceil()?;
        let decided = negotiate_max_interval(
            self.config.slow_poll_secs,
            self.config.publisher_max_int_secs,
            req_min,
            req_max,
        );

        let paths = match self.expand_paths(provider, req.attr_requests()?) {
            Ok(paths) => paths,
            Err(e) => return status_only(wb, e.into()),
        };

        let Some(id) = subscriptions.add(
            fab_idx,
            peer_node_id,
            exch.session_id(),
            req_min,
            decided,
            &paths,
        ) else {
            return status_only(wb, IMStatusCode::ResourceExhausted);
        };

        debug!(
            "IM: subscription {} registered, max interval {}s",
            id, decided
        );

        let mut state = ReportState {
            exch,
            kind: ReportKind::SubscribePrime {
                id,
                max_int_secs: decided,
            },
            paths,
            next_path: 0,
            encode_state: AttributeEncodeState::default(),
            fabric_filtered: req.fabric_filtered().unwrap_or(false),
        };

        if let Err(e) = encode_chunk(provider, &mut state, wb) {
            subscriptions.remove(None, None, Some(id));
            return Err(e);
        }

        if self
            .transactions
            .push(Transaction::Reporting(state))
            .is_err()
        {
            subscriptions.remove(None, None, Some(id));
            return status_only(wb, IMStatusCode::ResourceExhausted);
        }

        Ok(MsgAction::Respond(OpCode::ReportData.meta()))
    }

    fn status_response<P: DataModelProvider>(
        &mut self,
        provider: &mut P,
        subscriptions: &mut Subscriptions,
        exch: ExchangeId,
        payload: &[u8],
        wb: &mut WriteBuf,
        now: Duration,
    ) -> Result<MsgAction, Error> {
        let resp = StatusResp::from_tlv(&TLVElement::root(payload)?)?;

        let Some(index) = self.transactions.iter().position(|transaction| {
            matches!(transaction, Transaction::Reporting(state) if state.exch == exch)
        }) else {
            // A stray ack; nothing to continue
            return Ok(MsgAction::Close);
        };

        if resp.status != IMStatusCode::Success {
            warn!("IM: peer aborted report with {:?}", resp.status);
            let transaction = self.transactions.swap_remove(index);
            if let Transaction::Reporting(ReportState {
                kind: ReportKind::SubscribePrime { id, .. },
                ..
            }) = transaction
            {
                subscriptions.remove(None, None, Some(id));
            }

            return Ok(MsgAction::Close);
        }

        let Transaction::Reporting(state) = &mut self.transactions[index] else {
            unreachable!()
        };

        if state.next_path < state.paths.len() {
            // More to report
            let more = encode_chunk(provider, state, wb)?;
            debug_assert!(more == (state.next_path < state.paths.len()));

            return Ok(MsgAction::Respond(OpCode::ReportData.meta()));
        }

        // Final chunk was acked
        let Transaction::Reporting(state) = self.transactions.swap_remove(index) else {
            unreachable!()
        };

        match state.kind {
            ReportKind::Read => Ok(MsgAction::Close),
            ReportKind::SubscribePrime { id, max_int_secs } => {
                subscriptions.mark_reported(id, now);
                SubscribeResp::write(wb, id, max_int_secs)?;

                Ok(MsgAction::RespondAndClose(
                    OpCode::SubscribeResponse.meta(),
                ))
            }
            ReportKind::SubscribeReport { id } => {
                subscriptions.mark_reported(id, now);

                Ok(MsgAction::Close)
            }
        }
    }

    fn write_request<P: DataModelProvider>(
        &mut self,
        provider: &mut P,
        exch: ExchangeId,
        payload: &[u8],
        wb: &mut WriteBuf,
        now: Duration,
    ) -> Result<MsgAction, Error> {
        let req = WriteReq::new(TLVElement::root(payload)?);

        if let Some(mismatch) = self.consume_timed(exch, req.timed_request()?, now) {
            return status_only(wb, mismatch);
        }

        let mut tw = TLVWriter::new(wb);
        tw.start_struct(&TLVTag::Anonymous)?;
        tw.start_array(&TLVTag::Context(WriteRespTag::WriteResponses as u8))?;

        for item in req.write_requests()? {
            let data = AttrData::from_tlv(&item?)?;

            let status = match data.path.to_gp().not_wildcard() {
                // Wildcard writes are not a thing
                Err(_) => IMStatusCode::UnsupportedWrite,
                Ok(_) => match provider.write(&data.path.to_gp(), &data.data) {
                    Ok(()) => IMStatusCode::Success,
                    Err(e) => e.into(),
                },
            };

            AttrStatus::new(data.path, status, None).to_tlv(&TLVTag::Anonymous, &mut tw)?;
        }

        tw.end_container()?;
        tw.end_container()?;

        if req.suppress_response()? {
            Ok(MsgAction::Close)
        } else {
            Ok(MsgAction::RespondAndClose(OpCode::WriteResponse.meta()))
        }
    }

    fn invoke_request<P: DataModelProvider>(
        &mut self,
        provider: &mut P,
        exch: ExchangeId,
        payload: &[u8],
        wb: &mut WriteBuf,
        now: Duration,
    ) -> Result<MsgAction, Error> {
        let req = InvReq::new(TLVElement::root(payload)?);

        if let Some(mismatch) = self.consume_timed(exch, req.timed_request()?, now) {
            return status_only(wb, mismatch);
        }

        // Admit the whole batch before dispatching anything: a duplicate
        // path or ref, or an oversized batch, fails the invoke as a whole
        // with no command executed
        let mut table = CommandRefLookupTable::new();
        if let Some(requests) = req.invoke_requests()? {
            for item in requests {
                let data = CmdData::from_tlv(&item?)?;
                if let Err(e) = table.add(data.path, data.cmd_ref) {
                    warn!("IM: invoke batch rejected: {:?}", e.code());
                    return status_only(wb, e.into());
                }
            }
        }

        let mut tw = TLVWriter::new(wb);
        tw.start_struct(&TLVTag::Anonymous)?;
        tw.bool(&TLVTag::Context(InvRespTag::SupressResponse as u8), false)?;
        tw.start_array(&TLVTag::Context(InvRespTag::InvokeResponses as u8))?;

        if let Some(requests) = req.invoke_requests()? {
            for item in requests {
                let data = CmdData::from_tlv(&item?)?;

                let anchor = tw.anchor();
                let invoked = {
                    let mut reply = InvokeReply::new(&mut tw, data.path.clone(), data.cmd_ref);
                    provider
                        .invoke(&data.path, data.data.as_ref(), &mut reply)
                        .map(|()| reply.replied())
                };

                let status = match invoked {
                    Ok(true) => None,
                    Ok(false) => Some(IMStatusCode::Success),
                    Err(e) => {
                        // Discard whatever the handler managed to write
                        tw.rewind_to(anchor);
                        Some(e.into())
                    }
                };

                if let Some(status) = status {
                    // Status entries get the same response-IB wrapper as
                    // data entries
                    CmdResp::Status(CmdStatus::new(data.path, status, None, data.cmd_ref))
                        .to_tlv(&TLVTag::Anonymous, &mut tw)?;
                }
            }
        }

        tw.end_container()?;
        tw.end_container()?;

        if req.suppress_response()? {
            Ok(MsgAction::Close)
        } else {
            Ok(MsgAction::RespondAndClose(OpCode::InvokeResponse.meta()))
        }
    }

    fn timed_request(
        &mut self,
        exch: ExchangeId,
        payload: &[u8],
        wb: &mut WriteBuf,
        now: Duration,
    ) -> Result<MsgAction, Error> {
        let req = TimedReq::from_tlv(&TLVElement::root(payload)?)?;

        let deadline = now + Duration::from_millis(req.timeout_ms as u64);
        self.transactions
            .push(Transaction::Timed { exch, deadline })
            .map_err(|_| ErrorCode::ResourceExhausted)?;

        StatusResp::write(wb, IMStatusCode::Success)?;
        Ok(MsgAction::Respond(OpCode::StatusResponse.meta()))
    }

    /// Check and consume the timed window for a write/invoke. Returns the
    /// mismatch status when the interaction must be refused.
    fn consume_timed(
        &mut self,
        exch: ExchangeId,
        timed_flag: bool,
        now: Duration,
    ) -> Option<IMStatusCode> {
        let window = self.transactions.iter().position(
            |transaction| matches!(transaction, Transaction::Timed { exch: e, .. } if *e == exch),
        );

        match (timed_flag, window) {
            (false, None) => None,
            (true, Some(index)) => {
                let Transaction::Timed { deadline, .. } = self.transactions.swap_remove(index)
                else {
                    unreachable!()
                };

                (deadline < now).then_some(IMStatusCode::Timeout)
            }
            // Flag and window must agree
            (true, None) => Some(IMStatusCode::TimedRequestMisMatch),
            (false, Some(_)) => Some(IMStatusCode::TimedRequestMisMatch),
        }
    }

    fn expand_paths<P: DataModelProvider>(
        &self,
        provider: &P,
        requests: Option<crate::tlv::TLVContainerIter>,
    ) -> Result<heapless::Vec<GenericPath, MAX_SUBSCRIPTION_PATHS>, Error> {
        let mut paths = heapless::Vec::new();

        if let Some(requests) = requests {
            for request in requests {
                let attr_path = AttrPath::from_tlv(&request?)?;
                let gp = attr_path.to_gp();

                let expanded = provider.for_each_concrete(&gp, &mut |concrete| {
                    paths
                        .push(concrete)
                        .map_err(|_| ErrorCode::ResourceExhausted.into())
                });

                match expanded {
                    Ok(()) => (),
                    Err(e) if e.code() == ErrorCode::ResourceExhausted => Err(e)?,
                    // A bad concrete path still gets reported on, as a
                    // per-attribute status; a bad wildcard just expands to
                    // nothing
                    Err(_) if !gp.is_wildcard() => {
                        paths.push(gp).map_err(|_| ErrorCode::ResourceExhausted)?;
                    }
                    Err(_) => (),
                }
            }
        }

        Ok(paths)
    }
}

fn peer_of(sessions: &SessionMgr, exch: ExchangeId) -> (FabricIndex, u64) {
    sessions
        .get(exch.session_id())
        .map(|session| {
            (
                session.mode().fab_idx().unwrap_or(0),
                session.peer_nodeid.unwrap_or(0),
            )
        })
        .unwrap_or((0, 0))
}

fn status_only(wb: &mut WriteBuf, status: IMStatusCode) -> Result<MsgAction, Error> {
    StatusResp::write(wb, status)?;
    Ok(MsgAction::RespondAndClose(OpCode::StatusResponse.meta()))
}

/// Encode one `ReportData` chunk, advancing the report state. Returns
/// whether more chunks follow.
fn encode_chunk<P: DataModelProvider>(
    provider: &P,
    state: &mut ReportState,
    wb: &mut WriteBuf,
) -> Result<bool, Error> {
    let path_before = state.next_path;
    let encode_before = state.encode_state.clone();

    wb.shrink(REPORT_TRAILER)?;

    let mut tw = TLVWriter::new(wb);
    tw.start_struct(&TLVTag::Anonymous)?;

    match state.kind {
        ReportKind::SubscribePrime { id, .. } | ReportKind::SubscribeReport { id } => {
            tw.u32(&TLVTag::Context(ReportDataTag::SubscriptionId as u8), id)?;
        }
        ReportKind::Read => (),
    }

    tw.start_array(&TLVTag::Context(ReportDataTag::AttributeReports as u8))?;

    let mut suspended = false;
    while state.next_path < state.paths.len() {
        let path = state.paths[state.next_path];
        let data_ver = path
            .not_wildcard()
            .ok()
            .and_then(|(endpoint, cluster, _)| provider.data_version(endpoint, cluster).ok())
            .unwrap_or(0);

        let mut encoder =
            AttributeValueEncoder::new(&mut tw, &mut state.encode_state, path, data_ver);

        match provider.read(&path, state.fabric_filtered, &mut encoder) {
            Ok(()) => {
                state.encode_state.reset();
                state.next_path += 1;
            }
            Err(e) if e.code() == ErrorCode::NoSpace => {
                suspended = true;
                break;
            }
            Err(e) => {
                if !state.encode_state.allows_partial() {
                    // The list marker is out; the report can no longer
                    // degrade to a per-attribute status
                    return Err(e);
                }

                let status = AttrStatus::new(AttrPath::from_gp(&path), IMStatusCode::from(e), None);

                match status.to_tlv(&TLVTag::Anonymous, &mut tw) {
                    Ok(()) => state.next_path += 1,
                    Err(e) if e.code() == ErrorCode::NoSpace => {
                        suspended = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    if suspended && state.next_path == path_before && state.encode_state == encode_before {
        // Not a single element fit; a smaller buffer cannot make progress
        Err(ErrorCode::NoSpace)?;
    }

    tw.end_container()?;

    wb.expand(REPORT_TRAILER)?;

    let mut tw = TLVWriter::new(wb);
    if suspended {
        tw.bool(&TLVTag::Context(ReportDataTag::MoreChunkedMsgs as u8), true)?;
    }
    tw.end_container()?;

    Ok(suspended)
}
