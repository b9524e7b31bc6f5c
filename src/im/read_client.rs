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

//! The client side of read and subscribe interactions.
//!
//! Reassembles chunked reports, validating that list attributes arrive as
//! the empty-list marker followed by elements at strictly increasing
//! indices with no gaps or duplicates, acks every `ReportData`, and
//! delivers completion and errors to the delegate exactly once.

use log::{debug, warn};

use crate::error::{Error, ErrorCode};
use crate::tlv::{Nullable, TLVElement, TLVTag, TLVWriter};
use crate::transport::exchange::MsgAction;
use crate::utils::writebuf::WriteBuf;

use super::messages::{
    AttrPath, AttrResp, AttrStatus, ReportDataTag, StatusResp, SubscribeResp,
};
use super::{GenericPath, IMStatusCode, ListIndex, OpCode, SubscriptionId};

/// Receives the outcome of a read or subscribe interaction.
///
/// `on_error` and `on_done` are each delivered at most once per
/// interaction, including when the underlying session is torn down.
pub trait ReadClientDelegate {
    fn on_attr_data(&mut self, path: &AttrPath, data: &TLVElement) -> Result<(), Error>;
    fn on_attr_status(&mut self, status: &AttrStatus);
    fn on_subscription_established(&mut self, id: SubscriptionId, max_int_secs: u16);
    fn on_error(&mut self, err: Error);
    fn on_done(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    AwaitingInitialReport,
    AwaitingSubsequentReport,
    AwaitingSubscribeResponse,
    SubscriptionActive,
}

/// One in-flight read or subscribe interaction, bound to an exchange by
/// the owning stack.
pub struct ReadClient {
    state: State,
    subs_id: Option<SubscriptionId>,
    /// The list currently being reassembled and the next expected index.
    current_list: Option<(GenericPath, ListIndex)>,
    finished: bool,
}

impl ReadClient {
    pub const fn new() -> Self {
        Self {
            state: State::Idle,
            subs_id: None,
            current_list: None,
            finished: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    pub fn is_subscription(&self) -> bool {
        matches!(
            self.state,
            State::AwaitingSubscribeResponse | State::SubscriptionActive
        )
    }

    /// Encode a read request for the given paths and arm the client for
    /// the initial report.
    pub fn start_read(
        &mut self,
        paths: &[GenericPath],
        fabric_filtered: bool,
        wb: &mut WriteBuf,
    ) -> Result<MsgAction, Error> {
        if !self.is_idle() {
            Err(ErrorCode::InvalidState)?;
        }

        let mut tw = TLVWriter::new(wb);
        tw.start_struct(&TLVTag::Anonymous)?;
        tw.start_array(&TLVTag::Context(0))?;
        for path in paths {
            AttrPath::from_gp(path).to_tlv(&TLVTag::Anonymous, &mut tw)?;
        }
        tw.end_container()?;
        tw.bool(&TLVTag::Context(3), fabric_filtered)?;
        tw.end_container()?;

        self.arm();
        Ok(MsgAction::Respond(OpCode::ReadRequest.meta()))
    }

    /// Encode a subscribe request and arm the client for the prime report.
    pub fn start_subscribe(
        &mut self,
        paths: &[GenericPath],
        min_int_secs: u16,
        max_int_secs: u16,
        wb: &mut WriteBuf,
    ) -> Result<MsgAction, Error> {
        if !self.is_idle() {
            Err(ErrorCode::InvalidState)?;
        }

        let mut tw = TLVWriter::new(wb);
        tw.start_struct(&TLVTag::Anonymous)?;
        tw.bool(&TLVTag::Context(0), false)?;
        tw.u16(&TLVTag::Context(1), min_int_secs)?;
        tw.u16(&TLVTag::Context(2), max_int_secs)?;
        tw.start_array(&TLVTag::Context(3))?;
        for path in paths {
            AttrPath::from_gp(path).to_tlv(&TLVTag::Anonymous, &mut tw)?;
        }
        tw.end_container()?;
        tw.bool(&TLVTag::Context(7), false)?;
        tw.end_container()?;

        self.arm();
        Ok(MsgAction::Respond(OpCode::SubscribeRequest.meta()))
    }

    fn arm(&mut self) {
        self.state = State::AwaitingInitialReport;
        self.subs_id = None;
        self.current_list = None;
        self.finished = false;
    }

    /// Handle a message from the publisher. The ack or follow-up payload,
    /// if any, is written into `wb`.
    pub fn handle<D: ReadClientDelegate>(
        &mut self,
        delegate: &mut D,
        opcode: OpCode,
        payload: &[u8],
        wb: &mut WriteBuf,
    ) -> Result<MsgAction, Error> {
        match opcode {
            OpCode::ReportData => self.report_data(delegate, payload, wb),
            OpCode::SubscribeResponse => self.subscribe_response(delegate, payload),
            OpCode::StatusResponse => {
                let resp = StatusResp::from_tlv(&TLVElement::root(payload)?)?;
                warn!("ReadClient: publisher replied with {:?}", resp.status);
                self.fail(delegate, ErrorCode::Failure.into());

                Ok(MsgAction::Close)
            }
            _ => {
                self.fail(delegate, ErrorCode::InvalidOpcode.into());
                Ok(MsgAction::Close)
            }
        }
    }

    /// The owning session went away. Completion callbacks still fire, once.
    pub fn on_session_teardown<D: ReadClientDelegate>(&mut self, delegate: &mut D) {
        if !matches!(self.state, State::Idle) {
            self.fail(delegate, ErrorCode::NoSession.into());
        }
    }

    fn report_data<D: ReadClientDelegate>(
        &mut self,
        delegate: &mut D,
        payload: &[u8],
        wb: &mut WriteBuf,
    ) -> Result<MsgAction, Error> {
        match self.state {
            State::AwaitingInitialReport
            | State::AwaitingSubsequentReport
            | State::SubscriptionActive => (),
            State::Idle | State::AwaitingSubscribeResponse => {
                self.fail(delegate, ErrorCode::InvalidState.into());
                return Ok(MsgAction::Close);
            }
        }

        let root = TLVElement::root(payload)?;

        let report_subs_id = root
            .find_ctx_opt(ReportDataTag::SubscriptionId as u8)?
            .map(|e| e.u32())
            .transpose()?;

        if matches!(self.state, State::SubscriptionActive) && report_subs_id != self.subs_id {
            warn!(
                "ReadClient: report for foreign subscription {:?}",
                report_subs_id
            );
            StatusResp::write(wb, IMStatusCode::InvalidSubscription)?;
            return Ok(MsgAction::RespondAndClose(OpCode::StatusResponse.meta()));
        }

        if matches!(self.state, State::AwaitingInitialReport) {
            // The prime report announces the subscription id
            self.subs_id = report_subs_id;
        }

        if let Err(e) = self.deliver_reports(delegate, &root) {
            self.fail(delegate, e);
            StatusResp::write(wb, IMStatusCode::InvalidAction)?;
            return Ok(MsgAction::RespondAndClose(OpCode::StatusResponse.meta()));
        }

        let more = root
            .find_ctx_opt(ReportDataTag::MoreChunkedMsgs as u8)?
            .map(|e| e.bool())
            .transpose()?
            .unwrap_or(false);

        StatusResp::write(wb, IMStatusCode::Success)?;

        if more {
            if !matches!(self.state, State::SubscriptionActive) {
                self.state = State::AwaitingSubsequentReport;
            }

            return Ok(MsgAction::Respond(OpCode::StatusResponse.meta()));
        }

        if self.current_list.is_some() {
            // The final chunk may not leave a list dangling
            self.current_list = None;
        }

        if matches!(self.state, State::SubscriptionActive) {
            // Ack closes this report exchange; the subscription lives on
            return Ok(MsgAction::RespondAndClose(OpCode::StatusResponse.meta()));
        }

        if self.subs_id.is_some() {
            // Prime report done; the subscribe response follows our ack
            self.state = State::AwaitingSubscribeResponse;
            return Ok(MsgAction::Respond(OpCode::StatusResponse.meta()));
        }

        self.state = State::Idle;
        self.finish(delegate);

        Ok(MsgAction::RespondAndClose(OpCode::StatusResponse.meta()))
    }

    fn subscribe_response<D: ReadClientDelegate>(
        &mut self,
        delegate: &mut D,
        payload: &[u8],
    ) -> Result<MsgAction, Error> {
        if !matches!(self.state, State::AwaitingSubscribeResponse) {
            self.fail(delegate, ErrorCode::InvalidState.into());
            return Ok(MsgAction::Close);
        }

        let resp = SubscribeResp::from_tlv(&TLVElement::root(payload)?)?;

        if self.subs_id.is_some() && self.subs_id != Some(resp.subs_id) {
            self.fail(delegate, ErrorCode::InvalidData.into());
            return Ok(MsgAction::Close);
        }

        debug!(
            "ReadClient: subscription {} established, max interval {}s",
            resp.subs_id, resp.max_int
        );

        self.subs_id = Some(resp.subs_id);
        self.state = State::SubscriptionActive;
        delegate.on_subscription_established(resp.subs_id, resp.max_int);

        Ok(MsgAction::Close)
    }

    fn deliver_reports<D: ReadClientDelegate>(
        &mut self,
        delegate: &mut D,
        root: &TLVElement,
    ) -> Result<(), Error> {
        let Some(reports) = root.find_ctx_opt(ReportDataTag::AttributeReports as u8)? else {
            return Ok(());
        };

        for report in reports.container_iter()? {
            match AttrResp::from_tlv(&report?)? {
                AttrResp::Data(data) => {
                    self.check_list_order(&data.path, &data.data)?;
                    delegate.on_attr_data(&data.path, &data.data)?;
                }
                AttrResp::Status(status) => {
                    self.current_list = None;
                    delegate.on_attr_status(&status);
                }
            }
        }

        Ok(())
    }

    /// List elements must arrive after their empty-list marker, at strictly
    /// increasing indices with no duplicates and no gaps, possibly spread
    /// across chunks.
    fn check_list_order(&mut self, path: &AttrPath, data: &TLVElement) -> Result<(), Error> {
        match path.list_index {
            None => {
                self.current_list = None;

                // An empty array is the marker opening a chunked list
                if let Ok(iter) = data.container_iter() {
                    if iter.count() == 0 {
                        self.current_list = Some((path.to_gp(), 0));
                    }
                }

                Ok(())
            }
            Some(Nullable::Some(index)) => {
                let Some((gp, expected)) = self.current_list else {
                    warn!("ReadClient: list element with no preceding marker");
                    return Err(ErrorCode::InvalidData.into());
                };

                if gp != path.to_gp() || index != expected {
                    warn!(
                        "ReadClient: list element out of order (index {}, expected {})",
                        index, expected
                    );
                    return Err(ErrorCode::InvalidData.into());
                }

                self.current_list = Some((gp, expected + 1));
                Ok(())
            }
            // A null index is an append/delete op in a write, not a report
            Some(Nullable::Null) => Err(ErrorCode::InvalidData.into()),
        }
    }

    fn fail<D: ReadClientDelegate>(&mut self, delegate: &mut D, err: Error) {
        self.state = State::Idle;
        self.current_list = None;

        if !self.finished {
            self.finished = true;
            delegate.on_error(err);
            delegate.on_done();
        }
    }

    fn finish<D: ReadClientDelegate>(&mut self, delegate: &mut D) {
        if !self.finished {
            self.finished = true;
            delegate.on_done();
        }
    }
}

impl Default for ReadClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::im::messages::{AttrDataTag, AttrRespTag};
    use crate::im::GenericPath;

    const PATH: GenericPath = GenericPath::new(Some(1), Some(6), Some(1));

    #[derive(Default)]
    struct TestDelegate {
        values: heapless::Vec<(Option<Nullable<u16>>, u32), 32>,
        statuses: usize,
        errors: usize,
        dones: usize,
        established: Option<(u32, u16)>,
    }

    impl ReadClientDelegate for TestDelegate {
        fn on_attr_data(&mut self, path: &AttrPath, data: &TLVElement) -> Result<(), Error> {
            let value = if data.container_iter().is_ok() {
                // The empty-list marker
                0
            } else {
                data.u32()?
            };
            self.values
                .push((path.list_index.clone(), value))
                .map_err(|_| ErrorCode::NoSpace)?;

            Ok(())
        }

        fn on_attr_status(&mut self, _status: &AttrStatus) {
            self.statuses += 1;
        }

        fn on_subscription_established(&mut self, id: SubscriptionId, max_int_secs: u16) {
            self.established = Some((id, max_int_secs));
        }

        fn on_error(&mut self, _err: Error) {
            self.errors += 1;
        }

        fn on_done(&mut self) {
            self.dones += 1;
        }
    }

    fn data_entry(
        tw: &mut TLVWriter,
        list_index: Option<Nullable<u16>>,
        value: Option<u32>,
    ) {
        tw.start_struct(&TLVTag::Anonymous).unwrap();
        tw.start_struct(&TLVTag::Context(AttrRespTag::Data as u8))
            .unwrap();
        tw.u32(&TLVTag::Context(AttrDataTag::DataVer as u8), 1)
            .unwrap();

        AttrPath {
            list_index,
            ..AttrPath::from_gp(&PATH)
        }
        .to_tlv(&TLVTag::Context(AttrDataTag::Path as u8), tw)
        .unwrap();

        match value {
            Some(v) => tw
                .u32(&TLVTag::Context(AttrDataTag::Data as u8), v)
                .unwrap(),
            None => {
                // Empty array: the list marker
                tw.start_array(&TLVTag::Context(AttrDataTag::Data as u8))
                    .unwrap();
                tw.end_container().unwrap();
            }
        }

        tw.end_container().unwrap();
        tw.end_container().unwrap();
    }

    /// Build one ReportData chunk carrying the given list entries.
    fn report(
        buf: &mut [u8],
        subs_id: Option<u32>,
        entries: &[(Option<Nullable<u16>>, Option<u32>)],
        more: bool,
    ) -> usize {
        let mut wb = WriteBuf::new(buf);
        let mut tw = TLVWriter::new(&mut wb);
        tw.start_struct(&TLVTag::Anonymous).unwrap();
        if let Some(id) = subs_id {
            tw.u32(&TLVTag::Context(ReportDataTag::SubscriptionId as u8), id)
                .unwrap();
        }
        tw.start_array(&TLVTag::Context(ReportDataTag::AttributeReports as u8))
            .unwrap();
        for (list_index, value) in entries {
            data_entry(&mut tw, list_index.clone(), *value);
        }
        tw.end_container().unwrap();
        if more {
            tw.bool(&TLVTag::Context(ReportDataTag::MoreChunkedMsgs as u8), true)
                .unwrap();
        }
        tw.end_container().unwrap();
        wb.as_slice().len()
    }

    fn subscribe_response(buf: &mut [u8], subs_id: u32, max_int: u16) -> usize {
        let mut wb = WriteBuf::new(buf);
        SubscribeResp::write(&mut wb, subs_id, max_int).unwrap();
        wb.as_slice().len()
    }

    fn started_client() -> ReadClient {
        let mut client = ReadClient::new();
        let mut req = [0; 128];
        let mut wb = WriteBuf::new(&mut req);
        client.start_read(&[PATH], false, &mut wb).unwrap();
        client
    }

    #[test]
    fn chunked_list_reassembles_in_order() {
        let mut client = started_client();
        let mut delegate = TestDelegate::default();

        // Chunk 1: marker + elements 0 and 1; chunk 2: elements 2 and 3
        let mut chunk = [0; 256];
        let len = report(
            &mut chunk,
            None,
            &[
                (None, None),
                (Some(Nullable::Some(0)), Some(10)),
                (Some(Nullable::Some(1)), Some(11)),
            ],
            true,
        );

        let mut ack = [0; 32];
        let mut wb = WriteBuf::new(&mut ack);
        let action = client
            .handle(&mut delegate, OpCode::ReportData, &chunk[..len], &mut wb)
            .unwrap();
        assert!(matches!(
            action,
            MsgAction::Respond(meta) if meta.proto_opcode == OpCode::StatusResponse as u8
        ));
        assert_eq!(delegate.dones, 0);

        let len = report(
            &mut chunk,
            None,
            &[
                (Some(Nullable::Some(2)), Some(12)),
                (Some(Nullable::Some(3)), Some(13)),
            ],
            false,
        );

        let mut wb = WriteBuf::new(&mut ack);
        let action = client
            .handle(&mut delegate, OpCode::ReportData, &chunk[..len], &mut wb)
            .unwrap();
        assert!(matches!(
            action,
            MsgAction::RespondAndClose(meta)
                if meta.proto_opcode == OpCode::StatusResponse as u8
        ));

        // All four elements, in order, exactly once; no errors, one done
        let elements: heapless::Vec<u32, 8> = delegate
            .values
            .iter()
            .filter(|(idx, _)| idx.is_some())
            .map(|(_, v)| *v)
            .collect();
        assert_eq!(elements.as_slice(), &[10, 11, 12, 13]);
        assert_eq!(delegate.errors, 0);
        assert_eq!(delegate.dones, 1);
        assert!(client.is_idle());
    }

    #[test]
    fn gap_in_list_indices_fails_once() {
        let mut client = started_client();
        let mut delegate = TestDelegate::default();

        let mut chunk = [0; 256];
        let len = report(
            &mut chunk,
            None,
            &[
                (None, None),
                (Some(Nullable::Some(0)), Some(10)),
                (Some(Nullable::Some(2)), Some(12)),
            ],
            false,
        );

        let mut ack = [0; 32];
        let mut wb = WriteBuf::new(&mut ack);
        let action = client
            .handle(&mut delegate, OpCode::ReportData, &chunk[..len], &mut wb)
            .unwrap();
        assert!(matches!(action, MsgAction::RespondAndClose(_)));

        let resp = StatusResp::from_tlv(&TLVElement::root(wb.as_slice()).unwrap()).unwrap();
        assert_eq!(resp.status, IMStatusCode::InvalidAction);

        assert_eq!(delegate.errors, 1);
        assert_eq!(delegate.dones, 1);

        // Already failed; a teardown must not notify again
        client.on_session_teardown(&mut delegate);
        assert_eq!(delegate.errors, 1);
        assert_eq!(delegate.dones, 1);
    }

    #[test]
    fn duplicate_list_index_fails() {
        let mut client = started_client();
        let mut delegate = TestDelegate::default();

        let mut chunk = [0; 256];
        let len = report(
            &mut chunk,
            None,
            &[
                (None, None),
                (Some(Nullable::Some(0)), Some(10)),
                (Some(Nullable::Some(0)), Some(10)),
            ],
            false,
        );

        let mut ack = [0; 32];
        let mut wb = WriteBuf::new(&mut ack);
        client
            .handle(&mut delegate, OpCode::ReportData, &chunk[..len], &mut wb)
            .unwrap();

        assert_eq!(delegate.errors, 1);
        assert_eq!(delegate.dones, 1);
    }

    #[test]
    fn subscription_lifecycle() {
        let mut client = ReadClient::new();
        let mut delegate = TestDelegate::default();

        let mut req = [0; 128];
        let mut wb = WriteBuf::new(&mut req);
        let action = client.start_subscribe(&[PATH], 12, 40, &mut wb).unwrap();
        assert!(matches!(
            action,
            MsgAction::Respond(meta) if meta.proto_opcode == OpCode::SubscribeRequest as u8
        ));

        // Prime report carries the subscription id
        let mut chunk = [0; 256];
        let len = report(&mut chunk, Some(77), &[(None, None)], false);

        let mut ack = [0; 32];
        let mut wb = WriteBuf::new(&mut ack);
        let action = client
            .handle(&mut delegate, OpCode::ReportData, &chunk[..len], &mut wb)
            .unwrap();
        assert!(matches!(
            action,
            MsgAction::Respond(meta) if meta.proto_opcode == OpCode::StatusResponse as u8
        ));

        // Subscribe response confirms the id and the decided interval
        let mut resp = [0; 64];
        let len = subscribe_response(&mut resp, 77, 15);
        let action = client
            .handle(&mut delegate, OpCode::SubscribeResponse, &resp[..len], &mut wb)
            .unwrap();
        assert!(matches!(action, MsgAction::Close));
        assert_eq!(delegate.established, Some((77, 15)));
        assert!(client.is_subscription());

        // A change report on the active subscription is delivered and the
        // report exchange closed with an ack
        let len = report(
            &mut chunk,
            Some(77),
            &[(None, None), (Some(Nullable::Some(0)), Some(42))],
            false,
        );
        let mut wb = WriteBuf::new(&mut ack);
        let action = client
            .handle(&mut delegate, OpCode::ReportData, &chunk[..len], &mut wb)
            .unwrap();
        assert!(matches!(
            action,
            MsgAction::RespondAndClose(meta)
                if meta.proto_opcode == OpCode::StatusResponse as u8
        ));
        assert!(client.is_subscription());

        // A report for some other subscription is refused
        let len = report(&mut chunk, Some(78), &[], false);
        let mut wb = WriteBuf::new(&mut ack);
        client
            .handle(&mut delegate, OpCode::ReportData, &chunk[..len], &mut wb)
            .unwrap();
        let resp = StatusResp::from_tlv(&TLVElement::root(wb.as_slice()).unwrap()).unwrap();
        assert_eq!(resp.status, IMStatusCode::InvalidSubscription);

        // Session teardown notifies exactly once
        client.on_session_teardown(&mut delegate);
        client.on_session_teardown(&mut delegate);
        assert_eq!(delegate.errors, 1);
        assert_eq!(delegate.dones, 1);
    }
}
