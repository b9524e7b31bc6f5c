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

//! The data model seam: the IM engine serves reads, writes, and invokes
//! against anything implementing [`DataModelProvider`]. The engine owns the
//! wire protocol (chunking, batching, timed windows); the provider owns the
//! attribute and command semantics.

use crate::error::{Error, ErrorCode};
use crate::im::messages::{CmdDataTag, CmdPath, CmdRespTag};
use crate::im::report::AttributeValueEncoder;
use crate::im::{CmdId, CommandRef, DataVersion, EndptId, ClusterId, GenericPath};
use crate::tlv::{TLVElement, TLVTag, TLVWriter};

/// The application-side object the IM engine serves interactions against.
pub trait DataModelProvider {
    /// The current data version of the given cluster instance.
    fn data_version(&self, endpoint: EndptId, cluster: ClusterId) -> Result<DataVersion, Error>;

    /// Expand a possibly-wildcard attribute path into the concrete paths it
    /// covers, calling `f` once per path, in stable order.
    ///
    /// A concrete path must be validated and passed through; an unknown
    /// endpoint/cluster/attribute fails with the corresponding not-found
    /// error code.
    fn for_each_concrete(
        &self,
        path: &GenericPath,
        f: &mut dyn FnMut(GenericPath) -> Result<(), Error>,
    ) -> Result<(), Error>;

    /// Encode the value of one concrete attribute.
    ///
    /// A `NoSpace` failure from the encoder must be propagated untouched;
    /// it means the current report chunk is full, not that the read failed.
    fn read(
        &self,
        path: &GenericPath,
        fabric_filtered: bool,
        encoder: &mut AttributeValueEncoder,
    ) -> Result<(), Error>;

    /// Apply a write to one concrete attribute.
    fn write(&mut self, path: &GenericPath, data: &TLVElement) -> Result<(), Error>;

    /// Execute one command. Replying with response data is optional; when
    /// the provider does not, the engine reports a success status instead.
    fn invoke(
        &mut self,
        path: &CmdPath,
        data: Option<&TLVElement>,
        reply: &mut InvokeReply,
    ) -> Result<(), Error>;
}

/// Lets a command handler emit one response command into the invoke
/// response being assembled.
pub struct InvokeReply<'a, 'b, 'c> {
    tw: &'c mut TLVWriter<'a, 'b>,
    path: CmdPath,
    cmd_ref: Option<CommandRef>,
    replied: bool,
}

impl<'a, 'b, 'c> InvokeReply<'a, 'b, 'c> {
    pub(crate) fn new(
        tw: &'c mut TLVWriter<'a, 'b>,
        path: CmdPath,
        cmd_ref: Option<CommandRef>,
    ) -> Self {
        Self {
            tw,
            path,
            cmd_ref,
            replied: false,
        }
    }

    pub(crate) fn replied(&self) -> bool {
        self.replied
    }

    /// The path of the command being executed.
    pub fn path(&self) -> &CmdPath {
        &self.path
    }

    /// Write a response command carrying data, on the same endpoint and
    /// cluster as the request. At most one response per command.
    pub fn respond<F>(&mut self, cmd: CmdId, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut TLVWriter, &TLVTag) -> Result<(), Error>,
    {
        if self.replied {
            Err(ErrorCode::InvalidState)?;
        }

        self.tw.start_struct(&TLVTag::Anonymous)?;
        self.tw
            .start_struct(&TLVTag::Context(CmdRespTag::Cmd as u8))?;

        let resp_path = CmdPath::new(self.path.endpoint, self.path.cluster, Some(cmd));
        resp_path.to_tlv(&TLVTag::Context(CmdDataTag::Path as u8), self.tw)?;

        f(self.tw, &TLVTag::Context(CmdDataTag::Data as u8))?;

        if let Some(r) = self.cmd_ref {
            self.tw.u16(&TLVTag::Context(CmdDataTag::Ref as u8), r)?;
        }

        self.tw.end_container()?;
        self.tw.end_container()?;

        self.replied = true;

        Ok(())
    }
}
