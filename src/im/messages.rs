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

//! TLV serde for the Interaction Model message structures (the `...IB`
//! blocks of the Matter Core spec) and accessors over the request
//! messages, which are kept as raw TLV and picked apart lazily.

use num::FromPrimitive;

use crate::error::{Error, ErrorCode};
use crate::tlv::{Nullable, TLVContainerIter, TLVElement, TLVTag, TLVWriter};
use crate::utils::writebuf::WriteBuf;

use super::{
    AttrId, ClusterId, CmdId, CommandRef, EndptId, GenericPath, IMStatusCode, ListIndex,
};

/// Tags of the `ReportDataMessage` IM struct.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum ReportDataTag {
    SubscriptionId = 0,
    AttributeReports = 1,
    _EventReport = 2,
    MoreChunkedMsgs = 3,
    SupressResponse = 4,
}

/// Tags of the `AttributePathIB` list.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum AttrPathTag {
    TagCompression = 0,
    Node = 1,
    Endpoint = 2,
    Cluster = 3,
    Attr = 4,
    ListIndex = 5,
}

/// Tags of the `AttributeDataIB` struct.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum AttrDataTag {
    DataVer = 0,
    Path = 1,
    Data = 2,
}

/// Tags of the `AttributeReportIB` struct.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum AttrRespTag {
    Status = 0,
    Data = 1,
}

/// Tags of the `ReadRequestMessage` struct.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum ReadReqTag {
    AttrRequests = 0,
    EventRequests = 1,
    EventFilters = 2,
    FabricFiltered = 3,
    DataVersionFilters = 4,
}

/// Tags of the `SubscribeRequestMessage` struct.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum SubscribeReqTag {
    KeepSubs = 0,
    MinIntFloor = 1,
    MaxIntCeil = 2,
    AttrRequests = 3,
    EventRequests = 4,
    EventFilters = 5,
    FabricFiltered = 7,
    DataVersionFilters = 8,
}

/// Tags of the `SubscribeResponseMessage` struct.
///
/// The context tags are discontiguous per the Matter Core spec.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum SubscribeRespTag {
    SubsId = 0,
    MaxInt = 2,
}

/// Tags of the `WriteRequestMessage` struct.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum WriteReqTag {
    SuppressResponse = 0,
    TimedRequest = 1,
    WriteRequests = 2,
    MoreChunked = 3,
}

/// Tags of the `WriteResponseMessage` struct.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum WriteRespTag {
    WriteResponses = 0,
}

/// Tags of the `CommandPathIB` list.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum CmdPathTag {
    Endpoint = 0,
    Cluster = 1,
    Cmd = 2,
}

/// Tags of the `CommandDataIB` struct.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum CmdDataTag {
    Path = 0,
    Data = 1,
    Ref = 2,
}

/// Tags of the `InvokeResponseIB` struct.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum CmdRespTag {
    Cmd = 0,
    Status = 1,
}

/// Tags of the `InvokeRequestMessage` struct.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum InvReqTag {
    SupressResponse = 0,
    TimedReq = 1,
    InvokeRequests = 2,
}

/// Tags of the `InvokeResponseMessage` struct.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum InvRespTag {
    SupressResponse = 0,
    InvokeResponses = 1,
}

fn ctx(tag: u8) -> TLVTag {
    TLVTag::Context(tag)
}

/// A path to an attribute in the Interaction Model.
///
/// Corresponds to the `AttributePathIB` TLV list.
#[derive(Default, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AttrPath {
    pub tag_compression: Option<bool>,
    pub node: Option<u64>,
    pub endpoint: Option<EndptId>,
    pub cluster: Option<ClusterId>,
    pub attr: Option<AttrId>,
    pub list_index: Option<Nullable<ListIndex>>,
}

impl AttrPath {
    pub const fn from_gp(path: &GenericPath) -> Self {
        Self {
            tag_compression: None,
            node: None,
            endpoint: path.endpoint,
            cluster: path.cluster,
            attr: path.leaf,
            list_index: None,
        }
    }

    pub const fn to_gp(&self) -> GenericPath {
        GenericPath::new(self.endpoint, self.cluster, self.attr)
    }

    pub fn from_tlv(elem: &TLVElement) -> Result<Self, Error> {
        let mut path = Self::default();

        for child in elem.container_iter()? {
            let child = child?;
            let TLVTag::Context(tag) = child.tag else {
                Err(ErrorCode::InvalidData)?
            };

            match tag {
                x if x == AttrPathTag::TagCompression as u8 => {
                    path.tag_compression = Some(child.bool()?)
                }
                x if x == AttrPathTag::Node as u8 => path.node = Some(child.u64()?),
                x if x == AttrPathTag::Endpoint as u8 => path.endpoint = Some(child.u16()?),
                x if x == AttrPathTag::Cluster as u8 => path.cluster = Some(child.u32()?),
                x if x == AttrPathTag::Attr as u8 => path.attr = Some(child.u32()?),
                x if x == AttrPathTag::ListIndex as u8 => {
                    path.list_index = Some(if child.is_null() {
                        Nullable::Null
                    } else {
                        Nullable::Some(child.u16()?)
                    });
                }
                _ => (),
            }
        }

        Ok(path)
    }

    pub fn to_tlv(&self, tag: &TLVTag, tw: &mut TLVWriter) -> Result<(), Error> {
        tw.start_list(tag)?;
        if let Some(v) = self.tag_compression {
            tw.bool(&ctx(AttrPathTag::TagCompression as u8), v)?;
        }
        if let Some(v) = self.node {
            tw.u64(&ctx(AttrPathTag::Node as u8), v)?;
        }
        if let Some(v) = self.endpoint {
            tw.u16(&ctx(AttrPathTag::Endpoint as u8), v)?;
        }
        if let Some(v) = self.cluster {
            tw.u32(&ctx(AttrPathTag::Cluster as u8), v)?;
        }
        if let Some(v) = self.attr {
            tw.u32(&ctx(AttrPathTag::Attr as u8), v)?;
        }
        match &self.list_index {
            Some(Nullable::Null) => tw.null(&ctx(AttrPathTag::ListIndex as u8))?,
            Some(Nullable::Some(v)) => tw.u16(&ctx(AttrPathTag::ListIndex as u8), *v)?,
            None => (),
        }
        tw.end_container()
    }
}

/// An IM status with an optional cluster-specific status code.
///
/// Corresponds to the `StatusIB` struct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Status {
    pub status: IMStatusCode,
    pub cluster_status: Option<u16>,
}

impl Status {
    pub const fn new(status: IMStatusCode, cluster_status: Option<u16>) -> Self {
        Self {
            status,
            cluster_status,
        }
    }

    pub fn from_tlv(elem: &TLVElement) -> Result<Self, Error> {
        let status = FromPrimitive::from_u16(elem.find_ctx(0)?.u16()?)
            .ok_or(ErrorCode::InvalidData)?;
        let cluster_status = match elem.find_ctx_opt(1)? {
            Some(cs) => Some(cs.u16()?),
            None => None,
        };

        Ok(Self {
            status,
            cluster_status,
        })
    }

    pub fn to_tlv(&self, tag: &TLVTag, tw: &mut TLVWriter) -> Result<(), Error> {
        tw.start_struct(tag)?;
        tw.u16(&ctx(0), self.status as u16)?;
        if let Some(cs) = self.cluster_status {
            tw.u16(&ctx(1), cs)?;
        }
        tw.end_container()
    }
}

/// A status response for an attribute.
///
/// Corresponds to the `AttributeStatusIB` struct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttrStatus {
    pub path: AttrPath,
    pub status: Status,
}

impl AttrStatus {
    pub const fn new(path: AttrPath, status: IMStatusCode, cluster_status: Option<u16>) -> Self {
        Self {
            path,
            status: Status::new(status, cluster_status),
        }
    }

    pub fn from_tlv(elem: &TLVElement) -> Result<Self, Error> {
        Ok(Self {
            path: AttrPath::from_tlv(&elem.find_ctx(0)?)?,
            status: Status::from_tlv(&elem.find_ctx(1)?)?,
        })
    }

    pub fn to_tlv(&self, tag: &TLVTag, tw: &mut TLVWriter) -> Result<(), Error> {
        tw.start_struct(tag)?;
        self.path.to_tlv(&ctx(0), tw)?;
        self.status.to_tlv(&ctx(1), tw)?;
        tw.end_container()
    }
}

/// A data report or write request for one attribute.
///
/// Corresponds to the `AttributeDataIB` struct.
#[derive(Debug, Clone, PartialEq)]
pub struct AttrData<'a> {
    /// The cluster dataver
    pub data_ver: Option<u32>,
    pub path: AttrPath,
    /// The attribute value, kept as raw TLV.
    pub data: TLVElement<'a>,
}

impl<'a> AttrData<'a> {
    pub const fn new(data_ver: Option<u32>, path: AttrPath, data: TLVElement<'a>) -> Self {
        Self {
            data_ver,
            path,
            data,
        }
    }

    pub fn from_tlv(elem: &TLVElement<'a>) -> Result<Self, Error> {
        let data_ver = match elem.find_ctx_opt(AttrDataTag::DataVer as u8)? {
            Some(dv) => Some(dv.u32()?),
            None => None,
        };

        Ok(Self {
            data_ver,
            path: AttrPath::from_tlv(&elem.find_ctx(AttrDataTag::Path as u8)?)?,
            data: elem.find_ctx(AttrDataTag::Data as u8)?,
        })
    }

    pub fn to_tlv(&self, tag: &TLVTag, tw: &mut TLVWriter) -> Result<(), Error> {
        tw.start_struct(tag)?;
        if let Some(dv) = self.data_ver {
            tw.u32(&ctx(AttrDataTag::DataVer as u8), dv)?;
        }
        self.path.to_tlv(&ctx(AttrDataTag::Path as u8), tw)?;
        tw.copy_element(&ctx(AttrDataTag::Data as u8), &self.data)?;
        tw.end_container()
    }
}

/// One entry of an attribute report: either data or a status.
///
/// Corresponds to the `AttributeReportIB` struct.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrResp<'a> {
    Status(AttrStatus),
    Data(AttrData<'a>),
}

impl<'a> AttrResp<'a> {
    pub fn from_tlv(elem: &TLVElement<'a>) -> Result<Self, Error> {
        if let Some(status) = elem.find_ctx_opt(AttrRespTag::Status as u8)? {
            Ok(Self::Status(AttrStatus::from_tlv(&status)?))
        } else {
            Ok(Self::Data(AttrData::from_tlv(
                &elem.find_ctx(AttrRespTag::Data as u8)?,
            )?))
        }
    }

    pub fn to_tlv(&self, tag: &TLVTag, tw: &mut TLVWriter) -> Result<(), Error> {
        tw.start_struct(tag)?;
        match self {
            Self::Status(status) => status.to_tlv(&ctx(AttrRespTag::Status as u8), tw)?,
            Self::Data(data) => data.to_tlv(&ctx(AttrRespTag::Data as u8), tw)?,
        }
        tw.end_container()
    }
}

impl<'a> From<AttrData<'a>> for AttrResp<'a> {
    fn from(value: AttrData<'a>) -> Self {
        Self::Data(value)
    }
}

impl From<AttrStatus> for AttrResp<'_> {
    fn from(value: AttrStatus) -> Self {
        Self::Status(value)
    }
}

/// A path to a command.
///
/// Corresponds to the `CommandPathIB` TLV list.
#[derive(Default, Debug, Clone, PartialEq, Eq, Hash)]
pub struct CmdPath {
    pub endpoint: Option<EndptId>,
    pub cluster: Option<ClusterId>,
    pub cmd: Option<CmdId>,
}

impl CmdPath {
    pub const fn new(
        endpoint: Option<EndptId>,
        cluster: Option<ClusterId>,
        cmd: Option<CmdId>,
    ) -> Self {
        Self {
            endpoint,
            cluster,
            cmd,
        }
    }

    pub const fn to_gp(&self) -> GenericPath {
        GenericPath::new(self.endpoint, self.cluster, self.cmd)
    }

    pub fn from_tlv(elem: &TLVElement) -> Result<Self, Error> {
        let mut path = Self::default();

        for child in elem.container_iter()? {
            let child = child?;
            let TLVTag::Context(tag) = child.tag else {
                Err(ErrorCode::InvalidData)?
            };

            match tag {
                x if x == CmdPathTag::Endpoint as u8 => path.endpoint = Some(child.u16()?),
                x if x == CmdPathTag::Cluster as u8 => path.cluster = Some(child.u32()?),
                x if x == CmdPathTag::Cmd as u8 => path.cmd = Some(child.u32()?),
                _ => (),
            }
        }

        Ok(path)
    }

    pub fn to_tlv(&self, tag: &TLVTag, tw: &mut TLVWriter) -> Result<(), Error> {
        tw.start_list(tag)?;
        if let Some(v) = self.endpoint {
            tw.u16(&ctx(CmdPathTag::Endpoint as u8), v)?;
        }
        if let Some(v) = self.cluster {
            tw.u32(&ctx(CmdPathTag::Cluster as u8), v)?;
        }
        if let Some(v) = self.cmd {
            tw.u32(&ctx(CmdPathTag::Cmd as u8), v)?;
        }
        tw.end_container()
    }
}

/// Status of one command invocation.
///
/// Corresponds to the `CommandStatusIB` struct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CmdStatus {
    pub path: CmdPath,
    pub status: Status,
    pub cmd_ref: Option<CommandRef>,
}

impl CmdStatus {
    pub const fn new(
        path: CmdPath,
        status: IMStatusCode,
        cluster_status: Option<u16>,
        cmd_ref: Option<CommandRef>,
    ) -> Self {
        Self {
            path,
            status: Status::new(status, cluster_status),
            cmd_ref,
        }
    }

    pub fn from_tlv(elem: &TLVElement) -> Result<Self, Error> {
        let cmd_ref = match elem.find_ctx_opt(2)? {
            Some(r) => Some(r.u16()?),
            None => None,
        };

        Ok(Self {
            path: CmdPath::from_tlv(&elem.find_ctx(0)?)?,
            status: Status::from_tlv(&elem.find_ctx(1)?)?,
            cmd_ref,
        })
    }

    pub fn to_tlv(&self, tag: &TLVTag, tw: &mut TLVWriter) -> Result<(), Error> {
        tw.start_struct(tag)?;
        self.path.to_tlv(&ctx(0), tw)?;
        self.status.to_tlv(&ctx(1), tw)?;
        if let Some(r) = self.cmd_ref {
            tw.u16(&ctx(2), r)?;
        }
        tw.end_container()
    }
}

/// Data of one command invocation.
///
/// Corresponds to the `CommandDataIB` struct. The `Ref` field identifies
/// the command within a batch invoke.
#[derive(Debug, Clone, PartialEq)]
pub struct CmdData<'a> {
    pub path: CmdPath,
    pub data: Option<TLVElement<'a>>,
    pub cmd_ref: Option<CommandRef>,
}

impl<'a> CmdData<'a> {
    pub const fn new(
        path: CmdPath,
        data: Option<TLVElement<'a>>,
        cmd_ref: Option<CommandRef>,
    ) -> Self {
        Self {
            path,
            data,
            cmd_ref,
        }
    }

    pub fn from_tlv(elem: &TLVElement<'a>) -> Result<Self, Error> {
        let cmd_ref = match elem.find_ctx_opt(CmdDataTag::Ref as u8)? {
            Some(r) => Some(r.u16()?),
            None => None,
        };

        Ok(Self {
            path: CmdPath::from_tlv(&elem.find_ctx(CmdDataTag::Path as u8)?)?,
            data: elem.find_ctx_opt(CmdDataTag::Data as u8)?,
            cmd_ref,
        })
    }

    pub fn to_tlv(&self, tag: &TLVTag, tw: &mut TLVWriter) -> Result<(), Error> {
        tw.start_struct(tag)?;
        self.path.to_tlv(&ctx(CmdDataTag::Path as u8), tw)?;
        if let Some(data) = &self.data {
            tw.copy_element(&ctx(CmdDataTag::Data as u8), data)?;
        }
        if let Some(r) = self.cmd_ref {
            tw.u16(&ctx(CmdDataTag::Ref as u8), r)?;
        }
        tw.end_container()
    }
}

/// One entry of an invoke response: generated-command data or a status.
///
/// Corresponds to the `InvokeResponseIB` struct.
#[derive(Debug, Clone, PartialEq)]
pub enum CmdResp<'a> {
    Cmd(CmdData<'a>),
    Status(CmdStatus),
}

impl<'a> CmdResp<'a> {
    pub fn from_tlv(elem: &TLVElement<'a>) -> Result<Self, Error> {
        if let Some(cmd) = elem.find_ctx_opt(CmdRespTag::Cmd as u8)? {
            Ok(Self::Cmd(CmdData::from_tlv(&cmd)?))
        } else {
            Ok(Self::Status(CmdStatus::from_tlv(
                &elem.find_ctx(CmdRespTag::Status as u8)?,
            )?))
        }
    }

    pub fn to_tlv(&self, tag: &TLVTag, tw: &mut TLVWriter) -> Result<(), Error> {
        tw.start_struct(tag)?;
        match self {
            Self::Cmd(data) => data.to_tlv(&ctx(CmdRespTag::Cmd as u8), tw)?,
            Self::Status(status) => status.to_tlv(&ctx(CmdRespTag::Status as u8), tw)?,
        }
        tw.end_container()
    }
}

/// A status response message.
///
/// Corresponds to the `StatusResponseMessage` struct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatusResp {
    pub status: IMStatusCode,
}

impl StatusResp {
    pub fn write(wb: &mut WriteBuf, status: IMStatusCode) -> Result<(), Error> {
        let mut tw = TLVWriter::new(wb);
        tw.start_struct(&TLVTag::Anonymous)?;
        tw.u16(&ctx(0), status as u16)?;
        tw.end_container()
    }

    pub fn from_tlv(elem: &TLVElement) -> Result<Self, Error> {
        Ok(Self {
            status: FromPrimitive::from_u16(elem.find_ctx(0)?.u16()?)
                .ok_or(ErrorCode::InvalidData)?,
        })
    }
}

/// A subscription response message.
///
/// Corresponds to the `SubscribeResponseMessage` struct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscribeResp {
    pub subs_id: u32,
    pub max_int: u16,
}

impl SubscribeResp {
    pub fn write(wb: &mut WriteBuf, subs_id: u32, max_int: u16) -> Result<(), Error> {
        let mut tw = TLVWriter::new(wb);
        tw.start_struct(&TLVTag::Anonymous)?;
        tw.u32(&ctx(SubscribeRespTag::SubsId as u8), subs_id)?;
        tw.u16(&ctx(SubscribeRespTag::MaxInt as u8), max_int)?;
        tw.end_container()
    }

    pub fn from_tlv(elem: &TLVElement) -> Result<Self, Error> {
        Ok(Self {
            subs_id: elem.find_ctx(SubscribeRespTag::SubsId as u8)?.u32()?,
            max_int: elem.find_ctx(SubscribeRespTag::MaxInt as u8)?.u16()?,
        })
    }
}

/// A read request, kept as raw TLV and picked apart lazily.
///
/// Corresponds to the `ReadRequestMessage` struct.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadReq<'a>(TLVElement<'a>);

impl<'a> ReadReq<'a> {
    pub const fn new(element: TLVElement<'a>) -> Self {
        Self(element)
    }

    /// The requested attribute paths, if any.
    pub fn attr_requests(&self) -> Result<Option<TLVContainerIter<'a>>, Error> {
        match self.0.find_ctx_opt(ReadReqTag::AttrRequests as u8)? {
            Some(reqs) => Ok(Some(reqs.container_iter()?)),
            None => Ok(None),
        }
    }

    pub fn fabric_filtered(&self) -> Result<bool, Error> {
        self.0.find_ctx(ReadReqTag::FabricFiltered as u8)?.bool()
    }
}

/// A subscribe request, kept as raw TLV and picked apart lazily.
///
/// Corresponds to the `SubscribeRequestMessage` struct.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeReq<'a>(TLVElement<'a>);

impl<'a> SubscribeReq<'a> {
    pub const fn new(element: TLVElement<'a>) -> Self {
        Self(element)
    }

    pub fn keep_subs(&self) -> Result<bool, Error> {
        self.0.find_ctx(SubscribeReqTag::KeepSubs as u8)?.bool()
    }

    pub fn min_int_floor(&self) -> Result<u16, Error> {
        self.0.find_ctx(SubscribeReqTag::MinIntFloor as u8)?.u16()
    }

    pub fn max_int_ceil(&self) -> Result<u16, Error> {
        self.0.find_ctx(SubscribeReqTag::MaxIntCeil as u8)?.u16()
    }

    pub fn attr_requests(&self) -> Result<Option<TLVContainerIter<'a>>, Error> {
        match self.0.find_ctx_opt(SubscribeReqTag::AttrRequests as u8)? {
            Some(reqs) => Ok(Some(reqs.container_iter()?)),
            None => Ok(None),
        }
    }

    pub fn fabric_filtered(&self) -> Result<bool, Error> {
        self.0
            .find_ctx(SubscribeReqTag::FabricFiltered as u8)?
            .bool()
    }
}

/// A write request, kept as raw TLV and picked apart lazily.
///
/// Corresponds to the `WriteRequestMessage` struct.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReq<'a>(TLVElement<'a>);

impl<'a> WriteReq<'a> {
    pub const fn new(element: TLVElement<'a>) -> Self {
        Self(element)
    }

    pub fn suppress_response(&self) -> Result<bool, Error> {
        Ok(self
            .0
            .find_ctx_opt(WriteReqTag::SuppressResponse as u8)?
            .map(|e| e.bool())
            .transpose()?
            .unwrap_or(false))
    }

    pub fn timed_request(&self) -> Result<bool, Error> {
        Ok(self
            .0
            .find_ctx_opt(WriteReqTag::TimedRequest as u8)?
            .map(|e| e.bool())
            .transpose()?
            .unwrap_or(false))
    }

    /// The `AttrData` entries to write.
    pub fn write_requests(&self) -> Result<TLVContainerIter<'a>, Error> {
        self.0
            .find_ctx(WriteReqTag::WriteRequests as u8)?
            .container_iter()
    }
}

/// An invoke request, kept as raw TLV and picked apart lazily.
///
/// Corresponds to the `InvokeRequestMessage` struct.
#[derive(Debug, Clone, PartialEq)]
pub struct InvReq<'a>(TLVElement<'a>);

impl<'a> InvReq<'a> {
    pub const fn new(element: TLVElement<'a>) -> Self {
        Self(element)
    }

    pub fn suppress_response(&self) -> Result<bool, Error> {
        Ok(self
            .0
            .find_ctx_opt(InvReqTag::SupressResponse as u8)?
            .map(|e| e.bool())
            .transpose()?
            .unwrap_or(false))
    }

    pub fn timed_request(&self) -> Result<bool, Error> {
        Ok(self
            .0
            .find_ctx_opt(InvReqTag::TimedReq as u8)?
            .map(|e| e.bool())
            .transpose()?
            .unwrap_or(false))
    }

    /// The `CmdData` entries to dispatch.
    pub fn invoke_requests(&self) -> Result<Option<TLVContainerIter<'a>>, Error> {
        match self.0.find_ctx_opt(InvReqTag::InvokeRequests as u8)? {
            Some(reqs) => Ok(Some(reqs.container_iter()?)),
            None => Ok(None),
        }
    }
}

/// A timed request message.
///
/// Corresponds to the `TimedRequestMessage` struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimedReq {
    pub timeout_ms: u16,
}

impl TimedReq {
    pub fn from_tlv(elem: &TLVElement) -> Result<Self, Error> {
        Ok(Self {
            timeout_ms: elem.find_ctx(0)?.u16()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T, W, R>(write: W, read: R) -> T
    where
        W: FnOnce(&mut TLVWriter),
        R: FnOnce(&TLVElement) -> T,
    {
        let mut mem = [0; 256];
        let mut wb = WriteBuf::new(&mut mem);
        {
            let mut tw = TLVWriter::new(&mut wb);
            write(&mut tw);
        }
        let len = wb.as_slice().len();
        read(&TLVElement::root(&mem[..len]).unwrap())
    }

    #[test]
    fn attr_path_round_trip() {
        let path = AttrPath {
            tag_compression: None,
            node: None,
            endpoint: Some(1),
            cluster: Some(6),
            attr: Some(0),
            list_index: Some(Nullable::Null),
        };

        let parsed = round_trip(
            |tw| path.to_tlv(&TLVTag::Anonymous, tw).unwrap(),
            |elem| AttrPath::from_tlv(elem).unwrap(),
        );
        assert_eq!(parsed, path);
        assert!(parsed.list_index.unwrap().is_null());
    }

    #[test]
    fn attr_resp_status_vs_data() {
        let status = AttrResp::Status(AttrStatus::new(
            AttrPath::from_gp(&GenericPath::new(Some(1), Some(6), Some(0))),
            IMStatusCode::UnsupportedAttribute,
            None,
        ));

        let mut mem = [0; 256];
        let mut wb = WriteBuf::new(&mut mem);
        {
            let mut tw = TLVWriter::new(&mut wb);
            status.to_tlv(&TLVTag::Anonymous, &mut tw).unwrap();
        }
        let len = wb.as_slice().len();

        let parsed = AttrResp::from_tlv(&TLVElement::root(&mem[..len]).unwrap()).unwrap();
        let AttrResp::Status(parsed) = parsed else {
            panic!("expected a status");
        };
        assert_eq!(parsed.status.status, IMStatusCode::UnsupportedAttribute);
        assert_eq!(parsed.path.to_gp(), GenericPath::new(Some(1), Some(6), Some(0)));
    }

    #[test]
    fn cmd_data_carries_ref() {
        let mut mem = [0; 256];
        let mut wb = WriteBuf::new(&mut mem);
        {
            let mut tw = TLVWriter::new(&mut wb);
            tw.start_struct(&TLVTag::Anonymous).unwrap();
            CmdPath::new(Some(1), Some(6), Some(2))
                .to_tlv(&ctx(CmdDataTag::Path as u8), &mut tw)
                .unwrap();
            tw.u16(&ctx(CmdDataTag::Ref as u8), 7).unwrap();
            tw.end_container().unwrap();
        }
        let len = wb.as_slice().len();

        let parsed = CmdData::from_tlv(&TLVElement::root(&mem[..len]).unwrap()).unwrap();
        assert_eq!(parsed.cmd_ref, Some(7));
        assert_eq!(parsed.path.to_gp(), GenericPath::new(Some(1), Some(6), Some(2)));
        assert!(parsed.data.is_none());
    }

    #[test]
    fn subscribe_req_accessors() {
        let mut mem = [0; 256];
        let mut wb = WriteBuf::new(&mut mem);
        {
            let mut tw = TLVWriter::new(&mut wb);
            tw.start_struct(&TLVTag::Anonymous).unwrap();
            tw.bool(&ctx(SubscribeReqTag::KeepSubs as u8), false).unwrap();
            tw.u16(&ctx(SubscribeReqTag::MinIntFloor as u8), 12).unwrap();
            tw.u16(&ctx(SubscribeReqTag::MaxIntCeil as u8), 40).unwrap();
            tw.start_array(&ctx(SubscribeReqTag::AttrRequests as u8)).unwrap();
            AttrPath::from_gp(&GenericPath::new(Some(1), Some(6), None))
                .to_tlv(&TLVTag::Anonymous, &mut tw)
                .unwrap();
            tw.end_container().unwrap();
            tw.bool(&ctx(SubscribeReqTag::FabricFiltered as u8), true).unwrap();
            tw.end_container().unwrap();
        }
        let len = wb.as_slice().len();

        let root = TLVElement::root(&mem[..len]).unwrap();
        let req = SubscribeReq::new(root);
        assert_eq!(req.min_int_floor().unwrap(), 12);
        assert_eq!(req.max_int_ceil().unwrap(), 40);
        assert!(req.fabric_filtered().unwrap());

        let mut paths = req.attr_requests().unwrap().unwrap();
        let path = AttrPath::from_tlv(&paths.next().unwrap().unwrap()).unwrap();
        assert_eq!(path.to_gp(), GenericPath::new(Some(1), Some(6), None));
        assert!(paths.next().is_none());
    }
}
