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

//! Bounded, resumable encoding of attribute reports.
//!
//! Scalar attributes are all-or-nothing: a value that does not fit the
//! current message is rolled back and retried in the next chunk. List
//! attributes are chunked element-wise: an empty-list marker opens the
//! list, elements follow at increasing list indices, and a full buffer
//! suspends encoding at the recorded index so the next chunk resumes
//! exactly there.

use crate::error::{Error, ErrorCode};
use crate::tlv::{Nullable, TLVTag, TLVWriter};

use super::messages::{AttrDataTag, AttrPath, AttrRespTag};
use super::{DataVersion, GenericPath, ListIndex};

/// Where list encoding stands across chunk boundaries.
///
/// Lives in the read handler, not the encoder: the encoder is rebuilt per
/// chunk, the state survives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeEncodeState {
    /// Next list element index to encode; `None` when no list is being
    /// chunked.
    current_list_index: Option<ListIndex>,
    /// Set once the empty-list marker went out. From that point on, a
    /// failure other than an out-of-space suspension must fail the whole
    /// report; the list can no longer be silently dropped.
    marker_sent: bool,
}

impl AttributeEncodeState {
    pub fn is_chunking(&self) -> bool {
        self.current_list_index.is_some()
    }

    /// Whether a mid-report failure may still drop this attribute and
    /// degrade to a per-attribute status.
    pub fn allows_partial(&self) -> bool {
        !self.marker_sent
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// The encoder handed to the data model provider for one attribute read.
pub struct AttributeValueEncoder<'a, 'b, 'c> {
    tw: &'c mut TLVWriter<'a, 'b>,
    state: &'c mut AttributeEncodeState,
    path: GenericPath,
    data_ver: DataVersion,
}

impl<'a, 'b, 'c> AttributeValueEncoder<'a, 'b, 'c> {
    pub fn new(
        tw: &'c mut TLVWriter<'a, 'b>,
        state: &'c mut AttributeEncodeState,
        path: GenericPath,
        data_ver: DataVersion,
    ) -> Self {
        Self {
            tw,
            state,
            path,
            data_ver,
        }
    }

    /// The concrete path being encoded.
    pub fn path(&self) -> GenericPath {
        self.path
    }

    fn attr_path(&self, list_index: Option<Nullable<ListIndex>>) -> AttrPath {
        AttrPath {
            list_index,
            ..AttrPath::from_gp(&self.path)
        }
    }

    /// Open one `AttributeReportIB` with an `AttributeDataIB` inside,
    /// leaving the writer positioned at the `Data` field.
    fn open_report(&mut self, list_index: Option<Nullable<ListIndex>>) -> Result<(), Error> {
        self.tw.start_struct(&TLVTag::Anonymous)?;
        self.tw
            .start_struct(&TLVTag::Context(AttrRespTag::Data as u8))?;
        self.tw
            .u32(&TLVTag::Context(AttrDataTag::DataVer as u8), self.data_ver)?;
        self.attr_path(list_index)
            .to_tlv(&TLVTag::Context(AttrDataTag::Path as u8), self.tw)
    }

    fn close_report(&mut self) -> Result<(), Error> {
        self.tw.end_container()?;
        self.tw.end_container()
    }

    /// Encode a non-list value, atomically: either the whole report entry
    /// lands in the buffer, or nothing does and the error propagates.
    pub fn scalar<F>(&mut self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut TLVWriter, &TLVTag) -> Result<(), Error>,
    {
        let anchor = self.tw.anchor();

        let result = (|| {
            self.open_report(None)?;
            f(self.tw, &TLVTag::Context(AttrDataTag::Data as u8))?;
            self.close_report()
        })();

        if result.is_err() {
            self.tw.rewind_to(anchor);
        }

        result
    }

    /// Begin (or resume) a list attribute, returning the index of the
    /// first element to encode.
    ///
    /// On first entry the empty-list marker is written; a resumed chunk
    /// skips it and continues at the recorded index.
    pub fn start_list(&mut self) -> Result<ListIndex, Error> {
        if let Some(index) = self.state.current_list_index {
            return Ok(index);
        }

        let anchor = self.tw.anchor();
        let result = (|| {
            self.open_report(None)?;
            self.tw
                .start_array(&TLVTag::Context(AttrDataTag::Data as u8))?;
            self.tw.end_container()?;
            self.close_report()
        })();

        if result.is_err() {
            // Marker didn't land, the whole attribute retries next chunk
            self.tw.rewind_to(anchor);
            return result.map(|_| 0);
        }

        self.state.current_list_index = Some(0);
        self.state.marker_sent = true;
        Ok(0)
    }

    /// Append one list element at the current index.
    ///
    /// An out-of-space failure rolls the element back and suspends the
    /// list; the caller must stop and let the next chunk resume. Any
    /// other failure propagates and fails the whole report.
    pub fn list_entry<F>(&mut self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut TLVWriter, &TLVTag) -> Result<(), Error>,
    {
        let index = self
            .state
            .current_list_index
            .ok_or(ErrorCode::InvalidState)?;

        let anchor = self.tw.anchor();
        let result = (|| {
            self.open_report(Some(Nullable::Some(index)))?;
            f(self.tw, &TLVTag::Context(AttrDataTag::Data as u8))?;
            self.close_report()
        })();

        match result {
            Ok(()) => {
                self.state.current_list_index = Some(index + 1);
                Ok(())
            }
            Err(e) => {
                self.tw.rewind_to(anchor);
                Err(e)
            }
        }
    }

    /// Mark the list complete. The encode state is released for the next
    /// attribute.
    pub fn end_list(&mut self) {
        self.state.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::messages::AttrResp;
    use crate::tlv::TLVElement;
    use crate::utils::writebuf::WriteBuf;

    const PATH: GenericPath = GenericPath::new(Some(1), Some(6), Some(0));

    /// Run one chunk of list encoding, returning the elements that landed
    /// and whether the list suspended for lack of space.
    fn encode_chunk(
        buf: &mut [u8],
        state: &mut AttributeEncodeState,
        values: &[u32],
    ) -> (heapless::Vec<(u16, u32), 16>, usize, bool) {
        let mut wb = WriteBuf::new(buf);
        let suspended = {
            let mut tw = TLVWriter::new(&mut wb);
            let mut enc = AttributeValueEncoder::new(&mut tw, state, PATH, 1);

            let result = (|| {
                let start = enc.start_list()? as usize;
                for value in &values[start..] {
                    enc.list_entry(|tw, tag| tw.u32(tag, *value))?;
                }
                enc.end_list();
                Ok::<_, Error>(())
            })();

            match result {
                Ok(()) => false,
                Err(e) if e.code() == ErrorCode::NoSpace => true,
                Err(e) => panic!("unexpected error: {}", e),
            }
        };
        let len = wb.as_slice().len();

        // Decode what landed in this chunk
        let mut out = heapless::Vec::<(u16, u32), 16>::new();
        let mut rest = &buf[..len];
        while !rest.is_empty() {
            let (elem, tail) = TLVElement::parse(rest).unwrap();
            rest = tail;

            let AttrResp::Data(data) = AttrResp::from_tlv(&elem).unwrap() else {
                panic!("expected data");
            };
            match data.path.list_index {
                None => {
                    // The empty-list marker
                    assert_eq!(data.data.container_iter().unwrap().count(), 0);
                }
                Some(Nullable::Some(idx)) => {
                    out.push((idx, data.data.u32().unwrap())).unwrap();
                }
                Some(Nullable::Null) => panic!("unexpected null list index"),
            }
        }

        (out, len, suspended)
    }

    #[test]
    fn scalar_is_atomic_on_no_space() {
        let mut mem = [0; 16];
        let mut wb = WriteBuf::new(&mut mem);
        let mut tw = TLVWriter::new(&mut wb);
        let mut state = AttributeEncodeState::default();
        let mut enc = AttributeValueEncoder::new(&mut tw, &mut state, PATH, 1);

        let err = enc
            .scalar(|tw, tag| tw.str(tag, &[0; 64]))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoSpace);

        // Nothing, not even a partial report entry, landed
        assert!(wb.as_slice().is_empty());
        assert!(state.allows_partial());
    }

    #[test]
    fn list_chunks_resume_in_order() {
        let values: &[u32] = &[10, 20, 30, 40, 50, 60];
        let mut state = AttributeEncodeState::default();

        let mut collected = heapless::Vec::<(u16, u32), 16>::new();
        let mut chunks = 0;

        loop {
            // Room for the marker plus two entries or so
            let mut buf = [0; 96];
            let (elems, _, suspended) = encode_chunk(&mut buf, &mut state, values);
            collected.extend(elems);
            chunks += 1;

            if !suspended {
                break;
            }
            assert!(state.is_chunking());
            assert!(!state.allows_partial());
        }

        assert!(chunks > 1, "buffer too big to force chunking");
        assert!(!state.is_chunking());

        // Exactly N elements, in order, no duplicates, no gaps
        assert_eq!(collected.len(), values.len());
        for (i, (idx, value)) in collected.iter().enumerate() {
            assert_eq!(*idx as usize, i);
            assert_eq!(*value, values[i]);
        }
    }

    #[test]
    fn marker_sent_once_per_list() {
        let values: &[u32] = &[1, 2, 3, 4, 5, 6, 7, 8];
        let mut state = AttributeEncodeState::default();

        let mut markers = 0;
        loop {
            let mut buf = [0; 96];
            let mut wb = WriteBuf::new(&mut buf);
            let suspended = {
                let mut tw = TLVWriter::new(&mut wb);
                let mut enc = AttributeValueEncoder::new(&mut tw, &mut state, PATH, 1);
                let result = (|| {
                    let start = enc.start_list()? as usize;
                    for value in &values[start..] {
                        enc.list_entry(|tw, tag| tw.u32(tag, *value))?;
                    }
                    enc.end_list();
                    Ok::<_, Error>(())
                })();
                matches!(result, Err(e) if e.code() == ErrorCode::NoSpace)
            };

            let len = wb.as_slice().len();
            let mut rest = &buf[..len];
            while !rest.is_empty() {
                let (elem, tail) = TLVElement::parse(rest).unwrap();
                rest = tail;
                let AttrResp::Data(data) = AttrResp::from_tlv(&elem).unwrap() else {
                    panic!("expected data");
                };
                if data.path.list_index.is_none() {
                    markers += 1;
                }
            }

            if !suspended {
                break;
            }
        }

        assert_eq!(markers, 1);
    }

    #[test]
    fn list_entry_without_start_is_invalid() {
        let mut mem = [0; 64];
        let mut wb = WriteBuf::new(&mut mem);
        let mut tw = TLVWriter::new(&mut wb);
        let mut state = AttributeEncodeState::default();
        let mut enc = AttributeValueEncoder::new(&mut tw, &mut state, PATH, 1);

        let err = enc.list_entry(|tw, tag| tw.u32(tag, 1)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);
    }
}
