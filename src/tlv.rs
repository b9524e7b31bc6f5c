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

//! TLV serde as used by all Matter application payloads.
//!
//! Only anonymous and context-specific tags are produced and understood;
//! profile-qualified tags are treated as malformed input, which the upper
//! layers map to an invalid-action status for the peer.

use crate::error::{Error, ErrorCode};
use crate::utils::writebuf::WriteBuf;

const TAG_SHIFT_BITS: u8 = 5;
const TAG_MASK: u8 = 0xe0;
const TYPE_MASK: u8 = 0x1f;

const TAG_CTL_ANONYMOUS: u8 = 0;
const TAG_CTL_CONTEXT: u8 = 1;

const TYPE_S8: u8 = 0x00;
const TYPE_S16: u8 = 0x01;
const TYPE_S32: u8 = 0x02;
const TYPE_S64: u8 = 0x03;
const TYPE_U8: u8 = 0x04;
const TYPE_U16: u8 = 0x05;
const TYPE_U32: u8 = 0x06;
const TYPE_U64: u8 = 0x07;
const TYPE_FALSE: u8 = 0x08;
const TYPE_TRUE: u8 = 0x09;
const TYPE_F32: u8 = 0x0a;
const TYPE_F64: u8 = 0x0b;
const TYPE_UTF8_L8: u8 = 0x0c;
const TYPE_UTF8_L16: u8 = 0x0d;
const TYPE_STR_L8: u8 = 0x10;
const TYPE_STR_L16: u8 = 0x11;
const TYPE_NULL: u8 = 0x14;
const TYPE_STRUCT: u8 = 0x15;
const TYPE_ARRAY: u8 = 0x16;
const TYPE_LIST: u8 = 0x17;
const TYPE_END_CNT: u8 = 0x18;

/// A nullable field: present-but-null on the wire is distinct from absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Nullable<T> {
    Null,
    Some(T),
}

impl<T> Nullable<T> {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_opt(&self) -> Option<&T> {
        match self {
            Self::Null => None,
            Self::Some(v) => Some(v),
        }
    }

    pub fn into_opt(self) -> Option<T> {
        match self {
            Self::Null => None,
            Self::Some(v) => Some(v),
        }
    }
}

/// A TLV tag. Profile-qualified tags are not modeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TLVTag {
    Anonymous,
    Context(u8),
}

/// A decoded TLV value. Containers carry the raw encoding of their children.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TLVValue<'a> {
    S8(i8),
    S16(i16),
    S32(i32),
    S64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Bool(bool),
    Utf8(&'a str),
    Str(&'a [u8]),
    Null,
    Struct(&'a [u8]),
    Array(&'a [u8]),
    List(&'a [u8]),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TLVElement<'a> {
    pub tag: TLVTag,
    pub value: TLVValue<'a>,
}

impl<'a> TLVElement<'a> {
    /// Parse one element off the head of `buf`, returning it and the rest.
    pub fn parse(buf: &'a [u8]) -> Result<(Self, &'a [u8]), Error> {
        let ctrl = *buf.first().ok_or(ErrorCode::TLVNotFound)?;
        let tag_ctl = (ctrl & TAG_MASK) >> TAG_SHIFT_BITS;
        let val_type = ctrl & TYPE_MASK;

        let mut offset = 1;
        let tag = match tag_ctl {
            TAG_CTL_ANONYMOUS => TLVTag::Anonymous,
            TAG_CTL_CONTEXT => {
                let t = *buf.get(offset).ok_or(ErrorCode::TruncatedPacket)?;
                offset += 1;
                TLVTag::Context(t)
            }
            _ => Err(ErrorCode::InvalidData)?,
        };

        let rest = &buf[offset..];
        let (value, rest) = Self::parse_value(val_type, rest)?;

        Ok((Self { tag, value }, rest))
    }

    /// Parse `buf` as a single root element, rejecting trailing data.
    pub fn root(buf: &'a [u8]) -> Result<Self, Error> {
        let (elem, rest) = Self::parse(buf)?;
        if rest.is_empty() {
            Ok(elem)
        } else {
            Err(ErrorCode::InvalidData.into())
        }
    }

    fn parse_value(val_type: u8, buf: &'a [u8]) -> Result<(TLVValue<'a>, &'a [u8]), Error> {
        let fixed = |n: usize| -> Result<(&'a [u8], &'a [u8]), Error> {
            if buf.len() >= n {
                Ok(buf.split_at(n))
            } else {
                Err(ErrorCode::TruncatedPacket.into())
            }
        };

        Ok(match val_type {
            TYPE_S8 => {
                let (v, rest) = fixed(1)?;
                (TLVValue::S8(v[0] as i8), rest)
            }
            TYPE_S16 => {
                let (v, rest) = fixed(2)?;
                (TLVValue::S16(i16::from_le_bytes([v[0], v[1]])), rest)
            }
            TYPE_S32 => {
                let (v, rest) = fixed(4)?;
                (TLVValue::S32(i32::from_le_bytes([v[0], v[1], v[2], v[3]])), rest)
            }
            TYPE_S64 => {
                let (v, rest) = fixed(8)?;
                let mut b = [0; 8];
                b.copy_from_slice(v);
                (TLVValue::S64(i64::from_le_bytes(b)), rest)
            }
            TYPE_U8 => {
                let (v, rest) = fixed(1)?;
                (TLVValue::U8(v[0]), rest)
            }
            TYPE_U16 => {
                let (v, rest) = fixed(2)?;
                (TLVValue::U16(u16::from_le_bytes([v[0], v[1]])), rest)
            }
            TYPE_U32 => {
                let (v, rest) = fixed(4)?;
                (TLVValue::U32(u32::from_le_bytes([v[0], v[1], v[2], v[3]])), rest)
            }
            TYPE_U64 => {
                let (v, rest) = fixed(8)?;
                let mut b = [0; 8];
                b.copy_from_slice(v);
                (TLVValue::U64(u64::from_le_bytes(b)), rest)
            }
            TYPE_FALSE => (TLVValue::Bool(false), buf),
            TYPE_TRUE => (TLVValue::Bool(true), buf),
            TYPE_NULL => (TLVValue::Null, buf),
            TYPE_UTF8_L8 | TYPE_STR_L8 | TYPE_UTF8_L16 | TYPE_STR_L16 => {
                let (len, buf) = if val_type == TYPE_UTF8_L8 || val_type == TYPE_STR_L8 {
                    let (l, rest) = fixed(1)?;
                    (l[0] as usize, rest)
                } else {
                    let (l, rest) = fixed(2)?;
                    (u16::from_le_bytes([l[0], l[1]]) as usize, rest)
                };
                if buf.len() < len {
                    Err(ErrorCode::TruncatedPacket)?;
                }
                let (data, rest) = buf.split_at(len);
                if val_type == TYPE_UTF8_L8 || val_type == TYPE_UTF8_L16 {
                    let s = core::str::from_utf8(data).map_err(|_| ErrorCode::InvalidData)?;
                    (TLVValue::Utf8(s), rest)
                } else {
                    (TLVValue::Str(data), rest)
                }
            }
            TYPE_STRUCT | TYPE_ARRAY | TYPE_LIST => {
                let end = Self::container_end(buf)?;
                let inner = &buf[..end];
                // Skip the end-of-container byte as well
                let rest = &buf[end + 1..];
                let value = match val_type {
                    TYPE_STRUCT => TLVValue::Struct(inner),
                    TYPE_ARRAY => TLVValue::Array(inner),
                    _ => TLVValue::List(inner),
                };
                (value, rest)
            }
            TYPE_F32 | TYPE_F64 => Err(ErrorCode::InvalidData)?,
            _ => Err(ErrorCode::InvalidData)?,
        })
    }

    /// Offset of the end-of-container control byte matching depth 0.
    fn container_end(buf: &[u8]) -> Result<usize, Error> {
        let mut depth = 1;
        let mut idx = 0;

        while idx < buf.len() {
            let ctrl = buf[idx];
            let tag_ctl = (ctrl & TAG_MASK) >> TAG_SHIFT_BITS;
            let val_type = ctrl & TYPE_MASK;

            if val_type == TYPE_END_CNT {
                depth -= 1;
                if depth == 0 {
                    return Ok(idx);
                }
                idx += 1;
                continue;
            }

            idx += 1;
            idx += match tag_ctl {
                TAG_CTL_ANONYMOUS => 0,
                TAG_CTL_CONTEXT => 1,
                2 | 4 => 2,
                3 | 5 => 4,
                6 => 6,
                7 => 8,
                _ => unreachable!(),
            };

            match val_type {
                TYPE_S8 | TYPE_U8 => idx += 1,
                TYPE_S16 | TYPE_U16 => idx += 2,
                TYPE_S32 | TYPE_U32 | TYPE_F32 => idx += 4,
                TYPE_S64 | TYPE_U64 | TYPE_F64 => idx += 8,
                TYPE_FALSE | TYPE_TRUE | TYPE_NULL => (),
                TYPE_UTF8_L8 | TYPE_STR_L8 => {
                    let len = *buf.get(idx).ok_or(ErrorCode::TruncatedPacket)? as usize;
                    idx += 1 + len;
                }
                TYPE_UTF8_L16 | TYPE_STR_L16 => {
                    if buf.len() < idx + 2 {
                        Err(ErrorCode::TruncatedPacket)?;
                    }
                    let len = u16::from_le_bytes([buf[idx], buf[idx + 1]]) as usize;
                    idx += 2 + len;
                }
                TYPE_STRUCT | TYPE_ARRAY | TYPE_LIST => depth += 1,
                _ => Err(ErrorCode::InvalidData)?,
            }
        }

        Err(ErrorCode::TruncatedPacket.into())
    }

    pub fn u8(&self) -> Result<u8, Error> {
        match self.value {
            TLVValue::U8(v) => Ok(v),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn u16(&self) -> Result<u16, Error> {
        match self.value {
            TLVValue::U8(v) => Ok(v as u16),
            TLVValue::U16(v) => Ok(v),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn u32(&self) -> Result<u32, Error> {
        match self.value {
            TLVValue::U8(v) => Ok(v as u32),
            TLVValue::U16(v) => Ok(v as u32),
            TLVValue::U32(v) => Ok(v),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn u64(&self) -> Result<u64, Error> {
        match self.value {
            TLVValue::U8(v) => Ok(v as u64),
            TLVValue::U16(v) => Ok(v as u64),
            TLVValue::U32(v) => Ok(v as u64),
            TLVValue::U64(v) => Ok(v),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn bool(&self) -> Result<bool, Error> {
        match self.value {
            TLVValue::Bool(v) => Ok(v),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn str(&self) -> Result<&'a [u8], Error> {
        match self.value {
            TLVValue::Str(v) => Ok(v),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn utf8(&self) -> Result<&'a str, Error> {
        match self.value {
            TLVValue::Utf8(v) => Ok(v),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.value, TLVValue::Null)
    }

    /// Iterate the children of a container element.
    pub fn container_iter(&self) -> Result<TLVContainerIter<'a>, Error> {
        match self.value {
            TLVValue::Struct(inner) | TLVValue::Array(inner) | TLVValue::List(inner) => {
                Ok(TLVContainerIter { buf: inner })
            }
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    /// Find a context-tagged child in a container element.
    pub fn find_ctx(&self, tag: u8) -> Result<TLVElement<'a>, Error> {
        for elem in self.container_iter()? {
            let elem = elem?;
            if elem.tag == TLVTag::Context(tag) {
                return Ok(elem);
            }
        }

        Err(ErrorCode::TLVNotFound.into())
    }

    /// Like `find_ctx`, but absence is `None` rather than an error.
    pub fn find_ctx_opt(&self, tag: u8) -> Result<Option<TLVElement<'a>>, Error> {
        match self.find_ctx(tag) {
            Ok(elem) => Ok(Some(elem)),
            Err(e) if e.code() == ErrorCode::TLVNotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TLVContainerIter<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for TLVContainerIter<'a> {
    type Item = Result<TLVElement<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }

        match TLVElement::parse(self.buf) {
            Ok((elem, rest)) => {
                self.buf = rest;
                Some(Ok(elem))
            }
            Err(e) => {
                self.buf = &[];
                Some(Err(e))
            }
        }
    }
}

/// A TLV encoder over a `WriteBuf`.
///
/// Integers are written with the smallest encoding that fits the value.
pub struct TLVWriter<'a, 'b> {
    wb: &'b mut WriteBuf<'a>,
}

impl<'a, 'b> TLVWriter<'a, 'b> {
    pub fn new(wb: &'b mut WriteBuf<'a>) -> Self {
        Self { wb }
    }

    pub fn buf(&mut self) -> &mut WriteBuf<'a> {
        self.wb
    }

    /// Current write position; pair with `rewind_to` to roll back a
    /// partially-written element.
    pub fn anchor(&self) -> usize {
        self.wb.tail()
    }

    pub fn rewind_to(&mut self, anchor: usize) {
        self.wb.rewind_tail_to(anchor);
    }

    fn ctrl(&mut self, tag: &TLVTag, val_type: u8) -> Result<(), Error> {
        match tag {
            TLVTag::Anonymous => self
                .wb
                .le_u8((TAG_CTL_ANONYMOUS << TAG_SHIFT_BITS) | val_type),
            TLVTag::Context(t) => {
                self.wb
                    .le_u8((TAG_CTL_CONTEXT << TAG_SHIFT_BITS) | val_type)?;
                self.wb.le_u8(*t)
            }
        }
    }

    pub fn u8(&mut self, tag: &TLVTag, data: u8) -> Result<(), Error> {
        self.ctrl(tag, TYPE_U8)?;
        self.wb.le_u8(data)
    }

    pub fn u16(&mut self, tag: &TLVTag, data: u16) -> Result<(), Error> {
        if data <= u8::MAX as u16 {
            self.u8(tag, data as u8)
        } else {
            self.ctrl(tag, TYPE_U16)?;
            self.wb.le_u16(data)
        }
    }

    pub fn u32(&mut self, tag: &TLVTag, data: u32) -> Result<(), Error> {
        if data <= u16::MAX as u32 {
            self.u16(tag, data as u16)
        } else {
            self.ctrl(tag, TYPE_U32)?;
            self.wb.le_u32(data)
        }
    }

    pub fn u64(&mut self, tag: &TLVTag, data: u64) -> Result<(), Error> {
        if data <= u32::MAX as u64 {
            self.u32(tag, data as u32)
        } else {
            self.ctrl(tag, TYPE_U64)?;
            self.wb.le_u64(data)
        }
    }

    pub fn i8(&mut self, tag: &TLVTag, data: i8) -> Result<(), Error> {
        self.ctrl(tag, TYPE_S8)?;
        self.wb.le_i8(data)
    }

    pub fn i16(&mut self, tag: &TLVTag, data: i16) -> Result<(), Error> {
        if data >= i8::MIN as i16 && data <= i8::MAX as i16 {
            self.i8(tag, data as i8)
        } else {
            self.ctrl(tag, TYPE_S16)?;
            self.wb.le_i16(data)
        }
    }

    pub fn i32(&mut self, tag: &TLVTag, data: i32) -> Result<(), Error> {
        if data >= i16::MIN as i32 && data <= i16::MAX as i32 {
            self.i16(tag, data as i16)
        } else {
            self.ctrl(tag, TYPE_S32)?;
            self.wb.le_i32(data)
        }
    }

    pub fn i64(&mut self, tag: &TLVTag, data: i64) -> Result<(), Error> {
        if data >= i32::MIN as i64 && data <= i32::MAX as i64 {
            self.i32(tag, data as i32)
        } else {
            self.ctrl(tag, TYPE_S64)?;
            self.wb.le_i64(data)
        }
    }

    pub fn bool(&mut self, tag: &TLVTag, data: bool) -> Result<(), Error> {
        self.ctrl(tag, if data { TYPE_TRUE } else { TYPE_FALSE })
    }

    pub fn null(&mut self, tag: &TLVTag) -> Result<(), Error> {
        self.ctrl(tag, TYPE_NULL)
    }

    pub fn str(&mut self, tag: &TLVTag, data: &[u8]) -> Result<(), Error> {
        if data.len() <= u8::MAX as usize {
            self.ctrl(tag, TYPE_STR_L8)?;
            self.wb.le_u8(data.len() as u8)?;
        } else if data.len() <= u16::MAX as usize {
            self.ctrl(tag, TYPE_STR_L16)?;
            self.wb.le_u16(data.len() as u16)?;
        } else {
            Err(ErrorCode::NoSpace)?;
        }
        self.wb.append(data)
    }

    pub fn utf8(&mut self, tag: &TLVTag, data: &str) -> Result<(), Error> {
        if data.len() <= u8::MAX as usize {
            self.ctrl(tag, TYPE_UTF8_L8)?;
            self.wb.le_u8(data.len() as u8)?;
        } else if data.len() <= u16::MAX as usize {
            self.ctrl(tag, TYPE_UTF8_L16)?;
            self.wb.le_u16(data.len() as u16)?;
        } else {
            Err(ErrorCode::NoSpace)?;
        }
        self.wb.append(data.as_bytes())
    }

    pub fn start_struct(&mut self, tag: &TLVTag) -> Result<(), Error> {
        self.ctrl(tag, TYPE_STRUCT)
    }

    pub fn start_array(&mut self, tag: &TLVTag) -> Result<(), Error> {
        self.ctrl(tag, TYPE_ARRAY)
    }

    pub fn start_list(&mut self, tag: &TLVTag) -> Result<(), Error> {
        self.ctrl(tag, TYPE_LIST)
    }

    pub fn end_container(&mut self) -> Result<(), Error> {
        self.wb.le_u8(TYPE_END_CNT)
    }

    /// Re-emit a parsed element under a (possibly different) tag.
    pub fn copy_element(&mut self, tag: &TLVTag, elem: &TLVElement) -> Result<(), Error> {
        match elem.value {
            TLVValue::S8(v) => self.i8(tag, v),
            TLVValue::S16(v) => self.i16(tag, v),
            TLVValue::S32(v) => self.i32(tag, v),
            TLVValue::S64(v) => self.i64(tag, v),
            TLVValue::U8(v) => self.u8(tag, v),
            TLVValue::U16(v) => self.u16(tag, v),
            TLVValue::U32(v) => self.u32(tag, v),
            TLVValue::U64(v) => self.u64(tag, v),
            TLVValue::Bool(v) => self.bool(tag, v),
            TLVValue::Utf8(v) => self.utf8(tag, v),
            TLVValue::Str(v) => self.str(tag, v),
            TLVValue::Null => self.null(tag),
            TLVValue::Struct(inner) => {
                self.start_struct(tag)?;
                self.wb.append(inner)?;
                self.end_container()
            }
            TLVValue::Array(inner) => {
                self.start_array(tag)?;
                self.wb.append(inner)?;
                self.end_container()
            }
            TLVValue::List(inner) => {
                self.start_list(tag)?;
                self.wb.append(inner)?;
                self.end_container()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::writebuf::WriteBuf;

    fn encode<F>(buf: &mut [u8], f: F) -> &[u8]
    where
        F: FnOnce(&mut TLVWriter),
    {
        let mut wb = WriteBuf::new(buf);
        let mut tw = TLVWriter::new(&mut wb);
        f(&mut tw);
        let len = wb.as_slice().len();
        &buf[..len]
    }

    #[test]
    fn smallest_int_encoding() {
        let mut mem = [0; 32];
        let out = encode(&mut mem, |tw| {
            tw.u32(&TLVTag::Context(1), 0xf0).unwrap();
            tw.u32(&TLVTag::Context(2), 0x1234).unwrap();
            tw.u32(&TLVTag::Context(3), 0xdeadbeef).unwrap();
        });
        assert_eq!(
            out,
            &[
                0x24, 1, 0xf0, // u8
                0x25, 2, 0x34, 0x12, // u16
                0x26, 3, 0xef, 0xbe, 0xad, 0xde, // u32
            ]
        );
    }

    #[test]
    fn struct_round_trip() {
        let mut mem = [0; 64];
        let out = encode(&mut mem, |tw| {
            tw.start_struct(&TLVTag::Anonymous).unwrap();
            tw.bool(&TLVTag::Context(0), true).unwrap();
            tw.str(&TLVTag::Context(1), &[1, 2, 3]).unwrap();
            tw.start_array(&TLVTag::Context(2)).unwrap();
            tw.u16(&TLVTag::Anonymous, 300).unwrap();
            tw.u16(&TLVTag::Anonymous, 5).unwrap();
            tw.end_container().unwrap();
            tw.null(&TLVTag::Context(3)).unwrap();
            tw.end_container().unwrap();
        });

        let root = TLVElement::root(out).unwrap();
        assert_eq!(root.find_ctx(0).unwrap().bool().unwrap(), true);
        assert_eq!(root.find_ctx(1).unwrap().str().unwrap(), &[1, 2, 3]);
        assert!(root.find_ctx(3).unwrap().is_null());
        assert!(root.find_ctx_opt(9).unwrap().is_none());

        let arr = root.find_ctx(2).unwrap();
        let items = arr
            .container_iter()
            .unwrap()
            .map(|e| e.unwrap().u16().unwrap())
            .collect::<heapless::Vec<_, 4>>();
        assert_eq!(&items[..], &[300, 5]);
    }

    #[test]
    fn nested_container_extent() {
        let mut mem = [0; 64];
        let out = encode(&mut mem, |tw| {
            tw.start_struct(&TLVTag::Anonymous).unwrap();
            tw.start_list(&TLVTag::Context(0)).unwrap();
            tw.start_struct(&TLVTag::Anonymous).unwrap();
            tw.u8(&TLVTag::Context(7), 42).unwrap();
            tw.end_container().unwrap();
            tw.end_container().unwrap();
            tw.u8(&TLVTag::Context(1), 9).unwrap();
            tw.end_container().unwrap();
        });

        let root = TLVElement::root(out).unwrap();
        let list = root.find_ctx(0).unwrap();
        let first = list.container_iter().unwrap().next().unwrap().unwrap();
        assert_eq!(first.find_ctx(7).unwrap().u8().unwrap(), 42);
        assert_eq!(root.find_ctx(1).unwrap().u8().unwrap(), 9);
    }

    #[test]
    fn copy_element_preserves_content() {
        let mut mem = [0; 64];
        let out = encode(&mut mem, |tw| {
            tw.start_struct(&TLVTag::Anonymous).unwrap();
            tw.utf8(&TLVTag::Context(0), "on").unwrap();
            tw.u32(&TLVTag::Context(1), 70000).unwrap();
            tw.end_container().unwrap();
        });
        let root = TLVElement::root(out).unwrap();

        let mut mem2 = [0; 64];
        let out2 = {
            let mut wb = WriteBuf::new(&mut mem2);
            let mut tw = TLVWriter::new(&mut wb);
            tw.copy_element(&TLVTag::Context(5), &root).unwrap();
            let len = wb.as_slice().len();
            &mem2[..len]
        };

        let copy = TLVElement::root(out2).unwrap();
        assert_eq!(copy.tag, TLVTag::Context(5));
        assert_eq!(copy.find_ctx(0).unwrap().utf8().unwrap(), "on");
        assert_eq!(copy.find_ctx(1).unwrap().u32().unwrap(), 70000);
    }

    #[test]
    fn truncated_container_is_an_error() {
        let mut mem = [0; 16];
        let out = encode(&mut mem, |tw| {
            tw.start_struct(&TLVTag::Anonymous).unwrap();
            tw.u8(&TLVTag::Context(0), 1).unwrap();
            tw.end_container().unwrap();
        });

        assert!(TLVElement::root(&out[..out.len() - 1]).is_err());
    }
}
