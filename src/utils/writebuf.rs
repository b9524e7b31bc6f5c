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

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, ErrorCode};

/// An append-only builder over a borrowed byte slice.
///
/// Supports a reserved prefix (for prepending headers after the payload is
/// built) and a shrinkable effective size (for keeping tail room aside while
/// a payload of unknown length is being produced).
#[derive(Debug)]
pub struct WriteBuf<'a> {
    buf: &'a mut [u8],
    buf_size: usize,
    start: usize,
    end: usize,
}

impl<'a> WriteBuf<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        let buf_size = buf.len();

        Self {
            buf,
            buf_size,
            start: 0,
            end: 0,
        }
    }

    /// Reserve `reserve` bytes at the beginning for later prepends.
    ///
    /// Only valid on a fresh buffer.
    pub fn reserve(&mut self, reserve: usize) -> Result<(), Error> {
        if self.start != 0 || self.end != 0 || self.buf_size != self.buf.len() {
            Err(ErrorCode::InvalidState.into())
        } else if reserve > self.buf_size {
            Err(ErrorCode::NoSpace.into())
        } else {
            self.start = reserve;
            self.end = reserve;
            Ok(())
        }
    }

    /// Temporarily take `with` bytes off the usable tail of the buffer.
    pub fn shrink(&mut self, with: usize) -> Result<(), Error> {
        if self.end + with <= self.buf_size {
            self.buf_size -= with;
            Ok(())
        } else {
            Err(ErrorCode::NoSpace.into())
        }
    }

    /// Give back tail room previously taken by `shrink`.
    pub fn expand(&mut self, by: usize) -> Result<(), Error> {
        if self.buf.len() - self.buf_size >= by {
            self.buf_size += by;
            Ok(())
        } else {
            Err(ErrorCode::NoSpace.into())
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn tail(&self) -> usize {
        self.end
    }

    pub fn rewind_tail_to(&mut self, end: usize) {
        self.end = end;
    }

    pub fn free(&self) -> usize {
        self.buf_size - self.end
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[self.start..self.end]
    }

    pub fn prepend(&mut self, src: &[u8]) -> Result<(), Error> {
        if src.len() <= self.start {
            self.buf[self.start - src.len()..self.start].copy_from_slice(src);
            self.start -= src.len();
            Ok(())
        } else {
            Err(ErrorCode::NoSpace.into())
        }
    }

    pub fn append_with<F>(&mut self, size: usize, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Self),
    {
        if self.end + size <= self.buf_size {
            f(self);
            self.end += size;
            Ok(())
        } else {
            Err(ErrorCode::NoSpace.into())
        }
    }

    pub fn append(&mut self, src: &[u8]) -> Result<(), Error> {
        self.append_with(src.len(), |x| {
            x.buf[x.end..x.end + src.len()].copy_from_slice(src);
        })
    }

    pub fn le_u8(&mut self, data: u8) -> Result<(), Error> {
        self.append_with(1, |x| {
            x.buf[x.end] = data;
        })
    }

    pub fn le_u16(&mut self, data: u16) -> Result<(), Error> {
        self.append_with(2, |x| {
            LittleEndian::write_u16(&mut x.buf[x.end..], data);
        })
    }

    pub fn le_u32(&mut self, data: u32) -> Result<(), Error> {
        self.append_with(4, |x| {
            LittleEndian::write_u32(&mut x.buf[x.end..], data);
        })
    }

    pub fn le_u64(&mut self, data: u64) -> Result<(), Error> {
        self.append_with(8, |x| {
            LittleEndian::write_u64(&mut x.buf[x.end..], data);
        })
    }

    pub fn le_i8(&mut self, data: i8) -> Result<(), Error> {
        self.le_u8(data as u8)
    }

    pub fn le_i16(&mut self, data: i16) -> Result<(), Error> {
        self.le_u16(data as u16)
    }

    pub fn le_i32(&mut self, data: i32) -> Result<(), Error> {
        self.le_u32(data as u32)
    }

    pub fn le_i64(&mut self, data: i64) -> Result<(), Error> {
        self.le_u64(data as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::WriteBuf;

    #[test]
    fn append_le() {
        let mut mem = [0; 12];
        let mut wb = WriteBuf::new(&mut mem);

        wb.le_u8(1).unwrap();
        wb.le_u16(0x203).unwrap();
        wb.le_u32(0xcafebabe).unwrap();
        assert_eq!(wb.as_slice(), &[1, 3, 2, 0xbe, 0xba, 0xfe, 0xca]);
    }

    #[test]
    fn overrun_leaves_buf_untouched() {
        let mut mem = [0; 3];
        let mut wb = WriteBuf::new(&mut mem);

        wb.le_u16(0xaabb).unwrap();
        assert!(wb.le_u16(0xccdd).is_err());
        assert_eq!(wb.as_slice(), &[0xbb, 0xaa]);
    }

    #[test]
    fn prepend_into_reserve() {
        let mut mem = [0; 8];
        let mut wb = WriteBuf::new(&mut mem);
        wb.reserve(3).unwrap();

        wb.le_u16(0x102).unwrap();
        wb.prepend(&[0xa, 0xb, 0xc]).unwrap();
        assert_eq!(wb.as_slice(), &[0xa, 0xb, 0xc, 2, 1]);
        assert!(wb.prepend(&[0]).is_err());
    }

    #[test]
    fn shrink_then_expand() {
        let mut mem = [0; 4];
        let mut wb = WriteBuf::new(&mut mem);

        wb.shrink(2).unwrap();
        wb.le_u16(7).unwrap();
        assert!(wb.le_u8(1).is_err());

        wb.expand(2).unwrap();
        wb.le_u16(8).unwrap();
        assert_eq!(wb.as_slice(), &[7, 0, 8, 0]);
    }

    #[test]
    fn rewind_tail() {
        let mut mem = [0; 8];
        let mut wb = WriteBuf::new(&mut mem);

        wb.le_u16(65).unwrap();
        let anchor = wb.tail();
        wb.le_u32(0xdeadbeef).unwrap();

        wb.rewind_tail_to(anchor);
        wb.le_u16(66).unwrap();
        assert_eq!(wb.as_slice(), &[65, 0, 66, 0]);
    }
}
