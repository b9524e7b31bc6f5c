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

use crate::error::{Error, ErrorCode};

/// A consuming reader over a borrowed byte slice.
///
/// Keeps the already-parsed prefix addressable (needed as AAD when the
/// remainder of a packet is decrypted in place) and allows consuming
/// trailing bytes (the MIC) off the tail.
pub struct ParseBuf<'a> {
    buf: &'a mut [u8],
    read_off: usize,
    left: usize,
}

impl<'a> ParseBuf<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        let left = buf.len();

        Self {
            buf,
            read_off: 0,
            left,
        }
    }

    /// The unparsed remainder.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.read_off..self.read_off + self.left]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[self.read_off..self.read_off + self.left]
    }

    /// The already-parsed prefix.
    pub fn parsed_as_slice(&self) -> &[u8] {
        &self.buf[..self.read_off]
    }

    /// Consume and return `size` bytes off the tail of the remainder.
    pub fn tail(&mut self, size: usize) -> Result<&[u8], Error> {
        if size <= self.left {
            let end = self.read_off + self.left;
            self.left -= size;
            Ok(&self.buf[end - size..end])
        } else {
            Err(ErrorCode::TruncatedPacket.into())
        }
    }

    /// Truncate the remainder to `left` bytes.
    pub fn set_len(&mut self, left: usize) {
        self.left = left;
    }

    fn head<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        if self.left >= N {
            let mut data = [0; N];
            data.copy_from_slice(&self.buf[self.read_off..self.read_off + N]);
            self.read_off += N;
            self.left -= N;
            Ok(data)
        } else {
            Err(ErrorCode::TruncatedPacket.into())
        }
    }

    pub fn le_u8(&mut self) -> Result<u8, Error> {
        self.head::<1>().map(|d| d[0])
    }

    pub fn le_u16(&mut self) -> Result<u16, Error> {
        self.head().map(u16::from_le_bytes)
    }

    pub fn le_u32(&mut self) -> Result<u32, Error> {
        self.head().map(u32::from_le_bytes)
    }

    pub fn le_u64(&mut self) -> Result<u64, Error> {
        self.head().map(u64::from_le_bytes)
    }
}
