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

use core::fmt::{self, Display};

use bitflags::bitflags;
use log::trace;

use crate::error::{Error, ErrorCode};
use crate::utils::parsebuf::ParseBuf;
use crate::utils::writebuf::WriteBuf;

bitflags! {
    #[repr(transparent)]
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MsgFlags: u8 {
        const DSIZ_UNICAST_NODEID = 0x01;
        const SRC_ADDR_PRESENT = 0x04;
    }
}

impl Display for MsgFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = false;
        for (flag, str) in [
            (Self::SRC_ADDR_PRESENT, "S"),
            (Self::DSIZ_UNICAST_NODEID, "U"),
        ] {
            if self.contains(flag) {
                if sep {
                    write!(f, "|")?;
                }
                write!(f, "{}", str)?;
                sep = true;
            }
        }

        Ok(())
    }
}

/// The unencrypted prefix of every message: flags, session id, counter and
/// the optional source/destination node ids.
#[derive(Debug, Default, Clone)]
pub struct PlainHdr {
    flags: MsgFlags,
    pub sess_id: u16,
    pub ctr: u32,
    src_nodeid: u64,
    dst_nodeid: u64,
}

impl PlainHdr {
    #[inline(always)]
    pub const fn new() -> Self {
        Self {
            flags: MsgFlags::empty(),
            sess_id: 0,
            ctr: 0,
            src_nodeid: 0,
            dst_nodeid: 0,
        }
    }

    pub fn get_src_nodeid(&self) -> Option<u64> {
        self.flags
            .contains(MsgFlags::SRC_ADDR_PRESENT)
            .then_some(self.src_nodeid)
    }

    pub fn set_src_nodeid(&mut self, id: Option<u64>) {
        if let Some(id) = id {
            self.flags |= MsgFlags::SRC_ADDR_PRESENT;
            self.src_nodeid = id;
        } else {
            self.flags.remove(MsgFlags::SRC_ADDR_PRESENT);
            self.src_nodeid = 0;
        }
    }

    pub fn get_dst_nodeid(&self) -> Option<u64> {
        self.flags
            .contains(MsgFlags::DSIZ_UNICAST_NODEID)
            .then_some(self.dst_nodeid)
    }

    pub fn set_dst_nodeid(&mut self, id: Option<u64>) {
        if let Some(id) = id {
            self.flags |= MsgFlags::DSIZ_UNICAST_NODEID;
            self.dst_nodeid = id;
        } else {
            self.flags.remove(MsgFlags::DSIZ_UNICAST_NODEID);
            self.dst_nodeid = 0;
        }
    }

    pub const fn is_encrypted(&self) -> bool {
        self.sess_id != 0
    }

    pub fn decode(&mut self, pb: &mut ParseBuf) -> Result<(), Error> {
        self.flags = MsgFlags::from_bits(pb.le_u8()?).ok_or(ErrorCode::Invalid)?;
        self.sess_id = pb.le_u16()?;
        let _sec_flags = pb.le_u8()?;
        self.ctr = pb.le_u32()?;

        if self.flags.contains(MsgFlags::SRC_ADDR_PRESENT) {
            self.src_nodeid = pb.le_u64()?;
        }

        if self.flags.contains(MsgFlags::DSIZ_UNICAST_NODEID) {
            self.dst_nodeid = pb.le_u64()?;
        }

        trace!("[decode] {}", self);
        Ok(())
    }

    pub fn encode(&self, wb: &mut WriteBuf) -> Result<(), Error> {
        trace!("[encode] {}", self);
        wb.le_u8(self.flags.bits())?;
        wb.le_u16(self.sess_id)?;
        wb.le_u8(0)?;
        wb.le_u32(self.ctr)?;

        if self.flags.contains(MsgFlags::SRC_ADDR_PRESENT) {
            wb.le_u64(self.src_nodeid)?;
        }

        if self.flags.contains(MsgFlags::DSIZ_UNICAST_NODEID) {
            wb.le_u64(self.dst_nodeid)?;
        }

        Ok(())
    }
}

impl Display for PlainHdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SID:{:x},CTR:{:x}", self.sess_id, self.ctr)?;
        if !self.flags.is_empty() {
            write!(f, ",{}", self.flags)?;
        }

        Ok(())
    }
}

pub const fn max_plain_hdr_len() -> usize {
    // [flags, sess_id, sec_flags, ctr] + src nodeid + dst nodeid
    8 + 8 + 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_with_nodeids() {
        let mut hdr = PlainHdr::new();
        hdr.sess_id = 0x1234;
        hdr.ctr = 0x01020304;
        hdr.set_src_nodeid(Some(0x0a));
        hdr.set_dst_nodeid(Some(0x0b));

        let mut mem = [0; 24];
        let mut wb = WriteBuf::new(&mut mem);
        hdr.encode(&mut wb).unwrap();

        assert_eq!(
            wb.as_slice(),
            &[
                0x05, 0x34, 0x12, 0x00, 0x04, 0x03, 0x02, 0x01, //
                0x0a, 0, 0, 0, 0, 0, 0, 0, //
                0x0b, 0, 0, 0, 0, 0, 0, 0,
            ]
        );
    }

    #[test]
    fn decode_minimal() {
        let mut mem = [0x00, 0x00, 0x00, 0x00, 0x2a, 0x00, 0x00, 0x00];
        let mut pb = ParseBuf::new(&mut mem);

        let mut hdr = PlainHdr::new();
        hdr.decode(&mut pb).unwrap();
        assert_eq!(hdr.sess_id, 0);
        assert_eq!(hdr.ctr, 0x2a);
        assert!(hdr.get_src_nodeid().is_none());
        assert!(hdr.get_dst_nodeid().is_none());
        assert!(!hdr.is_encrypted());
    }

    #[test]
    fn round_trip() {
        let mut hdr = PlainHdr::new();
        hdr.sess_id = 7;
        hdr.ctr = 99;
        hdr.set_src_nodeid(Some(0xcafebabe_u64));

        let mut mem = [0; 24];
        let mut wb = WriteBuf::new(&mut mem);
        hdr.encode(&mut wb).unwrap();
        let len = wb.as_slice().len();

        let mut pb = ParseBuf::new(&mut mem[..len]);
        let mut back = PlainHdr::new();
        back.decode(&mut pb).unwrap();
        assert_eq!(back.sess_id, 7);
        assert_eq!(back.ctr, 99);
        assert_eq!(back.get_src_nodeid(), Some(0xcafebabe));
    }
}
