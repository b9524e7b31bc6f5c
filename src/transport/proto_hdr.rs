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

use crate::crypto;
use crate::error::{Error, ErrorCode};
use crate::transport::plain_hdr::max_plain_hdr_len;
use crate::utils::parsebuf::ParseBuf;
use crate::utils::writebuf::WriteBuf;

bitflags! {
    #[repr(transparent)]
    #[derive(Default, Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct ExchFlags: u8 {
        const VENDOR = 0x10;
        const SECEX = 0x08;
        const RELIABLE = 0x04;
        const ACK = 0x02;
        const INITIATOR = 0x01;
    }
}

impl Display for ExchFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = false;
        for (flag, str) in [
            (Self::INITIATOR, "I"),
            (Self::ACK, "A"),
            (Self::RELIABLE, "R"),
            (Self::SECEX, "SX"),
            (Self::VENDOR, "V"),
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

/// The protocol header: exchange id and flags, protocol id, opcode and the
/// optional piggybacked acknowledgement. Encrypted along with the payload
/// on secure sessions.
#[derive(Debug, Default, Clone)]
pub struct ProtoHdr {
    pub exch_id: u16,
    flags: ExchFlags,
    pub proto_id: u16,
    pub proto_opcode: u8,
    ack_ctr: u32,
}

impl ProtoHdr {
    #[inline(always)]
    pub const fn new() -> Self {
        Self {
            exch_id: 0,
            flags: ExchFlags::empty(),
            proto_id: 0,
            proto_opcode: 0,
            ack_ctr: 0,
        }
    }

    pub fn opcode<T: num::FromPrimitive>(&self) -> Result<T, Error> {
        num::FromPrimitive::from_u8(self.proto_opcode).ok_or(ErrorCode::InvalidOpcode.into())
    }

    pub fn is_initiator(&self) -> bool {
        self.flags.contains(ExchFlags::INITIATOR)
    }

    pub fn set_initiator(&mut self, initiator: bool) {
        self.flags.set(ExchFlags::INITIATOR, initiator);
    }

    pub fn is_reliable(&self) -> bool {
        self.flags.contains(ExchFlags::RELIABLE)
    }

    pub fn set_reliable(&mut self, reliable: bool) {
        self.flags.set(ExchFlags::RELIABLE, reliable);
    }

    pub fn get_ack(&self) -> Option<u32> {
        self.flags.contains(ExchFlags::ACK).then_some(self.ack_ctr)
    }

    pub fn set_ack(&mut self, ack_ctr: Option<u32>) {
        if let Some(ack_ctr) = ack_ctr {
            self.flags |= ExchFlags::ACK;
            self.ack_ctr = ack_ctr;
        } else {
            self.flags.remove(ExchFlags::ACK);
            self.ack_ctr = 0;
        }
    }

    pub fn decode(&mut self, pb: &mut ParseBuf) -> Result<(), Error> {
        self.flags = ExchFlags::from_bits(pb.le_u8()?).ok_or(ErrorCode::Invalid)?;
        self.proto_opcode = pb.le_u8()?;
        self.exch_id = pb.le_u16()?;
        self.proto_id = pb.le_u16()?;

        if self.flags.contains(ExchFlags::VENDOR) {
            // Vendor protocols are not handled
            let _vendor_id = pb.le_u16()?;
        }

        if self.flags.contains(ExchFlags::ACK) {
            self.ack_ctr = pb.le_u32()?;
        }

        Ok(())
    }

    pub fn encode(&self, wb: &mut WriteBuf) -> Result<(), Error> {
        wb.le_u8(self.flags.bits())?;
        wb.le_u8(self.proto_opcode)?;
        wb.le_u16(self.exch_id)?;
        wb.le_u16(self.proto_id)?;

        if let Some(ack_ctr) = self.get_ack() {
            wb.le_u32(ack_ctr)?;
        }

        Ok(())
    }
}

impl Display for ProtoHdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EID:{:x},PROTO:{:x},OP:{:x}",
            self.exch_id, self.proto_id, self.proto_opcode
        )?;
        if !self.flags.is_empty() {
            write!(f, ",{}", self.flags)?;
        }
        if let Some(ack_ctr) = self.get_ack() {
            write!(f, ",ACTR:{:x}", ack_ctr)?;
        }

        Ok(())
    }
}

pub const fn max_proto_hdr_len() -> usize {
    // [exch_flags, opcode, exch_id, proto_id] + vendor id + ack counter
    6 + 2 + 4
}

fn get_nonce(ctr: u32, nodeid: u64, nonce: &mut [u8]) -> Result<(), Error> {
    let mut wb = WriteBuf::new(nonce);
    wb.le_u8(0)?;
    wb.le_u32(ctr)?;
    wb.le_u64(nodeid)?;
    Ok(())
}

/// Encrypt a built (proto header + payload) writebuf in place, appending
/// the MIC; `plain_hdr` is the already-encoded unencrypted prefix used as
/// the additional authenticated data.
pub fn encrypt_in_place(
    send_ctr: u32,
    peer_nodeid: u64,
    plain_hdr: &[u8],
    wb: &mut WriteBuf,
    key: &[u8],
) -> Result<(), Error> {
    let mut nonce = [0_u8; crypto::AEAD_NONCE_LEN_BYTES];
    get_nonce(send_ctr, peer_nodeid, &mut nonce)?;

    let tag_space = [0u8; crypto::AEAD_MIC_LEN_BYTES];
    wb.append(&tag_space)?;

    let cipher_text = wb.as_mut_slice();
    let data_len = cipher_text.len() - crypto::AEAD_MIC_LEN_BYTES;
    crypto::encrypt_in_place(key, &nonce, plain_hdr, cipher_text, data_len)?;

    Ok(())
}

/// Decrypt the remainder of a packet in place; the parsed prefix of `pb`
/// (the plain header bytes) is the authenticated data, and the MIC is
/// consumed off the tail.
pub fn decrypt_in_place(
    recvd_ctr: u32,
    peer_nodeid: u64,
    pb: &mut ParseBuf,
    key: &[u8],
) -> Result<(), Error> {
    let mut aad = [0; max_plain_hdr_len()];
    let parsed = pb.parsed_as_slice();
    if parsed.len() > aad.len() {
        Err(ErrorCode::Invalid)?;
    }
    let aad_len = parsed.len();
    aad[..aad_len].copy_from_slice(parsed);

    let mut nonce = [0_u8; crypto::AEAD_NONCE_LEN_BYTES];
    get_nonce(recvd_ctr, peer_nodeid, &mut nonce)?;

    let cipher_text = pb.as_mut_slice();
    crypto::decrypt_in_place(key, &nonce, &aad[..aad_len], cipher_text)?;
    pb.tail(crypto::AEAD_MIC_LEN_BYTES)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_with_ack() {
        let mut hdr = ProtoHdr::new();
        hdr.exch_id = 0x0102;
        hdr.proto_id = 0;
        hdr.proto_opcode = 0x20;
        hdr.set_initiator(true);
        hdr.set_reliable(true);
        hdr.set_ack(Some(0x99));

        let mut mem = [0; 16];
        let mut wb = WriteBuf::new(&mut mem);
        hdr.encode(&mut wb).unwrap();

        assert_eq!(
            wb.as_slice(),
            &[0x07, 0x20, 0x02, 0x01, 0x00, 0x00, 0x99, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn decode_no_ack() {
        let mut mem = [0x05, 0x08, 0x34, 0x12, 0x01, 0x00];
        let mut pb = ParseBuf::new(&mut mem);

        let mut hdr = ProtoHdr::new();
        hdr.decode(&mut pb).unwrap();
        assert!(hdr.is_initiator());
        assert!(hdr.is_reliable());
        assert_eq!(hdr.get_ack(), None);
        assert_eq!(hdr.exch_id, 0x1234);
        assert_eq!(hdr.proto_id, 1);
        assert_eq!(hdr.proto_opcode, 8);
    }

    #[test]
    fn crypt_round_trip() {
        let key = [0x42; crypto::SYMM_KEY_LEN_BYTES];
        let plain_hdr = [1, 2, 3, 4, 5, 6, 7, 8];

        let mut mem = [0; 64];
        let mut wb = WriteBuf::new(&mut mem);
        wb.append(b"proto+payload").unwrap();
        encrypt_in_place(7, 0x1122, &plain_hdr, &mut wb, &key).unwrap();

        let cipher_len = wb.as_slice().len();
        assert_eq!(cipher_len, 13 + crypto::AEAD_MIC_LEN_BYTES);

        // Reassemble a full packet: plain header followed by ciphertext
        let mut packet = [0; 64];
        packet[..8].copy_from_slice(&plain_hdr);
        packet[8..8 + cipher_len].copy_from_slice(wb.as_slice());

        let mut pb = ParseBuf::new(&mut packet[..8 + cipher_len]);
        for _ in 0..8 {
            pb.le_u8().unwrap();
        }
        decrypt_in_place(7, 0x1122, &mut pb, &key).unwrap();
        assert_eq!(pb.as_slice(), b"proto+payload");
    }
}
