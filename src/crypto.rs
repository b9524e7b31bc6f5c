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

//! The symmetric-crypto envelope used by the message layer (AES-128-CCM,
//! HKDF-SHA256, HMAC-SHA256) plus the capability traits behind which the
//! asymmetric handshake crypto (SPAKE2+, Sigma certificate exchange) lives.
//!
//! Certificate-chain validation and the PAKE math themselves are supplied
//! by the embedder (or by fakes in tests); the session/exchange core never
//! touches that key material directly.

use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::AeadInPlace;
use ccm::consts::{U13, U16};
use ccm::{Ccm, KeyInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, ErrorCode};
use crate::tlv::TLVElement;

pub const SYMM_KEY_LEN_BYTES: usize = 16;
pub const AEAD_NONCE_LEN_BYTES: usize = 13;
pub const AEAD_MIC_LEN_BYTES: usize = 16;
pub const SHA256_HASH_LEN_BYTES: usize = 32;
pub const EC_POINT_LEN_BYTES: usize = 65;

type AesCcm = Ccm<Aes128, U16, U13>;

pub fn encrypt_in_place(
    key: &[u8],
    nonce: &[u8],
    ad: &[u8],
    data: &mut [u8],
    data_len: usize,
) -> Result<usize, Error> {
    if data.len() < data_len + AEAD_MIC_LEN_BYTES {
        Err(ErrorCode::NoSpace)?;
    }

    let cipher = AesCcm::new(GenericArray::from_slice(key));
    let tag = cipher.encrypt_in_place_detached(
        GenericArray::from_slice(nonce),
        ad,
        &mut data[..data_len],
    )?;
    data[data_len..data_len + AEAD_MIC_LEN_BYTES].copy_from_slice(&tag);

    Ok(data_len + AEAD_MIC_LEN_BYTES)
}

pub fn decrypt_in_place(
    key: &[u8],
    nonce: &[u8],
    ad: &[u8],
    data: &mut [u8],
) -> Result<usize, Error> {
    if data.len() < AEAD_MIC_LEN_BYTES {
        Err(ErrorCode::TruncatedPacket)?;
    }

    let data_len = data.len() - AEAD_MIC_LEN_BYTES;
    let mut tag = [0; AEAD_MIC_LEN_BYTES];
    tag.copy_from_slice(&data[data_len..]);

    let cipher = AesCcm::new(GenericArray::from_slice(key));
    cipher.decrypt_in_place_detached(
        GenericArray::from_slice(nonce),
        ad,
        &mut data[..data_len],
        GenericArray::from_slice(&tag),
    )?;

    Ok(data_len)
}

pub fn hkdf_sha256(salt: &[u8], ikm: &[u8], info: &[u8], key: &mut [u8]) -> Result<(), Error> {
    Hkdf::<Sha256>::new(Some(salt), ikm)
        .expand(info, key)
        .map_err(|_| ErrorCode::Crypto.into())
}

pub fn hmac_sha256(key: &[u8], data: &[u8], out: &mut [u8]) -> Result<(), Error> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)?;
    mac.update(data);
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(())
}

/// The symmetric key set a successful handshake produces.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub dec_key: [u8; SYMM_KEY_LEN_BYTES],
    pub enc_key: [u8; SYMM_KEY_LEN_BYTES],
    pub att_challenge: [u8; SYMM_KEY_LEN_BYTES],
}

impl SessionKeys {
    /// Expand a shared secret into the three session keys.
    pub fn derive(secret: &[u8], salt: &[u8], info: &[u8]) -> Result<Self, Error> {
        let mut okm = [0; 3 * SYMM_KEY_LEN_BYTES];
        hkdf_sha256(salt, secret, info, &mut okm)?;

        let mut keys = Self::default();
        keys.dec_key.copy_from_slice(&okm[..16]);
        keys.enc_key.copy_from_slice(&okm[16..32]);
        keys.att_challenge.copy_from_slice(&okm[32..]);
        Ok(keys)
    }
}

/// SPAKE2+ verifier capability consumed by the PASE responder.
///
/// One engine instance covers one handshake; it accumulates the protocol
/// transcript internally and must destroy all intermediate material when
/// dropped.
pub trait PakeEngine {
    /// Discard all transcript and intermediate key material, making the
    /// engine ready for a fresh handshake.
    fn reset(&mut self);

    /// Fold the PBKDFParamRequest/Response payloads into the transcript.
    fn set_context(&mut self, param_req: &[u8], param_resp: &[u8]) -> Result<(), Error>;

    /// Process the initiator's pA; produce our pB and confirmation cB.
    fn handle_pa(
        &mut self,
        pa: &[u8],
        pb: &mut [u8; EC_POINT_LEN_BYTES],
        cb: &mut [u8; SHA256_HASH_LEN_BYTES],
    ) -> Result<(), Error>;

    /// Verify the initiator's confirmation cA; only a successful
    /// verification hands out session keys.
    fn handle_ca(&mut self, ca: &[u8]) -> Result<SessionKeys, Error>;
}

/// The identity a CASE handshake authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CasePeer {
    pub fab_idx: u8,
    pub node_id: u64,
    pub cat_ids: [u32; 3],
}

/// What a full (non-resumed) Sigma exchange yields on success.
pub struct CaseOutcome {
    pub peer: CasePeer,
    pub keys: SessionKeys,
    /// The ECDH shared secret, cached for later session resumption.
    pub shared_secret: [u8; SHA256_HASH_LEN_BYTES],
}

/// Sigma certificate-exchange capability consumed by the CASE responder.
///
/// The engine owns ephemeral keys, NOC-chain validation and signature
/// verification for exactly one handshake.
pub trait SigmaEngine {
    /// Validate the (already-parsed) Sigma1 payload and produce the Sigma2
    /// fields only the engine can: our ephemeral public key and the
    /// encrypted certificate proof (written into `proof_buf`, its length
    /// returned).
    fn build_sigma2(
        &mut self,
        sigma1: &TLVElement,
        resp_rand: &[u8; 32],
        eph_pub: &mut [u8; EC_POINT_LEN_BYTES],
        proof_buf: &mut [u8],
    ) -> Result<usize, Error>;

    /// Verify Sigma3: decrypt the proof, validate the peer NOC chain up to
    /// a trusted root and check the signature. Nothing is trusted before
    /// this returns `Ok`.
    fn handle_sigma3(&mut self, sigma3: &TLVElement) -> Result<CaseOutcome, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aead_round_trip() {
        let key = [0x11; SYMM_KEY_LEN_BYTES];
        let nonce = [0x22; AEAD_NONCE_LEN_BYTES];
        let ad = [1, 2, 3];

        let mut buf = [0; 32];
        buf[..5].copy_from_slice(b"hello");
        let len = encrypt_in_place(&key, &nonce, &ad, &mut buf, 5).unwrap();
        assert_eq!(len, 5 + AEAD_MIC_LEN_BYTES);
        assert_ne!(&buf[..5], b"hello");

        let plain_len = decrypt_in_place(&key, &nonce, &ad, &mut buf[..len]).unwrap();
        assert_eq!(&buf[..plain_len], b"hello");
    }

    #[test]
    fn aead_rejects_tampering() {
        let key = [0x11; SYMM_KEY_LEN_BYTES];
        let nonce = [0x22; AEAD_NONCE_LEN_BYTES];

        let mut buf = [0; 32];
        buf[..5].copy_from_slice(b"hello");
        let len = encrypt_in_place(&key, &nonce, &[], &mut buf, 5).unwrap();

        buf[0] ^= 1;
        assert!(decrypt_in_place(&key, &nonce, &[], &mut buf[..len]).is_err());
    }

    #[test]
    fn session_keys_split() {
        let keys = SessionKeys::derive(&[7; 32], &[], b"SessionKeys").unwrap();
        assert_ne!(keys.dec_key, keys.enc_key);
        assert_ne!(keys.enc_key, keys.att_challenge);

        // Deterministic for a fixed secret
        let again = SessionKeys::derive(&[7; 32], &[], b"SessionKeys").unwrap();
        assert_eq!(keys, again);
    }
}
