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

//! The CASE session-resumption cache: shared secrets retained from fully
//! verified Sigma handshakes, so that a returning peer can re-key with a
//! two-message exchange instead of the full certificate dance.

use log::info;

use crate::crypto::{hkdf_sha256, hmac_sha256, CasePeer, SessionKeys, SYMM_KEY_LEN_BYTES};
use crate::error::{Error, ErrorCode};
use crate::tlv::{TLVElement, TLVTag, TLVWriter};
use crate::utils::writebuf::WriteBuf;

pub const RESUMPTION_ID_LEN: usize = 16;

cfg_if::cfg_if! {
    if #[cfg(feature = "max-sessions-64")] {
        pub const MAX_RESUMPTION_RECORDS: usize = 64;
    } else {
        pub const MAX_RESUMPTION_RECORDS: usize = 16;
    }
}

const RESUME_MIC_S1_INFO: &[u8] = b"Sigma1_Resume";
const RESUME_MIC_S2_INFO: &[u8] = b"Sigma2_Resume";
const RESUME_KEYS_INFO: &[u8] = b"SessionResumptionKeys";

#[derive(Debug, Clone)]
pub struct ResumptionRecord {
    pub resumption_id: [u8; RESUMPTION_ID_LEN],
    pub shared_secret: [u8; 32],
    pub peer: CasePeer,
    last_use_ms: u64,
}

/// A bounded LRU of resumption records.
///
/// At most one record per resumption id and at most one per authenticated
/// peer: re-establishing with the same peer replaces its old record.
#[derive(Default)]
pub struct ResumptionCache {
    records: heapless::Vec<ResumptionRecord, MAX_RESUMPTION_RECORDS>,
    changed: bool,
}

impl ResumptionCache {
    pub const fn new() -> Self {
        Self {
            records: heapless::Vec::new(),
            changed: false,
        }
    }

    /// Insert a record, evicting the least recently used one if full.
    pub fn add(
        &mut self,
        resumption_id: [u8; RESUMPTION_ID_LEN],
        shared_secret: [u8; 32],
        peer: CasePeer,
        now_ms: u64,
    ) {
        self.records.retain(|rec| {
            rec.resumption_id != resumption_id
                && (rec.peer.fab_idx != peer.fab_idx || rec.peer.node_id != peer.node_id)
        });

        if self.records.is_full() {
            if let Some(idx) = self
                .records
                .iter()
                .enumerate()
                .min_by_key(|(_, rec)| rec.last_use_ms)
                .map(|(idx, _)| idx)
            {
                self.records.swap_remove(idx);
            }
        }

        // Push can't fail, room was just made
        let _ = self.records.push(ResumptionRecord {
            resumption_id,
            shared_secret,
            peer,
            last_use_ms: now_ms,
        });
        self.changed = true;

        info!(
            "Resumption record stored for fabric {} node 0x{:x}",
            peer.fab_idx, peer.node_id
        );
    }

    /// Look up by resumption id, refreshing its LRU position.
    pub fn get(
        &mut self,
        resumption_id: &[u8],
        now_ms: u64,
    ) -> Option<&ResumptionRecord> {
        let rec = self
            .records
            .iter_mut()
            .find(|rec| rec.resumption_id == resumption_id)?;
        rec.last_use_ms = now_ms;
        Some(rec)
    }

    /// Drop all records scoped to a removed fabric.
    pub fn remove_for_fabric(&mut self, fab_idx: u8) -> usize {
        let before = self.records.len();
        self.records.retain(|rec| rec.peer.fab_idx != fab_idx);

        let removed = before - self.records.len();
        if removed > 0 {
            self.changed = true;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether the cache changed since the last `store`.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Serialize all records as a TLV array of structs.
    pub fn store(&mut self, wb: &mut WriteBuf) -> Result<(), Error> {
        let mut tw = TLVWriter::new(wb);
        tw.start_array(&TLVTag::Anonymous)?;
        for rec in &self.records {
            tw.start_struct(&TLVTag::Anonymous)?;
            tw.str(&TLVTag::Context(1), &rec.resumption_id)?;
            tw.str(&TLVTag::Context(2), &rec.shared_secret)?;
            tw.u8(&TLVTag::Context(3), rec.peer.fab_idx)?;
            tw.u64(&TLVTag::Context(4), rec.peer.node_id)?;
            tw.start_array(&TLVTag::Context(5))?;
            for cat in rec.peer.cat_ids {
                tw.u32(&TLVTag::Anonymous, cat)?;
            }
            tw.end_container()?;
            tw.end_container()?;
        }
        tw.end_container()?;

        self.changed = false;
        Ok(())
    }

    pub fn load(&mut self, data: &[u8], now_ms: u64) -> Result<(), Error> {
        self.records.clear();

        for rec in TLVElement::root(data)?.container_iter()? {
            let rec = rec?;

            let mut resumption_id = [0; RESUMPTION_ID_LEN];
            resumption_id.copy_from_slice(
                rec.find_ctx(1)?
                    .str()?
                    .get(..RESUMPTION_ID_LEN)
                    .ok_or(ErrorCode::InvalidData)?,
            );
            let mut shared_secret = [0; 32];
            shared_secret.copy_from_slice(
                rec.find_ctx(2)?.str()?.get(..32).ok_or(ErrorCode::InvalidData)?,
            );

            let mut cat_ids = [0; 3];
            for (slot, cat) in cat_ids.iter_mut().zip(rec.find_ctx(5)?.container_iter()?) {
                *slot = cat?.u32()?;
            }

            self.records
                .push(ResumptionRecord {
                    resumption_id,
                    shared_secret,
                    peer: CasePeer {
                        fab_idx: rec.find_ctx(3)?.u8()?,
                        node_id: rec.find_ctx(4)?.u64()?,
                        cat_ids,
                    },
                    last_use_ms: now_ms,
                })
                .map_err(|_| Error::from(ErrorCode::NoSpace))?;
        }

        self.changed = false;
        Ok(())
    }
}

fn resume_mic(
    shared_secret: &[u8],
    initiator_random: &[u8],
    resumption_id: &[u8],
    info: &[u8],
    mic: &mut [u8; SYMM_KEY_LEN_BYTES],
) -> Result<(), Error> {
    let mut salt = [0; 32 + RESUMPTION_ID_LEN];
    salt[..32].copy_from_slice(initiator_random);
    salt[32..].copy_from_slice(resumption_id);

    let mut key = [0; SYMM_KEY_LEN_BYTES];
    hkdf_sha256(&salt, shared_secret, info, &mut key)?;

    let mut mac = [0; 32];
    hmac_sha256(&key, resumption_id, &mut mac)?;
    mic.copy_from_slice(&mac[..SYMM_KEY_LEN_BYTES]);

    Ok(())
}

/// Compute the MIC an initiator proves possession of the cached secret
/// with in Sigma1.
pub fn sigma1_resume_mic(
    shared_secret: &[u8],
    initiator_random: &[u8],
    resumption_id: &[u8],
    mic: &mut [u8; SYMM_KEY_LEN_BYTES],
) -> Result<(), Error> {
    resume_mic(
        shared_secret,
        initiator_random,
        resumption_id,
        RESUME_MIC_S1_INFO,
        mic,
    )
}

/// Compute the MIC the responder returns in Sigma2Resume, bound to the
/// freshly allocated resumption id.
pub fn sigma2_resume_mic(
    shared_secret: &[u8],
    initiator_random: &[u8],
    new_resumption_id: &[u8],
    mic: &mut [u8; SYMM_KEY_LEN_BYTES],
) -> Result<(), Error> {
    resume_mic(
        shared_secret,
        initiator_random,
        new_resumption_id,
        RESUME_MIC_S2_INFO,
        mic,
    )
}

/// Derive the session keys of a resumed session. The fresh randomness in
/// the salt makes the keys unique per resumption.
pub fn derive_resumed_keys(
    shared_secret: &[u8],
    initiator_random: &[u8],
    new_resumption_id: &[u8],
) -> Result<SessionKeys, Error> {
    let mut salt = [0; 32 + RESUMPTION_ID_LEN];
    salt[..32].copy_from_slice(initiator_random);
    salt[32..].copy_from_slice(new_resumption_id);

    SessionKeys::derive(shared_secret, &salt, RESUME_KEYS_INFO)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(fab_idx: u8, node_id: u64) -> CasePeer {
        CasePeer {
            fab_idx,
            node_id,
            cat_ids: [0; 3],
        }
    }

    #[test]
    fn one_record_per_peer() {
        let mut cache = ResumptionCache::new();

        cache.add([1; 16], [0xaa; 32], peer(1, 100), 0);
        cache.add([2; 16], [0xbb; 32], peer(1, 100), 1);

        assert_eq!(cache.len(), 1);
        assert!(cache.get(&[1; 16], 2).is_none());
        assert_eq!(cache.get(&[2; 16], 2).unwrap().shared_secret, [0xbb; 32]);
    }

    #[test]
    fn one_record_per_id() {
        let mut cache = ResumptionCache::new();

        cache.add([1; 16], [0xaa; 32], peer(1, 100), 0);
        cache.add([1; 16], [0xbb; 32], peer(2, 200), 1);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&[1; 16], 2).unwrap().peer.node_id, 200);
    }

    #[test]
    fn full_cache_evicts_lru() {
        let mut cache = ResumptionCache::new();

        for i in 0..MAX_RESUMPTION_RECORDS {
            cache.add([i as u8; 16], [0; 32], peer(1, i as u64), i as u64);
        }

        // Touch the oldest record so record 1 becomes the LRU victim
        cache.get(&[0; 16], 1000).unwrap();
        cache.add([0xff; 16], [0; 32], peer(2, 0xffff), 2000);

        assert_eq!(cache.len(), MAX_RESUMPTION_RECORDS);
        assert!(cache.get(&[0; 16], 3000).is_some());
        assert!(cache.get(&[1; 16], 3000).is_none());
        assert!(cache.get(&[0xff; 16], 3000).is_some());
    }

    #[test]
    fn fabric_removal() {
        let mut cache = ResumptionCache::new();

        cache.add([1; 16], [0; 32], peer(1, 100), 0);
        cache.add([2; 16], [0; 32], peer(1, 101), 0);
        cache.add([3; 16], [0; 32], peer(2, 100), 0);

        assert_eq!(cache.remove_for_fabric(1), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&[3; 16], 1).is_some());
    }

    #[test]
    fn mic_binds_secret_and_randomness() {
        let mut mic_a = [0; 16];
        let mut mic_b = [0; 16];

        sigma1_resume_mic(&[7; 32], &[1; 32], &[2; 16], &mut mic_a).unwrap();
        sigma1_resume_mic(&[7; 32], &[1; 32], &[2; 16], &mut mic_b).unwrap();
        assert_eq!(mic_a, mic_b);

        sigma1_resume_mic(&[8; 32], &[1; 32], &[2; 16], &mut mic_b).unwrap();
        assert_ne!(mic_a, mic_b);

        sigma1_resume_mic(&[7; 32], &[9; 32], &[2; 16], &mut mic_b).unwrap();
        assert_ne!(mic_a, mic_b);

        // Sigma1 and Sigma2 MICs never collide for the same inputs
        sigma2_resume_mic(&[7; 32], &[1; 32], &[2; 16], &mut mic_b).unwrap();
        assert_ne!(mic_a, mic_b);
    }

    #[test]
    fn resumed_keys_fresh_per_resumption() {
        let keys_a = derive_resumed_keys(&[7; 32], &[1; 32], &[2; 16]).unwrap();
        let keys_b = derive_resumed_keys(&[7; 32], &[1; 32], &[3; 16]).unwrap();
        assert_ne!(keys_a, keys_b);
    }

    #[test]
    fn persistence_round_trip() {
        let mut cache = ResumptionCache::new();
        cache.add(
            [1; 16],
            [0xaa; 32],
            CasePeer {
                fab_idx: 3,
                node_id: 0xdead_beef,
                cat_ids: [0x0001_0001, 0, 0],
            },
            42,
        );
        assert!(cache.is_changed());

        let mut mem = [0; 256];
        let mut wb = WriteBuf::new(&mut mem);
        cache.store(&mut wb).unwrap();
        assert!(!cache.is_changed());
        let len = wb.as_slice().len();

        let mut restored = ResumptionCache::new();
        restored.load(&mem[..len], 0).unwrap();
        assert_eq!(restored.len(), 1);

        let rec = restored.get(&[1; 16], 1).unwrap();
        assert_eq!(rec.shared_secret, [0xaa; 32]);
        assert_eq!(rec.peer.fab_idx, 3);
        assert_eq!(rec.peer.node_id, 0xdead_beef);
        assert_eq!(rec.peer.cat_ids[0], 0x0001_0001);
    }
}
