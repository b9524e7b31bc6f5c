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

//! Persistence seam: a minimal key-value blob store the stack saves its
//! long-lived state through (currently the CASE resumption cache).

use crate::error::Error;
use crate::sc::resume::ResumptionCache;
use crate::utils::writebuf::WriteBuf;

/// The key under which the resumption cache is persisted.
pub const KEY_RESUMPTION: &str = "resumption";

/// A key-value blob store, implemented by the embedder.
pub trait KvStore {
    /// Load the blob stored under `key` into `buf`, or `None` when the key
    /// was never stored.
    fn load<'a>(&self, key: &str, buf: &'a mut [u8]) -> Result<Option<&'a [u8]>, Error>;

    fn store(&mut self, key: &str, data: &[u8]) -> Result<(), Error>;

    fn remove(&mut self, key: &str) -> Result<(), Error>;
}

/// Persist the resumption cache if it changed since the last save.
///
/// `buf` is scratch space for the serialized records.
pub fn save_resumption_cache<S: KvStore>(
    store: &mut S,
    cache: &mut ResumptionCache,
    buf: &mut [u8],
) -> Result<(), Error> {
    if !cache.is_changed() {
        return Ok(());
    }

    let mut wb = WriteBuf::new(buf);
    cache.store(&mut wb)?;
    store.store(KEY_RESUMPTION, wb.as_slice())
}

/// Restore the resumption cache from the store. A missing key is a fresh
/// device, not an error.
pub fn load_resumption_cache<S: KvStore>(
    store: &S,
    cache: &mut ResumptionCache,
    buf: &mut [u8],
    now_ms: u64,
) -> Result<(), Error> {
    match store.load(KEY_RESUMPTION, buf)? {
        Some(data) => cache.load(data, now_ms),
        None => Ok(()),
    }
}

#[cfg(feature = "std")]
pub use file_psm::*;

#[cfg(feature = "std")]
mod file_psm {
    use std::fs;
    use std::io::{Read, Write};
    use std::path::PathBuf;

    use log::debug;

    use crate::error::{Error, ErrorCode};

    use super::KvStore;

    /// A file-per-key store rooted at a directory.
    pub struct FilePsm {
        dir: PathBuf,
    }

    impl FilePsm {
        pub fn new(dir: PathBuf) -> Result<Self, Error> {
            fs::create_dir_all(&dir)?;

            Ok(Self { dir })
        }
    }

    impl KvStore for FilePsm {
        fn load<'a>(&self, key: &str, buf: &'a mut [u8]) -> Result<Option<&'a [u8]>, Error> {
            let path = self.dir.join(key);

            match fs::File::open(path) {
                Ok(mut file) => {
                    let mut offset = 0;

                    loop {
                        if offset == buf.len() {
                            Err(ErrorCode::NoSpace)?;
                        }

                        let len = file.read(&mut buf[offset..])?;
                        if len == 0 {
                            break;
                        }

                        offset += len;
                    }

                    debug!("Key {}: loaded {} bytes", key, offset);
                    Ok(Some(&buf[..offset]))
                }
                Err(_) => Ok(None),
            }
        }

        fn store(&mut self, key: &str, data: &[u8]) -> Result<(), Error> {
            let path = self.dir.join(key);

            let mut file = fs::File::create(path)?;
            file.write_all(data)?;

            debug!("Key {}: stored {} bytes", key, data.len());
            Ok(())
        }

        fn remove(&mut self, key: &str) -> Result<(), Error> {
            let path = self.dir.join(key);

            // Removing a key that was never stored is fine
            let _ = fs::remove_file(path);
            Ok(())
        }
    }
}
