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

pub mod dedup;
pub mod exchange;
pub mod mrp;
pub mod network;
pub mod plain_hdr;
pub mod proto_hdr;
pub mod session;

cfg_if::cfg_if! {
    if #[cfg(feature = "large-buffers")] {
        /// Maximum size of a single encoded message, sized for a
        /// stream-based (TCP) transport.
        pub const MAX_MSG_SIZE: usize = 8192;
    } else {
        /// Maximum size of a single encoded message, as per the Matter
        /// spec for UDP transports.
        pub const MAX_MSG_SIZE: usize = 1583;
    }
}

/// Payload room left once both headers and the MIC are accounted for.
pub const MAX_PAYLOAD_SIZE: usize = MAX_MSG_SIZE
    - plain_hdr::max_plain_hdr_len()
    - proto_hdr::max_proto_hdr_len()
    - crate::crypto::AEAD_MIC_LEN_BYTES;
