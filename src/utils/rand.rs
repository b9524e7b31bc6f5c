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

/// The randomness source injected into the stack.
pub type Rand = fn(&mut [u8]);

pub fn dummy_rand(_buf: &mut [u8]) {}

#[cfg(feature = "std")]
pub fn sys_rand(buf: &mut [u8]) {
    use rand_core::{OsRng, RngCore};

    OsRng.fill_bytes(buf);
}
