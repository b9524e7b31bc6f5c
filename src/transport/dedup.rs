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

const RX_BITMAP_LEN: u32 = 16;

/// Per-session receive-counter window for duplicate and replay detection.
///
/// Tracks the highest counter seen plus a bitmap of the 16 counters right
/// below it. Counters are the sole replay mechanism; no wall-clock ordering
/// is assumed.
#[derive(Debug)]
pub struct RxCtrState {
    max_ctr: u32,
    ctr_bitmap: u16,
}

impl RxCtrState {
    pub fn new(max_ctr: u32) -> Self {
        Self {
            max_ctr,
            ctr_bitmap: 0xffff,
        }
    }

    fn contains(&self, bit_number: u32) -> bool {
        (self.ctr_bitmap & (1 << bit_number)) != 0
    }

    fn insert(&mut self, bit_number: u32) {
        self.ctr_bitmap |= 1 << bit_number;
    }

    /// Record a received counter.
    ///
    /// Returns `false` (state unchanged) for a duplicate. Unencrypted
    /// sessions additionally accept a counter far in the past, as the peer
    /// may have rebooted and re-randomized its counter.
    pub fn post_recv(&mut self, msg_ctr: u32, is_encrypted: bool) -> bool {
        let idiff = (msg_ctr as i32) - (self.max_ctr as i32);
        let udiff = idiff.unsigned_abs();

        if msg_ctr == self.max_ctr {
            false
        } else if (-(RX_BITMAP_LEN as i32)..0).contains(&idiff) {
            let index = udiff - 1;
            if self.contains(index) {
                false
            } else {
                self.insert(index);
                true
            }
        } else if msg_ctr > self.max_ctr {
            self.max_ctr = msg_ctr;
            if udiff < RX_BITMAP_LEN {
                // The previous max_ctr becomes an ordinary bitmap entry
                self.ctr_bitmap <<= udiff;
                self.insert(udiff - 1);
            } else {
                self.ctr_bitmap = 0xffff;
            }
            true
        } else if !is_encrypted {
            // Peer possibly rebooted and chose a fresh random counter
            self.max_ctr = msg_ctr;
            self.ctr_bitmap = 0xffff;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RxCtrState;

    fn assert_dup(state: &mut RxCtrState, ctr: u32, encrypted: bool) {
        assert!(!state.post_recv(ctr, encrypted));
    }

    fn assert_new(state: &mut RxCtrState, ctr: u32, encrypted: bool) {
        assert!(state.post_recv(ctr, encrypted));
    }

    #[test]
    fn new_monotonic_ctrs() {
        let mut state = RxCtrState::new(100);
        assert_new(&mut state, 101, true);
        assert_new(&mut state, 102, true);
        assert_new(&mut state, 200, true);
    }

    #[test]
    fn exact_max_is_dup() {
        let mut state = RxCtrState::new(100);
        assert_dup(&mut state, 100, true);
        assert_new(&mut state, 101, true);
        assert_dup(&mut state, 101, true);
    }

    #[test]
    fn within_bitmap() {
        let mut state = RxCtrState::new(100);
        // Everything below a freshly-initialized max is considered seen
        assert_dup(&mut state, 99, true);
        assert_dup(&mut state, 85, true);

        // Jump forward opens fresh holes behind the new max
        assert_new(&mut state, 110, true);
        assert_new(&mut state, 105, true);
        assert_dup(&mut state, 105, true);
        assert_new(&mut state, 101, true);
        assert_dup(&mut state, 101, true);
        // 100 was the old max and stays seen
        assert_dup(&mut state, 100, true);
    }

    #[test]
    fn bitmap_corners() {
        let mut state = RxCtrState::new(100);
        // Max in-window jump: 15 forward
        assert_new(&mut state, 115, true);
        // Fresh holes at both window corners
        assert_new(&mut state, 114, true);
        assert_new(&mut state, 101, true);
        assert_dup(&mut state, 114, true);
        assert_dup(&mut state, 101, true);
        // The old max and everything below it stay seen
        assert_dup(&mut state, 100, true);
        assert_dup(&mut state, 99, true);
    }

    #[test]
    fn big_jump_resets_bitmap() {
        let mut state = RxCtrState::new(100);
        assert_new(&mut state, 100 + 20, true);
        // Everything in the window below the new max is "seen"
        assert_dup(&mut state, 110, true);
        assert_dup(&mut state, 104, true);
    }

    #[test]
    fn encrypted_rewind_rejected() {
        let mut state = RxCtrState::new(100);
        assert_new(&mut state, 200, true);
        assert_dup(&mut state, 50, true);
    }

    #[test]
    fn unencrypted_reboot_accepted() {
        let mut state = RxCtrState::new(20000);
        assert_new(&mut state, 50, false);
        assert_dup(&mut state, 50, false);
        assert_new(&mut state, 51, false);
    }
}
