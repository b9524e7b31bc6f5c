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

//! Per-exchange message reliability: acknowledgement tracking and the
//! retransmission schedule. The retained packet bytes themselves live in
//! the stack's packet pool; this module owns the timing and bookkeeping.

use log::{error, warn};

use crate::error::{Error, ErrorCode};

use super::proto_hdr::ProtoHdr;

/// Base retry interval, in milliseconds.
pub const MRP_BASE_RETRY_INTERVAL_MS: u64 = 200;
/// Maximum number of transmissions (first send included).
pub const MRP_MAX_TRANSMISSIONS: usize = 10;
/// Retry count past which the interval starts backing off.
pub const MRP_BACKOFF_THRESHOLD: usize = 3;
/// Multiplicative backoff factor, as a (numerator, denominator) pair.
pub const MRP_BACKOFF_BASE: (u64, u64) = (16, 10);

/// One unacknowledged reliable transmission.
#[derive(Debug, Clone)]
pub struct RetransEntry {
    /// The counter of the retained message.
    pub msg_ctr: u32,
    /// When the message was (last) put on the wire, in epoch ms.
    pub sent_at_ms: u64,
    /// Transmissions so far.
    pub counter: usize,
}

impl RetransEntry {
    pub fn new(msg_ctr: u32, now_ms: u64) -> Self {
        Self {
            msg_ctr,
            sent_at_ms: now_ms,
            counter: 1,
        }
    }

    /// Delay before the next retransmission for the current retry count.
    pub fn delay_ms(&self) -> u64 {
        let mut delay = MRP_BASE_RETRY_INTERVAL_MS;
        for _ in 0..self.counter.saturating_sub(MRP_BACKOFF_THRESHOLD) {
            delay = delay * MRP_BACKOFF_BASE.0 / MRP_BACKOFF_BASE.1;
        }

        delay
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        self.sent_at_ms + self.delay_ms() <= now_ms
    }

    /// Account for a retransmission, or fail if the retry budget is gone.
    pub fn pre_send(&mut self, now_ms: u64) -> Result<(), Error> {
        if self.counter < MRP_MAX_TRANSMISSIONS {
            self.counter += 1;
            self.sent_at_ms = now_ms;
            Ok(())
        } else {
            Err(ErrorCode::TxTimeout.into())
        }
    }
}

/// A received reliable message we still owe an acknowledgement for.
#[derive(Debug, Clone)]
pub struct AckEntry {
    pub msg_ctr: u32,
}

/// The reliability state of one exchange.
#[derive(Debug, Default, Clone)]
pub struct ReliableMessage {
    pub retrans: Option<RetransEntry>,
    pub ack: Option<AckEntry>,
}

impl ReliableMessage {
    pub const fn new() -> Self {
        Self {
            retrans: None,
            ack: None,
        }
    }

    pub fn is_retrans_pending(&self) -> bool {
        self.retrans.is_some()
    }

    pub fn is_ack_pending(&self) -> bool {
        self.ack.is_some()
    }

    /// Fill the outgoing header: piggyback any pending ack and, for a
    /// reliable message, start tracking the transmission.
    pub fn pre_send(&mut self, hdr: &mut ProtoHdr, msg_ctr: u32, now_ms: u64) -> Result<(), Error> {
        if let Some(ack) = self.ack.take() {
            hdr.set_ack(Some(ack.msg_ctr));
        }

        if hdr.is_reliable() {
            if self.retrans.is_some() {
                // A previous reliable message is still in flight
                error!("Previous retransmission entry is pending");
                Err(ErrorCode::InvalidState)?;
            }

            self.retrans = Some(RetransEntry::new(msg_ctr, now_ms));
        }

        Ok(())
    }

    /// Process the reliability aspects of a received message: clear the
    /// matching retransmission on a piggybacked ack and remember that a
    /// reliable message needs acknowledging.
    pub fn post_recv(&mut self, hdr: &ProtoHdr, msg_ctr: u32) -> Result<(), Error> {
        if let Some(ack_ctr) = hdr.get_ack() {
            match &self.retrans {
                Some(retrans) if retrans.msg_ctr == ack_ctr => {
                    self.retrans = None;
                }
                Some(retrans) => {
                    warn!(
                        "Mismatch in ack: received {:x}, expected {:x}",
                        ack_ctr, retrans.msg_ctr
                    );
                }
                None => (),
            }
        }

        if hdr.is_reliable() {
            if let Some(ack) = &self.ack {
                // The previous ack was never sent; only one can be owed
                error!("Previous ack entry for {:x} is pending", ack.msg_ctr);
                Err(ErrorCode::InvalidState)?;
            }

            self.ack = Some(AckEntry { msg_ctr });
        }

        Ok(())
    }

    /// Whether the exchange has neither pending acks nor in-flight sends.
    pub fn is_empty(&self) -> bool {
        self.retrans.is_none() && self.ack.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule() {
        let mut entry = RetransEntry::new(1, 0);
        assert_eq!(entry.delay_ms(), 200);

        entry.pre_send(200).unwrap();
        entry.pre_send(400).unwrap();
        assert_eq!(entry.counter, 3);
        assert_eq!(entry.delay_ms(), 200);

        entry.pre_send(600).unwrap();
        assert_eq!(entry.delay_ms(), 320);
        entry.pre_send(920).unwrap();
        assert_eq!(entry.delay_ms(), 512);
    }

    #[test]
    fn retry_budget_exhausts() {
        let mut entry = RetransEntry::new(1, 0);
        for _ in 0..MRP_MAX_TRANSMISSIONS - 1 {
            entry.pre_send(0).unwrap();
        }
        assert_eq!(
            entry.pre_send(0).unwrap_err().code(),
            ErrorCode::TxTimeout
        );
    }

    #[test]
    fn due_times() {
        let entry = RetransEntry::new(1, 1000);
        assert!(!entry.is_due(1100));
        assert!(entry.is_due(1200));
    }

    #[test]
    fn piggyback_ack() {
        let mut mrp = ReliableMessage::new();

        // Reliable rx leaves an ack owing
        let mut rx = ProtoHdr::new();
        rx.set_reliable(true);
        mrp.post_recv(&rx, 33).unwrap();
        assert!(mrp.is_ack_pending());

        // The next send carries it
        let mut tx = ProtoHdr::new();
        tx.set_reliable(true);
        mrp.pre_send(&mut tx, 7, 0).unwrap();
        assert_eq!(tx.get_ack(), Some(33));
        assert!(!mrp.is_ack_pending());
        assert!(mrp.is_retrans_pending());

        // The peer's ack clears the retransmission
        let mut rx2 = ProtoHdr::new();
        rx2.set_ack(Some(7));
        mrp.post_recv(&rx2, 34).unwrap();
        assert!(!mrp.is_retrans_pending());
    }
}
