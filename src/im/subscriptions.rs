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

use core::time::Duration;

use super::{AttrId, ClusterId, EndptId, FabricIndex, GenericPath, SubscriptionId};

cfg_if::cfg_if! {
    if #[cfg(feature = "max-subscriptions-32")] {
        /// The maximum number of subscriptions tracked at the same time.
        /// Additional ones are rejected with a "resource exhausted" IM status.
        pub const MAX_SUBSCRIPTIONS: usize = 32;
    } else {
        /// The maximum number of subscriptions tracked at the same time.
        /// Additional ones are rejected with a "resource exhausted" IM status.
        pub const MAX_SUBSCRIPTIONS: usize = 4;
    }
}

/// The maximum number of concrete attribute paths one subscription covers.
pub const MAX_SUBSCRIPTION_PATHS: usize = 8;

/// Compute the max reporting interval granted to a subscriber, in seconds.
///
/// An intermittently-connected device cannot report more often than it
/// wakes, so a requested minimum below the slow-poll interval is rounded
/// up to the smallest whole multiple of the poll interval covering it.
/// The result is capped by the larger of the publisher's own interval
/// limit and the requested maximum.
pub fn negotiate_max_interval(
    slow_poll_secs: u32,
    publisher_limit_secs: u16,
    req_min_secs: u16,
    req_max_secs: u16,
) -> u16 {
    let slow_poll = slow_poll_secs.min(u16::MAX as u32) as u16;

    let mut decided = slow_poll;
    if req_min_secs > decided && slow_poll > 0 {
        decided = req_min_secs.div_ceil(slow_poll).saturating_mul(slow_poll);
    }

    decided.min(publisher_limit_secs.max(req_max_secs))
}

struct Subscription {
    fabric_idx: FabricIndex,
    peer_node_id: u64,
    session_id: u32,
    id: SubscriptionId,
    paths: heapless::Vec<GenericPath, MAX_SUBSCRIPTION_PATHS>,
    // u16 seconds to save storage; the IM wire format is u16 anyway
    min_int_secs: u16,
    max_int_secs: u16,
    reported_at: Option<Duration>,
    changed: bool,
}

impl Subscription {
    fn report_due(&self, now: Duration) -> bool {
        // Either the data had changed and the min interval has elapsed, or
        // nothing changed but a keep-alive report is due
        self.changed && self.elapsed(self.min_int_secs, now)
            || self.elapsed(self.min_int_secs.max(self.max_int_secs / 2), now)
    }

    fn is_expired(&self, now: Duration) -> bool {
        self.elapsed(self.max_int_secs, now)
    }

    fn elapsed(&self, secs: u16, now: Duration) -> bool {
        // A subscription which never got its prime report does not expire;
        // the establishing transaction owns it until then
        self.reported_at
            .map(|at| at + Duration::from_secs(secs as u64) <= now)
            .unwrap_or(false)
    }
}

/// The set of active subscriptions accepted by the IM engine.
pub struct Subscriptions {
    next_subscription_id: SubscriptionId,
    subscriptions: heapless::Vec<Subscription, MAX_SUBSCRIPTIONS>,
}

impl Subscriptions {
    #[inline(always)]
    pub const fn new() -> Self {
        Self {
            next_subscription_id: 1,
            subscriptions: heapless::Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Register a subscription, returning its ID, or `None` when the
    /// table (or the per-subscription path budget) is full.
    pub fn add(
        &mut self,
        fabric_idx: FabricIndex,
        peer_node_id: u64,
        session_id: u32,
        min_int_secs: u16,
        max_int_secs: u16,
        paths: &[GenericPath],
    ) -> Option<SubscriptionId> {
        let id = self.next_subscription_id;
        let paths = heapless::Vec::from_slice(paths).ok()?;

        self.subscriptions
            .push(Subscription {
                fabric_idx,
                peer_node_id,
                session_id,
                id,
                paths,
                min_int_secs,
                max_int_secs,
                reported_at: None,
                changed: false,
            })
            .ok()
            .map(|_| {
                self.next_subscription_id = self.next_subscription_id.wrapping_add(1).max(1);
                id
            })
    }

    /// Mark the subscription with the given ID as reported.
    ///
    /// Returns `false` if the subscription no longer exists, as it might
    /// have been removed while the report was in flight.
    pub fn mark_reported(&mut self, id: SubscriptionId, now: Duration) -> bool {
        if let Some(sub) = self.subscriptions.iter_mut().find(|sub| sub.id == id) {
            sub.reported_at = Some(now);
            sub.changed = false;

            true
        } else {
            false
        }
    }

    /// Flag every subscription interested in the changed attribute so the
    /// next tick emits a report once the min interval allows.
    pub fn notify_attribute_changed(
        &mut self,
        _endpoint_id: EndptId,
        _cluster_id: ClusterId,
        _attr_id: AttrId,
    ) {
        // TODO: Use the path to flag only the interested subscriptions
        for sub in self.subscriptions.iter_mut() {
            sub.changed = true;
        }
    }

    /// Remove every subscription matching the given filters, returning how
    /// many were dropped. A `None` filter matches everything.
    pub fn remove(
        &mut self,
        fabric_idx: Option<FabricIndex>,
        peer_node_id: Option<u64>,
        id: Option<SubscriptionId>,
    ) -> usize {
        let mut removed = 0;

        while let Some(index) = self.subscriptions.iter().position(|sub| {
            sub.fabric_idx == fabric_idx.unwrap_or(sub.fabric_idx)
                && sub.peer_node_id == peer_node_id.unwrap_or(sub.peer_node_id)
                && sub.id == id.unwrap_or(sub.id)
        }) {
            self.subscriptions.swap_remove(index);
            removed += 1;
        }

        removed
    }

    /// Find one subscription whose transport session is gone, so the caller
    /// can tear it down and notify exactly once.
    pub fn find_removed_session<F>(
        &self,
        session_removed: F,
    ) -> Option<(FabricIndex, u64, u32, SubscriptionId)>
    where
        F: Fn(u32) -> bool,
    {
        self.subscriptions.iter().find_map(|sub| {
            session_removed(sub.session_id).then_some((
                sub.fabric_idx,
                sub.peer_node_id,
                sub.session_id,
                sub.id,
            ))
        })
    }

    /// Find one subscription whose max interval elapsed without a report
    /// being delivered.
    pub fn find_expired(&self, now: Duration) -> Option<(FabricIndex, u64, u32, SubscriptionId)> {
        self.subscriptions.iter().find_map(|sub| {
            sub.is_expired(now).then_some((
                sub.fabric_idx,
                sub.peer_node_id,
                sub.session_id,
                sub.id,
            ))
        })
    }

    /// The concrete attribute paths the given subscription covers.
    pub fn paths_of(&self, id: SubscriptionId) -> Option<&[GenericPath]> {
        self.subscriptions
            .iter()
            .find(|sub| sub.id == id)
            .map(|sub| sub.paths.as_slice())
    }

    /// Find one subscription due for a report.
    ///
    /// Side effect: the returned subscription is stamped as reported at
    /// `now`, so repeated polling does not return it again before the
    /// report actually goes out.
    pub fn find_report_due(
        &mut self,
        now: Duration,
    ) -> Option<(FabricIndex, u64, u32, SubscriptionId)> {
        self.subscriptions
            .iter_mut()
            .find(|sub| sub.report_due(now))
            .map(|sub| {
                sub.reported_at = Some(now);
                sub.changed = false;
                (sub.fabric_idx, sub.peer_node_id, sub.session_id, sub.id)
            })
    }
}

impl Default for Subscriptions {
    fn default() -> Self {
        Self::new()
    }
}
