// SPDX-License-Identifier: Apache-2.0

//! Upper half: walk the expired part of the list and dispatch callbacks.
//!
//! The worker never relinks nodes. It only marks what fired and how many
//! ticks it consumed; the job re-arms and releases afterwards.

use super::list::Core;
use crate::node::{ExpireInfo, Expiry, NodeState, Reschedule};
use crate::ticks::{is_before, TICKER_LAZY_MUST_EXPIRE, TICKER_NULL, TICKER_PRIORITY_CRITICAL};

impl<'a, const NODES: usize> Core<'a, NODES> {
    /// Fire every node due within `ticks_elapsed` of `ticks_current`.
    ///
    /// Returns the ticks consumed, measured up to the expiry of the last
    /// node that was due.
    pub fn expire(&mut self, mut ticks_elapsed: u32, mask: u32) -> u32 {
        let mut ticks_expired = 0u32;
        // The last slot holder may still own the air
        let mut slot_reserved = self.ticker_id_slot_previous != TICKER_NULL
            && self.ticks_slot_previous > ticks_elapsed;

        let mut id = self.head;
        while id != TICKER_NULL {
            let current = id;
            let ticks_to_expire = self.node(current).ticks_to_expire;
            if ticks_elapsed < ticks_to_expire {
                break;
            }
            ticks_elapsed -= ticks_to_expire;
            ticks_expired = ticks_expired.wrapping_add(ticks_to_expire);
            id = self.node(current).next;

            if self.node(current).state != NodeState::Scheduled {
                continue;
            }

            let ticks_nominal = self.ticks_current.wrapping_add(ticks_expired) & mask;
            if let Some(ticks_at_stop) = self.node(current).stop_at {
                if !is_before(ticks_nominal, ticks_at_stop, mask) {
                    continue;
                }
            }

            let must_expire_skip = match self.dispatch_check(current, slot_reserved) {
                Dispatch::Fire => false,
                Dispatch::Shallow => true,
                Dispatch::Skip => {
                    self.node_mut(current).state = NodeState::Skipped;
                    continue;
                }
            };

            let expire_info = self.linked_expiry(current);
            let node = self.node_mut(current);
            node.state = NodeState::Expired;

            let ticks_at_expire = ticks_nominal.wrapping_sub(node.ticks_to_expire_minus) & mask;
            let expiry = Expiry {
                ticker_id: current,
                ticks_at_expire,
                ticks_drift: node.ticks_drift,
                remainder: node.remainder_current,
                lazy: if must_expire_skip {
                    TICKER_LAZY_MUST_EXPIRE
                } else {
                    node.lazy_current
                },
                force: node.force,
                expire_info,
            };

            if !must_expire_skip {
                node.last_expiry = Some(ExpireInfo {
                    ticks_at_expire,
                    remainder: node.remainder_current,
                    lazy: node.lazy_current,
                });
                node.lazy_current = 0;
                node.force = 0;
                node.ticks_drift = 0;
                if node.ticks_slot != 0 {
                    // Everything else due in this pass collides
                    slot_reserved = true;
                }
            }

            if let Some(timeout) = node.timeout {
                log::trace!("expire id={} at={} lazy={}", current, ticks_at_expire, expiry.lazy);
                timeout(&expiry);
            }
        }

        ticks_expired
    }

    /// Decide whether a due node fires, and account for the skip if not.
    fn dispatch_check(&mut self, id: u8, slot_reserved: bool) -> Dispatch {
        let node = self.node(id);
        if matches!(node.reschedule, Reschedule::Placed { .. }) {
            // Already moved into a free gap by the job
            return Dispatch::Fire;
        }

        // One-shots have no later occurrence to skip to
        let latency_skip = node.ticks_periodic != 0 && node.lazy_periodic > node.lazy_current;
        let collision =
            !latency_skip && node.ticks_slot != 0 && (slot_reserved || self.resolve_collision(id));
        if !latency_skip && !collision {
            return Dispatch::Fire;
        }

        let node = self.node_mut(id);
        if collision && node.ticks_slot_window != 0 {
            node.reschedule = Reschedule::Pending;
            return Dispatch::Skip;
        }

        node.lazy_current = node.lazy_current.saturating_add(1);
        if !node.must_expire || node.lazy_periodic >= node.lazy_current {
            Dispatch::Skip
        } else {
            Dispatch::Shallow
        }
    }

    /// True if node `id` would starve a later node inside its slot that has
    /// a stronger claim.
    ///
    /// A later node wins when it is forced harder, is critical, has a
    /// higher composite priority (accumulated latency minus priority)
    /// without being younger, or has equal priority and has waited longer.
    fn resolve_collision(&self, id: u8) -> bool {
        let node = self.node(id);
        if node.priority == TICKER_PRIORITY_CRITICAL || node.next == TICKER_NULL {
            return false;
        }

        let lazy_current = i32::from(node.lazy_current) - i32::from(node.lazy_periodic);
        let current_age = node
            .ticks_periodic
            .wrapping_add((lazy_current as u32).wrapping_mul(node.ticks_periodic));

        let mut acc_ticks_to_expire = 0u32;
        for next_id in self.ids_from(node.next) {
            let next = self.node(next_id);
            acc_ticks_to_expire = acc_ticks_to_expire.wrapping_add(next.ticks_to_expire);
            if acc_ticks_to_expire >= node.ticks_slot {
                break;
            }
            if next.ticks_slot == 0 || next.lazy_periodic > next.lazy_current {
                continue;
            }

            let lazy_next = i32::from(next.lazy_current) - i32::from(next.lazy_periodic);
            let next_age = if next.ticks_periodic == 0 {
                0
            } else {
                next.ticks_periodic.saturating_sub(acc_ticks_to_expire)
            }
            .wrapping_add((lazy_next as u32).wrapping_mul(next.ticks_periodic));

            let equal_priority = node.priority == next.priority;
            let current_is_older = current_age > next_age;
            let next_is_older = next_age > current_age;
            let next_force = next.force > node.force;
            let next_is_critical = next.priority == TICKER_PRIORITY_CRITICAL;
            let next_has_priority = (lazy_next - i32::from(next.priority))
                > (lazy_current - i32::from(node.priority));

            if next_force
                || next_is_critical
                || (next_has_priority && !current_is_older)
                || (equal_priority && next_is_older)
            {
                return true;
            }
        }
        false
    }

    fn linked_expiry(&self, id: u8) -> Option<ExpireInfo> {
        let linked = self.node(id).expire_info_id;
        if (linked as usize) < NODES {
            self.node(linked).last_expiry
        } else {
            None
        }
    }
}

enum Dispatch {
    Fire,
    /// Must-expire node that lost: called back with
    /// [`TICKER_LAZY_MUST_EXPIRE`] and keeps its accumulated latency.
    Shallow,
    Skip,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticks::TICKER_NULL_LAZY;
    use core::sync::atomic::{AtomicU32, Ordering};

    fn schedule(core: &mut Core<'static, 4>, id: u8, ticks: u32, slot: u32) {
        let node = core.node_mut(id);
        node.ticks_to_expire = ticks;
        node.ticks_slot = slot;
        node.ticks_periodic = 1000;
        node.lazy_periodic = TICKER_NULL_LAZY;
        node.state = NodeState::Scheduled;
        core.enqueue(id);
    }

    #[test]
    fn test_expire_consumes_up_to_last_due() {
        let mut core = Core::new();
        schedule(&mut core, 0, 100, 0);
        schedule(&mut core, 1, 150, 0);
        schedule(&mut core, 2, 400, 0);

        assert_eq!(core.expire(200, u32::MAX), 150);
        assert_eq!(core.node(0).state, NodeState::Expired);
        assert_eq!(core.node(1).state, NodeState::Expired);
        assert_eq!(core.node(2).state, NodeState::Scheduled);
    }

    #[test]
    fn test_expire_reports_ticks_at_expire() {
        static AT: AtomicU32 = AtomicU32::new(0);
        fn timeout(expiry: &Expiry) {
            AT.store(expiry.ticks_at_expire, Ordering::SeqCst);
        }

        let mut core = Core::new();
        core.ticks_current = 0x00FF_FFF0;
        schedule(&mut core, 0, 0x20, 0);
        core.node_mut(0).ticks_to_expire_minus = 4;
        core.node_mut(0).timeout = Some(&timeout);

        core.expire(0x30, 0x00FF_FFFF);
        assert_eq!(AT.load(Ordering::SeqCst), 0x0C);
    }

    #[test]
    fn test_running_slot_blocks_next_node() {
        let mut core = Core::new();
        schedule(&mut core, 0, 10, 0);
        schedule(&mut core, 1, 20, 50);
        core.ticker_id_slot_previous = 3;
        core.ticks_slot_previous = 100;

        core.expire(30, u32::MAX);
        assert_eq!(core.node(0).state, NodeState::Expired);
        assert_eq!(core.node(1).state, NodeState::Skipped);
        assert_eq!(core.node(1).lazy_current, 1);
    }

    #[test]
    fn test_first_slot_wins_equal_nodes() {
        let mut core = Core::new();
        schedule(&mut core, 0, 10, 50);
        schedule(&mut core, 1, 20, 50);
        core.node_mut(0).force = 0;
        core.node_mut(1).force = 0;

        core.expire(30, u32::MAX);
        assert_eq!(core.node(0).state, NodeState::Expired);
        assert_eq!(core.node(1).state, NodeState::Skipped);
        assert_eq!(core.node(1).lazy_current, 1);
    }

    #[test]
    fn test_later_node_with_latency_wins() {
        let mut core = Core::new();
        schedule(&mut core, 0, 10, 50);
        schedule(&mut core, 1, 20, 50);
        core.node_mut(1).lazy_current = 3;

        core.expire(30, u32::MAX);
        assert_eq!(core.node(0).state, NodeState::Skipped);
        assert_eq!(core.node(0).lazy_current, 1);
        assert_eq!(core.node(1).state, NodeState::Expired);
        assert_eq!(core.node(1).lazy_current, 0);
    }

    #[test]
    fn test_critical_node_never_yields() {
        let mut core = Core::new();
        schedule(&mut core, 0, 10, 50);
        schedule(&mut core, 1, 20, 50);
        core.node_mut(0).priority = TICKER_PRIORITY_CRITICAL;
        core.node_mut(1).lazy_current = 3;

        core.expire(30, u32::MAX);
        assert_eq!(core.node(0).state, NodeState::Expired);
        assert_eq!(core.node(1).state, NodeState::Skipped);
    }

    #[test]
    fn test_must_expire_gets_shallow_callback() {
        static LAZY: AtomicU32 = AtomicU32::new(0);
        fn timeout(expiry: &Expiry) {
            LAZY.store(expiry.lazy as u32, Ordering::SeqCst);
        }

        let mut core = Core::new();
        schedule(&mut core, 0, 10, 50);
        schedule(&mut core, 1, 20, 50);
        core.node_mut(1).must_expire = true;
        core.node_mut(1).timeout = Some(&timeout);

        core.expire(30, u32::MAX);
        assert_eq!(LAZY.load(Ordering::SeqCst), TICKER_LAZY_MUST_EXPIRE as u32);
        assert_eq!(core.node(1).state, NodeState::Expired);
        // Latency keeps accumulating
        assert_eq!(core.node(1).lazy_current, 1);
    }

    #[test]
    fn test_programmed_latency_skips() {
        let mut core = Core::new();
        schedule(&mut core, 0, 10, 0);
        core.node_mut(0).lazy_periodic = 2;

        core.expire(10, u32::MAX);
        assert_eq!(core.node(0).state, NodeState::Skipped);
        assert_eq!(core.node(0).lazy_current, 1);
    }

    #[test]
    fn test_skipped_node_counted_once_per_occurrence() {
        let mut core = Core::new();
        schedule(&mut core, 0, 10, 0);
        core.node_mut(0).lazy_periodic = 2;

        // The worker may run again before the job takes the elapsed ticks
        for _ in 0..3 {
            assert_eq!(core.expire(10, u32::MAX), 10);
        }
        assert_eq!(core.node(0).state, NodeState::Skipped);
        assert_eq!(core.node(0).lazy_current, 1);
    }

    #[test]
    fn test_one_shot_ignores_programmed_latency() {
        let mut core = Core::new();
        schedule(&mut core, 0, 10, 0);
        core.node_mut(0).ticks_periodic = 0;
        core.node_mut(0).lazy_periodic = 2;

        core.expire(10, u32::MAX);
        assert_eq!(core.node(0).state, NodeState::Expired);
        assert_eq!(core.node(0).lazy_current, 0);
    }

    #[test]
    fn test_window_marks_pending() {
        let mut core = Core::new();
        schedule(&mut core, 0, 10, 50);
        schedule(&mut core, 1, 20, 50);
        core.node_mut(1).ticks_slot_window = 500;

        core.expire(30, u32::MAX);
        assert_eq!(core.node(1).reschedule, Reschedule::Pending);
        assert_eq!(core.node(1).lazy_current, 0);
    }

    #[test]
    fn test_stop_at_suppresses_fire() {
        let mut core = Core::new();
        schedule(&mut core, 0, 100, 0);
        core.node_mut(0).stop_at = Some(100);

        core.expire(100, u32::MAX);
        assert_eq!(core.node(0).state, NodeState::Scheduled);
    }

    #[test]
    fn test_expire_info_from_linked_node() {
        static INFO: AtomicU32 = AtomicU32::new(0);
        fn timeout(expiry: &Expiry) {
            if let Some(info) = expiry.expire_info {
                INFO.store(info.ticks_at_expire, Ordering::SeqCst);
            }
        }

        let mut core = Core::new();
        schedule(&mut core, 0, 10, 0);
        schedule(&mut core, 1, 20, 0);
        core.node_mut(1).expire_info_id = 0;
        core.node_mut(1).timeout = Some(&timeout);

        core.expire(20, u32::MAX);
        assert_eq!(INFO.load(Ordering::SeqCst), 10);
        assert_eq!(core.node(0).last_expiry.map(|e| e.ticks_at_expire), Some(10));
    }
}
