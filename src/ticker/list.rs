// SPDX-License-Identifier: Apache-2.0

//! Instance state and the delta-encoded expiry list.
//!
//! Active nodes are linked in expiry order starting at `head`. Each node's
//! `ticks_to_expire` is relative to its predecessor, the head's relative to
//! `ticks_current`.

use crate::node::{Node, NodeState};
use crate::op::SlotCursor;
use crate::ticks::TICKER_NULL;

const ELAPSED_SLOTS: u8 = 2;

pub(crate) struct Core<'a, const NODES: usize> {
    pub nodes: [Node<'a>; NODES],
    pub head: u8,
    /// Absolute tick the list is relative to.
    pub ticks_current: u32,
    /// Remaining ticks of the slot reserved by the last node that fired.
    pub ticks_slot_previous: u32,
    pub ticker_id_slot_previous: u8,
    /// Ticks consumed by the worker, handed over to the job.
    ticks_elapsed: [u32; ELAPSED_SLOTS as usize],
    elapsed_first: u8,
    elapsed_last: u8,
    pub counter_running: bool,
}

impl<'a, const NODES: usize> Core<'a, NODES> {
    pub const fn new() -> Self {
        Core {
            nodes: [const { Node::new() }; NODES],
            head: TICKER_NULL,
            ticks_current: 0,
            ticks_slot_previous: 0,
            ticker_id_slot_previous: TICKER_NULL,
            ticks_elapsed: [0; ELAPSED_SLOTS as usize],
            elapsed_first: 0,
            elapsed_last: 0,
            counter_running: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn node(&self, id: u8) -> &Node<'a> {
        &self.nodes[id as usize]
    }

    pub fn node_mut(&mut self, id: u8) -> &mut Node<'a> {
        &mut self.nodes[id as usize]
    }

    /// Store the ticks consumed by the worker. A value not yet taken by the
    /// job is overwritten; the worker's count always starts from the same
    /// `ticks_current`.
    pub fn push_elapsed(&mut self, ticks: u32) {
        if self.elapsed_first == self.elapsed_last {
            self.elapsed_last = (self.elapsed_last + 1) % ELAPSED_SLOTS;
        }
        self.ticks_elapsed[self.elapsed_last as usize] = ticks;
    }

    pub fn pop_elapsed(&mut self) -> Option<u32> {
        if self.elapsed_first == self.elapsed_last {
            return None;
        }
        self.elapsed_first = (self.elapsed_first + 1) % ELAPSED_SLOTS;
        Some(self.ticks_elapsed[self.elapsed_first as usize])
    }

    pub fn has_elapsed(&self) -> bool {
        self.elapsed_first != self.elapsed_last
    }

    /// Link node `id` in at the position given by its `ticks_to_expire`
    /// (relative to `ticks_current`). On equal expiry the node with more
    /// accumulated latency goes first.
    pub fn enqueue(&mut self, id: u8) {
        let lazy_new = self.node(id).lazy_current;
        let mut ticks_to_expire = self.node(id).ticks_to_expire;
        let mut previous = TICKER_NULL;
        let mut current = self.head;

        while current != TICKER_NULL {
            let node = self.node(current);
            if ticks_to_expire < node.ticks_to_expire {
                break;
            }
            let remaining = ticks_to_expire - node.ticks_to_expire;
            if remaining == 0 && lazy_new > node.lazy_current {
                break;
            }
            ticks_to_expire = remaining;
            previous = current;
            current = node.next;
        }

        let new = self.node_mut(id);
        new.ticks_to_expire = ticks_to_expire;
        new.next = current;

        if previous == TICKER_NULL {
            self.head = id;
        } else {
            self.node_mut(previous).next = id;
        }
        if current != TICKER_NULL {
            self.node_mut(current).ticks_to_expire -= ticks_to_expire;
        }
    }

    /// Unlink node `id`. Returns its total ticks to expire relative to
    /// `ticks_current`, or 0 if it was not in the list.
    pub fn dequeue(&mut self, id: u8) -> u32 {
        let mut previous = TICKER_NULL;
        let mut current = self.head;
        let mut total = 0u32;

        while current != TICKER_NULL && current != id {
            total = total.wrapping_add(self.node(current).ticks_to_expire);
            previous = current;
            current = self.node(current).next;
        }
        if current == TICKER_NULL {
            return 0;
        }

        let next = self.node(id).next;
        let timeout = self.node(id).ticks_to_expire;
        if previous == TICKER_NULL {
            self.head = next;
        } else {
            self.node_mut(previous).next = next;
        }
        if next != TICKER_NULL {
            let node = self.node_mut(next);
            node.ticks_to_expire = node.ticks_to_expire.wrapping_add(timeout);
        }
        self.node_mut(id).next = TICKER_NULL;

        total.wrapping_add(timeout)
    }

    /// Ticks from `ticks_current` to the expiry of node `id`, if linked.
    pub fn offset_of(&self, id: u8) -> Option<u32> {
        let mut current = self.head;
        let mut total = 0u32;
        while current != TICKER_NULL {
            let node = self.node(current);
            total = total.wrapping_add(node.ticks_to_expire);
            if current == id {
                return Some(total);
            }
            current = node.next;
        }
        None
    }

    /// Advance `cursor` to the next node that reserves a slot. Without one,
    /// the walk ends on [`TICKER_NULL`].
    ///
    /// A cursor that is stale, names no linked node or is out of range
    /// restarts from the head.
    pub fn next_slot(&self, cursor: SlotCursor) -> SlotCursor {
        let resume = (cursor.ticker_id as usize) < NODES
            && cursor.ticks_current == self.ticks_current
            && self.node(cursor.ticker_id).state == NodeState::Scheduled;
        let (mut id, mut ticks_to_expire) = if resume {
            (self.node(cursor.ticker_id).next, cursor.ticks_to_expire)
        } else {
            (self.head, 0)
        };

        while id != TICKER_NULL {
            let node = self.node(id);
            ticks_to_expire = ticks_to_expire.wrapping_add(node.ticks_to_expire);
            if node.ticks_slot != 0 {
                break;
            }
            id = node.next;
        }

        SlotCursor {
            ticker_id: id,
            ticks_current: self.ticks_current,
            ticks_to_expire,
        }
    }

    pub fn ids(&self) -> ListIter<'_, 'a, NODES> {
        self.ids_from(self.head)
    }

    /// Ids of the list starting at `id`, which must be linked or
    /// [`TICKER_NULL`].
    pub fn ids_from(&self, id: u8) -> ListIter<'_, 'a, NODES> {
        ListIter {
            core: self,
            current: id,
        }
    }
}

/// Ids of the active list in expiry order.
pub(crate) struct ListIter<'c, 'a, const NODES: usize> {
    core: &'c Core<'a, NODES>,
    current: u8,
}

impl<const NODES: usize> Iterator for ListIter<'_, '_, NODES> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        if self.current == TICKER_NULL {
            return None;
        }
        let id = self.current;
        self.current = self.core.node(id).next;
        Some(id)
    }
}
