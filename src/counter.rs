// SPDX-License-Identifier: Apache-2.0

/// Execution contexts the ticker asks the platform to run in.
///
/// `schedule` requests carry both the calling and the requested context,
/// letting the platform decide whether to run the callee inline, chain it
/// after the caller, or defer it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallId {
    Isr,
    /// Counter compare interrupt.
    Trigger,
    /// Upper half: expiry dispatch.
    Worker,
    /// Lower half: operation processing and compare programming.
    Job,
    /// Thread-level application code.
    Program,
}

/// Free-running hardware tick counter.
///
/// Only the low bits selected by [`Counter::MASK`] are meaningful; the
/// ticker treats the counter as wrapping at `MASK + 1`.
pub trait Counter {
    /// Counter width, e.g. `0x00FF_FFFF` for a 24-bit RTC.
    const MASK: u32 = u32::MAX;
    /// Minimum distance between "now" and a compare value for the compare
    /// to be guaranteed to hit.
    const CMP_OFFSET_MIN: u32 = 1;
    /// Ticks it takes for a compare write to become effective.
    const SET_LATENCY: u32 = 0;
    /// One tick expressed in remainder units, or `None` if the counter is
    /// precise enough that sub-tick remainders are not tracked.
    const REMAINDER_RANGE: Option<u32> = None;

    /// Current counter value.
    fn now(&self) -> u32;

    /// Called when the first node becomes active.
    fn start(&self) {}

    /// Called when the last node leaves the active list.
    fn stop(&self) {}
}

impl<C: Counter> Counter for &C {
    const MASK: u32 = C::MASK;
    const CMP_OFFSET_MIN: u32 = C::CMP_OFFSET_MIN;
    const SET_LATENCY: u32 = C::SET_LATENCY;
    const REMAINDER_RANGE: Option<u32> = C::REMAINDER_RANGE;

    fn now(&self) -> u32 {
        (**self).now()
    }

    fn start(&self) {
        (**self).start()
    }

    fn stop(&self) {
        (**self).stop()
    }
}

/// Hooks into the embedding system.
pub trait Platform {
    /// Request that `callee` runs. With `chain` set the callee should run
    /// after the caller returns rather than inline.
    ///
    /// For [`CallId::Worker`] the platform eventually calls
    /// [`Ticker::worker`](crate::Ticker::worker), for [`CallId::Job`]
    /// [`Ticker::job`](crate::Ticker::job).
    fn schedule(&self, caller: CallId, callee: CallId, chain: bool);

    /// Program the counter compare to fire at absolute tick `ticks`,
    /// replacing any previously armed value. The compare interrupt must end
    /// up calling [`Ticker::trigger`](crate::Ticker::trigger).
    fn arm_trigger(&self, ticks: u32);

    /// Map a ticker user to the context it calls from.
    fn caller_id(&self, user_id: u8) -> CallId;
}
