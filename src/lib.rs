// SPDX-License-Identifier: Apache-2.0

//! Tick-accurate scheduler multiplexing many timer nodes over one
//! free-running hardware counter and a single compare.
//!
//! Nodes are one-shot or periodic, may reserve a slot of air time, accept a
//! bounded number of skipped occurrences and carry sub-tick remainders so
//! long periods do not drift. Callers never touch the node table directly:
//! they queue operations which the job applies, and hear back through
//! completion callbacks.
//!
//! The crate is `no_std` and does no scheduling of its own. Implement
//! [`Counter`] for the hardware counter and [`Platform`] for the interrupt
//! plumbing, then route the compare interrupt to [`Ticker::trigger`] and
//! the scheduled contexts to [`Ticker::worker`] and [`Ticker::job`].
//! [`SysTickCounter`] is a ready-made counter for Cortex-M.

#![cfg_attr(not(test), no_std)]

mod counter;
mod error;
mod node;
mod op;
mod systick;
mod ticker;
pub mod ticks;

pub use counter::{CallId, Counter, Platform};
pub use error::{Status, TickerError};
pub use node::{ExpireInfo, Expiry, TimeoutFn};
pub use op::{OpFn, SlotCursor, SlotFn, Start, StartExt, Update};
pub use systick::SysTickCounter;
pub use ticker::Ticker;
