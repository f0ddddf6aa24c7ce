// SPDX-License-Identifier: Apache-2.0

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};

use critical_section::Mutex;

use crate::counter::{CallId, Counter, Platform};
use crate::error::TickerError;
use crate::node::NodeState;
use crate::op::{
    OpFn, OpKind, OpPool, SlotCursor, SlotFn, Start, StartExt, StartOp, Update, UpdateOp, UserOp,
};
use crate::ticks::{diff_masked, TICKER_NULL, TICKER_NULL_REMAINDER};

mod job;
mod list;
mod worker;

use list::Core;

/// Multi-node tick scheduler sharing one hardware counter.
///
/// Holds `NODES` timer nodes, `USERS` callers with their own operation
/// rings and a pool of `OPS` operation records split between them at
/// [`init`](Ticker::init).
///
/// Nothing runs on its own. The embedder wires three entry points:
/// [`trigger`](Ticker::trigger) from the compare interrupt,
/// [`worker`](Ticker::worker) and [`job`](Ticker::job) whenever
/// [`Platform::schedule`] asks for them.
///
/// ```
/// use bt_ticker::{CallId, Counter, Platform, Start, Ticker};
/// use core::sync::atomic::{AtomicU32, Ordering};
///
/// struct Clock(AtomicU32);
/// impl Counter for Clock {
///     fn now(&self) -> u32 {
///         self.0.load(Ordering::Relaxed)
///     }
/// }
///
/// struct Inline;
/// impl Platform for Inline {
///     fn schedule(&self, _caller: CallId, _callee: CallId, _chain: bool) {}
///     fn arm_trigger(&self, _ticks: u32) {}
///     fn caller_id(&self, _user_id: u8) -> CallId {
///         CallId::Program
///     }
/// }
///
/// let ticker: Ticker<'_, Clock, Inline, 4, 1, 2> = Ticker::new(Clock(AtomicU32::new(0)), Inline);
/// ticker.init([2]).unwrap();
/// ticker.start(0, 0, Start::new(0, 100).periodic(500, 0), None).unwrap();
/// ticker.job();
/// assert_eq!(ticker.is_active(0), Ok(true));
/// ```
pub struct Ticker<'a, C, P, const NODES: usize, const USERS: usize, const OPS: usize> {
    counter: C,
    platform: P,
    core: Mutex<RefCell<Core<'a, NODES>>>,
    ops: Mutex<RefCell<OpPool<'a, USERS, OPS>>>,
    initialized: AtomicBool,
    /// Set while the worker runs or waits for the job to finish.
    worker_trigger: AtomicBool,
    /// The job was called while already running.
    job_again: AtomicBool,
}

impl<'a, C, P, const NODES: usize, const USERS: usize, const OPS: usize>
    Ticker<'a, C, P, NODES, USERS, OPS>
where
    C: Counter,
    P: Platform,
{
    pub const fn new(counter: C, platform: P) -> Self {
        const {
            assert!(
                NODES > 0 && NODES < TICKER_NULL as usize,
                "node ids must fit below TICKER_NULL"
            );
            assert!(USERS > 0 && USERS <= u8::MAX as usize);
        }
        Ticker {
            counter,
            platform,
            core: Mutex::new(RefCell::new(Core::new())),
            ops: Mutex::new(RefCell::new(OpPool::new())),
            initialized: AtomicBool::new(false),
            worker_trigger: AtomicBool::new(false),
            job_again: AtomicBool::new(false),
        }
    }

    /// Reset all nodes and split the operation pool, `user_ops[n]` records
    /// for user `n`. The sizes must add up to `OPS`, which may not be zero;
    /// a user's ring holds one operation less than its size.
    pub fn init(&self, user_ops: [u8; USERS]) -> Result<(), TickerError> {
        critical_section::with(|cs| {
            let mut core = self
                .core
                .borrow(cs)
                .try_borrow_mut()
                .map_err(|_| TickerError::Busy)?;
            let mut ops = self
                .ops
                .borrow(cs)
                .try_borrow_mut()
                .map_err(|_| TickerError::Busy)?;
            ops.configure(&user_ops)?;
            if core.counter_running {
                self.counter.stop();
            }
            core.reset();
            self.worker_trigger.store(false, Ordering::Release);
            self.job_again.store(false, Ordering::Release);
            self.initialized.store(true, Ordering::Release);
            Ok(())
        })
    }

    /// Drop every node and queued operation. Callbacks are not invoked.
    pub fn deinit(&self) -> Result<(), TickerError> {
        critical_section::with(|cs| {
            let mut core = self
                .core
                .borrow(cs)
                .try_borrow_mut()
                .map_err(|_| TickerError::Busy)?;
            let mut ops = self
                .ops
                .borrow(cs)
                .try_borrow_mut()
                .map_err(|_| TickerError::Busy)?;
            self.initialized.store(false, Ordering::Release);
            if core.counter_running {
                self.counter.stop();
            }
            core.reset();
            ops.reset();
            Ok(())
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Compare interrupt entry point: asks for the worker.
    pub fn trigger(&self) {
        if self.is_initialized() {
            self.platform.schedule(CallId::Trigger, CallId::Worker, true);
        }
    }

    /// Expire due nodes and dispatch their callbacks.
    ///
    /// If the job is running, the worker is deferred and the job schedules
    /// it again when it finishes.
    pub fn worker(&self) {
        if !self.is_initialized() {
            return;
        }
        self.worker_trigger.store(true, Ordering::Release);

        let ran = critical_section::with(|cs| {
            let Ok(mut core) = self.core.borrow(cs).try_borrow_mut() else {
                return false;
            };
            if core.head == TICKER_NULL {
                self.worker_trigger.store(false, Ordering::Release);
                return false;
            }
            let ticks_elapsed = diff_masked(self.counter.now(), core.ticks_current, C::MASK);
            let ticks_expired = core.expire(ticks_elapsed, C::MASK);
            core.push_elapsed(ticks_expired);
            self.worker_trigger.store(false, Ordering::Release);
            true
        });

        if ran {
            self.platform.schedule(CallId::Worker, CallId::Job, true);
        }
    }

    /// Apply queued operations, re-arm expired nodes and program the next
    /// compare.
    pub fn job(&self) {
        if self.is_initialized() {
            self.job_entry();
        }
    }

    /// Ask the platform to run the job on behalf of `user_id`.
    pub fn job_sched(&self, user_id: u8) {
        self.platform
            .schedule(self.platform.caller_id(user_id), CallId::Job, false);
    }

    fn enqueue(&self, user_id: u8, op: UserOp<'a>) -> Result<(), TickerError> {
        if !self.is_initialized() {
            return Err(TickerError::NotInitialized);
        }
        critical_section::with(|cs| {
            self.ops
                .borrow(cs)
                .try_borrow_mut()
                .map_err(|_| TickerError::Busy)?
                .push(user_id, op)
        })?;
        self.job_sched(user_id);
        Ok(())
    }

    /// Queue the start of node `ticker_id`. The outcome arrives through
    /// `op_fn`: `Failure` if the node is already running or out of range.
    pub fn start(
        &self,
        user_id: u8,
        ticker_id: u8,
        start: Start<'a>,
        op_fn: Option<OpFn<'a>>,
    ) -> Result<(), TickerError> {
        self.start_op(user_id, ticker_id, start, TICKER_NULL_REMAINDER, StartExt::default(), op_fn)
    }

    /// Like [`start`](Ticker::start), with a sub-tick remainder added to the
    /// first expiry.
    pub fn start_us(
        &self,
        user_id: u8,
        ticker_id: u8,
        start: Start<'a>,
        remainder_first: u32,
        op_fn: Option<OpFn<'a>>,
    ) -> Result<(), TickerError> {
        self.start_op(user_id, ticker_id, start, remainder_first, StartExt::default(), op_fn)
    }

    /// Like [`start`](Ticker::start), with a reschedule window and an
    /// expire-info link.
    pub fn start_ext(
        &self,
        user_id: u8,
        ticker_id: u8,
        start: Start<'a>,
        ext: StartExt,
        op_fn: Option<OpFn<'a>>,
    ) -> Result<(), TickerError> {
        self.start_op(user_id, ticker_id, start, TICKER_NULL_REMAINDER, ext, op_fn)
    }

    fn start_op(
        &self,
        user_id: u8,
        ticker_id: u8,
        params: Start<'a>,
        remainder_first: u32,
        ext: StartExt,
        op_fn: Option<OpFn<'a>>,
    ) -> Result<(), TickerError> {
        let kind = OpKind::Start(StartOp {
            params,
            remainder_first,
            ext,
        });
        self.enqueue(user_id, UserOp::new(kind, ticker_id, op_fn))
    }

    pub fn stop(&self, user_id: u8, ticker_id: u8, op_fn: Option<OpFn<'a>>) -> Result<(), TickerError> {
        let kind = OpKind::Stop { ticks_at_stop: None };
        self.enqueue(user_id, UserOp::new(kind, ticker_id, op_fn))
    }

    /// Stop node `ticker_id` at absolute tick `ticks_at_stop`.
    ///
    /// Occurrences before that tick still fire. The first occurrence at or
    /// after it is dropped and the node goes idle.
    pub fn stop_abs(
        &self,
        user_id: u8,
        ticker_id: u8,
        ticks_at_stop: u32,
        op_fn: Option<OpFn<'a>>,
    ) -> Result<(), TickerError> {
        let kind = OpKind::Stop {
            ticks_at_stop: Some(ticks_at_stop & C::MASK),
        };
        self.enqueue(user_id, UserOp::new(kind, ticker_id, op_fn))
    }

    /// Adjust drift, slot, latency or force of a running node. An update
    /// that changes nothing completes with `Failure`.
    pub fn update(
        &self,
        user_id: u8,
        ticker_id: u8,
        update: Update,
        op_fn: Option<OpFn<'a>>,
    ) -> Result<(), TickerError> {
        self.update_ext(user_id, ticker_id, update, None, None, op_fn)
    }

    /// Like [`update`](Ticker::update), optionally switching must-expire on
    /// or off and relinking expire info (`Some(TICKER_NULL)` unlinks).
    pub fn update_ext(
        &self,
        user_id: u8,
        ticker_id: u8,
        update: Update,
        must_expire: Option<bool>,
        expire_info_id: Option<u8>,
        op_fn: Option<OpFn<'a>>,
    ) -> Result<(), TickerError> {
        let kind = OpKind::Update(UpdateOp {
            params: update,
            must_expire,
            expire_info_id,
        });
        self.enqueue(user_id, UserOp::new(kind, ticker_id, op_fn))
    }

    /// Find the next node after `cursor` that reserves a slot. `done` gets
    /// the advanced cursor once the job has run.
    pub fn next_slot_get(&self, user_id: u8, cursor: SlotCursor, done: SlotFn<'a>) -> Result<(), TickerError> {
        let kind = OpKind::SlotGet { cursor, done };
        self.enqueue(user_id, UserOp::new(kind, TICKER_NULL, None))
    }

    /// `op_fn` is called with `Success` once the job has drained all
    /// operations queued before this one.
    pub fn job_idle_get(&self, user_id: u8, op_fn: Option<OpFn<'a>>) -> Result<(), TickerError> {
        self.enqueue(user_id, UserOp::new(OpKind::IdleGet, TICKER_NULL, op_fn))
    }

    /// Set the collision priority of a node. Lower wins,
    /// [`TICKER_PRIORITY_CRITICAL`](crate::ticks::TICKER_PRIORITY_CRITICAL)
    /// always wins.
    pub fn priority_set(
        &self,
        user_id: u8,
        ticker_id: u8,
        priority: i8,
        op_fn: Option<OpFn<'a>>,
    ) -> Result<(), TickerError> {
        let kind = OpKind::PrioritySet(priority);
        self.enqueue(user_id, UserOp::new(kind, ticker_id, op_fn))
    }

    pub fn ticks_now(&self) -> u32 {
        self.counter.now() & C::MASK
    }

    /// `now - old` on the counter's width.
    pub fn ticks_diff(&self, now: u32, old: u32) -> u32 {
        diff_masked(now, old, C::MASK)
    }

    /// Whether node `ticker_id` is scheduled. `Busy` when called while the
    /// worker or job holds the node table.
    pub fn is_active(&self, ticker_id: u8) -> Result<bool, TickerError> {
        if ticker_id as usize >= NODES {
            return Ok(false);
        }
        critical_section::with(|cs| {
            let core = self
                .core
                .borrow(cs)
                .try_borrow()
                .map_err(|_| TickerError::Busy)?;
            Ok(core.node(ticker_id).state != NodeState::Idle)
        })
    }

    pub fn counter(&self) -> &C {
        &self.counter
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }
}
