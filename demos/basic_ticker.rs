// SPDX-License-Identifier: Apache-2.0
#![no_std]
#![no_main]

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bt_ticker::{CallId, Expiry, Platform, Start, Status, SysTickCounter, Ticker};
use rtt_target::rtt_init_log;

const TICKS_PER_SEC: u32 = 32_768;
const BLINKS: u32 = 5;

// 32.768 kHz ticks on an 8 MHz core, SysTick wrapping slightly faster
static COUNTER: SysTickCounter = SysTickCounter::new(TICKS_PER_SEC as u64, 199, 8_000_000);
static TICKER: Ticker<'static, &'static SysTickCounter, LoopPlatform, 4, 1, 4> =
    Ticker::new(&COUNTER, LoopPlatform);

static WORKER_PENDING: AtomicBool = AtomicBool::new(false);
static JOB_PENDING: AtomicBool = AtomicBool::new(false);
static BLINK_COUNT: AtomicU32 = AtomicU32::new(0);

/// Runs worker and job from the main loop.
struct LoopPlatform;

impl Platform for LoopPlatform {
    fn schedule(&self, _caller: CallId, callee: CallId, _chain: bool) {
        match callee {
            CallId::Worker => WORKER_PENDING.store(true, Ordering::Release),
            CallId::Job => JOB_PENDING.store(true, Ordering::Release),
            _ => {}
        }
    }

    fn arm_trigger(&self, ticks: u32) {
        COUNTER.set_compare(ticks);
    }

    fn caller_id(&self, _user_id: u8) -> CallId {
        CallId::Program
    }
}

fn blink(expiry: &Expiry) {
    let count = BLINK_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
    log::info!(
        "blink {} at {} (lazy {})",
        count,
        expiry.ticks_at_expire,
        expiry.lazy
    );
}

fn op_done(status: Status) {
    log::debug!("operation completed: {:?}", status);
}

#[cortex_m_rt::entry]
fn main() -> ! {
    rtt_init_log!(
        log::LevelFilter::Debug,
        rtt_target::ChannelMode::NoBlockTrim,
        1024
    );

    let mut cp = cortex_m::Peripherals::take().unwrap();
    COUNTER.start_systick(&mut cp.SYST);

    TICKER.init([4]).unwrap();
    let now = TICKER.ticks_now();
    TICKER
        .start(
            0,
            0,
            Start::new(now, TICKS_PER_SEC)
                .periodic(TICKS_PER_SEC, 0)
                .on_timeout(&blink),
            Some(&op_done),
        )
        .unwrap();
    log::info!("ticker started at {}", now);

    while BLINK_COUNT.load(Ordering::Relaxed) < BLINKS {
        if WORKER_PENDING.swap(false, Ordering::AcqRel) {
            TICKER.worker();
        }
        if JOB_PENDING.swap(false, Ordering::AcqRel) {
            TICKER.job();
        }
        cortex_m::asm::nop();
    }

    TICKER.stop(0, 0, Some(&op_done)).unwrap();
    while JOB_PENDING.swap(false, Ordering::AcqRel) {
        TICKER.job();
    }
    log::info!("done after {} blinks", BLINK_COUNT.load(Ordering::Relaxed));
    cortex_m_semihosting::debug::exit(cortex_m_semihosting::debug::EXIT_SUCCESS);
    loop {}
}

#[cortex_m_rt::exception]
fn SysTick() {
    if COUNTER.systick_handler() {
        TICKER.trigger();
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
