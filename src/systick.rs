// SPDX-License-Identifier: Apache-2.0

//! [`Counter`] backed by the Cortex-M SysTick.
//!
//! SysTick is a 24-bit down-counter. Every wrap raises the SysTick
//! exception, where the wraps are counted in two 32-bit atomics and the
//! armed compare is checked. The count is scaled to the configured tick
//! rate and truncated to 32 bits for the ticker.
//!
//! The compare can only be noticed on a wrap, so pick a reload that wraps
//! at least once per tick.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::counter::Counter;
use crate::ticks::is_before;

pub struct SysTickCounter {
    inner_wraps: AtomicU32, // SysTick exceptions, low 32 bits
    outer_wraps: AtomicU32, // Overflows of inner_wraps
    reload_value: u32,      // max 2^24 - 1
    multiplier: u64,
    shift: u32,
    compare: AtomicU32,
    armed: AtomicBool,
    #[cfg(test)]
    current_systick: AtomicU32,
    #[cfg(test)]
    pendst_is_pending: AtomicBool, // emulated SCB->ICSR PENDSTSET
}

impl SysTickCounter {
    /// Creates a counter that converts SysTick cycles to ticks at `tick_hz`.
    ///
    /// # Arguments
    ///
    /// * `tick_hz` - Ticker tick rate, e.g. 32_768 to mimic a low-power RTC
    /// * `reload_value` - SysTick reload value, between 1 and 2^24-1
    /// * `systick_freq` - SysTick input clock in Hz (typically the CPU clock)
    ///
    /// # Panics
    ///
    /// * If `reload_value` is 0 or greater than 2^24-1
    /// * If `systick_freq` is 0
    ///
    /// ```
    /// # use bt_ticker::SysTickCounter;
    /// // 32.768 kHz ticks on a 48 MHz core, wrapping at 48 kHz
    /// let counter = SysTickCounter::new(32_768, 999, 48_000_000);
    /// ```
    pub const fn new(tick_hz: u64, reload_value: u32, systick_freq: u64) -> Self {
        if reload_value > (1 << 24) - 1 {
            panic!("Reload value too large");
        }
        if reload_value == 0 {
            panic!("Reload value cannot be 0");
        }

        let shift = Self::compute_shift(tick_hz, systick_freq);
        let multiplier = (tick_hz << shift) / systick_freq;

        SysTickCounter {
            inner_wraps: AtomicU32::new(0),
            outer_wraps: AtomicU32::new(0),
            reload_value,
            multiplier,
            shift,
            compare: AtomicU32::new(0),
            armed: AtomicBool::new(false),
            #[cfg(test)]
            current_systick: AtomicU32::new(0),
            #[cfg(test)]
            pendst_is_pending: AtomicBool::new(false),
        }
    }

    /// SysTick exception handler.
    ///
    /// Returns true once the armed compare has been reached; the caller
    /// then runs [`Ticker::trigger`](crate::Ticker::trigger).
    pub fn systick_handler(&self) -> bool {
        let inner = self.inner_wraps.load(Ordering::Relaxed);
        self.inner_wraps
            .store(inner.wrapping_add(1), Ordering::SeqCst);
        if inner == u32::MAX {
            let outer = self.outer_wraps.load(Ordering::Relaxed).wrapping_add(1);
            self.outer_wraps.store(outer, Ordering::SeqCst);
        }

        if !self.armed.load(Ordering::Acquire) {
            return false;
        }
        let now = self.now_ticks() as u32;
        if is_before(now, self.compare.load(Ordering::Acquire), u32::MAX) {
            return false;
        }
        self.armed.store(false, Ordering::Release);
        true
    }

    /// Handler variant for systems with nested interrupts enabled.
    #[cfg(feature = "cortex-m")]
    pub fn systick_handler_nested(&self) -> bool {
        cortex_m::interrupt::free(|_| self.systick_handler())
    }

    /// Arm the compare at absolute tick `ticks`, replacing the previous one.
    pub fn set_compare(&self, ticks: u32) {
        self.compare.store(ticks, Ordering::Release);
        self.armed.store(true, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Current 64-bit tick count.
    ///
    /// Tolerates one wrap whose exception has not run yet, detected by
    /// PendST or by VAL jumping up between two reads.
    pub fn now_ticks(&self) -> u64 {
        let reload = self.reload_value as u64;

        loop {
            let wraps_pre = self.wraps();
            let val_before = self.get_syst() as u64;
            if self.wraps() != wraps_pre {
                continue;
            }

            let is_pending = self.is_systick_pending();
            let val_after = self.get_syst() as u64;
            if self.wraps() != wraps_pre {
                continue;
            }

            // SysTick counts down
            let wraps = if is_pending || val_after > val_before {
                wraps_pre + 1
            } else {
                wraps_pre
            };

            let total_cycles = wraps
                .saturating_mul(reload + 1)
                .saturating_add(reload - val_after);

            let (result, overflow) = total_cycles.overflowing_mul(self.multiplier);
            if !overflow {
                return result >> self.shift;
            }
            let wide = (total_cycles as u128) * (self.multiplier as u128);
            return (wide >> self.shift) as u64;
        }
    }

    fn wraps(&self) -> u64 {
        let inner = self.inner_wraps.load(Ordering::SeqCst) as u64;
        let outer = self.outer_wraps.load(Ordering::SeqCst) as u64;
        (outer << 32) | inner
    }

    fn get_syst(&self) -> u32 {
        #[cfg(test)]
        return self.current_systick.load(Ordering::SeqCst);

        #[cfg(all(not(test), feature = "cortex-m"))]
        return cortex_m::peripheral::SYST::get_current();

        #[cfg(all(not(test), not(feature = "cortex-m")))]
        panic!("SysTickCounter requires the cortex-m feature");
    }

    fn is_systick_pending(&self) -> bool {
        #[cfg(test)]
        return self.pendst_is_pending.load(Ordering::SeqCst);

        #[cfg(all(not(test), feature = "cortex-m"))]
        return cortex_m::peripheral::SCB::is_pendst_pending();

        #[cfg(all(not(test), not(feature = "cortex-m")))]
        return false;
    }

    // Figure out a shift that leads to less precision loss
    const fn compute_shift(tick_hz: u64, systick_freq: u64) -> u32 {
        let mut shift = 32;
        let mut multiplier = (tick_hz << shift) / systick_freq;
        while multiplier == 0 && shift < 64 {
            shift += 1;
            multiplier = (tick_hz << shift) / systick_freq;
        }
        shift
    }

    // -------- test-only helpers ----------
    #[cfg(test)]
    fn set_syst(&self, value: u32) {
        self.current_systick.store(value, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn set_pendst_pending(&self, pending: bool) {
        self.pendst_is_pending.store(pending, Ordering::SeqCst);
    }

    /// Configure and enable SysTick. Call once before starting the ticker.
    #[cfg(feature = "cortex-m")]
    pub fn start_systick(&self, syst: &mut cortex_m::peripheral::SYST) {
        syst.set_clock_source(cortex_m::peripheral::syst::SystClkSource::Core);
        syst.set_reload(self.reload_value);
        syst.clear_current();
        syst.enable_interrupt();
        syst.enable_counter();
    }
}

impl Counter for SysTickCounter {
    fn now(&self) -> u32 {
        self.now_ticks() as u32
    }

    // SysTick keeps running as the time base; only the compare is dropped.
    fn stop(&self) {
        self.armed.store(false, Ordering::Release);
    }
}
