//! Timer ticks and alarms. A single sleep queue, sorted by wake tick,
//! drives the hardware compare: the head's wake tick is always the next
//! programmed compare value, and the timer interrupt is disabled outright
//! while the queue is empty.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch;
use crate::platform;
use crate::sync::{IntrGuard, IrqMutex};
use crate::thread::Condition;

/// Current value of the real-time counter.
pub fn ticks() -> u64 {
    arch::read_time()
}

/// Timebase frequency in Hz.
pub fn freq_hz() -> u64 {
    platform::active().timer().freq_hz
}

pub fn ms_to_ticks(ms: u64) -> u64 {
    ms.saturating_mul(freq_hz()) / 1000
}

struct SleepEntry {
    wake: u64,
    cond: Arc<Condition>,
}

struct SleepQueue {
    entries: Vec<SleepEntry>,
}

impl SleepQueue {
    const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Keep the queue sorted ascending by wake tick; equal wakes preserve
    /// insertion order.
    fn insert(&mut self, entry: SleepEntry) {
        let at = self.entries.partition_point(|e| e.wake <= entry.wake);
        self.entries.insert(at, entry);
    }

    fn head_wake(&self) -> Option<u64> {
        self.entries.first().map(|e| e.wake)
    }

    fn pop_due(&mut self, now: u64) -> Option<SleepEntry> {
        if self.entries.first().map(|e| e.wake <= now).unwrap_or(false) {
            Some(self.entries.remove(0))
        } else {
            None
        }
    }
}

static SLEEPERS: IrqMutex<SleepQueue> = IrqMutex::new(SleepQueue::new());
static TIMER_IRQS: AtomicU64 = AtomicU64::new(0);

/// A reusable sleep rendezvous. The wake target accumulates across calls,
/// so periodic sleepers do not drift.
pub struct Alarm {
    cond: Arc<Condition>,
    wake: u64,
}

impl Alarm {
    pub fn new(name: &'static str) -> Self {
        Self {
            cond: Arc::new(Condition::new(name)),
            wake: ticks(),
        }
    }

    /// Advance the wake target by `delta` ticks (saturating) and sleep
    /// until the counter passes it. Returns immediately when the target is
    /// already in the past.
    pub fn sleep(&mut self, delta: u64) {
        self.wake = self.wake.saturating_add(delta);
        let target = self.wake;
        if ticks() >= target {
            return;
        }

        let _guard = IntrGuard::new();
        {
            let mut queue = SLEEPERS.lock();
            queue.insert(SleepEntry {
                wake: target,
                cond: self.cond.clone(),
            });
            // The head may be an earlier sleeper; the compare always tracks
            // the head.
            arch::set_timer_compare(queue.head_wake().unwrap());
            arch::timer_irq_enable(true);
        }
        while ticks() < target {
            self.cond.wait();
        }
    }

    /// Re-base the wake target on the current time, dropping accumulated
    /// lag after a long pause between periodic sleeps.
    pub fn reset(&mut self) {
        self.wake = ticks();
    }
}

/// Block the calling thread for at least `ms` milliseconds.
pub fn sleep_ms(ms: u64) {
    let mut alarm = Alarm::new("sleep");
    alarm.sleep(ms_to_ticks(ms));
}

/// Timer interrupt: wake every due sleeper, then re-arm for the new head
/// or park the timer when nothing is left.
pub fn handle_interrupt() {
    TIMER_IRQS.fetch_add(1, Ordering::Relaxed);
    let now = ticks();
    let mut queue = SLEEPERS.lock();
    while let Some(entry) = queue.pop_due(now) {
        entry.cond.broadcast();
    }
    match queue.head_wake() {
        Some(wake) => arch::set_timer_compare(wake),
        None => {
            arch::set_timer_compare(u64::MAX);
            arch::timer_irq_enable(false);
        }
    }
}

pub fn interrupt_count() -> u64 {
    TIMER_IRQS.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(wake: u64) -> SleepEntry {
        SleepEntry {
            wake,
            cond: Arc::new(Condition::new("test-alarm")),
        }
    }

    #[test]
    fn queue_stays_sorted() {
        let mut q = SleepQueue::new();
        for wake in [50u64, 10, 30, 20, 40, 30] {
            q.insert(entry(wake));
        }
        let wakes: Vec<u64> = q.entries.iter().map(|e| e.wake).collect();
        assert_eq!(wakes, alloc::vec![10, 20, 30, 30, 40, 50]);
        assert_eq!(q.head_wake(), Some(10));
    }

    #[test]
    fn pop_due_only_returns_expired() {
        let mut q = SleepQueue::new();
        q.insert(entry(5));
        q.insert(entry(15));
        assert!(q.pop_due(4).is_none());
        assert_eq!(q.pop_due(10).map(|e| e.wake), Some(5));
        assert!(q.pop_due(10).is_none());
        assert_eq!(q.pop_due(20).map(|e| e.wake), Some(15));
        assert!(q.head_wake().is_none());
    }

    #[test]
    fn interrupt_rearms_for_new_head() {
        {
            let mut q = SLEEPERS.lock();
            q.entries.clear();
            q.insert(entry(1));
            q.insert(entry(u64::MAX - 1));
        }
        arch::advance_time(2);
        handle_interrupt();
        // The due sleeper is gone and the compare tracks the survivor.
        assert_eq!(arch::timer_compare(), u64::MAX - 1);

        {
            let mut q = SLEEPERS.lock();
            q.entries.clear();
        }
        handle_interrupt();
        assert_eq!(arch::timer_compare(), u64::MAX);
        assert!(!arch::timer_irq_enabled());
    }

    #[test]
    fn ms_conversion_uses_platform_freq() {
        assert_eq!(ms_to_ticks(1000), freq_hz());
        assert_eq!(ms_to_ticks(0), 0);
    }
}
