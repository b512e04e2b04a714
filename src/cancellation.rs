//! Pause / stop / inject signal set shared by the engine and the operator.
//!
//! One `CancellationContext` is created per run and handed out as an `Arc`. The four
//! signals are plain booleans behind a single `parking_lot::Mutex`; every transition
//! notifies a `Condvar`, so a waiting engine thread wakes as soon as the operator
//! resumes or stops instead of on the next poll tick.
//!
//! Ownership of the signals:
//!
//! | signal           | set by                      | cleared by                     |
//! |------------------|-----------------------------|--------------------------------|
//! | `pause`          | operator, single-cell flow  | operator (`resume`)            |
//! | `stop`           | operator                    | never within a run             |
//! | `inject_pending` | engine (single-cell flow)   | engine, at each new repetition |
//! | `plot_enabled`   | UI                          | UI                             |
//!
//! Every wait checks `stop` before `pause`.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default, Clone, Copy)]
struct Signals {
    pause: bool,
    stop: bool,
    inject_pending: bool,
    plot_enabled: bool,
}

/// Result of waiting out a pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseOutcome {
    /// Not paused, or the operator resumed.
    Continue,
    /// A stop was requested before or during the pause.
    Stopped,
}

/// Shared run signals. See the module docs for ownership rules.
#[derive(Debug)]
pub struct CancellationContext {
    signals: Mutex<Signals>,
    changed: Condvar,
}

impl Default for CancellationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationContext {
    /// Fresh context with every signal cleared except `plot_enabled`.
    pub fn new() -> Self {
        Self {
            signals: Mutex::new(Signals {
                plot_enabled: true,
                ..Signals::default()
            }),
            changed: Condvar::new(),
        }
    }

    fn update(&self, f: impl FnOnce(&mut Signals)) {
        let mut signals = self.signals.lock();
        f(&mut signals);
        drop(signals);
        self.changed.notify_all();
    }

    /// Ask the engine to pause at its next check.
    pub fn request_pause(&self) {
        self.update(|s| s.pause = true);
    }

    /// Clear a pause.
    pub fn resume(&self) {
        self.update(|s| s.pause = false);
    }

    /// Ask the engine to stop. Stop is sticky for the lifetime of the context.
    pub fn request_stop(&self) {
        self.update(|s| s.stop = true);
    }

    /// True once a stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.signals.lock().stop
    }

    /// True while paused.
    pub fn is_paused(&self) -> bool {
        self.signals.lock().pause
    }

    /// True while a single-cell injection waits for the operator.
    pub fn inject_pending(&self) -> bool {
        self.signals.lock().inject_pending
    }

    /// Set or clear the inject-pending flag.
    pub fn set_inject_pending(&self, pending: bool) {
        self.update(|s| s.inject_pending = pending);
    }

    /// Atomically set `inject_pending` and `pause`, unless an injection is already
    /// pending. Returns false in that case and leaves the signals untouched.
    pub fn begin_injection_pause(&self) -> bool {
        let mut signals = self.signals.lock();
        if signals.inject_pending {
            return false;
        }
        signals.inject_pending = true;
        signals.pause = true;
        drop(signals);
        self.changed.notify_all();
        true
    }

    /// Advisory flag read by live plot consumers.
    pub fn plot_enabled(&self) -> bool {
        self.signals.lock().plot_enabled
    }

    /// Enable or disable live plotting.
    pub fn set_plot_enabled(&self, enabled: bool) {
        self.update(|s| s.plot_enabled = enabled);
    }

    /// Clear pause, stop and inject-pending for a new run.
    pub fn reset(&self) {
        self.update(|s| {
            s.pause = false;
            s.stop = false;
            s.inject_pending = false;
        });
    }

    /// Block while paused.
    ///
    /// Wakes immediately on resume or stop. While paused, `on_tick` runs every `tick`
    /// with the current `inject_pending` value, outside the lock.
    pub fn wait_while_paused<F>(&self, tick: Duration, mut on_tick: F) -> PauseOutcome
    where
        F: FnMut(bool),
    {
        let mut signals = self.signals.lock();
        loop {
            if signals.stop {
                return PauseOutcome::Stopped;
            }
            if !signals.pause {
                return PauseOutcome::Continue;
            }
            let timed_out = self.changed.wait_for(&mut signals, tick).timed_out();
            if timed_out && signals.pause && !signals.stop {
                let pending = signals.inject_pending;
                drop(signals);
                on_tick(pending);
                signals = self.signals.lock();
            }
        }
    }

    /// Sleep for `duration` unless a stop arrives first.
    ///
    /// Returns true when the full duration elapsed, false when cut short by `stop`.
    /// Pause does not interrupt a running action.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut signals = self.signals.lock();
        loop {
            if signals.stop {
                return false;
            }
            if Instant::now() >= deadline {
                return true;
            }
            self.changed.wait_until(&mut signals, deadline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn sleep_completes_without_stop() {
        let ctx = CancellationContext::new();
        let start = Instant::now();
        assert!(ctx.sleep(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn stop_cuts_sleep_short() {
        let ctx = Arc::new(CancellationContext::new());
        let stopper = Arc::clone(&ctx);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stopper.request_stop();
        });

        let start = Instant::now();
        assert!(!ctx.sleep(Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }

    #[test]
    fn pause_does_not_interrupt_sleep() {
        let ctx = CancellationContext::new();
        ctx.request_pause();
        assert!(ctx.sleep(Duration::from_millis(20)));
    }

    #[test]
    fn wait_while_paused_returns_on_resume() {
        let ctx = Arc::new(CancellationContext::new());
        ctx.request_pause();

        let resumer = Arc::clone(&ctx);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            resumer.resume();
        });

        let outcome = ctx.wait_while_paused(Duration::from_secs(10), |_| {});
        assert_eq!(outcome, PauseOutcome::Continue);
        handle.join().unwrap();
    }

    #[test]
    fn stop_wins_over_pause() {
        let ctx = CancellationContext::new();
        ctx.request_pause();
        ctx.request_stop();
        assert_eq!(
            ctx.wait_while_paused(Duration::from_millis(10), |_| {}),
            PauseOutcome::Stopped
        );
    }

    #[test]
    fn ticks_report_inject_pending() {
        let ctx = Arc::new(CancellationContext::new());
        assert!(ctx.begin_injection_pause());

        let ticks = Arc::new(AtomicUsize::new(0));
        let resumer = Arc::clone(&ctx);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(120));
            resumer.resume();
        });

        let seen = Arc::clone(&ticks);
        ctx.wait_while_paused(Duration::from_millis(20), |pending| {
            assert!(pending);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        handle.join().unwrap();
        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn second_injection_pause_is_refused() {
        let ctx = CancellationContext::new();
        assert!(ctx.begin_injection_pause());
        ctx.resume();
        assert!(!ctx.begin_injection_pause());
        assert!(!ctx.is_paused());
        ctx.set_inject_pending(false);
        assert!(ctx.begin_injection_pause());
    }

    #[test]
    fn reset_keeps_plot_flag() {
        let ctx = CancellationContext::new();
        ctx.set_plot_enabled(false);
        ctx.request_stop();
        ctx.reset();
        assert!(!ctx.is_stopped());
        assert!(!ctx.plot_enabled());
    }
}
