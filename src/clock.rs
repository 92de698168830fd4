//! Injected time source.
//!
//! Every timer the link layer arms (scan restarts, connect retries,
//! inter-page pacing, response timeouts, the teardown grace window)
//! goes through the [`Clock`] trait so the restart/jitter logic is
//! testable without real delays. Production code uses [`SystemClock`]
//! (reactor timers via `async-io-mini`); tests drive a [`VirtualClock`]
//! forward manually.

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::cell::{Cell, RefCell};
use std::time::{Duration, Instant};

/// Monotonic time source with cancellable sleeps.
///
/// Dropping the future returned by [`Clock::sleep`] cancels the timer;
/// there is no separate clear call.
pub trait Clock {
    /// Monotonic time since an arbitrary fixed origin.
    fn now(&self) -> Duration;

    /// Resolve after `duration` has elapsed.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + '_;

    /// Uniform random duration in `[0, upper]`, used to desynchronize
    /// opportunistic scan cycles from periodic device behaviour.
    fn jitter(&self, upper: Duration) -> Duration;
}

// ── Production clock ──────────────────────────────────────────

/// Wall-clock implementation backed by the `async-io-mini` reactor.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + '_ {
        async move {
            let _ = async_io_mini::Timer::after(duration).await;
        }
    }

    fn jitter(&self, upper: Duration) -> Duration {
        let upper_ms = upper.as_millis() as u64;
        if upper_ms == 0 {
            return Duration::ZERO;
        }
        let ms = rand::Rng::gen_range(&mut rand::thread_rng(), 0..=upper_ms);
        Duration::from_millis(ms)
    }
}

// ── Virtual clock (tests) ─────────────────────────────────────

/// Deterministic clock for tests.
///
/// Time only moves when [`VirtualClock::advance`] is called; sleepers
/// whose deadline has been reached are woken. Jitter returns a fixed
/// configured value so cycle lengths stay predictable.
pub struct VirtualClock {
    now: Cell<Duration>,
    sleepers: RefCell<Vec<Sleeper>>,
    fixed_jitter: Cell<Duration>,
}

struct Sleeper {
    deadline: Duration,
    waker: Waker,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self {
            now: Cell::new(Duration::ZERO),
            sleepers: RefCell::new(Vec::new()),
            fixed_jitter: Cell::new(Duration::ZERO),
        }
    }

    /// Move time forward and wake every sleeper whose deadline passed.
    pub fn advance(&self, delta: Duration) {
        let now = self.now.get() + delta;
        self.now.set(now);
        let due: Vec<Sleeper> = {
            let mut sleepers = self.sleepers.borrow_mut();
            let mut due = Vec::new();
            sleepers.retain_mut(|s| {
                if s.deadline <= now {
                    due.push(Sleeper {
                        deadline: s.deadline,
                        waker: s.waker.clone(),
                    });
                    false
                } else {
                    true
                }
            });
            due
        };
        for s in due {
            s.waker.wake();
        }
    }

    /// Fix the value returned by [`Clock::jitter`] (clamped to the
    /// caller's upper bound).
    pub fn set_jitter(&self, jitter: Duration) {
        self.fixed_jitter.set(jitter);
    }

    /// Number of currently parked sleepers.
    pub fn sleeper_count(&self) -> usize {
        self.sleepers.borrow().len()
    }

    fn park(&self, deadline: Duration, waker: &Waker) {
        let mut sleepers = self.sleepers.borrow_mut();
        for s in sleepers.iter_mut() {
            if s.deadline == deadline && s.waker.will_wake(waker) {
                return;
            }
        }
        sleepers.push(Sleeper {
            deadline,
            waker: waker.clone(),
        });
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + '_ {
        VirtualSleep {
            clock: self,
            deadline: self.now.get() + duration,
        }
    }

    fn jitter(&self, upper: Duration) -> Duration {
        self.fixed_jitter.get().min(upper)
    }
}

struct VirtualSleep<'a> {
    clock: &'a VirtualClock,
    deadline: Duration,
}

impl Future for VirtualSleep<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.clock.now.get() >= self.deadline {
            Poll::Ready(())
        } else {
            self.clock.park(self.deadline, cx.waker());
            Poll::Pending
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
