// Yield points and the per-poll time context they read.
//
// The scheduler publishes the current monotonic time before polling a task.
// Sleep futures compare against it and leave behind the earliest deadline
// they are waiting for, which the run loop uses to decide how long to idle.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

thread_local! {
    static NOW: Cell<Option<Duration>> = const { Cell::new(None) };
    static NEXT_WAKE: Cell<Option<Duration>> = const { Cell::new(None) };
}

/// Start a new poll round at `now`, forgetting previously registered wakes
pub(crate) fn enter(now: Duration) {
    NOW.with(|n| n.set(Some(now)));
    NEXT_WAKE.with(|w| w.set(None));
}

/// Refresh the published time without dropping registered wakes
pub(crate) fn set_now(now: Duration) {
    NOW.with(|n| n.set(Some(now)));
}

/// Earliest deadline any pending future asked to be woken at
pub(crate) fn take_next_wake() -> Option<Duration> {
    NEXT_WAKE.with(|w| w.take())
}

fn current_time() -> Option<Duration> {
    NOW.with(|n| n.get())
}

fn register_wake(at: Duration) {
    NEXT_WAKE.with(|w| {
        let earliest = match w.get() {
            Some(existing) if existing <= at => existing,
            _ => at,
        };
        w.set(Some(earliest));
    });
}

/// Suspend the current task for at least `duration`.
///
/// Always suspends once, even for a zero duration. Polled outside a
/// scheduler (no published time) it completes immediately.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        duration,
        deadline: None,
    }
}

/// Give every other runnable task a turn before continuing
pub fn yield_control() -> YieldNow {
    YieldNow { yielded: false }
}

#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct Sleep {
    duration: Duration,
    deadline: Option<Duration>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let Some(now) = current_time() else {
            return Poll::Ready(());
        };

        match self.deadline {
            None => {
                let deadline = now + self.duration;
                self.deadline = Some(deadline);
                register_wake(deadline);
                Poll::Pending
            }
            Some(deadline) if now >= deadline => Poll::Ready(()),
            Some(deadline) => {
                register_wake(deadline);
                Poll::Pending
            }
        }
    }
}

#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        if let Some(now) = current_time() {
            register_wake(now);
        }
        Poll::Pending
    }
}
