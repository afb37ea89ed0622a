use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    #[error("acquire cancelled")]
    Cancelled,

    #[error("semaphore closed")]
    Closed,
}

/// An async counting semaphore with FIFO waiters and n-permit acquisition.
///
/// `increment` either satisfies the head waiter or banks the permits.
/// Cancelling a blocked `acquire` is race-free: the waiter removal and the
/// signalled check happen under the same lock, so a waiter that was already
/// signalled keeps its permits and the cancellation is ignored.
#[derive(Debug)]
pub struct Semaphore {
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    value: u64,
    closed: bool,
    waiters: VecDeque<Arc<Waiter>>,
}

#[derive(Debug)]
struct Waiter {
    amount: u64,
    signaled: AtomicBool,
    notify: Notify,
}

impl Semaphore {
    pub fn new(initial: u64) -> Self {
        Semaphore {
            state: Mutex::new(State {
                value: initial,
                closed: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn available(&self) -> u64 {
        self.state.lock().expect("semaphore lock").value
    }

    /// Acquires exactly `amount` permits, blocking in FIFO order until they
    /// are available, `ctx` cancels, or the semaphore closes.
    pub async fn acquire(&self, ctx: &CancellationToken, amount: u64) -> Result<(), AcquireError> {
        let waiter = {
            let mut state = self.state.lock().expect("semaphore lock");
            if state.closed {
                return Err(AcquireError::Closed);
            }

            if state.waiters.is_empty() && state.value >= amount {
                state.value -= amount;
                return Ok(());
            }

            let waiter = Arc::new(Waiter {
                amount,
                signaled: AtomicBool::new(false),
                notify: Notify::new(),
            });
            state.waiters.push_back(waiter.clone());
            waiter
        };

        tokio::select! {
            _ = waiter.notify.notified() => {
                if waiter.signaled.load(Ordering::Acquire) {
                    Ok(())
                } else {
                    // Woken by close, not by permits.
                    Err(AcquireError::Closed)
                }
            }
            _ = ctx.cancelled() => self.abandon(&waiter, AcquireError::Cancelled),
        }
    }

    /// Removes a waiter after cancellation or close. If the waiter was
    /// signalled before we got the lock, the acquisition stands.
    fn abandon(&self, waiter: &Arc<Waiter>, err: AcquireError) -> Result<(), AcquireError> {
        let mut state = self.state.lock().expect("semaphore lock");
        if waiter.signaled.load(Ordering::Acquire) {
            return Ok(());
        }

        state.waiters.retain(|w| !Arc::ptr_eq(w, waiter));
        Err(err)
    }

    /// Returns `amount` permits, waking queued waiters whose requests are
    /// now satisfiable, head first.
    pub fn increment(&self, amount: u64) {
        let mut state = self.state.lock().expect("semaphore lock");
        state.value += amount;

        while let Some(head) = state.waiters.front() {
            if head.amount > state.value {
                break;
            }

            let head = state.waiters.pop_front().expect("head exists");
            state.value -= head.amount;
            head.signaled.store(true, Ordering::Release);
            head.notify.notify_one();
        }
    }

    /// Greedy acquisition: takes up to `max` permits, waiting at most
    /// `timeout` for the full amount. On timeout or cancellation it takes
    /// whatever has accumulated, which may be zero — a positive partial
    /// acquisition survives cancellation.
    pub async fn acquire_at_most(
        &self,
        ctx: &CancellationToken,
        timeout: Duration,
        max: u64,
    ) -> u64 {
        let waiter = {
            let mut state = self.state.lock().expect("semaphore lock");
            if state.closed {
                return 0;
            }

            if state.waiters.is_empty() && state.value >= max {
                state.value -= max;
                return max;
            }

            let waiter = Arc::new(Waiter {
                amount: max,
                signaled: AtomicBool::new(false),
                notify: Notify::new(),
            });
            state.waiters.push_back(waiter.clone());
            waiter
        };

        tokio::select! {
            _ = waiter.notify.notified() => {
                if waiter.signaled.load(Ordering::Acquire) {
                    max
                } else {
                    0
                }
            }
            _ = tokio::time::sleep(timeout) => self.take_partial(&waiter, max),
            _ = ctx.cancelled() => self.take_partial(&waiter, max),
        }
    }

    fn take_partial(&self, waiter: &Arc<Waiter>, max: u64) -> u64 {
        let mut state = self.state.lock().expect("semaphore lock");
        if waiter.signaled.load(Ordering::Acquire) {
            return max;
        }

        state.waiters.retain(|w| !Arc::ptr_eq(w, waiter));
        let taken = state.value.min(max);
        state.value -= taken;
        taken
    }

    /// Wakes every waiter and fails subsequent acquisitions. Banked permits
    /// are kept so partial takes drain out.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("semaphore lock");
        state.closed = true;
        for waiter in state.waiters.drain(..) {
            waiter.notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn acquire_available() {
        let sem = Semaphore::new(3);
        sem.acquire(&ctx(), 2).await.unwrap();
        assert_eq!(sem.available(), 1);
    }

    #[tokio::test]
    async fn acquire_blocks_until_increment() {
        let sem = Arc::new(Semaphore::new(0));

        let task = {
            let sem = sem.clone();
            tokio::spawn(async move { sem.acquire(&ctx(), 2).await })
        };

        tokio::task::yield_now().await;
        sem.increment(1);
        tokio::task::yield_now().await;
        assert!(!task.is_finished());

        sem.increment(1);
        task.await.unwrap().unwrap();
        assert_eq!(sem.available(), 0);
    }

    #[tokio::test]
    async fn cancelled_acquire_returns_error() {
        let sem = Arc::new(Semaphore::new(0));
        let token = ctx();

        let task = {
            let sem = sem.clone();
            let token = token.clone();
            tokio::spawn(async move { sem.acquire(&token, 1).await })
        };

        tokio::task::yield_now().await;
        token.cancel();
        assert_eq!(task.await.unwrap(), Err(AcquireError::Cancelled));

        // The waiter is gone; permits are banked for the next caller.
        sem.increment(1);
        assert_eq!(sem.available(), 1);
    }

    #[tokio::test]
    async fn fifo_ordering() {
        let sem = Arc::new(Semaphore::new(0));

        let first = {
            let sem = sem.clone();
            tokio::spawn(async move { sem.acquire(&ctx(), 2).await })
        };
        tokio::task::yield_now().await;

        let second = {
            let sem = sem.clone();
            tokio::spawn(async move { sem.acquire(&ctx(), 1).await })
        };
        tokio::task::yield_now().await;

        // One permit satisfies the second waiter's request, but the first
        // waiter is at the head, so nobody wakes.
        sem.increment(1);
        tokio::task::yield_now().await;
        assert!(!first.is_finished());
        assert!(!second.is_finished());

        sem.increment(1);
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_at_most_times_out_with_partial() {
        let sem = Arc::new(Semaphore::new(3));
        let got = sem
            .acquire_at_most(&ctx(), Duration::from_millis(10), 5)
            .await;
        assert_eq!(got, 3);
        assert_eq!(sem.available(), 0);
    }

    #[tokio::test]
    async fn acquire_at_most_full_amount_immediately() {
        let sem = Semaphore::new(5);
        let got = sem
            .acquire_at_most(&ctx(), Duration::from_secs(60), 5)
            .await;
        assert_eq!(got, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_at_most_waits_for_full_amount() {
        let sem = Arc::new(Semaphore::new(1));

        let task = {
            let sem = sem.clone();
            tokio::spawn(async move {
                sem.acquire_at_most(&ctx(), Duration::from_secs(5), 3).await
            })
        };

        tokio::task::yield_now().await;
        sem.increment(2);
        assert_eq!(task.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn close_wakes_waiters() {
        let sem = Arc::new(Semaphore::new(0));

        let task = {
            let sem = sem.clone();
            tokio::spawn(async move { sem.acquire(&ctx(), 1).await })
        };

        tokio::task::yield_now().await;
        sem.close();
        assert_eq!(task.await.unwrap(), Err(AcquireError::Closed));
        assert_eq!(
            sem.acquire(&ctx(), 1).await,
            Err(AcquireError::Closed)
        );
    }
}
