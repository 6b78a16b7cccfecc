//! The Job Pool (spec §4.E): a fixed number of concurrency "slots" tasks
//! acquire before running their command phase, and release afterward.
//!
//! Grounded in the original's `JobPool` (an `asyncio.Condition` guarding a
//! slot list) — translated here to a `std::sync::Mutex`-protected slot
//! vector plus a [`tokio::sync::Notify`] for the wake, since
//! `tokio::sync::Semaphore` has no way to record which task holds which
//! slot (needed for diagnostics) and no way to express "release N slots,
//! wake every waiter regardless of how many slots each one wants" — the
//! thundering-herd-but-correctness-preserving release spec §4.E and §9
//! call for.

use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::KilnError;

/// One concurrency slot: empty, or claimed by a task (identified by an
/// opaque token — in practice a `Task`'s `Uuid`) for diagnostics.
struct Slots {
    holders: Vec<Option<String>>,
    available: usize,
}

/// Bounded concurrency resource shared by every task awaiting the command
/// phase. Cheap to clone-share via `Arc` — construct one per build run.
pub struct JobPool {
    slots: Mutex<Slots>,
    notify: Notify,
    capacity: usize,
}

impl std::fmt::Debug for JobPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let available = self.slots.lock().unwrap_or_else(|e| e.into_inner()).available;
        f.debug_struct("JobPool")
            .field("capacity", &self.capacity)
            .field("available", &available)
            .finish()
    }
}

impl JobPool {
    /// Builds a pool with `capacity` slots (spec §6: `-j`/`--jobs`, default
    /// the number of CPUs).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Slots {
                holders: vec![None; capacity],
                available: capacity,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Acquires `count` slots for `token`, suspending until that many are
    /// simultaneously free. Requesting more slots than the pool holds in
    /// total is a fatal configuration error, not something to wait out
    /// (spec §4.E).
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::Config`] if `count` exceeds the pool's total
    /// capacity.
    pub async fn acquire(&self, count: usize, token: &str) -> Result<(), KilnError> {
        if count > self.capacity {
            return Err(KilnError::Config(format!(
                "task requested {count} job slots but the pool only has {}",
                self.capacity
            )));
        }
        loop {
            // Register as a waiter *before* checking, not after — otherwise a
            // release() between the check and the `notified()` call could be
            // missed entirely.
            let notified = self.notify.notified();
            {
                let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
                if slots.available >= count {
                    let mut claimed = 0;
                    for slot in &mut slots.holders {
                        if claimed == count {
                            break;
                        }
                        if slot.is_none() {
                            *slot = Some(token.to_string());
                            claimed += 1;
                        }
                    }
                    slots.available -= count;
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Releases `count` slots previously claimed by `token` and wakes every
    /// current waiter (not just enough to satisfy one of them) — the
    /// wake-all release semantics named in spec §4.E/§9: the pool cannot
    /// know in advance which waiter, if any, now has enough free slots to
    /// proceed, so it wakes them all and lets each re-check for itself.
    pub fn release(&self, count: usize, token: &str) {
        {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let mut freed = 0;
            for slot in &mut slots.holders {
                if freed == count {
                    break;
                }
                if slot.as_deref() == Some(token) {
                    *slot = None;
                    freed += 1;
                }
            }
            slots.available += freed;
        }
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_and_release_round_trips_availability() {
        let pool = JobPool::new(4);
        pool.acquire(3, "a").await.unwrap();
        assert_eq!(pool.slots.lock().unwrap().available, 1);
        pool.release(3, "a");
        assert_eq!(pool.slots.lock().unwrap().available, 4);
    }

    #[tokio::test]
    async fn requesting_more_than_capacity_is_a_fatal_error() {
        let pool = JobPool::new(2);
        let err = pool.acquire(3, "a").await.unwrap_err();
        assert!(matches!(err, KilnError::Config(_)));
    }

    #[tokio::test]
    async fn a_waiter_is_woken_once_enough_slots_free() {
        let pool = Arc::new(JobPool::new(2));
        pool.acquire(2, "a").await.unwrap();

        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move {
            waiter_pool.acquire(2, "b").await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(2, "a");

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should have been woken")
            .unwrap();
    }

    #[tokio::test]
    async fn multiple_small_waiters_both_proceed_after_one_large_release() {
        let pool = Arc::new(JobPool::new(2));
        pool.acquire(2, "a").await.unwrap();

        let p1 = pool.clone();
        let w1 = tokio::spawn(async move { p1.acquire(1, "b").await.unwrap() });
        let p2 = pool.clone();
        let w2 = tokio::spawn(async move { p2.acquire(1, "c").await.unwrap() });

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(2, "a");

        tokio::time::timeout(Duration::from_secs(1), async {
            w1.await.unwrap();
            w2.await.unwrap();
        })
        .await
        .expect("both waiters should have acquired their single slot");
    }
}
