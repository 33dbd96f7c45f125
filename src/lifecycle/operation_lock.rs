//! Per-instance mutual-exclusion lock guarding lifecycle transitions.
//!
//! Mirrors the double-checked-locking shape of `litebox/lifecycle.rs`'s
//! `ensure_ready`, but adds join semantics for operations marked
//! reusable: a second `Stop` racing an in-flight `Stop` waits for it and
//! adopts its result instead of failing with `OperationConflict`.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{CoreError, CoreResult, OperationAction};

struct InFlight {
    action: OperationAction,
    reusable: bool,
    done: Arc<Notify>,
    result: Arc<Mutex<Option<Result<(), String>>>>,
}

pub struct OperationLock {
    state: Mutex<Option<InFlight>>,
}

impl Default for OperationLock {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationLock {
    pub fn new() -> Self {
        Self { state: Mutex::new(None) }
    }

    /// Acquire the lock for `action`. Returns an owned [`OperationGuard`]
    /// when this call wins the race; when another reusable operation of
    /// the same action is already in flight, waits for it and returns its
    /// result directly rather than conflicting.
    pub async fn acquire(&self, action: OperationAction, reusable: bool) -> CoreResult<Acquired<'_>> {
        loop {
            let join_on = {
                let mut state = self.state.lock();
                match state.as_ref() {
                    Some(in_flight) if in_flight.reusable && in_flight.action == action => {
                        Some((in_flight.done.clone(), in_flight.result.clone()))
                    }
                    Some(in_flight) => return Err(CoreError::OperationConflict(in_flight.action)),
                    None => {
                        let done = Arc::new(Notify::new());
                        let result = Arc::new(Mutex::new(None));
                        *state = Some(InFlight { action, reusable, done: done.clone(), result: result.clone() });
                        return Ok(Acquired::Owner(OperationGuard {
                            lock: self,
                            done,
                            result,
                            settled: false,
                        }));
                    }
                }
            };

            if let Some((done, result)) = join_on {
                done.notified().await;
                if let Some(result) = result.lock().clone() {
                    return Ok(Acquired::Joined(result.map_err(CoreError::Internal)));
                }
                // The owner dropped without settling a result (panic); retry
                // the acquire from scratch.
            }
        }
    }
}

pub enum Acquired<'a> {
    Owner(OperationGuard<'a>),
    Joined(CoreResult<()>),
}

pub struct OperationGuard<'a> {
    lock: &'a OperationLock,
    done: Arc<Notify>,
    result: Arc<Mutex<Option<Result<(), String>>>>,
    settled: bool,
}

impl OperationGuard<'_> {
    /// Record the transition's outcome, release the lock, and wake any
    /// joined waiters.
    pub fn complete(mut self, outcome: &CoreResult<()>) {
        self.settle(outcome.as_ref().map(|_| ()).map_err(|e| e.to_string()));
    }

    fn settle(&mut self, result: Result<(), String>) {
        *self.result.lock() = Some(result);
        *self.lock.state.lock() = None;
        self.done.notify_waiters();
        self.settled = true;
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!("operation guard dropped without completing, clearing lock");
            self.settle(Err("operation aborted without completing".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_conflicting_action_fails() {
        let lock = OperationLock::new();
        let guard = match lock.acquire(OperationAction::Start, false).await.unwrap() {
            Acquired::Owner(g) => g,
            Acquired::Joined(_) => panic!("expected owner"),
        };

        let err = lock.acquire(OperationAction::Start, false).await.unwrap_err();
        assert!(matches!(err, CoreError::OperationConflict(OperationAction::Start)));

        guard.complete(&Ok(()));
    }

    #[tokio::test]
    async fn reusable_action_joins_and_shares_result() {
        let lock = Arc::new(OperationLock::new());
        let guard = match lock.acquire(OperationAction::Stop, true).await.unwrap() {
            Acquired::Owner(g) => g,
            Acquired::Joined(_) => panic!("expected owner"),
        };

        let lock2 = lock.clone();
        let joined = tokio::spawn(async move { lock2.acquire(OperationAction::Stop, true).await });

        tokio::task::yield_now().await;
        guard.complete(&Ok(()));

        match joined.await.unwrap().unwrap() {
            Acquired::Joined(result) => assert!(result.is_ok()),
            Acquired::Owner(_) => panic!("expected joined"),
        }
    }

    #[tokio::test]
    async fn lock_is_free_again_after_complete() {
        let lock = OperationLock::new();
        let guard = match lock.acquire(OperationAction::Restart, false).await.unwrap() {
            Acquired::Owner(g) => g,
            Acquired::Joined(_) => panic!("expected owner"),
        };
        guard.complete(&Ok(()));

        assert!(matches!(
            lock.acquire(OperationAction::Restart, false).await,
            Ok(Acquired::Owner(_))
        ));
    }
}
