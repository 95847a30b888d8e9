//! Collapse-to-latest execution guard.
//!
//! Shared by VPN apply and proxy reload: both are global operations
//! that rebuild from current registry state, so overlapping requests
//! must collapse to at most one in flight, with the latest state
//! winning. A collapsed request still reports the outcome of the run
//! that covered it; a failed rebuild is fatal to every request it
//! absorbed, not just the one that executed it.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use wiregate_common::{Error, Result};

/// At-most-one-in-flight guard over a rebuild-from-source operation.
///
/// Every caller marks the state dirty, then queues on the lock. The
/// caller that wins the lock performs the operation only if the dirty
/// flag is still set; losers find it cleared by an operation that
/// started at or after their request, and surface that operation's
/// result instead of running their own.
#[derive(Default)]
pub struct Coalesce {
    // Outcome of the most recent run, held under the same lock that
    // serializes runs. None means it succeeded.
    outcome: Mutex<Option<String>>,
    dirty: AtomicBool,
}

impl Coalesce {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `op`, collapsing overlapping calls. Returns `true` when this
    /// call actually executed the operation, `false` when it was
    /// absorbed by a successful run; an absorbed caller whose covering
    /// run failed gets that failure.
    pub async fn run<F, Fut>(&self, op: F) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        self.dirty.store(true, Ordering::SeqCst);
        let mut outcome = self.outcome.lock().await;
        if self.dirty.swap(false, Ordering::SeqCst) {
            let result = op().await;
            *outcome = result.as_ref().err().map(|e| e.to_string());
            result.map(|_| true)
        } else {
            match outcome.as_ref() {
                None => Ok(false),
                Some(msg) => Err(Error::Reconciliation(msg.clone())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_single_call_runs() {
        let guard = Coalesce::new();
        let ran = guard.run(|| async { Ok(()) }).await.unwrap();
        assert!(ran);
    }

    #[tokio::test]
    async fn test_overlapping_calls_collapse() {
        let guard = Arc::new(Coalesce::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let guard = guard.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                guard
                    .run(|| async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(())
                    })
                    .await
                    .unwrap()
            }));
        }

        let executed: usize = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap() as usize)
            .sum();

        // At least one call ran; the rest collapsed into in-flight runs.
        let total = runs.load(Ordering::SeqCst);
        assert_eq!(executed, total);
        assert!(total >= 1);
        assert!(total < 8);
    }

    #[tokio::test]
    async fn test_sequential_calls_each_run() {
        let guard = Coalesce::new();
        assert!(guard.run(|| async { Ok(()) }).await.unwrap());
        assert!(guard.run(|| async { Ok(()) }).await.unwrap());
    }

    #[tokio::test]
    async fn test_absorbed_caller_observes_covering_failure() {
        let guard = Arc::new(Coalesce::new());
        let calls = Arc::new(AtomicUsize::new(0));

        // First run succeeds, second run fails. On a current-thread
        // runtime the join polls in order: `a` wins the lock and runs;
        // `b` and `c` queue while `a` sleeps; `b` re-runs for both of
        // them and fails; `c` is absorbed by `b`'s run.
        let op = |guard: Arc<Coalesce>, calls: Arc<AtomicUsize>| async move {
            guard
                .run(|| async {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    if n == 1 {
                        Err(Error::Reconciliation("render failed".to_string()))
                    } else {
                        Ok(())
                    }
                })
                .await
        };

        let (a, b, c) = tokio::join!(
            op(guard.clone(), calls.clone()),
            op(guard.clone(), calls.clone()),
            op(guard.clone(), calls.clone())
        );

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(a.unwrap());
        assert!(b.is_err());
        // The absorbed caller must not report success
        let err = c.unwrap_err();
        assert!(err.to_string().contains("render failed"));
    }

    #[tokio::test]
    async fn test_failure_does_not_poison_later_calls() {
        let guard = Coalesce::new();
        assert!(guard
            .run(|| async { Err(Error::Reconciliation("boom".to_string())) })
            .await
            .is_err());

        // A fresh request triggers a fresh run and reports its own result
        assert!(guard.run(|| async { Ok(()) }).await.unwrap());
    }
}
