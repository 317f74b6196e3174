//! Structured concurrency for probe fan-out.
//!
//! A [`TaskGroup`] owns every task it spawns. Tasks share a cancellation
//! scope derived from the caller's token, the first failure is kept, and
//! [`TaskGroup::wait`] only returns once every task has finished. Dropping a
//! group aborts whatever is still running, so no task outlives its group.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// How a task's failure affects its siblings, and whether sibling failures
/// reach the task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Policy {
    /// A failure cancels the group token; the task itself runs under that token.
    #[default]
    FailFast,
    /// Neither cancels siblings nor gets cancelled by them. Only cancellation of
    /// the parent token (or dropping the group) stops it.
    NeverCancel,
}

pub struct TaskGroup<E> {
    scope: CancellationToken,
    fail_fast: CancellationToken,
    tasks: JoinSet<()>,
    first_error: Arc<Mutex<Option<E>>>,
}

impl<E: Send + 'static> TaskGroup<E> {
    pub fn new(parent: &CancellationToken) -> Self {
        let scope = parent.child_token();
        let fail_fast = scope.child_token();
        Self {
            scope,
            fail_fast,
            tasks: JoinSet::new(),
            first_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Token that fail-fast tasks observe. Cancelled by the first fail-fast
    /// failure, by the parent, or once the group has been waited on.
    pub fn token(&self) -> CancellationToken {
        self.fail_fast.clone()
    }

    /// Spawn a fail-fast task.
    pub fn go<F, Fut>(&mut self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.spawn(Policy::FailFast, task);
    }

    pub fn spawn<F, Fut>(&mut self, policy: Policy, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let token = match policy {
            Policy::FailFast => self.fail_fast.clone(),
            Policy::NeverCancel => self.scope.child_token(),
        };
        let fail_fast = self.fail_fast.clone();
        let first_error = Arc::clone(&self.first_error);
        let fut = task(token);

        self.tasks.spawn(async move {
            if let Err(err) = fut.await {
                {
                    let mut slot = first_error.lock().unwrap_or_else(PoisonError::into_inner);
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                }
                if policy == Policy::FailFast {
                    fail_fast.cancel();
                }
            }
        });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Block until all tasks returned and hand back the first recorded failure.
    ///
    /// A panicking task is re-raised here instead of being folded into `E`.
    pub async fn wait(mut self) -> Result<(), E> {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(join_err) = joined {
                if join_err.is_panic() {
                    std::panic::resume_unwind(join_err.into_panic());
                }
            }
        }
        self.scope.cancel();

        let first = self
            .first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<E> Drop for TaskGroup<E> {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    #[tokio::test]
    async fn wait_returns_ok_when_all_succeed() {
        let root = CancellationToken::new();
        let mut group: TaskGroup<String> = TaskGroup::new(&root);
        for _ in 0..3 {
            group.go(|_| async { Ok(()) });
        }
        assert_eq!(group.len(), 3);
        assert!(group.wait().await.is_ok());
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn empty_group_waits_immediately() {
        let group: TaskGroup<String> = TaskGroup::new(&CancellationToken::new());
        assert!(group.is_empty());
        assert!(group.wait().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn first_failure_wins_and_cancels_later_tasks() {
        let root = CancellationToken::new();
        let mut group: TaskGroup<&'static str> = TaskGroup::new(&root);
        let started = Instant::now();
        let c_cancelled_at = Arc::new(Mutex::new(None));

        group.go(|token| async move {
            token.cancelled().await;
            Ok(())
        });
        group.go(|_| async {
            sleep(Duration::from_millis(10)).await;
            Err("task B")
        });
        let seen = Arc::clone(&c_cancelled_at);
        group.go(|token| async move {
            tokio::select! {
                _ = sleep(Duration::from_millis(20)) => Err("task C"),
                _ = token.cancelled() => {
                    *seen.lock().unwrap() = Some(Instant::now());
                    Ok(())
                }
            }
        });

        assert_eq!(group.wait().await, Err("task B"));
        let cancelled_at = c_cancelled_at
            .lock()
            .unwrap()
            .take()
            .expect("C observed cancellation");
        assert!(cancelled_at - started < Duration::from_millis(20));
        assert!(!root.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn never_cancel_task_survives_sibling_failure() {
        let root = CancellationToken::new();
        let mut group: TaskGroup<&'static str> = TaskGroup::new(&root);
        let finished = Arc::new(AtomicBool::new(false));

        let done = Arc::clone(&finished);
        group.spawn(Policy::NeverCancel, |token| async move {
            tokio::select! {
                _ = sleep(Duration::from_millis(50)) => {
                    done.store(true, Ordering::SeqCst);
                    Ok(())
                }
                _ = token.cancelled() => Err("cancelled by sibling"),
            }
        });
        group.spawn(Policy::NeverCancel, |_| async { Err("fails immediately") });

        assert_eq!(group.wait().await, Err("fails immediately"));
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_reaches_never_cancel_tasks() {
        let root = CancellationToken::new();
        let mut group: TaskGroup<&'static str> = TaskGroup::new(&root);
        group.spawn(Policy::NeverCancel, |token| async move {
            token.cancelled().await;
            Err("stopped by parent")
        });

        let canceller = root.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(5)).await;
            canceller.cancel();
        });

        assert_eq!(group.wait().await, Err("stopped by parent"));
    }

    #[tokio::test]
    async fn wait_cancels_scope_for_lingering_watchers() {
        let root = CancellationToken::new();
        let group: TaskGroup<()> = TaskGroup::new(&root);
        let token = group.token();
        group.wait().await.unwrap();
        assert!(token.is_cancelled());
    }
}
