/// Supervised background tasks
///
/// Restarts a failing or panicking task with exponential backoff until it
/// finishes cleanly or the process-wide shutdown signal fires.

use std::{future::Future, time::Duration};
use tokio::sync::watch;

/// Initial backoff, doubled on each consecutive failure
pub const INITIAL_BACKOFF_MS: u64 = 250;
/// Backoff cap
pub const MAX_BACKOFF_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(INITIAL_BACKOFF_MS),
            max: Duration::from_millis(MAX_BACKOFF_MS),
        }
    }
}

impl BackoffPolicy {
    /// Delay before restart number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// How a supervised task ended for good
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    Completed,
    Shutdown,
}

/// Run `make_task` until it returns `Ok`, restarting it on error or panic
pub async fn supervise<F, Fut>(
    name: &str,
    policy: BackoffPolicy,
    mut shutdown: watch::Receiver<bool>,
    mut make_task: F,
) -> SupervisorExit
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut attempts: u32 = 0;

    loop {
        if *shutdown.borrow() {
            return SupervisorExit::Shutdown;
        }

        let mut task = tokio::spawn(make_task());
        let outcome = tokio::select! {
            joined = &mut task => joined,
            _ = shutdown.changed() => {
                task.abort();
                tracing::info!(task = name, "🛑 Supervised task cancelled by shutdown");
                return SupervisorExit::Shutdown;
            }
        };

        match outcome {
            Ok(Ok(())) => {
                tracing::info!(task = name, "✅ Supervised task finished");
                return SupervisorExit::Completed;
            }
            Ok(Err(e)) => {
                attempts += 1;
                tracing::warn!(task = name, attempts, error = %e, "⚠️ Supervised task failed");
            }
            Err(join_error) => {
                attempts += 1;
                tracing::error!(task = name, attempts, error = %join_error, "❌ Supervised task panicked");
            }
        }

        let backoff = policy.delay(attempts);
        tracing::debug!(task = name, backoff_ms = backoff.as_millis() as u64, "⏳ Restarting after backoff");
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => return SupervisorExit::Shutdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    fn fast() -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(250));
        assert_eq!(policy.delay(2), Duration::from_millis(500));
        assert_eq!(policy.delay(4), Duration::from_millis(2_000));
        assert_eq!(policy.delay(20), Duration::from_millis(30_000));
        assert_eq!(policy.delay(200), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn restarts_until_success() {
        let (_stop, shutdown) = watch::channel(false);
        let runs = Arc::new(AtomicU32::new(0));

        let exit = {
            let runs = Arc::clone(&runs);
            supervise("flaky", fast(), shutdown, move || {
                let runs = Arc::clone(&runs);
                async move {
                    match runs.fetch_add(1, Ordering::SeqCst) {
                        0 => anyhow::bail!("first run fails"),
                        1 => panic!("second run panics"),
                        _ => Ok(()),
                    }
                }
            })
            .await
        };

        assert_eq!(exit, SupervisorExit::Completed);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn shutdown_stops_a_running_task() {
        let (stop, shutdown) = watch::channel(false);
        let supervisor = tokio::spawn(supervise("forever", fast(), shutdown, || async {
            std::future::pending::<anyhow::Result<()>>().await
        }));

        stop.send(true).unwrap();
        assert_eq!(supervisor.await.unwrap(), SupervisorExit::Shutdown);
    }
}
