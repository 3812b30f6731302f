use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::AuthError;

/// Something the purge loop sweeps on every pass.
#[async_trait]
pub trait Purgeable: Send + Sync {
    fn name(&self) -> &'static str;

    /// Remove expired entries, returning how many went away.
    async fn purge(&self) -> Result<usize, AuthError>;
}

/// Start a background task that sweeps every target each `interval` until
/// `shutdown` fires. A failing or panicking pass is logged and the loop carries on.
pub fn spawn_purge_task(
    targets: Vec<Arc<dyn Purgeable>>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("purge loop stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            for target in &targets {
                match AssertUnwindSafe(target.purge()).catch_unwind().await {
                    Ok(Ok(0)) => {}
                    Ok(Ok(removed)) => info!(target = target.name(), removed, "purged expired entries"),
                    Ok(Err(e)) => error!(target = target.name(), error = %e, "purge pass failed"),
                    Err(_) => error!(target = target.name(), "purge pass panicked"),
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Purgeable for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn purge(&self) -> Result<usize, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            match n % 3 {
                0 => Err(AuthError::Malformed("disk on fire".into())),
                1 => panic!("purge exploded"),
                _ => Ok(n),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn loop_survives_errors_and_panics() {
        let flaky = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
        });
        let shutdown = CancellationToken::new();
        let handle = spawn_purge_task(
            vec![flaky.clone() as Arc<dyn Purgeable>],
            Duration::from_secs(60),
            shutdown.clone(),
        );

        // First tick fires immediately, then once per interval.
        tokio::time::sleep(Duration::from_secs(60 * 5 + 1)).await;
        assert!(flaky.calls.load(Ordering::SeqCst) >= 6);
        assert!(!handle.is_finished());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_first_pass_exits_cleanly() {
        let flaky = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
        });
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let handle = spawn_purge_task(vec![flaky.clone() as Arc<dyn Purgeable>], Duration::from_secs(60), shutdown);
        handle.await.unwrap();
        assert!(flaky.calls.load(Ordering::SeqCst) <= 1);
    }
}
