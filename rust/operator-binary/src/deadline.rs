use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use snafu::Snafu;
use strum::{EnumDiscriminants, IntoStaticStr};
use tokio::{task::JoinError, time::Instant};

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum DeadlineError {
    #[snafu(display("operation timed out after {}", humantime::format_duration(*timeout)))]
    Expired { timeout: Duration },

    #[snafu(display("operation aborted: {}", source))]
    Aborted { source: JoinError },
}

/// A single wall-clock budget shared by every step of one reconciliation.
///
/// Blocking steps receive a cancellation flag that is raised when the budget
/// runs out. The step is then awaited to completion, so whatever it holds
/// (locks, scratch directories) is released before the caller sees the error.
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Instant,
    timeout: Duration,
    cancel: Arc<AtomicBool>,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            timeout,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.cancel.load(Ordering::Relaxed) || Instant::now() >= self.at
    }

    /// Runs `step` on the blocking pool.
    pub async fn run<T, F>(&self, step: F) -> Result<T, DeadlineError>
    where
        F: FnOnce(&AtomicBool) -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_expired() {
            self.cancel.store(true, Ordering::Relaxed);
            return ExpiredSnafu {
                timeout: self.timeout,
            }
            .fail();
        }

        let cancel = self.cancel.clone();
        let mut handle = tokio::task::spawn_blocking(move || step(&cancel));
        match tokio::time::timeout_at(self.at, &mut handle).await {
            Ok(joined) => joined.map_err(|source| DeadlineError::Aborted { source }),
            Err(_) => {
                self.cancel.store(true, Ordering::Relaxed);
                // Dropping the step's output releases what it acquired.
                drop(handle.await);
                ExpiredSnafu {
                    timeout: self.timeout,
                }
                .fail()
            }
        }
    }

    /// Bounds an async step, which is simply dropped on expiry.
    pub async fn wrap<F: Future>(&self, step: F) -> Result<F::Output, DeadlineError> {
        match tokio::time::timeout_at(self.at, step).await {
            Ok(output) => Ok(output),
            Err(_) => {
                self.cancel.store(true, Ordering::Relaxed);
                ExpiredSnafu {
                    timeout: self.timeout,
                }
                .fail()
            }
        }
    }
}
