//! Named resource locks.
//!
//! Each mutable shared resource (the designer roster, the tabulation labels,
//! the ledger workbook and the dataset file area) has one named async mutex.
//! Acquisition waits at most [`LOCK_WAIT`] before giving up, so a wedged
//! writer turns into an error response instead of a hung server.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::AppError;

/// Lock name for the designer roster file and table.
pub const DESIGNERS: &str = "projetistas";
/// Lock name for the tabulation labels.
pub const TABULATIONS: &str = "tabulacoes";
/// Lock name for the VI ALA ledger (rows and the id counter).
pub const LEDGER: &str = "vi_ala";
/// Lock name for the dataset file area (rotation and deletion).
pub const BASE: &str = "base";

/// How long an acquisition attempt may wait before failing.
pub const LOCK_WAIT: Duration = Duration::from_secs(5);

/// Registry of named mutexes, created once and shared via `AppState`.
pub struct LockManager {
    locks: HashMap<&'static str, Arc<Mutex<()>>>,
    wait: Duration,
}

impl LockManager {
    /// Creates the manager with the portal's four resource locks.
    pub fn new() -> Self {
        Self::with_wait(LOCK_WAIT)
    }

    /// Same as [`LockManager::new`] with a custom wait window. Tests use a
    /// short window to exercise the timeout path quickly.
    pub fn with_wait(wait: Duration) -> Self {
        let mut locks = HashMap::new();
        for name in [DESIGNERS, TABULATIONS, LEDGER, BASE] {
            locks.insert(name, Arc::new(Mutex::new(())));
        }
        LockManager { locks, wait }
    }

    /// Runs `fut` while holding the named lock.
    ///
    /// Returns [`AppError::LockTimeout`] if the lock is not free within the
    /// wait window. The lock is released as soon as the future completes,
    /// whether it succeeded or not.
    pub async fn with_lock<T, F>(&self, name: &'static str, fut: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, AppError>>,
    {
        let mutex = self
            .locks
            .get(name)
            .ok_or_else(|| AppError::Internal(format!("unknown lock '{}'", name)))?;
        let _guard = timeout(self.wait, mutex.lock())
            .await
            .map_err(|_| AppError::LockTimeout(name))?;
        log::debug!("Lock '{}' acquired", name);
        let out = fut.await;
        log::debug!("Lock '{}' released", name);
        out
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn critical_sections_do_not_overlap() {
        let manager = Arc::new(LockManager::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let manager = manager.clone();
            let inside = inside.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .with_lock(LEDGER, async {
                        let now = inside.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(now, 0, "another task was inside the section");
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn acquisition_times_out() {
        let manager = Arc::new(LockManager::with_wait(Duration::from_millis(50)));

        let holder = manager.clone();
        let held = tokio::spawn(async move {
            holder
                .with_lock(BASE, async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(())
                })
                .await
        });

        // Give the holder time to take the lock.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let result: Result<(), _> = manager.with_lock(BASE, async { Ok(()) }).await;
        assert!(matches!(result, Err(AppError::LockTimeout(BASE))));

        held.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn lock_released_after_error() {
        let manager = LockManager::new();
        let failed: Result<(), _> = manager
            .with_lock(DESIGNERS, async {
                Err(AppError::Validation("boom".into()))
            })
            .await;
        assert!(failed.is_err());

        // The lock must be free again.
        let ok: Result<(), AppError> = manager.with_lock(DESIGNERS, async { Ok(()) }).await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn unknown_lock_is_an_error() {
        let manager = LockManager::new();
        let result: Result<(), _> = manager.with_lock("nope", async { Ok(()) }).await;
        assert!(result.is_err());
    }
}
