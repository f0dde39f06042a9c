//! Common utilities and helper functions
//!
//! This module provides shared utilities used across the crate.

pub mod retry;

use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// The guarded structures are only mutated in short, non-panicking sections,
/// so the data is still consistent after a poisoning.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolve once the shutdown flag is raised or its sender is gone.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_requested_on_signal() {
        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), shutdown_requested(&mut rx))
            .await
            .expect("shutdown should be observed");
    }

    #[tokio::test]
    async fn test_shutdown_requested_on_sender_drop() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), shutdown_requested(&mut rx))
            .await
            .expect("dropped sender should count as shutdown");
    }

    #[test]
    fn test_lock_recovers_poisoned_mutex() {
        let mutex = std::sync::Arc::new(Mutex::new(1));
        let cloned = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = cloned.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert_eq!(*lock(&mutex), 1);
    }
}
