use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Exclusive advisory lock on a state directory, released on drop.
pub struct StateLock {
    lock_file: File,
}

fn open_lock_file(lock_path: &Path) -> Result<File, CoreError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?)
}

impl StateLock {
    /// Take the lock, or fail with [`CoreError::StateLocked`] when another
    /// process holds it. A run never waits for a concurrent writer.
    pub fn acquire(lock_path: &Path) -> Result<Self, CoreError> {
        Self::try_acquire(lock_path)?
            .ok_or_else(|| CoreError::StateLocked(lock_path.display().to_string()))
    }

    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, CoreError> {
        let file = open_lock_file(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

#[derive(Default)]
struct TokenState {
    cancelled: Mutex<bool>,
    signal: Condvar,
}

/// Cooperative cancellation shared between the run loop and whoever stops it.
///
/// Checked between components and while waiting on ready conditions; an
/// in-flight delegate call always runs to completion.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenState>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if let Ok(mut cancelled) = self.inner.cancelled.lock() {
            *cancelled = true;
        }
        self.inner.signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.lock().map(|c| *c).unwrap_or(true)
    }

    /// Sleep up to `timeout`, waking early on cancellation.
    /// Returns whether the token is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let Ok(mut cancelled) = self.inner.cancelled.lock() else {
            return true;
        };
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.inner.signal.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => cancelled = guard,
                Err(_) => return true,
            }
        }
        *cancelled
    }
}

static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);
static SIGNALLED: AtomicBool = AtomicBool::new(false);

/// Route Ctrl-C to `token`: the first signal cancels it so the current
/// component finishes, the second exits immediately.
///
/// Only the first call installs a handler; the process keeps one for its lifetime.
pub fn install_signal_handler(token: &CancellationToken) {
    if HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    let token = token.clone();
    let _ = ctrlc::set_handler(move || {
        if SIGNALLED.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!("\ncancellation requested, finishing current component...");
        token.cancel();
    });
}
