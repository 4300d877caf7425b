//! Stop signal
//!
//! A run stops when either the in-process flag is raised (Ctrl-C, tests) or
//! the stop flag file appears on disk.

use crate::scheduler::Clock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Granularity of interruptible sleeps
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Cloneable stop request shared by all threads of a run
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag_file: Option<PathBuf>,
    requested: Arc<AtomicBool>,
}

impl StopSignal {
    /// Signal backed by a flag file (and the in-process flag)
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            flag_file: Some(path.into()),
            requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// In-process signal only
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag_file(&self) -> Option<&Path> {
        self.flag_file.as_deref()
    }

    /// Remove a flag file left over from a previous run
    pub fn clear_stale(&self) {
        if let Some(path) = &self.flag_file {
            if path.exists() {
                match std::fs::remove_file(path) {
                    Ok(()) => log::info!("Removed stale stop flag {:?}", path),
                    Err(e) => log::warn!("Cannot remove stale stop flag {:?}: {}", path, e),
                }
            }
        }
    }

    /// Raise the in-process flag
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Create the flag file so other processes see the request too
    pub fn request_via_file(&self) {
        self.request();
        if let Some(path) = &self.flag_file {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Err(e) = std::fs::write(path, b"") {
                log::warn!("Cannot create stop flag {:?}: {}", path, e);
            }
        }
    }

    /// True once a stop was requested by either route
    pub fn is_set(&self) -> bool {
        if self.requested.load(Ordering::SeqCst) {
            return true;
        }
        let file_set = self.flag_file.as_ref().is_some_and(|p| p.exists());
        if file_set {
            self.requested.store(true, Ordering::SeqCst);
        }
        file_set
    }

    /// Shared flag for signal handlers
    pub fn handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.requested)
    }

    /// Sleep for `total`, waking early if a stop is requested
    ///
    /// Returns `false` if the sleep was cut short.
    pub fn sleep(&self, clock: &dyn Clock, total: Duration) -> bool {
        // An unrepresentable deadline means sleep until stopped
        let deadline = clock.now().checked_add(total);
        loop {
            if self.is_set() {
                return false;
            }
            let remaining = deadline.map_or(SLEEP_SLICE, |d| d.saturating_duration_since(clock.now()));
            if remaining.is_zero() {
                return true;
            }
            clock.sleep(remaining.min(SLEEP_SLICE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualClock;
    use tempfile::TempDir;

    #[test]
    fn test_flag_file_lifecycle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stop.flag");
        std::fs::write(&path, b"").unwrap();

        let stop = StopSignal::with_file(&path);
        stop.clear_stale();
        assert!(!path.exists());
        assert!(!stop.is_set());

        std::fs::write(&path, b"").unwrap();
        assert!(stop.is_set());

        // Latched even after the file goes away
        std::fs::remove_file(&path).unwrap();
        assert!(stop.is_set());
    }

    #[test]
    fn test_in_process_request_shared_by_clones() {
        let stop = StopSignal::new();
        let other = stop.clone();
        assert!(!other.is_set());
        stop.request();
        assert!(other.is_set());
        assert!(stop.handle().load(Ordering::SeqCst));
    }

    #[test]
    fn test_request_via_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("stop.flag");
        let stop = StopSignal::with_file(&path);
        stop.request_via_file();
        assert!(path.exists());
        assert!(stop.is_set());
    }

    #[test]
    fn test_sleep_completes_or_aborts() {
        let clock = ManualClock::new();
        let stop = StopSignal::new();
        assert!(stop.sleep(&clock, Duration::from_millis(500)));
        assert_eq!(clock.elapsed(), Duration::from_millis(500));

        stop.request();
        assert!(!stop.sleep(&clock, Duration::from_secs(2)));
        assert_eq!(clock.elapsed(), Duration::from_millis(500));
    }
}
