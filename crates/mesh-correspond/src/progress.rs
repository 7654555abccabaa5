//! Progress reporting and cancellation for batch correspondence runs.
//!
//! - [`ProgressCallback`] receives [`Progress`] snapshots and may request
//!   cancellation by returning `false`.
//! - [`ProgressTracker`] counts finished samples from many worker threads.
//! - [`CancelToken`] is a cheap, cloneable stop flag; [`StopCondition`]
//!   combines it with an optional wall-clock deadline for iterative
//!   registration loops.
//!
//! # Example
//!
//! ```
//! use mesh_correspond::progress::{CancelToken, Progress, ProgressCallback};
//!
//! let token = CancelToken::new();
//! let stop = token.clone();
//! let callback: ProgressCallback = Box::new(move |progress: &Progress| {
//!     if progress.current >= 3 {
//!         stop.cancel();
//!     }
//!     !stop.is_cancelled()
//! });
//!
//! assert!(callback(&Progress::new(1, 10, "sample_01")));
//! assert!(!callback(&Progress::new(3, 10, "sample_03")));
//! assert!(token.is_cancelled());
//! ```

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Progress information passed to callbacks.
#[derive(Debug, Clone)]
pub struct Progress {
    /// Finished steps.
    pub current: u64,

    /// Total number of steps.
    pub total: u64,

    /// What was just finished, usually a sample ID.
    pub message: String,

    /// Elapsed time since the run started.
    pub elapsed: Duration,

    /// Estimated time remaining (if available).
    pub estimated_remaining: Option<Duration>,
}

impl Progress {
    /// Create a new progress report.
    pub fn new(current: u64, total: u64, message: impl Into<String>) -> Self {
        Self {
            current,
            total,
            message: message.into(),
            elapsed: Duration::ZERO,
            estimated_remaining: None,
        }
    }

    /// Get progress as a fraction (0.0 to 1.0).
    #[inline]
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.current as f64) / (self.total as f64)
        }
    }

    /// Get progress as a percentage (0 to 100).
    #[inline]
    pub fn percent(&self) -> u32 {
        (self.fraction() * 100.0).round() as u32
    }

    /// Check if the operation is complete.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.current >= self.total
    }
}

/// Callback function for progress reporting.
///
/// Returns `true` to continue, `false` to request cancellation.
pub type ProgressCallback = Box<dyn Fn(&Progress) -> bool + Send + Sync>;

/// Shared cancellation flag.
///
/// Clones observe the same flag. Cancellation is sticky.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// A fresh, untripped token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Check if cancellation was requested.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Why an iterative loop gave up early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A [`CancelToken`] was tripped.
    Cancelled,
    /// The wall-clock deadline passed.
    DeadlineExceeded,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Cancelled => write!(f, "cancellation requested"),
            StopReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// When an iterative loop must give up early.
#[derive(Debug, Clone)]
pub struct StopCondition {
    started: Instant,
    deadline: Option<Duration>,
    cancel: Option<CancelToken>,
}

impl StopCondition {
    /// Start the clock now.
    pub fn new(deadline: Option<Duration>, cancel: Option<CancelToken>) -> Self {
        Self {
            started: Instant::now(),
            deadline,
            cancel,
        }
    }

    /// A condition that never trips.
    pub fn never() -> Self {
        Self::new(None, None)
    }

    /// Reason to stop, if any.
    pub fn check(&self) -> Option<StopReason> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Some(StopReason::Cancelled);
        }
        match self.deadline {
            Some(limit) if self.started.elapsed() >= limit => Some(StopReason::DeadlineExceeded),
            _ => None,
        }
    }
}

/// A thread-safe progress tracker for parallel operations.
///
/// Workers call [`ProgressTracker::finish_one`]; the callback is throttled to
/// at most one call per interval.
#[derive(Debug)]
pub struct ProgressTracker {
    current: AtomicU64,
    total: u64,
    cancel: CancelToken,
    start_time: Instant,
    last_callback_time: Mutex<Option<Instant>>,
    callback_interval: Duration,
}

impl ProgressTracker {
    /// Create a new progress tracker.
    pub fn new(total: u64) -> Self {
        Self::with_token(total, CancelToken::new())
    }

    /// Create a tracker that trips (and observes) an existing token.
    pub fn with_token(total: u64, cancel: CancelToken) -> Self {
        Self {
            current: AtomicU64::new(0),
            total,
            cancel,
            start_time: Instant::now(),
            last_callback_time: Mutex::new(None),
            callback_interval: Duration::from_millis(100),
        }
    }

    /// Create a tracker with custom callback interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.callback_interval = interval;
        self
    }

    /// Get the current progress value.
    #[inline]
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    /// Get the total count.
    #[inline]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// The token this tracker trips on cancellation.
    pub fn token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Check if cancellation was requested.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Get elapsed time.
    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Estimate remaining time based on current progress.
    pub fn estimated_remaining(&self) -> Option<Duration> {
        let current = self.current();
        if current == 0 {
            return None;
        }
        let rate = current as f64 / self.elapsed().as_secs_f64();
        if rate > 0.0 {
            let remaining = self.total.saturating_sub(current) as f64 / rate;
            Some(Duration::from_secs_f64(remaining))
        } else {
            None
        }
    }

    /// Create a Progress snapshot.
    pub fn snapshot(&self, message: impl Into<String>) -> Progress {
        Progress {
            current: self.current(),
            total: self.total,
            message: message.into(),
            elapsed: self.elapsed(),
            estimated_remaining: self.estimated_remaining(),
        }
    }

    /// Count one finished step and report it.
    ///
    /// Returns `false` once cancellation has been requested, by this
    /// callback or through the shared token.
    pub fn finish_one(&self, callback: Option<&ProgressCallback>, message: &str) -> bool {
        let done = self.current.fetch_add(1, Ordering::Relaxed) + 1;
        if self.is_cancelled() {
            return false;
        }
        let Some(callback) = callback else {
            return true;
        };

        // The final step is always reported.
        let now = Instant::now();
        if done < self.total {
            let Ok(mut last) = self.last_callback_time.lock() else {
                return true;
            };
            if last.is_some_and(|t| now.duration_since(t) < self.callback_interval) {
                return true;
            }
            *last = Some(now);
        }

        let should_continue = callback(&self.snapshot(message));
        if !should_continue {
            self.cancel.cancel();
        }
        should_continue
    }
}
