use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default crash-loop threshold: more exits than this inside the window gives up
pub const DEFAULT_MAX_RESTARTS: usize = 10;
/// Default crash-loop window
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
/// Default first backoff delay
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(100);
/// Default backoff cap
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(15);
/// Default uptime after which an instance counts as stable again
pub const DEFAULT_STABLE_AFTER: Duration = Duration::from_secs(30);

/// What to do with an instance that just exited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    RestartNow,
    RestartAfter(Duration),
    GiveUp,
}

/// Restart policy for one process spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Whether automatic restart is enabled
    pub enabled: bool,
    /// Maximum number of exits tolerated inside `window`
    pub max_restarts: usize,
    /// Sliding window used for crash-loop detection
    pub window: Duration,
    /// Backoff strategy to use
    pub backoff: BackoffStrategy,
    /// Uptime after which the consecutive-exit counter resets
    pub stable_after: Duration,
}

impl RestartPolicy {
    /// Create a new restart policy with default values
    pub fn new() -> Self {
        Self {
            enabled: true,
            max_restarts: DEFAULT_MAX_RESTARTS,
            window: DEFAULT_WINDOW,
            backoff: BackoffStrategy::Exponential {
                initial: DEFAULT_INITIAL_DELAY,
                max: DEFAULT_MAX_DELAY,
            },
            stable_after: DEFAULT_STABLE_AFTER,
        }
    }

    /// A policy that never restarts
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    /// Decide what happens after an exit, recording it in `tracker`
    pub fn on_exit(&self, tracker: &mut RestartTracker, uptime: Duration) -> RestartDecision {
        self.on_exit_at(tracker, uptime, Instant::now())
    }

    /// Same as [`on_exit`](Self::on_exit) with an explicit clock reading
    pub fn on_exit_at(
        &self,
        tracker: &mut RestartTracker,
        uptime: Duration,
        now: Instant,
    ) -> RestartDecision {
        if !self.enabled {
            return RestartDecision::GiveUp;
        }

        if uptime >= self.stable_after {
            tracker.reset_consecutive();
        }

        tracker.record_exit_at(now);
        tracker.prune_at(self.window, now);

        if tracker.recent_exits() > self.max_restarts {
            return RestartDecision::GiveUp;
        }

        let delay = self.backoff.calculate_delay(tracker.consecutive_exits());
        if delay.is_zero() {
            RestartDecision::RestartNow
        } else {
            RestartDecision::RestartAfter(delay)
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Backoff strategy for restart delays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Same delay before every restart
    Fixed { delay: Duration },
    /// Doubling delay, capped at `max`
    Exponential { initial: Duration, max: Duration },
}

impl BackoffStrategy {
    /// Delay before the restart following the `consecutive`-th exit (1-based)
    pub fn calculate_delay(&self, consecutive: u32) -> Duration {
        match *self {
            BackoffStrategy::Fixed { delay } => delay,
            BackoffStrategy::Exponential { initial, max } => {
                let exponent = consecutive.saturating_sub(1);
                initial
                    .saturating_mul(2_u32.saturating_pow(exponent))
                    .min(max)
            }
        }
    }
}

/// Exit history for one instance
#[derive(Debug, Clone, Default)]
pub struct RestartTracker {
    exit_times: VecDeque<Instant>,
    consecutive: u32,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_exit_at(&mut self, now: Instant) {
        self.exit_times.push_back(now);
        self.consecutive = self.consecutive.saturating_add(1);
    }

    /// Drop exits older than `window`
    pub fn prune_at(&mut self, window: Duration, now: Instant) {
        while let Some(&oldest) = self.exit_times.front() {
            if now.saturating_duration_since(oldest) < window {
                break;
            }
            self.exit_times.pop_front();
        }
    }

    /// Exits currently inside the window (valid after `prune_at`)
    pub fn recent_exits(&self) -> usize {
        self.exit_times.len()
    }

    pub fn consecutive_exits(&self) -> u32 {
        self.consecutive
    }

    pub fn reset_consecutive(&mut self) {
        self.consecutive = 0;
    }

    /// Forget everything, used when an operator starts the instance again
    pub fn clear(&mut self) {
        self.exit_times.clear();
        self.consecutive = 0;
    }
}
