use std::time::Duration;

use swell_core::ReconnectPolicy;

use crate::prefetch::PrefetchConfig;
use crate::storm::StormBudgetConfig;

const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Per-session tuning shared by every session a manager creates.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub event_queue_capacity: usize,
    pub dispatch_queue_capacity: usize,
    pub heartbeat_interval: Duration,
    /// Refreshed on every successful read.
    pub read_deadline: Duration,
    pub write_deadline: Duration,
    /// Number of encoded patch frames kept for resync replay.
    pub history_capacity: usize,
    pub history_max_bytes: usize,
    pub max_flush_iterations: usize,
    pub reauth_interval: Option<Duration>,
    pub storm: StormBudgetConfig,
    pub prefetch: PrefetchConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: DEFAULT_QUEUE_DEPTH,
            dispatch_queue_capacity: DEFAULT_QUEUE_DEPTH,
            heartbeat_interval: Duration::from_secs(30),
            read_deadline: Duration::from_secs(75),
            write_deadline: Duration::from_secs(10),
            history_capacity: 128,
            history_max_bytes: 512 * 1024,
            max_flush_iterations: 10,
            reauth_interval: None,
            storm: StormBudgetConfig::default(),
            prefetch: PrefetchConfig::default(),
        }
    }
}

/// Fleet-level limits applied by the session manager.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub resume_window: Duration,
    pub sweep_interval: Duration,
    /// Aggregate estimated bytes before LRU eviction starts.
    pub memory_budget: Option<usize>,
    /// Session data writes since the last save before a detach persists it.
    pub persist_threshold: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let resume_window = Duration::from_secs(30);
        Self {
            max_sessions: 10_000,
            idle_timeout: Duration::from_secs(30 * 60),
            resume_window,
            sweep_interval: Duration::from_secs(15),
            memory_budget: None,
            persist_threshold: 1,
            reconnect: ReconnectPolicy {
                base_delay_ms: 250,
                max_delay_ms: 5_000,
                max_attempts: 10,
                resume_window_ms: resume_window.as_millis() as u64,
            },
        }
    }
}

impl ManagerConfig {
    /// Keeps the advertised reconnect window in step with the enforced one.
    pub fn with_resume_window(mut self, window: Duration) -> Self {
        self.resume_window = window;
        self.reconnect.resume_window_ms = window.as_millis() as u64;
        self
    }
}
