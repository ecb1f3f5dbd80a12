//! Storm budget: caps how much background work and how many effects a single
//! session may start so one runaway component cannot starve the process.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Resource,
    Action,
}

impl ResourceKind {
    pub fn label(self) -> &'static str {
        match self {
            ResourceKind::Resource => "resource",
            ResourceKind::Action => "action",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StormPolicy {
    /// Excess work is dropped without further consequence.
    #[default]
    Throttle,
    /// Excess work pauses effect processing until the breaker is reset.
    TripBreaker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    pub window: Duration,
    pub max_ops: u32,
}

#[derive(Debug, Clone)]
pub struct StormBudgetConfig {
    pub max_effects_per_tick: u32,
    pub resource: WindowLimit,
    pub action: WindowLimit,
    pub policy: StormPolicy,
}

impl Default for StormBudgetConfig {
    fn default() -> Self {
        Self {
            max_effects_per_tick: 256,
            resource: WindowLimit {
                window: Duration::from_secs(1),
                max_ops: 64,
            },
            action: WindowLimit {
                window: Duration::from_secs(1),
                max_ops: 32,
            },
            policy: StormPolicy::Throttle,
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StormExceeded {
    #[error("{} budget exhausted for this window", .0.label())]
    Window(ResourceKind),
    #[error("storm breaker is tripped")]
    Tripped,
}

#[derive(Debug)]
pub struct StormBudgetTracker {
    config: StormBudgetConfig,
    resource_window: Mutex<VecDeque<Instant>>,
    action_window: Mutex<VecDeque<Instant>>,
    tick_effects: AtomicU32,
    tripped: AtomicBool,
}

impl StormBudgetTracker {
    pub fn new(config: StormBudgetConfig) -> Self {
        Self {
            config,
            resource_window: Mutex::new(VecDeque::new()),
            action_window: Mutex::new(VecDeque::new()),
            tick_effects: AtomicU32::new(0),
            tripped: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> StormPolicy {
        self.config.policy
    }

    /// Called at the start of every event, dispatch and render tick.
    pub fn begin_tick(&self) {
        self.tick_effects.store(0, Ordering::Release);
    }

    pub fn try_start(&self, kind: ResourceKind) -> Result<(), StormExceeded> {
        self.try_start_at(kind, Instant::now())
    }

    pub fn try_start_at(&self, kind: ResourceKind, now: Instant) -> Result<(), StormExceeded> {
        if self.is_tripped() {
            return Err(StormExceeded::Tripped);
        }
        let (window, limit) = match kind {
            ResourceKind::Resource => (&self.resource_window, self.config.resource),
            ResourceKind::Action => (&self.action_window, self.config.action),
        };
        let mut window = window.lock();
        while matches!(window.front(), Some(started) if now.duration_since(*started) >= limit.window) {
            window.pop_front();
        }
        if window.len() as u32 >= limit.max_ops {
            drop(window);
            counter!("swell_storm_dropped_total", 1, "kind" => kind.label());
            self.on_exceeded(kind.label());
            return Err(StormExceeded::Window(kind));
        }
        window.push_back(now);
        Ok(())
    }

    /// Claims one effect execution for the current tick.
    pub fn allow_effect(&self) -> bool {
        if self.is_tripped() {
            return false;
        }
        let used = self.tick_effects.fetch_add(1, Ordering::AcqRel);
        if used < self.config.max_effects_per_tick {
            return true;
        }
        self.tick_effects.fetch_sub(1, Ordering::AcqRel);
        counter!("swell_storm_dropped_total", 1, "kind" => "effect");
        self.on_exceeded("effect");
        false
    }

    pub fn tick_effects(&self) -> u32 {
        self.tick_effects.load(Ordering::Acquire)
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    pub fn reset_breaker(&self) {
        if self.tripped.swap(false, Ordering::AcqRel) {
            tracing::info!("storm breaker reset");
        }
    }

    fn on_exceeded(&self, what: &'static str) {
        if self.config.policy == StormPolicy::TripBreaker
            && !self.tripped.swap(true, Ordering::AcqRel)
        {
            warn!(budget = what, "storm breaker tripped; effect processing paused");
            counter!("swell_storm_breaker_trips_total", 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(policy: StormPolicy) -> StormBudgetTracker {
        StormBudgetTracker::new(StormBudgetConfig {
            max_effects_per_tick: 2,
            resource: WindowLimit {
                window: Duration::from_millis(100),
                max_ops: 2,
            },
            action: WindowLimit {
                window: Duration::from_millis(100),
                max_ops: 1,
            },
            policy,
        })
    }

    #[test_timeout::timeout]
    fn sliding_window_frees_capacity_as_it_slides() {
        let storm = tracker(StormPolicy::Throttle);
        let start = Instant::now();
        assert!(storm.try_start_at(ResourceKind::Resource, start).is_ok());
        assert!(storm
            .try_start_at(ResourceKind::Resource, start + Duration::from_millis(40))
            .is_ok());
        assert_eq!(
            storm.try_start_at(ResourceKind::Resource, start + Duration::from_millis(60)),
            Err(StormExceeded::Window(ResourceKind::Resource))
        );
        assert!(storm
            .try_start_at(ResourceKind::Resource, start + Duration::from_millis(100))
            .is_ok());
    }

    #[test_timeout::timeout]
    fn kinds_have_independent_windows() {
        let storm = tracker(StormPolicy::Throttle);
        let now = Instant::now();
        assert!(storm.try_start_at(ResourceKind::Action, now).is_ok());
        assert!(storm.try_start_at(ResourceKind::Action, now).is_err());
        assert!(storm.try_start_at(ResourceKind::Resource, now).is_ok());
    }

    #[test_timeout::timeout]
    fn effect_cap_resets_each_tick() {
        let storm = tracker(StormPolicy::Throttle);
        storm.begin_tick();
        assert!(storm.allow_effect());
        assert!(storm.allow_effect());
        assert!(!storm.allow_effect());
        assert_eq!(storm.tick_effects(), 2);
        storm.begin_tick();
        assert_eq!(storm.tick_effects(), 0);
        assert!(storm.allow_effect());
        assert!(!storm.is_tripped());
    }

    #[test_timeout::timeout]
    fn breaker_pauses_until_reset() {
        let storm = tracker(StormPolicy::TripBreaker);
        storm.begin_tick();
        assert!(storm.allow_effect());
        assert!(storm.allow_effect());
        assert!(!storm.allow_effect());
        assert!(storm.is_tripped());

        storm.begin_tick();
        assert!(!storm.allow_effect());
        assert_eq!(
            storm.try_start(ResourceKind::Resource),
            Err(StormExceeded::Tripped)
        );

        storm.reset_breaker();
        assert!(storm.allow_effect());
    }
}
