//! Intermittently Connected Device (ICD) management.
//!
//! Battery-powered nodes sleep most of the time and poll on a
//! schedule. This module selects the polling interval the platform
//! layer is told to use; it never initiates network traffic itself.
//!
//! ## Operational modes
//!
//! ```text
//!                  activity event
//!      [Idle] ───────────────────────> [Active]
//!         ^                               │  ^
//!         │  active-duration timer,       │  │ further activity:
//!         │  no pending work              │  │ re-arm timer
//!         └───────────────────────────────┘  └──┘
//! ```
//!
//! - **Idle**: the device polls at the slow interval. Short-Interval-
//!   Time (SIT) devices cap the slow interval at a ceiling so that
//!   unsynchronized peers can still reach them within a bounded
//!   window; Long-Interval-Time (LIT) devices poll as slowly as
//!   configured.
//! - **Active**: the device polls at the fast interval until the
//!   active-duration timer fires with no qualifying activity pending.
//!
//! Qualifying activity is any inbound message, any pending outbound
//! operation, or an explicit stay-active request.
//!
//! The ICD class and the configured slow interval persist across
//! power cycles; everything else is recomputed at boot.

mod checkin;

pub use checkin::CheckInCounter;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::platform::{Scheduler, StateStore, TimerEvent, TimerHandle};

/// Storage key for the persisted ICD configuration
const CONFIG_STORE_KEY: &str = "icd/config";

/// Upper bound on the slow poll interval for SIT devices.
pub const SIT_SLOW_POLL_CEILING: Duration = Duration::from_secs(15);

/// Liveness class of an intermittently connected device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IcdClass {
    /// Short-Interval-Time: slow polling capped at
    /// [`SIT_SLOW_POLL_CEILING`]
    Sit,
    /// Long-Interval-Time: slow polling as configured
    Lit,
}

/// Duty-cycle operational state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationalMode {
    /// Slow polling, waiting for activity
    Idle,
    /// Fast polling while a conversation is in flight
    Active,
}

/// Runtime ICD configuration.
#[derive(Debug, Clone, Copy)]
pub struct IcdConfig {
    /// Liveness class
    pub class: IcdClass,
    /// Poll interval while Idle (subject to the SIT ceiling)
    pub slow_poll_interval: Duration,
    /// Poll interval while Active
    pub fast_poll_interval: Duration,
    /// How long Active mode outlives the last activity event
    pub active_mode_duration: Duration,
}

impl Default for IcdConfig {
    fn default() -> Self {
        Self {
            class: IcdClass::Sit,
            slow_poll_interval: Duration::from_secs(15),
            fast_poll_interval: Duration::from_millis(500),
            active_mode_duration: Duration::from_secs(1),
        }
    }
}

/// Subset of the configuration that survives a power cycle
#[derive(Debug, Serialize, Deserialize)]
struct PersistedIcdConfig {
    class: IcdClass,
    slow_poll_interval_ms: u64,
}

/// Duty-cycle mode manager.
///
/// Purely reactive: transitions are driven by activity events and the
/// active-duration timer, and the only output is the poll interval.
#[derive(Debug)]
pub struct IcdManager {
    config: IcdConfig,
    mode: OperationalMode,
    active_timer: Option<TimerHandle>,
}

impl IcdManager {
    /// Create a manager in Idle mode, applying any persisted class
    /// configuration over `config`.
    pub fn new(mut config: IcdConfig, store: &dyn StateStore) -> Result<Self> {
        if let Some(bytes) = store.load(CONFIG_STORE_KEY)? {
            match serde_json::from_slice::<PersistedIcdConfig>(&bytes) {
                Ok(persisted) => {
                    config.class = persisted.class;
                    config.slow_poll_interval =
                        Duration::from_millis(persisted.slow_poll_interval_ms);
                }
                Err(e) => {
                    tracing::warn!("Ignoring corrupt persisted ICD config: {e}");
                }
            }
        }
        Ok(Self {
            config,
            mode: OperationalMode::Idle,
            active_timer: None,
        })
    }

    /// Current operational mode
    pub fn mode(&self) -> OperationalMode {
        self.mode
    }

    /// Configured liveness class
    pub fn class(&self) -> IcdClass {
        self.config.class
    }

    /// Interval at which the platform should poll right now
    pub fn poll_interval(&self) -> Duration {
        match self.mode {
            OperationalMode::Active => self.config.fast_poll_interval,
            OperationalMode::Idle => self.slow_poll_interval(),
        }
    }

    /// Effective slow poll interval after class-specific capping
    pub fn slow_poll_interval(&self) -> Duration {
        match self.config.class {
            IcdClass::Sit => self.config.slow_poll_interval.min(SIT_SLOW_POLL_CEILING),
            IcdClass::Lit => self.config.slow_poll_interval,
        }
    }

    /// A qualifying activity event: enter (or stay in) Active mode and
    /// restart the active-duration timer.
    pub fn on_activity(&mut self, sched: &mut dyn Scheduler) {
        if self.mode == OperationalMode::Idle {
            self.mode = OperationalMode::Active;
            tracing::debug!(
                "ICD Active: polling every {:?}",
                self.config.fast_poll_interval
            );
        }
        if let Some(handle) = self.active_timer.take() {
            sched.cancel(handle);
        }
        let deadline = sched.now() + self.config.active_mode_duration;
        self.active_timer = Some(sched.schedule_at(deadline, TimerEvent::IcdActiveExpired));
    }

    /// The active-duration timer fired. With qualifying activity still
    /// pending the timer is re-armed; otherwise the device returns to
    /// Idle and polls at the slow interval until the next event.
    pub fn on_active_timer_expired(&mut self, activity_pending: bool, sched: &mut dyn Scheduler) {
        self.active_timer = None;
        if self.mode != OperationalMode::Active {
            return;
        }
        if activity_pending {
            let deadline = sched.now() + self.config.active_mode_duration;
            self.active_timer = Some(sched.schedule_at(deadline, TimerEvent::IcdActiveExpired));
            return;
        }
        self.mode = OperationalMode::Idle;
        tracing::debug!("ICD Idle: polling every {:?}", self.slow_poll_interval());
    }

    /// Change the liveness class and persist it.
    pub fn set_class(&mut self, class: IcdClass, store: &mut dyn StateStore) -> Result<()> {
        self.config.class = class;
        self.persist(store)
    }

    /// Persist the durable subset of the configuration.
    pub fn persist(&self, store: &mut dyn StateStore) -> Result<()> {
        let persisted = PersistedIcdConfig {
            class: self.config.class,
            slow_poll_interval_ms: self.config.slow_poll_interval.as_millis() as u64,
        };
        store.store(CONFIG_STORE_KEY, &serde_json::to_vec(&persisted)?)
    }
}
