//! Core data types and device capability traits for the rig controller.
//!
//! This module defines the foundational abstractions for the automation
//! sequencer: the run state machine vocabulary, the notification payloads the
//! controller broadcasts, the immutable status snapshot published by the
//! poller, and the capability traits through which all hardware is driven.
//!
//! # Architecture Overview
//!
//! Hardware enters the system only through narrow capability traits:
//!
//! - [`DryPump`], [`TurboPump`], [`IonGauge`], [`ValveBank`], [`Heater`],
//!   [`Chiller`]: one trait per subsystem, composed into a [`RigFacade`]
//! - [`RigSnapshot`]: immutable sensor/device status, refreshed by an
//!   independent poller and read-only to the sequencer
//! - [`RunEvent`]: the four notification kinds (state, progress, error,
//!   completion) broadcast to any number of subscribers
//!
//! # Data Flow
//!
//! ```text
//! StatusPoller --[RigSnapshot]--> watch::channel ---> SequenceController
//! SequenceController --[RunEvent]--> broadcast::channel ---> UI/CLI/logging
//! ```
//!
//! # Thread Safety
//!
//! All traits require `Send + Sync` so devices can be shared across the
//! driver task and the poller. Command signals from other threads are
//! carried by [`StopSignal`] and consumed at suspension points, never as
//! re-entrant calls into controller internals.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

// =============================================================================
// Run State
// =============================================================================

/// State of an automation run, in expected order of progression.
///
/// `Idle` and the three outcomes (`Completed`, `Aborted`, `Error`) are
/// terminal for a run; `Paused` is a suspended overlay entered only at state
/// boundaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// No run active, ready to start
    Idle,
    /// Verifying device connectivity and resetting bookkeeping
    Initializing,
    /// Closing vent/exhaust valves and opening the gate valve
    PreparingVacuum,
    /// Starting the roughing (dry) pump
    StartingDryPump,
    /// Waiting for rough vacuum, then spinning up the turbo pump
    StartingTurboPump,
    /// Energizing the ion gauge high voltage
    ActivatingIonGauge,
    /// Waiting for the debounced high-vacuum threshold
    WaitingHighVacuum,
    /// Ramping the heater to setpoint
    StartingHeater,
    /// Timed experiment hold
    RunningExperiment,
    /// Best-effort safe shutdown sequence
    ShuttingDown,
    /// Run finished normally and the rig is safed
    Completed,
    /// Run ended early (operator stop or failure) after a safe shutdown
    Aborted,
    /// Run ended on a failure with hardware left as-is
    Error,
    /// Suspended at a state boundary, waiting for resume
    Paused,
}

impl RunState {
    /// Terminal for a run: no further transitions until a new start.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Idle | RunState::Completed | RunState::Aborted | RunState::Error
        )
    }

    /// A run is in flight (including paused and shutting down).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Initializing => "initializing",
            RunState::PreparingVacuum => "preparing_vacuum",
            RunState::StartingDryPump => "starting_dry_pump",
            RunState::StartingTurboPump => "starting_turbo_pump",
            RunState::ActivatingIonGauge => "activating_ion_gauge",
            RunState::WaitingHighVacuum => "waiting_high_vacuum",
            RunState::StartingHeater => "starting_heater",
            RunState::RunningExperiment => "running_experiment",
            RunState::ShuttingDown => "shutting_down",
            RunState::Completed => "completed",
            RunState::Aborted => "aborted",
            RunState::Error => "error",
            RunState::Paused => "paused",
        };
        write!(f, "{}", name)
    }
}

// =============================================================================
// Notifications
// =============================================================================

/// Notification payloads broadcast by the sequencer.
///
/// Subscribers receive these over a `tokio::sync::broadcast` channel; a
/// lagging or absent subscriber never blocks the run.
#[derive(Clone, Debug, Serialize)]
pub enum RunEvent {
    /// Emitted on every state transition.
    StateChanged {
        /// State before the transition
        previous: RunState,
        /// State after the transition
        new: RunState,
        /// Human-readable description of the transition
        message: String,
    },
    /// Emitted periodically during long waits.
    Progress {
        /// State the progress belongs to
        state: RunState,
        /// 0–100; elapsed/total for time-bounded states, reach-count
        /// based for threshold-bounded states
        percent: u8,
        /// Human-readable progress description
        message: String,
        /// Time spent in the current wait
        #[serde(with = "humantime_serde")]
        elapsed: Duration,
        /// Time remaining before the wait times out (or the hold ends)
        #[serde(with = "humantime_serde")]
        remaining: Duration,
    },
    /// Emitted when a stage fails, after retries/timeouts are exhausted.
    Error {
        /// What went wrong
        message: String,
        /// Fatal errors are everything but stage timeouts
        fatal: bool,
    },
    /// Emitted exactly once per run, after the terminal state is reached.
    Completed {
        /// Whether the run reached `Completed`
        success: bool,
        /// One-line summary including the shutdown report when one ran
        summary: String,
    },
}

/// Final outcome of a run.
#[derive(Clone, Debug, Serialize)]
pub struct RunResult {
    /// Whether the run reached `Completed`
    pub success: bool,
    /// One-line human-readable summary
    pub summary: String,
    /// Terminal state the run ended in
    pub final_state: RunState,
}

// =============================================================================
// Status Snapshot
// =============================================================================

/// Valves the sequencer operates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValveId {
    /// Isolation valve between the turbo pump and the chamber
    Gate,
    /// Chamber vent valve
    Vent,
    /// Exhaust valve
    Exhaust,
}

impl fmt::Display for ValveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValveId::Gate => write!(f, "gate"),
            ValveId::Vent => write!(f, "vent"),
            ValveId::Exhaust => write!(f, "exhaust"),
        }
    }
}

/// Immutable snapshot of rig sensor readings and device states.
///
/// Published atomically by the status poller; the sequencer and the shutdown
/// coordinator only ever read the latest snapshot. Pressures are in Torr;
/// a non-positive pressure means the sensor is unavailable.
#[derive(Clone, Debug, Serialize)]
pub struct RigSnapshot {
    /// Chamber pressure in Torr (ion gauge below crossover, Pirani above)
    pub chamber_pressure_torr: f64,
    /// Foreline pressure in Torr
    pub foreline_pressure_torr: f64,
    /// Heater channel temperature in °C
    pub heater_temperature_c: f64,
    /// Chamber wall temperature in °C
    pub chamber_temperature_c: f64,
    /// Gate valve open
    pub gate_open: bool,
    /// Vent valve open
    pub vent_open: bool,
    /// Exhaust valve open
    pub exhaust_open: bool,
    /// Ion gauge high voltage energized
    pub ion_gauge_hv_on: bool,
    /// Dry pump running
    pub dry_pump_running: bool,
    /// Turbo pump commanded on
    pub turbo_running: bool,
    /// Turbo pump at nominal rotation speed
    pub turbo_at_speed: bool,
    /// Heater output enabled
    pub heater_enabled: bool,
    /// Chiller running
    pub chiller_running: bool,
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
}

impl RigSnapshot {
    /// Open/closed state of a valve by id.
    pub fn valve_open(&self, valve: ValveId) -> bool {
        match valve {
            ValveId::Gate => self.gate_open,
            ValveId::Vent => self.vent_open,
            ValveId::Exhaust => self.exhaust_open,
        }
    }
}

impl Default for RigSnapshot {
    fn default() -> Self {
        Self {
            chamber_pressure_torr: 0.0,
            foreline_pressure_torr: 0.0,
            heater_temperature_c: 0.0,
            chamber_temperature_c: 0.0,
            gate_open: false,
            vent_open: false,
            exhaust_open: false,
            ion_gauge_hv_on: false,
            dry_pump_running: false,
            turbo_running: false,
            turbo_at_speed: false,
            heater_enabled: false,
            chiller_running: false,
            taken_at: DateTime::<Utc>::MIN_UTC,
        }
    }
}

// =============================================================================
// Device Capability Traits
// =============================================================================

/// Roughing (dry) pump control.
#[async_trait]
pub trait DryPump: Send + Sync {
    /// Whether the device link is up.
    fn is_connected(&self) -> bool;

    /// Start the pump.
    async fn start(&self) -> Result<()>;

    /// Stop the pump.
    async fn stop(&self) -> Result<()>;
}

/// Turbomolecular pump control.
#[async_trait]
pub trait TurboPump: Send + Sync {
    /// Whether the device link is up.
    fn is_connected(&self) -> bool;

    /// Start the pump (spin-up is reported through the status snapshot).
    async fn start(&self) -> Result<()>;

    /// Stop the pump and let it spin down.
    async fn stop(&self) -> Result<()>;
}

/// Ion gauge high-voltage control.
#[async_trait]
pub trait IonGauge: Send + Sync {
    /// Whether the device link is up.
    fn is_connected(&self) -> bool;

    /// Energize the gauge high voltage.
    async fn hv_on(&self) -> Result<()>;

    /// De-energize the gauge high voltage.
    async fn hv_off(&self) -> Result<()>;
}

/// Gate/vent/exhaust valve control.
#[async_trait]
pub trait ValveBank: Send + Sync {
    /// Whether the device link is up.
    fn is_connected(&self) -> bool;

    /// Open a valve.
    async fn open(&self, valve: ValveId) -> Result<()>;

    /// Close a valve.
    async fn close(&self, valve: ValveId) -> Result<()>;
}

/// Heater channel control.
#[async_trait]
pub trait Heater: Send + Sync {
    /// Whether the device link is up.
    fn is_connected(&self) -> bool;

    /// Apply a temperature setpoint in °C.
    async fn set_temperature(&self, celsius: f64) -> Result<()>;

    /// Enable the heater output.
    async fn enable(&self) -> Result<()>;

    /// Disable the heater output.
    async fn disable(&self) -> Result<()>;
}

/// Chiller control.
#[async_trait]
pub trait Chiller: Send + Sync {
    /// Whether the device link is up.
    fn is_connected(&self) -> bool;

    /// Start the chiller.
    async fn start(&self) -> Result<()>;

    /// Stop the chiller.
    async fn stop(&self) -> Result<()>;
}

/// All subsystems of one physical rig, composed rather than inherited.
///
/// The facade is explicitly constructed and passed by handle to whichever
/// component needs it; there is no process-wide device manager.
#[derive(Clone)]
pub struct RigFacade {
    /// Roughing pump
    pub dry_pump: Arc<dyn DryPump>,
    /// Turbomolecular pump
    pub turbo_pump: Arc<dyn TurboPump>,
    /// Ion gauge
    pub ion_gauge: Arc<dyn IonGauge>,
    /// Gate/vent/exhaust valves
    pub valves: Arc<dyn ValveBank>,
    /// Heater channel
    pub heater: Arc<dyn Heater>,
    /// Chiller
    pub chiller: Arc<dyn Chiller>,
}

impl RigFacade {
    /// Names of subsystems whose device link is currently down.
    pub fn disconnected_subsystems(&self) -> Vec<&'static str> {
        let mut down = Vec::new();
        if !self.dry_pump.is_connected() {
            down.push("dry pump");
        }
        if !self.turbo_pump.is_connected() {
            down.push("turbo pump");
        }
        if !self.ion_gauge.is_connected() {
            down.push("ion gauge");
        }
        if !self.valves.is_connected() {
            down.push("valves");
        }
        if !self.heater.is_connected() {
            down.push("heater");
        }
        if !self.chiller.is_connected() {
            down.push("chiller");
        }
        down
    }
}

// =============================================================================
// Control Signals
// =============================================================================

/// Asynchronous stop/abort request, consumed at suspension points.
///
/// Raised from any thread; observed by waits and stage boundaries. Cleared
/// only when a new run starts.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// A fresh, unraised signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop.
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop has been requested.
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Reset for a new run.
    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Mutual exclusion over one physical device set.
///
/// Every sequencer that can command a given heater/pump/valve set shares one
/// guard; `SequenceController::start` refuses to begin a run while another
/// holder is active. The permit is held by the driver task and released when
/// the run reaches a terminal state.
#[derive(Clone, Default)]
pub struct AutomationGuard {
    inner: Arc<tokio::sync::Mutex<()>>,
}

impl AutomationGuard {
    /// A fresh guard for one physical rig.
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to claim the rig; `None` when another automation owns it.
    pub fn try_acquire(&self) -> Option<OwnedMutexGuard<()>> {
        self.inner.clone().try_lock_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(RunState::Idle.is_terminal());
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Aborted.is_terminal());
        assert!(RunState::Error.is_terminal());
        assert!(RunState::RunningExperiment.is_active());
        assert!(RunState::Paused.is_active());
        assert!(RunState::ShuttingDown.is_active());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(RunState::WaitingHighVacuum.to_string(), "waiting_high_vacuum");
        assert_eq!(RunState::Idle.to_string(), "idle");
    }

    #[test]
    fn test_stop_signal() {
        let stop = StopSignal::new();
        assert!(!stop.is_raised());
        let other = stop.clone();
        other.raise();
        assert!(stop.is_raised());
        stop.clear();
        assert!(!other.is_raised());
    }

    #[test]
    fn test_automation_guard_exclusion() {
        let guard = AutomationGuard::new();
        let permit = guard.try_acquire();
        assert!(permit.is_some());
        assert!(guard.try_acquire().is_none());
        drop(permit);
        assert!(guard.try_acquire().is_some());
    }

    #[test]
    fn test_snapshot_valve_lookup() {
        let snap = RigSnapshot {
            gate_open: true,
            ..Default::default()
        };
        assert!(snap.valve_open(ValveId::Gate));
        assert!(!snap.valve_open(ValveId::Vent));
        assert!(!snap.valve_open(ValveId::Exhaust));
    }
}
