//! SequenceController - the automation state machine for a full rig run.
//!
//! The controller drives an unattended run through a fixed state table:
//! pump-down, high-vacuum confirmation, heater ramp, timed experiment, and a
//! best-effort safe shutdown. It owns all state transitions from a single
//! driver task and accepts external commands (pause/resume/stop) only as
//! signals consumed at suspension points.
//!
//! # State Machine
//!
//! ```text
//! Idle → Initializing → PreparingVacuum → StartingDryPump
//!      → StartingTurboPump → ActivatingIonGauge → WaitingHighVacuum
//!      → StartingHeater → RunningExperiment → ShuttingDown → Completed
//! ```
//!
//! Every active state has exactly one success edge (the next row) and one
//! failure edge: `Error` with hardware left as-is, or `ShuttingDown` →
//! `Aborted` when `shutdown_on_failure` is set. An operator stop takes the
//! shutdown path from any state. `Paused` is an overlay entered only at
//! state boundaries; an in-flight wait is never interrupted by pause.
//!
//! # Usage
//!
//! ```rust,ignore
//! let controller = Arc::new(SequenceController::new(config, facade, snapshots, guard));
//! let mut events = controller.subscribe();
//!
//! assert!(controller.clone().start().await);
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         RunEvent::Completed { success, summary } => break,
//!         other => println!("{:?}", other),
//!     }
//! }
//! ```

use crate::config::{RunConfiguration, RunMode};
use crate::core::{
    AutomationGuard, RigFacade, RigSnapshot, RunEvent, RunResult, RunState, StopSignal, ValveId,
};
use crate::error::RigError;
use crate::monitor::{within_tolerance, ReachCounter};
use crate::retry::RetryExecutor;
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::waiter::{wait_for, WaitOutcome, POLL_PERIOD};
use anyhow::bail;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Finite state machine driving one physical rig through an automated run.
pub struct SequenceController {
    config: RunConfiguration,
    facade: RigFacade,
    snapshots: watch::Receiver<RigSnapshot>,
    guard: AutomationGuard,

    /// Current run state; written only by the driver task, readable from
    /// any thread
    state: RwLock<RunState>,
    /// Pause request flag, consumed at the next state boundary
    pause_requested: RwLock<bool>,
    /// Stop request, consumed at every suspension point
    stop: StopSignal,
    /// Notification broadcast channel
    events: broadcast::Sender<RunEvent>,
    /// Result of the most recently finished run
    last_result: RwLock<Option<RunResult>>,
}

impl SequenceController {
    /// The forward state table, in the only order stages may run.
    const STAGES: [RunState; 8] = [
        RunState::Initializing,
        RunState::PreparingVacuum,
        RunState::StartingDryPump,
        RunState::StartingTurboPump,
        RunState::ActivatingIonGauge,
        RunState::WaitingHighVacuum,
        RunState::StartingHeater,
        RunState::RunningExperiment,
    ];

    /// A controller over one rig. The configuration is immutable for the
    /// controller's lifetime; changing it means creating a new controller.
    pub fn new(
        config: RunConfiguration,
        facade: RigFacade,
        snapshots: watch::Receiver<RigSnapshot>,
        guard: AutomationGuard,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            facade,
            snapshots,
            guard,
            state: RwLock::new(RunState::Idle),
            pause_requested: RwLock::new(false),
            stop: StopSignal::new(),
            events,
            last_result: RwLock::new(None),
        }
    }

    /// Subscribe to run notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Current run state.
    pub async fn state(&self) -> RunState {
        *self.state.read().await
    }

    /// A run is in flight.
    pub async fn is_running(&self) -> bool {
        self.state.read().await.is_active()
    }

    /// The run is suspended at a state boundary.
    pub async fn is_paused(&self) -> bool {
        *self.state.read().await == RunState::Paused
    }

    /// Result of the most recently finished run, if any.
    pub async fn last_result(&self) -> Option<RunResult> {
        self.last_result.read().await.clone()
    }

    /// Configuration this controller runs with.
    pub fn config(&self) -> &RunConfiguration {
        &self.config
    }

    /// Begin a run. Returns `false`, with no state change, when a run is
    /// already active or when another automation holds the rig's guard.
    /// On success the controller transitions Idle→Initializing and proceeds
    /// autonomously on its own task.
    #[instrument(skip(self))]
    pub async fn start(self: Arc<Self>) -> bool {
        {
            let state = self.state.read().await;
            if state.is_active() {
                warn!(state = %*state, "Start refused: a run is already active");
                return false;
            }
        }
        let Some(permit) = self.guard.try_acquire() else {
            warn!("Start refused: another automation owns this rig");
            return false;
        };

        self.stop.clear();
        *self.pause_requested.write().await = false;
        *self.last_result.write().await = None;
        self.transition(RunState::Initializing, "run started").await;

        let controller = Arc::clone(&self);
        tokio::spawn(async move {
            // The guard permit lives exactly as long as the run
            let _permit = permit;
            controller.drive().await;
        });
        true
    }

    /// Request a pause at the next state boundary. An in-flight hardware
    /// wait is never interrupted.
    #[instrument(skip(self), err)]
    pub async fn pause(&self) -> anyhow::Result<()> {
        let state = *self.state.read().await;
        if !state.is_active() || state == RunState::Paused || state == RunState::ShuttingDown {
            bail!("Cannot pause: run is {}", state);
        }
        info!("Pause requested");
        *self.pause_requested.write().await = true;
        Ok(())
    }

    /// Resume from a pause (or withdraw a not-yet-honored pause request).
    #[instrument(skip(self), err)]
    pub async fn resume(&self) -> anyhow::Result<()> {
        let paused = *self.state.read().await == RunState::Paused;
        let requested = *self.pause_requested.read().await;
        if !paused && !requested {
            bail!("Cannot resume: no pause in effect");
        }
        info!("Resuming");
        *self.pause_requested.write().await = false;
        Ok(())
    }

    /// Request a stop. The run proceeds to the shutdown sequence from
    /// whatever state it is in, unless already terminal.
    #[instrument(skip(self), err)]
    pub async fn stop(&self) -> anyhow::Result<()> {
        let state = *self.state.read().await;
        if state.is_terminal() {
            bail!("Cannot stop: run is {}", state);
        }
        info!(state = %state, "Stop requested");
        self.stop.raise();
        Ok(())
    }

    // =========================================================================
    // Driver
    // =========================================================================

    async fn drive(self: Arc<Self>) {
        let run_id = Uuid::new_v4();
        info!(run_id = %run_id, mode = ?self.config.run_mode, "Automation run starting");

        let outcome = self.run_stages().await;
        let (final_state, success, summary) = match outcome {
            Ok(()) => {
                self.transition(RunState::ShuttingDown, "experiment complete, safing rig")
                    .await;
                let report = self.run_shutdown().await;
                (
                    RunState::Completed,
                    true,
                    format!("experiment completed; {}", report.summary()),
                )
            }
            Err(RigError::Cancelled) => {
                info!("Stop requested, safing rig");
                self.transition(RunState::ShuttingDown, "operator stop").await;
                let report = self.run_shutdown().await;
                (
                    RunState::Aborted,
                    false,
                    format!("run stopped by operator; {}", report.summary()),
                )
            }
            Err(err) => {
                let fatal = err.is_fatal();
                let failed_in = *self.state.read().await;
                error!(error = %err, state = %failed_in, fatal, "Stage failed");
                if self.config.alarm_on_error {
                    error!(alarm = true, "Automation failure alarm");
                }
                let _ = self.events.send(RunEvent::Error {
                    message: err.to_string(),
                    fatal,
                });
                if self.config.shutdown_on_failure {
                    self.transition(RunState::ShuttingDown, "stage failed, safing rig")
                        .await;
                    let report = self.run_shutdown().await;
                    (
                        RunState::Aborted,
                        false,
                        format!(
                            "run aborted after failure in {}: {}; {}",
                            failed_in,
                            err,
                            report.summary()
                        ),
                    )
                } else {
                    (
                        RunState::Error,
                        false,
                        format!(
                            "run failed in {}: {}; hardware left as-is",
                            failed_in, err
                        ),
                    )
                }
            }
        };

        self.transition(final_state, "run finished").await;
        *self.last_result.write().await = Some(RunResult {
            success,
            summary: summary.clone(),
            final_state,
        });
        let _ = self.events.send(RunEvent::Completed { success, summary });
        info!(run_id = %run_id, state = %final_state, "Automation run finished");
    }

    async fn run_stages(&self) -> Result<(), RigError> {
        for (index, stage) in Self::STAGES.iter().enumerate() {
            if index > 0 {
                self.stage_boundary(*stage).await?;
            } else if self.stop.is_raised() {
                return Err(RigError::Cancelled);
            }
            self.enter_stage(*stage).await?;
        }
        Ok(())
    }

    /// Between-states suspension point: honors stop, pause, and
    /// step-confirm mode, then transitions into `next`.
    async fn stage_boundary(&self, next: RunState) -> Result<(), RigError> {
        if self.stop.is_raised() {
            return Err(RigError::Cancelled);
        }
        if self.config.run_mode == RunMode::StepConfirm {
            info!(next = %next, "Step-confirm: waiting for operator resume");
            *self.pause_requested.write().await = true;
        }
        if *self.pause_requested.read().await {
            let frozen = *self.state.read().await;
            self.transition(RunState::Paused, &format!("paused before {}", next))
                .await;
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if self.stop.is_raised() {
                    return Err(RigError::Cancelled);
                }
                if !*self.pause_requested.read().await {
                    break;
                }
            }
            info!(frozen = %frozen, next = %next, "Resumed");
        }
        self.transition(next, stage_message(next)).await;
        Ok(())
    }

    async fn enter_stage(&self, stage: RunState) -> Result<(), RigError> {
        match stage {
            RunState::Initializing => self.stage_initialize().await,
            RunState::PreparingVacuum => self.stage_prepare_vacuum().await,
            RunState::StartingDryPump => self.stage_start_dry_pump().await,
            RunState::StartingTurboPump => self.stage_start_turbo_pump().await,
            RunState::ActivatingIonGauge => self.stage_activate_ion_gauge().await,
            RunState::WaitingHighVacuum => self.stage_wait_high_vacuum().await,
            RunState::StartingHeater => self.stage_start_heater().await,
            RunState::RunningExperiment => self.stage_run_experiment().await,
            other => {
                warn!(state = %other, "No entry action for state");
                Ok(())
            }
        }
    }

    // =========================================================================
    // Stage entry actions
    // =========================================================================

    async fn stage_initialize(&self) -> Result<(), RigError> {
        let facade = self.facade.clone();
        let result = self
            .timed_wait(
                RunState::Initializing,
                "device connections",
                self.config.init_timeout,
                move || facade.disconnected_subsystems().is_empty(),
            )
            .await;
        if result.is_err() {
            let down = self.facade.disconnected_subsystems();
            error!(subsystems = ?down, "Subsystems not connected");
        } else {
            info!("All subsystems connected");
        }
        result
    }

    async fn stage_prepare_vacuum(&self) -> Result<(), RigError> {
        self.valve_command(ValveId::Vent, false).await?;
        self.valve_command(ValveId::Exhaust, false).await?;
        self.valve_command(ValveId::Gate, true).await?;

        let rx = self.snapshots.clone();
        self.timed_wait(
            RunState::PreparingVacuum,
            "valve lineup for pump-down",
            self.config.valve_timeout,
            move || {
                let s = rx.borrow();
                s.gate_open && !s.vent_open && !s.exhaust_open
            },
        )
        .await
    }

    async fn stage_start_dry_pump(&self) -> Result<(), RigError> {
        let pump = Arc::clone(&self.facade.dry_pump);
        self.command("start dry pump", move || {
            let pump = Arc::clone(&pump);
            async move { pump.start().await }
        })
        .await?;

        let rx = self.snapshots.clone();
        self.timed_wait(
            RunState::StartingDryPump,
            "dry pump running",
            self.config.dry_pump_timeout,
            move || rx.borrow().dry_pump_running,
        )
        .await
    }

    async fn stage_start_turbo_pump(&self) -> Result<(), RigError> {
        if !self.snapshot().dry_pump_running {
            return Err(RigError::Interlock(
                "turbo pump start requires the dry pump running".into(),
            ));
        }

        self.threshold_wait(
            RunState::StartingTurboPump,
            "rough vacuum for turbo start",
            self.config.turbo_start_pressure,
            self.config.turbo_pump_timeout,
        )
        .await?;

        let turbo = Arc::clone(&self.facade.turbo_pump);
        self.command("start turbo pump", move || {
            let turbo = Arc::clone(&turbo);
            async move { turbo.start().await }
        })
        .await?;

        let rx = self.snapshots.clone();
        self.timed_wait(
            RunState::StartingTurboPump,
            "turbo pump at speed",
            self.config.turbo_pump_timeout,
            move || rx.borrow().turbo_at_speed,
        )
        .await
    }

    async fn stage_activate_ion_gauge(&self) -> Result<(), RigError> {
        self.threshold_wait(
            RunState::ActivatingIonGauge,
            "gauge activation pressure",
            self.config.ion_gauge_on_pressure,
            self.config.ion_gauge_timeout,
        )
        .await?;

        let gauge = Arc::clone(&self.facade.ion_gauge);
        self.command("ion gauge hv on", move || {
            let gauge = Arc::clone(&gauge);
            async move { gauge.hv_on().await }
        })
        .await?;

        let rx = self.snapshots.clone();
        self.timed_wait(
            RunState::ActivatingIonGauge,
            "gauge hv confirmed",
            self.config.valve_timeout,
            move || rx.borrow().ion_gauge_hv_on,
        )
        .await
    }

    async fn stage_wait_high_vacuum(&self) -> Result<(), RigError> {
        self.threshold_wait(
            RunState::WaitingHighVacuum,
            "high vacuum",
            self.config.heater_start_pressure,
            self.config.high_vacuum_timeout,
        )
        .await
    }

    async fn stage_start_heater(&self) -> Result<(), RigError> {
        // Cooling before heat: the chiller runs whenever the heater does
        let chiller = Arc::clone(&self.facade.chiller);
        self.command("start chiller", move || {
            let chiller = Arc::clone(&chiller);
            async move { chiller.start().await }
        })
        .await?;

        let setpoint = self.config.heater_setpoint;
        let heater = Arc::clone(&self.facade.heater);
        self.command("apply heater setpoint", move || {
            let heater = Arc::clone(&heater);
            async move { heater.set_temperature(setpoint).await }
        })
        .await?;

        let heater = Arc::clone(&self.facade.heater);
        self.command("enable heater", move || {
            let heater = Arc::clone(&heater);
            async move { heater.enable().await }
        })
        .await?;

        // Thermal readings are stable; one in-band reading suffices
        let tolerance = self.config.temperature_tolerance;
        let rx = self.snapshots.clone();
        self.timed_wait(
            RunState::StartingHeater,
            "heater at setpoint",
            self.config.heater_timeout,
            move || within_tolerance(rx.borrow().heater_temperature_c, setpoint, tolerance),
        )
        .await
    }

    async fn stage_run_experiment(&self) -> Result<(), RigError> {
        let total = self.config.experiment_duration;
        let max_pressure = self.config.max_experiment_pressure;
        let started = tokio::time::Instant::now();
        let mut last_log = Duration::ZERO;
        info!(duration = ?total, max_pressure_torr = max_pressure, "Experiment hold started");

        loop {
            if self.stop.is_raised() {
                return Err(RigError::Cancelled);
            }

            let snap = self.snapshot();
            if snap.chamber_pressure_torr > max_pressure {
                return Err(RigError::Interlock(format!(
                    "chamber pressure {:.2e} Torr exceeded the {:.2e} Torr experiment limit",
                    snap.chamber_pressure_torr, max_pressure
                )));
            }

            let elapsed = started.elapsed();
            if elapsed >= total {
                break;
            }
            let remaining = total - elapsed;
            self.emit_progress(
                RunState::RunningExperiment,
                percent_of(elapsed, total),
                format!("experiment hold, {:.0}s remaining", remaining.as_secs_f64()),
                elapsed,
                remaining,
            );
            if elapsed - last_log >= self.config.logging_interval {
                info!(
                    pressure_torr = snap.chamber_pressure_torr,
                    heater_c = snap.heater_temperature_c,
                    chamber_c = snap.chamber_temperature_c,
                    elapsed = ?elapsed,
                    "Experiment status"
                );
                last_log = elapsed;
            }
            tokio::time::sleep(POLL_PERIOD.min(remaining)).await;
        }

        info!("Experiment hold complete");
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn snapshot(&self) -> RigSnapshot {
        self.snapshots.borrow().clone()
    }

    fn retryer(&self) -> RetryExecutor {
        RetryExecutor::new(self.config.max_retries, self.config.retry_delay)
    }

    /// Run a device command through the retry executor; exhaustion becomes
    /// the stage's failure edge.
    async fn command<F, Fut>(&self, name: &str, op: F) -> Result<(), RigError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if self.retryer().execute(name, op).await {
            Ok(())
        } else {
            Err(RigError::Device(format!(
                "{} failed after {} attempts",
                name, self.config.max_retries
            )))
        }
    }

    async fn valve_command(&self, valve: ValveId, open: bool) -> Result<(), RigError> {
        let name = format!("{} {} valve", if open { "open" } else { "close" }, valve);
        let valves = Arc::clone(&self.facade.valves);
        self.command(&name, move || {
            let valves = Arc::clone(&valves);
            async move {
                if open {
                    valves.open(valve).await
                } else {
                    valves.close(valve).await
                }
            }
        })
        .await
    }

    /// Bounded wait with time-based progress reporting.
    async fn timed_wait<P>(
        &self,
        state: RunState,
        what: &str,
        timeout: Duration,
        predicate: P,
    ) -> Result<(), RigError>
    where
        P: FnMut() -> bool,
    {
        let events = self.events.clone();
        let label = what.to_string();
        let outcome = wait_for(
            what,
            predicate,
            timeout,
            POLL_PERIOD,
            &self.stop,
            move |elapsed, remaining| {
                let _ = events.send(RunEvent::Progress {
                    state,
                    percent: percent_of(elapsed, timeout),
                    message: format!("waiting for {}", label),
                    elapsed,
                    remaining,
                });
            },
        )
        .await;
        wait_result(outcome, what)
    }

    /// Debounced pressure-threshold wait with reach-count progress.
    async fn threshold_wait(
        &self,
        state: RunState,
        what: &str,
        target: f64,
        timeout: Duration,
    ) -> Result<(), RigError> {
        let required = self.config.pressure_confirm_count;
        let mut counter = ReachCounter::new(target, required);
        let observed = AtomicU32::new(0);
        let rx = self.snapshots.clone();
        let events = self.events.clone();
        let label = what.to_string();

        let outcome = {
            let observed = &observed;
            wait_for(
                what,
                move || {
                    let reading = rx.borrow().chamber_pressure_torr;
                    let reached = counter.register(reading);
                    observed.store(counter.progress().0, Ordering::Relaxed);
                    reached
                },
                timeout,
                POLL_PERIOD,
                &self.stop,
                move |elapsed, remaining| {
                    let current = observed.load(Ordering::Relaxed);
                    let percent = ((current * 100) / required.max(1)).min(100) as u8;
                    let _ = events.send(RunEvent::Progress {
                        state,
                        percent,
                        message: format!(
                            "{}: {}/{} confirmations below {:.1e} Torr",
                            label, current, required, target
                        ),
                        elapsed,
                        remaining,
                    });
                },
            )
            .await
        };
        wait_result(outcome, what)
    }

    async fn run_shutdown(&self) -> ShutdownReport {
        let coordinator = ShutdownCoordinator::new(
            self.facade.clone(),
            self.snapshots.clone(),
            self.config.clone(),
        );
        coordinator.run().await
    }

    async fn transition(&self, new: RunState, message: &str) {
        let previous = {
            let mut state = self.state.write().await;
            let previous = *state;
            *state = new;
            previous
        };
        info!(previous = %previous, state = %new, message, "State transition");
        let _ = self.events.send(RunEvent::StateChanged {
            previous,
            new,
            message: message.to_string(),
        });
    }

    fn emit_progress(
        &self,
        state: RunState,
        percent: u8,
        message: String,
        elapsed: Duration,
        remaining: Duration,
    ) {
        let _ = self.events.send(RunEvent::Progress {
            state,
            percent,
            message,
            elapsed,
            remaining,
        });
    }
}

fn wait_result(outcome: WaitOutcome, what: &str) -> Result<(), RigError> {
    match outcome {
        WaitOutcome::Satisfied => Ok(()),
        WaitOutcome::TimedOut => Err(RigError::Timeout(what.to_string())),
        WaitOutcome::Cancelled => Err(RigError::Cancelled),
    }
}

fn percent_of(elapsed: Duration, total: Duration) -> u8 {
    if total.is_zero() {
        return 100;
    }
    ((elapsed.as_secs_f64() / total.as_secs_f64()) * 100.0).min(100.0) as u8
}

fn stage_message(state: RunState) -> &'static str {
    match state {
        RunState::Initializing => "verifying device connections",
        RunState::PreparingVacuum => "lining up valves for pump-down",
        RunState::StartingDryPump => "starting roughing pump",
        RunState::StartingTurboPump => "waiting for rough vacuum, then starting turbo pump",
        RunState::ActivatingIonGauge => "energizing ion gauge",
        RunState::WaitingHighVacuum => "confirming stable high vacuum",
        RunState::StartingHeater => "ramping heater to setpoint",
        RunState::RunningExperiment => "experiment hold",
        RunState::ShuttingDown => "running safe shutdown",
        _ => "",
    }
}
