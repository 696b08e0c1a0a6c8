//! Best-effort safe shutdown of the rig.
//!
//! The shutdown sequence is linear and fixed: thermal and electrical safety
//! first (heater off, gauge HV off), then mechanical (turbo, dry pump), then
//! venting, then a cool-down gate before the vent valves close again. Which
//! steps actually run is decided from a fresh status snapshot at the moment
//! shutdown starts, never from stale state captured earlier in the run.
//!
//! A step that fails after exhausting its retries is logged as a warning and
//! recorded in the report; the coordinator always proceeds to the next step.
//! A single stuck valve must not prevent it from at least attempting to stop
//! the pumps and de-energize the gauge.

use crate::config::RunConfiguration;
use crate::core::{RigFacade, RigSnapshot, StopSignal, ValveId};
use crate::retry::RetryExecutor;
use crate::waiter::{wait_for, WaitOutcome};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// The shutdown steps, in the only order they are allowed to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    /// Disable the heater output
    StopHeater,
    /// De-energize the ion gauge high voltage
    GaugeHvOff,
    /// Stop the turbo pump and wait for spin-down
    StopTurboPump,
    /// Stop the dry pump
    StopDryPump,
    /// Close the gate valve
    CloseGateValve,
    /// Open the vent and exhaust valves
    OpenVentValves,
    /// Wait for the chamber to cool below the vent-close temperature
    CoolDown,
    /// Close the vent and exhaust valves again
    CloseVentValves,
    /// Stop the chiller
    StopChiller,
}

impl StepKind {
    /// Fixed execution order. Pumps are never stopped before the heater and
    /// gauge HV are off; venting only happens after both pumps were
    /// commanded to stop.
    pub const ORDER: [StepKind; 9] = [
        StepKind::StopHeater,
        StepKind::GaugeHvOff,
        StepKind::StopTurboPump,
        StepKind::StopDryPump,
        StepKind::CloseGateValve,
        StepKind::OpenVentValves,
        StepKind::CoolDown,
        StepKind::CloseVentValves,
        StepKind::StopChiller,
    ];

    /// Human-readable step name used in logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::StopHeater => "stop heater",
            StepKind::GaugeHvOff => "ion gauge hv off",
            StepKind::StopTurboPump => "stop turbo pump",
            StepKind::StopDryPump => "stop dry pump",
            StepKind::CloseGateValve => "close gate valve",
            StepKind::OpenVentValves => "open vent valves",
            StepKind::CoolDown => "chamber cool-down",
            StepKind::CloseVentValves => "close vent valves",
            StepKind::StopChiller => "stop chiller",
        }
    }
}

/// One entry of the computed shutdown plan.
#[derive(Clone, Debug)]
pub struct ShutdownStep {
    /// Which step
    pub kind: StepKind,
    /// Whether the live snapshot said the step has work to do
    pub needed: bool,
}

/// How a step ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepStatus {
    /// Executed and verified
    Ran,
    /// Not needed per the snapshot taken at plan time
    Skipped,
    /// Exhausted retries or failed verification; sequence continued
    Failed,
}

/// Outcome of one step.
#[derive(Clone, Debug)]
pub struct StepOutcome {
    /// Step name
    pub name: &'static str,
    /// How it ended
    pub status: StepStatus,
}

/// Structured result of a shutdown pass.
#[derive(Clone, Debug)]
pub struct ShutdownReport {
    /// Per-step outcomes, in execution order
    pub steps: Vec<StepOutcome>,
    /// When the sequence started
    pub started_at: DateTime<Utc>,
    /// When the sequence finished
    pub finished_at: DateTime<Utc>,
}

impl ShutdownReport {
    /// Whether every needed step ran to completion.
    pub fn all_clean(&self) -> bool {
        self.steps.iter().all(|s| s.status != StepStatus::Failed)
    }

    /// Names of the steps that failed.
    pub fn failed_steps(&self) -> Vec<&'static str> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| s.name)
            .collect()
    }

    /// One-line summary for logs and the completion notification.
    pub fn summary(&self) -> String {
        let ran = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Ran)
            .count();
        let skipped = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Skipped)
            .count();
        let failed = self.failed_steps();
        if failed.is_empty() {
            format!("shutdown complete: {} steps ran, {} skipped", ran, skipped)
        } else {
            format!(
                "shutdown finished with failures: {} ran, {} skipped, failed: {}",
                ran,
                skipped,
                failed.join(", ")
            )
        }
    }
}

/// Executes the fixed shutdown sequence against a rig facade.
pub struct ShutdownCoordinator {
    facade: RigFacade,
    snapshots: watch::Receiver<RigSnapshot>,
    config: RunConfiguration,
}

impl ShutdownCoordinator {
    /// A coordinator over the given facade and snapshot stream.
    pub fn new(
        facade: RigFacade,
        snapshots: watch::Receiver<RigSnapshot>,
        config: RunConfiguration,
    ) -> Self {
        Self {
            facade,
            snapshots,
            config,
        }
    }

    /// Compute the step plan from a fresh snapshot.
    ///
    /// Need-detection is live: "is the gauge HV currently on" is asked of
    /// the snapshot as it is right now, not of anything remembered from
    /// earlier in the run.
    pub fn plan(&self) -> Vec<ShutdownStep> {
        let snap = self.snapshots.borrow().clone();
        StepKind::ORDER
            .iter()
            .map(|kind| ShutdownStep {
                kind: *kind,
                needed: Self::is_needed(*kind, &snap, &self.config),
            })
            .collect()
    }

    fn is_needed(kind: StepKind, snap: &RigSnapshot, config: &RunConfiguration) -> bool {
        match kind {
            StepKind::StopHeater => snap.heater_enabled,
            StepKind::GaugeHvOff => snap.ion_gauge_hv_on,
            StepKind::StopTurboPump => snap.turbo_running,
            StepKind::StopDryPump => snap.dry_pump_running,
            StepKind::CloseGateValve => snap.gate_open,
            StepKind::OpenVentValves => !(snap.vent_open && snap.exhaust_open),
            StepKind::CoolDown => snap.chamber_temperature_c >= config.vent_temperature,
            // The vents were just opened (or already were); always restore
            StepKind::CloseVentValves => true,
            StepKind::StopChiller => snap.chiller_running,
        }
    }

    /// Run the sequence to completion, best effort.
    ///
    /// Shutdown is not cancellable: once started it runs every needed step
    /// or exhausts each step's retries trying.
    pub async fn run(&self) -> ShutdownReport {
        let plan = self.plan();
        let needed = plan.iter().filter(|s| s.needed).count();
        let started_at = Utc::now();
        info!(total = plan.len(), needed, "Beginning shutdown sequence");

        let mut steps = Vec::with_capacity(plan.len());
        for step in plan {
            if !step.needed {
                info!(step = step.kind.name(), "Skipping step, not needed");
                steps.push(StepOutcome {
                    name: step.kind.name(),
                    status: StepStatus::Skipped,
                });
                continue;
            }

            info!(step = step.kind.name(), "Executing shutdown step");
            let ok = self.execute(step.kind).await;
            if !ok {
                warn!(step = step.kind.name(), "Shutdown step failed, continuing");
            }
            steps.push(StepOutcome {
                name: step.kind.name(),
                status: if ok { StepStatus::Ran } else { StepStatus::Failed },
            });
        }

        let report = ShutdownReport {
            steps,
            started_at,
            finished_at: Utc::now(),
        };
        info!(summary = %report.summary(), "Shutdown sequence finished");
        report
    }

    async fn execute(&self, kind: StepKind) -> bool {
        let retry = RetryExecutor::new(self.config.max_retries, self.config.retry_delay);
        // Shutdown steps ignore operator stop requests
        let no_stop = StopSignal::new();

        match kind {
            StepKind::StopHeater => {
                let heater = Arc::clone(&self.facade.heater);
                let commanded = retry
                    .execute("stop heater", move || {
                        let heater = Arc::clone(&heater);
                        async move { heater.disable().await }
                    })
                    .await;
                commanded
                    && self
                        .verify("heater off", |s| !s.heater_enabled, self.config.shutdown_timeout, &no_stop)
                        .await
            }
            StepKind::GaugeHvOff => {
                let gauge = Arc::clone(&self.facade.ion_gauge);
                let commanded = retry
                    .execute("ion gauge hv off", move || {
                        let gauge = Arc::clone(&gauge);
                        async move { gauge.hv_off().await }
                    })
                    .await;
                commanded
                    && self
                        .verify("gauge hv off", |s| !s.ion_gauge_hv_on, self.config.shutdown_timeout, &no_stop)
                        .await
            }
            StepKind::StopTurboPump => {
                let turbo = Arc::clone(&self.facade.turbo_pump);
                let commanded = retry
                    .execute("stop turbo pump", move || {
                        let turbo = Arc::clone(&turbo);
                        async move { turbo.stop().await }
                    })
                    .await;
                commanded
                    && self
                        .verify(
                            "turbo spin-down",
                            |s| !s.turbo_running,
                            self.config.shutdown_timeout,
                            &no_stop,
                        )
                        .await
            }
            StepKind::StopDryPump => {
                let pump = Arc::clone(&self.facade.dry_pump);
                let commanded = retry
                    .execute("stop dry pump", move || {
                        let pump = Arc::clone(&pump);
                        async move { pump.stop().await }
                    })
                    .await;
                commanded
                    && self
                        .verify(
                            "dry pump stopped",
                            |s| !s.dry_pump_running,
                            self.config.shutdown_timeout,
                            &no_stop,
                        )
                        .await
            }
            StepKind::CloseGateValve => {
                self.operate_valve(&retry, ValveId::Gate, false, &no_stop).await
            }
            StepKind::OpenVentValves => {
                let vent = self.operate_valve(&retry, ValveId::Vent, true, &no_stop).await;
                let exhaust = self
                    .operate_valve(&retry, ValveId::Exhaust, true, &no_stop)
                    .await;
                vent && exhaust
            }
            StepKind::CoolDown => {
                let vent_temperature = self.config.vent_temperature;
                let snapshots = self.snapshots.clone();
                let outcome = wait_for(
                    "chamber cool-down before vent close",
                    move || snapshots.borrow().chamber_temperature_c < vent_temperature,
                    self.config.cooldown_timeout,
                    Duration::from_secs(60),
                    &no_stop,
                    |elapsed, _| {
                        info!(elapsed = ?elapsed, "Waiting for chamber to cool");
                    },
                )
                .await;
                outcome == WaitOutcome::Satisfied
            }
            StepKind::CloseVentValves => {
                let vent = self.operate_valve(&retry, ValveId::Vent, false, &no_stop).await;
                let exhaust = self
                    .operate_valve(&retry, ValveId::Exhaust, false, &no_stop)
                    .await;
                vent && exhaust
            }
            StepKind::StopChiller => {
                let chiller = Arc::clone(&self.facade.chiller);
                let commanded = retry
                    .execute("stop chiller", move || {
                        let chiller = Arc::clone(&chiller);
                        async move { chiller.stop().await }
                    })
                    .await;
                commanded
                    && self
                        .verify(
                            "chiller stopped",
                            |s| !s.chiller_running,
                            self.config.shutdown_timeout,
                            &no_stop,
                        )
                        .await
            }
        }
    }

    async fn operate_valve(
        &self,
        retry: &RetryExecutor,
        valve: ValveId,
        open: bool,
        no_stop: &StopSignal,
    ) -> bool {
        let name = if open { "open" } else { "close" };
        let valves = Arc::clone(&self.facade.valves);
        let op_name = format!("{} {} valve", name, valve);
        let commanded = retry
            .execute(&op_name, move || {
                let valves = Arc::clone(&valves);
                async move {
                    if open {
                        valves.open(valve).await
                    } else {
                        valves.close(valve).await
                    }
                }
            })
            .await;
        commanded
            && self
                .verify(
                    &op_name,
                    move |s| s.valve_open(valve) == open,
                    self.config.valve_timeout,
                    no_stop,
                )
                .await
    }

    async fn verify<P>(
        &self,
        what: &str,
        mut predicate: P,
        timeout: Duration,
        no_stop: &StopSignal,
    ) -> bool
    where
        P: FnMut(&RigSnapshot) -> bool,
    {
        let snapshots = self.snapshots.clone();
        let outcome = wait_for(
            what,
            move || predicate(&snapshots.borrow()),
            timeout,
            Duration::from_secs(30),
            no_stop,
            |_, _| {},
        )
        .await;
        outcome == WaitOutcome::Satisfied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedRig;
    use crate::hardware::poller::StatusPoller;

    fn test_config() -> RunConfiguration {
        RunConfiguration {
            retry_delay: Duration::from_millis(100),
            valve_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            cooldown_timeout: Duration::from_secs(600),
            ..Default::default()
        }
    }

    async fn coordinator_for(rig: &SimulatedRig) -> ShutdownCoordinator {
        let (snapshots, _handle) =
            StatusPoller::spawn(rig.snapshot_source(), Duration::from_millis(100));
        // Let the poller publish a snapshot of the prepared plant state
        tokio::time::sleep(Duration::from_millis(250)).await;
        ShutdownCoordinator::new(rig.facade(), snapshots, test_config())
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_steps_that_are_not_needed() {
        let rig = SimulatedRig::spawn(Duration::from_millis(100));
        // Mid-run state, except gauge HV is already off and the turbo has
        // already stopped: those two steps must be skipped.
        rig.with_plant(|p| {
            p.heater_enabled = true;
            p.heater_setpoint = 120.0;
            p.heater_temp = 120.0;
            p.chamber_temp = 90.0;
            p.dry_pump_on = true;
            p.turbo_on = false;
            p.turbo_speed = 0.0;
            p.gauge_hv = false;
            p.gate_open = true;
        });

        let coordinator = coordinator_for(&rig).await;
        let report = coordinator.run().await;

        let by_name: Vec<(&str, StepStatus)> =
            report.steps.iter().map(|s| (s.name, s.status)).collect();
        assert_eq!(
            by_name,
            vec![
                ("stop heater", StepStatus::Ran),
                ("ion gauge hv off", StepStatus::Skipped),
                ("stop turbo pump", StepStatus::Skipped),
                ("stop dry pump", StepStatus::Ran),
                ("close gate valve", StepStatus::Ran),
                ("open vent valves", StepStatus::Ran),
                ("chamber cool-down", StepStatus::Ran),
                ("close vent valves", StepStatus::Ran),
                ("stop chiller", StepStatus::Skipped),
            ]
        );
        assert!(report.all_clean());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_shutdown_from_running_experiment() {
        let rig = SimulatedRig::spawn(Duration::from_millis(100));
        rig.with_plant(|p| {
            p.heater_enabled = true;
            p.heater_setpoint = 120.0;
            p.heater_temp = 120.0;
            p.chamber_temp = 100.0;
            p.dry_pump_on = true;
            p.turbo_on = true;
            p.turbo_speed = 1.0;
            p.gauge_hv = true;
            p.gate_open = true;
            p.chiller_on = true;
            p.chamber_pressure = 1e-6;
        });

        let coordinator = coordinator_for(&rig).await;
        let report = coordinator.run().await;

        assert!(report.all_clean(), "failed: {:?}", report.failed_steps());
        assert!(report.steps.iter().all(|s| s.status == StepStatus::Ran));
        // The rig really is safed afterwards
        rig.with_plant(|p| {
            assert!(!p.heater_enabled);
            assert!(!p.gauge_hv);
            assert!(!p.turbo_on);
            assert!(!p.dry_pump_on);
            assert!(!p.gate_open);
            assert!(!p.vent_open);
            assert!(!p.exhaust_open);
            assert!(!p.chiller_on);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_effort_continues_past_stuck_valves() {
        let rig = SimulatedRig::spawn(Duration::from_millis(100));
        rig.with_plant(|p| {
            p.heater_enabled = true;
            p.heater_temp = 120.0;
            p.chamber_temp = 30.0; // already cool, cool-down gate skipped
            p.dry_pump_on = true;
            p.turbo_on = true;
            p.turbo_speed = 1.0;
            p.gauge_hv = true;
            p.gate_open = true;
        });
        rig.faults().fail_valves();

        let coordinator = coordinator_for(&rig).await;
        let report = coordinator.run().await;

        assert!(!report.all_clean());
        assert_eq!(
            report.failed_steps(),
            vec!["close gate valve", "open vent valves", "close vent valves"]
        );
        // Pumps and gauge were still safed despite the stuck valves
        rig.with_plant(|p| {
            assert!(!p.heater_enabled);
            assert!(!p.gauge_hv);
            assert!(!p.turbo_on);
            assert!(!p.dry_pump_on);
        });
        assert!(report.summary().contains("failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_is_computed_from_live_snapshot() {
        let rig = SimulatedRig::spawn(Duration::from_millis(100));
        rig.with_plant(|p| {
            p.gauge_hv = true;
            p.chamber_temp = 20.0;
        });
        let coordinator = coordinator_for(&rig).await;

        let plan = coordinator.plan();
        let hv = plan
            .iter()
            .find(|s| s.kind == StepKind::GaugeHvOff)
            .map(|s| s.needed);
        assert_eq!(hv, Some(true));

        // Flip the HV off and let the poller publish; a new plan must see it
        rig.with_plant(|p| p.gauge_hv = false);
        tokio::time::sleep(Duration::from_millis(300)).await;
        let plan = coordinator.plan();
        let hv = plan
            .iter()
            .find(|s| s.kind == StepKind::GaugeHvOff)
            .map(|s| s.needed);
        assert_eq!(hv, Some(false));
    }
}
