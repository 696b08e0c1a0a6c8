//! End-to-end tests driving the sequencer against the simulated rig.
//!
//! All tests run under tokio's paused clock, so multi-minute virtual runs
//! finish in milliseconds of wall time while keeping real timing semantics.

use std::sync::Arc;
use std::time::Duration;
use vacuum_rig::config::RunConfiguration;
use vacuum_rig::core::{AutomationGuard, RunEvent, RunState};
use vacuum_rig::hardware::mock::SimulatedRig;
use vacuum_rig::hardware::poller::StatusPoller;
use vacuum_rig::sequencer::SequenceController;

/// Virtual-time bound on any single test run.
const TEST_DEADLINE: Duration = Duration::from_secs(8 * 3600);

fn quick_config() -> RunConfiguration {
    RunConfiguration {
        experiment_duration: Duration::from_secs(30),
        logging_interval: Duration::from_secs(10),
        retry_delay: Duration::from_millis(200),
        ..Default::default()
    }
}

fn build_controller(
    rig: &SimulatedRig,
    config: RunConfiguration,
) -> Arc<SequenceController> {
    let (snapshots, _handle) =
        StatusPoller::spawn(rig.snapshot_source(), Duration::from_millis(200));
    Arc::new(SequenceController::new(
        config,
        rig.facade(),
        snapshots,
        AutomationGuard::new(),
    ))
}

/// Drain events until the Completed notification, returning everything seen.
async fn collect_until_completed(
    events: &mut tokio::sync::broadcast::Receiver<RunEvent>,
) -> Vec<RunEvent> {
    let mut seen = Vec::new();
    tokio::time::timeout(TEST_DEADLINE, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let done = matches!(event, RunEvent::Completed { .. });
                    seen.push(event);
                    if done {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await
    .expect("run did not finish before the test deadline");
    seen
}

/// The sequence of states entered, from StateChanged events.
fn states_entered(events: &[RunEvent]) -> Vec<RunState> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::StateChanged { new, .. } => Some(*new),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn full_run_completes_and_safes_the_rig() {
    let rig = SimulatedRig::spawn(Duration::from_millis(100));
    let controller = build_controller(&rig, quick_config());
    let mut events = controller.subscribe();

    assert!(controller.clone().start().await);
    let seen = collect_until_completed(&mut events).await;

    // Ends in Completed with success
    assert_eq!(controller.state().await, RunState::Completed);
    let result = controller.last_result().await.expect("run result");
    assert!(result.success, "summary: {}", result.summary);
    assert_eq!(result.final_state, RunState::Completed);
    assert!(matches!(
        seen.last(),
        Some(RunEvent::Completed { success: true, .. })
    ));

    // Every stage ran, in table order, with no stage skipped
    assert_eq!(
        states_entered(&seen),
        vec![
            RunState::Initializing,
            RunState::PreparingVacuum,
            RunState::StartingDryPump,
            RunState::StartingTurboPump,
            RunState::ActivatingIonGauge,
            RunState::WaitingHighVacuum,
            RunState::StartingHeater,
            RunState::RunningExperiment,
            RunState::ShuttingDown,
            RunState::Completed,
        ]
    );

    // The shutdown left the rig safed
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

    // Long waits reported progress
    assert!(seen
        .iter()
        .any(|e| matches!(e, RunEvent::Progress { .. })));
}

#[tokio::test(start_paused = true)]
async fn stop_during_high_vacuum_wait_takes_shutdown_path() {
    let rig = SimulatedRig::spawn(Duration::from_millis(100));
    // A threshold the simulated plant can never reach keeps the run parked
    // in WaitingHighVacuum until the operator intervenes
    let config = RunConfiguration {
        heater_start_pressure: 1e-9,
        ..quick_config()
    };
    let controller = build_controller(&rig, config);
    let mut events = controller.subscribe();

    assert!(controller.clone().start().await);

    let seen = tokio::time::timeout(TEST_DEADLINE, async {
        let mut seen = Vec::new();
        loop {
            let event = events.recv().await.expect("event stream open");
            if let RunEvent::StateChanged { new, .. } = &event {
                if *new == RunState::WaitingHighVacuum {
                    // Let the wait actually start polling, then stop
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    controller.stop().await.expect("stop accepted");
                }
            }
            let done = matches!(event, RunEvent::Completed { .. });
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    })
    .await
    .expect("run did not finish");

    // Cancelled, not timed out: straight from the wait into ShuttingDown
    let states = states_entered(&seen);
    let wait_pos = states
        .iter()
        .position(|s| *s == RunState::WaitingHighVacuum)
        .expect("reached WaitingHighVacuum");
    assert_eq!(states[wait_pos + 1], RunState::ShuttingDown);
    assert!(!states.contains(&RunState::RunningExperiment));
    assert_eq!(*states.last().expect("states"), RunState::Aborted);

    // An operator stop is not an error
    assert!(!seen.iter().any(|e| matches!(e, RunEvent::Error { .. })));
    let result = controller.last_result().await.expect("run result");
    assert!(!result.success);
    assert!(result.summary.contains("stopped by operator"));
}

#[tokio::test(start_paused = true)]
async fn stage_failure_triggers_safe_shutdown_and_abort() {
    let rig = SimulatedRig::spawn(Duration::from_millis(100));
    rig.faults().fail_turbo();
    let controller = build_controller(&rig, quick_config());
    let mut events = controller.subscribe();

    assert!(controller.clone().start().await);
    let seen = collect_until_completed(&mut events).await;

    // The failure was reported as fatal before the shutdown handoff
    assert!(seen.iter().any(|e| matches!(
        e,
        RunEvent::Error { fatal: true, .. }
    )));

    let states = states_entered(&seen);
    assert!(states.contains(&RunState::ShuttingDown));
    assert_eq!(*states.last().expect("states"), RunState::Aborted);
    assert!(!states.contains(&RunState::RunningExperiment));

    // Shutdown still safed what it could: the dry pump is off again
    rig.with_plant(|p| {
        assert!(!p.dry_pump_on);
        assert!(!p.heater_enabled);
    });
}

#[tokio::test(start_paused = true)]
async fn stage_failure_without_auto_shutdown_leaves_hardware_as_is() {
    let rig = SimulatedRig::spawn(Duration::from_millis(100));
    rig.faults().fail_ion_gauge();
    let config = RunConfiguration {
        shutdown_on_failure: false,
        ..quick_config()
    };
    let controller = build_controller(&rig, config);
    let mut events = controller.subscribe();

    assert!(controller.clone().start().await);
    let seen = collect_until_completed(&mut events).await;

    let states = states_entered(&seen);
    assert_eq!(*states.last().expect("states"), RunState::Error);
    assert!(!states.contains(&RunState::ShuttingDown));

    // Caller must intervene: the pumps were deliberately left running
    rig.with_plant(|p| {
        assert!(p.dry_pump_on);
        assert!(p.turbo_on);
    });
}

#[tokio::test(start_paused = true)]
async fn pressure_excursion_during_experiment_aborts_the_run() {
    let rig = SimulatedRig::spawn(Duration::from_millis(100));
    let config = RunConfiguration {
        experiment_duration: Duration::from_secs(600),
        ..quick_config()
    };
    let controller = build_controller(&rig, config);
    let mut events = controller.subscribe();

    assert!(controller.clone().start().await);

    let seen = tokio::time::timeout(TEST_DEADLINE, async {
        let mut seen = Vec::new();
        loop {
            let event = events.recv().await.expect("event stream open");
            if let RunEvent::StateChanged { new, .. } = &event {
                if *new == RunState::RunningExperiment {
                    // Mid-hold mishap: the vent valve drops open
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    rig.with_plant(|p| p.vent_open = true);
                }
            }
            let done = matches!(event, RunEvent::Completed { .. });
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    })
    .await
    .expect("run did not finish");

    let error = seen
        .iter()
        .find_map(|e| match e {
            RunEvent::Error { message, fatal } => Some((message.clone(), *fatal)),
            _ => None,
        })
        .expect("pressure excursion reported");
    assert!(error.0.contains("exceeded"), "message: {}", error.0);
    assert!(error.1, "excursion must be fatal");

    let states = states_entered(&seen);
    let run_pos = states
        .iter()
        .position(|s| *s == RunState::RunningExperiment)
        .expect("reached RunningExperiment");
    assert_eq!(states[run_pos + 1], RunState::ShuttingDown);
    assert_eq!(*states.last().expect("states"), RunState::Aborted);
}

#[tokio::test(start_paused = true)]
async fn step_confirm_mode_pauses_at_each_boundary() {
    let rig = SimulatedRig::spawn(Duration::from_millis(100));
    let config = RunConfiguration {
        run_mode: vacuum_rig::config::RunMode::StepConfirm,
        ..quick_config()
    };
    let controller = build_controller(&rig, config);
    let mut events = controller.subscribe();

    assert!(controller.clone().start().await);

    // Walk the whole run, resuming every time the controller pauses
    let seen = tokio::time::timeout(TEST_DEADLINE, async {
        let mut seen = Vec::new();
        loop {
            let event = events.recv().await.expect("event stream open");
            if let RunEvent::StateChanged { new, .. } = &event {
                if *new == RunState::Paused {
                    controller.resume().await.expect("resume accepted");
                }
            }
            let done = matches!(event, RunEvent::Completed { .. });
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    })
    .await
    .expect("run did not finish");

    let states = states_entered(&seen);
    // One confirmation pause before each stage after the first
    let pauses = states.iter().filter(|s| **s == RunState::Paused).count();
    assert_eq!(pauses, 7);
    assert_eq!(*states.last().expect("states"), RunState::Completed);
}
