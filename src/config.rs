//! Application configuration.
//!
//! Settings are loaded from an optional TOML file layered with environment
//! overrides (prefix `VACRIG_`), then validated. Parsing failures surface as
//! [`RigError::Config`]; values that parse but are logically invalid (e.g. a
//! pressure ladder that can never be satisfied) surface as
//! [`RigError::Configuration`] from [`RunConfiguration::validate`].
//!
//! Durations are written as humantime strings (`"30s"`, `"2h"`). All
//! pressures are in Torr, all temperatures in °C.

use crate::error::{AppResult, RigError};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How the sequencer advances through its state table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Advance through every stage without operator interaction
    FullyAutomatic,
    /// Pause at every stage boundary until the operator resumes
    StepConfirm,
    /// Run against the simulated rig
    Simulation,
}

/// Immutable per-run configuration snapshot.
///
/// Supplied at start and fixed for the run's duration; changing it requires
/// stopping and re-creating the controller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunConfiguration {
    /// Chamber pressure below which the turbo pump may start (Torr)
    #[serde(default = "defaults::turbo_start_pressure")]
    pub turbo_start_pressure: f64,
    /// Chamber pressure below which the ion gauge HV may be energized (Torr)
    #[serde(default = "defaults::ion_gauge_on_pressure")]
    pub ion_gauge_on_pressure: f64,
    /// Chamber pressure below which the heater may start (Torr)
    #[serde(default = "defaults::heater_start_pressure")]
    pub heater_start_pressure: f64,
    /// Maximum chamber pressure allowed while the experiment runs (Torr)
    #[serde(default = "defaults::max_experiment_pressure")]
    pub max_experiment_pressure: f64,

    /// Heater temperature setpoint (°C)
    #[serde(default = "defaults::heater_setpoint")]
    pub heater_setpoint: f64,
    /// Symmetric band around the setpoint that counts as "at temperature"
    #[serde(default = "defaults::temperature_tolerance")]
    pub temperature_tolerance: f64,
    /// Chamber must be below this before the vent valves close (°C)
    #[serde(default = "defaults::vent_temperature")]
    pub vent_temperature: f64,

    /// Length of the timed experiment hold
    #[serde(with = "humantime_serde", default = "defaults::experiment_duration")]
    pub experiment_duration: Duration,
    /// Cadence of the periodic experiment log line
    #[serde(with = "humantime_serde", default = "defaults::logging_interval")]
    pub logging_interval: Duration,

    /// Per-stage timeout: device connectivity check
    #[serde(with = "humantime_serde", default = "defaults::init_timeout")]
    pub init_timeout: Duration,
    /// Per-stage timeout: a single valve operation
    #[serde(with = "humantime_serde", default = "defaults::valve_timeout")]
    pub valve_timeout: Duration,
    /// Per-stage timeout: dry pump start
    #[serde(with = "humantime_serde", default = "defaults::dry_pump_timeout")]
    pub dry_pump_timeout: Duration,
    /// Per-stage timeout: turbo pump start and spin-up
    #[serde(with = "humantime_serde", default = "defaults::turbo_pump_timeout")]
    pub turbo_pump_timeout: Duration,
    /// Per-stage timeout: ion gauge activation
    #[serde(with = "humantime_serde", default = "defaults::ion_gauge_timeout")]
    pub ion_gauge_timeout: Duration,
    /// Per-stage timeout: high-vacuum confirmation
    #[serde(with = "humantime_serde", default = "defaults::high_vacuum_timeout")]
    pub high_vacuum_timeout: Duration,
    /// Per-stage timeout: heater ramp to setpoint
    #[serde(with = "humantime_serde", default = "defaults::heater_timeout")]
    pub heater_timeout: Duration,
    /// Per-step timeout inside the shutdown sequence (pump spin-down etc.)
    #[serde(with = "humantime_serde", default = "defaults::shutdown_timeout")]
    pub shutdown_timeout: Duration,
    /// Timeout for the chamber cool-down gate before venting closes
    #[serde(with = "humantime_serde", default = "defaults::cooldown_timeout")]
    pub cooldown_timeout: Duration,

    /// Consecutive qualifying readings required to accept a pressure
    /// threshold as stably reached
    #[serde(default = "defaults::pressure_confirm_count")]
    pub pressure_confirm_count: u32,

    /// Maximum attempts for a retried device command
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,
    /// Delay between retry attempts
    #[serde(with = "humantime_serde", default = "defaults::retry_delay")]
    pub retry_delay: Duration,

    /// Run mode
    #[serde(default = "defaults::run_mode")]
    pub run_mode: RunMode,

    /// Run the full shutdown sequence on any stage failure before
    /// reporting the run aborted
    #[serde(default = "defaults::shutdown_on_failure")]
    pub shutdown_on_failure: bool,
    /// Tag error logs for the facility alarm relay
    #[serde(default)]
    pub alarm_on_error: bool,
}

mod defaults {
    use super::RunMode;
    use std::time::Duration;

    pub fn turbo_start_pressure() -> f64 {
        5.0
    }
    pub fn ion_gauge_on_pressure() -> f64 {
        1e-3
    }
    pub fn heater_start_pressure() -> f64 {
        5e-5
    }
    pub fn max_experiment_pressure() -> f64 {
        1e-4
    }
    pub fn heater_setpoint() -> f64 {
        120.0
    }
    pub fn temperature_tolerance() -> f64 {
        3.0
    }
    pub fn vent_temperature() -> f64 {
        40.0
    }
    pub fn experiment_duration() -> Duration {
        Duration::from_secs(3600)
    }
    pub fn logging_interval() -> Duration {
        Duration::from_secs(30)
    }
    pub fn init_timeout() -> Duration {
        Duration::from_secs(30)
    }
    pub fn valve_timeout() -> Duration {
        Duration::from_secs(15)
    }
    pub fn dry_pump_timeout() -> Duration {
        Duration::from_secs(60)
    }
    pub fn turbo_pump_timeout() -> Duration {
        Duration::from_secs(900)
    }
    pub fn ion_gauge_timeout() -> Duration {
        Duration::from_secs(1800)
    }
    pub fn high_vacuum_timeout() -> Duration {
        Duration::from_secs(7200)
    }
    pub fn heater_timeout() -> Duration {
        Duration::from_secs(1800)
    }
    pub fn shutdown_timeout() -> Duration {
        Duration::from_secs(600)
    }
    pub fn cooldown_timeout() -> Duration {
        Duration::from_secs(4 * 3600)
    }
    pub fn pressure_confirm_count() -> u32 {
        3
    }
    pub fn max_retries() -> u32 {
        3
    }
    pub fn retry_delay() -> Duration {
        Duration::from_secs(2)
    }
    pub fn run_mode() -> RunMode {
        RunMode::FullyAutomatic
    }
    pub fn shutdown_on_failure() -> bool {
        true
    }
}

impl Default for RunConfiguration {
    fn default() -> Self {
        // serde defaults double as the programmatic defaults
        Self {
            turbo_start_pressure: defaults::turbo_start_pressure(),
            ion_gauge_on_pressure: defaults::ion_gauge_on_pressure(),
            heater_start_pressure: defaults::heater_start_pressure(),
            max_experiment_pressure: defaults::max_experiment_pressure(),
            heater_setpoint: defaults::heater_setpoint(),
            temperature_tolerance: defaults::temperature_tolerance(),
            vent_temperature: defaults::vent_temperature(),
            experiment_duration: defaults::experiment_duration(),
            logging_interval: defaults::logging_interval(),
            init_timeout: defaults::init_timeout(),
            valve_timeout: defaults::valve_timeout(),
            dry_pump_timeout: defaults::dry_pump_timeout(),
            turbo_pump_timeout: defaults::turbo_pump_timeout(),
            ion_gauge_timeout: defaults::ion_gauge_timeout(),
            high_vacuum_timeout: defaults::high_vacuum_timeout(),
            heater_timeout: defaults::heater_timeout(),
            shutdown_timeout: defaults::shutdown_timeout(),
            cooldown_timeout: defaults::cooldown_timeout(),
            pressure_confirm_count: defaults::pressure_confirm_count(),
            max_retries: defaults::max_retries(),
            retry_delay: defaults::retry_delay(),
            run_mode: defaults::run_mode(),
            shutdown_on_failure: defaults::shutdown_on_failure(),
            alarm_on_error: false,
        }
    }
}

impl RunConfiguration {
    /// Semantic validation beyond what deserialization checks.
    pub fn validate(&self) -> AppResult<()> {
        for (name, value) in [
            ("turbo_start_pressure", self.turbo_start_pressure),
            ("ion_gauge_on_pressure", self.ion_gauge_on_pressure),
            ("heater_start_pressure", self.heater_start_pressure),
            ("max_experiment_pressure", self.max_experiment_pressure),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(RigError::Configuration(format!(
                    "{} must be a positive pressure, got {}",
                    name, value
                )));
            }
        }
        // Pump-down crosses these in descending order; any other ordering
        // can never be satisfied.
        if self.turbo_start_pressure <= self.ion_gauge_on_pressure {
            return Err(RigError::Configuration(
                "turbo_start_pressure must be above ion_gauge_on_pressure".into(),
            ));
        }
        if self.ion_gauge_on_pressure <= self.heater_start_pressure {
            return Err(RigError::Configuration(
                "ion_gauge_on_pressure must be above heater_start_pressure".into(),
            ));
        }
        if self.max_experiment_pressure < self.heater_start_pressure {
            return Err(RigError::Configuration(
                "max_experiment_pressure must not be below heater_start_pressure".into(),
            ));
        }
        if self.temperature_tolerance <= 0.0 || !self.temperature_tolerance.is_finite() {
            return Err(RigError::Configuration(
                "temperature_tolerance must be positive".into(),
            ));
        }
        if self.pressure_confirm_count == 0 {
            return Err(RigError::Configuration(
                "pressure_confirm_count must be at least 1".into(),
            ));
        }
        if self.max_retries == 0 {
            return Err(RigError::Configuration(
                "max_retries must be at least 1".into(),
            ));
        }
        if self.experiment_duration.is_zero() {
            return Err(RigError::Configuration(
                "experiment_duration must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Status poller settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollerSettings {
    /// Snapshot refresh cadence
    #[serde(with = "humantime_serde", default = "default_poll_cadence")]
    pub cadence: Duration,
}

fn default_poll_cadence() -> Duration {
    Duration::from_secs(1)
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            cadence: default_poll_cadence(),
        }
    }
}

/// Top-level application settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Run configuration consumed by the sequencer
    #[serde(default)]
    pub run: RunConfiguration,
    /// Status poller configuration
    #[serde(default)]
    pub poller: PollerSettings,
}

impl Settings {
    /// Load settings from an optional TOML file with `VACRIG_` environment
    /// overrides layered on top, then validate.
    pub fn new(path: Option<&Path>) -> AppResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let settings: Settings = builder
            .add_source(Environment::with_prefix("VACRIG").separator("__"))
            .build()?
            .try_deserialize()?;
        settings.run.validate()?;
        Ok(settings)
    }
}
