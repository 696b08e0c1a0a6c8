//! Mock Hardware Implementations
//!
//! Provides a simulated rig for testing and for `RunMode::Simulation`
//! without physical hardware. All subsystem mocks share one [`PlantState`]
//! advanced by a background physics task, so command effects show up in the
//! status snapshot the way they would on the real rig: the turbo spins up
//! over seconds, pressure pumps down exponentially, the heater ramps toward
//! its setpoint.
//!
//! # Plant Model
//!
//! First-order responses throughout:
//!
//! - chamber pressure approaches a floor set by which pumps run and which
//!   valves are open (atmosphere when vented, ~0.5 Torr on the dry pump
//!   alone, high vacuum with the turbo at speed)
//! - turbo rotor speed ramps toward nominal over a few seconds
//! - heater and chamber temperatures relax toward setpoint/ambient, faster
//!   with the chiller running
//!
//! Fault switches allow tests to make a subsystem refuse commands or report
//! its link down.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::core::{
    Chiller, DryPump, Heater, IonGauge, RigFacade, RigSnapshot, TurboPump, ValveBank, ValveId,
};
use crate::hardware::poller::SnapshotSource;

const AMBIENT_C: f64 = 22.0;
const ATMOSPHERE_TORR: f64 = 760.0;

/// First-order step toward a target; `alpha` is dt/tau, clamped to 1.
fn approach(current: f64, target: f64, alpha: f64) -> f64 {
    current + (target - current) * alpha.min(1.0)
}

/// Mutable state of the simulated plant.
///
/// Fields are public so tests can prepare mid-run situations directly via
/// [`SimulatedRig::with_plant`].
#[derive(Clone, Debug)]
pub struct PlantState {
    /// Chamber pressure in Torr
    pub chamber_pressure: f64,
    /// Foreline pressure in Torr
    pub foreline_pressure: f64,
    /// Heater channel temperature in °C
    pub heater_temp: f64,
    /// Chamber wall temperature in °C
    pub chamber_temp: f64,
    /// Heater setpoint in °C
    pub heater_setpoint: f64,
    /// Heater output enabled
    pub heater_enabled: bool,
    /// Dry pump commanded on
    pub dry_pump_on: bool,
    /// Turbo pump commanded on
    pub turbo_on: bool,
    /// Turbo rotor speed, 0..=1 of nominal
    pub turbo_speed: f64,
    /// Ion gauge HV energized
    pub gauge_hv: bool,
    /// Gate valve open
    pub gate_open: bool,
    /// Vent valve open
    pub vent_open: bool,
    /// Exhaust valve open
    pub exhaust_open: bool,
    /// Chiller running
    pub chiller_on: bool,
}

impl PlantState {
    /// Cold rig at atmosphere: everything off, all valves closed.
    pub fn at_atmosphere() -> Self {
        Self {
            chamber_pressure: ATMOSPHERE_TORR,
            foreline_pressure: ATMOSPHERE_TORR,
            heater_temp: AMBIENT_C,
            chamber_temp: AMBIENT_C,
            heater_setpoint: 0.0,
            heater_enabled: false,
            dry_pump_on: false,
            turbo_on: false,
            turbo_speed: 0.0,
            gauge_hv: false,
            gate_open: false,
            vent_open: false,
            exhaust_open: false,
            chiller_on: false,
        }
    }

    /// Turbo at nominal rotation speed.
    pub fn turbo_at_speed(&self) -> bool {
        self.turbo_on && self.turbo_speed > 0.9
    }

    /// Turbo still rotating (commanded on or spinning down).
    pub fn turbo_rotating(&self) -> bool {
        self.turbo_on || self.turbo_speed > 0.05
    }

    /// Advance the plant by `dt` seconds.
    fn step(&mut self, dt: f64) {
        // Turbo rotor
        let turbo_target = if self.turbo_on { 1.0 } else { 0.0 };
        self.turbo_speed = approach(self.turbo_speed, turbo_target, dt / 2.0);

        // Chamber pressure floor depends on pumping path and venting
        let (floor, tau) = if self.vent_open || self.exhaust_open {
            (ATMOSPHERE_TORR, 3.0)
        } else if self.dry_pump_on && self.gate_open && self.turbo_at_speed() {
            (5e-7, 2.0)
        } else if self.dry_pump_on && self.gate_open && self.turbo_speed > 0.1 {
            (1e-3, 4.0)
        } else if self.dry_pump_on && self.gate_open {
            (5e-1, 2.0)
        } else {
            // Sealed chamber with no pumping: slow leak-up
            (ATMOSPHERE_TORR, 600.0)
        };
        self.chamber_pressure = approach(self.chamber_pressure, floor, dt / tau);

        let foreline_floor = if self.dry_pump_on { 2e-2 } else { ATMOSPHERE_TORR };
        let foreline_tau = if self.dry_pump_on { 2.0 } else { 600.0 };
        self.foreline_pressure = approach(self.foreline_pressure, foreline_floor, dt / foreline_tau);

        // Thermal response
        let heater_target = if self.heater_enabled {
            self.heater_setpoint
        } else {
            AMBIENT_C
        };
        let heater_tau = if self.heater_enabled {
            3.0
        } else if self.chiller_on {
            2.0
        } else {
            5.0
        };
        self.heater_temp = approach(self.heater_temp, heater_target, dt / heater_tau);
        self.chamber_temp = approach(self.chamber_temp, self.heater_temp, dt / 6.0);
    }
}

/// Per-subsystem fault injection for tests.
#[derive(Debug, Default)]
pub struct FaultSwitches {
    dry_pump: AtomicBool,
    turbo: AtomicBool,
    ion_gauge: AtomicBool,
    valves: AtomicBool,
    heater: AtomicBool,
    chiller: AtomicBool,
    disconnected: AtomicBool,
}

impl FaultSwitches {
    /// Make every dry pump command fail.
    pub fn fail_dry_pump(&self) {
        self.dry_pump.store(true, Ordering::SeqCst);
    }

    /// Make every turbo pump command fail.
    pub fn fail_turbo(&self) {
        self.turbo.store(true, Ordering::SeqCst);
    }

    /// Make every ion gauge command fail.
    pub fn fail_ion_gauge(&self) {
        self.ion_gauge.store(true, Ordering::SeqCst);
    }

    /// Make every valve command fail.
    pub fn fail_valves(&self) {
        self.valves.store(true, Ordering::SeqCst);
    }

    /// Make every heater command fail.
    pub fn fail_heater(&self) {
        self.heater.store(true, Ordering::SeqCst);
    }

    /// Make every chiller command fail.
    pub fn fail_chiller(&self) {
        self.chiller.store(true, Ordering::SeqCst);
    }

    /// Report every subsystem link as down.
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    /// Restore all links and clear all faults.
    pub fn clear(&self) {
        for flag in [
            &self.dry_pump,
            &self.turbo,
            &self.ion_gauge,
            &self.valves,
            &self.heater,
            &self.chiller,
            &self.disconnected,
        ] {
            flag.store(false, Ordering::SeqCst);
        }
    }

    fn connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }
}

type SharedPlant = Arc<Mutex<PlantState>>;

fn lock_plant(plant: &SharedPlant) -> MutexGuard<'_, PlantState> {
    match plant.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A complete simulated rig: shared plant, physics task, fault switches.
pub struct SimulatedRig {
    plant: SharedPlant,
    faults: Arc<FaultSwitches>,
}

impl SimulatedRig {
    /// Start a simulated rig at atmosphere, advancing the plant every
    /// `tick`. The physics task ends when the rig is dropped.
    pub fn spawn(tick: std::time::Duration) -> Self {
        let plant = Arc::new(Mutex::new(PlantState::at_atmosphere()));
        let weak = Arc::downgrade(&plant);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                let Some(plant) = weak.upgrade() else { break };
                lock_plant(&plant).step(tick.as_secs_f64());
            }
            debug!("Simulated plant task ended");
        });
        Self {
            plant,
            faults: Arc::new(FaultSwitches::default()),
        }
    }

    /// Facade of capability handles over this rig.
    pub fn facade(&self) -> RigFacade {
        RigFacade {
            dry_pump: Arc::new(MockDryPump {
                plant: self.plant.clone(),
                faults: self.faults.clone(),
            }),
            turbo_pump: Arc::new(MockTurboPump {
                plant: self.plant.clone(),
                faults: self.faults.clone(),
            }),
            ion_gauge: Arc::new(MockIonGauge {
                plant: self.plant.clone(),
                faults: self.faults.clone(),
            }),
            valves: Arc::new(MockValveBank {
                plant: self.plant.clone(),
                faults: self.faults.clone(),
            }),
            heater: Arc::new(MockHeater {
                plant: self.plant.clone(),
                faults: self.faults.clone(),
            }),
            chiller: Arc::new(MockChiller {
                plant: self.plant.clone(),
                faults: self.faults.clone(),
            }),
        }
    }

    /// Snapshot source for the status poller.
    pub fn snapshot_source(&self) -> Arc<dyn SnapshotSource> {
        Arc::new(PlantSampler {
            plant: self.plant.clone(),
        })
    }

    /// Fault injection switches.
    pub fn faults(&self) -> Arc<FaultSwitches> {
        self.faults.clone()
    }

    /// Inspect or mutate the plant directly (test setup).
    pub fn with_plant<R>(&self, f: impl FnOnce(&mut PlantState) -> R) -> R {
        f(&mut lock_plant(&self.plant))
    }
}

/// Samples the plant into an immutable snapshot with small gauge noise.
struct PlantSampler {
    plant: SharedPlant,
}

impl SnapshotSource for PlantSampler {
    fn sample(&self) -> RigSnapshot {
        let p = lock_plant(&self.plant).clone();
        // ±0.5% multiplicative gauge noise; harmless across the decades the
        // thresholds span, but keeps readings from being suspiciously exact
        let jitter = 1.0 + (rand::random::<f64>() - 0.5) * 0.01;
        RigSnapshot {
            chamber_pressure_torr: p.chamber_pressure * jitter,
            foreline_pressure_torr: p.foreline_pressure * jitter,
            heater_temperature_c: p.heater_temp,
            chamber_temperature_c: p.chamber_temp,
            gate_open: p.gate_open,
            vent_open: p.vent_open,
            exhaust_open: p.exhaust_open,
            ion_gauge_hv_on: p.gauge_hv,
            dry_pump_running: p.dry_pump_on,
            turbo_running: p.turbo_rotating(),
            turbo_at_speed: p.turbo_at_speed(),
            heater_enabled: p.heater_enabled,
            chiller_running: p.chiller_on,
            taken_at: Utc::now(),
        }
    }
}

struct MockDryPump {
    plant: SharedPlant,
    faults: Arc<FaultSwitches>,
}

#[async_trait]
impl DryPump for MockDryPump {
    fn is_connected(&self) -> bool {
        self.faults.connected()
    }

    async fn start(&self) -> Result<()> {
        if self.faults.dry_pump.load(Ordering::SeqCst) {
            bail!("dry pump controller returned NAK");
        }
        lock_plant(&self.plant).dry_pump_on = true;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.faults.dry_pump.load(Ordering::SeqCst) {
            bail!("dry pump controller returned NAK");
        }
        lock_plant(&self.plant).dry_pump_on = false;
        Ok(())
    }
}

struct MockTurboPump {
    plant: SharedPlant,
    faults: Arc<FaultSwitches>,
}

#[async_trait]
impl TurboPump for MockTurboPump {
    fn is_connected(&self) -> bool {
        self.faults.connected()
    }

    async fn start(&self) -> Result<()> {
        if self.faults.turbo.load(Ordering::SeqCst) {
            bail!("turbo controller refused start");
        }
        lock_plant(&self.plant).turbo_on = true;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.faults.turbo.load(Ordering::SeqCst) {
            bail!("turbo controller refused stop");
        }
        lock_plant(&self.plant).turbo_on = false;
        Ok(())
    }
}

struct MockIonGauge {
    plant: SharedPlant,
    faults: Arc<FaultSwitches>,
}

#[async_trait]
impl IonGauge for MockIonGauge {
    fn is_connected(&self) -> bool {
        self.faults.connected()
    }

    async fn hv_on(&self) -> Result<()> {
        if self.faults.ion_gauge.load(Ordering::SeqCst) {
            bail!("gauge controller rejected HV on");
        }
        lock_plant(&self.plant).gauge_hv = true;
        Ok(())
    }

    async fn hv_off(&self) -> Result<()> {
        if self.faults.ion_gauge.load(Ordering::SeqCst) {
            bail!("gauge controller rejected HV off");
        }
        lock_plant(&self.plant).gauge_hv = false;
        Ok(())
    }
}

struct MockValveBank {
    plant: SharedPlant,
    faults: Arc<FaultSwitches>,
}

impl MockValveBank {
    fn set(&self, valve: ValveId, open: bool) -> Result<()> {
        if self.faults.valves.load(Ordering::SeqCst) {
            bail!("valve {} did not acknowledge", valve);
        }
        let mut p = lock_plant(&self.plant);
        match valve {
            ValveId::Gate => p.gate_open = open,
            ValveId::Vent => p.vent_open = open,
            ValveId::Exhaust => p.exhaust_open = open,
        }
        Ok(())
    }
}

#[async_trait]
impl ValveBank for MockValveBank {
    fn is_connected(&self) -> bool {
        self.faults.connected()
    }

    async fn open(&self, valve: ValveId) -> Result<()> {
        self.set(valve, true)
    }

    async fn close(&self, valve: ValveId) -> Result<()> {
        self.set(valve, false)
    }
}

struct MockHeater {
    plant: SharedPlant,
    faults: Arc<FaultSwitches>,
}

#[async_trait]
impl Heater for MockHeater {
    fn is_connected(&self) -> bool {
        self.faults.connected()
    }

    async fn set_temperature(&self, celsius: f64) -> Result<()> {
        if self.faults.heater.load(Ordering::SeqCst) {
            bail!("heater controller rejected setpoint");
        }
        lock_plant(&self.plant).heater_setpoint = celsius;
        Ok(())
    }

    async fn enable(&self) -> Result<()> {
        if self.faults.heater.load(Ordering::SeqCst) {
            bail!("heater controller rejected enable");
        }
        lock_plant(&self.plant).heater_enabled = true;
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        if self.faults.heater.load(Ordering::SeqCst) {
            bail!("heater controller rejected disable");
        }
        lock_plant(&self.plant).heater_enabled = false;
        Ok(())
    }
}

struct MockChiller {
    plant: SharedPlant,
    faults: Arc<FaultSwitches>,
}

#[async_trait]
impl Chiller for MockChiller {
    fn is_connected(&self) -> bool {
        self.faults.connected()
    }

    async fn start(&self) -> Result<()> {
        if self.faults.chiller.load(Ordering::SeqCst) {
            bail!("chiller did not acknowledge start");
        }
        lock_plant(&self.plant).chiller_on = true;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.faults.chiller.load(Ordering::SeqCst) {
            bail!("chiller did not acknowledge stop");
        }
        lock_plant(&self.plant).chiller_on = false;
        Ok(())
    }
}
