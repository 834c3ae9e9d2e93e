//! Outgoing control command and charger variants
//!
//! One [`ControlCommand`] exists per CAN link. Callers never hold a reference to it;
//! they go through [`SharedCommand::update`], which applies a whole mutation under
//! the lock, and the watchdog takes a [`SharedCommand::snapshot`] on every tick.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{BusError, BusResult};

/// Number of stage-enable bits in the control frame
pub const STAGE_COUNT: usize = 9;

/// Control command transmitted to the charger
///
/// Stage bits occupy frame bits 22..31, one per entry of `extra_stages`. Stage 1
/// (bit 22) is also set by `power_stage1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlCommand {
    pub demand_voltage_v: f64,
    pub demand_current_a: f64,
    pub power_enable: bool,
    pub power_stage1: bool,
    pub clear_faults: bool,
    pub extra_stages: [bool; STAGE_COUNT],
}

impl ControlCommand {
    /// Power-on demand with stage 1 enabled
    pub fn power_on(voltage_v: f64, current_a: f64) -> Self {
        Self {
            demand_voltage_v: voltage_v,
            demand_current_a: current_a,
            power_enable: true,
            power_stage1: true,
            ..Self::default()
        }
    }

    /// Same voltage demand, power disabled and current zero
    pub fn powered_off(&self) -> Self {
        Self {
            demand_voltage_v: self.demand_voltage_v,
            ..Self::default()
        }
    }

    /// Stage bits as written on the wire
    pub fn stage_bits(&self) -> [bool; STAGE_COUNT] {
        let mut stages = self.extra_stages;
        stages[0] |= self.power_stage1;
        stages
    }

    /// Nothing requested: no demand, no enable and no flags
    pub fn is_blank(&self) -> bool {
        self.demand_voltage_v == 0.0
            && self.demand_current_a == 0.0
            && !self.power_enable
            && !self.clear_faults
            && !self.stage_bits().iter().any(|s| *s)
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "V={:.3}V I={:.3}A {}{}",
            self.demand_voltage_v,
            self.demand_current_a,
            if self.power_enable { "ON" } else { "OFF" },
            if self.clear_faults { " CLR" } else { "" }
        )
    }
}

/// Mutex-guarded command shared between callers and the watchdog
#[derive(Debug, Clone, Default)]
pub struct SharedCommand {
    inner: Arc<Mutex<ControlCommand>>,
}

impl SharedCommand {
    pub fn new(command: ControlCommand) -> Self {
        Self {
            inner: Arc::new(Mutex::new(command)),
        }
    }

    /// Apply `f` to the command while holding the lock
    pub fn update<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut ControlCommand) -> R,
    {
        let mut command = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut command)
    }

    /// Replace the whole command
    pub fn set(&self, command: ControlCommand) {
        self.update(|c| *c = command);
    }

    /// Copy of the current command
    pub fn snapshot(&self) -> ControlCommand {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Output range of a charger model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargerVariant {
    /// 12-30 V, up to 41.7 A
    V24,
    /// 24-60 V, up to 20.8 A
    V48,
}

impl Default for ChargerVariant {
    fn default() -> Self {
        ChargerVariant::V24
    }
}

impl ChargerVariant {
    /// `(min volts, max volts, max amps)`
    pub fn limits(&self) -> (f64, f64, f64) {
        match self {
            ChargerVariant::V24 => (12.0, 30.0, 41.7),
            ChargerVariant::V48 => (24.0, 60.0, 20.8),
        }
    }

    pub fn nominal_voltage(&self) -> f64 {
        match self {
            ChargerVariant::V24 => 24.0,
            ChargerVariant::V48 => 48.0,
        }
    }

    /// Reject demands outside the model's output range
    pub fn validate(&self, voltage_v: f64, current_a: f64) -> BusResult<()> {
        let (min_v, max_v, max_i) = self.limits();
        if !(min_v..=max_v).contains(&voltage_v) {
            return Err(BusError::invalid_data(format!(
                "Voltage {}V outside {}-{}V for {:?}",
                voltage_v, min_v, max_v, self
            )));
        }
        if !(0.0..=max_i).contains(&current_a) {
            return Err(BusError::invalid_data(format!(
                "Current {}A outside 0-{}A for {:?}",
                current_a, max_i, self
            )));
        }
        Ok(())
    }

    /// Validated power-on or power-off command
    pub fn command(&self, voltage_v: f64, current_a: f64, power_on: bool) -> BusResult<ControlCommand> {
        self.validate(voltage_v, current_a)?;
        let command = ControlCommand::power_on(voltage_v, current_a);
        Ok(if power_on { command } else { command.powered_off() })
    }

    /// Power-off command at the nominal voltage
    pub fn turn_off(&self) -> ControlCommand {
        ControlCommand {
            demand_voltage_v: self.nominal_voltage(),
            ..ControlCommand::default()
        }
    }
}
