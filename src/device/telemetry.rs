use crate::prelude::*;
use crate::snapshot::TIME_UPDATED;

use num_enum::{IntoPrimitive, TryFromPrimitive};

// {{{ BatteryState
#[derive(Clone, Debug, PartialEq)]
pub struct BatteryState {
    pub voltage: f64,
    pub current: f64,
    pub state_of_charge: f64,
    pub state_of_health: f64,
    pub cell_voltages: Vec<f64>,
    pub temperatures: Vec<f64>,
}

impl BatteryState {
    pub fn schema(cells: usize, probes: usize) -> Schema {
        let mut fields = vec![
            Field::float(TIME_UPDATED),
            Field::float("voltage"),
            Field::float("current"),
            Field::float("state_of_charge"),
            Field::float("state_of_health"),
        ];
        fields.extend((1..=cells).map(|i| Field::float(format!("voltage_cell_{}", i))));
        fields.extend((1..=probes).map(|i| Field::float(format!("temperature_{}", i))));
        fields.into()
    }

    pub fn values(&self, time_updated: f64) -> Vec<Value> {
        let mut values = vec![
            Value::Float(time_updated),
            Value::Float(self.voltage),
            Value::Float(self.current),
            Value::Float(self.state_of_charge),
            Value::Float(self.state_of_health),
        ];
        values.extend(self.cell_voltages.iter().copied().map(Value::Float));
        values.extend(self.temperatures.iter().copied().map(Value::Float));
        values
    }
} // }}}

// {{{ InverterState
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GridState {
    On,
    Off,
}

impl GridState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GridState::On => "on",
            GridState::Off => "off",
        }
    }
}

/// Operating mode as reported by the inverter. Discriminants are the ASCII
/// mode letters.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OperatingMode {
    PowerOn = 0x50,      // P
    Standby = 0x53,      // S
    Line = 0x4C,         // L
    Battery = 0x42,      // B
    Fault = 0x46,        // F
    PowerSaving = 0x48,  // H
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputMode {
    Line,
    Battery,
    Unknown,
}

impl OutputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputMode::Line => "line",
            OutputMode::Battery => "battery",
            OutputMode::Unknown => "unknown",
        }
    }
}

impl From<OperatingMode> for OutputMode {
    fn from(mode: OperatingMode) -> Self {
        match mode {
            OperatingMode::Line => OutputMode::Line,
            OperatingMode::Battery => OutputMode::Battery,
            _ => OutputMode::Unknown,
        }
    }
}

/// Output source priority. Discriminants are the digit codes used in
/// settings responses and `POPnn` commands.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OutputPriority {
    UtilityFirst = 0,
    SolarFirst = 1,
    SolarBatteryUtility = 2,
}

impl OutputPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputPriority::UtilityFirst => "line",
            OutputPriority::SolarFirst => "solar",
            OutputPriority::SolarBatteryUtility => "battery",
        }
    }
}

/// Charger source priority. Discriminants are the digit codes used in
/// settings responses and `PCPnn` commands.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ChargerPriority {
    UtilityFirst = 0,
    SolarFirst = 1,
    SolarAndUtility = 2,
    SolarOnly = 3,
}

impl ChargerPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargerPriority::UtilityFirst => "utility",
            ChargerPriority::SolarFirst => "solar_first",
            ChargerPriority::SolarAndUtility => "solar_and_utility",
            ChargerPriority::SolarOnly => "solar",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InverterState {
    pub grid_voltage: f64,
    pub grid_frequency: f64,
    pub output_voltage: f64,
    pub output_frequency: f64,
    pub load_va: f64,
    pub load_power: f64,
    pub load_percentage: f64,
    pub battery_voltage: f64,
    /// Positive while charging, negative while discharging.
    pub battery_charge_current: f64,
    pub pv_charge_current: f64,
    pub pv_input_voltage: f64,
    pub pv_input_power: f64,
    pub grid_state: GridState,
    pub operating_mode: OperatingMode,
    pub output_priority: OutputPriority,
    pub charger_priority: ChargerPriority,
}

impl InverterState {
    pub fn schema() -> Schema {
        vec![
            Field::float(TIME_UPDATED),
            Field::float("grid_voltage"),
            Field::float("grid_frequency"),
            Field::float("output_voltage"),
            Field::float("output_frequency"),
            Field::float("load_va"),
            Field::float("load_power"),
            Field::float("load_percentage"),
            Field::float("battery_voltage"),
            Field::float("battery_charge_current"),
            Field::float("pv_charge_current"),
            Field::float("pv_input_voltage"),
            Field::float("pv_input_power"),
            Field::text("grid_state"),
            Field::text("output_mode"),
            Field::text("selected_mode"),
            Field::text("selected_charger"),
        ]
        .into()
    }

    pub fn output_mode(&self) -> OutputMode {
        self.operating_mode.into()
    }

    pub fn values(&self, time_updated: f64) -> Vec<Value> {
        vec![
            Value::Float(time_updated),
            Value::Float(self.grid_voltage),
            Value::Float(self.grid_frequency),
            Value::Float(self.output_voltage),
            Value::Float(self.output_frequency),
            Value::Float(self.load_va),
            Value::Float(self.load_power),
            Value::Float(self.load_percentage),
            Value::Float(self.battery_voltage),
            Value::Float(self.battery_charge_current),
            Value::Float(self.pv_charge_current),
            Value::Float(self.pv_input_voltage),
            Value::Float(self.pv_input_power),
            Value::Text(self.grid_state.as_str().to_string()),
            Value::Text(self.output_mode().as_str().to_string()),
            Value::Text(self.output_priority.as_str().to_string()),
            Value::Text(self.charger_priority.as_str().to_string()),
        ]
    }
} // }}}

#[derive(Clone, Debug, PartialEq)]
pub enum Telemetry {
    Battery(BatteryState),
    Inverter(InverterState),
}

impl Telemetry {
    pub fn values(&self, time_updated: f64) -> Vec<Value> {
        match self {
            Telemetry::Battery(state) => state.values(time_updated),
            Telemetry::Inverter(state) => state.values(time_updated),
        }
    }
}
