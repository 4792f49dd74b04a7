use crate::prelude::*;
use crate::command::CommandReport;
use crate::device::telemetry::{ChargerPriority, InverterState, OperatingMode, OutputPriority, Telemetry};
use crate::device::transport::{SerialConnector, Wire};
use crate::voltronic::packet::{self, ResponseDecoder, Status};

use std::time::Duration;

pub const BAUD_RATE: u32 = 2400;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
// a late answer to the previous query has to stop arriving before a new
// query goes out
const QUIET_TIME: Duration = Duration::from_millis(50);
const CYCLE_PAUSE: Duration = Duration::from_millis(500);

// nothing is written outside receive cycles; the send loop just idles
const IDLE: Duration = Duration::from_secs(10);

// {{{ Readings
/// The three query results that make up one cycle. Only when all three are
/// present does it become telemetry.
#[derive(Default)]
struct Readings {
    status: Option<Status>,
    mode: Option<OperatingMode>,
    priorities: Option<(OutputPriority, ChargerPriority)>,
}

impl Readings {
    fn to_state(&self) -> Option<InverterState> {
        let status = self.status.as_ref()?;
        let mode = self.mode?;
        let (output_priority, charger_priority) = self.priorities?;

        Some(InverterState {
            grid_voltage: status.grid_voltage,
            grid_frequency: status.grid_frequency,
            output_voltage: status.output_voltage,
            output_frequency: status.output_frequency,
            load_va: status.load_va,
            load_power: status.load_power,
            load_percentage: status.load_percentage,
            battery_voltage: status.battery_voltage,
            battery_charge_current: status.battery_charge_current,
            pv_charge_current: status.pv_charge_current,
            pv_input_voltage: status.pv_input_voltage,
            pv_input_power: status.pv_input_power,
            grid_state: status.grid_state(),
            operating_mode: mode,
            output_priority,
            charger_priority,
        })
    }
} // }}}

/// Kodak OGX-548 hybrid inverter, a Voltronic PI30-family unit, over RS232.
pub struct Inverter {
    /// Output priority last asked for, either by a command or as reported
    /// by the inverter.
    output_priority: Option<OutputPriority>,
    /// Output priority to go back to when grid charging is turned off.
    before_charging: Option<OutputPriority>,
}

impl Inverter {
    pub const MODEL: &'static str = "KodakOGX548Inverter";

    pub fn new() -> Self {
        Self {
            output_priority: None,
            before_charging: None,
        }
    }

    pub fn connector(setup: &config::DeviceSetup) -> Result<SerialConnector, DeviceInitialisationError> {
        Ok(SerialConnector::new(setup.string("serial_port")?, BAUD_RATE))
    }

    pub fn schema() -> Schema {
        InverterState::schema()
    }

    pub fn reset(&mut self) {}

    pub async fn send(&mut self, _wire: &mut Wire) -> Result<Duration> {
        Ok(IDLE)
    }

    pub fn receive_pause(&self) -> Duration {
        CYCLE_PAUSE
    }

    /// Sends one query and waits for its response. `Ok(None)` on timeout or
    /// an empty response.
    async fn query(&self, wire: &mut Wire, mnemonic: &str) -> Result<Option<Vec<u8>>> {
        let stale = wire.drain(QUIET_TIME, RESPONSE_TIMEOUT).await?;
        if stale > 0 {
            debug!("dropped {} stale bytes before {}", stale, mnemonic);
        }
        wire.write(&packet::encode_request(mnemonic)).await?;

        match wire.read_frame(&mut ResponseDecoder, RESPONSE_TIMEOUT).await? {
            Some(response) if response.len() > 1 => Ok(Some(response.to_vec())),
            _ => {
                warn!("no response to {}", mnemonic);
                Ok(None)
            }
        }
    }

    /// One status/mode/settings cycle. Any missing or undecodable response
    /// abandons the cycle.
    pub async fn receive(&mut self, wire: &mut Wire) -> Result<Option<Telemetry>> {
        let mut readings = Readings::default();

        let Some(response) = self.query(wire, packet::QPIGS).await? else {
            return Ok(None);
        };
        readings.status = match Status::decode(&response) {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("discarding {} response: {}", packet::QPIGS, e);
                return Ok(None);
            }
        };

        let Some(response) = self.query(wire, packet::QMOD).await? else {
            return Ok(None);
        };
        readings.mode = match packet::decode_mode(&response) {
            Ok(mode) => Some(mode),
            Err(e) => {
                warn!("discarding {} response: {}", packet::QMOD, e);
                return Ok(None);
            }
        };

        let Some(response) = self.query(wire, packet::QPIRI).await? else {
            return Ok(None);
        };
        readings.priorities = match packet::decode_priorities(&response) {
            Ok(priorities) => Some(priorities),
            Err(e) => {
                warn!("discarding {} response: {}", packet::QPIRI, e);
                return Ok(None);
            }
        };

        let state = readings.to_state();
        if let Some(state) = &state {
            self.output_priority = Some(state.output_priority);
        }
        Ok(state.map(Telemetry::Inverter))
    }

    /// Sends `mnemonic` and checks for an exact ACK. Anything else, NAK
    /// included, is a refusal.
    async fn instruct(&self, wire: &mut Wire, mnemonic: &str) -> Result<bool> {
        let accepted = match self.query(wire, mnemonic).await? {
            Some(response) => packet::is_ack(&response),
            None => false,
        };
        if accepted {
            debug!("{} acknowledged", mnemonic);
        } else {
            warn!("{} not acknowledged", mnemonic);
        }
        Ok(accepted)
    }

    async fn set_output_priority(&mut self, wire: &mut Wire, priority: OutputPriority) -> Result<bool> {
        let accepted = self.instruct(wire, &packet::set_output_priority(priority)).await?;
        if accepted {
            self.output_priority = Some(priority);
        }
        Ok(accepted)
    }

    /// Runs `command`. An `Err` is a transport failure; refusals come back as
    /// a failed report.
    pub async fn execute(&mut self, wire: &mut Wire, command: &Command) -> Result<CommandReport> {
        use Command::*;

        match *command {
            SwitchToLine => {
                if !self.set_output_priority(wire, OutputPriority::UtilityFirst).await? {
                    return Ok(CommandReport::failed("inverter refused switch to line"));
                }
                Ok(CommandReport::ok("switch to line accepted"))
            }
            SwitchToBattery => {
                if !self.set_output_priority(wire, OutputPriority::SolarBatteryUtility).await? {
                    return Ok(CommandReport::failed("inverter refused switch to battery"));
                }
                Ok(CommandReport::ok("switch to battery accepted"))
            }
            TurnOnGridCharging(requested) => {
                let mut detail = String::from("grid charging enabled");

                if let Some(requested) = requested {
                    let amps = packet::snap_charge_current(requested);
                    if !self.instruct(wire, &packet::set_max_charge_current(amps)).await? {
                        return Ok(CommandReport::failed(format!(
                            "inverter refused charge current {}A",
                            amps
                        )));
                    }
                    if amps != requested {
                        detail = format!("{} at {}A (requested {}A)", detail, amps, requested);
                    } else {
                        detail = format!("{} at {}A", detail, amps);
                    }
                }

                let previous = self.output_priority;
                if !self.set_output_priority(wire, OutputPriority::UtilityFirst).await? {
                    return Ok(CommandReport::failed("inverter refused switch to line"));
                }
                if self.before_charging.is_none() {
                    self.before_charging = previous;
                }

                if !self
                    .instruct(wire, &packet::set_charger_priority(ChargerPriority::SolarAndUtility))
                    .await?
                {
                    return Ok(CommandReport::failed("inverter refused charger priority"));
                }
                Ok(CommandReport::ok(detail))
            }
            TurnOffGridCharging => {
                let restore = self
                    .before_charging
                    .unwrap_or(OutputPriority::SolarBatteryUtility);
                if !self.set_output_priority(wire, restore).await? {
                    return Ok(CommandReport::failed(format!(
                        "inverter refused return to {}",
                        restore.as_str()
                    )));
                }
                self.before_charging = None;

                if !self
                    .instruct(wire, &packet::set_charger_priority(ChargerPriority::SolarOnly))
                    .await?
                {
                    return Ok(CommandReport::failed("inverter refused charger priority"));
                }
                Ok(CommandReport::ok(format!(
                    "grid charging disabled, output back to {}",
                    restore.as_str()
                )))
            }
        }
    }
}

impl Default for Inverter {
    fn default() -> Self {
        Self::new()
    }
}
