use crate::prelude::*;
use crate::device::telemetry::{BatteryState, Telemetry};
use crate::device::transport::{SerialConnector, Wire};
use crate::dyness::packet::{self, FrameDecoder};

use std::time::Duration;

pub const BAUD_RATE: u32 = 9600;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const SETTLE_DELAY: Duration = Duration::from_millis(500);

// bounds how long receive() holds the wire when nothing is arriving
const READ_SLICE: Duration = Duration::from_millis(100);

/// Dyness A48100 BMS over its RS232 console port.
pub struct Battery {
    request: Vec<u8>,
    decoder: FrameDecoder,
}

impl Battery {
    pub const MODEL: &'static str = "DynessA48100Com";

    pub fn new() -> Self {
        Self {
            request: packet::request(),
            decoder: FrameDecoder::new(),
        }
    }

    pub fn connector(setup: &config::DeviceSetup) -> Result<SerialConnector, DeviceInitialisationError> {
        Ok(SerialConnector::new(setup.string("serial_port")?, BAUD_RATE))
    }

    pub fn schema() -> Schema {
        BatteryState::schema(packet::CELL_COUNT, packet::TEMPERATURE_COUNT)
    }

    pub fn reset(&mut self) {
        self.decoder.reset();
    }

    /// Writes one status request and returns how long to wait before the next.
    pub async fn send(&mut self, wire: &mut Wire) -> Result<Duration> {
        wire.write(&self.request).await?;
        Ok(POLL_INTERVAL + SETTLE_DELAY)
    }

    /// Returns at most one decoded frame. `Ok(None)` when no complete frame
    /// turned up within a read slice or the frame did not decode.
    pub async fn receive(&mut self, wire: &mut Wire) -> Result<Option<Telemetry>> {
        let Some(frame) = wire.read_frame(&mut self.decoder, READ_SLICE).await? else {
            return Ok(None);
        };

        match packet::decode(&frame) {
            Ok(state) => Ok(Some(Telemetry::Battery(state))),
            Err(e) => {
                warn!("discarding battery frame: {}", e);
                self.decoder.reset();
                Ok(None)
            }
        }
    }
}

impl Default for Battery {
    fn default() -> Self {
        Self::new()
    }
}
