use crate::prelude::*;
use crate::device::telemetry::{ChargerPriority, GridState, OperatingMode, OutputPriority};

use bytes::BytesMut;
use tokio_util::codec::Decoder;

pub const TERMINATOR: u8 = b'\r';

pub const ACK: &[u8] = b"(ACK\x39\x20\r";
pub const NAK: &[u8] = b"(NAK\x73\x73\r";

pub const QPIGS: &str = "QPIGS";
pub const QMOD: &str = "QMOD";
pub const QPIRI: &str = "QPIRI";

/// Charge currents, in amps, the inverter accepts for `MUCHGC`.
pub const CHARGE_CURRENTS: [u16; 6] = [2, 10, 20, 30, 40, 50];

// grid voltages below this mean the grid is down
const GRID_PRESENT_VOLTS: f64 = 90.0;

/// Mnemonic, CRC16/XMODEM big-endian, `\r`.
pub fn encode_request(mnemonic: &str) -> Vec<u8> {
    let body = mnemonic.as_bytes();
    let crc = crc16::State::<crc16::XMODEM>::calculate(body);

    let mut r = Vec::with_capacity(body.len() + 3);
    r.extend_from_slice(body);
    r.extend_from_slice(&crc.to_be_bytes());
    r.push(TERMINATOR);
    r
}

pub fn set_output_priority(priority: OutputPriority) -> String {
    format!("POP{:02}", u8::from(priority))
}

pub fn set_charger_priority(priority: ChargerPriority) -> String {
    format!("PCP{:02}", u8::from(priority))
}

pub fn set_max_charge_current(amps: u16) -> String {
    format!("MUCHGC{:03}", amps)
}

pub fn is_ack(response: &[u8]) -> bool {
    response == ACK
}

/// Closest accepted charge current to `requested`. Ties go to the lower value.
pub fn snap_charge_current(requested: u16) -> u16 {
    CHARGE_CURRENTS
        .iter()
        .copied()
        .min_by_key(|&amps| (amps as i32 - requested as i32).abs())
        .unwrap_or(CHARGE_CURRENTS[0])
}

// {{{ ResponseDecoder
/// Splits the stream at each `\r`; the terminator stays on the item.
#[derive(Debug, Default)]
pub struct ResponseDecoder;

impl Decoder for ResponseDecoder {
    type Item = BytesMut;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.iter().position(|&b| b == TERMINATOR) {
            Some(pos) => Ok(Some(src.split_to(pos + 1))),
            None => Ok(None),
        }
    }
} // }}}

/// Strips the leading `(` and trailing CRC plus terminator, then splits the
/// remainder on spaces.
pub fn fields(response: &[u8]) -> Result<Vec<&str>, DecodeError> {
    if response.len() < 4 {
        return Err(DecodeError::ShortResponse(response.len()));
    }

    let body = &response[1..response.len() - 3];
    let body = std::str::from_utf8(body)
        .ok()
        .filter(|s| s.is_ascii())
        .ok_or(DecodeError::NotAscii)?;

    Ok(body.split(' ').collect())
}

fn field<'a>(fields: &[&'a str], query: &'static str, index: usize) -> Result<&'a str, DecodeError> {
    fields
        .get(index)
        .copied()
        .ok_or(DecodeError::MissingField { query, index })
}

fn number(fields: &[&str], query: &'static str, index: usize) -> Result<f64, DecodeError> {
    let raw = field(fields, query, index)?;
    raw.parse().map_err(|_| DecodeError::BadNumber {
        query,
        index,
        raw: raw.to_string(),
    })
}

fn digit<T: TryFrom<u8>>(fields: &[&str], query: &'static str, index: usize, what: &'static str) -> Result<T, DecodeError> {
    let raw = field(fields, query, index)?;
    raw.parse::<u8>()
        .ok()
        .and_then(|code| T::try_from(code).ok())
        .ok_or_else(|| DecodeError::UnknownCode {
            what,
            code: raw.to_string(),
        })
}

// {{{ Status
/// Decoded `QPIGS` response.
#[derive(Clone, Debug, PartialEq)]
pub struct Status {
    pub grid_voltage: f64,
    pub grid_frequency: f64,
    pub output_voltage: f64,
    pub output_frequency: f64,
    pub load_va: f64,
    pub load_power: f64,
    pub load_percentage: f64,
    pub battery_voltage: f64,
    pub battery_charge_current: f64,
    pub pv_charge_current: f64,
    pub pv_input_voltage: f64,
    pub pv_input_power: f64,
}

impl Status {
    pub fn decode(response: &[u8]) -> Result<Self, DecodeError> {
        let f = fields(response)?;
        let n = |index| number(&f, QPIGS, index);

        let charge = n(9)?;
        let discharge = n(15)?;

        Ok(Self {
            grid_voltage: n(0)?,
            grid_frequency: n(1)?,
            output_voltage: n(2)?,
            output_frequency: n(3)?,
            load_va: n(4)?,
            load_power: n(5)?,
            load_percentage: n(6)? / 100.0,
            battery_voltage: n(8)?,
            battery_charge_current: if charge > 0.0 { charge } else { -discharge },
            pv_charge_current: n(12)?,
            pv_input_voltage: n(13)?,
            pv_input_power: n(19)?,
        })
    }

    pub fn grid_state(&self) -> GridState {
        if self.grid_voltage >= GRID_PRESENT_VOLTS {
            GridState::On
        } else {
            GridState::Off
        }
    }
} // }}}

/// Decoded `QMOD` response.
pub fn decode_mode(response: &[u8]) -> Result<OperatingMode, DecodeError> {
    let f = fields(response)?;
    let raw = field(&f, QMOD, 0)?;

    match raw.as_bytes() {
        [code] => OperatingMode::try_from(*code).map_err(|_| DecodeError::UnknownCode {
            what: "operating mode",
            code: raw.to_string(),
        }),
        _ => Err(DecodeError::UnknownCode {
            what: "operating mode",
            code: raw.to_string(),
        }),
    }
}

/// Output and charger priority from a `QPIRI` response.
pub fn decode_priorities(response: &[u8]) -> Result<(OutputPriority, ChargerPriority), DecodeError> {
    let f = fields(response)?;
    let output = digit(&f, QPIRI, 16, "output priority")?;
    let charger = digit(&f, QPIRI, 17, "charger priority")?;
    Ok((output, charger))
}
