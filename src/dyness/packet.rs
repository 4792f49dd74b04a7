use crate::prelude::*;
use crate::device::telemetry::BatteryState;

use bytes::{Buf, BufMut, BytesMut};
use nom_derive::{Nom, Parse};
use tokio_util::codec::Decoder;

pub const CELL_COUNT: usize = 15;
pub const TEMPERATURE_COUNT: usize = 4;

pub const START_MARKER: [u8; 3] = [0xFA, 0x80, 0x00];
pub const FRAME_LEN: usize = 88;

const REQUEST_BODY: [u8; 7] = [0xFA, 0x10, 0x00, 0x00, 0x00, 0x01, 0x01];
const REQUEST_TRAILER: u8 = 0xED;

const TEMPERATURE_BIAS: i32 = 400;
const CURRENT_BIAS: i32 = 4000;

/// Status request: body, CRC16/XMODEM big-endian, trailer byte, `\r`.
pub fn request() -> Vec<u8> {
    let crc = crc16::State::<crc16::XMODEM>::calculate(&REQUEST_BODY);

    let mut r = Vec::with_capacity(REQUEST_BODY.len() + 4);
    r.extend_from_slice(&REQUEST_BODY);
    r.extend_from_slice(&crc.to_be_bytes());
    r.push(REQUEST_TRAILER);
    r.push(b'\r');
    r
}

// {{{ FrameDecoder
/// Finds frames in an unframed byte stream. A three byte window slides over
/// the input looking for the start marker; once seen, bytes accumulate until
/// the frame is `FRAME_LEN` long. Seeing the marker again part way through
/// restarts the frame.
#[derive(Debug)]
pub struct FrameDecoder {
    window: [u8; 3],
    frame: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            window: [0; 3],
            frame: BytesMut::with_capacity(FRAME_LEN),
        }
    }

    /// Forget any partial frame and start synchronising from scratch.
    pub fn reset(&mut self) {
        self.window = [0; 3];
        self.frame.clear();
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameDecoder {
    type Item = BytesMut;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while src.has_remaining() {
            let byte = src.get_u8();

            self.window.rotate_left(1);
            self.window[2] = byte;

            if !self.frame.is_empty() {
                self.frame.put_u8(byte);
            }

            if self.window == START_MARKER {
                self.frame.clear();
                self.frame.extend_from_slice(&START_MARKER);
            }

            if self.frame.len() == FRAME_LEN {
                return Ok(Some(self.frame.split()));
            }
        }

        Ok(None)
    }
} // }}}

// {{{ RawFrame
#[derive(Debug, PartialEq, Nom)]
#[nom(BigEndian)]
struct RawFrame {
    #[nom(Verify = "*marker == 0xFA80")]
    marker: u16,
    #[nom(Verify = "*marker_tail == 0x00")]
    marker_tail: u8,

    #[nom(SkipBefore(3), Count = "CELL_COUNT")]
    cells: Vec<u16>,

    // FIXME: only one probe is read; the other three are at offsets not yet
    // identified, so every temperature repeats this one.
    #[nom(SkipBefore(2))]
    temperature: u16,

    #[nom(SkipBefore(6))]
    voltage: u16,
    current: u16,
    soc: u8,
    soh: u8,
} // }}}

/// Decodes one complete frame as produced by `FrameDecoder`.
pub fn decode(frame: &[u8]) -> Result<BatteryState, DecodeError> {
    if frame.len() != FRAME_LEN {
        return Err(DecodeError::Length {
            expected: FRAME_LEN,
            actual: frame.len(),
        });
    }
    if frame[..START_MARKER.len()] != START_MARKER {
        return Err(DecodeError::StartMarker);
    }

    let (_, raw) = RawFrame::parse(frame).map_err(|e| DecodeError::Truncated(e.to_string()))?;

    let temperature = (raw.temperature as i32 - TEMPERATURE_BIAS) as f64 / 10.0;

    Ok(BatteryState {
        voltage: raw.voltage as f64 / 100.0,
        current: (raw.current as i32 - CURRENT_BIAS) as f64 / 10.0,
        state_of_charge: raw.soc as f64 / 100.0,
        state_of_health: raw.soh as f64 / 100.0,
        cell_voltages: raw.cells.iter().map(|&mv| mv as f64 / 1000.0).collect(),
        temperatures: vec![temperature; TEMPERATURE_COUNT],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Vec<u8> {
        let mut f = vec![0u8; FRAME_LEN];
        f[..3].copy_from_slice(&START_MARKER);
        for i in 0..CELL_COUNT {
            let mv = 3300u16 + i as u16;
            f[6 + 2 * i..8 + 2 * i].copy_from_slice(&mv.to_be_bytes());
        }
        f[38..40].copy_from_slice(&650u16.to_be_bytes()); // 25.0C
        f[46..48].copy_from_slice(&5210u16.to_be_bytes()); // 52.10V
        f[48..50].copy_from_slice(&3875u16.to_be_bytes()); // -12.5A
        f[50] = 87;
        f[51] = 99;
        f
    }

    #[test]
    fn request_bytes() {
        assert_eq!(
            request(),
            vec![0xFA, 0x10, 0x00, 0x00, 0x00, 0x01, 0x01, 0xE5, 0x42, 0xED, 0x0D]
        );
    }

    #[test]
    fn decodes_known_values() {
        let state = decode(&frame()).unwrap();

        assert_eq!(state.voltage, 52.1);
        assert_eq!(state.current, -12.5);
        assert_eq!(state.state_of_charge, 0.87);
        assert_eq!(state.state_of_health, 0.99);
        assert_eq!(state.cell_voltages.len(), CELL_COUNT);
        assert_eq!(state.cell_voltages[0], 3.3);
        assert_eq!(state.cell_voltages[14], 3.314);
        assert_eq!(state.temperatures, vec![25.0; TEMPERATURE_COUNT]);
    }

    #[test]
    fn rejects_short_frame() {
        let f = frame();
        assert_eq!(
            decode(&f[..87]),
            Err(DecodeError::Length { expected: 88, actual: 87 })
        );
    }

    #[test]
    fn rejects_missing_marker() {
        let mut f = frame();
        f[1] = 0x81;
        assert_eq!(decode(&f), Err(DecodeError::StartMarker));
    }

    #[test]
    fn decoder_syncs_past_garbage() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x01, 0xFA, 0x80, 0x13, 0x37]);
        buf.extend_from_slice(&frame());
        buf.extend_from_slice(&[0xFA]);

        let out = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&out[..], &frame()[..]);
        assert_eq!(&buf[..], &[0xFA]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decoder_waits_for_the_rest() {
        let mut decoder = FrameDecoder::new();
        let f = frame();
        let mut buf = BytesMut::from(&f[..50]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&f[50..]);
        assert_eq!(&decoder.decode(&mut buf).unwrap().unwrap()[..], &f[..]);
    }

    #[test]
    fn marker_mid_frame_restarts() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&START_MARKER);
        buf.extend_from_slice(&[0x11; 20]);
        buf.extend_from_slice(&frame());

        assert_eq!(&decoder.decode(&mut buf).unwrap().unwrap()[..], &frame()[..]);
    }
}
