#![allow(dead_code)]

pub use sunny_jim::prelude::*;
pub use sunny_jim::command::CommandReport;
pub use sunny_jim::device::transport::{ByteStream, Connector};
pub use sunny_jim::device::{Driver, ReconnectPolicy};
pub use sunny_jim::observer::ObserverRef;

pub use std::sync::Arc;
pub use std::time::Duration;

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub const STATUS: &str = "232.0 50.0 230.0 50.0 0460 0391 009 410 52.30 012 087 0032 01.4 0305.6 00.00 00000 00010110 00 00 00427 010";
pub const SETTINGS: &str = "230.0 21.7 230.0 50.0 21.7 5000 5000 48.0 46.0 42.0 56.4 54.0 2 02 060 0 2 3 9 01 0 0 54.0 0 1 000";

pub struct Factory;

impl Factory {
    /// A battery frame reporting `soc` percent and 52.10V.
    pub fn battery_frame(soc: u8) -> Vec<u8> {
        let mut f = vec![0u8; dyness::packet::FRAME_LEN];
        f[..3].copy_from_slice(&dyness::packet::START_MARKER);
        for i in 0..dyness::packet::CELL_COUNT {
            f[6 + 2 * i..8 + 2 * i].copy_from_slice(&3300u16.to_be_bytes());
        }
        f[38..40].copy_from_slice(&650u16.to_be_bytes());
        f[46..48].copy_from_slice(&5210u16.to_be_bytes());
        f[48..50].copy_from_slice(&4000u16.to_be_bytes());
        f[50] = soc;
        f[51] = 100;
        f
    }

    pub fn response(body: &str) -> Vec<u8> {
        let mut r = Vec::from(format!("({}", body).as_bytes());
        r.extend_from_slice(b"\xAA\xBB\r");
        r
    }

    pub fn status() -> Vec<u8> {
        Self::response(STATUS)
    }

    pub fn mode(code: char) -> Vec<u8> {
        Self::response(&code.to_string())
    }

    pub fn settings() -> Vec<u8> {
        Self::response(SETTINGS)
    }

    /// A full poll cycle's worth of responses.
    pub fn cycle() -> Vec<Vec<u8>> {
        vec![Self::status(), Self::mode('B'), Self::settings()]
    }

    pub fn ack() -> Vec<u8> {
        voltronic::packet::ACK.to_vec()
    }

    pub fn nak() -> Vec<u8> {
        voltronic::packet::NAK.to_vec()
    }

    pub fn empty() -> Vec<u8> {
        b"\r".to_vec()
    }

    pub fn policy(trials: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            trials,
            delay: Duration::ZERO,
        }
    }

    pub fn schema(fields: &[(&str, FieldKind)]) -> Schema {
        fields
            .iter()
            .map(|(name, kind)| match kind {
                FieldKind::Float => Field::float(*name),
                FieldKind::Text => Field::text(*name),
            })
            .collect::<Vec<_>>()
            .into()
    }
}

// {{{ Connectors
/// Hands out one end of an in-memory pipe, once.
pub struct DuplexConnector {
    stream: Mutex<Option<DuplexStream>>,
    attempts: Arc<AtomicUsize>,
}

impl DuplexConnector {
    /// The connector and the device's far end.
    pub fn pair() -> (Self, DuplexStream) {
        let (near, far) = tokio::io::duplex(4096);
        (
            Self {
                stream: Mutex::new(Some(near)),
                attempts: Arc::new(AtomicUsize::new(0)),
            },
            far,
        )
    }

    /// Counts every `open`, successful or not.
    pub fn attempts(&self) -> Arc<AtomicUsize> {
        self.attempts.clone()
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn open(&self) -> Result<Box<dyn ByteStream>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.stream.lock().unwrap().take() {
            Some(stream) => Ok(Box::new(stream)),
            None => bail!("duplex already taken"),
        }
    }

    fn describe(&self) -> String {
        "duplex".to_string()
    }
}

pub struct FailingConnector {
    pub attempts: Arc<AtomicUsize>,
}

impl FailingConnector {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        (
            Self {
                attempts: attempts.clone(),
            },
            attempts,
        )
    }
}

#[async_trait]
impl Connector for FailingConnector {
    async fn open(&self) -> Result<Box<dyn ByteStream>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        bail!("no such port")
    }

    fn describe(&self) -> String {
        "nowhere".to_string()
    }
} // }}}

/// Connected battery and the far end of its link.
pub async fn battery(id: &str) -> (Arc<Device>, DuplexStream) {
    let (connector, far) = DuplexConnector::pair();
    let device = Device::new(
        id,
        Driver::Battery(dyness::Battery::new()),
        Box::new(connector),
        Factory::policy(1),
    );
    assert!(device.connect().await);
    (Arc::new(device), far)
}

pub async fn inverter(id: &str) -> (Arc<Device>, DuplexStream) {
    let (connector, far) = DuplexConnector::pair();
    let device = Device::new(
        id,
        Driver::Inverter(voltronic::Inverter::new()),
        Box::new(connector),
        Factory::policy(1),
    );
    assert!(device.connect().await);
    (Arc::new(device), far)
}

/// Plays the inverter: reads `\r` terminated requests and answers each with
/// the next scripted response. Returns the mnemonics it was sent.
pub fn scripted_inverter(far: DuplexStream, responses: Vec<Vec<u8>>) -> JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(far);
        let mut read = BufReader::new(read);
        let mut requests = Vec::new();

        for response in responses {
            let mut request = Vec::new();
            if read.read_until(b'\r', &mut request).await.unwrap_or(0) == 0 {
                break;
            }
            // mnemonic, two CRC bytes, terminator
            let mnemonic = &request[..request.len().saturating_sub(3)];
            requests.push(String::from_utf8_lossy(mnemonic).to_string());
            write.write_all(&response).await.unwrap();
        }

        requests
    })
}

// {{{ RecordingObserver
#[derive(Default)]
pub struct RecordingObserver {
    pub updates: Mutex<Vec<(DeviceInfo, Snapshot)>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }

    pub fn floats(&self, field: &str) -> Vec<f64> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, s)| s.get(field).and_then(Value::as_f64))
            .collect()
    }

    pub async fn wait_for(&self, n: usize) {
        for _ in 0..200 {
            if self.count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} updates, saw {}", n, self.count());
    }
}

#[async_trait]
impl Observer for RecordingObserver {
    async fn update(&self, device: &DeviceInfo, snapshot: &Snapshot) {
        self.updates
            .lock()
            .unwrap()
            .push((device.clone(), snapshot.clone()));
    }
} // }}}
