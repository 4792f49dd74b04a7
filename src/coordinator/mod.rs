use crate::prelude::*;
use crate::command::CommandReport;
use crate::device::ReconnectPolicy;
use crate::observer::ObserverRef;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

// {{{ FleetStats
#[derive(Default)]
pub struct FleetStats {
    snapshots: HashMap<String, u64>,
    last_update: HashMap<String, f64>,
    commands_ok: u64,
    commands_failed: u64,
}

impl FleetStats {
    pub fn snapshots(&self, device_id: &str) -> u64 {
        self.snapshots.get(device_id).copied().unwrap_or_default()
    }

    /// Accepted and failed command counts.
    pub fn commands(&self) -> (u64, u64) {
        (self.commands_ok, self.commands_failed)
    }

    pub fn print_summary(&self) {
        info!("Fleet Statistics:");
        info!("  Snapshots received:");
        let mut ids: Vec<&String> = self.snapshots.keys().collect();
        ids.sort();
        for id in ids {
            info!("    {}: {}", id, self.snapshots[id]);
            if let Some(t) = self.last_update.get(id) {
                info!("      Last update: {}", t);
            }
        }
        info!("  Commands:");
        info!("    Accepted: {}", self.commands_ok);
        info!("    Failed: {}", self.commands_failed);
    }
}

struct StatsRecorder(Arc<Mutex<FleetStats>>);

#[async_trait]
impl Observer for StatsRecorder {
    async fn update(&self, device: &DeviceInfo, snapshot: &Snapshot) {
        if let Ok(mut stats) = self.0.lock() {
            *stats.snapshots.entry(device.id.clone()).or_default() += 1;
            stats.last_update.insert(device.id.clone(), snapshot.time_updated());
        }
    }
} // }}}

/// Owns the fleet: builds devices from configuration, connects them, hands
/// them their observers, runs them and answers queries about them.
pub struct Coordinator {
    devices: BTreeMap<String, Arc<Device>>,
    pub stats: Arc<Mutex<FleetStats>>,
}

impl Coordinator {
    pub fn new(config: &Config) -> Self {
        Self::with_devices(Self::initialise_devices(config))
    }

    pub fn with_devices(devices: Vec<Device>) -> Self {
        let stats = Arc::new(Mutex::new(FleetStats::default()));
        let recorder: ObserverRef = Arc::new(StatsRecorder(stats.clone()));

        let devices = devices
            .into_iter()
            .map(|device| {
                device.attach(recorder.clone());
                (device.id().to_string(), Arc::new(device))
            })
            .collect();

        Self { devices, stats }
    }

    /// Builds every device in `config`. Entries that cannot be built are
    /// logged and skipped.
    pub fn initialise_devices(config: &Config) -> Vec<Device> {
        let policy = ReconnectPolicy::from(config.connections());
        let mut devices = Vec::new();

        for (key, setup) in config.devices() {
            info!("initialising device {}", key);
            match Device::from_setup(key, setup, policy) {
                Ok(device) => {
                    info!("initialised {} as {}", key, device.device_type());
                    devices.push(device);
                }
                Err(e) => error!("problem initialising device {}: {}", key, e),
            }
        }

        devices
    }

    /// Connects every device with bounded retries. Devices that never
    /// connect are dropped from the fleet.
    pub async fn connect_devices(&mut self) {
        let attempts = self.devices.values().map(|device| {
            let device = device.clone();
            async move { (device.id().to_string(), device.connect_with_retry().await) }
        });

        for (id, connected) in futures::future::join_all(attempts).await {
            if connected {
                info!("connected device {}", id);
            } else {
                error!("failed to connect device {}", id);
                self.devices.remove(&id);
            }
        }

        if self.devices.is_empty() {
            error!("no devices running!");
        }
    }

    pub fn attach_all(&self, observer: ObserverRef) {
        for device in self.devices.values() {
            device.attach(observer.clone());
        }
    }

    pub fn attach_to(&self, device_type: DeviceType, observer: ObserverRef) {
        for device in self.devices.values().filter(|d| d.device_type() == device_type) {
            device.attach(observer.clone());
        }
    }

    /// Runs every device until all of them have stopped.
    pub async fn start(&self) -> Result<()> {
        let runs = self.devices.values().map(|device| {
            let device = device.clone();
            async move { device.run().await }
        });
        futures::future::join_all(runs).await;

        info!("all devices stopped");
        Ok(())
    }

    pub fn stop(&self) {
        for device in self.devices.values() {
            device.stop();
        }
    }

    pub async fn disconnect_all(&self) {
        for device in self.devices.values() {
            device.disconnect().await;
        }
    }

    // {{{ API
    pub fn device_keys(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    pub fn devices(&self) -> BTreeMap<String, DeviceInfo> {
        self.devices
            .iter()
            .map(|(key, device)| (key.clone(), device.info().clone()))
            .collect()
    }

    fn first_of_type(&self, device_type: DeviceType) -> Option<&Arc<Device>> {
        self.devices.values().find(|d| d.device_type() == device_type)
    }

    /// Looks up a device by key. `inverter` and `battery`, unless they are
    /// configured keys themselves, mean the first device of that type.
    pub fn device(&self, key: &str) -> Result<&Arc<Device>> {
        if let Some(device) = self.devices.get(key) {
            return Ok(device);
        }

        let alias = match key {
            "inverter" => Some(DeviceType::Inverter),
            "battery" => Some(DeviceType::Battery),
            _ => None,
        };

        match alias {
            Some(device_type) => self
                .first_of_type(device_type)
                .ok_or_else(|| anyhow!("no {} devices found", device_type)),
            None => bail!("device {} not found", key),
        }
    }

    pub fn device_info(&self, key: &str) -> Result<DeviceInfo> {
        Ok(self.device(key)?.info().clone())
    }

    /// `Ok(None)` if the device exists but has not produced a snapshot yet.
    pub fn device_snapshot(&self, key: &str) -> Result<Option<Snapshot>> {
        Ok(self.device(key)?.snapshot())
    }

    pub fn available_commands(&self, key: &str) -> Result<Vec<&'static str>> {
        Ok(self.device(key)?.available_commands().to_vec())
    }

    pub async fn execute_command(&self, key: &str, name: &str, arg: Option<u16>) -> CommandReport {
        let device = match self.device(key) {
            Ok(device) => device,
            Err(e) => return CommandReport::failed(e.to_string()),
        };
        let command = match Command::from_name(name, arg) {
            Ok(command) => command,
            Err(e) => return CommandReport::failed(e.to_string()),
        };

        let report = device.execute(&command).await;
        self.record(&report);
        report
    }

    /// Starts charging the first inverter from the grid at `current` amps.
    pub async fn issue_grid_charge(&self, current: u16) -> CommandReport {
        let inverter = match self.first_of_type(DeviceType::Inverter) {
            Some(inverter) => inverter,
            None => return CommandReport::failed("no inverter devices found"),
        };

        let report = inverter
            .execute(&Command::TurnOnGridCharging(Some(current)))
            .await;
        self.record(&report);
        report
    }

    fn record(&self, report: &CommandReport) {
        if let Ok(mut stats) = self.stats.lock() {
            if report.success {
                stats.commands_ok += 1;
            } else {
                stats.commands_failed += 1;
            }
        }
    } // }}}
}
