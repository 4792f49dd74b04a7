pub mod telemetry;
pub mod transport;

use crate::prelude::*;
use crate::command::CommandReport;
use crate::observer::{ObserverRef, ObserverRegistry};

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use telemetry::Telemetry;
use transport::{Connector, Wire};

// how long the loops sleep between checks while there is no link
const DISCONNECTED_PAUSE: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Battery,
    Inverter,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Battery => "battery",
            DeviceType::Inverter => "inverter",
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub id: String,
    pub device_type: DeviceType,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReconnectPolicy {
    pub trials: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            trials: 5,
            delay: Duration::from_secs(1),
        }
    }
}

impl From<&config::Connections> for ReconnectPolicy {
    fn from(c: &config::Connections) -> Self {
        Self {
            trials: c.num_connection_tries(),
            delay: c.stall_time(),
        }
    }
}

// {{{ Driver
/// The protocol a device speaks. Closed set; every call is an exhaustive match.
pub enum Driver {
    Battery(dyness::Battery),
    Inverter(voltronic::Inverter),
}

impl Driver {
    pub fn device_type(&self) -> DeviceType {
        match self {
            Driver::Battery(_) => DeviceType::Battery,
            Driver::Inverter(_) => DeviceType::Inverter,
        }
    }

    pub fn schema(&self) -> Schema {
        match self {
            Driver::Battery(_) => dyness::Battery::schema(),
            Driver::Inverter(_) => voltronic::Inverter::schema(),
        }
    }

    pub fn commands(&self) -> &'static [&'static str] {
        match self {
            Driver::Battery(_) => &[],
            Driver::Inverter(_) => &Command::NAMES,
        }
    }

    fn receive_pause(&self) -> Duration {
        match self {
            Driver::Battery(_) => Duration::ZERO,
            Driver::Inverter(d) => d.receive_pause(),
        }
    }

    fn reset(&mut self) {
        match self {
            Driver::Battery(d) => d.reset(),
            Driver::Inverter(d) => d.reset(),
        }
    }

    async fn send(&mut self, wire: &mut Wire) -> Result<Duration> {
        match self {
            Driver::Battery(d) => d.send(wire).await,
            Driver::Inverter(d) => d.send(wire).await,
        }
    }

    async fn receive(&mut self, wire: &mut Wire) -> Result<Option<Telemetry>> {
        match self {
            Driver::Battery(d) => d.receive(wire).await,
            Driver::Inverter(d) => d.receive(wire).await,
        }
    }

    async fn execute(&mut self, wire: &mut Wire, command: &Command) -> Result<CommandReport> {
        match self {
            Driver::Battery(_) => Ok(CommandReport::failed(format!(
                "batteries do not accept {}",
                command.name()
            ))),
            Driver::Inverter(d) => d.execute(wire, command).await,
        }
    }
} // }}}

/// Everything behind the execution lock: the open link, if any, and the
/// protocol state that goes with it.
struct Link {
    wire: Option<Wire>,
    driver: Driver,
}

// {{{ Device
pub struct Device {
    info: DeviceInfo,
    schema: Schema,
    commands: &'static [&'static str],
    receive_pause: Duration,
    policy: ReconnectPolicy,
    connector: Box<dyn Connector>,

    link: Mutex<Link>,

    connected: AtomicBool,
    running: AtomicBool,
    reconnecting: AtomicBool,
    wake: Notify,

    snapshot: RwLock<Option<Snapshot>>,
    observers: ObserverRegistry,
}

impl Device {
    pub fn new(id: &str, driver: Driver, connector: Box<dyn Connector>, policy: ReconnectPolicy) -> Self {
        Self {
            info: DeviceInfo {
                id: id.to_string(),
                device_type: driver.device_type(),
            },
            schema: driver.schema(),
            commands: driver.commands(),
            receive_pause: driver.receive_pause(),
            policy,
            connector,
            link: Mutex::new(Link { wire: None, driver }),
            connected: AtomicBool::new(false),
            running: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            wake: Notify::new(),
            snapshot: RwLock::new(None),
            observers: ObserverRegistry::new(),
        }
    }

    /// Builds a device from its `devices:` entry.
    pub fn from_setup(
        id: &str,
        setup: &config::DeviceSetup,
        policy: ReconnectPolicy,
    ) -> Result<Self, DeviceInitialisationError> {
        config::validate_device_key(id)?;

        let kind = setup.kind()?;
        let (driver, connector): (Driver, Box<dyn Connector>) = if kind == dyness::Battery::MODEL {
            (
                Driver::Battery(dyness::Battery::new()),
                Box::new(dyness::Battery::connector(setup)?),
            )
        } else if kind == voltronic::Inverter::MODEL {
            (
                Driver::Inverter(voltronic::Inverter::new()),
                Box::new(voltronic::Inverter::connector(setup)?),
            )
        } else {
            return Err(DeviceInitialisationError::UnknownType(kind.to_string()));
        };

        Ok(Self::new(id, driver, connector, policy))
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn device_type(&self) -> DeviceType {
        self.info.device_type
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn available_commands(&self) -> &'static [&'static str] {
        self.commands
    }

    pub fn supports(&self, command: &Command) -> bool {
        self.commands.contains(&command.name())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Latest complete snapshot, if one has been received.
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.snapshot.read().ok().and_then(|s| s.clone())
    }

    pub fn time_updated(&self) -> Option<f64> {
        self.snapshot().map(|s| s.time_updated())
    }

    pub fn attach(&self, observer: ObserverRef) {
        self.observers.attach(observer);
    }

    pub fn detach(&self, observer: &ObserverRef) {
        self.observers.detach(observer);
    }

    // {{{ Connection
    /// Opens the transport. Failures are logged and reported as `false`.
    pub async fn connect(&self) -> bool {
        info!("{}: connecting to {}", self.info.id, self.connector.describe());

        match self.connector.open().await {
            Ok(stream) => {
                let mut link = self.link.lock().await;
                if let Some(old) = link.wire.take() {
                    old.close().await;
                }
                link.driver.reset();
                link.wire = Some(Wire::new(stream));
                self.connected.store(true, Ordering::SeqCst);
                info!("{}: connected", self.info.id);
                true
            }
            Err(e) => {
                error!("{}: {}", self.info.id, e);
                self.connected.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);

        let wire = self.link.lock().await.wire.take();
        if let Some(wire) = wire {
            wire.close().await;
            info!("{}: disconnected", self.info.id);
        }
    }

    pub async fn reconnect(&self) -> bool {
        self.disconnect().await;
        self.connect().await
    }

    /// Up to `policy.trials` connection attempts with `policy.delay` between
    /// them.
    pub async fn connect_with_retry(&self) -> bool {
        for trial in 1..=self.policy.trials {
            if self.connect().await {
                return true;
            }
            warn!(
                "{}: connection attempt {}/{} failed",
                self.info.id, trial, self.policy.trials
            );
            if trial < self.policy.trials {
                tokio::time::sleep(self.policy.delay).await;
            }
        }
        false
    }

    /// Drops the link and tries to bring it back with bounded retries. Once
    /// the retries are used up the device stays disconnected and stops.
    pub async fn try_reconnect(&self) -> bool {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("{}: reconnect already in progress", self.info.id);
            return false;
        }

        let connected = self.reconnect_with_retry().await;
        self.reconnecting.store(false, Ordering::SeqCst);
        connected
    }

    /// Callers hold the `reconnecting` flag.
    async fn reconnect_with_retry(&self) -> bool {
        self.disconnect().await;
        let connected = self.connect_with_retry().await;
        if !connected {
            error!(
                "{}: giving up after {} connection attempts",
                self.info.id, self.policy.trials
            );
            self.stop();
        }
        connected
    }

    fn transport_failed(self: &Arc<Self>, e: anyhow::Error) {
        error!("{}: {}", self.info.id, e);
        self.connected.store(false, Ordering::SeqCst);

        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let device = Arc::clone(self);
        tokio::spawn(async move {
            device.reconnect_with_retry().await;
            device.reconnecting.store(false, Ordering::SeqCst);
        });
    } // }}}

    // {{{ Polling
    /// Runs the send and receive loops until `stop()` is called or
    /// reconnection gives up.
    pub async fn run(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        info!("{}: running", self.info.id);

        tokio::join!(self.send_loop(), self.receive_loop());

        info!("{}: stopped", self.info.id);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    /// Sleeps for `duration`, returning early if the device is stopped.
    async fn pause(&self, duration: Duration) {
        let notified = self.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if !self.is_running() {
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = notified => {}
        }
    }

    async fn send_loop(self: &Arc<Self>) {
        while self.is_running() {
            if !self.is_connected() {
                self.pause(DISCONNECTED_PAUSE).await;
                continue;
            }

            match self.send().await {
                Ok(pause) => self.pause(pause).await,
                Err(e) if self.is_running() => self.transport_failed(e),
                Err(e) => debug!("{}: {} after stop", self.info.id, e),
            }
        }
    }

    async fn receive_loop(self: &Arc<Self>) {
        while self.is_running() {
            if !self.is_connected() {
                self.pause(DISCONNECTED_PAUSE).await;
                continue;
            }

            match self.receive().await {
                Ok(_) if !self.receive_pause.is_zero() => self.pause(self.receive_pause).await,
                Ok(_) => {}
                Err(e) if self.is_running() => self.transport_failed(e),
                Err(e) => debug!("{}: {} after stop", self.info.id, e),
            }
        }
    }

    /// One write on the send side. Returns how long to wait before the next.
    pub async fn send(&self) -> Result<Duration> {
        let mut guard = self.link.lock().await;
        let link = &mut *guard;

        match link.wire.as_mut() {
            Some(wire) => link.driver.send(wire).await,
            None => Ok(DISCONNECTED_PAUSE),
        }
    }

    /// One receive cycle. `Ok(true)` when it produced a snapshot, which has
    /// then been stored and handed to every observer.
    pub async fn receive(&self) -> Result<bool> {
        let telemetry = {
            let mut guard = self.link.lock().await;
            let link = &mut *guard;

            match link.wire.as_mut() {
                Some(wire) => link.driver.receive(wire).await?,
                None => None,
            }
        };

        match telemetry {
            Some(telemetry) => Ok(self.publish(telemetry).await),
            None => Ok(false),
        }
    }

    async fn publish(&self, telemetry: Telemetry) -> bool {
        let now = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;

        let Some(snapshot) = Snapshot::new(self.schema.clone(), telemetry.values(now)) else {
            warn!("{}: incomplete telemetry, not publishing", self.info.id);
            return false;
        };

        match self.snapshot.write() {
            Ok(mut latest) => *latest = Some(snapshot.clone()),
            Err(_) => error!("{}: snapshot lock poisoned", self.info.id),
        }
        trace!("{}: {:?}", self.info.id, snapshot);

        self.observers.notify(&self.info, &snapshot, None).await;
        true
    } // }}}

    // {{{ Commands
    /// Runs `command` under the execution lock, so it never interleaves with
    /// a poll exchange. Unsupported commands are refused without touching
    /// the wire.
    pub async fn run_command(&self, command: &Command) -> Result<CommandReport> {
        if !self.supports(command) {
            warn!("{}: {} is not supported", self.info.id, command.name());
            return Ok(CommandReport::failed(format!(
                "{} does not support {}",
                self.info.id,
                command.name()
            )));
        }

        let mut guard = self.link.lock().await;
        let link = &mut *guard;

        let Some(wire) = link.wire.as_mut() else {
            return Ok(CommandReport::failed(format!("{} is not connected", self.info.id)));
        };

        info!("{}: running {}", self.info.id, command);
        let report = link.driver.execute(wire, command).await?;
        if report.success {
            info!("{}: {}", self.info.id, report.detail);
        } else {
            warn!("{}: {}", self.info.id, report.detail);
        }
        Ok(report)
    }

    /// Like `run_command` but a transport failure also drops the link and
    /// starts reconnecting.
    pub async fn execute(self: &Arc<Self>, command: &Command) -> CommandReport {
        match self.run_command(command).await {
            Ok(report) => report,
            Err(e) => {
                let detail = format!("{} failed: {}", command.name(), e);
                self.transport_failed(e);
                CommandReport::failed(detail)
            }
        }
    }

    pub async fn try_run_command(self: &Arc<Self>, command: &Command) -> bool {
        self.execute(command).await.success
    } // }}}
} // }}}
