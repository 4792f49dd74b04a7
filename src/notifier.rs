use crate::prelude::*;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelData {
    Notify { title: String, message: String },
    Shutdown,
}

pub type Sender = mpsc::UnboundedSender<ChannelData>;
pub type Receiver = mpsc::UnboundedReceiver<ChannelData>;

// {{{ Webhook
/// Posts queued notifications to `<host>/<topic>`: the message as a plain
/// text body, the title in a `Title` header. Failed deliveries are logged
/// and dropped.
pub struct Webhook {
    url: String,
    client: reqwest::Client,
    sender: Sender,
    receiver: Mutex<Option<Receiver>>,
}

impl Webhook {
    pub fn new(url: impl Into<String>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    pub async fn start(&self) -> Result<()> {
        let mut receiver = self
            .receiver
            .lock()
            .map_err(|_| anyhow!("webhook receiver lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("webhook already started"))?;

        info!("sending notifications to {}", self.url);

        while let Some(message) = receiver.recv().await {
            match message {
                ChannelData::Shutdown => break,
                ChannelData::Notify { title, message } => {
                    if let Err(e) = self.deliver(&title, &message).await {
                        error!("notification {:?} failed: {}", title, e);
                    }
                }
            }
        }

        info!("webhook loop exiting");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.sender.send(ChannelData::Shutdown);
    }

    pub async fn deliver(&self, title: &str, message: &str) -> Result<()> {
        debug!("notify {:?}: {}", title, message);

        let response = self
            .client
            .post(&self.url)
            .header("Title", title)
            .body(message.to_string())
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            bail!("{} responded {}", self.url, status);
        }
        Ok(())
    }
} // }}}

fn notify(sender: &Sender, title: &str, message: String) {
    info!("{}: {}", title, message);
    if sender
        .send(ChannelData::Notify {
            title: title.to_string(),
            message,
        })
        .is_err()
    {
        warn!("webhook has stopped, dropping notification");
    }
}

// {{{ GridWatch
/// Notifies when an inverter's grid state changes. The first state seen for
/// each device is only remembered.
pub struct GridWatch {
    sender: Sender,
    last: Mutex<HashMap<String, String>>,
}

impl GridWatch {
    pub fn new(sender: Sender) -> Self {
        Self {
            sender,
            last: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Observer for GridWatch {
    async fn update(&self, device: &DeviceInfo, snapshot: &Snapshot) {
        let Some(state) = snapshot.get("grid_state").and_then(Value::as_str) else {
            return;
        };

        let previous = match self.last.lock() {
            Ok(mut last) => last.insert(device.id.clone(), state.to_string()),
            Err(_) => {
                error!("{}: grid watch state poisoned", device.id);
                return;
            }
        };

        match previous {
            Some(previous) if previous != state => {
                let title = if state == "on" { "Grid restored" } else { "Grid down" };
                notify(
                    &self.sender,
                    title,
                    format!("{}: grid went from {} to {}", device.id, previous, state),
                );
            }
            _ => {}
        }
    }
} // }}}

// {{{ BatteryWatch
struct Charge {
    last: f64,
    sent: bool,
}

/// Notifies once when a battery's state of charge drops below the threshold,
/// then stays quiet until it has risen back above it.
pub struct BatteryWatch {
    sender: Sender,
    /// Percent.
    threshold: f64,
    charge: Mutex<HashMap<String, Charge>>,
}

impl BatteryWatch {
    pub fn new(sender: Sender, threshold: f64) -> Self {
        Self {
            sender,
            threshold,
            charge: Mutex::new(HashMap::new()),
        }
    }

    /// Records `percent` for `device_id`, returning true if it warrants an
    /// alert.
    fn observe(&self, device_id: &str, percent: f64) -> bool {
        let Ok(mut charge) = self.charge.lock() else {
            return false;
        };

        let Some(c) = charge.get_mut(device_id) else {
            charge.insert(
                device_id.to_string(),
                Charge {
                    last: percent,
                    sent: percent < self.threshold,
                },
            );
            return false;
        };

        if c.last == percent {
            return false;
        }
        c.last = percent;

        if percent < self.threshold {
            if !c.sent {
                c.sent = true;
                return true;
            }
        } else if percent > self.threshold {
            c.sent = false;
        }
        false
    }
}

#[async_trait]
impl Observer for BatteryWatch {
    async fn update(&self, device: &DeviceInfo, snapshot: &Snapshot) {
        let Some(soc) = snapshot.get("state_of_charge").and_then(Value::as_f64) else {
            return;
        };
        // hundredths of a percent, so 0.29 compares equal to a threshold of 29
        let percent = (soc * 10_000.0).round() / 100.0;

        if self.observe(&device.id, percent) {
            notify(
                &self.sender,
                "Low battery",
                format!(
                    "{}: state of charge {:.0}% is below {:.0}%",
                    device.id, percent, self.threshold
                ),
            );
        }
    }
} // }}}
