use crate::prelude::*;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub enum ChannelData {
    Row(DeviceInfo, Snapshot),
    Shutdown,
}

pub type Sender = mpsc::UnboundedSender<ChannelData>;
pub type Receiver = mpsc::UnboundedReceiver<ChannelData>;

// {{{ CsvLog
struct CsvLog {
    writer: csv::Writer<File>,
    path: PathBuf,
    lines: usize,
}

/// Per-device CSV files under one directory. Each file starts with a header
/// row taken from the device schema; a new file is started once
/// `lines_per_file` data rows have been written.
pub struct CsvFiles {
    base: PathBuf,
    lines_per_file: usize,
    logs: HashMap<String, CsvLog>,
}

impl CsvFiles {
    pub fn new(base: impl Into<PathBuf>, lines_per_file: usize) -> Self {
        Self {
            base: base.into(),
            lines_per_file: lines_per_file.max(1),
            logs: HashMap::new(),
        }
    }

    fn open(&self, device_id: &str, schema: &Schema) -> Result<CsvLog> {
        std::fs::create_dir_all(&self.base)?;

        let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S%.3f").to_string();
        let mut path = self.base.join(format!("{}_{}.csv", stamp, device_id));
        let mut n = 1;
        while path.exists() {
            path = self.base.join(format!("{}-{}_{}.csv", stamp, n, device_id));
            n += 1;
        }

        let file = OpenOptions::new().create_new(true).write(true).open(&path)?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(schema.iter().map(|field| field.name.as_str()))?;
        writer.flush()?;

        info!("{}: logging to {}", device_id, path.display());

        Ok(CsvLog {
            writer,
            path,
            lines: 0,
        })
    }

    pub fn write(&mut self, device: &DeviceInfo, snapshot: &Snapshot) -> Result<()> {
        let rotate = match self.logs.get(&device.id) {
            Some(log) => log.lines >= self.lines_per_file,
            None => true,
        };
        if rotate {
            let log = self.open(&device.id, snapshot.schema())?;
            if let Some(old) = self.logs.insert(device.id.clone(), log) {
                debug!("{}: closed {} after {} rows", device.id, old.path.display(), old.lines);
            }
        }

        let log = self
            .logs
            .get_mut(&device.id)
            .ok_or_else(|| anyhow!("no csv log for {}", device.id))?;

        log.writer
            .write_record(snapshot.values().iter().map(|value| value.to_string()))?;
        log.writer.flush()?;
        log.lines += 1;

        Ok(())
    }

    pub fn current_path(&self, device_id: &str) -> Option<&Path> {
        self.logs.get(device_id).map(|log| log.path.as_path())
    }
} // }}}

/// CSV sink. Snapshots are queued by `update` and written by the task running
/// `start`.
pub struct DatalogWriter {
    config: config::CsvDataLogging,
    sender: Sender,
    receiver: Mutex<Option<Receiver>>,
}

impl DatalogWriter {
    pub fn new(config: config::CsvDataLogging) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        Self {
            config,
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut receiver = self
            .receiver
            .lock()
            .map_err(|_| anyhow!("datalog receiver lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("datalog writer already started"))?;

        info!("writing csv logs to {}", self.config.base_filepath());
        let mut files = CsvFiles::new(self.config.base_filepath(), self.config.lines_per_file());

        while let Some(message) = receiver.recv().await {
            match message {
                ChannelData::Shutdown => break,
                ChannelData::Row(device, snapshot) => {
                    if let Err(e) = files.write(&device, &snapshot) {
                        error!("{}: failed to write csv row: {}", device.id, e);
                    }
                }
            }
        }

        info!("datalog writer exiting");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.sender.send(ChannelData::Shutdown);
    }
}

#[async_trait]
impl Observer for DatalogWriter {
    async fn update(&self, device: &DeviceInfo, snapshot: &Snapshot) {
        if self
            .sender
            .send(ChannelData::Row(device.clone(), snapshot.clone()))
            .is_err()
        {
            warn!("{}: datalog writer has stopped, dropping row", device.id);
        }
    }
}
