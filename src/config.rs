use crate::prelude::*;

use serde::Deserialize;
use serde_with::{serde_as, DurationSecondsWithFrac};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,

    #[serde(default)]
    pub connections: Connections,

    #[serde(default)]
    pub devices: BTreeMap<String, DeviceSetup>,

    pub csv_data_logging: Option<CsvDataLogging>,
    pub websocket: Option<Websocket>,
    pub sql_database: Option<SqlDatabase>,
    pub notifications: Option<Notifications>,
}

// {{{ Connections
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Connections {
    #[serde(default = "Config::default_num_connection_tries")]
    pub num_connection_tries: u32,

    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "Config::default_stall_time")]
    pub stall_time: Duration,
}

impl Default for Connections {
    fn default() -> Self {
        Self {
            num_connection_tries: Config::default_num_connection_tries(),
            stall_time: Config::default_stall_time(),
        }
    }
}

impl Connections {
    pub fn num_connection_tries(&self) -> u32 {
        self.num_connection_tries
    }

    pub fn stall_time(&self) -> Duration {
        self.stall_time
    }
} // }}}

// {{{ DeviceSetup
/// One entry under `devices:`. Everything besides `type` is handed to the
/// device constructor, which decides what it requires.
#[derive(Clone, Debug, Deserialize)]
pub struct DeviceSetup {
    #[serde(rename = "type")]
    pub kind: Option<String>,

    #[serde(flatten)]
    pub parameters: BTreeMap<String, serde_yaml::Value>,
}

impl DeviceSetup {
    pub fn kind(&self) -> Result<&str, DeviceInitialisationError> {
        self.kind
            .as_deref()
            .ok_or(DeviceInitialisationError::MissingType)
    }

    pub fn string(&self, field: &'static str) -> Result<String, DeviceInitialisationError> {
        match self.parameters.get(field) {
            Some(serde_yaml::Value::String(s)) => Ok(s.clone()),
            Some(_) => Err(DeviceInitialisationError::WrongType {
                field,
                expected: "string",
            }),
            None => Err(DeviceInitialisationError::MissingField(field)),
        }
    }
} // }}}

// {{{ CsvDataLogging
#[derive(Clone, Debug, Deserialize)]
pub struct CsvDataLogging {
    pub base_filepath: String,

    #[serde(default = "Config::default_lines_per_file")]
    pub lines_per_file: usize,
}

impl CsvDataLogging {
    pub fn base_filepath(&self) -> &str {
        &self.base_filepath
    }

    pub fn lines_per_file(&self) -> usize {
        self.lines_per_file
    }
} // }}}

// {{{ Websocket
#[derive(Clone, Debug, Deserialize)]
pub struct Websocket {
    #[serde(default = "Config::default_websocket_host")]
    pub host: String,
    pub port: u16,
}

impl Websocket {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
} // }}}

// {{{ SqlDatabase
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct SqlDatabase {
    pub sql_driver: String,
    pub database_path: String,

    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "Config::default_summarise_interval")]
    pub summarise_interval: Duration,

    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "Config::default_raw_retention")]
    pub raw_retention: Duration,
}

impl SqlDatabase {
    /// The driver without any `+variant` suffix, e.g. `sqlite` for
    /// `sqlite+aiosqlite`.
    pub fn scheme(&self) -> &str {
        self.sql_driver.split('+').next().unwrap_or_default()
    }

    pub fn connection_string(&self) -> String {
        let url = format!("{}://{}", self.scheme(), self.database_path);
        if self.scheme() == "sqlite" && !url.contains('?') {
            format!("{}?mode=rwc", url)
        } else {
            url
        }
    }

    pub fn summarise_interval(&self) -> Duration {
        self.summarise_interval
    }

    pub fn raw_retention(&self) -> Duration {
        self.raw_retention
    }
} // }}}

// {{{ Notifications
#[derive(Clone, Debug, Deserialize)]
pub struct Notifications {
    pub host: String,
    pub topic: String,

    /// Percent state of charge below which a low battery alert is sent.
    #[serde(default = "Config::default_low_battery_threshold")]
    pub low_battery_threshold: f64,

    #[serde(default = "Config::default_enabled")]
    pub grid_alerts: bool,
}

impl Notifications {
    pub fn url(&self) -> String {
        format!("{}/{}", self.host.trim_end_matches('/'), self.topic)
    }

    pub fn low_battery_threshold(&self) -> f64 {
        self.low_battery_threshold
    }

    pub fn grid_alerts(&self) -> bool {
        self.grid_alerts
    }
} // }}}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow!("config.rs:error reading {}: {}", file, err))?;

        Self::from_yaml(&content)
    }

    /// Logs what was loaded. Called once logging is up, which itself waits on
    /// the configured loglevel.
    pub fn log_summary(&self) {
        info!("Configuration loaded successfully:");
        info!("  Devices: {} configured", self.devices.len());
        for (key, setup) in &self.devices {
            info!("    {}: {}", key, setup.kind.as_deref().unwrap_or("<no type>"));
        }
        info!(
            "  Connections: {} tries, {:?} stall",
            self.connections.num_connection_tries, self.connections.stall_time
        );
        info!("  CSV logging: {}", if self.csv_data_logging.is_some() { "enabled" } else { "disabled" });
        if let Some(ws) = &self.websocket {
            info!("  Websocket: {}:{}", ws.host, ws.port);
        }
        if let Some(sql) = &self.sql_database {
            info!("  SQL database: {}", sql.connection_string());
        }
        if let Some(n) = &self.notifications {
            info!("  Notifications: {}", n.url());
        }
        info!("  Log Level: {}", self.loglevel);
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.connections.num_connection_tries == 0 {
            bail!("connections.num_connection_tries must be at least 1");
        }

        if let Some(csv) = &self.csv_data_logging {
            if csv.lines_per_file == 0 {
                bail!("csv_data_logging.lines_per_file must be at least 1");
            }
        }

        if let Some(sql) = &self.sql_database {
            if let Err(e) = url::Url::parse(&sql.connection_string()) {
                return Err(anyhow!("config.rs:Invalid SQL connection string: {}", e));
            }
            if sql.summarise_interval.is_zero() {
                bail!("sql_database.summarise_interval must be greater than zero");
            }
        }

        if let Some(notifications) = &self.notifications {
            if let Err(e) = url::Url::parse(&notifications.url()) {
                return Err(anyhow!("config.rs:Invalid notification URL: {}", e));
            }
            if notifications.topic.is_empty() {
                return Err(anyhow!("config.rs:Notification topic cannot be empty"));
            }
        }

        Ok(())
    }

    pub fn loglevel(&self) -> &str {
        &self.loglevel
    }

    pub fn connections(&self) -> &Connections {
        &self.connections
    }

    pub fn devices(&self) -> &BTreeMap<String, DeviceSetup> {
        &self.devices
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }

    fn default_num_connection_tries() -> u32 {
        5
    }

    fn default_stall_time() -> Duration {
        Duration::from_secs(1)
    }

    fn default_lines_per_file() -> usize {
        10_000
    }

    fn default_websocket_host() -> String {
        "0.0.0.0".to_string()
    }

    fn default_summarise_interval() -> Duration {
        Duration::from_secs(600)
    }

    fn default_raw_retention() -> Duration {
        Duration::from_secs(3600)
    }

    fn default_low_battery_threshold() -> f64 {
        20.0
    }

    fn default_enabled() -> bool {
        true
    }
}

/// Device keys end up in file and table names, so they must be non-empty and
/// free of whitespace.
pub fn validate_device_key(key: &str) -> Result<(), DeviceInitialisationError> {
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return Err(DeviceInitialisationError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
loglevel: debug
connections:
  num_connection_tries: 3
  stall_time: 0.25
devices:
  dyness_battery:
    type: DynessA48100Com
    serial_port: /dev/ttyUSB0
  kodak:
    type: KodakOGX548Inverter
sql_database:
  sql_driver: sqlite
  database_path: data/sunny_jim.db
notifications:
  host: https://ntfy.sh/
  topic: sunny-jim
"#;

    #[test]
    fn parses_full_config() {
        let config = Config::from_yaml(YAML).unwrap();

        assert_eq!(config.loglevel(), "debug");
        assert_eq!(config.connections().num_connection_tries(), 3);
        assert_eq!(config.connections().stall_time(), Duration::from_millis(250));
        assert_eq!(config.devices().len(), 2);

        let battery = &config.devices()["dyness_battery"];
        assert_eq!(battery.kind().unwrap(), "DynessA48100Com");
        assert_eq!(battery.string("serial_port").unwrap(), "/dev/ttyUSB0");

        let kodak = &config.devices()["kodak"];
        assert_eq!(
            kodak.string("serial_port"),
            Err(DeviceInitialisationError::MissingField("serial_port"))
        );

        let sql = config.sql_database.as_ref().unwrap();
        assert_eq!(sql.connection_string(), "sqlite://data/sunny_jim.db?mode=rwc");
        assert_eq!(sql.raw_retention(), Duration::from_secs(3600));

        let notifications = config.notifications.as_ref().unwrap();
        assert_eq!(notifications.url(), "https://ntfy.sh/sunny-jim");
        assert_eq!(notifications.low_battery_threshold(), 20.0);
    }

    #[test]
    fn defaults_when_sections_missing() {
        let config = Config::from_yaml("devices: {}").unwrap();
        assert_eq!(config.loglevel(), "info");
        assert_eq!(config.connections().num_connection_tries(), 5);
        assert_eq!(config.connections().stall_time(), Duration::from_secs(1));
        assert!(config.websocket.is_none());
    }

    #[test]
    fn rejects_zero_tries() {
        let yaml = "connections:\n  num_connection_tries: 0\n";
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn rejects_zero_summarise_interval() {
        let yaml = "sql_database:\n  sql_driver: sqlite\n  database_path: x.db\n  summarise_interval: 0\n";
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn driver_variant_is_dropped_from_url() {
        let yaml = "sql_database:\n  sql_driver: sqlite+aiosqlite\n  database_path: /tmp/x.db\n";
        let config = Config::from_yaml(yaml).unwrap();
        let sql = config.sql_database.as_ref().unwrap();
        assert_eq!(sql.scheme(), "sqlite");
        assert_eq!(sql.connection_string(), "sqlite:///tmp/x.db?mode=rwc");
    }

    #[test]
    fn device_keys() {
        assert!(validate_device_key("kodak_ogx_548").is_ok());
        assert!(validate_device_key("kodak ogx").is_err());
        assert!(validate_device_key("").is_err());
    }
}
