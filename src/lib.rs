pub mod command;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod datalog_writer;
pub mod device;
pub mod dyness;
pub mod error;
pub mod notifier;
pub mod observer;
pub mod options;
pub mod prelude;
pub mod scheduler;
pub mod snapshot;
pub mod voltronic;
pub mod websocket;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;

use crate::coordinator::Coordinator;
use crate::database::Database;
use crate::datalog_writer::DatalogWriter;
use crate::notifier::{BatteryWatch, GridWatch, Webhook};
use crate::observer::ObserverRef;
use crate::options::Options;
use crate::scheduler::Scheduler;
use crate::websocket::Websocket;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Every long-running part of the application, so they can be stopped in
/// order.
pub struct Components {
    pub coordinator: Arc<Coordinator>,
    pub datalog_writer: Option<Arc<DatalogWriter>>,
    pub websocket: Option<Arc<Websocket>>,
    pub database: Option<Arc<Database>>,
    pub scheduler: Option<Arc<Scheduler>>,
    pub webhook: Option<Arc<Webhook>>,
}

impl Components {
    /// Builds the sinks named in `config` and attaches them to the fleet.
    pub fn new(config: &Config, coordinator: Arc<Coordinator>) -> Self {
        let datalog_writer = config.csv_data_logging.as_ref().map(|csv| {
            info!("  Creating CSV writer...");
            let writer = Arc::new(DatalogWriter::new(csv.clone()));
            coordinator.attach_all(writer.clone() as ObserverRef);
            writer
        });

        let websocket = config.websocket.as_ref().map(|ws| {
            info!("  Creating websocket...");
            let websocket = Arc::new(Websocket::new(ws.clone()));
            coordinator.attach_all(websocket.clone() as ObserverRef);
            websocket
        });

        let (database, scheduler) = match &config.sql_database {
            Some(sql) => {
                info!("  Creating SQL database...");
                let database = Arc::new(Database::new(sql.clone()));
                coordinator.attach_all(database.clone() as ObserverRef);
                let scheduler = Arc::new(Scheduler::new(sql, database.sender()));
                (Some(database), Some(scheduler))
            }
            None => (None, None),
        };

        let webhook = config.notifications.as_ref().map(|n| {
            info!("  Creating notifications...");
            let webhook = Arc::new(Webhook::new(n.url()));
            if n.grid_alerts() {
                coordinator.attach_to(
                    DeviceType::Inverter,
                    Arc::new(GridWatch::new(webhook.sender())),
                );
            }
            coordinator.attach_to(
                DeviceType::Battery,
                Arc::new(BatteryWatch::new(webhook.sender(), n.low_battery_threshold())),
            );
            webhook
        });

        Self {
            coordinator,
            datalog_writer,
            websocket,
            database,
            scheduler,
            webhook,
        }
    }

    pub fn spawn(&self) -> Vec<(&'static str, JoinHandle<()>)> {
        let mut handles = Vec::new();

        handles.push(("coordinator", spawn_logged("Coordinator", {
            let coordinator = self.coordinator.clone();
            async move { coordinator.start().await }
        })));

        if let Some(writer) = &self.datalog_writer {
            let writer = writer.clone();
            handles.push(("csv", spawn_logged("CSV writer", async move { writer.start().await })));
        }
        if let Some(websocket) = &self.websocket {
            let websocket = websocket.clone();
            handles.push(("websocket", spawn_logged("Websocket", async move { websocket.start().await })));
        }
        if let Some(database) = &self.database {
            let database = database.clone();
            handles.push(("database", spawn_logged("Database", async move { database.start().await })));
        }
        if let Some(scheduler) = &self.scheduler {
            let scheduler = scheduler.clone();
            handles.push(("scheduler", spawn_logged("Scheduler", async move { scheduler.start().await })));
        }
        if let Some(webhook) = &self.webhook {
            let webhook = webhook.clone();
            handles.push(("webhook", spawn_logged("Webhook", async move { webhook.start().await })));
        }

        handles
    }

    /// Devices first so no new snapshots arrive, then the sinks, which drain
    /// what is already queued.
    pub async fn stop(&self) {
        info!("Stopping all components...");

        self.coordinator.stop();
        self.coordinator.disconnect_all().await;

        if let Some(writer) = &self.datalog_writer {
            writer.stop();
        }
        if let Some(websocket) = &self.websocket {
            websocket.stop().await;
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.stop();
        }
        if let Some(database) = &self.database {
            database.stop();
        }
        if let Some(webhook) = &self.webhook {
            webhook.stop();
        }
    }
}

fn spawn_logged<F>(name: &'static str, task: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = task.await {
            error!("{} task failed: {}", name, e);
        }
    })
}

fn init_logging(loglevel: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(loglevel))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .init();
}

pub async fn app(mut shutdown_rx: tokio::sync::broadcast::Receiver<()>) -> Result<()> {
    let options = Options::new();

    let config = Config::new(options.config_file.clone());
    init_logging(config.as_ref().map(|c| c.loglevel()).unwrap_or("info"));

    info!("sunny-jim {} starting with config file {}", CARGO_PKG_VERSION, options.config_file);
    let config = config?;
    config.log_summary();

    info!("Initializing devices...");
    let mut coordinator = Coordinator::new(&config);
    coordinator.connect_devices().await;
    let coordinator = Arc::new(coordinator);

    info!("Initializing components...");
    let components = Components::new(&config, coordinator.clone());

    if let Some(websocket) = &components.websocket {
        websocket.bind().await?;
    }

    let handles = components.spawn();

    let runtime_limit = async {
        match options.runtime {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    info!("Waiting for shutdown signal...");
    tokio::select! {
        _ = shutdown_rx.recv() => info!("Shutdown signal received, stopping components..."),
        _ = runtime_limit => info!("Runtime limit reached, stopping components..."),
    }

    components.stop().await;

    for (name, handle) in handles {
        if let Err(e) = handle.await {
            error!("Error waiting for {} task: {}", name, e);
        }
    }

    if let Ok(stats) = coordinator.stats.lock() {
        stats.print_summary();
    }

    info!("Shutdown complete");
    Ok(())
}
