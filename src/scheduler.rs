use crate::prelude::*;
use crate::database;

use std::time::Duration;

/// Periodically asks the SQL sink to summarise raw rows older than the
/// retention window. The request goes through the sink's own queue so it is
/// serialised with inserts.
pub struct Scheduler {
    interval: Duration,
    retention: Duration,
    database: database::Sender,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(config: &config::SqlDatabase, database: database::Sender) -> Self {
        let (shutdown, _) = tokio::sync::watch::channel(false);

        Self {
            interval: config.summarise_interval(),
            retention: config.raw_retention(),
            database,
            shutdown,
        }
    }

    pub fn cutoff(&self) -> f64 {
        chrono::Utc::now().timestamp() as f64 - self.retention.as_secs_f64()
    }

    pub async fn start(&self) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }
        let mut interval = tokio::time::interval(self.interval);
        // the first tick completes immediately; nothing is old enough yet
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let cutoff = self.cutoff();
                    debug!("requesting summary of rows before {}", cutoff);
                    if self.database.send(database::ChannelData::Summarise(cutoff)).is_err() {
                        warn!("database has stopped, scheduler exiting");
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("scheduler exiting");
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn enqueues_summaries_on_interval() {
        let config = config::SqlDatabase {
            sql_driver: "sqlite".to_string(),
            database_path: "unused.db".to_string(),
            summarise_interval: Duration::from_secs(600),
            raw_retention: Duration::from_secs(3600),
        };
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let scheduler = std::sync::Arc::new(Scheduler::new(&config, sender));

        let task = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.start().await }
        });

        let before = chrono::Utc::now().timestamp() as f64 - 3600.0;
        tokio::time::sleep(Duration::from_secs(1201)).await;
        scheduler.stop();
        task.await.unwrap().unwrap();

        let mut cutoffs = Vec::new();
        while let Ok(database::ChannelData::Summarise(cutoff)) = receiver.try_recv() {
            cutoffs.push(cutoff);
        }
        assert_eq!(cutoffs.len(), 2);
        assert!(cutoffs.iter().all(|c| *c >= before - 1.0));
    }
}
