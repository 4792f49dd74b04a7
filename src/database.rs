use crate::prelude::*;
use crate::snapshot::TIME_UPDATED;

use async_trait::async_trait;
use sqlx::{any::AnyPoolOptions, any::AnyRow, Any, Pool, Row};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug, Clone)]
pub enum ChannelData {
    Insert(DeviceInfo, Snapshot),
    /// Fold raw rows with `time_updated` at or before this time into the
    /// summary tables.
    Summarise(f64),
    Shutdown,
}

pub type Sender = mpsc::UnboundedSender<ChannelData>;
pub type Receiver = mpsc::UnboundedReceiver<ChannelData>;

const SECONDS_PER_BUCKET: f64 = 60.0;
const STD_SUFFIX: &str = "_std";

#[derive(Clone, Copy, Debug, PartialEq)]
enum DatabaseType {
    MySQL,
    Postgres,
    SQLite,
}

impl DatabaseType {
    fn quote(&self, identifier: &str) -> String {
        match self {
            DatabaseType::MySQL => format!("`{}`", identifier.replace('`', "``")),
            _ => format!("\"{}\"", identifier.replace('"', "\"\"")),
        }
    }

    fn placeholders(&self, count: usize) -> String {
        (1..=count)
            .map(|i| match self {
                DatabaseType::MySQL => "?".to_string(),
                _ => format!("${}", i),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn column_type(&self, kind: FieldKind) -> &'static str {
        match (self, kind) {
            (DatabaseType::SQLite, FieldKind::Float) => "REAL",
            (DatabaseType::MySQL, FieldKind::Float) => "DOUBLE",
            (DatabaseType::Postgres, FieldKind::Float) => "DOUBLE PRECISION",
            (_, FieldKind::Text) => "TEXT",
        }
    }

    fn id_column(&self) -> &'static str {
        match self {
            DatabaseType::SQLite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
            DatabaseType::MySQL => "id BIGINT AUTO_INCREMENT PRIMARY KEY",
            DatabaseType::Postgres => "id BIGSERIAL PRIMARY KEY",
        }
    }

    fn create_view(&self) -> &'static str {
        match self {
            DatabaseType::SQLite => "CREATE VIEW IF NOT EXISTS",
            _ => "CREATE OR REPLACE VIEW",
        }
    }
}

pub fn table_name(device_id: &str) -> String {
    format!("device_{}", device_id)
}

pub fn summary_table_name(device_id: &str) -> String {
    format!("device_{}_summary", device_id)
}

pub fn view_name(device_id: &str) -> String {
    format!("device_{}_combined", device_id)
}

/// Summary tables carry a standard deviation next to every float field
/// except the timestamp.
fn has_std(field: &Field) -> bool {
    field.kind == FieldKind::Float && field.name != TIME_UPDATED
}

// {{{ Bucket
/// Per-minute aggregate of raw rows.
struct Bucket {
    rows: Vec<Vec<Value>>,
}

impl Bucket {
    fn time_index(schema: &Schema) -> Option<usize> {
        schema.iter().position(|f| f.name == TIME_UPDATED)
    }

    /// Summary row values in summary column order: schema fields, then the
    /// std columns.
    fn summarise(&self, schema: &Schema) -> Vec<Option<Value>> {
        let t = Self::time_index(schema).unwrap_or(0);
        let latest = self
            .rows
            .iter()
            .max_by(|a, b| {
                let ta = a[t].as_f64().unwrap_or_default();
                let tb = b[t].as_f64().unwrap_or_default();
                ta.total_cmp(&tb)
            });

        let mut values = Vec::with_capacity(schema.len() * 2);
        let mut stds = Vec::new();

        for (i, field) in schema.iter().enumerate() {
            match field.kind {
                FieldKind::Float => {
                    let xs: Vec<f64> = self.rows.iter().filter_map(|r| r[i].as_f64()).collect();
                    let (mean, std) = mean_and_std(&xs);
                    values.push(Some(Value::Float(mean)));
                    if has_std(field) {
                        stds.push(std.map(Value::Float));
                    }
                }
                FieldKind::Text => {
                    values.push(latest.map(|r| r[i].clone()));
                }
            }
        }

        values.extend(stds);
        values
    }
}

/// Mean and sample standard deviation. No deviation for fewer than two
/// values.
fn mean_and_std(xs: &[f64]) -> (f64, Option<f64>) {
    if xs.is_empty() {
        return (0.0, None);
    }
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    if xs.len() < 2 {
        return (mean, None);
    }
    let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, Some(var.sqrt()))
} // }}}

/// SQL sink. Each device gets its own raw table, summary table and a view
/// over both, created the first time a snapshot from it arrives.
pub struct Database {
    config: config::SqlDatabase,
    sender: Sender,
    receiver: Mutex<Option<Receiver>>,
    pool: Arc<RwLock<Option<Pool<Any>>>>,
    tables: tokio::sync::Mutex<HashMap<String, Schema>>,
}

impl Database {
    pub fn new(config: config::SqlDatabase) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        Self {
            config,
            sender,
            receiver: Mutex::new(Some(receiver)),
            pool: Arc::new(RwLock::new(None)),
            tables: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    pub async fn start(&self) -> Result<()> {
        info!("initializing database");

        let receiver = self
            .receiver
            .lock()
            .map_err(|_| anyhow!("database receiver lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("database already started"))?;

        self.connect().await?;
        self.inserter(receiver).await?;

        if let Ok(pool) = self.connection() {
            pool.close().await;
        }
        info!("database loop exiting");

        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.sender.send(ChannelData::Shutdown);
    }

    fn database(&self) -> Result<DatabaseType> {
        match self.config.scheme() {
            "sqlite" => Ok(DatabaseType::SQLite),
            "mysql" => Ok(DatabaseType::MySQL),
            "postgres" | "postgresql" => Ok(DatabaseType::Postgres),
            _ => Err(anyhow!("database.rs:unsupported database {}", self.config.sql_driver)),
        }
    }

    pub async fn connect(&self) -> Result<()> {
        sqlx::any::install_default_drivers();

        let url = self.config.connection_string();
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(&url)
            .await
            .map_err(|e| anyhow!("database.rs:failed to connect to {}: {}", url, e))?;

        *self
            .pool
            .write()
            .map_err(|_| anyhow!("Failed to acquire write lock"))? = Some(pool);
        Ok(())
    }

    pub fn connection(&self) -> Result<Pool<Any>> {
        match &*self
            .pool
            .read()
            .map_err(|_| anyhow!("Failed to acquire read lock"))?
        {
            Some(pool) => Ok(pool.clone()),
            None => Err(anyhow!("database.rs:Database not connected")),
        }
    }

    async fn inserter(&self, mut receiver: Receiver) -> Result<()> {
        while let Some(message) = receiver.recv().await {
            use ChannelData::*;

            match message {
                Shutdown => break,
                Insert(device, snapshot) => {
                    let mut retry_count = 0;
                    let max_retries = 3;
                    let mut backoff = 1;

                    while retry_count < max_retries {
                        match self.insert(&device, &snapshot).await {
                            Ok(_) => break,
                            Err(err) => {
                                error!("{}: INSERT failed: {:?} - retrying in {}s", device.id, err, backoff);
                                tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
                                retry_count += 1;
                                backoff *= 2;
                            }
                        }
                    }

                    if retry_count == max_retries {
                        error!("{}: failed to insert row after {} retries", device.id, max_retries);
                    }
                }
                Summarise(cutoff) => {
                    if let Err(err) = self.summarise_all(cutoff).await {
                        error!("summarise failed: {:?}", err);
                    }
                }
            }
        }

        Ok(())
    }

    // {{{ Schema
    async fn ensure_tables(&self, device: &DeviceInfo, schema: &Schema) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if tables.contains_key(&device.id) {
            return Ok(());
        }

        let db = self.database()?;
        let pool = self.connection()?;

        let columns: Vec<String> = schema
            .iter()
            .map(|f| format!("{} {}", db.quote(&f.name), db.column_type(f.kind)))
            .collect();
        let std_columns: Vec<String> = schema
            .iter()
            .filter(|f| has_std(f))
            .map(|f| {
                format!(
                    "{} {}",
                    db.quote(&format!("{}{}", f.name, STD_SUFFIX)),
                    db.column_type(FieldKind::Float)
                )
            })
            .collect();

        let raw = format!(
            "CREATE TABLE IF NOT EXISTS {} ({}, {})",
            db.quote(&table_name(&device.id)),
            db.id_column(),
            columns.join(", ")
        );
        let summary = format!(
            "CREATE TABLE IF NOT EXISTS {} ({}, {}, {})",
            db.quote(&summary_table_name(&device.id)),
            db.id_column(),
            columns.join(", "),
            std_columns.join(", ")
        );

        let selection = Self::selection(db, schema);
        let view = format!(
            "{} {} AS SELECT {} FROM {} UNION ALL SELECT {} FROM {}",
            db.create_view(),
            db.quote(&view_name(&device.id)),
            selection,
            db.quote(&table_name(&device.id)),
            selection,
            db.quote(&summary_table_name(&device.id)),
        );

        for statement in [raw, summary, view] {
            debug!("{}: {}", device.id, statement);
            sqlx::query(&statement).execute(&pool).await?;
        }

        info!("{}: tables ready", device.id);
        tables.insert(device.id.clone(), schema.clone());
        Ok(())
    }

    fn selection(db: DatabaseType, schema: &Schema) -> String {
        schema
            .iter()
            .map(|f| db.quote(&f.name))
            .collect::<Vec<_>>()
            .join(", ")
    } // }}}

    pub async fn insert(&self, device: &DeviceInfo, snapshot: &Snapshot) -> Result<()> {
        self.ensure_tables(device, snapshot.schema()).await?;

        let db = self.database()?;
        let pool = self.connection()?;

        let statement = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            db.quote(&table_name(&device.id)),
            Self::selection(db, snapshot.schema()),
            db.placeholders(snapshot.values().len())
        );

        let mut query = sqlx::query(&statement);
        for value in snapshot.values() {
            query = match value {
                Value::Float(v) => query.bind(*v),
                Value::Text(s) => query.bind(s.clone()),
            };
        }
        query.execute(&pool).await?;

        Ok(())
    }

    async fn summarise_all(&self, cutoff: f64) -> Result<()> {
        let tables: Vec<(String, Schema)> = self
            .tables
            .lock()
            .await
            .iter()
            .map(|(id, schema)| (id.clone(), schema.clone()))
            .collect();

        for (id, schema) in tables {
            match self.summarise(&id, &schema, cutoff).await {
                Ok(0) => {}
                Ok(n) => info!("{}: summarised {} raw rows", id, n),
                Err(e) => error!("{}: summarise failed: {}", id, e),
            }
        }
        Ok(())
    }

    /// Folds raw rows up to `cutoff` into per-minute summary rows and deletes
    /// them, all in one transaction. Returns how many raw rows went.
    pub async fn summarise(&self, device_id: &str, schema: &Schema, cutoff: f64) -> Result<usize> {
        let db = self.database()?;
        let pool = self.connection()?;
        let raw_table = db.quote(&table_name(device_id));
        let time = db.quote(TIME_UPDATED);

        let mut tx = pool.begin().await?;

        let select = format!(
            "SELECT {} FROM {} WHERE {} <= {} ORDER BY {}",
            Self::selection(db, schema),
            raw_table,
            time,
            db.placeholders(1),
            time
        );
        let rows = sqlx::query(&select).bind(cutoff).fetch_all(&mut *tx).await?;
        if rows.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        let t = Bucket::time_index(schema).ok_or_else(|| anyhow!("schema has no {}", TIME_UPDATED))?;
        let mut buckets: BTreeMap<i64, Bucket> = BTreeMap::new();
        for row in &rows {
            let values = Self::row_values(row, schema)?;
            let key = (values[t].as_f64().unwrap_or_default() / SECONDS_PER_BUCKET).floor() as i64;
            buckets
                .entry(key)
                .or_insert_with(|| Bucket { rows: Vec::new() })
                .rows
                .push(values);
        }

        let mut columns: Vec<String> = schema.iter().map(|f| db.quote(&f.name)).collect();
        columns.extend(
            schema
                .iter()
                .filter(|f| has_std(f))
                .map(|f| db.quote(&format!("{}{}", f.name, STD_SUFFIX))),
        );
        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            db.quote(&summary_table_name(device_id)),
            columns.join(", "),
            db.placeholders(columns.len())
        );

        for bucket in buckets.values() {
            let mut query = sqlx::query(&insert);
            for value in bucket.summarise(schema) {
                query = match value {
                    Some(Value::Float(v)) => query.bind(v),
                    Some(Value::Text(s)) => query.bind(s),
                    None => query.bind(None::<f64>),
                };
            }
            query.execute(&mut *tx).await?;
        }

        let delete = format!("DELETE FROM {} WHERE {} <= {}", raw_table, time, db.placeholders(1));
        sqlx::query(&delete).bind(cutoff).execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(rows.len())
    }

    fn row_values(row: &AnyRow, schema: &Schema) -> Result<Vec<Value>> {
        schema
            .iter()
            .enumerate()
            .map(|(i, field)| {
                Ok(match field.kind {
                    FieldKind::Float => Value::Float(row.try_get::<f64, _>(i)?),
                    FieldKind::Text => Value::Text(row.try_get::<String, _>(i)?),
                })
            })
            .collect()
    }

    // {{{ Queries
    /// The newest `n` raw rows, newest first.
    pub async fn last_entries(&self, device_id: &str, schema: &Schema, n: usize) -> Result<Vec<Snapshot>> {
        let db = self.database()?;
        let pool = self.connection()?;

        let query = format!(
            "SELECT {} FROM {} ORDER BY {} DESC LIMIT {}",
            Self::selection(db, schema),
            db.quote(&table_name(device_id)),
            db.quote(TIME_UPDATED),
            n
        );

        sqlx::query(&query)
            .fetch_all(&pool)
            .await?
            .iter()
            .map(|row| {
                let values = Self::row_values(row, schema)?;
                Snapshot::new(schema.clone(), values).ok_or_else(|| anyhow!("row does not match schema"))
            })
            .collect()
    }

    /// Raw and summarised rows from the last `minutes` minutes, oldest first.
    pub async fn last_minutes(&self, device_id: &str, schema: &Schema, minutes: u32) -> Result<Vec<Snapshot>> {
        let db = self.database()?;
        let pool = self.connection()?;
        let since = chrono::Utc::now().timestamp() as f64 - minutes as f64 * 60.0;

        let query = format!(
            "SELECT {} FROM {} WHERE {} >= {} ORDER BY {}",
            Self::selection(db, schema),
            db.quote(&view_name(device_id)),
            db.quote(TIME_UPDATED),
            db.placeholders(1),
            db.quote(TIME_UPDATED)
        );

        sqlx::query(&query)
            .bind(since)
            .fetch_all(&pool)
            .await?
            .iter()
            .map(|row| {
                let values = Self::row_values(row, schema)?;
                Snapshot::new(schema.clone(), values).ok_or_else(|| anyhow!("row does not match schema"))
            })
            .collect()
    }

    /// Latest `time_updated` at which the device reported the grid as on.
    pub async fn grid_last_on(&self, device_id: &str) -> Result<Option<f64>> {
        let db = self.database()?;
        let pool = self.connection()?;

        let query = format!(
            "SELECT MAX({}) FROM {} WHERE {} = 'on'",
            db.quote(TIME_UPDATED),
            db.quote(&view_name(device_id)),
            db.quote("grid_state")
        );

        Ok(sqlx::query_scalar::<_, Option<f64>>(&query)
            .fetch_one(&pool)
            .await?)
    } // }}}
}

#[async_trait]
impl Observer for Database {
    async fn update(&self, device: &DeviceInfo, snapshot: &Snapshot) {
        if self
            .sender
            .send(ChannelData::Insert(device.clone(), snapshot.clone()))
            .is_err()
        {
            warn!("{}: database has stopped, dropping row", device.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_std() {
        assert_eq!(mean_and_std(&[1.0]), (1.0, None));
        let (mean, std) = mean_and_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_eq!(mean, 5.0);
        assert!((std.unwrap() - 2.138089935299395).abs() < 1e-12);
    }

    #[test]
    fn quoting() {
        assert_eq!(DatabaseType::SQLite.quote("device_a\"b"), "\"device_a\"\"b\"");
        assert_eq!(DatabaseType::MySQL.quote("device_x"), "`device_x`");
        assert_eq!(DatabaseType::Postgres.placeholders(3), "$1, $2, $3");
        assert_eq!(DatabaseType::MySQL.placeholders(2), "?, ?");
    }

    #[test]
    fn bucket_summary_layout() {
        let schema: Schema = vec![Field::float(TIME_UPDATED), Field::float("load_power"), Field::text("grid_state")].into();
        let bucket = Bucket {
            rows: vec![
                vec![Value::Float(61.0), Value::Float(100.0), Value::Text("on".into())],
                vec![Value::Float(65.0), Value::Float(300.0), Value::Text("off".into())],
            ],
        };

        let values = bucket.summarise(&schema);
        assert_eq!(
            values[..3],
            [
                Some(Value::Float(63.0)),
                Some(Value::Float(200.0)),
                Some(Value::Text("off".into()))
            ]
        );
        assert_eq!(values.len(), 4);
        assert!((values[3].as_ref().unwrap().as_f64().unwrap() - 141.4213562373095).abs() < 1e-9);
    }
}
