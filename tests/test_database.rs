mod common;
use common::*;

use sqlx::Row;
use sunny_jim::database::{self, Database};

fn sqlite(dir: &tempfile::TempDir) -> config::SqlDatabase {
    config::SqlDatabase {
        sql_driver: "sqlite".to_string(),
        database_path: dir.path().join("sunny_jim.db").display().to_string(),
        summarise_interval: Duration::from_secs(600),
        raw_retention: Duration::from_secs(3600),
    }
}

fn kodak() -> DeviceInfo {
    DeviceInfo {
        id: "kodak".to_string(),
        device_type: DeviceType::Inverter,
    }
}

fn dyness() -> DeviceInfo {
    DeviceInfo {
        id: "dyness".to_string(),
        device_type: DeviceType::Battery,
    }
}

fn inverter_schema() -> Schema {
    Factory::schema(&[
        ("time_updated", FieldKind::Float),
        ("load_power", FieldKind::Float),
        ("grid_state", FieldKind::Text),
    ])
}

fn battery_schema() -> Schema {
    Factory::schema(&[
        ("time_updated", FieldKind::Float),
        ("state_of_charge", FieldKind::Float),
    ])
}

fn inverter_row(t: f64, load: f64, grid: &str) -> Snapshot {
    Snapshot::new(
        inverter_schema(),
        vec![Value::Float(t), Value::Float(load), Value::Text(grid.to_string())],
    )
    .unwrap()
}

fn battery_row(t: f64, soc: f64) -> Snapshot {
    Snapshot::new(battery_schema(), vec![Value::Float(t), Value::Float(soc)]).unwrap()
}

#[tokio::test]
async fn devices_get_their_own_tables() -> Result<()> {
    common_setup();
    let dir = tempfile::tempdir()?;
    let db = Database::new(sqlite(&dir));
    db.connect().await?;

    db.insert(&kodak(), &inverter_row(100.0, 391.0, "on")).await?;
    db.insert(&kodak(), &inverter_row(101.0, 392.0, "on")).await?;
    db.insert(&dyness(), &battery_row(100.5, 0.87)).await?;

    let kodak_rows = db.last_entries("kodak", &inverter_schema(), 10).await?;
    assert_eq!(kodak_rows.len(), 2);
    // newest first
    assert_eq!(kodak_rows[0].get("load_power"), Some(&Value::Float(392.0)));

    let dyness_rows = db.last_entries("dyness", &battery_schema(), 10).await?;
    assert_eq!(dyness_rows.len(), 1);
    assert_eq!(dyness_rows[0].get("state_of_charge"), Some(&Value::Float(0.87)));

    let pool = db.connection()?;
    for name in ["device_kodak_combined", "device_dyness_combined"] {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'view' AND name = '{}'",
            name
        ))
        .fetch_one(&pool)
        .await?;
        assert_eq!(count, 1, "{} missing", name);
    }
    Ok(())
}

#[tokio::test]
async fn driver_variant_connects() -> Result<()> {
    common_setup();
    let dir = tempfile::tempdir()?;
    let db = Database::new(config::SqlDatabase {
        sql_driver: "sqlite+aiosqlite".to_string(),
        ..sqlite(&dir)
    });
    db.connect().await?;

    db.insert(&dyness(), &battery_row(100.0, 0.5)).await?;
    let rows = db.last_entries("dyness", &battery_schema(), 1).await?;
    assert_eq!(rows.len(), 1);
    Ok(())
}

#[tokio::test]
async fn summarise_folds_old_rows_into_minutes() -> Result<()> {
    common_setup();
    let dir = tempfile::tempdir()?;
    let db = Database::new(sqlite(&dir));
    db.connect().await?;

    // two buckets before the cutoff, one row after it
    for (t, load, grid) in [
        (6000.0, 100.0, "on"),
        (6010.0, 200.0, "on"),
        (6020.0, 300.0, "off"),
        (6065.0, 500.0, "on"),
        (9000.0, 1.0, "off"),
    ] {
        db.insert(&kodak(), &inverter_row(t, load, grid)).await?;
    }

    assert_eq!(db.summarise("kodak", &inverter_schema(), 7000.0).await?, 4);

    let raw = db.last_entries("kodak", &inverter_schema(), 10).await?;
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0].time_updated(), 9000.0);

    let pool = db.connection()?;
    let rows = sqlx::query(
        "SELECT load_power, load_power_std, grid_state FROM device_kodak_summary ORDER BY time_updated",
    )
    .fetch_all(&pool)
    .await?;
    assert_eq!(rows.len(), 2);

    assert_eq!(rows[0].try_get::<f64, _>(0)?, 200.0);
    assert_eq!(rows[0].try_get::<Option<f64>, _>(1)?, Some(100.0));
    assert_eq!(rows[0].try_get::<String, _>(2)?, "off");

    assert_eq!(rows[1].try_get::<f64, _>(0)?, 500.0);
    assert_eq!(rows[1].try_get::<Option<f64>, _>(1)?, None);
    assert_eq!(rows[1].try_get::<String, _>(2)?, "on");

    // the combined view still sees the on reading that was summarised away
    assert_eq!(db.grid_last_on("kodak").await?, Some(6065.0));

    // nothing left to fold
    assert_eq!(db.summarise("kodak", &inverter_schema(), 7000.0).await?, 0);
    Ok(())
}

#[tokio::test]
async fn grid_never_on() -> Result<()> {
    common_setup();
    let dir = tempfile::tempdir()?;
    let db = Database::new(sqlite(&dir));
    db.connect().await?;

    db.insert(&kodak(), &inverter_row(100.0, 391.0, "off")).await?;
    assert_eq!(db.grid_last_on("kodak").await?, None);
    Ok(())
}

#[tokio::test]
async fn last_minutes_covers_recent_rows() -> Result<()> {
    common_setup();
    let dir = tempfile::tempdir()?;
    let db = Database::new(sqlite(&dir));
    db.connect().await?;

    let now = chrono::Utc::now().timestamp() as f64;
    db.insert(&dyness(), &battery_row(now - 7200.0, 0.5)).await?;
    db.insert(&dyness(), &battery_row(now - 30.0, 0.6)).await?;

    let recent = db.last_minutes("dyness", &battery_schema(), 5).await?;
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].get("state_of_charge"), Some(&Value::Float(0.6)));
    Ok(())
}

#[tokio::test]
async fn observer_rows_are_written_by_the_sink() -> Result<()> {
    common_setup();
    let dir = tempfile::tempdir()?;
    let db = Arc::new(Database::new(sqlite(&dir)));

    let task = tokio::spawn({
        let db = db.clone();
        async move { db.start().await }
    });

    db.update(&dyness(), &battery_row(100.0, 0.5)).await;
    db.update(&dyness(), &battery_row(101.0, 0.6)).await;
    db.sender().send(database::ChannelData::Summarise(0.0))?;
    db.stop();
    task.await??;

    let reader = Database::new(sqlite(&dir));
    reader.connect().await?;
    let rows = reader.last_entries("dyness", &battery_schema(), 10).await?;
    assert_eq!(rows.len(), 2);
    Ok(())
}
