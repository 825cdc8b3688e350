use crate::error::StoreError;
use crate::sample::{format_timestamp, Sample, TIMESTAMP_FORMAT};
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use rusqlite::{params, params_from_iter, Connection, Row};
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};

/// Where the collector writes finished samples.
pub trait SampleSink: Send + Sync + 'static {
    fn append(&self, sample: Sample) -> impl Future<Output = Result<(), StoreError>> + Send;
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyUsage {
    pub date: String,
    pub mb: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataUsage {
    pub total_mb: f64,
    pub test_count: u64,
    pub daily: Vec<DailyUsage>,
}

#[derive(Debug)]
pub enum StoreCommand {
    Append {
        sample: Sample,
        respond_to: oneshot::Sender<Result<(), StoreError>>,
    },
    Query {
        since: Option<NaiveDateTime>,
        provider: Option<String>,
        respond_to: oneshot::Sender<Result<Vec<Sample>, StoreError>>,
    },
    Providers {
        respond_to: oneshot::Sender<Result<BTreeSet<String>, StoreError>>,
    },
    Usage {
        daily_since: NaiveDateTime,
        respond_to: oneshot::Sender<Result<DataUsage, StoreError>>,
    },
}

/// Append-only SQLite sample store. All access goes through one writer thread.
#[derive(Clone)]
pub struct SampleStore {
    tx: mpsc::UnboundedSender<StoreCommand>,
}

impl SampleStore {
    pub async fn append(&self, sample: Sample) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(StoreCommand::Append {
            sample,
            respond_to: tx,
        })?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Samples at or after `since` (all when `None`), optionally limited to one
    /// provider, oldest first.
    pub async fn query(
        &self,
        since: Option<NaiveDateTime>,
        provider: Option<String>,
    ) -> Result<Vec<Sample>, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(StoreCommand::Query {
            since,
            provider,
            respond_to: tx,
        })?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    pub async fn list_providers(&self) -> Result<BTreeSet<String>, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(StoreCommand::Providers { respond_to: tx })?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    pub async fn usage(&self, daily_since: NaiveDateTime) -> Result<DataUsage, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(StoreCommand::Usage {
            daily_since,
            respond_to: tx,
        })?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    fn send(&self, cmd: StoreCommand) -> Result<(), StoreError> {
        self.tx.send(cmd).map_err(|_| StoreError::Closed)
    }
}

impl SampleSink for SampleStore {
    fn append(&self, sample: Sample) -> impl Future<Output = Result<(), StoreError>> + Send {
        SampleStore::append(self, sample)
    }
}

pub fn spawn_store_thread(db_path: PathBuf) -> Result<SampleStore> {
    let conn = open_database(&db_path)
        .with_context(|| format!("failed to open sample store {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "sample store ready");

    let (tx, mut rx) = mpsc::unbounded_channel::<StoreCommand>();
    std::thread::Builder::new()
        .name("sample-store".to_string())
        .spawn(move || {
            run_store_thread(conn, &mut rx);
            tracing::info!("sample store thread exiting");
        })
        .context("failed to spawn sample store thread")?;

    Ok(SampleStore { tx })
}

fn open_database(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
        tracing::warn!(error = %err, "failed to enable WAL mode");
    }
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            ping_avg REAL,
            download_mbps REAL,
            upload_mbps REAL,
            jitter REAL,
            packet_loss REAL,
            provider TEXT,
            data_consumed_mb REAL
        );
        CREATE INDEX IF NOT EXISTS idx_metrics_timestamp ON metrics (timestamp);
        CREATE INDEX IF NOT EXISTS idx_metrics_provider_timestamp ON metrics (provider, timestamp);
        "#,
    )
}

fn run_store_thread(conn: Connection, rx: &mut mpsc::UnboundedReceiver<StoreCommand>) {
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            StoreCommand::Append { sample, respond_to } => {
                let _ = respond_to.send(insert_sample(&conn, &sample));
            }
            StoreCommand::Query {
                since,
                provider,
                respond_to,
            } => {
                let _ = respond_to.send(query_samples(&conn, since, provider.as_deref()));
            }
            StoreCommand::Providers { respond_to } => {
                let _ = respond_to.send(list_providers(&conn));
            }
            StoreCommand::Usage {
                daily_since,
                respond_to,
            } => {
                let _ = respond_to.send(data_usage(&conn, daily_since));
            }
        }
    }
}

fn insert_sample(conn: &Connection, sample: &Sample) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO metrics (timestamp, ping_avg, download_mbps, upload_mbps, jitter, packet_loss, provider, data_consumed_mb)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            format_timestamp(&sample.timestamp),
            sample.ping_avg,
            sample.download_mbps,
            sample.upload_mbps,
            sample.jitter_ms,
            sample.packet_loss_pct,
            sample.provider,
            sample.data_consumed_mb,
        ],
    )?;
    Ok(())
}

fn query_samples(
    conn: &Connection,
    since: Option<NaiveDateTime>,
    provider: Option<&str>,
) -> Result<Vec<Sample>, StoreError> {
    let mut sql = String::from(
        "SELECT timestamp, ping_avg, download_mbps, upload_mbps, jitter, packet_loss, provider, data_consumed_mb
         FROM metrics WHERE 1 = 1",
    );
    let mut args: Vec<String> = Vec::new();
    if let Some(since) = since {
        args.push(format_timestamp(&since));
        sql.push_str(&format!(" AND timestamp >= ?{}", args.len()));
    }
    if let Some(provider) = provider {
        args.push(provider.to_string());
        sql.push_str(&format!(" AND provider = ?{}", args.len()));
    }
    sql.push_str(" ORDER BY timestamp ASC, id ASC");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), read_row)?;

    let mut out = Vec::new();
    for row in rows {
        match row? {
            Ok(sample) => out.push(sample),
            Err(err) => tracing::warn!(error = %err, "skipping unreadable metrics row"),
        }
    }
    Ok(out)
}

type RowResult = std::result::Result<Sample, StoreError>;

fn read_row(row: &Row<'_>) -> rusqlite::Result<RowResult> {
    let raw_ts: String = row.get(0)?;
    let ping: Option<f64> = row.get(1)?;
    let Ok(timestamp) = NaiveDateTime::parse_from_str(&raw_ts, TIMESTAMP_FORMAT) else {
        return Ok(Err(StoreError::Corrupt(format!("bad timestamp '{raw_ts}'"))));
    };
    let Some(ping_avg) = ping else {
        return Ok(Err(StoreError::Corrupt(format!("row at {raw_ts} has no ping"))));
    };
    Ok(Ok(Sample {
        timestamp,
        ping_avg,
        download_mbps: row.get(2)?,
        upload_mbps: row.get(3)?,
        jitter_ms: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
        packet_loss_pct: row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
        provider: row.get(6)?,
        data_consumed_mb: row.get::<_, Option<f64>>(7)?.unwrap_or(0.0),
    }))
}

fn list_providers(conn: &Connection) -> Result<BTreeSet<String>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT provider FROM metrics WHERE provider IS NOT NULL ORDER BY provider",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut out = BTreeSet::new();
    for row in rows {
        out.insert(row?);
    }
    Ok(out)
}

fn data_usage(conn: &Connection, daily_since: NaiveDateTime) -> Result<DataUsage, StoreError> {
    let total_mb: Option<f64> = conn.query_row(
        "SELECT SUM(data_consumed_mb) FROM metrics WHERE data_consumed_mb IS NOT NULL",
        [],
        |row| row.get(0),
    )?;
    let test_count: i64 = conn.query_row("SELECT COUNT(*) FROM metrics", [], |row| row.get(0))?;

    let mut stmt = conn.prepare(
        "SELECT substr(timestamp, 1, 10) AS day, SUM(data_consumed_mb)
         FROM metrics
         WHERE data_consumed_mb IS NOT NULL AND timestamp >= ?1
         GROUP BY day
         ORDER BY day DESC",
    )?;
    let rows = stmt.query_map(params![format_timestamp(&daily_since)], |row| {
        Ok(DailyUsage {
            date: row.get(0)?,
            mb: row.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
        })
    })?;
    let mut daily = Vec::new();
    for row in rows {
        daily.push(row?);
    }

    Ok(DataUsage {
        total_mb: total_mb.unwrap_or(0.0),
        test_count: u64::try_from(test_count).unwrap_or(0),
        daily,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_at;
    use tempfile::TempDir;

    fn ts(raw: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).unwrap()
    }

    #[tokio::test]
    async fn appended_sample_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = spawn_store_thread(dir.path().join("internet.db")).unwrap();

        let sample = Sample {
            timestamp: ts("2026-10-18 09:30:00"),
            ping_avg: 13.377,
            download_mbps: Some(287.123456789),
            upload_mbps: None,
            jitter_ms: 0.75,
            packet_loss_pct: 0.1,
            provider: Some("Vivo Fibra".to_string()),
            data_consumed_mb: 412.5,
        };
        store.append(sample.clone()).await.unwrap();

        let rows = store.query(Some(ts("2026-10-18 09:00:00")), None).await.unwrap();
        assert_eq!(rows, vec![sample]);
    }

    #[tokio::test]
    async fn query_filters_by_range_and_provider_in_order() {
        let dir = TempDir::new().unwrap();
        let store = spawn_store_thread(dir.path().join("internet.db")).unwrap();

        store.append(sample_at("2026-10-18 11:00:00", Some("B"))).await.unwrap();
        store.append(sample_at("2026-10-18 08:00:00", Some("A"))).await.unwrap();
        store.append(sample_at("2026-10-18 10:00:00", Some("A"))).await.unwrap();
        store.append(sample_at("2026-10-18 12:00:00", None)).await.unwrap();

        let all = store.query(None, None).await.unwrap();
        let stamps: Vec<String> = all.iter().map(|s| format_timestamp(&s.timestamp)).collect();
        assert_eq!(
            stamps,
            vec![
                "2026-10-18 08:00:00",
                "2026-10-18 10:00:00",
                "2026-10-18 11:00:00",
                "2026-10-18 12:00:00"
            ]
        );

        let recent_a = store
            .query(Some(ts("2026-10-18 09:00:00")), Some("A".to_string()))
            .await
            .unwrap();
        assert_eq!(recent_a.len(), 1);
        assert_eq!(format_timestamp(&recent_a[0].timestamp), "2026-10-18 10:00:00");

        let providers = store.list_providers().await.unwrap();
        assert_eq!(providers.into_iter().collect::<Vec<_>>(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn usage_totals_and_daily_breakdown() {
        let dir = TempDir::new().unwrap();
        let store = spawn_store_thread(dir.path().join("internet.db")).unwrap();

        for raw in ["2026-09-01 10:00:00", "2026-10-17 10:00:00", "2026-10-18 10:00:00", "2026-10-18 11:00:00"] {
            store.append(sample_at(raw, Some("A"))).await.unwrap();
        }

        let usage = store.usage(ts("2026-09-18 12:00:00")).await.unwrap();
        assert_eq!(usage.test_count, 4);
        assert_eq!(usage.total_mb, 400.0);
        assert_eq!(usage.daily.len(), 2);
        assert_eq!(usage.daily[0].date, "2026-10-18");
        assert_eq!(usage.daily[0].mb, 200.0);
        assert_eq!(usage.daily[1].date, "2026-10-17");
    }

    #[test]
    fn unusable_parent_directory_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let err = open_database(&blocker.join("internet.db")).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)), "got {err:?}");
        assert!(spawn_store_thread(blocker.join("internet.db")).is_err());
    }

    #[tokio::test]
    async fn reopening_keeps_existing_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data").join("internet.db");
        let store = spawn_store_thread(path.clone()).unwrap();
        store.append(sample_at("2026-10-18 10:00:00", Some("A"))).await.unwrap();
        drop(store);

        let reopened = spawn_store_thread(path).unwrap();
        assert_eq!(reopened.query(None, None).await.unwrap().len(), 1);
    }
}
