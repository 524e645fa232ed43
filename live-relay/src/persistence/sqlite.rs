//! SQLite repository.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use super::models::{ConsumerRow, ProducerRow, StreamRow, TransitionRow};
use super::repository::StreamRepository;
use crate::config::PersistenceConfig;
use crate::domain::{Consumer, Producer, Stream, TransitionRecord};
use crate::Result;

const BUSY_TIMEOUT_MS: u64 = 30_000;

/// Open a WAL-mode pool and apply the embedded migrations.
pub async fn init_pool(config: &PersistenceConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await?;

    let mode: String = sqlx::query("PRAGMA journal_mode")
        .fetch_one(&pool)
        .await?
        .get(0);
    if mode != "wal" && mode != "memory" {
        warn!(journal_mode = %mode, "SQLite is not in WAL mode");
    }

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!(
        max_connections = config.max_connections,
        "Database pool initialized"
    );
    Ok(pool)
}

pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &PersistenceConfig) -> Result<Self> {
        Ok(Self::new(init_pool(config).await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn list_producers(&self, stream_id: &str) -> Result<Vec<Producer>> {
        sqlx::query_as::<_, ProducerRow>(
            "SELECT * FROM producers WHERE stream_id = ? ORDER BY created_at",
        )
        .bind(stream_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ProducerRow::into_domain)
        .collect()
    }

    pub async fn list_consumers(&self, stream_id: &str) -> Result<Vec<Consumer>> {
        sqlx::query_as::<_, ConsumerRow>(
            "SELECT * FROM consumers WHERE stream_id = ? ORDER BY created_at",
        )
        .bind(stream_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ConsumerRow::into_domain)
        .collect()
    }
}

#[async_trait]
impl StreamRepository for SqliteRepository {
    async fn upsert_stream(&self, stream: &Stream) -> Result<()> {
        let row = StreamRow::from_domain(stream)?;
        sqlx::query(
            r#"
            INSERT INTO streams (id, name, source, state, codec_params, last_fault,
                                 created_at, updated_at, started_at, stopped_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                state = excluded.state,
                codec_params = excluded.codec_params,
                last_fault = excluded.last_fault,
                updated_at = excluded.updated_at,
                started_at = excluded.started_at,
                stopped_at = excluded.stopped_at
            "#,
        )
        .bind(&row.id)
        .bind(&row.name)
        .bind(&row.source)
        .bind(&row.state)
        .bind(&row.codec_params)
        .bind(&row.last_fault)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(row.started_at)
        .bind(row.stopped_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_producer(&self, producer: &Producer) -> Result<()> {
        let row = ProducerRow::from_domain(producer)?;
        sqlx::query(
            r#"
            INSERT INTO producers (id, stream_id, ingress_id, ssrc, state, rtp_parameters,
                                   created_at, closed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                rtp_parameters = excluded.rtp_parameters,
                closed_at = excluded.closed_at
            "#,
        )
        .bind(&row.id)
        .bind(&row.stream_id)
        .bind(&row.ingress_id)
        .bind(row.ssrc)
        .bind(&row.state)
        .bind(&row.rtp_parameters)
        .bind(row.created_at)
        .bind(row.closed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_consumer(&self, consumer: &Consumer) -> Result<()> {
        let row = ConsumerRow::from_domain(consumer);
        sqlx::query(
            r#"
            INSERT INTO consumers (id, stream_id, producer_id, session_id, client_tag, state,
                                   created_at, last_seen_at, closed_at, close_reason)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                last_seen_at = excluded.last_seen_at,
                closed_at = excluded.closed_at,
                close_reason = excluded.close_reason
            "#,
        )
        .bind(&row.id)
        .bind(&row.stream_id)
        .bind(&row.producer_id)
        .bind(&row.session_id)
        .bind(&row.client_tag)
        .bind(&row.state)
        .bind(row.created_at)
        .bind(row.last_seen_at)
        .bind(row.closed_at)
        .bind(&row.close_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_transition(&self, record: &TransitionRecord) -> Result<()> {
        let row = TransitionRow::from_domain(record);
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO stream_transitions
                (stream_id, seq, from_state, to_state, reason, detail, at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.stream_id)
        .bind(row.seq)
        .bind(&row.from_state)
        .bind(&row.to_state)
        .bind(&row.reason)
        .bind(&row.detail)
        .bind(row.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_transitions(&self, stream_id: &str) -> Result<Vec<TransitionRecord>> {
        sqlx::query_as::<_, TransitionRow>(
            "SELECT * FROM stream_transitions WHERE stream_id = ? ORDER BY seq",
        )
        .bind(stream_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(TransitionRow::into_domain)
        .collect()
    }

    async fn get_stream(&self, stream_id: &str) -> Result<Option<Stream>> {
        sqlx::query_as::<_, StreamRow>("SELECT * FROM streams WHERE id = ?")
            .bind(stream_id)
            .fetch_optional(&self.pool)
            .await?
            .map(StreamRow::into_domain)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ReasonCode, SourceDescriptor, StreamState};

    async fn repository(dir: &tempfile::TempDir) -> SqliteRepository {
        let config = PersistenceConfig {
            database_url: format!("sqlite:{}?mode=rwc", dir.path().join("relay.db").display()),
            ..Default::default()
        };
        SqliteRepository::connect(&config).await.unwrap()
    }

    #[tokio::test]
    async fn test_stream_and_transitions_persist() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repository(&dir).await;

        let (mut stream, created) =
            Stream::create("cam", SourceDescriptor::parse("rtsp://cam1/live").unwrap());
        repo.upsert_stream(&stream).await.unwrap();
        repo.append_transition(&created).await.unwrap();

        let ready = stream
            .apply(StreamState::Ready, ReasonCode::SourceIdentified, None, 1)
            .unwrap();
        repo.upsert_stream(&stream).await.unwrap();
        repo.append_transition(&ready).await.unwrap();
        repo.append_transition(&ready).await.unwrap();

        let stored = repo.get_stream(&stream.id).await.unwrap().unwrap();
        assert_eq!(stored.state, StreamState::Ready);
        assert_eq!(stored.source, stream.source);

        let log = repo.list_transitions(&stream.id).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].from_state, None);
        assert_eq!(log[1].reason, ReasonCode::SourceIdentified);

        assert!(repo.get_stream("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_consumer_upsert_updates_state() {
        use crate::domain::{Consumer, ConsumerState};
        use chrono::Utc;

        let dir = tempfile::tempdir().unwrap();
        let repo = repository(&dir).await;
        let (stream, _) = Stream::create("cam", SourceDescriptor::parse("rtsp://cam1").unwrap());
        repo.upsert_stream(&stream).await.unwrap();

        let now = Utc::now();
        let mut consumer = Consumer {
            id: "c1".into(),
            stream_id: stream.id.clone(),
            producer_id: "p1".into(),
            session_id: "sess".into(),
            client_tag: "viewer".into(),
            state: ConsumerState::Connecting,
            created_at: now,
            last_seen_at: now,
            closed_at: None,
            close_reason: None,
        };
        repo.upsert_consumer(&consumer).await.unwrap();
        consumer.close("detached");
        repo.upsert_consumer(&consumer).await.unwrap();

        let stored = repo.list_consumers(&stream.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].state, ConsumerState::Closed);
        assert_eq!(stored[0].close_reason.as_deref(), Some("detached"));
    }
}
