use crate::config::DatabaseConfig;
use crate::policy::Action;
use crate::telemetry::SensorReading;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum ActionResult {
    NoAction,
    Actuated { action: Action, status: String },
    Failed { action: Action, reason: String },
}

impl ActionResult {
    pub fn action(&self) -> Action {
        match self {
            ActionResult::NoAction => Action::NoAction,
            ActionResult::Actuated { action, .. } | ActionResult::Failed { action, .. } => *action,
        }
    }

    /// Value written to the `etat` column.
    pub fn etat(&self) -> Option<String> {
        match self {
            ActionResult::NoAction => None,
            ActionResult::Actuated { status, .. } => Some(status.clone()),
            ActionResult::Failed { action, .. } => Some(format!("{action}Failed")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistedEvent {
    pub id: Uuid,
    pub temperature: f64,
    pub timestamp: String,
    pub action: ActionResult,
}

impl PersistedEvent {
    pub fn new(reading: &SensorReading, action: ActionResult) -> Self {
        Self {
            id: reading.identity(),
            temperature: reading.temperature,
            timestamp: reading.timestamp.clone(),
            action,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted,
    Duplicate,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no pooled connection available: {0}")]
    Acquire(#[source] sqlx::Error),
    #[error("insert failed, connection discarded: {0}")]
    Write(#[source] sqlx::Error),
    #[error("insert did not finish within {0:?}, connection discarded")]
    WriteTimeout(Duration),
}

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Writes the event once. A second call with the same id leaves the
    /// stored row untouched and reports `Duplicate`.
    async fn save(&self, event: &PersistedEvent) -> Result<SaveOutcome, StoreError>;
}

pub async fn build_pool(config: &DatabaseConfig) -> anyhow::Result<PgPool> {
    let options = match &config.url {
        Some(url) => url.parse::<PgConnectOptions>()?,
        None => PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.name)
            .username(&config.user)
            .password(&config.password),
    };
    let pool = PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout())
        .connect_with(options)
        .await?;
    Ok(pool)
}

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct EventStore {
    pool: PgPool,
    write_timeout: Duration,
}

impl EventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sensor (
                id uuid primary key,
                temperature numeric not null,
                heure text not null,
                etat text null
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Write)?;
        Ok(())
    }

    /// Stops handing out connections and waits for checked-out ones to return.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("event store pool closed");
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EventSink for EventStore {
    async fn save(&self, event: &PersistedEvent) -> Result<SaveOutcome, StoreError> {
        // Dropping `conn` hands it back to the pool on every path below.
        let mut conn = self.pool.acquire().await.map_err(StoreError::Acquire)?;

        let insert = sqlx::query(
            r#"
            INSERT INTO sensor (id, temperature, heure, etat)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(event.temperature)
        .bind(&event.timestamp)
        .bind(event.action.etat())
        .execute(&mut *conn);

        let result = match tokio::time::timeout(self.write_timeout, insert).await {
            Ok(result) => result,
            Err(_) => {
                // The statement may still be running server side.
                conn.close_on_drop();
                return Err(StoreError::WriteTimeout(self.write_timeout));
            }
        };

        match result {
            Ok(done) if done.rows_affected() == 0 => {
                tracing::debug!(id = %event.id, "reading already stored");
                Ok(SaveOutcome::Duplicate)
            }
            Ok(_) => {
                tracing::debug!(id = %event.id, temperature = event.temperature, "reading stored");
                Ok(SaveOutcome::Inserted)
            }
            Err(err) => {
                conn.close_on_drop();
                Err(StoreError::Write(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use sqlx::Row;
    use std::env;

    async fn setup_test_store(schema: &str, max_connections: u32) -> Result<Option<EventStore>> {
        if env::var("HVAC_INTEGRATION_TEST").ok().as_deref() != Some("1") {
            return Ok(None);
        }
        let database_url = match env::var("HVAC_TEST_DATABASE_URL") {
            Ok(value) => value,
            Err(_) => return Ok(None),
        };

        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&database_url)
            .await?;
        sqlx::query(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
            .execute(&admin_pool)
            .await?;
        sqlx::query(&format!("CREATE SCHEMA {schema}"))
            .execute(&admin_pool)
            .await?;
        drop(admin_pool);

        let schema_name = schema.to_string();
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(2))
            .after_connect(move |conn, _meta| {
                let schema = schema_name.clone();
                Box::pin(async move {
                    sqlx::query(&format!("SET search_path TO {}", schema))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&database_url)
            .await?;

        let store = EventStore::new(pool);
        store.ensure_schema().await?;
        Ok(Some(store))
    }

    fn reading(timestamp: &str, temperature: f64) -> SensorReading {
        SensorReading {
            timestamp: timestamp.to_string(),
            temperature,
        }
    }

    #[test]
    fn etat_marks_each_outcome() {
        assert_eq!(ActionResult::NoAction.etat(), None);
        let ok = ActionResult::Actuated {
            action: Action::TurnOnAc,
            status: "Activating AC".into(),
        };
        assert_eq!(ok.etat().as_deref(), Some("Activating AC"));
        let failed = ActionResult::Failed {
            action: Action::TurnOnHeater,
            reason: "timeout".into(),
        };
        assert_eq!(failed.etat().as_deref(), Some("TurnOnHeaterFailed"));
        assert_eq!(failed.action(), Action::TurnOnHeater);
    }

    #[tokio::test]
    async fn duplicate_id_keeps_first_row() -> Result<()> {
        let schema = format!("hvac_test_dup_{}", std::process::id());
        let Some(store) = setup_test_store(&schema, 2).await? else {
            return Ok(());
        };

        let reading = reading("2024-06-28 12:00:00.000", 35.0);
        let first = PersistedEvent::new(
            &reading,
            ActionResult::Actuated {
                action: Action::TurnOnAc,
                status: "TurnOnAc".into(),
            },
        );
        let second = PersistedEvent::new(
            &reading,
            ActionResult::Failed {
                action: Action::TurnOnAc,
                reason: "timeout".into(),
            },
        );

        assert_eq!(store.save(&first).await?, SaveOutcome::Inserted);
        assert_eq!(store.save(&second).await?, SaveOutcome::Duplicate);

        let rows = sqlx::query("SELECT temperature::float8 AS t, heure, etat FROM sensor")
            .fetch_all(store.pool())
            .await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].try_get::<f64, _>("t")?, 35.0);
        assert_eq!(rows[0].try_get::<String, _>("heure")?, "2024-06-28 12:00:00.000");
        assert_eq!(
            rows[0].try_get::<Option<String>, _>("etat")?.as_deref(),
            Some("TurnOnAc")
        );

        store.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn no_action_is_stored_with_null_etat() -> Result<()> {
        let schema = format!("hvac_test_null_{}", std::process::id());
        let Some(store) = setup_test_store(&schema, 2).await? else {
            return Ok(());
        };

        let event = PersistedEvent::new(&reading("2024-06-28 12:05:00.000", 20.0), ActionResult::NoAction);
        store.save(&event).await?;
        let etat: Option<String> = sqlx::query_scalar("SELECT etat FROM sensor WHERE id = $1")
            .bind(event.id)
            .fetch_one(store.pool())
            .await?;
        assert_eq!(etat, None);

        store.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_saves_stay_within_pool_bounds() -> Result<()> {
        let schema = format!("hvac_test_pool_{}", std::process::id());
        let max = 3;
        let Some(store) = setup_test_store(&schema, max).await? else {
            return Ok(());
        };

        let mut tasks = Vec::new();
        for i in 0..40 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let event = PersistedEvent::new(
                    &reading(&format!("2024-06-28 12:00:{:02}.000", i % 60), 20.0 + i as f64),
                    ActionResult::NoAction,
                );
                let outcome = store.save(&event).await;
                assert!(store.pool().size() <= max);
                outcome
            }));
        }
        for task in tasks {
            assert_eq!(task.await??, SaveOutcome::Inserted);
        }

        let pool = store.pool();
        assert!(pool.size() <= max);
        let mut held = Vec::new();
        for _ in 0..max {
            held.push(pool.acquire().await?);
        }
        drop(held);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sensor")
            .fetch_one(pool)
            .await?;
        assert_eq!(count, 40);

        store.close().await;
        Ok(())
    }

    async fn backend_pid(store: &EventStore) -> Result<i32> {
        Ok(sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(store.pool())
            .await?)
    }

    #[tokio::test]
    async fn failed_insert_discards_connection_and_store_recovers() -> Result<()> {
        let schema = format!("hvac_test_fail_{}", std::process::id());
        // A single-connection pool makes a replaced connection observable.
        let Some(store) = setup_test_store(&schema, 1).await? else {
            return Ok(());
        };
        let before = backend_pid(&store).await?;

        sqlx::query("ALTER TABLE sensor RENAME TO sensor_moved")
            .execute(store.pool())
            .await?;
        let event = PersistedEvent::new(&reading("2024-06-28 13:00:00.000", 5.0), ActionResult::NoAction);
        let err = store.save(&event).await.unwrap_err();
        assert!(matches!(err, StoreError::Write(_)));

        let after = backend_pid(&store).await?;
        assert_ne!(before, after, "failed connection went back to the pool");

        sqlx::query("ALTER TABLE sensor_moved RENAME TO sensor")
            .execute(store.pool())
            .await?;
        assert_eq!(store.save(&event).await?, SaveOutcome::Inserted);

        store.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn stalled_insert_times_out_and_discards_connection() -> Result<()> {
        let schema = format!("hvac_test_stall_{}", std::process::id());
        let Some(store) = setup_test_store(&schema, 1).await? else {
            return Ok(());
        };
        let store = store.with_write_timeout(std::time::Duration::from_millis(300));
        let before = backend_pid(&store).await?;

        let database_url = env::var("HVAC_TEST_DATABASE_URL")?;
        let blocker = PgPoolOptions::new()
            .max_connections(1)
            .connect(&database_url)
            .await?;
        let mut tx = blocker.begin().await?;
        sqlx::query(&format!("LOCK TABLE {schema}.sensor IN ACCESS EXCLUSIVE MODE"))
            .execute(&mut *tx)
            .await?;

        let event = PersistedEvent::new(&reading("2024-06-28 14:00:00.000", 21.0), ActionResult::NoAction);
        let err = store.save(&event).await.unwrap_err();
        assert!(matches!(err, StoreError::WriteTimeout(_)), "{err}");

        tx.rollback().await?;
        blocker.close().await;

        assert_ne!(backend_pid(&store).await?, before);
        // The abandoned statement may still commit once the lock is gone.
        store.save(&event).await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sensor")
            .fetch_one(store.pool())
            .await?;
        assert_eq!(count, 1);

        store.close().await;
        Ok(())
    }
}
