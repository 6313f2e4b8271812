//! PostgreSQL Event Store
//!
//! Durable backing for the ledger: an append-only event table keyed by
//! `(aggregate_id, sequence)` unique, a balance projection table keyed by
//! `(account_id, asset_id)`, a snapshot table, and a cold archive table.
//!
//! The projection rows are updated in the same transaction that appends
//! the events, so a reader of the table never observes an applied event
//! without its balance effect or vice versa.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};

use super::error::LedgerError;
use super::event::{EventRecord, LedgerEvent};
use super::store::{BalanceSnapshot, EventStore};
use crate::core_types::{AccountId, SeqNum};

const CREATE_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_events_tb (
    aggregate_id   TEXT        NOT NULL,
    sequence       BIGINT      NOT NULL,
    event_type     TEXT        NOT NULL,
    payload        TEXT        NOT NULL,
    occurred_at    TIMESTAMPTZ NOT NULL,
    correlation_id TEXT        NOT NULL,
    causation_id   TEXT,
    PRIMARY KEY (aggregate_id, sequence)
)
"#;

const CREATE_ARCHIVE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_events_archive_tb (
    aggregate_id   TEXT        NOT NULL,
    sequence       BIGINT      NOT NULL,
    event_type     TEXT        NOT NULL,
    payload        TEXT        NOT NULL,
    occurred_at    TIMESTAMPTZ NOT NULL,
    correlation_id TEXT        NOT NULL,
    causation_id   TEXT,
    PRIMARY KEY (aggregate_id, sequence)
)
"#;

const CREATE_BALANCES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_balances_tb (
    account_id    TEXT   NOT NULL,
    asset_id      INT    NOT NULL,
    balance       BIGINT NOT NULL CHECK (balance >= 0),
    last_sequence BIGINT NOT NULL,
    PRIMARY KEY (account_id, asset_id)
)
"#;

const CREATE_SNAPSHOTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_snapshots_tb (
    aggregate_id TEXT        PRIMARY KEY,
    sequence     BIGINT      NOT NULL,
    payload      TEXT        NOT NULL,
    taken_at     TIMESTAMPTZ NOT NULL
)
"#;

/// Create the ledger tables if they do not exist
pub async fn ensure_schema(pool: &PgPool) -> Result<(), LedgerError> {
    for ddl in [
        CREATE_EVENTS_TABLE,
        CREATE_ARCHIVE_TABLE,
        CREATE_BALANCES_TABLE,
        CREATE_SNAPSHOTS_TABLE,
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }
    tracing::info!("Ledger schema ensured");
    Ok(())
}

/// PostgreSQL-backed event store
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool and ensure the schema exists
    pub async fn connect(database_url: &str) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        ensure_schema(&pool).await?;
        tracing::info!("PostgreSQL event store connected");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_record(row: &PgRow) -> Result<EventRecord, LedgerError> {
        let aggregate_id: String = row.get("aggregate_id");
        let sequence: i64 = row.get("sequence");
        let payload: String = row.get("payload");
        let event: LedgerEvent = serde_json::from_str(&payload)
            .map_err(|e| LedgerError::Storage(format!("bad event payload: {}", e)))?;
        let occurred_at: chrono::DateTime<chrono::Utc> = row.get("occurred_at");
        let correlation_id: String = row.get("correlation_id");
        let causation_id: Option<String> = row.get("causation_id");

        Ok(EventRecord {
            aggregate_id: aggregate_id
                .parse()
                .map_err(|_| LedgerError::Storage("invalid aggregate_id".to_string()))?,
            sequence: sequence as SeqNum,
            event,
            timestamp_ms: occurred_at.timestamp_millis(),
            correlation_id: correlation_id
                .parse()
                .map_err(|_| LedgerError::Storage("invalid correlation_id".to_string()))?,
            causation_id: match causation_id {
                Some(c) => Some(
                    c.parse()
                        .map_err(|_| LedgerError::Storage("invalid causation_id".to_string()))?,
                ),
                None => None,
            },
        })
    }

    async fn head_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        aggregate_id: AccountId,
    ) -> Result<SeqNum, LedgerError> {
        let hot: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(sequence) FROM ledger_events_tb WHERE aggregate_id = $1",
        )
        .bind(aggregate_id.to_string())
        .fetch_one(&mut **tx)
        .await?;

        if let Some(seq) = hot {
            return Ok(seq as SeqNum);
        }

        let cold: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(sequence) FROM ledger_events_archive_tb WHERE aggregate_id = $1",
        )
        .bind(aggregate_id.to_string())
        .fetch_one(&mut **tx)
        .await?;

        Ok(cold.unwrap_or(0) as SeqNum)
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn append(
        &self,
        aggregate_id: AccountId,
        expected_head: SeqNum,
        events: Vec<EventRecord>,
    ) -> Result<SeqNum, LedgerError> {
        if events.is_empty() {
            return Err(LedgerError::Storage("empty append".to_string()));
        }

        let mut next = expected_head + 1;
        for event in &events {
            if event.sequence != next || event.aggregate_id != aggregate_id {
                return Err(LedgerError::Storage(format!(
                    "non-contiguous append at sequence {}",
                    event.sequence
                )));
            }
            next += 1;
        }

        let mut tx = self.pool.begin().await?;

        let found = Self::head_tx(&mut tx, aggregate_id).await?;
        if found != expected_head {
            return Err(LedgerError::SequenceConflict {
                expected: expected_head,
                found,
            });
        }

        for event in &events {
            let payload = serde_json::to_string(&event.event)
                .map_err(|e| LedgerError::Storage(e.to_string()))?;
            let occurred_at = chrono::DateTime::from_timestamp_millis(event.timestamp_ms)
                .unwrap_or_else(chrono::Utc::now);

            let insert = sqlx::query(
                r#"
                INSERT INTO ledger_events_tb
                    (aggregate_id, sequence, event_type, payload, occurred_at, correlation_id, causation_id)
                VALUES
                    ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(aggregate_id.to_string())
            .bind(event.sequence as i64)
            .bind(event.event.kind())
            .bind(&payload)
            .bind(occurred_at)
            .bind(event.correlation_id.to_string())
            .bind(event.causation_id.map(|c| c.to_string()))
            .execute(&mut *tx)
            .await;

            if let Err(e) = insert {
                // A concurrent writer won the sequence slot
                if e.as_database_error()
                    .is_some_and(|d| d.is_unique_violation())
                {
                    return Err(LedgerError::SequenceConflict {
                        expected: expected_head,
                        found: event.sequence,
                    });
                }
                return Err(e.into());
            }

            // Projection row update in the same transaction
            match &event.event {
                LedgerEvent::Credited { asset, .. } | LedgerEvent::Debited { asset, .. } => {
                    let delta = event.event.signed_delta(*asset);
                    sqlx::query(
                        r#"
                        INSERT INTO ledger_balances_tb (account_id, asset_id, balance, last_sequence)
                        VALUES ($1, $2, $3, $4)
                        ON CONFLICT (account_id, asset_id) DO UPDATE
                        SET balance = ledger_balances_tb.balance + $3,
                            last_sequence = $4
                        "#,
                    )
                    .bind(aggregate_id.to_string())
                    .bind(*asset as i32)
                    .bind(delta)
                    .bind(event.sequence as i64)
                    .execute(&mut *tx)
                    .await?;
                }
                _ => {}
            }
        }

        tx.commit().await?;
        Ok(next - 1)
    }

    async fn load(&self, aggregate_id: AccountId) -> Result<Vec<EventRecord>, LedgerError> {
        self.load_from(aggregate_id, 1).await
    }

    async fn load_from(
        &self,
        aggregate_id: AccountId,
        from_seq: SeqNum,
    ) -> Result<Vec<EventRecord>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT aggregate_id, sequence, event_type, payload, occurred_at,
                   correlation_id, causation_id
            FROM ledger_events_archive_tb
            WHERE aggregate_id = $1 AND sequence >= $2
            UNION ALL
            SELECT aggregate_id, sequence, event_type, payload, occurred_at,
                   correlation_id, causation_id
            FROM ledger_events_tb
            WHERE aggregate_id = $1 AND sequence >= $2
            ORDER BY sequence ASC
            "#,
        )
        .bind(aggregate_id.to_string())
        .bind(from_seq as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(Self::row_to_record(row)?);
        }
        Ok(records)
    }

    async fn head(&self, aggregate_id: AccountId) -> Result<SeqNum, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let head = Self::head_tx(&mut tx, aggregate_id).await?;
        tx.commit().await?;
        Ok(head)
    }

    async fn save_snapshot(&self, snapshot: BalanceSnapshot) -> Result<(), LedgerError> {
        let payload = serde_json::to_string(&snapshot)
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        let taken_at = chrono::DateTime::from_timestamp_millis(snapshot.taken_at_ms)
            .unwrap_or_else(chrono::Utc::now);

        sqlx::query(
            r#"
            INSERT INTO ledger_snapshots_tb (aggregate_id, sequence, payload, taken_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (aggregate_id) DO UPDATE
            SET sequence = $2, payload = $3, taken_at = $4
            "#,
        )
        .bind(snapshot.aggregate_id.to_string())
        .bind(snapshot.sequence as i64)
        .bind(&payload)
        .bind(taken_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn snapshot(
        &self,
        aggregate_id: AccountId,
    ) -> Result<Option<BalanceSnapshot>, LedgerError> {
        let row = sqlx::query("SELECT payload FROM ledger_snapshots_tb WHERE aggregate_id = $1")
            .bind(aggregate_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let payload: String = row.get("payload");
                let snapshot: BalanceSnapshot = serde_json::from_str(&payload)
                    .map_err(|e| LedgerError::Storage(format!("bad snapshot payload: {}", e)))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    async fn archive_before(
        &self,
        aggregate_id: AccountId,
        cutoff_ms: i64,
    ) -> Result<usize, LedgerError> {
        let snapshot_seq: Option<i64> = sqlx::query_scalar(
            "SELECT sequence FROM ledger_snapshots_tb WHERE aggregate_id = $1",
        )
        .bind(aggregate_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let snapshot_seq = snapshot_seq.ok_or(LedgerError::SnapshotMissing)?;
        // Out-of-range cutoffs clamp to the far future, not to "now"
        let cutoff = chrono::DateTime::from_timestamp_millis(cutoff_ms)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC);

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            WITH moved AS (
                DELETE FROM ledger_events_tb
                WHERE aggregate_id = $1 AND sequence <= $2 AND occurred_at < $3
                RETURNING *
            )
            INSERT INTO ledger_events_archive_tb SELECT * FROM moved
            "#,
        )
        .bind(aggregate_id.to_string())
        .bind(snapshot_seq)
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let moved = result.rows_affected() as usize;
        tracing::info!(
            aggregate_id = %aggregate_id,
            moved,
            "Archived replay-redundant events to cold storage"
        );
        Ok(moved)
    }
}
