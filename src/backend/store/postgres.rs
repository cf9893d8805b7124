/**
 * PostgreSQL Store
 *
 * `Store` on top of a sqlx `PgPool`. Multi-row operations run in one
 * transaction; claims lock rows with `FOR UPDATE SKIP LOCKED` so two
 * drains never take the same op, and record writes lock the
 * `data_versions` row before comparing versions.
 *
 * Schema lives in `migrations/` and is applied with `sqlx::migrate!()`.
 */
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Row};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::backend::store::{
    ClaimFilter, ConflictChange, OpCommit, OpTransition, RecordWrite, Store, StoreError,
};
use crate::shared::{
    AnalyticsCounts, AnalyticsEvent, Notification, OfflineOperation, OperationState,
    ServerRecord, SharedError, SyncConflict, SyncHistoryEntry, SyncStatus, UserId,
};

const NOTIFICATION_COLUMNS: &str =
    "id, user_id, kind, title, body, data, created_at, delivered_at, read_at";

const OPERATION_COLUMNS: &str = "seq, op_id, user_id, kind, table_name, record_id, payload, \
     base_version, state, attempts, next_attempt_at, last_error, created_at, updated_at";

const CONFLICT_COLUMNS: &str = "id, user_id, op_id, table_name, record_id, conflict_type, local, \
     server, resolved, strategy_used, status, created_at, resolved_at";

const STATUS_COLUMNS: &str =
    "user_id, last_sync_at, sync_token, pending_count, conflict_count, online, last_online_at";

const HISTORY_COLUMNS: &str =
    "id, user_id, started_at, finished_at, processed, conflicts_resolved, outcome";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(map_err)?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("migration failed: {}", e)))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_err(error: sqlx::Error) -> StoreError {
    match &error {
        sqlx::Error::RowNotFound => StoreError::not_found("row", "query"),
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::TypeNotFound { .. } => StoreError::Corrupt(error.to_string()),
        // serialization_failure / deadlock_detected
        sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("40001") | Some("40P01")) => {
            StoreError::Conflict(error.to_string())
        }
        _ => StoreError::Unavailable(error.to_string()),
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn col<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name).map_err(map_err)
}

fn parse<T: FromStr<Err = SharedError>>(raw: String) -> Result<T, StoreError> {
    raw.parse().map_err(|e: SharedError| StoreError::Corrupt(e.to_string()))
}

fn notification_from_row(row: &PgRow) -> Result<Notification, StoreError> {
    Ok(Notification {
        id: col(row, "id")?,
        user_id: col(row, "user_id")?,
        kind: col(row, "kind")?,
        title: col(row, "title")?,
        body: col(row, "body")?,
        data: col(row, "data")?,
        created_at: col(row, "created_at")?,
        delivered_at: col(row, "delivered_at")?,
        read_at: col(row, "read_at")?,
    })
}

fn operation_from_row(row: &PgRow) -> Result<OfflineOperation, StoreError> {
    let attempts: i32 = col(row, "attempts")?;
    Ok(OfflineOperation {
        op_id: col(row, "op_id")?,
        seq: col(row, "seq")?,
        user_id: col(row, "user_id")?,
        kind: parse(col(row, "kind")?)?,
        table: col(row, "table_name")?,
        record_id: col(row, "record_id")?,
        payload: col(row, "payload")?,
        base_version: col(row, "base_version")?,
        state: parse(col(row, "state")?)?,
        attempts: u32::try_from(attempts).unwrap_or(0),
        next_attempt_at: col(row, "next_attempt_at")?,
        last_error: col(row, "last_error")?,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

fn conflict_from_row(row: &PgRow) -> Result<SyncConflict, StoreError> {
    let strategy_used: Option<String> = col(row, "strategy_used")?;
    Ok(SyncConflict {
        id: col(row, "id")?,
        user_id: col(row, "user_id")?,
        op_id: col(row, "op_id")?,
        table: col(row, "table_name")?,
        record_id: col(row, "record_id")?,
        conflict_type: parse(col(row, "conflict_type")?)?,
        local: col(row, "local")?,
        server: col(row, "server")?,
        resolved: col(row, "resolved")?,
        strategy_used: strategy_used.map(parse).transpose()?,
        status: parse(col(row, "status")?)?,
        created_at: col(row, "created_at")?,
        resolved_at: col(row, "resolved_at")?,
    })
}

fn status_from_row(row: &PgRow) -> Result<SyncStatus, StoreError> {
    Ok(SyncStatus {
        user_id: col(row, "user_id")?,
        last_sync_at: col(row, "last_sync_at")?,
        sync_token: col(row, "sync_token")?,
        pending_count: col(row, "pending_count")?,
        conflict_count: col(row, "conflict_count")?,
        online: col(row, "online")?,
        last_online_at: col(row, "last_online_at")?,
    })
}

fn history_from_row(row: &PgRow) -> Result<SyncHistoryEntry, StoreError> {
    Ok(SyncHistoryEntry {
        id: col(row, "id")?,
        user_id: col(row, "user_id")?,
        started_at: col(row, "started_at")?,
        finished_at: col(row, "finished_at")?,
        processed: col(row, "processed")?,
        conflicts_resolved: col(row, "conflicts_resolved")?,
        outcome: parse(col(row, "outcome")?)?,
    })
}

fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Lock the op row and check its state
async fn lock_operation(
    conn: &mut PgConnection,
    user_id: UserId,
    op_id: &str,
    expected: OperationState,
) -> Result<(), StoreError> {
    let row = sqlx::query(
        "SELECT state FROM offline_operations WHERE user_id = $1 AND op_id = $2 FOR UPDATE",
    )
    .bind(user_id)
    .bind(op_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(map_err)?
    .ok_or_else(|| StoreError::not_found("operation", op_id))?;

    let state: OperationState = parse(col(&row, "state")?)?;
    if state != expected {
        return Err(StoreError::Conflict(format!(
            "operation {} is {}, expected {}",
            op_id,
            state.as_str(),
            expected.as_str()
        )));
    }
    Ok(())
}

/// Compare-and-set one record inside an open transaction
async fn write_in_tx(
    conn: &mut PgConnection,
    write: &RecordWrite,
    writer: UserId,
    at: DateTime<Utc>,
) -> Result<ServerRecord, StoreError> {
    let current: Option<i64> = sqlx::query(
        "SELECT version FROM data_versions WHERE table_name = $1 AND record_id = $2 FOR UPDATE",
    )
    .bind(&write.table)
    .bind(&write.record_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(map_err)?
    .map(|row| col(&row, "version"))
    .transpose()?;

    let current = current.unwrap_or(0);
    if current != write.expected_version {
        return Err(StoreError::Conflict(format!(
            "{}/{} is at version {}, expected {}",
            write.table, write.record_id, current, write.expected_version
        )));
    }
    let version = current + 1;

    let written = sqlx::query(
        r#"
        INSERT INTO data_versions (table_name, record_id, version, last_writer_user_id, last_written_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (table_name, record_id) DO UPDATE
        SET version = EXCLUDED.version,
            last_writer_user_id = EXCLUDED.last_writer_user_id,
            last_written_at = EXCLUDED.last_written_at
        WHERE data_versions.version = $3 - 1
        "#,
    )
    .bind(&write.table)
    .bind(&write.record_id)
    .bind(version)
    .bind(writer)
    .bind(at)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Conflict(format!("{}/{} created concurrently", write.table, write.record_id))
        } else {
            map_err(e)
        }
    })?;

    // A row created between our read and the upsert makes the WHERE skip it
    if written.rows_affected() != 1 {
        return Err(StoreError::Conflict(format!(
            "{}/{} created concurrently",
            write.table, write.record_id
        )));
    }

    sqlx::query(
        r#"
        INSERT INTO sync_records (table_name, record_id, value)
        VALUES ($1, $2, $3)
        ON CONFLICT (table_name, record_id) DO UPDATE SET value = EXCLUDED.value
        "#,
    )
    .bind(&write.table)
    .bind(&write.record_id)
    .bind(&write.value)
    .execute(&mut *conn)
    .await
    .map_err(map_err)?;

    Ok(ServerRecord {
        table: write.table.clone(),
        record_id: write.record_id.clone(),
        value: write.value.clone(),
        version,
        last_writer_user_id: writer,
        last_written_at: at,
    })
}

async fn insert_conflict(conn: &mut PgConnection, c: &SyncConflict) -> Result<(), StoreError> {
    sqlx::query(&format!(
        "INSERT INTO sync_conflicts ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        CONFLICT_COLUMNS
    ))
    .bind(c.id)
    .bind(c.user_id)
    .bind(&c.op_id)
    .bind(&c.table)
    .bind(&c.record_id)
    .bind(c.conflict_type.as_str())
    .bind(&c.local)
    .bind(&c.server)
    .bind(&c.resolved)
    .bind(c.strategy_used.map(|s| s.as_str()))
    .bind(c.status.as_str())
    .bind(c.created_at)
    .bind(c.resolved_at)
    .execute(&mut *conn)
    .await
    .map_err(map_err)?;
    Ok(())
}

/// Upsert status counts from the op and conflict rows
async fn refresh_in(conn: &mut PgConnection, user_id: UserId) -> Result<SyncStatus, StoreError> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO sync_statuses (user_id, pending_count, conflict_count)
        VALUES (
            $1,
            (SELECT COUNT(*) FROM offline_operations WHERE user_id = $1 AND state = 'pending'),
            (SELECT COUNT(*) FROM sync_conflicts WHERE user_id = $1 AND status = 'unresolved')
        )
        ON CONFLICT (user_id) DO UPDATE
        SET pending_count = EXCLUDED.pending_count,
            conflict_count = EXCLUDED.conflict_count
        RETURNING {}
        "#,
        STATUS_COLUMNS
    ))
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(map_err)?;
    status_from_row(&row)
}

#[async_trait]
impl Store for PgStore {
    async fn insert_notification(
        &self,
        n: &Notification,
        inbox_limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        sqlx::query(&format!(
            "INSERT INTO notifications ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            NOTIFICATION_COLUMNS
        ))
        .bind(n.id)
        .bind(n.user_id)
        .bind(&n.kind)
        .bind(&n.title)
        .bind(&n.body)
        .bind(&n.data)
        .bind(n.created_at)
        .bind(n.delivered_at)
        .bind(n.read_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::duplicate("notification", n.id)
            } else {
                map_err(e)
            }
        })?;

        let trimmed = sqlx::query(
            r#"
            DELETE FROM notifications
            WHERE id IN (
                SELECT id FROM notifications
                WHERE user_id = $1
                ORDER BY created_at DESC, id DESC
                OFFSET $2
            )
            RETURNING id
            "#,
        )
        .bind(n.user_id)
        .bind(limit(inbox_limit))
        .fetch_all(&mut *tx)
        .await
        .map_err(map_err)?
        .iter()
        .map(|row| col(row, "id"))
        .collect::<Result<Vec<Uuid>, _>>()?;

        tx.commit().await.map_err(map_err)?;
        Ok(trimmed)
    }

    async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>, StoreError> {
        sqlx::query(&format!(
            "SELECT {} FROM notifications WHERE id = $1",
            NOTIFICATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?
        .map(|row| notification_from_row(&row))
        .transpose()
    }

    async fn list_notifications(
        &self,
        user_id: UserId,
        limit_n: usize,
    ) -> Result<Vec<Notification>, StoreError> {
        sqlx::query(&format!(
            "SELECT {} FROM notifications WHERE user_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2",
            NOTIFICATION_COLUMNS
        ))
        .bind(user_id)
        .bind(limit(limit_n))
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?
        .iter()
        .map(notification_from_row)
        .collect()
    }

    async fn mark_delivered(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE notifications SET delivered_at = GREATEST($2, created_at) WHERE id = $1 AND delivered_at IS NULL",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_notification(id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::not_found("notification", id)),
        }
    }

    async fn mark_read(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE notifications SET read_at = GREATEST($2, created_at) WHERE id = $1 AND read_at IS NULL",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_notification(id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::not_found("notification", id)),
        }
    }

    async fn record_analytics(
        &self,
        notification_id: Uuid,
        event: AnalyticsEvent,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO notification_analytics (notification_id, event, created_at) VALUES ($1, $2, $3)",
        )
        .bind(notification_id)
        .bind(event.as_str())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn analytics_counts(&self, notification_id: Uuid) -> Result<AnalyticsCounts, StoreError> {
        let rows = sqlx::query(
            "SELECT event, COUNT(*) AS n FROM notification_analytics WHERE notification_id = $1 GROUP BY event",
        )
        .bind(notification_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        let mut counts = AnalyticsCounts::new();
        for row in &rows {
            let event: AnalyticsEvent = parse(col(row, "event")?)?;
            let n: i64 = col(row, "n")?;
            counts.insert(event, u64::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }

    async fn insert_operation(
        &self,
        op: &OfflineOperation,
        reuse_before: DateTime<Utc>,
    ) -> Result<OfflineOperation, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        let existing = sqlx::query(
            "SELECT state, updated_at FROM offline_operations WHERE user_id = $1 AND op_id = $2 FOR UPDATE",
        )
        .bind(op.user_id)
        .bind(&op.op_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_err)?;

        if let Some(row) = existing {
            let state: OperationState = parse(col(&row, "state")?)?;
            let updated_at: DateTime<Utc> = col(&row, "updated_at")?;
            if !state.is_terminal() || updated_at >= reuse_before {
                return Err(StoreError::duplicate("operation", &op.op_id));
            }
            sqlx::query("DELETE FROM offline_operations WHERE user_id = $1 AND op_id = $2")
                .bind(op.user_id)
                .bind(&op.op_id)
                .execute(&mut *tx)
                .await
                .map_err(map_err)?;
        }

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO offline_operations
                (op_id, user_id, kind, table_name, record_id, payload, base_version,
                 state, attempts, next_attempt_at, last_error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {}
            "#,
            OPERATION_COLUMNS
        ))
        .bind(&op.op_id)
        .bind(op.user_id)
        .bind(op.kind.as_str())
        .bind(&op.table)
        .bind(&op.record_id)
        .bind(&op.payload)
        .bind(op.base_version)
        .bind(op.state.as_str())
        .bind(i32::try_from(op.attempts).unwrap_or(i32::MAX))
        .bind(op.next_attempt_at)
        .bind(&op.last_error)
        .bind(op.created_at)
        .bind(op.updated_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::duplicate("operation", &op.op_id)
            } else {
                map_err(e)
            }
        })?;
        let stored = operation_from_row(&row)?;

        tx.commit().await.map_err(map_err)?;
        Ok(stored)
    }

    async fn get_operation(
        &self,
        user_id: UserId,
        op_id: &str,
    ) -> Result<Option<OfflineOperation>, StoreError> {
        sqlx::query(&format!(
            "SELECT {} FROM offline_operations WHERE user_id = $1 AND op_id = $2",
            OPERATION_COLUMNS
        ))
        .bind(user_id)
        .bind(op_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?
        .map(|row| operation_from_row(&row))
        .transpose()
    }

    async fn list_operations(
        &self,
        user_id: UserId,
        limit_n: usize,
    ) -> Result<Vec<OfflineOperation>, StoreError> {
        sqlx::query(&format!(
            "SELECT {} FROM offline_operations WHERE user_id = $1 ORDER BY seq DESC LIMIT $2",
            OPERATION_COLUMNS
        ))
        .bind(user_id)
        .bind(limit(limit_n))
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?
        .iter()
        .map(operation_from_row)
        .collect()
    }

    async fn count_operations(
        &self,
        user_id: UserId,
        states: &[OperationState],
    ) -> Result<i64, StoreError> {
        let states: Vec<&str> = states.iter().map(|s| s.as_str()).collect();
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM offline_operations WHERE user_id = $1 AND state = ANY($2)",
        )
        .bind(user_id)
        .bind(&states)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        col(&row, "n")
    }

    async fn claim_operations(
        &self,
        user_id: UserId,
        filter: ClaimFilter,
    ) -> Result<Vec<OfflineOperation>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE offline_operations
            SET state = 'in-flight', attempts = attempts + 1, updated_at = $2
            WHERE seq IN (
                SELECT seq FROM offline_operations
                WHERE user_id = $1
                  AND state = 'pending'
                  AND next_attempt_at <= $2
                  AND ($3::timestamptz IS NULL OR created_at > $3)
                ORDER BY seq
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            OPERATION_COLUMNS
        ))
        .bind(user_id)
        .bind(filter.now)
        .bind(filter.created_after)
        .bind(limit(filter.limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        let mut claimed = rows
            .iter()
            .map(operation_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by_key(|op| op.seq);
        Ok(claimed)
    }

    async fn transition_operation(&self, t: &OpTransition) -> Result<bool, StoreError> {
        t.check()?;
        // One statement, so a two-edge move never rests in its `via` state
        let result = sqlx::query(
            r#"
            UPDATE offline_operations
            SET state = $4,
                next_attempt_at = COALESCE($5, next_attempt_at),
                last_error = COALESCE($6, last_error),
                attempts = GREATEST(attempts - $8, 0),
                updated_at = $7
            WHERE user_id = $1 AND op_id = $2 AND state = $3
            "#,
        )
        .bind(t.user_id)
        .bind(&t.op_id)
        .bind(t.from.as_str())
        .bind(t.to.as_str())
        .bind(t.next_attempt_at)
        .bind(&t.last_error)
        .bind(t.at)
        .bind(i32::from(t.undo_claim))
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_operation(t.user_id, &t.op_id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::not_found("operation", &t.op_id)),
        }
    }

    async fn commit_operation(&self, commit: &OpCommit) -> Result<Option<ServerRecord>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        lock_operation(&mut tx, commit.user_id, &commit.op_id, commit.expected_state).await?;

        if let ConflictChange::Resolve { id, .. } = &commit.conflict {
            let row = sqlx::query("SELECT status FROM sync_conflicts WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_err)?
                .ok_or_else(|| StoreError::not_found("conflict", id))?;
            let status: String = col(&row, "status")?;
            if status != "unresolved" {
                return Err(StoreError::Conflict(format!("conflict {} already resolved", id)));
            }
        }

        let record = match &commit.write {
            Some(write) => Some(write_in_tx(&mut tx, write, commit.user_id, commit.at).await?),
            None => None,
        };

        match &commit.conflict {
            ConflictChange::None => {}
            ConflictChange::Insert(conflict) => insert_conflict(&mut tx, conflict).await?,
            ConflictChange::Resolve {
                id,
                resolved,
                strategy,
            } => {
                sqlx::query(
                    r#"
                    UPDATE sync_conflicts
                    SET status = 'resolved', resolved = $2, strategy_used = $3, resolved_at = $4
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(resolved)
                .bind(strategy.as_str())
                .bind(commit.at)
                .execute(&mut *tx)
                .await
                .map_err(map_err)?;
            }
        }

        sqlx::query(
            r#"
            UPDATE offline_operations
            SET state = 'applied', last_error = NULL, updated_at = $3
            WHERE user_id = $1 AND op_id = $2
            "#,
        )
        .bind(commit.user_id)
        .bind(&commit.op_id)
        .bind(commit.at)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;

        tx.commit().await.map_err(map_err)?;
        Ok(record)
    }

    async fn park_conflict(
        &self,
        conflict: &SyncConflict,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        lock_operation(&mut tx, conflict.user_id, &conflict.op_id, OperationState::InFlight).await?;
        insert_conflict(&mut tx, conflict).await?;
        sqlx::query(
            "UPDATE offline_operations SET state = 'conflicted', updated_at = $3 WHERE user_id = $1 AND op_id = $2",
        )
        .bind(conflict.user_id)
        .bind(&conflict.op_id)
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;
        tx.commit().await.map_err(map_err)?;
        Ok(())
    }

    async fn users_with_due_operations(&self, now: DateTime<Utc>) -> Result<Vec<UserId>, StoreError> {
        sqlx::query(
            "SELECT DISTINCT user_id FROM offline_operations WHERE state = 'pending' AND next_attempt_at <= $1 ORDER BY user_id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?
        .iter()
        .map(|row| col(row, "user_id"))
        .collect()
    }

    async fn stale_in_flight(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<OfflineOperation>, StoreError> {
        sqlx::query(&format!(
            "SELECT {} FROM offline_operations WHERE state = 'in-flight' AND updated_at < $1 ORDER BY seq",
            OPERATION_COLUMNS
        ))
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?
        .iter()
        .map(operation_from_row)
        .collect()
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM offline_operations WHERE state IN ('applied', 'dead') AND updated_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn get_record(
        &self,
        table: &str,
        record_id: &str,
    ) -> Result<Option<ServerRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT v.version, v.last_writer_user_id, v.last_written_at, r.value
            FROM data_versions v
            LEFT JOIN sync_records r USING (table_name, record_id)
            WHERE v.table_name = $1 AND v.record_id = $2
            "#,
        )
        .bind(table)
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let value: Option<Value> = col(&row, "value")?;
        Ok(Some(ServerRecord {
            table: table.to_string(),
            record_id: record_id.to_string(),
            value,
            version: col(&row, "version")?,
            last_writer_user_id: col(&row, "last_writer_user_id")?,
            last_written_at: col(&row, "last_written_at")?,
        }))
    }

    async fn write_record(
        &self,
        write: &RecordWrite,
        writer: UserId,
        at: DateTime<Utc>,
    ) -> Result<ServerRecord, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let record = write_in_tx(&mut tx, write, writer, at).await?;
        tx.commit().await.map_err(map_err)?;
        Ok(record)
    }

    async fn get_conflict(&self, id: Uuid) -> Result<Option<SyncConflict>, StoreError> {
        sqlx::query(&format!(
            "SELECT {} FROM sync_conflicts WHERE id = $1",
            CONFLICT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?
        .map(|row| conflict_from_row(&row))
        .transpose()
    }

    async fn list_conflicts(
        &self,
        user_id: UserId,
        limit_n: usize,
    ) -> Result<Vec<SyncConflict>, StoreError> {
        sqlx::query(&format!(
            "SELECT {} FROM sync_conflicts WHERE user_id = $1 ORDER BY created_at DESC, id LIMIT $2",
            CONFLICT_COLUMNS
        ))
        .bind(user_id)
        .bind(limit(limit_n))
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?
        .iter()
        .map(conflict_from_row)
        .collect()
    }

    async fn get_status(&self, user_id: UserId) -> Result<Option<SyncStatus>, StoreError> {
        sqlx::query(&format!(
            "SELECT {} FROM sync_statuses WHERE user_id = $1",
            STATUS_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?
        .map(|row| status_from_row(&row))
        .transpose()
    }

    async fn set_online(
        &self,
        user_id: UserId,
        online: bool,
        at: DateTime<Utc>,
    ) -> Result<SyncStatus, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO sync_statuses (user_id, online, last_online_at)
            VALUES ($1, $2, CASE WHEN $2 THEN $3::timestamptz ELSE NULL END)
            ON CONFLICT (user_id) DO UPDATE
            SET online = EXCLUDED.online,
                last_online_at = CASE WHEN EXCLUDED.online THEN $3::timestamptz
                                      ELSE sync_statuses.last_online_at END
            RETURNING {}
            "#,
            STATUS_COLUMNS
        ))
        .bind(user_id)
        .bind(online)
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        status_from_row(&row)
    }

    async fn refresh_status(&self, user_id: UserId) -> Result<SyncStatus, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(map_err)?;
        refresh_in(&mut conn, user_id).await
    }

    async fn complete_sync(
        &self,
        entry: &SyncHistoryEntry,
        sync_token: i64,
    ) -> Result<SyncStatus, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        refresh_in(&mut tx, entry.user_id).await?;

        let row = sqlx::query(&format!(
            "UPDATE sync_statuses SET sync_token = $2, last_sync_at = $3 WHERE user_id = $1 RETURNING {}",
            STATUS_COLUMNS
        ))
        .bind(entry.user_id)
        .bind(sync_token)
        .bind(entry.finished_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_err)?;
        let status = status_from_row(&row)?;

        sqlx::query(&format!(
            "INSERT INTO sync_history ({}) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            HISTORY_COLUMNS
        ))
        .bind(entry.id)
        .bind(entry.user_id)
        .bind(entry.started_at)
        .bind(entry.finished_at)
        .bind(entry.processed)
        .bind(entry.conflicts_resolved)
        .bind(entry.outcome.as_str())
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;

        tx.commit().await.map_err(map_err)?;
        Ok(status)
    }

    async fn list_history(
        &self,
        user_id: UserId,
        limit_n: usize,
    ) -> Result<Vec<SyncHistoryEntry>, StoreError> {
        sqlx::query(&format!(
            "SELECT {} FROM sync_history WHERE user_id = $1 ORDER BY finished_at DESC, id LIMIT $2",
            HISTORY_COLUMNS
        ))
        .bind(user_id)
        .bind(limit(limit_n))
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?
        .iter()
        .map(history_from_row)
        .collect()
    }
}
