//! Postgres persistence backend.
//!
//! Complex records (replicas, contributions) are stored as JSONB documents
//! alongside the columns the query paths filter on; simple state snapshots
//! use plain columns. All statements go through the runtime query API so the
//! backend builds without a live database.

use sqlx::postgres::PgPoolOptions;
use sqlx::Row;

use crate::errors::{ReplicaError, ReplicaResult};
use crate::ingest::{ContribStatus, TransactionContribInfo, TransactionInfo, TransactionState};
use crate::protocol::now_ms;
use crate::replica::ReplicaInfo;

use super::{not_found, JobPersistentState, RequestPersistentState};

const INSTALL_STATEMENTS: [&str; 7] = [
    "CREATE TABLE IF NOT EXISTS controller_state (
        instance_id TEXT NOT NULL,
        start_time BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS request_state (
        id TEXT PRIMARY KEY,
        job_id TEXT,
        kind TEXT NOT NULL,
        worker TEXT NOT NULL,
        priority INT NOT NULL,
        state TEXT NOT NULL,
        extended_state TEXT NOT NULL,
        server_status TEXT NOT NULL,
        create_time BIGINT NOT NULL,
        start_time BIGINT NOT NULL,
        finish_time BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS job_state (
        id TEXT PRIMARY KEY,
        parent_id TEXT,
        kind TEXT NOT NULL,
        state TEXT NOT NULL,
        extended_state TEXT NOT NULL,
        priority INT NOT NULL,
        exclusive BOOL NOT NULL,
        preemptable BOOL NOT NULL,
        begin_time BIGINT NOT NULL,
        end_time BIGINT NOT NULL,
        heartbeat_time BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS replica (
        worker TEXT NOT NULL,
        database_name TEXT NOT NULL,
        chunk BIGINT NOT NULL,
        info JSONB NOT NULL,
        PRIMARY KEY (worker, database_name, chunk)
    )",
    "CREATE TABLE IF NOT EXISTS transaction_info (
        id SERIAL PRIMARY KEY,
        database_name TEXT NOT NULL,
        state TEXT NOT NULL,
        begin_time BIGINT NOT NULL,
        end_time BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS transaction_contrib (
        id SERIAL PRIMARY KEY,
        transaction_id BIGINT NOT NULL,
        worker TEXT NOT NULL,
        database_name TEXT NOT NULL,
        status TEXT NOT NULL,
        info JSONB NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS database_meta (
        name TEXT PRIMARY KEY
    )",
];

const DESTROY_STATEMENTS: [&str; 7] = [
    "DROP TABLE IF EXISTS controller_state",
    "DROP TABLE IF EXISTS request_state",
    "DROP TABLE IF EXISTS job_state",
    "DROP TABLE IF EXISTS replica",
    "DROP TABLE IF EXISTS transaction_info",
    "DROP TABLE IF EXISTS transaction_contrib",
    "DROP TABLE IF EXISTS database_meta",
];

/// Postgres backend handle; one small connection pool per handle, bounded
/// overall by the database services pool
#[derive(Debug, Clone)]
pub struct PostgresDatabaseServices {
    pool: sqlx::PgPool,
}

fn db_err(e: sqlx::Error) -> ReplicaError {
    ReplicaError::database(e.to_string())
}

fn parse_transaction_state(text: &str) -> ReplicaResult<TransactionState> {
    match text {
        "STARTED" => Ok(TransactionState::Started),
        "FINISHED" => Ok(TransactionState::Finished),
        "ABORTED" => Ok(TransactionState::Aborted),
        other => Err(ReplicaError::database(format!(
            "corrupt transaction state '{other}'"
        ))),
    }
}

impl PostgresDatabaseServices {
    /// Connect one handle to the store
    pub async fn connect(url: &str) -> ReplicaResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .map_err(db_err)?;
        Ok(Self { pool })
    }

    pub async fn install_meta(&self) -> ReplicaResult<()> {
        for statement in INSTALL_STATEMENTS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    pub async fn destroy_meta(&self) -> ReplicaResult<()> {
        for statement in DESTROY_STATEMENTS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    pub async fn save_controller_state(
        &self,
        instance_id: &str,
        start_time: u64,
    ) -> ReplicaResult<()> {
        sqlx::query("INSERT INTO controller_state (instance_id, start_time) VALUES ($1, $2)")
            .bind(instance_id)
            .bind(start_time as i64)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn save_request_state(&self, state: &RequestPersistentState) -> ReplicaResult<()> {
        sqlx::query(
            "INSERT INTO request_state
                 (id, job_id, kind, worker, priority, state, extended_state, server_status,
                  create_time, start_time, finish_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (id) DO UPDATE SET
                 job_id = EXCLUDED.job_id,
                 state = EXCLUDED.state,
                 extended_state = EXCLUDED.extended_state,
                 server_status = EXCLUDED.server_status,
                 create_time = EXCLUDED.create_time,
                 start_time = EXCLUDED.start_time,
                 finish_time = EXCLUDED.finish_time",
        )
        .bind(&state.id)
        .bind(&state.job_id)
        .bind(&state.kind)
        .bind(&state.worker)
        .bind(state.priority)
        .bind(&state.state)
        .bind(&state.extended_state)
        .bind(&state.server_status)
        .bind(state.performance.create_time as i64)
        .bind(state.performance.start_time as i64)
        .bind(state.performance.finish_time as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn save_job_state(&self, state: &JobPersistentState) -> ReplicaResult<()> {
        sqlx::query(
            "INSERT INTO job_state
                 (id, parent_id, kind, state, extended_state, priority, exclusive, preemptable,
                  begin_time, end_time, heartbeat_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (id) DO UPDATE SET
                 state = EXCLUDED.state,
                 extended_state = EXCLUDED.extended_state,
                 begin_time = EXCLUDED.begin_time,
                 end_time = EXCLUDED.end_time,
                 heartbeat_time = EXCLUDED.heartbeat_time",
        )
        .bind(&state.id)
        .bind(&state.parent_id)
        .bind(&state.kind)
        .bind(&state.state)
        .bind(&state.extended_state)
        .bind(state.priority)
        .bind(state.exclusive)
        .bind(state.preemptable)
        .bind(state.begin_time as i64)
        .bind(state.end_time as i64)
        .bind(state.heartbeat_time as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn update_job_heartbeat(&self, job_id: &str, time: u64) -> ReplicaResult<()> {
        let result = sqlx::query("UPDATE job_state SET heartbeat_time = $2 WHERE id = $1")
            .bind(job_id)
            .bind(time as i64)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(not_found(format!("job '{job_id}'")));
        }
        Ok(())
    }

    pub async fn save_replica_info_collection(
        &self,
        worker: &str,
        database: &str,
        replicas: &[ReplicaInfo],
    ) -> ReplicaResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM replica WHERE worker = $1 AND database_name = $2")
            .bind(worker)
            .bind(database)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        for replica in replicas {
            sqlx::query(
                "INSERT INTO replica (worker, database_name, chunk, info)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(worker)
            .bind(database)
            .bind(i64::from(replica.chunk))
            .bind(serde_json::to_value(replica)?)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    pub async fn find_database_replicas(&self, database: &str) -> ReplicaResult<Vec<ReplicaInfo>> {
        let rows = sqlx::query("SELECT info FROM replica WHERE database_name = $1")
            .bind(database)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter()
            .map(|row| {
                let info: serde_json::Value = row.try_get("info").map_err(db_err)?;
                serde_json::from_value(info).map_err(ReplicaError::from)
            })
            .collect()
    }

    pub async fn begin_transaction(&self, database: &str) -> ReplicaResult<TransactionInfo> {
        let begin_time = now_ms();
        let row = sqlx::query(
            "INSERT INTO transaction_info (database_name, state, begin_time, end_time)
             VALUES ($1, 'STARTED', $2, 0) RETURNING id",
        )
        .bind(database)
        .bind(begin_time as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let id: i32 = row.try_get("id").map_err(db_err)?;
        Ok(TransactionInfo {
            id: id as u32,
            database: database.to_string(),
            state: TransactionState::Started,
            begin_time,
            end_time: 0,
        })
    }

    pub async fn end_transaction(&self, id: u32, abort: bool) -> ReplicaResult<TransactionInfo> {
        let state = if abort { "ABORTED" } else { "FINISHED" };
        let end_time = now_ms();
        let result = sqlx::query(
            "UPDATE transaction_info SET state = $2, end_time = $3
             WHERE id = $1 AND state = 'STARTED'",
        )
        .bind(id as i64)
        .bind(state)
        .bind(end_time as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(not_found(format!("open transaction {id}")));
        }
        self.transaction(id).await
    }

    pub async fn transaction(&self, id: u32) -> ReplicaResult<TransactionInfo> {
        let row = sqlx::query(
            "SELECT database_name, state, begin_time, end_time FROM transaction_info WHERE id = $1",
        )
        .bind(id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| not_found(format!("transaction {id}")))?;
        Ok(TransactionInfo {
            id,
            database: row.try_get("database_name").map_err(db_err)?,
            state: parse_transaction_state(row.try_get("state").map_err(db_err)?)?,
            begin_time: row.try_get::<i64, _>("begin_time").map_err(db_err)? as u64,
            end_time: row.try_get::<i64, _>("end_time").map_err(db_err)? as u64,
        })
    }

    pub async fn transactions(
        &self,
        state: Option<TransactionState>,
    ) -> ReplicaResult<Vec<TransactionInfo>> {
        let rows = match state {
            Some(state) => sqlx::query(
                "SELECT id, database_name, state, begin_time, end_time
                 FROM transaction_info WHERE state = $1 ORDER BY id",
            )
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?,
            None => sqlx::query(
                "SELECT id, database_name, state, begin_time, end_time
                 FROM transaction_info ORDER BY id",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?,
        };
        rows.into_iter()
            .map(|row| {
                Ok(TransactionInfo {
                    id: row.try_get::<i32, _>("id").map_err(db_err)? as u32,
                    database: row.try_get("database_name").map_err(db_err)?,
                    state: parse_transaction_state(row.try_get("state").map_err(db_err)?)?,
                    begin_time: row.try_get::<i64, _>("begin_time").map_err(db_err)? as u64,
                    end_time: row.try_get::<i64, _>("end_time").map_err(db_err)? as u64,
                })
            })
            .collect()
    }

    pub async fn save_new_contrib(
        &self,
        contrib: &mut TransactionContribInfo,
    ) -> ReplicaResult<()> {
        let row = sqlx::query(
            "INSERT INTO transaction_contrib (transaction_id, worker, database_name, status, info)
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(i64::from(contrib.transaction_id))
        .bind(&contrib.worker)
        .bind(&contrib.database)
        .bind(contrib.status.as_str())
        .bind(serde_json::to_value(&*contrib)?)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let id: i32 = row.try_get("id").map_err(db_err)?;
        contrib.id = id as u32;
        // Refresh the stored document so it carries the assigned id
        self.save_contrib(contrib).await
    }

    pub async fn save_contrib(&self, contrib: &TransactionContribInfo) -> ReplicaResult<()> {
        let result = sqlx::query(
            "UPDATE transaction_contrib SET status = $2, info = $3 WHERE id = $1",
        )
        .bind(i64::from(contrib.id))
        .bind(contrib.status.as_str())
        .bind(serde_json::to_value(contrib)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(not_found(format!("contribution {}", contrib.id)));
        }
        Ok(())
    }

    pub async fn save_last_contrib_retry(
        &self,
        contrib: &TransactionContribInfo,
    ) -> ReplicaResult<()> {
        self.save_contrib(contrib).await
    }

    pub async fn contrib(&self, id: u32) -> ReplicaResult<TransactionContribInfo> {
        let row = sqlx::query("SELECT info FROM transaction_contrib WHERE id = $1")
            .bind(i64::from(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| not_found(format!("contribution {id}")))?;
        let info: serde_json::Value = row.try_get("info").map_err(db_err)?;
        serde_json::from_value(info).map_err(ReplicaError::from)
    }

    pub async fn transaction_contribs(
        &self,
        transaction_id: u32,
        status: Option<ContribStatus>,
        worker: Option<&str>,
    ) -> ReplicaResult<Vec<TransactionContribInfo>> {
        let rows = sqlx::query(
            "SELECT info FROM transaction_contrib
             WHERE transaction_id = $1
               AND ($2::TEXT IS NULL OR status = $2)
               AND ($3::TEXT IS NULL OR worker = $3)
             ORDER BY id",
        )
        .bind(i64::from(transaction_id))
        .bind(status.map(|s| s.as_str()))
        .bind(worker)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter()
            .map(|row| {
                let info: serde_json::Value = row.try_get("info").map_err(db_err)?;
                serde_json::from_value(info).map_err(ReplicaError::from)
            })
            .collect()
    }

    pub async fn register_database(&self, name: &str) -> ReplicaResult<()> {
        sqlx::query("INSERT INTO database_meta (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn unregister_database(&self, name: &str) -> ReplicaResult<()> {
        let result = sqlx::query("DELETE FROM database_meta WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(not_found(format!("database '{name}'")));
        }
        Ok(())
    }

    pub async fn list_databases(&self) -> ReplicaResult<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM database_meta ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter()
            .map(|row| row.try_get("name").map_err(db_err))
            .collect()
    }
}
