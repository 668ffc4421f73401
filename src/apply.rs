//! The apply loop: consume, transform, and write changes to a replica.
//!
//! One loop per replica, strictly sequential — changes are applied in
//! stream order, never reordered or parallelized. Each applied DML
//! change shares a transaction with the `kasho_apply_state` upsert
//! recording its position, so resume-after-crash continues exactly
//! where the replica's own state says it stopped.
//!
//! DDL runs outside the data transaction (several dialects refuse
//! multi-statement DDL inside one), then the position commit follows.
//!
//! Integrity violations (duplicate insert, vanished delete target)
//! downgrade to warnings and the position advances; syntax or schema
//! failures halt the loop for operator intervention; transient failures
//! reconnect and retry the same change.

use std::sync::Arc;
use std::time::Duration;

use mysql_async::prelude::Queryable;
use tokio::sync::watch;
use tokio_postgres::NoTls;
use tracing::{debug, error, info, warn};

use crate::buffer::ChangeStore;
use crate::buffer::redis::RedisBuffer;
use crate::buffer::server::ChangeStreamClient;
use crate::change::{Change, ChangePayload, Position};
use crate::config::Settings;
use crate::dialect::Dialect;
use crate::error::{ApplyErrorClass, KashoError, RetryPolicy, RetryState};
use crate::transform::TransformEngine;

/// How often the auto-increment/sequence state is synchronized when
/// replicated inserts are pending.
const AUTOINC_SYNC_INTERVAL: Duration = Duration::from_secs(15);

// ── Replica connection ─────────────────────────────────────────────────────

/// A replica session for either dialect with uniform execute/query
/// entry points. Statements arrive fully literalized.
pub enum ReplicaConn {
    Postgres(tokio_postgres::Client),
    MySql(mysql_async::Conn),
}

impl ReplicaConn {
    pub async fn connect(dialect: Dialect, url: &str) -> Result<Self, KashoError> {
        match dialect {
            Dialect::Postgres => {
                let dsn = dialect.format_dsn(url);
                let (client, connection) = tokio_postgres::connect(&dsn, NoTls).await?;
                tokio::spawn(async move {
                    if let Err(err) = connection.await {
                        debug!(error = %err, "replica connection closed");
                    }
                });
                Ok(ReplicaConn::Postgres(client))
            }
            Dialect::MySql => {
                let opts = mysql_async::Opts::from_url(url)
                    .map_err(|e| KashoError::Config(format!("invalid replica url: {e}")))?;
                Ok(ReplicaConn::MySql(mysql_async::Conn::new(opts).await?))
            }
        }
    }

    /// Execute a statement, discarding results.
    pub async fn execute(&mut self, sql: &str) -> Result<(), KashoError> {
        match self {
            ReplicaConn::Postgres(client) => {
                client.batch_execute(sql).await?;
            }
            ReplicaConn::MySql(conn) => {
                conn.query_drop(sql).await?;
            }
        }
        Ok(())
    }

    /// Execute a DML statement, returning affected rows, with replica
    /// errors classified for the apply policy.
    pub async fn execute_dml(&mut self, sql: &str) -> Result<u64, (ApplyErrorClass, String)> {
        match self {
            ReplicaConn::Postgres(client) => match client.execute(sql, &[]).await {
                Ok(affected) => Ok(affected),
                Err(err) => Err((classify_pg_apply_error(&err), err.to_string())),
            },
            ReplicaConn::MySql(conn) => match conn.query_iter(sql).await {
                Ok(result) => {
                    let affected = result.affected_rows();
                    result
                        .drop_result()
                        .await
                        .map_err(|e| (classify_mysql_apply_error(&e), e.to_string()))?;
                    Ok(affected)
                }
                Err(err) => Err((classify_mysql_apply_error(&err), err.to_string())),
            },
        }
    }

    pub async fn query_i64(&mut self, sql: &str) -> Result<i64, KashoError> {
        match self {
            ReplicaConn::Postgres(client) => {
                let row = client.query_one(sql, &[]).await?;
                Ok(row.get(0))
            }
            ReplicaConn::MySql(conn) => {
                let count: Option<i64> = conn.query_first(sql).await?;
                count.ok_or_else(|| KashoError::Protocol("count query returned no row".into()))
            }
        }
    }

    pub async fn query_string_opt(&mut self, sql: &str) -> Result<Option<String>, KashoError> {
        match self {
            ReplicaConn::Postgres(client) => {
                Ok(client.query_opt(sql, &[]).await?.map(|row| row.get(0)))
            }
            ReplicaConn::MySql(conn) => Ok(conn.query_first(sql).await?),
        }
    }
}

/// Postgres SQLSTATE class 23 is an integrity violation, class 42 a
/// syntax or schema problem; the rest is treated as transient.
fn classify_pg_apply_error(err: &tokio_postgres::Error) -> ApplyErrorClass {
    match err.code() {
        Some(state) if state.code().starts_with("23") => ApplyErrorClass::Integrity,
        Some(state) if state.code().starts_with("42") => ApplyErrorClass::Schema,
        _ => ApplyErrorClass::Transient,
    }
}

fn classify_mysql_apply_error(err: &mysql_async::Error) -> ApplyErrorClass {
    match err {
        mysql_async::Error::Server(server) => match server.code {
            1022 | 1062 | 1451 | 1452 => ApplyErrorClass::Integrity,
            1054 | 1064 | 1146 => ApplyErrorClass::Schema,
            _ => ApplyErrorClass::Transient,
        },
        _ => ApplyErrorClass::Transient,
    }
}

// ── Apply loop ─────────────────────────────────────────────────────────────

pub struct ApplyLoop {
    settings: Settings,
    dialect: Dialect,
    engine: TransformEngine,
    buffer: Arc<RedisBuffer>,
    consumer: String,
}

impl ApplyLoop {
    pub fn new(
        settings: Settings,
        engine: TransformEngine,
        buffer: Arc<RedisBuffer>,
    ) -> Result<Self, KashoError> {
        let dialect = Dialect::from_url(&settings.replica_database_url)?;
        let consumer = format!("apply:{}", settings.stream_id);
        Ok(ApplyLoop { settings, dialect, engine, buffer, consumer })
    }

    /// Run until shutdown. Retryable failures reconnect with backoff and
    /// resume from the replica-recorded position; fatal failures return.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), KashoError> {
        let policy = RetryPolicy::default();
        let mut retry = RetryState::new();

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            match self.run_session(&mut shutdown).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_fatal() => {
                    error!(error = %err, "fatal apply error, halting replica");
                    return Err(err);
                }
                Err(err) => {
                    let delay = retry.record_failure(&policy);
                    warn!(
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "apply interrupted, reconnecting"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    /// One connected session: subscribe at the right position and apply
    /// until an error or shutdown.
    async fn run_session(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), KashoError> {
        let mut conn = ReplicaConn::connect(self.dialect, &self.settings.replica_database_url).await?;
        for stmt in self.dialect.setup_connection_sql() {
            conn.execute(stmt).await?;
        }
        conn.execute(self.dialect.apply_state_create_sql()).await?;

        let last_applied = conn
            .query_string_opt(&self.dialect.apply_state_select_query(&self.settings.stream_id))
            .await?;
        let user_tables = conn
            .query_i64(self.dialect.user_tables_count_query())
            .await?;

        // A virgin replica replays from the synthetic bootstrap range;
        // anything else resumes after its own recorded position.
        let request = match (&last_applied, user_tables) {
            (_, 0) => "bootstrap".to_string(),
            (Some(position), _) => position.clone(),
            (None, _) => String::new(),
        };
        info!(
            replica = self.dialect.name(),
            user_tables,
            from = %request,
            "apply loop subscribing"
        );

        let mut client =
            ChangeStreamClient::connect(&self.settings.change_stream_addr, &request).await?;

        let mut pending_autoinc = false;
        let mut sync_ticker = tokio::time::interval(AUTOINC_SYNC_INTERVAL);
        sync_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Drain: sync identity state before exiting.
                        if pending_autoinc {
                            self.sync_autoinc(&mut conn).await.ok();
                        }
                        return Ok(());
                    }
                }
                _ = sync_ticker.tick() => {
                    if pending_autoinc {
                        self.sync_autoinc(&mut conn).await?;
                        pending_autoinc = false;
                    }
                }
                change = client.next_change() => {
                    let change = change?;
                    let was_insert = self.apply_change(&mut conn, change).await?;
                    pending_autoinc |= was_insert;
                }
            }
        }
    }

    /// Apply one change and record its position. Returns whether it was
    /// an insert (which schedules an auto-increment sync).
    async fn apply_change(
        &self,
        conn: &mut ReplicaConn,
        change: Change,
    ) -> Result<bool, KashoError> {
        let change = self.engine.transform(change);
        let position = change.position.clone();
        let was_insert = change.is_insert();
        let state_upsert = self
            .dialect
            .apply_state_upsert_stmt(&self.settings.stream_id, position.as_str());

        match &change.payload {
            ChangePayload::Ddl(ddl) => {
                let sql = self.dialect.render_ddl(ddl);
                debug!(position = %position, "applying ddl");
                // Verbatim, outside any explicit transaction.
                if let Err((class, message)) = conn.execute_dml(&sql).await {
                    return self.handle_apply_error(conn, &position, class, message, &state_upsert).await;
                }
                conn.execute(&state_upsert).await?;
            }
            ChangePayload::Dml(dml) => {
                let sql = self.dialect.render_dml(dml)?;
                conn.execute(self.begin_stmt()).await?;
                match conn.execute_dml(&sql).await {
                    Ok(affected) => {
                        if affected == 0 && dml.op != crate::change::Operation::Insert {
                            warn!(
                                position = %position,
                                table = %dml.table,
                                op = %dml.op,
                                "target row missing on replica, advancing"
                            );
                        }
                        conn.execute(&state_upsert).await?;
                        conn.execute("COMMIT").await?;
                    }
                    Err((class, message)) => {
                        conn.execute("ROLLBACK").await.ok();
                        return self
                            .handle_apply_error(conn, &position, class, message, &state_upsert)
                            .await;
                    }
                }
            }
        }

        self.buffer.ack(&self.consumer, &position).await?;
        Ok(was_insert)
    }

    /// Apply-error policy: integrity warns and advances the position,
    /// schema halts, transient bubbles up for reconnect-and-retry.
    async fn handle_apply_error(
        &self,
        conn: &mut ReplicaConn,
        position: &Position,
        class: ApplyErrorClass,
        message: String,
        state_upsert: &str,
    ) -> Result<bool, KashoError> {
        match class {
            ApplyErrorClass::Integrity => {
                warn!(position = %position, error = %message, "integrity violation, advancing");
                conn.execute(state_upsert).await?;
                self.buffer.ack(&self.consumer, position).await?;
                Ok(false)
            }
            ApplyErrorClass::Schema | ApplyErrorClass::Transient => Err(KashoError::Apply {
                position: position.clone(),
                class,
                message,
            }),
        }
    }

    fn begin_stmt(&self) -> &'static str {
        match self.dialect {
            Dialect::Postgres => "BEGIN",
            Dialect::MySql => "START TRANSACTION",
        }
    }

    /// Bring sequences / AUTO_INCREMENT counters in line with the data,
    /// so inserts issued directly against the replica don't collide.
    async fn sync_autoinc(&self, conn: &mut ReplicaConn) -> Result<(), KashoError> {
        debug!(replica = self.dialect.name(), "synchronizing identity state");
        match conn {
            ReplicaConn::Postgres(client) => {
                let rows = client
                    .query(self.dialect.autoinc_discover_query(), &[])
                    .await?;
                for row in rows {
                    let (seq_schema, seq): (String, String) = (row.get(0), row.get(1));
                    let (table_schema, table, column): (String, String, String) =
                        (row.get(2), row.get(3), row.get(4));
                    let stmt = self.dialect.postgres_setval_stmt(
                        &seq_schema,
                        &seq,
                        &table_schema,
                        &table,
                        &column,
                    );
                    client.batch_execute(&stmt).await?;
                }
            }
            ReplicaConn::MySql(mysql) => {
                let tables: Vec<(String, String, String)> = mysql
                    .query(self.dialect.autoinc_discover_query())
                    .await?;
                for (schema, table, column) in tables {
                    let next: Option<u64> = mysql
                        .query_first(self.dialect.mysql_autoinc_max_query(&schema, &table, &column))
                        .await?;
                    if let Some(next) = next {
                        mysql
                            .query_drop(self.dialect.mysql_autoinc_set_stmt(&schema, &table, next))
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }
}
