//! PostgreSQL change capture via logical decoding.
//!
//! # Architecture
//!
//! The capture client uses a **polling** approach over a regular
//! connection:
//! - Lazily creates the publication (`kasho_pub FOR ALL TABLES`) and the
//!   logical slot (`kasho_slot`) with the configured output plugin
//! - Calls `pg_logical_slot_peek_changes()` each poll cycle and decodes
//!   the plugin output (`wal2json` format version 2, or the textual
//!   `pgoutput` form) into typed changes
//! - Advances the slot with `pg_replication_slot_advance()` only after
//!   every peeked change is durably in the buffer, so a crash between
//!   peek and advance replays instead of losing data
//!
//! # DDL side channel
//!
//! Logical decoding does not emit DDL. The client installs a
//! `kasho_ddl_log` table plus an event trigger on `ddl_command_end`
//! that records each schema statement with the WAL position current at
//! execution time. Poll cycles read that table and interleave its rows
//! into the stream by position; consumed rows are deleted.
//!
//! # Prerequisites
//!
//! - `wal_level = logical`
//! - an available replication slot (`max_replication_slots`)
//! - the configured output plugin available on the server

use std::sync::Arc;

use tokio::sync::watch;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info, warn};

use crate::buffer::ChangeStore;
use crate::buffer::redis::RedisBuffer;
use crate::change::{Change, Column, DdlChange, DmlChange, Operation, Position, SqlValue};
use crate::config::Settings;
use crate::dialect::Dialect;
use crate::error::KashoError;

/// Maximum changes peeked per poll cycle. Bounds memory; the remainder
/// is picked up next cycle.
const MAX_CHANGES_PER_POLL: i64 = 10_000;

pub struct PostgresCapture {
    client: Client,
    settings: Settings,
}

impl PostgresCapture {
    /// Connect, install the capture plumbing, and poll until shutdown.
    pub async fn run(
        settings: &Settings,
        buffer: &Arc<RedisBuffer>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), KashoError> {
        let mut capture = Self::connect(settings.clone()).await?;
        capture.ensure_ddl_log().await?;
        capture.ensure_publication().await?;
        let slot_lsn = capture.ensure_slot().await?;
        info!(slot = %capture.settings.slot_name, confirmed = %slot_lsn, "postgres capture ready");

        let poll_interval = std::time::Duration::from_millis(capture.settings.poll_interval_ms);
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let appended = capture.poll_once(buffer).await?;
            if appended == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    async fn connect(settings: Settings) -> Result<Self, KashoError> {
        let dsn = Dialect::Postgres.format_dsn(&settings.primary_database_url);
        let (client, connection) = tokio_postgres::connect(&dsn, NoTls)
            .await
            .map_err(classify_connect_error)?;
        // The connection object drives the socket; it lives in its own
        // task and ends when the client is dropped.
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!(error = %err, "postgres source connection closed");
            }
        });
        Ok(PostgresCapture { client, settings })
    }

    // ── Source-side plumbing ─────────────────────────────────────────────

    /// Install the DDL side-channel table and its event trigger.
    async fn ensure_ddl_log(&self) -> Result<(), KashoError> {
        self.client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS kasho_ddl_log (
                     id        BIGSERIAL PRIMARY KEY,
                     position  TEXT NOT NULL,
                     ts        TIMESTAMPTZ NOT NULL DEFAULT now(),
                     username  TEXT NOT NULL,
                     database  TEXT NOT NULL,
                     ddl       TEXT NOT NULL
                 )",
            )
            .await?;

        self.client
            .batch_execute(
                "CREATE OR REPLACE FUNCTION kasho_ddl_capture() RETURNS event_trigger
                 LANGUAGE plpgsql AS $$
                 BEGIN
                     INSERT INTO kasho_ddl_log (position, username, database, ddl)
                     VALUES (pg_current_wal_lsn()::text,
                             session_user,
                             current_database(),
                             current_query());
                 END;
                 $$",
            )
            .await?;

        // No CREATE EVENT TRIGGER IF NOT EXISTS; check the catalog first.
        let exists: bool = self
            .client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM pg_event_trigger WHERE evtname = 'kasho_ddl_tracker')",
                &[],
            )
            .await?
            .get(0);
        if !exists {
            self.client
                .batch_execute(
                    "CREATE EVENT TRIGGER kasho_ddl_tracker
                     ON ddl_command_end
                     EXECUTE FUNCTION kasho_ddl_capture()",
                )
                .await?;
        }
        Ok(())
    }

    /// Create the publication if absent.
    async fn ensure_publication(&self) -> Result<(), KashoError> {
        let exists: bool = self
            .client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM pg_publication WHERE pubname = $1)",
                &[&self.settings.publication],
            )
            .await?
            .get(0);
        if !exists {
            let sql = format!(
                "CREATE PUBLICATION {} FOR ALL TABLES",
                Dialect::Postgres.quote_ident(&self.settings.publication)
            );
            self.client.batch_execute(&sql).await.map_err(|e| {
                KashoError::Config(format!(
                    "cannot create publication {}: {e}",
                    self.settings.publication
                ))
            })?;
        }
        Ok(())
    }

    /// Create the logical slot if absent; returns the confirmed LSN.
    ///
    /// The slot captures WAL from the moment of creation, so nothing is
    /// missed between creation and the first poll.
    async fn ensure_slot(&self) -> Result<String, KashoError> {
        let existing: Option<String> = self
            .client
            .query_opt(
                "SELECT confirmed_flush_lsn::text FROM pg_replication_slots WHERE slot_name = $1",
                &[&self.settings.slot_name],
            )
            .await?
            .map(|row| row.get(0));
        if let Some(lsn) = existing {
            return Ok(lsn);
        }

        let row = self
            .client
            .query_one(
                "SELECT lsn::text FROM pg_create_logical_replication_slot($1, $2)",
                &[&self.settings.slot_name, &self.settings.pg_plugin],
            )
            .await
            .map_err(|e| {
                KashoError::Config(format!(
                    "cannot create replication slot {} with plugin {}: {e}",
                    self.settings.slot_name, self.settings.pg_plugin
                ))
            })?;
        Ok(row.get(0))
    }

    // ── Polling ──────────────────────────────────────────────────────────

    fn poll_sql(&self) -> String {
        let options = match self.settings.pg_plugin.as_str() {
            "wal2json" => "'format-version', '2', 'include-lsn', 'true'".to_string(),
            _ => format!(
                "'proto_version', '1', 'publication_names', '{}'",
                self.settings.publication
            ),
        };
        format!(
            "SELECT lsn::text, xid::text, data \
             FROM pg_logical_slot_peek_changes('{slot}', NULL, {max}, {options})",
            slot = self.settings.slot_name,
            max = MAX_CHANGES_PER_POLL,
        )
    }

    /// One peek/append/advance cycle. Returns the number of changes
    /// appended to the buffer.
    async fn poll_once(&mut self, buffer: &Arc<RedisBuffer>) -> Result<usize, KashoError> {
        let rows = self.client.query(&self.poll_sql(), &[]).await?;
        let peeked = !rows.is_empty();

        let mut dml: Vec<Change> = Vec::new();
        let mut last_raw_lsn: Option<String> = None;
        let mut ordinal = 0u32;
        let mut advance_to: Option<String> = None;
        for row in rows {
            let lsn: String = row.get(0);
            let data: String = row.get(2);
            let position = Position::from_lsn_text(&lsn)
                .ok_or_else(|| KashoError::Protocol(format!("bad LSN {lsn:?} from slot")))?;
            advance_to = Some(lsn.clone());

            let decoded = match self.settings.pg_plugin.as_str() {
                "wal2json" => decode_wal2json(&position, &data)?,
                _ => decode_pgoutput(&position, &data),
            };
            let Some(mut change) = decoded else { continue };

            // Rows of one transaction can share an LSN; suffix a row
            // ordinal so positions stay strictly ascending. The ordinal
            // restarts with each distinct LSN, which keeps re-peeks of
            // the same window byte-identical.
            if last_raw_lsn.as_deref() == Some(lsn.as_str()) {
                ordinal += 1;
                change.position = Position::new(format!("{}.{ordinal:04}", change.position));
            } else {
                ordinal = 0;
                last_raw_lsn = Some(lsn.clone());
            }
            dml.push(change);
        }

        let ddl = self.fetch_ddl(dml.last().map(|c| &c.position)).await?;
        let appended = self.merge_and_append(buffer, dml, ddl).await?;

        if let Some(lsn) = advance_to {
            // Everything peeked up to this LSN is durable (or was a
            // transaction marker); let the server reclaim WAL.
            self.client
                .execute(
                    "SELECT pg_replication_slot_advance($1, $2::pg_lsn)",
                    &[&self.settings.slot_name, &lsn],
                )
                .await?;
        } else if !peeked {
            // Keepalive: nothing pending below the current write head,
            // so it is a safe position even though no change was emitted.
            let head: String = self
                .client
                .query_one("SELECT pg_current_wal_lsn()::text", &[])
                .await?
                .get(0);
            if let Some(position) = Position::from_lsn_text(&head) {
                buffer
                    .record_capture_position(&self.settings.stream_id, &position)
                    .await?;
            }
        }
        Ok(appended)
    }

    /// DDL rows at or below the current DML high-water mark (all of them
    /// when the poll produced no DML).
    async fn fetch_ddl(&self, up_to: Option<&Position>) -> Result<Vec<(i64, Change)>, KashoError> {
        let rows = self
            .client
            .query(
                "SELECT id, position, username, database, ddl FROM kasho_ddl_log ORDER BY id",
                &[],
            )
            .await?;
        let mut changes = Vec::new();
        for row in rows {
            let id: i64 = row.get(0);
            let raw: String = row.get(1);
            let Some(position) = Position::from_lsn_text(&raw) else {
                warn!(id, position = %raw, "skipping ddl_log row with bad position");
                continue;
            };
            if let Some(limit) = up_to {
                if position > *limit {
                    continue;
                }
            }
            let statement: String = row.get(4);
            // The event trigger records our own plumbing too; drop it.
            if statement.contains("kasho_ddl_log") || statement.contains("kasho_ddl_capture") {
                self.client
                    .execute("DELETE FROM kasho_ddl_log WHERE id = $1", &[&id])
                    .await?;
                continue;
            }
            changes.push((
                id,
                Change::ddl(
                    position,
                    DdlChange {
                        statement,
                        username: row.get(2),
                        database: row.get(3),
                    },
                ),
            ));
        }
        Ok(changes)
    }

    /// Merge DML and DDL by position, append in order, then delete the
    /// consumed DDL rows.
    async fn merge_and_append(
        &self,
        buffer: &Arc<RedisBuffer>,
        dml: Vec<Change>,
        ddl: Vec<(i64, Change)>,
    ) -> Result<usize, KashoError> {
        let mut merged: Vec<(Option<i64>, Change)> = Vec::with_capacity(dml.len() + ddl.len());
        merged.extend(dml.into_iter().map(|c| (None, c)));
        merged.extend(ddl.into_iter().map(|(id, c)| (Some(id), c)));
        merged.sort_by(|a, b| a.1.position.cmp(&b.1.position));

        let mut appended = 0;
        let mut last_position: Option<Position> = None;
        for (ddl_id, change) in merged {
            let position = change.position.clone();
            buffer.append(&change).await?;
            if let Some(id) = ddl_id {
                self.client
                    .execute("DELETE FROM kasho_ddl_log WHERE id = $1", &[&id])
                    .await?;
            }
            appended += 1;
            last_position = Some(position);
        }
        if let Some(position) = last_position {
            buffer
                .record_capture_position(&self.settings.stream_id, &position)
                .await?;
        }
        Ok(appended)
    }
}

/// Fatal connect errors (bad credentials, unknown database) must stop
/// the service; everything else retries.
fn classify_connect_error(err: tokio_postgres::Error) -> KashoError {
    let fatal = err
        .code()
        .map(|c| {
            matches!(
                c.code(),
                "28000" | "28P01" | "3D000" // auth failure, bad password, no database
            )
        })
        .unwrap_or(false);
    if fatal {
        KashoError::Config(format!("source rejected connection: {err}"))
    } else {
        KashoError::connect("postgres", err)
    }
}

// ── wal2json decoding ──────────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
struct Wal2JsonMessage {
    action: String,
    #[serde(default)]
    schema: String,
    #[serde(default)]
    table: String,
    #[serde(default)]
    columns: Vec<Wal2JsonColumn>,
    #[serde(default)]
    identity: Vec<Wal2JsonColumn>,
}

#[derive(Debug, serde::Deserialize)]
struct Wal2JsonColumn {
    name: String,
    #[serde(rename = "type", default)]
    type_name: String,
    #[serde(default)]
    value: serde_json::Value,
}

/// Decode one wal2json format-version-2 message. Transaction markers
/// (`B`/`C`) and messages (`M`) yield no change.
fn decode_wal2json(position: &Position, data: &str) -> Result<Option<Change>, KashoError> {
    let msg: Wal2JsonMessage = serde_json::from_str(data)
        .map_err(|e| KashoError::Protocol(format!("wal2json decode: {e}")))?;

    let op = match msg.action.as_str() {
        "I" => Operation::Insert,
        "U" => Operation::Update,
        "D" => Operation::Delete,
        "B" | "C" | "M" | "T" => return Ok(None),
        other => {
            return Err(KashoError::Protocol(format!("wal2json action {other:?}")));
        }
    };

    let table = format!("{}.{}", msg.schema, msg.table);
    let columns = msg
        .columns
        .into_iter()
        .map(|c| Column::new(c.name, wal2json_value(&c.type_name, c.value)))
        .collect();
    let old_keys = msg
        .identity
        .into_iter()
        .map(|c| Column::new(c.name, wal2json_value(&c.type_name, c.value)))
        .collect();

    Ok(Some(Change::dml(
        position.clone(),
        DmlChange { table, op, columns, old_keys },
    )))
}

/// Map a wal2json column to the typed union using the declared type.
fn wal2json_value(type_name: &str, value: serde_json::Value) -> SqlValue {
    use serde_json::Value;
    if value.is_null() {
        return SqlValue::Null;
    }
    let base = type_name.split('(').next().unwrap_or(type_name).trim();
    match base {
        "smallint" | "integer" | "bigint" | "smallserial" | "serial" | "bigserial" | "oid" => {
            match &value {
                Value::Number(n) => n
                    .as_i64()
                    .map(SqlValue::Int)
                    .unwrap_or_else(|| SqlValue::Text(json_text(&value))),
                other => SqlValue::Text(json_text(other)),
            }
        }
        "real" | "double precision" | "numeric" | "decimal" => match &value {
            Value::Number(n) => n
                .as_f64()
                .map(SqlValue::Float)
                .unwrap_or_else(|| SqlValue::Text(json_text(&value))),
            other => SqlValue::Text(json_text(other)),
        },
        "boolean" => match &value {
            Value::Bool(b) => SqlValue::Bool(*b),
            other => SqlValue::Text(json_text(other)),
        },
        "timestamp without time zone" | "timestamp with time zone" => {
            parse_pg_timestamp(&json_text(&value))
                .map(SqlValue::Timestamp)
                .unwrap_or_else(|| SqlValue::Text(json_text(&value)))
        }
        "bytea" => {
            let text = json_text(&value);
            let stripped = text.strip_prefix("\\x").unwrap_or(&text);
            hex::decode(stripped)
                .map(SqlValue::Bytes)
                .unwrap_or(SqlValue::Text(text))
        }
        _ => SqlValue::Text(json_text(&value)),
    }
}

fn json_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// wal2json renders timestamps as `2024-03-01 12:30:45.123456+00` (or
/// without zone for `timestamp`). Both parse to UTC.
fn parse_pg_timestamp(text: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    use chrono::{DateTime, NaiveDateTime, Utc};
    if let Ok(ts) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

// ── pgoutput text decoding ─────────────────────────────────────────────────

/// Decode the textual pgoutput form: lines like
/// `table public.users: INSERT: id[integer]:1 name[text]:'Alice'`.
/// Non-DML lines yield no change.
fn decode_pgoutput(position: &Position, data: &str) -> Option<Change> {
    let (op, marker) = if data.contains("INSERT:") {
        (Operation::Insert, "INSERT:")
    } else if data.contains("UPDATE:") {
        (Operation::Update, "UPDATE:")
    } else if data.contains("DELETE:") {
        (Operation::Delete, "DELETE:")
    } else {
        return None;
    };

    let table = data
        .strip_prefix("table ")?
        .split(':')
        .next()?
        .trim()
        .to_string();
    let payload = &data[data.find(marker)? + marker.len()..];

    // UPDATE carries `old-key: … new-tuple: …` sections when the
    // replica identity includes old values.
    let (old_part, new_part) = match payload.find("new-tuple:") {
        Some(idx) => {
            let old = payload[..idx].trim().trim_start_matches("old-key:").trim();
            (Some(old), &payload[idx + "new-tuple:".len()..])
        }
        None => (None, payload),
    };

    // DELETE lines carry only the row identity, which arrives in the
    // main payload and belongs in old_keys.
    let (columns, old_keys) = match (op, old_part) {
        (Operation::Delete, _) => (Vec::new(), parse_pgoutput_columns(new_part)),
        (_, Some(old)) => (parse_pgoutput_columns(new_part), parse_pgoutput_columns(old)),
        _ => (parse_pgoutput_columns(new_part), Vec::new()),
    };
    Some(Change::dml(
        position.clone(),
        DmlChange { table, op, columns, old_keys },
    ))
}

/// Parse `name[type]:value` segments from a pgoutput payload.
fn parse_pgoutput_columns(payload: &str) -> Vec<Column> {
    let mut columns = Vec::new();
    for segment in split_pgoutput_segments(payload) {
        let Some(bracket) = segment.find('[') else { continue };
        let Some(close) = segment.find("]:") else { continue };
        if close < bracket {
            continue;
        }
        let name = &segment[..bracket];
        let type_name = &segment[bracket + 1..close];
        let raw = &segment[close + 2..];
        columns.push(Column::new(name, pgoutput_value(type_name, raw)));
    }
    columns
}

/// Split on spaces, keeping quoted values (which may contain spaces)
/// attached to their segment.
fn split_pgoutput_segments(payload: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut chars = payload.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                // Doubled quote inside a quoted value.
                if in_quote && chars.peek() == Some(&'\'') {
                    current.push('\'');
                    current.push(chars.next().unwrap());
                    continue;
                }
                in_quote = !in_quote;
                current.push(ch);
            }
            ' ' if !in_quote => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

fn pgoutput_value(type_name: &str, raw: &str) -> SqlValue {
    if raw == "null" {
        return SqlValue::Null;
    }
    let unquoted = raw
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .map(|s| s.replace("''", "'"));
    let text = unquoted.clone().unwrap_or_else(|| raw.to_string());

    let base = type_name.split('(').next().unwrap_or(type_name).trim();
    match base {
        "smallint" | "integer" | "bigint" => {
            text.parse().map(SqlValue::Int).unwrap_or(SqlValue::Text(text))
        }
        "real" | "double precision" | "numeric" => {
            text.parse().map(SqlValue::Float).unwrap_or(SqlValue::Text(text))
        }
        "boolean" => match text.as_str() {
            "true" | "t" => SqlValue::Bool(true),
            "false" | "f" => SqlValue::Bool(false),
            _ => SqlValue::Text(text),
        },
        "timestamp without time zone" | "timestamp with time zone" => parse_pg_timestamp(&text)
            .map(SqlValue::Timestamp)
            .unwrap_or(SqlValue::Text(text)),
        "bytea" => {
            let stripped = text.strip_prefix("\\x").unwrap_or(&text);
            hex::decode(stripped).map(SqlValue::Bytes).unwrap_or(SqlValue::Text(text))
        }
        _ => SqlValue::Text(text),
    }
}
