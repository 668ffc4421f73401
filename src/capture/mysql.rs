//! MySQL change capture via the binary log.
//!
//! Registers as a replica against the source and consumes row-based
//! binlog events. The server must run with `binlog_format = ROW`,
//! `binlog_row_image = FULL` and, for stable resume coordinates,
//! `gtid_mode = ON`; the first two are verified at startup.
//!
//! Row events carry values but not column names, so a side connection
//! resolves each table's column list from `information_schema` the first
//! time a table map event references it. Any DDL statement invalidates
//! the whole cache — column positions may have shifted.
//!
//! DDL arrives inline as QUERY events; no side-channel table is needed
//! on MySQL.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use mysql_async::binlog::events::{EventData, QueryEvent, RowsEventData, TableMapEvent};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::prelude::Queryable;
use mysql_async::{BinlogStreamRequest, Conn, Opts, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::buffer::ChangeStore;
use crate::buffer::redis::RedisBuffer;
use crate::change::{Change, Column, DdlChange, DmlChange, Operation, Position, SqlValue};
use crate::config::Settings;
use crate::error::KashoError;

/// Replica server id; must be unique in the source's replication
/// topology and must not collide with real replicas.
const SERVER_ID: u32 = u32::MAX - 113;

pub struct MySqlCapture;

impl MySqlCapture {
    /// Connect, verify server configuration, and consume the binlog
    /// until shutdown.
    pub async fn run(
        settings: &Settings,
        buffer: &Arc<RedisBuffer>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), KashoError> {
        let opts = Opts::from_url(&settings.primary_database_url)
            .map_err(|e| KashoError::Config(format!("invalid mysql url: {e}")))?;

        let mut side = Conn::new(opts.clone()).await?;
        verify_binlog_config(&mut side).await?;

        let (file, offset) = resume_coordinates(&mut side, buffer, &settings.stream_id).await?;
        info!(file = %file, offset, "mysql capture starting");
        let mut file_suffix = binlog_file_suffix(&file)?;

        let binlog_conn = Conn::new(opts.clone()).await?;
        let mut stream = binlog_conn
            .get_binlog_stream(
                BinlogStreamRequest::new(SERVER_ID)
                    .with_filename(file.as_bytes())
                    .with_pos(offset),
            )
            .await?;

        let mut schemas = SchemaCache::new(side);
        let mut username = username_from_opts(&opts);
        if username.is_empty() {
            username = "replication".to_string();
        }

        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                    continue;
                }
                event = stream.next() => match event {
                    Some(event) => event?,
                    None => return Err(KashoError::connect("mysql", "binlog stream ended")),
                },
            };

            let offset = u64::from(event.header().log_pos());
            let position = Position::from_binlog(file_suffix, offset);

            let Some(data) = event
                .read_data()
                .map_err(|e| KashoError::Protocol(format!("binlog event decode: {e}")))?
            else {
                continue;
            };

            match data {
                EventData::RotateEvent(rotate) => {
                    file_suffix = binlog_file_suffix(&rotate.name())?;
                    debug!(file = %rotate.name(), "binlog rotated");
                }
                EventData::QueryEvent(query) => {
                    if let Some(change) = query_to_ddl(&query, &position, &username) {
                        // Schema changed; cached column lists are stale.
                        schemas.invalidate();
                        buffer.append(&change).await?;
                        buffer
                            .record_capture_position(&settings.stream_id, &position)
                            .await?;
                    }
                }
                EventData::RowsEvent(rows_event) => {
                    let Some(tme) = stream.get_tme(rows_event.table_id()) else {
                        return Err(KashoError::Protocol(format!(
                            "no table map for table id {}",
                            rows_event.table_id()
                        )));
                    };
                    let changes = decode_rows_event(&rows_event, tme, &position, &mut schemas).await?;
                    for change in &changes {
                        buffer.append(change).await?;
                    }
                    if !changes.is_empty() {
                        buffer
                            .record_capture_position(&settings.stream_id, &position)
                            .await?;
                    }
                }
                EventData::HeartbeatEvent => {
                    // Advances the safe position without emitting a change.
                    buffer
                        .record_capture_position(&settings.stream_id, &position)
                        .await?;
                }
                _ => {}
            }
        }
    }
}

/// `binlog_format` and `binlog_row_image` are session-invisible server
/// settings the capture cannot work without; refusing to start beats
/// silently missing column data.
async fn verify_binlog_config(conn: &mut Conn) -> Result<(), KashoError> {
    let format: Option<String> = conn.query_first("SELECT @@binlog_format").await?;
    if format.as_deref() != Some("ROW") {
        return Err(KashoError::Config(format!(
            "source binlog_format must be ROW, found {format:?}"
        )));
    }
    let image: Option<String> = conn.query_first("SELECT @@binlog_row_image").await?;
    if image.as_deref() != Some("FULL") {
        return Err(KashoError::Config(format!(
            "source binlog_row_image must be FULL, found {image:?}"
        )));
    }
    Ok(())
}

/// Where to start reading: the durably recorded capture position when
/// one exists, otherwise the source's current coordinates.
async fn resume_coordinates(
    conn: &mut Conn,
    buffer: &Arc<RedisBuffer>,
    stream_id: &str,
) -> Result<(String, u64), KashoError> {
    let row: Option<(String, u64)> = conn
        .query_first("SHOW MASTER STATUS")
        .await?
        .map(|(file, pos, _, _, _): (String, u64, String, String, String)| (file, pos));
    let (current_file, current_pos) = row.ok_or_else(|| {
        KashoError::Config("SHOW MASTER STATUS returned nothing; is binary logging enabled?".into())
    })?;

    match buffer.capture_position(stream_id).await? {
        Some(position) => match parse_binlog_position(position.as_str()) {
            Some((suffix, offset)) => {
                let base = current_file
                    .rsplit_once('.')
                    .map(|(base, _)| base)
                    .unwrap_or(&current_file);
                Ok((format!("{base}.{suffix:06}"), offset))
            }
            None => {
                warn!(position = %position, "unparseable stored position, starting from head");
                Ok((current_file, current_pos))
            }
        },
        None => Ok((current_file, current_pos)),
    }
}

/// Extract the numeric suffix of a binlog file name (`binlog.000007` → 7).
fn binlog_file_suffix(file: &str) -> Result<u64, KashoError> {
    file.rsplit_once('.')
        .and_then(|(_, suffix)| suffix.parse().ok())
        .ok_or_else(|| KashoError::Protocol(format!("unexpected binlog file name {file:?}")))
}

/// Inverse of [`Position::from_binlog`]: `NNNNNN:PPPPPPPPPP`.
fn parse_binlog_position(raw: &str) -> Option<(u64, u64)> {
    let (suffix, offset) = raw.split_once(':')?;
    Some((suffix.parse().ok()?, offset.parse().ok()?))
}

fn username_from_opts(opts: &Opts) -> String {
    opts.user().unwrap_or_default().to_string()
}

/// Statements that mark transaction boundaries rather than schema
/// changes; everything else in a QUERY event is DDL on a ROW-format
/// server.
fn query_to_ddl(query: &QueryEvent<'_>, position: &Position, username: &str) -> Option<Change> {
    let statement = query.query().trim().to_string();
    let upper = statement.to_uppercase();
    if statement.is_empty()
        || upper == "BEGIN"
        || upper == "COMMIT"
        || upper == "ROLLBACK"
        || upper.starts_with("XA ")
        || upper.starts_with("SAVEPOINT")
        || upper.starts_with("FLUSH")
        || upper.starts_with("GRANT")
        || upper.starts_with("SET ")
    {
        return None;
    }
    Some(Change::ddl(
        position.clone(),
        DdlChange {
            statement,
            username: username.to_string(),
            database: query.schema().to_string(),
        },
    ))
}

// ── Row decoding ───────────────────────────────────────────────────────────

/// Column-name resolver backed by `information_schema` on a side
/// connection, cached per table.
struct SchemaCache {
    conn: Conn,
    columns: HashMap<(String, String), Arc<Vec<String>>>,
}

impl SchemaCache {
    fn new(conn: Conn) -> Self {
        SchemaCache { conn, columns: HashMap::new() }
    }

    fn invalidate(&mut self) {
        self.columns.clear();
    }

    async fn columns_for(
        &mut self,
        schema: &str,
        table: &str,
    ) -> Result<Arc<Vec<String>>, KashoError> {
        let key = (schema.to_string(), table.to_string());
        if let Some(columns) = self.columns.get(&key) {
            return Ok(Arc::clone(columns));
        }
        let names: Vec<String> = self
            .conn
            .exec(
                "SELECT column_name FROM information_schema.columns \
                 WHERE table_schema = ? AND table_name = ? ORDER BY ordinal_position",
                (schema, table),
            )
            .await?;
        if names.is_empty() {
            return Err(KashoError::Protocol(format!(
                "no columns found for {schema}.{table}"
            )));
        }
        let names = Arc::new(names);
        self.columns.insert(key, Arc::clone(&names));
        Ok(names)
    }
}

/// Decode one rows event into per-row changes. Rows within the event
/// share the event position suffixed with a row ordinal.
async fn decode_rows_event(
    rows_event: &RowsEventData<'_>,
    tme: &TableMapEvent<'_>,
    position: &Position,
    schemas: &mut SchemaCache,
) -> Result<Vec<Change>, KashoError> {
    let schema = tme.database_name().to_string();
    let table_name = tme.table_name().to_string();
    let column_names = schemas.columns_for(&schema, &table_name).await?;
    let table = format!("{schema}.{table_name}");

    let (op, rows): (Operation, Vec<(Option<BinlogRow>, Option<BinlogRow>)>) = match rows_event {
        RowsEventData::WriteRowsEvent(ev) => (
            Operation::Insert,
            ev.rows(tme).collect::<Result<_, _>>().map_err(rows_decode_err)?,
        ),
        RowsEventData::UpdateRowsEvent(ev) => (
            Operation::Update,
            ev.rows(tme).collect::<Result<_, _>>().map_err(rows_decode_err)?,
        ),
        RowsEventData::DeleteRowsEvent(ev) => (
            Operation::Delete,
            ev.rows(tme).collect::<Result<_, _>>().map_err(rows_decode_err)?,
        ),
        _ => return Ok(Vec::new()),
    };

    let mut changes = Vec::with_capacity(rows.len());
    for (ordinal, (before, after)) in rows.into_iter().enumerate() {
        let row_position = row_position(position, ordinal);

        let columns = match &after {
            Some(row) => binlog_row_to_columns(row, &column_names)?,
            None => Vec::new(),
        };
        // FULL row image: the entire before-image identifies the row.
        let old_keys = match &before {
            Some(row) => binlog_row_to_columns(row, &column_names)?,
            None => Vec::new(),
        };

        match op {
            Operation::Insert if columns.is_empty() => {
                return Err(KashoError::Protocol("insert row without after-image".into()));
            }
            Operation::Update | Operation::Delete if old_keys.is_empty() => {
                return Err(KashoError::Protocol(format!(
                    "{op} row without before-image (binlog_row_image must be FULL)"
                )));
            }
            _ => {}
        }

        changes.push(Change::dml(
            row_position,
            DmlChange { table: table.clone(), op, columns, old_keys },
        ));
    }
    Ok(changes)
}

/// Position for the `ordinal`-th row of a rows event.
///
/// The suffix is ten digits wide: one binlog event is capped at 4 GiB
/// (`binlog_row_event_max_size` tops out there), so a row index is
/// always below 2^32 and never outgrows the fixed width. A wider
/// rendering would break the plain lexicographic comparison the buffer
/// index orders positions by.
fn row_position(position: &Position, ordinal: usize) -> Position {
    if ordinal == 0 {
        position.clone()
    } else {
        Position::new(format!("{position}.{ordinal:010}"))
    }
}

fn rows_decode_err(err: std::io::Error) -> KashoError {
    KashoError::Protocol(format!("binlog row decode: {err}"))
}

fn binlog_row_to_columns(
    row: &BinlogRow,
    column_names: &[String],
) -> Result<Vec<Column>, KashoError> {
    let mut columns = Vec::with_capacity(row.len());
    for idx in 0..row.len() {
        let name = column_names
            .get(idx)
            .cloned()
            .unwrap_or_else(|| format!("col_{idx}"));
        let value = match row.as_ref(idx) {
            Some(BinlogValue::Value(value)) => mysql_value_to_sql(value),
            Some(BinlogValue::Jsonb(json)) => SqlValue::Text(format!("{json:?}")),
            Some(BinlogValue::JsonDiff(_)) => {
                return Err(KashoError::Protocol(
                    "partial JSON row images are not supported".into(),
                ));
            }
            None => SqlValue::Null,
        };
        columns.push(Column::new(name, value));
    }
    Ok(columns)
}

/// Map a raw MySQL value to the typed union. Binlog row values arrive
/// mostly as bytes; UTF-8 payloads become text, the rest stay binary.
fn mysql_value_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::NULL => SqlValue::Null,
        Value::Int(i) => SqlValue::Int(*i),
        Value::UInt(u) => i64::try_from(*u)
            .map(SqlValue::Int)
            .unwrap_or_else(|_| SqlValue::Text(u.to_string())),
        Value::Float(f) => SqlValue::Float(f64::from(*f)),
        Value::Double(d) => SqlValue::Float(*d),
        Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => SqlValue::Text(text.to_string()),
            Err(_) => SqlValue::Bytes(bytes.clone()),
        },
        Value::Date(y, m, d, hh, mm, ss, micro) => {
            if *hh == 0 && *mm == 0 && *ss == 0 && *micro == 0 {
                SqlValue::Text(format!("{y:04}-{m:02}-{d:02}"))
            } else {
                SqlValue::Text(format!(
                    "{y:04}-{m:02}-{d:02} {hh:02}:{mm:02}:{ss:02}.{micro:06}"
                ))
            }
        }
        Value::Time(neg, days, hours, minutes, seconds, micros) => {
            let sign = if *neg { "-" } else { "" };
            let total_hours = u32::from(*days) * 24 + u32::from(*hours);
            SqlValue::Text(format!(
                "{sign}{total_hours:02}:{minutes:02}:{seconds:02}.{micros:06}"
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binlog_file_suffix() {
        assert_eq!(binlog_file_suffix("binlog.000007").unwrap(), 7);
        assert_eq!(binlog_file_suffix("mysql-bin.004242").unwrap(), 4242);
        assert!(binlog_file_suffix("nodot").is_err());
    }

    #[test]
    fn test_binlog_position_round_trip() {
        let position = Position::from_binlog(7, 154);
        assert_eq!(parse_binlog_position(position.as_str()), Some((7, 154)));
        assert_eq!(parse_binlog_position("junk"), None);
    }

    #[test]
    fn test_row_ordinal_positions_stay_ascending() {
        let event = Position::from_binlog(7, 154);
        let first = row_position(&event, 0);
        assert_eq!(first, event);

        // Strictly ascending across the full run of one event,
        // including past four digits of ordinal.
        let mut prev = first;
        for ordinal in [1usize, 2, 9_999, 10_000, 10_001, 4_000_000] {
            let next = row_position(&event, ordinal);
            assert!(prev < next, "{prev} !< {next}");
            assert!(prev.sort_key() < next.sort_key());
            prev = next;
        }

        // The last row of a bulk event still sorts below the next
        // event's position.
        let following = Position::from_binlog(7, 155);
        assert!(prev < following);
        assert!(prev.sort_key() < following.sort_key());
    }

    #[test]
    fn test_mysql_value_mapping() {
        assert_eq!(mysql_value_to_sql(&Value::NULL), SqlValue::Null);
        assert_eq!(mysql_value_to_sql(&Value::Int(-5)), SqlValue::Int(-5));
        assert_eq!(mysql_value_to_sql(&Value::Double(2.5)), SqlValue::Float(2.5));
        assert_eq!(
            mysql_value_to_sql(&Value::Bytes(b"hello".to_vec())),
            SqlValue::Text("hello".into())
        );
        assert_eq!(
            mysql_value_to_sql(&Value::Bytes(vec![0xFF, 0xFE])),
            SqlValue::Bytes(vec![0xFF, 0xFE])
        );
        assert_eq!(
            mysql_value_to_sql(&Value::Date(2024, 3, 1, 0, 0, 0, 0)),
            SqlValue::Text("2024-03-01".into())
        );
        assert_eq!(
            mysql_value_to_sql(&Value::Date(2024, 3, 1, 12, 30, 45, 0)),
            SqlValue::Text("2024-03-01 12:30:45.000000".into())
        );
    }

    #[test]
    fn test_uint_overflow_falls_back_to_text() {
        assert_eq!(
            mysql_value_to_sql(&Value::UInt(u64::MAX)),
            SqlValue::Text(u64::MAX.to_string())
        );
        assert_eq!(mysql_value_to_sql(&Value::UInt(42)), SqlValue::Int(42));
    }
}
