//! Dump statements → synthetic bootstrap changes → buffer.
//!
//! Positions are `bootstrap-0000000001`, `bootstrap-0000000002`, … in
//! the dump's textual order, which sort strictly before any live
//! position. Conversion is pure, so re-running against an empty buffer
//! reproduces the byte-identical sequence; re-running against a
//! non-empty buffer hits the store's conflict check.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use kasho::buffer::ChangeStore;
use kasho::change::{Change, Column, DdlChange, DmlChange, Operation, Position, SqlValue};
use kasho::error::KashoError;

use crate::parser::DumpStatement;

/// Identity stamped on synthetic DDL changes.
const BOOTSTRAP_USER: &str = "bootstrap";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConvertStats {
    pub ddl_statements: u64,
    pub rows: u64,
    /// Rows dropped by `--max-rows-per-table` (first-N truncation, no
    /// sampling).
    pub truncated_rows: u64,
}

/// Convert parsed statements into ordered bootstrap changes.
///
/// `max_rows_per_table` of 0 means unlimited.
pub fn dump_to_changes(
    statements: Vec<DumpStatement>,
    max_rows_per_table: u64,
) -> Result<(Vec<Change>, ConvertStats), KashoError> {
    let mut changes = Vec::new();
    let mut stats = ConvertStats::default();
    let mut counter = 0u64;
    let mut per_table: HashMap<String, u64> = HashMap::new();
    // Column lists from CREATE TABLE, for inserts that omit theirs
    // (mysqldump's default form).
    let mut known_columns: HashMap<String, Vec<String>> = HashMap::new();

    for statement in statements {
        match statement {
            DumpStatement::Ddl(sql) => {
                if let Some((table, columns)) = extract_create_columns(&sql) {
                    known_columns.insert(table, columns);
                }
                counter += 1;
                stats.ddl_statements += 1;
                changes.push(Change::ddl(
                    Position::bootstrap(counter),
                    DdlChange {
                        statement: sql,
                        username: BOOTSTRAP_USER.to_string(),
                        database: BOOTSTRAP_USER.to_string(),
                    },
                ));
            }
            DumpStatement::Rows { table, columns, rows } => {
                let columns = if columns.is_empty() {
                    known_columns
                        .get(&table)
                        .or_else(|| known_columns.get(bare_name(&table)))
                        .cloned()
                        .ok_or_else(|| {
                            KashoError::Protocol(format!(
                                "insert into {table} omits its column list and no CREATE TABLE preceded it"
                            ))
                        })?
                } else {
                    columns
                };

                let taken = per_table.entry(table.clone()).or_insert(0);
                for row in rows {
                    if max_rows_per_table > 0 && *taken >= max_rows_per_table {
                        stats.truncated_rows += 1;
                        continue;
                    }
                    if row.len() != columns.len() {
                        return Err(KashoError::Protocol(format!(
                            "row in {table} has {} values for {} columns",
                            row.len(),
                            columns.len()
                        )));
                    }
                    let columns = columns
                        .iter()
                        .zip(row)
                        .map(|(name, value)| {
                            Column::new(name.clone(), match value {
                                None => SqlValue::Null,
                                Some(text) => SqlValue::Text(text),
                            })
                        })
                        .collect();

                    counter += 1;
                    *taken += 1;
                    stats.rows += 1;
                    changes.push(Change::dml(
                        Position::bootstrap(counter),
                        DmlChange {
                            table: table.clone(),
                            op: Operation::Insert,
                            columns,
                            old_keys: Vec::new(),
                        },
                    ));
                }
            }
        }
    }
    Ok((changes, stats))
}

/// Pull the column names out of a `CREATE TABLE` statement, skipping
/// table-level constraint entries.
fn extract_create_columns(sql: &str) -> Option<(String, Vec<String>)> {
    let upper = sql.to_ascii_uppercase();
    let table_kw = upper.find("TABLE")?;
    if !upper.trim_start().starts_with("CREATE") {
        return None;
    }
    let open = sql[table_kw..].find('(')? + table_kw;
    let close = sql.rfind(')')?;
    if close <= open {
        return None;
    }

    let mut name = sql[table_kw + 5..open].trim();
    for prefix in ["IF NOT EXISTS ", "if not exists "] {
        name = name.strip_prefix(prefix).unwrap_or(name);
    }
    let table = normalize(name);

    let mut columns = Vec::new();
    for entry in split_top_level_commas(&sql[open + 1..close]) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let first = entry.split_whitespace().next()?;
        let keyword = first.to_ascii_uppercase();
        if matches!(
            keyword.as_str(),
            "PRIMARY" | "UNIQUE" | "KEY" | "CONSTRAINT" | "FOREIGN" | "INDEX" | "CHECK" | "FULLTEXT" | "SPATIAL"
        ) {
            continue;
        }
        columns.push(normalize(first));
    }
    if columns.is_empty() {
        return None;
    }
    Some((table, columns))
}

fn split_top_level_commas(body: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for ch in body.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 => out.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        out.push(current);
    }
    out
}

fn normalize(ident: &str) -> String {
    ident.trim().trim_matches('"').trim_matches('`').to_string()
}

fn bare_name(table: &str) -> &str {
    table.rsplit('.').next().unwrap_or(table)
}

// ── Storage ────────────────────────────────────────────────────────────────

/// Append converted changes to the buffer in order, in batches.
///
/// A payload conflict means the buffer already holds a different
/// bootstrap history; that is fatal and the exit code is the caller's
/// concern.
pub async fn store_changes<S: ChangeStore>(
    store: &Arc<S>,
    changes: &[Change],
    batch_size: usize,
    progress_interval: u64,
) -> Result<(), KashoError> {
    let mut stored = 0u64;
    for batch in changes.chunks(batch_size.max(1)) {
        for change in batch {
            store.append(change).await?;
            stored += 1;
            if progress_interval > 0 && stored % progress_interval == 0 {
                info!(stored, total = changes.len(), "bootstrap progress");
            }
        }
        debug!(stored, "batch flushed");
    }
    Ok(())
}

/// `--dry-run`: print each change as a JSON line instead of storing.
pub fn print_changes(changes: &[Change]) -> Result<(), KashoError> {
    use std::io::Write;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for change in changes {
        let line = serde_json::to_string(change)
            .map_err(|e| KashoError::Internal(format!("encode change: {e}")))?;
        if writeln!(out, "{line}").is_err() {
            // Broken pipe on a truncated dry run is not an error.
            warn!("stdout closed, stopping dry-run output");
            return Ok(());
        }
    }
    Ok(())
}
