//! Dialect capability layer for PostgreSQL and MySQL.
//!
//! [`Dialect`] is a tagged variant carrying pure functions: SQL
//! rendering, session setup statements, catalog queries, and the
//! auto-increment synchronization statements. There is no trait object
//! and no per-connection state here — execution belongs to the apply
//! loop, rendering belongs here.
//!
//! # Literal rendering
//!
//! Values are literalized rather than bound as parameters so a rendered
//! statement is complete and portable across apply targets:
//! - `NULL`, `true`/`false`, canonical decimal numerics
//! - timestamps as `'YYYY-MM-DD HH:MM:SS[.ffffff]'` in UTC
//! - strings single-quoted with internal quotes doubled (MySQL
//!   additionally escapes backslashes)
//! - bytes as `'\x…'` (PostgreSQL) or `0x…` (MySQL)

use crate::change::{DdlChange, DmlChange, Operation, SqlValue};
use crate::error::KashoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
}

impl Dialect {
    /// Select the dialect from a DSN's URL scheme.
    pub fn from_url(url: &str) -> Result<Self, KashoError> {
        let scheme = url.split("://").next().unwrap_or_default();
        match scheme {
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "mysql" => Ok(Dialect::MySql),
            other => Err(KashoError::Config(format!(
                "unsupported database scheme {other:?} in {url:?}"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::MySql => "mysql",
        }
    }

    /// Name of the wire driver used for this dialect.
    pub fn driver_name(&self) -> &'static str {
        match self {
            Dialect::Postgres => "tokio-postgres",
            Dialect::MySql => "mysql_async",
        }
    }

    /// Normalize a DSN for the dialect's driver.
    pub fn format_dsn(&self, url: &str) -> String {
        match self {
            // tokio-postgres accepts both schemes; keep the canonical one.
            Dialect::Postgres => url.replacen("postgresql://", "postgres://", 1),
            Dialect::MySql => url.to_string(),
        }
    }

    /// Session settings applied once per replica connection, before any
    /// change is applied.
    pub fn setup_connection_sql(&self) -> &'static [&'static str] {
        match self {
            Dialect::Postgres => &["SET session_replication_role = replica"],
            Dialect::MySql => &["SET FOREIGN_KEY_CHECKS = 0", "SET UNIQUE_CHECKS = 0"],
        }
    }

    /// Counts user tables on the replica, excluding kasho's own metadata.
    /// Zero rows mean the replica is virgin and apply starts from the
    /// bootstrap range.
    pub fn user_tables_count_query(&self) -> &'static str {
        match self {
            Dialect::Postgres => {
                "SELECT count(*) FROM pg_tables \
                 WHERE schemaname NOT IN ('pg_catalog', 'information_schema') \
                 AND tablename NOT LIKE 'kasho\\_%'"
            }
            Dialect::MySql => {
                "SELECT count(*) FROM information_schema.tables \
                 WHERE table_schema = DATABASE() \
                 AND table_name NOT LIKE 'kasho\\_%'"
            }
        }
    }

    // ── Identifier and literal rendering ─────────────────────────────────

    /// Quote one identifier part.
    pub fn quote_ident(&self, ident: &str) -> String {
        match self {
            Dialect::Postgres => format!("\"{}\"", ident.replace('"', "\"\"")),
            Dialect::MySql => format!("`{}`", ident.replace('`', "``")),
        }
    }

    /// Quote a possibly schema-qualified table name part by part.
    pub fn quote_table(&self, table: &str) -> String {
        table
            .split('.')
            .map(|part| self.quote_ident(part))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Render a typed value as a SQL literal.
    pub fn literal(&self, value: &SqlValue) -> String {
        match value {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Bool(b) => b.to_string(),
            SqlValue::Int(i) => i.to_string(),
            SqlValue::Float(f) if f.is_finite() => f.to_string(),
            SqlValue::Float(_) => "NULL".to_string(),
            SqlValue::Timestamp(ts) => {
                format!("'{}'", ts.format("%Y-%m-%d %H:%M:%S%.f"))
            }
            SqlValue::Text(s) => self.string_literal(s),
            SqlValue::Bytes(b) => match self {
                Dialect::Postgres => format!("'\\x{}'", hex::encode(b)),
                Dialect::MySql => format!("0x{}", hex::encode_upper(b)),
            },
        }
    }

    fn string_literal(&self, s: &str) -> String {
        let doubled = s.replace('\'', "''");
        match self {
            Dialect::Postgres => format!("'{doubled}'"),
            // The MySQL parser treats backslash as an escape inside
            // string literals unless NO_BACKSLASH_ESCAPES is set.
            Dialect::MySql => format!("'{}'", doubled.replace('\\', "\\\\")),
        }
    }

    // ── DML / DDL rendering ──────────────────────────────────────────────

    /// Render a DML change into one executable statement.
    pub fn render_dml(&self, dml: &DmlChange) -> Result<String, KashoError> {
        match dml.op {
            Operation::Insert => self.render_insert(dml),
            Operation::Update => self.render_update(dml),
            Operation::Delete => self.render_delete(dml),
        }
    }

    fn render_insert(&self, dml: &DmlChange) -> Result<String, KashoError> {
        if dml.columns.is_empty() {
            return Err(KashoError::Internal(format!(
                "insert into {} carries no columns",
                dml.table
            )));
        }
        let names: Vec<String> =
            dml.columns.iter().map(|c| self.quote_ident(&c.name)).collect();
        let values: Vec<String> =
            dml.columns.iter().map(|c| self.literal(&c.value)).collect();
        Ok(format!(
            "INSERT INTO {} ({}) VALUES ({});",
            self.quote_table(&dml.table),
            names.join(", "),
            values.join(", "),
        ))
    }

    fn render_update(&self, dml: &DmlChange) -> Result<String, KashoError> {
        let predicate = self.key_predicate(dml)?;
        // Key columns identify the row; they never appear in SET.
        let assignments: Vec<String> = dml
            .columns
            .iter()
            .filter(|c| !dml.old_keys.iter().any(|k| k.name == c.name))
            .map(|c| format!("{} = {}", self.quote_ident(&c.name), self.literal(&c.value)))
            .collect();
        if assignments.is_empty() {
            return Err(KashoError::Internal(format!(
                "update of {} assigns no non-key columns",
                dml.table
            )));
        }
        Ok(format!(
            "UPDATE {} SET {} WHERE {};",
            self.quote_table(&dml.table),
            assignments.join(", "),
            predicate,
        ))
    }

    fn render_delete(&self, dml: &DmlChange) -> Result<String, KashoError> {
        let predicate = self.key_predicate(dml)?;
        Ok(format!(
            "DELETE FROM {} WHERE {};",
            self.quote_table(&dml.table),
            predicate,
        ))
    }

    fn key_predicate(&self, dml: &DmlChange) -> Result<String, KashoError> {
        if dml.old_keys.is_empty() {
            return Err(KashoError::Internal(format!(
                "{} on {} carries no old_keys",
                dml.op, dml.table
            )));
        }
        let parts: Vec<String> = dml
            .old_keys
            .iter()
            .map(|k| {
                if k.value.is_null() {
                    format!("{} IS NULL", self.quote_ident(&k.name))
                } else {
                    format!("{} = {}", self.quote_ident(&k.name), self.literal(&k.value))
                }
            })
            .collect();
        Ok(parts.join(" AND "))
    }

    /// DDL passes through verbatim; the source dialect owns the syntax.
    pub fn render_ddl(&self, ddl: &DdlChange) -> String {
        ddl.statement.trim().to_string()
    }

    // ── Apply-state metadata table ───────────────────────────────────────

    /// DDL for the per-replica metadata table recording the last applied
    /// position, updated in the same transaction as the DML it
    /// acknowledges.
    pub fn apply_state_create_sql(&self) -> &'static str {
        match self {
            Dialect::Postgres => {
                "CREATE TABLE IF NOT EXISTS kasho_apply_state (
                     stream_id             TEXT PRIMARY KEY,
                     last_applied_position TEXT NOT NULL,
                     updated_at            TIMESTAMPTZ NOT NULL DEFAULT now()
                 )"
            }
            Dialect::MySql => {
                "CREATE TABLE IF NOT EXISTS kasho_apply_state (
                     stream_id             VARCHAR(128) PRIMARY KEY,
                     last_applied_position TEXT NOT NULL,
                     updated_at            TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
                                           ON UPDATE CURRENT_TIMESTAMP
                 )"
            }
        }
    }

    pub fn apply_state_select_query(&self, stream_id: &str) -> String {
        format!(
            "SELECT last_applied_position FROM kasho_apply_state WHERE stream_id = {}",
            self.literal(&SqlValue::Text(stream_id.to_string())),
        )
    }

    pub fn apply_state_upsert_stmt(&self, stream_id: &str, position: &str) -> String {
        let stream = self.literal(&SqlValue::Text(stream_id.to_string()));
        let position = self.literal(&SqlValue::Text(position.to_string()));
        match self {
            Dialect::Postgres => format!(
                "INSERT INTO kasho_apply_state (stream_id, last_applied_position, updated_at) \
                 VALUES ({stream}, {position}, now()) \
                 ON CONFLICT (stream_id) DO UPDATE \
                 SET last_applied_position = EXCLUDED.last_applied_position, updated_at = now()"
            ),
            Dialect::MySql => format!(
                "INSERT INTO kasho_apply_state (stream_id, last_applied_position) \
                 VALUES ({stream}, {position}) \
                 ON DUPLICATE KEY UPDATE last_applied_position = {position}"
            ),
        }
    }

    // ── Auto-increment / sequence synchronization ────────────────────────

    /// Lists identity state to synchronize after replicated inserts.
    ///
    /// Postgres rows are `(sequence_schema, sequence, table_schema,
    /// table, column)`; MySQL rows are `(table_schema, table, column)`.
    pub fn autoinc_discover_query(&self) -> &'static str {
        match self {
            Dialect::Postgres => {
                "SELECT sn.nspname, s.relname, tn.nspname, t.relname, a.attname \
                 FROM pg_class s \
                 JOIN pg_namespace sn ON sn.oid = s.relnamespace \
                 JOIN pg_depend d ON d.objid = s.oid AND d.deptype IN ('a', 'i') \
                 JOIN pg_class t ON t.oid = d.refobjid \
                 JOIN pg_namespace tn ON tn.oid = t.relnamespace \
                 JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = d.refobjsubid \
                 WHERE s.relkind = 'S'"
            }
            Dialect::MySql => {
                "SELECT table_schema, table_name, column_name \
                 FROM information_schema.columns \
                 WHERE extra LIKE '%auto_increment%' AND table_schema = DATABASE()"
            }
        }
    }

    /// One `setval` statement for a Postgres identity sequence.
    pub fn postgres_setval_stmt(
        &self,
        seq_schema: &str,
        seq: &str,
        table_schema: &str,
        table: &str,
        column: &str,
    ) -> String {
        format!(
            "SELECT setval('{}.{}', GREATEST((SELECT COALESCE(MAX({}), 1) FROM {}.{}), 1));",
            self.quote_ident(seq_schema),
            self.quote_ident(seq),
            self.quote_ident(column),
            self.quote_ident(table_schema),
            self.quote_ident(table),
        )
    }

    /// Query for the next auto-increment value of a MySQL table.
    pub fn mysql_autoinc_max_query(&self, schema: &str, table: &str, column: &str) -> String {
        format!(
            "SELECT COALESCE(MAX({}), 0) + 1 FROM {}.{}",
            self.quote_ident(column),
            self.quote_ident(schema),
            self.quote_ident(table),
        )
    }

    /// Statement pinning a MySQL table's auto-increment counter.
    pub fn mysql_autoinc_set_stmt(&self, schema: &str, table: &str, next: u64) -> String {
        format!(
            "ALTER TABLE {}.{} AUTO_INCREMENT = {next};",
            self.quote_ident(schema),
            self.quote_ident(table),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Column;
    use chrono::{TimeZone, Utc};

    fn users_insert() -> DmlChange {
        DmlChange {
            table: "users".into(),
            op: Operation::Insert,
            columns: vec![
                Column::new("id", SqlValue::Int(1)),
                Column::new("name", SqlValue::Text("Alice".into())),
                Column::new("email", SqlValue::Text("a@x.com".into())),
            ],
            old_keys: vec![],
        }
    }

    #[test]
    fn test_render_insert_postgres() {
        let sql = Dialect::Postgres.render_dml(&users_insert()).unwrap();
        assert_eq!(
            sql,
            r#"INSERT INTO "users" ("id", "name", "email") VALUES (1, 'Alice', 'a@x.com');"#
        );
    }

    #[test]
    fn test_render_insert_mysql() {
        let sql = Dialect::MySql.render_dml(&users_insert()).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO `users` (`id`, `name`, `email`) VALUES (1, 'Alice', 'a@x.com');"
        );
        // Literal rendering, no bound-parameter placeholders.
        assert!(!sql.contains('?'));
    }

    #[test]
    fn test_render_update_excludes_key_from_set() {
        let dml = DmlChange {
            table: "users".into(),
            op: Operation::Update,
            columns: vec![
                Column::new("id", SqlValue::Int(1)),
                Column::new("name", SqlValue::Text("Bob".into())),
            ],
            old_keys: vec![Column::new("id", SqlValue::Int(1))],
        };
        let sql = Dialect::Postgres.render_dml(&dml).unwrap();
        assert_eq!(sql, r#"UPDATE "users" SET "name" = 'Bob' WHERE "id" = 1;"#);
    }

    #[test]
    fn test_render_delete_uses_all_old_keys() {
        let dml = DmlChange {
            table: "public.users".into(),
            op: Operation::Delete,
            columns: vec![],
            old_keys: vec![
                Column::new("id", SqlValue::Int(1)),
                Column::new("tenant", SqlValue::Text("acme".into())),
            ],
        };
        let sql = Dialect::Postgres.render_dml(&dml).unwrap();
        assert_eq!(
            sql,
            r#"DELETE FROM "public"."users" WHERE "id" = 1 AND "tenant" = 'acme';"#
        );
    }

    #[test]
    fn test_update_without_old_keys_is_rejected() {
        let dml = DmlChange {
            table: "users".into(),
            op: Operation::Update,
            columns: vec![Column::new("name", SqlValue::Text("Bob".into()))],
            old_keys: vec![],
        };
        assert!(Dialect::Postgres.render_dml(&dml).is_err());
    }

    #[test]
    fn test_null_key_renders_is_null() {
        let dml = DmlChange {
            table: "t".into(),
            op: Operation::Delete,
            columns: vec![],
            old_keys: vec![Column::new("parent_id", SqlValue::Null)],
        };
        let sql = Dialect::MySql.render_dml(&dml).unwrap();
        assert_eq!(sql, "DELETE FROM `t` WHERE `parent_id` IS NULL;");
    }

    #[test]
    fn test_string_literal_escaping() {
        assert_eq!(
            Dialect::Postgres.literal(&SqlValue::Text("O'Brien".into())),
            "'O''Brien'"
        );
        assert_eq!(
            Dialect::MySql.literal(&SqlValue::Text(r"back\slash'q".into())),
            r"'back\\slash''q'"
        );
        // Postgres leaves backslashes alone.
        assert_eq!(
            Dialect::Postgres.literal(&SqlValue::Text(r"back\slash".into())),
            r"'back\slash'"
        );
    }

    #[test]
    fn test_scalar_literals() {
        let d = Dialect::Postgres;
        assert_eq!(d.literal(&SqlValue::Null), "NULL");
        assert_eq!(d.literal(&SqlValue::Bool(true)), "true");
        assert_eq!(d.literal(&SqlValue::Bool(false)), "false");
        assert_eq!(d.literal(&SqlValue::Int(-42)), "-42");
        assert_eq!(d.literal(&SqlValue::Float(1.5)), "1.5");
        assert_eq!(d.literal(&SqlValue::Float(f64::NAN)), "NULL");
    }

    #[test]
    fn test_timestamp_literal_is_utc() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap();
        assert_eq!(
            Dialect::Postgres.literal(&SqlValue::Timestamp(ts)),
            "'2024-03-01 12:30:45'"
        );
    }

    #[test]
    fn test_bytes_literals() {
        let bytes = SqlValue::Bytes(vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(Dialect::Postgres.literal(&bytes), r"'\xdeadbeef'");
        assert_eq!(Dialect::MySql.literal(&bytes), "0xDEADBEEF");
    }

    #[test]
    fn test_ident_quoting() {
        assert_eq!(Dialect::Postgres.quote_ident(r#"we"ird"#), r#""we""ird""#);
        assert_eq!(Dialect::MySql.quote_ident("we`ird"), "`we``ird`");
        assert_eq!(
            Dialect::MySql.quote_table("app.users"),
            "`app`.`users`"
        );
    }

    #[test]
    fn test_render_ddl_round_trips_up_to_whitespace() {
        let ddl = DdlChange {
            statement: "  ALTER TABLE t ADD c text \n".into(),
            username: "app".into(),
            database: "app".into(),
        };
        assert_eq!(
            Dialect::Postgres.render_ddl(&ddl),
            "ALTER TABLE t ADD c text"
        );
    }

    #[test]
    fn test_dialect_from_url() {
        assert_eq!(
            Dialect::from_url("postgres://u@h/db").unwrap(),
            Dialect::Postgres
        );
        assert_eq!(
            Dialect::from_url("postgresql://u@h/db").unwrap(),
            Dialect::Postgres
        );
        assert_eq!(Dialect::from_url("mysql://u@h/db").unwrap(), Dialect::MySql);
        assert!(Dialect::from_url("mongodb://u@h/db").is_err());
    }

    #[test]
    fn test_setval_statement_shape() {
        let sql = Dialect::Postgres.postgres_setval_stmt("public", "users_id_seq", "public", "users", "id");
        assert_eq!(
            sql,
            r#"SELECT setval('"public"."users_id_seq"', GREATEST((SELECT COALESCE(MAX("id"), 1) FROM "public"."users"), 1));"#
        );
    }

    #[test]
    fn test_apply_state_upsert() {
        let pg = Dialect::Postgres.apply_state_upsert_stmt("primary", "00000000016B3748");
        assert!(pg.contains("ON CONFLICT (stream_id)"));
        assert!(pg.contains("'00000000016B3748'"));

        let my = Dialect::MySql.apply_state_upsert_stmt("primary", "000001:0000000154");
        assert!(my.contains("ON DUPLICATE KEY UPDATE"));
        assert!(my.contains("'000001:0000000154'"));
    }

    #[test]
    fn test_mysql_autoinc_statements() {
        let d = Dialect::MySql;
        assert_eq!(
            d.mysql_autoinc_max_query("app", "users", "id"),
            "SELECT COALESCE(MAX(`id`), 0) + 1 FROM `app`.`users`"
        );
        assert_eq!(
            d.mysql_autoinc_set_stmt("app", "users", 7),
            "ALTER TABLE `app`.`users` AUTO_INCREMENT = 7;"
        );
    }
}
