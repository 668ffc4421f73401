//! Runtime configuration for the kasho services.
//!
//! Two layers: [`Settings`], read once from the environment at startup
//! (connection URLs, buffer addressing, tuning knobs), and
//! [`TransformConfig`], the declarative per-table/per-column transform
//! mapping loaded from YAML.
//!
//! Unknown tables or columns in the transform config are tolerated (the
//! source schema may drift ahead of the config); unknown generator names
//! fail startup.

use std::collections::BTreeMap;
use std::env;
use std::path::Path;

use serde::Deserialize;

use crate::error::KashoError;
use crate::transform::generators::TransformKind;

/// Default path of the transform config inside the service container.
pub const DEFAULT_TRANSFORMS_PATH: &str = "/app/config/transforms.yml";

/// Port reserved for the external licensing collaborator's RPC listener.
pub const DEFAULT_GRPC_PORT: u16 = 50053;

// ── Service settings ───────────────────────────────────────────────────────

/// Environment-derived settings shared by the capture and apply services.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Source DSN; the URL scheme selects the dialect.
    pub primary_database_url: String,
    /// Replica DSN, same scheme rules.
    pub replica_database_url: String,
    /// `host:port` of the change stream RPC endpoint.
    pub change_stream_addr: String,
    /// Buffer backing store.
    pub redis_url: String,
    /// Listen port for services that expose RPC. Reserved for the
    /// licensing collaborator; consumed here so a shared env file parses.
    pub grpc_port: u16,
    /// When set, startup blocks on license validation.
    pub licensing_addr: Option<String>,
    /// Logical stream identifier namespacing all buffer keys.
    pub stream_id: String,
    /// Path of the transform YAML.
    pub transforms_path: String,
    /// Maximum changes the buffer will hold before `append` blocks.
    pub buffer_max_changes: u64,
    /// Retention window in changes; 0 keeps everything. Trimming never
    /// passes the minimum consumer-acked position.
    pub buffer_retain_max: u64,
    /// Logical replication slot name on the Postgres source.
    pub slot_name: String,
    /// Publication name on the Postgres source.
    pub publication: String,
    /// Logical decoding output plugin: `wal2json` or `pgoutput`.
    pub pg_plugin: String,
    /// Source/buffer poll interval in milliseconds.
    pub poll_interval_ms: u64,
}

impl Settings {
    /// Read settings from the environment. Missing required variables are
    /// a fatal [`KashoError::Config`].
    pub fn from_env() -> Result<Self, KashoError> {
        Ok(Settings {
            primary_database_url: required("PRIMARY_DATABASE_URL")?,
            replica_database_url: required("REPLICA_DATABASE_URL")?,
            change_stream_addr: optional("CHANGE_STREAM_SERVICE_ADDR")
                .unwrap_or_else(|| "127.0.0.1:50054".to_string()),
            redis_url: required("REDIS_URL")?,
            grpc_port: parsed("GRPC_PORT", DEFAULT_GRPC_PORT)?,
            licensing_addr: optional("LICENSING_SERVICE_ADDR"),
            stream_id: optional("KASHO_STREAM_ID").unwrap_or_else(|| "primary".to_string()),
            transforms_path: optional("KASHO_TRANSFORMS_PATH")
                .unwrap_or_else(|| DEFAULT_TRANSFORMS_PATH.to_string()),
            buffer_max_changes: parsed("KASHO_BUFFER_MAX_CHANGES", 1_000_000)?,
            buffer_retain_max: parsed("KASHO_BUFFER_RETAIN_MAX", 0)?,
            slot_name: optional("KASHO_SLOT_NAME").unwrap_or_else(|| "kasho_slot".to_string()),
            publication: optional("KASHO_PUBLICATION").unwrap_or_else(|| "kasho_pub".to_string()),
            pg_plugin: optional("KASHO_PG_PLUGIN").unwrap_or_else(|| "wal2json".to_string()),
            poll_interval_ms: parsed("KASHO_POLL_INTERVAL_MS", 500)?,
        })
    }
}

fn required(name: &'static str) -> Result<String, KashoError> {
    env::var(name).map_err(|_| KashoError::Config(format!("missing environment variable {name}")))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, KashoError> {
    match optional(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| KashoError::Config(format!("invalid value for {name}: {raw}"))),
    }
}

// ── Transform configuration ────────────────────────────────────────────────

/// One column's resolved transform: which generator, and whether its
/// output is seeded deterministically from the original value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnTransform {
    pub kind: TransformKind,
    pub deterministic: bool,
}

/// Resolved transform mapping: table → column → generator.
///
/// BTreeMaps keep iteration (and therefore startup logging) in a stable
/// order.
#[derive(Debug, Clone, Default)]
pub struct TransformConfig {
    pub tables: BTreeMap<String, BTreeMap<String, ColumnTransform>>,
}

#[derive(Debug, Deserialize)]
struct RawTransformConfig {
    #[serde(default)]
    tables: BTreeMap<String, BTreeMap<String, String>>,
}

impl TransformConfig {
    /// Load and validate the YAML at `path`. A missing file is fatal;
    /// replication without the intended anonymization must not start.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, KashoError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            KashoError::Config(format!("cannot read transform config {}: {e}", path.display()))
        })?;
        Self::parse(&raw)
    }

    /// Parse and validate transform YAML.
    pub fn parse(yaml: &str) -> Result<Self, KashoError> {
        let raw: RawTransformConfig = serde_yaml::from_str(yaml)
            .map_err(|e| KashoError::Config(format!("malformed transform config: {e}")))?;

        let mut tables = BTreeMap::new();
        for (table, columns) in raw.tables {
            let mut resolved = BTreeMap::new();
            for (column, spec) in columns {
                resolved.insert(column, parse_column_spec(&table, &spec)?);
            }
            tables.insert(table, resolved);
        }
        Ok(TransformConfig { tables })
    }

    /// Look up the transform for a column, if any. Table names match
    /// either fully qualified (`public.users`) or bare (`users`).
    pub fn lookup(&self, table: &str, column: &str) -> Option<ColumnTransform> {
        if let Some(cols) = self.tables.get(table) {
            return cols.get(column).copied();
        }
        let bare = table.rsplit('.').next()?;
        self.tables.get(bare)?.get(column).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Parse `Email` or `Email:random` into a [`ColumnTransform`].
///
/// Deterministic seeding is the default so equal source values keep
/// producing equal fakes across tables and restarts; `:random` opts a
/// column out.
fn parse_column_spec(table: &str, spec: &str) -> Result<ColumnTransform, KashoError> {
    let (name, mode) = match spec.split_once(':') {
        None => (spec, None),
        Some((name, mode)) => (name, Some(mode)),
    };

    let kind = TransformKind::from_name(name).ok_or_else(|| {
        KashoError::Config(format!("unknown generator {name:?} for table {table:?}"))
    })?;

    let deterministic = match mode {
        None | Some("deterministic") => true,
        Some("random") => false,
        Some(other) => {
            return Err(KashoError::Config(format!(
                "unknown transform mode {other:?} for table {table:?} (expected deterministic|random)"
            )));
        }
    };

    Ok(ColumnTransform { kind, deterministic })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
tables:
  users:
    email: Email
    full_name: FullName
    password: Password
    phone: Phone:random
  accounts:
    ssn: SSN
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = TransformConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.tables.len(), 2);

        let email = config.lookup("users", "email").unwrap();
        assert_eq!(email.kind, TransformKind::Email);
        assert!(email.deterministic);

        let phone = config.lookup("users", "phone").unwrap();
        assert_eq!(phone.kind, TransformKind::Phone);
        assert!(!phone.deterministic);
    }

    #[test]
    fn test_lookup_matches_qualified_table_names() {
        let config = TransformConfig::parse(SAMPLE).unwrap();
        assert!(config.lookup("public.users", "email").is_some());
        assert!(config.lookup("public.users", "id").is_none());
        assert!(config.lookup("public.orders", "email").is_none());
    }

    #[test]
    fn test_unknown_generator_fails() {
        let err = TransformConfig::parse("tables:\n  users:\n    email: Emali\n").unwrap_err();
        assert!(matches!(err, KashoError::Config(_)), "got {err:?}");
        assert!(err.to_string().contains("Emali"));
    }

    #[test]
    fn test_unknown_mode_fails() {
        let err = TransformConfig::parse("tables:\n  users:\n    email: Email:stable\n").unwrap_err();
        assert!(err.to_string().contains("stable"));
    }

    #[test]
    fn test_malformed_yaml_fails() {
        assert!(TransformConfig::parse("tables: [not a map").is_err());
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config = TransformConfig::parse("tables: {}\n").unwrap();
        assert!(config.is_empty());
        let config = TransformConfig::parse("{}").unwrap();
        assert!(config.is_empty());
    }
}
