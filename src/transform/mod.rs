//! Config-driven per-column value transformation.
//!
//! [`TransformEngine::transform`] rewrites the column values of DML
//! changes according to the loaded [`TransformConfig`]; DDL changes and
//! unlisted columns pass through untouched. Transforms substitute values
//! only — the column set and ordering of a change are preserved exactly.
//!
//! # Deterministic seeding
//!
//! In deterministic mode (the default) the generator RNG is seeded from
//! `SHA-256(original value)`, so the same source value maps to the same
//! fake everywhere it appears. Foreign-key joins on transformed columns
//! therefore keep working across tables, and re-running the pipeline
//! reproduces the replica byte for byte.

pub mod generators;
pub mod password;

use std::sync::atomic::{AtomicU64, Ordering};

use rand::SeedableRng;
use rand::rngs::StdRng;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::change::{Change, ChangePayload, SqlValue};
use crate::config::{ColumnTransform, TransformConfig};
use crate::error::KashoError;
use generators::TransformKind;

/// Derive an N-byte seed from the original value by cycling the SHA-256
/// digest of its canonical text.
pub fn deterministic_seed<const N: usize>(original: &str) -> [u8; N] {
    let digest = Sha256::digest(original.as_bytes());
    let mut seed = [0u8; N];
    for (i, byte) in seed.iter_mut().enumerate() {
        *byte = digest[i % digest.len()];
    }
    seed
}

/// Applies the configured transforms to each change.
pub struct TransformEngine {
    config: TransformConfig,
    mismatches: AtomicU64,
}

impl TransformEngine {
    pub fn new(config: TransformConfig) -> Self {
        TransformEngine { config, mismatches: AtomicU64::new(0) }
    }

    /// Number of values left untouched because the generator output could
    /// not be coerced to the column's value class.
    pub fn mismatch_count(&self) -> u64 {
        self.mismatches.load(Ordering::Relaxed)
    }

    /// Transform a change. Infallible: per-column mismatches are logged
    /// and counted, with the original value kept in place.
    pub fn transform(&self, change: Change) -> Change {
        let ChangePayload::Dml(mut dml) = change.payload else {
            return change;
        };

        let table = dml.table.clone();
        for column in dml.columns.iter_mut().chain(dml.old_keys.iter_mut()) {
            let Some(spec) = self.config.lookup(&table, &column.name) else {
                continue;
            };
            if column.value.is_null() {
                continue;
            }
            match transform_value(&column.value, spec) {
                Ok(value) => column.value = value,
                Err(produced) => {
                    let err = KashoError::TransformMismatch {
                        table: table.clone(),
                        column: column.name.clone(),
                        produced,
                        expected: column.value.class(),
                    };
                    self.mismatches.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        position = %change.position,
                        generator = spec.kind.name(),
                        error = %err,
                        "transform mismatch, keeping original value"
                    );
                }
            }
        }

        Change { position: change.position, payload: ChangePayload::Dml(dml) }
    }
}

/// Run one generator against one value. The `Err` case names the value
/// class the generator produced but the column could not absorb.
fn transform_value(original: &SqlValue, spec: ColumnTransform) -> Result<SqlValue, &'static str> {
    if spec.kind == TransformKind::Password {
        return transform_password(original, spec.deterministic);
    }

    let seed_text = original.seed_text();
    let mut rng = if spec.deterministic {
        StdRng::from_seed(deterministic_seed::<32>(&seed_text))
    } else {
        StdRng::from_os_rng()
    };
    let produced = generators::generate(spec.kind, &mut rng);

    coerce(produced, original)
}

fn transform_password(original: &SqlValue, deterministic: bool) -> Result<SqlValue, &'static str> {
    let SqlValue::Text(cleartext) = original else {
        return Err("text");
    };
    // Already in salt$digest shape: the source stored a hash, not a
    // cleartext. Pass it through.
    if password::looks_hashed(cleartext) {
        return Ok(original.clone());
    }
    let salt = deterministic.then(|| deterministic_seed::<16>(cleartext));
    let mut rng = StdRng::from_os_rng();
    password::hash_password(cleartext, salt, &mut rng)
        .map(SqlValue::Text)
        .map_err(|_| "text")
}

/// Fit generator text output to the original value's class. Numeric
/// columns accept generator output that parses cleanly (e.g. ZipCode
/// into an int column); everything else must be text.
fn coerce(produced: String, original: &SqlValue) -> Result<SqlValue, &'static str> {
    match original {
        SqlValue::Text(_) => Ok(SqlValue::Text(produced)),
        SqlValue::Int(_) => produced
            .parse::<i64>()
            .map(SqlValue::Int)
            .map_err(|_| "text"),
        SqlValue::Float(_) => produced
            .parse::<f64>()
            .map(SqlValue::Float)
            .map_err(|_| "text"),
        SqlValue::Null => Ok(SqlValue::Text(produced)),
        SqlValue::Bool(_) | SqlValue::Timestamp(_) | SqlValue::Bytes(_) => Err("text"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{Column, DmlChange, Operation, Position};

    fn engine(yaml: &str) -> TransformEngine {
        TransformEngine::new(TransformConfig::parse(yaml).unwrap())
    }

    fn users_change(email: &str) -> Change {
        Change::dml(
            Position::from_lsn(1),
            DmlChange {
                table: "public.users".into(),
                op: Operation::Insert,
                columns: vec![
                    Column::new("id", SqlValue::Int(1)),
                    Column::new("name", SqlValue::Text("Alice".into())),
                    Column::new("email", SqlValue::Text(email.into())),
                ],
                old_keys: vec![],
            },
        )
    }

    const EMAIL_ONLY: &str = "tables:\n  users:\n    email: Email\n";

    #[test]
    fn test_unlisted_columns_pass_through() {
        let engine = engine(EMAIL_ONLY);
        let out = engine.transform(users_change("a@x.com"));
        let dml = out.as_dml().unwrap();
        assert_eq!(dml.columns[0].value, SqlValue::Int(1));
        assert_eq!(dml.columns[1].value, SqlValue::Text("Alice".into()));
        assert_ne!(dml.columns[2].value, SqlValue::Text("a@x.com".into()));
    }

    #[test]
    fn test_column_set_and_order_preserved() {
        let engine = engine(EMAIL_ONLY);
        let before = users_change("a@x.com");
        let names_before: Vec<String> =
            before.as_dml().unwrap().columns.iter().map(|c| c.name.clone()).collect();
        let after = engine.transform(before);
        let names_after: Vec<String> =
            after.as_dml().unwrap().columns.iter().map(|c| c.name.clone()).collect();
        assert_eq!(names_before, names_after);
    }

    #[test]
    fn test_deterministic_across_engines() {
        let a = engine(EMAIL_ONLY).transform(users_change("a@x.com"));
        let b = engine(EMAIL_ONLY).transform(users_change("a@x.com"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_inputs_map_to_different_fakes() {
        let a = engine(EMAIL_ONLY).transform(users_change("a@x.com"));
        let b = engine(EMAIL_ONLY).transform(users_change("b@x.com"));
        assert_ne!(
            a.as_dml().unwrap().columns[2].value,
            b.as_dml().unwrap().columns[2].value
        );
    }

    #[test]
    fn test_null_passes_through() {
        let engine = engine(EMAIL_ONLY);
        let mut change = users_change("a@x.com");
        if let ChangePayload::Dml(dml) = &mut change.payload {
            dml.columns[2].value = SqlValue::Null;
        }
        let out = engine.transform(change);
        assert_eq!(out.as_dml().unwrap().columns[2].value, SqlValue::Null);
    }

    #[test]
    fn test_ddl_passes_through() {
        let engine = engine(EMAIL_ONLY);
        let change = Change::ddl(
            Position::from_lsn(2),
            crate::change::DdlChange {
                statement: "ALTER TABLE users ADD noise text".into(),
                username: "app".into(),
                database: "app".into(),
            },
        );
        assert_eq!(engine.transform(change.clone()), change);
    }

    #[test]
    fn test_old_keys_transformed_consistently() {
        // A transformed column used as a row identifier must render the
        // same fake in old_keys as it did when the row was inserted.
        let engine = engine(EMAIL_ONLY);
        let insert = engine.transform(users_change("a@x.com"));
        let inserted_email = insert.as_dml().unwrap().columns[2].value.clone();

        let delete = Change::dml(
            Position::from_lsn(9),
            DmlChange {
                table: "public.users".into(),
                op: Operation::Delete,
                columns: vec![],
                old_keys: vec![Column::new("email", SqlValue::Text("a@x.com".into()))],
            },
        );
        let out = engine.transform(delete);
        assert_eq!(out.as_dml().unwrap().old_keys[0].value, inserted_email);
    }

    #[test]
    fn test_mismatch_keeps_original_and_counts() {
        // FullName into an int column cannot be coerced.
        let engine = engine("tables:\n  users:\n    id: FullName\n");
        let out = engine.transform(users_change("a@x.com"));
        assert_eq!(out.as_dml().unwrap().columns[0].value, SqlValue::Int(1));
        assert_eq!(engine.mismatch_count(), 1);
    }

    #[test]
    fn test_password_hash_and_skip() {
        let engine = engine("tables:\n  users:\n    email: Password\n");
        let hashed = engine.transform(users_change("hunter2"));
        let SqlValue::Text(first) = hashed.as_dml().unwrap().columns[2].value.clone() else {
            panic!("expected text")
        };
        assert!(password::looks_hashed(&first));

        // Feeding the hashed value back through does not re-hash.
        let again = engine.transform(users_change(&first));
        assert_eq!(
            again.as_dml().unwrap().columns[2].value,
            SqlValue::Text(first)
        );
    }

    #[test]
    fn test_deterministic_seed_cycles() {
        let short: [u8; 16] = deterministic_seed("x");
        let long: [u8; 48] = deterministic_seed("x");
        assert_eq!(&long[..16], &short[..]);
        assert_eq!(&long[32..48], &long[..16]);
    }
}
