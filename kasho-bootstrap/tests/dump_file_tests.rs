//! File-level checks of the dump-to-changes path, mirroring how the CLI
//! reads its input.

use std::io::Write;

use kasho::change::ChangePayload;
use kasho_bootstrap::{ingest, parser};

const DUMP: &str = "\
SET statement_timeout = 0;

CREATE TABLE public.users (
    id integer NOT NULL,
    name text,
    email text
);

ALTER TABLE ONLY public.users ADD CONSTRAINT users_pkey PRIMARY KEY (id);

COPY public.users (id, name, email) FROM stdin;
1\tAlice\ta@x.com
2\tBob\tb@x.com
\\.

CREATE SEQUENCE public.users_id_seq;
";

#[test]
fn dump_file_round_trip() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(DUMP.as_bytes()).unwrap();

    let text = std::fs::read_to_string(file.path()).unwrap();
    let statements = parser::parse_dump(&text).unwrap();
    let (changes, stats) = ingest::dump_to_changes(statements, 0).unwrap();

    assert_eq!(stats.ddl_statements, 3);
    assert_eq!(stats.rows, 2);
    assert_eq!(changes.len(), 5);

    // Changes replay in the dump's own order: table, constraint, rows,
    // then the trailing sequence.
    let kinds: Vec<&str> = changes
        .iter()
        .map(|c| match &c.payload {
            ChangePayload::Ddl(_) => "ddl",
            ChangePayload::Dml(_) => "dml",
        })
        .collect();
    assert_eq!(kinds, vec!["ddl", "ddl", "dml", "dml", "ddl"]);

    // Byte-identical on a rerun.
    let statements = parser::parse_dump(&text).unwrap();
    let (again, _) = ingest::dump_to_changes(statements, 0).unwrap();
    assert_eq!(changes, again);
}
