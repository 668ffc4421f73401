//! Statement-level SQL dump parser.
//!
//! Splits a `pg_dump`/`mysqldump` plain-SQL file into statements while
//! respecting single/double quotes, dollar-quoted strings, line and
//! block comments, `COPY … FROM stdin` data blocks, and MySQL extended
//! `INSERT … VALUES (…), (…)` lists.
//!
//! The parser is textual and schema-blind: values surface as strings
//! (or NULL) in the dump's own order, and the ingester decides what each
//! statement becomes.

use kasho::error::KashoError;

/// One parsed unit of the dump, in file order.
#[derive(Debug, Clone, PartialEq)]
pub enum DumpStatement {
    /// A schema statement to replay verbatim.
    Ddl(String),
    /// Row data from a COPY block or an INSERT statement.
    Rows {
        table: String,
        columns: Vec<String>,
        rows: Vec<Vec<Option<String>>>,
    },
}

/// Parse a complete dump.
pub fn parse_dump(text: &str) -> Result<Vec<DumpStatement>, KashoError> {
    let mut out = Vec::new();
    for raw in split_statements(text)? {
        if let Some(statement) = classify(raw)? {
            out.push(statement);
        }
    }
    Ok(out)
}

// ── Statement splitting ────────────────────────────────────────────────────

struct RawStatement {
    sql: String,
    /// Data lines of a `COPY … FROM stdin` block, excluding the `\.`
    /// terminator.
    copy_data: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
enum Mode {
    Normal,
    LineComment,
    BlockComment,
    SingleQuote,
    DoubleQuote,
    Backtick,
    DollarQuote(String),
}

fn split_statements(text: &str) -> Result<Vec<RawStatement>, KashoError> {
    let bytes = text.as_bytes();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut mode = Mode::Normal;
    let mut i = 0;

    while i < bytes.len() {
        // Multi-byte characters only ever appear as payload; every
        // character the state machine dispatches on is ASCII.
        let ch = match text[i..].chars().next() {
            Some(ch) => ch,
            None => break,
        };
        if !ch.is_ascii() {
            if !matches!(mode, Mode::LineComment | Mode::BlockComment) {
                current.push(ch);
            }
            i += ch.len_utf8();
            continue;
        }
        match &mode {
            Mode::Normal => match ch {
                '-' if bytes.get(i + 1) == Some(&b'-') => {
                    mode = Mode::LineComment;
                    i += 2;
                    continue;
                }
                '/' if bytes.get(i + 1) == Some(&b'*') => {
                    mode = Mode::BlockComment;
                    i += 2;
                    continue;
                }
                '\'' => {
                    mode = Mode::SingleQuote;
                    current.push(ch);
                }
                '"' => {
                    mode = Mode::DoubleQuote;
                    current.push(ch);
                }
                '`' => {
                    mode = Mode::Backtick;
                    current.push(ch);
                }
                '$' => {
                    if let Some(tag) = dollar_tag(&text[i..]) {
                        current.push_str(&tag);
                        i += tag.len();
                        mode = Mode::DollarQuote(tag);
                        continue;
                    }
                    current.push(ch);
                }
                ';' => {
                    let sql = current.trim().to_string();
                    current.clear();
                    if sql.is_empty() {
                        i += 1;
                        continue;
                    }
                    if is_copy_from_stdin(&sql) {
                        let (data, consumed) = read_copy_block(&text[i + 1..])?;
                        statements.push(RawStatement { sql, copy_data: Some(data) });
                        i += 1 + consumed;
                        continue;
                    }
                    statements.push(RawStatement { sql, copy_data: None });
                }
                _ => current.push(ch),
            },
            Mode::LineComment => {
                if ch == '\n' {
                    mode = Mode::Normal;
                    current.push('\n');
                }
            }
            Mode::BlockComment => {
                if ch == '*' && bytes.get(i + 1) == Some(&b'/') {
                    mode = Mode::Normal;
                    i += 2;
                    continue;
                }
            }
            Mode::SingleQuote => {
                current.push(ch);
                if ch == '\\' && bytes.get(i + 1) == Some(&b'\'') {
                    // MySQL-style escaped quote inside a string.
                    current.push('\'');
                    i += 2;
                    continue;
                }
                if ch == '\'' {
                    if bytes.get(i + 1) == Some(&b'\'') {
                        current.push('\'');
                        i += 2;
                        continue;
                    }
                    mode = Mode::Normal;
                }
            }
            Mode::DoubleQuote => {
                current.push(ch);
                if ch == '"' {
                    mode = Mode::Normal;
                }
            }
            Mode::Backtick => {
                current.push(ch);
                if ch == '`' {
                    mode = Mode::Normal;
                }
            }
            Mode::DollarQuote(tag) => {
                if text[i..].starts_with(tag.as_str()) {
                    current.push_str(tag);
                    i += tag.len();
                    mode = Mode::Normal;
                    continue;
                }
                current.push(ch);
            }
        }
        i += 1;
    }

    if !matches!(mode, Mode::Normal | Mode::LineComment) {
        return Err(KashoError::Protocol(format!(
            "dump ends inside {mode:?}"
        )));
    }
    let tail = current.trim();
    if !tail.is_empty() {
        statements.push(RawStatement { sql: tail.to_string(), copy_data: None });
    }
    Ok(statements)
}

/// Recognize a dollar-quote tag (`$$` or `$tag$`) at the start of the
/// slice.
fn dollar_tag(rest: &str) -> Option<String> {
    let mut chars = rest.char_indices().skip(1);
    for (idx, ch) in &mut chars {
        if ch == '$' {
            return Some(rest[..=idx].to_string());
        }
        if !ch.is_ascii_alphanumeric() && ch != '_' {
            return None;
        }
    }
    None
}

fn is_copy_from_stdin(sql: &str) -> bool {
    let upper = sql.to_ascii_uppercase();
    upper.starts_with("COPY ") && upper.contains("FROM STDIN")
}

/// Consume data lines after a COPY header up to and including the `\.`
/// terminator. Returns the lines and the byte length consumed.
fn read_copy_block(rest: &str) -> Result<(Vec<String>, usize), KashoError> {
    let mut data = Vec::new();
    let mut consumed = 0;
    // The header's terminating semicolon is followed by the rest of its
    // line; data starts on the next one.
    let mut lines = rest.split_inclusive('\n');
    if let Some(first) = lines.next() {
        consumed += first.len();
    }
    for line in lines {
        consumed += line.len();
        let trimmed = line.strip_suffix('\n').unwrap_or(line);
        if trimmed == "\\." {
            return Ok((data, consumed));
        }
        data.push(trimmed.to_string());
    }
    Err(KashoError::Protocol(
        "COPY block not terminated by \\.".into(),
    ))
}

// ── Classification ─────────────────────────────────────────────────────────

fn classify(raw: RawStatement) -> Result<Option<DumpStatement>, KashoError> {
    let sql = raw.sql;
    let upper = sql.trim_start().to_ascii_uppercase();

    if let Some(data) = raw.copy_data {
        let (table, columns) = parse_copy_header(&sql)?;
        let rows = data
            .iter()
            .map(|line| parse_copy_row(line))
            .collect::<Vec<_>>();
        return Ok(Some(DumpStatement::Rows { table, columns, rows }));
    }

    if upper.starts_with("INSERT ") || upper.starts_with("INSERT\n") {
        return parse_insert(&sql).map(Some);
    }

    if upper.starts_with("CREATE")
        || upper.starts_with("ALTER")
        || upper.starts_with("DROP")
        || upper.starts_with("COMMENT ON")
    {
        return Ok(Some(DumpStatement::Ddl(sql)));
    }

    // Session settings, transaction control, ownership/privilege noise.
    Ok(None)
}

/// `COPY public.users (id, name, email) FROM stdin` → table + columns.
fn parse_copy_header(sql: &str) -> Result<(String, Vec<String>), KashoError> {
    let rest = sql
        .trim_start()
        .strip_prefix("COPY ")
        .or_else(|| sql.trim_start().strip_prefix("copy "))
        .ok_or_else(|| KashoError::Protocol(format!("bad COPY header: {sql}")))?;
    let open = rest
        .find('(')
        .ok_or_else(|| KashoError::Protocol(format!("COPY without column list: {sql}")))?;
    let close = rest[open..]
        .find(')')
        .map(|idx| open + idx)
        .ok_or_else(|| KashoError::Protocol(format!("unterminated COPY column list: {sql}")))?;

    let table = normalize_ident(rest[..open].trim());
    let columns = rest[open + 1..close]
        .split(',')
        .map(|c| normalize_ident(c.trim()))
        .collect();
    Ok((table, columns))
}

/// One tab-separated COPY data line; `\N` is NULL and the textual
/// escapes pg_dump emits are decoded.
fn parse_copy_row(line: &str) -> Vec<Option<String>> {
    line.split('\t')
        .map(|field| {
            if field == "\\N" {
                None
            } else {
                Some(unescape_copy_field(field))
            }
        })
        .collect()
}

fn unescape_copy_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Parse `INSERT INTO t (a, b) VALUES (…), (…)` including MySQL
/// extended multi-tuple form.
fn parse_insert(sql: &str) -> Result<DumpStatement, KashoError> {
    // ASCII uppercase preserves byte offsets into `sql`.
    let upper = sql.to_ascii_uppercase();
    let into = upper
        .find("INTO ")
        .ok_or_else(|| KashoError::Protocol(format!("INSERT without INTO: {sql}")))?;
    let values = upper
        .find("VALUES")
        .ok_or_else(|| KashoError::Protocol(format!("INSERT without VALUES: {sql}")))?;

    let head = sql[into + 5..values].trim();
    let (table, columns) = match head.find('(') {
        Some(open) => {
            let close = head
                .rfind(')')
                .ok_or_else(|| KashoError::Protocol(format!("unterminated column list: {sql}")))?;
            let columns = head[open + 1..close]
                .split(',')
                .map(|c| normalize_ident(c.trim()))
                .collect();
            (normalize_ident(head[..open].trim()), columns)
        }
        // Column list omitted; positional names are filled in by the
        // ingester from the preceding CREATE TABLE when it can.
        None => (normalize_ident(head), Vec::new()),
    };

    let mut rows = Vec::new();
    for tuple in split_tuples(&sql[values + 6..])? {
        rows.push(parse_tuple_values(&tuple)?);
    }
    if rows.is_empty() {
        return Err(KashoError::Protocol(format!("INSERT without tuples: {sql}")));
    }
    Ok(DumpStatement::Rows { table, columns, rows })
}

/// Split `(…), (…), (…)` into tuple bodies at depth zero.
fn split_tuples(rest: &str) -> Result<Vec<String>, KashoError> {
    let mut tuples = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    let mut in_quote = false;
    let mut chars = rest.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quote {
            current.push(ch);
            if ch == '\\' {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                continue;
            }
            if ch == '\'' {
                if chars.peek() == Some(&'\'') {
                    current.push(chars.next().unwrap());
                    continue;
                }
                in_quote = false;
            }
            continue;
        }
        match ch {
            '\'' => {
                in_quote = true;
                current.push(ch);
            }
            '(' => {
                if depth > 0 {
                    current.push(ch);
                }
                depth += 1;
            }
            ')' => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    KashoError::Protocol("unbalanced parentheses in INSERT".into())
                })?;
                if depth == 0 {
                    tuples.push(std::mem::take(&mut current));
                } else {
                    current.push(ch);
                }
            }
            _ => {
                if depth > 0 {
                    current.push(ch);
                }
            }
        }
    }
    if depth != 0 || in_quote {
        return Err(KashoError::Protocol("unterminated INSERT tuple".into()));
    }
    Ok(tuples)
}

/// Parse one tuple body into values. Quoting and escapes follow the
/// dump's source dialect; both pg and MySQL forms are accepted.
fn parse_tuple_values(tuple: &str) -> Result<Vec<Option<String>>, KashoError> {
    let mut values = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut was_quoted = false;
    let mut depth = 0usize;
    let mut chars = tuple.chars().peekable();

    let push = |raw: &mut String, quoted: &mut bool, values: &mut Vec<Option<String>>| {
        let trimmed = raw.trim();
        if *quoted {
            values.push(Some(trimmed.to_string()));
        } else if trimmed.eq_ignore_ascii_case("null") {
            values.push(None);
        } else {
            values.push(Some(trimmed.to_string()));
        }
        raw.clear();
        *quoted = false;
    };

    while let Some(ch) = chars.next() {
        if in_quote {
            match ch {
                '\\' => {
                    // MySQL backslash escapes.
                    match chars.next() {
                        Some('n') => current.push('\n'),
                        Some('t') => current.push('\t'),
                        Some('r') => current.push('\r'),
                        Some('\'') => current.push('\''),
                        Some('"') => current.push('"'),
                        Some('\\') => current.push('\\'),
                        Some(other) => {
                            current.push('\\');
                            current.push(other);
                        }
                        None => current.push('\\'),
                    }
                }
                '\'' => {
                    if chars.peek() == Some(&'\'') {
                        current.push('\'');
                        chars.next();
                        continue;
                    }
                    in_quote = false;
                }
                _ => current.push(ch),
            }
            continue;
        }
        match ch {
            '\'' => {
                in_quote = true;
                was_quoted = true;
            }
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 => push(&mut current, &mut was_quoted, &mut values),
            _ => current.push(ch),
        }
    }
    if in_quote {
        return Err(KashoError::Protocol("unterminated string in tuple".into()));
    }
    push(&mut current, &mut was_quoted, &mut values);
    Ok(values)
}

/// Strip identifier quoting from a dump token.
fn normalize_ident(ident: &str) -> String {
    ident
        .split('.')
        .map(|part| {
            part.trim()
                .trim_matches('"')
                .trim_matches('`')
                .to_string()
        })
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_statements_split_on_semicolons() {
        let dump = "CREATE TABLE t (id int);\nALTER TABLE t ADD c text;\n";
        let statements = parse_dump(dump).unwrap();
        assert_eq!(
            statements,
            vec![
                DumpStatement::Ddl("CREATE TABLE t (id int)".into()),
                DumpStatement::Ddl("ALTER TABLE t ADD c text".into()),
            ]
        );
    }

    #[test]
    fn test_session_noise_is_dropped() {
        let dump = "SET statement_timeout = 0;\nSELECT pg_catalog.set_config('search_path', '', false);\nBEGIN;\nCREATE TABLE t (id int);\nCOMMIT;\n";
        let statements = parse_dump(dump).unwrap();
        assert_eq!(statements.len(), 1);
    }

    #[test]
    fn test_semicolon_inside_string_does_not_split() {
        let dump = "INSERT INTO notes (id, body) VALUES (1, 'a; b; c');\n";
        let statements = parse_dump(dump).unwrap();
        assert_eq!(
            statements,
            vec![DumpStatement::Rows {
                table: "notes".into(),
                columns: vec!["id".into(), "body".into()],
                rows: vec![vec![Some("1".into()), Some("a; b; c".into())]],
            }]
        );
    }

    #[test]
    fn test_dollar_quoted_function_body_stays_one_statement() {
        let dump = "CREATE FUNCTION f() RETURNS trigger LANGUAGE plpgsql AS $fn$\nBEGIN\n  INSERT INTO log VALUES (1); RETURN NEW;\nEND;\n$fn$;\nCREATE TABLE t (id int);\n";
        let statements = parse_dump(dump).unwrap();
        assert_eq!(statements.len(), 2);
        let DumpStatement::Ddl(first) = &statements[0] else {
            panic!("expected ddl")
        };
        assert!(first.contains("$fn$"));
        assert!(first.contains("RETURN NEW;"));
    }

    #[test]
    fn test_copy_block() {
        let dump = "COPY public.users (id, name, email) FROM stdin;\n1\tAlice\ta@x.com\n2\tBob\t\\N\n\\.\nCREATE INDEX idx ON public.users (id);\n";
        let statements = parse_dump(dump).unwrap();
        assert_eq!(statements.len(), 2);
        let DumpStatement::Rows { table, columns, rows } = &statements[0] else {
            panic!("expected rows")
        };
        assert_eq!(table, "public.users");
        assert_eq!(columns, &["id", "name", "email"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][1], Some("Alice".into()));
        assert_eq!(rows[1][2], None);
    }

    #[test]
    fn test_copy_field_unescaping() {
        assert_eq!(unescape_copy_field(r"line\nbreak"), "line\nbreak");
        assert_eq!(unescape_copy_field(r"tab\there"), "tab\there");
        assert_eq!(unescape_copy_field(r"back\\slash"), r"back\slash");
    }

    #[test]
    fn test_unterminated_copy_block_fails() {
        let dump = "COPY t (id) FROM stdin;\n1\n2\n";
        assert!(parse_dump(dump).is_err());
    }

    #[test]
    fn test_mysql_extended_insert() {
        let dump = "INSERT INTO `users` (`id`, `name`) VALUES (1,'Alice'),(2,'O\\'Brien'),(3,NULL);\n";
        let statements = parse_dump(dump).unwrap();
        let DumpStatement::Rows { table, columns, rows } = &statements[0] else {
            panic!("expected rows")
        };
        assert_eq!(table, "users");
        assert_eq!(columns, &["id", "name"]);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1][1], Some("O'Brien".into()));
        assert_eq!(rows[2][1], None);
    }

    #[test]
    fn test_postgres_doubled_quote_in_insert() {
        let dump = "INSERT INTO notes (id, body) VALUES (1, 'it''s fine');\n";
        let statements = parse_dump(dump).unwrap();
        let DumpStatement::Rows { rows, .. } = &statements[0] else {
            panic!("expected rows")
        };
        assert_eq!(rows[0][1], Some("it's fine".into()));
    }

    #[test]
    fn test_quoted_empty_string_is_not_null() {
        let dump = "INSERT INTO t (a, b) VALUES ('', NULL);\n";
        let statements = parse_dump(dump).unwrap();
        let DumpStatement::Rows { rows, .. } = &statements[0] else {
            panic!("expected rows")
        };
        assert_eq!(rows[0][0], Some(String::new()));
        assert_eq!(rows[0][1], None);
    }

    #[test]
    fn test_comments_are_ignored() {
        let dump = "-- a comment; with a semicolon\n/* block; comment */\nCREATE TABLE t (id int);\n";
        let statements = parse_dump(dump).unwrap();
        assert_eq!(statements.len(), 1);
    }

    #[test]
    fn test_rows_preserve_textual_order() {
        let dump = "COPY t (id) FROM stdin;\n3\n1\n2\n\\.\n";
        let statements = parse_dump(dump).unwrap();
        let DumpStatement::Rows { rows, .. } = &statements[0] else {
            panic!("expected rows")
        };
        let ids: Vec<String> = rows.iter().map(|r| r[0].clone().unwrap()).collect();
        assert_eq!(ids, vec!["3", "1", "2"]);
    }

    #[test]
    fn test_function_call_value_kept_verbatim() {
        let dump = "INSERT INTO t (id, ts) VALUES (1, now());\n";
        let statements = parse_dump(dump).unwrap();
        let DumpStatement::Rows { rows, .. } = &statements[0] else {
            panic!("expected rows")
        };
        assert_eq!(rows[0][1], Some("now()".into()));
    }
}
