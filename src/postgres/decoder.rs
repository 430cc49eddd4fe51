// ABOUTME: Parser for test_decoding output lines into typed row changes
// ABOUTME: Handles quoted literals, nulls, old-key tuples and unchanged TOAST values

use anyhow::{anyhow, bail, Result};
use serde_json::{Number, Value};

use crate::session::Row;
use crate::sync::change::ChangeKind;

/// One `table ...:` line of `test_decoding` output.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedChange {
    pub schema: String,
    pub table: String,
    pub kind: ChangeKind,
    /// `old-key:` tuple of an update that changed the replica identity.
    pub old_key: Option<Row>,
    /// New tuple for inserts and updates, key tuple for deletes.
    pub tuple: Row,
    /// Some column was an unchanged TOAST value and is missing from `tuple`.
    pub partial: bool,
}

/// What a decoded line describes.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedLine {
    Begin,
    Commit,
    Change(DecodedChange),
    /// Messages, truncates and anything else the sync does not consume.
    Other,
}

const UNCHANGED_TOAST: &str = "unchanged-toast-datum";

pub fn parse_line(line: &str) -> Result<DecodedLine> {
    if line.starts_with("BEGIN") {
        return Ok(DecodedLine::Begin);
    }
    if line.starts_with("COMMIT") {
        return Ok(DecodedLine::Commit);
    }
    let rest = match line.strip_prefix("table ") {
        Some(rest) => rest,
        None => return Ok(DecodedLine::Other),
    };

    let (qualified, rest) = rest
        .split_once(": ")
        .ok_or_else(|| anyhow!("missing table terminator in {:?}", line))?;
    let (schema, table) = split_qualified(qualified)?;

    let (action, body) = match rest.split_once(':') {
        Some((action, body)) => (action, body.trim_start()),
        None => bail!("missing action in {:?}", line),
    };
    let kind = match action {
        "INSERT" => ChangeKind::Insert,
        "UPDATE" => ChangeKind::Update,
        "DELETE" => ChangeKind::Delete,
        _ => return Ok(DecodedLine::Other),
    };

    let (old_key, tuple_text) = match body.strip_prefix("old-key: ") {
        Some(after) => match after.find(" new-tuple: ") {
            Some(split) => (Some(&after[..split]), &after[split + " new-tuple: ".len()..]),
            None => bail!("old-key without new-tuple in {:?}", line),
        },
        None => (None, body.strip_prefix("new-tuple: ").unwrap_or(body)),
    };

    let (tuple, partial) = if tuple_text.starts_with('(') {
        // "(no-tuple-data)" on deletes without a replica identity
        (Row::new(), true)
    } else {
        parse_tuple(tuple_text)?
    };
    let old_key = match old_key {
        Some(text) => Some(parse_tuple(text)?.0),
        None => None,
    };

    Ok(DecodedLine::Change(DecodedChange {
        schema,
        table,
        kind,
        old_key,
        tuple,
        partial,
    }))
}

fn split_qualified(qualified: &str) -> Result<(String, String)> {
    let (schema, table) = qualified
        .split_once('.')
        .ok_or_else(|| anyhow!("unqualified table name {:?}", qualified))?;
    Ok((unquote_ident(schema), unquote_ident(table)))
}

fn unquote_ident(ident: &str) -> String {
    match ident.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(inner) => inner.replace("\"\"", "\""),
        None => ident.to_string(),
    }
}

/// Parse `name[type]:value name[type]:value ...`.
fn parse_tuple(text: &str) -> Result<(Row, bool)> {
    let mut row = Row::new();
    let mut partial = false;
    let mut rest = text.trim_start();

    while !rest.is_empty() {
        let (name, after_name) = take_ident(rest)?;
        let after_bracket = after_name
            .strip_prefix('[')
            .ok_or_else(|| anyhow!("missing type for column {}", name))?;
        let close = after_bracket
            .find("]:")
            .ok_or_else(|| anyhow!("unterminated type for column {}", name))?;
        let data_type = &after_bracket[..close];
        let value_text = &after_bracket[close + 2..];

        let (raw, remainder) = take_value(value_text)?;
        match raw {
            RawValue::Quoted(text) => {
                row.insert(name, typed_value(data_type, Some(&text)));
            }
            RawValue::Bare(token) if token == "null" => {
                row.insert(name, Value::Null);
            }
            RawValue::Bare(token) if token == UNCHANGED_TOAST => partial = true,
            RawValue::Bare(token) => {
                row.insert(name, typed_value(data_type, Some(&token)));
            }
        }
        rest = remainder.trim_start();
    }
    Ok((row, partial))
}

fn take_ident(text: &str) -> Result<(String, &str)> {
    if let Some(quoted) = text.strip_prefix('"') {
        let mut name = String::new();
        let mut chars = quoted.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c == '"' {
                if let Some((_, '"')) = chars.peek() {
                    name.push('"');
                    chars.next();
                    continue;
                }
                return Ok((name, &quoted[i + 1..]));
            }
            name.push(c);
        }
        bail!("unterminated quoted identifier in {:?}", text);
    }
    let end = text.find('[').ok_or_else(|| anyhow!("missing column type in {:?}", text))?;
    Ok((text[..end].to_string(), &text[end..]))
}

enum RawValue {
    Quoted(String),
    Bare(String),
}

fn take_value(text: &str) -> Result<(RawValue, &str)> {
    if let Some(quoted) = text.strip_prefix('\'') {
        let mut value = String::new();
        let mut chars = quoted.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c == '\'' {
                if let Some((_, '\'')) = chars.peek() {
                    value.push('\'');
                    chars.next();
                    continue;
                }
                return Ok((RawValue::Quoted(value), &quoted[i + 1..]));
            }
            value.push(c);
        }
        bail!("unterminated literal in {:?}", text);
    }
    let end = text.find(' ').unwrap_or(text.len());
    Ok((RawValue::Bare(text[..end].to_string()), &text[end..]))
}

/// Map a literal to JSON the same way query results are decoded.
fn typed_value(data_type: &str, text: Option<&str>) -> Value {
    let text = match text {
        Some(text) => text,
        None => return Value::Null,
    };
    match data_type {
        "smallint" | "integer" | "bigint" => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        "real" | "double precision" => text
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(text.to_string())),
        "boolean" => Value::Bool(text == "true"),
        "json" | "jsonb" => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        }
        _ => Value::String(text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(line: &str) -> DecodedChange {
        match parse_line(line).unwrap() {
            DecodedLine::Change(change) => change,
            other => panic!("expected a change, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_insert() {
        let decoded = change(
            "table public.book: INSERT: id[integer]:1 isbn[character varying]:'001' \
             title[text]:'It''s here' price[numeric]:9.99 sold[boolean]:false blurb[text]:null",
        );
        assert_eq!(decoded.schema, "public");
        assert_eq!(decoded.table, "book");
        assert_eq!(decoded.kind, ChangeKind::Insert);
        assert_eq!(
            serde_json::Value::Object(decoded.tuple),
            json!({"id": 1, "isbn": "001", "title": "It's here", "price": "9.99", "sold": false, "blurb": null})
        );
        assert!(decoded.old_key.is_none());
        assert!(!decoded.partial);
    }

    #[test]
    fn test_parse_update_with_old_key() {
        let decoded = change(
            "table public.book: UPDATE: old-key: isbn[character varying]:'001' \
             new-tuple: isbn[character varying]:'002' title[text]:'A b'",
        );
        assert_eq!(decoded.kind, ChangeKind::Update);
        assert_eq!(
            decoded.old_key.map(serde_json::Value::Object),
            Some(json!({"isbn": "001"}))
        );
        assert_eq!(serde_json::Value::Object(decoded.tuple), json!({"isbn": "002", "title": "A b"}));
    }

    #[test]
    fn test_unchanged_toast_marks_partial() {
        let decoded = change(
            "table public.book: UPDATE: id[integer]:3 body[text]:unchanged-toast-datum",
        );
        assert!(decoded.partial);
        assert_eq!(serde_json::Value::Object(decoded.tuple), json!({"id": 3}));
    }

    #[test]
    fn test_quoted_identifiers_and_deletes() {
        let decoded = change("table \"My Schema\".\"Odd\"\"Name\": DELETE: \"Key Col\"[integer]:7");
        assert_eq!(decoded.schema, "My Schema");
        assert_eq!(decoded.table, "Odd\"Name");
        assert_eq!(decoded.kind, ChangeKind::Delete);
        assert_eq!(serde_json::Value::Object(decoded.tuple), json!({"Key Col": 7}));
    }

    #[test]
    fn test_markers() {
        assert_eq!(parse_line("BEGIN 5123").unwrap(), DecodedLine::Begin);
        assert_eq!(parse_line("COMMIT 5123").unwrap(), DecodedLine::Commit);
        assert_eq!(
            parse_line("table public.book: TRUNCATE: (no-flags)").unwrap(),
            DecodedLine::Other
        );
    }
}
