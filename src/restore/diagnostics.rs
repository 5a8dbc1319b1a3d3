// pgvault/src/restore/diagnostics.rs
//! Reads psql and pg_restore stderr back into per-object failures.

use regex::Regex;
use std::sync::LazyLock;

use crate::errors::FailedObject;

static PSQL_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^psql:(?P<file>.*?):(?P<line>\d+): (?:ERROR|FATAL):\s+(?P<message>.*)$").expect("valid regex")
});

static QUOTED_SUBJECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(?P<kind>role|relation|database|schema|tablespace|directory|function|type|index|sequence|extension|table|view|trigger|constraint|language|collation|domain|publication|subscription|server) "(?P<name>[^"]+)""#,
    )
    .expect("valid regex")
});

static TOC_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:from|Error from) TOC entry (?P<id>\d+); \d+ \d+ (?P<rest>.+?)\s*$").expect("valid regex")
});

static RESTORE_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^pg_restore: (?:error: |\[archiver \(db\)\] )(?P<message>.+)$").expect("valid regex")
});

static ERRORS_IGNORED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"errors ignored on restore: (?P<count>\d+)").expect("valid regex"));

/// TOC descriptions longer than one word, longest first.
const MULTI_WORD_DESCS: &[&str] = &[
    "MATERIALIZED VIEW DATA",
    "TEXT SEARCH CONFIGURATION",
    "TEXT SEARCH DICTIONARY",
    "SEQUENCE OWNED BY",
    "FOREIGN DATA WRAPPER",
    "USER MAPPING",
    "MATERIALIZED VIEW",
    "DATABASE PROPERTIES",
    "CHECK CONSTRAINT",
    "FK CONSTRAINT",
    "SEQUENCE SET",
    "FOREIGN TABLE",
    "EVENT TRIGGER",
    "LARGE OBJECT",
    "ACCESS METHOD",
    "DEFAULT ACL",
    "TABLE DATA",
    "BLOB DATA",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub failed: Vec<FailedObject>,
    /// Error lines not tied to an object, such as connection failures.
    pub general: Vec<String>,
    pub errors_ignored: Option<usize>,
}

/// Parses psql output for a script run with `-f`.
///
/// `role "alice" already exists` becomes kind `role`, name `alice`.
/// Messages without a quoted subject fall back to the script line.
pub fn parse_psql_stderr(stderr: &str) -> Diagnostics {
    let mut diagnostics = Diagnostics::default();
    for line in stderr.lines() {
        let Some(caps) = PSQL_ERROR.captures(line) else {
            continue;
        };
        let message = caps["message"].trim().to_string();
        let line_no = &caps["line"];
        let (kind, name) = match QUOTED_SUBJECT.captures(&message) {
            Some(subject) => (subject["kind"].to_string(), subject["name"].to_string()),
            None => ("statement".to_string(), format!("line {}", line_no)),
        };
        diagnostics.failed.push(FailedObject { kind, name, message });
    }
    diagnostics
}

/// Splits `TABLE DATA public users postgres` style TOC descriptions into
/// (desc, tag). The owner is the last word and is dropped.
fn split_toc_rest(rest: &str) -> (String, String) {
    let desc = MULTI_WORD_DESCS
        .iter()
        .find(|d| rest.starts_with(*d) && rest[d.len()..].starts_with(' '))
        .map(|d| d.to_string())
        .unwrap_or_else(|| rest.split_whitespace().next().unwrap_or("OBJECT").to_string());

    let remainder = rest[desc.len()..].trim();
    let mut words: Vec<&str> = remainder.split_whitespace().collect();
    if words.len() > 1 {
        words.pop();
    }
    let tag = if words.is_empty() { desc.clone() } else { words.join(" ") };
    (desc, tag)
}

/// Parses pg_restore output, pairing each `TOC entry` line with the error
/// that follows it.
pub fn parse_pg_restore_stderr(stderr: &str) -> Diagnostics {
    let mut diagnostics = Diagnostics::default();
    let mut pending: Option<(String, String)> = None;

    for line in stderr.lines() {
        if let Some(caps) = TOC_ENTRY.captures(line) {
            pending = Some(split_toc_rest(&caps["rest"]));
            continue;
        }
        if let Some(caps) = ERRORS_IGNORED.captures(line) {
            diagnostics.errors_ignored = caps["count"].parse().ok();
            continue;
        }
        if let Some(caps) = RESTORE_ERROR.captures(line) {
            let message = caps["message"].trim();
            if message.contains("PROCESSING TOC") {
                continue;
            }
            let message = message
                .strip_prefix("could not execute query: ")
                .unwrap_or(message)
                .trim_start_matches("ERROR:")
                .trim()
                .to_string();
            match pending.take() {
                Some((kind, name)) => diagnostics.failed.push(FailedObject { kind, name, message }),
                None => diagnostics.general.push(message),
            }
        }
    }
    diagnostics
}
