//! Parameterized declarations: one test or suite per table row.
//!
//! Rows are JSON values. An array row is spread into positional arguments, an
//! object row is passed as a single argument, and any other value becomes a
//! one-argument row. A pipe-delimited template is parsed into object rows
//! keyed by its header.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::ops::Deref;

use crate::error::TableError;

/// Arguments for one row of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// 1-based position in the table.
    pub index: usize,
    args: Vec<Value>,
}

impl Row {
    /// A property of an object row.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.args.first()?.as_object()?.get(name)
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }
}

impl Deref for Row {
    type Target = [Value];

    fn deref(&self) -> &[Value] {
        &self.args
    }
}

/// Rows for `each`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    rows: Vec<Row>,
}

impl Table {
    pub fn new(rows: impl IntoIterator<Item = Value>) -> Self {
        let rows = rows
            .into_iter()
            .enumerate()
            .map(|(i, value)| Row {
                index: i + 1,
                args: match value {
                    Value::Array(items) => items,
                    other => vec![other],
                },
            })
            .collect();
        Table { rows }
    }

    /// Parse a pipe-delimited template:
    ///
    /// ```text
    /// a | b | expected
    /// 1 | 2 | 3
    /// 'x' | null | [1, 2]
    /// ```
    pub fn parse_template(source: &str) -> Result<Self, TableError> {
        let mut lines = source
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !is_separator(l));

        let header: Vec<String> = lines
            .next()
            .ok_or(TableError::MissingHeader)?
            .split('|')
            .map(|h| h.trim().to_string())
            .collect();
        if header.iter().any(String::is_empty) {
            return Err(TableError::EmptyColumn);
        }

        let mut objects = Vec::new();
        for (i, line) in lines.enumerate() {
            let cells: Vec<&str> = line.split('|').map(str::trim).collect();
            if cells.len() != header.len() {
                return Err(TableError::CellCount {
                    row: i + 1,
                    expected: header.len(),
                    found: cells.len(),
                });
            }
            let object: Map<String, Value> = header
                .iter()
                .cloned()
                .zip(cells.into_iter().map(parse_cell))
                .collect();
            objects.push(Value::Object(object));
        }
        Ok(Table::new(objects))
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl From<Vec<Vec<Value>>> for Table {
    fn from(rows: Vec<Vec<Value>>) -> Self {
        Table::new(rows.into_iter().map(Value::Array))
    }
}

/// `---|---` style rulers between header and body.
fn is_separator(line: &str) -> bool {
    line.chars().all(|c| matches!(c, '-' | '|' | ':' | ' ' | '='))
}

/// Typed parsing of a single template cell.
fn parse_cell(cell: &str) -> Value {
    match cell {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" | "undefined" => return Value::Null,
        _ => {}
    }
    if let Ok(i) = cell.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = cell.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    let quoted = cell.len() >= 2
        && ((cell.starts_with('\'') && cell.ends_with('\''))
            || (cell.starts_with('"') && cell.ends_with('"')));
    if quoted {
        return Value::String(cell[1..cell.len() - 1].to_string());
    }
    if cell.starts_with('[') || cell.starts_with('{') {
        if let Ok(v) = serde_json::from_str(cell) {
            return v;
        }
    }
    Value::String(cell.to_string())
}

static PRINTF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"%[sdifjoO%]").expect("printf pattern compiles"));

static DOLLAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$(#|\d+|[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)")
        .expect("interpolation pattern compiles")
});

/// Generate the declared name for `row` from `template`.
///
/// printf tokens (`%s %d %i %f %j %o %%`) win; otherwise `$#` (1-based row
/// index), `$N` (0-based argument) and `$prop` (object-row property) are
/// interpolated; otherwise `"<template> [n] (args)"`.
pub fn format_name(template: &str, row: &Row) -> String {
    if PRINTF.is_match(template) {
        return printf(template, row);
    }
    if DOLLAR.is_match(template) {
        return DOLLAR
            .replace_all(template, |caps: &regex::Captures<'_>| {
                let token = &caps[1];
                let value = if token == "#" {
                    Some(Value::from(row.index))
                } else if let Ok(n) = token.parse::<usize>() {
                    row.args.get(n).cloned()
                } else {
                    lookup(row, token).cloned()
                };
                match value {
                    Some(v) => display(&v),
                    None => caps[0].to_string(),
                }
            })
            .into_owned();
    }
    let args: Vec<String> = row.args.iter().map(display).collect();
    format!("{template} [{}] ({})", row.index, args.join(", "))
}

fn printf(template: &str, row: &Row) -> String {
    let mut args = row.args.iter();
    PRINTF
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let token = &caps[0];
            if token == "%%" {
                return "%".to_string();
            }
            let Some(arg) = args.next() else {
                return token.to_string();
            };
            match token {
                "%d" | "%i" => match arg.as_f64() {
                    Some(n) => format!("{}", n.trunc() as i64),
                    None => "NaN".to_string(),
                },
                "%f" => match arg.as_f64() {
                    Some(n) => n.to_string(),
                    None => "NaN".to_string(),
                },
                "%j" | "%o" | "%O" => arg.to_string(),
                _ => display(arg),
            }
        })
        .into_owned()
}

fn lookup<'a>(row: &'a Row, path: &str) -> Option<&'a Value> {
    let mut current = row.args.first()?;
    for key in path.split('.') {
        current = current.as_object()?.get(key)?;
    }
    Some(current)
}

/// `%s`-style rendering: strings bare, everything else as JSON.
fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
