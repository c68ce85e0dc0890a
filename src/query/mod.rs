//! Query Building and Compilation
//!
//! The driver treats query terms as opaque JSON produced by a term builder.
//! This module only wraps a term with its optional arguments, checks those
//! arguments, and compiles the START payload.
//!
//! ## Option Names
//!
//! Callers may spell options in camelCase (`readMode`) or snake_case
//! (`read_mode`); both compile to snake_case. Names the server does not
//! accept are rejected before anything is written to the network.

use crate::error::{DriverError, Result};
use crate::protocol::QueryType;
use bytes::Bytes;
use serde_json::{json, Map, Value};

/// Optional arguments accepted when running a query.
pub const RUN_OPTIONS: &[&str] = &[
    "read_mode",
    "time_format",
    "profile",
    "durability",
    "group_format",
    "noreply",
    "db",
    "array_limit",
    "binary_format",
    "min_batch_rows",
    "max_batch_rows",
    "max_batch_bytes",
    "max_batch_seconds",
    "first_batch_scaledown_factor",
];

/// Term code the server uses for a database reference.
const DB_TERM: u64 = 14;

/// A query term together with its run options.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    term: Value,
    options: Map<String, Value>,
}

impl Query {
    /// Wraps an already-built term.
    pub fn new(term: impl Into<Value>) -> Self {
        Self {
            term: term.into(),
            options: Map::new(),
        }
    }

    /// Adds a run option.
    pub fn opt(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    /// Asks the server not to reply to this query.
    pub fn noreply(self) -> Self {
        self.opt("noreply", true)
    }

    /// Returns true if the query was marked noreply.
    pub fn is_noreply(&self) -> bool {
        self.options
            .iter()
            .any(|(name, value)| to_snake_case(name) == "noreply" && value.as_bool() == Some(true))
    }

    pub fn term(&self) -> &Value {
        &self.term
    }

    pub fn options(&self) -> &Map<String, Value> {
        &self.options
    }

    /// Compiles the START payload: `[1, term, optargs]`.
    pub fn compile(&self) -> Result<Bytes> {
        let mut options = validate_options(&self.options, RUN_OPTIONS).map_err(|e| match e {
            DriverError::Validation(msg) => {
                DriverError::Validation(format!("{} in:\n{}", msg, self.term))
            }
            other => other,
        })?;

        if let Some(Value::String(name)) = options.get("db") {
            let db = json!([DB_TERM, [name]]);
            options.insert("db".to_string(), db);
        }

        let payload = json!([QueryType::Start.code(), self.term, options]);
        Ok(Bytes::from(serde_json::to_vec(&payload)?))
    }
}

/// Checks option names against `allowed`, returning them in snake_case.
pub fn validate_options(options: &Map<String, Value>, allowed: &[&str]) -> Result<Map<String, Value>> {
    let mut validated = Map::with_capacity(options.len());
    for (name, value) in options {
        let snake = to_snake_case(name);
        if !allowed.contains(&snake.as_str()) {
            return Err(DriverError::Validation(format!(
                "Unrecognized optional argument `{}`",
                snake
            )));
        }
        validated.insert(snake, value.clone());
    }
    Ok(validated)
}

/// Converts `camelCase` to `snake_case`; snake_case input is returned as is.
pub fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for ch in name.chars() {
        if ch.is_ascii_uppercase() {
            if !out.is_empty() {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
