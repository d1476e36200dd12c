// src/core/protocol/reply.rs

//! Reply lines sent from the gateway to a client.

use crate::core::{ResultCode, SamError};
use std::fmt;

/// One outbound line: a head such as `SESSION STATUS` followed by
/// `KEY=VALUE` fields in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    head: String,
    fields: Vec<(String, String)>,
}

impl Reply {
    pub fn new(head: impl Into<String>) -> Self {
        Self {
            head: head.into(),
            fields: Vec::new(),
        }
    }

    /// A line with no fields, written exactly as given (`PONG x`, peer
    /// destination lines).
    pub fn raw(text: impl Into<String>) -> Self {
        Self::new(text)
    }

    pub fn result(self, code: ResultCode) -> Self {
        self.field("RESULT", code.to_string())
    }

    pub fn field(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.fields.push((key.into(), value.to_string()));
        self
    }

    pub fn field_opt(self, key: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(v) => self.field(key, v),
            None => self,
        }
    }

    /// Builds the error reply for `err` under `head`, adding `MESSAGE=`.
    pub fn error(head: impl Into<String>, err: &SamError) -> Self {
        Self::new(head)
            .result(err.result_code())
            .field("MESSAGE", err.to_string())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Renders the line including its trailing newline.
    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.head)?;
        for (key, value) in &self.fields {
            write!(f, " {key}={}", quote(value))?;
        }
        Ok(())
    }
}

fn quote(value: &str) -> String {
    if !value.is_empty() && !value.contains(|c: char| c.is_whitespace() || c == '"') {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        // Newlines would split the reply into two lines.
        out.push(if c == '\n' || c == '\r' { ' ' } else { c });
    }
    out.push('"');
    out
}
