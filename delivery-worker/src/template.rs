//! Message templates and literal placeholder rendering.
//!
//! Rendering is plain substitution: `{{ key }}` is replaced with the string
//! form of `vars[key]`. Unknown keys are left untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub subject: String,
    /// HTML body
    pub body: String,
}

impl Template {
    pub fn new(id: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }

    /// Render subject and body against `vars`.
    pub fn render(&self, vars: &Value) -> (String, String) {
        (render(&self.subject, vars), render(&self.body, vars))
    }
}

/// Replace every `{{ key }}` in `text` with the matching value from `vars`.
pub fn render(text: &str, vars: &Value) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];

        let Some(end) = after_open.find("}}") else {
            // Unterminated placeholder, keep the remainder verbatim
            out.push_str(&rest[start..]);
            return out;
        };

        let key = after_open[..end].trim();
        match lookup(vars, key) {
            Some(value) => out.push_str(&value),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after_open[end + 2..];
    }

    out.push_str(rest);
    out
}

fn lookup(vars: &Value, key: &str) -> Option<String> {
    if key.is_empty() {
        return None;
    }
    match vars.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => Some(String::new()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}
