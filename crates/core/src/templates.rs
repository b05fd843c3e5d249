//! Message template rendering with `{{variable}}` placeholders.
//!
//! Unknown or unterminated placeholders are copied through verbatim; rendering
//! never fails.

use std::collections::HashMap;

pub const CLIENTE: &str = "cliente";
pub const PREMIO: &str = "premio";
pub const CUPOM: &str = "cupom";
pub const TELEFONE: &str = "telefone";
pub const CAMPANHA: &str = "campanha";
pub const NOTA: &str = "nota";

/// Values available to a template, keyed by placeholder name.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    values: HashMap<String, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.values.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

/// Substitute every resolvable `{{name}}` (surrounding whitespace inside the
/// braces is ignored) in `template`.
pub fn render(template: &str, vars: &TemplateVars) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        match after_open.find("}}") {
            Some(close) => {
                let name = after_open[..close].trim();
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[open..open + 2 + close + 2]),
                }
                rest = &after_open[close + 2..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
