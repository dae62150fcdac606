// src/template.rs

//! Restricted `{{scope.field}}` token substitution.
//!
//! Recipe strings interpolate values from a small, fixed set of scopes
//! (`inputs`, `item`, `self`, `outputs`). This is deliberately not a
//! templating language: a single scan finds `{{...}}` tokens, each token
//! must be exactly `scope.field`, and everything else is literal text.

use std::collections::BTreeMap;

use crate::errors::{FlowdagError, Result};

/// One parsed fragment of a template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Literal(String),
    Ref { scope: String, field: String },
}

/// Value lookup for template resolution.
///
/// Scopes are registered by name; resolution fails on any reference to a
/// scope that is not registered or a field that is absent from its scope.
#[derive(Debug, Default)]
pub struct TemplateContext<'a> {
    scopes: BTreeMap<&'a str, &'a BTreeMap<String, String>>,
}

impl<'a> TemplateContext<'a> {
    pub fn new() -> Self {
        Self {
            scopes: BTreeMap::new(),
        }
    }

    pub fn with_scope(mut self, name: &'a str, values: &'a BTreeMap<String, String>) -> Self {
        self.scopes.insert(name, values);
        self
    }

    fn lookup(&self, scope: &str, field: &str) -> Option<&str> {
        self.scopes
            .get(scope)
            .and_then(|values| values.get(field))
            .map(|s| s.as_str())
    }
}

/// Whether a string contains any `{{...}}` tokens at all.
pub fn has_tokens(s: &str) -> bool {
    s.contains("{{")
}

/// Parse a template into tokens.
///
/// Malformed tokens (unterminated `{{`, empty or non-dotted contents) are
/// reported as template resolution errors so that recipe validation can
/// reject them before any execution starts.
pub fn tokenize(template: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut rest = template;
    let mut literal = String::new();

    while let Some(open) = rest.find("{{") {
        literal.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after.find("}}").ok_or_else(|| malformed(template))?;
        let content = after[..close].trim();

        let (scope, field) = content.split_once('.').ok_or_else(|| malformed(template))?;
        if scope.is_empty() || field.is_empty() || field.contains('.') {
            return Err(malformed(template));
        }

        if !literal.is_empty() {
            tokens.push(Token::Literal(std::mem::take(&mut literal)));
        }
        tokens.push(Token::Ref {
            scope: scope.to_string(),
            field: field.to_string(),
        });

        rest = &after[close + 2..];
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }

    Ok(tokens)
}

/// Scope names referenced by a template, for validation.
pub fn referenced_scopes(template: &str) -> Result<Vec<String>> {
    let mut scopes = Vec::new();
    for token in tokenize(template)? {
        if let Token::Ref { scope, .. } = token {
            if !scopes.contains(&scope) {
                scopes.push(scope);
            }
        }
    }
    Ok(scopes)
}

/// Resolve a template against the given context.
pub fn resolve(template: &str, ctx: &TemplateContext<'_>) -> Result<String> {
    let mut out = String::with_capacity(template.len());

    for token in tokenize(template)? {
        match token {
            Token::Literal(text) => out.push_str(&text),
            Token::Ref { scope, field } => match ctx.lookup(&scope, &field) {
                Some(value) => out.push_str(value),
                None => {
                    return Err(FlowdagError::TemplateResolution {
                        template: template.to_string(),
                        scope,
                        field,
                    });
                }
            },
        }
    }

    Ok(out)
}

fn malformed(template: &str) -> FlowdagError {
    FlowdagError::Recipe(format!(
        "malformed template '{template}': tokens must be '{{{{scope.field}}}}'"
    ))
}
