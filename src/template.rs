//! `{name}` placeholder resolution for headers, arguments and environment variables.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::models::{Argument, ArgumentKind, Input};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("Required variable '{0}' has no value or default")]
    MissingRequired(String),
    #[error("Required input '{0}' has no value or default")]
    MissingInput(String),
}

/// Substitute every `{name}` placeholder in `template` with the matching
/// variable's value, falling back to its default.
///
/// Every required variable must resolve, whether or not the template uses it.
/// Optional variables without a value become empty. Placeholders that name no
/// declared variable are kept verbatim.
pub fn resolve(template: &str, variables: &BTreeMap<String, Input>) -> Result<String, TemplateError> {
    let mut values = BTreeMap::new();
    for (name, variable) in variables {
        match effective(variable) {
            Some(v) => {
                values.insert(name.as_str(), v);
            }
            None if variable.is_required => return Err(TemplateError::MissingRequired(name.clone())),
            None => {
                values.insert(name.as_str(), "");
            }
        }
    }

    if !template.contains('{') {
        return Ok(template.to_string());
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let name = &after[..end];
        match values.get(name) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[start..start + end + 2]),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Resolve an input, preferring `override_value` over the declared value and default.
///
/// A non-empty override is the final value and is not templated. Returns
/// `None` for an optional input with nothing to send.
pub fn resolve_input(input: &Input, override_value: Option<&str>) -> Result<Option<String>, TemplateError> {
    if let Some(value) = override_value.filter(|v| !v.is_empty()) {
        return Ok(Some(value.to_string()));
    }
    match effective(input) {
        Some(base) => resolve(base, &input.variables).map(Some),
        None if input.is_required => Err(TemplateError::MissingInput(
            input
                .name
                .clone()
                .or_else(|| input.description.clone())
                .unwrap_or_else(|| "<unnamed>".to_string()),
        )),
        None => Ok(None),
    }
}

/// Render an argument for argv: named arguments as `name=value`, positional ones as `value`.
pub fn render_argument(argument: &Argument, override_value: Option<&str>) -> Result<Option<String>, TemplateError> {
    let Some(value) = resolve_input(&argument.input, override_value)? else {
        return Ok(None);
    };
    match (argument.kind, argument.input.name.as_deref()) {
        (ArgumentKind::Named, Some(name)) => Ok(Some(format!("{}={}", name, value))),
        _ => Ok(Some(value)),
    }
}

fn effective(input: &Input) -> Option<&str> {
    input
        .value
        .as_deref()
        .filter(|v| !v.is_empty())
        .or_else(|| input.default.as_deref().filter(|v| !v.is_empty()))
}
