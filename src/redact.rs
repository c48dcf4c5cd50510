//! Masking of known secret values in arbitrary text.
//!
//! Secrets are collected from stored configurations and credential documents,
//! then every literal occurrence is replaced by a fixed-length mask so that
//! the secret's length is not revealed either.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::config::ConnectionConfig;
use crate::storage::{SecretStorage, StorageError};

pub const MASK: &str = "********************";

/// Keys whose string values are treated as secrets, compared case-insensitively.
const SECRET_KEYS: [&str; 8] = [
    "authorization",
    "bearer",
    "token",
    "password",
    "secret",
    "api-key",
    "apikey",
    "x-api-key",
];

/// Somewhere secrets can be read from besides stored configurations.
#[derive(Debug, Clone, Copy)]
pub enum CredentialSource<'a> {
    /// A value that is itself a secret.
    Plain(&'a str),
    /// A parsed document; only strings under whitelisted keys are secrets.
    Document(&'a Value),
    /// A stored string: walked as a document if it is a JSON object or
    /// array, taken as a plain secret otherwise.
    Raw(&'a str),
}

pub fn is_secret_key(key: &str) -> bool {
    SECRET_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key))
}

/// Collect whitelisted string leaves of `value` into `out`.
pub fn collect_document_secrets(value: &Value, out: &mut BTreeSet<String>) {
    walk(value, None, out);
}

fn walk(value: &Value, parent: Option<&str>, out: &mut BTreeSet<String>) {
    match value {
        Value::String(s) if !s.is_empty() && parent.is_some_and(is_secret_key) => {
            out.insert(s.clone());
        }
        // Array elements inherit the key the array sits under.
        Value::Array(items) => items.iter().for_each(|item| walk(item, parent, out)),
        Value::Object(map) => map.iter().for_each(|(k, v)| walk(v, Some(k.as_str()), out)),
        _ => {}
    }
}

#[derive(Debug, Clone)]
pub struct SecretRedactor {
    secrets: BTreeSet<String>,
}

impl SecretRedactor {
    pub fn new(secrets: impl IntoIterator<Item = String>) -> Self {
        Self {
            secrets: secrets.into_iter().filter(|s| !s.is_empty()).collect(),
        }
    }

    /// Secrets from configuration credential maps plus the given sources.
    pub fn collect(configs: &[ConnectionConfig], sources: &[CredentialSource<'_>]) -> Self {
        let mut secrets: BTreeSet<String> = configs
            .iter()
            .flat_map(ConnectionConfig::credential_values)
            .map(String::from)
            .collect();
        for source in sources {
            match *source {
                CredentialSource::Plain(s) => {
                    secrets.insert(s.to_string());
                }
                CredentialSource::Document(doc) => collect_document_secrets(doc, &mut secrets),
                CredentialSource::Raw(raw) => collect_raw(raw, &mut secrets),
            }
        }
        Self::new(secrets)
    }

    /// Secrets from every value in the storage.
    ///
    /// Entries that cannot be read are logged and skipped.
    pub async fn from_storage(storage: &dyn SecretStorage) -> Result<Self, StorageError> {
        let mut secrets = BTreeSet::new();
        for key in storage.keys().await? {
            match storage.get(&key).await {
                Ok(Some(value)) => collect_raw(&value, &mut secrets),
                Ok(None) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "failed to read secret, skipping"),
            }
        }
        Ok(Self::new(secrets))
    }

    pub fn secrets(&self) -> &BTreeSet<String> {
        &self.secrets
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn redact(&self, content: &str) -> String {
        redact(content, &self.secrets, MASK)
    }

    /// Mask in place: whitelisted keys lose their whole value, every other
    /// string has known secrets masked.
    pub fn redact_value(&self, value: &mut Value) {
        redact_value_under(self, value, None);
    }

    /// Redact a JSON document whose `field` holds a serialized JSON sub-document.
    ///
    /// `field` is a top-level key, or a JSON pointer when it starts with `/`.
    /// If anything fails to parse, `content` is returned unchanged.
    pub fn redact_embedded(&self, content: &str, field: &str) -> String {
        let Ok(mut outer) = serde_json::from_str::<Value>(content) else {
            return content.to_string();
        };

        let slot = if field.starts_with('/') {
            outer.pointer_mut(field)
        } else {
            outer.get_mut(field)
        };
        let Some(Value::String(embedded)) = slot else {
            return content.to_string();
        };
        let Ok(mut inner) = serde_json::from_str::<Value>(embedded) else {
            return content.to_string();
        };
        self.redact_value(&mut inner);
        let Ok(serialized) = serde_json::to_string(&inner) else {
            return content.to_string();
        };
        *embedded = serialized;

        self.redact_value(&mut outer);
        let output = if content.trim_end().contains('\n') {
            serde_json::to_string_pretty(&outer)
        } else {
            serde_json::to_string(&outer)
        };
        output.unwrap_or_else(|_| content.to_string())
    }
}

fn redact_value_under(redactor: &SecretRedactor, value: &mut Value, parent: Option<&str>) {
    match value {
        Value::String(s) if !s.is_empty() && parent.is_some_and(is_secret_key) => {
            *s = MASK.to_string();
        }
        Value::String(s) => {
            if !redactor.secrets.is_empty() {
                *s = redactor.redact(s);
            }
        }
        Value::Array(items) => items
            .iter_mut()
            .for_each(|item| redact_value_under(redactor, item, parent)),
        Value::Object(map) => map
            .iter_mut()
            .for_each(|(k, v)| redact_value_under(redactor, v, Some(k.as_str()))),
        _ => {}
    }
}

fn collect_raw(raw: &str, out: &mut BTreeSet<String>) {
    if raw.is_empty() {
        return;
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(doc @ (Value::Object(_) | Value::Array(_))) => collect_document_secrets(&doc, out),
        _ => {
            out.insert(raw.to_string());
        }
    }
}

/// Replace every occurrence of every secret in `content` with `mask`.
///
/// Longer secrets are replaced first and passes repeat until no secret is
/// left, since masking can join text into a new occurrence. If a secret also
/// occurs inside `mask`, a mask of the same length made of another character
/// is used instead.
pub fn redact<S: AsRef<str>>(content: &str, secrets: impl IntoIterator<Item = S>, mask: &str) -> String {
    let mut secrets: Vec<String> = secrets
        .into_iter()
        .map(|s| s.as_ref().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if secrets.is_empty() || content.is_empty() {
        return content.to_string();
    }
    secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    secrets.dedup();

    let mask = usable_mask(mask, &secrets);
    let mut result = content.to_string();
    loop {
        let mut changed = false;
        for secret in &secrets {
            if result.contains(secret.as_str()) {
                result = result.replace(secret.as_str(), &mask);
                changed = true;
            }
        }
        if !changed {
            return result;
        }
    }
}

fn usable_mask(mask: &str, secrets: &[String]) -> String {
    let clashes = |m: &str| m.is_empty() || secrets.iter().any(|s| m.contains(s.as_str()));
    if !clashes(mask) {
        return mask.to_string();
    }
    let len = mask.chars().count().max(1);
    // Each secret rules out at most one single-character mask.
    ['*', '#', 'x', '~']
        .into_iter()
        .chain(('a'..='z').chain('A'..='Z'))
        .map(|c| c.to_string().repeat(len))
        .find(|m| !clashes(m))
        .unwrap_or_else(|| "[REDACTED]".to_string())
}
