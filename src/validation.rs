//! Structural checks on registry listings.
//!
//! Registries are not trusted to follow the schema exactly. Problems are
//! reported and logged but never stop the data from being used.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::models::OFFICIAL_META_KEY;

const REMOTE_TYPES: [&str; 2] = ["sse", "streamable-http"];

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9.-]+/[a-zA-Z0-9._-]+$").expect("valid regex"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    /// JSON path of the offending value, e.g. `servers[2].server.name`.
    pub path: String,
    pub message: String,
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub issues: Vec<Issue>,
    /// Names of servers whose listing entry had at least one issue.
    pub invalid_server_names: BTreeSet<String>,
}

impl ValidationReport {
    fn from_issues(issues: Vec<Issue>, invalid_server_names: BTreeSet<String>) -> Self {
        Self {
            is_valid: issues.is_empty(),
            issues,
            invalid_server_names,
        }
    }

    /// Log every issue at warn level, naming the registry when known.
    pub fn warn(&self, registry: Option<&str>) {
        if self.is_valid {
            return;
        }
        let issues: Vec<String> = self.issues.iter().map(ToString::to_string).collect();
        match registry {
            Some(registry) => tracing::warn!(
                registry = %registry,
                issues = ?issues,
                "listing does not match the registry schema"
            ),
            None => tracing::warn!(issues = ?issues, "listing does not match the registry schema"),
        }
    }
}

/// Validate a `GET /v0/servers` body.
pub fn validate_server_list(value: &Value) -> ValidationReport {
    let mut issues = Vec::new();
    let mut invalid = BTreeSet::new();

    let Some(root) = value.as_object() else {
        issues.push(issue("$", "expected an object"));
        return ValidationReport::from_issues(issues, invalid);
    };

    match root.get("servers") {
        Some(Value::Array(entries)) => {
            for (i, entry) in entries.iter().enumerate() {
                let before = issues.len();
                let path = format!("servers[{}]", i);
                check_server_response(entry, &path, &mut issues);
                if issues.len() > before {
                    if let Some(name) = entry.pointer("/server/name").and_then(Value::as_str) {
                        invalid.insert(name.to_string());
                    }
                }
            }
        }
        Some(_) => issues.push(issue("servers", "expected an array")),
        None => issues.push(issue("servers", "missing required field")),
    }

    if let Some(metadata) = root.get("metadata") {
        match metadata.as_object() {
            Some(m) => {
                for key in ["nextCursor", "next_cursor"] {
                    if m.get(key).is_some_and(|c| !c.is_string() && !c.is_null()) {
                        issues.push(issue(&format!("metadata.{}", key), "expected a string"));
                    }
                }
            }
            None => issues.push(issue("metadata", "expected an object")),
        }
    }

    ValidationReport::from_issues(issues, invalid)
}

/// Validate a single server document.
pub fn validate_server_detail(value: &Value) -> ValidationReport {
    let mut issues = Vec::new();
    check_server(value, "server", &mut issues);
    ValidationReport::from_issues(issues, BTreeSet::new())
}

/// The registry-assigned id, if the entry's metadata carries one.
pub fn official_id(meta: &Map<String, Value>) -> Option<&str> {
    meta.get(OFFICIAL_META_KEY)
        .and_then(|official| official.get("id").or_else(|| official.get("serverId")))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

fn check_server_response(entry: &Value, path: &str, issues: &mut Vec<Issue>) {
    let Some(entry) = entry.as_object() else {
        issues.push(issue(path, "expected an object"));
        return;
    };
    match entry.get("server") {
        Some(server) => check_server(server, &format!("{}.server", path), issues),
        None => issues.push(issue(&format!("{}.server", path), "missing required field")),
    }
    match entry.get("_meta") {
        Some(Value::Object(_)) => {}
        Some(_) => issues.push(issue(&format!("{}._meta", path), "expected an object")),
        None => issues.push(issue(&format!("{}._meta", path), "missing required field")),
    }
}

fn check_server(server: &Value, path: &str, issues: &mut Vec<Issue>) {
    let Some(server) = server.as_object() else {
        issues.push(issue(path, "expected an object"));
        return;
    };

    match server.get("name").and_then(Value::as_str) {
        Some(name) if !name_pattern().is_match(name) => issues.push(issue(
            &format!("{}.name", path),
            "does not match pattern namespace/name",
        )),
        Some(_) => {}
        None => issues.push(issue(&format!("{}.name", path), "missing required string")),
    }
    for field in ["description", "version"] {
        if !server.get(field).is_some_and(Value::is_string) {
            issues.push(issue(&format!("{}.{}", path, field), "missing required string"));
        }
    }

    for (i, remote) in array_field(server, "remotes", path, issues).iter().enumerate() {
        let path = format!("{}.remotes[{}]", path, i);
        let Some(remote) = remote.as_object() else {
            issues.push(issue(&path, "expected an object"));
            continue;
        };
        match remote.get("type").and_then(Value::as_str) {
            Some(t) if REMOTE_TYPES.contains(&t) => {}
            Some(_) => issues.push(issue(
                &format!("{}.type", path),
                "must be one of sse, streamable-http",
            )),
            None => issues.push(issue(&format!("{}.type", path), "missing required string")),
        }
        if !remote.get("url").is_some_and(Value::is_string) {
            issues.push(issue(&format!("{}.url", path), "missing required string"));
        }
    }

    for (i, package) in array_field(server, "packages", path, issues).iter().enumerate() {
        let path = format!("{}.packages[{}]", path, i);
        let Some(package) = package.as_object() else {
            issues.push(issue(&path, "expected an object"));
            continue;
        };
        let has_type = ["registryType", "registry_type"]
            .iter()
            .any(|k| package.get(*k).is_some_and(Value::is_string));
        if !has_type {
            issues.push(issue(&format!("{}.registryType", path), "missing required string"));
        }
        if !package.get("identifier").is_some_and(Value::is_string) {
            issues.push(issue(&format!("{}.identifier", path), "missing required string"));
        }
    }
}

/// Elements of an optional array field; a non-array value is an issue.
fn array_field<'a>(
    object: &'a Map<String, Value>,
    field: &str,
    path: &str,
    issues: &mut Vec<Issue>,
) -> &'a [Value] {
    match object.get(field) {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => &[],
        Some(_) => {
            issues.push(issue(&format!("{}.{}", path, field), "expected an array"));
            &[]
        }
    }
}

fn issue(path: &str, message: &str) -> Issue {
    Issue {
        path: path.to_string(),
        message: message.to_string(),
    }
}
