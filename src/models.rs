//! Data structures for registries, server listings and connection variants.
//!
//! Field names follow the registry wire format (camelCase); the older
//! snake_case spellings are accepted as aliases so that registries lagging
//! behind the current schema still decode.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata key under which the official registry publishes its server id.
pub const OFFICIAL_META_KEY: &str = "io.modelcontextprotocol.registry/official";

/// A discovery endpoint implementing `GET /v0/servers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    pub server_url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default)]
    pub suggested: bool,
    #[serde(default)]
    pub persisted: bool,
}

impl Registry {
    pub fn new(server_url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            name: name.into(),
            icon: None,
            alias: None,
            suggested: false,
            persisted: false,
        }
    }

    /// Marks the registry as user-added, written to the registry file.
    #[must_use]
    pub fn persisted(mut self) -> Self {
        self.persisted = true;
        self
    }
}

/// Body of `GET /v0/servers`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerList {
    #[serde(default)]
    pub servers: Vec<ServerResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ListMetadata>,
}

impl ServerList {
    /// Decode a listing entry by entry. Malformed fields fall back to their
    /// defaults and malformed remotes or packages are dropped, so an entry is
    /// only skipped when it has no usable name. Returns the list and the
    /// number of skipped entries.
    pub fn from_value_lossy(value: Value) -> (Self, usize) {
        let Value::Object(mut root) = value else {
            return (Self::default(), 0);
        };

        let metadata = root
            .remove("metadata")
            .and_then(|m| serde_json::from_value::<ListMetadata>(m).ok());

        let mut skipped = 0;
        let servers = match root.remove("servers") {
            Some(Value::Array(entries)) => entries
                .into_iter()
                .filter_map(|entry| match serde_json::from_value::<ServerResponse>(entry) {
                    Ok(s) if !s.server.name.trim().is_empty() => Some(s),
                    Ok(_) => {
                        skipped += 1;
                        None
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "skipping undecodable server entry");
                        skipped += 1;
                        None
                    }
                })
                .collect(),
            _ => Vec::new(),
        };

        (Self { servers, metadata }, skipped)
    }

    pub fn next_cursor(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.next_cursor.as_deref())
            .filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMetadata {
    #[serde(default, alias = "next_cursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

/// One entry of a listing: the server document plus registry metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerResponse {
    pub server: ServerJson,
    #[serde(
        rename = "_meta",
        default,
        deserialize_with = "lenient::object",
        skip_serializing_if = "Map::is_empty"
    )]
    pub meta: Map<String, Value>,
}

/// Server document as published by a registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerJson {
    #[serde(default, deserialize_with = "lenient::string")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub description: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub version: String,
    #[serde(default, deserialize_with = "lenient::list")]
    pub remotes: Vec<Remote>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub packages: Vec<Package>,
    #[serde(
        rename = "_meta",
        default,
        deserialize_with = "lenient::object",
        skip_serializing_if = "Map::is_empty"
    )]
    pub meta: Map<String, Value>,
}

/// A discovered server with its derived, stable identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDetail {
    pub id: String,
    pub registry_url: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub remotes: Vec<Remote>,
    pub packages: Vec<Package>,
    pub meta: Map<String, Value>,
    pub valid_schema: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Remote {
    #[serde(rename = "type")]
    pub kind: RemoteType,
    pub url: String,
    #[serde(default, deserialize_with = "lenient::list")]
    pub headers: Vec<Input>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteType {
    Sse,
    StreamableHttp,
    #[serde(other)]
    Unknown,
}

impl RemoteType {
    pub fn as_str(self) -> &'static str {
        match self {
            RemoteType::Sse => "sse",
            RemoteType::StreamableHttp => "streamable-http",
            RemoteType::Unknown => "unknown",
        }
    }
}

/// A locally spawned connection variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    #[serde(alias = "registry_type")]
    pub registry_type: RegistryType,
    #[serde(default, deserialize_with = "lenient::string")]
    pub identifier: String,
    #[serde(
        default,
        deserialize_with = "lenient::optional_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub version: Option<String>,
    #[serde(default, alias = "runtime_arguments", deserialize_with = "lenient::list")]
    pub runtime_arguments: Vec<Argument>,
    #[serde(default, alias = "package_arguments", deserialize_with = "lenient::list")]
    pub package_arguments: Vec<Argument>,
    #[serde(default, alias = "environment_variables", deserialize_with = "lenient::list")]
    pub environment_variables: Vec<Input>,
}

/// Package ecosystem a package is published to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RegistryType {
    Npm,
    Pypi,
    Other(String),
}

impl From<String> for RegistryType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "npm" => RegistryType::Npm,
            "pypi" => RegistryType::Pypi,
            _ => RegistryType::Other(s),
        }
    }
}

impl From<RegistryType> for String {
    fn from(t: RegistryType) -> Self {
        t.to_string()
    }
}

impl std::fmt::Display for RegistryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryType::Npm => write!(f, "npm"),
            RegistryType::Pypi => write!(f, "pypi"),
            RegistryType::Other(s) => write!(f, "{}", s),
        }
    }
}

/// A user-supplied value: header, environment variable or argument body.
///
/// `value` may be a template containing `{name}` placeholders, resolved
/// against `variables`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Input {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::optional_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::optional_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub default: Option<String>,
    #[serde(default, alias = "is_required", deserialize_with = "lenient::flag")]
    pub is_required: bool,
    #[serde(default, alias = "is_secret", deserialize_with = "lenient::flag")]
    pub is_secret: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Input>,
}

impl Input {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.is_required = true;
        self
    }

    #[must_use]
    pub fn secret(mut self) -> Self {
        self.is_secret = true;
        self
    }

    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, variable: Input) -> Self {
        self.variables.insert(name.into(), variable);
        self
    }
}

/// A runtime or package argument.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    #[serde(rename = "type", default)]
    pub kind: ArgumentKind,
    #[serde(flatten)]
    pub input: Input,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgumentKind {
    #[default]
    Positional,
    Named,
}

/// Field decoders that fall back to a default instead of failing the
/// enclosing document.
mod lenient {
    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Deserializer};
    use serde_json::{Map, Value};

    fn scalar(value: Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Ok(scalar(Value::deserialize(deserializer)?).unwrap_or_default())
    }

    pub fn optional_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        Ok(scalar(Value::deserialize(deserializer)?))
    }

    pub fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::Bool(b) => b,
            Value::String(s) => s.eq_ignore_ascii_case("true"),
            _ => false,
        })
    }

    pub fn object<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Map<String, Value>, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::Object(map) => map,
            _ => Map::new(),
        })
    }

    /// Keeps the elements that decode and drops the rest.
    pub fn list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned,
    {
        let Value::Array(items) = Value::deserialize(deserializer)? else {
            return Ok(Vec::new());
        };
        Ok(items
            .into_iter()
            .filter_map(|item| match serde_json::from_value(item) {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::debug!(error = %e, "dropping malformed list element");
                    None
                }
            })
            .collect())
    }
}
