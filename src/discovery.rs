//! Server discovery from registries (`GET /v0/servers`).

use std::collections::BTreeSet;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::models::{ServerDetail, ServerList, ServerResponse};
use crate::settings::Settings;
use crate::validation::{self, official_id};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Failed to create HTTP client: {0}")]
    HttpClient(reqwest::Error),
    #[error("Failed to fetch {url}: {source}")]
    Request { url: String, source: reqwest::Error },
    #[error("Registry {url} returned {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("Invalid response from {url}: {source}")]
    Decode { url: String, source: reqwest::Error },
    #[error("MCP server with id {0} not found")]
    ServerNotFound(String),
    #[error("MCP server with id {server_id} not found; unreachable registries: {}", failed_registries(.failures))]
    Unavailable {
        server_id: String,
        failures: Vec<DiscoveryError>,
    },
}

fn failed_registries(failures: &[DiscoveryError]) -> String {
    failures
        .iter()
        .map(|e| e.registry().unwrap_or("unknown"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl DiscoveryError {
    /// Registry the error came from, if any.
    pub fn registry(&self) -> Option<&str> {
        match self {
            DiscoveryError::Request { url, .. }
            | DiscoveryError::Status { url, .. }
            | DiscoveryError::Decode { url, .. } => Some(url),
            DiscoveryError::Unavailable { failures, .. } => failures.first().and_then(DiscoveryError::registry),
            DiscoveryError::HttpClient(_) | DiscoveryError::ServerNotFound(_) => None,
        }
    }
}

/// Source of server details, keyed by registry URL.
#[async_trait]
pub trait ServerLookup: Send + Sync {
    /// Every server a registry lists, with derived ids.
    async fn list_registry(&self, registry_url: &str) -> Result<Vec<ServerDetail>, DiscoveryError>;

    /// Query every registry concurrently. One registry failing does not
    /// affect the others; failures are returned next to the servers found.
    async fn list_all_servers(&self, registry_urls: &[String]) -> (Vec<ServerDetail>, Vec<DiscoveryError>) {
        let results = join_all(registry_urls.iter().map(|url| self.list_registry(url))).await;

        let mut servers = Vec::new();
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(found) => servers.extend(found),
                Err(e) => {
                    tracing::warn!(error = %e, "registry discovery failed");
                    errors.push(e);
                }
            }
        }
        (servers, errors)
    }

    /// Find a server by id across registries.
    ///
    /// When the id is missing and some registry could not be queried, the
    /// failures are returned instead of a plain not-found.
    async fn find_server(&self, registry_urls: &[String], server_id: &str) -> Result<ServerDetail, DiscoveryError> {
        let (servers, errors) = self.list_all_servers(registry_urls).await;
        if let Some(server) = servers.into_iter().find(|s| s.id == server_id) {
            return Ok(server);
        }
        if errors.is_empty() {
            Err(DiscoveryError::ServerNotFound(server_id.to_string()))
        } else {
            Err(DiscoveryError::Unavailable {
                server_id: server_id.to_string(),
                failures: errors,
            })
        }
    }
}

pub struct DiscoveryClient {
    client: reqwest::Client,
    page_limit: Option<u32>,
    max_pages: usize,
}

impl DiscoveryClient {
    pub fn new(settings: &Settings) -> Result<Self, DiscoveryError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("mcpreg/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(settings.connect_timeout())
            .timeout(settings.discovery_timeout())
            .build()
            .map_err(DiscoveryError::HttpClient)?;
        Ok(Self {
            client,
            page_limit: settings.page_limit,
            max_pages: settings.max_pages.max(1),
        })
    }

    /// List a registry starting at `cursor`, following next-page cursors.
    ///
    /// Pages are concatenated in order; the returned metadata is the last page's.
    pub async fn list_servers(&self, registry_url: &str, cursor: Option<&str>) -> Result<ServerList, DiscoveryError> {
        self.fetch_all(registry_url, cursor).await.map(|(list, _)| list)
    }

    /// Like [`list_servers`](Self::list_servers), but as server details with
    /// ids and schema validity filled in.
    pub async fn list_details(
        &self,
        registry_url: &str,
        cursor: Option<&str>,
    ) -> Result<Vec<ServerDetail>, DiscoveryError> {
        let (list, invalid) = self.fetch_all(registry_url, cursor).await?;
        Ok(into_details(registry_url, list, &invalid))
    }

    /// Fetch exactly one page.
    pub async fn fetch_page(&self, registry_url: &str, cursor: Option<&str>) -> Result<ServerList, DiscoveryError> {
        self.fetch_one(registry_url, cursor).await.map(|(list, _)| list)
    }

    async fn fetch_all(
        &self,
        registry_url: &str,
        cursor: Option<&str>,
    ) -> Result<(ServerList, BTreeSet<String>), DiscoveryError> {
        let (mut merged, mut invalid) = self.fetch_one(registry_url, cursor).await?;
        let mut seen: BTreeSet<String> = cursor.map(String::from).into_iter().collect();
        let mut pages = 1;

        while let Some(next) = merged.next_cursor().map(String::from) {
            if !seen.insert(next.clone()) {
                tracing::warn!(registry = %registry_url, cursor = %next, "registry repeated a cursor, stopping");
                break;
            }
            if pages >= self.max_pages {
                tracing::warn!(registry = %registry_url, pages, "page limit reached, stopping");
                break;
            }
            let (page, page_invalid) = self.fetch_one(registry_url, Some(&next)).await?;
            merged.servers.extend(page.servers);
            merged.metadata = page.metadata;
            invalid.extend(page_invalid);
            pages += 1;
        }

        tracing::debug!(registry = %registry_url, pages, servers = merged.servers.len(), "listed registry");
        Ok((merged, invalid))
    }

    async fn fetch_one(
        &self,
        registry_url: &str,
        cursor: Option<&str>,
    ) -> Result<(ServerList, BTreeSet<String>), DiscoveryError> {
        let endpoint = format!("{}/v0/servers", registry_url.trim_end_matches('/'));
        let mut query: Vec<(&str, String)> = vec![("version", "latest".to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        if let Some(limit) = self.page_limit {
            query.push(("limit", limit.to_string()));
        }

        let response = self
            .client
            .get(&endpoint)
            .query(&query)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|source| DiscoveryError::Request {
                url: registry_url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::Status {
                url: registry_url.to_string(),
                status,
            });
        }

        let body: Value = response.json().await.map_err(|source| DiscoveryError::Decode {
            url: registry_url.to_string(),
            source,
        })?;

        let report = validation::validate_server_list(&body);
        report.warn(Some(registry_url));

        let (list, skipped) = ServerList::from_value_lossy(body);
        if skipped > 0 {
            tracing::warn!(registry = %registry_url, skipped, "dropped undecodable listing entries");
        }
        Ok((list, report.invalid_server_names))
    }
}

#[async_trait]
impl ServerLookup for DiscoveryClient {
    async fn list_registry(&self, registry_url: &str) -> Result<Vec<ServerDetail>, DiscoveryError> {
        self.list_details(registry_url, None).await
    }
}

/// The registry's official id when present, else `sha256("<registry>::<name>")` in hex.
pub fn derive_server_id(registry_url: &str, response: &ServerResponse) -> String {
    if let Some(id) = official_id(&response.meta).or_else(|| official_id(&response.server.meta)) {
        return id.to_string();
    }
    let raw = format!("{}::{}", registry_url, response.server.name);
    format!("{:x}", Sha256::digest(raw.as_bytes()))
}

pub fn into_details(registry_url: &str, list: ServerList, invalid: &BTreeSet<String>) -> Vec<ServerDetail> {
    list.servers
        .into_iter()
        .map(|response| {
            let id = derive_server_id(registry_url, &response);
            let ServerResponse { server, meta } = response;
            let mut merged = server.meta;
            merged.extend(meta);
            ServerDetail {
                id,
                registry_url: registry_url.to_string(),
                valid_schema: !invalid.contains(&server.name),
                name: server.name,
                description: server.description,
                version: server.version,
                remotes: server.remotes,
                packages: server.packages,
                meta: merged,
            }
        })
        .collect()
}
