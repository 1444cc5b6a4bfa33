use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

use crate::server::oci::reference::normalize_registry;
use crate::server::transform::models::DynamicConfig;

const PAGE_SIZE: usize = 100;

/// Upper bound on pages fetched from one list endpoint
const MAX_PAGES: usize = 50;

/// Source of proxy mappings for the dynamic transformer
#[async_trait]
pub trait ProxyResolver: Send + Sync {
    /// Fetch the full mapping set
    ///
    /// # Returns
    /// Map from source registry host (e.g., "docker.io") to the proxy name
    /// images from that host should be pulled through
    /// (e.g., "harbor.example.com/proxy-dockerhub")
    async fn fetch_mappings(&self) -> Result<HashMap<String, String>>;
}

/// Harbor registry endpoint as returned by `GET /api/v2.0/registries`
#[derive(Debug, Clone, Deserialize)]
pub struct HarborRegistry {
    pub id: i64,
    pub url: String,
}

/// Harbor project as returned by `GET /api/v2.0/projects`
///
/// Proxy-cache projects reference the upstream registry through `registry_id`.
#[derive(Debug, Clone, Deserialize)]
pub struct HarborProject {
    pub name: String,
    #[serde(default)]
    pub registry_id: Option<i64>,
}

/// Harbor API client that discovers proxy-cache projects
pub struct HarborClient {
    http_client: reqwest::Client,
    api_url: String,
    harbor_host: String,
    credentials: Option<(String, String)>,
}

impl HarborClient {
    /// Create a new Harbor client
    ///
    /// Every API request is bounded by the configured timeout.
    pub fn new(config: &DynamicConfig) -> Result<Self> {
        let harbor_host = harbor_host(&config.endpoint)?;
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout().max(Duration::from_secs(1)))
            .build()
            .context("Failed to build Harbor HTTP client")?;

        let credentials = match (&config.username, &config.password) {
            (Some(username), password) => {
                Some((username.clone(), password.clone().unwrap_or_default()))
            }
            _ => None,
        };

        Ok(Self {
            http_client,
            api_url: format!("{}/api/v2.0", config.endpoint.trim_end_matches('/')),
            harbor_host,
            credentials,
        })
    }

    /// Fetch every page of a Harbor list endpoint
    async fn list_all<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let url = format!("{}/{}", self.api_url, path);
        let mut items = Vec::new();
        let mut page = 1;

        loop {
            let mut request = self.http_client.get(&url).query(&[
                ("page", page.to_string()),
                ("page_size", PAGE_SIZE.to_string()),
            ]);
            if let Some((username, password)) = &self.credentials {
                request = request.basic_auth(username, Some(password));
            }

            let batch: Vec<T> = request
                .send()
                .await
                .with_context(|| format!("Failed to query Harbor {}", url))?
                .error_for_status()
                .with_context(|| format!("Harbor rejected request to {}", url))?
                .json()
                .await
                .with_context(|| format!("Failed to parse Harbor response from {}", url))?;

            let done = batch.len() < PAGE_SIZE;
            items.extend(batch);
            if done {
                break;
            }
            if page >= MAX_PAGES {
                bail!(
                    "Harbor {} returned more than {} pages of {} items",
                    url,
                    MAX_PAGES,
                    PAGE_SIZE
                );
            }
            page += 1;
        }

        Ok(items)
    }
}

#[async_trait]
impl ProxyResolver for HarborClient {
    async fn fetch_mappings(&self) -> Result<HashMap<String, String>> {
        let registries: Vec<HarborRegistry> = self.list_all("registries").await?;
        let projects: Vec<HarborProject> = self.list_all("projects").await?;

        let mappings = build_mappings(&self.harbor_host, &registries, projects);
        tracing::debug!(
            "Discovered {} proxy-cache mappings from {} Harbor projects",
            mappings.len(),
            self.harbor_host
        );
        Ok(mappings)
    }
}

/// Extract `host[:port]` from the Harbor endpoint URL
pub fn harbor_host(endpoint: &str) -> Result<String> {
    let parsed =
        Url::parse(endpoint).with_context(|| format!("Invalid Harbor endpoint URL: {}", endpoint))?;

    host_with_port(&parsed)
        .ok_or_else(|| anyhow::anyhow!("Harbor endpoint URL missing host: {}", endpoint))
}

/// `host[:port]` of a URL; default ports for the scheme are omitted
fn host_with_port(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Build the source host to proxy name mapping from Harbor projects
///
/// When several proxy-cache projects front the same upstream, the
/// alphabetically first project name is used.
pub fn build_mappings(
    harbor_host: &str,
    registries: &[HarborRegistry],
    mut projects: Vec<HarborProject>,
) -> HashMap<String, String> {
    let upstreams: HashMap<i64, String> = registries
        .iter()
        .filter_map(|registry| match upstream_host(&registry.url) {
            Some(host) => Some((registry.id, host)),
            None => {
                tracing::warn!(
                    "Ignoring Harbor registry {} with unusable URL {:?}",
                    registry.id,
                    registry.url
                );
                None
            }
        })
        .collect();

    projects.sort_by(|a, b| a.name.cmp(&b.name));

    let mut mappings = HashMap::new();
    for project in projects {
        let Some(registry_id) = project.registry_id.filter(|id| *id > 0) else {
            continue;
        };
        let Some(upstream) = upstreams.get(&registry_id) else {
            tracing::warn!(
                "Harbor project {} references unknown registry {}",
                project.name,
                registry_id
            );
            continue;
        };
        mappings
            .entry(upstream.clone())
            .or_insert_with(|| format!("{}/{}", harbor_host, project.name));
    }
    mappings
}

/// Registry host from a Harbor registry URL, with Docker Hub aliases folded
///
/// URLs without a scheme are read as `https`.
fn upstream_host(raw: &str) -> Option<String> {
    let parsed = match Url::parse(raw) {
        Ok(url) if url.has_host() => url,
        _ => Url::parse(&format!("https://{}", raw)).ok()?,
    };
    let host = host_with_port(&parsed)?;
    Some(normalize_registry(&host).to_string())
}
