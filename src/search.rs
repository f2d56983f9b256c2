//! # Catalogue Search Module
//!
//! Resolves candidates by querying a Solr-backed catalogue search service
//! instead of expanding a template. Each returned document lists access URLs as
//! `url|mime|service` triples; plain HTTP downloads are preferred over Globus
//! HTTPS links, and everything else is ignored.

use async_trait::async_trait;
use log::{info, warn};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

use crate::catalog::{CandidateRequest, Dimension, SEARCH_ORDER};
use crate::config::{DatasetSpec, SearchSettings};
use crate::error::{Classify, ErrorKind};
use crate::resolve::{ResolveResult, UrlResolver};

pub const DEFAULT_SEARCH_ENDPOINT: &str = "https://esgf-node.llnl.gov/esg-search/search/";

const HTTP_SERVICE: &str = "HTTPServer";
const GLOBUS_SERVICE: &str = "Globus";

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Search request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Search service returned HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("Unreadable search response: {0}")]
    InvalidResponse(#[from] serde_json::Error),
}

impl Classify for SearchError {
    fn kind(&self) -> ErrorKind {
        match self {
            SearchError::Request(_) | SearchError::Status(_) => ErrorKind::Transport,
            SearchError::InvalidResponse(_) => ErrorKind::Parse,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    pub response: SearchBody,
}

#[derive(Debug, Deserialize)]
pub struct SearchBody {
    #[serde(rename = "numFound")]
    pub num_found: u64,
    #[serde(default)]
    pub docs: Vec<SearchDoc>,
}

#[derive(Debug, Deserialize)]
pub struct SearchDoc {
    #[serde(default)]
    pub url: Vec<String>,
}

/// Which access service the selected URLs came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessService {
    Http,
    Globus,
}

/// Outcome of picking download URLs out of search documents.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UrlSelection {
    pub urls: Vec<String>,
    pub service: Option<AccessService>,
    /// Every service name seen, for diagnostics when nothing matched
    pub services_seen: BTreeSet<String>,
    pub malformed_entries: usize,
}

/// Picks download URLs from search documents.
///
/// HTTPServer entries ending in `extension` win. Globus entries that are
/// `https` links ending in `extension` are used only when no HTTPServer entry
/// qualifies. Entries that do not split into exactly three `|` separated parts
/// are counted and skipped.
pub fn select_download_urls(docs: &[SearchDoc], extension: &str) -> UrlSelection {
    let mut selection = UrlSelection::default();
    let mut http = Vec::new();
    let mut globus = Vec::new();

    for entry in docs.iter().flat_map(|d| d.url.iter()) {
        let parts: Vec<&str> = entry.split('|').collect();
        let [url, _mime, service] = parts.as_slice() else {
            warn!("Could not parse URL entry: {entry}");
            selection.malformed_entries += 1;
            continue;
        };
        selection.services_seen.insert(service.to_string());
        if *service == HTTP_SERVICE && url.ends_with(extension) {
            http.push(url.to_string());
        } else if *service == GLOBUS_SERVICE && url.starts_with("https") && url.ends_with(extension) {
            globus.push(url.to_string());
        }
    }

    if !http.is_empty() {
        selection.urls = http;
        selection.service = Some(AccessService::Http);
    } else if !globus.is_empty() {
        selection.urls = globus;
        selection.service = Some(AccessService::Globus);
    }
    selection
}

/// Resolver backed by the catalogue search service.
pub struct SearchResolver {
    client: reqwest::Client,
    settings: SearchSettings,
}

impl SearchResolver {
    pub fn new(settings: SearchSettings) -> Result<Self, SearchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self { client, settings })
    }

    /// Queries the service for one (model, experiment, variable, member) tuple.
    pub async fn find_download_urls(
        &self,
        model: &str,
        experiment: &str,
        variable: &str,
        member: Option<&str>,
    ) -> Result<Vec<String>, SearchError> {
        let label = format!("{variable} ({})", member.unwrap_or("any member"));
        info!("Searching for URLs for: {label}");

        let limit = self.settings.limit.to_string();
        let mut params: Vec<(&str, &str)> = vec![
            ("source_id", model),
            ("experiment_id", experiment),
            ("variable_id", variable),
            ("distrib", "true"),
            ("format", "application/solr+json"),
            ("limit", limit.as_str()),
        ];
        if let Some(member) = member {
            params.push(("member_id", member));
        }

        let response = self
            .client
            .get(&self.settings.endpoint)
            .query(&params)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Status(status));
        }
        let body = response.bytes().await?;
        let parsed: SearchResponse = serde_json::from_slice(&body)?;

        if parsed.response.num_found == 0 {
            warn!("No files found via API search for {label}. It may not be available.");
            return Ok(Vec::new());
        }

        let selection = select_download_urls(&parsed.response.docs, &self.settings.file_extension);
        match selection.service {
            Some(AccessService::Http) => {
                info!("Found {} HTTPServer URLs for {label}.", selection.urls.len());
            }
            Some(AccessService::Globus) => {
                info!("Found {} Globus HTTPS URLs for {label}. Using these.", selection.urls.len());
            }
            None => {
                warn!(
                    "Found dataset for {label}, but no compatible download URL was found. Available services: {:?}",
                    selection.services_seen
                );
            }
        }
        Ok(selection.urls)
    }
}

#[async_trait]
impl UrlResolver for SearchResolver {
    fn order(&self) -> &'static [Dimension] {
        SEARCH_ORDER
    }

    async fn resolve(&self, candidate: &CandidateRequest, _dataset: &DatasetSpec) -> ResolveResult<Vec<String>> {
        Ok(self
            .find_download_urls(
                &candidate.model,
                &candidate.experiment,
                &candidate.variable,
                candidate.member.as_deref(),
            )
            .await?)
    }
}
