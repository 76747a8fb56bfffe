//! Parser definitions published in an external, paginated repository.
//!
//! The listing is walked page by page and names are ranked with the fuzzy
//! resolver. Walking stops at the first exact normalized hit, at the last
//! page, or after `max_pages` pages, whichever comes first.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::catalog::{canonical_id, declared_format_of};
use crate::error::Result;
use crate::fuzzy;
use crate::model::{ParserArtifact, SourceKind};

/// One parser in the listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    pub config_url: String,
}

/// One page of the listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListingPage {
    #[serde(default)]
    pub items: Vec<RemoteEntry>,
    #[serde(default)]
    pub next_page: Option<u32>,
}

/// Access to a paginated parser listing.
#[async_trait]
pub trait ParserListing: Send + Sync {
    /// Fetch page `page` (1-based).
    async fn list_page(&self, page: u32) -> Result<ListingPage>;

    /// Download the configuration document an entry points at.
    async fn fetch_config(&self, entry: &RemoteEntry) -> Result<String>;
}

/// A ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub entry: RemoteEntry,
    pub similarity: f64,
    pub exact_normalized: bool,
}

pub struct RemoteRepository {
    listing: Arc<dyn ParserListing>,
    max_pages: u32,
    min_similarity: f64,
}

impl RemoteRepository {
    pub fn new(listing: Arc<dyn ParserListing>, max_pages: u32, min_similarity: f64) -> Self {
        Self {
            listing,
            max_pages: max_pages.max(1),
            min_similarity,
        }
    }

    /// Repository served over HTTP at `base_url`.
    #[cfg(feature = "http")]
    pub fn http(
        base_url: &str,
        token: Option<&str>,
        timeout: std::time::Duration,
        max_pages: u32,
        min_similarity: f64,
    ) -> Result<Self> {
        let listing = HttpListing::new(base_url, token, timeout)?;
        Ok(Self::new(Arc::new(listing), max_pages, min_similarity))
    }

    pub async fn list_page(&self, page: u32) -> Result<ListingPage> {
        self.listing.list_page(page).await
    }

    /// Rank listed parsers against `name`, best first. Only exact normalized
    /// hits and candidates at least `min_similarity` similar are returned.
    pub async fn search(&self, name: &str) -> Result<Vec<SearchHit>> {
        let mut entries: Vec<RemoteEntry> = Vec::new();
        let mut page = 1;
        let mut walked = 0;

        loop {
            let listing = self.listing.list_page(page).await?;
            walked += 1;
            let target = fuzzy::normalize(name);
            let exact = listing.items.iter().any(|e| fuzzy::normalize(&e.name) == target);
            for entry in listing.items {
                if !entries.contains(&entry) {
                    entries.push(entry);
                }
            }
            tracing::debug!(page, entries = entries.len(), exact, "listing page read");

            if exact || walked >= self.max_pages {
                break;
            }
            match listing.next_page {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }

        // Rank each name once, then list every entry published under it.
        let mut names: Vec<&str> = Vec::new();
        for entry in &entries {
            if !names.contains(&entry.name.as_str()) {
                names.push(&entry.name);
            }
        }
        let mut hits = Vec::new();
        for m in fuzzy::resolve(name, &names) {
            if !(m.exact_normalized || m.similarity >= self.min_similarity) {
                continue;
            }
            for entry in entries.iter().filter(|e| e.name == m.candidate) {
                hits.push(SearchHit {
                    entry: entry.clone(),
                    similarity: m.similarity,
                    exact_normalized: m.exact_normalized,
                });
            }
        }
        Ok(hits)
    }

    /// Download an entry's configuration as a parser artifact.
    pub async fn fetch(&self, entry: &RemoteEntry) -> Result<ParserArtifact> {
        let raw = self.listing.fetch_config(entry).await?;
        let artifact = ParserArtifact {
            id: canonical_id(&entry.name, "_parser"),
            source_kind: SourceKind::Remote,
            declared_format: declared_format_of(Some(&raw)),
            location: entry.config_url.clone(),
            raw_config: Some(raw),
        };
        tracing::info!(parser = %artifact.id, location = %artifact.location, "remote parser fetched");
        Ok(artifact)
    }
}

#[cfg(feature = "http")]
pub use self::http::HttpListing;

#[cfg(feature = "http")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{ListingPage, ParserListing, RemoteEntry};
    use crate::error::{Error, Result};

    /// Listing served as `GET {base}/parsers?page=N`.
    #[derive(Debug, Clone)]
    pub struct HttpListing {
        client: reqwest::Client,
        base_url: String,
        token: Option<String>,
    }

    impl HttpListing {
        pub fn new(base_url: &str, token: Option<&str>, timeout: Duration) -> Result<Self> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| Error::Http(format!("building client: {e}")))?;
            Ok(Self {
                client,
                base_url: base_url.trim_end_matches('/').to_string(),
                token: token.filter(|t| !t.is_empty()).map(str::to_string),
            })
        }

        async fn get(&self, url: &str) -> Result<String> {
            let mut request = self.client.get(url);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| Error::Http(format!("GET {url}: {e}")))?;
            if !response.status().is_success() {
                return Err(Error::Http(format!("GET {url} returned {}", response.status())));
            }
            response
                .text()
                .await
                .map_err(|e| Error::Http(format!("reading response body: {e}")))
        }
    }

    #[async_trait]
    impl ParserListing for HttpListing {
        async fn list_page(&self, page: u32) -> Result<ListingPage> {
            let body = self.get(&format!("{}/parsers?page={page}", self.base_url)).await?;
            Ok(serde_json::from_str(&body)?)
        }

        async fn fetch_config(&self, entry: &RemoteEntry) -> Result<String> {
            self.get(&entry.config_url).await
        }
    }
}
