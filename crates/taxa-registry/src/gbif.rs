//! GBIF species and occurrence API client.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};

use taxa_core::{
    Error, OccurrencePage, OccurrenceQuery, Rank, RegistryClient, RegistryRecord, Result,
    VernacularName,
};

use crate::config::RegistryConfig;
use crate::types::{
    decode_occurrence_page, NameMatch, NameSuggestion, NameUsage, PagingResponse,
    VernacularNameWire,
};

/// Upper bound on children pages fetched for one parent.
const MAX_CHILDREN_PAGES: u32 = 100;

/// Vernacular names fetched in one request.
const VERNACULAR_LIMIT: u32 = 1_000;

/// HTTP client for the GBIF API.
#[derive(Clone)]
pub struct GbifClient {
    client: Client,
    config: RegistryConfig,
}

impl GbifClient {
    /// Create a client with the given configuration.
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        info!(
            subsystem = "registry",
            component = "gbif",
            base_url = %config.base_url,
            timeout_secs = config.timeout_secs,
            "Initializing GBIF registry client"
        );

        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(RegistryConfig::from_env())
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// GET a JSON document. `Ok(None)` on 404.
    async fn get_json(
        &self,
        op: &'static str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<JsonValue>> {
        let start = Instant::now();
        let url = format!("{}{}", self.config.base_url, path);

        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| Error::Request(format!("{} request failed: {}", op, e)))?;

        let status = response.status();
        let elapsed = start.elapsed().as_millis() as u64;
        if elapsed > self.config.slow_threshold_ms {
            warn!(
                subsystem = "registry",
                component = "gbif",
                op,
                duration_ms = elapsed,
                slow = true,
                "Slow registry request"
            );
        }

        if status == StatusCode::NOT_FOUND {
            debug!(subsystem = "registry", component = "gbif", op, path, "Registry returned 404");
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Registry(format!(
                "{} returned {}: {}",
                op, status, body
            )));
        }

        let value: JsonValue = response
            .json()
            .await
            .map_err(|e| Error::Registry(format!("{}: failed to parse response: {}", op, e)))?;

        debug!(
            subsystem = "registry",
            component = "gbif",
            op,
            duration_ms = elapsed,
            "Registry request complete"
        );
        Ok(Some(value))
    }

    fn decode<T: DeserializeOwned>(op: &str, value: JsonValue) -> Result<T> {
        serde_json::from_value(value)
            .map_err(|e| Error::Registry(format!("{}: malformed payload: {}", op, e)))
    }

    fn rank_query(name: &str, rank: Option<Rank>, name_param: &'static str) -> Vec<(&'static str, String)> {
        let mut query = vec![(name_param, name.to_string())];
        if let Some(rank) = rank {
            query.push(("rank", rank.as_str().to_string()));
        }
        query
    }
}

#[async_trait]
impl RegistryClient for GbifClient {
    #[instrument(skip(self), fields(subsystem = "registry", component = "gbif", op = "search_by_name"))]
    async fn search_by_name(
        &self,
        name: &str,
        rank: Option<Rank>,
    ) -> Result<Option<RegistryRecord>> {
        let mut query = Self::rank_query(name, rank, "name");
        query.push(("strict", "true".to_string()));

        let Some(value) = self.get_json("search_by_name", "/species/match", &query).await? else {
            return Ok(None);
        };
        let matched: NameMatch = Self::decode("search_by_name", value)?;

        let Some(key) = matched.matched_key() else {
            debug!(name, "No registry match");
            return Ok(None);
        };
        if let (Some(wanted), Some(found)) = (rank, matched.rank()) {
            if wanted != found {
                debug!(name, wanted = %wanted, found = %found, "Match at a different rank ignored");
                return Ok(None);
            }
        }
        self.get_by_key(key).await
    }

    #[instrument(skip(self), fields(subsystem = "registry", component = "gbif", op = "suggest_by_name"))]
    async fn suggest_by_name(
        &self,
        name: &str,
        rank: Option<Rank>,
    ) -> Result<Option<RegistryRecord>> {
        let mut query = Self::rank_query(name, rank, "q");
        query.push(("limit", "10".to_string()));

        let Some(value) = self.get_json("suggest_by_name", "/species/suggest", &query).await? else {
            return Ok(None);
        };
        let suggestions: Vec<NameSuggestion> = Self::decode("suggest_by_name", value)?;

        let best = suggestions
            .into_iter()
            .filter(|s| rank.is_none() || s.rank() == rank)
            .find_map(|s| s.key);

        match best {
            Some(key) => self.get_by_key(key).await,
            None => Ok(None),
        }
    }

    async fn get_by_key(&self, key: i64) -> Result<Option<RegistryRecord>> {
        let Some(value) = self
            .get_json("get_by_key", &format!("/species/{}", key), &[])
            .await?
        else {
            return Ok(None);
        };
        let usage: NameUsage = Self::decode("get_by_key", value.clone())?;
        usage.into_record(value).map(Some)
    }

    #[instrument(skip(self), fields(subsystem = "registry", component = "gbif", op = "list_children"))]
    async fn list_children(&self, key: i64) -> Result<Vec<RegistryRecord>> {
        let limit = self.config.children_limit;
        let path = format!("/species/{}/children", key);
        let mut children = Vec::new();
        let mut offset = 0u32;

        for _ in 0..MAX_CHILDREN_PAGES {
            let query = [("offset", offset.to_string()), ("limit", limit.to_string())];
            let Some(value) = self.get_json("list_children", &path, &query).await? else {
                break;
            };
            let page: PagingResponse<JsonValue> = Self::decode("list_children", value)?;
            let fetched = page.results.len();

            for raw in page.results {
                let converted = serde_json::from_value::<NameUsage>(raw.clone())
                    .map_err(Error::from)
                    .and_then(|usage| usage.into_record(raw));
                match converted {
                    Ok(record) => children.push(record),
                    Err(e) => debug!(parent_key = key, error = %e, "Skipping malformed child"),
                }
            }

            if page.end_of_records || fetched == 0 {
                break;
            }
            offset += limit;
        }

        debug!(parent_key = key, result_count = children.len(), "Children listed");
        Ok(children)
    }

    async fn get_vernacular_names(&self, key: i64) -> Result<Vec<VernacularName>> {
        let query = [("limit", VERNACULAR_LIMIT.to_string())];
        let Some(value) = self
            .get_json(
                "get_vernacular_names",
                &format!("/species/{}/vernacularNames", key),
                &query,
            )
            .await?
        else {
            return Ok(Vec::new());
        };
        let page: PagingResponse<VernacularNameWire> =
            Self::decode("get_vernacular_names", value)?;
        Ok(page
            .results
            .into_iter()
            .filter_map(VernacularNameWire::into_vernacular)
            .collect())
    }

    #[instrument(skip(self, query), fields(subsystem = "registry", component = "gbif", op = "search_occurrences", taxon_key = query.taxon_key, offset = query.offset))]
    async fn search_occurrences(&self, query: &OccurrenceQuery) -> Result<OccurrencePage> {
        let mut params = vec![
            ("taxonKey", query.taxon_key.to_string()),
            ("offset", query.offset.to_string()),
            ("limit", query.limit.to_string()),
            ("hasCoordinate", "true".to_string()),
            ("hasGeospatialIssue", "false".to_string()),
        ];
        if let Some(country) = &query.country {
            params.push(("country", country.clone()));
        }

        let value = self
            .get_json("search_occurrences", "/occurrence/search", &params)
            .await?
            .ok_or_else(|| Error::Registry("occurrence search endpoint not found".to_string()))?;

        let page = decode_occurrence_page(value)?;
        debug!(
            result_count = page.results.len(),
            total = page.total,
            "Occurrence page fetched"
        );
        Ok(page)
    }
}
