//! Scripted registry client for deterministic testing.
//!
//! ```ignore
//! let registry = MockRegistry::new()
//!     .with_record(record(1, "Animalia", Rank::Kingdom))
//!     .with_record(record(50, "Panthera", Rank::Genus).with_parent(1))
//!     .with_occurrences(50, rows);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::json;

use taxa_core::{
    Error, OccurrencePage, OccurrenceQuery, OccurrenceRow, Rank, RankKeys, RegistryClient,
    RegistryRecord, Result, TaxonomicStatus, VernacularName,
};

/// Accepted registry record whose scientific and canonical names are `name`.
pub fn record(key: i64, name: &str, rank: Rank) -> RegistryRecord {
    RegistryRecord {
        key,
        nub_key: None,
        accepted_key: None,
        parent_key: None,
        rank_keys: RankKeys::default(),
        scientific_name: name.to_string(),
        canonical_name: name.to_string(),
        authorship: None,
        taxonomic_status: TaxonomicStatus::Accepted,
        rank,
        raw: Some(json!({ "key": key, "canonicalName": name, "rank": rank.as_str() })),
    }
}

/// Builder helpers for scripted records.
pub trait RecordExt {
    fn with_parent(self, parent_key: i64) -> Self;
    fn with_nub(self, nub_key: i64) -> Self;
    fn synonym_of(self, accepted_key: i64) -> Self;
    fn with_author(self, author: &str) -> Self;
}

impl RecordExt for RegistryRecord {
    fn with_parent(mut self, parent_key: i64) -> Self {
        self.parent_key = Some(parent_key);
        self
    }

    fn with_nub(mut self, nub_key: i64) -> Self {
        self.nub_key = Some(nub_key);
        self
    }

    fn synonym_of(mut self, accepted_key: i64) -> Self {
        self.taxonomic_status = TaxonomicStatus::Synonym;
        self.accepted_key = Some(accepted_key);
        self
    }

    fn with_author(mut self, author: &str) -> Self {
        self.authorship = Some(author.to_string());
        self
    }
}

/// Occurrence row with an id and a point, nothing else.
pub fn occurrence_row(upstream_id: &str, longitude: f64, latitude: f64) -> OccurrenceRow {
    OccurrenceRow {
        upstream_id: Some(upstream_id.to_string()),
        longitude: Some(longitude),
        latitude: Some(latitude),
        raw: Some(json!({ "gbifID": upstream_id })),
        ..OccurrenceRow::default()
    }
}

/// One call made against the mock.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryCall {
    SearchByName(String),
    SuggestByName(String),
    GetByKey(i64),
    ListChildren(i64),
    VernacularNames(i64),
    SearchOccurrences(OccurrenceQuery),
}

#[derive(Debug, Clone, Default)]
struct RegistryScript {
    records: HashMap<i64, RegistryRecord>,
    name_matches: HashMap<String, i64>,
    suggestions: HashMap<String, i64>,
    vernacular_names: HashMap<i64, Vec<VernacularName>>,
    occurrences: HashMap<i64, Vec<OccurrenceRow>>,
    failing_keys: HashSet<i64>,
    failing_pages: HashSet<(i64, u32)>,
    offline: bool,
}

/// Registry client answering from a fixed script.
#[derive(Clone, Default)]
pub struct MockRegistry {
    script: Arc<RegistryScript>,
    call_log: Arc<Mutex<Vec<RegistryCall>>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve a record by key. Name searches also find it by canonical name
    /// unless an explicit match says otherwise.
    pub fn with_record(mut self, record: RegistryRecord) -> Self {
        Arc::make_mut(&mut self.script)
            .records
            .insert(record.key, record);
        self
    }

    /// Exact-match `name` to `key`.
    pub fn with_name_match(mut self, name: &str, key: i64) -> Self {
        Arc::make_mut(&mut self.script)
            .name_matches
            .insert(name.to_lowercase(), key);
        self
    }

    /// Fuzzy-match `name` to `key`; exact search for it finds nothing.
    pub fn with_suggestion(mut self, name: &str, key: i64) -> Self {
        Arc::make_mut(&mut self.script)
            .suggestions
            .insert(name.to_lowercase(), key);
        self
    }

    pub fn with_vernacular_names(mut self, key: i64, names: Vec<VernacularName>) -> Self {
        Arc::make_mut(&mut self.script)
            .vernacular_names
            .insert(key, names);
        self
    }

    /// Occurrences returned for a taxon key, paged by the query's offset and limit.
    pub fn with_occurrences(mut self, taxon_key: i64, rows: Vec<OccurrenceRow>) -> Self {
        Arc::make_mut(&mut self.script)
            .occurrences
            .insert(taxon_key, rows);
        self
    }

    /// `get_by_key(key)` fails with a transport error.
    pub fn with_failing_key(mut self, key: i64) -> Self {
        Arc::make_mut(&mut self.script).failing_keys.insert(key);
        self
    }

    /// The occurrence page at `offset` for `taxon_key` fails.
    pub fn with_failing_page(mut self, taxon_key: i64, offset: u32) -> Self {
        Arc::make_mut(&mut self.script)
            .failing_pages
            .insert((taxon_key, offset));
        self
    }

    /// Every call fails with a transport error.
    pub fn offline(mut self) -> Self {
        Arc::make_mut(&mut self.script).offline = true;
        self
    }

    fn log(&self) -> MutexGuard<'_, Vec<RegistryCall>> {
        self.call_log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_call(&self, call: RegistryCall) -> Result<()> {
        self.log().push(call);
        if self.script.offline {
            return Err(Error::Request("registry offline".to_string()));
        }
        Ok(())
    }

    /// Get all logged calls for assertion.
    pub fn calls(&self) -> Vec<RegistryCall> {
        self.log().clone()
    }

    /// Offsets of every occurrence page requested, in order.
    pub fn occurrence_offsets(&self) -> Vec<u32> {
        self.log()
            .iter()
            .filter_map(|call| match call {
                RegistryCall::SearchOccurrences(query) => Some(query.offset),
                _ => None,
            })
            .collect()
    }

    pub fn occurrence_queries(&self) -> Vec<OccurrenceQuery> {
        self.log()
            .iter()
            .filter_map(|call| match call {
                RegistryCall::SearchOccurrences(query) => Some(query.clone()),
                _ => None,
            })
            .collect()
    }

    fn lookup(&self, key: i64) -> Result<Option<RegistryRecord>> {
        if self.script.failing_keys.contains(&key) {
            return Err(Error::Request(format!("connection reset fetching {}", key)));
        }
        Ok(self.script.records.get(&key).cloned())
    }

    fn rank_filter(record: Option<RegistryRecord>, rank: Option<Rank>) -> Option<RegistryRecord> {
        record.filter(|r| rank.map_or(true, |wanted| r.rank == wanted))
    }
}

#[async_trait]
impl RegistryClient for MockRegistry {
    async fn search_by_name(
        &self,
        name: &str,
        rank: Option<Rank>,
    ) -> Result<Option<RegistryRecord>> {
        self.record_call(RegistryCall::SearchByName(name.to_string()))?;
        let needle = name.to_lowercase();
        if self.script.suggestions.contains_key(&needle) {
            return Ok(None);
        }
        if let Some(key) = self.script.name_matches.get(&needle) {
            return Ok(Self::rank_filter(self.lookup(*key)?, rank));
        }

        let mut matches: Vec<&RegistryRecord> = self
            .script
            .records
            .values()
            .filter(|r| r.canonical_name.to_lowercase() == needle)
            .filter(|r| rank.map_or(true, |wanted| r.rank == wanted))
            .collect();
        matches.sort_by_key(|r| r.key);
        Ok(matches.first().map(|r| (*r).clone()))
    }

    async fn suggest_by_name(
        &self,
        name: &str,
        rank: Option<Rank>,
    ) -> Result<Option<RegistryRecord>> {
        self.record_call(RegistryCall::SuggestByName(name.to_string()))?;
        match self.script.suggestions.get(&name.to_lowercase()) {
            Some(key) => Ok(Self::rank_filter(self.lookup(*key)?, rank)),
            None => Ok(None),
        }
    }

    async fn get_by_key(&self, key: i64) -> Result<Option<RegistryRecord>> {
        self.record_call(RegistryCall::GetByKey(key))?;
        self.lookup(key)
    }

    async fn list_children(&self, key: i64) -> Result<Vec<RegistryRecord>> {
        self.record_call(RegistryCall::ListChildren(key))?;
        let mut children: Vec<RegistryRecord> = self
            .script
            .records
            .values()
            .filter(|r| r.parent_key == Some(key))
            .cloned()
            .collect();
        children.sort_by_key(|r| r.key);
        Ok(children)
    }

    async fn get_vernacular_names(&self, key: i64) -> Result<Vec<VernacularName>> {
        self.record_call(RegistryCall::VernacularNames(key))?;
        Ok(self
            .script
            .vernacular_names
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    async fn search_occurrences(&self, query: &OccurrenceQuery) -> Result<OccurrencePage> {
        self.record_call(RegistryCall::SearchOccurrences(query.clone()))?;
        if self
            .script
            .failing_pages
            .contains(&(query.taxon_key, query.offset))
        {
            return Err(Error::Request(format!(
                "timed out fetching offset {}",
                query.offset
            )));
        }

        let rows = self
            .script
            .occurrences
            .get(&query.taxon_key)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let start = (query.offset as usize).min(rows.len());
        let end = (start + query.limit as usize).min(rows.len());

        Ok(OccurrencePage {
            offset: query.offset,
            limit: query.limit,
            total: rows.len() as u64,
            end_of_records: end >= rows.len(),
            results: rows[start..end].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_occurrence_pages_follow_offset_and_limit() {
        let rows = (0..5)
            .map(|i| occurrence_row(&i.to_string(), 30.0, -25.0))
            .collect();
        let registry = MockRegistry::new().with_occurrences(7, rows);

        let query = OccurrenceQuery {
            taxon_key: 7,
            offset: 4,
            limit: 2,
            country: None,
        };
        let page = registry.search_occurrences(&query).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.results.len(), 1);
        assert!(page.end_of_records);
        assert_eq!(registry.occurrence_offsets(), vec![4]);
    }

    #[tokio::test]
    async fn test_search_respects_rank() {
        let registry = MockRegistry::new().with_record(record(50, "Panthera", Rank::Genus));
        assert!(registry
            .search_by_name("panthera", Some(Rank::Genus))
            .await
            .unwrap()
            .is_some());
        assert!(registry
            .search_by_name("Panthera", Some(Rank::Species))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_offline_registry_fails_every_call() {
        let registry = MockRegistry::new()
            .with_record(record(1, "Animalia", Rank::Kingdom))
            .offline();
        assert!(registry.get_by_key(1).await.is_err());
        assert_eq!(registry.calls(), vec![RegistryCall::GetByKey(1)]);
    }
}
