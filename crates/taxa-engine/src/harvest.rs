//! Occurrence harvesting.
//!
//! Pages through the archive's occurrences for one taxon, anchors each row
//! to a site (reusing any site within the row's coordinate uncertainty) and
//! upserts it by upstream id. Runs are sequential and cooperatively
//! cancellable; committed records stay committed.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use taxa_core::defaults::SITE_PLACEHOLDER_NAME;
use taxa_core::{
    CancellationSignal, HarvestOutcome, HarvestStatus, LocationType, NewSite, OccurrenceQuery,
    OccurrenceRepository, OccurrenceRow, OccurrenceUnitOfWork, OccurrenceUpsert, OriginCategory,
    RegistryClient, Result, SiteRepository, TaxonNode, WriteContext,
};

use crate::config::HarvestConfig;

/// One harvest run.
#[derive(Debug, Clone)]
pub struct HarvestRequest {
    pub taxon: TaxonNode,
    /// Offset of the first page.
    pub offset_start: u32,
    /// Owner stamped on records; the configured default when absent.
    pub owner: Option<String>,
    pub habitat: Option<String>,
    /// Origin applied to every record, overriding the row's establishment means.
    pub origin_hint: Option<String>,
    /// Identifies the run for cancellation and provenance.
    pub run_id: Uuid,
}

impl HarvestRequest {
    pub fn new(taxon: TaxonNode) -> Self {
        Self {
            taxon,
            offset_start: 0,
            owner: None,
            habitat: None,
            origin_hint: None,
            run_id: Uuid::now_v7(),
        }
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset_start = offset;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_habitat(mut self, habitat: impl Into<String>) -> Self {
        self.habitat = Some(habitat.into());
        self
    }

    pub fn with_origin_hint(mut self, origin: impl Into<String>) -> Self {
        self.origin_hint = Some(origin.into());
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }
}

/// What an upsert did.
enum UpsertAction {
    Created,
    Updated { previous_site: i64, duplicated: bool },
    SkippedDuplicate,
}

/// Harvests occurrences into sites and occurrence records.
#[derive(Clone)]
pub struct HarvestPipeline {
    registry: Arc<dyn RegistryClient>,
    sites: Arc<dyn SiteRepository>,
    occurrences: Arc<dyn OccurrenceRepository>,
    config: HarvestConfig,
}

impl HarvestPipeline {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        sites: Arc<dyn SiteRepository>,
        occurrences: Arc<dyn OccurrenceRepository>,
        config: HarvestConfig,
    ) -> Self {
        Self {
            registry,
            sites,
            occurrences,
            config,
        }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    /// Run one harvest to completion, cancellation or failure.
    ///
    /// Cancellation is polled before every page and every record. Site
    /// summaries of every touched site are refreshed once at the end,
    /// whatever the outcome.
    #[instrument(
        skip(self, request, cancellation),
        fields(
            subsystem = "engine",
            component = "harvest",
            op = "harvest",
            run_id = %request.run_id,
            taxon_id = request.taxon.id,
            external_key = request.taxon.external_key
        )
    )]
    pub async fn harvest(
        &self,
        request: &HarvestRequest,
        cancellation: &dyn CancellationSignal,
    ) -> HarvestOutcome {
        let start = Instant::now();
        let Some(taxon_key) = request.taxon.external_key else {
            info!("Taxon has no registry key, skipping harvest");
            return HarvestOutcome::new(HarvestStatus::Skipped);
        };

        let mut outcome = HarvestOutcome::new(HarvestStatus::Completed);
        let mut touched_sites = BTreeSet::new();
        let page_size = self.config.page_size.max(1);
        let mut offset = request.offset_start;

        let status = 'pages: loop {
            if outcome.pages_fetched >= self.config.max_pages {
                debug!(pages = outcome.pages_fetched, "Page cap reached");
                break HarvestStatus::Completed;
            }
            if cancellation.is_cancelled(request.run_id).await {
                break HarvestStatus::Cancelled;
            }

            let query = OccurrenceQuery {
                taxon_key,
                offset,
                limit: page_size,
                country: self.config.country.clone(),
            };
            let page = match self.registry.search_occurrences(&query).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(offset, error = %e, "Occurrence page fetch failed");
                    break HarvestStatus::Failed(e.to_string());
                }
            };
            outcome.pages_fetched += 1;
            debug!(offset, result_count = page.results.len(), total = page.total, "Page fetched");

            for row in &page.results {
                if cancellation.is_cancelled(request.run_id).await {
                    break 'pages HarvestStatus::Cancelled;
                }
                outcome.records_seen += 1;
                if let Err(e) = self
                    .harvest_row(request, row, &mut touched_sites, &mut outcome)
                    .await
                {
                    warn!(upstream_id = row.upstream_id.as_deref(), error = %e, "Occurrence write failed");
                    break 'pages HarvestStatus::Failed(e.to_string());
                }
            }

            let next = u64::from(offset) + u64::from(page_size);
            if page.results.is_empty() || page.total <= next {
                break HarvestStatus::Completed;
            }
            match u32::try_from(next) {
                Ok(next) => offset = next,
                Err(_) => break HarvestStatus::Completed,
            }
        };

        if !touched_sites.is_empty() {
            let site_ids: Vec<i64> = touched_sites.into_iter().collect();
            if let Err(e) = self.sites.refresh_summaries(&site_ids).await {
                warn!(result_count = site_ids.len(), error = %e, "Site summary refresh failed");
            }
        }

        outcome.status = status;
        info!(
            status = ?outcome.status,
            pages = outcome.pages_fetched,
            created = outcome.records_created,
            updated = outcome.records_updated,
            skipped = outcome.records_skipped,
            sites_created = outcome.sites_created,
            duplicates = outcome.duplicate_upstream_ids,
            duration_ms = start.elapsed().as_millis() as u64,
            "Harvest finished"
        );
        outcome
    }

    async fn harvest_row(
        &self,
        request: &HarvestRequest,
        row: &OccurrenceRow,
        touched_sites: &mut BTreeSet<i64>,
        outcome: &mut HarvestOutcome,
    ) -> Result<()> {
        let Some(upstream_id) = row
            .upstream_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        else {
            debug!("Skipping occurrence without upstream id");
            outcome.records_skipped += 1;
            return Ok(());
        };
        let Some(point) = row.point() else {
            debug!(upstream_id, "Skipping occurrence without usable coordinates");
            outcome.records_skipped += 1;
            return Ok(());
        };

        // Decide the skip before a site exists, or the new site is orphaned.
        if self.config.fail_on_duplicate_upstream_id {
            let existing = self
                .occurrences
                .find_by_upstream_id(&self.config.source, upstream_id)
                .await?;
            if existing.len() > 1 {
                warn!(
                    upstream_id,
                    result_count = existing.len(),
                    "Upstream id held by several records, skipped"
                );
                outcome.duplicate_upstream_ids += 1;
                outcome.records_skipped += 1;
                return Ok(());
            }
        }

        let radius_m = row
            .coordinate_uncertainty_m
            .filter(|r| r.is_finite() && *r >= 0.0)
            .unwrap_or(0.0);
        let site = match self.sites.find_within(point, radius_m).await? {
            Some(site) => site,
            None => {
                let name = row.locality_name().unwrap_or(SITE_PLACEHOLDER_NAME);
                let site = self
                    .sites
                    .create(
                        WriteContext::bulk(),
                        NewSite {
                            point,
                            name: name.to_string(),
                            description: None,
                            location_type: LocationType::PointObservation,
                        },
                    )
                    .await?;
                outcome.sites_created += 1;
                site
            }
        };

        let upsert = self.build_upsert(request, row, upstream_id, site.id);
        let mut uow = self.occurrences.begin(WriteContext::bulk()).await?;
        let action =
            match apply_upsert(uow.as_mut(), &upsert, self.config.fail_on_duplicate_upstream_id)
                .await
            {
                Ok(action) => action,
                Err(e) => {
                    if let Err(rollback_err) = uow.rollback().await {
                        warn!(error = %rollback_err, "Occurrence rollback failed");
                    }
                    return Err(e);
                }
            };

        match action {
            UpsertAction::Created => {
                uow.commit().await?;
                outcome.records_created += 1;
                touched_sites.insert(site.id);
                trace!(upstream_id, site_id = site.id, "Occurrence created");
            }
            UpsertAction::Updated {
                previous_site,
                duplicated,
            } => {
                uow.commit().await?;
                outcome.records_updated += 1;
                if duplicated {
                    outcome.duplicate_upstream_ids += 1;
                }
                touched_sites.insert(previous_site);
                touched_sites.insert(site.id);
                trace!(upstream_id, site_id = site.id, "Occurrence updated");
            }
            UpsertAction::SkippedDuplicate => {
                uow.rollback().await?;
                outcome.duplicate_upstream_ids += 1;
                outcome.records_skipped += 1;
            }
        }
        Ok(())
    }

    fn build_upsert(
        &self,
        request: &HarvestRequest,
        row: &OccurrenceRow,
        upstream_id: &str,
        site_id: i64,
    ) -> OccurrenceUpsert {
        let owner = request
            .owner
            .as_deref()
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .unwrap_or(&self.config.default_owner)
            .to_string();
        let habitat = request
            .habitat
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_lowercase);
        let origin_category = request
            .origin_hint
            .as_deref()
            .and_then(OriginCategory::from_vocabulary)
            .or_else(|| {
                row.establishment_means
                    .as_deref()
                    .and_then(OriginCategory::from_vocabulary)
            });

        OccurrenceUpsert {
            upstream_id: upstream_id.to_string(),
            source: self.config.source.clone(),
            taxon_id: request.taxon.id,
            site_id,
            collection_date: row.observed_on(),
            collector: row.collector.clone(),
            institution_code: row.institution_code.clone(),
            species_name: row.species_name.clone(),
            reference_url: row.reference_url.clone(),
            owner,
            origin_category,
            habitat,
            validated: true,
            externally_sourced: true,
            additional_data: json!({
                "fetch_mode": "harvest",
                "fetched_at": Utc::now().to_rfc3339(),
                "run_id": request.run_id,
                "upstream_payload": row.raw,
            }),
        }
    }
}

/// Insert, or overwrite the first record sharing the upstream id.
async fn apply_upsert(
    uow: &mut dyn OccurrenceUnitOfWork,
    upsert: &OccurrenceUpsert,
    fail_on_duplicate: bool,
) -> Result<UpsertAction> {
    let existing = uow
        .find_by_upstream_id(&upsert.source, &upsert.upstream_id)
        .await?;

    match existing.as_slice() {
        [] => {
            uow.insert(upsert).await?;
            Ok(UpsertAction::Created)
        }
        [first, rest @ ..] => {
            let duplicated = !rest.is_empty();
            if duplicated {
                warn!(
                    upstream_id = %upsert.upstream_id,
                    result_count = existing.len(),
                    "Upstream id held by several records"
                );
                if fail_on_duplicate {
                    return Ok(UpsertAction::SkippedDuplicate);
                }
            }
            uow.update(first.id, upsert).await?;
            Ok(UpsertAction::Updated {
                previous_site: first.site_id,
                duplicated,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use taxa_core::{CancellationFlag, NeverCancelled, Rank};

    use crate::memory::{new_taxon, MemoryStore};
    use crate::mock::{occurrence_row, MockRegistry};

    const TIGER_KEY: i64 = 100;

    fn pipeline(store: &MemoryStore, registry: &MockRegistry, config: HarvestConfig) -> HarvestPipeline {
        HarvestPipeline::new(
            Arc::new(registry.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            config,
        )
    }

    fn tiger(store: &MemoryStore) -> TaxonNode {
        store.seed_taxon(taxa_core::NewTaxon {
            external_key: Some(TIGER_KEY),
            ..new_taxon("Panthera tigris", Rank::Species)
        })
    }

    fn rows(count: usize) -> Vec<OccurrenceRow> {
        (0..count)
            .map(|i| occurrence_row(&format!("occ-{i}"), 30.0 + i as f64, -25.0))
            .collect()
    }

    /// Fires once the store holds `after` occurrences.
    struct CancelAfter {
        store: MemoryStore,
        after: usize,
    }

    #[async_trait]
    impl CancellationSignal for CancelAfter {
        async fn is_cancelled(&self, _run_id: Uuid) -> bool {
            self.store.occurrence_count() >= self.after
        }
    }

    fn upsert_for(taxon_id: i64, site_id: i64, upstream_id: &str) -> OccurrenceUpsert {
        OccurrenceUpsert {
            upstream_id: upstream_id.to_string(),
            source: "gbif".to_string(),
            taxon_id,
            site_id,
            collection_date: None,
            collector: None,
            institution_code: None,
            species_name: None,
            reference_url: None,
            owner: "someone".to_string(),
            origin_category: None,
            habitat: None,
            validated: false,
            externally_sourced: false,
            additional_data: json!({}),
        }
    }

    #[tokio::test]
    async fn test_taxon_without_key_is_skipped() {
        let store = MemoryStore::new();
        let taxon = store.seed_taxon(new_taxon("Panthera tigris", Rank::Species));
        let registry = MockRegistry::new();

        let outcome = pipeline(&store, &registry, HarvestConfig::default())
            .harvest(&HarvestRequest::new(taxon), &NeverCancelled)
            .await;

        assert_eq!(outcome.status, HarvestStatus::Skipped);
        assert!(registry.calls().is_empty());
    }

    #[tokio::test]
    async fn test_harvest_is_idempotent() {
        let store = MemoryStore::new();
        let taxon = tiger(&store);
        let registry = MockRegistry::new().with_occurrences(TIGER_KEY, rows(45));
        let pipeline = pipeline(&store, &registry, HarvestConfig::default());

        let first = pipeline
            .harvest(&HarvestRequest::new(taxon.clone()), &NeverCancelled)
            .await;
        let second = pipeline
            .harvest(&HarvestRequest::new(taxon), &NeverCancelled)
            .await;

        assert_eq!(first.status, HarvestStatus::Completed);
        assert_eq!(first.pages_fetched, 3);
        assert_eq!(first.records_created, 45);
        assert_eq!(first.sites_created, 45);
        assert_eq!(second.records_created, 0);
        assert_eq!(second.records_updated, 45);
        assert_eq!(second.sites_created, 0);
        assert_eq!(store.occurrence_count(), 45);
        assert_eq!(store.sites().len(), 45);
        assert_eq!(registry.occurrence_offsets(), vec![0, 20, 40, 0, 20, 40]);
    }

    #[tokio::test]
    async fn test_spatial_dedup_reuses_site_within_uncertainty() {
        let store = MemoryStore::new();
        let taxon = tiger(&store);
        let registry = MockRegistry::new().with_occurrences(
            TIGER_KEY,
            vec![
                occurrence_row("a", 30.0, -25.0),
                occurrence_row("b", 30.0, -25.0),
                occurrence_row("c", 31.0, -25.0),
            ],
        );

        let outcome = pipeline(&store, &registry, HarvestConfig::default())
            .harvest(&HarvestRequest::new(taxon), &NeverCancelled)
            .await;

        assert_eq!(outcome.records_created, 3);
        assert_eq!(outcome.sites_created, 2);
        let sites = store.sites();
        assert_eq!(sites.len(), 2);
        let shared = sites
            .iter()
            .find(|s| s.point.longitude == 30.0)
            .unwrap();
        assert_eq!(shared.occurrence_count, 2);
        assert_eq!(shared.name, SITE_PLACEHOLDER_NAME);
    }

    #[tokio::test]
    async fn test_uncertainty_widens_site_match() {
        let store = MemoryStore::new();
        let taxon = tiger(&store);
        let mut near = occurrence_row("b", 30.0005, -25.0);
        near.coordinate_uncertainty_m = Some(250.0);
        let mut first = occurrence_row("a", 30.0, -25.0);
        first.locality = Some("Kruger Park".to_string());
        let registry = MockRegistry::new().with_occurrences(TIGER_KEY, vec![first, near]);

        pipeline(&store, &registry, HarvestConfig::default())
            .harvest(&HarvestRequest::new(taxon), &NeverCancelled)
            .await;

        let sites = store.sites();
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].name, "Kruger Park");
    }

    #[tokio::test]
    async fn test_duplicate_upstream_ids_self_heal() {
        let store = MemoryStore::new();
        let taxon = tiger(&store);
        let site = store.seed_site(NewSite {
            point: taxa_core::GeoPoint::new(30.0, -25.0).unwrap(),
            name: "old".to_string(),
            description: None,
            location_type: LocationType::PointObservation,
        });
        let first = store
            .seed_occurrence(&upsert_for(taxon.id, site.id, "occ-0"))
            .unwrap();
        let second = store
            .seed_occurrence(&upsert_for(taxon.id, site.id, "occ-0"))
            .unwrap();
        let registry = MockRegistry::new().with_occurrences(TIGER_KEY, rows(1));

        let outcome = pipeline(&store, &registry, HarvestConfig::default())
            .harvest(&HarvestRequest::new(taxon).with_owner("Kruger SANParks"), &NeverCancelled)
            .await;

        assert_eq!(outcome.duplicate_upstream_ids, 1);
        assert_eq!(outcome.records_updated, 1);
        assert_eq!(outcome.records_created, 0);
        let occurrences = store.occurrences();
        let healed = occurrences.iter().find(|o| o.id == first).unwrap();
        assert_eq!(healed.owner, "Kruger SANParks");
        assert!(healed.validated);
        let untouched = occurrences.iter().find(|o| o.id == second).unwrap();
        assert_eq!(untouched.owner, "someone");
    }

    #[tokio::test]
    async fn test_duplicate_upstream_ids_can_be_skipped() {
        let store = MemoryStore::new();
        let taxon = tiger(&store);
        let site = store.seed_site(NewSite {
            point: taxa_core::GeoPoint::new(30.0, -25.0).unwrap(),
            name: "old".to_string(),
            description: None,
            location_type: LocationType::PointObservation,
        });
        store
            .seed_occurrence(&upsert_for(taxon.id, site.id, "occ-0"))
            .unwrap();
        store
            .seed_occurrence(&upsert_for(taxon.id, site.id, "occ-0"))
            .unwrap();
        let registry = MockRegistry::new().with_occurrences(TIGER_KEY, rows(1));
        let config = HarvestConfig::default().with_fail_on_duplicate_upstream_id(true);

        let outcome = pipeline(&store, &registry, config)
            .harvest(&HarvestRequest::new(taxon), &NeverCancelled)
            .await;

        assert_eq!(outcome.status, HarvestStatus::Completed);
        assert_eq!(outcome.records_skipped, 1);
        assert_eq!(outcome.records_updated, 0);
        assert!(store.occurrences().iter().all(|o| o.owner == "someone"));
    }

    #[tokio::test]
    async fn test_skipped_duplicate_creates_no_site() {
        let store = MemoryStore::new();
        let taxon = tiger(&store);
        let site = store.seed_site(NewSite {
            point: taxa_core::GeoPoint::new(10.0, 10.0).unwrap(),
            name: "old".to_string(),
            description: None,
            location_type: LocationType::PointObservation,
        });
        store
            .seed_occurrence(&upsert_for(taxon.id, site.id, "occ-0"))
            .unwrap();
        store
            .seed_occurrence(&upsert_for(taxon.id, site.id, "occ-0"))
            .unwrap();
        // occ-0 now reports a point far from the existing site.
        let registry = MockRegistry::new().with_occurrences(TIGER_KEY, rows(1));
        let config = HarvestConfig::default().with_fail_on_duplicate_upstream_id(true);

        let outcome = pipeline(&store, &registry, config)
            .harvest(&HarvestRequest::new(taxon), &NeverCancelled)
            .await;

        assert_eq!(outcome.records_skipped, 1);
        assert_eq!(outcome.duplicate_upstream_ids, 1);
        assert_eq!(outcome.sites_created, 0);
        assert_eq!(store.sites().len(), 1);
        assert!(store.refresh_calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_stops_after_n_records_without_next_page() {
        let store = MemoryStore::new();
        let taxon = tiger(&store);
        let registry = MockRegistry::new().with_occurrences(TIGER_KEY, rows(30));
        let signal = CancelAfter {
            store: store.clone(),
            after: 7,
        };

        let outcome = pipeline(&store, &registry, HarvestConfig::default())
            .harvest(&HarvestRequest::new(taxon), &signal)
            .await;

        assert_eq!(outcome.status, HarvestStatus::Cancelled);
        assert_eq!(store.occurrence_count(), 7);
        assert_eq!(outcome.records_written(), 7);
        assert_eq!(registry.occurrence_offsets(), vec![0]);
        // Committed work is kept and its sites are summarised.
        assert_eq!(store.refresh_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_pre_cancelled_run_fetches_nothing() {
        let store = MemoryStore::new();
        let taxon = tiger(&store);
        let registry = MockRegistry::new().with_occurrences(TIGER_KEY, rows(3));
        let flag = CancellationFlag::new();
        flag.cancel();

        let outcome = pipeline(&store, &registry, HarvestConfig::default())
            .harvest(&HarvestRequest::new(taxon), &flag)
            .await;

        assert_eq!(outcome.status, HarvestStatus::Cancelled);
        assert!(registry.occurrence_offsets().is_empty());
    }

    #[tokio::test]
    async fn test_page_failure_ends_run_as_failed() {
        let store = MemoryStore::new();
        let taxon = tiger(&store);
        let registry = MockRegistry::new()
            .with_occurrences(TIGER_KEY, rows(30))
            .with_failing_page(TIGER_KEY, 20);

        let outcome = pipeline(&store, &registry, HarvestConfig::default())
            .harvest(&HarvestRequest::new(taxon), &NeverCancelled)
            .await;

        assert!(matches!(outcome.status, HarvestStatus::Failed(_)));
        assert_eq!(outcome.records_created, 20);
        assert_eq!(store.occurrence_count(), 20);
        assert_eq!(registry.occurrence_offsets(), vec![0, 20]);
    }

    #[tokio::test]
    async fn test_rows_without_id_or_coordinates_are_skipped() {
        let store = MemoryStore::new();
        let taxon = tiger(&store);
        let mut no_id = occurrence_row("x", 30.0, -25.0);
        no_id.upstream_id = None;
        let mut no_point = occurrence_row("y", 30.0, -25.0);
        no_point.latitude = None;
        let out_of_range = occurrence_row("z", 200.0, -25.0);
        let registry = MockRegistry::new()
            .with_occurrences(TIGER_KEY, vec![no_id, no_point, out_of_range, occurrence_row("ok", 30.0, -25.0)]);

        let outcome = pipeline(&store, &registry, HarvestConfig::default())
            .harvest(&HarvestRequest::new(taxon), &NeverCancelled)
            .await;

        assert_eq!(outcome.records_seen, 4);
        assert_eq!(outcome.records_skipped, 3);
        assert_eq!(outcome.records_created, 1);
    }

    #[tokio::test]
    async fn test_bulk_harvest_refreshes_sites_once() {
        let store = MemoryStore::new();
        let taxon = tiger(&store);
        let registry = MockRegistry::new().with_occurrences(TIGER_KEY, rows(25));

        pipeline(&store, &registry, HarvestConfig::default())
            .harvest(&HarvestRequest::new(taxon), &NeverCancelled)
            .await;

        assert_eq!(store.interactive_refreshes(), 0);
        let calls = store.refresh_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 25);
        assert!(store.sites().iter().all(|s| s.occurrence_count == 1));
    }

    #[tokio::test]
    async fn test_record_fields_are_overwritten() {
        let store = MemoryStore::new();
        let taxon = tiger(&store);
        let mut row = occurrence_row("occ-1", 30.0, -25.0);
        row.event_date = None;
        row.modified = chrono::NaiveDate::from_ymd_opt(2021, 3, 4);
        row.collector = Some("J. Smith".to_string());
        row.establishment_means = Some("introduced".to_string());
        row.species_name = Some("Panthera tigris".to_string());
        let registry = MockRegistry::new().with_occurrences(TIGER_KEY, vec![row]);
        let request = HarvestRequest::new(taxon.clone())
            .with_habitat("  Grassland ")
            .with_origin_hint("not-a-vocabulary-term");

        pipeline(&store, &registry, HarvestConfig::default())
            .harvest(&request, &NeverCancelled)
            .await;

        let record = store.occurrences().pop().unwrap();
        assert_eq!(record.taxon_id, taxon.id);
        assert_eq!(record.owner, "GBIF.org");
        assert_eq!(record.source, "gbif");
        assert_eq!(record.habitat.as_deref(), Some("grassland"));
        assert_eq!(record.origin_category, Some(OriginCategory::NonNative));
        assert_eq!(record.collection_date, chrono::NaiveDate::from_ymd_opt(2021, 3, 4));
        assert!(record.validated && record.externally_sourced);
        assert_eq!(record.additional_data["fetch_mode"], "harvest");
        assert_eq!(record.additional_data["upstream_payload"]["gbifID"], "occ-1");
        assert_eq!(
            record.additional_data["run_id"],
            json!(request.run_id)
        );
    }

    #[tokio::test]
    async fn test_query_carries_country_and_page_size() {
        let store = MemoryStore::new();
        let taxon = tiger(&store);
        let registry = MockRegistry::new().with_occurrences(TIGER_KEY, rows(3));
        let config = HarvestConfig::default().with_country("ZA").with_page_size(2);

        let outcome = pipeline(&store, &registry, config)
            .harvest(&HarvestRequest::new(taxon).with_offset(1), &NeverCancelled)
            .await;

        let queries = registry.occurrence_queries();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].offset, 1);
        assert_eq!(queries[0].limit, 2);
        assert_eq!(queries[0].country.as_deref(), Some("ZA"));
        assert_eq!(outcome.records_created, 2);
    }

    #[tokio::test]
    async fn test_max_pages_caps_the_run() {
        let store = MemoryStore::new();
        let taxon = tiger(&store);
        let registry = MockRegistry::new().with_occurrences(TIGER_KEY, rows(100));
        let config = HarvestConfig::default().with_max_pages(2);

        let outcome = pipeline(&store, &registry, config)
            .harvest(&HarvestRequest::new(taxon), &NeverCancelled)
            .await;

        assert_eq!(outcome.status, HarvestStatus::Completed);
        assert_eq!(outcome.pages_fetched, 2);
        assert_eq!(store.occurrence_count(), 40);
    }

    #[test]
    fn test_request_defaults() {
        let store = MemoryStore::new();
        let request = HarvestRequest::new(store.seed_taxon(new_taxon("Panthera", Rank::Genus)));
        assert_eq!(request.offset_start, 0);
        assert!(request.owner.is_none());
        assert!(request.origin_hint.is_none());
    }
}
