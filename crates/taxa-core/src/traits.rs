//! Core traits for taxa abstractions.
//!
//! These traits define the interfaces that concrete implementations must
//! satisfy, so the engine can run against PostgreSQL, in-memory stores, or a
//! live or scripted registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// TAXON REPOSITORY TRAITS
// =============================================================================

/// Repository for taxon nodes.
#[async_trait]
pub trait TaxonRepository: Send + Sync {
    /// Fetch a taxon by internal id.
    async fn get(&self, id: i64) -> Result<Option<TaxonNode>>;

    /// Fetch the taxon holding a registry key (lowest id when several do).
    async fn find_by_external_key(&self, key: i64) -> Result<Option<TaxonNode>>;

    /// All taxa sharing the duplicate-detection identity, ordered by id.
    async fn find_by_identity(&self, identity: &TaxonIdentity) -> Result<Vec<TaxonNode>>;

    /// Taxa of `rank` whose canonical name equals `name` case-insensitively,
    /// or whose legacy names contain `name`. Ordered by id.
    async fn find_merge_candidates(&self, name: &str, rank: Rank) -> Result<Vec<TaxonNode>>;

    /// Create a taxon.
    async fn insert(&self, ctx: WriteContext, taxon: NewTaxon) -> Result<TaxonNode>;

    /// Overwrite every mutable field of an existing taxon.
    async fn update(&self, ctx: WriteContext, taxon: &TaxonNode) -> Result<()>;

    /// Attach vernacular names, skipping ones already linked.
    /// Returns the number of names newly attached.
    async fn add_vernacular_names(&self, taxon_id: i64, names: &[VernacularName])
        -> Result<u64>;

    /// Vernacular names linked to a taxon.
    async fn vernacular_names(&self, taxon_id: i64) -> Result<Vec<VernacularName>>;

    /// Number of references from `class` pointing at a taxon.
    async fn count_references(&self, class: RelationClass, taxon_id: i64) -> Result<u64>;

    /// Open a unit of work for merge operations.
    async fn begin(&self) -> Result<Box<dyn TaxonUnitOfWork>>;
}

/// Transactional scope used by the merge engine.
///
/// Nothing written through a unit of work is visible to other callers until
/// `commit`. Dropping it without committing rolls back.
#[async_trait]
pub trait TaxonUnitOfWork: Send {
    /// Re-point every `class` reference from `losers` to `survivor`.
    ///
    /// A failure leaves the unit of work usable; only this class's changes are
    /// discarded.
    async fn migrate_references(
        &mut self,
        class: RelationClass,
        losers: &[i64],
        survivor: i64,
    ) -> Result<u64>;

    /// Remove every `class` reference to `losers` (links deleted, pointers nulled).
    async fn detach_references(&mut self, class: RelationClass, losers: &[i64]) -> Result<u64>;

    /// Overwrite a taxon inside this unit of work.
    async fn update_taxon(&mut self, taxon: &TaxonNode) -> Result<()>;

    /// Delete taxa by id. Returns the number deleted.
    async fn delete_taxa(&mut self, ids: &[i64]) -> Result<u64>;

    /// Make every change visible atomically.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every change.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

// =============================================================================
// SITE REPOSITORY TRAITS
// =============================================================================

/// Repository for geographic sites.
#[async_trait]
pub trait SiteRepository: Send + Sync {
    /// Closest site whose point lies within `radius_m` metres of `point`.
    async fn find_within(&self, point: GeoPoint, radius_m: f64) -> Result<Option<Site>>;

    /// Create a site.
    async fn create(&self, ctx: WriteContext, site: NewSite) -> Result<Site>;

    /// Fetch a site by id.
    async fn get(&self, id: i64) -> Result<Option<Site>>;

    /// Recompute derived summaries (occurrence count, last observed date).
    async fn refresh_summaries(&self, site_ids: &[i64]) -> Result<()>;
}

// =============================================================================
// OCCURRENCE REPOSITORY TRAITS
// =============================================================================

/// Repository for occurrence records.
#[async_trait]
pub trait OccurrenceRepository: Send + Sync {
    /// All records carrying an upstream id for a source, ordered by id.
    async fn find_by_upstream_id(&self, source: &str, upstream_id: &str)
        -> Result<Vec<OccurrenceRecord>>;

    /// All records for a taxon, ordered by id.
    async fn list_for_taxon(&self, taxon_id: i64) -> Result<Vec<OccurrenceRecord>>;

    /// Open a unit of work for one record upsert.
    async fn begin(&self, ctx: WriteContext) -> Result<Box<dyn OccurrenceUnitOfWork>>;
}

/// Transactional scope used for a single occurrence upsert.
#[async_trait]
pub trait OccurrenceUnitOfWork: Send {
    /// Records carrying an upstream id, locked for update, ordered by id.
    async fn find_by_upstream_id(
        &mut self,
        source: &str,
        upstream_id: &str,
    ) -> Result<Vec<OccurrenceRecord>>;

    /// Insert a new record.
    async fn insert(&mut self, record: &OccurrenceUpsert) -> Result<i64>;

    /// Overwrite every field of an existing record.
    async fn update(&mut self, id: i64, record: &OccurrenceUpsert) -> Result<()>;

    /// Make every change visible atomically.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every change.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

// =============================================================================
// REGISTRY CLIENT
// =============================================================================

/// Client for the external taxonomic registry and occurrence archive.
///
/// `Ok(None)` means the registry has no such record; `Err` means the
/// registry could not be asked (transport failure, malformed payload).
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Exact name match, optionally restricted to a rank.
    async fn search_by_name(&self, name: &str, rank: Option<Rank>)
        -> Result<Option<RegistryRecord>>;

    /// Fuzzy suggestion, optionally restricted to a rank.
    async fn suggest_by_name(
        &self,
        name: &str,
        rank: Option<Rank>,
    ) -> Result<Option<RegistryRecord>>;

    /// Fetch one record by key.
    async fn get_by_key(&self, key: i64) -> Result<Option<RegistryRecord>>;

    /// Direct children of a record.
    async fn list_children(&self, key: i64) -> Result<Vec<RegistryRecord>>;

    /// Common names of a record.
    async fn get_vernacular_names(&self, key: i64) -> Result<Vec<VernacularName>>;

    /// One page of occurrences.
    async fn search_occurrences(&self, query: &OccurrenceQuery) -> Result<OccurrencePage>;
}

// =============================================================================
// CANCELLATION
// =============================================================================

/// Cooperative cancellation flag, polled by long-running runs.
#[async_trait]
pub trait CancellationSignal: Send + Sync {
    /// True once the run identified by `run_id` should stop.
    async fn is_cancelled(&self, run_id: Uuid) -> bool;
}

/// Signal that never fires.
pub struct NeverCancelled;

#[async_trait]
impl CancellationSignal for NeverCancelled {
    async fn is_cancelled(&self, _run_id: Uuid) -> bool {
        false
    }
}

/// In-process cancellation flag shared between a run and its controller.
#[derive(Clone, Default)]
pub struct CancellationFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CancellationSignal for CancellationFlag {
    async fn is_cancelled(&self, _run_id: Uuid) -> bool {
        self.is_set()
    }
}

// =============================================================================
// JOB REPOSITORY TRAITS
// =============================================================================

/// Repository for job queue operations.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Queue a new job.
    async fn queue(
        &self,
        job_type: JobType,
        priority: i32,
        payload: Option<JsonValue>,
    ) -> Result<Uuid>;

    /// Claim the most urgent pending job whose type is in `job_types`,
    /// marking it running. Nothing is claimed for an empty slice.
    async fn claim(&self, job_types: &[JobType]) -> Result<Option<Job>>;

    /// Record a result. A job cancelled while it ran stays cancelled.
    async fn complete(&self, job_id: Uuid, result: Option<JsonValue>) -> Result<()>;

    /// Record a failure. Transient failures requeue the job while retries
    /// remain; returns the status the job ended up in.
    async fn fail(&self, job_id: Uuid, error: &str, kind: FailureKind) -> Result<JobStatus>;

    /// Request cancellation of a pending or running job.
    async fn cancel(&self, job_id: Uuid) -> Result<bool>;

    /// Get job by ID.
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Get pending jobs count.
    async fn pending_count(&self) -> Result<i64>;
}
