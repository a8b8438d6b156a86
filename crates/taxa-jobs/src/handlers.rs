//! Handlers binding job types to the engine.
//!
//! Payloads are decoded into explicit request structs; an undecodable
//! payload or a missing taxon fails the job outright, registry and
//! repository failures ask for a retry.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use taxa_core::{
    CancellationSignal, HarvestStatus, JobType, Rank, TaxonNode, TaxonRepository,
};
use taxa_engine::{HarvestPipeline, HarvestRequest, MergeEngine, ResolveRequest, Resolver};

use crate::handler::{JobContext, JobHandler, JobResult};

/// Payload of a `harvest_occurrences` job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarvestPayload {
    pub taxon_id: i64,
    #[serde(default)]
    pub offset: Option<u32>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub habitat: Option<String>,
    #[serde(default)]
    pub origin: Option<String>,
}

/// Payload of a `resolve_taxon` job. One of `name` or `external_key` is required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolvePayload {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub rank: Option<Rank>,
    #[serde(default)]
    pub external_key: Option<i64>,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub fetch_children: bool,
    #[serde(default)]
    pub fetch_vernacular: bool,
}

/// Payload of a `merge_duplicates` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergePayload {
    pub name: String,
    pub rank: Rank,
}

/// Payload of `resync_parent` and `resync_synonym` jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxonPayload {
    pub taxon_id: i64,
}

macro_rules! payload_or_fail {
    ($ctx:expr) => {
        match $ctx.payload() {
            Ok(payload) => payload,
            Err(e) => return JobResult::Failed(e.to_string()),
        }
    };
}

async fn load_taxon(taxa: &dyn TaxonRepository, taxon_id: i64) -> Result<TaxonNode, JobResult> {
    match taxa.get(taxon_id).await {
        Ok(Some(taxon)) => Ok(taxon),
        Ok(None) => Err(JobResult::Failed(format!("taxon {} not found", taxon_id))),
        Err(e) => Err(JobResult::Retry(e.to_string())),
    }
}

fn node_summary(node: &TaxonNode) -> serde_json::Value {
    json!({
        "taxon_id": node.id,
        "canonical_name": node.canonical_name,
        "rank": node.rank,
        "external_key": node.external_key,
        "parent_id": node.parent_id,
        "accepted_taxon_id": node.accepted_taxon_id,
    })
}

/// Runs one occurrence harvest. The job id is the run id, so cancelling
/// the job cancels the run.
pub struct HarvestOccurrencesHandler {
    taxa: Arc<dyn TaxonRepository>,
    pipeline: HarvestPipeline,
    cancellation: Arc<dyn CancellationSignal>,
}

impl HarvestOccurrencesHandler {
    pub fn new(
        taxa: Arc<dyn TaxonRepository>,
        pipeline: HarvestPipeline,
        cancellation: Arc<dyn CancellationSignal>,
    ) -> Self {
        Self {
            taxa,
            pipeline,
            cancellation,
        }
    }
}

#[async_trait]
impl JobHandler for HarvestOccurrencesHandler {
    fn job_type(&self) -> JobType {
        JobType::HarvestOccurrences
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let payload: HarvestPayload = payload_or_fail!(ctx);
        let taxon = match load_taxon(self.taxa.as_ref(), payload.taxon_id).await {
            Ok(taxon) => taxon,
            Err(result) => return result,
        };

        let mut request = HarvestRequest::new(taxon)
            .with_run_id(ctx.run_id())
            .with_offset(payload.offset.unwrap_or(0));
        if let Some(owner) = payload.owner {
            request = request.with_owner(owner);
        }
        if let Some(habitat) = payload.habitat {
            request = request.with_habitat(habitat);
        }
        if let Some(origin) = payload.origin {
            request = request.with_origin_hint(origin);
        }

        let outcome = self
            .pipeline
            .harvest(&request, self.cancellation.as_ref())
            .await;
        // Page fetches and writes fail transiently; the queue retries the run.
        if let HarvestStatus::Failed(reason) = &outcome.status {
            return JobResult::Retry(reason.clone());
        }
        if outcome.status == HarvestStatus::Cancelled {
            info!(job_id = %ctx.job.id, written = outcome.records_written(), "Harvest cancelled");
        }
        JobResult::Success(serde_json::to_value(&outcome).ok())
    }
}

/// Resolves a name or registry key.
pub struct ResolveTaxonHandler {
    taxa: Arc<dyn TaxonRepository>,
    resolver: Resolver,
}

impl ResolveTaxonHandler {
    pub fn new(taxa: Arc<dyn TaxonRepository>, resolver: Resolver) -> Self {
        Self { taxa, resolver }
    }
}

#[async_trait]
impl JobHandler for ResolveTaxonHandler {
    fn job_type(&self) -> JobType {
        JobType::ResolveTaxon
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let payload: ResolvePayload = payload_or_fail!(ctx);
        let name = payload
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        if name.is_none() && payload.external_key.is_none() {
            return JobResult::Failed("resolve_taxon needs a name or an external_key".to_string());
        }

        let parent = match payload.parent_id {
            Some(parent_id) => match load_taxon(self.taxa.as_ref(), parent_id).await {
                Ok(parent) => Some(parent),
                Err(result) => return result,
            },
            None => None,
        };

        let request = ResolveRequest {
            name,
            rank: payload.rank,
            external_key: payload.external_key,
            parent,
            fetch_children: payload.fetch_children,
            fetch_vernacular: payload.fetch_vernacular,
        };
        match self.resolver.try_resolve(request).await {
            Ok(Some(node)) => {
                let mut result = node_summary(&node);
                result["resolved"] = json!(true);
                JobResult::Success(Some(result))
            }
            Ok(None) => {
                debug!(job_id = %ctx.job.id, "Nothing to resolve");
                JobResult::Success(Some(json!({ "resolved": false })))
            }
            Err(e) => JobResult::Retry(e.to_string()),
        }
    }
}

/// Collapses duplicates of one name and rank.
pub struct MergeDuplicatesHandler {
    merge: MergeEngine,
}

impl MergeDuplicatesHandler {
    pub fn new(merge: MergeEngine) -> Self {
        Self { merge }
    }
}

#[async_trait]
impl JobHandler for MergeDuplicatesHandler {
    fn job_type(&self) -> JobType {
        JobType::MergeDuplicates
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let payload: MergePayload = payload_or_fail!(ctx);
        match self
            .merge
            .merge_with_report(&payload.name, payload.rank)
            .await
        {
            Ok(Some(report)) => JobResult::Success(serde_json::to_value(&report).ok()),
            Ok(None) => JobResult::Success(Some(json!({ "merged": false }))),
            Err(e) => JobResult::Retry(e.to_string()),
        }
    }
}

/// Re-validates one taxon's parent.
pub struct ResyncParentHandler {
    taxa: Arc<dyn TaxonRepository>,
    resolver: Resolver,
}

impl ResyncParentHandler {
    pub fn new(taxa: Arc<dyn TaxonRepository>, resolver: Resolver) -> Self {
        Self { taxa, resolver }
    }
}

#[async_trait]
impl JobHandler for ResyncParentHandler {
    fn job_type(&self) -> JobType {
        JobType::ResyncParent
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let payload: TaxonPayload = payload_or_fail!(ctx);
        let taxon = match load_taxon(self.taxa.as_ref(), payload.taxon_id).await {
            Ok(taxon) => taxon,
            Err(result) => return result,
        };
        match self.resolver.try_resync_parent(&taxon).await {
            Ok(Some(node)) => JobResult::Success(Some(node_summary(&node))),
            Ok(None) => JobResult::Failed(format!("taxon {} disappeared during resync", taxon.id)),
            Err(e) => JobResult::Retry(e.to_string()),
        }
    }
}

/// Re-derives one synonym's accepted taxon.
pub struct ResyncSynonymHandler {
    taxa: Arc<dyn TaxonRepository>,
    resolver: Resolver,
}

impl ResyncSynonymHandler {
    pub fn new(taxa: Arc<dyn TaxonRepository>, resolver: Resolver) -> Self {
        Self { taxa, resolver }
    }
}

#[async_trait]
impl JobHandler for ResyncSynonymHandler {
    fn job_type(&self) -> JobType {
        JobType::ResyncSynonym
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let payload: TaxonPayload = payload_or_fail!(ctx);
        let taxon = match load_taxon(self.taxa.as_ref(), payload.taxon_id).await {
            Ok(taxon) => taxon,
            Err(result) => return result,
        };
        match self.resolver.try_resync_synonym(&taxon).await {
            Ok(Some(accepted)) => JobResult::Success(Some(json!({
                "taxon_id": taxon.id,
                "accepted": node_summary(&accepted),
            }))),
            Ok(None) => JobResult::Success(Some(json!({
                "taxon_id": taxon.id,
                "accepted": null,
            }))),
            Err(e) => JobResult::Retry(e.to_string()),
        }
    }
}
