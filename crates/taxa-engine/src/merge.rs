//! Duplicate taxon merging.
//!
//! Collapses every node sharing a canonical name and rank into one survivor.
//! All references held by the losers are re-pointed to the survivor inside a
//! single unit of work before the losers are deleted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use taxa_core::{
    MergeReport, Rank, RegistryClient, RelationClass, Result, TaxonNode, TaxonRepository,
    TaxonUnitOfWork,
};

/// What the registry says about a candidate's external key.
///
/// Ordered from most to least preferred survivor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum RegistryVerdict {
    Accepted,
    /// No key, or the registry could not be asked.
    Unknown,
    /// Not found, or reported with a non-accepted status.
    NotAccepted,
}

/// Merges duplicate taxa.
#[derive(Clone)]
pub struct MergeEngine {
    taxa: Arc<dyn TaxonRepository>,
    registry: Arc<dyn RegistryClient>,
}

impl MergeEngine {
    pub fn new(taxa: Arc<dyn TaxonRepository>, registry: Arc<dyn RegistryClient>) -> Self {
        Self { taxa, registry }
    }

    /// Merge every node of `rank` named `name` into one survivor.
    ///
    /// Returns the survivor as persisted after the merge, or `None` when
    /// fewer than two candidates exist.
    pub async fn merge_duplicates(&self, name: &str, rank: Rank) -> Result<Option<TaxonNode>> {
        match self.merge_with_report(name, rank).await? {
            Some(report) => self.taxa.get(report.survivor_id).await,
            None => Ok(None),
        }
    }

    /// Like [`merge_duplicates`](Self::merge_duplicates) but returns what was done.
    #[instrument(skip(self), fields(subsystem = "engine", component = "merge", op = "merge_duplicates"))]
    pub async fn merge_with_report(&self, name: &str, rank: Rank) -> Result<Option<MergeReport>> {
        let start = Instant::now();
        let candidates = self.taxa.find_merge_candidates(name, rank).await?;
        if candidates.len() < 2 {
            debug!(result_count = candidates.len(), "Nothing to merge");
            return Ok(None);
        }

        let mut ranked = self.rank_candidates(candidates).await;
        let losers = ranked.split_off(1);
        let mut survivor = ranked.remove(0);
        let loser_ids: Vec<i64> = losers.iter().map(|t| t.id).collect();
        absorb(&mut survivor, &losers);

        debug!(
            taxon_id = survivor.id,
            losers = ?loser_ids,
            "Survivor selected"
        );

        let mut uow = self.taxa.begin().await?;
        let report = match migrate_into(uow.as_mut(), &survivor, &loser_ids).await {
            Ok(report) => report,
            Err(e) => {
                if let Err(rollback_err) = uow.rollback().await {
                    warn!(error = %rollback_err, "Merge rollback failed");
                }
                return Err(e);
            }
        };
        uow.commit().await?;

        info!(
            taxon_id = report.survivor_id,
            removed = report.removed_ids.len(),
            failed_classes = report.failed_classes.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Duplicates merged"
        );
        Ok(Some(report))
    }

    /// Sort candidates best-survivor first.
    async fn rank_candidates(&self, candidates: Vec<TaxonNode>) -> Vec<TaxonNode> {
        let mut verdicts: HashMap<i64, RegistryVerdict> = HashMap::new();
        let mut keyed = Vec::with_capacity(candidates.len());
        for taxon in candidates {
            let verdict = match taxon.external_key {
                Some(key) => match verdicts.get(&key) {
                    Some(verdict) => *verdict,
                    None => {
                        let verdict = self.registry_verdict(key).await;
                        verdicts.insert(key, verdict);
                        verdict
                    }
                },
                None => RegistryVerdict::Unknown,
            };
            keyed.push((taxon, verdict));
        }

        keyed.sort_by_key(|(taxon, verdict)| {
            (
                !taxon.taxonomic_status.is_accepted(),
                *verdict,
                taxon.external_key.is_none(),
                taxon.external_key,
                taxon.id,
            )
        });
        keyed.into_iter().map(|(taxon, _)| taxon).collect()
    }

    /// Registry lookups only break ties; a failure never fails the merge.
    async fn registry_verdict(&self, key: i64) -> RegistryVerdict {
        match self.registry.get_by_key(key).await {
            Ok(Some(record)) if record.taxonomic_status.is_accepted() => RegistryVerdict::Accepted,
            Ok(_) => RegistryVerdict::NotAccepted,
            Err(e) => {
                debug!(external_key = key, error = %e, "Registry verdict unavailable");
                RegistryVerdict::Unknown
            }
        }
    }
}

/// Fold the losers' names, parent, key and author into the survivor.
fn absorb(survivor: &mut TaxonNode, losers: &[TaxonNode]) {
    let loser_ids: Vec<i64> = losers.iter().map(|t| t.id).collect();
    if survivor.parent_id.is_some_and(|p| loser_ids.contains(&p)) {
        survivor.parent_id = None;
    }
    if survivor
        .accepted_taxon_id
        .is_some_and(|a| loser_ids.contains(&a))
    {
        survivor.accepted_taxon_id = None;
    }

    for loser in losers {
        survivor.add_legacy_name(&loser.canonical_name);
        for name in &loser.legacy_names {
            survivor.add_legacy_name(name);
        }
        if survivor.parent_id.is_none() {
            survivor.parent_id = loser
                .parent_id
                .filter(|p| *p != survivor.id && !loser_ids.contains(p));
        }
        if survivor.external_key.is_none() {
            survivor.external_key = loser.external_key;
        }
        if survivor.author.is_none() {
            survivor.author = loser.author.clone();
        }
    }
}

/// Re-point every relation class, scavenging classes that fail, then delete
/// the losers. Leaves commit or rollback to the caller.
async fn migrate_into(
    uow: &mut dyn TaxonUnitOfWork,
    survivor: &TaxonNode,
    loser_ids: &[i64],
) -> Result<MergeReport> {
    let mut report = MergeReport {
        survivor_id: survivor.id,
        removed_ids: loser_ids.to_vec(),
        migrated: Vec::new(),
        failed_classes: Vec::new(),
    };

    for class in RelationClass::ALL {
        match uow.migrate_references(class, loser_ids, survivor.id).await {
            Ok(moved) => report.migrated.push((class, moved)),
            Err(e) => {
                warn!(
                    class = class.as_str(),
                    taxon_id = survivor.id,
                    error = %e,
                    "Relation migration failed, detaching loser references"
                );
                let detached = uow.detach_references(class, loser_ids).await?;
                debug!(class = class.as_str(), detached, "Loser references detached");
                report.failed_classes.push(class);
            }
        }
    }

    uow.update_taxon(survivor).await?;
    let deleted = uow.delete_taxa(loser_ids).await?;
    debug!(deleted, "Losers deleted");
    Ok(report)
}
