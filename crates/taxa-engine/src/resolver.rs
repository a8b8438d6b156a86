//! Taxon resolution against the registry.
//!
//! A resolve call looks a name or key up in the registry, follows canonical
//! and accepted-name redirects, persists the result, merges duplicates and
//! links the node into the hierarchy (walking parents upward, optionally
//! children downward).
//!
//! Ordinary failures (registry down, name not found, a repository error) are
//! logged and surface as `None`; they never abort the caller.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tracing::{debug, info, instrument, warn};

use taxa_core::{
    NewTaxon, Rank, RegistryClient, RegistryRecord, Result, TaxonNode, TaxonRepository,
    WriteContext,
};

use crate::config::ResolverConfig;
use crate::merge::MergeEngine;

/// What to resolve and how far to walk.
#[derive(Debug, Clone, Default)]
pub struct ResolveRequest {
    /// Name to search for when no key is given. Kept as a legacy alias on
    /// leaf calls.
    pub name: Option<String>,
    pub rank: Option<Rank>,
    /// Registry key; takes precedence over the name.
    pub external_key: Option<i64>,
    /// Parent to assign instead of discovering one.
    pub parent: Option<TaxonNode>,
    pub fetch_children: bool,
    pub fetch_vernacular: bool,
}

impl ResolveRequest {
    pub fn by_name(name: impl Into<String>, rank: Rank) -> Self {
        Self {
            name: Some(name.into()),
            rank: Some(rank),
            ..Self::default()
        }
    }

    pub fn by_key(external_key: i64) -> Self {
        Self {
            external_key: Some(external_key),
            ..Self::default()
        }
    }

    pub fn with_rank(mut self, rank: Rank) -> Self {
        self.rank = Some(rank);
        self
    }

    pub fn with_parent(mut self, parent: TaxonNode) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_children(mut self) -> Self {
        self.fetch_children = true;
        self
    }

    pub fn with_vernacular(mut self) -> Self {
        self.fetch_vernacular = true;
        self
    }
}

/// Resolves names and keys into persisted taxon nodes.
#[derive(Clone)]
pub struct Resolver {
    taxa: Arc<dyn TaxonRepository>,
    registry: Arc<dyn RegistryClient>,
    merge: MergeEngine,
    config: ResolverConfig,
}

impl Resolver {
    pub fn new(
        taxa: Arc<dyn TaxonRepository>,
        registry: Arc<dyn RegistryClient>,
        config: ResolverConfig,
    ) -> Self {
        let merge = MergeEngine::new(taxa.clone(), registry.clone());
        Self {
            taxa,
            registry,
            merge,
            config,
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn merge_engine(&self) -> &MergeEngine {
        &self.merge
    }

    /// Resolve a request into a node. `None` covers not-found and every
    /// logged failure.
    pub async fn resolve(&self, request: ResolveRequest) -> Option<TaxonNode> {
        match self.try_resolve(request).await {
            Ok(node) => node,
            Err(e) => {
                warn!(
                    subsystem = "engine",
                    component = "resolver",
                    op = "resolve",
                    error = %e,
                    "Resolution failed"
                );
                None
            }
        }
    }

    /// Resolve, surfacing repository errors.
    #[instrument(
        skip(self, request),
        fields(
            subsystem = "engine",
            component = "resolver",
            op = "resolve",
            name = request.name.as_deref(),
            external_key = request.external_key
        )
    )]
    pub async fn try_resolve(&self, request: ResolveRequest) -> Result<Option<TaxonNode>> {
        let start = Instant::now();
        let node = self.resolve_at_depth(request, 0).await?;
        info!(
            taxon_id = node.as_ref().map(|n| n.id),
            found = node.is_some(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Resolution complete"
        );
        Ok(node)
    }

    fn resolve_at_depth(
        &self,
        request: ResolveRequest,
        depth: usize,
    ) -> BoxFuture<'_, Result<Option<TaxonNode>>> {
        Box::pin(async move {
            let Some(found) = self.lookup(&request).await else {
                debug!(name = request.name.as_deref(), external_key = request.external_key, depth, "Not in registry");
                return Ok(None);
            };
            let (record, superseded) = self.follow_redirects(found).await;

            let node = self.persist(&record).await?;
            let mut node = match self.merge.merge_duplicates(&node.canonical_name, node.rank).await? {
                Some(survivor) => survivor,
                None => node,
            };

            let mut changed = false;
            match &request.parent {
                Some(parent) => {
                    if !accepts_parent(&node, parent) {
                        warn!(taxon_id = node.id, parent_id = parent.id, "Explicit parent is not coarser, not assigned");
                    } else if node.parent_id != Some(parent.id) {
                        node.parent_id = Some(parent.id);
                        changed = true;
                    }
                }
                None if node.parent_id.is_none() => {
                    if let Some(parent_key) = record.parent_key {
                        if depth >= self.config.max_parent_depth {
                            debug!(taxon_id = node.id, depth, "Parent depth bound reached");
                        } else if let Some(parent) = self
                            .resolve_at_depth(ResolveRequest::by_key(parent_key), depth + 1)
                            .await?
                        {
                            // Upward recursion may have rewritten this node.
                            let Some(current) = self.taxa.get(node.id).await? else {
                                debug!(taxon_id = node.id, "Node merged away during parent resolution");
                                return Ok(None);
                            };
                            node = current;
                            if node.parent_id.is_some() {
                                debug!(taxon_id = node.id, "Parent assigned during recursion");
                            } else if accepts_parent(&node, &parent) {
                                node.parent_id = Some(parent.id);
                                changed = true;
                            } else {
                                warn!(taxon_id = node.id, parent_id = parent.id, "Registry parent is not coarser, not assigned");
                            }
                        }
                    }
                }
                None => {}
            }

            for name in &superseded {
                changed |= node.add_legacy_name(name);
            }
            if !request.fetch_children {
                if let Some(name) = request.name.as_deref() {
                    changed |= node.add_legacy_name(name);
                }
            }
            if changed {
                self.taxa.update(WriteContext::interactive(), &node).await?;
            }

            if request.fetch_children {
                self.resolve_children(&node, &request, depth).await?;
            }
            if request.fetch_vernacular {
                self.attach_vernacular_names(&node).await?;
            }

            Ok(Some(node))
        })
    }

    /// Registry record for a request: by key, else exact name, else fuzzy name.
    async fn lookup(&self, request: &ResolveRequest) -> Option<RegistryRecord> {
        if let Some(key) = request.external_key {
            return self.fetch(key).await;
        }
        let name = request.name.as_deref().map(str::trim).filter(|n| !n.is_empty())?;

        match self.registry.search_by_name(name, request.rank).await {
            Ok(Some(record)) => return Some(record),
            Ok(None) => {}
            Err(e) => warn!(name, error = %e, "Exact registry search failed"),
        }
        match self.registry.suggest_by_name(name, request.rank).await {
            Ok(record) => record,
            Err(e) => {
                warn!(name, error = %e, "Fuzzy registry search failed");
                None
            }
        }
    }

    /// Registry record by key; transport failures read as not found.
    async fn fetch(&self, key: i64) -> Option<RegistryRecord> {
        match self.registry.get_by_key(key).await {
            Ok(record) => record,
            Err(e) => {
                warn!(external_key = key, error = %e, "Registry fetch failed");
                None
            }
        }
    }

    /// Follow canonical and accepted-name redirects, returning the final
    /// record and the canonical names it superseded.
    ///
    /// A redirect target that cannot be fetched ends the walk on the current
    /// record.
    async fn follow_redirects(&self, record: RegistryRecord) -> (RegistryRecord, Vec<String>) {
        let mut current = record;
        let mut superseded = Vec::new();
        let mut seen = HashSet::from([current.key]);

        for _ in 0..self.config.max_redirects {
            let Some(next_key) = current
                .canonical_redirect()
                .or_else(|| current.accepted_redirect())
            else {
                break;
            };
            if !seen.insert(next_key) {
                debug!(external_key = next_key, "Redirect loop detected");
                break;
            }
            match self.fetch(next_key).await {
                Some(next) => {
                    debug!(from = current.key, to = next.key, "Following redirect");
                    superseded.push(current.canonical_name.clone());
                    current = next;
                }
                None => break,
            }
        }
        (current, superseded)
    }

    /// Create or update the node for a record.
    async fn persist(&self, record: &RegistryRecord) -> Result<TaxonNode> {
        let new = NewTaxon::from_record(record);
        let existing = match self
            .taxa
            .find_by_identity(&new.identity())
            .await?
            .into_iter()
            .next()
        {
            Some(node) => Some(node),
            None => self.taxa.find_by_external_key(record.key).await?,
        };

        let Some(mut node) = existing else {
            let node = self.taxa.insert(WriteContext::interactive(), new).await?;
            debug!(taxon_id = node.id, external_key = record.key, "Taxon created");
            return Ok(node);
        };

        let previous_name = std::mem::replace(&mut node.canonical_name, new.canonical_name);
        node.add_legacy_name(&previous_name);
        node.scientific_name = new.scientific_name;
        node.rank = new.rank;
        node.taxonomic_status = new.taxonomic_status;
        node.external_key = Some(record.key);
        if new.author.is_some() {
            node.author = new.author;
        }
        node.raw = new.raw;
        if node.taxonomic_status.is_accepted() {
            node.accepted_taxon_id = None;
        }
        self.taxa.update(WriteContext::interactive(), &node).await?;
        debug!(taxon_id = node.id, external_key = record.key, "Taxon updated");
        Ok(node)
    }

    /// Resolve the registry subtree below `node`, one level per recursion,
    /// carrying the caller's vernacular setting down.
    async fn resolve_children(
        &self,
        node: &TaxonNode,
        request: &ResolveRequest,
        depth: usize,
    ) -> Result<()> {
        let Some(key) = node.external_key else {
            return Ok(());
        };
        if depth >= self.config.max_child_depth {
            debug!(taxon_id = node.id, depth, "Child depth bound reached");
            return Ok(());
        }
        let children = match self.registry.list_children(key).await {
            Ok(children) => children,
            Err(e) => {
                warn!(taxon_id = node.id, error = %e, "Listing children failed");
                return Ok(());
            }
        };

        debug!(taxon_id = node.id, result_count = children.len(), "Resolving children");
        for child in children.into_iter().filter(|c| c.key != key) {
            let child_request = ResolveRequest {
                fetch_children: true,
                fetch_vernacular: request.fetch_vernacular,
                ..ResolveRequest::by_key(child.key).with_parent(node.clone())
            };
            if self.resolve_at_depth(child_request, depth + 1).await?.is_none() {
                debug!(external_key = child.key, "Child not resolved");
            }
        }
        Ok(())
    }

    async fn attach_vernacular_names(&self, node: &TaxonNode) -> Result<()> {
        let Some(key) = node.external_key else {
            return Ok(());
        };
        match self.registry.get_vernacular_names(key).await {
            Ok(names) => {
                let added = self.taxa.add_vernacular_names(node.id, &names).await?;
                debug!(taxon_id = node.id, added, "Vernacular names attached");
            }
            Err(e) => warn!(taxon_id = node.id, error = %e, "Fetching vernacular names failed"),
        }
        Ok(())
    }

    /// Re-check a node's parent against the registry.
    ///
    /// Returns the node, with a new parent when the registry now reports a
    /// different one. A missing registry record or parent key keeps the
    /// existing parent.
    pub async fn resync_parent(&self, taxon: &TaxonNode) -> Option<TaxonNode> {
        match self.try_resync_parent(taxon).await {
            Ok(node) => node,
            Err(e) => {
                warn!(
                    subsystem = "engine",
                    component = "resolver",
                    op = "resync_parent",
                    taxon_id = taxon.id,
                    error = %e,
                    "Parent resync failed"
                );
                None
            }
        }
    }

    #[instrument(skip(self, taxon), fields(subsystem = "engine", component = "resolver", op = "resync_parent", taxon_id = taxon.id))]
    pub async fn try_resync_parent(&self, taxon: &TaxonNode) -> Result<Option<TaxonNode>> {
        let unchanged = Ok(Some(taxon.clone()));
        let Some(key) = taxon.external_key else {
            return unchanged;
        };
        let Some(record) = self.fetch(key).await else {
            return unchanged;
        };
        let Some(parent_key) = record.parent_key else {
            debug!("Registry reports no parent, keeping current");
            return unchanged;
        };

        let current_parent = match taxon.parent_id {
            Some(id) => self.taxa.get(id).await?,
            None => None,
        };
        if current_parent.and_then(|p| p.external_key) == Some(parent_key) {
            return unchanged;
        }

        let parent = match self.taxa.find_by_external_key(parent_key).await? {
            Some(parent) => Some(parent),
            None => {
                self.resolve_at_depth(ResolveRequest::by_key(parent_key), 1)
                    .await?
            }
        };
        let Some(parent) = parent else {
            return unchanged;
        };
        if !accepts_parent(taxon, &parent) {
            warn!(taxon_id = taxon.id, parent_id = parent.id, "Registry parent is not coarser, keeping current");
            return unchanged;
        }

        let Some(mut node) = self.taxa.get(taxon.id).await? else {
            return Ok(None);
        };
        node.parent_id = Some(parent.id);
        self.taxa.update(WriteContext::interactive(), &node).await?;
        info!(parent_id = parent.id, "Parent reassigned");
        Ok(Some(node))
    }

    /// Re-derive a synonym's accepted node.
    ///
    /// Resolves the registry's current accepted key, merges duplicates of the
    /// accepted name, points the synonym at the survivor and returns the
    /// survivor. An accepted node is returned as is.
    pub async fn resync_synonym(&self, taxon: &TaxonNode) -> Option<TaxonNode> {
        match self.try_resync_synonym(taxon).await {
            Ok(node) => node,
            Err(e) => {
                warn!(
                    subsystem = "engine",
                    component = "resolver",
                    op = "resync_synonym",
                    taxon_id = taxon.id,
                    error = %e,
                    "Synonym resync failed"
                );
                None
            }
        }
    }

    #[instrument(skip(self, taxon), fields(subsystem = "engine", component = "resolver", op = "resync_synonym", taxon_id = taxon.id))]
    pub async fn try_resync_synonym(&self, taxon: &TaxonNode) -> Result<Option<TaxonNode>> {
        if taxon.taxonomic_status.is_accepted() {
            return Ok(Some(taxon.clone()));
        }
        let Some(key) = taxon.external_key else {
            return Ok(None);
        };
        let Some(record) = self.fetch(key).await else {
            return Ok(None);
        };
        let Some(accepted_key) = record.accepted_key.filter(|k| *k != record.key) else {
            debug!("Registry reports no accepted key");
            return Ok(None);
        };
        let Some(accepted) = self
            .resolve_at_depth(ResolveRequest::by_key(accepted_key), 0)
            .await?
        else {
            return Ok(None);
        };

        let survivor = match self
            .merge
            .merge_duplicates(&accepted.canonical_name, accepted.rank)
            .await?
        {
            Some(survivor) => survivor,
            None => accepted,
        };

        if let Some(mut node) = self.taxa.get(taxon.id).await? {
            if node.id != survivor.id
                && !node.taxonomic_status.is_accepted()
                && node.accepted_taxon_id != Some(survivor.id)
            {
                node.accepted_taxon_id = Some(survivor.id);
                self.taxa.update(WriteContext::interactive(), &node).await?;
                info!(accepted_taxon_id = survivor.id, "Synonym re-pointed");
            }
        }
        Ok(Some(survivor))
    }
}

/// A parent must be a different node of strictly coarser rank.
fn accepts_parent(node: &TaxonNode, parent: &TaxonNode) -> bool {
    parent.id != node.id && parent.rank.is_coarser_than(node.rank)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{new_taxon, MemoryStore};
    use crate::mock::{record, MockRegistry, RecordExt};
    use taxa_core::{RankKeys, TaxonomicStatus, VernacularName};

    fn resolver(store: &MemoryStore, registry: &MockRegistry) -> Resolver {
        Resolver::new(
            Arc::new(store.clone()),
            Arc::new(registry.clone()),
            ResolverConfig::default(),
        )
    }

    fn big_cats() -> MockRegistry {
        MockRegistry::new()
            .with_record(record(1, "Animalia", Rank::Kingdom))
            .with_record(record(50, "Panthera", Rank::Genus).with_parent(1))
            .with_record(
                record(100, "Panthera tigris", Rank::Species)
                    .with_parent(50)
                    .with_author("(Linnaeus, 1758)"),
            )
    }

    #[tokio::test]
    async fn test_species_resolves_with_parent_chain() {
        let store = MemoryStore::new();
        let registry = big_cats();

        let tiger = resolver(&store, &registry)
            .resolve(ResolveRequest::by_name("Panthera tigris", Rank::Species))
            .await
            .unwrap();

        assert_eq!(tiger.external_key, Some(100));
        assert_eq!(tiger.author.as_deref(), Some("(Linnaeus, 1758)"));
        assert!(tiger.legacy_names.is_empty());

        let genus = store.taxon(tiger.parent_id.unwrap()).unwrap();
        assert_eq!(genus.canonical_name, "Panthera");
        assert_eq!(genus.external_key, Some(50));
        let kingdom = store.taxon(genus.parent_id.unwrap()).unwrap();
        assert_eq!(kingdom.canonical_name, "Animalia");
        assert_eq!(kingdom.parent_id, None);
        assert_eq!(store.taxa().len(), 3);
    }

    #[tokio::test]
    async fn test_resolving_twice_is_idempotent() {
        let store = MemoryStore::new();
        let registry = big_cats();
        let resolver = resolver(&store, &registry);

        let first = resolver
            .resolve(ResolveRequest::by_name("Panthera tigris", Rank::Species))
            .await
            .unwrap();
        let second = resolver
            .resolve(ResolveRequest::by_name("Panthera tigris", Rank::Species))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.taxa().len(), 3);
    }

    #[tokio::test]
    async fn test_synonym_redirects_to_single_accepted_node() {
        let store = MemoryStore::new();
        let registry = big_cats()
            .with_record(record(900, "Felis tigris", Rank::Species).synonym_of(100));

        let node = resolver(&store, &registry)
            .resolve(ResolveRequest::by_name("Felis tigris", Rank::Species))
            .await
            .unwrap();

        assert_eq!(node.canonical_name, "Panthera tigris");
        assert_eq!(node.taxonomic_status, TaxonomicStatus::Accepted);
        assert_eq!(node.legacy_names, vec!["Felis tigris".to_string()]);
        let species: Vec<_> = store
            .taxa()
            .into_iter()
            .filter(|t| t.rank == Rank::Species)
            .collect();
        assert_eq!(species.len(), 1);
    }

    #[tokio::test]
    async fn test_nub_redirect_keeps_superseded_name() {
        let store = MemoryStore::new();
        let registry = big_cats().with_record(
            record(7001, "Panthera tigris altaica", Rank::Species)
                .with_nub(100)
                .with_parent(50),
        );

        let node = resolver(&store, &registry)
            .resolve(ResolveRequest::by_key(7001))
            .await
            .unwrap();

        assert_eq!(node.external_key, Some(100));
        assert!(node
            .legacy_names
            .contains(&"Panthera tigris altaica".to_string()));
    }

    #[tokio::test]
    async fn test_rank_key_redirect() {
        let store = MemoryStore::new();
        let mut checklist_genus = record(4000, "Panthera", Rank::Genus);
        checklist_genus.rank_keys = RankKeys {
            genus: Some(50),
            ..RankKeys::default()
        };
        let registry = big_cats()
            .with_record(checklist_genus)
            .with_name_match("Panthera", 4000);

        let node = resolver(&store, &registry)
            .resolve(ResolveRequest::by_name("Panthera", Rank::Genus))
            .await
            .unwrap();

        assert_eq!(node.external_key, Some(50));
        assert_eq!(store.taxa().iter().filter(|t| t.rank == Rank::Genus).count(), 1);
    }

    #[tokio::test]
    async fn test_fuzzy_match_keeps_misspelling() {
        let store = MemoryStore::new();
        let registry = big_cats().with_suggestion("Panthera tigirs", 100);

        let node = resolver(&store, &registry)
            .resolve(ResolveRequest::by_name("Panthera tigirs", Rank::Species))
            .await
            .unwrap();

        assert_eq!(node.canonical_name, "Panthera tigris");
        assert_eq!(node.legacy_names, vec!["Panthera tigirs".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_name_and_offline_registry_yield_none() {
        let store = MemoryStore::new();
        let registry = big_cats();
        assert!(resolver(&store, &registry)
            .resolve(ResolveRequest::by_name("Nonexistent", Rank::Species))
            .await
            .is_none());

        let offline = big_cats().offline();
        assert!(resolver(&store, &offline)
            .resolve(ResolveRequest::by_name("Panthera tigris", Rank::Species))
            .await
            .is_none());
        assert!(store.taxa().is_empty());
    }

    #[tokio::test]
    async fn test_parent_cycle_terminates_at_kingdom() {
        let store = MemoryStore::new();
        let registry = MockRegistry::new()
            .with_record(record(10, "Animalia", Rank::Kingdom).with_parent(30))
            .with_record(record(20, "Chordata", Rank::Phylum).with_parent(10))
            .with_record(record(30, "Mammalia", Rank::Class).with_parent(20));

        let class = resolver(&store, &registry)
            .resolve(ResolveRequest::by_key(30))
            .await
            .unwrap();

        let phylum = store.taxon(class.parent_id.unwrap()).unwrap();
        assert_eq!(phylum.rank, Rank::Phylum);
        let kingdom = store.taxon(phylum.parent_id.unwrap()).unwrap();
        assert_eq!(kingdom.rank, Rank::Kingdom);
        assert_eq!(kingdom.parent_id, None);
        assert_eq!(store.taxa().len(), 3);
    }

    #[tokio::test]
    async fn test_depth_bound_stops_upward_resolution() {
        let store = MemoryStore::new();
        let registry = big_cats();
        let resolver = Resolver::new(
            Arc::new(store.clone()),
            Arc::new(registry.clone()),
            ResolverConfig::default().with_max_parent_depth(1),
        );

        let tiger = resolver
            .resolve(ResolveRequest::by_key(100))
            .await
            .unwrap();

        let genus = store.taxon(tiger.parent_id.unwrap()).unwrap();
        assert_eq!(genus.parent_id, None);
        assert!(store.taxon_named("Animalia", Rank::Kingdom).is_none());
    }

    #[tokio::test]
    async fn test_children_get_explicit_parent() {
        let store = MemoryStore::new();
        let registry = big_cats()
            .with_record(record(101, "Panthera leo", Rank::Species).with_parent(50));

        let genus = resolver(&store, &registry)
            .resolve(ResolveRequest::by_name("Panthera", Rank::Genus).with_children())
            .await
            .unwrap();

        let lion = store.taxon_named("Panthera leo", Rank::Species).unwrap();
        let tiger = store.taxon_named("Panthera tigris", Rank::Species).unwrap();
        assert_eq!(lion.parent_id, Some(genus.id));
        assert_eq!(tiger.parent_id, Some(genus.id));
        // Children were requested, so the searched name is not a legacy alias.
        assert!(genus.legacy_names.is_empty());
    }

    #[tokio::test]
    async fn test_children_resolve_the_whole_subtree() {
        let store = MemoryStore::new();
        let registry = big_cats()
            .with_record(record(101, "Panthera tigris altaica", Rank::Subspecies).with_parent(100))
            .with_vernacular_names(
                101,
                vec![VernacularName {
                    name: "Amur tiger".to_string(),
                    language: Some("eng".to_string()),
                    source: None,
                }],
            );

        let genus = resolver(&store, &registry)
            .resolve(ResolveRequest::by_key(50).with_children().with_vernacular())
            .await
            .unwrap();

        let tiger = store.taxon_named("Panthera tigris", Rank::Species).unwrap();
        let amur = store
            .taxon_named("Panthera tigris altaica", Rank::Subspecies)
            .unwrap();
        assert_eq!(tiger.parent_id, Some(genus.id));
        assert_eq!(amur.parent_id, Some(tiger.id));
        assert_eq!(store.vernacular_names(amur.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_child_depth_bound_stops_downward_resolution() {
        let store = MemoryStore::new();
        let registry = big_cats()
            .with_record(record(101, "Panthera tigris altaica", Rank::Subspecies).with_parent(100));
        let resolver = Resolver::new(
            Arc::new(store.clone()),
            Arc::new(registry.clone()),
            ResolverConfig::default().with_max_child_depth(1),
        );

        resolver
            .resolve(ResolveRequest::by_key(50).with_children())
            .await
            .unwrap();

        assert!(store.taxon_named("Panthera tigris", Rank::Species).is_some());
        assert!(store
            .taxon_named("Panthera tigris altaica", Rank::Subspecies)
            .is_none());
    }

    #[tokio::test]
    async fn test_child_key_cycle_terminates() {
        let store = MemoryStore::new();
        let registry = MockRegistry::new()
            .with_record(record(10, "Panthera", Rank::Genus).with_parent(20))
            .with_record(record(20, "Panthera tigris", Rank::Species).with_parent(10));
        let resolver = Resolver::new(
            Arc::new(store.clone()),
            Arc::new(registry.clone()),
            ResolverConfig::default().with_max_child_depth(4),
        );

        let genus = resolver
            .resolve(ResolveRequest::by_key(10).with_children())
            .await
            .unwrap();

        assert_eq!(genus.parent_id, None);
        assert_eq!(store.taxa().len(), 2);
        let listings = registry
            .calls()
            .into_iter()
            .filter(|c| matches!(c, crate::mock::RegistryCall::ListChildren(_)))
            .count();
        assert_eq!(listings, 4);
    }

    #[tokio::test]
    async fn test_vernacular_names_attached_once() {
        let store = MemoryStore::new();
        let names = vec![
            VernacularName {
                name: "Tiger".to_string(),
                language: Some("eng".to_string()),
                source: None,
            },
            VernacularName {
                name: "Tigre".to_string(),
                language: Some("fra".to_string()),
                source: None,
            },
        ];
        let registry = big_cats().with_vernacular_names(100, names);
        let resolver = resolver(&store, &registry);

        for _ in 0..2 {
            resolver
                .resolve(ResolveRequest::by_key(100).with_vernacular())
                .await
                .unwrap();
        }

        let tiger = store.taxon_named("Panthera tigris", Rank::Species).unwrap();
        assert_eq!(store.vernacular_names(tiger.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_existing_duplicates_are_merged_on_resolve() {
        let store = MemoryStore::new();
        let stray = store.seed_taxon(taxa_core::NewTaxon {
            scientific_name: "Panthera tigris Linnaeus, 1758".to_string(),
            ..new_taxon("Panthera tigris", Rank::Species)
        });
        let registry = big_cats();

        let tiger = resolver(&store, &registry)
            .resolve(ResolveRequest::by_key(100))
            .await
            .unwrap();

        let species: Vec<_> = store
            .taxa()
            .into_iter()
            .filter(|t| t.rank == Rank::Species)
            .collect();
        assert_eq!(species.len(), 1);
        assert_eq!(species[0].id, tiger.id);
        assert_eq!(tiger.external_key, Some(100));
        assert_ne!(tiger.id, stray.id);
        assert!(store.taxon(stray.id).is_none());
    }

    #[tokio::test]
    async fn test_resync_parent_reassigns_moved_taxon() {
        let store = MemoryStore::new();
        let registry = big_cats()
            .with_record(record(60, "Neofelis", Rank::Genus).with_parent(1))
            .with_record(record(200, "Neofelis nebulosa", Rank::Species).with_parent(60));
        let resolver = resolver(&store, &registry);
        let panthera = resolver
            .resolve(ResolveRequest::by_key(50))
            .await
            .unwrap();
        let clouded = store.seed_taxon(taxa_core::NewTaxon {
            external_key: Some(200),
            parent_id: Some(panthera.id),
            ..new_taxon("Neofelis nebulosa", Rank::Species)
        });

        let resynced = resolver.resync_parent(&clouded).await.unwrap();

        let parent = store.taxon(resynced.parent_id.unwrap()).unwrap();
        assert_eq!(parent.canonical_name, "Neofelis");
        assert_eq!(store.taxon(clouded.id).unwrap().parent_id, Some(parent.id));
    }

    #[tokio::test]
    async fn test_resync_parent_keeps_parent_when_registry_has_none() {
        let store = MemoryStore::new();
        let registry = MockRegistry::new().with_record(record(100, "Panthera tigris", Rank::Species));
        let genus = store.seed_taxon(new_taxon("Panthera", Rank::Genus));
        let tiger = store.seed_taxon(taxa_core::NewTaxon {
            external_key: Some(100),
            parent_id: Some(genus.id),
            ..new_taxon("Panthera tigris", Rank::Species)
        });

        let resynced = resolver(&store, &registry)
            .resync_parent(&tiger)
            .await
            .unwrap();

        assert_eq!(resynced.parent_id, Some(genus.id));
    }

    #[tokio::test]
    async fn test_resync_parent_rejects_finer_registry_parent() {
        let store = MemoryStore::new();
        let registry = MockRegistry::new()
            .with_record(record(100, "Panthera", Rank::Genus).with_parent(200))
            .with_record(record(200, "Panthera tigris altaica", Rank::Subspecies));
        let kingdom = store.seed_taxon(new_taxon("Animalia", Rank::Kingdom));
        let genus = store.seed_taxon(taxa_core::NewTaxon {
            external_key: Some(100),
            parent_id: Some(kingdom.id),
            ..new_taxon("Panthera", Rank::Genus)
        });

        let resynced = resolver(&store, &registry)
            .resync_parent(&genus)
            .await
            .unwrap();

        assert_eq!(resynced.parent_id, Some(kingdom.id));
        assert_eq!(store.taxon(genus.id).unwrap().parent_id, Some(kingdom.id));
    }

    #[tokio::test]
    async fn test_resync_synonym_points_at_accepted_survivor() {
        let store = MemoryStore::new();
        let registry = big_cats()
            .with_record(record(900, "Felis tigris", Rank::Species).synonym_of(100));
        let synonym = store.seed_taxon(taxa_core::NewTaxon {
            taxonomic_status: TaxonomicStatus::Synonym,
            external_key: Some(900),
            ..new_taxon("Felis tigris", Rank::Species)
        });

        let accepted = resolver(&store, &registry)
            .resync_synonym(&synonym)
            .await
            .unwrap();

        assert_eq!(accepted.canonical_name, "Panthera tigris");
        assert!(accepted.taxonomic_status.is_accepted());
        assert_eq!(
            store.taxon(synonym.id).unwrap().accepted_taxon_id,
            Some(accepted.id)
        );
    }

    #[tokio::test]
    async fn test_resync_synonym_returns_accepted_node_unchanged() {
        let store = MemoryStore::new();
        let registry = MockRegistry::new();
        let node = store.seed_taxon(new_taxon("Panthera", Rank::Genus));

        let same = resolver(&store, &registry).resync_synonym(&node).await.unwrap();

        assert_eq!(same.id, node.id);
        assert!(registry.calls().is_empty());
    }
}
