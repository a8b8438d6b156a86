//! In-memory repositories for deterministic testing.
//!
//! [`MemoryStore`] implements the taxon, site and occurrence repositories
//! over one shared state. Units of work operate on a private copy of that
//! state and swap it in on commit, so an uncommitted or rolled-back unit of
//! work leaves no trace. Deleting a taxon that is still referenced fails, the
//! way a foreign key would.
//!
//! ```ignore
//! let store = MemoryStore::new();
//! let tiger = store.seed_taxon(new_taxon("Panthera tigris", Rank::Species));
//! store.add_group_member(tiger.id, "big-cats");
//! store.fail_class(RelationClass::ReferenceLinks);
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use taxa_core::{
    Error, GeoPoint, NewSite, NewTaxon, OccurrenceRecord, OccurrenceRepository,
    OccurrenceUnitOfWork, OccurrenceUpsert, Rank, RelationClass, Result, Site, SiteRepository,
    TaxonIdentity, TaxonNode, TaxonRepository, TaxonUnitOfWork, TaxonomicStatus, VernacularName,
    WriteContext,
};

/// Creation request for an accepted taxon whose scientific and canonical
/// names are both `name`.
pub fn new_taxon(name: &str, rank: Rank) -> NewTaxon {
    NewTaxon {
        scientific_name: name.to_string(),
        canonical_name: name.to_string(),
        author: None,
        rank,
        taxonomic_status: TaxonomicStatus::Accepted,
        external_key: None,
        legacy_names: Vec::new(),
        parent_id: None,
        accepted_taxon_id: None,
        raw: None,
    }
}

trait LinkedRow {
    fn id(&self) -> i64;
    fn taxon_id(&self) -> i64;
    fn set_taxon_id(&mut self, taxon_id: i64);
    /// Value that must be unique per taxon, if any.
    fn dedupe_key(&self) -> Option<String>;
}

#[derive(Debug, Clone)]
struct VernacularRow {
    id: i64,
    taxon_id: i64,
    name: VernacularName,
}

impl LinkedRow for VernacularRow {
    fn id(&self) -> i64 {
        self.id
    }
    fn taxon_id(&self) -> i64 {
        self.taxon_id
    }
    fn set_taxon_id(&mut self, taxon_id: i64) {
        self.taxon_id = taxon_id;
    }
    fn dedupe_key(&self) -> Option<String> {
        Some(vernacular_key(&self.name))
    }
}

/// Group membership, reference link or update proposal.
#[derive(Debug, Clone)]
struct LinkRow {
    id: i64,
    taxon_id: i64,
    label: String,
    unique: bool,
}

impl LinkedRow for LinkRow {
    fn id(&self) -> i64 {
        self.id
    }
    fn taxon_id(&self) -> i64 {
        self.taxon_id
    }
    fn set_taxon_id(&mut self, taxon_id: i64) {
        self.taxon_id = taxon_id;
    }
    fn dedupe_key(&self) -> Option<String> {
        self.unique.then(|| self.label.clone())
    }
}

fn vernacular_key(name: &VernacularName) -> String {
    format!(
        "{}|{}",
        name.name.to_lowercase(),
        name.language.as_deref().unwrap_or_default()
    )
}

/// Re-point loser rows to the survivor.
fn repoint<T: LinkedRow>(rows: &mut [T], losers: &[i64], survivor: i64) -> u64 {
    let mut moved = 0;
    for row in rows.iter_mut().filter(|r| losers.contains(&r.taxon_id())) {
        row.set_taxon_id(survivor);
        moved += 1;
    }
    moved
}

/// Drop loser rows colliding with a survivor row (or an older loser row)
/// on their unique key, then re-point the rest.
fn repoint_unique<T: LinkedRow>(rows: &mut Vec<T>, losers: &[i64], survivor: i64) -> u64 {
    let owners: Vec<(i64, i64, Option<String>)> = rows
        .iter()
        .map(|r| (r.id(), r.taxon_id(), r.dedupe_key()))
        .collect();

    rows.retain(|row| {
        let Some(key) = row.dedupe_key() else {
            return true;
        };
        if !losers.contains(&row.taxon_id()) {
            return true;
        }
        !owners.iter().any(|(id, taxon_id, other)| {
            other.as_deref() == Some(key.as_str())
                && (*taxon_id == survivor || (losers.contains(taxon_id) && *id < row.id()))
        })
    });
    repoint(rows, losers, survivor)
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    next_id: i64,
    taxa: BTreeMap<i64, TaxonNode>,
    vernacular_names: Vec<VernacularRow>,
    group_members: Vec<LinkRow>,
    reference_links: Vec<LinkRow>,
    update_proposals: Vec<LinkRow>,
    sites: BTreeMap<i64, Site>,
    occurrences: BTreeMap<i64, OccurrenceRecord>,
    failing_classes: HashSet<RelationClass>,
    /// Site ids passed to each explicit `refresh_summaries` call.
    refresh_calls: Vec<Vec<i64>>,
    /// Commits of interactive occurrence units of work that refreshed sites.
    interactive_refreshes: u64,
}

impl MemoryState {
    fn alloc_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn links(&self, class: RelationClass) -> Option<&Vec<LinkRow>> {
        match class {
            RelationClass::GroupMemberships => Some(&self.group_members),
            RelationClass::ReferenceLinks => Some(&self.reference_links),
            RelationClass::UpdateProposals => Some(&self.update_proposals),
            _ => None,
        }
    }

    fn count_references(&self, class: RelationClass, taxon_id: i64) -> u64 {
        let count = match class {
            RelationClass::Occurrences => self
                .occurrences
                .values()
                .filter(|o| o.taxon_id == taxon_id)
                .count(),
            RelationClass::VernacularNames => self
                .vernacular_names
                .iter()
                .filter(|v| v.taxon_id == taxon_id)
                .count(),
            RelationClass::ChildTaxa => self
                .taxa
                .values()
                .filter(|t| t.parent_id == Some(taxon_id))
                .count(),
            RelationClass::SynonymTaxa => self
                .taxa
                .values()
                .filter(|t| t.accepted_taxon_id == Some(taxon_id))
                .count(),
            _ => self
                .links(class)
                .map(|rows| rows.iter().filter(|l| l.taxon_id == taxon_id).count())
                .unwrap_or_default(),
        };
        count as u64
    }

    fn migrate(&mut self, class: RelationClass, losers: &[i64], survivor: i64) -> u64 {
        let now = Utc::now();
        match class {
            RelationClass::Occurrences => {
                let mut moved = 0;
                for occurrence in self
                    .occurrences
                    .values_mut()
                    .filter(|o| losers.contains(&o.taxon_id))
                {
                    occurrence.taxon_id = survivor;
                    occurrence.updated_at = now;
                    moved += 1;
                }
                moved
            }
            RelationClass::GroupMemberships => {
                repoint_unique(&mut self.group_members, losers, survivor)
            }
            RelationClass::VernacularNames => {
                repoint_unique(&mut self.vernacular_names, losers, survivor)
            }
            RelationClass::ReferenceLinks => repoint(&mut self.reference_links, losers, survivor),
            RelationClass::UpdateProposals => {
                repoint(&mut self.update_proposals, losers, survivor)
            }
            RelationClass::ChildTaxa | RelationClass::SynonymTaxa => {
                let mut moved = 0;
                for taxon in self.taxa.values_mut().filter(|t| t.id != survivor) {
                    let pointer = if class == RelationClass::ChildTaxa {
                        &mut taxon.parent_id
                    } else {
                        &mut taxon.accepted_taxon_id
                    };
                    if pointer.is_some_and(|p| losers.contains(&p)) {
                        *pointer = Some(survivor);
                        taxon.updated_at = now;
                        moved += 1;
                    }
                }
                moved
            }
        }
    }

    fn detach(&mut self, class: RelationClass, losers: &[i64]) -> u64 {
        fn drop_rows<T: LinkedRow>(rows: &mut Vec<T>, losers: &[i64]) -> u64 {
            let before = rows.len();
            rows.retain(|r| !losers.contains(&r.taxon_id()));
            (before - rows.len()) as u64
        }

        match class {
            RelationClass::Occurrences => {
                let before = self.occurrences.len();
                self.occurrences.retain(|_, o| !losers.contains(&o.taxon_id));
                (before - self.occurrences.len()) as u64
            }
            RelationClass::GroupMemberships => drop_rows(&mut self.group_members, losers),
            RelationClass::VernacularNames => drop_rows(&mut self.vernacular_names, losers),
            RelationClass::ReferenceLinks => drop_rows(&mut self.reference_links, losers),
            RelationClass::UpdateProposals => drop_rows(&mut self.update_proposals, losers),
            RelationClass::ChildTaxa | RelationClass::SynonymTaxa => {
                let mut cleared = 0;
                for taxon in self.taxa.values_mut() {
                    let pointer = if class == RelationClass::ChildTaxa {
                        &mut taxon.parent_id
                    } else {
                        &mut taxon.accepted_taxon_id
                    };
                    if pointer.is_some_and(|p| losers.contains(&p)) {
                        *pointer = None;
                        cleared += 1;
                    }
                }
                cleared
            }
        }
    }

    fn write_taxon(&mut self, taxon: &TaxonNode) -> Result<()> {
        if taxon.taxonomic_status.is_accepted() && taxon.accepted_taxon_id.is_some() {
            return Err(Error::InvalidInput(format!(
                "accepted taxon {} cannot reference an accepted taxon",
                taxon.id
            )));
        }
        let stored = self
            .taxa
            .get_mut(&taxon.id)
            .ok_or(Error::TaxonNotFound(taxon.id))?;
        let created_at = stored.created_at;
        *stored = taxon.clone();
        stored.created_at = created_at;
        stored.updated_at = Utc::now();
        Ok(())
    }

    fn delete_taxa(&mut self, ids: &[i64]) -> Result<u64> {
        for &id in ids {
            for class in RelationClass::ALL {
                let blocking = match class {
                    // References held by taxa deleted in the same call do not count.
                    RelationClass::ChildTaxa => self
                        .taxa
                        .values()
                        .any(|t| t.parent_id == Some(id) && !ids.contains(&t.id)),
                    RelationClass::SynonymTaxa => self
                        .taxa
                        .values()
                        .any(|t| t.accepted_taxon_id == Some(id) && !ids.contains(&t.id)),
                    _ => self.count_references(class, id) > 0,
                };
                if blocking {
                    return Err(Error::Internal(format!(
                        "taxon {} is still referenced by {}",
                        id, class
                    )));
                }
            }
        }

        let before = self.taxa.len();
        self.taxa.retain(|id, _| !ids.contains(id));
        Ok((before - self.taxa.len()) as u64)
    }

    fn refresh_summaries(&mut self, site_ids: &[i64]) {
        for &site_id in site_ids {
            let (count, last) = self
                .occurrences
                .values()
                .filter(|o| o.site_id == site_id)
                .fold((0i64, None), |(count, last), o| {
                    (count + 1, last.max(o.collection_date))
                });
            if let Some(site) = self.sites.get_mut(&site_id) {
                site.occurrence_count = count;
                site.last_observed = last;
            }
        }
    }

    fn insert_occurrence(&mut self, record: &OccurrenceUpsert) -> Result<i64> {
        if !self.taxa.contains_key(&record.taxon_id) {
            return Err(Error::TaxonNotFound(record.taxon_id));
        }
        if !self.sites.contains_key(&record.site_id) {
            return Err(Error::NotFound(format!("site {}", record.site_id)));
        }
        let id = self.alloc_id();
        self.occurrences.insert(id, occurrence_from_upsert(id, record));
        Ok(id)
    }
}

fn occurrence_from_upsert(id: i64, record: &OccurrenceUpsert) -> OccurrenceRecord {
    OccurrenceRecord {
        id,
        upstream_id: record.upstream_id.clone(),
        source: record.source.clone(),
        taxon_id: record.taxon_id,
        site_id: record.site_id,
        collection_date: record.collection_date,
        collector: record.collector.clone(),
        institution_code: record.institution_code.clone(),
        species_name: record.species_name.clone(),
        reference_url: record.reference_url.clone(),
        owner: record.owner.clone(),
        origin_category: record.origin_category,
        habitat: record.habitat.clone(),
        validated: record.validated,
        externally_sourced: record.externally_sourced,
        additional_data: record.additional_data.clone(),
        updated_at: Utc::now(),
    }
}

/// Shared in-memory taxon, site and occurrence store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self) -> MemoryState {
        self.lock().clone()
    }

    fn swap_in(&self, state: MemoryState) {
        *self.lock() = state;
    }

    /// Make every migration of `class` fail until cleared.
    pub fn fail_class(&self, class: RelationClass) {
        self.lock().failing_classes.insert(class);
    }

    pub fn clear_failures(&self) {
        self.lock().failing_classes.clear();
    }

    // ---- seeding -------------------------------------------------------

    /// Insert a taxon directly.
    pub fn seed_taxon(&self, taxon: NewTaxon) -> TaxonNode {
        let mut state = self.lock();
        let id = state.alloc_id();
        let now = Utc::now();
        let node = TaxonNode {
            id,
            scientific_name: taxon.scientific_name,
            canonical_name: taxon.canonical_name,
            author: taxon.author,
            rank: taxon.rank,
            taxonomic_status: taxon.taxonomic_status,
            external_key: taxon.external_key,
            legacy_names: taxon.legacy_names,
            parent_id: taxon.parent_id,
            accepted_taxon_id: taxon.accepted_taxon_id,
            raw: taxon.raw,
            created_at: now,
            updated_at: now,
        };
        state.taxa.insert(id, node.clone());
        node
    }

    pub fn add_group_member(&self, taxon_id: i64, group: &str) -> i64 {
        let mut state = self.lock();
        let id = state.alloc_id();
        state.group_members.push(LinkRow {
            id,
            taxon_id,
            label: group.to_string(),
            unique: true,
        });
        id
    }

    pub fn add_reference_link(&self, taxon_id: i64, url: &str) -> i64 {
        let mut state = self.lock();
        let id = state.alloc_id();
        state.reference_links.push(LinkRow {
            id,
            taxon_id,
            label: url.to_string(),
            unique: false,
        });
        id
    }

    pub fn add_update_proposal(&self, taxon_id: i64, summary: &str) -> i64 {
        let mut state = self.lock();
        let id = state.alloc_id();
        state.update_proposals.push(LinkRow {
            id,
            taxon_id,
            label: summary.to_string(),
            unique: false,
        });
        id
    }

    pub fn seed_site(&self, site: NewSite) -> Site {
        let mut state = self.lock();
        let id = state.alloc_id();
        let site = Site {
            id,
            point: site.point,
            name: site.name,
            description: site.description,
            location_type: site.location_type,
            occurrence_count: 0,
            last_observed: None,
        };
        state.sites.insert(id, site.clone());
        site
    }

    /// Insert an occurrence without any upstream-id check, so tests can
    /// stage historical duplicates.
    pub fn seed_occurrence(&self, record: &OccurrenceUpsert) -> Result<i64> {
        self.lock().insert_occurrence(record)
    }

    // ---- inspection ----------------------------------------------------

    pub fn taxa(&self) -> Vec<TaxonNode> {
        self.lock().taxa.values().cloned().collect()
    }

    pub fn taxon(&self, id: i64) -> Option<TaxonNode> {
        self.lock().taxa.get(&id).cloned()
    }

    /// First taxon (lowest id) with the given canonical name and rank.
    pub fn taxon_named(&self, canonical_name: &str, rank: Rank) -> Option<TaxonNode> {
        self.lock()
            .taxa
            .values()
            .find(|t| t.canonical_name == canonical_name && t.rank == rank)
            .cloned()
    }

    pub fn sites(&self) -> Vec<Site> {
        self.lock().sites.values().cloned().collect()
    }

    pub fn occurrences(&self) -> Vec<OccurrenceRecord> {
        self.lock().occurrences.values().cloned().collect()
    }

    pub fn occurrence_count(&self) -> usize {
        self.lock().occurrences.len()
    }

    /// Site ids passed to each explicit summary refresh.
    pub fn refresh_calls(&self) -> Vec<Vec<i64>> {
        self.lock().refresh_calls.clone()
    }

    pub fn interactive_refreshes(&self) -> u64 {
        self.lock().interactive_refreshes
    }

    pub fn group_members(&self, taxon_id: i64) -> Vec<String> {
        self.lock()
            .group_members
            .iter()
            .filter(|l| l.taxon_id == taxon_id)
            .map(|l| l.label.clone())
            .collect()
    }

    /// References of every class pointing at a taxon.
    pub fn total_references(&self, taxon_id: i64) -> u64 {
        let state = self.lock();
        RelationClass::ALL
            .iter()
            .map(|class| state.count_references(*class, taxon_id))
            .sum()
    }
}

#[async_trait]
impl TaxonRepository for MemoryStore {
    async fn get(&self, id: i64) -> Result<Option<TaxonNode>> {
        Ok(self.taxon(id))
    }

    async fn find_by_external_key(&self, key: i64) -> Result<Option<TaxonNode>> {
        Ok(self
            .lock()
            .taxa
            .values()
            .find(|t| t.external_key == Some(key))
            .cloned())
    }

    async fn find_by_identity(&self, identity: &TaxonIdentity) -> Result<Vec<TaxonNode>> {
        Ok(self
            .lock()
            .taxa
            .values()
            .filter(|t| t.identity() == *identity)
            .cloned()
            .collect())
    }

    async fn find_merge_candidates(&self, name: &str, rank: Rank) -> Result<Vec<TaxonNode>> {
        let needle = name.to_lowercase();
        Ok(self
            .lock()
            .taxa
            .values()
            .filter(|t| t.rank == rank)
            .filter(|t| {
                t.canonical_name.to_lowercase() == needle
                    || t
                        .legacy_names_joined()
                        .is_some_and(|joined| joined.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect())
    }

    async fn insert(&self, _ctx: WriteContext, taxon: NewTaxon) -> Result<TaxonNode> {
        if taxon.taxonomic_status.is_accepted() && taxon.accepted_taxon_id.is_some() {
            return Err(Error::InvalidInput(
                "accepted taxon cannot reference an accepted taxon".to_string(),
            ));
        }
        Ok(self.seed_taxon(taxon))
    }

    async fn update(&self, _ctx: WriteContext, taxon: &TaxonNode) -> Result<()> {
        self.lock().write_taxon(taxon)
    }

    async fn add_vernacular_names(
        &self,
        taxon_id: i64,
        names: &[VernacularName],
    ) -> Result<u64> {
        let mut state = self.lock();
        if !state.taxa.contains_key(&taxon_id) {
            return Err(Error::TaxonNotFound(taxon_id));
        }
        let mut added = 0;
        for name in names {
            let key = vernacular_key(name);
            let exists = state
                .vernacular_names
                .iter()
                .any(|v| v.taxon_id == taxon_id && vernacular_key(&v.name) == key);
            if !exists {
                let id = state.alloc_id();
                state.vernacular_names.push(VernacularRow {
                    id,
                    taxon_id,
                    name: name.clone(),
                });
                added += 1;
            }
        }
        Ok(added)
    }

    async fn vernacular_names(&self, taxon_id: i64) -> Result<Vec<VernacularName>> {
        Ok(self
            .lock()
            .vernacular_names
            .iter()
            .filter(|v| v.taxon_id == taxon_id)
            .map(|v| v.name.clone())
            .collect())
    }

    async fn count_references(&self, class: RelationClass, taxon_id: i64) -> Result<u64> {
        Ok(self.lock().count_references(class, taxon_id))
    }

    async fn begin(&self) -> Result<Box<dyn TaxonUnitOfWork>> {
        Ok(Box::new(MemoryTaxonUnitOfWork {
            store: self.clone(),
            working: self.snapshot(),
        }))
    }
}

/// Merge unit of work over a private copy of the store.
pub struct MemoryTaxonUnitOfWork {
    store: MemoryStore,
    working: MemoryState,
}

#[async_trait]
impl TaxonUnitOfWork for MemoryTaxonUnitOfWork {
    async fn migrate_references(
        &mut self,
        class: RelationClass,
        losers: &[i64],
        survivor: i64,
    ) -> Result<u64> {
        if self.working.failing_classes.contains(&class) {
            return Err(Error::Internal(format!("injected failure migrating {}", class)));
        }
        Ok(self.working.migrate(class, losers, survivor))
    }

    async fn detach_references(&mut self, class: RelationClass, losers: &[i64]) -> Result<u64> {
        Ok(self.working.detach(class, losers))
    }

    async fn update_taxon(&mut self, taxon: &TaxonNode) -> Result<()> {
        self.working.write_taxon(taxon)
    }

    async fn delete_taxa(&mut self, ids: &[i64]) -> Result<u64> {
        self.working.delete_taxa(ids)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.store.swap_in(this.working);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SiteRepository for MemoryStore {
    async fn find_within(&self, point: GeoPoint, radius_m: f64) -> Result<Option<Site>> {
        let radius_m = radius_m.max(0.0);
        Ok(self
            .lock()
            .sites
            .values()
            .map(|s| (s.point.distance_m(&point), s))
            .filter(|(distance, _)| *distance <= radius_m)
            .min_by(|(a, sa), (b, sb)| a.total_cmp(b).then(sa.id.cmp(&sb.id)))
            .map(|(_, s)| s.clone()))
    }

    async fn create(&self, _ctx: WriteContext, site: NewSite) -> Result<Site> {
        Ok(self.seed_site(site))
    }

    async fn get(&self, id: i64) -> Result<Option<Site>> {
        Ok(self.lock().sites.get(&id).cloned())
    }

    async fn refresh_summaries(&self, site_ids: &[i64]) -> Result<()> {
        let mut state = self.lock();
        state.refresh_summaries(site_ids);
        state.refresh_calls.push(site_ids.to_vec());
        Ok(())
    }
}

#[async_trait]
impl OccurrenceRepository for MemoryStore {
    async fn find_by_upstream_id(
        &self,
        source: &str,
        upstream_id: &str,
    ) -> Result<Vec<OccurrenceRecord>> {
        Ok(self
            .lock()
            .occurrences
            .values()
            .filter(|o| o.source == source && o.upstream_id == upstream_id)
            .cloned()
            .collect())
    }

    async fn list_for_taxon(&self, taxon_id: i64) -> Result<Vec<OccurrenceRecord>> {
        Ok(self
            .lock()
            .occurrences
            .values()
            .filter(|o| o.taxon_id == taxon_id)
            .cloned()
            .collect())
    }

    async fn begin(&self, ctx: WriteContext) -> Result<Box<dyn OccurrenceUnitOfWork>> {
        Ok(Box::new(MemoryOccurrenceUnitOfWork {
            store: self.clone(),
            working: self.snapshot(),
            ctx,
            touched_sites: Vec::new(),
        }))
    }
}

/// Occurrence upsert unit of work over a private copy of the store.
pub struct MemoryOccurrenceUnitOfWork {
    store: MemoryStore,
    working: MemoryState,
    ctx: WriteContext,
    touched_sites: Vec<i64>,
}

impl MemoryOccurrenceUnitOfWork {
    fn touch(&mut self, site_id: i64) {
        if !self.touched_sites.contains(&site_id) {
            self.touched_sites.push(site_id);
        }
    }
}

#[async_trait]
impl OccurrenceUnitOfWork for MemoryOccurrenceUnitOfWork {
    async fn find_by_upstream_id(
        &mut self,
        source: &str,
        upstream_id: &str,
    ) -> Result<Vec<OccurrenceRecord>> {
        Ok(self
            .working
            .occurrences
            .values()
            .filter(|o| o.source == source && o.upstream_id == upstream_id)
            .cloned()
            .collect())
    }

    async fn insert(&mut self, record: &OccurrenceUpsert) -> Result<i64> {
        let id = self.working.insert_occurrence(record)?;
        self.touch(record.site_id);
        Ok(id)
    }

    async fn update(&mut self, id: i64, record: &OccurrenceUpsert) -> Result<()> {
        let previous_site = self
            .working
            .occurrences
            .get(&id)
            .map(|o| o.site_id)
            .ok_or_else(|| Error::NotFound(format!("occurrence {}", id)))?;
        if !self.working.sites.contains_key(&record.site_id) {
            return Err(Error::NotFound(format!("site {}", record.site_id)));
        }
        self.working
            .occurrences
            .insert(id, occurrence_from_upsert(id, record));
        self.touch(previous_site);
        self.touch(record.site_id);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = *self;
        if !this.ctx.bulk_mode && !this.touched_sites.is_empty() {
            this.working.refresh_summaries(&this.touched_sites);
            this.working.interactive_refreshes += 1;
        }
        this.store.swap_in(this.working);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
