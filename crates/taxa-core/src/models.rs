//! Domain models for taxonomic resolution and occurrence harvesting.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::defaults::LEGACY_NAME_SEPARATOR;
use crate::error::Error;

// =============================================================================
// TAXONOMY
// =============================================================================

/// Taxonomic rank, ordered from coarsest to finest.
///
/// The derived `Ord` follows declaration order, so `Rank::Kingdom < Rank::Species`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Rank {
    Kingdom,
    Phylum,
    Class,
    Order,
    Superfamily,
    Family,
    Subfamily,
    Tribe,
    Genus,
    Subgenus,
    Species,
    Subspecies,
    Variety,
    Form,
}

impl Rank {
    /// Upper-case registry spelling of the rank.
    pub fn as_str(&self) -> &'static str {
        match self {
            Rank::Kingdom => "KINGDOM",
            Rank::Phylum => "PHYLUM",
            Rank::Class => "CLASS",
            Rank::Order => "ORDER",
            Rank::Superfamily => "SUPERFAMILY",
            Rank::Family => "FAMILY",
            Rank::Subfamily => "SUBFAMILY",
            Rank::Tribe => "TRIBE",
            Rank::Genus => "GENUS",
            Rank::Subgenus => "SUBGENUS",
            Rank::Species => "SPECIES",
            Rank::Subspecies => "SUBSPECIES",
            Rank::Variety => "VARIETY",
            Rank::Form => "FORM",
        }
    }

    /// True when `self` sits strictly above `other` in the hierarchy.
    pub fn is_coarser_than(&self, other: Rank) -> bool {
        *self < other
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Rank {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "KINGDOM" => Ok(Rank::Kingdom),
            "PHYLUM" => Ok(Rank::Phylum),
            "CLASS" => Ok(Rank::Class),
            "ORDER" => Ok(Rank::Order),
            "SUPERFAMILY" => Ok(Rank::Superfamily),
            "FAMILY" => Ok(Rank::Family),
            "SUBFAMILY" => Ok(Rank::Subfamily),
            "TRIBE" => Ok(Rank::Tribe),
            "GENUS" => Ok(Rank::Genus),
            "SUBGENUS" => Ok(Rank::Subgenus),
            "SPECIES" => Ok(Rank::Species),
            "SUBSPECIES" => Ok(Rank::Subspecies),
            "VARIETY" => Ok(Rank::Variety),
            "FORM" => Ok(Rank::Form),
            other => Err(Error::InvalidInput(format!("Unknown rank: {}", other))),
        }
    }
}

/// Nomenclatural status reported by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaxonomicStatus {
    Accepted,
    Synonym,
    HeterotypicSynonym,
    HomotypicSynonym,
    ProparteSynonym,
    Misapplied,
    Doubtful,
}

impl TaxonomicStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaxonomicStatus::Accepted => "ACCEPTED",
            TaxonomicStatus::Synonym => "SYNONYM",
            TaxonomicStatus::HeterotypicSynonym => "HETEROTYPIC_SYNONYM",
            TaxonomicStatus::HomotypicSynonym => "HOMOTYPIC_SYNONYM",
            TaxonomicStatus::ProparteSynonym => "PROPARTE_SYNONYM",
            TaxonomicStatus::Misapplied => "MISAPPLIED",
            TaxonomicStatus::Doubtful => "DOUBTFUL",
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, TaxonomicStatus::Accepted)
    }

    /// Any synonym flavour (plain, hetero-, homo-, pro parte).
    pub fn is_synonym(&self) -> bool {
        matches!(
            self,
            TaxonomicStatus::Synonym
                | TaxonomicStatus::HeterotypicSynonym
                | TaxonomicStatus::HomotypicSynonym
                | TaxonomicStatus::ProparteSynonym
        )
    }
}

impl fmt::Display for TaxonomicStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaxonomicStatus {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace(' ', "_").as_str() {
            "ACCEPTED" => Ok(TaxonomicStatus::Accepted),
            "SYNONYM" => Ok(TaxonomicStatus::Synonym),
            "HETEROTYPIC_SYNONYM" => Ok(TaxonomicStatus::HeterotypicSynonym),
            "HOMOTYPIC_SYNONYM" => Ok(TaxonomicStatus::HomotypicSynonym),
            "PROPARTE_SYNONYM" => Ok(TaxonomicStatus::ProparteSynonym),
            "MISAPPLIED" => Ok(TaxonomicStatus::Misapplied),
            "DOUBTFUL" => Ok(TaxonomicStatus::Doubtful),
            other => Err(Error::InvalidInput(format!(
                "Unknown taxonomic status: {}",
                other
            ))),
        }
    }
}

/// One taxonomic name at one rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonNode {
    pub id: i64,
    pub scientific_name: String,
    pub canonical_name: String,
    pub author: Option<String>,
    pub rank: Rank,
    pub taxonomic_status: TaxonomicStatus,
    pub external_key: Option<i64>,
    /// Superseded canonical names merged into this node, in insertion order.
    pub legacy_names: Vec<String>,
    pub parent_id: Option<i64>,
    /// Set only when the node is a synonym.
    pub accepted_taxon_id: Option<i64>,
    /// Raw registry payload, kept for audit and re-derivation.
    pub raw: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaxonNode {
    /// Append a legacy alias, ignoring blanks, duplicates (case-insensitive)
    /// and the node's own canonical name. Returns true when the set changed.
    pub fn add_legacy_name(&mut self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty()
            || name.contains(LEGACY_NAME_SEPARATOR)
            || name.eq_ignore_ascii_case(&self.canonical_name)
            || self
                .legacy_names
                .iter()
                .any(|existing| existing.eq_ignore_ascii_case(name))
        {
            return false;
        }
        self.legacy_names.push(name.to_string());
        true
    }

    /// Legacy names in their persisted, semicolon-joined form.
    pub fn legacy_names_joined(&self) -> Option<String> {
        join_legacy_names(&self.legacy_names)
    }

    /// The duplicate-detection identity of this node.
    pub fn identity(&self) -> TaxonIdentity {
        TaxonIdentity {
            scientific_name: self.scientific_name.clone(),
            canonical_name: self.canonical_name.clone(),
            taxonomic_status: self.taxonomic_status,
            rank: self.rank,
        }
    }
}

/// Split a persisted legacy-name column into its ordered, de-duplicated set.
pub fn split_legacy_names(joined: Option<&str>) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for part in joined.unwrap_or_default().split(LEGACY_NAME_SEPARATOR) {
        let part = part.trim();
        if !part.is_empty() && !names.iter().any(|n| n.eq_ignore_ascii_case(part)) {
            names.push(part.to_string());
        }
    }
    names
}

/// Join legacy names for persistence; `None` when the set is empty.
pub fn join_legacy_names(names: &[String]) -> Option<String> {
    if names.is_empty() {
        None
    } else {
        Some(names.join(&LEGACY_NAME_SEPARATOR.to_string()))
    }
}

/// The tuple no two persisted taxa may share.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaxonIdentity {
    pub scientific_name: String,
    pub canonical_name: String,
    pub taxonomic_status: TaxonomicStatus,
    pub rank: Rank,
}

/// Request for creating a taxon.
#[derive(Debug, Clone)]
pub struct NewTaxon {
    pub scientific_name: String,
    pub canonical_name: String,
    pub author: Option<String>,
    pub rank: Rank,
    pub taxonomic_status: TaxonomicStatus,
    pub external_key: Option<i64>,
    pub legacy_names: Vec<String>,
    pub parent_id: Option<i64>,
    pub accepted_taxon_id: Option<i64>,
    pub raw: Option<JsonValue>,
}

impl NewTaxon {
    /// Build a creation request from a registry record.
    pub fn from_record(record: &RegistryRecord) -> Self {
        Self {
            scientific_name: record.scientific_name.clone(),
            canonical_name: record.canonical_name.clone(),
            author: record.authorship.clone(),
            rank: record.rank,
            taxonomic_status: record.taxonomic_status,
            external_key: Some(record.key),
            legacy_names: Vec::new(),
            parent_id: None,
            accepted_taxon_id: None,
            raw: record.raw.clone(),
        }
    }

    pub fn identity(&self) -> TaxonIdentity {
        TaxonIdentity {
            scientific_name: self.scientific_name.clone(),
            canonical_name: self.canonical_name.clone(),
            taxonomic_status: self.taxonomic_status,
            rank: self.rank,
        }
    }
}

/// Common name of a taxon in one language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VernacularName {
    pub name: String,
    pub language: Option<String>,
    pub source: Option<String>,
}

/// Every relation that holds a reference to a taxon node.
///
/// Merging must re-point all of them before losers are deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationClass {
    Occurrences,
    GroupMemberships,
    VernacularNames,
    ReferenceLinks,
    UpdateProposals,
    ChildTaxa,
    SynonymTaxa,
}

impl RelationClass {
    /// All relation classes, in migration order.
    pub const ALL: [RelationClass; 7] = [
        RelationClass::Occurrences,
        RelationClass::GroupMemberships,
        RelationClass::VernacularNames,
        RelationClass::ReferenceLinks,
        RelationClass::UpdateProposals,
        RelationClass::ChildTaxa,
        RelationClass::SynonymTaxa,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationClass::Occurrences => "occurrences",
            RelationClass::GroupMemberships => "group_memberships",
            RelationClass::VernacularNames => "vernacular_names",
            RelationClass::ReferenceLinks => "reference_links",
            RelationClass::UpdateProposals => "update_proposals",
            RelationClass::ChildTaxa => "child_taxa",
            RelationClass::SynonymTaxa => "synonym_taxa",
        }
    }
}

impl fmt::Display for RelationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a completed merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeReport {
    pub survivor_id: i64,
    pub removed_ids: Vec<i64>,
    /// References re-pointed per relation class.
    pub migrated: Vec<(RelationClass, u64)>,
    /// Classes whose migration failed and were scavenged instead.
    pub failed_classes: Vec<RelationClass>,
}

// =============================================================================
// REGISTRY PAYLOADS
// =============================================================================

/// Rank-specific keys carried by a registry record (`genusKey`, …).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankKeys {
    pub kingdom: Option<i64>,
    pub phylum: Option<i64>,
    pub class: Option<i64>,
    pub order: Option<i64>,
    pub family: Option<i64>,
    pub genus: Option<i64>,
    pub subgenus: Option<i64>,
    pub species: Option<i64>,
}

impl RankKeys {
    /// The key the registry files under `rank`, when it reports one.
    pub fn for_rank(&self, rank: Rank) -> Option<i64> {
        match rank {
            Rank::Kingdom => self.kingdom,
            Rank::Phylum => self.phylum,
            Rank::Class => self.class,
            Rank::Order => self.order,
            Rank::Family => self.family,
            Rank::Genus => self.genus,
            Rank::Subgenus => self.subgenus,
            Rank::Species => self.species,
            _ => None,
        }
    }
}

/// A taxon as reported by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub key: i64,
    /// The registry's authoritative ("nub") key for this name.
    pub nub_key: Option<i64>,
    pub accepted_key: Option<i64>,
    pub parent_key: Option<i64>,
    pub rank_keys: RankKeys,
    pub scientific_name: String,
    pub canonical_name: String,
    pub authorship: Option<String>,
    pub taxonomic_status: TaxonomicStatus,
    pub rank: Rank,
    pub raw: Option<JsonValue>,
}

impl RegistryRecord {
    /// Key this record should be re-fetched under, if it is not canonical.
    pub fn canonical_redirect(&self) -> Option<i64> {
        if let Some(nub) = self.nub_key {
            if nub != self.key {
                return Some(nub);
            }
        }
        match self.rank_keys.for_rank(self.rank) {
            Some(rank_key) if rank_key != self.key => Some(rank_key),
            _ => None,
        }
    }

    /// Accepted key to follow when this record is not accepted.
    pub fn accepted_redirect(&self) -> Option<i64> {
        if self.taxonomic_status.is_accepted() {
            return None;
        }
        self.accepted_key.filter(|k| *k != self.key)
    }
}

/// Query for one page of occurrences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccurrenceQuery {
    pub taxon_key: i64,
    pub offset: u32,
    pub limit: u32,
    pub country: Option<String>,
}

/// One occurrence row returned by the archive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OccurrenceRow {
    pub upstream_id: Option<String>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub coordinate_uncertainty_m: Option<f64>,
    pub event_date: Option<NaiveDate>,
    pub modified: Option<NaiveDate>,
    pub collector: Option<String>,
    pub institution_code: Option<String>,
    pub reference_url: Option<String>,
    pub locality: Option<String>,
    pub verbatim_locality: Option<String>,
    pub species_name: Option<String>,
    pub establishment_means: Option<String>,
    pub raw: Option<JsonValue>,
}

impl OccurrenceRow {
    /// Event date, falling back to the modification date.
    pub fn observed_on(&self) -> Option<NaiveDate> {
        self.event_date.or(self.modified)
    }

    /// Point of the row when both coordinates are present and in range.
    pub fn point(&self) -> Option<GeoPoint> {
        match (self.longitude, self.latitude) {
            (Some(lon), Some(lat)) => GeoPoint::new(lon, lat),
            _ => None,
        }
    }

    /// Locality text used to name a new site.
    pub fn locality_name(&self) -> Option<&str> {
        [self.locality.as_deref(), self.verbatim_locality.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
    }
}

/// One page of occurrence results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OccurrencePage {
    pub offset: u32,
    pub limit: u32,
    pub total: u64,
    pub end_of_records: bool,
    pub results: Vec<OccurrenceRow>,
}

// =============================================================================
// SITES
// =============================================================================

/// WGS 84 point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub longitude: f64,
    pub latitude: f64,
}

/// Mean Earth radius in metres.
const EARTH_RADIUS_M: f64 = 6_371_008.8;

impl GeoPoint {
    /// Validated constructor; `None` when coordinates are out of range.
    pub fn new(longitude: f64, latitude: f64) -> Option<Self> {
        if longitude.is_finite()
            && latitude.is_finite()
            && (-180.0..=180.0).contains(&longitude)
            && (-90.0..=90.0).contains(&latitude)
        {
            Some(Self {
                longitude,
                latitude,
            })
        } else {
            None
        }
    }

    /// Great-circle (haversine) distance in metres.
    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.longitude - self.longitude).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
    }
}

/// Kind of location a site represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationType {
    PointObservation,
    Polygon,
}

impl LocationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationType::PointObservation => "point_observation",
            LocationType::Polygon => "polygon",
        }
    }
}

impl FromStr for LocationType {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "point_observation" => Ok(LocationType::PointObservation),
            "polygon" => Ok(LocationType::Polygon),
            other => Err(Error::InvalidInput(format!(
                "Unknown location type: {}",
                other
            ))),
        }
    }
}

/// Geographic anchor for occurrences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: i64,
    pub point: GeoPoint,
    pub name: String,
    pub description: Option<String>,
    pub location_type: LocationType,
    pub occurrence_count: i64,
    pub last_observed: Option<NaiveDate>,
}

/// Request for creating a site.
#[derive(Debug, Clone)]
pub struct NewSite {
    pub point: GeoPoint,
    pub name: String,
    pub description: Option<String>,
    pub location_type: LocationType,
}

// =============================================================================
// OCCURRENCES
// =============================================================================

/// Controlled vocabulary for the origin of an occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginCategory {
    Native,
    NonNative,
    NonNativeInvasive,
    Translocated,
    Unknown,
}

impl OriginCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            OriginCategory::Native => "native",
            OriginCategory::NonNative => "non_native",
            OriginCategory::NonNativeInvasive => "non_native_invasive",
            OriginCategory::Translocated => "translocated",
            OriginCategory::Unknown => "unknown",
        }
    }

    /// Map free text onto the vocabulary. Unmatched text yields `None`
    /// and must not be stored.
    pub fn from_vocabulary(text: &str) -> Option<Self> {
        let normalized = text
            .trim()
            .to_lowercase()
            .replace(['_', '-'], " ");
        match normalized.as_str() {
            "native" | "indigenous" | "endemic" => Some(OriginCategory::Native),
            "introduced" | "alien" | "non native" | "nonnative" | "naturalised"
            | "naturalized" | "managed" => Some(OriginCategory::NonNative),
            "invasive" | "non native invasive" => Some(OriginCategory::NonNativeInvasive),
            "translocated" | "reintroduced" | "assisted colonisation" => {
                Some(OriginCategory::Translocated)
            }
            "uncertain" | "unknown" => Some(OriginCategory::Unknown),
            _ => None,
        }
    }
}

impl FromStr for OriginCategory {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        OriginCategory::from_vocabulary(s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown origin category: {}", s)))
    }
}

/// One persisted point observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OccurrenceRecord {
    pub id: i64,
    pub upstream_id: String,
    pub source: String,
    pub taxon_id: i64,
    pub site_id: i64,
    pub collection_date: Option<NaiveDate>,
    pub collector: Option<String>,
    pub institution_code: Option<String>,
    pub species_name: Option<String>,
    pub reference_url: Option<String>,
    pub owner: String,
    pub origin_category: Option<OriginCategory>,
    pub habitat: Option<String>,
    pub validated: bool,
    pub externally_sourced: bool,
    pub additional_data: JsonValue,
    pub updated_at: DateTime<Utc>,
}

/// Full set of fields written by an occurrence upsert.
///
/// Upserts always overwrite every field; they are never partial.
#[derive(Debug, Clone, PartialEq)]
pub struct OccurrenceUpsert {
    pub upstream_id: String,
    pub source: String,
    pub taxon_id: i64,
    pub site_id: i64,
    pub collection_date: Option<NaiveDate>,
    pub collector: Option<String>,
    pub institution_code: Option<String>,
    pub species_name: Option<String>,
    pub reference_url: Option<String>,
    pub owner: String,
    pub origin_category: Option<OriginCategory>,
    pub habitat: Option<String>,
    pub validated: bool,
    pub externally_sourced: bool,
    pub additional_data: JsonValue,
}

/// Repository call context replacing ambient side-effect toggles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteContext {
    /// Skip derived-update side effects; the caller refreshes them afterwards.
    pub bulk_mode: bool,
}

impl WriteContext {
    pub fn interactive() -> Self {
        Self { bulk_mode: false }
    }

    pub fn bulk() -> Self {
        Self { bulk_mode: true }
    }
}

// =============================================================================
// HARVEST OUTCOME
// =============================================================================

/// Terminal status of one harvest run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum HarvestStatus {
    /// Every page was processed.
    Completed,
    /// The run's cancellation flag was observed.
    Cancelled,
    /// A page fetch failed; the caller may reschedule.
    Failed(String),
    /// The taxon has no registry key.
    Skipped,
}

/// Summary of a harvest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestOutcome {
    pub status: HarvestStatus,
    pub pages_fetched: u32,
    pub records_seen: u64,
    pub records_created: u64,
    pub records_updated: u64,
    pub records_skipped: u64,
    pub sites_created: u64,
    pub duplicate_upstream_ids: u64,
}

impl HarvestOutcome {
    pub fn new(status: HarvestStatus) -> Self {
        Self {
            status,
            pages_fetched: 0,
            records_seen: 0,
            records_created: 0,
            records_updated: 0,
            records_skipped: 0,
            sites_created: 0,
            duplicate_upstream_ids: 0,
        }
    }

    /// Records written (created or updated) in this run.
    pub fn records_written(&self) -> u64 {
        self.records_created + self.records_updated
    }
}

// =============================================================================
// JOBS
// =============================================================================

/// Type of job to process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Harvest occurrences for one taxon
    HarvestOccurrences,
    /// Resolve a name or registry key into a taxon node
    ResolveTaxon,
    /// Merge duplicate taxa for a name and rank
    MergeDuplicates,
    /// Re-validate a taxon's parent against the registry
    ResyncParent,
    /// Re-derive a synonym's accepted taxon
    ResyncSynonym,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::HarvestOccurrences => "harvest_occurrences",
            JobType::ResolveTaxon => "resolve_taxon",
            JobType::MergeDuplicates => "merge_duplicates",
            JobType::ResyncParent => "resync_parent",
            JobType::ResyncSynonym => "resync_synonym",
        }
    }

    /// Default priority for this job type (higher = more urgent)
    pub fn default_priority(&self) -> i32 {
        match self {
            // Resolution gates harvesting of newly admitted names
            JobType::ResolveTaxon => 6,
            // Repair jobs converge data other jobs read
            JobType::MergeDuplicates => 5,
            JobType::ResyncSynonym => 4,
            JobType::ResyncParent => 3,
            // Harvests are long-running background work
            JobType::HarvestOccurrences => 2,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "harvest_occurrences" => Ok(JobType::HarvestOccurrences),
            "resolve_taxon" => Ok(JobType::ResolveTaxon),
            "merge_duplicates" => Ok(JobType::MergeDuplicates),
            "resync_parent" => Ok(JobType::ResyncParent),
            "resync_synonym" => Ok(JobType::ResyncSynonym),
            other => Err(Error::InvalidInput(format!("Unknown job type: {}", other))),
        }
    }
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(Error::InvalidInput(format!("Unknown job status: {}", other))),
        }
    }
}

/// A job in the processing queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: i32,
    pub payload: Option<JsonValue>,
    pub result: Option<JsonValue>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether a transient failure would put the job back in the queue.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// How a failed job is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Registry or database trouble; requeued while retries remain.
    Transient,
    /// Bad payload or a vanished taxon; retrying cannot help.
    Permanent,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::Transient)
    }
}
