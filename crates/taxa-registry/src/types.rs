//! GBIF wire formats and their conversion into core types.
//!
//! Every field is optional on the wire; conversion decides what is required.

use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use taxa_core::{
    Error, OccurrencePage, OccurrenceRow, Rank, RankKeys, RegistryRecord, Result,
    TaxonomicStatus, VernacularName,
};

/// `/species/{key}` name usage.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameUsage {
    pub key: Option<i64>,
    pub nub_key: Option<i64>,
    pub accepted_key: Option<i64>,
    pub parent_key: Option<i64>,
    pub kingdom_key: Option<i64>,
    pub phylum_key: Option<i64>,
    pub class_key: Option<i64>,
    pub order_key: Option<i64>,
    pub family_key: Option<i64>,
    pub genus_key: Option<i64>,
    pub subgenus_key: Option<i64>,
    pub species_key: Option<i64>,
    pub scientific_name: Option<String>,
    pub canonical_name: Option<String>,
    pub authorship: Option<String>,
    pub taxonomic_status: Option<String>,
    pub rank: Option<String>,
}

impl NameUsage {
    /// Convert into a registry record, keeping `raw` as the audit payload.
    pub fn into_record(self, raw: JsonValue) -> Result<RegistryRecord> {
        let key = self
            .key
            .ok_or_else(|| Error::Registry("name usage without key".to_string()))?;
        let rank: Rank = self
            .rank
            .as_deref()
            .ok_or_else(|| Error::Registry(format!("name usage {} has no rank", key)))?
            .parse()
            .map_err(|e| Error::Registry(format!("name usage {}: {}", key, e)))?;
        let taxonomic_status: TaxonomicStatus = self
            .taxonomic_status
            .as_deref()
            .ok_or_else(|| Error::Registry(format!("name usage {} has no status", key)))?
            .parse()
            .map_err(|e| Error::Registry(format!("name usage {}: {}", key, e)))?;
        let scientific_name = non_blank(self.scientific_name)
            .ok_or_else(|| Error::Registry(format!("name usage {} has no name", key)))?;
        // Unparsable names carry no canonical form.
        let canonical_name = non_blank(self.canonical_name).unwrap_or_else(|| scientific_name.clone());

        Ok(RegistryRecord {
            key,
            nub_key: self.nub_key,
            accepted_key: self.accepted_key,
            parent_key: self.parent_key,
            rank_keys: RankKeys {
                kingdom: self.kingdom_key,
                phylum: self.phylum_key,
                class: self.class_key,
                order: self.order_key,
                family: self.family_key,
                genus: self.genus_key,
                subgenus: self.subgenus_key,
                species: self.species_key,
            },
            scientific_name,
            canonical_name,
            authorship: non_blank(self.authorship),
            taxonomic_status,
            rank,
            raw: Some(raw),
        })
    }
}

/// `/species/match` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameMatch {
    pub usage_key: Option<i64>,
    pub match_type: Option<String>,
    pub rank: Option<String>,
}

impl NameMatch {
    /// Key of the matched usage, `None` for `matchType = NONE`.
    pub fn matched_key(&self) -> Option<i64> {
        match self.match_type.as_deref() {
            Some(t) if t.eq_ignore_ascii_case("NONE") => None,
            _ => self.usage_key,
        }
    }

    /// The matched rank, when it parses.
    pub fn rank(&self) -> Option<Rank> {
        self.rank.as_deref().and_then(|r| r.parse().ok())
    }
}

/// One `/species/suggest` entry.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameSuggestion {
    pub key: Option<i64>,
    pub rank: Option<String>,
}

impl NameSuggestion {
    pub fn rank(&self) -> Option<Rank> {
        self.rank.as_deref().and_then(|r| r.parse().ok())
    }
}

/// Paging envelope shared by list endpoints.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagingResponse<T> {
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub end_of_records: bool,
    pub count: Option<u64>,
    #[serde(default = "Vec::new")]
    pub results: Vec<T>,
}

/// `/species/{key}/vernacularNames` entry.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VernacularNameWire {
    pub vernacular_name: Option<String>,
    pub language: Option<String>,
    pub source: Option<String>,
}

impl VernacularNameWire {
    pub fn into_vernacular(self) -> Option<VernacularName> {
        Some(VernacularName {
            name: non_blank(self.vernacular_name)?,
            language: non_blank(self.language),
            source: non_blank(self.source),
        })
    }
}

/// `/occurrence/search` result.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OccurrenceWire {
    pub key: Option<i64>,
    #[serde(rename = "gbifID")]
    pub gbif_id: Option<String>,
    pub decimal_longitude: Option<f64>,
    pub decimal_latitude: Option<f64>,
    pub coordinate_uncertainty_in_meters: Option<f64>,
    pub event_date: Option<String>,
    pub modified: Option<String>,
    pub recorded_by: Option<String>,
    pub institution_code: Option<String>,
    pub references: Option<String>,
    pub locality: Option<String>,
    pub verbatim_locality: Option<String>,
    pub species: Option<String>,
    pub establishment_means: Option<String>,
}

impl OccurrenceWire {
    pub fn into_row(self, raw: JsonValue) -> OccurrenceRow {
        OccurrenceRow {
            upstream_id: self
                .key
                .map(|k| k.to_string())
                .or_else(|| non_blank(self.gbif_id)),
            longitude: self.decimal_longitude,
            latitude: self.decimal_latitude,
            coordinate_uncertainty_m: self.coordinate_uncertainty_in_meters,
            event_date: self.event_date.as_deref().and_then(parse_wire_date),
            modified: self.modified.as_deref().and_then(parse_wire_date),
            collector: non_blank(self.recorded_by),
            institution_code: non_blank(self.institution_code),
            reference_url: non_blank(self.references),
            locality: non_blank(self.locality),
            verbatim_locality: non_blank(self.verbatim_locality),
            species_name: non_blank(self.species),
            establishment_means: non_blank(self.establishment_means),
            raw: Some(raw),
        }
    }
}

/// Decode an occurrence page; undecodable rows are kept as empty rows so the
/// pipeline can skip and count them.
pub fn decode_occurrence_page(value: JsonValue) -> Result<OccurrencePage> {
    let envelope: PagingResponse<JsonValue> = serde_json::from_value(value)
        .map_err(|e| Error::Registry(format!("malformed occurrence page: {}", e)))?;

    let results = envelope
        .results
        .into_iter()
        .map(|raw| match serde_json::from_value::<OccurrenceWire>(raw.clone()) {
            Ok(wire) => wire.into_row(raw),
            Err(_) => OccurrenceRow {
                raw: Some(raw),
                ..Default::default()
            },
        })
        .collect();

    Ok(OccurrencePage {
        offset: envelope.offset,
        limit: envelope.limit,
        total: envelope.count.unwrap_or(0),
        end_of_records: envelope.end_of_records,
        results,
    })
}

/// Parse the leading `YYYY-MM-DD` of an ISO date, datetime or interval.
pub fn parse_wire_date(text: &str) -> Option<NaiveDate> {
    let head = text.trim().get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
