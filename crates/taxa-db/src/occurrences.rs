//! Occurrence repository implementation.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row, Transaction};
use tracing::debug;

use taxa_core::{
    Error, OccurrenceRecord, OccurrenceRepository, OccurrenceUnitOfWork, OccurrenceUpsert,
    OriginCategory, Result, WriteContext,
};

use crate::sites::REFRESH_SUMMARIES_SQL;

const OCCURRENCE_COLUMNS: &str = "id, upstream_id, source, taxon_id, site_id, collection_date,
    collector, institution_code, species_name, reference_url, owner, origin_category, habitat,
    validated, externally_sourced, additional_data, updated_at";

fn parse_occurrence_row(row: &PgRow) -> OccurrenceRecord {
    let origin: Option<String> = row.get("origin_category");
    OccurrenceRecord {
        id: row.get("id"),
        upstream_id: row.get("upstream_id"),
        source: row.get("source"),
        taxon_id: row.get("taxon_id"),
        site_id: row.get("site_id"),
        collection_date: row.get("collection_date"),
        collector: row.get("collector"),
        institution_code: row.get("institution_code"),
        species_name: row.get("species_name"),
        reference_url: row.get("reference_url"),
        owner: row.get("owner"),
        origin_category: origin.as_deref().and_then(OriginCategory::from_vocabulary),
        habitat: row.get("habitat"),
        validated: row.get("validated"),
        externally_sourced: row.get("externally_sourced"),
        additional_data: row.get("additional_data"),
        updated_at: row.get("updated_at"),
    }
}

/// PostgreSQL implementation of OccurrenceRepository.
#[derive(Clone)]
pub struct PgOccurrenceRepository {
    pool: Pool<Postgres>,
}

impl PgOccurrenceRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OccurrenceRepository for PgOccurrenceRepository {
    async fn find_by_upstream_id(
        &self,
        source: &str,
        upstream_id: &str,
    ) -> Result<Vec<OccurrenceRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {OCCURRENCE_COLUMNS} FROM occurrence
             WHERE source = $1 AND upstream_id = $2 ORDER BY id"
        ))
        .bind(source)
        .bind(upstream_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(rows.iter().map(parse_occurrence_row).collect())
    }

    async fn list_for_taxon(&self, taxon_id: i64) -> Result<Vec<OccurrenceRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {OCCURRENCE_COLUMNS} FROM occurrence WHERE taxon_id = $1 ORDER BY id"
        ))
        .bind(taxon_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(rows.iter().map(parse_occurrence_row).collect())
    }

    async fn begin(&self, ctx: WriteContext) -> Result<Box<dyn OccurrenceUnitOfWork>> {
        let tx = self.pool.begin().await.map_err(Error::Database)?;
        Ok(Box::new(PgOccurrenceUnitOfWork {
            tx,
            ctx,
            touched_sites: Vec::new(),
        }))
    }
}

/// Single-record upsert transaction.
///
/// Outside bulk mode the summaries of every site it touched are refreshed
/// inside the same transaction on commit.
pub struct PgOccurrenceUnitOfWork {
    tx: Transaction<'static, Postgres>,
    ctx: WriteContext,
    touched_sites: Vec<i64>,
}

impl PgOccurrenceUnitOfWork {
    fn touch(&mut self, site_id: i64) {
        if !self.touched_sites.contains(&site_id) {
            self.touched_sites.push(site_id);
        }
    }
}

#[async_trait]
impl OccurrenceUnitOfWork for PgOccurrenceUnitOfWork {
    async fn find_by_upstream_id(
        &mut self,
        source: &str,
        upstream_id: &str,
    ) -> Result<Vec<OccurrenceRecord>> {
        // No unique index exists, so concurrent upserts of one id serialize here.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1 || ':' || $2, 0))")
            .bind(source)
            .bind(upstream_id)
            .execute(&mut *self.tx)
            .await
            .map_err(Error::Database)?;

        let rows = sqlx::query(&format!(
            "SELECT {OCCURRENCE_COLUMNS} FROM occurrence
             WHERE source = $1 AND upstream_id = $2
             ORDER BY id
             FOR UPDATE"
        ))
        .bind(source)
        .bind(upstream_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(Error::Database)?;
        Ok(rows.iter().map(parse_occurrence_row).collect())
    }

    async fn insert(&mut self, record: &OccurrenceUpsert) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO occurrence (upstream_id, source, taxon_id, site_id, collection_date,
                                     collector, institution_code, species_name, reference_url,
                                     owner, origin_category, habitat, validated,
                                     externally_sourced, additional_data)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
             RETURNING id",
        )
        .bind(&record.upstream_id)
        .bind(&record.source)
        .bind(record.taxon_id)
        .bind(record.site_id)
        .bind(record.collection_date)
        .bind(&record.collector)
        .bind(&record.institution_code)
        .bind(&record.species_name)
        .bind(&record.reference_url)
        .bind(&record.owner)
        .bind(record.origin_category.map(|o| o.as_str()))
        .bind(&record.habitat)
        .bind(record.validated)
        .bind(record.externally_sourced)
        .bind(&record.additional_data)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(Error::Database)?;

        self.touch(record.site_id);
        Ok(id)
    }

    async fn update(&mut self, id: i64, record: &OccurrenceUpsert) -> Result<()> {
        let previous_site: Option<i64> =
            sqlx::query_scalar("SELECT site_id FROM occurrence WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(Error::Database)?;
        let previous_site =
            previous_site.ok_or_else(|| Error::NotFound(format!("occurrence {}", id)))?;

        sqlx::query(
            "UPDATE occurrence
             SET upstream_id = $2, source = $3, taxon_id = $4, site_id = $5,
                 collection_date = $6, collector = $7, institution_code = $8,
                 species_name = $9, reference_url = $10, owner = $11, origin_category = $12,
                 habitat = $13, validated = $14, externally_sourced = $15,
                 additional_data = $16, updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(&record.upstream_id)
        .bind(&record.source)
        .bind(record.taxon_id)
        .bind(record.site_id)
        .bind(record.collection_date)
        .bind(&record.collector)
        .bind(&record.institution_code)
        .bind(&record.species_name)
        .bind(&record.reference_url)
        .bind(&record.owner)
        .bind(record.origin_category.map(|o| o.as_str()))
        .bind(&record.habitat)
        .bind(record.validated)
        .bind(record.externally_sourced)
        .bind(&record.additional_data)
        .execute(&mut *self.tx)
        .await
        .map_err(Error::Database)?;

        self.touch(previous_site);
        self.touch(record.site_id);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = *self;
        if !this.ctx.bulk_mode && !this.touched_sites.is_empty() {
            sqlx::query(REFRESH_SUMMARIES_SQL)
                .bind(&this.touched_sites)
                .execute(&mut *this.tx)
                .await
                .map_err(Error::Database)?;
            debug!(
                subsystem = "db",
                component = "occurrences",
                op = "refresh_summaries",
                result_count = this.touched_sites.len(),
                "Site summaries refreshed"
            );
        }
        this.tx.commit().await.map_err(Error::Database)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(Error::Database)
    }
}
