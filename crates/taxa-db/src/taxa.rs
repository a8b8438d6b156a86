//! Taxon repository implementation.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row, Transaction};
use tracing::{debug, warn};

use taxa_core::{
    split_legacy_names, Error, NewTaxon, Rank, RelationClass, Result, TaxonIdentity, TaxonNode,
    TaxonRepository, TaxonUnitOfWork, VernacularName, WriteContext,
};

use crate::escape_like;

const TAXON_COLUMNS: &str = "id, scientific_name, canonical_name, author, rank, taxonomic_status,
    external_key, legacy_names, parent_id, accepted_taxon_id, raw, created_at, updated_at";

/// Table and column holding the taxon reference for a relation class.
pub(crate) fn reference_target(class: RelationClass) -> (&'static str, &'static str) {
    match class {
        RelationClass::Occurrences => ("occurrence", "taxon_id"),
        RelationClass::GroupMemberships => ("taxon_group_member", "taxon_id"),
        RelationClass::VernacularNames => ("taxon_vernacular_name", "taxon_id"),
        RelationClass::ReferenceLinks => ("taxon_reference_link", "taxon_id"),
        RelationClass::UpdateProposals => ("taxon_update_proposal", "taxon_id"),
        RelationClass::ChildTaxa => ("taxon", "parent_id"),
        RelationClass::SynonymTaxa => ("taxon", "accepted_taxon_id"),
    }
}

/// Statements re-pointing `class` references from losers ($1) to the survivor ($2).
///
/// Link tables with a uniqueness constraint first drop loser rows that would
/// collide with a row already owned by the survivor (or an earlier loser).
fn migrate_statements(class: RelationClass) -> &'static [&'static str] {
    match class {
        RelationClass::Occurrences => &[
            "UPDATE occurrence SET taxon_id = $2, updated_at = now() WHERE taxon_id = ANY($1)",
        ],
        RelationClass::GroupMemberships => &[
            "DELETE FROM taxon_group_member l
             WHERE l.taxon_id = ANY($1)
               AND EXISTS (
                   SELECT 1 FROM taxon_group_member o
                   WHERE (o.taxon_id = $2 OR (o.taxon_id = ANY($1) AND o.id < l.id))
                     AND o.group_name = l.group_name
               )",
            "UPDATE taxon_group_member SET taxon_id = $2 WHERE taxon_id = ANY($1)",
        ],
        RelationClass::VernacularNames => &[
            "DELETE FROM taxon_vernacular_name l
             WHERE l.taxon_id = ANY($1)
               AND EXISTS (
                   SELECT 1 FROM taxon_vernacular_name o
                   WHERE (o.taxon_id = $2 OR (o.taxon_id = ANY($1) AND o.id < l.id))
                     AND lower(o.name) = lower(l.name)
                     AND coalesce(o.language, '') = coalesce(l.language, '')
               )",
            "UPDATE taxon_vernacular_name SET taxon_id = $2 WHERE taxon_id = ANY($1)",
        ],
        RelationClass::ReferenceLinks => {
            &["UPDATE taxon_reference_link SET taxon_id = $2 WHERE taxon_id = ANY($1)"]
        }
        RelationClass::UpdateProposals => {
            &["UPDATE taxon_update_proposal SET taxon_id = $2 WHERE taxon_id = ANY($1)"]
        }
        RelationClass::ChildTaxa => &[
            "UPDATE taxon SET parent_id = $2, updated_at = now()
             WHERE parent_id = ANY($1) AND id <> $2",
        ],
        RelationClass::SynonymTaxa => &[
            "UPDATE taxon SET accepted_taxon_id = $2, updated_at = now()
             WHERE accepted_taxon_id = ANY($1) AND id <> $2",
        ],
    }
}

/// Statement removing `class` references to losers ($1).
fn detach_statement(class: RelationClass) -> &'static str {
    match class {
        RelationClass::Occurrences => "DELETE FROM occurrence WHERE taxon_id = ANY($1)",
        RelationClass::GroupMemberships => {
            "DELETE FROM taxon_group_member WHERE taxon_id = ANY($1)"
        }
        RelationClass::VernacularNames => {
            "DELETE FROM taxon_vernacular_name WHERE taxon_id = ANY($1)"
        }
        RelationClass::ReferenceLinks => {
            "DELETE FROM taxon_reference_link WHERE taxon_id = ANY($1)"
        }
        RelationClass::UpdateProposals => {
            "DELETE FROM taxon_update_proposal WHERE taxon_id = ANY($1)"
        }
        RelationClass::ChildTaxa => {
            "UPDATE taxon SET parent_id = NULL, updated_at = now() WHERE parent_id = ANY($1)"
        }
        RelationClass::SynonymTaxa => {
            "UPDATE taxon SET accepted_taxon_id = NULL, updated_at = now()
             WHERE accepted_taxon_id = ANY($1)"
        }
    }
}

/// Parse a taxon row.
pub(crate) fn parse_taxon_row(row: &PgRow) -> Result<TaxonNode> {
    let rank: String = row.get("rank");
    let status: String = row.get("taxonomic_status");
    let legacy: Option<String> = row.get("legacy_names");
    Ok(TaxonNode {
        id: row.get("id"),
        scientific_name: row.get("scientific_name"),
        canonical_name: row.get("canonical_name"),
        author: row.get("author"),
        rank: rank.parse()?,
        taxonomic_status: status.parse()?,
        external_key: row.get("external_key"),
        legacy_names: split_legacy_names(legacy.as_deref()),
        parent_id: row.get("parent_id"),
        accepted_taxon_id: row.get("accepted_taxon_id"),
        raw: row.get("raw"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn parse_taxon_rows(rows: Vec<PgRow>) -> Result<Vec<TaxonNode>> {
    rows.iter().map(parse_taxon_row).collect()
}

/// Overwrite every mutable column of a taxon on any executor.
async fn write_taxon<'e, E>(executor: E, taxon: &TaxonNode) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        "UPDATE taxon
         SET scientific_name = $2, canonical_name = $3, author = $4, rank = $5,
             taxonomic_status = $6, external_key = $7, legacy_names = $8, parent_id = $9,
             accepted_taxon_id = $10, raw = $11, updated_at = now()
         WHERE id = $1",
    )
    .bind(taxon.id)
    .bind(&taxon.scientific_name)
    .bind(&taxon.canonical_name)
    .bind(&taxon.author)
    .bind(taxon.rank.as_str())
    .bind(taxon.taxonomic_status.as_str())
    .bind(taxon.external_key)
    .bind(taxon.legacy_names_joined())
    .bind(taxon.parent_id)
    .bind(taxon.accepted_taxon_id)
    .bind(&taxon.raw)
    .execute(executor)
    .await
    .map_err(Error::Database)?;

    if result.rows_affected() == 0 {
        return Err(Error::TaxonNotFound(taxon.id));
    }
    Ok(())
}

/// PostgreSQL implementation of TaxonRepository.
#[derive(Clone)]
pub struct PgTaxonRepository {
    pool: Pool<Postgres>,
}

impl PgTaxonRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Direct children of a taxon, ordered by id.
    pub async fn list_children(&self, parent_id: i64) -> Result<Vec<TaxonNode>> {
        let rows = sqlx::query(&format!(
            "SELECT {TAXON_COLUMNS} FROM taxon WHERE parent_id = $1 ORDER BY id"
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        parse_taxon_rows(rows)
    }
}

#[async_trait]
impl TaxonRepository for PgTaxonRepository {
    async fn get(&self, id: i64) -> Result<Option<TaxonNode>> {
        let row = sqlx::query(&format!("SELECT {TAXON_COLUMNS} FROM taxon WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(parse_taxon_row).transpose()
    }

    async fn find_by_external_key(&self, key: i64) -> Result<Option<TaxonNode>> {
        let row = sqlx::query(&format!(
            "SELECT {TAXON_COLUMNS} FROM taxon WHERE external_key = $1 ORDER BY id LIMIT 1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.as_ref().map(parse_taxon_row).transpose()
    }

    async fn find_by_identity(&self, identity: &TaxonIdentity) -> Result<Vec<TaxonNode>> {
        let rows = sqlx::query(&format!(
            "SELECT {TAXON_COLUMNS} FROM taxon
             WHERE scientific_name = $1 AND canonical_name = $2
               AND taxonomic_status = $3 AND rank = $4
             ORDER BY id"
        ))
        .bind(&identity.scientific_name)
        .bind(&identity.canonical_name)
        .bind(identity.taxonomic_status.as_str())
        .bind(identity.rank.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        parse_taxon_rows(rows)
    }

    async fn find_merge_candidates(&self, name: &str, rank: Rank) -> Result<Vec<TaxonNode>> {
        let pattern = format!("%{}%", escape_like(name));
        let rows = sqlx::query(&format!(
            "SELECT {TAXON_COLUMNS} FROM taxon
             WHERE rank = $2
               AND (lower(canonical_name) = lower($1) OR legacy_names ILIKE $3 ESCAPE '\\')
             ORDER BY id"
        ))
        .bind(name)
        .bind(rank.as_str())
        .bind(pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "taxa",
            op = "find_merge_candidates",
            name,
            rank = rank.as_str(),
            result_count = rows.len(),
            "Merge candidates loaded"
        );
        parse_taxon_rows(rows)
    }

    async fn insert(&self, ctx: WriteContext, taxon: NewTaxon) -> Result<TaxonNode> {
        let row = sqlx::query(&format!(
            "INSERT INTO taxon (scientific_name, canonical_name, author, rank, taxonomic_status,
                                external_key, legacy_names, parent_id, accepted_taxon_id, raw)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             RETURNING {TAXON_COLUMNS}"
        ))
        .bind(&taxon.scientific_name)
        .bind(&taxon.canonical_name)
        .bind(&taxon.author)
        .bind(taxon.rank.as_str())
        .bind(taxon.taxonomic_status.as_str())
        .bind(taxon.external_key)
        .bind(taxa_core::join_legacy_names(&taxon.legacy_names))
        .bind(taxon.parent_id)
        .bind(taxon.accepted_taxon_id)
        .bind(&taxon.raw)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        let node = parse_taxon_row(&row)?;
        debug!(
            subsystem = "db",
            component = "taxa",
            op = "insert",
            taxon_id = node.id,
            external_key = node.external_key,
            bulk_mode = ctx.bulk_mode,
            "Taxon created"
        );
        Ok(node)
    }

    async fn update(&self, _ctx: WriteContext, taxon: &TaxonNode) -> Result<()> {
        write_taxon(&self.pool, taxon).await
    }

    async fn add_vernacular_names(
        &self,
        taxon_id: i64,
        names: &[VernacularName],
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let mut added = 0;
        for name in names {
            if name.name.trim().is_empty() {
                continue;
            }
            let result = sqlx::query(
                "INSERT INTO taxon_vernacular_name (taxon_id, name, language, source)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT DO NOTHING",
            )
            .bind(taxon_id)
            .bind(name.name.trim())
            .bind(&name.language)
            .bind(&name.source)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
            added += result.rows_affected();
        }
        tx.commit().await.map_err(Error::Database)?;
        Ok(added)
    }

    async fn vernacular_names(&self, taxon_id: i64) -> Result<Vec<VernacularName>> {
        let rows = sqlx::query(
            "SELECT name, language, source FROM taxon_vernacular_name
             WHERE taxon_id = $1 ORDER BY id",
        )
        .bind(taxon_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| VernacularName {
                name: row.get("name"),
                language: row.get("language"),
                source: row.get("source"),
            })
            .collect())
    }

    async fn count_references(&self, class: RelationClass, taxon_id: i64) -> Result<u64> {
        let (table, column) = reference_target(class);
        let count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table} WHERE {column} = $1"))
                .bind(taxon_id)
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(count as u64)
    }

    async fn begin(&self) -> Result<Box<dyn TaxonUnitOfWork>> {
        let tx = self.pool.begin().await.map_err(Error::Database)?;
        Ok(Box::new(PgTaxonUnitOfWork { tx }))
    }
}

/// Merge transaction. Each relation class migrates inside its own savepoint.
pub struct PgTaxonUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl TaxonUnitOfWork for PgTaxonUnitOfWork {
    async fn migrate_references(
        &mut self,
        class: RelationClass,
        losers: &[i64],
        survivor: i64,
    ) -> Result<u64> {
        let mut savepoint = sqlx::Connection::begin(&mut *self.tx)
            .await
            .map_err(Error::Database)?;

        let mut migrated = 0;
        for statement in migrate_statements(class) {
            let result = sqlx::query(statement)
                .bind(losers)
                .bind(survivor)
                .execute(&mut *savepoint)
                .await;
            match result {
                Ok(done) => migrated = done.rows_affected(),
                Err(e) => {
                    warn!(
                        subsystem = "db",
                        component = "taxa",
                        op = "migrate_references",
                        class = class.as_str(),
                        error = %e,
                        "Relation migration failed, rolling back to savepoint"
                    );
                    savepoint.rollback().await.map_err(Error::Database)?;
                    return Err(Error::Database(e));
                }
            }
        }

        savepoint.commit().await.map_err(Error::Database)?;
        Ok(migrated)
    }

    async fn detach_references(&mut self, class: RelationClass, losers: &[i64]) -> Result<u64> {
        let result = sqlx::query(detach_statement(class))
            .bind(losers)
            .execute(&mut *self.tx)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn update_taxon(&mut self, taxon: &TaxonNode) -> Result<()> {
        write_taxon(&mut *self.tx, taxon).await
    }

    async fn delete_taxa(&mut self, ids: &[i64]) -> Result<u64> {
        let result = sqlx::query("DELETE FROM taxon WHERE id = ANY($1)")
            .bind(ids)
            .execute(&mut *self.tx)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(Error::Database)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(Error::Database)
    }
}
