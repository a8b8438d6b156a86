//! Site repository implementation (PostGIS proximity).

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;

use taxa_core::defaults::SITE_SRID;
use taxa_core::{
    Error, GeoPoint, LocationType, NewSite, Result, Site, SiteRepository, WriteContext,
};

const SITE_COLUMNS: &str = "id, ST_X(point) AS longitude, ST_Y(point) AS latitude, name,
    description, location_type, occurrence_count, last_observed";

/// Recompute occurrence count and last observed date for sites in $1.
pub(crate) const REFRESH_SUMMARIES_SQL: &str = "UPDATE site s
     SET occurrence_count = agg.cnt, last_observed = agg.last_observed
     FROM (
         SELECT si.id, COUNT(o.id) AS cnt, MAX(o.collection_date) AS last_observed
         FROM site si
         LEFT JOIN occurrence o ON o.site_id = si.id
         WHERE si.id = ANY($1)
         GROUP BY si.id
     ) agg
     WHERE s.id = agg.id";

fn parse_site_row(row: &PgRow) -> Result<Site> {
    let longitude: f64 = row.get("longitude");
    let latitude: f64 = row.get("latitude");
    let location_type: String = row.get("location_type");
    Ok(Site {
        id: row.get("id"),
        point: GeoPoint {
            longitude,
            latitude,
        },
        name: row.get("name"),
        description: row.get("description"),
        location_type: location_type.parse::<LocationType>()?,
        occurrence_count: row.get("occurrence_count"),
        last_observed: row.get("last_observed"),
    })
}

/// PostgreSQL implementation of SiteRepository.
#[derive(Clone)]
pub struct PgSiteRepository {
    pool: Pool<Postgres>,
}

impl PgSiteRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SiteRepository for PgSiteRepository {
    async fn find_within(&self, point: GeoPoint, radius_m: f64) -> Result<Option<Site>> {
        let row = sqlx::query(&format!(
            "SELECT {SITE_COLUMNS} FROM site
             WHERE ST_DWithin(
                 point::geography,
                 ST_SetSRID(ST_MakePoint($1, $2), $4)::geography,
                 $3
             )
             ORDER BY ST_Distance(point::geography, ST_SetSRID(ST_MakePoint($1, $2), $4)::geography),
                      id
             LIMIT 1"
        ))
        .bind(point.longitude)
        .bind(point.latitude)
        .bind(radius_m.max(0.0))
        .bind(SITE_SRID)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(parse_site_row).transpose()
    }

    async fn create(&self, ctx: WriteContext, site: NewSite) -> Result<Site> {
        let row = sqlx::query(&format!(
            "INSERT INTO site (point, name, description, location_type)
             VALUES (ST_SetSRID(ST_MakePoint($1, $2), $3), $4, $5, $6)
             RETURNING {SITE_COLUMNS}"
        ))
        .bind(site.point.longitude)
        .bind(site.point.latitude)
        .bind(SITE_SRID)
        .bind(&site.name)
        .bind(&site.description)
        .bind(site.location_type.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        let created = parse_site_row(&row)?;
        debug!(
            subsystem = "db",
            component = "sites",
            op = "create",
            site_id = created.id,
            bulk_mode = ctx.bulk_mode,
            "Site created"
        );
        Ok(created)
    }

    async fn get(&self, id: i64) -> Result<Option<Site>> {
        let row = sqlx::query(&format!("SELECT {SITE_COLUMNS} FROM site WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(parse_site_row).transpose()
    }

    async fn refresh_summaries(&self, site_ids: &[i64]) -> Result<()> {
        if site_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(REFRESH_SUMMARIES_SQL)
            .bind(site_ids)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }
}
