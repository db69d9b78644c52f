use futures::future::BoxFuture;
use sqlx::postgres::PgPool;
use tilegeo::ReferenceMatch;

use crate::store::{validate_table_name, StoreError};

/// Resolves the cadastral parcel and address containing a point.
pub trait ReferenceLookup: Send + Sync {
    fn lookup(&self, latitude: f64, longitude: f64) -> BoxFuture<'_, Result<Option<ReferenceMatch>, StoreError>>;
}

/// Point-in-parcel join against PostGIS cadastre and address tables.
///
/// When several parcel/address pairs contain the point only the first row is
/// kept; the match count is logged at debug level.
pub struct PgReference {
    pool: PgPool,
    sql: String,
    srid: i32,
}

impl PgReference {
    pub fn new(pool: PgPool, cadastre_table: &str, address_table: &str, srid: i32) -> Result<Self, StoreError> {
        Ok(Self {
            pool,
            sql: reference_sql(cadastre_table, address_table)?,
            srid,
        })
    }

    async fn query(&self, latitude: f64, longitude: f64) -> Result<Option<ReferenceMatch>, StoreError> {
        let rows: Vec<(Option<String>, Option<String>, Option<String>)> = sqlx::query_as(&self.sql)
            .bind(longitude)
            .bind(latitude)
            .bind(self.srid)
            .fetch_all(&self.pool)
            .await?;

        if rows.len() > 1 {
            tracing::debug!(latitude, longitude, matches = rows.len(), "Several reference matches, keeping the first");
        }

        Ok(rows
            .into_iter()
            .next()
            .map(|(parcel_id, address_id, address_text)| ReferenceMatch {
                parcel_id,
                address_id,
                address_text,
            }))
    }
}

impl ReferenceLookup for PgReference {
    fn lookup(&self, latitude: f64, longitude: f64) -> BoxFuture<'_, Result<Option<ReferenceMatch>, StoreError>> {
        Box::pin(self.query(latitude, longitude))
    }
}

/// Query binding `$1` longitude, `$2` latitude and `$3` SRID. Two rows are
/// enough to tell a unique match from an ambiguous one.
fn reference_sql(cadastre_table: &str, address_table: &str) -> Result<String, StoreError> {
    let cadastre = validate_table_name(cadastre_table)?;
    let address = validate_table_name(address_table)?;
    Ok(format!(
        "SELECT cad.jurisdiction_id::text, gnaf.gnaf_pid::text, \
         concat(gnaf.address, ', ', gnaf.locality_name, ' ', gnaf.state, ' ', gnaf.postcode) \
         FROM {cadastre} AS cad \
         INNER JOIN {address} AS gnaf ON ST_Intersects(gnaf.geom, cad.geom) \
         WHERE ST_Intersects(ST_SetSRID(ST_MakePoint($1, $2), $3), cad.geom) \
         LIMIT 2"
    ))
}
