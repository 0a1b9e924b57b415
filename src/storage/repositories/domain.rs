//! DNS domain repository

use crate::domain::{parse_status, status_strings, DomainStatus};
use crate::errors::{ForgeError, Result};
use crate::storage::paginator::{OrderBy, OrderField, PageInput, Paginator};
use crate::storage::query::{push_opt_strings, push_opt_uuids, push_search};
use crate::storage::tx::{acquire, Tx};
use crate::storage::DbPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::instrument;
use uuid::Uuid;

pub const DOMAIN_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("hostname", "d.hostname"),
    OrderField::new("status", "d.status"),
    OrderField::new("created", "d.created"),
    OrderField::new("updated", "d.updated"),
];

/// Database row structure for domains
#[derive(Debug, Clone, FromRow)]
struct DomainRow {
    id: Uuid,
    hostname: String,
    org: String,
    controller_domain_id: Option<Uuid>,
    status: String,
    created_by: Uuid,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub id: Uuid,
    pub hostname: String,
    pub org: String,
    pub controller_domain_id: Option<Uuid>,
    pub status: DomainStatus,
    pub created_by: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl TryFrom<DomainRow> for Domain {
    type Error = ForgeError;

    fn try_from(row: DomainRow) -> Result<Self> {
        Ok(Self {
            status: parse_status(&row.status)?,
            id: row.id,
            hostname: row.hostname,
            org: row.org,
            controller_domain_id: row.controller_domain_id,
            created_by: row.created_by,
            created: row.created,
            updated: row.updated,
            deleted: row.deleted,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDomainRequest {
    pub hostname: String,
    pub org: String,
    pub controller_domain_id: Option<Uuid>,
    pub status: DomainStatus,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateDomainRequest {
    pub hostname: Option<String>,
    pub org: Option<String>,
    pub controller_domain_id: Option<Uuid>,
    pub status: Option<DomainStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainFilter {
    pub ids: Option<Vec<Uuid>>,
    pub hostnames: Option<Vec<String>>,
    pub orgs: Option<Vec<String>>,
    pub controller_domain_ids: Option<Vec<Uuid>>,
    pub statuses: Option<Vec<DomainStatus>>,
    pub search_query: Option<String>,
}

#[async_trait]
pub trait DomainRepository: Send + Sync {
    async fn create(&self, tx: Option<&mut Tx>, request: CreateDomainRequest) -> Result<Domain>;
    async fn get_by_id(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<Domain>;
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &DomainFilter,
        page: &PageInput,
    ) -> Result<(Vec<Domain>, i64)>;
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateDomainRequest,
    ) -> Result<Domain>;
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()>;
}

pub struct SqlxDomainRepository {
    pool: DbPool,
}

impl SqlxDomainRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Load domains by id, including soft deleted ones
pub(crate) async fn load_by_ids(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, Domain>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query_as::<_, DomainRow>("SELECT * FROM domain WHERE id = ANY($1)")
        .bind(ids)
        .fetch_all(conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to load domains"))?;

    rows.into_iter().map(|row| Domain::try_from(row).map(|d| (d.id, d))).collect()
}

async fn fetch_one(conn: &mut PgConnection, id: Uuid) -> Result<Domain> {
    sqlx::query_as::<_, DomainRow>("SELECT * FROM domain WHERE id = $1 AND deleted IS NULL")
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to fetch domain {}", id)))?
        .ok_or_else(|| ForgeError::not_found("Domain", id))?
        .try_into()
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &DomainFilter) {
    push_opt_uuids(qb, "d.id", &filter.ids);
    push_opt_strings(qb, "d.hostname", &filter.hostnames);
    push_opt_strings(qb, "d.org", &filter.orgs);
    push_opt_uuids(qb, "d.controller_domain_id", &filter.controller_domain_ids);
    push_opt_strings(qb, "d.status", &filter.statuses.as_deref().map(status_strings));
    push_search(qb, filter.search_query.as_deref(), &["d.hostname"], &["d.hostname"]);
}

#[async_trait]
impl DomainRepository for SqlxDomainRepository {
    #[instrument(skip(self, tx, request), fields(hostname = %request.hostname, org = %request.org), name = "db_create_domain")]
    async fn create(&self, tx: Option<&mut Tx>, request: CreateDomainRequest) -> Result<Domain> {
        let mut conn = acquire(&self.pool, tx).await?;

        let row = sqlx::query_as::<_, DomainRow>(
            "INSERT INTO domain (id, hostname, org, controller_domain_id, status, created_by, \
             created, updated) VALUES ($1, $2, $3, $4, $5, $6, $7, $7) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&request.hostname)
        .bind(&request.org)
        .bind(request.controller_domain_id)
        .bind(request.status.as_str())
        .bind(request.created_by)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create domain"))?;

        row.try_into()
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_domain_by_id")]
    async fn get_by_id(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<Domain> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id).await
    }

    #[instrument(skip(self, tx, filter), fields(offset = ?page.offset, limit = ?page.limit), name = "db_get_all_domains")]
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &DomainFilter,
        page: &PageInput,
    ) -> Result<(Vec<Domain>, i64)> {
        let paginator =
            Paginator::new(page, OrderBy::default_for("created"), DOMAIN_ORDER_FIELDS, "d.id")?;
        let mut conn = acquire(&self.pool, tx).await?;

        let mut count_qb =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM domain d WHERE d.deleted IS NULL");
        push_filter(&mut count_qb, filter);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to count domains"))?;

        let mut qb = QueryBuilder::<Postgres>::new("SELECT d.* FROM domain d WHERE d.deleted IS NULL");
        push_filter(&mut qb, filter);
        paginator.push_order_and_limit(&mut qb);
        let rows = qb
            .build_query_as::<DomainRow>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to list domains"))?;

        let domains = rows.into_iter().map(Domain::try_from).collect::<Result<Vec<_>>>()?;
        Ok((domains, total))
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_update_domain")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateDomainRequest,
    ) -> Result<Domain> {
        let mut conn = acquire(&self.pool, tx).await?;

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE domain SET ");
        let mut set = qb.separated(", ");
        let mut changed = false;
        if let Some(v) = request.hostname {
            set.push("hostname = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.org {
            set.push("org = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.controller_domain_id {
            set.push("controller_domain_id = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.status {
            set.push("status = ").push_bind_unseparated(v.as_str());
            changed = true;
        }
        if !changed {
            return fetch_one(&mut conn, id).await;
        }
        set.push("updated = ").push_bind_unseparated(Utc::now());
        qb.push(" WHERE id = ").push_bind(id).push(" AND deleted IS NULL");

        let result = qb
            .build()
            .execute(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, format!("Failed to update domain {}", id)))?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("Domain", id));
        }

        fetch_one(&mut conn, id).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_delete_domain")]
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query("UPDATE domain SET deleted = $2, updated = $2 WHERE id = $1 AND deleted IS NULL")
            .bind(id)
            .bind(Utc::now())
            .execute(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, format!("Failed to delete domain {}", id)))?;

        Ok(())
    }
}
