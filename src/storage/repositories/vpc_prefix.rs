//! VPC prefix repository

use super::distinct_ids;
use super::ip_block::{self, IpBlock};
use super::site::{self, Site};
use super::tenant::{self, Tenant};
use super::vpc::{self, Vpc};
use crate::domain::{parse_status, status_strings, VpcPrefixStatus};
use crate::errors::{ForgeError, Result};
use crate::storage::paginator::{OrderBy, OrderField, PageInput, Paginator};
use crate::storage::query::{push_opt_i32s, push_opt_strings, push_opt_uuids, push_search};
use crate::storage::tx::{acquire, Tx};
use crate::storage::DbPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::instrument;
use uuid::Uuid;

pub const VPC_PREFIX_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("name", "vp.name"),
    OrderField::new("status", "vp.status"),
    OrderField::new("created", "vp.created"),
    OrderField::new("updated", "vp.updated"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpcPrefixRelation {
    Site,
    Vpc,
    Tenant,
    IpBlock,
}

/// Database row structure for VPC prefixes
#[derive(Debug, Clone, FromRow)]
struct VpcPrefixRow {
    id: Uuid,
    name: String,
    org: String,
    site_id: Uuid,
    vpc_id: Uuid,
    tenant_id: Uuid,
    ip_block_id: Option<Uuid>,
    prefix: String,
    prefix_length: i32,
    status: String,
    is_missing_on_site: bool,
    created_by: Uuid,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpcPrefix {
    pub id: Uuid,
    pub name: String,
    pub org: String,
    pub site_id: Uuid,
    pub site: Option<Site>,
    pub vpc_id: Uuid,
    pub vpc: Option<Vpc>,
    pub tenant_id: Uuid,
    pub tenant: Option<Tenant>,
    pub ip_block_id: Option<Uuid>,
    pub ip_block: Option<IpBlock>,
    pub prefix: String,
    pub prefix_length: i32,
    pub status: VpcPrefixStatus,
    pub is_missing_on_site: bool,
    pub created_by: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl TryFrom<VpcPrefixRow> for VpcPrefix {
    type Error = ForgeError;

    fn try_from(row: VpcPrefixRow) -> Result<Self> {
        Ok(Self {
            status: parse_status(&row.status)?,
            id: row.id,
            name: row.name,
            org: row.org,
            site_id: row.site_id,
            site: None,
            vpc_id: row.vpc_id,
            vpc: None,
            tenant_id: row.tenant_id,
            tenant: None,
            ip_block_id: row.ip_block_id,
            ip_block: None,
            prefix: row.prefix,
            prefix_length: row.prefix_length,
            is_missing_on_site: row.is_missing_on_site,
            created_by: row.created_by,
            created: row.created,
            updated: row.updated,
            deleted: row.deleted,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVpcPrefixRequest {
    pub id: Option<Uuid>,
    pub name: String,
    pub org: String,
    pub site_id: Uuid,
    pub vpc_id: Uuid,
    pub tenant_id: Uuid,
    pub ip_block_id: Option<Uuid>,
    pub prefix: String,
    pub prefix_length: i32,
    pub status: VpcPrefixStatus,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateVpcPrefixRequest {
    pub name: Option<String>,
    pub org: Option<String>,
    pub vpc_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub ip_block_id: Option<Uuid>,
    pub prefix: Option<String>,
    pub prefix_length: Option<i32>,
    pub status: Option<VpcPrefixStatus>,
    pub is_missing_on_site: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VpcPrefixFilter {
    pub ids: Option<Vec<Uuid>>,
    pub names: Option<Vec<String>>,
    pub vpc_ids: Option<Vec<Uuid>>,
    pub orgs: Option<Vec<String>>,
    pub tenant_ids: Option<Vec<Uuid>>,
    pub ip_block_ids: Option<Vec<Uuid>>,
    pub site_ids: Option<Vec<Uuid>>,
    pub statuses: Option<Vec<VpcPrefixStatus>>,
    pub prefixes: Option<Vec<String>>,
    pub prefix_lengths: Option<Vec<i32>>,
    pub search_query: Option<String>,
}

#[async_trait]
pub trait VpcPrefixRepository: Send + Sync {
    async fn create(&self, tx: Option<&mut Tx>, request: CreateVpcPrefixRequest)
        -> Result<VpcPrefix>;
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[VpcPrefixRelation],
    ) -> Result<VpcPrefix>;
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &VpcPrefixFilter,
        page: &PageInput,
        relations: &[VpcPrefixRelation],
    ) -> Result<(Vec<VpcPrefix>, i64)>;
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateVpcPrefixRequest,
    ) -> Result<VpcPrefix>;
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()>;
}

pub struct SqlxVpcPrefixRepository {
    pool: DbPool,
}

impl SqlxVpcPrefixRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

pub(crate) async fn load_by_ids(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, VpcPrefix>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query_as::<_, VpcPrefixRow>("SELECT * FROM vpc_prefix WHERE id = ANY($1)")
        .bind(ids)
        .fetch_all(conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to load VPC prefixes"))?;

    rows.into_iter().map(|row| VpcPrefix::try_from(row).map(|p| (p.id, p))).collect()
}

async fn attach_relations(
    conn: &mut PgConnection,
    prefixes: &mut [VpcPrefix],
    relations: &[VpcPrefixRelation],
) -> Result<()> {
    for relation in relations {
        match relation {
            VpcPrefixRelation::Site => {
                let ids = distinct_ids(prefixes.iter().map(|p| p.site_id));
                let sites = site::load_by_ids(conn, &ids).await?;
                for prefix in prefixes.iter_mut() {
                    prefix.site = sites.get(&prefix.site_id).cloned();
                }
            }
            VpcPrefixRelation::Vpc => {
                let ids = distinct_ids(prefixes.iter().map(|p| p.vpc_id));
                let vpcs = vpc::load_by_ids(conn, &ids).await?;
                for prefix in prefixes.iter_mut() {
                    prefix.vpc = vpcs.get(&prefix.vpc_id).cloned();
                }
            }
            VpcPrefixRelation::Tenant => {
                let ids = distinct_ids(prefixes.iter().map(|p| p.tenant_id));
                let tenants = tenant::load_by_ids(conn, &ids).await?;
                for prefix in prefixes.iter_mut() {
                    prefix.tenant = tenants.get(&prefix.tenant_id).cloned();
                }
            }
            VpcPrefixRelation::IpBlock => {
                let ids = distinct_ids(prefixes.iter().filter_map(|p| p.ip_block_id));
                let blocks = ip_block::load_by_ids(conn, &ids).await?;
                for prefix in prefixes.iter_mut() {
                    prefix.ip_block = prefix.ip_block_id.and_then(|id| blocks.get(&id)).cloned();
                }
            }
        }
    }
    Ok(())
}

async fn fetch_one(
    conn: &mut PgConnection,
    id: Uuid,
    relations: &[VpcPrefixRelation],
) -> Result<VpcPrefix> {
    let row = sqlx::query_as::<_, VpcPrefixRow>(
        "SELECT * FROM vpc_prefix WHERE id = $1 AND deleted IS NULL",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ForgeError::database(e, format!("Failed to fetch VPC prefix {}", id)))?
    .ok_or_else(|| ForgeError::not_found("VpcPrefix", id))?;

    let mut prefixes = [VpcPrefix::try_from(row)?];
    attach_relations(conn, &mut prefixes, relations).await?;
    let [prefix] = prefixes;
    Ok(prefix)
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &VpcPrefixFilter) {
    push_opt_uuids(qb, "vp.id", &filter.ids);
    push_opt_strings(qb, "vp.name", &filter.names);
    push_opt_uuids(qb, "vp.vpc_id", &filter.vpc_ids);
    push_opt_strings(qb, "vp.org", &filter.orgs);
    push_opt_uuids(qb, "vp.tenant_id", &filter.tenant_ids);
    push_opt_uuids(qb, "vp.ip_block_id", &filter.ip_block_ids);
    push_opt_uuids(qb, "vp.site_id", &filter.site_ids);
    push_opt_strings(qb, "vp.status", &filter.statuses.as_deref().map(status_strings));
    push_opt_strings(qb, "vp.prefix", &filter.prefixes);
    push_opt_i32s(qb, "vp.prefix_length", &filter.prefix_lengths);
    push_search(
        qb,
        filter.search_query.as_deref(),
        &["vp.name", "vp.status"],
        &["vp.name", "vp.status"],
    );
}

#[async_trait]
impl VpcPrefixRepository for SqlxVpcPrefixRepository {
    #[instrument(skip(self, tx, request), fields(name = %request.name, vpc_id = %request.vpc_id), name = "db_create_vpc_prefix")]
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateVpcPrefixRequest,
    ) -> Result<VpcPrefix> {
        let mut conn = acquire(&self.pool, tx).await?;

        let row = sqlx::query_as::<_, VpcPrefixRow>(
            "INSERT INTO vpc_prefix (id, name, org, site_id, vpc_id, tenant_id, ip_block_id, prefix, \
             prefix_length, status, is_missing_on_site, created_by, created, updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, FALSE, $11, $12, $12) RETURNING *",
        )
        .bind(request.id.unwrap_or_else(Uuid::new_v4))
        .bind(&request.name)
        .bind(&request.org)
        .bind(request.site_id)
        .bind(request.vpc_id)
        .bind(request.tenant_id)
        .bind(request.ip_block_id)
        .bind(&request.prefix)
        .bind(request.prefix_length)
        .bind(request.status.as_str())
        .bind(request.created_by)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create VPC prefix"))?;

        row.try_into()
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_vpc_prefix_by_id")]
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[VpcPrefixRelation],
    ) -> Result<VpcPrefix> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id, relations).await
    }

    #[instrument(skip(self, tx, filter), fields(offset = ?page.offset, limit = ?page.limit), name = "db_get_all_vpc_prefixes")]
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &VpcPrefixFilter,
        page: &PageInput,
        relations: &[VpcPrefixRelation],
    ) -> Result<(Vec<VpcPrefix>, i64)> {
        let paginator =
            Paginator::new(page, OrderBy::default_for("created"), VPC_PREFIX_ORDER_FIELDS, "vp.id")?;
        let mut conn = acquire(&self.pool, tx).await?;

        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM vpc_prefix vp WHERE vp.deleted IS NULL",
        );
        push_filter(&mut count_qb, filter);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to count VPC prefixes"))?;

        let mut qb =
            QueryBuilder::<Postgres>::new("SELECT vp.* FROM vpc_prefix vp WHERE vp.deleted IS NULL");
        push_filter(&mut qb, filter);
        paginator.push_order_and_limit(&mut qb);
        let rows = qb
            .build_query_as::<VpcPrefixRow>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to list VPC prefixes"))?;

        let mut prefixes = rows.into_iter().map(VpcPrefix::try_from).collect::<Result<Vec<_>>>()?;
        attach_relations(&mut conn, &mut prefixes, relations).await?;
        Ok((prefixes, total))
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_update_vpc_prefix")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateVpcPrefixRequest,
    ) -> Result<VpcPrefix> {
        let mut conn = acquire(&self.pool, tx).await?;

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE vpc_prefix SET ");
        let mut set = qb.separated(", ");
        let mut changed = false;
        if let Some(v) = request.name {
            set.push("name = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.org {
            set.push("org = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.vpc_id {
            set.push("vpc_id = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.tenant_id {
            set.push("tenant_id = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.ip_block_id {
            set.push("ip_block_id = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.prefix {
            set.push("prefix = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.prefix_length {
            set.push("prefix_length = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.status {
            set.push("status = ").push_bind_unseparated(v.as_str());
            changed = true;
        }
        if let Some(v) = request.is_missing_on_site {
            set.push("is_missing_on_site = ").push_bind_unseparated(v);
            changed = true;
        }
        if !changed {
            return fetch_one(&mut conn, id, &[]).await;
        }
        set.push("updated = ").push_bind_unseparated(Utc::now());
        qb.push(" WHERE id = ").push_bind(id).push(" AND deleted IS NULL");

        let result = qb
            .build()
            .execute(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, format!("Failed to update VPC prefix {}", id)))?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("VpcPrefix", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_delete_vpc_prefix")]
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query(
            "UPDATE vpc_prefix SET deleted = $2, updated = $2 WHERE id = $1 AND deleted IS NULL",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to delete VPC prefix {}", id)))?;

        Ok(())
    }
}
