//! IP block repository
//!
//! Provider blocks have no tenant. Blocks derived for a tenant out of a provider
//! block carry the tenant id, which is how `exclude_derived` tells them apart.

use super::distinct_ids;
use super::infrastructure_provider::{self, InfrastructureProvider};
use super::site::{self, Site};
use super::tenant::{self, Tenant};
use crate::domain::{parse_status, status_strings, IpBlockStatus};
use crate::errors::{ForgeError, Result};
use crate::storage::paginator::{OrderBy, OrderField, PageInput, Paginator};
use crate::storage::query::{push_eq, push_opt_i32s, push_opt_strings, push_opt_uuids, push_search};
use crate::storage::tx::{acquire, Tx};
use crate::storage::DbPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::instrument;
use uuid::Uuid;

pub const IP_BLOCK_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("name", "ipb.name"),
    OrderField::new("prefix", "ipb.prefix"),
    OrderField::new("status", "ipb.status"),
    OrderField::new("created", "ipb.created"),
    OrderField::new("updated", "ipb.updated"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpBlockRelation {
    Site,
    InfrastructureProvider,
    Tenant,
}

/// Database row structure for IP blocks
#[derive(Debug, Clone, FromRow)]
struct IpBlockRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    site_id: Uuid,
    infrastructure_provider_id: Uuid,
    tenant_id: Option<Uuid>,
    routing_type: String,
    prefix: String,
    prefix_length: i32,
    protocol_version: String,
    full_grant: bool,
    status: String,
    created_by: Option<Uuid>,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpBlock {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub site_id: Uuid,
    pub site: Option<Site>,
    pub infrastructure_provider_id: Uuid,
    pub infrastructure_provider: Option<InfrastructureProvider>,
    pub tenant_id: Option<Uuid>,
    pub tenant: Option<Tenant>,
    pub routing_type: String,
    pub prefix: String,
    pub prefix_length: i32,
    pub protocol_version: String,
    pub full_grant: bool,
    pub status: IpBlockStatus,
    pub created_by: Option<Uuid>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl TryFrom<IpBlockRow> for IpBlock {
    type Error = ForgeError;

    fn try_from(row: IpBlockRow) -> Result<Self> {
        Ok(Self {
            status: parse_status(&row.status)?,
            id: row.id,
            name: row.name,
            description: row.description,
            site_id: row.site_id,
            site: None,
            infrastructure_provider_id: row.infrastructure_provider_id,
            infrastructure_provider: None,
            tenant_id: row.tenant_id,
            tenant: None,
            routing_type: row.routing_type,
            prefix: row.prefix,
            prefix_length: row.prefix_length,
            protocol_version: row.protocol_version,
            full_grant: row.full_grant,
            created_by: row.created_by,
            created: row.created,
            updated: row.updated,
            deleted: row.deleted,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateIpBlockRequest {
    pub name: String,
    pub description: Option<String>,
    pub site_id: Uuid,
    pub infrastructure_provider_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub routing_type: String,
    pub prefix: String,
    pub prefix_length: i32,
    pub protocol_version: String,
    pub full_grant: bool,
    pub status: IpBlockStatus,
    pub created_by: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateIpBlockRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub tenant_id: Option<Uuid>,
    pub routing_type: Option<String>,
    pub prefix: Option<String>,
    pub prefix_length: Option<i32>,
    pub protocol_version: Option<String>,
    pub full_grant: Option<bool>,
    pub status: Option<IpBlockStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClearIpBlockRequest {
    pub description: bool,
    pub tenant_id: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpBlockFilter {
    pub ids: Option<Vec<Uuid>>,
    pub names: Option<Vec<String>>,
    pub site_ids: Option<Vec<Uuid>>,
    pub infrastructure_provider_ids: Option<Vec<Uuid>>,
    pub tenant_ids: Option<Vec<Uuid>>,
    pub routing_types: Option<Vec<String>>,
    pub prefixes: Option<Vec<String>>,
    pub prefix_lengths: Option<Vec<i32>>,
    pub protocol_versions: Option<Vec<String>>,
    pub full_grant: Option<bool>,
    pub statuses: Option<Vec<IpBlockStatus>>,
    /// Only provider blocks. Cannot be combined with `tenant_ids`.
    pub exclude_derived: bool,
    pub search_query: Option<String>,
}

impl IpBlockFilter {
    fn validate(&self) -> Result<()> {
        if self.exclude_derived && self.tenant_ids.is_some() {
            return Err(ForgeError::validation_field(
                "exclude_derived cannot be combined with tenant_ids",
                "exclude_derived",
            ));
        }
        Ok(())
    }
}

#[async_trait]
pub trait IpBlockRepository: Send + Sync {
    async fn create(&self, tx: Option<&mut Tx>, request: CreateIpBlockRequest) -> Result<IpBlock>;
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[IpBlockRelation],
    ) -> Result<IpBlock>;
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &IpBlockFilter,
        page: &PageInput,
        relations: &[IpBlockRelation],
    ) -> Result<(Vec<IpBlock>, i64)>;
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateIpBlockRequest,
    ) -> Result<IpBlock>;
    async fn clear(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: ClearIpBlockRequest,
    ) -> Result<IpBlock>;
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()>;
}

pub struct SqlxIpBlockRepository {
    pool: DbPool,
}

impl SqlxIpBlockRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Load IP blocks by id, including soft deleted ones
pub(crate) async fn load_by_ids(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, IpBlock>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query_as::<_, IpBlockRow>("SELECT * FROM ip_block WHERE id = ANY($1)")
        .bind(ids)
        .fetch_all(conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to load IP blocks"))?;

    rows.into_iter().map(|row| IpBlock::try_from(row).map(|b| (b.id, b))).collect()
}

async fn attach_relations(
    conn: &mut PgConnection,
    blocks: &mut [IpBlock],
    relations: &[IpBlockRelation],
) -> Result<()> {
    for relation in relations {
        match relation {
            IpBlockRelation::Site => {
                let ids = distinct_ids(blocks.iter().map(|b| b.site_id));
                let sites = site::load_by_ids(conn, &ids).await?;
                for block in blocks.iter_mut() {
                    block.site = sites.get(&block.site_id).cloned();
                }
            }
            IpBlockRelation::InfrastructureProvider => {
                let ids = distinct_ids(blocks.iter().map(|b| b.infrastructure_provider_id));
                let providers = infrastructure_provider::load_by_ids(conn, &ids).await?;
                for block in blocks.iter_mut() {
                    block.infrastructure_provider =
                        providers.get(&block.infrastructure_provider_id).cloned();
                }
            }
            IpBlockRelation::Tenant => {
                let ids = distinct_ids(blocks.iter().filter_map(|b| b.tenant_id));
                let tenants = tenant::load_by_ids(conn, &ids).await?;
                for block in blocks.iter_mut() {
                    block.tenant = block.tenant_id.and_then(|id| tenants.get(&id)).cloned();
                }
            }
        }
    }
    Ok(())
}

async fn fetch_one(
    conn: &mut PgConnection,
    id: Uuid,
    relations: &[IpBlockRelation],
) -> Result<IpBlock> {
    let row = sqlx::query_as::<_, IpBlockRow>(
        "SELECT * FROM ip_block WHERE id = $1 AND deleted IS NULL",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ForgeError::database(e, format!("Failed to fetch IP block {}", id)))?
    .ok_or_else(|| ForgeError::not_found("IPBlock", id))?;

    let mut blocks = [IpBlock::try_from(row)?];
    attach_relations(conn, &mut blocks, relations).await?;
    let [block] = blocks;
    Ok(block)
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &IpBlockFilter) {
    push_opt_uuids(qb, "ipb.id", &filter.ids);
    push_opt_strings(qb, "ipb.name", &filter.names);
    push_opt_uuids(qb, "ipb.site_id", &filter.site_ids);
    push_opt_uuids(qb, "ipb.infrastructure_provider_id", &filter.infrastructure_provider_ids);
    push_opt_uuids(qb, "ipb.tenant_id", &filter.tenant_ids);
    push_opt_strings(qb, "ipb.routing_type", &filter.routing_types);
    push_opt_strings(qb, "ipb.prefix", &filter.prefixes);
    push_opt_i32s(qb, "ipb.prefix_length", &filter.prefix_lengths);
    push_opt_strings(qb, "ipb.protocol_version", &filter.protocol_versions);
    if let Some(full_grant) = filter.full_grant {
        push_eq(qb, "ipb.full_grant", full_grant);
    }
    push_opt_strings(qb, "ipb.status", &filter.statuses.as_deref().map(status_strings));
    if filter.exclude_derived {
        qb.push(" AND ipb.tenant_id IS NULL");
    }
    push_search(
        qb,
        filter.search_query.as_deref(),
        &["ipb.name", "ipb.description", "ipb.status"],
        &["ipb.name", "ipb.description", "ipb.status"],
    );
}

#[async_trait]
impl IpBlockRepository for SqlxIpBlockRepository {
    #[instrument(skip(self, tx, request), fields(name = %request.name, prefix = %request.prefix), name = "db_create_ip_block")]
    async fn create(&self, tx: Option<&mut Tx>, request: CreateIpBlockRequest) -> Result<IpBlock> {
        let mut conn = acquire(&self.pool, tx).await?;

        let row = sqlx::query_as::<_, IpBlockRow>(
            "INSERT INTO ip_block (id, name, description, site_id, infrastructure_provider_id, \
             tenant_id, routing_type, prefix, prefix_length, protocol_version, full_grant, status, \
             created_by, created, updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&request.name)
        .bind(&request.description)
        .bind(request.site_id)
        .bind(request.infrastructure_provider_id)
        .bind(request.tenant_id)
        .bind(&request.routing_type)
        .bind(&request.prefix)
        .bind(request.prefix_length)
        .bind(&request.protocol_version)
        .bind(request.full_grant)
        .bind(request.status.as_str())
        .bind(request.created_by)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create IP block"))?;

        row.try_into()
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_ip_block_by_id")]
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[IpBlockRelation],
    ) -> Result<IpBlock> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id, relations).await
    }

    #[instrument(skip(self, tx, filter), fields(offset = ?page.offset, limit = ?page.limit), name = "db_get_all_ip_blocks")]
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &IpBlockFilter,
        page: &PageInput,
        relations: &[IpBlockRelation],
    ) -> Result<(Vec<IpBlock>, i64)> {
        filter.validate()?;
        let paginator =
            Paginator::new(page, OrderBy::default_for("created"), IP_BLOCK_ORDER_FIELDS, "ipb.id")?;
        let mut conn = acquire(&self.pool, tx).await?;

        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM ip_block ipb WHERE ipb.deleted IS NULL",
        );
        push_filter(&mut count_qb, filter);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to count IP blocks"))?;

        let mut qb =
            QueryBuilder::<Postgres>::new("SELECT ipb.* FROM ip_block ipb WHERE ipb.deleted IS NULL");
        push_filter(&mut qb, filter);
        paginator.push_order_and_limit(&mut qb);
        let rows = qb
            .build_query_as::<IpBlockRow>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to list IP blocks"))?;

        let mut blocks = rows.into_iter().map(IpBlock::try_from).collect::<Result<Vec<_>>>()?;
        attach_relations(&mut conn, &mut blocks, relations).await?;
        Ok((blocks, total))
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_update_ip_block")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateIpBlockRequest,
    ) -> Result<IpBlock> {
        let mut conn = acquire(&self.pool, tx).await?;

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE ip_block SET ");
        let mut set = qb.separated(", ");
        let mut changed = false;
        if let Some(v) = request.name {
            set.push("name = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.description {
            set.push("description = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.tenant_id {
            set.push("tenant_id = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.routing_type {
            set.push("routing_type = ").push_bind_unseparated(v);
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
        if let Some(v) = request.protocol_version {
            set.push("protocol_version = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.full_grant {
            set.push("full_grant = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.status {
            set.push("status = ").push_bind_unseparated(v.as_str());
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
            .map_err(|e| ForgeError::database(e, format!("Failed to update IP block {}", id)))?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("IPBlock", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_clear_ip_block")]
    async fn clear(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: ClearIpBlockRequest,
    ) -> Result<IpBlock> {
        let mut conn = acquire(&self.pool, tx).await?;

        let columns = [
            (request.description, "description = NULL"),
            (request.tenant_id, "tenant_id = NULL"),
        ];

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE ip_block SET ");
        let mut set = qb.separated(", ");
        let mut changed = false;
        for (clear, assignment) in columns {
            if clear {
                set.push(assignment);
                changed = true;
            }
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
            .map_err(|e| ForgeError::database(e, format!("Failed to clear IP block {}", id)))?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("IPBlock", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_delete_ip_block")]
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query("UPDATE ip_block SET deleted = $2, updated = $2 WHERE id = $1 AND deleted IS NULL")
            .bind(id)
            .bind(Utc::now())
            .execute(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, format!("Failed to delete IP block {}", id)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_helpers::lazy_pool;

    #[tokio::test]
    async fn test_exclude_derived_with_tenants_is_rejected() {
        let repo = SqlxIpBlockRepository::new(lazy_pool());
        let filter = IpBlockFilter {
            exclude_derived: true,
            tenant_ids: Some(vec![Uuid::new_v4()]),
            ..Default::default()
        };
        let err = repo.get_all(None, &filter, &PageInput::default(), &[]).await.unwrap_err();
        assert!(matches!(
            err,
            ForgeError::Validation { field: Some(ref f), .. } if f == "exclude_derived"
        ));
    }

    #[test]
    fn test_empty_prefix_lengths_match_nothing() {
        let filter = IpBlockFilter { prefix_lengths: Some(vec![]), ..Default::default() };
        let mut qb = QueryBuilder::<Postgres>::new("SELECT ipb.* FROM ip_block ipb WHERE TRUE");
        push_filter(&mut qb, &filter);
        assert!(qb.sql().ends_with(" AND FALSE"));
    }

    #[cfg(feature = "postgres_tests")]
    mod postgres {
        use super::*;
        use crate::storage::test_helpers::{
            TestDatabase, TEST_PROVIDER_ID, TEST_SITE_ID, TEST_TENANT_ID, TEST_USER_ID,
        };

        fn request(name: &str, prefix: &str, tenant_id: Option<Uuid>) -> CreateIpBlockRequest {
            CreateIpBlockRequest {
                name: name.to_string(),
                description: Some(format!("{} block", name)),
                site_id: TEST_SITE_ID,
                infrastructure_provider_id: TEST_PROVIDER_ID,
                tenant_id,
                routing_type: "DatacenterOnly".to_string(),
                prefix: prefix.to_string(),
                prefix_length: 16,
                protocol_version: "IPv4".to_string(),
                full_grant: false,
                status: IpBlockStatus::Pending,
                created_by: Some(TEST_USER_ID),
            }
        }

        #[tokio::test]
        async fn test_provider_and_derived_blocks() {
            let db = TestDatabase::new("ip_block_crud").await;
            let repo = SqlxIpBlockRepository::new(db.pool.clone());

            let provider = repo.create(None, request("provider", "10.0.0.0", None)).await.unwrap();
            let derived = repo
                .create(None, request("tenant", "10.0.1.0", Some(TEST_TENANT_ID)))
                .await
                .unwrap();

            let only_provider = IpBlockFilter { exclude_derived: true, ..Default::default() };
            let (found, total) =
                repo.get_all(None, &only_provider, &PageInput::default(), &[]).await.unwrap();
            assert_eq!(total, 1);
            assert_eq!(found[0].id, provider.id);

            let loaded = repo
                .get_by_id(None, derived.id, &[IpBlockRelation::Tenant, IpBlockRelation::Site])
                .await
                .unwrap();
            assert_eq!(loaded.tenant.as_ref().map(|t| t.id), Some(TEST_TENANT_ID));
            assert_eq!(loaded.site.as_ref().map(|s| s.id), Some(TEST_SITE_ID));

            let by_length = IpBlockFilter {
                prefix_lengths: Some(vec![16]),
                prefixes: Some(vec!["10.0.1.0".to_string()]),
                ..Default::default()
            };
            let (found, _) = repo.get_all(None, &by_length, &PageInput::default(), &[]).await.unwrap();
            assert_eq!(found.len(), 1);
            assert_eq!(found[0].id, derived.id);

            let cleared = repo
                .clear(None, derived.id, ClearIpBlockRequest { tenant_id: true, ..Default::default() })
                .await
                .unwrap();
            assert!(cleared.tenant_id.is_none());

            let ready = repo
                .update(
                    None,
                    provider.id,
                    UpdateIpBlockRequest { status: Some(IpBlockStatus::Ready), ..Default::default() },
                )
                .await
                .unwrap();
            assert_eq!(ready.status, IpBlockStatus::Ready);

            repo.delete(None, provider.id).await.unwrap();
            assert!(repo.get_by_id(None, provider.id, &[]).await.unwrap_err().is_not_found());
        }
    }
}
