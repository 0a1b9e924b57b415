//! Allocation repository
//!
//! An allocation grants a tenant a share of a provider's capacity at one site. The
//! share itself is described by the allocation's constraints; see
//! [`allocation_constraint`](super::allocation_constraint).

use super::distinct_ids;
use super::infrastructure_provider::{self, InfrastructureProvider};
use super::site::{self, Site};
use super::tenant::{self, Tenant};
use crate::domain::{
    parse_status, status_strings, AllocationConstraintType, AllocationResourceType,
    AllocationStatus,
};
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

/// Orderable fields. `site_name` and `tenant_org_display_name` come from joins in `get_all`.
pub const ALLOCATION_ORDER_FIELDS: &[OrderField] = &[
    OrderField::new("name", "a.name"),
    OrderField::new("status", "a.status"),
    OrderField::new("created", "a.created"),
    OrderField::new("updated", "a.updated"),
    OrderField::new("site_name", "st.name"),
    OrderField::new("tenant_org_display_name", "tn.org_display_name"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationRelation {
    InfrastructureProvider,
    Tenant,
    Site,
}

/// Database row structure for allocations
#[derive(Debug, Clone, FromRow)]
struct AllocationRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    infrastructure_provider_id: Uuid,
    tenant_id: Uuid,
    site_id: Uuid,
    status: String,
    created_by: Uuid,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub infrastructure_provider_id: Uuid,
    pub infrastructure_provider: Option<InfrastructureProvider>,
    pub tenant_id: Uuid,
    pub tenant: Option<Tenant>,
    pub site_id: Uuid,
    pub site: Option<Site>,
    pub status: AllocationStatus,
    pub created_by: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl TryFrom<AllocationRow> for Allocation {
    type Error = ForgeError;

    fn try_from(row: AllocationRow) -> Result<Self> {
        Ok(Self {
            status: parse_status(&row.status)?,
            id: row.id,
            name: row.name,
            description: row.description,
            infrastructure_provider_id: row.infrastructure_provider_id,
            infrastructure_provider: None,
            tenant_id: row.tenant_id,
            tenant: None,
            site_id: row.site_id,
            site: None,
            created_by: row.created_by,
            created: row.created,
            updated: row.updated,
            deleted: row.deleted,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAllocationRequest {
    pub name: String,
    pub description: Option<String>,
    pub infrastructure_provider_id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub status: AllocationStatus,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateAllocationRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub infrastructure_provider_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub site_id: Option<Uuid>,
    pub status: Option<AllocationStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClearAllocationRequest {
    pub description: bool,
}

/// Constraint filters match allocations holding at least one live constraint with
/// the given values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocationFilter {
    pub ids: Option<Vec<Uuid>>,
    pub names: Option<Vec<String>>,
    pub infrastructure_provider_ids: Option<Vec<Uuid>>,
    pub tenant_ids: Option<Vec<Uuid>>,
    pub site_ids: Option<Vec<Uuid>>,
    pub statuses: Option<Vec<AllocationStatus>>,
    pub resource_types: Option<Vec<AllocationResourceType>>,
    pub resource_type_ids: Option<Vec<Uuid>>,
    pub constraint_types: Option<Vec<AllocationConstraintType>>,
    pub search_query: Option<String>,
}

impl AllocationFilter {
    fn filters_constraints(&self) -> bool {
        self.resource_types.is_some()
            || self.resource_type_ids.is_some()
            || self.constraint_types.is_some()
    }
}

#[async_trait]
pub trait AllocationRepository: Send + Sync {
    async fn create(&self, tx: Option<&mut Tx>, request: CreateAllocationRequest)
        -> Result<Allocation>;
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[AllocationRelation],
    ) -> Result<Allocation>;
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &AllocationFilter,
        page: &PageInput,
        relations: &[AllocationRelation],
    ) -> Result<(Vec<Allocation>, i64)>;
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateAllocationRequest,
    ) -> Result<Allocation>;
    async fn clear(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: ClearAllocationRequest,
    ) -> Result<Allocation>;
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()>;
}

pub struct SqlxAllocationRepository {
    pool: DbPool,
}

impl SqlxAllocationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Load allocations by id, including soft deleted ones
pub(crate) async fn load_by_ids(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, Allocation>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query_as::<_, AllocationRow>("SELECT * FROM allocation WHERE id = ANY($1)")
        .bind(ids)
        .fetch_all(conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to load allocations"))?;

    rows.into_iter().map(|row| Allocation::try_from(row).map(|a| (a.id, a))).collect()
}

async fn attach_relations(
    conn: &mut PgConnection,
    allocations: &mut [Allocation],
    relations: &[AllocationRelation],
) -> Result<()> {
    for relation in relations {
        match relation {
            AllocationRelation::InfrastructureProvider => {
                let ids = distinct_ids(allocations.iter().map(|a| a.infrastructure_provider_id));
                let providers = infrastructure_provider::load_by_ids(conn, &ids).await?;
                for allocation in allocations.iter_mut() {
                    allocation.infrastructure_provider =
                        providers.get(&allocation.infrastructure_provider_id).cloned();
                }
            }
            AllocationRelation::Tenant => {
                let ids = distinct_ids(allocations.iter().map(|a| a.tenant_id));
                let tenants = tenant::load_by_ids(conn, &ids).await?;
                for allocation in allocations.iter_mut() {
                    allocation.tenant = tenants.get(&allocation.tenant_id).cloned();
                }
            }
            AllocationRelation::Site => {
                let ids = distinct_ids(allocations.iter().map(|a| a.site_id));
                let sites = site::load_by_ids(conn, &ids).await?;
                for allocation in allocations.iter_mut() {
                    allocation.site = sites.get(&allocation.site_id).cloned();
                }
            }
        }
    }
    Ok(())
}

async fn fetch_one(
    conn: &mut PgConnection,
    id: Uuid,
    relations: &[AllocationRelation],
) -> Result<Allocation> {
    let row = sqlx::query_as::<_, AllocationRow>(
        "SELECT * FROM allocation WHERE id = $1 AND deleted IS NULL",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ForgeError::database(e, format!("Failed to fetch allocation {}", id)))?
    .ok_or_else(|| ForgeError::not_found("Allocation", id))?;

    let mut allocations = [Allocation::try_from(row)?];
    attach_relations(conn, &mut allocations, relations).await?;
    let [allocation] = allocations;
    Ok(allocation)
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &AllocationFilter) {
    push_opt_uuids(qb, "a.id", &filter.ids);
    push_opt_strings(qb, "a.name", &filter.names);
    push_opt_uuids(qb, "a.infrastructure_provider_id", &filter.infrastructure_provider_ids);
    push_opt_uuids(qb, "a.tenant_id", &filter.tenant_ids);
    push_opt_uuids(qb, "a.site_id", &filter.site_ids);
    push_opt_strings(qb, "a.status", &filter.statuses.as_deref().map(status_strings));
    if filter.filters_constraints() {
        qb.push(
            " AND EXISTS (SELECT 1 FROM allocation_constraint ac \
             WHERE ac.allocation_id = a.id AND ac.deleted IS NULL",
        );
        push_opt_strings(qb, "ac.resource_type", &filter.resource_types.as_deref().map(status_strings));
        push_opt_uuids(qb, "ac.resource_type_id", &filter.resource_type_ids);
        push_opt_strings(
            qb,
            "ac.constraint_type",
            &filter.constraint_types.as_deref().map(status_strings),
        );
        qb.push(")");
    }
    push_search(
        qb,
        filter.search_query.as_deref(),
        &["a.name", "a.description", "a.status"],
        &["a.name", "a.description", "a.status"],
    );
}

#[async_trait]
impl AllocationRepository for SqlxAllocationRepository {
    #[instrument(skip(self, tx, request), fields(name = %request.name, tenant_id = %request.tenant_id), name = "db_create_allocation")]
    async fn create(
        &self,
        tx: Option<&mut Tx>,
        request: CreateAllocationRequest,
    ) -> Result<Allocation> {
        let mut conn = acquire(&self.pool, tx).await?;

        let row = sqlx::query_as::<_, AllocationRow>(
            "INSERT INTO allocation (id, name, description, infrastructure_provider_id, \
             tenant_id, site_id, status, created_by, created, updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&request.name)
        .bind(&request.description)
        .bind(request.infrastructure_provider_id)
        .bind(request.tenant_id)
        .bind(request.site_id)
        .bind(request.status.as_str())
        .bind(request.created_by)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, "Failed to create allocation"))?;

        row.try_into()
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_get_allocation_by_id")]
    async fn get_by_id(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        relations: &[AllocationRelation],
    ) -> Result<Allocation> {
        let mut conn = acquire(&self.pool, tx).await?;
        fetch_one(&mut conn, id, relations).await
    }

    #[instrument(skip(self, tx, filter), fields(offset = ?page.offset, limit = ?page.limit), name = "db_get_all_allocations")]
    async fn get_all(
        &self,
        tx: Option<&mut Tx>,
        filter: &AllocationFilter,
        page: &PageInput,
        relations: &[AllocationRelation],
    ) -> Result<(Vec<Allocation>, i64)> {
        let paginator =
            Paginator::new(page, OrderBy::default_for("created"), ALLOCATION_ORDER_FIELDS, "a.id")?;
        let mut conn = acquire(&self.pool, tx).await?;

        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM allocation a WHERE a.deleted IS NULL",
        );
        push_filter(&mut count_qb, filter);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to count allocations"))?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT a.* FROM allocation a \
             LEFT JOIN site st ON st.id = a.site_id \
             LEFT JOIN tenant tn ON tn.id = a.tenant_id \
             WHERE a.deleted IS NULL",
        );
        push_filter(&mut qb, filter);
        paginator.push_order_and_limit(&mut qb);
        let rows = qb
            .build_query_as::<AllocationRow>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ForgeError::database(e, "Failed to list allocations"))?;

        let mut allocations = rows.into_iter().map(Allocation::try_from).collect::<Result<Vec<_>>>()?;
        attach_relations(&mut conn, &mut allocations, relations).await?;
        Ok((allocations, total))
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_update_allocation")]
    async fn update(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: UpdateAllocationRequest,
    ) -> Result<Allocation> {
        let mut conn = acquire(&self.pool, tx).await?;

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE allocation SET ");
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
        if let Some(v) = request.infrastructure_provider_id {
            set.push("infrastructure_provider_id = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.tenant_id {
            set.push("tenant_id = ").push_bind_unseparated(v);
            changed = true;
        }
        if let Some(v) = request.site_id {
            set.push("site_id = ").push_bind_unseparated(v);
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
            .map_err(|e| ForgeError::database(e, format!("Failed to update allocation {}", id)))?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("Allocation", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx, request), fields(id = %id), name = "db_clear_allocation")]
    async fn clear(
        &self,
        tx: Option<&mut Tx>,
        id: Uuid,
        request: ClearAllocationRequest,
    ) -> Result<Allocation> {
        let mut conn = acquire(&self.pool, tx).await?;

        if !request.description {
            return fetch_one(&mut conn, id, &[]).await;
        }

        let result = sqlx::query(
            "UPDATE allocation SET description = NULL, updated = $2 \
             WHERE id = $1 AND deleted IS NULL",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to clear allocation {}", id)))?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::not_found("Allocation", id));
        }

        fetch_one(&mut conn, id, &[]).await
    }

    #[instrument(skip(self, tx), fields(id = %id), name = "db_delete_allocation")]
    async fn delete(&self, tx: Option<&mut Tx>, id: Uuid) -> Result<()> {
        let mut conn = acquire(&self.pool, tx).await?;

        sqlx::query(
            "UPDATE allocation SET deleted = $2, updated = $2 WHERE id = $1 AND deleted IS NULL",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| ForgeError::database(e, format!("Failed to delete allocation {}", id)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_filter_adds_exists_clause() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT a.* FROM allocation a WHERE TRUE");
        push_filter(&mut qb, &AllocationFilter::default());
        assert!(!qb.sql().contains("allocation_constraint"));

        let filter = AllocationFilter {
            resource_types: Some(vec![AllocationResourceType::InstanceType]),
            ..Default::default()
        };
        let mut qb = QueryBuilder::<Postgres>::new("SELECT a.* FROM allocation a WHERE TRUE");
        push_filter(&mut qb, &filter);
        let sql = qb.sql();
        assert!(sql.contains("EXISTS (SELECT 1 FROM allocation_constraint ac"));
        assert!(sql.contains("ac.resource_type = $1"));
        assert!(sql.ends_with(")"));
    }

    #[cfg(feature = "postgres_tests")]
    mod postgres {
        use super::*;
        use crate::storage::test_helpers::{
            TestDatabase, TEST_PROVIDER_ID, TEST_SITE_ID, TEST_TENANT_ID, TEST_USER_ID,
        };

        fn request(name: &str) -> CreateAllocationRequest {
            CreateAllocationRequest {
                name: name.to_string(),
                description: Some("reserved capacity".to_string()),
                infrastructure_provider_id: TEST_PROVIDER_ID,
                tenant_id: TEST_TENANT_ID,
                site_id: TEST_SITE_ID,
                status: AllocationStatus::Pending,
                created_by: TEST_USER_ID,
            }
        }

        #[tokio::test]
        async fn test_crud_and_clear() {
            let db = TestDatabase::new("allocation_crud").await;
            let repo = SqlxAllocationRepository::new(db.pool.clone());

            let created = repo.create(None, request("gpu-pool")).await.unwrap();
            let loaded = repo
                .get_by_id(
                    None,
                    created.id,
                    &[AllocationRelation::Tenant, AllocationRelation::Site],
                )
                .await
                .unwrap();
            assert_eq!(loaded.tenant.as_ref().map(|t| t.id), Some(TEST_TENANT_ID));
            assert_eq!(loaded.site.as_ref().map(|s| s.id), Some(TEST_SITE_ID));
            assert!(loaded.infrastructure_provider.is_none());

            let registered = repo
                .update(
                    None,
                    created.id,
                    UpdateAllocationRequest {
                        status: Some(AllocationStatus::Registered),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            assert_eq!(registered.status, AllocationStatus::Registered);

            let cleared = repo
                .clear(None, created.id, ClearAllocationRequest { description: true })
                .await
                .unwrap();
            assert!(cleared.description.is_none());

            let search = AllocationFilter {
                search_query: Some("gpu".to_string()),
                ..Default::default()
            };
            let (found, total) =
                repo.get_all(None, &search, &PageInput::default(), &[]).await.unwrap();
            assert_eq!(total, 1);
            assert_eq!(found[0].id, created.id);

            repo.delete(None, created.id).await.unwrap();
            let err = repo
                .clear(None, created.id, ClearAllocationRequest { description: true })
                .await
                .unwrap_err();
            assert!(err.is_not_found());
        }

        #[tokio::test]
        async fn test_order_by_joined_site_name() {
            let db = TestDatabase::new("allocation_order").await;
            let repo = SqlxAllocationRepository::new(db.pool.clone());

            repo.create(None, request("b")).await.unwrap();
            repo.create(None, request("a")).await.unwrap();

            let page = PageInput::default().ordered_by(OrderBy::default_for("site_name"));
            let (found, total) = repo.get_all(None, &Default::default(), &page, &[]).await.unwrap();
            assert_eq!(total, 2);
            assert_eq!(found.len(), 2);
        }
    }
}
